//! Header and summary-row location inside loosely structured tables.
//!
//! Header rows drift between years and exports. A row qualifies as the header
//! when at least two configured anchor cells match at their expected column
//! positions; if nothing satisfies that, a weaker single-anchor pass runs.
//! Both searches return `None` rather than erroring: callers skip the file
//! and move on.

use serde::Deserialize;

use crate::table::Table;

/// A known column-label substring expected at a specific column position.
#[derive(Debug, Clone, Deserialize)]
pub struct Anchor {
    pub column: usize,
    pub contains: String,
}

/// Scan at most the first `scan_limit` rows for the header row.
pub fn locate_header(table: &Table, anchors: &[Anchor], scan_limit: usize) -> Option<usize> {
    let limit = scan_limit.min(table.rows.len());

    for i in 0..limit {
        if anchor_hits(table, i, anchors) >= 2 {
            return Some(i);
        }
    }

    tracing::debug!(
        path = %table.path.display(),
        "no row matched two anchors; trying single-anchor fallback"
    );
    for i in 0..limit {
        if anchor_hits(table, i, anchors) >= 1 {
            tracing::info!(
                path = %table.path.display(),
                row = i,
                "header located via single-anchor fallback"
            );
            return Some(i);
        }
    }

    None
}

fn anchor_hits(table: &Table, row: usize, anchors: &[Anchor]) -> usize {
    anchors
        .iter()
        .filter(|anchor| {
            table
                .cell(row, anchor.column)
                .as_text()
                .map(|text| {
                    text.to_lowercase()
                        .contains(&anchor.contains.to_lowercase())
                })
                .unwrap_or(false)
        })
        .count()
}

/// Find a marked aggregate row (e.g. a state-average line) by substring match
/// on a designated column, scanning `scan_limit` rows starting at `from`.
pub fn locate_summary_row(
    table: &Table,
    from: usize,
    column: usize,
    marker: &str,
    scan_limit: usize,
) -> Option<usize> {
    let end = (from + scan_limit).min(table.rows.len());
    let marker_lower = marker.to_lowercase();

    (from..end).find(|&i| {
        table
            .cell(i, column)
            .as_text()
            .map(|text| text.to_lowercase().contains(&marker_lower))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Cell;
    use std::path::PathBuf;

    fn table(rows: Vec<Vec<&str>>) -> Table {
        Table {
            path: PathBuf::from("test.csv"),
            year: 2020,
            rows: rows
                .into_iter()
                .map(|row| {
                    row.into_iter()
                        .map(|s| {
                            if s.is_empty() {
                                Cell::Empty
                            } else {
                                Cell::Text(s.to_string())
                            }
                        })
                        .collect()
                })
                .collect(),
        }
    }

    fn anchors() -> Vec<Anchor> {
        vec![
            Anchor {
                column: 0,
                contains: "DIST".into(),
            },
            Anchor {
                column: 3,
                contains: "School District".into(),
            },
        ]
    }

    #[test]
    fn test_locate_header_two_anchor_rule() {
        let t = table(vec![
            vec!["Cost Per Pupil Report", "", "", ""],
            vec!["", "", "", ""],
            vec!["DIST", "", "", "School District Name"],
            vec!["101", "", "", "Berlin"],
        ]);
        assert_eq!(locate_header(&t, &anchors(), 25), Some(2));
    }

    #[test]
    fn test_locate_header_single_anchor_fallback() {
        let t = table(vec![
            vec!["notes", "", "", ""],
            vec!["DIST", "", "", "District Name"], // second anchor absent
            vec!["101", "", "", "Berlin"],
        ]);
        assert_eq!(locate_header(&t, &anchors(), 25), Some(1));
    }

    #[test]
    fn test_locate_header_not_found() {
        let t = table(vec![vec!["a", "b", "c", "d"], vec!["1", "2", "3", "4"]]);
        assert_eq!(locate_header(&t, &anchors(), 25), None);
    }

    #[test]
    fn test_locate_header_respects_scan_limit() {
        let mut rows = vec![vec!["x", "", "", ""]; 30];
        rows.push(vec!["DIST", "", "", "School District"]);
        let t = table(rows);
        assert_eq!(locate_header(&t, &anchors(), 25), None);
    }

    #[test]
    fn test_locate_header_matching_is_case_insensitive() {
        let t = table(vec![vec!["dist", "", "", "school district"]]);
        assert_eq!(locate_header(&t, &anchors(), 25), Some(0));
    }

    #[test]
    fn test_locate_summary_row() {
        let t = table(vec![
            vec!["DIST", "", "", "School District"],
            vec!["101", "", "", "Berlin"],
            vec!["", "", "", "State Average"],
            vec!["102", "", "", "Concord"],
        ]);
        assert_eq!(locate_summary_row(&t, 1, 3, "State Average", 30), Some(2));
    }

    #[test]
    fn test_locate_summary_row_absent() {
        let t = table(vec![vec!["101", "", "", "Berlin"]]);
        assert_eq!(locate_summary_row(&t, 0, 3, "State Average", 30), None);
    }
}
