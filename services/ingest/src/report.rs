//! Run reporting.
//!
//! Names that failed to resolve are collected per kind and printed grouped
//! by name with the years they appeared in, so a maintainer can add an alias
//! entry or a missing reference row and re-run.

use std::collections::{BTreeMap, BTreeSet};

/// Unresolved names, grouped kind -> name -> years seen.
#[derive(Debug, Default)]
pub struct UnresolvedReport {
    entries: BTreeMap<String, BTreeMap<String, BTreeSet<i32>>>,
}

impl UnresolvedReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: &str, name: &str, year: i32) {
        self.entries
            .entry(kind.to_string())
            .or_default()
            .entry(name.trim().to_string())
            .or_default()
            .insert(year);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct unresolved names across all kinds.
    pub fn total(&self) -> usize {
        self.entries.values().map(|names| names.len()).sum()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (kind, names) in &self.entries {
            out.push_str(&format!("unmatched {kind}s:\n"));
            for (name, years) in names {
                let years: Vec<String> = years.iter().map(|y| y.to_string()).collect();
                out.push_str(&format!("  {} ({})\n", name, years.join(", ")));
            }
        }
        out
    }
}

/// Counters accumulated while a dataset is processed.
#[derive(Debug, Default)]
pub struct RunStats {
    pub files_read: usize,
    pub files_skipped: usize,
    pub rows_seen: usize,
    pub rows_skipped: usize,
    pub facts_built: usize,
    pub merged_facts: usize,
    pub subgroups_created: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_groups_names_and_years() {
        let mut report = UnresolvedReport::new();
        report.record("school", "Lost Academy", 2018);
        report.record("school", "Lost Academy", 2019);
        report.record("school", "Lost Academy", 2018);
        report.record("district", "Nowhere", 2019);

        assert_eq!(report.total(), 2);
        let rendered = report.render();
        assert!(rendered.contains("unmatched schools:"));
        assert!(rendered.contains("Lost Academy (2018, 2019)"));
        assert!(rendered.contains("unmatched districts:"));
        assert!(rendered.contains("Nowhere (2019)"));
    }

    #[test]
    fn test_empty_report() {
        let report = UnresolvedReport::new();
        assert!(report.is_empty());
        assert_eq!(report.total(), 0);
        assert_eq!(report.render(), "");
    }
}
