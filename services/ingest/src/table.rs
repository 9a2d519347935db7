//! Tabular source interface.
//!
//! Yields rows as cells regardless of the underlying file format: workbook
//! sheets via calamine, delimited text via csv. The state's CSV exports are
//! frequently Windows-1252 rather than UTF-8, so decoding falls back instead
//! of failing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader};

/// One raw spreadsheet cell. Text is kept verbatim (trimmed); numbers keep
/// whatever type the workbook stored.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
}

const EMPTY_CELL: Cell = Cell::Empty;

impl Cell {
    pub fn is_empty(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.trim().is_empty(),
            Cell::Number(_) => false,
        }
    }

    /// Trimmed text content, if this is a non-blank text cell.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => {
                let t = s.trim();
                if t.is_empty() {
                    None
                } else {
                    Some(t)
                }
            }
            _ => None,
        }
    }

    /// Display form used for labels and provenance.
    pub fn display(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Text(s) => s.trim().to_string(),
            Cell::Number(n) => {
                if n.fract() == 0.0 {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
        }
    }
}

/// A fully loaded source table with provenance.
#[derive(Debug)]
pub struct Table {
    pub path: PathBuf,
    pub year: i32,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn cell(&self, row: usize, col: usize) -> &Cell {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .unwrap_or(&EMPTY_CELL)
    }
}

/// Read a delimited text file. Decodes UTF-8 first and falls back to
/// Windows-1252 when the bytes are not valid UTF-8.
pub fn read_csv_table(path: &Path, year: i32) -> Result<Table> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;

    let (decoded, _, had_errors) = encoding_rs::UTF_8.decode(&bytes);
    let content = if had_errors {
        let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(&bytes);
        decoded.into_owned()
    } else {
        decoded.into_owned()
    };
    let content = content.strip_prefix('\u{feff}').unwrap_or(&content);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("parsing {}", path.display()))?;
        let row: Vec<Cell> = record
            .iter()
            .map(|field| {
                if field.is_empty() {
                    Cell::Empty
                } else {
                    Cell::Text(field.to_string())
                }
            })
            .collect();
        rows.push(row);
    }

    Ok(Table {
        path: path.to_path_buf(),
        year,
        rows,
    })
}

/// Read one sheet of a workbook (xls/xlsx/ods auto-detected). With a keyword,
/// the first sheet whose name contains it (case-insensitive) is used; without
/// one, the first sheet.
pub fn read_workbook_table(path: &Path, year: i32, sheet_keyword: Option<&str>) -> Result<Table> {
    let mut workbook =
        open_workbook_auto(path).with_context(|| format!("opening {}", path.display()))?;

    let sheet_names = workbook.sheet_names().to_vec();
    if sheet_names.is_empty() {
        anyhow::bail!("{} has no sheets", path.display());
    }

    let sheet_name = match sheet_keyword {
        Some(keyword) => {
            let lower = keyword.to_lowercase();
            sheet_names
                .iter()
                .find(|name| name.to_lowercase().contains(&lower))
                .with_context(|| {
                    format!("{}: no sheet name contains '{keyword}'", path.display())
                })?
                .clone()
        }
        None => sheet_names[0].clone(),
    };

    let range = workbook
        .worksheet_range(&sheet_name)
        .with_context(|| format!("reading sheet '{sheet_name}' of {}", path.display()))?;

    let rows = range
        .rows()
        .map(|row| row.iter().map(cell_from_data).collect())
        .collect();

    Ok(Table {
        path: path.to_path_buf(),
        year,
        rows,
    })
}

fn cell_from_data(data: &Data) -> Cell {
    match data {
        Data::Empty => Cell::Empty,
        Data::String(s) => {
            if s.trim().is_empty() {
                Cell::Empty
            } else {
                Cell::Text(s.clone())
            }
        }
        Data::Float(f) => Cell::Number(*f),
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Bool(b) => Cell::Text(b.to_string()),
        Data::DateTime(dt) => Cell::Number(dt.as_f64()),
        other => Cell::Text(format!("{other}")),
    }
}

/// Column-label lookup built from a located header row. Blank header cells
/// become positional `column_{j}` labels; a duplicated label keeps its first
/// position.
#[derive(Debug)]
pub struct HeaderMap {
    labels: Vec<String>,
    index: HashMap<String, usize>,
}

impl HeaderMap {
    pub fn from_row(row: &[Cell]) -> Self {
        let mut labels = Vec::with_capacity(row.len());
        let mut index = HashMap::new();
        for (j, cell) in row.iter().enumerate() {
            let label = match cell.as_text() {
                Some(text) => text.to_string(),
                None => format!("column_{j}"),
            };
            index.entry(label.clone()).or_insert(j);
            labels.push(label);
        }
        HeaderMap { labels, index }
    }

    pub fn position(&self, label: &str) -> Option<usize> {
        self.index.get(label).copied()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}

/// A borrowed view over one data row, with provenance.
#[derive(Debug, Clone, Copy)]
pub struct SourceRow<'a> {
    pub cells: &'a [Cell],
    pub header: &'a HeaderMap,
    pub row_idx: usize,
    pub year: i32,
}

impl<'a> SourceRow<'a> {
    /// Cell under a header label; a missing column reads as empty.
    pub fn get(&self, label: &str) -> &'a Cell {
        self.header
            .position(label)
            .and_then(|j| self.cells.get(j))
            .unwrap_or(&EMPTY_CELL)
    }

    /// Trimmed text under a label, if present and non-blank.
    pub fn text(&self, label: &str) -> Option<&'a str> {
        self.get(label).as_text()
    }
}
