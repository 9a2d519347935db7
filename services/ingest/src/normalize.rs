//! Cell value normalization.
//!
//! Source files mix currency strings, percentage notation, "too few samples"
//! markers and plain blanks inside the same column. Everything here is a pure
//! function: an unparsable cell becomes absence, never an error.

use serde::{Deserialize, Serialize};

use crate::table::Cell;

/// Symbolic marker substituted for a numeric value when the source data
/// explicitly withholds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExceptionCode {
    TooFewSamples,
    ScoreUnder10,
    ScoreOver90,
}

impl ExceptionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExceptionCode::TooFewSamples => "TOO_FEW_SAMPLES",
            ExceptionCode::ScoreUnder10 => "SCORE_UNDER_10",
            ExceptionCode::ScoreOver90 => "SCORE_OVER_90",
        }
    }
}

/// How a measure column is typed, aggregated and rounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Student/incident counts. Additive, truncated to integers.
    Count,
    /// Whole-dollar amounts. Additive, truncated to integers.
    Currency,
    /// Percentages. Averaged across merge contributors, two decimal places.
    Percentage,
    /// Dollars-per-pupil rates. Averaged, two decimal places.
    PerPupil,
    /// Scaled scores and growth percentiles. Averaged, two decimal places.
    Score,
    /// A "low-high" student count range; expands into two Count columns.
    Range,
}

impl FieldKind {
    /// Additive kinds sum across merge contributors; the rest take the mean.
    pub fn additive(&self) -> bool {
        matches!(self, FieldKind::Count | FieldKind::Currency | FieldKind::Range)
    }

    /// Final rounding applied just before a value becomes a statement column.
    pub fn finish(&self, value: f64) -> f64 {
        match self {
            FieldKind::Count | FieldKind::Currency | FieldKind::Range => value.trunc(),
            FieldKind::Percentage | FieldKind::PerPupil | FieldKind::Score => {
                (value * 100.0).round() / 100.0
            }
        }
    }
}

/// A normalized cell: a number, an exception code, or neither (absence).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NormalizedValue {
    pub number: Option<f64>,
    pub exception: Option<ExceptionCode>,
}

impl NormalizedValue {
    pub fn number(value: f64) -> Self {
        NormalizedValue {
            number: Some(value),
            exception: None,
        }
    }

    pub fn exception(code: ExceptionCode) -> Self {
        NormalizedValue {
            number: None,
            exception: Some(code),
        }
    }

    pub fn is_absent(&self) -> bool {
        self.number.is_none() && self.exception.is_none()
    }
}

/// Normalize one raw cell into a typed value or sentinel code.
///
/// Blank, "NaN" and "-" are absence. A `*` anywhere marks a suppressed
/// too-few-samples value; `<`/`10` and `>`/`90` mark the clamped score bands.
/// Everything else is stripped down to digits and a decimal point ($, commas,
/// percent signs and whitespace all go) and parsed; parse failure is absence.
pub fn normalize_numeric(cell: &Cell) -> NormalizedValue {
    let text = match cell {
        Cell::Empty => return NormalizedValue::default(),
        Cell::Number(n) => {
            if n.is_nan() {
                return NormalizedValue::default();
            }
            return NormalizedValue::number(*n);
        }
        Cell::Text(s) => s.trim(),
    };

    if text.is_empty() || text == "-" || text.eq_ignore_ascii_case("nan") {
        return NormalizedValue::default();
    }
    if text.contains('*') {
        return NormalizedValue::exception(ExceptionCode::TooFewSamples);
    }
    if text.contains('<') && text.contains("10") {
        return NormalizedValue::exception(ExceptionCode::ScoreUnder10);
    }
    if text.contains('>') && text.contains("90") {
        return NormalizedValue::exception(ExceptionCode::ScoreOver90);
    }

    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if cleaned.is_empty() {
        return NormalizedValue::default();
    }
    match cleaned.parse::<f64>() {
        Ok(value) => NormalizedValue::number(value),
        Err(_) => NormalizedValue::default(),
    }
}

/// Parse a "low-high" student range, or a single integer duplicated into both
/// ends. `denylist` holds known-corrupt source literals (the 2019 exports
/// contain a date accidentally serialized as 43753) that map to absence.
pub fn normalize_range(cell: &Cell, denylist: &[i64]) -> (Option<i64>, Option<i64>) {
    let text = match cell {
        Cell::Empty => return (None, None),
        Cell::Number(n) => {
            if n.is_nan() {
                return (None, None);
            }
            let v = n.trunc() as i64;
            if denylist.contains(&v) {
                return (None, None);
            }
            return (Some(v), Some(v));
        }
        Cell::Text(s) => s.trim(),
    };

    if text.is_empty() || text == "-" {
        return (None, None);
    }

    // Thousands separators first, so "1,234-5,678" splits cleanly.
    let stripped = text.replace(',', "");

    if let Some((low_part, high_part)) = stripped.split_once('-') {
        let low = parse_int(low_part);
        let high = parse_int(high_part);
        if let (Some(low), Some(high)) = (low, high) {
            return (Some(low), Some(high));
        }
    }

    match parse_int(&stripped) {
        Some(v) if denylist.contains(&v) => (None, None),
        Some(v) => (Some(v), Some(v)),
        None => (None, None),
    }
}

fn parse_int(text: &str) -> Option<i64> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().map(|v| v.trunc() as i64)
}
