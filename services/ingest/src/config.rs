//! Dataset configuration.
//!
//! Each dataset (assessment results, cost per pupil, ...) is described in
//! `config/datasets.json`: where its files live, how to find the header,
//! which columns carry names and measures, alias spellings, and which tables
//! the facts target. The pipeline itself is dataset-agnostic.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::locate::Anchor;
use crate::normalize::FieldKind;
use crate::statement::{Level, SqlValue, Statement, TableTargets};
use crate::store::EntityKind;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("dataset '{dataset}': {reason}")]
    Invalid { dataset: String, reason: String },
}

#[derive(Debug, Deserialize)]
pub struct ImportConfig {
    pub version: u32,
    pub datasets: Vec<DatasetConfig>,
}

impl ImportConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        let config: ImportConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: display,
                source,
            })?;
        for dataset in &config.datasets {
            dataset.validate()?;
        }
        Ok(config)
    }

    pub fn dataset(&self, id: &str) -> Option<&DatasetConfig> {
        self.datasets.iter().find(|d| d.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    Csv,
    Workbook,
}

#[derive(Debug, Deserialize)]
pub struct HeaderConfig {
    pub anchors: Vec<Anchor>,
    #[serde(default = "default_header_scan")]
    pub scan_limit: usize,
}

fn default_header_scan() -> usize {
    25
}

/// A marked aggregate row inside the body (e.g. a state-average line).
#[derive(Debug, Deserialize)]
pub struct SummaryRowConfig {
    pub column: usize,
    pub marker: String,
    #[serde(default = "default_summary_scan")]
    pub scan_limit: usize,
}

fn default_summary_scan() -> usize {
    30
}

/// Header labels of the columns that carry identity rather than measures.
#[derive(Debug, Default, Deserialize)]
pub struct ColumnRoles {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub year: Option<String>,
    #[serde(default)]
    pub school: Option<String>,
    #[serde(default)]
    pub district: Option<String>,
    /// Numeric district-id column, checked against stored ids directly.
    #[serde(default)]
    pub district_id: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub grade: Option<String>,
    /// Candidate subgroup labels, probed in order; first non-blank wins.
    #[serde(default)]
    pub subgroup: Vec<String>,
}

/// One measure column mapping.
#[derive(Debug, Deserialize)]
pub struct FieldConfig {
    /// Destination column name (a `Range` field expands to `{name}_low` and
    /// `{name}_high`).
    pub name: String,
    /// Source header label.
    pub column: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub with_exception: bool,
}

/// Legacy-spelling maps per entity kind.
#[derive(Debug, Default, Deserialize)]
pub struct AliasConfig {
    #[serde(default)]
    pub school: HashMap<String, String>,
    #[serde(default)]
    pub district: HashMap<String, String>,
    #[serde(default)]
    pub town: HashMap<String, String>,
    #[serde(default)]
    pub subject: HashMap<String, String>,
}

impl AliasConfig {
    pub fn for_kind(&self, kind: EntityKind) -> &HashMap<String, String> {
        // Kinds without alias tables resolve on exact names only.
        static EMPTY: std::sync::OnceLock<HashMap<String, String>> = std::sync::OnceLock::new();
        match kind {
            EntityKind::School => &self.school,
            EntityKind::District => &self.district,
            EntityKind::Town => &self.town,
            EntityKind::Subject => &self.subject,
            _ => EMPTY.get_or_init(HashMap::new),
        }
    }
}

/// Reference rows seeded ahead of facts, ranked so parents insert first
/// (subject categories before subjects, for instance).
#[derive(Debug, Deserialize)]
pub struct ReferenceSeed {
    pub table: String,
    pub rank: u8,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl ReferenceSeed {
    pub fn statements(&self) -> Vec<Statement> {
        self.rows
            .iter()
            .map(|row| Statement {
                table: self.table.clone(),
                columns: self.columns.clone(),
                values: row.iter().map(json_to_sql).collect(),
            })
            .collect()
    }
}

fn json_to_sql(value: &serde_json::Value) -> SqlValue {
    match value {
        serde_json::Value::Null => SqlValue::Null,
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Int(i)
            } else {
                SqlValue::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => SqlValue::Text(s.clone()),
        serde_json::Value::Bool(b) => SqlValue::Text(b.to_string()),
        other => SqlValue::Text(other.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct DatasetConfig {
    pub id: String,
    pub name: String,
    pub year_start: i32,
    pub year_end: i32,
    /// Path template relative to the data directory; `{year}` is substituted.
    pub input_pattern: String,
    pub format: SourceFormat,
    #[serde(default)]
    pub sheet_keyword: Option<String>,
    pub header: HeaderConfig,
    #[serde(default)]
    pub summary_row: Option<SummaryRowConfig>,
    #[serde(default)]
    pub columns: ColumnRoles,
    pub fields: Vec<FieldConfig>,
    #[serde(default)]
    pub aliases: AliasConfig,
    /// Known-corrupt integer literals treated as absent in range fields.
    #[serde(default = "default_bad_values")]
    pub bad_values: Vec<i64>,
    #[serde(default)]
    pub references: Vec<ReferenceSeed>,
    /// Table receiving subgroups allocated on first sight.
    #[serde(default)]
    pub subgroup_table: Option<String>,
    pub tables: TableTargets,
    pub default_level: Level,
}

fn default_bad_values() -> Vec<i64> {
    vec![43753]
}

impl DatasetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            dataset: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.year_start > self.year_end {
            return Err(invalid("year_start is after year_end"));
        }
        if !self.input_pattern.contains("{year}") {
            return Err(invalid("input_pattern has no {year} placeholder"));
        }
        if self.header.anchors.is_empty() {
            return Err(invalid("header.anchors is empty"));
        }
        if self.fields.is_empty() {
            return Err(invalid("no fields configured"));
        }
        if !self.columns.subgroup.is_empty()
            && (self.subgroup_table.is_none() || self.tables.subgroup_fk.is_none())
        {
            return Err(invalid(
                "subgroup columns configured without subgroup_table and subgroup_fk",
            ));
        }
        Ok(())
    }

    pub fn input_path(&self, data_dir: &Path, year: i32) -> std::path::PathBuf {
        data_dir.join(self.input_pattern.replace("{year}", &year.to_string()))
    }

    pub fn years(&self) -> std::ops::RangeInclusive<i32> {
        self.year_start..=self.year_end
    }

    /// Tables whose inserts must not fail silently: seeded reference tables
    /// plus the subgroup table.
    pub fn reference_tables(&self) -> Vec<&str> {
        let mut tables: Vec<&str> = self.references.iter().map(|r| r.table.as_str()).collect();
        if let Some(subgroup) = &self.subgroup_table {
            tables.push(subgroup.as_str());
        }
        tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> String {
        r#"{
          "version": 1,
          "datasets": [{
            "id": "cost_per_pupil",
            "name": "Cost Per Pupil",
            "year_start": 2017,
            "year_end": 2019,
            "input_pattern": "cost/{year}.csv",
            "format": "csv",
            "header": { "anchors": [{ "column": 0, "contains": "DIST" }] },
            "columns": { "district": "School District" },
            "fields": [
              { "name": "elementary", "column": "Elementary", "kind": "per_pupil" }
            ],
            "tables": {
              "state": "state_cost_per_pupil",
              "district": "district_cost_per_pupil",
              "school": "school_cost_per_pupil"
            },
            "default_level": "district"
          }]
        }"#
        .to_string()
    }

    #[test]
    fn test_load_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("datasets.json");
        std::fs::write(&path, minimal_json()).unwrap();

        let config = ImportConfig::load(&path).unwrap();
        assert_eq!(config.version, 1);
        let ds = config.dataset("cost_per_pupil").unwrap();
        assert_eq!(ds.years().collect::<Vec<_>>(), vec![2017, 2018, 2019]);
        assert_eq!(ds.header.scan_limit, 25);
        assert_eq!(ds.bad_values, vec![43753]);
        assert_eq!(ds.tables.district_fk, "district_id_fk");
        assert_eq!(ds.tables.year_column, "year");
        assert_eq!(
            ds.input_path(Path::new("/data"), 2018),
            Path::new("/data/cost/2018.csv")
        );
    }

    #[test]
    fn test_missing_year_placeholder_rejected() {
        let raw = minimal_json().replace("cost/{year}.csv", "cost/all.csv");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("datasets.json");
        std::fs::write(&path, raw).unwrap();

        let err = ImportConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_inverted_year_range_rejected() {
        let raw = minimal_json().replace("\"year_start\": 2017", "\"year_start\": 2020");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("datasets.json");
        std::fs::write(&path, raw).unwrap();
        assert!(ImportConfig::load(&path).is_err());
    }

    #[test]
    fn test_reference_seed_statements() {
        let seed = ReferenceSeed {
            table: "assessment_subject".into(),
            rank: 2,
            columns: vec!["id".into(), "name".into(), "description".into()],
            rows: vec![
                vec![1.into(), "Mathematics".into(), serde_json::Value::Null],
                vec![2.into(), "Reading".into(), serde_json::Value::Null],
            ],
        };
        let stmts = seed.statements();
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].values[0], SqlValue::Int(1));
        assert_eq!(stmts[0].values[1], SqlValue::Text("Mathematics".into()));
        assert_eq!(stmts[0].values[2], SqlValue::Null);
    }

    #[test]
    fn test_subgroup_columns_require_subgroup_plumbing() {
        let raw = minimal_json().replace(
            "\"columns\": { \"district\": \"School District\" }",
            "\"columns\": { \"district\": \"School District\", \"subgroup\": [\"Subgroup\"] }",
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("datasets.json");
        std::fs::write(&path, raw).unwrap();
        assert!(ImportConfig::load(&path).is_err());
    }
}
