//! Deferred SQL statement construction.
//!
//! Nothing writes to the database while a dataset is being parsed. Each fact
//! becomes a structured `Statement` value; the executor renders and binds
//! them later, and the cache serializes them verbatim.

use serde::{Deserialize, Serialize};

use crate::normalize::{FieldKind, NormalizedValue};
use crate::store::CanonicalEntity;

/// A single bindable value. `Null` renders as a literal so binding never has
/// to guess a type for an absent column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

/// One deferred INSERT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<SqlValue>,
}

impl Statement {
    /// Render the INSERT with `$n` placeholders for non-null values. Null
    /// columns render as the NULL literal and consume no placeholder.
    pub fn sql(&self) -> String {
        let mut placeholders = Vec::with_capacity(self.values.len());
        let mut n = 0;
        for value in &self.values {
            match value {
                SqlValue::Null => placeholders.push("NULL".to_string()),
                _ => {
                    n += 1;
                    placeholders.push(format!("${n}"));
                }
            }
        }
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            self.columns.join(", "),
            placeholders.join(", ")
        )
    }

    /// Short display form for failure reports.
    pub fn excerpt(&self, max: usize) -> String {
        let rendered = self.sql();
        if rendered.len() <= max {
            return rendered;
        }
        // Back off to a char boundary; table names from config may be
        // non-ASCII.
        let mut cut = max;
        while !rendered.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &rendered[..cut])
    }
}

/// Which table a fact targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    State,
    District,
    School,
}

impl Level {
    pub fn label(&self) -> &'static str {
        match self {
            Level::State => "state",
            Level::District => "district",
            Level::School => "school",
        }
    }
}

/// One measure going into a fact row.
#[derive(Debug, Clone)]
pub struct FactField {
    pub column: String,
    pub kind: FieldKind,
    pub value: NormalizedValue,
    pub with_exception: bool,
}

/// A fully resolved fact, ready to become a statement.
#[derive(Debug, Clone)]
pub struct FactRecord {
    pub level: Level,
    /// Resolved owning entity; `None` for state-level facts.
    pub entity: Option<CanonicalEntity>,
    pub year: i32,
    pub subject: Option<i64>,
    pub grade: Option<i64>,
    pub subgroup: Option<i64>,
    pub fields: Vec<FactField>,
}

/// Target table names and foreign-key column names, from dataset config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableTargets {
    pub state: String,
    pub district: String,
    pub school: String,
    #[serde(default = "default_district_fk")]
    pub district_fk: String,
    #[serde(default = "default_school_fk")]
    pub school_fk: String,
    #[serde(default)]
    pub subject_fk: Option<String>,
    #[serde(default)]
    pub grade_fk: Option<String>,
    #[serde(default)]
    pub subgroup_fk: Option<String>,
    #[serde(default = "default_year_column")]
    pub year_column: String,
}

fn default_district_fk() -> String {
    "district_id_fk".to_string()
}

fn default_school_fk() -> String {
    "school_id_fk".to_string()
}

fn default_year_column() -> String {
    "year".to_string()
}

/// Collects statements for one dataset run and emits them in dependency
/// order: reference rows by rank, then state, district, school facts.
pub struct StatementBuilder {
    targets: TableTargets,
    references: Vec<(u8, Statement)>,
    state: Vec<Statement>,
    district: Vec<Statement>,
    school: Vec<Statement>,
}

impl StatementBuilder {
    pub fn new(targets: &TableTargets) -> Self {
        StatementBuilder {
            targets: targets.clone(),
            references: Vec::new(),
            state: Vec::new(),
            district: Vec::new(),
            school: Vec::new(),
        }
    }

    /// Reference-data insert at an explicit dependency rank (lower first).
    pub fn push_reference(&mut self, rank: u8, statement: Statement) {
        self.references.push((rank, statement));
    }

    /// Newly allocated subgroup rows land after all seeded reference data.
    pub fn push_subgroup(&mut self, table: &str, id: i64, name: &str) {
        self.references.push((
            3,
            Statement {
                table: table.to_string(),
                columns: vec!["id".into(), "name".into(), "description".into()],
                values: vec![SqlValue::Int(id), SqlValue::Text(name.to_string()), SqlValue::Null],
            },
        ));
    }

    /// Turn a resolved fact into an insert. Returns false when every measure
    /// is absent, in which case no statement is queued.
    pub fn push_fact(&mut self, fact: &FactRecord) -> bool {
        if fact
            .fields
            .iter()
            .all(|f| f.value.is_absent())
        {
            return false;
        }

        let mut columns = Vec::new();
        let mut values = Vec::new();

        match (fact.level, fact.entity) {
            (Level::District, Some(entity)) => {
                columns.push(self.targets.district_fk.clone());
                values.push(SqlValue::Int(entity.id));
            }
            (Level::School, Some(entity)) => {
                columns.push(self.targets.school_fk.clone());
                values.push(SqlValue::Int(entity.id));
            }
            _ => {}
        }

        columns.push(self.targets.year_column.clone());
        values.push(SqlValue::Int(i64::from(fact.year)));

        if let (Some(fk), Some(id)) = (&self.targets.subject_fk, fact.subject) {
            columns.push(fk.clone());
            values.push(SqlValue::Int(id));
        }
        if let (Some(fk), Some(id)) = (&self.targets.grade_fk, fact.grade) {
            columns.push(fk.clone());
            values.push(SqlValue::Int(id));
        }
        if let (Some(fk), Some(id)) = (&self.targets.subgroup_fk, fact.subgroup) {
            columns.push(fk.clone());
            values.push(SqlValue::Int(id));
        }

        for field in &fact.fields {
            columns.push(field.column.clone());
            values.push(match field.value.number {
                Some(number) => {
                    let finished = field.kind.finish(number);
                    if field.kind.additive() {
                        SqlValue::Int(finished as i64)
                    } else {
                        SqlValue::Float(finished)
                    }
                }
                None => SqlValue::Null,
            });

            if field.with_exception {
                columns.push(format!("{}_exception", field.column));
                values.push(match field.value.exception {
                    Some(code) => SqlValue::Text(code.as_str().to_string()),
                    None => SqlValue::Null,
                });
            }
        }

        let table = match fact.level {
            Level::State => &self.targets.state,
            Level::District => &self.targets.district,
            Level::School => &self.targets.school,
        };
        let statement = Statement {
            table: table.clone(),
            columns,
            values,
        };
        match fact.level {
            Level::State => self.state.push(statement),
            Level::District => self.district.push(statement),
            Level::School => self.school.push(statement),
        }
        true
    }

    /// Drain into final execution order.
    pub fn build(mut self) -> Vec<Statement> {
        self.references.sort_by_key(|(rank, _)| *rank);
        let mut out: Vec<Statement> =
            self.references.into_iter().map(|(_, s)| s).collect();
        out.append(&mut self.state);
        out.append(&mut self.district);
        out.append(&mut self.school);
        out
    }
}
