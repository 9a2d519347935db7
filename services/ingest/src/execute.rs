//! Statement execution against a sink.
//!
//! Re-running an import over already-loaded data is routine, so duplicate-key
//! violations are counted and skipped rather than treated as failures. Other
//! errors either abort the sequence (reference data) or are collected while
//! the rest proceeds (fact rows), depending on policy.

use anyhow::Result;

use crate::statement::{SqlValue, Statement};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("duplicate key")]
    DuplicateKey,
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

#[allow(async_fn_in_trait)]
pub trait StatementSink {
    async fn execute(&mut self, statement: &Statement) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPolicy {
    /// Abort on the first non-duplicate error.
    FailFast,
    /// Record non-duplicate errors and keep going.
    BestEffort,
}

#[derive(Debug)]
pub struct Failure {
    pub statement: Statement,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub executed: usize,
    pub skipped: usize,
    pub failures: Vec<Failure>,
}

impl ExecutionReport {
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn merge(&mut self, other: ExecutionReport) {
        self.executed += other.executed;
        self.skipped += other.skipped;
        self.failures.extend(other.failures);
    }
}

/// Run statements in order against the sink under the given policy.
pub async fn execute_sequence<S: StatementSink>(
    sink: &mut S,
    statements: &[Statement],
    policy: ExecutionPolicy,
) -> Result<ExecutionReport> {
    let mut report = ExecutionReport::default();

    for statement in statements {
        match sink.execute(statement).await {
            Ok(()) => report.executed += 1,
            Err(SinkError::DuplicateKey) => {
                report.skipped += 1;
                tracing::debug!(table = statement.table.as_str(), "duplicate key, skipping");
            }
            Err(SinkError::Fatal(err)) => match policy {
                ExecutionPolicy::FailFast => {
                    return Err(err.context(format!("executing: {}", statement.excerpt(120))));
                }
                ExecutionPolicy::BestEffort => {
                    tracing::warn!(
                        table = statement.table.as_str(),
                        error = %err,
                        "statement failed"
                    );
                    report.failures.push(Failure {
                        statement: statement.clone(),
                        error: err.to_string(),
                    });
                }
            },
        }
    }

    Ok(report)
}

/// Postgres sink. Renders each statement and binds its non-null values in
/// order.
pub struct PgSink {
    pool: sqlx::PgPool,
}

impl PgSink {
    pub fn new(pool: sqlx::PgPool) -> Self {
        PgSink { pool }
    }
}

impl StatementSink for PgSink {
    async fn execute(&mut self, statement: &Statement) -> Result<(), SinkError> {
        let sql = statement.sql();
        let mut query = sqlx::query(&sql);
        for value in &statement.values {
            query = match value {
                SqlValue::Null => query,
                SqlValue::Int(i) => query.bind(*i),
                SqlValue::Float(f) => query.bind(*f),
                SqlValue::Text(s) => query.bind(s.as_str()),
            };
        }

        match query.execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505") => {
                Err(SinkError::DuplicateKey)
            }
            Err(err) => Err(SinkError::Fatal(err.into())),
        }
    }
}

/// Test sink recording rendered statements in memory. Duplicate detection
/// keys on the full rendered statement plus values.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub executed: Vec<Statement>,
    seen: std::collections::HashSet<String>,
    pub reject_duplicates: bool,
    pub fail_contains: Option<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting_duplicates() -> Self {
        MemorySink {
            reject_duplicates: true,
            ..Self::default()
        }
    }

    fn fingerprint(statement: &Statement) -> String {
        format!("{}|{:?}", statement.sql(), statement.values)
    }
}

impl StatementSink for MemorySink {
    async fn execute(&mut self, statement: &Statement) -> Result<(), SinkError> {
        if let Some(needle) = &self.fail_contains {
            if statement.sql().contains(needle.as_str()) {
                return Err(SinkError::Fatal(anyhow::anyhow!(
                    "injected failure for {needle}"
                )));
            }
        }
        if self.reject_duplicates && !self.seen.insert(Self::fingerprint(statement)) {
            return Err(SinkError::DuplicateKey);
        }
        self.executed.push(statement.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }

    fn stmt(table: &str, id: i64) -> Statement {
        Statement {
            table: table.into(),
            columns: vec!["id".into()],
            values: vec![SqlValue::Int(id)],
        }
    }

    #[test]
    fn test_all_statements_execute() {
        let mut sink = MemorySink::new();
        let statements = vec![stmt("a", 1), stmt("a", 2)];
        let report =
            block_on(execute_sequence(&mut sink, &statements, ExecutionPolicy::BestEffort))
                .unwrap();
        assert_eq!(report.executed, 2);
        assert_eq!(report.skipped, 0);
        assert!(report.ok());
        assert_eq!(sink.executed.len(), 2);
    }

    #[test]
    fn test_duplicates_skip_under_both_policies() {
        for policy in [ExecutionPolicy::FailFast, ExecutionPolicy::BestEffort] {
            let mut sink = MemorySink::rejecting_duplicates();
            let statements = vec![stmt("a", 1), stmt("a", 1), stmt("a", 2)];
            let report = block_on(execute_sequence(&mut sink, &statements, policy)).unwrap();
            assert_eq!(report.executed, 2);
            assert_eq!(report.skipped, 1);
            assert!(report.ok());
        }
    }

    #[test]
    fn test_best_effort_collects_failures_and_continues() {
        let mut sink = MemorySink::new();
        sink.fail_contains = Some("bad_table".into());
        let statements = vec![stmt("a", 1), stmt("bad_table", 2), stmt("a", 3)];
        let report =
            block_on(execute_sequence(&mut sink, &statements, ExecutionPolicy::BestEffort))
                .unwrap();
        assert_eq!(report.executed, 2);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.contains("injected failure"));
    }

    #[test]
    fn test_fail_fast_aborts_on_first_error() {
        let mut sink = MemorySink::new();
        sink.fail_contains = Some("bad_table".into());
        let statements = vec![stmt("a", 1), stmt("bad_table", 2), stmt("a", 3)];
        let result =
            block_on(execute_sequence(&mut sink, &statements, ExecutionPolicy::FailFast));
        assert!(result.is_err());
        assert_eq!(sink.executed.len(), 1);
    }

    #[test]
    fn test_report_merge() {
        let mut a = ExecutionReport {
            executed: 2,
            skipped: 1,
            failures: vec![],
        };
        a.merge(ExecutionReport {
            executed: 3,
            skipped: 0,
            failures: vec![Failure {
                statement: stmt("t", 1),
                error: "boom".into(),
            }],
        });
        assert_eq!(a.executed, 5);
        assert_eq!(a.skipped, 1);
        assert!(!a.ok());
    }
}
