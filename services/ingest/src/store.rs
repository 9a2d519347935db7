//! Entity lookup interface.
//!
//! The relational store owns the canonical entities; the pipeline only reads
//! them. Resolution is written against the `EntityStore` trait so the
//! algorithm tests without a live database.

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

/// Kinds of canonical entities the pipeline resolves against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    District,
    School,
    Town,
    Sau,
    Grade,
    Subject,
    Subgroup,
}

impl EntityKind {
    /// Backing table in the external schema.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::District => "district",
            EntityKind::School => "school",
            EntityKind::Town => "town",
            EntityKind::Sau => "sau",
            EntityKind::Grade => "grades",
            EntityKind::Subject => "assessment_subject",
            EntityKind::Subgroup => "assessment_subgroup",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EntityKind::District => "district",
            EntityKind::School => "school",
            EntityKind::Town => "town",
            EntityKind::Sau => "sau",
            EntityKind::Grade => "grade",
            EntityKind::Subject => "subject",
            EntityKind::Subgroup => "subgroup",
        }
    }
}

/// Immutable reference to a persisted entity. Only the resolver and the
/// store construct these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CanonicalEntity {
    pub kind: EntityKind,
    pub id: i64,
}

/// Read-only lookups the resolver needs from the external store.
#[allow(async_fn_in_trait)]
pub trait EntityStore {
    /// Exact (case-insensitive) name lookup, optionally filtered by a parent
    /// disambiguator (a school name qualified by its district name).
    async fn find_entity(
        &self,
        kind: EntityKind,
        name: &str,
        disambiguator: Option<&str>,
    ) -> Result<Option<i64>>;

    /// Whether an entity with this surrogate id exists.
    async fn find_entity_by_id(&self, kind: EntityKind, id: i64) -> Result<bool>;

    /// All (id, name) pairs of a kind; feeds the token-overlap fallback and
    /// the subgroup cache.
    async fn candidate_names(&self, kind: EntityKind) -> Result<Vec<(i64, String)>>;

    /// Highest surrogate id in use for a kind (0 when empty); new reference
    /// entities are allocated above it.
    async fn max_id(&self, kind: EntityKind) -> Result<i64>;
}

/// Postgres-backed store.
pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    pub fn new(pool: PgPool) -> Self {
        PgEntityStore { pool }
    }
}

impl EntityStore for PgEntityStore {
    async fn find_entity(
        &self,
        kind: EntityKind,
        name: &str,
        disambiguator: Option<&str>,
    ) -> Result<Option<i64>> {
        let id: Option<i32> = match (kind, disambiguator) {
            (EntityKind::School, Some(district)) => {
                sqlx::query_scalar(
                    "SELECT s.id FROM school s \
                     JOIN district d ON s.district_id_fk = d.id \
                     WHERE LOWER(s.name) = LOWER($1) AND LOWER(d.name) = LOWER($2)",
                )
                .bind(name.trim())
                .bind(district.trim())
                .fetch_optional(&self.pool)
                .await?
            }
            _ => {
                let sql = format!(
                    "SELECT id FROM {} WHERE LOWER(name) = LOWER($1)",
                    kind.table()
                );
                sqlx::query_scalar(&sql)
                    .bind(name.trim())
                    .fetch_optional(&self.pool)
                    .await?
            }
        };
        Ok(id.map(i64::from))
    }

    async fn find_entity_by_id(&self, kind: EntityKind, id: i64) -> Result<bool> {
        let sql = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = $1)", kind.table());
        let exists: bool = sqlx::query_scalar(&sql)
            .bind(id as i32)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn candidate_names(&self, kind: EntityKind) -> Result<Vec<(i64, String)>> {
        let sql = format!("SELECT id, name FROM {} ORDER BY id", kind.table());
        let rows: Vec<(i32, String)> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(id, name)| (i64::from(id), name)).collect())
    }

    async fn max_id(&self, kind: EntityKind) -> Result<i64> {
        let sql = format!("SELECT COALESCE(MAX(id), 0) FROM {}", kind.table());
        let max: i32 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(i64::from(max))
    }
}

/// In-memory store used by tests and offline dry runs.
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    entities: HashMap<EntityKind, Vec<(i64, String)>>,
    parents: HashMap<(EntityKind, i64), String>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: EntityKind, id: i64, name: &str) {
        self.entities
            .entry(kind)
            .or_default()
            .push((id, name.to_string()));
    }

    /// Insert an entity with a parent name used for disambiguated lookups
    /// (a school inside a district).
    pub fn insert_with_parent(&mut self, kind: EntityKind, id: i64, name: &str, parent: &str) {
        self.insert(kind, id, name);
        self.parents.insert((kind, id), parent.to_string());
    }
}

impl EntityStore for MemoryEntityStore {
    async fn find_entity(
        &self,
        kind: EntityKind,
        name: &str,
        disambiguator: Option<&str>,
    ) -> Result<Option<i64>> {
        let wanted = name.trim().to_lowercase();
        let Some(entries) = self.entities.get(&kind) else {
            return Ok(None);
        };
        for (id, candidate) in entries {
            if candidate.trim().to_lowercase() != wanted {
                continue;
            }
            if let (Some(parent_wanted), Some(parent)) =
                (disambiguator, self.parents.get(&(kind, *id)))
            {
                if parent.trim().to_lowercase() != parent_wanted.trim().to_lowercase() {
                    continue;
                }
            }
            return Ok(Some(*id));
        }
        Ok(None)
    }

    async fn find_entity_by_id(&self, kind: EntityKind, id: i64) -> Result<bool> {
        Ok(self
            .entities
            .get(&kind)
            .map(|entries| entries.iter().any(|(eid, _)| *eid == id))
            .unwrap_or(false))
    }

    async fn candidate_names(&self, kind: EntityKind) -> Result<Vec<(i64, String)>> {
        Ok(self.entities.get(&kind).cloned().unwrap_or_default())
    }

    async fn max_id(&self, kind: EntityKind) -> Result<i64> {
        Ok(self
            .entities
            .get(&kind)
            .and_then(|entries| entries.iter().map(|(id, _)| *id).max())
            .unwrap_or(0))
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

    #[test]
    fn test_memory_store_exact_lookup_ignores_case() {
        let mut store = MemoryEntityStore::new();
        store.insert(EntityKind::District, 7, "Berlin");
        let found = block_on(store.find_entity(EntityKind::District, "  berlin ", None)).unwrap();
        assert_eq!(found, Some(7));
    }

    #[test]
    fn test_memory_store_disambiguator_filters() {
        let mut store = MemoryEntityStore::new();
        store.insert_with_parent(EntityKind::School, 1, "Main Street School", "Berlin");
        store.insert_with_parent(EntityKind::School, 2, "Main Street School", "Concord");

        let found = block_on(store.find_entity(
            EntityKind::School,
            "Main Street School",
            Some("Concord"),
        ))
        .unwrap();
        assert_eq!(found, Some(2));
    }

    #[test]
    fn test_memory_store_id_checks_and_max() {
        let mut store = MemoryEntityStore::new();
        store.insert(EntityKind::Subgroup, 4, "All Students");
        assert!(block_on(store.find_entity_by_id(EntityKind::Subgroup, 4)).unwrap());
        assert!(!block_on(store.find_entity_by_id(EntityKind::Subgroup, 5)).unwrap());
        assert_eq!(block_on(store.max_id(EntityKind::Subgroup)).unwrap(), 4);
        assert_eq!(block_on(store.max_id(EntityKind::Town)).unwrap(), 0);
    }
}
