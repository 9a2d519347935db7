//! Name-to-id entity resolution.
//!
//! Source files spell the same school a dozen ways across years. Resolution
//! runs three passes against the store: the raw name, the aliased name, then
//! a token-overlap fallback over candidate names. Every outcome is memoized
//! so a name is only resolved once per run.

use std::collections::HashMap;

use anyhow::Result;

use crate::config::AliasConfig;
use crate::store::{CanonicalEntity, EntityKind, EntityStore};

/// What a lookup asked for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolutionKey {
    pub kind: EntityKind,
    pub name: String,
    pub disambiguator: Option<String>,
}

/// Outcome of a resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Entity(CanonicalEntity),
    Unresolved,
}

/// Subgroup ids are created on first sight rather than failed: a new cohort
/// label in a fresh export becomes a new reference row.
struct SubgroupCache {
    ids: HashMap<String, i64>,
    next_id: i64,
    created: Vec<(i64, String)>,
}

pub struct Resolver<'a, S: EntityStore> {
    store: &'a S,
    /// Per-kind alias maps, keyed by lowercased legacy spelling.
    aliases: HashMap<EntityKind, HashMap<String, String>>,
    /// Memoized outcomes, including misses.
    resolved: HashMap<ResolutionKey, Option<i64>>,
    /// Lazily fetched candidate names per kind, for the token fallback.
    candidates: HashMap<EntityKind, Vec<(i64, String)>>,
    /// Memoized id-existence checks.
    known_ids: HashMap<(EntityKind, i64), bool>,
    subgroups: Option<SubgroupCache>,
}

impl<'a, S: EntityStore> Resolver<'a, S> {
    pub fn new(store: &'a S, aliases: &AliasConfig) -> Self {
        let mut maps: HashMap<EntityKind, HashMap<String, String>> = HashMap::new();
        for kind in [
            EntityKind::School,
            EntityKind::District,
            EntityKind::Town,
            EntityKind::Subject,
        ] {
            let map = aliases
                .for_kind(kind)
                .iter()
                .map(|(legacy, canonical)| (legacy.trim().to_lowercase(), canonical.clone()))
                .collect();
            maps.insert(kind, map);
        }
        Resolver {
            store,
            aliases: maps,
            resolved: HashMap::new(),
            candidates: HashMap::new(),
            known_ids: HashMap::new(),
            subgroups: None,
        }
    }

    /// Canonical spelling of a name after alias substitution; the input name
    /// if no alias applies.
    pub fn canonical_name(&self, kind: EntityKind, name: &str) -> String {
        self.aliases
            .get(&kind)
            .and_then(|map| map.get(&name.trim().to_lowercase()))
            .cloned()
            .unwrap_or_else(|| name.trim().to_string())
    }

    /// Resolve a name to a stored entity id, or report it unresolved.
    pub async fn resolve(
        &mut self,
        kind: EntityKind,
        name: &str,
        disambiguator: Option<&str>,
    ) -> Result<Resolution> {
        let key = ResolutionKey {
            kind,
            name: name.trim().to_lowercase(),
            disambiguator: disambiguator.map(|d| d.trim().to_lowercase()),
        };
        if let Some(cached) = self.resolved.get(&key) {
            return Ok(match cached {
                Some(id) => Resolution::Entity(CanonicalEntity { kind, id: *id }),
                None => Resolution::Unresolved,
            });
        }

        let outcome = self.resolve_uncached(kind, name, disambiguator).await?;
        self.resolved.insert(key, outcome);
        Ok(match outcome {
            Some(id) => Resolution::Entity(CanonicalEntity { kind, id }),
            None => Resolution::Unresolved,
        })
    }

    async fn resolve_uncached(
        &mut self,
        kind: EntityKind,
        name: &str,
        disambiguator: Option<&str>,
    ) -> Result<Option<i64>> {
        // Pass 1: the name as given.
        if let Some(id) = self.store.find_entity(kind, name, disambiguator).await? {
            return Ok(Some(id));
        }

        // Pass 2: the aliased spelling, when one exists.
        let canonical = self.canonical_name(kind, name);
        if !canonical.eq_ignore_ascii_case(name.trim()) {
            if let Some(id) = self
                .store
                .find_entity(kind, &canonical, disambiguator)
                .await?
            {
                return Ok(Some(id));
            }
        }

        // Pass 3: token overlap against stored names. Catches spellings like
        // "Berlin Public" vs "Berlin" without an explicit alias entry.
        if !self.candidates.contains_key(&kind) {
            let names = self.store.candidate_names(kind).await?;
            self.candidates.insert(kind, names);
        }
        let wanted = canonical.to_lowercase();
        let tokens: Vec<&str> = wanted.split_whitespace().collect();
        let (Some(first), Some(last)) = (tokens.first(), tokens.last()) else {
            return Ok(None);
        };
        for (id, candidate) in &self.candidates[&kind] {
            let candidate_lower = candidate.to_lowercase();
            let ctokens: Vec<&str> = candidate_lower.split_whitespace().collect();
            let (cfirst, clast) = (ctokens.first(), ctokens.last());
            // A match on either end of either name counts.
            if cfirst == Some(first)
                || clast == Some(last)
                || cfirst == Some(last)
                || clast == Some(first)
            {
                tracing::info!(
                    kind = kind.label(),
                    given = name,
                    matched = candidate.as_str(),
                    id,
                    "resolved by token overlap"
                );
                return Ok(Some(*id));
            }
        }
        Ok(None)
    }

    /// Whether a numeric id from a source column refers to a stored entity.
    pub async fn exists_id(&mut self, kind: EntityKind, id: i64) -> Result<bool> {
        if let Some(known) = self.known_ids.get(&(kind, id)) {
            return Ok(*known);
        }
        let exists = self.store.find_entity_by_id(kind, id).await?;
        self.known_ids.insert((kind, id), exists);
        Ok(exists)
    }

    /// Resolve a subgroup label, allocating a new sequential id on first
    /// sight of an unknown label. Returns (id, newly_created).
    pub async fn resolve_subgroup(&mut self, name: &str) -> Result<(i64, bool)> {
        if self.subgroups.is_none() {
            let existing = self.store.candidate_names(EntityKind::Subgroup).await?;
            let next_id = self.store.max_id(EntityKind::Subgroup).await? + 1;
            let ids = existing
                .into_iter()
                .map(|(id, n)| (n.trim().to_lowercase(), id))
                .collect();
            self.subgroups = Some(SubgroupCache {
                ids,
                next_id,
                created: Vec::new(),
            });
        }
        let cache = self.subgroups.as_mut().unwrap();

        let key = name.trim().to_lowercase();
        if let Some(id) = cache.ids.get(&key) {
            return Ok((*id, false));
        }

        let id = cache.next_id;
        cache.next_id += 1;
        cache.ids.insert(key, id);
        cache.created.push((id, name.trim().to_string()));
        tracing::info!(subgroup = name, id, "allocating new subgroup");
        Ok((id, true))
    }

    /// Subgroups allocated during this run, in creation order.
    pub fn created_subgroups(&self) -> &[(i64, String)] {
        self.subgroups
            .as_ref()
            .map(|c| c.created.as_slice())
            .unwrap_or(&[])
    }
}

/// Canonical lookup name for a grade cell: "07" becomes "Grade 7", an
/// all-grades marker or blank becomes `None` (no grade dimension).
pub fn grade_lookup_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("all") {
        return None;
    }
    let digits = trimmed.trim_start_matches('0');
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        return Some(format!("Grade {digits}"));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AliasConfig;
    use crate::store::MemoryEntityStore;

    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }

    fn aliases() -> AliasConfig {
        let mut a = AliasConfig::default();
        a.school.insert(
            "Oyster River Coop".into(),
            "Oyster River Cooperative".into(),
        );
        a.town
            .insert("Groveton".into(), "Northumberland".into());
        a
    }

    #[test]
    fn test_exact_match_wins() {
        let mut store = MemoryEntityStore::new();
        store.insert(EntityKind::District, 3, "Berlin");
        let mut resolver = Resolver::new(&store, &aliases());
        let r = block_on(resolver.resolve(EntityKind::District, "Berlin", None)).unwrap();
        assert_eq!(
            r,
            Resolution::Entity(CanonicalEntity {
                kind: EntityKind::District,
                id: 3
            })
        );
    }

    #[test]
    fn test_alias_substitution_resolves() {
        let mut store = MemoryEntityStore::new();
        store.insert(EntityKind::School, 42, "Oyster River Cooperative");
        let mut resolver = Resolver::new(&store, &aliases());
        let r = block_on(resolver.resolve(EntityKind::School, "oyster river coop", None)).unwrap();
        assert_eq!(
            r,
            Resolution::Entity(CanonicalEntity {
                kind: EntityKind::School,
                id: 42
            })
        );
    }

    #[test]
    fn test_town_synonym() {
        let mut store = MemoryEntityStore::new();
        store.insert(EntityKind::Town, 9, "Northumberland");
        let mut resolver = Resolver::new(&store, &aliases());
        let r = block_on(resolver.resolve(EntityKind::Town, "Groveton", None)).unwrap();
        assert_eq!(
            r,
            Resolution::Entity(CanonicalEntity {
                kind: EntityKind::Town,
                id: 9
            })
        );
    }

    #[test]
    fn test_token_overlap_fallback() {
        let mut store = MemoryEntityStore::new();
        store.insert(EntityKind::District, 5, "Mascenic Regional School District");
        let mut resolver = Resolver::new(&store, &aliases());
        // First and last tokens line up; middle differs.
        let r = block_on(resolver.resolve(
            EntityKind::District,
            "Mascenic Reg. School District",
            None,
        ))
        .unwrap();
        assert_eq!(
            r,
            Resolution::Entity(CanonicalEntity {
                kind: EntityKind::District,
                id: 5
            })
        );
    }

    #[test]
    fn test_token_fallback_matches_single_word_candidate() {
        let mut store = MemoryEntityStore::new();
        store.insert(EntityKind::Town, 12, "Berlin");
        let mut resolver = Resolver::new(&store, &aliases());
        // "Berlin Public" shares its first token with the stored name.
        let r = block_on(resolver.resolve(EntityKind::Town, "Berlin Public", None)).unwrap();
        assert_eq!(
            r,
            Resolution::Entity(CanonicalEntity {
                kind: EntityKind::Town,
                id: 12
            })
        );
    }

    #[test]
    fn test_unknown_name_is_unresolved_and_memoized() {
        let store = MemoryEntityStore::new();
        let mut resolver = Resolver::new(&store, &aliases());
        let r = block_on(resolver.resolve(EntityKind::School, "No Such School", None)).unwrap();
        assert_eq!(r, Resolution::Unresolved);
        // Second lookup hits the cache; same outcome.
        let r = block_on(resolver.resolve(EntityKind::School, "no such school ", None)).unwrap();
        assert_eq!(r, Resolution::Unresolved);
    }

    #[test]
    fn test_subgroup_created_on_miss_with_sequential_ids() {
        let mut store = MemoryEntityStore::new();
        store.insert(EntityKind::Subgroup, 1, "All Students");
        let mut resolver = Resolver::new(&store, &aliases());

        assert_eq!(
            block_on(resolver.resolve_subgroup("All Students")).unwrap(),
            (1, false)
        );
        assert_eq!(
            block_on(resolver.resolve_subgroup("Students with Disabilities")).unwrap(),
            (2, true)
        );
        assert_eq!(
            block_on(resolver.resolve_subgroup("Economically Disadvantaged")).unwrap(),
            (3, true)
        );
        // Repeat lookups reuse the allocated id.
        assert_eq!(
            block_on(resolver.resolve_subgroup("students with disabilities")).unwrap(),
            (2, false)
        );
        assert_eq!(resolver.created_subgroups().len(), 2);
    }

    #[test]
    fn test_exists_id() {
        let mut store = MemoryEntityStore::new();
        store.insert(EntityKind::District, 101, "Berlin");
        let mut resolver = Resolver::new(&store, &aliases());
        assert!(block_on(resolver.exists_id(EntityKind::District, 101)).unwrap());
        assert!(!block_on(resolver.exists_id(EntityKind::District, 999)).unwrap());
    }

    #[test]
    fn test_grade_lookup_name() {
        assert_eq!(grade_lookup_name("07"), Some("Grade 7".into()));
        assert_eq!(grade_lookup_name("11"), Some("Grade 11".into()));
        assert_eq!(grade_lookup_name("all"), None);
        assert_eq!(grade_lookup_name(""), None);
        assert_eq!(grade_lookup_name("EOC"), None);
    }
}
