//! Merge aggregation for entities that appear under several legacy names.
//!
//! When a cooperative district reports once per member town, or a renamed
//! school shows up under both spellings in one export, those rows must fold
//! into a single fact. Buckets accumulate per (canonical name, year, subject,
//! grade, subgroup); counts and dollars sum, rates average, exception codes
//! take a majority vote.

use std::collections::HashMap;

use crate::normalize::{ExceptionCode, FieldKind, NormalizedValue};

/// Identity of one merge bucket. Facts never merge across years or
/// dimensions, only across contributor spellings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub canonical_name: String,
    pub year: i32,
    pub subject: Option<i64>,
    pub grade: Option<i64>,
    pub subgroup: Option<i64>,
}

/// Canonical names that have more than one source spelling, derived by
/// inverting the alias map. Only these names route through the aggregator.
#[derive(Debug, Default)]
pub struct MergeGroups {
    members: HashMap<String, Vec<String>>,
}

impl MergeGroups {
    pub fn from_aliases(aliases: &HashMap<String, String>) -> Self {
        let mut inverted: HashMap<String, Vec<String>> = HashMap::new();
        for (legacy, canonical) in aliases {
            inverted
                .entry(canonical.trim().to_lowercase())
                .or_default()
                .push(legacy.clone());
        }
        inverted.retain(|_, legacy| legacy.len() >= 2);
        MergeGroups { members: inverted }
    }

    /// Whether this canonical name collects multiple contributor spellings.
    pub fn contains(&self, canonical_name: &str) -> bool {
        self.members
            .contains_key(&canonical_name.trim().to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Debug, Default)]
struct FieldAccumulator {
    kind: Option<FieldKind>,
    sum: f64,
    count: usize,
    exceptions: Vec<ExceptionCode>,
}

#[derive(Debug, Default)]
struct MergeBucket {
    contributors: Vec<String>,
    district: Option<String>,
    fields: HashMap<String, FieldAccumulator>,
    field_order: Vec<String>,
}

/// One fully merged fact, ready for id resolution and statement building.
#[derive(Debug)]
pub struct MergedFact {
    pub key: BucketKey,
    pub district: Option<String>,
    pub contributors: Vec<String>,
    pub fields: Vec<(String, FieldKind, NormalizedValue)>,
}

/// Accumulates contributor rows into buckets; `finalize` drains them in
/// insertion order.
#[derive(Debug, Default)]
pub struct Aggregator {
    buckets: HashMap<BucketKey, MergeBucket>,
    order: Vec<BucketKey>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        key: BucketKey,
        contributor: &str,
        district: Option<&str>,
        fields: &[(String, FieldKind, NormalizedValue)],
    ) {
        if !self.buckets.contains_key(&key) {
            self.order.push(key.clone());
        }
        let bucket = self.buckets.entry(key).or_default();
        bucket.contributors.push(contributor.to_string());
        if bucket.district.is_none() {
            bucket.district = district.map(|d| d.to_string());
        }

        for (name, kind, value) in fields {
            if !bucket.fields.contains_key(name) {
                bucket.field_order.push(name.clone());
            }
            let acc = bucket.fields.entry(name.clone()).or_default();
            acc.kind = Some(*kind);
            if let Some(number) = value.number {
                acc.sum += number;
                acc.count += 1;
            }
            if let Some(code) = value.exception {
                acc.exceptions.push(code);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn finalize(self) -> Vec<MergedFact> {
        let mut buckets = self.buckets;
        self.order
            .into_iter()
            .map(|key| {
                let bucket = buckets.remove(&key).unwrap_or_default();
                let fields = bucket
                    .field_order
                    .iter()
                    .map(|name| {
                        let acc = &bucket.fields[name];
                        let kind = acc.kind.unwrap_or(FieldKind::Count);
                        (name.clone(), kind, merge_field(kind, acc))
                    })
                    .collect();
                MergedFact {
                    key,
                    district: bucket.district,
                    contributors: bucket.contributors,
                    fields,
                }
            })
            .collect()
    }
}

fn merge_field(kind: FieldKind, acc: &FieldAccumulator) -> NormalizedValue {
    let number = if acc.count == 0 {
        None
    } else if kind.additive() {
        // A zero total means no contributor actually reported; store null.
        let total = acc.sum;
        if total == 0.0 {
            None
        } else {
            Some(total)
        }
    } else {
        Some(acc.sum / acc.count as f64)
    };

    NormalizedValue {
        number,
        exception: most_frequent_exception(&acc.exceptions),
    }
}

/// Majority vote over contributor exception codes; first-seen wins a tie.
fn most_frequent_exception(codes: &[ExceptionCode]) -> Option<ExceptionCode> {
    let mut counts: Vec<(ExceptionCode, usize)> = Vec::new();
    for code in codes {
        match counts.iter_mut().find(|(c, _)| c == code) {
            Some((_, n)) => *n += 1,
            None => counts.push((*code, 1)),
        }
    }
    let mut best: Option<(ExceptionCode, usize)> = None;
    for (code, n) in counts {
        match best {
            // Strictly greater only, so the first-seen code keeps a tie.
            Some((_, best_n)) if n <= best_n => {}
            _ => best = Some((code, n)),
        }
    }
    best.map(|(code, _)| code)
}
