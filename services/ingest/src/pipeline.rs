//! Dataset pipeline.
//!
//! Drives one dataset end to end: read each year's file, locate the header,
//! normalize and resolve every row, fold merge-group contributors together,
//! and emit the final statement sequence. Nothing here touches the database
//! except entity lookups through the store.

use std::path::Path;

use anyhow::Result;

use crate::config::{DatasetConfig, SourceFormat};
use crate::locate::{locate_header, locate_summary_row};
use crate::merge::{Aggregator, BucketKey, MergeGroups, MergedFact};
use crate::normalize::{normalize_numeric, normalize_range, FieldKind, NormalizedValue};
use crate::report::{RunStats, UnresolvedReport};
use crate::resolve::{grade_lookup_name, Resolution, Resolver};
use crate::statement::{FactField, FactRecord, Level, Statement, StatementBuilder};
use crate::store::{CanonicalEntity, EntityKind, EntityStore};
use crate::table::{read_csv_table, read_workbook_table, Cell, HeaderMap, SourceRow, Table};

pub struct PipelineOutput {
    pub statements: Vec<Statement>,
    pub stats: RunStats,
    pub unresolved: UnresolvedReport,
}

/// Process every configured year of a dataset into a statement sequence.
pub async fn run_dataset<S: EntityStore>(
    cfg: &DatasetConfig,
    data_dir: &Path,
    store: &S,
) -> Result<PipelineOutput> {
    let mut run = DatasetRun::new(store, cfg);

    for year in cfg.years() {
        let path = cfg.input_path(data_dir, year);
        if !path.exists() {
            tracing::warn!(path = %path.display(), year, "source file missing, skipping year");
            run.stats.files_skipped += 1;
            continue;
        }
        let table = match cfg.format {
            SourceFormat::Csv => read_csv_table(&path, year),
            SourceFormat::Workbook => {
                read_workbook_table(&path, year, cfg.sheet_keyword.as_deref())
            }
        };
        let table = match table {
            Ok(table) => table,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "unreadable file, skipping");
                run.stats.files_skipped += 1;
                continue;
            }
        };
        run.process_table(cfg, &table).await?;
    }

    run.finish(cfg).await
}

struct DatasetRun<'a, S: EntityStore> {
    resolver: Resolver<'a, S>,
    school_groups: MergeGroups,
    district_groups: MergeGroups,
    school_agg: Aggregator,
    district_agg: Aggregator,
    facts: Vec<FactRecord>,
    unresolved: UnresolvedReport,
    stats: RunStats,
}

impl<'a, S: EntityStore> DatasetRun<'a, S> {
    fn new(store: &'a S, cfg: &DatasetConfig) -> Self {
        DatasetRun {
            resolver: Resolver::new(store, &cfg.aliases),
            school_groups: MergeGroups::from_aliases(&cfg.aliases.school),
            district_groups: MergeGroups::from_aliases(&cfg.aliases.district),
            school_agg: Aggregator::new(),
            district_agg: Aggregator::new(),
            facts: Vec::new(),
            unresolved: UnresolvedReport::new(),
            stats: RunStats::default(),
        }
    }

    async fn process_table(&mut self, cfg: &DatasetConfig, table: &Table) -> Result<()> {
        let Some(header_idx) = locate_header(table, &cfg.header.anchors, cfg.header.scan_limit)
        else {
            tracing::warn!(path = %table.path.display(), "no header row found, skipping file");
            self.stats.files_skipped += 1;
            return Ok(());
        };
        self.stats.files_read += 1;
        let header = HeaderMap::from_row(&table.rows[header_idx]);

        let summary_idx = cfg.summary_row.as_ref().and_then(|sr| {
            locate_summary_row(table, header_idx + 1, sr.column, &sr.marker, sr.scan_limit)
        });

        for i in (header_idx + 1)..table.rows.len() {
            let row = SourceRow {
                cells: &table.rows[i],
                header: &header,
                row_idx: i,
                year: table.year,
            };
            if row.cells.iter().all(Cell::is_empty) {
                continue;
            }
            self.stats.rows_seen += 1;
            let forced_level = if Some(i) == summary_idx {
                Some(Level::State)
            } else {
                None
            };
            self.process_row(cfg, row, forced_level).await?;
        }
        Ok(())
    }

    async fn process_row(
        &mut self,
        cfg: &DatasetConfig,
        row: SourceRow<'_>,
        forced_level: Option<Level>,
    ) -> Result<()> {
        let level = forced_level.unwrap_or_else(|| {
            cfg.columns
                .level
                .as_deref()
                .and_then(|label| row.text(label))
                .and_then(parse_level)
                .unwrap_or(cfg.default_level)
        });

        let year = cfg
            .columns
            .year
            .as_deref()
            .and_then(|label| cell_int(row.get(label)))
            .map(|y| y as i32)
            .unwrap_or(row.year);

        // Subject is a hard dimension: a row with an unknown subject code is
        // noise, not a fact.
        let subject = match cfg.columns.subject.as_deref() {
            Some(label) => {
                let Some(raw) = row.text(label) else {
                    self.stats.rows_skipped += 1;
                    return Ok(());
                };
                match self.resolver.resolve(EntityKind::Subject, raw, None).await? {
                    Resolution::Entity(entity) => Some(entity.id),
                    Resolution::Unresolved => {
                        tracing::warn!(subject = raw, row = row.row_idx, "unknown subject, skipping row");
                        self.stats.rows_skipped += 1;
                        return Ok(());
                    }
                }
            }
            None => None,
        };

        let grade = match cfg
            .columns
            .grade
            .as_deref()
            .and_then(|label| row.text(label))
            .and_then(|raw| grade_lookup_name(raw))
        {
            Some(name) => match self.resolver.resolve(EntityKind::Grade, &name, None).await? {
                Resolution::Entity(entity) => Some(entity.id),
                Resolution::Unresolved => {
                    self.unresolved.record("grade", &name, year);
                    None
                }
            },
            None => None,
        };

        let subgroup = match &cfg.subgroup_table {
            Some(_) => {
                let label = cfg
                    .columns
                    .subgroup
                    .iter()
                    .find_map(|candidate| row.text(candidate))
                    .unwrap_or("All Students");
                let (id, created) = self.resolver.resolve_subgroup(label).await?;
                if created {
                    self.stats.subgroups_created += 1;
                }
                Some(id)
            }
            None => None,
        };

        let fields = extract_fields(cfg, &row);

        match level {
            Level::State => {
                self.push_fact(FactRecord {
                    level: Level::State,
                    entity: None,
                    year,
                    subject,
                    grade,
                    subgroup,
                    fields,
                });
            }
            Level::School => {
                let Some(name) = cfg.columns.school.as_deref().and_then(|l| row.text(l)) else {
                    self.stats.rows_skipped += 1;
                    return Ok(());
                };
                let district = cfg.columns.district.as_deref().and_then(|l| row.text(l));
                let canonical = self.resolver.canonical_name(EntityKind::School, name);

                if self.school_groups.contains(&canonical) {
                    self.school_agg.add(
                        BucketKey {
                            canonical_name: canonical,
                            year,
                            subject,
                            grade,
                            subgroup,
                        },
                        name,
                        district,
                        &to_merge_fields(&fields),
                    );
                    return Ok(());
                }

                match self
                    .resolver
                    .resolve(EntityKind::School, name, district)
                    .await?
                {
                    Resolution::Entity(entity) => self.push_fact(FactRecord {
                        level: Level::School,
                        entity: Some(entity),
                        year,
                        subject,
                        grade,
                        subgroup,
                        fields,
                    }),
                    Resolution::Unresolved => {
                        self.unresolved.record("school", name, year);
                        self.stats.rows_skipped += 1;
                    }
                }
            }
            Level::District => {
                // A trusted numeric id column short-circuits name resolution.
                if let Some(label) = cfg.columns.district_id.as_deref() {
                    if let Some(id) = cell_int(row.get(label)) {
                        if self.resolver.exists_id(EntityKind::District, id).await? {
                            self.push_fact(FactRecord {
                                level: Level::District,
                                entity: Some(CanonicalEntity {
                                    kind: EntityKind::District,
                                    id,
                                }),
                                year,
                                subject,
                                grade,
                                subgroup,
                                fields,
                            });
                        } else {
                            self.unresolved.record("district", &id.to_string(), year);
                            self.stats.rows_skipped += 1;
                        }
                        return Ok(());
                    }
                }

                let Some(name) = cfg.columns.district.as_deref().and_then(|l| row.text(l)) else {
                    self.stats.rows_skipped += 1;
                    return Ok(());
                };
                let canonical = self.resolver.canonical_name(EntityKind::District, name);

                if self.district_groups.contains(&canonical) {
                    self.district_agg.add(
                        BucketKey {
                            canonical_name: canonical,
                            year,
                            subject,
                            grade,
                            subgroup,
                        },
                        name,
                        None,
                        &to_merge_fields(&fields),
                    );
                    return Ok(());
                }

                match self
                    .resolver
                    .resolve(EntityKind::District, name, None)
                    .await?
                {
                    Resolution::Entity(entity) => self.push_fact(FactRecord {
                        level: Level::District,
                        entity: Some(entity),
                        year,
                        subject,
                        grade,
                        subgroup,
                        fields,
                    }),
                    Resolution::Unresolved => {
                        self.unresolved.record("district", name, year);
                        self.stats.rows_skipped += 1;
                    }
                }
            }
        }
        Ok(())
    }

    fn push_fact(&mut self, fact: FactRecord) {
        self.stats.facts_built += 1;
        self.facts.push(fact);
    }

    async fn resolve_merged(
        &mut self,
        cfg: &DatasetConfig,
        kind: EntityKind,
        level: Level,
        merged: Vec<MergedFact>,
    ) -> Result<()> {
        for fact in merged {
            let resolution = self
                .resolver
                .resolve(kind, &fact.key.canonical_name, fact.district.as_deref())
                .await?;
            match resolution {
                Resolution::Entity(entity) => {
                    tracing::debug!(
                        name = fact.key.canonical_name.as_str(),
                        contributors = fact.contributors.len(),
                        "merged contributors into one fact"
                    );
                    self.stats.merged_facts += 1;
                    let fields = fact
                        .fields
                        .into_iter()
                        .map(|(column, kind, value)| {
                            let with_exception = cfg
                                .fields
                                .iter()
                                .any(|f| f.name == column && f.with_exception);
                            FactField {
                                column,
                                kind,
                                value,
                                with_exception,
                            }
                        })
                        .collect();
                    self.push_fact(FactRecord {
                        level,
                        entity: Some(entity),
                        year: fact.key.year,
                        subject: fact.key.subject,
                        grade: fact.key.grade,
                        subgroup: fact.key.subgroup,
                        fields,
                    });
                }
                Resolution::Unresolved => {
                    self.unresolved
                        .record(kind.label(), &fact.key.canonical_name, fact.key.year);
                }
            }
        }
        Ok(())
    }

    async fn finish(mut self, cfg: &DatasetConfig) -> Result<PipelineOutput> {
        let school_merged = std::mem::take(&mut self.school_agg).finalize();
        let district_merged = std::mem::take(&mut self.district_agg).finalize();
        self.resolve_merged(cfg, EntityKind::School, Level::School, school_merged)
            .await?;
        self.resolve_merged(cfg, EntityKind::District, Level::District, district_merged)
            .await?;

        let mut builder = StatementBuilder::new(&cfg.tables);
        for seed in &cfg.references {
            for statement in seed.statements() {
                builder.push_reference(seed.rank, statement);
            }
        }
        if let Some(table) = &cfg.subgroup_table {
            for (id, name) in self.resolver.created_subgroups() {
                builder.push_subgroup(table, *id, name);
            }
        }
        for fact in &self.facts {
            builder.push_fact(fact);
        }

        Ok(PipelineOutput {
            statements: builder.build(),
            stats: self.stats,
            unresolved: self.unresolved,
        })
    }
}

/// Normalize every configured measure of one row. Range fields expand into
/// `{name}_low` / `{name}_high` count columns.
fn extract_fields(cfg: &DatasetConfig, row: &SourceRow<'_>) -> Vec<FactField> {
    let mut fields = Vec::with_capacity(cfg.fields.len());
    for fc in &cfg.fields {
        let cell = row.get(&fc.column);
        match fc.kind {
            FieldKind::Range => {
                let (low, high) = normalize_range(cell, &cfg.bad_values);
                fields.push(FactField {
                    column: format!("{}_low", fc.name),
                    kind: FieldKind::Count,
                    value: NormalizedValue {
                        number: low.map(|v| v as f64),
                        exception: None,
                    },
                    with_exception: false,
                });
                fields.push(FactField {
                    column: format!("{}_high", fc.name),
                    kind: FieldKind::Count,
                    value: NormalizedValue {
                        number: high.map(|v| v as f64),
                        exception: None,
                    },
                    with_exception: false,
                });
            }
            kind => {
                fields.push(FactField {
                    column: fc.name.clone(),
                    kind,
                    value: normalize_numeric(cell),
                    with_exception: fc.with_exception,
                });
            }
        }
    }
    fields
}

fn to_merge_fields(fields: &[FactField]) -> Vec<(String, FieldKind, NormalizedValue)> {
    fields
        .iter()
        .map(|f| (f.column.clone(), f.kind, f.value))
        .collect()
}

fn parse_level(text: &str) -> Option<Level> {
    let lower = text.trim().to_lowercase();
    if lower.starts_with("state") {
        Some(Level::State)
    } else if lower.starts_with("school") {
        Some(Level::School)
    } else if lower.starts_with("district") {
        Some(Level::District)
    } else {
        None
    }
}

fn cell_int(cell: &Cell) -> Option<i64> {
    match cell {
        Cell::Number(n) if !n.is_nan() => Some(n.trunc() as i64),
        Cell::Text(s) => {
            let t = s.trim();
            if !t.is_empty() && t.chars().all(|c| c.is_ascii_digit()) {
                t.parse().ok()
            } else {
                None
            }
        }
        _ => None,
    }
}
