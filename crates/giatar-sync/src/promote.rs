//! Replacing a placeholder key with a real one across every persisted table.
//!
//! All tables are loaded and rewritten in memory, then written as one staged
//! batch. A failed rewrite or staging write leaves every file as it was.

use std::collections::BTreeMap;

use anyhow::{ensure, Context, Result};
use giatar_core::{
    tables, CanonicalKey, CanonicalSpeciesEntry, NativeRangeEntry, OccurrenceRecord, ReviewEntry, SourceId,
    SubtableGroup, UnmatchedLocation,
};
use giatar_storage::{TableStore, WriteBatch};
use serde::Serialize;
use tracing::info;

use crate::consolidate::{arbitrate_first_records, LINK_SEPARATOR};
use crate::registry::KeyRegistry;
use crate::subtables::KEY_COLUMN;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PromotionReport {
    pub linkage_rows: usize,
    pub species_rows: usize,
    pub occurrence_rows: usize,
    pub native_rows: usize,
    pub unmatched_rows: usize,
    pub review_rows: usize,
    pub subtable_rows: usize,
}

impl PromotionReport {
    pub fn total(&self) -> usize {
        self.linkage_rows
            + self.species_rows
            + self.occurrence_rows
            + self.native_rows
            + self.unmatched_rows
            + self.review_rows
            + self.subtable_rows
    }
}

/// Load the registry from `store`, promote there and in every table, persist all of it.
pub async fn promote_placeholder(store: &TableStore, old: &CanonicalKey, new: &CanonicalKey) -> Result<PromotionReport> {
    let mut registry = KeyRegistry::load(store).await?;
    let mut batch = store.batch();
    let report = stage_promotion(store, &mut registry, old, new, &mut batch).await?;
    registry.stage(&mut batch)?;
    batch.commit().await?;
    info!(old = %old, new = %new, rows = report.total(), "placeholder promoted");
    Ok(report)
}

/// Same as [`promote_placeholder`] against an in-memory registry the caller persists.
pub async fn promote_with_registry(
    store: &TableStore,
    registry: &mut KeyRegistry,
    old: &CanonicalKey,
    new: &CanonicalKey,
) -> Result<PromotionReport> {
    let mut batch = store.batch();
    let report = stage_promotion(store, registry, old, new, &mut batch).await?;
    batch.commit().await?;
    info!(old = %old, new = %new, rows = report.total(), "placeholder promoted");
    Ok(report)
}

async fn stage_promotion(
    store: &TableStore,
    registry: &mut KeyRegistry,
    old: &CanonicalKey,
    new: &CanonicalKey,
    batch: &mut WriteBatch,
) -> Result<PromotionReport> {
    ensure!(old.is_placeholder(), "{old} is not a placeholder key");
    ensure!(old != new, "cannot promote {old} to itself");

    let mut report = PromotionReport {
        linkage_rows: registry.promote_placeholder(old, new),
        ..Default::default()
    };

    let mut species: Vec<CanonicalSpeciesEntry> = store.read_rows(tables::SPECIES).await?;
    report.species_rows = rekey_species(&mut species, old, new);

    let mut all_records: Vec<OccurrenceRecord> = store.read_rows(tables::ALL_RECORDS).await?;
    report.occurrence_rows = rekey(&mut all_records, old, new, |r| &mut r.canonical_key);
    let first_records = arbitrate_first_records(&all_records);

    let mut native: Vec<NativeRangeEntry> = store.read_rows(tables::NATIVE_RANGES).await?;
    report.native_rows = rekey(&mut native, old, new, |r| &mut r.canonical_key);

    let mut unmatched: Vec<UnmatchedLocation> = store.read_rows(tables::UNMATCHED_LOCATIONS).await?;
    report.unmatched_rows = rekey(&mut unmatched, old, new, |r| &mut r.canonical_key);

    let mut review: Vec<ReviewEntry> = store.read_rows(tables::MANUAL_REVIEW).await?;
    let before = review.len();
    review.retain(|r| &r.placeholder_key != old);
    report.review_rows = before - review.len();

    let mut subtables = Vec::new();
    for group in [SubtableGroup::Ecology, SubtableGroup::HostsVectors] {
        let dir = store.path_for(tables::subtable_dir(group));
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries {
            let path = entry.with_context(|| format!("listing {}", dir.display()))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                continue;
            }
            let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let (rewritten, touched) = rekey_generic_csv(&bytes, old, new)
                .with_context(|| format!("rewriting {}", path.display()))?;
            if touched > 0 {
                report.subtable_rows += touched;
                subtables.push((path, rewritten));
            }
        }
    }

    batch.table(tables::SPECIES, &species)?;
    batch.table(tables::ALL_RECORDS, &all_records)?;
    batch.table(tables::FIRST_RECORDS, &first_records)?;
    batch.table(tables::NATIVE_RANGES, &native)?;
    batch.table(tables::UNMATCHED_LOCATIONS, &unmatched)?;
    batch.table(tables::MANUAL_REVIEW, &review)?;
    for (path, bytes) in subtables {
        batch.bytes(path, bytes);
    }
    Ok(report)
}

fn rekey<T>(
    rows: &mut [T],
    old: &CanonicalKey,
    new: &CanonicalKey,
    key: impl Fn(&mut T) -> &mut CanonicalKey,
) -> usize {
    let mut touched = 0;
    for row in rows.iter_mut() {
        let slot = key(row);
        if slot == old {
            *slot = new.clone();
            touched += 1;
        }
    }
    touched
}

/// A placeholder row folds into an existing entry for `new` when there is one.
fn rekey_species(species: &mut Vec<CanonicalSpeciesEntry>, old: &CanonicalKey, new: &CanonicalKey) -> usize {
    let Some(pos) = species.iter().position(|s| &s.canonical_key == old) else {
        return 0;
    };
    let mut moved = species.remove(pos);
    match species.iter_mut().find(|s| &s.canonical_key == new) {
        Some(target) => {
            for source in SourceId::ALL {
                if let Some(code) = moved.link(source).map(str::to_string) {
                    let link = target.link_mut(source);
                    *link = match link.take() {
                        Some(existing) if existing.split(LINK_SEPARATOR).any(|c| c == code) => Some(existing),
                        Some(existing) => Some(format!("{existing}{LINK_SEPARATOR}{code}")),
                        None => Some(code),
                    };
                }
                let flag = *moved.invasive_flag_mut(source);
                *target.invasive_flag_mut(source) |= flag;
            }
        }
        None => {
            moved.canonical_key = new.clone();
            species.push(moved);
            species.sort_by(|a, b| a.canonical_key.cmp(&b.canonical_key));
        }
    }
    1
}

fn rekey_generic_csv(bytes: &[u8], old: &CanonicalKey, new: &CanonicalKey) -> Result<(Vec<u8>, usize)> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(bytes);
    let headers = reader.headers()?.clone();
    let Some(idx) = headers.iter().position(|h| h == KEY_COLUMN) else {
        return Ok((bytes.to_vec(), 0));
    };
    let old_text = old.to_string();
    let new_text = new.to_string();
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&headers)?;
    let mut touched = 0;
    for record in reader.records() {
        let record = record?;
        let fields = record
            .iter()
            .enumerate()
            .map(|(i, field)| {
                if i == idx && field == old_text {
                    touched += 1;
                    new_text.as_str()
                } else {
                    field
                }
            })
            .collect::<Vec<_>>();
        writer.write_record(&fields)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing csv buffer: {}", err.error()))?;
    Ok((bytes, touched))
}

/// Linkage rows that moved off a placeholder this run, oldest key to newest.
pub fn promotions_from(reconciled: &[(CanonicalKey, CanonicalKey)]) -> BTreeMap<CanonicalKey, CanonicalKey> {
    reconciled
        .iter()
        .filter(|(old, new)| old.is_placeholder() && !new.is_placeholder())
        .cloned()
        .collect()
}
