//! Cross-source consolidation: the species table and first-record arbitration.

use std::collections::{BTreeMap, BTreeSet};

use giatar_core::{
    CanonicalKey, CanonicalSpeciesEntry, FirstRecordEntry, LocationCode, Nativity, NativeRangeEntry,
    OccurrenceRecord, RecordType, SourceId,
};
use giatar_sources::cabi::is_invasive_datasheet;

use crate::registry::KeyRegistry;

/// Separator between several local codes of one source linked to the same key.
pub const LINK_SEPARATOR: &str = "; ";

/// Separator between merged provenance values on tied first records.
pub const PROVENANCE_SEPARATOR: &str = ", ";

/// What the two conditional sources say about invasiveness, keyed by local code.
#[derive(Debug, Clone, Default)]
pub struct InclusionEvidence {
    pub cabi_datasheet_types: BTreeMap<String, Vec<String>>,
    pub eppo_categorized: BTreeMap<String, bool>,
}

impl InclusionEvidence {
    pub fn is_invasive(&self, source: SourceId, code: &str) -> bool {
        match source {
            SourceId::Asfr | SourceId::Daisie => source.unconditionally_invasive(),
            SourceId::Cabi => self
                .cabi_datasheet_types
                .get(code)
                .is_some_and(|types| types.iter().any(|t| is_invasive_datasheet(t))),
            SourceId::Eppo => self.eppo_categorized.get(code).copied().unwrap_or(false),
        }
    }
}

/// One row per canonical key that passes at least one source's inclusion test.
pub fn build_species_table(registry: &KeyRegistry, evidence: &InclusionEvidence) -> Vec<CanonicalSpeciesEntry> {
    let mut entries: BTreeMap<CanonicalKey, CanonicalSpeciesEntry> = BTreeMap::new();
    for source in SourceId::ALL {
        for row in registry.rows(source) {
            let Some(key) = row.canonical_key.as_ref() else {
                continue;
            };
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| CanonicalSpeciesEntry::new(key.clone()));

            let link = entry.link_mut(source);
            let code = &row.source_local_code;
            *link = match link.take() {
                Some(existing) if existing.split(LINK_SEPARATOR).any(|c| c == code) => Some(existing),
                Some(existing) => Some(format!("{existing}{LINK_SEPARATOR}{code}")),
                None => Some(code.clone()),
            };

            if evidence.is_invasive(source, &row.source_local_code) {
                *entry.invasive_flag_mut(source) = true;
            }

            // Backbone columns only ever come from a real backbone match.
            if row.has_backbone_key() && entry.canonical_name.is_none() && row.canonical_name.is_some() {
                entry.canonical_name = row.canonical_name.clone();
                entry.rank = row.rank.clone();
                entry.kingdom = row.kingdom.clone();
                entry.phylum = row.phylum.clone();
                entry.class = row.class.clone();
                entry.order = row.order.clone();
                entry.family = row.family.clone();
                entry.genus = row.genus.clone();
            }
        }
    }
    entries.into_values().filter(CanonicalSpeciesEntry::is_included).collect()
}

/// Native-range rows enter the occurrence tables undated.
pub fn native_rows_as_occurrences(native: &[NativeRangeEntry]) -> Vec<OccurrenceRecord> {
    native
        .iter()
        .map(|row| OccurrenceRecord {
            canonical_key: row.canonical_key.clone(),
            location: row.location.clone(),
            year: None,
            record_type: RecordType::NotDated,
            native: Nativity::Native,
            source: row.source.clone(),
            reference: row.reference.clone(),
        })
        .collect()
}

/// Every occurrence plus native-range rows, deduplicated and in key/location/year order.
pub fn assemble_all_records(occurrences: Vec<OccurrenceRecord>, native: &[NativeRangeEntry]) -> Vec<OccurrenceRecord> {
    let mut all = occurrences;
    all.extend(native_rows_as_occurrences(native));
    sort_records(&mut all);
    all.dedup();
    all
}

fn sort_records(records: &mut [OccurrenceRecord]) {
    records.sort_by(|a, b| {
        (&a.canonical_key, &a.location, a.year, &a.source, &a.reference).cmp(&(
            &b.canonical_key,
            &b.location,
            b.year,
            &b.source,
            &b.reference,
        ))
    });
}

/// Earliest record per (key, location). Rows flagged native sort before any year
/// and come out undated. Tied rows are merged instead of one being dropped.
pub fn arbitrate_first_records(records: &[OccurrenceRecord]) -> Vec<FirstRecordEntry> {
    let mut groups: BTreeMap<(&CanonicalKey, &LocationCode), Vec<&OccurrenceRecord>> = BTreeMap::new();
    for record in records {
        groups
            .entry((&record.canonical_key, &record.location))
            .or_default()
            .push(record);
    }

    let mut out = Vec::with_capacity(groups.len());
    for ((key, location), members) in groups {
        let minimum = members.iter().filter_map(|r| arbitration_year(r)).min();
        let tied = members
            .iter()
            .copied()
            .filter(|r| arbitration_year(r) == minimum)
            .collect::<Vec<_>>();
        out.push(merge_tied(key, location, minimum, &tied));
    }
    out
}

fn arbitration_year(record: &OccurrenceRecord) -> Option<i32> {
    if record.native == Nativity::Native {
        Some(i32::MIN)
    } else {
        record.year
    }
}

fn merge_tied(
    key: &CanonicalKey,
    location: &LocationCode,
    minimum: Option<i32>,
    tied: &[&OccurrenceRecord],
) -> FirstRecordEntry {
    let year = minimum.filter(|&y| y != i32::MIN);
    if let [only] = tied {
        return OccurrenceRecord {
            year,
            ..(*only).clone()
        };
    }

    let mut sources = Vec::new();
    let mut references = Vec::new();
    for record in tied {
        if !sources.contains(&record.source.as_str()) {
            sources.push(record.source.as_str());
        }
        if let Some(reference) = record.reference.as_deref() {
            if !references.contains(&reference) {
                references.push(reference);
            }
        }
    }
    let record_type = if tied.iter().any(|r| r.record_type == RecordType::FirstReport) {
        RecordType::FirstReport
    } else {
        tied[0].record_type
    };

    OccurrenceRecord {
        canonical_key: key.clone(),
        location: location.clone(),
        year,
        record_type,
        native: Nativity::merge(tied.iter().map(|r| r.native)),
        source: sources.join(PROVENANCE_SEPARATOR),
        reference: (!references.is_empty()).then(|| references.join(PROVENANCE_SEPARATOR)),
    }
}

/// Keys that appear in the species table, for filtering occurrence tables.
pub fn included_keys(species: &[CanonicalSpeciesEntry]) -> BTreeSet<CanonicalKey> {
    species.iter().map(|s| s.canonical_key.clone()).collect()
}
