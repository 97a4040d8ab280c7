//! Continental checklist: taxon export and the regional distribution table.

use std::collections::HashSet;

use giatar_core::{Nativity, RecordType, SourceId};
use serde::Deserialize;

use crate::years::{clean_checklist_year, lowest_four_digit_year, CHECKLIST_SNAPSHOT_YEAR};
use crate::{
    non_empty, read_export, unsupported, FeedKind, LocationHint, NormalizeError, Normalized, NormalizedTaxon,
    SourceExport, SourceNormalizer, SourceOccurrence, SourceSchema, TaxonLink,
};

pub const SPECIES_SCHEMA: SourceSchema = SourceSchema {
    name: "daisie.species",
    version: 1,
    required: &["idspecies", "genus", "species"],
    optional: &[],
};

pub const DISTRIBUTION_SCHEMA: SourceSchema = SourceSchema {
    name: "daisie.distribution",
    version: 1,
    required: &["idspecies", "region_country"],
    optional: &["start_year", "end_year", "code_region", "source"],
};

pub const SOURCE_LABEL: &str = "DAISIE";

#[derive(Debug, Deserialize)]
struct SpeciesRow {
    idspecies: String,
    genus: String,
    species: String,
}

#[derive(Debug, Deserialize)]
struct DistributionRow {
    idspecies: String,
    region_country: String,
    #[serde(default)]
    start_year: Option<String>,
    #[serde(default)]
    end_year: Option<String>,
    #[serde(default)]
    code_region: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

/// Year and record type for one checklist row.
pub fn checklist_dating(
    start_year: Option<&str>,
    end_year: Option<&str>,
    reference: Option<&str>,
) -> (Option<i32>, RecordType) {
    let text = start_year.or(end_year);
    if let Some(year) = clean_checklist_year(text) {
        return (Some(year), RecordType::FirstReport);
    }
    match reference.and_then(lowest_four_digit_year) {
        Some(year) => (Some(year), RecordType::FirstReference),
        None => (Some(CHECKLIST_SNAPSHOT_YEAR), RecordType::NotDated),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DaisieNormalizer;

impl DaisieNormalizer {
    fn normalize_distribution(&self, export: &SourceExport) -> Result<Normalized<SourceOccurrence>, NormalizeError> {
        let (rows, rejected) = read_export::<DistributionRow>(export, &DISTRIBUTION_SCHEMA)?;
        let mut out = Normalized {
            rejected,
            ..Default::default()
        };
        for row in rows {
            let code = row.idspecies.trim();
            let region = row.region_country.trim();
            if code.is_empty() {
                out.rejected += 1;
                continue;
            }
            if region.is_empty() {
                out.dropped += 1;
                continue;
            }
            let reference = non_empty(row.source);
            let start = non_empty(row.start_year);
            let end = non_empty(row.end_year);
            let (year, record_type) = checklist_dating(start.as_deref(), end.as_deref(), reference.as_deref());

            out.rows.push(SourceOccurrence {
                taxon: TaxonLink::Local {
                    source: SourceId::Daisie,
                    code: code.to_string(),
                },
                location: LocationHint::named(region).with_iso3(non_empty(row.code_region)),
                year,
                record_type,
                native: Nativity::Introduced,
                source_label: SOURCE_LABEL.to_string(),
                reference,
            });
        }
        Ok(out)
    }
}

impl SourceNormalizer for DaisieNormalizer {
    fn source(&self) -> SourceId {
        SourceId::Daisie
    }

    fn species_schema(&self) -> &'static SourceSchema {
        &SPECIES_SCHEMA
    }

    fn normalize_species(&self, export: &SourceExport) -> Result<Normalized<NormalizedTaxon>, NormalizeError> {
        let (rows, rejected) = read_export::<SpeciesRow>(export, &SPECIES_SCHEMA)?;
        let mut out = Normalized {
            rejected,
            ..Default::default()
        };
        let mut seen = HashSet::new();
        for row in rows {
            let name = format!("{} {}", row.genus.trim(), row.species.trim()).trim().to_string();
            let code = row.idspecies.trim();
            if code.is_empty() || name.is_empty() {
                out.rejected += 1;
                continue;
            }
            if !seen.insert(code.to_string()) {
                out.dropped += 1;
                continue;
            }
            out.rows.push(NormalizedTaxon {
                source: SourceId::Daisie,
                orig_taxon: name,
                local_code: code.to_string(),
            });
        }
        Ok(out)
    }

    fn feeds(&self) -> &'static [FeedKind] {
        &[FeedKind::Distribution]
    }

    fn normalize_feed(
        &self,
        feed: FeedKind,
        export: &SourceExport,
    ) -> Result<Normalized<SourceOccurrence>, NormalizeError> {
        match feed {
            FeedKind::Distribution => self.normalize_distribution(export),
            other => Err(unsupported(SourceId::Daisie, other)),
        }
    }
}
