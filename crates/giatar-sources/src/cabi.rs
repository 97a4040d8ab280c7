//! Pest compendium: species export, datasheet types and distribution tables.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use giatar_core::{Nativity, RecordType, SourceId};
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::years::{earliest_citation_year, parse_optional_year};
use crate::{
    non_empty, read_export, unsupported, FeedKind, LocationHint, NormalizeError, Normalized, NormalizedTaxon,
    SourceExport, SourceNormalizer, SourceOccurrence, SourceSchema, TaxonLink,
};

pub const SPECIES_SCHEMA: SourceSchema = SourceSchema {
    name: "cabi.species",
    version: 1,
    required: &["Scientific name", "URL"],
    optional: &["Common name", "Coverage"],
};

pub const DATASHEET_TYPES_SCHEMA: SourceSchema = SourceSchema {
    name: "cabi.datasheet_types",
    version: 1,
    required: &["code", "datasheet_type"],
    optional: &[],
};

pub const DISTRIBUTION_SCHEMA: SourceSchema = SourceSchema {
    name: "cabi.distribution",
    version: 1,
    required: &["Continent/Country/Region", "Distribution", "code"],
    optional: &["Origin", "First Reported", "Last Reported", "Reference"],
};

pub const SOURCE_LABEL: &str = "CABI";

static FIRST_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid regex"));

#[derive(Debug, Deserialize)]
struct SpeciesRow {
    #[serde(rename = "Scientific name")]
    scientific_name: String,
    #[serde(rename = "URL")]
    url: String,
}

#[derive(Debug, Deserialize)]
struct DatasheetTypeRow {
    code: String,
    datasheet_type: String,
}

#[derive(Debug, Deserialize)]
struct DistributionRow {
    #[serde(rename = "Continent/Country/Region")]
    location: String,
    #[serde(rename = "Distribution")]
    distribution: String,
    code: String,
    #[serde(rename = "Origin", default)]
    origin: Option<String>,
    #[serde(rename = "First Reported", default)]
    first_reported: Option<String>,
    #[serde(rename = "Last Reported", default)]
    last_reported: Option<String>,
    #[serde(rename = "Reference", default)]
    reference: Option<String>,
}

/// The compendium only exposes its datasheet code inside the datasheet URL.
pub fn code_from_url(url: &str) -> Option<String> {
    FIRST_DIGITS.find(url).map(|m| m.as_str().to_string())
}

/// Datasheet types that qualify a taxon for the invasive species table.
pub fn is_invasive_datasheet(datasheet_type: &str) -> bool {
    let lower = datasheet_type.to_ascii_lowercase();
    lower.contains("invasive species") || lower.contains("pest")
}

/// Datasheet types per compendium code.
pub fn normalize_datasheet_types(export: &SourceExport) -> Result<BTreeMap<String, Vec<String>>, NormalizeError> {
    let (rows, _rejected) = read_export::<DatasheetTypeRow>(export, &DATASHEET_TYPES_SCHEMA)?;
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for row in rows {
        let code = row.code.trim();
        let kind = row.datasheet_type.trim();
        if code.is_empty() || kind.is_empty() {
            continue;
        }
        let kinds = out.entry(code.to_string()).or_default();
        if !kinds.iter().any(|k| k == kind) {
            kinds.push(kind.to_string());
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CabiNormalizer;

impl CabiNormalizer {
    fn normalize_distribution(&self, export: &SourceExport) -> Result<Normalized<SourceOccurrence>, NormalizeError> {
        let (rows, rejected) = read_export::<DistributionRow>(export, &DISTRIBUTION_SCHEMA)?;
        let mut out = Normalized {
            rejected,
            ..Default::default()
        };
        for row in rows {
            let first_reported = non_empty(row.first_reported);
            // Repeated header rows inside the scraped tables.
            if first_reported.as_deref() == Some(row.distribution.trim()) {
                out.dropped += 1;
                continue;
            }
            if !row.distribution.contains("Present") {
                out.dropped += 1;
                continue;
            }
            let location = row.location.trim();
            // Sub-national rows are listed under their country with a leading dash.
            if location.is_empty() || location.starts_with('-') {
                out.dropped += 1;
                continue;
            }
            let code = row.code.trim();
            if code.is_empty() {
                out.rejected += 1;
                continue;
            }

            let reported = [
                parse_optional_year(first_reported.as_deref()),
                parse_optional_year(row.last_reported.as_deref()),
            ]
            .into_iter()
            .flatten()
            .min();
            let reference = non_empty(row.reference);
            let (year, record_type) = match reported {
                Some(year) => (Some(year), RecordType::FirstReport),
                None => match reference.as_deref().and_then(earliest_citation_year) {
                    Some(year) => (Some(year), RecordType::FirstReference),
                    None => (None, RecordType::NotDated),
                },
            };

            let origin = row.origin.unwrap_or_default();
            let native = if origin.contains("Native") {
                Nativity::Native
            } else if origin.contains("Introduced") {
                Nativity::Introduced
            } else {
                Nativity::Unknown
            };

            out.rows.push(SourceOccurrence {
                taxon: TaxonLink::Local {
                    source: SourceId::Cabi,
                    code: code.to_string(),
                },
                location: LocationHint::named(location),
                year,
                record_type,
                native,
                source_label: SOURCE_LABEL.to_string(),
                reference,
            });
        }
        Ok(out)
    }
}

impl SourceNormalizer for CabiNormalizer {
    fn source(&self) -> SourceId {
        SourceId::Cabi
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
            let name = row.scientific_name.trim();
            let Some(code) = code_from_url(&row.url) else {
                warn!(name, url = %row.url, "compendium row without a datasheet code");
                out.rejected += 1;
                continue;
            };
            if name.is_empty() {
                out.rejected += 1;
                continue;
            }
            if !seen.insert(code.clone()) {
                out.dropped += 1;
                continue;
            }
            out.rows.push(NormalizedTaxon {
                source: SourceId::Cabi,
                orig_taxon: name.to_string(),
                local_code: code,
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
            other => Err(unsupported(SourceId::Cabi, other)),
        }
    }
}
