//! Native-range dataset: bioregions per backbone key.
//!
//! Rows are already keyed by canonical key, so this export bypasses name
//! matching and only needs its provenance label worked out.

use giatar_core::CanonicalKey;
use serde::Deserialize;
use tracing::warn;

use crate::{non_empty, read_export, NormalizeError, Normalized, SourceExport, SourceSchema};

pub const NATIVE_RANGE_SCHEMA: SourceSchema = SourceSchema {
    name: "native_ranges",
    version: 1,
    required: &["usageKey", "bioregion"],
    optional: &["DAISIE_region", "source"],
};

const CHECKLIST_PREFIX: &str = "DAISIE ";
const PEST_RISK_CITATION: &str = "Takeuchi et al. 2017";

#[derive(Debug, Deserialize)]
struct NativeRangeCsvRow {
    #[serde(rename = "usageKey")]
    usage_key: String,
    bioregion: String,
    #[serde(rename = "DAISIE_region", default)]
    region: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeRangeRow {
    pub canonical_key: CanonicalKey,
    pub bioregion: String,
    /// Finer region name, resolvable to a country.
    pub region: Option<String>,
    pub source_label: String,
    pub reference: Option<String>,
}

impl NativeRangeRow {
    pub fn location_text(&self) -> String {
        match &self.region {
            Some(region) => format!("{} - {}", self.bioregion, region),
            None => self.bioregion.clone(),
        }
    }

    /// Text handed to country resolution, if the row names anything finer than a bioregion.
    pub fn resolution_text(&self) -> Option<&str> {
        self.region.as_deref()
    }
}

/// Provenance label and cleaned reference for one native-range citation.
pub fn native_range_provenance(reference: Option<String>) -> (String, Option<String>) {
    match reference {
        Some(text) if text.starts_with(CHECKLIST_PREFIX) => {
            let rest = text[CHECKLIST_PREFIX.len()..].trim().to_string();
            ("DAISIE".to_string(), Some(rest).filter(|r| !r.is_empty()))
        }
        Some(text) if text.contains(PEST_RISK_CITATION) => ("NCSU, CIPM".to_string(), Some(text)),
        other => ("Original".to_string(), other),
    }
}

pub fn normalize_native_ranges(export: &SourceExport) -> Result<Normalized<NativeRangeRow>, NormalizeError> {
    let (rows, rejected) = read_export::<NativeRangeCsvRow>(export, &NATIVE_RANGE_SCHEMA)?;
    let mut out = Normalized {
        rejected,
        ..Default::default()
    };
    for row in rows {
        let canonical_key = match row.usage_key.parse::<CanonicalKey>() {
            Ok(key) => key,
            Err(err) => {
                warn!(usage_key = %row.usage_key, error = %err, "native range row without a usable key");
                out.rejected += 1;
                continue;
            }
        };
        let bioregion = row.bioregion.trim();
        if bioregion.is_empty() {
            out.dropped += 1;
            continue;
        }
        let (source_label, reference) = native_range_provenance(non_empty(row.source));
        out.rows.push(NativeRangeRow {
            canonical_key,
            bioregion: bioregion.to_string(),
            region: non_empty(row.region),
            source_label,
            reference,
        });
    }
    Ok(out)
}
