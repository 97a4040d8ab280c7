//! First-records registry. One export serves as both species list and feed.

use std::collections::HashSet;

use giatar_core::{Nativity, RecordType, SourceId};
use serde::Deserialize;

use crate::years::parse_optional_year;
use crate::{
    non_empty, read_export, unsupported, FeedKind, LocationHint, NormalizeError, Normalized, NormalizedTaxon,
    SourceExport, SourceNormalizer, SourceOccurrence, SourceSchema, TaxonLink,
};

pub const FIRST_RECORDS_SCHEMA: SourceSchema = SourceSchema {
    name: "asfr.first_records",
    version: 1,
    required: &["TaxonName", "Region", "FirstRecord"],
    optional: &["Source"],
};

pub const SOURCE_LABEL: &str = "ASFR";

#[derive(Debug, Deserialize)]
struct FirstRecordRow {
    #[serde(rename = "TaxonName")]
    taxon_name: String,
    #[serde(rename = "Region")]
    region: String,
    #[serde(rename = "FirstRecord", default)]
    first_record: Option<String>,
    #[serde(rename = "Source", default)]
    source: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AsfrNormalizer;

impl SourceNormalizer for AsfrNormalizer {
    fn source(&self) -> SourceId {
        SourceId::Asfr
    }

    fn species_schema(&self) -> &'static SourceSchema {
        &FIRST_RECORDS_SCHEMA
    }

    /// The registry has no codes of its own; the taxon name is the local key.
    fn normalize_species(&self, export: &SourceExport) -> Result<Normalized<NormalizedTaxon>, NormalizeError> {
        let (rows, rejected) = read_export::<FirstRecordRow>(export, &FIRST_RECORDS_SCHEMA)?;
        let mut out = Normalized {
            rejected,
            ..Default::default()
        };
        let mut seen = HashSet::new();
        for row in rows {
            let name = row.taxon_name.trim().to_string();
            if name.is_empty() {
                out.rejected += 1;
                continue;
            }
            if !seen.insert(name.clone()) {
                out.dropped += 1;
                continue;
            }
            out.rows.push(NormalizedTaxon {
                source: SourceId::Asfr,
                local_code: name.clone(),
                orig_taxon: name,
            });
        }
        Ok(out)
    }

    fn feeds(&self) -> &'static [FeedKind] {
        &[FeedKind::FirstRecords]
    }

    fn normalize_feed(
        &self,
        feed: FeedKind,
        export: &SourceExport,
    ) -> Result<Normalized<SourceOccurrence>, NormalizeError> {
        if feed != FeedKind::FirstRecords {
            return Err(unsupported(SourceId::Asfr, feed));
        }
        let (rows, rejected) = read_export::<FirstRecordRow>(export, &FIRST_RECORDS_SCHEMA)?;
        let mut out = Normalized {
            rejected,
            ..Default::default()
        };
        for row in rows {
            let name = row.taxon_name.trim();
            let region = row.region.trim();
            if name.is_empty() || region.is_empty() {
                out.dropped += 1;
                continue;
            }
            out.rows.push(SourceOccurrence {
                taxon: TaxonLink::Local {
                    source: SourceId::Asfr,
                    code: name.to_string(),
                },
                location: LocationHint::named(region),
                year: parse_optional_year(row.first_record.as_deref()),
                record_type: RecordType::FirstReport,
                native: Nativity::Introduced,
                source_label: SOURCE_LABEL.to_string(),
                reference: non_empty(row.source),
            });
        }
        Ok(out)
    }
}
