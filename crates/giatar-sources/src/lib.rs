//! Per-source normalizers: raw exports in, one intermediate schema out.
//!
//! Each source gets a module with its versioned export schemas and the local
//! cleanup rules for that export. Nothing here looks across sources.

use std::path::Path;

use anyhow::Context;
use giatar_core::{CanonicalKey, Nativity, RecordType, SourceId};
use giatar_storage::parse_csv;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub mod asfr;
pub mod cabi;
pub mod daisie;
pub mod eppo;
pub mod native;
pub mod schema;
pub mod years;

pub use schema::{SchemaError, SourceSchema};

pub const CRATE_NAME: &str = "giatar-sources";

/// Raw bytes of one export file plus a label used in diagnostics.
#[derive(Debug, Clone)]
pub struct SourceExport {
    pub label: String,
    pub bytes: Vec<u8>,
}

impl SourceExport {
    pub fn new(label: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            label: label.into(),
            bytes: bytes.into(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        Ok(Self::new(path.display().to_string(), bytes))
    }
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("reading {export}: {source}")]
    Csv {
        export: String,
        #[source]
        source: csv::Error,
    },
    #[error("{origin} does not publish a {feed:?} feed")]
    UnsupportedFeed { origin: SourceId, feed: FeedKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    FirstRecords,
    Distribution,
    Reporting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTaxon {
    pub source: SourceId,
    pub orig_taxon: String,
    pub local_code: String,
}

/// Output of one normalization pass with the counts the run summary reports.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized<T> {
    pub rows: Vec<T>,
    /// Rows that could not be decoded or lacked a usable identifier.
    pub rejected: usize,
    /// Rows removed by the source's filtering rules.
    pub dropped: usize,
}

impl<T> Default for Normalized<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            rejected: 0,
            dropped: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaxonLink {
    Local { source: SourceId, code: String },
    Canonical(CanonicalKey),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocationHint {
    pub text: String,
    pub iso2: Option<String>,
    pub iso3: Option<String>,
}

impl LocationHint {
    pub fn named(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            iso2: None,
            iso3: None,
        }
    }

    pub fn with_iso2(mut self, iso2: Option<String>) -> Self {
        self.iso2 = iso2.filter(|code| code.len() == 2);
        self
    }

    pub fn with_iso3(mut self, iso3: Option<String>) -> Self {
        self.iso3 = iso3.filter(|code| code.len() == 3);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceOccurrence {
    pub taxon: TaxonLink,
    pub location: LocationHint,
    pub year: Option<i32>,
    pub record_type: RecordType,
    pub native: Nativity,
    pub source_label: String,
    pub reference: Option<String>,
}

pub trait SourceNormalizer: Send + Sync {
    fn source(&self) -> SourceId;
    fn species_schema(&self) -> &'static SourceSchema;
    fn normalize_species(&self, export: &SourceExport) -> Result<Normalized<NormalizedTaxon>, NormalizeError>;
    fn feeds(&self) -> &'static [FeedKind];
    fn normalize_feed(
        &self,
        feed: FeedKind,
        export: &SourceExport,
    ) -> Result<Normalized<SourceOccurrence>, NormalizeError>;
}

pub fn normalizer_for_source(source: SourceId) -> Box<dyn SourceNormalizer> {
    match source {
        SourceId::Asfr => Box::new(asfr::AsfrNormalizer),
        SourceId::Cabi => Box::new(cabi::CabiNormalizer),
        SourceId::Eppo => Box::new(eppo::EppoNormalizer),
        SourceId::Daisie => Box::new(daisie::DaisieNormalizer),
    }
}

/// Decode an export and fail fast if a required column is gone.
pub(crate) fn read_export<T: DeserializeOwned>(
    export: &SourceExport,
    schema: &'static SourceSchema,
) -> Result<(Vec<T>, usize), NormalizeError> {
    let table = parse_csv::<T>(&export.bytes).map_err(|source| NormalizeError::Csv {
        export: export.label.clone(),
        source,
    })?;
    schema.check_headers(&table.headers)?;
    for rejected in &table.rejected {
        warn!(
            schema = schema.name,
            export = %export.label,
            line = rejected.line,
            reason = %rejected.reason,
            "rejecting undecodable row"
        );
    }
    Ok((table.rows, table.rejected.len()))
}

pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub(crate) fn unsupported(origin: SourceId, feed: FeedKind) -> NormalizeError {
    NormalizeError::UnsupportedFeed { origin, feed }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_source_has_a_normalizer_with_its_own_feeds() {
        for source in SourceId::ALL {
            let normalizer = normalizer_for_source(source);
            assert_eq!(normalizer.source(), source);
            assert!(!normalizer.feeds().is_empty());
            assert!(!normalizer.species_schema().required.is_empty());
        }
    }

    #[test]
    fn unsupported_feeds_are_refused() {
        let err = normalizer_for_source(SourceId::Asfr)
            .normalize_feed(FeedKind::Reporting, &SourceExport::new("x.csv", "a\n"))
            .expect_err("asfr has no reporting feed");
        assert!(matches!(err, NormalizeError::UnsupportedFeed { .. }));
    }

    #[test]
    fn export_loading_reads_files_with_path_labels() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("asfr.csv");
        std::fs::write(&path, "TaxonName,Region,FirstRecord\n").expect("write");
        let export = SourceExport::load(&path).expect("load");
        assert!(export.label.ends_with("asfr.csv"));
        assert!(SourceExport::load(dir.path().join("missing.csv")).is_err());
    }

    #[test]
    fn location_hints_ignore_malformed_codes() {
        let hint = LocationHint::named("France")
            .with_iso2(Some("FRA".into()))
            .with_iso3(Some("FRA".into()));
        assert_eq!(hint.iso2, None);
        assert_eq!(hint.iso3.as_deref(), Some("FRA"));
    }
}
