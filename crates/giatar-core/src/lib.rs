//! Core domain model for the GIATAR consolidation pipeline.
//!
//! Every table the pipeline persists is expressed here as a serde row type so
//! the storage, pipeline and query crates agree on one column layout.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const CRATE_NAME: &str = "giatar-core";

/// Reserved prefix of synthetic canonical keys.
pub const PLACEHOLDER_PREFIX: &str = "XX";

/// Location codes that never denote a real country.
pub const RESERVED_LOCATION_CODES: [&str; 3] = ["ZZ", "XL", "XZ"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    Asfr,
    Cabi,
    Eppo,
    Daisie,
}

impl SourceId {
    pub const ALL: [SourceId; 4] = [SourceId::Asfr, SourceId::Cabi, SourceId::Eppo, SourceId::Daisie];

    pub fn slug(self) -> &'static str {
        match self {
            SourceId::Asfr => "asfr",
            SourceId::Cabi => "cabi",
            SourceId::Eppo => "eppo",
            SourceId::Daisie => "daisie",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SourceId::Asfr => "ASFR",
            SourceId::Cabi => "CABI",
            SourceId::Eppo => "EPPO",
            SourceId::Daisie => "DAISIE",
        }
    }

    /// Three-letter tag embedded in placeholder keys.
    pub fn tag(self) -> &'static str {
        match self {
            SourceId::Asfr => "ASF",
            SourceId::Cabi => "CAB",
            SourceId::Eppo => "EPP",
            SourceId::Daisie => "DAI",
        }
    }

    /// The first-records registry and the continental checklist only list alien taxa.
    pub fn unconditionally_invasive(self) -> bool {
        matches!(self, SourceId::Asfr | SourceId::Daisie)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty canonical key")]
    EmptyKey,
    #[error("invalid canonical key `{0}`")]
    InvalidKey(String),
    #[error("unknown source `{0}`")]
    UnknownSource(String),
}

impl FromStr for SourceId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asfr" => Ok(SourceId::Asfr),
            "cabi" => Ok(SourceId::Cabi),
            "eppo" => Ok(SourceId::Eppo),
            "daisie" => Ok(SourceId::Daisie),
            other => Err(ParseError::UnknownSource(other.to_string())),
        }
    }
}

/// The single identifier used for one taxon across all sources.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CanonicalKey {
    Backbone(u64),
    /// Holds the full key text, prefix included.
    Placeholder(String),
}

impl CanonicalKey {
    pub fn placeholder(source: SourceId, name: &str) -> Self {
        let sanitized = name.split_whitespace().collect::<Vec<_>>().join("_");
        CanonicalKey::Placeholder(format!("{PLACEHOLDER_PREFIX}{}{sanitized}", source.tag()))
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, CanonicalKey::Placeholder(_))
    }

    pub fn backbone_id(&self) -> Option<u64> {
        match self {
            CanonicalKey::Backbone(id) => Some(*id),
            CanonicalKey::Placeholder(_) => None,
        }
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanonicalKey::Backbone(id) => write!(f, "{id}"),
            CanonicalKey::Placeholder(text) => f.write_str(text),
        }
    }
}

impl FromStr for CanonicalKey {
    type Err = ParseError;

    /// Accepts the legacy `"1234.0"` float rendering of backbone keys.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseError::EmptyKey);
        }
        if s.starts_with(PLACEHOLDER_PREFIX) {
            return Ok(CanonicalKey::Placeholder(s.to_string()));
        }
        let digits = s.strip_suffix(".0").unwrap_or(s);
        digits
            .parse::<u64>()
            .map(CanonicalKey::Backbone)
            .map_err(|_| ParseError::InvalidKey(s.to_string()))
    }
}

impl Serialize for CanonicalKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CanonicalKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Exact,
    Synonym,
    Doubtful,
    HigherRank,
    Unmatched,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    pub kingdom: Option<String>,
    pub phylum: Option<String>,
    pub class: Option<String>,
    pub order: Option<String>,
    pub family: Option<String>,
    pub genus: Option<String>,
}

/// One row of a per-source canonical-key linkage file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkageRow {
    pub source_local_code: String,
    pub orig_taxon: String,
    pub canonical_key: Option<CanonicalKey>,
    pub match_status: MatchStatus,
    #[serde(default)]
    pub match_type: Option<String>,
    #[serde(default)]
    pub canonical_name: Option<String>,
    #[serde(default)]
    pub rank: Option<String>,
    #[serde(default)]
    pub kingdom: Option<String>,
    #[serde(default)]
    pub phylum: Option<String>,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub order: Option<String>,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub genus: Option<String>,
    pub is_new: bool,
    pub date_stamp: NaiveDate,
}

impl LinkageRow {
    pub fn lineage(&self) -> Lineage {
        Lineage {
            kingdom: self.kingdom.clone(),
            phylum: self.phylum.clone(),
            class: self.class.clone(),
            order: self.order.clone(),
            family: self.family.clone(),
            genus: self.genus.clone(),
        }
    }

    pub fn set_lineage(&mut self, lineage: Lineage) {
        self.kingdom = lineage.kingdom;
        self.phylum = lineage.phylum;
        self.class = lineage.class;
        self.order = lineage.order;
        self.family = lineage.family;
        self.genus = lineage.genus;
    }

    pub fn has_backbone_key(&self) -> bool {
        matches!(self.canonical_key, Some(CanonicalKey::Backbone(_)))
    }
}

/// One row of the consolidated species table; unique per canonical key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalSpeciesEntry {
    #[serde(rename = "canonicalKey")]
    pub canonical_key: CanonicalKey,
    #[serde(rename = "canonicalName", default)]
    pub canonical_name: Option<String>,
    #[serde(default)]
    pub rank: Option<String>,
    #[serde(default)]
    pub kingdom: Option<String>,
    #[serde(default)]
    pub phylum: Option<String>,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub order: Option<String>,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub genus: Option<String>,
    #[serde(rename = "taxonASFR", default)]
    pub taxon_asfr: Option<String>,
    #[serde(rename = "codeCABI", default)]
    pub code_cabi: Option<String>,
    #[serde(rename = "codeEPPO", default)]
    pub code_eppo: Option<String>,
    #[serde(rename = "codeDAISIE", default)]
    pub code_daisie: Option<String>,
    #[serde(rename = "invasiveASFR")]
    pub invasive_asfr: bool,
    #[serde(rename = "invasiveCABI")]
    pub invasive_cabi: bool,
    #[serde(rename = "invasiveEPPO")]
    pub invasive_eppo: bool,
    #[serde(rename = "invasiveDAISIE")]
    pub invasive_daisie: bool,
}

impl CanonicalSpeciesEntry {
    pub fn new(canonical_key: CanonicalKey) -> Self {
        Self {
            canonical_key,
            canonical_name: None,
            rank: None,
            kingdom: None,
            phylum: None,
            class: None,
            order: None,
            family: None,
            genus: None,
            taxon_asfr: None,
            code_cabi: None,
            code_eppo: None,
            code_daisie: None,
            invasive_asfr: false,
            invasive_cabi: false,
            invasive_eppo: false,
            invasive_daisie: false,
        }
    }

    pub fn lineage(&self) -> Lineage {
        Lineage {
            kingdom: self.kingdom.clone(),
            phylum: self.phylum.clone(),
            class: self.class.clone(),
            order: self.order.clone(),
            family: self.family.clone(),
            genus: self.genus.clone(),
        }
    }

    pub fn link(&self, source: SourceId) -> Option<&str> {
        match source {
            SourceId::Asfr => self.taxon_asfr.as_deref(),
            SourceId::Cabi => self.code_cabi.as_deref(),
            SourceId::Eppo => self.code_eppo.as_deref(),
            SourceId::Daisie => self.code_daisie.as_deref(),
        }
    }

    pub fn link_mut(&mut self, source: SourceId) -> &mut Option<String> {
        match source {
            SourceId::Asfr => &mut self.taxon_asfr,
            SourceId::Cabi => &mut self.code_cabi,
            SourceId::Eppo => &mut self.code_eppo,
            SourceId::Daisie => &mut self.code_daisie,
        }
    }

    pub fn invasive_flag_mut(&mut self, source: SourceId) -> &mut bool {
        match source {
            SourceId::Asfr => &mut self.invasive_asfr,
            SourceId::Cabi => &mut self.invasive_cabi,
            SourceId::Eppo => &mut self.invasive_eppo,
            SourceId::Daisie => &mut self.invasive_daisie,
        }
    }

    pub fn is_included(&self) -> bool {
        self.invasive_asfr || self.invasive_cabi || self.invasive_eppo || self.invasive_daisie
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    #[serde(rename = "First report")]
    FirstReport,
    #[serde(rename = "First reference")]
    FirstReference,
    #[serde(rename = "First year listed")]
    FirstYearListed,
    #[serde(rename = "Not dated")]
    NotDated,
}

impl RecordType {
    pub fn label(self) -> &'static str {
        match self {
            RecordType::FirstReport => "First report",
            RecordType::FirstReference => "First reference",
            RecordType::FirstYearListed => "First year listed",
            RecordType::NotDated => "Not dated",
        }
    }
}

/// Tri-state native flag. Persisted as `true` / `false` / empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Option<bool>", into = "Option<bool>")]
pub enum Nativity {
    Native,
    Introduced,
    #[default]
    Unknown,
}

impl Nativity {
    pub fn as_flag(self) -> Option<bool> {
        match self {
            Nativity::Native => Some(true),
            Nativity::Introduced => Some(false),
            Nativity::Unknown => None,
        }
    }

    /// True if any is true, false if any explicit false remains, else unknown.
    pub fn merge<I: IntoIterator<Item = Nativity>>(flags: I) -> Nativity {
        let mut merged = Nativity::Unknown;
        for flag in flags {
            match flag {
                Nativity::Native => return Nativity::Native,
                Nativity::Introduced => merged = Nativity::Introduced,
                Nativity::Unknown => {}
            }
        }
        merged
    }
}

impl From<Option<bool>> for Nativity {
    fn from(flag: Option<bool>) -> Self {
        match flag {
            Some(true) => Nativity::Native,
            Some(false) => Nativity::Introduced,
            None => Nativity::Unknown,
        }
    }
}

impl From<Nativity> for Option<bool> {
    fn from(nativity: Nativity) -> Self {
        nativity.as_flag()
    }
}

/// ISO3 country code, or a non-country descriptor such as a bioregion.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LocationCode {
    Iso3(String),
    Descriptor(String),
}

impl LocationCode {
    pub fn is_iso3(&self) -> bool {
        matches!(self, LocationCode::Iso3(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            LocationCode::Iso3(code) | LocationCode::Descriptor(code) => code,
        }
    }

    pub fn is_reserved(&self) -> bool {
        RESERVED_LOCATION_CODES.contains(&self.as_str())
    }
}

impl From<String> for LocationCode {
    fn from(text: String) -> Self {
        let trimmed = text.trim();
        if trimmed.len() == 3 && trimmed.chars().all(|c| c.is_ascii_uppercase()) {
            LocationCode::Iso3(trimmed.to_string())
        } else {
            LocationCode::Descriptor(trimmed.to_string())
        }
    }
}

impl From<LocationCode> for String {
    fn from(code: LocationCode) -> Self {
        match code {
            LocationCode::Iso3(code) | LocationCode::Descriptor(code) => code,
        }
    }
}

impl fmt::Display for LocationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row of the all-records and first-records tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OccurrenceRecord {
    pub canonical_key: CanonicalKey,
    pub location: LocationCode,
    pub year: Option<i32>,
    pub record_type: RecordType,
    pub native: Nativity,
    pub source: String,
    #[serde(default)]
    pub reference: Option<String>,
}

pub type FirstRecordEntry = OccurrenceRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeRangeEntry {
    pub canonical_key: CanonicalKey,
    pub location: LocationCode,
    pub location_text: String,
    pub bioregion: String,
    pub native: Nativity,
    pub source: String,
    #[serde(default)]
    pub reference: Option<String>,
}

/// Occurrence whose location text resolved to no country.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmatchedLocation {
    pub canonical_key: CanonicalKey,
    pub location_text: String,
    pub year: Option<i32>,
    pub record_type: RecordType,
    pub source: String,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewEntry {
    pub source: SourceId,
    pub orig_taxon: String,
    pub source_local_code: String,
    pub match_status: MatchStatus,
    pub placeholder_key: CanonicalKey,
}

/// Groups of keyed sub-tables served alongside the consolidated tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtableGroup {
    Ecology,
    HostsVectors,
}

impl SubtableGroup {
    pub fn slug(self) -> &'static str {
        match self {
            SubtableGroup::Ecology => "ecology",
            SubtableGroup::HostsVectors => "hosts_vectors",
        }
    }
}

/// Locations of the persisted tables, relative to the data directory.
pub mod tables {
    use std::path::PathBuf;

    use super::{SourceId, SubtableGroup};

    pub const SPECIES: &str = "species.csv";
    pub const FIRST_RECORDS: &str = "occurrences/first_records.csv";
    pub const ALL_RECORDS: &str = "occurrences/all_records.csv";
    pub const BACKBONE_FIRST_RECORDS: &str = "occurrences/gbif_first_records.csv";
    pub const UNMATCHED_LOCATIONS: &str = "occurrences/unmatched_locations.csv";
    pub const NATIVE_RANGES: &str = "native_ranges.csv";
    pub const BIOREGION_CROSSWALK: &str = "bioregion_crosswalk.csv";
    pub const EPPO_CATEGORIZATION: &str = "eppo_categorization.csv";
    pub const MANUAL_REVIEW: &str = "review/needs_manual_review.csv";
    pub const RUN_STATE: &str = "state.json";

    pub fn linkage(source: SourceId) -> PathBuf {
        PathBuf::from("links").join(format!("{}_links.csv", source.slug()))
    }

    pub fn subtable_dir(group: SubtableGroup) -> PathBuf {
        PathBuf::from("subtables").join(group.slug())
    }

    pub fn subtable(group: SubtableGroup, name: &str) -> PathBuf {
        subtable_dir(group).join(format!("{name}.csv"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backbone_keys_parse_with_and_without_float_suffix() {
        assert_eq!("2435099".parse::<CanonicalKey>().unwrap(), CanonicalKey::Backbone(2435099));
        assert_eq!("2435099.0".parse::<CanonicalKey>().unwrap(), CanonicalKey::Backbone(2435099));
        assert_eq!(CanonicalKey::Backbone(2435099).to_string(), "2435099");
        assert!(matches!("".parse::<CanonicalKey>(), Err(ParseError::EmptyKey)));
        assert!(matches!("12a".parse::<CanonicalKey>(), Err(ParseError::InvalidKey(_))));
    }

    #[test]
    fn placeholder_keys_carry_prefix_tag_and_underscored_name() {
        let key = CanonicalKey::placeholder(SourceId::Daisie, " Foo  bar baz ");
        assert_eq!(key.to_string(), "XXDAIFoo_bar_baz");
        assert!(key.is_placeholder());
        assert_eq!(key.backbone_id(), None);
        assert_eq!("XXDAIFoo_bar_baz".parse::<CanonicalKey>().unwrap(), key);
    }

    #[test]
    fn nativity_merge_prefers_true_then_false_then_unknown() {
        use Nativity::*;
        assert_eq!(Nativity::merge([Unknown, Introduced, Native]), Native);
        assert_eq!(Nativity::merge([Unknown, Introduced]), Introduced);
        assert_eq!(Nativity::merge([Unknown, Unknown]), Unknown);
        assert_eq!(Nativity::merge([]), Unknown);
    }

    #[test]
    fn location_codes_split_iso3_from_descriptors() {
        assert_eq!(LocationCode::from("FRA".to_string()), LocationCode::Iso3("FRA".into()));
        assert_eq!(
            LocationCode::from("Palearctic - Europe".to_string()),
            LocationCode::Descriptor("Palearctic - Europe".into())
        );
        assert!(LocationCode::from("ZZ".to_string()).is_reserved());
    }

    #[test]
    fn occurrence_rows_serialize_to_flat_csv_columns() {
        let row = OccurrenceRecord {
            canonical_key: CanonicalKey::Backbone(42),
            location: LocationCode::Iso3("FRA".into()),
            year: Some(1985),
            record_type: RecordType::FirstReference,
            native: Nativity::Unknown,
            source: "EPPO Distribution".into(),
            reference: None,
        };
        let mut writer = csv::Writer::from_writer(vec![]);
        writer.serialize(&row).unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        assert_eq!(
            text,
            "canonicalKey,location,year,recordType,native,source,reference\n42,FRA,1985,First reference,,EPPO Distribution,\n"
        );

        let mut reader = csv::Reader::from_reader(text.as_bytes());
        let parsed: OccurrenceRecord = reader.deserialize().next().unwrap().unwrap();
        assert_eq!(parsed, row);
    }

    #[test]
    fn species_entries_serialize_as_json_with_string_keys() {
        let mut entry = CanonicalSpeciesEntry::new(CanonicalKey::Backbone(7));
        *entry.invasive_flag_mut(SourceId::Eppo) = true;
        *entry.link_mut(SourceId::Eppo) = Some("ABCDE".into());
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["canonicalKey"], "7");
        assert_eq!(json["codeEPPO"], "ABCDE");
        assert!(entry.is_included());
    }

    #[test]
    fn table_paths_are_scoped_per_source_and_group() {
        assert_eq!(tables::linkage(SourceId::Cabi), std::path::PathBuf::from("links/cabi_links.csv"));
        assert_eq!(
            tables::subtable(SubtableGroup::HostsVectors, "pathways"),
            std::path::PathBuf::from("subtables/hosts_vectors/pathways.csv")
        );
    }
}
