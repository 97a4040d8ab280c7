//! Read-only queries over the consolidated GIATAR tables, plus their JSON HTTP surface.

mod routes;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use giatar_core::{
    tables, CanonicalKey, CanonicalSpeciesEntry, LinkageRow, NativeRangeEntry, Nativity, OccurrenceRecord,
    SourceId, SubtableGroup, PLACEHOLDER_PREFIX,
};
use giatar_storage::TableStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::info;

pub use routes::{app, port_from_env, serve, serve_from_env, AppState};

pub const CRATE_NAME: &str = "giatar-query";

/// Column that carries the canonical key in every keyed sub-table.
pub const SUBTABLE_KEY_COLUMN: &str = "canonicalKey";

/// Ranks whose backbone name is used as the display name.
const SPECIES_LEVEL_RANKS: [&str; 4] = ["SPECIES", "FORM", "SUBSPECIES", "VARIETY"];

/// Native-range evidence from this source label never overrides the crosswalk.
const ORIGINAL_SOURCE_LABEL: &str = "Original";

const NAME_LOOKUP_ORDER: [SourceId; 4] = [SourceId::Asfr, SourceId::Eppo, SourceId::Cabi, SourceId::Daisie];
const DISPLAY_NAME_ORDER: [SourceId; 4] = [SourceId::Eppo, SourceId::Asfr, SourceId::Cabi, SourceId::Daisie];

pub type SubtableRow = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("no species matches {0:?}")]
    UnknownSpecies(String),
    #[error("{0:?} is not a three-letter ISO3 code")]
    InvalidIso3(String),
    #[error("loading consolidated tables: {0}")]
    Load(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpeciesListing {
    pub key: CanonicalKey,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntroductionOptions {
    /// Drop rows whose location is a descriptor rather than an ISO3 code.
    pub iso3_only: bool,
    /// Overwrite each row's native flag with [`QuerySnapshot::native_status`] where that is known.
    pub native_inference: bool,
}

impl IntroductionOptions {
    pub fn first_introductions() -> Self {
        Self {
            iso3_only: false,
            native_inference: true,
        }
    }

    pub fn all_introductions() -> Self {
        Self {
            iso3_only: true,
            native_inference: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusEvidence {
    Bioregion,
    Records,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NativeStatus {
    pub iso3: String,
    pub native: Nativity,
    pub evidence: StatusEvidence,
}

/// Native evidence for one taxon: dated records carrying a native flag and the native-range rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NativeRangeReport {
    pub records: Vec<OccurrenceRecord>,
    pub ranges: Vec<NativeRangeEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TaxonomyFilter {
    pub kingdom: Option<String>,
    pub phylum: Option<String>,
    pub class: Option<String>,
    pub order: Option<String>,
    pub family: Option<String>,
    pub genus: Option<String>,
}

impl TaxonomyFilter {
    fn accepts(&self, entry: &CanonicalSpeciesEntry) -> bool {
        let pairs = [
            (&self.kingdom, &entry.kingdom),
            (&self.phylum, &entry.phylum),
            (&self.class, &entry.class),
            (&self.order, &entry.order),
            (&self.family, &entry.family),
            (&self.genus, &entry.genus),
        ];
        pairs.into_iter().all(|(wanted, actual)| match wanted {
            Some(w) => actual.as_deref() == Some(w.as_str()),
            None => true,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CrosswalkRow {
    #[serde(rename = "ISO3")]
    iso3: String,
    #[serde(alias = "modified_Bioregion")]
    bioregion: String,
}

#[derive(Debug, Default, Deserialize)]
struct RunMarker {
    #[serde(default)]
    last_run_id: Option<String>,
}

/// Every consolidated table, read once and indexed by canonical key.
#[derive(Debug, Clone, Default)]
pub struct QuerySnapshot {
    run_id: Option<String>,
    species: Vec<CanonicalSpeciesEntry>,
    index: HashMap<CanonicalKey, usize>,
    links: BTreeMap<SourceId, Vec<LinkageRow>>,
    first_records: Vec<OccurrenceRecord>,
    all_records: Vec<OccurrenceRecord>,
    native_ranges: Vec<NativeRangeEntry>,
    crosswalk: Vec<CrosswalkRow>,
    subtables: BTreeMap<SubtableGroup, BTreeMap<String, Vec<SubtableRow>>>,
}

impl QuerySnapshot {
    pub async fn read(store: &TableStore) -> Result<Self> {
        let run_id = read_run_id(store).await?;
        let species: Vec<CanonicalSpeciesEntry> = store.read_rows(tables::SPECIES).await?;
        let index = species
            .iter()
            .enumerate()
            .map(|(i, entry)| (entry.canonical_key.clone(), i))
            .collect();

        let mut links = BTreeMap::new();
        for source in SourceId::ALL {
            links.insert(source, store.read_rows(tables::linkage(source)).await?);
        }

        let mut subtables = BTreeMap::new();
        for group in [SubtableGroup::Ecology, SubtableGroup::HostsVectors] {
            subtables.insert(group, read_subtables(store, group).await?);
        }

        Ok(Self {
            run_id,
            species,
            index,
            links,
            first_records: store.read_rows(tables::FIRST_RECORDS).await?,
            all_records: store.read_rows(tables::ALL_RECORDS).await?,
            native_ranges: store.read_rows(tables::NATIVE_RANGES).await?,
            crosswalk: store.read_rows(tables::BIOREGION_CROSSWALK).await?,
            subtables,
        })
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub fn species_count(&self) -> usize {
        self.species.len()
    }

    /// Backbone name first, then each source's original name, then a literal key.
    pub fn key_for_name(&self, name: &str) -> Option<CanonicalKey> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        if let Some(entry) = self
            .species
            .iter()
            .find(|entry| entry.canonical_name.as_deref() == Some(name))
        {
            return Some(entry.canonical_key.clone());
        }
        for source in NAME_LOOKUP_ORDER {
            let found = self
                .source_links(source)
                .iter()
                .find(|row| row.orig_taxon == name)
                .and_then(|row| row.canonical_key.clone());
            if found.is_some() {
                return found;
            }
        }
        let looks_like_key = name.chars().all(|c| c.is_ascii_digit() || c == '.') || name.starts_with(PLACEHOLDER_PREFIX);
        if looks_like_key {
            return name.parse::<CanonicalKey>().ok().filter(|key| self.species_exists(key));
        }
        None
    }

    /// Resolves a species name or key to a key present in the species table.
    pub fn resolve(&self, name_or_key: &str) -> Result<CanonicalKey, QueryError> {
        self.key_for_name(name_or_key)
            .ok_or_else(|| QueryError::UnknownSpecies(name_or_key.to_string()))
    }

    pub fn name_for_key(&self, key: &CanonicalKey) -> Option<String> {
        let entry = self.entry(key)?;
        Some(self.display_name(entry))
    }

    pub fn list_species(&self) -> Vec<SpeciesListing> {
        self.species
            .iter()
            .map(|entry| SpeciesListing {
                key: entry.canonical_key.clone(),
                name: self.display_name(entry),
            })
            .collect()
    }

    pub fn species_exists(&self, key: &CanonicalKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn species_entry(&self, key: &CanonicalKey) -> Option<&CanonicalSpeciesEntry> {
        self.entry(key)
    }

    pub fn first_introductions(&self, key: &CanonicalKey, options: IntroductionOptions) -> Vec<OccurrenceRecord> {
        self.introductions(&self.first_records, key, options)
    }

    pub fn all_introductions(&self, key: &CanonicalKey, options: IntroductionOptions) -> Vec<OccurrenceRecord> {
        self.introductions(&self.all_records, key, options)
    }

    pub fn native_ranges(&self, key: &CanonicalKey) -> NativeRangeReport {
        NativeRangeReport {
            records: self.native_records(key).cloned().collect(),
            ranges: self
                .native_ranges
                .iter()
                .filter(|row| &row.canonical_key == key)
                .cloned()
                .collect(),
        }
    }

    /// Per ISO3: the bioregion crosswalk decides first, then a flagged record for that country overrides it.
    pub fn native_status(&self, key: &CanonicalKey, iso3s: &[String]) -> Result<Vec<NativeStatus>, QueryError> {
        let codes = iso3s
            .iter()
            .map(|code| {
                let code = code.trim();
                if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
                    Ok(code.to_ascii_uppercase())
                } else {
                    Err(QueryError::InvalidIso3(code.to_string()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.status_for_codes(key, &codes))
    }

    pub fn ecology(&self, key: &CanonicalKey) -> BTreeMap<String, Vec<SubtableRow>> {
        self.subtable_rows(SubtableGroup::Ecology, key)
    }

    pub fn hosts_and_vectors(&self, key: &CanonicalKey) -> BTreeMap<String, Vec<SubtableRow>> {
        self.subtable_rows(SubtableGroup::HostsVectors, key)
    }

    pub fn species_by_taxonomy(&self, filter: &TaxonomyFilter) -> Vec<CanonicalKey> {
        self.species
            .iter()
            .filter(|entry| filter.accepts(entry))
            .map(|entry| entry.canonical_key.clone())
            .collect()
    }

    fn entry(&self, key: &CanonicalKey) -> Option<&CanonicalSpeciesEntry> {
        self.index.get(key).map(|&i| &self.species[i])
    }

    fn source_links(&self, source: SourceId) -> &[LinkageRow] {
        self.links.get(&source).map(Vec::as_slice).unwrap_or_default()
    }

    fn display_name(&self, entry: &CanonicalSpeciesEntry) -> String {
        let species_level = entry
            .rank
            .as_deref()
            .is_some_and(|rank| SPECIES_LEVEL_RANKS.iter().any(|r| r.eq_ignore_ascii_case(rank)));
        if species_level {
            if let Some(name) = &entry.canonical_name {
                return name.clone();
            }
        }
        DISPLAY_NAME_ORDER
            .iter()
            .find_map(|&source| {
                self.source_links(source)
                    .iter()
                    .find(|row| row.canonical_key.as_ref() == Some(&entry.canonical_key))
                    .map(|row| row.orig_taxon.clone())
            })
            .or_else(|| entry.canonical_name.clone())
            .unwrap_or_else(|| entry.canonical_key.to_string())
    }

    fn native_records<'a>(&'a self, key: &'a CanonicalKey) -> impl Iterator<Item = &'a OccurrenceRecord> + 'a {
        self.all_records.iter().filter(move |row| {
            &row.canonical_key == key && row.native != Nativity::Unknown && row.source != ORIGINAL_SOURCE_LABEL
        })
    }

    fn status_for_codes(&self, key: &CanonicalKey, codes: &[String]) -> Vec<NativeStatus> {
        let bioregions = self
            .native_ranges
            .iter()
            .filter(|row| &row.canonical_key == key)
            .map(|row| row.bioregion.as_str())
            .collect::<BTreeSet<_>>();

        codes
            .iter()
            .map(|iso3| {
                let mut native = Nativity::Unknown;
                let mut evidence = StatusEvidence::Unavailable;
                if !bioregions.is_empty() {
                    for row in self.crosswalk.iter().filter(|row| row.iso3.trim() == iso3.as_str()) {
                        evidence = StatusEvidence::Bioregion;
                        if bioregions.contains(row.bioregion.trim()) {
                            native = Nativity::Native;
                            break;
                        }
                        native = Nativity::Introduced;
                    }
                }
                if let Some(record) = self.native_records(key).find(|row| row.location.as_str() == iso3.as_str()) {
                    native = record.native;
                    evidence = StatusEvidence::Records;
                }
                NativeStatus {
                    iso3: iso3.clone(),
                    native,
                    evidence,
                }
            })
            .collect()
    }

    fn introductions(
        &self,
        rows: &[OccurrenceRecord],
        key: &CanonicalKey,
        options: IntroductionOptions,
    ) -> Vec<OccurrenceRecord> {
        let mut selected = rows
            .iter()
            .filter(|row| &row.canonical_key == key && !row.location.is_reserved())
            .filter(|row| !options.iso3_only || row.location.is_iso3())
            .cloned()
            .collect::<Vec<_>>();

        if options.native_inference {
            let codes = selected
                .iter()
                .filter(|row| row.location.is_iso3())
                .map(|row| row.location.as_str().to_string())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect::<Vec<_>>();
            let inferred = self
                .status_for_codes(key, &codes)
                .into_iter()
                .filter(|status| status.native != Nativity::Unknown)
                .map(|status| (status.iso3, status.native))
                .collect::<HashMap<_, _>>();
            for row in &mut selected {
                if let Some(native) = inferred.get(row.location.as_str()) {
                    row.native = *native;
                }
            }
        }
        selected
    }

    fn subtable_rows(&self, group: SubtableGroup, key: &CanonicalKey) -> BTreeMap<String, Vec<SubtableRow>> {
        let Some(named) = self.subtables.get(&group) else {
            return BTreeMap::new();
        };
        named
            .iter()
            .filter_map(|(name, rows)| {
                let matching = rows
                    .iter()
                    .filter(|row| {
                        row.get(SUBTABLE_KEY_COLUMN)
                            .and_then(|value| value.parse::<CanonicalKey>().ok())
                            .as_ref()
                            == Some(key)
                    })
                    .cloned()
                    .collect::<Vec<_>>();
                (!matching.is_empty()).then(|| (name.clone(), matching))
            })
            .collect()
    }
}

async fn read_run_id(store: &TableStore) -> Result<Option<String>> {
    let marker: Option<RunMarker> = store.read_json(tables::RUN_STATE).await?;
    Ok(marker.unwrap_or_default().last_run_id)
}

async fn read_subtables(store: &TableStore, group: SubtableGroup) -> Result<BTreeMap<String, Vec<SubtableRow>>> {
    let dir = store.path_for(tables::subtable_dir(group));
    let mut named = BTreeMap::new();
    let mut entries = match fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(named),
        Err(err) => return Err(err).with_context(|| format!("listing {}", dir.display())),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("listing {}", dir.display()))?
    {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("csv") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|stem| stem.to_str()).map(str::to_string) else {
            continue;
        };
        let rows: Vec<SubtableRow> = store.read_rows(tables::subtable(group, &name)).await?;
        named.insert(name, rows);
    }
    Ok(named)
}

/// Cached snapshot of the data directory. A snapshot is reused until the run id in
/// `state.json` changes or [`QueryLayer::invalidate`] is called.
#[derive(Debug)]
pub struct QueryLayer {
    store: TableStore,
    cached: RwLock<Option<Arc<QuerySnapshot>>>,
}

impl QueryLayer {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            store: TableStore::new(data_dir),
            cached: RwLock::new(None),
        }
    }

    pub fn data_dir(&self) -> &Path {
        self.store.root()
    }

    /// Reads every table from disk and replaces the cached snapshot.
    pub async fn load(&self) -> Result<Arc<QuerySnapshot>, QueryError> {
        let snapshot = QuerySnapshot::read(&self.store)
            .await
            .map_err(|err| QueryError::Load(format!("{err:#}")))?;
        let snapshot = Arc::new(snapshot);
        info!(
            data_dir = %self.store.root().display(),
            run_id = snapshot.run_id().unwrap_or("none"),
            species = snapshot.species_count(),
            "query snapshot loaded"
        );
        *self.cached.write().await = Some(snapshot.clone());
        Ok(snapshot)
    }

    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    pub async fn snapshot(&self) -> Result<Arc<QuerySnapshot>, QueryError> {
        let current = read_run_id(&self.store)
            .await
            .map_err(|err| QueryError::Load(format!("{err:#}")))?;
        if let Some(snapshot) = self.cached.read().await.as_ref() {
            if snapshot.run_id == current {
                return Ok(snapshot.clone());
            }
        }
        self.load().await
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn key(text: &str) -> CanonicalKey {
        text.parse().expect("key")
    }

    async fn snapshot() -> (tempfile::TempDir, Arc<QuerySnapshot>) {
        let dir = data_dir().await;
        let layer = QueryLayer::new(dir.path());
        let snapshot = layer.load().await.expect("load");
        (dir, snapshot)
    }

    #[tokio::test]
    async fn names_resolve_through_backbone_links_and_literal_keys() {
        let (_dir, snap) = snapshot().await;
        assert_eq!(snap.key_for_name("Foo bar"), Some(key("100")));
        assert_eq!(snap.key_for_name("Foo barus"), Some(key("100")));
        assert_eq!(snap.key_for_name("Bazus sp."), Some(key("200")));
        assert_eq!(snap.key_for_name("100"), Some(key("100")));
        assert_eq!(snap.key_for_name("XXASFQux_quux"), Some(key("XXASFQux_quux")));
        assert_eq!(snap.key_for_name("999"), None);
        assert_eq!(snap.key_for_name("Pending name"), None);
        assert!(matches!(snap.resolve("Nope"), Err(QueryError::UnknownSpecies(_))));
    }

    #[tokio::test]
    async fn display_names_prefer_species_level_backbone_names() {
        let (_dir, snap) = snapshot().await;
        assert_eq!(snap.name_for_key(&key("100")).as_deref(), Some("Foo bar"));
        assert_eq!(snap.name_for_key(&key("200")).as_deref(), Some("Bazus sp."));
        assert_eq!(snap.name_for_key(&key("XXASFQux_quux")).as_deref(), Some("Qux quux"));
        assert_eq!(snap.name_for_key(&key("300")), None);

        let listed = snap.list_species();
        assert_eq!(listed.len(), 3);
        assert!(snap.species_exists(&key("200")));
        assert!(!snap.species_exists(&key("300")));
    }

    #[tokio::test]
    async fn native_status_combines_crosswalk_and_records() {
        let (_dir, snap) = snapshot().await;
        let codes = ["fra", "ESP", "USA", "DEU"].map(str::to_string);
        let status = snap.native_status(&key("100"), &codes).expect("status");

        let by_code = status
            .iter()
            .map(|s| (s.iso3.as_str(), (s.native, s.evidence)))
            .collect::<HashMap<_, _>>();
        assert_eq!(by_code["FRA"], (Nativity::Introduced, StatusEvidence::Records));
        assert_eq!(by_code["ESP"], (Nativity::Native, StatusEvidence::Bioregion));
        // the "Original" row for USA does not count
        assert_eq!(by_code["USA"], (Nativity::Introduced, StatusEvidence::Bioregion));
        assert_eq!(by_code["DEU"], (Nativity::Unknown, StatusEvidence::Unavailable));

        assert!(matches!(
            snap.native_status(&key("100"), &["FR".to_string()]),
            Err(QueryError::InvalidIso3(_))
        ));
    }

    #[tokio::test]
    async fn taxa_without_native_ranges_only_use_records() {
        let (_dir, snap) = snapshot().await;
        let status = snap
            .native_status(&key("200"), &["USA".to_string(), "CAN".to_string()])
            .expect("status");
        assert_eq!(status[0].native, Nativity::Introduced);
        assert_eq!(status[0].evidence, StatusEvidence::Records);
        assert_eq!(status[1].native, Nativity::Unknown);
    }

    #[tokio::test]
    async fn first_introductions_drop_reserved_codes_and_infer_nativity() {
        let (_dir, snap) = snapshot().await;
        let rows = snap.first_introductions(&key("100"), IntroductionOptions::first_introductions());
        let locations = rows.iter().map(|r| r.location.as_str()).collect::<Vec<_>>();
        assert_eq!(locations, vec!["FRA", "ESP", "Palearctic"]);
        assert_eq!(rows[1].native, Nativity::Native);

        let raw = snap.first_introductions(
            &key("100"),
            IntroductionOptions {
                iso3_only: true,
                native_inference: false,
            },
        );
        assert_eq!(raw.len(), 2);
        assert_eq!(raw[1].native, Nativity::Unknown);
    }

    #[tokio::test]
    async fn all_introductions_default_to_iso3_rows() {
        let (_dir, snap) = snapshot().await;
        let rows = snap.all_introductions(&key("100"), IntroductionOptions::all_introductions());
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.location.is_iso3()));
    }

    #[tokio::test]
    async fn native_ranges_exclude_original_records() {
        let (_dir, snap) = snapshot().await;
        let report = snap.native_ranges(&key("100"));
        assert_eq!(report.ranges.len(), 1);
        assert!(report.records.iter().all(|r| r.source != "Original"));
        assert_eq!(report.records.len(), 2);
    }

    #[tokio::test]
    async fn subtables_are_grouped_by_name_and_empty_ones_omitted() {
        let (_dir, snap) = snapshot().await;
        let ecology = snap.ecology(&key("100"));
        assert_eq!(ecology.keys().collect::<Vec<_>>(), vec!["cabi_rainfall"]);
        assert_eq!(ecology["cabi_rainfall"][0]["max"], "900");

        let hosts = snap.hosts_and_vectors(&key("100"));
        assert_eq!(hosts["cabi_hosts"].len(), 2);
        assert!(snap.hosts_and_vectors(&key("200")).is_empty());
        assert_eq!(snap.ecology(&key("200")).len(), 2);
    }

    #[tokio::test]
    async fn taxonomy_filter_matches_every_given_rank() {
        let (_dir, snap) = snapshot().await;
        let plants = TaxonomyFilter {
            kingdom: Some("Plantae".to_string()),
            family: Some("Fooaceae".to_string()),
            ..TaxonomyFilter::default()
        };
        assert_eq!(snap.species_by_taxonomy(&plants), vec![key("100")]);
        assert_eq!(snap.species_by_taxonomy(&TaxonomyFilter::default()).len(), 3);
        let none = TaxonomyFilter {
            genus: Some("Nothing".to_string()),
            ..TaxonomyFilter::default()
        };
        assert!(snap.species_by_taxonomy(&none).is_empty());
    }

    #[tokio::test]
    async fn snapshot_reloads_when_a_new_run_lands() {
        let dir = data_dir().await;
        let layer = QueryLayer::new(dir.path());
        let first = layer.snapshot().await.expect("snapshot");
        assert_eq!(first.run_id(), Some("run-1"));
        let again = layer.snapshot().await.expect("snapshot");
        assert!(Arc::ptr_eq(&first, &again));

        let store = TableStore::new(dir.path());
        store
            .write_table(tables::SPECIES, &[species("100", Some("Foo bar"), "SPECIES", "Plantae")])
            .await
            .expect("species");
        store
            .write_bytes(tables::RUN_STATE, br#"{"last_run_id":"run-2"}"#)
            .await
            .expect("state");
        let reloaded = layer.snapshot().await.expect("snapshot");
        assert_eq!(reloaded.run_id(), Some("run-2"));
        assert_eq!(reloaded.species_count(), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_a_fresh_read() {
        let dir = data_dir().await;
        let layer = QueryLayer::new(dir.path());
        let first = layer.snapshot().await.expect("snapshot");
        layer.invalidate().await;
        let second = layer.snapshot().await.expect("snapshot");
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn empty_data_dir_is_an_empty_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layer = QueryLayer::new(dir.path());
        let snap = layer.snapshot().await.expect("snapshot");
        assert_eq!(snap.species_count(), 0);
        assert!(snap.run_id().is_none());
    }
}
