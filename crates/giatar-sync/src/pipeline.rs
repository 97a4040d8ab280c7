//! One sync run as a chain of typed stages.
//!
//! normalize -> match -> key -> locate -> consolidate -> persist. Each stage
//! consumes the previous stage's output. A structural failure in one source
//! stops that source only; everything else finishes and is reported.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use giatar_core::{
    tables, CanonicalKey, CanonicalSpeciesEntry, FirstRecordEntry, LinkageRow, LocationCode, MatchStatus,
    NativeRangeEntry, Nativity, OccurrenceRecord, ReviewEntry, SourceId, UnmatchedLocation,
};
use giatar_sources::cabi::normalize_datasheet_types;
use giatar_sources::native::{normalize_native_ranges, NativeRangeRow};
use giatar_sources::{normalizer_for_source, NormalizeError, NormalizedTaxon, SourceExport, SourceOccurrence, TaxonLink};
use giatar_storage::TableStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{PipelineConfig, SourceConfig, SourceRegistry};
use crate::consolidate::{
    arbitrate_first_records, assemble_all_records, build_species_table, included_keys, InclusionEvidence,
};
use crate::export::{export_parquet_snapshots, RunState};
use crate::geo::{CountryExceptions, CountryTable, GeoNormalizer, GeoStats};
use crate::matcher::{MatchOutcome, NameMatcher};
use crate::occurrence::{fetch_backbone_first_records, merge_by_min, plan_occurrence_requests, to_source_occurrences, BackboneFirstRecord};
use crate::promote::{promote_with_registry, promotions_from};
use crate::registry::{KeyRegistry, Registration};
use crate::services::{EppoClient, GbifClient, OccurrenceService, RegulatoryService, TaxonomyService};
use crate::subtables::refresh_subtables;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("normalizing {origin}: {error}")]
    Normalize {
        origin: SourceId,
        #[source]
        error: NormalizeError,
    },
    #[error("reading {origin} export {path}: {reason}")]
    Export {
        origin: SourceId,
        path: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceRunStats {
    pub species_rows: usize,
    pub occurrence_rows: usize,
    pub rejected: usize,
    pub dropped: usize,
    pub matched: usize,
    pub placeholders: usize,
    pub deferred: usize,
    pub newly_added: usize,
    pub reconciled: usize,
    /// Archive paths of this run's raw exports, relative to the data dir.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub archived: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: BTreeMap<SourceId, SourceRunStats>,
    pub species: usize,
    pub first_records: usize,
    pub all_records: usize,
    pub native_ranges: usize,
    pub unmatched_locations: usize,
    pub needs_review: usize,
    pub promotions: usize,
    pub occurrence_requests: usize,
    pub occurrence_failures: usize,
    pub categorization_pending: usize,
    pub unkeyed_occurrences: usize,
    pub geo: GeoStats,
    pub subtables_dropped: BTreeMap<String, usize>,
    /// Failures of stages that are not tied to one source.
    pub stage_errors: Vec<String>,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

/// Persisted regulatory categorization, one row per code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorizationRow {
    pub code: String,
    pub categorized: bool,
}

pub struct NormalizedSource {
    pub source: SourceId,
    pub taxa: Vec<NormalizedTaxon>,
    pub occurrences: Vec<SourceOccurrence>,
}

#[derive(Default)]
pub struct NormalizedSources {
    pub sources: Vec<NormalizedSource>,
    pub native_ranges: Vec<NativeRangeRow>,
    pub cabi_datasheet_types: BTreeMap<String, Vec<String>>,
}

pub struct MatchedSources {
    pub occurrences: Vec<SourceOccurrence>,
    pub native_ranges: Vec<NativeRangeRow>,
    pub cabi_datasheet_types: BTreeMap<String, Vec<String>>,
    /// Placeholder keys superseded this run, old to new.
    pub promotions: BTreeMap<CanonicalKey, CanonicalKey>,
    /// Backbone keys that need their full occurrence history.
    pub newly_keyed: BTreeSet<CanonicalKey>,
}

pub struct KeyedOccurrences {
    pub species: Vec<CanonicalSpeciesEntry>,
    pub occurrences: Vec<(CanonicalKey, SourceOccurrence)>,
    pub native_ranges: Vec<NativeRangeRow>,
    /// Rows whose taxon link resolved to no key.
    pub unkeyed: usize,
    /// Rows keyed to a taxon outside the species table.
    pub excluded: usize,
}

pub struct LocatedOccurrences {
    pub species: Vec<CanonicalSpeciesEntry>,
    pub records: Vec<OccurrenceRecord>,
    pub unmatched: Vec<UnmatchedLocation>,
    pub native_ranges: Vec<NativeRangeEntry>,
    pub sub_national: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ConsolidatedTables {
    pub species: Vec<CanonicalSpeciesEntry>,
    pub first_records: Vec<FirstRecordEntry>,
    pub all_records: Vec<OccurrenceRecord>,
    pub native_ranges: Vec<NativeRangeEntry>,
    pub unmatched_locations: Vec<UnmatchedLocation>,
    pub review: Vec<ReviewEntry>,
}

fn base_row(taxon: &NormalizedTaxon, existing: Option<&LinkageRow>, today: NaiveDate) -> LinkageRow {
    LinkageRow {
        source_local_code: taxon.local_code.clone(),
        orig_taxon: taxon.orig_taxon.clone(),
        canonical_key: None,
        match_status: MatchStatus::Unmatched,
        match_type: None,
        canonical_name: None,
        rank: None,
        kingdom: None,
        phylum: None,
        class: None,
        order: None,
        family: None,
        genus: None,
        is_new: existing.map_or(true, |r| r.is_new),
        date_stamp: existing.map_or(today, |r| r.date_stamp),
    }
}

fn linkage_row(taxon: &NormalizedTaxon, outcome: MatchOutcome, existing: Option<&LinkageRow>, today: NaiveDate) -> LinkageRow {
    let mut row = base_row(taxon, existing, today);
    match outcome {
        MatchOutcome::Matched(found) => {
            row.canonical_key = Some(found.canonical_key);
            row.match_status = found.status;
            row.match_type = Some(found.match_type);
            row.canonical_name = found.canonical_name;
            row.rank = found.rank;
            row.set_lineage(found.lineage);
            row.date_stamp = today;
        }
        MatchOutcome::Unmatched { status, match_type } => {
            row.canonical_key = Some(CanonicalKey::placeholder(taxon.source, &taxon.orig_taxon));
            row.match_status = status;
            row.match_type = Some(match_type);
        }
    }
    row
}

/// Keys that moved during one matching pass.
#[derive(Debug, Default)]
pub struct TaxaMatch {
    /// (previous, current) for every reconciled code.
    pub reconciled: Vec<(CanonicalKey, CanonicalKey)>,
    /// Backbone keys gained this run, by new codes and by codes that were unkeyed or placeholders.
    pub newly_keyed: BTreeSet<CanonicalKey>,
}

/// Match every taxon that has no backbone key yet and record the result.
pub async fn match_taxa(
    matcher: &mut NameMatcher,
    registry: &mut KeyRegistry,
    taxa: &[NormalizedTaxon],
    today: NaiveDate,
    stats: &mut SourceRunStats,
) -> TaxaMatch {
    let mut out = TaxaMatch::default();
    for taxon in taxa {
        let existing = registry.get(taxon.source, &taxon.local_code).cloned();
        if existing.as_ref().is_some_and(|r| r.has_backbone_key()) {
            stats.matched += 1;
            continue;
        }

        let row = match matcher.match_name(&taxon.orig_taxon).await {
            Ok(outcome) => linkage_row(taxon, outcome, existing.as_ref(), today),
            Err(err) => {
                stats.deferred += 1;
                warn!(source = %taxon.source, code = %taxon.local_code, error = %err, "taxon deferred to next run");
                if existing.is_some() {
                    continue;
                }
                base_row(taxon, None, today)
            }
        };

        if row.has_backbone_key() {
            stats.matched += 1;
            out.newly_keyed.extend(row.canonical_key.clone());
        } else if row.canonical_key.is_some() {
            stats.placeholders += 1;
        }
        let current = row.canonical_key.clone();
        match registry.record(taxon.source, row) {
            Registration::Inserted => stats.newly_added += 1,
            Registration::Unchanged => {}
            Registration::Reconciled { previous } => {
                stats.reconciled += 1;
                if let (Some(previous), Some(current)) = (previous, current) {
                    out.reconciled.push((previous, current));
                }
            }
        }
    }
    out
}

/// Query the regulatory service for new codes and codes never answered; persist the union.
/// Returns the known categorizations and the number still pending.
pub async fn refresh_categorization(
    store: &TableStore,
    service: Option<&dyn RegulatoryService>,
    registry: &KeyRegistry,
) -> Result<(BTreeMap<String, bool>, usize)> {
    let persisted: Vec<CategorizationRow> = store.read_rows(tables::EPPO_CATEGORIZATION).await?;
    let mut known = persisted
        .into_iter()
        .map(|row| (row.code, row.categorized))
        .collect::<BTreeMap<_, _>>();

    let due = registry
        .rows(SourceId::Eppo)
        .filter(|row| row.is_new || !known.contains_key(&row.source_local_code))
        .map(|row| row.source_local_code.clone())
        .collect::<Vec<_>>();

    let Some(service) = service else {
        if !due.is_empty() {
            info!(pending = due.len(), "no regulatory token; categorization refresh skipped");
        }
        return Ok((known, due.len()));
    };

    let mut pending = 0;
    for code in due {
        match service.is_categorized(&code).await {
            Ok(flag) => {
                known.insert(code, flag);
            }
            Err(err) => {
                pending += 1;
                warn!(code = %code, error = %err, "categorization left pending");
            }
        }
    }

    let rows = known
        .iter()
        .map(|(code, categorized)| CategorizationRow {
            code: code.clone(),
            categorized: *categorized,
        })
        .collect::<Vec<_>>();
    store.write_table(tables::EPPO_CATEGORIZATION, &rows).await?;
    Ok((known, pending))
}

/// Attach canonical keys to occurrences; keep only taxa in the species table.
pub fn key_occurrences(
    species: Vec<CanonicalSpeciesEntry>,
    occurrences: Vec<SourceOccurrence>,
    native_ranges: Vec<NativeRangeRow>,
    registry: &KeyRegistry,
) -> KeyedOccurrences {
    let included = included_keys(&species);
    let mut keyed = Vec::new();
    let mut unkeyed = 0;
    let mut excluded = 0;
    for occurrence in occurrences {
        let key = match &occurrence.taxon {
            TaxonLink::Local { source, code } => registry.resolve(*source, code).cloned(),
            TaxonLink::Canonical(key) => Some(key.clone()),
        };
        match key {
            Some(key) if included.contains(&key) => keyed.push((key, occurrence)),
            Some(_) => excluded += 1,
            None => unkeyed += 1,
        }
    }
    let native_ranges = native_ranges
        .into_iter()
        .filter(|row| included.contains(&row.canonical_key))
        .collect();
    KeyedOccurrences {
        species,
        occurrences: keyed,
        native_ranges,
        unkeyed,
        excluded,
    }
}

/// Resolve every location to ISO3. Multi-country names explode into one row per
/// code; unresolved occurrences go to the unmatched bucket; unresolved native
/// ranges keep their bioregion.
pub fn locate(keyed: KeyedOccurrences, geo: &mut GeoNormalizer) -> LocatedOccurrences {
    let mut records = Vec::new();
    let mut unmatched = Vec::new();
    let mut sub_national = 0;
    for (key, occurrence) in keyed.occurrences {
        if occurrence.location.text.trim_start().starts_with('-') {
            sub_national += 1;
            continue;
        }
        let resolution = geo.resolve_hint(&occurrence.location);
        if resolution.is_unmatched() {
            unmatched.push(UnmatchedLocation {
                canonical_key: key,
                location_text: occurrence.location.text,
                year: occurrence.year,
                record_type: occurrence.record_type,
                source: occurrence.source_label,
                reference: occurrence.reference,
            });
            continue;
        }
        for code in resolution.codes() {
            records.push(OccurrenceRecord {
                canonical_key: key.clone(),
                location: LocationCode::Iso3(code),
                year: occurrence.year,
                record_type: occurrence.record_type,
                native: occurrence.native,
                source: occurrence.source_label.clone(),
                reference: occurrence.reference.clone(),
            });
        }
    }

    let mut native_ranges = Vec::new();
    for row in keyed.native_ranges {
        let codes = row
            .resolution_text()
            .map(|text| geo.resolve_country(text).codes())
            .unwrap_or_default();
        let locations = if codes.is_empty() {
            vec![LocationCode::Descriptor(row.bioregion.clone())]
        } else {
            codes.into_iter().map(LocationCode::Iso3).collect()
        };
        for location in locations {
            native_ranges.push(NativeRangeEntry {
                canonical_key: row.canonical_key.clone(),
                location,
                location_text: row.location_text(),
                bioregion: row.bioregion.clone(),
                native: Nativity::Native,
                source: row.source_label.clone(),
                reference: row.reference.clone(),
            });
        }
    }

    LocatedOccurrences {
        species: keyed.species,
        records,
        unmatched,
        native_ranges,
        sub_national,
    }
}

/// Every linkage row still carrying a placeholder key.
pub fn review_entries(registry: &KeyRegistry) -> Vec<ReviewEntry> {
    SourceId::ALL
        .into_iter()
        .flat_map(|source| registry.rows(source).map(move |row| (source, row)))
        .filter_map(|(source, row)| {
            let key = row.canonical_key.as_ref().filter(|k| k.is_placeholder())?;
            Some(ReviewEntry {
                source,
                orig_taxon: row.orig_taxon.clone(),
                source_local_code: row.source_local_code.clone(),
                match_status: row.match_status,
                placeholder_key: key.clone(),
            })
        })
        .collect()
}

pub fn consolidate(located: LocatedOccurrences, registry: &KeyRegistry) -> ConsolidatedTables {
    let all_records = assemble_all_records(located.records, &located.native_ranges);
    let first_records = arbitrate_first_records(&all_records);
    let mut unmatched_locations = located.unmatched;
    unmatched_locations.sort_by(|a, b| {
        (&a.canonical_key, &a.location_text, a.year).cmp(&(&b.canonical_key, &b.location_text, b.year))
    });
    unmatched_locations.dedup();
    ConsolidatedTables {
        species: located.species,
        first_records,
        all_records,
        native_ranges: located.native_ranges,
        unmatched_locations,
        review: review_entries(registry),
    }
}

pub struct SyncPipeline {
    config: PipelineConfig,
    store: TableStore,
    taxonomy: Arc<dyn TaxonomyService>,
    occurrences: Arc<dyn OccurrenceService>,
    regulatory: Option<Arc<dyn RegulatoryService>>,
}

impl SyncPipeline {
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let http = config.http_client_config();
        let backbone = Arc::new(GbifClient::new(config.gbif_api_url.clone(), http.clone())?);
        let regulatory = match &config.eppo_token {
            Some(token) => Some(Arc::new(EppoClient::new(config.eppo_api_url.clone(), token.clone(), http)?)
                as Arc<dyn RegulatoryService>),
            None => None,
        };
        Ok(Self::with_services(config, backbone.clone(), backbone, regulatory))
    }

    pub fn with_services(
        config: PipelineConfig,
        taxonomy: Arc<dyn TaxonomyService>,
        occurrences: Arc<dyn OccurrenceService>,
        regulatory: Option<Arc<dyn RegulatoryService>>,
    ) -> Self {
        let store = TableStore::new(config.data_dir.clone());
        Self {
            config,
            store,
            taxonomy,
            occurrences,
            regulatory,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &TableStore {
        &self.store
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let today = started_at.date_naive();
        info!(%run_id, "sync run started");

        let sources = SourceRegistry::load(&self.config.workspace_root).await?;
        let mut registry = KeyRegistry::load(&self.store).await?;
        registry.age_rows();
        let state = RunState::load(&self.store).await?;
        let mut stats: BTreeMap<SourceId, SourceRunStats> = BTreeMap::new();
        let mut stage_errors = Vec::new();

        let normalized = self
            .normalize(&sources, started_at, &mut stats, &mut stage_errors)
            .instrument(info_span!("normalize"))
            .await;

        let matched = self
            .match_sources(normalized, &mut registry, today, &mut stats)
            .instrument(info_span!("match"))
            .await;
        for (old, new) in &matched.promotions {
            promote_with_registry(&self.store, &mut registry, old, new).await?;
        }

        let (eppo_categorized, categorization_pending) =
            refresh_categorization(&self.store, self.regulatory.as_deref(), &registry)
                .instrument(info_span!("categorization"))
                .await?;
        let evidence = InclusionEvidence {
            cabi_datasheet_types: matched.cabi_datasheet_types,
            eppo_categorized,
        };
        let species = build_species_table(&registry, &evidence);

        let fresh = registry
            .all_rows()
            .filter(|row| row.is_new)
            .filter_map(|row| row.canonical_key.clone())
            .chain(matched.promotions.values().cloned())
            .chain(matched.newly_keyed.iter().cloned())
            .collect::<BTreeSet<_>>();
        let requests = plan_occurrence_requests(
            &species,
            &fresh,
            &state.pending_occurrence_requests,
            state.last_occurrence_update,
            today,
            self.config.base_obs_year,
        );
        let fetch = fetch_backbone_first_records(self.occurrences.as_ref(), &requests)
            .instrument(info_span!("occurrences", requests = requests.len()))
            .await;
        let history: Vec<BackboneFirstRecord> = self.store.read_rows(tables::BACKBONE_FIRST_RECORDS).await?;
        let backbone_records = merge_by_min(history, fetch.records);
        self.store
            .write_table(tables::BACKBONE_FIRST_RECORDS, &backbone_records)
            .await?;

        let mut occurrences = matched.occurrences;
        occurrences.extend(to_source_occurrences(&backbone_records));
        let keyed = key_occurrences(species, occurrences, matched.native_ranges, &registry);
        let unkeyed_occurrences = keyed.unkeyed;

        let mut geo = GeoNormalizer::new(
            CountryTable::embedded()?,
            CountryExceptions::from_workspace_root(&self.config.workspace_root)?,
        );
        let located = {
            let _span = info_span!("locate").entered();
            locate(keyed, &mut geo)
        };
        let consolidated = consolidate(located, &registry);

        self.persist(&registry, &consolidated).await?;
        if let Some(path) = &sources.bioregion_crosswalk {
            if let Err(err) = self.copy_crosswalk(path).await {
                warn!(error = %format!("{err:#}"), "bioregion crosswalk not copied");
                stage_errors.push(format!("bioregion crosswalk: {err:#}"));
            }
        }
        let subtables_dropped = match refresh_subtables(
            &sources.subtables,
            |config| self.config.resolve(&config.path),
            &registry,
            &self.store,
        )
        .instrument(info_span!("subtables"))
        .await
        {
            Ok(dropped) => dropped.into_iter().collect(),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "sub-table keying failed");
                stage_errors.push(format!("sub-tables: {err:#}"));
                BTreeMap::new()
            }
        };

        let reports_dir = self.config.reports_root().join(run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;
        let manifest_path = export_parquet_snapshots(
            &reports_dir,
            &consolidated.species,
            &consolidated.first_records,
            &consolidated.all_records,
            &consolidated.native_ranges,
        )
        .await?;

        let finished_at = Utc::now();
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            sources: stats,
            species: consolidated.species.len(),
            first_records: consolidated.first_records.len(),
            all_records: consolidated.all_records.len(),
            native_ranges: consolidated.native_ranges.len(),
            unmatched_locations: consolidated.unmatched_locations.len(),
            needs_review: consolidated.review.len(),
            promotions: matched.promotions.len(),
            occurrence_requests: fetch.requests,
            occurrence_failures: fetch.failed.len(),
            categorization_pending,
            unkeyed_occurrences,
            geo: geo.stats(),
            subtables_dropped,
            stage_errors,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        };
        write_reports(&reports_dir, &summary).await?;

        RunState {
            last_occurrence_update: Some(today),
            last_run_id: Some(run_id),
            last_run_at: Some(finished_at),
            pending_occurrence_requests: fetch.failed,
        }
        .save(&self.store)
        .await?;

        info!(
            %run_id,
            species = summary.species,
            first_records = summary.first_records,
            needs_review = summary.needs_review,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn normalize(
        &self,
        sources: &SourceRegistry,
        fetched_at: DateTime<Utc>,
        stats: &mut BTreeMap<SourceId, SourceRunStats>,
        stage_errors: &mut Vec<String>,
    ) -> NormalizedSources {
        let mut out = NormalizedSources::default();
        for config in sources.enabled() {
            let entry = stats.entry(config.source).or_default();
            match self.normalize_source(config, fetched_at, entry).await {
                Ok((normalized, datasheet_types)) => {
                    out.sources.push(normalized);
                    if let Some(types) = datasheet_types {
                        out.cabi_datasheet_types = types;
                    }
                }
                Err(err) => {
                    warn!(source = %config.source, error = %err, "source stage aborted");
                    entry.error = Some(err.to_string());
                }
            }
        }

        if let Some(path) = &sources.native_ranges {
            let path = self.config.resolve(path);
            match SourceExport::load(&path).map(|export| normalize_native_ranges(&export)) {
                Ok(Ok(normalized)) => {
                    info!(rows = normalized.rows.len(), rejected = normalized.rejected, "native ranges normalized");
                    out.native_ranges = normalized.rows;
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "native ranges skipped");
                    stage_errors.push(format!("native ranges: {err}"));
                }
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "native ranges skipped");
                    stage_errors.push(format!("native ranges: {err:#}"));
                }
            }
        }
        out
    }

    async fn normalize_source(
        &self,
        config: &SourceConfig,
        fetched_at: DateTime<Utc>,
        stats: &mut SourceRunStats,
    ) -> Result<(NormalizedSource, Option<BTreeMap<String, Vec<String>>>), PipelineError> {
        let origin = config.source;
        let normalizer = normalizer_for_source(origin);
        let normalize_err = |error: NormalizeError| PipelineError::Normalize { origin, error };

        let export = self.load_export(origin, &config.species_export, fetched_at, stats).await?;
        let species = normalizer.normalize_species(&export).map_err(normalize_err)?;
        stats.species_rows = species.rows.len();
        stats.rejected += species.rejected;
        stats.dropped += species.dropped;

        let mut occurrences = Vec::new();
        for feed in &config.feeds {
            let export = self.load_export(origin, &feed.path, fetched_at, stats).await?;
            let normalized = normalizer.normalize_feed(feed.kind, &export).map_err(normalize_err)?;
            stats.rejected += normalized.rejected;
            stats.dropped += normalized.dropped;
            occurrences.extend(normalized.rows);
        }
        stats.occurrence_rows = occurrences.len();

        let datasheet_types = match &config.datasheet_types {
            Some(path) => {
                let export = self.load_export(origin, path, fetched_at, stats).await?;
                Some(normalize_datasheet_types(&export).map_err(normalize_err)?)
            }
            None => None,
        };

        info!(
            source = %origin,
            species = stats.species_rows,
            occurrences = stats.occurrence_rows,
            rejected = stats.rejected,
            "source normalized"
        );
        Ok((
            NormalizedSource {
                source: origin,
                taxa: species.rows,
                occurrences,
            },
            datasheet_types,
        ))
    }

    /// Read one export and archive its bytes for this run.
    async fn load_export(
        &self,
        origin: SourceId,
        path: &Path,
        fetched_at: DateTime<Utc>,
        stats: &mut SourceRunStats,
    ) -> Result<SourceExport, PipelineError> {
        let path = self.config.resolve(path);
        let export = SourceExport::load(&path).map_err(|err| PipelineError::Export {
            origin,
            path: path.display().to_string(),
            reason: format!("{err:#}"),
        })?;
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("csv");
        match self
            .store
            .store_bytes(fetched_at, origin.slug(), extension, &export.bytes)
            .await
        {
            Ok(artifact) => {
                info!(
                    source = %origin,
                    path = %artifact.relative_path.display(),
                    bytes = artifact.byte_size,
                    deduplicated = artifact.deduplicated,
                    "raw export archived"
                );
                let path = artifact.relative_path.display().to_string();
                if !stats.archived.contains(&path) {
                    stats.archived.push(path);
                }
            }
            Err(err) => warn!(source = %origin, error = %format!("{err:#}"), "raw export not archived"),
        }
        Ok(export)
    }

    async fn match_sources(
        &self,
        normalized: NormalizedSources,
        registry: &mut KeyRegistry,
        today: NaiveDate,
        stats: &mut BTreeMap<SourceId, SourceRunStats>,
    ) -> MatchedSources {
        let mut matcher = NameMatcher::new(self.taxonomy.clone());
        let mut reconciled = Vec::new();
        let mut newly_keyed = BTreeSet::new();
        let mut occurrences = Vec::new();
        for source in normalized.sources {
            let entry = stats.entry(source.source).or_default();
            let matched = match_taxa(&mut matcher, registry, &source.taxa, today, entry).await;
            reconciled.extend(matched.reconciled);
            newly_keyed.extend(matched.newly_keyed);
            info!(
                source = %source.source,
                matched = entry.matched,
                placeholders = entry.placeholders,
                deferred = entry.deferred,
                newly_added = entry.newly_added,
                "source matched"
            );
            occurrences.extend(source.occurrences);
        }
        info!(queries = matcher.queries(), "name matching finished");
        MatchedSources {
            occurrences,
            native_ranges: normalized.native_ranges,
            cabi_datasheet_types: normalized.cabi_datasheet_types,
            promotions: promotions_from(&reconciled),
            newly_keyed,
        }
    }

    async fn persist(&self, registry: &KeyRegistry, consolidated: &ConsolidatedTables) -> Result<()> {
        registry.persist(&self.store).await?;
        self.store.write_table(tables::SPECIES, &consolidated.species).await?;
        self.store
            .write_table(tables::FIRST_RECORDS, &consolidated.first_records)
            .await?;
        self.store.write_table(tables::ALL_RECORDS, &consolidated.all_records).await?;
        self.store
            .write_table(tables::NATIVE_RANGES, &consolidated.native_ranges)
            .await?;
        self.store
            .write_table(tables::UNMATCHED_LOCATIONS, &consolidated.unmatched_locations)
            .await?;
        self.store.write_table(tables::MANUAL_REVIEW, &consolidated.review).await?;
        Ok(())
    }

    async fn copy_crosswalk(&self, path: &Path) -> Result<PathBuf> {
        let path = self.config.resolve(path);
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        self.store.write_bytes(tables::BIOREGION_CROSSWALK, &bytes).await
    }
}

async fn write_reports(reports_dir: &Path, summary: &SyncRunSummary) -> Result<()> {
    let brief = format!(
        "# GIATAR Run Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Species: {}\n- First records: {}\n- All records: {}\n- Native ranges: {}\n- Unmatched locations: {}\n- Needs manual review: {}\n- Promoted placeholders: {}\n- Occurrence requests: {} ({} failed)\n\n## Sources\n{}\n{}",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.species,
        summary.first_records,
        summary.all_records,
        summary.native_ranges,
        summary.unmatched_locations,
        summary.needs_review,
        summary.promotions,
        summary.occurrence_requests,
        summary.occurrence_failures,
        summary
            .sources
            .iter()
            .map(|(source, s)| match &s.error {
                Some(error) => format!("- {}: failed: {error}", source.label()),
                None => format!(
                    "- {}: {} taxa, {} matched, {} placeholders, {} new, {} deferred",
                    source.label(),
                    s.species_rows,
                    s.matched,
                    s.placeholders,
                    s.newly_added,
                    s.deferred
                ),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        if summary.stage_errors.is_empty() {
            String::new()
        } else {
            format!(
                "\n## Stage errors\n{}\n",
                summary
                    .stage_errors
                    .iter()
                    .map(|e| format!("- {e}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            )
        }
    );
    fs::write(reports_dir.join("run_brief.md"), brief)
        .await
        .context("writing run_brief.md")?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    Ok(())
}

/// Markdown digest of the most recent runs under `<workspace>/reports`.
pub fn report_recent_markdown(runs: usize, workspace_root: &Path) -> Result<String> {
    let reports_root = workspace_root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# GIATAR Recent Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let summary_path = dir.path().join("run_summary.json");
        let Ok(text) = std::fs::read_to_string(&summary_path) else {
            continue;
        };
        let value: serde_json::Value =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", summary_path.display()))?;
        let count = |field: &str| value.get(field).and_then(|v| v.as_u64()).unwrap_or(0);

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- species: {}", count("species")));
        lines.push(format!("- first records: {}", count("first_records")));
        lines.push(format!("- needs review: {}", count("needs_review")));
        lines.push(format!("- summary: `{}`", summary_path.display()));
        let brief = dir.path().join("run_brief.md");
        if brief.exists() {
            lines.push(format!("- brief: `{}`", brief.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::fakes::{exact, FakeTaxonomy};
    use crate::occurrence::fakes::FakeOccurrences;
    use crate::services::ServiceError;
    use async_trait::async_trait;
    use chrono::Datelike;
    use giatar_core::RecordType;
    use giatar_sources::LocationHint;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SOURCES_YAML: &str = r#"
sources:
  - source: asfr
    display_name: First records registry
    species_export: exports/asfr.csv
    feeds:
      - kind: first_records
        path: exports/asfr.csv
  - source: cabi
    display_name: Pest compendium
    species_export: exports/cabi_species.csv
    datasheet_types: exports/cabi_types.csv
    feeds:
      - kind: distribution
        path: exports/cabi_distribution.csv
native_ranges: exports/native.csv
bioregion_crosswalk: exports/crosswalk.csv
"#;

    const ASFR: &str = "\
TaxonName,Region,FirstRecord,Source
Foo bar,France,1990,Smith 1991
Foo bar,USACanada,2001,
Nomatch taxon,Germany,1999,
";

    const EXCEPTIONS: &str = "\
version: 1
exceptions:
  - names: [USACanada]
    codes: [USA, CAN]
";

    fn write(root: &Path, rel: &str, text: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, text).expect("write");
    }

    fn workspace(asfr: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        write(root, "sources.yaml", SOURCES_YAML);
        write(root, "rules/country_exceptions.yaml", EXCEPTIONS);
        write(root, "exports/asfr.csv", asfr);
        write(
            root,
            "exports/cabi_species.csv",
            "Scientific name,URL\nFoo bar,https://www.cabi.org/isc/datasheet/111\nEnemy one,https://www.cabi.org/isc/datasheet/222\n",
        );
        write(
            root,
            "exports/cabi_types.csv",
            "code,datasheet_type\n111,Invasive species\n222,Natural Enemy\n",
        );
        write(
            root,
            "exports/cabi_distribution.csv",
            "Continent/Country/Region,Distribution,code,Origin,First Reported,Last Reported,Reference\nFrance,Present,111,Introduced,1985,,\nItaly,Present,222,Introduced,1970,,\n",
        );
        write(
            root,
            "exports/native.csv",
            "usageKey,bioregion,DAISIE_region,source\n100,Palearctic,Spain,DAISIE Roy et al. 2016\n100,Nearctic,,\n",
        );
        write(root, "exports/crosswalk.csv", "ISO3,bioregion\nESP,Palearctic\n");
        dir
    }

    fn this_year() -> i32 {
        Utc::now().year()
    }

    fn taxonomy() -> FakeTaxonomy {
        FakeTaxonomy::default()
            .with("Foo bar", exact(100, "ACCEPTED", "SPECIES"))
            .with("Enemy one", exact(200, "ACCEPTED", "SPECIES"))
    }

    fn occurrences() -> FakeOccurrences {
        FakeOccurrences {
            answers: BTreeMap::from([((100, this_year()), vec!["FR", "DE"])]),
            ..Default::default()
        }
    }

    fn pipeline(root: &Path, taxonomy: FakeTaxonomy, occurrences: FakeOccurrences) -> SyncPipeline {
        pipeline_since(root, this_year(), taxonomy, Arc::new(occurrences))
    }

    fn pipeline_since(
        root: &Path,
        base_obs_year: i32,
        taxonomy: FakeTaxonomy,
        occurrences: Arc<FakeOccurrences>,
    ) -> SyncPipeline {
        let config = PipelineConfig {
            base_obs_year,
            ..PipelineConfig::for_workspace(root)
        };
        SyncPipeline::with_services(config, Arc::new(taxonomy), occurrences, None)
    }

    fn years_requested(fake: &FakeOccurrences, key: u64) -> Vec<i32> {
        fake.seen
            .lock()
            .expect("lock")
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, year)| *year)
            .collect()
    }

    fn record_for<'a>(rows: &'a [OccurrenceRecord], key: &CanonicalKey, iso3: &str) -> &'a OccurrenceRecord {
        rows.iter()
            .find(|r| &r.canonical_key == key && r.location.as_str() == iso3)
            .unwrap_or_else(|| panic!("no record for {key} in {iso3}"))
    }

    #[tokio::test]
    async fn end_to_end_run_consolidates_all_sources() {
        let dir = workspace(ASFR);
        let pipeline = pipeline(dir.path(), taxonomy(), occurrences());
        let summary = pipeline.run_once().await.expect("run");

        let asfr = &summary.sources[&SourceId::Asfr];
        assert_eq!((asfr.matched, asfr.placeholders, asfr.newly_added), (1, 1, 2));
        assert_eq!(summary.sources[&SourceId::Cabi].matched, 2);
        assert!(summary.stage_errors.is_empty(), "{:?}", summary.stage_errors);

        let store = pipeline.store();
        assert_eq!(asfr.archived.len(), 1);
        assert_eq!(summary.sources[&SourceId::Cabi].archived.len(), 3);
        assert!(asfr.archived[0].starts_with("archive"));
        assert!(store.path_for(&asfr.archived[0]).exists());
        let species: Vec<CanonicalSpeciesEntry> = store.read_rows(tables::SPECIES).await.expect("species");
        let keys = species.iter().map(|s| s.canonical_key.to_string()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["100", "XXASFNomatch_taxon"]);
        assert_eq!(species[0].code_cabi.as_deref(), Some("111"));
        assert!(species[0].invasive_asfr && species[0].invasive_cabi);

        let first: Vec<OccurrenceRecord> = store.read_rows(tables::FIRST_RECORDS).await.expect("first");
        let foo = CanonicalKey::Backbone(100);
        let france = record_for(&first, &foo, "FRA");
        assert_eq!((france.year, france.source.as_str()), (Some(1985), "CABI"));
        assert_eq!(record_for(&first, &foo, "USA").year, Some(2001));
        assert_eq!(record_for(&first, &foo, "CAN").year, Some(2001));
        let spain = record_for(&first, &foo, "ESP");
        assert_eq!((spain.year, spain.native), (None, Nativity::Native));
        assert_eq!(spain.source, "DAISIE");
        let germany = record_for(&first, &foo, "DEU");
        assert_eq!((germany.year, germany.source.as_str()), (Some(this_year()), "GBIF"));
        assert_eq!(record_for(&first, &foo, "Nearctic").record_type, RecordType::NotDated);
        assert!(first.iter().all(|r| r.canonical_key != CanonicalKey::Backbone(200)));

        let review: Vec<ReviewEntry> = store.read_rows(tables::MANUAL_REVIEW).await.expect("review");
        assert_eq!(review.len(), 1);
        assert_eq!(review[0].orig_taxon, "Nomatch taxon");

        let state = RunState::load(store).await.expect("state");
        assert_eq!(state.last_occurrence_update, Some(Utc::now().date_naive()));
        assert!(store.path_for(tables::BIOREGION_CROSSWALK).exists());
        assert!(Path::new(&summary.reports_dir).join("run_summary.json").exists());
        assert!(Path::new(&summary.reports_dir).join("run_brief.md").exists());
        assert!(Path::new(&summary.parquet_manifest).exists());
    }

    #[tokio::test]
    async fn second_run_only_retries_unmatched_names() {
        let dir = workspace(ASFR);
        pipeline(dir.path(), taxonomy(), occurrences()).run_once().await.expect("first run");

        let fake = Arc::new(taxonomy());
        let config = PipelineConfig {
            base_obs_year: this_year(),
            ..PipelineConfig::for_workspace(dir.path())
        };
        let again = SyncPipeline::with_services(config, fake.clone(), Arc::new(occurrences()), None);
        let summary = again.run_once().await.expect("second run");

        assert_eq!(fake.calls.load(Ordering::SeqCst), 1, "only the placeholder taxon is re-queried");
        assert_eq!(summary.sources[&SourceId::Asfr].newly_added, 0);
        let review: Vec<ReviewEntry> = again.store().read_rows(tables::MANUAL_REVIEW).await.expect("review");
        assert_eq!(review[0].placeholder_key.to_string(), "XXASFNomatch_taxon");
    }

    #[tokio::test]
    async fn later_match_promotes_the_placeholder_everywhere() {
        let dir = workspace(ASFR);
        pipeline(dir.path(), taxonomy(), occurrences()).run_once().await.expect("first run");

        let resolved = taxonomy().with("Nomatch taxon", exact(300, "ACCEPTED", "SPECIES"));
        let again = pipeline(dir.path(), resolved, occurrences());
        let summary = again.run_once().await.expect("second run");
        assert_eq!(summary.promotions, 1);
        assert_eq!(summary.needs_review, 0);

        let first: Vec<OccurrenceRecord> = again.store().read_rows(tables::FIRST_RECORDS).await.expect("first");
        assert!(first.iter().all(|r| !r.canonical_key.is_placeholder()));
        assert_eq!(record_for(&first, &CanonicalKey::Backbone(300), "DEU").year, Some(1999));
    }

    #[tokio::test]
    async fn schema_drift_fails_only_that_source() {
        let dir = workspace("TaxonName,FirstRecord\nFoo bar,1990\n");
        let summary = pipeline(dir.path(), taxonomy(), occurrences())
            .run_once()
            .await
            .expect("run");
        let asfr = &summary.sources[&SourceId::Asfr];
        assert!(asfr.error.as_deref().is_some_and(|e| e.contains("Region")));
        assert_eq!(summary.sources[&SourceId::Cabi].matched, 2);
        assert_eq!(summary.species, 1);
    }

    #[tokio::test]
    async fn deferred_taxon_gets_full_history_once_keyed() {
        let dir = workspace(ASFR);
        let base = this_year() - 3;
        let down = taxonomy().down_for("Nomatch taxon");
        pipeline_since(dir.path(), base, down, Arc::new(occurrences()))
            .run_once()
            .await
            .expect("first run");

        let resolved = taxonomy().with("Nomatch taxon", exact(300, "ACCEPTED", "SPECIES"));
        let fake = Arc::new(occurrences());
        let summary = pipeline_since(dir.path(), base, resolved, fake.clone())
            .run_once()
            .await
            .expect("second run");

        assert_eq!(summary.promotions, 0);
        assert_eq!(years_requested(&fake, 300), (base..=this_year()).collect::<Vec<_>>());
        assert_eq!(years_requested(&fake, 100), vec![this_year()]);
    }

    #[tokio::test]
    async fn failed_occurrence_years_are_retried_next_run() {
        let dir = workspace(ASFR);
        let base = this_year() - 2;
        let flaky = FakeOccurrences {
            failing: BTreeSet::from([(100, base)]),
            ..occurrences()
        };
        let pipeline = pipeline_since(dir.path(), base, taxonomy(), Arc::new(flaky));
        let summary = pipeline.run_once().await.expect("first run");
        assert_eq!(summary.occurrence_failures, 1);
        let state = RunState::load(pipeline.store()).await.expect("state");
        assert_eq!(
            state.pending_occurrence_requests,
            vec![crate::occurrence::OccurrenceRequest { key: 100, year: base }]
        );

        let fake = Arc::new(occurrences());
        let again = pipeline_since(dir.path(), base, taxonomy(), fake.clone());
        let summary = again.run_once().await.expect("second run");
        assert_eq!(summary.occurrence_failures, 0);
        assert_eq!(years_requested(&fake, 100), vec![base, this_year()]);
        let state = RunState::load(again.store()).await.expect("state");
        assert!(state.pending_occurrence_requests.is_empty());
    }

    #[tokio::test]
    async fn codes_sharing_a_name_all_resolve_with_one_query() {
        let fake = Arc::new(FakeTaxonomy::default().with("Harmonia axyridis", exact(400, "ACCEPTED", "SPECIES")));
        let mut matcher = NameMatcher::new(fake.clone());
        let mut registry = KeyRegistry::new();
        let taxa = ["1001", "1002"].map(|code| NormalizedTaxon {
            source: SourceId::Daisie,
            orig_taxon: "Harmonia axyridis".into(),
            local_code: code.into(),
        });
        let mut stats = SourceRunStats::default();
        let today = Utc::now().date_naive();
        let matched = match_taxa(&mut matcher, &mut registry, &taxa, today, &mut stats).await;

        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
        assert_eq!((stats.matched, stats.newly_added), (2, 2));
        assert_eq!(matched.newly_keyed, BTreeSet::from([CanonicalKey::Backbone(400)]));
        for code in ["1001", "1002"] {
            assert_eq!(registry.resolve(SourceId::Daisie, code), Some(&CanonicalKey::Backbone(400)));
        }
    }

    #[tokio::test]
    async fn unavailable_taxonomy_defers_without_placeholders() {
        let dir = workspace(ASFR);
        let down = taxonomy().down_for("Nomatch taxon");
        let summary = pipeline(dir.path(), down, occurrences()).run_once().await.expect("run");
        let asfr = &summary.sources[&SourceId::Asfr];
        assert_eq!((asfr.deferred, asfr.placeholders), (1, 0));
        assert_eq!(summary.needs_review, 0);
    }

    #[test]
    fn multi_country_names_explode_into_one_row_per_code() {
        let key = CanonicalKey::Backbone(7);
        let mut species = CanonicalSpeciesEntry::new(key.clone());
        species.invasive_asfr = true;
        let occurrence = SourceOccurrence {
            taxon: TaxonLink::Canonical(key.clone()),
            location: LocationHint::named("USACanada"),
            year: Some(1950),
            record_type: RecordType::FirstReport,
            native: Nativity::Introduced,
            source_label: "ASFR".into(),
            reference: Some("ref".into()),
        };
        let unknown = SourceOccurrence {
            location: LocationHint::named("Atlantis"),
            ..occurrence.clone()
        };
        let sub_national = SourceOccurrence {
            location: LocationHint::named("-Bavaria"),
            ..occurrence.clone()
        };
        let keyed = key_occurrences(
            vec![species],
            vec![occurrence, unknown, sub_national],
            Vec::new(),
            &KeyRegistry::new(),
        );
        let mut geo = GeoNormalizer::new(
            CountryTable::embedded().expect("table"),
            CountryExceptions::from_yaml(EXCEPTIONS).expect("exceptions"),
        );
        let located = locate(keyed, &mut geo);

        let codes = located.records.iter().map(|r| r.location.as_str()).collect::<Vec<_>>();
        assert_eq!(codes, vec!["USA", "CAN"]);
        assert!(located
            .records
            .iter()
            .all(|r| r.year == Some(1950) && r.reference.as_deref() == Some("ref")));
        assert_eq!(located.unmatched.len(), 1);
        assert_eq!(located.unmatched[0].location_text, "Atlantis");
        assert_eq!(located.sub_national, 1);
    }

    #[test]
    fn occurrences_outside_the_species_table_are_excluded() {
        let keyed = key_occurrences(
            Vec::new(),
            vec![SourceOccurrence {
                taxon: TaxonLink::Local {
                    source: SourceId::Cabi,
                    code: "999".into(),
                },
                location: LocationHint::named("France"),
                year: None,
                record_type: RecordType::NotDated,
                native: Nativity::Unknown,
                source_label: "CABI".into(),
                reference: None,
            }],
            Vec::new(),
            &KeyRegistry::new(),
        );
        assert!(keyed.occurrences.is_empty());
        assert_eq!(keyed.unkeyed, 1);
    }

    #[derive(Default)]
    struct FakeRegulatory {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RegulatoryService for FakeRegulatory {
        async fn is_categorized(&self, code: &str) -> Result<bool, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match code {
                "DOWN" => Err(ServiceError::Unavailable {
                    service: "fake",
                    reason: "timeout".into(),
                }),
                other => Ok(other == "XYLEFA"),
            }
        }
    }

    fn eppo_row(code: &str, is_new: bool) -> LinkageRow {
        LinkageRow {
            is_new,
            ..base_row(
                &NormalizedTaxon {
                    source: SourceId::Eppo,
                    orig_taxon: code.into(),
                    local_code: code.into(),
                },
                None,
                NaiveDate::from_ymd_opt(2024, 1, 1).expect("date"),
            )
        }
    }

    #[tokio::test]
    async fn categorization_is_queried_once_and_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TableStore::new(dir.path());
        let mut registry = KeyRegistry::new();
        for code in ["XYLEFA", "ABCDEF", "DOWN"] {
            registry.record(SourceId::Eppo, eppo_row(code, true));
        }
        let fake = FakeRegulatory::default();
        let service: &dyn RegulatoryService = &fake;

        let (known, pending) = refresh_categorization(&store, Some(service), &registry).await.expect("refresh");
        assert_eq!(known.get("XYLEFA"), Some(&true));
        assert_eq!(known.get("ABCDEF"), Some(&false));
        assert_eq!(pending, 1);

        registry.age_rows();
        let before = fake.calls.load(Ordering::SeqCst);
        let (_, pending) = refresh_categorization(&store, Some(service), &registry).await.expect("refresh");
        assert_eq!(fake.calls.load(Ordering::SeqCst) - before, 1, "only the pending code is retried");
        assert_eq!(pending, 1);
    }

    #[test]
    fn placeholder_rows_land_on_the_review_list() {
        let mut registry = KeyRegistry::new();
        let mut row = eppo_row("NOTHIN", true);
        row.canonical_key = Some(CanonicalKey::placeholder(SourceId::Eppo, "Nothing here"));
        registry.record(SourceId::Eppo, row);
        let mut matched = eppo_row("XYLEFA", true);
        matched.canonical_key = Some(CanonicalKey::Backbone(5));
        registry.record(SourceId::Eppo, matched);

        let review = review_entries(&registry);
        assert_eq!(review.len(), 1);
        assert_eq!(review[0].placeholder_key.to_string(), "XXEPPNothing_here");
    }
}
