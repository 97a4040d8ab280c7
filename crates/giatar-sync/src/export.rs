//! Per-run artifacts: parquet snapshots with a digest manifest, and incremental run state.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, Int32Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, NaiveDate, Utc};
use giatar_core::{tables, CanonicalSpeciesEntry, NativeRangeEntry, OccurrenceRecord};
use giatar_storage::TableStore;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::occurrence::OccurrenceRequest;

/// What the next run needs from the previous one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub last_occurrence_update: Option<NaiveDate>,
    pub last_run_id: Option<Uuid>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Occurrence requests that failed and are retried next run.
    #[serde(default)]
    pub pending_occurrence_requests: Vec<OccurrenceRequest>,
}

impl RunState {
    pub async fn load(store: &TableStore) -> Result<Self> {
        Ok(store.read_json(tables::RUN_STATE).await?.unwrap_or_default())
    }

    pub async fn save(&self, store: &TableStore) -> Result<PathBuf> {
        store.write_json(tables::RUN_STATE, self).await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write one parquet file per consolidated table under `<reports_dir>/snapshots`.
pub async fn export_parquet_snapshots(
    reports_dir: &Path,
    species: &[CanonicalSpeciesEntry],
    first_records: &[OccurrenceRecord],
    all_records: &[OccurrenceRecord],
    native_ranges: &[NativeRangeEntry],
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let species_path = snapshot_dir.join("species.parquet");
    let first_path = snapshot_dir.join("first_records.parquet");
    let all_path = snapshot_dir.join("all_records.parquet");
    let native_path = snapshot_dir.join("native_ranges.parquet");

    write_species_parquet(&species_path, species)?;
    write_occurrences_parquet(&first_path, first_records)?;
    write_occurrences_parquet(&all_path, all_records)?;
    write_native_ranges_parquet(&native_path, native_ranges)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("species", reports_dir, &species_path)?,
            manifest_entry("first_records", reports_dir, &first_path)?,
            manifest_entry("all_records", reports_dir, &all_path)?,
            manifest_entry("native_ranges", reports_dir, &native_path)?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn utf8<'a>(values: impl Iterator<Item = Option<&'a str>>) -> Arc<StringArray> {
    Arc::new(StringArray::from(values.collect::<Vec<_>>()))
}

fn write_species_parquet(path: &Path, species: &[CanonicalSpeciesEntry]) -> Result<()> {
    let text_columns = [
        "canonicalName",
        "rank",
        "kingdom",
        "phylum",
        "class",
        "order",
        "family",
        "genus",
        "taxonASFR",
        "codeCABI",
        "codeEPPO",
        "codeDAISIE",
    ];
    let flag_columns = ["invasiveASFR", "invasiveCABI", "invasiveEPPO", "invasiveDAISIE"];

    let mut fields = vec![ArrowField::new("canonicalKey", DataType::Utf8, false)];
    fields.extend(text_columns.iter().map(|name| ArrowField::new(*name, DataType::Utf8, true)));
    fields.extend(flag_columns.iter().map(|name| ArrowField::new(*name, DataType::Boolean, false)));
    let schema = Arc::new(Schema::new(fields));

    let keys = species.iter().map(|s| s.canonical_key.to_string()).collect::<Vec<_>>();
    let text_getters: [fn(&CanonicalSpeciesEntry) -> Option<&str>; 12] = [
        |s| s.canonical_name.as_deref(),
        |s| s.rank.as_deref(),
        |s| s.kingdom.as_deref(),
        |s| s.phylum.as_deref(),
        |s| s.class.as_deref(),
        |s| s.order.as_deref(),
        |s| s.family.as_deref(),
        |s| s.genus.as_deref(),
        |s| s.taxon_asfr.as_deref(),
        |s| s.code_cabi.as_deref(),
        |s| s.code_eppo.as_deref(),
        |s| s.code_daisie.as_deref(),
    ];
    let flag_getters: [fn(&CanonicalSpeciesEntry) -> bool; 4] = [
        |s| s.invasive_asfr,
        |s| s.invasive_cabi,
        |s| s.invasive_eppo,
        |s| s.invasive_daisie,
    ];

    let mut columns: Vec<ArrayRef> = vec![utf8(keys.iter().map(|k| Some(k.as_str())))];
    for getter in text_getters {
        columns.push(utf8(species.iter().map(getter)));
    }
    for getter in flag_getters {
        columns.push(Arc::new(BooleanArray::from(species.iter().map(getter).collect::<Vec<_>>())));
    }

    let batch = RecordBatch::try_new(schema, columns).context("building species record batch")?;
    write_parquet(path, batch)
}

fn write_occurrences_parquet(path: &Path, records: &[OccurrenceRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("canonicalKey", DataType::Utf8, false),
        ArrowField::new("location", DataType::Utf8, false),
        ArrowField::new("year", DataType::Int32, true),
        ArrowField::new("recordType", DataType::Utf8, false),
        ArrowField::new("native", DataType::Boolean, true),
        ArrowField::new("source", DataType::Utf8, false),
        ArrowField::new("reference", DataType::Utf8, true),
    ]));

    let keys = records.iter().map(|r| r.canonical_key.to_string()).collect::<Vec<_>>();
    let batch = RecordBatch::try_new(
        schema,
        vec![
            utf8(keys.iter().map(|k| Some(k.as_str()))),
            utf8(records.iter().map(|r| Some(r.location.as_str()))),
            Arc::new(Int32Array::from(records.iter().map(|r| r.year).collect::<Vec<_>>())),
            utf8(records.iter().map(|r| Some(r.record_type.label()))),
            Arc::new(BooleanArray::from(records.iter().map(|r| r.native.as_flag()).collect::<Vec<_>>())),
            utf8(records.iter().map(|r| Some(r.source.as_str()))),
            utf8(records.iter().map(|r| r.reference.as_deref())),
        ],
    )
    .context("building occurrence record batch")?;
    write_parquet(path, batch)
}

fn write_native_ranges_parquet(path: &Path, rows: &[NativeRangeEntry]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("canonicalKey", DataType::Utf8, false),
        ArrowField::new("location", DataType::Utf8, false),
        ArrowField::new("locationText", DataType::Utf8, false),
        ArrowField::new("bioregion", DataType::Utf8, false),
        ArrowField::new("native", DataType::Boolean, true),
        ArrowField::new("source", DataType::Utf8, false),
        ArrowField::new("reference", DataType::Utf8, true),
    ]));

    let keys = rows.iter().map(|r| r.canonical_key.to_string()).collect::<Vec<_>>();
    let batch = RecordBatch::try_new(
        schema,
        vec![
            utf8(keys.iter().map(|k| Some(k.as_str()))),
            utf8(rows.iter().map(|r| Some(r.location.as_str()))),
            utf8(rows.iter().map(|r| Some(r.location_text.as_str()))),
            utf8(rows.iter().map(|r| Some(r.bioregion.as_str()))),
            Arc::new(BooleanArray::from(rows.iter().map(|r| r.native.as_flag()).collect::<Vec<_>>())),
            utf8(rows.iter().map(|r| Some(r.source.as_str()))),
            utf8(rows.iter().map(|r| r.reference.as_deref())),
        ],
    )
    .context("building native range record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
