//! Ecological and host/vector side tables, re-keyed by canonical key.

use anyhow::{Context, Result};
use giatar_core::{tables, CanonicalKey};
use giatar_sources::SourceExport;
use giatar_storage::TableStore;
use tracing::{info, warn};

use crate::config::SubtableConfig;
use crate::registry::KeyRegistry;

pub const KEY_COLUMN: &str = "canonicalKey";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedSubtable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    /// Rows whose link resolved to no key.
    pub dropped: usize,
}

impl KeyedSubtable {
    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.headers).context("writing sub-table header")?;
        for row in &self.rows {
            writer.write_record(row).context("writing sub-table row")?;
        }
        writer
            .into_inner()
            .map_err(|err| anyhow::anyhow!("flushing sub-table buffer: {}", err.error()))
    }
}

/// Prefix every row with the key its link column resolves to.
pub fn key_subtable(config: &SubtableConfig, export: &SourceExport, registry: &KeyRegistry) -> Result<KeyedSubtable> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(export.bytes.as_slice());
    let original = reader
        .headers()
        .with_context(|| format!("reading header of {}", export.label))?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect::<Vec<_>>();
    let link_idx = original
        .iter()
        .position(|h| *h == config.link_column)
        .with_context(|| format!("{} has no link column {:?}", export.label, config.link_column))?;

    let mut headers = vec![KEY_COLUMN.to_string()];
    headers.extend(original.iter().filter(|h| h.as_str() != KEY_COLUMN).cloned());

    let mut rows = Vec::new();
    let mut dropped = 0;
    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                warn!(table = %config.name, error = %err, "skipping unreadable sub-table row");
                dropped += 1;
                continue;
            }
        };
        let link = record.get(link_idx).unwrap_or_default();
        let key = match config.source {
            Some(source) => registry.resolve(source, link).cloned(),
            None => link.parse::<CanonicalKey>().ok(),
        };
        let Some(key) = key else {
            dropped += 1;
            continue;
        };
        let mut row = vec![key.to_string()];
        row.extend(
            original
                .iter()
                .enumerate()
                .filter(|(_, h)| h.as_str() != KEY_COLUMN)
                .map(|(idx, _)| record.get(idx).unwrap_or_default().to_string()),
        );
        rows.push(row);
    }
    Ok(KeyedSubtable { headers, rows, dropped })
}

/// Key every configured sub-table and write it under `subtables/`. Returns rows dropped per table.
pub async fn refresh_subtables(
    configs: &[SubtableConfig],
    resolve_path: impl Fn(&SubtableConfig) -> std::path::PathBuf,
    registry: &KeyRegistry,
    store: &TableStore,
) -> Result<Vec<(String, usize)>> {
    let mut dropped = Vec::new();
    for config in configs {
        let export = SourceExport::load(resolve_path(config))?;
        let keyed = key_subtable(config, &export, registry)?;
        let bytes = keyed.to_csv()?;
        store
            .write_bytes(tables::subtable(config.group, &config.name), &bytes)
            .await?;
        info!(group = config.group.slug(), table = %config.name, rows = keyed.rows.len(), dropped = keyed.dropped, "sub-table keyed");
        dropped.push((config.name.clone(), keyed.dropped));
    }
    Ok(dropped)
}
