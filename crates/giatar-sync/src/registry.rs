//! The canonical key registry: every source-local identifier and the key it resolves to.
//!
//! Persisted as one linkage table per source. Rows are never deleted; a
//! registration for an existing code replaces the row in place.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use giatar_core::{tables, CanonicalKey, LinkageRow, SourceId};
use giatar_storage::{TableStore, WriteBatch};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Inserted,
    Unchanged,
    /// The code was already keyed differently; the new key wins.
    Reconciled { previous: Option<CanonicalKey> },
}

#[derive(Debug, Clone, Default)]
pub struct KeyRegistry {
    by_source: BTreeMap<SourceId, BTreeMap<String, LinkageRow>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(store: &TableStore) -> Result<Self> {
        let mut registry = Self::new();
        for source in SourceId::ALL {
            let rows: Vec<LinkageRow> = store.read_rows(tables::linkage(source)).await?;
            let table = registry.by_source.entry(source).or_default();
            for row in rows {
                table.insert(row.source_local_code.clone(), row);
            }
        }
        Ok(registry)
    }

    pub async fn persist(&self, store: &TableStore) -> Result<Vec<PathBuf>> {
        let mut batch = store.batch();
        self.stage(&mut batch)?;
        batch.commit().await
    }

    /// Add every linkage table to `batch`.
    pub fn stage(&self, batch: &mut WriteBatch) -> Result<()> {
        for source in SourceId::ALL {
            let rows = self.rows(source).cloned().collect::<Vec<_>>();
            batch.table(tables::linkage(source), &rows)?;
        }
        Ok(())
    }

    /// Look up by source-local code first, then by original name.
    pub fn resolve(&self, source: SourceId, ident: &str) -> Option<&CanonicalKey> {
        let table = self.by_source.get(&source)?;
        let ident = ident.trim();
        if let Some(row) = table.get(ident) {
            return row.canonical_key.as_ref();
        }
        table
            .values()
            .find(|row| row.orig_taxon == ident)
            .and_then(|row| row.canonical_key.as_ref())
    }

    pub fn get(&self, source: SourceId, code: &str) -> Option<&LinkageRow> {
        self.by_source.get(&source)?.get(code)
    }

    pub fn rows(&self, source: SourceId) -> impl Iterator<Item = &LinkageRow> {
        self.by_source.get(&source).into_iter().flat_map(|t| t.values())
    }

    pub fn all_rows(&self) -> impl Iterator<Item = &LinkageRow> {
        self.by_source.values().flat_map(|t| t.values())
    }

    pub fn len(&self) -> usize {
        self.by_source.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a full linkage row produced by the matcher.
    pub fn record(&mut self, source: SourceId, row: LinkageRow) -> Registration {
        let table = self.by_source.entry(source).or_default();
        match table.get(&row.source_local_code) {
            None => {
                table.insert(row.source_local_code.clone(), row);
                Registration::Inserted
            }
            Some(existing) if existing.canonical_key == row.canonical_key => {
                table.insert(row.source_local_code.clone(), row);
                Registration::Unchanged
            }
            Some(existing) => {
                let previous = existing.canonical_key.clone();
                info!(
                    %source,
                    code = %row.source_local_code,
                    previous = ?previous.as_ref().map(ToString::to_string),
                    current = ?row.canonical_key.as_ref().map(ToString::to_string),
                    "reconciled canonical key"
                );
                table.insert(row.source_local_code.clone(), row);
                Registration::Reconciled { previous }
            }
        }
    }

    /// Point an already-known identifier at `key`. Unknown identifiers are not created here.
    pub fn register(&mut self, source: SourceId, ident: &str, key: CanonicalKey) -> Option<Registration> {
        let table = self.by_source.get_mut(&source)?;
        let code = if table.contains_key(ident) {
            ident.to_string()
        } else {
            table.values().find(|r| r.orig_taxon == ident)?.source_local_code.clone()
        };
        let mut row = table.get(&code)?.clone();
        row.canonical_key = Some(key);
        Some(self.record(source, row))
    }

    /// Clear the new flag on everything carried over from earlier runs.
    pub fn age_rows(&mut self) {
        for row in self.by_source.values_mut().flat_map(|t| t.values_mut()) {
            row.is_new = false;
        }
    }

    /// Rewrite every row keyed `old` to `new`. Returns the number of rows touched.
    pub fn promote_placeholder(&mut self, old: &CanonicalKey, new: &CanonicalKey) -> usize {
        let mut touched = 0;
        for row in self.by_source.values_mut().flat_map(|t| t.values_mut()) {
            if row.canonical_key.as_ref() == Some(old) {
                row.canonical_key = Some(new.clone());
                touched += 1;
            }
        }
        if touched > 0 {
            info!(old = %old, new = %new, rows = touched, "promoted placeholder key");
        }
        touched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use giatar_core::MatchStatus;

    fn linkage(code: &str, name: &str, key: Option<CanonicalKey>) -> LinkageRow {
        LinkageRow {
            source_local_code: code.to_string(),
            orig_taxon: name.to_string(),
            canonical_key: key,
            match_status: MatchStatus::Exact,
            match_type: Some("EXACT".into()),
            canonical_name: Some(name.to_string()),
            rank: Some("SPECIES".into()),
            kingdom: None,
            phylum: None,
            class: None,
            order: None,
            family: None,
            genus: None,
            is_new: true,
            date_stamp: NaiveDate::from_ymd_opt(2026, 10, 1).expect("date"),
        }
    }

    #[test]
    fn registration_is_idempotent_and_reconciles_changes() {
        let mut registry = KeyRegistry::new();
        let row = linkage("VESPVE", "Vespa velutina", Some(CanonicalKey::Backbone(1311477)));
        assert_eq!(registry.record(SourceId::Eppo, row.clone()), Registration::Inserted);
        assert_eq!(registry.record(SourceId::Eppo, row.clone()), Registration::Unchanged);

        let moved = linkage("VESPVE", "Vespa velutina", Some(CanonicalKey::Backbone(99)));
        assert_eq!(
            registry.record(SourceId::Eppo, moved),
            Registration::Reconciled {
                previous: Some(CanonicalKey::Backbone(1311477))
            }
        );
        assert_eq!(registry.resolve(SourceId::Eppo, "VESPVE"), Some(&CanonicalKey::Backbone(99)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn resolve_falls_back_to_names_and_stays_per_source() {
        let mut registry = KeyRegistry::new();
        registry.record(SourceId::Cabi, linkage("109170", "Vespa velutina", Some(CanonicalKey::Backbone(7))));
        assert_eq!(registry.resolve(SourceId::Cabi, "Vespa velutina"), Some(&CanonicalKey::Backbone(7)));
        assert_eq!(registry.resolve(SourceId::Eppo, "Vespa velutina"), None);
        assert_eq!(registry.resolve(SourceId::Cabi, "26515"), None);
    }

    #[test]
    fn register_updates_known_identifiers_only() {
        let mut registry = KeyRegistry::new();
        registry.record(SourceId::Asfr, linkage("Foo bar", "Foo bar", None));
        assert_eq!(
            registry.register(SourceId::Asfr, "Foo bar", CanonicalKey::Backbone(3)),
            Some(Registration::Reconciled { previous: None })
        );
        assert_eq!(registry.register(SourceId::Asfr, "Baz qux", CanonicalKey::Backbone(4)), None);
    }

    #[test]
    fn promotion_rewrites_every_reference() {
        let mut registry = KeyRegistry::new();
        let placeholder = CanonicalKey::placeholder(SourceId::Daisie, "Foo bar");
        registry.record(SourceId::Daisie, linkage("1", "Foo bar", Some(placeholder.clone())));
        registry.record(SourceId::Daisie, linkage("2", "Other", Some(CanonicalKey::Backbone(5))));
        assert_eq!(registry.promote_placeholder(&placeholder, &CanonicalKey::Backbone(8)), 1);
        assert_eq!(registry.resolve(SourceId::Daisie, "1"), Some(&CanonicalKey::Backbone(8)));
        assert_eq!(registry.promote_placeholder(&placeholder, &CanonicalKey::Backbone(8)), 0);
    }

    #[tokio::test]
    async fn registry_round_trips_through_linkage_tables() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TableStore::new(dir.path());
        let mut registry = KeyRegistry::new();
        registry.record(SourceId::Eppo, linkage("VESPVE", "Vespa velutina", Some(CanonicalKey::Backbone(1))));
        registry.persist(&store).await.expect("persist");
        assert!(dir.path().join("links/eppo_links.csv").exists());

        let mut loaded = KeyRegistry::load(&store).await.expect("load");
        assert_eq!(loaded.get(SourceId::Eppo, "VESPVE"), registry.get(SourceId::Eppo, "VESPVE"));
        loaded.age_rows();
        assert!(!loaded.get(SourceId::Eppo, "VESPVE").expect("row").is_new);
    }
}
