//! Incremental backbone occurrence fetch.
//!
//! The backbone only answers "which countries had records of this key in this
//! year", so first records are built by taking the minimum year per country and
//! folding each run's answers into the persisted history.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Datelike, NaiveDate};
use giatar_core::{CanonicalKey, CanonicalSpeciesEntry, Nativity, RecordType};
use giatar_sources::{LocationHint, SourceOccurrence, TaxonLink};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::services::OccurrenceService;

pub const SOURCE_LABEL: &str = "GBIF";
pub const COUNTS_REFERENCE: &str = "Counts API";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OccurrenceRequest {
    pub key: u64,
    pub year: i32,
}

/// Earliest year the backbone has records of a key in one country.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackboneFirstRecord {
    #[serde(rename = "usageKey")]
    pub key: u64,
    /// ISO2, as the backbone reports it.
    pub country: String,
    pub year: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OccurrenceFetch {
    pub records: Vec<BackboneFirstRecord>,
    pub requests: usize,
    /// Carried into the next run's plan.
    pub failed: Vec<OccurrenceRequest>,
}

/// Years to query per backbone key. Fresh keys and runs without a previous update
/// get the full history from `base_year`; everything else only the years since the
/// last update. Requests that failed last run are asked again while their key is
/// still in the species table. Placeholder keys never reach the service.
pub fn plan_occurrence_requests(
    species: &[CanonicalSpeciesEntry],
    fresh: &BTreeSet<CanonicalKey>,
    pending: &[OccurrenceRequest],
    last_update: Option<NaiveDate>,
    today: NaiveDate,
    base_year: i32,
) -> Vec<OccurrenceRequest> {
    let current = today.year();
    let mut requests = Vec::new();
    let mut known = BTreeSet::new();
    for entry in species {
        let Some(key) = entry.canonical_key.backbone_id() else {
            continue;
        };
        known.insert(key);
        let from = match last_update {
            Some(date) if !fresh.contains(&entry.canonical_key) => date.year(),
            _ => base_year,
        };
        requests.extend((from..=current).map(|year| OccurrenceRequest { key, year }));
    }
    requests.extend(pending.iter().filter(|request| known.contains(&request.key)));
    requests.sort();
    requests.dedup();
    requests
}

/// One request at a time; a failed request is logged and handed back for the next run.
pub async fn fetch_backbone_first_records(
    service: &dyn OccurrenceService,
    requests: &[OccurrenceRequest],
) -> OccurrenceFetch {
    let mut earliest: BTreeMap<(u64, String), i32> = BTreeMap::new();
    let mut failed = Vec::new();
    for request in requests {
        match service.countries_with_occurrences(request.key, request.year).await {
            Ok(countries) => {
                for country in countries {
                    earliest
                        .entry((request.key, country))
                        .and_modify(|y| *y = (*y).min(request.year))
                        .or_insert(request.year);
                }
            }
            Err(err) => {
                failed.push(*request);
                warn!(key = request.key, year = request.year, error = %err, "occurrence request skipped");
            }
        }
    }
    info!(requests = requests.len(), failed = failed.len(), countries = earliest.len(), "occurrence fetch finished");
    OccurrenceFetch {
        records: earliest
            .into_iter()
            .map(|((key, country), year)| BackboneFirstRecord { key, country, year })
            .collect(),
        requests: requests.len(),
        failed,
    }
}

/// Union of history and fresh answers, keeping the earlier year per (key, country).
pub fn merge_by_min(history: Vec<BackboneFirstRecord>, fresh: Vec<BackboneFirstRecord>) -> Vec<BackboneFirstRecord> {
    let mut merged: BTreeMap<(u64, String), i32> = BTreeMap::new();
    for record in history.into_iter().chain(fresh) {
        merged
            .entry((record.key, record.country))
            .and_modify(|y| *y = (*y).min(record.year))
            .or_insert(record.year);
    }
    merged
        .into_iter()
        .map(|((key, country), year)| BackboneFirstRecord { key, country, year })
        .collect()
}

pub fn to_source_occurrences(records: &[BackboneFirstRecord]) -> Vec<SourceOccurrence> {
    records
        .iter()
        .map(|record| SourceOccurrence {
            taxon: TaxonLink::Canonical(CanonicalKey::Backbone(record.key)),
            location: LocationHint::named(record.country.clone()).with_iso2(Some(record.country.clone())),
            year: Some(record.year),
            record_type: RecordType::FirstReport,
            native: Nativity::Unknown,
            source_label: SOURCE_LABEL.to_string(),
            reference: Some(COUNTS_REFERENCE.to_string()),
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::fakes::FakeOccurrences;
    use super::*;
    use giatar_core::SourceId;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date")
    }

    fn species(keys: &[CanonicalKey]) -> Vec<CanonicalSpeciesEntry> {
        keys.iter().cloned().map(CanonicalSpeciesEntry::new).collect()
    }

    #[test]
    fn fresh_keys_get_full_history_and_others_the_delta() {
        let old = CanonicalKey::Backbone(1);
        let new = CanonicalKey::Backbone(2);
        let placeholder = CanonicalKey::placeholder(SourceId::Asfr, "Foo bar");
        let fresh = BTreeSet::from([new.clone()]);
        let plan = plan_occurrence_requests(
            &species(&[old, new, placeholder]),
            &fresh,
            &[],
            Some(date(2023, 6, 1)),
            date(2024, 2, 1),
            2020,
        );
        let for_key = |k: u64| plan.iter().filter(|r| r.key == k).map(|r| r.year).collect::<Vec<_>>();
        assert_eq!(for_key(1), vec![2023, 2024]);
        assert_eq!(for_key(2), vec![2020, 2021, 2022, 2023, 2024]);
        assert_eq!(plan.len(), 7);
    }

    #[test]
    fn no_previous_update_means_full_history_for_everyone() {
        let plan = plan_occurrence_requests(
            &species(&[CanonicalKey::Backbone(1)]),
            &BTreeSet::new(),
            &[],
            None,
            date(2024, 1, 1),
            2022,
        );
        assert_eq!(plan.iter().map(|r| r.year).collect::<Vec<_>>(), vec![2022, 2023, 2024]);
    }

    #[test]
    fn failed_requests_are_asked_again_while_the_key_is_listed() {
        let pending = [
            OccurrenceRequest { key: 1, year: 2021 },
            OccurrenceRequest { key: 1, year: 2024 },
            OccurrenceRequest { key: 9, year: 2022 },
        ];
        let plan = plan_occurrence_requests(
            &species(&[CanonicalKey::Backbone(1)]),
            &BTreeSet::new(),
            &pending,
            Some(date(2024, 3, 1)),
            date(2024, 5, 1),
            2020,
        );
        assert_eq!(
            plan,
            vec![OccurrenceRequest { key: 1, year: 2021 }, OccurrenceRequest { key: 1, year: 2024 }]
        );
    }

    #[tokio::test]
    async fn fetch_keeps_min_year_and_skips_failures() {
        let service = FakeOccurrences {
            answers: BTreeMap::from([
                ((7, 2001), vec!["FR", "DE"]),
                ((7, 2000), vec!["FR"]),
                ((7, 2003), vec!["IT"]),
            ]),
            failing: BTreeSet::from([(7, 2002)]),
            ..Default::default()
        };
        let requests = (2000..=2003).map(|year| OccurrenceRequest { key: 7, year }).collect::<Vec<_>>();
        let fetch = fetch_backbone_first_records(&service, &requests).await;
        assert_eq!(fetch.failed, vec![OccurrenceRequest { key: 7, year: 2002 }]);
        assert_eq!(fetch.requests, 4);
        let got = fetch
            .records
            .iter()
            .map(|r| (r.country.as_str(), r.year))
            .collect::<Vec<_>>();
        assert_eq!(got, vec![("DE", 2001), ("FR", 2000), ("IT", 2003)]);
    }

    #[test]
    fn history_merge_keeps_the_earlier_year() {
        let history = vec![
            BackboneFirstRecord { key: 7, country: "FR".into(), year: 1995 },
            BackboneFirstRecord { key: 7, country: "DE".into(), year: 2010 },
        ];
        let fresh = vec![
            BackboneFirstRecord { key: 7, country: "FR".into(), year: 2023 },
            BackboneFirstRecord { key: 7, country: "DE".into(), year: 2004 },
            BackboneFirstRecord { key: 8, country: "US".into(), year: 2024 },
        ];
        let merged = merge_by_min(history, fresh);
        assert_eq!(merged.len(), 3);
        assert!(merged.contains(&BackboneFirstRecord { key: 7, country: "FR".into(), year: 1995 }));
        assert!(merged.contains(&BackboneFirstRecord { key: 7, country: "DE".into(), year: 2004 }));
    }

    #[test]
    fn backbone_rows_become_keyed_first_reports() {
        let occ = to_source_occurrences(&[BackboneFirstRecord { key: 7, country: "FR".into(), year: 1999 }]);
        assert_eq!(occ[0].taxon, TaxonLink::Canonical(CanonicalKey::Backbone(7)));
        assert_eq!(occ[0].location.iso2.as_deref(), Some("FR"));
        assert_eq!(occ[0].source_label, "GBIF");
        assert_eq!(occ[0].reference.as_deref(), Some("Counts API"));
        assert_eq!(occ[0].native, Nativity::Unknown);
    }
}
