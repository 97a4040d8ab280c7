//! Resolution of raw taxon names to backbone keys.
//!
//! Steps run in order and the first success wins: exact accepted match,
//! synonym resolution, doubtful-name retry, two-word retry. A name that
//! survives all of them is unmatched and later gets a placeholder key.

use std::collections::HashMap;
use std::sync::Arc;

use giatar_core::{CanonicalKey, Lineage, MatchStatus};
use thiserror::Error;
use tracing::{debug, warn};

use crate::services::{NameMatchResponse, ServiceError, TaxonomyService};

#[derive(Debug, Clone, PartialEq)]
pub struct NameMatch {
    pub status: MatchStatus,
    pub canonical_key: CanonicalKey,
    pub match_type: String,
    pub canonical_name: Option<String>,
    pub rank: Option<String>,
    pub lineage: Lineage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched(NameMatch),
    /// All fallbacks failed. `status` says how close the service got.
    Unmatched { status: MatchStatus, match_type: String },
}

#[derive(Debug, Error)]
pub enum MatchError {
    /// The service could not answer; the taxon stays eligible for the next run.
    #[error("matching {name:?} deferred: {source}")]
    Deferred {
        name: String,
        #[source]
        source: ServiceError,
    },
}

pub struct NameMatcher {
    service: Arc<dyn TaxonomyService>,
    cache: HashMap<String, MatchOutcome>,
    queries: usize,
}

fn first_two_words(name: &str) -> Option<String> {
    let words = name.split_whitespace().collect::<Vec<_>>();
    (words.len() > 2).then(|| words[..2].join(" "))
}

fn matched(status: MatchStatus, resp: &NameMatchResponse) -> Option<MatchOutcome> {
    let key = resp.usage_key?;
    Some(MatchOutcome::Matched(NameMatch {
        status,
        canonical_key: CanonicalKey::Backbone(key),
        match_type: resp.match_type.clone(),
        canonical_name: resp.canonical_name.clone(),
        rank: resp.rank.clone(),
        lineage: resp.lineage(),
    }))
}

fn accepted_alternative(resp: &NameMatchResponse) -> Option<&NameMatchResponse> {
    resp.alternatives
        .iter()
        .find(|alt| alt.is_exact() && alt.has_status("ACCEPTED") && alt.usage_key.is_some())
}

impl NameMatcher {
    pub fn new(service: Arc<dyn TaxonomyService>) -> Self {
        Self {
            service,
            cache: HashMap::new(),
            queries: 0,
        }
    }

    /// Service calls made so far, cache hits excluded.
    pub fn queries(&self) -> usize {
        self.queries
    }

    async fn query(&mut self, original: &str, name: &str) -> Result<Option<NameMatchResponse>, MatchError> {
        self.queries += 1;
        match self.service.match_name(name).await {
            Ok(resp) => Ok(Some(resp)),
            Err(err) if err.is_transient() => Err(MatchError::Deferred {
                name: original.to_string(),
                source: err,
            }),
            Err(err) => {
                warn!(name, error = %err, "name query refused; treating as no answer");
                Ok(None)
            }
        }
    }

    pub async fn match_name(&mut self, raw_name: &str) -> Result<MatchOutcome, MatchError> {
        let name = raw_name.split_whitespace().collect::<Vec<_>>().join(" ");
        if let Some(hit) = self.cache.get(&name) {
            return Ok(hit.clone());
        }
        let outcome = self.resolve(&name).await?;
        debug!(name, ?outcome, "name matched");
        self.cache.insert(name, outcome.clone());
        Ok(outcome)
    }

    async fn resolve(&mut self, name: &str) -> Result<MatchOutcome, MatchError> {
        let Some(first) = self.query(name, name).await? else {
            return Ok(MatchOutcome::Unmatched {
                status: MatchStatus::Unmatched,
                match_type: "NONE".to_string(),
            });
        };

        if first.is_exact() {
            if first.has_status("ACCEPTED") {
                if let Some(hit) = matched(MatchStatus::Exact, &first) {
                    return Ok(hit);
                }
            }

            if first.has_status("SYNONYM") {
                if let Some(hit) = self.resolve_synonym(name, &first).await? {
                    return Ok(hit);
                }
            }

            if first.has_status("DOUBTFUL") {
                if let Some(short) = first_two_words(name) {
                    if let Some(retry) = self.query(name, &short).await? {
                        if retry.is_exact() {
                            if let Some(hit) = matched(MatchStatus::Doubtful, &retry) {
                                return Ok(hit);
                            }
                        }
                    }
                }
            }
        }

        if let Some(short) = first_two_words(name) {
            if let Some(retry) = self.query(name, &short).await? {
                if retry.is_exact() && retry.has_status("ACCEPTED") {
                    if let Some(hit) = matched(MatchStatus::Exact, &retry) {
                        return Ok(hit);
                    }
                }
                if retry.is_exact() && retry.has_status("SYNONYM") {
                    if let Some(alt) = accepted_alternative(&retry) {
                        if let Some(hit) = matched(MatchStatus::Synonym, alt) {
                            return Ok(hit);
                        }
                    }
                }
            }
        }

        let status = if first.match_type.eq_ignore_ascii_case("HIGHERRANK") {
            MatchStatus::HigherRank
        } else {
            MatchStatus::Unmatched
        };
        Ok(MatchOutcome::Unmatched {
            status,
            match_type: first.match_type.clone(),
        })
    }

    /// Prefer an accepted alternative; otherwise follow the synonym to its accepted species or genus.
    async fn resolve_synonym(
        &mut self,
        original: &str,
        resp: &NameMatchResponse,
    ) -> Result<Option<MatchOutcome>, MatchError> {
        if let Some(alt) = accepted_alternative(resp) {
            return Ok(matched(MatchStatus::Synonym, alt));
        }
        let resolved = if resp.has_rank("SPECIES") {
            resp.species.clone()
        } else if resp.has_rank("GENUS") {
            resp.genus.clone()
        } else {
            None
        };
        let Some(resolved) = resolved.filter(|r| r != original) else {
            return Ok(None);
        };
        let Some(second) = self.query(original, &resolved).await? else {
            return Ok(None);
        };
        if second.is_exact() {
            return Ok(matched(MatchStatus::Synonym, &second));
        }
        Ok(None)
    }
}
