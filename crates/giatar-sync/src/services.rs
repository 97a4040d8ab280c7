//! External collaborators: the taxonomic backbone and the regulatory taxonomy service.

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use giatar_core::Lineage;
use giatar_storage::{FetchError, HttpClientConfig, HttpFetcher, RetryError};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Timeouts, 5xx and malformed bodies after the retry budget ran out.
    #[error("{service} unavailable: {reason}")]
    Unavailable { service: &'static str, reason: String },
    #[error("{service} rejected the request: {reason}")]
    Rejected { service: &'static str, reason: String },
}

impl ServiceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Unavailable { .. })
    }

    fn from_fetch(service: &'static str, err: RetryError<FetchError>) -> Self {
        if err.is_transient() {
            ServiceError::Unavailable {
                service,
                reason: err.to_string(),
            }
        } else {
            ServiceError::Rejected {
                service,
                reason: err.to_string(),
            }
        }
    }
}

/// One answer from the backbone name-matching endpoint.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameMatchResponse {
    #[serde(default)]
    pub usage_key: Option<u64>,
    #[serde(default)]
    pub accepted_usage_key: Option<u64>,
    #[serde(default)]
    pub scientific_name: Option<String>,
    #[serde(default)]
    pub canonical_name: Option<String>,
    #[serde(default)]
    pub rank: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "no_match")]
    pub match_type: String,
    #[serde(default)]
    pub confidence: Option<u32>,
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
    #[serde(default)]
    pub species: Option<String>,
    #[serde(default)]
    pub alternatives: Vec<NameMatchResponse>,
}

fn no_match() -> String {
    "NONE".to_string()
}

impl NameMatchResponse {
    pub fn is_exact(&self) -> bool {
        self.match_type.eq_ignore_ascii_case("EXACT")
    }

    pub fn has_status(&self, status: &str) -> bool {
        self.status.as_deref().is_some_and(|s| s.eq_ignore_ascii_case(status))
    }

    pub fn has_rank(&self, rank: &str) -> bool {
        self.rank.as_deref().is_some_and(|r| r.eq_ignore_ascii_case(rank))
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
}

#[async_trait]
pub trait TaxonomyService: Send + Sync {
    async fn match_name(&self, name: &str) -> Result<NameMatchResponse, ServiceError>;
}

#[async_trait]
pub trait OccurrenceService: Send + Sync {
    /// ISO2 codes of countries with at least one occurrence of `key` in `year`.
    async fn countries_with_occurrences(&self, key: u64, year: i32) -> Result<BTreeSet<String>, ServiceError>;
}

#[async_trait]
pub trait RegulatoryService: Send + Sync {
    /// True when the service lists at least one regulatory categorization for the code.
    async fn is_categorized(&self, code: &str) -> Result<bool, ServiceError>;
}

const BACKBONE: &str = "taxonomic backbone";
const REGULATORY: &str = "regulatory taxonomy";

pub struct GbifClient {
    fetcher: HttpFetcher,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct FacetedSearch {
    #[serde(default)]
    facets: Vec<Facet>,
}

#[derive(Debug, Deserialize)]
struct Facet {
    field: String,
    #[serde(default)]
    counts: Vec<FacetCount>,
}

#[derive(Debug, Deserialize)]
struct FacetCount {
    name: String,
    count: u64,
}

impl GbifClient {
    pub fn new(base_url: impl Into<String>, http: HttpClientConfig) -> Result<Self> {
        Ok(Self {
            fetcher: HttpFetcher::new(http)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TaxonomyService for GbifClient {
    async fn match_name(&self, name: &str) -> Result<NameMatchResponse, ServiceError> {
        let url = format!("{}/species/match", self.base_url);
        let query = [
            ("name", name.to_string()),
            ("verbose", "true".to_string()),
            ("strict", "false".to_string()),
        ];
        self.fetcher
            .get_json(&url, &query)
            .await
            .map_err(|err| ServiceError::from_fetch(BACKBONE, err))
    }
}

#[async_trait]
impl OccurrenceService for GbifClient {
    async fn countries_with_occurrences(&self, key: u64, year: i32) -> Result<BTreeSet<String>, ServiceError> {
        let url = format!("{}/occurrence/search", self.base_url);
        let query = [
            ("taxonKey", key.to_string()),
            ("year", year.to_string()),
            ("limit", "0".to_string()),
            ("facet", "country".to_string()),
            ("facetLimit", "300".to_string()),
        ];
        let search: FacetedSearch = self
            .fetcher
            .get_json(&url, &query)
            .await
            .map_err(|err| ServiceError::from_fetch(BACKBONE, err))?;
        Ok(search
            .facets
            .into_iter()
            .filter(|f| f.field.eq_ignore_ascii_case("country"))
            .flat_map(|f| f.counts)
            .filter(|c| c.count > 0)
            .map(|c| c.name.to_ascii_uppercase())
            .collect())
    }
}

pub struct EppoClient {
    fetcher: HttpFetcher,
    base_url: String,
    token: String,
}

impl EppoClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, http: HttpClientConfig) -> Result<Self> {
        Ok(Self {
            fetcher: HttpFetcher::new(http)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }
}

#[async_trait]
impl RegulatoryService for EppoClient {
    async fn is_categorized(&self, code: &str) -> Result<bool, ServiceError> {
        let url = format!("{}/taxon/{}/categorization", self.base_url, code);
        let listings: Vec<serde_json::Value> = self
            .fetcher
            .get_json(&url, &[("authtoken", self.token.clone())])
            .await
            .map_err(|err| ServiceError::from_fetch(REGULATORY, err))?;
        Ok(!listings.is_empty())
    }
}
