use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use giatar_core::{SourceId, SubtableGroup};
use giatar_sources::FeedKind;
use giatar_storage::{HttpClientConfig, RetryPolicy};
use serde::Deserialize;
use tokio::fs;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub gbif_api_url: String,
    pub eppo_api_url: String,
    /// Without a token the categorization refresh is skipped.
    pub eppo_token: Option<String>,
    /// First year fetched for species with no occurrence history.
    pub base_obs_year: i32,
    pub retries: usize,
    pub retry_delay: Duration,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("GIATAR_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            data_dir: std::env::var("GIATAR_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            gbif_api_url: std::env::var("GBIF_API_URL").unwrap_or_else(|_| "https://api.gbif.org/v1".to_string()),
            eppo_api_url: std::env::var("EPPO_API_URL")
                .unwrap_or_else(|_| "https://data.eppo.int/api/rest/1.0".to_string()),
            eppo_token: std::env::var("EPPO_TOKEN").ok().filter(|t| !t.trim().is_empty()),
            base_obs_year: env_parse("GIATAR_BASE_OBS_YEAR", 1970),
            retries: env_parse("GIATAR_RETRIES", 5),
            retry_delay: Duration::from_secs(env_parse("GIATAR_RETRY_DELAY_SECS", 5)),
            http_timeout_secs: env_parse("GIATAR_HTTP_TIMEOUT_SECS", 30),
            user_agent: std::env::var("GIATAR_USER_AGENT").unwrap_or_else(|_| "giatar-sync/0.1".to_string()),
            scheduler_enabled: std::env::var("GIATAR_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("GIATAR_SYNC_CRON").unwrap_or_else(|_| "0 0 3 * * Sun".to_string()),
            workspace_root,
        }
    }

    /// Defaults rooted at one directory; the data directory sits inside it.
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            data_dir: root.join("data"),
            gbif_api_url: "https://api.gbif.org/v1".to_string(),
            eppo_api_url: "https://data.eppo.int/api/rest/1.0".to_string(),
            eppo_token: None,
            base_obs_year: 1970,
            retries: 5,
            retry_delay: Duration::from_secs(5),
            http_timeout_secs: 30,
            user_agent: "giatar-sync/0.1".to_string(),
            scheduler_enabled: false,
            sync_cron: "0 0 3 * * Sun".to_string(),
            workspace_root: root,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.retries, self.retry_delay)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            retry: self.retry_policy(),
        }
    }

    pub fn reports_root(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Contents of `sources.yaml`: where each export lives, relative to the workspace root.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub native_ranges: Option<PathBuf>,
    #[serde(default)]
    pub bioregion_crosswalk: Option<PathBuf>,
    #[serde(default)]
    pub subtables: Vec<SubtableConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source: SourceId,
    pub display_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub species_export: PathBuf,
    /// Compendium only.
    #[serde(default)]
    pub datasheet_types: Option<PathBuf>,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub kind: FeedKind,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubtableConfig {
    pub group: SubtableGroup,
    pub name: String,
    pub path: PathBuf,
    pub link_column: String,
    /// Source whose local codes fill `link_column`; absent when it already holds canonical keys.
    #[serde(default)]
    pub source: Option<SourceId>,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceRegistry {
    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let registry: SourceRegistry = serde_yaml::from_str(text)?;
        for (i, source) in registry.sources.iter().enumerate() {
            if registry.sources[..i].iter().any(|s| s.source == source.source) {
                anyhow::bail!("source {} is configured twice", source.source);
            }
        }
        Ok(registry)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn source(&self, id: SourceId) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source == id)
    }
}
