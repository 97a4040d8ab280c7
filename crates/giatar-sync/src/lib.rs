//! Sync pipeline: key registry, name matching, consolidation and geographic normalization.

pub mod config;
pub mod consolidate;
pub mod export;
pub mod geo;
pub mod matcher;
pub mod occurrence;
pub mod pipeline;
pub mod promote;
pub mod registry;
pub mod scheduler;
pub mod services;
pub mod subtables;

use anyhow::Result;

pub use config::{PipelineConfig, SourceConfig, SourceRegistry, SubtableConfig};
pub use export::RunState;
pub use geo::{GeoNormalizer, GeoResolution};
pub use matcher::{MatchOutcome, NameMatch, NameMatcher};
pub use pipeline::{report_recent_markdown, PipelineError, SourceRunStats, SyncPipeline, SyncRunSummary};
pub use promote::{promote_placeholder, PromotionReport};
pub use registry::{KeyRegistry, Registration};
pub use scheduler::maybe_build_scheduler;

pub const CRATE_NAME: &str = "giatar-sync";

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = PipelineConfig::from_env();
    let pipeline = SyncPipeline::from_config(config)?;
    pipeline.run_once().await
}
