//! Sync orchestration: dedup, enrichment, materialization and weekly digests
//! over a [`memos_client::MemoSource`] and a [`memos_storage::Storage`] vault.

pub mod config;
pub mod dedup;
pub mod digest;
pub mod enrich;
pub mod materialize;
pub mod paths;
pub mod pipeline;
pub mod schedule;

use std::path::Path;

use anyhow::Result;

pub use config::{AiConfig, ConfigError, MirrorConfig, SyncFrequency};
pub use dedup::DedupIndex;
pub use digest::{DigestAggregator, DigestEntry, DigestReport, WeekKey};
pub use enrich::{Enricher, EnrichmentSettings};
pub use materialize::{MaterializedNote, Materializer, WriteOutcome};
pub use pipeline::{LogProgress, ProgressSink, SyncPipeline, SyncRunSummary, SyncSession, SyncStage};
pub use schedule::maybe_build_scheduler;

pub const CRATE_NAME: &str = "memos-sync";

/// Load configuration (file plus environment), then run a single sync.
pub async fn run_sync_once_from_config(path: Option<&Path>) -> Result<SyncRunSummary> {
    let config = MirrorConfig::load(path)?;
    let pipeline = SyncPipeline::from_config(&config)?;
    pipeline.run_once().await
}
