use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use memos_ai::{backend_from_settings, AiBackend};
use memos_client::{MemoSource, MemosClient};
use memos_core::Memo;
use memos_storage::{LocalStorage, Storage};
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::config::{ConfigError, MirrorConfig};
use crate::dedup::DedupIndex;
use crate::digest::{DigestAggregator, DigestEntry};
use crate::enrich::{EnrichmentSettings, Enricher};
use crate::materialize::{MaterializedNote, Materializer, WriteOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    Fetching,
    Processing,
    Digesting,
    Done,
}

/// Progress counters of the run in flight. Single writer: the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSession {
    pub total: usize,
    pub processed: usize,
    pub current: Option<String>,
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, stage: SyncStage, session: &SyncSession);
}

/// Default sink: progress goes to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn on_progress(&self, stage: SyncStage, session: &SyncSession) {
        match stage {
            SyncStage::Processing => debug!(
                processed = session.processed,
                total = session.total,
                current = ?session.current,
                "sync progress"
            ),
            other => info!(stage = ?other, processed = session.processed, total = session.total, "sync stage"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub discovered: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped_existing: usize,
    pub failed: usize,
    pub digests_written: usize,
}

impl SyncRunSummary {
    pub fn written(&self) -> usize {
        self.created + self.updated
    }
}

enum MemoOutcome {
    AlreadyMirrored,
    Written(MaterializedNote),
}

/// One sync run end to end: fetch, per-record dedup/enrich/write, digests.
///
/// Runs are serialized; [`SyncPipeline::try_run_once`] skips instead of
/// queueing when a run is already in flight.
pub struct SyncPipeline {
    source: Arc<dyn MemoSource>,
    dedup: DedupIndex,
    enricher: Enricher,
    materializer: Materializer,
    digests: Option<DigestAggregator>,
    limit: usize,
    progress: Box<dyn ProgressSink>,
    in_flight: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        config: &MirrorConfig,
        source: Arc<dyn MemoSource>,
        storage: Arc<dyn Storage>,
        ai: Arc<dyn AiBackend>,
    ) -> Result<Self, ConfigError> {
        if config.sync_limit == 0 {
            return Err(ConfigError::InvalidSyncLimit);
        }
        let tz = config.tz()?;
        let sync_root: PathBuf = config.sync_root();
        let language = config.ai.summary_language;

        let enricher = Enricher::new(
            ai.clone(),
            EnrichmentSettings {
                ai_enabled: config.ai.enabled,
                summary: config.ai.intelligent_summary,
                tags: config.ai.auto_tags,
                language,
            },
        );
        let digests = config.ai.digest_enabled().then(|| {
            DigestAggregator::new(storage.clone(), ai.clone(), sync_root.clone(), tz, language)
        });

        Ok(Self {
            dedup: DedupIndex::new(storage.clone(), sync_root.clone()),
            materializer: Materializer::new(storage, source.clone(), sync_root, tz),
            source,
            enricher,
            digests,
            limit: config.sync_limit,
            progress: Box::new(LogProgress),
            in_flight: Mutex::new(()),
        })
    }

    /// Validate `config` and wire the HTTP client, local vault and AI backend.
    pub fn from_config(config: &MirrorConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let client = MemosClient::new(config.client_config()).context("building memos client")?;
        let storage = LocalStorage::new(&config.vault_root);
        let ai = backend_from_settings(&config.backend_settings())
            .context("building AI backend")?;
        info!(
            api_url = %client.api_url(),
            vault = %storage.root().display(),
            backend = ai.name(),
            "sync pipeline ready"
        );
        Ok(Self::new(config, Arc::new(client), Arc::new(storage), ai)?)
    }

    pub fn with_progress(mut self, progress: impl ProgressSink + 'static) -> Self {
        self.progress = Box::new(progress);
        self
    }

    /// Run a sync, waiting for any run already in flight to finish first.
    pub async fn run_once(&self) -> anyhow::Result<SyncRunSummary> {
        let _guard = self.in_flight.lock().await;
        self.run_locked().await
    }

    /// Run a sync unless one is already in flight, in which case `None`.
    pub async fn try_run_once(&self) -> Option<anyhow::Result<SyncRunSummary>> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            return None;
        };
        Some(self.run_locked().await)
    }

    async fn run_locked(&self) -> anyhow::Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run(run_id).instrument(span).await
    }

    async fn run(&self, run_id: Uuid) -> anyhow::Result<SyncRunSummary> {
        let started_at = Utc::now();
        let mut session = SyncSession::default();
        self.progress.on_progress(SyncStage::Fetching, &session);

        let memos = self
            .source
            .fetch_all(self.limit)
            .await
            .context("fetching memos")?;
        session.total = memos.len();
        info!(count = memos.len(), limit = self.limit, "memos fetched");

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            discovered: memos.len(),
            created: 0,
            updated: 0,
            skipped_existing: 0,
            failed: 0,
            digests_written: 0,
        };
        let mut digest_entries = Vec::with_capacity(memos.len());

        for memo in &memos {
            session.current = Some(memo.identity().to_string());
            let span = info_span!("memo", identity = %memo.identity());
            match self.process(memo).instrument(span).await {
                Ok(MemoOutcome::AlreadyMirrored) => summary.skipped_existing += 1,
                Ok(MemoOutcome::Written(note)) => match note.outcome {
                    WriteOutcome::Created => summary.created += 1,
                    WriteOutcome::Updated => summary.updated += 1,
                },
                Err(err) => {
                    error!(identity = %memo.identity(), error = %format!("{err:#}"), "failed to mirror memo");
                    summary.failed += 1;
                }
            }
            digest_entries.push(DigestEntry {
                identity: memo.identity().to_string(),
                created_at: memo.create_time,
                content: memo.content.clone(),
            });
            session.processed += 1;
            self.progress.on_progress(SyncStage::Processing, &session);
        }
        session.current = None;

        if let Some(digests) = &self.digests {
            self.progress.on_progress(SyncStage::Digesting, &session);
            let report = digests.generate_digests(&digest_entries).await;
            debug!(?report, "digest pass finished");
            summary.digests_written = report.written;
        }

        summary.finished_at = Utc::now();
        self.progress.on_progress(SyncStage::Done, &session);
        info!(
            discovered = summary.discovered,
            created = summary.created,
            updated = summary.updated,
            skipped_existing = summary.skipped_existing,
            failed = summary.failed,
            digests_written = summary.digests_written,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn process(&self, memo: &Memo) -> anyhow::Result<MemoOutcome> {
        if self.dedup.exists(memo.identity()).await {
            debug!("already mirrored; skipping");
            return Ok(MemoOutcome::AlreadyMirrored);
        }
        let enriched = self.enricher.enrich(memo).await;
        let note = self.materializer.materialize(memo, &enriched).await?;
        debug!(path = %note.path.display(), outcome = ?note.outcome, enriched = enriched.is_enriched(), "memo mirrored");
        Ok(MemoOutcome::Written(note))
    }
}
