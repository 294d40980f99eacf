use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use memos_ai::{AiBackend, AiError};
use memos_client::{ClientError, MemoSource};
use memos_core::{Memo, Resource, SummaryLanguage};
use memos_storage::{LocalStorage, Storage};
use memos_sync::{MirrorConfig, ProgressSink, SyncPipeline, SyncSession, SyncStage};
use tempfile::tempdir;
use tokio::sync::Notify;

fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 9, 15, 0).unwrap()
}

fn memo(id: u32, content: &str, created: DateTime<Utc>) -> Memo {
    Memo {
        name: format!("memos/{id}"),
        uid: format!("uid-{id}"),
        content: content.to_string(),
        visibility: "PRIVATE".to_string(),
        create_time: created,
        update_time: created,
        display_time: None,
        creator: "users/1".to_string(),
        row_status: "NORMAL".to_string(),
        pinned: false,
        resources: Vec::new(),
        tags: Vec::new(),
    }
}

struct FakeSource {
    memos: Vec<Memo>,
}

#[async_trait]
impl MemoSource for FakeSource {
    async fn fetch_all(&self, limit: usize) -> Result<Vec<Memo>, ClientError> {
        Ok(self.memos.iter().take(limit).cloned().collect())
    }

    async fn download_resource(&self, resource: &Resource) -> Result<Vec<u8>, ClientError> {
        Ok(resource.filename.as_bytes().to_vec())
    }
}

struct BrokenSource;

#[async_trait]
impl MemoSource for BrokenSource {
    async fn fetch_all(&self, _limit: usize) -> Result<Vec<Memo>, ClientError> {
        Err(ClientError::HttpStatus {
            status: 401,
            url: "http://memos.test/api/v1/memos".to_string(),
            body: "unauthenticated".to_string(),
        })
    }

    async fn download_resource(&self, _resource: &Resource) -> Result<Vec<u8>, ClientError> {
        unreachable!("nothing to download")
    }
}

/// Blocks inside `fetch_all` until released.
struct GatedSource {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl MemoSource for GatedSource {
    async fn fetch_all(&self, _limit: usize) -> Result<Vec<Memo>, ClientError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(Vec::new())
    }

    async fn download_resource(&self, _resource: &Resource) -> Result<Vec<u8>, ClientError> {
        unreachable!("nothing to download")
    }
}

#[derive(Default)]
struct FakeAi {
    fail: bool,
    digest_requests: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl AiBackend for FakeAi {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn generate_summary(&self, _text: &str, _language: SummaryLanguage) -> Result<String, AiError> {
        if self.fail {
            return Err(AiError::RateLimited {
                provider: "fake",
                status: 429,
                body: "slow down".to_string(),
            });
        }
        Ok("Short recap.".to_string())
    }

    async fn generate_tags(&self, _text: &str) -> Result<Vec<String>, AiError> {
        Ok(vec!["life".to_string()])
    }

    async fn generate_weekly_digest(
        &self,
        texts: &[String],
        _language: SummaryLanguage,
    ) -> Result<String, AiError> {
        self.digest_requests.lock().unwrap().push(texts.to_vec());
        if self.fail {
            return Err(AiError::Config("still limited".to_string()));
        }
        Ok("Busy but good week.".to_string())
    }
}

/// Local storage that refuses to create notes whose path contains `poison`.
struct FailingStorage {
    inner: LocalStorage,
    poison: &'static str,
}

#[async_trait]
impl Storage for FailingStorage {
    async fn exists(&self, path: &Path) -> anyhow::Result<bool> {
        self.inner.exists(path).await
    }

    async fn list_files_recursive(&self, dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
        self.inner.list_files_recursive(dir).await
    }

    async fn read_to_string(&self, path: &Path) -> anyhow::Result<String> {
        self.inner.read_to_string(path).await
    }

    async fn read_bytes(&self, path: &Path) -> anyhow::Result<Vec<u8>> {
        self.inner.read_bytes(path).await
    }

    async fn create(&self, path: &Path, content: &str) -> anyhow::Result<()> {
        if path.to_string_lossy().contains(self.poison) {
            anyhow::bail!("disk full while writing {}", path.display());
        }
        self.inner.create(path, content).await
    }

    async fn modify(&self, path: &Path, content: &str) -> anyhow::Result<()> {
        self.inner.modify(path, content).await
    }

    async fn write_bytes(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        self.inner.write_bytes(path, bytes).await
    }

    async fn create_dir_all(&self, dir: &Path) -> anyhow::Result<()> {
        self.inner.create_dir_all(dir).await
    }

    async fn set_modified(&self, path: &Path, at: SystemTime) -> anyhow::Result<()> {
        self.inner.set_modified(path, at).await
    }
}

#[derive(Clone, Default)]
struct RecordingProgress {
    events: Arc<Mutex<Vec<(SyncStage, usize, usize)>>>,
}

impl ProgressSink for RecordingProgress {
    fn on_progress(&self, stage: SyncStage, session: &SyncSession) {
        self.events
            .lock()
            .unwrap()
            .push((stage, session.processed, session.total));
    }
}

fn config(ai_enabled: bool) -> MirrorConfig {
    let mut config = MirrorConfig {
        api_url: "http://memos.test/api/v1".to_string(),
        access_token: "t0ken".to_string(),
        sync_limit: 10,
        ..Default::default()
    };
    config.ai.enabled = ai_enabled;
    config
}

#[tokio::test]
async fn first_run_writes_notes_and_second_run_changes_nothing() {
    let dir = tempdir().unwrap();
    let storage = Arc::new(LocalStorage::new(dir.path()));
    let source = Arc::new(FakeSource {
        memos: vec![
            memo(1, "# Groceries\nmilk and eggs #errands", at(2024, 5, 6)),
            memo(2, "quick thought", at(2024, 4, 30)),
        ],
    });
    let pipeline = SyncPipeline::new(
        &config(false),
        source,
        storage.clone(),
        Arc::new(memos_ai::DisabledBackend),
    )
    .unwrap();

    let first = pipeline.run_once().await.unwrap();
    assert_eq!(first.discovered, 2);
    assert_eq!(first.created, 2);
    assert_eq!(first.failed, 0);
    assert_eq!(first.digests_written, 0);

    let files = storage.list_files_recursive(Path::new("memos")).await.unwrap();
    assert_eq!(
        files,
        vec![
            PathBuf::from("memos/2024/04/2.md"),
            PathBuf::from("memos/2024/05/Groceries.md"),
        ]
    );
    let groceries = storage
        .read_to_string(Path::new("memos/2024/05/Groceries.md"))
        .await
        .unwrap();
    assert!(groceries.starts_with("# Groceries\n\nmilk and eggs #errands"));
    assert!(groceries.contains("> [!note]- Memo Properties\n"));
    assert!(groceries.contains("> - Tags: [errands]\n"));
    assert!(groceries.contains("> - ID: memos/1\n"));
    assert!(groceries.contains("> - Visibility: private\n"));

    let second = pipeline.run_once().await.unwrap();
    assert_eq!(second.skipped_existing, 2);
    assert_eq!(second.written(), 0);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(
        storage
            .read_to_string(Path::new("memos/2024/05/Groceries.md"))
            .await
            .unwrap(),
        groceries
    );
}

#[tokio::test]
async fn enriched_run_writes_callouts_and_one_digest_per_week() {
    let dir = tempdir().unwrap();
    let storage = Arc::new(LocalStorage::new(dir.path()));
    let ai = Arc::new(FakeAi::default());
    let source = Arc::new(FakeSource {
        memos: vec![
            memo(3, "Finished the quarterly planning doc today.", at(2024, 5, 7)),
            memo(4, "Long walk by the river after work.", at(2024, 5, 9)),
        ],
    });
    let pipeline = SyncPipeline::new(&config(true), source, storage.clone(), ai.clone()).unwrap();

    let first = pipeline.run_once().await.unwrap();
    assert_eq!(first.created, 2);
    assert_eq!(first.digests_written, 1);

    let note = storage
        .read_to_string(Path::new("memos/2024/05/3.md"))
        .await
        .unwrap();
    assert!(note.starts_with("> [!abstract]+ 内容摘要\n> Short recap.\n\n> [!info]- 相关标签\n> #life\n\n"));
    assert!(storage
        .exists(Path::new("memos/2024/weekly/第19周总结.md"))
        .await
        .unwrap());

    let second = pipeline.run_once().await.unwrap();
    assert_eq!(second.skipped_existing, 2);
    assert_eq!(second.digests_written, 0);
    assert_eq!(ai.digest_requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn exhausted_ai_falls_back_to_plain_notes() {
    let dir = tempdir().unwrap();
    let storage = Arc::new(LocalStorage::new(dir.path()));
    let ai = Arc::new(FakeAi {
        fail: true,
        ..Default::default()
    });
    let source = Arc::new(FakeSource {
        memos: vec![memo(5, "# Idea\nA reading list app that syncs offline.", at(2024, 5, 8))],
    });
    let pipeline = SyncPipeline::new(&config(true), source, storage.clone(), ai).unwrap();

    let summary = pipeline.run_once().await.unwrap();

    assert_eq!(summary.created, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.digests_written, 0);
    let note = storage
        .read_to_string(Path::new("memos/2024/05/Idea.md"))
        .await
        .unwrap();
    assert!(note.starts_with("# Idea\n\nA reading list app that syncs offline.\n\n---\n"));
    assert!(!note.contains("[!abstract]"));
}

#[tokio::test]
async fn one_failed_write_does_not_stop_the_batch() {
    let dir = tempdir().unwrap();
    let storage = Arc::new(FailingStorage {
        inner: LocalStorage::new(dir.path()),
        poison: "Boom",
    });
    let source = Arc::new(FakeSource {
        memos: vec![
            memo(6, "# Boom\nthis one cannot be written", at(2024, 5, 8)),
            memo(7, "# Fine\nthis one is written", at(2024, 5, 8)),
        ],
    });
    let pipeline = SyncPipeline::new(
        &config(false),
        source,
        storage.clone(),
        Arc::new(memos_ai::DisabledBackend),
    )
    .unwrap();

    let summary = pipeline.run_once().await.unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.created, 1);
    assert!(storage.exists(Path::new("memos/2024/05/Fine.md")).await.unwrap());
    assert!(!storage.exists(Path::new("memos/2024/05/Boom.md")).await.unwrap());
}

#[tokio::test]
async fn fetch_failure_fails_the_run_without_writing() {
    let dir = tempdir().unwrap();
    let storage = Arc::new(LocalStorage::new(dir.path()));
    let pipeline = SyncPipeline::new(
        &config(false),
        Arc::new(BrokenSource),
        storage.clone(),
        Arc::new(memos_ai::DisabledBackend),
    )
    .unwrap();

    let err = pipeline.run_once().await.unwrap_err();

    assert!(format!("{err:#}").contains("401"));
    assert!(storage
        .list_files_recursive(Path::new("memos"))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn progress_sink_sees_every_record() {
    let dir = tempdir().unwrap();
    let progress = RecordingProgress::default();
    let source = Arc::new(FakeSource {
        memos: vec![
            memo(8, "first", at(2024, 5, 8)),
            memo(9, "second", at(2024, 5, 8)),
        ],
    });
    let pipeline = SyncPipeline::new(
        &config(false),
        source,
        Arc::new(LocalStorage::new(dir.path())),
        Arc::new(memos_ai::DisabledBackend),
    )
    .unwrap()
    .with_progress(progress.clone());

    pipeline.run_once().await.unwrap();

    let events = progress.events.lock().unwrap();
    assert_eq!(
        *events,
        vec![
            (SyncStage::Fetching, 0, 0),
            (SyncStage::Processing, 1, 2),
            (SyncStage::Processing, 2, 2),
            (SyncStage::Done, 2, 2),
        ]
    );
}

#[tokio::test]
async fn overlapping_trigger_is_skipped_while_a_run_is_in_flight() {
    let dir = tempdir().unwrap();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let pipeline = Arc::new(
        SyncPipeline::new(
            &config(false),
            Arc::new(GatedSource {
                entered: entered.clone(),
                release: release.clone(),
            }),
            Arc::new(LocalStorage::new(dir.path())),
            Arc::new(memos_ai::DisabledBackend),
        )
        .unwrap(),
    );

    let running = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.run_once().await })
    };
    entered.notified().await;

    assert!(pipeline.try_run_once().await.is_none());

    release.notify_one();
    let summary = running.await.unwrap().unwrap();
    assert_eq!(summary.discovered, 0);

    release.notify_one();
    assert!(pipeline.try_run_once().await.is_some());
}

#[tokio::test]
async fn weekly_digest_reads_raw_memo_content_for_old_and_new_records() {
    let dir = tempdir().unwrap();
    let storage = Arc::new(LocalStorage::new(dir.path()));
    let older = memo(10, "Planted tomatoes in the back garden.", at(2024, 5, 7));
    let newer = memo(11, "Repotted the basil and watered everything.", at(2024, 5, 9));

    let limited = SyncPipeline::new(
        &config(true),
        Arc::new(FakeSource {
            memos: vec![older.clone()],
        }),
        storage.clone(),
        Arc::new(FakeAi {
            fail: true,
            ..Default::default()
        }),
    )
    .unwrap();
    let first = limited.run_once().await.unwrap();
    assert_eq!((first.created, first.digests_written), (1, 0));

    let ai = Arc::new(FakeAi::default());
    let pipeline = SyncPipeline::new(
        &config(true),
        Arc::new(FakeSource {
            memos: vec![older.clone(), newer.clone()],
        }),
        storage.clone(),
        ai.clone(),
    )
    .unwrap();
    let second = pipeline.run_once().await.unwrap();

    assert_eq!((second.skipped_existing, second.created), (1, 1));
    assert_eq!(second.digests_written, 1);
    let enriched = storage
        .read_to_string(Path::new("memos/2024/05/11.md"))
        .await
        .unwrap();
    assert!(enriched.contains("> Short recap."));
    assert_eq!(
        *ai.digest_requests.lock().unwrap(),
        vec![vec![older.content, newer.content]]
    );
}

#[tokio::test]
async fn same_titled_memos_each_get_a_note_and_stay_mirrored() {
    let dir = tempdir().unwrap();
    let storage = Arc::new(LocalStorage::new(dir.path()));
    let source = Arc::new(FakeSource {
        memos: vec![
            memo(1, "# Diary\nrainy morning", at(2024, 5, 6)),
            memo(2, "# Diary\nsunny afternoon", at(2024, 5, 8)),
        ],
    });
    let pipeline = SyncPipeline::new(
        &config(false),
        source,
        storage.clone(),
        Arc::new(memos_ai::DisabledBackend),
    )
    .unwrap();

    let first = pipeline.run_once().await.unwrap();
    assert_eq!((first.created, first.updated), (2, 0));
    let files = storage.list_files_recursive(Path::new("memos")).await.unwrap();
    assert_eq!(
        files,
        vec![
            PathBuf::from("memos/2024/05/Diary (2).md"),
            PathBuf::from("memos/2024/05/Diary.md"),
        ]
    );
    let original = storage
        .read_to_string(Path::new("memos/2024/05/Diary.md"))
        .await
        .unwrap();
    assert!(original.contains("rainy morning"));
    assert!(original.contains("> - ID: memos/1\n"));
    let second_note = storage
        .read_to_string(Path::new("memos/2024/05/Diary (2).md"))
        .await
        .unwrap();
    assert!(second_note.contains("> - ID: memos/2\n"));

    let second = pipeline.run_once().await.unwrap();
    assert_eq!(second.skipped_existing, 2);
    assert_eq!(second.written(), 0);
}

#[tokio::test]
async fn unreadable_stray_note_does_not_force_a_rewrite() {
    let dir = tempdir().unwrap();
    let storage = Arc::new(LocalStorage::new(dir.path()));
    let source = Arc::new(FakeSource {
        memos: vec![
            memo(12, "# Errands\npost office", at(2024, 5, 6)),
            memo(13, "call the plumber", at(2024, 5, 7)),
        ],
    });
    let pipeline = SyncPipeline::new(
        &config(false),
        source,
        storage.clone(),
        Arc::new(memos_ai::DisabledBackend),
    )
    .unwrap();
    assert_eq!(pipeline.run_once().await.unwrap().created, 2);

    storage
        .write_bytes(Path::new("memos/0000/scratch.md"), &[0xff, 0xfe, 0x00])
        .await
        .unwrap();

    let second = pipeline.run_once().await.unwrap();
    assert_eq!(second.skipped_existing, 2);
    assert_eq!(second.written(), 0);
    assert_eq!(second.failed, 0);
}
