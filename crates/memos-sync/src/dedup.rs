use std::path::PathBuf;
use std::sync::Arc;

use memos_storage::Storage;
use tracing::warn;

use crate::materialize::carries_identity_marker;

/// Answers "is this memo already mirrored?" by scanning note markers under
/// the sync root.
pub struct DedupIndex {
    storage: Arc<dyn Storage>,
    sync_root: PathBuf,
}

impl DedupIndex {
    pub fn new(storage: Arc<dyn Storage>, sync_root: impl Into<PathBuf>) -> Self {
        Self {
            storage,
            sync_root: sync_root.into(),
        }
    }

    /// Storage failures are logged and reported as "not mirrored".
    pub async fn exists(&self, identity: &str) -> bool {
        match self.find(identity).await {
            Ok(found) => found.is_some(),
            Err(err) => {
                warn!(identity, error = %format!("{err:#}"), "dedup scan failed; treating memo as new");
                false
            }
        }
    }

    /// The note carrying `identity`'s marker, if any. Notes that cannot be
    /// read are skipped; only a failed listing is an error.
    pub async fn find(&self, identity: &str) -> anyhow::Result<Option<PathBuf>> {
        for path in self.storage.list_files_recursive(&self.sync_root).await? {
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let content = match self.storage.read_to_string(&path).await {
                Ok(content) => content,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable note");
                    continue;
                }
            };
            if carries_identity_marker(&content, identity) {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}
