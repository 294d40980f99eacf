//! Vault storage interface + local filesystem implementation.
//!
//! Every path handed to a [`Storage`] is relative to the vault root and uses
//! plain components only; the mirror never addresses anything outside it.

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "memos-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("path {0} escapes the vault root")]
    OutsideRoot(PathBuf),
    #[error("file {0} already exists")]
    AlreadyExists(PathBuf),
    #[error("file {0} does not exist")]
    NotFound(PathBuf),
    #[error("{0} is not supported by this storage")]
    Unsupported(&'static str),
}

/// Primitives the sync core needs from the host vault.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn exists(&self, path: &Path) -> anyhow::Result<bool>;

    /// All files below `dir`, recursively. A missing directory lists as empty.
    async fn list_files_recursive(&self, dir: &Path) -> anyhow::Result<Vec<PathBuf>>;

    async fn read_to_string(&self, path: &Path) -> anyhow::Result<String>;

    async fn read_bytes(&self, path: &Path) -> anyhow::Result<Vec<u8>>;

    /// Create a new text file. Fails with [`StorageError::AlreadyExists`].
    async fn create(&self, path: &Path, content: &str) -> anyhow::Result<()>;

    /// Replace the content of an existing text file.
    async fn modify(&self, path: &Path, content: &str) -> anyhow::Result<()>;

    /// Create or overwrite a binary file.
    async fn write_bytes(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<()>;

    async fn create_dir_all(&self, dir: &Path) -> anyhow::Result<()>;

    async fn set_modified(&self, _path: &Path, _at: SystemTime) -> anyhow::Result<()> {
        Err(StorageError::Unsupported("setting modification time").into())
    }
}

#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, relative: &Path) -> anyhow::Result<PathBuf> {
        let mut out = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::CurDir => {}
                _ => return Err(StorageError::OutsideRoot(relative.to_path_buf()).into()),
            }
        }
        Ok(out)
    }

    /// Write through a temp file in the target directory, then rename into place.
    async fn write_atomic(&self, absolute_path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let parent = absolute_path
            .parent()
            .with_context(|| format!("{} has no parent directory", absolute_path.display()))?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn exists(&self, path: &Path) -> anyhow::Result<bool> {
        let absolute_path = self.resolve(path)?;
        fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking path {}", absolute_path.display()))
    }

    async fn list_files_recursive(&self, dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
        let start = self.resolve(dir)?;
        if !fs::try_exists(&start)
            .await
            .with_context(|| format!("checking directory {}", start.display()))?
        {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        let mut pending = vec![start];
        while let Some(current) = pending.pop() {
            let mut entries = fs::read_dir(&current)
                .await
                .with_context(|| format!("listing {}", current.display()))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .with_context(|| format!("reading entry in {}", current.display()))?
            {
                let file_type = entry
                    .file_type()
                    .await
                    .with_context(|| format!("inspecting {}", entry.path().display()))?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    let relative = path
                        .strip_prefix(&self.root)
                        .map(Path::to_path_buf)
                        .unwrap_or(path);
                    files.push(relative);
                }
            }
        }
        files.sort();
        Ok(files)
    }

    async fn read_to_string(&self, path: &Path) -> anyhow::Result<String> {
        let absolute_path = self.resolve(path)?;
        fs::read_to_string(&absolute_path)
            .await
            .with_context(|| format!("reading {}", absolute_path.display()))
    }

    async fn read_bytes(&self, path: &Path) -> anyhow::Result<Vec<u8>> {
        let absolute_path = self.resolve(path)?;
        fs::read(&absolute_path)
            .await
            .with_context(|| format!("reading {}", absolute_path.display()))
    }

    async fn create(&self, path: &Path, content: &str) -> anyhow::Result<()> {
        let absolute_path = self.resolve(path)?;
        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking path {}", absolute_path.display()))?
        {
            return Err(StorageError::AlreadyExists(path.to_path_buf()).into());
        }
        debug!(path = %path.display(), bytes = content.len(), "creating file");
        self.write_atomic(&absolute_path, content.as_bytes()).await
    }

    async fn modify(&self, path: &Path, content: &str) -> anyhow::Result<()> {
        let absolute_path = self.resolve(path)?;
        if !fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking path {}", absolute_path.display()))?
        {
            return Err(StorageError::NotFound(path.to_path_buf()).into());
        }
        debug!(path = %path.display(), bytes = content.len(), "modifying file");
        self.write_atomic(&absolute_path, content.as_bytes()).await
    }

    async fn write_bytes(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let absolute_path = self.resolve(path)?;
        self.write_atomic(&absolute_path, bytes).await
    }

    async fn create_dir_all(&self, dir: &Path) -> anyhow::Result<()> {
        let absolute_path = self.resolve(dir)?;
        fs::create_dir_all(&absolute_path)
            .await
            .with_context(|| format!("creating directory {}", absolute_path.display()))
    }

    async fn set_modified(&self, path: &Path, at: SystemTime) -> anyhow::Result<()> {
        let absolute_path = self.resolve(path)?;
        let display = absolute_path.display().to_string();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new().write(true).open(&absolute_path)?;
            file.set_times(std::fs::FileTimes::new().set_accessed(at).set_modified(at))
        })
        .await
        .context("joining set_modified task")?
        .with_context(|| format!("setting modification time on {display}"))
    }
}
