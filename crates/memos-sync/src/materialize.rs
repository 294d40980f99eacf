use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Context};
use chrono_tz::Tz;
use memos_client::MemoSource;
use memos_core::{EnrichedContent, Memo, Resource};
use memos_storage::Storage;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::paths::{month_dir, note_file_name, relative_link, resource_file_name, RESOURCE_DIR};

static WRAPPED_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#([^#\s]+)#").expect("valid regex"));
static INLINE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#([^#\s]+)(?:#|\s|$)").expect("valid regex"));

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The line in a mirrored note that records which memo it came from.
pub fn identity_marker(identity: &str) -> String {
    format!("> - ID: {identity}")
}

/// Whether `content` has `identity`'s marker as a whole line.
pub fn carries_identity_marker(content: &str, identity: &str) -> bool {
    let marker = identity_marker(identity);
    content.lines().any(|line| line.trim_end() == marker)
}

/// `#tag#` becomes `#tag`.
pub fn normalize_hash_tags(text: &str) -> String {
    WRAPPED_TAG.replace_all(text, "#$1").into_owned()
}

/// Inline `#tags` in first-seen order, without duplicates.
pub fn inline_tags(content: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for cap in INLINE_TAG.captures_iter(content) {
        let tag = &cap[1];
        if !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    }
    tags
}

pub fn property_block(memo: &Memo, tz: &Tz) -> String {
    let created = memo.create_time.with_timezone(tz).format(TIMESTAMP_FORMAT);
    let updated = memo.update_time.with_timezone(tz).format(TIMESTAMP_FORMAT);

    let mut block = String::from("\n\n---\n> [!note]- Memo Properties\n");
    block.push_str(&format!("> - Created: {created}\n"));
    block.push_str(&format!("> - Updated: {updated}\n"));
    block.push_str("> - Type: memo\n");
    let tags = inline_tags(&memo.content);
    if !tags.is_empty() {
        block.push_str(&format!("> - Tags: [{}]\n", tags.join(", ")));
    }
    block.push_str(&identity_marker(memo.identity()));
    block.push('\n');
    block.push_str(&format!(
        "> - Visibility: {}\n",
        memo.visibility.to_lowercase()
    ));
    block
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedNote {
    pub path: PathBuf,
    pub outcome: WriteOutcome,
    pub resources_written: usize,
    pub resources_skipped: usize,
}

fn note_title<'a>(memo: &'a Memo, enriched: &'a EnrichedContent) -> &'a str {
    enriched
        .title
        .as_deref()
        .unwrap_or_else(|| memo.identity_stem())
}

struct LocalLink {
    filename: String,
    link: String,
}

/// Writes one note per memo into `{root}/{YYYY}/{MM}/`.
pub struct Materializer {
    storage: Arc<dyn Storage>,
    source: Arc<dyn MemoSource>,
    sync_root: PathBuf,
    tz: Tz,
}

impl Materializer {
    pub fn new(
        storage: Arc<dyn Storage>,
        source: Arc<dyn MemoSource>,
        sync_root: impl Into<PathBuf>,
        tz: Tz,
    ) -> Self {
        Self {
            storage,
            source,
            sync_root: sync_root.into(),
            tz,
        }
    }

    pub fn note_path(&self, memo: &Memo, enriched: &EnrichedContent) -> PathBuf {
        let created = memo.create_time.with_timezone(&self.tz);
        month_dir(&self.sync_root, &created).join(note_file_name(note_title(memo, enriched)))
    }

    /// The path this memo writes to, and whether a note of its own is
    /// already there. A title taken by another memo's note falls back to
    /// `{title} ({identity_stem}).md`.
    pub async fn claim_note_path(
        &self,
        memo: &Memo,
        enriched: &EnrichedContent,
    ) -> anyhow::Result<(PathBuf, bool)> {
        let titled = self.note_path(memo, enriched);
        let dir = titled
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.sync_root.clone());
        let qualified = dir.join(note_file_name(&format!(
            "{} ({})",
            note_title(memo, enriched),
            memo.identity_stem()
        )));

        for candidate in [titled, qualified] {
            let taken = self
                .storage
                .exists(&candidate)
                .await
                .with_context(|| format!("checking {}", candidate.display()))?;
            if !taken {
                return Ok((candidate, false));
            }
            match self.storage.read_to_string(&candidate).await {
                Ok(existing) if carries_identity_marker(&existing, memo.identity()) => {
                    return Ok((candidate, true));
                }
                Ok(_) => {
                    debug!(path = %candidate.display(), identity = memo.identity(), "note name belongs to another memo");
                }
                Err(err) => {
                    warn!(path = %candidate.display(), error = %err, "unreadable note blocks this name");
                }
            }
        }
        bail!(
            "no free note name for {} in {}",
            memo.identity(),
            dir.display()
        )
    }

    pub async fn materialize(
        &self,
        memo: &Memo,
        enriched: &EnrichedContent,
    ) -> anyhow::Result<MaterializedNote> {
        let (note_path, owned) = self.claim_note_path(memo, enriched).await?;
        let dir = note_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.sync_root.clone());
        self.storage
            .create_dir_all(&dir)
            .await
            .with_context(|| format!("creating month directory {}", dir.display()))?;

        let mut document = normalize_hash_tags(&enriched.body);

        let (images, others): (Vec<&Resource>, Vec<&Resource>) =
            memo.resources.iter().partition(|r| r.is_image());
        let image_links = self.localize_all(&images, &dir, &note_path).await;
        let other_links = self.localize_all(&others, &dir, &note_path).await;

        if !image_links.is_empty() {
            document.push_str("\n\n");
            for l in &image_links {
                document.push_str(&format!("![{}]({})\n", l.filename, l.link));
            }
        }
        if !other_links.is_empty() {
            document.push_str("\n\n### Attachments\n");
            for l in &other_links {
                document.push_str(&format!("- [{}]({})\n", l.filename, l.link));
            }
        }
        document.push_str(&property_block(memo, &self.tz));

        let outcome = if owned {
            self.storage
                .modify(&note_path, &document)
                .await
                .with_context(|| format!("updating {}", note_path.display()))?;
            WriteOutcome::Updated
        } else {
            self.storage
                .create(&note_path, &document)
                .await
                .with_context(|| format!("creating {}", note_path.display()))?;
            WriteOutcome::Created
        };

        if let Err(err) = self
            .storage
            .set_modified(&note_path, SystemTime::from(memo.create_time))
            .await
        {
            debug!(path = %note_path.display(), error = %err, "could not set note modification time");
        }

        let resources_written = image_links.len() + other_links.len();
        Ok(MaterializedNote {
            path: note_path,
            outcome,
            resources_written,
            resources_skipped: memo.resources.len() - resources_written,
        })
    }

    async fn localize_all(
        &self,
        resources: &[&Resource],
        month_dir: &Path,
        note_path: &Path,
    ) -> Vec<LocalLink> {
        let mut links = Vec::with_capacity(resources.len());
        for resource in resources {
            match self.localize(resource, month_dir).await {
                Ok(local) => links.push(LocalLink {
                    filename: resource.filename.clone(),
                    link: relative_link(note_path, &local),
                }),
                Err(err) => {
                    warn!(resource = %resource.name, filename = %resource.filename, error = %format!("{err:#}"), "skipping resource")
                }
            }
        }
        links
    }

    async fn localize(&self, resource: &Resource, month_dir: &Path) -> anyhow::Result<PathBuf> {
        let bytes = self
            .source
            .download_resource(resource)
            .await
            .with_context(|| format!("downloading {}", resource.name))?;
        let resource_dir = month_dir.join(RESOURCE_DIR);
        self.storage.create_dir_all(&resource_dir).await?;
        let local = resource_dir.join(resource_file_name(resource));
        self.storage.write_bytes(&local, &bytes).await?;
        debug!(path = %local.display(), bytes = bytes.len(), "resource stored");
        Ok(local)
    }
}
