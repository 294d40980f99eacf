//! Core domain model for the memos mirror.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "memos-core";

/// Extensions (lower-case, no dot) rendered as inline image embeds.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];

/// One remote note record as returned by the memos service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memo {
    /// Path-like identity, e.g. `memos/42`. Durable key of the mirror.
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_visibility")]
    pub visibility: String,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    #[serde(default)]
    pub display_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub creator: String,
    #[serde(default, alias = "state")]
    pub row_status: String,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default, alias = "attachments")]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_visibility() -> String {
    "PRIVATE".to_string()
}

impl Memo {
    pub fn identity(&self) -> &str {
        &self.name
    }

    /// Identity without the `memos/` collection prefix.
    pub fn identity_stem(&self) -> &str {
        self.name.strip_prefix("memos/").unwrap_or(&self.name)
    }
}

/// Binary attachment owned by exactly one [`Memo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub name: String,
    #[serde(default)]
    pub uid: String,
    pub filename: String,
    #[serde(default, rename = "type")]
    pub media_type: String,
    #[serde(default, deserialize_with = "deserialize_size")]
    pub size: u64,
    #[serde(default)]
    pub create_time: Option<DateTime<Utc>>,
}

impl Resource {
    /// Trailing segment of the resource name (`resources/abc` -> `abc`).
    pub fn resource_id(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    pub fn is_image(&self) -> bool {
        let Some((_, ext)) = self.filename.rsplit_once('.') else {
            return false;
        };
        let ext = ext.to_ascii_lowercase();
        IMAGE_EXTENSIONS.contains(&ext.as_str())
    }
}

// int64 fields arrive as JSON strings from the service's proto gateway.
fn deserialize_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawSize {
        Number(u64),
        Text(String),
    }

    match Option::<RawSize>::deserialize(deserializer)? {
        None => Ok(0),
        Some(RawSize::Number(n)) => Ok(n),
        Some(RawSize::Text(text)) => {
            let text = text.trim();
            if text.is_empty() {
                Ok(0)
            } else {
                text.parse().map_err(serde::de::Error::custom)
            }
        }
    }
}

/// One page of the list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoPage {
    pub memos: Vec<Memo>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

impl MemoPage {
    /// Continuation token, treating an empty string as absent.
    pub fn continuation(&self) -> Option<&str> {
        self.next_page_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

/// Enrichment result for a single memo, consumed once by materialization.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnrichedContent {
    pub title: Option<String>,
    pub summary_block: Option<String>,
    pub tag_block: Option<String>,
    pub body: String,
}

impl EnrichedContent {
    pub fn is_enriched(&self) -> bool {
        self.summary_block.is_some() || self.tag_block.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryLanguage {
    #[default]
    Zh,
    En,
    Ja,
    Ko,
}

impl SummaryLanguage {
    /// Language name as it should appear inside a prompt.
    pub fn prompt_name(self) -> &'static str {
        match self {
            Self::Zh => "中文",
            Self::En => "English",
            Self::Ja => "日本語",
            Self::Ko => "한국어",
        }
    }

    pub fn is_chinese(self) -> bool {
        matches!(self, Self::Zh)
    }
}
