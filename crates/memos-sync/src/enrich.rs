use std::sync::Arc;

use memos_ai::{AiBackend, AiError};
use memos_core::{EnrichedContent, Memo, SummaryLanguage};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

/// Records shorter than this (after stripping links, embeds and code) are
/// never sent to a model.
pub const MIN_AI_CONTENT_CHARS: usize = 10;

static IMAGE_EMBED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").expect("valid regex"));
static LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[[^\]]*\]\([^)]*\)").expect("valid regex"));
static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```.*?```").expect("valid regex"));

pub fn is_suitable_for_ai(content: &str) -> bool {
    let without_images = IMAGE_EMBED.replace_all(content, "");
    let without_links = LINK.replace_all(&without_images, "");
    let without_code = CODE_FENCE.replace_all(&without_links, "");
    without_code.trim().chars().count() >= MIN_AI_CONTENT_CHARS
}

/// Split a leading `# ` heading off `content`.
pub fn split_title(content: &str) -> (Option<String>, String) {
    let trimmed = content.trim();
    let (first, rest) = trimmed.split_once('\n').unwrap_or((trimmed, ""));
    match first.trim().strip_prefix("# ").map(str::trim) {
        Some(title) if !title.is_empty() => (Some(title.to_string()), rest.trim().to_string()),
        _ => (None, trimmed.to_string()),
    }
}

fn labels(language: SummaryLanguage) -> (&'static str, &'static str) {
    if language.is_chinese() {
        ("内容摘要", "相关标签")
    } else {
        ("Summary", "Tags")
    }
}

pub fn summary_callout(summary: &str, language: SummaryLanguage) -> String {
    let quoted = summary.trim().lines().collect::<Vec<_>>().join("\n> ");
    format!("> [!abstract]+ {}\n> {quoted}", labels(language).0)
}

pub fn tag_callout(tags: &[String], language: SummaryLanguage) -> String {
    let line = tags
        .iter()
        .map(|t| format!("#{t}"))
        .collect::<Vec<_>>()
        .join(" ");
    format!("> [!info]- {}\n> {line}", labels(language).1)
}

#[derive(Debug, Clone, Copy)]
pub struct EnrichmentSettings {
    pub ai_enabled: bool,
    pub summary: bool,
    pub tags: bool,
    pub language: SummaryLanguage,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            ai_enabled: false,
            summary: true,
            tags: true,
            language: SummaryLanguage::Zh,
        }
    }
}

pub struct Enricher {
    ai: Arc<dyn AiBackend>,
    settings: EnrichmentSettings,
}

impl Enricher {
    pub fn new(ai: Arc<dyn AiBackend>, settings: EnrichmentSettings) -> Self {
        Self { ai, settings }
    }

    /// Never fails: any AI error leaves the record unenriched.
    pub async fn enrich(&self, memo: &Memo) -> EnrichedContent {
        let (title, main) = split_title(&memo.content);

        let wants_ai = self.settings.ai_enabled && (self.settings.summary || self.settings.tags);
        let (summary_block, tag_block) = if wants_ai && is_suitable_for_ai(&memo.content) {
            match self.ai_blocks(&memo.content).await {
                Ok(blocks) => blocks,
                Err(err) => {
                    warn!(identity = %memo.identity(), backend = self.ai.name(), error = %err, "AI enrichment failed; writing record unenriched");
                    (None, None)
                }
            }
        } else {
            debug!(identity = %memo.identity(), "record not sent to AI");
            (None, None)
        };

        let mut parts = Vec::with_capacity(4);
        if let Some(title) = &title {
            parts.push(format!("# {title}"));
        }
        parts.extend(summary_block.iter().cloned());
        parts.extend(tag_block.iter().cloned());
        if !main.is_empty() {
            parts.push(main);
        }

        EnrichedContent {
            title,
            summary_block,
            tag_block,
            body: parts.join("\n\n").trim().to_string(),
        }
    }

    async fn ai_blocks(&self, content: &str) -> Result<(Option<String>, Option<String>), AiError> {
        let language = self.settings.language;

        let summary = if self.settings.summary {
            let summary = self.ai.generate_summary(content, language).await?;
            (!summary.trim().is_empty()).then(|| summary_callout(&summary, language))
        } else {
            None
        };

        let tags = if self.settings.tags {
            let tags = self.ai.generate_tags(content).await?;
            (!tags.is_empty()).then(|| tag_callout(&tags, language))
        } else {
            None
        };

        Ok((summary, tags))
    }
}
