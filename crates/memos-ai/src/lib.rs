//! AI backend adapter: one capability trait over several model providers.
//!
//! Provider variants only know how to turn a prompt into text. Prompt
//! wording, response parsing, and the retry policy live once in
//! [`PromptedBackend`] so every provider behaves the same way.

mod retry;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use memos_core::SummaryLanguage;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

pub use retry::{retry_with_backoff, retry_with_backoff_using, RetryPolicy};

pub const CRATE_NAME: &str = "memos-ai";

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";

const MAX_TAGS: usize = 5;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("{provider} rate limited the request (http {status}): {body}")]
    RateLimited {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("{provider} returned http {status}: {body}")]
    Http {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("{provider} request failed: {source}")]
    Transport {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{provider} returned an unexpected response: {reason}")]
    MalformedResponse {
        provider: &'static str,
        reason: String,
    },
    #[error("invalid AI backend configuration: {0}")]
    Config(String),
}

impl AiError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Text generation capability consumed by enrichment and digests.
#[async_trait]
pub trait AiBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate_summary(
        &self,
        text: &str,
        language: SummaryLanguage,
    ) -> Result<String, AiError>;

    async fn generate_tags(&self, text: &str) -> Result<Vec<String>, AiError>;

    async fn generate_weekly_digest(
        &self,
        texts: &[String],
        language: SummaryLanguage,
    ) -> Result<String, AiError>;
}

/// A model endpoint that completes a single prompt.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, AiError>;
}

/// Null variant: every call returns an empty result immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledBackend;

#[async_trait]
impl AiBackend for DisabledBackend {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn generate_summary(&self, _: &str, _: SummaryLanguage) -> Result<String, AiError> {
        debug!("ai disabled, skipping summary");
        Ok(String::new())
    }

    async fn generate_tags(&self, _: &str) -> Result<Vec<String>, AiError> {
        debug!("ai disabled, skipping tags");
        Ok(Vec::new())
    }

    async fn generate_weekly_digest(
        &self,
        _: &[String],
        _: SummaryLanguage,
    ) -> Result<String, AiError> {
        debug!("ai disabled, skipping weekly digest");
        Ok(String::new())
    }
}

pub struct PromptedBackend<P> {
    provider: P,
    retry: RetryPolicy,
}

impl<P: CompletionProvider> PromptedBackend<P> {
    pub fn new(provider: P, retry: RetryPolicy) -> Self {
        Self { provider, retry }
    }

    async fn complete_with_retry(&self, prompt: &str, max_tokens: u32) -> Result<String, AiError> {
        retry_with_backoff(&self.retry, AiError::is_rate_limited, || {
            self.provider.complete(prompt, max_tokens)
        })
        .await
    }
}

#[async_trait]
impl<P: CompletionProvider> AiBackend for PromptedBackend<P> {
    fn name(&self) -> &'static str {
        self.provider.name()
    }

    async fn generate_summary(
        &self,
        text: &str,
        language: SummaryLanguage,
    ) -> Result<String, AiError> {
        let prompt = summary_prompt(text, language);
        Ok(self.complete_with_retry(&prompt, 500).await?.trim().to_string())
    }

    async fn generate_tags(&self, text: &str) -> Result<Vec<String>, AiError> {
        let prompt = tags_prompt(text);
        let raw = self.complete_with_retry(&prompt, 100).await?;
        Ok(parse_tags(&raw))
    }

    async fn generate_weekly_digest(
        &self,
        texts: &[String],
        language: SummaryLanguage,
    ) -> Result<String, AiError> {
        let prompt = weekly_digest_prompt(texts, language);
        Ok(self.complete_with_retry(&prompt, 1000).await?.trim().to_string())
    }
}

pub fn summary_prompt(text: &str, language: SummaryLanguage) -> String {
    format!(
        "Summarize the key points of the following content in {}. Reply with the summary only.\n\n{text}",
        language.prompt_name()
    )
}

pub fn tags_prompt(text: &str) -> String {
    format!(
        "Generate 3-5 relevant tags for the following content. Reply with the tags only, \
         separated by commas, without the # sign.\n\n{text}"
    )
}

pub fn weekly_digest_prompt(texts: &[String], language: SummaryLanguage) -> String {
    format!(
        "Summarize and analyse the following notes from one week and write a weekly report in {}. Focus on:\n\
         1. Main work and achievements\n\
         2. Important events and progress\n\
         3. Problems and their solutions\n\
         4. Plans and outlook for next week\n\n\
         Notes:\n{}",
        language.prompt_name(),
        texts.join("\n---\n")
    )
}

/// Split a model reply into at most five bare tag tokens.
pub fn parse_tags(raw: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for token in raw.split(|c: char| c == ',' || c == '，' || c == '、' || c.is_whitespace()) {
        let tag = token.trim().trim_start_matches('#').trim();
        if tag.is_empty() || tags.iter().any(|t| t == tag) {
            continue;
        }
        tags.push(tag.to_string());
        if tags.len() == MAX_TAGS {
            break;
        }
    }
    tags
}

fn classify_failure(provider: &'static str, status: reqwest::StatusCode, body: String) -> AiError {
    let lower = body.to_ascii_lowercase();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || lower.contains("resource_exhausted")
        || lower.contains("quota")
        || lower.contains("rate limit")
    {
        AiError::RateLimited {
            provider,
            status: status.as_u16(),
            body,
        }
    } else {
        AiError::Http {
            provider,
            status: status.as_u16(),
            body,
        }
    }
}

async fn send_json(
    provider: &'static str,
    request: reqwest::RequestBuilder,
) -> Result<JsonValue, AiError> {
    let response = request
        .send()
        .await
        .map_err(|source| AiError::Transport { provider, source })?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_failure(provider, status, body));
    }
    response
        .json::<JsonValue>()
        .await
        .map_err(|e| AiError::MalformedResponse {
            provider,
            reason: e.to_string(),
        })
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, AiError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AiError::Config(format!("building http client: {e}")))
}

/// OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiChatProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiChatProvider {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, AiError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAiChatProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, AiError> {
        let payload = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": 0.7,
            "max_tokens": max_tokens,
        });
        let body = send_json(
            self.name(),
            self.client
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&payload),
        )
        .await?;

        Ok(body
            .pointer("/choices/0/message/content")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string())
    }
}

/// Google generative-language `generateContent` endpoint.
#[derive(Debug, Clone)]
pub struct GeminiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiProvider {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, AiError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl CompletionProvider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, AiError> {
        let payload = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": { "temperature": 0.7, "maxOutputTokens": max_tokens },
        });
        let body = send_json(
            self.name(),
            self.client
                .post(format!(
                    "{}/models/{}:generateContent",
                    self.base_url, self.model
                ))
                .query(&[("key", self.api_key.as_str())])
                .json(&payload),
        )
        .await?;

        let parts = body
            .pointer("/candidates/0/content/parts")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| AiError::MalformedResponse {
                provider: self.name(),
                reason: "missing candidates[0].content.parts".to_string(),
            })?;
        Ok(parts
            .iter()
            .filter_map(|part| part.get("text").and_then(JsonValue::as_str))
            .collect::<Vec<_>>()
            .join(""))
    }
}

/// Local Ollama server, non-streaming `/api/generate`.
#[derive(Debug, Clone)]
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaProvider {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self, AiError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl CompletionProvider for OllamaProvider {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, AiError> {
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": { "temperature": 0.7, "top_p": 0.9, "num_predict": max_tokens },
        });
        let body = send_json(
            self.name(),
            self.client
                .post(format!("{}/api/generate", self.base_url))
                .json(&payload),
        )
        .await?;

        body.get("response")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| AiError::MalformedResponse {
                provider: self.name(),
                reason: format!("response missing text: {body}"),
            })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    OpenAi,
    Gemini,
    Ollama,
    Disabled,
}

impl BackendKind {
    pub fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o",
            Self::Gemini => "gemini-1.5-flash",
            Self::Ollama => "llama2",
            Self::Disabled => "",
        }
    }

    pub fn needs_api_key(self) -> bool {
        matches!(self, Self::OpenAi | Self::Gemini)
    }
}

impl FromStr for BackendKind {
    type Err = AiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            "disabled" | "none" | "" => Ok(Self::Disabled),
            other => Err(AiError::Config(format!("unknown AI backend '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub api_key: String,
    /// Empty selects the backend's default model.
    pub model: String,
    pub openai_base_url: String,
    pub gemini_base_url: String,
    pub ollama_base_url: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            api_key: String::new(),
            model: String::new(),
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            gemini_base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            ollama_base_url: DEFAULT_OLLAMA_BASE_URL.to_string(),
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// Build the configured backend. A cloud backend without an API key degrades
/// to [`DisabledBackend`].
pub fn backend_from_settings(settings: &BackendSettings) -> Result<Arc<dyn AiBackend>, AiError> {
    if settings.kind.needs_api_key() && settings.api_key.trim().is_empty() {
        warn!(backend = ?settings.kind, "AI backend requires an API key; AI features disabled");
        return Ok(Arc::new(DisabledBackend));
    }

    let model = match settings.model.trim() {
        "" => settings.kind.default_model(),
        model => model,
    };
    debug!(backend = ?settings.kind, model, "initialising AI backend");

    let backend: Arc<dyn AiBackend> = match settings.kind {
        BackendKind::OpenAi => Arc::new(PromptedBackend::new(
            OpenAiChatProvider::new(
                &settings.openai_base_url,
                &settings.api_key,
                model,
                settings.timeout,
            )?,
            settings.retry,
        )),
        BackendKind::Gemini => Arc::new(PromptedBackend::new(
            GeminiProvider::new(
                &settings.gemini_base_url,
                &settings.api_key,
                model,
                settings.timeout,
            )?,
            settings.retry,
        )),
        BackendKind::Ollama => Arc::new(PromptedBackend::new(
            OllamaProvider::new(&settings.ollama_base_url, model, settings.timeout)?,
            settings.retry,
        )),
        BackendKind::Disabled => Arc::new(DisabledBackend),
    };
    Ok(backend)
}
