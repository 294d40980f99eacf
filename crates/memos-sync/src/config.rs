use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use memos_ai::{
    BackendKind, BackendSettings, RetryPolicy, DEFAULT_GEMINI_BASE_URL, DEFAULT_OLLAMA_BASE_URL,
    DEFAULT_OPENAI_BASE_URL,
};
use memos_client::{ClientConfig, API_PATH_SEGMENT};
use memos_core::SummaryLanguage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "memos-sync.yaml";

/// Model name that defers to `custom_model_name`.
const CUSTOM_MODEL: &str = "custom";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("memos API url is not configured")]
    MissingApiUrl,
    #[error("memos access token is not configured")]
    MissingAccessToken,
    #[error("memos API url {0} is malformed: it must contain /api/v1")]
    MalformedApiUrl(String),
    #[error("sync limit must be a positive number")]
    InvalidSyncLimit,
    #[error("auto sync interval must be at least one minute")]
    InvalidSyncInterval,
    #[error("unknown AI backend {0:?}")]
    UnknownBackend(String),
    #[error("unknown timezone {0}")]
    InvalidTimezone(String),
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncFrequency {
    #[default]
    Manual,
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub api_url: String,
    pub access_token: String,
    /// Local directory backing the vault storage.
    pub vault_root: PathBuf,
    /// Mirror root inside the vault.
    pub sync_directory: String,
    pub sync_limit: usize,
    pub sync_frequency: SyncFrequency,
    pub auto_sync_interval_minutes: u64,
    /// Cron expression used instead of the interval when set.
    pub sync_cron: Option<String>,
    pub timezone: String,
    pub log_level: String,
    pub http_timeout_secs: u64,
    pub ai: AiConfig,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            access_token: String::new(),
            vault_root: PathBuf::from("."),
            sync_directory: "memos".to_string(),
            sync_limit: 1000,
            sync_frequency: SyncFrequency::Manual,
            auto_sync_interval_minutes: 30,
            sync_cron: None,
            timezone: "UTC".to_string(),
            log_level: "info".to_string(),
            http_timeout_secs: 30,
            ai: AiConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub enabled: bool,
    pub backend: BackendKind,
    pub api_key: String,
    pub model_name: String,
    pub custom_model_name: String,
    pub openai_base_url: String,
    pub gemini_base_url: String,
    pub ollama_base_url: String,
    pub weekly_digest: bool,
    pub auto_tags: bool,
    pub intelligent_summary: bool,
    pub summary_language: SummaryLanguage,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: BackendKind::OpenAi,
            api_key: String::new(),
            model_name: String::new(),
            custom_model_name: String::new(),
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            gemini_base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            ollama_base_url: DEFAULT_OLLAMA_BASE_URL.to_string(),
            weekly_digest: true,
            auto_tags: true,
            intelligent_summary: true,
            summary_language: SummaryLanguage::Zh,
        }
    }
}

impl AiConfig {
    /// The model sent to the backend. Unset names use the selected
    /// backend's default.
    pub fn resolved_model(&self) -> &str {
        let named = if self.model_name.trim() == CUSTOM_MODEL {
            self.custom_model_name.trim()
        } else {
            self.model_name.trim()
        };
        if named.is_empty() {
            self.backend.default_model()
        } else {
            named
        }
    }

    pub fn digest_enabled(&self) -> bool {
        self.enabled && self.weekly_digest
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

impl MirrorConfig {
    /// Read `path`, or [`DEFAULT_CONFIG_FILE`] when present, then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_yaml_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MEMOS_API_URL") {
            self.api_url = v;
        }
        if let Some(v) = lookup("MEMOS_ACCESS_TOKEN") {
            self.access_token = v;
        }
        if let Some(v) = lookup("MEMOS_VAULT_ROOT") {
            self.vault_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("MEMOS_SYNC_DIR") {
            self.sync_directory = v;
        }
        if let Some(v) = lookup("MEMOS_SYNC_LIMIT") {
            self.sync_limit = v.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                key: "MEMOS_SYNC_LIMIT",
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup("MEMOS_TIMEZONE") {
            self.timezone = v;
        }
        if let Some(v) = lookup("MEMOS_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = lookup("MEMOS_AI_ENABLED") {
            self.ai.enabled = parse_bool(&v);
        }
        if let Some(v) = lookup("MEMOS_AI_BACKEND") {
            self.ai.backend = v
                .parse()
                .map_err(|_| ConfigError::UnknownBackend(v.clone()))?;
        }
        if let Some(v) = lookup("MEMOS_AI_API_KEY") {
            self.ai.api_key = v;
        }
        if let Some(v) = lookup("MEMOS_AI_MODEL") {
            self.ai.model_name = v;
        }
        if let Some(v) = lookup("OPENAI_BASE_URL") {
            self.ai.openai_base_url = v;
        }
        if let Some(v) = lookup("OLLAMA_BASE_URL") {
            self.ai.ollama_base_url = v;
        }
        Ok(())
    }

    /// Configuration errors are fatal and checked before any network call.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_url.trim().is_empty() {
            return Err(ConfigError::MissingApiUrl);
        }
        if self.access_token.trim().is_empty() {
            return Err(ConfigError::MissingAccessToken);
        }
        if !self.api_url.contains(API_PATH_SEGMENT) {
            return Err(ConfigError::MalformedApiUrl(self.api_url.clone()));
        }
        if self.sync_limit == 0 {
            return Err(ConfigError::InvalidSyncLimit);
        }
        if self.sync_frequency == SyncFrequency::Auto
            && self.sync_cron.is_none()
            && self.auto_sync_interval_minutes == 0
        {
            return Err(ConfigError::InvalidSyncInterval);
        }
        self.tz()?;
        Ok(())
    }

    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .trim()
            .parse::<Tz>()
            .map_err(|_| ConfigError::InvalidTimezone(self.timezone.clone()))
    }

    pub fn sync_root(&self) -> PathBuf {
        PathBuf::from(self.sync_directory.trim().trim_matches('/'))
    }

    pub fn auto_sync_interval(&self) -> Duration {
        Duration::from_secs(self.auto_sync_interval_minutes.max(1) * 60)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            ..ClientConfig::new(self.api_url.clone(), self.access_token.clone())
        }
    }

    pub fn backend_settings(&self) -> BackendSettings {
        let kind = if self.ai.enabled {
            self.ai.backend
        } else {
            BackendKind::Disabled
        };
        BackendSettings {
            kind,
            api_key: self.ai.api_key.clone(),
            model: self.ai.resolved_model().to_string(),
            openai_base_url: self.ai.openai_base_url.clone(),
            gemini_base_url: self.ai.gemini_base_url.clone(),
            ollama_base_url: self.ai.ollama_base_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs.max(60)),
            retry: RetryPolicy::default(),
        }
    }
}
