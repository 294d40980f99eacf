//! Retrieval client for the memos HTTP API.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use memos_core::{Memo, MemoPage, Resource};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{header, StatusCode};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "memos-client";

/// Path segment every configured API base must contain.
pub const API_PATH_SEGMENT: &str = "/api/v1";

pub const MAX_PAGE_SIZE: usize = 100;

// Same unreserved set as JavaScript's encodeURIComponent.
const FILENAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid API url {url}: it must contain /api/v1")]
    InvalidBaseUrl { url: String },
    #[error("http status {status} for {url}\nresponse body: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("unexpected response format from {url}: {reason}")]
    Format { url: String, reason: String },
    #[error("network error: cannot reach {url}: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// What the sync pipeline needs from the remote service.
#[async_trait]
pub trait MemoSource: Send + Sync {
    /// Fetch up to `limit` memos, newest first.
    async fn fetch_all(&self, limit: usize) -> Result<Vec<Memo>, ClientError>;

    async fn download_resource(&self, resource: &Resource) -> Result<Vec<u8>, ClientError>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub access_token: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl ClientConfig {
    pub fn new(api_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            access_token: access_token.into(),
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("memos-mirror/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemosClient {
    client: reqwest::Client,
    api_url: String,
    origin: String,
    access_token: String,
}

impl MemosClient {
    /// Validates the base address before any request is made.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let api_url = config.api_url.trim().trim_end_matches('/').to_string();
        if !api_url.contains(API_PATH_SEGMENT) {
            return Err(ClientError::InvalidBaseUrl { url: config.api_url });
        }
        let origin = api_url.replacen(API_PATH_SEGMENT, "", 1);

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build()?;

        Ok(Self {
            client,
            api_url,
            origin,
            access_token: config.access_token,
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn resource_url(&self, resource: &Resource) -> String {
        format!(
            "{}/file/resources/{}/{}",
            self.origin,
            resource.resource_id(),
            utf8_percent_encode(&resource.filename, FILENAME_ENCODE_SET)
        )
    }

    async fn fetch_page(
        &self,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<MemoPage, ClientError> {
        let url = format!("{}/memos", self.api_url);
        let mut query = vec![
            ("rowStatus", "NORMAL".to_string()),
            ("limit", page_size.to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        debug!(%url, page_size, ?page_token, "requesting memo page");

        let response = self
            .client
            .get(&url)
            .query(&query)
            .bearer_auth(&self.access_token)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| map_send_error(&self.api_url, err))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::HttpStatus {
                status: status.as_u16(),
                url,
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| map_send_error(&self.api_url, err))?;
        parse_page(&url, &bytes)
    }
}

fn map_send_error(url: &str, err: reqwest::Error) -> ClientError {
    if err.is_connect() || err.is_timeout() {
        ClientError::Unreachable {
            url: url.to_string(),
            source: err,
        }
    } else {
        ClientError::Request(err)
    }
}

fn parse_page(url: &str, bytes: &[u8]) -> Result<MemoPage, ClientError> {
    let format_error = |reason: String| ClientError::Format {
        url: url.to_string(),
        reason,
    };
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| format_error(format!("invalid json: {e}")))?;
    if !value.get("memos").is_some_and(serde_json::Value::is_array) {
        return Err(format_error("response does not contain a memos array".to_string()));
    }
    serde_json::from_value(value).map_err(|e| format_error(e.to_string()))
}

#[async_trait]
impl MemoSource for MemosClient {
    async fn fetch_all(&self, limit: usize) -> Result<Vec<Memo>, ClientError> {
        let span = info_span!("fetch_all", api_url = %self.api_url, limit);
        async move {
            let page_size = limit.min(MAX_PAGE_SIZE);
            let mut collected: Vec<Memo> = Vec::new();
            let mut seen = HashSet::new();
            let mut page_token: Option<String> = None;

            while collected.len() < limit {
                let page = self.fetch_page(page_size, page_token.as_deref()).await?;
                if page.memos.is_empty() {
                    break;
                }
                let next_token = page.continuation().map(str::to_string);

                for memo in page.memos {
                    if collected.len() >= limit {
                        break;
                    }
                    if seen.insert(memo.name.clone()) {
                        collected.push(memo);
                    }
                }
                debug!(total = collected.len(), limit, "accumulated memos");

                match next_token {
                    Some(token) if page_token.as_deref() != Some(token.as_str()) => {
                        page_token = Some(token);
                    }
                    _ => break,
                }
            }

            collected.sort_by(|a, b| b.create_time.cmp(&a.create_time));
            debug!(count = collected.len(), "fetched memos");
            Ok(collected)
        }
        .instrument(span)
        .await
    }

    async fn download_resource(&self, resource: &Resource) -> Result<Vec<u8>, ClientError> {
        let url = self.resource_url(resource);
        debug!(%url, "downloading resource");
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|err| map_send_error(&url, err))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::HttpStatus {
                status: status.as_u16(),
                url,
                body,
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}
