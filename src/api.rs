use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::{config::ApiConfig, types::PostId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("rate limited")]
    RateLimited,
    #[error("API error {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("response was not JSON: {0}")]
    Decode(String),
}

/// The external directory. Every operation returns the raw JSON tree; callers
/// extract what they need structurally.
#[async_trait]
pub trait DirectoryApi: Send + Sync {
    async fn user_by_handle(&self, handle: &str) -> Result<Value, ApiError>;

    async fn replies_by_user(
        &self,
        stable_id: &str,
        count: usize,
        cursor: Option<&str>,
    ) -> Result<Value, ApiError>;

    async fn comments_by_post(&self, post_id: &PostId, count: usize) -> Result<Value, ApiError>;

    async fn post_by_id(&self, post_id: &PostId) -> Result<Value, ApiError>;
}

// ── HTTP client builder ───────────────────────────────────────────────────────

pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10));

    if let Ok(proxy_url) = std::env::var("HTTP_PROXY") {
        builder = builder.proxy(reqwest::Proxy::all(&proxy_url)?);
    }

    builder.build().map_err(Into::into)
}

// ── RapidAPI-hosted directory ─────────────────────────────────────────────────

#[derive(Clone)]
pub struct RapidApiClient {
    http: reqwest::Client,
    key: String,
    host: String,
}

impl RapidApiClient {
    pub fn new(http: reqwest::Client, cfg: &ApiConfig) -> Self {
        Self {
            http,
            key: cfg.key.clone(),
            host: cfg.host.clone(),
        }
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, ApiError> {
        let resp = self
            .http
            .get(format!("https://{}/{path}", self.host))
            .header("x-rapidapi-key", &self.key)
            .header("x-rapidapi-host", &self.host)
            .query(query)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ApiError::RateLimited);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: truncate(&body, 200),
            });
        }

        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl DirectoryApi for RapidApiClient {
    async fn user_by_handle(&self, handle: &str) -> Result<Value, ApiError> {
        self.get("user", &[("username", handle.to_string())]).await
    }

    async fn replies_by_user(
        &self,
        stable_id: &str,
        count: usize,
        cursor: Option<&str>,
    ) -> Result<Value, ApiError> {
        let mut query = vec![
            ("user", stable_id.to_string()),
            ("count", count.to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        self.get("user-replies-v2", &query).await
    }

    async fn comments_by_post(&self, post_id: &PostId, count: usize) -> Result<Value, ApiError> {
        self.get(
            "comments-v2",
            &[
                ("pid", post_id.to_string()),
                ("count", count.to_string()),
                ("rankingMode", "Recency".to_string()),
            ],
        )
        .await
    }

    async fn post_by_id(&self, post_id: &PostId) -> Result<Value, ApiError> {
        self.get("tweet", &[("pid", post_id.to_string())]).await
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push_str("…(truncated)");
    out
}
