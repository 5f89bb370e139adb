use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

use super::throttle::{RetryPolicy, Throttle};
use crate::config::Config;
use crate::error::Result;

/// A fetched article page, not yet parsed.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub id: u64,
    pub url: String,
    pub html: String,
    /// BLAKE3 of the raw response bytes.
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum FetchOutcome {
    Page(RawPage),
    NotFound,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP {0}")]
    Status(u16),

    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

impl FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(_) => true,
            FetchError::Status(code) => *code == 408 || *code == 429 || *code >= 500,
            FetchError::Exhausted { .. } => false,
        }
    }
}

pub struct PageFetcher {
    client: Client,
    base_url: String,
    retry: RetryPolicy,
    throttle: Arc<Throttle>,
}

impl PageFetcher {
    pub fn new(config: &Config, throttle: Arc<Throttle>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            retry: RetryPolicy::from_config(config),
            throttle,
        })
    }

    /// Page address for an article id: `base_url` followed by the id.
    pub fn article_url(&self, id: u64) -> String {
        format!("{}{}", self.base_url, id)
    }

    /// Fetch one article page.
    ///
    /// 404, 410 and placeholder pages map to `NotFound`. Transport errors,
    /// 408, 429 and 5xx are retried with backoff; other statuses fail at once.
    pub async fn fetch(&self, id: u64) -> std::result::Result<FetchOutcome, FetchError> {
        let url = self.article_url(id);
        let mut last_error = String::new();

        for attempt in 1..=self.retry.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.retry.backoff(attempt - 1)).await;
            }
            self.throttle.wait().await;

            match self.fetch_once(id, &url).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() => {
                    debug!(kb = id, attempt, error = %e, "Transient fetch failure");
                    last_error = e.to_string();
                }
                Err(e) => return Err(e),
            }
        }

        warn!(kb = id, attempts = self.retry.max_attempts, "Giving up on page");
        Err(FetchError::Exhausted {
            attempts: self.retry.max_attempts,
            last_error,
        })
    }

    async fn fetch_once(
        &self,
        id: u64,
        url: &str,
    ) -> std::result::Result<FetchOutcome, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Ok(FetchOutcome::NotFound);
        }
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let bytes = response.bytes().await?;
        let html = String::from_utf8_lossy(&bytes).into_owned();
        if is_placeholder(&html) {
            debug!(kb = id, "Placeholder page treated as missing");
            return Ok(FetchOutcome::NotFound);
        }

        Ok(FetchOutcome::Page(RawPage {
            id,
            url: url.to_string(),
            content_hash: blake3::hash(&bytes).to_hex().to_string(),
            html,
            fetched_at: Utc::now(),
        }))
    }
}

/// Empty documents and "page not found" shells served with a 200.
fn is_placeholder(html: &str) -> bool {
    if html.trim().is_empty() {
        return true;
    }
    let lower = html.to_ascii_lowercase();
    let Some(start) = lower.find("<title") else {
        return false;
    };
    let Some(open_end) = lower[start..].find('>') else {
        return false;
    };
    let rest = &lower[start + open_end + 1..];
    is_not_found_title(&rest[..rest.find("</title>").unwrap_or(rest.len())])
}

/// Whether a page title announces a missing article rather than naming one.
///
/// A bare "404" counts, but a title that merely mentions the number does not.
pub(crate) fn is_not_found_title(title: &str) -> bool {
    let title = title.trim().to_lowercase();
    title == "404"
        || title.starts_with("404 ")
        || title.contains("page not found")
        || title.contains("article not found")
}
