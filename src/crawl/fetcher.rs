//! HTTP fetcher
//!
//! A single reqwest client with request and connect timeouts, a bounded
//! redirect policy and compressed transfer. Every failure is classified into
//! a `FailureKind` so the pool can decide between retry and terminal failure.

use crate::config::CrawlConfig;
use crate::types::FailureKind;
use std::time::{Duration, Instant};
use thiserror::Error;
use url::Url;

/// Errors that can occur during fetching
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Timeout after {0:?}")]
    Timeout(Duration),
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("HTTP status {status}")]
    Status {
        status: u16,
        retry_after: Option<Duration>,
    },
    #[error("Too many redirects")]
    TooManyRedirects,
    #[error("Invalid content type: {0}")]
    InvalidContentType(String),
    #[error("Content too large: {0} bytes")]
    ContentTooLarge(u64),
    #[error("Malformed content: {0}")]
    Malformed(String),
    #[error("Failed to parse URL: {0}")]
    InvalidUrl(String),
}

impl FetchError {
    /// Failure class used for the retry decision
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::Timeout(_) | FetchError::Connect(_) | FetchError::Http(_) => {
                FailureKind::Transient
            }
            FetchError::Status { status, .. } => match *status {
                408 | 429 => FailureKind::Transient,
                s if s >= 500 => FailureKind::Transient,
                _ => FailureKind::Malformed,
            },
            FetchError::TooManyRedirects
            | FetchError::InvalidContentType(_)
            | FetchError::ContentTooLarge(_)
            | FetchError::Malformed(_)
            | FetchError::InvalidUrl(_) => FailureKind::Malformed,
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Server-provided back-off for 429/503 responses
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::Status { status: 429, .. })
    }
}

/// Result of a successful fetch
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// The fetched URL (may differ from request due to redirects)
    pub final_url: Url,
    pub status_code: u16,
    pub content_type: String,
    pub body: Vec<u8>,
    pub content_length: u64,
    pub fetch_duration: Duration,
}

/// Configuration for the fetcher
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Maximum response size (bytes)
    pub max_content_size: u64,
    pub max_redirects: usize,
    pub connections_per_host: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self::from(&CrawlConfig::default())
    }
}

impl From<&CrawlConfig> for FetchConfig {
    fn from(config: &CrawlConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            timeout: config.request_timeout(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            max_content_size: config.max_content_size as u64,
            max_redirects: config.max_redirects,
            connections_per_host: config.max_inflight_per_host.max(1),
        }
    }
}

/// HTTP fetcher shared by all pool workers
pub struct Fetcher {
    client: reqwest::Client,
    config: FetchConfig,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.connections_per_host)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .user_agent(&config.user_agent)
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|e| FetchError::Http(e.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// GET a URL and return its body when it is a supported, 2xx response
    pub async fn fetch(&self, url: &Url) -> Result<FetchedPage, FetchError> {
        let start = Instant::now();

        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        let final_url = response.url().clone();

        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(FetchError::Status {
                status: status.as_u16(),
                retry_after,
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/html")
            .to_string();

        let lower = content_type.to_lowercase();
        if !lower.contains("text/html")
            && !lower.contains("application/xhtml")
            && !lower.contains("text/plain")
        {
            return Err(FetchError::InvalidContentType(content_type));
        }

        if let Some(len) = response.content_length() {
            if len > self.config.max_content_size {
                return Err(FetchError::ContentTooLarge(len));
            }
        }

        let body = response.bytes().await.map_err(|e| self.classify(e))?;
        let content_length = body.len() as u64;
        if content_length > self.config.max_content_size {
            return Err(FetchError::ContentTooLarge(content_length));
        }

        Ok(FetchedPage {
            final_url,
            status_code: status.as_u16(),
            content_type,
            body: body.to_vec(),
            content_length,
            fetch_duration: start.elapsed(),
        })
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.config.timeout)
        } else if err.is_redirect() {
            FetchError::TooManyRedirects
        } else if err.is_connect() {
            FetchError::Connect(err.to_string())
        } else if err.is_builder() {
            FetchError::InvalidUrl(err.to_string())
        } else {
            FetchError::Http(err.to_string())
        }
    }
}
