//! Core types for crawlrank

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Page identity
// ============================================================================

/// Stable page identity: SHA256 of the canonical URL (64-character hex string)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub String);

impl PageId {
    /// Derive the identity of a canonical URL
    pub fn from_url(canonical_url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonical_url.as_bytes());
        PageId(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<PageId> for String {
    fn from(id: PageId) -> Self {
        id.0
    }
}

// ============================================================================
// Page records
// ============================================================================

/// Lifecycle status of a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageStatus {
    Pending,
    Crawled,
    Indexed,
    Failed,
}

impl PageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Crawled => "crawled",
            Self::Indexed => "indexed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relational metadata for a crawled page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    pub id: PageId,
    pub url: String,
    pub title: String,
    pub description: String,
    pub crawled_at: Option<DateTime<Utc>>,
    pub indexed_at: Option<DateTime<Utc>>,
    /// Worker that fetched the page
    pub worker_id: String,
    pub status: PageStatus,
    pub http_status: Option<u16>,
    pub content_length: u64,
    pub word_count: u64,
    /// Set when status is `Failed`
    pub failure_reason: Option<String>,
    /// When the latest recorded failure happened
    pub failed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub job_id: Option<Uuid>,
}

impl PageRecord {
    /// A fresh pending record for a canonical URL
    pub fn pending(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            id: PageId::from_url(&url),
            url,
            title: String::new(),
            description: String::new(),
            crawled_at: None,
            indexed_at: None,
            worker_id: String::new(),
            status: PageStatus::Pending,
            http_status: None,
            content_length: 0,
            word_count: 0,
            failure_reason: None,
            failed_at: None,
            attempts: 0,
            job_id: None,
        }
    }
}

/// Directed hyperlink between two canonical URLs, unique per (source, target)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkEdge {
    pub source: String,
    pub target: String,
    pub anchor: String,
}

// ============================================================================
// Frontier
// ============================================================================

/// Frontier entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrontierStatus {
    Pending,
    InFlight,
    Done,
}

/// A crawl candidate owned by the frontier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontierEntry {
    pub url: String,
    /// Higher is crawled sooner
    pub priority: f32,
    /// Hops from the seed
    pub depth: u32,
    pub status: FrontierStatus,
    /// Fetch attempts made so far
    pub attempts: u32,
    pub job_id: Option<Uuid>,
    /// Insertion sequence, FIFO tie-break within equal priority
    pub seq: u64,
}

impl FrontierEntry {
    pub fn new(url: impl Into<String>, priority: f32, depth: u32) -> Self {
        Self {
            url: url.into(),
            priority,
            depth,
            status: FrontierStatus::Pending,
            attempts: 0,
            job_id: None,
            seq: 0,
        }
    }

    pub fn with_job(mut self, job_id: Option<Uuid>) -> Self {
        self.job_id = job_id;
        self
    }
}

// ============================================================================
// Ranking, jobs and query log
// ============================================================================

/// PageRank score for one page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankScore {
    pub page_id: PageId,
    pub score: f64,
    pub computed_at: DateTime<Utc>,
}

/// Crawl session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

/// One crawl session and its counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlJob {
    pub id: Uuid,
    pub seed_url: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub pages_crawled: u64,
    pub pages_indexed: u64,
    pub error_count: u64,
}

impl CrawlJob {
    pub fn start(seed_url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            seed_url: seed_url.into(),
            status: JobStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            pages_crawled: 0,
            pages_indexed: 0,
            error_count: 0,
        }
    }
}

/// Which job counter to bump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCounter {
    Crawled,
    Indexed,
    Error,
}

/// Write-only record of a served query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryLogEntry {
    pub query: String,
    pub result_count: usize,
    pub latency_ms: u64,
    pub cache_hit: bool,
    pub logged_at: DateTime<Utc>,
}

// ============================================================================
// Hand-off events
// ============================================================================

/// Error taxonomy shared by the fetcher, queue and ranking paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeout, connection reset, 5xx, 429: retried with back-off
    Transient,
    /// robots.txt disallow or politeness delay: re-queued, never a failure
    Policy,
    /// Unsupported or unparseable content: failed without retry
    Malformed,
    /// Hand-off queue unavailable
    Delivery,
    /// Ranking did not converge within the iteration cap
    Convergence,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Delivery)
    }
}

/// Outgoing link extracted from a page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutLink {
    pub url: String,
    pub anchor: String,
}

/// A successfully fetched and extracted page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPage {
    /// Canonical URL
    pub url: String,
    pub http_status: u16,
    pub content_type: String,
    pub content_length: u64,
    pub title: String,
    pub description: String,
    /// Visible text with markup removed
    pub text: String,
    pub links: Vec<OutLink>,
    pub fetched_at: DateTime<Utc>,
    pub depth: u32,
    pub attempts: u32,
    pub job_id: Option<Uuid>,
    pub worker_id: String,
}

/// A fetch that exhausted its retries or failed permanently
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub url: String,
    pub reason: String,
    pub kind: FailureKind,
    pub http_status: Option<u16>,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
    pub job_id: Option<Uuid>,
    pub worker_id: String,
}

/// Message carried by the hand-off queue from fetchers to indexers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PageEvent {
    Fetched(RawPage),
    Failed(FetchFailure),
}

impl PageEvent {
    pub fn url(&self) -> &str {
        match self {
            Self::Fetched(page) => &page.url,
            Self::Failed(failure) => &failure.url,
        }
    }

    pub fn page_id(&self) -> PageId {
        PageId::from_url(self.url())
    }

    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            Self::Fetched(page) => page.job_id,
            Self::Failed(failure) => failure.job_id,
        }
    }
}
