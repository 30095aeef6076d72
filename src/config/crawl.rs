//! Crawl configuration: frontier, politeness, fetching and retries

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::DEFAULT_USER_AGENT;

/// Crawl configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    /// Number of fetcher workers in the pool
    pub workers: usize,
    /// Maximum crawl depth from seed URLs (seeds are depth 0)
    pub max_depth: u32,
    /// Total fetch attempts per URL before it is marked failed
    pub max_retries: u32,
    /// Base back-off between transient retries (milliseconds, doubled per attempt)
    pub retry_backoff_ms: u64,
    /// Politeness delay between requests to the same host (milliseconds)
    pub politeness_delay_ms: u64,
    /// Lower clamp for robots.txt crawl-delay (milliseconds)
    pub min_delay_ms: u64,
    /// Upper clamp for robots.txt crawl-delay (milliseconds)
    pub max_delay_ms: u64,
    /// robots.txt cache TTL (seconds)
    pub robots_cache_ttl_secs: u64,
    /// Number of hosts whose robots rules are cached
    pub robots_cache_size: usize,
    /// Soft bound on concurrent fetches against one host
    pub max_inflight_per_host: usize,
    /// Frontier lease timeout before an in-flight entry is redelivered (seconds)
    pub lease_timeout_secs: u64,
    /// Request timeout (seconds)
    pub request_timeout_secs: u64,
    /// Connect timeout (seconds)
    pub connect_timeout_secs: u64,
    /// Maximum redirects to follow
    pub max_redirects: usize,
    /// Maximum response body size (bytes)
    pub max_content_size: usize,
    /// Maximum outgoing links kept per page
    pub max_links_per_page: usize,
    /// User agent string
    pub user_agent: String,
    /// Only follow links on the host of the job's seed URL
    pub stay_on_domain: bool,
    /// Seeds used when a crawl is started without any
    #[serde(default = "default_seed_urls")]
    pub default_seeds: Vec<String>,
    /// Discovered URLs are followed only if they match one of these regexes (empty = all)
    #[serde(default)]
    pub include_patterns: Vec<String>,
    /// Discovered URLs matching any of these regexes are never followed
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// Expected number of URLs for Bloom filter sizing
    pub bloom_expected_items: usize,
    /// Target Bloom filter false positive rate
    pub bloom_false_positive_rate: f64,
}

impl CrawlConfig {
    pub fn politeness_delay(&self) -> Duration {
        Duration::from_millis(self.politeness_delay_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn robots_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.robots_cache_ttl_secs)
    }
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            max_depth: 3,
            max_retries: 3,
            retry_backoff_ms: 2000,
            politeness_delay_ms: 1000,
            min_delay_ms: 500,
            max_delay_ms: 30_000,
            robots_cache_ttl_secs: 3600, // 1 hour
            robots_cache_size: 10_000,
            max_inflight_per_host: 2,
            lease_timeout_secs: 60,
            request_timeout_secs: 10,
            connect_timeout_secs: 5,
            max_redirects: 5,
            max_content_size: 5 * 1024 * 1024, // 5 MB
            max_links_per_page: 100,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            stay_on_domain: false,
            default_seeds: default_seed_urls(),
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            bloom_expected_items: 10_000_000,
            bloom_false_positive_rate: 0.01,
        }
    }
}

/// Well-known starting points for a cold crawl
pub const DEFAULT_SEED_URLS: &[&str] = &[
    "https://news.ycombinator.com",
    "https://www.bbc.com/news",
    "https://www.reuters.com",
    "https://techcrunch.com",
    "https://www.theverge.com",
    "https://arstechnica.com",
    "https://github.com",
    "https://stackoverflow.com",
    "https://dev.to",
    "https://medium.com",
    "https://docs.python.org",
    "https://react.dev",
    "https://vuejs.org",
    "https://nodejs.org",
    "https://doc.rust-lang.org",
    "https://en.wikipedia.org",
    "https://www.britannica.com",
];

fn default_seed_urls() -> Vec<String> {
    DEFAULT_SEED_URLS.iter().map(|s| s.to_string()).collect()
}

/// Hand-off queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Deliveries without an ack before a message is dead-lettered
    pub max_deliveries: u32,
    /// How long a consumed message stays invisible before redelivery (seconds)
    pub visibility_timeout_secs: u64,
    /// Consumer poll fallback when no publish notification arrives (milliseconds)
    pub poll_interval_ms: u64,
    /// How long a finished crawl waits for the indexers to empty the queue (seconds)
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_drain_timeout_secs() -> u64 {
    120
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_deliveries: 3,
            visibility_timeout_secs: 30,
            poll_interval_ms: 500,
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}
