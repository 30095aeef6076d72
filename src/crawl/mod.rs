//! Crawl subsystem
//!
//! - `DedupFilter`: Bloom filter over canonical URLs, persisted through the cache
//! - `PolitenessTracker`: robots.txt rules, per-host delay and concurrency bound
//! - `Frontier`: sled-backed priority queue with leases and delayed requeue
//! - `Fetcher`: HTTP GET with timeouts, redirect limit and failure classification
//! - `FetcherPool`: worker pool tying the above to the hand-off queue
//! - `UrlPatterns`: include/exclude regexes scoping which links are followed

pub mod dedup;
pub mod fetcher;
pub mod frontier;
pub mod politeness;
pub mod pool;

pub use dedup::{BloomFilter, DedupFilter};
pub use fetcher::{FetchConfig, FetchError, FetchedPage, Fetcher};
pub use frontier::Frontier;
pub use politeness::{CachedRobots, PolitenessConfig, PolitenessTracker};
pub use pool::{CrawlOutcome, FetcherPool, FetcherPoolStats, PageCrawler};

use regex::Regex;
use tracing::warn;
use url::Url;

/// Tracking/session query parameters stripped during canonicalization
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "fbclid",
    "gclid",
    "sessionid",
];

/// File extensions that are never worth fetching as pages
const SKIPPED_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".svg", ".webp", ".ico", ".pdf", ".doc", ".docx", ".xls",
    ".xlsx", ".ppt", ".pptx", ".zip", ".rar", ".tar", ".gz", ".7z", ".mp3", ".mp4", ".avi", ".mov",
    ".wmv", ".css", ".js", ".json", ".xml", ".exe", ".dmg", ".apk",
];

/// Canonicalize a URL so that equal pages share one identity.
///
/// - Only http and https are accepted
/// - Scheme and host are lowercased and default ports dropped (by `Url`)
/// - Fragments are removed
/// - Trailing slashes are removed from non-root paths
/// - Tracking parameters are stripped and the rest sorted
pub fn canonicalize_url(url: &Url) -> Option<Url> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    url.host_str()?;

    let mut canonical = url.clone();
    canonical.set_fragment(None);

    let path = canonical.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        canonical.set_path(path.trim_end_matches('/'));
        if canonical.path().is_empty() {
            canonical.set_path("/");
        }
    }

    if let Some(query) = canonical.query().map(str::to_string) {
        let mut params: Vec<&str> = query
            .split('&')
            .filter(|p| !p.is_empty())
            .filter(|p| {
                let key = p.split('=').next().unwrap_or("").to_lowercase();
                !TRACKING_PARAMS.contains(&key.as_str())
            })
            .collect();

        if params.is_empty() {
            canonical.set_query(None);
        } else {
            params.sort_unstable();
            let joined = params.join("&");
            canonical.set_query(Some(&joined));
        }
    }

    Some(canonical)
}

/// Parse and canonicalize a URL string
pub fn canonicalize_str(raw: &str) -> Option<Url> {
    Url::parse(raw.trim()).ok().and_then(|u| canonicalize_url(&u))
}

/// Host key used for politeness bookkeeping (host plus explicit port)
pub fn host_key(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    }
}

/// True if the path ends in an extension we never crawl
pub fn has_skipped_extension(url: &Url) -> bool {
    let path = url.path().to_lowercase();
    SKIPPED_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Compiled include/exclude regexes deciding which discovered URLs are followed
#[derive(Debug, Clone, Default)]
pub struct UrlPatterns {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl UrlPatterns {
    /// Invalid patterns are logged and skipped
    pub fn compile(include: &[String], exclude: &[String]) -> Self {
        let compile = |patterns: &[String], kind: &str| -> Vec<Regex> {
            patterns
                .iter()
                .filter_map(|p| match Regex::new(p) {
                    Ok(r) => Some(r),
                    Err(e) => {
                        warn!("Invalid {} pattern '{}': {}", kind, p, e);
                        None
                    }
                })
                .collect()
        };
        Self {
            include: compile(include, "include"),
            exclude: compile(exclude, "exclude"),
        }
    }

    pub fn permits(&self, url: &str) -> bool {
        if self.exclude.iter().any(|p| p.is_match(url)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| p.is_match(url))
    }
}

/// Default crawl priority: shallow, short, root and https URLs first.
pub fn priority_for(url: &Url, depth: u32) -> f32 {
    let segments = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).count())
        .unwrap_or(0);

    let mut priority = 1.0f32;
    priority -= 0.1 * depth as f32; // breadth-first bias
    priority -= 0.05 * segments.saturating_sub(1) as f32;
    if url.path() == "/" {
        priority += 0.3;
    }
    if url.scheme() == "https" {
        priority += 0.1;
    }
    priority.max(0.0)
}
