//! Politeness tracking for the crawler
//!
//! Handles robots.txt parsing and caching, per-host delay between fetches,
//! 429 back-off, and a soft per-host bound on concurrent fetches.

use anyhow::{Context, Result};
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};
use url::Url;

use super::host_key;
use crate::config::CrawlConfig;

/// One Allow/Disallow line from the applicable user-agent group
#[derive(Debug, Clone, PartialEq)]
struct RobotsRule {
    pattern: String,
    allow: bool,
}

/// Parsed robots.txt rules for one host
#[derive(Debug, Clone)]
pub struct CachedRobots {
    rules: Vec<RobotsRule>,
    crawl_delay: Option<Duration>,
    fetched_at: Instant,
    ttl: Duration,
}

impl CachedRobots {
    pub fn new(content: &str, user_agent: &str, ttl: Duration) -> Self {
        let (rules, crawl_delay) = Self::parse(content, user_agent);
        Self {
            rules,
            crawl_delay,
            fetched_at: Instant::now(),
            ttl,
        }
    }

    /// Rules used when robots.txt is missing or could not be fetched
    pub fn allow_all(ttl: Duration) -> Self {
        Self {
            rules: Vec::new(),
            crawl_delay: None,
            fetched_at: Instant::now(),
            ttl,
        }
    }

    /// Longest matching rule wins; on equal length, Allow wins.
    pub fn is_allowed(&self, path: &str) -> bool {
        let mut best: Option<(usize, bool)> = None;
        for rule in &self.rules {
            if !Self::path_matches(path, &rule.pattern) {
                continue;
            }
            let len = rule.pattern.len();
            best = match best {
                Some((best_len, best_allow))
                    if best_len > len || (best_len == len && best_allow) =>
                {
                    Some((best_len, best_allow))
                }
                _ => Some((len, rule.allow)),
            };
        }
        best.map(|(_, allow)| allow).unwrap_or(true)
    }

    pub fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < self.ttl
    }

    pub fn crawl_delay(&self) -> Option<Duration> {
        self.crawl_delay
    }

    fn parse(content: &str, user_agent: &str) -> (Vec<RobotsRule>, Option<Duration>) {
        let ua_lower = user_agent.to_lowercase();

        let mut wildcard: (Vec<RobotsRule>, Option<Duration>) = (Vec::new(), None);
        let mut specific: (Vec<RobotsRule>, Option<Duration>) = (Vec::new(), None);
        let mut found_specific = false;

        // Agents named by the current group; a group ends when a rule line
        // is followed by another user-agent line.
        let mut group_wildcard = false;
        let mut group_specific = false;
        let mut in_rules = false;

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let directive = directive.trim().to_lowercase();
            let value = value.trim();

            if directive == "user-agent" {
                if in_rules {
                    group_wildcard = false;
                    group_specific = false;
                    in_rules = false;
                }
                let agent = value.to_lowercase();
                if agent == "*" {
                    group_wildcard = true;
                } else if !agent.is_empty() && (ua_lower.contains(&agent) || agent.contains(&ua_lower)) {
                    group_specific = true;
                    found_specific = true;
                }
                continue;
            }

            in_rules = true;
            let targets: Vec<&mut (Vec<RobotsRule>, Option<Duration>)> =
                match (group_specific, group_wildcard) {
                    (true, true) => vec![&mut specific, &mut wildcard],
                    (true, false) => vec![&mut specific],
                    (false, true) => vec![&mut wildcard],
                    (false, false) => continue,
                };

            for target in targets {
                match directive.as_str() {
                    "disallow" if !value.is_empty() => target.0.push(RobotsRule {
                        pattern: value.to_string(),
                        allow: false,
                    }),
                    "allow" if !value.is_empty() => target.0.push(RobotsRule {
                        pattern: value.to_string(),
                        allow: true,
                    }),
                    "crawl-delay" => {
                        if let Ok(secs) = value.parse::<f64>() {
                            if secs.is_finite() && secs >= 0.0 {
                                target.1 = Some(Duration::from_secs_f64(secs));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        if found_specific {
            specific
        } else {
            wildcard
        }
    }

    /// Match a path against a robots pattern (`*` wildcard, `$` end anchor)
    fn path_matches(path: &str, pattern: &str) -> bool {
        if pattern.is_empty() {
            return false;
        }
        let (pattern, anchored) = match pattern.strip_suffix('$') {
            Some(p) => (p, true),
            None => (pattern, false),
        };

        if !pattern.contains('*') {
            return if anchored {
                path == pattern
            } else {
                path.starts_with(pattern)
            };
        }

        let parts: Vec<&str> = pattern.split('*').collect();
        let mut pos = 0;
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() {
                continue;
            }
            match path[pos..].find(part) {
                Some(found) if i == 0 && found != 0 => return false,
                Some(found) => pos += found + part.len(),
                None => return false,
            }
        }
        if anchored {
            // a trailing '*' before '$' lets the rest of the path match
            return parts.last().map(|p| p.is_empty()).unwrap_or(false) || pos == path.len();
        }
        true
    }
}

/// Per-host delay clock and back-off
#[derive(Debug, Clone, Default)]
struct HostState {
    last_fetch: Option<Instant>,
    consecutive_429s: u32,
    backoff_until: Option<Instant>,
    fetch_count: u64,
}

/// Configuration for the politeness tracker
#[derive(Debug, Clone)]
pub struct PolitenessConfig {
    pub user_agent: String,
    /// Delay between fetches to one host when robots.txt names none
    pub default_delay: Duration,
    /// Lower clamp for robots.txt crawl-delay
    pub min_delay: Duration,
    /// Upper clamp for robots.txt crawl-delay
    pub max_delay: Duration,
    pub robots_ttl: Duration,
    pub cache_size: usize,
    pub request_timeout: Duration,
    pub max_inflight_per_host: usize,
    /// Host back-off after a timeout or connection failure
    pub error_backoff: Duration,
}

impl Default for PolitenessConfig {
    fn default() -> Self {
        Self::from(&CrawlConfig::default())
    }
}

impl From<&CrawlConfig> for PolitenessConfig {
    fn from(config: &CrawlConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            default_delay: config.politeness_delay(),
            min_delay: Duration::from_millis(config.min_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            robots_ttl: config.robots_cache_ttl(),
            cache_size: config.robots_cache_size,
            request_timeout: config.request_timeout(),
            max_inflight_per_host: config.max_inflight_per_host,
            error_backoff: config.retry_backoff(),
        }
    }
}

/// Statistics from the politeness tracker
#[derive(Debug, Clone)]
pub struct PolitenessStats {
    pub hosts_tracked: usize,
    pub robots_cached: usize,
    pub rate_limited_hosts: usize,
    pub total_fetches: u64,
}

/// Robots cache, per-host delay clock and per-host concurrency slots
pub struct PolitenessTracker {
    robots: Mutex<LruCache<String, CachedRobots>>,
    hosts: DashMap<String, HostState>,
    slots: DashMap<String, Arc<Semaphore>>,
    config: PolitenessConfig,
    http_client: reqwest::Client,
}

impl PolitenessTracker {
    pub fn new(config: PolitenessConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .context("Failed to build robots.txt client")?;

        let capacity = NonZeroUsize::new(config.cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            robots: Mutex::new(LruCache::new(capacity)),
            hosts: DashMap::new(),
            slots: DashMap::new(),
            config,
            http_client,
        })
    }

    /// True when the host's politeness delay and any back-off have elapsed
    pub fn allowed(&self, host: &str) -> bool {
        self.delay_remaining(host).is_none()
    }

    /// Time until the host may be fetched again, if any
    pub fn delay_remaining(&self, host: &str) -> Option<Duration> {
        let delay = self.delay_for_host(host);
        let state = self.hosts.get(host)?;
        let now = Instant::now();

        if let Some(until) = state.backoff_until {
            if now < until {
                return Some(until - now);
            }
        }
        let last = state.last_fetch?;
        let elapsed = now.saturating_duration_since(last);
        (elapsed < delay).then(|| delay - elapsed)
    }

    /// Claim the host's next fetch slot.
    ///
    /// Returns the remaining wait when the delay or a back-off is still
    /// running. Otherwise stamps the delay clock and returns `None`; the
    /// check and the stamp happen under one entry lock, so two workers can
    /// never both be granted the same slot.
    pub fn reserve(&self, host: &str) -> Option<Duration> {
        let delay = self.delay_for_host(host);
        let mut state = self.hosts.entry(host.to_string()).or_default();
        let now = Instant::now();

        if let Some(until) = state.backoff_until {
            if now < until {
                return Some(until - now);
            }
        }
        if let Some(last) = state.last_fetch {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < delay {
                return Some(delay - elapsed);
            }
        }
        state.last_fetch = Some(now);
        None
    }

    /// robots.txt crawl-delay (clamped) or the configured default
    fn delay_for_host(&self, host: &str) -> Duration {
        let crawl_delay = self
            .robots
            .lock()
            .peek(host)
            .and_then(|robots| robots.crawl_delay());
        match crawl_delay {
            Some(d) => d.clamp(self.config.min_delay, self.config.max_delay),
            None => self.config.default_delay,
        }
    }

    /// Check robots.txt for the URL, fetching and caching rules as needed.
    ///
    /// A robots.txt that cannot be fetched allows everything.
    pub async fn disallowed_by_robots(&self, url: &Url) -> bool {
        let host = host_key(url);
        let robots = self.robots_for(&host, url).await;
        let target = match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        };
        !robots.is_allowed(&target)
    }

    async fn robots_for(&self, host: &str, url: &Url) -> CachedRobots {
        let cached = self.robots.lock().get(host).filter(|r| r.is_fresh()).cloned();
        if let Some(robots) = cached {
            return robots;
        }

        let robots_url = format!("{}://{}/robots.txt", url.scheme(), host);
        let robots = match self.http_client.get(&robots_url).send().await {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(body) => CachedRobots::new(&body, &self.config.user_agent, self.config.robots_ttl),
                Err(e) => {
                    warn!("Failed to read {}: {}, allowing all", robots_url, e);
                    CachedRobots::allow_all(self.config.robots_ttl)
                }
            },
            Ok(response) => {
                debug!("{} returned {}, allowing all", robots_url, response.status());
                CachedRobots::allow_all(self.config.robots_ttl)
            }
            Err(e) => {
                warn!("Failed to fetch {}: {}, allowing all", robots_url, e);
                CachedRobots::allow_all(self.config.robots_ttl)
            }
        };

        self.robots.lock().put(host.to_string(), robots.clone());
        robots
    }

    /// Record a completed fetch against the host's delay clock
    pub fn record_fetch(&self, host: &str, at: Instant) {
        let mut state = self.hosts.entry(host.to_string()).or_default();
        state.last_fetch = Some(at);
        state.consecutive_429s = 0;
        state.fetch_count += 1;
    }

    /// Record a 429 response: exponential back-off 30s, 60s, 120s, 240s (max 10 min)
    pub fn record_rate_limited(&self, host: &str, retry_after: Option<Duration>) {
        let mut state = self.hosts.entry(host.to_string()).or_default();
        state.consecutive_429s += 1;
        state.last_fetch = Some(Instant::now());

        let backoff = retry_after.unwrap_or_else(|| {
            Duration::from_secs(30 * 2u64.pow(state.consecutive_429s.min(4) - 1))
        });
        state.backoff_until = Some(Instant::now() + backoff.min(Duration::from_secs(600)));
    }

    /// Record a connection failure or timeout: short back-off
    pub fn record_error(&self, host: &str) {
        let mut state = self.hosts.entry(host.to_string()).or_default();
        state.last_fetch = Some(Instant::now());
        state.backoff_until = Some(Instant::now() + self.config.error_backoff);
    }

    /// Claim one of the host's in-flight slots, if any are free
    pub fn try_acquire(&self, host: &str) -> Option<OwnedSemaphorePermit> {
        let semaphore = self
            .slots
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_inflight_per_host)))
            .clone();
        semaphore.try_acquire_owned().ok()
    }

    pub fn stats(&self) -> PolitenessStats {
        let now = Instant::now();
        let rate_limited_hosts = self
            .hosts
            .iter()
            .filter(|s| s.backoff_until.map(|b| now < b).unwrap_or(false))
            .count();

        PolitenessStats {
            hosts_tracked: self.hosts.len(),
            robots_cached: self.robots.lock().len(),
            rate_limited_hosts,
            total_fetches: self.hosts.iter().map(|s| s.fetch_count).sum(),
        }
    }

    pub fn config(&self) -> &PolitenessConfig {
        &self.config
    }
}
