//! Fetcher pool
//!
//! A fixed number of tokio workers share the frontier, politeness tracker,
//! fetcher and hand-off queue. `PageCrawler` holds the fetch-and-extract step
//! so the synchronous crawl path runs exactly the same code.

use super::{
    host_key, priority_for, DedupFilter, FetchError, Fetcher, Frontier, PolitenessTracker,
    UrlPatterns,
};
use crate::config::CrawlConfig;
use crate::content::{extractor_for, ContentType};
use crate::queue::HandoffQueue;
use crate::store::{KvCache, Store};
use crate::types::{
    FailureKind, FetchFailure, FrontierEntry, JobCounter, PageEvent, RawPage,
};
use anyhow::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use url::Url;

/// Result of one crawl attempt
#[derive(Debug)]
pub enum CrawlOutcome {
    Fetched(RawPage),
    /// robots.txt forbids the URL
    Disallowed,
    Error(FetchError),
}

/// Fetch, classify and extract a single frontier entry
pub struct PageCrawler {
    fetcher: Fetcher,
    politeness: Arc<PolitenessTracker>,
    max_links: usize,
}

impl PageCrawler {
    pub fn new(
        fetcher: Fetcher,
        politeness: Arc<PolitenessTracker>,
        config: &CrawlConfig,
    ) -> Self {
        Self {
            fetcher,
            politeness,
            max_links: config.max_links_per_page,
        }
    }

    pub fn politeness(&self) -> &Arc<PolitenessTracker> {
        &self.politeness
    }

    /// Robots check, fetch, politeness bookkeeping and extraction.
    ///
    /// `worker_id` is stamped on the produced page.
    pub async fn crawl_page(&self, entry: &FrontierEntry, worker_id: &str) -> CrawlOutcome {
        let url = match Url::parse(&entry.url) {
            Ok(url) => url,
            Err(e) => return CrawlOutcome::Error(FetchError::InvalidUrl(e.to_string())),
        };
        if self.politeness.disallowed_by_robots(&url).await {
            return CrawlOutcome::Disallowed;
        }

        let host = host_key(&url);
        let result = self.fetcher.fetch(&url).await;
        self.politeness.record_fetch(&host, Instant::now());

        let fetched = match result {
            Ok(fetched) => fetched,
            Err(e) => {
                if e.is_rate_limited() {
                    self.politeness.record_rate_limited(&host, e.retry_after());
                } else if e.kind() == FailureKind::Transient {
                    self.politeness.record_error(&host);
                }
                return CrawlOutcome::Error(e);
            }
        };

        let content_type = ContentType::from_mime(&fetched.content_type);
        let Some(extractor) = extractor_for(content_type, self.max_links) else {
            return CrawlOutcome::Error(FetchError::InvalidContentType(fetched.content_type));
        };
        let content = match extractor.extract(&fetched.body, &fetched.final_url) {
            Ok(content) => content,
            Err(e) => return CrawlOutcome::Error(FetchError::Malformed(e.to_string())),
        };

        CrawlOutcome::Fetched(RawPage {
            url: entry.url.clone(),
            http_status: fetched.status_code,
            content_type: fetched.content_type,
            content_length: fetched.content_length,
            title: content.title,
            description: content.description,
            text: content.text,
            links: content.links,
            fetched_at: Utc::now(),
            depth: entry.depth,
            attempts: entry.attempts + 1,
            job_id: entry.job_id,
            worker_id: worker_id.to_string(),
        })
    }
}

/// Counters shared by all workers of a pool
#[derive(Debug, Default)]
pub struct FetcherPoolStats {
    pub fetched: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
    /// Politeness or host-slot deferrals
    pub requeued: AtomicU64,
    pub disallowed: AtomicU64,
    pub links_enqueued: AtomicU64,
}

impl FetcherPoolStats {
    pub fn fetched(&self) -> u64 {
        self.fetched.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn requeued(&self) -> u64 {
        self.requeued.load(Ordering::Relaxed)
    }

    pub fn disallowed(&self) -> u64 {
        self.disallowed.load(Ordering::Relaxed)
    }

    pub fn links_enqueued(&self) -> u64 {
        self.links_enqueued.load(Ordering::Relaxed)
    }
}

/// Bounded pool of crawl workers
#[derive(Clone)]
pub struct FetcherPool {
    frontier: Arc<Frontier>,
    crawler: Arc<PageCrawler>,
    queue: Arc<dyn HandoffQueue>,
    dedup: Arc<DedupFilter>,
    cache: Arc<dyn KvCache>,
    store: Arc<Store>,
    config: CrawlConfig,
    patterns: Arc<UrlPatterns>,
    worker_id: String,
    poll_interval: Duration,
    max_pages: Option<u64>,
    stats: Arc<FetcherPoolStats>,
}

impl FetcherPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        frontier: Arc<Frontier>,
        crawler: Arc<PageCrawler>,
        queue: Arc<dyn HandoffQueue>,
        dedup: Arc<DedupFilter>,
        cache: Arc<dyn KvCache>,
        store: Arc<Store>,
        config: CrawlConfig,
        worker_id: impl Into<String>,
    ) -> Self {
        let patterns = Arc::new(UrlPatterns::compile(
            &config.include_patterns,
            &config.exclude_patterns,
        ));
        Self {
            frontier,
            crawler,
            queue,
            dedup,
            cache,
            store,
            config,
            patterns,
            worker_id: worker_id.into(),
            poll_interval: Duration::from_millis(100),
            max_pages: None,
            stats: Arc::new(FetcherPoolStats::default()),
        }
    }

    /// Stop after this many successful fetches
    pub fn with_page_limit(mut self, max_pages: Option<u64>) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn stats(&self) -> Arc<FetcherPoolStats> {
        self.stats.clone()
    }

    /// Run workers until shutdown fires, the page limit is reached, or (with
    /// `idle_shutdown`) the frontier has nothing pending, delayed or in flight.
    pub async fn run(&self, shutdown: broadcast::Sender<()>, idle_shutdown: bool) -> Result<()> {
        let workers = self.config.workers.max(1);
        info!("Starting fetcher pool with {} workers", workers);

        let mut handles = Vec::with_capacity(workers);
        for n in 0..workers {
            let pool = self.clone();
            let shutdown_rx = shutdown.subscribe();
            let worker_id = format!("{}-{}", self.worker_id, n);
            handles.push(tokio::spawn(async move {
                pool.worker_loop(worker_id, shutdown_rx, idle_shutdown).await;
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Fetcher worker panicked: {}", e);
            }
        }

        if let Err(e) = self.dedup.persist(self.cache.as_ref()) {
            warn!("Failed to persist dedup filter: {}", e);
        }
        info!(
            "Fetcher pool stopped: {} fetched, {} failed, {} retried, {} deferred",
            self.stats.fetched(),
            self.stats.failed(),
            self.stats.retried(),
            self.stats.requeued()
        );
        Ok(())
    }

    fn limit_reached(&self) -> bool {
        self.max_pages
            .map(|max| self.stats.fetched() >= max)
            .unwrap_or(false)
    }

    async fn worker_loop(
        &self,
        worker_id: String,
        mut shutdown: broadcast::Receiver<()>,
        idle_shutdown: bool,
    ) {
        debug!("Worker {} started", worker_id);
        loop {
            match shutdown.try_recv() {
                Err(broadcast::error::TryRecvError::Empty) => {}
                _ => break,
            }
            if self.limit_reached() {
                break;
            }

            match self.frontier.dequeue() {
                Ok(Some(entry)) => {
                    if let Err(e) = self.process(entry, &worker_id).await {
                        error!("Worker {} failed to process entry: {}", worker_id, e);
                    }
                }
                Ok(None) => {
                    if idle_shutdown && self.frontier.is_idle() {
                        break;
                    }
                    let wait = self
                        .frontier
                        .next_due_in()
                        .map(|due| due.min(self.poll_interval))
                        .unwrap_or(self.poll_interval)
                        .max(Duration::from_millis(10));
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = shutdown.recv() => break,
                    }
                }
                Err(e) => {
                    error!("Frontier dequeue failed: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.recv() => break,
                    }
                }
            }
        }
        debug!("Worker {} stopped", worker_id);
    }

    /// Handle one leased entry. Every path either completes or requeues it.
    async fn process(&self, entry: FrontierEntry, worker_id: &str) -> Result<()> {
        let host = match Url::parse(&entry.url) {
            Ok(url) => host_key(&url),
            Err(_) => String::new(),
        };
        let politeness = self.crawler.politeness();

        let Some(_permit) = politeness.try_acquire(&host) else {
            let slot_wait = politeness
                .delay_remaining(&host)
                .unwrap_or(politeness.config().default_delay);
            debug!("Host {} at its in-flight limit, deferring {}", host, entry.url);
            self.stats.requeued.fetch_add(1, Ordering::Relaxed);
            return self
                .frontier
                .requeue(entry, slot_wait.max(Duration::from_millis(50)));
        };
        if let Some(wait) = politeness.reserve(&host) {
            debug!("Politeness delay for {}, deferring {} by {:?}", host, entry.url, wait);
            self.stats.requeued.fetch_add(1, Ordering::Relaxed);
            return self.frontier.requeue(entry, wait);
        }

        match self.crawler.crawl_page(&entry, worker_id).await {
            CrawlOutcome::Fetched(page) => self.handle_fetched(entry, page).await,
            CrawlOutcome::Disallowed => {
                debug!("Disallowed by robots.txt: {}", entry.url);
                self.stats.disallowed.fetch_add(1, Ordering::Relaxed);
                self.frontier.complete(&entry.url)
            }
            CrawlOutcome::Error(e) => self.handle_error(entry, e, worker_id).await,
        }
    }

    async fn handle_fetched(&self, entry: FrontierEntry, page: RawPage) -> Result<()> {
        let next_depth = entry.depth + 1;
        if next_depth <= self.frontier.max_depth() {
            let scope = self.config.stay_on_domain.then(|| self.seed_host(&entry));
            for link in page.links.iter().filter(|l| self.patterns.permits(&l.url)) {
                let Ok(url) = Url::parse(&link.url) else {
                    continue;
                };
                if let Some(seed_host) = &scope {
                    if host_key(&url) != *seed_host {
                        continue;
                    }
                }
                let candidate = FrontierEntry::new(link.url.clone(), priority_for(&url, next_depth), next_depth)
                    .with_job(entry.job_id);
                if self.frontier.enqueue_entry(candidate)? {
                    self.stats.links_enqueued.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let job_id = page.job_id;
        if let Err(e) = self.queue.publish(&PageEvent::Fetched(page)).await {
            warn!("Hand-off queue unavailable for {}: {}, retrying", entry.url, e);
            return self.frontier.requeue(entry, self.config.retry_backoff());
        }

        self.stats.fetched.fetch_add(1, Ordering::Relaxed);
        if let Some(job_id) = job_id {
            if let Err(e) = self.store.bump_job(job_id, JobCounter::Crawled) {
                warn!("Failed to update job {}: {}", job_id, e);
            }
        }
        self.frontier.complete(&entry.url)
    }

    /// Host of the seed that started the entry's job, or the entry's own
    /// host when the job is unknown
    fn seed_host(&self, entry: &FrontierEntry) -> String {
        let seed = entry
            .job_id
            .and_then(|id| self.store.get_job(id))
            .map(|job| job.seed_url);
        seed.as_deref()
            .or(Some(entry.url.as_str()))
            .and_then(|u| Url::parse(u).ok())
            .map(|u| host_key(&u))
            .unwrap_or_default()
    }

    async fn handle_error(&self, mut entry: FrontierEntry, err: FetchError, worker_id: &str) -> Result<()> {
        entry.attempts += 1;
        let kind = err.kind();

        if kind.is_retryable() && entry.attempts < self.config.max_retries {
            let backoff = retry_delay(self.config.retry_backoff(), entry.attempts)
                .max(err.retry_after().unwrap_or_default());
            warn!(
                "Fetch of {} failed (attempt {}/{}): {}, retrying in {:?}",
                entry.url, entry.attempts, self.config.max_retries, err, backoff
            );
            self.stats.retried.fetch_add(1, Ordering::Relaxed);
            return self.frontier.requeue(entry, backoff);
        }

        warn!("Giving up on {} after {} attempts: {}", entry.url, entry.attempts, err);
        let failure = FetchFailure {
            url: entry.url.clone(),
            reason: err.to_string(),
            kind,
            http_status: err.http_status(),
            attempts: entry.attempts,
            failed_at: Utc::now(),
            job_id: entry.job_id,
            worker_id: worker_id.to_string(),
        };
        if let Err(e) = self.queue.publish(&PageEvent::Failed(failure)).await {
            warn!("Hand-off queue unavailable for failure of {}: {}", entry.url, e);
            entry.attempts -= 1;
            return self.frontier.requeue(entry, self.config.retry_backoff());
        }
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        self.frontier.complete(&entry.url)
    }
}

/// `base · 2^(attempt-1)`, capped so the shift cannot overflow
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}
