//! Component wiring
//!
//! `Pipeline` owns every shared component on one sled database and one
//! inverted index, and exposes the crawl, synchronous crawl-index, rank,
//! search and stats operations used by the CLI.

use crate::config::{Config, TokenizerKind};
use crate::crawl::{
    canonicalize_str, host_key, priority_for, CrawlOutcome, DedupFilter, FetchConfig, Fetcher,
    FetcherPool, Frontier, PageCrawler, PolitenessConfig, PolitenessTracker,
};
use crate::index::{
    AnalyzerTokenizer, Indexer, IndexerWorker, InvertedIndex, TantivyIndex, TermTokenizer,
    WordTokenizer,
};
use crate::queue::{DeadLetter, HandoffQueue, SledQueue};
use crate::rank::{RankReport, RankingEngine};
use crate::search::{QueryScorer, SearchError, SearchResponse};
use crate::store::{KvCache, MemoryCache, RankSummary, SledCache, Store};
use crate::types::{
    CrawlJob, FetchFailure, FrontierEntry, JobStatus, PageEvent, PageId, PageStatus,
    QueryLogEntry,
};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Options for one asynchronous crawl run
#[derive(Debug, Clone, Default)]
pub struct CrawlOptions {
    /// Stop fetching after this many successful pages
    pub max_pages: Option<u64>,
}

/// What an asynchronous crawl run did
#[derive(Debug, Clone, Serialize)]
pub struct CrawlSummary {
    pub job_ids: Vec<Uuid>,
    pub fetched: u64,
    pub failed: u64,
    pub retried: u64,
    pub disallowed: u64,
    pub indexed: u64,
    pub rank_generation: Option<u64>,
    pub took_ms: u64,
}

/// Per-URL result of the synchronous path
#[derive(Debug, Clone, Serialize)]
pub struct UrlOutcome {
    pub url: String,
    pub success: bool,
    pub page_id: Option<PageId>,
    pub title: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlIndexReport {
    pub results: Vec<UrlOutcome>,
    pub succeeded: usize,
    pub failed: usize,
    pub took_ms: u64,
}

/// Snapshot of pipeline state
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub pages_by_status: HashMap<String, usize>,
    pub pages: usize,
    pub links: usize,
    pub indexed_documents: usize,
    pub ranks: Option<RankSummary>,
    pub frontier_pending: usize,
    pub frontier_inflight: usize,
    pub frontier_delayed: usize,
    pub queue_ready: usize,
    pub queue_unacked: usize,
    pub dead_letters: usize,
    pub dedup_estimate: usize,
    pub dedup_fill_ratio: f64,
    pub queries: usize,
    pub recent_queries: Vec<QueryLogEntry>,
}

pub struct Pipeline {
    config: Config,
    store: Arc<Store>,
    state_cache: Arc<dyn KvCache>,
    dedup: Arc<DedupFilter>,
    frontier: Arc<Frontier>,
    queue: Arc<SledQueue>,
    index: Arc<dyn InvertedIndex>,
    tokenizer: Arc<dyn TermTokenizer>,
    crawler: Arc<PageCrawler>,
    indexer: Arc<Indexer>,
    ranking: Arc<RankingEngine>,
    scorer: QueryScorer,
}

impl Pipeline {
    /// Open the on-disk pipeline under `config.node.data_dir`
    pub fn open(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.node.data_dir).with_context(|| {
            format!("Failed to create data directory {:?}", config.node.data_dir)
        })?;
        let store = Arc::new(Store::open(config.node.store_path())?);
        let index = Arc::new(TantivyIndex::open(
            config.node.index_path(),
            config.index.stemming,
            config.index.writer_heap_bytes,
        )?);
        let state_cache: Arc<dyn KvCache> = Arc::new(SledCache::open(store.db(), "cache")?);
        Self::assemble(config, store, index, state_cache.clone(), state_cache)
    }

    /// Fully in-memory pipeline, discarded on drop
    pub fn temporary(config: Config) -> Result<Self> {
        let store = Arc::new(Store::temporary()?);
        let index = Arc::new(TantivyIndex::in_memory(
            config.index.stemming,
            config.index.writer_heap_bytes,
        )?);
        let state_cache: Arc<dyn KvCache> = Arc::new(SledCache::open(store.db(), "cache")?);
        let result_cache: Arc<dyn KvCache> =
            Arc::new(MemoryCache::new(config.search.cache_capacity));
        Self::assemble(config, store, index, state_cache, result_cache)
    }

    fn assemble(
        config: Config,
        store: Arc<Store>,
        index: Arc<dyn InvertedIndex>,
        state_cache: Arc<dyn KvCache>,
        result_cache: Arc<dyn KvCache>,
    ) -> Result<Self> {
        let dedup = Arc::new(DedupFilter::warm(
            state_cache.as_ref(),
            config.crawl.bloom_expected_items,
            config.crawl.bloom_false_positive_rate,
        ));
        let frontier = Arc::new(Frontier::open(
            store.db(),
            dedup.clone(),
            config.crawl.max_depth,
            config.crawl.lease_timeout(),
        )?);
        let queue = Arc::new(SledQueue::open(store.db(), config.queue.max_deliveries)?);

        let politeness = Arc::new(PolitenessTracker::new(PolitenessConfig::from(&config.crawl))?);
        let fetcher = Fetcher::new(FetchConfig::from(&config.crawl))
            .context("Failed to build HTTP client")?;
        let crawler = Arc::new(PageCrawler::new(fetcher, politeness, &config.crawl));

        let tokenizer: Arc<dyn TermTokenizer> = match config.index.tokenizer {
            TokenizerKind::Analyzer => Arc::new(AnalyzerTokenizer::english(
                config.index.stemming,
                config.index.min_token_len,
            )),
            TokenizerKind::Word => Arc::new(WordTokenizer::new(config.index.min_token_len)),
        };
        debug!("Using {} term tokenizer", tokenizer.name());
        let indexer = Arc::new(Indexer::new(
            store.clone(),
            index.clone(),
            tokenizer.clone(),
            config.index.clone(),
        ));
        let ranking = Arc::new(RankingEngine::new(store.clone(), config.ranking.clone()));
        let scorer = QueryScorer::new(
            index.clone(),
            store.clone(),
            result_cache,
            tokenizer.clone(),
            config.search.clone(),
        );

        Ok(Self {
            config,
            store,
            state_cache,
            dedup,
            frontier,
            queue,
            index,
            tokenizer,
            crawler,
            indexer,
            ranking,
            scorer,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn frontier(&self) -> &Arc<Frontier> {
        &self.frontier
    }

    pub fn queue(&self) -> &Arc<SledQueue> {
        &self.queue
    }

    pub fn tokenizer(&self) -> &Arc<dyn TermTokenizer> {
        &self.tokenizer
    }

    pub fn indexer(&self) -> &Arc<Indexer> {
        &self.indexer
    }

    pub fn ranking(&self) -> &Arc<RankingEngine> {
        &self.ranking
    }

    /// Crawl from `seeds` through the frontier, fetcher pool, hand-off queue
    /// and indexer workers until the frontier drains (or the page limit is
    /// hit), then recompute ranks.
    ///
    /// With no seeds, `crawl.default_seeds` are used.
    pub async fn crawl(&self, seeds: &[String], options: CrawlOptions) -> Result<CrawlSummary> {
        let started = Instant::now();

        let seeds = if seeds.is_empty() {
            info!(
                "No seeds given, using {} default seeds",
                self.config.crawl.default_seeds.len()
            );
            self.config.crawl.default_seeds.as_slice()
        } else {
            seeds
        };

        let mut job_ids = Vec::new();
        for seed in seeds {
            let Some(url) = canonicalize_str(seed) else {
                warn!("Skipping invalid seed URL: {}", seed);
                continue;
            };
            let job = CrawlJob::start(url.as_str());
            self.store.create_job(&job)?;
            if self
                .frontier
                .enqueue_seed(url.as_str(), priority_for(&url, 0), Some(job.id))?
            {
                debug!("Seeded {}", url);
            } else {
                debug!("Seed {} is already queued", url);
            }
            job_ids.push(job.id);
        }
        if job_ids.is_empty() {
            anyhow::bail!("No valid seed URLs");
        }

        let (shutdown, _) = broadcast::channel::<()>(4);

        let mut indexers = Vec::new();
        for _ in 0..self.config.index.indexer_workers.max(1) {
            let worker = IndexerWorker::new(
                self.indexer.clone(),
                self.queue.clone(),
                &self.config.queue,
            );
            let rx = shutdown.subscribe();
            indexers.push(tokio::spawn(async move { worker.run(rx).await }));
        }

        let periodic = self.config.ranking.interval().map(|interval| {
            let ranking = self.ranking.clone();
            let rx = shutdown.subscribe();
            tokio::spawn(async move { ranking.run_periodic(interval, rx).await })
        });

        let pool = FetcherPool::new(
            self.frontier.clone(),
            self.crawler.clone(),
            self.queue.clone(),
            self.dedup.clone(),
            self.state_cache.clone(),
            self.store.clone(),
            self.config.crawl.clone(),
            self.config.node.worker_id.clone(),
        )
        .with_page_limit(options.max_pages);
        let pool_stats = pool.stats();
        pool.run(shutdown.clone(), true).await?;

        // let the indexers finish what the pool published
        let drain_deadline = Instant::now() + self.config.queue.drain_timeout();
        while !self.queue.is_empty() || self.queue.unacked_len() > 0 {
            if Instant::now() >= drain_deadline {
                warn!(
                    "Hand-off queue not drained after {:?} ({} ready, {} unacked), stopping indexers",
                    self.config.queue.drain_timeout(),
                    self.queue.len(),
                    self.queue.unacked_len()
                );
                break;
            }
            tokio::time::sleep(self.config.queue.poll_interval()).await;
        }
        if shutdown.send(()).is_err() {
            debug!("No workers left to receive shutdown");
        }

        let mut indexed = 0;
        for handle in indexers {
            match handle.await {
                Ok(n) => indexed += n,
                Err(e) => warn!("Indexer worker panicked: {}", e),
            }
        }
        if let Some(handle) = periodic {
            if let Err(e) = handle.await {
                warn!("Ranking task panicked: {}", e);
            }
        }

        for id in &job_ids {
            let status = match self.store.get_job(*id) {
                Some(job) if job.pages_crawled == 0 && job.error_count > 0 => JobStatus::Failed,
                _ => JobStatus::Completed,
            };
            self.store.finish_job(*id, status)?;
        }

        let rank_generation = match self.ranking.recompute().await {
            Ok(report) => Some(report.summary.generation),
            Err(e) => {
                warn!("Rank recompute after crawl failed: {:#}", e);
                None
            }
        };
        self.store.flush()?;

        let summary = CrawlSummary {
            job_ids,
            fetched: pool_stats.fetched(),
            failed: pool_stats.failed(),
            retried: pool_stats.retried(),
            disallowed: pool_stats.disallowed(),
            indexed,
            rank_generation,
            took_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            "Crawl finished: {} fetched, {} failed, {} indexed in {}ms",
            summary.fetched, summary.failed, summary.indexed, summary.took_ms
        );
        Ok(summary)
    }

    /// Fetch and index `urls` inline, bypassing the frontier and the queue.
    ///
    /// Each URL gets one attempt; its outcome is reported immediately.
    pub async fn crawl_index(&self, urls: &[String]) -> Result<CrawlIndexReport> {
        let started = Instant::now();
        let mut results = Vec::with_capacity(urls.len());

        for raw in urls {
            let outcome = self.crawl_index_one(raw).await;
            if let Some(error) = &outcome.error {
                debug!("crawl-index {} failed: {}", raw, error);
            }
            results.push(outcome);
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        self.store.flush()?;
        Ok(CrawlIndexReport {
            failed: results.len() - succeeded,
            succeeded,
            results,
            took_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn crawl_index_one(&self, raw: &str) -> UrlOutcome {
        let failed = |url: &str, error: String| UrlOutcome {
            url: url.to_string(),
            success: false,
            page_id: None,
            title: None,
            error: Some(error),
        };

        let Some(url) = canonicalize_str(raw) else {
            return failed(raw, "Invalid URL".to_string());
        };
        let canonical = url.to_string();

        let politeness = self.crawler.politeness();
        let host = host_key(&url);
        while let Some(wait) = politeness.reserve(&host) {
            tokio::time::sleep(wait).await;
        }

        let entry = FrontierEntry::new(canonical.clone(), 1.0, 0);
        let event = match self
            .crawler
            .crawl_page(&entry, &self.config.node.worker_id)
            .await
        {
            CrawlOutcome::Fetched(page) => PageEvent::Fetched(page),
            CrawlOutcome::Disallowed => {
                return failed(&canonical, "Disallowed by robots.txt".to_string());
            }
            CrawlOutcome::Error(e) => PageEvent::Failed(FetchFailure {
                url: canonical.clone(),
                reason: e.to_string(),
                kind: e.kind(),
                http_status: e.http_status(),
                attempts: 1,
                failed_at: Utc::now(),
                job_id: None,
                worker_id: self.config.node.worker_id.clone(),
            }),
        };

        let indexer = self.indexer.clone();
        let processed = tokio::task::spawn_blocking(move || {
            let result = indexer.process(&event);
            (event, result)
        })
        .await;

        match processed {
            Ok((PageEvent::Fetched(page), Ok(_))) => UrlOutcome {
                url: canonical.clone(),
                success: true,
                page_id: Some(PageId::from_url(&canonical)),
                title: Some(page.title),
                error: None,
            },
            Ok((PageEvent::Failed(failure), Ok(_))) => failed(&canonical, failure.reason),
            Ok((_, Err(e))) => failed(&canonical, format!("{:#}", e)),
            Err(e) => failed(&canonical, format!("Index task failed: {}", e)),
        }
    }

    /// Recompute PageRank now, or join a recompute already running
    pub async fn rank(&self) -> Result<RankReport> {
        self.ranking.recompute().await
    }

    pub fn search(&self, query: &str, page: usize, size: usize) -> Result<SearchResponse, SearchError> {
        self.scorer.search(query, page, size)
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.queue.dead_letters().await
    }

    pub fn stats(&self) -> PipelineStats {
        let pages_by_status = self
            .store
            .page_counts()
            .into_iter()
            .map(|(status, n)| (status.as_str().to_string(), n))
            .collect();

        PipelineStats {
            pages_by_status,
            pages: self.store.page_count(),
            links: self.store.link_count(),
            indexed_documents: self.index.len(),
            ranks: self.store.rank_summary(),
            frontier_pending: self.frontier.len(),
            frontier_inflight: self.frontier.inflight_len(),
            frontier_delayed: self.frontier.delayed_len(),
            queue_ready: self.queue.len(),
            queue_unacked: self.queue.unacked_len(),
            dead_letters: self.queue.dead_letter_count(),
            dedup_estimate: self.dedup.estimate_count(),
            dedup_fill_ratio: self.dedup.fill_ratio(),
            queries: self.store.query_count(),
            recent_queries: self.store.recent_queries(10),
        }
    }

    /// Page status for a URL, canonicalized first
    pub fn page_status(&self, url: &str) -> Option<PageStatus> {
        let canonical = canonicalize_str(url)?;
        self.store
            .get_page(&PageId::from_url(canonical.as_str()))
            .map(|p| p.status)
    }

    pub fn is_failed(&self, url: &str) -> bool {
        self.page_status(url) == Some(PageStatus::Failed)
    }

    /// Drop everything queued in the frontier. Returns the entries dropped.
    pub fn clear_frontier(&self) -> Result<usize> {
        self.frontier.clear()
    }

    /// Reset URL dedup so every URL can be crawled again.
    ///
    /// Clears the Bloom filter and its persisted copy, and forgets which
    /// frontier URLs finished. Returns the number of finished URLs forgotten.
    pub fn clear_dedup(&self) -> Result<usize> {
        self.dedup.reset(self.state_cache.as_ref())?;
        self.frontier.forget_done()
    }

    /// Flush and persist crawl state
    pub fn close(&self) -> Result<()> {
        self.dedup.persist(self.state_cache.as_ref())?;
        self.store.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawPage;
    use httpmock::prelude::*;

    fn config() -> Config {
        let mut config = Config::default();
        config.crawl.politeness_delay_ms = 0;
        config.crawl.min_delay_ms = 0;
        config.crawl.retry_backoff_ms = 10;
        config.index.writer_heap_bytes = 20_000_000;
        config.queue.poll_interval_ms = 20;
        config
    }

    #[tokio::test]
    async fn test_crawl_index_rejects_invalid_url() {
        let pipeline = Pipeline::temporary(config()).unwrap();
        let report = pipeline
            .crawl_index(&["ftp://example.com/file".to_string()])
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.results[0].error.as_deref(), Some("Invalid URL"));
    }

    #[tokio::test]
    async fn test_crawl_without_valid_seeds_fails() {
        let pipeline = Pipeline::temporary(config()).unwrap();
        assert!(pipeline.crawl(&["not a url".to_string()], CrawlOptions::default()).await.is_err());
    }

    #[test]
    fn test_stats_on_empty_pipeline() {
        let pipeline = Pipeline::temporary(config()).unwrap();
        let stats = pipeline.stats();
        assert_eq!(stats.pages, 0);
        assert_eq!(stats.queue_ready, 0);
        assert!(stats.ranks.is_none());
    }

    async fn serve_site(server: &MockServer) {
        server
            .mock_async(|when, then| {
                when.method(GET).path("/robots.txt");
                then.status(404);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/");
                then.status(200)
                    .header("content-type", "text/html")
                    .body(r#"<html><title>Home</title><body>Welcome home. <a href="/a">A</a></body></html>"#);
            })
            .await;
    }

    fn raw_page(url: &str, text: &str) -> RawPage {
        RawPage {
            url: url.to_string(),
            http_status: 200,
            content_type: "text/html".to_string(),
            content_length: text.len() as u64,
            title: "Yard notes".to_string(),
            description: String::new(),
            text: text.to_string(),
            links: Vec::new(),
            fetched_at: Utc::now(),
            depth: 0,
            attempts: 1,
            job_id: None,
            worker_id: "w-0".to_string(),
        }
    }

    #[tokio::test]
    async fn test_crawl_without_seeds_uses_defaults() {
        let server = MockServer::start_async().await;
        serve_site(&server).await;
        let leaf = server
            .mock_async(|when, then| {
                when.method(GET).path("/a");
                then.status(200).header("content-type", "text/html").body("<p>leaf</p>");
            })
            .await;

        let mut config = config();
        config.crawl.default_seeds = vec![server.url("/")];
        let pipeline = Pipeline::temporary(config).unwrap();

        let summary = pipeline.crawl(&[], CrawlOptions::default()).await.unwrap();
        assert_eq!(summary.job_ids.len(), 1);
        assert_eq!(summary.fetched, 2);
        leaf.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn test_clear_dedup_allows_recrawl_of_known_links() {
        let server = MockServer::start_async().await;
        serve_site(&server).await;
        let leaf = server
            .mock_async(|when, then| {
                when.method(GET).path("/a");
                then.status(200).header("content-type", "text/html").body("<p>leaf</p>");
            })
            .await;

        let pipeline = Pipeline::temporary(config()).unwrap();
        let seeds = vec![server.url("/")];

        pipeline.crawl(&seeds, CrawlOptions::default()).await.unwrap();
        // the seed is crawled again, its known link is not
        let again = pipeline.crawl(&seeds, CrawlOptions::default()).await.unwrap();
        assert_eq!(again.fetched, 1);
        leaf.assert_hits_async(1).await;

        assert!(pipeline.clear_dedup().unwrap() >= 2);
        assert_eq!(pipeline.stats().dedup_estimate, 0);
        let fresh = pipeline.crawl(&seeds, CrawlOptions::default()).await.unwrap();
        assert_eq!(fresh.fetched, 2);
        leaf.assert_hits_async(2).await;
    }

    #[test]
    fn test_clear_frontier_drops_queued_urls() {
        let pipeline = Pipeline::temporary(config()).unwrap();
        pipeline.frontier().enqueue("https://example.com/a", 1.0, 0).unwrap();
        pipeline.frontier().enqueue("https://example.com/b", 0.5, 0).unwrap();
        assert_eq!(pipeline.stats().frontier_pending, 2);

        assert_eq!(pipeline.clear_frontier().unwrap(), 2);
        let stats = pipeline.stats();
        assert_eq!(stats.frontier_pending, 0);
        assert_eq!(stats.frontier_inflight, 0);
    }

    #[tokio::test]
    async fn test_drain_gives_up_after_timeout() {
        let server = MockServer::start_async().await;
        serve_site(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/a");
                then.status(200).header("content-type", "text/html").body("<p>leaf</p>");
            })
            .await;

        let mut config = config();
        config.queue.drain_timeout_secs = 1;
        let pipeline = Pipeline::temporary(config).unwrap();

        // a delivery held by a stalled consumer stays unacked
        pipeline
            .queue()
            .publish(&PageEvent::Fetched(raw_page("https://stalled.example/", "held")))
            .await
            .unwrap();
        let held = pipeline
            .queue()
            .consume(std::time::Duration::from_secs(600))
            .await
            .unwrap();
        assert!(held.is_some());

        let summary = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            pipeline.crawl(&[server.url("/")], CrawlOptions::default()),
        )
        .await
        .expect("crawl should stop waiting for the stalled delivery")
        .unwrap();
        assert_eq!(summary.fetched, 2);
        assert!(summary.took_ms >= 1000);
        assert_eq!(pipeline.queue().unacked_len(), 1);
    }

    #[test]
    fn test_word_tokenizer_highlights_exact_words_only() {
        let mut config = config();
        config.index.tokenizer = TokenizerKind::Word;
        let pipeline = Pipeline::temporary(config).unwrap();
        assert_eq!(pipeline.tokenizer().name(), "word");

        let page = raw_page(
            "https://yard.example/",
            "The gardens bloom in May. Gardening tips for spring planting.",
        );
        pipeline.indexer().process(&PageEvent::Fetched(page)).unwrap();

        let response = pipeline.search("gardening", 1, 10).unwrap();
        assert_eq!(response.total, 1);
        let snippet = &response.results[0].snippet;
        assert!(snippet.contains("<mark>Gardening</mark>"), "snippet: {}", snippet);
        assert!(!snippet.contains("<mark>gardens</mark>"), "snippet: {}", snippet);
    }

    #[test]
    fn test_analyzer_tokenizer_is_default() {
        let pipeline = Pipeline::temporary(config()).unwrap();
        assert_eq!(pipeline.tokenizer().name(), "analyzer");
    }
}
