//! Indexer: consumes page events from the hand-off queue
//!
//! Write order for a fetched page:
//! 1. page record (status `crawled`), body text and link edges in the store
//! 2. the inverted index document
//! 3. page record promoted to `indexed`
//!
//! A failure in step 2 leaves an authoritative `crawled` record behind that
//! `reindex_from_store` can repair without a re-crawl. Every step is an
//! upsert keyed by page id, so redelivered events are harmless.

use super::inverted::{IndexDocument, InvertedIndex};
use super::stats::TermStats;
use super::tokenizer::TermTokenizer;
use crate::config::{IndexConfig, QueueConfig};
use crate::content::strip_markup;
use crate::queue::{Delivery, HandoffQueue};
use crate::store::Store;
use crate::types::{
    FetchFailure, JobCounter, LinkEdge, PageEvent, PageId, PageRecord, PageStatus, RawPage,
};
use crate::util::cap_chars;
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What processing an event did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
    Indexed { id: PageId, new_links: usize },
    MarkedFailed { id: PageId },
    /// Event older than the stored state; nothing was written
    Stale { id: PageId },
}

pub struct Indexer {
    store: Arc<Store>,
    index: Arc<dyn InvertedIndex>,
    tokenizer: Arc<dyn TermTokenizer>,
    config: IndexConfig,
}

impl Indexer {
    pub fn new(
        store: Arc<Store>,
        index: Arc<dyn InvertedIndex>,
        tokenizer: Arc<dyn TermTokenizer>,
        config: IndexConfig,
    ) -> Self {
        Self {
            store,
            index,
            tokenizer,
            config,
        }
    }

    pub fn index(&self) -> &Arc<dyn InvertedIndex> {
        &self.index
    }

    /// Apply one event. Safe to call repeatedly with the same event.
    pub fn process(&self, event: &PageEvent) -> Result<IndexOutcome> {
        match event {
            PageEvent::Fetched(page) => self.index_page(page),
            PageEvent::Failed(failure) => self.mark_failed(failure),
        }
    }

    fn index_page(&self, page: &RawPage) -> Result<IndexOutcome> {
        let id = PageId::from_url(&page.url);
        let title = cap_chars(&strip_markup(&page.title), self.config.max_title_chars);
        let description = cap_chars(
            &strip_markup(&page.description),
            self.config.max_description_chars,
        );
        let body = cap_chars(&strip_markup(&page.text), self.config.max_body_chars);

        let terms = self.tokenizer.tokenize(&body);
        let stats = TermStats::from_terms(&terms);
        debug!(
            "{}: {} terms, {} unique, top {:?}",
            page.url,
            stats.total_terms,
            stats.unique_terms(),
            stats.top_terms(5)
        );

        let existing = self.store.get_page(&id);
        let replay = existing
            .as_ref()
            .map(|r| r.status == PageStatus::Indexed && r.crawled_at == Some(page.fetched_at))
            .unwrap_or(false);

        // an older fetch delivered late never replaces a newer one
        if let Some(current) = existing.as_ref() {
            let newer = current.crawled_at.map_or(false, |at| at > page.fetched_at);
            if current.status == PageStatus::Indexed && newer {
                debug!("Skipping stale fetch of {} from {}", page.url, page.fetched_at);
                self.bump(page.job_id, JobCounter::Indexed);
                return Ok(IndexOutcome::Indexed { id, new_links: 0 });
            }
            let failed_later = current.failed_at.map_or(false, |at| at > page.fetched_at);
            if current.status == PageStatus::Failed && failed_later {
                debug!("Skipping fetch of {} older than its last failure", page.url);
                return Ok(IndexOutcome::Stale { id });
            }
        }

        let mut record = existing.unwrap_or_else(|| PageRecord::pending(page.url.clone()));
        record.title = title.clone();
        record.description = description.clone();
        record.crawled_at = Some(page.fetched_at);
        record.worker_id = page.worker_id.clone();
        record.http_status = Some(page.http_status);
        record.content_length = page.content_length;
        record.word_count = stats.total_terms as u64;
        record.failure_reason = None;
        record.failed_at = None;
        record.attempts = page.attempts;
        record.job_id = page.job_id.or(record.job_id);
        if record.status != PageStatus::Indexed {
            record.status = PageStatus::Crawled;
        }

        self.store.upsert_page(&record)?;
        self.store.put_body(&id, &body)?;

        let mut new_links = 0;
        for link in &page.links {
            let edge = LinkEdge {
                source: page.url.clone(),
                target: link.url.clone(),
                anchor: link.anchor.clone(),
            };
            if self.store.insert_link(&edge)? {
                new_links += 1;
            }
        }

        self.index
            .upsert(&IndexDocument {
                id: id.clone(),
                url: page.url.clone(),
                title,
                description,
                body,
                crawled_at: Some(page.fetched_at),
            })
            .with_context(|| format!("Failed to index {}", page.url))?;

        record.status = PageStatus::Indexed;
        record.indexed_at = Some(Utc::now());
        self.store.upsert_page(&record)?;

        if !replay {
            self.bump(page.job_id, JobCounter::Indexed);
        }
        debug!("Indexed {} ({} new links)", page.url, new_links);
        Ok(IndexOutcome::Indexed { id, new_links })
    }

    fn mark_failed(&self, failure: &FetchFailure) -> Result<IndexOutcome> {
        let id = PageId::from_url(&failure.url);
        let existing = self.store.get_page(&id);
        let replay = existing
            .as_ref()
            .map(|r| {
                r.status == PageStatus::Failed
                    && r.failure_reason.as_deref() == Some(failure.reason.as_str())
                    && r.attempts == failure.attempts
            })
            .unwrap_or(false);

        // a failure older than the indexed fetch leaves the page searchable
        if let Some(current) = existing.as_ref() {
            let fetched_since = current.crawled_at.map_or(false, |at| at >= failure.failed_at);
            if current.status == PageStatus::Indexed && fetched_since {
                debug!(
                    "Ignoring failure of {} at {}, indexed copy is newer",
                    failure.url, failure.failed_at
                );
                return Ok(IndexOutcome::Stale { id });
            }
        }

        let mut record = existing.unwrap_or_else(|| PageRecord::pending(failure.url.clone()));
        record.status = PageStatus::Failed;
        record.failure_reason = Some(failure.reason.clone());
        record.failed_at = Some(failure.failed_at);
        record.http_status = failure.http_status.or(record.http_status);
        record.attempts = failure.attempts;
        record.worker_id = failure.worker_id.clone();
        record.job_id = failure.job_id.or(record.job_id);
        self.store.upsert_page(&record)?;

        if let Err(e) = self.index.delete(&id) {
            warn!("Failed to remove {} from index: {}", failure.url, e);
        }
        if !replay {
            self.bump(failure.job_id, JobCounter::Error);
        }
        debug!("Marked {} failed: {}", failure.url, failure.reason);
        Ok(IndexOutcome::MarkedFailed { id })
    }

    fn bump(&self, job_id: Option<Uuid>, counter: JobCounter) {
        if let Some(job_id) = job_id {
            if let Err(e) = self.store.bump_job(job_id, counter) {
                warn!("Failed to update job {}: {}", job_id, e);
            }
        }
    }

    /// Re-upsert the index document of a stored page from relational state.
    ///
    /// Returns false when the page is unknown or failed.
    pub fn reindex_from_store(&self, id: &PageId) -> Result<bool> {
        let Some(mut record) = self.store.get_page(id) else {
            return Ok(false);
        };
        if matches!(record.status, PageStatus::Failed | PageStatus::Pending) {
            return Ok(false);
        }
        let body = self.store.body(id).unwrap_or_default();

        self.index.upsert(&IndexDocument {
            id: id.clone(),
            url: record.url.clone(),
            title: record.title.clone(),
            description: record.description.clone(),
            body,
            crawled_at: record.crawled_at,
        })?;

        if record.status != PageStatus::Indexed {
            record.status = PageStatus::Indexed;
            record.indexed_at = Some(Utc::now());
            self.store.upsert_page(&record)?;
        }
        Ok(true)
    }

    /// Repair every page left in `crawled` by an earlier index failure
    pub fn reindex_crawled(&self) -> Result<usize> {
        let stuck: Vec<PageId> = self
            .store
            .pages_iter()
            .filter(|p| p.status == PageStatus::Crawled)
            .map(|p| p.id)
            .collect();

        let mut repaired = 0;
        for id in stuck {
            match self.reindex_from_store(&id) {
                Ok(true) => repaired += 1,
                Ok(false) => {}
                Err(e) => warn!("Reindex of {} failed: {}", id, e),
            }
        }
        if repaired > 0 {
            info!("Reindexed {} pages from the store", repaired);
        }
        Ok(repaired)
    }
}

/// Queue consumer loop around an `Indexer`
pub struct IndexerWorker {
    indexer: Arc<Indexer>,
    queue: Arc<dyn HandoffQueue>,
    visibility: Duration,
    poll_interval: Duration,
}

impl IndexerWorker {
    pub fn new(indexer: Arc<Indexer>, queue: Arc<dyn HandoffQueue>, config: &QueueConfig) -> Self {
        Self {
            indexer,
            queue,
            visibility: config.visibility_timeout(),
            poll_interval: config.poll_interval(),
        }
    }

    /// Consume until shutdown. Returns the number of acknowledged messages.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> u64 {
        let mut handled = 0;
        loop {
            match shutdown.try_recv() {
                Err(broadcast::error::TryRecvError::Empty) => {}
                _ => break,
            }

            match self.queue.consume(self.visibility).await {
                Ok(Some(delivery)) => {
                    if self.handle(delivery).await {
                        handled += 1;
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.queue.wait(self.poll_interval) => {}
                        _ = shutdown.recv() => break,
                    }
                }
                Err(e) => {
                    error!("Queue consume failed: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.recv() => break,
                    }
                }
            }
        }
        handled
    }

    /// Process one delivery; true when it was acknowledged
    async fn handle(&self, delivery: Delivery) -> bool {
        let event = match delivery.event() {
            Ok(event) => event,
            Err(e) => {
                warn!("Rejecting unparseable message {}: {}", delivery.id, e);
                if let Err(e) = self.queue.nack(&delivery, false).await {
                    error!("Failed to reject message {}: {}", delivery.id, e);
                }
                return false;
            }
        };

        let indexer = self.indexer.clone();
        let task = tokio::task::spawn_blocking(move || indexer.process(&event));
        let result = match tokio::time::timeout(self.visibility, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(anyhow::anyhow!("Index task panicked: {}", e)),
            Err(_) => Err(anyhow::anyhow!("Index task timed out after {:?}", self.visibility)),
        };

        match result {
            Ok(_) => {
                if let Err(e) = self.queue.ack(&delivery).await {
                    error!("Failed to ack message {}: {}", delivery.id, e);
                    return false;
                }
                true
            }
            Err(e) => {
                warn!(
                    "Indexing message {} failed (delivery {}): {:#}",
                    delivery.id, delivery.deliveries, e
                );
                if let Err(e) = self.queue.nack(&delivery, true).await {
                    error!("Failed to nack message {}: {}", delivery.id, e);
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{AnalyzerTokenizer, QueryMatches, TantivyIndex};
    use crate::queue::SledQueue;
    use crate::types::{CrawlJob, FailureKind, OutLink};

    struct FailingIndex;

    impl InvertedIndex for FailingIndex {
        fn upsert(&self, _doc: &IndexDocument) -> Result<()> {
            anyhow::bail!("index offline")
        }
        fn query_counted(&self, _text: &str, _limit: usize) -> Result<QueryMatches> {
            Ok(QueryMatches::default())
        }
        fn delete(&self, _id: &PageId) -> Result<()> {
            Ok(())
        }
        fn len(&self) -> usize {
            0
        }
    }

    fn indexer_with(store: Arc<Store>, index: Arc<dyn InvertedIndex>) -> Indexer {
        Indexer::new(
            store,
            index,
            Arc::new(AnalyzerTokenizer::english(true, 3)),
            IndexConfig::default(),
        )
    }

    fn setup() -> (Arc<Store>, Arc<TantivyIndex>, Indexer) {
        let store = Arc::new(Store::temporary().unwrap());
        let index = Arc::new(TantivyIndex::in_memory(true, 20_000_000).unwrap());
        let indexer = indexer_with(store.clone(), index.clone());
        (store, index, indexer)
    }

    fn page(url: &str, title: &str, links: &[&str]) -> RawPage {
        RawPage {
            url: url.to_string(),
            http_status: 200,
            content_type: "text/html".to_string(),
            content_length: 100,
            title: title.to_string(),
            description: "A page about crawling".to_string(),
            text: "Crawlers fetch pages and follow links politely".to_string(),
            links: links
                .iter()
                .map(|l| OutLink {
                    url: l.to_string(),
                    anchor: "link".to_string(),
                })
                .collect(),
            fetched_at: Utc::now(),
            depth: 0,
            attempts: 1,
            job_id: None,
            worker_id: "w-0".to_string(),
        }
    }

    fn failure(url: &str) -> FetchFailure {
        FetchFailure {
            url: url.to_string(),
            reason: "Timeout after 1s".to_string(),
            kind: FailureKind::Transient,
            http_status: None,
            attempts: 3,
            failed_at: Utc::now(),
            job_id: None,
            worker_id: "w-1".to_string(),
        }
    }

    #[test]
    fn test_index_page_writes_record_links_and_document() {
        let (store, index, indexer) = setup();
        let event = PageEvent::Fetched(page(
            "https://a.com/",
            "Crawling Guide",
            &["https://a.com/x", "https://b.com/"],
        ));

        let outcome = indexer.process(&event).unwrap();
        let id = PageId::from_url("https://a.com/");
        assert_eq!(outcome, IndexOutcome::Indexed { id: id.clone(), new_links: 2 });

        let record = store.get_page(&id).unwrap();
        assert_eq!(record.status, PageStatus::Indexed);
        assert!(record.indexed_at.is_some());
        assert_eq!(record.title, "Crawling Guide");
        assert_eq!(record.worker_id, "w-0");
        assert!(record.word_count > 0);
        assert_eq!(store.link_count(), 2);
        assert_eq!(index.query("crawler", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let (store, index, indexer) = setup();
        let job = CrawlJob::start("https://a.com/");
        store.create_job(&job).unwrap();
        let mut raw = page("https://a.com/", "Title", &["https://a.com/x"]);
        raw.job_id = Some(job.id);
        let event = PageEvent::Fetched(raw);

        indexer.process(&event).unwrap();
        let second = indexer.process(&event).unwrap();

        assert!(matches!(second, IndexOutcome::Indexed { new_links: 0, .. }));
        assert_eq!(store.page_count(), 1);
        assert_eq!(store.link_count(), 1);
        assert_eq!(index.len(), 1);
        assert_eq!(store.get_job(job.id).unwrap().pages_indexed, 1);
    }

    #[test]
    fn test_latest_title_wins() {
        let (store, index, indexer) = setup();
        indexer
            .process(&PageEvent::Fetched(page("https://a.com/", "First title", &[])))
            .unwrap();
        indexer
            .process(&PageEvent::Fetched(page("https://a.com/", "Second title", &[])))
            .unwrap();

        let record = store.get_page(&PageId::from_url("https://a.com/")).unwrap();
        assert_eq!(record.title, "Second title");
        let hits = index.query("crawling", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Second title");
    }

    #[test]
    fn test_stale_event_does_not_overwrite_newer_fetch() {
        let (store, index, indexer) = setup();
        let newer = page("https://a.com/", "Newer title", &[]);
        let mut older = page("https://a.com/", "Older title", &[]);
        older.fetched_at = newer.fetched_at - chrono::Duration::minutes(10);

        indexer.process(&PageEvent::Fetched(newer)).unwrap();
        indexer.process(&PageEvent::Fetched(older)).unwrap();

        let record = store.get_page(&PageId::from_url("https://a.com/")).unwrap();
        assert_eq!(record.title, "Newer title");
        assert_eq!(index.query("crawling", 10).unwrap()[0].title, "Newer title");
    }

    #[test]
    fn test_failure_older_than_indexed_fetch_is_ignored() {
        let (store, index, indexer) = setup();
        let fetched = page("https://a.com/", "Still good", &[]);
        let mut late = failure("https://a.com/");
        late.failed_at = fetched.fetched_at - chrono::Duration::minutes(10);

        indexer.process(&PageEvent::Fetched(fetched)).unwrap();
        let outcome = indexer.process(&PageEvent::Failed(late)).unwrap();

        let id = PageId::from_url("https://a.com/");
        assert_eq!(outcome, IndexOutcome::Stale { id: id.clone() });
        let record = store.get_page(&id).unwrap();
        assert_eq!(record.status, PageStatus::Indexed);
        assert!(record.failure_reason.is_none());
        assert_eq!(index.query("crawling", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_fetch_older_than_failure_does_not_revive_page() {
        let (store, index, indexer) = setup();
        let failed = failure("https://a.com/");
        let mut late = page("https://a.com/", "Outdated", &[]);
        late.fetched_at = failed.failed_at - chrono::Duration::minutes(10);

        indexer.process(&PageEvent::Failed(failed.clone())).unwrap();
        let outcome = indexer.process(&PageEvent::Fetched(late)).unwrap();

        assert!(matches!(outcome, IndexOutcome::Stale { .. }));
        let record = store.get_page(&PageId::from_url("https://a.com/")).unwrap();
        assert_eq!(record.status, PageStatus::Failed);
        assert_eq!(record.failed_at, Some(failed.failed_at));
        assert!(index.is_empty());

        let recovered = page("https://a.com/", "Back online", &[]);
        indexer.process(&PageEvent::Fetched(recovered)).unwrap();
        let record = store.get_page(&PageId::from_url("https://a.com/")).unwrap();
        assert_eq!(record.status, PageStatus::Indexed);
        assert!(record.failed_at.is_none());
    }

    #[test]
    fn test_markup_is_stripped_and_fields_capped() {
        let store = Arc::new(Store::temporary().unwrap());
        let index = Arc::new(TantivyIndex::in_memory(true, 20_000_000).unwrap());
        let indexer = Indexer::new(
            store.clone(),
            index,
            Arc::new(AnalyzerTokenizer::english(true, 3)),
            IndexConfig {
                max_title_chars: 5,
                ..IndexConfig::default()
            },
        );
        indexer
            .process(&PageEvent::Fetched(page("https://a.com/", "<b>Bold</b> heading", &[])))
            .unwrap();
        let record = store.get_page(&PageId::from_url("https://a.com/")).unwrap();
        assert_eq!(record.title, "Bold ");
    }

    #[test]
    fn test_failure_marks_page_failed_and_removes_document() {
        let (store, index, indexer) = setup();
        let job = CrawlJob::start("https://a.com/");
        store.create_job(&job).unwrap();
        indexer
            .process(&PageEvent::Fetched(page("https://a.com/", "Was fine", &[])))
            .unwrap();

        let mut f = failure("https://a.com/");
        f.job_id = Some(job.id);
        let outcome = indexer.process(&PageEvent::Failed(f.clone())).unwrap();
        indexer.process(&PageEvent::Failed(f)).unwrap();

        assert!(matches!(outcome, IndexOutcome::MarkedFailed { .. }));
        let record = store.get_page(&PageId::from_url("https://a.com/")).unwrap();
        assert_eq!(record.status, PageStatus::Failed);
        assert_eq!(record.failure_reason.as_deref(), Some("Timeout after 1s"));
        assert_eq!(record.attempts, 3);
        assert!(index.is_empty());
        assert_eq!(store.get_job(job.id).unwrap().error_count, 1);
    }

    #[test]
    fn test_index_failure_keeps_relational_write_and_reindex_repairs() {
        let store = Arc::new(Store::temporary().unwrap());
        let broken = indexer_with(store.clone(), Arc::new(FailingIndex));
        let event = PageEvent::Fetched(page("https://a.com/", "Repairable", &["https://b.com/"]));

        assert!(broken.process(&event).is_err());
        let id = PageId::from_url("https://a.com/");
        assert_eq!(store.get_page(&id).unwrap().status, PageStatus::Crawled);
        assert_eq!(store.link_count(), 1);

        let index = Arc::new(TantivyIndex::in_memory(true, 20_000_000).unwrap());
        let healthy = indexer_with(store.clone(), index.clone());
        assert_eq!(healthy.reindex_crawled().unwrap(), 1);
        assert_eq!(store.get_page(&id).unwrap().status, PageStatus::Indexed);
        assert_eq!(index.query("crawlers", 10).unwrap()[0].title, "Repairable");
    }

    #[tokio::test]
    async fn test_worker_acks_and_dead_letters_poison() {
        let store = Arc::new(Store::temporary().unwrap());
        let queue = Arc::new(SledQueue::open(store.db(), 2).unwrap());
        let index = Arc::new(TantivyIndex::in_memory(true, 20_000_000).unwrap());
        let good = Arc::new(indexer_with(store.clone(), index));

        queue
            .publish(&PageEvent::Fetched(page("https://a.com/", "Good", &[])))
            .await
            .unwrap();

        let config = QueueConfig {
            poll_interval_ms: 10,
            ..QueueConfig::default()
        };
        let worker = IndexerWorker::new(good, queue.clone(), &config);
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move { worker.run(rx).await });

        for _ in 0..200 {
            if queue.is_empty() && queue.unacked_len() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(()).unwrap();
        assert_eq!(handle.await.unwrap(), 1);
        assert_eq!(
            store.get_page(&PageId::from_url("https://a.com/")).unwrap().status,
            PageStatus::Indexed
        );

        // an indexer whose backend is down: redelivered until dead-lettered
        let broken = Arc::new(indexer_with(store.clone(), Arc::new(FailingIndex)));
        queue
            .publish(&PageEvent::Fetched(page("https://b.com/", "Poison", &[])))
            .await
            .unwrap();
        let worker = IndexerWorker::new(broken, queue.clone(), &config);
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move { worker.run(rx).await });

        for _ in 0..200 {
            if queue.dead_letter_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(()).unwrap();
        assert_eq!(handle.await.unwrap(), 0);
        assert_eq!(queue.dead_letter_count(), 1);
        assert!(queue.is_empty());
    }
}
