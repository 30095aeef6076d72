//! Relational store for page metadata, the link graph, crawl jobs,
//! rank scores and the query log.
//!
//! Uses the sled embedded database. Each record family lives in its own tree;
//! the frontier and hand-off queue open further trees on the same `sled::Db`.

mod cache;

pub use cache::{KvCache, MemoryCache, SledCache};

use crate::types::{
    CrawlJob, JobCounter, JobStatus, LinkEdge, PageId, PageRecord, PageStatus, QueryLogEntry,
    RankScore,
};
use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};
use uuid::Uuid;

const RANK_GENERATION_KEY: &[u8] = b"ranks.current";
const RANK_SUMMARY_KEY: &[u8] = b"ranks.summary";

/// Summary of the rank generation currently visible to readers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankSummary {
    pub generation: u64,
    pub pages: usize,
    pub iterations: usize,
    pub converged: bool,
    pub max_score: f64,
    pub computed_at: chrono::DateTime<Utc>,
}

/// sled-backed relational store
pub struct Store {
    db: sled::Db,
    pages: sled::Tree,
    bodies: sled::Tree,
    links: sled::Tree,
    jobs: sled::Tree,
    meta: sled::Tree,
    query_log: sled::Tree,
    /// Rank tree for the current generation; swapped whole on recompute
    ranks: RwLock<sled::Tree>,
}

impl Store {
    /// Open or create the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path)
            .with_context(|| format!("Failed to open store at {:?}", path))?;
        Self::from_db(db)
    }

    /// In-memory store removed on drop (tests and one-shot commands)
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .context("Failed to open temporary store")?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let pages = db.open_tree("pages").context("Failed to open pages tree")?;
        let bodies = db.open_tree("bodies").context("Failed to open bodies tree")?;
        let links = db.open_tree("links").context("Failed to open links tree")?;
        let jobs = db.open_tree("jobs").context("Failed to open jobs tree")?;
        let meta = db.open_tree("meta").context("Failed to open meta tree")?;
        let query_log = db
            .open_tree("query_log")
            .context("Failed to open query log tree")?;

        let generation = read_generation(&meta)?;
        let ranks = db
            .open_tree(rank_tree_name(generation))
            .context("Failed to open rank tree")?;

        Ok(Self {
            db,
            pages,
            bodies,
            links,
            jobs,
            meta,
            query_log,
            ranks: RwLock::new(ranks),
        })
    }

    /// Underlying database, shared with the frontier and queue
    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    /// Flush buffered writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush().context("Failed to flush store")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pages
    // ------------------------------------------------------------------

    /// Insert or overwrite a page record (identity is the key)
    pub fn upsert_page(&self, record: &PageRecord) -> Result<()> {
        let data = bincode::serialize(record)
            .with_context(|| format!("Failed to serialize page {}", record.id))?;
        self.pages
            .insert(record.id.as_str().as_bytes(), data)
            .with_context(|| format!("Failed to store page {}", record.id))?;
        Ok(())
    }

    /// Get a page by identity
    pub fn get_page(&self, id: &PageId) -> Option<PageRecord> {
        match self.pages.get(id.as_str().as_bytes()) {
            Ok(Some(data)) => match bincode::deserialize(&data) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Failed to deserialize page {}: {}", id, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read page {}: {}", id, e);
                None
            }
        }
    }

    /// Get a page by canonical URL
    pub fn get_page_by_url(&self, url: &str) -> Option<PageRecord> {
        self.get_page(&PageId::from_url(url))
    }

    /// Iterate over all page records
    pub fn pages_iter(&self) -> impl Iterator<Item = PageRecord> + '_ {
        self.pages
            .iter()
            .filter_map(|r| r.ok())
            .filter_map(|(_, v)| bincode::deserialize(&v).ok())
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Count pages per status
    pub fn page_counts(&self) -> HashMap<PageStatus, usize> {
        let mut counts = HashMap::new();
        for record in self.pages_iter() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        counts
    }

    /// Store the extracted body text used for re-indexing without re-crawling
    pub fn put_body(&self, id: &PageId, text: &str) -> Result<()> {
        self.bodies
            .insert(id.as_str().as_bytes(), text.as_bytes())
            .with_context(|| format!("Failed to store body for {}", id))?;
        Ok(())
    }

    pub fn body(&self, id: &PageId) -> Option<String> {
        self.bodies
            .get(id.as_str().as_bytes())
            .ok()
            .flatten()
            .and_then(|data| String::from_utf8(data.to_vec()).ok())
    }

    // ------------------------------------------------------------------
    // Link graph
    // ------------------------------------------------------------------

    /// Insert a link unless the (source, target) pair already exists.
    ///
    /// Returns true if the edge was new.
    pub fn insert_link(&self, edge: &LinkEdge) -> Result<bool> {
        let key = link_key(&edge.source, &edge.target);
        let data = bincode::serialize(edge).context("Failed to serialize link")?;
        let swapped = self
            .links
            .compare_and_swap(key, None as Option<&[u8]>, Some(data))
            .with_context(|| format!("Failed to store link {} -> {}", edge.source, edge.target))?;
        Ok(swapped.is_ok())
    }

    /// Outgoing links of a page
    pub fn outlinks(&self, source: &str) -> Vec<LinkEdge> {
        let mut prefix = source.as_bytes().to_vec();
        prefix.push(0);
        self.links
            .scan_prefix(prefix)
            .filter_map(|r| r.ok())
            .filter_map(|(_, v)| bincode::deserialize(&v).ok())
            .collect()
    }

    /// Iterate over the full edge list
    pub fn links_iter(&self) -> impl Iterator<Item = LinkEdge> + '_ {
        self.links
            .iter()
            .filter_map(|r| r.ok())
            .filter_map(|(_, v)| bincode::deserialize(&v).ok())
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    // ------------------------------------------------------------------
    // Crawl jobs
    // ------------------------------------------------------------------

    pub fn create_job(&self, job: &CrawlJob) -> Result<()> {
        let data = bincode::serialize(job).context("Failed to serialize crawl job")?;
        self.jobs
            .insert(job.id.as_bytes(), data)
            .with_context(|| format!("Failed to store crawl job {}", job.id))?;
        Ok(())
    }

    pub fn get_job(&self, id: Uuid) -> Option<CrawlJob> {
        self.jobs
            .get(id.as_bytes())
            .ok()
            .flatten()
            .and_then(|data| bincode::deserialize(&data).ok())
    }

    pub fn jobs(&self) -> Vec<CrawlJob> {
        let mut jobs: Vec<CrawlJob> = self
            .jobs
            .iter()
            .filter_map(|r| r.ok())
            .filter_map(|(_, v)| bincode::deserialize(&v).ok())
            .collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        jobs
    }

    /// Atomically increment one counter of a job
    pub fn bump_job(&self, id: Uuid, counter: JobCounter) -> Result<()> {
        self.update_job(id, |job| match counter {
            JobCounter::Crawled => job.pages_crawled += 1,
            JobCounter::Indexed => job.pages_indexed += 1,
            JobCounter::Error => job.error_count += 1,
        })
    }

    /// Mark a job finished
    pub fn finish_job(&self, id: Uuid, status: JobStatus) -> Result<()> {
        self.update_job(id, |job| {
            job.status = status;
            job.completed_at = Some(Utc::now());
        })
    }

    fn update_job(&self, id: Uuid, apply: impl Fn(&mut CrawlJob)) -> Result<()> {
        self.jobs
            .update_and_fetch(id.as_bytes(), |old| {
                let old = old?;
                match bincode::deserialize::<CrawlJob>(old) {
                    Ok(mut job) => {
                        apply(&mut job);
                        bincode::serialize(&job).ok().or_else(|| Some(old.to_vec()))
                    }
                    Err(e) => {
                        warn!("Failed to deserialize crawl job {}: {}", id, e);
                        Some(old.to_vec())
                    }
                }
            })
            .with_context(|| format!("Failed to update crawl job {}", id))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rank scores
    // ------------------------------------------------------------------

    /// Replace the full rank table.
    ///
    /// Scores are written into a fresh generation tree, then the generation
    /// pointer flips in one write, so readers see either the old or the new
    /// table in full and never a mix.
    pub fn replace_ranks(
        &self,
        scores: &[RankScore],
        iterations: usize,
        converged: bool,
    ) -> Result<RankSummary> {
        let previous = read_generation(&self.meta)?;
        let generation = previous + 1;
        let name = rank_tree_name(generation);
        let tree = self
            .db
            .open_tree(&name)
            .with_context(|| format!("Failed to open rank tree {}", name))?;
        tree.clear().context("Failed to clear rank tree")?;

        let mut batch = sled::Batch::default();
        let mut max_score = 0.0f64;
        for score in scores {
            let data = bincode::serialize(score)
                .with_context(|| format!("Failed to serialize rank for {}", score.page_id))?;
            batch.insert(score.page_id.as_str().as_bytes(), data);
            max_score = max_score.max(score.score);
        }
        tree.apply_batch(batch).context("Failed to write rank batch")?;
        tree.flush().context("Failed to flush rank tree")?;

        let summary = RankSummary {
            generation,
            pages: scores.len(),
            iterations,
            converged,
            max_score,
            computed_at: Utc::now(),
        };
        let summary_data = bincode::serialize(&summary).context("Failed to serialize rank summary")?;

        let mut meta_batch = sled::Batch::default();
        meta_batch.insert(RANK_GENERATION_KEY, generation.to_be_bytes().to_vec());
        meta_batch.insert(RANK_SUMMARY_KEY, summary_data);
        self.meta
            .apply_batch(meta_batch)
            .context("Failed to publish rank generation")?;

        *self.ranks.write() = tree;

        // Keep the previous generation for readers that already hold it
        if generation >= 2 {
            let stale = rank_tree_name(generation - 2);
            if let Err(e) = self.db.drop_tree(stale.as_bytes()) {
                warn!("Failed to drop stale rank tree {}: {}", stale, e);
            }
        }

        debug!("Published rank generation {} ({} pages)", generation, scores.len());
        Ok(summary)
    }

    /// Current rank score of a page
    pub fn rank(&self, id: &PageId) -> Option<RankScore> {
        let tree = self.ranks.read().clone();
        tree.get(id.as_str().as_bytes())
            .ok()
            .flatten()
            .and_then(|data| bincode::deserialize(&data).ok())
    }

    /// Rank scores for a batch of pages, read from one generation
    pub fn ranks_for(&self, ids: &[PageId]) -> HashMap<PageId, f64> {
        let tree = self.ranks.read().clone();
        ids.iter()
            .filter_map(|id| {
                let data = tree.get(id.as_str().as_bytes()).ok().flatten()?;
                let score: RankScore = bincode::deserialize(&data).ok()?;
                Some((id.clone(), score.score))
            })
            .collect()
    }

    /// All rank scores of the current generation
    pub fn all_ranks(&self) -> Vec<RankScore> {
        let tree = self.ranks.read().clone();
        tree.iter()
            .filter_map(|r| r.ok())
            .filter_map(|(_, v)| bincode::deserialize(&v).ok())
            .collect()
    }

    pub fn rank_summary(&self) -> Option<RankSummary> {
        self.meta
            .get(RANK_SUMMARY_KEY)
            .ok()
            .flatten()
            .and_then(|data| bincode::deserialize(&data).ok())
    }

    // ------------------------------------------------------------------
    // Query log
    // ------------------------------------------------------------------

    pub fn log_query(&self, entry: &QueryLogEntry) -> Result<()> {
        let seq = self.db.generate_id().context("Failed to generate query log id")?;
        let mut key = (entry.logged_at.timestamp_millis() as u64).to_be_bytes().to_vec();
        key.extend_from_slice(&seq.to_be_bytes());
        let data = bincode::serialize(entry).context("Failed to serialize query log entry")?;
        self.query_log
            .insert(key, data)
            .context("Failed to write query log entry")?;
        Ok(())
    }

    /// Most recent query log entries, newest first
    pub fn recent_queries(&self, limit: usize) -> Vec<QueryLogEntry> {
        self.query_log
            .iter()
            .rev()
            .filter_map(|r| r.ok())
            .filter_map(|(_, v)| bincode::deserialize(&v).ok())
            .take(limit)
            .collect()
    }

    pub fn query_count(&self) -> usize {
        self.query_log.len()
    }
}

fn link_key(source: &str, target: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(source.len() + target.len() + 1);
    key.extend_from_slice(source.as_bytes());
    key.push(0);
    key.extend_from_slice(target.as_bytes());
    key
}

fn rank_tree_name(generation: u64) -> String {
    format!("ranks.{}", generation)
}

fn read_generation(meta: &sled::Tree) -> Result<u64> {
    let value = meta
        .get(RANK_GENERATION_KEY)
        .context("Failed to read rank generation")?;
    Ok(value
        .and_then(|v| <[u8; 8]>::try_from(v.as_ref()).ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0))
}
