//! Hybrid query scorer with a result cache in front

use super::snippet::build_snippet;
use crate::config::{HybridFormula, SearchConfig};
use crate::index::{IndexHit, InvertedIndex, TermTokenizer};
use crate::store::{KvCache, Store};
use crate::types::{PageId, QueryLogEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Query must not be empty")]
    EmptyQuery,
    #[error("Page must be between 1 and {max}, got {page}")]
    InvalidPage { page: usize, max: usize },
    #[error("Size must be between 1 and {max}, got {size}")]
    InvalidSize { size: usize, max: usize },
    #[error("Search backend error: {0:#}")]
    Backend(#[from] anyhow::Error),
}

impl SearchError {
    /// Caller error rather than a server fault
    pub fn is_validation(&self) -> bool {
        !matches!(self, SearchError::Backend(_))
    }
}

/// One ranked result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub page_id: PageId,
    pub url: String,
    pub title: String,
    pub description: String,
    /// Body excerpt with `<mark>` highlighted query terms
    pub snippet: String,
    /// Native BM25 relevance
    pub relevance: f64,
    /// PageRank, or the floor for unranked pages
    pub rank: f64,
    /// Hybrid score used for ordering
    pub score: f64,
    pub crawled_at: Option<DateTime<Utc>>,
}

/// One page of results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: String,
    pub page: usize,
    pub size: usize,
    pub results: Vec<SearchResult>,
    /// Every document the query matched in the index
    pub total: usize,
    /// Matches that were scored and can be paged through, at most the
    /// candidate limit
    #[serde(default)]
    pub candidates: usize,
    /// Pages over `candidates`
    pub total_pages: usize,
    pub has_next: bool,
    pub has_prev: bool,
    pub took_ms: u64,
    pub cached: bool,
}

/// Trim, lowercase and collapse whitespace
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Result cache key: hex SHA-256 of `normalized:page:size`
pub fn cache_key(normalized: &str, page: usize, size: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}:{}", normalized, page, size).as_bytes());
    hex::encode(hasher.finalize())
}

struct Scored {
    hit: IndexHit,
    rank: f64,
    score: f64,
}

pub struct QueryScorer {
    index: Arc<dyn InvertedIndex>,
    store: Arc<Store>,
    cache: Arc<dyn KvCache>,
    tokenizer: Arc<dyn TermTokenizer>,
    config: SearchConfig,
}

impl QueryScorer {
    pub fn new(
        index: Arc<dyn InvertedIndex>,
        store: Arc<Store>,
        cache: Arc<dyn KvCache>,
        tokenizer: Arc<dyn TermTokenizer>,
        config: SearchConfig,
    ) -> Self {
        Self {
            index,
            store,
            cache,
            tokenizer,
            config,
        }
    }

    pub fn search(&self, query: &str, page: usize, size: usize) -> Result<SearchResponse, SearchError> {
        let started = Instant::now();
        let normalized = normalize_query(query);
        if normalized.is_empty() {
            return Err(SearchError::EmptyQuery);
        }
        if page < 1 || page > self.config.max_page {
            return Err(SearchError::InvalidPage {
                page,
                max: self.config.max_page,
            });
        }
        if size < 1 || size > self.config.max_size {
            return Err(SearchError::InvalidSize {
                size,
                max: self.config.max_size,
            });
        }

        let key = cache_key(&normalized, page, size);
        if let Some(mut cached) = self.cached(&key) {
            cached.cached = true;
            cached.took_ms = started.elapsed().as_millis() as u64;
            self.log(&normalized, cached.total, cached.took_ms, true);
            debug!("Query '{}' served from cache", normalized);
            return Ok(cached);
        }

        let matches = self.index.query_counted(&normalized, self.config.candidate_limit)?;
        let total = matches.total.max(matches.hits.len());
        let mut scored = self.score(matches.hits);
        scored.sort_by(compare_scored);

        let candidates = scored.len();
        let total_pages = candidates.div_ceil(size);
        let start = (page - 1) * size;
        let query_terms: HashSet<String> = self.tokenizer.tokenize(&normalized).into_iter().collect();

        let results: Vec<SearchResult> = scored
            .into_iter()
            .skip(start)
            .take(size)
            .map(|s| {
                let body = self.store.body(&s.hit.id).unwrap_or_default();
                let snippet = build_snippet(
                    self.tokenizer.as_ref(),
                    &query_terms,
                    &body,
                    &s.hit.description,
                    self.config.snippet_chars,
                );
                SearchResult {
                    page_id: s.hit.id,
                    url: s.hit.url,
                    title: s.hit.title,
                    description: s.hit.description,
                    snippet,
                    relevance: s.hit.score as f64,
                    rank: s.rank,
                    score: s.score,
                    crawled_at: s.hit.crawled_at,
                }
            })
            .collect();

        let mut response = SearchResponse {
            query: normalized.clone(),
            page,
            size,
            results,
            total,
            candidates,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1,
            took_ms: 0,
            cached: false,
        };

        match serde_json::to_vec(&response) {
            Ok(data) => {
                if let Err(e) = self.cache.set(&key, &data, Some(self.config.cache_ttl())) {
                    warn!("Failed to cache results for '{}': {}", normalized, e);
                }
            }
            Err(e) => warn!("Failed to encode results for '{}': {}", normalized, e),
        }

        response.took_ms = started.elapsed().as_millis() as u64;
        self.log(&normalized, total, response.took_ms, false);
        debug!(
            "Query '{}': {} results, page {}/{}, {}ms",
            normalized, total, page, total_pages, response.took_ms
        );
        Ok(response)
    }

    fn cached(&self, key: &str) -> Option<SearchResponse> {
        match self.cache.get(key) {
            Ok(Some(data)) => match serde_json::from_slice(&data) {
                Ok(response) => Some(response),
                Err(e) => {
                    warn!("Discarding undecodable cached results: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Result cache read failed: {}", e);
                None
            }
        }
    }

    /// Normalize both signals against the best candidate and combine them
    fn score(&self, hits: Vec<IndexHit>) -> Vec<Scored> {
        let ids: Vec<PageId> = hits.iter().map(|h| h.id.clone()).collect();
        let ranks = self.store.ranks_for(&ids);
        let floor = self.config.missing_rank_floor;

        let max_relevance = hits.iter().map(|h| h.score as f64).fold(0.0, f64::max);
        let with_rank: Vec<(IndexHit, f64)> = hits
            .into_iter()
            .map(|h| {
                let rank = ranks.get(&h.id).copied().unwrap_or(floor);
                (h, rank)
            })
            .collect();
        let max_rank = with_rank.iter().map(|(_, r)| *r).fold(0.0, f64::max);

        with_rank
            .into_iter()
            .map(|(hit, rank)| {
                let relevance = if max_relevance > 0.0 {
                    hit.score as f64 / max_relevance
                } else {
                    0.0
                };
                let authority = if max_rank > 0.0 { rank / max_rank } else { 0.0 };
                let score = match self.config.formula {
                    HybridFormula::WeightedSum => {
                        self.config.relevance_weight * relevance
                            + self.config.authority_weight * authority
                    }
                    HybridFormula::Multiplicative => {
                        relevance * (1.0 + self.config.authority_weight * authority)
                    }
                };
                Scored { hit, rank, score }
            })
            .collect()
    }

    fn log(&self, query: &str, result_count: usize, latency_ms: u64, cache_hit: bool) {
        let entry = QueryLogEntry {
            query: query.to_string(),
            result_count,
            latency_ms,
            cache_hit,
            logged_at: Utc::now(),
        };
        if let Err(e) = self.store.log_query(&entry) {
            warn!("Failed to log query: {}", e);
        }
    }
}

/// Hybrid score descending, newer crawl first on ties, then URL
fn compare_scored(a: &Scored, b: &Scored) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.hit.crawled_at.cmp(&a.hit.crawled_at))
        .then_with(|| a.hit.url.cmp(&b.hit.url))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{AnalyzerTokenizer, IndexDocument, TantivyIndex};
    use crate::store::MemoryCache;
    use crate::types::RankScore;
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        store: Arc<Store>,
        index: Arc<TantivyIndex>,
        cache: Arc<MemoryCache>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(Store::temporary().unwrap()),
                index: Arc::new(TantivyIndex::in_memory(true, 20_000_000).unwrap()),
                cache: Arc::new(MemoryCache::new(100)),
            }
        }

        fn add(&self, url: &str, title: &str, body: &str, crawled_at: DateTime<Utc>) -> PageId {
            let id = PageId::from_url(url);
            self.index
                .upsert(&IndexDocument {
                    id: id.clone(),
                    url: url.to_string(),
                    title: title.to_string(),
                    description: String::new(),
                    body: body.to_string(),
                    crawled_at: Some(crawled_at),
                })
                .unwrap();
            self.store.put_body(&id, body).unwrap();
            id
        }

        fn rank(&self, scores: &[(&PageId, f64)]) {
            let scores: Vec<RankScore> = scores
                .iter()
                .map(|(id, s)| RankScore {
                    page_id: (*id).clone(),
                    score: *s,
                    computed_at: Utc::now(),
                })
                .collect();
            self.store.replace_ranks(&scores, 1, true).unwrap();
        }

        fn scorer(&self, config: SearchConfig) -> QueryScorer {
            QueryScorer::new(
                self.index.clone(),
                self.store.clone(),
                self.cache.clone(),
                Arc::new(AnalyzerTokenizer::english(true, 3)),
                config,
            )
        }
    }

    #[test]
    fn test_normalize_and_cache_key() {
        assert_eq!(normalize_query("  Rust   CRAWLER \n"), "rust crawler");
        let a = cache_key("rust crawler", 1, 10);
        assert_eq!(a, cache_key("rust crawler", 1, 10));
        assert_ne!(a, cache_key("rust crawler", 2, 10));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_validation_errors() {
        let f = Fixture::new();
        let scorer = f.scorer(SearchConfig::default());
        assert!(matches!(scorer.search("   ", 1, 10), Err(SearchError::EmptyQuery)));
        assert!(matches!(scorer.search("rust", 0, 10), Err(SearchError::InvalidPage { .. })));
        assert!(matches!(scorer.search("rust", 101, 10), Err(SearchError::InvalidPage { .. })));
        assert!(matches!(scorer.search("rust", 1, 0), Err(SearchError::InvalidSize { .. })));
        assert!(matches!(scorer.search("rust", 1, 101), Err(SearchError::InvalidSize { .. })));
        assert!(SearchError::EmptyQuery.is_validation());
    }

    #[test]
    fn test_authority_breaks_equal_relevance() {
        let f = Fixture::new();
        let now = Utc::now();
        let low = f.add("https://low.com/", "Gardening", "gardening tips", now);
        let high = f.add("https://high.com/", "Gardening", "gardening tips", now);
        f.rank(&[(&low, 0.1), (&high, 0.9)]);

        let response = f.scorer(SearchConfig::default()).search("gardening", 1, 10).unwrap();
        assert_eq!(response.total, 2);
        assert_eq!(response.results[0].url, "https://high.com/");
        assert!((response.results[0].rank - 0.9).abs() < 1e-12);
        assert!((response.results[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_unranked_page_gets_floor() {
        let f = Fixture::new();
        let now = Utc::now();
        let ranked = f.add("https://ranked.com/", "Gardening", "gardening tips", now);
        f.add("https://unranked.com/", "Gardening", "gardening tips", now);
        f.rank(&[(&ranked, 0.5)]);

        let response = f.scorer(SearchConfig::default()).search("gardening", 1, 10).unwrap();
        assert_eq!(response.results[0].url, "https://ranked.com/");
        assert_eq!(response.results[1].rank, 0.0);
    }

    #[test]
    fn test_ties_go_to_recent_crawl() {
        let f = Fixture::new();
        let now = Utc::now();
        f.add("https://old.com/", "Gardening", "gardening tips", now - ChronoDuration::days(3));
        f.add("https://new.com/", "Gardening", "gardening tips", now);

        let response = f.scorer(SearchConfig::default()).search("gardening", 1, 10).unwrap();
        assert_eq!(response.results[0].url, "https://new.com/");
        assert_eq!(response.results[1].url, "https://old.com/");
    }

    #[test]
    fn test_multiplicative_formula() {
        let f = Fixture::new();
        let now = Utc::now();
        let a = f.add("https://a.com/", "Gardening", "gardening tips", now);
        f.rank(&[(&a, 1.0)]);
        let config = SearchConfig {
            formula: HybridFormula::Multiplicative,
            authority_weight: 0.5,
            ..SearchConfig::default()
        };
        let response = f.scorer(config).search("gardening", 1, 10).unwrap();
        assert!((response.results[0].score - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_pagination() {
        let f = Fixture::new();
        let now = Utc::now();
        for i in 0..5 {
            f.add(&format!("https://p{}.com/", i), "Gardening", "gardening tips", now);
        }
        let scorer = f.scorer(SearchConfig::default());

        let first = scorer.search("gardening", 1, 2).unwrap();
        assert_eq!(first.results.len(), 2);
        assert_eq!(first.total, 5);
        assert_eq!(first.total_pages, 3);
        assert!(first.has_next);
        assert!(!first.has_prev);

        let last = scorer.search("gardening", 3, 2).unwrap();
        assert_eq!(last.results.len(), 1);
        assert!(!last.has_next);
        assert!(last.has_prev);

        let beyond = scorer.search("gardening", 4, 2).unwrap();
        assert!(beyond.results.is_empty());
    }

    #[test]
    fn test_total_reports_matches_past_candidate_limit() {
        let f = Fixture::new();
        let now = Utc::now();
        for i in 0..3 {
            f.add(&format!("https://p{}.com/", i), "Gardening", "gardening tips", now);
        }
        let config = SearchConfig {
            candidate_limit: 2,
            ..SearchConfig::default()
        };

        let response = f.scorer(config).search("gardening", 1, 1).unwrap();
        assert_eq!(response.total, 3);
        assert_eq!(response.candidates, 2);
        assert_eq!(response.total_pages, 2);
        assert!(response.has_next);
    }

    #[test]
    fn test_second_query_is_cache_hit_with_same_order() {
        let f = Fixture::new();
        let now = Utc::now();
        for i in 0..4 {
            f.add(&format!("https://p{}.com/", i), "Gardening", "gardening tips", now);
        }
        let scorer = f.scorer(SearchConfig::default());

        let first = scorer.search("Gardening", 1, 10).unwrap();
        let second = scorer.search("  gardening ", 1, 10).unwrap();
        assert!(!first.cached);
        assert!(second.cached);
        let urls = |r: &SearchResponse| r.results.iter().map(|x| x.url.clone()).collect::<Vec<_>>();
        assert_eq!(urls(&first), urls(&second));

        let log = f.store.recent_queries(10);
        assert_eq!(log.len(), 2);
        assert!(log[0].cache_hit);
        assert!(!log[1].cache_hit);
    }

    #[test]
    fn test_snippet_highlights_terms() {
        let f = Fixture::new();
        f.add(
            "https://a.com/",
            "Garden",
            "Intro text. Gardening tips for spring planting. Footer.",
            Utc::now(),
        );
        let response = f.scorer(SearchConfig::default()).search("gardening", 1, 10).unwrap();
        assert_eq!(
            response.results[0].snippet,
            "<mark>Gardening</mark> tips for spring planting."
        );
    }
}
