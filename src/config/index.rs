//! Indexing and ranking configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Term normalizer used for query terms and snippet highlighting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerKind {
    /// Same analyzer chain as the inverted index (stop words, stemming)
    #[default]
    Analyzer,
    /// Plain unicode words, lowercased
    Word,
}

/// Text normalization and inverted index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Apply English stemming to body and title terms
    pub stemming: bool,
    /// Tokens shorter than this are dropped
    pub min_token_len: usize,
    /// Term normalizer for queries and snippets
    #[serde(default)]
    pub tokenizer: TokenizerKind,
    /// Number of concurrent indexer consumers
    pub indexer_workers: usize,
    /// Tantivy writer memory budget (bytes)
    pub writer_heap_bytes: usize,
    /// Maximum stored title length (characters)
    pub max_title_chars: usize,
    /// Maximum stored description length (characters)
    pub max_description_chars: usize,
    /// Maximum stored body length (characters)
    pub max_body_chars: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            stemming: true,
            min_token_len: 3,
            tokenizer: TokenizerKind::Analyzer,
            indexer_workers: 2,
            writer_heap_bytes: 50_000_000, // 50MB
            max_title_chars: 500,
            max_description_chars: 1000,
            max_body_chars: 100_000,
        }
    }
}

/// PageRank configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    /// Damping factor d
    pub damping: f64,
    /// L1 convergence threshold between iterations
    pub tolerance: f64,
    /// Hard iteration cap
    pub max_iterations: usize,
    /// Scheduled recompute interval (seconds, 0 disables the schedule)
    pub interval_secs: u64,
}

impl RankingConfig {
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            damping: 0.85,
            tolerance: 1e-6,
            max_iterations: 100,
            interval_secs: 0,
        }
    }
}
