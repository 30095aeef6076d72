//! Query scoring and result cache configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How text relevance and link authority are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HybridFormula {
    /// relevance_weight * relevance + authority_weight * authority
    WeightedSum,
    /// relevance * (1 + authority_weight * authority)
    Multiplicative,
}

/// Query scorer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Combination formula
    pub formula: HybridFormula,
    /// Weight on normalized text relevance
    pub relevance_weight: f64,
    /// Weight on normalized PageRank authority
    pub authority_weight: f64,
    /// Authority used for pages without a RankScore
    pub missing_rank_floor: f64,
    /// Result cache TTL (seconds)
    pub cache_ttl_secs: u64,
    /// In-memory result cache capacity (entries)
    pub cache_capacity: usize,
    /// Candidates pulled from the inverted index before hybrid re-ranking
    pub candidate_limit: usize,
    /// Maximum snippet length (characters)
    pub snippet_chars: usize,
    /// Highest page number accepted
    pub max_page: usize,
    /// Largest page size accepted
    pub max_size: usize,
}

impl SearchConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            formula: HybridFormula::WeightedSum,
            relevance_weight: 0.7,
            authority_weight: 0.3,
            missing_rank_floor: 0.0,
            cache_ttl_secs: 3600,
            cache_capacity: 10_000,
            candidate_limit: 1000,
            snippet_chars: 150,
            max_page: 100,
            max_size: 100,
        }
    }
}
