//! Query scoring
//!
//! Merges inverted-index relevance with stored PageRank authority, paginates,
//! highlights snippets and caches whole result pages.

mod scorer;
mod snippet;

pub use scorer::{cache_key, normalize_query, QueryScorer, SearchError, SearchResponse, SearchResult};
pub use snippet::build_snippet;
