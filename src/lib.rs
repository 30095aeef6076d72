//! crawlrank: polite web crawler, full-text index and ranked search
//!
//! - Prioritized, deduplicated crawl frontier with robots.txt and per-host politeness
//! - Concurrent fetcher pool handing pages to indexers over a durable queue
//! - Tantivy inverted index with an English analyzer
//! - PageRank over the stored link graph
//! - Hybrid BM25 + authority scoring with snippets and a result cache

pub mod config;
pub mod content;
pub mod crawl;
pub mod index;
pub mod pipeline;
pub mod queue;
pub mod rank;
pub mod search;
pub mod store;
pub mod types;
pub mod util;

pub use config::Config;
pub use pipeline::{CrawlIndexReport, CrawlOptions, CrawlSummary, Pipeline, PipelineStats};
pub use types::*;
