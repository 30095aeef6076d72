//! Text processing and indexing
//!
//! - `TermTokenizer`: pluggable term normalization (tantivy analyzer or unicode words)
//! - `TermStats`: per-document term frequencies
//! - `InvertedIndex`: full-text engine interface, implemented by `TantivyIndex`
//! - `Indexer` / `IndexerWorker`: hand-off queue consumer writing store and index

mod indexer;
mod inverted;
mod stats;
mod tokenizer;

pub use indexer::{IndexOutcome, Indexer, IndexerWorker};
pub use inverted::{IndexDocument, IndexHit, InvertedIndex, QueryMatches, TantivyIndex};
pub use stats::TermStats;
pub use tokenizer::{
    english_analyzer, AnalyzerTokenizer, TermTokenizer, WordTokenizer, ANALYZER_NAME,
    ENGLISH_STOP_WORDS,
};
