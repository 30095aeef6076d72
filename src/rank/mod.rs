//! Link-graph authority
//!
//! `pagerank` holds the graph arena and the power iteration; `engine` wraps
//! it in a single-flight batch job that publishes scores atomically.

mod engine;
mod pagerank;

pub use engine::{RankReport, RankingEngine};
pub use pagerank::{compute, LinkGraph, RankOutcome};
