//! Ranking engine
//!
//! Recomputes PageRank over the whole stored link graph and publishes the
//! scores as one new rank generation. Concurrent `recompute` calls share the
//! run already in flight.

use super::pagerank::{compute, LinkGraph};
use crate::config::RankingConfig;
use crate::store::{RankSummary, Store};
use crate::types::RankScore;
use anyhow::Result;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Outcome of one published recompute
#[derive(Debug, Clone)]
pub struct RankReport {
    pub summary: RankSummary,
    pub edges: usize,
    pub delta: f64,
    pub took_ms: u64,
}

type SharedRun = Shared<BoxFuture<'static, Result<RankReport, Arc<anyhow::Error>>>>;

pub struct RankingEngine {
    store: Arc<Store>,
    config: RankingConfig,
    inflight: Mutex<Option<SharedRun>>,
    runs: Arc<AtomicU64>,
}

impl RankingEngine {
    pub fn new(store: Arc<Store>, config: RankingConfig) -> Self {
        Self {
            store,
            config,
            inflight: Mutex::new(None),
            runs: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of computations actually executed
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Recompute and publish ranks, or join the recompute already running
    pub async fn recompute(&self) -> Result<RankReport> {
        let run = {
            let mut slot = self.inflight.lock();
            match slot.as_ref() {
                Some(run) if run.peek().is_none() => run.clone(),
                _ => {
                    let run = self.start_run();
                    *slot = Some(run.clone());
                    run
                }
            }
        };
        run.await.map_err(|e| anyhow::anyhow!("{:#}", e))
    }

    fn start_run(&self) -> SharedRun {
        let store = self.store.clone();
        let config = self.config.clone();
        let runs = self.runs.clone();
        async move {
            let task = tokio::task::spawn_blocking(move || {
                runs.fetch_add(1, Ordering::Relaxed);
                run_once(&store, &config)
            });
            match task.await {
                Ok(result) => result.map_err(Arc::new),
                Err(e) => Err(Arc::new(anyhow::anyhow!("Rank task panicked: {}", e))),
            }
        }
        .boxed()
        .shared()
    }

    /// Highest-ranked pages of the current generation
    pub fn top_pages(&self, n: usize) -> Vec<RankScore> {
        let mut ranks = self.store.all_ranks();
        ranks.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranks.truncate(n);
        ranks
    }

    /// Recompute every `interval` until shutdown
    pub async fn run_periodic(&self, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.recompute().await {
                        error!("Scheduled rank recompute failed: {:#}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Ranking engine shutting down");
                    break;
                }
            }
        }
    }
}

fn run_once(store: &Store, config: &RankingConfig) -> Result<RankReport> {
    let started = std::time::Instant::now();
    let graph = LinkGraph::from_store(store);
    let outcome = compute(&graph, config.damping, config.tolerance, config.max_iterations);

    if !outcome.converged {
        warn!(
            "PageRank did not converge in {} iterations (delta {:.2e}), publishing anyway",
            outcome.iterations, outcome.delta
        );
    }

    let scores: Vec<RankScore> = outcome
        .scores
        .iter()
        .map(|(page_id, score)| RankScore {
            page_id: page_id.clone(),
            score: *score,
            computed_at: outcome.computed_at,
        })
        .collect();
    let summary = store.replace_ranks(&scores, outcome.iterations, outcome.converged)?;

    info!(
        "Ranked {} pages over {} links in {} iterations",
        outcome.nodes,
        graph.edge_count(),
        outcome.iterations
    );
    Ok(RankReport {
        summary,
        edges: graph.edge_count(),
        delta: outcome.delta,
        took_ms: started.elapsed().as_millis() as u64,
    })
}
