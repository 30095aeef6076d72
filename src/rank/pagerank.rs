//! PageRank over an arena graph
//!
//! Nodes are page ids stored once in a `Vec`; edges are adjacency lists of
//! node indices, so cycles need no shared ownership.

use crate::store::Store;
use crate::types::PageId;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Directed link graph keyed by page id
#[derive(Debug, Default, Clone)]
pub struct LinkGraph {
    ids: Vec<PageId>,
    positions: HashMap<PageId, usize>,
    outgoing: Vec<Vec<usize>>,
    edges: usize,
}

impl LinkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// All known pages plus every edge endpoint
    pub fn from_store(store: &Store) -> Self {
        let mut graph = Self::new();
        for page in store.pages_iter() {
            graph.add_node(page.id);
        }
        for edge in store.links_iter() {
            graph.add_edge(PageId::from_url(&edge.source), PageId::from_url(&edge.target));
        }
        graph
    }

    /// Index of the node, inserting it if new
    pub fn add_node(&mut self, id: PageId) -> usize {
        if let Some(&pos) = self.positions.get(&id) {
            return pos;
        }
        let pos = self.ids.len();
        self.positions.insert(id.clone(), pos);
        self.ids.push(id);
        self.outgoing.push(Vec::new());
        pos
    }

    pub fn add_edge(&mut self, source: PageId, target: PageId) {
        let s = self.add_node(source);
        let t = self.add_node(target);
        self.outgoing[s].push(t);
        self.edges += 1;
    }

    pub fn node_count(&self) -> usize {
        self.ids.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges
    }

    pub fn id(&self, index: usize) -> Option<&PageId> {
        self.ids.get(index)
    }

    pub fn out_degree(&self, index: usize) -> usize {
        self.outgoing.get(index).map(Vec::len).unwrap_or(0)
    }
}

/// Result of one PageRank run
#[derive(Debug, Clone)]
pub struct RankOutcome {
    pub scores: Vec<(PageId, f64)>,
    pub iterations: usize,
    pub converged: bool,
    /// L1 change of the last iteration
    pub delta: f64,
    pub nodes: usize,
    pub computed_at: DateTime<Utc>,
}

/// Power iteration with uniform redistribution of dangling mass.
///
/// Stops when the L1 change drops below `tolerance` or after `max_iterations`.
pub fn compute(graph: &LinkGraph, damping: f64, tolerance: f64, max_iterations: usize) -> RankOutcome {
    let n = graph.node_count();
    let computed_at = Utc::now();

    if n <= 1 {
        return RankOutcome {
            scores: graph.ids.iter().map(|id| (id.clone(), 1.0)).collect(),
            iterations: 0,
            converged: true,
            delta: 0.0,
            nodes: n,
            computed_at,
        };
    }

    let nf = n as f64;
    let mut rank = vec![1.0 / nf; n];
    let mut next = vec![0.0; n];
    let mut iterations = 0;
    let mut delta = f64::INFINITY;
    let mut converged = false;

    while iterations < max_iterations {
        iterations += 1;

        let dangling: f64 = (0..n)
            .filter(|&i| graph.outgoing[i].is_empty())
            .map(|i| rank[i])
            .sum();
        let base = (1.0 - damping) / nf + damping * dangling / nf;
        next.iter_mut().for_each(|v| *v = base);

        for (source, targets) in graph.outgoing.iter().enumerate() {
            if targets.is_empty() {
                continue;
            }
            let share = damping * rank[source] / targets.len() as f64;
            for &target in targets {
                next[target] += share;
            }
        }

        delta = rank.iter().zip(&next).map(|(a, b)| (a - b).abs()).sum();
        std::mem::swap(&mut rank, &mut next);
        if delta < tolerance {
            converged = true;
            break;
        }
    }

    // absorb floating drift
    let total: f64 = rank.iter().sum();
    if total > 0.0 {
        rank.iter_mut().for_each(|v| *v /= total);
    }

    RankOutcome {
        scores: graph.ids.iter().cloned().zip(rank).collect(),
        iterations,
        converged,
        delta,
        nodes: n,
        computed_at,
    }
}
