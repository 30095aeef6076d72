//! Hand-off queue between the fetcher pool and the indexers
//!
//! At-least-once delivery with competing consumers. A consumed message stays
//! unacknowledged until `ack`; if its visibility timeout lapses it is handed
//! out again. Messages delivered too often without an ack are dead-lettered.

mod sled_queue;

pub use sled_queue::SledQueue;

use crate::types::PageEvent;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A message handed to one consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Stable message id, unchanged across redeliveries
    pub id: u64,
    /// JSON-encoded `PageEvent`
    pub payload: Vec<u8>,
    /// Times this message has been delivered, including this one
    pub deliveries: u32,
}

impl Delivery {
    /// Decode the payload
    pub fn event(&self) -> Result<PageEvent> {
        serde_json::from_slice(&self.payload)
            .with_context(|| format!("Failed to decode message {}", self.id))
    }
}

/// A message set aside after repeated failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: u64,
    pub payload: String,
    pub deliveries: u32,
    pub reason: String,
    pub dead_at: DateTime<Utc>,
}

#[async_trait]
pub trait HandoffQueue: Send + Sync {
    /// Durably append an event
    async fn publish(&self, event: &PageEvent) -> Result<()>;

    /// Take the next ready message, invisible to others for `visibility`
    async fn consume(&self, visibility: Duration) -> Result<Option<Delivery>>;

    /// Wait until a message may be available, at most `max_wait`
    async fn wait(&self, max_wait: Duration);

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Give a message back. `requeue = false` dead-letters it immediately.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>>;

    /// Messages ready for delivery
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages delivered but not yet acknowledged
    fn unacked_len(&self) -> usize;

    fn dead_letter_count(&self) -> usize;
}
