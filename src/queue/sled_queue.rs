//! sled-backed hand-off queue
//!
//! Trees:
//! - `queue.ready`: sequence → envelope, consumed with `pop_min`
//! - `queue.unacked`: message id → envelope plus visibility deadline
//! - `queue.dead`: message id → dead letter

use super::{DeadLetter, Delivery, HandoffQueue};
use crate::types::PageEvent;
use crate::util::now_ms;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    id: u64,
    deliveries: u32,
    payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Unacked {
    envelope: Envelope,
    visible_at_ms: u64,
}

pub struct SledQueue {
    db: sled::Db,
    ready: sled::Tree,
    unacked: sled::Tree,
    dead: sled::Tree,
    max_deliveries: u32,
    notify: Notify,
}

impl SledQueue {
    pub fn open(db: &sled::Db, max_deliveries: u32) -> Result<Self> {
        let open = |name: &str| {
            db.open_tree(name)
                .with_context(|| format!("Failed to open queue tree {}", name))
        };
        Ok(Self {
            db: db.clone(),
            ready: open("queue.ready")?,
            unacked: open("queue.unacked")?,
            dead: open("queue.dead")?,
            max_deliveries: max_deliveries.max(1),
            notify: Notify::new(),
        })
    }

    fn push_ready(&self, envelope: &Envelope) -> Result<()> {
        let seq = self.db.generate_id().context("Failed to generate queue sequence")?;
        let data = bincode::serialize(envelope).context("Failed to serialize envelope")?;
        self.ready
            .insert(seq.to_be_bytes(), data)
            .context("Failed to write queue message")?;
        self.notify.notify_one();
        Ok(())
    }

    fn dead_letter(&self, envelope: Envelope, reason: &str) -> Result<()> {
        warn!(
            "Dead-lettering message {} after {} deliveries: {}",
            envelope.id, envelope.deliveries, reason
        );
        let letter = DeadLetter {
            id: envelope.id,
            payload: String::from_utf8_lossy(&envelope.payload).into_owned(),
            deliveries: envelope.deliveries,
            reason: reason.to_string(),
            dead_at: Utc::now(),
        };
        let data = bincode::serialize(&letter).context("Failed to serialize dead letter")?;
        self.dead
            .insert(envelope.id.to_be_bytes(), data)
            .context("Failed to write dead letter")?;
        Ok(())
    }

    /// Return messages whose visibility lapsed, dead-lettering exhausted ones
    fn redeliver_expired(&self, now: u64) -> Result<usize> {
        let mut moved = 0;
        for item in self.unacked.iter() {
            let (key, data) = item.context("Failed to scan unacked messages")?;
            let unacked: Unacked = match bincode::deserialize(&data) {
                Ok(u) => u,
                Err(e) => {
                    warn!("Dropping undecodable unacked message: {}", e);
                    self.unacked.remove(&key)?;
                    continue;
                }
            };
            if unacked.visible_at_ms > now {
                continue;
            }
            let swapped = self
                .unacked
                .compare_and_swap(&key, Some(&data), None as Option<&[u8]>)
                .context("Failed to reclaim message")?;
            if swapped.is_err() {
                continue;
            }
            if unacked.envelope.deliveries >= self.max_deliveries {
                self.dead_letter(unacked.envelope, "visibility timeout on final delivery")?;
            } else {
                debug!("Redelivering message {}", unacked.envelope.id);
                self.push_ready(&unacked.envelope)?;
            }
            moved += 1;
        }
        Ok(moved)
    }

    fn take_unacked(&self, id: u64) -> Result<Option<Envelope>> {
        let Some(data) = self
            .unacked
            .remove(id.to_be_bytes())
            .context("Failed to remove unacked message")?
        else {
            return Ok(None);
        };
        let unacked: Unacked =
            bincode::deserialize(&data).context("Failed to decode unacked message")?;
        Ok(Some(unacked.envelope))
    }
}

#[async_trait]
impl HandoffQueue for SledQueue {
    async fn publish(&self, event: &PageEvent) -> Result<()> {
        let payload = serde_json::to_vec(event).context("Failed to encode event")?;
        let id = self.db.generate_id().context("Failed to generate message id")?;
        self.push_ready(&Envelope {
            id,
            deliveries: 0,
            payload,
        })
    }

    async fn consume(&self, visibility: Duration) -> Result<Option<Delivery>> {
        let now = now_ms();
        self.redeliver_expired(now)?;

        while let Some((_, data)) = self.ready.pop_min().context("Failed to pop queue")? {
            let mut envelope: Envelope = match bincode::deserialize(&data) {
                Ok(e) => e,
                Err(e) => {
                    warn!("Dropping undecodable queue envelope: {}", e);
                    continue;
                }
            };
            envelope.deliveries += 1;
            let unacked = Unacked {
                envelope: envelope.clone(),
                visible_at_ms: now + visibility.as_millis() as u64,
            };
            let record = bincode::serialize(&unacked).context("Failed to serialize unacked")?;
            self.unacked
                .insert(envelope.id.to_be_bytes(), record)
                .context("Failed to record delivery")?;
            return Ok(Some(Delivery {
                id: envelope.id,
                payload: envelope.payload,
                deliveries: envelope.deliveries,
            }));
        }
        Ok(None)
    }

    async fn wait(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.notify.notified()).await;
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        if self.take_unacked(delivery.id)?.is_none() {
            debug!("Ack for message {} that is no longer unacked", delivery.id);
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        let Some(envelope) = self.take_unacked(delivery.id)? else {
            debug!("Nack for message {} that is no longer unacked", delivery.id);
            return Ok(());
        };
        if !requeue {
            self.dead_letter(envelope, "rejected by consumer")
        } else if envelope.deliveries >= self.max_deliveries {
            self.dead_letter(envelope, "max deliveries exceeded")
        } else {
            self.push_ready(&envelope)
        }
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.dead
            .iter()
            .values()
            .map(|v| {
                let data = v.context("Failed to read dead letter")?;
                bincode::deserialize(&data).context("Failed to decode dead letter")
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.ready.len()
    }

    fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    fn dead_letter_count(&self) -> usize {
        self.dead.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FailureKind, FetchFailure};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn queue(max_deliveries: u32) -> SledQueue {
        let db = sled::Config::new().temporary(true).open().unwrap();
        SledQueue::open(&db, max_deliveries).unwrap()
    }

    fn event(url: &str) -> PageEvent {
        PageEvent::Failed(FetchFailure {
            url: url.to_string(),
            reason: "boom".to_string(),
            kind: FailureKind::Malformed,
            http_status: Some(404),
            attempts: 1,
            failed_at: Utc::now(),
            job_id: None,
            worker_id: "w".to_string(),
        })
    }

    const VIS: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_publish_consume_ack() {
        let q = queue(3);
        q.publish(&event("https://a.com/")).await.unwrap();
        assert_eq!(q.len(), 1);

        let d = q.consume(VIS).await.unwrap().unwrap();
        assert_eq!(d.deliveries, 1);
        assert_eq!(d.event().unwrap().url(), "https://a.com/");
        assert_eq!(q.len(), 0);
        assert_eq!(q.unacked_len(), 1);

        q.ack(&d).await.unwrap();
        assert_eq!(q.unacked_len(), 0);
        assert!(q.consume(VIS).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let q = queue(3);
        for i in 0..5 {
            q.publish(&event(&format!("https://a.com/{}", i))).await.unwrap();
        }
        for i in 0..5 {
            let d = q.consume(VIS).await.unwrap().unwrap();
            assert_eq!(d.event().unwrap().url(), format!("https://a.com/{}", i));
        }
    }

    #[tokio::test]
    async fn test_visibility_timeout_redelivers() {
        let q = queue(3);
        q.publish(&event("https://a.com/")).await.unwrap();

        let first = q.consume(Duration::ZERO).await.unwrap().unwrap();
        let second = q.consume(VIS).await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.deliveries, 2);
    }

    #[tokio::test]
    async fn test_repeated_failures_dead_letter() {
        let q = queue(3);
        q.publish(&event("https://poison.com/")).await.unwrap();

        for _ in 0..3 {
            let d = q.consume(VIS).await.unwrap().unwrap();
            q.nack(&d, true).await.unwrap();
        }
        assert!(q.consume(VIS).await.unwrap().is_none());
        let dead = q.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].deliveries, 3);
        assert!(dead[0].payload.contains("poison.com"));
    }

    #[tokio::test]
    async fn test_expired_final_delivery_dead_letters() {
        let q = queue(1);
        q.publish(&event("https://a.com/")).await.unwrap();
        q.consume(Duration::ZERO).await.unwrap().unwrap();

        assert!(q.consume(VIS).await.unwrap().is_none());
        assert_eq!(q.dead_letter_count(), 1);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_dead_letters_immediately() {
        let q = queue(5);
        q.publish(&event("https://a.com/")).await.unwrap();
        let d = q.consume(VIS).await.unwrap().unwrap();
        q.nack(&d, false).await.unwrap();
        assert_eq!(q.dead_letter_count(), 1);
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn test_competing_consumers_get_distinct_messages() {
        let q = Arc::new(queue(3));
        for i in 0..100 {
            q.publish(&event(&format!("https://a.com/{}", i))).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = q.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(d) = q.consume(VIS).await.unwrap() {
                    ids.push(d.id);
                    q.ack(&d).await.unwrap();
                }
                ids
            }));
        }

        let mut all = HashSet::new();
        let mut total = 0;
        for h in handles {
            let ids = h.await.unwrap();
            total += ids.len();
            all.extend(ids);
        }
        assert_eq!(total, 100);
        assert_eq!(all.len(), 100);
    }
}
