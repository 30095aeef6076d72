//! URL frontier
//!
//! A persistent priority queue of crawl candidates in sled trees:
//! - `pending`: keyed by (inverted priority, sequence) so `pop_min` yields the
//!   highest priority entry, FIFO within equal priority
//! - `delayed`: keyed by (due time, sequence) for back-off requeues
//! - `inflight`: leased entries keyed by URL, reclaimed when the lease expires
//! - `status`: last known status per URL
//!
//! Dequeue relies on `Tree::pop_min`, which is atomic, so concurrent callers
//! never receive the same entry.

use crate::crawl::DedupFilter;
use crate::types::{FrontierEntry, FrontierStatus};
use crate::util::now_ms;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A dequeued entry and the time its claim lapses
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lease {
    entry: FrontierEntry,
    expires_ms: u64,
}

pub struct Frontier {
    db: sled::Db,
    pending: sled::Tree,
    delayed: sled::Tree,
    inflight: sled::Tree,
    status: sled::Tree,
    dedup: Arc<DedupFilter>,
    max_depth: u32,
    lease_timeout: Duration,
}

impl Frontier {
    pub fn open(
        db: &sled::Db,
        dedup: Arc<DedupFilter>,
        max_depth: u32,
        lease_timeout: Duration,
    ) -> Result<Self> {
        let open = |name: &str| {
            db.open_tree(name)
                .with_context(|| format!("Failed to open frontier tree {}", name))
        };
        Ok(Self {
            db: db.clone(),
            pending: open("frontier.pending")?,
            delayed: open("frontier.delayed")?,
            inflight: open("frontier.inflight")?,
            status: open("frontier.status")?,
            dedup,
            max_depth,
            lease_timeout,
        })
    }

    /// Add a newly discovered URL.
    ///
    /// No-op (returns false) if the URL was already seen or `depth` exceeds
    /// the maximum crawl depth.
    pub fn enqueue(&self, url: &str, priority: f32, depth: u32) -> Result<bool> {
        self.enqueue_entry(FrontierEntry::new(url, priority, depth))
    }

    /// Add a discovered URL carrying job and attempt metadata
    pub fn enqueue_entry(&self, entry: FrontierEntry) -> Result<bool> {
        if entry.depth > self.max_depth {
            return Ok(false);
        }
        if self.dedup.check_and_mark(&entry.url) {
            return Ok(false);
        }
        // exact backstop for Bloom state lost across restarts
        if !self.claim_status(&entry.url, None)? {
            return Ok(false);
        }
        self.push_pending(entry)?;
        Ok(true)
    }

    /// Add a seed URL. Seeds that finished in an earlier crawl are crawled
    /// again; seeds still pending or in flight are left alone.
    pub fn enqueue_seed(&self, url: &str, priority: f32, job_id: Option<Uuid>) -> Result<bool> {
        self.dedup.mark(url);
        let claimed = self.claim_status(url, None)?
            || self.claim_status(url, Some(FrontierStatus::Done))?;
        if !claimed {
            return Ok(false);
        }
        self.push_pending(FrontierEntry::new(url, priority, 0).with_job(job_id))?;
        Ok(true)
    }

    /// Atomically set status to Pending if the current status equals `expected`
    fn claim_status(&self, url: &str, expected: Option<FrontierStatus>) -> Result<bool> {
        let expected = expected.map(encode_status).transpose()?;
        let pending = encode_status(FrontierStatus::Pending)?;
        let swapped = self
            .status
            .compare_and_swap(url.as_bytes(), expected, Some(pending))
            .with_context(|| format!("Failed to claim frontier status for {}", url))?;
        Ok(swapped.is_ok())
    }

    fn set_status(&self, url: &str, status: FrontierStatus) -> Result<()> {
        self.status
            .insert(url.as_bytes(), encode_status(status)?)
            .with_context(|| format!("Failed to set frontier status for {}", url))?;
        Ok(())
    }

    fn push_pending(&self, mut entry: FrontierEntry) -> Result<()> {
        entry.status = FrontierStatus::Pending;
        entry.seq = self.db.generate_id().context("Failed to generate frontier sequence")?;
        let key = pending_key(entry.priority, entry.seq);
        let data = bincode::serialize(&entry).context("Failed to serialize frontier entry")?;
        self.pending
            .insert(key, data)
            .with_context(|| format!("Failed to enqueue {}", entry.url))?;
        Ok(())
    }

    /// Pop the best pending entry and lease it to the caller.
    pub fn dequeue(&self) -> Result<Option<FrontierEntry>> {
        let now = now_ms();
        self.promote_due(now)?;
        self.reclaim_expired(now)?;

        while let Some((_, data)) = self.pending.pop_min().context("Failed to pop frontier")? {
            let mut entry: FrontierEntry = match bincode::deserialize(&data) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Dropping undecodable frontier entry: {}", e);
                    continue;
                }
            };
            entry.status = FrontierStatus::InFlight;
            let lease = Lease {
                entry: entry.clone(),
                expires_ms: now + self.lease_timeout.as_millis() as u64,
            };
            let lease_data = bincode::serialize(&lease).context("Failed to serialize lease")?;
            self.inflight
                .insert(entry.url.as_bytes(), lease_data)
                .with_context(|| format!("Failed to lease {}", entry.url))?;
            self.set_status(&entry.url, FrontierStatus::InFlight)?;
            return Ok(Some(entry));
        }
        Ok(None)
    }

    /// Move delayed entries whose due time has passed back to pending
    fn promote_due(&self, now: u64) -> Result<usize> {
        let upper = [now.to_be_bytes(), u64::MAX.to_be_bytes()].concat();
        let due: Vec<sled::IVec> = self
            .delayed
            .range(..=upper)
            .keys()
            .filter_map(|k| k.ok())
            .collect();

        let mut promoted = 0;
        for key in due {
            // remove is atomic: only one caller gets the value back
            if let Some(data) = self.delayed.remove(&key).context("Failed to promote entry")? {
                match bincode::deserialize::<FrontierEntry>(&data) {
                    Ok(entry) => {
                        self.push_pending(entry)?;
                        promoted += 1;
                    }
                    Err(e) => warn!("Dropping undecodable delayed entry: {}", e),
                }
            }
        }
        Ok(promoted)
    }

    /// Return entries with expired leases to pending
    pub fn reclaim_expired(&self, now: u64) -> Result<usize> {
        let mut reclaimed = 0;
        for item in self.inflight.iter() {
            let (key, data) = item.context("Failed to scan leases")?;
            let lease: Lease = match bincode::deserialize(&data) {
                Ok(lease) => lease,
                Err(e) => {
                    warn!("Dropping undecodable lease: {}", e);
                    self.inflight.remove(&key)?;
                    continue;
                }
            };
            if lease.expires_ms > now {
                continue;
            }
            let swapped = self
                .inflight
                .compare_and_swap(&key, Some(&data), None as Option<&[u8]>)
                .context("Failed to reclaim lease")?;
            if swapped.is_ok() {
                debug!("Lease expired for {}, redelivering", lease.entry.url);
                self.push_pending(lease.entry.clone())?;
                self.set_status(&lease.entry.url, FrontierStatus::Pending)?;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Extend the lease on an in-flight entry
    pub fn renew_lease(&self, url: &str) -> Result<bool> {
        let expires_ms = now_ms() + self.lease_timeout.as_millis() as u64;
        let updated = self
            .inflight
            .update_and_fetch(url.as_bytes(), |old| {
                let old = old?;
                match bincode::deserialize::<Lease>(old) {
                    Ok(mut lease) => {
                        lease.expires_ms = expires_ms;
                        bincode::serialize(&lease).ok().or_else(|| Some(old.to_vec()))
                    }
                    Err(_) => Some(old.to_vec()),
                }
            })
            .with_context(|| format!("Failed to renew lease for {}", url))?;
        Ok(updated.is_some())
    }

    /// Release the lease and mark the entry done
    pub fn complete(&self, url: &str) -> Result<()> {
        self.inflight
            .remove(url.as_bytes())
            .with_context(|| format!("Failed to release lease for {}", url))?;
        self.set_status(url, FrontierStatus::Done)
    }

    /// Put a dequeued entry back, eligible again after `delay`.
    ///
    /// Bypasses the dedup filter: the URL is already known.
    pub fn requeue(&self, mut entry: FrontierEntry, delay: Duration) -> Result<()> {
        self.inflight
            .remove(entry.url.as_bytes())
            .with_context(|| format!("Failed to release lease for {}", entry.url))?;
        self.set_status(&entry.url, FrontierStatus::Pending)?;

        if delay.is_zero() {
            return self.push_pending(entry);
        }
        entry.status = FrontierStatus::Pending;
        let seq = self.db.generate_id().context("Failed to generate frontier sequence")?;
        let due = now_ms() + delay.as_millis() as u64;
        let key = [due.to_be_bytes(), seq.to_be_bytes()].concat();
        let data = bincode::serialize(&entry).context("Failed to serialize frontier entry")?;
        self.delayed
            .insert(key, data)
            .with_context(|| format!("Failed to delay {}", entry.url))?;
        Ok(())
    }

    /// Drop every pending, delayed and in-flight entry.
    ///
    /// Their statuses are removed so the URLs can be queued again; `Done`
    /// statuses stay. Returns the number of entries dropped.
    pub fn clear(&self) -> Result<usize> {
        let dropped = self.pending.len() + self.delayed.len() + self.inflight.len();
        for tree in [&self.pending, &self.delayed, &self.inflight] {
            tree.clear().context("Failed to clear frontier")?;
        }

        let done = encode_status(FrontierStatus::Done)?;
        for item in self.status.iter() {
            let (key, value) = item.context("Failed to scan frontier status")?;
            if value.as_ref() != done.as_slice() {
                self.status.remove(&key).context("Failed to clear frontier status")?;
            }
        }
        info!("Frontier cleared ({} entries dropped)", dropped);
        Ok(dropped)
    }

    /// Remove `Done` statuses so finished URLs can be discovered again.
    /// Returns how many were forgotten.
    pub fn forget_done(&self) -> Result<usize> {
        let done = encode_status(FrontierStatus::Done)?;
        let mut forgotten = 0;
        for item in self.status.iter() {
            let (key, value) = item.context("Failed to scan frontier status")?;
            if value.as_ref() == done.as_slice() {
                // a URL re-queued since the scan keeps its new status
                let removed = self
                    .status
                    .compare_and_swap(&key, Some(done.as_slice()), None as Option<&[u8]>)
                    .context("Failed to forget frontier status")?;
                if removed.is_ok() {
                    forgotten += 1;
                }
            }
        }
        debug!("Forgot {} finished frontier URLs", forgotten);
        Ok(forgotten)
    }

    /// Time until the earliest delayed entry becomes due
    pub fn next_due_in(&self) -> Option<Duration> {
        let (key, _) = self.delayed.first().ok().flatten()?;
        let due = u64::from_be_bytes(key.get(..8)?.try_into().ok()?);
        Some(Duration::from_millis(due.saturating_sub(now_ms())))
    }

    pub fn status(&self, url: &str) -> Option<FrontierStatus> {
        self.status
            .get(url.as_bytes())
            .ok()
            .flatten()
            .and_then(|data| bincode::deserialize(&data).ok())
    }

    /// Number of pending entries
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    pub fn delayed_len(&self) -> usize {
        self.delayed.len()
    }

    /// Nothing pending, delayed or in flight
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.delayed.is_empty() && self.inflight.is_empty()
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }
}

fn encode_status(status: FrontierStatus) -> Result<Vec<u8>> {
    bincode::serialize(&status).context("Failed to serialize frontier status")
}

/// Key ordering highest priority first, then lowest sequence
fn pending_key(priority: f32, seq: u64) -> Vec<u8> {
    let bits = priority.to_bits();
    // map f32 onto u32 preserving order, then invert for descending
    let ordered = if bits >> 31 == 1 { !bits } else { bits | 0x8000_0000 };
    let mut key = Vec::with_capacity(12);
    key.extend_from_slice(&(!ordered).to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}
