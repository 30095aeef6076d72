//! Key-value cache collaborator with per-entry TTL
//!
//! Backs the query result cache and the persisted dedup filter.

use crate::util::now_ms;
use anyhow::{Context, Result};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// get / set-with-TTL key-value semantics
pub trait KvCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a value; `None` TTL never expires
    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;
}

/// Bounded in-process LRU cache
pub struct MemoryCache {
    entries: Mutex<LruCache<String, (Vec<u8>, Option<Instant>)>>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl KvCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some((_, Some(expires_at))) => Instant::now() >= *expires_at,
            Some((value, None)) => return Ok(Some(value.clone())),
            None => return Ok(None),
        };
        if expired {
            entries.pop(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|(value, _)| value.clone()))
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .put(key.to_string(), (value.to_vec(), expires_at));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().pop(key);
        Ok(())
    }
}

/// Persistent cache in a sled tree.
///
/// Values are stored as an 8-byte big-endian expiry (ms since epoch, 0 for
/// none) followed by the payload.
pub struct SledCache {
    tree: sled::Tree,
}

impl SledCache {
    pub fn open(db: &sled::Db, name: &str) -> Result<Self> {
        let tree = db
            .open_tree(name)
            .with_context(|| format!("Failed to open cache tree {}", name))?;
        Ok(Self { tree })
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

impl KvCache for SledCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(data) = self
            .tree
            .get(key.as_bytes())
            .with_context(|| format!("Failed to read cache key {}", key))?
        else {
            return Ok(None);
        };
        if data.len() < 8 {
            self.tree.remove(key.as_bytes())?;
            return Ok(None);
        }
        let mut expiry = [0u8; 8];
        expiry.copy_from_slice(&data[..8]);
        let expires_at = u64::from_be_bytes(expiry);
        if expires_at != 0 && now_ms() >= expires_at {
            self.tree.remove(key.as_bytes())?;
            return Ok(None);
        }
        Ok(Some(data[8..].to_vec()))
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| now_ms() + ttl.as_millis() as u64).unwrap_or(0);
        let mut data = Vec::with_capacity(8 + value.len());
        data.extend_from_slice(&expires_at.to_be_bytes());
        data.extend_from_slice(value);
        self.tree
            .insert(key.as_bytes(), data)
            .with_context(|| format!("Failed to write cache key {}", key))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.tree
            .remove(key.as_bytes())
            .with_context(|| format!("Failed to delete cache key {}", key))?;
        Ok(())
    }
}
