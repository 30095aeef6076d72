//! URL dedup filter
//!
//! A Bloom filter answers `seen(url)` without false negatives. Its bits are
//! persisted through the cache collaborator so a restart keeps crawl history.

use crate::store::KvCache;
use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{info, warn};
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Cache key holding the serialized filter
pub const DEDUP_CACHE_KEY: &str = "crawlrank:dedup:bloom";

/// Bloom filter implementation
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: usize,
    num_hashes: usize,
}

impl BloomFilter {
    /// Create a new bloom filter
    ///
    /// # Arguments
    /// * `num_items` - Expected number of items
    /// * `false_positive_rate` - Desired false positive rate (e.g., 0.01 for 1%)
    pub fn new(num_items: usize, false_positive_rate: f64) -> Self {
        let num_items = num_items.max(1);
        // m = -n * ln(p) / (ln(2)^2)
        let m = (-(num_items as f64) * false_positive_rate.ln() / (2.0_f64.ln().powi(2))).ceil()
            as usize;
        let num_bits = m.max(8);

        // k = m/n * ln(2)
        let k = ((num_bits as f64 / num_items as f64) * 2.0_f64.ln()).round() as usize;
        let num_hashes = k.clamp(1, 16);

        Self {
            bits: vec![0u8; num_bits.div_ceil(8)],
            num_bits,
            num_hashes,
        }
    }

    pub fn insert(&mut self, item: &[u8]) {
        for i in 0..self.num_hashes {
            let bit_idx = self.bit_index(item, i);
            self.bits[bit_idx / 8] |= 1 << (bit_idx % 8);
        }
    }

    /// Returns false if definitely not in set, true if possibly in set
    pub fn contains(&self, item: &[u8]) -> bool {
        (0..self.num_hashes).all(|i| {
            let bit_idx = self.bit_index(item, i);
            self.bits[bit_idx / 8] & (1 << (bit_idx % 8)) != 0
        })
    }

    fn bit_index(&self, item: &[u8], seed: usize) -> usize {
        (xxh3_64_with_seed(item, seed as u64) % self.num_bits as u64) as usize
    }

    /// Export as `num_bits | num_hashes | bits` (little-endian header)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(16 + self.bits.len());
        result.extend_from_slice(&(self.num_bits as u64).to_le_bytes());
        result.extend_from_slice(&(self.num_hashes as u64).to_le_bytes());
        result.extend_from_slice(&self.bits);
        result
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 16 {
            return None;
        }
        let num_bits = u64::from_le_bytes(data[0..8].try_into().ok()?) as usize;
        let num_hashes = u64::from_le_bytes(data[8..16].try_into().ok()?) as usize;
        let bits = data[16..].to_vec();

        if num_bits == 0 || num_hashes == 0 || bits.len() < num_bits.div_ceil(8) {
            return None;
        }
        Some(Self {
            bits,
            num_bits,
            num_hashes,
        })
    }

    /// Unset every bit, keeping the dimensions
    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = 0);
    }

    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    pub fn num_hashes(&self) -> usize {
        self.num_hashes
    }

    /// Estimate the number of items in the filter
    pub fn estimate_count(&self) -> usize {
        let set_bits: usize = self.bits.iter().map(|b| b.count_ones() as usize).sum();
        let m = self.num_bits as f64;
        let k = self.num_hashes as f64;
        let x = set_bits as f64;

        if x >= m {
            return set_bits;
        }
        // n ≈ -m/k * ln(1 - x/m)
        let estimate = (-m / k) * (1.0 - x / m).ln();
        if !estimate.is_finite() || estimate < 0.0 {
            return 0;
        }
        estimate.round() as usize
    }

    /// Fraction of bits set
    pub fn fill_ratio(&self) -> f64 {
        let set_bits: usize = self.bits.iter().map(|b| b.count_ones() as usize).sum();
        set_bits as f64 / self.num_bits as f64
    }
}

/// Shared `seen` / `mark` filter over canonical URLs
pub struct DedupFilter {
    bloom: RwLock<BloomFilter>,
}

impl DedupFilter {
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        Self {
            bloom: RwLock::new(BloomFilter::new(expected_items, false_positive_rate)),
        }
    }

    /// Create a filter pre-warmed from the cache, or empty if nothing usable is stored.
    pub fn warm(cache: &dyn KvCache, expected_items: usize, false_positive_rate: f64) -> Self {
        let fresh = BloomFilter::new(expected_items, false_positive_rate);
        let bloom = match cache.get(DEDUP_CACHE_KEY) {
            Ok(Some(data)) => match BloomFilter::from_bytes(&data) {
                Some(stored)
                    if stored.num_bits == fresh.num_bits
                        && stored.num_hashes == fresh.num_hashes =>
                {
                    info!(
                        "Dedup filter warmed from cache (~{} URLs)",
                        stored.estimate_count()
                    );
                    stored
                }
                Some(_) => {
                    warn!("Persisted dedup filter has different dimensions, starting empty");
                    fresh
                }
                None => {
                    warn!("Persisted dedup filter is corrupt, starting empty");
                    fresh
                }
            },
            Ok(None) => fresh,
            Err(e) => {
                warn!("Failed to read persisted dedup filter: {}", e);
                fresh
            }
        };
        Self {
            bloom: RwLock::new(bloom),
        }
    }

    pub fn seen(&self, url: &str) -> bool {
        self.bloom.read().contains(url.as_bytes())
    }

    pub fn mark(&self, url: &str) {
        self.bloom.write().insert(url.as_bytes());
    }

    /// Mark and report whether the URL was already (probably) present
    pub fn check_and_mark(&self, url: &str) -> bool {
        let mut bloom = self.bloom.write();
        let present = bloom.contains(url.as_bytes());
        if !present {
            bloom.insert(url.as_bytes());
        }
        present
    }

    /// Write the filter to the cache (no TTL)
    pub fn persist(&self, cache: &dyn KvCache) -> Result<()> {
        let data = self.bloom.read().to_bytes();
        cache
            .set(DEDUP_CACHE_KEY, &data, None)
            .context("Failed to persist dedup filter")
    }

    /// Forget every URL and drop the persisted copy so a restart does not
    /// bring the old bits back
    pub fn reset(&self, cache: &dyn KvCache) -> Result<()> {
        self.bloom.write().clear();
        cache
            .delete(DEDUP_CACHE_KEY)
            .context("Failed to delete persisted dedup filter")?;
        info!("Dedup filter cleared");
        Ok(())
    }

    pub fn estimate_count(&self) -> usize {
        self.bloom.read().estimate_count()
    }

    pub fn fill_ratio(&self) -> f64 {
        self.bloom.read().fill_ratio()
    }
}
