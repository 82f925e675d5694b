//! "Has this token already been processed?"
//!
//! The ledger pairs a Bloom filter with an authoritative set. The filter only
//! answers "definitely not seen" quickly; a positive answer is always
//! confirmed against the set before a token is treated as a duplicate.

use std::{
    hash::{DefaultHasher, Hash, Hasher},
    sync::atomic::{AtomicU64, Ordering},
};

use dashmap::DashSet;
use serde::{Deserialize, Serialize};

/// Sizing for a [`BloomFilter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BloomConfig {
    /// Number of bits; rounded up to a multiple of 64.
    pub bits: usize,
    /// Number of hashed bit positions per item.
    pub hashes: u32,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            bits: 1 << 16,
            hashes: 4,
        }
    }
}

impl BloomConfig {
    #[must_use]
    pub const fn with_bits(mut self, bits: usize) -> Self {
        self.bits = bits;
        self
    }

    #[must_use]
    pub const fn with_hashes(mut self, hashes: u32) -> Self {
        self.hashes = hashes;
        self
    }
}

/// Lock-free Bloom filter over string tokens.
///
/// False positives are possible, false negatives are not.
pub struct BloomFilter {
    words: Box<[AtomicU64]>,
    hashes: u32,
}

impl BloomFilter {
    #[must_use]
    pub fn new(config: BloomConfig) -> Self {
        let words = config.bits.div_ceil(64).max(1);
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            hashes: config.hashes.max(1),
        }
    }

    fn bit_count(&self) -> u64 {
        self.words.len() as u64 * 64
    }

    // double hashing: position i is h1 + i * h2
    fn positions<'a>(&'a self, item: &'a str) -> impl Iterator<Item = (usize, u64)> + 'a {
        let h1 = hash_with(item, 0x51_7c_c1_b7);
        let h2 = hash_with(item, 0x27_22_0a_95) | 1;
        let bits = self.bit_count();
        (0..u64::from(self.hashes)).map(move |i| {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % bits;
            ((bit / 64) as usize, 1_u64 << (bit % 64))
        })
    }

    pub fn insert(&self, item: &str) {
        for (word, mask) in self.positions(item) {
            self.words[word].fetch_or(mask, Ordering::Relaxed);
        }
    }

    pub fn might_contain(&self, item: &str) -> bool {
        self.positions(item)
            .all(|(word, mask)| self.words[word].load(Ordering::Relaxed) & mask != 0)
    }
}

fn hash_with(item: &str, seed: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    item.hash(&mut hasher);
    hasher.finish()
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new(BloomConfig::default())
    }
}

impl Clone for BloomFilter {
    fn clone(&self) -> Self {
        Self {
            words: self
                .words
                .iter()
                .map(|w| AtomicU64::new(w.load(Ordering::Relaxed)))
                .collect(),
            hashes: self.hashes,
        }
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("bits", &self.bit_count())
            .field("hashes", &self.hashes)
            .finish_non_exhaustive()
    }
}

/// Record of processed idempotency tokens, partitioned by scope.
pub trait IdempotencyLedger: Send + Sync {
    /// Record `token` in `scope`. Returns `false` if it was already there.
    fn try_record(&self, scope: &str, token: &str) -> bool;

    fn contains(&self, scope: &str, token: &str) -> bool;
}

/// Process-local ledger.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    filter: BloomFilter,
    seen: DashSet<(String, String)>,
}

impl InMemoryLedger {
    #[must_use]
    pub fn new(config: BloomConfig) -> Self {
        Self {
            filter: BloomFilter::new(config),
            seen: DashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

fn filter_key(scope: &str, token: &str) -> String {
    format!("{scope}\u{1f}{token}")
}

impl IdempotencyLedger for InMemoryLedger {
    fn try_record(&self, scope: &str, token: &str) -> bool {
        let key = filter_key(scope, token);
        let fresh = self.seen.insert((scope.to_owned(), token.to_owned()));
        self.filter.insert(&key);
        if !fresh {
            tracing::trace!(scope, token, "token already recorded");
        }
        fresh
    }

    fn contains(&self, scope: &str, token: &str) -> bool {
        if !self.filter.might_contain(&filter_key(scope, token)) {
            return false;
        }
        self.seen.contains(&(scope.to_owned(), token.to_owned()))
    }
}
