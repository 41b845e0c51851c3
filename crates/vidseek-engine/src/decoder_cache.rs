//! LRU cache of decoder instances.
//!
//! The cache only tracks recency. It never tears down a decoder itself:
//! evicted and displaced values are handed back to the caller.

use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use tracing::warn;
use vidseek_media::{DecoderKey, SharedDecoder};

/// Cache keyed by (bit depth, codec, chroma format).
pub type SessionDecoderCache = DecoderCache<DecoderKey, SharedDecoder>;

pub struct DecoderCache<K: Hash + Eq, V> {
    entries: LruCache<K, V>,
}

impl<K: Hash + Eq, V> DecoderCache<K, V> {
    /// Create a cache holding up to `capacity` entries. Zero is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or_else(|| {
            warn!("decoder cache capacity 0 is invalid, clamping to 1");
            NonZeroUsize::MIN
        });
        Self {
            entries: LruCache::new(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up `key`, promoting it to most-recently-used on a hit.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Whether `key` is cached. Does not touch recency.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    /// Insert or update `key`.
    ///
    /// Returns the least-recently-used pair when a new key overflows the
    /// cache, or the previous value when `key` was already present.
    pub fn push(&mut self, key: K, value: V) -> Option<(K, V)> {
        self.entries.push(key, value)
    }

    /// Evict the least-recently-used entry.
    pub fn remove_one(&mut self) -> Option<(K, V)> {
        self.entries.pop_lru()
    }
}
