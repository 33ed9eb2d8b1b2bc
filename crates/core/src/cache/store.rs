//! Byte-bounded least-recently-used store.
//!
//! Recency is tracked by `lru::LruCache`; this layer adds the byte budget.
//! An entry never touched since insertion is evicted before anything
//! inserted or read after it.

use crate::fingerprint::CacheKey;
use crate::tts::SpeechAudio;
use lru::LruCache;
use std::time::Instant;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub audio: SpeechAudio,
    pub size_bytes: u64,
    pub inserted_at: Instant,
    pub last_accessed_at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PutOutcome {
    Stored { evicted: usize },
    /// Larger than the whole capacity; returned to the caller but not kept.
    TooLarge,
    /// Capacity is zero.
    Disabled,
}

pub(crate) struct LruStore {
    entries: LruCache<CacheKey, CacheEntry>,
    resident_bytes: u64,
    capacity_bytes: u64,
}

impl LruStore {
    pub(crate) fn new(capacity_bytes: u64) -> Self {
        Self {
            entries: LruCache::unbounded(),
            resident_bytes: 0,
            capacity_bytes,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn resident_bytes(&self) -> u64 {
        self.resident_bytes
    }

    pub(crate) fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub(crate) fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains(key)
    }

    pub(crate) fn get(&mut self, key: &CacheKey, now: Instant) -> Option<CacheEntry> {
        let entry = self.entries.get_mut(key)?;
        entry.last_accessed_at = now;
        Some(entry.clone())
    }

    pub(crate) fn put(&mut self, key: CacheKey, audio: SpeechAudio, now: Instant) -> PutOutcome {
        if let Some(old) = self.entries.pop(&key) {
            self.resident_bytes -= old.size_bytes;
        }
        if self.capacity_bytes == 0 {
            return PutOutcome::Disabled;
        }
        let size_bytes = audio.len() as u64;
        if size_bytes > self.capacity_bytes {
            return PutOutcome::TooLarge;
        }

        let evicted = self.evict_until(self.capacity_bytes - size_bytes);
        self.entries.push(
            key,
            CacheEntry {
                key,
                audio,
                size_bytes,
                inserted_at: now,
                last_accessed_at: now,
            },
        );
        self.resident_bytes += size_bytes;
        PutOutcome::Stored { evicted }
    }

    /// Applies a new capacity, evicting immediately if it shrank.
    pub(crate) fn set_capacity(&mut self, capacity_bytes: u64) -> usize {
        self.capacity_bytes = capacity_bytes;
        self.evict_until(capacity_bytes)
    }

    fn evict_until(&mut self, limit_bytes: u64) -> usize {
        let mut evicted = 0;
        while self.resident_bytes > limit_bytes {
            let Some((_, entry)) = self.entries.pop_lru() else {
                break;
            };
            self.resident_bytes -= entry.size_bytes;
            evicted += 1;
        }
        evicted
    }
}
