//! Shared result cache with at-most-one in-flight fetch per key.
//!
//! All mutations go through one mutex. Request volume is human-interaction
//! scale, so a global lock is acceptable; it is never held across an await.

mod store;

pub use store::CacheEntry;

use crate::fingerprint::CacheKey;
use crate::tts::{SpeechAudio, TtsError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use store::{LruStore, PutOutcome};
use tokio::sync::watch;

const LOG_TARGET: &str = "tts::cache";

/// Outcome of one provider fetch, shared by the owner and every follower.
pub type FetchOutcome = Result<SpeechAudio, TtsError>;

type Slot = Option<FetchOutcome>;

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub resident_bytes: u64,
    pub capacity_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub coalesced: u64,
    pub pending: usize,
}

struct Inner {
    store: LruStore,
    pending: HashMap<CacheKey, watch::Sender<Slot>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    coalesced: u64,
}

pub struct ResultCache {
    inner: Mutex<Inner>,
}

/// Role handed to a caller that missed the cache.
pub enum FetchRole {
    /// The entry landed between the caller's lookup and this call.
    Cached(CacheEntry),
    /// The caller must perform the fetch and resolve the ticket.
    Owner(FetchTicket),
    /// Another caller is fetching; await its outcome.
    Follower(FetchWaiter),
}

impl ResultCache {
    pub fn new(capacity_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                store: LruStore::new(capacity_bytes),
                pending: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
                coalesced: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!(target: LOG_TARGET, "cache lock was poisoned; recovering and continuing");
                poisoned.into_inner()
            }
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let mut inner = self.lock();
        let found = inner.store.get(key, Instant::now());
        match found {
            Some(_) => inner.hits += 1,
            None => inner.misses += 1,
        }
        found
    }

    /// Inserts or replaces `key`. Returns whether the entry was retained.
    pub fn put(&self, key: CacheKey, audio: SpeechAudio) -> bool {
        let mut inner = self.lock();
        Self::store_locked(&mut inner, key, audio)
    }

    fn store_locked(inner: &mut Inner, key: CacheKey, audio: SpeechAudio) -> bool {
        let size = audio.len();
        match inner.store.put(key, audio, Instant::now()) {
            PutOutcome::Stored { evicted } => {
                if evicted > 0 {
                    inner.evictions += evicted as u64;
                    tracing::debug!(target: LOG_TARGET, key = %key.short(), evicted, "evicted to fit new entry");
                }
                true
            }
            PutOutcome::TooLarge => {
                tracing::warn!(
                    target: LOG_TARGET,
                    key = %key.short(),
                    size,
                    capacity = inner.store.capacity_bytes(),
                    "entry larger than cache capacity; not retained"
                );
                false
            }
            PutOutcome::Disabled => false,
        }
    }

    /// Claims the fetch for `key`, or joins the one already in flight.
    pub fn try_begin_fetch(self: &Arc<Self>, key: CacheKey) -> FetchRole {
        let mut inner = self.lock();
        if let Some(entry) = inner.store.get(&key, Instant::now()) {
            inner.hits += 1;
            return FetchRole::Cached(entry);
        }
        if let Some(sender) = inner.pending.get(&key) {
            let rx = sender.subscribe();
            inner.coalesced += 1;
            tracing::debug!(target: LOG_TARGET, key = %key.short(), "joining in-flight fetch");
            return FetchRole::Follower(FetchWaiter { key, rx });
        }
        let (tx, _rx) = watch::channel(None);
        inner.pending.insert(key, tx);
        FetchRole::Owner(FetchTicket {
            cache: Arc::clone(self),
            key,
            resolved: false,
        })
    }

    fn resolve_fetch(&self, key: &CacheKey, outcome: FetchOutcome) {
        let sender = {
            let mut inner = self.lock();
            if let Ok(audio) = &outcome {
                Self::store_locked(&mut inner, *key, audio.clone());
            }
            inner.pending.remove(key)
        };
        match sender {
            Some(tx) => {
                tx.send_replace(Some(outcome));
            }
            None => {
                tracing::warn!(target: LOG_TARGET, key = %key.short(), "resolved a fetch that was not pending");
            }
        }
    }

    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.lock().pending.contains_key(key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().store.contains(key)
    }

    /// Applies a new capacity; a shrink evicts before this returns.
    pub fn set_capacity(&self, capacity_bytes: u64) {
        let mut inner = self.lock();
        let evicted = inner.store.set_capacity(capacity_bytes);
        inner.evictions += evicted as u64;
        tracing::info!(target: LOG_TARGET, capacity_bytes, evicted, "cache capacity changed");
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.store.len(),
            resident_bytes: inner.store.resident_bytes(),
            capacity_bytes: inner.store.capacity_bytes(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            coalesced: inner.coalesced,
            pending: inner.pending.len(),
        }
    }
}

/// Ownership of an in-flight fetch.
///
/// Dropping an unresolved ticket resolves it as [`TtsError::Cancelled`], so
/// followers are never left waiting.
pub struct FetchTicket {
    cache: Arc<ResultCache>,
    key: CacheKey,
    resolved: bool,
}

impl FetchTicket {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Publishes the outcome: success is cached, failure is not. Every
    /// follower receives the same value.
    pub fn resolve(mut self, outcome: FetchOutcome) {
        self.resolved = true;
        self.cache.resolve_fetch(&self.key, outcome);
    }
}

impl Drop for FetchTicket {
    fn drop(&mut self) {
        if !self.resolved {
            tracing::debug!(target: LOG_TARGET, key = %self.key.short(), "fetch owner dropped without resolving");
            self.cache.resolve_fetch(&self.key, Err(TtsError::Cancelled));
        }
    }
}

pub struct FetchWaiter {
    key: CacheKey,
    rx: watch::Receiver<Slot>,
}

impl FetchWaiter {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Waits for the owner's outcome. Dropping the returned future only
    /// detaches this follower.
    pub async fn wait(mut self) -> FetchOutcome {
        match self.rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone().unwrap_or(Err(TtsError::Cancelled)),
            Err(_) => Err(TtsError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;
    use crate::tts::SynthesisRequest;
    use std::time::Duration;

    fn key(text: &str) -> CacheKey {
        fingerprint(&SynthesisRequest::new(text))
    }

    fn audio(tag: &str) -> SpeechAudio {
        SpeechAudio::new(tag.as_bytes().to_vec(), "audio/mpeg")
    }

    fn expect_owner(role: FetchRole) -> FetchTicket {
        match role {
            FetchRole::Owner(ticket) => ticket,
            _ => panic!("expected owner"),
        }
    }

    fn expect_follower(role: FetchRole) -> FetchWaiter {
        match role {
            FetchRole::Follower(waiter) => waiter,
            _ => panic!("expected follower"),
        }
    }

    #[tokio::test]
    async fn first_caller_owns_and_followers_share_success() {
        let cache = ResultCache::new(1024);
        let k = key("hello");
        let owner = expect_owner(cache.try_begin_fetch(k));
        let f1 = expect_follower(cache.try_begin_fetch(k));
        let f2 = expect_follower(cache.try_begin_fetch(k));
        assert!(cache.is_pending(&k));

        owner.resolve(Ok(audio("speech")));

        assert_eq!(f1.wait().await, Ok(audio("speech")));
        assert_eq!(f2.wait().await, Ok(audio("speech")));
        assert!(!cache.is_pending(&k));
        assert!(cache.contains(&k));
        assert_eq!(cache.stats().coalesced, 2);
    }

    #[tokio::test]
    async fn failure_propagates_and_is_not_cached() {
        let cache = ResultCache::new(1024);
        let k = key("hello");
        let owner = expect_owner(cache.try_begin_fetch(k));
        let follower = expect_follower(cache.try_begin_fetch(k));

        owner.resolve(Err(TtsError::Network("down".into())));

        assert_eq!(
            follower.wait().await,
            Err(TtsError::Network("down".into()))
        );
        assert!(!cache.contains(&k));
        assert!(!cache.is_pending(&k));
        // the next caller becomes a fresh owner
        assert!(matches!(cache.try_begin_fetch(k), FetchRole::Owner(_)));
    }

    #[tokio::test]
    async fn dropped_ticket_releases_followers() {
        let cache = ResultCache::new(1024);
        let k = key("hello");
        let owner = expect_owner(cache.try_begin_fetch(k));
        let follower = expect_follower(cache.try_begin_fetch(k));

        drop(owner);

        assert_eq!(follower.wait().await, Err(TtsError::Cancelled));
        assert!(!cache.is_pending(&k));
    }

    #[tokio::test]
    async fn follower_waits_until_owner_resolves() {
        let cache = ResultCache::new(1024);
        let k = key("slow");
        let owner = expect_owner(cache.try_begin_fetch(k));
        let follower = expect_follower(cache.try_begin_fetch(k));

        let handle = tokio::spawn(follower.wait());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        owner.resolve(Ok(audio("late")));
        assert_eq!(handle.await.expect("join"), Ok(audio("late")));
    }

    #[test]
    fn begin_fetch_reports_cached_entry() {
        let cache = ResultCache::new(1024);
        let k = key("hello");
        cache.put(k, audio("cached"));
        match cache.try_begin_fetch(k) {
            FetchRole::Cached(entry) => assert_eq!(entry.audio, audio("cached")),
            _ => panic!("expected cached entry"),
        }
        assert!(!cache.is_pending(&k));
    }

    #[tokio::test]
    async fn zero_capacity_still_coalesces_but_retains_nothing() {
        let cache = ResultCache::new(0);
        let k = key("hello");
        let owner = expect_owner(cache.try_begin_fetch(k));
        let follower = expect_follower(cache.try_begin_fetch(k));
        owner.resolve(Ok(audio("speech")));

        assert_eq!(follower.wait().await, Ok(audio("speech")));
        assert_eq!(cache.stats().entries, 0);
        assert!(cache.get(&k).is_none());
    }

    #[test]
    fn stats_track_hits_misses_and_evictions() {
        let cache = ResultCache::new(10);
        let (a, b) = (key("a"), key("b"));
        assert!(cache.get(&a).is_none());
        assert!(cache.put(a, audio("123456")));
        assert!(cache.get(&a).is_some());
        assert!(cache.put(b, audio("123456")));
        cache.set_capacity(0);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 2);
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.capacity_bytes, 0);
    }
}
