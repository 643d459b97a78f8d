//! Reference-counted payload store
//!
//! Large or optional payloads are stored once and travel through the bus as
//! a [`DataRef`]. Consumers get an `Arc` to the payload; an entry whose
//! payload is still held by a consumer is never chosen for LRU eviction.

use super::config::{CacheConfig, EvictionPolicy};
use crate::messages::{Content, DataRef};
use crate::{MurmurError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Key/value tags attached to an entry for lookup
pub type Tags = BTreeMap<String, String>;

/// Length of the hex token handed out as a [`DataRef`]
const REF_LEN: usize = 16;

/// A single stored payload
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: Arc<Content>,
    pub size: usize,
    pub created_at: Instant,
    pub ttl: Duration,
    pub tags: Tags,
    pub access_count: u64,
    pub last_access_at: Instant,
    /// Position in the LRU order, larger is more recent
    access_tick: u64,
}

impl CacheEntry {
    pub fn expires_at(&self) -> Instant {
        self.created_at + self.ttl
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at()
    }

    /// A consumer still holds the payload
    pub fn is_held(&self) -> bool {
        Arc::strong_count(&self.data) > 1
    }
}

/// Counters reported by [`DataCache::stats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries removed to free capacity
    pub evictions: u64,
    /// Entries removed because their TTL elapsed
    pub expirations: u64,
    pub entries: usize,
    pub size_bytes: usize,
    pub max_entries: usize,
    pub max_size_bytes: usize,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<DataRef, CacheEntry>,
    lru: BTreeMap<u64, DataRef>,
    last_tick: u64,
    total_size: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl CacheInner {
    fn next_tick(&mut self) -> u64 {
        self.last_tick += 1;
        self.last_tick
    }

    fn remove(&mut self, data_ref: &DataRef) -> Option<CacheEntry> {
        let entry = self.entries.remove(data_ref)?;
        self.lru.remove(&entry.access_tick);
        self.total_size = self.total_size.saturating_sub(entry.size);
        Some(entry)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<DataRef> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(data_ref, _)| data_ref.clone())
            .collect();

        for data_ref in &expired {
            self.remove(data_ref);
        }
        self.expirations += expired.len() as u64;
        expired.len()
    }

    fn fits(&self, size: usize, config: &CacheConfig) -> bool {
        self.entries.len() < config.max_entries
            && self.total_size + size <= config.max_size_bytes
    }

    /// Evict least-recently-used, unheld entries until `size` fits
    fn evict_lru(&mut self, size: usize, config: &CacheConfig) -> bool {
        while !self.fits(size, config) {
            let victim = self
                .lru
                .values()
                .find(|data_ref| {
                    self.entries
                        .get(*data_ref)
                        .map(|entry| !entry.is_held())
                        .unwrap_or(true)
                })
                .cloned();

            match victim {
                Some(data_ref) => {
                    if let Some(entry) = self.remove(&data_ref) {
                        debug!(data_ref = %data_ref, size = entry.size, "Evicted LRU cache entry");
                    }
                    self.evictions += 1;
                }
                // Everything left is held by a consumer
                None => return false,
            }
        }
        true
    }

    fn capacity_error(&self, size: usize, config: &CacheConfig) -> MurmurError {
        if self.entries.len() >= config.max_entries {
            MurmurError::CacheCapacity {
                required: self.entries.len() + 1,
                limit: config.max_entries,
            }
        } else {
            MurmurError::CacheCapacity {
                required: self.total_size + size,
                limit: config.max_size_bytes,
            }
        }
    }
}

/// Derive a short opaque token for a payload
///
/// Mixes the payload kind and size, the raw content for text and byte
/// payloads, and a random component, so equal structured payloads never
/// collide on their string form.
fn derive_ref(data: &Content) -> DataRef {
    let mut hasher = Sha256::new();
    hasher.update(data.kind().as_bytes());
    hasher.update((data.size() as u64).to_le_bytes());
    match data {
        Content::Bytes(bytes) => hasher.update(bytes),
        Content::Text(text) => hasher.update(text.as_bytes()),
        Content::Json(_) | Content::Empty => {}
    }
    hasher.update(Uuid::new_v4().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    DataRef::new(&digest[..REF_LEN])
}

/// Bounded, TTL-governed payload cache
///
/// All operations go through one mutex; none of them await while holding it.
#[derive(Debug)]
pub struct DataCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl Default for DataCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl DataCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Store a payload and return its ref
    ///
    /// Frees room according to the eviction policy first. Fails with
    /// [`MurmurError::CacheCapacity`] when the payload can never fit or the
    /// policy could not free enough.
    pub fn store(
        &self,
        data: impl Into<Content>,
        ttl: Option<Duration>,
        tags: Option<Tags>,
    ) -> Result<DataRef> {
        let data = data.into();
        let size = data.size();

        if size > self.config.max_size_bytes {
            warn!(
                size,
                limit = self.config.max_size_bytes,
                "Payload larger than the whole cache, rejecting"
            );
            return Err(MurmurError::CacheCapacity {
                required: size,
                limit: self.config.max_size_bytes,
            });
        }

        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if !inner.fits(size, &self.config) {
            let freed = match self.config.eviction_policy {
                EvictionPolicy::ExpireOnly => {
                    inner.purge_expired(now);
                    inner.fits(size, &self.config)
                }
                EvictionPolicy::LruOnly => inner.evict_lru(size, &self.config),
                EvictionPolicy::ExpireThenLru => {
                    inner.purge_expired(now);
                    inner.fits(size, &self.config) || inner.evict_lru(size, &self.config)
                }
            };

            if !freed {
                let err = inner.capacity_error(size, &self.config);
                warn!("Cache store rejected: {}", err);
                return Err(err);
            }
        }

        let data_ref = loop {
            let candidate = derive_ref(&data);
            if !inner.entries.contains_key(&candidate) {
                break candidate;
            }
        };

        let tick = inner.next_tick();
        inner.lru.insert(tick, data_ref.clone());
        inner.total_size += size;
        inner.entries.insert(
            data_ref.clone(),
            CacheEntry {
                data: Arc::new(data),
                size,
                created_at: now,
                ttl,
                tags: tags.unwrap_or_default(),
                access_count: 0,
                last_access_at: now,
                access_tick: tick,
            },
        );

        debug!(data_ref = %data_ref, size, ttl_ms = ttl.as_millis() as u64, "Stored cache entry");
        Ok(data_ref)
    }

    /// Dereference a ref
    ///
    /// Absent and expired entries are both [`MurmurError::CacheNotFound`].
    pub fn retrieve(&self, data_ref: &DataRef) -> Result<Arc<Content>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(data_ref) {
            Some(entry) => entry.is_expired(now),
            None => {
                inner.misses += 1;
                return Err(MurmurError::CacheNotFound {
                    data_ref: data_ref.to_string(),
                });
            }
        };

        if expired {
            inner.remove(data_ref);
            inner.expirations += 1;
            inner.misses += 1;
            debug!(data_ref = %data_ref, "Cache entry expired on access");
            return Err(MurmurError::CacheNotFound {
                data_ref: data_ref.to_string(),
            });
        }

        let tick = inner.next_tick();
        let data = {
            let CacheInner { entries, lru, .. } = &mut *inner;
            match entries.get_mut(data_ref) {
                Some(entry) => {
                    lru.remove(&entry.access_tick);
                    lru.insert(tick, data_ref.clone());
                    entry.access_tick = tick;
                    entry.access_count += 1;
                    entry.last_access_at = now;
                    Some(Arc::clone(&entry.data))
                }
                None => None,
            }
        };

        match data {
            Some(data) => {
                inner.hits += 1;
                Ok(data)
            }
            None => {
                inner.misses += 1;
                Err(MurmurError::CacheNotFound {
                    data_ref: data_ref.to_string(),
                })
            }
        }
    }

    /// Remove an entry; returns whether it existed
    pub fn delete(&self, data_ref: &DataRef) -> bool {
        self.inner.lock().remove(data_ref).is_some()
    }

    /// Check if a live entry exists, without counting a hit or miss
    pub fn contains(&self, data_ref: &DataRef) -> bool {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .get(data_ref)
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false)
    }

    /// Restart an entry's TTL, optionally with a new duration
    pub fn touch(&self, data_ref: &DataRef, ttl: Option<Duration>) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(data_ref) {
            Some(entry) if !entry.is_expired(now) => {
                entry.created_at = now;
                if let Some(ttl) = ttl {
                    entry.ttl = ttl;
                }
                Ok(())
            }
            _ => Err(MurmurError::CacheNotFound {
                data_ref: data_ref.to_string(),
            }),
        }
    }

    /// Refs of live entries carrying every given tag, oldest first
    pub fn find_by_tags(&self, tags: &Tags) -> Vec<DataRef> {
        let now = Instant::now();
        let inner = self.inner.lock();
        let mut matches: Vec<(&DataRef, &CacheEntry)> = inner
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .filter(|(_, entry)| {
                tags.iter()
                    .all(|(key, value)| entry.tags.get(key) == Some(value))
            })
            .collect();
        matches.sort_by_key(|(_, entry)| entry.created_at);
        matches
            .into_iter()
            .map(|(data_ref, _)| data_ref.clone())
            .collect()
    }

    /// Drop every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        self.inner.lock().purge_expired(Instant::now())
    }

    /// Remove all entries, keeping counters
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.lru.clear();
        inner.total_size = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            entries: inner.entries.len(),
            size_bytes: inner.total_size,
            max_entries: self.config.max_entries,
            max_size_bytes: self.config.max_size_bytes,
        }
    }

    /// Spawn the periodic expiry sweep
    ///
    /// The task holds only a weak reference and stops when the cache is
    /// dropped or `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        let period = self.config.sweep_interval();

        tokio::spawn(async move {
            info!("Cache sweeper started (every {:?})", period);
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else { break };
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            debug!("Cache sweep purged {} expired entries", purged);
                        }
                    }
                }
            }

            info!("Cache sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cache(max_entries: usize, policy: EvictionPolicy) -> DataCache {
        DataCache::new(
            CacheConfig::default()
                .with_max_entries(max_entries)
                .with_policy(policy),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrieve_before_and_after_ttl() {
        let cache = DataCache::default();
        let data_ref = cache
            .store(b"abc".to_vec(), Some(Duration::from_secs(1)), None)
            .unwrap();

        tokio::time::advance(Duration::from_millis(500)).await;
        let data = cache.retrieve(&data_ref).unwrap();
        assert_eq!(data.as_bytes(), Some(&b"abc"[..]));

        tokio::time::advance(Duration::from_millis(1500)).await;
        let err = cache.retrieve(&data_ref).unwrap_err();
        assert!(matches!(err, MurmurError::CacheNotFound { .. }));
    }

    #[test]
    fn test_unknown_ref_is_not_found() {
        let cache = DataCache::default();
        let err = cache.retrieve(&DataRef::new("nope")).unwrap_err();
        assert_eq!(
            err,
            MurmurError::CacheNotFound {
                data_ref: "nope".into()
            }
        );
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_same_payload_gets_distinct_refs() {
        let cache = DataCache::default();
        let a = cache.store("same", None, None).unwrap();
        let b = cache.store("same", None, None).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), REF_LEN);

        let json = serde_json::json!({"user": "x"});
        let c = cache.store(json.clone(), None, None).unwrap();
        let d = cache.store(json, None, None).unwrap();
        assert_ne!(c, d);
    }

    #[test]
    fn test_lru_evicts_least_recent() {
        let cache = small_cache(2, EvictionPolicy::LruOnly);
        let a = cache.store("a", None, None).unwrap();
        let b = cache.store("b", None, None).unwrap();

        // Touch a so b becomes least recent
        drop(cache.retrieve(&a).unwrap());
        let c = cache.store("c", None, None).unwrap();

        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_held_entry_is_not_evicted() {
        let cache = small_cache(2, EvictionPolicy::LruOnly);
        let a = cache.store("a", None, None).unwrap();
        let b = cache.store("b", None, None).unwrap();

        // a is least recent but still held
        let held = cache.retrieve(&a).unwrap();
        drop(cache.retrieve(&b).unwrap());

        let _c = cache.store("c", None, None).unwrap();
        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert_eq!(held.as_text(), Some("a"));
    }

    #[test]
    fn test_all_entries_held_rejects_store() {
        let cache = small_cache(1, EvictionPolicy::LruOnly);
        let a = cache.store("a", None, None).unwrap();
        let _held = cache.retrieve(&a).unwrap();

        let err = cache.store("b", None, None).unwrap_err();
        assert!(matches!(err, MurmurError::CacheCapacity { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_then_lru_prefers_expired() {
        let cache = small_cache(2, EvictionPolicy::ExpireThenLru);
        let short = cache
            .store("short", Some(Duration::from_secs(1)), None)
            .unwrap();
        let long = cache.store("long", None, None).unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        let fresh = cache.store("fresh", None, None).unwrap();

        assert!(!cache.contains(&short));
        assert!(cache.contains(&long));
        assert!(cache.contains(&fresh));

        let stats = cache.stats();
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.expirations, 1);
    }

    #[test]
    fn test_expire_only_rejects_when_full() {
        let cache = small_cache(1, EvictionPolicy::ExpireOnly);
        cache.store("a", None, None).unwrap();
        let err = cache.store("b", None, None).unwrap_err();
        assert_eq!(
            err,
            MurmurError::CacheCapacity {
                required: 2,
                limit: 1
            }
        );
    }

    #[test]
    fn test_size_ceiling() {
        let cache = DataCache::new(CacheConfig::default().with_max_size_bytes(8));
        let err = cache.store(vec![0u8; 9], None, None).unwrap_err();
        assert!(matches!(err, MurmurError::CacheCapacity { required: 9, limit: 8 }));

        let a = cache.store(vec![0u8; 5], None, None).unwrap();
        let b = cache.store(vec![1u8; 5], None, None).unwrap();
        assert!(!cache.contains(&a));
        assert!(cache.contains(&b));
        assert_eq!(cache.stats().size_bytes, 5);
    }

    #[test]
    fn test_find_by_tags() {
        let cache = DataCache::default();
        let mut image_tags = Tags::new();
        image_tags.insert("kind".into(), "image".into());
        image_tags.insert("source".into(), "bili".into());
        let mut audio_tags = Tags::new();
        audio_tags.insert("kind".into(), "audio".into());

        let image = cache.store(vec![1, 2, 3], None, Some(image_tags)).unwrap();
        cache.store(vec![4, 5], None, Some(audio_tags)).unwrap();

        let mut query = Tags::new();
        query.insert("kind".into(), "image".into());
        assert_eq!(cache.find_by_tags(&query), vec![image]);

        query.insert("source".into(), "other".into());
        assert!(cache.find_by_tags(&query).is_empty());
    }

    #[test]
    fn test_delete_and_stats() {
        let cache = DataCache::default();
        let a = cache.store("abc", None, None).unwrap();
        drop(cache.retrieve(&a).unwrap());

        assert!(cache.delete(&a));
        assert!(!cache.delete(&a));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.size_bytes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_extends_ttl() {
        let cache = DataCache::default();
        let a = cache.store("abc", Some(Duration::from_secs(1)), None).unwrap();

        tokio::time::advance(Duration::from_millis(800)).await;
        cache.touch(&a, None).unwrap();
        tokio::time::advance(Duration::from_millis(800)).await;
        assert!(cache.retrieve(&a).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_without_access() {
        let cache = Arc::new(DataCache::new(
            CacheConfig::default().with_sweep_interval(Duration::from_secs(1)),
        ));
        let cancel = CancellationToken::new();
        let sweeper = cache.spawn_sweeper(cancel.clone());

        cache.store("abc", Some(Duration::from_secs(1)), None).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.expirations, 1);

        cancel.cancel();
        sweeper.await.unwrap();
    }
}
