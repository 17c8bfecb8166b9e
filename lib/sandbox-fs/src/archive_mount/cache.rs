//! A process-wide cache of decompressed archive entries.
//!
//! Entries are kept in least-recently-used order. The cache is bounded by the
//! total length of the cached contents, and entries which haven't been read for
//! a while are dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Entries at least this large are never cached.
pub(crate) const LARGE_FILE_THRESHOLD: u64 = 1 << 20;

/// The total number of bytes the cache may hold.
pub(crate) const MAX_CACHE_WEIGHT: usize = 64 << 20;

pub(crate) const EXPIRE_AFTER_ACCESS: Duration = Duration::from_secs(60);

static CONTENTS_CACHE: Lazy<Mutex<ContentsCache>> =
    Lazy::new(|| Mutex::new(ContentsCache::new(MAX_CACHE_WEIGHT, EXPIRE_AFTER_ACCESS)));

pub(crate) fn contents_cache() -> &'static Mutex<ContentsCache> {
    &CONTENTS_CACHE
}

/// Identifies a single entry of a single open archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    pub archive: u64,
    pub entry: usize,
}

#[derive(Debug)]
struct Cached {
    contents: Arc<[u8]>,
    last_access: Instant,
}

#[derive(Debug)]
pub(crate) struct ContentsCache {
    entries: IndexMap<CacheKey, Cached>,
    weight: usize,
    max_weight: usize,
    expire_after: Duration,
}

impl ContentsCache {
    pub(crate) fn new(max_weight: usize, expire_after: Duration) -> Self {
        ContentsCache {
            entries: IndexMap::new(),
            weight: 0,
            max_weight,
            expire_after,
        }
    }

    pub(crate) fn get(&mut self, key: CacheKey, now: Instant) -> Option<Arc<[u8]>> {
        self.evict_expired(now);

        // Re-inserting moves the entry to the most recently used end.
        let mut cached = self.entries.shift_remove(&key)?;
        cached.last_access = now;
        let contents = cached.contents.clone();
        self.entries.insert(key, cached);
        Some(contents)
    }

    pub(crate) fn insert(&mut self, key: CacheKey, contents: Arc<[u8]>, now: Instant) {
        self.evict_expired(now);
        if contents.len() > self.max_weight {
            return;
        }

        if let Some(old) = self.entries.shift_remove(&key) {
            self.weight -= old.contents.len();
        }
        self.weight += contents.len();
        self.entries.insert(
            key,
            Cached {
                contents,
                last_access: now,
            },
        );

        while self.weight > self.max_weight {
            let Some((key, evicted)) = self.entries.shift_remove_index(0) else {
                break;
            };
            self.weight -= evicted.contents.len();
            tracing::debug!(archive = key.archive, entry = key.entry, "Evicted cached archive entry");
        }
    }

    /// Drop everything cached for one archive.
    pub(crate) fn invalidate_archive(&mut self, archive: u64) {
        let mut released = 0;
        self.entries.retain(|key, cached| {
            let keep = key.archive != archive;
            if !keep {
                released += cached.contents.len();
            }
            keep
        });
        self.weight -= released;
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some((_, oldest)) = self.entries.first() {
            if now.saturating_duration_since(oldest.last_access) < self.expire_after {
                break;
            }
            if let Some((key, expired)) = self.entries.shift_remove_index(0) {
                self.weight -= expired.contents.len();
                tracing::debug!(archive = key.archive, entry = key.entry, "Expired cached archive entry");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn weight(&self) -> usize {
        self.weight
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(archive: u64, entry: usize) -> CacheKey {
        CacheKey { archive, entry }
    }

    fn bytes(len: usize) -> Arc<[u8]> {
        vec![0u8; len].into()
    }

    #[test]
    fn least_recently_used_is_evicted_first() {
        let mut cache = ContentsCache::new(100, Duration::from_secs(60));
        let now = Instant::now();

        cache.insert(key(1, 0), bytes(40), now);
        cache.insert(key(1, 1), bytes(40), now);
        assert!(cache.get(key(1, 0), now).is_some());

        cache.insert(key(1, 2), bytes(40), now);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.weight(), 80);
        assert!(cache.get(key(1, 1), now).is_none(), "entry 1 was least recently used");
        assert!(cache.get(key(1, 0), now).is_some());
        assert!(cache.get(key(1, 2), now).is_some());
    }

    #[test]
    fn oversized_entries_are_not_cached() {
        let mut cache = ContentsCache::new(100, Duration::from_secs(60));
        cache.insert(key(1, 0), bytes(101), Instant::now());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.weight(), 0);
    }

    #[test]
    #[tracing_test::traced_test]
    fn entries_expire_after_access() {
        let mut cache = ContentsCache::new(100, Duration::from_secs(60));
        let start = Instant::now();

        cache.insert(key(1, 0), bytes(10), start);
        cache.insert(key(1, 1), bytes(10), start);
        assert!(cache.get(key(1, 0), start + Duration::from_secs(30)).is_some());

        let later = start + Duration::from_secs(70);
        assert!(cache.get(key(1, 0), later).is_some(), "read 40s ago");
        assert!(cache.get(key(1, 1), later).is_none(), "read 70s ago");
        assert_eq!(cache.weight(), 10);
        assert!(logs_contain("Expired cached archive entry"));
    }

    #[test]
    fn invalidating_an_archive() {
        let mut cache = ContentsCache::new(100, Duration::from_secs(60));
        let now = Instant::now();

        cache.insert(key(1, 0), bytes(10), now);
        cache.insert(key(2, 0), bytes(20), now);
        cache.insert(key(1, 1), bytes(30), now);

        cache.invalidate_archive(1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.weight(), 20);
        assert!(cache.get(key(2, 0), now).is_some());
    }
}
