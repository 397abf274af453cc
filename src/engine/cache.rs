use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use super::view::AggregationView;

/// Identifies one aggregation context: a business day plus an optional
/// identity filter (by identity id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    pub date: NaiveDate,
    pub identity: Option<String>,
}

impl CacheKey {
    pub fn new(date: NaiveDate, identity: Option<String>) -> Self {
        Self { date, identity }
    }
}

/// A published view and when its data was last fetched.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub view: Arc<AggregationView>,
    pub refreshed_at: DateTime<Utc>,
}

/// Past dates never go stale. Today (and any future date) is fresh for
/// `interval` after its last refresh.
pub fn is_fresh(
    date: NaiveDate,
    refreshed_at: DateTime<Utc>,
    today: NaiveDate,
    now: DateTime<Utc>,
    interval: Duration,
) -> bool {
    if date < today {
        return true;
    }
    match (now - refreshed_at).to_std() {
        Ok(age) => age < interval,
        // refreshed_at is in the future relative to now
        Err(_) => true,
    }
}

/// Bounded LRU of published views for one consumer view.
pub struct SnapshotCache {
    inner: Mutex<LruCache<CacheKey, CacheEntry>>,
    refresh_interval: Duration,
}

impl SnapshotCache {
    pub fn new(capacity: usize, refresh_interval: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            refresh_interval,
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.inner.lock().get(key).cloned()
    }

    /// Returns the entry for `key` only if it is still fresh.
    pub fn lookup_fresh(
        &self,
        key: &CacheKey,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Option<CacheEntry> {
        let mut guard = self.inner.lock();
        let entry = guard.get(key)?;
        is_fresh(key.date, entry.refreshed_at, today, now, self.refresh_interval)
            .then(|| entry.clone())
    }

    /// Stores a freshly fetched view.
    pub fn insert(&self, key: CacheKey, view: Arc<AggregationView>, refreshed_at: DateTime<Utc>) {
        self.inner.lock().put(key, CacheEntry { view, refreshed_at });
    }

    /// Swaps the view of an existing entry without touching its refresh
    /// time. Returns `false` if the key is not cached.
    pub fn replace_view(&self, key: &CacheKey, view: Arc<AggregationView>) -> bool {
        let mut guard = self.inner.lock();
        match guard.peek_mut(key) {
            Some(entry) => {
                entry.view = view;
                true
            }
            None => false,
        }
    }

    /// Rewrites the views cached for `date` through `f`, leaving refresh
    /// times and recency alone. `f` returns `None` to keep a view as is.
    /// Returns the number of views rewritten.
    pub fn update_date<F>(&self, date: NaiveDate, mut f: F) -> usize
    where
        F: FnMut(&CacheKey, &AggregationView) -> Option<Arc<AggregationView>>,
    {
        let mut guard = self.inner.lock();
        let mut updated = 0;
        for (key, entry) in guard.iter_mut() {
            if key.date != date {
                continue;
            }
            if let Some(view) = f(key, &entry.view) {
                entry.view = view;
                updated += 1;
            }
        }
        updated
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.inner.lock().pop(key).is_some()
    }

    /// Drops stale entries for today and later. Past-date entries are never
    /// touched. Returns the number of entries removed.
    pub fn evict_stale_today(&self, today: NaiveDate, now: DateTime<Utc>) -> usize {
        let mut guard = self.inner.lock();
        let stale: Vec<CacheKey> = guard
            .iter()
            .filter(|(key, entry)| {
                !is_fresh(key.date, entry.refreshed_at, today, now, self.refresh_interval)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            guard.pop(key);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
