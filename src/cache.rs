//! In-process caches shared by the price and currency adapters.

use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::clock::{Clock, SystemClock};
use crate::duration::to_chrono;

/// Key/value cache whose entries expire `ttl` after insertion.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (DateTime<Utc>, V)>>,
    clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Clone + Send,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_fresh(&self, inserted_at: DateTime<Utc>) -> bool {
        self.clock.now() - inserted_at < to_chrono(self.ttl)
    }

    /// Fresh value for `key`. Expired entries are dropped on the way.
    pub async fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().await;
        if let Some((inserted_at, value)) = entries.get(key) {
            if self.is_fresh(*inserted_at) {
                return Some(value.clone());
            }
            entries.remove(key);
        }
        None
    }

    pub async fn insert(&self, key: K, value: V) {
        let now = self.clock.now();
        self.entries.lock().await.insert(key, (now, value));
    }

    pub async fn invalidate(&self, key: &K) {
        self.entries.lock().await.remove(key);
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Number of entries still fresh.
    pub async fn len(&self) -> usize {
        let entries = self.entries.lock().await;
        entries
            .values()
            .filter(|(inserted_at, _)| self.is_fresh(*inserted_at))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Per-key exclusion for expensive fetches.
///
/// A caller claims every key it is about to fetch; a second caller claiming an
/// overlapping key waits until the first releases it, then re-checks its cache
/// before fetching. Keys are always locked in sorted order so overlapping
/// claims cannot deadlock.
pub struct SingleFlight<K> {
    locks: std::sync::Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

/// Held while a claimed fetch is in progress. Dropping it releases the keys.
pub struct FlightGuard<K> {
    _guards: Vec<OwnedMutexGuard<()>>,
    keys: Vec<K>,
}

impl<K> FlightGuard<K> {
    pub fn keys(&self) -> &[K] {
        &self.keys
    }
}

impl<K> Default for SingleFlight<K> {
    fn default() -> Self {
        Self {
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }
}

impl<K> SingleFlight<K>
where
    K: Eq + Hash + Ord + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &K) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait until no other caller holds any of `keys`, then hold them all.
    pub async fn claim(&self, keys: impl IntoIterator<Item = K>) -> FlightGuard<K> {
        let keys: Vec<K> = keys.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.lock_for(key).lock_owned().await);
        }
        FlightGuard {
            _guards: guards,
            keys,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 2, 9, 30, 0).unwrap()));
        let cache: TtlCache<String, u32> =
            TtlCache::new(Duration::from_secs(15 * 60)).with_clock(clock.clone());

        cache.insert("XEQT".to_string(), 35).await;
        clock.advance(chrono::Duration::minutes(14));
        assert_eq!(cache.get(&"XEQT".to_string()).await, Some(35));

        clock.advance(chrono::Duration::minutes(2));
        assert_eq!(cache.get(&"XEQT".to_string()).await, None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let cache: TtlCache<&'static str, u32> = TtlCache::new(Duration::from_secs(60));
        cache.insert("a", 1).await;
        cache.insert("b", 2).await;
        cache.invalidate(&"a").await;
        assert_eq!(cache.get(&"a").await, None);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn overlapping_claims_fetch_once() {
        let flight: Arc<SingleFlight<String>> = Arc::new(SingleFlight::new());
        let cache: Arc<TtlCache<String, u32>> = Arc::new(TtlCache::new(Duration::from_secs(60)));
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let flight = flight.clone();
            let cache = cache.clone();
            let fetches = fetches.clone();
            tasks.push(tokio::spawn(async move {
                let key = "VFV".to_string();
                if let Some(v) = cache.get(&key).await {
                    return v;
                }
                let _guard = flight.claim([key.clone()]).await;
                if let Some(v) = cache.get(&key).await {
                    return v;
                }
                fetches.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                cache.insert(key, 7).await;
                7
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap(), 7);
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn claim_deduplicates_and_sorts_keys() {
        let flight: SingleFlight<&'static str> = SingleFlight::new();
        let guard = flight.claim(["b", "a", "b"]).await;
        assert_eq!(guard.keys(), &["a", "b"]);
    }
}
