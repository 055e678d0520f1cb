//! Capacity and TTL bounded cache used for retained circuits and paused state.
//!
//! Eviction is insertion ordered, never LRU: reading an entry does not make it
//! younger. Expiry is enforced by a background sweeper so abandoned entries are
//! torn down even if nothing ever touches the cache again. The eviction
//! callback always runs after the internal lock has been released, so it may
//! call back into the cache.

use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionReason {
    Removed,
    Replaced,
    Expired,
    Capacity,
}

impl EvictionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EvictionReason::Removed => "removed",
            EvictionReason::Replaced => "replaced",
            EvictionReason::Expired => "expired",
            EvictionReason::Capacity => "capacity",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Maximum total cost of all entries.
    pub capacity: usize,
    pub ttl: Duration,
    pub scan_interval: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            capacity: 100,
            ttl: Duration::from_secs(180),
            scan_interval: Duration::from_secs(1),
        }
    }
}

pub type EvictionCallback<K, V> = Arc<dyn Fn(K, V, EvictionReason) + Send + Sync>;

struct Entry<V> {
    value: V,
    cost: usize,
    expires_at: Instant,
    seq: u64,
}

struct CacheState<K, V> {
    entries: HashMap<K, Entry<V>>,
    insertion_order: BTreeMap<u64, K>,
    total_cost: usize,
    next_seq: u64,
}

impl<K, V> CacheState<K, V>
where
    K: Eq + Hash + Clone,
{
    fn take<Q>(&mut self, key: &Q) -> Option<(K, Entry<V>)>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let (key, entry) = self.entries.remove_entry(key)?;
        self.insertion_order.remove(&entry.seq);
        self.total_cost -= entry.cost;
        Some((key, entry))
    }

    fn take_oldest(&mut self) -> Option<(K, Entry<V>)> {
        let (_, key) = self.insertion_order.pop_first()?;
        let entry = self.entries.remove(&key)?;
        self.total_cost -= entry.cost;
        Some((key, entry))
    }
}

struct CacheInner<K, V> {
    state: Mutex<CacheState<K, V>>,
    options: CacheOptions,
    on_evict: EvictionCallback<K, V>,
    name: &'static str,
}

impl<K, V> CacheInner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn purge_expired(&self, now: Instant) -> usize {
        let expired: Vec<(K, V, EvictionReason)> = {
            let mut state = self.state.lock();
            let keys: Vec<K> = state
                .insertion_order
                .values()
                .filter(|key| {
                    state
                        .entries
                        .get(*key)
                        .is_some_and(|entry| entry.expires_at <= now)
                })
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| state.take(&key))
                .map(|(key, entry)| (key, entry.value, EvictionReason::Expired))
                .collect()
        };
        let count = expired.len();
        if count > 0 {
            debug!(
                target = "circuit_host::cache",
                cache = self.name,
                count,
                "expired cache entries"
            );
        }
        self.dispatch(expired);
        count
    }

    fn dispatch(&self, evicted: Vec<(K, V, EvictionReason)>) {
        for (key, value, reason) in evicted {
            trace!(
                target = "circuit_host::cache",
                cache = self.name,
                reason = reason.as_str(),
                "evicting cache entry"
            );
            (self.on_evict)(key, value, reason);
        }
    }
}

pub struct EvictionCache<K, V> {
    inner: Arc<CacheInner<K, V>>,
    sweeper: JoinHandle<()>,
}

impl<K, V> EvictionCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates the cache and starts its expiry sweeper on the current runtime.
    pub fn new(name: &'static str, options: CacheOptions, on_evict: EvictionCallback<K, V>) -> Self {
        let scan_interval = options.scan_interval.max(Duration::from_millis(1));
        let inner = Arc::new(CacheInner {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                insertion_order: BTreeMap::new(),
                total_cost: 0,
                next_seq: 0,
            }),
            options,
            on_evict,
            name,
        });
        let sweeper = spawn_sweeper(Arc::downgrade(&inner), scan_interval);
        Self { inner, sweeper }
    }

    pub fn options(&self) -> &CacheOptions {
        &self.inner.options
    }

    pub fn set(&self, key: K, value: V, cost: usize) {
        self.set_with_ttl(key, value, cost, self.inner.options.ttl);
    }

    pub fn set_with_ttl(&self, key: K, value: V, cost: usize, ttl: Duration) {
        let capacity = self.inner.options.capacity;
        let mut evicted = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if let Some((old_key, old)) = state.take(&key) {
                evicted.push((old_key, old.value, EvictionReason::Replaced));
            }
            if cost > capacity {
                evicted.push((key, value, EvictionReason::Capacity));
            } else {
                while state.total_cost + cost > capacity {
                    match state.take_oldest() {
                        Some((old_key, old)) => {
                            evicted.push((old_key, old.value, EvictionReason::Capacity))
                        }
                        None => break,
                    }
                }
                let seq = state.next_seq;
                state.next_seq += 1;
                state.insertion_order.insert(seq, key.clone());
                state.total_cost += cost;
                state.entries.insert(
                    key,
                    Entry {
                        value,
                        cost,
                        expires_at: Instant::now() + ttl,
                        seq,
                    },
                );
            }
        }
        self.inner.dispatch(evicted);
    }

    /// Looks up a live entry without touching its expiry.
    pub fn try_get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let state = self.inner.state.lock();
        state
            .entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone())
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.try_get(key).is_some()
    }

    /// Removes `key` and returns its value. An entry already past its expiry is
    /// evicted as expired instead and `None` is returned.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let (key, entry) = self.inner.state.lock().take(key)?;
        if entry.expires_at <= Instant::now() {
            self.inner
                .dispatch(vec![(key, entry.value, EvictionReason::Expired)]);
            return None;
        }
        let value = entry.value.clone();
        self.inner
            .dispatch(vec![(key, entry.value, EvictionReason::Removed)]);
        Some(value)
    }

    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired(Instant::now())
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_cost(&self) -> usize {
        self.inner.state.lock().total_cost
    }
}

impl<K, V> Drop for EvictionCache<K, V> {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

fn spawn_sweeper<K, V>(inner: Weak<CacheInner<K, V>>, interval: Duration) -> JoinHandle<()>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.purge_expired(Instant::now());
        }
    })
}
