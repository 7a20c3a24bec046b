//! TTL caches with lazily enforced expiry.
//!
//! Readers compare `expires_at` against the clock on every `get`, so an
//! expired entry is never served whether or not its timer has fired. The
//! timer only reclaims memory, and it is registered with the shared
//! [`TimerRegistry`] so shutdown can cancel it.

use std::{collections::HashMap, hash::Hash, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::timer::{TimerHandle, TimerRegistry};

struct CacheEntry<V> {
  value:      V,
  expires_at: Instant,
  timer:      Option<TimerHandle>,
  /// Bumped on every `set` so a stale timer cannot evict a newer value.
  generation: u64,
}

struct State<K, V> {
  entries:    HashMap<K, CacheEntry<V>>,
  generation: u64,
}

/// A map from key to `(value, expires_at)`. Cloning shares the entries.
pub struct TtlCache<K, V> {
  state:       Arc<Mutex<State<K, V>>>,
  timers:      TimerRegistry,
  default_ttl: Duration,
  max_entries: usize,
}

impl<K, V> Clone for TtlCache<K, V> {
  fn clone(&self) -> Self {
    Self {
      state:       Arc::clone(&self.state),
      timers:      self.timers.clone(),
      default_ttl: self.default_ttl,
      max_entries: self.max_entries,
    }
  }
}

impl<K, V> TtlCache<K, V>
where
  K: Eq + Hash + Clone + Send + 'static,
  V: Clone + Send + 'static,
{
  pub fn new(timers: TimerRegistry, default_ttl: Duration, max_entries: usize) -> Self {
    Self {
      state: Arc::new(Mutex::new(State { entries: HashMap::new(), generation: 0 })),
      timers,
      default_ttl,
      max_entries: max_entries.max(1),
    }
  }

  pub fn default_ttl(&self) -> Duration { self.default_ttl }

  /// The live value for `key`. Expired entries are removed and reported as a
  /// miss.
  pub fn get(&self, key: &K) -> Option<V> {
    let mut state = self.state.lock();
    let entry = state.entries.get(key)?;
    if entry.expires_at > Instant::now() {
      return Some(entry.value.clone());
    }
    if let Some(stale) = state.entries.remove(key)
      && let Some(timer) = stale.timer
    {
      timer.cancel();
    }
    None
  }

  /// Store `value` for `ttl`. A zero `ttl` stores nothing.
  pub fn set(&self, key: K, value: V, ttl: Duration) {
    if ttl.is_zero() {
      self.invalidate(&key);
      return;
    }
    let expires_at = Instant::now() + ttl;

    let mut state = self.state.lock();
    state.generation += 1;
    let generation = state.generation;

    if !state.entries.contains_key(&key) && state.entries.len() >= self.max_entries {
      evict_one(&mut state.entries);
    }

    let weak = Arc::downgrade(&self.state);
    let timer_key = key.clone();
    let timer = self.timers.schedule(ttl, move || {
      let Some(state) = weak.upgrade() else { return };
      let mut state = state.lock();
      if state.entries.get(&timer_key).is_some_and(|e| e.generation == generation) {
        state.entries.remove(&timer_key);
      }
    });

    let previous = state
      .entries
      .insert(key, CacheEntry { value, expires_at, timer, generation });
    drop(state);

    if let Some(previous) = previous
      && let Some(timer) = previous.timer
    {
      timer.cancel();
    }
  }

  /// [`set`](Self::set) with the cache's default TTL.
  pub fn insert(&self, key: K, value: V) { self.set(key, value, self.default_ttl) }

  pub fn invalidate(&self, key: &K) -> bool {
    let removed = self.state.lock().entries.remove(key);
    match removed {
      Some(entry) => {
        if let Some(timer) = entry.timer {
          timer.cancel();
        }
        true
      }
      None => false,
    }
  }

  /// Drop every entry whose key matches `pred`. Returns how many were
  /// dropped.
  pub fn invalidate_where(&self, mut pred: impl FnMut(&K) -> bool) -> usize {
    let mut count = 0;
    let mut timers = Vec::new();
    self.state.lock().entries.retain(|k, entry| {
      if pred(k) {
        count += 1;
        timers.extend(entry.timer.take());
        false
      } else {
        true
      }
    });
    for timer in timers {
      timer.cancel();
    }
    count
  }

  pub fn clear(&self) {
    let drained: Vec<_> = self.state.lock().entries.drain().collect();
    for (_, entry) in drained {
      if let Some(timer) = entry.timer {
        timer.cancel();
      }
    }
  }

  /// Physically present entries, including expired ones not yet reclaimed.
  pub fn len(&self) -> usize { self.state.lock().entries.len() }

  pub fn is_empty(&self) -> bool { self.len() == 0 }
}

/// Make room for one entry: drop everything already expired, or failing
/// that the entry closest to expiry.
fn evict_one<K: Eq + Hash + Clone, V>(entries: &mut HashMap<K, CacheEntry<V>>) {
  let now = Instant::now();
  let before = entries.len();
  entries.retain(|_, e| {
    let live = e.expires_at > now;
    if !live && let Some(timer) = &e.timer {
      timer.cancel();
    }
    live
  });
  if entries.len() < before {
    return;
  }

  let oldest = entries
    .iter()
    .min_by_key(|(_, e)| e.expires_at)
    .map(|(k, _)| k.clone());
  if let Some(key) = oldest
    && let Some(entry) = entries.remove(&key)
    && let Some(timer) = entry.timer
  {
    timer.cancel();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn cache(max_entries: usize) -> (TimerRegistry, TtlCache<String, u32>) {
    let timers = TimerRegistry::new();
    let cache = TtlCache::new(timers.clone(), Duration::from_secs(60), max_entries);
    (timers, cache)
  }

  #[tokio::test]
  async fn get_returns_live_value() {
    let (_, cache) = cache(8);
    cache.insert("a".into(), 1);
    assert_eq!(cache.get(&"a".to_string()), Some(1));
    assert_eq!(cache.get(&"b".to_string()), None);
  }

  #[tokio::test]
  async fn expired_entry_is_a_miss_even_without_timers() {
    let (timers, cache) = cache(8);
    // With timers cancelled nothing reclaims the entry; `get` must still
    // refuse it.
    timers.cancel_all();
    cache.set("a".into(), 1, Duration::from_millis(20));
    assert_eq!(cache.len(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cache.get(&"a".to_string()), None);
    assert_eq!(cache.len(), 0);
  }

  #[tokio::test]
  async fn timer_reclaims_expired_entry() {
    let (timers, cache) = cache(8);
    cache.set("a".into(), 1, Duration::from_millis(20));
    assert_eq!(timers.outstanding(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cache.len(), 0);
    assert_eq!(timers.outstanding(), 0);
  }

  #[tokio::test]
  async fn overwrite_cancels_old_timer_and_keeps_new_value() {
    let (timers, cache) = cache(8);
    cache.set("a".into(), 1, Duration::from_millis(20));
    cache.set("a".into(), 2, Duration::from_secs(60));

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(cache.get(&"a".to_string()), Some(2));
    assert_eq!(timers.outstanding(), 1);
  }

  #[tokio::test]
  async fn invalidate_where_cancels_timers() {
    let (timers, cache) = cache(8);
    cache.insert("ns1:a".into(), 1);
    cache.insert("ns1:b".into(), 2);
    cache.insert("ns2:a".into(), 3);

    assert_eq!(cache.invalidate_where(|k| k.starts_with("ns1:")), 2);
    assert_eq!(cache.len(), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(timers.outstanding(), 1);
    assert!(cache.invalidate(&"ns2:a".to_string()));
    assert!(!cache.invalidate(&"ns2:a".to_string()));
  }

  #[tokio::test]
  async fn capacity_evicts_soonest_expiry() {
    let (_, cache) = cache(2);
    cache.set("short".into(), 1, Duration::from_secs(10));
    cache.set("long".into(), 2, Duration::from_secs(100));
    cache.set("new".into(), 3, Duration::from_secs(50));

    assert_eq!(cache.len(), 2);
    assert_eq!(cache.get(&"short".to_string()), None);
    assert_eq!(cache.get(&"long".to_string()), Some(2));
    assert_eq!(cache.get(&"new".to_string()), Some(3));
  }

  #[tokio::test]
  async fn zero_ttl_stores_nothing() {
    let (_, cache) = cache(2);
    cache.insert("a".into(), 1);
    cache.set("a".into(), 2, Duration::ZERO);
    assert_eq!(cache.get(&"a".to_string()), None);
  }
}
