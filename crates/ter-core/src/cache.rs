//! Single-flight memoization keyed by probe or flag combination.
//!
//! Every caller that arrives while a fetch for its key is running awaits that
//! same fetch. A failed refresh never replaces a value that was already
//! fetched; the old value is served until the next refresh succeeds.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

type InflightFetch<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

struct CacheEntry<V, E> {
    fetched_at: Option<Instant>,
    value: Option<V>,
    error: Option<E>,
    inflight: Option<(u64, InflightFetch<V, E>)>,
}

impl<V, E> Default for CacheEntry<V, E> {
    fn default() -> Self {
        Self {
            fetched_at: None,
            value: None,
            error: None,
            inflight: None,
        }
    }
}

struct CacheState<K, V, E> {
    entries: HashMap<K, CacheEntry<V, E>>,
    fetch_seq: u64,
}

pub struct TtlCache<K, V, E> {
    state: Mutex<CacheState<K, V, E>>,
}

impl<K, V, E> Default for TtlCache<K, V, E> {
    fn default() -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                fetch_seq: 0,
            }),
        }
    }
}

impl<K, V, E> TtlCache<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached value for `key` when it is younger than `ttl`,
    /// otherwise joins (or starts) the single fetch for that key.
    ///
    /// A failure is swallowed in favour of the previous value when one exists.
    /// Without one, the failure goes to every waiter and is itself remembered
    /// for `ttl`.
    pub async fn get<F, Fut>(&self, key: K, ttl: Duration, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (fetch_id, inflight) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let entry = state.entries.entry(key.clone()).or_default();
            if let Some(fetched_at) = entry.fetched_at {
                if fetched_at.elapsed() < ttl {
                    if let Some(value) = &entry.value {
                        return Ok(value.clone());
                    }
                    if let Some(error) = &entry.error {
                        return Err(error.clone());
                    }
                }
            }
            if let Some((id, inflight)) = &entry.inflight {
                (*id, inflight.clone())
            } else {
                state.fetch_seq += 1;
                let inflight = fetch().boxed().shared();
                entry.inflight = Some((state.fetch_seq, inflight.clone()));
                (state.fetch_seq, inflight)
            }
        };

        let outcome = inflight.await;

        let mut guard = self.lock();
        let entry = guard.entries.entry(key).or_default();
        let owns_entry = entry
            .inflight
            .as_ref()
            .is_some_and(|(id, _)| *id == fetch_id);
        if owns_entry {
            entry.inflight = None;
            entry.fetched_at = Some(Instant::now());
            match &outcome {
                Ok(value) => {
                    entry.value = Some(value.clone());
                    entry.error = None;
                }
                Err(error) => {
                    if entry.value.is_none() {
                        entry.error = Some(error.clone());
                    }
                }
            }
        }
        match outcome {
            Ok(value) => Ok(value),
            Err(error) => entry.value.clone().ok_or(error),
        }
    }

    /// Last known good value, without fetching.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.lock()
            .entries
            .get(key)
            .and_then(|entry| entry.value.clone())
    }

    /// Marks `key` stale so the next `get` refetches. The value stays as the
    /// fallback for a failing refetch.
    pub fn expire(&self, key: &K) {
        if let Some(entry) = self.lock().entries.get_mut(key) {
            entry.fetched_at = None;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<K, V, E>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
