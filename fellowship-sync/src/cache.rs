//! Client-side query cache.
//!
//! Entries map a query key to the last materialized result. Observers hold a
//! [`watch::Receiver`] per key and see every write. Fetches go through tickets
//! so a cancelled or superseded fetch cannot overwrite newer data, and writes
//! from fetches are discarded while an optimistic mutation is in flight on the
//! same key.

use std::{
    collections::HashMap,
    fmt::{Debug, Display},
    hash::Hash,
    sync::{Mutex, MutexGuard, PoisonError},
};
use tokio::sync::{broadcast, watch};
use tracing::debug;

const INVALIDATION_BUFFER: usize = 64;

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct QueryState<V> {
    pub data: Option<V>,
    pub is_loading: bool,
    pub is_error: bool,
    pub is_stale: bool,
}

impl<V> Default for QueryState<V> {
    fn default() -> Self {
        Self {
            data: None,
            is_loading: false,
            is_error: false,
            is_stale: false,
        }
    }
}

/// The value of one entry before an optimistic write.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Snapshot<K, V> {
    key: K,
    data: Option<V>,
}

impl<K, V> Snapshot<K, V> {
    #[must_use]
    pub fn key(&self) -> &K {
        &self.key
    }

    #[must_use]
    pub fn data(&self) -> Option<&V> {
        self.data.as_ref()
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct FetchTicket<K> {
    key: K,
    generation: u64,
}

impl<K> FetchTicket<K> {
    #[must_use]
    pub fn key(&self) -> &K {
        &self.key
    }
}

struct Entry<V> {
    state: watch::Sender<QueryState<V>>,
    generation: u64,
    fetching: Option<u64>,
    mutations: usize,
}

impl<V> Entry<V> {
    fn new() -> Self {
        let (state, _) = watch::channel(QueryState::default());
        Self {
            state,
            generation: 0,
            fetching: None,
            mutations: 0,
        }
    }

    fn cancel_fetch(&mut self) -> bool {
        if self.fetching.take().is_none() {
            return false;
        }
        self.generation += 1;
        self.state.send_modify(|state| state.is_loading = false);
        true
    }
}

pub struct QueryCache<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    invalidations: broadcast::Sender<K>,
}

impl<K, V> Default for QueryCache<K, V>
where
    K: Clone + Eq + Hash + Debug,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> QueryCache<K, V>
where
    K: Clone + Eq + Hash + Debug,
    V: Clone,
{
    #[must_use]
    pub fn new() -> Self {
        let (invalidations, _) = broadcast::channel(INVALIDATION_BUFFER);
        Self {
            entries: Mutex::new(HashMap::new()),
            invalidations,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<K, Entry<V>>> {
        // Entries hold plain data, a panicking writer cannot leave them half-updated.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries()
            .get(key)
            .and_then(|entry| entry.state.borrow().data.clone())
    }

    #[must_use]
    pub fn state(&self, key: &K) -> QueryState<V> {
        self.entries()
            .get(key)
            .map(|entry| entry.state.borrow().clone())
            .unwrap_or_default()
    }

    /// Subscribes to every change of the entry, creating it if needed.
    pub fn watch(&self, key: K) -> watch::Receiver<QueryState<V>> {
        self.entries()
            .entry(key)
            .or_insert_with(Entry::new)
            .state
            .subscribe()
    }

    /// Whether anyone still holds a receiver for `key`.
    #[must_use]
    pub fn is_observed(&self, key: &K) -> bool {
        self.entries()
            .get(key)
            .is_some_and(|entry| entry.state.receiver_count() > 0)
    }

    #[must_use]
    pub fn observed_keys(&self) -> Vec<K> {
        self.entries()
            .iter()
            .filter(|(_, entry)| entry.state.receiver_count() > 0)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn set(&self, key: K, value: V) {
        self.entries()
            .entry(key)
            .or_insert_with(Entry::new)
            .state
            .send_modify(|state| {
                state.data = Some(value);
                state.is_error = false;
            });
    }

    #[must_use]
    pub fn snapshot(&self, key: &K) -> Snapshot<K, V> {
        Snapshot {
            key: key.clone(),
            data: self.get(key),
        }
    }

    /// Puts the entry back to exactly the snapshotted value.
    pub fn restore(&self, snapshot: Snapshot<K, V>) {
        let Snapshot { key, data } = snapshot;
        debug!(?key, "Restoring snapshot");
        self.entries()
            .entry(key)
            .or_insert_with(Entry::new)
            .state
            .send_modify(|state| state.data = data);
    }

    /// Drops the in-flight fetch of `key`, if any. Its result will be ignored.
    pub fn cancel(&self, key: &K) -> bool {
        let cancelled = self
            .entries()
            .get_mut(key)
            .is_some_and(Entry::cancel_fetch);
        if cancelled {
            debug!(?key, "Cancelled in-flight fetch");
        }
        cancelled
    }

    /// Marks the entry stale and asks the refetcher to reload it, unless a
    /// mutation is in flight on it, in which case the mutation's own settle
    /// requests the reload.
    pub fn invalidate(&self, key: &K) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };

        entry.state.send_modify(|state| state.is_stale = true);
        if entry.mutations > 0 {
            debug!(?key, "Deferring invalidation until mutations settle");
            return;
        }
        drop(entries);

        // No refetcher running just means nobody reloads eagerly.
        let _ = self.invalidations.send(key.clone());
    }

    pub fn invalidate_matching(&self, predicate: impl Fn(&K) -> bool) {
        let keys: Vec<K> = self
            .entries()
            .keys()
            .filter(|key| predicate(key))
            .cloned()
            .collect();

        for key in &keys {
            self.invalidate(key);
        }
    }

    pub fn invalidate_all(&self) {
        self.invalidate_matching(|_| true);
    }

    #[must_use]
    pub fn invalidations(&self) -> broadcast::Receiver<K> {
        self.invalidations.subscribe()
    }

    /// Starts a fetch, superseding any fetch already running for `key`.
    #[must_use]
    pub fn begin_fetch(&self, key: K) -> FetchTicket<K> {
        let mut entries = self.entries();
        let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
        entry.generation += 1;
        entry.fetching = Some(entry.generation);
        entry.state.send_modify(|state| state.is_loading = true);

        FetchTicket {
            key,
            generation: entry.generation,
        }
    }

    /// Completes a fetch. Returns whether the result was written.
    pub fn finish_fetch<E: Display>(&self, ticket: FetchTicket<K>, result: Result<V, E>) -> bool {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(&ticket.key) else {
            return false;
        };

        if entry.fetching != Some(ticket.generation) {
            debug!(key = ?ticket.key, "Discarding result of superseded fetch");
            return false;
        }
        entry.fetching = None;

        if entry.mutations > 0 {
            debug!(key = ?ticket.key, "Discarding fetch that raced an optimistic write");
            entry.state.send_modify(|state| state.is_loading = false);
            return false;
        }

        match result {
            Ok(value) => entry.state.send_modify(|state| {
                state.data = Some(value);
                state.is_loading = false;
                state.is_error = false;
                state.is_stale = false;
            }),
            Err(error) => {
                debug!(key = ?ticket.key, %error, "Fetch failed, keeping previous data");
                entry.state.send_modify(|state| {
                    state.is_loading = false;
                    state.is_error = true;
                });
            }
        }
        true
    }

    /// Registers an optimistic mutation on `key`: cancels the in-flight fetch
    /// and snapshots the entry in one step, so no fetch can start in between.
    #[must_use]
    pub fn begin_mutation(&self, key: &K) -> Snapshot<K, V> {
        let mut entries = self.entries();
        let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
        if entry.cancel_fetch() {
            debug!(?key, "Cancelled in-flight fetch before optimistic write");
        }
        entry.mutations += 1;

        Snapshot {
            key: key.clone(),
            data: entry.state.borrow().data.clone(),
        }
    }

    pub fn end_mutation(&self, key: &K) {
        if let Some(entry) = self.entries().get_mut(key) {
            entry.mutations = entry.mutations.saturating_sub(1);
        }
    }

    #[must_use]
    pub fn pending_mutations(&self, key: &K) -> usize {
        self.entries().get(key).map_or(0, |entry| entry.mutations)
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::{QueryCache, QueryState};
    use tokio::sync::broadcast::error::TryRecvError;

    type Cache = QueryCache<&'static str, Vec<u32>>;

    #[test]
    fn set_get_and_observe() {
        let cache = Cache::new();
        assert_eq!(cache.get(&"feed"), None);
        assert!(!cache.is_observed(&"feed"));

        let mut observer = cache.watch("feed");
        assert!(cache.is_observed(&"feed"));
        assert_eq!(cache.observed_keys(), ["feed"]);

        cache.set("feed", vec![1, 2]);
        assert!(observer.has_changed().unwrap());
        assert_eq!(observer.borrow_and_update().data, Some(vec![1, 2]));
        assert_eq!(cache.get(&"feed"), Some(vec![1, 2]));

        drop(observer);
        assert!(!cache.is_observed(&"feed"));
    }

    #[test]
    fn restore_returns_exact_snapshot() {
        let cache = Cache::new();
        cache.set("feed", vec![3]);

        let snapshot = cache.snapshot(&"feed");
        cache.set("feed", vec![3, 4, 5]);
        cache.restore(snapshot);
        assert_eq!(cache.get(&"feed"), Some(vec![3]));

        let empty = cache.snapshot(&"saved");
        cache.set("saved", vec![9]);
        cache.restore(empty);
        assert_eq!(cache.get(&"saved"), None);
    }

    #[test]
    fn cancelled_fetch_is_discarded() {
        let cache = Cache::new();
        cache.set("feed", vec![1]);

        let ticket = cache.begin_fetch("feed");
        assert!(cache.state(&"feed").is_loading);
        assert!(cache.cancel(&"feed"));
        assert!(!cache.state(&"feed").is_loading);
        assert!(!cache.cancel(&"feed"));

        assert!(!cache.finish_fetch::<String>(ticket, Ok(vec![0])));
        assert_eq!(cache.get(&"feed"), Some(vec![1]));
    }

    #[test]
    fn newer_fetch_supersedes_older() {
        let cache = Cache::new();
        let older = cache.begin_fetch("feed");
        let newer = cache.begin_fetch("feed");

        assert!(cache.finish_fetch::<String>(newer, Ok(vec![2])));
        assert!(!cache.finish_fetch::<String>(older, Ok(vec![1])));
        assert_eq!(cache.get(&"feed"), Some(vec![2]));
    }

    #[test]
    fn failed_fetch_keeps_data() {
        let cache = Cache::new();
        cache.set("feed", vec![1]);
        cache.invalidate(&"feed");

        let ticket = cache.begin_fetch("feed");
        assert!(cache.finish_fetch(ticket, Err("offline")));

        assert_eq!(
            cache.state(&"feed"),
            QueryState {
                data: Some(vec![1]),
                is_loading: false,
                is_error: true,
                is_stale: true,
            }
        );

        let ticket = cache.begin_fetch("feed");
        assert!(cache.finish_fetch::<String>(ticket, Ok(vec![1, 2])));
        let state = cache.state(&"feed");
        assert!(!state.is_error && !state.is_stale);
    }

    #[test]
    fn invalidation_is_broadcast() {
        let cache = Cache::new();
        let mut invalidations = cache.invalidations();

        cache.invalidate(&"missing");
        assert_eq!(invalidations.try_recv(), Err(TryRecvError::Empty));

        cache.set("feed", vec![]);
        cache.set("saved", vec![]);
        cache.invalidate_matching(|key| key.starts_with('f'));
        assert_eq!(invalidations.try_recv(), Ok("feed"));
        assert_eq!(invalidations.try_recv(), Err(TryRecvError::Empty));
        assert!(cache.state(&"feed").is_stale);
        assert!(!cache.state(&"saved").is_stale);
    }

    #[test]
    fn mutation_defers_invalidation_and_blocks_fetches() {
        let cache = Cache::new();
        let mut invalidations = cache.invalidations();
        cache.set("feed", vec![1]);

        let running = cache.begin_fetch("feed");
        let snapshot = cache.begin_mutation(&"feed");
        assert_eq!(snapshot.data(), Some(&vec![1]));
        assert_eq!(cache.pending_mutations(&"feed"), 1);

        cache.set("feed", vec![1, 2]);
        cache.invalidate(&"feed");
        assert_eq!(invalidations.try_recv(), Err(TryRecvError::Empty));
        assert!(cache.state(&"feed").is_stale);

        // Both the fetch cancelled by the mutation and one started during it lose.
        assert!(!cache.finish_fetch::<String>(running, Ok(vec![7])));
        let during = cache.begin_fetch("feed");
        assert!(!cache.finish_fetch::<String>(during, Ok(vec![8])));
        assert_eq!(cache.get(&"feed"), Some(vec![1, 2]));

        cache.end_mutation(&"feed");
        cache.invalidate(&"feed");
        assert_eq!(invalidations.try_recv(), Ok("feed"));
        assert_eq!(cache.pending_mutations(&"feed"), 0);
    }
}
