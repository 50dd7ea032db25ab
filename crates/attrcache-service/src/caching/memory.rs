use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use sentry::{Hub, SentryFutureExt};

use crate::utils::futures::CallOnDrop;

use super::{CacheEntry, CacheError, CacheName, EntryOptions};

/// A value of a [`MemoizingCache`] that is either still being computed or already resolved.
///
/// All clones observe the same underlying computation and resolve to the same result.
pub struct Computation<T> {
    inner: Shared<BoxFuture<'static, CacheEntry<T>>>,
}

impl<T> Clone for Computation<T>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Computation<T>
where
    T: Clone + Send + 'static,
{
    fn new(receiver: oneshot::Receiver<CacheEntry<T>>) -> Self {
        // A dropped sender means the computation died without producing a result.
        let inner = receiver
            .map(|result| result.unwrap_or(Err(CacheError::InternalError)))
            .boxed()
            .shared();
        Self { inner }
    }

    /// Returns the result if the computation has already finished.
    pub fn peek(&self) -> Option<&CacheEntry<T>> {
        self.inner.peek()
    }
}

impl<T> Future for Computation<T>
where
    T: Clone,
{
    type Output = CacheEntry<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

impl<T> std::fmt::Debug for Computation<T>
where
    T: Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.inner.peek() {
            None => "pending",
            Some(Ok(_)) => "ok",
            Some(Err(_)) => "error",
        };
        f.debug_struct("Computation").field("state", &state).finish()
    }
}

/// A finished computation together with the policy it was committed with.
#[derive(Clone)]
struct StoredItem<T> {
    computation: Computation<T>,
    options: Arc<EntryOptions>,
}

/// A computation that has been started but not yet committed or discarded.
struct Registration<T> {
    generation: u64,
    computation: Computation<T>,
}

struct InFlight<K, T> {
    registrations: HashMap<K, Registration<T>>,
    next_generation: u64,
}

impl<K: Hash + Eq, T> InFlight<K, T> {
    /// Removes the registration of `key` if it still belongs to `generation`.
    ///
    /// Returns `false` if the registration was replaced or removed in the meantime.
    fn retire(&mut self, key: &K, generation: u64) -> bool {
        match self.registrations.get(key) {
            Some(registration) if registration.generation == generation => {
                self.registrations.remove(key);
                true
            }
            _ => false,
        }
    }
}

/// A [`moka::Expiry`] that applies the sliding expiration configured in [`EntryOptions`].
struct EntryExpiration;

impl<K, T> moka::Expiry<K, StoredItem<T>> for EntryExpiration {
    fn expire_after_create(
        &self,
        _key: &K,
        value: &StoredItem<T>,
        _current_time: Instant,
    ) -> Option<Duration> {
        value.options.idle_timeout()
    }

    fn expire_after_read(
        &self,
        _key: &K,
        value: &StoredItem<T>,
        _current_time: Instant,
        _current_duration: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        value.options.idle_timeout()
    }

    fn expire_after_update(
        &self,
        _key: &K,
        value: &StoredItem<T>,
        _current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        value.options.idle_timeout()
    }
}

/// An in-memory cache that memoizes asynchronous computations.
///
/// At most one computation per key is in flight at any time; concurrent callers for the same key
/// share it. Successful results are committed to a bounded store together with the
/// [`EntryOptions`] produced by the caller's finalizer. Failed computations are observed by every
/// waiting caller and then forgotten, so the next access computes again.
///
/// A computation whose key is removed while it runs still resolves for the callers already
/// waiting on it, but its result is never committed.
pub struct MemoizingCache<K, T> {
    name: CacheName,
    in_flight: Arc<Mutex<InFlight<K, T>>>,
    store: moka::sync::Cache<K, StoredItem<T>>,
}

impl<K, T> Clone for MemoizingCache<K, T>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            in_flight: Arc::clone(&self.in_flight),
            store: self.store.clone(),
        }
    }
}

impl<K, T> std::fmt::Debug for MemoizingCache<K, T>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let in_flight = self
            .in_flight
            .try_lock()
            .map(|state| state.registrations.len())
            .unwrap_or_default();
        f.debug_struct("MemoizingCache")
            .field("name", &self.name)
            .field("stored items", &self.store.entry_count())
            .field("running computations", &in_flight)
            .finish()
    }
}

impl<K, T> MemoizingCache<K, T>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Creates a cache that holds up to `capacity` weighted entries.
    ///
    /// Entries with [`CachePriority::Normal`](super::CachePriority::Normal) weigh `2`.
    pub fn new(name: CacheName, capacity: u64) -> Self {
        let store = moka::sync::Cache::builder()
            .name(name.as_ref())
            .max_capacity(capacity.saturating_mul(2))
            .expire_after(EntryExpiration)
            .weigher(|_k, v: &StoredItem<T>| v.options.priority().weight())
            .support_invalidation_closures()
            .build();

        Self {
            name,
            in_flight: Arc::new(Mutex::new(InFlight {
                registrations: HashMap::new(),
                next_generation: 0,
            })),
            store,
        }
    }

    pub fn name(&self) -> CacheName {
        self.name
    }

    /// Looks up `key` among running and stored computations.
    ///
    /// Must be called with the in-flight lock held.
    fn lookup(&self, in_flight: &InFlight<K, T>, key: &K) -> Option<Computation<T>> {
        let name = self.name.as_ref();

        if let Some(registration) = in_flight.registrations.get(key) {
            metric!(counter("caches.channel.hit") += 1, "cache" => name);
            return Some(registration.computation.clone());
        }

        let item = self.store.get(key)?;
        if item.options.is_invalidated() {
            metric!(counter("caches.invalidated") += 1, "cache" => name);
            self.store.invalidate(key);
            return None;
        }

        metric!(counter("caches.memory.hit") += 1, "cache" => name);
        Some(item.computation)
    }

    /// Returns the running or stored computation for `key`, without starting one.
    ///
    /// Entries whose expiration handles have been invalidated are dropped and not returned.
    pub fn try_get(&self, key: &K) -> Option<Computation<T>> {
        let in_flight = self.in_flight.lock();
        self.lookup(&in_flight, key)
    }

    /// Returns the computation for `key`, starting `compute` if there is none.
    ///
    /// `compute` is spawned onto the runtime and runs to completion even if every caller stops
    /// waiting for it. When it succeeds, `finalize` is called once with default [`EntryOptions`]
    /// and the value, and the result is committed unless the options are already invalidated.
    pub fn get_or_create<F, Fin>(&self, key: K, compute: F, finalize: Fin) -> Computation<T>
    where
        F: Future<Output = CacheEntry<T>> + Send + 'static,
        Fin: FnOnce(&mut EntryOptions, &T) + Send + 'static,
    {
        let name = self.name.as_ref();
        metric!(counter("caches.access") += 1, "cache" => name);

        let mut in_flight = self.in_flight.lock();
        if let Some(computation) = self.lookup(&in_flight, &key) {
            return computation;
        }

        metric!(counter("caches.computation") += 1, "cache" => name);
        let generation = in_flight.next_generation;
        in_flight.next_generation += 1;

        let (sender, receiver) = oneshot::channel();
        let computation = Computation::new(receiver);
        in_flight.registrations.insert(
            key.clone(),
            Registration {
                generation,
                computation: computation.clone(),
            },
        );
        drop(in_flight);

        // Clears the registration if the computation panics before it could be committed.
        let guard = {
            let in_flight = Arc::clone(&self.in_flight);
            let key = key.clone();
            CallOnDrop::new(move || {
                in_flight.lock().retire(&key, generation);
            })
        };

        let this = self.clone();
        let committed = computation.clone();
        let task = async move {
            let _guard = guard;
            let result = compute.await;
            this.complete(key, generation, committed, &result, finalize);
            // Either a caller picked up this computation while it was registered, or it
            // looks up the committed item; both observe the result sent here.
            sender.send(result).ok();
        };
        tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));

        computation
    }

    /// Retires the registration of a finished computation and commits successful results.
    fn complete<Fin>(
        &self,
        key: K,
        generation: u64,
        computation: Computation<T>,
        result: &CacheEntry<T>,
        finalize: Fin,
    ) where
        Fin: FnOnce(&mut EntryOptions, &T),
    {
        let name = self.name.as_ref();
        let mut in_flight = self.in_flight.lock();

        if !in_flight.retire(&key, generation) {
            metric!(counter("caches.computation.stale") += 1, "cache" => name);
            tracing::trace!(cache = name, "discarding result of removed computation");
            return;
        }

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                tracing::trace!(cache = name, error = %err, "not caching failed computation");
                return;
            }
        };

        let mut options = EntryOptions::default();
        finalize(&mut options, value);
        if options.is_invalidated() {
            metric!(counter("caches.invalidated") += 1, "cache" => name);
            return;
        }

        self.store.insert(
            key,
            StoredItem {
                computation,
                options: Arc::new(options),
            },
        );
    }

    /// Removes `key`, whether it is stored or still being computed.
    ///
    /// A running computation for `key` keeps running, but its result will not be committed.
    pub fn remove(&self, key: &K) {
        let mut in_flight = self.in_flight.lock();
        in_flight.registrations.remove(key);
        self.store.invalidate(key);
    }

    /// Drops every stored entry whose expiration handles have been invalidated.
    pub fn sweep_invalidated(&self) {
        let _in_flight = self.in_flight.lock();
        if let Err(err) = self
            .store
            .invalidate_entries_if(|_key, item| item.options.is_invalidated())
        {
            tracing::error!(cache = self.name.as_ref(), error = %err, "failed to sweep invalidated entries");
        }
    }

    /// Returns every running computation and every stored entry.
    pub fn computations(&self) -> Vec<Computation<T>> {
        let in_flight = self.in_flight.lock();
        let running = in_flight
            .registrations
            .values()
            .map(|registration| registration.computation.clone());
        let stored = self.store.iter().map(|(_key, item)| item.computation);
        running.chain(stored).collect()
    }

    /// Removes every entry and forgets every running computation.
    pub fn clear(&self) {
        let mut in_flight = self.in_flight.lock();
        in_flight.registrations.clear();
        self.store.invalidate_all();
    }
}
