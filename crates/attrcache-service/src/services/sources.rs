use std::sync::Arc;

use bytes::Bytes;
use moka::notification::RemovalCause;

use crate::caching::{
    CacheError, CacheName, CachePriority, Computation, InvalidationHandle, MemoizingCache,
};
use crate::config::SourceCacheConfig;
use crate::types::SourceId;

use super::SourceFetcher;

/// A fetched source document.
#[derive(Debug)]
pub struct SourceEntry {
    pub source_id: SourceId,
    pub data: Bytes,
    /// Invalidating this handle expires the entry and everything derived from it.
    pub handle: InvalidationHandle,
}

/// The source tier: fetches each source document once and reuses it while it is in use.
///
/// Documents expire quickly when unused, while entries derived from them live much longer.
/// The tier therefore remembers the handle of a source independently of its document: a
/// document fetched again after expiring gets the same handle, and purging a source reaches
/// everything derived from it even when the document itself is gone. A handle dropped from
/// the registry for lack of space is invalidated, so nothing derived from it outlives it.
#[derive(Clone, Debug)]
pub struct SourceCache {
    cache: MemoizingCache<SourceId, Arc<SourceEntry>>,
    handles: moka::sync::Cache<SourceId, InvalidationHandle>,
    fetcher: Arc<dyn SourceFetcher>,
    config: SourceCacheConfig,
}

impl SourceCache {
    pub fn new(fetcher: Arc<dyn SourceFetcher>, config: SourceCacheConfig) -> Self {
        let handles = moka::sync::Cache::builder()
            .name("source_handles")
            .max_capacity(config.tracked_handles)
            .eviction_listener(
                |source_id: Arc<SourceId>, handle: InvalidationHandle, cause: RemovalCause| {
                    if cause.was_evicted() {
                        tracing::trace!(source_id = %source_id, "evicted source handle");
                        metric!(counter("caches.handles.evicted") += 1);
                        handle.invalidate();
                    }
                },
            )
            .build();

        Self {
            cache: MemoizingCache::new(CacheName::Sources, config.capacity),
            handles,
            fetcher,
            config,
        }
    }

    /// Returns the live handle of `source_id`, replacing it if it has been invalidated.
    fn handle(&self, source_id: SourceId) -> InvalidationHandle {
        let handle = self.handles.get_with(source_id, InvalidationHandle::new);
        if !handle.is_invalidated() {
            return handle;
        }
        let handle = InvalidationHandle::new();
        self.handles.insert(source_id, handle.clone());
        handle
    }

    /// Returns the document of `source_id`, fetching it if it is not cached yet.
    ///
    /// The handle is taken before the fetch starts. A fetch that is purged while running thus
    /// carries the handle the purge invalidated, and never hands it to a later fetch.
    pub fn resolve(&self, source_id: SourceId) -> Computation<Arc<SourceEntry>> {
        let fetcher = Arc::clone(&self.fetcher);
        let handle = self.handle(source_id);
        let compute = async move {
            let data = fetcher.fetch(source_id).await.map_err(|err| {
                tracing::debug!(%source_id, error = %err, "failed to fetch source");
                err
            })?;
            tracing::trace!(%source_id, size = data.len(), "fetched source");

            let entry = SourceEntry {
                source_id,
                data,
                handle,
            };
            Ok::<_, CacheError>(Arc::new(entry))
        };

        let idle_timeout = self.config.max_unused_for;
        self.cache
            .get_or_create(source_id, compute, move |options, entry| {
                options
                    .set_priority(CachePriority::Low)
                    .set_idle_timeout(idle_timeout)
                    .add_expiration_handle(entry.handle.clone());
            })
    }

    /// Returns the running or cached fetch of `source_id` without starting one.
    pub fn try_get(&self, source_id: SourceId) -> Option<Computation<Arc<SourceEntry>>> {
        self.cache.try_get(&source_id)
    }

    pub fn remove(&self, source_id: SourceId) {
        self.cache.remove(&source_id);
    }

    /// Invalidates the remembered handle of `source_id`, if there is one.
    pub fn invalidate_handle(&self, source_id: SourceId) -> bool {
        // deliver pending evictions, so a handle is either found here or already invalidated
        self.handles.run_pending_tasks();
        match self.handles.remove(&source_id) {
            Some(handle) => {
                handle.invalidate();
                true
            }
            None => false,
        }
    }

    /// Invalidates every remembered handle.
    pub fn invalidate_handles(&self) {
        self.handles.run_pending_tasks();
        for (_source_id, handle) in self.handles.iter() {
            handle.invalidate();
        }
        self.handles.invalidate_all();
    }

    /// Returns every running and cached fetch.
    pub fn computations(&self) -> Vec<Computation<Arc<SourceEntry>>> {
        self.cache.computations()
    }

    pub fn clear(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::caching::FetchError;
    use crate::test::{self, InMemoryFetcher};

    #[tokio::test]
    async fn test_fetches_once() {
        test::setup();
        let fetcher = InMemoryFetcher::new(&[(SourceId(42), "hello")]);
        let sources = SourceCache::new(fetcher.clone(), Default::default());

        let first = sources.resolve(SourceId(42));
        let second = sources.resolve(SourceId(42));

        let first = first.await.unwrap();
        let second = second.await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(&first.data[..], b"hello");
        assert_eq!(fetcher.fetches(SourceId(42)), 1);

        let third = sources.resolve(SourceId(42)).await.unwrap();
        assert!(Arc::ptr_eq(&first, &third));
        assert_eq!(fetcher.fetches(SourceId(42)), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_retried() {
        test::setup();
        let fetcher = InMemoryFetcher::new(&[(SourceId(7), "")]);
        let sources = SourceCache::new(fetcher.clone(), Default::default());

        let result = sources.resolve(SourceId(7)).await;
        assert_eq!(result.unwrap_err(), CacheError::Fetch(FetchError::Empty));
        let result = sources.resolve(SourceId(8)).await;
        assert_eq!(result.unwrap_err(), CacheError::Fetch(FetchError::NotFound));

        assert!(sources.try_get(SourceId(7)).is_none());
        sources.resolve(SourceId(7)).await.unwrap_err();
        assert_eq!(fetcher.fetches(SourceId(7)), 2);
    }

    #[tokio::test]
    async fn test_handle_expires_source() {
        test::setup();
        let fetcher = InMemoryFetcher::new(&[(SourceId(42), "hello")]);
        let sources = SourceCache::new(fetcher.clone(), Default::default());

        let entry = sources.resolve(SourceId(42)).await.unwrap();
        assert!(sources.try_get(SourceId(42)).is_some());

        entry.handle.invalidate();
        assert!(sources.try_get(SourceId(42)).is_none());

        let refetched = sources.resolve(SourceId(42)).await.unwrap();
        assert!(!refetched.handle.is_invalidated());
        assert_eq!(fetcher.fetches(SourceId(42)), 2);
    }

    #[tokio::test]
    async fn test_handle_survives_expiration() {
        test::setup();
        let fetcher = InMemoryFetcher::new(&[(SourceId(42), "hello")]);
        let config = SourceCacheConfig {
            max_unused_for: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let sources = SourceCache::new(fetcher.clone(), config);

        let first = sources.resolve(SourceId(42)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(sources.try_get(SourceId(42)).is_none());

        let second = sources.resolve(SourceId(42)).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        assert!(sources.invalidate_handle(SourceId(42)));
        assert!(first.handle.is_invalidated());
        assert!(second.handle.is_invalidated());
        assert!(!sources.invalidate_handle(SourceId(42)));
    }

    #[tokio::test]
    async fn test_sliding_expiration() {
        test::setup();
        let fetcher = InMemoryFetcher::new(&[(SourceId(42), "hello")]);
        let config = SourceCacheConfig {
            max_unused_for: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let sources = SourceCache::new(fetcher.clone(), config);

        sources.resolve(SourceId(42)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(sources.try_get(SourceId(42)).is_none());
        sources.resolve(SourceId(42)).await.unwrap();
        assert_eq!(fetcher.fetches(SourceId(42)), 2);
    }

    #[tokio::test]
    async fn test_evicted_handle_is_invalidated() {
        test::setup();
        let documents: Vec<_> = (1..=50).map(|id| (SourceId(id), "hello")).collect();
        let fetcher = InMemoryFetcher::new(&documents);
        let config = SourceCacheConfig {
            tracked_handles: 10,
            ..Default::default()
        };
        let sources = SourceCache::new(fetcher.clone(), config);

        let mut entries = Vec::new();
        for id in 1..=50 {
            entries.push(sources.resolve(SourceId(id)).await.unwrap());
        }

        // handles that did not fit are invalidated, the tracked ones by the purge itself
        for entry in &entries {
            sources.invalidate_handle(entry.source_id);
            assert!(entry.handle.is_invalidated());
        }
    }
}
