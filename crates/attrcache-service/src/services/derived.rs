use std::collections::BTreeSet;
use std::sync::Arc;

use crate::caching::{
    CacheError, CacheKey, CacheName, CachePriority, ComputationError, InvalidationHandle,
    MemoizingCache,
};
use crate::config::DerivedCacheConfig;
use crate::types::{Attributes, AttributesRequest, DomainId, Parameter, SourceId};

use super::{
    normalize_parameters, ComputationProvider, ParameterFilter, ProviderRegistry, SourceCache,
};

/// Why a derived entry holds the empty sentinel instead of a computed result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Failure {
    /// The source could not be fetched.
    Miss,
    /// The computation rejected the source or the parameters.
    Malformed,
}

#[derive(Clone, Debug)]
struct DerivedEntry {
    attributes: Arc<Attributes>,
    /// The handle of the source this entry was computed from.
    source_handle: Option<InvalidationHandle>,
    failure: Option<Failure>,
}

/// The derived tier: computes [`Attributes`] at most once per source and normalized parameters.
///
/// Failures are not surfaced. A request whose source cannot be fetched or whose computation
/// fails yields the empty sentinel, which is cached like a regular result but with its own
/// sliding expiration.
#[derive(Clone, Debug)]
pub struct AttributesCache {
    cache: MemoizingCache<CacheKey, DerivedEntry>,
    sources: SourceCache,
    providers: ProviderRegistry,
    parameters: ParameterFilter,
    config: DerivedCacheConfig,
}

impl AttributesCache {
    pub fn new(
        sources: SourceCache,
        providers: ProviderRegistry,
        config: DerivedCacheConfig,
    ) -> Self {
        Self {
            cache: MemoizingCache::new(CacheName::Derived, config.capacity),
            sources,
            providers,
            parameters: ParameterFilter::new(),
            config,
        }
    }

    /// Looks up the provider of `request`.
    ///
    /// Returns `None` for requests of the empty source, which are never cached.
    fn provider(
        &self,
        request: &AttributesRequest,
    ) -> Result<Option<Arc<dyn ComputationProvider>>, ComputationError> {
        if request.source_id.is_empty() {
            return Ok(None);
        }

        let provider = self
            .providers
            .get(request.domain_id)
            .ok_or(ComputationError::UnknownDomain(request.domain_id))?;
        Ok(Some(Arc::clone(provider)))
    }

    /// Computes the attributes of `request`.
    ///
    /// Requests for [`SourceId::EMPTY`] short-circuit to [`Attributes::empty`] without touching
    /// any cache. The only error is [`ComputationError::UnknownDomain`]; every other failure
    /// yields the empty sentinel.
    pub async fn compute(
        &self,
        request: &AttributesRequest,
    ) -> Result<Arc<Attributes>, ComputationError> {
        let Some(provider) = self.provider(request)? else {
            return Ok(Arc::new(Attributes::empty()));
        };
        let relevant = self.parameters.load(request.domain_id, &provider).await;
        let (key, parameters) = prepare(request, provider.as_ref(), &relevant)?;

        tracing::trace!(cache_key = key.metadata(), "computing attributes");

        let compute = {
            let sources = self.sources.clone();
            let source_id = request.source_id;
            let domain = request.domain_id;
            async move {
                let entry =
                    compute_attributes(sources, provider, source_id, domain, parameters).await;
                Ok::<_, CacheError>(entry)
            }
        };

        let config = self.config;
        let computation = self.cache.get_or_create(key, compute, move |options, entry| {
            let idle_timeout = match entry.failure {
                None => config.max_unused_for,
                Some(Failure::Miss) => config.retry_misses_after,
                Some(Failure::Malformed) => config.retry_malformed_after,
            };
            options
                .set_priority(CachePriority::Normal)
                .set_idle_timeout(idle_timeout);
            if let Some(handle) = &entry.source_handle {
                options.add_expiration_handle(handle.clone());
            }
        });

        Ok(match computation.await {
            Ok(entry) => entry.attributes,
            // the computation died without a result, nothing was cached
            Err(_) => Arc::new(Attributes::empty()),
        })
    }

    /// Returns the cached attributes of `request` without computing them.
    ///
    /// Pending computations are not awaited and yield `None`.
    pub fn try_get(&self, request: &AttributesRequest) -> Option<Arc<Attributes>> {
        let provider = self.provider(request).ok()??;
        // nothing of a domain is cached before its parameters have been examined
        let relevant = self.parameters.cached(request.domain_id)?;
        let (key, _) = prepare(request, provider.as_ref(), &relevant).ok()?;
        match self.cache.try_get(&key)?.peek()? {
            Ok(entry) => Some(Arc::clone(&entry.attributes)),
            Err(_) => None,
        }
    }

    /// Drops every entry whose source has been invalidated.
    pub fn sweep(&self) {
        self.cache.sweep_invalidated();
    }
}

/// Normalizes the parameters of `request` and derives its cache key.
fn prepare(
    request: &AttributesRequest,
    provider: &dyn ComputationProvider,
    relevant: &BTreeSet<String>,
) -> Result<(CacheKey, Vec<Parameter>), ComputationError> {
    let parameters =
        normalize_parameters(&request.parameters, provider.known_parameters(), relevant);

    let mut builder = CacheKey::builder(request.source_id, request.domain_id);
    builder
        .write_parameters(&parameters)
        .map_err(|_| ComputationError::Malformed("unrepresentable parameters".into()))?;

    Ok((builder.build(), parameters))
}

/// Resolves the source and runs the domain computation on the blocking pool.
///
/// Never fails: failures are logged and turned into a sentinel entry.
async fn compute_attributes(
    sources: SourceCache,
    provider: Arc<dyn ComputationProvider>,
    source_id: SourceId,
    domain: DomainId,
    parameters: Vec<Parameter>,
) -> DerivedEntry {
    let source = match sources.resolve(source_id).await {
        Ok(source) => source,
        Err(err) => return sentinel(source_id, domain, err, None),
    };
    let handle = source.handle.clone();

    let result = tokio::task::spawn_blocking(move || provider.compute(&source.data, &parameters))
        .await
        .map_err(CacheError::from)
        .and_then(|result| result.map_err(CacheError::from));

    match result {
        Ok(attributes) => DerivedEntry {
            attributes: Arc::new(attributes),
            source_handle: Some(handle),
            failure: None,
        },
        Err(err) => sentinel(source_id, domain, err, Some(handle)),
    }
}

fn sentinel(
    source_id: SourceId,
    domain: DomainId,
    err: CacheError,
    source_handle: Option<InvalidationHandle>,
) -> DerivedEntry {
    tracing::warn!(
        %source_id,
        %domain,
        error = &err as &dyn std::error::Error,
        "computation failed, caching empty attributes"
    );
    metric!(
        counter("caches.sentinel") += 1,
        "cache" => CacheName::Derived.as_ref(),
        "reason" => err.metrics_tag(),
    );

    let failure = match err {
        CacheError::Computation(_) => Failure::Malformed,
        CacheError::Fetch(_) | CacheError::InternalError => Failure::Miss,
    };
    DerivedEntry {
        attributes: Arc::new(Attributes::empty()),
        source_handle,
        failure: Some(failure),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::services::SourceEntry;
    use crate::test::{self, InMemoryFetcher};

    fn request(source: u32, domain: u32, parameters: Vec<Parameter>) -> AttributesRequest {
        AttributesRequest {
            source_id: SourceId(source),
            domain_id: DomainId(domain),
            parameters,
        }
    }

    fn attributes_cache(fetcher: Arc<InMemoryFetcher>) -> AttributesCache {
        let sources = SourceCache::new(fetcher, Default::default());
        AttributesCache::new(sources, ProviderRegistry::builtin(), Default::default())
    }

    #[tokio::test]
    async fn test_empty_source_short_circuits() {
        test::setup();
        let fetcher = InMemoryFetcher::new(&[]);
        let cache = attributes_cache(fetcher.clone());

        // unknown domains are irrelevant for the empty source
        let attributes = cache.compute(&request(0, 5, vec![])).await.unwrap();
        assert!(attributes.is_empty());
        assert_eq!(fetcher.total_fetches(), 0);
        assert!(cache.try_get(&request(0, 5, vec![])).is_none());
    }

    #[tokio::test]
    async fn test_unknown_domain() {
        test::setup();
        let fetcher = InMemoryFetcher::new(&[(SourceId(42), "hello")]);
        let cache = attributes_cache(fetcher.clone());

        let err = cache.compute(&request(42, 5, vec![])).await.unwrap_err();
        assert_eq!(err, ComputationError::UnknownDomain(DomainId(5)));
        assert_eq!(fetcher.total_fetches(), 0);
    }

    #[tokio::test]
    async fn test_computes_once() {
        test::setup();
        let fetcher = InMemoryFetcher::new(&[(SourceId(42), "one two\nthree\n")]);
        let cache = attributes_cache(fetcher.clone());

        let attributes = cache.compute(&request(42, 1, vec![])).await.unwrap();
        assert_eq!(attributes.rating, 3.0);

        let again = cache.compute(&request(42, 1, vec![])).await.unwrap();
        assert!(Arc::ptr_eq(&attributes, &again));

        // same source, different domain
        let lines = cache.compute(&request(42, 0, vec![])).await.unwrap();
        assert_eq!(lines.rating, 2.0);

        assert_eq!(fetcher.fetches(SourceId(42)), 1);
    }

    #[tokio::test]
    async fn test_parameter_order_shares_entry() {
        test::setup();
        let fetcher = InMemoryFetcher::new(&[(SourceId(42), "Hello hello\n\nworld\n")]);
        let cache = attributes_cache(fetcher.clone());

        let sc = Parameter::new("SC").with_setting("factor", serde_json::json!(3));
        let first = cache
            .compute(&request(42, 1, vec![sc.clone(), Parameter::new("CI")]))
            .await
            .unwrap();
        let second = cache
            .compute(&request(42, 1, vec![Parameter::new("CI"), sc.clone()]))
            .await
            .unwrap();
        // `NB` does not affect word statistics
        let third = cache
            .compute(&request(
                42,
                1,
                vec![Parameter::new("NB"), Parameter::new("CI"), sc],
            ))
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &third));
        assert_eq!(first.rating, 9.0);
        assert_eq!(first.values["distinct_words"], 2.0);
    }

    #[tokio::test]
    async fn test_fetch_failure_caches_sentinel() {
        test::setup();
        let fetcher = InMemoryFetcher::new(&[]);
        let cache = attributes_cache(fetcher.clone());

        let attributes = cache.compute(&request(42, 1, vec![])).await.unwrap();
        assert!(attributes.is_empty());
        let attributes = cache.compute(&request(42, 1, vec![])).await.unwrap();
        assert!(attributes.is_empty());

        assert_eq!(fetcher.fetches(SourceId(42)), 1);
        assert!(cache.try_get(&request(42, 1, vec![])).is_some());
    }

    #[tokio::test]
    async fn test_malformed_caches_sentinel() {
        test::setup();
        let fetcher = InMemoryFetcher::new(&[(SourceId(42), "hello")]);
        let cache = attributes_cache(fetcher.clone());

        let unknown = vec![Parameter::new("XX")];
        let attributes = cache.compute(&request(42, 1, unknown.clone())).await.unwrap();
        assert!(attributes.is_empty());
        assert!(cache.try_get(&request(42, 1, unknown.clone())).is_some());

        // the sentinel still depends on its source
        let source = fetcher_entry(&cache, 42).await;
        source.handle.invalidate();
        assert!(cache.try_get(&request(42, 1, unknown)).is_none());
    }

    #[tokio::test]
    async fn test_sentinel_expiration() {
        test::setup();
        let fetcher = InMemoryFetcher::new(&[]);
        let sources = SourceCache::new(fetcher.clone(), Default::default());
        let config = DerivedCacheConfig {
            retry_misses_after: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let cache = AttributesCache::new(sources, ProviderRegistry::builtin(), config);

        cache.compute(&request(42, 1, vec![])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.try_get(&request(42, 1, vec![])).is_none());

        cache.compute(&request(42, 1, vec![])).await.unwrap();
        assert_eq!(fetcher.fetches(SourceId(42)), 2);
    }

    #[tokio::test]
    async fn test_source_invalidation_cascades() {
        test::setup();
        let fetcher = InMemoryFetcher::new(&[(SourceId(42), "hello world")]);
        let cache = attributes_cache(fetcher.clone());

        cache.compute(&request(42, 0, vec![])).await.unwrap();
        cache.compute(&request(42, 1, vec![])).await.unwrap();

        let source = fetcher_entry(&cache, 42).await;
        source.handle.invalidate();
        cache.sweep();

        assert!(cache.try_get(&request(42, 0, vec![])).is_none());
        assert!(cache.try_get(&request(42, 1, vec![])).is_none());

        cache.compute(&request(42, 1, vec![])).await.unwrap();
        assert_eq!(fetcher.fetches(SourceId(42)), 2);
    }

    async fn fetcher_entry(cache: &AttributesCache, id: u32) -> Arc<SourceEntry> {
        cache
            .sources
            .try_get(SourceId(id))
            .expect("source is cached")
            .await
            .unwrap()
    }
}
