//! Provides the internal attrcache services and a way to initialize them.
//!
//! attrcache operates two cache tiers on top of a fetch collaborator and a table of computation
//! providers. The main [`create_service`] fn creates all of these according to the provided
//! [`Config`] and returns an [`AttributesService`] as the main interface.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::caching::ComputationError;
use crate::config::Config;
use crate::types::{Attributes, AttributesRequest, SourceId};

mod derived;
pub mod download;
mod invalidation;
mod normalize;
mod providers;
mod sources;

pub use derived::AttributesCache;
pub use download::{FilesystemFetcher, HttpFetcher, SourceFetcher};
pub use invalidation::InvalidationCoordinator;
pub use normalize::{normalize_parameters, ParameterFilter};
pub use providers::{ComputationProvider, ProviderRegistry, TextStat, TextStatsProvider};
pub use sources::{SourceCache, SourceEntry};

/// The public interface of the caches: computing attributes and purging sources.
#[derive(Clone, Debug)]
pub struct AttributesService {
    attributes: AttributesCache,
    invalidation: InvalidationCoordinator,
}

impl AttributesService {
    /// Wires both tiers and the coordinator around `fetcher` and `providers`.
    pub fn new(
        config: &Config,
        fetcher: Arc<dyn SourceFetcher>,
        providers: ProviderRegistry,
    ) -> Self {
        let sources = SourceCache::new(fetcher, config.caches.sources);
        let attributes = AttributesCache::new(sources.clone(), providers, config.caches.derived);
        let invalidation = InvalidationCoordinator::new(sources, attributes.clone());

        Self {
            attributes,
            invalidation,
        }
    }

    /// See [`AttributesCache::compute`].
    pub async fn compute(
        &self,
        request: &AttributesRequest,
    ) -> Result<Arc<Attributes>, ComputationError> {
        self.attributes.compute(request).await
    }

    /// Purges a single source, or every source if `source_id` is `None`.
    pub fn purge(&self, source_id: Option<SourceId>) {
        match source_id {
            Some(source_id) => self.invalidation.purge(source_id),
            None => self.invalidation.purge_all(),
        }
    }
}

/// Creates the [`AttributesService`] with the fetcher selected in `config` and the built-in
/// computation providers.
pub fn create_service(config: &Config) -> Result<AttributesService> {
    let fetcher = download::from_config(config).context("failed to create source fetcher")?;
    Ok(AttributesService::new(
        config,
        fetcher,
        ProviderRegistry::builtin(),
    ))
}
