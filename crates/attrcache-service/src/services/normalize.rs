//! Canonical form of computation parameters.
//!
//! Requests that differ only in parameter order, or in parameters that cannot change the
//! outcome of a computation, must map to the same derived cache entry.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::types::{DomainId, Parameter};

use super::ComputationProvider;

/// Sorts `parameters` and drops the known parameters that are not in `relevant`.
///
/// Parameters that are not in `known` are always kept: the provider decides what to do with
/// them, usually rejecting the request as malformed.
pub fn normalize_parameters(
    parameters: &[Parameter],
    known: &[&str],
    relevant: &BTreeSet<String>,
) -> Vec<Parameter> {
    let mut normalized: Vec<_> = parameters
        .iter()
        .filter(|p| !known.contains(&p.acronym.as_str()) || relevant.contains(&p.acronym))
        .cloned()
        .collect();
    normalized.sort_by_cached_key(|p| (p.acronym.clone(), p.settings_key()));
    normalized
}

/// Memoizes, per computation kind, which known parameters influence the computation.
///
/// The trial runs once per [`DomainId`]: every known parameter is applied on its own to the
/// provider's baseline document and compared with the outcome without any parameters.
#[derive(Clone, Debug)]
pub struct ParameterFilter {
    relevant: moka::sync::Cache<DomainId, Arc<BTreeSet<String>>>,
}

impl ParameterFilter {
    pub fn new() -> Self {
        let relevant = moka::sync::Cache::builder()
            .name("parameter_relevance")
            .max_capacity(1024)
            .build();
        Self { relevant }
    }

    /// Returns the known parameters of `provider` that influence its outcome.
    pub fn relevant_parameters(
        &self,
        domain: DomainId,
        provider: &dyn ComputationProvider,
    ) -> Arc<BTreeSet<String>> {
        self.relevant
            .get_with(domain, || Arc::new(run_trial(domain, provider)))
    }

    /// Returns the relevant parameters of `domain`, running the trial on the blocking pool.
    ///
    /// If the trial panics, every known parameter is treated as relevant and nothing is
    /// memoized.
    pub async fn load(
        &self,
        domain: DomainId,
        provider: &Arc<dyn ComputationProvider>,
    ) -> Arc<BTreeSet<String>> {
        if let Some(relevant) = self.cached(domain) {
            return relevant;
        }

        let filter = self.clone();
        let trial_provider = Arc::clone(provider);
        let trial = tokio::task::spawn_blocking(move || {
            filter.relevant_parameters(domain, trial_provider.as_ref())
        });

        match trial.await {
            Ok(relevant) => relevant,
            Err(err) => {
                tracing::error!(
                    %domain,
                    provider = provider.name(),
                    error = &err as &dyn std::error::Error,
                    "parameter trial failed"
                );
                let known = provider.known_parameters().iter();
                Arc::new(known.map(|acronym| (*acronym).to_owned()).collect())
            }
        }
    }

    /// Returns the relevant parameters of `domain` if its trial has already run.
    pub fn cached(&self, domain: DomainId) -> Option<Arc<BTreeSet<String>>> {
        self.relevant.get(&domain)
    }
}

impl Default for ParameterFilter {
    fn default() -> Self {
        Self::new()
    }
}

fn run_trial(domain: DomainId, provider: &dyn ComputationProvider) -> BTreeSet<String> {
    let baseline = provider.baseline();
    let reference = provider.compute(&baseline, &[]);

    let relevant: BTreeSet<String> = provider
        .known_parameters()
        .iter()
        .filter(|acronym| {
            let outcome = provider.compute(&baseline, &[Parameter::new(**acronym)]);
            match (&reference, &outcome) {
                (Ok(reference), Ok(outcome)) => reference != outcome,
                // a failing trial cannot prove the parameter irrelevant
                _ => true,
            }
        })
        .map(|acronym| (*acronym).to_owned())
        .collect();

    tracing::debug!(
        %domain,
        provider = provider.name(),
        ?relevant,
        "determined relevant parameters"
    );
    relevant
}
