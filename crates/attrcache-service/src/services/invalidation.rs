use std::sync::Arc;

use sentry::{Hub, SentryFutureExt};

use crate::caching::Computation;
use crate::types::SourceId;

use super::{AttributesCache, SourceCache, SourceEntry};

/// Purges sources, and with them everything derived from them.
///
/// Derived entries are never enumerated. Each of them holds a clone of its source's
/// [`InvalidationHandle`](crate::caching::InvalidationHandle), so invalidating the handle of a
/// source is enough to expire them.
#[derive(Clone, Debug)]
pub struct InvalidationCoordinator {
    sources: SourceCache,
    derived: AttributesCache,
}

impl InvalidationCoordinator {
    pub fn new(sources: SourceCache, derived: AttributesCache) -> Self {
        Self { sources, derived }
    }

    /// Invalidates `source_id` and every entry derived from it.
    ///
    /// Purging an unknown or already purged source is a no-op.
    pub fn purge(&self, source_id: SourceId) {
        let computation = self.sources.try_get(source_id);
        let tracked = self.sources.invalidate_handle(source_id);
        if computation.is_none() && !tracked {
            tracing::debug!(%source_id, "purging unknown source");
            return;
        }

        tracing::debug!(%source_id, "purging source");
        if let Some(computation) = computation {
            invalidate(computation);
        }
        self.sources.remove(source_id);
        self.derived.sweep();
    }

    /// Invalidates every known source and everything derived from them.
    pub fn purge_all(&self) {
        let computations = self.sources.computations();
        tracing::debug!(sources = computations.len(), "purging all sources");

        self.sources.invalidate_handles();
        for computation in computations {
            invalidate(computation);
        }
        self.sources.clear();
        self.derived.sweep();
    }
}

/// Invalidates the handle of a fetched source, waiting for it if the fetch is still running.
///
/// The result of a running fetch is not cached once its key is removed, but derived
/// computations that already picked it up would otherwise outlive the purge.
fn invalidate(computation: Computation<Arc<SourceEntry>>) {
    match computation.peek() {
        Some(Ok(entry)) => {
            metric!(counter("caches.purged") += 1, "state" => "complete");
            entry.handle.invalidate();
        }
        // failed fetches are never cached and have nothing derived from them
        Some(Err(_)) => {}
        None => {
            metric!(counter("caches.purged") += 1, "state" => "pending");
            let task = async move {
                if let Ok(entry) = computation.await {
                    entry.handle.invalidate();
                }
            };
            tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
        }
    }
}
