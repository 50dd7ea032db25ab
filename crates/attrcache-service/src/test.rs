//! Test helpers shared by the unit tests of this crate.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;

pub use attrcache_test::*;

use crate::caching::FetchError;
use crate::services::SourceFetcher;
use crate::types::SourceId;

/// A [`SourceFetcher`] serving documents from memory, counting every fetch.
#[derive(Debug, Default)]
pub struct InMemoryFetcher {
    documents: BTreeMap<SourceId, Bytes>,
    fetches: Mutex<BTreeMap<SourceId, usize>>,
    gates: Mutex<BTreeMap<SourceId, oneshot::Receiver<()>>>,
}

impl InMemoryFetcher {
    /// Creates a fetcher for `documents`. Unknown sources are [`FetchError::NotFound`].
    pub fn new(documents: &[(SourceId, &'static str)]) -> Arc<Self> {
        let documents = documents
            .iter()
            .map(|(id, document)| (*id, Bytes::from_static(document.as_bytes())))
            .collect();
        Arc::new(Self {
            documents,
            ..Default::default()
        })
    }

    /// Makes the next fetch of `source_id` wait until `gate` resolves.
    pub fn hold(&self, source_id: SourceId, gate: oneshot::Receiver<()>) {
        self.gates.lock().insert(source_id, gate);
    }

    pub fn fetches(&self, source_id: SourceId) -> usize {
        self.fetches
            .lock()
            .get(&source_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn total_fetches(&self) -> usize {
        self.fetches.lock().values().sum()
    }
}

impl SourceFetcher for InMemoryFetcher {
    fn fetch(&self, source_id: SourceId) -> BoxFuture<'_, Result<Bytes, FetchError>> {
        Box::pin(async move {
            *self.fetches.lock().entry(source_id).or_default() += 1;

            let gate = self.gates.lock().remove(&source_id);
            if let Some(gate) = gate {
                gate.await.ok();
            }

            match self.documents.get(&source_id) {
                Some(document) if document.is_empty() => Err(FetchError::Empty),
                Some(document) => Ok(document.clone()),
                None => Err(FetchError::NotFound),
            }
        })
    }
}
