use std::time::Duration;

use thiserror::Error;

use crate::types::DomainId;

/// An error that happens when fetching a source document from the remote resource.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The source does not exist on the remote resource.
    #[error("not found")]
    NotFound,
    /// The source was fetched, but the payload was empty.
    #[error("empty payload")]
    Empty,
    /// The source could not be fetched due to missing permissions.
    ///
    /// The attached string contains the remote's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The source could not be fetched due to a timeout.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The source could not be fetched due to another problem,
    /// like connection loss, DNS resolution, or a 5xx server response.
    #[error("download failed: {0}")]
    DownloadError(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        Self::DownloadError(err.to_string())
    }
}

/// An error raised by the domain computation itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComputationError {
    /// No computation is registered for the requested domain.
    #[error("unknown domain {0}")]
    UnknownDomain(DomainId),
    /// The computation rejected its input.
    #[error("malformed: {0}")]
    Malformed(String),
}

/// The outcome of a failed cache computation.
///
/// This is `Clone` so a single failure can be handed to every observer of a computation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Computation(#[from] ComputationError),
    /// An unexpected error in the service itself, for example a computation that died
    /// without producing a result.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<tokio::task::JoinError> for CacheError {
    #[track_caller]
    fn from(err: tokio::task::JoinError) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// A short name of the error class, used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Fetch(FetchError::NotFound) => "notfound",
            Self::Fetch(FetchError::Empty) => "empty",
            Self::Fetch(_) => "fetch",
            Self::Computation(_) => "computation",
            Self::InternalError => "internal",
        }
    }
}

/// An entry in a cache, containing either `Ok(T)` or an error denoting the reason why a
/// value could not be computed.
pub type CacheEntry<T = ()> = Result<T, CacheError>;
