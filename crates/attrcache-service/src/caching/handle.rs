use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// A cancellable token that represents the validity window of a cached source.
///
/// Exactly one source entry owns a handle. Every entry derived from that source holds a clone,
/// which refers to the same underlying token. Invalidating is idempotent and irreversible.
#[derive(Clone, Debug, Default)]
pub struct InvalidationHandle {
    token: CancellationToken,
}

impl InvalidationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the handle, marking every entry that depends on it as expired.
    pub fn invalidate(&self) {
        self.token.cancel();
    }

    pub fn is_invalidated(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Retrieval priority of a cache entry.
///
/// The backing store evicts by access frequency; the priority is folded into the entry's
/// weight, so low priority entries use up more of a tier's capacity and go first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum CachePriority {
    Low,
    #[default]
    Normal,
    High,
}

impl CachePriority {
    pub(crate) fn weight(self) -> u32 {
        match self {
            Self::Low => 4,
            Self::Normal => 2,
            Self::High => 1,
        }
    }
}

/// Cache policy attached to an entry when its computation finishes successfully.
#[derive(Clone, Debug, Default)]
pub struct EntryOptions {
    priority: CachePriority,
    idle_timeout: Option<Duration>,
    expiration_handles: Vec<InvalidationHandle>,
}

impl EntryOptions {
    pub fn set_priority(&mut self, priority: CachePriority) -> &mut Self {
        self.priority = priority;
        self
    }

    /// Sets a sliding expiration: the entry expires after not being accessed for `timeout`.
    ///
    /// `None` disables time based expiration.
    pub fn set_idle_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.idle_timeout = timeout;
        self
    }

    /// Ties the entry to `handle`: once it is invalidated, the entry expires.
    pub fn add_expiration_handle(&mut self, handle: InvalidationHandle) -> &mut Self {
        self.expiration_handles.push(handle);
        self
    }

    pub fn priority(&self) -> CachePriority {
        self.priority
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Whether any of the handles this entry depends on has been invalidated.
    pub fn is_invalidated(&self) -> bool {
        self.expiration_handles
            .iter()
            .any(InvalidationHandle::is_invalidated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidate_is_idempotent() {
        let handle = InvalidationHandle::new();
        let reference = handle.clone();
        assert!(!reference.is_invalidated());

        handle.invalidate();
        handle.invalidate();
        assert!(handle.is_invalidated());
        assert!(reference.is_invalidated());
    }

    #[test]
    fn test_options_observe_any_handle() {
        let first = InvalidationHandle::new();
        let second = InvalidationHandle::new();

        let mut options = EntryOptions::default();
        options
            .set_priority(CachePriority::Low)
            .set_idle_timeout(Some(Duration::from_secs(60)))
            .add_expiration_handle(first.clone())
            .add_expiration_handle(second.clone());

        assert_eq!(options.priority(), CachePriority::Low);
        assert_eq!(options.idle_timeout(), Some(Duration::from_secs(60)));
        assert!(!options.is_invalidated());

        second.invalidate();
        assert!(options.is_invalidated());
        assert!(!first.is_invalidated());
    }
}
