//! Error taxonomy for store operations.
//!
//! Failures of user code (reducers, middlewares, listeners) are panics and
//! propagate as panics, aborting the current drain while leaving queued items
//! in place. Event-handler failures are contained on the worker that ran
//! them. The variants below are the errors the store itself can produce.

use thiserror::Error;

/// Errors surfaced by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store has no state yet: `Init` has not been dispatched (or the
    /// reducer has not produced a first state).
    #[error("store has not been initialized yet")]
    UninitializedStore,

    /// A weakly held listener was invoked after its target was dropped.
    ///
    /// The dead entry is pruned before this error is returned; a subsequent
    /// notification pass will not see it again.
    #[error("weakly held callback was dropped before it was invoked")]
    CollectedWeakReference,

    /// The state could not be serialized into a snapshot.
    #[error("failed to serialize state snapshot")]
    Snapshot(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_are_stable() {
        assert_eq!(
            StoreError::UninitializedStore.to_string(),
            "store has not been initialized yet"
        );
        assert_eq!(
            StoreError::CollectedWeakReference.to_string(),
            "weakly held callback was dropped before it was invoked"
        );
    }
}
