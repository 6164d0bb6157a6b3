//! Loader error taxonomy.

use thiserror::Error;

use crate::store::StoreError;
use crate::upstream::RemoteError;

/// Errors surfaced by the loader and its collaborator seams.
#[derive(Error, Debug)]
pub enum LoaderError {
    /// The collection does not exist upstream. On the primary path this is
    /// not a failure: it enqueues a drop of the local mirror.
    #[error("namespace not found")]
    NamespaceNotFound,

    /// The upstream view was inconsistent (an epoch changed mid-read).
    /// Transient; the caller should retry the refresh.
    #[error("conflicting operation in progress: {0}")]
    ConflictingOperationInProgress(String),

    /// The replica set state changed under the operation.
    #[error("interrupted: {0}")]
    Interrupted(String),

    /// The node lost its primaryship while the operation was in flight.
    #[error("primary stepped down")]
    PrimarySteppedDown,

    /// The loader is shutting down.
    #[error("interrupted at shutdown")]
    InterruptedAtShutdown,

    /// An operation that requires the primary role ran elsewhere, or the
    /// term changed while it waited.
    #[error("not master: {0}")]
    NotMaster(String),

    /// A local metadata read failed for a reason other than absence.
    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl LoaderError {
    /// Shutdown-class errors make apply workers exit silently instead of
    /// logging and retrying.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::InterruptedAtShutdown)
    }

    /// Any interruption caused by a role transition or shutdown.
    #[must_use]
    pub fn is_interruption(&self) -> bool {
        matches!(
            self,
            Self::Interrupted(_) | Self::PrimarySteppedDown | Self::InterruptedAtShutdown
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_classification() {
        assert!(LoaderError::InterruptedAtShutdown.is_shutdown());
        assert!(!LoaderError::PrimarySteppedDown.is_shutdown());
        assert!(!LoaderError::NamespaceNotFound.is_shutdown());
    }

    #[test]
    fn test_interruption_classification() {
        assert!(LoaderError::PrimarySteppedDown.is_interruption());
        assert!(LoaderError::Interrupted("role changed".into()).is_interruption());
        assert!(LoaderError::InterruptedAtShutdown.is_interruption());
        assert!(!LoaderError::NamespaceNotFound.is_interruption());
        assert!(!LoaderError::OperationFailed("read".into()).is_interruption());
    }
}
