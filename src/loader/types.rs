//! Public types for the loader.

use std::fmt;

use tokio::sync::oneshot;

use crate::error::LoaderError;
use crate::metadata::CollectionAndChangedChunks;

/// Replication role of the local node, as last told to the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaSetRole {
    /// Role not yet initialized; no requests may be dispatched.
    None,
    Primary,
    Secondary,
}

impl fmt::Display for ReplicaSetRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Primary => write!(f, "Primary"),
            Self::Secondary => write!(f, "Secondary"),
        }
    }
}

/// Why in-flight loader operations were interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InterruptReason {
    /// No interruption yet (initial state).
    None,
    SteppedUp,
    SteppedDown,
    Shutdown,
}

impl InterruptReason {
    pub(crate) fn to_error(self) -> LoaderError {
        match self {
            Self::SteppedDown => LoaderError::PrimarySteppedDown,
            Self::Shutdown => LoaderError::InterruptedAtShutdown,
            Self::SteppedUp | Self::None => {
                LoaderError::Interrupted("replica set state changed".into())
            }
        }
    }
}

/// Last interrupt broadcast to in-flight operations: the term it moved the
/// loader to, and why.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Interrupt {
    pub(crate) term: u64,
    pub(crate) reason: InterruptReason,
}

/// Completion handle for one `get_chunks_since` request.
///
/// The request runs on the loader's pool; the handle resolves exactly once,
/// with either the merged metadata or the error that ended the request.
#[derive(Debug)]
pub struct RefreshHandle {
    pub(crate) rx: oneshot::Receiver<Result<CollectionAndChangedChunks, LoaderError>>,
}

impl RefreshHandle {
    /// Wait for the request to complete.
    pub async fn wait(self) -> Result<CollectionAndChangedChunks, LoaderError> {
        match self.rx.await {
            Ok(result) => result,
            // The dispatch task was torn down before it could answer.
            Err(_) => Err(LoaderError::InterruptedAtShutdown),
        }
    }
}
