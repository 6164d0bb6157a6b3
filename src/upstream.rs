//! Collaborator seams: the config-server loader, the replication
//! coordinator, and the command channel a secondary uses to drive a primary
//! refresh. The loader only ever talks to these traits; wire protocols live
//! behind them.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::LoaderError;
use crate::metadata::{CollectionAndChangedChunks, Namespace};
use crate::version::ChunkVersion;

/// Monotone logical timestamp of a replicated operation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct OpTime(pub u64);

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failures of the secondary-to-primary refresh command.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Write-concern-class failure. The command is idempotent, so these are
    /// retried a bounded number of times.
    #[error("write concern failed: {0}")]
    WriteConcern(String),

    /// The command did not complete within the configured deadline.
    #[error("primary refresh timed out after {0} ms")]
    Timeout(u64),

    /// Any other command failure. Not retried.
    #[error("remote command failed: {0}")]
    Command(String),
}

impl RemoteError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WriteConcern(_))
    }
}

/// Upstream source of chunk diffs: the config replica set.
///
/// The contract mirrors the loader's own read path, without persistence:
/// return the collection identity plus every chunk with `version >= since`,
/// ascending, filtered to the collection's current epoch. A collection that
/// no longer exists yields [`LoaderError::NamespaceNotFound`].
#[async_trait]
pub trait ConfigLoader: Send + Sync {
    async fn get_chunks_since(
        &self,
        nss: &Namespace,
        since: ChunkVersion,
    ) -> Result<CollectionAndChangedChunks, LoaderError>;
}

/// The node's replication machinery.
#[async_trait]
pub trait ReplicationCoordinator: Send + Sync {
    /// Write a no-op and wait for majority acknowledgement. Fails when this
    /// node cannot currently establish itself as the majority primary.
    async fn wait_for_majority(&self) -> Result<(), LoaderError>;

    /// Wait until this node has applied operations up to `op_time`.
    async fn wait_until_op_time(&self, op_time: OpTime) -> Result<(), LoaderError>;
}

/// Command channel from a secondary to its primary: ask the primary to
/// refresh its routing table for `nss` and report the operation time at
/// which the refresh was durable.
#[async_trait]
pub trait PrimaryRefresher: Send + Sync {
    async fn force_routing_table_refresh(&self, nss: &Namespace) -> Result<OpTime, RemoteError>;
}
