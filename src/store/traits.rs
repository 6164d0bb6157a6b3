use async_trait::async_trait;
use thiserror::Error;

use crate::metadata::{ChunkEntry, CollectionEntry, CollectionUpdate, Namespace};
use crate::version::{ChunkVersion, CollectionEpoch};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no persisted entry for namespace")]
    NotFound,
    #[error("fully qualified namespace '{0}' is too long (max is {max} bytes)", max = super::MAX_NAMESPACE_BYTES)]
    KeyTooLong(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// The shard-local persistent tables the loader mirrors routing metadata
/// into: one collections table and one chunk table per collection.
///
/// Implementations must be internally thread-safe, but they may assume that
/// writes for a single namespace are serialized, since the loader runs at
/// most one apply worker per namespace. Chunk writes are atomic per chunk, not
/// across a batch; readers tolerate partial batches through the
/// `refreshing` marker bracketing every write burst.
#[async_trait]
pub trait RoutingStore: Send + Sync {
    /// Read the collections row for `nss`. `StoreError::NotFound` when the
    /// collection has no persisted metadata.
    async fn read_collection_entry(&self, nss: &Namespace) -> Result<CollectionEntry, StoreError>;

    /// Insert or update the collections row for `nss` with the identity
    /// fields of `update`. Idempotent. Must leave the refresh markers of an
    /// existing row untouched.
    async fn upsert_collection_entry(
        &self,
        nss: &Namespace,
        update: &CollectionUpdate,
    ) -> Result<(), StoreError>;

    /// Durably mark a chunk-apply burst as in flight.
    async fn set_refreshing(&self, nss: &Namespace) -> Result<(), StoreError>;

    /// Durably mark the burst finished, recording the version through which
    /// the chunk table is now coherent.
    async fn unset_refreshing(
        &self,
        nss: &Namespace,
        last_refreshed: ChunkVersion,
    ) -> Result<(), StoreError>;

    /// The diff query: every chunk of `epoch` with `version >= since`, in
    /// ascending version order. Rows from other epochs are invisible.
    async fn read_chunks_since(
        &self,
        nss: &Namespace,
        since: ChunkVersion,
        epoch: CollectionEpoch,
    ) -> Result<Vec<ChunkEntry>, StoreError>;

    /// Highest persisted chunk version of `epoch`, if any chunks exist.
    async fn read_highest_version(
        &self,
        nss: &Namespace,
        epoch: CollectionEpoch,
    ) -> Result<Option<ChunkVersion>, StoreError>;

    /// Merge a chunk diff into the table: for each new chunk, delete every
    /// existing chunk whose key range intersects it, then insert the new
    /// chunk.
    async fn apply_chunk_diff(
        &self,
        nss: &Namespace,
        chunks: &[ChunkEntry],
        epoch: CollectionEpoch,
    ) -> Result<(), StoreError>;

    /// Drop the chunk table and delete the collections row. Succeeds when
    /// nothing is persisted.
    async fn drop_chunks_and_entry(&self, nss: &Namespace) -> Result<(), StoreError>;
}
