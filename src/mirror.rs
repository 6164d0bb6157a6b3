//! Reads and writes of the persisted mirror.
//!
//! The write path brackets every chunk burst with the durable `refreshing`
//! markers, which is what makes crash recovery trivial: an entry observed
//! with `refreshing=true` simply means the next diff query starts over from
//! the unchanged `last_refreshed_version`. The read path tolerates
//! concurrent appends and reports a raced drop-and-recreate as an empty
//! result rather than a corrupt one.

use tracing::debug;

use crate::error::LoaderError;
use crate::metadata::{CollectionAndChangedChunks, Namespace};
use crate::store::{RoutingStore, StoreError};
use crate::version::ChunkVersion;

/// Persist one fetched diff: upsert the collections row, raise the
/// refreshing marker, merge the chunks, then lower the marker recording the
/// newest applied version.
pub(crate) async fn persist_collection_and_changed_chunks(
    store: &dyn RoutingStore,
    nss: &Namespace,
    payload: &CollectionAndChangedChunks,
) -> Result<(), LoaderError> {
    let last_refreshed = payload
        .highest_version()
        .expect("persisting an empty chunk diff");

    store.upsert_collection_entry(nss, &payload.to_update()).await?;
    store.set_refreshing(nss).await?;
    store
        .apply_chunk_diff(nss, &payload.changed_chunks, payload.epoch)
        .await?;
    store.unset_refreshing(nss, last_refreshed).await?;

    debug!(
        %nss,
        version = %last_refreshed,
        chunks = payload.changed_chunks.len(),
        "persisted chunk metadata"
    );
    Ok(())
}

/// Highest version the persisted mirror knows for `nss`, or the unsharded
/// sentinel when nothing is persisted.
///
/// Unsafe to call while a task for `nss` is being applied: the collection
/// could be dropped and recreated between reading the entry and reading the
/// chunks, making the combined version meaningless. The primary path only
/// calls it when the task queue for `nss` is quiet.
pub(crate) async fn persisted_max_version(
    store: &dyn RoutingStore,
    nss: &Namespace,
) -> Result<ChunkVersion, LoaderError> {
    let entry = match store.read_collection_entry(nss).await {
        Ok(entry) => entry,
        Err(StoreError::NotFound) => return Ok(ChunkVersion::unsharded()),
        Err(err) => {
            return Err(LoaderError::OperationFailed(format!(
                "failed to read persisted collections entry for '{nss}': {err}"
            )))
        }
    };

    match store.read_highest_version(nss, entry.epoch).await {
        Ok(Some(version)) => Ok(version),
        Ok(None) => Ok(ChunkVersion::unsharded()),
        Err(err) => Err(LoaderError::OperationFailed(format!(
            "failed to read highest persisted chunk version for '{nss}': {err}"
        ))),
    }
}

/// Persisted metadata with versions GTE `since`.
///
/// When the persisted epoch differs from `since`'s epoch the whole mirror
/// is returned (the caller's view is from a dead incarnation). Returns
/// [`LoaderError::NamespaceNotFound`] when no entry exists; an existing
/// entry with no matching chunks yields an empty chunk list without error.
pub(crate) async fn persisted_metadata_since_version(
    store: &dyn RoutingStore,
    nss: &Namespace,
    since: ChunkVersion,
) -> Result<CollectionAndChangedChunks, LoaderError> {
    let entry = match store.read_collection_entry(nss).await {
        Ok(entry) => entry,
        Err(StoreError::NotFound) => return Err(LoaderError::NamespaceNotFound),
        Err(err) => return Err(err.into()),
    };

    let starting_version = if entry.epoch == since.epoch {
        since
    } else {
        ChunkVersion::new(0, 0, entry.epoch)
    };

    let changed_chunks = match store
        .read_chunks_since(nss, starting_version, entry.epoch)
        .await
    {
        Ok(chunks) => chunks,
        // A drop raced us between the entry read and the chunks read.
        Err(StoreError::NotFound) => return Err(LoaderError::NamespaceNotFound),
        Err(err) => return Err(err.into()),
    };

    Ok(CollectionAndChangedChunks {
        uuid: entry.uuid,
        epoch: entry.epoch,
        shard_key_pattern: entry.shard_key_pattern,
        default_collation: entry.default_collation,
        unique: entry.unique,
        changed_chunks,
    })
}

/// Like [`persisted_metadata_since_version`], but tolerant of concurrent
/// mirror maintenance: a read that raced an in-progress update or a
/// drop-and-recreate comes back empty instead of inconsistent. Safe because
/// same-epoch chunk writes only append versions.
pub(crate) async fn incomplete_persisted_metadata_since_version(
    store: &dyn RoutingStore,
    nss: &Namespace,
    since: ChunkVersion,
) -> Result<CollectionAndChangedChunks, LoaderError> {
    let coll_and_chunks = match persisted_metadata_since_version(store, nss, since).await {
        Ok(coll_and_chunks) => coll_and_chunks,
        Err(LoaderError::NamespaceNotFound) => return Ok(CollectionAndChangedChunks::default()),
        Err(err) => {
            return Err(LoaderError::OperationFailed(format!(
                "failed to load local metadata for '{nss}': {err}"
            )))
        }
    };

    if coll_and_chunks.is_empty() {
        // Found a collections entry, but the chunks are being rewritten.
        return Ok(CollectionAndChangedChunks::default());
    }

    // An epoch change between reading the collections entry and reading the
    // chunks would invalidate everything read so far.
    match store.read_collection_entry(nss).await {
        Ok(after) if after.epoch == coll_and_chunks.epoch => Ok(coll_and_chunks),
        Ok(_) | Err(StoreError::NotFound) => Ok(CollectionAndChangedChunks::default()),
        Err(err) => Err(LoaderError::OperationFailed(format!(
            "failed to load local metadata for '{nss}': {err}"
        ))),
    }
}
