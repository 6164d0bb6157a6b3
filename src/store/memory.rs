use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;

use super::traits::{RoutingStore, StoreError};
use super::MAX_NAMESPACE_BYTES;
use crate::metadata::{ChunkEntry, CollectionEntry, CollectionUpdate, Namespace};
use crate::version::{ChunkVersion, CollectionEpoch};

/// One mirrored collection: its collections row plus its chunk table, keyed
/// by chunk min-key.
#[derive(Debug, Clone)]
struct CollectionRecord {
    entry: CollectionEntry,
    chunks: BTreeMap<Vec<u8>, ChunkEntry>,
}

/// In-memory [`RoutingStore`], the store used when the loader is embedded
/// without a durable backend and by the test suites.
pub struct MemoryRoutingStore {
    collections: DashMap<Namespace, CollectionRecord>,
}

impl MemoryRoutingStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            collections: DashMap::new(),
        }
    }

    /// Number of mirrored collections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.collections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Number of persisted chunks for `nss`, across all epochs.
    #[must_use]
    pub fn chunk_count(&self, nss: &Namespace) -> usize {
        self.collections.get(nss).map_or(0, |r| r.chunks.len())
    }

    fn check_namespace(nss: &Namespace) -> Result<(), StoreError> {
        if nss.as_str().len() > MAX_NAMESPACE_BYTES {
            return Err(StoreError::KeyTooLong(nss.as_str().to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryRoutingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoutingStore for MemoryRoutingStore {
    async fn read_collection_entry(&self, nss: &Namespace) -> Result<CollectionEntry, StoreError> {
        self.collections
            .get(nss)
            .map(|r| r.entry.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn upsert_collection_entry(
        &self,
        nss: &Namespace,
        update: &CollectionUpdate,
    ) -> Result<(), StoreError> {
        Self::check_namespace(nss)?;

        match self.collections.entry(nss.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occ) => {
                let entry = &mut occ.get_mut().entry;
                entry.uuid = update.uuid;
                entry.epoch = update.epoch;
                entry.shard_key_pattern = update.shard_key_pattern.clone();
                entry.default_collation = update.default_collation.clone();
                entry.unique = update.unique;
                // Refresh markers are owned by set/unset_refreshing.
            }
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                vac.insert(CollectionRecord {
                    entry: CollectionEntry::from_update(update),
                    chunks: BTreeMap::new(),
                });
            }
        }
        Ok(())
    }

    async fn set_refreshing(&self, nss: &Namespace) -> Result<(), StoreError> {
        let mut record = self.collections.get_mut(nss).ok_or(StoreError::NotFound)?;
        record.entry.refreshing = true;
        Ok(())
    }

    async fn unset_refreshing(
        &self,
        nss: &Namespace,
        last_refreshed: ChunkVersion,
    ) -> Result<(), StoreError> {
        let mut record = self.collections.get_mut(nss).ok_or(StoreError::NotFound)?;
        record.entry.refreshing = false;
        record.entry.last_refreshed_version = Some(last_refreshed);
        Ok(())
    }

    async fn read_chunks_since(
        &self,
        nss: &Namespace,
        since: ChunkVersion,
        epoch: CollectionEpoch,
    ) -> Result<Vec<ChunkEntry>, StoreError> {
        let record = self.collections.get(nss).ok_or(StoreError::NotFound)?;

        let mut chunks: Vec<ChunkEntry> = record
            .chunks
            .values()
            .filter(|c| c.version.epoch == epoch && c.version.ordinal() >= since.ordinal())
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.version.ordinal());
        Ok(chunks)
    }

    async fn read_highest_version(
        &self,
        nss: &Namespace,
        epoch: CollectionEpoch,
    ) -> Result<Option<ChunkVersion>, StoreError> {
        let record = self.collections.get(nss).ok_or(StoreError::NotFound)?;

        Ok(record
            .chunks
            .values()
            .filter(|c| c.version.epoch == epoch)
            .map(|c| c.version)
            .max_by_key(ChunkVersion::ordinal))
    }

    async fn apply_chunk_diff(
        &self,
        nss: &Namespace,
        chunks: &[ChunkEntry],
        epoch: CollectionEpoch,
    ) -> Result<(), StoreError> {
        Self::check_namespace(nss)?;

        let mut record = self.collections.get_mut(nss).ok_or(StoreError::NotFound)?;

        for chunk in chunks {
            debug_assert_eq!(chunk.version.epoch, epoch);

            let stale: Vec<Vec<u8>> = record
                .chunks
                .values()
                .filter(|existing| existing.overlaps(&chunk.min_key, &chunk.max_key))
                .map(|existing| existing.min_key.clone())
                .collect();
            for key in stale {
                record.chunks.remove(&key);
            }

            record.chunks.insert(chunk.min_key.clone(), chunk.clone());
        }
        Ok(())
    }

    async fn drop_chunks_and_entry(&self, nss: &Namespace) -> Result<(), StoreError> {
        self.collections.remove(nss);
        Ok(())
    }
}
