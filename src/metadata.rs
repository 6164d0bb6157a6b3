//! Routing metadata records.
//!
//! These are the rows of the shard-local mirror and the payload returned to
//! routing-table readers. A collection's chunks tile its key space without
//! gaps or overlap; each chunk row carries the version under which it last
//! changed, and the collection row carries the two-phase refresh marker
//! (`refreshing` + `last_refreshed_version`) that defines coherent read
//! points for secondaries.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::version::{ChunkVersion, CollectionEpoch};

/// Fully qualified collection name (`db.collection`). Used as the key of
/// every per-collection structure in the crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(String);

impl Namespace {
    #[must_use]
    pub fn new(ns: impl Into<String>) -> Self {
        Self(ns.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Namespace {
    fn from(ns: &str) -> Self {
        Self::new(ns)
    }
}

/// Identifier of the shard that owns a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry of a chunk's ownership history: which shard owned it from which
/// logical time onward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHistoryEntry {
    pub valid_after: u64,
    pub shard: ShardId,
}

/// A contiguous key range `[min_key, max_key)` of a sharded collection,
/// owned by exactly one shard. Keys order bytewise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub shard: ShardId,
    pub version: ChunkVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<ChunkHistoryEntry>>,
}

impl ChunkEntry {
    /// Whether this chunk's key range intersects `[min, max)`.
    #[must_use]
    pub fn overlaps(&self, min: &[u8], max: &[u8]) -> bool {
        self.min_key.as_slice() < max && min < self.max_key.as_slice()
    }
}

/// The identity fields of a collection entry, written by upserts.
///
/// Deliberately excludes the refresh markers: an upsert must never clobber
/// `refreshing` or `last_refreshed_version`, which only the bracketing
/// marker writes may touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionUpdate {
    pub uuid: Option<Uuid>,
    pub epoch: CollectionEpoch,
    pub shard_key_pattern: Value,
    pub default_collation: Value,
    pub unique: bool,
}

/// One row of the shard's collections table: the persisted identity of a
/// sharded collection plus its refresh marker pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub uuid: Option<Uuid>,
    pub epoch: CollectionEpoch,
    pub shard_key_pattern: Value,
    pub default_collation: Value,
    pub unique: bool,
    /// True while a chunk-apply burst is in flight for this collection.
    pub refreshing: bool,
    /// Highest version through which the chunk table is known coherent.
    /// Only meaningful when `refreshing` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refreshed_version: Option<ChunkVersion>,
}

impl CollectionEntry {
    /// Build a fresh entry from an upsert, with the markers cleared.
    #[must_use]
    pub fn from_update(update: &CollectionUpdate) -> Self {
        Self {
            uuid: update.uuid,
            epoch: update.epoch,
            shard_key_pattern: update.shard_key_pattern.clone(),
            default_collation: update.default_collation.clone(),
            unique: update.unique,
            refreshing: false,
            last_refreshed_version: None,
        }
    }

    /// The refresh marker pair as a comparable unit.
    #[must_use]
    pub fn refresh_state(&self) -> RefreshState {
        RefreshState {
            refreshing: self.refreshing,
            last_refreshed_version: self.last_refreshed_version,
        }
    }
}

/// Snapshot of the two-phase refresh marker. Secondary readers capture one
/// before and one after a chunk read; the read is coherent only when the two
/// snapshots are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshState {
    pub refreshing: bool,
    pub last_refreshed_version: Option<ChunkVersion>,
}

impl fmt::Display for RefreshState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last_refreshed_version {
            Some(v) => write!(f, "refreshing={}, lastRefreshed={}", self.refreshing, v),
            None => write!(f, "refreshing={}, lastRefreshed=none", self.refreshing),
        }
    }
}

/// The payload handed to routing-table readers: the collection's identity
/// plus every chunk that changed at or after the requested version, in
/// ascending version order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionAndChangedChunks {
    pub uuid: Option<Uuid>,
    pub epoch: CollectionEpoch,
    pub shard_key_pattern: Value,
    pub default_collation: Value,
    pub unique: bool,
    pub changed_chunks: Vec<ChunkEntry>,
}

impl CollectionAndChangedChunks {
    /// True when no chunks are carried. An empty payload stands for "nothing
    /// here": either the collection is gone or a concurrent rewrite raced
    /// the read.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed_chunks.is_empty()
    }

    /// Version of the newest carried chunk, if any.
    #[must_use]
    pub fn highest_version(&self) -> Option<ChunkVersion> {
        self.changed_chunks.last().map(|c| c.version)
    }

    /// The identity fields, for writing the collections row.
    #[must_use]
    pub fn to_update(&self) -> CollectionUpdate {
        CollectionUpdate {
            uuid: self.uuid,
            epoch: self.epoch,
            shard_key_pattern: self.shard_key_pattern.clone(),
            default_collation: self.default_collation.clone(),
            unique: self.unique,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(min: &[u8], max: &[u8], major: u32, minor: u32, epoch: CollectionEpoch) -> ChunkEntry {
        ChunkEntry {
            min_key: min.to_vec(),
            max_key: max.to_vec(),
            shard: ShardId::new("shard0"),
            version: ChunkVersion::new(major, minor, epoch),
            history: None,
        }
    }

    #[test]
    fn test_chunk_overlap() {
        let epoch = CollectionEpoch::new();
        let c = chunk(b"b", b"d", 1, 0, epoch);

        assert!(c.overlaps(b"a", b"c"));
        assert!(c.overlaps(b"c", b"z"));
        assert!(c.overlaps(b"a", b"z"));
        assert!(c.overlaps(b"b", b"d"));

        // Half-open ranges: touching boundaries do not overlap.
        assert!(!c.overlaps(b"a", b"b"));
        assert!(!c.overlaps(b"d", b"z"));
    }

    #[test]
    fn test_collection_entry_serde_round_trip() {
        let entry = CollectionEntry {
            uuid: Some(Uuid::new_v4()),
            epoch: CollectionEpoch::new(),
            shard_key_pattern: json!({"user_id": 1}),
            default_collation: json!({}),
            unique: true,
            refreshing: true,
            last_refreshed_version: Some(ChunkVersion::new(4, 2, CollectionEpoch::new())),
        };

        let bytes = serde_json::to_vec(&entry).unwrap();
        let back: CollectionEntry = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(entry, back);
    }

    #[test]
    fn test_chunk_entry_serde_round_trip() {
        let epoch = CollectionEpoch::new();
        let mut c = chunk(b"a", b"m", 2, 5, epoch);
        c.history = Some(vec![ChunkHistoryEntry {
            valid_after: 17,
            shard: ShardId::new("shard1"),
        }]);

        let bytes = serde_json::to_vec(&c).unwrap();
        let back: ChunkEntry = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(c, back);
    }

    #[test]
    fn test_payload_highest_version() {
        let epoch = CollectionEpoch::new();
        let payload = CollectionAndChangedChunks {
            epoch,
            shard_key_pattern: json!({"k": 1}),
            changed_chunks: vec![chunk(b"a", b"m", 1, 0, epoch), chunk(b"m", b"z", 1, 1, epoch)],
            ..Default::default()
        };

        assert_eq!(
            payload.highest_version(),
            Some(ChunkVersion::new(1, 1, epoch))
        );
        assert!(!payload.is_empty());
        assert!(CollectionAndChangedChunks::default().is_empty());
    }

    #[test]
    fn test_refresh_state_equality() {
        let epoch = CollectionEpoch::new();
        let a = RefreshState {
            refreshing: false,
            last_refreshed_version: Some(ChunkVersion::new(1, 0, epoch)),
        };
        let b = RefreshState {
            refreshing: false,
            last_refreshed_version: Some(ChunkVersion::new(1, 1, epoch)),
        };
        assert_ne!(a, b);
        assert_eq!(a, a);
    }
}
