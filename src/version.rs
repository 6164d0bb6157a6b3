//! Chunk version numbering.
//!
//! A [`ChunkVersion`] is a `(major, minor)` pair scoped to a collection
//! incarnation (the [`CollectionEpoch`]). Versions from different epochs are
//! incomparable: a drop-and-recreate of a collection starts a new epoch and
//! invalidates every version ordering established under the old one. The
//! `PartialOrd` impl encodes this directly by returning `None` across epochs,
//! so cross-epoch comparisons cannot silently produce a stable order.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique id for one incarnation of a collection.
///
/// Dropping and recreating a collection produces a new epoch. The zero epoch
/// (nil UUID) is reserved for the unsharded sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionEpoch(Uuid);

impl CollectionEpoch {
    /// A fresh, unique epoch.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The reserved zero epoch.
    #[must_use]
    pub fn zero() -> Self {
        Self(Uuid::nil())
    }

    /// True for the reserved zero epoch.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for CollectionEpoch {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Display for CollectionEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Version of a chunk within one collection epoch.
///
/// Within an epoch, versions order lexicographically by `(major, minor)` and
/// strictly increase as chunks migrate and split. Across epochs there is no
/// order at all.
///
/// # Example
///
/// ```
/// use routing_cache::{ChunkVersion, CollectionEpoch};
///
/// let epoch = CollectionEpoch::new();
/// let a = ChunkVersion::new(1, 0, epoch);
/// let b = ChunkVersion::new(1, 2, epoch);
/// assert!(a < b);
///
/// let other = ChunkVersion::new(5, 0, CollectionEpoch::new());
/// assert_eq!(a.partial_cmp(&other), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkVersion {
    pub major: u32,
    pub minor: u32,
    pub epoch: CollectionEpoch,
}

impl ChunkVersion {
    #[must_use]
    pub fn new(major: u32, minor: u32, epoch: CollectionEpoch) -> Self {
        Self {
            major,
            minor,
            epoch,
        }
    }

    /// Sentinel for "no sharded metadata": `(0, 0)` in the zero epoch.
    #[must_use]
    pub fn unsharded() -> Self {
        Self::new(0, 0, CollectionEpoch::zero())
    }

    /// Whether this version carries any information. `(0, 0)` in any epoch
    /// means "nothing known"; a task created from one requests a full reload.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.major != 0 || self.minor != 0
    }

    /// True when both versions belong to the same collection incarnation.
    #[must_use]
    pub fn same_epoch(&self, other: &Self) -> bool {
        self.epoch == other.epoch
    }

    /// Ordering key within one epoch. Callers must have established that the
    /// epochs match; sorting mixed-epoch versions by this key is meaningless.
    #[must_use]
    pub fn ordinal(&self) -> (u32, u32) {
        (self.major, self.minor)
    }
}

impl PartialOrd for ChunkVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if !self.same_epoch(other) {
            return None;
        }
        Some(self.ordinal().cmp(&other.ordinal()))
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}||{}", self.major, self.minor, self.epoch)
    }
}
