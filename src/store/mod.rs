//! Persistent store seam.
//!
//! The loader mirrors routing metadata into two logical tables per shard: a
//! collections table (one row per sharded collection, carrying the refresh
//! marker pair) and one chunk table per collection, keyed by chunk min-key
//! with an index on version to support the diff query. The [`RoutingStore`]
//! trait is that seam; [`MemoryRoutingStore`] is the in-process
//! implementation.

pub mod memory;
pub mod traits;

pub use memory::MemoryRoutingStore;
pub use traits::{RoutingStore, StoreError};

/// Maximum byte length of a fully qualified namespace the store accepts.
/// Longer names would overflow the per-collection chunk table name.
pub const MAX_NAMESPACE_BYTES: usize = 120;
