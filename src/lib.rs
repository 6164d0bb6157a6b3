//! # Routing Cache
//!
//! A shard-local routing table cache loader for sharded document stores.
//!
//! ## Architecture
//!
//! Each shard node answers queries against sharded collections using a
//! mapping from key ranges ("chunks") to owning shards. The authoritative
//! mapping lives on the config replica set; this crate maintains the
//! shard's local view of it:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Dispatch Layer                         │
//! │  • get_chunks_since() selects the primary or secondary path │
//! │  • role + term guard every request                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Delta Pipeline (primary)                  │
//! │  • incremental diff fetch from the config server            │
//! │  • per-collection task queues, majority-guarded enqueue     │
//! │  • one apply worker per collection                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                    (crash-safe marker writes)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Persisted Mirror                        │
//! │  • collections table with two-phase refresh markers         │
//! │  • one chunk table per collection, diff-queryable           │
//! │  • replicated to secondaries by the embedding process       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Readers are answered from the mirror *merged with* whatever diffs are
//! still queued, so a refresh never has to wait for persistence. Secondaries
//! never talk to the config server: they ask the primary to refresh, wait
//! for replication, and read marker-coherent local state.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use routing_cache::{
//!     ChunkVersion, LoaderConfig, MemoryRoutingStore, Namespace, RoutingCacheLoader,
//! };
//! # use routing_cache::{CollectionAndChangedChunks, LoaderError, OpTime, RemoteError};
//! # struct MyConfigClient;
//! # #[async_trait::async_trait]
//! # impl routing_cache::ConfigLoader for MyConfigClient {
//! #     async fn get_chunks_since(&self, _: &Namespace, _: ChunkVersion)
//! #         -> Result<CollectionAndChangedChunks, LoaderError> { unimplemented!() }
//! # }
//! # struct MyRepl;
//! # #[async_trait::async_trait]
//! # impl routing_cache::ReplicationCoordinator for MyRepl {
//! #     async fn wait_for_majority(&self) -> Result<(), LoaderError> { Ok(()) }
//! #     async fn wait_until_op_time(&self, _: OpTime) -> Result<(), LoaderError> { Ok(()) }
//! # }
//! # struct MyRefresher;
//! # #[async_trait::async_trait]
//! # impl routing_cache::PrimaryRefresher for MyRefresher {
//! #     async fn force_routing_table_refresh(&self, _: &Namespace)
//! #         -> Result<OpTime, RemoteError> { unimplemented!() }
//! # }
//!
//! #[tokio::main]
//! async fn main() {
//!     let loader = RoutingCacheLoader::new(
//!         LoaderConfig::default(),
//!         Arc::new(MyConfigClient),
//!         Arc::new(MemoryRoutingStore::new()),
//!         Arc::new(MyRepl),
//!         Arc::new(MyRefresher),
//!     );
//!     loader.initialize_replica_set_role(true);
//!
//!     let handle = loader.get_chunks_since(
//!         Namespace::new("db.users"),
//!         ChunkVersion::unsharded(),
//!     );
//!     let metadata = handle.wait().await.expect("refresh failed");
//!     println!("{} chunks", metadata.changed_chunks.len());
//!
//!     loader.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`loader`]: the [`RoutingCacheLoader`] state machine
//! - [`store`]: the persistent store seam and in-memory implementation
//! - [`task`]: per-collection apply queues
//! - [`merge`]: merging persisted and enqueued metadata
//! - [`notify`]: per-namespace change notifications
//! - [`upstream`]: config-server, replication, and refresh-command seams

pub mod config;
pub mod error;
pub mod loader;
pub mod merge;
pub mod metadata;
pub mod metrics;
pub mod notify;
pub mod store;
pub mod task;
pub mod upstream;
pub mod version;

mod mirror;

pub use config::{LoaderConfig, StaleTermPolicy};
pub use error::LoaderError;
pub use loader::{RefreshHandle, ReplicaSetRole, RoutingCacheLoader};
pub use metadata::{
    ChunkEntry, ChunkHistoryEntry, CollectionAndChangedChunks, CollectionEntry, CollectionUpdate,
    Namespace, RefreshState, ShardId,
};
pub use notify::{NamespaceNotifications, NamespaceSubscription};
pub use store::{MemoryRoutingStore, RoutingStore, StoreError};
pub use task::{Task, TaskList};
pub use upstream::{ConfigLoader, OpTime, PrimaryRefresher, RemoteError, ReplicationCoordinator};
pub use version::{ChunkVersion, CollectionEpoch};
