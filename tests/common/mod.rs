//! Shared fakes and builders for the loader test suites.
//!
//! The loader's collaborators are all traits, so the tests script them:
//! a config server that replays queued responses (or serves a live
//! authoritative chunk set), a replication coordinator with switchable
//! majority behavior, a primary-refresh channel that emulates the primary
//! plus replication by writing straight into the local store, and a store
//! wrapper that injects faults and gates applies.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;

use routing_cache::{
    ChunkEntry, ChunkVersion, CollectionAndChangedChunks, CollectionEpoch, CollectionUpdate,
    ConfigLoader, LoaderError, MemoryRoutingStore, Namespace, OpTime, PrimaryRefresher,
    RemoteError, ReplicationCoordinator, RoutingStore, ShardId, StoreError,
};

// =============================================================================
// Builders
// =============================================================================

pub fn nss(name: &str) -> Namespace {
    Namespace::new(name)
}

pub fn chunk(min: &[u8], max: &[u8], major: u32, minor: u32, epoch: CollectionEpoch) -> ChunkEntry {
    ChunkEntry {
        min_key: min.to_vec(),
        max_key: max.to_vec(),
        shard: ShardId::new("shard0"),
        version: ChunkVersion::new(major, minor, epoch),
        history: None,
    }
}

pub fn payload(epoch: CollectionEpoch, chunks: Vec<ChunkEntry>) -> CollectionAndChangedChunks {
    CollectionAndChangedChunks {
        uuid: None,
        epoch,
        shard_key_pattern: json!({"x": 1}),
        default_collation: json!({}),
        unique: false,
        changed_chunks: chunks,
    }
}

pub fn versions_of(coll: &CollectionAndChangedChunks) -> Vec<(u32, u32)> {
    coll.changed_chunks.iter().map(|c| c.version.ordinal()).collect()
}

/// Write a payload into a store the way an applied refresh would: entry
/// upsert, marker up, chunks, marker down.
pub async fn persist_like_primary(store: &dyn RoutingStore, ns: &Namespace, p: &CollectionAndChangedChunks) {
    let update = CollectionUpdate {
        uuid: p.uuid,
        epoch: p.epoch,
        shard_key_pattern: p.shard_key_pattern.clone(),
        default_collation: p.default_collation.clone(),
        unique: p.unique,
    };
    store.upsert_collection_entry(ns, &update).await.unwrap();
    store.set_refreshing(ns).await.unwrap();
    store
        .apply_chunk_diff(ns, &p.changed_chunks, p.epoch)
        .await
        .unwrap();
    store
        .unset_refreshing(ns, p.changed_chunks.last().unwrap().version)
        .await
        .unwrap();
}

// =============================================================================
// Scripted config server
// =============================================================================

pub enum ScriptedResponse {
    Metadata(CollectionAndChangedChunks),
    NotFound,
    Error(String),
}

/// Replays queued responses per namespace; panics on an unscripted fetch so
/// tests notice extra upstream traffic.
pub struct ScriptedConfigServer {
    responses: Mutex<HashMap<Namespace, VecDeque<ScriptedResponse>>>,
    calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedConfigServer {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            delay: Mutex::new(None),
        }
    }

    pub fn push(&self, ns: &Namespace, response: ScriptedResponse) {
        self.responses.lock().entry(ns.clone()).or_default().push_back(response);
    }

    /// Delay every fetch, to widen concurrency windows.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigLoader for ScriptedConfigServer {
    async fn get_chunks_since(
        &self,
        ns: &Namespace,
        _since: ChunkVersion,
    ) -> Result<CollectionAndChangedChunks, LoaderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let response = self
            .responses
            .lock()
            .get_mut(ns)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| panic!("unscripted config fetch for '{ns}'"));

        match response {
            ScriptedResponse::Metadata(m) => Ok(m),
            ScriptedResponse::NotFound => Err(LoaderError::NamespaceNotFound),
            ScriptedResponse::Error(reason) => Err(LoaderError::OperationFailed(reason)),
        }
    }
}

// =============================================================================
// Live authoritative config server (for stress tests)
// =============================================================================

/// Holds an authoritative chunk set and answers real diff queries against
/// it, like the config replica set would.
pub struct AuthoritativeConfigServer {
    state: Mutex<CollectionAndChangedChunks>,
    calls: AtomicUsize,
}

impl AuthoritativeConfigServer {
    pub fn new(initial: CollectionAndChangedChunks) -> Self {
        Self {
            state: Mutex::new(initial),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn highest_version(&self) -> ChunkVersion {
        self.state.lock().highest_version().unwrap()
    }

    /// Split the chunk owning `key` at `at`, bumping the minor version twice.
    pub fn split_chunk(&self, key: &[u8], at: &[u8]) {
        let mut state = self.state.lock();
        let epoch = state.epoch;
        let top = state.highest_version().unwrap();

        let index = state
            .changed_chunks
            .iter()
            .position(|c| c.min_key.as_slice() <= key && key < c.max_key.as_slice())
            .expect("no chunk owns the split key");
        let old = state.changed_chunks.remove(index);
        assert!(old.min_key.as_slice() < at && at < old.max_key.as_slice());

        let left = ChunkEntry {
            max_key: at.to_vec(),
            version: ChunkVersion::new(top.major, top.minor + 1, epoch),
            ..old.clone()
        };
        let right = ChunkEntry {
            min_key: at.to_vec(),
            version: ChunkVersion::new(top.major, top.minor + 2, epoch),
            ..old
        };
        state.changed_chunks.push(left);
        state.changed_chunks.push(right);
        state.changed_chunks.sort_by_key(|c| c.version.ordinal());
    }
}

#[async_trait]
impl ConfigLoader for AuthoritativeConfigServer {
    async fn get_chunks_since(
        &self,
        _ns: &Namespace,
        since: ChunkVersion,
    ) -> Result<CollectionAndChangedChunks, LoaderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();

        let mut diff = state.clone();
        if since.epoch == state.epoch {
            diff.changed_chunks.retain(|c| c.version.ordinal() >= since.ordinal());
        }
        diff.changed_chunks.sort_by_key(|c| c.version.ordinal());
        Ok(diff)
    }
}

// =============================================================================
// Replication coordinator
// =============================================================================

pub struct FakeReplication {
    majority_waits: AtomicUsize,
    fail_majority: AtomicBool,
    op_time_waits: Mutex<Vec<OpTime>>,
}

impl FakeReplication {
    pub fn new() -> Self {
        Self {
            majority_waits: AtomicUsize::new(0),
            fail_majority: AtomicBool::new(false),
            op_time_waits: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_majority(&self, fail: bool) {
        self.fail_majority.store(fail, Ordering::SeqCst);
    }

    pub fn majority_waits(&self) -> usize {
        self.majority_waits.load(Ordering::SeqCst)
    }

    pub fn op_time_waits(&self) -> Vec<OpTime> {
        self.op_time_waits.lock().clone()
    }
}

#[async_trait]
impl ReplicationCoordinator for FakeReplication {
    async fn wait_for_majority(&self) -> Result<(), LoaderError> {
        self.majority_waits.fetch_add(1, Ordering::SeqCst);
        if self.fail_majority.load(Ordering::SeqCst) {
            return Err(LoaderError::NotMaster(
                "could not confirm majority primaryship".into(),
            ));
        }
        Ok(())
    }

    async fn wait_until_op_time(&self, op_time: OpTime) -> Result<(), LoaderError> {
        self.op_time_waits.lock().push(op_time);
        Ok(())
    }
}

// =============================================================================
// Primary refresh command channel
// =============================================================================

pub enum RefresherAction {
    /// Emulate the primary refreshing and the result replicating locally:
    /// write the payload into the store under the refresh markers.
    Persist(CollectionAndChangedChunks),
    DropCollection,
    FailWriteConcern,
    /// Never answer (exercises the command deadline).
    Hang,
    /// Answer without touching anything.
    Nothing,
}

pub struct FakeRefresher {
    store: Arc<MemoryRoutingStore>,
    script: Mutex<VecDeque<RefresherAction>>,
    calls: AtomicUsize,
    next_op_time: AtomicU64,
}

impl FakeRefresher {
    pub fn new(store: Arc<MemoryRoutingStore>) -> Self {
        Self {
            store,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            next_op_time: AtomicU64::new(1),
        }
    }

    pub fn push(&self, action: RefresherAction) {
        self.script.lock().push_back(action);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PrimaryRefresher for FakeRefresher {
    async fn force_routing_table_refresh(&self, ns: &Namespace) -> Result<OpTime, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let action = self.script.lock().pop_front().unwrap_or(RefresherAction::Nothing);

        match action {
            RefresherAction::Persist(p) => {
                persist_like_primary(self.store.as_ref(), ns, &p).await;
            }
            RefresherAction::DropCollection => {
                self.store.drop_chunks_and_entry(ns).await.unwrap();
            }
            RefresherAction::FailWriteConcern => {
                return Err(RemoteError::WriteConcern("waiting for replication".into()));
            }
            RefresherAction::Hang => {
                std::future::pending::<()>().await;
            }
            RefresherAction::Nothing => {}
        }

        Ok(OpTime(self.next_op_time.fetch_add(1, Ordering::SeqCst)))
    }
}

// =============================================================================
// Fault-injecting store
// =============================================================================

/// Wraps the in-memory store: fails the next N chunk applies, and can gate
/// applies so a test can fire a role change mid-write.
pub struct FaultyStore {
    inner: MemoryRoutingStore,
    fail_applies: AtomicUsize,
    gate_applies: AtomicBool,
    pub apply_entered: Arc<Notify>,
    apply_release: Notify,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryRoutingStore::new(),
            fail_applies: AtomicUsize::new(0),
            gate_applies: AtomicBool::new(false),
            apply_entered: Arc::new(Notify::new()),
            apply_release: Notify::new(),
        }
    }

    pub fn inner(&self) -> &MemoryRoutingStore {
        &self.inner
    }

    /// Make the next `n` chunk applies fail with a backend error.
    pub fn fail_next_applies(&self, n: usize) {
        self.fail_applies.store(n, Ordering::SeqCst);
    }

    /// Block applies at the chunk-write step until released.
    pub fn gate_applies(&self, gate: bool) {
        self.gate_applies.store(gate, Ordering::SeqCst);
    }

    pub fn release_applies(&self) {
        self.apply_release.notify_waiters();
    }
}

#[async_trait]
impl RoutingStore for FaultyStore {
    async fn read_collection_entry(
        &self,
        ns: &Namespace,
    ) -> Result<routing_cache::CollectionEntry, StoreError> {
        self.inner.read_collection_entry(ns).await
    }

    async fn upsert_collection_entry(
        &self,
        ns: &Namespace,
        update: &CollectionUpdate,
    ) -> Result<(), StoreError> {
        self.inner.upsert_collection_entry(ns, update).await
    }

    async fn set_refreshing(&self, ns: &Namespace) -> Result<(), StoreError> {
        self.inner.set_refreshing(ns).await
    }

    async fn unset_refreshing(
        &self,
        ns: &Namespace,
        last_refreshed: ChunkVersion,
    ) -> Result<(), StoreError> {
        self.inner.unset_refreshing(ns, last_refreshed).await
    }

    async fn read_chunks_since(
        &self,
        ns: &Namespace,
        since: ChunkVersion,
        epoch: CollectionEpoch,
    ) -> Result<Vec<ChunkEntry>, StoreError> {
        self.inner.read_chunks_since(ns, since, epoch).await
    }

    async fn read_highest_version(
        &self,
        ns: &Namespace,
        epoch: CollectionEpoch,
    ) -> Result<Option<ChunkVersion>, StoreError> {
        self.inner.read_highest_version(ns, epoch).await
    }

    async fn apply_chunk_diff(
        &self,
        ns: &Namespace,
        chunks: &[ChunkEntry],
        epoch: CollectionEpoch,
    ) -> Result<(), StoreError> {
        if self.gate_applies.load(Ordering::SeqCst) {
            self.apply_entered.notify_waiters();
            self.apply_release.notified().await;
        }

        if self
            .fail_applies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Backend("injected apply failure".into()));
        }

        self.inner.apply_chunk_diff(ns, chunks, epoch).await
    }

    async fn drop_chunks_and_entry(&self, ns: &Namespace) -> Result<(), StoreError> {
        self.inner.drop_chunks_and_entry(ns).await
    }
}
