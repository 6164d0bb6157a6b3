//! The loader state machine.
//!
//! [`RoutingCacheLoader`] is the one-per-node orchestrator that keeps the
//! shard-local routing mirror current:
//!
//! ```text
//! caller ──► get_chunks_since ──► dispatch (role/term under the state lock)
//!                │
//!    primary ────┤─────────────────────────── secondary ──┐
//!                ▼                                         ▼
//!   config server diff fetch                 force primary refresh (RPC)
//!                │                                         │
//!     enqueue Task (majority barrier)            wait for replication
//!                │                                         │
//!     apply worker (one per collection)      marker-coherent local read
//!                │                                         │
//!                └──► merge persisted + enqueued ──► CollectionAndChangedChunks
//! ```
//!
//! The state lock guards role, term, and the per-collection task queues; it
//! is never held across I/O. A semaphore bounds how many dispatch and apply
//! tasks run at once. Role transitions bump the term and interrupt every
//! in-flight external wait through a watch channel.

mod flush;
mod primary;
mod secondary;
mod tasks;
mod types;

pub use types::{RefreshHandle, ReplicaSetRole};
use types::{Interrupt, InterruptReason};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch, Semaphore};
use tracing::{debug, info};

use crate::config::LoaderConfig;
use crate::error::LoaderError;
use crate::metadata::{CollectionAndChangedChunks, Namespace};
use crate::notify::NamespaceNotifications;
use crate::store::RoutingStore;
use crate::task::TaskList;
use crate::upstream::{ConfigLoader, PrimaryRefresher, ReplicationCoordinator};
use crate::version::ChunkVersion;

/// Role, term, and queues: everything the state lock guards.
pub(super) struct LoaderState {
    pub(super) role: ReplicaSetRole,
    pub(super) term: u64,
    pub(super) shutting_down: bool,
    pub(super) task_lists: HashMap<Namespace, TaskList>,
}

pub(super) struct LoaderShared {
    pub(super) config: LoaderConfig,
    pub(super) config_server: Arc<dyn ConfigLoader>,
    pub(super) store: Arc<dyn RoutingStore>,
    pub(super) repl: Arc<dyn ReplicationCoordinator>,
    pub(super) refresher: Arc<dyn PrimaryRefresher>,
    pub(super) state: Mutex<LoaderState>,
    pub(super) notifications: NamespaceNotifications,
    pub(super) pool: Arc<Semaphore>,
    pub(super) interrupts: watch::Sender<Interrupt>,
    /// Serializes the fetch-and-enqueue stage per collection. Concurrent
    /// refreshes of one collection would otherwise race to fetch from the
    /// same starting version and enqueue non-contiguous tasks; the second
    /// request instead waits, then fetches only from the first one's tip.
    pub(super) refresh_guards: Mutex<HashMap<Namespace, Arc<tokio::sync::Mutex<()>>>>,
}

/// Shard-local routing cache loader. Cheap to clone; all clones share one
/// state machine.
///
/// # Thread safety
///
/// `Send + Sync` and designed for concurrent use. The loader spawns its
/// work onto the ambient tokio runtime, so it must be created and driven
/// inside one.
#[derive(Clone)]
pub struct RoutingCacheLoader {
    inner: Arc<LoaderShared>,
}

impl RoutingCacheLoader {
    /// Create a loader over its four collaborator seams. The loader starts
    /// with no replica-set role; call
    /// [`initialize_replica_set_role`](Self::initialize_replica_set_role)
    /// before dispatching requests.
    #[must_use]
    pub fn new(
        config: LoaderConfig,
        config_server: Arc<dyn ConfigLoader>,
        store: Arc<dyn RoutingStore>,
        repl: Arc<dyn ReplicationCoordinator>,
        refresher: Arc<dyn PrimaryRefresher>,
    ) -> Self {
        let pool = Arc::new(Semaphore::new(config.max_pool_tasks));
        let (interrupts, _) = watch::channel(Interrupt {
            term: 0,
            reason: InterruptReason::None,
        });

        Self {
            inner: Arc::new(LoaderShared {
                config,
                config_server,
                store,
                repl,
                refresher,
                state: Mutex::new(LoaderState {
                    role: ReplicaSetRole::None,
                    term: 0,
                    shutting_down: false,
                    task_lists: HashMap::new(),
                }),
                notifications: NamespaceNotifications::new(),
                pool,
                interrupts,
                refresh_guards: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// One-shot role initialization.
    ///
    /// # Panics
    ///
    /// The role must not have been initialized yet.
    pub fn initialize_replica_set_role(&self, is_primary: bool) {
        let mut state = self.inner.state.lock();
        assert_eq!(
            state.role,
            ReplicaSetRole::None,
            "replica set role is initialized exactly once"
        );
        state.role = if is_primary {
            ReplicaSetRole::Primary
        } else {
            ReplicaSetRole::Secondary
        };
        info!(role = %state.role, "routing cache loader initialized");
    }

    /// The node lost its primaryship. Bumps the term and interrupts every
    /// in-flight operation with `PrimarySteppedDown`.
    ///
    /// # Panics
    ///
    /// The role must have been initialized.
    pub fn on_step_down(&self) {
        let mut state = self.inner.state.lock();
        assert_ne!(state.role, ReplicaSetRole::None);
        state.term += 1;
        state.role = ReplicaSetRole::Secondary;
        self.send_interrupt(state.term, InterruptReason::SteppedDown);
        crate::metrics::record_role_transition("secondary");
        info!(term = state.term, "stepped down to secondary");
    }

    /// The node won an election. Bumps the term and interrupts in-flight
    /// operations.
    ///
    /// # Panics
    ///
    /// The role must have been initialized.
    pub fn on_step_up(&self) {
        let mut state = self.inner.state.lock();
        assert_ne!(state.role, ReplicaSetRole::None);
        state.term += 1;
        state.role = ReplicaSetRole::Primary;
        self.send_interrupt(state.term, InterruptReason::SteppedUp);
        crate::metrics::record_role_transition("primary");
        info!(term = state.term, "stepped up to primary");
    }

    /// Wake any secondary reader blocked on `nss`. Called by the embedding
    /// process when replication applies a routing metadata change; the
    /// loader's own apply workers call it for local writes.
    pub fn notify_of_collection_version_update(&self, nss: &Namespace) {
        self.inner.notifications.notify(nss);
    }

    /// Current role and term, read under the state lock.
    #[must_use]
    pub fn role_and_term(&self) -> (ReplicaSetRole, u64) {
        let state = self.inner.state.lock();
        (state.role, state.term)
    }

    /// Number of tasks currently queued for `nss`, or `None` when no queue
    /// exists (everything has been applied).
    #[must_use]
    pub fn queued_tasks(&self, nss: &Namespace) -> Option<usize> {
        let state = self.inner.state.lock();
        state.task_lists.get(nss).map(TaskList::len)
    }

    /// Number of collections with a live apply queue.
    #[must_use]
    pub fn active_task_collections(&self) -> usize {
        let state = self.inner.state.lock();
        state.task_lists.len()
    }

    /// Request all chunk metadata for `nss` changed at or after `since`.
    ///
    /// The work runs on the loader's pool; the returned handle resolves
    /// exactly once. On a primary the loader refreshes itself from the
    /// config server first; on a secondary it asks the primary to refresh
    /// and reads the replicated mirror.
    ///
    /// # Panics
    ///
    /// The role must have been initialized.
    #[must_use]
    pub fn get_chunks_since(&self, nss: Namespace, since: ChunkVersion) -> RefreshHandle {
        let (scheduled_term, is_primary) = {
            let state = self.inner.state.lock();
            assert_ne!(
                state.role,
                ReplicaSetRole::None,
                "role must be initialized before get_chunks_since"
            );
            (state.term, state.role == ReplicaSetRole::Primary)
        };

        let (tx, rx) = oneshot::channel();
        let loader = self.clone();
        tokio::spawn(async move {
            let result = loader.dispatch(&nss, since, scheduled_term, is_primary).await;

            let role = if is_primary { "primary" } else { "secondary" };
            let outcome = if result.is_ok() { "success" } else { "error" };
            crate::metrics::record_refresh(role, outcome);

            // The caller may have stopped listening; that is not our problem.
            let _ = tx.send(result);
        });

        RefreshHandle { rx }
    }

    async fn dispatch(
        &self,
        nss: &Namespace,
        since: ChunkVersion,
        scheduled_term: u64,
        is_primary: bool,
    ) -> Result<CollectionAndChangedChunks, LoaderError> {
        let Ok(_permit) = self.inner.pool.clone().acquire_owned().await else {
            return Err(LoaderError::InterruptedAtShutdown);
        };

        // The term may have moved between scheduling and this task actually
        // starting; a request scheduled under the old role must not run.
        {
            let state = self.inner.state.lock();
            if state.shutting_down {
                return Err(LoaderError::InterruptedAtShutdown);
            }
            if state.term != scheduled_term {
                return Err(LoaderError::Interrupted(
                    "unable to refresh routing table because replica set state changed".into(),
                ));
            }
        }

        if is_primary {
            self.run_primary_get_chunks_since(nss, since, scheduled_term).await
        } else {
            self.run_secondary_get_chunks_since(nss, since, scheduled_term).await
        }
    }

    /// Stop the loader: no new work is admitted, in-flight operations are
    /// interrupted, and this call returns once every dispatched task and
    /// apply worker has finished.
    pub async fn shutdown(&self) {
        let permits = {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.term += 1;
            self.send_interrupt(state.term, InterruptReason::Shutdown);
            self.inner.config.max_pool_tasks
        };

        // Owning every permit means every worker and dispatch task is done.
        if let Ok(all) = self
            .inner
            .pool
            .acquire_many(u32::try_from(permits).unwrap_or(u32::MAX))
            .await
        {
            all.forget();
        }
        self.inner.pool.close();

        debug!("routing cache loader shut down");
    }

    fn send_interrupt(&self, term: u64, reason: InterruptReason) {
        let _ = self.inner.interrupts.send(Interrupt { term, reason });
    }

    /// Take the per-collection refresh guard. Guards nobody holds or waits
    /// on are pruned on the way in.
    pub(super) async fn collection_refresh_guard(
        &self,
        nss: &Namespace,
    ) -> tokio::sync::OwnedMutexGuard<()> {
        let guard = {
            let mut guards = self.inner.refresh_guards.lock();
            guards.retain(|_, g| Arc::strong_count(g) > 1);
            guards
                .entry(nss.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        guard.lock_owned().await
    }

    /// Run `fut` unless the loader's term moves away from `scheduled_term`,
    /// in which case the wait ends early with the interrupt's error. The
    /// underlying operation is abandoned, not rolled back (exactly like an
    /// interrupted blocking wait).
    pub(super) async fn run_interruptible<T>(
        &self,
        scheduled_term: u64,
        fut: impl Future<Output = Result<T, LoaderError>>,
    ) -> Result<T, LoaderError> {
        let mut rx = self.inner.interrupts.subscribe();
        {
            let current = *rx.borrow_and_update();
            if current.term != scheduled_term {
                return Err(current.reason.to_error());
            }
        }

        let interrupted = async {
            loop {
                if rx.changed().await.is_err() {
                    // Loader dropped; nothing will ever interrupt us.
                    std::future::pending::<()>().await;
                }
                let current = *rx.borrow_and_update();
                if current.term != scheduled_term {
                    return current.reason;
                }
            }
        };

        tokio::select! {
            result = fut => result,
            reason = interrupted => Err(reason.to_error()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRoutingStore;
    use crate::upstream::{OpTime, RemoteError};
    use async_trait::async_trait;
    use std::time::Duration;

    struct UnreachableConfigServer;

    #[async_trait]
    impl ConfigLoader for UnreachableConfigServer {
        async fn get_chunks_since(
            &self,
            _nss: &Namespace,
            _since: ChunkVersion,
        ) -> Result<CollectionAndChangedChunks, LoaderError> {
            Err(LoaderError::OperationFailed("config server unreachable".into()))
        }
    }

    struct NoopReplication;

    #[async_trait]
    impl ReplicationCoordinator for NoopReplication {
        async fn wait_for_majority(&self) -> Result<(), LoaderError> {
            Ok(())
        }
        async fn wait_until_op_time(&self, _op_time: OpTime) -> Result<(), LoaderError> {
            Ok(())
        }
    }

    struct NoopRefresher;

    #[async_trait]
    impl PrimaryRefresher for NoopRefresher {
        async fn force_routing_table_refresh(
            &self,
            _nss: &Namespace,
        ) -> Result<OpTime, RemoteError> {
            Ok(OpTime(1))
        }
    }

    fn test_loader() -> RoutingCacheLoader {
        RoutingCacheLoader::new(
            LoaderConfig::default(),
            Arc::new(UnreachableConfigServer),
            Arc::new(MemoryRoutingStore::new()),
            Arc::new(NoopReplication),
            Arc::new(NoopRefresher),
        )
    }

    #[tokio::test]
    async fn test_role_initialization_and_transitions() {
        let loader = test_loader();
        loader.initialize_replica_set_role(true);
        assert_eq!(loader.role_and_term(), (ReplicaSetRole::Primary, 0));

        loader.on_step_down();
        assert_eq!(loader.role_and_term(), (ReplicaSetRole::Secondary, 1));

        loader.on_step_up();
        assert_eq!(loader.role_and_term(), (ReplicaSetRole::Primary, 2));
    }

    #[tokio::test]
    #[should_panic(expected = "initialized exactly once")]
    async fn test_double_initialization_panics() {
        let loader = test_loader();
        loader.initialize_replica_set_role(true);
        loader.initialize_replica_set_role(false);
    }

    #[tokio::test]
    #[should_panic(expected = "role must be initialized")]
    async fn test_get_chunks_since_before_initialization_panics() {
        let loader = test_loader();
        let _ = loader.get_chunks_since(Namespace::new("db.coll"), ChunkVersion::unsharded());
    }

    #[tokio::test]
    async fn test_interruptible_passes_through_when_term_stable() {
        let loader = test_loader();
        loader.initialize_replica_set_role(true);

        let result = loader.run_interruptible(0, async { Ok::<_, LoaderError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_interruptible_fails_fast_when_term_already_moved() {
        let loader = test_loader();
        loader.initialize_replica_set_role(true);
        loader.on_step_down();

        let result = loader
            .run_interruptible(0, async { Ok::<_, LoaderError>(42) })
            .await;
        assert!(matches!(result, Err(LoaderError::PrimarySteppedDown)));
    }

    #[tokio::test]
    async fn test_interruptible_cancels_inflight_wait_on_step_down() {
        let loader = test_loader();
        loader.initialize_replica_set_role(true);

        let waiting = loader.clone();
        let handle = tokio::spawn(async move {
            waiting
                .run_interruptible(0, async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<_, LoaderError>(())
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        loader.on_step_down();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(LoaderError::PrimarySteppedDown)));
    }

    #[tokio::test]
    async fn test_dispatch_after_term_change_is_interrupted() {
        let loader = test_loader();
        loader.initialize_replica_set_role(true);

        // Take every pool permit so the dispatch task cannot start yet.
        let stall: Vec<_> = (0..loader.inner.config.max_pool_tasks)
            .map(|_| loader.inner.pool.clone().try_acquire_owned().unwrap())
            .collect();

        let handle = loader.get_chunks_since(Namespace::new("db.coll"), ChunkVersion::unsharded());
        loader.on_step_down();
        drop(stall);

        let result = handle.wait().await;
        assert!(matches!(result, Err(LoaderError::Interrupted(_))));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_requests() {
        let loader = test_loader();
        loader.initialize_replica_set_role(true);
        loader.shutdown().await;

        let handle = loader.get_chunks_since(Namespace::new("db.coll"), ChunkVersion::unsharded());
        let result = handle.wait().await;
        assert!(matches!(result, Err(LoaderError::InterruptedAtShutdown)));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let loader = test_loader();
        loader.initialize_replica_set_role(false);
        loader.shutdown().await;
        loader.shutdown().await;
    }
}
