//! Waiting for a collection's queue to drain.
//!
//! `wait_for_collection_flush` is what the primary's refresh command
//! handler calls before answering a secondary: it guarantees that every
//! task enqueued for the collection at call time has been applied (or
//! wiped by a later drop, whose own apply then covers for them).

use tracing::debug;

use super::{ReplicaSetRole, RoutingCacheLoader};
use crate::error::LoaderError;
use crate::metadata::Namespace;

impl RoutingCacheLoader {
    /// Block until every task currently enqueued for `nss` has been applied
    /// or superseded by a drop. Primary-only; fails with `NotMaster` when
    /// the role or term changes while waiting.
    pub async fn wait_for_collection_flush(&self, nss: &Namespace) -> Result<(), LoaderError> {
        let initial_term = self.inner.state.lock().term;
        let mut task_num_to_wait: Option<u64> = None;

        loop {
            let mut completion = {
                let state = self.inner.state.lock();

                if state.role != ReplicaSetRole::Primary || state.term != initial_term {
                    crate::metrics::record_flush_wait("not_master");
                    return Err(LoaderError::NotMaster(format!(
                        "unable to wait for chunk metadata flush for '{nss}' because the node's \
                         replication role changed"
                    )));
                }

                // No queue means everything has already been applied.
                let Some(list) = state.task_lists.get(nss) else {
                    crate::metrics::record_flush_wait("success");
                    return Ok(());
                };
                let (Some(front), Some(back)) = (list.front(), list.back()) else {
                    crate::metrics::record_flush_wait("success");
                    return Ok(());
                };

                match task_num_to_wait {
                    None => {
                        task_num_to_wait = Some(back.task_num);
                    }
                    Some(waiting_for) if front.task_num > waiting_for => {
                        // A drop wipes pending tasks, so the awaited number
                        // may never be applied. The covering drop can only
                        // be the active front or the task right behind it;
                        // re-target it and keep waiting.
                        if front.is_drop() {
                            task_num_to_wait = Some(front.task_num);
                        } else if let Some(second) = list.second().filter(|t| t.is_drop()) {
                            task_num_to_wait = Some(second.task_num);
                        } else {
                            crate::metrics::record_flush_wait("success");
                            return Ok(());
                        }
                    }
                    Some(_) => {}
                }

                debug!(
                    %nss,
                    waiting_for = task_num_to_wait,
                    front = front.task_num,
                    "waiting for chunk metadata flush"
                );

                // Subscribed while the lock is held, so no completion
                // between release and await is lost.
                list.completion_signal()
            };

            // Err means the queue was drained and dropped; loop to confirm.
            let _ = completion.changed().await;
        }
    }
}
