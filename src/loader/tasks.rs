//! The apply worker.
//!
//! One worker per collection drains that collection's task queue in order,
//! persisting each diff under the refresh markers. The worker peeks the
//! front under the state lock, does storage I/O with the lock released, and
//! only then pops, so a failed apply leaves the task in place for retry. A
//! task whose term is no longer current is never applied; what happens to
//! it instead is the configured stale-term policy.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::RoutingCacheLoader;
use crate::config::StaleTermPolicy;
use crate::error::LoaderError;
use crate::metadata::Namespace;
use crate::mirror;
use crate::task::Task;

enum Step {
    Apply(Task, u64),
    Discarded,
    Exit,
}

impl RoutingCacheLoader {
    pub(super) async fn run_tasks(self, nss: Namespace) {
        let Ok(_permit) = self.inner.pool.clone().acquire_owned().await else {
            self.release_worker(&nss);
            return;
        };

        loop {
            let step = {
                let mut state = self.inner.state.lock();

                if state.shutting_down {
                    if let Some(list) = state.task_lists.get_mut(&nss) {
                        list.set_worker_active(false);
                    }
                    return;
                }

                let term = state.term;
                let policy = self.inner.config.stale_term_policy;
                let mut drained = false;
                let step = match state.task_lists.get_mut(&nss) {
                    None => Step::Exit,
                    Some(list) => match list.front() {
                        None => {
                            drained = true;
                            Step::Exit
                        }
                        Some(front) if front.term_created != term => match policy {
                            StaleTermPolicy::DiscardStale => {
                                debug!(
                                    %nss,
                                    task_term = front.term_created,
                                    current_term = term,
                                    "discarding chunk metadata task from an older term"
                                );
                                list.pop_front();
                                Step::Discarded
                            }
                            StaleTermPolicy::AbortWorker => {
                                list.set_worker_active(false);
                                Step::Exit
                            }
                        },
                        Some(front) => Step::Apply(front.clone(), term),
                    },
                };
                if drained {
                    // Drained; the map entry goes with us.
                    state.task_lists.remove(&nss);
                    crate::metrics::set_active_task_lists(state.task_lists.len());
                }
                step
            };

            let (task, term) = match step {
                Step::Exit => return,
                Step::Discarded => continue,
                Step::Apply(task, term) => (task, term),
            };

            match self.apply_task(&nss, &task, term).await {
                Ok(()) => {
                    {
                        let mut state = self.inner.state.lock();
                        if let Some(list) = state.task_lists.get_mut(&nss) {
                            list.pop_front();
                        }
                    }
                    self.inner.notifications.notify(&nss);
                    crate::metrics::record_task_applied("success");
                    debug!(
                        %nss,
                        from = %task.min_query_version,
                        to = %task.max_query_version,
                        "successfully updated persisted chunk metadata"
                    );
                }
                Err(err) if err.is_shutdown() => {
                    info!(%nss, "stopped persisting chunk metadata updates due to shutdown");
                    self.release_worker(&nss);
                    return;
                }
                Err(err) => {
                    // The task stays at the front; retry after a pause. A
                    // stale term is caught at the top of the next iteration.
                    warn!(
                        %nss,
                        error = %err,
                        from = %task.min_query_version,
                        to = %task.max_query_version,
                        "failed to persist chunk metadata update; will be retried"
                    );
                    crate::metrics::record_task_applied("retry");
                    tokio::time::sleep(Duration::from_millis(
                        self.inner.config.task_retry_backoff_ms,
                    ))
                    .await;
                }
            }
        }
    }

    async fn apply_task(
        &self,
        nss: &Namespace,
        task: &Task,
        term: u64,
    ) -> Result<(), LoaderError> {
        match &task.payload {
            Some(payload) => {
                let _timer = crate::metrics::ApplyTimer::new();
                self.run_interruptible(
                    term,
                    mirror::persist_collection_and_changed_chunks(
                        self.inner.store.as_ref(),
                        nss,
                        payload,
                    ),
                )
                .await?;
                crate::metrics::record_diff_size(payload.changed_chunks.len());
            }
            None => {
                self.run_interruptible(term, async {
                    self.inner
                        .store
                        .drop_chunks_and_entry(nss)
                        .await
                        .map_err(LoaderError::from)
                })
                .await?;
                info!(%nss, "dropped persisted chunk metadata");
            }
        }
        Ok(())
    }

    fn release_worker(&self, nss: &Namespace) {
        let mut state = self.inner.state.lock();
        if let Some(list) = state.task_lists.get_mut(nss) {
            list.set_worker_active(false);
        }
    }
}
