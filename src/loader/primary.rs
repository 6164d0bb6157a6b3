//! The primary refresh path.
//!
//! A primary serves `get_chunks_since` by refreshing its own mirror from
//! the config server first: fetch the diff since the newest version the
//! loader already knows (enqueued or persisted), enqueue it as an apply
//! task behind a majority barrier, then answer the caller from the merged
//! persisted + enqueued view.

use std::cmp::Ordering;

use tracing::{debug, info, warn};

use super::RoutingCacheLoader;
use crate::error::LoaderError;
use crate::metadata::{CollectionAndChangedChunks, Namespace};
use crate::task::Task;
use crate::version::ChunkVersion;
use crate::{merge, mirror};

impl RoutingCacheLoader {
    pub(super) async fn run_primary_get_chunks_since(
        &self,
        nss: &Namespace,
        since: ChunkVersion,
        term: u64,
    ) -> Result<CollectionAndChangedChunks, LoaderError> {
        // One fetch-and-enqueue at a time per collection: a request arriving
        // while another is in flight waits here and then fetches only from
        // the first one's tip, so concurrent refreshes coalesce instead of
        // racing the queue.
        let refresh_guard = self.collection_refresh_guard(nss).await;

        let max_loader_version = self.max_loader_version(nss, term).await?;

        let fetched = self
            .run_interruptible(
                term,
                self.inner.config_server.get_chunks_since(nss, max_loader_version),
            )
            .await;

        match fetched {
            Err(LoaderError::NamespaceNotFound) => {
                // Gone upstream: mirror the drop locally, then report the
                // absence to the caller.
                self.ensure_majority_and_schedule(
                    nss,
                    Task::new(None, max_loader_version, term),
                    term,
                )
                .await?;

                info!(
                    %nss,
                    from = %max_loader_version,
                    "cache loader remotely refreshed and found the collection dropped"
                );
                Err(LoaderError::NamespaceNotFound)
            }
            Err(err) => Err(err),
            Ok(coll_and_chunks) => {
                let Some(newest) = coll_and_chunks.highest_version() else {
                    return Err(LoaderError::ConflictingOperationInProgress(format!(
                        "refresh of '{nss}' returned a collection without chunks"
                    )));
                };

                if newest.epoch != coll_and_chunks.epoch {
                    // The upstream read straddled a drop-and-recreate.
                    return Err(LoaderError::ConflictingOperationInProgress(format!(
                        "invalid chunks found when reloading '{nss}': previous collection epoch \
                         was '{}' but found a new epoch '{}'; collection was dropped and recreated",
                        coll_and_chunks.epoch, newest.epoch
                    )));
                }

                let brings_news = coll_and_chunks.epoch != max_loader_version.epoch
                    || newest.partial_cmp(&max_loader_version) == Some(Ordering::Greater);
                if brings_news {
                    self.ensure_majority_and_schedule(
                        nss,
                        Task::new(Some(coll_and_chunks), max_loader_version, term),
                        term,
                    )
                    .await?;
                }

                info!(
                    %nss,
                    from = %max_loader_version,
                    found = %newest,
                    "cache loader remotely refreshed"
                );

                // The merge below is a read; only fetch-and-enqueue needs
                // the guard.
                drop(refresh_guard);

                // Metadata was found remotely, so the local merge must find
                // it too (persisted or still enqueued).
                let merged = self.loader_metadata(nss, since, term).await?;
                debug_assert!(
                    !merged.is_empty(),
                    "metadata found remotely but the local merge came back empty"
                );
                Ok(merged)
            }
        }
    }

    /// The newest version this loader already accounts for: the top of the
    /// current-term task queue when one exists, otherwise the persisted
    /// maximum.
    async fn max_loader_version(
        &self,
        nss: &Namespace,
        term: u64,
    ) -> Result<ChunkVersion, LoaderError> {
        {
            let state = self.inner.state.lock();
            if let Some(list) = state.task_lists.get(nss) {
                if !list.is_empty() && list.has_tasks_from_term(term) {
                    // Enqueued tasks already define what we will soon know.
                    return Ok(list.highest_version_enqueued());
                }
            }
        }

        mirror::persisted_max_version(self.inner.store.as_ref(), nss).await
    }

    /// Merge the persisted mirror with the enqueued tasks of this term into
    /// the caller-facing view. Reads the enqueued side first: a task that
    /// completed between the two reads then shows up as overlap (pruned),
    /// never as a gap.
    pub(super) async fn loader_metadata(
        &self,
        nss: &Namespace,
        since: ChunkVersion,
        term: u64,
    ) -> Result<CollectionAndChangedChunks, LoaderError> {
        let (tasks_enqueued, enqueued) = self.enqueued_metadata(nss, since, term);

        let persisted = mirror::incomplete_persisted_metadata_since_version(
            self.inner.store.as_ref(),
            nss,
            since,
        )
        .await?;

        debug!(
            %nss,
            %since,
            enqueued_from = ?enqueued.changed_chunks.first().map(|c| c.version.to_string()),
            enqueued_to = ?enqueued.highest_version().map(|v| v.to_string()),
            tasks_enqueued,
            persisted_from = ?persisted.changed_chunks.first().map(|c| c.version.to_string()),
            persisted_to = ?persisted.highest_version().map(|v| v.to_string()),
            "cache loader merging local metadata"
        );

        Ok(merge::merge_persisted_and_enqueued(persisted, enqueued, tasks_enqueued))
    }

    /// Aggregate the queued tasks of `term` for `nss`, trimmed to the
    /// request. The flag reports whether any such tasks exist at all; with
    /// the flag set, an empty result means a drop is pending.
    fn enqueued_metadata(
        &self,
        nss: &Namespace,
        since: ChunkVersion,
        term: u64,
    ) -> (bool, CollectionAndChangedChunks) {
        let state = self.inner.state.lock();
        let Some(list) = state.task_lists.get(nss) else {
            return (false, CollectionAndChangedChunks::default());
        };
        if list.is_empty() || !list.has_tasks_from_term(term) {
            return (false, CollectionAndChangedChunks::default());
        }

        let collected = list.enqueued_metadata_for_term(term);
        (true, merge::trim_enqueued_to_version(collected, since))
    }

    /// Confirm this node is still the majority primary, then enqueue the
    /// task and start a worker for its collection if none is running.
    ///
    /// The barrier is what makes the enqueue safe: a node about to lose its
    /// primaryship fails the majority write and never schedules
    /// stale-epoch work.
    pub(super) async fn ensure_majority_and_schedule(
        &self,
        nss: &Namespace,
        task: Task,
        term: u64,
    ) -> Result<(), LoaderError> {
        if let Err(err) = self
            .run_interruptible(term, self.inner.repl.wait_for_majority())
            .await
        {
            warn!(
                %nss,
                error = %err,
                "unable to schedule routing table update; this node is not the majority primary"
            );
            return Err(err);
        }

        let mut state = self.inner.state.lock();
        let dropped = task.is_drop();
        let list = state.task_lists.entry(nss.clone()).or_default();

        if !list.is_empty() && !list.has_tasks_from_term(term) {
            // Everything queued predates the current term and will never be
            // applied; only a front owned by a running worker must stay.
            list.clear_stale_tasks(term);
        }

        list.add_task(task);
        crate::metrics::record_task_enqueued(dropped);

        if !list.worker_active() {
            list.set_worker_active(true);
            let loader = self.clone();
            let worker_nss = nss.clone();
            tokio::spawn(async move { loader.run_tasks(worker_nss).await });
        }
        crate::metrics::set_active_task_lists(state.task_lists.len());

        Ok(())
    }
}
