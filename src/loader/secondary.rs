//! The secondary refresh path.
//!
//! A secondary never talks to the config server. It asks the primary to
//! refresh, waits for that refresh to replicate locally, and then reads the
//! replicated mirror, retrying until a read lands entirely between two
//! identical refresh-marker states, which is what makes it coherent.

use std::time::Duration;

use tracing::{debug, warn};

use super::RoutingCacheLoader;
use crate::error::LoaderError;
use crate::metadata::{CollectionAndChangedChunks, Namespace, RefreshState};
use crate::mirror;
use crate::store::StoreError;
use crate::upstream::RemoteError;
use crate::version::ChunkVersion;

impl RoutingCacheLoader {
    pub(super) async fn run_secondary_get_chunks_since(
        &self,
        nss: &Namespace,
        since: ChunkVersion,
        term: u64,
    ) -> Result<CollectionAndChangedChunks, LoaderError> {
        self.force_primary_refresh_and_wait(nss, term).await?;
        self.complete_persisted_metadata_since_version(nss, since, term).await
    }

    /// Ask the primary to refresh `nss` and wait until this node has
    /// replicated up to the primary's reported operation time. The command
    /// is idempotent, so write-concern-class failures are retried a bounded
    /// number of times; each attempt runs under the configured deadline.
    async fn force_primary_refresh_and_wait(
        &self,
        nss: &Namespace,
        term: u64,
    ) -> Result<(), LoaderError> {
        let timeout_ms = self.inner.config.secondary_refresh_timeout_ms;
        let attempts = self.inner.config.secondary_refresh_attempts.max(1);

        let mut attempt = 0;
        let op_time = loop {
            attempt += 1;

            let command = async {
                match tokio::time::timeout(
                    Duration::from_millis(timeout_ms),
                    self.inner.refresher.force_routing_table_refresh(nss),
                )
                .await
                {
                    Ok(Ok(op_time)) => Ok(op_time),
                    Ok(Err(err)) => Err(LoaderError::Remote(err)),
                    Err(_) => Err(LoaderError::Remote(RemoteError::Timeout(timeout_ms))),
                }
            };

            match self.run_interruptible(term, command).await {
                Ok(op_time) => break op_time,
                Err(LoaderError::Remote(err)) if err.is_retryable() && attempt < attempts => {
                    warn!(
                        %nss,
                        attempt,
                        error = %err,
                        "primary refresh command failed with a retryable error"
                    );
                    crate::metrics::record_refresh_command_retry();
                }
                Err(err) => return Err(err),
            }
        };

        debug!(%nss, %op_time, "primary refreshed; waiting for local replication");
        self.run_interruptible(term, self.inner.repl.wait_until_op_time(op_time)).await
    }

    /// Read the replicated mirror, looping until a full read happens
    /// between two identical refresh-marker snapshots. The notification bus
    /// replaces polling while an apply is in flight.
    async fn complete_persisted_metadata_since_version(
        &self,
        nss: &Namespace,
        since: ChunkVersion,
        term: u64,
    ) -> Result<CollectionAndChangedChunks, LoaderError> {
        loop {
            let begin_state = loop {
                // Subscribe before reading the marker: an apply finishing
                // between the read and the wait must still wake us.
                let mut subscription = self.inner.notifications.subscribe(nss);

                let state = self.read_refresh_state(nss).await?;
                if !state.refreshing {
                    break state;
                }

                self.run_interruptible(term, async {
                    subscription.wait().await;
                    Ok(())
                })
                .await?;
            };

            let coll_and_chunks =
                mirror::persisted_metadata_since_version(self.inner.store.as_ref(), nss, since)
                    .await?;

            let end_state = self.read_refresh_state(nss).await?;
            if begin_state == end_state {
                return Ok(coll_and_chunks);
            }

            debug!(
                %nss,
                begin = %begin_state,
                end = %end_state,
                "read chunk metadata while updates were being applied; retrying"
            );
        }
    }

    async fn read_refresh_state(&self, nss: &Namespace) -> Result<RefreshState, LoaderError> {
        match self.inner.store.read_collection_entry(nss).await {
            Ok(entry) => Ok(entry.refresh_state()),
            Err(StoreError::NotFound) => Err(LoaderError::NamespaceNotFound),
            Err(err) => Err(err.into()),
        }
    }
}
