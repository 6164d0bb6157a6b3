//! Merging persisted and enqueued metadata into one coherent view.
//!
//! A primary answers "give me all chunks since version V" from two sources:
//! the persisted mirror and whatever diffs are still sitting in the apply
//! queue. A task can complete between the two reads, so the enqueued view
//! is always read first and the overlap is pruned here. Versions strictly
//! increase within an epoch, which makes pruning at the minimum enqueued
//! version sufficient.

use crate::metadata::CollectionAndChangedChunks;
use crate::version::ChunkVersion;

/// Restrict an aggregated enqueued view to versions GTE `since`.
///
/// When the enqueued epoch differs from the request's epoch the request is
/// from a dead incarnation and the full enqueued view is returned.
#[must_use]
pub fn trim_enqueued_to_version(
    mut enqueued: CollectionAndChangedChunks,
    since: ChunkVersion,
) -> CollectionAndChangedChunks {
    if enqueued.epoch != since.epoch {
        return enqueued;
    }

    enqueued
        .changed_chunks
        .retain(|c| c.version.ordinal() >= since.ordinal());
    enqueued
}

/// Combine a persisted read with the aggregated enqueued view.
///
/// `tasks_enqueued` distinguishes "no queue at all" from "the queue
/// aggregates to nothing" (a pending drop): with no queue the persisted
/// view stands, while a pending drop means the persisted view is already
/// dead.
#[must_use]
pub fn merge_persisted_and_enqueued(
    mut persisted: CollectionAndChangedChunks,
    enqueued: CollectionAndChangedChunks,
    tasks_enqueued: bool,
) -> CollectionAndChangedChunks {
    if !tasks_enqueued {
        return persisted;
    }

    if persisted.is_empty() || enqueued.is_empty() || enqueued.epoch != persisted.epoch {
        // Nothing persisted, a drop enqueued, or an epoch change enqueued:
        // either way the enqueued view is the authoritative one.
        return enqueued;
    }

    // Enqueued work may have been applied while the persisted read ran, so
    // the two views can overlap. Prune persisted at the minimum enqueued
    // version, then append.
    let min_enqueued = enqueued.changed_chunks[0].version;
    persisted
        .changed_chunks
        .retain(|c| c.version.ordinal() < min_enqueued.ordinal());
    persisted.changed_chunks.extend(enqueued.changed_chunks);
    persisted
}
