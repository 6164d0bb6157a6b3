//! Per-collection apply queues.
//!
//! A [`Task`] is one atomic unit of mirror maintenance: either "apply this
//! chunk diff" or "the collection is gone, drop the mirror". A [`TaskList`]
//! is the ordered queue of tasks for one collection; the loader runs at most
//! one worker per list, so list order is apply order.
//!
//! Adjacent non-drop tasks are contiguous: each task's `max_query_version`
//! is the next task's `min_query_version`, except when a task requests a
//! full reload (an unset minimum). A drop wipes every pending task behind
//! the currently executing front, since none of that work can matter once
//! the collection is gone.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

use crate::metadata::CollectionAndChangedChunks;
use crate::version::ChunkVersion;

/// Process-wide source of task numbers. Task numbers only ever grow, which
/// lets flush waiters use them as progress points.
static TASK_ID_GENERATOR: AtomicU64 = AtomicU64::new(0);

/// One unit of mirror maintenance for a single collection.
#[derive(Debug, Clone)]
pub struct Task {
    /// Monotone id, unique across all collections.
    pub task_num: u64,
    /// The version the producing diff query started from. Unset means the
    /// diff is a full reload.
    pub min_query_version: ChunkVersion,
    /// The newest version the diff carries; `unsharded()` for a drop.
    pub max_query_version: ChunkVersion,
    /// Term under which this task was scheduled. Tasks from older terms are
    /// no longer trustworthy.
    pub term_created: u64,
    /// The diff to apply, or `None` when the collection vanished upstream.
    pub payload: Option<CollectionAndChangedChunks>,
}

impl Task {
    /// Build a task from a remote fetch result. `None` means the namespace
    /// was not found upstream and the local mirror must be dropped.
    ///
    /// # Panics
    ///
    /// A non-drop payload must carry at least one chunk.
    #[must_use]
    pub fn new(
        fetched: Option<CollectionAndChangedChunks>,
        min_query_version: ChunkVersion,
        term: u64,
    ) -> Self {
        let task_num = TASK_ID_GENERATOR.fetch_add(1, Ordering::Relaxed);

        match fetched {
            Some(payload) => {
                let max_query_version = payload
                    .highest_version()
                    .expect("refresh task payload must carry at least one chunk");
                Self {
                    task_num,
                    min_query_version,
                    max_query_version,
                    term_created: term,
                    payload: Some(payload),
                }
            }
            None => Self {
                task_num,
                min_query_version,
                max_query_version: ChunkVersion::unsharded(),
                term_created: term,
                payload: None,
            },
        }
    }

    #[must_use]
    pub fn is_drop(&self) -> bool {
        self.payload.is_none()
    }
}

/// Ordered apply queue for one collection, with a completion counter that
/// flush waiters subscribe to.
///
/// The counter lives in a `watch` channel: subscribed receivers keep the
/// sender's state alive even after the list itself is removed from the
/// loader's map, so a waiter never blocks on a queue that no longer exists.
#[derive(Debug)]
pub struct TaskList {
    tasks: VecDeque<Task>,
    completions: watch::Sender<u64>,
    worker_active: bool,
}

impl TaskList {
    #[must_use]
    pub fn new() -> Self {
        let (completions, _) = watch::channel(0);
        Self {
            tasks: VecDeque::new(),
            completions,
            worker_active: false,
        }
    }

    /// Whether an apply worker currently owns this list. At most one worker
    /// per collection may run; the flag is flipped under the loader's state
    /// lock.
    #[must_use]
    pub fn worker_active(&self) -> bool {
        self.worker_active
    }

    pub fn set_worker_active(&mut self, active: bool) {
        self.worker_active = active;
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn front(&self) -> Option<&Task> {
        self.tasks.front()
    }

    /// The task immediately behind the active front, if any. The flush
    /// waiter needs it: a drop can only sit at the front or right behind it.
    #[must_use]
    pub fn second(&self) -> Option<&Task> {
        self.tasks.get(1)
    }

    #[must_use]
    pub fn back(&self) -> Option<&Task> {
        self.tasks.back()
    }

    /// Append a task, enforcing queue coherence.
    ///
    /// Contiguity only binds tasks of the same term: a back task from an
    /// older term is inert (no worker will ever apply it) and the new term's
    /// version line starts over from persisted state.
    ///
    /// # Panics
    ///
    /// A drop task must be contiguous with a same-term back. A non-drop task
    /// must be contiguous or request a full reload (unset minimum).
    pub fn add_task(&mut self, task: Task) {
        let Some(back) = self.tasks.back() else {
            self.tasks.push_back(task);
            return;
        };
        let same_term = back.term_created == task.term_created;

        if task.is_drop() {
            assert!(
                !same_term || back.max_query_version == task.min_query_version,
                "drop task for version {} is not contiguous with enqueued version {}",
                task.min_query_version,
                back.max_query_version
            );

            // Pending work behind the active front is throw-away once the
            // collection is dropped. The front may be executing, so it stays.
            self.tasks.truncate(1);

            if !self.tasks[0].is_drop() {
                self.tasks.push_back(task);
            }
        } else {
            assert!(
                !same_term
                    || back.max_query_version == task.min_query_version
                    || !task.min_query_version.is_set(),
                "task for version {} is not contiguous with enqueued version {}",
                task.min_query_version,
                back.max_query_version
            );

            self.tasks.push_back(task);
        }
    }

    /// Remove every task from a term other than `term`. The front is spared
    /// while a worker owns it: the worker may be mid-apply, and only it may
    /// retire the front.
    pub fn clear_stale_tasks(&mut self, term: u64) {
        let protect_front = self.worker_active;
        let mut index = 0;
        self.tasks.retain(|task| {
            let keep = (protect_front && index == 0) || task.term_created == term;
            index += 1;
            keep
        });
    }

    /// Remove the completed front task and wake completion waiters.
    ///
    /// # Panics
    ///
    /// The list must be non-empty.
    pub fn pop_front(&mut self) {
        assert!(!self.tasks.is_empty());
        self.tasks.pop_front();
        self.completions.send_modify(|c| *c += 1);
    }

    /// Subscribe to completion events. The returned receiver observes every
    /// `pop_front` that happens after the subscription.
    #[must_use]
    pub fn completion_signal(&self) -> watch::Receiver<u64> {
        self.completions.subscribe()
    }

    /// Whether the newest enqueued task was scheduled under `term`.
    ///
    /// # Panics
    ///
    /// The list must be non-empty.
    #[must_use]
    pub fn has_tasks_from_term(&self, term: u64) -> bool {
        self.tasks
            .back()
            .expect("term query on empty task list")
            .term_created
            == term
    }

    /// The newest version any enqueued task will bring the mirror to.
    ///
    /// # Panics
    ///
    /// The list must be non-empty.
    #[must_use]
    pub fn highest_version_enqueued(&self) -> ChunkVersion {
        self.tasks
            .back()
            .expect("version query on empty task list")
            .max_query_version
    }

    /// Replay the tasks scheduled under `term` into one aggregate view: a
    /// drop resets the accumulator, an epoch change replaces it, and
    /// same-epoch diffs append (deduplicating the shared boundary version,
    /// since the diff query is inclusive at both ends).
    #[must_use]
    pub fn enqueued_metadata_for_term(&self, term: u64) -> CollectionAndChangedChunks {
        let mut acc = CollectionAndChangedChunks::default();

        for task in &self.tasks {
            if task.term_created != term {
                // Stale-term task data is no longer valid.
                continue;
            }

            let Some(payload) = &task.payload else {
                acc = CollectionAndChangedChunks::default();
                continue;
            };

            if payload.epoch != acc.epoch {
                acc = payload.clone();
            } else {
                let mut chunks = payload.changed_chunks.iter();
                if acc.highest_version() == payload.changed_chunks.first().map(|c| c.version) {
                    chunks.next();
                }
                acc.changed_chunks.extend(chunks.cloned());
            }
        }

        acc
    }
}

impl Default for TaskList {
    fn default() -> Self {
        Self::new()
    }
}
