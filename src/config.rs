//! Configuration for the routing cache loader.
//!
//! # Example
//!
//! ```
//! use routing_cache::{LoaderConfig, StaleTermPolicy};
//!
//! // Minimal config (uses defaults)
//! let config = LoaderConfig::default();
//! assert_eq!(config.max_pool_tasks, 6);
//!
//! // Full config
//! let config = LoaderConfig {
//!     max_pool_tasks: 2,
//!     secondary_refresh_timeout_ms: 5_000,
//!     stale_term_policy: StaleTermPolicy::AbortWorker,
//!     ..Default::default()
//! };
//! ```

use serde::Deserialize;

/// What an apply worker does with a task created under an older term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleTermPolicy {
    /// Pop the stale task and keep draining the queue. A stale task's data
    /// may predate a lost election, so applying it is never safe, but the
    /// queue behind it was scheduled later and can proceed.
    DiscardStale,
    /// Leave the queue untouched and stop the worker; the next role owns
    /// the cleanup.
    AbortWorker,
}

/// Configuration for the loader. All fields have working defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct LoaderConfig {
    /// Upper bound on concurrently running loader tasks (request dispatch
    /// plus apply workers).
    #[serde(default = "default_max_pool_tasks")]
    pub max_pool_tasks: usize,

    /// Deadline for the secondary's refresh command to the primary.
    #[serde(default = "default_secondary_refresh_timeout_ms")]
    pub secondary_refresh_timeout_ms: u64,

    /// Attempts for the refresh command when it fails with a retryable
    /// (write-concern-class) error.
    #[serde(default = "default_secondary_refresh_attempts")]
    pub secondary_refresh_attempts: u32,

    /// Pause before an apply worker retries a failed persist.
    #[serde(default = "default_task_retry_backoff_ms")]
    pub task_retry_backoff_ms: u64,

    /// Stale-term task handling.
    #[serde(default = "default_stale_term_policy")]
    pub stale_term_policy: StaleTermPolicy,
}

fn default_max_pool_tasks() -> usize {
    6
}
fn default_secondary_refresh_timeout_ms() -> u64 {
    30_000
}
fn default_secondary_refresh_attempts() -> u32 {
    3
}
fn default_task_retry_backoff_ms() -> u64 {
    100
}
fn default_stale_term_policy() -> StaleTermPolicy {
    StaleTermPolicy::DiscardStale
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_pool_tasks: default_max_pool_tasks(),
            secondary_refresh_timeout_ms: default_secondary_refresh_timeout_ms(),
            secondary_refresh_attempts: default_secondary_refresh_attempts(),
            task_retry_backoff_ms: default_task_retry_backoff_ms(),
            stale_term_policy: default_stale_term_policy(),
        }
    }
}
