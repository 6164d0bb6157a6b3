//! Metrics instrumentation for the routing cache loader.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter
//! (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `routing_cache_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `role`: primary, secondary
//! - `outcome`: success, error

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a completed `get_chunks_since` request.
pub fn record_refresh(role: &str, outcome: &str) {
    counter!(
        "routing_cache_refreshes_total",
        "role" => role.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a task enqueued onto a collection's apply queue.
pub fn record_task_enqueued(dropped: bool) {
    let kind = if dropped { "drop" } else { "diff" };
    counter!(
        "routing_cache_tasks_enqueued_total",
        "kind" => kind
    )
    .increment(1);
}

/// Record the outcome of one apply attempt.
pub fn record_task_applied(outcome: &str) {
    counter!(
        "routing_cache_tasks_applied_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record how long one persist burst took.
pub fn record_apply_latency(duration: Duration) {
    histogram!("routing_cache_apply_seconds").record(duration.as_secs_f64());
}

/// Record chunks carried by one applied diff.
pub fn record_diff_size(chunks: usize) {
    histogram!("routing_cache_diff_chunks").record(chunks as f64);
}

/// Set the number of collections with a non-empty apply queue.
pub fn set_active_task_lists(count: usize) {
    gauge!("routing_cache_active_task_lists").set(count as f64);
}

/// Record a `wait_for_collection_flush` call.
pub fn record_flush_wait(outcome: &str) {
    counter!(
        "routing_cache_flush_waits_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a retry of the secondary's refresh command.
pub fn record_refresh_command_retry() {
    counter!("routing_cache_refresh_command_retries_total").increment(1);
}

/// Record a role transition (step-up or step-down).
pub fn record_role_transition(role: &str) {
    counter!(
        "routing_cache_role_transitions_total",
        "role" => role.to_string()
    )
    .increment(1);
}

/// A timing guard that records apply latency on drop.
pub struct ApplyTimer {
    start: Instant,
}

impl ApplyTimer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for ApplyTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ApplyTimer {
    fn drop(&mut self) {
        record_apply_latency(self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests verify the API compiles and doesn't panic. In production,
    // you'd use metrics-util's Recorder for assertions.

    #[test]
    fn test_record_refresh() {
        record_refresh("primary", "success");
        record_refresh("secondary", "error");
    }

    #[test]
    fn test_record_tasks() {
        record_task_enqueued(false);
        record_task_enqueued(true);
        record_task_applied("success");
        record_task_applied("retry");
    }

    #[test]
    fn test_histograms_and_gauges() {
        record_apply_latency(Duration::from_millis(5));
        record_diff_size(128);
        set_active_task_lists(3);
    }

    #[test]
    fn test_flush_and_role_counters() {
        record_flush_wait("success");
        record_flush_wait("not_master");
        record_refresh_command_retry();
        record_role_transition("primary");
    }

    #[test]
    fn test_apply_timer() {
        {
            let _timer = ApplyTimer::new();
            std::thread::sleep(Duration::from_micros(10));
        }
        // Timer recorded on drop
    }
}
