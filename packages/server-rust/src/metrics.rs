//! Metric names and emit helpers -- the observability contract.
//!
//! Names and label sets are part of the public contract (§ operational
//! docs); components never call the `metrics` macros directly, they go
//! through these helpers so the label discipline stays in one place.

use metrics::{counter, gauge, histogram};

/// Counter: every cache operation, labeled
/// `{operation, result ∈ {hit,miss,success,error}, instance_id, mode}`.
pub const CACHE_OPERATIONS: &str = "cache_operations";

/// Histogram: request latency, labeled
/// `{method, endpoint, status, instance_id, mode}`.
pub const REQUEST_DURATION_SECONDS: &str = "request_duration_seconds";

/// Gauge: current async write queue depth, labeled `{instance_id}`.
pub const ASYNC_QUEUE_DEPTH: &str = "async_queue_depth";

/// Gauge: async write queue capacity, labeled `{instance_id}`.
pub const ASYNC_QUEUE_CAPACITY: &str = "async_queue_capacity";

/// Counter: async writer failures, labeled `{instance_id, error_type}` with
/// `error_type ∈ {queue_full, requeue_failed, max_retries_exceeded}`.
pub const ASYNC_WRITE_ERRORS: &str = "async_write_errors";

/// Counter: replica-to-primary write forwards, labeled `{instance_id, result}`.
pub const WRITE_FORWARDS: &str = "write_forwards";

/// Counter: replica-to-primary miss reads, labeled `{instance_id, result}`.
pub const PRIMARY_QUERIES: &str = "primary_queries";

/// Gauge: health as a number, labeled `{instance_id, mode}`:
/// 1 healthy, 0.5 degraded, 0 unhealthy.
pub const HEALTH_STATUS: &str = "health_status";

/// `error_type` label values for [`ASYNC_WRITE_ERRORS`].
pub mod error_types {
    pub const QUEUE_FULL: &str = "queue_full";
    pub const REQUEUE_FAILED: &str = "requeue_failed";
    pub const MAX_RETRIES_EXCEEDED: &str = "max_retries_exceeded";
}

/// Records one cache operation outcome.
pub fn record_cache_operation(
    operation: &'static str,
    result: &'static str,
    instance_id: &str,
    mode: &'static str,
) {
    counter!(
        CACHE_OPERATIONS,
        "operation" => operation,
        "result" => result,
        "instance_id" => instance_id.to_string(),
        "mode" => mode,
    )
    .increment(1);
}

/// Records one request's latency.
pub fn record_request_duration(
    method: &str,
    endpoint: &str,
    status: u16,
    instance_id: &str,
    mode: &'static str,
    seconds: f64,
) {
    histogram!(
        REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string(),
        "instance_id" => instance_id.to_string(),
        "mode" => mode,
    )
    .record(seconds);
}

/// Publishes the async writer's queue occupancy.
#[allow(clippy::cast_precision_loss)]
pub fn set_queue_gauges(instance_id: &str, depth: u64, capacity: u64) {
    gauge!(ASYNC_QUEUE_DEPTH, "instance_id" => instance_id.to_string()).set(depth as f64);
    gauge!(ASYNC_QUEUE_CAPACITY, "instance_id" => instance_id.to_string()).set(capacity as f64);
}

/// Counts one async writer failure by type.
pub fn record_async_write_error(instance_id: &str, error_type: &'static str) {
    counter!(
        ASYNC_WRITE_ERRORS,
        "instance_id" => instance_id.to_string(),
        "error_type" => error_type,
    )
    .increment(1);
}

/// Counts one write forward attempt by outcome.
pub fn record_write_forward(instance_id: &str, result: &'static str) {
    counter!(
        WRITE_FORWARDS,
        "instance_id" => instance_id.to_string(),
        "result" => result,
    )
    .increment(1);
}

/// Counts one replica miss-read against the primary by outcome.
pub fn record_primary_query(instance_id: &str, result: &'static str) {
    counter!(
        PRIMARY_QUERIES,
        "instance_id" => instance_id.to_string(),
        "result" => result,
    )
    .increment(1);
}

/// Publishes health as a number: 1 healthy, 0.5 degraded, 0 unhealthy.
pub fn set_health_status(instance_id: &str, mode: &'static str, value: f64) {
    gauge!(
        HEALTH_STATUS,
        "instance_id" => instance_id.to_string(),
        "mode" => mode,
    )
    .set(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    // The helpers write to whatever recorder is installed (a no-op in unit
    // tests). These tests pin the contract names and exercise the label
    // plumbing so a macro signature change fails loudly.

    #[test]
    fn contract_metric_names() {
        assert_eq!(CACHE_OPERATIONS, "cache_operations");
        assert_eq!(REQUEST_DURATION_SECONDS, "request_duration_seconds");
        assert_eq!(ASYNC_QUEUE_DEPTH, "async_queue_depth");
        assert_eq!(ASYNC_QUEUE_CAPACITY, "async_queue_capacity");
        assert_eq!(ASYNC_WRITE_ERRORS, "async_write_errors");
        assert_eq!(WRITE_FORWARDS, "write_forwards");
        assert_eq!(PRIMARY_QUERIES, "primary_queries");
        assert_eq!(HEALTH_STATUS, "health_status");
    }

    #[test]
    fn error_type_labels() {
        assert_eq!(error_types::QUEUE_FULL, "queue_full");
        assert_eq!(error_types::REQUEUE_FAILED, "requeue_failed");
        assert_eq!(error_types::MAX_RETRIES_EXCEEDED, "max_retries_exceeded");
    }

    #[test]
    fn emit_helpers_do_not_panic_without_recorder() {
        record_cache_operation("get", "hit", "tenant-a", "primary");
        record_request_duration("GET", "/v1/cache/{key}", 200, "tenant-a", "primary", 0.004);
        set_queue_gauges("tenant-a", 3, 10_000);
        record_async_write_error("tenant-a", error_types::QUEUE_FULL);
        record_write_forward("tenant-a", "success");
        record_primary_query("tenant-a", "hit");
        set_health_status("tenant-a", "replica", 0.5);
    }
}
