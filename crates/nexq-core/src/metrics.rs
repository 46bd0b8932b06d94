//! Queue metrics.
//!
//! Metric names and record helpers over the `metrics` facade. The engine and
//! worker emit unconditionally; with no recorder installed every emission is
//! a no-op. The server binary installs the Prometheus recorder and serves the
//! rendered text at `/metrics`.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use crate::domain::{TaskPriority, TaskStatus};

pub const TASKS_ENQUEUED: &str = "nexq_tasks_enqueued_total";
pub const TASKS_COMPLETED: &str = "nexq_tasks_completed_total";
pub const TASKS_FAILED: &str = "nexq_tasks_failed_total";
pub const TASKS_CANCELLED: &str = "nexq_tasks_cancelled_total";
pub const TASKS_RETRIED: &str = "nexq_tasks_retried_total";
pub const TASKS_DEAD_LETTERED: &str = "nexq_tasks_dead_lettered_total";
pub const TASKS_IN_QUEUE: &str = "nexq_tasks_in_queue";
pub const TASK_DURATION: &str = "nexq_task_duration_seconds";
pub const TASK_WAIT_TIME: &str = "nexq_task_wait_time_seconds";
pub const QUEUE_DEPTH: &str = "nexq_queue_depth";
pub const DLQ_DEPTH: &str = "nexq_dead_letter_queue_depth";
pub const WORKERS_ACTIVE: &str = "nexq_workers_active";
pub const HTTP_REQUESTS: &str = "nexq_http_requests_total";
pub const HTTP_REQUEST_DURATION: &str = "nexq_http_request_duration_seconds";

/// Histogram buckets for task execution duration (seconds).
pub const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

/// Histogram buckets for time spent waiting in the queue (seconds).
pub const WAIT_TIME_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0,
];

/// Registers metric descriptions. Call once at startup after installing the
/// recorder.
pub fn register_metrics() {
    describe_counter!(TASKS_ENQUEUED, "Total number of tasks enqueued");
    describe_counter!(
        TASKS_COMPLETED,
        "Total number of tasks completed successfully"
    );
    describe_counter!(TASKS_FAILED, "Total number of tasks that failed");
    describe_counter!(TASKS_CANCELLED, "Total number of tasks cancelled");
    describe_counter!(TASKS_RETRIED, "Total number of task retries");
    describe_counter!(
        TASKS_DEAD_LETTERED,
        "Total number of tasks moved to the dead letter queue"
    );
    describe_gauge!(TASKS_IN_QUEUE, "Current number of tasks by status");
    describe_histogram!(TASK_DURATION, "Task execution duration in seconds");
    describe_histogram!(
        TASK_WAIT_TIME,
        "Time tasks spend waiting in queue before execution"
    );
    describe_gauge!(QUEUE_DEPTH, "Current depth of the task queue");
    describe_gauge!(DLQ_DEPTH, "Current depth of the dead letter queue");
    describe_gauge!(WORKERS_ACTIVE, "Number of currently active workers");
    describe_counter!(HTTP_REQUESTS, "Total number of HTTP requests");
    describe_histogram!(HTTP_REQUEST_DURATION, "HTTP request duration in seconds");
}

pub fn record_task_enqueued(task_type: &str, priority: TaskPriority) {
    counter!(
        TASKS_ENQUEUED,
        "type" => task_type.to_string(),
        "priority" => priority.label(),
    )
    .increment(1);
}

pub fn record_task_completed(task_type: &str, duration_secs: f64) {
    counter!(TASKS_COMPLETED, "type" => task_type.to_string()).increment(1);
    histogram!(
        TASK_DURATION,
        "type" => task_type.to_string(),
        "status" => "completed",
    )
    .record(duration_secs);
}

pub fn record_task_failed(task_type: &str, duration_secs: f64) {
    counter!(TASKS_FAILED, "type" => task_type.to_string()).increment(1);
    histogram!(
        TASK_DURATION,
        "type" => task_type.to_string(),
        "status" => "failed",
    )
    .record(duration_secs);
}

pub fn record_task_cancelled(task_type: &str) {
    counter!(TASKS_CANCELLED, "type" => task_type.to_string()).increment(1);
}

pub fn record_task_retried(task_type: &str) {
    counter!(TASKS_RETRIED, "type" => task_type.to_string()).increment(1);
}

pub fn record_task_dead_lettered(task_type: &str) {
    counter!(TASKS_DEAD_LETTERED, "type" => task_type.to_string()).increment(1);
}

pub fn record_task_wait_time(task_type: &str, priority: TaskPriority, wait_secs: f64) {
    histogram!(
        TASK_WAIT_TIME,
        "type" => task_type.to_string(),
        "priority" => priority.label(),
    )
    .record(wait_secs);
}

pub fn update_task_gauge(status: TaskStatus, task_type: &str, count: usize) {
    gauge!(
        TASKS_IN_QUEUE,
        "status" => status.as_str(),
        "type" => task_type.to_string(),
    )
    .set(count as f64);
}

pub fn update_queue_depth(depth: usize) {
    gauge!(QUEUE_DEPTH).set(depth as f64);
}

pub fn update_dlq_depth(depth: usize) {
    gauge!(DLQ_DEPTH).set(depth as f64);
}

pub fn update_workers_active(delta: i64) {
    if delta >= 0 {
        gauge!(WORKERS_ACTIVE).increment(delta as f64);
    } else {
        gauge!(WORKERS_ACTIVE).decrement((-delta) as f64);
    }
}

pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    counter!(
        HTTP_REQUESTS,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);
    histogram!(
        HTTP_REQUEST_DURATION,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
    )
    .record(duration_secs);
}
