//! nexq-core
//!
//! Core building blocks for the NexQ job queue:
//! - domain: task model, status and priority
//! - cache: key-value store port backing the queue (Pogocache / in-memory)
//! - queue: the cache-backed queue engine (pending queue, DLQ, cancellation)
//! - dispatch: priority / schedule ordering policy used on dequeue
//! - history: durable audit store port (Postgres / in-memory)
//! - worker: poll loop, handler dispatch, retry and dead-letter decisions
//! - runtime: handler trait, registry and per-attempt context
//! - handlers: bundled task handlers (report generation)
//! - metrics: counters, gauges and histograms emitted by the engine/worker

pub mod cache;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod history;
pub mod metrics;
pub mod queue;
pub mod runtime;
pub mod worker;

pub use error::Error;
