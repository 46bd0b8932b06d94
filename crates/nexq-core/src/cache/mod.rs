//! Key-value store port backing the queue engine.
//!
//! The engine only needs string keys, integer counters and a scan primitive,
//! so the port stays narrow. `RedisKv` talks RESP to a Pogocache (or any
//! Redis-compatible) instance; `MemoryKv` backs tests and single-process use.

mod memory;
mod redis;

pub use memory::MemoryKv;
pub use redis::RedisKv;

use async_trait::async_trait;

use crate::error::Error;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    async fn set(&self, key: &str, value: &str) -> Result<(), Error>;

    async fn del(&self, key: &str) -> Result<(), Error>;

    /// Atomic increment; a missing key counts as 0. Returns the new value.
    async fn incr(&self, key: &str) -> Result<i64, Error>;

    async fn exists(&self, key: &str) -> Result<bool, Error>;

    /// All keys matching a glob pattern (only trailing-`*` patterns are used).
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, Error>;
}

/// Cache key layout. Bit-exact: workers from different processes interoperate
/// through these names.
pub mod keys {
    pub const QUEUE_HEAD: &str = "queue:head";
    pub const QUEUE_TAIL: &str = "queue:tail";
    pub const DLQ_HEAD: &str = "dlq:head";
    pub const DLQ_TAIL: &str = "dlq:tail";

    pub const TASK_PATTERN: &str = "task:*";
    pub const DLQ_TASK_PATTERN: &str = "dlq:task:*";

    pub fn queue_item(seq: i64) -> String {
        format!("queue:item:{seq}")
    }

    pub fn task(id: &str) -> String {
        format!("task:{id}")
    }

    pub fn dlq_item(seq: i64) -> String {
        format!("dlq:item:{seq}")
    }

    pub fn dlq_task(id: &str) -> String {
        format!("dlq:task:{id}")
    }

    pub fn cancelled(id: &str) -> String {
        format!("cancelled:{id}")
    }
}
