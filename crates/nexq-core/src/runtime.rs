//! Handler trait, registry and per-attempt context.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::domain::Task;
use crate::error::Error;

/// Everything a handler may observe about its attempt: cooperative
/// cancellation and the attempt deadline. Handlers that ignore the context
/// simply will not be cancellable; the worker still finishes its bookkeeping
/// when they return.
#[derive(Clone)]
pub struct HandlerContext {
    token: CancellationToken,
    deadline: DateTime<Utc>,
}

impl HandlerContext {
    pub fn new(token: CancellationToken, deadline: DateTime<Utc>) -> Self {
        Self { token, deadline }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the attempt is cancelled (or its deadline passed).
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }
}

/// A handler for one task type. Handlers are untrusted user code: they get
/// the task value and the context, nothing else.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: &HandlerContext, task: &Task) -> Result<(), Error>;
}

/// Maps a task type string to its handler. Populated at startup and
/// read-only afterwards; registering a type twice replaces the handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type.into(), handler);
    }

    pub fn get(&self, task_type: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(task_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Payload, TaskPriority};

    struct OkHandler;

    #[async_trait]
    impl TaskHandler for OkHandler {
        async fn handle(&self, _ctx: &HandlerContext, _task: &Task) -> Result<(), Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn registry_lookup() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.is_empty());

        registry.register("ok", Arc::new(OkHandler));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("ok").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn registered_handler_runs() {
        let mut registry = HandlerRegistry::new();
        registry.register("ok", Arc::new(OkHandler));

        let ctx = HandlerContext::new(CancellationToken::new(), Utc::now());
        let task = Task::new("ok", Payload::new(), TaskPriority::Medium);

        let handler = registry.get("ok").unwrap();
        handler.handle(&ctx, &task).await.unwrap();
    }

    #[tokio::test]
    async fn context_reports_cancellation() {
        let token = CancellationToken::new();
        let ctx = HandlerContext::new(token.clone(), Utc::now());
        assert!(!ctx.is_cancelled());

        token.cancel();
        assert!(ctx.is_cancelled());
        ctx.cancelled().await;
    }
}
