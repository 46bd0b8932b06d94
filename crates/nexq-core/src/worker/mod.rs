//! Worker loop: polling, handler dispatch, retry and dead-letter decisions.

mod retry;

pub use retry::RetryPolicy;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{Task, TaskStatus};
use crate::metrics;
use crate::queue::QueueEngine;
use crate::runtime::{HandlerContext, HandlerRegistry};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One cooperative queue consumer. Several workers (in one process or many)
/// may share a queue; the cache's atomic counters keep their claims disjoint.
pub struct Worker {
    id: String,
    queue: Arc<QueueEngine>,
    registry: Arc<HandlerRegistry>,
    poll_interval: Duration,
    retry_policy: RetryPolicy,
    handler_timeout: Duration,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(id: impl Into<String>, queue: Arc<QueueEngine>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            id: id.into(),
            queue,
            registry,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry_policy: RetryPolicy::default(),
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Clone this to request a stop; the worker finishes the in-flight
    /// attempt and exits.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(&self) {
        info!(worker_id = %self.id, "worker started");
        metrics::update_workers_active(1);

        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.process_next().await,
            }
        }

        metrics::update_workers_active(-1);
        info!(worker_id = %self.id, "worker stopped");
    }

    async fn process_next(&self) {
        match self.queue.dequeue().await {
            Ok(Some(task)) => self.process_task(task).await,
            Ok(None) => {}
            Err(err) => warn!(worker_id = %self.id, %err, "dequeue failed"),
        }
    }

    async fn process_task(&self, mut task: Task) {
        debug!(
            worker_id = %self.id,
            task_id = %task.id,
            task_type = %task.task_type,
            "processing task"
        );

        if self.queue.is_cancelled(&task.id).await.unwrap_or(false) {
            info!(task_id = %task.id, "task was cancelled, skipping execution");
            return;
        }

        let started_at = Utc::now();
        task.status = TaskStatus::Running;
        task.started_at = Some(started_at);
        if let Err(err) = self.queue.update_task(&task).await {
            warn!(task_id = %task.id, %err, "failed to update task status to running");
        }
        if let Err(err) = self
            .queue
            .log_execution(
                &task.id,
                task.retry_count + 1,
                TaskStatus::Running,
                0,
                "",
                &self.id,
            )
            .await
        {
            warn!(task_id = %task.id, %err, "failed to log execution start");
        }

        // A missing handler is an ordinary failure: the task keeps its retry
        // budget so a late registration can still drain the queue.
        let Some(handler) = self.registry.get(&task.task_type) else {
            let reason = format!("no handler for task type: {}", task.task_type);
            self.handle_failure(task, &reason, started_at).await;
            return;
        };

        let token = CancellationToken::new();
        let deadline = started_at
            + chrono::Duration::from_std(self.handler_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let ctx = HandlerContext::new(token.clone(), deadline);
        let watcher = tokio::spawn(watch_for_cancellation(
            self.queue.clone(),
            task.id.clone(),
            token.clone(),
            self.handler_timeout,
        ));

        let result = handler.handle(&ctx, &task).await;
        watcher.abort();

        // Cancellation (or a blown deadline, which is indistinguishable)
        // wins over whatever the handler returned.
        if token.is_cancelled() {
            let completed_at = Utc::now();
            let duration_ms = (completed_at - started_at).num_milliseconds();
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(completed_at);

            if let Err(err) = self.queue.update_task(&task).await {
                warn!(task_id = %task.id, %err, "failed to update cancelled task");
            }
            if let Err(err) = self
                .queue
                .log_execution(
                    &task.id,
                    task.retry_count + 1,
                    TaskStatus::Cancelled,
                    duration_ms,
                    "task cancelled during execution",
                    &self.id,
                )
                .await
            {
                warn!(task_id = %task.id, %err, "failed to log cancelled execution");
            }

            info!(task_id = %task.id, "task cancelled during execution");
            return;
        }

        match result {
            Ok(()) => self.handle_success(task, started_at).await,
            Err(err) => self.handle_failure(task, &err.to_string(), started_at).await,
        }
    }

    async fn handle_success(&self, mut task: Task, started_at: DateTime<Utc>) {
        let completed_at = Utc::now();
        let duration_ms = (completed_at - started_at).num_milliseconds();
        task.status = TaskStatus::Completed;
        task.completed_at = Some(completed_at);

        if let Err(err) = self.queue.update_task(&task).await {
            warn!(task_id = %task.id, %err, "failed to update completed task");
        }
        if let Err(err) = self.queue.complete_task(&task, duration_ms).await {
            warn!(task_id = %task.id, %err, "failed to mark task as completed in history");
        }
        if let Err(err) = self
            .queue
            .log_execution(
                &task.id,
                task.retry_count + 1,
                TaskStatus::Completed,
                duration_ms,
                "",
                &self.id,
            )
            .await
        {
            warn!(task_id = %task.id, %err, "failed to log execution");
        }

        info!(
            worker_id = %self.id,
            task_id = %task.id,
            duration_ms,
            "task completed"
        );
    }

    async fn handle_failure(&self, mut task: Task, reason: &str, started_at: DateTime<Utc>) {
        let duration_ms = (Utc::now() - started_at).num_milliseconds();
        task.retry_count += 1;
        task.error = reason.to_string();

        if let Err(err) = self
            .queue
            .log_execution(
                &task.id,
                task.retry_count,
                TaskStatus::Failed,
                duration_ms,
                reason,
                &self.id,
            )
            .await
        {
            warn!(task_id = %task.id, %err, "failed to log execution");
        }

        if task.retry_count < task.max_retries {
            task.status = TaskStatus::Pending;
            let backoff = self.retry_policy.delay(task.retry_count);
            task.scheduled_at = Utc::now()
                + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero());

            if let Err(err) = self.queue.enqueue(&task).await {
                error!(task_id = %task.id, %err, "failed to re-enqueue task");
            }
            if let Err(err) = self.queue.increment_retry_count(&task.id).await {
                warn!(task_id = %task.id, %err, "failed to increment retry count");
            }
            if let Err(err) = self.queue.fail_task(&task, reason, duration_ms).await {
                warn!(task_id = %task.id, %err, "failed to record task failure");
            }

            info!(
                worker_id = %self.id,
                task_id = %task.id,
                retry_count = task.retry_count,
                max_retries = task.max_retries,
                backoff_secs = backoff.as_secs_f64(),
                "task failed, will retry"
            );
        } else {
            task.status = TaskStatus::Failed;
            if let Err(err) = self.queue.update_task(&task).await {
                warn!(task_id = %task.id, %err, "failed to update failed task");
            }
            if let Err(err) = self.queue.move_to_dead_letter(&mut task, reason).await {
                error!(task_id = %task.id, %err, "failed to move task to DLQ");
            }

            warn!(
                worker_id = %self.id,
                task_id = %task.id,
                attempts = task.retry_count,
                reason,
                "task failed permanently"
            );
        }
    }
}

/// Cancels the attempt token when the queue's sticky cancellation flag
/// appears or the handler deadline passes. Aborted by the worker as soon as
/// the handler returns.
async fn watch_for_cancellation(
    queue: Arc<QueueEngine>,
    task_id: String,
    token: CancellationToken,
    timeout: Duration,
) {
    let flag_set = async {
        let mut ticker = tokio::time::interval(CANCEL_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            if queue.is_cancelled(&task_id).await.unwrap_or(false) {
                break;
            }
        }
    };

    tokio::select! {
        _ = tokio::time::sleep(timeout) => token.cancel(),
        _ = flag_set => token.cancel(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryKv;
    use crate::domain::{Payload, TaskPriority};
    use crate::error::Error;
    use crate::history::{HistoryStore, MemoryHistory};
    use crate::runtime::TaskHandler;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::sleep;

    struct FailingHandler {
        calls: AtomicU32,
        remaining_failures: AtomicU32,
    }

    impl FailingHandler {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                remaining_failures: AtomicU32::new(failures),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TaskHandler for FailingHandler {
        async fn handle(&self, _ctx: &HandlerContext, _task: &Task) -> Result<(), Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.remaining_failures.load(Ordering::SeqCst);
            if left > 0 {
                self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Handler("boom".to_string()));
            }
            Ok(())
        }
    }

    struct BlockingHandler;

    #[async_trait]
    impl TaskHandler for BlockingHandler {
        async fn handle(&self, ctx: &HandlerContext, _task: &Task) -> Result<(), Error> {
            tokio::select! {
                _ = sleep(Duration::from_secs(5)) => Ok(()),
                _ = ctx.cancelled() => Err(Error::Cancelled),
            }
        }
    }

    struct Fixture {
        queue: Arc<QueueEngine>,
        history: Arc<MemoryHistory>,
    }

    fn fixture() -> Fixture {
        let history = Arc::new(MemoryHistory::new());
        let queue = Arc::new(QueueEngine::new(
            Arc::new(MemoryKv::new()),
            Some(history.clone() as Arc<dyn HistoryStore>),
        ));
        Fixture { queue, history }
    }

    fn worker(fixture: &Fixture, registry: HandlerRegistry) -> Worker {
        Worker::new("worker-test", fixture.queue.clone(), Arc::new(registry))
            .with_poll_interval(Duration::from_millis(10))
            .with_retry_policy(RetryPolicy::new(Duration::from_millis(30)))
    }

    fn pending_task(task_type: &str) -> Task {
        Task::new(task_type, Payload::new(), TaskPriority::Medium)
    }

    #[tokio::test]
    async fn successful_attempt_completes_the_task() {
        let fx = fixture();
        let handler = FailingHandler::new(0);
        let mut registry = HandlerRegistry::new();
        registry.register("ok", handler.clone());
        let w = worker(&fx, registry);

        let t = pending_task("ok");
        fx.queue.enqueue(&t).await.unwrap();
        let dequeued = fx.queue.dequeue().await.unwrap().unwrap();
        w.process_task(dequeued).await;

        assert_eq!(handler.calls(), 1);
        let stored = fx.queue.get_task(&t.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.completed_at.is_some());
        assert_eq!(fx.history.complete_calls().await.len(), 1);

        let log = fx.history.execution_statuses(&t.id).await;
        assert_eq!(
            log,
            vec![(1, TaskStatus::Running), (1, TaskStatus::Completed)]
        );
    }

    #[tokio::test]
    async fn failed_attempt_reschedules_with_growing_backoff() {
        let fx = fixture();
        let mut registry = HandlerRegistry::new();
        registry.register("flaky", FailingHandler::new(100));
        let w = worker(&fx, registry);

        let t = pending_task("flaky");
        fx.queue.enqueue(&t).await.unwrap();

        // Attempt 1.
        let before_first = Utc::now();
        let dequeued = fx.queue.dequeue().await.unwrap().unwrap();
        w.process_task(dequeued).await;

        let after_first = fx.queue.get_task(&t.id).await.unwrap();
        assert_eq!(after_first.status, TaskStatus::Pending);
        assert_eq!(after_first.retry_count, 1);
        assert_eq!(after_first.error, "boom");
        let first_delay = after_first.scheduled_at - before_first;
        assert!(first_delay >= chrono::Duration::milliseconds(30));

        // Attempt 2, once the backoff has elapsed.
        sleep(Duration::from_millis(50)).await;
        let before_second = Utc::now();
        let dequeued = fx.queue.dequeue().await.unwrap().unwrap();
        w.process_task(dequeued).await;

        let after_second = fx.queue.get_task(&t.id).await.unwrap();
        assert_eq!(after_second.retry_count, 2);
        let second_delay = after_second.scheduled_at - before_second;
        assert!(
            second_delay > first_delay,
            "wait must grow strictly between attempts"
        );

        assert_eq!(fx.history.increment_retry_calls().await.len(), 2);
        assert_eq!(fx.history.fail_calls().await.len(), 2);
    }

    #[tokio::test]
    async fn retries_exhaust_into_the_dead_letter_queue() {
        let fx = fixture();
        let handler = FailingHandler::new(100);
        let mut registry = HandlerRegistry::new();
        registry.register("doomed", handler.clone());
        let w = worker(&fx, registry);

        let t = pending_task("doomed");
        fx.queue.enqueue(&t).await.unwrap();

        for _ in 0..t.max_retries {
            sleep(Duration::from_millis(100)).await;
            let dequeued = fx.queue.dequeue().await.unwrap().unwrap();
            w.process_task(dequeued).await;
        }

        assert_eq!(handler.calls(), 3);

        let dead = fx.queue.get_dead_letter_task(&t.id).await.unwrap();
        assert_eq!(dead.status, TaskStatus::DeadLetter);
        assert_eq!(dead.retry_count, 3);
        assert_eq!(dead.failure_reason, "boom");
        assert!(dead.retry_count <= dead.max_retries);

        let log = fx.history.execution_statuses(&t.id).await;
        let running = log.iter().filter(|(_, s)| *s == TaskStatus::Running).count();
        let failed = log.iter().filter(|(_, s)| *s == TaskStatus::Failed).count();
        assert_eq!(running, 3);
        assert_eq!(failed, 3);

        assert!(
            fx.queue.dequeue().await.unwrap().is_none(),
            "dead-lettered tasks are not dispatched"
        );
    }

    #[tokio::test]
    async fn missing_handler_takes_the_retry_path() {
        let fx = fixture();
        let w = worker(&fx, HandlerRegistry::new());

        let t = pending_task("unregistered");
        fx.queue.enqueue(&t).await.unwrap();
        let dequeued = fx.queue.dequeue().await.unwrap().unwrap();
        w.process_task(dequeued).await;

        let stored = fx.queue.get_task(&t.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.error, "no handler for task type: unregistered");
        assert!(
            fx.queue.get_dead_letter_task(&t.id).await.is_err(),
            "no short-circuit to the DLQ"
        );
    }

    #[tokio::test]
    async fn cancelled_task_is_never_handed_to_the_handler() {
        let fx = fixture();
        let handler = FailingHandler::new(0);
        let mut registry = HandlerRegistry::new();
        registry.register("ok", handler.clone());
        let w = worker(&fx, registry);

        let t = pending_task("ok");
        fx.queue.enqueue(&t).await.unwrap();
        let dequeued = fx.queue.dequeue().await.unwrap().unwrap();

        // Flag lands after dequeue but before execution. Dequeue removed the
        // cache snapshot, so put it back first the way a running update would.
        fx.queue.update_task(&dequeued).await.unwrap();
        fx.queue.cancel_task(&t.id).await.unwrap();
        w.process_task(dequeued).await;

        assert_eq!(handler.calls(), 0);
        assert_eq!(
            fx.queue.get_task(&t.id).await.unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn cancelling_a_running_task_interrupts_the_handler() {
        let fx = fixture();
        let mut registry = HandlerRegistry::new();
        registry.register("slow", Arc::new(BlockingHandler));
        let w = Arc::new(worker(&fx, registry));

        let t = pending_task("slow");
        fx.queue.enqueue(&t).await.unwrap();
        let dequeued = fx.queue.dequeue().await.unwrap().unwrap();

        let queue = fx.queue.clone();
        let task_id = t.id.clone();
        let cancel = tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            queue.cancel_task(&task_id).await.unwrap();
        });

        let started = std::time::Instant::now();
        w.process_task(dequeued).await;
        cancel.await.unwrap();

        assert!(
            started.elapsed() < Duration::from_secs(2),
            "handler must return promptly after cancellation"
        );
        assert_eq!(
            fx.queue.get_task(&t.id).await.unwrap().status,
            TaskStatus::Cancelled
        );

        let log = fx.history.execution_statuses(&t.id).await;
        assert!(log.contains(&(1, TaskStatus::Cancelled)));
    }

    #[tokio::test]
    async fn deadline_exceeded_follows_the_cancellation_branch() {
        let fx = fixture();
        let mut registry = HandlerRegistry::new();
        registry.register("slow", Arc::new(BlockingHandler));
        let w = worker(&fx, registry).with_handler_timeout(Duration::from_millis(50));

        let t = pending_task("slow");
        fx.queue.enqueue(&t).await.unwrap();
        let dequeued = fx.queue.dequeue().await.unwrap().unwrap();
        w.process_task(dequeued).await;

        let stored = fx.queue.get_task(&t.id).await.unwrap();
        assert_eq!(
            stored.status,
            TaskStatus::Cancelled,
            "timeout is cancellation, not failure"
        );
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn run_loop_drains_the_queue_and_stops_on_shutdown() {
        let fx = fixture();
        let handler = FailingHandler::new(0);
        let mut registry = HandlerRegistry::new();
        registry.register("ok", handler.clone());
        let w = Arc::new(worker(&fx, registry));

        let t = pending_task("ok");
        fx.queue.enqueue(&t).await.unwrap();

        let shutdown = w.shutdown_token();
        let run = tokio::spawn({
            let w = w.clone();
            async move { w.run().await }
        });

        for _ in 0..50 {
            if fx
                .queue
                .get_task(&t.id)
                .await
                .map(|t| t.status == TaskStatus::Completed)
                .unwrap_or(false)
            {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }

        shutdown.cancel();
        run.await.unwrap();

        assert_eq!(handler.calls(), 1);
        assert_eq!(
            fx.queue.get_task(&t.id).await.unwrap().status,
            TaskStatus::Completed
        );
    }
}
