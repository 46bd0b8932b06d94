//! Cache-backed queue engine.
//!
//! The cache owns "what to run next" (pending queue, DLQ, cancellation
//! flags); the history store owns "what has ever happened". History writes
//! are best-effort on the enqueue path and never block task progress.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::cache::{keys, KvStore};
use crate::dispatch::{self, Candidate};
use crate::domain::{Task, TaskStatus};
use crate::error::Error;
use crate::history::HistoryStore;
use crate::metrics;

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterStats {
    pub total_tasks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest: Option<DateTime<Utc>>,
}

pub struct QueueEngine {
    kv: Arc<dyn KvStore>,
    history: Option<Arc<dyn HistoryStore>>,
}

impl QueueEngine {
    pub fn new(kv: Arc<dyn KvStore>, history: Option<Arc<dyn HistoryStore>>) -> Self {
        Self { kv, history }
    }

    pub fn history(&self) -> Option<&Arc<dyn HistoryStore>> {
        self.history.as_ref()
    }

    async fn counter(&self, key: &str) -> Result<i64, Error> {
        Ok(self
            .kv
            .get(key)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0))
    }

    /// Places a pending task into the queue. The history snapshot is
    /// best-effort; the cache writes are not.
    pub async fn enqueue(&self, task: &Task) -> Result<(), Error> {
        if let Some(history) = &self.history {
            if let Err(err) = history.save_task(task).await {
                warn!(task_id = %task.id, %err, "failed to save task in history");
            }
        }

        let data = task.to_json()?;
        let seq = self.kv.incr(keys::QUEUE_TAIL).await?;
        self.kv.set(&keys::queue_item(seq), &task.id).await?;
        self.kv.set(&keys::task(&task.id), &data).await?;

        metrics::record_task_enqueued(&task.task_type, task.priority);
        Ok(())
    }

    /// Appends a fresh tail slot for an already-stored task. Used when
    /// dequeue puts non-winning candidates back; no history write, no
    /// enqueue metric.
    async fn append_slot(&self, task_id: &str) -> Result<(), Error> {
        let seq = self.kv.incr(keys::QUEUE_TAIL).await?;
        self.kv.set(&keys::queue_item(seq), task_id).await?;
        Ok(())
    }

    /// Returns the next eligible task, or `None` when the queue is empty or
    /// nothing is due yet.
    ///
    /// Each slot is claimed by the atomic increment on `queue:head`, so a
    /// sequence number is consumed by exactly one caller. The claimed window
    /// is then filtered (future `scheduled_at` stays queued, cancelled tasks
    /// are dropped) and the dispatch policy picks the winner; the remainder
    /// goes back to fresh tail slots in its original order.
    pub async fn dequeue(&self) -> Result<Option<Task>, Error> {
        let tail = self.counter(keys::QUEUE_TAIL).await?;
        if self.counter(keys::QUEUE_HEAD).await? >= tail {
            return Ok(None);
        }

        let mut claimed: Vec<(i64, Task)> = Vec::new();
        loop {
            if self.counter(keys::QUEUE_HEAD).await? >= tail {
                break;
            }
            let seq = self.kv.incr(keys::QUEUE_HEAD).await?;

            // A missing item key is a slot skipped by a crashed reader or a
            // concurrent purge; claiming past it is the documented cost of
            // at-most-once hand-off.
            let Some(task_id) = self.kv.get(&keys::queue_item(seq)).await? else {
                continue;
            };
            self.kv.del(&keys::queue_item(seq)).await?;

            if self.is_cancelled(&task_id).await.unwrap_or(false) {
                continue;
            }
            let Some(data) = self.kv.get(&keys::task(&task_id)).await? else {
                continue;
            };
            let Ok(task) = Task::from_json(&data) else {
                continue;
            };
            claimed.push((seq, task));
        }

        if claimed.is_empty() {
            return Ok(None);
        }

        let now = Utc::now();
        let candidates: Vec<Candidate> = claimed
            .iter()
            .map(|(seq, task)| Candidate {
                seq: *seq,
                priority: task.priority,
                scheduled_at: task.scheduled_at,
            })
            .collect();

        let Some(winner) = dispatch::next_eligible(&candidates, now) else {
            for (_, task) in &claimed {
                self.append_slot(&task.id).await?;
            }
            return Ok(None);
        };

        let (_, task) = claimed.remove(winner);
        for (_, rest) in &claimed {
            self.append_slot(&rest.id).await?;
        }

        let wait_secs = (now - task.created_at).num_milliseconds().max(0) as f64 / 1000.0;
        metrics::record_task_wait_time(&task.task_type, task.priority, wait_secs);

        if let Some(history) = &self.history {
            if let Err(err) = history
                .update_task_status(&task.id, TaskStatus::Running, "")
                .await
            {
                warn!(task_id = %task.id, %err, "failed to update task status in history");
            }
        }

        self.kv.del(&keys::task(&task.id)).await?;
        Ok(Some(task))
    }

    /// Writes the task back to the cache and upserts the history snapshot.
    pub async fn update_task(&self, task: &Task) -> Result<(), Error> {
        let data = task.to_json()?;

        if let Some(history) = &self.history {
            if let Err(err) = history.save_task(task).await {
                warn!(task_id = %task.id, %err, "failed to update task in history");
            }
        }

        self.kv.set(&keys::task(&task.id), &data).await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task, Error> {
        match self.kv.get(&keys::task(task_id)).await? {
            Some(data) => Task::from_json(&data),
            None => Err(Error::TaskNotFound(task_id.to_string())),
        }
    }

    /// Best-effort snapshot of every task visible in the cache. Missing or
    /// corrupt values are skipped; an empty scan is an empty list, never an
    /// error.
    pub async fn get_all_tasks(&self) -> Result<Vec<Task>, Error> {
        self.scan_tasks(keys::TASK_PATTERN).await
    }

    async fn scan_tasks(&self, pattern: &str) -> Result<Vec<Task>, Error> {
        let mut tasks = Vec::new();
        for key in self.kv.scan_keys(pattern).await? {
            let Some(data) = self.kv.get(&key).await? else {
                continue;
            };
            let Ok(task) = Task::from_json(&data) else {
                continue;
            };
            tasks.push(task);
        }
        Ok(tasks)
    }

    /// Marks a task cancelled and sets the sticky flag so it is skipped at
    /// the next dequeue. Fails with `CannotCancel` on terminal statuses.
    pub async fn cancel_task(&self, task_id: &str) -> Result<(), Error> {
        let mut task = self.get_task(task_id).await?;
        if task.status.is_terminal() {
            return Err(Error::CannotCancel {
                id: task_id.to_string(),
                status: task.status,
            });
        }

        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());

        self.kv.set(&keys::task(task_id), &task.to_json()?).await?;
        self.kv.set(&keys::cancelled(task_id), "1").await?;

        if let Some(history) = &self.history {
            if let Err(err) = history
                .update_task_status(task_id, TaskStatus::Cancelled, "")
                .await
            {
                warn!(%task_id, %err, "failed to record cancellation in history");
            }
        }

        metrics::record_task_cancelled(&task.task_type);
        Ok(())
    }

    pub async fn is_cancelled(&self, task_id: &str) -> Result<bool, Error> {
        self.kv.exists(&keys::cancelled(task_id)).await
    }

    pub async fn move_to_dead_letter(&self, task: &mut Task, reason: &str) -> Result<(), Error> {
        task.failure_reason = reason.to_string();
        task.moved_to_dlq_at = Some(Utc::now());
        task.status = TaskStatus::DeadLetter;

        if let Some(history) = &self.history {
            if let Err(err) = history.move_task_to_dlq(&task.id, reason).await {
                warn!(task_id = %task.id, %err, "failed to move task to DLQ in history");
            }
        }

        let data = task.to_json()?;
        let seq = self.kv.incr(keys::DLQ_TAIL).await?;
        self.kv.set(&keys::dlq_item(seq), &task.id).await?;
        self.kv.set(&keys::dlq_task(&task.id), &data).await?;

        metrics::record_task_dead_lettered(&task.task_type);
        Ok(())
    }

    pub async fn get_dead_letter_tasks(&self) -> Result<Vec<Task>, Error> {
        self.scan_tasks(keys::DLQ_TASK_PATTERN).await
    }

    pub async fn get_dead_letter_task(&self, task_id: &str) -> Result<Task, Error> {
        match self.kv.get(&keys::dlq_task(task_id)).await? {
            Some(data) => Task::from_json(&data),
            None => Err(Error::TaskNotFound(task_id.to_string())),
        }
    }

    /// Resurrects a dead-lettered task to pending with a clean retry state.
    pub async fn retry_dead_letter(&self, task_id: &str) -> Result<(), Error> {
        let data = self
            .kv
            .get(&keys::dlq_task(task_id))
            .await?
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        let mut task = Task::from_json(&data)?;

        task.retry_count = 0;
        task.failure_reason = String::new();
        task.moved_to_dlq_at = None;
        task.scheduled_at = Utc::now();
        task.status = TaskStatus::Pending;

        self.enqueue(&task).await?;
        self.kv.del(&keys::dlq_task(task_id)).await?;

        metrics::record_task_retried(&task.task_type);
        Ok(())
    }

    /// Idempotent: purging an absent id succeeds.
    pub async fn purge_dead_letter(&self, task_id: &str) -> Result<(), Error> {
        self.kv.del(&keys::dlq_task(task_id)).await
    }

    pub async fn dead_letter_stats(&self) -> Result<DeadLetterStats, Error> {
        let tasks = self.get_dead_letter_tasks().await?;
        let moved: Vec<DateTime<Utc>> = tasks.iter().filter_map(|t| t.moved_to_dlq_at).collect();

        Ok(DeadLetterStats {
            total_tasks: tasks.len(),
            oldest: moved.iter().min().copied(),
            newest: moved.iter().max().copied(),
        })
    }

    /// Records the completion metric and the history row.
    pub async fn complete_task(&self, task: &Task, duration_ms: i64) -> Result<(), Error> {
        metrics::record_task_completed(&task.task_type, duration_ms as f64 / 1000.0);

        if let Some(history) = &self.history {
            history.complete_task(&task.id, duration_ms).await?;
        }
        Ok(())
    }

    /// Records the failure metric and the history row.
    pub async fn fail_task(&self, task: &Task, reason: &str, duration_ms: i64) -> Result<(), Error> {
        metrics::record_task_failed(&task.task_type, duration_ms as f64 / 1000.0);

        if let Some(history) = &self.history {
            history.fail_task(&task.id, reason, duration_ms).await?;
        }
        Ok(())
    }

    pub async fn increment_retry_count(&self, task_id: &str) -> Result<(), Error> {
        if let Some(history) = &self.history {
            history.increment_retry_count(task_id).await?;
        }
        Ok(())
    }

    pub async fn log_execution(
        &self,
        task_id: &str,
        attempt_number: u32,
        status: TaskStatus,
        duration_ms: i64,
        error_message: &str,
        worker_id: &str,
    ) -> Result<(), Error> {
        if let Some(history) = &self.history {
            history
                .log_execution(
                    task_id,
                    attempt_number,
                    status,
                    duration_ms,
                    error_message,
                    worker_id,
                )
                .await?;
        }
        Ok(())
    }

    /// Recomputes the queue gauges from cache scans.
    pub async fn update_gauges(&self) -> Result<(), Error> {
        let tasks = self.get_all_tasks().await?;

        let mut by_status_type: HashMap<(TaskStatus, String), usize> = HashMap::new();
        for task in &tasks {
            *by_status_type
                .entry((task.status, task.task_type.clone()))
                .or_default() += 1;
        }
        for ((status, task_type), count) in by_status_type {
            metrics::update_task_gauge(status, &task_type, count);
        }
        metrics::update_queue_depth(tasks.len());

        if let Ok(dlq_tasks) = self.get_dead_letter_tasks().await {
            metrics::update_dlq_depth(dlq_tasks.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryKv;
    use crate::domain::{Payload, TaskPriority};
    use crate::history::MemoryHistory;
    use chrono::Duration;
    use tokio::time::sleep;

    fn engine() -> QueueEngine {
        QueueEngine::new(Arc::new(MemoryKv::new()), None)
    }

    fn engine_with_history() -> (QueueEngine, Arc<MemoryHistory>) {
        let history = Arc::new(MemoryHistory::new());
        let engine = QueueEngine::new(
            Arc::new(MemoryKv::new()),
            Some(history.clone() as Arc<dyn HistoryStore>),
        );
        (engine, history)
    }

    fn task(task_type: &str, priority: TaskPriority) -> Task {
        Task::new(task_type, Payload::new(), priority)
    }

    #[tokio::test]
    async fn enqueue_and_dequeue_round_trip() {
        let q = engine();
        let original = task("test_task", TaskPriority::Medium);
        q.enqueue(&original).await.unwrap();

        let dequeued = q.dequeue().await.unwrap().expect("task expected");
        assert_eq!(dequeued.id, original.id);
        assert_eq!(dequeued.task_type, original.task_type);
        assert_eq!(dequeued.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn dequeue_empty_queue_returns_none() {
        let q = engine();
        assert!(q.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn priority_ordering() {
        let q = engine();
        q.enqueue(&task("low", TaskPriority::Low)).await.unwrap();
        q.enqueue(&task("medium", TaskPriority::Medium))
            .await
            .unwrap();
        q.enqueue(&task("high", TaskPriority::High)).await.unwrap();

        let first = q.dequeue().await.unwrap().unwrap();
        let second = q.dequeue().await.unwrap().unwrap();
        let third = q.dequeue().await.unwrap().unwrap();

        assert_eq!(first.task_type, "high");
        assert_eq!(second.task_type, "medium");
        assert_eq!(third.task_type, "low");
    }

    #[tokio::test]
    async fn same_priority_preserves_enqueue_order() {
        let q = engine();
        let a = task("a", TaskPriority::Medium);
        let b = task("b", TaskPriority::Medium);
        q.enqueue(&a).await.unwrap();
        q.enqueue(&b).await.unwrap();

        assert_eq!(q.dequeue().await.unwrap().unwrap().id, a.id);
        assert_eq!(q.dequeue().await.unwrap().unwrap().id, b.id);
    }

    #[tokio::test]
    async fn scheduled_tasks_stay_invisible_until_due() {
        let q = engine();

        let mut future = task("future", TaskPriority::Low);
        future.scheduled_at = Utc::now() + Duration::milliseconds(80);
        let now_task = task("now", TaskPriority::Medium);

        q.enqueue(&now_task).await.unwrap();
        q.enqueue(&future).await.unwrap();

        assert_eq!(q.dequeue().await.unwrap().unwrap().task_type, "now");
        assert!(
            q.dequeue().await.unwrap().is_none(),
            "future task must not be handed out early"
        );

        // Still visible to inspection while waiting.
        assert_eq!(q.get_task(&future.id).await.unwrap().task_type, "future");

        sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(q.dequeue().await.unwrap().unwrap().task_type, "future");
    }

    #[tokio::test]
    async fn enqueue_records_history_snapshot() {
        let (q, history) = engine_with_history();
        let t = task("test_task", TaskPriority::Medium);
        q.enqueue(&t).await.unwrap();

        assert_eq!(history.save_task_call_count().await, 1);
        assert!(history.was_task_saved(&t.id).await);
        assert_eq!(
            history.task_status(&t.id).await,
            Some(TaskStatus::Pending)
        );
    }

    #[tokio::test]
    async fn dequeue_marks_running_in_history() {
        let (q, history) = engine_with_history();
        let t = task("test_task", TaskPriority::Medium);
        q.enqueue(&t).await.unwrap();

        q.dequeue().await.unwrap().unwrap();
        assert_eq!(history.update_status_call_count().await, 1);
        assert_eq!(
            history.task_status(&t.id).await,
            Some(TaskStatus::Running)
        );
    }

    #[tokio::test]
    async fn history_failures_never_block_task_progress() {
        let (q, history) = engine_with_history();
        history.fail_next_writes(true).await;

        let t = task("test_task", TaskPriority::Medium);
        q.enqueue(&t).await.unwrap();
        assert_eq!(q.get_task(&t.id).await.unwrap().id, t.id);

        let dequeued = q.dequeue().await.unwrap();
        assert_eq!(dequeued.unwrap().id, t.id);
    }

    #[tokio::test]
    async fn cancel_pending_task_skips_dispatch() {
        let q = engine();
        let t = task("test_task", TaskPriority::Medium);
        q.enqueue(&t).await.unwrap();

        q.cancel_task(&t.id).await.unwrap();

        let cancelled = q.get_task(&t.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
        assert!(q.is_cancelled(&t.id).await.unwrap());

        assert!(
            q.dequeue().await.unwrap().is_none(),
            "cancelled task must never reach a worker"
        );
    }

    #[tokio::test]
    async fn cancel_is_rejected_on_terminal_status() {
        let q = engine();
        let t = task("test_task", TaskPriority::Medium);
        q.enqueue(&t).await.unwrap();
        q.cancel_task(&t.id).await.unwrap();

        match q.cancel_task(&t.id).await {
            Err(Error::CannotCancel { status, .. }) => {
                assert_eq!(status, TaskStatus::Cancelled)
            }
            other => panic!("expected CannotCancel, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_unknown_task_is_not_found() {
        let q = engine();
        assert!(matches!(
            q.cancel_task("missing").await,
            Err(Error::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_task_persists_status() {
        let q = engine();
        let mut t = task("test_task", TaskPriority::Medium);
        q.enqueue(&t).await.unwrap();

        t.status = TaskStatus::Completed;
        q.update_task(&t).await.unwrap();

        assert_eq!(
            q.get_task(&t.id).await.unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn get_task_not_found() {
        let q = engine();
        assert!(matches!(
            q.get_task("non-existent-id").await,
            Err(Error::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn get_all_tasks_lists_everything() {
        let q = engine();
        for name in ["task1", "task2", "task3"] {
            q.enqueue(&task(name, TaskPriority::Medium)).await.unwrap();
        }

        assert_eq!(q.get_all_tasks().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn get_all_tasks_empty_is_empty_not_error() {
        let q = engine();
        assert!(q.get_all_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dead_letter_round_trip() {
        let (q, history) = engine_with_history();
        let mut t = task("test_task", TaskPriority::Medium);
        t.retry_count = 3;
        t.status = TaskStatus::Failed;
        q.enqueue(&t).await.unwrap();

        q.move_to_dead_letter(&mut t, "max retries exceeded")
            .await
            .unwrap();
        assert_eq!(t.status, TaskStatus::DeadLetter);
        assert!(t.moved_to_dlq_at.is_some());
        assert_eq!(history.dlq_calls().await.len(), 1);

        let in_dlq = q.get_dead_letter_task(&t.id).await.unwrap();
        assert_eq!(in_dlq.failure_reason, "max retries exceeded");

        let stats = q.dead_letter_stats().await.unwrap();
        assert_eq!(stats.total_tasks, 1);
        assert!(stats.oldest.is_some());

        // Resurrect: clean retry state, back to pending, gone from the DLQ.
        q.retry_dead_letter(&t.id).await.unwrap();

        let revived = q.get_task(&t.id).await.unwrap();
        assert_eq!(revived.status, TaskStatus::Pending);
        assert_eq!(revived.retry_count, 0);
        assert!(revived.failure_reason.is_empty());
        assert!(revived.moved_to_dlq_at.is_none());

        assert!(q.get_dead_letter_task(&t.id).await.is_err());
        assert!(q.get_dead_letter_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_dead_letter_unknown_task_fails() {
        let q = engine();
        assert!(matches!(
            q.retry_dead_letter("missing").await,
            Err(Error::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn purge_dead_letter_is_idempotent() {
        let q = engine();
        q.purge_dead_letter("never-existed").await.unwrap();

        let mut t = task("test_task", TaskPriority::Medium);
        q.move_to_dead_letter(&mut t, "boom").await.unwrap();
        q.purge_dead_letter(&t.id).await.unwrap();
        q.purge_dead_letter(&t.id).await.unwrap();

        assert!(q.get_dead_letter_task(&t.id).await.is_err());
    }

    #[tokio::test]
    async fn complete_and_fail_record_history_rows() {
        let (q, history) = engine_with_history();
        let t = task("test_task", TaskPriority::Medium);
        q.enqueue(&t).await.unwrap();

        q.complete_task(&t, 250).await.unwrap();
        assert_eq!(history.complete_calls().await, vec![(t.id.clone(), 250)]);

        q.fail_task(&t, "connection timeout", 1500).await.unwrap();
        let fails = history.fail_calls().await;
        assert_eq!(
            fails,
            vec![(t.id.clone(), "connection timeout".to_string(), 1500)]
        );

        q.increment_retry_count(&t.id).await.unwrap();
        assert_eq!(history.increment_retry_calls().await, vec![t.id.clone()]);
    }

    #[tokio::test]
    async fn history_calls_are_noops_without_a_store() {
        let q = engine();
        let t = task("test_task", TaskPriority::Medium);
        q.enqueue(&t).await.unwrap();

        q.complete_task(&t, 100).await.unwrap();
        q.fail_task(&t, "error", 100).await.unwrap();
        q.increment_retry_count(&t.id).await.unwrap();
        q.log_execution(&t.id, 1, TaskStatus::Running, 100, "", "worker-1")
            .await
            .unwrap();
    }
}
