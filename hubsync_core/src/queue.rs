//! The persistent task queue interface and the backfill task payloads.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;
use crate::retry::Backoff;

/// A set of fids reconciled by one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationBatch {
    pub fids: Vec<u64>,
}

/// Enqueued after the last batch of a full backfill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum BackfillTask {
    Reconcile(ReconciliationBatch),
    Complete(CompletionMarker),
}

impl BackfillTask {
    pub fn reconcile(fids: Vec<u64>) -> Self {
        Self::Reconcile(ReconciliationBatch { fids })
    }

    /// The task name stored next to the payload.
    pub fn name(&self) -> &'static str {
        match self {
            BackfillTask::Reconcile(_) => "reconcile",
            BackfillTask::Complete(_) => "complete",
        }
    }
}

/// A task leased from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub id: Uuid,
    pub task: BackfillTask,
    /// Number of earlier failed attempts.
    pub attempts: u32,
}

/// What happens to a task when it is nacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskQueueConfig {
    /// Attempts after which a failing task is moved to the dead state.
    pub max_attempts: u32,
    pub retry: Backoff,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry: Backoff::new(Duration::from_secs(5), Duration::from_secs(300)),
        }
    }
}

/// The retry decision for a nacked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackDecision {
    RetryIn(Duration),
    Dead,
}

impl TaskQueueConfig {
    /// Decides the fate of a task that has now failed `attempts` times.
    pub fn on_failure(&self, attempts: u32) -> NackDecision {
        if attempts >= self.max_attempts {
            NackDecision::Dead
        } else {
            NackDecision::RetryIn(self.retry.delay(attempts.saturating_sub(1)))
        }
    }
}

/// A persistent queue of backfill tasks with at-least-once leasing.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: BackfillTask) -> Result<Uuid, SyncError>;

    /// Leases the oldest ready task, if any.
    async fn dequeue(&self) -> Result<Option<QueuedTask>, SyncError>;

    /// Marks a leased task done.
    async fn ack(&self, id: Uuid) -> Result<(), SyncError>;

    /// Marks a leased task failed. The queue's retry policy decides whether it runs again.
    async fn nack(&self, id: Uuid, error: &str) -> Result<(), SyncError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_serialize_with_a_tag() {
        let json = serde_json::to_value(BackfillTask::reconcile(vec![1, 2])).unwrap();
        assert_eq!(json, serde_json::json!({ "task": "reconcile", "fids": [1, 2] }));

        let back: BackfillTask = serde_json::from_value(json).unwrap();
        assert_eq!(back.name(), "reconcile");
    }

    #[test]
    fn failing_tasks_die_after_max_attempts() {
        let config = TaskQueueConfig {
            max_attempts: 3,
            retry: Backoff::new(Duration::from_secs(1), Duration::from_secs(10)),
        };
        assert!(matches!(config.on_failure(1), NackDecision::RetryIn(_)));
        assert!(matches!(config.on_failure(2), NackDecision::RetryIn(_)));
        assert_eq!(config.on_failure(3), NackDecision::Dead);
    }

    #[test]
    fn retry_delay_grows_with_attempts() {
        let config = TaskQueueConfig {
            max_attempts: 10,
            retry: Backoff::new(Duration::from_millis(100), Duration::from_secs(10)),
        };
        let NackDecision::RetryIn(first) = config.on_failure(1) else {
            panic!("expected a retry");
        };
        let NackDecision::RetryIn(third) = config.on_failure(3) else {
            panic!("expected a retry");
        };
        assert!(first <= Duration::from_millis(110));
        assert!(third >= Duration::from_millis(360));
    }
}
