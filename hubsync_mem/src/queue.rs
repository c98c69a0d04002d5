use std::sync::Arc;

use async_trait::async_trait;
use hubsync_core::prelude::*;
use hubsync_core::queue::NackDecision;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::InMemoryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Leased,
    Done,
    Dead,
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: Uuid,
    pub task: BackfillTask,
    pub state: TaskState,
    pub attempts: u32,
    pub last_error: Option<String>,
    run_at: Instant,
}

#[derive(Debug, Default)]
struct QueueData {
    tasks: Vec<TaskRecord>,
}

/// An in-memory [`TaskQueue`]. Tasks are leased in enqueue order once their retry delay
/// has passed.
#[derive(Debug, Clone)]
pub struct InMemoryTaskQueue {
    data: Arc<Mutex<QueueData>>,
    config: TaskQueueConfig,
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new(TaskQueueConfig::default())
    }
}

impl InMemoryTaskQueue {
    pub fn new(config: TaskQueueConfig) -> Self {
        log::debug!("Creating a new InMemoryTaskQueue");
        Self {
            data: Arc::new(Mutex::new(QueueData::default())),
            config,
        }
    }

    /// Every task ever enqueued, in enqueue order.
    pub async fn tasks(&self) -> Vec<TaskRecord> {
        self.data.lock().await.tasks.clone()
    }

    pub async fn count(&self, state: TaskState) -> usize {
        self.data
            .lock()
            .await
            .tasks
            .iter()
            .filter(|t| t.state == state)
            .count()
    }

    fn leased(data: &mut QueueData, id: Uuid) -> Result<&mut TaskRecord, SyncError> {
        data.tasks
            .iter_mut()
            .find(|t| t.id == id && t.state == TaskState::Leased)
            .ok_or_else(|| SyncError::queue(InMemoryError::NotLeased(id)))
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: BackfillTask) -> Result<Uuid, SyncError> {
        let id = Uuid::new_v4();
        self.data.lock().await.tasks.push(TaskRecord {
            id,
            task,
            state: TaskState::Ready,
            attempts: 0,
            last_error: None,
            run_at: Instant::now(),
        });
        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<QueuedTask>, SyncError> {
        let mut data = self.data.lock().await;
        let now = Instant::now();
        let next = data
            .tasks
            .iter_mut()
            .find(|t| t.state == TaskState::Ready && t.run_at <= now);
        Ok(next.map(|record| {
            record.state = TaskState::Leased;
            QueuedTask {
                id: record.id,
                task: record.task.clone(),
                attempts: record.attempts,
            }
        }))
    }

    async fn ack(&self, id: Uuid) -> Result<(), SyncError> {
        let mut data = self.data.lock().await;
        Self::leased(&mut data, id)?.state = TaskState::Done;
        Ok(())
    }

    async fn nack(&self, id: Uuid, error: &str) -> Result<(), SyncError> {
        let mut data = self.data.lock().await;
        let record = Self::leased(&mut data, id)?;
        record.attempts += 1;
        record.last_error = Some(error.to_string());
        match self.config.on_failure(record.attempts) {
            NackDecision::RetryIn(delay) => {
                record.state = TaskState::Ready;
                record.run_at = Instant::now() + delay;
                log::debug!(
                    "Task {} failed (attempt {}), retrying in {:?}",
                    id, record.attempts, delay
                );
            }
            NackDecision::Dead => {
                record.state = TaskState::Dead;
                log::warn!(
                    "Task {} failed {} times, giving up: {}",
                    id, record.attempts, error
                );
            }
        }
        Ok(())
    }
}
