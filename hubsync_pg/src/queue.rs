//! A task queue backed by a Postgres table.

use std::time::Duration;

use async_trait::async_trait;
use hubsync_core::prelude::*;
use hubsync_core::queue::NackDecision;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::{PgSyncError, queue_err};

/// Postgres based [`TaskQueue`].
///
/// Tasks are leased with `FOR UPDATE SKIP LOCKED`, so any number of workers may share the
/// table. A leased task stays leased until it is acked or nacked; see
/// [`PgTaskQueue::requeue_stale`] for tasks whose worker died.
#[derive(Clone, Debug)]
pub struct PgTaskQueue {
    postgres: PgPool,
    config: TaskQueueConfig,
}

#[derive(Debug, FromRow)]
struct PgDBTask {
    id: Uuid,
    task: serde_json::Value,
    attempts: i32,
}

impl PgTaskQueue {
    /// Creates a new `PgTaskQueue`. Run the [`crate::Migrator`] first.
    pub fn new(postgres: PgPool, config: TaskQueueConfig) -> Self {
        log::debug!("Creating a new PgTaskQueue");
        Self { postgres, config }
    }

    /// Number of tasks in `state` (`ready`, `leased`, `done` or `dead`).
    pub async fn count(&self, state: &str) -> Result<i64, SyncError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM hubsync_tasks WHERE state = $1")
                .bind(state)
                .fetch_one(&self.postgres)
                .await
                .map_err(queue_err)?;
        Ok(count)
    }

    /// Returns tasks leased for longer than `older_than` to the ready state.
    pub async fn requeue_stale(&self, older_than: Duration) -> Result<u64, SyncError> {
        let result = sqlx::query(
            r#"
            UPDATE hubsync_tasks
            SET state = 'ready', updated_at = NOW()
            WHERE state = 'leased' AND updated_at <= NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.postgres)
        .await
        .map_err(queue_err)?;
        if result.rows_affected() > 0 {
            log::info!("Requeued {} stale backfill tasks", result.rows_affected());
        }
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, task: BackfillTask) -> Result<Uuid, SyncError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO hubsync_tasks (id, task)
            VALUES ($1, $2)
            "#,
        )
        .bind(id)
        .bind(serde_json::to_value(&task)?)
        .execute(&self.postgres)
        .await
        .map_err(queue_err)?;
        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<QueuedTask>, SyncError> {
        let row = sqlx::query_as::<_, PgDBTask>(
            r#"
            UPDATE hubsync_tasks
            SET state = 'leased', updated_at = NOW()
            WHERE id = (
                SELECT id FROM hubsync_tasks
                WHERE state = 'ready' AND run_at <= NOW()
                ORDER BY seq ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, task, attempts
            "#,
        )
        .fetch_optional(&self.postgres)
        .await
        .map_err(queue_err)?;

        match row {
            Some(row) => Ok(Some(QueuedTask {
                id: row.id,
                task: serde_json::from_value(row.task)?,
                attempts: row.attempts.max(0) as u32,
            })),
            None => Ok(None),
        }
    }

    async fn ack(&self, id: Uuid) -> Result<(), SyncError> {
        let result = sqlx::query(
            r#"
            UPDATE hubsync_tasks
            SET state = 'done', updated_at = NOW()
            WHERE id = $1 AND state = 'leased'
            "#,
        )
        .bind(id)
        .execute(&self.postgres)
        .await
        .map_err(queue_err)?;
        if result.rows_affected() == 0 {
            return Err(PgSyncError::NotLeased(id).into_queue_error());
        }
        Ok(())
    }

    async fn nack(&self, id: Uuid, error: &str) -> Result<(), SyncError> {
        let mut tx = self.postgres.begin().await.map_err(queue_err)?;
        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT attempts FROM hubsync_tasks
            WHERE id = $1 AND state = 'leased'
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(queue_err)?;
        let Some((attempts,)) = row else {
            return Err(PgSyncError::NotLeased(id).into_queue_error());
        };

        let attempts = attempts.max(0) as u32 + 1;
        match self.config.on_failure(attempts) {
            NackDecision::RetryIn(delay) => {
                sqlx::query(
                    r#"
                    UPDATE hubsync_tasks
                    SET state = 'ready', attempts = $2, last_error = $3,
                        run_at = NOW() + make_interval(secs => $4), updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(attempts as i32)
                .bind(error)
                .bind(delay.as_secs_f64())
                .execute(&mut *tx)
                .await
                .map_err(queue_err)?;
                log::debug!(
                    "Task {} failed (attempt {}), retrying in {:?}",
                    id,
                    attempts,
                    delay
                );
            }
            NackDecision::Dead => {
                sqlx::query(
                    r#"
                    UPDATE hubsync_tasks
                    SET state = 'dead', attempts = $2, last_error = $3, updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(attempts as i32)
                .bind(error)
                .execute(&mut *tx)
                .await
                .map_err(queue_err)?;
                log::warn!(
                    "Task {} failed {} times, giving up: {}",
                    id,
                    attempts,
                    error
                );
            }
        }

        tx.commit().await.map_err(queue_err)?;
        Ok(())
    }
}
