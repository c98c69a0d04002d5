//! Migration 003: the backfill task queue.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Migration, MigrationError};

pub struct CreateTaskQueue;

#[async_trait]
impl Migration for CreateTaskQueue {
    fn version(&self) -> i64 {
        3
    }

    fn name(&self) -> &'static str {
        "create_task_queue"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hubsync_tasks (
                id UUID PRIMARY KEY,
                seq BIGSERIAL NOT NULL,
                task JSONB NOT NULL,
                state VARCHAR(16) NOT NULL DEFAULT 'ready',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                run_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_hubsync_tasks_ready
            ON hubsync_tasks(run_at, seq)
            WHERE state = 'ready'
            "#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
