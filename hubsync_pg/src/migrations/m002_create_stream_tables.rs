//! Migration 002: the durable stream and its checkpoints.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Migration, MigrationError};

/// Creates the stream entry log and the checkpoint table shared by consumers and
/// subscribers.
pub struct CreateStreamTables;

#[async_trait]
impl Migration for CreateStreamTables {
    fn version(&self) -> i64 {
        2
    }

    fn name(&self) -> &'static str {
        "create_stream_tables"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        // Entry ids come from one sequence, so they increase within every stream key.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hubsync_stream_entries (
                id BIGSERIAL PRIMARY KEY,
                stream_key VARCHAR(255) NOT NULL,
                hub_event_id BIGINT NOT NULL,
                event JSONB NOT NULL,
                appended_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_hubsync_stream_entries_key
            ON hubsync_stream_entries(stream_key, id)
            "#,
        )
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hubsync_checkpoints (
                consumer_id VARCHAR(255) PRIMARY KEY,
                entry_id BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
