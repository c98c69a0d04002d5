//! A durable stream backed by a Postgres table.

use async_trait::async_trait;
use hubsync_core::prelude::*;
use sqlx::{FromRow, PgPool};

use crate::error::{stream_err, unsigned};

/// Postgres based [`DurableStream`].
///
/// Entries of every stream key share one table and one id sequence, so ids increase within
/// a key but are not contiguous. Checkpoints live in `hubsync_checkpoints`.
#[derive(Clone, Debug)]
pub struct PgDurableStream {
    postgres: PgPool,
}

impl PgDurableStream {
    /// Creates a new `PgDurableStream`. Run the [`crate::Migrator`] first.
    pub fn new(postgres: PgPool) -> Self {
        log::debug!("Creating a new PgDurableStream");
        Self { postgres }
    }

    /// Deletes the entries of `stream_key` at or below `entry_id`. Returns how many went.
    pub async fn trim(&self, stream_key: &str, entry_id: u64) -> Result<u64, SyncError> {
        let result = sqlx::query(
            r#"
            DELETE FROM hubsync_stream_entries
            WHERE stream_key = $1 AND id <= $2
            "#,
        )
        .bind(stream_key)
        .bind(entry_id as i64)
        .execute(&self.postgres)
        .await
        .map_err(stream_err)?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, FromRow)]
struct PgDBStreamEntry {
    id: i64,
    event: serde_json::Value,
}

#[async_trait]
impl DurableStream for PgDurableStream {
    async fn append(&self, stream_key: &str, event: &HubEvent) -> Result<u64, SyncError> {
        let payload = serde_json::to_value(event)?;
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO hubsync_stream_entries (stream_key, hub_event_id, event)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(stream_key)
        .bind(event.id as i64)
        .bind(payload)
        .fetch_one(&self.postgres)
        .await
        .map_err(stream_err)?;
        Ok(unsigned(id, "id")?)
    }

    async fn read_after(
        &self,
        stream_key: &str,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<StreamEntry>, SyncError> {
        let rows = sqlx::query_as::<_, PgDBStreamEntry>(
            r#"
            SELECT id, event
            FROM hubsync_stream_entries
            WHERE stream_key = $1 AND id > $2
            ORDER BY id ASC
            LIMIT $3
            "#,
        )
        .bind(stream_key)
        .bind(after.map_or(0, |after| after as i64))
        .bind(limit as i64)
        .fetch_all(&self.postgres)
        .await
        .map_err(stream_err)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(StreamEntry {
                id: unsigned(row.id, "id")?,
                event: serde_json::from_value(row.event)?,
            });
        }
        Ok(entries)
    }

    async fn get_checkpoint(&self, consumer_id: &str) -> Result<Option<u64>, SyncError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT entry_id FROM hubsync_checkpoints WHERE consumer_id = $1
            "#,
        )
        .bind(consumer_id)
        .fetch_optional(&self.postgres)
        .await
        .map_err(stream_err)?;
        Ok(row.map(|(id,)| unsigned(id, "entry_id")).transpose()?)
    }

    async fn set_checkpoint(&self, consumer_id: &str, entry_id: u64) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO hubsync_checkpoints (consumer_id, entry_id, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (consumer_id) DO UPDATE SET
                entry_id = EXCLUDED.entry_id,
                updated_at = NOW()
            "#,
        )
        .bind(consumer_id)
        .bind(entry_id as i64)
        .execute(&self.postgres)
        .await
        .map_err(stream_err)?;
        Ok(())
    }
}
