//! Migration 001: the sync store tables.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Migration, MigrationError};

/// Creates the processed-event log and the message, on-chain event and username proof tables.
pub struct CreateSyncTables;

#[async_trait]
impl Migration for CreateSyncTables {
    fn version(&self) -> i64 {
        1
    }

    fn name(&self) -> &'static str {
        "create_sync_tables"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        // One row per Hub event id ever applied. Redelivery detection relies on the key.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hubsync_hub_events (
                id BIGINT PRIMARY KEY,
                event_type SMALLINT NOT NULL,
                fid BIGINT,
                processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hubsync_messages (
                fid BIGINT NOT NULL,
                hash BYTEA NOT NULL,
                message_type SMALLINT NOT NULL,
                timestamp BIGINT NOT NULL,
                body JSONB NOT NULL DEFAULT 'null',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                deleted_at TIMESTAMPTZ,
                pruned_at TIMESTAMPTZ,
                revoked_at TIMESTAMPTZ,
                PRIMARY KEY (fid, hash)
            )
            "#,
        )
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_hubsync_messages_fid_type
            ON hubsync_messages(fid, message_type)
            "#,
        )
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hubsync_onchain_events (
                chain_id INTEGER NOT NULL,
                tx_hash BYTEA NOT NULL,
                log_index INTEGER NOT NULL,
                block_number BIGINT NOT NULL,
                block_hash BYTEA NOT NULL,
                block_timestamp BIGINT NOT NULL,
                tx_index INTEGER NOT NULL,
                fid BIGINT NOT NULL,
                event_type SMALLINT NOT NULL,
                body JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (chain_id, tx_hash, log_index)
            )
            "#,
        )
        .execute(&mut **tx)
        .await?;

        // At most one row per (name, fid); a newer proof replaces the row.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hubsync_username_proofs (
                name TEXT NOT NULL,
                fid BIGINT NOT NULL,
                owner BYTEA NOT NULL,
                proof_type SMALLINT NOT NULL,
                proof_timestamp BIGINT NOT NULL,
                signature BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                deleted_at TIMESTAMPTZ,
                PRIMARY KEY (name, fid)
            )
            "#,
        )
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_hubsync_username_proofs_fid
            ON hubsync_username_proofs(fid, proof_type, proof_timestamp)
            "#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
