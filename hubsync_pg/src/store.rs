//! The Postgres [`SyncStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hubsync_core::prelude::*;
use sqlx::{FromRow, PgPool, Postgres, Transaction};

use crate::error::{PgSyncError, store_err, unsigned};

/// A Postgres based sync store. Every [`StoreTransaction`] is a database transaction.
#[derive(Clone, Debug)]
pub struct PgSyncStore {
    postgres: PgPool,
}

impl PgSyncStore {
    /// Creates a new `PgSyncStore`. Run the [`crate::Migrator`] first.
    pub fn new(postgres: PgPool) -> Self {
        log::debug!("Creating a new PgSyncStore");
        Self { postgres }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.postgres
    }
}

/// Postgres representation of a message row
#[derive(Debug, FromRow)]
struct PgDBMessage {
    fid: i64,
    hash: Vec<u8>,
    message_type: i16,
    timestamp: i64,
    body: serde_json::Value,
    deleted_at: Option<DateTime<Utc>>,
    pruned_at: Option<DateTime<Utc>>,
    revoked_at: Option<DateTime<Utc>>,
}

impl TryFrom<PgDBMessage> for StoredMessage {
    type Error = PgSyncError;

    fn try_from(row: PgDBMessage) -> Result<Self, Self::Error> {
        let message_type =
            MessageType::from_code(row.message_type).ok_or(PgSyncError::UnknownCode {
                kind: "message type",
                code: row.message_type,
            })?;
        Ok(StoredMessage {
            message: Message {
                hash: MessageHash::from(row.hash),
                fid: unsigned(row.fid, "fid")?,
                message_type,
                timestamp: unsigned(row.timestamp, "timestamp")?,
                body: row.body,
            },
            deleted_at: row.deleted_at,
            pruned_at: row.pruned_at,
            revoked_at: row.revoked_at,
        })
    }
}

/// Postgres representation of a username proof row
#[derive(Debug, FromRow)]
struct PgDBUsernameProof {
    name: String,
    fid: i64,
    owner: Vec<u8>,
    proof_type: i16,
    proof_timestamp: i64,
    signature: Vec<u8>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<PgDBUsernameProof> for StoredUsernameProof {
    type Error = PgSyncError;

    fn try_from(row: PgDBUsernameProof) -> Result<Self, Self::Error> {
        let proof_type =
            UserNameType::from_code(row.proof_type).ok_or(PgSyncError::UnknownCode {
                kind: "username proof type",
                code: row.proof_type,
            })?;
        Ok(StoredUsernameProof {
            proof: UserNameProof {
                name: row.name,
                fid: unsigned(row.fid, "fid")?,
                owner: HexBytes(row.owner),
                proof_type,
                timestamp: row.proof_timestamp,
                signature: HexBytes(row.signature),
            },
            deleted_at: row.deleted_at,
        })
    }
}

/// A transaction over a [`PgSyncStore`]. Dropping it uncommitted rolls it back.
pub struct PgStoreTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgStoreTransaction {
    /// The database transaction, for application writes that must commit with the sync
    /// writes.
    pub fn transaction(&mut self) -> &mut Transaction<'static, Postgres> {
        &mut self.tx
    }
}

fn reason_code(reason: DeleteReason) -> i16 {
    match reason {
        DeleteReason::Pruned => 1,
        DeleteReason::Revoked => 2,
        DeleteReason::Displaced => 3,
    }
}

#[async_trait]
impl StoreTransaction for PgStoreTransaction {
    async fn record_hub_event(&mut self, event: &HubEvent) -> Result<bool, SyncError> {
        let result = sqlx::query(
            r#"
            INSERT INTO hubsync_hub_events (id, event_type, fid)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(event.id as i64)
        .bind(event.event_type().code())
        .bind(event.fid().map(|fid| fid as i64))
        .execute(&mut *self.tx)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn merge_message(&mut self, message: &Message) -> Result<bool, SyncError> {
        let result = sqlx::query(
            r#"
            INSERT INTO hubsync_messages (fid, hash, message_type, timestamp, body)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (fid, hash) DO NOTHING
            "#,
        )
        .bind(message.fid as i64)
        .bind(message.hash.as_slice())
        .bind(message.message_type.code())
        .bind(i64::from(message.timestamp))
        .bind(&message.body)
        .execute(&mut *self.tx)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_message(
        &mut self,
        message: &Message,
        reason: DeleteReason,
    ) -> Result<bool, SyncError> {
        let already_deleted: Option<(bool,)> = sqlx::query_as(
            r#"
            SELECT deleted_at IS NOT NULL
            FROM hubsync_messages
            WHERE fid = $1 AND hash = $2
            FOR UPDATE
            "#,
        )
        .bind(message.fid as i64)
        .bind(message.hash.as_slice())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(store_err)?;

        // The reason timestamps are set once; a later delete never moves them.
        sqlx::query(
            r#"
            INSERT INTO hubsync_messages (
                fid, hash, message_type, timestamp, body, deleted_at, pruned_at, revoked_at
            )
            VALUES (
                $1, $2, $3, $4, $5, NOW(),
                CASE WHEN $6 = 1 THEN NOW() END,
                CASE WHEN $6 = 2 THEN NOW() END
            )
            ON CONFLICT (fid, hash) DO UPDATE SET
                deleted_at = COALESCE(hubsync_messages.deleted_at, EXCLUDED.deleted_at),
                pruned_at = COALESCE(hubsync_messages.pruned_at, EXCLUDED.pruned_at),
                revoked_at = COALESCE(hubsync_messages.revoked_at, EXCLUDED.revoked_at)
            "#,
        )
        .bind(message.fid as i64)
        .bind(message.hash.as_slice())
        .bind(message.message_type.code())
        .bind(i64::from(message.timestamp))
        .bind(&message.body)
        .bind(reason_code(reason))
        .execute(&mut *self.tx)
        .await
        .map_err(store_err)?;

        Ok(!matches!(already_deleted, Some((true,))))
    }

    async fn insert_onchain_event(&mut self, event: &OnChainEvent) -> Result<bool, SyncError> {
        let body = serde_json::to_value(&event.body)?;
        let result = sqlx::query(
            r#"
            INSERT INTO hubsync_onchain_events (
                chain_id, tx_hash, log_index, block_number, block_hash, block_timestamp,
                tx_index, fid, event_type, body
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (chain_id, tx_hash, log_index) DO NOTHING
            "#,
        )
        .bind(event.chain_id as i32)
        .bind(event.tx_hash.as_slice())
        .bind(event.log_index as i32)
        .bind(event.block_number as i64)
        .bind(event.block_hash.as_slice())
        .bind(event.block_timestamp as i64)
        .bind(event.tx_index as i32)
        .bind(event.fid as i64)
        .bind(event.event_type().code())
        .bind(body)
        .execute(&mut *self.tx)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn merge_username_proof(&mut self, proof: &UserNameProof) -> Result<bool, SyncError> {
        // An older proof never replaces a newer one, and re-merging the live row is a no-op.
        let result = sqlx::query(
            r#"
            INSERT INTO hubsync_username_proofs (
                name, fid, owner, proof_type, proof_timestamp, signature
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name, fid) DO UPDATE SET
                owner = EXCLUDED.owner,
                proof_type = EXCLUDED.proof_type,
                proof_timestamp = EXCLUDED.proof_timestamp,
                signature = EXCLUDED.signature,
                deleted_at = NULL,
                updated_at = NOW()
            WHERE hubsync_username_proofs.proof_timestamp <= EXCLUDED.proof_timestamp
              AND NOT (
                hubsync_username_proofs.deleted_at IS NULL
                AND hubsync_username_proofs.owner = EXCLUDED.owner
                AND hubsync_username_proofs.proof_type = EXCLUDED.proof_type
                AND hubsync_username_proofs.proof_timestamp = EXCLUDED.proof_timestamp
                AND hubsync_username_proofs.signature = EXCLUDED.signature
              )
            "#,
        )
        .bind(&proof.name)
        .bind(proof.fid as i64)
        .bind(proof.owner.as_slice())
        .bind(proof.proof_type.code())
        .bind(proof.timestamp)
        .bind(proof.signature.as_slice())
        .execute(&mut *self.tx)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_username_proof(&mut self, proof: &UserNameProof) -> Result<bool, SyncError> {
        let result = sqlx::query(
            r#"
            UPDATE hubsync_username_proofs
            SET deleted_at = NOW(), updated_at = NOW()
            WHERE name = $1 AND fid = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(&proof.name)
        .bind(proof.fid as i64)
        .execute(&mut *self.tx)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn commit(self) -> Result<(), SyncError> {
        self.tx.commit().await.map_err(store_err)
    }

    async fn rollback(self) -> Result<(), SyncError> {
        self.tx.rollback().await.map_err(store_err)
    }
}

#[async_trait]
impl SyncStore for PgSyncStore {
    type Transaction = PgStoreTransaction;

    async fn begin(&self) -> Result<Self::Transaction, SyncError> {
        let tx = self.postgres.begin().await.map_err(store_err)?;
        Ok(PgStoreTransaction { tx })
    }

    async fn get_messages_by_fid(
        &self,
        fid: u64,
        types: &[MessageType],
    ) -> Result<Vec<StoredMessage>, SyncError> {
        let codes: Vec<i16> = types.iter().map(|t| t.code()).collect();
        let rows = sqlx::query_as::<_, PgDBMessage>(
            r#"
            SELECT fid, hash, message_type, timestamp, body, deleted_at, pruned_at, revoked_at
            FROM hubsync_messages
            WHERE fid = $1 AND message_type = ANY($2)
            ORDER BY timestamp ASC, hash ASC
            "#,
        )
        .bind(fid as i64)
        .bind(codes)
        .fetch_all(&self.postgres)
        .await
        .map_err(store_err)?;

        rows.into_iter()
            .map(|row| StoredMessage::try_from(row).map_err(SyncError::from))
            .collect()
    }

    async fn get_username_proofs_by_fid(
        &self,
        fid: u64,
        query: &ProofQuery,
    ) -> Result<Vec<StoredUsernameProof>, SyncError> {
        let rows = sqlx::query_as::<_, PgDBUsernameProof>(
            r#"
            SELECT name, fid, owner, proof_type, proof_timestamp, signature, deleted_at
            FROM hubsync_username_proofs
            WHERE fid = $1
              AND proof_type = $2
              AND deleted_at IS NULL
              AND ($3::BIGINT IS NULL OR proof_timestamp >= $3)
              AND ($4::BIGINT IS NULL OR proof_timestamp <= $4)
            ORDER BY proof_timestamp ASC, name ASC
            "#,
        )
        .bind(fid as i64)
        .bind(query.proof_type.code())
        .bind(query.start)
        .bind(query.stop)
        .fetch_all(&self.postgres)
        .await
        .map_err(store_err)?;

        rows.into_iter()
            .map(|row| StoredUsernameProof::try_from(row).map_err(SyncError::from))
            .collect()
    }
}
