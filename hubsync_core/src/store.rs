//! The relational store interface.
//!
//! Every write happens inside a [`StoreTransaction`]. All write methods are idempotent and
//! report whether they changed the store.

use async_trait::async_trait;

use crate::error::SyncError;
use crate::event::HubEvent;
use crate::message::{DeleteReason, Message, MessageType, StoredMessage};
use crate::onchain::OnChainEvent;
use crate::username_proof::{StoredUsernameProof, UserNameProof, UserNameType};

/// Filter for [`SyncStore::get_username_proofs_by_fid`]. Bounds are inclusive Unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofQuery {
    pub proof_type: UserNameType,
    pub start: Option<i64>,
    pub stop: Option<i64>,
}

impl ProofQuery {
    pub fn all(proof_type: UserNameType) -> Self {
        Self {
            proof_type,
            start: None,
            stop: None,
        }
    }

    pub fn matches(&self, proof: &UserNameProof) -> bool {
        proof.proof_type == self.proof_type
            && self.start.is_none_or(|start| proof.timestamp >= start)
            && self.stop.is_none_or(|stop| proof.timestamp <= stop)
    }
}

/// A unit of work against the store.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Records `event` in the applied-events bookkeeping table. Returns `false` if it was
    /// already recorded, meaning this is a redelivery.
    async fn record_hub_event(&mut self, event: &HubEvent) -> Result<bool, SyncError>;

    /// Inserts the message row if absent. A merge never clears `deleted_at`.
    async fn merge_message(&mut self, message: &Message) -> Result<bool, SyncError>;

    /// Marks the message deleted, inserting the row if it was never seen. Returns `true` if
    /// the row was inserted or `deleted_at` moved from null to set.
    async fn delete_message(
        &mut self,
        message: &Message,
        reason: DeleteReason,
    ) -> Result<bool, SyncError>;

    /// Appends the on-chain event if absent.
    async fn insert_onchain_event(&mut self, event: &OnChainEvent) -> Result<bool, SyncError>;

    /// Upserts the `(name, fid)` row unless the stored proof is newer. Clears `deleted_at`
    /// on overwrite.
    async fn merge_username_proof(&mut self, proof: &UserNameProof) -> Result<bool, SyncError>;

    /// Soft-deletes the `(name, fid)` row.
    async fn delete_username_proof(&mut self, proof: &UserNameProof) -> Result<bool, SyncError>;

    async fn commit(self) -> Result<(), SyncError>;

    async fn rollback(self) -> Result<(), SyncError>;
}

/// The relational store the Hub is synchronised into.
#[async_trait]
pub trait SyncStore: Send + Sync {
    type Transaction: StoreTransaction;

    async fn begin(&self) -> Result<Self::Transaction, SyncError>;

    /// Every message row of `fid` with one of `types`, deleted rows included.
    async fn get_messages_by_fid(
        &self,
        fid: u64,
        types: &[MessageType],
    ) -> Result<Vec<StoredMessage>, SyncError>;

    /// The live username proof rows of `fid` matching `query`.
    async fn get_username_proofs_by_fid(
        &self,
        fid: u64,
        query: &ProofQuery,
    ) -> Result<Vec<StoredUsernameProof>, SyncError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HexBytes;

    fn proof(timestamp: i64, proof_type: UserNameType) -> UserNameProof {
        UserNameProof {
            name: "carol".into(),
            fid: 1,
            owner: HexBytes(vec![1]),
            proof_type,
            timestamp,
            signature: HexBytes::default(),
        }
    }

    #[test]
    fn proof_query_bounds_are_inclusive() {
        let query = ProofQuery {
            proof_type: UserNameType::Fname,
            start: Some(10),
            stop: Some(20),
        };
        assert!(query.matches(&proof(10, UserNameType::Fname)));
        assert!(query.matches(&proof(20, UserNameType::Fname)));
        assert!(!query.matches(&proof(21, UserNameType::Fname)));
        assert!(!query.matches(&proof(15, UserNameType::EnsL1)));
    }

    #[test]
    fn unbounded_query_matches_every_proof_of_its_type() {
        let query = ProofQuery::all(UserNameType::EnsL1);
        assert!(query.matches(&proof(i64::MIN, UserNameType::EnsL1)));
        assert!(query.matches(&proof(i64::MAX, UserNameType::EnsL1)));
    }
}
