use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use hubsync_core::onchain::OnChainEventKey;
use hubsync_core::prelude::*;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::InMemoryError;

#[derive(Debug, Clone, Default)]
struct StoreData {
    hub_events: BTreeSet<u64>,
    messages: BTreeMap<(u64, MessageHash), StoredMessage>,
    onchain_events: HashMap<OnChainEventKey, OnChainEvent>,
    username_proofs: Vec<StoredUsernameProof>,
    failing_hashes: HashSet<MessageHash>,
    unavailable: bool,
}

/// An in-memory [`SyncStore`].
///
/// Transactions are serialised: a transaction holds the store lock until it commits or
/// rolls back, and dropping it uncommitted rolls it back.
#[derive(Debug, Clone, Default)]
pub struct InMemorySyncStore {
    data: Arc<Mutex<StoreData>>,
}

impl InMemorySyncStore {
    pub fn new() -> Self {
        log::debug!("Creating a new InMemorySyncStore");
        Self::default()
    }

    pub async fn hub_event_ids(&self) -> Vec<u64> {
        self.data.lock().await.hub_events.iter().copied().collect()
    }

    pub async fn message(&self, fid: u64, hash: &MessageHash) -> Option<StoredMessage> {
        self.data
            .lock()
            .await
            .messages
            .get(&(fid, hash.clone()))
            .cloned()
    }

    pub async fn messages(&self) -> Vec<StoredMessage> {
        self.data.lock().await.messages.values().cloned().collect()
    }

    pub async fn onchain_events(&self) -> Vec<OnChainEvent> {
        self.data
            .lock()
            .await
            .onchain_events
            .values()
            .cloned()
            .collect()
    }

    pub async fn username_proofs(&self) -> Vec<StoredUsernameProof> {
        self.data.lock().await.username_proofs.clone()
    }

    /// Inserts a message row directly, bypassing the processor.
    pub async fn seed_message(&self, stored: StoredMessage) {
        let key = (stored.message.fid, stored.message.hash.clone());
        self.data.lock().await.messages.insert(key, stored);
    }

    /// Inserts a username proof row directly. Unlike a merge this allows several rows per
    /// `(name, fid)`.
    pub async fn seed_username_proof(&self, stored: StoredUsernameProof) {
        self.data.lock().await.username_proofs.push(stored);
    }

    /// Makes every write of the message with `hash` fail.
    pub async fn fail_writes_of(&self, hash: MessageHash) {
        self.data.lock().await.failing_hashes.insert(hash);
    }

    pub async fn clear_failures(&self) {
        self.data.lock().await.failing_hashes.clear();
    }

    /// When unavailable, `begin` and reads fail like an unreachable database.
    pub async fn set_available(&self, available: bool) {
        self.data.lock().await.unavailable = !available;
    }

    fn check(data: &StoreData) -> Result<(), SyncError> {
        if data.unavailable {
            Err(SyncError::store_unavailable(InMemoryError::Unavailable(
                "store",
            )))
        } else {
            Ok(())
        }
    }
}

/// A transaction over an [`InMemorySyncStore`].
pub struct InMemoryTransaction {
    data: OwnedMutexGuard<StoreData>,
    /// State at `begin`, restored on rollback. `None` once committed.
    snapshot: Option<StoreData>,
}

impl InMemoryTransaction {
    fn check_writable(&self, hash: &MessageHash) -> Result<(), SyncError> {
        if self.data.failing_hashes.contains(hash) {
            return Err(SyncError::store(InMemoryError::Injected(format!(
                "writes of message {} fail",
                hash
            ))));
        }
        Ok(())
    }

    fn proof_row(&mut self, proof: &UserNameProof) -> Option<&mut StoredUsernameProof> {
        self.data
            .username_proofs
            .iter_mut()
            .find(|row| row.proof.name == proof.name && row.proof.fid == proof.fid)
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.data = snapshot;
        }
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn record_hub_event(&mut self, event: &HubEvent) -> Result<bool, SyncError> {
        Ok(self.data.hub_events.insert(event.id))
    }

    async fn merge_message(&mut self, message: &Message) -> Result<bool, SyncError> {
        self.check_writable(&message.hash)?;
        let key = (message.fid, message.hash.clone());
        if self.data.messages.contains_key(&key) {
            return Ok(false);
        }
        self.data
            .messages
            .insert(key, StoredMessage::created(message.clone()));
        Ok(true)
    }

    async fn delete_message(
        &mut self,
        message: &Message,
        reason: DeleteReason,
    ) -> Result<bool, SyncError> {
        self.check_writable(&message.hash)?;
        let stored = self
            .data
            .messages
            .entry((message.fid, message.hash.clone()))
            .or_insert_with(|| StoredMessage::created(message.clone()));
        Ok(stored.mark_deleted(reason, Utc::now()))
    }

    async fn insert_onchain_event(&mut self, event: &OnChainEvent) -> Result<bool, SyncError> {
        let key = event.key();
        if self.data.onchain_events.contains_key(&key) {
            return Ok(false);
        }
        self.data.onchain_events.insert(key, event.clone());
        Ok(true)
    }

    async fn merge_username_proof(&mut self, proof: &UserNameProof) -> Result<bool, SyncError> {
        match self.proof_row(proof) {
            Some(row) => {
                if row.proof.timestamp > proof.timestamp
                    || (row.proof == *proof && row.deleted_at.is_none())
                {
                    return Ok(false);
                }
                *row = StoredUsernameProof::live(proof.clone());
                Ok(true)
            }
            None => {
                self.data
                    .username_proofs
                    .push(StoredUsernameProof::live(proof.clone()));
                Ok(true)
            }
        }
    }

    async fn delete_username_proof(&mut self, proof: &UserNameProof) -> Result<bool, SyncError> {
        match self.proof_row(proof) {
            Some(row) if row.deleted_at.is_none() => {
                row.deleted_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn commit(mut self) -> Result<(), SyncError> {
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), SyncError> {
        if let Some(snapshot) = self.snapshot.take() {
            *self.data = snapshot;
        }
        Ok(())
    }
}

#[async_trait]
impl SyncStore for InMemorySyncStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction, SyncError> {
        let data = self.data.clone().lock_owned().await;
        Self::check(&data)?;
        let snapshot = Some(data.clone());
        Ok(InMemoryTransaction { data, snapshot })
    }

    async fn get_messages_by_fid(
        &self,
        fid: u64,
        types: &[MessageType],
    ) -> Result<Vec<StoredMessage>, SyncError> {
        let data = self.data.lock().await;
        Self::check(&data)?;
        Ok(data
            .messages
            .range((fid, MessageHash::from(Vec::new()))..)
            .take_while(|((row_fid, _), _)| *row_fid == fid)
            .filter(|(_, stored)| types.contains(&stored.message.message_type))
            .map(|(_, stored)| stored.clone())
            .collect())
    }

    async fn get_username_proofs_by_fid(
        &self,
        fid: u64,
        query: &ProofQuery,
    ) -> Result<Vec<StoredUsernameProof>, SyncError> {
        let data = self.data.lock().await;
        Self::check(&data)?;
        Ok(data
            .username_proofs
            .iter()
            .filter(|row| {
                row.proof.fid == fid && row.deleted_at.is_none() && query.matches(&row.proof)
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cast(fid: u64, hash: u8) -> Message {
        Message {
            hash: MessageHash::from(vec![hash]),
            fid,
            message_type: MessageType::CastAdd,
            timestamp: 1,
            body: Default::default(),
        }
    }

    #[tokio::test]
    async fn uncommitted_transactions_roll_back_on_drop() {
        let store = InMemorySyncStore::new();
        {
            let mut txn = store.begin().await.unwrap();
            assert!(txn.merge_message(&cast(1, 1)).await.unwrap());
        }
        assert!(store.messages().await.is_empty());
    }

    #[tokio::test]
    async fn committed_writes_are_visible() {
        let store = InMemorySyncStore::new();
        let mut txn = store.begin().await.unwrap();
        txn.merge_message(&cast(1, 1)).await.unwrap();
        txn.commit().await.unwrap();
        assert_eq!(store.messages().await.len(), 1);
    }

    #[tokio::test]
    async fn merge_never_clears_a_delete() {
        let store = InMemorySyncStore::new();
        let mut txn = store.begin().await.unwrap();
        assert!(
            txn.delete_message(&cast(1, 1), DeleteReason::Revoked)
                .await
                .unwrap()
        );
        assert!(!txn.merge_message(&cast(1, 1)).await.unwrap());
        txn.commit().await.unwrap();

        let stored = store.message(1, &cast(1, 1).hash).await.unwrap();
        assert_eq!(stored.state(), MessageState::Deleted);
        assert!(stored.revoked_at.is_some());
    }

    #[tokio::test]
    async fn messages_are_scoped_to_fid_and_type() {
        let store = InMemorySyncStore::new();
        store.seed_message(StoredMessage::created(cast(1, 1))).await;
        store.seed_message(StoredMessage::created(cast(2, 2))).await;
        let mut reaction = cast(1, 3);
        reaction.message_type = MessageType::ReactionAdd;
        store.seed_message(StoredMessage::created(reaction)).await;

        let casts = store
            .get_messages_by_fid(1, MessageKind::Casts.message_types())
            .await
            .unwrap();
        assert_eq!(casts.len(), 1);
        assert_eq!(casts[0].message.hash, cast(1, 1).hash);
    }

    #[tokio::test]
    async fn older_username_proofs_do_not_overwrite_newer_ones() {
        let store = InMemorySyncStore::new();
        let proof = |timestamp| UserNameProof {
            name: "dan".into(),
            fid: 5,
            owner: HexBytes(vec![1]),
            proof_type: UserNameType::Fname,
            timestamp,
            signature: HexBytes::default(),
        };
        let mut txn = store.begin().await.unwrap();
        assert!(txn.merge_username_proof(&proof(20)).await.unwrap());
        assert!(!txn.merge_username_proof(&proof(10)).await.unwrap());
        assert!(!txn.merge_username_proof(&proof(20)).await.unwrap());
        assert!(txn.merge_username_proof(&proof(30)).await.unwrap());
        assert!(txn.delete_username_proof(&proof(30)).await.unwrap());
        assert!(!txn.delete_username_proof(&proof(30)).await.unwrap());
        txn.commit().await.unwrap();

        let rows = store.username_proofs().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].proof.timestamp, 30);
        assert!(rows[0].deleted_at.is_some());
    }
}
