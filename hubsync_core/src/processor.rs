//! Turns Hub events into idempotent store writes and application callbacks.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error};

use crate::consumer::{HandlerOutcome, StreamEventHandler};
use crate::error::{BoxError, SyncError};
use crate::event::{HubEvent, HubEventBody};
use crate::message::{DeleteReason, Message, MessageHash, MessageState, StoreMessageOperation};
use crate::onchain::OnChainEvent;
use crate::store::{StoreTransaction, SyncStore};
use crate::username_proof::UserNameProof;

/// A message write, as seen by the application handler.
#[derive(Debug, Clone, Copy)]
pub struct MessageApplied<'a> {
    pub message: &'a Message,
    pub operation: StoreMessageOperation,
    pub state: MessageState,
    /// Whether this call changed the store.
    pub is_new: bool,
    /// Whether the message was found by reconciliation rather than the live stream.
    pub was_missed: bool,
}

/// Application callbacks run inside the same transaction as the store write.
///
/// Returning an error rolls the whole transaction back, bookkeeping included.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync
where
    T: StoreTransaction,
{
    async fn handle_message_merge(
        &self,
        applied: MessageApplied<'_>,
        txn: &mut T,
    ) -> Result<(), BoxError>;

    async fn handle_onchain_event(
        &self,
        _event: &OnChainEvent,
        _is_new: bool,
        _txn: &mut T,
    ) -> Result<(), BoxError> {
        Ok(())
    }

    async fn handle_username_proof(
        &self,
        _proof: &UserNameProof,
        _state: MessageState,
        _is_new: bool,
        _txn: &mut T,
    ) -> Result<(), BoxError> {
        Ok(())
    }
}

/// The outcome of one message write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageOutcome {
    pub fid: u64,
    pub hash: MessageHash,
    pub operation: StoreMessageOperation,
    pub state: MessageState,
    pub is_new: bool,
}

/// The outcome of [`EventProcessor::process_hub_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedEvent {
    pub event_id: u64,
    /// The event had already been recorded by an earlier delivery.
    pub redelivered: bool,
    /// Message writes, displaced messages first.
    pub messages: Vec<MessageOutcome>,
    /// Whether any on-chain or username proof write changed the store.
    pub changed_other: bool,
}

impl ProcessedEvent {
    /// Whether this event changed the store at all.
    pub fn changed(&self) -> bool {
        self.changed_other || self.messages.iter().any(|m| m.is_new)
    }
}

#[derive(Debug, Clone, Copy)]
enum MessageWrite {
    Merge,
    Delete(DeleteReason),
}

impl MessageWrite {
    fn operation(self) -> StoreMessageOperation {
        match self {
            MessageWrite::Merge => StoreMessageOperation::Merge,
            MessageWrite::Delete(_) => StoreMessageOperation::Delete,
        }
    }

    fn state(self) -> MessageState {
        match self {
            MessageWrite::Merge => MessageState::Created,
            MessageWrite::Delete(_) => MessageState::Deleted,
        }
    }
}

/// Applies Hub events to a [`SyncStore`], one transaction per event.
pub struct EventProcessor<S, H>
where
    S: SyncStore,
    H: MessageHandler<S::Transaction>,
{
    store: Arc<S>,
    handler: Arc<H>,
}

impl<S, H> Clone for EventProcessor<S, H>
where
    S: SyncStore,
    H: MessageHandler<S::Transaction>,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<S, H> EventProcessor<S, H>
where
    S: SyncStore,
    H: MessageHandler<S::Transaction>,
{
    pub fn new(store: Arc<S>, handler: Arc<H>) -> Self {
        Self { store, handler }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Applies `event` atomically: bookkeeping, store writes and handler calls either all
    /// commit or all roll back.
    pub async fn process_hub_event(&self, event: &HubEvent) -> Result<ProcessedEvent, SyncError> {
        let mut txn = self.store.begin().await?;
        match self.apply_hub_event(&mut txn, event).await {
            Ok(processed) => {
                txn.commit().await?;
                debug!(
                    "Processed hub event {} ({}){}",
                    event.id,
                    event.event_type(),
                    if processed.redelivered {
                        " [redelivered]"
                    } else {
                        ""
                    }
                );
                Ok(processed)
            }
            Err(e) => {
                if let Err(rollback_err) = txn.rollback().await {
                    error!(
                        "Failed to roll back hub event {}: {}",
                        event.id, rollback_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Applies a message that reconciliation found only on the Hub.
    pub async fn handle_missing_message(
        &self,
        message: &Message,
    ) -> Result<MessageOutcome, SyncError> {
        let mut txn = self.store.begin().await?;
        match self
            .apply_message(&mut txn, message, MessageWrite::Merge, true)
            .await
        {
            Ok(outcome) => {
                txn.commit().await?;
                debug!(
                    "Applied missing message {} for fid {} (new: {})",
                    message.hash, message.fid, outcome.is_new
                );
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback_err) = txn.rollback().await {
                    error!(
                        "Failed to roll back missing message {}: {}",
                        message.hash, rollback_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Applies a username proof that reconciliation found only on the Hub. Returns whether
    /// the store changed.
    pub async fn handle_missing_username_proof(
        &self,
        proof: &UserNameProof,
    ) -> Result<bool, SyncError> {
        let mut txn = self.store.begin().await?;
        let result = async {
            let is_new = txn.merge_username_proof(proof).await?;
            self.handler
                .handle_username_proof(proof, MessageState::Created, is_new, &mut txn)
                .await
                .map_err(SyncError::Handler)?;
            Ok::<bool, SyncError>(is_new)
        }
        .await;
        match result {
            Ok(is_new) => {
                txn.commit().await?;
                Ok(is_new)
            }
            Err(e) => {
                if let Err(rollback_err) = txn.rollback().await {
                    error!(
                        "Failed to roll back missing username proof '{}': {}",
                        proof.name, rollback_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn apply_hub_event(
        &self,
        txn: &mut S::Transaction,
        event: &HubEvent,
    ) -> Result<ProcessedEvent, SyncError> {
        let first_delivery = txn.record_hub_event(event).await?;
        let mut processed = ProcessedEvent {
            event_id: event.id,
            redelivered: !first_delivery,
            messages: Vec::new(),
            changed_other: false,
        };

        match &event.body {
            HubEventBody::MergeMessage {
                message,
                deleted_messages,
            } => {
                for deleted in deleted_messages {
                    let outcome = self
                        .apply_message(txn, deleted, MessageWrite::Delete(DeleteReason::Displaced), false)
                        .await?;
                    processed.messages.push(outcome);
                }
                let outcome = self
                    .apply_message(txn, message, MessageWrite::Merge, false)
                    .await?;
                processed.messages.push(outcome);
            }
            HubEventBody::PruneMessage { message } => {
                let outcome = self
                    .apply_message(txn, message, MessageWrite::Delete(DeleteReason::Pruned), false)
                    .await?;
                processed.messages.push(outcome);
            }
            HubEventBody::RevokeMessage { message } => {
                let outcome = self
                    .apply_message(txn, message, MessageWrite::Delete(DeleteReason::Revoked), false)
                    .await?;
                processed.messages.push(outcome);
            }
            HubEventBody::MergeOnChainEvent { on_chain_event } => {
                let is_new = txn.insert_onchain_event(on_chain_event).await?;
                self.handler
                    .handle_onchain_event(on_chain_event, is_new, txn)
                    .await
                    .map_err(SyncError::Handler)?;
                processed.changed_other = is_new;
            }
            HubEventBody::MergeUsernameProof {
                username_proof,
                deleted_username_proof,
            } => {
                if let Some(deleted) = deleted_username_proof {
                    let is_new = txn.delete_username_proof(deleted).await?;
                    self.handler
                        .handle_username_proof(deleted, MessageState::Deleted, is_new, txn)
                        .await
                        .map_err(SyncError::Handler)?;
                    processed.changed_other |= is_new;
                }
                if let Some(proof) = username_proof {
                    let is_new = txn.merge_username_proof(proof).await?;
                    self.handler
                        .handle_username_proof(proof, MessageState::Created, is_new, txn)
                        .await
                        .map_err(SyncError::Handler)?;
                    processed.changed_other |= is_new;
                }
            }
        }

        Ok(processed)
    }

    async fn apply_message(
        &self,
        txn: &mut S::Transaction,
        message: &Message,
        write: MessageWrite,
        was_missed: bool,
    ) -> Result<MessageOutcome, SyncError> {
        let is_new = match write {
            MessageWrite::Merge => txn.merge_message(message).await?,
            MessageWrite::Delete(reason) => txn.delete_message(message, reason).await?,
        };
        let applied = MessageApplied {
            message,
            operation: write.operation(),
            state: write.state(),
            is_new,
            was_missed,
        };
        self.handler
            .handle_message_merge(applied, txn)
            .await
            .map_err(SyncError::Handler)?;

        Ok(MessageOutcome {
            fid: message.fid,
            hash: message.hash.clone(),
            operation: applied.operation,
            state: applied.state,
            is_new,
        })
    }
}

#[async_trait]
impl<S, H> StreamEventHandler for EventProcessor<S, H>
where
    S: SyncStore + 'static,
    H: MessageHandler<S::Transaction> + 'static,
{
    async fn handle(&self, event: &HubEvent) -> Result<HandlerOutcome, SyncError> {
        self.process_hub_event(event).await?;
        Ok(HandlerOutcome::Applied)
    }
}
