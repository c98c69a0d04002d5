//! Core of the hub sync engine.
//!
//! The pipeline runs Hub → [`subscriber::HubSubscriber`] → [`stream::DurableStream`] →
//! [`consumer::StreamConsumer`] → [`processor::EventProcessor`] → [`store::SyncStore`].
//! Reconciliation and backfill compare the Hub and the store directly.
//!
//! The collaborators (Hub client, durable stream, store, task queue) are traits. In-memory
//! and Postgres implementations live in their own crates.

pub mod backfill;
pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod hub;
mod lifecycle;
pub mod message;
pub mod onchain;
pub mod processor;
pub mod queue;
pub mod reconcile;
pub mod retry;
pub mod shard;
pub mod store;
pub mod stream;
pub mod subscriber;
pub mod username_proof;

pub mod prelude {
    //! The types most applications need.
    pub use crate::backfill::{BackfillPlan, BackfillWorker, Backfiller, BatchReport};
    pub use crate::checkpoint::CheckpointMode;
    pub use crate::config::{
        BackfillConfig, ConsumerConfig, HubConfig, ReconcileConfig, SubscriberConfig,
    };
    pub use crate::consumer::{HandlerOutcome, StreamConsumer, StreamEventHandler};
    pub use crate::error::{BoxError, ErrorKind, SyncError};
    pub use crate::event::{HubEvent, HubEventBody, HubEventType};
    pub use crate::hub::{
        HubClient, HubEventStream, HubInfo, MessageStream, MessagesPage, PageRequest,
        SubscribeRequest,
    };
    pub use crate::message::{
        DeleteReason, HexBytes, Message, MessageHash, MessageKind, MessageState, MessageType,
        StoreMessageOperation, StoredMessage,
    };
    pub use crate::onchain::{OnChainEvent, OnChainEventBody, OnChainEventType};
    pub use crate::processor::{
        EventProcessor, MessageApplied, MessageHandler, MessageOutcome, ProcessedEvent,
    };
    pub use crate::queue::{BackfillTask, QueuedTask, TaskQueue, TaskQueueConfig};
    pub use crate::reconcile::{
        HubMessageDivergence, MessageReconciliation, MessageReconciliationHandler,
        ProofReconciliationOutcome, UsernameProofReconciliation,
        UsernameProofReconciliationHandler,
    };
    pub use crate::retry::Backoff;
    pub use crate::shard::ShardConfig;
    pub use crate::store::{ProofQuery, StoreTransaction, SyncStore};
    pub use crate::stream::{DurableStream, StreamEntry};
    pub use crate::subscriber::HubSubscriber;
    pub use crate::username_proof::{StoredUsernameProof, UserNameProof, UserNameType};
}
