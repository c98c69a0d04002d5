//! The Hub client interface.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::SyncError;
use crate::event::HubEvent;
use crate::message::{Message, MessageKind};
use crate::shard::ShardConfig;
use crate::username_proof::UserNameProof;

/// A live subscription to Hub events.
pub type HubEventStream = BoxStream<'static, Result<HubEvent, SyncError>>;

/// A streamed historical query.
pub type MessageStream = BoxStream<'static, Result<Message, SyncError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeRequest {
    /// First event id to deliver. `None` starts at the live tip.
    pub from_id: Option<u64>,
    pub total_shards: u32,
    pub shard_index: u32,
}

impl SubscribeRequest {
    pub fn new(from_id: Option<u64>, shard: ShardConfig) -> Self {
        Self {
            from_id,
            total_shards: shard.total_shards,
            shard_index: shard.shard_index,
        }
    }

    pub fn shard(&self) -> ShardConfig {
        ShardConfig {
            total_shards: self.total_shards,
            shard_index: self.shard_index,
        }
    }
}

/// Aggregate metadata about the Hub.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubInfo {
    pub version: String,
    /// Highest fid known to the Hub.
    pub max_fid: Option<u64>,
    pub num_messages: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub page_size: u32,
    /// Opaque continuation token from the previous page.
    pub page_token: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagesPage {
    pub messages: Vec<Message>,
    /// `None` or empty when this was the last page.
    pub next_page_token: Option<Vec<u8>>,
}

/// Access to a Hub node.
#[async_trait]
pub trait HubClient: Send + Sync {
    /// Opens a live subscription. The Hub may apply the shard filter itself; callers still
    /// filter client-side.
    async fn subscribe(&self, request: SubscribeRequest) -> Result<HubEventStream, SyncError>;

    async fn get_info(&self) -> Result<HubInfo, SyncError>;

    /// One page of the messages of `kind` held for `fid`.
    async fn get_messages_by_fid(
        &self,
        fid: u64,
        kind: MessageKind,
        page: PageRequest,
    ) -> Result<MessagesPage, SyncError>;

    /// Every message of `kind` held for `fid`, as a stream.
    async fn stream_messages_by_fid(
        &self,
        fid: u64,
        kind: MessageKind,
        page_size: u32,
    ) -> Result<MessageStream, SyncError>;

    async fn get_username_proofs_by_fid(&self, fid: u64) -> Result<Vec<UserNameProof>, SyncError>;
}

/// Runs a Hub call under `timeout`.
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, SyncError>
where
    F: Future<Output = Result<T, SyncError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout(timeout)),
    }
}
