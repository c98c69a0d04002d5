//! The durable stream interface.

use async_trait::async_trait;

use crate::error::SyncError;
use crate::event::HubEvent;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    /// Assigned by the stream on append. Strictly increasing within a stream key.
    pub id: u64,
    pub event: HubEvent,
}

/// An ordered, replayable log of Hub events keyed by shard, with a named checkpoint per
/// consumer.
#[async_trait]
pub trait DurableStream: Send + Sync {
    /// Appends `event` under `stream_key`, returning the entry id.
    async fn append(&self, stream_key: &str, event: &HubEvent) -> Result<u64, SyncError>;

    /// Up to `limit` entries with an id strictly greater than `after`, in order.
    async fn read_after(
        &self,
        stream_key: &str,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<StreamEntry>, SyncError>;

    async fn get_checkpoint(&self, consumer_id: &str) -> Result<Option<u64>, SyncError>;

    async fn set_checkpoint(&self, consumer_id: &str, entry_id: u64) -> Result<(), SyncError>;
}

/// Name of a consumer group's checkpoint for a shard.
pub fn consumer_checkpoint_id(group: &str, shard_key: &str) -> String {
    format!("{}:{}", group, shard_key)
}

/// Name under which a subscriber records the last Hub event id it appended.
pub fn subscriber_position_id(shard_key: &str) -> String {
    format!("hub-subscriber:{}", shard_key)
}
