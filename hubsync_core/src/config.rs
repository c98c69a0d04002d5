//! Configuration for the sync components.

use std::time::Duration;

use crate::checkpoint::CheckpointMode;
use crate::message::MessageKind;
use crate::retry::Backoff;
use crate::shard::ShardConfig;

/// Default prefix of the durable stream keys. The shard key is appended to it.
pub const DEFAULT_STREAM_PREFIX: &str = "hub:events";

/// Settings for talking to the Hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Applied to every Hub call and to every item of a Hub stream.
    pub rpc_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration for the [`HubSubscriber`](crate::subscriber::HubSubscriber).
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub shard: ShardConfig,
    pub stream_prefix: String,
    /// Delay between reconnection attempts after the subscription fails or closes.
    pub reconnect: Backoff,
    /// Delay between attempts to append an event to the stream.
    pub append_retry: Backoff,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            shard: ShardConfig::unsharded(),
            stream_prefix: DEFAULT_STREAM_PREFIX.to_string(),
            reconnect: Backoff::new(Duration::from_secs(1), Duration::from_secs(60)),
            append_retry: Backoff::new(Duration::from_millis(100), Duration::from_secs(30)),
        }
    }
}

impl SubscriberConfig {
    pub fn for_shard(shard: ShardConfig) -> Self {
        Self {
            shard,
            ..Default::default()
        }
    }
}

/// Configuration for the [`StreamConsumer`](crate::consumer::StreamConsumer).
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Consumer group name. Together with the shard key it names the checkpoint.
    pub group: String,
    pub shard: ShardConfig,
    pub stream_prefix: String,
    /// Maximum number of entries read per round trip.
    pub batch_size: usize,
    /// How long to wait before reading again when the stream is drained.
    pub poll_interval: Duration,
    /// Delay between attempts to handle a failing entry, and between failed reads.
    pub retry: Backoff,
    pub checkpoint_mode: CheckpointMode,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group: "hubsync".to_string(),
            shard: ShardConfig::unsharded(),
            stream_prefix: DEFAULT_STREAM_PREFIX.to_string(),
            batch_size: 100,
            poll_interval: Duration::from_millis(250),
            retry: Backoff::new(Duration::from_secs(1), Duration::from_secs(60)),
            checkpoint_mode: CheckpointMode::Synchronous,
        }
    }
}

impl ConsumerConfig {
    pub fn for_shard(shard: ShardConfig) -> Self {
        Self {
            shard,
            ..Default::default()
        }
    }
}

/// Configuration for message reconciliation.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Message kinds compared for every fid, in order.
    pub kinds: Vec<MessageKind>,
    /// Page size of paginated Hub queries.
    pub page_size: u32,
    /// Use the Hub's streaming query instead of paginating.
    pub use_streaming: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            kinds: MessageKind::ALL.to_vec(),
            page_size: 1000,
            use_streaming: false,
        }
    }
}

/// Configuration for the backfill orchestrator and its worker pool.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Number of fids per reconciliation task.
    pub batch_size: u64,
    /// Maximum number of tasks processed at once by a worker.
    pub concurrency: usize,
    /// Upper bound of the fid space. Taken from the Hub when unset.
    pub max_fid: Option<u64>,
    /// How long an idle worker waits before polling the queue again.
    pub poll_interval: Duration,
    /// Also reconcile username proofs for every fid.
    pub include_username_proofs: bool,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            concurrency: 4,
            max_fid: None,
            poll_interval: Duration::from_secs(1),
            include_username_proofs: false,
        }
    }
}
