#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hubsync_core::prelude::*;
use hubsync_mem::InMemoryTransaction;
use tokio::sync::Mutex;

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn message(fid: u64, hash: u8, message_type: MessageType) -> Message {
    Message {
        hash: MessageHash::from(vec![fid as u8, hash]),
        fid,
        message_type,
        timestamp: 1_000 + hash as u32,
        body: serde_json::json!({ "n": hash }),
    }
}

pub fn cast(fid: u64, hash: u8) -> Message {
    message(fid, hash, MessageType::CastAdd)
}

pub fn merge(message: Message) -> HubEventBody {
    HubEventBody::MergeMessage {
        message,
        deleted_messages: vec![],
    }
}

pub fn proof(name: &str, fid: u64, timestamp: i64) -> UserNameProof {
    UserNameProof {
        name: name.to_string(),
        fid,
        owner: HexBytes(vec![0xab; 20]),
        proof_type: UserNameType::Fname,
        timestamp,
        signature: HexBytes(vec![0x01]),
    }
}

/// A message write observed by [`RecordingHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenWrite {
    pub hash: MessageHash,
    pub operation: StoreMessageOperation,
    pub state: MessageState,
    pub is_new: bool,
    pub was_missed: bool,
}

/// Records every callback and optionally fails on a given hash.
#[derive(Default)]
pub struct RecordingHandler {
    pub writes: Mutex<Vec<SeenWrite>>,
    pub proofs: Mutex<Vec<(String, MessageState, bool)>>,
    pub onchain: Mutex<Vec<bool>>,
    pub fail_on: Mutex<Option<MessageHash>>,
}

impl RecordingHandler {
    pub async fn writes(&self) -> Vec<SeenWrite> {
        self.writes.lock().await.clone()
    }

    pub async fn fail_on(&self, hash: Option<MessageHash>) {
        *self.fail_on.lock().await = hash;
    }
}

#[async_trait]
impl MessageHandler<InMemoryTransaction> for RecordingHandler {
    async fn handle_message_merge(
        &self,
        applied: MessageApplied<'_>,
        _txn: &mut InMemoryTransaction,
    ) -> Result<(), BoxError> {
        if self.fail_on.lock().await.as_ref() == Some(&applied.message.hash) {
            return Err(format!("projection of {} failed", applied.message.hash).into());
        }
        self.writes.lock().await.push(SeenWrite {
            hash: applied.message.hash.clone(),
            operation: applied.operation,
            state: applied.state,
            is_new: applied.is_new,
            was_missed: applied.was_missed,
        });
        Ok(())
    }

    async fn handle_onchain_event(
        &self,
        _event: &OnChainEvent,
        is_new: bool,
        _txn: &mut InMemoryTransaction,
    ) -> Result<(), BoxError> {
        self.onchain.lock().await.push(is_new);
        Ok(())
    }

    async fn handle_username_proof(
        &self,
        proof: &UserNameProof,
        state: MessageState,
        is_new: bool,
        _txn: &mut InMemoryTransaction,
    ) -> Result<(), BoxError> {
        self.proofs
            .lock()
            .await
            .push((proof.name.clone(), state, is_new));
        Ok(())
    }
}

/// Records the hub event ids handed to a stream consumer, failing while `failing` is set.
#[derive(Default)]
pub struct OrderRecorder {
    pub handled: Mutex<Vec<u64>>,
    pub attempts: Mutex<Vec<u64>>,
    pub failing: Mutex<Option<u64>>,
}

impl OrderRecorder {
    pub async fn handled(&self) -> Vec<u64> {
        self.handled.lock().await.clone()
    }
}

#[async_trait]
impl StreamEventHandler for OrderRecorder {
    async fn handle(&self, event: &HubEvent) -> Result<HandlerOutcome, SyncError> {
        self.attempts.lock().await.push(event.id);
        if *self.failing.lock().await == Some(event.id) {
            return Err(SyncError::handler(format!("event {} failed", event.id)));
        }
        self.handled.lock().await.push(event.id);
        Ok(HandlerOutcome::Applied)
    }
}

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Consumer settings with fast polling and retries.
pub fn fast_consumer(shard: ShardConfig) -> ConsumerConfig {
    ConsumerConfig {
        poll_interval: Duration::from_millis(10),
        retry: Backoff::new(Duration::from_millis(10), Duration::from_millis(50)),
        ..ConsumerConfig::for_shard(shard)
    }
}

/// Subscriber settings with fast reconnects.
pub fn fast_subscriber(shard: ShardConfig) -> SubscriberConfig {
    SubscriberConfig {
        reconnect: Backoff::new(Duration::from_millis(10), Duration::from_millis(50)),
        append_retry: Backoff::new(Duration::from_millis(5), Duration::from_millis(20)),
        ..SubscriberConfig::for_shard(shard)
    }
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
