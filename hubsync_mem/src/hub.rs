use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use hubsync_core::prelude::*;
use tokio::sync::{Mutex, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::error::InMemoryError;

const LIVE_BUFFER: usize = 1024;

#[derive(Debug)]
struct HubData {
    events: Vec<HubEvent>,
    next_event_id: u64,
    messages: HashMap<u64, Vec<Message>>,
    username_proofs: HashMap<u64, Vec<UserNameProof>>,
    max_fid: Option<u64>,
    available: bool,
    failing_fids: HashSet<u64>,
    filter_shards: bool,
    live_tx: broadcast::Sender<HubEvent>,
}

/// An in-memory Hub.
///
/// Events published to it are kept as history and broadcast to live subscribers. Messages
/// and username proofs are held per fid for the historical queries. It is meant for tests
/// and development.
#[derive(Debug, Clone)]
pub struct InMemoryHub {
    data: Arc<Mutex<HubData>>,
}

impl Default for InMemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryHub {
    pub fn new() -> Self {
        log::debug!("Creating a new InMemoryHub");
        let (live_tx, _) = broadcast::channel(LIVE_BUFFER);
        Self {
            data: Arc::new(Mutex::new(HubData {
                events: Vec::new(),
                next_event_id: 1,
                messages: HashMap::new(),
                username_proofs: HashMap::new(),
                max_fid: None,
                available: true,
                failing_fids: HashSet::new(),
                filter_shards: true,
                live_tx,
            })),
        }
    }

    /// Emits a new event with the next id.
    pub async fn publish(&self, body: HubEventBody) -> HubEvent {
        let mut data = self.data.lock().await;
        let event = HubEvent::new(data.next_event_id, body);
        Self::emit(&mut data, event.clone());
        event
    }

    /// Emits `event` as is, keeping its id. Used to replay or reorder events.
    pub async fn publish_event(&self, event: HubEvent) {
        let mut data = self.data.lock().await;
        Self::emit(&mut data, event);
    }

    fn emit(data: &mut HubData, event: HubEvent) {
        data.next_event_id = data.next_event_id.max(event.id + 1);
        data.events.push(event.clone());
        // No receivers is fine: the event is kept as history.
        let _ = data.live_tx.send(event);
    }

    /// Ends every live subscription.
    pub async fn disconnect_subscribers(&self) {
        let mut data = self.data.lock().await;
        let (live_tx, _) = broadcast::channel(LIVE_BUFFER);
        data.live_tx = live_tx;
    }

    pub async fn subscriber_count(&self) -> usize {
        self.data.lock().await.live_tx.receiver_count()
    }

    /// Adds a message to the fid's message set.
    pub async fn insert_message(&self, message: Message) {
        let mut data = self.data.lock().await;
        data.messages.entry(message.fid).or_default().push(message);
    }

    pub async fn remove_message(&self, fid: u64, hash: &MessageHash) {
        let mut data = self.data.lock().await;
        if let Some(messages) = data.messages.get_mut(&fid) {
            messages.retain(|m| &m.hash != hash);
        }
    }

    pub async fn insert_username_proof(&self, proof: UserNameProof) {
        let mut data = self.data.lock().await;
        data.username_proofs.entry(proof.fid).or_default().push(proof);
    }

    pub async fn set_max_fid(&self, max_fid: Option<u64>) {
        self.data.lock().await.max_fid = max_fid;
    }

    /// When unavailable, every call fails like an unreachable Hub.
    pub async fn set_available(&self, available: bool) {
        self.data.lock().await.available = available;
    }

    /// Makes the historical queries of `fid` fail.
    pub async fn fail_fid(&self, fid: u64) {
        self.data.lock().await.failing_fids.insert(fid);
    }

    /// When disabled, subscriptions deliver every event regardless of the shard filter.
    pub async fn set_filter_shards(&self, filter_shards: bool) {
        self.data.lock().await.filter_shards = filter_shards;
    }

    fn check(data: &HubData, fid: Option<u64>) -> Result<(), SyncError> {
        if !data.available {
            return Err(SyncError::hub(InMemoryError::Unavailable("hub")));
        }
        if let Some(fid) = fid
            && data.failing_fids.contains(&fid)
        {
            return Err(SyncError::hub(InMemoryError::Injected(format!(
                "queries of fid {} fail",
                fid
            ))));
        }
        Ok(())
    }

    fn messages_of(data: &HubData, fid: u64, kind: MessageKind) -> Vec<Message> {
        data.messages
            .get(&fid)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| kind.message_types().contains(&m.message_type))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn decode_offset(token: Option<&[u8]>) -> usize {
    token
        .and_then(|t| <[u8; 8]>::try_from(t).ok())
        .map(|bytes| u64::from_be_bytes(bytes) as usize)
        .unwrap_or(0)
}

#[async_trait]
impl HubClient for InMemoryHub {
    async fn subscribe(&self, request: SubscribeRequest) -> Result<HubEventStream, SyncError> {
        let data = self.data.lock().await;
        Self::check(&data, None)?;

        let shard = if data.filter_shards {
            request.shard()
        } else {
            ShardConfig::unsharded()
        };
        let live = BroadcastStream::new(data.live_tx.subscribe());
        let backlog: Vec<HubEvent> = match request.from_id {
            Some(from_id) => data
                .events
                .iter()
                .filter(|e| e.id >= from_id && shard.owns(e))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        drop(data);

        let last_backlog_id = backlog.last().map(|e| e.id);
        let from_id = request.from_id;
        let live = live.filter_map(move |item| {
            let next = match item {
                Ok(event) => {
                    let replayed = last_backlog_id.is_some_and(|last| event.id <= last);
                    let too_old = from_id.is_some_and(|from| event.id < from);
                    if replayed || too_old || !shard.owns(&event) {
                        None
                    } else {
                        Some(Ok(event))
                    }
                }
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    Some(Err(SyncError::hub(InMemoryError::Lagged(missed))))
                }
            };
            futures::future::ready(next)
        });

        Ok(futures::stream::iter(backlog.into_iter().map(Ok))
            .chain(live)
            .boxed())
    }

    async fn get_info(&self) -> Result<HubInfo, SyncError> {
        let data = self.data.lock().await;
        Self::check(&data, None)?;
        let num_messages = data.messages.values().map(|m| m.len() as u64).sum();
        Ok(HubInfo {
            version: "in-memory".to_string(),
            max_fid: data.max_fid,
            num_messages,
        })
    }

    async fn get_messages_by_fid(
        &self,
        fid: u64,
        kind: MessageKind,
        page: PageRequest,
    ) -> Result<MessagesPage, SyncError> {
        let data = self.data.lock().await;
        Self::check(&data, Some(fid))?;

        let all = Self::messages_of(&data, fid, kind);
        let offset = decode_offset(page.page_token.as_deref()).min(all.len());
        let page_size = page.page_size.max(1) as usize;
        let end = offset.saturating_add(page_size).min(all.len());
        let next_page_token = (end < all.len()).then(|| (end as u64).to_be_bytes().to_vec());
        Ok(MessagesPage {
            messages: all[offset..end].to_vec(),
            next_page_token,
        })
    }

    async fn stream_messages_by_fid(
        &self,
        fid: u64,
        kind: MessageKind,
        _page_size: u32,
    ) -> Result<MessageStream, SyncError> {
        let data = self.data.lock().await;
        Self::check(&data, Some(fid))?;
        let messages = Self::messages_of(&data, fid, kind);
        Ok(futures::stream::iter(messages.into_iter().map(Ok)).boxed())
    }

    async fn get_username_proofs_by_fid(&self, fid: u64) -> Result<Vec<UserNameProof>, SyncError> {
        let data = self.data.lock().await;
        Self::check(&data, Some(fid))?;
        Ok(data.username_proofs.get(&fid).cloned().unwrap_or_default())
    }
}
