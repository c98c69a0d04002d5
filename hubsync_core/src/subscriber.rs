//! Pulls live events from the Hub into the durable stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, watch};

use crate::config::{HubConfig, SubscriberConfig};
use crate::error::SyncError;
use crate::event::HubEvent;
use crate::hub::{HubClient, SubscribeRequest, with_timeout};
use crate::lifecycle::{TaskHandle, is_shutdown, sleep_unless_shutdown};
use crate::stream::{DurableStream, subscriber_position_id};

/// Subscribes to the Hub for one shard and appends every owned event to the durable stream.
///
/// The subscriber records the highest Hub event id it appended (its position) under
/// `hub-subscriber:<shard_key>` in the stream's checkpoint table. Reconnects resume from the
/// position, and events at or below it are dropped as replays.
pub struct HubSubscriber<H, S>
where
    H: HubClient + 'static,
    S: DurableStream + 'static,
{
    hub: Arc<H>,
    stream: Arc<S>,
    config: SubscriberConfig,
    hub_config: HubConfig,
    /// Highest appended Hub event id. Hub ids start at 1, so 0 means none.
    position: Arc<AtomicU64>,
    state: Arc<Mutex<Option<TaskHandle>>>,
}

impl<H, S> HubSubscriber<H, S>
where
    H: HubClient + 'static,
    S: DurableStream + 'static,
{
    pub fn new(hub: Arc<H>, stream: Arc<S>, config: SubscriberConfig) -> Self {
        Self::with_hub_config(hub, stream, config, HubConfig::default())
    }

    pub fn with_hub_config(
        hub: Arc<H>,
        stream: Arc<S>,
        config: SubscriberConfig,
        hub_config: HubConfig,
    ) -> Self {
        Self {
            hub,
            stream,
            config,
            hub_config,
            position: Arc::new(AtomicU64::new(0)),
            state: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    /// The highest Hub event id appended so far.
    pub fn position(&self) -> Option<u64> {
        match self.position.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Loads the persisted position and spawns the subscription loop.
    pub async fn start(&self) -> Result<(), SyncError> {
        self.config.shard.validate()?;

        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(SyncError::Lifecycle(format!(
                "subscriber for shard '{}' is already running",
                self.config.shard.shard_key()
            )));
        }

        let position_id = subscriber_position_id(&self.config.shard.shard_key());
        if let Some(persisted) = self.stream.get_checkpoint(&position_id).await? {
            // The in-memory position may be ahead after a stop/start cycle.
            self.position.fetch_max(persisted, Ordering::SeqCst);
        }

        let context = SubscriptionContext {
            hub: self.hub.clone(),
            stream: self.stream.clone(),
            config: self.config.clone(),
            hub_config: self.hub_config.clone(),
            position: self.position.clone(),
            stream_key: self.config.shard.stream_key(&self.config.stream_prefix),
            position_id,
        };

        info!(
            "Starting hub subscriber for shard '{}' at position {:?}",
            self.config.shard.shard_key(),
            self.position()
        );
        *state = Some(TaskHandle::spawn(move |shutdown_rx| {
            context.run(shutdown_rx)
        }));
        Ok(())
    }

    /// Closes the subscription, persists the position and waits for the loop to finish.
    pub async fn stop(&self) -> Result<(), SyncError> {
        let handle = self.state.lock().await.take();
        match handle {
            Some(handle) => handle.shutdown().await,
            None => Err(SyncError::Lifecycle(format!(
                "subscriber for shard '{}' was not started",
                self.config.shard.shard_key()
            ))),
        }
    }
}

enum AppendOutcome {
    Appended,
    Dropped,
    Shutdown,
}

struct SubscriptionContext<H: ?Sized, S: ?Sized> {
    hub: Arc<H>,
    stream: Arc<S>,
    config: SubscriberConfig,
    hub_config: HubConfig,
    position: Arc<AtomicU64>,
    stream_key: String,
    position_id: String,
}

impl<H, S> SubscriptionContext<H, S>
where
    H: HubClient + ?Sized,
    S: DurableStream + ?Sized,
{
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let shard_key = self.config.shard.shard_key();
        let mut reconnect_attempt: u32 = 0;

        loop {
            if is_shutdown(&shutdown_rx) {
                break;
            }

            let from_id = match self.position.load(Ordering::SeqCst) {
                0 => None,
                id => Some(id + 1),
            };
            let request = SubscribeRequest::new(from_id, self.config.shard);
            debug!(
                "Subscribing to hub events for shard '{}' from {:?}",
                shard_key, from_id
            );

            let subscription = tokio::select! {
                result = with_timeout(self.hub_config.rpc_timeout, self.hub.subscribe(request)) => result,
                _ = shutdown_rx.changed() => break,
            };

            let mut events = match subscription {
                Ok(events) => {
                    if reconnect_attempt > 0 {
                        info!(
                            "Hub subscription for shard '{}' re-established after {} attempts",
                            shard_key, reconnect_attempt
                        );
                    }
                    reconnect_attempt = 0;
                    events
                }
                Err(e) => {
                    let delay = self.config.reconnect.delay(reconnect_attempt);
                    reconnect_attempt = reconnect_attempt.saturating_add(1);
                    error!(
                        "Failed to subscribe to hub events for shard '{}': {}. Retrying in {:?}",
                        shard_key, e, delay
                    );
                    if sleep_unless_shutdown(delay, &mut shutdown_rx).await {
                        break;
                    }
                    continue;
                }
            };

            let mut stopping = false;
            loop {
                let next = tokio::select! {
                    next = events.next() => next,
                    _ = shutdown_rx.changed() => {
                        stopping = true;
                        break;
                    }
                };
                match next {
                    Some(Ok(event)) => match self.append(event, &mut shutdown_rx).await {
                        AppendOutcome::Appended | AppendOutcome::Dropped => {}
                        AppendOutcome::Shutdown => {
                            stopping = true;
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        warn!(
                            "Hub subscription for shard '{}' failed: {}. Reconnecting...",
                            shard_key, e
                        );
                        break;
                    }
                    None => {
                        warn!(
                            "Hub closed the subscription for shard '{}'. Reconnecting...",
                            shard_key
                        );
                        break;
                    }
                }
            }
            drop(events);

            if stopping {
                break;
            }
            let delay = self.config.reconnect.delay(reconnect_attempt);
            reconnect_attempt = reconnect_attempt.saturating_add(1);
            if sleep_unless_shutdown(delay, &mut shutdown_rx).await {
                break;
            }
        }

        self.persist_position().await;
        info!("Hub subscriber for shard '{}' stopped", shard_key);
    }

    /// Appends an owned, unseen event, retrying until it succeeds or shutdown is signalled.
    async fn append(
        &self,
        event: HubEvent,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> AppendOutcome {
        if !self.config.shard.owns(&event) {
            debug!(
                "Dropping hub event {} for fid {:?}: not owned by shard '{}'",
                event.id,
                event.fid(),
                self.config.shard.shard_key()
            );
            return AppendOutcome::Dropped;
        }

        let position = self.position.load(Ordering::SeqCst);
        if position != 0 && event.id <= position {
            debug!(
                "Dropping replayed hub event {} (position {})",
                event.id, position
            );
            return AppendOutcome::Dropped;
        }

        let mut attempt: u32 = 0;
        loop {
            match self.stream.append(&self.stream_key, &event).await {
                Ok(entry_id) => {
                    self.position.store(event.id, Ordering::SeqCst);
                    debug!(
                        "Appended hub event {} ({}) to '{}' as entry {}",
                        event.id,
                        event.event_type(),
                        self.stream_key,
                        entry_id
                    );
                    self.persist_position().await;
                    return AppendOutcome::Appended;
                }
                Err(e) => {
                    let delay = self.config.append_retry.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(
                        "Failed appending hub event {} to '{}' (attempt {}): {}. Retrying in {:?}",
                        event.id, self.stream_key, attempt, e, delay
                    );
                    if sleep_unless_shutdown(delay, shutdown_rx).await {
                        return AppendOutcome::Shutdown;
                    }
                }
            }
        }
    }

    async fn persist_position(&self) {
        let position = self.position.load(Ordering::SeqCst);
        if position == 0 {
            return;
        }
        if let Err(e) = self.stream.set_checkpoint(&self.position_id, position).await {
            warn!(
                "Failed to persist subscriber position {} for '{}': {}",
                position, self.position_id, e
            );
        }
    }
}
