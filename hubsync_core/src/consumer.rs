//! Applies buffered stream entries in order, advancing a checkpoint.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::{Mutex, watch};

use crate::checkpoint::{PendingCheckpoint, flush_pending, maybe_flush};
use crate::config::ConsumerConfig;
use crate::error::SyncError;
use crate::event::HubEvent;
use crate::lifecycle::{TaskHandle, is_shutdown, sleep_unless_shutdown};
use crate::stream::{DurableStream, consumer_checkpoint_id};

/// What the handler did with an entry. Both outcomes advance the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Applied,
    /// The handler deliberately ignored the entry.
    Skipped,
}

/// Handles the entries read by a [`StreamConsumer`].
#[async_trait]
pub trait StreamEventHandler: Send + Sync {
    async fn handle(&self, event: &HubEvent) -> Result<HandlerOutcome, SyncError>;
}

/// Reads one shard's stream after the consumer group's checkpoint and hands every entry to
/// a handler, strictly in order.
///
/// A failing entry is retried with backoff until it succeeds. The checkpoint only moves past
/// entries whose handler returned `Ok`.
pub struct StreamConsumer<S>
where
    S: DurableStream + 'static,
{
    stream: Arc<S>,
    config: ConsumerConfig,
    state: Arc<Mutex<Option<TaskHandle>>>,
}

impl<S> StreamConsumer<S>
where
    S: DurableStream + 'static,
{
    pub fn new(stream: Arc<S>, config: ConsumerConfig) -> Self {
        Self {
            stream,
            config,
            state: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Name of this consumer's checkpoint.
    pub fn consumer_id(&self) -> String {
        consumer_checkpoint_id(&self.config.group, &self.config.shard.shard_key())
    }

    /// The persisted checkpoint.
    pub async fn checkpoint(&self) -> Result<Option<u64>, SyncError> {
        self.stream.get_checkpoint(&self.consumer_id()).await
    }

    pub async fn is_running(&self) -> bool {
        self.state
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Spawns the read loop.
    pub async fn start<Hd>(&self, handler: Arc<Hd>) -> Result<(), SyncError>
    where
        Hd: StreamEventHandler + ?Sized + 'static,
    {
        self.config.shard.validate()?;
        if self.config.batch_size == 0 {
            return Err(SyncError::Configuration(
                "consumer batch size must be positive".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(SyncError::Lifecycle(format!(
                "consumer '{}' is already running",
                self.consumer_id()
            )));
        }

        let reader = ConsumerLoop {
            stream: self.stream.clone(),
            handler,
            config: self.config.clone(),
            consumer_id: self.consumer_id(),
            stream_key: self.config.shard.stream_key(&self.config.stream_prefix),
        };
        info!(
            "Starting stream consumer '{}' on '{}'",
            reader.consumer_id, reader.stream_key
        );
        *state = Some(TaskHandle::spawn(move |shutdown_rx| {
            reader.run(shutdown_rx)
        }));
        Ok(())
    }

    /// Lets the in-flight handler finish, flushes the checkpoint and waits for the loop.
    pub async fn stop(&self) -> Result<(), SyncError> {
        let handle = self.state.lock().await.take();
        match handle {
            Some(handle) => handle.shutdown().await,
            None => Err(SyncError::Lifecycle(format!(
                "consumer '{}' was not started",
                self.consumer_id()
            ))),
        }
    }
}

struct ConsumerLoop<S: ?Sized, Hd: ?Sized> {
    stream: Arc<S>,
    handler: Arc<Hd>,
    config: ConsumerConfig,
    consumer_id: String,
    stream_key: String,
}

impl<S, Hd> ConsumerLoop<S, Hd>
where
    S: DurableStream + ?Sized,
    Hd: StreamEventHandler + ?Sized,
{
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let Some(mut checkpoint) = self.load_checkpoint(&mut shutdown_rx).await else {
            info!("Stream consumer '{}' stopped", self.consumer_id);
            return;
        };
        let mut pending: Option<PendingCheckpoint> = None;
        let mut read_attempt: u32 = 0;

        'read: loop {
            if is_shutdown(&shutdown_rx) {
                break;
            }

            maybe_flush(
                &*self.stream,
                &self.consumer_id,
                &mut pending,
                &self.config.checkpoint_mode,
            )
            .await;

            let entries = match self
                .stream
                .read_after(&self.stream_key, checkpoint, self.config.batch_size)
                .await
            {
                Ok(entries) => {
                    read_attempt = 0;
                    entries
                }
                Err(e) => {
                    let delay = self.config.retry.delay(read_attempt);
                    read_attempt = read_attempt.saturating_add(1);
                    warn!(
                        "Failed reading '{}' after {:?} for '{}': {}. Retrying in {:?}",
                        self.stream_key, checkpoint, self.consumer_id, e, delay
                    );
                    if sleep_unless_shutdown(delay, &mut shutdown_rx).await {
                        break;
                    }
                    continue;
                }
            };

            if entries.is_empty() {
                // Idle: make batched progress durable before waiting.
                flush_pending(&*self.stream, &self.consumer_id, &mut pending).await;
                if sleep_unless_shutdown(self.config.poll_interval, &mut shutdown_rx).await {
                    break;
                }
                continue;
            }

            for entry in entries {
                if checkpoint.is_some_and(|c| entry.id <= c) {
                    debug!(
                        "Ignoring entry {} of '{}' at or below checkpoint {:?}",
                        entry.id, self.stream_key, checkpoint
                    );
                    continue;
                }

                let mut attempt: u32 = 0;
                loop {
                    match self.handler.handle(&entry.event).await {
                        Ok(outcome) => {
                            debug!(
                                "Handled entry {} (hub event {}) for '{}': {:?}{}",
                                entry.id,
                                entry.event.id,
                                self.consumer_id,
                                outcome,
                                if attempt > 0 {
                                    format!(" (after {} retries)", attempt)
                                } else {
                                    String::new()
                                }
                            );
                            break;
                        }
                        Err(e) => {
                            let delay = self.config.retry.delay(attempt);
                            attempt = attempt.saturating_add(1);
                            warn!(
                                "Failed handling entry {} (hub event {}) for '{}' (attempt {}): {}. Retrying in {:?}",
                                entry.id, entry.event.id, self.consumer_id, attempt, e, delay
                            );
                            flush_pending(&*self.stream, &self.consumer_id, &mut pending).await;
                            if sleep_unless_shutdown(delay, &mut shutdown_rx).await {
                                break 'read;
                            }
                        }
                    }
                }

                checkpoint = Some(entry.id);
                PendingCheckpoint::record(&mut pending, entry.id);
                maybe_flush(
                    &*self.stream,
                    &self.consumer_id,
                    &mut pending,
                    &self.config.checkpoint_mode,
                )
                .await;

                if is_shutdown(&shutdown_rx) {
                    break 'read;
                }
            }
        }

        flush_pending(&*self.stream, &self.consumer_id, &mut pending).await;
        info!("Stream consumer '{}' stopped", self.consumer_id);
    }

    /// Loads the persisted checkpoint, retrying until it succeeds. `None` means shutdown was
    /// signalled first.
    async fn load_checkpoint(
        &self,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Option<Option<u64>> {
        let mut attempt: u32 = 0;
        loop {
            match self.stream.get_checkpoint(&self.consumer_id).await {
                Ok(checkpoint) => {
                    debug!(
                        "Consumer '{}' resuming after checkpoint {:?}",
                        self.consumer_id, checkpoint
                    );
                    return Some(checkpoint);
                }
                Err(e) => {
                    let delay = self.config.retry.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(
                        "Failed loading checkpoint for '{}': {}. Retrying in {:?}",
                        self.consumer_id, e, delay
                    );
                    if sleep_unless_shutdown(delay, shutdown_rx).await {
                        return None;
                    }
                }
            }
        }
    }
}
