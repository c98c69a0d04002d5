//! Checkpoint batching for the stream consumer.

use log::{debug, error};
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

use crate::error::SyncError;
use crate::stream::DurableStream;

/// Determines how a consumer persists its checkpoint after handling entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CheckpointMode {
    /// The checkpoint is written after every handled entry. On crash, at most one entry is
    /// redelivered.
    #[default]
    Synchronous,

    /// Checkpoint writes are batched.
    ///
    /// The checkpoint is written when either `batch_size` entries have been handled since the
    /// last write, or `max_delay_ms` milliseconds have elapsed since the first unwritten entry.
    /// On crash, up to `batch_size` entries may be redelivered.
    Batched {
        batch_size: u32,
        max_delay_ms: u64,
    },
}

impl CheckpointMode {
    pub fn batched(batch_size: u32, max_delay: Duration) -> Self {
        Self::Batched {
            batch_size,
            max_delay_ms: max_delay.as_millis() as u64,
        }
    }

    /// `batch_size = 100`, `max_delay = 5 seconds`
    pub fn batched_default() -> Self {
        Self::Batched {
            batch_size: 100,
            max_delay_ms: 5000,
        }
    }
}

/// Checkpoint progress not yet written to the stream.
#[derive(Debug, Clone)]
pub(crate) struct PendingCheckpoint {
    pub entry_id: u64,
    /// Entries handled since the last checkpoint write.
    pub entries_since_checkpoint: u32,
    /// When the first unwritten entry was handled.
    pub first_entry_time: Instant,
}

impl PendingCheckpoint {
    pub fn new(entry_id: u64) -> Self {
        Self {
            entry_id,
            entries_since_checkpoint: 1,
            first_entry_time: Instant::now(),
        }
    }

    pub fn update(&mut self, entry_id: u64) {
        self.entry_id = entry_id;
        self.entries_since_checkpoint += 1;
    }

    /// Records a handled entry into `pending`.
    pub fn record(pending: &mut Option<PendingCheckpoint>, entry_id: u64) {
        match pending {
            Some(p) => p.update(entry_id),
            None => *pending = Some(PendingCheckpoint::new(entry_id)),
        }
    }
}

/// For `Synchronous` mode, always `true`. For `Batched` mode, `true` once either threshold
/// is reached.
pub(crate) fn should_flush_checkpoint(pending: &PendingCheckpoint, mode: &CheckpointMode) -> bool {
    match mode {
        CheckpointMode::Synchronous => true,
        CheckpointMode::Batched {
            batch_size,
            max_delay_ms,
        } => {
            let max_delay = Duration::from_millis(*max_delay_ms);
            pending.entries_since_checkpoint >= *batch_size
                || pending.first_entry_time.elapsed() >= max_delay
        }
    }
}

/// Writes a pending checkpoint through the stream.
pub(crate) async fn flush_checkpoint<S>(
    stream: &S,
    consumer_id: &str,
    pending: &PendingCheckpoint,
) -> Result<(), SyncError>
where
    S: DurableStream + ?Sized,
{
    stream.set_checkpoint(consumer_id, pending.entry_id).await?;
    debug!(
        "Flushed checkpoint for '{}' to entry {} ({} entries batched)",
        consumer_id, pending.entry_id, pending.entries_since_checkpoint
    );
    Ok(())
}

/// Flushes `pending` if it should be flushed. On failure the progress stays pending so the
/// next flush retries it.
pub(crate) async fn maybe_flush<S>(
    stream: &S,
    consumer_id: &str,
    pending: &mut Option<PendingCheckpoint>,
    mode: &CheckpointMode,
) where
    S: DurableStream + ?Sized,
{
    let Some(p) = pending.as_ref() else {
        return;
    };
    if !should_flush_checkpoint(p, mode) {
        return;
    }
    flush_pending(stream, consumer_id, pending).await;
}

/// Flushes `pending` unconditionally. Used before backing off and on shutdown.
pub(crate) async fn flush_pending<S>(
    stream: &S,
    consumer_id: &str,
    pending: &mut Option<PendingCheckpoint>,
) where
    S: DurableStream + ?Sized,
{
    if let Some(p) = pending.take()
        && let Err(e) = flush_checkpoint(stream, consumer_id, &p).await
    {
        error!(
            "Failed to flush checkpoint for '{}' at entry {}: {}",
            consumer_id, p.entry_id, e
        );
        *pending = Some(p);
    }
}
