use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hubsync_core::prelude::*;
use tokio::sync::Mutex;

use crate::error::InMemoryError;

#[derive(Debug, Default)]
struct StreamData {
    entries: HashMap<String, Vec<StreamEntry>>,
    checkpoints: HashMap<String, u64>,
    failing_appends: u32,
    failing_reads: u32,
    available: bool,
}

/// An in-memory durable stream.
///
/// Entry ids start at 1 and increase per stream key. Contents live as long as the value, so
/// a "restart" in tests is a new consumer over the same stream.
#[derive(Debug, Clone)]
pub struct InMemoryStream {
    data: Arc<Mutex<StreamData>>,
}

impl Default for InMemoryStream {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStream {
    pub fn new() -> Self {
        log::debug!("Creating a new InMemoryStream");
        Self {
            data: Arc::new(Mutex::new(StreamData {
                available: true,
                ..StreamData::default()
            })),
        }
    }

    /// Every entry appended under `stream_key`.
    pub async fn entries(&self, stream_key: &str) -> Vec<StreamEntry> {
        self.data
            .lock()
            .await
            .entries
            .get(stream_key)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn len(&self, stream_key: &str) -> usize {
        self.data
            .lock()
            .await
            .entries
            .get(stream_key)
            .map_or(0, Vec::len)
    }

    /// Makes the next `count` appends fail.
    pub async fn fail_next_appends(&self, count: u32) {
        self.data.lock().await.failing_appends = count;
    }

    /// Makes the next `count` reads fail.
    pub async fn fail_next_reads(&self, count: u32) {
        self.data.lock().await.failing_reads = count;
    }

    pub async fn set_available(&self, available: bool) {
        self.data.lock().await.available = available;
    }

    fn check(data: &StreamData) -> Result<(), SyncError> {
        if data.available {
            Ok(())
        } else {
            Err(SyncError::stream(InMemoryError::Unavailable("stream")))
        }
    }
}

#[async_trait]
impl DurableStream for InMemoryStream {
    async fn append(&self, stream_key: &str, event: &HubEvent) -> Result<u64, SyncError> {
        let mut data = self.data.lock().await;
        Self::check(&data)?;
        if data.failing_appends > 0 {
            data.failing_appends -= 1;
            return Err(SyncError::stream(InMemoryError::Injected(
                "append failed".to_string(),
            )));
        }
        let entries = data.entries.entry(stream_key.to_string()).or_default();
        let id = entries.last().map_or(1, |last| last.id + 1);
        entries.push(StreamEntry {
            id,
            event: event.clone(),
        });
        Ok(id)
    }

    async fn read_after(
        &self,
        stream_key: &str,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<StreamEntry>, SyncError> {
        let mut data = self.data.lock().await;
        Self::check(&data)?;
        if data.failing_reads > 0 {
            data.failing_reads -= 1;
            return Err(SyncError::stream(InMemoryError::Injected(
                "read failed".to_string(),
            )));
        }
        let Some(entries) = data.entries.get(stream_key) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .iter()
            .filter(|entry| after.is_none_or(|after| entry.id > after))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_checkpoint(&self, consumer_id: &str) -> Result<Option<u64>, SyncError> {
        let data = self.data.lock().await;
        Self::check(&data)?;
        Ok(data.checkpoints.get(consumer_id).copied())
    }

    async fn set_checkpoint(&self, consumer_id: &str, entry_id: u64) -> Result<(), SyncError> {
        let mut data = self.data.lock().await;
        Self::check(&data)?;
        data.checkpoints.insert(consumer_id.to_string(), entry_id);
        Ok(())
    }
}
