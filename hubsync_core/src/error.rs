//! Error types shared by every component of the sync engine.

use std::time::Duration;

/// A boxed error, used for failures raised by collaborators and application callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The broad category of a [`SyncError`]. The outer loops use it to decide between retrying,
/// skipping and giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The Hub, the stream, the queue or the store could not be reached. Retried with backoff.
    Connection,
    /// A single event or repair failed to apply. Not retried past: the checkpoint stays put.
    Application,
    /// A reconciliation call received a time range it could not use.
    InvalidRange,
    /// The backfill could not determine the upper bound of the identity space.
    MissingMetadata,
    /// A component was misconfigured or used outside its lifecycle.
    Configuration,
}

/// Errors returned by the sync engine and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The Hub client failed.
    #[error("hub error: {0}")]
    Hub(#[source] BoxError),
    /// A Hub call exceeded the configured RPC timeout.
    #[error("hub call timed out after {0:?}")]
    Timeout(Duration),
    /// The durable stream failed.
    #[error("stream error: {0}")]
    Stream(#[source] BoxError),
    /// The task queue failed.
    #[error("task queue error: {0}")]
    Queue(#[source] BoxError),
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] BoxError),
    /// The store rejected a read or a write.
    #[error("store error: {0}")]
    Store(#[source] BoxError),
    /// An application callback failed.
    #[error("handler error: {0}")]
    Handler(#[source] BoxError),
    /// A payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    /// A reconciliation time range could not be parsed or is inverted.
    #[error("invalid time range: {0}")]
    InvalidRange(String),
    /// Metadata required by the caller is not available.
    #[error("missing metadata: {0}")]
    MissingMetadata(String),
    /// Some identities of a reconciliation batch failed.
    #[error("{failed} of {total} fids failed to reconcile")]
    PartialBatch {
        /// Number of fids whose reconciliation failed.
        failed: usize,
        /// Number of fids in the batch.
        total: usize,
    },
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// A background task was used outside its lifecycle (not started, panicked).
    #[error("lifecycle error: {0}")]
    Lifecycle(String),
}

impl SyncError {
    /// Wraps a Hub client failure.
    pub fn hub(err: impl Into<BoxError>) -> Self {
        Self::Hub(err.into())
    }

    /// Wraps a durable stream failure.
    pub fn stream(err: impl Into<BoxError>) -> Self {
        Self::Stream(err.into())
    }

    /// Wraps a task queue failure.
    pub fn queue(err: impl Into<BoxError>) -> Self {
        Self::Queue(err.into())
    }

    /// Wraps a store failure.
    pub fn store(err: impl Into<BoxError>) -> Self {
        Self::Store(err.into())
    }

    /// Wraps a store connectivity failure.
    pub fn store_unavailable(err: impl Into<BoxError>) -> Self {
        Self::StoreUnavailable(err.into())
    }

    /// Wraps an application callback failure.
    pub fn handler(err: impl Into<BoxError>) -> Self {
        Self::Handler(err.into())
    }

    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Hub(_)
            | Self::Timeout(_)
            | Self::Stream(_)
            | Self::Queue(_)
            | Self::StoreUnavailable(_) => ErrorKind::Connection,
            Self::Store(_) | Self::Handler(_) | Self::Codec(_) | Self::PartialBatch { .. } => {
                ErrorKind::Application
            }
            Self::InvalidRange(_) => ErrorKind::InvalidRange,
            Self::MissingMetadata(_) => ErrorKind::MissingMetadata,
            Self::Configuration(_) | Self::Lifecycle(_) => ErrorKind::Configuration,
        }
    }

    /// Whether the outer loop should retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connection | ErrorKind::Application)
    }
}
