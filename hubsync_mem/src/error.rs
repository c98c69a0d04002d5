use uuid::Uuid;

/// Errors raised by the in-memory collaborators.
#[derive(Debug, thiserror::Error)]
pub enum InMemoryError {
    /// The collaborator was switched off with `set_available(false)`.
    #[error("{0} is unavailable")]
    Unavailable(&'static str),
    /// A failure injected by a test.
    #[error("injected failure: {0}")]
    Injected(String),
    /// A live subscriber fell behind the broadcast buffer.
    #[error("subscriber lagged behind by {0} events")]
    Lagged(u64),
    /// The task id is not leased.
    #[error("task {0} is not leased")]
    NotLeased(Uuid),
}
