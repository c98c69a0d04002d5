//! In-memory collaborators for the hub sync engine.
//!
//! Useful for tests and development. Nothing is persisted.

mod error;
mod hub;
mod queue;
mod store;
mod stream;

pub use error::InMemoryError;
pub use hub::InMemoryHub;
pub use queue::{InMemoryTaskQueue, TaskRecord, TaskState};
pub use store::{InMemorySyncStore, InMemoryTransaction};
pub use stream::InMemoryStream;
