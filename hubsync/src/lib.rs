//! # Hubsync
//!
//! Replicates a Farcaster Hub into a local store: a live subscription feeds a durable
//! stream, a consumer applies it idempotently, and reconciliation repairs what the live
//! path missed.

#![warn(missing_docs)]

pub mod commands;

#[cfg(feature = "in-memory")]
/// In-memory collaborators for tests and development.
pub mod mem {
    //! Re-exports `hubsync_mem`.
    pub use hubsync_mem::*;
}

#[cfg(feature = "postgres")]
/// Postgres collaborators.
pub mod pg {
    //! Re-exports `hubsync_pg`.
    pub use hubsync_pg::*;
}

pub mod prelude {
    //! The prelude module for the `hubsync` crate.
    pub use crate::commands::{StartOptions, SyncPipeline, WorkerOptions};
    pub use hubsync_core::prelude::*;
}
