//! # Hubsync postgres backends
//!
//! The store, durable stream and task queue of the sync engine, all on one database. Run
//! [`Migrator::run`] before using them.

#![warn(missing_docs)]

/// Errors of the Postgres backends
pub mod error;

/// Database migrations for the hubsync schema
pub mod migrations;

/// The task queue implementation for postgres
pub mod queue;

/// The sync store implementation for postgres
pub mod store;

/// The durable stream implementation for postgres
pub mod stream;

pub use error::PgSyncError;
pub use migrations::{AppliedMigration, Migration, MigrationError, Migrator};
pub use queue::PgTaskQueue;
pub use store::{PgStoreTransaction, PgSyncStore};
pub use stream::PgDurableStream;
