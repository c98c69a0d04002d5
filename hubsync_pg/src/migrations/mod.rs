//! Embedded schema migrations for hubsync_pg.
//!
//! Migrations are versioned, checksummed and tracked in `_hubsync_migrations`. They only
//! move forward; a migration is never rolled back once committed.
//!
//! ```rust,ignore
//! use hubsync_pg::migrations::Migrator;
//!
//! let applied = Migrator::new(pool).run().await?;
//! ```

mod m001_create_sync_tables;
mod m002_create_stream_tables;
mod m003_create_task_queue;

use m001_create_sync_tables::CreateSyncTables;
use m002_create_stream_tables::CreateStreamTables;
use m003_create_task_queue::CreateTaskQueue;

use std::collections::HashSet;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Postgres, Row, Transaction};

/// All migrations in order. New migrations go at the end.
const MIGRATIONS: &[&dyn Migration] = &[&CreateSyncTables, &CreateStreamTables, &CreateTaskQueue];

/// Errors that can occur during migration operations.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A migration's checksum doesn't match what was previously applied.
    #[error("Migration {version} ({name}) checksum mismatch: expected {expected}, found {found}")]
    ChecksumMismatch {
        /// The version of the migration.
        version: i64,
        /// The name of the migration.
        name: String,
        /// The checksum recorded in the database.
        expected: String,
        /// The checksum computed from the code.
        found: String,
    },

    /// A migration failed to execute.
    #[error("Migration {version} ({name}) failed: {reason}")]
    MigrationFailed {
        /// The version of the migration that failed.
        version: i64,
        /// The name of the migration.
        name: String,
        /// The reason for the failure.
        reason: String,
    },
}

/// A single schema migration.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Unique, sequential version number.
    fn version(&self) -> i64;

    /// Human-readable name (e.g., "create_sync_tables").
    fn name(&self) -> &'static str;

    /// Executes the migration inside the transaction managed by the [`Migrator`].
    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError>;

    /// SHA-256 of version and name, for tamper detection.
    fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version().to_le_bytes());
        hasher.update(self.name().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Record of a migration that has been applied.
#[derive(Debug, Clone)]
pub struct AppliedMigration {
    /// The version number of the migration.
    pub version: i64,
    /// The human-readable name of the migration.
    pub name: String,
    /// When the migration was applied.
    pub applied_at: chrono::DateTime<chrono::Utc>,
    /// The checksum recorded when the migration was applied.
    pub checksum: String,
}

/// Applies the hubsync schema, each migration exactly once and in order.
#[derive(Debug, Clone)]
pub struct Migrator {
    pool: PgPool,
}

impl Migrator {
    /// Creates a new migrator with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_tracking_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _hubsync_migrations (
                version BIGINT PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                checksum VARCHAR(64) NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Runs all pending migrations, each in its own transaction, and returns how many ran.
    ///
    /// Fails without applying anything if an applied migration's checksum changed.
    pub async fn run(&self) -> Result<usize, MigrationError> {
        self.ensure_tracking_table().await?;

        let applied = self.applied().await?;
        for applied_migration in &applied {
            if let Some(migration) = MIGRATIONS
                .iter()
                .find(|m| m.version() == applied_migration.version)
            {
                let current_checksum = migration.checksum();
                if current_checksum != applied_migration.checksum {
                    return Err(MigrationError::ChecksumMismatch {
                        version: applied_migration.version,
                        name: applied_migration.name.clone(),
                        expected: applied_migration.checksum.clone(),
                        found: current_checksum,
                    });
                }
            }
        }

        let applied_versions: HashSet<i64> = applied.iter().map(|m| m.version).collect();

        let mut count = 0;
        for migration in MIGRATIONS {
            if applied_versions.contains(&migration.version()) {
                log::debug!(
                    "Skipping migration {} ({}): already applied",
                    migration.version(),
                    migration.name()
                );
                continue;
            }

            log::info!(
                "Running migration {} ({})...",
                migration.version(),
                migration.name()
            );

            let mut tx = self.pool.begin().await?;
            migration.up(&mut tx).await.map_err(|e| match e {
                MigrationError::Database(db_err) => MigrationError::MigrationFailed {
                    version: migration.version(),
                    name: migration.name().to_string(),
                    reason: db_err.to_string(),
                },
                other => other,
            })?;

            sqlx::query(
                r#"
                INSERT INTO _hubsync_migrations (version, name, checksum)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(migration.version())
            .bind(migration.name())
            .bind(migration.checksum())
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            log::info!(
                "Migration {} ({}) applied successfully",
                migration.version(),
                migration.name()
            );
            count += 1;
        }

        Ok(count)
    }

    /// Returns the current migration version (0 if no migrations applied).
    pub async fn current_version(&self) -> Result<i64, MigrationError> {
        self.ensure_tracking_table().await?;

        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT version FROM _hubsync_migrations
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(v,)| v).unwrap_or(0))
    }

    /// Returns the migrations not applied yet.
    pub async fn pending(&self) -> Result<Vec<&'static dyn Migration>, MigrationError> {
        let applied_versions: HashSet<i64> =
            self.applied().await?.iter().map(|m| m.version).collect();

        Ok(MIGRATIONS
            .iter()
            .filter(|m| !applied_versions.contains(&m.version()))
            .copied()
            .collect())
    }

    /// Returns the applied migrations, oldest first.
    pub async fn applied(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        self.ensure_tracking_table().await?;

        let rows = sqlx::query(
            r#"
            SELECT version, name, applied_at, checksum
            FROM _hubsync_migrations
            ORDER BY version ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| AppliedMigration {
                version: row.get("version"),
                name: row.get("name"),
                applied_at: row.get("applied_at"),
                checksum: row.get("checksum"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_checksum_is_deterministic() {
        assert_eq!(CreateSyncTables.checksum(), CreateSyncTables.checksum());
        assert_ne!(CreateSyncTables.checksum(), CreateStreamTables.checksum());
    }

    #[test]
    fn migrations_are_in_order() {
        let mut prev_version = 0;
        for migration in MIGRATIONS {
            assert!(
                migration.version() > prev_version,
                "Migration {} should have version > {}",
                migration.name(),
                prev_version
            );
            prev_version = migration.version();
        }
    }

    #[test]
    fn all_migrations_have_unique_names() {
        let names: HashSet<&str> = MIGRATIONS.iter().map(|m| m.name()).collect();
        assert_eq!(names.len(), MIGRATIONS.len());
    }
}
