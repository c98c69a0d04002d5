use hubsync_core::error::SyncError;

/// Errors raised by the Postgres collaborators.
#[derive(Debug, thiserror::Error)]
pub enum PgSyncError {
    /// A database error
    #[error("Database error: {0}")]
    DBError(#[from] sqlx::Error),
    /// A row holds a discriminant this version does not know.
    #[error("Unknown {kind} code {code} in the database")]
    UnknownCode {
        /// What the code stands for
        kind: &'static str,
        /// The stored value
        code: i16,
    },
    /// A row holds a value that does not fit the in-memory type.
    #[error("Value out of range in column {0}")]
    OutOfRange(&'static str),
    /// The task is not leased, so it cannot be acked or nacked.
    #[error("Task {0} is not leased")]
    NotLeased(uuid::Uuid),
}

impl PgSyncError {
    /// Whether the error means the database could not be reached at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            PgSyncError::DBError(
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::WorkerCrashed
            )
        )
    }

    /// Maps the error onto the store variants of [`SyncError`].
    pub fn into_store_error(self) -> SyncError {
        if self.is_unavailable() {
            SyncError::store_unavailable(self)
        } else {
            SyncError::store(self)
        }
    }

    /// Maps the error onto [`SyncError::Stream`].
    pub fn into_stream_error(self) -> SyncError {
        SyncError::stream(self)
    }

    /// Maps the error onto [`SyncError::Queue`].
    pub fn into_queue_error(self) -> SyncError {
        SyncError::queue(self)
    }
}

impl From<PgSyncError> for SyncError {
    fn from(err: PgSyncError) -> Self {
        err.into_store_error()
    }
}

pub(crate) fn store_err(err: sqlx::Error) -> SyncError {
    PgSyncError::from(err).into_store_error()
}

pub(crate) fn stream_err(err: sqlx::Error) -> SyncError {
    PgSyncError::from(err).into_stream_error()
}

pub(crate) fn queue_err(err: sqlx::Error) -> SyncError {
    PgSyncError::from(err).into_queue_error()
}

/// Converts a stored signed integer back into its unsigned field.
pub(crate) fn unsigned<T>(value: i64, column: &'static str) -> Result<T, PgSyncError>
where
    T: TryFrom<i64>,
{
    T::try_from(value).map_err(|_| PgSyncError::OutOfRange(column))
}
