//! Maps `tokio_postgres` and `bb8` failures onto `event_store_core`'s
//! per-module error taxonomy, following the same newtype-wrapper pattern as
//! the teacher's `eventually_postgres::store::Error`.

use event_store_core::error::{LockError, StorageError};

/// SQLSTATE for `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

pub(crate) fn storage_error(err: tokio_postgres::Error) -> StorageError {
    if let Some(code) = err.code() {
        if code.code() == UNIQUE_VIOLATION {
            // Caller decides whether this means stream_exists or
            // subscription_already_exists; this path is only reached for
            // operations that don't already special-case the conflict.
            return StorageError::StreamExists;
        }
    }
    StorageError::Transport(err.into())
}

pub(crate) fn pool_error(err: bb8::RunError<tokio_postgres::Error>) -> StorageError {
    StorageError::Transport(anyhow::anyhow!(err))
}

pub(crate) fn lock_pool_error(err: tokio_postgres::Error) -> LockError {
    LockError::Transport(err.into())
}
