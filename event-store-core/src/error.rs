//! Error taxonomy for the storage gateway and advisory-lock seams.
//!
//! Each module boundary in this crate owns its own `thiserror`-derived error
//! type, following the same pattern as `eventually-postgres`'s per-module
//! `Error` enums, rather than a single crate-wide error.

/// Errors returned by a [`crate::gateway::StorageGateway`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// `create_stream` was called for a stream id that already exists.
    #[error("stream already exists")]
    StreamExists,

    /// The referenced stream has no rows.
    #[error("stream not found")]
    StreamNotFound,

    /// `append_events` was called with an `Exact` expected version that did
    /// not match the stream's current version.
    #[error("wrong expected version: expected {expected}, found {actual}")]
    WrongExpectedVersion {
        expected: crate::event::StreamVersion,
        actual: crate::event::StreamVersion,
    },

    /// `subscribe_to_stream` raced a concurrent insert and collapsed onto an
    /// existing row; not itself an error condition for callers, but surfaced
    /// here so gateways can log it at `debug`.
    #[error("subscription already exists, attached to existing row")]
    SubscriptionAlreadyExists,

    /// A transport-level failure (connection reset, timeout, pool
    /// exhaustion). Always retryable: the caller should keep its in-memory
    /// state and retry on the next trigger rather than giving up.
    #[error("storage transport error: {0}")]
    Transport(#[source] anyhow::Error),
}

impl StorageError {
    /// Whether retrying the same operation again, unchanged, might succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Errors returned by an [`crate::gateway::AdvisoryLock`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another session already holds the lock for this key.
    #[error("advisory lock already taken")]
    AlreadyTaken,

    /// The dedicated lock session itself has failed; the caller is no
    /// longer the leader for anything it previously acquired.
    #[error("advisory lock session error: {0}")]
    Transport(#[source] anyhow::Error),
}

/// Errors returned when acknowledging delivered events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AckError {
    /// The acking endpoint is not known to this subscription.
    #[error("unknown subscriber")]
    UnknownSubscriber,

    /// The acked event number is higher than any event currently in-flight
    /// to this endpoint.
    #[error("invalid ack: no such in-flight event")]
    InvalidAck,
}

/// Errors returned by the subscription orchestrator (C8).
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    /// A subscription with this `(stream_id, subscription_name)` already has
    /// as many connected endpoints as its `concurrency_limit` allows.
    #[error("subscription already exists")]
    SubscriptionAlreadyExists,
}
