//! Abstractions over the database-backed collaborators the subscription
//! engine depends on: typed storage operations (C1) and session-scoped
//! advisory locking (C2).
//!
//! Keeping these as traits is what makes the finite state machine and
//! partition fan-out in [`crate::subscription`] unit-testable without a
//! database: tests supply an in-memory double, production code pairs this
//! crate with a concrete backend such as `event-store-postgres`.

use async_trait::async_trait;

use crate::error::{LockError, StorageError};
use crate::event::{EventNumber, ExpectedVersion, RecordedEvent, StartFrom, StreamId, StreamVersion};

/// Result alias for [`StorageGateway`] operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Typed operations over the event-store database (C1).
///
/// Implementations must never swallow a transport error: map it to
/// [`StorageError::Transport`] so the calling actor can decide whether to
/// retry.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Creates a new, empty stream. Fails with [`StorageError::StreamExists`]
    /// if the id is already in use.
    async fn create_stream(&self, stream_id: &str) -> StorageResult<i64>;

    /// Appends `events` to `stream_id`, checking `expected_version` first.
    /// Assigns contiguous [`StreamVersion`]s and globally monotonic
    /// [`EventNumber`]s atomically. Returns the stream's new version.
    async fn append_events(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> StorageResult<StreamVersion>;

    /// Reads up to `max_count` events from `stream_id` starting at
    /// `from_version` (inclusive), oldest first. The synthetic `$all` stream
    /// is read by [`EventNumber`] instead of [`StreamVersion`]. Returns an
    /// empty vector, never an error, once the stream is caught up.
    async fn read_stream_forward(
        &self,
        stream_id: &StreamId,
        from: i64,
        max_count: usize,
    ) -> StorageResult<Vec<RecordedEvent>>;

    /// Idempotently creates, or attaches to, a durable subscription cursor.
    async fn subscribe_to_stream(
        &self,
        stream_id: &StreamId,
        subscription_name: &str,
        start_from: StartFrom,
    ) -> StorageResult<(i64, Option<EventNumber>)>;

    /// Conditionally advances the durable checkpoint: a no-op, not an error,
    /// if `last_seen` is not greater than the value already stored.
    async fn ack_last_seen_event(
        &self,
        stream_id: &StreamId,
        subscription_name: &str,
        last_seen: EventNumber,
    ) -> StorageResult<()>;

    /// Removes the durable subscription row.
    async fn delete_subscription(
        &self,
        stream_id: &StreamId,
        subscription_name: &str,
    ) -> StorageResult<()>;
}

/// An event awaiting assignment of a [`StreamVersion`] and [`EventNumber`],
/// supplied by a caller to [`StorageGateway::append_events`].
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
}

/// A lease on a database session advisory lock (C2), returned by
/// [`AdvisoryLock::try_acquire`]. Dropping it does not itself release the
/// lock: callers must call [`AdvisoryLock::release`] explicitly, since
/// release is itself a fallible, awaited operation against the dedicated
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockRef(pub u64);

/// Session-scoped mutex provided by the database, used to elect a single
/// leader per subscription across a cluster of service nodes (C2).
#[async_trait]
pub trait AdvisoryLock: Send + Sync {
    /// Attempts to acquire the lock keyed by `key` (typically a
    /// `subscription_id`). Returns [`LockError::AlreadyTaken`] if another
    /// session already holds it — this is an expected, non-fatal outcome of
    /// losing an election, not a bug.
    async fn try_acquire(&self, key: i64) -> Result<LockRef, LockError>;

    /// Releases a previously acquired lock. A no-op if the underlying
    /// session has already been lost (the lock was released implicitly when
    /// the session died).
    async fn release(&self, lock_ref: LockRef);

    /// A stream of `lock_ref`s whose holder has lost leadership because the
    /// dedicated advisory-lock session was lost. Holders must treat receipt
    /// of their own `lock_ref` here as an immediate demotion, regardless of
    /// whether they have separately observed the failure.
    fn disconnections(&self) -> tokio::sync::broadcast::Receiver<LockRef>;
}
