//! Domain types shared by every component of the subscription engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a stream, or the synthetic `$all` stream covering every
/// event in global [`EventNumber`] order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StreamId {
    /// A single, named stream.
    Named(String),
    /// The synthetic stream spanning every event ever appended.
    All,
}

impl StreamId {
    /// The wire representation used in notification payloads and durable
    /// subscription rows: `"$all"` for [`StreamId::All`], the stream id
    /// otherwise.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Named(id) => id.as_str(),
            Self::All => "$all",
        }
    }
}

impl From<&str> for StreamId {
    fn from(value: &str) -> Self {
        if value == "$all" {
            Self::All
        } else {
            Self::Named(value.to_owned())
        }
    }
}

impl From<String> for StreamId {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster-wide monotonic identifier assigned to an event at append time.
/// Orders the `$all` stream.
pub type EventNumber = i64;

/// Per-stream monotonic identifier; increases by exactly one per event
/// appended to a given stream.
pub type StreamVersion = i64;

/// An immutable event as recorded by the store. Once constructed, a
/// `RecordedEvent` never changes: all mutation in the system happens to the
/// subscription state that tracks *which* recorded events a consumer has
/// seen, never to the event itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub event_id: Uuid,
    pub event_number: EventNumber,
    pub stream_version: StreamVersion,
    pub stream_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl RecordedEvent {
    /// Constructs a `RecordedEvent` from its persisted fields. Used by
    /// storage gateway implementations when deserializing query rows, and by
    /// tests that need fixture events without a database.
    #[must_use]
    pub fn new(
        event_id: Uuid,
        event_number: EventNumber,
        stream_version: StreamVersion,
        stream_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        metadata: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id,
            event_number,
            stream_version,
            stream_id: stream_id.into(),
            event_type: event_type.into(),
            payload,
            metadata,
            created_at,
        }
    }
}

/// The version a caller expects a stream to be at before appending, used by
/// [`crate::gateway::StorageGateway::append_events`] for optimistic
/// concurrency control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip the check: append regardless of the stream's current version.
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The stream must be at exactly this version.
    Exact(StreamVersion),
}

/// Where a new subscription should begin reading from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    /// The very first event in the stream.
    Origin,
    /// Only events appended after the subscription is created.
    Current,
    /// A specific, already-acknowledged event number (used when resuming a
    /// subscription that was created out-of-band).
    EventNumber(EventNumber),
}

/// A durable subscription cursor, as persisted in the `subscriptions` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRow {
    pub subscription_id: i64,
    pub stream_id: StreamId,
    pub subscription_name: String,
    /// Highest contiguously acknowledged event number, or `None` if nothing
    /// has been acknowledged yet.
    pub last_seen: Option<EventNumber>,
}
