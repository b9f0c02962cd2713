//! In-memory per-subscription state (§3 `SubscriptionState`) and the
//! configuration supplied by a caller when first subscribing.

use std::sync::Arc;

use crate::event::{EventNumber, StartFrom, StreamId};
use crate::gateway::LockRef;

use super::partition::PartitionKey;

/// Default per-endpoint in-flight cap, used when a caller does not specify
/// `buffer_size`.
pub const DEFAULT_BUFFER_SIZE: usize = 1;

/// Default queue cap, used when a caller does not specify `max_size`.
pub const DEFAULT_MAX_SIZE: usize = 1000;

/// Filter and routing configuration for a subscription, supplied once at
/// `subscribe_to_stream` time and shared by every endpoint connected to it.
#[derive(Clone)]
pub struct SubscriptionConfig {
    pub start_from: StartFrom,
    pub default_buffer_size: usize,
    pub max_size: usize,
    pub concurrency_limit: Option<usize>,
    pub selector: Arc<dyn Fn(&crate::event::RecordedEvent) -> bool + Send + Sync>,
    pub partition_by: Arc<dyn Fn(&crate::event::RecordedEvent) -> PartitionKey + Send + Sync>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            start_from: StartFrom::Current,
            default_buffer_size: DEFAULT_BUFFER_SIZE,
            max_size: DEFAULT_MAX_SIZE,
            concurrency_limit: None,
            selector: Arc::new(|_| true),
            partition_by: Arc::new(|_| None),
        }
    }
}

impl std::fmt::Debug for SubscriptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionConfig")
            .field("start_from", &self.start_from)
            .field("default_buffer_size", &self.default_buffer_size)
            .field("max_size", &self.max_size)
            .field("concurrency_limit", &self.concurrency_limit)
            .finish_non_exhaustive()
    }
}

/// The watermarks and identity of one durable subscription, held by its
/// owning actor for the lifetime of the process.
///
/// Invariant: `last_ack <= last_sent <= last_received`.
#[derive(Debug, Clone)]
pub struct SubscriptionState {
    pub stream_id: StreamId,
    pub subscription_name: String,
    pub subscription_id: i64,
    pub config: SubscriptionConfig,

    /// Non-`None` iff this node currently holds leadership for this
    /// subscription.
    pub lock_ref: Option<LockRef>,

    /// Highest event number observed via `NOTIFY_EVENTS`, whether or not it
    /// has been enqueued yet.
    pub last_received: EventNumber,
    /// Highest event number enqueued (selector-accepted) or selector-dropped
    /// so far; the horizon up to which `catch_up_from_stream` next reads.
    pub last_sent: EventNumber,
    /// Highest contiguously acknowledged event number; mirrors the durable
    /// `last_seen` column.
    pub last_ack: EventNumber,
}

impl SubscriptionState {
    #[must_use]
    pub fn new(
        stream_id: StreamId,
        subscription_name: String,
        subscription_id: i64,
        config: SubscriptionConfig,
        last_seen: EventNumber,
    ) -> Self {
        Self {
            stream_id,
            subscription_name,
            subscription_id,
            config,
            lock_ref: None,
            last_received: last_seen,
            last_sent: last_seen,
            last_ack: last_seen,
        }
    }

    /// Resets the volatile watermarks on re-subscription from `disconnected`.
    ///
    /// Per the open question resolved in the specification: `last_sent` is
    /// reset back to `last_ack` (so events between the two are re-read and
    /// re-delivered — at-least-once is correct here) while `last_received`
    /// is left untouched, since it only records a horizon and re-reading it
    /// is always safe.
    pub fn reset_for_resubscription(&mut self) {
        self.last_sent = self.last_ack;
    }
}

/// Bundles the watermarks ([`SubscriptionState`]) with the connected
/// endpoints and pending queues ([`super::partition::SubscriberSet`]) that
/// the finite state machine needs to mutate in response to a single
/// trigger. One instance per subscription actor.
#[derive(Debug)]
pub struct SubscriptionContext {
    pub state: SubscriptionState,
    pub subscribers: super::partition::SubscriberSet,
}

impl SubscriptionContext {
    #[must_use]
    pub fn new(state: SubscriptionState) -> Self {
        Self { state, subscribers: super::partition::SubscriberSet::new() }
    }

    /// Purges all volatile delivery state on demotion to `disconnected`:
    /// in-flight events, pending queues, and the processed-id set are
    /// dropped, but the durable checkpoint (`last_ack`, mirrored in the
    /// `subscriptions` row) is untouched.
    pub fn purge(&mut self) {
        self.subscribers.purge();
        self.state.lock_ref = None;
    }
}
