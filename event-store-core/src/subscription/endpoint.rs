//! The consumer-facing half of the Subscription API (§6): the endpoint
//! trait a caller implements (or adapts from a channel), the per-mapper type
//! erasure that lets the subscription actor hold a homogeneous collection of
//! endpoints regardless of their `mapper`'s output type, and the handle
//! returned to a caller on `subscribe_to_stream`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::event::{EventNumber, RecordedEvent, StreamId};

use super::partition::EndpointId;

/// Opaque handle identifying one subscription to its connected endpoints,
/// used as the first argument to `ack`.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    pub stream_id: StreamId,
    pub subscription_name: String,
    pub(crate) endpoint_id: EndpointId,
}

impl SubscriptionHandle {
    #[must_use]
    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint_id
    }
}

/// One consumer attached to a subscription. `T` is the type produced by the
/// subscription's `mapper` from a [`RecordedEvent`].
///
/// A default channel-based adapter ([`ChannelEndpoint`]) is provided for
/// callers who would rather `.recv()` in a loop than implement this trait
/// directly.
#[async_trait]
pub trait SubscriberEndpoint<T>: Send + Sync {
    /// Called once, right after the endpoint is registered (or immediately,
    /// if the subscription was already past `initial` when it connected).
    async fn on_subscribed(&self, handle: SubscriptionHandle);

    /// Called with a batch of events in enqueue order. Must not block
    /// indefinitely: the subscription actor awaits this call, and delivery
    /// to other endpoints of the same subscription is serialized behind it.
    async fn on_events(&self, events: Vec<T>);
}

/// Type-erased sink the subscription actor delivers to, bridging a
/// `RecordedEvent` batch through a subscription's `mapper` to a concrete
/// `SubscriberEndpoint<T>`. Lets the actor hold heterogeneous endpoints
/// (different `T`s across subscriptions, same `T` within one) behind a
/// single non-generic type.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn subscribed(&self, handle: SubscriptionHandle);
    async fn deliver(&self, events: Vec<RecordedEvent>);
}

/// Adapts an `Arc<dyn SubscriberEndpoint<T>>` plus a `mapper` closure into
/// an [`EventSink`].
pub struct MappedSink<T> {
    endpoint: Arc<dyn SubscriberEndpoint<T>>,
    mapper: Arc<dyn Fn(&RecordedEvent) -> T + Send + Sync>,
}

impl<T> MappedSink<T> {
    #[must_use]
    pub fn new(
        endpoint: Arc<dyn SubscriberEndpoint<T>>,
        mapper: Arc<dyn Fn(&RecordedEvent) -> T + Send + Sync>,
    ) -> Self {
        Self { endpoint, mapper }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> EventSink for MappedSink<T> {
    async fn subscribed(&self, handle: SubscriptionHandle) {
        self.endpoint.on_subscribed(handle).await;
    }

    async fn deliver(&self, events: Vec<RecordedEvent>) {
        let mapped = events.iter().map(|e| (self.mapper)(e)).collect();
        self.endpoint.on_events(mapped).await;
    }
}

/// The identity mapper, used when a caller does not supply one: the
/// endpoint receives [`RecordedEvent`] values directly.
#[must_use]
pub fn identity_mapper() -> Arc<dyn Fn(&RecordedEvent) -> RecordedEvent + Send + Sync> {
    Arc::new(|event: &RecordedEvent| event.clone())
}

/// A boxed future, used where `async_trait` is overkill (the channel
/// adapter implements the trait directly without macro expansion so it can
/// stay a plain, cheaply-clonable struct).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Message delivered to a [`ChannelEndpoint`] consumer.
#[derive(Debug, Clone)]
pub enum ChannelMessage<T> {
    Subscribed(SubscriptionHandle),
    Events(Vec<T>),
}

/// A [`SubscriberEndpoint`] adapter backed by a `tokio::sync::mpsc` channel,
/// for callers who prefer to `.recv()` in a loop over implementing the
/// trait. Grounded on the teacher's stream-based consumer ergonomics
/// (`eventually::subscription::EventStream`), adapted here from a pull-based
/// stream to push-based delivery into a bounded channel, since the
/// subscription actor must not block indefinitely waiting on a consumer
/// that may never poll.
pub struct ChannelEndpoint<T> {
    sender: tokio::sync::mpsc::Sender<ChannelMessage<T>>,
}

impl<T> ChannelEndpoint<T> {
    /// Creates a new channel pair. `capacity` bounds how far this endpoint
    /// may lag before the subscription actor's delivery to it blocks —
    /// distinct from `buffer_size`, which bounds in-flight *events* at the
    /// subscriber-set level.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, tokio::sync::mpsc::Receiver<ChannelMessage<T>>) {
        let (sender, receiver) = tokio::sync::mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> SubscriberEndpoint<T> for ChannelEndpoint<T> {
    async fn on_subscribed(&self, handle: SubscriptionHandle) {
        let _ = self.sender.send(ChannelMessage::Subscribed(handle)).await;
    }

    async fn on_events(&self, events: Vec<T>) {
        let _ = self.sender.send(ChannelMessage::Events(events)).await;
    }
}

/// A single acknowledgement sent by a consumer.
#[derive(Debug, Clone, Copy)]
pub struct Ack {
    pub endpoint_id: EndpointId,
    pub event_number: EventNumber,
}
