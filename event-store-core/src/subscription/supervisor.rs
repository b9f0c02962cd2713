//! Subscription supervisor & orchestrator (C7, C8): the name registry
//! keyed by `(stream_id, subscription_name)`, subscription-process
//! lifecycle, and the public entry points a caller uses to attach
//! consumers to a subscription.
//!
//! Grounded on `tokio::task::JoinSet`, which tracks every subscription
//! actor so the supervisor can be drained on shutdown. Restart policy is
//! one-for-all in spirit: a fresh actor is always seeded from durable
//! state only (the row in `subscriptions`, re-read via
//! `subscribe_to_stream`), never from the volatile queues of a previous
//! incarnation, so recovering a crashed actor is equivalent to resuming it
//! from `disconnected`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::bus::RegistrationBus;
use crate::error::{AckError, SubscribeError};
use crate::event::{EventNumber, RecordedEvent, StartFrom, StreamId};
use crate::gateway::{AdvisoryLock, StorageGateway};

use super::actor::{ActorMessage, SubscriptionActor};
use super::endpoint::{EventSink, MappedSink, SubscriberEndpoint, SubscriptionHandle};
use super::partition::{EndpointId, PartitionKey};
use super::state::{SubscriptionConfig, SubscriptionContext, SubscriptionState};

const MAILBOX_CAPACITY: usize = 256;

/// Options accepted by [`Supervisor::subscribe`], mirroring §6's
/// `opts` bag.
pub struct SubscribeOptions<T> {
    /// Where a brand-new subscription should begin reading from. Ignored
    /// when attaching to an already-running subscription process.
    pub start_from: StartFrom,
    /// Transforms a [`RecordedEvent`] into the type the endpoint receives.
    pub mapper: Arc<dyn Fn(&RecordedEvent) -> T + Send + Sync>,
    /// Drop at enqueue time when this returns `false`.
    pub selector: Arc<dyn Fn(&RecordedEvent) -> bool + Send + Sync>,
    /// Derives the ordering-affinity key for an event.
    pub partition_by: Arc<dyn Fn(&RecordedEvent) -> PartitionKey + Send + Sync>,
    /// Per-endpoint in-flight cap.
    pub buffer_size: usize,
    /// Queue cap across all partitions.
    pub max_size: usize,
    /// Maximum concurrent endpoints this subscription name may accept. `None`
    /// means exactly one.
    pub concurrency_limit: Option<usize>,
}

impl<T> Default for SubscribeOptions<T>
where
    T: From<RecordedEvent>,
{
    fn default() -> Self {
        Self {
            start_from: StartFrom::Current,
            mapper: Arc::new(|event: &RecordedEvent| T::from(event.clone())),
            selector: Arc::new(|_| true),
            partition_by: Arc::new(|_| None),
            buffer_size: super::state::DEFAULT_BUFFER_SIZE,
            max_size: super::state::DEFAULT_MAX_SIZE,
            concurrency_limit: None,
        }
    }
}

struct RunningSubscription {
    mailbox: mpsc::Sender<ActorMessage>,
    concurrency_limit: Option<usize>,
    connected: usize,
}

/// Owns the registry of live subscription processes and exposes the
/// public subscribe/unsubscribe/delete/ack API (C8) on top of the
/// supervision tree (C7).
pub struct Supervisor {
    gateway: Arc<dyn StorageGateway>,
    lock: Arc<dyn AdvisoryLock>,
    bus: Arc<RegistrationBus<Vec<RecordedEvent>>>,
    registry: Mutex<HashMap<(StreamId, String), RunningSubscription>>,
    next_endpoint_id: AtomicU64,
    tasks: Mutex<JoinSet<()>>,
}

impl Supervisor {
    #[must_use]
    pub fn new(
        gateway: Arc<dyn StorageGateway>,
        lock: Arc<dyn AdvisoryLock>,
        bus: Arc<RegistrationBus<Vec<RecordedEvent>>>,
    ) -> Self {
        Self {
            gateway,
            lock,
            bus,
            registry: Mutex::new(HashMap::new()),
            next_endpoint_id: AtomicU64::new(1),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// `subscribe_to_stream` (§6): ensures the subscription process for
    /// `(stream_id, subscription_name)` exists, connects a new endpoint to
    /// it, and returns the handle used for subsequent acks.
    pub fn subscribe<T>(
        &self,
        stream_id: StreamId,
        subscription_name: String,
        endpoint: Arc<dyn SubscriberEndpoint<T>>,
        opts: SubscribeOptions<T>,
    ) -> Result<SubscriptionHandle, SubscribeError>
    where
        T: Send + Sync + 'static,
    {
        let endpoint_id = self.next_endpoint_id.fetch_add(1, Ordering::Relaxed);
        let sink: Arc<dyn EventSink> = Arc::new(MappedSink::new(endpoint, opts.mapper.clone()));

        let mut registry = self.registry.lock().expect("supervisor registry poisoned");
        let key = (stream_id.clone(), subscription_name.clone());

        let mailbox = match registry.get_mut(&key) {
            Some(running) => {
                let limit = running.concurrency_limit.unwrap_or(1);
                if running.connected >= limit {
                    return Err(SubscribeError::SubscriptionAlreadyExists);
                }
                running.connected += 1;
                running.mailbox.clone()
            }
            None => {
                let config = SubscriptionConfig {
                    start_from: opts.start_from,
                    default_buffer_size: opts.buffer_size,
                    max_size: opts.max_size,
                    concurrency_limit: opts.concurrency_limit,
                    selector: opts.selector.clone(),
                    partition_by: opts.partition_by.clone(),
                };
                let mailbox = self.spawn_subscription(stream_id.clone(), subscription_name.clone(), config);
                registry.insert(
                    key,
                    RunningSubscription { mailbox: mailbox.clone(), concurrency_limit: opts.concurrency_limit, connected: 1 },
                );
                mailbox
            }
        };
        drop(registry);

        let mailbox_for_connect = mailbox.clone();
        let buffer_size = opts.buffer_size;
        tokio::spawn(async move {
            let _ = mailbox_for_connect.send(ActorMessage::ConnectSubscriber { endpoint_id, sink, buffer_size }).await;
        });

        Ok(SubscriptionHandle { stream_id, subscription_name, endpoint_id })
    }

    /// `unsubscribe_from_stream` (§6): disconnects the specific endpoint
    /// identified by `handle`. If it was the last endpoint, the
    /// subscription process transitions to `unsubscribed` and may be
    /// recycled by a later `subscribe` call for the same name.
    pub async fn unsubscribe_from_stream(&self, handle: &SubscriptionHandle) {
        let key = (handle.stream_id.clone(), handle.subscription_name.clone());
        let mailbox = {
            let mut registry = self.registry.lock().expect("supervisor registry poisoned");
            let Some(running) = registry.get_mut(&key) else { return };
            running.connected = running.connected.saturating_sub(1);
            running.mailbox.clone()
        };
        let _ = mailbox.send(ActorMessage::UnsubscribeEndpoint { endpoint_id: handle.endpoint_id() }).await;
    }

    /// `delete_subscription` (§6): shuts the subscription process down and
    /// removes its durable row. Idempotent if no process is running.
    pub async fn delete_subscription(&self, stream_id: &StreamId, subscription_name: &str) -> Result<(), crate::error::StorageError> {
        let key = (stream_id.clone(), subscription_name.to_owned());
        let mailbox = {
            let mut registry = self.registry.lock().expect("supervisor registry poisoned");
            registry.remove(&key).map(|running| running.mailbox)
        };
        if let Some(mailbox) = mailbox {
            let _ = mailbox.send(ActorMessage::Shutdown).await;
        }
        self.gateway.delete_subscription(stream_id, subscription_name).await
    }

    /// `ack` (§6): forwards an acknowledgement to the owning subscription
    /// process and awaits its synchronous validity check
    /// (`{unknown_subscriber}`/`{invalid_ack}`).
    pub async fn ack(&self, handle: &SubscriptionHandle, event_number: EventNumber) -> Result<(), AckError> {
        let key = (handle.stream_id.clone(), handle.subscription_name.clone());
        let mailbox = {
            let registry = self.registry.lock().expect("supervisor registry poisoned");
            registry.get(&key).map(|running| running.mailbox.clone())
        };
        let Some(mailbox) = mailbox else { return Err(AckError::UnknownSubscriber) };

        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let sent = mailbox
            .send(ActorMessage::Ack { endpoint_id: handle.endpoint_id(), event_number, reply: reply_tx })
            .await;
        if sent.is_err() {
            return Err(AckError::UnknownSubscriber);
        }
        reply_rx.await.unwrap_or(Err(AckError::UnknownSubscriber))
    }

    fn spawn_subscription(
        &self,
        stream_id: StreamId,
        subscription_name: String,
        config: SubscriptionConfig,
    ) -> mpsc::Sender<ActorMessage> {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let gateway = self.gateway.clone();
        let lock = self.lock.clone();
        let bus = self.bus.clone();
        let tx_for_kickoff = tx.clone();

        let mut tasks = self.tasks.lock().expect("supervisor task set poisoned");
        tasks.spawn(async move {
            let state = SubscriptionState::new(stream_id.clone(), subscription_name.clone(), 0, config, 0);
            let ctx = SubscriptionContext::new(state);
            let actor = SubscriptionActor::new(ctx, gateway, lock, bus, rx);
            let _ = tx_for_kickoff.send(ActorMessage::Subscribe).await;
            actor.run().await;
        });

        tx
    }
}
