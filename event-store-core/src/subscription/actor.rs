//! The subscription actor: the task that owns one subscription's
//! [`SubscriptionContext`], drives the finite state machine (C5) in
//! [`super::fsm`], and performs the I/O each transition's [`Effect`]s call
//! for.
//!
//! Effects are translated back into follow-up [`Trigger`]s and processed
//! through a small FIFO queue rather than recursive `async fn` calls — e.g.
//! `ReadForward` completing with events re-enters the FSM as `CatchUpRead`,
//! which itself may ask for another `ReadForward` if the catch-up window
//! was truncated at `max_size`. The actor processes one external message to
//! completion (including the whole resulting effect chain) before accepting
//! the next, per the mailbox-ordering invariant in §5 of the specification.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::bus::RegistrationBus;
use crate::error::{AckError, StorageError};
use crate::event::{EventNumber, RecordedEvent};
use crate::gateway::{AdvisoryLock, LockRef, StorageGateway};

use super::endpoint::{EventSink, SubscriptionHandle};
use super::fsm::{transition, Effect, State, Trigger};
use super::partition::EndpointId;
use super::state::SubscriptionContext;

/// Messages sent into a subscription actor's mailbox from the orchestrator
/// (C8) or a periodic retry timer.
pub enum ActorMessage {
    /// `SUBSCRIBE` — attempt (or retry) leadership acquisition.
    Subscribe,
    /// `CONNECT_SUBSCRIBER` — register a new endpoint.
    ConnectSubscriber { endpoint_id: EndpointId, sink: Arc<dyn EventSink>, buffer_size: usize },
    /// `UNSUBSCRIBE` — an endpoint disconnected voluntarily.
    UnsubscribeEndpoint { endpoint_id: EndpointId },
    /// The liveness handle for an endpoint fired.
    EndpointLost { endpoint_id: EndpointId },
    /// An ack from a connected endpoint; the reply channel carries the
    /// synchronous validation result back to the caller.
    Ack { endpoint_id: EndpointId, event_number: EventNumber, reply: oneshot::Sender<Result<(), AckError>> },
    /// `CATCH_UP` — an external heartbeat asking the subscription to check
    /// whether it has fallen behind (used to recover from a missed
    /// notification, per §4.4's failure note).
    CatchUp,
    /// Shut the actor down; in-flight effects are allowed to finish.
    Shutdown,
}

/// How often the actor retries leadership acquisition (when `initial` or
/// `disconnected`) and re-asks for a catch-up read (when it might have
/// fallen behind), per the "retry policy: external timer" note in §4.5.
/// Also the fallback recovery path for a missed `NOTIFY_EVENTS` (§4.4).
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Drives one subscription's finite state machine for the lifetime of the
/// process. Constructed and spawned by the supervisor (C7).
pub struct SubscriptionActor {
    ctx: SubscriptionContext,
    fsm_state: State,
    gateway: Arc<dyn StorageGateway>,
    lock: Arc<dyn AdvisoryLock>,
    bus: Arc<RegistrationBus<Vec<RecordedEvent>>>,
    sinks: HashMap<EndpointId, Arc<dyn EventSink>>,
    mailbox: mpsc::Receiver<ActorMessage>,
    bus_rx: Option<broadcast::Receiver<Vec<RecordedEvent>>>,
    lock_disconnections: broadcast::Receiver<LockRef>,
    retry_timer: Interval,
}

impl SubscriptionActor {
    #[must_use]
    pub fn new(
        ctx: SubscriptionContext,
        gateway: Arc<dyn StorageGateway>,
        lock: Arc<dyn AdvisoryLock>,
        bus: Arc<RegistrationBus<Vec<RecordedEvent>>>,
        mailbox: mpsc::Receiver<ActorMessage>,
    ) -> Self {
        let lock_disconnections = lock.disconnections();
        let mut retry_timer = interval(RETRY_INTERVAL);
        retry_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            ctx,
            fsm_state: State::Initial,
            gateway,
            lock,
            bus,
            sinks: HashMap::new(),
            mailbox,
            bus_rx: None,
            lock_disconnections,
            retry_timer,
        }
    }

    /// Runs the actor until its mailbox closes or a [`ActorMessage::Shutdown`]
    /// is received.
    pub async fn run(mut self) {
        loop {
            let bus_recv = async {
                match &mut self.bus_rx {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                Ok(lock_ref) = self.lock_disconnections.recv() => {
                    tracing::warn!(
                        subscription.name = %self.ctx.state.subscription_name,
                        stream_id = %self.ctx.state.stream_id,
                        "advisory lock session lost, demoting to disconnected"
                    );
                    self.apply(Trigger::LeaderDemoted { lock_ref }).await;
                }

                bus_event = bus_recv => {
                    match bus_event {
                        Ok(events) => self.apply(Trigger::NotifyEvents(events)).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!(
                                subscription.name = %self.ctx.state.subscription_name,
                                skipped,
                                "registration bus receiver lagged; falling back to catch-up"
                            );
                            self.apply(Trigger::CatchUp).await;
                        }
                        Err(broadcast::error::RecvError::Closed) => self.bus_rx = None,
                    }
                }

                msg = self.mailbox.recv() => {
                    match msg {
                        None | Some(ActorMessage::Shutdown) => break,
                        Some(message) => self.handle_message(message).await,
                    }
                }

                _ = self.retry_timer.tick() => {
                    // Retries leadership acquisition from `initial`/
                    // `disconnected` and re-asks for a catch-up read;
                    // a no-op in every other state.
                    self.apply(Trigger::Subscribe).await;
                    self.apply(Trigger::CatchUp).await;
                }
            }
        }

        if let Some(lock_ref) = self.ctx.state.lock_ref {
            self.lock.release(lock_ref).await;
        }
    }

    async fn handle_message(&mut self, message: ActorMessage) {
        match message {
            ActorMessage::Subscribe => self.apply(Trigger::Subscribe).await,
            ActorMessage::ConnectSubscriber { endpoint_id, sink, buffer_size } => {
                self.sinks.insert(endpoint_id, sink);
                self.apply(Trigger::ConnectSubscriber { endpoint_id, buffer_size }).await;
            }
            ActorMessage::UnsubscribeEndpoint { endpoint_id } => {
                self.apply(Trigger::UnsubscribeEndpoint { endpoint_id }).await;
                self.sinks.remove(&endpoint_id);
            }
            ActorMessage::EndpointLost { endpoint_id } => {
                self.apply(Trigger::EndpointLost { endpoint_id }).await;
                self.sinks.remove(&endpoint_id);
            }
            ActorMessage::Ack { endpoint_id, event_number, reply } => {
                let result = self.ctx.subscribers.peek_ack_validity(endpoint_id, event_number);
                self.apply(Trigger::Ack { endpoint_id, event_number }).await;
                let _ = reply.send(result);
            }
            ActorMessage::CatchUp => self.apply(Trigger::CatchUp).await,
            ActorMessage::Shutdown => {}
        }
    }

    /// Runs `trigger` and every follow-up trigger its effects produce, in
    /// FIFO order, to completion.
    async fn apply(&mut self, trigger: Trigger) {
        let mut queue = VecDeque::new();
        queue.push_back(trigger);

        while let Some(trigger) = queue.pop_front() {
            let (next_state, effects) = transition(&mut self.ctx, self.fsm_state, trigger);
            self.fsm_state = next_state;

            for effect in effects {
                if let Some(follow_up) = self.run_effect(effect).await {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    async fn run_effect(&mut self, effect: Effect) -> Option<Trigger> {
        match effect {
            Effect::AcquireLeadership => self.acquire_leadership().await,
            Effect::SubscribeRegistrationBus => {
                self.bus_rx = Some(self.bus.subscribe(&self.ctx.state.stream_id));
                None
            }
            Effect::ReadForward { from, max_count } => self.read_forward(from, max_count).await,
            Effect::PersistAck { last_seen } => {
                self.persist_ack(last_seen).await;
                None
            }
            Effect::NotifySubscribed { endpoint_id } => {
                self.notify_subscribed(endpoint_id).await;
                None
            }
            Effect::Deliver(deliveries) => {
                for (endpoint_id, events) in deliveries {
                    if let Some(sink) = self.sinks.get(&endpoint_id) {
                        sink.deliver(events).await;
                    }
                }
                None
            }
        }
    }

    async fn acquire_leadership(&mut self) -> Option<Trigger> {
        let attempt = self
            .gateway
            .subscribe_to_stream(
                &self.ctx.state.stream_id,
                &self.ctx.state.subscription_name,
                self.ctx.state.config.start_from,
            )
            .await;

        let (subscription_id, last_seen) = match attempt {
            Ok(row) => row,
            Err(err) => {
                tracing::warn!(
                    subscription.name = %self.ctx.state.subscription_name,
                    error = %err,
                    "failed to attach to durable subscription row, will retry"
                );
                return None;
            }
        };
        self.ctx.state.subscription_id = subscription_id;

        match self.lock.try_acquire(subscription_id).await {
            Ok(lock_ref) => Some(Trigger::LockAcquired { lock_ref, last_seen }),
            Err(crate::error::LockError::AlreadyTaken) => {
                tracing::debug!(
                    subscription.name = %self.ctx.state.subscription_name,
                    subscription_id,
                    "another node already holds leadership for this subscription"
                );
                Some(Trigger::LockDenied)
            }
            Err(err) => {
                tracing::warn!(error = %err, "advisory lock acquisition failed, will retry");
                None
            }
        }
    }

    async fn read_forward(&mut self, from: EventNumber, max_count: usize) -> Option<Trigger> {
        match self.gateway.read_stream_forward(&self.ctx.state.stream_id, from, max_count).await {
            Ok(events) => Some(Trigger::CatchUpRead { events }),
            Err(StorageError::StreamNotFound) => Some(Trigger::CatchUpStreamNotFound),
            Err(err) => {
                tracing::warn!(
                    subscription.name = %self.ctx.state.subscription_name,
                    error = %err,
                    "catch-up read failed, keeping state for next trigger"
                );
                None
            }
        }
    }

    async fn persist_ack(&mut self, last_seen: EventNumber) {
        if self.ctx.state.lock_ref.is_none() {
            // Lost leadership between the FSM decision and effect
            // execution; only the leader is allowed to persist acks.
            return;
        }
        if let Err(err) = self
            .gateway
            .ack_last_seen_event(&self.ctx.state.stream_id, &self.ctx.state.subscription_name, last_seen)
            .await
        {
            tracing::warn!(
                subscription.name = %self.ctx.state.subscription_name,
                last_seen,
                error = %err,
                "failed to persist checkpoint, will retry on next advance"
            );
        }
    }

    async fn notify_subscribed(&mut self, endpoint_id: EndpointId) {
        let Some(sink) = self.sinks.get(&endpoint_id) else { return };
        let handle = SubscriptionHandle {
            stream_id: self.ctx.state.stream_id.clone(),
            subscription_name: self.ctx.state.subscription_name.clone(),
            endpoint_id,
        };
        sink.subscribed(handle).await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::error::LockError;
    use crate::event::{ExpectedVersion, StartFrom, StreamId, StreamVersion};
    use crate::gateway::{NewEvent, StorageResult};
    use crate::subscription::endpoint::{identity_mapper, ChannelEndpoint, ChannelMessage, MappedSink};
    use crate::subscription::state::{SubscriptionConfig, SubscriptionState};

    fn event(n: EventNumber) -> RecordedEvent {
        RecordedEvent::new(Uuid::new_v4(), n, n, "stream-A", "test-event", serde_json::json!({}), serde_json::json!({}), Utc::now())
    }

    /// An in-memory [`StorageGateway`] double backing a single stream, for
    /// driving the actor end-to-end without a database.
    struct FakeGateway {
        events: StdMutex<Vec<RecordedEvent>>,
        subscriptions: StdMutex<StdHashMap<(String, String), (i64, Option<EventNumber>)>>,
        next_sub_id: AtomicI64,
    }

    impl FakeGateway {
        fn new(events: Vec<RecordedEvent>) -> Self {
            Self { events: StdMutex::new(events), subscriptions: StdMutex::new(StdHashMap::new()), next_sub_id: AtomicI64::new(1) }
        }

        fn last_seen(&self, stream_id: &StreamId, subscription_name: &str) -> Option<EventNumber> {
            let subs = self.subscriptions.lock().unwrap();
            subs.get(&(stream_id.as_str().to_owned(), subscription_name.to_owned())).and_then(|(_, seen)| *seen)
        }
    }

    #[async_trait::async_trait]
    impl StorageGateway for FakeGateway {
        async fn create_stream(&self, _stream_id: &str) -> StorageResult<i64> {
            Ok(1)
        }

        async fn append_events(
            &self,
            _stream_id: &str,
            _expected_version: ExpectedVersion,
            _events: Vec<NewEvent>,
        ) -> StorageResult<StreamVersion> {
            unimplemented!("not exercised by the subscription actor")
        }

        async fn read_stream_forward(
            &self,
            _stream_id: &StreamId,
            from: i64,
            max_count: usize,
        ) -> StorageResult<Vec<RecordedEvent>> {
            let events = self.events.lock().unwrap();
            Ok(events.iter().filter(|e| e.event_number >= from).take(max_count).cloned().collect())
        }

        async fn subscribe_to_stream(
            &self,
            stream_id: &StreamId,
            subscription_name: &str,
            start_from: StartFrom,
        ) -> StorageResult<(i64, Option<EventNumber>)> {
            let mut subs = self.subscriptions.lock().unwrap();
            let key = (stream_id.as_str().to_owned(), subscription_name.to_owned());
            if let Some(existing) = subs.get(&key) {
                return Ok(*existing);
            }
            let last_seen = match start_from {
                StartFrom::Origin => None,
                StartFrom::Current => Some(0),
                StartFrom::EventNumber(n) => Some(n - 1),
            };
            let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
            subs.insert(key, (id, last_seen));
            Ok((id, last_seen))
        }

        async fn ack_last_seen_event(
            &self,
            stream_id: &StreamId,
            subscription_name: &str,
            last_seen: EventNumber,
        ) -> StorageResult<()> {
            let mut subs = self.subscriptions.lock().unwrap();
            if let Some(entry) = subs.get_mut(&(stream_id.as_str().to_owned(), subscription_name.to_owned())) {
                if entry.1.map_or(true, |current| last_seen > current) {
                    entry.1 = Some(last_seen);
                }
            }
            Ok(())
        }

        async fn delete_subscription(&self, stream_id: &StreamId, subscription_name: &str) -> StorageResult<()> {
            let mut subs = self.subscriptions.lock().unwrap();
            subs.remove(&(stream_id.as_str().to_owned(), subscription_name.to_owned()));
            Ok(())
        }
    }

    /// An in-memory [`AdvisoryLock`] double. `deny` makes every acquisition
    /// attempt fail with `AlreadyTaken`, simulating a peer node already
    /// holding leadership (§8 S5).
    struct FakeLock {
        held: StdMutex<StdHashMap<i64, LockRef>>,
        next_ref: AtomicU64,
        disconnect_tx: broadcast::Sender<LockRef>,
        deny: bool,
    }

    impl FakeLock {
        fn new(deny: bool) -> Self {
            let (disconnect_tx, _) = broadcast::channel(16);
            Self { held: StdMutex::new(StdHashMap::new()), next_ref: AtomicU64::new(1), disconnect_tx, deny }
        }

        /// Simulates the dedicated advisory-lock session dying: every
        /// currently-held lock is demoted, matching C2's observed behaviour.
        fn simulate_session_loss(&self) {
            let held = self.held.lock().unwrap();
            for lock_ref in held.values() {
                let _ = self.disconnect_tx.send(*lock_ref);
            }
        }
    }

    #[async_trait::async_trait]
    impl AdvisoryLock for FakeLock {
        async fn try_acquire(&self, key: i64) -> Result<LockRef, LockError> {
            if self.deny {
                return Err(LockError::AlreadyTaken);
            }
            let mut held = self.held.lock().unwrap();
            if held.contains_key(&key) {
                return Err(LockError::AlreadyTaken);
            }
            let lock_ref = LockRef(self.next_ref.fetch_add(1, Ordering::Relaxed));
            held.insert(key, lock_ref);
            Ok(lock_ref)
        }

        async fn release(&self, lock_ref: LockRef) {
            let mut held = self.held.lock().unwrap();
            held.retain(|_, v| *v != lock_ref);
        }

        fn disconnections(&self) -> broadcast::Receiver<LockRef> {
            self.disconnect_tx.subscribe()
        }
    }

    fn spawn_actor(
        stream_id: StreamId,
        subscription_name: &str,
        config: SubscriptionConfig,
        gateway: Arc<dyn StorageGateway>,
        lock: Arc<dyn AdvisoryLock>,
        bus: Arc<RegistrationBus<Vec<RecordedEvent>>>,
    ) -> (mpsc::Sender<ActorMessage>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);
        let state = SubscriptionState::new(stream_id, subscription_name.to_owned(), 0, config, 0);
        let ctx = SubscriptionContext::new(state);
        let actor = SubscriptionActor::new(ctx, gateway, lock, bus, rx);
        let handle = tokio::spawn(actor.run());
        (tx, handle)
    }

    async fn connect_channel_endpoint(
        tx: &mpsc::Sender<ActorMessage>,
        endpoint_id: EndpointId,
        buffer_size: usize,
    ) -> mpsc::Receiver<ChannelMessage<RecordedEvent>> {
        let (endpoint, rx) = ChannelEndpoint::<RecordedEvent>::new(16);
        let sink: Arc<dyn EventSink> = Arc::new(MappedSink::new(Arc::new(endpoint), identity_mapper()));
        tx.send(ActorMessage::ConnectSubscriber { endpoint_id, sink, buffer_size }).await.unwrap();
        rx
    }

    // S1 — cold catch-up, driven through the real actor loop: five events
    // already exist before anyone subscribes; subscribing from `:origin`
    // must deliver all five, and acking the last one must persist the
    // durable checkpoint through the (fake) storage gateway.
    #[tokio::test]
    async fn s1_actor_delivers_cold_backlog_and_persists_ack() {
        let stream_id = StreamId::from("stream-A");
        let gateway = Arc::new(FakeGateway::new((1..=5).map(event).collect()));
        let lock = Arc::new(FakeLock::new(false));
        let bus = Arc::new(RegistrationBus::default());

        let config = SubscriptionConfig { start_from: StartFrom::Origin, max_size: 10, ..SubscriptionConfig::default() };
        let (tx, join) = spawn_actor(stream_id.clone(), "sub1", config, gateway.clone(), lock, bus);

        let mut rx = connect_channel_endpoint(&tx, 1, 10).await;
        tx.send(ActorMessage::Subscribe).await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), ChannelMessage::Subscribed(_)));
        let ChannelMessage::Events(events) = rx.recv().await.unwrap() else { panic!("expected an events batch") };
        assert_eq!(events.iter().map(|e| e.event_number).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(ActorMessage::Ack { endpoint_id: 1, event_number: 5, reply: reply_tx }).await.unwrap();
        reply_rx.await.unwrap().expect("ack of an in-flight event must validate");

        assert_eq!(gateway.last_seen(&stream_id, "sub1"), Some(5), "durable checkpoint persisted after the ack");

        tx.send(ActorMessage::Shutdown).await.unwrap();
        join.await.unwrap();
    }

    // A node that loses the leadership race stays in `initial` rather than
    // delivering anything (§4.5, §8 S5's starting condition).
    #[tokio::test]
    async fn initial_stays_put_when_advisory_lock_is_already_held_elsewhere() {
        let stream_id = StreamId::from("stream-A");
        let gateway = Arc::new(FakeGateway::new(vec![event(1)]));
        let lock = Arc::new(FakeLock::new(true));
        let bus = Arc::new(RegistrationBus::default());

        let config = SubscriptionConfig { start_from: StartFrom::Origin, ..SubscriptionConfig::default() };
        let (tx, join) = spawn_actor(stream_id, "sub1", config, gateway, lock, bus);

        let mut rx = connect_channel_endpoint(&tx, 1, 10).await;
        tx.send(ActorMessage::Subscribe).await.unwrap();

        // No `Subscribed` notification should arrive: leadership was denied,
        // so the subscription never leaves `initial`.
        let outcome = tokio::time::timeout(std::time::Duration::from_millis(100), rx.recv()).await;
        assert!(outcome.is_err(), "no message should be delivered while leadership is denied");

        tx.send(ActorMessage::Shutdown).await.unwrap();
        join.await.unwrap();
    }

    // Losing the advisory-lock session demotes the subscription to
    // `disconnected`, purging in-flight state but not the durable
    // checkpoint already persisted (§4.2, §7).
    #[tokio::test]
    async fn advisory_lock_session_loss_demotes_to_disconnected() {
        let stream_id = StreamId::from("stream-A");
        let gateway = Arc::new(FakeGateway::new((1..=2).map(event).collect()));
        let lock = Arc::new(FakeLock::new(false));
        let bus = Arc::new(RegistrationBus::default());

        let config = SubscriptionConfig { start_from: StartFrom::Origin, max_size: 10, ..SubscriptionConfig::default() };
        let (tx, join) = spawn_actor(stream_id.clone(), "sub1", config, gateway.clone(), lock.clone(), bus);

        let mut rx = connect_channel_endpoint(&tx, 1, 10).await;
        tx.send(ActorMessage::Subscribe).await.unwrap();
        assert!(matches!(rx.recv().await.unwrap(), ChannelMessage::Subscribed(_)));
        let ChannelMessage::Events(_) = rx.recv().await.unwrap() else { panic!("expected an events batch") };

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(ActorMessage::Ack { endpoint_id: 1, event_number: 2, reply: reply_tx }).await.unwrap();
        reply_rx.await.unwrap().unwrap();
        assert_eq!(gateway.last_seen(&stream_id, "sub1"), Some(2));

        lock.simulate_session_loss();

        // give the actor's select loop a turn to observe the disconnection;
        // the durable checkpoint from before the demotion must be unaffected.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(gateway.last_seen(&stream_id, "sub1"), Some(2), "demotion does not roll back the durable checkpoint");

        tx.send(ActorMessage::Shutdown).await.unwrap();
        join.await.unwrap();
    }
}
