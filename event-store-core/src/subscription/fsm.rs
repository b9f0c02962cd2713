//! The per-subscription finite state machine (C5).
//!
//! Implemented as a closed tagged `enum State` dispatched by a single
//! [`transition`] function, rather than state checks scattered across
//! methods. `transition` is synchronous and does no I/O: partition
//! bookkeeping (enqueue, fan-out, ack, checkpoint accounting) happens
//! in-place against the owning [`SubscriptionContext`] because it is pure
//! data-structure manipulation, but anything that talks to storage, the
//! advisory lock, the registration bus, or a connected endpoint is returned
//! as an [`Effect`] for the owning actor task to execute. This is what
//! keeps the FSM itself unit-testable without a database or a runtime.

use crate::event::{EventNumber, RecordedEvent};
use crate::gateway::LockRef;

use super::partition::{Deliveries, EndpointId};
use super::state::SubscriptionContext;

/// States of the per-subscription machine (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initial,
    RequestCatchUp,
    CatchingUp,
    Subscribed,
    MaxCapacity,
    Disconnected,
    Unsubscribed,
}

/// Inputs that drive a state transition.
#[derive(Debug)]
pub enum Trigger {
    /// `SUBSCRIBE` — attempt (or retry) acquisition of leadership.
    Subscribe,
    /// A storage-backed acquisition attempt completed.
    LockAcquired { lock_ref: LockRef, last_seen: Option<EventNumber> },
    LockDenied,
    /// `CONNECT_SUBSCRIBER` — a new endpoint joined, any state.
    ConnectSubscriber { endpoint_id: EndpointId, buffer_size: usize },
    /// `UNSUBSCRIBE` — an endpoint left voluntarily, any state.
    UnsubscribeEndpoint { endpoint_id: EndpointId },
    /// The liveness handle for an endpoint fired.
    EndpointLost { endpoint_id: EndpointId },
    /// `ACK` from a connected endpoint.
    Ack { endpoint_id: EndpointId, event_number: EventNumber },
    /// `CATCH_UP` — an external trigger (heartbeat, explicit request) asking
    /// the subscription to check whether it has fallen behind.
    CatchUp,
    /// `NOTIFY_EVENTS` — the notification pipeline delivered a contiguous
    /// batch for this subscription's topic.
    NotifyEvents(Vec<RecordedEvent>),
    /// A `read_stream_forward` issued by `catch_up_from_stream` completed.
    CatchUpRead { events: Vec<RecordedEvent> },
    CatchUpStreamNotFound,
    /// `{disconnected, lock_ref}` from the advisory-lock manager (C2).
    LeaderDemoted { lock_ref: LockRef },
}

/// Side effects a transition wants performed. Executed by the actor task
/// after `transition` returns; never executed by `transition` itself.
#[derive(Debug)]
pub enum Effect {
    /// Insert/find the durable row, then `try_advisory_lock`.
    AcquireLeadership,
    /// Subscribe to the registration bus topic for this subscription's
    /// stream id (or `$all`).
    SubscribeRegistrationBus,
    /// `read_stream_forward(stream_id, from, max_count)`.
    ReadForward { from: EventNumber, max_count: usize },
    /// Persist the current `last_ack` via `ack_last_seen_event`, batched
    /// once per fan-out round.
    PersistAck { last_seen: EventNumber },
    /// Notify one endpoint that it is now subscribed.
    NotifySubscribed { endpoint_id: EndpointId },
    /// Deliver a batch of events to endpoints, keyed by endpoint id, in
    /// enqueue order.
    Deliver(Deliveries),
}

/// Runs one transition of the FSM. Mutates `ctx` in place for any
/// synchronous bookkeeping (enqueue, fan-out, ack, checkpoint) and returns
/// the new [`State`] plus the [`Effect`]s the actor must perform.
pub fn transition(ctx: &mut SubscriptionContext, state: State, trigger: Trigger) -> (State, Vec<Effect>) {
    match trigger {
        // -- global, any-state events, handled before per-state dispatch --
        Trigger::ConnectSubscriber { endpoint_id, buffer_size } => {
            ctx.subscribers.connect(endpoint_id, buffer_size);
            let mut effects = Vec::new();
            if state != State::Initial && state != State::Unsubscribed {
                effects.push(Effect::NotifySubscribed { endpoint_id });
            }
            let next = if state == State::Unsubscribed { State::RequestCatchUp } else { state };
            return (next, effects);
        }
        Trigger::UnsubscribeEndpoint { endpoint_id } => {
            ctx.subscribers.disconnect(endpoint_id);
            let next = if ctx.subscribers.subscriber_count() == 0 { State::Unsubscribed } else { state };
            return (next, Vec::new());
        }
        Trigger::EndpointLost { endpoint_id } => {
            ctx.subscribers.endpoint_lost(endpoint_id);
            let next = if ctx.subscribers.subscriber_count() == 0 { State::Unsubscribed } else { state };
            return (next, Vec::new());
        }
        Trigger::LeaderDemoted { lock_ref } => {
            if ctx.state.lock_ref == Some(lock_ref) {
                ctx.purge();
                return (State::Disconnected, Vec::new());
            }
            return (state, Vec::new());
        }
        _ => {}
    }

    if state == State::Unsubscribed {
        // Terminal for everything else; the supervisor may recycle.
        return (State::Unsubscribed, Vec::new());
    }

    match (state, trigger) {
        // NOTIFY_EVENTS outside `subscribed` only updates the horizon.
        (s, Trigger::NotifyEvents(events)) if s != State::Subscribed && s != State::Initial => {
            if let Some(last) = events.last() {
                ctx.state.last_received = ctx.state.last_received.max(last.event_number);
            }
            (s, Vec::new())
        }

        // -- initial ---------------------------------------------------
        (State::Initial, Trigger::Subscribe) => (State::Initial, vec![Effect::AcquireLeadership]),
        (State::Initial, Trigger::LockAcquired { lock_ref, last_seen }) => {
            apply_lock_acquired(ctx, lock_ref, last_seen)
        }
        (State::Initial, Trigger::LockDenied) => (State::Initial, Vec::new()),

        // -- request_catch_up -------------------------------------------
        (State::RequestCatchUp, Trigger::CatchUp) => (
            State::RequestCatchUp,
            vec![read_forward_effect(ctx)],
        ),
        (State::RequestCatchUp, Trigger::Ack { endpoint_id, event_number }) => {
            let mut effects = ack_effects(ctx, endpoint_id, event_number);
            effects.push(read_forward_effect(ctx));
            (State::RequestCatchUp, effects)
        }
        (State::RequestCatchUp, Trigger::CatchUpStreamNotFound) => (State::Subscribed, Vec::new()),
        (State::RequestCatchUp, Trigger::CatchUpRead { events }) => apply_catch_up_read(ctx, events),

        // -- catching_up --------------------------------------------------
        (State::CatchingUp, Trigger::Ack { endpoint_id, event_number }) => {
            let mut effects = ack_effects(ctx, endpoint_id, event_number);
            effects.push(read_forward_effect(ctx));
            (State::CatchingUp, effects)
        }
        (State::CatchingUp, Trigger::CatchUpStreamNotFound) => (State::Subscribed, Vec::new()),
        (State::CatchingUp, Trigger::CatchUpRead { events }) => apply_catch_up_read(ctx, events),

        // -- subscribed -----------------------------------------------------
        (State::Subscribed, Trigger::NotifyEvents(events)) => {
            let first = events.first().map(|e| e.event_number);
            match first {
                Some(n) if n < ctx.state.last_received + 1 => (State::Subscribed, Vec::new()),
                Some(n) if n > ctx.state.last_received + 1 => (State::RequestCatchUp, Vec::new()),
                _ => {
                    let highest = events.last().map(|e| e.event_number);
                    let effects = enqueue_and_fan_out(ctx, events);
                    if let Some(highest) = highest {
                        ctx.state.last_received = ctx.state.last_received.max(highest);
                    }
                    let next = if ctx.subscribers.queue_size() >= ctx.state.config.max_size {
                        State::MaxCapacity
                    } else {
                        State::Subscribed
                    };
                    (next, effects)
                }
            }
        }
        (State::Subscribed, Trigger::Ack { endpoint_id, event_number }) => {
            (State::Subscribed, ack_effects(ctx, endpoint_id, event_number))
        }
        (State::Subscribed, Trigger::CatchUp) => (State::RequestCatchUp, Vec::new()),

        // -- max_capacity -------------------------------------------------
        (State::MaxCapacity, Trigger::Ack { endpoint_id, event_number }) => {
            let effects = ack_effects(ctx, endpoint_id, event_number);
            let next = if ctx.subscribers.queue_size() == 0 { State::RequestCatchUp } else { State::MaxCapacity };
            (next, effects)
        }

        // -- disconnected ---------------------------------------------------
        (State::Disconnected, Trigger::Subscribe) => {
            ctx.state.reset_for_resubscription();
            (State::Disconnected, vec![Effect::AcquireLeadership])
        }
        (State::Disconnected, Trigger::LockAcquired { lock_ref, last_seen }) => {
            apply_lock_acquired(ctx, lock_ref, last_seen)
        }
        (State::Disconnected, Trigger::LockDenied) => (State::Disconnected, Vec::new()),

        // anything else leaves state unchanged with no effect (e.g. a
        // duplicate ACK racing a catch-up read already in flight).
        (s, _) => (s, Vec::new()),
    }
}

fn apply_lock_acquired(
    ctx: &mut SubscriptionContext,
    lock_ref: LockRef,
    last_seen: Option<EventNumber>,
) -> (State, Vec<Effect>) {
    ctx.state.lock_ref = Some(lock_ref);
    let watermark = last_seen.unwrap_or(0);
    ctx.state.last_received = watermark;
    ctx.state.last_sent = watermark;
    ctx.state.last_ack = watermark;

    let mut effects = vec![Effect::SubscribeRegistrationBus];
    for endpoint_id in ctx.subscribers.endpoint_ids() {
        effects.push(Effect::NotifySubscribed { endpoint_id });
    }
    (State::RequestCatchUp, effects)
}

fn read_forward_effect(ctx: &SubscriptionContext) -> Effect {
    Effect::ReadForward { from: ctx.state.last_sent + 1, max_count: ctx.state.config.max_size }
}

fn apply_catch_up_read(ctx: &mut SubscriptionContext, events: Vec<RecordedEvent>) -> (State, Vec<Effect>) {
    if events.is_empty() {
        return if ctx.state.last_sent == ctx.state.last_received {
            (State::Subscribed, Vec::new())
        } else {
            (State::RequestCatchUp, vec![read_forward_effect(ctx)])
        };
    }

    let effects = enqueue_and_fan_out(ctx, events);
    if ctx.subscribers.queue_size() == 0 {
        (State::RequestCatchUp, effects)
    } else {
        (State::CatchingUp, effects)
    }
}

fn ack_effects(ctx: &mut SubscriptionContext, endpoint_id: EndpointId, event_number: EventNumber) -> Vec<Effect> {
    // Errors (unknown subscriber / invalid ack) are validated and reported
    // synchronously to the caller by the orchestrator before a trigger is
    // even raised (see `Orchestrator::ack`); a second, racing failure here
    // is swallowed into a no-op transition rather than panicking the actor.
    if ctx.subscribers.ack(endpoint_id, event_number).is_err() {
        return Vec::new();
    }

    // The ack just freed a slot in `endpoint_id`'s in-flight buffer, which
    // may unblock events already sitting in a partition queue (sticky to
    // this endpoint, or simply queued because every endpoint was full) —
    // re-run fan-out so they are dispatched immediately rather than waiting
    // for the next NOTIFY_EVENTS/catch-up read to enqueue something new.
    let deliveries = ctx.subscribers.fan_out(&mut ctx.state.last_sent);

    let mut effects = Vec::new();
    if ctx.subscribers.checkpoint(&mut ctx.state.last_ack) {
        effects.push(Effect::PersistAck { last_seen: ctx.state.last_ack });
    }
    if !deliveries.is_empty() {
        effects.push(Effect::Deliver(deliveries));
    }
    effects
}

fn enqueue_and_fan_out(ctx: &mut SubscriptionContext, events: Vec<RecordedEvent>) -> Vec<Effect> {
    ctx.subscribers.enqueue(
        events,
        ctx.state.config.selector.as_ref(),
        ctx.state.config.partition_by.as_ref(),
        &mut ctx.state.last_sent,
    );
    let deliveries = ctx.subscribers.fan_out(&mut ctx.state.last_sent);
    let mut effects = Vec::new();
    if ctx.subscribers.checkpoint(&mut ctx.state.last_ack) {
        effects.push(Effect::PersistAck { last_seen: ctx.state.last_ack });
    }
    if !deliveries.is_empty() {
        effects.push(Effect::Deliver(deliveries));
    }
    effects
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::event::StreamId;
    use crate::subscription::state::{SubscriptionConfig, SubscriptionState};

    fn event(n: EventNumber) -> RecordedEvent {
        RecordedEvent::new(
            Uuid::new_v4(),
            n,
            n,
            "stream-A",
            "test-event",
            serde_json::json!({ "n": n }),
            serde_json::json!({}),
            Utc::now(),
        )
    }

    fn odd_selector() -> std::sync::Arc<dyn Fn(&RecordedEvent) -> bool + Send + Sync> {
        std::sync::Arc::new(|e: &RecordedEvent| e.event_number % 2 == 1)
    }

    fn context(config: SubscriptionConfig) -> SubscriptionContext {
        let state = SubscriptionState::new(StreamId::from("stream-A"), "sub1".to_owned(), 1, config, 0);
        SubscriptionContext::new(state)
    }

    fn acquire_lock(ctx: &mut SubscriptionContext, state: State, last_seen: Option<EventNumber>) -> State {
        let (state, _effects) = transition(ctx, state, Trigger::LockAcquired { lock_ref: LockRef(1), last_seen });
        state
    }

    // S1 — cold catch-up: five events already appended before any
    // subscriber connects; subscribing from :origin must deliver all five
    // in one batch once `catch_up_from_stream` reads them.
    #[test]
    fn s1_cold_catch_up_delivers_full_backlog_in_one_batch() {
        let mut ctx = context(SubscriptionConfig { max_size: 10, ..SubscriptionConfig::default() });
        ctx.subscribers.connect(1, 10);

        let state = acquire_lock(&mut ctx, State::Initial, None);
        assert_eq!(state, State::RequestCatchUp);
        assert_eq!(ctx.state.last_sent, 0);

        let events: Vec<_> = (1..=5).map(event).collect();
        let (state, effects) = transition(&mut ctx, state, Trigger::CatchUpRead { events: events.clone() });

        assert_eq!(state, State::RequestCatchUp, "queue drained entirely, re-enters request_catch_up");
        let deliveries = effects.iter().find_map(|e| match e {
            Effect::Deliver(d) => Some(d),
            _ => None,
        });
        let delivered = deliveries.expect("a delivery effect must be produced");
        assert_eq!(delivered[&1].len(), 5);
        assert_eq!(ctx.state.last_sent, 5);

        // a second catch-up read against storage now returns nothing and the
        // horizon is caught up, so the subscription goes live.
        let (state, _) = transition(&mut ctx, state, Trigger::CatchUpRead { events: Vec::new() });
        assert_eq!(state, State::Subscribed);
    }

    #[test]
    fn ack_after_cold_catch_up_advances_durable_checkpoint_to_five() {
        let mut ctx = context(SubscriptionConfig { max_size: 10, ..SubscriptionConfig::default() });
        ctx.subscribers.connect(1, 10);
        let state = acquire_lock(&mut ctx, State::Initial, None);
        let events: Vec<_> = (1..=5).map(event).collect();
        let (state, _) = transition(&mut ctx, state, Trigger::CatchUpRead { events });
        let (_, _) = transition(&mut ctx, state, Trigger::CatchUpRead { events: Vec::new() });

        let (_, effects) = transition(&mut ctx, State::Subscribed, Trigger::Ack { endpoint_id: 1, event_number: 5 });
        let persisted = effects.iter().find_map(|e| match e {
            Effect::PersistAck { last_seen } => Some(*last_seen),
            _ => None,
        });
        assert_eq!(persisted, Some(5));
        assert_eq!(ctx.state.last_ack, 5);
    }

    // S2 — live append with gap recovery: while `subscribed`, a
    // `NOTIFY_EVENTS` batch whose first event number is past the expected
    // horizon must fall back to `request_catch_up` rather than silently
    // skip the missed events.
    #[test]
    fn s2_gap_in_notify_events_triggers_catch_up() {
        let mut ctx = context(SubscriptionConfig { max_size: 10, ..SubscriptionConfig::default() });
        ctx.subscribers.connect(1, 10);
        let state = acquire_lock(&mut ctx, State::Initial, Some(6));
        assert_eq!(ctx.state.last_received, 6);

        // e7, e8 appended but the notification was lost, then e9 arrives live.
        let (state, effects) = transition(&mut ctx, State::Subscribed, Trigger::NotifyEvents(vec![event(9)]));
        assert_eq!(state, State::RequestCatchUp);
        assert!(effects.is_empty(), "gap detection alone does not read or deliver yet");

        // the actor issues ReadForward and the gap is closed from storage.
        let (state, effects) =
            transition(&mut ctx, state, Trigger::CatchUpRead { events: vec![event(7), event(8), event(9)] });
        assert_eq!(state, State::RequestCatchUp);
        let delivered = effects
            .iter()
            .find_map(|e| match e {
                Effect::Deliver(d) => Some(d),
                _ => None,
            })
            .expect("missed events must be delivered once read");
        assert_eq!(delivered[&1].len(), 3);
        assert_eq!(ctx.state.last_sent, 9);
    }

    #[test]
    fn duplicate_notify_events_below_horizon_are_discarded() {
        let mut ctx = context(SubscriptionConfig::default());
        ctx.subscribers.connect(1, 10);
        acquire_lock(&mut ctx, State::Initial, Some(5));

        let (state, effects) = transition(&mut ctx, State::Subscribed, Trigger::NotifyEvents(vec![event(3)]));
        assert_eq!(state, State::Subscribed);
        assert!(effects.is_empty());
        assert_eq!(ctx.state.last_received, 5, "already-seen batch must not move the horizon backwards");
    }

    // S6 — selector + non-contiguous ack: only odd event numbers pass the
    // selector; acking the highest delivered odd number must still advance
    // the durable checkpoint past the even numbers the selector dropped,
    // since they were marked processed at enqueue time.
    #[test]
    fn s6_selector_drops_even_numbers_but_checkpoint_still_advances_past_them() {
        let config = SubscriptionConfig { max_size: 10, selector: odd_selector(), ..SubscriptionConfig::default() };
        let mut ctx = context(config);
        ctx.subscribers.connect(1, 10);
        let state = acquire_lock(&mut ctx, State::Initial, None);

        let events: Vec<_> = (1..=6).map(event).collect();
        let (state, effects) = transition(&mut ctx, state, Trigger::CatchUpRead { events });
        let delivered = effects
            .iter()
            .find_map(|e| match e {
                Effect::Deliver(d) => Some(d),
                _ => None,
            })
            .expect("odd events must still be delivered");
        assert_eq!(delivered[&1].iter().map(|e| e.event_number).collect::<Vec<_>>(), vec![1, 3, 5]);
        assert_eq!(ctx.state.last_sent, 6, "selector-rejected even numbers still advance last_sent");

        let (_, effects) = transition(&mut ctx, state, Trigger::Ack { endpoint_id: 1, event_number: 5 });
        let persisted = effects.iter().find_map(|e| match e {
            Effect::PersistAck { last_seen } => Some(*last_seen),
            _ => None,
        });
        assert_eq!(persisted, Some(6), "checkpoint advances past the selector-dropped even numbers too");
    }

    #[test]
    fn queue_at_max_size_transitions_to_max_capacity() {
        let config = SubscriptionConfig { max_size: 2, ..SubscriptionConfig::default() };
        let mut ctx = context(config);
        // no endpoints connected: nothing drains the queue during fan-out.
        acquire_lock(&mut ctx, State::Initial, None);

        let (state, _) =
            transition(&mut ctx, State::Subscribed, Trigger::NotifyEvents(vec![event(1), event(2)]));
        assert_eq!(state, State::MaxCapacity);
        assert_eq!(ctx.subscribers.queue_size(), 2);
    }

    #[test]
    fn max_capacity_returns_to_request_catch_up_once_queue_drains() {
        // buffer_size 1: only the first of the two events is dispatched
        // immediately, the second stays queued and pushes queue_size to the
        // max_size(1) threshold.
        let config = SubscriptionConfig { max_size: 1, ..SubscriptionConfig::default() };
        let mut ctx = context(config);
        ctx.subscribers.connect(1, 1);
        acquire_lock(&mut ctx, State::Initial, None);

        let (state, effects) =
            transition(&mut ctx, State::Subscribed, Trigger::NotifyEvents(vec![event(1), event(2)]));
        assert_eq!(state, State::MaxCapacity, "second event stays queued behind the full endpoint");
        let first_batch = effects
            .iter()
            .find_map(|e| match e {
                Effect::Deliver(d) => Some(d),
                _ => None,
            })
            .expect("the first event dispatches immediately");
        assert_eq!(first_batch[&1].len(), 1);

        // acking the in-flight event frees the endpoint's one buffer slot;
        // the ack itself must re-run fan-out and dispatch the queued second
        // event rather than leaving it stranded until the next live append.
        let (state, effects) = transition(&mut ctx, state, Trigger::Ack { endpoint_id: 1, event_number: 1 });
        let second_batch = effects
            .iter()
            .find_map(|e| match e {
                Effect::Deliver(d) => Some(d),
                _ => None,
            })
            .expect("ack must drain the queued event now that the endpoint is available again");
        assert_eq!(second_batch[&1][0].event_number, 2);
        assert_eq!(state, State::RequestCatchUp, "queue drained by the ack, so catch-up resumes");
    }

    // Leader-demotion / disconnected-state behaviour (§4.5, §7).
    #[test]
    fn leader_demotion_purges_volatile_state_but_keeps_durable_checkpoint() {
        let mut ctx = context(SubscriptionConfig { max_size: 10, ..SubscriptionConfig::default() });
        ctx.subscribers.connect(1, 10);
        let state = acquire_lock(&mut ctx, State::Initial, Some(5));
        let (state, _) = transition(&mut ctx, state, Trigger::CatchUpRead { events: vec![event(6)] });
        assert_eq!(ctx.subscribers.queue_size(), 0, "delivered immediately, one endpoint available");

        let (state, effects) = transition(&mut ctx, state, Trigger::LeaderDemoted { lock_ref: LockRef(1) });
        assert_eq!(state, State::Disconnected);
        assert!(effects.is_empty());
        assert_eq!(ctx.state.lock_ref, None);
        assert_eq!(ctx.state.last_ack, 5, "durable checkpoint survives a demotion");
    }

    #[test]
    fn leader_demotion_for_a_stale_lock_ref_is_ignored() {
        let mut ctx = context(SubscriptionConfig::default());
        acquire_lock(&mut ctx, State::Initial, None);

        let (state, effects) =
            transition(&mut ctx, State::Subscribed, Trigger::LeaderDemoted { lock_ref: LockRef(99) });
        assert_eq!(state, State::Subscribed, "the demotion names a lock_ref this actor never held");
        assert!(effects.is_empty());
        assert!(ctx.state.lock_ref.is_some());
    }

    #[test]
    fn resubscribe_from_disconnected_resets_last_sent_to_last_ack_not_last_received() {
        let mut ctx = context(SubscriptionConfig { max_size: 10, ..SubscriptionConfig::default() });
        ctx.state.last_received = 8;
        ctx.state.last_sent = 8;
        ctx.state.last_ack = 5;

        let (state, effects) = transition(&mut ctx, State::Disconnected, Trigger::Subscribe);
        assert_eq!(state, State::Disconnected, "stays put until the lock is actually reacquired");
        assert!(matches!(effects.as_slice(), [Effect::AcquireLeadership]));
        assert_eq!(ctx.state.last_sent, 5, "re-reads events between last_ack and last_received on failover");
        assert_eq!(ctx.state.last_received, 8, "last_received is left untouched");
    }

    #[test]
    fn unsubscribed_is_terminal_until_a_new_connect_arrives() {
        let mut ctx = context(SubscriptionConfig::default());
        ctx.subscribers.connect(1, 10);
        let (state, _) = transition(&mut ctx, State::Subscribed, Trigger::UnsubscribeEndpoint { endpoint_id: 1 });
        assert_eq!(state, State::Unsubscribed);

        let (state, _) = transition(&mut ctx, state, Trigger::CatchUp);
        assert_eq!(state, State::Unsubscribed, "terminal to everything except a fresh connect");

        let (state, effects) =
            transition(&mut ctx, state, Trigger::ConnectSubscriber { endpoint_id: 2, buffer_size: 5 });
        assert_eq!(state, State::RequestCatchUp, "the supervisor may recycle the process for a new endpoint");
        assert!(matches!(effects.as_slice(), []), "no NotifySubscribed yet: leadership must be reacquired first");
    }

    #[test]
    fn stream_not_found_during_catch_up_goes_straight_to_subscribed() {
        let mut ctx = context(SubscriptionConfig::default());
        let state = acquire_lock(&mut ctx, State::Initial, None);
        let (state, effects) = transition(&mut ctx, state, Trigger::CatchUpStreamNotFound);
        assert_eq!(state, State::Subscribed);
        assert!(effects.is_empty());
    }
}
