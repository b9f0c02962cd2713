//! Subscriber set and partitioned fan-out (C6).
//!
//! Keeping a mapping from partition key to ordered queue, rather than a
//! single shared queue, is what makes partition affinity and global
//! ordering cheap: picking the next partition to service is a peek-head
//! comparison across `P` queues (`O(P log P)` per round) instead of
//! scanning past events that must be skipped because their endpoint is
//! busy.

use std::collections::{HashMap, VecDeque};

use crate::error::AckError;
use crate::event::{EventNumber, RecordedEvent};

/// Identifies one connected consumer endpoint within a subscription.
pub type EndpointId = u64;

/// The partition key derived from an event by `partition_by`. `None` when no
/// `partition_by` is configured — in that case every event shares the same,
/// single partition.
pub type PartitionKey = Option<String>;

/// One connected consumer endpoint.
#[derive(Debug)]
pub struct Subscriber {
    pub endpoint_id: EndpointId,
    buffer_size: usize,
    in_flight: VecDeque<(RecordedEvent, PartitionKey)>,
    /// Logical clock used to break ties between otherwise-equal candidate
    /// endpoints during selection, incremented every time this endpoint is
    /// picked. Unrelated to the subscription-wide `last_sent` event-number
    /// watermark in [`super::state::SubscriptionState`] — the two fields
    /// share a name in the source spec but not a unit.
    last_dispatch_seq: u64,
}

impl Subscriber {
    #[must_use]
    pub fn new(endpoint_id: EndpointId, buffer_size: usize) -> Self {
        Self {
            endpoint_id,
            buffer_size,
            in_flight: VecDeque::new(),
            last_dispatch_seq: 0,
        }
    }

    #[must_use]
    pub fn available(&self) -> bool {
        self.in_flight.len() < self.buffer_size
    }

    #[must_use]
    pub fn holds_partition(&self, key: &PartitionKey) -> bool {
        self.in_flight.iter().any(|(_, k)| k == key)
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

/// Owns every connected endpoint for one subscription, the per-partition
/// pending queues, and the set of acknowledged-but-not-yet-contiguous event
/// numbers.
#[derive(Debug, Default)]
pub struct SubscriberSet {
    subscribers: HashMap<EndpointId, Subscriber>,
    partitions: HashMap<PartitionKey, VecDeque<RecordedEvent>>,
    queue_size: usize,
    processed_event_ids: std::collections::HashSet<EventNumber>,
    next_dispatch_seq: u64,
}

/// Batched events to deliver to one endpoint, produced by a fan-out round.
pub type Deliveries = HashMap<EndpointId, Vec<RecordedEvent>>;

impl SubscriberSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    #[must_use]
    pub fn endpoint_ids(&self) -> Vec<EndpointId> {
        self.subscribers.keys().copied().collect()
    }

    pub fn connect(&mut self, endpoint_id: EndpointId, buffer_size: usize) {
        self.subscribers
            .entry(endpoint_id)
            .or_insert_with(|| Subscriber::new(endpoint_id, buffer_size));
    }

    /// Disconnects `endpoint_id` without re-queueing its in-flight events
    /// (clean unsubscribe: the caller has already chosen to stop consuming).
    pub fn disconnect(&mut self, endpoint_id: EndpointId) {
        self.subscribers.remove(&endpoint_id);
    }

    /// Re-queues `endpoint_id`'s in-flight events for redelivery and removes
    /// it, used when the endpoint's liveness handle fires. In-flight events
    /// are prepended back onto their partition queues in descending
    /// `event_number` order so the queue's head remains the lowest
    /// (re-establishing delivery order after the endpoint is gone).
    pub fn endpoint_lost(&mut self, endpoint_id: EndpointId) {
        let Some(subscriber) = self.subscribers.remove(&endpoint_id) else {
            return;
        };

        let mut by_partition: HashMap<PartitionKey, Vec<RecordedEvent>> = HashMap::new();
        for (event, key) in subscriber.in_flight {
            by_partition.entry(key).or_default().push(event);
        }

        for (key, mut events) in by_partition {
            events.sort_by(|a, b| b.event_number.cmp(&a.event_number));
            let queue = self.partitions.entry(key).or_default();
            for event in events {
                queue.push_front(event);
                self.queue_size += 1;
            }
        }
    }

    /// Clears every pending queue, in-flight record, and processed-id,
    /// without disconnecting endpoints — used when a subscription is
    /// demoted to `disconnected`. Connected endpoints remain connected so
    /// that the subsequent catch-up re-delivers to them once leadership is
    /// regained, but whatever they held in flight is gone with the rest of
    /// the volatile state; it will be re-read from storage.
    pub fn purge(&mut self) {
        for subscriber in self.subscribers.values_mut() {
            subscriber.in_flight.clear();
        }
        self.partitions.clear();
        self.queue_size = 0;
        self.processed_event_ids.clear();
    }

    /// Evaluates `selector` against each event in arrival order and enqueues
    /// the ones that pass into their `partition_by` queue. Events that fail
    /// the selector are marked processed immediately (they will never be
    /// delivered) and advance `last_sent` as if they had been, since no
    /// further handling of them is needed.
    pub fn enqueue(
        &mut self,
        events: Vec<RecordedEvent>,
        selector: &(dyn Fn(&RecordedEvent) -> bool + Send + Sync),
        partition_by: &(dyn Fn(&RecordedEvent) -> PartitionKey + Send + Sync),
        last_sent: &mut EventNumber,
    ) {
        for event in events {
            if !selector(&event) {
                self.processed_event_ids.insert(event.event_number);
                *last_sent = event.event_number;
                continue;
            }

            let key = partition_by(&event);
            self.partitions.entry(key).or_default().push_back(event);
            self.queue_size += 1;
        }
    }

    fn select_endpoint(&self, key: &PartitionKey) -> Option<EndpointId> {
        let sticky_holder = self
            .subscribers
            .values()
            .find(|s| s.holds_partition(key))
            .map(|s| s.endpoint_id);

        let candidates: Box<dyn Iterator<Item = &Subscriber>> = match sticky_holder {
            Some(id) => Box::new(self.subscribers.get(&id).into_iter()),
            None => Box::new(self.subscribers.values()),
        };

        candidates
            .filter(|s| s.available())
            .min_by_key(|s| s.last_dispatch_seq)
            .map(|s| s.endpoint_id)
    }

    /// Runs one fan-out round: partitions are serviced in ascending order of
    /// their head event's `event_number`, preferring global ordering when
    /// several partitions are simultaneously eligible. Returns the batched
    /// deliveries accumulated this round, in enqueue order per endpoint.
    pub fn fan_out(&mut self, last_sent: &mut EventNumber) -> Deliveries {
        let mut order: Vec<PartitionKey> = self
            .partitions
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(k, _)| k.clone())
            .collect();

        order.sort_by_key(|k| self.partitions[k].front().map(|e| e.event_number));

        let mut deliveries: Deliveries = HashMap::new();

        for key in order {
            loop {
                let has_head = self
                    .partitions
                    .get(&key)
                    .is_some_and(|q| !q.is_empty());
                if !has_head {
                    break;
                }

                let Some(endpoint_id) = self.select_endpoint(&key) else {
                    break;
                };

                let event = self
                    .partitions
                    .get_mut(&key)
                    .and_then(VecDeque::pop_front)
                    .expect("head checked above");
                self.queue_size -= 1;
                *last_sent = (*last_sent).max(event.event_number);

                self.next_dispatch_seq += 1;
                let seq = self.next_dispatch_seq;
                let subscriber = self
                    .subscribers
                    .get_mut(&endpoint_id)
                    .expect("selected endpoint must exist");
                subscriber.last_dispatch_seq = seq;
                subscriber.in_flight.push_back((event.clone(), key.clone()));

                deliveries.entry(endpoint_id).or_default().push(event);
            }
        }

        self.partitions.retain(|_, q| !q.is_empty());
        deliveries
    }

    /// Acknowledges every in-flight event for `endpoint_id` with
    /// `event_number <= n`. Acks below the endpoint's current watermark are
    /// a no-op (returns an empty vector); acking an event number higher than
    /// any currently in-flight event is [`AckError::InvalidAck`]. Returns
    /// the event numbers newly acknowledged, for the caller to feed into
    /// [`SubscriberSet::checkpoint`].
    /// Validates an ack without applying it, so a caller can be told
    /// `{unknown_subscriber}`/`{invalid_ack}` synchronously before the
    /// actual state change is queued onto the subscription actor's mailbox.
    pub fn peek_ack_validity(&self, endpoint_id: EndpointId, n: EventNumber) -> Result<(), AckError> {
        let subscriber = self.subscribers.get(&endpoint_id).ok_or(AckError::UnknownSubscriber)?;
        if let Some((highest, _)) = subscriber.in_flight.back() {
            if n > highest.event_number {
                return Err(AckError::InvalidAck);
            }
        }
        Ok(())
    }

    pub fn ack(
        &mut self,
        endpoint_id: EndpointId,
        n: EventNumber,
    ) -> Result<Vec<EventNumber>, AckError> {
        let subscriber = self
            .subscribers
            .get_mut(&endpoint_id)
            .ok_or(AckError::UnknownSubscriber)?;

        if let Some((highest, _)) = subscriber.in_flight.back() {
            if n > highest.event_number {
                return Err(AckError::InvalidAck);
            }
        }

        let mut acked = Vec::new();
        while let Some((event, _)) = subscriber.in_flight.front() {
            if event.event_number > n {
                break;
            }
            let (event, _) = subscriber.in_flight.pop_front().expect("front checked above");
            acked.push(event.event_number);
        }

        for event_number in &acked {
            self.processed_event_ids.insert(*event_number);
        }

        Ok(acked)
    }

    /// Advances `last_ack` by consuming `processed_event_ids` contiguously
    /// from `last_ack + 1`. Returns whether `last_ack` moved, so the caller
    /// knows whether a durable persist is due this round.
    pub fn checkpoint(&mut self, last_ack: &mut EventNumber) -> bool {
        let mut advanced = false;
        loop {
            let candidate = *last_ack + 1;
            if self.processed_event_ids.remove(&candidate) {
                *last_ack = candidate;
                advanced = true;
            } else {
                break;
            }
        }
        advanced
    }
}
