//! Process-local publish/subscribe bus keyed by stream id (C3).
//!
//! Grounded on the teacher crate's `Notifier` (`eventually-util::notify`),
//! which keeps one `tokio::sync::broadcast` channel per topic rather than a
//! single fan-out channel, so a slow or absent subscriber on one topic never
//! affects another. Delivery is at-most-once and best-effort: `publish` on a
//! topic with no subscribers is not an error, and a lagging receiver that
//! misses a publication is expected to fall back to a catch-up read rather
//! than treat the bus as a reliable log.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::event::StreamId;

const DEFAULT_TOPIC_CHANNEL_SIZE: usize = 256;

/// A topic bus keyed by [`StreamId`]. `T` is the payload published to a
/// topic; the notification pipeline (C4) uses `Vec<RecordedEvent>` batches.
pub struct RegistrationBus<T> {
    topics: Mutex<HashMap<StreamId, broadcast::Sender<T>>>,
    channel_size: usize,
}

impl<T: Clone + Send + 'static> Default for RegistrationBus<T> {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CHANNEL_SIZE)
    }
}

impl<T: Clone + Send + 'static> RegistrationBus<T> {
    /// Creates a bus whose per-topic broadcast channels have the given
    /// capacity. A subscriber that falls behind by more than `channel_size`
    /// publications will observe a `Lagged` error and must recover via
    /// catch-up, not by replaying the bus.
    #[must_use]
    pub fn new(channel_size: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            channel_size,
        }
    }

    /// Enrolls the caller as a subscriber of `topic`, lazily creating the
    /// topic's channel if this is the first subscriber.
    pub fn subscribe(&self, topic: &StreamId) -> broadcast::Receiver<T> {
        let mut topics = self.topics.lock().expect("registration bus lock poisoned");
        topics
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(self.channel_size).0)
            .subscribe()
    }

    /// Delivers `payload` to every current subscriber of `topic`. A topic
    /// with no subscribers (or none left) is treated as a successful,
    /// best-effort no-op.
    pub fn publish(&self, topic: &StreamId, payload: T) {
        let topics = self.topics.lock().expect("registration bus lock poisoned");
        if let Some(sender) = topics.get(topic) {
            // `send` only errors when there are zero receivers, which is not
            // an error for a best-effort bus.
            let _ = sender.send(payload);
        }
    }
}
