//! The notification pipeline (C4): three serialized stages connected by
//! bounded hand-offs, turning database append notifications into
//! per-stream (and `$all`) event batches on the registration bus (C3).
//!
//! Listener → Reader → Broadcaster, each its own `tokio::spawn`ed task so a
//! slow Broadcaster back-pressures the Reader, which back-pressures the
//! Listener's forwarding. The Listener itself (a concrete, storage-specific
//! `NotificationListener` implementation such as a PostgreSQL `LISTEN`
//! session) is supplied by the calling crate; this module owns the
//! storage-agnostic Reader and Broadcaster stages plus the wiring between
//! all three.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::RegistrationBus;
use crate::event::{EventNumber, RecordedEvent, StreamId};
use crate::gateway::StorageGateway;

/// Default capacity of the bounded channels between pipeline stages.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// A parsed database notification: `"<stream_id>,<from>,<to>"` per §6,
/// `from <= to`, contiguous with prior emissions for the same stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamNotification {
    pub stream_id: StreamId,
    pub from: EventNumber,
    pub to: EventNumber,
}

/// Returned when a notification payload does not match the documented
/// `"<stream_id>,<from>,<to>"` format.
#[derive(Debug, Clone, thiserror::Error)]
#[error("malformed notification payload: {0:?}")]
pub struct ParseNotificationError(pub String);

impl StreamNotification {
    /// Parses the wire payload emitted by the `events` table's `AFTER
    /// INSERT` trigger.
    pub fn parse(payload: &str) -> Result<Self, ParseNotificationError> {
        let mut parts = payload.splitn(3, ',');
        let (Some(stream_id), Some(from), Some(to)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(ParseNotificationError(payload.to_owned()));
        };
        let from: EventNumber = from.parse().map_err(|_| ParseNotificationError(payload.to_owned()))?;
        let to: EventNumber = to.parse().map_err(|_| ParseNotificationError(payload.to_owned()))?;
        if from > to {
            return Err(ParseNotificationError(payload.to_owned()));
        }
        Ok(Self { stream_id: StreamId::from(stream_id), from, to })
    }
}

/// The Listener stage's contract: a dedicated database session in `LISTEN`
/// mode, yielding parsed notifications in arrival order. `recv` returning
/// `None` signals the underlying session is gone; per §4.4, this is not
/// fatal to the system — subscriptions independently fall behind and
/// recover via catch-up on their next ack or heartbeat.
#[async_trait]
pub trait NotificationListener: Send {
    async fn recv(&mut self) -> Option<StreamNotification>;
}

/// Handles to the three spawned pipeline stages, kept only so a caller can
/// await or abort them during shutdown.
pub struct NotificationPipeline {
    pub listener: JoinHandle<()>,
    pub reader: JoinHandle<()>,
    pub broadcaster: JoinHandle<()>,
}

impl NotificationPipeline {
    pub fn abort(&self) {
        self.listener.abort();
        self.reader.abort();
        self.broadcaster.abort();
    }
}

/// Spawns the three pipeline stages, wired together with bounded channels
/// of `channel_capacity`. There is at most one of these per cluster (see
/// §5); callers are responsible for ensuring only one node runs it, e.g. by
/// gating it behind its own advisory lock or by running it only on a
/// designated node.
pub fn spawn(
    listener: Box<dyn NotificationListener>,
    gateway: Arc<dyn StorageGateway>,
    bus: Arc<RegistrationBus<Vec<RecordedEvent>>>,
    channel_capacity: usize,
) -> NotificationPipeline {
    let (notification_tx, notification_rx) = mpsc::channel(channel_capacity);
    let (batch_tx, batch_rx) = mpsc::channel(channel_capacity);

    let listener = tokio::spawn(run_listener_stage(listener, notification_tx));
    let reader = tokio::spawn(run_reader_stage(notification_rx, gateway, batch_tx));
    let broadcaster = tokio::spawn(run_broadcaster_stage(batch_rx, bus));

    NotificationPipeline { listener, reader, broadcaster }
}

async fn run_listener_stage(
    mut listener: Box<dyn NotificationListener>,
    tx: mpsc::Sender<StreamNotification>,
) {
    while let Some(notification) = listener.recv().await {
        // `send` awaits if the Reader is lagging: the Listener is allowed
        // to lag the socket's read buffer, never to drop a notification.
        if tx.send(notification).await.is_err() {
            break;
        }
    }
    tracing::warn!("notification listener stage ended; downstream subscriptions will recover via catch-up");
}

async fn run_reader_stage(
    mut rx: mpsc::Receiver<StreamNotification>,
    gateway: Arc<dyn StorageGateway>,
    tx: mpsc::Sender<(StreamId, Vec<RecordedEvent>)>,
) {
    while let Some(notification) = rx.recv().await {
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let max_count = (notification.to - notification.from + 1) as usize;
        match gateway.read_stream_forward(&notification.stream_id, notification.from, max_count).await {
            Ok(events) if events.is_empty() => {}
            Ok(events) => {
                if tx.send((notification.stream_id, events)).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(
                    stream_id = %notification.stream_id,
                    from = notification.from,
                    to = notification.to,
                    error = %err,
                    "notification pipeline reader failed to fetch appended events; \
                     affected subscriptions will catch up independently"
                );
            }
        }
    }
}

async fn run_broadcaster_stage(
    mut rx: mpsc::Receiver<(StreamId, Vec<RecordedEvent>)>,
    bus: Arc<RegistrationBus<Vec<RecordedEvent>>>,
) {
    while let Some((stream_id, events)) = rx.recv().await {
        bus.publish(&stream_id, events.clone());
        bus.publish(&StreamId::All, events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_payload() {
        let notification = StreamNotification::parse("order-1,5,7").unwrap();
        assert_eq!(notification.stream_id, StreamId::from("order-1"));
        assert_eq!(notification.from, 5);
        assert_eq!(notification.to, 7);
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(StreamNotification::parse("order-1,7,5").is_err());
    }

    #[test]
    fn rejects_non_numeric_fields() {
        assert!(StreamNotification::parse("order-1,a,b").is_err());
    }
}
