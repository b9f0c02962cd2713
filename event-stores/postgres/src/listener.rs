//! The notification pipeline's Listener stage (part of C4), grounded
//! directly on the teacher's `EventSubscriber::new`
//! (`eventually-postgres/src/subscriber.rs`): a dedicated
//! `tokio_postgres::connect`, a `futures::stream::poll_fn` over
//! `connection.poll_message`, and a single `LISTEN <channel>;` issued once
//! up front.

use futures::stream::StreamExt;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, NoTls};

use event_store_core::pipeline::{NotificationListener, StreamNotification};

const NOTIFICATION_CHANNEL_SIZE: usize = 256;

/// The event-store's single notification channel, matching the trigger
/// installed by the `V1__init` migration.
pub const EVENT_STORE_CHANNEL: &str = "event_store_events";

pub struct PostgresListener {
    rx: mpsc::Receiver<StreamNotification>,
}

impl PostgresListener {
    /// Opens a dedicated `LISTEN` session on `channel` against `dsn`.
    pub async fn connect(dsn: &str, channel: &str) -> Result<Self, tokio_postgres::Error> {
        let (client, mut connection) = tokio_postgres::connect(dsn, NoTls).await?;
        let (tx, rx) = mpsc::channel(NOTIFICATION_CHANNEL_SIZE);

        tokio::spawn(async move {
            let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));

            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(notification)) => {
                        match StreamNotification::parse(notification.payload()) {
                            Ok(parsed) => {
                                if tx.send(parsed).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "dropping malformed notification payload");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "notification listener connection failed");
                        break;
                    }
                }
            }

            tracing::warn!("notification listener session ended");
        });

        client.batch_execute(&format!("LISTEN {channel};")).await?;

        Ok(Self { rx })
    }
}

#[async_trait::async_trait]
impl NotificationListener for PostgresListener {
    async fn recv(&mut self) -> Option<StreamNotification> {
        self.rx.recv().await
    }
}
