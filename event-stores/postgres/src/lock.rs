//! [`AdvisoryLock`] (C2) implementation over one dedicated, never-pooled
//! `tokio_postgres` session, driven by an `mpsc` mailbox — grounded on the
//! same dedicated-session shape as [`crate::listener::PostgresListener`],
//! since advisory locks are scoped to the session that took them and must
//! never be returned to a pool between acquire and release.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_postgres::NoTls;

use event_store_core::error::LockError;
use event_store_core::gateway::{AdvisoryLock, LockRef};

use crate::error::lock_pool_error;

const DISCONNECT_CHANNEL_SIZE: usize = 64;
const MAILBOX_CAPACITY: usize = 64;
const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(200);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

enum Command {
    TryAcquire { key: i64, reply: oneshot::Sender<Result<LockRef, LockError>> },
    Release { lock_ref: LockRef },
}

/// Handle to the dedicated advisory-lock session. Cheap to clone; every
/// clone shares the same mailbox and session.
#[derive(Clone)]
pub struct PostgresAdvisoryLock {
    mailbox: mpsc::Sender<Command>,
    disconnections: broadcast::Sender<LockRef>,
}

impl PostgresAdvisoryLock {
    /// Spawns the session-owning task and returns a handle to it. The task
    /// reconnects with exponential backoff on session loss; every holder
    /// tracked at the time of loss is fanned out a [`LockRef`] demotion.
    #[must_use]
    pub fn connect(dsn: String) -> Self {
        let (mailbox_tx, mailbox_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (disconnect_tx, _) = broadcast::channel(DISCONNECT_CHANNEL_SIZE);

        tokio::spawn(run_session(dsn, mailbox_rx, disconnect_tx.clone()));

        Self { mailbox: mailbox_tx, disconnections: disconnect_tx }
    }
}

#[async_trait]
impl AdvisoryLock for PostgresAdvisoryLock {
    async fn try_acquire(&self, key: i64) -> Result<LockRef, LockError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.mailbox
            .send(Command::TryAcquire { key, reply: reply_tx })
            .await
            .map_err(|_| LockError::Transport(anyhow::anyhow!("advisory lock session task is gone")))?;

        reply_rx
            .await
            .map_err(|_| LockError::Transport(anyhow::anyhow!("advisory lock session task dropped the reply")))?
    }

    async fn release(&self, lock_ref: LockRef) {
        let _ = self.mailbox.send(Command::Release { lock_ref }).await;
    }

    fn disconnections(&self) -> broadcast::Receiver<LockRef> {
        self.disconnections.subscribe()
    }
}

async fn run_session(dsn: String, mut mailbox: mpsc::Receiver<Command>, disconnect_tx: broadcast::Sender<LockRef>) {
    let mut backoff = RECONNECT_BASE_DELAY;

    loop {
        let (client, connection) = match tokio_postgres::connect(&dsn, NoTls).await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, delay = ?backoff, "advisory lock session failed to connect, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_MAX_DELAY);
                continue;
            }
        };
        backoff = RECONNECT_BASE_DELAY;

        let mut connection_task = tokio::spawn(connection);
        let mut holders: HashMap<u64, i64> = HashMap::new();
        let mut next_ref: u64 = 1;

        loop {
            tokio::select! {
                biased;

                connection_result = &mut connection_task => {
                    if let Ok(Err(err)) = connection_result {
                        tracing::warn!(error = %err, "advisory lock session connection failed");
                    } else {
                        tracing::warn!("advisory lock session connection closed");
                    }
                    break;
                }

                command = mailbox.recv() => {
                    match command {
                        None => return,
                        Some(Command::TryAcquire { key, reply }) => {
                            let result = client
                                .query_one("SELECT pg_try_advisory_lock($1)", &[&key])
                                .await
                                .map_err(lock_pool_error)
                                .and_then(|row| {
                                    let acquired: bool = row.get(0);
                                    if acquired {
                                        let lock_ref = LockRef(next_ref);
                                        next_ref += 1;
                                        holders.insert(lock_ref.0, key);
                                        Ok(lock_ref)
                                    } else {
                                        Err(LockError::AlreadyTaken)
                                    }
                                });
                            let _ = reply.send(result);
                        }
                        Some(Command::Release { lock_ref }) => {
                            if let Some(key) = holders.remove(&lock_ref.0) {
                                if let Err(err) = client.execute("SELECT pg_advisory_unlock($1)", &[&key]).await {
                                    tracing::warn!(error = %err, key, "failed to release advisory lock");
                                }
                            }
                        }
                    }
                }
            }
        }

        for lock_ref in holders.keys().copied().map(LockRef) {
            let _ = disconnect_tx.send(lock_ref);
        }
    }
}
