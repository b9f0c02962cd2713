//! [`StorageGateway`] (C1) implementation over a pooled `tokio_postgres`
//! client, against the schema in `src/migrations`.

use async_trait::async_trait;
use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use chrono::{DateTime, Utc};
use tokio_postgres::NoTls;
use uuid::Uuid;

use event_store_core::error::StorageError;
use event_store_core::event::{EventNumber, ExpectedVersion, RecordedEvent, StartFrom, StreamId, StreamVersion};
use event_store_core::gateway::{NewEvent, StorageGateway, StorageResult};

use crate::error::{pool_error, storage_error};

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("src/migrations");
}

pub type ConnectionPool = Pool<PostgresConnectionManager<NoTls>>;

/// `PostgresGateway` is the sole production [`StorageGateway`]: a pooled
/// `tokio_postgres` client talking to the schema created by the embedded
/// `refinery` migrations in this crate.
#[derive(Clone)]
pub struct PostgresGateway {
    pool: ConnectionPool,
}

impl PostgresGateway {
    /// Builds a connection pool for `dsn` and runs pending migrations
    /// against it, creating the schema if it does not exist yet. Idempotent.
    pub async fn connect(dsn: &str, max_pool_size: u32) -> anyhow::Result<Self> {
        let manager = PostgresConnectionManager::new_from_stringlike(dsn, NoTls)?;
        let pool = Pool::builder().max_size(max_pool_size).build(manager).await?;

        let mut conn = pool.get().await?;
        embedded::migrations::runner().run_async(&mut *conn).await?;

        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> ConnectionPool {
        self.pool.clone()
    }
}

fn row_to_recorded_event(row: &tokio_postgres::Row) -> RecordedEvent {
    let event_id: Uuid = row.get("event_id");
    let event_number: i64 = row.get("event_number");
    let stream_version: i64 = row.get("stream_version");
    let stream_id: String = row.get("stream_id");
    let event_type: String = row.get("event_type");
    let payload: serde_json::Value = row.get("data");
    let metadata: serde_json::Value = row.get("metadata");
    let created_at: DateTime<Utc> = row.get("created_at");

    RecordedEvent::new(
        event_id,
        event_number,
        stream_version,
        stream_id,
        event_type,
        payload,
        metadata,
        created_at,
    )
}

#[async_trait]
impl StorageGateway for PostgresGateway {
    async fn create_stream(&self, stream_id: &str) -> StorageResult<i64> {
        let conn = self.pool.get().await.map_err(pool_error)?;

        let row = conn
            .query_one("INSERT INTO streams (stream_id) VALUES ($1) RETURNING id", &[&stream_id])
            .await
            .map_err(|err| {
                if err.code().map(|code| code.code() == "23505").unwrap_or(false) {
                    StorageError::StreamExists
                } else {
                    storage_error(err)
                }
            })?;

        Ok(row.get(0))
    }

    async fn append_events(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> StorageResult<StreamVersion> {
        if events.is_empty() {
            return Ok(0);
        }

        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let tx = conn.transaction().await.map_err(storage_error)?;

        let existing = tx
            .query_opt("SELECT id FROM streams WHERE stream_id = $1 FOR UPDATE", &[&stream_id])
            .await
            .map_err(storage_error)?;

        let (internal_id, current_version): (i64, i64) = match existing {
            Some(row) => {
                if matches!(expected_version, ExpectedVersion::NoStream) {
                    return Err(StorageError::StreamExists);
                }
                let internal_id: i64 = row.get(0);
                let version_row = tx
                    .query_one(
                        "SELECT COALESCE(MAX(stream_version), 0) FROM events WHERE stream_id = $1",
                        &[&internal_id],
                    )
                    .await
                    .map_err(storage_error)?;
                (internal_id, version_row.get(0))
            }
            None => {
                if let ExpectedVersion::Exact(_) = expected_version {
                    return Err(StorageError::StreamNotFound);
                }
                let row = tx
                    .query_one("INSERT INTO streams (stream_id) VALUES ($1) RETURNING id", &[&stream_id])
                    .await
                    .map_err(storage_error)?;
                (row.get(0), 0)
            }
        };

        if let ExpectedVersion::Exact(expected) = expected_version {
            if expected != current_version {
                return Err(StorageError::WrongExpectedVersion { expected, actual: current_version });
            }
        }

        let versions: Vec<i64> = (1..=events.len() as i64).map(|offset| current_version + offset).collect();
        let event_types: Vec<String> = events.iter().map(|event| event.event_type.clone()).collect();
        let payloads: Vec<serde_json::Value> = events.iter().map(|event| event.payload.clone()).collect();
        let metadata: Vec<serde_json::Value> = events.iter().map(|event| event.metadata.clone()).collect();

        tx.execute(
            "INSERT INTO events (stream_id, stream_version, event_type, data, metadata)
             SELECT $1, v, t, d, m
             FROM unnest($2::bigint[], $3::text[], $4::jsonb[], $5::jsonb[]) AS u(v, t, d, m)",
            &[&internal_id, &versions, &event_types, &payloads, &metadata],
        )
        .await
        .map_err(storage_error)?;

        tx.commit().await.map_err(storage_error)?;

        Ok(current_version + events.len() as i64)
    }

    async fn read_stream_forward(
        &self,
        stream_id: &StreamId,
        from: EventNumber,
        max_count: usize,
    ) -> StorageResult<Vec<RecordedEvent>> {
        let conn = self.pool.get().await.map_err(pool_error)?;
        #[allow(clippy::cast_possible_wrap)]
        let limit = max_count as i64;

        let rows = match stream_id {
            StreamId::All => conn
                .query(
                    "SELECT e.event_id, e.event_number, e.stream_version, s.stream_id, e.event_type, e.data, e.metadata, e.created_at
                     FROM events e JOIN streams s ON s.id = e.stream_id
                     WHERE e.event_number >= $1
                     ORDER BY e.event_number ASC
                     LIMIT $2",
                    &[&from, &limit],
                )
                .await
                .map_err(storage_error)?,
            StreamId::Named(name) => {
                let stream_row = conn
                    .query_opt("SELECT id FROM streams WHERE stream_id = $1", &[name])
                    .await
                    .map_err(storage_error)?;
                let Some(stream_row) = stream_row else { return Err(StorageError::StreamNotFound) };
                let internal_id: i64 = stream_row.get(0);

                conn.query(
                    "SELECT e.event_id, e.event_number, e.stream_version, s.stream_id, e.event_type, e.data, e.metadata, e.created_at
                     FROM events e JOIN streams s ON s.id = e.stream_id
                     WHERE e.stream_id = $1 AND e.event_number >= $2
                     ORDER BY e.event_number ASC
                     LIMIT $3",
                    &[&internal_id, &from, &limit],
                )
                .await
                .map_err(storage_error)?
            }
        };

        Ok(rows.iter().map(row_to_recorded_event).collect())
    }

    async fn subscribe_to_stream(
        &self,
        stream_id: &StreamId,
        subscription_name: &str,
        start_from: StartFrom,
    ) -> StorageResult<(i64, Option<EventNumber>)> {
        let conn = self.pool.get().await.map_err(pool_error)?;
        let stream_uuid = stream_id.as_str();

        if let Some(row) = conn
            .query_opt(
                "SELECT id, last_seen FROM subscriptions WHERE stream_uuid = $1 AND subscription_name = $2",
                &[&stream_uuid, &subscription_name],
            )
            .await
            .map_err(storage_error)?
        {
            return Ok((row.get(0), row.get(1)));
        }

        let initial_last_seen: Option<EventNumber> = match start_from {
            StartFrom::Origin => None,
            StartFrom::EventNumber(event_number) => Some(event_number - 1),
            StartFrom::Current => {
                let row = conn
                    .query_one("SELECT COALESCE(MAX(event_number), 0) FROM events", &[])
                    .await
                    .map_err(storage_error)?;
                Some(row.get(0))
            }
        };

        let row = conn
            .query_opt(
                "INSERT INTO subscriptions (stream_uuid, subscription_name, last_seen)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (stream_uuid, subscription_name) DO NOTHING
                 RETURNING id, last_seen",
                &[&stream_uuid, &subscription_name, &initial_last_seen],
            )
            .await
            .map_err(storage_error)?;

        match row {
            Some(row) => Ok((row.get(0), row.get(1))),
            None => {
                // Lost the insert race; attach to the row the other caller created.
                let row = conn
                    .query_one(
                        "SELECT id, last_seen FROM subscriptions WHERE stream_uuid = $1 AND subscription_name = $2",
                        &[&stream_uuid, &subscription_name],
                    )
                    .await
                    .map_err(storage_error)?;
                Ok((row.get(0), row.get(1)))
            }
        }
    }

    async fn ack_last_seen_event(
        &self,
        stream_id: &StreamId,
        subscription_name: &str,
        last_seen: EventNumber,
    ) -> StorageResult<()> {
        let conn = self.pool.get().await.map_err(pool_error)?;
        conn.execute(
            "UPDATE subscriptions SET last_seen = $3
             WHERE stream_uuid = $1 AND subscription_name = $2 AND (last_seen IS NULL OR last_seen < $3)",
            &[&stream_id.as_str(), &subscription_name, &last_seen],
        )
        .await
        .map_err(storage_error)?;

        Ok(())
    }

    async fn delete_subscription(&self, stream_id: &StreamId, subscription_name: &str) -> StorageResult<()> {
        let conn = self.pool.get().await.map_err(pool_error)?;
        conn.execute(
            "DELETE FROM subscriptions WHERE stream_uuid = $1 AND subscription_name = $2",
            &[&stream_id.as_str(), &subscription_name],
        )
        .await
        .map_err(storage_error)?;

        Ok(())
    }
}
