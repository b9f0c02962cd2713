//! PostgreSQL backend for `event-store-core`: a [`gateway::PostgresGateway`]
//! implementing [`event_store_core::gateway::StorageGateway`], a
//! [`lock::PostgresAdvisoryLock`] implementing
//! [`event_store_core::gateway::AdvisoryLock`], and a
//! [`listener::PostgresListener`] feeding the notification pipeline (C4).
//!
//! Schema and migrations live under `src/migrations`, embedded via
//! `refinery` and run by [`gateway::PostgresGateway::connect`].

pub mod error;
pub mod gateway;
pub mod listener;
pub mod lock;

pub use gateway::PostgresGateway;
pub use listener::{PostgresListener, EVENT_STORE_CHANNEL};
pub use lock::PostgresAdvisoryLock;
