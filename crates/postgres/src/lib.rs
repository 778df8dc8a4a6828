//! # Postgres
//!
//! Durable storage for the campsite watch service. Provides connection-pool
//! helpers and `sqlx`-backed implementations of the store capability traits.
//! The table layout is in `schema.sql` at the crate root.

/// Database connection pool helpers.
pub mod database;

/// Store trait implementations backed by PostgreSQL.
pub mod store;

pub use store::PgStore;
