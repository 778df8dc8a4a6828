//! # Campsite Watch
//!
//! The subscription monitoring scheduler: one polling worker per active
//! subscription, supervised with backoff and admission control, feeding a
//! classify → diff → dispatch pipeline that notifies owners of newly
//! appeared campsite availability exactly once per observed opening.

/// Domain types for subscriptions, accounts, and notification records
mod types;
pub use types::*;

/// Crate-wide error type
mod error;
pub use error::*;

/// Weekend/weekend-adjacent classification of check-in dates
mod classify;
pub use classify::*;

/// Classified availability snapshots
mod snapshot;
pub use snapshot::*;

/// Change detection between consecutive snapshots
mod diff;
pub use diff::*;

/// Store capability traits and the in-memory implementation
pub mod store;

/// Notification dispatch with quota and dedup enforcement
mod dispatch;
pub use dispatch::*;

/// Per-subscription polling worker
mod worker;
pub use worker::*;

/// Worker supervisor with backoff and admission control
mod supervisor;
pub use supervisor::*;

/// Subscription lifecycle service exposed to the web layer
mod service;
pub use service::*;
