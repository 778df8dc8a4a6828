//! Store capability traits shared by the scheduler and the web layer.
//!
//! All mutating operations are atomic per key: implementations must not let
//! a worker's write interleave with a UI edit into an inconsistent state.
//! Quota reservation in particular is a single increment-and-check, never a
//! read-then-write pair.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::snapshot::AvailabilitySnapshot;
use crate::types::{
    Account, Channel, DedupKey, NotificationRecord, OwnerId, Subscription, SubscriptionStatus,
};

/// In-memory store implementation
mod memory;
pub use memory::MemoryStore;

/// Errors raised by store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying database failure
    #[error("Database error: {0}")]
    Database(String),

    /// The keyed entity does not exist
    #[error("Record not found")]
    NotFound,

    /// Stored data could not be decoded
    #[error("Data format error: {0}")]
    DataFormat(String),
}

/// Durable subscription records.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Insert a new subscription.
    async fn insert(&self, subscription: &Subscription) -> Result<(), StoreError>;

    /// Fetch a subscription by id.
    async fn get(&self, id: Uuid) -> Result<Option<Subscription>, StoreError>;

    /// Replace a subscription's mutable fields.
    async fn update(&self, subscription: &Subscription) -> Result<(), StoreError>;

    /// Atomically set the lifecycle status and owner-visible reason.
    async fn set_status(
        &self,
        id: Uuid,
        status: SubscriptionStatus,
        reason: Option<String>,
    ) -> Result<(), StoreError>;

    /// Record the completion of a poll: timestamp plus optional error.
    async fn mark_checked(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    /// All subscriptions currently in `active` status.
    async fn list_active(&self) -> Result<Vec<Subscription>, StoreError>;

    /// All subscriptions belonging to an owner, newest first.
    async fn list_for_owner(&self, owner: &OwnerId) -> Result<Vec<Subscription>, StoreError>;

    /// Number of `active` subscriptions an owner holds.
    async fn count_active_for_owner(&self, owner: &OwnerId) -> Result<u32, StoreError>;

    /// Delete a subscription outright.
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;
}

/// The per-subscription diff baseline.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Load the current snapshot, if one exists.
    async fn load(&self, subscription_id: Uuid) -> Result<Option<AvailabilitySnapshot>, StoreError>;

    /// Replace the current snapshot wholesale.
    async fn replace(&self, snapshot: &AvailabilitySnapshot) -> Result<(), StoreError>;

    /// Drop the snapshot (subscription canceled or deleted).
    async fn clear(&self, subscription_id: Uuid) -> Result<(), StoreError>;
}

/// Account read model for tier and contact lookups.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Fetch the account for an owner.
    async fn get(&self, owner: &OwnerId) -> Result<Option<Account>, StoreError>;

    /// Create or replace an account.
    async fn upsert(&self, account: &Account) -> Result<(), StoreError>;
}

/// Notification audit log, dedup state, and quota counters.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Filter `keys` down to those never covered by a prior record.
    async fn unseen(
        &self,
        subscription_id: Uuid,
        keys: &[DedupKey],
    ) -> Result<Vec<DedupKey>, StoreError>;

    /// Append an immutable record. Implementations also mark the record's
    /// covered keys as seen, except for quota skips (those openings remain
    /// notifiable after an upgrade).
    async fn record(&self, record: &NotificationRecord) -> Result<(), StoreError>;

    /// Atomically consume one unit of the owner's notification quota.
    /// Returns `false`, without consuming, once `limit` is reached.
    async fn try_reserve_quota(&self, owner: &OwnerId, limit: u32) -> Result<bool, StoreError>;

    /// Number of quota units the owner has consumed.
    async fn sent_count(&self, owner: &OwnerId) -> Result<u32, StoreError>;

    /// Most recent records for a subscription, newest first.
    async fn recent_for_subscription(
        &self,
        subscription_id: Uuid,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, StoreError>;
}

/// Channels whose most recent `threshold` attempts for this subscription all
/// failed. Informational only; the channel is never auto-disabled, since it
/// may be the owner's only configured one.
pub fn degraded_channels(records: &[NotificationRecord], threshold: usize) -> Vec<Channel> {
    let mut degraded = Vec::new();

    for channel in [Channel::Email, Channel::Sms, Channel::Whatsapp] {
        let recent: Vec<_> = records
            .iter()
            .filter(|r| r.channel == Some(channel))
            .take(threshold)
            .collect();

        if recent.len() >= threshold
            && recent
                .iter()
                .all(|r| r.status == crate::types::DeliveryStatus::Failed)
        {
            degraded.push(channel);
        }
    }

    degraded
}

/// Bundle of the four store handles threaded through the scheduler.
#[derive(Clone)]
pub struct Stores {
    /// Subscription records
    pub subscriptions: Arc<dyn SubscriptionStore>,
    /// Diff baselines
    pub snapshots: Arc<dyn SnapshotStore>,
    /// Account read model
    pub accounts: Arc<dyn AccountStore>,
    /// Notification log and quota
    pub notifications: Arc<dyn NotificationStore>,
}
