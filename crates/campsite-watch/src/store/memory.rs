use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::snapshot::AvailabilitySnapshot;
use crate::types::{
    Account, DedupKey, DeliveryStatus, NotificationRecord, OwnerId, Subscription,
    SubscriptionStatus,
};

use super::{
    AccountStore, NotificationStore, SnapshotStore, StoreError, Stores, SubscriptionStore,
};

/// In-memory store backing tests and single-process deployments.
///
/// Every trait method takes and releases one lock, so each operation is an
/// atomic read-modify-write with respect to the other workers and the web
/// handlers sharing the store.
pub struct MemoryStore {
    subscriptions: RwLock<HashMap<Uuid, Subscription>>,
    snapshots: RwLock<HashMap<Uuid, AvailabilitySnapshot>>,
    accounts: RwLock<HashMap<OwnerId, Account>>,
    records: RwLock<Vec<NotificationRecord>>,
    seen_keys: RwLock<HashMap<Uuid, HashSet<DedupKey>>>,
    quota_used: Mutex<HashMap<OwnerId, u32>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            accounts: RwLock::new(HashMap::new()),
            records: RwLock::new(Vec::new()),
            seen_keys: RwLock::new(HashMap::new()),
            quota_used: Mutex::new(HashMap::new()),
        }
    }

    /// Wrap one shared store instance into a [`Stores`] bundle.
    pub fn into_stores(self) -> Stores {
        let shared = Arc::new(self);
        Stores {
            subscriptions: shared.clone(),
            snapshots: shared.clone(),
            accounts: shared.clone(),
            notifications: shared,
        }
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn insert(&self, subscription: &Subscription) -> Result<(), StoreError> {
        self.subscriptions
            .write()
            .await
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Subscription>, StoreError> {
        Ok(self.subscriptions.read().await.get(&id).cloned())
    }

    async fn update(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let mut subs = self.subscriptions.write().await;
        if !subs.contains_key(&subscription.id) {
            return Err(StoreError::NotFound);
        }
        subs.insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: SubscriptionStatus,
        reason: Option<String>,
    ) -> Result<(), StoreError> {
        let mut subs = self.subscriptions.write().await;
        let sub = subs.get_mut(&id).ok_or(StoreError::NotFound)?;
        sub.status = status;
        sub.status_reason = reason;
        Ok(())
    }

    async fn mark_checked(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut subs = self.subscriptions.write().await;
        let sub = subs.get_mut(&id).ok_or(StoreError::NotFound)?;
        sub.last_checked = Some(at);
        sub.last_error = error;
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<Subscription>, StoreError> {
        Ok(self
            .subscriptions
            .read()
            .await
            .values()
            .filter(|s| s.status == SubscriptionStatus::Active)
            .cloned()
            .collect())
    }

    async fn list_for_owner(&self, owner: &OwnerId) -> Result<Vec<Subscription>, StoreError> {
        let mut subs: Vec<Subscription> = self
            .subscriptions
            .read()
            .await
            .values()
            .filter(|s| &s.owner == owner)
            .cloned()
            .collect();
        subs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(subs)
    }

    async fn count_active_for_owner(&self, owner: &OwnerId) -> Result<u32, StoreError> {
        Ok(self
            .subscriptions
            .read()
            .await
            .values()
            .filter(|s| &s.owner == owner && s.status == SubscriptionStatus::Active)
            .count() as u32)
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.subscriptions
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<AvailabilitySnapshot>, StoreError> {
        Ok(self.snapshots.read().await.get(&subscription_id).cloned())
    }

    async fn replace(&self, snapshot: &AvailabilitySnapshot) -> Result<(), StoreError> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.subscription_id, snapshot.clone());
        Ok(())
    }

    async fn clear(&self, subscription_id: Uuid) -> Result<(), StoreError> {
        self.snapshots.write().await.remove(&subscription_id);
        Ok(())
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn get(&self, owner: &OwnerId) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts.read().await.get(owner).cloned())
    }

    async fn upsert(&self, account: &Account) -> Result<(), StoreError> {
        self.accounts
            .write()
            .await
            .insert(account.owner.clone(), account.clone());
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn unseen(
        &self,
        subscription_id: Uuid,
        keys: &[DedupKey],
    ) -> Result<Vec<DedupKey>, StoreError> {
        let seen = self.seen_keys.read().await;
        let seen_for_sub = seen.get(&subscription_id);
        Ok(keys
            .iter()
            .filter(|key| seen_for_sub.is_none_or(|set| !set.contains(key)))
            .cloned()
            .collect())
    }

    async fn record(&self, record: &NotificationRecord) -> Result<(), StoreError> {
        if record.status != DeliveryStatus::SkippedQuota {
            let mut seen = self.seen_keys.write().await;
            let set = seen.entry(record.subscription_id).or_default();
            for key in &record.covered {
                set.insert(key.clone());
            }
        }

        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn try_reserve_quota(&self, owner: &OwnerId, limit: u32) -> Result<bool, StoreError> {
        // Increment-and-check under one lock so two subscriptions of the
        // same account cannot both squeak past the cap.
        let mut used = self.quota_used.lock().await;
        let count = used.entry(owner.clone()).or_insert(0);
        if *count >= limit {
            return Ok(false);
        }
        *count += 1;
        Ok(true)
    }

    async fn sent_count(&self, owner: &OwnerId) -> Result<u32, StoreError> {
        Ok(*self.quota_used.lock().await.get(owner).unwrap_or(&0))
    }

    async fn recent_for_subscription(
        &self,
        subscription_id: Uuid,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .rev()
            .filter(|r| r.subscription_id == subscription_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
