use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use providers::ParkRef;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::WatchError;
use crate::store::{Stores, degraded_channels};
use crate::supervisor::Supervisor;
use crate::types::{
    Account, Channel, ChannelSelection, DatePreference, DeliveryStatus, NotificationRecord,
    OwnerId, Subscription, SubscriptionStatus,
};

/// Floor on the poll interval, protecting the upstream sites from
/// over-eager subscriptions. User-supplied intervals are clamped, never
/// rejected.
pub const MIN_CHECK_INTERVAL_MINUTES: u32 = 5;

/// Default poll interval for new subscriptions.
pub const DEFAULT_CHECK_INTERVAL_MINUTES: u32 = 60;

/// How many recent notification records the status view returns.
const STATUS_VIEW_RECORDS: usize = 20;

/// Consecutive failures before a channel is flagged degraded in the view.
const DEGRADED_FAILURE_THRESHOLD: usize = 3;

/// Parameters for creating a subscription.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    /// Owning user or device
    pub owner: OwnerId,
    /// Park ids, provider-prefixed (`rg:232447`, `rc:718`)
    pub parks: Vec<String>,
    /// First acceptable check-in date
    pub start_date: NaiveDate,
    /// Last acceptable check-in date
    pub end_date: NaiveDate,
    /// Minimum consecutive nights
    pub nights: u32,
    /// Which classified dates to surface
    pub preference: DatePreference,
    /// Requested delivery channels
    pub channels: ChannelSelection,
    /// Minutes between polls; clamped to the interval floor
    pub check_interval_minutes: Option<u32>,
}

/// Editable subscription fields. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdate {
    /// New search window
    pub window: Option<(NaiveDate, NaiveDate)>,
    /// New minimum nights
    pub nights: Option<u32>,
    /// New date preference
    pub preference: Option<DatePreference>,
    /// New channel selection
    pub channels: Option<ChannelSelection>,
    /// New poll interval in minutes
    pub check_interval_minutes: Option<u32>,
}

/// Owner-facing status view for UI polling and history display.
#[derive(Debug, Serialize)]
pub struct SubscriptionStatusView {
    /// Subscription id
    pub id: Uuid,
    /// Lifecycle state
    pub status: SubscriptionStatus,
    /// Owner-visible reason for a paused/expired status
    pub status_reason: Option<String>,
    /// When the worker last completed a poll
    pub last_checked: Option<DateTime<Utc>>,
    /// Most recent poll error, if any
    pub last_error: Option<String>,
    /// Recent notification attempts, newest first
    pub recent_notifications: Vec<NotificationSummary>,
    /// Channels whose recent attempts have all failed (informational)
    pub degraded_channels: Vec<Channel>,
}

/// Compact record view for the status endpoint.
#[derive(Debug, Serialize)]
pub struct NotificationSummary {
    /// Delivery channel, absent for quota skips
    pub channel: Option<Channel>,
    /// Attempt outcome
    pub status: DeliveryStatus,
    /// Rendered content summary
    pub summary: String,
    /// When the attempt was made
    pub created_at: DateTime<Utc>,
}

/// Subscription lifecycle operations exposed to the web layer. Every
/// mutation keeps the supervisor's worker table in step with the store.
pub struct SubscriptionService {
    stores: Stores,
    supervisor: Arc<Supervisor>,
}

impl SubscriptionService {
    /// Create the service.
    pub fn new(stores: Stores, supervisor: Arc<Supervisor>) -> Self {
        Self { stores, supervisor }
    }

    /// Create a subscription and start watching it.
    ///
    /// Fails with [`WatchError::QuotaExceeded`] when the owner's tier does
    /// not allow another active subscription.
    pub async fn create_subscription(
        &self,
        request: NewSubscription,
    ) -> Result<Subscription, WatchError> {
        let parks = validate_request(&request)?;

        let account = self
            .stores
            .accounts
            .get(&request.owner)
            .await?
            .unwrap_or_else(|| Account::free(request.owner.clone()));

        if let Some(max) = account.tier.max_active_subscriptions() {
            let active = self
                .stores
                .subscriptions
                .count_active_for_owner(&request.owner)
                .await?;
            if active >= max {
                return Err(WatchError::QuotaExceeded(format!(
                    "your plan allows {max} active watches"
                )));
            }
        }

        let interval = request
            .check_interval_minutes
            .unwrap_or(DEFAULT_CHECK_INTERVAL_MINUTES)
            .max(MIN_CHECK_INTERVAL_MINUTES);

        let subscription = Subscription {
            id: Uuid::new_v4(),
            owner: request.owner,
            parks,
            start_date: request.start_date,
            end_date: request.end_date,
            nights: request.nights,
            preference: request.preference,
            channels: request.channels,
            status: SubscriptionStatus::Active,
            status_reason: None,
            check_interval_minutes: interval,
            last_checked: None,
            last_error: None,
            created_at: Utc::now(),
        };

        self.stores.subscriptions.insert(&subscription).await?;
        self.supervisor.watch(subscription.id).await?;

        info!(
            subscription_id = %subscription.id,
            owner = %subscription.owner,
            parks = subscription.parks.len(),
            "Subscription created"
        );

        Ok(subscription)
    }

    /// Apply edits, then restart the worker so the new configuration takes
    /// effect as one unit.
    pub async fn update_subscription(
        &self,
        id: Uuid,
        update: SubscriptionUpdate,
    ) -> Result<Subscription, WatchError> {
        let mut subscription = self
            .stores
            .subscriptions
            .get(id)
            .await?
            .ok_or(WatchError::NotFound)?;

        if let Some((start, end)) = update.window {
            subscription.start_date = start;
            subscription.end_date = end;
        }
        if let Some(nights) = update.nights {
            subscription.nights = nights;
        }
        if let Some(preference) = update.preference {
            subscription.preference = preference;
        }
        if let Some(channels) = update.channels {
            subscription.channels = channels;
        }
        if let Some(interval) = update.check_interval_minutes {
            subscription.check_interval_minutes = interval.max(MIN_CHECK_INTERVAL_MINUTES);
        }

        validate_window(
            subscription.start_date,
            subscription.end_date,
            subscription.nights,
        )?;

        self.stores.subscriptions.update(&subscription).await?;
        self.supervisor.resync(id).await?;

        Ok(subscription)
    }

    /// Pause monitoring; the subscription can be resumed later.
    pub async fn pause_subscription(&self, id: Uuid) -> Result<(), WatchError> {
        self.require(id).await?;
        self.stores
            .subscriptions
            .set_status(id, SubscriptionStatus::Paused, Some("paused by owner".to_string()))
            .await?;
        self.supervisor.unwatch(id).await;
        Ok(())
    }

    /// Resume a paused subscription. A subscription whose window has passed
    /// expires instead of resuming.
    pub async fn resume_subscription(&self, id: Uuid) -> Result<(), WatchError> {
        let subscription = self.require(id).await?;

        if subscription.window_ended(Utc::now().date_naive()) {
            self.stores
                .subscriptions
                .set_status(
                    id,
                    SubscriptionStatus::Expired,
                    Some("search window ended".to_string()),
                )
                .await?;
            return Err(WatchError::Validation(
                "the search window has already ended".to_string(),
            ));
        }

        self.stores
            .subscriptions
            .set_status(id, SubscriptionStatus::Active, None)
            .await?;
        self.supervisor.watch(id).await?;
        Ok(())
    }

    /// Cancel a subscription. Terminal for the subscription; its audit
    /// records remain.
    pub async fn cancel_subscription(&self, id: Uuid) -> Result<(), WatchError> {
        self.require(id).await?;
        self.stores
            .subscriptions
            .set_status(id, SubscriptionStatus::Canceled, None)
            .await?;
        self.supervisor.unwatch(id).await;
        self.stores.snapshots.clear(id).await?;
        Ok(())
    }

    /// Fetch a subscription, checking existence.
    pub async fn get_subscription(&self, id: Uuid) -> Result<Subscription, WatchError> {
        self.require(id).await
    }

    /// All subscriptions for an owner, newest first.
    pub async fn list_subscriptions(
        &self,
        owner: &OwnerId,
    ) -> Result<Vec<Subscription>, WatchError> {
        Ok(self.stores.subscriptions.list_for_owner(owner).await?)
    }

    /// Status view for UI polling: lifecycle state, poll health, recent
    /// notification history, and degraded channels.
    pub async fn get_subscription_status(
        &self,
        id: Uuid,
    ) -> Result<SubscriptionStatusView, WatchError> {
        let subscription = self.require(id).await?;

        let records = self
            .stores
            .notifications
            .recent_for_subscription(id, STATUS_VIEW_RECORDS)
            .await?;

        let degraded = degraded_channels(&records, DEGRADED_FAILURE_THRESHOLD);

        Ok(SubscriptionStatusView {
            id,
            status: subscription.status,
            status_reason: subscription.status_reason,
            last_checked: subscription.last_checked,
            last_error: subscription.last_error,
            recent_notifications: records.into_iter().map(summarize).collect(),
            degraded_channels: degraded,
        })
    }

    async fn require(&self, id: Uuid) -> Result<Subscription, WatchError> {
        self.stores
            .subscriptions
            .get(id)
            .await?
            .ok_or(WatchError::NotFound)
    }
}

fn summarize(record: NotificationRecord) -> NotificationSummary {
    NotificationSummary {
        channel: record.channel,
        status: record.status,
        summary: record.summary,
        created_at: record.created_at,
    }
}

fn validate_request(request: &NewSubscription) -> Result<Vec<ParkRef>, WatchError> {
    if request.parks.is_empty() {
        return Err(WatchError::Validation(
            "at least one park id is required".to_string(),
        ));
    }
    if request.parks.iter().any(|p| p.trim().is_empty()) {
        return Err(WatchError::Validation("park ids must not be empty".to_string()));
    }

    validate_window(request.start_date, request.end_date, request.nights)?;

    Ok(request.parks.iter().map(|p| ParkRef::parse(p)).collect())
}

fn validate_window(start: NaiveDate, end: NaiveDate, nights: u32) -> Result<(), WatchError> {
    if end < start {
        return Err(WatchError::InvalidDateRange);
    }
    if nights < 1 {
        return Err(WatchError::Validation(
            "number of nights must be at least 1".to_string(),
        ));
    }

    let window_days = (end - start).num_days() + 1;
    if i64::from(nights) > window_days {
        return Err(WatchError::Validation(format!(
            "requested {nights} nights exceeds the {window_days}-day window"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use providers::{AvailabilityProvider, DayAvailability, ProviderError};

    use crate::dispatch::NotificationDispatcher;
    use crate::store::MemoryStore;
    use crate::types::{AccountTier, ContactPoint};

    struct EmptyProvider;

    #[async_trait]
    impl AvailabilityProvider for EmptyProvider {
        async fn fetch_availability(
            &self,
            _park: &ParkRef,
            _start: NaiveDate,
            _end: NaiveDate,
            _nights: u32,
        ) -> Result<Vec<DayAvailability>, ProviderError> {
            Ok(vec![])
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn build_service() -> (SubscriptionService, Stores, Arc<Supervisor>) {
        let stores = MemoryStore::new().into_stores();
        let dispatcher = Arc::new(NotificationDispatcher::new(
            stores.clone(),
            None,
            None,
            None,
            None,
        ));
        let supervisor = Supervisor::new(
            stores.clone(),
            Arc::new(EmptyProvider),
            dispatcher,
            None,
        );
        (
            SubscriptionService::new(stores.clone(), supervisor.clone()),
            stores,
            supervisor,
        )
    }

    fn new_subscription(owner: OwnerId) -> NewSubscription {
        NewSubscription {
            owner,
            parks: vec!["rg:232447".to_string()],
            start_date: date(2030, 8, 1),
            end_date: date(2030, 9, 30),
            nights: 2,
            preference: DatePreference::Flexible,
            channels: ChannelSelection::default(),
            check_interval_minutes: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn create_starts_a_worker_and_parses_parks() {
        let (service, _stores, supervisor) = build_service().await;
        let owner = OwnerId::Device("d1".to_string());

        let sub = service
            .create_subscription(new_subscription(owner))
            .await
            .unwrap();

        assert_eq!(sub.parks[0].raw_id(), "232447");
        assert_eq!(sub.check_interval_minutes, DEFAULT_CHECK_INTERVAL_MINUTES);
        assert_eq!(supervisor.stats().await.live_workers, 1);

        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn interval_is_clamped_to_the_floor() {
        let (service, _stores, supervisor) = build_service().await;
        let mut request = new_subscription(OwnerId::Device("d1".to_string()));
        request.check_interval_minutes = Some(1);

        let sub = service.create_subscription(request).await.unwrap();
        assert_eq!(sub.check_interval_minutes, MIN_CHECK_INTERVAL_MINUTES);

        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn free_tier_is_capped_at_three_active_watches() {
        let (service, _stores, supervisor) = build_service().await;
        let owner = OwnerId::Device("d1".to_string());

        for _ in 0..3 {
            service
                .create_subscription(new_subscription(owner.clone()))
                .await
                .unwrap();
        }

        let err = service
            .create_subscription(new_subscription(owner))
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::QuotaExceeded(_)));

        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn paid_tier_raises_the_watch_cap() {
        let (service, stores, supervisor) = build_service().await;
        let owner = OwnerId::User(Uuid::new_v4());
        stores
            .accounts
            .upsert(&Account {
                owner: owner.clone(),
                tier: AccountTier::Basic,
                email: Some(ContactPoint::verified("c@example.com")),
                phone: None,
                whatsapp: None,
            })
            .await
            .unwrap();

        for _ in 0..4 {
            service
                .create_subscription(new_subscription(owner.clone()))
                .await
                .unwrap();
        }

        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_windows_are_rejected() {
        let (service, _stores, supervisor) = build_service().await;
        let owner = OwnerId::Device("d1".to_string());

        let mut backwards = new_subscription(owner.clone());
        backwards.start_date = date(2030, 9, 30);
        backwards.end_date = date(2030, 8, 1);
        assert!(matches!(
            service.create_subscription(backwards).await.unwrap_err(),
            WatchError::InvalidDateRange
        ));

        let mut too_long = new_subscription(owner.clone());
        too_long.end_date = date(2030, 8, 3);
        too_long.nights = 10;
        assert!(matches!(
            service.create_subscription(too_long).await.unwrap_err(),
            WatchError::Validation(_)
        ));

        let mut no_parks = new_subscription(owner);
        no_parks.parks.clear();
        assert!(matches!(
            service.create_subscription(no_parks).await.unwrap_err(),
            WatchError::Validation(_)
        ));

        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_resume_drive_the_supervisor() {
        let (service, stores, supervisor) = build_service().await;
        let owner = OwnerId::Device("d1".to_string());
        let sub = service
            .create_subscription(new_subscription(owner))
            .await
            .unwrap();

        service.pause_subscription(sub.id).await.unwrap();
        assert_eq!(supervisor.stats().await.live_workers, 0);
        let stored = stores.subscriptions.get(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Paused);
        assert_eq!(stored.status_reason.as_deref(), Some("paused by owner"));

        service.resume_subscription(sub.id).await.unwrap();
        assert_eq!(supervisor.stats().await.live_workers, 1);
        let stored = stores.subscriptions.get(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Active);

        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn resume_of_a_dead_window_expires_instead() {
        let (service, stores, supervisor) = build_service().await;
        let owner = OwnerId::Device("d1".to_string());
        let mut request = new_subscription(owner);
        request.start_date = date(2020, 8, 1);
        request.end_date = date(2020, 9, 30);

        // Insert directly: create_subscription would start a worker that
        // expires it; this exercises the resume path in isolation.
        let sub = Subscription {
            id: Uuid::new_v4(),
            owner: request.owner,
            parks: vec![ParkRef::parse("rg:232447")],
            start_date: request.start_date,
            end_date: request.end_date,
            nights: 1,
            preference: request.preference,
            channels: request.channels,
            status: SubscriptionStatus::Paused,
            status_reason: None,
            check_interval_minutes: 60,
            last_checked: None,
            last_error: None,
            created_at: Utc::now(),
        };
        stores.subscriptions.insert(&sub).await.unwrap();

        let err = service.resume_subscription(sub.id).await.unwrap_err();
        assert!(matches!(err, WatchError::Validation(_)));

        let stored = stores.subscriptions.get(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Expired);

        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_clears_the_snapshot_baseline() {
        let (service, stores, supervisor) = build_service().await;
        let owner = OwnerId::Device("d1".to_string());
        let sub = service
            .create_subscription(new_subscription(owner))
            .await
            .unwrap();

        // Give the worker a cycle to store a baseline.
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;

        service.cancel_subscription(sub.id).await.unwrap();
        assert!(stores.snapshots.load(sub.id).await.unwrap().is_none());
        assert_eq!(supervisor.stats().await.live_workers, 0);

        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn update_restarts_the_worker_with_new_config() {
        let (service, stores, supervisor) = build_service().await;
        let owner = OwnerId::Device("d1".to_string());
        let sub = service
            .create_subscription(new_subscription(owner))
            .await
            .unwrap();

        let updated = service
            .update_subscription(
                sub.id,
                SubscriptionUpdate {
                    preference: Some(DatePreference::All),
                    check_interval_minutes: Some(2),
                    ..SubscriptionUpdate::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.preference, DatePreference::All);
        // Below the floor, so clamped.
        assert_eq!(updated.check_interval_minutes, MIN_CHECK_INTERVAL_MINUTES);

        let stored = stores.subscriptions.get(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.preference, DatePreference::All);
        assert_eq!(supervisor.stats().await.live_workers, 1);

        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn status_view_surfaces_poll_health() {
        let (service, stores, supervisor) = build_service().await;
        let owner = OwnerId::Device("d1".to_string());
        let sub = service
            .create_subscription(new_subscription(owner))
            .await
            .unwrap();

        stores
            .subscriptions
            .mark_checked(sub.id, Utc::now(), Some("transient glitch".to_string()))
            .await
            .unwrap();

        let view = service.get_subscription_status(sub.id).await.unwrap();
        assert_eq!(view.status, SubscriptionStatus::Active);
        assert!(view.last_checked.is_some());
        assert_eq!(view.last_error.as_deref(), Some("transient glitch"));
        assert!(view.recent_notifications.is_empty());
        assert!(view.degraded_channels.is_empty());

        supervisor.shutdown().await;
    }
}
