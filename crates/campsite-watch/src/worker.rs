use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use providers::{AvailabilityProvider, ProviderError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::diff::diff;
use crate::dispatch::{DeliveryOutcome, NotificationDispatcher};
use crate::snapshot::AvailabilitySnapshot;
use crate::store::{StoreError, Stores};
use crate::supervisor::WorkerEvent;
use crate::types::SubscriptionStatus;

/// Why a worker stopped cleanly. The subscription itself persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The supervisor cancelled the worker
    Cancelled,
    /// The subscription left `active` status
    NoLongerActive,
    /// The subscription no longer exists
    Missing,
    /// The search window end date has passed; status was set to expired
    WindowEnded,
    /// The dispatcher exhausted the owner's quota and paused the subscription
    QuotaExhausted,
}

/// Errors that crash a worker. The supervisor alone decides whether and
/// when to restart; the worker never self-restarts.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The availability provider failed
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// A store operation failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Notification dispatch failed
    #[error("dispatch error: {0}")]
    Dispatch(String),
}

/// Terminal state of one worker instance.
#[derive(Debug)]
pub enum WorkerExit {
    /// Clean exit; no restart wanted
    Stopped(StopReason),
    /// Crash reported to the supervisor for backoff/restart policy
    Crashed(WorkerError),
}

/// Shared dependencies handed to every worker.
#[derive(Clone)]
pub struct WorkerContext {
    /// Store bundle
    pub stores: Stores,
    /// Availability source
    pub provider: Arc<dyn AvailabilityProvider>,
    /// Notification dispatcher
    pub dispatcher: Arc<NotificationDispatcher>,
    /// Hard timeout for one provider call
    pub provider_timeout: Duration,
}

/// Run the poll/sleep cycle for one subscription until it stops or crashes.
///
/// `Starting -> Polling -> Sleeping -> (Polling | Stopping)`. Cancellation
/// takes effect at the next suspension point: a worker mid-poll finishes the
/// poll (so the snapshot is never half-updated) and checks before sleeping.
pub(crate) async fn run_worker(
    ctx: WorkerContext,
    subscription_id: Uuid,
    cancel: CancellationToken,
    events: mpsc::Sender<WorkerEvent>,
) -> WorkerExit {
    // Starting: the diff baseline survives worker restarts via the store.
    let mut previous = match ctx.stores.snapshots.load(subscription_id).await {
        Ok(snapshot) => snapshot,
        Err(e) => return WorkerExit::Crashed(e.into()),
    };

    info!(
        %subscription_id,
        has_baseline = previous.is_some(),
        "Subscription worker started"
    );

    loop {
        // Reload each cycle so UI edits (pause, cancel) are observed.
        let subscription = match ctx.stores.subscriptions.get(subscription_id).await {
            Ok(Some(sub)) => sub,
            Ok(None) => {
                warn!(%subscription_id, "Subscription disappeared; worker exiting");
                return WorkerExit::Stopped(StopReason::Missing);
            }
            Err(e) => return WorkerExit::Crashed(e.into()),
        };

        if !subscription.is_active() {
            debug!(%subscription_id, status = subscription.status.as_str(), "Subscription no longer active");
            return WorkerExit::Stopped(StopReason::NoLongerActive);
        }

        let today = Utc::now().date_naive();
        if subscription.window_ended(today) {
            info!(%subscription_id, end_date = %subscription.end_date, "Search window ended; expiring subscription");
            if let Err(e) = ctx
                .stores
                .subscriptions
                .set_status(
                    subscription_id,
                    SubscriptionStatus::Expired,
                    Some("search window ended".to_string()),
                )
                .await
            {
                return WorkerExit::Crashed(e.into());
            }
            return WorkerExit::Stopped(StopReason::WindowEnded);
        }

        // Polling: all parks under one snapshot. Any provider failure aborts
        // the cycle before the snapshot is touched, so an upstream outage is
        // never mistaken for "all availability lost".
        let mut current = AvailabilitySnapshot::new(subscription_id);
        for park in &subscription.parks {
            let fetched = tokio::time::timeout(
                ctx.provider_timeout,
                ctx.provider.fetch_availability(
                    park,
                    subscription.start_date,
                    subscription.end_date,
                    subscription.nights,
                ),
            )
            .await;

            let provider_error = match fetched {
                Ok(Ok(days)) => {
                    current.absorb(park, &days);
                    continue;
                }
                Ok(Err(e)) => e,
                Err(_) => ProviderError::Transient("provider request timed out".to_string()),
            };

            warn!(%subscription_id, park = %park, error = %provider_error, "Poll failed");
            if let Err(e) = ctx
                .stores
                .subscriptions
                .mark_checked(subscription_id, Utc::now(), Some(provider_error.to_string()))
                .await
            {
                error!(%subscription_id, error = %e, "Failed to record poll error");
            }
            return WorkerExit::Crashed(provider_error.into());
        }
        current.captured_at = Utc::now();

        let delta = diff(previous.as_ref(), &current, subscription.preference);

        let mut quota_paused = false;
        if !delta.is_empty() {
            debug!(%subscription_id, openings = delta.openings.len(), "New availability detected");
            match ctx.dispatcher.dispatch(&subscription, &delta).await {
                Ok(DeliveryOutcome::SkippedQuota) => quota_paused = true,
                Ok(_) => {}
                Err(e) => return WorkerExit::Crashed(WorkerError::Dispatch(e.to_string())),
            }
        }

        // Persist the new baseline wholesale, then stamp the poll.
        if let Err(e) = ctx.stores.snapshots.replace(&current).await {
            return WorkerExit::Crashed(e.into());
        }
        if let Err(e) = ctx
            .stores
            .subscriptions
            .mark_checked(subscription_id, Utc::now(), None)
            .await
        {
            return WorkerExit::Crashed(e.into());
        }
        previous = Some(current);

        let _ = events
            .send(WorkerEvent::PollSucceeded { subscription_id })
            .await;

        if quota_paused {
            return WorkerExit::Stopped(StopReason::QuotaExhausted);
        }

        // Sleeping: interval wait or cancellation, whichever comes first.
        let interval = Duration::from_secs(u64::from(subscription.check_interval_minutes) * 60);
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(%subscription_id, "Worker cancelled");
                return WorkerExit::Stopped(StopReason::Cancelled);
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use notification_services::{ChannelError, EmailSender};
    use providers::{DayAvailability, ParkRef};

    use crate::store::MemoryStore;
    use crate::types::{
        Account, AccountTier, ChannelSelection, ContactPoint, DatePreference, DeliveryStatus,
        OwnerId, Subscription,
    };

    /// Provider that replays a scripted sequence of responses, then keeps
    /// returning the configured tail response.
    struct ScriptedProvider {
        script: Mutex<VecDeque<Result<Vec<DayAvailability>, ProviderError>>>,
        tail: Result<Vec<DayAvailability>, ProviderError>,
        calls: Mutex<u32>,
    }

    impl ScriptedProvider {
        fn new(
            script: Vec<Result<Vec<DayAvailability>, ProviderError>>,
            tail: Result<Vec<DayAvailability>, ProviderError>,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                tail,
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl AvailabilityProvider for ScriptedProvider {
        async fn fetch_availability(
            &self,
            _park: &ParkRef,
            _start: NaiveDate,
            _end: NaiveDate,
            _nights: u32,
        ) -> Result<Vec<DayAvailability>, ProviderError> {
            *self.calls.lock().unwrap() += 1;
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.tail.clone())
        }
    }

    struct RecordingEmailSender {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl EmailSender for RecordingEmailSender {
        async fn send_email(
            &self,
            to: &str,
            _subject: &str,
            body: &str,
        ) -> Result<String, ChannelError> {
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), body.to_string()));
            Ok("test-id".to_string())
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// First `weekday` on or after `from`. Worker tests need a window that
    /// is still in the future when they run, so dates are derived instead
    /// of hard-coded.
    fn next_weekday(mut from: NaiveDate, weekday: chrono::Weekday) -> NaiveDate {
        use chrono::Datelike;
        while from.weekday() != weekday {
            from = from + chrono::Days::new(1);
        }
        from
    }

    fn window_start() -> NaiveDate {
        date(2030, 8, 1)
    }

    fn day(on: NaiveDate, count: u32) -> DayAvailability {
        DayAvailability {
            date: on,
            site_count: count,
            checkout_date: on + chrono::Days::new(1),
        }
    }

    async fn seeded_stores(sub: &Subscription) -> Stores {
        let stores = MemoryStore::new().into_stores();
        stores.subscriptions.insert(sub).await.unwrap();
        stores
            .accounts
            .upsert(&Account {
                owner: sub.owner.clone(),
                tier: AccountTier::Free,
                email: Some(ContactPoint::verified("camper@example.com")),
                phone: None,
                whatsapp: None,
            })
            .await
            .unwrap();
        stores
    }

    fn subscription() -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            owner: OwnerId::Device("d1".to_string()),
            parks: vec![ParkRef::parse("rg:232447")],
            start_date: window_start(),
            end_date: date(2030, 9, 30),
            nights: 1,
            preference: DatePreference::Weekends,
            channels: ChannelSelection::default(),
            status: SubscriptionStatus::Active,
            status_reason: None,
            check_interval_minutes: 60,
            last_checked: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    fn context(
        stores: &Stores,
        provider: Arc<dyn AvailabilityProvider>,
        sender: Arc<RecordingEmailSender>,
    ) -> WorkerContext {
        let dispatcher = Arc::new(NotificationDispatcher::new(
            stores.clone(),
            Some(sender),
            None,
            None,
            None,
        ));
        WorkerContext {
            stores: stores.clone(),
            provider,
            dispatcher,
            provider_timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn baseline_then_improvement_notifies_exactly_the_new_opening() {
        let sub = subscription();
        let stores = seeded_stores(&sub).await;

        // Cycle 1: a Friday x2. Cycle 2: count up to 3 plus a Wednesday the
        // weekends preference must filter out. Cycle 3 errors so the worker
        // exits and the test can observe the run.
        let friday = next_weekday(window_start(), chrono::Weekday::Fri);
        let wednesday = next_weekday(friday, chrono::Weekday::Wed);
        let provider = ScriptedProvider::new(
            vec![
                Ok(vec![day(friday, 2)]),
                Ok(vec![day(friday, 3), day(wednesday, 1)]),
            ],
            Err(ProviderError::Transient("script exhausted".to_string())),
        );
        let sender = Arc::new(RecordingEmailSender {
            sent: Mutex::new(Vec::new()),
        });

        let ctx = context(&stores, provider.clone(), sender.clone());
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let exit = run_worker(ctx, sub.id, cancel, tx).await;
        assert!(matches!(
            exit,
            WorkerExit::Crashed(WorkerError::Provider(ProviderError::Transient(_)))
        ));

        // Two successful polls happened before the scripted failure.
        let mut successes = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, WorkerEvent::PollSucceeded { .. }) {
                successes += 1;
            }
        }
        assert_eq!(successes, 2);

        // First cycle was a silent baseline; the single email covers only
        // the improved Friday, not the filtered Wednesday.
        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let body = &sent[0].1;
        assert!(body.contains(&friday.format("%Y-%m-%d").to_string()));
        assert!(body.contains("(was 2)"));
        assert!(!body.contains(&wednesday.format("%Y-%m-%d").to_string()));
        drop(sent);

        // The crash left the baseline from cycle 2 intact.
        let snapshot = stores.snapshots.load(sub.id).await.unwrap().unwrap();
        assert_eq!(snapshot.slots.len(), 2);

        let stored = stores.subscriptions.get(sub.id).await.unwrap().unwrap();
        assert!(stored.last_error.unwrap().contains("script exhausted"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_observed_at_the_next_suspension_point() {
        let sub = subscription();
        let stores = seeded_stores(&sub).await;
        let provider = ScriptedProvider::new(vec![], Ok(vec![]));
        let sender = Arc::new(RecordingEmailSender {
            sent: Mutex::new(Vec::new()),
        });

        let ctx = context(&stores, provider, sender);
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();

        let handle = tokio::spawn(async move { run_worker(ctx, sub.id, worker_cancel, tx).await });

        // Let the first poll complete, then cancel during the sleep.
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let exit = handle.await.unwrap();
        assert!(matches!(exit, WorkerExit::Stopped(StopReason::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn passed_window_expires_the_subscription() {
        let mut sub = subscription();
        sub.start_date = date(2024, 5, 1);
        sub.end_date = date(2024, 5, 31);
        let stores = seeded_stores(&sub).await;
        let provider = ScriptedProvider::new(vec![], Ok(vec![]));
        let sender = Arc::new(RecordingEmailSender {
            sent: Mutex::new(Vec::new()),
        });

        let ctx = context(&stores, provider.clone(), sender);
        let (tx, _rx) = mpsc::channel(16);

        let exit = run_worker(ctx, sub.id, CancellationToken::new(), tx).await;
        assert!(matches!(exit, WorkerExit::Stopped(StopReason::WindowEnded)));
        // Never polled the provider for a dead window.
        assert_eq!(provider.calls(), 0);

        let stored = stores.subscriptions.get(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Expired);
        assert_eq!(stored.status_reason.as_deref(), Some("search window ended"));
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_subscription_stops_without_polling() {
        let mut sub = subscription();
        sub.status = SubscriptionStatus::Paused;
        let stores = seeded_stores(&sub).await;
        let provider = ScriptedProvider::new(vec![], Ok(vec![]));
        let sender = Arc::new(RecordingEmailSender {
            sent: Mutex::new(Vec::new()),
        });

        let ctx = context(&stores, provider.clone(), sender);
        let (tx, _rx) = mpsc::channel(16);

        let exit = run_worker(ctx, sub.id, CancellationToken::new(), tx).await;
        assert!(matches!(exit, WorkerExit::Stopped(StopReason::NoLongerActive)));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn provider_hang_crashes_via_the_hard_timeout() {
        struct HangingProvider;

        #[async_trait]
        impl AvailabilityProvider for HangingProvider {
            async fn fetch_availability(
                &self,
                _park: &ParkRef,
                _start: NaiveDate,
                _end: NaiveDate,
                _nights: u32,
            ) -> Result<Vec<DayAvailability>, ProviderError> {
                std::future::pending().await
            }
        }

        let sub = subscription();
        let stores = seeded_stores(&sub).await;
        let sender = Arc::new(RecordingEmailSender {
            sent: Mutex::new(Vec::new()),
        });
        let mut ctx = context(&stores, Arc::new(HangingProvider), sender);
        ctx.provider_timeout = Duration::from_secs(5);
        let (tx, _rx) = mpsc::channel(16);

        let exit = run_worker(ctx, sub.id, CancellationToken::new(), tx).await;
        assert!(matches!(
            exit,
            WorkerExit::Crashed(WorkerError::Provider(ProviderError::Transient(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn quota_exhaustion_stops_the_worker_cleanly() {
        let sub = subscription();
        let stores = seeded_stores(&sub).await;

        // Burn the whole quota up front.
        for _ in 0..5 {
            assert!(
                stores
                    .notifications
                    .try_reserve_quota(&sub.owner, 5)
                    .await
                    .unwrap()
            );
        }

        let friday = next_weekday(window_start(), chrono::Weekday::Fri);
        let provider = ScriptedProvider::new(
            vec![Ok(vec![]), Ok(vec![day(friday, 2)])],
            Ok(vec![day(friday, 2)]),
        );
        let sender = Arc::new(RecordingEmailSender {
            sent: Mutex::new(Vec::new()),
        });

        let ctx = context(&stores, provider, sender.clone());
        let (tx, _rx) = mpsc::channel(16);

        let exit = run_worker(ctx, sub.id, CancellationToken::new(), tx).await;
        assert!(matches!(
            exit,
            WorkerExit::Stopped(StopReason::QuotaExhausted)
        ));
        assert!(sender.sent.lock().unwrap().is_empty());

        let stored = stores.subscriptions.get(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Paused);

        let records = stores
            .notifications
            .recent_for_subscription(sub.id, 5)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, DeliveryStatus::SkippedQuota);
    }
}
