use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use notification_services::{ChannelError, EmailSender, SmsSender, WhatsappSender};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::diff::AvailabilityDelta;
use crate::store::Stores;
use crate::types::{
    Account, Channel, DedupKey, DeliveryStatus, NotificationRecord, Subscription,
    SubscriptionStatus,
};
use crate::{Opening, WatchError};

/// Configuration for the notification dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Hard timeout for a single channel send (default: 30 seconds)
    pub send_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(30),
        }
    }
}

/// What happened to one dispatch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Every opening in the delta had already been notified
    NothingNew,
    /// The owner's quota is exhausted; the subscription was auto-paused
    SkippedQuota,
    /// At least one channel attempt was made
    Dispatched {
        /// Channels that accepted the message
        sent: u32,
        /// Channels that failed
        failed: u32,
    },
}

/// Renders one aggregated message per poll cycle and fans it out to every
/// eligible channel, writing an audit record per attempt.
pub struct NotificationDispatcher {
    stores: Stores,
    email: Option<Arc<dyn EmailSender>>,
    sms: Option<Arc<dyn SmsSender>>,
    whatsapp: Option<Arc<dyn WhatsappSender>>,
    config: DispatcherConfig,
}

impl NotificationDispatcher {
    /// Create a dispatcher. Channels without a configured sender are skipped
    /// at dispatch time.
    pub fn new(
        stores: Stores,
        email: Option<Arc<dyn EmailSender>>,
        sms: Option<Arc<dyn SmsSender>>,
        whatsapp: Option<Arc<dyn WhatsappSender>>,
        config: Option<DispatcherConfig>,
    ) -> Self {
        Self {
            stores,
            email,
            sms,
            whatsapp,
            config: config.unwrap_or_default(),
        }
    }

    /// Dispatch notifications for one poll cycle's delta.
    ///
    /// Dedup, then quota, then one aggregated message to every eligible
    /// channel. One [`NotificationRecord`] is written per channel attempt
    /// regardless of success; a failure on one channel never blocks the
    /// others.
    pub async fn dispatch(
        &self,
        subscription: &Subscription,
        delta: &AvailabilityDelta,
    ) -> Result<DeliveryOutcome, WatchError> {
        let all_keys: Vec<DedupKey> = delta.openings.iter().map(|o| o.dedup_key()).collect();
        let fresh_keys = self
            .stores
            .notifications
            .unseen(subscription.id, &all_keys)
            .await?;

        if fresh_keys.is_empty() {
            return Ok(DeliveryOutcome::NothingNew);
        }

        let fresh: Vec<&Opening> = delta
            .openings
            .iter()
            .filter(|o| fresh_keys.contains(&o.dedup_key()))
            .collect();

        let account = self
            .stores
            .accounts
            .get(&subscription.owner)
            .await?
            .unwrap_or_else(|| Account::free(subscription.owner.clone()));

        let plan = self.eligible_channels(subscription, &account);
        if plan.is_empty() {
            warn!(
                subscription_id = %subscription.id,
                "No deliverable channel for subscription; recording undelivered openings"
            );
            self.write_record(subscription, None, "no deliverable channel", &fresh_keys, DeliveryStatus::Failed)
                .await?;
            return Ok(DeliveryOutcome::Dispatched { sent: 0, failed: 0 });
        }

        // Quota gate, free tier only. A single atomic reservation covers the
        // whole cycle's aggregated message.
        if let Some(limit) = account.tier.notification_limit() {
            let reserved = self
                .stores
                .notifications
                .try_reserve_quota(&subscription.owner, limit)
                .await?;

            if !reserved {
                info!(
                    subscription_id = %subscription.id,
                    owner = %subscription.owner,
                    "Notification quota exhausted; pausing subscription"
                );
                self.write_record(
                    subscription,
                    None,
                    "notification quota exhausted",
                    &fresh_keys,
                    DeliveryStatus::SkippedQuota,
                )
                .await?;
                self.stores
                    .subscriptions
                    .set_status(
                        subscription.id,
                        SubscriptionStatus::Paused,
                        Some("notification quota exhausted; upgrade to keep watching".to_string()),
                    )
                    .await?;
                return Ok(DeliveryOutcome::SkippedQuota);
            }
        }

        let content = render_notification(subscription, &fresh);

        let sends = plan.into_iter().map(|(channel, address)| {
            let content = &content;
            async move {
                let result = self.send_one(channel, &address, content).await;
                (channel, result)
            }
        });

        let mut sent = 0u32;
        let mut failed = 0u32;
        for (channel, result) in join_all(sends).await {
            let status = match &result {
                Ok(message_id) => {
                    info!(
                        subscription_id = %subscription.id,
                        channel = channel.as_str(),
                        message_id = %message_id,
                        "Availability notification sent"
                    );
                    sent += 1;
                    DeliveryStatus::Sent
                }
                Err(e) => {
                    error!(
                        subscription_id = %subscription.id,
                        channel = channel.as_str(),
                        error = %e,
                        "Availability notification failed"
                    );
                    failed += 1;
                    DeliveryStatus::Failed
                }
            };

            self.write_record(subscription, Some(channel), &content.subject, &fresh_keys, status)
                .await?;
        }

        Ok(DeliveryOutcome::Dispatched { sent, failed })
    }

    /// Channels this cycle can actually deliver to: requested by the
    /// subscription, backed by a verified contact, allowed by the tier, and
    /// wired to a sender.
    fn eligible_channels(
        &self,
        subscription: &Subscription,
        account: &Account,
    ) -> Vec<(Channel, String)> {
        fn verified_address(contact: &Option<crate::types::ContactPoint>) -> Option<String> {
            contact
                .as_ref()
                .filter(|c| c.verified)
                .map(|c| c.address.clone())
        }

        let mut plan = Vec::new();

        if subscription.channels.email && self.email.is_some() {
            if let Some(address) = verified_address(&account.email) {
                plan.push((Channel::Email, address));
            }
        }

        if subscription.channels.sms && self.sms.is_some() && account.tier.allows_sms() {
            if let Some(address) = verified_address(&account.phone) {
                plan.push((Channel::Sms, address));
            }
        }

        if subscription.channels.whatsapp && self.whatsapp.is_some() && account.tier.allows_sms() {
            if let Some(address) = verified_address(&account.whatsapp) {
                plan.push((Channel::Whatsapp, address));
            }
        }

        plan
    }

    async fn send_one(
        &self,
        channel: Channel,
        address: &str,
        content: &NotificationContent,
    ) -> Result<String, ChannelError> {
        let send = async {
            match channel {
                Channel::Email => {
                    self.email
                        .as_ref()
                        .ok_or_else(|| ChannelError::NotConfigured("email".to_string()))?
                        .send_email(address, &content.subject, &content.body)
                        .await
                }
                Channel::Sms => {
                    self.sms
                        .as_ref()
                        .ok_or_else(|| ChannelError::NotConfigured("sms".to_string()))?
                        .send_sms(address, &content.short_text)
                        .await
                }
                Channel::Whatsapp => {
                    self.whatsapp
                        .as_ref()
                        .ok_or_else(|| ChannelError::NotConfigured("whatsapp".to_string()))?
                        .send_whatsapp(address, &content.short_text)
                        .await
                }
            }
        };

        match tokio::time::timeout(self.config.send_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout),
        }
    }

    async fn write_record(
        &self,
        subscription: &Subscription,
        channel: Option<Channel>,
        summary: &str,
        covered: &[DedupKey],
        status: DeliveryStatus,
    ) -> Result<(), WatchError> {
        self.stores
            .notifications
            .record(&NotificationRecord {
                id: Uuid::new_v4(),
                subscription_id: subscription.id,
                owner: subscription.owner.clone(),
                channel,
                summary: summary.to_string(),
                covered: covered.to_vec(),
                status,
                created_at: Utc::now(),
            })
            .await?;
        Ok(())
    }
}

/// Rendered message content for one cycle.
struct NotificationContent {
    subject: String,
    body: String,
    short_text: String,
}

/// Render one aggregated message covering every fresh opening, so a cycle
/// with many openings produces a single ping instead of a storm.
fn render_notification(subscription: &Subscription, openings: &[&Opening]) -> NotificationContent {
    let window = format!(
        "{} - {}",
        subscription.start_date.format("%b %d"),
        subscription.end_date.format("%b %d, %Y")
    );

    let subject = format!(
        "🏕️ New campsite availability ({}, {} night{})",
        window,
        subscription.nights,
        if subscription.nights == 1 { "" } else { "s" }
    );

    let opening_lines = openings
        .iter()
        .map(|o| {
            let delta_note = match o.previous_count {
                Some(before) => format!(" (was {})", before),
                None => String::new(),
            };
            format!(
                "• {} ({}) -> {} ({}): {} site(s) available{} at {}",
                o.date.format("%Y-%m-%d"),
                o.date.format("%a"),
                o.checkout.format("%Y-%m-%d"),
                o.checkout.format("%a"),
                o.site_count,
                delta_note,
                o.park,
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let mut booking_urls: Vec<String> = openings.iter().map(|o| o.park.booking_url()).collect();
    booking_urls.sort();
    booking_urls.dedup();

    let body = format!(
        r#"Great news! New campsites are available for your watch:

📅 Your dates: {} ({} nights, {} preference)

New openings:
{}

Book now:
{}

You are receiving this because you set up an availability watch. Manage your watches in the app.
"#,
        window,
        subscription.nights,
        subscription.preference.as_str(),
        opening_lines,
        booking_urls.join("\n"),
    );

    let short_text = format!(
        "🏕️ {} new campsite opening(s) for {} ({} nights). Book: {}",
        openings.len(),
        window,
        subscription.nights,
        booking_urls.first().map(String::as_str).unwrap_or(""),
    );

    NotificationContent {
        subject,
        body,
        short_text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::NaiveDate;
    use providers::ParkRef;

    use crate::classify::SiteClass;
    use crate::store::MemoryStore;
    use crate::types::{AccountTier, ChannelSelection, ContactPoint, DatePreference, OwnerId};

    /// Email sender that records sends and can be told to fail.
    struct RecordingEmailSender {
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl RecordingEmailSender {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait::async_trait]
    impl EmailSender for RecordingEmailSender {
        async fn send_email(
            &self,
            to: &str,
            subject: &str,
            _body: &str,
        ) -> Result<String, ChannelError> {
            if self.fail {
                return Err(ChannelError::Ses("boom".to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), subject.to_string()));
            Ok("test-message-id".to_string())
        }
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, d).unwrap()
    }

    fn subscription(owner: OwnerId) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            owner,
            parks: vec![ParkRef::parse("rg:232447")],
            start_date: date(1),
            end_date: date(31),
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

    fn opening(day: u32, count: u32) -> Opening {
        Opening {
            park: ParkRef::parse("rg:232447"),
            date: date(day),
            site_count: count,
            previous_count: None,
            class: SiteClass::Priority,
            checkout: date(day + 1),
        }
    }

    fn delta(subscription_id: Uuid, openings: Vec<Opening>) -> AvailabilityDelta {
        AvailabilityDelta {
            subscription_id,
            openings,
        }
    }

    async fn store_with_account(owner: &OwnerId, tier: AccountTier) -> Stores {
        let stores = MemoryStore::new().into_stores();
        stores
            .accounts
            .upsert(&Account {
                owner: owner.clone(),
                tier,
                email: Some(ContactPoint::verified("camper@example.com")),
                phone: None,
                whatsapp: None,
            })
            .await
            .unwrap();
        stores
    }

    #[tokio::test]
    async fn dispatch_sends_one_aggregated_email() {
        let owner = OwnerId::Device("d1".to_string());
        let stores = store_with_account(&owner, AccountTier::Free).await;
        let sender = RecordingEmailSender::new(false);
        let dispatcher = NotificationDispatcher::new(
            stores.clone(),
            Some(sender.clone()),
            None,
            None,
            None,
        );

        let sub = subscription(owner);
        let outcome = dispatcher
            .dispatch(&sub, &delta(sub.id, vec![opening(15, 2), opening(16, 1)]))
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Dispatched { sent: 1, failed: 0 });
        // Two openings, one message.
        assert_eq!(sender.sent.lock().unwrap().len(), 1);

        let records = stores
            .notifications
            .recent_for_subscription(sub.id, 10)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, DeliveryStatus::Sent);
        assert_eq!(records[0].channel, Some(Channel::Email));
        assert_eq!(records[0].covered.len(), 2);
    }

    #[tokio::test]
    async fn same_observed_state_is_never_notified_twice() {
        let owner = OwnerId::Device("d1".to_string());
        let stores = store_with_account(&owner, AccountTier::Free).await;
        let sender = RecordingEmailSender::new(false);
        let dispatcher =
            NotificationDispatcher::new(stores.clone(), Some(sender.clone()), None, None, None);

        let sub = subscription(owner);
        let cycle = delta(sub.id, vec![opening(15, 2)]);

        let first = dispatcher.dispatch(&sub, &cycle).await.unwrap();
        assert_eq!(first, DeliveryOutcome::Dispatched { sent: 1, failed: 0 });

        // A transient retry re-observes the identical state.
        let second = dispatcher.dispatch(&sub, &cycle).await.unwrap();
        assert_eq!(second, DeliveryOutcome::NothingNew);
        assert_eq!(sender.sent.lock().unwrap().len(), 1);

        // But a count increase at the same date is a new observation.
        let improved = dispatcher
            .dispatch(&sub, &delta(sub.id, vec![opening(15, 3)]))
            .await
            .unwrap();
        assert_eq!(improved, DeliveryOutcome::Dispatched { sent: 1, failed: 0 });
    }

    #[tokio::test]
    async fn sixth_notification_skips_quota_and_pauses() {
        let owner = OwnerId::Device("d1".to_string());
        let stores = store_with_account(&owner, AccountTier::Free).await;
        let sender = RecordingEmailSender::new(false);
        let dispatcher =
            NotificationDispatcher::new(stores.clone(), Some(sender.clone()), None, None, None);

        let sub = subscription(owner.clone());
        stores.subscriptions.insert(&sub).await.unwrap();

        for day in 1..=5 {
            let outcome = dispatcher
                .dispatch(&sub, &delta(sub.id, vec![opening(day, 1)]))
                .await
                .unwrap();
            assert_eq!(outcome, DeliveryOutcome::Dispatched { sent: 1, failed: 0 });
        }
        assert_eq!(stores.notifications.sent_count(&owner).await.unwrap(), 5);

        let sixth = dispatcher
            .dispatch(&sub, &delta(sub.id, vec![opening(8, 1)]))
            .await
            .unwrap();
        assert_eq!(sixth, DeliveryOutcome::SkippedQuota);

        // No channel send was attempted for the sixth event.
        assert_eq!(sender.sent.lock().unwrap().len(), 5);

        let paused = stores.subscriptions.get(sub.id).await.unwrap().unwrap();
        assert_eq!(paused.status, SubscriptionStatus::Paused);
        assert!(paused.status_reason.unwrap().contains("quota"));

        let records = stores
            .notifications
            .recent_for_subscription(sub.id, 10)
            .await
            .unwrap();
        assert_eq!(records[0].status, DeliveryStatus::SkippedQuota);
        assert_eq!(records[0].channel, None);
    }

    #[tokio::test]
    async fn paid_tier_is_not_quota_limited() {
        let owner = OwnerId::User(Uuid::new_v4());
        let stores = store_with_account(&owner, AccountTier::Supporter).await;
        let sender = RecordingEmailSender::new(false);
        let dispatcher =
            NotificationDispatcher::new(stores.clone(), Some(sender.clone()), None, None, None);

        let sub = subscription(owner);
        for day in 1..=8 {
            let outcome = dispatcher
                .dispatch(&sub, &delta(sub.id, vec![opening(day, 1)]))
                .await
                .unwrap();
            assert_eq!(outcome, DeliveryOutcome::Dispatched { sent: 1, failed: 0 });
        }
    }

    #[tokio::test]
    async fn channel_failure_is_recorded_and_debounced() {
        let owner = OwnerId::Device("d1".to_string());
        let stores = store_with_account(&owner, AccountTier::Free).await;
        let sender = RecordingEmailSender::new(true);
        let dispatcher =
            NotificationDispatcher::new(stores.clone(), Some(sender), None, None, None);

        let sub = subscription(owner);
        let outcome = dispatcher
            .dispatch(&sub, &delta(sub.id, vec![opening(15, 2)]))
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Dispatched { sent: 0, failed: 1 });

        let records = stores
            .notifications
            .recent_for_subscription(sub.id, 10)
            .await
            .unwrap();
        assert_eq!(records[0].status, DeliveryStatus::Failed);

        // The failed attempt still debounces the same observed state.
        let retry = dispatcher
            .dispatch(&sub, &delta(sub.id, vec![opening(15, 2)]))
            .await
            .unwrap();
        assert_eq!(retry, DeliveryOutcome::NothingNew);
    }

    #[tokio::test]
    async fn sms_requires_a_paid_tier() {
        let owner = OwnerId::Device("d1".to_string());
        let stores = MemoryStore::new().into_stores();
        stores
            .accounts
            .upsert(&Account {
                owner: owner.clone(),
                tier: AccountTier::Free,
                email: None,
                phone: Some(ContactPoint::verified("+14155550123")),
                whatsapp: None,
            })
            .await
            .unwrap();

        struct NeverSms;
        #[async_trait::async_trait]
        impl SmsSender for NeverSms {
            async fn send_sms(&self, _to: &str, _message: &str) -> Result<String, ChannelError> {
                panic!("free tier must not reach the SMS sender");
            }
        }

        let dispatcher = NotificationDispatcher::new(
            stores.clone(),
            None,
            Some(Arc::new(NeverSms)),
            None,
            None,
        );

        let mut sub = subscription(owner);
        sub.channels = ChannelSelection {
            email: false,
            sms: true,
            whatsapp: false,
        };

        // Free tier + SMS only -> no deliverable channel, nothing sent.
        let outcome = dispatcher
            .dispatch(&sub, &delta(sub.id, vec![opening(15, 2)]))
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Dispatched { sent: 0, failed: 0 });
    }

    #[test]
    fn rendering_aggregates_openings_into_one_message() {
        let owner = OwnerId::Device("d1".to_string());
        let sub = subscription(owner);
        let a = opening(15, 3);
        let b = opening(16, 1);

        let content = render_notification(&sub, &[&a, &b]);
        assert!(content.body.contains("2025-08-15 (Fri)"));
        assert!(content.body.contains("2025-08-16 (Sat)"));
        assert!(content.body.contains("3 site(s) available"));
        assert!(content.body.contains("recreation.gov/camping/campgrounds/232447"));
        assert!(content.short_text.contains("2 new campsite opening(s)"));
    }
}
