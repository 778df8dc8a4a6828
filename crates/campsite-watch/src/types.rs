use chrono::{DateTime, NaiveDate, Utc};
use providers::ParkRef;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classify::SiteClass;

/// Paid tier of the owning account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountTier {
    /// Default tier: email only, capped watches and notifications
    Free,
    /// Paid tier: SMS/WhatsApp enabled, more watches
    Basic,
    /// Paid tier: effectively unlimited
    Supporter,
}

impl AccountTier {
    /// Maximum concurrently-active subscriptions, `None` for unlimited.
    pub fn max_active_subscriptions(&self) -> Option<u32> {
        match self {
            AccountTier::Free => Some(3),
            AccountTier::Basic => Some(10),
            AccountTier::Supporter => None,
        }
    }

    /// SMS and WhatsApp delivery require a paid tier.
    pub fn allows_sms(&self) -> bool {
        matches!(self, AccountTier::Basic | AccountTier::Supporter)
    }

    /// Lifetime cap on sent notifications, `None` for unlimited.
    pub fn notification_limit(&self) -> Option<u32> {
        match self {
            AccountTier::Free => Some(5),
            AccountTier::Basic | AccountTier::Supporter => None,
        }
    }

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountTier::Free => "free",
            AccountTier::Basic => "basic",
            AccountTier::Supporter => "supporter",
        }
    }

    /// Parse the storage representation; unknown values fall back to free.
    pub fn parse(s: &str) -> Self {
        match s {
            "basic" => AccountTier::Basic,
            "supporter" => AccountTier::Supporter,
            _ => AccountTier::Free,
        }
    }
}

/// Owner of a subscription: a registered user or an anonymous device token
/// that has not been linked to an account yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OwnerId {
    /// Registered user account
    User(Uuid),
    /// Anonymous cookie-based device id
    Device(String),
}

impl OwnerId {
    /// Parse the `user:<uuid>` / `device:<token>` storage form.
    pub fn parse(s: &str) -> Option<Self> {
        if let Some(raw) = s.strip_prefix("user:") {
            Uuid::parse_str(raw).ok().map(OwnerId::User)
        } else if let Some(raw) = s.strip_prefix("device:") {
            (!raw.is_empty()).then(|| OwnerId::Device(raw.to_string()))
        } else {
            None
        }
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OwnerId::User(id) => write!(f, "user:{}", id),
            OwnerId::Device(token) => write!(f, "device:{}", token),
        }
    }
}

impl Serialize for OwnerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for OwnerId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        OwnerId::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid owner id: {s}")))
    }
}

/// A contact address plus its verification state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactPoint {
    /// Email address or E.164 phone number
    pub address: String,
    /// Whether the owner has completed verification for this address
    pub verified: bool,
}

impl ContactPoint {
    /// A verified contact point.
    pub fn verified(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            verified: true,
        }
    }
}

/// Account-level data the scheduler needs: tier and deliverable contacts.
///
/// Account management itself (signup, verification flows, billing) lives in
/// the excluded web layer; this is the read model the dispatcher consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Owner this account belongs to
    pub owner: OwnerId,
    /// Paid tier
    pub tier: AccountTier,
    /// Email contact, if provided
    pub email: Option<ContactPoint>,
    /// SMS phone contact, if provided
    pub phone: Option<ContactPoint>,
    /// WhatsApp contact, if provided
    pub whatsapp: Option<ContactPoint>,
}

impl Account {
    /// Default free-tier account with no deliverable contacts.
    pub fn free(owner: OwnerId) -> Self {
        Self {
            owner,
            tier: AccountTier::Free,
            email: None,
            phone: None,
            whatsapp: None,
        }
    }
}

/// Which classified dates a subscription surfaces to the notify stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatePreference {
    /// Only Friday/Saturday check-ins
    Weekends,
    /// Weekend plus weekend-adjacent check-ins
    Flexible,
    /// Every check-in date
    All,
}

impl DatePreference {
    /// Whether a classified date passes this preference filter.
    pub fn admits(&self, class: SiteClass) -> bool {
        match self {
            DatePreference::Weekends => class == SiteClass::Priority,
            DatePreference::Flexible => {
                class == SiteClass::Priority || class == SiteClass::Regular
            }
            DatePreference::All => true,
        }
    }

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DatePreference::Weekends => "weekends",
            DatePreference::Flexible => "flexible",
            DatePreference::All => "all",
        }
    }

    /// Parse the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "weekends" => Some(DatePreference::Weekends),
            "flexible" => Some(DatePreference::Flexible),
            "all" => Some(DatePreference::All),
            _ => None,
        }
    }
}

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Being monitored by a worker
    Active,
    /// Suspended by the owner or by the supervisor, resumable
    Paused,
    /// Terminated by the owner
    Canceled,
    /// Window end date has passed
    Expired,
}

impl SubscriptionStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    /// Parse the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "paused" => Some(SubscriptionStatus::Paused),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "expired" => Some(SubscriptionStatus::Expired),
            _ => None,
        }
    }
}

/// A notification delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Email delivery
    Email,
    /// SMS delivery
    Sms,
    /// WhatsApp delivery
    Whatsapp,
}

impl Channel {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Whatsapp => "whatsapp",
        }
    }

    /// Parse the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email" => Some(Channel::Email),
            "sms" => Some(Channel::Sms),
            "whatsapp" => Some(Channel::Whatsapp),
            _ => None,
        }
    }
}

/// Channels a subscription has asked for. Delivery additionally requires
/// the contact to be verified and, for SMS/WhatsApp, a paid tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSelection {
    /// Deliver via email
    pub email: bool,
    /// Deliver via SMS
    pub sms: bool,
    /// Deliver via WhatsApp
    pub whatsapp: bool,
}

impl Default for ChannelSelection {
    fn default() -> Self {
        Self {
            email: true,
            sms: false,
            whatsapp: false,
        }
    }
}

/// A standing request to monitor one or more parks over a date window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Unique identifier
    pub id: Uuid,
    /// Owning user or anonymous device
    pub owner: OwnerId,
    /// Parks to monitor, provider-prefixed
    pub parks: Vec<ParkRef>,
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
    /// Lifecycle state
    pub status: SubscriptionStatus,
    /// Owner-visible reason for a paused/expired status
    pub status_reason: Option<String>,
    /// Minutes between polls
    pub check_interval_minutes: u32,
    /// When the worker last completed a poll
    pub last_checked: Option<DateTime<Utc>>,
    /// Most recent poll error, if any
    pub last_error: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Whether this subscription should have a live worker.
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// Whether the search window has passed as of `today`.
    pub fn window_ended(&self, today: NaiveDate) -> bool {
        self.end_date < today
    }
}

/// Dedup key for one observed opening: the same (park, date, count) is never
/// notified twice for a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    /// Park the opening is at
    pub park: ParkRef,
    /// Check-in date
    pub date: NaiveDate,
    /// Observed site count
    pub count: u32,
}

/// Outcome of one notification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryStatus {
    /// Accepted by the channel provider
    Sent,
    /// The channel send failed
    Failed,
    /// Dropped before send because the owner's quota was exhausted
    SkippedQuota,
}

impl DeliveryStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::SkippedQuota => "skipped-quota",
        }
    }

    /// Parse the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(DeliveryStatus::Sent),
            "failed" => Some(DeliveryStatus::Failed),
            "skipped-quota" => Some(DeliveryStatus::SkippedQuota),
            _ => None,
        }
    }
}

/// Immutable audit entry for one notification attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    /// Unique identifier
    pub id: Uuid,
    /// Subscription the notification belongs to
    pub subscription_id: Uuid,
    /// Owner, for quota accounting
    pub owner: OwnerId,
    /// Delivery channel; `None` for quota skips, which never reach a channel
    pub channel: Option<Channel>,
    /// Short human-readable summary of the rendered content
    pub summary: String,
    /// Dedup keys of the openings this notification covered
    pub covered: Vec<DedupKey>,
    /// What happened to the attempt
    pub status: DeliveryStatus,
    /// When the attempt was made
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_id_round_trips_through_storage_form() {
        let user = OwnerId::User(Uuid::new_v4());
        assert_eq!(OwnerId::parse(&user.to_string()), Some(user.clone()));

        let device = OwnerId::Device("abc123".to_string());
        assert_eq!(OwnerId::parse(&device.to_string()), Some(device));

        assert_eq!(OwnerId::parse("bogus"), None);
        assert_eq!(OwnerId::parse("device:"), None);
    }

    #[test]
    fn tier_limits_match_the_product_rules() {
        assert_eq!(AccountTier::Free.max_active_subscriptions(), Some(3));
        assert_eq!(AccountTier::Basic.max_active_subscriptions(), Some(10));
        assert_eq!(AccountTier::Supporter.max_active_subscriptions(), None);

        assert!(!AccountTier::Free.allows_sms());
        assert!(AccountTier::Basic.allows_sms());

        assert_eq!(AccountTier::Free.notification_limit(), Some(5));
        assert_eq!(AccountTier::Supporter.notification_limit(), None);
    }

    #[test]
    fn status_round_trips_through_storage_form() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Paused,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Expired,
        ] {
            assert_eq!(SubscriptionStatus::parse(status.as_str()), Some(status));
        }
    }
}
