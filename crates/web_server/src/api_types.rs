use campsite_watch::{
    ChannelSelection, DatePreference, Subscription, SubscriptionStatus,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Request structure for creating a new availability watch
#[derive(Debug, Deserialize, Validate)]
pub struct CreateSubscriptionRequest {
    /// Provider-prefixed park ids to monitor (`rg:232447`, `rc:718`)
    #[validate(length(min = 1, message = "At least one park id is required"))]
    pub parks: Vec<String>,

    /// First acceptable check-in date
    pub start_date: NaiveDate,

    /// Last acceptable check-in date
    pub end_date: NaiveDate,

    /// Minimum consecutive nights
    #[validate(range(min = 1, message = "Nights must be at least 1"))]
    pub nights: u32,

    /// Date preference: `weekends`, `flexible`, or `all`
    pub preference: DatePreference,

    /// Requested delivery channels; defaults to email only
    #[serde(default)]
    pub channels: ChannelSelection,

    /// Minutes between polls; clamped to the service floor
    pub check_interval_minutes: Option<u32>,
}

/// Request structure for editing a watch. Absent fields are unchanged.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateSubscriptionRequest {
    /// New first acceptable check-in date
    pub start_date: Option<NaiveDate>,
    /// New last acceptable check-in date
    pub end_date: Option<NaiveDate>,
    /// New minimum nights
    pub nights: Option<u32>,
    /// New date preference
    pub preference: Option<DatePreference>,
    /// New channel selection
    pub channels: Option<ChannelSelection>,
    /// New poll interval in minutes
    pub check_interval_minutes: Option<u32>,
}

/// Response structure for a watch
#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    /// Unique identifier for the watch
    pub id: Uuid,
    /// Parks being monitored
    pub parks: Vec<String>,
    /// First acceptable check-in date
    pub start_date: NaiveDate,
    /// Last acceptable check-in date
    pub end_date: NaiveDate,
    /// Minimum consecutive nights
    pub nights: u32,
    /// Date preference
    pub preference: DatePreference,
    /// Requested delivery channels
    pub channels: ChannelSelection,
    /// Current lifecycle status
    pub status: SubscriptionStatus,
    /// Owner-visible reason for a paused/expired status
    pub status_reason: Option<String>,
    /// Minutes between polls
    pub check_interval_minutes: u32,
    /// When the watch last completed a poll
    pub last_checked: Option<DateTime<Utc>>,
    /// When the watch was created
    pub created_at: DateTime<Utc>,
}

impl From<Subscription> for SubscriptionResponse {
    fn from(subscription: Subscription) -> Self {
        Self {
            id: subscription.id,
            parks: subscription.parks.iter().map(|p| p.to_string()).collect(),
            start_date: subscription.start_date,
            end_date: subscription.end_date,
            nights: subscription.nights,
            preference: subscription.preference,
            channels: subscription.channels,
            status: subscription.status,
            status_reason: subscription.status_reason,
            check_interval_minutes: subscription.check_interval_minutes,
            last_checked: subscription.last_checked,
            created_at: subscription.created_at,
        }
    }
}

/// Response structure for listing an owner's watches
#[derive(Debug, Serialize)]
pub struct ListSubscriptionsResponse {
    /// The owner's watches, newest first
    pub subscriptions: Vec<SubscriptionResponse>,
    /// Total count
    pub total: usize,
}
