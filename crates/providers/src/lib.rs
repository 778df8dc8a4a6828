//! # Providers
//!
//! Availability providers for campground booking sites. Each provider maps
//! the upstream site's loosely-typed payloads into the typed per-date
//! availability shape at this boundary, so the rest of the system never
//! sees upstream format drift.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Client for the recreation.gov availability API
mod rec_gov;
pub use rec_gov::*;

/// Client for the ReserveCalifornia (UseDirect) availability API
mod reserve_california;
pub use reserve_california::*;

/// Availability for a single check-in date at one park.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayAvailability {
    /// Check-in date
    pub date: NaiveDate,
    /// Number of sites bookable for this check-in date
    pub site_count: u32,
    /// Checkout date for the stay starting on `date`
    pub checkout_date: NaiveDate,
}

/// Errors surfaced by availability providers.
///
/// The three variants drive different supervisor policies: `NotFound` pauses
/// the subscription, `RateLimited` backs off harder than a normal crash, and
/// `Transient` is retried with the usual backoff.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// The park id does not resolve upstream
    #[error("park not found upstream")]
    NotFound,

    /// Explicit throttle signal from the upstream site
    #[error("rate limited by upstream provider")]
    RateLimited,

    /// Network failure, timeout, or upstream 5xx
    #[error("transient provider failure: {0}")]
    Transient(String),
}

/// Booking source a park id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// recreation.gov
    RecreationGov,
    /// ReserveCalifornia (California state parks)
    ReserveCalifornia,
}

impl ProviderKind {
    /// Short id prefix used in stored park references.
    pub fn prefix(&self) -> &'static str {
        match self {
            ProviderKind::RecreationGov => "rg",
            ProviderKind::ReserveCalifornia => "rc",
        }
    }

    /// Human-readable provider name for rendered notifications.
    pub fn label(&self) -> &'static str {
        match self {
            ProviderKind::RecreationGov => "Recreation.gov",
            ProviderKind::ReserveCalifornia => "ReserveCalifornia",
        }
    }
}

/// A provider-qualified park reference, stored as `rg:232447` or `rc:718`.
///
/// Unprefixed ids default to recreation.gov for backward compatibility with
/// older stored subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParkRef {
    kind_tag: String,
    raw_id: String,
}

impl ParkRef {
    /// Build a reference from a provider kind and a raw upstream id.
    pub fn new(kind: ProviderKind, raw_id: impl Into<String>) -> Self {
        Self {
            kind_tag: kind.prefix().to_string(),
            raw_id: raw_id.into(),
        }
    }

    /// Parse a possibly-prefixed id like `rc:718`, `rg:232447`, or `232447`.
    pub fn parse(prefixed: &str) -> Self {
        let trimmed = prefixed.trim();
        if let Some(raw) = trimmed.strip_prefix("rc:") {
            Self::new(ProviderKind::ReserveCalifornia, raw)
        } else if let Some(raw) = trimmed.strip_prefix("rg:") {
            Self::new(ProviderKind::RecreationGov, raw)
        } else {
            Self::new(ProviderKind::RecreationGov, trimmed)
        }
    }

    /// The booking source this reference points at.
    pub fn kind(&self) -> ProviderKind {
        match self.kind_tag.as_str() {
            "rc" => ProviderKind::ReserveCalifornia,
            _ => ProviderKind::RecreationGov,
        }
    }

    /// The raw upstream id without the provider prefix.
    pub fn raw_id(&self) -> &str {
        &self.raw_id
    }

    /// Public booking page for this park, for rendered notifications.
    pub fn booking_url(&self) -> String {
        match self.kind() {
            ProviderKind::RecreationGov => format!(
                "https://www.recreation.gov/camping/campgrounds/{}",
                self.raw_id
            ),
            ProviderKind::ReserveCalifornia => "https://www.reservecalifornia.com".to_string(),
        }
    }
}

impl std::fmt::Display for ParkRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind_tag, self.raw_id)
    }
}

impl serde::Serialize for ParkRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ParkRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(ParkRef::parse(&s))
    }
}

/// Fold per-date free-site counts into bookable stay windows.
///
/// A check-in date qualifies when all `nights` consecutive dates starting
/// there have at least one free site; the reported count is the minimum
/// across the window, since that is how many parallel stays fit.
pub(crate) fn stay_windows(
    free_by_date: &std::collections::BTreeMap<NaiveDate, u32>,
    nights: u32,
) -> Vec<DayAvailability> {
    use chrono::Days;

    let nights = nights.max(1);
    let mut windows = Vec::new();

    for (&check_in, &first_count) in free_by_date {
        let mut min_count = first_count;
        for offset in 1..nights {
            match free_by_date.get(&(check_in + Days::new(u64::from(offset)))) {
                Some(&count) if count > 0 => min_count = min_count.min(count),
                _ => {
                    min_count = 0;
                    break;
                }
            }
        }

        if min_count > 0 {
            windows.push(DayAvailability {
                date: check_in,
                site_count: min_count,
                checkout_date: check_in + Days::new(u64::from(nights)),
            });
        }
    }

    windows
}

/// Capability consumed by the subscription scheduler: fetch per-date
/// availability for one park over a date window.
///
/// An `Ok` empty vec means the park genuinely has no bookable dates in the
/// window; upstream failures must be reported as `Err`, never as an empty
/// result, so the diff engine can tell the two apart.
#[async_trait::async_trait]
pub trait AvailabilityProvider: Send + Sync {
    /// Fetch availability for stays of `nights` nights with check-in between
    /// `start` and `end` inclusive.
    async fn fetch_availability(
        &self,
        park: &ParkRef,
        start: NaiveDate,
        end: NaiveDate,
        nights: u32,
    ) -> Result<Vec<DayAvailability>, ProviderError>;
}

/// Routes each fetch to the HTTP client matching the park's provider kind.
pub struct ProviderRouter {
    rec_gov: RecGovProvider,
    reserve_california: ReserveCaliforniaProvider,
}

impl ProviderRouter {
    /// Build a router with default clients for both booking sources.
    pub fn new() -> Result<Self, ProviderError> {
        Ok(Self {
            rec_gov: RecGovProvider::new(None)?,
            reserve_california: ReserveCaliforniaProvider::new(None)?,
        })
    }
}

#[async_trait::async_trait]
impl AvailabilityProvider for ProviderRouter {
    async fn fetch_availability(
        &self,
        park: &ParkRef,
        start: NaiveDate,
        end: NaiveDate,
        nights: u32,
    ) -> Result<Vec<DayAvailability>, ProviderError> {
        match park.kind() {
            ProviderKind::RecreationGov => {
                self.rec_gov
                    .fetch_availability(park, start, end, nights)
                    .await
            }
            ProviderKind::ReserveCalifornia => {
                self.reserve_california
                    .fetch_availability(park, start, end, nights)
                    .await
            }
        }
    }
}
