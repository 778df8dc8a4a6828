use chrono::NaiveDate;
use providers::ParkRef;
use uuid::Uuid;

use crate::classify::SiteClass;
use crate::snapshot::AvailabilitySnapshot;
use crate::types::{DatePreference, DedupKey};

/// One newly appeared or improved availability slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opening {
    /// Park the opening is at
    pub park: ParkRef,
    /// Check-in date
    pub date: NaiveDate,
    /// Current bookable site count
    pub site_count: u32,
    /// Count in the previous snapshot, `None` if the date is brand new
    pub previous_count: Option<u32>,
    /// Weekend classification
    pub class: SiteClass,
    /// Checkout date
    pub checkout: NaiveDate,
}

impl Opening {
    /// Dedup key for this observed state.
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            park: self.park.clone(),
            date: self.date,
            count: self.site_count,
        }
    }
}

/// The set of openings worth notifying about for one poll cycle.
///
/// Ephemeral: produced by [`diff`], consumed by the dispatcher, never stored.
#[derive(Debug, Clone)]
pub struct AvailabilityDelta {
    /// Subscription the delta belongs to
    pub subscription_id: Uuid,
    /// Openings ordered by check-in date ascending
    pub openings: Vec<Opening>,
}

impl AvailabilityDelta {
    /// Whether there is anything to notify about.
    pub fn is_empty(&self) -> bool {
        self.openings.is_empty()
    }
}

/// Compare a new snapshot against the previous one.
///
/// A slot is reported iff it is absent from `previous` or its count strictly
/// increased, and its class passes the preference filter. Decreases and
/// disappearances are never reported. When `previous` is `None` (first scan
/// for the subscription) the baseline is established silently and the delta
/// is empty, so subscription creation never triggers a burst notification.
///
/// Pure function of its inputs; openings inherit the snapshot's
/// (date, park) ordering.
pub fn diff(
    previous: Option<&AvailabilitySnapshot>,
    current: &AvailabilitySnapshot,
    preference: DatePreference,
) -> AvailabilityDelta {
    let mut openings = Vec::new();

    if let Some(previous) = previous {
        for (key, state) in &current.slots {
            if !preference.admits(state.class) {
                continue;
            }

            let previous_count = previous.slots.get(key).map(|s| s.site_count);
            let improved = match previous_count {
                None => true,
                Some(before) => state.site_count > before,
            };

            if improved {
                openings.push(Opening {
                    park: key.park.clone(),
                    date: key.date,
                    site_count: state.site_count,
                    previous_count,
                    class: state.class,
                    checkout: state.checkout,
                });
            }
        }
    }

    AvailabilityDelta {
        subscription_id: current.subscription_id,
        openings,
    }
}
