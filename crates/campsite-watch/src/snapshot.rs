use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use providers::{DayAvailability, ParkRef};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classify::{SiteClass, classify};

/// Identifies one availability slot: a check-in date at a park.
///
/// Ordered by date first so that snapshot iteration (and therefore diff
/// output) comes out check-in-date ascending.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SlotKey {
    /// Check-in date
    pub date: NaiveDate,
    /// Park the slot is at
    pub park: ParkRef,
}

/// Observed state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotState {
    /// Number of bookable sites
    pub site_count: u32,
    /// Weekend classification of the check-in date
    pub class: SiteClass,
    /// Checkout date for the stay
    pub checkout: NaiveDate,
}

/// The last-known classified availability state for a subscription.
///
/// Exactly one current snapshot exists per subscription; each poll cycle
/// replaces it wholesale after the diff is computed.
#[derive(Debug, Clone)]
pub struct AvailabilitySnapshot {
    /// Subscription this snapshot belongs to
    pub subscription_id: Uuid,
    /// Slot states keyed by (date, park)
    pub slots: BTreeMap<SlotKey, SlotState>,
    /// When the poll that produced this snapshot completed
    pub captured_at: DateTime<Utc>,
}

/// Flat serialized form of one snapshot slot, for durable storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotRecord {
    /// Park the slot is at
    pub park: ParkRef,
    /// Check-in date
    pub date: NaiveDate,
    /// Number of bookable sites
    pub site_count: u32,
    /// Weekend classification
    pub class: SiteClass,
    /// Checkout date
    pub checkout: NaiveDate,
}

impl AvailabilitySnapshot {
    /// An empty snapshot captured now.
    pub fn new(subscription_id: Uuid) -> Self {
        Self {
            subscription_id,
            slots: BTreeMap::new(),
            captured_at: Utc::now(),
        }
    }

    /// Fold one park's provider response into the snapshot, classifying
    /// each check-in date. Dates with zero sites are not stored; absence
    /// and zero mean the same thing to the diff.
    pub fn absorb(&mut self, park: &ParkRef, days: &[DayAvailability]) {
        for day in days {
            if day.site_count == 0 {
                continue;
            }
            self.slots.insert(
                SlotKey {
                    date: day.date,
                    park: park.clone(),
                },
                SlotState {
                    site_count: day.site_count,
                    class: classify(day.date),
                    checkout: day.checkout_date,
                },
            );
        }
    }

    /// Flatten to records for durable storage.
    pub fn to_records(&self) -> Vec<SlotRecord> {
        self.slots
            .iter()
            .map(|(key, state)| SlotRecord {
                park: key.park.clone(),
                date: key.date,
                site_count: state.site_count,
                class: state.class,
                checkout: state.checkout,
            })
            .collect()
    }

    /// Rebuild from stored records.
    pub fn from_records(
        subscription_id: Uuid,
        captured_at: DateTime<Utc>,
        records: Vec<SlotRecord>,
    ) -> Self {
        let mut snapshot = Self {
            subscription_id,
            slots: BTreeMap::new(),
            captured_at,
        };
        for record in records {
            snapshot.slots.insert(
                SlotKey {
                    date: record.date,
                    park: record.park,
                },
                SlotState {
                    site_count: record.site_count,
                    class: record.class,
                    checkout: record.checkout,
                },
            );
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, d).unwrap()
    }

    #[test]
    fn absorb_classifies_and_drops_empty_dates() {
        let park = ParkRef::parse("rg:232447");
        let mut snapshot = AvailabilitySnapshot::new(Uuid::new_v4());

        snapshot.absorb(
            &park,
            &[
                DayAvailability {
                    date: date(15), // Friday
                    site_count: 2,
                    checkout_date: date(16),
                },
                DayAvailability {
                    date: date(20), // Wednesday
                    site_count: 0,
                    checkout_date: date(21),
                },
            ],
        );

        assert_eq!(snapshot.slots.len(), 1);
        let state = snapshot
            .slots
            .get(&SlotKey {
                date: date(15),
                park,
            })
            .unwrap();
        assert_eq!(state.site_count, 2);
        assert_eq!(state.class, SiteClass::Priority);
    }

    #[test]
    fn slots_iterate_in_check_in_date_order() {
        let a = ParkRef::parse("rg:1");
        let b = ParkRef::parse("rc:2");
        let mut snapshot = AvailabilitySnapshot::new(Uuid::new_v4());

        snapshot.absorb(
            &b,
            &[DayAvailability {
                date: date(22),
                site_count: 1,
                checkout_date: date(23),
            }],
        );
        snapshot.absorb(
            &a,
            &[DayAvailability {
                date: date(15),
                site_count: 1,
                checkout_date: date(16),
            }],
        );

        let dates: Vec<NaiveDate> = snapshot.slots.keys().map(|k| k.date).collect();
        assert_eq!(dates, vec![date(15), date(22)]);
    }

    #[test]
    fn snapshot_round_trips_through_records() {
        let park = ParkRef::parse("rc:718");
        let mut snapshot = AvailabilitySnapshot::new(Uuid::new_v4());
        snapshot.absorb(
            &park,
            &[DayAvailability {
                date: date(16),
                site_count: 4,
                checkout_date: date(18),
            }],
        );

        let rebuilt = AvailabilitySnapshot::from_records(
            snapshot.subscription_id,
            snapshot.captured_at,
            snapshot.to_records(),
        );
        assert_eq!(rebuilt.slots, snapshot.slots);
    }
}
