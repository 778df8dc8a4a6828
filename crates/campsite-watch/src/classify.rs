use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

/// Weekend classification of a check-in date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteClass {
    /// Friday or Saturday check-in
    Priority,
    /// Thursday or Sunday check-in, adjacent to a weekend
    Regular,
    /// Midweek check-in
    Ignored,
}

impl SiteClass {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteClass::Priority => "priority",
            SiteClass::Regular => "regular",
            SiteClass::Ignored => "ignored",
        }
    }

    /// Parse the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "priority" => Some(SiteClass::Priority),
            "regular" => Some(SiteClass::Regular),
            "ignored" => Some(SiteClass::Ignored),
            _ => None,
        }
    }
}

/// Classify a check-in date by its weekday.
///
/// The full three-way label is always computed and stored in snapshots; the
/// subscription's [`DatePreference`](crate::DatePreference) narrows which
/// labels reach the notify stage, so changing the preference never requires
/// a re-scan.
pub fn classify(check_in: NaiveDate) -> SiteClass {
    match check_in.weekday() {
        Weekday::Fri | Weekday::Sat => SiteClass::Priority,
        Weekday::Thu | Weekday::Sun => SiteClass::Regular,
        _ => SiteClass::Ignored,
    }
}
