use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{Datelike, Months, NaiveDate};
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{AvailabilityProvider, DayAvailability, ParkRef, ProviderError, stay_windows};

/// Configuration for the recreation.gov availability client.
#[derive(Debug, Clone)]
pub struct RecGovConfig {
    /// Base URL of the internal recreation.gov API
    pub base_url: String,
    /// Hard timeout applied to every request
    pub request_timeout: Duration,
    /// User agents rotated between requests
    pub user_agents: Vec<String>,
}

impl Default for RecGovConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.recreation.gov/api".to_string(),
            request_timeout: Duration::from_secs(30),
            user_agents: vec![
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36".to_string(),
            ],
        }
    }
}

/// Client for the recreation.gov month-availability API.
pub struct RecGovProvider {
    client: Client,
    config: RecGovConfig,
}

/// Month-availability response from the internal API.
#[derive(Debug, Deserialize)]
struct MonthAvailabilityResponse {
    campsites: HashMap<String, CampsiteMonth>,
}

/// Per-campsite availability map: ISO timestamp -> status string.
#[derive(Debug, Deserialize)]
struct CampsiteMonth {
    #[serde(default)]
    availabilities: HashMap<String, String>,
}

impl RecGovProvider {
    /// Create a new recreation.gov client.
    pub fn new(config: Option<RecGovConfig>) -> Result<Self, ProviderError> {
        let config = config.unwrap_or_default();

        let client = Client::builder()
            .cookie_store(true)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProviderError::Transient(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    fn pick_user_agent(&self) -> &str {
        let idx = rand::rng().random_range(0..self.config.user_agents.len());
        &self.config.user_agents[idx]
    }

    /// Fetch one month of availability and fold bookable site counts into
    /// `counts`, keyed by check-in date.
    async fn fetch_month(
        &self,
        park: &ParkRef,
        month_start: NaiveDate,
        window_start: NaiveDate,
        window_end: NaiveDate,
        counts: &mut BTreeMap<NaiveDate, u32>,
    ) -> Result<(), ProviderError> {
        let start_param = format!("{}T00:00:00.000Z", month_start.format("%Y-%m-%d"));
        let url = format!(
            "{}/camps/availability/campground/{}/month?start_date={}",
            self.config.base_url,
            park.raw_id(),
            urlencoding::encode(&start_param),
        );

        debug!(park = %park, month = %month_start, "Fetching recreation.gov month availability");

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::USER_AGENT, self.pick_user_agent())
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            warn!(park = %park, %status, "recreation.gov availability request failed");
            return Err(match status.as_u16() {
                404 => ProviderError::NotFound,
                429 => ProviderError::RateLimited,
                _ => ProviderError::Transient(format!("HTTP {status}")),
            });
        }

        let month: MonthAvailabilityResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("failed to parse response: {e}")))?;

        for campsite in month.campsites.values() {
            for (date_str, avail_status) in &campsite.availabilities {
                // Timestamps arrive as "2025-08-15T00:00:00Z"
                let date = match NaiveDate::parse_from_str(&date_str[..10.min(date_str.len())], "%Y-%m-%d")
                {
                    Ok(date) => date,
                    Err(_) => {
                        warn!(date = %date_str, "Skipping unparseable availability date");
                        continue;
                    }
                };

                if date < window_start || date > window_end {
                    continue;
                }

                if is_bookable(avail_status) {
                    *counts.entry(date).or_insert(0) += 1;
                }
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl AvailabilityProvider for RecGovProvider {
    async fn fetch_availability(
        &self,
        park: &ParkRef,
        start: NaiveDate,
        end: NaiveDate,
        nights: u32,
    ) -> Result<Vec<DayAvailability>, ProviderError> {
        let mut counts: BTreeMap<NaiveDate, u32> = BTreeMap::new();

        // The API serves whole months; walk every month touching the window.
        let mut month_start = NaiveDate::from_ymd_opt(start.year(), start.month(), 1)
            .ok_or_else(|| ProviderError::Transient("invalid window start".to_string()))?;

        while month_start <= end {
            self.fetch_month(park, month_start, start, end, &mut counts)
                .await?;
            month_start = month_start + Months::new(1);
        }

        Ok(stay_windows(&counts, nights))
    }
}

/// Interpret a recreation.gov availability status string.
fn is_bookable(status: &str) -> bool {
    match status {
        "Available" => true,
        "Reserved" | "Not Available" | "Not Reservable" | "Walk-up" => false,
        // Legacy RIDB single-letter format
        "A" => true,
        "R" | "X" | "W" | "N" => false,
        other => {
            debug!(status = other, "Unknown availability status");
            false
        }
    }
}

fn map_request_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Transient("request timed out".to_string())
    } else {
        ProviderError::Transient(format!("request failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bookable_statuses_are_recognized() {
        assert!(is_bookable("Available"));
        assert!(is_bookable("A"));
        assert!(!is_bookable("Reserved"));
        assert!(!is_bookable("Walk-up"));
        assert!(!is_bookable("something new"));
    }

    #[test]
    fn month_response_parses_internal_shape() {
        let raw = r#"{
            "campsites": {
                "1001": {
                    "availabilities": {
                        "2025-08-15T00:00:00Z": "Available",
                        "2025-08-16T00:00:00Z": "Reserved"
                    }
                },
                "1002": {}
            }
        }"#;

        let parsed: MonthAvailabilityResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.campsites.len(), 2);
        assert_eq!(parsed.campsites["1001"].availabilities.len(), 2);
        assert!(parsed.campsites["1002"].availabilities.is_empty());
    }
}
