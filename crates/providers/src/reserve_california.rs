use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::NaiveDate;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{AvailabilityProvider, DayAvailability, ParkRef, ProviderError, stay_windows};

const RC_DATE_FMT: &str = "%m-%d-%Y";

/// Configuration for the ReserveCalifornia (UseDirect) client.
#[derive(Debug, Clone)]
pub struct ReserveCaliforniaConfig {
    /// Base URL of the UseDirect API behind reservecalifornia.com
    pub base_url: String,
    /// Hard timeout applied to every request
    pub request_timeout: Duration,
}

impl Default for ReserveCaliforniaConfig {
    fn default() -> Self {
        Self {
            base_url:
                "https://california-rdr.prod.cali.rd12.recreation-management.tylerapp.com"
                    .to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Client for the UseDirect grid-search API that powers reservecalifornia.com.
pub struct ReserveCaliforniaProvider {
    client: Client,
    config: ReserveCaliforniaConfig,
}

/// Body for the `/rdr/search/grid` endpoint.
#[derive(Debug, Serialize)]
struct GridRequest {
    #[serde(rename = "FacilityId")]
    facility_id: i64,
    #[serde(rename = "StartDate")]
    start_date: String,
    #[serde(rename = "EndDate")]
    end_date: String,
    #[serde(rename = "InSeasonOnly")]
    in_season_only: bool,
    #[serde(rename = "WebOnly")]
    web_only: bool,
    #[serde(rename = "UnitSort")]
    unit_sort: String,
}

#[derive(Debug, Deserialize)]
struct GridResponse {
    #[serde(rename = "Facility")]
    facility: Option<GridFacility>,
}

#[derive(Debug, Deserialize)]
struct GridFacility {
    #[serde(rename = "Units", default)]
    units: HashMap<String, GridUnit>,
}

#[derive(Debug, Deserialize)]
struct GridUnit {
    #[serde(rename = "Slices", default)]
    slices: HashMap<String, GridSlice>,
}

#[derive(Debug, Deserialize)]
struct GridSlice {
    #[serde(rename = "IsFree", default)]
    is_free: bool,
}

impl ReserveCaliforniaProvider {
    /// Create a new ReserveCalifornia client.
    pub fn new(config: Option<ReserveCaliforniaConfig>) -> Result<Self, ProviderError> {
        let config = config.unwrap_or_default();

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProviderError::Transient(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }
}

#[async_trait::async_trait]
impl AvailabilityProvider for ReserveCaliforniaProvider {
    async fn fetch_availability(
        &self,
        park: &ParkRef,
        start: NaiveDate,
        end: NaiveDate,
        nights: u32,
    ) -> Result<Vec<DayAvailability>, ProviderError> {
        let facility_id: i64 = park
            .raw_id()
            .parse()
            .map_err(|_| ProviderError::NotFound)?;

        let body = GridRequest {
            facility_id,
            start_date: start.format(RC_DATE_FMT).to_string(),
            end_date: end.format(RC_DATE_FMT).to_string(),
            in_season_only: true,
            web_only: true,
            unit_sort: "orderby".to_string(),
        };

        debug!(park = %park, %start, %end, "Fetching ReserveCalifornia grid availability");

        let response = self
            .client
            .post(format!("{}/rdr/search/grid", self.config.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Transient("request timed out".to_string())
                } else {
                    ProviderError::Transient(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(park = %park, %status, "ReserveCalifornia grid request failed");
            return Err(match status.as_u16() {
                404 => ProviderError::NotFound,
                429 => ProviderError::RateLimited,
                _ => ProviderError::Transient(format!("HTTP {status}")),
            });
        }

        let grid: GridResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("failed to parse response: {e}")))?;

        // An unknown facility comes back as a grid with no Facility block.
        let facility = grid.facility.ok_or(ProviderError::NotFound)?;

        if facility.units.is_empty() {
            info!(park = %park, "ReserveCalifornia facility has no bookable units");
            return Ok(Vec::new());
        }

        // Free-unit count per date, folded across all units.
        let mut free_by_date: BTreeMap<NaiveDate, u32> = BTreeMap::new();
        for unit in facility.units.values() {
            for (slice_key, slice) in &unit.slices {
                if !slice.is_free {
                    continue;
                }
                // Slice keys may be ISO datetimes; the date is the first 10 chars.
                let day_str = &slice_key[..10.min(slice_key.len())];
                match NaiveDate::parse_from_str(day_str, "%Y-%m-%d") {
                    Ok(date) if date >= start && date <= end => {
                        *free_by_date.entry(date).or_insert(0) += 1;
                    }
                    Ok(_) => {}
                    Err(_) => warn!(slice = %slice_key, "Skipping unparseable slice date"),
                }
            }
        }

        Ok(stay_windows(&free_by_date, nights))
    }
}
