use providers::ProviderError;

use crate::store::StoreError;

/// Custom error type for subscription watch operations
#[derive(thiserror::Error, Debug)]
pub enum WatchError {
    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Subscription not found
    #[error("Subscription not found")]
    NotFound,

    /// Invalid date range
    #[error("Invalid date range: end date must not be before start date")]
    InvalidDateRange,

    /// The owner's tier does not allow another active subscription
    #[error("Subscription quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Upstream availability provider error
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl actix_web::ResponseError for WatchError {
    fn error_response(&self) -> actix_web::HttpResponse {
        use actix_web::HttpResponse;

        match self {
            WatchError::Validation(msg) => HttpResponse::BadRequest().json(serde_json::json!({
                "error": "validation_error",
                "message": msg
            })),
            WatchError::NotFound => HttpResponse::NotFound().json(serde_json::json!({
                "error": "subscription_not_found",
                "message": "Subscription not found"
            })),
            WatchError::InvalidDateRange => HttpResponse::BadRequest().json(serde_json::json!({
                "error": "invalid_date_range",
                "message": "End date must not be before start date"
            })),
            WatchError::QuotaExceeded(msg) => HttpResponse::Forbidden().json(serde_json::json!({
                "error": "quota_exceeded",
                "message": msg
            })),
            WatchError::Provider(ProviderError::NotFound) => {
                HttpResponse::NotFound().json(serde_json::json!({
                    "error": "park_not_found",
                    "message": "Park not found upstream"
                }))
            }
            WatchError::Provider(ProviderError::RateLimited) => {
                HttpResponse::TooManyRequests().json(serde_json::json!({
                    "error": "rate_limited",
                    "message": "Rate limited by the booking site. Please try again later."
                }))
            }
            WatchError::Provider(e) => HttpResponse::BadGateway().json(serde_json::json!({
                "error": "provider_error",
                "message": format!("Upstream provider error: {}", e)
            })),
            WatchError::Config(msg) => {
                HttpResponse::InternalServerError().json(serde_json::json!({
                    "error": "configuration_error",
                    "message": format!("Configuration error: {}", msg)
                }))
            }
            _ => HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "internal_error",
                "message": "An internal error occurred"
            })),
        }
    }
}
