use actix_web::{HttpRequest, HttpResponse, Result, web};
use validator::Validate;

use campsite_watch::{
    NewSubscription, OwnerId, Subscription, SubscriptionService, SubscriptionUpdate, Supervisor,
    WatchError,
};

use crate::api_types::*;

/// Resolve the calling owner from the `X-Owner-Id` header.
///
/// Authentication proper lives in the excluded web layer; this service only
/// needs a stable owner identity (`user:<uuid>` or `device:<token>`).
fn require_owner(req: &HttpRequest) -> Result<OwnerId, WatchError> {
    req.headers()
        .get("X-Owner-Id")
        .and_then(|v| v.to_str().ok())
        .and_then(OwnerId::parse)
        .ok_or_else(|| {
            WatchError::Validation(
                "missing or invalid X-Owner-Id header (expected user:<uuid> or device:<token>)"
                    .to_string(),
            )
        })
}

/// Fetch a subscription and verify the caller owns it. Foreign ids read as
/// not-found so ownership is never leaked.
async fn owned_subscription(
    service: &SubscriptionService,
    owner: &OwnerId,
    id: uuid::Uuid,
) -> Result<Subscription, WatchError> {
    let subscription = service.get_subscription(id).await?;
    if &subscription.owner != owner {
        return Err(WatchError::NotFound);
    }
    Ok(subscription)
}

/// Creates a new availability watch for the calling owner
pub async fn create_subscription(
    service: web::Data<SubscriptionService>,
    req: HttpRequest,
    request: web::Json<CreateSubscriptionRequest>,
) -> Result<HttpResponse, WatchError> {
    request
        .validate()
        .map_err(|e| WatchError::Validation(format!("Validation error: {}", e)))?;

    let owner = require_owner(&req)?;
    let request = request.into_inner();

    let subscription = service
        .create_subscription(NewSubscription {
            owner,
            parks: request.parks,
            start_date: request.start_date,
            end_date: request.end_date,
            nights: request.nights,
            preference: request.preference,
            channels: request.channels,
            check_interval_minutes: request.check_interval_minutes,
        })
        .await?;

    Ok(HttpResponse::Created().json(SubscriptionResponse::from(subscription)))
}

/// Lists all watches belonging to the calling owner
pub async fn list_subscriptions(
    service: web::Data<SubscriptionService>,
    req: HttpRequest,
) -> Result<HttpResponse, WatchError> {
    let owner = require_owner(&req)?;
    let subscriptions = service.list_subscriptions(&owner).await?;

    let subscriptions: Vec<SubscriptionResponse> = subscriptions
        .into_iter()
        .map(SubscriptionResponse::from)
        .collect();

    Ok(HttpResponse::Ok().json(ListSubscriptionsResponse {
        total: subscriptions.len(),
        subscriptions,
    }))
}

/// Gets one watch by id
pub async fn get_subscription(
    service: web::Data<SubscriptionService>,
    req: HttpRequest,
    path: web::Path<uuid::Uuid>,
) -> Result<HttpResponse, WatchError> {
    let owner = require_owner(&req)?;
    let subscription = owned_subscription(&service, &owner, path.into_inner()).await?;

    Ok(HttpResponse::Ok().json(SubscriptionResponse::from(subscription)))
}

/// Edits a watch; the worker restarts with the new configuration
pub async fn update_subscription(
    service: web::Data<SubscriptionService>,
    req: HttpRequest,
    path: web::Path<uuid::Uuid>,
    request: web::Json<UpdateSubscriptionRequest>,
) -> Result<HttpResponse, WatchError> {
    let owner = require_owner(&req)?;
    let id = path.into_inner();
    let existing = owned_subscription(&service, &owner, id).await?;
    let request = request.into_inner();

    let window = match (request.start_date, request.end_date) {
        (None, None) => None,
        (start, end) => Some((
            start.unwrap_or(existing.start_date),
            end.unwrap_or(existing.end_date),
        )),
    };

    let updated = service
        .update_subscription(
            id,
            SubscriptionUpdate {
                window,
                nights: request.nights,
                preference: request.preference,
                channels: request.channels,
                check_interval_minutes: request.check_interval_minutes,
            },
        )
        .await?;

    Ok(HttpResponse::Ok().json(SubscriptionResponse::from(updated)))
}

/// Pauses a watch
pub async fn pause_subscription(
    service: web::Data<SubscriptionService>,
    req: HttpRequest,
    path: web::Path<uuid::Uuid>,
) -> Result<HttpResponse, WatchError> {
    let owner = require_owner(&req)?;
    let id = path.into_inner();
    owned_subscription(&service, &owner, id).await?;

    service.pause_subscription(id).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// Resumes a paused watch
pub async fn resume_subscription(
    service: web::Data<SubscriptionService>,
    req: HttpRequest,
    path: web::Path<uuid::Uuid>,
) -> Result<HttpResponse, WatchError> {
    let owner = require_owner(&req)?;
    let id = path.into_inner();
    owned_subscription(&service, &owner, id).await?;

    service.resume_subscription(id).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// Cancels a watch
pub async fn cancel_subscription(
    service: web::Data<SubscriptionService>,
    req: HttpRequest,
    path: web::Path<uuid::Uuid>,
) -> Result<HttpResponse, WatchError> {
    let owner = require_owner(&req)?;
    let id = path.into_inner();
    owned_subscription(&service, &owner, id).await?;

    service.cancel_subscription(id).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// Gets the status view for a watch: lifecycle state, poll health, and
/// recent notification history
pub async fn subscription_status(
    service: web::Data<SubscriptionService>,
    req: HttpRequest,
    path: web::Path<uuid::Uuid>,
) -> Result<HttpResponse, WatchError> {
    let owner = require_owner(&req)?;
    let id = path.into_inner();
    owned_subscription(&service, &owner, id).await?;

    let status = service.get_subscription_status(id).await?;
    Ok(HttpResponse::Ok().json(status))
}

/// Supervisor statistics for observability tooling
pub async fn watcher_stats(
    supervisor: web::Data<std::sync::Arc<Supervisor>>,
) -> Result<HttpResponse, WatchError> {
    let stats = supervisor.stats().await;
    Ok(HttpResponse::Ok().json(stats))
}
