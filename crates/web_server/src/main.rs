//! Main entry point for the campsite watch server.
//! Hosts the subscription API and runs the monitoring supervisor as a
//! background task.

use std::sync::Arc;

use actix_web::{App, HttpResponse, HttpServer, middleware::Logger, web};

use campsite_watch::{
    NotificationDispatcher, SubscriptionService, Supervisor, SupervisorConfig,
};
use notification_services::{
    EmailSender, MockEmailSender, MockSmsSender, MockWhatsappSender, SesEmailSender, SmsSender,
    SnsSmsSender, TwilioWhatsappSender, WhatsappSender,
};
use postgres::PgStore;
use postgres::database::{create_connection_pool, test_connection};
use providers::ProviderRouter;

/// Request payload types for the subscription API
mod api_types;
/// HTTP handlers for the subscription API
mod handlers;

use handlers::*;

/// Build channel senders, falling back to mocks when a transport is not
/// configured so the rest of the system still runs in development.
async fn build_senders() -> (
    Arc<dyn EmailSender>,
    Arc<dyn SmsSender>,
    Arc<dyn WhatsappSender>,
) {
    let email: Arc<dyn EmailSender> = match SesEmailSender::new().await {
        Ok(sender) => {
            log::info!("📧 AWS SES email sender initialized");
            Arc::new(sender)
        }
        Err(e) => {
            log::warn!("🔧 SES not configured ({}); using mock email sender", e);
            Arc::new(MockEmailSender)
        }
    };

    let sms: Arc<dyn SmsSender> = match SnsSmsSender::new().await {
        Ok(sender) => {
            log::info!("📱 AWS SNS SMS sender initialized");
            Arc::new(sender)
        }
        Err(e) => {
            log::warn!("🔧 SNS not configured ({}); using mock SMS sender", e);
            Arc::new(MockSmsSender)
        }
    };

    let whatsapp: Arc<dyn WhatsappSender> = match TwilioWhatsappSender::new() {
        Ok(sender) => {
            log::info!("💬 Twilio WhatsApp sender initialized");
            Arc::new(sender)
        }
        Err(e) => {
            log::warn!("🔧 Twilio not configured ({}); using mock WhatsApp sender", e);
            Arc::new(MockWhatsappSender)
        }
    };

    (email, sms, whatsapp)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    log::info!("🚀 Starting campsite watch server...");

    // Create database connection pool
    let pool = match create_connection_pool().await {
        Ok(pool) => {
            log::info!("🗃️ Database pool created successfully");

            if let Err(e) = test_connection(&pool).await {
                log::error!("❌ Database connection test failed: {}", e);
            }
            pool
        }
        Err(e) => {
            log::error!("❌ Failed to create database pool: {}", e);
            log::error!("💡 Make sure PostgreSQL is running and DATABASE_URL is set");
            std::process::exit(1);
        }
    };

    let stores = PgStore::new(pool).into_stores();

    // Availability providers for both booking sources
    let provider = match ProviderRouter::new() {
        Ok(router) => Arc::new(router),
        Err(e) => {
            log::error!("❌ Failed to build availability providers: {}", e);
            std::process::exit(1);
        }
    };

    // Channel senders
    let (email, sms, whatsapp) = build_senders().await;

    let dispatcher = Arc::new(NotificationDispatcher::new(
        stores.clone(),
        Some(email),
        Some(sms),
        Some(whatsapp),
        None,
    ));

    // Start the monitoring supervisor
    let supervisor = Supervisor::new(
        stores.clone(),
        provider,
        dispatcher,
        Some(SupervisorConfig::default()),
    );
    if let Err(e) = supervisor.start().await {
        log::error!("❌ Failed to start subscription supervisor: {}", e);
        std::process::exit(1);
    }
    log::info!("🔭 Subscription supervisor started");

    let service = web::Data::new(SubscriptionService::new(stores.clone(), supervisor.clone()));
    let supervisor_data = web::Data::new(supervisor.clone());

    log::info!("🌐 Server will be available at: http://0.0.0.0:8080");

    let server = HttpServer::new(move || {
        App::new()
            .app_data(service.clone())
            .app_data(supervisor_data.clone())
            .wrap(Logger::default())
            .service(
                web::scope("/api")
                    .service(
                        web::scope("/subscriptions")
                            .route("", web::post().to(create_subscription))
                            .route("", web::get().to(list_subscriptions))
                            .route("/{id}", web::get().to(get_subscription))
                            .route("/{id}", web::put().to(update_subscription))
                            .route("/{id}", web::delete().to(cancel_subscription))
                            .route("/{id}/pause", web::post().to(pause_subscription))
                            .route("/{id}/resume", web::post().to(resume_subscription))
                            .route("/{id}/status", web::get().to(subscription_status)),
                    )
                    .service(
                        web::scope("/admin").route("/watcher", web::get().to(watcher_stats)),
                    ),
            )
            .route(
                "/health",
                web::get().to(|| async { HttpResponse::Ok().body("OK") }),
            )
    })
    .bind("0.0.0.0:8080")?
    .run()
    .await;

    supervisor.shutdown().await;
    server
}
