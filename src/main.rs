use std::sync::Arc;
use sqlx::sqlite::SqlitePoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quorum::{
    api,
    config::Settings,
    integrations::{email::EmailIntegration, IntegrationManager},
    payments::Gateways,
    service::ServiceContext,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quorum=debug,tower_http=debug,axum=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let settings = Settings::new().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config: {}. Using defaults.", e);
        Settings::default()
    });

    tracing::info!("Starting Quorum server on {}:{}", settings.server.host, settings.server.port);

    // Initialize database
    let db_pool = SqlitePoolOptions::new()
        .max_connections(settings.database.max_connections)
        .connect(&settings.database.url)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await?;

    let gateways = Gateways::from_config(&settings.payments)?;
    if !gateways.is_enabled(quorum::domain::PaymentMethod::Mpesa)
        && !gateways.is_enabled(quorum::domain::PaymentMethod::PayPal)
    {
        tracing::warn!("No payment gateway is enabled; initiation requests will be rejected");
    }

    // Initialize integration manager
    let integration_manager = Arc::new(IntegrationManager::new());

    if let Some(email) = EmailIntegration::new(settings.email.clone())? {
        integration_manager.register(Arc::new(email)).await;
    }

    // Check integration health
    let health_results = integration_manager.health_check_all().await;
    for (name, result) in health_results {
        match result {
            Ok(_) => tracing::info!("Integration {} is healthy", name),
            Err(e) => tracing::warn!("Integration {} health check failed: {:?}", name, e),
        }
    }

    let service_context = Arc::new(ServiceContext::new(
        &settings,
        gateways,
        integration_manager,
        db_pool.clone(),
    ));

    if settings.reaper.enabled {
        tracing::info!(
            "Payment reaper sweeping every {}s for payments idle over {} minutes",
            settings.reaper.interval_secs,
            settings.reaper.pending_timeout_minutes
        );
        service_context.reaper.clone().spawn(settings.reaper.interval_secs);
    }

    let app = api::create_app(service_context, Arc::new(settings.clone()));

    let listener = tokio::net::TcpListener::bind(
        format!("{}:{}", settings.server.host, settings.server.port)
    ).await?;

    tracing::info!("Server listening on http://{}:{}", settings.server.host, settings.server.port);

    axum::serve(listener, app).await?;

    Ok(())
}
