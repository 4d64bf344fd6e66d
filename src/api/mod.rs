pub mod handlers;
pub mod middleware;
pub mod state;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{
    compression::CompressionLayer,
    cors::CorsLayer,
    trace::TraceLayer,
};
use std::sync::Arc;

use crate::{
    config::Settings,
    service::ServiceContext,
};
use state::AppState;

pub fn create_app(
    service_context: Arc<ServiceContext>,
    settings: Arc<Settings>,
) -> Router {
    let app_state = AppState::new(service_context, settings);

    Router::new()
        // Root and health endpoints
        .route("/", get(handlers::root::root))
        .route("/health", get(handlers::root::health_check))

        // API routes
        .nest("/api", api_routes(app_state.clone()))

        // Admin routes
        .nest("/admin", admin_routes(app_state.clone()))

        .with_state(app_state)

        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive()) // Configure properly for production
        .layer(TraceLayer::new_for_http())
}

fn api_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .nest("/payments", payment_routes(state.clone()))
        .nest("/memberships", membership_routes(state))
        .nest("/webhooks", webhook_routes())
}

fn payment_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/membership", post(handlers::payments::initiate))
        .route("/mine", get(handlers::payments::mine))
        .route("/:id", get(handlers::payments::get))
        .route("/:id/poll", post(handlers::payments::poll))
        .route("/:id/verify", post(handlers::payments::verify))
        .route("/:id/capture", post(handlers::payments::capture))
        .route("/:id/cancel", post(handlers::payments::cancel))
        .route_layer(axum::middleware::from_fn_with_state(
            state,
            middleware::auth::require_auth,
        ))
}

fn membership_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/mine", get(handlers::memberships::mine))
        .route_layer(axum::middleware::from_fn_with_state(
            state,
            middleware::auth::require_auth,
        ))
}

/// Public: each gateway authenticates its own callbacks.
fn webhook_routes() -> Router<AppState> {
    Router::new()
        .route("/mpesa", post(handlers::webhooks::mpesa))
        .route("/paypal", post(handlers::webhooks::paypal))
}

fn admin_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/payments/:id/refund", post(handlers::admin::refund_payment))
        .route("/memberships/:id/cancel", post(handlers::admin::cancel_membership))
        .route("/reaper/run", post(handlers::admin::run_reaper))
        .route_layer(axum::middleware::from_fn_with_state(
            state,
            middleware::auth::require_admin,
        ))
}
