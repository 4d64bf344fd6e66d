use axum::{extract::State, http::StatusCode, Json, response::IntoResponse};
use serde_json::json;

use crate::{api::state::AppState, domain::PaymentMethod};

pub async fn root(State(state): State<AppState>) -> impl IntoResponse {
    let gateways = state.service_context.payment_service.gateways();
    let methods: Vec<&str> = [PaymentMethod::Mpesa, PaymentMethod::PayPal]
        .into_iter()
        .filter(|m| gateways.is_enabled(*m))
        .map(|m| m.as_str())
        .collect();

    Json(json!({
        "name": "Quorum API",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Membership payments for student associations",
        "status": "operational",
        "payment_methods": methods,
        "plans": state.settings.membership.plans.iter().map(|p| json!({
            "slug": p.slug,
            "name": p.name,
            "mpesa_price": p.mpesa_price,
            "paypal_price": p.paypal_price,
        })).collect::<Vec<_>>(),
    }))
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = sqlx::query("SELECT 1")
        .execute(&state.service_context.db_pool)
        .await
        .is_ok();

    let status = if database { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(json!({
        "status": if database { "healthy" } else { "degraded" },
        "database": database,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}
