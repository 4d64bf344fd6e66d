use axum::{
    extract::{Extension, Path, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::{
    api::{middleware::auth::CurrentPrincipal, state::AppState},
    domain::{Membership, Payment},
    error::{AppError, Result},
    service::reaper::ReaperReport,
};

#[derive(Debug, Deserialize, Validate)]
pub struct RefundRequest {
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
}

pub async fn refund_payment(
    State(state): State<AppState>,
    Extension(admin): Extension<CurrentPrincipal>,
    Path(id): Path<Uuid>,
    Json(request): Json<RefundRequest>,
) -> Result<Json<Payment>> {
    request
        .validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    tracing::info!("Admin {} refunding payment {}", admin.id, id);
    let payment = state
        .service_context
        .payment_service
        .refund(id, &request.reason)
        .await?;
    Ok(Json(payment))
}

pub async fn cancel_membership(
    State(state): State<AppState>,
    Extension(admin): Extension<CurrentPrincipal>,
    Path(id): Path<Uuid>,
) -> Result<Json<Membership>> {
    tracing::info!("Admin {} cancelling membership {}", admin.id, id);
    let membership = state
        .service_context
        .membership_service
        .cancel(id)
        .await?;
    Ok(Json(membership))
}

pub async fn run_reaper(State(state): State<AppState>) -> Result<Json<ReaperReport>> {
    let report = state.service_context.reaper.run_once().await?;
    Ok(Json(report))
}
