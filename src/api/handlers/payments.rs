use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::{
    api::{middleware::auth::CurrentPrincipal, state::AppState},
    domain::{Payment, PaymentMethod},
    error::{AppError, Result},
    service::payment_service::{InitiatePayment, InitiatedPayment, PaymentDetails},
};

#[derive(Debug, Deserialize, Validate)]
pub struct InitiateMembershipPayment {
    #[validate(length(min = 1, max = 50))]
    pub plan: String,
    pub method: PaymentMethod,
    #[validate(length(min = 9, max = 16))]
    pub phone_number: Option<String>,
    /// Pay for someone else's membership.
    pub beneficiary_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct VerifyReceipt {
    #[validate(length(min = 8, max = 20))]
    pub receipt_code: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub payment: Payment,
    /// False when the payment had already been settled.
    pub applied: bool,
}

pub async fn initiate(
    State(state): State<AppState>,
    Extension(principal): Extension<CurrentPrincipal>,
    Json(request): Json<InitiateMembershipPayment>,
) -> Result<(StatusCode, Json<InitiatedPayment>)> {
    request
        .validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let plan = state
        .settings
        .membership
        .plan(&request.plan)
        .ok_or_else(|| AppError::Validation(format!("Unknown membership plan '{}'", request.plan)))?;
    let amount = match request.method {
        PaymentMethod::Mpesa => plan.mpesa_price,
        PaymentMethod::PayPal => plan.paypal_price,
    };

    let initiated = state
        .service_context
        .payment_service
        .initiate(InitiatePayment {
            payer_id: principal.id,
            beneficiary_id: request.beneficiary_id,
            plan: plan.slug.clone(),
            method: request.method,
            amount,
            phone_number: request.phone_number,
            description: format!("{} membership", plan.name),
            contact_email: principal.email,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(initiated)))
}

pub async fn mine(
    State(state): State<AppState>,
    Extension(principal): Extension<CurrentPrincipal>,
) -> Result<Json<Vec<Payment>>> {
    let payments = state
        .service_context
        .payment_service
        .list_for_payer(principal.id)
        .await?;
    Ok(Json(payments))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(principal): Extension<CurrentPrincipal>,
    Path(id): Path<Uuid>,
) -> Result<Json<PaymentDetails>> {
    let details = state
        .service_context
        .payment_service
        .details(id, principal.id)
        .await?;
    Ok(Json(details))
}

pub async fn poll(
    State(state): State<AppState>,
    Extension(principal): Extension<CurrentPrincipal>,
    Path(id): Path<Uuid>,
) -> Result<Json<Payment>> {
    let payment = state
        .service_context
        .payment_service
        .poll(id, principal.id)
        .await?;
    Ok(Json(payment))
}

pub async fn verify(
    State(state): State<AppState>,
    Extension(principal): Extension<CurrentPrincipal>,
    Path(id): Path<Uuid>,
    Json(request): Json<VerifyReceipt>,
) -> Result<Json<VerifyResponse>> {
    request
        .validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let outcome = state
        .service_context
        .payment_service
        .verify_manual(id, principal.id, &request.receipt_code)
        .await?;

    Ok(Json(VerifyResponse {
        applied: outcome.applied(),
        payment: outcome.payment().clone(),
    }))
}

pub async fn capture(
    State(state): State<AppState>,
    Extension(principal): Extension<CurrentPrincipal>,
    Path(id): Path<Uuid>,
) -> Result<Json<Payment>> {
    let payment = state
        .service_context
        .payment_service
        .capture(id, principal.id)
        .await?;
    Ok(Json(payment))
}

pub async fn cancel(
    State(state): State<AppState>,
    Extension(principal): Extension<CurrentPrincipal>,
    Path(id): Path<Uuid>,
) -> Result<Json<Payment>> {
    let payment = state
        .service_context
        .payment_service
        .cancel(id, principal.id)
        .await?;
    Ok(Json(payment))
}
