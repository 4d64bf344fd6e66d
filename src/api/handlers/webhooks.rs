use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::{
    api::state::AppState,
    domain::PaymentMethod,
    error::Result,
    payments::InboundWebhook,
};

fn inbound(headers: HeaderMap, query: HashMap<String, String>, body: Bytes) -> InboundWebhook {
    InboundWebhook {
        headers,
        query,
        body: body.to_vec(),
    }
}

/// STK push result callback. Daraja expects this exact acknowledgement.
pub async fn mpesa(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    state
        .service_context
        .payment_service
        .handle_webhook(PaymentMethod::Mpesa, inbound(headers, query, body))
        .await?;

    Ok(Json(json!({ "ResultCode": 0, "ResultDesc": "Accepted" })))
}

pub async fn paypal(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    state
        .service_context
        .payment_service
        .handle_webhook(PaymentMethod::PayPal, inbound(headers, query, body))
        .await?;

    Ok(StatusCode::OK)
}
