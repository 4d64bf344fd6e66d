use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::de::DeserializeOwned;
use std::{collections::HashMap, sync::Arc, time::Duration};
use uuid::Uuid;

use crate::{
    config::PaymentsConfig,
    domain::{Confirmation, PaymentLookup, PaymentMethod},
    error::{AppError, Result},
};

pub mod mpesa_client;
pub mod paypal_client;
pub mod token_cache;

pub use mpesa_client::{CallbackSigner, MpesaClient};
pub use paypal_client::PayPalClient;

/// Everything an adapter needs to open a transaction. The payment row
/// already exists when this is built.
#[derive(Debug, Clone)]
pub struct InitiateRequest {
    pub payment_id: Uuid,
    pub amount: i64,
    pub currency: String,
    /// Phone number for push payments. Wallets ignore it.
    pub payer_address: Option<String>,
    pub reference: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct GatewayInitiation {
    pub external_ref: String,
    pub secondary_ref: Option<String>,
    pub approval_url: Option<String>,
    pub customer_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayOutcome {
    Succeeded,
    Pending,
    Failed,
}

#[derive(Debug, Clone)]
pub struct GatewayStatus {
    pub outcome: GatewayOutcome,
    pub result_code: Option<String>,
    pub description: Option<String>,
    pub receipt: Option<String>,
    pub amount: Option<i64>,
}

impl GatewayStatus {
    pub fn pending(description: impl Into<String>) -> Self {
        Self {
            outcome: GatewayOutcome::Pending,
            result_code: None,
            description: Some(description.into()),
            receipt: None,
            amount: None,
        }
    }
}

/// Raw inbound webhook, as received by the HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct InboundWebhook {
    pub headers: HeaderMap,
    pub query: HashMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum WebhookEvent {
    Completed(Confirmation),
    Failed {
        lookup: PaymentLookup,
        result_code: Option<String>,
        reason: String,
    },
    Ignored(String),
}

/// One external money-movement provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn method(&self) -> PaymentMethod;

    /// Currency the provider settles this method in.
    fn currency(&self) -> &str;

    async fn initiate(&self, request: &InitiateRequest) -> Result<GatewayInitiation>;

    async fn query_status(&self, external_ref: &str) -> Result<GatewayStatus>;

    async fn capture(&self, _order_ref: &str) -> Result<GatewayStatus> {
        Err(AppError::BadRequest(format!(
            "{} payments cannot be captured",
            self.method().as_str()
        )))
    }

    /// Fails closed: a gateway that cannot check authenticity rejects.
    async fn verify_webhook(&self, _webhook: &InboundWebhook) -> Result<()> {
        Err(AppError::Unauthorized)
    }

    fn interpret_webhook(&self, webhook: &InboundWebhook) -> Result<WebhookEvent>;
}

/// Enabled gateways, keyed by the method they serve.
#[derive(Clone, Default)]
pub struct Gateways {
    inner: HashMap<PaymentMethod, Arc<dyn PaymentGateway>>,
}

impl Gateways {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, gateway: Arc<dyn PaymentGateway>) {
        tracing::info!("Registered {} gateway", gateway.method().as_str());
        self.inner.insert(gateway.method(), gateway);
    }

    pub fn get(&self, method: PaymentMethod) -> Result<Arc<dyn PaymentGateway>> {
        self.inner.get(&method).cloned().ok_or_else(|| {
            AppError::BadRequest(format!("{} payments are not enabled", method.as_str()))
        })
    }

    pub fn is_enabled(&self, method: PaymentMethod) -> bool {
        self.inner.contains_key(&method)
    }

    pub fn from_config(config: &PaymentsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        let mut gateways = Self::new();
        if let Some(mpesa) = config.mpesa.as_ref().filter(|c| c.enabled) {
            gateways.register(Arc::new(MpesaClient::new(client.clone(), mpesa.clone())));
        }
        if let Some(paypal) = config.paypal.as_ref().filter(|c| c.enabled) {
            gateways.register(Arc::new(PayPalClient::new(client.clone(), paypal.clone())));
        }
        Ok(gateways)
    }
}

/// Reads a provider JSON response, mapping HTTP failures onto the
/// gateway error taxonomy. Provider 5xx is treated as transport trouble.
pub(crate) async fn read_json<T: DeserializeOwned>(
    response: reqwest::Response,
    provider: &str,
) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }

    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, provider, &body))
}

pub(crate) fn status_error(status: reqwest::StatusCode, provider: &str, body: &str) -> AppError {
    let message = provider_message(body);
    if status == reqwest::StatusCode::UNAUTHORIZED {
        AppError::GatewayAuth(format!("{}: {}", provider, message))
    } else if status.is_server_error() {
        AppError::Transport(format!("{} returned {}: {}", provider, status, message))
    } else {
        AppError::GatewayRejected(format!("{}: {}", provider, message))
    }
}

/// Best-effort extraction of a human message from a provider error body.
pub(crate) fn provider_message(body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let field = |v: &serde_json::Value, key: &str| v.get(key).and_then(|m| m.as_str()).map(str::to_string);

    parsed
        .as_ref()
        .and_then(|v| {
            let issue = v
                .get("details")
                .and_then(|d| d.get(0))
                .and_then(|d| field(d, "issue"));
            field(v, "errorMessage")
                .or_else(|| field(v, "message").map(|m| match &issue {
                    Some(issue) => format!("{} ({})", m, issue),
                    None => m,
                }))
                .or_else(|| field(v, "error_description"))
                .or_else(|| field(v, "ResponseDescription"))
        })
        .unwrap_or_else(|| body.chars().take(200).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_message_prefers_structured_fields() {
        assert_eq!(
            provider_message(r#"{"requestId":"1","errorCode":"400.002.02","errorMessage":"Bad Request - Invalid Amount"}"#),
            "Bad Request - Invalid Amount"
        );
        assert_eq!(
            provider_message(r#"{"name":"UNPROCESSABLE_ENTITY","message":"The requested action could not be performed","details":[{"issue":"ORDER_ALREADY_CAPTURED"}]}"#),
            "The requested action could not be performed (ORDER_ALREADY_CAPTURED)"
        );
        assert_eq!(provider_message("gateway down"), "gateway down");
    }

    #[test]
    fn test_status_error_keeps_transport_apart_from_rejection() {
        assert!(matches!(
            status_error(reqwest::StatusCode::SERVICE_UNAVAILABLE, "M-Pesa", ""),
            AppError::Transport(_)
        ));
        assert!(matches!(
            status_error(reqwest::StatusCode::BAD_REQUEST, "M-Pesa", ""),
            AppError::GatewayRejected(_)
        ));
        assert!(matches!(
            status_error(reqwest::StatusCode::UNAUTHORIZED, "PayPal", ""),
            AppError::GatewayAuth(_)
        ));
    }

    #[test]
    fn test_missing_gateway_is_bad_request() {
        let gateways = Gateways::new();
        assert!(!gateways.is_enabled(PaymentMethod::Mpesa));
        assert!(matches!(gateways.get(PaymentMethod::PayPal), Err(AppError::BadRequest(_))));
    }
}
