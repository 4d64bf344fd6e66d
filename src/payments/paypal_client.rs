use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{
    config::PayPalConfig,
    domain::{Confirmation, ConfirmationSource, PaymentLookup, PaymentMethod},
    error::{AppError, Result},
    payments::{
        read_json,
        token_cache::{PayPalCredentials, TokenCache},
        GatewayInitiation, GatewayOutcome, GatewayStatus, InboundWebhook, InitiateRequest,
        PaymentGateway, WebhookEvent,
    },
};

/// Formats minor units (cents) as a PayPal decimal string.
pub fn format_amount(minor: i64) -> String {
    format!("{}.{:02}", minor / 100, minor % 100)
}

/// Parses a PayPal decimal string back into minor units.
pub fn parse_amount(value: &str) -> Option<i64> {
    let (whole, frac) = match value.trim().split_once('.') {
        Some((w, f)) => (w, f),
        None => (value.trim(), "0"),
    };
    if frac.len() > 2 || frac.is_empty() || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let whole: i64 = whole.parse().ok()?;
    let frac: i64 = format!("{:0<2}", frac).parse().ok()?;
    Some(whole * 100 + frac)
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct Money {
    value: String,
}

#[derive(Debug, Deserialize)]
struct Capture {
    id: String,
    status: String,
    amount: Option<Money>,
}

#[derive(Debug, Default, Deserialize)]
struct UnitPayments {
    #[serde(default)]
    captures: Vec<Capture>,
}

#[derive(Debug, Deserialize)]
struct PurchaseUnit {
    #[serde(default)]
    payments: Option<UnitPayments>,
}

#[derive(Debug, Deserialize)]
struct Order {
    id: String,
    status: String,
    #[serde(default)]
    links: Vec<Link>,
    #[serde(default)]
    purchase_units: Vec<PurchaseUnit>,
}

impl Order {
    fn approval_url(&self) -> Option<String> {
        self.links
            .iter()
            .find(|l| l.rel == "approve" || l.rel == "payer-action")
            .map(|l| l.href.clone())
    }

    fn first_capture(&self) -> Option<&Capture> {
        self.purchase_units
            .iter()
            .filter_map(|u| u.payments.as_ref())
            .flat_map(|p| p.captures.iter())
            .next()
    }

    fn to_status(&self) -> GatewayStatus {
        let capture = self.first_capture();
        let outcome = match self.status.as_str() {
            "COMPLETED" => match capture.map(|c| c.status.as_str()) {
                Some("COMPLETED") | None => GatewayOutcome::Succeeded,
                Some("PENDING") => GatewayOutcome::Pending,
                Some(_) => GatewayOutcome::Failed,
            },
            "VOIDED" => GatewayOutcome::Failed,
            _ => GatewayOutcome::Pending,
        };

        GatewayStatus {
            outcome,
            result_code: Some(self.status.clone()),
            description: capture.map(|c| format!("capture {}", c.status.to_lowercase())),
            receipt: capture.map(|c| c.id.clone()),
            amount: capture
                .and_then(|c| c.amount.as_ref())
                .and_then(|a| parse_amount(&a.value)),
        }
    }
}

#[derive(Debug, Serialize)]
struct VerifySignatureRequest<'a> {
    auth_algo: &'a str,
    cert_url: &'a str,
    transmission_id: &'a str,
    transmission_sig: &'a str,
    transmission_time: &'a str,
    webhook_id: &'a str,
    webhook_event: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct VerifySignatureResponse {
    verification_status: String,
}

#[derive(Debug, Deserialize)]
struct WebhookNotification {
    event_type: String,
    resource: WebhookResource,
}

#[derive(Debug, Deserialize)]
struct WebhookResource {
    id: String,
    amount: Option<Money>,
    custom_id: Option<String>,
    supplementary_data: Option<SupplementaryData>,
}

#[derive(Debug, Deserialize)]
struct SupplementaryData {
    related_ids: Option<RelatedIds>,
}

#[derive(Debug, Deserialize)]
struct RelatedIds {
    order_id: Option<String>,
}

impl WebhookResource {
    fn lookup(&self) -> Result<PaymentLookup> {
        let order_id = self
            .supplementary_data
            .as_ref()
            .and_then(|s| s.related_ids.as_ref())
            .and_then(|r| r.order_id.clone());
        let payment_id = self.custom_id.as_deref().and_then(|c| Uuid::parse_str(c).ok());

        match (payment_id, order_id) {
            (Some(id), Some(external_ref)) => Ok(PaymentLookup::IdWithRef { id, external_ref }),
            (Some(id), None) => Ok(PaymentLookup::Id(id)),
            (None, Some(order_id)) => Ok(PaymentLookup::ExternalRef(order_id)),
            (None, None) => Err(AppError::BadRequest(
                "PayPal event does not reference a payment".to_string(),
            )),
        }
    }
}

/// Parses a PayPal webhook notification body.
pub fn parse_notification(body: &[u8]) -> Result<WebhookEvent> {
    let notification: WebhookNotification = serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(format!("Malformed PayPal webhook: {}", e)))?;
    let resource = &notification.resource;

    Ok(match notification.event_type.as_str() {
        "PAYMENT.CAPTURE.COMPLETED" => WebhookEvent::Completed(Confirmation {
            lookup: resource.lookup()?,
            receipt_code: Some(resource.id.clone()),
            amount_confirmed: resource.amount.as_ref().and_then(|a| parse_amount(&a.value)),
            result_code: Some("COMPLETED".to_string()),
            result_description: Some(notification.event_type.clone()),
            source: ConfirmationSource::Webhook,
        }),
        "PAYMENT.CAPTURE.DENIED" | "PAYMENT.CAPTURE.DECLINED" => WebhookEvent::Failed {
            lookup: resource.lookup()?,
            result_code: Some(notification.event_type.clone()),
            reason: "PayPal capture was denied".to_string(),
        },
        other => WebhookEvent::Ignored(format!("Unhandled PayPal event {}", other)),
    })
}

/// PayPal Orders v2 adapter.
pub struct PayPalClient {
    client: reqwest::Client,
    config: PayPalConfig,
    api_base: String,
    tokens: TokenCache<PayPalCredentials>,
}

impl PayPalClient {
    pub fn new(client: reqwest::Client, config: PayPalConfig) -> Self {
        let api_base = config.api_base();
        let tokens = TokenCache::new(PayPalCredentials {
            client: client.clone(),
            api_base: api_base.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        });

        Self { client, config, api_base, tokens }
    }

    async fn get_order(&self, order_id: &str) -> Result<Order> {
        let token = self.tokens.token().await?;
        let response = self
            .client
            .get(format!("{}/v2/checkout/orders/{}", self.api_base, order_id))
            .bearer_auth(&token)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
        }
        read_json(response, "PayPal").await
    }
}

#[async_trait]
impl PaymentGateway for PayPalClient {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::PayPal
    }

    fn currency(&self) -> &str {
        &self.config.currency
    }

    async fn initiate(&self, request: &InitiateRequest) -> Result<GatewayInitiation> {
        let token = self.tokens.token().await?;
        let payload = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": request.reference,
                "custom_id": request.payment_id.to_string(),
                "description": request.description,
                "amount": {
                    "currency_code": request.currency,
                    "value": format_amount(request.amount),
                }
            }],
            "application_context": {
                "brand_name": self.config.brand_name,
                "return_url": self.config.return_url,
                "cancel_url": self.config.cancel_url,
                "user_action": "PAY_NOW",
                "shipping_preference": "NO_SHIPPING",
            }
        });

        tracing::info!(
            "Creating PayPal order for payment {} ({} {})",
            request.payment_id,
            format_amount(request.amount),
            request.currency
        );

        let response = self
            .client
            .post(format!("{}/v2/checkout/orders", self.api_base))
            .bearer_auth(&token)
            // Replays of the same payment must not open a second order.
            .header("PayPal-Request-Id", request.payment_id.to_string())
            .json(&payload)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
        }
        let order: Order = read_json(response, "PayPal").await?;
        let approval_url = order.approval_url().ok_or_else(|| {
            AppError::GatewayRejected("PayPal order has no approval link".to_string())
        })?;

        Ok(GatewayInitiation {
            external_ref: order.id,
            secondary_ref: None,
            approval_url: Some(approval_url),
            customer_message: None,
        })
    }

    async fn query_status(&self, external_ref: &str) -> Result<GatewayStatus> {
        Ok(self.get_order(external_ref).await?.to_status())
    }

    async fn capture(&self, order_ref: &str) -> Result<GatewayStatus> {
        let token = self.tokens.token().await?;
        let response = self
            .client
            .post(format!("{}/v2/checkout/orders/{}/capture", self.api_base, order_ref))
            .bearer_auth(&token)
            .header("PayPal-Request-Id", format!("capture-{}", order_ref))
            .json(&json!({}))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
        }

        match read_json::<Order>(response, "PayPal").await {
            Ok(order) => Ok(order.to_status()),
            Err(AppError::GatewayRejected(msg)) if msg.contains("ORDER_ALREADY_CAPTURED") => {
                tracing::debug!("PayPal order {} already captured, reading it back", order_ref);
                self.query_status(order_ref).await
            }
            Err(e) => Err(e),
        }
    }

    async fn verify_webhook(&self, webhook: &InboundWebhook) -> Result<()> {
        let header = |name: &str| {
            webhook
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .ok_or(AppError::Unauthorized)
        };

        let event: serde_json::Value = serde_json::from_slice(&webhook.body)
            .map_err(|e| AppError::BadRequest(format!("Malformed PayPal webhook: {}", e)))?;
        let payload = VerifySignatureRequest {
            auth_algo: header("paypal-auth-algo")?,
            cert_url: header("paypal-cert-url")?,
            transmission_id: header("paypal-transmission-id")?,
            transmission_sig: header("paypal-transmission-sig")?,
            transmission_time: header("paypal-transmission-time")?,
            webhook_id: &self.config.webhook_id,
            webhook_event: event,
        };

        let token = self.tokens.token().await?;
        let response = self
            .client
            .post(format!("{}/v1/notifications/verify-webhook-signature", self.api_base))
            .bearer_auth(&token)
            .json(&payload)
            .send()
            .await?;
        let verdict: VerifySignatureResponse = read_json(response, "PayPal").await?;

        if verdict.verification_status == "SUCCESS" {
            Ok(())
        } else {
            tracing::warn!(
                "PayPal webhook failed verification: {}",
                verdict.verification_status
            );
            Err(AppError::Unauthorized)
        }
    }

    fn interpret_webhook(&self, webhook: &InboundWebhook) -> Result<WebhookEvent> {
        parse_notification(&webhook.body)
    }
}
