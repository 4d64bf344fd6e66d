use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::{
    config::MpesaConfig,
    domain::{validation, Confirmation, ConfirmationSource, PaymentLookup, PaymentMethod},
    error::{AppError, Result},
    payments::{
        provider_message, read_json, status_error,
        token_cache::{MpesaCredentials, TokenCache},
        GatewayInitiation, GatewayOutcome, GatewayStatus, InboundWebhook, InitiateRequest,
        PaymentGateway, WebhookEvent,
    },
};

type HmacSha256 = Hmac<Sha256>;

/// Request cancelled or not yet reachable on the handset; retry later.
const RESULT_DEVICE_UNREACHABLE: &str = "1037";
/// Query error returned while the customer has not answered the prompt.
const ERROR_STILL_PROCESSING: &str = "500.001.1001";
/// Daraja timestamps are East Africa Time.
const EAT_OFFSET_HOURS: i64 = 3;

/// Signs callback URLs so that an inbound push-payment result can be
/// tied to the payment it was issued for.
#[derive(Clone)]
pub struct CallbackSigner {
    secret: Vec<u8>,
}

impl CallbackSigner {
    pub fn new(secret: &str) -> Self {
        Self { secret: secret.as_bytes().to_vec() }
    }

    pub fn sign(&self, payment_id: Uuid) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| AppError::Internal(format!("Invalid callback secret: {}", e)))?;
        mac.update(payment_id.to_string().as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    pub fn verify(&self, payment_id: Uuid, signature: &str) -> bool {
        match self.sign(payment_id) {
            Ok(expected) => bool::from(expected.as_bytes().ct_eq(signature.to_ascii_lowercase().as_bytes())),
            Err(_) => false,
        }
    }

    pub fn callback_url(&self, base: &str, payment_id: Uuid) -> Result<String> {
        let separator = if base.contains('?') { '&' } else { '?' };
        Ok(format!("{}{}ref={}&sig={}", base, separator, payment_id, self.sign(payment_id)?))
    }
}

pub fn mask_phone(phone: &str) -> String {
    let hidden = phone.chars().count().saturating_sub(3);
    phone
        .chars()
        .enumerate()
        .map(|(i, c)| if i < hidden { '*' } else { c })
        .collect()
}

/// Maps a Daraja `ResultCode` onto a gateway outcome.
pub fn classify_result_code(code: &str) -> GatewayOutcome {
    match code.trim() {
        "0" => GatewayOutcome::Succeeded,
        RESULT_DEVICE_UNREACHABLE => GatewayOutcome::Pending,
        _ => GatewayOutcome::Failed,
    }
}

/// Daraja is inconsistent about numeric fields: callbacks send numbers,
/// queries send strings.
fn code_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushRequest<'a> {
    business_short_code: &'a str,
    password: String,
    timestamp: String,
    transaction_type: &'static str,
    amount: i64,
    party_a: &'a str,
    party_b: &'a str,
    phone_number: &'a str,
    #[serde(rename = "CallBackURL")]
    callback_url: String,
    account_reference: &'a str,
    transaction_desc: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
    #[serde(default, deserialize_with = "code_string")]
    response_code: Option<String>,
    response_description: Option<String>,
    customer_message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StkQueryRequest<'a> {
    business_short_code: &'a str,
    password: String,
    timestamp: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkQueryResponse {
    #[serde(default, deserialize_with = "code_string")]
    result_code: Option<String>,
    result_desc: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DarajaError {
    error_code: Option<String>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallbackEnvelope {
    body: CallbackBody,
}

#[derive(Debug, Deserialize)]
struct CallbackBody {
    #[serde(rename = "stkCallback")]
    stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkCallback {
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    #[serde(default, deserialize_with = "code_string")]
    result_code: Option<String>,
    result_desc: Option<String>,
    callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallbackMetadata {
    #[serde(default)]
    item: Vec<CallbackItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallbackItem {
    name: String,
    value: Option<serde_json::Value>,
}

impl CallbackMetadata {
    fn value(&self, name: &str) -> Option<&serde_json::Value> {
        self.item.iter().find(|i| i.name == name).and_then(|i| i.value.as_ref())
    }

    fn receipt(&self) -> Option<String> {
        self.value("MpesaReceiptNumber")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    fn amount(&self) -> Option<i64> {
        self.value("Amount").and_then(|v| {
            v.as_i64().or_else(|| v.as_f64().map(|f| f.round() as i64))
        })
    }
}

/// Parses a Daraja STK callback delivered to the signed URL of `payment_id`.
pub fn parse_stk_callback(body: &[u8], payment_id: Uuid) -> Result<WebhookEvent> {
    let envelope: CallbackEnvelope = serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(format!("Malformed M-Pesa callback: {}", e)))?;
    let callback = envelope.body.stk_callback;

    let lookup = PaymentLookup::IdWithRef {
        id: payment_id,
        external_ref: callback.checkout_request_id.clone(),
    };
    let description = callback.result_desc.unwrap_or_default();
    let Some(code) = callback.result_code.filter(|c| !c.trim().is_empty()) else {
        tracing::warn!(
            "M-Pesa callback for {} carried no ResultCode: {}",
            callback.checkout_request_id,
            description
        );
        return Ok(WebhookEvent::Ignored(format!(
            "{} has no result code",
            callback.checkout_request_id
        )));
    };

    Ok(match classify_result_code(&code) {
        GatewayOutcome::Succeeded => {
            let metadata = callback.callback_metadata.as_ref();
            WebhookEvent::Completed(Confirmation {
                lookup,
                receipt_code: metadata.and_then(CallbackMetadata::receipt),
                amount_confirmed: metadata.and_then(CallbackMetadata::amount),
                result_code: Some(code),
                result_description: Some(description),
                source: ConfirmationSource::Webhook,
            })
        }
        GatewayOutcome::Pending => WebhookEvent::Ignored(format!(
            "{} still pending: {}",
            callback.checkout_request_id, description
        )),
        GatewayOutcome::Failed => WebhookEvent::Failed {
            lookup,
            result_code: Some(code),
            reason: description,
        },
    })
}

/// Safaricom Daraja STK push adapter.
pub struct MpesaClient {
    client: reqwest::Client,
    config: MpesaConfig,
    api_base: String,
    tokens: TokenCache<MpesaCredentials>,
    signer: CallbackSigner,
}

impl MpesaClient {
    pub fn new(client: reqwest::Client, config: MpesaConfig) -> Self {
        let api_base = config.api_base();
        let tokens = TokenCache::new(MpesaCredentials {
            client: client.clone(),
            api_base: api_base.clone(),
            consumer_key: config.consumer_key.clone(),
            consumer_secret: config.consumer_secret.clone(),
        });
        let signer = CallbackSigner::new(&config.callback_secret);

        Self { client, config, api_base, tokens, signer }
    }

    /// `(password, timestamp)` for one request.
    fn password(&self) -> (String, String) {
        let timestamp = (Utc::now() + Duration::hours(EAT_OFFSET_HOURS))
            .format("%Y%m%d%H%M%S")
            .to_string();
        let password = STANDARD.encode(format!(
            "{}{}{}",
            self.config.shortcode, self.config.passkey, timestamp
        ));
        (password, timestamp)
    }
}

#[async_trait]
impl PaymentGateway for MpesaClient {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Mpesa
    }

    fn currency(&self) -> &str {
        &self.config.currency
    }

    async fn initiate(&self, request: &InitiateRequest) -> Result<GatewayInitiation> {
        let phone = request
            .payer_address
            .as_deref()
            .ok_or_else(|| AppError::Validation("Phone number is required for M-Pesa".to_string()))?;
        let phone = validation::validate_phone_number(phone)?;

        let token = self.tokens.token().await?;
        let (password, timestamp) = self.password();
        let payload = StkPushRequest {
            business_short_code: &self.config.shortcode,
            password,
            timestamp,
            transaction_type: "CustomerPayBillOnline",
            amount: request.amount,
            party_a: phone,
            party_b: &self.config.shortcode,
            phone_number: phone,
            callback_url: self.signer.callback_url(&self.config.callback_url, request.payment_id)?,
            account_reference: &self.config.account_reference,
            transaction_desc: &request.description,
        };

        tracing::info!(
            "Sending STK push for payment {} to {} ({} {})",
            request.payment_id,
            mask_phone(phone),
            request.amount,
            request.currency
        );

        let response = self
            .client
            .post(format!("{}/mpesa/stkpush/v1/processrequest", self.api_base))
            .bearer_auth(&token)
            .json(&payload)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
        }
        let ack: StkPushResponse = read_json(response, "M-Pesa").await?;

        if ack.response_code.as_deref() != Some("0") {
            return Err(AppError::GatewayRejected(
                ack.response_description
                    .unwrap_or_else(|| "STK push was not accepted".to_string()),
            ));
        }

        let checkout_request_id = ack.checkout_request_id.ok_or_else(|| {
            AppError::GatewayRejected("M-Pesa accepted the push without a CheckoutRequestID".to_string())
        })?;

        Ok(GatewayInitiation {
            external_ref: checkout_request_id,
            secondary_ref: ack.merchant_request_id,
            approval_url: None,
            customer_message: ack.customer_message,
        })
    }

    async fn query_status(&self, external_ref: &str) -> Result<GatewayStatus> {
        let token = self.tokens.token().await?;
        let (password, timestamp) = self.password();
        let payload = StkQueryRequest {
            business_short_code: &self.config.shortcode,
            password,
            timestamp,
            checkout_request_id: external_ref,
        };

        let response = self
            .client
            .post(format!("{}/mpesa/stkpushquery/v1/query", self.api_base))
            .bearer_auth(&token)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if let Ok(err) = serde_json::from_str::<DarajaError>(&body) {
                if err.error_code.as_deref() == Some(ERROR_STILL_PROCESSING) {
                    return Ok(GatewayStatus::pending(
                        err.error_message.unwrap_or_else(|| provider_message(&body)),
                    ));
                }
            }
            if status == reqwest::StatusCode::UNAUTHORIZED {
                self.tokens.invalidate().await;
            }
            return Err(status_error(status, "M-Pesa", &body));
        }

        let body: StkQueryResponse = response.json().await?;
        let code = body
            .result_code
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                AppError::GatewayRejected(format!(
                    "M-Pesa status for {} carried no ResultCode",
                    external_ref
                ))
            })?;
        Ok(GatewayStatus {
            outcome: classify_result_code(&code),
            result_code: Some(code),
            description: body.result_desc,
            // The query API does not return the receipt; the callback does.
            receipt: None,
            amount: None,
        })
    }

    async fn verify_webhook(&self, webhook: &InboundWebhook) -> Result<()> {
        let payment_id = webhook
            .query
            .get("ref")
            .and_then(|r| Uuid::parse_str(r).ok())
            .ok_or(AppError::Unauthorized)?;
        let signature = webhook.query.get("sig").ok_or(AppError::Unauthorized)?;

        if self.signer.verify(payment_id, signature) {
            Ok(())
        } else {
            tracing::warn!("Rejected M-Pesa callback with bad signature for {}", payment_id);
            Err(AppError::Unauthorized)
        }
    }

    fn interpret_webhook(&self, webhook: &InboundWebhook) -> Result<WebhookEvent> {
        let payment_id = webhook
            .query
            .get("ref")
            .and_then(|r| Uuid::parse_str(r).ok())
            .ok_or_else(|| AppError::BadRequest("Callback is missing its payment reference".to_string()))?;
        parse_stk_callback(&webhook.body, payment_id)
    }
}
