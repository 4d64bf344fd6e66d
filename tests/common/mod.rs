#![allow(dead_code)]

use async_trait::async_trait;
use quorum::{
    config::Settings,
    domain::{Payment, PaymentMethod},
    error::{AppError, Result},
    integrations::{Integration, IntegrationEvent, IntegrationManager},
    payments::{
        mpesa_client::parse_stk_callback, paypal_client::parse_notification, CallbackSigner,
        GatewayInitiation, GatewayOutcome, GatewayStatus, Gateways, InboundWebhook,
        InitiateRequest, PaymentGateway, WebhookEvent,
    },
    service::{payment_service::InitiatePayment, ServiceContext},
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use uuid::Uuid;

pub const CALLBACK_SECRET: &str = "test-callback-secret";
pub const PHONE: &str = "254712345678";

/// Scripted stand-in for a provider. Initiations and status answers are
/// served from queues; when a queue is empty the gateway accepts the
/// request and reports the payment as still pending.
pub struct FakeGateway {
    method: PaymentMethod,
    signer: CallbackSigner,
    initiations: Mutex<VecDeque<Result<GatewayInitiation>>>,
    statuses: Mutex<VecDeque<Result<GatewayStatus>>>,
    pub initiate_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
}

impl FakeGateway {
    pub fn new(method: PaymentMethod) -> Self {
        Self {
            method,
            signer: CallbackSigner::new(CALLBACK_SECRET),
            initiations: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(VecDeque::new()),
            initiate_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
        }
    }

    pub fn push_initiation(&self, result: Result<GatewayInitiation>) {
        self.initiations.lock().unwrap().push_back(result);
    }

    pub fn push_status(&self, result: Result<GatewayStatus>) {
        self.statuses.lock().unwrap().push_back(result);
    }

    fn next_status(&self) -> Result<GatewayStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(GatewayStatus::pending("still waiting")))
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn method(&self) -> PaymentMethod {
        self.method
    }

    fn currency(&self) -> &str {
        match self.method {
            PaymentMethod::Mpesa => "KES",
            PaymentMethod::PayPal => "USD",
        }
    }

    async fn initiate(&self, request: &InitiateRequest) -> Result<GatewayInitiation> {
        self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(scripted) = self.initiations.lock().unwrap().pop_front() {
            return scripted;
        }
        Ok(match self.method {
            PaymentMethod::Mpesa => GatewayInitiation {
                external_ref: format!("ws_CO_{}", request.payment_id.simple()),
                secondary_ref: Some(format!("MR-{}", request.payment_id.simple())),
                approval_url: None,
                customer_message: Some("Success. Request accepted for processing".to_string()),
            },
            PaymentMethod::PayPal => GatewayInitiation {
                external_ref: format!("ORDER-{}", request.payment_id.simple()),
                secondary_ref: None,
                approval_url: Some("https://www.sandbox.paypal.com/checkoutnow?token=X".to_string()),
                customer_message: None,
            },
        })
    }

    async fn query_status(&self, _external_ref: &str) -> Result<GatewayStatus> {
        self.next_status()
    }

    async fn capture(&self, _order_ref: &str) -> Result<GatewayStatus> {
        self.next_status()
    }

    async fn verify_webhook(&self, webhook: &InboundWebhook) -> Result<()> {
        match self.method {
            PaymentMethod::Mpesa => {
                let id = webhook
                    .query
                    .get("ref")
                    .and_then(|r| Uuid::parse_str(r).ok())
                    .ok_or(AppError::Unauthorized)?;
                let sig = webhook.query.get("sig").ok_or(AppError::Unauthorized)?;
                if self.signer.verify(id, sig) {
                    Ok(())
                } else {
                    Err(AppError::Unauthorized)
                }
            }
            PaymentMethod::PayPal => match webhook.headers.get("x-test-verified") {
                Some(v) if v == "1" => Ok(()),
                _ => Err(AppError::Unauthorized),
            },
        }
    }

    fn interpret_webhook(&self, webhook: &InboundWebhook) -> Result<WebhookEvent> {
        match self.method {
            PaymentMethod::Mpesa => {
                let id = webhook
                    .query
                    .get("ref")
                    .and_then(|r| Uuid::parse_str(r).ok())
                    .ok_or_else(|| AppError::BadRequest("missing ref".to_string()))?;
                parse_stk_callback(&webhook.body, id)
            }
            PaymentMethod::PayPal => parse_notification(&webhook.body),
        }
    }
}

/// Counts notifications per event kind.
#[derive(Default)]
pub struct RecordingIntegration {
    events: Mutex<Vec<IntegrationEvent>>,
}

impl RecordingIntegration {
    pub fn count(&self, kind: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind() == kind)
            .count()
    }

    pub fn events(&self) -> Vec<IntegrationEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Waits for spawned deliveries to land.
    pub async fn wait_for(&self, kind: &str, expected: usize) -> usize {
        for _ in 0..50 {
            if self.count(kind) >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.count(kind)
    }
}

#[async_trait]
impl Integration for RecordingIntegration {
    fn name(&self) -> &str {
        "recording"
    }

    fn is_enabled(&self) -> bool {
        true
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn handle_event(&self, event: &IntegrationEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

pub struct TestApp {
    pub pool: SqlitePool,
    pub settings: Settings,
    pub ctx: Arc<ServiceContext>,
    pub mpesa: Arc<FakeGateway>,
    pub paypal: Arc<FakeGateway>,
    pub recorder: Arc<RecordingIntegration>,
}

pub async fn test_pool() -> anyhow::Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// On-disk database shared by several pooled connections, so concurrent
/// writers really contend for the SQLite write lock.
pub async fn file_pool(dir: &tempfile::TempDir, connections: u32) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(dir.path().join("quorum.db"))
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(10));
    let pool = SqlitePoolOptions::new()
        .max_connections(connections)
        .connect_with(options)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

pub async fn setup() -> anyhow::Result<TestApp> {
    setup_with_pool(test_pool().await?).await
}

pub async fn setup_with_pool(pool: SqlitePool) -> anyhow::Result<TestApp> {
    let mut settings = Settings::default();
    settings.auth.jwt_secret = "test-jwt-secret".to_string();

    let mpesa = Arc::new(FakeGateway::new(PaymentMethod::Mpesa));
    let paypal = Arc::new(FakeGateway::new(PaymentMethod::PayPal));
    let mut gateways = Gateways::new();
    gateways.register(mpesa.clone());
    gateways.register(paypal.clone());

    let recorder = Arc::new(RecordingIntegration::default());
    let integrations = Arc::new(IntegrationManager::new());
    integrations.register(recorder.clone()).await;

    let ctx = Arc::new(ServiceContext::new(&settings, gateways, integrations, pool.clone()));

    Ok(TestApp {
        pool,
        settings,
        ctx,
        mpesa,
        paypal,
        recorder,
    })
}

impl TestApp {
    pub fn initiate_request(&self, payer_id: Uuid, method: PaymentMethod) -> InitiatePayment {
        InitiatePayment {
            payer_id,
            beneficiary_id: None,
            plan: "student".to_string(),
            method,
            amount: 500,
            phone_number: (method == PaymentMethod::Mpesa).then(|| PHONE.to_string()),
            description: "Regular Student membership".to_string(),
            contact_email: Some("payer@students.example.ac.ke".to_string()),
        }
    }

    pub async fn initiate_mpesa(&self, payer_id: Uuid) -> anyhow::Result<Payment> {
        let initiated = self
            .ctx
            .payment_service
            .initiate(self.initiate_request(payer_id, PaymentMethod::Mpesa))
            .await?;
        Ok(initiated.payment)
    }

    /// Signed callback as delivered to the URL issued for `payment`.
    pub fn mpesa_callback(&self, payment: &Payment, body: String) -> InboundWebhook {
        let signer = CallbackSigner::new(CALLBACK_SECRET);
        let mut query = HashMap::new();
        query.insert("ref".to_string(), payment.id.to_string());
        query.insert("sig".to_string(), signer.sign(payment.id).unwrap());
        InboundWebhook {
            headers: Default::default(),
            query,
            body: body.into_bytes(),
        }
    }
}

pub fn succeeded(receipt: &str, amount: i64) -> GatewayStatus {
    GatewayStatus {
        outcome: GatewayOutcome::Succeeded,
        result_code: Some("0".to_string()),
        description: Some("The service request is processed successfully.".to_string()),
        receipt: Some(receipt.to_string()),
        amount: Some(amount),
    }
}

pub fn failed(code: &str, description: &str) -> GatewayStatus {
    GatewayStatus {
        outcome: GatewayOutcome::Failed,
        result_code: Some(code.to_string()),
        description: Some(description.to_string()),
        receipt: None,
        amount: None,
    }
}

pub fn stk_success_body(checkout_id: &str, receipt: &str, amount: i64) -> String {
    format!(
        r#"{{
            "Body": {{
                "stkCallback": {{
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": "{}",
                    "ResultCode": 0,
                    "ResultDesc": "The service request is processed successfully.",
                    "CallbackMetadata": {{
                        "Item": [
                            {{ "Name": "Amount", "Value": {} }},
                            {{ "Name": "MpesaReceiptNumber", "Value": "{}" }},
                            {{ "Name": "TransactionDate", "Value": 20191219102115 }},
                            {{ "Name": "PhoneNumber", "Value": 254708374149 }}
                        ]
                    }}
                }}
            }}
        }}"#,
        checkout_id, amount, receipt
    )
}

pub fn stk_failure_body(checkout_id: &str, code: i64, description: &str) -> String {
    format!(
        r#"{{
            "Body": {{
                "stkCallback": {{
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": "{}",
                    "ResultCode": {},
                    "ResultDesc": "{}"
                }}
            }}
        }}"#,
        checkout_id, code, description
    )
}
