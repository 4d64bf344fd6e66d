use serde::Deserialize;
use config::{Config, ConfigError, Environment, File};

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub payments: PaymentsConfig,
    #[serde(default)]
    pub membership: MembershipConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub email: Option<EmailConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub base_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Bearer tokens are minted by the identity provider; we only verify them.
#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_issuer: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PaymentsConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Ceiling applied to every initiation, in the method's currency units.
    #[serde(default = "default_max_amount")]
    pub max_amount: i64,
    #[serde(default)]
    pub mpesa: Option<MpesaConfig>,
    #[serde(default)]
    pub paypal: Option<PayPalConfig>,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_amount: default_max_amount(),
            mpesa: None,
            paypal: None,
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_amount() -> i64 {
    150_000
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GatewayEnvironment {
    #[default]
    Sandbox,
    Production,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MpesaConfig {
    pub enabled: bool,
    #[serde(default)]
    pub environment: GatewayEnvironment,
    pub base_url: Option<String>,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub shortcode: String,
    pub passkey: String,
    pub callback_url: String,
    /// Key for the HMAC that signs each payment's callback URL.
    pub callback_secret: String,
    pub account_reference: String,
    #[serde(default = "default_mpesa_currency")]
    pub currency: String,
}

impl MpesaConfig {
    pub fn api_base(&self) -> String {
        match (&self.base_url, &self.environment) {
            (Some(url), _) => url.trim_end_matches('/').to_string(),
            (None, GatewayEnvironment::Sandbox) => "https://sandbox.safaricom.co.ke".to_string(),
            (None, GatewayEnvironment::Production) => "https://api.safaricom.co.ke".to_string(),
        }
    }
}

fn default_mpesa_currency() -> String {
    "KES".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PayPalConfig {
    pub enabled: bool,
    #[serde(default)]
    pub environment: GatewayEnvironment,
    pub base_url: Option<String>,
    pub client_id: String,
    pub client_secret: String,
    pub webhook_id: String,
    #[serde(default = "default_paypal_currency")]
    pub currency: String,
    pub return_url: String,
    pub cancel_url: String,
    pub brand_name: Option<String>,
}

impl PayPalConfig {
    pub fn api_base(&self) -> String {
        match (&self.base_url, &self.environment) {
            (Some(url), _) => url.trim_end_matches('/').to_string(),
            (None, GatewayEnvironment::Sandbox) => "https://api-m.sandbox.paypal.com".to_string(),
            (None, GatewayEnvironment::Production) => "https://api-m.paypal.com".to_string(),
        }
    }
}

fn default_paypal_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct MembershipConfig {
    #[serde(default = "default_duration_days")]
    pub duration_days: i64,
    #[serde(default = "default_number_prefix")]
    pub number_prefix: String,
    #[serde(default = "default_plans")]
    pub plans: Vec<PlanConfig>,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            duration_days: default_duration_days(),
            number_prefix: default_number_prefix(),
            plans: default_plans(),
        }
    }
}

impl MembershipConfig {
    pub fn plan(&self, slug: &str) -> Option<&PlanConfig> {
        self.plans.iter().find(|p| p.slug == slug)
    }
}

fn default_duration_days() -> i64 {
    365
}

fn default_number_prefix() -> String {
    "ESA".to_string()
}

/// Prices are per payment method since each provider settles in its own
/// currency; no conversion happens here.
#[derive(Debug, Deserialize, Clone)]
pub struct PlanConfig {
    pub slug: String,
    pub name: String,
    pub mpesa_price: i64,
    pub paypal_price: i64,
}

fn default_plans() -> Vec<PlanConfig> {
    vec![
        PlanConfig {
            slug: "first_year".to_string(),
            name: "First Year Student".to_string(),
            mpesa_price: 300,
            paypal_price: 300,
        },
        PlanConfig {
            slug: "student".to_string(),
            name: "Regular Student".to_string(),
            mpesa_price: 500,
            paypal_price: 500,
        },
        PlanConfig {
            slug: "graduate".to_string(),
            name: "Graduate/Professional".to_string(),
            mpesa_price: 1500,
            paypal_price: 1500,
        },
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReaperConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_reaper_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_pending_timeout")]
    pub pending_timeout_minutes: i64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_reaper_interval(),
            pending_timeout_minutes: default_pending_timeout(),
        }
    }
}

fn default_reaper_interval() -> u64 {
    300
}

fn default_pending_timeout() -> i64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmailConfig {
    pub enabled: bool,
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub from_address: String,
    /// Treasurer mailbox that receives payment outcome notices.
    pub notify_address: String,
}

fn default_smtp_port() -> u16 {
    587
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("database.max_connections", 10)?
            .set_default("payments.timeout_secs", 30)?
            .set_default("payments.max_amount", 150_000)?

            // Add config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))

            // Add environment variables (with QUORUM__ prefix, double underscore separates levels)
            .add_source(Environment::with_prefix("QUORUM").separator("__"))

            .build()?;

        config.try_deserialize()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                base_url: "http://localhost:8080".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite://quorum.db?mode=rwc".to_string(),
                max_connections: 10,
            },
            auth: AuthConfig {
                jwt_secret: "change-me-in-production".to_string(),
                jwt_issuer: None,
            },
            payments: PaymentsConfig::default(),
            membership: MembershipConfig::default(),
            reaper: ReaperConfig::default(),
            email: None,
        }
    }
}
