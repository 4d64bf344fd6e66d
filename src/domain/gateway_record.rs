use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Push-payment leg of a payment. May run ahead of the payment itself: the
/// provider acknowledges the prompt long before the payer enters a PIN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpesaTransaction {
    pub payment_id: Uuid,
    pub phone_number: String,
    pub amount: i64,
    pub checkout_request_id: Option<String>,
    pub merchant_request_id: Option<String>,
    pub receipt_code: Option<String>,
    pub result_code: Option<String>,
    pub result_description: Option<String>,
    pub status: SubRecordStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Redirect-wallet leg of a payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletOrder {
    pub payment_id: Uuid,
    pub order_id: Option<String>,
    pub approval_url: Option<String>,
    pub capture_id: Option<String>,
    pub capture_status: SubRecordStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewaySubRecord {
    Mpesa(MpesaTransaction),
    Wallet(WalletOrder),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SubRecordStatus {
    Pending,
    /// Provider acknowledged the request.
    Accepted,
    Completed,
    Failed,
    Cancelled,
}

impl SubRecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubRecordStatus::Pending => "Pending",
            SubRecordStatus::Accepted => "Accepted",
            SubRecordStatus::Completed => "Completed",
            SubRecordStatus::Failed => "Failed",
            SubRecordStatus::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(SubRecordStatus::Pending),
            "Accepted" => Some(SubRecordStatus::Accepted),
            "Completed" => Some(SubRecordStatus::Completed),
            "Failed" => Some(SubRecordStatus::Failed),
            "Cancelled" => Some(SubRecordStatus::Cancelled),
            _ => None,
        }
    }
}

/// Gateway-specific data captured at initiation, written in lock-step with
/// the payment row.
#[derive(Debug, Clone)]
pub enum NewSubRecord {
    Mpesa { phone_number: String },
    Wallet,
}
