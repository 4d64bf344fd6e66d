use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub payer_id: Uuid,
    pub membership_id: Option<Uuid>,
    /// Integral count of the currency's smallest settled unit.
    pub amount: i64,
    pub currency: String,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    /// Gateway-issued correlation id. Set once, never replaced.
    pub external_ref: Option<String>,
    pub receipt_code: Option<String>,
    pub failure_reason: Option<String>,
    pub notes: String,
    /// Payer's address from the identity provider, for confirmations.
    pub contact_email: Option<String>,
    /// Bumped on every transition; the compare-and-swap guard.
    pub version: i64,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// ```text
/// Pending ──▶ Processing ──▶ Completed ──▶ Refunded
///    │            │
///    ├────────────┴──▶ Failed
///    └────────────┴──▶ Cancelled
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Refunded,
}

impl PaymentStatus {
    pub const OPEN: [PaymentStatus; 2] = [PaymentStatus::Pending, PaymentStatus::Processing];

    pub fn is_terminal(self) -> bool {
        !matches!(self, PaymentStatus::Pending | PaymentStatus::Processing)
    }

    /// Refund is the only edge out of a terminal state and is driven by an
    /// administrator, never by a gateway confirmation.
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Completed, Refunded)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "Pending",
            PaymentStatus::Processing => "Processing",
            PaymentStatus::Completed => "Completed",
            PaymentStatus::Failed => "Failed",
            PaymentStatus::Cancelled => "Cancelled",
            PaymentStatus::Refunded => "Refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(PaymentStatus::Pending),
            "Processing" => Some(PaymentStatus::Processing),
            "Completed" => Some(PaymentStatus::Completed),
            "Failed" => Some(PaymentStatus::Failed),
            "Cancelled" => Some(PaymentStatus::Cancelled),
            "Refunded" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    /// Push-payment: the provider prompts the payer's phone.
    Mpesa,
    /// Redirect-wallet: the payer approves at the provider, we capture.
    PayPal,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Mpesa => "Mpesa",
            PaymentMethod::PayPal => "PayPal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Mpesa" => Some(PaymentMethod::Mpesa),
            "PayPal" => Some(PaymentMethod::PayPal),
            _ => None,
        }
    }
}

/// Which channel delivered a confirmation. Only used for logging and notes;
/// every channel goes through the same completion path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationSource {
    Webhook,
    Poll,
    Manual,
    Capture,
}

impl std::fmt::Display for ConfirmationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConfirmationSource::Webhook => "webhook",
            ConfirmationSource::Poll => "poll",
            ConfirmationSource::Manual => "manual",
            ConfirmationSource::Capture => "capture",
        };
        f.write_str(s)
    }
}

/// How a confirmation finds its payment.
#[derive(Debug, Clone)]
pub enum PaymentLookup {
    ExternalRef(String),
    Id(Uuid),
    /// Signed callbacks carry both; the id wins and the ref must agree.
    IdWithRef { id: Uuid, external_ref: String },
}

#[derive(Debug, Clone)]
pub struct Confirmation {
    pub lookup: PaymentLookup,
    pub receipt_code: Option<String>,
    pub amount_confirmed: Option<i64>,
    pub result_code: Option<String>,
    pub result_description: Option<String>,
    pub source: ConfirmationSource,
}

/// Result of a completion attempt that did not error.
#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    /// This call performed the transition and ran activation.
    Completed(Payment),
    /// Another caller got there first with consistent inputs.
    AlreadyCompleted(Payment),
    /// The payment had already failed, been cancelled or refunded.
    AlreadyTerminal(Payment),
}

impl CompletionOutcome {
    pub fn payment(&self) -> &Payment {
        match self {
            CompletionOutcome::Completed(p)
            | CompletionOutcome::AlreadyCompleted(p)
            | CompletionOutcome::AlreadyTerminal(p) => p,
        }
    }

    pub fn applied(&self) -> bool {
        matches!(self, CompletionOutcome::Completed(_))
    }
}
