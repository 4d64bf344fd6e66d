use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;
use crate::domain::*;
use crate::error::{AppError, Result};

pub mod payment_repository;
pub mod gateway_record_repository;
pub mod membership_repository;
pub mod profile_repository;

pub use payment_repository::{SqlitePaymentRepository, NewPayment, Transition};
pub use gateway_record_repository::SqliteGatewayRecordRepository;
pub use membership_repository::SqliteMembershipRepository;
pub use profile_repository::SqliteProfileRepository;

/// Read side of the payment store. Writes go through the transaction-scoped
/// helpers on [`SqlitePaymentRepository`] so they can share a unit of work.
#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>>;
    async fn find_by_external_ref(&self, external_ref: &str) -> Result<Option<Payment>>;
    async fn find_by_receipt(&self, receipt_code: &str) -> Result<Option<Payment>>;
    async fn find_by_payer(&self, payer_id: Uuid) -> Result<Vec<Payment>>;
    async fn list_open_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Payment>>;
}

#[async_trait]
pub trait GatewayRecordRepository: Send + Sync {
    async fn find_for_payment(&self, payment: &Payment) -> Result<Option<GatewaySubRecord>>;
    async fn find_mpesa_by_checkout_id(&self, checkout_request_id: &str) -> Result<Option<MpesaTransaction>>;
}

#[async_trait]
pub trait MembershipRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Membership>>;
    async fn list_by_owner(&self, owner_id: Uuid) -> Result<Vec<Membership>>;
    async fn list_referrals_by_payer(&self, payer_id: Uuid) -> Result<Vec<Referral>>;
}

#[async_trait]
pub trait ProfileRepository: Send + Sync {
    async fn find(&self, owner_id: Uuid) -> Result<Option<ProfileCache>>;
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| AppError::Database(e.to_string()))
}

pub(crate) fn parse_opt_uuid(s: Option<String>) -> Result<Option<Uuid>> {
    s.as_deref().map(parse_uuid).transpose()
}

pub(crate) fn to_utc(dt: NaiveDateTime) -> DateTime<Utc> {
    DateTime::from_naive_utc_and_offset(dt, Utc)
}
