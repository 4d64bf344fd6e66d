use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub plan: String,
    pub status: MembershipStatus,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub membership_number: Option<String>,
    /// Set when someone other than the owner paid.
    pub gifted_by: Option<Uuid>,
    /// The payment whose completion activated this membership.
    pub source_payment_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Membership {
    /// Expiry is evaluated at read time rather than by a background job.
    pub fn effective_status(&self, now: DateTime<Utc>) -> MembershipStatus {
        match (self.status, self.end_at) {
            (MembershipStatus::Active, Some(end)) if end <= now => MembershipStatus::Expired,
            (status, _) => status,
        }
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == MembershipStatus::Active
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MembershipStatus {
    Pending,
    Active,
    Cancelled,
    Expired,
}

impl MembershipStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MembershipStatus::Pending => "Pending",
            MembershipStatus::Active => "Active",
            MembershipStatus::Cancelled => "Cancelled",
            MembershipStatus::Expired => "Expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(MembershipStatus::Pending),
            "Active" => Some(MembershipStatus::Active),
            "Cancelled" => Some(MembershipStatus::Cancelled),
            "Expired" => Some(MembershipStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateMembershipRequest {
    pub owner_id: Uuid,
    pub plan: String,
    pub gifted_by: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Referral {
    pub id: Uuid,
    pub payer_id: Uuid,
    pub membership_id: Uuid,
    pub payment_id: Uuid,
    pub created_at: DateTime<Utc>,
}
