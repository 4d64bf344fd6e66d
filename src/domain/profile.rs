use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Membership, MembershipStatus};

/// Denormalized copy of an owner's current membership for fast reads.
/// Overwritten whenever the membership it mirrors changes state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileCache {
    pub owner_id: Uuid,
    pub membership_status: ProfileMembershipStatus,
    pub membership_expiry: Option<DateTime<Utc>>,
    pub membership_number: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProfileMembershipStatus {
    Inactive,
    Active,
    Expired,
    Cancelled,
}

impl ProfileMembershipStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProfileMembershipStatus::Inactive => "Inactive",
            ProfileMembershipStatus::Active => "Active",
            ProfileMembershipStatus::Expired => "Expired",
            ProfileMembershipStatus::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Inactive" => Some(ProfileMembershipStatus::Inactive),
            "Active" => Some(ProfileMembershipStatus::Active),
            "Expired" => Some(ProfileMembershipStatus::Expired),
            "Cancelled" => Some(ProfileMembershipStatus::Cancelled),
            _ => None,
        }
    }
}

impl From<MembershipStatus> for ProfileMembershipStatus {
    fn from(status: MembershipStatus) -> Self {
        match status {
            MembershipStatus::Pending => ProfileMembershipStatus::Inactive,
            MembershipStatus::Active => ProfileMembershipStatus::Active,
            MembershipStatus::Expired => ProfileMembershipStatus::Expired,
            MembershipStatus::Cancelled => ProfileMembershipStatus::Cancelled,
        }
    }
}

/// The cache fields a membership projects onto its owner's profile.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileProjection {
    pub status: ProfileMembershipStatus,
    pub expiry: Option<DateTime<Utc>>,
    pub number: Option<String>,
}

impl ProfileProjection {
    pub fn of(membership: &Membership, now: DateTime<Utc>) -> Self {
        Self {
            status: membership.effective_status(now).into(),
            expiry: membership.end_at,
            number: membership.membership_number.clone(),
        }
    }
}
