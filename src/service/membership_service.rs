use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    domain::{Membership, MembershipStatus, ProfileCache, Referral},
    error::{AppError, Result},
    repository::{
        MembershipRepository, ProfileRepository, SqliteMembershipRepository, SqlitePaymentRepository,
    },
    service::membership_activator::MembershipActivator,
};

#[derive(Debug, Clone, Serialize)]
pub struct MembershipOverview {
    pub current: Option<Membership>,
    pub history: Vec<Membership>,
    pub profile: Option<ProfileCache>,
    pub referrals: Vec<Referral>,
}

pub struct MembershipService {
    pool: SqlitePool,
    membership_repo: Arc<dyn MembershipRepository>,
    profile_repo: Arc<dyn ProfileRepository>,
    activator: Arc<MembershipActivator>,
}

impl MembershipService {
    pub fn new(
        pool: SqlitePool,
        membership_repo: Arc<dyn MembershipRepository>,
        profile_repo: Arc<dyn ProfileRepository>,
        activator: Arc<MembershipActivator>,
    ) -> Self {
        Self {
            pool,
            membership_repo,
            profile_repo,
            activator,
        }
    }

    /// Reads an owner's memberships, expiring any whose term has ended.
    pub async fn overview(&self, owner_id: Uuid) -> Result<MembershipOverview> {
        let now = Utc::now();
        let mut history = self.membership_repo.list_by_owner(owner_id).await?;

        let lapsed: Vec<Uuid> = history
            .iter()
            .filter(|m| m.status == MembershipStatus::Active && !m.is_active_at(now))
            .map(|m| m.id)
            .collect();
        if !lapsed.is_empty() {
            self.expire(owner_id, &lapsed).await?;
            history = self.membership_repo.list_by_owner(owner_id).await?;
        }

        let current = history
            .iter()
            .find(|m| m.is_active_at(now))
            .cloned();

        Ok(MembershipOverview {
            current,
            history,
            profile: self.profile_repo.find(owner_id).await?,
            referrals: self.membership_repo.list_referrals_by_payer(owner_id).await?,
        })
    }

    async fn expire(&self, owner_id: Uuid, membership_ids: &[Uuid]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        SqlitePaymentRepository::lock_for_write(&mut tx).await?;
        for id in membership_ids {
            let expired = SqliteMembershipRepository::transition_status(
                &mut tx,
                *id,
                MembershipStatus::Active,
                MembershipStatus::Expired,
            )
            .await?;
            if expired {
                tracing::info!("Membership {} expired", id);
            }
        }
        self.activator.refresh_profile(&mut tx, owner_id).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn find(&self, membership_id: Uuid) -> Result<Membership> {
        self.membership_repo
            .find_by_id(membership_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Membership {} not found", membership_id)))
    }

    /// Administrative cancellation of an active membership. The status check
    /// and the write share one locked transaction.
    pub async fn cancel(&self, membership_id: Uuid) -> Result<Membership> {
        let mut tx = self.pool.begin().await?;
        SqlitePaymentRepository::lock_for_write(&mut tx).await?;

        let membership = SqliteMembershipRepository::fetch(&mut tx, membership_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Membership {} not found", membership_id)))?;
        let cancelled = SqliteMembershipRepository::transition_status(
            &mut tx,
            membership_id,
            MembershipStatus::Active,
            MembershipStatus::Cancelled,
        )
        .await?;
        if !cancelled {
            return Err(AppError::BadRequest(format!(
                "Membership {} is {}, not active",
                membership.id,
                membership.status.as_str()
            )));
        }

        self.activator.refresh_profile(&mut tx, membership.owner_id).await?;
        let cancelled = SqliteMembershipRepository::fetch(&mut tx, membership_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Membership {} not found", membership_id)))?;
        tx.commit().await?;

        tracing::info!("Membership {} cancelled by an administrator", membership_id);
        Ok(cancelled)
    }
}
