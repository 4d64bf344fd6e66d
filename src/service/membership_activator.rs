use chrono::{Datelike, Duration, Utc};
use rand::{distributions::Alphanumeric, Rng};
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::{
    config::MembershipConfig,
    domain::{
        CreateMembershipRequest, Membership, MembershipStatus, Payment, ProfileMembershipStatus,
        ProfileProjection,
    },
    error::{AppError, Result},
    repository::{SqliteMembershipRepository, SqlitePaymentRepository, SqliteProfileRepository},
};

const MAX_NUMBER_ATTEMPTS: usize = 10;
const NUMBER_SUFFIX_LEN: usize = 6;
/// Plan recorded on memberships created after the fact for a payment
/// that had none.
const FALLBACK_PLAN: &str = "student";

#[derive(Debug, Clone)]
pub enum Activation {
    Activated(Membership),
    AlreadyActive(Membership),
}

impl Activation {
    pub fn membership(&self) -> &Membership {
        match self {
            Activation::Activated(m) | Activation::AlreadyActive(m) => m,
        }
    }
}

/// Turns a completed payment into an active membership. Every method runs
/// on the caller's connection so it shares the caller's transaction.
pub struct MembershipActivator {
    duration_days: i64,
    number_prefix: String,
}

impl MembershipActivator {
    pub fn new(config: &MembershipConfig) -> Self {
        Self {
            duration_days: config.duration_days,
            number_prefix: config.number_prefix.clone(),
        }
    }

    pub async fn activate(&self, conn: &mut SqliteConnection, payment: &Payment) -> Result<Activation> {
        let membership = match payment.membership_id {
            Some(id) => SqliteMembershipRepository::fetch(conn, id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Membership {} not found", id)))?,
            None => {
                let created = SqliteMembershipRepository::insert(
                    conn,
                    CreateMembershipRequest {
                        owner_id: payment.payer_id,
                        plan: FALLBACK_PLAN.to_string(),
                        gifted_by: None,
                    },
                )
                .await?;
                SqlitePaymentRepository::link_membership(conn, payment.id, created.id).await?;
                tracing::info!("Created membership {} for unlinked payment {}", created.id, payment.id);
                created
            }
        };

        if membership.status == MembershipStatus::Active
            && membership.source_payment_id == Some(payment.id)
        {
            tracing::debug!("Membership {} already active from payment {}", membership.id, payment.id);
            return Ok(Activation::AlreadyActive(membership));
        }

        let now = Utc::now();
        let end = now + Duration::days(self.duration_days);
        let number = match membership.membership_number.clone() {
            Some(number) => number,
            None => match SqliteMembershipRepository::latest_number_for_owner(conn, membership.owner_id).await? {
                Some(number) => number,
                None => self.generate_number(conn).await?,
            },
        };

        // The previous term must go first so the number is free to reuse.
        let superseded = SqliteMembershipRepository::supersede_active(conn, membership.owner_id, membership.id).await?;
        if superseded > 0 {
            tracing::info!("Superseded {} active membership(s) of {}", superseded, membership.owner_id);
        }

        SqliteMembershipRepository::activate(conn, membership.id, now, end, &number, payment.id).await?;

        if payment.payer_id != membership.owner_id {
            let recorded = SqliteMembershipRepository::record_referral(
                conn,
                payment.payer_id,
                membership.id,
                payment.id,
            )
            .await?;
            if recorded {
                tracing::info!("Recorded referral of {} by {}", membership.id, payment.payer_id);
            }
        }

        let activated = SqliteMembershipRepository::fetch(conn, membership.id)
            .await?
            .ok_or_else(|| AppError::Database("Failed to retrieve activated membership".to_string()))?;
        SqliteProfileRepository::write_projection(conn, activated.owner_id, &ProfileProjection::of(&activated, now)).await?;

        tracing::info!(
            "Activated membership {} ({}) for {} until {}",
            activated.id,
            number,
            activated.owner_id,
            end
        );
        Ok(Activation::Activated(activated))
    }

    /// Moves a membership out of Active and rewrites the owner's cache.
    pub async fn deactivate(
        &self,
        conn: &mut SqliteConnection,
        membership_id: Uuid,
        status: MembershipStatus,
    ) -> Result<Membership> {
        SqliteMembershipRepository::set_status(conn, membership_id, status).await?;
        let membership = SqliteMembershipRepository::fetch(conn, membership_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Membership {} not found", membership_id)))?;
        self.refresh_profile(conn, membership.owner_id).await?;
        Ok(membership)
    }

    /// Recomputes the cached profile fields from the owner's memberships.
    pub async fn refresh_profile(&self, conn: &mut SqliteConnection, owner_id: Uuid) -> Result<()> {
        let now = Utc::now();
        let projection = match SqliteMembershipRepository::latest_activated_for_owner(conn, owner_id).await? {
            Some(latest) => ProfileProjection::of(&latest, now),
            None => ProfileProjection {
                status: ProfileMembershipStatus::Inactive,
                expiry: None,
                number: None,
            },
        };
        SqliteProfileRepository::write_projection(conn, owner_id, &projection).await
    }

    async fn generate_number(&self, conn: &mut SqliteConnection) -> Result<String> {
        let year = Utc::now().year();
        for _ in 0..MAX_NUMBER_ATTEMPTS {
            let candidate = candidate_number(&self.number_prefix, year);
            if !SqliteMembershipRepository::number_exists(conn, &candidate).await? {
                return Ok(candidate);
            }
            tracing::debug!("Membership number {} taken, regenerating", candidate);
        }
        Err(AppError::Internal(format!(
            "Could not allocate a membership number after {} attempts",
            MAX_NUMBER_ATTEMPTS
        )))
    }
}

fn candidate_number(prefix: &str, year: i32) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NUMBER_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_uppercase())
        .collect();
    format!("{}-{}-{}", prefix, year, suffix)
}
