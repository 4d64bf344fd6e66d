//! The single place where a payment changes state.
//!
//! Every entry point opens one transaction, takes the write lock, re-reads
//! the payment and applies a version-guarded transition. A caller that
//! loses a race observes the winner's result instead of an error.

use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    domain::{
        CompletionOutcome, Confirmation, MembershipStatus, Payment, PaymentLookup, PaymentMethod,
        PaymentStatus, SubRecordStatus,
    },
    error::{AppError, Result},
    integrations::{IntegrationEvent, IntegrationManager},
    payments::GatewayInitiation,
    repository::{
        gateway_record_repository::SubRecordResult, SqliteGatewayRecordRepository,
        SqliteMembershipRepository, SqlitePaymentRepository, Transition,
    },
    service::membership_activator::{Activation, MembershipActivator},
};

/// A lost CAS with the payment still open means a concurrent non-terminal
/// write (a reference being attached); it is retried this many times.
const MAX_CAS_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub enum SettleOutcome {
    Applied(Payment),
    Unchanged(Payment),
}

impl SettleOutcome {
    pub fn payment(&self) -> &Payment {
        match self {
            SettleOutcome::Applied(p) | SettleOutcome::Unchanged(p) => p,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailureReport {
    pub lookup: PaymentLookup,
    pub result_code: Option<String>,
    pub reason: String,
}

pub struct Reconciler {
    pool: SqlitePool,
    activator: Arc<MembershipActivator>,
    integrations: Arc<IntegrationManager>,
}

impl Reconciler {
    pub fn new(
        pool: SqlitePool,
        activator: Arc<MembershipActivator>,
        integrations: Arc<IntegrationManager>,
    ) -> Self {
        Self { pool, activator, integrations }
    }

    async fn resolve(conn: &mut SqliteConnection, lookup: &PaymentLookup) -> Result<Payment> {
        let payment = match lookup {
            PaymentLookup::ExternalRef(external_ref) => {
                SqlitePaymentRepository::fetch_by_external_ref(conn, external_ref).await?
            }
            PaymentLookup::Id(id) | PaymentLookup::IdWithRef { id, .. } => {
                SqlitePaymentRepository::fetch(conn, *id).await?
            }
        };
        let payment = payment.ok_or_else(|| AppError::NotFound(format!("No payment for {:?}", lookup)))?;

        if let PaymentLookup::IdWithRef { external_ref, .. } = lookup {
            if let Some(existing) = payment.external_ref.as_deref() {
                if existing != external_ref {
                    tracing::warn!(
                        "Payment {} is bound to {} but a confirmation named {}",
                        payment.id,
                        existing,
                        external_ref
                    );
                    return Err(AppError::Conflict(
                        "Confirmation references a different gateway transaction".to_string(),
                    ));
                }
            }
        }
        Ok(payment)
    }

    async fn receipt_is_free(conn: &mut SqliteConnection, payment: &Payment, receipt: &str) -> Result<()> {
        if let Some(other) = SqlitePaymentRepository::receipt_owner(conn, receipt, payment.id).await? {
            tracing::warn!(
                "Receipt {} for payment {} is already bound to payment {}",
                receipt,
                payment.id,
                other
            );
            return Err(AppError::Conflict(format!("Receipt {} has already been used", receipt)));
        }
        Ok(())
    }

    /// The idempotent completion entry point shared by webhooks, polls,
    /// manual verification and wallet capture.
    pub async fn complete(&self, confirmation: Confirmation) -> Result<CompletionOutcome> {
        let receipt = confirmation.receipt_code.as_deref();
        let attached_ref = match &confirmation.lookup {
            PaymentLookup::IdWithRef { external_ref, .. } => Some(external_ref.as_str()),
            _ => None,
        };

        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut tx = self.pool.begin().await?;
            SqlitePaymentRepository::lock_for_write(&mut tx).await?;
            let payment = Self::resolve(&mut tx, &confirmation.lookup).await?;

            if payment.status.is_terminal() {
                let outcome = Self::absorb(&mut tx, payment, receipt).await?;
                tx.commit().await?;
                return Ok(outcome);
            }

            if let Some(receipt) = receipt {
                Self::receipt_is_free(&mut tx, &payment, receipt).await?;
            }
            if let Some(confirmed) = confirmation.amount_confirmed {
                if confirmed != payment.amount {
                    tracing::warn!(
                        "Payment {} expected {} but {} confirmed {}",
                        payment.id,
                        payment.amount,
                        confirmation.source,
                        confirmed
                    );
                    return Err(AppError::Conflict(format!(
                        "Confirmed amount {} does not match expected {}",
                        confirmed, payment.amount
                    )));
                }
            }

            let mut transition = Transition::new(&PaymentStatus::OPEN, PaymentStatus::Completed, payment.version);
            transition.external_ref = attached_ref;
            transition.receipt_code = receipt;
            if !SqlitePaymentRepository::transition(&mut tx, payment.id, &transition).await? {
                tx.rollback().await?;
                tracing::debug!("Lost completion race on payment {}, re-reading", payment.id);
                continue;
            }

            let completed = SqlitePaymentRepository::fetch(&mut tx, payment.id)
                .await?
                .ok_or_else(|| AppError::Database("Payment vanished mid-transaction".to_string()))?;
            SqliteGatewayRecordRepository::settle(
                &mut tx,
                &completed,
                SubRecordStatus::Completed,
                &SubRecordResult {
                    receipt_code: receipt,
                    result_code: confirmation.result_code.as_deref(),
                    result_description: confirmation.result_description.as_deref(),
                },
            )
            .await?;
            let activation = self.activator.activate(&mut tx, &completed).await?;
            // Activation may have linked a freshly created membership.
            let completed = SqlitePaymentRepository::fetch(&mut tx, completed.id)
                .await?
                .ok_or_else(|| AppError::Database("Payment vanished mid-transaction".to_string()))?;
            tx.commit().await?;

            tracing::info!(
                "Payment {} completed via {} (receipt {})",
                completed.id,
                confirmation.source,
                receipt.unwrap_or("-")
            );
            self.announce_completion(&completed, &activation);
            return Ok(CompletionOutcome::Completed(completed));
        }

        Err(AppError::Conflict("Payment is being updated concurrently, retry".to_string()))
    }

    /// Handles a confirmation for a payment that has already settled.
    async fn absorb(
        conn: &mut SqliteConnection,
        payment: Payment,
        receipt: Option<&str>,
    ) -> Result<CompletionOutcome> {
        if payment.status != PaymentStatus::Completed {
            tracing::warn!(
                "Discarding completion for payment {} in terminal state {}",
                payment.id,
                payment.status.as_str()
            );
            return Ok(CompletionOutcome::AlreadyTerminal(payment));
        }

        match (payment.receipt_code.as_deref(), receipt) {
            (Some(existing), Some(incoming)) if existing != incoming => {
                tracing::warn!(
                    "Payment {} completed with {} but another confirmation carries {}",
                    payment.id,
                    existing,
                    incoming
                );
                Err(AppError::Conflict(format!(
                    "Payment was completed with a different receipt than {}",
                    incoming
                )))
            }
            (None, Some(incoming)) => {
                Self::receipt_is_free(conn, &payment, incoming).await?;
                SqlitePaymentRepository::backfill_receipt(conn, payment.id, incoming).await?;
                SqliteGatewayRecordRepository::settle(
                    conn,
                    &payment,
                    SubRecordStatus::Completed,
                    &SubRecordResult { receipt_code: Some(incoming), ..Default::default() },
                )
                .await?;
                tracing::info!("Backfilled receipt {} on payment {}", incoming, payment.id);
                let payment = SqlitePaymentRepository::fetch(conn, payment.id)
                    .await?
                    .ok_or_else(|| AppError::Database("Payment vanished mid-transaction".to_string()))?;
                Ok(CompletionOutcome::AlreadyCompleted(payment))
            }
            _ => {
                tracing::debug!("Duplicate completion for payment {} ignored", payment.id);
                Ok(CompletionOutcome::AlreadyCompleted(payment))
            }
        }
    }

    fn announce_completion(&self, payment: &Payment, activation: &Activation) {
        let membership = activation.membership();
        self.integrations.dispatch(IntegrationEvent::PaymentCompleted {
            owner_id: membership.owner_id,
            payer_id: payment.payer_id,
            payment_id: payment.id,
            amount: payment.amount,
            currency: payment.currency.clone(),
            contact_email: payment.contact_email.clone(),
            membership_number: membership.membership_number.clone(),
        });
        if let Activation::Activated(membership) = activation {
            self.integrations
                .dispatch(IntegrationEvent::MembershipActivated(membership.clone()));
        }
    }

    /// Marks an open payment Failed. Settled payments are left alone.
    pub async fn fail(&self, report: FailureReport) -> Result<SettleOutcome> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut tx = self.pool.begin().await?;
            SqlitePaymentRepository::lock_for_write(&mut tx).await?;
            let payment = Self::resolve(&mut tx, &report.lookup).await?;

            if payment.status.is_terminal() {
                tracing::debug!(
                    "Ignoring failure report for payment {} already {}",
                    payment.id,
                    payment.status.as_str()
                );
                return Ok(SettleOutcome::Unchanged(payment));
            }

            let notes = format!("Failed: {}", report.reason);
            let mut transition = Transition::new(&PaymentStatus::OPEN, PaymentStatus::Failed, payment.version);
            transition.failure_reason = Some(&report.reason);
            transition.notes = Some(&notes);
            if let PaymentLookup::IdWithRef { external_ref, .. } = &report.lookup {
                transition.external_ref = Some(external_ref.as_str());
            }
            if !SqlitePaymentRepository::transition(&mut tx, payment.id, &transition).await? {
                tx.rollback().await?;
                continue;
            }

            let failed = SqlitePaymentRepository::fetch(&mut tx, payment.id)
                .await?
                .ok_or_else(|| AppError::Database("Payment vanished mid-transaction".to_string()))?;
            SqliteGatewayRecordRepository::settle(
                &mut tx,
                &failed,
                SubRecordStatus::Failed,
                &SubRecordResult {
                    receipt_code: None,
                    result_code: report.result_code.as_deref(),
                    result_description: Some(&report.reason),
                },
            )
            .await?;
            let owner_id = Self::owner_of(&mut tx, &failed).await?;
            tx.commit().await?;

            tracing::info!("Payment {} failed: {}", failed.id, report.reason);
            self.integrations.dispatch(IntegrationEvent::PaymentFailed {
                owner_id,
                payment_id: failed.id,
                reason: report.reason.clone(),
            });
            return Ok(SettleOutcome::Applied(failed));
        }

        Err(AppError::Conflict("Payment is being updated concurrently, retry".to_string()))
    }

    /// Cancels an open payment. Unlike completion, hitting a settled
    /// payment here is an error.
    pub async fn cancel(&self, payment_id: Uuid, reason: &str) -> Result<Payment> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut tx = self.pool.begin().await?;
            SqlitePaymentRepository::lock_for_write(&mut tx).await?;
            let payment = Self::resolve(&mut tx, &PaymentLookup::Id(payment_id)).await?;

            if payment.status.is_terminal() {
                return Err(AppError::AlreadyTerminal(format!(
                    "Payment {} is already {}",
                    payment.id,
                    payment.status.as_str()
                )));
            }

            let notes = format!("Cancelled: {}", reason);
            let mut transition = Transition::new(&PaymentStatus::OPEN, PaymentStatus::Cancelled, payment.version);
            transition.notes = Some(&notes);
            if !SqlitePaymentRepository::transition(&mut tx, payment.id, &transition).await? {
                tx.rollback().await?;
                continue;
            }

            let cancelled = SqlitePaymentRepository::fetch(&mut tx, payment.id)
                .await?
                .ok_or_else(|| AppError::Database("Payment vanished mid-transaction".to_string()))?;
            SqliteGatewayRecordRepository::settle(
                &mut tx,
                &cancelled,
                SubRecordStatus::Cancelled,
                &SubRecordResult { result_description: Some(reason), ..Default::default() },
            )
            .await?;
            if let Some(membership_id) = cancelled.membership_id {
                if let Some(membership) = SqliteMembershipRepository::fetch(&mut tx, membership_id).await? {
                    if membership.status == MembershipStatus::Pending {
                        SqliteMembershipRepository::set_status(&mut tx, membership_id, MembershipStatus::Cancelled).await?;
                    }
                }
            }
            tx.commit().await?;

            tracing::info!("Payment {} cancelled: {}", cancelled.id, reason);
            return Ok(cancelled);
        }

        Err(AppError::Conflict("Payment is being updated concurrently, retry".to_string()))
    }

    /// Binds the gateway's reference to the payment after a successful
    /// initiation. A result that already arrived through a callback wins;
    /// binding a second, different reference is refused.
    pub async fn gateway_accepted(&self, payment_id: Uuid, initiation: &GatewayInitiation) -> Result<Payment> {
        let mut tx = self.pool.begin().await?;
        SqlitePaymentRepository::lock_for_write(&mut tx).await?;
        let payment = Self::resolve(&mut tx, &PaymentLookup::Id(payment_id)).await?;

        match payment.external_ref.as_deref() {
            Some(existing) if existing != initiation.external_ref => {
                return Err(AppError::Conflict(format!(
                    "Payment {} is already bound to {}",
                    payment.id, existing
                )));
            }
            Some(_) => {}
            None if payment.status.is_terminal() => {
                tracing::warn!(
                    "Payment {} settled as {} before its gateway reference arrived",
                    payment.id,
                    payment.status.as_str()
                );
            }
            None => {
                let next = match payment.method {
                    PaymentMethod::Mpesa => PaymentStatus::Pending,
                    PaymentMethod::PayPal => PaymentStatus::Processing,
                };
                SqlitePaymentRepository::attach_external_ref(&mut tx, payment.id, &initiation.external_ref, next)
                    .await?;
            }
        }

        match payment.method {
            PaymentMethod::Mpesa => {
                SqliteGatewayRecordRepository::mark_mpesa_accepted(
                    &mut tx,
                    payment.id,
                    &initiation.external_ref,
                    initiation.secondary_ref.as_deref(),
                )
                .await?
            }
            PaymentMethod::PayPal => {
                SqliteGatewayRecordRepository::mark_wallet_created(
                    &mut tx,
                    payment.id,
                    &initiation.external_ref,
                    initiation.approval_url.as_deref(),
                )
                .await?
            }
        }

        let updated = SqlitePaymentRepository::fetch(&mut tx, payment.id)
            .await?
            .ok_or_else(|| AppError::Database("Payment vanished mid-transaction".to_string()))?;
        tx.commit().await?;

        tracing::info!("Payment {} bound to gateway reference {}", updated.id, initiation.external_ref);
        Ok(updated)
    }

    /// Reverses the bookkeeping of a completed payment. No money moves.
    pub async fn refund(&self, payment_id: Uuid, reason: &str) -> Result<Payment> {
        let mut tx = self.pool.begin().await?;
        SqlitePaymentRepository::lock_for_write(&mut tx).await?;
        let payment = Self::resolve(&mut tx, &PaymentLookup::Id(payment_id)).await?;

        if payment.status != PaymentStatus::Completed {
            return Err(AppError::AlreadyTerminal(format!(
                "Only completed payments can be refunded, payment {} is {}",
                payment.id,
                payment.status.as_str()
            )));
        }

        let notes = format!("Refunded: {}", reason);
        let mut transition = Transition::new(&[PaymentStatus::Completed], PaymentStatus::Refunded, payment.version);
        transition.notes = Some(&notes);
        if !SqlitePaymentRepository::transition(&mut tx, payment.id, &transition).await? {
            return Err(AppError::Conflict("Payment changed while refunding, retry".to_string()));
        }

        if let Some(membership_id) = payment.membership_id {
            self.activator
                .deactivate(&mut tx, membership_id, MembershipStatus::Cancelled)
                .await?;
        }
        let refunded = SqlitePaymentRepository::fetch(&mut tx, payment.id)
            .await?
            .ok_or_else(|| AppError::Database("Payment vanished mid-transaction".to_string()))?;
        tx.commit().await?;

        tracing::info!("Payment {} refunded: {}", refunded.id, reason);
        Ok(refunded)
    }

    async fn owner_of(conn: &mut SqliteConnection, payment: &Payment) -> Result<Uuid> {
        Ok(match payment.membership_id {
            Some(id) => SqliteMembershipRepository::fetch(conn, id)
                .await?
                .map(|m| m.owner_id)
                .unwrap_or(payment.payer_id),
            None => payment.payer_id,
        })
    }
}
