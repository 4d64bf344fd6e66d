use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    domain::{
        validation, CompletionOutcome, Confirmation, ConfirmationSource, CreateMembershipRequest,
        GatewaySubRecord, NewSubRecord, Payment, PaymentLookup, PaymentMethod,
    },
    error::{AppError, Result},
    payments::{GatewayOutcome, GatewayStatus, Gateways, InboundWebhook, InitiateRequest, WebhookEvent},
    repository::{
        GatewayRecordRepository, NewPayment, PaymentRepository, SqliteGatewayRecordRepository,
        SqliteMembershipRepository, SqlitePaymentRepository,
    },
    service::reconciliation::{FailureReport, Reconciler},
};

/// Input to [`PaymentService::initiate`]. The amount is resolved by the
/// caller; nothing is looked up implicitly.
#[derive(Debug, Clone)]
pub struct InitiatePayment {
    pub payer_id: Uuid,
    /// Member receiving the membership when it is a gift.
    pub beneficiary_id: Option<Uuid>,
    pub plan: String,
    pub method: PaymentMethod,
    pub amount: i64,
    pub phone_number: Option<String>,
    pub description: String,
    /// Where the payer's confirmation goes, when the identity provider
    /// supplied one.
    pub contact_email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitiatedPayment {
    pub payment: Payment,
    pub approval_url: Option<String>,
    pub customer_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentDetails {
    pub payment: Payment,
    pub gateway_record: Option<GatewaySubRecord>,
}

pub struct PaymentService {
    pool: SqlitePool,
    payment_repo: Arc<dyn PaymentRepository>,
    record_repo: Arc<dyn GatewayRecordRepository>,
    gateways: Gateways,
    reconciler: Arc<Reconciler>,
    max_amount: i64,
}

impl PaymentService {
    pub fn new(
        pool: SqlitePool,
        payment_repo: Arc<dyn PaymentRepository>,
        record_repo: Arc<dyn GatewayRecordRepository>,
        gateways: Gateways,
        reconciler: Arc<Reconciler>,
        max_amount: i64,
    ) -> Self {
        Self {
            pool,
            payment_repo,
            record_repo,
            gateways,
            reconciler,
            max_amount,
        }
    }

    pub fn gateways(&self) -> &Gateways {
        &self.gateways
    }

    /// Creates the payment, its sub-record and the pending membership in one
    /// transaction, then asks the gateway to start collecting.
    pub async fn initiate(&self, request: InitiatePayment) -> Result<InitiatedPayment> {
        let amount = validation::validate_amount(request.amount, self.max_amount)?;
        let description = validation::validate_reference(&request.description)?.to_string();
        let sub_record = match request.method {
            PaymentMethod::Mpesa => {
                let phone = request.phone_number.as_deref().ok_or_else(|| {
                    AppError::Validation("Phone number is required for M-Pesa".to_string())
                })?;
                NewSubRecord::Mpesa {
                    phone_number: validation::validate_phone_number(phone)?.to_string(),
                }
            }
            PaymentMethod::PayPal => NewSubRecord::Wallet,
        };
        let gateway = self.gateways.get(request.method)?;

        let owner_id = request.beneficiary_id.unwrap_or(request.payer_id);
        let gifted_by = (owner_id != request.payer_id).then_some(request.payer_id);

        let mut tx = self.pool.begin().await?;
        let membership = SqliteMembershipRepository::insert(
            &mut tx,
            CreateMembershipRequest {
                owner_id,
                plan: request.plan.clone(),
                gifted_by,
            },
        )
        .await?;
        let payment = SqlitePaymentRepository::insert(
            &mut tx,
            NewPayment {
                payer_id: request.payer_id,
                membership_id: Some(membership.id),
                amount,
                currency: gateway.currency().to_string(),
                method: request.method,
                notes: format!("Membership payment for {} plan", request.plan),
                contact_email: request.contact_email.clone(),
            },
        )
        .await?;
        SqliteGatewayRecordRepository::insert(&mut tx, &payment, &sub_record).await?;
        tx.commit().await?;

        tracing::info!(
            "Created {} payment {} of {} {} for membership {}",
            payment.method.as_str(),
            payment.id,
            payment.amount,
            payment.currency,
            membership.id
        );

        let gateway_request = InitiateRequest {
            payment_id: payment.id,
            amount: payment.amount,
            currency: payment.currency.clone(),
            payer_address: match &sub_record {
                NewSubRecord::Mpesa { phone_number } => Some(phone_number.clone()),
                NewSubRecord::Wallet => None,
            },
            reference: format!("membership-{}", membership.id),
            description,
        };

        let initiation = match gateway.initiate(&gateway_request).await {
            Ok(initiation) => initiation,
            Err(e) if e.is_retryable() => {
                tracing::warn!("Initiation of payment {} not confirmed: {}", payment.id, e);
                return Err(e);
            }
            Err(e) => {
                tracing::warn!("Gateway refused payment {}: {}", payment.id, e);
                self.reconciler
                    .fail(FailureReport {
                        lookup: PaymentLookup::Id(payment.id),
                        result_code: None,
                        reason: e.to_string(),
                    })
                    .await?;
                return Err(e);
            }
        };

        let payment = self.reconciler.gateway_accepted(payment.id, &initiation).await?;
        Ok(InitiatedPayment {
            payment,
            approval_url: initiation.approval_url,
            customer_message: initiation.customer_message,
        })
    }

    pub async fn list_for_payer(&self, payer_id: Uuid) -> Result<Vec<Payment>> {
        self.payment_repo.find_by_payer(payer_id).await
    }

    pub async fn find(&self, payment_id: Uuid) -> Result<Payment> {
        self.payment_repo
            .find_by_id(payment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Payment {} not found", payment_id)))
    }

    /// Payment as seen by the member who paid for it.
    pub async fn find_owned(&self, payment_id: Uuid, payer_id: Uuid) -> Result<Payment> {
        let payment = self.find(payment_id).await?;
        if payment.payer_id != payer_id {
            // Other payers' payments read as missing.
            return Err(AppError::NotFound(format!("Payment {} not found", payment_id)));
        }
        Ok(payment)
    }

    pub async fn details(&self, payment_id: Uuid, payer_id: Uuid) -> Result<PaymentDetails> {
        let payment = self.find_owned(payment_id, payer_id).await?;
        let gateway_record = self.record_repo.find_for_payment(&payment).await?;
        Ok(PaymentDetails { payment, gateway_record })
    }

    pub async fn poll(&self, payment_id: Uuid, payer_id: Uuid) -> Result<Payment> {
        let payment = self.find_owned(payment_id, payer_id).await?;
        self.poll_payment(payment).await
    }

    /// Asks the gateway for the payment's outcome and applies it. Transport
    /// failures propagate untouched and never mark the payment failed.
    pub async fn poll_payment(&self, payment: Payment) -> Result<Payment> {
        if payment.status.is_terminal() {
            return Ok(payment);
        }
        let Some(external_ref) = payment.external_ref.clone() else {
            tracing::debug!("Payment {} has no gateway reference yet", payment.id);
            return Ok(payment);
        };

        let gateway = self.gateways.get(payment.method)?;
        let status = gateway.query_status(&external_ref).await?;
        self.apply_status(&payment, PaymentLookup::ExternalRef(external_ref), status, ConfirmationSource::Poll)
            .await
    }

    /// Completes the wallet order the payer just approved.
    pub async fn capture(&self, payment_id: Uuid, payer_id: Uuid) -> Result<Payment> {
        let payment = self.find_owned(payment_id, payer_id).await?;
        if payment.status.is_terminal() {
            return Ok(payment);
        }
        let external_ref = payment.external_ref.clone().ok_or_else(|| {
            AppError::BadRequest("Payment has no order to capture yet".to_string())
        })?;

        let gateway = self.gateways.get(payment.method)?;
        let status = gateway.capture(&external_ref).await?;
        let lookup = PaymentLookup::IdWithRef { id: payment.id, external_ref };
        self.apply_status(&payment, lookup, status, ConfirmationSource::Capture).await
    }

    async fn apply_status(
        &self,
        payment: &Payment,
        lookup: PaymentLookup,
        status: GatewayStatus,
        source: ConfirmationSource,
    ) -> Result<Payment> {
        match status.outcome {
            GatewayOutcome::Succeeded => {
                let outcome = self
                    .reconciler
                    .complete(Confirmation {
                        lookup,
                        receipt_code: status.receipt,
                        amount_confirmed: status.amount,
                        result_code: status.result_code,
                        result_description: status.description,
                        source,
                    })
                    .await?;
                Ok(outcome.payment().clone())
            }
            GatewayOutcome::Failed => {
                let outcome = self
                    .reconciler
                    .fail(FailureReport {
                        lookup,
                        result_code: status.result_code,
                        reason: status
                            .description
                            .unwrap_or_else(|| "Declined by payment provider".to_string()),
                    })
                    .await?;
                Ok(outcome.payment().clone())
            }
            GatewayOutcome::Pending => {
                tracing::debug!(
                    "Payment {} still pending at gateway: {}",
                    payment.id,
                    status.description.as_deref().unwrap_or("-")
                );
                Ok(payment.clone())
            }
        }
    }

    /// Completes the payer's own pending push payment from a receipt code
    /// they typed in.
    pub async fn verify_manual(
        &self,
        payment_id: Uuid,
        payer_id: Uuid,
        receipt_code: &str,
    ) -> Result<CompletionOutcome> {
        let receipt = validation::normalize_receipt_code(receipt_code)?;
        let payment = self.find_owned(payment_id, payer_id).await?;
        if payment.method != PaymentMethod::Mpesa {
            return Err(AppError::BadRequest(
                "Only M-Pesa payments can be verified with a receipt code".to_string(),
            ));
        }

        tracing::info!("Manual verification of payment {} with receipt {}", payment.id, receipt);
        self.reconciler
            .complete(Confirmation {
                lookup: PaymentLookup::Id(payment.id),
                receipt_code: Some(receipt),
                amount_confirmed: None,
                result_code: None,
                result_description: Some("Manually verified receipt".to_string()),
                source: ConfirmationSource::Manual,
            })
            .await
    }

    pub async fn cancel(&self, payment_id: Uuid, payer_id: Uuid) -> Result<Payment> {
        self.find_owned(payment_id, payer_id).await?;
        self.reconciler.cancel(payment_id, "cancelled by payer").await
    }

    pub async fn refund(&self, payment_id: Uuid, reason: &str) -> Result<Payment> {
        self.reconciler.refund(payment_id, reason).await
    }

    /// Authenticates and applies one provider callback.
    pub async fn handle_webhook(&self, method: PaymentMethod, webhook: InboundWebhook) -> Result<()> {
        let gateway = self.gateways.get(method)?;
        gateway.verify_webhook(&webhook).await?;

        match gateway.interpret_webhook(&webhook)? {
            WebhookEvent::Completed(confirmation) => {
                let outcome = self.reconciler.complete(confirmation).await?;
                if !outcome.applied() {
                    tracing::debug!(
                        "{} webhook for payment {} changed nothing",
                        method.as_str(),
                        outcome.payment().id
                    );
                }
            }
            WebhookEvent::Failed { lookup, result_code, reason } => {
                self.reconciler
                    .fail(FailureReport { lookup, result_code, reason })
                    .await?;
            }
            WebhookEvent::Ignored(note) => {
                tracing::debug!("Ignoring {} webhook: {}", method.as_str(), note);
            }
        }
        Ok(())
    }
}
