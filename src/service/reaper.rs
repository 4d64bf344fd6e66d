use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::{
    error::{AppError, Result},
    repository::PaymentRepository,
    service::{payment_service::PaymentService, reconciliation::Reconciler},
};

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct ReaperReport {
    pub examined: usize,
    pub resolved: usize,
    pub cancelled: usize,
    pub skipped: usize,
}

/// Sweeps payments that have sat open longer than the idle timeout.
pub struct PaymentReaper {
    payment_repo: Arc<dyn PaymentRepository>,
    payment_service: Arc<PaymentService>,
    reconciler: Arc<Reconciler>,
    timeout: Duration,
}

impl PaymentReaper {
    pub fn new(
        payment_repo: Arc<dyn PaymentRepository>,
        payment_service: Arc<PaymentService>,
        reconciler: Arc<Reconciler>,
        timeout_minutes: i64,
    ) -> Self {
        Self {
            payment_repo,
            payment_service,
            reconciler,
            timeout: Duration::minutes(timeout_minutes),
        }
    }

    pub async fn run_once(&self) -> Result<ReaperReport> {
        let cutoff = Utc::now() - self.timeout;
        let stale = self.payment_repo.list_open_created_before(cutoff).await?;
        let mut report = ReaperReport {
            examined: stale.len(),
            ..Default::default()
        };

        for payment in stale {
            let id = payment.id;
            let current = if payment.external_ref.is_some() {
                match self.payment_service.poll_payment(payment).await {
                    Ok(current) => current,
                    Err(e) => {
                        // Unknown outcome; cancelling could orphan a real payment.
                        tracing::warn!("Reaper could not poll payment {}: {}", id, e);
                        report.skipped += 1;
                        continue;
                    }
                }
            } else {
                payment
            };

            if current.status.is_terminal() {
                report.resolved += 1;
                continue;
            }

            match self.reconciler.cancel(id, "idle timeout").await {
                Ok(_) => report.cancelled += 1,
                Err(AppError::AlreadyTerminal(_)) => report.resolved += 1,
                Err(e) => {
                    tracing::warn!("Reaper could not cancel payment {}: {}", id, e);
                    report.skipped += 1;
                }
            }
        }

        if report.examined > 0 {
            tracing::info!(
                "Reaper examined {} payment(s): {} resolved, {} cancelled, {} skipped",
                report.examined,
                report.resolved,
                report.cancelled,
                report.skipped
            );
        }
        Ok(report)
    }

    pub fn spawn(self: Arc<Self>, interval_secs: u64) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    tracing::error!("Reaper sweep failed: {}", e);
                }
            }
        })
    }
}
