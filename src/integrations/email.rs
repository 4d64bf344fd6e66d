use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

use crate::{
    config::EmailConfig,
    error::{AppError, Result},
    integrations::{Integration, IntegrationEvent},
};

/// Mails payment outcomes to the association's treasurer mailbox and, when
/// the payer's address is known, a confirmation to the payer.
pub struct EmailIntegration {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl EmailIntegration {
    pub fn new(config: Option<EmailConfig>) -> Result<Option<Self>> {
        let Some(cfg) = config.filter(|c| c.enabled) else {
            return Ok(None);
        };

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.smtp_host)
            .map_err(|e| AppError::Integration(format!("Failed to create SMTP transport: {}", e)))?
            .port(cfg.smtp_port)
            .credentials(Credentials::new(cfg.smtp_username.clone(), cfg.smtp_password.clone()))
            .build();

        let from = cfg
            .from_address
            .parse()
            .map_err(|e| AppError::Integration(format!("Invalid from address: {}", e)))?;
        let to = cfg
            .notify_address
            .parse()
            .map_err(|e| AppError::Integration(format!("Invalid notify address: {}", e)))?;

        Ok(Some(Self { transport, from, to }))
    }

    fn render(event: &IntegrationEvent) -> (String, String) {
        match event {
            IntegrationEvent::PaymentCompleted { owner_id, payer_id, payment_id, amount, currency, .. } => (
                format!("Payment received: {} {}", amount, currency),
                format!(
                    "Payment {} of {} {} completed.\nMember: {}\nPaid by: {}\n",
                    payment_id, amount, currency, owner_id, payer_id
                ),
            ),
            IntegrationEvent::PaymentFailed { owner_id, payment_id, reason } => (
                "Payment failed".to_string(),
                format!("Payment {} for member {} failed: {}\n", payment_id, owner_id, reason),
            ),
            IntegrationEvent::MembershipActivated(membership) => (
                format!(
                    "Membership activated: {}",
                    membership.membership_number.as_deref().unwrap_or("unnumbered")
                ),
                format!(
                    "Membership {} ({}) for member {} is active until {}.\n",
                    membership.id,
                    membership.plan,
                    membership.owner_id,
                    membership
                        .end_at
                        .map(|d| d.format("%Y-%m-%d").to_string())
                        .unwrap_or_else(|| "-".to_string())
                ),
            ),
        }
    }

    /// Confirmation for the payer, when the event carries their address.
    fn render_receipt(event: &IntegrationEvent) -> Option<(String, String, String)> {
        let IntegrationEvent::PaymentCompleted {
            payment_id,
            amount,
            currency,
            contact_email: Some(address),
            membership_number,
            ..
        } = event
        else {
            return None;
        };

        let mut body = format!(
            "Thank you. We received your payment of {} {} (reference {}).\n",
            amount, currency, payment_id
        );
        if let Some(number) = membership_number {
            body.push_str(&format!("Your membership number is {}.\n", number));
        }
        Some((address.clone(), "Your membership payment was received".to_string(), body))
    }

    fn message(&self, to: Mailbox, subject: String, body: String) -> Result<Message> {
        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .map_err(|e| AppError::Integration(format!("Failed to build email: {}", e)))
    }
}

#[async_trait]
impl Integration for EmailIntegration {
    fn name(&self) -> &str {
        "Email"
    }

    fn is_enabled(&self) -> bool {
        true
    }

    async fn health_check(&self) -> Result<()> {
        match self.transport.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(AppError::Integration("SMTP server refused connection".to_string())),
            Err(e) => Err(AppError::Integration(format!("SMTP check failed: {}", e))),
        }
    }

    async fn handle_event(&self, event: &IntegrationEvent) -> Result<()> {
        let (subject, body) = Self::render(event);
        let notice = self.message(self.to.clone(), subject, body)?;
        self.transport
            .send(notice)
            .await
            .map_err(|e| AppError::Integration(format!("Failed to send email: {}", e)))?;
        tracing::info!("Sent {} notification email", event.kind());

        if let Some((address, subject, body)) = Self::render_receipt(event) {
            let to: Mailbox = match address.parse() {
                Ok(to) => to,
                Err(e) => {
                    tracing::warn!("Skipping payer confirmation to {}: {}", address, e);
                    return Ok(());
                }
            };
            let receipt = self.message(to, subject, body)?;
            self.transport
                .send(receipt)
                .await
                .map_err(|e| AppError::Integration(format!("Failed to send confirmation: {}", e)))?;
            tracing::info!("Sent payment confirmation to the payer");
        }
        Ok(())
    }
}
