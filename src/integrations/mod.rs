use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;
use crate::domain::Membership;
use crate::error::Result;

pub mod email;

#[derive(Debug, Clone)]
pub enum IntegrationEvent {
    PaymentCompleted {
        owner_id: Uuid,
        payer_id: Uuid,
        payment_id: Uuid,
        amount: i64,
        currency: String,
        contact_email: Option<String>,
        membership_number: Option<String>,
    },
    PaymentFailed {
        owner_id: Uuid,
        payment_id: Uuid,
        reason: String,
    },
    MembershipActivated(Membership),
}

impl IntegrationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            IntegrationEvent::PaymentCompleted { .. } => "payment_completed",
            IntegrationEvent::PaymentFailed { .. } => "payment_failed",
            IntegrationEvent::MembershipActivated(_) => "membership_activated",
        }
    }
}

#[async_trait]
pub trait Integration: Send + Sync {
    fn name(&self) -> &str;
    fn is_enabled(&self) -> bool;
    async fn health_check(&self) -> Result<()>;
    async fn handle_event(&self, event: &IntegrationEvent) -> Result<()>;
}

pub struct IntegrationManager {
    integrations: RwLock<Vec<Arc<dyn Integration>>>,
}

impl Default for IntegrationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl IntegrationManager {
    pub fn new() -> Self {
        Self {
            integrations: RwLock::new(Vec::new()),
        }
    }

    pub async fn register(&self, integration: Arc<dyn Integration>) {
        if integration.is_enabled() {
            tracing::info!("Registered integration: {}", integration.name());
            self.integrations.write().await.push(integration);
        }
    }

    /// Fire-and-forget. The caller never waits on, or learns about, the
    /// outcome of delivery.
    pub fn dispatch(self: &Arc<Self>, event: IntegrationEvent) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.handle_event(event).await;
        });
    }

    pub async fn handle_event(&self, event: IntegrationEvent) {
        let integrations = self.integrations.read().await;

        for integration in integrations.iter() {
            if !integration.is_enabled() {
                continue;
            }

            match integration.handle_event(&event).await {
                Ok(_) => {
                    tracing::debug!(
                        "Integration {} handled {} successfully",
                        integration.name(),
                        event.kind()
                    );
                }
                Err(e) => {
                    tracing::error!(
                        "Integration {} failed to handle {}: {:?}",
                        integration.name(),
                        event.kind(),
                        e
                    );
                }
            }
        }
    }

    pub async fn health_check_all(&self) -> Vec<(String, Result<()>)> {
        let integrations = self.integrations.read().await;
        let mut results = Vec::new();

        for integration in integrations.iter() {
            let name = integration.name().to_string();
            let result = integration.health_check().await;
            results.push((name, result));
        }

        results
    }
}
