pub mod membership_activator;
pub mod membership_service;
pub mod payment_service;
pub mod reaper;
pub mod reconciliation;

use std::sync::Arc;
use sqlx::SqlitePool;
use crate::config::Settings;
use crate::integrations::IntegrationManager;
use crate::payments::Gateways;
use crate::repository::*;
use membership_activator::MembershipActivator;
use membership_service::MembershipService;
use payment_service::PaymentService;
use reaper::PaymentReaper;
use reconciliation::Reconciler;

pub struct ServiceContext {
    pub payment_repo: Arc<dyn PaymentRepository>,
    pub gateway_record_repo: Arc<dyn GatewayRecordRepository>,
    pub membership_repo: Arc<dyn MembershipRepository>,
    pub profile_repo: Arc<dyn ProfileRepository>,
    pub integration_manager: Arc<IntegrationManager>,
    pub reconciler: Arc<Reconciler>,
    pub payment_service: Arc<PaymentService>,
    pub membership_service: Arc<MembershipService>,
    pub reaper: Arc<PaymentReaper>,
    pub db_pool: SqlitePool,
}

impl ServiceContext {
    pub fn new(
        settings: &Settings,
        gateways: Gateways,
        integration_manager: Arc<IntegrationManager>,
        db_pool: SqlitePool,
    ) -> Self {
        let payment_repo: Arc<dyn PaymentRepository> =
            Arc::new(SqlitePaymentRepository::new(db_pool.clone()));
        let gateway_record_repo: Arc<dyn GatewayRecordRepository> =
            Arc::new(SqliteGatewayRecordRepository::new(db_pool.clone()));
        let membership_repo: Arc<dyn MembershipRepository> =
            Arc::new(SqliteMembershipRepository::new(db_pool.clone()));
        let profile_repo: Arc<dyn ProfileRepository> =
            Arc::new(SqliteProfileRepository::new(db_pool.clone()));

        let activator = Arc::new(MembershipActivator::new(&settings.membership));
        let reconciler = Arc::new(Reconciler::new(
            db_pool.clone(),
            activator.clone(),
            integration_manager.clone(),
        ));
        let payment_service = Arc::new(PaymentService::new(
            db_pool.clone(),
            payment_repo.clone(),
            gateway_record_repo.clone(),
            gateways,
            reconciler.clone(),
            settings.payments.max_amount,
        ));
        let membership_service = Arc::new(MembershipService::new(
            db_pool.clone(),
            membership_repo.clone(),
            profile_repo.clone(),
            activator,
        ));
        let reaper = Arc::new(PaymentReaper::new(
            payment_repo.clone(),
            payment_service.clone(),
            reconciler.clone(),
            settings.reaper.pending_timeout_minutes,
        ));

        Self {
            payment_repo,
            gateway_record_repo,
            membership_repo,
            profile_repo,
            integration_manager,
            reconciler,
            payment_service,
            membership_service,
            reaper,
            db_pool,
        }
    }
}
