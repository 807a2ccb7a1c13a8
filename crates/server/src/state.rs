use std::sync::Arc;

use secrecy::ExposeSecret;

use tramita_core::config::AppConfig;
use tramita_core::domain::directory::{CostCenterId, DepartmentId, UserId};
use tramita_core::gate::{RoutingRegistry, StandardDepartments};
use tramita_core::notify::Mailer;
use tramita_core::reconcile::BlobStore;
use tramita_db::DbPool;
use tramita_esign::{HttpSignatureClient, SignatureClient};

use crate::blob::FsBlobStore;
use crate::mailer::{HttpMailer, NoopMailer};
use crate::notify::NotificationService;

#[derive(Clone)]
pub struct EngineState {
    pub pool: DbPool,
    pub registry: Arc<RoutingRegistry>,
    pub stock_approver: UserId,
    pub notifier: Arc<NotificationService>,
    pub esign: Option<Arc<dyn SignatureClient>>,
    pub webhook_secret: Option<String>,
    pub blobs: Arc<dyn BlobStore>,
}

impl EngineState {
    pub fn build(config: &AppConfig, pool: DbPool) -> Self {
        let departments = StandardDepartments {
            hr: DepartmentId(config.routing.hr_department.clone()),
            hr_cost_center: config.routing.hr_cost_center.clone().map(CostCenterId),
            payroll: DepartmentId(config.routing.payroll_department.clone()),
            logistics: DepartmentId(config.routing.logistics_department.clone()),
        };

        let mailer: Arc<dyn Mailer> = match HttpMailer::from_config(&config.mailer) {
            Some(mailer) => Arc::new(mailer),
            None => Arc::new(NoopMailer),
        };

        let esign: Option<Arc<dyn SignatureClient>> =
            match (&config.esign.base_url, &config.esign.api_key) {
                (Some(base_url), Some(api_key)) => HttpSignatureClient::new(
                    base_url.clone(),
                    api_key.clone(),
                    config.esign.timeout_secs,
                )
                .ok()
                .map(|client| Arc::new(client) as Arc<dyn SignatureClient>),
                _ => None,
            };

        Self {
            pool: pool.clone(),
            registry: Arc::new(RoutingRegistry::standard(&departments)),
            stock_approver: UserId(config.routing.stock_approver_id.clone()),
            notifier: Arc::new(NotificationService::new(
                pool,
                mailer,
                config.notifications.resolved_base_url(),
            )),
            esign,
            webhook_secret: config
                .esign
                .webhook_secret
                .as_ref()
                .map(|secret| secret.expose_secret().to_string()),
            blobs: Arc::new(FsBlobStore::new("storage")),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use tramita_core::domain::directory::{CostCenterId, DepartmentId, UserId};
    use tramita_core::gate::{RoutingRegistry, StandardDepartments};
    use tramita_db::DbPool;
    use tramita_esign::RecordingSignatureClient;

    use crate::blob::InMemoryBlobStore;
    use crate::mailer::RecordingMailer;
    use crate::notify::NotificationService;

    use super::EngineState;

    pub const TEST_WEBHOOK_SECRET: &str = "segredo-compartilhado";

    /// State wired against the seeded fixture departments with recording
    /// fakes for every external collaborator.
    pub fn test_state(pool: DbPool, mailer: Arc<RecordingMailer>) -> EngineState {
        test_state_with(pool, mailer, Arc::new(RecordingSignatureClient::default()))
    }

    pub fn test_state_with(
        pool: DbPool,
        mailer: Arc<RecordingMailer>,
        esign: Arc<RecordingSignatureClient>,
    ) -> EngineState {
        EngineState {
            pool: pool.clone(),
            registry: Arc::new(RoutingRegistry::standard(&StandardDepartments {
                hr: DepartmentId("dep-rh".to_string()),
                hr_cost_center: Some(CostCenterId("cc-rh".to_string())),
                payroll: DepartmentId("dep-folha-pagamento".to_string()),
                logistics: DepartmentId("dep-logistica".to_string()),
            })),
            stock_approver: UserId("u-suprimentos".to_string()),
            notifier: Arc::new(NotificationService::new(
                pool,
                mailer,
                Some("https://rh.example.com".to_string()),
            )),
            esign: Some(esign as Arc<dyn tramita_esign::SignatureClient>),
            webhook_secret: Some(TEST_WEBHOOK_SECRET.to_string()),
            blobs: Arc::new(InMemoryBlobStore::default()),
        }
    }
}
