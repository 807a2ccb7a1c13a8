use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use tramita_core::domain::directory::{DepartmentId, UserId};
use tramita_core::domain::solicitation::SolicitationId;
use tramita_core::domain::workflow::{StepKind, WorkflowDefinition, WorkflowStep};
use tramita_core::errors::GateError;
use tramita_core::gate::MODULE_SOLICITATIONS;
use tramita_core::notify::{
    plan_dispatch, write_marker, DispatchPlan, Mailer, NotificationMarker, RecipientSources,
};
use tramita_core::routing::{current_step, DefinitionError, DefinitionStore};
use tramita_db::repositories::{
    DirectoryRepository, SolicitationRepository, SqlDirectoryRepository,
    SqlSolicitationRepository, SqlWorkflowDefinitionRepository,
};
use tramita_db::DbPool;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent { step_key: String, recipients: usize },
    AlreadyNotified { step_key: String },
    SkippedNoRecipients { step_key: String },
    SkippedNoBaseUrl { step_key: String },
    SendFailed { step_key: String, error: String },
}

/// Sends the step-entry notification at most once per (solicitation, step).
/// The marker write after a confirmed send is the idempotency boundary; a
/// failed send leaves no marker so a retry attempts again.
pub struct NotificationService {
    pool: DbPool,
    mailer: Arc<dyn Mailer>,
    base_url: Option<String>,
}

impl NotificationService {
    pub fn new(pool: DbPool, mailer: Arc<dyn Mailer>, base_url: Option<String>) -> Self {
        Self { pool, mailer, base_url }
    }

    pub async fn notify_step_entry(
        &self,
        solicitation_id: &SolicitationId,
        prefer_kind: Option<StepKind>,
        prefer_department: Option<DepartmentId>,
    ) -> Result<NotifyOutcome, GateError> {
        let solicitations = SqlSolicitationRepository::new(self.pool.clone());
        let mut solicitation = solicitations
            .find_by_id(solicitation_id)
            .await
            .map_err(|error| GateError::unavailable("persistence", error.to_string()))?
            .ok_or_else(|| GateError::not_found("solicitation", solicitation_id.0.clone()))?;

        let store = DefinitionStore::new(SqlWorkflowDefinitionRepository::new(self.pool.clone()));
        let definition = store
            .definition_for(
                &solicitation.type_key,
                prefer_department.as_ref().or(solicitation.department_id.as_ref()),
            )
            .await
            .map_err(|error| match error {
                DefinitionError::Source(message) => {
                    GateError::unavailable("workflow store", message)
                }
                DefinitionError::Invalid(validation) => {
                    GateError::IntegrityViolation { message: validation.to_string() }
                }
            })?;

        let step = resolve_target_step(
            &solicitation,
            &definition,
            prefer_kind,
            prefer_department.as_ref(),
        )?;

        let sources = self.resolve_sources(&solicitation.approver_id, step).await?;
        let plan = plan_dispatch(&solicitation, step, &sources, self.base_url.as_deref());

        match plan {
            DispatchPlan::AlreadyNotified { step_key } => {
                Ok(NotifyOutcome::AlreadyNotified { step_key })
            }
            DispatchPlan::NoRecipients { step_key } => {
                Ok(NotifyOutcome::SkippedNoRecipients { step_key })
            }
            DispatchPlan::NoBaseUrl { step_key } => {
                Ok(NotifyOutcome::SkippedNoBaseUrl { step_key })
            }
            DispatchPlan::Send { step_key, recipients, subject, body } => {
                let result = self.mailer.send(&recipients, &subject, &body).await;
                if !result.sent {
                    return Ok(NotifyOutcome::SendFailed {
                        step_key,
                        error: result.error.unwrap_or_else(|| "send failed".to_string()),
                    });
                }

                // Confirmed send: persisting the marker is the last step of
                // the operation.
                let marker = NotificationMarker {
                    step_key: step_key.clone(),
                    notified_at: Utc::now(),
                    result: result.provider,
                };
                write_marker(&mut solicitation.payload, &marker);
                solicitations
                    .save_payload(solicitation_id, &solicitation.payload)
                    .await
                    .map_err(|error| {
                        GateError::unavailable("persistence", error.to_string())
                    })?;

                Ok(NotifyOutcome::Sent { step_key, recipients: recipients.len() })
            }
        }
    }

    /// Notification is best-effort relative to the state transition that
    /// triggered it: failures are logged, never propagated.
    pub async fn notify_step_entry_best_effort(
        &self,
        solicitation_id: &SolicitationId,
        prefer_kind: Option<StepKind>,
        prefer_department: Option<DepartmentId>,
    ) {
        match self.notify_step_entry(solicitation_id, prefer_kind, prefer_department).await {
            Ok(NotifyOutcome::SendFailed { step_key, error }) => {
                warn!(
                    event_name = "notification.send_failed",
                    solicitation_id = %solicitation_id.0,
                    step_key = %step_key,
                    error = %error,
                    "step-entry notification failed, will retry on next transition"
                );
            }
            Ok(_) => {}
            Err(error) => {
                warn!(
                    event_name = "notification.dispatch_error",
                    solicitation_id = %solicitation_id.0,
                    error = %error,
                    "step-entry notification could not be dispatched"
                );
            }
        }
    }

    async fn resolve_sources(
        &self,
        assigned_approver: &Option<UserId>,
        step: &WorkflowStep,
    ) -> Result<RecipientSources, GateError> {
        let directory = SqlDirectoryRepository::new(self.pool.clone());
        let unavailable =
            |error: tramita_db::repositories::RepositoryError| {
                GateError::unavailable("directory", error.to_string())
            };

        let mut approver_ids = step.approver_ids.clone();
        if let Some(assigned) = assigned_approver {
            if !approver_ids.contains(assigned) {
                approver_ids.push(assigned.clone());
            }
        }
        let approver_emails =
            directory.user_emails(&approver_ids).await.map_err(unavailable)?;

        let department_users = match &step.department_id {
            Some(department_id) => directory
                .department_recipients(department_id, MODULE_SOLICITATIONS)
                .await
                .map_err(unavailable)?,
            None => Vec::new(),
        };

        Ok(RecipientSources {
            configured_addresses: step.extra_recipients.clone(),
            approver_emails,
            department_users,
        })
    }
}

fn resolve_target_step<'a>(
    solicitation: &tramita_core::Solicitation,
    definition: &'a WorkflowDefinition,
    prefer_kind: Option<StepKind>,
    prefer_department: Option<&DepartmentId>,
) -> Result<&'a WorkflowStep, GateError> {
    if prefer_kind == Some(StepKind::Approval) {
        return definition.approval_step().ok_or_else(|| GateError::IntegrityViolation {
            message: format!("workflow for `{}` has no approval step", solicitation.type_key),
        });
    }

    if let Some(department_id) = prefer_department {
        if let Some(step) = definition
            .queue_steps()
            .find(|step| step.department_id.as_ref() == Some(department_id))
        {
            return Ok(step);
        }
    }

    current_step(solicitation, definition)
        .map_err(|error| GateError::IntegrityViolation { message: error.to_string() })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use serde_json::json;

    use tramita_core::domain::directory::DepartmentId;
    use tramita_core::domain::solicitation::{
        ApprovalState, Solicitation, SolicitationId, SolicitationStatus,
    };
    use tramita_core::domain::workflow::StepKind;
    use tramita_core::notify::read_marker;
    use tramita_core::UserId;
    use tramita_db::repositories::{SolicitationRepository, SqlSolicitationRepository};
    use tramita_db::{connect_with_settings, fixtures, migrations};

    use crate::mailer::RecordingMailer;

    use super::{NotificationService, NotifyOutcome};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        fixtures::seed_directory(&pool).await.expect("seed directory");
        fixtures::seed_workflow(&pool, "epi").await.expect("seed workflow");
        pool
    }

    async fn seed_solicitation(pool: &sqlx::SqlitePool, department: &str) -> SolicitationId {
        let repo = SqlSolicitationRepository::new(pool.clone());
        let now = Utc::now();
        let id = SolicitationId("SOL-1".to_string());
        repo.save(Solicitation {
            id: id.clone(),
            protocol: "2026-000200".to_string(),
            type_key: "epi".to_string(),
            payload: json!({}),
            status: SolicitationStatus::Open,
            requires_approval: false,
            approval: ApprovalState::NotRequired,
            approver_id: None,
            department_id: Some(DepartmentId(department.to_string())),
            current_step_key: None,
            cost_center_id: None,
            parent_id: None,
            requester_id: UserId("u-req".to_string()),
            requester_name: "Ana".to_string(),
            decision: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
        })
        .await
        .expect("seed solicitation");
        id
    }

    fn service(pool: sqlx::SqlitePool, mailer: Arc<RecordingMailer>) -> NotificationService {
        NotificationService::new(pool, mailer, Some("https://rh.example.com".to_string()))
    }

    #[tokio::test]
    async fn first_dispatch_sends_and_persists_the_marker() {
        let pool = setup().await;
        let id = seed_solicitation(&pool, "dep-origem").await;
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = service(pool.clone(), mailer.clone());

        let outcome = notifier.notify_step_entry(&id, None, None).await.expect("notify");
        assert!(matches!(outcome, NotifyOutcome::Sent { ref step_key, .. } if step_key == "origem"));
        assert_eq!(mailer.sent_count(), 1);

        let repo = SqlSolicitationRepository::new(pool);
        let stored = repo.find_by_id(&id).await.expect("find").expect("exists");
        let marker = read_marker(&stored.payload).expect("marker persisted");
        assert_eq!(marker.step_key, "origem");
    }

    #[tokio::test]
    async fn second_dispatch_for_the_same_step_is_a_no_op() {
        let pool = setup().await;
        let id = seed_solicitation(&pool, "dep-origem").await;
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = service(pool.clone(), mailer.clone());

        notifier.notify_step_entry(&id, None, None).await.expect("first notify");
        let outcome = notifier.notify_step_entry(&id, None, None).await.expect("second notify");

        assert!(matches!(outcome, NotifyOutcome::AlreadyNotified { ref step_key } if step_key == "origem"));
        assert_eq!(mailer.sent_count(), 1, "exactly one mail-send call");
    }

    #[tokio::test]
    async fn failed_send_leaves_no_marker_so_a_retry_sends() {
        let pool = setup().await;
        let id = seed_solicitation(&pool, "dep-origem").await;

        let failing = Arc::new(RecordingMailer { fail: true, ..Default::default() });
        let notifier = service(pool.clone(), failing);
        let outcome = notifier.notify_step_entry(&id, None, None).await.expect("notify");
        assert!(matches!(outcome, NotifyOutcome::SendFailed { .. }));

        let repo = SqlSolicitationRepository::new(pool.clone());
        let stored = repo.find_by_id(&id).await.expect("find").expect("exists");
        assert!(read_marker(&stored.payload).is_none());

        // Retry with a healthy mailer succeeds and only then persists.
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = service(pool, mailer.clone());
        let outcome = notifier.notify_step_entry(&id, None, None).await.expect("retry");
        assert!(matches!(outcome, NotifyOutcome::Sent { .. }));
        assert_eq!(mailer.sent_count(), 1);
    }

    #[tokio::test]
    async fn missing_base_url_skips_without_sending() {
        let pool = setup().await;
        let id = seed_solicitation(&pool, "dep-origem").await;
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = NotificationService::new(pool, mailer.clone(), None);

        let outcome = notifier.notify_step_entry(&id, None, None).await.expect("notify");
        assert!(matches!(outcome, NotifyOutcome::SkippedNoBaseUrl { .. }));
        assert_eq!(mailer.sent_count(), 0);
    }

    #[tokio::test]
    async fn approval_hint_targets_the_approval_step_and_assigned_approver() {
        let pool = setup().await;
        let id = seed_solicitation(&pool, "dep-origem").await;

        let repo = SqlSolicitationRepository::new(pool.clone());
        let mut record = repo.find_by_id(&id).await.expect("find").expect("exists");
        record.approver_id = Some(UserId("u-suprimentos".to_string()));
        record.approval = ApprovalState::Pending;
        repo.save(record).await.expect("save");

        let mailer = Arc::new(RecordingMailer::default());
        let notifier = service(pool, mailer.clone());
        let outcome = notifier
            .notify_step_entry(&id, Some(StepKind::Approval), None)
            .await
            .expect("notify");

        assert!(matches!(outcome, NotifyOutcome::Sent { ref step_key, .. } if step_key == "aprovadores"));
        let messages = mailer.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, vec!["suprimentos@example.com".to_string()]);
    }

    #[tokio::test]
    async fn unknown_solicitation_is_not_found() {
        let pool = setup().await;
        let notifier = service(pool, Arc::new(RecordingMailer::default()));

        let error = notifier
            .notify_step_entry(&SolicitationId("SOL-miss".to_string()), None, None)
            .await
            .expect_err("missing record");
        assert!(matches!(error, tramita_core::GateError::NotFound { .. }));
    }
}
