use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::access::AccessLevel;
use crate::domain::solicitation::Solicitation;
use crate::domain::workflow::{StepKind, WorkflowStep};

/// Payload key holding the idempotency marker. Payload field names follow
/// the intake forms' camelCase convention.
pub const MARKER_KEY: &str = "ultimaNotificacao";

pub const DEFAULT_SUBJECT: &str = "Solicitação {{protocolo}} — {{etapa}}";
pub const DEFAULT_BODY: &str = "A solicitação {{protocolo}} ({{tipo}}) de {{solicitante}} \
entrou na etapa {{etapa}}.\n\nAcompanhe em: {{link}}";

/// Last-notified marker persisted inside the solicitation payload. Once it
/// records a step key, the dispatcher never resends for that step, even
/// across retries and crashes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMarker {
    pub step_key: String,
    pub notified_at: DateTime<Utc>,
    pub result: String,
}

pub fn read_marker(payload: &Value) -> Option<NotificationMarker> {
    payload
        .get(MARKER_KEY)
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
}

pub fn write_marker(payload: &mut Value, marker: &NotificationMarker) {
    if !payload.is_object() {
        *payload = Value::Object(serde_json::Map::new());
    }
    if let Some(object) = payload.as_object_mut() {
        if let Ok(value) = serde_json::to_value(marker) {
            object.insert(MARKER_KEY.to_string(), value);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResult {
    pub sent: bool,
    pub provider: String,
    pub error: Option<String>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, recipients: &[String], subject: &str, body: &str) -> SendResult;
}

/// A candidate recipient for a queue step: an active member of the target
/// department together with their effective level for the step's module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DepartmentRecipient {
    pub email: String,
    pub active: bool,
    pub level: Option<AccessLevel>,
}

#[derive(Clone, Debug, Default)]
pub struct RecipientSources {
    /// Manually configured addresses on the step.
    pub configured_addresses: Vec<String>,
    /// Emails behind the step's approver set plus the assigned approver.
    pub approver_emails: Vec<String>,
    pub department_users: Vec<DepartmentRecipient>,
}

/// Approval steps notify approvers; queue steps notify the configured
/// addresses plus qualified department members. Order-preserving dedup so
/// callers see a stable recipient list.
pub fn resolve_recipients(step: &WorkflowStep, sources: &RecipientSources) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut recipients = Vec::new();
    let mut push = |email: &str| {
        let email = email.trim();
        if !email.is_empty() && seen.insert(email.to_ascii_lowercase()) {
            recipients.push(email.to_string());
        }
    };

    match step.kind {
        StepKind::Approval => {
            for email in &sources.approver_emails {
                push(email);
            }
        }
        StepKind::Queue => {
            for email in &sources.configured_addresses {
                push(email);
            }
            for user in &sources.department_users {
                if !user.active {
                    continue;
                }
                if user.level.map(|level| level >= step.required_level).unwrap_or(false) {
                    push(&user.email);
                }
            }
        }
        StepKind::End => {}
    }

    recipients
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchPlan {
    AlreadyNotified { step_key: String },
    NoRecipients { step_key: String },
    NoBaseUrl { step_key: String },
    Send { step_key: String, recipients: Vec<String>, subject: String, body: String },
}

/// Decides what (if anything) to send for a step entry. Pure: persistence
/// of the marker after a confirmed send is the caller's job and must be the
/// operation's final step.
pub fn plan_dispatch(
    solicitation: &Solicitation,
    step: &WorkflowStep,
    sources: &RecipientSources,
    base_url: Option<&str>,
) -> DispatchPlan {
    let step_key = step.key.0.clone();

    if let Some(marker) = read_marker(&solicitation.payload) {
        if marker.step_key == step_key {
            return DispatchPlan::AlreadyNotified { step_key };
        }
    }

    let recipients = resolve_recipients(step, sources);
    if recipients.is_empty() {
        return DispatchPlan::NoRecipients { step_key };
    }

    let Some(base_url) = base_url else {
        return DispatchPlan::NoBaseUrl { step_key };
    };

    let variables = template_variables(solicitation, step, base_url);
    let subject = render_template(
        step.notify_subject.as_deref().unwrap_or(DEFAULT_SUBJECT),
        &variables,
    );
    let body =
        render_template(step.notify_body.as_deref().unwrap_or(DEFAULT_BODY), &variables);

    DispatchPlan::Send { step_key, recipients, subject, body }
}

pub fn template_variables(
    solicitation: &Solicitation,
    step: &WorkflowStep,
    base_url: &str,
) -> HashMap<String, String> {
    HashMap::from([
        ("protocolo".to_string(), solicitation.protocol.clone()),
        ("tipo".to_string(), solicitation.type_key.clone()),
        ("solicitante".to_string(), solicitation.requester_name.clone()),
        ("etapa".to_string(), step.label.clone()),
        (
            "departamento".to_string(),
            step.department_id.as_ref().map(|id| id.0.clone()).unwrap_or_default(),
        ),
        (
            "link".to_string(),
            format!("{}/solicitacoes/{}", base_url.trim_end_matches('/'), solicitation.id.0),
        ),
    ])
}

pub fn render_template(template: &str, variables: &HashMap<String, String>) -> String {
    let mut output = template.to_string();
    for (key, value) in variables {
        output = output.replace(&format!("{{{{{key}}}}}"), value);
    }
    output
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use crate::access::AccessLevel;
    use crate::domain::directory::{DepartmentId, UserId};
    use crate::domain::solicitation::{
        ApprovalState, Solicitation, SolicitationId, SolicitationStatus,
    };
    use crate::domain::workflow::{StepKey, StepKind, WorkflowStep};

    use super::{
        plan_dispatch, read_marker, resolve_recipients, write_marker, DepartmentRecipient,
        DispatchPlan, NotificationMarker, RecipientSources,
    };

    fn solicitation() -> Solicitation {
        Solicitation {
            id: SolicitationId("SOL-9".to_string()),
            protocol: "2026-000112".to_string(),
            type_key: "epi".to_string(),
            payload: json!({}),
            status: SolicitationStatus::Open,
            requires_approval: false,
            approval: ApprovalState::NotRequired,
            approver_id: None,
            department_id: Some(DepartmentId("dep-log".to_string())),
            current_step_key: None,
            cost_center_id: None,
            parent_id: None,
            requester_id: UserId("u-1".to_string()),
            requester_name: "Carla".to_string(),
            decision: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            closed_at: None,
        }
    }

    fn queue_step() -> WorkflowStep {
        WorkflowStep {
            key: StepKey("destino".to_string()),
            label: "Fila de destino".to_string(),
            kind: StepKind::Queue,
            department_id: Some(DepartmentId("dep-log".to_string())),
            approver_ids: Vec::new(),
            required_level: AccessLevel::Nivel1,
            notify_subject: None,
            notify_body: None,
            extra_recipients: Vec::new(),
            position: 2,
        }
    }

    fn sources() -> RecipientSources {
        RecipientSources {
            configured_addresses: vec!["fila@example.com".to_string()],
            approver_emails: vec!["chefe@example.com".to_string()],
            department_users: vec![
                DepartmentRecipient {
                    email: "dora@example.com".to_string(),
                    active: true,
                    level: Some(AccessLevel::Nivel1),
                },
                DepartmentRecipient {
                    email: "inativo@example.com".to_string(),
                    active: false,
                    level: Some(AccessLevel::Nivel3),
                },
                DepartmentRecipient {
                    email: "sem-modulo@example.com".to_string(),
                    active: true,
                    level: None,
                },
            ],
        }
    }

    #[test]
    fn queue_steps_union_configured_addresses_and_qualified_members() {
        let recipients = resolve_recipients(&queue_step(), &sources());
        assert_eq!(recipients, vec!["fila@example.com", "dora@example.com"]);
    }

    #[test]
    fn approval_steps_notify_only_approvers() {
        let mut step = queue_step();
        step.kind = StepKind::Approval;
        let recipients = resolve_recipients(&step, &sources());
        assert_eq!(recipients, vec!["chefe@example.com"]);
    }

    #[test]
    fn recipients_are_deduplicated_case_insensitively() {
        let mut sources = sources();
        sources.configured_addresses.push("DORA@example.com".to_string());
        let recipients = resolve_recipients(&queue_step(), &sources);
        assert_eq!(recipients, vec!["fila@example.com", "DORA@example.com"]);
    }

    #[test]
    fn matching_marker_short_circuits_the_dispatch() {
        let mut record = solicitation();
        write_marker(
            &mut record.payload,
            &NotificationMarker {
                step_key: "destino".to_string(),
                notified_at: Utc::now(),
                result: "sent".to_string(),
            },
        );

        let plan = plan_dispatch(&record, &queue_step(), &sources(), Some("https://rh.example.com"));
        assert_eq!(plan, DispatchPlan::AlreadyNotified { step_key: "destino".to_string() });
    }

    #[test]
    fn a_marker_for_another_step_does_not_block_sending() {
        let mut record = solicitation();
        write_marker(
            &mut record.payload,
            &NotificationMarker {
                step_key: "origem".to_string(),
                notified_at: Utc::now(),
                result: "sent".to_string(),
            },
        );

        let plan = plan_dispatch(&record, &queue_step(), &sources(), Some("https://rh.example.com"));
        assert!(matches!(plan, DispatchPlan::Send { .. }));
    }

    #[test]
    fn empty_recipient_set_skips_without_error() {
        let plan = plan_dispatch(
            &solicitation(),
            &queue_step(),
            &RecipientSources::default(),
            Some("https://rh.example.com"),
        );
        assert_eq!(plan, DispatchPlan::NoRecipients { step_key: "destino".to_string() });
    }

    #[test]
    fn missing_base_url_skips_without_error() {
        let plan = plan_dispatch(&solicitation(), &queue_step(), &sources(), None);
        assert_eq!(plan, DispatchPlan::NoBaseUrl { step_key: "destino".to_string() });
    }

    #[test]
    fn rendered_templates_substitute_solicitation_fields() {
        let plan = plan_dispatch(&solicitation(), &queue_step(), &sources(), Some("https://rh.example.com/"));

        let DispatchPlan::Send { subject, body, .. } = plan else {
            panic!("expected a send plan");
        };
        assert!(subject.contains("2026-000112"));
        assert!(body.contains("Carla"));
        assert!(body.contains("https://rh.example.com/solicitacoes/SOL-9"));
    }

    #[test]
    fn marker_round_trips_through_the_payload() {
        let mut payload = json!({"itens": [1, 2]});
        let marker = NotificationMarker {
            step_key: "origem".to_string(),
            notified_at: Utc::now(),
            result: "sent".to_string(),
        };

        write_marker(&mut payload, &marker);
        assert_eq!(read_marker(&payload), Some(marker));
        // Existing payload fields are preserved.
        assert_eq!(payload["itens"], json!([1, 2]));
    }
}
