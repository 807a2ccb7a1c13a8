use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::document::{AssignmentStatus, DocumentAssignment};

/// Status carried by a provider completion event. Providers deliver these
/// at least once and not necessarily in order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderEventStatus {
    Completed,
    Declined,
    Voided,
    Other(String),
}

impl ProviderEventStatus {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "completed" | "signed" => Self::Completed,
            "declined" | "refused" => Self::Declined,
            "voided" | "canceled" | "cancelled" => Self::Voided,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Acknowledge without touching state; the reason is logged.
    Ignore { reason: &'static str },
    RecordSigned,
    RecordDeclined,
}

/// Decides how an incoming event applies to the assignment's current
/// state. Duplicates and late declines converge on Ignore: a terminal
/// SIGNED state is never reversed.
pub fn plan_reconcile(
    assignment: &DocumentAssignment,
    status: &ProviderEventStatus,
    event_already_processed: bool,
) -> ReconcileAction {
    if event_already_processed {
        return ReconcileAction::Ignore { reason: "event already processed" };
    }

    match status {
        ProviderEventStatus::Completed => match assignment.status {
            AssignmentStatus::Signed => {
                ReconcileAction::Ignore { reason: "assignment already signed" }
            }
            AssignmentStatus::Declined => {
                // Completed wins over an earlier decline only when the
                // decline was never applied; once terminal, keep it.
                ReconcileAction::Ignore { reason: "assignment already declined" }
            }
            _ => ReconcileAction::RecordSigned,
        },
        ProviderEventStatus::Declined | ProviderEventStatus::Voided => match assignment.status {
            AssignmentStatus::Signed => {
                ReconcileAction::Ignore { reason: "assignment already signed" }
            }
            AssignmentStatus::Declined => {
                ReconcileAction::Ignore { reason: "assignment already declined" }
            }
            _ => ReconcileAction::RecordDeclined,
        },
        ProviderEventStatus::Other(_) => ReconcileAction::Ignore { reason: "unhandled status" },
    }
}

/// The owning solicitation closes once its last pending assignment
/// resolves.
pub fn should_finalize(remaining_pending_assignments: u64) -> bool {
    remaining_pending_assignments == 0
}

/// Content hash stamped next to the audit-trail URL.
pub fn sha256_hex(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Artifact storage port for completion certificates.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn store(&self, name: &str, bytes: &[u8]) -> Result<String, String>;
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::domain::directory::UserId;
    use crate::domain::document::{
        AssignmentId, AssignmentStatus, DocumentAssignment, DocumentId,
    };

    use super::{plan_reconcile, sha256_hex, should_finalize, ProviderEventStatus, ReconcileAction};

    fn assignment(status: AssignmentStatus) -> DocumentAssignment {
        DocumentAssignment {
            id: AssignmentId("ASG-1".to_string()),
            document_id: DocumentId("DOC-1".to_string()),
            signer_id: UserId("u-1".to_string()),
            signer_email: "ana@example.com".to_string(),
            status,
            provider: "assinatura-digital".to_string(),
            external_id: Some("env-123".to_string()),
            signing_url: None,
            audit_trail_url: None,
            audit_trail_hash: None,
            signed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn completed_event_signs_a_pending_assignment() {
        let action = plan_reconcile(
            &assignment(AssignmentStatus::AwaitingSignature),
            &ProviderEventStatus::Completed,
            false,
        );
        assert_eq!(action, ReconcileAction::RecordSigned);
    }

    #[test]
    fn duplicate_completed_event_is_ignored() {
        let action = plan_reconcile(
            &assignment(AssignmentStatus::Signed),
            &ProviderEventStatus::Completed,
            false,
        );
        assert_eq!(action, ReconcileAction::Ignore { reason: "assignment already signed" });
    }

    #[test]
    fn replayed_event_id_is_ignored_before_any_state_check() {
        let action = plan_reconcile(
            &assignment(AssignmentStatus::AwaitingSignature),
            &ProviderEventStatus::Completed,
            true,
        );
        assert_eq!(action, ReconcileAction::Ignore { reason: "event already processed" });
    }

    #[test]
    fn late_decline_never_reverses_a_signed_assignment() {
        for status in [ProviderEventStatus::Declined, ProviderEventStatus::Voided] {
            let action = plan_reconcile(&assignment(AssignmentStatus::Signed), &status, false);
            assert_eq!(action, ReconcileAction::Ignore { reason: "assignment already signed" });
        }
    }

    #[test]
    fn decline_applies_to_non_terminal_assignments() {
        let action = plan_reconcile(
            &assignment(AssignmentStatus::AwaitingSignature),
            &ProviderEventStatus::Declined,
            false,
        );
        assert_eq!(action, ReconcileAction::RecordDeclined);
    }

    #[test]
    fn unknown_statuses_are_acknowledged_and_ignored() {
        let action = plan_reconcile(
            &assignment(AssignmentStatus::AwaitingSignature),
            &ProviderEventStatus::parse("delivered"),
            false,
        );
        assert_eq!(action, ReconcileAction::Ignore { reason: "unhandled status" });
    }

    #[test]
    fn provider_status_aliases_normalize() {
        assert_eq!(ProviderEventStatus::parse("SIGNED"), ProviderEventStatus::Completed);
        assert_eq!(ProviderEventStatus::parse("refused"), ProviderEventStatus::Declined);
        assert_eq!(ProviderEventStatus::parse("cancelled"), ProviderEventStatus::Voided);
    }

    #[test]
    fn finalize_only_when_no_assignment_remains_pending() {
        assert!(should_finalize(0));
        assert!(!should_finalize(1));
    }

    #[test]
    fn content_hash_is_stable_hex() {
        let hash = sha256_hex(b"certificado");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, sha256_hex(b"certificado"));
        assert_ne!(hash, sha256_hex(b"outro"));
    }
}
