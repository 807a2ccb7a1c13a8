use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use tramita_core::domain::directory::{CostCenterId, DepartmentId, UserId};
use tramita_core::domain::document::{AssignmentId, AssignmentStatus, Document, DocumentAssignment, DocumentId};
use tramita_core::domain::solicitation::{
    ApprovalDecision, ApprovalState, Solicitation, SolicitationId, SolicitationStatus,
};
use tramita_core::domain::workflow::StepKey;

use super::{
    DocumentRepository, ProcessedEventRepository, RepositoryError, SolicitationRepository,
};

/// In-memory fakes mirroring the SQL repositories' guard semantics, for
/// tests that do not want a pool.
#[derive(Default)]
pub struct InMemorySolicitationRepository {
    records: RwLock<HashMap<String, Solicitation>>,
}

#[async_trait::async_trait]
impl SolicitationRepository for InMemorySolicitationRepository {
    async fn find_by_id(
        &self,
        id: &SolicitationId,
    ) -> Result<Option<Solicitation>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.get(&id.0).cloned())
    }

    async fn save(&self, solicitation: Solicitation) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        records.insert(solicitation.id.0.clone(), solicitation);
        Ok(())
    }

    async fn save_payload(
        &self,
        id: &SolicitationId,
        payload: &Value,
    ) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&id.0) {
            record.payload = payload.clone();
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_decision(
        &self,
        id: &SolicitationId,
        decision: &ApprovalDecision,
        new_approval: ApprovalState,
        new_status: SolicitationStatus,
        closed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, RepositoryError> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&id.0) else {
            return Ok(false);
        };
        if record.approval != ApprovalState::Pending {
            return Ok(false);
        }
        record.approval = new_approval;
        record.status = new_status;
        record.decision = Some(decision.clone());
        record.closed_at = closed_at;
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_route(
        &self,
        id: &SolicitationId,
        department_id: Option<&DepartmentId>,
        cost_center_id: Option<&CostCenterId>,
        step_key: Option<&StepKey>,
    ) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&id.0) {
            record.department_id = department_id.cloned();
            if cost_center_id.is_some() {
                record.cost_center_id = cost_center_id.cloned();
            }
            record.current_step_key = step_key.cloned();
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn close_if_open(
        &self,
        id: &SolicitationId,
        closed_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&id.0) else {
            return Ok(false);
        };
        if record.is_terminal() {
            return Ok(false);
        }
        record.status = SolicitationStatus::Closed;
        record.closed_at = Some(closed_at);
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn require_approval(
        &self,
        id: &SolicitationId,
        approver_id: &UserId,
    ) -> Result<bool, RepositoryError> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&id.0) else {
            return Ok(false);
        };
        if record.is_terminal() {
            return Ok(false);
        }
        record.requires_approval = true;
        record.approval = ApprovalState::Pending;
        record.status = SolicitationStatus::AwaitingApproval;
        record.approver_id = Some(approver_id.clone());
        record.updated_at = Utc::now();
        Ok(true)
    }
}

#[derive(Default)]
pub struct InMemoryDocumentRepository {
    documents: RwLock<HashMap<String, Document>>,
    assignments: RwLock<HashMap<String, DocumentAssignment>>,
}

#[async_trait::async_trait]
impl DocumentRepository for InMemoryDocumentRepository {
    async fn find_document(&self, id: &DocumentId) -> Result<Option<Document>, RepositoryError> {
        let documents = self.documents.read().await;
        Ok(documents.get(&id.0).cloned())
    }

    async fn save_document(&self, document: Document) -> Result<(), RepositoryError> {
        let mut documents = self.documents.write().await;
        documents.insert(document.id.0.clone(), document);
        Ok(())
    }

    async fn find_assignment_by_id(
        &self,
        id: &AssignmentId,
    ) -> Result<Option<DocumentAssignment>, RepositoryError> {
        let assignments = self.assignments.read().await;
        Ok(assignments.get(&id.0).cloned())
    }

    async fn find_assignment_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<DocumentAssignment>, RepositoryError> {
        let assignments = self.assignments.read().await;
        Ok(assignments
            .values()
            .find(|assignment| assignment.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn save_assignment(
        &self,
        assignment: DocumentAssignment,
    ) -> Result<(), RepositoryError> {
        let mut assignments = self.assignments.write().await;
        if let Some(external_id) = assignment.external_id.as_deref() {
            let duplicate = assignments.values().any(|existing| {
                existing.id != assignment.id
                    && existing.external_id.as_deref() == Some(external_id)
            });
            if duplicate {
                return Err(RepositoryError::Decode(format!(
                    "duplicate external id `{external_id}`"
                )));
            }
        }
        assignments.insert(assignment.id.0.clone(), assignment);
        Ok(())
    }

    async fn pending_assignments_for_solicitation(
        &self,
        solicitation_id: &SolicitationId,
    ) -> Result<u64, RepositoryError> {
        let documents = self.documents.read().await;
        let owned: HashSet<&str> = documents
            .values()
            .filter(|document| document.solicitation_id.as_ref() == Some(solicitation_id))
            .map(|document| document.id.0.as_str())
            .collect();

        let assignments = self.assignments.read().await;
        Ok(assignments
            .values()
            .filter(|assignment| owned.contains(assignment.document_id.0.as_str()))
            .filter(|assignment| !assignment.status.is_terminal())
            .count() as u64)
    }

    async fn mark_signed_if_pending(
        &self,
        id: &AssignmentId,
        signed_at: DateTime<Utc>,
        audit_trail_url: &str,
        audit_trail_hash: &str,
    ) -> Result<bool, RepositoryError> {
        let mut assignments = self.assignments.write().await;
        let Some(assignment) = assignments.get_mut(&id.0) else {
            return Ok(false);
        };
        if assignment.status.is_terminal() {
            return Ok(false);
        }
        assignment.status = AssignmentStatus::Signed;
        assignment.signed_at = Some(signed_at);
        assignment.audit_trail_url = Some(audit_trail_url.to_string());
        assignment.audit_trail_hash = Some(audit_trail_hash.to_string());
        assignment.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_declined_if_pending(&self, id: &AssignmentId) -> Result<bool, RepositoryError> {
        let mut assignments = self.assignments.write().await;
        let Some(assignment) = assignments.get_mut(&id.0) else {
            return Ok(false);
        };
        if assignment.status.is_terminal() {
            return Ok(false);
        }
        assignment.status = AssignmentStatus::Declined;
        assignment.updated_at = Utc::now();
        Ok(true)
    }
}

#[derive(Default)]
pub struct InMemoryProcessedEventRepository {
    event_ids: RwLock<HashSet<String>>,
}

#[async_trait::async_trait]
impl ProcessedEventRepository for InMemoryProcessedEventRepository {
    async fn exists(&self, event_id: &str) -> Result<bool, RepositoryError> {
        let event_ids = self.event_ids.read().await;
        Ok(event_ids.contains(event_id))
    }

    async fn insert_if_absent(
        &self,
        event_id: &str,
        _envelope_id: &str,
        _status: &str,
    ) -> Result<bool, RepositoryError> {
        let mut event_ids = self.event_ids.write().await;
        Ok(event_ids.insert(event_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use tramita_core::access::AccessLevel;
    use tramita_core::domain::directory::UserId;
    use tramita_core::domain::solicitation::{
        ApprovalDecision, ApprovalState, Solicitation, SolicitationId, SolicitationStatus,
    };

    use crate::repositories::{
        InMemoryProcessedEventRepository, InMemorySolicitationRepository,
        ProcessedEventRepository, SolicitationRepository,
    };

    fn sample(approval: ApprovalState) -> Solicitation {
        let now = Utc::now();
        Solicitation {
            id: SolicitationId("SOL-1".to_string()),
            protocol: "2026-000001".to_string(),
            type_key: "epi".to_string(),
            payload: json!({}),
            status: SolicitationStatus::AwaitingApproval,
            requires_approval: true,
            approval,
            approver_id: None,
            department_id: None,
            current_step_key: None,
            cost_center_id: None,
            parent_id: None,
            requester_id: UserId("u-1".to_string()),
            requester_name: "Ana".to_string(),
            decision: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
        }
    }

    #[tokio::test]
    async fn in_memory_decision_guard_matches_sql_semantics() {
        let repo = InMemorySolicitationRepository::default();
        repo.save(sample(ApprovalState::Pending)).await.expect("save");

        let decision = ApprovalDecision {
            approved: true,
            comment: None,
            decided_by: UserId("u-chefe".to_string()),
            decided_at: Utc::now(),
            decided_at_level: Some(AccessLevel::Nivel2),
        };

        let id = SolicitationId("SOL-1".to_string());
        assert!(repo
            .record_decision(&id, &decision, ApprovalState::Approved, SolicitationStatus::Open, None)
            .await
            .expect("first"));
        assert!(!repo
            .record_decision(&id, &decision, ApprovalState::Approved, SolicitationStatus::Open, None)
            .await
            .expect("second"));
    }

    #[tokio::test]
    async fn in_memory_event_ledger_is_single_use() {
        let repo = InMemoryProcessedEventRepository::default();
        assert!(repo.insert_if_absent("evt-1", "env-1", "completed").await.expect("first"));
        assert!(!repo.insert_if_absent("evt-1", "env-1", "completed").await.expect("replay"));
    }
}
