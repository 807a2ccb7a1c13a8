use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use tramita_core::audit::AuditEvent;
use tramita_core::domain::directory::{CostCenterId, Department, DepartmentId, User, UserId};
use tramita_core::domain::document::{
    AssignmentId, Document, DocumentAssignment, DocumentId,
};
use tramita_core::domain::equipment::{EquipmentItem, EquipmentItemId};
use tramita_core::domain::solicitation::{ApprovalDecision, Solicitation, SolicitationId};
use tramita_core::domain::timeline::TimelineEntry;
use tramita_core::domain::workflow::{StepKey, WorkflowDefinition};
use tramita_core::notify::DepartmentRecipient;
use tramita_core::{ApprovalState, SolicitationStatus};

pub mod directory;
pub mod document;
pub mod equipment;
pub mod memory;
pub mod processed_event;
pub mod solicitation;
pub mod timeline;
pub mod workflow;

pub use directory::SqlDirectoryRepository;
pub use document::SqlDocumentRepository;
pub use equipment::SqlEquipmentRepository;
pub use memory::{
    InMemoryDocumentRepository, InMemoryProcessedEventRepository, InMemorySolicitationRepository,
};
pub use processed_event::SqlProcessedEventRepository;
pub use solicitation::SqlSolicitationRepository;
pub use timeline::SqlTimelineRepository;
pub use workflow::SqlWorkflowDefinitionRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

#[async_trait]
pub trait SolicitationRepository: Send + Sync {
    async fn find_by_id(
        &self,
        id: &SolicitationId,
    ) -> Result<Option<Solicitation>, RepositoryError>;

    async fn save(&self, solicitation: Solicitation) -> Result<(), RepositoryError>;

    async fn save_payload(
        &self,
        id: &SolicitationId,
        payload: &Value,
    ) -> Result<(), RepositoryError>;

    /// Stamps the decision only while the record is still PENDING; returns
    /// whether the guard held. The loser of a decision race gets `false`.
    async fn record_decision(
        &self,
        id: &SolicitationId,
        decision: &ApprovalDecision,
        new_approval: ApprovalState,
        new_status: SolicitationStatus,
        closed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, RepositoryError>;

    async fn update_route(
        &self,
        id: &SolicitationId,
        department_id: Option<&DepartmentId>,
        cost_center_id: Option<&CostCenterId>,
        step_key: Option<&StepKey>,
    ) -> Result<(), RepositoryError>;

    /// Closes the record unless it is already terminal; returns whether the
    /// guard held.
    async fn close_if_open(
        &self,
        id: &SolicitationId,
        closed_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Flips a non-terminal record into the pending-approval state with an
    /// assigned approver; returns whether the guard held.
    async fn require_approval(
        &self,
        id: &SolicitationId,
        approver_id: &UserId,
    ) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait WorkflowDefinitionRepository: Send + Sync {
    async fn find_active(
        &self,
        type_key: &str,
        department_id: Option<&DepartmentId>,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError>;

    /// Persists the definition unless one already exists for the same
    /// (type, department) scope; returns whether a row was inserted.
    async fn insert_if_absent(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn find_document(&self, id: &DocumentId) -> Result<Option<Document>, RepositoryError>;

    async fn save_document(&self, document: Document) -> Result<(), RepositoryError>;

    async fn find_assignment_by_id(
        &self,
        id: &AssignmentId,
    ) -> Result<Option<DocumentAssignment>, RepositoryError>;

    async fn find_assignment_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<DocumentAssignment>, RepositoryError>;

    async fn save_assignment(&self, assignment: DocumentAssignment)
        -> Result<(), RepositoryError>;

    /// Non-terminal assignments still blocking the solicitation.
    async fn pending_assignments_for_solicitation(
        &self,
        solicitation_id: &SolicitationId,
    ) -> Result<u64, RepositoryError>;

    async fn mark_signed_if_pending(
        &self,
        id: &AssignmentId,
        signed_at: DateTime<Utc>,
        audit_trail_url: &str,
        audit_trail_hash: &str,
    ) -> Result<bool, RepositoryError>;

    async fn mark_declined_if_pending(&self, id: &AssignmentId) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait EquipmentRepository: Send + Sync {
    async fn find_by_id(
        &self,
        id: &EquipmentItemId,
    ) -> Result<Option<EquipmentItem>, RepositoryError>;

    async fn save(&self, item: EquipmentItem) -> Result<(), RepositoryError>;

    /// Assigns the item only while it is still IN_STOCK; returns whether
    /// the guard held.
    async fn allocate_if_in_stock(
        &self,
        id: &EquipmentItemId,
        owner_id: &UserId,
    ) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait DirectoryRepository: Send + Sync {
    async fn find_user(&self, id: &UserId) -> Result<Option<User>, RepositoryError>;

    async fn find_department(
        &self,
        id: &DepartmentId,
    ) -> Result<Option<Department>, RepositoryError>;

    async fn user_emails(&self, ids: &[UserId]) -> Result<Vec<String>, RepositoryError>;

    /// Active members of a department (direct or via secondary membership)
    /// together with their effective level for the given module.
    async fn department_recipients(
        &self,
        department_id: &DepartmentId,
        module_key: &str,
    ) -> Result<Vec<DepartmentRecipient>, RepositoryError>;
}

#[async_trait]
pub trait TimelineRepository: Send + Sync {
    async fn append(&self, entry: TimelineEntry) -> Result<(), RepositoryError>;

    async fn list_for_solicitation(
        &self,
        solicitation_id: &SolicitationId,
    ) -> Result<Vec<TimelineEntry>, RepositoryError>;

    async fn append_audit(&self, event: AuditEvent) -> Result<(), RepositoryError>;

    async fn list_audit_for_solicitation(
        &self,
        solicitation_id: &SolicitationId,
    ) -> Result<Vec<AuditEvent>, RepositoryError>;
}

#[async_trait]
pub trait ProcessedEventRepository: Send + Sync {
    async fn exists(&self, event_id: &str) -> Result<bool, RepositoryError>;

    /// Records the provider event id; returns `false` when a replay already
    /// claimed it.
    async fn insert_if_absent(
        &self,
        event_id: &str,
        envelope_id: &str,
        status: &str,
    ) -> Result<bool, RepositoryError>;
}
