pub mod access;
pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod gate;
pub mod notify;
pub mod reconcile;
pub mod routing;

pub use access::{AccessEvaluator, AccessLevel, ActorProfile, Directory, DirectoryError};
pub use domain::directory::{CostCenterId, Department, DepartmentId, Role, User, UserId};
pub use domain::document::{
    AssignmentId, AssignmentStatus, Document, DocumentAssignment, DocumentId,
};
pub use domain::equipment::{EquipmentItem, EquipmentItemId, EquipmentStatus};
pub use domain::solicitation::{
    ApprovalDecision, ApprovalState, Solicitation, SolicitationId, SolicitationStatus,
};
pub use domain::timeline::{TimelineEntry, TimelineEntryId};
pub use domain::workflow::{
    GraphValidationError, StepKey, StepKind, WorkflowDefinition, WorkflowDefinitionId,
    WorkflowStep, WorkflowTransition,
};
pub use errors::GateError;
pub use gate::{
    ActorContext, DecisionOutcome, GateAction, GateRequest, RoutingRegistry, StandardDepartments,
};
pub use notify::{DispatchPlan, Mailer, NotificationMarker, SendResult};
pub use reconcile::{BlobStore, ProviderEventStatus, ReconcileAction};
