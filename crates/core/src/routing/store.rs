use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::access::AccessLevel;
use crate::domain::directory::DepartmentId;
use crate::domain::workflow::{
    GraphValidationError, StepKey, StepKind, WorkflowDefinition, WorkflowDefinitionId,
    WorkflowStep, WorkflowTransition,
};

pub const STEP_ORIGIN: &str = "origem";
pub const STEP_APPROVERS: &str = "aprovadores";
pub const STEP_DESTINATION: &str = "destino";
pub const STEP_END: &str = "fim";

/// Persistence port for workflow definitions. Lookups never mutate;
/// `insert_if_absent` must be a no-op when a fallback definition for the
/// type already exists, so the synthesized default is created at most once.
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    async fn find_active(
        &self,
        type_key: &str,
        department_id: Option<&DepartmentId>,
    ) -> Result<Option<WorkflowDefinition>, String>;

    async fn insert_if_absent(&self, definition: &WorkflowDefinition) -> Result<(), String>;
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("workflow definition source failed: {0}")]
    Source(String),
    #[error(transparent)]
    Invalid(#[from] GraphValidationError),
}

pub struct DefinitionStore<S> {
    source: S,
}

impl<S> DefinitionStore<S>
where
    S: DefinitionSource,
{
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// Resolution order: exact (type, department) match, then the
    /// department-less fallback, then a synthesized default linear graph
    /// that is persisted before being returned.
    pub async fn definition_for(
        &self,
        type_key: &str,
        department_id: Option<&DepartmentId>,
    ) -> Result<WorkflowDefinition, DefinitionError> {
        if let Some(department_id) = department_id {
            if let Some(definition) = self
                .source
                .find_active(type_key, Some(department_id))
                .await
                .map_err(DefinitionError::Source)?
            {
                return Ok(definition);
            }
        }

        if let Some(definition) =
            self.source.find_active(type_key, None).await.map_err(DefinitionError::Source)?
        {
            return Ok(definition);
        }

        let definition = default_definition(type_key);
        definition.validate()?;
        self.source.insert_if_absent(&definition).await.map_err(DefinitionError::Source)?;

        // Re-read so concurrent synthesizers converge on the persisted row.
        match self.source.find_active(type_key, None).await.map_err(DefinitionError::Source)? {
            Some(persisted) => Ok(persisted),
            None => Ok(definition),
        }
    }

    pub async fn save(&self, definition: &WorkflowDefinition) -> Result<(), DefinitionError> {
        definition.validate()?;
        self.source.insert_if_absent(definition).await.map_err(DefinitionError::Source)
    }
}

/// The default graph used when a type is routed before anyone configured
/// it: origin queue -> approvers -> destination queue -> end.
pub fn default_definition(type_key: &str) -> WorkflowDefinition {
    let step = |key: &str, label: &str, kind: StepKind, position: u32| WorkflowStep {
        key: StepKey(key.to_string()),
        label: label.to_string(),
        kind,
        department_id: None,
        approver_ids: Vec::new(),
        required_level: AccessLevel::Nivel1,
        notify_subject: None,
        notify_body: None,
        extra_recipients: Vec::new(),
        position,
    };
    let edge = |from: &str, to: &str| WorkflowTransition {
        from: StepKey(from.to_string()),
        to: StepKey(to.to_string()),
        condition: None,
    };

    WorkflowDefinition {
        id: WorkflowDefinitionId(format!("WF-{}", Uuid::new_v4().simple())),
        type_key: type_key.to_string(),
        department_id: None,
        active: true,
        steps: vec![
            step(STEP_ORIGIN, "Fila de origem", StepKind::Queue, 0),
            step(STEP_APPROVERS, "Aprovadores", StepKind::Approval, 1),
            step(STEP_DESTINATION, "Fila de destino", StepKind::Queue, 2),
            step(STEP_END, "Encerrado", StepKind::End, 3),
        ],
        transitions: vec![
            edge(STEP_ORIGIN, STEP_APPROVERS),
            edge(STEP_APPROVERS, STEP_DESTINATION),
            edge(STEP_DESTINATION, STEP_END),
        ],
    }
}
