use thiserror::Error;

use crate::domain::solicitation::{ApprovalState, Solicitation};
use crate::domain::workflow::{StepKind, WorkflowDefinition, WorkflowStep};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("workflow for `{type_key}` has no approval step but approval is pending")]
    NoApprovalStep { type_key: String },
    #[error("workflow for `{type_key}` has no queue step")]
    NoQueueStep { type_key: String },
}

/// Resolves the step a solicitation currently sits in.
///
/// The persisted `current_step_key` is the source of truth whenever it
/// resolves against the active definition; the department-id lookup remains
/// only as a fallback for legacy rows routed before step keys were stamped.
pub fn current_step<'a>(
    solicitation: &Solicitation,
    definition: &'a WorkflowDefinition,
) -> Result<&'a WorkflowStep, RoutingError> {
    if let Some(key) = &solicitation.current_step_key {
        if let Some(step) = definition.step(key) {
            return Ok(step);
        }
    }

    if solicitation.approval == ApprovalState::Pending {
        return definition.approval_step().ok_or_else(|| RoutingError::NoApprovalStep {
            type_key: solicitation.type_key.clone(),
        });
    }

    let by_department = solicitation.department_id.as_ref().and_then(|department_id| {
        definition
            .queue_steps()
            .find(|step| step.department_id.as_ref() == Some(department_id))
    });

    by_department
        .or_else(|| definition.queue_steps().min_by_key(|step| step.position))
        .ok_or_else(|| RoutingError::NoQueueStep { type_key: solicitation.type_key.clone() })
}

/// Follows the first declared outgoing edge. Transition conditions are
/// stored for the diagram layer but not evaluated here.
pub fn next_step<'a>(
    current: &WorkflowStep,
    definition: &'a WorkflowDefinition,
) -> Option<&'a WorkflowStep> {
    definition
        .outgoing(&current.key)
        .next()
        .and_then(|transition| definition.step(&transition.to))
}

/// A queue step whose every outgoing edge lands on the end step is the last
/// actionable step: advancing from it closes the solicitation instead of
/// re-queueing it.
pub fn is_last_actionable(step: &WorkflowStep, definition: &WorkflowDefinition) -> bool {
    if step.kind != StepKind::Queue {
        return false;
    }
    let mut outgoing = definition.outgoing(&step.key).peekable();
    if outgoing.peek().is_none() {
        return false;
    }
    outgoing.all(|transition| {
        definition
            .step(&transition.to)
            .map(|target| target.kind == StepKind::End)
            .unwrap_or(false)
    })
}
