use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::access::AccessLevel;
use crate::domain::directory::{DepartmentId, UserId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepKey(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowDefinitionId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Queue,
    Approval,
    End,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Approval => "approval",
            Self::End => "end",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queue" => Some(Self::Queue),
            "approval" => Some(Self::Approval),
            "end" => Some(Self::End),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub key: StepKey,
    pub label: String,
    pub kind: StepKind,
    pub department_id: Option<DepartmentId>,
    pub approver_ids: Vec<UserId>,
    pub required_level: AccessLevel,
    pub notify_subject: Option<String>,
    pub notify_body: Option<String>,
    pub extra_recipients: Vec<String>,
    pub position: u32,
}

/// Directed edge between two steps. The optional condition is authored by
/// the diagram layer and stored verbatim; routing takes the first declared
/// edge and never evaluates conditions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTransition {
    pub from: StepKey,
    pub to: StepKey,
    pub condition: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowDefinitionId,
    pub type_key: String,
    pub department_id: Option<DepartmentId>,
    pub active: bool,
    pub steps: Vec<WorkflowStep>,
    pub transitions: Vec<WorkflowTransition>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GraphValidationError {
    #[error("workflow definition has no steps")]
    EmptyDefinition,
    #[error("duplicate step key `{key}`")]
    DuplicateStepKey { key: String },
    #[error("workflow definition has no end step")]
    MissingEndStep,
    #[error("workflow definition has {count} end steps, expected exactly one")]
    MultipleEndSteps { count: usize },
    #[error("transition references unknown step `{key}`")]
    UnknownTransitionEndpoint { key: String },
    #[error("step `{key}` has no outgoing transition")]
    DeadEndStep { key: String },
    #[error("step `{key}` is unreachable from the first step")]
    UnreachableStep { key: String },
}

impl WorkflowDefinition {
    pub fn step(&self, key: &StepKey) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| &step.key == key)
    }

    /// Steps ordered by their authored position.
    pub fn first_step(&self) -> Option<&WorkflowStep> {
        self.steps.iter().min_by_key(|step| step.position)
    }

    pub fn end_step(&self) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.kind == StepKind::End)
    }

    pub fn approval_step(&self) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.kind == StepKind::Approval)
    }

    pub fn queue_steps(&self) -> impl Iterator<Item = &WorkflowStep> {
        self.steps.iter().filter(|step| step.kind == StepKind::Queue)
    }

    /// Outgoing transitions of a step, in declaration order.
    pub fn outgoing<'a>(
        &'a self,
        key: &'a StepKey,
    ) -> impl Iterator<Item = &'a WorkflowTransition> + 'a {
        self.transitions.iter().filter(move |transition| &transition.from == key)
    }

    pub fn validate(&self) -> Result<(), GraphValidationError> {
        if self.steps.is_empty() {
            return Err(GraphValidationError::EmptyDefinition);
        }

        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.key.0.as_str()) {
                return Err(GraphValidationError::DuplicateStepKey { key: step.key.0.clone() });
            }
        }

        let end_count = self.steps.iter().filter(|step| step.kind == StepKind::End).count();
        match end_count {
            0 => return Err(GraphValidationError::MissingEndStep),
            1 => {}
            count => return Err(GraphValidationError::MultipleEndSteps { count }),
        }

        for transition in &self.transitions {
            for key in [&transition.from, &transition.to] {
                if self.step(key).is_none() {
                    return Err(GraphValidationError::UnknownTransitionEndpoint {
                        key: key.0.clone(),
                    });
                }
            }
        }

        for step in &self.steps {
            if step.kind != StepKind::End && self.outgoing(&step.key).next().is_none() {
                return Err(GraphValidationError::DeadEndStep { key: step.key.0.clone() });
            }
        }

        let first = self.first_step().map(|step| step.key.clone());
        if let Some(first) = first {
            let mut reachable = std::collections::HashSet::new();
            let mut pending = vec![first];
            while let Some(key) = pending.pop() {
                if !reachable.insert(key.clone()) {
                    continue;
                }
                for transition in self.outgoing(&key) {
                    pending.push(transition.to.clone());
                }
            }
            for step in &self.steps {
                if !reachable.contains(&step.key) {
                    return Err(GraphValidationError::UnreachableStep {
                        key: step.key.0.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::access::AccessLevel;
    use crate::domain::directory::DepartmentId;

    use super::{
        GraphValidationError, StepKey, StepKind, WorkflowDefinition, WorkflowDefinitionId,
        WorkflowStep, WorkflowTransition,
    };

    fn step(key: &str, kind: StepKind, position: u32) -> WorkflowStep {
        WorkflowStep {
            key: StepKey(key.to_string()),
            label: key.to_string(),
            kind,
            department_id: Some(DepartmentId(format!("dep-{key}"))),
            approver_ids: Vec::new(),
            required_level: AccessLevel::Nivel1,
            notify_subject: None,
            notify_body: None,
            extra_recipients: Vec::new(),
            position,
        }
    }

    fn edge(from: &str, to: &str) -> WorkflowTransition {
        WorkflowTransition {
            from: StepKey(from.to_string()),
            to: StepKey(to.to_string()),
            condition: None,
        }
    }

    fn linear_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: WorkflowDefinitionId("WF-1".to_string()),
            type_key: "equipamento".to_string(),
            department_id: None,
            active: true,
            steps: vec![
                step("origem", StepKind::Queue, 0),
                step("aprovadores", StepKind::Approval, 1),
                step("destino", StepKind::Queue, 2),
                step("fim", StepKind::End, 3),
            ],
            transitions: vec![
                edge("origem", "aprovadores"),
                edge("aprovadores", "destino"),
                edge("destino", "fim"),
            ],
        }
    }

    #[test]
    fn valid_linear_definition_passes_validation() {
        assert_eq!(linear_definition().validate(), Ok(()));
    }

    #[test]
    fn duplicate_step_keys_are_rejected() {
        let mut definition = linear_definition();
        definition.steps.push(step("origem", StepKind::Queue, 9));

        assert_eq!(
            definition.validate(),
            Err(GraphValidationError::DuplicateStepKey { key: "origem".to_string() })
        );
    }

    #[test]
    fn exactly_one_end_step_is_required() {
        let mut definition = linear_definition();
        definition.steps.retain(|step| step.kind != StepKind::End);
        definition.transitions.retain(|transition| transition.to.0 != "fim");
        definition.transitions.push(edge("destino", "origem"));
        assert_eq!(definition.validate(), Err(GraphValidationError::MissingEndStep));

        let mut definition = linear_definition();
        definition.steps.push(step("fim2", StepKind::End, 9));
        definition.transitions.push(edge("destino", "fim2"));
        assert_eq!(
            definition.validate(),
            Err(GraphValidationError::MultipleEndSteps { count: 2 })
        );
    }

    #[test]
    fn transitions_must_reference_existing_steps() {
        let mut definition = linear_definition();
        definition.transitions.push(edge("destino", "nada"));

        assert_eq!(
            definition.validate(),
            Err(GraphValidationError::UnknownTransitionEndpoint { key: "nada".to_string() })
        );
    }

    #[test]
    fn non_end_steps_need_an_outgoing_transition() {
        let mut definition = linear_definition();
        definition.transitions.retain(|transition| transition.from.0 != "destino");

        assert_eq!(
            definition.validate(),
            Err(GraphValidationError::DeadEndStep { key: "destino".to_string() })
        );
    }

    #[test]
    fn steps_outside_the_reachable_graph_are_rejected() {
        let mut definition = linear_definition();
        definition.steps.push(step("ilha", StepKind::Queue, 9));
        definition.transitions.push(edge("ilha", "fim"));

        assert_eq!(
            definition.validate(),
            Err(GraphValidationError::UnreachableStep { key: "ilha".to_string() })
        );
    }

    #[test]
    fn conditions_are_stored_verbatim() {
        let mut definition = linear_definition();
        definition.transitions[0].condition = Some(json!({"field": "valor", "gte": 10}));

        assert_eq!(definition.validate(), Ok(()));
        let origem = StepKey("origem".to_string());
        let stored = definition.outgoing(&origem).next().unwrap();
        assert!(stored.condition.is_some());
    }
}
