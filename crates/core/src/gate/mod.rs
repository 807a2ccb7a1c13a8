pub mod rules;

use chrono::{DateTime, Utc};

use crate::access::AccessLevel;
use crate::domain::directory::{CostCenterId, DepartmentId, UserId};
use crate::domain::equipment::{EquipmentItem, EquipmentStatus};
use crate::domain::solicitation::{
    ApprovalDecision, ApprovalState, Solicitation, SolicitationStatus,
};
use crate::domain::workflow::StepKind;
use crate::errors::{reasons, GateError};

pub use rules::{PostApprovalRule, RouteTarget, RoutingRegistry, RuleEffect, StandardDepartments};

pub const MODULE_SOLICITATIONS: &str = "solicitacoes";
pub const MIN_DECISION_LEVEL: AccessLevel = AccessLevel::Nivel2;

/// Payload key naming the responsible party a record may carry; matching
/// actors may decide regardless of module level.
pub const RESPONSIBLE_PARTY_KEY: &str = "responsavelId";
pub const INCENTIVE_TYPE_KEY: &str = "incentivo";

/// The acting user as seen by the gate: identity plus the already-evaluated
/// effective level for the solicitations module at the relevant department.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActorContext {
    pub user_id: UserId,
    pub name: String,
    pub is_admin: bool,
    pub level: Option<AccessLevel>,
    pub department_ids: Vec<DepartmentId>,
    pub cost_center_ids: Vec<CostCenterId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateRequest {
    Approve { comment: Option<String> },
    Reject { comment: String },
}

/// Follow-up work the caller must execute in the same transaction as the
/// decision write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateAction {
    RouteToDepartment {
        department_id: DepartmentId,
        cost_center_id: Option<CostCenterId>,
    },
    SpawnLinkedCopy {
        department_id: DepartmentId,
    },
    StampPayload {
        key: String,
        value: String,
    },
    NotifyStepEntry {
        prefer_kind: Option<StepKind>,
        department_id: Option<DepartmentId>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecisionOutcome {
    pub decision: ApprovalDecision,
    pub new_approval: ApprovalState,
    pub new_status: SolicitationStatus,
    pub closed_at: Option<DateTime<Utc>>,
    pub matched_rule_id: Option<String>,
    pub actions: Vec<GateAction>,
    pub timeline_message: String,
}

pub fn check_decidable(solicitation: &Solicitation) -> Result<(), GateError> {
    if solicitation.approval != ApprovalState::Pending {
        return Err(GateError::conflict(reasons::ALREADY_DECIDED));
    }
    Ok(())
}

pub fn authorize_decision(
    solicitation: &Solicitation,
    actor: &ActorContext,
) -> Result<(), GateError> {
    if actor.is_admin {
        return Ok(());
    }
    if actor.level.map(|level| level >= MIN_DECISION_LEVEL).unwrap_or(false) {
        return Ok(());
    }
    if solicitation.approver_id.as_ref() == Some(&actor.user_id) {
        return Ok(());
    }

    // Type-specific overrides: incentive requests may be decided by members
    // of the tied cost center, and any record may name a responsible party.
    if solicitation.type_key == INCENTIVE_TYPE_KEY {
        if let Some(cost_center_id) = &solicitation.cost_center_id {
            if actor.cost_center_ids.contains(cost_center_id) {
                return Ok(());
            }
        }
    }
    if solicitation.payload_str(RESPONSIBLE_PARTY_KEY) == Some(actor.user_id.0.as_str()) {
        return Ok(());
    }

    Err(GateError::forbidden(reasons::NO_PERMISSION))
}

/// Validates and stamps a decision without touching persistence. The caller
/// commits the returned outcome behind a guard on the still-PENDING state,
/// so a concurrent decider observes Conflict instead of overwriting.
pub fn decide(
    solicitation: &Solicitation,
    actor: &ActorContext,
    registry: &RoutingRegistry,
    request: &GateRequest,
    now: DateTime<Utc>,
) -> Result<DecisionOutcome, GateError> {
    check_decidable(solicitation)?;
    authorize_decision(solicitation, actor)?;

    match request {
        GateRequest::Approve { comment } => {
            let decision = ApprovalDecision {
                approved: true,
                comment: comment.as_deref().map(str::trim).filter(|c| !c.is_empty()).map(String::from),
                decided_by: actor.user_id.clone(),
                decided_at: now,
                decided_at_level: actor.level,
            };

            let rule = registry.match_rule(&solicitation.type_key);
            let mut actions = Vec::new();
            let mut routed_department = None;
            if let Some(rule) = rule {
                if let RouteTarget::Department { department_id, cost_center_id } = &rule.target {
                    routed_department = Some(department_id.clone());
                    actions.push(GateAction::RouteToDepartment {
                        department_id: department_id.clone(),
                        cost_center_id: cost_center_id.clone(),
                    });
                }
                for effect in &rule.effects {
                    actions.push(match effect {
                        RuleEffect::SpawnLinkedCopy { department_id } => {
                            GateAction::SpawnLinkedCopy { department_id: department_id.clone() }
                        }
                        RuleEffect::StampPayload { key, value } => GateAction::StampPayload {
                            key: key.clone(),
                            value: value.clone(),
                        },
                    });
                }
            }
            actions.push(GateAction::NotifyStepEntry {
                prefer_kind: None,
                department_id: routed_department.or_else(|| solicitation.department_id.clone()),
            });

            Ok(DecisionOutcome {
                decision,
                new_approval: ApprovalState::Approved,
                new_status: SolicitationStatus::Open,
                closed_at: None,
                matched_rule_id: rule.map(|rule| rule.id.clone()),
                actions,
                timeline_message: format!("Solicitação aprovada por {}", actor.name),
            })
        }
        GateRequest::Reject { comment } => {
            let comment = comment.trim();
            if comment.is_empty() {
                return Err(GateError::invalid_input(reasons::COMMENT_REQUIRED));
            }

            Ok(DecisionOutcome {
                decision: ApprovalDecision {
                    approved: false,
                    comment: Some(comment.to_string()),
                    decided_by: actor.user_id.clone(),
                    decided_at: now,
                    decided_at_level: actor.level,
                },
                new_approval: ApprovalState::Rejected,
                new_status: SolicitationStatus::Closed,
                closed_at: Some(now),
                matched_rule_id: None,
                actions: Vec::new(),
                timeline_message: format!("Solicitação rejeitada por {}", actor.name),
            })
        }
    }
}

pub fn check_finalizable(solicitation: &Solicitation) -> Result<(), GateError> {
    if solicitation.is_terminal() {
        return Err(GateError::conflict(reasons::ALREADY_CLOSED));
    }
    Ok(())
}

/// Actor-initiated finalize requires membership in the holding department;
/// system-initiated finalize (signature reconciliation) skips that check.
pub fn authorize_finalize(
    actor: Option<&ActorContext>,
    holding_department: Option<&DepartmentId>,
) -> Result<(), GateError> {
    let Some(actor) = actor else {
        return Ok(());
    };
    if actor.is_admin {
        return Ok(());
    }
    match holding_department {
        Some(department_id) if actor.department_ids.contains(department_id) => Ok(()),
        _ => Err(GateError::forbidden(reasons::NOT_HOLDING_DEPARTMENT)),
    }
}

pub fn check_allocatable(item: &EquipmentItem) -> Result<(), GateError> {
    if item.status != EquipmentStatus::InStock {
        return Err(GateError::conflict(reasons::ITEM_NOT_IN_STOCK));
    }
    Ok(())
}
