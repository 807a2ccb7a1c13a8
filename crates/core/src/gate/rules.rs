use serde::{Deserialize, Serialize};

use crate::access::normalize_key;
use crate::domain::directory::{CostCenterId, DepartmentId};

/// Where an approved solicitation goes next.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteTarget {
    Department { department_id: DepartmentId, cost_center_id: Option<CostCenterId> },
    /// The solicitation keeps its current queue; only side effects apply.
    Keep,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleEffect {
    SpawnLinkedCopy { department_id: DepartmentId },
    StampPayload { key: String, value: String },
}

/// One entry of the post-approval routing table. Adding a solicitation type
/// means adding a rule, not touching the gate's control flow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostApprovalRule {
    pub id: String,
    pub type_keys: Vec<String>,
    pub priority: i32,
    pub target: RouteTarget,
    pub effects: Vec<RuleEffect>,
}

impl PostApprovalRule {
    fn matches(&self, type_key: &str) -> bool {
        let key = normalize_key(type_key);
        self.type_keys.iter().any(|candidate| normalize_key(candidate) == key)
    }
}

#[derive(Clone, Debug, Default)]
pub struct RoutingRegistry {
    rules: Vec<PostApprovalRule>,
}

impl RoutingRegistry {
    pub fn new(mut rules: Vec<PostApprovalRule>) -> Self {
        rules.sort_by(|left, right| {
            left.priority.cmp(&right.priority).then_with(|| left.id.cmp(&right.id))
        });
        Self { rules }
    }

    /// First match in priority order wins.
    pub fn match_rule(&self, type_key: &str) -> Option<&PostApprovalRule> {
        self.rules.iter().find(|rule| rule.matches(type_key))
    }

    /// The rule set observed in production: personnel changes go to HR with
    /// its default cost center, vacation scheduling to payroll, fleet and
    /// PPE/uniform requests to logistics, terminations spawn a payroll copy
    /// while the original keeps its own queue.
    pub fn standard(departments: &StandardDepartments) -> Self {
        Self::new(vec![
            PostApprovalRule {
                id: "termination-payroll-copy".to_string(),
                type_keys: vec!["desligamento".to_string()],
                priority: 5,
                target: RouteTarget::Keep,
                effects: vec![RuleEffect::SpawnLinkedCopy {
                    department_id: departments.payroll.clone(),
                }],
            },
            PostApprovalRule {
                id: "personnel-change-hr".to_string(),
                type_keys: vec!["movimentacao_pessoal".to_string()],
                priority: 10,
                target: RouteTarget::Department {
                    department_id: departments.hr.clone(),
                    cost_center_id: departments.hr_cost_center.clone(),
                },
                effects: Vec::new(),
            },
            PostApprovalRule {
                id: "vacation-payroll".to_string(),
                type_keys: vec!["agendamento_ferias".to_string()],
                priority: 20,
                target: RouteTarget::Department {
                    department_id: departments.payroll.clone(),
                    cost_center_id: None,
                },
                effects: Vec::new(),
            },
            PostApprovalRule {
                id: "vehicle-logistics".to_string(),
                type_keys: vec!["uso_veiculo".to_string()],
                priority: 30,
                target: RouteTarget::Department {
                    department_id: departments.logistics.clone(),
                    cost_center_id: None,
                },
                effects: Vec::new(),
            },
            PostApprovalRule {
                id: "ppe-uniform-logistics".to_string(),
                type_keys: vec!["epi".to_string(), "uniforme".to_string()],
                priority: 30,
                target: RouteTarget::Department {
                    department_id: departments.logistics.clone(),
                    cost_center_id: None,
                },
                effects: vec![RuleEffect::StampPayload {
                    key: "centroResponsavel".to_string(),
                    value: "Logística".to_string(),
                }],
            },
        ])
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StandardDepartments {
    pub hr: DepartmentId,
    pub hr_cost_center: Option<CostCenterId>,
    pub payroll: DepartmentId,
    pub logistics: DepartmentId,
}

#[cfg(test)]
mod tests {
    use crate::domain::directory::{CostCenterId, DepartmentId};

    use super::{RouteTarget, RoutingRegistry, RuleEffect, StandardDepartments};

    fn departments() -> StandardDepartments {
        StandardDepartments {
            hr: DepartmentId("dep-rh".to_string()),
            hr_cost_center: Some(CostCenterId("cc-rh".to_string())),
            payroll: DepartmentId("dep-folha".to_string()),
            logistics: DepartmentId("dep-log".to_string()),
        }
    }

    #[test]
    fn personnel_change_routes_to_hr_with_default_cost_center() {
        let registry = RoutingRegistry::standard(&departments());
        let rule = registry.match_rule("movimentacao_pessoal").expect("rule");

        assert_eq!(
            rule.target,
            RouteTarget::Department {
                department_id: DepartmentId("dep-rh".to_string()),
                cost_center_id: Some(CostCenterId("cc-rh".to_string())),
            }
        );
    }

    #[test]
    fn ppe_and_uniform_share_the_logistics_rule_with_a_payload_stamp() {
        let registry = RoutingRegistry::standard(&departments());
        for type_key in ["epi", "uniforme", " EPI "] {
            let rule = registry.match_rule(type_key).expect("rule");
            assert_eq!(rule.id, "ppe-uniform-logistics");
            assert!(matches!(
                rule.effects.as_slice(),
                [RuleEffect::StampPayload { key, .. }] if key == "centroResponsavel"
            ));
        }
    }

    #[test]
    fn termination_keeps_its_queue_and_spawns_a_payroll_copy() {
        let registry = RoutingRegistry::standard(&departments());
        let rule = registry.match_rule("desligamento").expect("rule");

        assert_eq!(rule.target, RouteTarget::Keep);
        assert_eq!(
            rule.effects,
            vec![RuleEffect::SpawnLinkedCopy {
                department_id: DepartmentId("dep-folha".to_string())
            }]
        );
    }

    #[test]
    fn unmatched_types_have_no_post_approval_rule() {
        let registry = RoutingRegistry::standard(&departments());
        assert!(registry.match_rule("equipamento").is_none());
    }

    #[test]
    fn lower_priority_value_wins_when_rules_overlap() {
        let departments = departments();
        let mut rules = RoutingRegistry::standard(&departments).rules.clone();
        rules.push(super::PostApprovalRule {
            id: "override-ferias".to_string(),
            type_keys: vec!["agendamento_ferias".to_string()],
            priority: 1,
            target: RouteTarget::Keep,
            effects: Vec::new(),
        });

        let registry = RoutingRegistry::new(rules);
        assert_eq!(registry.match_rule("agendamento_ferias").unwrap().id, "override-ferias");
    }
}
