use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::access::AccessLevel;
use crate::domain::directory::{CostCenterId, DepartmentId, UserId};
use crate::domain::workflow::StepKey;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SolicitationId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolicitationStatus {
    Open,
    AwaitingApproval,
    AwaitingTerm,
    Closed,
    Cancelled,
}

impl SolicitationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::AwaitingApproval => "awaiting_approval",
            Self::AwaitingTerm => "awaiting_term",
            Self::Closed => "closed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "open" => Some(Self::Open),
            "awaiting_approval" => Some(Self::AwaitingApproval),
            "awaiting_term" => Some(Self::AwaitingTerm),
            "closed" => Some(Self::Closed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    NotRequired,
    Pending,
    Approved,
    Rejected,
}

impl ApprovalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRequired => "not_required",
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "not_required" => Some(Self::NotRequired),
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Decision metadata stamped on the solicitation while PENDING. Recordable
/// at most once; the persistence layer guards the transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub comment: Option<String>,
    pub decided_by: UserId,
    pub decided_at: DateTime<Utc>,
    pub decided_at_level: Option<AccessLevel>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Solicitation {
    pub id: SolicitationId,
    pub protocol: String,
    pub type_key: String,
    pub payload: Value,
    pub status: SolicitationStatus,
    pub requires_approval: bool,
    pub approval: ApprovalState,
    pub approver_id: Option<UserId>,
    pub department_id: Option<DepartmentId>,
    pub current_step_key: Option<StepKey>,
    pub cost_center_id: Option<CostCenterId>,
    pub parent_id: Option<SolicitationId>,
    pub requester_id: UserId,
    pub requester_name: String,
    pub decision: Option<ApprovalDecision>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Solicitation {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Payload field naming follows the intake forms, so lookups go through
    /// one accessor instead of scattering key literals.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::{ApprovalState, SolicitationStatus};

    #[test]
    fn status_round_trips_from_storage_encoding() {
        let cases = [
            SolicitationStatus::Open,
            SolicitationStatus::AwaitingApproval,
            SolicitationStatus::AwaitingTerm,
            SolicitationStatus::Closed,
            SolicitationStatus::Cancelled,
        ];

        for status in cases {
            assert_eq!(SolicitationStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn approval_state_round_trips_from_storage_encoding() {
        let cases = [
            ApprovalState::NotRequired,
            ApprovalState::Pending,
            ApprovalState::Approved,
            ApprovalState::Rejected,
        ];

        for state in cases {
            assert_eq!(ApprovalState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn only_closed_and_cancelled_are_terminal() {
        assert!(SolicitationStatus::Closed.is_terminal());
        assert!(SolicitationStatus::Cancelled.is_terminal());
        assert!(!SolicitationStatus::Open.is_terminal());
        assert!(!SolicitationStatus::AwaitingApproval.is_terminal());
        assert!(!SolicitationStatus::AwaitingTerm.is_terminal());
    }
}
