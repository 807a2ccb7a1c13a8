use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::directory::UserId;
use crate::domain::solicitation::SolicitationId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssignmentId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Pending,
    AwaitingSignature,
    Signed,
    Declined,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AwaitingSignature => "awaiting_signature",
            Self::Signed => "signed",
            Self::Declined => "declined",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "awaiting_signature" => Some(Self::AwaitingSignature),
            "signed" => Some(Self::Signed),
            "declined" => Some(Self::Declined),
            _ => None,
        }
    }

    /// Terminal states are never reversed, regardless of event order.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Signed | Self::Declined)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub solicitation_id: Option<SolicitationId>,
    pub title: String,
    pub file_url: String,
    pub created_at: DateTime<Utc>,
}

/// Binds one signer to one document. The provider-side envelope id is
/// immutable once set; re-signing requires a fresh assignment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentAssignment {
    pub id: AssignmentId,
    pub document_id: DocumentId,
    pub signer_id: UserId,
    pub signer_email: String,
    pub status: AssignmentStatus,
    pub provider: String,
    pub external_id: Option<String>,
    pub signing_url: Option<String>,
    pub audit_trail_url: Option<String>,
    pub audit_trail_hash: Option<String>,
    pub signed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
