use thiserror::Error;

/// Engine error taxonomy. Conflict and Forbidden carry a stable,
/// human-readable reason so callers can distinguish "already decided" from
/// "no permission" without string matching on debug output.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error("conflict: {reason}")]
    Conflict { reason: String },
    #[error("forbidden: {reason}")]
    Forbidden { reason: String },
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("{service} unavailable: {message}")]
    ExternalUnavailable { service: &'static str, message: String },
    #[error("integrity violation: {message}")]
    IntegrityViolation { message: String },
}

impl GateError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict { reason: reason.into() }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden { reason: reason.into() }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput { message: message.into() }
    }

    pub fn unavailable(service: &'static str, message: impl Into<String>) -> Self {
        Self::ExternalUnavailable { service, message: message.into() }
    }

    /// Stable reason string surfaced to callers.
    pub fn reason(&self) -> String {
        match self {
            Self::NotFound { entity, id } => format!("{entity} `{id}` not found"),
            Self::Conflict { reason } | Self::Forbidden { reason } => reason.clone(),
            Self::InvalidInput { message } => message.clone(),
            Self::ExternalUnavailable { service, .. } => {
                format!("{service} is temporarily unavailable")
            }
            Self::IntegrityViolation { .. } => "an internal integrity error occurred".to_string(),
        }
    }
}

pub mod reasons {
    pub const ALREADY_DECIDED: &str = "already decided";
    pub const ALREADY_CLOSED: &str = "already closed";
    pub const ITEM_NOT_IN_STOCK: &str = "item not in stock";
    pub const NO_PERMISSION: &str = "no permission";
    pub const NOT_HOLDING_DEPARTMENT: &str = "not a member of the holding department";
    pub const NOT_FINAL_STEP: &str = "not at the final workflow step";
    pub const COMMENT_REQUIRED: &str = "a comment is required to reject";
}
