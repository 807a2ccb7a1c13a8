use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::directory::UserId;
use crate::domain::solicitation::SolicitationId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimelineEntryId(pub String);

/// Human-readable history line shown on the solicitation detail page.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub id: TimelineEntryId,
    pub solicitation_id: SolicitationId,
    pub message: String,
    pub actor_id: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}
