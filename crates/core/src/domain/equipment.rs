use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::directory::UserId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EquipmentItemId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquipmentStatus {
    InStock,
    Assigned,
    Maintenance,
}

impl EquipmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InStock => "in_stock",
            Self::Assigned => "assigned",
            Self::Maintenance => "maintenance",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "in_stock" => Some(Self::InStock),
            "assigned" => Some(Self::Assigned),
            "maintenance" => Some(Self::Maintenance),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentItem {
    pub id: EquipmentItemId,
    pub label: String,
    pub status: EquipmentStatus,
    pub owner_id: Option<UserId>,
    pub updated_at: DateTime<Utc>,
}
