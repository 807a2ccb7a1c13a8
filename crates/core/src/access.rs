use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::directory::{CostCenterId, DepartmentId, Role, User, UserId};

/// Ordinal authorization tier per module. Highest wins across
/// department-derived and explicitly granted levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Nivel1,
    Nivel2,
    Nivel3,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nivel1 => "nivel_1",
            Self::Nivel2 => "nivel_2",
            Self::Nivel3 => "nivel_3",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "nivel_1" => Some(Self::Nivel1),
            "nivel_2" => Some(Self::Nivel2),
            "nivel_3" => Some(Self::Nivel3),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("directory unavailable: {0}")]
pub struct DirectoryError(pub String);

/// Everything the evaluator needs about one actor, loaded once per inbound
/// operation. The snapshot doubles as the per-operation memo: every
/// `effective_level` call after the load is a pure in-memory lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActorProfile {
    pub user: User,
    pub department_ids: Vec<DepartmentId>,
    pub cost_center_ids: Vec<CostCenterId>,
    /// Union of module keys enabled on any department the actor belongs to.
    pub department_modules: Vec<String>,
    /// Explicit per-user grants; can only raise the derived level.
    pub grants: HashMap<String, AccessLevel>,
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn load_actor(&self, user_id: &UserId) -> Result<Option<ActorProfile>, DirectoryError>;
}

#[derive(Clone, Debug, Default)]
pub struct AccessEvaluator {
    profile: Option<ActorProfile>,
}

impl AccessEvaluator {
    /// Loads the actor's snapshot. Directory failure yields a deny-all
    /// evaluator: authorization stays fail-closed when the store is down.
    pub async fn for_actor(directory: &dyn Directory, user_id: &UserId) -> Self {
        match directory.load_actor(user_id).await {
            Ok(profile) => Self { profile },
            Err(_) => Self { profile: None },
        }
    }

    pub fn from_profile(profile: ActorProfile) -> Self {
        Self { profile: Some(profile) }
    }

    pub fn denied() -> Self {
        Self { profile: None }
    }

    pub fn profile(&self) -> Option<&ActorProfile> {
        self.profile.as_ref()
    }

    pub fn is_admin(&self) -> bool {
        self.profile
            .as_ref()
            .map(|profile| profile.user.active && profile.user.role == Role::Admin)
            .unwrap_or(false)
    }

    pub fn is_member_of(&self, department_id: &DepartmentId) -> bool {
        self.profile
            .as_ref()
            .map(|profile| profile.user.active && profile.department_ids.contains(department_id))
            .unwrap_or(false)
    }

    pub fn belongs_to_cost_center(&self, cost_center_id: &CostCenterId) -> bool {
        self.profile
            .as_ref()
            .map(|profile| profile.user.active && profile.cost_center_ids.contains(cost_center_id))
            .unwrap_or(false)
    }

    pub fn effective_level(&self, module_key: &str) -> Option<AccessLevel> {
        let profile = self.profile.as_ref()?;
        if !profile.user.active {
            return None;
        }
        if profile.user.role == Role::Admin {
            return Some(AccessLevel::Nivel3);
        }

        let key = normalize_key(module_key);
        let derived = profile
            .department_modules
            .iter()
            .any(|module| normalize_key(module) == key)
            .then_some(AccessLevel::Nivel1);
        let granted = profile.grants.get(&key).copied();

        match (derived, granted) {
            (Some(derived), Some(granted)) => Some(derived.max(granted)),
            (Some(level), None) | (None, Some(level)) => Some(level),
            (None, None) => None,
        }
    }
}

pub fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}
