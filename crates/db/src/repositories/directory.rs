use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::Row;

use tramita_core::access::{AccessLevel, ActorProfile, Directory, DirectoryError};
use tramita_core::domain::directory::{
    CostCenterId, Department, DepartmentId, Role, User, UserId,
};
use tramita_core::notify::DepartmentRecipient;

use super::{DirectoryRepository, RepositoryError};
use crate::DbPool;

pub struct SqlDirectoryRepository {
    pool: DbPool,
}

impl SqlDirectoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn decode<E: std::fmt::Display>(error: E) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> Result<User, RepositoryError> {
    let id: String = row.try_get("id").map_err(decode)?;
    let name: String = row.try_get("name").map_err(decode)?;
    let email: String = row.try_get("email").map_err(decode)?;
    let role_raw: String = row.try_get("role").map_err(decode)?;
    let active: i64 = row.try_get("active").map_err(decode)?;
    let department_id: Option<String> = row.try_get("department_id").map_err(decode)?;

    Ok(User {
        id: UserId(id),
        name,
        email,
        role: Role::parse(&role_raw)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown role `{role_raw}`")))?,
        active: active != 0,
        department_id: department_id.map(DepartmentId),
    })
}

#[async_trait]
impl DirectoryRepository for SqlDirectoryRepository {
    async fn find_user(&self, id: &UserId) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, name, email, role, active, department_id FROM app_user WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref row) => Ok(Some(row_to_user(row)?)),
            None => Ok(None),
        }
    }

    async fn find_department(
        &self,
        id: &DepartmentId,
    ) -> Result<Option<Department>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, name, default_cost_center_id FROM department WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: String = row.try_get("id").map_err(decode)?;
        let name: String = row.try_get("name").map_err(decode)?;
        let default_cost_center_id: Option<String> =
            row.try_get("default_cost_center_id").map_err(decode)?;

        let module_rows: Vec<sqlx::sqlite::SqliteRow> =
            sqlx::query("SELECT module_key FROM department_module WHERE department_id = ?")
                .bind(&id)
                .fetch_all(&self.pool)
                .await?;
        let module_keys = module_rows
            .iter()
            .map(|row| row.try_get::<String, _>("module_key").map_err(decode))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(Department {
            id: DepartmentId(id),
            name,
            default_cost_center_id: default_cost_center_id.map(CostCenterId),
            module_keys,
        }))
    }

    async fn user_emails(&self, ids: &[UserId]) -> Result<Vec<String>, RepositoryError> {
        let mut emails = Vec::with_capacity(ids.len());
        for id in ids {
            let row = sqlx::query("SELECT email FROM app_user WHERE id = ? AND active = 1")
                .bind(&id.0)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = row {
                emails.push(row.try_get::<String, _>("email").map_err(decode)?);
            }
        }
        Ok(emails)
    }

    async fn department_recipients(
        &self,
        department_id: &DepartmentId,
        module_key: &str,
    ) -> Result<Vec<DepartmentRecipient>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(
            "SELECT u.email, u.active, u.role,
                    (SELECT g.level FROM module_grant g
                      WHERE g.user_id = u.id AND g.module_key = ?) AS granted_level,
                    EXISTS(
                      SELECT 1 FROM department_module dm
                      WHERE dm.module_key = ?
                        AND (dm.department_id = u.department_id
                             OR dm.department_id IN (
                                 SELECT m.department_id FROM department_membership m
                                 WHERE m.user_id = u.id))
                    ) AS has_module
             FROM app_user u
             WHERE u.department_id = ?
                OR u.id IN (SELECT m2.user_id FROM department_membership m2
                            WHERE m2.department_id = ?)
             ORDER BY u.id ASC",
        )
        .bind(module_key)
        .bind(module_key)
        .bind(&department_id.0)
        .bind(&department_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let email: String = row.try_get("email").map_err(decode)?;
                let active: i64 = row.try_get("active").map_err(decode)?;
                let role_raw: String = row.try_get("role").map_err(decode)?;
                let granted_level: Option<String> = row.try_get("granted_level").map_err(decode)?;
                let has_module: i64 = row.try_get("has_module").map_err(decode)?;

                let derived = (has_module != 0).then_some(AccessLevel::Nivel1);
                let granted = granted_level.as_deref().and_then(AccessLevel::parse);
                let level = if Role::parse(&role_raw) == Some(Role::Admin) {
                    Some(AccessLevel::Nivel3)
                } else {
                    match (derived, granted) {
                        (Some(derived), Some(granted)) => Some(derived.max(granted)),
                        (Some(level), None) | (None, Some(level)) => Some(level),
                        (None, None) => None,
                    }
                };

                Ok(DepartmentRecipient { email, active: active != 0, level })
            })
            .collect()
    }
}

/// The access evaluator loads one actor's whole snapshot through this port.
#[async_trait]
impl Directory for SqlDirectoryRepository {
    async fn load_actor(&self, user_id: &UserId) -> Result<Option<ActorProfile>, DirectoryError> {
        let failed = |error: RepositoryError| DirectoryError(error.to_string());

        let Some(user) =
            self.find_user(user_id).await.map_err(failed)?
        else {
            return Ok(None);
        };

        let mut department_ids = Vec::new();
        if let Some(primary) = &user.department_id {
            department_ids.push(primary.clone());
        }
        let membership_rows: Vec<sqlx::sqlite::SqliteRow> =
            sqlx::query("SELECT department_id FROM department_membership WHERE user_id = ?")
                .bind(&user_id.0)
                .fetch_all(&self.pool)
                .await
                .map_err(|error| DirectoryError(error.to_string()))?;
        for row in &membership_rows {
            let id: String =
                row.try_get("department_id").map_err(|error| DirectoryError(error.to_string()))?;
            let id = DepartmentId(id);
            if !department_ids.contains(&id) {
                department_ids.push(id);
            }
        }

        let mut department_modules = Vec::new();
        for department_id in &department_ids {
            let module_rows: Vec<sqlx::sqlite::SqliteRow> =
                sqlx::query("SELECT module_key FROM department_module WHERE department_id = ?")
                    .bind(&department_id.0)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|error| DirectoryError(error.to_string()))?;
            for row in &module_rows {
                let module: String = row
                    .try_get("module_key")
                    .map_err(|error| DirectoryError(error.to_string()))?;
                if !department_modules.contains(&module) {
                    department_modules.push(module);
                }
            }
        }

        let grant_rows: Vec<sqlx::sqlite::SqliteRow> =
            sqlx::query("SELECT module_key, level FROM module_grant WHERE user_id = ?")
                .bind(&user_id.0)
                .fetch_all(&self.pool)
                .await
                .map_err(|error| DirectoryError(error.to_string()))?;
        let mut grants = HashMap::new();
        for row in &grant_rows {
            let module: String =
                row.try_get("module_key").map_err(|error| DirectoryError(error.to_string()))?;
            let level_raw: String =
                row.try_get("level").map_err(|error| DirectoryError(error.to_string()))?;
            if let Some(level) = AccessLevel::parse(&level_raw) {
                grants.insert(module.trim().to_ascii_lowercase(), level);
            }
        }

        let cost_center_rows: Vec<sqlx::sqlite::SqliteRow> =
            sqlx::query("SELECT cost_center_id FROM user_cost_center WHERE user_id = ?")
                .bind(&user_id.0)
                .fetch_all(&self.pool)
                .await
                .map_err(|error| DirectoryError(error.to_string()))?;
        let cost_center_ids = cost_center_rows
            .iter()
            .map(|row| {
                row.try_get::<String, _>("cost_center_id")
                    .map(CostCenterId)
                    .map_err(|error| DirectoryError(error.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(ActorProfile {
            user,
            department_ids,
            cost_center_ids,
            department_modules,
            grants,
        }))
    }
}
