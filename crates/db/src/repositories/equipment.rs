use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use tramita_core::domain::directory::UserId;
use tramita_core::domain::equipment::{EquipmentItem, EquipmentItemId, EquipmentStatus};

use super::{EquipmentRepository, RepositoryError};
use crate::DbPool;

pub struct SqlEquipmentRepository {
    pool: DbPool,
}

impl SqlEquipmentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn decode<E: std::fmt::Display>(error: E) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

fn row_to_item(row: &sqlx::sqlite::SqliteRow) -> Result<EquipmentItem, RepositoryError> {
    let id: String = row.try_get("id").map_err(decode)?;
    let label: String = row.try_get("label").map_err(decode)?;
    let status_raw: String = row.try_get("status").map_err(decode)?;
    let owner_id: Option<String> = row.try_get("owner_id").map_err(decode)?;
    let updated_at: String = row.try_get("updated_at").map_err(decode)?;

    Ok(EquipmentItem {
        id: EquipmentItemId(id),
        label,
        status: EquipmentStatus::parse(&status_raw).ok_or_else(|| {
            RepositoryError::Decode(format!("unknown equipment status `{status_raw}`"))
        })?,
        owner_id: owner_id.map(UserId),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(decode)?,
    })
}

#[async_trait]
impl EquipmentRepository for SqlEquipmentRepository {
    async fn find_by_id(
        &self,
        id: &EquipmentItemId,
    ) -> Result<Option<EquipmentItem>, RepositoryError> {
        let row =
            sqlx::query("SELECT id, label, status, owner_id, updated_at FROM equipment_item WHERE id = ?")
                .bind(&id.0)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(ref row) => Ok(Some(row_to_item(row)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, item: EquipmentItem) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO equipment_item (id, label, status, owner_id, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 label = excluded.label,
                 status = excluded.status,
                 owner_id = excluded.owner_id,
                 updated_at = excluded.updated_at",
        )
        .bind(&item.id.0)
        .bind(&item.label)
        .bind(item.status.as_str())
        .bind(item.owner_id.as_ref().map(|id| id.0.as_str()))
        .bind(item.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn allocate_if_in_stock(
        &self,
        id: &EquipmentItemId,
        owner_id: &UserId,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE equipment_item SET status = 'assigned', owner_id = ?, updated_at = ?
             WHERE id = ? AND status = 'in_stock'",
        )
        .bind(&owner_id.0)
        .bind(Utc::now().to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use tramita_core::domain::directory::UserId;
    use tramita_core::domain::equipment::{EquipmentItem, EquipmentItemId, EquipmentStatus};

    use super::SqlEquipmentRepository;
    use crate::repositories::EquipmentRepository;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn allocate_succeeds_exactly_once() {
        let pool = setup().await;
        let repo = SqlEquipmentRepository::new(pool);
        repo.save(EquipmentItem {
            id: EquipmentItemId("EQ-1".to_string()),
            label: "Notebook".to_string(),
            status: EquipmentStatus::InStock,
            owner_id: None,
            updated_at: Utc::now(),
        })
        .await
        .expect("save");

        let id = EquipmentItemId("EQ-1".to_string());
        // Two approvals race for the same unit; only the first guard holds.
        let first = repo
            .allocate_if_in_stock(&id, &UserId("u-1".to_string()))
            .await
            .expect("first allocate");
        let second = repo
            .allocate_if_in_stock(&id, &UserId("u-2".to_string()))
            .await
            .expect("second allocate");

        assert!(first);
        assert!(!second);

        let item = repo.find_by_id(&id).await.expect("find").expect("exists");
        assert_eq!(item.status, EquipmentStatus::Assigned);
        assert_eq!(item.owner_id.unwrap().0, "u-1");
    }
}
