use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use tramita_core::audit::{AuditCategory, AuditEvent, AuditOutcome};
use tramita_core::domain::directory::UserId;
use tramita_core::domain::solicitation::SolicitationId;
use tramita_core::domain::timeline::{TimelineEntry, TimelineEntryId};

use super::{RepositoryError, TimelineRepository};
use crate::DbPool;

pub struct SqlTimelineRepository {
    pool: DbPool,
}

impl SqlTimelineRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn decode<E: std::fmt::Display>(error: E) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc)).map_err(decode)
}

#[async_trait]
impl TimelineRepository for SqlTimelineRepository {
    async fn append(&self, entry: TimelineEntry) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO timeline_entry (id, solicitation_id, message, actor_id, occurred_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&entry.id.0)
        .bind(&entry.solicitation_id.0)
        .bind(&entry.message)
        .bind(entry.actor_id.as_ref().map(|id| id.0.as_str()))
        .bind(entry.occurred_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_for_solicitation(
        &self,
        solicitation_id: &SolicitationId,
    ) -> Result<Vec<TimelineEntry>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(
            "SELECT id, solicitation_id, message, actor_id, occurred_at
             FROM timeline_entry WHERE solicitation_id = ? ORDER BY occurred_at ASC",
        )
        .bind(&solicitation_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(decode)?;
                let solicitation_id: String = row.try_get("solicitation_id").map_err(decode)?;
                let message: String = row.try_get("message").map_err(decode)?;
                let actor_id: Option<String> = row.try_get("actor_id").map_err(decode)?;
                let occurred_at: String = row.try_get("occurred_at").map_err(decode)?;

                Ok(TimelineEntry {
                    id: TimelineEntryId(id),
                    solicitation_id: SolicitationId(solicitation_id),
                    message,
                    actor_id: actor_id.map(UserId),
                    occurred_at: parse_timestamp(&occurred_at)?,
                })
            })
            .collect()
    }

    async fn append_audit(&self, event: AuditEvent) -> Result<(), RepositoryError> {
        let metadata = serde_json::to_string(&event.metadata).map_err(decode)?;

        sqlx::query(
            "INSERT INTO audit_event
                 (id, solicitation_id, correlation_id, event_type, category, actor, outcome,
                  metadata, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.event_id)
        .bind(event.solicitation_id.as_ref().map(|id| id.0.as_str()))
        .bind(&event.correlation_id)
        .bind(&event.event_type)
        .bind(event.category.as_str())
        .bind(&event.actor)
        .bind(event.outcome.as_str())
        .bind(&metadata)
        .bind(event.occurred_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_audit_for_solicitation(
        &self,
        solicitation_id: &SolicitationId,
    ) -> Result<Vec<AuditEvent>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(
            "SELECT id, solicitation_id, correlation_id, event_type, category, actor, outcome,
                    metadata, occurred_at
             FROM audit_event WHERE solicitation_id = ? ORDER BY occurred_at ASC",
        )
        .bind(&solicitation_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let event_id: String = row.try_get("id").map_err(decode)?;
                let solicitation_id: Option<String> =
                    row.try_get("solicitation_id").map_err(decode)?;
                let correlation_id: String = row.try_get("correlation_id").map_err(decode)?;
                let event_type: String = row.try_get("event_type").map_err(decode)?;
                let category_raw: String = row.try_get("category").map_err(decode)?;
                let actor: String = row.try_get("actor").map_err(decode)?;
                let outcome_raw: String = row.try_get("outcome").map_err(decode)?;
                let metadata_raw: String = row.try_get("metadata").map_err(decode)?;
                let occurred_at: String = row.try_get("occurred_at").map_err(decode)?;

                let metadata: BTreeMap<String, String> =
                    serde_json::from_str(&metadata_raw).map_err(decode)?;

                Ok(AuditEvent {
                    event_id,
                    solicitation_id: solicitation_id.map(SolicitationId),
                    correlation_id,
                    event_type,
                    category: AuditCategory::parse(&category_raw).ok_or_else(|| {
                        RepositoryError::Decode(format!("unknown category `{category_raw}`"))
                    })?,
                    actor,
                    outcome: AuditOutcome::parse(&outcome_raw).ok_or_else(|| {
                        RepositoryError::Decode(format!("unknown outcome `{outcome_raw}`"))
                    })?,
                    metadata,
                    occurred_at: parse_timestamp(&occurred_at)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use tramita_core::audit::{AuditCategory, AuditEvent, AuditOutcome};
    use tramita_core::domain::solicitation::SolicitationId;
    use tramita_core::domain::timeline::{TimelineEntry, TimelineEntryId};

    use super::SqlTimelineRepository;
    use crate::repositories::TimelineRepository;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");

        sqlx::query(
            "INSERT INTO solicitation (id, protocol, type_key, requester_id, requester_name, created_at, updated_at)
             VALUES ('SOL-1', '2026-000001', 'epi', 'u-1', 'Ana', ?, ?)",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await
        .expect("seed solicitation");

        pool
    }

    #[tokio::test]
    async fn timeline_entries_are_listed_in_order() {
        let pool = setup().await;
        let repo = SqlTimelineRepository::new(pool);
        let solicitation_id = SolicitationId("SOL-1".to_string());

        for (index, message) in ["criada", "aprovada"].iter().enumerate() {
            repo.append(TimelineEntry {
                id: TimelineEntryId(format!("TL-{index}")),
                solicitation_id: solicitation_id.clone(),
                message: message.to_string(),
                actor_id: None,
                occurred_at: Utc::now() + chrono::Duration::seconds(index as i64),
            })
            .await
            .expect("append");
        }

        let entries = repo.list_for_solicitation(&solicitation_id).await.expect("list");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "criada");
        assert_eq!(entries[1].message, "aprovada");
    }

    #[tokio::test]
    async fn audit_events_round_trip_with_metadata() {
        let pool = setup().await;
        let repo = SqlTimelineRepository::new(pool);
        let solicitation_id = SolicitationId("SOL-1".to_string());

        repo.append_audit(
            AuditEvent::new(
                Some(solicitation_id.clone()),
                "req-1",
                "approval.decision_recorded",
                AuditCategory::Approval,
                "u-chefe",
                AuditOutcome::Success,
            )
            .with_metadata("decision", "approved"),
        )
        .await
        .expect("append audit");

        let events = repo.list_audit_for_solicitation(&solicitation_id).await.expect("list");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "approval.decision_recorded");
        assert_eq!(events[0].metadata.get("decision").map(String::as_str), Some("approved"));
    }
}
