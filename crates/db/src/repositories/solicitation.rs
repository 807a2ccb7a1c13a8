use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;

use tramita_core::access::AccessLevel;
use tramita_core::domain::directory::{CostCenterId, DepartmentId, UserId};
use tramita_core::domain::solicitation::{
    ApprovalDecision, ApprovalState, Solicitation, SolicitationId, SolicitationStatus,
};
use tramita_core::domain::workflow::StepKey;

use super::{RepositoryError, SolicitationRepository};
use crate::DbPool;

pub struct SqlSolicitationRepository {
    pool: DbPool,
}

impl SqlSolicitationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = "id, protocol, type_key, payload, status, requires_approval, \
     approval_status, approver_id, department_id, current_step_key, cost_center_id, parent_id, \
     requester_id, requester_name, decision_approved, decision_comment, decided_by, decided_at, \
     decision_level, created_at, updated_at, closed_at";

fn decode<E: std::fmt::Display>(error: E) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc)).map_err(decode)
}

pub(crate) fn row_to_solicitation(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<Solicitation, RepositoryError> {
    let id: String = row.try_get("id").map_err(decode)?;
    let protocol: String = row.try_get("protocol").map_err(decode)?;
    let type_key: String = row.try_get("type_key").map_err(decode)?;
    let payload_raw: String = row.try_get("payload").map_err(decode)?;
    let status_raw: String = row.try_get("status").map_err(decode)?;
    let requires_approval: i64 = row.try_get("requires_approval").map_err(decode)?;
    let approval_raw: String = row.try_get("approval_status").map_err(decode)?;
    let approver_id: Option<String> = row.try_get("approver_id").map_err(decode)?;
    let department_id: Option<String> = row.try_get("department_id").map_err(decode)?;
    let current_step_key: Option<String> = row.try_get("current_step_key").map_err(decode)?;
    let cost_center_id: Option<String> = row.try_get("cost_center_id").map_err(decode)?;
    let parent_id: Option<String> = row.try_get("parent_id").map_err(decode)?;
    let requester_id: String = row.try_get("requester_id").map_err(decode)?;
    let requester_name: String = row.try_get("requester_name").map_err(decode)?;
    let decision_approved: Option<i64> = row.try_get("decision_approved").map_err(decode)?;
    let decision_comment: Option<String> = row.try_get("decision_comment").map_err(decode)?;
    let decided_by: Option<String> = row.try_get("decided_by").map_err(decode)?;
    let decided_at: Option<String> = row.try_get("decided_at").map_err(decode)?;
    let decision_level: Option<String> = row.try_get("decision_level").map_err(decode)?;
    let created_at: String = row.try_get("created_at").map_err(decode)?;
    let updated_at: String = row.try_get("updated_at").map_err(decode)?;
    let closed_at: Option<String> = row.try_get("closed_at").map_err(decode)?;

    let payload: Value = serde_json::from_str(&payload_raw).map_err(decode)?;
    let status = SolicitationStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown status `{status_raw}`")))?;
    let approval = ApprovalState::parse(&approval_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown approval `{approval_raw}`")))?;

    let decision = match (decision_approved, decided_by, decided_at) {
        (Some(approved), Some(decided_by), Some(decided_at)) => Some(ApprovalDecision {
            approved: approved != 0,
            comment: decision_comment,
            decided_by: UserId(decided_by),
            decided_at: parse_timestamp(&decided_at)?,
            decided_at_level: decision_level.as_deref().and_then(AccessLevel::parse),
        }),
        _ => None,
    };

    Ok(Solicitation {
        id: SolicitationId(id),
        protocol,
        type_key,
        payload,
        status,
        requires_approval: requires_approval != 0,
        approval,
        approver_id: approver_id.map(UserId),
        department_id: department_id.map(DepartmentId),
        current_step_key: current_step_key.map(StepKey),
        cost_center_id: cost_center_id.map(CostCenterId),
        parent_id: parent_id.map(SolicitationId),
        requester_id: UserId(requester_id),
        requester_name,
        decision,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        closed_at: closed_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

#[async_trait::async_trait]
impl SolicitationRepository for SqlSolicitationRepository {
    async fn find_by_id(
        &self,
        id: &SolicitationId,
    ) -> Result<Option<Solicitation>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM solicitation WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref row) => Ok(Some(row_to_solicitation(row)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, solicitation: Solicitation) -> Result<(), RepositoryError> {
        let payload = solicitation.payload.to_string();
        let decision = solicitation.decision.as_ref();

        sqlx::query(
            "INSERT INTO solicitation (id, protocol, type_key, payload, status, \
                 requires_approval, approval_status, approver_id, department_id, \
                 current_step_key, cost_center_id, parent_id, requester_id, requester_name, \
                 decision_approved, decision_comment, decided_by, decided_at, decision_level, \
                 created_at, updated_at, closed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 payload = excluded.payload,
                 status = excluded.status,
                 requires_approval = excluded.requires_approval,
                 approval_status = excluded.approval_status,
                 approver_id = excluded.approver_id,
                 department_id = excluded.department_id,
                 current_step_key = excluded.current_step_key,
                 cost_center_id = excluded.cost_center_id,
                 decision_approved = excluded.decision_approved,
                 decision_comment = excluded.decision_comment,
                 decided_by = excluded.decided_by,
                 decided_at = excluded.decided_at,
                 decision_level = excluded.decision_level,
                 updated_at = excluded.updated_at,
                 closed_at = excluded.closed_at",
        )
        .bind(&solicitation.id.0)
        .bind(&solicitation.protocol)
        .bind(&solicitation.type_key)
        .bind(&payload)
        .bind(solicitation.status.as_str())
        .bind(solicitation.requires_approval as i64)
        .bind(solicitation.approval.as_str())
        .bind(solicitation.approver_id.as_ref().map(|id| id.0.as_str()))
        .bind(solicitation.department_id.as_ref().map(|id| id.0.as_str()))
        .bind(solicitation.current_step_key.as_ref().map(|key| key.0.as_str()))
        .bind(solicitation.cost_center_id.as_ref().map(|id| id.0.as_str()))
        .bind(solicitation.parent_id.as_ref().map(|id| id.0.as_str()))
        .bind(&solicitation.requester_id.0)
        .bind(&solicitation.requester_name)
        .bind(decision.map(|d| d.approved as i64))
        .bind(decision.and_then(|d| d.comment.clone()))
        .bind(decision.map(|d| d.decided_by.0.clone()))
        .bind(decision.map(|d| d.decided_at.to_rfc3339()))
        .bind(decision.and_then(|d| d.decided_at_level.map(|level| level.as_str())))
        .bind(solicitation.created_at.to_rfc3339())
        .bind(solicitation.updated_at.to_rfc3339())
        .bind(solicitation.closed_at.map(|dt| dt.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_payload(
        &self,
        id: &SolicitationId,
        payload: &Value,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE solicitation SET payload = ?, updated_at = ? WHERE id = ?")
            .bind(payload.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn record_decision(
        &self,
        id: &SolicitationId,
        decision: &ApprovalDecision,
        new_approval: ApprovalState,
        new_status: SolicitationStatus,
        closed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE solicitation SET
                 approval_status = ?,
                 status = ?,
                 decision_approved = ?,
                 decision_comment = ?,
                 decided_by = ?,
                 decided_at = ?,
                 decision_level = ?,
                 closed_at = ?,
                 updated_at = ?
             WHERE id = ? AND approval_status = 'pending'",
        )
        .bind(new_approval.as_str())
        .bind(new_status.as_str())
        .bind(decision.approved as i64)
        .bind(decision.comment.as_deref())
        .bind(&decision.decided_by.0)
        .bind(decision.decided_at.to_rfc3339())
        .bind(decision.decided_at_level.map(|level| level.as_str()))
        .bind(closed_at.map(|dt| dt.to_rfc3339()))
        .bind(Utc::now().to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_route(
        &self,
        id: &SolicitationId,
        department_id: Option<&DepartmentId>,
        cost_center_id: Option<&CostCenterId>,
        step_key: Option<&StepKey>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE solicitation SET
                 department_id = ?,
                 cost_center_id = COALESCE(?, cost_center_id),
                 current_step_key = ?,
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(department_id.map(|id| id.0.as_str()))
        .bind(cost_center_id.map(|id| id.0.as_str()))
        .bind(step_key.map(|key| key.0.as_str()))
        .bind(Utc::now().to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn close_if_open(
        &self,
        id: &SolicitationId,
        closed_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE solicitation SET status = 'closed', closed_at = ?, updated_at = ?
             WHERE id = ? AND status NOT IN ('closed', 'cancelled')",
        )
        .bind(closed_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn require_approval(
        &self,
        id: &SolicitationId,
        approver_id: &UserId,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE solicitation SET
                 requires_approval = 1,
                 approval_status = 'pending',
                 status = 'awaiting_approval',
                 approver_id = ?,
                 updated_at = ?
             WHERE id = ? AND status NOT IN ('closed', 'cancelled')",
        )
        .bind(&approver_id.0)
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
    use serde_json::json;

    use tramita_core::access::AccessLevel;
    use tramita_core::domain::directory::{DepartmentId, UserId};
    use tramita_core::domain::solicitation::{
        ApprovalDecision, ApprovalState, Solicitation, SolicitationId, SolicitationStatus,
    };

    use super::SqlSolicitationRepository;
    use crate::repositories::SolicitationRepository;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn sample(id: &str, approval: ApprovalState) -> Solicitation {
        let now = Utc::now();
        Solicitation {
            id: SolicitationId(id.to_string()),
            protocol: format!("2026-{id}"),
            type_key: "agendamento_ferias".to_string(),
            payload: json!({"dataInicio": "2026-09-01"}),
            status: SolicitationStatus::AwaitingApproval,
            requires_approval: true,
            approval,
            approver_id: None,
            department_id: Some(DepartmentId("dep-origem".to_string())),
            current_step_key: None,
            cost_center_id: None,
            parent_id: None,
            requester_id: UserId("u-req".to_string()),
            requester_name: "Ana".to_string(),
            decision: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
        }
    }

    fn decision(approved: bool) -> ApprovalDecision {
        ApprovalDecision {
            approved,
            comment: Some("ok".to_string()),
            decided_by: UserId("u-chefe".to_string()),
            decided_at: Utc::now(),
            decided_at_level: Some(AccessLevel::Nivel2),
        }
    }

    #[tokio::test]
    async fn save_and_find_round_trips_payload_and_enums() {
        let pool = setup().await;
        let repo = SqlSolicitationRepository::new(pool);
        let record = sample("SOL-1", ApprovalState::Pending);

        repo.save(record.clone()).await.expect("save");
        let found = repo
            .find_by_id(&SolicitationId("SOL-1".to_string()))
            .await
            .expect("find")
            .expect("exists");

        assert_eq!(found.protocol, record.protocol);
        assert_eq!(found.approval, ApprovalState::Pending);
        assert_eq!(found.payload["dataInicio"], json!("2026-09-01"));
        assert!(found.decision.is_none());
    }

    #[tokio::test]
    async fn record_decision_is_single_use() {
        let pool = setup().await;
        let repo = SqlSolicitationRepository::new(pool);
        repo.save(sample("SOL-1", ApprovalState::Pending)).await.expect("save");

        let id = SolicitationId("SOL-1".to_string());
        let first = repo
            .record_decision(
                &id,
                &decision(true),
                ApprovalState::Approved,
                SolicitationStatus::Open,
                None,
            )
            .await
            .expect("first decision");
        assert!(first);

        // The guard no longer matches; the second decider loses the race.
        let second = repo
            .record_decision(
                &id,
                &decision(false),
                ApprovalState::Rejected,
                SolicitationStatus::Closed,
                Some(Utc::now()),
            )
            .await
            .expect("second decision");
        assert!(!second);

        let found = repo.find_by_id(&id).await.expect("find").expect("exists");
        assert_eq!(found.approval, ApprovalState::Approved);
        let stamped = found.decision.expect("decision metadata");
        assert!(stamped.approved);
        assert_eq!(stamped.decided_by.0, "u-chefe");
    }

    #[tokio::test]
    async fn close_if_open_guards_terminal_states() {
        let pool = setup().await;
        let repo = SqlSolicitationRepository::new(pool);
        repo.save(sample("SOL-1", ApprovalState::NotRequired)).await.expect("save");

        let id = SolicitationId("SOL-1".to_string());
        assert!(repo.close_if_open(&id, Utc::now()).await.expect("close"));
        assert!(!repo.close_if_open(&id, Utc::now()).await.expect("second close"));

        let found = repo.find_by_id(&id).await.expect("find").expect("exists");
        assert_eq!(found.status, SolicitationStatus::Closed);
        assert!(found.closed_at.is_some());
    }

    #[tokio::test]
    async fn update_route_keeps_cost_center_when_not_provided() {
        let pool = setup().await;
        let repo = SqlSolicitationRepository::new(pool);
        let mut record = sample("SOL-1", ApprovalState::NotRequired);
        record.cost_center_id =
            Some(tramita_core::domain::directory::CostCenterId("cc-1".to_string()));
        repo.save(record).await.expect("save");

        let id = SolicitationId("SOL-1".to_string());
        repo.update_route(
            &id,
            Some(&DepartmentId("dep-folha".to_string())),
            None,
            Some(&tramita_core::domain::workflow::StepKey("destino".to_string())),
        )
        .await
        .expect("route");

        let found = repo.find_by_id(&id).await.expect("find").expect("exists");
        assert_eq!(found.department_id.unwrap().0, "dep-folha");
        assert_eq!(found.cost_center_id.unwrap().0, "cc-1");
        assert_eq!(found.current_step_key.unwrap().0, "destino");
    }

    #[tokio::test]
    async fn require_approval_assigns_the_approver() {
        let pool = setup().await;
        let repo = SqlSolicitationRepository::new(pool);
        let mut record = sample("SOL-1", ApprovalState::NotRequired);
        record.status = SolicitationStatus::Open;
        record.requires_approval = false;
        repo.save(record).await.expect("save");

        let id = SolicitationId("SOL-1".to_string());
        let flipped = repo
            .require_approval(&id, &UserId("u-nivel3".to_string()))
            .await
            .expect("require approval");
        assert!(flipped);

        let found = repo.find_by_id(&id).await.expect("find").expect("exists");
        assert!(found.requires_approval);
        assert_eq!(found.approval, ApprovalState::Pending);
        assert_eq!(found.status, SolicitationStatus::AwaitingApproval);
        assert_eq!(found.approver_id.unwrap().0, "u-nivel3");
    }
}
