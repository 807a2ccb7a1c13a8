use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use tramita_core::access::AccessLevel;
use tramita_core::domain::directory::{DepartmentId, UserId};
use tramita_core::domain::workflow::{
    StepKey, StepKind, WorkflowDefinition, WorkflowDefinitionId, WorkflowStep, WorkflowTransition,
};
use tramita_core::routing::DefinitionSource;

use super::{RepositoryError, WorkflowDefinitionRepository};
use crate::DbPool;

pub struct SqlWorkflowDefinitionRepository {
    pool: DbPool,
}

impl SqlWorkflowDefinitionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn decode<E: std::fmt::Display>(error: E) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

fn parse_string_list(raw: &str) -> Result<Vec<String>, RepositoryError> {
    serde_json::from_str(raw).map_err(decode)
}

fn row_to_step(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowStep, RepositoryError> {
    let step_key: String = row.try_get("step_key").map_err(decode)?;
    let label: String = row.try_get("label").map_err(decode)?;
    let kind_raw: String = row.try_get("kind").map_err(decode)?;
    let department_id: Option<String> = row.try_get("department_id").map_err(decode)?;
    let approver_ids_raw: String = row.try_get("approver_ids").map_err(decode)?;
    let required_level_raw: String = row.try_get("required_level").map_err(decode)?;
    let notify_subject: Option<String> = row.try_get("notify_subject").map_err(decode)?;
    let notify_body: Option<String> = row.try_get("notify_body").map_err(decode)?;
    let extra_recipients_raw: String = row.try_get("extra_recipients").map_err(decode)?;
    let position: i64 = row.try_get("position").map_err(decode)?;

    Ok(WorkflowStep {
        key: StepKey(step_key),
        label,
        kind: StepKind::parse(&kind_raw)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown step kind `{kind_raw}`")))?,
        department_id: department_id.map(DepartmentId),
        approver_ids: parse_string_list(&approver_ids_raw)?.into_iter().map(UserId).collect(),
        required_level: AccessLevel::parse(&required_level_raw).ok_or_else(|| {
            RepositoryError::Decode(format!("unknown access level `{required_level_raw}`"))
        })?,
        notify_subject,
        notify_body,
        extra_recipients: parse_string_list(&extra_recipients_raw)?,
        position: position as u32,
    })
}

impl SqlWorkflowDefinitionRepository {
    async fn load_graph(
        &self,
        definition_id: &str,
    ) -> Result<(Vec<WorkflowStep>, Vec<WorkflowTransition>), RepositoryError> {
        let step_rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(
            "SELECT step_key, label, kind, department_id, approver_ids, required_level,
                    notify_subject, notify_body, extra_recipients, position
             FROM workflow_step WHERE definition_id = ? ORDER BY position ASC",
        )
        .bind(definition_id)
        .fetch_all(&self.pool)
        .await?;
        let steps = step_rows.iter().map(row_to_step).collect::<Result<Vec<_>, _>>()?;

        let transition_rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(
            "SELECT from_key, to_key, condition_json
             FROM workflow_transition WHERE definition_id = ? ORDER BY position ASC",
        )
        .bind(definition_id)
        .fetch_all(&self.pool)
        .await?;
        let transitions = transition_rows
            .iter()
            .map(|row| {
                let from: String = row.try_get("from_key").map_err(decode)?;
                let to: String = row.try_get("to_key").map_err(decode)?;
                let condition_raw: Option<String> = row.try_get("condition_json").map_err(decode)?;
                let condition = condition_raw
                    .map(|raw| serde_json::from_str::<Value>(&raw).map_err(decode))
                    .transpose()?;
                Ok(WorkflowTransition { from: StepKey(from), to: StepKey(to), condition })
            })
            .collect::<Result<Vec<_>, RepositoryError>>()?;

        Ok((steps, transitions))
    }
}

#[async_trait]
impl WorkflowDefinitionRepository for SqlWorkflowDefinitionRepository {
    async fn find_active(
        &self,
        type_key: &str,
        department_id: Option<&DepartmentId>,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, type_key, department_id, active FROM workflow_definition
             WHERE type_key = ? AND COALESCE(department_id, '') = ? AND active = 1",
        )
        .bind(type_key)
        .bind(department_id.map(|id| id.0.as_str()).unwrap_or(""))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: String = row.try_get("id").map_err(decode)?;
        let department_id: Option<String> = row.try_get("department_id").map_err(decode)?;
        let (steps, transitions) = self.load_graph(&id).await?;

        Ok(Some(WorkflowDefinition {
            id: WorkflowDefinitionId(id),
            type_key: type_key.to_string(),
            department_id: department_id.map(DepartmentId),
            active: true,
            steps,
            transitions,
        }))
    }

    async fn insert_if_absent(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().to_rfc3339();

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO workflow_definition
                 (id, type_key, department_id, active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&definition.id.0)
        .bind(&definition.type_key)
        .bind(definition.department_id.as_ref().map(|id| id.0.as_str()))
        .bind(definition.active as i64)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if !inserted {
            tx.rollback().await?;
            return Ok(false);
        }

        for step in &definition.steps {
            let approver_ids = serde_json::to_string(
                &step.approver_ids.iter().map(|id| id.0.as_str()).collect::<Vec<_>>(),
            )
            .map_err(decode)?;
            let extra_recipients =
                serde_json::to_string(&step.extra_recipients).map_err(decode)?;

            sqlx::query(
                "INSERT INTO workflow_step
                     (id, definition_id, step_key, label, kind, department_id, approver_ids,
                      required_level, notify_subject, notify_body, extra_recipients, position)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(format!("WFS-{}", Uuid::new_v4().simple()))
            .bind(&definition.id.0)
            .bind(&step.key.0)
            .bind(&step.label)
            .bind(step.kind.as_str())
            .bind(step.department_id.as_ref().map(|id| id.0.as_str()))
            .bind(&approver_ids)
            .bind(step.required_level.as_str())
            .bind(step.notify_subject.as_deref())
            .bind(step.notify_body.as_deref())
            .bind(&extra_recipients)
            .bind(step.position as i64)
            .execute(&mut *tx)
            .await?;
        }

        for (position, transition) in definition.transitions.iter().enumerate() {
            sqlx::query(
                "INSERT INTO workflow_transition
                     (id, definition_id, from_key, to_key, condition_json, position)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(format!("WFT-{}", Uuid::new_v4().simple()))
            .bind(&definition.id.0)
            .bind(&transition.from.0)
            .bind(&transition.to.0)
            .bind(transition.condition.as_ref().map(|condition| condition.to_string()))
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}

/// Lets the core definition store resolve and lazily seed graphs through
/// this repository.
#[async_trait]
impl DefinitionSource for SqlWorkflowDefinitionRepository {
    async fn find_active(
        &self,
        type_key: &str,
        department_id: Option<&DepartmentId>,
    ) -> Result<Option<WorkflowDefinition>, String> {
        WorkflowDefinitionRepository::find_active(self, type_key, department_id)
            .await
            .map_err(|error| error.to_string())
    }

    async fn insert_if_absent(&self, definition: &WorkflowDefinition) -> Result<(), String> {
        WorkflowDefinitionRepository::insert_if_absent(self, definition)
            .await
            .map(|_| ())
            .map_err(|error| error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use tramita_core::domain::directory::DepartmentId;
    use tramita_core::routing::{default_definition, DefinitionStore};

    use super::SqlWorkflowDefinitionRepository;
    use crate::repositories::WorkflowDefinitionRepository;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn insert_and_reload_round_trips_the_graph() {
        let pool = setup().await;
        let repo = SqlWorkflowDefinitionRepository::new(pool);
        let definition = default_definition("equipamento");

        let inserted =
            WorkflowDefinitionRepository::insert_if_absent(&repo, &definition).await.expect("insert");
        assert!(inserted);

        let loaded = WorkflowDefinitionRepository::find_active(&repo, "equipamento", None)
            .await
            .expect("find")
            .expect("exists");

        assert_eq!(loaded.steps.len(), 4);
        assert_eq!(loaded.transitions.len(), 3);
        assert_eq!(loaded.steps[0].key.0, "origem");
        assert_eq!(loaded.validate(), Ok(()));
    }

    #[tokio::test]
    async fn second_insert_for_the_same_scope_is_ignored() {
        let pool = setup().await;
        let repo = SqlWorkflowDefinitionRepository::new(pool);

        let first = default_definition("ferias");
        let mut second = default_definition("ferias");
        second.id = tramita_core::domain::workflow::WorkflowDefinitionId("WF-later".to_string());

        assert!(WorkflowDefinitionRepository::insert_if_absent(&repo, &first)
            .await
            .expect("first insert"));
        assert!(!WorkflowDefinitionRepository::insert_if_absent(&repo, &second)
            .await
            .expect("second insert"));

        let loaded = WorkflowDefinitionRepository::find_active(&repo, "ferias", None)
            .await
            .expect("find")
            .expect("exists");
        assert_eq!(loaded.id, first.id);
    }

    #[tokio::test]
    async fn department_scoped_definitions_do_not_shadow_the_fallback() {
        let pool = setup().await;
        let repo = SqlWorkflowDefinitionRepository::new(pool);

        let fallback = default_definition("uso_veiculo");
        let mut scoped = default_definition("uso_veiculo");
        scoped.id = tramita_core::domain::workflow::WorkflowDefinitionId("WF-scoped".to_string());
        scoped.department_id = Some(DepartmentId("dep-log".to_string()));

        assert!(WorkflowDefinitionRepository::insert_if_absent(&repo, &fallback)
            .await
            .expect("fallback insert"));
        assert!(WorkflowDefinitionRepository::insert_if_absent(&repo, &scoped)
            .await
            .expect("scoped insert"));

        let resolved = WorkflowDefinitionRepository::find_active(
            &repo,
            "uso_veiculo",
            Some(&DepartmentId("dep-log".to_string())),
        )
        .await
        .expect("find")
        .expect("exists");
        assert_eq!(resolved.id.0, "WF-scoped");
    }

    #[tokio::test]
    async fn definition_store_synthesizes_the_default_once_through_sql() {
        let pool = setup().await;
        let store = DefinitionStore::new(SqlWorkflowDefinitionRepository::new(pool.clone()));

        let first = store.definition_for("desligamento", None).await.expect("first resolve");
        let second = store.definition_for("desligamento", None).await.expect("second resolve");
        assert_eq!(first.id, second.id);

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM workflow_definition WHERE type_key = 'desligamento'",
        )
        .fetch_one(&pool)
        .await
        .expect("count definitions");
        assert_eq!(count, 1);
    }
}
