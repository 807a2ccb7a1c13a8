//! Deterministic seeds shared by repository and server tests.

use chrono::Utc;

use tramita_core::domain::directory::DepartmentId;
use tramita_core::domain::workflow::StepKind;
use tramita_core::routing::default_definition;

use crate::repositories::{
    RepositoryError, SqlWorkflowDefinitionRepository, WorkflowDefinitionRepository,
};
use crate::DbPool;

const DEPARTMENTS: &[(&str, &str, Option<&str>)] = &[
    ("dep-origem", "Origem", None),
    ("dep-destino", "Destino", None),
    ("dep-rh", "Recursos Humanos", Some("cc-rh")),
    ("dep-folha-pagamento", "Folha de Pagamento", None),
    ("dep-logistica", "Logística", None),
];

const COST_CENTERS: &[(&str, &str, &str)] =
    &[("cc-rh", "Centro RH", "dep-rh"), ("cc-vendas", "Centro Vendas", "dep-origem")];

const USERS: &[(&str, &str, &str, &str, &str)] = &[
    ("u-gerente", "Gabriela", "gerente@example.com", "standard", "dep-origem"),
    ("u-membro", "Marcos", "membro@example.com", "standard", "dep-origem"),
    ("u-admin", "Alice", "admin@example.com", "admin", "dep-rh"),
    ("u-req", "Ana", "ana@example.com", "standard", "dep-origem"),
    ("u-suprimentos", "Samuel", "suprimentos@example.com", "standard", "dep-logistica"),
    ("u-folha", "Fernanda", "folha@example.com", "standard", "dep-folha-pagamento"),
    ("u-log", "Lucas", "logistica@example.com", "standard", "dep-logistica"),
];

const MODULE_DEPARTMENTS: &[&str] =
    &["dep-origem", "dep-destino", "dep-rh", "dep-folha-pagamento", "dep-logistica"];

const GRANTS: &[(&str, &str, &str)] = &[
    ("u-gerente", "solicitacoes", "nivel_2"),
    ("u-suprimentos", "solicitacoes", "nivel_3"),
];

pub async fn seed_directory(pool: &DbPool) -> Result<(), RepositoryError> {
    let now = Utc::now().to_rfc3339();

    for (id, name, default_cost_center) in DEPARTMENTS {
        sqlx::query(
            "INSERT OR IGNORE INTO department (id, name, default_cost_center_id, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(name)
        .bind(default_cost_center)
        .bind(&now)
        .execute(pool)
        .await?;
    }

    for (id, name, department_id) in COST_CENTERS {
        sqlx::query("INSERT OR IGNORE INTO cost_center (id, name, department_id) VALUES (?, ?, ?)")
            .bind(id)
            .bind(name)
            .bind(department_id)
            .execute(pool)
            .await?;
    }

    for (id, name, email, role, department_id) in USERS {
        sqlx::query(
            "INSERT OR IGNORE INTO app_user (id, name, email, role, active, department_id)
             VALUES (?, ?, ?, ?, 1, ?)",
        )
        .bind(id)
        .bind(name)
        .bind(email)
        .bind(role)
        .bind(department_id)
        .execute(pool)
        .await?;
    }

    for department_id in MODULE_DEPARTMENTS {
        sqlx::query(
            "INSERT OR IGNORE INTO department_module (department_id, module_key)
             VALUES (?, 'solicitacoes')",
        )
        .bind(department_id)
        .execute(pool)
        .await?;
    }

    for (user_id, module_key, level) in GRANTS {
        sqlx::query(
            "INSERT OR IGNORE INTO module_grant (user_id, module_key, level) VALUES (?, ?, ?)",
        )
        .bind(user_id)
        .bind(module_key)
        .bind(level)
        .execute(pool)
        .await?;
    }

    sqlx::query(
        "INSERT OR IGNORE INTO department_membership (user_id, department_id)
         VALUES ('u-gerente', 'dep-destino')",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "INSERT OR IGNORE INTO user_cost_center (user_id, cost_center_id)
         VALUES ('u-membro', 'cc-vendas')",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Seeds the fallback workflow for a type with its queue steps bound to the
/// seeded origin/destination departments.
pub async fn seed_workflow(pool: &DbPool, type_key: &str) -> Result<(), RepositoryError> {
    let mut definition = default_definition(type_key);
    for step in &mut definition.steps {
        if step.kind == StepKind::Queue {
            let department = if step.key.0 == "origem" { "dep-origem" } else { "dep-destino" };
            step.department_id = Some(DepartmentId(department.to_string()));
        }
    }

    let repo = SqlWorkflowDefinitionRepository::new(pool.clone());
    WorkflowDefinitionRepository::insert_if_absent(&repo, &definition).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{connect_with_settings, migrations};

    use super::{seed_directory, seed_workflow};

    #[tokio::test]
    async fn seeds_are_idempotent() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");

        seed_directory(&pool).await.expect("first directory seed");
        seed_directory(&pool).await.expect("second directory seed");
        seed_workflow(&pool, "epi").await.expect("first workflow seed");
        seed_workflow(&pool, "epi").await.expect("second workflow seed");

        let (users,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM app_user")
            .fetch_one(&pool)
            .await
            .expect("count users");
        assert_eq!(users, 7);

        let (definitions,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM workflow_definition WHERE type_key = 'epi'")
                .fetch_one(&pool)
                .await
                .expect("count definitions");
        assert_eq!(definitions, 1);
    }
}
