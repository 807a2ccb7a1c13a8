//! Actor-facing gate operations: approve, reject, finalize, equipment
//! allocation and out-of-stock handling.
//!
//! Handlers follow one shape: load, evaluate access, let the core gate
//! decide, then commit behind an optimistic guard so a concurrent actor
//! observes Conflict instead of overwriting. Notification dispatch runs
//! after commit and is best-effort.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::post,
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use tramita_core::access::AccessEvaluator;
use tramita_core::audit::{AuditCategory, AuditEvent, AuditOutcome};
use tramita_core::domain::directory::{DepartmentId, UserId};
use tramita_core::domain::equipment::EquipmentItemId;
use tramita_core::domain::solicitation::{
    ApprovalState, Solicitation, SolicitationId, SolicitationStatus,
};
use tramita_core::domain::timeline::{TimelineEntry, TimelineEntryId};
use tramita_core::domain::workflow::WorkflowDefinition;
use tramita_core::errors::{reasons, GateError};
use tramita_core::gate::{
    self, ActorContext, GateAction, GateRequest, MODULE_SOLICITATIONS,
};
use tramita_core::notify::MARKER_KEY;
use tramita_core::routing::{current_step, is_last_actionable, DefinitionError, DefinitionStore};
use tramita_db::repositories::{
    DirectoryRepository, EquipmentRepository, RepositoryError, SolicitationRepository,
    SqlDirectoryRepository, SqlEquipmentRepository, SqlSolicitationRepository,
    SqlTimelineRepository, SqlWorkflowDefinitionRepository, TimelineRepository,
};

use crate::state::EngineState;

pub fn router(state: EngineState) -> Router {
    Router::new()
        .route("/api/v1/solicitations/{id}/approve", post(approve))
        .route("/api/v1/solicitations/{id}/reject", post(reject))
        .route("/api/v1/solicitations/{id}/finalize", post(finalize))
        .route("/api/v1/solicitations/{id}/allocate", post(allocate))
        .route("/api/v1/solicitations/{id}/out-of-stock", post(mark_out_of_stock))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub actor_id: String,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FinalizeRequest {
    pub actor_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AllocateRequest {
    pub actor_id: String,
    pub item_id: String,
    pub pdf_url: String,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct SolicitationResponse {
    pub id: String,
    pub protocol: String,
    pub status: String,
    pub approval_status: String,
    pub requires_approval: bool,
    pub department_id: Option<String>,
    pub current_step_key: Option<String>,
    pub parent_id: Option<String>,
}

impl From<&Solicitation> for SolicitationResponse {
    fn from(solicitation: &Solicitation) -> Self {
        Self {
            id: solicitation.id.0.clone(),
            protocol: solicitation.protocol.clone(),
            status: solicitation.status.as_str().to_string(),
            approval_status: solicitation.approval.as_str().to_string(),
            requires_approval: solicitation.requires_approval,
            department_id: solicitation.department_id.as_ref().map(|id| id.0.clone()),
            current_step_key: solicitation.current_step_key.as_ref().map(|key| key.0.clone()),
            parent_id: solicitation.parent_id.as_ref().map(|id| id.0.clone()),
        }
    }
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

pub fn map_gate_error(error: GateError) -> (StatusCode, Json<ApiError>) {
    let status = match &error {
        GateError::NotFound { .. } => StatusCode::NOT_FOUND,
        GateError::Conflict { .. } => StatusCode::CONFLICT,
        GateError::Forbidden { .. } => StatusCode::FORBIDDEN,
        GateError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
        GateError::ExternalUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        GateError::IntegrityViolation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(event_name = "gate.internal_error", error = %error, "gate operation failed");
    }
    (status, Json(ApiError { error: error.reason() }))
}

fn repository_error(error: RepositoryError) -> (StatusCode, Json<ApiError>) {
    error!(event_name = "gate.repository_error", error = %error, "gate repository error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError { error: "an internal repository error occurred".to_string() }),
    )
}

async fn actor_context(state: &EngineState, actor_id: &str) -> ActorContext {
    let directory = SqlDirectoryRepository::new(state.pool.clone());
    let user_id = UserId(actor_id.to_string());
    let evaluator = AccessEvaluator::for_actor(&directory, &user_id).await;
    let profile = evaluator.profile();

    ActorContext {
        name: profile
            .map(|profile| profile.user.name.clone())
            .unwrap_or_else(|| actor_id.to_string()),
        is_admin: evaluator.is_admin(),
        level: evaluator.effective_level(MODULE_SOLICITATIONS),
        department_ids: profile.map(|profile| profile.department_ids.clone()).unwrap_or_default(),
        cost_center_ids: profile
            .map(|profile| profile.cost_center_ids.clone())
            .unwrap_or_default(),
        user_id,
    }
}

async fn load_solicitation(
    state: &EngineState,
    id: &str,
) -> Result<Solicitation, (StatusCode, Json<ApiError>)> {
    SqlSolicitationRepository::new(state.pool.clone())
        .find_by_id(&SolicitationId(id.to_string()))
        .await
        .map_err(repository_error)?
        .ok_or_else(|| map_gate_error(GateError::not_found("solicitation", id)))
}

async fn resolve_definition(
    state: &EngineState,
    type_key: &str,
    department_id: Option<&DepartmentId>,
) -> Result<WorkflowDefinition, (StatusCode, Json<ApiError>)> {
    let store = DefinitionStore::new(SqlWorkflowDefinitionRepository::new(state.pool.clone()));
    store.definition_for(type_key, department_id).await.map_err(|error| {
        map_gate_error(match error {
            DefinitionError::Source(message) => GateError::unavailable("workflow store", message),
            DefinitionError::Invalid(validation) => {
                GateError::IntegrityViolation { message: validation.to_string() }
            }
        })
    })
}

async fn append_history(
    state: &EngineState,
    solicitation_id: &SolicitationId,
    actor: &UserId,
    message: &str,
    event: AuditEvent,
) -> Result<(), (StatusCode, Json<ApiError>)> {
    let timelines = SqlTimelineRepository::new(state.pool.clone());
    timelines
        .append(TimelineEntry {
            id: TimelineEntryId(format!("TL-{}", Uuid::new_v4().simple())),
            solicitation_id: solicitation_id.clone(),
            message: message.to_string(),
            actor_id: Some(actor.clone()),
            occurred_at: Utc::now(),
        })
        .await
        .map_err(repository_error)?;
    timelines.append_audit(event).await.map_err(repository_error)?;
    Ok(())
}

async fn approve(
    State(state): State<EngineState>,
    Path(id): Path<String>,
    Json(request): Json<DecisionRequest>,
) -> ApiResult<SolicitationResponse> {
    decide(state, id, request.actor_id, GateRequest::Approve { comment: request.comment }).await
}

async fn reject(
    State(state): State<EngineState>,
    Path(id): Path<String>,
    Json(request): Json<DecisionRequest>,
) -> ApiResult<SolicitationResponse> {
    let comment = request.comment.unwrap_or_default();
    decide(state, id, request.actor_id, GateRequest::Reject { comment }).await
}

async fn decide(
    state: EngineState,
    id: String,
    actor_id: String,
    request: GateRequest,
) -> ApiResult<SolicitationResponse> {
    let correlation_id = format!("req-{}", Uuid::new_v4().simple());
    let solicitation = load_solicitation(&state, &id).await?;
    let actor = actor_context(&state, &actor_id).await;

    let outcome = gate::decide(&solicitation, &actor, &state.registry, &request, Utc::now())
        .map_err(map_gate_error)?;

    // Check-then-act closes here: the guarded update only wins while the
    // record is still pending.
    let repo = SqlSolicitationRepository::new(state.pool.clone());
    let committed = repo
        .record_decision(
            &solicitation.id,
            &outcome.decision,
            outcome.new_approval,
            outcome.new_status,
            outcome.closed_at,
        )
        .await
        .map_err(repository_error)?;
    if !committed {
        return Err(map_gate_error(GateError::conflict(reasons::ALREADY_DECIDED)));
    }

    let mut payload = solicitation.payload.clone();
    let mut payload_dirty = false;
    let mut notify_after: Option<(Option<tramita_core::StepKind>, Option<DepartmentId>)> = None;

    for action in &outcome.actions {
        match action {
            GateAction::RouteToDepartment { department_id, cost_center_id } => {
                let definition =
                    resolve_definition(&state, &solicitation.type_key, Some(department_id)).await?;
                let step_key = definition
                    .queue_steps()
                    .find(|step| step.department_id.as_ref() == Some(department_id))
                    .map(|step| step.key.clone());
                repo.update_route(
                    &solicitation.id,
                    Some(department_id),
                    cost_center_id.as_ref(),
                    step_key.as_ref(),
                )
                .await
                .map_err(repository_error)?;
            }
            GateAction::SpawnLinkedCopy { department_id } => {
                spawn_linked_copy(&state, &solicitation, department_id).await?;
            }
            GateAction::StampPayload { key, value } => {
                if let Some(object) = payload.as_object_mut() {
                    object.insert(key.clone(), serde_json::Value::String(value.clone()));
                    payload_dirty = true;
                }
            }
            GateAction::NotifyStepEntry { prefer_kind, department_id } => {
                notify_after = Some((*prefer_kind, department_id.clone()));
            }
        }
    }

    if payload_dirty {
        repo.save_payload(&solicitation.id, &payload).await.map_err(repository_error)?;
    }

    let decision_label = if outcome.decision.approved { "approved" } else { "rejected" };
    let mut event = AuditEvent::new(
        Some(solicitation.id.clone()),
        correlation_id,
        "approval.decision_recorded",
        AuditCategory::Approval,
        actor.user_id.0.clone(),
        AuditOutcome::Success,
    )
    .with_metadata("decision", decision_label);
    if let Some(rule_id) = &outcome.matched_rule_id {
        event = event.with_metadata("rule", rule_id.clone());
    }
    append_history(&state, &solicitation.id, &actor.user_id, &outcome.timeline_message, event)
        .await?;

    if let Some((prefer_kind, department_id)) = notify_after {
        state
            .notifier
            .notify_step_entry_best_effort(&solicitation.id, prefer_kind, department_id)
            .await;
    }

    let refreshed = load_solicitation(&state, &id).await?;
    Ok(Json(SolicitationResponse::from(&refreshed)))
}

/// Termination approvals open a mirrored record for payroll processing.
async fn spawn_linked_copy(
    state: &EngineState,
    original: &Solicitation,
    department_id: &DepartmentId,
) -> Result<(), (StatusCode, Json<ApiError>)> {
    let mut payload = original.payload.clone();
    if let Some(object) = payload.as_object_mut() {
        object.remove(MARKER_KEY);
    }

    let now = Utc::now();
    let child = Solicitation {
        id: SolicitationId(format!("SOL-{}", Uuid::new_v4().simple())),
        protocol: format!("{}.1", original.protocol),
        type_key: original.type_key.clone(),
        payload,
        status: SolicitationStatus::Open,
        requires_approval: false,
        approval: ApprovalState::NotRequired,
        approver_id: None,
        department_id: Some(department_id.clone()),
        current_step_key: None,
        cost_center_id: None,
        parent_id: Some(original.id.clone()),
        requester_id: original.requester_id.clone(),
        requester_name: original.requester_name.clone(),
        decision: None,
        created_at: now,
        updated_at: now,
        closed_at: None,
    };

    SqlSolicitationRepository::new(state.pool.clone())
        .save(child)
        .await
        .map_err(repository_error)
}

async fn finalize(
    State(state): State<EngineState>,
    Path(id): Path<String>,
    Json(request): Json<FinalizeRequest>,
) -> ApiResult<SolicitationResponse> {
    let correlation_id = format!("req-{}", Uuid::new_v4().simple());
    let solicitation = load_solicitation(&state, &id).await?;
    gate::check_finalizable(&solicitation).map_err(map_gate_error)?;

    let definition =
        resolve_definition(&state, &solicitation.type_key, solicitation.department_id.as_ref())
            .await?;
    let step = current_step(&solicitation, &definition)
        .map_err(|error| map_gate_error(GateError::IntegrityViolation { message: error.to_string() }))?;
    if !is_last_actionable(step, &definition) {
        return Err(map_gate_error(GateError::conflict(reasons::NOT_FINAL_STEP)));
    }

    let actor = actor_context(&state, &request.actor_id).await;
    let holding = step.department_id.as_ref().or(solicitation.department_id.as_ref());
    gate::authorize_finalize(Some(&actor), holding).map_err(map_gate_error)?;

    let closed = SqlSolicitationRepository::new(state.pool.clone())
        .close_if_open(&solicitation.id, Utc::now())
        .await
        .map_err(repository_error)?;
    if !closed {
        return Err(map_gate_error(GateError::conflict(reasons::ALREADY_CLOSED)));
    }

    append_history(
        &state,
        &solicitation.id,
        &actor.user_id,
        &format!("Solicitação encerrada por {}", actor.name),
        AuditEvent::new(
            Some(solicitation.id.clone()),
            correlation_id,
            "workflow.finalized",
            AuditCategory::Workflow,
            actor.user_id.0.clone(),
            AuditOutcome::Success,
        )
        .with_metadata("step", step.key.0.clone()),
    )
    .await?;

    let refreshed = load_solicitation(&state, &id).await?;
    Ok(Json(SolicitationResponse::from(&refreshed)))
}

#[derive(Debug, Serialize)]
pub struct AllocationResponse {
    pub solicitation: SolicitationResponse,
    pub document_id: String,
    pub assignment_id: String,
    pub signing_url: Option<String>,
}

async fn allocate(
    State(state): State<EngineState>,
    Path(id): Path<String>,
    Json(request): Json<AllocateRequest>,
) -> ApiResult<AllocationResponse> {
    let correlation_id = format!("req-{}", Uuid::new_v4().simple());
    let solicitation = load_solicitation(&state, &id).await?;
    if solicitation.is_terminal() {
        return Err(map_gate_error(GateError::conflict(reasons::ALREADY_CLOSED)));
    }

    let actor = actor_context(&state, &request.actor_id).await;
    let item_id = EquipmentItemId(request.item_id.clone());
    let item = SqlEquipmentRepository::new(state.pool.clone())
        .find_by_id(&item_id)
        .await
        .map_err(repository_error)?
        .ok_or_else(|| map_gate_error(GateError::not_found("equipment item", &request.item_id)))?;
    gate::check_allocatable(&item).map_err(map_gate_error)?;

    let directory = SqlDirectoryRepository::new(state.pool.clone());
    let requester = directory
        .find_user(&solicitation.requester_id)
        .await
        .map_err(repository_error)?
        .ok_or_else(|| {
            map_gate_error(GateError::not_found("user", solicitation.requester_id.0.clone()))
        })?;

    // The envelope is opened before the transaction; a provider outage
    // aborts the allocation with nothing persisted.
    let envelope = match &state.esign {
        Some(client) => Some(
            client
                .create_envelope(
                    &format!("termo-{}.pdf", solicitation.protocol),
                    &request.pdf_url,
                    &requester.name,
                    &requester.email,
                )
                .await
                .map_err(|error| {
                    map_gate_error(GateError::unavailable("signature provider", error.to_string()))
                })?,
        ),
        None => None,
    };

    let now = Utc::now();
    let document_id = format!("DOC-{}", Uuid::new_v4().simple());
    let assignment_id = format!("ASG-{}", Uuid::new_v4().simple());
    let signing_url = envelope.as_ref().and_then(|envelope| envelope.signing_url.clone());

    let mut tx = state.pool.begin().await.map_err(|error| repository_error(error.into()))?;

    let allocated = sqlx::query(
        "UPDATE equipment_item SET status = 'assigned', owner_id = ?, updated_at = ?
         WHERE id = ? AND status = 'in_stock'",
    )
    .bind(&solicitation.requester_id.0)
    .bind(now.to_rfc3339())
    .bind(&item_id.0)
    .execute(&mut *tx)
    .await
    .map_err(|error| repository_error(error.into()))?
    .rows_affected()
        > 0;
    if !allocated {
        tx.rollback().await.ok();
        return Err(map_gate_error(GateError::conflict(reasons::ITEM_NOT_IN_STOCK)));
    }

    sqlx::query(
        "INSERT INTO document (id, solicitation_id, title, file_url, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&document_id)
    .bind(&solicitation.id.0)
    .bind(format!("Termo de responsabilidade — {}", solicitation.protocol))
    .bind(&request.pdf_url)
    .bind(now.to_rfc3339())
    .execute(&mut *tx)
    .await
    .map_err(|error| repository_error(error.into()))?;

    sqlx::query(
        "INSERT INTO document_assignment
             (id, document_id, signer_id, signer_email, status, provider, external_id,
              signing_url, created_at, updated_at)
         VALUES (?, ?, ?, ?, 'awaiting_signature', 'assinatura-digital', ?, ?, ?, ?)",
    )
    .bind(&assignment_id)
    .bind(&document_id)
    .bind(&requester.id.0)
    .bind(&requester.email)
    .bind(envelope.as_ref().map(|envelope| envelope.envelope_id.as_str()))
    .bind(signing_url.as_deref())
    .bind(now.to_rfc3339())
    .bind(now.to_rfc3339())
    .execute(&mut *tx)
    .await
    .map_err(|error| repository_error(error.into()))?;

    let updated = sqlx::query(
        "UPDATE solicitation SET
             approval_status = 'approved',
             requires_approval = 0,
             status = 'awaiting_term',
             updated_at = ?
         WHERE id = ? AND status NOT IN ('closed', 'cancelled')",
    )
    .bind(now.to_rfc3339())
    .bind(&solicitation.id.0)
    .execute(&mut *tx)
    .await
    .map_err(|error| repository_error(error.into()))?
    .rows_affected()
        > 0;
    if !updated {
        tx.rollback().await.ok();
        return Err(map_gate_error(GateError::conflict(reasons::ALREADY_CLOSED)));
    }

    sqlx::query(
        "INSERT INTO timeline_entry (id, solicitation_id, message, actor_id, occurred_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(format!("TL-{}", Uuid::new_v4().simple()))
    .bind(&solicitation.id.0)
    .bind(format!("Equipamento {} alocado, termo aguardando assinatura", item.label))
    .bind(&actor.user_id.0)
    .bind(now.to_rfc3339())
    .execute(&mut *tx)
    .await
    .map_err(|error| repository_error(error.into()))?;

    sqlx::query(
        "INSERT INTO audit_event
             (id, solicitation_id, correlation_id, event_type, category, actor, outcome,
              metadata, occurred_at)
         VALUES (?, ?, ?, 'equipment.allocated', 'approval', ?, 'success', ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&solicitation.id.0)
    .bind(&correlation_id)
    .bind(&actor.user_id.0)
    .bind(serde_json::json!({ "item": item.id.0, "assignment": assignment_id }).to_string())
    .bind(now.to_rfc3339())
    .execute(&mut *tx)
    .await
    .map_err(|error| repository_error(error.into()))?;

    tx.commit().await.map_err(|error| repository_error(error.into()))?;

    let refreshed = load_solicitation(&state, &id).await?;
    Ok(Json(AllocationResponse {
        solicitation: SolicitationResponse::from(&refreshed),
        document_id,
        assignment_id,
        signing_url,
    }))
}

async fn mark_out_of_stock(
    State(state): State<EngineState>,
    Path(id): Path<String>,
    Json(request): Json<FinalizeRequest>,
) -> ApiResult<SolicitationResponse> {
    let correlation_id = format!("req-{}", Uuid::new_v4().simple());
    let solicitation = load_solicitation(&state, &id).await?;
    if solicitation.is_terminal() {
        return Err(map_gate_error(GateError::conflict(reasons::ALREADY_CLOSED)));
    }

    let actor = actor_context(&state, &request.actor_id).await;
    gate::authorize_finalize(Some(&actor), solicitation.department_id.as_ref())
        .map_err(map_gate_error)?;

    let flipped = SqlSolicitationRepository::new(state.pool.clone())
        .require_approval(&solicitation.id, &state.stock_approver)
        .await
        .map_err(repository_error)?;
    if !flipped {
        return Err(map_gate_error(GateError::conflict(reasons::ALREADY_CLOSED)));
    }

    append_history(
        &state,
        &solicitation.id,
        &actor.user_id,
        "Equipamento sem estoque, aguardando aprovação de compra",
        AuditEvent::new(
            Some(solicitation.id.clone()),
            correlation_id,
            "equipment.out_of_stock",
            AuditCategory::Approval,
            actor.user_id.0.clone(),
            AuditOutcome::Success,
        )
        .with_metadata("approver", state.stock_approver.0.clone()),
    )
    .await?;

    state
        .notifier
        .notify_step_entry_best_effort(
            &solicitation.id,
            Some(tramita_core::StepKind::Approval),
            None,
        )
        .await;

    let refreshed = load_solicitation(&state, &id).await?;
    Ok(Json(SolicitationResponse::from(&refreshed)))
}
