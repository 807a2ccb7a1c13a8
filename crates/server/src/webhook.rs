//! Inbound e-signature completion events.
//!
//! Deliveries are at-least-once and possibly out of order. Two layers keep
//! reconciliation single-shot: the processed-event ledger (unique insert on
//! the provider's event id, inside the same transaction as the state
//! change) and state guards on the assignment row itself.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::post,
    Router,
};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use tramita_core::domain::document::DocumentAssignment;
use tramita_core::reconcile::{plan_reconcile, sha256_hex, ReconcileAction};
use tramita_db::repositories::{
    DocumentRepository, ProcessedEventRepository, RepositoryError, SqlDocumentRepository,
    SqlProcessedEventRepository,
};
use tramita_esign::webhook::{verify_signature, SignatureEventPayload, SIGNATURE_HEADER};

use crate::state::EngineState;

pub fn router(state: EngineState) -> Router {
    Router::new().route("/api/v1/esign/events", post(ingest)).with_state(state)
}

#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalized: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct EventError {
    pub error: &'static str,
}

fn unauthorized() -> (StatusCode, Json<EventError>) {
    // One opaque answer for every authenticity failure.
    (StatusCode::UNAUTHORIZED, Json(EventError { error: "unauthorized" }))
}

fn internal(error: RepositoryError) -> (StatusCode, Json<EventError>) {
    warn!(event_name = "esign.repository_error", error = %error, "webhook repository error");
    (StatusCode::INTERNAL_SERVER_ERROR, Json(EventError { error: "internal error" }))
}

pub async fn ingest(
    State(state): State<EngineState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<EventResponse>, (StatusCode, Json<EventError>)> {
    let Some(secret) = &state.webhook_secret else {
        return Err(unauthorized());
    };
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(unauthorized)?;
    if !verify_signature(secret, &body, signature) {
        return Err(unauthorized());
    }

    let payload: SignatureEventPayload = serde_json::from_slice(&body).map_err(|_| {
        (StatusCode::BAD_REQUEST, Json(EventError { error: "malformed payload" }))
    })?;
    let status = tramita_core::ProviderEventStatus::parse(&payload.status);

    let events = SqlProcessedEventRepository::new(state.pool.clone());
    if events.exists(&payload.event_id).await.map_err(internal)? {
        return Ok(Json(EventResponse { result: "already_processed", finalized: None }));
    }

    // An envelope this system never tracked (or whose assignment is not yet
    // persisted) is acknowledged, never an error.
    let documents = SqlDocumentRepository::new(state.pool.clone());
    let Some(assignment) = documents
        .find_assignment_by_external_id(&payload.envelope_id)
        .await
        .map_err(internal)?
    else {
        info!(
            event_name = "esign.unknown_envelope",
            envelope_id = %payload.envelope_id,
            "ignoring event for untracked envelope"
        );
        return Ok(Json(EventResponse { result: "ignored", finalized: None }));
    };

    match plan_reconcile(&assignment, &status, false) {
        ReconcileAction::Ignore { reason } => {
            // Consume the event id so replays short-circuit earlier.
            events
                .insert_if_absent(&payload.event_id, &payload.envelope_id, &payload.status)
                .await
                .map_err(internal)?;
            info!(
                event_name = "esign.event_ignored",
                envelope_id = %payload.envelope_id,
                reason = %reason,
                "signature event ignored"
            );
            Ok(Json(EventResponse { result: "ignored", finalized: None }))
        }
        ReconcileAction::RecordDeclined => {
            record_declined(&state, &payload, &assignment).await
        }
        ReconcileAction::RecordSigned => record_signed(&state, &payload, &assignment).await,
    }
}

async fn record_declined(
    state: &EngineState,
    payload: &SignatureEventPayload,
    assignment: &DocumentAssignment,
) -> Result<Json<EventResponse>, (StatusCode, Json<EventError>)> {
    let mut tx = state.pool.begin().await.map_err(|error| internal(error.into()))?;

    let claimed = sqlx::query(
        "INSERT OR IGNORE INTO processed_event (event_id, envelope_id, status, processed_at)
         VALUES (?, ?, ?, ?)",
    )
    .bind(&payload.event_id)
    .bind(&payload.envelope_id)
    .bind(&payload.status)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *tx)
    .await
    .map_err(|error| internal(error.into()))?
    .rows_affected()
        > 0;
    if !claimed {
        tx.rollback().await.ok();
        return Ok(Json(EventResponse { result: "already_processed", finalized: None }));
    }

    sqlx::query(
        "UPDATE document_assignment SET status = 'declined', updated_at = ?
         WHERE id = ? AND status NOT IN ('signed', 'declined')",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(&assignment.id.0)
    .execute(&mut *tx)
    .await
    .map_err(|error| internal(error.into()))?;

    tx.commit().await.map_err(|error| internal(error.into()))?;
    Ok(Json(EventResponse { result: "declined", finalized: None }))
}

async fn record_signed(
    state: &EngineState,
    payload: &SignatureEventPayload,
    assignment: &DocumentAssignment,
) -> Result<Json<EventResponse>, (StatusCode, Json<EventError>)> {
    // External work happens before the transaction; a failure here aborts
    // with no partial SIGNED state and the event id still unclaimed, so the
    // provider's retry goes through the whole path again.
    let Some(client) = &state.esign else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(EventError { error: "signature provider not configured" }),
        ));
    };
    let certificate = client.download_certificate(&payload.envelope_id).await.map_err(|error| {
        warn!(
            event_name = "esign.certificate_download_failed",
            envelope_id = %payload.envelope_id,
            error = %error,
            "certificate download failed, leaving event unprocessed"
        );
        (StatusCode::SERVICE_UNAVAILABLE, Json(EventError { error: "certificate unavailable" }))
    })?;

    let audit_trail_hash = sha256_hex(&certificate);
    let audit_trail_url = state
        .blobs
        .store(&format!("certificado-{}.pdf", payload.envelope_id), &certificate)
        .await
        .map_err(|error| {
            warn!(
                event_name = "esign.certificate_store_failed",
                envelope_id = %payload.envelope_id,
                error = %error,
                "certificate upload failed, leaving event unprocessed"
            );
            (StatusCode::SERVICE_UNAVAILABLE, Json(EventError { error: "storage unavailable" }))
        })?;

    let signed_at = Utc::now();
    let mut tx = state.pool.begin().await.map_err(|error| internal(error.into()))?;

    let claimed = sqlx::query(
        "INSERT OR IGNORE INTO processed_event (event_id, envelope_id, status, processed_at)
         VALUES (?, ?, ?, ?)",
    )
    .bind(&payload.event_id)
    .bind(&payload.envelope_id)
    .bind(&payload.status)
    .bind(signed_at.to_rfc3339())
    .execute(&mut *tx)
    .await
    .map_err(|error| internal(error.into()))?
    .rows_affected()
        > 0;
    if !claimed {
        tx.rollback().await.ok();
        return Ok(Json(EventResponse { result: "already_processed", finalized: None }));
    }

    let signed = sqlx::query(
        "UPDATE document_assignment SET
             status = 'signed',
             signed_at = ?,
             audit_trail_url = ?,
             audit_trail_hash = ?,
             updated_at = ?
         WHERE id = ? AND status NOT IN ('signed', 'declined')",
    )
    .bind(signed_at.to_rfc3339())
    .bind(&audit_trail_url)
    .bind(&audit_trail_hash)
    .bind(signed_at.to_rfc3339())
    .bind(&assignment.id.0)
    .execute(&mut *tx)
    .await
    .map_err(|error| internal(error.into()))?
    .rows_affected()
        > 0;
    if !signed {
        // A concurrent delivery already applied the terminal state; keep
        // the ledger row and acknowledge.
        tx.commit().await.map_err(|error| internal(error.into()))?;
        return Ok(Json(EventResponse { result: "already_processed", finalized: None }));
    }

    // Close the owning solicitation once no assignment remains pending.
    // System-initiated: no department-membership check applies.
    let mut finalized = false;
    let owning: Option<(Option<String>,)> =
        sqlx::query_as("SELECT solicitation_id FROM document WHERE id = ?")
            .bind(&assignment.document_id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|error| internal(error.into()))?;

    if let Some((Some(solicitation_id),)) = owning {
        let (pending,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM document_assignment a
             JOIN document d ON d.id = a.document_id
             WHERE d.solicitation_id = ? AND a.status NOT IN ('signed', 'declined')",
        )
        .bind(&solicitation_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|error| internal(error.into()))?;

        if pending == 0 {
            finalized = sqlx::query(
                "UPDATE solicitation SET status = 'closed', closed_at = ?, updated_at = ?
                 WHERE id = ? AND status NOT IN ('closed', 'cancelled')",
            )
            .bind(signed_at.to_rfc3339())
            .bind(signed_at.to_rfc3339())
            .bind(&solicitation_id)
            .execute(&mut *tx)
            .await
            .map_err(|error| internal(error.into()))?
            .rows_affected()
                > 0;

            if finalized {
                sqlx::query(
                    "INSERT INTO timeline_entry (id, solicitation_id, message, actor_id, occurred_at)
                     VALUES (?, ?, 'Termo assinado, solicitação encerrada', NULL, ?)",
                )
                .bind(format!("TL-{}", Uuid::new_v4().simple()))
                .bind(&solicitation_id)
                .bind(signed_at.to_rfc3339())
                .execute(&mut *tx)
                .await
                .map_err(|error| internal(error.into()))?;

                sqlx::query(
                    "INSERT INTO audit_event
                         (id, solicitation_id, correlation_id, event_type, category, actor,
                          outcome, metadata, occurred_at)
                     VALUES (?, ?, ?, 'signature.completed', 'signature', 'system', 'success', ?, ?)",
                )
                .bind(Uuid::new_v4().to_string())
                .bind(&solicitation_id)
                .bind(format!("evt-{}", payload.event_id))
                .bind(
                    serde_json::json!({
                        "envelope": payload.envelope_id,
                        "assignment": assignment.id.0,
                    })
                    .to_string(),
                )
                .bind(signed_at.to_rfc3339())
                .execute(&mut *tx)
                .await
                .map_err(|error| internal(error.into()))?;
            }
        }
    }

    tx.commit().await.map_err(|error| internal(error.into()))?;
    Ok(Json(EventResponse { result: "signed", finalized: Some(finalized) }))
}
