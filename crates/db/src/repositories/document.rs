use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use tramita_core::domain::directory::UserId;
use tramita_core::domain::document::{
    AssignmentId, AssignmentStatus, Document, DocumentAssignment, DocumentId,
};
use tramita_core::domain::solicitation::SolicitationId;

use super::{DocumentRepository, RepositoryError};
use crate::DbPool;

pub struct SqlDocumentRepository {
    pool: DbPool,
}

impl SqlDocumentRepository {
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

const ASSIGNMENT_COLUMNS: &str = "id, document_id, signer_id, signer_email, status, provider, \
     external_id, signing_url, audit_trail_url, audit_trail_hash, signed_at, created_at, updated_at";

fn row_to_assignment(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<DocumentAssignment, RepositoryError> {
    let id: String = row.try_get("id").map_err(decode)?;
    let document_id: String = row.try_get("document_id").map_err(decode)?;
    let signer_id: String = row.try_get("signer_id").map_err(decode)?;
    let signer_email: String = row.try_get("signer_email").map_err(decode)?;
    let status_raw: String = row.try_get("status").map_err(decode)?;
    let provider: String = row.try_get("provider").map_err(decode)?;
    let external_id: Option<String> = row.try_get("external_id").map_err(decode)?;
    let signing_url: Option<String> = row.try_get("signing_url").map_err(decode)?;
    let audit_trail_url: Option<String> = row.try_get("audit_trail_url").map_err(decode)?;
    let audit_trail_hash: Option<String> = row.try_get("audit_trail_hash").map_err(decode)?;
    let signed_at: Option<String> = row.try_get("signed_at").map_err(decode)?;
    let created_at: String = row.try_get("created_at").map_err(decode)?;
    let updated_at: String = row.try_get("updated_at").map_err(decode)?;

    Ok(DocumentAssignment {
        id: AssignmentId(id),
        document_id: DocumentId(document_id),
        signer_id: UserId(signer_id),
        signer_email,
        status: AssignmentStatus::parse(&status_raw).ok_or_else(|| {
            RepositoryError::Decode(format!("unknown assignment status `{status_raw}`"))
        })?,
        provider,
        external_id,
        signing_url,
        audit_trail_url,
        audit_trail_hash,
        signed_at: signed_at.as_deref().map(parse_timestamp).transpose()?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[async_trait]
impl DocumentRepository for SqlDocumentRepository {
    async fn find_document(&self, id: &DocumentId) -> Result<Option<Document>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, solicitation_id, title, file_url, created_at FROM document WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: String = row.try_get("id").map_err(decode)?;
        let solicitation_id: Option<String> = row.try_get("solicitation_id").map_err(decode)?;
        let title: String = row.try_get("title").map_err(decode)?;
        let file_url: String = row.try_get("file_url").map_err(decode)?;
        let created_at: String = row.try_get("created_at").map_err(decode)?;

        Ok(Some(Document {
            id: DocumentId(id),
            solicitation_id: solicitation_id.map(SolicitationId),
            title,
            file_url,
            created_at: parse_timestamp(&created_at)?,
        }))
    }

    async fn save_document(&self, document: Document) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO document (id, solicitation_id, title, file_url, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 title = excluded.title,
                 file_url = excluded.file_url",
        )
        .bind(&document.id.0)
        .bind(document.solicitation_id.as_ref().map(|id| id.0.as_str()))
        .bind(&document.title)
        .bind(&document.file_url)
        .bind(document.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_assignment_by_id(
        &self,
        id: &AssignmentId,
    ) -> Result<Option<DocumentAssignment>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM document_assignment WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref row) => Ok(Some(row_to_assignment(row)?)),
            None => Ok(None),
        }
    }

    async fn find_assignment_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<DocumentAssignment>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM document_assignment WHERE external_id = ?"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref row) => Ok(Some(row_to_assignment(row)?)),
            None => Ok(None),
        }
    }

    async fn save_assignment(
        &self,
        assignment: DocumentAssignment,
    ) -> Result<(), RepositoryError> {
        // The external id is deliberately absent from the update set: once
        // an envelope is bound, re-signing requires a fresh assignment.
        sqlx::query(
            "INSERT INTO document_assignment
                 (id, document_id, signer_id, signer_email, status, provider, external_id,
                  signing_url, audit_trail_url, audit_trail_hash, signed_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 signing_url = excluded.signing_url,
                 audit_trail_url = excluded.audit_trail_url,
                 audit_trail_hash = excluded.audit_trail_hash,
                 signed_at = excluded.signed_at,
                 updated_at = excluded.updated_at",
        )
        .bind(&assignment.id.0)
        .bind(&assignment.document_id.0)
        .bind(&assignment.signer_id.0)
        .bind(&assignment.signer_email)
        .bind(assignment.status.as_str())
        .bind(&assignment.provider)
        .bind(assignment.external_id.as_deref())
        .bind(assignment.signing_url.as_deref())
        .bind(assignment.audit_trail_url.as_deref())
        .bind(assignment.audit_trail_hash.as_deref())
        .bind(assignment.signed_at.map(|dt| dt.to_rfc3339()))
        .bind(assignment.created_at.to_rfc3339())
        .bind(assignment.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn pending_assignments_for_solicitation(
        &self,
        solicitation_id: &SolicitationId,
    ) -> Result<u64, RepositoryError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM document_assignment a
             JOIN document d ON d.id = a.document_id
             WHERE d.solicitation_id = ? AND a.status NOT IN ('signed', 'declined')",
        )
        .bind(&solicitation_id.0)
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u64)
    }

    async fn mark_signed_if_pending(
        &self,
        id: &AssignmentId,
        signed_at: DateTime<Utc>,
        audit_trail_url: &str,
        audit_trail_hash: &str,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE document_assignment SET
                 status = 'signed',
                 signed_at = ?,
                 audit_trail_url = ?,
                 audit_trail_hash = ?,
                 updated_at = ?
             WHERE id = ? AND status NOT IN ('signed', 'declined')",
        )
        .bind(signed_at.to_rfc3339())
        .bind(audit_trail_url)
        .bind(audit_trail_hash)
        .bind(Utc::now().to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_declined_if_pending(&self, id: &AssignmentId) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE document_assignment SET status = 'declined', updated_at = ?
             WHERE id = ? AND status NOT IN ('signed', 'declined')",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
