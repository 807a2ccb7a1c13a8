use async_trait::async_trait;
use chrono::Utc;

use super::{ProcessedEventRepository, RepositoryError};
use crate::DbPool;

/// Provider webhook deliveries are at-least-once; this ledger makes each
/// event id single-use independently of the assignment's state.
pub struct SqlProcessedEventRepository {
    pool: DbPool,
}

impl SqlProcessedEventRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProcessedEventRepository for SqlProcessedEventRepository {
    async fn exists(&self, event_id: &str) -> Result<bool, RepositoryError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM processed_event WHERE event_id = ?")
                .bind(event_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count > 0)
    }

    async fn insert_if_absent(
        &self,
        event_id: &str,
        envelope_id: &str,
        status: &str,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO processed_event (event_id, envelope_id, status, processed_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(event_id)
        .bind(envelope_id)
        .bind(status)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::SqlProcessedEventRepository;
    use crate::repositories::ProcessedEventRepository;
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn replayed_event_ids_insert_only_once() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let repo = SqlProcessedEventRepository::new(pool);

        assert!(!repo.exists("evt-1").await.expect("exists"));
        assert!(repo.insert_if_absent("evt-1", "env-1", "completed").await.expect("first"));
        assert!(!repo.insert_if_absent("evt-1", "env-1", "completed").await.expect("replay"));
        assert!(repo.exists("evt-1").await.expect("exists"));
    }
}
