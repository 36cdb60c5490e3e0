/**
 * Update Log Store
 *
 * Postgres-backed append-only log of CRDT updates, one stream per
 * document. The database assigns both `created_at` and the serial id,
 * which together define the total order. The log is authoritative
 * between snapshots; after a snapshot at time T the prefix strictly
 * before T may be truncated.
 */

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::LogStore;
use crate::error::ServiceError;

/// Append-only update log on the relational store.
#[derive(Clone)]
pub struct PgLogStore {
    pool: PgPool,
}

impl PgLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogStore for PgLogStore {
    async fn append(&self, doc_id: Uuid, update: &[u8]) -> Result<DateTime<Utc>, ServiceError> {
        let row = sqlx::query(
            r#"
            INSERT INTO crdt_updates (document_id, update_data)
            VALUES ($1, $2)
            RETURNING created_at
            "#,
        )
        .bind(doc_id)
        .bind(update)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("created_at"))
    }

    async fn count_since(
        &self,
        doc_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Result<i64, ServiceError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM crdt_updates
            WHERE document_id = $1
              AND ($2::timestamptz IS NULL OR created_at >= $2)
            "#,
        )
        .bind(doc_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn read_since(
        &self,
        doc_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Vec<u8>>, ServiceError> {
        let rows = sqlx::query(
            r#"
            SELECT update_data FROM crdt_updates
            WHERE document_id = $1
              AND ($2::timestamptz IS NULL OR created_at >= $2)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(doc_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.get("update_data")).collect())
    }

    async fn truncate_before(
        &self,
        doc_id: Uuid,
        before: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        let result = sqlx::query(
            r#"
            DELETE FROM crdt_updates
            WHERE document_id = $1 AND created_at < $2
            "#,
        )
        .bind(doc_id)
        .bind(before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_all(&self, doc_id: Uuid) -> Result<(), ServiceError> {
        sqlx::query(r#"DELETE FROM crdt_updates WHERE document_id = $1"#)
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
