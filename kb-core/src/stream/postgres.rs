//! PostgreSQL-backed [`StreamEngine`], using the same CTE claim idiom as the
//! job queue (`store_postgres.rs::dequeue_jobs`), adapted to the
//! overwrite-oldest rule: selection never filters on `valid`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use super::{compute_statistics, StreamEngine};
use crate::error::{KbError, Result};
use crate::path::Path;
use crate::provision::pg as provision;
use crate::retry::{is_lock_contention, with_retry, RetryPolicy};
use crate::types::{Json, SortOrder, StreamSlot, StreamStatistics};

pub struct PostgresStreamEngine {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PostgresStreamEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, retry: RetryPolicy::default() }
    }
}

fn row_to_slot(row: sqlx::postgres::PgRow, path: &Path) -> StreamSlot {
    StreamSlot {
        id: row.get("id"),
        path: path.clone(),
        recorded_at: row.get("recorded_at"),
        data: row.get("data"),
        valid: row.get("valid"),
    }
}

fn is_retryable(err: &KbError) -> bool {
    matches!(err, KbError::StorageFailure(e) if e.downcast_ref::<sqlx::Error>().map(is_lock_contention).unwrap_or(false))
}

#[async_trait]
impl StreamEngine for PostgresStreamEngine {
    async fn provision(&self, path: &Path, capacity: usize) -> Result<()> {
        provision::provision_stream(&self.pool, path, capacity).await
    }

    async fn push(&self, path: &Path, data: Json) -> Result<StreamSlot> {
        let kb = crate::provision::owning_kb(path)?;
        let table = crate::provision::stream_table(kb);

        let zero: i64 = sqlx::query_scalar(&format!("SELECT count(*) FROM {table} WHERE path = $1"))
            .bind(path.render())
            .fetch_one(&self.pool)
            .await?;
        if zero == 0 {
            return Err(KbError::not_found(format!("no stream slots provisioned for {path}")));
        }

        with_retry(self.retry, "stream_push", |e| is_retryable(e), || {
            let pool = self.pool.clone();
            let table = table.clone();
            let path = path.clone();
            let data = data.clone();
            async move {
                let row = sqlx::query(&format!(
                    r#"
                    WITH claimed AS (
                        SELECT id FROM {table}
                        WHERE path = $1
                        ORDER BY recorded_at ASC, id ASC
                        LIMIT 1
                        FOR UPDATE SKIP LOCKED
                    )
                    UPDATE {table}
                    SET data = $2, recorded_at = now(), valid = TRUE
                    FROM claimed
                    WHERE {table}.id = claimed.id
                    RETURNING {table}.id, {table}.recorded_at, {table}.data, {table}.valid
                    "#
                ))
                .bind(path.render())
                .bind(&data)
                .fetch_optional(&pool)
                .await
                .map_err(KbError::from)?;

                match row {
                    Some(row) => Ok(row_to_slot(row, &path)),
                    None => Err(KbError::no_slot(format!("no lockable stream slot for {path}"))),
                }
            }
        })
        .await
    }

    async fn get_latest(&self, path: &Path) -> Result<Option<StreamSlot>> {
        let kb = crate::provision::owning_kb(path)?;
        let table = crate::provision::stream_table(kb);
        let row = sqlx::query(&format!(
            "SELECT id, recorded_at, data, valid FROM {table} WHERE path = $1 AND valid = TRUE ORDER BY recorded_at DESC LIMIT 1"
        ))
        .bind(path.render())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| row_to_slot(r, path)))
    }

    async fn list(
        &self,
        path: &Path,
        limit: usize,
        offset: usize,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
        order: SortOrder,
    ) -> Result<Vec<StreamSlot>> {
        let kb = crate::provision::owning_kb(path)?;
        let table = crate::provision::stream_table(kb);
        let order_sql = match order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        let rows = sqlx::query(&format!(
            r#"
            SELECT id, recorded_at, data, valid FROM {table}
            WHERE path = $1 AND valid = TRUE
              AND ($2::timestamptz IS NULL OR recorded_at > $2)
              AND ($3::timestamptz IS NULL OR recorded_at < $3)
            ORDER BY recorded_at {order_sql}
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(path.render())
        .bind(after)
        .bind(before)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| row_to_slot(r, path)).collect())
    }

    async fn range(&self, path: &Path, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<StreamSlot>> {
        let kb = crate::provision::owning_kb(path)?;
        let table = crate::provision::stream_table(kb);
        let rows = sqlx::query(&format!(
            r#"
            SELECT id, recorded_at, data, valid FROM {table}
            WHERE path = $1 AND valid = TRUE AND recorded_at >= $2 AND recorded_at <= $3
            ORDER BY recorded_at ASC
            "#
        ))
        .bind(path.render())
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| row_to_slot(r, path)).collect())
    }

    async fn count(&self, path: &Path, include_invalid: bool) -> Result<usize> {
        let kb = crate::provision::owning_kb(path)?;
        let table = crate::provision::stream_table(kb);
        let sql = if include_invalid {
            format!("SELECT count(*) FROM {table} WHERE path = $1")
        } else {
            format!("SELECT count(*) FROM {table} WHERE path = $1 AND valid = TRUE")
        };
        let count: i64 = sqlx::query_scalar(&sql).bind(path.render()).fetch_one(&self.pool).await?;
        Ok(count as usize)
    }

    async fn clear(&self, path: &Path, older_than: Option<DateTime<Utc>>) -> Result<()> {
        let kb = crate::provision::owning_kb(path)?;
        let table = crate::provision::stream_table(kb);
        sqlx::query(&format!(
            "UPDATE {table} SET valid = FALSE WHERE path = $1 AND ($2::timestamptz IS NULL OR recorded_at < $2)"
        ))
        .bind(path.render())
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn statistics(&self, path: &Path) -> Result<StreamStatistics> {
        let kb = crate::provision::owning_kb(path)?;
        let table = crate::provision::stream_table(kb);
        let rows: Vec<(DateTime<Utc>,)> = sqlx::query_as(&format!(
            "SELECT recorded_at FROM {table} WHERE path = $1 AND valid = TRUE"
        ))
        .bind(path.render())
        .fetch_all(&self.pool)
        .await?;
        Ok(compute_statistics(rows.into_iter().map(|(t,)| t).collect()))
    }
}

#[cfg(all(test, feature = "postgres"))]
mod tests {
    use super::*;

    async fn setup() -> PostgresStreamEngine {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql:///kb_core_test".to_string());
        let pool = PgPool::connect(&url).await.expect("connect to db");
        PostgresStreamEngine::new(pool)
    }

    #[tokio::test]
    #[ignore]
    async fn overwrite_oldest_pg() {
        let engine = setup().await;
        let path = Path::parse("pgkb1.metrics.cpu").unwrap();
        engine.provision(&path, 2).await.unwrap();
        engine.push(&path, serde_json::json!({"n": 1})).await.unwrap();
        engine.push(&path, serde_json::json!({"n": 2})).await.unwrap();
        engine.push(&path, serde_json::json!({"n": 3})).await.unwrap();
        assert_eq!(engine.count(&path, true).await.unwrap(), 2);
    }
}
