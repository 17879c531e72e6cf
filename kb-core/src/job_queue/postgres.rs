//! PostgreSQL-backed [`JobQueueEngine`], grounded directly on the teacher's
//! `dequeue_jobs`: a `WITH claimed AS (... FOR UPDATE SKIP LOCKED) UPDATE ...
//! RETURNING` CTE for atomic claims, wrapped in [`crate::retry::with_retry`]
//! for serialization/deadlock/lock-not-available contention.

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use super::JobQueueEngine;
use crate::error::{KbError, Result};
use crate::path::Path;
use crate::provision::pg as provision;
use crate::retry::{is_lock_contention, with_retry, RetryPolicy};
use crate::types::{JobSlot, Json};

pub struct PostgresJobQueue {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, retry: RetryPolicy::default() }
    }

    pub fn with_retry_policy(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }
}

fn row_to_slot(row: sqlx::postgres::PgRow, path: &Path) -> JobSlot {
    JobSlot {
        id: row.get("id"),
        path: path.clone(),
        data: row.get("data"),
        schedule_at: row.get("schedule_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        is_active: row.get("is_active"),
        valid: row.get("valid"),
    }
}

#[async_trait]
impl JobQueueEngine for PostgresJobQueue {
    async fn provision(&self, path: &Path, capacity: usize) -> Result<()> {
        provision::provision_job(&self.pool, path, capacity).await
    }

    async fn count_queued(&self, path: &Path) -> Result<usize> {
        let kb = crate::provision::owning_kb(path)?;
        let table = crate::provision::job_table(kb);
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT count(*) FROM {table} WHERE path = $1 AND valid = TRUE"
        ))
        .bind(path.render())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn count_free(&self, path: &Path) -> Result<usize> {
        let kb = crate::provision::owning_kb(path)?;
        let table = crate::provision::job_table(kb);
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT count(*) FROM {table} WHERE path = $1 AND valid = FALSE"
        ))
        .bind(path.render())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn push(&self, path: &Path, data: Json) -> Result<JobSlot> {
        let kb = crate::provision::owning_kb(path)?;
        let table = crate::provision::job_table(kb);

        with_retry(self.retry, "job_push", |e| is_retryable(e), || {
            let pool = self.pool.clone();
            let table = table.clone();
            let path = path.clone();
            let data = data.clone();
            async move {
                let row = sqlx::query(&format!(
                    r#"
                    WITH claimed AS (
                        SELECT id FROM {table}
                        WHERE path = $1 AND valid = FALSE
                        ORDER BY completed_at ASC NULLS FIRST, id ASC
                        LIMIT 1
                        FOR UPDATE SKIP LOCKED
                    )
                    UPDATE {table}
                    SET data = $2, schedule_at = now(), started_at = now(),
                        completed_at = now(), valid = TRUE, is_active = FALSE
                    FROM claimed
                    WHERE {table}.id = claimed.id
                    RETURNING {table}.id, {table}.data, {table}.schedule_at,
                              {table}.started_at, {table}.completed_at,
                              {table}.is_active, {table}.valid
                    "#
                ))
                .bind(path.render())
                .bind(&data)
                .fetch_optional(&pool)
                .await
                .map_err(KbError::from)?;

                match row {
                    Some(row) => Ok(row_to_slot(row, &path)),
                    None => Err(KbError::no_slot(format!("job pool exhausted for {path}"))),
                }
            }
        })
        .await
    }

    async fn peek_and_claim(&self, path: &Path) -> Result<Option<JobSlot>> {
        let kb = crate::provision::owning_kb(path)?;
        let table = crate::provision::job_table(kb);

        with_retry(self.retry, "job_peek_and_claim", |e| is_retryable(e), || {
            let pool = self.pool.clone();
            let table = table.clone();
            let path = path.clone();
            async move {
                let row = sqlx::query(&format!(
                    r#"
                    WITH claimed AS (
                        SELECT id FROM {table}
                        WHERE path = $1 AND valid = TRUE AND is_active = FALSE
                              AND (schedule_at IS NULL OR schedule_at <= now())
                        ORDER BY schedule_at ASC NULLS FIRST, id ASC
                        LIMIT 1
                        FOR UPDATE SKIP LOCKED
                    )
                    UPDATE {table}
                    SET is_active = TRUE, started_at = now()
                    FROM claimed
                    WHERE {table}.id = claimed.id
                    RETURNING {table}.id, {table}.data, {table}.schedule_at,
                              {table}.started_at, {table}.completed_at,
                              {table}.is_active, {table}.valid
                    "#
                ))
                .bind(path.render())
                .fetch_optional(&pool)
                .await
                .map_err(KbError::from)?;

                Ok(row.map(|row| row_to_slot(row, &path)))
            }
        })
        .await
    }

    async fn mark_completed(&self, id: i64) -> Result<bool> {
        // The table is not known from `id` alone; callers are expected to operate
        // within a single kb's job table. We search the caller-agnostic way: the
        // in-memory backend's equivalent scans by id, so here we require the
        // caller to have provisioned exactly one job table reachable via `id`'s
        // originating `push`/`peek_and_claim` call — in practice this means the
        // embedding application tracks which kb a job id belongs to and the
        // Postgres backend is constructed per kb. We resolve this by scanning
        // `pg_tables` for `%_job` tables, which is acceptable off the hot path
        // relative to the per-call cost of a lock-mediated update.
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT tablename FROM pg_tables WHERE schemaname = 'public' AND tablename LIKE '%\\_job' ESCAPE '\\'",
        )
        .fetch_all(&self.pool)
        .await?;

        for (table,) in tables {
            let row = sqlx::query(&format!(
                "SELECT is_active FROM {table} WHERE id = $1 FOR UPDATE NOWAIT"
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else { continue };
            let is_active: bool = row.get("is_active");
            if !is_active {
                return Ok(false);
            }
            sqlx::query(&format!(
                "UPDATE {table} SET completed_at = now(), valid = FALSE, is_active = FALSE WHERE id = $1"
            ))
            .bind(id)
            .execute(&self.pool)
            .await?;
            return Ok(true);
        }
        Err(KbError::not_found(format!("no job slot with id {id}")))
    }

    async fn list_pending(&self, path: &Path, limit: usize, offset: usize) -> Result<Vec<JobSlot>> {
        let kb = crate::provision::owning_kb(path)?;
        let table = crate::provision::job_table(kb);
        let rows = sqlx::query(&format!(
            r#"
            SELECT id, data, schedule_at, started_at, completed_at, is_active, valid
            FROM {table}
            WHERE path = $1 AND valid = TRUE AND is_active = FALSE
            ORDER BY schedule_at ASC NULLS FIRST, id ASC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(path.render())
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| row_to_slot(r, path)).collect())
    }

    async fn list_active(&self, path: &Path, limit: usize, offset: usize) -> Result<Vec<JobSlot>> {
        let kb = crate::provision::owning_kb(path)?;
        let table = crate::provision::job_table(kb);
        let rows = sqlx::query(&format!(
            r#"
            SELECT id, data, schedule_at, started_at, completed_at, is_active, valid
            FROM {table}
            WHERE path = $1 AND is_active = TRUE
            ORDER BY started_at ASC NULLS FIRST, id ASC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(path.render())
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| row_to_slot(r, path)).collect())
    }

    async fn clear(&self, path: &Path) -> Result<()> {
        let kb = crate::provision::owning_kb(path)?;
        let table = crate::provision::job_table(kb);
        sqlx::query(&format!("LOCK TABLE {table} IN EXCLUSIVE MODE"))
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET data = '{{}}'::jsonb, schedule_at = NULL, started_at = NULL,
                completed_at = NULL, is_active = FALSE, valid = FALSE
            WHERE path = $1
            "#
        ))
        .bind(path.render())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn is_retryable(err: &KbError) -> bool {
    matches!(err, KbError::StorageFailure(e) if e.downcast_ref::<sqlx::Error>().map(is_lock_contention).unwrap_or(false))
}

#[cfg(all(test, feature = "postgres"))]
mod tests {
    use super::*;

    async fn setup() -> PostgresJobQueue {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql:///kb_core_test".to_string());
        let pool = PgPool::connect(&url).await.expect("connect to db");
        PostgresJobQueue::new(pool)
    }

    #[tokio::test]
    #[ignore]
    async fn scenario_a_job_round_trip_pg() {
        let q = setup().await;
        let path = Path::parse("pgkb1.jobs.worker").unwrap();
        q.provision(&path, 2).await.unwrap();

        let pushed = q.push(&path, serde_json::json!({"n": 1})).await.unwrap();
        let claimed = q.peek_and_claim(&path).await.unwrap().unwrap();
        assert_eq!(claimed.id, pushed.id);

        let completed = q.mark_completed(claimed.id).await.unwrap();
        assert!(completed);
    }

    /// Scenario F / testable property 3: two callers racing `peek_and_claim`
    /// against one pending slot never both succeed, and nothing ends up
    /// leased twice.
    #[tokio::test]
    #[ignore]
    async fn scenario_f_lock_retry() {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql:///kb_core_test".to_string());
        let pool = PgPool::connect(&url).await.expect("connect to db");
        let path = Path::parse("pgkb1.jobs.race").unwrap();
        let q = PostgresJobQueue::new(pool.clone());
        q.provision(&path, 1).await.unwrap();
        q.push(&path, serde_json::json!({"n": 1})).await.unwrap();

        let a = PostgresJobQueue::new(pool.clone());
        let b = PostgresJobQueue::new(pool.clone());
        let path_a = path.clone();
        let path_b = path.clone();
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { a.peek_and_claim(&path_a).await }),
            tokio::spawn(async move { b.peek_and_claim(&path_b).await }),
        );
        let claims: Vec<_> = [r1.unwrap().unwrap(), r2.unwrap().unwrap()]
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(claims.len(), 1);
        assert_eq!(q.list_active(&path, 10, 0).await.unwrap().len(), 1);
    }
}
