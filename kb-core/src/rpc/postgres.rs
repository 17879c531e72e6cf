//! PostgreSQL-backed [`RpcServerQueue`] / [`RpcClientQueue`].
//!
//! Server-side push/claim reuse the `dequeue_jobs` CTE idiom with the delta
//! being priority ordering (`ORDER BY priority DESC, request_timestamp ASC`)
//! and an advisory-lock wrap (grounded on `locks.rs::advisory_xact_lock`) so a
//! burst of concurrent pushes against one `server_path` serialize on a single
//! lock key rather than racing each other through SKIP LOCKED repeatedly.
//! Client-side push/claim use the same CTE shape with `is_new_result` in place
//! of `state`.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{RpcClientQueue, RpcServerQueue};
use crate::error::{KbError, Result};
use crate::lock_key::lock_key;
use crate::path::Path;
use crate::provision::pg as provision;
use crate::retry::{is_lock_contention, with_retry, RetryPolicy};
use crate::types::{RpcClientSlot, RpcReply, RpcServerRequest, RpcServerSlot, RpcServerState};

fn is_retryable(err: &KbError) -> bool {
    matches!(err, KbError::StorageFailure(e) if e.downcast_ref::<sqlx::Error>().map(is_lock_contention).unwrap_or(false))
}

pub struct PostgresRpcServerQueue {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PostgresRpcServerQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, retry: RetryPolicy::default() }
    }
}

fn row_to_server_slot(row: sqlx::postgres::PgRow, server_path: &Path) -> Result<RpcServerSlot> {
    let state_str: String = row.get("state");
    let state = RpcServerState::parse(&state_str)
        .ok_or_else(|| KbError::invalid(format!("unknown rpc server state: {state_str:?}")))?;
    Ok(RpcServerSlot {
        id: row.get("id"),
        server_path: server_path.clone(),
        request_id: row.get("request_id"),
        rpc_action: row.get("rpc_action"),
        request_payload: row.get("request_payload"),
        transaction_tag: row.get("transaction_tag"),
        priority: row.get("priority"),
        rpc_client_queue: row.get("rpc_client_queue"),
        state,
        request_timestamp: row.get("request_timestamp"),
        processing_timestamp: row.get("processing_timestamp"),
        completed_timestamp: row.get("completed_timestamp"),
    })
}

#[async_trait]
impl RpcServerQueue for PostgresRpcServerQueue {
    async fn provision(&self, server_path: &Path, capacity: usize) -> Result<()> {
        provision::provision_rpc_server(&self.pool, server_path, capacity).await
    }

    async fn push(&self, server_path: &Path, request: RpcServerRequest) -> Result<RpcServerSlot> {
        let kb = crate::provision::owning_kb(server_path)?;
        let table = crate::provision::rpc_server_table(kb);
        let key = lock_key(&table, &server_path.render());

        with_retry(self.retry, "rpc_server_push", |e| is_retryable(e), || {
            let pool = self.pool.clone();
            let table = table.clone();
            let server_path = server_path.clone();
            let request_id = request.request_id.unwrap_or_else(Uuid::new_v4);
            let rpc_action = request.rpc_action.clone();
            let request_payload = request.request_payload.clone();
            let transaction_tag = request.transaction_tag.clone();
            let priority = request.priority;
            let rpc_client_queue = request.rpc_client_queue.clone();
            async move {
                let mut tx = pool.begin().await.map_err(KbError::from)?;
                sqlx::query("SELECT pg_advisory_xact_lock($1)")
                    .bind(key)
                    .execute(&mut *tx)
                    .await
                    .map_err(KbError::from)?;

                let row = sqlx::query(&format!(
                    r#"
                    WITH claimed AS (
                        SELECT id FROM {table}
                        WHERE server_path = $1 AND state = 'empty'
                        ORDER BY priority DESC, request_timestamp ASC NULLS FIRST
                        LIMIT 1
                        FOR UPDATE
                    )
                    UPDATE {table}
                    SET request_id = $2, rpc_action = $3, request_payload = $4,
                        transaction_tag = $5, priority = $6, rpc_client_queue = $7,
                        state = 'new_job', request_timestamp = now(), completed_timestamp = NULL
                    FROM claimed
                    WHERE {table}.id = claimed.id
                    RETURNING {table}.id, {table}.request_id, {table}.rpc_action,
                              {table}.request_payload, {table}.transaction_tag,
                              {table}.priority, {table}.rpc_client_queue, {table}.state,
                              {table}.request_timestamp, {table}.processing_timestamp,
                              {table}.completed_timestamp
                    "#
                ))
                .bind(server_path.render())
                .bind(request_id)
                .bind(&rpc_action)
                .bind(&request_payload)
                .bind(&transaction_tag)
                .bind(priority)
                .bind(&rpc_client_queue)
                .fetch_optional(&mut *tx)
                .await
                .map_err(KbError::from)?;

                let row = match row {
                    Some(row) => row,
                    None => return Err(KbError::no_slot(format!("rpc server pool exhausted for {server_path}"))),
                };
                let slot = row_to_server_slot(row, &server_path)?;
                tx.commit().await.map_err(KbError::from)?;
                Ok(slot)
            }
        })
        .await
    }

    async fn peek_and_claim(&self, server_path: &Path) -> Result<Option<RpcServerSlot>> {
        let kb = crate::provision::owning_kb(server_path)?;
        let table = crate::provision::rpc_server_table(kb);

        with_retry(self.retry, "rpc_server_peek_and_claim", |e| is_retryable(e), || {
            let pool = self.pool.clone();
            let table = table.clone();
            let server_path = server_path.clone();
            async move {
                let row = sqlx::query(&format!(
                    r#"
                    WITH claimed AS (
                        SELECT id FROM {table}
                        WHERE server_path = $1 AND state = 'new_job'
                        ORDER BY priority DESC, request_timestamp ASC
                        LIMIT 1
                        FOR UPDATE SKIP LOCKED
                    )
                    UPDATE {table}
                    SET state = 'processing', processing_timestamp = now()
                    FROM claimed
                    WHERE {table}.id = claimed.id
                    RETURNING {table}.id, {table}.request_id, {table}.rpc_action,
                              {table}.request_payload, {table}.transaction_tag,
                              {table}.priority, {table}.rpc_client_queue, {table}.state,
                              {table}.request_timestamp, {table}.processing_timestamp,
                              {table}.completed_timestamp
                    "#
                ))
                .bind(server_path.render())
                .fetch_optional(&pool)
                .await
                .map_err(KbError::from)?;

                row.map(|row| row_to_server_slot(row, &server_path)).transpose()
            }
        })
        .await
    }

    async fn mark_completion(&self, server_path: &Path, id: i64) -> Result<bool> {
        let kb = crate::provision::owning_kb(server_path)?;
        let table = crate::provision::rpc_server_table(kb);
        let result = sqlx::query(&format!(
            r#"
            UPDATE {table} SET state = 'empty', completed_timestamp = now()
            WHERE id = $1 AND server_path = $2 AND state = 'processing'
            "#
        ))
        .bind(id)
        .bind(server_path.render())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_by_state(&self, server_path: &Path, state: RpcServerState) -> Result<usize> {
        let kb = crate::provision::owning_kb(server_path)?;
        let table = crate::provision::rpc_server_table(kb);
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT count(*) FROM {table} WHERE server_path = $1 AND state = $2"
        ))
        .bind(server_path.render())
        .bind(state.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn list_by_state(&self, server_path: &Path, state: RpcServerState) -> Result<Vec<RpcServerSlot>> {
        let kb = crate::provision::owning_kb(server_path)?;
        let table = crate::provision::rpc_server_table(kb);
        let rows = sqlx::query(&format!(
            r#"
            SELECT id, request_id, rpc_action, request_payload, transaction_tag,
                   priority, rpc_client_queue, state, request_timestamp,
                   processing_timestamp, completed_timestamp
            FROM {table}
            WHERE server_path = $1 AND state = $2
            ORDER BY priority DESC, request_timestamp ASC
            "#
        ))
        .bind(server_path.render())
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|row| row_to_server_slot(row, server_path)).collect()
    }

    async fn clear(&self, server_path: &Path) -> Result<()> {
        let kb = crate::provision::owning_kb(server_path)?;
        let table = crate::provision::rpc_server_table(kb);
        sqlx::query(&format!("LOCK TABLE {table} IN EXCLUSIVE MODE NOWAIT"))
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET request_id = gen_random_uuid(), rpc_action = '', request_payload = '{{}}'::jsonb,
                transaction_tag = NULL, priority = 0, rpc_client_queue = NULL,
                state = 'empty', request_timestamp = NULL, processing_timestamp = NULL,
                completed_timestamp = NULL
            WHERE server_path = $1
            "#
        ))
        .bind(server_path.render())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub struct PostgresRpcClientQueue {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PostgresRpcClientQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, retry: RetryPolicy::default() }
    }
}

fn row_to_client_slot(row: sqlx::postgres::PgRow, client_path: &Path) -> RpcClientSlot {
    RpcClientSlot {
        id: row.get("id"),
        client_path: client_path.clone(),
        request_id: row.get("request_id"),
        server_path: row.get("server_path"),
        rpc_action: row.get("rpc_action"),
        transaction_tag: row.get("transaction_tag"),
        response_payload: row.get("response_payload"),
        response_timestamp: row.get("response_timestamp"),
        is_new_result: row.get("is_new_result"),
    }
}

#[async_trait]
impl RpcClientQueue for PostgresRpcClientQueue {
    async fn provision(&self, client_path: &Path, capacity: usize) -> Result<()> {
        provision::provision_rpc_client(&self.pool, client_path, capacity).await
    }

    async fn push_and_claim_reply(&self, client_path: &Path, reply: RpcReply) -> Result<RpcClientSlot> {
        let kb = crate::provision::owning_kb(client_path)?;
        let table = crate::provision::rpc_client_table(kb);

        with_retry(self.retry, "rpc_client_push_and_claim_reply", |e| is_retryable(e), || {
            let pool = self.pool.clone();
            let table = table.clone();
            let client_path = client_path.clone();
            let reply = reply.clone();
            async move {
                let row = sqlx::query(&format!(
                    r#"
                    WITH claimed AS (
                        SELECT id FROM {table}
                        WHERE client_path = $1 AND is_new_result = FALSE
                        ORDER BY response_timestamp ASC NULLS FIRST, id ASC
                        LIMIT 1
                        FOR UPDATE SKIP LOCKED
                    )
                    UPDATE {table}
                    SET request_id = $2, server_path = $3, rpc_action = $4,
                        transaction_tag = $5, response_payload = $6,
                        response_timestamp = now(), is_new_result = TRUE
                    FROM claimed
                    WHERE {table}.id = claimed.id
                    RETURNING {table}.id, {table}.request_id, {table}.server_path,
                              {table}.rpc_action, {table}.transaction_tag,
                              {table}.response_payload, {table}.response_timestamp,
                              {table}.is_new_result
                    "#
                ))
                .bind(client_path.render())
                .bind(reply.request_id)
                .bind(&reply.server_path)
                .bind(&reply.rpc_action)
                .bind(&reply.transaction_tag)
                .bind(&reply.reply_data)
                .fetch_optional(&pool)
                .await
                .map_err(KbError::from)?;

                match row {
                    Some(row) => Ok(row_to_client_slot(row, &client_path)),
                    None => Err(KbError::no_slot(format!("rpc client pool exhausted for {client_path}"))),
                }
            }
        })
        .await
    }

    async fn peek_and_claim_reply(&self, client_path: &Path) -> Result<Option<RpcClientSlot>> {
        let kb = crate::provision::owning_kb(client_path)?;
        let table = crate::provision::rpc_client_table(kb);

        with_retry(self.retry, "rpc_client_peek_and_claim_reply", |e| is_retryable(e), || {
            let pool = self.pool.clone();
            let table = table.clone();
            let client_path = client_path.clone();
            async move {
                let row = sqlx::query(&format!(
                    r#"
                    WITH claimed AS (
                        SELECT id FROM {table}
                        WHERE client_path = $1 AND is_new_result = TRUE
                        ORDER BY response_timestamp ASC NULLS FIRST, id ASC
                        LIMIT 1
                        FOR UPDATE SKIP LOCKED
                    )
                    UPDATE {table}
                    SET is_new_result = FALSE
                    FROM claimed
                    WHERE {table}.id = claimed.id
                    RETURNING {table}.id, {table}.request_id, {table}.server_path,
                              {table}.rpc_action, {table}.transaction_tag,
                              {table}.response_payload, {table}.response_timestamp,
                              claimed.id AS claimed_id
                    "#
                ))
                .bind(client_path.render())
                .fetch_optional(&pool)
                .await
                .map_err(KbError::from)?;

                Ok(row.map(|row| RpcClientSlot {
                    id: row.get("id"),
                    client_path: client_path.clone(),
                    request_id: row.get("request_id"),
                    server_path: row.get("server_path"),
                    rpc_action: row.get("rpc_action"),
                    transaction_tag: row.get("transaction_tag"),
                    response_payload: row.get("response_payload"),
                    response_timestamp: row.get("response_timestamp"),
                    is_new_result: true,
                }))
            }
        })
        .await
    }

    async fn count_free(&self, client_path: &Path) -> Result<usize> {
        let kb = crate::provision::owning_kb(client_path)?;
        let table = crate::provision::rpc_client_table(kb);
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT count(*) FROM {table} WHERE client_path = $1 AND is_new_result = FALSE"
        ))
        .bind(client_path.render())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn count_queued(&self, client_path: &Path) -> Result<usize> {
        let kb = crate::provision::owning_kb(client_path)?;
        let table = crate::provision::rpc_client_table(kb);
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT count(*) FROM {table} WHERE client_path = $1 AND is_new_result = TRUE"
        ))
        .bind(client_path.render())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn list_waiting(&self, client_path: &Path) -> Result<Vec<RpcClientSlot>> {
        let kb = crate::provision::owning_kb(client_path)?;
        let table = crate::provision::rpc_client_table(kb);
        let rows = sqlx::query(&format!(
            r#"
            SELECT id, request_id, server_path, rpc_action, transaction_tag,
                   response_payload, response_timestamp, is_new_result
            FROM {table}
            WHERE client_path = $1 AND is_new_result = TRUE
            ORDER BY response_timestamp ASC NULLS FIRST, id ASC
            "#
        ))
        .bind(client_path.render())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| row_to_client_slot(row, client_path)).collect())
    }

    async fn clear(&self, client_path: &Path) -> Result<()> {
        let kb = crate::provision::owning_kb(client_path)?;
        let table = crate::provision::rpc_client_table(kb);
        sqlx::query(&format!("LOCK TABLE {table} IN EXCLUSIVE MODE NOWAIT"))
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET request_id = gen_random_uuid(), server_path = $1, response_payload = '{{}}'::jsonb,
                response_timestamp = now(), is_new_result = FALSE
            WHERE client_path = $1
            "#
        ))
        .bind(client_path.render())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(all(test, feature = "postgres"))]
mod tests {
    use super::*;

    async fn setup_pool() -> PgPool {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql:///kb_core_test".to_string());
        PgPool::connect(&url).await.expect("connect to db")
    }

    #[tokio::test]
    #[ignore]
    async fn rpc_priority_ordering_pg() {
        let pool = setup_pool().await;
        let server = PostgresRpcServerQueue::new(pool);
        let path = Path::parse("pgkb1.rpc.worker").unwrap();
        server.provision(&path, 4).await.unwrap();

        for priority in [1, 3, 2, 3] {
            server
                .push(
                    &path,
                    RpcServerRequest {
                        request_id: None,
                        rpc_action: "act".to_string(),
                        request_payload: serde_json::json!({}),
                        transaction_tag: None,
                        priority,
                        rpc_client_queue: None,
                    },
                )
                .await
                .unwrap();
        }

        let mut claimed = Vec::new();
        while let Some(slot) = server.peek_and_claim(&path).await.unwrap() {
            claimed.push(slot.priority);
        }
        assert_eq!(claimed, vec![3, 3, 2, 1]);
    }

    #[tokio::test]
    #[ignore]
    async fn push_orders_empty_slots_by_stale_priority_not_id() {
        let pool = setup_pool().await;
        let server = PostgresRpcServerQueue::new(pool);
        let path = Path::parse("pgkb1.rpc.recycled").unwrap();
        server.provision(&path, 3).await.unwrap();

        let request = |priority| RpcServerRequest {
            request_id: None,
            rpc_action: "act".to_string(),
            request_payload: serde_json::json!({}),
            transaction_tag: None,
            priority,
            rpc_client_queue: None,
        };

        let recycled = server.push(&path, request(5)).await.unwrap();
        let claimed = server.peek_and_claim(&path).await.unwrap().unwrap();
        assert_eq!(claimed.id, recycled.id);
        server.mark_completion(&path, claimed.id).await.unwrap();

        let pushed = server.push(&path, request(1)).await.unwrap();
        assert_eq!(
            pushed.id, recycled.id,
            "stale priority 5 empty slot should win over untouched priority 0 slots"
        );
    }
}
