//! Provisioning (§3.8): folding pre-allocation into the core rather than treating
//! it as an external setup step. Each slot-pool table (`<kb>_job`, `<kb>_stream`,
//! `<kb>_rpc_server`, `<kb>_rpc_client`) is created lazily and grown additively —
//! `provision` never removes rows, it only tops a path's pool up to `capacity`.
//!
//! `kb` is validated with [`crate::path::valid`] before any DDL string is built;
//! the per-kb tables this module manages all live in the table-name alphabet that
//! validation guarantees.

use crate::error::{KbError, Result};
use crate::path::Path;

pub fn check_kb_name(kb: &str) -> Result<()> {
    if !crate::path::valid(kb) {
        return Err(KbError::invalid(format!("invalid kb name: {kb:?}")));
    }
    Ok(())
}

/// Table name for a kb's job slot pool.
pub fn job_table(kb: &str) -> String {
    format!("{kb}_job")
}

/// Table name for a kb's stream slot pool.
pub fn stream_table(kb: &str) -> String {
    format!("{kb}_stream")
}

/// Table name for a kb's RPC server slot pool.
pub fn rpc_server_table(kb: &str) -> String {
    format!("{kb}_rpc_server")
}

/// Table name for a kb's RPC client slot pool.
pub fn rpc_client_table(kb: &str) -> String {
    format!("{kb}_rpc_client")
}

/// Extract the owning kb from a slot path (its first label), matching §3.8's
/// "tables are per kb, slots are per path within that kb" layout.
pub fn owning_kb(path: &Path) -> Result<&str> {
    path.labels()
        .first()
        .map(|s| s.as_str())
        .ok_or_else(|| KbError::invalid("path must have at least one label"))
}

#[cfg(feature = "postgres")]
pub mod pg {
    use super::*;
    use sqlx::PgPool;

    pub async fn ensure_job_table(pool: &PgPool, kb: &str) -> Result<()> {
        check_kb_name(kb)?;
        let table = job_table(kb);
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id BIGSERIAL PRIMARY KEY,
                path TEXT NOT NULL,
                data JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                schedule_at TIMESTAMPTZ,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                is_active BOOLEAN NOT NULL DEFAULT FALSE,
                valid BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#
        ))
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn provision_job(pool: &PgPool, path: &Path, capacity: usize) -> Result<()> {
        let kb = owning_kb(path)?;
        ensure_job_table(pool, kb).await?;
        let table = job_table(kb);

        let existing: i64 = sqlx::query_scalar(&format!("SELECT count(*) FROM {table} WHERE path = $1"))
            .bind(path.render())
            .fetch_one(pool)
            .await?;

        let to_add = capacity.saturating_sub(existing as usize);
        for _ in 0..to_add {
            sqlx::query(&format!(
                r#"INSERT INTO {table} (path, data, completed_at, is_active, valid)
                   VALUES ($1, '{{}}'::jsonb, now(), FALSE, FALSE)"#
            ))
            .bind(path.render())
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    pub async fn ensure_stream_table(pool: &PgPool, kb: &str) -> Result<()> {
        check_kb_name(kb)?;
        let table = stream_table(kb);
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id BIGSERIAL PRIMARY KEY,
                path TEXT NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                data JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                valid BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#
        ))
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn provision_stream(pool: &PgPool, path: &Path, capacity: usize) -> Result<()> {
        let kb = owning_kb(path)?;
        ensure_stream_table(pool, kb).await?;
        let table = stream_table(kb);

        let existing: i64 = sqlx::query_scalar(&format!("SELECT count(*) FROM {table} WHERE path = $1"))
            .bind(path.render())
            .fetch_one(pool)
            .await?;

        let to_add = capacity.saturating_sub(existing as usize);
        for _ in 0..to_add {
            sqlx::query(&format!(
                r#"INSERT INTO {table} (path, recorded_at, data, valid)
                   VALUES ($1, now(), '{{}}'::jsonb, FALSE)"#
            ))
            .bind(path.render())
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    pub async fn ensure_rpc_server_table(pool: &PgPool, kb: &str) -> Result<()> {
        check_kb_name(kb)?;
        let table = rpc_server_table(kb);
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id BIGSERIAL PRIMARY KEY,
                server_path TEXT NOT NULL,
                request_id UUID NOT NULL,
                rpc_action TEXT NOT NULL DEFAULT '',
                request_payload JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                transaction_tag TEXT,
                priority INTEGER NOT NULL DEFAULT 0,
                rpc_client_queue TEXT,
                state TEXT NOT NULL DEFAULT 'empty',
                request_timestamp TIMESTAMPTZ,
                processing_timestamp TIMESTAMPTZ,
                completed_timestamp TIMESTAMPTZ
            )
            "#
        ))
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn provision_rpc_server(pool: &PgPool, path: &Path, capacity: usize) -> Result<()> {
        let kb = owning_kb(path)?;
        ensure_rpc_server_table(pool, kb).await?;
        let table = rpc_server_table(kb);

        let existing: i64 =
            sqlx::query_scalar(&format!("SELECT count(*) FROM {table} WHERE server_path = $1"))
                .bind(path.render())
                .fetch_one(pool)
                .await?;

        let to_add = capacity.saturating_sub(existing as usize);
        for _ in 0..to_add {
            sqlx::query(&format!(
                r#"INSERT INTO {table} (server_path, request_id, state)
                   VALUES ($1, gen_random_uuid(), 'empty')"#
            ))
            .bind(path.render())
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    pub async fn ensure_rpc_client_table(pool: &PgPool, kb: &str) -> Result<()> {
        check_kb_name(kb)?;
        let table = rpc_client_table(kb);
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id BIGSERIAL PRIMARY KEY,
                client_path TEXT NOT NULL,
                request_id UUID NOT NULL,
                server_path TEXT NOT NULL,
                rpc_action TEXT NOT NULL DEFAULT '',
                transaction_tag TEXT,
                response_payload JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                response_timestamp TIMESTAMPTZ,
                is_new_result BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#
        ))
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn provision_rpc_client(pool: &PgPool, path: &Path, capacity: usize) -> Result<()> {
        let kb = owning_kb(path)?;
        ensure_rpc_client_table(pool, kb).await?;
        let table = rpc_client_table(kb);

        let existing: i64 =
            sqlx::query_scalar(&format!("SELECT count(*) FROM {table} WHERE client_path = $1"))
                .bind(path.render())
                .fetch_one(pool)
                .await?;

        let to_add = capacity.saturating_sub(existing as usize);
        for _ in 0..to_add {
            sqlx::query(&format!(
                r#"INSERT INTO {table} (client_path, request_id, server_path, response_timestamp, is_new_result)
                   VALUES ($1, gen_random_uuid(), $1, now(), FALSE)"#
            ))
            .bind(path.render())
            .execute(pool)
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owning_kb_extracts_first_label() {
        let path = Path::parse("kb1.jobs.worker").unwrap();
        assert_eq!(owning_kb(&path).unwrap(), "kb1");
    }

    #[test]
    fn table_names_follow_naming_scheme() {
        assert_eq!(job_table("kb1"), "kb1_job");
        assert_eq!(stream_table("kb1"), "kb1_stream");
        assert_eq!(rpc_server_table("kb1"), "kb1_rpc_server");
        assert_eq!(rpc_client_table("kb1"), "kb1_rpc_client");
    }
}
