//! PostgreSQL-backed [`GraphStore`], grounded on the teacher's
//! `PostgresProcessStore`: a thin `sqlx::PgPool` wrapper issuing dynamic
//! `sqlx::query()`/`query_as()` calls (no compile-time `query!` macros) and
//! `INSERT ... ON CONFLICT` for idempotent writes.
//!
//! Per-kb tables are created lazily by `create_kb`, naming them the way
//! provisioning (§3.8) does: `<kb>` (nodes), `<kb>_info` (existence marker),
//! `<kb>_link`, `<kb>_link_mount`. `kb` is always validated through
//! [`crate::path::valid`] before interpolation into a table name, since label
//! syntax (`[A-Za-z_][A-Za-z0-9_]*`) is also safe Postgres identifier syntax.
//! `link_name` is unique across the whole fabric, so a small static
//! `kb_link_registry` table maps it to the owning kb for `find_mount`/`find_links`.

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use super::GraphStore;
use crate::error::{KbError, Result};
use crate::path::Path;
use crate::query::QueryComposer;
use crate::types::{Link, LinkMount, NewNode, Node};

pub struct PostgresGraphStore {
    pool: PgPool,
}

impl PostgresGraphStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_link_registry(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kb_link_registry (
                link_name TEXT PRIMARY KEY,
                kb TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn check_kb_name(kb: &str) -> Result<()> {
        if !crate::path::valid(kb) {
            return Err(KbError::invalid(format!("invalid kb name: {kb:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl GraphStore for PostgresGraphStore {
    async fn create_kb(&self, name: &str, description: Option<&str>) -> Result<()> {
        Self::check_kb_name(name)?;
        self.ensure_link_registry().await?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS {name}_info (kb TEXT PRIMARY KEY, description TEXT)"#
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {name} (
                path TEXT PRIMARY KEY,
                label TEXT NOT NULL,
                name TEXT NOT NULL,
                properties JSONB NOT NULL,
                data JSONB NOT NULL,
                has_link BOOLEAN NOT NULL DEFAULT FALSE,
                has_link_mount BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {name}_link_mount (
                link_name TEXT PRIMARY KEY,
                mount_path TEXT NOT NULL UNIQUE REFERENCES {name}(path),
                description TEXT
            )
            "#
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {name}_link (
                id BIGSERIAL PRIMARY KEY,
                link_name TEXT NOT NULL,
                parent_path TEXT NOT NULL REFERENCES {name}(path)
            )
            "#
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            r#"
            INSERT INTO {name}_info (kb, description) VALUES ($1, $2)
            ON CONFLICT (kb) DO NOTHING
            "#
        ))
        .bind(name)
        .bind(description)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn kb_exists(&self, name: &str) -> Result<bool> {
        Self::check_kb_name(name)?;
        let row = sqlx::query("SELECT to_regclass($1) IS NOT NULL AS present")
            .bind(format!("{name}_info"))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<bool, _>("present"))
    }

    async fn add_node(&self, node: NewNode) -> Result<()> {
        Self::check_kb_name(&node.kb)?;
        if !self.kb_exists(&node.kb).await? {
            return Err(KbError::not_found(format!("kb does not exist: {}", node.kb)));
        }
        let kb = &node.kb;
        let properties = serde_json::to_value(&node.properties)?;
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {kb} (path, label, name, properties, data, has_link, has_link_mount)
            VALUES ($1, $2, $3, $4, $5, FALSE, FALSE)
            ON CONFLICT (path) DO NOTHING
            "#
        ))
        .bind(node.path.render())
        .bind(&node.label)
        .bind(&node.name)
        .bind(&properties)
        .bind(&node.data)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(KbError::conflict(format!(
                "path already used in kb {}: {}",
                node.kb, node.path
            )));
        }
        Ok(())
    }

    async fn get_node(&self, kb: &str, path: &Path) -> Result<Option<Node>> {
        Self::check_kb_name(kb)?;
        let row = sqlx::query(&format!(
            "SELECT path, label, name, properties, data, has_link, has_link_mount FROM {kb} WHERE path = $1"
        ))
        .bind(path.render())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some(row) => Ok(Some(row_to_node(kb, row)?)),
        }
    }

    async fn find_nodes(&self, kb: &str, query: &QueryComposer) -> Result<Vec<Node>> {
        Self::check_kb_name(kb)?;
        let (where_clause, params) = query.compile_sql(1);
        let sql = format!(
            "SELECT path, label, name, properties, data, has_link, has_link_mount FROM {kb} WHERE {where_clause}"
        );
        let mut q = sqlx::query(&sql);
        for param in &params {
            q = match param {
                crate::query::FilterParam::Text(t) => q.bind(t.clone()),
                crate::query::FilterParam::Json(j) => q.bind(j.clone()),
                crate::query::FilterParam::Bool(b) => q.bind(*b),
            };
        }
        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(|row| row_to_node(kb, row)).collect()
    }

    async fn add_link_mount(
        &self,
        kb: &str,
        path: &Path,
        link_name: &str,
        description: Option<&str>,
    ) -> Result<()> {
        Self::check_kb_name(kb)?;
        self.ensure_link_registry().await?;
        if !self.kb_exists(kb).await? {
            return Err(KbError::not_found(format!("kb does not exist: {kb}")));
        }

        let mut tx = self.pool.begin().await?;

        let exists: Option<(String,)> =
            sqlx::query_as(&format!("SELECT path FROM {kb} WHERE path = $1"))
                .bind(path.render())
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(KbError::not_found(format!("no node at {kb}:{path}")));
        }

        let inserted = sqlx::query(
            "INSERT INTO kb_link_registry (link_name, kb) VALUES ($1, $2) ON CONFLICT (link_name) DO NOTHING",
        )
        .bind(link_name)
        .bind(kb)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(KbError::conflict(format!("link name already mounted: {link_name}")));
        }

        let mounted = sqlx::query(&format!(
            r#"
            INSERT INTO {kb}_link_mount (link_name, mount_path, description)
            VALUES ($1, $2, $3)
            ON CONFLICT (mount_path) DO NOTHING
            "#
        ))
        .bind(link_name)
        .bind(path.render())
        .bind(description)
        .execute(&mut *tx)
        .await?;
        if mounted.rows_affected() == 0 {
            return Err(KbError::conflict(format!("{kb}:{path} is already mounted under another name")));
        }

        sqlx::query(&format!("UPDATE {kb} SET has_link_mount = TRUE WHERE path = $1"))
            .bind(path.render())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn add_link(&self, parent_kb: &str, parent_path: &Path, link_name: &str) -> Result<()> {
        Self::check_kb_name(parent_kb)?;
        self.ensure_link_registry().await?;

        let mut tx = self.pool.begin().await?;

        let exists: Option<(String,)> =
            sqlx::query_as(&format!("SELECT path FROM {parent_kb} WHERE path = $1"))
                .bind(parent_path.render())
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(KbError::not_found(format!("no node at {parent_kb}:{parent_path}")));
        }

        let mount_kb: Option<(String,)> =
            sqlx::query_as("SELECT kb FROM kb_link_registry WHERE link_name = $1")
                .bind(link_name)
                .fetch_optional(&mut *tx)
                .await?;
        if mount_kb.is_none() {
            return Err(KbError::not_found(format!("no mount named {link_name}")));
        }

        sqlx::query(&format!(
            "INSERT INTO {parent_kb}_link (link_name, parent_path) VALUES ($1, $2)"
        ))
        .bind(link_name)
        .bind(parent_path.render())
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!("UPDATE {parent_kb} SET has_link = TRUE WHERE path = $1"))
            .bind(parent_path.render())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn find_mount(&self, link_name: &str) -> Result<Option<LinkMount>> {
        self.ensure_link_registry().await?;
        let owner: Option<(String,)> =
            sqlx::query_as("SELECT kb FROM kb_link_registry WHERE link_name = $1")
                .bind(link_name)
                .fetch_optional(&self.pool)
                .await?;
        let Some((kb,)) = owner else { return Ok(None) };

        let row = sqlx::query(&format!(
            "SELECT link_name, mount_path, description FROM {kb}_link_mount WHERE link_name = $1"
        ))
        .bind(link_name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let mount_path: String = row.get("mount_path");
                Ok(Some(LinkMount {
                    link_name: row.get("link_name"),
                    kb,
                    mount_path: Path::parse(&mount_path)?,
                    description: row.get("description"),
                }))
            }
        }
    }

    async fn find_links(&self, link_name: &str) -> Result<Vec<Link>> {
        self.ensure_link_registry().await?;
        let owner: Option<(String,)> =
            sqlx::query_as("SELECT kb FROM kb_link_registry WHERE link_name = $1")
                .bind(link_name)
                .fetch_optional(&self.pool)
                .await?;
        let Some((kb,)) = owner else { return Ok(Vec::new()) };

        let rows = sqlx::query(&format!(
            "SELECT link_name, parent_path FROM {kb}_link WHERE link_name = $1"
        ))
        .bind(link_name)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let parent_path: String = row.get("parent_path");
                Ok(Link {
                    link_name: row.get("link_name"),
                    parent_kb: kb.clone(),
                    parent_path: Path::parse(&parent_path)?,
                })
            })
            .collect()
    }
}

fn row_to_node(kb: &str, row: sqlx::postgres::PgRow) -> Result<Node> {
    let path: String = row.get("path");
    let properties_json: serde_json::Value = row.get("properties");
    Ok(Node {
        kb: kb.to_string(),
        label: row.get("label"),
        name: row.get("name"),
        properties: serde_json::from_value(properties_json)?,
        data: row.get("data"),
        path: Path::parse(&path)?,
        has_link: row.get("has_link"),
        has_link_mount: row.get("has_link_mount"),
    })
}

#[cfg(all(test, feature = "postgres"))]
mod tests {
    use super::*;
    use crate::types::Properties;

    async fn setup() -> PostgresGraphStore {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql:///kb_core_test".to_string());
        let pool = PgPool::connect(&url).await.expect("connect to db");
        PostgresGraphStore::new(pool)
    }

    fn new_node(kb: &str, path: &str, label: &str) -> NewNode {
        NewNode {
            kb: kb.to_string(),
            label: label.to_string(),
            name: path.to_string(),
            properties: Properties::new(),
            data: serde_json::json!({}),
            path: Path::parse(path).unwrap(),
        }
    }

    #[tokio::test]
    #[ignore]
    async fn create_kb_and_add_node_round_trip() {
        let store = setup().await;
        store.create_kb("pgkb1", Some("test kb")).await.unwrap();
        assert!(store.kb_exists("pgkb1").await.unwrap());

        store.add_node(new_node("pgkb1", "pgkb1.a", "L")).await.unwrap();
        let node = store
            .get_node("pgkb1", &Path::parse("pgkb1.a").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node.label, "L");
    }

    #[tokio::test]
    #[ignore]
    async fn link_wiring_round_trip() {
        let store = setup().await;
        store.create_kb("pgkb2", None).await.unwrap();
        let path = Path::parse("pgkb2.root").unwrap();
        store.add_node(new_node("pgkb2", "pgkb2.root", "L")).await.unwrap();

        store.add_link_mount("pgkb2", &path, "pglink1", None).await.unwrap();
        store.add_link("pgkb2", &path, "pglink1").await.unwrap();

        let mount = store.find_mount("pglink1").await.unwrap().unwrap();
        assert_eq!(mount.kb, "pgkb2");

        let links = store.find_links("pglink1").await.unwrap();
        assert_eq!(links.len(), 1);
    }

    #[tokio::test]
    #[ignore]
    async fn add_link_mount_rejects_second_name_on_same_path() {
        let store = setup().await;
        store.create_kb("pgkb3", None).await.unwrap();
        let path = Path::parse("pgkb3.root").unwrap();
        store.add_node(new_node("pgkb3", "pgkb3.root", "L")).await.unwrap();

        store.add_link_mount("pgkb3", &path, "pgm1", None).await.unwrap();
        let err = store.add_link_mount("pgkb3", &path, "pgm2", None).await.unwrap_err();
        assert!(matches!(err, KbError::Conflict(_)));
    }
}
