//! In-memory [`GraphStore`] backend — mirrors the teacher's `MemoryStore`
//! (`RwLock<Inner>` over plain collections), used for unit tests and as a
//! reference implementation of the spec's semantics without a live database.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::GraphStore;
use crate::error::{KbError, Result};
use crate::path::Path;
use crate::query::QueryComposer;
use crate::types::{Link, LinkMount, NewNode, Node};

struct Inner {
    kbs: HashMap<String, Option<String>>,
    nodes: HashMap<(String, Path), Node>,
    mounts: HashMap<String, LinkMount>,
    links: HashMap<String, Vec<Link>>,
}

/// In-memory implementation of [`GraphStore`].
pub struct MemoryGraphStore {
    inner: RwLock<Inner>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                kbs: HashMap::new(),
                nodes: HashMap::new(),
                mounts: HashMap::new(),
                links: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn create_kb(&self, name: &str, description: Option<&str>) -> Result<()> {
        if !crate::path::valid(name) {
            return Err(KbError::invalid(format!("invalid kb name: {name:?}")));
        }
        let mut w = self.inner.write().await;
        w.kbs.entry(name.to_string()).or_insert_with(|| description.map(str::to_string));
        Ok(())
    }

    async fn kb_exists(&self, name: &str) -> Result<bool> {
        let r = self.inner.read().await;
        Ok(r.kbs.contains_key(name))
    }

    async fn add_node(&self, node: NewNode) -> Result<()> {
        let mut w = self.inner.write().await;
        if !w.kbs.contains_key(&node.kb) {
            return Err(KbError::not_found(format!("kb does not exist: {}", node.kb)));
        }
        let key = (node.kb.clone(), node.path.clone());
        if w.nodes.contains_key(&key) {
            return Err(KbError::conflict(format!(
                "path already used in kb {}: {}",
                node.kb, node.path
            )));
        }
        w.nodes.insert(
            key,
            Node {
                kb: node.kb,
                label: node.label,
                name: node.name,
                properties: node.properties,
                data: node.data,
                path: node.path,
                has_link: false,
                has_link_mount: false,
            },
        );
        Ok(())
    }

    async fn get_node(&self, kb: &str, path: &Path) -> Result<Option<Node>> {
        let r = self.inner.read().await;
        Ok(r.nodes.get(&(kb.to_string(), path.clone())).cloned())
    }

    async fn find_nodes(&self, kb: &str, query: &QueryComposer) -> Result<Vec<Node>> {
        let r = self.inner.read().await;
        Ok(r.nodes
            .values()
            .filter(|n| n.kb == kb && query.matches(n))
            .cloned()
            .collect())
    }

    async fn add_link_mount(
        &self,
        kb: &str,
        path: &Path,
        link_name: &str,
        description: Option<&str>,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        if !w.kbs.contains_key(kb) {
            return Err(KbError::not_found(format!("kb does not exist: {kb}")));
        }
        let node_key = (kb.to_string(), path.clone());
        if !w.nodes.contains_key(&node_key) {
            return Err(KbError::not_found(format!("no node at {kb}:{path}")));
        }
        if w.mounts.contains_key(link_name) {
            return Err(KbError::conflict(format!("link name already mounted: {link_name}")));
        }
        if w.mounts.values().any(|m| m.kb == kb && &m.mount_path == path) {
            return Err(KbError::conflict(format!("{kb}:{path} is already mounted under another name")));
        }
        w.mounts.insert(
            link_name.to_string(),
            LinkMount {
                link_name: link_name.to_string(),
                kb: kb.to_string(),
                mount_path: path.clone(),
                description: description.map(str::to_string),
            },
        );
        if let Some(node) = w.nodes.get_mut(&node_key) {
            node.has_link_mount = true;
        }
        Ok(())
    }

    async fn add_link(&self, parent_kb: &str, parent_path: &Path, link_name: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        let parent_key = (parent_kb.to_string(), parent_path.clone());
        if !w.nodes.contains_key(&parent_key) {
            return Err(KbError::not_found(format!("no node at {parent_kb}:{parent_path}")));
        }
        if !w.mounts.contains_key(link_name) {
            return Err(KbError::not_found(format!("no mount named {link_name}")));
        }
        w.links.entry(link_name.to_string()).or_default().push(Link {
            link_name: link_name.to_string(),
            parent_kb: parent_kb.to_string(),
            parent_path: parent_path.clone(),
        });
        if let Some(node) = w.nodes.get_mut(&parent_key) {
            node.has_link = true;
        }
        Ok(())
    }

    async fn find_mount(&self, link_name: &str) -> Result<Option<LinkMount>> {
        let r = self.inner.read().await;
        Ok(r.mounts.get(link_name).cloned())
    }

    async fn find_links(&self, link_name: &str) -> Result<Vec<Link>> {
        let r = self.inner.read().await;
        Ok(r.links.get(link_name).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Properties;

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
    async fn add_node_requires_existing_kb() {
        let store = MemoryGraphStore::new();
        let err = store.add_node(new_node("kb1", "kb1.a", "L")).await.unwrap_err();
        assert!(matches!(err, KbError::NotFound(_)));
    }

    #[tokio::test]
    async fn add_node_rejects_duplicate_path() {
        let store = MemoryGraphStore::new();
        store.create_kb("kb1", None).await.unwrap();
        store.add_node(new_node("kb1", "kb1.a", "L")).await.unwrap();
        let err = store.add_node(new_node("kb1", "kb1.a", "L")).await.unwrap_err();
        assert!(matches!(err, KbError::Conflict(_)));
    }

    #[tokio::test]
    async fn create_kb_is_idempotent() {
        let store = MemoryGraphStore::new();
        store.create_kb("kb1", Some("first")).await.unwrap();
        store.create_kb("kb1", Some("second")).await.unwrap();
        assert!(store.kb_exists("kb1").await.unwrap());
    }

    /// Scenario E: link wiring end-to-end, including the second-mount conflict.
    #[tokio::test]
    async fn scenario_e_link_wiring() {
        let store = MemoryGraphStore::new();
        store.create_kb("kb1", None).await.unwrap();
        let path = Path::parse("kb1.root.a").unwrap();
        store.add_node(new_node("kb1", "kb1.root.a", "L")).await.unwrap();

        store.add_link_mount("kb1", &path, "m1", None).await.unwrap();
        store.add_link("kb1", &path, "m1").await.unwrap();

        let node = store.get_node("kb1", &path).await.unwrap().unwrap();
        assert!(node.has_link);
        assert!(node.has_link_mount);

        let err = store.add_link_mount("kb1", &path, "m1", None).await.unwrap_err();
        assert!(matches!(err, KbError::Conflict(_)));
    }

    #[tokio::test]
    async fn add_link_mount_rejects_second_name_on_same_path() {
        let store = MemoryGraphStore::new();
        store.create_kb("kb1", None).await.unwrap();
        let path = Path::parse("kb1.root.a").unwrap();
        store.add_node(new_node("kb1", "kb1.root.a", "L")).await.unwrap();

        store.add_link_mount("kb1", &path, "m1", None).await.unwrap();
        let err = store.add_link_mount("kb1", &path, "m2", None).await.unwrap_err();
        assert!(matches!(err, KbError::Conflict(_)));
    }

    #[tokio::test]
    async fn add_link_fails_without_mount() {
        let store = MemoryGraphStore::new();
        store.create_kb("kb1", None).await.unwrap();
        let path = Path::parse("kb1.a").unwrap();
        store.add_node(new_node("kb1", "kb1.a", "L")).await.unwrap();
        let err = store.add_link("kb1", &path, "missing").await.unwrap_err();
        assert!(matches!(err, KbError::NotFound(_)));
    }
}
