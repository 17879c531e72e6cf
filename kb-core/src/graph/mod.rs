//! C2 — Graph store: owns the per-kb node table plus the link/link-mount edge
//! tables. See [`GraphStore`] for the operation contract.

#[cfg(feature = "postgres")]
pub mod postgres;

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::path::Path;
use crate::query::QueryComposer;
use crate::types::{Link, LinkMount, NewNode, Node};

/// Persistence contract for the hierarchical knowledge graph.
///
/// Tables owned, per kb: `<kb>` (nodes), `<kb>_info` (catalog/existence row for
/// this kb), `<kb>_link`, `<kb>_link_mount`. All mutations run in one
/// transaction; on any violation the transaction rolls back and no partial
/// state persists.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Create the kb's catalog entry (and backing tables, for a provisioning-aware
    /// backend). Idempotent on `name`: a second call with the same name is a
    /// no-op success.
    async fn create_kb(&self, name: &str, description: Option<&str>) -> Result<()>;

    /// `true` if `create_kb` has been called for this name.
    async fn kb_exists(&self, name: &str) -> Result<bool>;

    /// Insert a new node. Fails with [`crate::error::KbError::NotFound`] if `kb`
    /// doesn't exist, or [`crate::error::KbError::Conflict`] if `path` is already
    /// used within `kb`. `has_link`/`has_link_mount` are always initialized `false`.
    async fn add_node(&self, node: NewNode) -> Result<()>;

    /// Fetch the node at `(kb, path)`, if any.
    async fn get_node(&self, kb: &str, path: &Path) -> Result<Option<Node>>;

    /// Run a compiled query against this kb's node table.
    async fn find_nodes(&self, kb: &str, query: &QueryComposer) -> Result<Vec<Node>>;

    /// Create a link-mount: the target side of a named edge. Fails if `kb` is
    /// missing, no node exists at `path`, or `link_name` is already mounted
    /// anywhere. Sets the mounted node's `has_link_mount = true`.
    async fn add_link_mount(
        &self,
        kb: &str,
        path: &Path,
        link_name: &str,
        description: Option<&str>,
    ) -> Result<()>;

    /// Create a link: the source side of a named edge. Fails if the parent node
    /// is missing or `link_name` has no mount. Sets the parent node's
    /// `has_link = true`.
    async fn add_link(&self, parent_kb: &str, parent_path: &Path, link_name: &str) -> Result<()>;

    /// Look up a link-mount by name.
    async fn find_mount(&self, link_name: &str) -> Result<Option<LinkMount>>;

    /// Look up all links attached to a given mount name.
    async fn find_links(&self, link_name: &str) -> Result<Vec<Link>>;
}

/// Extract a node's `description` property, if present and a string.
pub fn find_description(node: &Node) -> Option<&str> {
    node.properties.get("description").and_then(|v| v.as_str())
}

/// Project a list of nodes down to their paths, in the same order.
pub fn find_path_values(nodes: &[Node]) -> Vec<Path> {
    nodes.iter().map(|n| n.path.clone()).collect()
}

/// Split a link path of the form `kb.linkUUID.nodeName.linkUUID.nodeName...`
/// into the owning kb and a sequence of `(link_name, node_name)` hops. Fails if
/// the element count after the kb is not even (an odd trailing element would
/// leave a dangling link or node name).
pub fn decode_link_path(path: &Path) -> Result<(String, Vec<(String, String)>)> {
    let labels = path.labels();
    if labels.is_empty() {
        return Err(crate::error::KbError::invalid("link path must not be empty"));
    }
    let kb = labels[0].clone();
    let rest = &labels[1..];
    if rest.len() % 2 != 0 {
        return Err(crate::error::KbError::invalid(format!(
            "link path {path} has an odd number of elements after the kb; expected (linkUUID, name) pairs"
        )));
    }
    let hops = rest
        .chunks(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
    Ok((kb, hops))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_link_path_splits_pairs() {
        let path = Path::parse("kb1.link1.nodeA.link2.nodeB").unwrap();
        let (kb, hops) = decode_link_path(&path).unwrap();
        assert_eq!(kb, "kb1");
        assert_eq!(
            hops,
            vec![
                ("link1".to_string(), "nodeA".to_string()),
                ("link2".to_string(), "nodeB".to_string()),
            ]
        );
    }

    #[test]
    fn decode_link_path_rejects_odd_arity() {
        let path = Path::parse("kb1.link1.nodeA.link2").unwrap();
        assert!(decode_link_path(&path).is_err());
    }
}
