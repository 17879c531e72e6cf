//! C3 — Query composer: accumulate node-filter predicates, compile into a
//! conjunctive SQL `WHERE` clause (Postgres backend) or a predicate chain
//! (in-memory backend) that filters the N-th stage's result down further.

use crate::path::{Path, PathPattern};
use crate::types::{Json, Node};

/// One accumulated predicate. Stored in insertion order; compilation chains them
/// as a conjunction (`AND`) — each additional filter only narrows the result.
#[derive(Clone, Debug)]
pub enum Filter {
    Kb(String),
    Label(String),
    Name(String),
    HasPropertyKey(String),
    PropertyEquals(String, Json),
    PathExact(Path),
    PathDescendant(Path),
    HasLink(bool),
    HasLinkMount(bool),
}

/// Accumulates [`Filter`]s and compiles them into a backend-specific query.
///
/// An empty composer matches every node. Each call to a `.with_*` builder method
/// appends one more filter, narrowing — never widening — the eventual result set.
#[derive(Clone, Debug, Default)]
pub struct QueryComposer {
    filters: Vec<Filter>,
}

impl QueryComposer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_kb(self, kb: impl Into<String>) -> Self {
        self.with_filter(Filter::Kb(kb.into()))
    }

    pub fn with_label(self, label: impl Into<String>) -> Self {
        self.with_filter(Filter::Label(label.into()))
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.with_filter(Filter::Name(name.into()))
    }

    pub fn with_property_key(self, key: impl Into<String>) -> Self {
        self.with_filter(Filter::HasPropertyKey(key.into()))
    }

    pub fn with_property_value(self, key: impl Into<String>, value: Json) -> Self {
        self.with_filter(Filter::PropertyEquals(key.into(), value))
    }

    pub fn with_path_exact(self, path: Path) -> Self {
        self.with_filter(Filter::PathExact(path))
    }

    pub fn with_path_descendant(self, ancestor: Path) -> Self {
        self.with_filter(Filter::PathDescendant(ancestor))
    }

    pub fn with_has_link(self, value: bool) -> Self {
        self.with_filter(Filter::HasLink(value))
    }

    pub fn with_has_link_mount(self, value: bool) -> Self {
        self.with_filter(Filter::HasLinkMount(value))
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Evaluate the full conjunction against one node — used by the in-memory
    /// backend, where "compilation" is simply folding the predicate chain.
    pub fn matches(&self, node: &Node) -> bool {
        self.filters.iter().all(|f| filter_matches(f, node))
    }

    /// Compile into a parameterized `WHERE` clause body (without the `WHERE`
    /// keyword) plus its bind parameters, for the Postgres backend. Parameter
    /// placeholders start at `$1`; pass `start_index` to continue numbering when
    /// this clause is appended after other bound parameters in the same query
    /// (avoiding placeholder collisions across stages, per the distilled spec).
    #[cfg(feature = "postgres")]
    pub fn compile_sql(&self, start_index: usize) -> (String, Vec<FilterParam>) {
        if self.filters.is_empty() {
            return ("TRUE".to_string(), Vec::new());
        }
        let mut clauses = Vec::with_capacity(self.filters.len());
        let mut params = Vec::with_capacity(self.filters.len());
        let mut idx = start_index;
        for filter in &self.filters {
            let (clause, param) = compile_one(filter, idx);
            clauses.push(clause);
            if let Some(param) = param {
                params.push(param);
                idx += 1;
            }
        }
        (clauses.join(" AND "), params)
    }
}

fn filter_matches(filter: &Filter, node: &Node) -> bool {
    match filter {
        Filter::Kb(kb) => &node.kb == kb,
        Filter::Label(label) => &node.label == label,
        Filter::Name(name) => &node.name == name,
        Filter::HasPropertyKey(key) => node.properties.contains_key(key),
        Filter::PropertyEquals(key, value) => node.properties.get(key) == Some(value),
        Filter::PathExact(path) => &node.path == path,
        Filter::PathDescendant(ancestor) => {
            node.path != *ancestor && node.path.matches(&ancestor.descendants())
        }
        Filter::HasLink(v) => node.has_link == *v,
        Filter::HasLinkMount(v) => node.has_link_mount == *v,
    }
}

/// A single bound parameter produced by [`QueryComposer::compile_sql`].
#[cfg(feature = "postgres")]
#[derive(Clone, Debug)]
pub enum FilterParam {
    Text(String),
    Json(Json),
    Bool(bool),
}

#[cfg(feature = "postgres")]
fn compile_one(filter: &Filter, idx: usize) -> (String, Option<FilterParam>) {
    match filter {
        Filter::Kb(kb) => (format!("kb = ${idx}"), Some(FilterParam::Text(kb.clone()))),
        Filter::Label(label) => (format!("label = ${idx}"), Some(FilterParam::Text(label.clone()))),
        Filter::Name(name) => (format!("name = ${idx}"), Some(FilterParam::Text(name.clone()))),
        Filter::HasPropertyKey(key) => {
            (format!("properties ? ${idx}"), Some(FilterParam::Text(key.clone())))
        }
        Filter::PropertyEquals(key, value) => {
            let obj = serde_json::json!({ key: value });
            (format!("properties @> ${idx}"), Some(FilterParam::Json(obj)))
        }
        Filter::PathExact(path) => {
            (format!("path = ${idx}::ltree"), Some(FilterParam::Text(path.render())))
        }
        Filter::PathDescendant(ancestor) => (
            format!("path <@ (${idx}::ltree) AND path != ${idx}::ltree"),
            Some(FilterParam::Text(ancestor.render())),
        ),
        Filter::HasLink(v) => (format!("has_link = ${idx}"), Some(FilterParam::Bool(*v))),
        Filter::HasLinkMount(v) => (format!("has_link_mount = ${idx}"), Some(FilterParam::Bool(*v))),
    }
}

/// Descent-match pattern equivalent to [`Filter::PathDescendant`], exposed for
/// callers who already have a compiled [`PathPattern`] (e.g. from user input)
/// rather than a bare ancestor [`Path`].
pub fn descendant_pattern_matches(pattern: &PathPattern, node: &Node) -> bool {
    node.path.matches(pattern)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::Path;
    use std::collections::BTreeMap;

    fn node(kb: &str, label: &str, path: &str) -> Node {
        Node {
            kb: kb.to_string(),
            label: label.to_string(),
            name: "n".to_string(),
            properties: BTreeMap::new(),
            data: serde_json::json!({}),
            path: Path::parse(path).unwrap(),
            has_link: false,
            has_link_mount: false,
        }
    }

    #[test]
    fn empty_composer_matches_everything() {
        let composer = QueryComposer::new();
        assert!(composer.matches(&node("kb1", "L", "kb1.a")));
    }

    #[test]
    fn chained_filters_narrow() {
        let composer = QueryComposer::new().with_kb("kb1").with_label("KB_JOB_QUEUE");
        assert!(composer.matches(&node("kb1", "KB_JOB_QUEUE", "kb1.jobs.worker")));
        assert!(!composer.matches(&node("kb1", "OTHER", "kb1.jobs.worker")));
        assert!(!composer.matches(&node("kb2", "KB_JOB_QUEUE", "kb2.jobs.worker")));
    }

    #[test]
    fn path_descendant_excludes_self() {
        let root = Path::parse("kb1.root").unwrap();
        let composer = QueryComposer::new().with_path_descendant(root.clone());
        assert!(!composer.matches(&node("kb1", "L", "kb1.root")));
        assert!(composer.matches(&node("kb1", "L", "kb1.root.child")));
    }
}
