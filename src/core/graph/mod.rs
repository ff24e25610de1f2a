//! In-memory graph of canvas nodes and the shared store the orchestrator
//! mutates.
//!
//! [`Graph`] is a plain value: cloning it yields the immutable snapshot that
//! analysis, population and dispatch work from. [`GraphStore`] owns the live
//! graph behind a lock, serializes every write through
//! [`GraphStore::update_node`] and announces each committed change on a
//! broadcast feed.

mod types;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};

pub use types::{
    CollectionItem, Edge, MediaContent, Node, NodeAttributes, NodeId, NodeKind, NodePatch,
};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "GraphDocument", into = "GraphDocument")]
pub struct Graph {
    nodes: IndexMap<NodeId, Node>,
    edges: Vec<Edge>,
}

/// On-disk shape of a graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GraphDocument {
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default)]
    edges: Vec<Edge>,
}

impl From<GraphDocument> for Graph {
    fn from(doc: GraphDocument) -> Self {
        let mut graph = Graph::default();
        for node in doc.nodes {
            graph.insert_node(node);
        }
        graph.edges = doc.edges;
        graph
    }
}

impl From<Graph> for GraphDocument {
    fn from(graph: Graph) -> Self {
        GraphDocument {
            nodes: graph.nodes.into_values().collect(),
            edges: graph.edges,
        }
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid graph document")
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize graph document")
    }

    pub async fn load(path: &std::path::Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Inserts or replaces a node, keeping its original position on replace.
    pub fn insert_node(&mut self, node: Node) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn add_edge(&mut self, source: impl Into<NodeId>, target: impl Into<NodeId>) {
        self.edges.push(Edge::new(source, target));
    }

    /// Removes a node together with every edge touching it.
    pub fn remove_node(&mut self, id: &str) -> Option<Node> {
        let removed = self.nodes.shift_remove(id)?;
        self.edges.retain(|e| e.source != id && e.target != id);
        Some(removed)
    }

    /// Source nodes of edges pointing at `id`, in edge insertion order.
    /// Duplicate edges and dangling references are skipped.
    pub fn incoming_neighbors(&self, id: &str) -> Vec<&Node> {
        let mut seen = HashSet::new();
        self.edges
            .iter()
            .filter(|e| e.target == id)
            .filter(|e| seen.insert(e.source.as_str()))
            .filter_map(|e| self.nodes.get(&e.source))
            .collect()
    }

    /// Target nodes of edges leaving `id`, in edge insertion order.
    pub fn outgoing_neighbors(&self, id: &str) -> Vec<&Node> {
        let mut seen = HashSet::new();
        self.edges
            .iter()
            .filter(|e| e.source == id)
            .filter(|e| seen.insert(e.target.as_str()))
            .filter_map(|e| self.nodes.get(&e.target))
            .collect()
    }

    pub(crate) fn apply_patch(&mut self, id: &str, patch: NodePatch) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) => {
                patch.apply(node);
                true
            }
            None => false,
        }
    }
}

/// Notification sent after every committed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphChange {
    pub revision: u64,
    /// `None` for structural edits touching more than one node.
    pub node_id: Option<NodeId>,
}

struct StoreInner {
    graph: Graph,
    revision: u64,
}

/// Shared, serialized owner of the live graph.
#[derive(Clone)]
pub struct GraphStore {
    inner: Arc<RwLock<StoreInner>>,
    changes: broadcast::Sender<GraphChange>,
}

impl GraphStore {
    pub fn new(graph: Graph) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(RwLock::new(StoreInner { graph, revision: 0 })),
            changes,
        }
    }

    /// Immutable copy of the current graph.
    pub async fn snapshot(&self) -> Graph {
        self.inner.read().await.graph.clone()
    }

    pub async fn node(&self, id: &str) -> Option<Node> {
        self.inner.read().await.graph.node(id).cloned()
    }

    pub async fn revision(&self) -> u64 {
        self.inner.read().await.revision
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GraphChange> {
        self.changes.subscribe()
    }

    /// Merges `patch` into node `id`. Returns `false` when the node does not
    /// exist (e.g. deleted by the editor while a job was running).
    pub async fn update_node(&self, id: &str, patch: NodePatch) -> bool {
        if patch.is_empty() {
            return self.inner.read().await.graph.contains(id);
        }
        let revision = {
            let mut inner = self.inner.write().await;
            if !inner.graph.apply_patch(id, patch) {
                return false;
            }
            inner.revision += 1;
            inner.revision
        };
        let _ = self.changes.send(GraphChange {
            revision,
            node_id: Some(id.to_string()),
        });
        true
    }

    pub async fn insert_node(&self, node: Node) {
        let id = node.id.clone();
        self.edit(Some(id), |graph| graph.insert_node(node)).await;
    }

    pub async fn add_edge(&self, source: &str, target: &str) {
        self.edit(None, |graph| graph.add_edge(source, target)).await;
    }

    pub async fn remove_node(&self, id: &str) -> Option<Node> {
        let mut removed = None;
        self.edit(None, |graph| removed = graph.remove_node(id)).await;
        removed
    }

    async fn edit(&self, node_id: Option<NodeId>, f: impl FnOnce(&mut Graph)) {
        let revision = {
            let mut inner = self.inner.write().await;
            f(&mut inner.graph);
            inner.revision += 1;
            inner.revision
        };
        let _ = self.changes.send(GraphChange { revision, node_id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Graph {
        let mut graph = Graph::new();
        graph.insert_node(Node::text("t", "prompt"));
        graph.insert_node(Node::image("a", "Alpha"));
        graph.insert_node(Node::image("b", "Beta"));
        graph.add_edge("t", "a");
        graph.add_edge("a", "b");
        graph.add_edge("t", "b");
        graph.add_edge("a", "b");
        graph.add_edge("ghost", "b");
        graph
    }

    #[test]
    fn neighbors_follow_edge_order_without_duplicates() {
        let graph = sample();
        let ids: Vec<_> = graph
            .incoming_neighbors("b")
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "t"]);
        let out: Vec<_> = graph
            .outgoing_neighbors("t")
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(out, vec!["a", "b"]);
    }

    #[test]
    fn remove_node_drops_touching_edges() {
        let mut graph = sample();
        assert!(graph.remove_node("a").is_some());
        assert!(graph.edges().iter().all(|e| e.source != "a" && e.target != "a"));
        assert!(graph.remove_node("a").is_none());
    }

    #[test]
    fn document_round_trip_keeps_node_order() {
        let graph = sample();
        let text = graph.to_json_pretty().unwrap();
        let parsed = Graph::from_json(&text).unwrap();
        let ids: Vec<_> = parsed.nodes().map(|n| n.id.clone()).collect();
        assert_eq!(ids, vec!["t", "a", "b"]);
        assert_eq!(parsed, graph);
    }

    #[test]
    fn document_uses_camel_case_fields() {
        let json = r#"{
            "nodes": [
                {"id": "i1", "kind": "image", "label": "Hero", "inFlight": true,
                 "inFlightSince": 12, "isGenerated": true,
                 "content": {"url": "https://cdn/x.png", "type": "image/png"},
                 "attributes": {"aspectRatio": "9:16", "viewType": "profile", "zoom": 2}}
            ],
            "edges": []
        }"#;
        let graph = Graph::from_json(json).unwrap();
        let node = graph.node("i1").unwrap();
        assert!(node.in_flight);
        assert_eq!(node.in_flight_since, Some(12));
        assert_eq!(node.attributes.aspect_ratio.as_deref(), Some("9:16"));
        assert_eq!(node.attributes.view_type.as_deref(), Some("profile"));
        assert_eq!(node.attributes.extra.get("zoom"), Some(&serde_json::json!(2)));
        assert_eq!(node.content_url(), Some("https://cdn/x.png"));
    }

    #[tokio::test]
    async fn update_node_merges_and_notifies() {
        let store = GraphStore::new(sample());
        let mut rx = store.subscribe();

        assert!(store.update_node("a", NodePatch::mark_in_flight(5)).await);
        let change = rx.recv().await.unwrap();
        assert_eq!(change.node_id.as_deref(), Some("a"));
        assert_eq!(change.revision, 1);

        let content = MediaContent::new("https://cdn/a.png");
        assert!(store.update_node("a", NodePatch::generated(content)).await);
        let node = store.node("a").await.unwrap();
        assert!(!node.in_flight);
        assert_eq!(node.in_flight_since, None);
        assert!(node.is_generated);
        assert_eq!(node.content_url(), Some("https://cdn/a.png"));
    }

    #[tokio::test]
    async fn update_of_missing_node_is_rejected() {
        let store = GraphStore::new(sample());
        assert!(!store.update_node("nope", NodePatch::clear_error()).await);
        assert_eq!(store.revision().await, 0);
    }

    #[test]
    fn new_content_supersedes_previous_record() {
        let mut node = Node::image("i", "I");
        node.content = Some(MediaContent {
            width: Some(512),
            ..MediaContent::new("https://old")
        });
        NodePatch::generated(MediaContent::new("https://new")).apply(&mut node);
        let content = node.content.unwrap();
        assert_eq!(content.url, "https://new");
        assert_eq!(content.width, None);
    }
}
