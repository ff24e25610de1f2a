//! Readiness analysis: depth, status and blockers for every traceable node.
//!
//! Analysis is total and side-effect free. It runs over a [`Graph`]
//! snapshot and returns one [`NodeView`] per image, video and collection
//! node, sorted in the order launches and progress logs follow.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::graph::{Graph, Node, NodeId, NodeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Waiting,
    Ready,
    Generating,
    Done,
    Error,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Waiting => "waiting",
            NodeStatus::Ready => "ready",
            NodeStatus::Generating => "generating",
            NodeStatus::Done => "done",
            NodeStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub id: NodeId,
    pub kind: NodeKind,
    pub label: String,
    pub depth: usize,
    pub status: NodeStatus,
    /// Labels of traceable upstream nodes that still lack content.
    pub waiting_for: Vec<String>,
    #[serde(skip)]
    pub node: Node,
}

impl NodeView {
    pub fn is_launchable(&self) -> bool {
        self.status == NodeStatus::Ready && self.kind.is_generatable()
    }
}

/// Tie-break between nodes at the same depth. Lower ranks sort first.
pub trait NodeOrdering: Send + Sync {
    fn rank(&self, node: &Node) -> u8;
}

/// Location-first ordering: labels containing a location term rank before
/// everything else (characters).
#[derive(Debug, Clone)]
pub struct LabelHeuristic {
    terms: Vec<String>,
}

pub const DEFAULT_LOCATION_TERMS: &[&str] = &[
    "décor",
    "decor",
    "potager",
    "lieu",
    "location",
    "environnement",
    "environment",
];

impl LabelHeuristic {
    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            terms: terms
                .into_iter()
                .map(|t| t.as_ref().trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    pub fn is_location(&self, label: &str) -> bool {
        let label = label.to_lowercase();
        self.terms.iter().any(|t| label.contains(t.as_str()))
    }
}

impl Default for LabelHeuristic {
    fn default() -> Self {
        Self::new(DEFAULT_LOCATION_TERMS.iter().copied())
    }
}

impl NodeOrdering for LabelHeuristic {
    fn rank(&self, node: &Node) -> u8 {
        if self.is_location(&node.label) { 0 } else { 1 }
    }
}

fn kind_rank(kind: NodeKind) -> u8 {
    match kind {
        NodeKind::Collection => 0,
        NodeKind::Image => 1,
        NodeKind::Video => 2,
        _ => 3,
    }
}

/// Depth of every traceable node: 1 + the deepest traceable parent, 0 for
/// roots. A node met again while its own depth is being computed counts as
/// 0, which keeps cycles finite.
pub fn compute_depths(graph: &Graph) -> HashMap<NodeId, usize> {
    let mut memo = HashMap::new();
    let mut visiting = HashSet::new();
    for node in graph.nodes().filter(|n| n.kind.is_traceable()) {
        depth_of(graph, &node.id, &mut memo, &mut visiting);
    }
    memo
}

fn depth_of(
    graph: &Graph,
    id: &str,
    memo: &mut HashMap<NodeId, usize>,
    visiting: &mut HashSet<NodeId>,
) -> usize {
    if let Some(depth) = memo.get(id) {
        return *depth;
    }
    if !visiting.insert(id.to_string()) {
        return 0;
    }
    let parents: Vec<NodeId> = graph
        .incoming_neighbors(id)
        .into_iter()
        .filter(|n| n.kind.is_traceable())
        .map(|n| n.id.clone())
        .collect();
    let depth = parents
        .iter()
        .map(|p| depth_of(graph, p, memo, visiting) + 1)
        .max()
        .unwrap_or(0);
    visiting.remove(id);
    memo.insert(id.to_string(), depth);
    depth
}

/// Status of one node given its traceable parents.
fn status_of(node: &Node, parents: &[&Node]) -> (NodeStatus, Vec<String>) {
    if node.in_flight {
        return (NodeStatus::Generating, Vec::new());
    }
    if node.has_content() {
        return (NodeStatus::Done, Vec::new());
    }
    if node.error.is_some() && node.kind.is_generatable() {
        return (NodeStatus::Error, Vec::new());
    }
    let waiting_for: Vec<String> = parents
        .iter()
        .filter(|p| !p.has_content())
        .map(|p| p.display_name().to_string())
        .collect();
    if node.kind.is_generatable() && parents.is_empty() && node.instructions().is_some() {
        return (NodeStatus::Ready, waiting_for);
    }
    if waiting_for.is_empty() {
        (NodeStatus::Ready, waiting_for)
    } else {
        (NodeStatus::Waiting, waiting_for)
    }
}

#[derive(Clone)]
pub struct ReadinessAnalyzer {
    ordering: Arc<dyn NodeOrdering>,
}

impl Default for ReadinessAnalyzer {
    fn default() -> Self {
        Self::new(Arc::new(LabelHeuristic::default()))
    }
}

impl ReadinessAnalyzer {
    pub fn new(ordering: Arc<dyn NodeOrdering>) -> Self {
        Self { ordering }
    }

    pub fn analyze(&self, graph: &Graph) -> Vec<NodeView> {
        let depths = compute_depths(graph);
        let mut views: Vec<(u8, NodeView)> = graph
            .nodes()
            .filter(|n| n.kind.is_traceable())
            .map(|node| {
                let parents: Vec<&Node> = graph
                    .incoming_neighbors(&node.id)
                    .into_iter()
                    .filter(|p| p.kind.is_traceable())
                    .collect();
                let (status, waiting_for) = status_of(node, &parents);
                let view = NodeView {
                    id: node.id.clone(),
                    kind: node.kind,
                    label: node.label.clone(),
                    depth: depths.get(&node.id).copied().unwrap_or(0),
                    status,
                    waiting_for,
                    node: node.clone(),
                };
                (self.ordering.rank(node), view)
            })
            .collect();
        views.sort_by(|(ra, a), (rb, b)| compare(a, *ra, b, *rb));
        views.into_iter().map(|(_, v)| v).collect()
    }
}

fn compare(a: &NodeView, rank_a: u8, b: &NodeView, rank_b: u8) -> Ordering {
    a.depth
        .cmp(&b.depth)
        .then(rank_a.cmp(&rank_b))
        .then(kind_rank(a.kind).cmp(&kind_rank(b.kind)))
        .then_with(|| a.label.cmp(&b.label))
        .then_with(|| a.id.cmp(&b.id))
}

/// Per-status tally of an analysis pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: usize,
    pub waiting: usize,
    pub ready: usize,
    pub generating: usize,
    pub done: usize,
    pub error: usize,
}

impl StatusCounts {
    pub fn from_views(views: &[NodeView]) -> Self {
        let mut counts = Self {
            total: views.len(),
            ..Self::default()
        };
        for view in views {
            match view.status {
                NodeStatus::Waiting => counts.waiting += 1,
                NodeStatus::Ready => counts.ready += 1,
                NodeStatus::Generating => counts.generating += 1,
                NodeStatus::Done => counts.done += 1,
                NodeStatus::Error => counts.error += 1,
            }
        }
        counts
    }
}
