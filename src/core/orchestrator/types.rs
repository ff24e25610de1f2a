use serde::{Deserialize, Serialize};

use crate::core::graph::NodeId;
use crate::core::readiness::{NodeStatus, NodeView};

/// Stage of a run. The continuous executor runs as one `continuous`
/// phase; the batch planner walks the four scripted waves in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Continuous,
    Primaries,
    Variants,
    Collections,
    Videos,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Continuous => "continuous",
            Phase::Primaries => "primaries",
            Phase::Variants => "variants",
            Phase::Collections => "collections",
            Phase::Videos => "videos",
        }
    }

    pub const BATCH: [Phase; 4] = [
        Phase::Primaries,
        Phase::Variants,
        Phase::Collections,
        Phase::Videos,
    ];
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseStats {
    pub success: usize,
    pub failure: usize,
    /// Launches that went back to waiting without an outcome.
    #[serde(default)]
    pub skipped: usize,
}

impl PhaseStats {
    pub fn absorb(&mut self, other: PhaseStats) {
        self.success += other.success;
        self.failure += other.failure;
        self.skipped += other.skipped;
    }
}

/// A node left waiting when a run ended, with the labels it waits on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedNode {
    pub node_id: NodeId,
    pub label: String,
    pub waiting_for: Vec<String>,
}

impl BlockedNode {
    pub fn from_views(views: &[NodeView]) -> Vec<Self> {
        views
            .iter()
            .filter(|v| v.status == NodeStatus::Waiting)
            .map(|v| BlockedNode {
                node_id: v.id.clone(),
                label: v.label.clone(),
                waiting_for: v.waiting_for.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub success: usize,
    pub failure: usize,
    pub cancelled: bool,
    /// Non-empty when the run ended in a deadlock.
    pub blocked: Vec<BlockedNode>,
}

impl RunSummary {
    pub fn is_deadlocked(&self) -> bool {
        !self.blocked.is_empty()
    }
}
