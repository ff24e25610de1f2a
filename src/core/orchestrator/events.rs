//! Observer bus: progress events published by the executors.
//!
//! Events go out on a broadcast channel wrapped in an [`EventEnvelope`]
//! carrying the run id and a sequence number, so consumers can rebuild the
//! total order of a run. Publishing never waits on consumers; a lagging
//! subscriber loses events instead of stalling the run.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::types::{BlockedNode, Phase, PhaseStats};
use crate::core::error::{ErrorKind, GenerationError};
use crate::core::graph::NodeId;
use crate::core::readiness::{NodeStatus, StatusCounts};

const BUS_CAPACITY: usize = 1024;

/// Error attached to a node update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&GenerationError> for EventError {
    fn from(err: &GenerationError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OrchestratorEvent {
    PhaseStart {
        phase: Phase,
    },

    Progress {
        message: String,
        counts: StatusCounts,
    },

    NodeUpdate {
        node_id: NodeId,
        status: NodeStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<EventError>,
    },

    CollectionPopulated {
        id: NodeId,
        count: usize,
    },

    PhaseComplete {
        phase: Phase,
        stats: PhaseStats,
    },

    RunComplete {
        success: usize,
        failure: usize,
        cancelled: bool,
    },

    /// Run-level failure (deadlock, cancellation, deleted node).
    Error {
        kind: ErrorKind,
        message: String,
    },

    /// Notice that needs no action, e.g. abandoned jobs cleared on entry.
    Info {
        kind: ErrorKind,
        message: String,
    },

    Blocked {
        waiting: Vec<BlockedNode>,
    },

    /// Post-production hand-off of a finished video.
    Handoff {
        node_id: NodeId,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl OrchestratorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OrchestratorEvent::PhaseStart { .. } => "phase_start",
            OrchestratorEvent::Progress { .. } => "progress",
            OrchestratorEvent::NodeUpdate { .. } => "node_update",
            OrchestratorEvent::CollectionPopulated { .. } => "collection_populated",
            OrchestratorEvent::PhaseComplete { .. } => "phase_complete",
            OrchestratorEvent::RunComplete { .. } => "run_complete",
            OrchestratorEvent::Error { .. } => "error",
            OrchestratorEvent::Info { .. } => "info",
            OrchestratorEvent::Blocked { .. } => "blocked",
            OrchestratorEvent::Handoff { .. } => "handoff",
        }
    }

    pub fn node_update(node_id: impl Into<NodeId>, status: NodeStatus) -> Self {
        OrchestratorEvent::NodeUpdate {
            node_id: node_id.into(),
            status,
            error: None,
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        OrchestratorEvent::Error {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub run_id: Uuid,
    pub seq: u64,
    #[serde(flatten)]
    pub event: OrchestratorEvent,
}

struct Sequence {
    run_id: Uuid,
    next: u64,
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    sequence: Arc<Mutex<Sequence>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            sender,
            sequence: Arc::new(Mutex::new(Sequence {
                run_id: Uuid::new_v4(),
                next: 0,
            })),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Starts a new run id and restarts the sequence.
    pub fn begin_run(&self) -> Uuid {
        let mut seq = self.sequence.lock().unwrap_or_else(|e| e.into_inner());
        seq.run_id = Uuid::new_v4();
        seq.next = 0;
        seq.run_id
    }

    pub fn run_id(&self) -> Uuid {
        self.sequence
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .run_id
    }

    pub fn publish(&self, event: OrchestratorEvent) {
        // Numbering and sending under one lock keeps seq order equal to
        // delivery order.
        let mut seq = self.sequence.lock().unwrap_or_else(|e| e.into_inner());
        let envelope = EventEnvelope {
            run_id: seq.run_id,
            seq: seq.next,
            event,
        };
        seq.next += 1;
        debug!(
            seq = envelope.seq,
            "event {}: {:?}",
            envelope.event.name(),
            envelope.event
        );
        let _ = self.sender.send(envelope);
    }
}
