//! Generation front-ends over the shared dispatcher.
//!
//! - [executor]: interactive continuous mode, launches whatever is ready
//! - [batch]: scripted four-phase run used right after a brief is expanded
//!
//! Both publish on the same [`EventBus`].

mod batch;
mod events;
mod executor;
pub mod types;

pub use batch::{BatchPlanner, EntityPlan, GenerationPlan, VideoPlan, ViewPlan};
pub use events::{EventBus, EventEnvelope, EventError, OrchestratorEvent};
pub use executor::ContinuousExecutor;
pub use types::{BlockedNode, Phase, PhaseStats, RunSummary};

use tracing::warn;

use crate::core::dispatch::DispatchOutcome;
use crate::core::graph::{MediaContent, Node};
use crate::core::handoff::{HandoffRequest, HandoffSink};
use crate::core::readiness::NodeStatus;

/// `node_update` event describing a recorded outcome.
pub(crate) fn outcome_event(node_id: &str, outcome: &DispatchOutcome) -> OrchestratorEvent {
    let status = match outcome {
        DispatchOutcome::Generated(_) => NodeStatus::Done,
        DispatchOutcome::Failed(_) => NodeStatus::Error,
        DispatchOutcome::Skipped(_) => NodeStatus::Waiting,
    };
    OrchestratorEvent::NodeUpdate {
        node_id: node_id.to_string(),
        status,
        error: outcome.error().map(EventError::from),
    }
}

/// Hands a finished video to post-production and describes the result.
pub(crate) async fn deliver_handoff(
    sink: &dyn HandoffSink,
    node: &Node,
    content: &MediaContent,
) -> OrchestratorEvent {
    let request = HandoffRequest::for_video(node, content);
    match sink.deliver(&request).await {
        Ok(_) => OrchestratorEvent::Handoff {
            node_id: node.id.clone(),
            success: true,
            error: None,
        },
        Err(e) => {
            warn!("Hand-off of {} failed: {:#}", node.id, e);
            OrchestratorEvent::Handoff {
                node_id: node.id.clone(),
                success: false,
                error: Some(e.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests;
