//! Renders observer-bus events on stdout, either as styled lines or as one
//! JSON object per line.

use console::style;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use crate::core::orchestrator::{EventEnvelope, OrchestratorEvent};
use crate::core::readiness::{NodeStatus, NodeView};
use crate::core::terminal::{self, GuideSection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

/// Prints events until the run completes or the bus closes.
pub fn spawn_printer(
    rx: broadcast::Receiver<EventEnvelope>,
    mode: OutputMode,
) -> JoinHandle<()> {
    let mut stream = BroadcastStream::new(rx);
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            let envelope = match item {
                Ok(envelope) => envelope,
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    warn!("Event printer fell behind, {} event(s) dropped", n);
                    continue;
                }
            };
            let last = matches!(envelope.event, OrchestratorEvent::RunComplete { .. });
            match mode {
                OutputMode::Json => match serde_json::to_string(&envelope) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Failed to serialize event: {}", e),
                },
                OutputMode::Human => print_event(&envelope.event),
            }
            if last {
                break;
            }
        }
    })
}

fn print_event(event: &OrchestratorEvent) {
    match event {
        OrchestratorEvent::PhaseStart { phase } => {
            terminal::print_step(&format!("Phase {}", phase.as_str()));
        }
        OrchestratorEvent::Progress { message, .. } => terminal::print_status("progress", message),
        OrchestratorEvent::NodeUpdate {
            node_id,
            status,
            error,
        } => match (status, error) {
            (NodeStatus::Generating, _) => terminal::print_generating(&format!("{} generating", node_id)),
            (NodeStatus::Done, _) => terminal::print_success(&format!("{} done", node_id)),
            (_, Some(error)) => terminal::print_warn(&format!(
                "{}: {} ({})",
                node_id,
                error.message,
                error.kind.as_str()
            )),
            (status, None) => terminal::print_info(&format!("{} {}", node_id, status.as_str())),
        },
        OrchestratorEvent::CollectionPopulated { id, count } => {
            terminal::print_info(&format!("collection {} now holds {} image(s)", id, count));
        }
        OrchestratorEvent::PhaseComplete { phase, stats } => terminal::print_status(
            phase.as_str(),
            &format!("{} ok, {} failed", stats.success, stats.failure),
        ),
        OrchestratorEvent::RunComplete {
            success,
            failure,
            cancelled,
        } => {
            let summary = format!("{} generated, {} failed", success, failure);
            if *cancelled {
                terminal::print_warn(&format!("Run cancelled: {}", summary));
            } else if *failure > 0 {
                terminal::print_warn(&format!("Run finished: {}", summary));
            } else {
                terminal::print_success(&format!("Run finished: {}", summary));
            }
        }
        OrchestratorEvent::Error { kind, message } => {
            terminal::print_error(&format!("{} ({})", message, kind.as_str()));
        }
        OrchestratorEvent::Info { message, .. } => terminal::print_info(message),
        OrchestratorEvent::Blocked { waiting } => {
            let mut section = GuideSection::new("Still waiting");
            for node in waiting {
                section = section.command(&node.label, &node.waiting_for.join(", "));
            }
            section.print();
        }
        OrchestratorEvent::Handoff {
            node_id,
            success,
            error,
        } => {
            if *success {
                terminal::print_handoff(&format!("{} sent to the editing timeline", node_id));
            } else {
                terminal::print_warn(&format!(
                    "hand-off of {} failed: {}",
                    node_id,
                    error.as_deref().unwrap_or("unknown error")
                ));
            }
        }
    }
}

/// One row per analyzed node: depth, status, kind, label and blockers.
pub fn analysis_rows(views: &[NodeView]) -> Vec<String> {
    let width = views
        .iter()
        .map(|v| v.label.chars().count())
        .max()
        .unwrap_or(0);
    views
        .iter()
        .map(|v| {
            let mut row = format!(
                "{:>3}  {:<10}  {:<10}  {:<width$}",
                v.depth,
                v.status.as_str(),
                v.kind.as_str(),
                v.label,
                width = width
            );
            if !v.waiting_for.is_empty() {
                row.push_str(&format!("  waiting for {}", v.waiting_for.join(", ")));
            }
            row.trim_end().to_string()
        })
        .collect()
}

pub fn print_analysis(views: &[NodeView]) {
    println!(
        "{}",
        style(format!("{:>3}  {:<10}  {:<10}  label", "dep", "status", "kind")).bold()
    );
    for row in analysis_rows(views) {
        println!("{}", row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::{Graph, Node};
    use crate::core::readiness::ReadinessAnalyzer;

    #[test]
    fn analysis_rows_show_blockers() {
        let mut graph = Graph::new();
        graph.insert_node(Node::image("a", "Hero").with_instructions("a knight"));
        graph.insert_node(Node::image("b", "Hero side"));
        graph.add_edge("a", "b");
        let views = ReadinessAnalyzer::default().analyze(&graph);

        let rows = analysis_rows(&views);
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("  0  ready"));
        assert!(rows[1].starts_with("  1  waiting"));
        assert!(rows[1].ends_with("waiting for Hero"));
    }
}
