//! Continuous executor: the interactive generation loop.
//!
//! One task owns the run. It launches every ready node in analysis order
//! without waiting on it, then reacts to three sources: a dispatch finishing
//! (record it, repopulate collections, re-analyze, launch what became
//! ready), the poll tick (same re-check, catches readiness that only a
//! collection change produced) and cancellation. Dispatcher I/O runs on a
//! `JoinSet`; graph writes all happen on the owning task.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::task::{self, JoinSet};
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{EventBus, OrchestratorEvent};
use super::types::{BlockedNode, Phase, PhaseStats, RunSummary};
use super::{deliver_handoff, outcome_event};
use crate::core::collections::CollectionPopulator;
use crate::core::dispatch::{DispatchOutcome, Dispatcher};
use crate::core::error::{ErrorKind, GenerationError};
use crate::core::graph::{GraphStore, NodeId, NodeKind, NodePatch};
use crate::core::handoff::HandoffSink;
use crate::core::readiness::{NodeStatus, NodeView, ReadinessAnalyzer, StatusCounts};

/// Resets `running` when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Mutable bookkeeping of one run.
#[derive(Default)]
struct RunState {
    in_progress: HashSet<NodeId>,
    /// Node behind each dispatch task, so a panicked task can be recorded.
    tasks: HashMap<task::Id, NodeId>,
    completed: HashSet<NodeId>,
    stats: PhaseStats,
    cancelled: bool,
}

pub struct ContinuousExecutor {
    dispatcher: Dispatcher,
    analyzer: ReadinessAnalyzer,
    populator: CollectionPopulator,
    bus: EventBus,
    handoff: Option<Arc<dyn HandoffSink>>,
    poll_interval: Duration,
    cancel: Mutex<CancellationToken>,
    running: AtomicBool,
}

impl ContinuousExecutor {
    pub fn new(dispatcher: Dispatcher, bus: EventBus) -> Self {
        Self {
            dispatcher,
            analyzer: ReadinessAnalyzer::default(),
            populator: CollectionPopulator::default(),
            bus,
            handoff: None,
            poll_interval: Duration::from_millis(500),
            cancel: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_analyzer(mut self, analyzer: ReadinessAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_populator(mut self, populator: CollectionPopulator) -> Self {
        self.populator = populator;
        self
    }

    pub fn with_handoff(mut self, sink: Arc<dyn HandoffSink>) -> Self {
        self.handoff = Some(sink);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn store(&self) -> &GraphStore {
        self.dispatcher.store()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current analysis of the live graph.
    pub async fn analyze(&self) -> Vec<NodeView> {
        self.analyzer.analyze(&self.store().snapshot().await)
    }

    /// Panel-open procedure: clears in-flight flags left by a previous
    /// session, populates collections, analyzes and publishes the snapshot.
    pub async fn enter(&self) -> Vec<NodeView> {
        let graph = self.store().snapshot().await;
        let abandoned: Vec<(NodeId, String)> = graph
            .nodes()
            .filter(|n| n.in_flight)
            .map(|n| (n.id.clone(), n.display_name().to_string()))
            .collect();
        for (id, _) in &abandoned {
            self.store()
                .update_node(id, NodePatch::clear_in_flight())
                .await;
        }
        if !abandoned.is_empty() {
            let labels: Vec<&str> = abandoned.iter().map(|(_, l)| l.as_str()).collect();
            info!("Cleared {} abandoned in-flight job(s)", abandoned.len());
            self.bus.publish(OrchestratorEvent::Info {
                kind: ErrorKind::PlannerAbandoned,
                message: format!(
                    "cleared {} interrupted job(s): {}",
                    abandoned.len(),
                    labels.join(", ")
                ),
            });
        }

        let views = self.refresh().await;
        let counts = StatusCounts::from_views(&views);
        self.bus.publish(OrchestratorEvent::Progress {
            message: format!("{} node(s) ready, {} done", counts.ready, counts.done),
            counts,
        });
        views
    }

    /// Runs collection population then readiness analysis.
    async fn refresh(&self) -> Vec<NodeView> {
        let report = self.populator.populate(self.store()).await;
        for (id, count) in report.changed {
            self.bus
                .publish(OrchestratorEvent::CollectionPopulated { id, count });
        }
        self.analyze().await
    }

    fn fresh_token(&self) -> CancellationToken {
        let mut guard = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        *guard = CancellationToken::new();
        guard.clone()
    }

    /// Stops new launches. Jobs already dispatched finish and record their
    /// outcome.
    pub fn cancel(&self) {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
    }

    /// Runs until nothing is in progress and nothing more can launch.
    pub async fn start(&self) -> Result<RunSummary> {
        if self.running.swap(true, Ordering::SeqCst) {
            bail!("a generation run is already in progress");
        }
        let _guard = RunGuard(&self.running);
        let token = self.fresh_token();
        let run_id = self.bus.begin_run();
        info!("Starting generation run {}", run_id);
        self.bus.publish(OrchestratorEvent::PhaseStart {
            phase: Phase::Continuous,
        });

        // Failed nodes get one more attempt per run.
        for view in self.analyze().await {
            if view.status == NodeStatus::Error {
                self.store()
                    .update_node(&view.id, NodePatch::clear_error())
                    .await;
            }
        }

        let mut state = RunState::default();
        let mut jobs: JoinSet<(NodeId, DispatchOutcome)> = JoinSet::new();
        let mut handoffs: JoinSet<OrchestratorEvent> = JoinSet::new();
        let mut ticker = interval_at(
            tokio::time::Instant::now() + self.poll_interval,
            self.poll_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let views = self.refresh().await;
        self.launch(&views, &mut state, &mut jobs, &token).await;

        loop {
            if jobs.is_empty() {
                if token.is_cancelled() {
                    self.note_cancelled(&mut state);
                    break;
                }
                let views = self.refresh().await;
                if self.launch(&views, &mut state, &mut jobs, &token).await == 0 {
                    break;
                }
                continue;
            }

            tokio::select! {
                _ = token.cancelled(), if !state.cancelled => {
                    self.note_cancelled(&mut state);
                }
                Some(joined) = jobs.join_next_with_id() => {
                    match joined {
                        Ok((id, (node_id, outcome))) => {
                            state.tasks.remove(&id);
                            self.complete(&node_id, outcome, &mut state, &mut handoffs).await;
                        }
                        Err(e) => {
                            warn!("Dispatch task failed: {}", e);
                            let lost = GenerationError::Transport(
                                "the generation task stopped unexpectedly".to_string(),
                            );
                            match state.tasks.remove(&e.id()) {
                                Some(node_id) => {
                                    let outcome = DispatchOutcome::Failed(lost);
                                    self.complete(&node_id, outcome, &mut state, &mut handoffs)
                                        .await;
                                }
                                None => {
                                    state.stats.failure += 1;
                                    self.bus.publish(OrchestratorEvent::error(
                                        lost.kind(),
                                        lost.to_string(),
                                    ));
                                }
                            }
                        }
                    }
                    let views = self.refresh().await;
                    self.publish_progress(&views, &state);
                    self.launch(&views, &mut state, &mut jobs, &token).await;
                }
                Some(done) = handoffs.join_next(), if !handoffs.is_empty() => {
                    if let Ok(event) = done {
                        self.bus.publish(event);
                    }
                }
                _ = ticker.tick() => {
                    debug!("Poll tick: {} job(s) in progress", state.in_progress.len());
                    let views = self.refresh().await;
                    self.launch(&views, &mut state, &mut jobs, &token).await;
                }
            }
        }

        while let Some(done) = handoffs.join_next().await {
            if let Ok(event) = done {
                self.bus.publish(event);
            }
        }
        self.finish(run_id.to_string(), state).await
    }

    fn note_cancelled(&self, state: &mut RunState) {
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        info!(
            "Run cancelled; waiting for {} dispatched job(s)",
            state.in_progress.len()
        );
        self.bus.publish(OrchestratorEvent::error(
            ErrorKind::Cancelled,
            GenerationError::Cancelled.to_string(),
        ));
    }

    /// Launches every ready image/video not yet handled in this run, in
    /// analysis order. Returns the number of launches.
    async fn launch(
        &self,
        views: &[NodeView],
        state: &mut RunState,
        jobs: &mut JoinSet<(NodeId, DispatchOutcome)>,
        token: &CancellationToken,
    ) -> usize {
        let mut launched = 0;
        for view in views.iter().filter(|v| v.is_launchable()) {
            if token.is_cancelled() {
                self.note_cancelled(state);
                break;
            }
            if state.in_progress.contains(&view.id) || state.completed.contains(&view.id) {
                continue;
            }
            if !self.dispatcher.mark_in_flight(&view.id).await {
                debug!("Node {} vanished before launch", view.id);
                continue;
            }
            state.in_progress.insert(view.id.clone());
            self.bus
                .publish(OrchestratorEvent::node_update(&view.id, NodeStatus::Generating));

            let dispatcher = self.dispatcher.clone();
            let node_id = view.id.clone();
            let handle = jobs.spawn(async move {
                let outcome = dispatcher.execute(&node_id).await;
                (node_id, outcome)
            });
            state.tasks.insert(handle.id(), view.id.clone());
            launched += 1;
        }
        launched
    }

    /// Records a finished dispatch. The graph is updated before the node's
    /// event goes out.
    async fn complete(
        &self,
        node_id: &str,
        outcome: DispatchOutcome,
        state: &mut RunState,
        handoffs: &mut JoinSet<OrchestratorEvent>,
    ) {
        let applied = self.dispatcher.apply(node_id, &outcome).await;
        state.in_progress.remove(node_id);

        if !applied {
            state.completed.insert(node_id.to_string());
            state.stats.failure += 1;
            self.bus.publish(OrchestratorEvent::error(
                ErrorKind::DependencyUnresolved,
                format!("{} was deleted while generating", node_id),
            ));
            return;
        }

        match &outcome {
            DispatchOutcome::Skipped(_) => state.stats.skipped += 1,
            DispatchOutcome::Generated(_) => {
                state.completed.insert(node_id.to_string());
                state.stats.success += 1;
            }
            DispatchOutcome::Failed(err) => {
                warn!("Generation of {} failed: {}", node_id, err);
                state.completed.insert(node_id.to_string());
                state.stats.failure += 1;
            }
        }
        self.bus.publish(outcome_event(node_id, &outcome));

        if let (DispatchOutcome::Generated(content), Some(sink)) = (&outcome, &self.handoff)
            && let Some(node) = self.store().node(node_id).await
            && node.kind == NodeKind::Video
        {
            let sink = sink.clone();
            let content = content.clone();
            handoffs.spawn(async move { deliver_handoff(sink.as_ref(), &node, &content).await });
        }
    }

    fn publish_progress(&self, views: &[NodeView], state: &RunState) {
        let counts = StatusCounts::from_views(views);
        self.bus.publish(OrchestratorEvent::Progress {
            message: format!(
                "{}/{} done, {} generating, {} failed",
                counts.done,
                counts.total,
                state.in_progress.len(),
                state.stats.failure
            ),
            counts,
        });
    }

    async fn finish(&self, run_id: String, state: RunState) -> Result<RunSummary> {
        let views = self.analyze().await;
        let blocked = if state.cancelled {
            Vec::new()
        } else {
            BlockedNode::from_views(&views)
        };
        if !blocked.is_empty() {
            warn!("Run ended with {} blocked node(s)", blocked.len());
            self.bus.publish(OrchestratorEvent::Blocked {
                waiting: blocked.clone(),
            });
            self.bus.publish(OrchestratorEvent::error(
                ErrorKind::Deadlock,
                format!(
                    "{} node(s) can never become ready: {}",
                    blocked.len(),
                    blocked
                        .iter()
                        .map(|b| b.label.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            ));
        }
        self.bus.publish(OrchestratorEvent::PhaseComplete {
            phase: Phase::Continuous,
            stats: state.stats,
        });
        self.bus.publish(OrchestratorEvent::RunComplete {
            success: state.stats.success,
            failure: state.stats.failure,
            cancelled: state.cancelled,
        });
        info!(
            "Run {} complete: {} succeeded, {} failed",
            run_id, state.stats.success, state.stats.failure
        );
        Ok(RunSummary {
            run_id,
            success: state.stats.success,
            failure: state.stats.failure,
            cancelled: state.cancelled,
            blocked,
        })
    }

    /// Clears a node's error and dispatches it once, outside a run.
    pub async fn retry_node(&self, node_id: &str) -> Result<DispatchOutcome> {
        if self.is_running() {
            bail!("cannot retry {} while a run is in progress", node_id);
        }
        if !self
            .store()
            .update_node(node_id, NodePatch::clear_error())
            .await
        {
            bail!("unknown node {}", node_id);
        }
        let views = self.refresh().await;
        let Some(view) = views.iter().find(|v| v.id == node_id) else {
            bail!("{} is not a generatable node", node_id);
        };
        if !view.is_launchable() {
            let reason = if view.waiting_for.is_empty() {
                view.status.as_str().to_string()
            } else {
                view.waiting_for.join(", ")
            };
            return Ok(DispatchOutcome::Skipped(GenerationError::DependencyUnresolved(
                reason,
            )));
        }

        self.bus
            .publish(OrchestratorEvent::node_update(node_id, NodeStatus::Generating));
        let outcome = self.dispatcher.dispatch(node_id).await;
        self.bus.publish(outcome_event(node_id, &outcome));
        self.refresh().await;

        if let (DispatchOutcome::Generated(content), Some(sink)) = (&outcome, &self.handoff)
            && let Some(node) = self.store().node(node_id).await
            && node.kind == NodeKind::Video
        {
            let event = deliver_handoff(sink.as_ref(), &node, content).await;
            self.bus.publish(event);
        }
        Ok(outcome)
    }

    /// Drops generated output from every image and video and empties every
    /// collection. Refused while a run is in progress.
    pub async fn reset(&self) -> Result<usize> {
        if self.is_running() {
            bail!("cannot reset while a run is in progress");
        }
        let graph = self.store().snapshot().await;
        let mut cleared = 0;
        for node in graph.nodes() {
            let patch = match node.kind {
                NodeKind::Image | NodeKind::Video if node.content.is_some() || node.error.is_some() => {
                    NodePatch::reset_content()
                }
                NodeKind::Collection if !node.items.is_empty() => NodePatch::items(Vec::new()),
                _ => continue,
            };
            if self.store().update_node(&node.id, patch).await {
                cleared += 1;
            }
        }
        info!("Reset {} node(s)", cleared);
        let views = self.analyze().await;
        let counts = StatusCounts::from_views(&views);
        self.bus.publish(OrchestratorEvent::Progress {
            message: format!("reset {} node(s)", cleared),
            counts,
        });
        Ok(cleared)
    }
}
