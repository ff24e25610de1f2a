//! Batch planner: the scripted run that follows brief expansion.
//!
//! The plan lists, per character and per location, an ordered set of views
//! (the first is the primary) and the collection gathering them, plus the
//! videos consuming those collections. Execution is four hard-separated
//! phases: primaries from text, variants edited from their primary,
//! collection publication, then every video in one bounded batch.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::events::{EventBus, OrchestratorEvent};
use super::types::{Phase, PhaseStats, RunSummary};
use super::{deliver_handoff, outcome_event};
use crate::core::collections::CollectionPopulator;
use crate::core::dispatch::{DispatchOutcome, Dispatcher, Job, SourceImage, collection_sources};
use crate::core::error::{ErrorKind, GenerationError};
use crate::core::graph::{CollectionItem, Graph, GraphStore, MediaContent, NodeId, NodePatch};
use crate::core::handoff::HandoffSink;
use crate::core::provider::{BatchResult, FrameRole, GenerationResult, RequestFamily};
use crate::core::readiness::NodeStatus;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationPlan {
    #[serde(default)]
    pub characters: Vec<EntityPlan>,
    #[serde(default)]
    pub locations: Vec<EntityPlan>,
    #[serde(default)]
    pub videos: Vec<VideoPlan>,
}

/// A character or a location: its views and the collection holding them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityPlan {
    pub name: String,
    pub collection_id: NodeId,
    /// Primary view first.
    pub views: Vec<ViewPlan>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewPlan {
    pub node_id: NodeId,
    pub view_type: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub aspect_ratio: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoPlan {
    pub node_id: NodeId,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub character_collections: Vec<NodeId>,
    #[serde(default)]
    pub location_collections: Vec<NodeId>,
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub aspect_ratio: Option<String>,
}

impl GenerationPlan {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid generation plan")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityPlan> {
        self.characters.iter().chain(self.locations.iter())
    }
}

fn prompt_or_instructions(plan_prompt: &str, graph: &Graph, node_id: &str) -> Option<String> {
    let prompt = plan_prompt.trim();
    if !prompt.is_empty() {
        return Some(prompt.to_string());
    }
    graph
        .node(node_id)
        .and_then(|n| n.instructions())
        .map(str::to_string)
}

/// Pairs each launched job with its batch result by node id. Jobs the
/// provider left unanswered fail as malformed; answers for nodes that were
/// never sent are dropped.
fn match_batch_results(
    launched: &[Job],
    results: Vec<BatchResult>,
) -> Vec<(NodeId, DispatchOutcome)> {
    let mut by_node: HashMap<NodeId, GenerationResult> = HashMap::new();
    for (node_id, result) in results {
        if !launched.iter().any(|j| j.node_id == node_id) {
            warn!("Batch answered for {}, which was not submitted", node_id);
            continue;
        }
        by_node.entry(node_id).or_insert(result);
    }
    launched
        .iter()
        .map(|job| {
            let outcome = match by_node.remove(&job.node_id) {
                Some(result) => DispatchOutcome::from(result),
                None => DispatchOutcome::Failed(GenerationError::malformed(
                    "no result for this video in the batch answer",
                )),
            };
            (job.node_id.clone(), outcome)
        })
        .collect()
}

pub struct BatchPlanner {
    dispatcher: Dispatcher,
    populator: CollectionPopulator,
    bus: EventBus,
    handoff: Option<Arc<dyn HandoffSink>>,
    video_concurrency: usize,
    cancel: CancellationToken,
}

impl BatchPlanner {
    pub fn new(dispatcher: Dispatcher, bus: EventBus) -> Self {
        Self {
            dispatcher,
            populator: CollectionPopulator::default(),
            bus,
            handoff: None,
            video_concurrency: 4,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_populator(mut self, populator: CollectionPopulator) -> Self {
        self.populator = populator;
        self
    }

    pub fn with_handoff(mut self, sink: Arc<dyn HandoffSink>) -> Self {
        self.handoff = Some(sink);
        self
    }

    pub fn with_video_concurrency(mut self, concurrency: usize) -> Self {
        self.video_concurrency = concurrency.max(1);
        self
    }

    pub fn store(&self) -> &GraphStore {
        self.dispatcher.store()
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token checked between phases. Cancelling it lets the current phase
    /// finish and skips the rest.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self, plan: &GenerationPlan) -> RunSummary {
        let run_id = self.bus.begin_run();
        info!("Starting batch run {}", run_id);
        let mut total = PhaseStats::default();
        let mut cancelled = false;
        let mut primary_urls: HashMap<NodeId, MediaContent> = HashMap::new();
        let mut published: HashMap<NodeId, Vec<CollectionItem>> = HashMap::new();

        for phase in Phase::BATCH {
            if self.cancel.is_cancelled() {
                cancelled = true;
                self.bus.publish(OrchestratorEvent::error(
                    ErrorKind::Cancelled,
                    format!("cancelled before {}", phase.as_str()),
                ));
                break;
            }
            self.bus.publish(OrchestratorEvent::PhaseStart { phase });
            let stats = match phase {
                Phase::Primaries => self.run_primaries(plan, &mut primary_urls).await,
                Phase::Variants => self.run_variants(plan, &primary_urls).await,
                Phase::Collections => self.run_collections(plan, &mut published).await,
                Phase::Videos => self.run_videos(plan, &published).await,
                Phase::Continuous => PhaseStats::default(),
            };
            info!(
                "Phase {} done: {} ok, {} failed",
                phase.as_str(),
                stats.success,
                stats.failure
            );
            self.bus
                .publish(OrchestratorEvent::PhaseComplete { phase, stats });
            if phase != Phase::Collections {
                total.absorb(stats);
            }
        }

        self.bus.publish(OrchestratorEvent::RunComplete {
            success: total.success,
            failure: total.failure,
            cancelled,
        });
        RunSummary {
            run_id: run_id.to_string(),
            success: total.success,
            failure: total.failure,
            cancelled,
            blocked: Vec::new(),
        }
    }

    async fn run_primaries(
        &self,
        plan: &GenerationPlan,
        primary_urls: &mut HashMap<NodeId, MediaContent>,
    ) -> PhaseStats {
        let graph = self.dispatcher.store().snapshot().await;
        let mut jobs = Vec::new();
        let mut failures = Vec::new();
        for entity in plan.entities() {
            let Some(view) = entity.views.first() else {
                continue;
            };
            match self.image_job(&graph, view, RequestFamily::TextToImage, Vec::new()) {
                Ok(job) => jobs.push(job),
                Err(err) => failures.push((view.node_id.clone(), err)),
            }
        }
        let outcomes = self.run_parallel(jobs, failures).await;
        for (node_id, outcome) in &outcomes {
            if let DispatchOutcome::Generated(content) = outcome {
                primary_urls.insert(node_id.clone(), content.clone());
            }
        }
        self.record(outcomes).await
    }

    async fn run_variants(
        &self,
        plan: &GenerationPlan,
        primary_urls: &HashMap<NodeId, MediaContent>,
    ) -> PhaseStats {
        let graph = self.dispatcher.store().snapshot().await;
        let mut jobs = Vec::new();
        let mut failures = Vec::new();
        for entity in plan.entities() {
            let Some((primary, variants)) = entity.views.split_first() else {
                continue;
            };
            let reference = primary_urls.get(&primary.node_id).map(|c| SourceImage {
                url: c.url.clone(),
                original_url: c.original_url.clone(),
                role: None,
            });
            for view in variants {
                let Some(reference) = reference.clone() else {
                    failures.push((
                        view.node_id.clone(),
                        GenerationError::missing_input(format!(
                            "primary view of {} has no image",
                            entity.name
                        )),
                    ));
                    continue;
                };
                match self.image_job(&graph, view, RequestFamily::ImageEdit, vec![reference]) {
                    Ok(job) => jobs.push(job),
                    Err(err) => failures.push((view.node_id.clone(), err)),
                }
            }
        }
        let outcomes = self.run_parallel(jobs, failures).await;
        self.record(outcomes).await
    }

    fn image_job(
        &self,
        graph: &Graph,
        view: &ViewPlan,
        family: RequestFamily,
        sources: Vec<SourceImage>,
    ) -> Result<Job, GenerationError> {
        let node = graph.node(&view.node_id).ok_or_else(|| {
            GenerationError::DependencyUnresolved(format!("missing node {}", view.node_id))
        })?;
        let prompt = prompt_or_instructions(&view.prompt, graph, &view.node_id)
            .ok_or_else(|| GenerationError::missing_input("no prompt for this view"))?;
        let mut job = self.dispatcher.build_job(node, family, prompt, sources);
        if let Some(ratio) = view.aspect_ratio.as_ref().filter(|r| !r.trim().is_empty()) {
            job.aspect_ratio = ratio.clone();
        }
        Ok(job)
    }

    /// Publishes each collection's items from its planned views, in view
    /// order. Views of a disabled-by-default type are kept but disabled.
    async fn run_collections(
        &self,
        plan: &GenerationPlan,
        published: &mut HashMap<NodeId, Vec<CollectionItem>>,
    ) -> PhaseStats {
        let graph = self.dispatcher.store().snapshot().await;
        let mut stats = PhaseStats::default();
        for entity in plan.entities() {
            let items: Vec<CollectionItem> = entity
                .views
                .iter()
                .filter_map(|view| {
                    let source = graph.node(&view.node_id)?;
                    Some(CollectionItem::image(
                        CollectionPopulator::item_id(&entity.collection_id, &source.id),
                        source.content_url()?,
                        source.id.clone(),
                        source.display_name(),
                        self.populator.view_type_enabled(&view.view_type),
                    ))
                })
                .collect();
            let count = items.len();
            if self
                .dispatcher
                .store()
                .update_node(&entity.collection_id, NodePatch::items(items.clone()))
                .await
            {
                stats.success += 1;
                self.bus.publish(OrchestratorEvent::CollectionPopulated {
                    id: entity.collection_id.clone(),
                    count,
                });
                published.insert(entity.collection_id.clone(), items);
            } else {
                warn!("Collection {} is not on the canvas", entity.collection_id);
                stats.failure += 1;
            }
        }
        stats
    }

    /// Sources for one video from its collections. Items published in this
    /// run are used when present, otherwise the graph's current items.
    fn video_sources(
        &self,
        graph: &Graph,
        video: &VideoPlan,
        published: &HashMap<NodeId, Vec<CollectionItem>>,
    ) -> Vec<SourceImage> {
        let items_of = |collection_id: &NodeId| -> Vec<SourceImage> {
            match published.get(collection_id) {
                Some(items) => items
                    .iter()
                    .filter(|i| i.enabled && i.is_valid())
                    .filter_map(|i| {
                        let url = i.url()?;
                        Some(SourceImage {
                            url: url.to_string(),
                            original_url: i
                                .source_node_id()
                                .and_then(|id| graph.node(id))
                                .and_then(|n| n.content.as_ref())
                                .and_then(|c| c.original_url.clone()),
                            role: None,
                        })
                    })
                    .collect(),
                None => graph
                    .node(collection_id)
                    .map(|c| collection_sources(graph, c))
                    .unwrap_or_default(),
            }
        };

        let mut sources = Vec::new();
        for id in &video.character_collections {
            sources.extend(items_of(id).into_iter().map(|mut s| {
                s.role = Some(FrameRole::Character);
                s
            }));
        }
        for id in &video.location_collections {
            if let Some(mut first) = items_of(id).into_iter().next() {
                first.role = Some(FrameRole::Location);
                sources.push(first);
            }
        }
        sources
    }

    async fn run_videos(
        &self,
        plan: &GenerationPlan,
        published: &HashMap<NodeId, Vec<CollectionItem>>,
    ) -> PhaseStats {
        let graph = self.dispatcher.store().snapshot().await;
        let mut jobs = Vec::new();
        let mut failures = Vec::new();
        for video in &plan.videos {
            match self.video_job(&graph, video, published) {
                Ok(job) => jobs.push(job),
                Err(err) => failures.push((video.node_id.clone(), err)),
            }
        }

        let mut outcomes = Self::mark_failures(failures);
        let mut launched = Vec::new();
        for job in jobs {
            if self.dispatcher.mark_in_flight(&job.node_id).await {
                self.bus.publish(OrchestratorEvent::node_update(
                    &job.node_id,
                    NodeStatus::Generating,
                ));
                launched.push(job);
            }
        }

        if !launched.is_empty() {
            let requests: Vec<_> = launched.iter().map(Job::video_request).collect();
            let timeout = self.dispatcher.timeout();
            let batch = tokio::time::timeout(
                timeout,
                self.dispatcher
                    .transport()
                    .submit_video_batch(&requests, self.video_concurrency),
            )
            .await;
            match batch {
                Ok(Some(results)) => {
                    info!("Submitted {} video(s) as one batch", requests.len());
                    outcomes.extend(match_batch_results(&launched, results));
                }
                Ok(None) => outcomes.extend(self.submit_bounded(launched).await),
                Err(_) => {
                    warn!("Video batch timed out after {}s", timeout.as_secs());
                    outcomes.extend(launched.into_iter().map(|job| {
                        (
                            job.node_id,
                            DispatchOutcome::Failed(GenerationError::Timeout(timeout.as_secs())),
                        )
                    }));
                }
            }
        }

        let stats = self.record(outcomes.clone()).await;
        if let Some(sink) = &self.handoff {
            for (node_id, outcome) in &outcomes {
                if let DispatchOutcome::Generated(content) = outcome
                    && let Some(node) = self.dispatcher.store().node(node_id).await
                {
                    let event = deliver_handoff(sink.as_ref(), &node, content).await;
                    self.bus.publish(event);
                }
            }
        }
        stats
    }

    fn video_job(
        &self,
        graph: &Graph,
        video: &VideoPlan,
        published: &HashMap<NodeId, Vec<CollectionItem>>,
    ) -> Result<Job, GenerationError> {
        let node = graph.node(&video.node_id).ok_or_else(|| {
            GenerationError::DependencyUnresolved(format!("missing node {}", video.node_id))
        })?;
        let prompt = prompt_or_instructions(&video.prompt, graph, &video.node_id)
            .ok_or_else(|| GenerationError::missing_input("no prompt for this video"))?;
        let sources = self.video_sources(graph, video, published);
        if sources.is_empty() {
            return Err(GenerationError::missing_input(
                "a video needs at least one source image",
            ));
        }
        let mut job = self
            .dispatcher
            .build_job(node, RequestFamily::ImageToVideo, prompt, sources);
        if let Some(duration) = video.duration.filter(|d| *d > 0) {
            job.duration = Some(duration);
        }
        if let Some(ratio) = video.aspect_ratio.as_ref().filter(|r| !r.trim().is_empty()) {
            job.aspect_ratio = ratio.clone();
        }
        Ok(job)
    }

    /// Individual submissions, at most `video_concurrency` at a time.
    async fn submit_bounded(&self, jobs: Vec<Job>) -> Vec<(NodeId, DispatchOutcome)> {
        let permits = Arc::new(Semaphore::new(self.video_concurrency));
        let mut set = JoinSet::new();
        for (index, job) in jobs.into_iter().enumerate() {
            let dispatcher = self.dispatcher.clone();
            let permits = permits.clone();
            set.spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => dispatcher.submit_job(&job).await,
                    Err(_) => DispatchOutcome::Failed(GenerationError::Cancelled),
                };
                (index, job.node_id, outcome)
            });
        }
        let mut results = Vec::new();
        while let Some(res) = set.join_next().await {
            match res {
                Ok(done) => results.push(done),
                Err(e) => warn!("Video task failed: {}", e),
            }
        }
        results.sort_by_key(|(index, _, _)| *index);
        results
            .into_iter()
            .map(|(_, node_id, outcome)| (node_id, outcome))
            .collect()
    }

    /// Marks every job in flight and runs them all concurrently; failures
    /// found while planning are recorded alongside.
    async fn run_parallel(
        &self,
        jobs: Vec<Job>,
        failures: Vec<(NodeId, GenerationError)>,
    ) -> Vec<(NodeId, DispatchOutcome)> {
        let mut outcomes = Self::mark_failures(failures);
        let mut set = JoinSet::new();
        for job in jobs {
            if !self.dispatcher.mark_in_flight(&job.node_id).await {
                continue;
            }
            self.bus.publish(OrchestratorEvent::node_update(
                &job.node_id,
                NodeStatus::Generating,
            ));
            let dispatcher = self.dispatcher.clone();
            set.spawn(async move {
                let outcome = dispatcher.submit_job(&job).await;
                (job.node_id, outcome)
            });
        }
        while let Some(res) = set.join_next().await {
            match res {
                Ok(done) => outcomes.push(done),
                Err(e) => warn!("Generation task failed: {}", e),
            }
        }
        outcomes
    }

    fn mark_failures(failures: Vec<(NodeId, GenerationError)>) -> Vec<(NodeId, DispatchOutcome)> {
        failures
            .into_iter()
            .map(|(id, err)| (id, DispatchOutcome::Failed(err)))
            .collect()
    }

    /// Applies outcomes to the graph, then publishes their events.
    async fn record(&self, outcomes: Vec<(NodeId, DispatchOutcome)>) -> PhaseStats {
        let mut stats = PhaseStats::default();
        for (node_id, outcome) in outcomes {
            let applied = self.dispatcher.apply(&node_id, &outcome).await;
            if applied && outcome.is_generated() {
                stats.success += 1;
            } else {
                stats.failure += 1;
            }
            if let Some(err) = outcome.error() {
                warn!("{}: {}", node_id, err);
            }
            self.bus.publish(outcome_event(&node_id, &outcome));
        }
        stats
    }
}
