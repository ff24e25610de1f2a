//! Dispatcher: turns one ready node into a provider job and records the
//! outcome on the graph.
//!
//! Preparation is pure and works from a [`Graph`] snapshot. Submission
//! suspends on the transport under a wall-clock budget. Applying the outcome
//! is the only step that touches the live store, so executors can run the
//! first two off their scheduling loop and apply results on it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::core::config::GenerationDefaults;
use crate::core::error::GenerationError;
use crate::core::graph::{Graph, GraphStore, MediaContent, Node, NodeId, NodeKind, NodePatch, now_millis};
use crate::core::provider::{
    FrameRole, ImageEditRequest, ModelCatalog, ModelProfile, ProviderRequest, ProviderTransport,
    RequestFamily, TextToImageRequest, VideoImage, VideoRequest,
};
use crate::core::readiness::LabelHeuristic;

const PROMPT_SEPARATOR: &str = "\n\n";
/// Direct image parents of a video beyond the first and last frame are ignored.
const MAX_FRAME_SOURCES: usize = 2;

/// Image handed to a provider as a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    pub url: String,
    pub original_url: Option<String>,
    /// Role when the job is a video; unused for image edits.
    pub role: Option<FrameRole>,
}

impl SourceImage {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            original_url: None,
            role: None,
        }
    }

    fn with_role(mut self, role: FrameRole) -> Self {
        self.role = Some(role);
        self
    }
}

/// One provider call, alive between dispatch and completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub node_id: NodeId,
    pub family: RequestFamily,
    pub model: String,
    pub prompt: String,
    pub sources: Vec<SourceImage>,
    pub aspect_ratio: String,
    pub duration: Option<u32>,
    pub seed: Option<u64>,
    pub test_mode: bool,
    pub started_at: u64,
}

impl Job {
    pub fn video_request(&self) -> VideoRequest {
        VideoRequest {
            node_id: self.node_id.clone(),
            prompt: self.prompt.clone(),
            images: self
                .sources
                .iter()
                .map(|s| VideoImage {
                    url: s.url.clone(),
                    role: s.role.unwrap_or(FrameRole::Character),
                    original_url: s.original_url.clone(),
                })
                .collect(),
            duration: self.duration.unwrap_or_default(),
            aspect_ratio: self.aspect_ratio.clone(),
            model: self.model.clone(),
            test_mode: self.test_mode,
        }
    }

    pub fn request(&self) -> ProviderRequest {
        match self.family {
            RequestFamily::TextToImage => ProviderRequest::TextToImage(TextToImageRequest {
                node_id: self.node_id.clone(),
                prompt: self.prompt.clone(),
                model: self.model.clone(),
                aspect_ratio: self.aspect_ratio.clone(),
                seed: self.seed,
                test_mode: self.test_mode,
            }),
            RequestFamily::ImageEdit => ProviderRequest::ImageEdit(ImageEditRequest {
                node_id: self.node_id.clone(),
                prompt: self.prompt.clone(),
                model: self.model.clone(),
                aspect_ratio: self.aspect_ratio.clone(),
                source_images: self.sources.iter().map(|s| s.url.clone()).collect(),
                seed: self.seed,
                test_mode: self.test_mode,
            }),
            RequestFamily::ImageToVideo => ProviderRequest::ImageToVideo(self.video_request()),
        }
    }
}

/// Result of one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Generated(MediaContent),
    Failed(GenerationError),
    /// Upstream content vanished before submission; the node goes back to
    /// waiting without an error.
    Skipped(GenerationError),
}

impl DispatchOutcome {
    pub fn is_generated(&self) -> bool {
        matches!(self, DispatchOutcome::Generated(_))
    }

    pub fn error(&self) -> Option<&GenerationError> {
        match self {
            DispatchOutcome::Generated(_) => None,
            DispatchOutcome::Failed(e) | DispatchOutcome::Skipped(e) => Some(e),
        }
    }

    fn patch(&self) -> NodePatch {
        match self {
            DispatchOutcome::Generated(content) => NodePatch::generated(content.clone()),
            DispatchOutcome::Failed(err) => NodePatch::failed(err.to_string()),
            DispatchOutcome::Skipped(_) => NodePatch::clear_in_flight(),
        }
    }
}

impl From<Result<MediaContent, GenerationError>> for DispatchOutcome {
    fn from(result: Result<MediaContent, GenerationError>) -> Self {
        match result {
            Ok(content) => DispatchOutcome::Generated(content),
            Err(err) => DispatchOutcome::Failed(err),
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    store: GraphStore,
    transport: Arc<dyn ProviderTransport>,
    models: ModelCatalog,
    profile: ModelProfile,
    defaults: GenerationDefaults,
    locations: LabelHeuristic,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(store: GraphStore, transport: Arc<dyn ProviderTransport>) -> Self {
        Self {
            store,
            transport,
            models: ModelCatalog::default(),
            profile: ModelProfile::default(),
            defaults: GenerationDefaults::default(),
            locations: LabelHeuristic::default(),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_models(mut self, models: ModelCatalog) -> Self {
        self.models = models;
        self
    }

    pub fn with_profile(mut self, profile: ModelProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_defaults(mut self, defaults: GenerationDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_location_terms(mut self, locations: LabelHeuristic) -> Self {
        self.locations = locations;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    pub fn transport(&self) -> &Arc<dyn ProviderTransport> {
        &self.transport
    }

    pub fn profile(&self) -> ModelProfile {
        self.profile
    }

    pub fn defaults(&self) -> &GenerationDefaults {
        &self.defaults
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Builds a job with model selection and attribute defaults applied.
    /// A `modelId` attribute on the node overrides the profile's model.
    pub fn build_job(
        &self,
        node: &Node,
        family: RequestFamily,
        prompt: String,
        sources: Vec<SourceImage>,
    ) -> Job {
        let model = node
            .attributes
            .model_id
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                self.models
                    .for_profile(self.profile)
                    .model_for(family)
                    .to_string()
            });
        let default_ratio = match family {
            RequestFamily::ImageToVideo => &self.defaults.video_aspect_ratio,
            _ => &self.defaults.image_aspect_ratio,
        };
        Job {
            node_id: node.id.clone(),
            family,
            model,
            prompt,
            sources,
            aspect_ratio: node
                .attributes
                .aspect_ratio
                .clone()
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| default_ratio.clone()),
            duration: (family == RequestFamily::ImageToVideo).then(|| {
                node.attributes
                    .duration
                    .filter(|d| *d > 0)
                    .unwrap_or(self.defaults.video_duration)
            }),
            seed: node.attributes.seed,
            test_mode: self.profile.is_test(),
            started_at: now_millis(),
        }
    }

    /// Derives the job for `node_id` from a snapshot.
    pub fn prepare_job(&self, graph: &Graph, node_id: &str) -> Result<Job, GenerationError> {
        let node = graph
            .node(node_id)
            .ok_or_else(|| GenerationError::DependencyUnresolved("a deleted node".into()))?;
        if !node.kind.is_generatable() {
            return Err(GenerationError::missing_input(format!(
                "{} nodes are not generated",
                node.kind.as_str()
            )));
        }
        let parents = graph.incoming_neighbors(node_id);
        if let Some(missing) = parents
            .iter()
            .find(|p| p.kind.is_traceable() && !p.has_content())
        {
            return Err(GenerationError::DependencyUnresolved(
                missing.display_name().to_string(),
            ));
        }

        let prompt = resolve_prompt(node, &parents)
            .ok_or_else(|| GenerationError::missing_input("no prompt: connect a text node or add instructions"))?;

        match node.kind {
            NodeKind::Video => {
                let sources = self.video_sources(graph, &parents);
                if sources.is_empty() {
                    return Err(GenerationError::missing_input(
                        "a video needs at least one source image",
                    ));
                }
                Ok(self.build_job(node, RequestFamily::ImageToVideo, prompt, sources))
            }
            _ => {
                let sources = image_sources(graph, &parents);
                let family = if sources.is_empty() {
                    RequestFamily::TextToImage
                } else {
                    RequestFamily::ImageEdit
                };
                Ok(self.build_job(node, family, prompt, sources))
            }
        }
    }

    /// Frames and references for a video, in edge order: up to two direct
    /// image parents as first and last frame, every enabled item of a
    /// character collection, and the first enabled item of a location
    /// collection.
    fn video_sources(&self, graph: &Graph, parents: &[&Node]) -> Vec<SourceImage> {
        let mut sources = Vec::new();
        let mut frames = 0;
        for parent in parents {
            match parent.kind {
                NodeKind::Image if frames < MAX_FRAME_SOURCES => {
                    if let Some(source) = node_source(parent) {
                        let role = if frames == 0 {
                            FrameRole::FirstFrame
                        } else {
                            FrameRole::LastFrame
                        };
                        sources.push(source.with_role(role));
                        frames += 1;
                    }
                }
                NodeKind::Collection if self.locations.is_location(&parent.label) => {
                    if let Some(item) = collection_sources(graph, parent).into_iter().next() {
                        sources.push(item.with_role(FrameRole::Location));
                    }
                }
                NodeKind::Collection => {
                    sources.extend(
                        collection_sources(graph, parent)
                            .into_iter()
                            .map(|s| s.with_role(FrameRole::Character)),
                    );
                }
                _ => {}
            }
        }
        sources
    }

    /// Sends `job` to the transport under the per-call time budget.
    pub async fn submit_job(&self, job: &Job) -> DispatchOutcome {
        info!(
            "Dispatching {} as {} with model {} ({} source(s))",
            job.node_id,
            job.family.as_str(),
            job.model,
            job.sources.len()
        );
        let request = job.request();
        match tokio::time::timeout(self.timeout, self.transport.submit(&request)).await {
            Ok(result) => DispatchOutcome::from(result),
            Err(_) => DispatchOutcome::Failed(GenerationError::Timeout(self.timeout.as_secs())),
        }
    }

    /// Prepares and submits without touching the store.
    pub async fn execute(&self, node_id: &str) -> DispatchOutcome {
        let graph = self.store.snapshot().await;
        match self.prepare_job(&graph, node_id) {
            Ok(job) => self.submit_job(&job).await,
            Err(err @ GenerationError::DependencyUnresolved(_)) => {
                debug!("Skipping {}: {}", node_id, err);
                DispatchOutcome::Skipped(err)
            }
            Err(err) => DispatchOutcome::Failed(err),
        }
    }

    pub async fn mark_in_flight(&self, node_id: &str) -> bool {
        self.store
            .update_node(node_id, NodePatch::mark_in_flight(now_millis()))
            .await
    }

    /// Records `outcome` on the node and clears its in-flight flag. Returns
    /// `false` when the node was deleted in the meantime.
    pub async fn apply(&self, node_id: &str, outcome: &DispatchOutcome) -> bool {
        let applied = self.store.update_node(node_id, outcome.patch()).await;
        if !applied {
            warn!("Node {} disappeared before its result was recorded", node_id);
        }
        applied
    }

    /// Full dispatch of one node: mark, submit, record.
    pub async fn dispatch(&self, node_id: &str) -> DispatchOutcome {
        if !self.mark_in_flight(node_id).await {
            return DispatchOutcome::Skipped(GenerationError::DependencyUnresolved(
                "a deleted node".into(),
            ));
        }
        let outcome = self.execute(node_id).await;
        self.apply(node_id, &outcome).await;
        outcome
    }
}

/// Text parents joined in edge order, else the node's own instructions.
pub fn resolve_prompt(node: &Node, parents: &[&Node]) -> Option<String> {
    let texts: Vec<&str> = parents
        .iter()
        .filter(|p| p.kind == NodeKind::Text)
        .filter_map(|p| p.text.as_deref().map(str::trim))
        .filter(|t| !t.is_empty())
        .collect();
    if texts.is_empty() {
        node.instructions().map(str::to_string)
    } else {
        Some(texts.join(PROMPT_SEPARATOR))
    }
}

fn node_source(node: &Node) -> Option<SourceImage> {
    let content = node.content.as_ref().filter(|c| !c.url.is_empty())?;
    Some(SourceImage {
        url: content.url.clone(),
        original_url: content.original_url.clone(),
        role: None,
    })
}

/// Enabled items of a collection, with the alternate URL of each item's
/// source node when one was recorded.
pub fn collection_sources(graph: &Graph, collection: &Node) -> Vec<SourceImage> {
    collection
        .enabled_items()
        .filter_map(|item| {
            let url = item.url()?;
            let original_url = item
                .source_node_id()
                .and_then(|id| graph.node(id))
                .and_then(|n| n.content.as_ref())
                .and_then(|c| c.original_url.clone());
            Some(SourceImage {
                url: url.to_string(),
                original_url,
                role: None,
            })
        })
        .collect()
}

fn image_sources(graph: &Graph, parents: &[&Node]) -> Vec<SourceImage> {
    parents
        .iter()
        .flat_map(|p| match p.kind {
            NodeKind::Image => node_source(p).into_iter().collect(),
            NodeKind::Collection => collection_sources(graph, p),
            _ => Vec::new(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::CollectionItem;
    use crate::core::provider::GenerationResult;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        requests: Mutex<Vec<ProviderRequest>>,
        reply: Option<GenerationError>,
    }

    #[async_trait]
    impl ProviderTransport for Recorder {
        async fn submit(&self, request: &ProviderRequest) -> GenerationResult {
            self.requests.lock().unwrap().push(request.clone());
            match &self.reply {
                Some(err) => Err(err.clone()),
                None => Ok(MediaContent::new(format!("https://cdn/{}.out", request.node_id()))),
            }
        }
    }

    fn dispatcher(graph: Graph) -> Dispatcher {
        Dispatcher::new(GraphStore::new(graph), Arc::new(Recorder::default()))
    }

    fn linear() -> Graph {
        let mut graph = Graph::new();
        graph.insert_node(Node::text("t", "prompt A"));
        graph.insert_node(Node::image("i1", "I1"));
        graph.insert_node(Node::image("i2", "I2"));
        graph.add_edge("t", "i1");
        graph.add_edge("i1", "i2");
        graph
    }

    #[test]
    fn image_without_sources_is_text_to_image() {
        let graph = linear();
        let job = dispatcher(graph.clone()).prepare_job(&graph, "i1").unwrap();
        assert_eq!(job.family, RequestFamily::TextToImage);
        assert_eq!(job.prompt, "prompt A");
        assert_eq!(job.model, "seedream-4");
        assert_eq!(job.aspect_ratio, "16:9");
        assert_eq!(job.duration, None);
    }

    #[test]
    fn image_with_parent_image_is_an_edit() {
        let mut graph = linear();
        graph.insert_node(Node::image("i1", "I1").with_content("https://cdn/u1.png"));
        let mut node = Node::image("i2", "I2").with_instructions("make it night");
        node.attributes.model_id = Some("custom-edit".into());
        graph.insert_node(node);

        let job = dispatcher(graph.clone()).prepare_job(&graph, "i2").unwrap();
        assert_eq!(job.family, RequestFamily::ImageEdit);
        assert_eq!(job.prompt, "make it night");
        assert_eq!(job.model, "custom-edit");
        match job.request() {
            ProviderRequest::ImageEdit(r) => assert_eq!(r.source_images, vec!["https://cdn/u1.png"]),
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn text_parents_are_joined_in_edge_order() {
        let mut graph = Graph::new();
        graph.insert_node(Node::text("a", "first"));
        graph.insert_node(Node::text("b", "  "));
        graph.insert_node(Node::text("c", "second"));
        graph.insert_node(Node::image("i", "I").with_instructions("ignored"));
        for id in ["a", "b", "c"] {
            graph.add_edge(id, "i");
        }
        let job = dispatcher(graph.clone()).prepare_job(&graph, "i").unwrap();
        assert_eq!(job.prompt, "first\n\nsecond");
    }

    #[test]
    fn empty_prompt_is_missing_input() {
        let mut graph = Graph::new();
        graph.insert_node(Node::image("i", "I"));
        let err = dispatcher(graph.clone()).prepare_job(&graph, "i").unwrap_err();
        assert!(matches!(err, GenerationError::MissingInput(_)));
    }

    #[test]
    fn video_collects_character_items_then_first_location_item() {
        let mut graph = Graph::new();
        graph.insert_node(Node::image("m1", "Marie front").with_content("https://cdn/m1.png"));
        let mut raw = Node::image("m2", "Marie side").with_content("https://cdn/m2.png");
        if let Some(content) = raw.content.as_mut() {
            content.original_url = Some("https://raw/m2.png".into());
        }
        graph.insert_node(raw);
        graph.insert_node(Node::collection("c_char", "Marie").with_items(vec![
            CollectionItem::image("c_char:m1", "https://cdn/m1.png", "m1", "Marie front", true),
            CollectionItem::image("c_char:m2", "https://cdn/m2.png", "m2", "Marie side", true),
            CollectionItem::image("c_char:m3", "https://cdn/m3.png", "m3", "Marie back", false),
        ]));
        graph.insert_node(Node::collection("c_loc", "Décor cuisine").with_items(vec![
            CollectionItem::image("c_loc:k1", "https://cdn/k1.png", "k1", "Kitchen", true),
            CollectionItem::image("c_loc:k2", "https://cdn/k2.png", "k2", "Kitchen 2", true),
        ]));
        graph.insert_node(Node::text("t", "action"));
        graph.insert_node(Node::video("v", "Shot 1"));
        graph.add_edge("c_char", "v");
        graph.add_edge("c_loc", "v");
        graph.add_edge("t", "v");

        let job = dispatcher(graph.clone()).prepare_job(&graph, "v").unwrap();
        let request = job.video_request();
        assert_eq!(request.prompt, "action");
        assert_eq!(request.duration, 10);
        assert_eq!(request.aspect_ratio, "16:9");
        assert_eq!(request.model, "kling-v2.1");
        let urls: Vec<_> = request.images.iter().map(|i| i.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["https://cdn/m1.png", "https://cdn/m2.png", "https://cdn/k1.png"]
        );
        let roles: Vec<_> = request.images.iter().map(|i| i.role).collect();
        assert_eq!(
            roles,
            vec![FrameRole::Character, FrameRole::Character, FrameRole::Location]
        );
        assert_eq!(request.images[1].original_url.as_deref(), Some("https://raw/m2.png"));
    }

    #[test]
    fn video_uses_two_direct_images_as_first_and_last_frame() {
        let mut graph = Graph::new();
        for (id, url) in [("a", "https://cdn/a.png"), ("b", "https://cdn/b.png"), ("c", "https://cdn/c.png")] {
            graph.insert_node(Node::image(id, id).with_content(url));
            graph.add_edge(id, "v");
        }
        graph.insert_node(Node::video("v", "V").with_instructions("pan"));
        let job = dispatcher(graph.clone()).prepare_job(&graph, "v").unwrap();
        let roles: Vec<_> = job.sources.iter().map(|s| s.role).collect();
        assert_eq!(roles, vec![Some(FrameRole::FirstFrame), Some(FrameRole::LastFrame)]);
    }

    #[test]
    fn video_without_sources_is_missing_input() {
        let mut graph = Graph::new();
        graph.insert_node(Node::video("v", "V").with_instructions("pan"));
        let err = dispatcher(graph.clone()).prepare_job(&graph, "v").unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::MissingInput);
    }

    #[test]
    fn emptied_parent_is_dependency_unresolved() {
        let graph = linear();
        let err = dispatcher(graph.clone()).prepare_job(&graph, "i2").unwrap_err();
        assert_eq!(err, GenerationError::DependencyUnresolved("I1".into()));
    }

    #[test]
    fn test_profile_switches_models_and_flags_requests() {
        let graph = linear();
        let job = dispatcher(graph.clone())
            .with_profile(ModelProfile::Test)
            .prepare_job(&graph, "i1")
            .unwrap();
        assert_eq!(job.model, "flux-schnell");
        assert!(job.test_mode);
    }

    #[tokio::test]
    async fn dispatch_records_content_and_clears_flag() {
        let d = dispatcher(linear());
        let outcome = d.dispatch("i1").await;
        assert!(outcome.is_generated());
        let node = d.store().node("i1").await.unwrap();
        assert!(!node.in_flight);
        assert!(node.is_generated);
        assert_eq!(node.content_url(), Some("https://cdn/i1.out"));
    }

    #[tokio::test]
    async fn dispatch_failure_sets_error() {
        let transport = Recorder {
            reply: Some(GenerationError::ProviderRejected {
                status: 400,
                message: "bad prompt".into(),
            }),
            ..Recorder::default()
        };
        let d = Dispatcher::new(GraphStore::new(linear()), Arc::new(transport));
        let outcome = d.dispatch("i1").await;
        assert!(matches!(outcome, DispatchOutcome::Failed(_)));
        let node = d.store().node("i1").await.unwrap();
        assert!(!node.in_flight);
        assert!(node.error.as_deref().unwrap().contains("bad prompt"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_transport_times_out() {
        struct Hang;
        #[async_trait]
        impl ProviderTransport for Hang {
            async fn submit(&self, _request: &ProviderRequest) -> GenerationResult {
                std::future::pending().await
            }
        }
        let d = Dispatcher::new(GraphStore::new(linear()), Arc::new(Hang))
            .with_timeout(Duration::from_secs(5));
        let outcome = d.dispatch("i1").await;
        assert_eq!(outcome, DispatchOutcome::Failed(GenerationError::Timeout(5)));
        assert!(!d.store().node("i1").await.unwrap().in_flight);
    }

    #[tokio::test]
    async fn skipped_dispatch_leaves_no_error() {
        let d = dispatcher(linear());
        let outcome = d.dispatch("i2").await;
        assert!(matches!(outcome, DispatchOutcome::Skipped(_)));
        let node = d.store().node("i2").await.unwrap();
        assert!(!node.in_flight);
        assert!(node.error.is_none());
    }
}
