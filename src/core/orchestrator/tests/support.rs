//! Scripted provider and helpers shared by the orchestrator tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::core::dispatch::Dispatcher;
use crate::core::error::GenerationError;
use crate::core::graph::{Graph, GraphStore, MediaContent};
use crate::core::orchestrator::{ContinuousExecutor, EventBus, EventEnvelope, OrchestratorEvent};
use crate::core::provider::{
    BatchResult, GenerationResult, ProviderRequest, ProviderTransport, RequestFamily,
    VideoRequest,
};

/// In-memory provider. Every call is recorded; replies are scripted per
/// node id.
#[derive(Default)]
pub struct ScriptedTransport {
    pub calls: Mutex<Vec<ProviderRequest>>,
    pub batches: Mutex<Vec<Vec<VideoRequest>>>,
    failures: HashMap<String, GenerationError>,
    fail_once: Mutex<HashSet<String>>,
    panics: HashSet<String>,
    delay: Duration,
    batch_endpoint: bool,
    batch_answer: Option<Vec<String>>,
    cancel_on_first_call: Option<CancellationToken>,
    active: AtomicUsize,
    pub peak_concurrency: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, node_id: &str, err: GenerationError) -> Self {
        self.failures.insert(node_id.to_string(), err);
        self
    }

    pub fn failing_once(self, node_id: &str) -> Self {
        self.fail_once
            .lock()
            .unwrap()
            .insert(node_id.to_string());
        self
    }

    /// Calls for `node_id` panic inside the dispatch task.
    pub fn panicking(mut self, node_id: &str) -> Self {
        self.panics.insert(node_id.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_batch_endpoint(mut self) -> Self {
        self.batch_endpoint = true;
        self
    }

    /// Batch calls answer only for `node_ids`, in the given order.
    pub fn answering_batch_for(mut self, node_ids: &[&str]) -> Self {
        self.batch_endpoint = true;
        self.batch_answer = Some(node_ids.iter().map(|id| id.to_string()).collect());
        self
    }

    pub fn cancelling_on_first_call(mut self, token: CancellationToken) -> Self {
        self.cancel_on_first_call = Some(token);
        self
    }

    pub fn call_ids(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.node_id().to_string())
            .collect()
    }

    pub fn request_for(&self, node_id: &str) -> Option<ProviderRequest> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.node_id() == node_id)
            .cloned()
    }

    fn reply(&self, node_id: &str, family: RequestFamily) -> GenerationResult {
        if let Some(err) = self.failures.get(node_id) {
            return Err(err.clone());
        }
        if self.fail_once.lock().unwrap().remove(node_id) {
            return Err(GenerationError::ProviderRejected {
                status: 500,
                message: "flaky".into(),
            });
        }
        let ext = match family {
            RequestFamily::ImageToVideo => "mp4",
            _ => "png",
        };
        Ok(MediaContent::new(format!("https://cdn/{}.{}", node_id, ext)))
    }
}

#[async_trait]
impl ProviderTransport for ScriptedTransport {
    async fn submit(&self, request: &ProviderRequest) -> GenerationResult {
        self.calls.lock().unwrap().push(request.clone());
        if let Some(token) = &self.cancel_on_first_call {
            token.cancel();
        }
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_concurrency.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        if self.panics.contains(request.node_id()) {
            panic!("provider client crashed on {}", request.node_id());
        }
        self.reply(request.node_id(), request.family())
    }

    async fn submit_video_batch(
        &self,
        requests: &[VideoRequest],
        _max_concurrency: usize,
    ) -> Option<Vec<BatchResult>> {
        if !self.batch_endpoint {
            return None;
        }
        self.batches.lock().unwrap().push(requests.to_vec());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let answered: Vec<String> = match &self.batch_answer {
            Some(ids) => ids.clone(),
            None => requests.iter().map(|r| r.node_id.clone()).collect(),
        };
        Some(
            answered
                .into_iter()
                .map(|id| {
                    let result = self.reply(&id, RequestFamily::ImageToVideo);
                    (id, result)
                })
                .collect(),
        )
    }
}

pub fn dispatcher(graph: Graph, transport: Arc<ScriptedTransport>) -> Dispatcher {
    Dispatcher::new(GraphStore::new(graph), transport)
}

pub fn executor(
    graph: Graph,
    transport: Arc<ScriptedTransport>,
) -> (Arc<ContinuousExecutor>, broadcast::Receiver<EventEnvelope>) {
    let bus = EventBus::new();
    let rx = bus.subscribe();
    let executor = ContinuousExecutor::new(dispatcher(graph, transport), bus);
    (Arc::new(executor), rx)
}

/// Everything published so far.
pub fn drain(rx: &mut broadcast::Receiver<EventEnvelope>) -> Vec<EventEnvelope> {
    let mut out = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        out.push(envelope);
    }
    out
}

pub fn events(rx: &mut broadcast::Receiver<EventEnvelope>) -> Vec<OrchestratorEvent> {
    drain(rx).into_iter().map(|e| e.event).collect()
}

pub fn names(events: &[OrchestratorEvent]) -> Vec<&'static str> {
    events.iter().map(OrchestratorEvent::name).collect()
}
