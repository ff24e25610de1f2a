//! Cancellation, timing, retry and reset of the continuous executor.

use std::sync::Arc;
use std::time::Duration;

use super::support::{ScriptedTransport, events, executor, names};
use crate::core::dispatch::DispatchOutcome;
use crate::core::error::ErrorKind;
use crate::core::graph::{CollectionItem, Graph, Node};
use crate::core::orchestrator::OrchestratorEvent;
use crate::core::readiness::NodeStatus;

fn independent(ids: &[&str]) -> Graph {
    let mut graph = Graph::new();
    for id in ids {
        graph.insert_node(Node::image(*id, id.to_uppercase()).with_instructions("sunset"));
    }
    graph
}

#[tokio::test(start_paused = true)]
async fn ready_nodes_launch_before_the_first_poll_tick() {
    let transport = Arc::new(ScriptedTransport::new().with_delay(Duration::from_secs(30)));
    let (executor, mut rx) = executor(independent(&["a", "b"]), transport.clone());
    executor.enter().await;

    let run = tokio::spawn({
        let executor = executor.clone();
        async move { executor.start().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(transport.call_ids().len(), 2);
    let generating = events(&mut rx)
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                OrchestratorEvent::NodeUpdate {
                    status: NodeStatus::Generating,
                    ..
                }
            )
        })
        .count();
    assert_eq!(generating, 2);
    assert!(executor.store().node("a").await.unwrap().in_flight);

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.success, 2);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_new_launches_but_lets_running_jobs_finish() {
    let mut graph = Graph::new();
    graph.insert_node(Node::text("t", "storm"));
    graph.insert_node(Node::image("a", "A"));
    graph.insert_node(Node::image("b", "B"));
    graph.insert_node(Node::image("c", "C").with_instructions("calm"));
    graph.add_edge("t", "a");
    graph.add_edge("a", "b");

    let transport = Arc::new(ScriptedTransport::new().with_delay(Duration::from_secs(2)));
    let (executor, mut rx) = executor(graph, transport.clone());
    executor.enter().await;

    let run = tokio::spawn({
        let executor = executor.clone();
        async move { executor.start().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    executor.cancel();
    let summary = run.await.unwrap().unwrap();

    assert!(summary.cancelled);
    assert!(summary.blocked.is_empty());
    let mut called = transport.call_ids();
    called.sort();
    assert_eq!(called, vec!["a", "c"]);

    let graph = executor.store().snapshot().await;
    for id in ["a", "c"] {
        let node = graph.node(id).unwrap();
        assert!(node.has_content(), "{} lost its outcome", id);
        assert!(!node.in_flight);
    }
    assert!(!graph.node("b").unwrap().has_content());

    let events = events(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        OrchestratorEvent::Error {
            kind: ErrorKind::Cancelled,
            ..
        }
    )));
    assert!(matches!(
        events.last(),
        Some(OrchestratorEvent::RunComplete {
            cancelled: true,
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn cancellation_is_cleared_by_the_next_start() {
    let (executor, _rx) = executor(
        independent(&["a"]),
        Arc::new(ScriptedTransport::new()),
    );
    executor.cancel();
    let summary = executor.start().await.unwrap();
    assert!(!summary.cancelled);
    assert_eq!(summary.success, 1);
}

#[tokio::test(start_paused = true)]
async fn deleting_a_node_mid_run_counts_as_failure() {
    let transport = Arc::new(ScriptedTransport::new().with_delay(Duration::from_secs(1)));
    let (executor, mut rx) = executor(independent(&["a", "b"]), transport);
    executor.enter().await;

    let run = tokio::spawn({
        let executor = executor.clone();
        async move { executor.start().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    executor.store().remove_node("b").await;
    let summary = run.await.unwrap().unwrap();

    assert_eq!((summary.success, summary.failure), (1, 1));
    assert!(events(&mut rx).iter().any(|e| matches!(
        e,
        OrchestratorEvent::Error {
            kind: ErrorKind::DependencyUnresolved,
            ..
        }
    )));
    assert!(executor.store().node("b").await.is_none());
}

#[tokio::test]
async fn panicked_dispatch_is_recorded_as_a_failure() {
    let transport = Arc::new(ScriptedTransport::new().panicking("b"));
    let (executor, mut rx) = executor(independent(&["a", "b"]), transport.clone());
    executor.enter().await;
    let summary = executor.start().await.unwrap();

    assert_eq!((summary.success, summary.failure), (1, 1));
    let b = executor.store().node("b").await.unwrap();
    assert!(!b.in_flight);
    assert!(b.error.as_deref().unwrap().contains("stopped unexpectedly"));
    assert_eq!(transport.call_ids().iter().filter(|id| *id == "b").count(), 1);

    let failed = events(&mut rx).into_iter().find_map(|e| match e {
        OrchestratorEvent::NodeUpdate {
            node_id,
            status,
            error: Some(error),
        } if node_id == "b" => Some((status, error.kind)),
        _ => None,
    });
    assert_eq!(failed, Some((NodeStatus::Error, ErrorKind::ProviderRejected)));
}

#[tokio::test(start_paused = true)]
async fn second_start_is_refused_while_running() {
    let transport = Arc::new(ScriptedTransport::new().with_delay(Duration::from_secs(1)));
    let (executor, _rx) = executor(independent(&["a"]), transport);
    let run = tokio::spawn({
        let executor = executor.clone();
        async move { executor.start().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(executor.is_running());
    assert!(executor.start().await.is_err());
    assert!(executor.reset().await.is_err());
    run.await.unwrap().unwrap();
    assert!(!executor.is_running());
}

#[tokio::test]
async fn new_run_retries_failed_nodes() {
    let transport = Arc::new(ScriptedTransport::new().failing_once("a"));
    let (executor, _rx) = executor(independent(&["a"]), transport.clone());

    let first = executor.start().await.unwrap();
    assert_eq!(first.failure, 1);
    assert!(executor.store().node("a").await.unwrap().error.is_some());

    let second = executor.start().await.unwrap();
    assert_eq!(second.success, 1);
    let node = executor.store().node("a").await.unwrap();
    assert!(node.error.is_none());
    assert!(node.has_content());
    assert_eq!(transport.call_ids(), vec!["a", "a"]);
}

#[tokio::test]
async fn retry_node_dispatches_a_single_node() {
    let transport = Arc::new(ScriptedTransport::new().failing_once("a"));
    let (executor, mut rx) = executor(independent(&["a", "b"]), transport.clone());
    executor.start().await.unwrap();
    events(&mut rx);

    let outcome = executor.retry_node("a").await.unwrap();
    assert!(outcome.is_generated());
    assert_eq!(transport.call_ids().iter().filter(|id| *id == "a").count(), 2);
    assert_eq!(transport.call_ids().iter().filter(|id| *id == "b").count(), 1);

    let names = names(&events(&mut rx));
    assert!(names.contains(&"node_update"));
    assert!(executor.retry_node("ghost").await.is_err());
}

#[tokio::test]
async fn retry_of_a_waiting_node_is_skipped() {
    let mut graph = Graph::new();
    graph.insert_node(Node::image("a", "A"));
    graph.insert_node(Node::image("b", "B"));
    graph.add_edge("a", "b");
    let transport = Arc::new(ScriptedTransport::new());
    let (executor, _rx) = executor(graph, transport.clone());

    let outcome = executor.retry_node("b").await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Skipped(_)));
    assert!(transport.call_ids().is_empty());
}

#[tokio::test]
async fn reset_restores_candidates() {
    let mut graph = independent(&["a"]);
    graph.insert_node(Node::image("up", "Uploaded").with_content("https://cdn/up.png"));
    graph.insert_node(Node::collection("c", "Cast").with_items(vec![CollectionItem::image(
        "c:up",
        "https://cdn/up.png",
        "up",
        "Uploaded",
        true,
    )]));
    graph.add_edge("up", "c");
    let (executor, _rx) = executor(graph, Arc::new(ScriptedTransport::new()));
    executor.start().await.unwrap();

    let cleared = executor.reset().await.unwrap();
    assert_eq!(cleared, 3);
    let graph = executor.store().snapshot().await;
    assert!(!graph.node("a").unwrap().has_content());
    assert!(!graph.node("a").unwrap().is_generated);
    assert!(graph.node("c").unwrap().items.is_empty());

    let views = executor.analyze().await;
    let a = views.iter().find(|v| v.id == "a").unwrap();
    assert_eq!(a.status, NodeStatus::Ready);
}
