//! Debounced writer that mirrors the live graph to its document file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::graph::{Graph, GraphStore};

/// Writes `graph` to `path` through a sibling temp file and a rename, so a
/// crash never leaves a truncated document behind.
pub async fn save_document(path: &Path, graph: &Graph) -> Result<()> {
    let text = graph.to_json_pretty()?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, text)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Spawns the auto-save task. Every burst of graph changes is written once,
/// `debounce` after the last change. Pending changes are flushed when
/// `cancel` fires or the store goes away.
pub fn spawn(
    store: GraphStore,
    path: PathBuf,
    debounce: Duration,
    cancel: CancellationToken,
) -> JoinHandle<Result<()>> {
    let mut changes = store.subscribe();
    tokio::spawn(async move {
        let mut dirty = false;
        loop {
            let event = if dirty {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(debounce) => None,
                    event = changes.recv() => Some(event),
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = changes.recv() => Some(event),
                }
            };

            match event {
                Some(Ok(_)) | Some(Err(RecvError::Lagged(_))) => dirty = true,
                Some(Err(RecvError::Closed)) => break,
                None => dirty = !flush(&store, &path).await,
            }
        }
        while let Ok(_) | Err(TryRecvError::Lagged(_)) = changes.try_recv() {
            dirty = true;
        }
        if dirty {
            flush(&store, &path).await;
        }
        Ok(())
    })
}

async fn flush(store: &GraphStore, path: &Path) -> bool {
    let graph = store.snapshot().await;
    match save_document(path, &graph).await {
        Ok(()) => {
            debug!("Auto-saved {} node(s) to {}", graph.len(), path.display());
            true
        }
        Err(e) => {
            warn!("Auto-save failed: {:#}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::{MediaContent, Node, NodePatch};

    #[tokio::test]
    async fn burst_of_changes_is_written_once_settled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let mut graph = Graph::new();
        graph.insert_node(Node::image("a", "A"));
        let store = GraphStore::new(graph);
        let cancel = CancellationToken::new();
        let task = spawn(store.clone(), path.clone(), Duration::from_millis(20), cancel.clone());

        store.update_node("a", NodePatch::mark_in_flight(1)).await;
        store
            .update_node("a", NodePatch::generated(MediaContent::new("https://cdn/a.png")))
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let saved = Graph::load(&path).await.unwrap();
        assert_eq!(saved.node("a").unwrap().content_url(), Some("https://cdn/a.png"));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_flushes_pending_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let store = GraphStore::new(Graph::new());
        let cancel = CancellationToken::new();
        let task = spawn(store.clone(), path.clone(), Duration::from_secs(3600), cancel.clone());

        store.insert_node(Node::video("v", "V")).await;
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert!(Graph::load(&path).await.unwrap().contains("v"));
    }

    #[tokio::test]
    async fn no_changes_means_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let cancel = CancellationToken::new();
        let task = spawn(GraphStore::new(Graph::new()), path.clone(), Duration::from_millis(5), cancel.clone());
        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(!path.exists());
    }
}
