//! Collection population: keeps every collection node's item list in sync
//! with the image nodes feeding it.

use std::collections::HashSet;

use tracing::debug;

use crate::core::graph::{CollectionItem, Graph, GraphStore, Node, NodeId, NodeKind, NodePatch};

/// Collections whose items changed during a pass, with their new item count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PopulateReport {
    pub changed: Vec<(NodeId, usize)>,
}

impl PopulateReport {
    pub fn changed_count(&self) -> usize {
        self.changed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CollectionPopulator {
    disabled_view_types: HashSet<String>,
}

impl CollectionPopulator {
    pub fn new<I, S>(disabled_view_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            disabled_view_types: disabled_view_types
                .into_iter()
                .map(|s| s.as_ref().trim().to_lowercase())
                .collect(),
        }
    }

    pub fn view_type_enabled(&self, view_type: &str) -> bool {
        !self
            .disabled_view_types
            .contains(&view_type.trim().to_lowercase())
    }

    /// Whether an item taken from `source` starts out enabled.
    pub fn enabled_by_default(&self, source: &Node) -> bool {
        source
            .attributes
            .view_type
            .as_deref()
            .is_none_or(|v| self.view_type_enabled(v))
    }

    /// Item id derived from the collection and its source so rebuilds of an
    /// unchanged graph produce identical records.
    pub fn item_id(collection_id: &str, source_id: &str) -> String {
        format!("{}:{}", collection_id, source_id)
    }

    pub fn item_for(&self, collection_id: &str, source: &Node) -> Option<CollectionItem> {
        let url = source.content_url()?;
        Some(CollectionItem::image(
            Self::item_id(collection_id, &source.id),
            url,
            source.id.clone(),
            source.display_name(),
            self.enabled_by_default(source),
        ))
    }

    /// New item list for `collection`, or `None` when it must stay as is.
    pub fn plan_collection(&self, graph: &Graph, collection: &Node) -> Option<Vec<CollectionItem>> {
        let sources: Vec<&Node> = graph
            .incoming_neighbors(&collection.id)
            .into_iter()
            .filter(|n| n.kind == NodeKind::Image)
            .collect();
        let current = &collection.items;
        let malformed = current.iter().any(|item| !item.is_valid());

        if !current.is_empty()
            && !malformed
            && current.len() == sources.len()
            && current.iter().zip(&sources).all(|(item, source)| {
                item.source_node_id() == Some(source.id.as_str())
                    && item.url() == source.content_url()
            })
        {
            return None;
        }

        let rebuilt: Option<Vec<CollectionItem>> = sources
            .iter()
            .map(|source| self.item_for(&collection.id, source))
            .collect();

        match rebuilt {
            Some(items) if items != *current => Some(items),
            Some(_) => None,
            // Some source has no URL yet: drop a broken list, otherwise keep
            // the last valid state until every source is available.
            None if malformed => Some(Vec::new()),
            None => None,
        }
    }

    /// Pure planning pass over a snapshot.
    pub fn plan(&self, graph: &Graph) -> Vec<(NodeId, Vec<CollectionItem>)> {
        graph
            .nodes()
            .filter(|n| n.kind == NodeKind::Collection)
            .filter_map(|c| self.plan_collection(graph, c).map(|items| (c.id.clone(), items)))
            .collect()
    }

    /// Populates every collection in the store and commits changed lists.
    pub async fn populate(&self, store: &GraphStore) -> PopulateReport {
        let graph = store.snapshot().await;
        let mut report = PopulateReport::default();
        for (id, items) in self.plan(&graph) {
            let count = items.len();
            if store.update_node(&id, NodePatch::items(items)).await {
                debug!("Collection {} populated with {} item(s)", id, count);
                report.changed.push((id, count));
            }
        }
        report
    }
}
