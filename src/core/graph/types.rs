use serde::{Deserialize, Serialize};

pub type NodeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Image,
    Video,
    Collection,
    Text,
    Audio,
    Shape,
    Label,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Image => "image",
            NodeKind::Video => "video",
            NodeKind::Collection => "collection",
            NodeKind::Text => "text",
            NodeKind::Audio => "audio",
            NodeKind::Shape => "shape",
            NodeKind::Label => "label",
        }
    }

    /// Kinds that take part in readiness analysis.
    pub fn is_traceable(self) -> bool {
        matches!(
            self,
            NodeKind::Image | NodeKind::Video | NodeKind::Collection
        )
    }

    /// Kinds the executors dispatch to a provider.
    pub fn is_generatable(self) -> bool {
        matches!(self, NodeKind::Image | NodeKind::Video)
    }
}

/// A media reference produced by a provider or uploaded by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaContent {
    pub url: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Alternate URL recorded by the provider (the unprocessed upload).
    /// Forwarded as `originalUrl` when the media is used as a source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
}

impl MediaContent {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            media_type: None,
            width: None,
            height: None,
            original_url: None,
            local_path: None,
        }
    }
}

/// Item of a collection node. Fields stay optional because persisted
/// documents may carry partial records; [`CollectionItem::is_valid`] decides
/// whether the record is usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionItem {
    #[serde(default)]
    pub item_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub source_node_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

impl CollectionItem {
    pub fn image(
        item_id: impl Into<String>,
        url: impl Into<String>,
        source_node_id: impl Into<String>,
        name: impl Into<String>,
        enabled: bool,
    ) -> Self {
        Self {
            item_id: Some(item_id.into()),
            url: Some(url.into()),
            kind: Some(NodeKind::Image.as_str().to_string()),
            enabled,
            source_node_id: Some(source_node_id.into()),
            name: Some(name.into()),
        }
    }

    /// An item is valid when it has an id, a URL, the image kind and the
    /// node it was taken from.
    pub fn is_valid(&self) -> bool {
        non_empty(&self.item_id)
            && non_empty(&self.url)
            && self.kind.as_deref() == Some(NodeKind::Image.as_str())
            && non_empty(&self.source_node_id)
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn source_node_id(&self) -> Option<&str> {
        self.source_node_id.as_deref()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_type: Option<String>,
    /// Editor-owned options the orchestrator carries but never reads.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MediaContent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<CollectionItem>,
    /// Body of a text node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default)]
    pub in_flight: bool,
    /// Milliseconds since the Unix epoch at which the job was dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight_since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub is_generated: bool,
    #[serde(default)]
    pub attributes: NodeAttributes,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, kind: NodeKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            content: None,
            items: Vec::new(),
            text: None,
            instructions: None,
            in_flight: false,
            in_flight_since: None,
            error: None,
            is_generated: false,
            attributes: NodeAttributes::default(),
        }
    }

    pub fn image(id: impl Into<NodeId>, label: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Image, label)
    }

    pub fn video(id: impl Into<NodeId>, label: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Video, label)
    }

    pub fn collection(id: impl Into<NodeId>, label: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Collection, label)
    }

    pub fn text(id: impl Into<NodeId>, body: impl Into<String>) -> Self {
        let mut node = Self::new(id, NodeKind::Text, "");
        node.text = Some(body.into());
        node
    }

    pub fn with_content(mut self, url: impl Into<String>) -> Self {
        self.content = Some(MediaContent::new(url));
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_items(mut self, items: Vec<CollectionItem>) -> Self {
        self.items = items;
        self
    }

    pub fn with_view_type(mut self, view_type: impl Into<String>) -> Self {
        self.attributes.view_type = Some(view_type.into());
        self
    }

    pub fn in_flight(mut self) -> Self {
        self.in_flight = true;
        self
    }

    /// Whether the node currently holds usable output. Collections count
    /// when they have items and every item is valid.
    pub fn has_content(&self) -> bool {
        match self.kind {
            NodeKind::Collection => {
                !self.items.is_empty() && self.items.iter().all(CollectionItem::is_valid)
            }
            NodeKind::Text => self.text.as_deref().is_some_and(|t| !t.trim().is_empty()),
            _ => self.content.as_ref().is_some_and(|c| !c.url.is_empty()),
        }
    }

    pub fn content_url(&self) -> Option<&str> {
        self.content
            .as_ref()
            .map(|c| c.url.as_str())
            .filter(|u| !u.is_empty())
    }

    pub fn enabled_items(&self) -> impl Iterator<Item = &CollectionItem> {
        self.items
            .iter()
            .filter(|item| item.enabled && item.is_valid())
    }

    pub fn instructions(&self) -> Option<&str> {
        self.instructions
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Name used in progress messages; falls back to the id.
    pub fn display_name(&self) -> &str {
        if self.label.trim().is_empty() {
            &self.id
        } else {
            &self.label
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
}

impl Edge {
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Partial update merged into a node by [`super::GraphStore::update_node`].
/// Each populated field replaces the whole corresponding field on the node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePatch {
    pub content: Option<Option<MediaContent>>,
    pub items: Option<Vec<CollectionItem>>,
    pub instructions: Option<Option<String>>,
    pub in_flight: Option<bool>,
    pub in_flight_since: Option<Option<u64>>,
    pub error: Option<Option<String>>,
    pub is_generated: Option<bool>,
    pub attributes: Option<NodeAttributes>,
}

impl NodePatch {
    pub fn mark_in_flight(now_ms: u64) -> Self {
        Self {
            in_flight: Some(true),
            in_flight_since: Some(Some(now_ms)),
            error: Some(None),
            ..Self::default()
        }
    }

    pub fn clear_in_flight() -> Self {
        Self {
            in_flight: Some(false),
            in_flight_since: Some(None),
            ..Self::default()
        }
    }

    pub fn generated(content: MediaContent) -> Self {
        Self {
            content: Some(Some(content)),
            is_generated: Some(true),
            error: Some(None),
            ..Self::clear_in_flight()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(Some(message.into())),
            ..Self::clear_in_flight()
        }
    }

    pub fn items(items: Vec<CollectionItem>) -> Self {
        Self {
            items: Some(items),
            ..Self::default()
        }
    }

    pub fn clear_error() -> Self {
        Self {
            error: Some(None),
            ..Self::default()
        }
    }

    /// Drops generated output so the node becomes a candidate again.
    pub fn reset_content() -> Self {
        Self {
            content: Some(None),
            is_generated: Some(false),
            error: Some(None),
            ..Self::clear_in_flight()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub(crate) fn apply(self, node: &mut Node) {
        if let Some(content) = self.content {
            node.content = content;
        }
        if let Some(items) = self.items {
            node.items = items;
        }
        if let Some(instructions) = self.instructions {
            node.instructions = instructions;
        }
        if let Some(in_flight) = self.in_flight {
            node.in_flight = in_flight;
        }
        if let Some(since) = self.in_flight_since {
            node.in_flight_since = since;
        }
        if let Some(error) = self.error {
            node.error = error;
        }
        if let Some(is_generated) = self.is_generated {
            node.is_generated = is_generated;
        }
        if let Some(attributes) = self.attributes {
            node.attributes = attributes;
        }
    }
}
