//! Flowchart document types: nodes, edges, snapshots and incremental operations

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 2D canvas position
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A flowchart node
///
/// Fields the editor attaches that the core does not interpret (size,
/// selection, styling) are carried in `extra` so they survive replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node id
    pub id: String,
    /// Node kind as understood by the editor ("process", "decision", ...)
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub position: Position,
    /// Opaque editor payload (label, colors, ...)
    #[serde(default)]
    pub data: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Node {
    /// Create a node with empty data
    pub fn new(id: impl Into<String>, kind: impl Into<String>, position: Position) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            position,
            data: Value::Null,
            extra: Map::new(),
        }
    }

    /// Set the node payload
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub(crate) fn apply_patch(&mut self, patch: &NodePatch) {
        if let Some(kind) = &patch.kind {
            self.kind = kind.clone();
        }
        if let Some(position) = patch.position {
            self.position = position;
        }
        if let Some(data) = &patch.data {
            self.data = data.clone();
        }
    }
}

/// A directed edge between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Unique edge id
    pub id: String,
    /// Source node id
    pub source: String,
    /// Target node id
    pub target: String,
    #[serde(default)]
    pub data: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Edge {
    /// Create an edge with empty data
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            data: Value::Null,
            extra: Map::new(),
        }
    }

    /// Set the edge payload
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// The edge as it would look after applying `patch`
    pub(crate) fn patched(&self, patch: &EdgePatch) -> Edge {
        let mut edge = self.clone();
        if let Some(source) = &patch.source {
            edge.source = source.clone();
        }
        if let Some(target) = &patch.target {
            edge.target = target.clone();
        }
        if let Some(data) = &patch.data {
            edge.data = data.clone();
        }
        edge
    }
}

/// Flowchart-level metadata
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FlowchartProperties {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

impl FlowchartProperties {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Full point-in-time copy of a flowchart
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FlowchartSnapshot {
    #[serde(default)]
    pub properties: FlowchartProperties,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl FlowchartSnapshot {
    /// Whether every edge references existing nodes
    pub fn is_edge_consistent(&self) -> bool {
        self.edges.iter().all(|e| {
            self.nodes.iter().any(|n| n.id == e.source) && self.nodes.iter().any(|n| n.id == e.target)
        })
    }
}

/// Partial node update; absent fields are left unchanged
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodePatch {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Partial edge update; absent fields are left unchanged
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EdgePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Single node add / update / delete
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NodeOperation {
    /// Insert a node, replacing any node with the same id
    Add { node: Node },
    /// Patch the node with this id, if present
    Update { id: String, changes: NodePatch },
    /// Remove the node with this id, if present
    Delete { id: String },
}

impl NodeOperation {
    /// Id of the node this operation targets
    pub fn id(&self) -> &str {
        match self {
            NodeOperation::Add { node } => &node.id,
            NodeOperation::Update { id, .. } => id,
            NodeOperation::Delete { id } => id,
        }
    }
}

/// Single edge add / update / delete
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EdgeOperation {
    /// Insert an edge, replacing any edge with the same id
    Add { edge: Edge },
    /// Patch the edge with this id, if present
    Update { id: String, changes: EdgePatch },
    /// Remove the edge with this id, if present
    Delete { id: String },
}

impl EdgeOperation {
    /// Id of the edge this operation targets
    pub fn id(&self) -> &str {
        match self {
            EdgeOperation::Add { edge } => &edge.id,
            EdgeOperation::Update { id, .. } => id,
            EdgeOperation::Delete { id } => id,
        }
    }
}
