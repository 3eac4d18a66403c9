//! In-memory flowchart document
//!
//! `FlowchartDoc` holds the nodes and edges of one flowchart and applies
//! snapshots and single operations to them. It does no I/O and no locking;
//! [`ReplicationState`](super::ReplicationState) wraps it for shared use.

use std::collections::HashSet;

use crate::types::{
    now_millis, Edge, EdgeOperation, FlowchartProperties, FlowchartSnapshot, LocalFlowchartId,
    Node, NodeOperation,
};

/// Result of applying one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    /// The document changed
    Applied,
    /// Nothing to do (missing id, or identical redelivery)
    NoOp,
    /// Refused: the edge would reference a node that does not exist
    Rejected,
}

impl OpOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, OpOutcome::Applied)
    }
}

/// Nodes, edges and properties of one flowchart
///
/// Node and edge ids are unique. Insertion order is kept so snapshots list
/// items the way the editor created them.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowchartDoc {
    flowchart_id: LocalFlowchartId,
    properties: FlowchartProperties,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    updated_at: i64,
}

impl FlowchartDoc {
    /// Create an empty document
    pub fn new(flowchart_id: LocalFlowchartId) -> Self {
        let properties = FlowchartProperties::new(flowchart_id.as_str(), "");
        Self {
            flowchart_id,
            properties,
            nodes: Vec::new(),
            edges: Vec::new(),
            updated_at: now_millis(),
        }
    }

    /// Create a document holding `snapshot`
    pub fn from_snapshot(flowchart_id: LocalFlowchartId, snapshot: FlowchartSnapshot) -> Self {
        let mut doc = Self::new(flowchart_id);
        doc.apply_snapshot(snapshot);
        doc
    }

    pub fn flowchart_id(&self) -> &LocalFlowchartId {
        &self.flowchart_id
    }

    pub fn properties(&self) -> &FlowchartProperties {
        &self.properties
    }

    /// Wall-clock time of the last mutation (unix ms)
    pub fn updated_at(&self) -> i64 {
        self.updated_at
    }

    /// All stored nodes
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// All stored edges, including ones whose endpoints were since deleted
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.iter().find(|e| e.id == id)
    }

    fn has_node(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n.id == id)
    }

    fn touch(&mut self) {
        self.updated_at = now_millis();
    }

    /// Rename the flowchart
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.properties.name = name.into();
        self.touch();
    }

    /// Rebind the document to another local id, clearing its contents
    pub fn reset(&mut self, flowchart_id: LocalFlowchartId) {
        *self = Self::new(flowchart_id);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Snapshots
    // ═══════════════════════════════════════════════════════════════════════

    /// Replace the whole document.
    ///
    /// Duplicate ids keep the last occurrence. Edges whose endpoints are not
    /// in the snapshot are dropped. Returns the number of dropped edges.
    pub fn apply_snapshot(&mut self, snapshot: FlowchartSnapshot) -> usize {
        let FlowchartSnapshot {
            properties,
            nodes,
            edges,
        } = snapshot;

        let mut next_nodes: Vec<Node> = Vec::with_capacity(nodes.len());
        for node in nodes {
            upsert_node(&mut next_nodes, node);
        }

        let node_ids: HashSet<&str> = next_nodes.iter().map(|n| n.id.as_str()).collect();
        let mut next_edges: Vec<Edge> = Vec::with_capacity(edges.len());
        let mut dropped = 0;
        for edge in edges {
            if node_ids.contains(edge.source.as_str()) && node_ids.contains(edge.target.as_str()) {
                upsert_edge(&mut next_edges, edge);
            } else {
                dropped += 1;
            }
        }

        self.properties = properties;
        self.nodes = next_nodes;
        self.edges = next_edges;
        self.touch();
        dropped
    }

    /// Edge-consistent copy of the document.
    ///
    /// Edges pointing at deleted nodes stay stored but are left out here.
    pub fn snapshot(&self) -> FlowchartSnapshot {
        let node_ids: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        FlowchartSnapshot {
            properties: self.properties.clone(),
            nodes: self.nodes.clone(),
            edges: self
                .edges
                .iter()
                .filter(|e| {
                    node_ids.contains(e.source.as_str()) && node_ids.contains(e.target.as_str())
                })
                .cloned()
                .collect(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Apply a single node operation by id
    pub fn apply_node_op(&mut self, op: &NodeOperation) -> OpOutcome {
        let outcome = match op {
            NodeOperation::Add { node } => {
                if self.node(&node.id) == Some(node) {
                    OpOutcome::NoOp
                } else {
                    upsert_node(&mut self.nodes, node.clone());
                    OpOutcome::Applied
                }
            }
            NodeOperation::Update { id, changes } => {
                match self.nodes.iter_mut().find(|n| &n.id == id) {
                    Some(node) => {
                        let before = node.clone();
                        node.apply_patch(changes);
                        if *node == before {
                            OpOutcome::NoOp
                        } else {
                            OpOutcome::Applied
                        }
                    }
                    None => OpOutcome::NoOp,
                }
            }
            NodeOperation::Delete { id } => {
                let before = self.nodes.len();
                self.nodes.retain(|n| &n.id != id);
                if self.nodes.len() < before {
                    OpOutcome::Applied
                } else {
                    OpOutcome::NoOp
                }
            }
        };

        if outcome.is_applied() {
            self.touch();
        }
        outcome
    }

    /// Apply a single edge operation by id
    pub fn apply_edge_op(&mut self, op: &EdgeOperation) -> OpOutcome {
        let outcome = match op {
            EdgeOperation::Add { edge } => {
                if !self.has_node(&edge.source) || !self.has_node(&edge.target) {
                    OpOutcome::Rejected
                } else if self.edge(&edge.id) == Some(edge) {
                    OpOutcome::NoOp
                } else {
                    upsert_edge(&mut self.edges, edge.clone());
                    OpOutcome::Applied
                }
            }
            EdgeOperation::Update { id, changes } => {
                let Some(current) = self.edge(id) else {
                    return OpOutcome::NoOp;
                };
                let patched = current.patched(changes);
                let unchanged = &patched == current;
                if !self.has_node(&patched.source) || !self.has_node(&patched.target) {
                    OpOutcome::Rejected
                } else if unchanged {
                    OpOutcome::NoOp
                } else {
                    upsert_edge(&mut self.edges, patched);
                    OpOutcome::Applied
                }
            }
            EdgeOperation::Delete { id } => {
                let before = self.edges.len();
                self.edges.retain(|e| &e.id != id);
                if self.edges.len() < before {
                    OpOutcome::Applied
                } else {
                    OpOutcome::NoOp
                }
            }
        };

        if outcome.is_applied() {
            self.touch();
        }
        outcome
    }
}

fn upsert_node(nodes: &mut Vec<Node>, node: Node) {
    match nodes.iter_mut().find(|n| n.id == node.id) {
        Some(existing) => *existing = node,
        None => nodes.push(node),
    }
}

fn upsert_edge(edges: &mut Vec<Edge>, edge: Edge) {
    match edges.iter_mut().find(|e| e.id == edge.id) {
        Some(existing) => *existing = edge,
        None => edges.push(edge),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::flowchart::{EdgePatch, NodePatch};
    use crate::types::Position;
    use serde_json::json;

    fn node(id: &str) -> Node {
        Node::new(id, "process", Position::default())
    }

    fn doc_with(nodes: &[&str]) -> FlowchartDoc {
        let mut doc = FlowchartDoc::new("fc1".into());
        for id in nodes {
            doc.apply_node_op(&NodeOperation::Add { node: node(id) });
        }
        doc
    }

    #[test]
    fn test_snapshot_drops_dangling_edges_on_apply() {
        let mut doc = FlowchartDoc::new("fc1".into());
        let dropped = doc.apply_snapshot(FlowchartSnapshot {
            properties: FlowchartProperties::new("fc1", "Plan"),
            nodes: vec![node("a"), node("b")],
            edges: vec![Edge::new("e1", "a", "b"), Edge::new("e2", "a", "ghost")],
        });
        assert_eq!(dropped, 1);
        assert_eq!(doc.edges().len(), 1);
        assert_eq!(doc.properties().name, "Plan");
    }

    #[test]
    fn test_snapshot_round_trip_into_fresh_doc() {
        let mut doc = doc_with(&["a", "b"]);
        doc.apply_edge_op(&EdgeOperation::Add {
            edge: Edge::new("e1", "a", "b").with_data(json!({"label": "yes"})),
        });

        let copy = FlowchartDoc::from_snapshot("other".into(), doc.snapshot());
        assert_eq!(copy.snapshot(), doc.snapshot());
    }

    #[test]
    fn test_add_existing_id_replaces() {
        let mut doc = doc_with(&["a"]);
        let moved = Node::new("a", "decision", Position::new(4.0, 2.0));
        assert_eq!(
            doc.apply_node_op(&NodeOperation::Add { node: moved.clone() }),
            OpOutcome::Applied
        );
        assert_eq!(doc.nodes(), &[moved.clone()]);
        assert_eq!(
            doc.apply_node_op(&NodeOperation::Add { node: moved }),
            OpOutcome::NoOp
        );
    }

    #[test]
    fn test_update_and_delete_missing_id_are_noops() {
        let mut doc = doc_with(&["a"]);
        let before = doc.snapshot();

        let update = NodeOperation::Update {
            id: "missing".into(),
            changes: NodePatch {
                kind: Some("decision".into()),
                ..Default::default()
            },
        };
        assert_eq!(doc.apply_node_op(&update), OpOutcome::NoOp);
        assert_eq!(
            doc.apply_node_op(&NodeOperation::Delete { id: "missing".into() }),
            OpOutcome::NoOp
        );
        assert_eq!(doc.snapshot(), before);
    }

    #[test]
    fn test_double_delete_is_noop() {
        let mut doc = doc_with(&["x", "y"]);
        let op = NodeOperation::Delete { id: "x".into() };
        assert_eq!(doc.apply_node_op(&op), OpOutcome::Applied);
        let after_first = doc.snapshot();
        assert_eq!(doc.apply_node_op(&op), OpOutcome::NoOp);
        assert_eq!(doc.snapshot(), after_first);
    }

    #[test]
    fn test_edge_add_requires_endpoints() {
        let mut doc = doc_with(&["a"]);
        assert_eq!(
            doc.apply_edge_op(&EdgeOperation::Add {
                edge: Edge::new("e1", "a", "b")
            }),
            OpOutcome::Rejected
        );
        assert!(doc.edges().is_empty());
    }

    #[test]
    fn test_edge_update_to_missing_target_is_rejected() {
        let mut doc = doc_with(&["a", "b"]);
        doc.apply_edge_op(&EdgeOperation::Add {
            edge: Edge::new("e1", "a", "b"),
        });
        let op = EdgeOperation::Update {
            id: "e1".into(),
            changes: EdgePatch {
                target: Some("ghost".into()),
                ..Default::default()
            },
        };
        assert_eq!(doc.apply_edge_op(&op), OpOutcome::Rejected);
        assert_eq!(doc.edge("e1").unwrap().target, "b");
    }

    #[test]
    fn test_deleted_node_hides_edge_from_snapshot() {
        let mut doc = doc_with(&["a", "b"]);
        doc.apply_edge_op(&EdgeOperation::Add {
            edge: Edge::new("e1", "a", "b"),
        });
        doc.apply_node_op(&NodeOperation::Delete { id: "b".into() });

        assert_eq!(doc.edges().len(), 1);
        let snapshot = doc.snapshot();
        assert!(snapshot.edges.is_empty());
        assert!(snapshot.is_edge_consistent());
    }

    #[test]
    fn test_mutation_stamps_updated_at() {
        let mut doc = doc_with(&[]);
        doc.updated_at = 0;
        doc.apply_node_op(&NodeOperation::Add { node: node("a") });
        assert!(doc.updated_at() > 0);

        doc.updated_at = 0;
        doc.apply_node_op(&NodeOperation::Delete { id: "nope".into() });
        assert_eq!(doc.updated_at(), 0);
    }
}
