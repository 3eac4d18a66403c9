//! Wire format of the data channel
//!
//! One JSON object per frame:
//!
//! ```json
//! {"type":"node-operation","operation":{"kind":"add","node":{...}},
//!  "flowchartKey":"<64 hex>","source":"<peer>","target":null,"timestamp":1700000000000}
//! ```
//!
//! Type-specific fields sit next to the envelope fields; names are camelCase.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    now_millis, CursorPosition, Edge, EdgeOperation, FlowchartKey, FlowchartProperties,
    FlowchartSnapshot, Node, NodeOperation, PeerId, UserInfo,
};

/// `type` tags that may travel without a flowchart key
pub(crate) const PRESENCE_TYPES: [&str; 2] = ["user-info", "cursor-position"];

pub(crate) const ACTIVE_FLOWCHART: &str = "active-flowchart";
pub(crate) const FLOWCHART_DATA: &str = "flowchart-data";

/// Application messages exchanged once a channel is open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CollabMessage {
    /// Display name and color of the sender
    #[serde(rename_all = "camelCase")]
    UserInfo { display_name: String, color: String },
    /// Ephemeral pointer location, never persisted
    CursorPosition { x: f64, y: f64 },
    /// "I am working on the flowchart in `flowchartKey`"
    ActiveFlowchart {
        /// Sender created the flowchart (as opposed to joining it)
        #[serde(default)]
        creator: bool,
    },
    /// Ask for a full snapshot of the flowchart in `flowchartKey`
    RequestFlowchart,
    /// Full snapshot, only ever sent in reply to a request
    FlowchartData {
        #[serde(default)]
        properties: FlowchartProperties,
        nodes: Vec<Node>,
        edges: Vec<Edge>,
    },
    /// Opaque partial payload for the state sink
    FlowchartUpdate { payload: Value },
    NodeOperation { operation: NodeOperation },
    EdgeOperation { operation: EdgeOperation },
}

impl CollabMessage {
    pub fn user_info(user: &UserInfo) -> Self {
        CollabMessage::UserInfo {
            display_name: user.display_name.clone(),
            color: user.color.clone(),
        }
    }

    pub fn cursor(position: CursorPosition) -> Self {
        CollabMessage::CursorPosition {
            x: position.x,
            y: position.y,
        }
    }

    pub fn flowchart_data(snapshot: FlowchartSnapshot) -> Self {
        CollabMessage::FlowchartData {
            properties: snapshot.properties,
            nodes: snapshot.nodes,
            edges: snapshot.edges,
        }
    }

    /// The wire `type` tag
    pub fn type_name(&self) -> &'static str {
        match self {
            CollabMessage::UserInfo { .. } => "user-info",
            CollabMessage::CursorPosition { .. } => "cursor-position",
            CollabMessage::ActiveFlowchart { .. } => ACTIVE_FLOWCHART,
            CollabMessage::RequestFlowchart => "request-flowchart",
            CollabMessage::FlowchartData { .. } => FLOWCHART_DATA,
            CollabMessage::FlowchartUpdate { .. } => "flowchart-update",
            CollabMessage::NodeOperation { .. } => "node-operation",
            CollabMessage::EdgeOperation { .. } => "edge-operation",
        }
    }
}

/// A message plus routing metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(flatten)]
    pub message: CollabMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flowchart_key: Option<FlowchartKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Random id of a node or edge operation, kept on relayed copies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_id: Option<u64>,
}

impl Envelope {
    /// Wrap `message`, stamped with the current time
    pub fn new(message: CollabMessage, flowchart_key: Option<FlowchartKey>, source: PeerId) -> Self {
        Self {
            message,
            flowchart_key,
            source: Some(source),
            target: None,
            timestamp: Some(now_millis()),
            op_id: None,
        }
    }

    /// Stamp a fresh operation id, small enough to survive a JSON double
    pub fn with_op_id(mut self) -> Self {
        self.op_id = Some(rand::random::<u64>() >> 11);
        self
    }

    /// Address the envelope to one peer
    pub fn to(mut self, target: PeerId) -> Self {
        self.target = Some(target);
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
