/// Core flow definition types
///
/// Defines the node/edge graph stored for every flow. Definitions arrive as
/// React Flow exports (`{"reactflow": {"nodes": [...], "edges": [...]}}`) and
/// are parsed once per run attempt into the flattened structures below.

use crate::workflow::value::ValueExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Node types that can start a run
pub const TRIGGER_TYPES: [&str; 4] = ["cron", "webhook", "httpTrigger", "trigger"];

/// Errors raised while turning stored flow JSON into a definition
#[derive(Debug, thiserror::Error)]
pub enum PlanningError {
    /// The stored text is not valid JSON or does not match the node/edge shape
    #[error("malformed flow definition: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Valid JSON, but not an object carrying a graph
    #[error("malformed flow definition: {0}")]
    InvalidShape(String),
}

/// A complete flow definition: ordered nodes plus the edges between them
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// Nodes in editor order (the array index is the final planning tie-break)
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
    /// Directed connections between nodes
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
}

impl FlowDefinition {
    /// Parse a stored definition
    ///
    /// Accepts both the wrapped `{"reactflow": {...}}` document and a bare
    /// `{"nodes": [...], "edges": [...]}` object. Missing arrays are empty.
    pub fn parse(raw: &str) -> Result<Self, PlanningError> {
        let document: Value = serde_json::from_str(raw)?;
        let graph = match document {
            Value::Object(mut map) => match map.remove("reactflow") {
                Some(inner @ Value::Object(_)) => inner,
                Some(Value::Null) | None => Value::Object(map),
                Some(other) => {
                    return Err(PlanningError::InvalidShape(format!(
                        "expected 'reactflow' to be an object, found {}",
                        json_kind(&other)
                    )))
                }
            },
            other => {
                return Err(PlanningError::InvalidShape(format!(
                    "expected an object, found {}",
                    json_kind(&other)
                )))
            }
        };

        Ok(serde_json::from_value(graph)?)
    }

    /// Look up a node by id (first occurrence wins)
    pub fn node(&self, node_id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|node| node.id == node_id)
    }

    /// First cron node's `expression`, if the flow has one
    pub fn cron_expression(&self) -> Option<&str> {
        self.nodes
            .iter()
            .find(|node| node.node_type == "cron")
            .and_then(|node| node.config.str_at("expression"))
            .map(str::trim)
    }
}

/// Canvas position of a node, used to order ties the way the editor shows them
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
}

/// A single node in the flow graph
///
/// The wire format nests type-specific fields under `data`; this struct
/// flattens them. `node_type` is the effective type used for dispatch:
/// `data.nodeType` when present, otherwise the React Flow `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "WireNode", into = "WireNode")]
pub struct FlowNode {
    /// Unique node identifier within the flow
    pub id: String,
    /// React Flow renderer type (e.g. "custom", "cron")
    pub kind_hint: String,
    /// Effective node type driving execution (e.g. "httpRequest", "if")
    pub node_type: String,
    /// Human-readable label shown in the editor
    pub label: String,
    /// Canvas position
    pub position: Position,
    /// Node-specific configuration (always an object)
    pub config: Value,
}

impl FlowNode {
    /// Execution category of this node
    pub fn kind(&self) -> NodeKind {
        NodeKind::classify(&self.node_type)
    }

    /// Whether this node is one of the run-starting trigger types
    pub fn is_trigger(&self) -> bool {
        TRIGGER_TYPES.contains(&self.node_type.as_str())
    }

    /// `continueOnFail` from config, as a boolean or truthy string
    pub fn continue_on_fail(&self) -> bool {
        self.config.bool_flag("continueOnFail")
    }

    /// Display name used for the node's step record
    pub fn display_name(&self) -> String {
        if !self.label.trim().is_empty() {
            self.label.clone()
        } else if !self.node_type.is_empty() {
            self.node_type.clone()
        } else {
            self.id.clone()
        }
    }
}

/// Execution category derived from a node's declared type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// `cron`, `webhook`, `httpTrigger`, `trigger`
    Trigger,
    /// `errorTrigger`: passes its input through
    ErrorTrigger,
    /// Conditional branch driven by the condition evaluator
    If,
    /// Fan-in node gated on all predecessors
    Merge,
    /// Generic outbound HTTP call
    HttpRequest,
    /// Credentialed connector call (`gmail`, `gsheets`, `github`, `app`, AI models)
    Integration,
    /// Anything else: simulated success
    Unknown,
}

impl NodeKind {
    /// Classify a declared node type
    pub fn classify(node_type: &str) -> Self {
        match node_type {
            t if TRIGGER_TYPES.contains(&t) => NodeKind::Trigger,
            "errorTrigger" => NodeKind::ErrorTrigger,
            "if" => NodeKind::If,
            "merge" => NodeKind::Merge,
            "httpRequest" => NodeKind::HttpRequest,
            "gmail" | "gsheets" | "github" | "app" | "aiAgent" => NodeKind::Integration,
            t if is_chat_model(t) => NodeKind::Integration,
            _ => NodeKind::Unknown,
        }
    }
}

/// Provider-specific chat node types
pub const CHAT_MODEL_TYPES: [&str; 3] = ["chatModel", "openaiChat", "geminiChat"];

/// Chat-model family: `chatModel`, `openaiChat`, `geminiChat`, `*ChatModel`
pub fn is_chat_model(node_type: &str) -> bool {
    CHAT_MODEL_TYPES
        .iter()
        .any(|t| t.eq_ignore_ascii_case(node_type))
        || node_type.to_ascii_lowercase().ends_with("chatmodel")
}

/// Directed connection between two nodes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEdge {
    #[serde(default)]
    pub id: String,
    pub source: String,
    pub target: String,
    /// Output handle on the source node ("true"/"false" on `if` nodes)
    #[serde(default)]
    pub source_handle: Option<String>,
    #[serde(default)]
    pub target_handle: Option<String>,
}

impl FlowEdge {
    /// Source handle with `None` normalized to an empty string
    pub fn handle(&self) -> &str {
        self.source_handle.as_deref().unwrap_or("").trim()
    }
}

/// Stored flow row as seen by the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub id: String,
    pub name: String,
    /// Archived flows are never scheduled
    pub archived: bool,
    /// Raw definition JSON
    pub definition: String,
}

// Wire format ---------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireNodeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    node_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(default)]
    config: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireNode {
    id: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    position: Position,
    #[serde(default)]
    data: WireNodeData,
}

impl From<WireNode> for FlowNode {
    fn from(wire: WireNode) -> Self {
        let kind_hint = wire.kind.unwrap_or_default();
        let node_type = wire
            .data
            .node_type
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| kind_hint.clone());
        let config = match wire.data.config {
            Value::Object(map) => Value::Object(map),
            _ => Value::Object(Map::new()),
        };

        Self {
            id: wire.id,
            kind_hint,
            node_type,
            label: wire.data.label.unwrap_or_default(),
            position: wire.position,
            config,
        }
    }
}

impl From<FlowNode> for WireNode {
    fn from(node: FlowNode) -> Self {
        Self {
            id: node.id,
            kind: Some(node.kind_hint),
            position: node.position,
            data: WireNodeData {
                node_type: Some(node.node_type),
                label: Some(node.label),
                config: node.config,
            },
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLOW: &str = r#"{
        "reactflow": {
            "nodes": [
                {"id": "n1", "type": "cron", "position": {"x": 10, "y": 20},
                 "data": {"label": "Every minute", "config": {"expression": "* * * * *"}}},
                {"id": "n2", "type": "custom", "position": {"x": 200.5, "y": 20},
                 "data": {"nodeType": "httpRequest", "label": "Fetch", "config": {"url": "https://example.com", "continueOnFail": "true"}}}
            ],
            "edges": [
                {"id": "e1", "source": "n1", "target": "n2", "sourceHandle": null, "targetHandle": null}
            ]
        }
    }"#;

    #[test]
    fn test_parse_wrapped_definition() {
        let flow = FlowDefinition::parse(FLOW).unwrap();
        assert_eq!(flow.nodes.len(), 2);
        assert_eq!(flow.edges.len(), 1);

        let cron = &flow.nodes[0];
        assert_eq!(cron.node_type, "cron");
        assert!(cron.is_trigger());
        assert_eq!(cron.kind(), NodeKind::Trigger);

        let http = &flow.nodes[1];
        assert_eq!(http.node_type, "httpRequest");
        assert_eq!(http.kind_hint, "custom");
        assert_eq!(http.position.x, 200.5);
        assert!(http.continue_on_fail());
        assert_eq!(flow.edges[0].handle(), "");
        assert_eq!(flow.cron_expression(), Some("* * * * *"));
    }

    #[test]
    fn test_parse_bare_definition_and_missing_arrays() {
        let flow = FlowDefinition::parse(r#"{"nodes": [{"id": "a", "type": "if"}]}"#).unwrap();
        assert_eq!(flow.nodes.len(), 1);
        assert!(flow.edges.is_empty());
        assert_eq!(flow.nodes[0].kind(), NodeKind::If);
        assert!(flow.nodes[0].config.is_object());

        let empty = FlowDefinition::parse("{}").unwrap();
        assert!(empty.nodes.is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        assert!(matches!(
            FlowDefinition::parse("{not json"),
            Err(PlanningError::Malformed(_))
        ));
        assert!(matches!(
            FlowDefinition::parse("[1, 2]"),
            Err(PlanningError::InvalidShape(_))
        ));
        assert!(matches!(
            FlowDefinition::parse(r#"{"reactflow": {"nodes": "nope"}}"#),
            Err(PlanningError::Malformed(_))
        ));
    }

    #[test]
    fn test_node_kind_classification() {
        assert_eq!(NodeKind::classify("webhook"), NodeKind::Trigger);
        assert_eq!(NodeKind::classify("errorTrigger"), NodeKind::ErrorTrigger);
        assert_eq!(NodeKind::classify("merge"), NodeKind::Merge);
        assert_eq!(NodeKind::classify("gmail"), NodeKind::Integration);
        assert_eq!(NodeKind::classify("openaiChat"), NodeKind::Integration);
        assert_eq!(NodeKind::classify("lmChatModel"), NodeKind::Integration);
        assert_eq!(NodeKind::classify("slackchat"), NodeKind::Unknown);
        assert_eq!(NodeKind::classify("groupChat"), NodeKind::Unknown);
        assert_eq!(NodeKind::classify("stickyNote"), NodeKind::Unknown);
    }

    #[test]
    fn test_round_trip_keeps_wire_shape() {
        let flow = FlowDefinition::parse(FLOW).unwrap();
        let encoded = serde_json::to_value(&flow).unwrap();
        assert_eq!(encoded["nodes"][1]["data"]["nodeType"], "httpRequest");
        assert_eq!(encoded["nodes"][1]["type"], "custom");
    }
}
