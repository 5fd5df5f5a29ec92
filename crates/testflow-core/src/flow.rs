//! Flow graph model: nodes, edges, and per-kind step configuration.
//!
//! A flow is pure data. Each node carries a [`Step`], a closed tagged variant
//! whose payload is the configuration for that node kind. Edges mean "target
//! depends on source having completed".

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{FlowError, Result};
use crate::types::{ExecutionStatus, TestRun};

/// A named graph of test steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub nodes: Vec<Node>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub edges: Vec<Edge>,
}

/// Go encodes a nil slice as `null`.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Flow {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            tags: vec![],
            nodes: vec![],
            edges: vec![],
        }
    }

    /// Append a node.
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Append a dependency edge `source -> target`.
    pub fn with_edge(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        let edge = Edge::new(source, target).with_id(format!("e{}", self.edges.len() + 1));
        self.edges.push(edge);
        self
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Check node identities are unique and every edge references existing nodes.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(FlowError::InvalidFlow("node with empty id".into()));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(FlowError::InvalidFlow(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }
        for edge in &self.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !seen.contains(endpoint.as_str()) {
                    return Err(FlowError::InvalidFlow(format!(
                        "edge '{}' references unknown node '{}'",
                        edge.id, endpoint
                    )));
                }
            }
        }
        Ok(())
    }

    /// Remove a node together with every edge touching it.
    /// Returns the removed node, if it existed.
    pub fn remove_node(&mut self, id: &str) -> Option<Node> {
        let pos = self.nodes.iter().position(|n| n.id == id)?;
        self.edges.retain(|e| e.source != id && e.target != id);
        Some(self.nodes.remove(pos))
    }

    /// Copy a run's per-node results onto the nodes' last-run fields.
    pub fn apply_run(&mut self, run: &TestRun) {
        for node in &mut self.nodes {
            match run.node_results.get(&node.id) {
                Some(result) => {
                    node.status = result.status;
                    node.output = result.output.clone();
                    node.error = result.error.clone();
                }
                None => {
                    node.status = ExecutionStatus::Pending;
                    node.output = None;
                    node.error = None;
                }
            }
        }
    }
}

/// One typed test step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct Node {
    pub id: String,
    pub label: String,
    pub step: Step,
    /// Last-run status, `Pending` before the first run.
    pub status: ExecutionStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Canvas coordinates from the editor, carried through unchanged.
    pub position: Option<Position>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Node {
    pub fn new(id: impl Into<String>, label: impl Into<String>, step: Step) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            step,
            status: ExecutionStatus::Pending,
            output: None,
            error: None,
            position: None,
        }
    }

    pub fn kind(&self) -> &str {
        self.step.kind()
    }
}

/// Node kind with its configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Api(ApiConfig),
    Verification(VerificationConfig),
    Mock(MockConfig),
    Report(ReportConfig),
    EventTrigger(EventTriggerConfig),
    /// A kind this engine does not know. The flow still loads; the node fails.
    Unsupported {
        kind: String,
        config: serde_json::Value,
    },
}

impl Step {
    pub fn kind(&self) -> &str {
        match self {
            Self::Api(_) => "api",
            Self::Verification(_) => "verification",
            Self::Mock(_) => "mock",
            Self::Report(_) => "report",
            Self::EventTrigger(_) => "event_trigger",
            Self::Unsupported { kind, .. } => kind,
        }
    }

    fn from_parts(kind: String, config: serde_json::Value) -> std::result::Result<Self, String> {
        // Editors send `null` for an untouched config panel.
        let config = if config.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            config
        };
        let parsed = match kind.as_str() {
            "api" => serde_json::from_value(config).map(Self::Api),
            "verification" => serde_json::from_value(config).map(Self::Verification),
            "mock" => serde_json::from_value(config).map(Self::Mock),
            "report" => serde_json::from_value(config).map(Self::Report),
            "event_trigger" => serde_json::from_value(config).map(Self::EventTrigger),
            _ => return Ok(Self::Unsupported { kind, config }),
        };
        parsed.map_err(|e| format!("invalid {} config: {}", kind, e))
    }

    fn config_value(&self) -> serde_json::Value {
        let value = match self {
            Self::Api(c) => serde_json::to_value(c),
            Self::Verification(c) => serde_json::to_value(c),
            Self::Mock(c) => serde_json::to_value(c),
            Self::Report(c) => serde_json::to_value(c),
            Self::EventTrigger(c) => serde_json::to_value(c),
            Self::Unsupported { config, .. } => Ok(config.clone()),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}

/// Wire form of a node.
///
/// Written flat. Also read in the editor's envelope, where the top-level
/// `type` names the canvas renderer and the step itself sits under `data`.
#[derive(Serialize, Deserialize)]
struct RawNode {
    id: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    config: serde_json::Value,
    #[serde(default)]
    status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    position: Option<Position>,
    #[serde(default, skip_serializing)]
    data: Option<NodeData>,
}

/// The editor's `data` payload of a node.
#[derive(Deserialize)]
struct NodeData {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    config: serde_json::Value,
    #[serde(default)]
    status: Option<ExecutionStatus>,
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

impl RawNode {
    /// Lift an editor envelope into the flat form. Flat fields win when both
    /// are set.
    fn flatten(mut self) -> Self {
        let Some(data) = self.data.take() else {
            return self;
        };
        if !data.kind.is_empty() {
            self.kind = data.kind;
        }
        if self.label.is_empty() {
            self.label = data.label;
        }
        if self.config.is_null() {
            self.config = data.config;
        }
        if let Some(status) = data.status {
            if self.status == ExecutionStatus::Pending {
                self.status = status;
            }
        }
        self.output = self.output.or(data.output);
        self.error = self.error.or(data.error.filter(|e| !e.is_empty()));
        self
    }
}

impl TryFrom<RawNode> for Node {
    type Error = String;

    fn try_from(raw: RawNode) -> std::result::Result<Self, Self::Error> {
        let raw = raw.flatten();
        let step = Step::from_parts(raw.kind, raw.config)
            .map_err(|e| format!("node '{}': {}", raw.id, e))?;
        Ok(Self {
            id: raw.id,
            label: raw.label,
            step,
            status: raw.status,
            output: raw.output,
            error: raw.error,
            position: raw.position,
        })
    }
}

impl From<Node> for RawNode {
    fn from(node: Node) -> Self {
        Self {
            kind: node.step.kind().to_string(),
            config: node.step.config_value(),
            id: node.id,
            label: node.label,
            status: node.status,
            output: node.output,
            error: node.error,
            position: node.position,
            data: None,
        }
    }
}

/// API step: one outbound HTTP request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl ApiConfig {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Mock step: canned response after an optional delay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockConfig {
    #[serde(default, alias = "mockResponse", skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    #[serde(default, alias = "mockDelay")]
    pub delay_ms: u64,
}

impl MockConfig {
    pub fn responding(response: serde_json::Value) -> Self {
        Self {
            response: Some(response),
            delay_ms: 0,
        }
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }
}

/// Comparison strategy of a verification step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssertionType {
    #[default]
    Equals,
    Contains,
    Regex,
    Custom,
}

/// Verification step: assert on an earlier node's output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<serde_json::Value>,
    #[serde(default)]
    pub assertion_type: AssertionType,
    /// Upstream node whose output is checked. Defaults to the most recent capture.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// JSON pointer into the source output, e.g. `/body/id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Expression for `custom` assertions.
    #[serde(default, alias = "customScript", skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

impl VerificationConfig {
    pub fn new(assertion_type: AssertionType, expected: serde_json::Value) -> Self {
        Self {
            expected: Some(expected),
            assertion_type,
            ..Default::default()
        }
    }

    pub fn equals(expected: serde_json::Value) -> Self {
        Self::new(AssertionType::Equals, expected)
    }

    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn at_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTriggerConfig {
    #[serde(default, alias = "triggerEvent", skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    #[serde(default, alias = "triggerCondition", skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// A dependency: `target` requires `source` to have completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    #[serde(default)]
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{}->{}", source, target),
            source,
            target,
            source_handle: None,
            target_handle: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}
