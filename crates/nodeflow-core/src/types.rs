use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{NodeflowError, Result};
use crate::variables::VariableStore;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a single node visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Success,
    Error,
    /// Only produced under `UpstreamFailurePolicy::Skip`.
    Skipped,
}

/// Lifecycle of a flow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Error,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A declared handler input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl InputSpec {
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            description: description.into(),
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            description: description.into(),
            default: None,
        }
    }

    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// A declared handler output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl OutputSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// A resolved input as handed to a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    Value(serde_json::Value),
    /// The input is bound to an upstream output that was never written.
    Unavailable { source: String, output: String },
}

/// Resolved inputs for one handler invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInputs {
    values: BTreeMap<String, InputValue>,
}

impl NodeInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: InputValue) {
        self.values.insert(name.into(), value);
    }

    /// Builder form of `insert` for a plain value.
    pub fn with(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.insert(name, InputValue::Value(value));
        self
    }

    pub fn get(&self, name: &str) -> Option<&InputValue> {
        self.values.get(name)
    }

    /// The value of an input, if present and available.
    pub fn value(&self, name: &str) -> Option<&serde_json::Value> {
        match self.values.get(name) {
            Some(InputValue::Value(v)) => Some(v),
            _ => None,
        }
    }

    pub fn is_unavailable(&self, name: &str) -> bool {
        matches!(self.values.get(name), Some(InputValue::Unavailable { .. }))
    }

    /// The value of an input, failing if it is missing or unavailable.
    pub fn require(&self, name: &str) -> Result<&serde_json::Value> {
        match self.values.get(name) {
            Some(InputValue::Value(v)) => Ok(v),
            Some(InputValue::Unavailable { source, .. }) => Err(NodeflowError::InputUnavailable {
                input: name.to_string(),
                source_node: source.clone(),
            }),
            None => Err(NodeflowError::InputValidation(format!(
                "missing required input '{}'",
                name
            ))),
        }
    }

    pub fn require_str(&self, name: &str) -> Result<&str> {
        self.require(name)?.as_str().ok_or_else(|| {
            NodeflowError::InputValidation(format!("input '{}' must be a string", name))
        })
    }

    /// Deserialize all available inputs into a typed struct.
    ///
    /// Unavailable inputs are reported rather than silently dropped.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        let mut obj = serde_json::Map::new();
        for (name, value) in &self.values {
            match value {
                InputValue::Value(v) => {
                    obj.insert(name.clone(), v.clone());
                }
                InputValue::Unavailable { source, .. } => {
                    return Err(NodeflowError::InputUnavailable {
                        input: name.clone(),
                        source_node: source.clone(),
                    });
                }
            }
        }
        serde_json::from_value(serde_json::Value::Object(obj))
            .map_err(|e| NodeflowError::InputValidation(e.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &InputValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Named outputs returned by a handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutput(pub serde_json::Map<String, serde_json::Value>);

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.get(name)
    }

    /// Objects map key-for-key; any other value lands under `"output"`.
    pub fn from_value(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(map) => Self(map),
            other => Self::new().with("output", other),
        }
    }

    pub fn into_value(self) -> serde_json::Value {
        serde_json::Value::Object(self.0)
    }
}

impl From<serde_json::Value> for NodeOutput {
    fn from(value: serde_json::Value) -> Self {
        Self::from_value(value)
    }
}

/// Read-only bag handed to every handler invocation.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: RunId,
    pub flow_key: String,
    /// Node currently being executed.
    pub node_id: String,
    /// Environment and secrets from `[env]` in the config.
    pub env: Arc<HashMap<String, String>>,
    /// Variables resolved so far in this run.
    pub variables: Arc<VariableStore>,
    /// Fires only when the run is torn down. Run cancellation and deadlines
    /// stop dispatch but never reach a handler already in flight.
    pub teardown: CancellationToken,
}

impl ExecutionContext {
    /// Context for ad-hoc handler invocation outside a run.
    pub fn detached(node_id: impl Into<String>) -> Self {
        Self {
            run_id: RunId::new(),
            flow_key: String::new(),
            node_id: node_id.into(),
            env: Arc::new(HashMap::new()),
            variables: Arc::new(VariableStore::new()),
            teardown: CancellationToken::new(),
        }
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(|s| s.as_str())
    }

    pub fn secret(&self, key: &str) -> Result<&str> {
        self.env(key)
            .ok_or_else(|| NodeflowError::Config(format!("secret '{}' is not configured", key)))
    }

    /// Look up a run variable written by `node_id`.
    pub fn variable(&self, node_id: &str, output: &str) -> Option<serde_json::Value> {
        self.variables.get(node_id, output)
    }
}

/// Record of one node visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRunResult {
    pub node_id: String,
    pub node_type: String,
    pub status: NodeStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Identifier of the resolved handler; absent when none was found.
    #[serde(rename = "handlerIdentifier", default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeRunResult {
    pub fn success(
        node_id: impl Into<String>,
        node_type: impl Into<String>,
        handler: Option<String>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        output: serde_json::Value,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_type: node_type.into(),
            status: NodeStatus::Success,
            started_at,
            finished_at,
            handler,
            output: Some(output),
            error: None,
        }
    }

    pub fn failure(
        node_id: impl Into<String>,
        node_type: impl Into<String>,
        handler: Option<String>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_type: node_type.into(),
            status: NodeStatus::Error,
            started_at,
            finished_at,
            handler,
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn skipped(
        node_id: impl Into<String>,
        node_type: impl Into<String>,
        at: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_type: node_type.into(),
            status: NodeStatus::Skipped,
            started_at: at,
            finished_at: at,
            handler: None,
            output: None,
            error: Some(reason.into()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == NodeStatus::Success
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// Whole-run record consumed by monitoring UIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRunResult {
    pub run_id: String,
    #[serde(default)]
    pub flow_key: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub node_results: Vec<NodeRunResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FlowRunResult {
    /// A fresh, pending run record.
    pub fn new(run_id: &RunId, flow_key: impl Into<String>) -> Self {
        Self {
            run_id: run_id.0.clone(),
            flow_key: flow_key.into(),
            status: RunStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            node_results: Vec::new(),
            error: None,
        }
    }

    /// Close the record. Status is derived from node results unless
    /// `cancelled` or a run-level `error` overrides it.
    pub fn finalize(&mut self, cancelled: bool, error: Option<String>) {
        self.status = if error.is_some() {
            RunStatus::Error
        } else if cancelled {
            RunStatus::Cancelled
        } else if self.node_results.iter().all(NodeRunResult::succeeded) {
            RunStatus::Success
        } else {
            RunStatus::Error
        };
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeRunResult> {
        self.node_results.iter().find(|r| r.node_id == node_id)
    }

    /// Node ids in reported order.
    pub fn visit_order(&self) -> Vec<&str> {
        self.node_results.iter().map(|r| r.node_id.as_str()).collect()
    }

    pub fn failed_nodes(&self) -> Vec<&NodeRunResult> {
        self.node_results.iter().filter(|r| !r.succeeded()).collect()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}
