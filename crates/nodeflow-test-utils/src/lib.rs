//! Mock handlers, persisters and graph fixtures shared by Nodeflow tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use nodeflow_core::error::{NodeflowError, Result};
use nodeflow_core::graph::{Edge, FlowGraph, GraphSnapshot, Node};
use nodeflow_core::traits::{GraphPersister, NodeHandler};
use nodeflow_core::types::*;
use nodeflow_nodes::NodeRegistry;

// ── StaticHandler ───────────────────────────────────────────────

/// Always returns the same outputs. Declared outputs are the object's keys.
pub struct StaticHandler {
    node_type: String,
    output: serde_json::Map<String, serde_json::Value>,
}

impl StaticHandler {
    pub fn new(node_type: &str, output: serde_json::Value) -> Self {
        Self {
            node_type: node_type.to_string(),
            output: output.as_object().cloned().unwrap_or_default(),
        }
    }
}

impl NodeHandler for StaticHandler {
    fn node_type(&self) -> &str {
        &self.node_type
    }
    fn inputs(&self) -> Vec<InputSpec> {
        vec![]
    }
    fn outputs(&self) -> Vec<OutputSpec> {
        self.output.keys().map(|k| OutputSpec::new(k.clone(), "")).collect()
    }
    fn execute(&self, _inputs: NodeInputs, _ctx: ExecutionContext) -> BoxFuture<'_, Result<NodeOutput>> {
        let output = NodeOutput(self.output.clone());
        Box::pin(async move { Ok(output) })
    }
}

// ── FnHandler ───────────────────────────────────────────────────

type HandlerFn = dyn Fn(&NodeInputs) -> Result<NodeOutput> + Send + Sync;

/// Handler backed by a synchronous closure.
pub struct FnHandler {
    node_type: String,
    inputs: Vec<InputSpec>,
    outputs: Vec<OutputSpec>,
    f: Arc<HandlerFn>,
}

impl FnHandler {
    pub fn new<F>(node_type: &str, f: F) -> Self
    where
        F: Fn(&NodeInputs) -> Result<NodeOutput> + Send + Sync + 'static,
    {
        Self {
            node_type: node_type.to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            f: Arc::new(f),
        }
    }

    pub fn input(mut self, spec: InputSpec) -> Self {
        self.inputs.push(spec);
        self
    }

    pub fn output(mut self, name: &str) -> Self {
        self.outputs.push(OutputSpec::new(name, ""));
        self
    }
}

impl NodeHandler for FnHandler {
    fn node_type(&self) -> &str {
        &self.node_type
    }
    fn inputs(&self) -> Vec<InputSpec> {
        self.inputs.clone()
    }
    fn outputs(&self) -> Vec<OutputSpec> {
        self.outputs.clone()
    }
    fn execute(&self, inputs: NodeInputs, _ctx: ExecutionContext) -> BoxFuture<'_, Result<NodeOutput>> {
        let f = self.f.clone();
        Box::pin(async move { f(&inputs) })
    }
}

// ── FailingHandler ──────────────────────────────────────────────

/// Always fails with the given message.
pub struct FailingHandler {
    node_type: String,
    message: String,
}

impl FailingHandler {
    pub fn new(node_type: &str, message: &str) -> Self {
        Self {
            node_type: node_type.to_string(),
            message: message.to_string(),
        }
    }
}

impl NodeHandler for FailingHandler {
    fn node_type(&self) -> &str {
        &self.node_type
    }
    fn inputs(&self) -> Vec<InputSpec> {
        vec![]
    }
    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec::new("out", "")]
    }
    fn execute(&self, _inputs: NodeInputs, _ctx: ExecutionContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move { Err(NodeflowError::execution(&self.node_type, &self.message)) })
    }
}

// ── PanickingHandler ────────────────────────────────────────────

pub struct PanickingHandler {
    node_type: String,
}

impl PanickingHandler {
    pub fn new(node_type: &str) -> Self {
        Self {
            node_type: node_type.to_string(),
        }
    }
}

impl NodeHandler for PanickingHandler {
    fn node_type(&self) -> &str {
        &self.node_type
    }
    fn inputs(&self) -> Vec<InputSpec> {
        vec![]
    }
    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec::new("out", "")]
    }
    fn execute(&self, _inputs: NodeInputs, _ctx: ExecutionContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move { explode(&self.node_type) })
    }
}

fn explode(node_type: &str) -> Result<NodeOutput> {
    panic!("{} blew up", node_type)
}

// ── SleepHandler ────────────────────────────────────────────────

/// Sleeps, then returns `{"out": node_id}`. Tracks how many invocations
/// overlap and when each one ran. Gives up if the run is torn down.
pub struct SleepHandler {
    node_type: String,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    spans: Mutex<Vec<(String, DateTime<Utc>, DateTime<Utc>)>>,
}

impl SleepHandler {
    pub fn new(node_type: &str, delay: Duration) -> Self {
        Self {
            node_type: node_type.to_string(),
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            spans: Mutex::new(Vec::new()),
        }
    }

    /// Highest number of simultaneous invocations seen.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Number of invocations that ran to completion.
    pub fn completed(&self) -> usize {
        self.spans.lock().unwrap().len()
    }

    /// `(node_id, started, finished)` per completed invocation.
    pub fn spans(&self) -> Vec<(String, DateTime<Utc>, DateTime<Utc>)> {
        self.spans.lock().unwrap().clone()
    }
}

impl NodeHandler for SleepHandler {
    fn node_type(&self) -> &str {
        &self.node_type
    }
    fn inputs(&self) -> Vec<InputSpec> {
        vec![]
    }
    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec::new("out", "")]
    }
    fn execute(&self, _inputs: NodeInputs, ctx: ExecutionContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let started = Utc::now();
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let torn_down = tokio::select! {
                _ = tokio::time::sleep(self.delay) => false,
                _ = ctx.teardown.cancelled() => true,
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if torn_down {
                return Err(NodeflowError::execution(&self.node_type, "torn down"));
            }
            self.spans
                .lock()
                .unwrap()
                .push((ctx.node_id.clone(), started, Utc::now()));
            Ok(NodeOutput::new().with("out", serde_json::Value::String(ctx.node_id)))
        })
    }
}

// ── RecordingPersister ──────────────────────────────────────────

/// Keeps every snapshot it is asked to persist.
#[derive(Default)]
pub struct RecordingPersister {
    snapshots: Mutex<Vec<GraphSnapshot>>,
}

impl RecordingPersister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<GraphSnapshot> {
        self.snapshots.lock().unwrap().last().cloned()
    }

    pub fn snapshots(&self) -> Vec<GraphSnapshot> {
        self.snapshots.lock().unwrap().clone()
    }
}

impl GraphPersister for RecordingPersister {
    fn persist(&self, snapshot: &GraphSnapshot) -> Result<()> {
        self.snapshots.lock().unwrap().push(snapshot.clone());
        Ok(())
    }
}

// ── Fixtures ────────────────────────────────────────────────────

/// Graph with `(id, type)` nodes and ordering-only edges.
pub fn graph_of(nodes: &[(&str, &str)], edges: &[(&str, &str)]) -> FlowGraph {
    let mut graph = FlowGraph::new();
    for (id, node_type) in nodes {
        graph.add_node(Node::new(*id, *node_type)).unwrap();
    }
    for (source, target) in edges {
        graph.add_edge(Edge::new(*source, *target));
    }
    graph
}

/// `typeA` emits `{out: 42}`; `typeB` doubles its `in` input into `out`.
pub fn doubling_handlers() -> Vec<Arc<dyn NodeHandler>> {
    vec![
        Arc::new(StaticHandler::new("typeA", serde_json::json!({"out": 42}))),
        Arc::new(
            FnHandler::new("typeB", |inputs| {
                let n = inputs.require("in")?.as_i64().ok_or_else(|| {
                    NodeflowError::InputValidation("input 'in' must be an integer".into())
                })?;
                Ok(NodeOutput::new().with("out", serde_json::json!(n * 2)))
            })
            .input(InputSpec::required("in", ""))
            .output("out"),
        ),
    ]
}

/// Registry with the doubling handlers installed as core.
pub fn doubling_registry() -> Arc<NodeRegistry> {
    let registry = NodeRegistry::new();
    registry.register_core(doubling_handlers());
    Arc::new(registry)
}

/// `fetch(typeA) -> transform(typeB)`, with `fetch.out` bound to `transform.in`.
pub fn fetch_transform_graph() -> FlowGraph {
    let mut graph = FlowGraph::new();
    graph.add_node(Node::new("fetch", "typeA")).unwrap();
    graph.add_node(Node::new("transform", "typeB")).unwrap();
    graph.add_edge(Edge::bound("fetch", "out", "transform", "in"));
    graph
}

/// Write `content` to `nodeflow.toml` in a fresh temp dir.
pub fn temp_config(content: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nodeflow.toml");
    std::fs::write(&path, content).unwrap();
    (dir, path)
}
