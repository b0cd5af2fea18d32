use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use nodeflow_core::config::{EngineConfig, OnNodeError, UpstreamFailurePolicy};
use nodeflow_core::error::{NodeflowError, Result};
use nodeflow_core::event::{EventBus, FlowEvent};
use nodeflow_core::graph::{FlowGraph, Node};
use nodeflow_core::traits::HistoryStore;
use nodeflow_core::types::*;
use nodeflow_core::variables::VariableStore;
use nodeflow_nodes::NodeRegistry;

use crate::validator::{reachable_from, topological_order, validate};

/// Per-run parameters.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Pre-assigned so observers can subscribe before the run starts.
    pub run_id: RunId,
    pub flow_key: String,
    /// Only nodes reachable from this node execute.
    pub trigger: Option<String>,
    /// Overrides `EngineConfig::run_timeout_secs`.
    pub deadline: Option<Duration>,
}

impl RunOptions {
    pub fn new(flow_key: impl Into<String>) -> Self {
        Self {
            run_id: RunId::new(),
            flow_key: flow_key.into(),
            trigger: None,
            deadline: None,
        }
    }

    pub fn with_trigger(mut self, node_id: impl Into<String>) -> Self {
        self.trigger = Some(node_id.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::new("default")
    }
}

/// What a spawned handler task reports back to the scheduler.
struct Finished {
    node_id: String,
    node_type: String,
    handler: String,
    declared: Vec<String>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    outcome: Result<NodeOutput>,
}

/// Result of preparing one eligible node.
enum Dispatch {
    /// Handler invocation spawned.
    Spawned,
    /// Recorded without invoking a handler.
    Settled(NodeRunResult),
    /// Ordering violation; the run stops.
    Fatal(NodeflowError),
}

/// Mutable scheduling state for a single run.
struct RunState<'g> {
    graph: &'g FlowGraph,
    scope: HashSet<String>,
    indegree: HashMap<String, usize>,
    ready: BTreeSet<usize>,
    failed: HashSet<String>,
    results: Vec<NodeRunResult>,
    variables: Arc<VariableStore>,
}

impl<'g> RunState<'g> {
    fn new(graph: &'g FlowGraph, trigger: Option<&str>) -> Result<Self> {
        let scope: HashSet<String> = match trigger {
            Some(t) if !graph.contains(t) => {
                return Err(NodeflowError::UnknownTrigger(t.to_string()))
            }
            Some(t) => reachable_from(graph, t),
            None => graph.nodes().iter().map(|n| n.id.clone()).collect(),
        };

        let variables = Arc::new(VariableStore::new());
        let mut indegree: HashMap<String, usize> = HashMap::new();
        for node in graph.nodes() {
            if scope.contains(&node.id) {
                let count = graph
                    .incoming(&node.id)
                    .iter()
                    .filter(|e| scope.contains(&e.source))
                    .count();
                indegree.insert(node.id.clone(), count);
            } else {
                // Out-of-scope producers read as unavailable, not unready.
                variables.settle(&node.id);
            }
        }

        let ready = graph
            .nodes()
            .iter()
            .enumerate()
            .filter(|(_, n)| indegree.get(&n.id) == Some(&0))
            .map(|(i, _)| i)
            .collect();

        Ok(Self {
            graph,
            scope,
            indegree,
            ready,
            failed: HashSet::new(),
            results: Vec::new(),
            variables,
        })
    }

    fn next_ready(&mut self) -> Option<&'g Node> {
        let graph = self.graph;
        self.ready.pop_first().map(|pos| &graph.nodes()[pos])
    }

    /// First direct in-scope upstream that did not succeed.
    fn failed_upstream(&self, node_id: &str) -> Option<&str> {
        self.graph
            .incoming(node_id)
            .iter()
            .map(|e| e.source.as_str())
            .find(|s| self.scope.contains(*s) && self.failed.contains(*s))
    }

    /// Record a visit, settle the producer and release its successors.
    fn settle(&mut self, result: NodeRunResult) {
        let node_id = result.node_id.clone();
        self.variables.settle(&node_id);
        if !result.succeeded() {
            self.failed.insert(node_id.clone());
        }
        self.results.push(result);

        for edge in self.graph.outgoing(&node_id) {
            if !self.scope.contains(&edge.target) {
                continue;
            }
            if let Some(d) = self.indegree.get_mut(&edge.target) {
                *d = d.saturating_sub(1);
                if *d == 0 {
                    if let Some(pos) = self.graph.position(&edge.target) {
                        self.ready.insert(pos);
                    }
                }
            }
        }
    }
}

/// Executes flow graphs against a node registry.
///
/// Eligible nodes are dispatched as independent tasks, bounded by
/// `max_concurrency`. The scheduler wakes on every completion to release
/// newly eligible nodes. Results are reported in Kahn order regardless of
/// completion timing.
pub struct FlowExecutor {
    registry: Arc<NodeRegistry>,
    config: EngineConfig,
    env: Arc<HashMap<String, String>>,
    event_bus: Option<Arc<EventBus>>,
    history: Option<Arc<dyn HistoryStore>>,
}

impl FlowExecutor {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self {
            registry,
            config: EngineConfig::default(),
            env: Arc::new(HashMap::new()),
            event_bus: None,
            history: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Environment and secrets handed to every handler.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Arc::new(env);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Finalized runs are appended here.
    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Run a graph to completion and return the finalized record.
    pub async fn run(
        &self,
        graph: &FlowGraph,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> FlowRunResult {
        let run_id = options.run_id.clone();
        let mut record = FlowRunResult::new(&run_id, &options.flow_key);
        record.status = RunStatus::Running;

        let prepared = validate(graph).and_then(|_| RunState::new(graph, options.trigger.as_deref()));
        let mut state = match prepared {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    run_id = %run_id,
                    flow_key = %options.flow_key,
                    structural = e.is_structural(),
                    error = %e,
                    "Flow rejected before execution"
                );
                record.finalize(false, Some(e.to_string()));
                self.finish(&record);
                return record;
            }
        };

        info!(
            run_id = %run_id,
            flow_key = %options.flow_key,
            nodes = state.scope.len(),
            "Flow run started"
        );
        self.publish(FlowEvent::RunStarted {
            run_id: run_id.clone(),
            flow_key: options.flow_key.clone(),
            node_count: state.scope.len(),
        });

        // Cancellation and the deadline only stop dispatch. Handlers get
        // `teardown`, which fires only if this run is dropped mid-flight.
        let teardown = CancellationToken::new();
        let _teardown_guard = teardown.clone().drop_guard();
        let deadline = options
            .deadline
            .or_else(|| self.config.run_timeout())
            .map(|d| Instant::now() + d);
        let max_concurrency = self.config.max_concurrency.max(1);

        let mut tasks: JoinSet<Finished> = JoinSet::new();
        let mut cancelled = false;
        let mut halted = false;
        let mut fatal: Option<NodeflowError> = None;

        loop {
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
            }
            if !cancelled && deadline.is_some_and(|at| Instant::now() >= at) {
                cancelled = true;
            }

            while !cancelled && !halted && fatal.is_none() && tasks.len() < max_concurrency {
                let Some(node) = state.next_ready() else {
                    break;
                };
                match self.dispatch(node, &state, &options, &teardown, &mut tasks) {
                    Dispatch::Spawned => {}
                    Dispatch::Settled(result) => {
                        if !result.succeeded() && self.config.on_node_error == OnNodeError::Halt {
                            halted = true;
                        }
                        self.publish_outcome(&run_id, &result);
                        state.settle(result);
                    }
                    Dispatch::Fatal(e) => {
                        error!(run_id = %run_id, node_id = %node.id, error = %e, "Ordering violation");
                        fatal = Some(e);
                    }
                }
            }

            if tasks.is_empty() {
                let stalled = cancelled || halted || fatal.is_some();
                if stalled || state.ready.is_empty() {
                    break;
                }
                continue;
            }

            let deadline_hit = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { continue };
                    match joined {
                        Ok(finished) => {
                            let result = self.complete(finished, &state.variables);
                            if !result.succeeded() && self.config.on_node_error == OnNodeError::Halt {
                                debug!(node_id = %result.node_id, "Halting dispatch after node failure");
                                halted = true;
                            }
                            self.publish_outcome(&run_id, &result);
                            state.settle(result);
                        }
                        Err(e) => {
                            error!(run_id = %run_id, error = %e, "Node task aborted");
                            if fatal.is_none() {
                                fatal = Some(NodeflowError::execution("task", e.to_string()));
                            }
                        }
                    }
                }
                _ = cancel.cancelled(), if !cancelled => {
                    info!(run_id = %run_id, in_flight = tasks.len(), "Flow run cancelled");
                    cancelled = true;
                }
                _ = deadline_hit, if !cancelled => {
                    warn!(run_id = %run_id, in_flight = tasks.len(), "Flow run deadline reached");
                    cancelled = true;
                }
            }
        }

        let order = topological_order(graph);
        let rank: HashMap<&str, usize> =
            order.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
        let mut results = std::mem::take(&mut state.results);
        results.sort_by_key(|r| rank.get(r.node_id.as_str()).copied().unwrap_or(usize::MAX));
        record.node_results = results;
        record.finalize(cancelled, fatal.map(|e| e.to_string()));

        self.finish(&record);
        record
    }

    /// Run on a background task.
    pub fn spawn(
        self: &Arc<Self>,
        graph: FlowGraph,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> JoinHandle<FlowRunResult> {
        let executor = Arc::clone(self);
        tokio::spawn(async move { executor.run(&graph, options, cancel).await })
    }

    fn dispatch(
        &self,
        node: &Node,
        state: &RunState<'_>,
        options: &RunOptions,
        teardown: &CancellationToken,
        tasks: &mut JoinSet<Finished>,
    ) -> Dispatch {
        let now = Utc::now();

        if self.config.upstream_failure == UpstreamFailurePolicy::Skip {
            if let Some(upstream) = state.failed_upstream(&node.id) {
                debug!(node_id = %node.id, upstream, "Skipping node after upstream failure");
                return Dispatch::Settled(NodeRunResult::skipped(
                    &node.id,
                    &node.node_type,
                    now,
                    format!("Skipped: upstream '{}' did not succeed", upstream),
                ));
            }
        }

        let resolved = match self.registry.resolve(&node.node_type) {
            Ok(r) => r,
            Err(e) => {
                warn!(node_id = %node.id, node_type = %node.node_type, "No handler for node");
                return Dispatch::Settled(NodeRunResult::failure(
                    &node.id,
                    &node.node_type,
                    None,
                    now,
                    now,
                    e.to_string(),
                ));
            }
        };
        let handler = resolved.handler.clone();

        // Dynamic schemas are recomputed on every run.
        let specs = handler
            .dynamic_inputs(&node.config, &state.graph.upstream_view(&node.id))
            .unwrap_or_else(|| handler.inputs());

        let mut inputs = NodeInputs::new();
        for spec in &specs {
            let binding = state.graph.incoming(&node.id).iter().find_map(|e| {
                e.output_binding
                    .as_ref()
                    .filter(|b| b.input == spec.name)
                    .map(|b| (e.source.as_str(), b.output.as_str()))
            });
            if let Some((source, output)) = binding {
                match state.variables.read(source, output) {
                    Ok(Some(v)) => inputs.insert(&spec.name, InputValue::Value(v)),
                    Ok(None) => inputs.insert(
                        &spec.name,
                        InputValue::Unavailable {
                            source: source.to_string(),
                            output: output.to_string(),
                        },
                    ),
                    Err(e) => return Dispatch::Fatal(e),
                }
            } else if let Some(v) = node.config.get(&spec.name) {
                inputs.insert(&spec.name, InputValue::Value(v.clone()));
            } else if let Some(v) = &spec.default {
                inputs.insert(&spec.name, InputValue::Value(v.clone()));
            }
        }

        let ctx = ExecutionContext {
            run_id: options.run_id.clone(),
            flow_key: options.flow_key.clone(),
            node_id: node.id.clone(),
            env: self.env.clone(),
            variables: state.variables.clone(),
            teardown: teardown.clone(),
        };

        self.publish(FlowEvent::NodeStarted {
            run_id: options.run_id.clone(),
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
        });
        debug!(node_id = %node.id, handler = %resolved.identifier(), inputs = inputs.len(), "Dispatching node");

        let node_id = node.id.clone();
        let node_type = node.node_type.clone();
        let identifier = resolved.identifier();
        let declared: Vec<String> = handler.outputs().into_iter().map(|o| o.name).collect();

        tasks.spawn(async move {
            let started_at = Utc::now();
            let outcome = match AssertUnwindSafe(handler.execute(inputs, ctx))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(NodeflowError::HandlerPanicked(panic_message(&*panic))),
            };
            Finished {
                node_id,
                node_type,
                handler: identifier,
                declared,
                started_at,
                finished_at: Utc::now(),
                outcome,
            }
        });
        Dispatch::Spawned
    }

    /// Turn a finished task into a node result, writing declared outputs.
    fn complete(&self, finished: Finished, variables: &VariableStore) -> NodeRunResult {
        let Finished {
            node_id,
            node_type,
            handler,
            declared,
            started_at,
            finished_at,
            outcome,
        } = finished;

        let written = outcome.and_then(|output| {
            // Declared but unset outputs are written as null.
            let values = declared.iter().map(|name| {
                let v = output.get(name).cloned().unwrap_or(serde_json::Value::Null);
                (name.clone(), v)
            });
            variables.write_outputs(&node_id, values)?;
            Ok(output)
        });

        match written {
            Ok(output) => NodeRunResult::success(
                node_id,
                node_type,
                Some(handler),
                started_at,
                finished_at,
                output.into_value(),
            ),
            Err(e) => NodeRunResult::failure(
                node_id,
                node_type,
                Some(handler),
                started_at,
                finished_at,
                e.to_string(),
            ),
        }
    }

    fn publish(&self, event: FlowEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }

    fn publish_outcome(&self, run_id: &RunId, result: &NodeRunResult) {
        if result.succeeded() {
            debug!(node_id = %result.node_id, duration_ms = result.duration_ms(), "Node succeeded");
            self.publish(FlowEvent::NodeCompleted {
                run_id: run_id.clone(),
                node_id: result.node_id.clone(),
                duration_ms: result.duration_ms(),
            });
        } else {
            let error = result.error.clone().unwrap_or_default();
            warn!(node_id = %result.node_id, node_type = %result.node_type, error = %error, "Node failed");
            self.publish(FlowEvent::NodeFailed {
                run_id: run_id.clone(),
                node_id: result.node_id.clone(),
                error,
            });
        }
    }

    /// Persist and announce a finalized record.
    fn finish(&self, record: &FlowRunResult) {
        if let Some(history) = &self.history {
            if let Err(e) = history.append(&record.flow_key, record) {
                error!(run_id = %record.run_id, error = %e, "Failed to append run history");
            }
        }
        info!(
            run_id = %record.run_id,
            flow_key = %record.flow_key,
            status = %record.status,
            nodes = record.node_results.len(),
            duration_ms = record.duration_ms().unwrap_or(0),
            "Flow run finished"
        );
        self.publish(FlowEvent::RunFinished {
            run_id: RunId::from_string(&record.run_id),
            flow_key: record.flow_key.clone(),
            status: record.status,
            error: record.error.clone(),
        });
    }
}

/// Run a graph with default settings and no history.
pub async fn run_flow(graph: &FlowGraph, registry: Arc<NodeRegistry>) -> FlowRunResult {
    FlowExecutor::new(registry)
        .run(graph, RunOptions::default(), CancellationToken::new())
        .await
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::InMemoryHistory;
    use nodeflow_core::graph::Edge;
    use nodeflow_core::traits::NodeHandler;
    use nodeflow_test_utils::*;
    use serde_json::json;

    fn registry_with(handlers: Vec<Arc<dyn NodeHandler>>) -> Arc<NodeRegistry> {
        let registry = NodeRegistry::new();
        registry.register_core(handlers);
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_fetch_transform_scenario() {
        let result = run_flow(&fetch_transform_graph(), doubling_registry()).await;
        assert_eq!(result.status, RunStatus::Success);
        assert!(result.error.is_none());
        assert_eq!(result.visit_order(), vec!["fetch", "transform"]);
        assert_eq!(result.node_results[0].output, Some(json!({"out": 42})));
        assert_eq!(result.node_results[1].output, Some(json!({"out": 84})));
        assert_eq!(result.node_results[0].handler.as_deref(), Some("core/typeA"));
        assert!(result.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_cycle_short_circuits() {
        let graph = graph_of(&[("a", "typeA"), ("b", "typeA")], &[("a", "b"), ("b", "a")]);
        let result = run_flow(&graph, doubling_registry()).await;
        assert_eq!(result.status, RunStatus::Error);
        assert!(result.node_results.is_empty());
        assert!(result.error.as_deref().unwrap().contains("cycle"));
    }

    #[tokio::test]
    async fn test_dangling_edge_short_circuits() {
        let graph = graph_of(&[("a", "typeA")], &[("a", "ghost")]);
        let result = run_flow(&graph, doubling_registry()).await;
        assert_eq!(result.status, RunStatus::Error);
        assert!(result.node_results.is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let mut handlers = doubling_handlers();
        handlers.push(Arc::new(FailingHandler::new("broken", "upstream API returned 500")));
        let mut graph = graph_of(&[("bad", "broken"), ("after", "typeB"), ("other", "typeA")], &[]);
        graph.add_edge(Edge::bound("bad", "out", "after", "in"));

        let result = run_flow(&graph, registry_with(handlers)).await;
        assert_eq!(result.status, RunStatus::Error);
        assert_eq!(result.node("other").unwrap().status, NodeStatus::Success);

        let bad = result.node("bad").unwrap();
        assert_eq!(bad.status, NodeStatus::Error);
        assert!(bad.output.is_none());
        assert!(bad.error.as_deref().unwrap().contains("upstream API returned 500"));

        // Attempted with the unavailable sentinel; its own validation failed.
        let after = result.node("after").unwrap();
        assert_eq!(after.status, NodeStatus::Error);
        assert!(after.error.as_deref().unwrap().contains("unavailable"));
        assert_eq!(after.handler.as_deref(), Some("core/typeB"));
    }

    #[tokio::test]
    async fn test_missing_handler_is_per_node() {
        let graph = graph_of(&[("a", "typeA"), ("x", "not_installed")], &[]);
        let result = run_flow(&graph, doubling_registry()).await;
        assert_eq!(result.status, RunStatus::Error);
        let x = result.node("x").unwrap();
        assert!(x.handler.is_none());
        assert_eq!(x.error.as_deref(), Some("Handler not installed/found: not_installed"));
        assert!(result.node("a").unwrap().succeeded());
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let mut handlers = doubling_handlers();
        handlers.push(Arc::new(PanickingHandler::new("explosive")));
        let graph = graph_of(&[("boom", "explosive"), ("a", "typeA")], &[]);
        let result = run_flow(&graph, registry_with(handlers)).await;
        let boom = result.node("boom").unwrap();
        assert_eq!(boom.status, NodeStatus::Error);
        assert!(boom.error.as_deref().unwrap().contains("explosive blew up"));
        assert!(result.node("a").unwrap().succeeded());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let sleeper = Arc::new(SleepHandler::new("sleep", Duration::from_millis(20)));
        let registry = registry_with(vec![sleeper.clone() as Arc<dyn NodeHandler>]);
        let nodes: Vec<(String, &str)> = (0..6).map(|i| (format!("n{}", i), "sleep")).collect();
        let refs: Vec<(&str, &str)> = nodes.iter().map(|(id, t)| (id.as_str(), *t)).collect();
        let graph = graph_of(&refs, &[]);

        let executor = FlowExecutor::new(registry).with_config(EngineConfig {
            max_concurrency: 2,
            ..EngineConfig::default()
        });
        let result = executor
            .run(&graph, RunOptions::new("bounded"), CancellationToken::new())
            .await;
        assert!(result.succeeded());
        assert_eq!(sleeper.completed(), 6);
        assert_eq!(sleeper.peak(), 2);
    }

    #[tokio::test]
    async fn test_upstream_finishes_before_downstream_starts() {
        let sleeper = Arc::new(SleepHandler::new("sleep", Duration::from_millis(5)));
        let graph = graph_of(
            &[("a", "sleep"), ("b", "sleep"), ("c", "sleep"), ("d", "sleep")],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        );
        let result = run_flow(&graph, registry_with(vec![sleeper as Arc<dyn NodeHandler>])).await;
        assert!(result.succeeded());
        for edge in graph.edges() {
            let up = result.node(&edge.source).unwrap();
            let down = result.node(&edge.target).unwrap();
            assert!(down.started_at >= up.finished_at, "{} started before {} finished", edge.target, edge.source);
        }
    }

    #[tokio::test]
    async fn test_order_is_independent_of_timing() {
        let slow = Arc::new(SleepHandler::new("slow", Duration::from_millis(30)));
        let fast = Arc::new(SleepHandler::new("fast", Duration::from_millis(1)));
        let registry = registry_with(vec![slow as Arc<dyn NodeHandler>, fast]);
        let graph = graph_of(
            &[("root", "fast"), ("left", "slow"), ("right", "fast"), ("join", "fast")],
            &[("root", "left"), ("root", "right"), ("left", "join"), ("right", "join")],
        );

        let first = run_flow(&graph, registry.clone()).await;
        let second = run_flow(&graph, registry).await;
        assert_eq!(first.visit_order(), vec!["root", "left", "right", "join"]);
        assert_eq!(first.visit_order(), second.visit_order());
        let outputs = |r: &FlowRunResult| r.node_results.iter().map(|n| n.output.clone()).collect::<Vec<_>>();
        assert_eq!(outputs(&first), outputs(&second));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let executor = FlowExecutor::new(doubling_registry());
        let result = executor
            .run(&fetch_transform_graph(), RunOptions::new("f"), cancel)
            .await;
        assert_eq!(result.status, RunStatus::Cancelled);
        assert!(result.node_results.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_lets_in_flight_finish() {
        let sleeper = Arc::new(SleepHandler::new("sleep", Duration::from_millis(50)));
        let executor = Arc::new(FlowExecutor::new(registry_with(vec![sleeper.clone() as Arc<dyn NodeHandler>])));
        let graph = graph_of(&[("a", "sleep"), ("b", "sleep")], &[("a", "b")]);
        let cancel = CancellationToken::new();

        let handle = executor.spawn(graph, RunOptions::new("f"), cancel.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let result = handle.await.unwrap();

        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.visit_order(), vec!["a"]);
        assert!(result.node("a").unwrap().succeeded());
        assert_eq!(sleeper.completed(), 1);
        let spans = sleeper.spans();
        assert_eq!(spans[0].0, "a");
        // Ran its full delay after the cancel request.
        assert!((spans[0].2 - spans[0].1).num_milliseconds() >= 45);
    }

    #[tokio::test]
    async fn test_deadline_does_not_interrupt_in_flight_handler() {
        let sleeper = Arc::new(SleepHandler::new("sleep", Duration::from_millis(40)));
        let executor = FlowExecutor::new(registry_with(vec![sleeper.clone() as Arc<dyn NodeHandler>]));
        let graph = graph_of(&[("a", "sleep"), ("b", "sleep")], &[]);
        let result = executor
            .run(
                &graph,
                RunOptions::new("f").with_deadline(Duration::from_millis(5)),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.node_results.len(), 2);
        assert!(result.node_results.iter().all(NodeRunResult::succeeded));
        assert_eq!(sleeper.completed(), 2);
    }

    #[tokio::test]
    async fn test_dropped_run_tears_down_handlers() {
        let sleeper = Arc::new(SleepHandler::new("sleep", Duration::from_secs(30)));
        let executor = FlowExecutor::new(registry_with(vec![sleeper.clone() as Arc<dyn NodeHandler>]));
        let graph = graph_of(&[("a", "sleep")], &[]);
        let run = executor.run(&graph, RunOptions::new("f"), CancellationToken::new());
        let timed_out = tokio::time::timeout(Duration::from_millis(20), run).await;
        assert!(timed_out.is_err());
        assert_eq!(sleeper.completed(), 0);
    }

    #[tokio::test]
    async fn test_cancel_lets_in_flight_http_request_complete() {
        use nodeflow_nodes::builtin::network::HttpRequestNode;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            tokio::time::sleep(Duration::from_millis(60)).await;
            let body = "{\"ok\":true}";
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        });

        let mut handlers = doubling_handlers();
        handlers.push(Arc::new(HttpRequestNode));
        let executor = Arc::new(FlowExecutor::new(registry_with(handlers)));
        let mut graph = FlowGraph::new();
        graph
            .add_node(Node::new("fetch", "http_request").with_config("url", json!(format!("http://{}/", addr))))
            .unwrap();
        graph.add_node(Node::new("after", "typeA")).unwrap();
        graph.add_edge(Edge::new("fetch", "after"));

        let cancel = CancellationToken::new();
        let handle = executor.spawn(graph, RunOptions::new("f"), cancel.clone());
        tokio::time::sleep(Duration::from_millis(15)).await;
        cancel.cancel();
        let result = handle.await.unwrap();

        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.visit_order(), vec!["fetch"]);
        let fetch = result.node("fetch").unwrap();
        assert!(fetch.succeeded(), "{:?}", fetch.error);
        assert_eq!(fetch.output.as_ref().unwrap()["status"], json!(200));
        assert_eq!(fetch.output.as_ref().unwrap()["body"], json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_deadline_acts_like_cancel() {
        let sleeper = Arc::new(SleepHandler::new("sleep", Duration::from_millis(40)));
        let executor = FlowExecutor::new(registry_with(vec![sleeper as Arc<dyn NodeHandler>]));
        let graph = graph_of(&[("a", "sleep"), ("b", "sleep")], &[("a", "b")]);
        let result = executor
            .run(
                &graph,
                RunOptions::new("f").with_deadline(Duration::from_millis(10)),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.visit_order(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_halt_policy_stops_dispatch() {
        let mut handlers = doubling_handlers();
        handlers.push(Arc::new(FailingHandler::new("broken", "nope")));
        let graph = graph_of(&[("bad", "broken"), ("later", "typeA")], &[]);
        let executor = FlowExecutor::new(registry_with(handlers)).with_config(EngineConfig {
            max_concurrency: 1,
            on_node_error: OnNodeError::Halt,
            ..EngineConfig::default()
        });
        let result = executor
            .run(&graph, RunOptions::new("f"), CancellationToken::new())
            .await;
        assert_eq!(result.status, RunStatus::Error);
        assert_eq!(result.visit_order(), vec!["bad"]);
    }

    #[tokio::test]
    async fn test_skip_policy_propagates() {
        let mut handlers = doubling_handlers();
        handlers.push(Arc::new(FailingHandler::new("broken", "nope")));
        let graph = graph_of(
            &[("bad", "broken"), ("mid", "typeA"), ("leaf", "typeA"), ("free", "typeA")],
            &[("bad", "mid"), ("mid", "leaf")],
        );
        let executor = FlowExecutor::new(registry_with(handlers)).with_config(EngineConfig {
            upstream_failure: UpstreamFailurePolicy::Skip,
            ..EngineConfig::default()
        });
        let result = executor
            .run(&graph, RunOptions::new("f"), CancellationToken::new())
            .await;
        assert_eq!(result.node("mid").unwrap().status, NodeStatus::Skipped);
        assert_eq!(result.node("leaf").unwrap().status, NodeStatus::Skipped);
        assert!(result.node("leaf").unwrap().error.as_deref().unwrap().contains("'mid'"));
        assert!(result.node("free").unwrap().succeeded());
        assert_eq!(result.status, RunStatus::Error);
    }

    #[tokio::test]
    async fn test_trigger_limits_scope() {
        let graph = graph_of(
            &[("start", "typeA"), ("next", "typeA"), ("unrelated", "typeA")],
            &[("start", "next")],
        );
        let executor = FlowExecutor::new(doubling_registry());
        let result = executor
            .run(&graph, RunOptions::new("f").with_trigger("start"), CancellationToken::new())
            .await;
        assert!(result.succeeded());
        assert_eq!(result.visit_order(), vec!["start", "next"]);

        let missing = executor
            .run(&graph, RunOptions::new("f").with_trigger("nope"), CancellationToken::new())
            .await;
        assert_eq!(missing.status, RunStatus::Error);
        assert!(missing.node_results.is_empty());
    }

    #[tokio::test]
    async fn test_trigger_reads_out_of_scope_as_unavailable() {
        let mut graph = fetch_transform_graph();
        graph.add_node(nodeflow_core::graph::Node::new("kick", "typeA")).unwrap();
        graph.add_edge(Edge::new("kick", "transform"));
        let executor = FlowExecutor::new(doubling_registry());
        let result = executor
            .run(&graph, RunOptions::new("f").with_trigger("kick"), CancellationToken::new())
            .await;
        // fetch never ran, so transform sees its input as unavailable.
        assert!(result.error.is_none());
        assert_eq!(result.visit_order(), vec!["kick", "transform"]);
        assert!(result.node("transform").unwrap().error.as_deref().unwrap().contains("unavailable"));
    }

    #[tokio::test]
    async fn test_run_is_appended_to_history() {
        let history = Arc::new(InMemoryHistory::default());
        let executor = FlowExecutor::new(doubling_registry()).with_history(history.clone());
        let result = executor
            .run(&fetch_transform_graph(), RunOptions::new("orders"), CancellationToken::new())
            .await;
        let stored = history.get("orders", &result.run_id).unwrap();
        assert_eq!(stored, result);
    }

    #[tokio::test]
    async fn test_events_bracket_the_run() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let executor = FlowExecutor::new(doubling_registry()).with_event_bus(bus);
        let options = RunOptions::new("f");
        let run_id = options.run_id.clone();
        executor
            .run(&fetch_transform_graph(), options, CancellationToken::new())
            .await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(FlowEvent::RunStarted { node_count: 2, .. })));
        assert!(matches!(
            events.last(),
            Some(FlowEvent::RunFinished { status: RunStatus::Success, .. })
        ));
        assert!(events.iter().all(|e| e.run_id() == &run_id));
        let completed = events
            .iter()
            .filter(|e| matches!(e, FlowEvent::NodeCompleted { .. }))
            .count();
        assert_eq!(completed, 2);
    }

    #[tokio::test]
    async fn test_builtin_merge_with_dynamic_inputs() {
        let mut graph = FlowGraph::new();
        graph
            .add_node(nodeflow_core::graph::Node::new("a", "constant").with_config("value", json!(1)))
            .unwrap();
        graph
            .add_node(nodeflow_core::graph::Node::new("b", "constant").with_config("value", json!("two")))
            .unwrap();
        graph.add_node(nodeflow_core::graph::Node::new("m", "merge")).unwrap();
        graph.add_edge(Edge::bound("a", "value", "m", "left"));
        graph.add_edge(Edge::bound("b", "value", "m", "right"));

        let result = run_flow(&graph, Arc::new(NodeRegistry::with_builtins())).await;
        assert!(result.succeeded(), "{:?}", result.error);
        assert_eq!(
            result.node("m").unwrap().output,
            Some(json!({"merged": {"left": 1, "right": "two"}}))
        );
    }

    #[tokio::test]
    async fn test_template_reads_run_variables() {
        let mut graph = FlowGraph::new();
        graph
            .add_node(nodeflow_core::graph::Node::new("user", "constant").with_config("value", json!({"name": "Ada"})))
            .unwrap();
        graph
            .add_node(
                nodeflow_core::graph::Node::new("greet", "template")
                    .with_config("template", json!("Hello {{user.value.name}}")),
            )
            .unwrap();
        graph.add_edge(Edge::new("user", "greet"));

        let result = run_flow(&graph, Arc::new(NodeRegistry::with_builtins())).await;
        assert_eq!(
            result.node("greet").unwrap().output,
            Some(json!({"text": "Hello Ada"}))
        );
    }
}
