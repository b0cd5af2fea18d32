use futures::future::BoxFuture;

use crate::error::Result;
use crate::graph::{GraphSnapshot, NodeConfig, UpstreamView};
use crate::types::*;

/// One executable node type.
pub trait NodeHandler: Send + Sync + 'static {
    /// Handler key matched against `Node::node_type`.
    fn node_type(&self) -> &str;

    /// Human-readable name shown in the editor palette.
    fn display_name(&self) -> &str {
        self.node_type()
    }

    /// Static input schema.
    fn inputs(&self) -> Vec<InputSpec>;

    /// Input schema derived from the node's config and its upstream view.
    ///
    /// Returning `Some` replaces `inputs()` for this invocation. Evaluated
    /// right before input resolution on every run.
    fn dynamic_inputs(&self, config: &NodeConfig, upstream: &UpstreamView) -> Option<Vec<InputSpec>> {
        let _ = (config, upstream);
        None
    }

    /// Declared outputs, written to the variable store on success.
    fn outputs(&self) -> Vec<OutputSpec>;

    /// Execute the node with resolved inputs.
    fn execute(&self, inputs: NodeInputs, ctx: ExecutionContext) -> BoxFuture<'_, Result<NodeOutput>>;
}

/// Bounded, most-recent-first run record per flow key.
pub trait HistoryStore: Send + Sync + 'static {
    /// Insert at the head, evicting from the tail past the cap.
    fn append(&self, flow_key: &str, result: &FlowRunResult) -> Result<()>;

    /// All retained runs, most recent first.
    fn list(&self, flow_key: &str) -> Result<Vec<FlowRunResult>>;

    /// A single run, or `RunNotFound`.
    fn get(&self, flow_key: &str, run_id: &str) -> Result<FlowRunResult>;
}

/// Durable sink for graph structure.
pub trait GraphPersister: Send + Sync + 'static {
    fn persist(&self, snapshot: &GraphSnapshot) -> Result<()>;
}
