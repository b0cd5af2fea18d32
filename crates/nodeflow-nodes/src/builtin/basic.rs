use futures::future::BoxFuture;

use nodeflow_core::error::Result;
use nodeflow_core::traits::NodeHandler;
use nodeflow_core::types::{ExecutionContext, InputSpec, NodeInputs, NodeOutput, OutputSpec};

// ── ConstantNode ────────────────────────────────────────────────

/// Emits its configured `value` unchanged.
pub struct ConstantNode;

impl NodeHandler for ConstantNode {
    fn node_type(&self) -> &str {
        "constant"
    }
    fn display_name(&self) -> &str {
        "Constant"
    }
    fn inputs(&self) -> Vec<InputSpec> {
        vec![InputSpec::optional("value", "Value to emit").with_default(serde_json::Value::Null)]
    }
    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec::new("value", "The configured value")]
    }
    fn execute(&self, inputs: NodeInputs, _ctx: ExecutionContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let value = inputs.require("value")?.clone();
            Ok(NodeOutput::new().with("value", value))
        })
    }
}

// ── PassthroughNode ─────────────────────────────────────────────

/// Forwards `input` to `output`. Fails when the input is unavailable.
pub struct PassthroughNode;

impl NodeHandler for PassthroughNode {
    fn node_type(&self) -> &str {
        "passthrough"
    }
    fn display_name(&self) -> &str {
        "Passthrough"
    }
    fn inputs(&self) -> Vec<InputSpec> {
        vec![InputSpec::required("input", "Value to forward")]
    }
    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec::new("output", "The forwarded value")]
    }
    fn execute(&self, inputs: NodeInputs, _ctx: ExecutionContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let value = inputs.require("input")?.clone();
            Ok(NodeOutput::new().with("output", value))
        })
    }
}
