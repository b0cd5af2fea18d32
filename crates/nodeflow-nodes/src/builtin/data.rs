use futures::future::BoxFuture;

use nodeflow_core::error::{NodeflowError, Result};
use nodeflow_core::graph::{NodeConfig, UpstreamView};
use nodeflow_core::traits::NodeHandler;
use nodeflow_core::types::{
    ExecutionContext, InputSpec, InputValue, NodeInputs, NodeOutput, OutputSpec,
};

// ── JsonQueryNode ───────────────────────────────────────────────

pub struct JsonQueryNode;

impl NodeHandler for JsonQueryNode {
    fn node_type(&self) -> &str {
        "json_query"
    }
    fn display_name(&self) -> &str {
        "JSON Query"
    }
    fn inputs(&self) -> Vec<InputSpec> {
        vec![
            InputSpec::required("data", "JSON value, or a string containing JSON"),
            InputSpec::required("path", "Dot-notation path (e.g. 'items[0].name')"),
        ]
    }
    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec::new("result", "Value at the path, or null")]
    }
    fn execute(&self, inputs: NodeInputs, _ctx: ExecutionContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let data = inputs.require("data")?;
            let path = inputs.require_str("path")?;
            let parsed;
            let value = match data {
                serde_json::Value::String(s) => {
                    parsed = serde_json::from_str::<serde_json::Value>(s).map_err(|e| {
                        NodeflowError::InputValidation(format!("Invalid JSON: {}", e))
                    })?;
                    &parsed
                }
                other => other,
            };
            Ok(NodeOutput::new().with("result", json_path_query(value, path)))
        })
    }
}

/// Walk a dot path with optional `[n]` indices. Missing segments yield null.
pub(crate) fn json_path_query(value: &serde_json::Value, path: &str) -> serde_json::Value {
    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        let (key, indices) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };
        if !key.is_empty() {
            match current.get(key) {
                Some(v) => current = v,
                None => return serde_json::Value::Null,
            }
        }
        for idx in indices.split('[').filter(|s| !s.is_empty()) {
            let next = idx
                .strip_suffix(']')
                .and_then(|n| n.parse::<usize>().ok())
                .and_then(|n| current.get(n));
            match next {
                Some(v) => current = v,
                None => return serde_json::Value::Null,
            }
        }
    }
    current.clone()
}

// ── MergeNode ───────────────────────────────────────────────────

/// Combines one input per bound upstream connection into an object.
///
/// Unavailable inputs are left out unless `require_all` is set.
pub struct MergeNode;

impl MergeNode {
    fn require_all_spec() -> InputSpec {
        InputSpec::optional("require_all", "Fail when any upstream value is unavailable")
            .with_default(serde_json::Value::Bool(false))
    }
}

impl NodeHandler for MergeNode {
    fn node_type(&self) -> &str {
        "merge"
    }
    fn display_name(&self) -> &str {
        "Merge"
    }
    fn inputs(&self) -> Vec<InputSpec> {
        vec![Self::require_all_spec()]
    }
    fn dynamic_inputs(&self, _config: &NodeConfig, upstream: &UpstreamView) -> Option<Vec<InputSpec>> {
        let mut specs: Vec<InputSpec> = Vec::new();
        for link in &upstream.links {
            let Some(binding) = &link.binding else {
                continue;
            };
            if specs.iter().any(|s| s.name == binding.input) {
                continue;
            }
            specs.push(InputSpec::optional(
                binding.input.clone(),
                format!("{}.{}", link.source, binding.output),
            ));
        }
        specs.push(Self::require_all_spec());
        Some(specs)
    }
    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec::new("merged", "Object keyed by input name")]
    }
    fn execute(&self, inputs: NodeInputs, _ctx: ExecutionContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let require_all = inputs
                .value("require_all")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let mut merged = serde_json::Map::new();
            for (name, value) in inputs.iter() {
                if name == "require_all" {
                    continue;
                }
                match value {
                    InputValue::Value(v) => {
                        merged.insert(name.to_string(), v.clone());
                    }
                    InputValue::Unavailable { .. } if require_all => {
                        inputs.require(name)?;
                    }
                    InputValue::Unavailable { .. } => {}
                }
            }
            Ok(NodeOutput::new().with("merged", serde_json::Value::Object(merged)))
        })
    }
}
