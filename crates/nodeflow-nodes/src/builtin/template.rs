use std::sync::OnceLock;

use futures::future::BoxFuture;
use regex::{Captures, Regex};

use nodeflow_core::error::{NodeflowError, Result};
use nodeflow_core::traits::NodeHandler;
use nodeflow_core::types::{ExecutionContext, InputSpec, NodeInputs, NodeOutput, OutputSpec};

use super::data::json_path_query;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^}]+)\}\}").expect("static pattern"))
}

// ── TemplateNode ────────────────────────────────────────────────

/// Interpolates `{{name}}` from `values` and `{{node.output}}` from run
/// variables. Unresolved placeholders are left as written.
pub struct TemplateNode;

impl NodeHandler for TemplateNode {
    fn node_type(&self) -> &str {
        "template"
    }
    fn display_name(&self) -> &str {
        "Text Template"
    }
    fn inputs(&self) -> Vec<InputSpec> {
        vec![
            InputSpec::required("template", "Text with {{placeholders}}"),
            InputSpec::optional("values", "Object of named values")
                .with_default(serde_json::json!({})),
        ]
    }
    fn outputs(&self) -> Vec<OutputSpec> {
        vec![OutputSpec::new("text", "Rendered text")]
    }
    fn execute(&self, inputs: NodeInputs, ctx: ExecutionContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let template = inputs.require_str("template")?;
            let values = match inputs.value("values") {
                Some(serde_json::Value::Object(map)) => map.clone(),
                Some(serde_json::Value::Null) | None => serde_json::Map::new(),
                Some(_) => {
                    return Err(NodeflowError::InputValidation(
                        "input 'values' must be an object".into(),
                    ))
                }
            };
            let text = render(template, &values, &ctx);
            Ok(NodeOutput::new().with("text", serde_json::Value::String(text)))
        })
    }
}

/// Render `{{...}}` placeholders.
///
/// - `{{name}}` and `{{input.name}}` read from `values`;
/// - `{{node.output}}` reads the run variable;
/// - `{{node.output.path[0]}}` drills into the variable with a json path.
pub fn render(
    template: &str,
    values: &serde_json::Map<String, serde_json::Value>,
    ctx: &ExecutionContext,
) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures| {
            let key = caps[1].trim();
            lookup(key, values, ctx)
                .map(|v| display(&v))
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn lookup(
    key: &str,
    values: &serde_json::Map<String, serde_json::Value>,
    ctx: &ExecutionContext,
) -> Option<serde_json::Value> {
    let parts: Vec<&str> = key.splitn(3, '.').collect();
    match parts.as_slice() {
        [name] => values.get(*name).cloned(),
        ["input" | "inputs", rest @ ..] => {
            let path = rest.join(".");
            let root = serde_json::Value::Object(values.clone());
            let found = json_path_query(&root, &path);
            (!found.is_null()).then_some(found)
        }
        [node, output] => ctx.variable(node, output),
        [node, output, path] => {
            let base = ctx.variable(node, output)?;
            let found = json_path_query(&base, path);
            (!found.is_null()).then_some(found)
        }
        _ => None,
    }
}

fn display(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
