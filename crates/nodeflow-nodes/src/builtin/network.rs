use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use nodeflow_core::error::{NodeflowError, Result};
use nodeflow_core::traits::NodeHandler;
use nodeflow_core::types::{ExecutionContext, InputSpec, NodeInputs, NodeOutput, OutputSpec};

/// Secret consulted when a Slack node has no `webhook_url` input.
pub const SLACK_WEBHOOK_ENV: &str = "SLACK_WEBHOOK_URL";

fn client(node_type: &str, timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| NodeflowError::execution(node_type, e.to_string()))
}

/// Send a request, giving up early only if the run is torn down.
async fn send(
    node_type: &str,
    req: reqwest::RequestBuilder,
    ctx: &ExecutionContext,
) -> Result<reqwest::Response> {
    tokio::select! {
        resp = req.send() => resp.map_err(|e| NodeflowError::execution(node_type, e.to_string())),
        _ = ctx.teardown.cancelled() => Err(NodeflowError::execution(node_type, "run torn down")),
    }
}

// ── HttpRequestNode ─────────────────────────────────────────────

pub struct HttpRequestNode;

#[derive(Deserialize)]
struct HttpRequestInput {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<serde_json::Value>,
    #[serde(default = "default_timeout")]
    timeout_secs: u64,
}
fn default_method() -> String {
    "GET".into()
}
fn default_timeout() -> u64 {
    30
}

impl NodeHandler for HttpRequestNode {
    fn node_type(&self) -> &str {
        "http_request"
    }
    fn display_name(&self) -> &str {
        "HTTP Request"
    }
    fn inputs(&self) -> Vec<InputSpec> {
        vec![
            InputSpec::required("url", "Request URL"),
            InputSpec::optional("method", "HTTP method (default: GET)"),
            InputSpec::optional("headers", "Request headers"),
            InputSpec::optional("body", "String body, or JSON sent as application/json"),
            InputSpec::optional("timeout_secs", "Request timeout (default: 30)"),
        ]
    }
    fn outputs(&self) -> Vec<OutputSpec> {
        vec![
            OutputSpec::new("status", "HTTP status code"),
            OutputSpec::new("headers", "Response headers"),
            OutputSpec::new("body", "Response body, parsed as JSON when possible"),
        ]
    }
    fn execute(&self, inputs: NodeInputs, ctx: ExecutionContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let p: HttpRequestInput = inputs.parse()?;
            let method = p
                .method
                .to_uppercase()
                .parse::<reqwest::Method>()
                .map_err(|e| NodeflowError::InputValidation(format!("Invalid method: {}", e)))?;

            let mut req = client("http_request", p.timeout_secs)?.request(method, &p.url);
            for (k, v) in &p.headers {
                req = req.header(k.as_str(), v.as_str());
            }
            match p.body {
                Some(serde_json::Value::String(body)) => req = req.body(body),
                Some(serde_json::Value::Null) | None => {}
                Some(json) => req = req.json(&json),
            }

            let resp = send("http_request", req, &ctx).await?;
            let status = resp.status();
            let headers: serde_json::Map<String, serde_json::Value> = resp
                .headers()
                .iter()
                .map(|(k, v)| {
                    (
                        k.to_string(),
                        serde_json::Value::String(v.to_str().unwrap_or("?").to_string()),
                    )
                })
                .collect();
            let text = resp
                .text()
                .await
                .map_err(|e| NodeflowError::execution("http_request", e.to_string()))?;
            let body = serde_json::from_str::<serde_json::Value>(&text)
                .unwrap_or(serde_json::Value::String(text));
            debug!(url = %p.url, status = status.as_u16(), "HTTP request completed");

            Ok(NodeOutput::new()
                .with("status", serde_json::json!(status.as_u16()))
                .with("headers", serde_json::Value::Object(headers))
                .with("body", body))
        })
    }
}

// ── SlackWebhookNode ────────────────────────────────────────────

pub struct SlackWebhookNode;

#[derive(Deserialize)]
struct SlackInput {
    text: String,
    #[serde(default)]
    webhook_url: Option<String>,
    #[serde(default)]
    channel: Option<String>,
}

impl NodeHandler for SlackWebhookNode {
    fn node_type(&self) -> &str {
        "slack_webhook"
    }
    fn display_name(&self) -> &str {
        "Slack: Post Message"
    }
    fn inputs(&self) -> Vec<InputSpec> {
        vec![
            InputSpec::required("text", "Message text"),
            InputSpec::optional("webhook_url", "Incoming webhook URL (default: SLACK_WEBHOOK_URL)"),
            InputSpec::optional("channel", "Channel override"),
        ]
    }
    fn outputs(&self) -> Vec<OutputSpec> {
        vec![
            OutputSpec::new("delivered", "Whether Slack accepted the message"),
            OutputSpec::new("status", "HTTP status code"),
        ]
    }
    fn execute(&self, inputs: NodeInputs, ctx: ExecutionContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            let p: SlackInput = inputs.parse()?;
            if p.text.trim().is_empty() {
                return Err(NodeflowError::InputValidation("text must not be empty".into()));
            }
            let url = match p.webhook_url {
                Some(url) => url,
                None => ctx.secret(SLACK_WEBHOOK_ENV)?.to_string(),
            };

            let mut payload = serde_json::json!({ "text": p.text });
            if let Some(channel) = p.channel {
                payload["channel"] = serde_json::Value::String(channel);
            }

            let req = client("slack_webhook", 15)?.post(&url).json(&payload);
            let resp = send("slack_webhook", req, &ctx).await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(NodeflowError::execution(
                    "slack_webhook",
                    format!("HTTP {}: {}", status.as_u16(), body),
                ));
            }

            Ok(NodeOutput::new()
                .with("delivered", serde_json::Value::Bool(true))
                .with("status", serde_json::json!(status.as_u16())))
        })
    }
}
