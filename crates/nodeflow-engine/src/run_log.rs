use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use nodeflow_core::event::{EventBus, FlowEvent};
use nodeflow_core::types::RunId;

/// JSONL run logger.
///
/// Writes one JSON object per line to `{log_dir}/{flow_key}/{timestamp}.jsonl`
/// for a single run. Each line is flushed as it is written, so a crash
/// leaves every earlier line intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1 = run summary, 2 = per node.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and log on a background task.
    ///
    /// Subscribing before spawning means events published right after this
    /// call are not missed.
    pub fn start(
        self,
        event_bus: &Arc<EventBus>,
        run_id: RunId,
        flow_key: String,
        cancel: CancellationToken,
    ) -> JoinHandle<Option<PathBuf>> {
        let rx = event_bus.subscribe();
        tokio::spawn(async move { self.run(rx, run_id, flow_key, cancel).await })
    }

    /// Write entries for `run_id` until it finishes or `cancel` fires.
    ///
    /// Returns the log file path, or `None` if it could not be opened.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<FlowEvent>,
        run_id: RunId,
        flow_key: String,
        cancel: CancellationToken,
    ) -> Option<PathBuf> {
        let flow_dir = self.log_dir.join(sanitize(&flow_key));
        if let Err(e) = tokio::fs::create_dir_all(&flow_dir).await {
            error!(error = %e, "Failed to create log directory");
            return None;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = flow_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return None;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.run_id() != &run_id {
                                continue;
                            }
                            if let Some(entry) = self.event_to_entry(&event) {
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write log entry");
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush log");
                                    }
                                }
                            }
                            if matches!(event, FlowEvent::RunFinished { .. }) {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
        Some(log_path)
    }

    /// Convert an event to a log entry (None if filtered by level).
    fn event_to_entry(&self, event: &FlowEvent) -> Option<LogEntry> {
        let entry = |event_type: &str, node_id: Option<&String>, detail: Option<serde_json::Value>| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: event.run_id().0.clone(),
            event_type: event_type.to_string(),
            node_id: node_id.cloned(),
            detail,
        };

        match event {
            // L1: run summary
            FlowEvent::RunStarted { flow_key, node_count, .. } => Some(entry(
                "run_started",
                None,
                Some(serde_json::json!({ "flow_key": flow_key, "node_count": node_count })),
            )),
            FlowEvent::RunFinished { status, error, .. } => Some(entry(
                "run_finished",
                None,
                Some(serde_json::json!({ "status": status.to_string(), "error": error })),
            )),

            // L2: per node
            FlowEvent::NodeStarted { node_id, node_type, .. } if self.level >= 2 => Some(entry(
                "node_started",
                Some(node_id),
                Some(serde_json::json!({ "node_type": node_type })),
            )),
            FlowEvent::NodeCompleted { node_id, duration_ms, .. } if self.level >= 2 => Some(entry(
                "node_completed",
                Some(node_id),
                Some(serde_json::json!({ "duration_ms": duration_ms })),
            )),
            FlowEvent::NodeFailed { node_id, error, .. } if self.level >= 2 => Some(entry(
                "node_failed",
                Some(node_id),
                Some(serde_json::json!({ "error": error })),
            )),

            _ => None,
        }
    }
}

/// Flow keys become directory names.
fn sanitize(flow_key: &str) -> String {
    let cleaned: String = flow_key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}
