use crate::types::{RunId, RunStatus};

/// Lifecycle events emitted by the executor.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// Run passed validation and is about to dispatch.
    RunStarted {
        run_id: RunId,
        flow_key: String,
        node_count: usize,
    },
    /// Handler invocation started.
    NodeStarted {
        run_id: RunId,
        node_id: String,
        node_type: String,
    },
    /// Handler returned outputs.
    NodeCompleted {
        run_id: RunId,
        node_id: String,
        duration_ms: i64,
    },
    /// Handler failed, panicked, was missing, or the node was skipped.
    NodeFailed {
        run_id: RunId,
        node_id: String,
        error: String,
    },
    /// Run finalized.
    RunFinished {
        run_id: RunId,
        flow_key: String,
        status: RunStatus,
        error: Option<String>,
    },
}

impl FlowEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::NodeStarted { run_id, .. }
            | Self::NodeCompleted { run_id, .. }
            | Self::NodeFailed { run_id, .. }
            | Self::RunFinished { run_id, .. } => run_id,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: FlowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
