use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeflowError {
    // Structural errors (fatal before any node runs)
    #[error("Edge {source_id} -> {target} references unknown node '{missing}'")]
    DanglingEdge {
        source_id: String,
        target: String,
        missing: String,
    },

    #[error("Graph contains a cycle: {}", members.join(" -> "))]
    Cycle { members: Vec<String> },

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Trigger node not found: {0}")]
    UnknownTrigger(String),

    // Handler errors
    #[error("Handler not installed/found: {0}")]
    HandlerNotFound(String),

    #[error("Handler execution failed: {node_type}: {message}")]
    HandlerExecution { node_type: String, message: String },

    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("Input validation failed: {0}")]
    InputValidation(String),

    #[error("Input '{input}' is unavailable: upstream '{source_node}' produced no value")]
    InputUnavailable { input: String, source_node: String },

    // Variable store errors
    #[error("Upstream output not yet available: {0}")]
    VariableNotReady(String),

    #[error("Variable already written: {0}")]
    VariableAlreadyWritten(String),

    // History errors
    #[error("Run not found: {flow_key}/{run_id}")]
    RunNotFound { flow_key: String, run_id: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Persist failed: {0}")]
    Persist(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NodeflowError {
    /// Structural errors abort a run before any handler is invoked.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::DanglingEdge { .. }
                | Self::Cycle { .. }
                | Self::DuplicateNode(_)
                | Self::UnknownTrigger(_)
        )
    }

    /// Shorthand for a handler failure carrying the node type.
    pub fn execution(node_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HandlerExecution {
            node_type: node_type.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, NodeflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_classification() {
        assert!(NodeflowError::Cycle {
            members: vec!["a".into(), "b".into(), "a".into()]
        }
        .is_structural());
        assert!(NodeflowError::DuplicateNode("a".into()).is_structural());
        assert!(!NodeflowError::HandlerNotFound("x".into()).is_structural());
        assert!(!NodeflowError::VariableNotReady("a.out".into()).is_structural());
    }

    #[test]
    fn test_cycle_message_names_members() {
        let err = NodeflowError::Cycle {
            members: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Graph contains a cycle: a -> b -> a");
    }

    #[test]
    fn test_dangling_edge_message() {
        let err = NodeflowError::DanglingEdge {
            source_id: "a".into(),
            target: "ghost".into(),
            missing: "ghost".into(),
        };
        assert!(err.to_string().contains("unknown node 'ghost'"));
    }
}
