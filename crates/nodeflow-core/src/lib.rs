pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod traits;
pub mod types;
pub mod variables;

pub use config::AppConfig;
pub use error::{NodeflowError, Result};
pub use event::{EventBus, FlowEvent};
pub use graph::{Edge, FlowGraph, GraphDocument, GraphSnapshot, Node, OutputBinding};
pub use types::*;
pub use variables::VariableStore;
