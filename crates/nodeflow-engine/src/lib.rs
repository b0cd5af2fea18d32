//! Flow execution: validation, dependency-ordered scheduling, run history
//! and structural autosave.
//!
//! A run validates the graph once, then dispatches every node whose
//! upstream producers have settled. Outputs flow between nodes through a
//! run-scoped `VariableStore`; failures stay attached to the node that
//! produced them.

pub mod autosave;
pub mod executor;
pub mod history;
pub mod run_log;
pub mod validator;

pub use autosave::{AutosaveGuard, SaveDecision, StructuralEdit, StructuralSignature};
pub use executor::{run_flow, FlowExecutor, RunOptions};
pub use history::{InMemoryHistory, DEFAULT_HISTORY_CAP};
pub use run_log::RunLogger;
pub use validator::{validate, validate_report, ValidationReport};
