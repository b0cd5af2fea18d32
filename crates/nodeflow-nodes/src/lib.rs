pub mod builtin;
pub mod registry;

pub use registry::{HandlerTier, NodeRegistry, RegistryUpdate, ResolvedHandler};
