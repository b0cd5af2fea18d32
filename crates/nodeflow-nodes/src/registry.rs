use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use nodeflow_core::error::{NodeflowError, Result};
use nodeflow_core::traits::NodeHandler;

/// Where a handler comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerTier {
    /// Always available.
    Core,
    /// Available only while its type is in the installed set.
    Integration,
}

impl HandlerTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Integration => "integration",
        }
    }
}

/// A handler returned by `NodeRegistry::resolve`.
#[derive(Clone)]
pub struct ResolvedHandler {
    pub handler: Arc<dyn NodeHandler>,
    pub tier: HandlerTier,
}

impl ResolvedHandler {
    /// Stable identifier recorded in run results, e.g. `"core/template"`.
    pub fn identifier(&self) -> String {
        format!("{}/{}", self.tier.as_str(), self.handler.node_type())
    }
}

impl std::fmt::Debug for ResolvedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedHandler")
            .field("identifier", &self.identifier())
            .finish()
    }
}

/// Result of recomputing the effective handler set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryUpdate {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Full effective set after the update, sorted.
    pub available: Vec<String>,
}

impl RegistryUpdate {
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// One generation of the effective handler set.
#[derive(Default)]
struct HandlerTable {
    handlers: HashMap<String, ResolvedHandler>,
    installed: HashSet<String>,
}

/// Registry of node handlers.
///
/// Core handlers are always resolvable. Integration handlers are kept in a
/// catalog and become resolvable only through `register_conditionally`.
/// Lookups go through an immutable table that is replaced whole on every
/// change.
pub struct NodeRegistry {
    core: RwLock<HashMap<String, Arc<dyn NodeHandler>>>,
    integrations: RwLock<HashMap<String, Arc<dyn NodeHandler>>>,
    effective: RwLock<Arc<HandlerTable>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            core: RwLock::new(HashMap::new()),
            integrations: RwLock::new(HashMap::new()),
            effective: RwLock::new(Arc::new(HandlerTable::default())),
        }
    }

    /// Install always-available handlers.
    pub fn register_core(&self, handlers: Vec<Arc<dyn NodeHandler>>) {
        {
            let mut core = self.core.write().unwrap_or_else(|e| e.into_inner());
            for handler in handlers {
                debug!(node_type = handler.node_type(), "Registered core handler");
                core.insert(handler.node_type().to_string(), handler);
            }
        }
        let installed = self.current().installed.clone();
        self.rebuild(&installed);
    }

    /// Add integration handlers to the catalog. They stay unresolvable until
    /// their type is passed to `register_conditionally`.
    pub fn register_integrations(&self, handlers: Vec<Arc<dyn NodeHandler>>) {
        {
            let mut catalog = self.integrations.write().unwrap_or_else(|e| e.into_inner());
            for handler in handlers {
                debug!(node_type = handler.node_type(), "Cataloged integration handler");
                catalog.insert(handler.node_type().to_string(), handler);
            }
        }
        let installed = self.current().installed.clone();
        self.rebuild(&installed);
    }

    /// Recompute the effective set as core plus the installed integrations.
    ///
    /// Each call replaces the previous installed set entirely.
    pub fn register_conditionally(&self, installed: &HashSet<String>) -> RegistryUpdate {
        let update = self.rebuild(installed);
        if !update.is_unchanged() {
            info!(
                added = ?update.added,
                removed = ?update.removed,
                available = update.available.len(),
                "Node registry updated"
            );
        }
        update
    }

    /// Look up the handler for a node type.
    pub fn resolve(&self, node_type: &str) -> Result<ResolvedHandler> {
        self.current()
            .handlers
            .get(node_type)
            .cloned()
            .ok_or_else(|| NodeflowError::HandlerNotFound(node_type.to_string()))
    }

    /// Currently usable node types, sorted.
    pub fn list_available(&self) -> Vec<String> {
        sorted_keys(&self.current())
    }

    /// Integration types known to the catalog, installed or not.
    pub fn list_catalog(&self) -> Vec<String> {
        let catalog = self.integrations.read().unwrap_or_else(|e| e.into_inner());
        let mut types: Vec<String> = catalog.keys().cloned().collect();
        types.sort();
        types
    }

    /// Create a registry with all built-in handlers registered and no
    /// integrations installed.
    pub fn with_builtins() -> Self {
        let registry = Self::new();

        // ── Core ────────────────────────────────────────────────
        registry.register_core(vec![
            Arc::new(crate::builtin::basic::ConstantNode),
            Arc::new(crate::builtin::basic::PassthroughNode),
            Arc::new(crate::builtin::template::TemplateNode),
            Arc::new(crate::builtin::data::JsonQueryNode),
            Arc::new(crate::builtin::data::MergeNode),
        ]);

        // ── Integrations ────────────────────────────────────────
        registry.register_integrations(vec![
            Arc::new(crate::builtin::network::HttpRequestNode),
            Arc::new(crate::builtin::network::SlackWebhookNode),
        ]);

        registry
    }

    fn current(&self) -> Arc<HandlerTable> {
        self.effective
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Build a new table and swap it in. The write lock is held across the
    /// diff so concurrent updates apply one after another.
    fn rebuild(&self, installed: &HashSet<String>) -> RegistryUpdate {
        let mut effective = self.effective.write().unwrap_or_else(|e| e.into_inner());
        let previous: BTreeSet<String> = effective.handlers.keys().cloned().collect();

        let mut handlers = HashMap::new();
        {
            let catalog = self.integrations.read().unwrap_or_else(|e| e.into_inner());
            for node_type in installed {
                match catalog.get(node_type) {
                    Some(handler) => {
                        handlers.insert(
                            node_type.clone(),
                            ResolvedHandler {
                                handler: handler.clone(),
                                tier: HandlerTier::Integration,
                            },
                        );
                    }
                    None => debug!(node_type = %node_type, "Installed type has no handler"),
                }
            }
        }
        {
            // Core wins on a type clash.
            let core = self.core.read().unwrap_or_else(|e| e.into_inner());
            for (node_type, handler) in core.iter() {
                handlers.insert(
                    node_type.clone(),
                    ResolvedHandler {
                        handler: handler.clone(),
                        tier: HandlerTier::Core,
                    },
                );
            }
        }

        let table = HandlerTable {
            handlers,
            installed: installed.clone(),
        };
        let next: BTreeSet<String> = table.handlers.keys().cloned().collect();
        *effective = Arc::new(table);

        RegistryUpdate {
            added: next.difference(&previous).cloned().collect(),
            removed: previous.difference(&next).cloned().collect(),
            available: next.into_iter().collect(),
        }
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted_keys(table: &HandlerTable) -> Vec<String> {
    let mut types: Vec<String> = table.handlers.keys().cloned().collect();
    types.sort();
    types
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use nodeflow_core::types::*;

    struct Named(&'static str);

    impl NodeHandler for Named {
        fn node_type(&self) -> &str {
            self.0
        }
        fn inputs(&self) -> Vec<InputSpec> {
            vec![]
        }
        fn outputs(&self) -> Vec<OutputSpec> {
            vec![OutputSpec::new("out", "")]
        }
        fn execute(&self, _inputs: NodeInputs, _ctx: ExecutionContext) -> BoxFuture<'_, Result<NodeOutput>> {
            Box::pin(async { Ok(NodeOutput::new()) })
        }
    }

    fn installed(types: &[&str]) -> HashSet<String> {
        types.iter().map(|s| s.to_string()).collect()
    }

    fn registry() -> NodeRegistry {
        let registry = NodeRegistry::new();
        registry.register_core(vec![Arc::new(Named("A"))]);
        registry.register_integrations(vec![Arc::new(Named("B")), Arc::new(Named("C"))]);
        registry
    }

    #[test]
    fn test_integration_requires_install() {
        let registry = registry();
        registry.register_conditionally(&installed(&[]));
        assert!(registry.resolve("A").is_ok());
        assert!(matches!(
            registry.resolve("B").unwrap_err(),
            NodeflowError::HandlerNotFound(t) if t == "B"
        ));

        registry.register_conditionally(&installed(&["B"]));
        let resolved = registry.resolve("B").unwrap();
        assert_eq!(resolved.tier, HandlerTier::Integration);
        assert_eq!(resolved.identifier(), "integration/B");
        assert_eq!(registry.resolve("A").unwrap().identifier(), "core/A");
    }

    #[test]
    fn test_conditional_update_replaces() {
        let registry = registry();
        let first = registry.register_conditionally(&installed(&["B", "C"]));
        assert_eq!(first.added, vec!["B", "C"]);
        assert_eq!(first.available, vec!["A", "B", "C"]);

        let second = registry.register_conditionally(&installed(&["C"]));
        assert!(second.added.is_empty());
        assert_eq!(second.removed, vec!["B"]);
        assert_eq!(second.available, vec!["A", "C"]);
        assert!(registry.resolve("B").is_err());
    }

    #[test]
    fn test_conditional_update_idempotent() {
        let registry = registry();
        registry.register_conditionally(&installed(&["B"]));
        let again = registry.register_conditionally(&installed(&["B"]));
        assert!(again.is_unchanged());
        assert_eq!(again.available, vec!["A", "B"]);
    }

    #[test]
    fn test_unknown_installed_type_ignored() {
        let registry = registry();
        let update = registry.register_conditionally(&installed(&["Z"]));
        assert!(update.is_unchanged());
        assert_eq!(registry.list_available(), vec!["A"]);
    }

    #[test]
    fn test_core_survives_conditional_updates() {
        let registry = registry();
        registry.register_conditionally(&installed(&["B"]));
        registry.register_core(vec![Arc::new(Named("D"))]);
        assert_eq!(registry.list_available(), vec!["A", "B", "D"]);
    }

    #[test]
    fn test_with_builtins() {
        let registry = NodeRegistry::with_builtins();
        let available = registry.list_available();
        for t in ["constant", "json_query", "merge", "passthrough", "template"] {
            assert!(available.contains(&t.to_string()), "missing {}", t);
        }
        assert!(registry.resolve("http_request").is_err());
        assert_eq!(registry.list_catalog(), vec!["http_request", "slack_webhook"]);

        registry.register_conditionally(&installed(&["slack_webhook"]));
        assert!(registry.resolve("slack_webhook").is_ok());
    }

    #[test]
    fn test_concurrent_resolve_sees_whole_generation() {
        let registry = Arc::new(registry());
        let writer = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    let set = if i % 2 == 0 {
                        installed(&["B", "C"])
                    } else {
                        installed(&[])
                    };
                    registry.register_conditionally(&set);
                }
            })
        };
        for _ in 0..200 {
            let available = registry.list_available();
            assert!(available == vec!["A"] || available == vec!["A", "B", "C"]);
        }
        writer.join().unwrap();
    }
}
