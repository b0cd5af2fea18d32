use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info, warn};

use nodeflow_core::error::Result;
use nodeflow_core::graph::{FlowGraph, GraphDocument, GraphSnapshot};
use nodeflow_core::traits::GraphPersister;

/// Sorted node ids plus the sorted set of `"source-target"` pairs.
///
/// Config edits and edge re-bindings between the same pair do not change it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructuralSignature {
    nodes: BTreeSet<String>,
    edges: BTreeSet<String>,
}

impl StructuralSignature {
    pub fn of(graph: &FlowGraph) -> Self {
        Self {
            nodes: graph.nodes().iter().map(|n| n.id.clone()).collect(),
            edges: graph.edges().iter().map(|e| e.pair_key()).collect(),
        }
    }
}

/// What `AutosaveGuard::on_graph_changed` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveDecision {
    Persisted,
    /// No structural change; the graph is kept as dirty for `flush`.
    Unchanged,
    /// Empty candidate over a previously non-empty graph.
    SkippedEmpty,
    /// A structural edit is in progress.
    Suppressed,
}

struct SavedState {
    signature: StructuralSignature,
    node_count: usize,
    edge_count: usize,
    had_content: bool,
    dirty: Option<GraphDocument>,
}

/// Persists graph structure as the editor mutates it.
///
/// Structural changes are written through immediately. Config-only edits
/// wait for `flush`. An empty graph never replaces a non-empty one.
pub struct AutosaveGuard {
    persister: Arc<dyn GraphPersister>,
    flow_key: String,
    suppress_depth: Arc<AtomicUsize>,
    state: Mutex<SavedState>,
}

impl AutosaveGuard {
    /// `baseline` is the graph as last loaded from storage, if any.
    pub fn new(
        persister: Arc<dyn GraphPersister>,
        flow_key: impl Into<String>,
        baseline: Option<&FlowGraph>,
    ) -> Self {
        let state = match baseline {
            Some(graph) => SavedState {
                signature: StructuralSignature::of(graph),
                node_count: graph.node_count(),
                edge_count: graph.edge_count(),
                had_content: !graph.is_empty(),
                dirty: None,
            },
            None => SavedState {
                signature: StructuralSignature::default(),
                node_count: 0,
                edge_count: 0,
                had_content: false,
                dirty: None,
            },
        };
        Self {
            persister,
            flow_key: flow_key.into(),
            suppress_depth: Arc::new(AtomicUsize::new(0)),
            state: Mutex::new(state),
        }
    }

    /// Suppress saving until the returned guard drops. Used while replaying
    /// undo/redo, which emits many intermediate mutations. Guards nest.
    pub fn begin_structural_edit(&self) -> StructuralEdit {
        self.suppress_depth.fetch_add(1, Ordering::SeqCst);
        StructuralEdit {
            depth: self.suppress_depth.clone(),
        }
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppress_depth.load(Ordering::SeqCst) > 0
    }

    /// React to a graph mutation.
    pub fn on_graph_changed(&self, graph: &FlowGraph) -> Result<SaveDecision> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if self.is_suppressed() {
            state.dirty = Some(graph.to_document());
            return Ok(SaveDecision::Suppressed);
        }

        if graph.is_empty() && state.had_content {
            warn!(flow_key = %self.flow_key, "Refusing to autosave an empty graph over saved content");
            return Ok(SaveDecision::SkippedEmpty);
        }

        let signature = StructuralSignature::of(graph);
        let grew = graph.node_count() > state.node_count || graph.edge_count() > state.edge_count;
        if !grew && signature == state.signature {
            state.dirty = Some(graph.to_document());
            return Ok(SaveDecision::Unchanged);
        }

        let doc = graph.to_document();
        if let Err(e) = self.write(&doc) {
            state.dirty = Some(doc);
            return Err(e);
        }
        state.signature = signature;
        state.node_count = graph.node_count();
        state.edge_count = graph.edge_count();
        state.had_content |= !graph.is_empty();
        state.dirty = None;
        debug!(flow_key = %self.flow_key, nodes = state.node_count, edges = state.edge_count, "Autosaved graph");
        Ok(SaveDecision::Persisted)
    }

    /// Persist pending dirty state. Returns whether anything was written.
    ///
    /// Runs regardless of the suppression flag; the empty-graph rule still
    /// applies.
    pub fn flush(&self) -> Result<bool> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(doc) = state.dirty.take() else {
            return Ok(false);
        };
        if doc.nodes.is_empty() && state.had_content {
            warn!(flow_key = %self.flow_key, "Discarding empty graph at flush");
            return Ok(false);
        }

        if let Err(e) = self.write(&doc) {
            state.dirty = Some(doc);
            return Err(e);
        }
        let graph_edges: BTreeSet<String> = doc.edges.iter().map(|e| e.pair_key()).collect();
        state.signature = StructuralSignature {
            nodes: doc.nodes.iter().map(|n| n.id.clone()).collect(),
            edges: graph_edges,
        };
        state.node_count = doc.nodes.len();
        state.edge_count = doc.edges.len();
        state.had_content |= !doc.nodes.is_empty();
        info!(flow_key = %self.flow_key, "Flushed pending graph changes");
        Ok(true)
    }

    pub fn has_pending(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .dirty
            .is_some()
    }

    fn write(&self, doc: &GraphDocument) -> Result<()> {
        self.persister.persist(&GraphSnapshot {
            flow_key: self.flow_key.clone(),
            graph: doc.clone(),
            saved_at: Utc::now(),
        })
    }
}

/// Scoped suppression of autosave. Dropping it re-enables saving.
pub struct StructuralEdit {
    depth: Arc<AtomicUsize>,
}

impl Drop for StructuralEdit {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}
