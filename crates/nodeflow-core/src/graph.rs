use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{NodeflowError, Result};

/// Opaque map of declared input values set in the editor.
pub type NodeConfig = serde_json::Map<String, serde_json::Value>;

/// A node in a flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier within the graph.
    pub id: String,
    /// Handler key, resolved through the registry at run time.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Static input values.
    #[serde(default)]
    pub config: NodeConfig,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            config: NodeConfig::new(),
        }
    }

    /// Set a config value.
    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }
}

/// Names the source output feeding a target input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputBinding {
    pub output: String,
    pub input: String,
}

/// A directed dependency from `source` to `target`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_binding: Option<OutputBinding>,
}

impl Edge {
    /// Create an ordering-only edge.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            output_binding: None,
        }
    }

    /// Create an edge that feeds `output` of the source into `input` of the target.
    pub fn bound(
        source: impl Into<String>,
        output: impl Into<String>,
        target: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            output_binding: Some(OutputBinding {
                output: output.into(),
                input: input.into(),
            }),
        }
    }

    /// The `"source-target"` pair used for structural comparison.
    pub fn pair_key(&self) -> String {
        format!("{}-{}", self.source, self.target)
    }
}

/// Wire form of a graph: `{ nodes, edges }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// A persisted copy of an editable graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSnapshot {
    pub flow_key: String,
    pub graph: GraphDocument,
    pub saved_at: DateTime<Utc>,
}

/// In-memory flow graph with an incrementally maintained adjacency index.
///
/// Edges whose endpoints are missing are accepted here and rejected by the
/// validator, so a graph loaded from storage can always be inspected.
#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
    outgoing: HashMap<String, Vec<Edge>>,
    incoming: HashMap<String, Vec<Edge>>,
}

impl FlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from its wire form. Duplicate node ids are rejected.
    pub fn from_document(doc: GraphDocument) -> Result<Self> {
        let mut graph = Self::new();
        for node in doc.nodes {
            graph.add_node(node)?;
        }
        for edge in doc.edges {
            graph.add_edge(edge);
        }
        Ok(graph)
    }

    /// Parse a graph from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        let doc: GraphDocument = serde_json::from_str(json)?;
        Self::from_document(doc)
    }

    pub fn to_document(&self) -> GraphDocument {
        GraphDocument {
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
        }
    }

    /// Add a node. Fails if the id is already present.
    pub fn add_node(&mut self, node: Node) -> Result<()> {
        if self.index.contains_key(&node.id) {
            return Err(NodeflowError::DuplicateNode(node.id));
        }
        self.index.insert(node.id.clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, id: &str) -> Option<Node> {
        let pos = self.index.remove(id)?;
        let node = self.nodes.remove(pos);
        for (i, n) in self.nodes.iter().enumerate().skip(pos) {
            self.index.insert(n.id.clone(), i);
        }
        self.edges.retain(|e| e.source != id && e.target != id);
        self.outgoing.remove(id);
        self.incoming.remove(id);
        for edges in self.outgoing.values_mut() {
            edges.retain(|e| e.target != id);
        }
        for edges in self.incoming.values_mut() {
            edges.retain(|e| e.source != id);
        }
        Some(node)
    }

    /// Replace a node's config. Structure is unchanged.
    pub fn update_config(&mut self, id: &str, config: NodeConfig) -> bool {
        match self.index.get(id) {
            Some(&pos) => {
                self.nodes[pos].config = config;
                true
            }
            None => false,
        }
    }

    pub fn add_edge(&mut self, edge: Edge) {
        self.outgoing
            .entry(edge.source.clone())
            .or_default()
            .push(edge.clone());
        self.incoming
            .entry(edge.target.clone())
            .or_default()
            .push(edge.clone());
        self.edges.push(edge);
    }

    /// Remove the first edge equal to `edge`.
    pub fn remove_edge(&mut self, edge: &Edge) -> bool {
        let Some(pos) = self.edges.iter().position(|e| e == edge) else {
            return false;
        };
        self.edges.remove(pos);
        if let Some(out) = self.outgoing.get_mut(&edge.source) {
            if let Some(i) = out.iter().position(|e| e == edge) {
                out.remove(i);
            }
        }
        if let Some(inc) = self.incoming.get_mut(&edge.target) {
            if let Some(i) = inc.iter().position(|e| e == edge) {
                inc.remove(i);
            }
        }
        true
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Insertion position of a node; used as the scheduling tie-break.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn outgoing(&self, id: &str) -> &[Edge] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn incoming(&self, id: &str) -> &[Edge] {
        self.incoming.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Read-only view of a node's upstream connections.
    pub fn upstream_view(&self, id: &str) -> UpstreamView {
        let links = self
            .incoming(id)
            .iter()
            .map(|e| UpstreamLink {
                source: e.source.clone(),
                source_type: self.node(&e.source).map(|n| n.node_type.clone()),
                binding: e.output_binding.clone(),
            })
            .collect();
        UpstreamView { links }
    }
}

/// One incoming connection as seen by a handler computing its input schema.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamLink {
    pub source: String,
    pub source_type: Option<String>,
    pub binding: Option<OutputBinding>,
}

/// The upstream graph around a single node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpstreamView {
    pub links: Vec<UpstreamLink>,
}

impl UpstreamView {
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Distinct upstream node ids, in edge order.
    pub fn sources(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for link in &self.links {
            if !seen.contains(&link.source.as_str()) {
                seen.push(link.source.as_str());
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FlowGraph {
        let mut g = FlowGraph::new();
        g.add_node(Node::new("a", "constant")).unwrap();
        g.add_node(Node::new("b", "template")).unwrap();
        g.add_node(Node::new("c", "merge")).unwrap();
        g.add_edge(Edge::new("a", "b"));
        g.add_edge(Edge::bound("b", "text", "c", "left"));
        g.add_edge(Edge::new("a", "c"));
        g
    }

    #[test]
    fn test_adjacency_index() {
        let g = sample();
        assert_eq!(g.outgoing("a").len(), 2);
        assert_eq!(g.incoming("c").len(), 2);
        assert!(g.incoming("a").is_empty());
        assert_eq!(g.position("c"), Some(2));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut g = sample();
        let err = g.add_node(Node::new("a", "constant")).unwrap_err();
        assert!(matches!(err, NodeflowError::DuplicateNode(id) if id == "a"));
    }

    #[test]
    fn test_remove_node_drops_edges_and_reindexes() {
        let mut g = sample();
        let removed = g.remove_node("a").unwrap();
        assert_eq!(removed.node_type, "constant");
        assert_eq!(g.edge_count(), 1);
        assert!(g.outgoing("a").is_empty());
        assert_eq!(g.incoming("c").len(), 1);
        assert_eq!(g.position("b"), Some(0));
        assert_eq!(g.node("c").unwrap().node_type, "merge");
    }

    #[test]
    fn test_remove_edge() {
        let mut g = sample();
        assert!(g.remove_edge(&Edge::new("a", "c")));
        assert!(!g.remove_edge(&Edge::new("a", "c")));
        assert_eq!(g.incoming("c").len(), 1);
        assert_eq!(g.outgoing("a").len(), 1);
    }

    #[test]
    fn test_update_config_keeps_structure() {
        let mut g = sample();
        let mut cfg = NodeConfig::new();
        cfg.insert("value".into(), serde_json::json!(7));
        assert!(g.update_config("a", cfg));
        assert_eq!(g.node("a").unwrap().config["value"], 7);
        assert_eq!(g.edge_count(), 3);
        assert!(!g.update_config("missing", NodeConfig::new()));
    }

    #[test]
    fn test_upstream_view() {
        let g = sample();
        let view = g.upstream_view("c");
        assert_eq!(view.sources(), vec!["b", "a"]);
        assert_eq!(view.links[0].source_type.as_deref(), Some("template"));
        assert_eq!(view.links[0].binding.as_ref().unwrap().input, "left");
    }

    #[test]
    fn test_document_wire_format() {
        let json = r#"{
            "nodes": [
                {"id": "fetch", "type": "http_request", "config": {"url": "https://example.com"}},
                {"id": "shape", "type": "json_query"}
            ],
            "edges": [
                {"source": "fetch", "target": "shape", "outputBinding": {"output": "body", "input": "data"}}
            ]
        }"#;
        let g = FlowGraph::from_json(json).unwrap();
        assert_eq!(g.node_count(), 2);
        assert!(g.node("shape").unwrap().config.is_empty());
        let edge = &g.edges()[0];
        assert_eq!(edge.output_binding.as_ref().unwrap().output, "body");

        let back = serde_json::to_value(g.to_document()).unwrap();
        assert_eq!(back["nodes"][0]["type"], "http_request");
        assert_eq!(back["edges"][0]["outputBinding"]["input"], "data");
    }
}
