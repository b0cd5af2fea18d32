use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;

use nodeflow_core::error::{NodeflowError, Result};
use nodeflow_core::graph::FlowGraph;
use nodeflow_nodes::NodeRegistry;

/// Check endpoint integrity, then acyclicity.
///
/// Disconnected nodes are legal.
pub fn validate(graph: &FlowGraph) -> Result<()> {
    check_endpoints(graph)?;
    if let Some(members) = find_cycle(graph) {
        return Err(NodeflowError::Cycle { members });
    }
    Ok(())
}

fn check_endpoints(graph: &FlowGraph) -> Result<()> {
    for edge in graph.edges() {
        for endpoint in [&edge.source, &edge.target] {
            if !graph.contains(endpoint) {
                return Err(NodeflowError::DanglingEdge {
                    source_id: edge.source.clone(),
                    target: edge.target.clone(),
                    missing: endpoint.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Iterative DFS with an explicit recursion stack.
///
/// Returns the cycle as a closed path, e.g. `[a, b, a]`.
pub fn find_cycle(graph: &FlowGraph) -> Option<Vec<String>> {
    let mut finished: HashSet<&str> = HashSet::new();

    for root in graph.nodes() {
        if finished.contains(root.id.as_str()) {
            continue;
        }
        // (node, index of the next outgoing edge to follow)
        let mut stack: Vec<(&str, usize)> = vec![(root.id.as_str(), 0)];
        let mut on_stack: HashMap<&str, usize> = HashMap::new();
        on_stack.insert(root.id.as_str(), 0);

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            let outgoing = graph.outgoing(node);
            if top.1 >= outgoing.len() {
                on_stack.remove(node);
                finished.insert(node);
                stack.pop();
                continue;
            }
            let target = outgoing[top.1].target.as_str();
            top.1 += 1;

            if let Some(&depth) = on_stack.get(target) {
                let mut members: Vec<String> =
                    stack[depth..].iter().map(|(id, _)| id.to_string()).collect();
                members.push(target.to_string());
                return Some(members);
            }
            if !finished.contains(target) {
                on_stack.insert(target, stack.len());
                stack.push((target, 0));
            }
        }
    }
    None
}

/// Kahn order over incoming-edge counts, ties broken by insertion order.
///
/// Nodes caught in a cycle are left out; call `validate` first.
pub fn topological_order(graph: &FlowGraph) -> Vec<String> {
    let mut indegree: HashMap<&str, usize> =
        graph.nodes().iter().map(|n| (n.id.as_str(), 0)).collect();
    for edge in graph.edges() {
        if let Some(d) = indegree.get_mut(edge.target.as_str()) {
            *d += 1;
        }
    }

    let mut ready: BTreeSet<usize> = graph
        .nodes()
        .iter()
        .enumerate()
        .filter(|(_, n)| indegree[n.id.as_str()] == 0)
        .map(|(i, _)| i)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(pos) = ready.pop_first() {
        let id = graph.nodes()[pos].id.as_str();
        order.push(id.to_string());
        for edge in graph.outgoing(id) {
            if let Some(d) = indegree.get_mut(edge.target.as_str()) {
                *d -= 1;
                if *d == 0 {
                    if let Some(p) = graph.position(&edge.target) {
                        ready.insert(p);
                    }
                }
            }
        }
    }
    order
}

/// Every node reachable from `start` along edge direction, `start` included.
pub fn reachable_from(graph: &FlowGraph, start: &str) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut stack = vec![start.to_string()];
    while let Some(id) = stack.pop() {
        if !seen.insert(id.clone()) {
            continue;
        }
        for edge in graph.outgoing(&id) {
            stack.push(edge.target.clone());
        }
    }
    seen
}

/// Editor-facing validation summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Full validation report. Unlike `validate`, this collects every problem
/// and adds non-fatal warnings about handler resolution and wiring.
pub fn validate_report(graph: &FlowGraph, registry: &NodeRegistry) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for edge in graph.edges() {
        for endpoint in [&edge.source, &edge.target] {
            if !graph.contains(endpoint) {
                errors.push(
                    NodeflowError::DanglingEdge {
                        source_id: edge.source.clone(),
                        target: edge.target.clone(),
                        missing: endpoint.clone(),
                    }
                    .to_string(),
                );
            }
        }
    }
    if let Some(members) = find_cycle(graph) {
        errors.push(NodeflowError::Cycle { members }.to_string());
    }

    if graph.node_count() > 1 {
        for node in graph.nodes() {
            if graph.incoming(&node.id).is_empty() && graph.outgoing(&node.id).is_empty() {
                warnings.push(format!("Node '{}' is not connected to any other node", node.id));
            }
        }
    }

    for node in graph.nodes() {
        let resolved = match registry.resolve(&node.node_type) {
            Ok(r) => r,
            Err(_) => {
                warnings.push(format!(
                    "Node '{}' has type '{}' which is not installed",
                    node.id, node.node_type
                ));
                continue;
            }
        };
        let handler = &resolved.handler;
        let inputs = handler
            .dynamic_inputs(&node.config, &graph.upstream_view(&node.id))
            .unwrap_or_else(|| handler.inputs());

        for edge in graph.incoming(&node.id) {
            let Some(binding) = &edge.output_binding else {
                continue;
            };
            if !inputs.iter().any(|i| i.name == binding.input) {
                warnings.push(format!(
                    "Edge {} -> {} binds undeclared input '{}'",
                    edge.source, edge.target, binding.input
                ));
            }
            let source_declares = graph
                .node(&edge.source)
                .and_then(|src| registry.resolve(&src.node_type).ok())
                .map(|src| src.handler.outputs().iter().any(|o| o.name == binding.output));
            if source_declares == Some(false) {
                warnings.push(format!(
                    "Edge {} -> {} reads undeclared output '{}'",
                    edge.source, edge.target, binding.output
                ));
            }
        }
    }

    ValidationReport {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}
