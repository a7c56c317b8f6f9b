/// Deterministic DAG planner
///
/// Turns a flow definition into the ordered list of steps to create before a
/// run starts. Ordering is a pure function of the definition: Kahn's
/// algorithm over a petgraph `DiGraph`, with every tie broken by
/// (trigger first, x, y, array index) so the plan reads left-to-right the way
/// the editor draws it. Step ids are name-based UUIDs over `run_id:step_key`,
/// so re-planning the same run after a crash reproduces the same ids.

use crate::workflow::{run::PlannedStep, types::FlowDefinition, types::FlowNode};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::{cmp::Ordering, collections::HashMap};
use uuid::Uuid;

/// Name of the synthetic step planned for a flow without nodes
pub const MANUAL_TRIGGER_STEP: &str = "Trigger: Manual";

/// Outgoing edge kept in the plan (original edge order is preserved)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedEdge {
    pub target: String,
    /// Source handle, empty when the edge has none
    pub handle: String,
}

/// Immutable execution plan for one run
///
/// Predecessor and successor lists are taken once from the static edges and
/// never change for the lifetime of the run.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Steps in execution-plan order
    pub steps: Vec<PlannedStep>,
    /// Nodes with no resolvable incoming edge, in comparator order
    pub roots: Vec<String>,
    /// Trigger nodes, in plan order
    pub triggers: Vec<String>,
    /// Whether Kahn's pass left nodes behind (cycle fallback applied)
    pub cyclic: bool,
    predecessors: HashMap<String, Vec<String>>,
    successors: HashMap<String, Vec<PlannedEdge>>,
    node_positions: HashMap<String, usize>,
    step_positions: HashMap<String, usize>,
}

impl ExecutionPlan {
    /// Planned step for a node, if the node is part of the plan
    pub fn step_for(&self, node_id: &str) -> Option<&PlannedStep> {
        self.step_positions.get(node_id).map(|&i| &self.steps[i])
    }

    /// Node definition for a planned node id
    pub fn node<'f>(&self, flow: &'f FlowDefinition, node_id: &str) -> Option<&'f FlowNode> {
        self.node_positions.get(node_id).and_then(|&i| flow.nodes.get(i))
    }

    /// Sources of every resolvable edge targeting this node (with repeats)
    pub fn predecessors(&self, node_id: &str) -> &[String] {
        self.predecessors
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Resolvable outgoing edges of this node, in definition order
    pub fn successors(&self, node_id: &str) -> &[PlannedEdge] {
        self.successors
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Where the walk begins: triggers, else roots, else the first planned node
    pub fn start_nodes(&self) -> Vec<String> {
        if !self.triggers.is_empty() {
            return self.triggers.clone();
        }
        if !self.roots.is_empty() {
            return self.roots.clone();
        }
        self.steps
            .iter()
            .find_map(|step| step.node_id.clone())
            .into_iter()
            .collect()
    }
}

/// Stable, versioned step id (UUID v5 over `run_id:step_key`)
pub fn step_id(run_id: &str, step_key: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{}:{}", run_id, step_key).as_bytes()).to_string()
}

/// `STEP_NN`, 1-based and zero-padded to two digits
pub fn step_key(position: usize) -> String {
    format!("STEP_{:02}", position + 1)
}

/// Plan a flow for a run
pub fn plan(run_id: &str, flow: &FlowDefinition) -> ExecutionPlan {
    if flow.nodes.is_empty() {
        let key = step_key(0);
        return ExecutionPlan {
            steps: vec![PlannedStep {
                step_id: step_id(run_id, &key),
                step_key: key,
                node_id: None,
                node_type: None,
                name: MANUAL_TRIGGER_STEP.to_string(),
            }],
            roots: Vec::new(),
            triggers: Vec::new(),
            cyclic: false,
            predecessors: HashMap::new(),
            successors: HashMap::new(),
            node_positions: HashMap::new(),
            step_positions: HashMap::new(),
        };
    }

    // Graph weights are indexes into `flow.nodes`; duplicate ids keep the first
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();
    let mut node_positions = HashMap::new();
    for (position, node) in flow.nodes.iter().enumerate() {
        if index_of.contains_key(node.id.as_str()) {
            tracing::warn!("⚠️ Duplicate node id '{}' ignored during planning", node.id);
            continue;
        }
        index_of.insert(node.id.as_str(), graph.add_node(position));
        node_positions.insert(node.id.clone(), position);
    }

    let mut predecessors: HashMap<String, Vec<String>> = HashMap::new();
    let mut successors: HashMap<String, Vec<PlannedEdge>> = HashMap::new();
    for edge in &flow.edges {
        let (Some(&from), Some(&to)) = (
            index_of.get(edge.source.as_str()),
            index_of.get(edge.target.as_str()),
        ) else {
            tracing::debug!("⏭️ Ignoring edge '{}' with unknown endpoint ({} → {})",
                edge.id, edge.source, edge.target);
            continue;
        };
        graph.add_edge(from, to, ());
        predecessors
            .entry(edge.target.clone())
            .or_default()
            .push(edge.source.clone());
        successors.entry(edge.source.clone()).or_default().push(PlannedEdge {
            target: edge.target.clone(),
            handle: edge.handle().to_string(),
        });
    }

    let compare = |a: &NodeIndex, b: &NodeIndex| compare_nodes(flow, &graph, *a, *b);

    let mut indegree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|ix| (ix, graph.neighbors_directed(ix, Direction::Incoming).count()))
        .collect();

    let mut roots: Vec<NodeIndex> = graph
        .node_indices()
        .filter(|ix| indegree[ix] == 0)
        .collect();
    roots.sort_by(compare);

    // Kahn's algorithm, re-sorting the ready queue after every dequeue
    let mut ready = roots.clone();
    let mut order: Vec<NodeIndex> = Vec::with_capacity(graph.node_count());
    let mut placed = vec![false; graph.node_count()];
    while !ready.is_empty() {
        ready.sort_by(compare);
        let current = ready.remove(0);
        order.push(current);
        placed[current.index()] = true;

        for next in graph.neighbors_directed(current, Direction::Outgoing) {
            if let Some(degree) = indegree.get_mut(&next) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    ready.push(next);
                }
            }
        }
    }

    let cyclic = order.len() < graph.node_count();
    if cyclic {
        let mut leftover: Vec<NodeIndex> = graph
            .node_indices()
            .filter(|ix| !placed[ix.index()])
            .collect();
        leftover.sort_by(compare);
        tracing::warn!("🔁 Flow graph contains a cycle; appending {} node(s) in layout order",
            leftover.len());
        order.extend(leftover);
    }

    let mut steps = Vec::with_capacity(order.len());
    let mut step_positions = HashMap::new();
    let mut triggers = Vec::new();
    for (position, ix) in order.iter().enumerate() {
        let node = &flow.nodes[graph[*ix]];
        let key = step_key(position);
        if node.is_trigger() {
            triggers.push(node.id.clone());
        }
        step_positions.insert(node.id.clone(), position);
        steps.push(PlannedStep {
            step_id: step_id(run_id, &key),
            step_key: key,
            node_id: Some(node.id.clone()),
            node_type: Some(node.node_type.clone()),
            name: node.display_name(),
        });
    }

    tracing::debug!("📋 Planned {} step(s) for run {}", steps.len(), run_id);

    ExecutionPlan {
        steps,
        roots: roots
            .iter()
            .map(|ix| flow.nodes[graph[*ix]].id.clone())
            .collect(),
        triggers,
        cyclic,
        predecessors,
        successors,
        node_positions,
        step_positions,
    }
}

/// Tie-break: triggers first, then x, then y, then original array index
fn compare_nodes(
    flow: &FlowDefinition,
    graph: &DiGraph<usize, ()>,
    a: NodeIndex,
    b: NodeIndex,
) -> Ordering {
    let (ia, ib) = (graph[a], graph[b]);
    let (na, nb) = (&flow.nodes[ia], &flow.nodes[ib]);
    nb.is_trigger()
        .cmp(&na.is_trigger())
        .then_with(|| na.position.x.total_cmp(&nb.position.x))
        .then_with(|| na.position.y.total_cmp(&nb.position.y))
        .then_with(|| ia.cmp(&ib))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flow(nodes: serde_json::Value, edges: serde_json::Value) -> FlowDefinition {
        serde_json::from_value(json!({"nodes": nodes, "edges": edges})).unwrap()
    }

    fn node(id: &str, node_type: &str, x: f64, y: f64) -> serde_json::Value {
        json!({"id": id, "type": "custom", "position": {"x": x, "y": y},
               "data": {"nodeType": node_type, "label": id}})
    }

    fn edge(source: &str, target: &str) -> serde_json::Value {
        json!({"id": format!("{source}-{target}"), "source": source, "target": target})
    }

    fn order(plan: &ExecutionPlan) -> Vec<String> {
        plan.steps.iter().filter_map(|s| s.node_id.clone()).collect()
    }

    #[test]
    fn test_empty_flow_plans_manual_trigger() {
        let plan = plan("run-1", &FlowDefinition::default());
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].step_key, "STEP_01");
        assert_eq!(plan.steps[0].name, MANUAL_TRIGGER_STEP);
        assert!(plan.steps[0].node_id.is_none());
        assert!(plan.start_nodes().is_empty());
    }

    #[test]
    fn test_order_respects_edges() {
        // Layout deliberately puts the downstream node left of its source
        let def = flow(
            json!([node("c", "httpRequest", 0.0, 0.0), node("b", "httpRequest", 50.0, 0.0),
                   node("a", "webhook", 100.0, 0.0)]),
            json!([edge("a", "b"), edge("b", "c")]),
        );
        let plan = plan("run-1", &def);
        assert_eq!(order(&plan), vec!["a", "b", "c"]);
        assert!(!plan.cyclic);
        assert_eq!(plan.triggers, vec!["a"]);
        assert_eq!(plan.start_nodes(), vec!["a"]);
    }

    #[test]
    fn test_ties_use_trigger_then_position_then_index() {
        let def = flow(
            json!([node("late", "httpRequest", 10.0, 0.0), node("low", "httpRequest", 0.0, 50.0),
                   node("high", "httpRequest", 0.0, 10.0), node("trig", "cron", 500.0, 500.0),
                   node("twin", "httpRequest", 10.0, 0.0)]),
            json!([]),
        );
        let plan = plan("run-1", &def);
        assert_eq!(order(&plan), vec!["trig", "high", "low", "late", "twin"]);
    }

    #[test]
    fn test_newly_ready_nodes_are_sorted_not_appended() {
        // r1 (x=0) unlocks z (x=300); r2 (x=100) is ready from the start but
        // after z becomes ready, a node at x=50 released by r1 must jump ahead.
        let def = flow(
            json!([node("r1", "httpRequest", 0.0, 0.0), node("r2", "httpRequest", 100.0, 0.0),
                   node("z", "httpRequest", 300.0, 0.0), node("m", "httpRequest", 50.0, 0.0)]),
            json!([edge("r1", "z"), edge("r1", "m")]),
        );
        let plan = plan("run-1", &def);
        assert_eq!(order(&plan), vec!["r1", "m", "r2", "z"]);
        assert_eq!(plan.roots, vec!["r1", "r2"]);
    }

    #[test]
    fn test_unknown_edge_endpoints_are_ignored() {
        let def = flow(
            json!([node("a", "httpRequest", 0.0, 0.0), node("b", "merge", 10.0, 0.0)]),
            json!([edge("a", "b"), edge("ghost", "b"), edge("a", "nowhere")]),
        );
        let plan = plan("run-1", &def);
        assert_eq!(order(&plan), vec!["a", "b"]);
        assert_eq!(plan.predecessors("b"), &["a".to_string()]);
        assert_eq!(plan.successors("a").len(), 1);
    }

    #[test]
    fn test_cycle_falls_back_to_layout_order() {
        let def = flow(
            json!([node("a", "httpRequest", 0.0, 0.0), node("b", "httpRequest", 20.0, 0.0),
                   node("c", "httpRequest", 10.0, 0.0)]),
            json!([edge("a", "b"), edge("b", "c"), edge("c", "b")]),
        );
        let plan = plan("run-1", &def);
        assert!(plan.cyclic);
        assert_eq!(order(&plan), vec!["a", "c", "b"]);
    }

    #[test]
    fn test_plan_is_deterministic_per_run() {
        let def = flow(
            json!([node("a", "webhook", 0.0, 0.0), node("b", "httpRequest", 10.0, 0.0)]),
            json!([edge("a", "b")]),
        );
        let first = plan("run-1", &def);
        let second = plan("run-1", &def);
        assert_eq!(first.steps, second.steps);

        let other_run = plan("run-2", &def);
        assert_eq!(first.steps[0].step_key, other_run.steps[0].step_key);
        assert_ne!(first.steps[0].step_id, other_run.steps[0].step_id);
    }

    #[test]
    fn test_start_nodes_fall_back_to_roots() {
        let def = flow(
            json!([node("b", "httpRequest", 10.0, 0.0), node("a", "httpRequest", 0.0, 0.0)]),
            json!([]),
        );
        assert_eq!(plan("run", &def).start_nodes(), vec!["a", "b"]);

        // Every node sits on the cycle: no roots, start from the first planned node
        let looped = flow(
            json!([node("x", "httpRequest", 10.0, 0.0), node("y", "httpRequest", 0.0, 0.0)]),
            json!([edge("x", "y"), edge("y", "x")]),
        );
        assert_eq!(plan("run", &looped).start_nodes(), vec!["y"]);
    }

    #[test]
    fn test_step_keys_are_zero_padded() {
        assert_eq!(step_key(0), "STEP_01");
        assert_eq!(step_key(9), "STEP_10");
        assert_eq!(step_key(120), "STEP_121");
    }
}
