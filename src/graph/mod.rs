//! Immutable workflow graphs.
//!
//! A workflow graph is the parsed form of one laboratory process: a DAG whose
//! nodes are labware entry points, device operations, runtime values
//! (variables, computations) and branches, and whose edges carry ordering
//! plus wait constraints. Graphs are built by the external process parser
//! (or the [`builder::GraphBuilder`] in tests) and are never mutated after
//! validation, with one exception: the duration-annotation visitor stamps
//! operation nodes with estimated durations before planning.
//!
//! Nodes live in a flat arena and refer to each other by [`NodeId`] only;
//! there are no back-references and no cycles, by construction.
//!
//! # Branches
//!
//! Both successor subgraphs of a branch are materialized at build time. A
//! branch whose predicate is constant is resolved immediately: the losing
//! arm is removed and the winning arm is spliced onto the branch's
//! predecessors. Runtime-valued branches are resolved by the scheduling
//! instance once the predicate inputs are known.
//!
//! Loops never appear here; the parser unrolls them.

pub mod builder;

use crate::core::{DeviceKind, NodeId, Params};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;

/// Entry point for one container, with its starting position by name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LabwareNode {
    /// Graph-local container name, referenced by operations and edges.
    pub container: String,
    pub device: String,
    pub slot: u32,
    #[serde(default)]
    pub lidded: bool,
    #[serde(default)]
    pub labware_type: Option<String>,
    #[serde(default)]
    pub deep_well: bool,
}

/// A device operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationNode {
    /// Function name, e.g. `incubate`, `measure`, `move`.
    pub fct: String,
    /// Device kind the operation runs on; for movements, the destination kind.
    pub device_kind: DeviceKind,
    pub expected_duration: Duration,
    /// Graph-local names of participating containers.
    pub containers: Vec<String>,
    #[serde(default)]
    pub params: Params,
    /// Whether the operation transfers its container to the assigned device.
    #[serde(default)]
    pub is_movement: bool,
}

/// Arithmetic over runtime values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Comparison operators for branch predicates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cmp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

/// Pure expression over variables, computations and constants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    /// Value of a variable or computation node.
    Value { node: NodeId },
    Const { value: f64 },
    Binary {
        op: ArithOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    /// Collects every node this expression reads.
    pub fn refs(&self, out: &mut Vec<NodeId>) {
        match self {
            Expr::Value { node } => out.push(*node),
            Expr::Const { .. } => {}
            Expr::Binary { lhs, rhs, .. } => {
                lhs.refs(out);
                rhs.refs(out);
            }
        }
    }

    /// Evaluates against resolved values; `None` while any input is unknown.
    pub fn eval(&self, lookup: &impl Fn(NodeId) -> Option<f64>) -> Option<f64> {
        match self {
            Expr::Value { node } => lookup(*node),
            Expr::Const { value } => Some(*value),
            Expr::Binary { op, lhs, rhs } => {
                let l = lhs.eval(lookup)?;
                let r = rhs.eval(lookup)?;
                Some(match op {
                    ArithOp::Add => l + r,
                    ArithOp::Sub => l - r,
                    ArithOp::Mul => l * r,
                    ArithOp::Div => l / r,
                })
            }
        }
    }
}

/// Binary decision over runtime values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub lhs: Expr,
    pub cmp: Cmp,
    pub rhs: Expr,
}

impl Predicate {
    pub fn refs(&self, out: &mut Vec<NodeId>) {
        self.lhs.refs(out);
        self.rhs.refs(out);
    }

    pub fn eval(&self, lookup: &impl Fn(NodeId) -> Option<f64>) -> Option<bool> {
        let l = self.lhs.eval(lookup)?;
        let r = self.rhs.eval(lookup)?;
        Some(match self.cmp {
            Cmp::Gt => l > r,
            Cmp::Ge => l >= r,
            Cmp::Lt => l < r,
            Cmp::Le => l <= r,
            Cmp::Eq => l == r,
            Cmp::Ne => l != r,
        })
    }

    fn is_constant(&self) -> bool {
        let mut refs = Vec::new();
        self.refs(&mut refs);
        refs.is_empty()
    }
}

/// One node of the workflow graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Node {
    Labware(LabwareNode),
    Operation(OperationNode),
    /// Symbolic output of an operation, unknown until runtime.
    Variable { name: String },
    /// Pure function of variables and constants.
    Computation { name: String, expr: Expr },
    /// Runtime decision selecting one of two successor subgraphs.
    Branch { name: String, predicate: Predicate },
}

impl Node {
    pub fn as_operation(&self) -> Option<&OperationNode> {
        match self {
            Node::Operation(op) => Some(op),
            _ => None,
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Node::Variable { .. } | Node::Computation { .. })
    }
}

/// Ordering edge with wait constraints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    /// Container that ties the two steps, when the edge follows labware.
    #[serde(default)]
    pub container: Option<String>,
    /// Minimum idle time between the endpoints.
    #[serde(default)]
    pub min_wait: Option<Duration>,
    /// Maximum idle time between the endpoints.
    #[serde(default)]
    pub max_wait: Option<Duration>,
    /// Cost per second of idle time between the endpoints.
    #[serde(default)]
    pub wait_cost: f64,
    /// Branch successor tag; only on edges leaving a branch node.
    #[serde(default)]
    pub arm: Option<bool>,
}

impl Edge {
    pub fn plain(from: NodeId, to: NodeId) -> Self {
        Self {
            from,
            to,
            container: None,
            min_wait: None,
            max_wait: None,
            wait_cost: 0.0,
            arm: None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GraphError {
    #[error("workflow graph contains a cycle")]
    Cycle,

    #[error("edge references missing node {0}")]
    DanglingEdge(NodeId),

    #[error("operation {0} is unreachable from any labware node")]
    UnreachableOperation(NodeId),

    #[error("variable {node} has {count} producing operations, expected exactly one")]
    VariableProducers { node: NodeId, count: usize },

    #[error("branch {node} is missing its {arm} successor")]
    BranchArmMissing { node: NodeId, arm: bool },

    #[error("edge leaving {0} carries an arm tag but {0} is not a branch")]
    ArmOnNonBranch(NodeId),

    #[error("expression in {node} references {referenced}, which is not a value node")]
    BadReference { node: NodeId, referenced: NodeId },

    #[error("expression in {node} reads {referenced} without a connecting edge")]
    MissingValueEdge { node: NodeId, referenced: NodeId },

    #[error("container {0} has more than one labware entry")]
    DuplicateLabware(String),
}

/// Validated, immutable workflow graph for one process.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkflowGraph {
    name: String,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
}

impl WorkflowGraph {
    /// Validates raw nodes and edges, resolves constant branches, and builds
    /// the adjacency index. Only the builder and the parser call this.
    pub(crate) fn assemble(
        name: String,
        mut nodes: Vec<Node>,
        mut edges: Vec<Edge>,
    ) -> Result<Self, GraphError> {
        validate(&nodes, &edges)?;
        collapse_constant_branches(&mut nodes, &mut edges)?;
        validate(&nodes, &edges)?;
        let (outgoing, incoming) = adjacency(nodes.len(), &edges);
        Ok(Self {
            name,
            nodes,
            edges,
            outgoing,
            incoming,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeId(i as u32), n))
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn outgoing(&self, id: NodeId) -> impl Iterator<Item = &Edge> {
        self.outgoing[id.0 as usize].iter().map(|i| &self.edges[*i])
    }

    pub fn incoming(&self, id: NodeId) -> impl Iterator<Item = &Edge> {
        self.incoming[id.0 as usize].iter().map(|i| &self.edges[*i])
    }

    /// Deterministic topological order (ties broken by node id).
    pub fn topo_order(&self) -> Vec<NodeId> {
        let mut indegree: Vec<usize> = self.incoming.iter().map(|v| v.len()).collect();
        let mut heap: std::collections::BinaryHeap<std::cmp::Reverse<u32>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| std::cmp::Reverse(i as u32))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(std::cmp::Reverse(i)) = heap.pop() {
            order.push(NodeId(i));
            for edge_idx in &self.outgoing[i as usize] {
                let to = self.edges[*edge_idx].to.0 as usize;
                indegree[to] -= 1;
                if indegree[to] == 0 {
                    heap.push(std::cmp::Reverse(to as u32));
                }
            }
        }
        order
    }

    /// Nodes reachable *only* through the given arm of a branch.
    ///
    /// A node belongs to the arm when every incoming edge is either the arm
    /// edge itself or comes from a node already in the arm. Nodes that can
    /// also be reached around the branch are shared and not included.
    pub fn arm_exclusive(&self, branch: NodeId, arm: bool) -> Vec<NodeId> {
        let mut members: HashSet<NodeId> = HashSet::new();
        loop {
            let mut grew = false;
            for (id, _) in self.nodes() {
                if id == branch || members.contains(&id) {
                    continue;
                }
                let mut incoming = self.incoming(id).peekable();
                if incoming.peek().is_none() {
                    continue;
                }
                let mut via_arm = false;
                let all_inside = self.incoming(id).all(|e| {
                    if e.from == branch && e.arm == Some(arm) {
                        via_arm = true;
                        true
                    } else {
                        members.contains(&e.from)
                    }
                });
                let entered = via_arm
                    || self
                        .incoming(id)
                        .any(|e| members.contains(&e.from));
                if all_inside && entered {
                    members.insert(id);
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }
        let mut out: Vec<NodeId> = members.into_iter().collect();
        out.sort();
        out
    }

    /// Stamps operation nodes with durations supplied by the visitor.
    ///
    /// The visitor returns `None` to keep a node's declared duration.
    pub fn annotate_durations<F>(&mut self, mut visitor: F)
    where
        F: FnMut(&OperationNode) -> Option<Duration>,
    {
        for node in &mut self.nodes {
            if let Node::Operation(op) = node {
                if let Some(duration) = visitor(op) {
                    op.expected_duration = duration;
                }
            }
        }
    }

    /// The labware entries of the graph, in node order.
    pub fn labware(&self) -> impl Iterator<Item = (NodeId, &LabwareNode)> {
        self.nodes().filter_map(|(id, n)| match n {
            Node::Labware(l) => Some((id, l)),
            _ => None,
        })
    }
}

fn adjacency(node_count: usize, edges: &[Edge]) -> (Vec<Vec<usize>>, Vec<Vec<usize>>) {
    let mut outgoing = vec![Vec::new(); node_count];
    let mut incoming = vec![Vec::new(); node_count];
    for (i, edge) in edges.iter().enumerate() {
        outgoing[edge.from.0 as usize].push(i);
        incoming[edge.to.0 as usize].push(i);
    }
    (outgoing, incoming)
}

fn validate(nodes: &[Node], edges: &[Edge]) -> Result<(), GraphError> {
    let n = nodes.len();
    for edge in edges {
        if edge.from.0 as usize >= n {
            return Err(GraphError::DanglingEdge(edge.from));
        }
        if edge.to.0 as usize >= n {
            return Err(GraphError::DanglingEdge(edge.to));
        }
        if edge.arm.is_some() && !matches!(nodes[edge.from.0 as usize], Node::Branch { .. }) {
            return Err(GraphError::ArmOnNonBranch(edge.from));
        }
    }

    let (outgoing, incoming) = adjacency(n, edges);

    // Acyclicity via Kahn's algorithm.
    let mut indegree: Vec<usize> = incoming.iter().map(|v| v.len()).collect();
    let mut queue: Vec<usize> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| i)
        .collect();
    let mut seen = 0;
    while let Some(i) = queue.pop() {
        seen += 1;
        for edge_idx in &outgoing[i] {
            let to = edges[*edge_idx].to.0 as usize;
            indegree[to] -= 1;
            if indegree[to] == 0 {
                queue.push(to);
            }
        }
    }
    if seen != n {
        return Err(GraphError::Cycle);
    }

    // Unique labware per container name.
    let mut containers: HashSet<&str> = HashSet::new();
    for node in nodes {
        if let Node::Labware(labware) = node {
            if !containers.insert(labware.container.as_str()) {
                return Err(GraphError::DuplicateLabware(labware.container.clone()));
            }
        }
    }

    // Every operation reachable from at least one labware node.
    let mut reachable = vec![false; n];
    let mut stack: Vec<usize> = nodes
        .iter()
        .enumerate()
        .filter(|(_, node)| matches!(node, Node::Labware(_)))
        .map(|(i, _)| i)
        .collect();
    for i in &stack {
        reachable[*i] = true;
    }
    while let Some(i) = stack.pop() {
        for edge_idx in &outgoing[i] {
            let to = edges[*edge_idx].to.0 as usize;
            if !reachable[to] {
                reachable[to] = true;
                stack.push(to);
            }
        }
    }
    for (i, node) in nodes.iter().enumerate() {
        if matches!(node, Node::Operation(_)) && !reachable[i] {
            return Err(GraphError::UnreachableOperation(NodeId(i as u32)));
        }
    }

    // Variables: exactly one producing operation edge.
    for (i, node) in nodes.iter().enumerate() {
        if matches!(node, Node::Variable { .. }) {
            let producers = incoming[i]
                .iter()
                .filter(|e| matches!(nodes[edges[**e].from.0 as usize], Node::Operation(_)))
                .count();
            if producers != 1 {
                return Err(GraphError::VariableProducers {
                    node: NodeId(i as u32),
                    count: producers,
                });
            }
        }
    }

    // Branches: both arms present; expression refs are value nodes with edges.
    for (i, node) in nodes.iter().enumerate() {
        let id = NodeId(i as u32);
        let exprs: Vec<NodeId> = match node {
            Node::Branch { predicate, .. } => {
                for arm in [true, false] {
                    let present = outgoing[i].iter().any(|e| edges[*e].arm == Some(arm));
                    if !present {
                        return Err(GraphError::BranchArmMissing { node: id, arm });
                    }
                }
                let mut refs = Vec::new();
                predicate.refs(&mut refs);
                refs
            }
            Node::Computation { expr, .. } => {
                let mut refs = Vec::new();
                expr.refs(&mut refs);
                refs
            }
            _ => Vec::new(),
        };
        for referenced in exprs {
            if referenced.0 as usize >= n {
                return Err(GraphError::DanglingEdge(referenced));
            }
            if !nodes[referenced.0 as usize].is_value() {
                return Err(GraphError::BadReference {
                    node: id,
                    referenced,
                });
            }
            let connected = incoming[i].iter().any(|e| edges[*e].from == referenced);
            if !connected {
                return Err(GraphError::MissingValueEdge {
                    node: id,
                    referenced,
                });
            }
        }
    }

    Ok(())
}

/// Resolves branches whose predicate needs no runtime input.
///
/// The losing arm's exclusive subgraph disappears; the winning arm's heads
/// are spliced onto the branch's predecessors with sequentially combined
/// wait windows.
fn collapse_constant_branches(
    nodes: &mut Vec<Node>,
    edges: &mut Vec<Edge>,
) -> Result<(), GraphError> {
    loop {
        let constant = nodes.iter().enumerate().find_map(|(i, node)| match node {
            Node::Branch { predicate, .. } if predicate.is_constant() => {
                let verdict = predicate.eval(&|_| None).unwrap_or(false);
                Some((NodeId(i as u32), verdict))
            }
            _ => None,
        });
        let Some((branch, verdict)) = constant else {
            return Ok(());
        };

        let graph = WorkflowGraph {
            name: String::new(),
            nodes: nodes.clone(),
            edges: edges.clone(),
            outgoing: adjacency(nodes.len(), edges).0,
            incoming: adjacency(nodes.len(), edges).1,
        };
        let mut removed: HashSet<NodeId> =
            graph.arm_exclusive(branch, !verdict).into_iter().collect();
        removed.insert(branch);

        // Splice predecessors onto the winning arm heads.
        let preds: Vec<Edge> = edges
            .iter()
            .filter(|e| e.to == branch && !removed.contains(&e.from))
            .cloned()
            .collect();
        let winners: Vec<Edge> = edges
            .iter()
            .filter(|e| e.from == branch && e.arm == Some(verdict))
            .cloned()
            .collect();
        let mut spliced = Vec::new();
        for pred in &preds {
            for winner in &winners {
                let min_wait = match (pred.min_wait, winner.min_wait) {
                    (None, None) => None,
                    (a, b) => Some(a.unwrap_or_default() + b.unwrap_or_default()),
                };
                let max_wait = match (pred.max_wait, winner.max_wait) {
                    (Some(a), Some(b)) => Some(a + b),
                    _ => None,
                };
                spliced.push(Edge {
                    from: pred.from,
                    to: winner.to,
                    container: winner.container.clone().or_else(|| pred.container.clone()),
                    min_wait,
                    max_wait,
                    wait_cost: pred.wait_cost.max(winner.wait_cost),
                    arm: None,
                });
            }
        }

        // Drop all edges touching removed nodes, then splice and compact ids.
        edges.retain(|e| !removed.contains(&e.from) && !removed.contains(&e.to));
        edges.extend(spliced);

        let mut remap: HashMap<NodeId, NodeId> = HashMap::new();
        let mut kept = Vec::with_capacity(nodes.len() - removed.len());
        for (i, node) in nodes.drain(..).enumerate() {
            let old = NodeId(i as u32);
            if !removed.contains(&old) {
                remap.insert(old, NodeId(kept.len() as u32));
                kept.push(node);
            }
        }
        *nodes = kept;
        for edge in edges.iter_mut() {
            edge.from = remap[&edge.from];
            edge.to = remap[&edge.to];
        }
        for node in nodes.iter_mut() {
            let remap_expr = |expr: &mut Expr| remap_expr_nodes(expr, &remap);
            match node {
                Node::Computation { expr, .. } => remap_expr(expr),
                Node::Branch { predicate, .. } => {
                    remap_expr_nodes(&mut predicate.lhs, &remap);
                    remap_expr_nodes(&mut predicate.rhs, &remap);
                }
                _ => {}
            }
        }
    }
}

fn remap_expr_nodes(expr: &mut Expr, remap: &HashMap<NodeId, NodeId>) {
    match expr {
        Expr::Value { node } => {
            if let Some(new) = remap.get(node) {
                *node = *new;
            }
        }
        Expr::Const { .. } => {}
        Expr::Binary { lhs, rhs, .. } => {
            remap_expr_nodes(lhs, remap);
            remap_expr_nodes(rhs, remap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::builder::GraphBuilder;
    use super::*;
    use crate::core::DeviceKind;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_cycle_rejected() {
        let mut b = GraphBuilder::new("cyclic");
        let plate = b.labware("p1", "Hotel", 0);
        let a = b.operation("one", DeviceKind::Incubator, secs(10), &["p1"]);
        let c = b.operation("two", DeviceKind::Incubator, secs(10), &["p1"]);
        b.connect(plate, a);
        b.connect(a, c);
        b.connect(c, a);
        assert_eq!(b.build().unwrap_err(), GraphError::Cycle);
    }

    #[test]
    fn test_unreachable_operation_rejected() {
        let mut b = GraphBuilder::new("orphan");
        b.labware("p1", "Hotel", 0);
        b.operation("floating", DeviceKind::Incubator, secs(10), &["p1"]);
        assert!(matches!(
            b.build().unwrap_err(),
            GraphError::UnreachableOperation(_)
        ));
    }

    #[test]
    fn test_variable_needs_one_producer() {
        let mut b = GraphBuilder::new("vars");
        let plate = b.labware("p1", "Hotel", 0);
        let read = b.operation("measure", DeviceKind::PlateReader, secs(5), &["p1"]);
        let v = b.variable("od");
        b.connect(plate, read);
        // No producing edge yet.
        let _ = v;
        assert!(matches!(
            b.build().unwrap_err(),
            GraphError::VariableProducers { count: 0, .. }
        ));
    }

    #[test]
    fn test_topo_order_is_deterministic() {
        let mut b = GraphBuilder::new("topo");
        let plate = b.labware("p1", "Hotel", 0);
        let a = b.operation("a", DeviceKind::Incubator, secs(1), &["p1"]);
        let c = b.operation("c", DeviceKind::Incubator, secs(1), &["p1"]);
        b.connect(plate, a);
        b.connect(plate, c);
        let graph = b.build().expect("valid");
        let order = graph.topo_order();
        assert_eq!(order[0], NodeId(0));
        assert_eq!(order.len(), 3);
        // Same-rank nodes come out in id order.
        assert!(order[1] < order[2]);
    }

    #[test]
    fn test_constant_branch_collapses() {
        let mut b = GraphBuilder::new("const-branch");
        let plate = b.labware("p1", "Hotel", 0);
        let prep = b.operation("prep", DeviceKind::LiquidHandler, secs(5), &["p1"]);
        let branch = b.branch(
            "always",
            Predicate {
                lhs: Expr::Const { value: 1.0 },
                cmp: Cmp::Gt,
                rhs: Expr::Const { value: 0.0 },
            },
        );
        let yes = b.operation("kept", DeviceKind::Incubator, secs(10), &["p1"]);
        let no = b.operation("dropped", DeviceKind::Centrifuge, secs(10), &["p1"]);
        b.connect(plate, prep);
        b.connect(prep, branch);
        let e = b.connect(branch, yes);
        e.arm = Some(true);
        let e = b.connect(branch, no);
        e.arm = Some(false);
        let graph = b.build().expect("valid");

        let fcts: Vec<&str> = graph
            .nodes()
            .filter_map(|(_, n)| n.as_operation().map(|o| o.fct.as_str()))
            .collect();
        assert!(fcts.contains(&"kept"));
        assert!(!fcts.contains(&"dropped"));
        // prep now feeds the kept operation directly.
        let prep_id = graph
            .nodes()
            .find(|(_, n)| n.as_operation().is_some_and(|o| o.fct == "prep"))
            .unwrap()
            .0;
        assert!(graph
            .outgoing(prep_id)
            .any(|e| graph.node(e.to).as_operation().is_some_and(|o| o.fct == "kept")));
    }

    #[test]
    fn test_arm_exclusive_excludes_shared_nodes() {
        let mut b = GraphBuilder::new("shared");
        let plate = b.labware("p1", "Hotel", 0);
        let read = b.operation("measure", DeviceKind::PlateReader, secs(5), &["p1"]);
        let v = b.variable("od");
        let branch = b.branch(
            "check",
            Predicate {
                lhs: Expr::Value { node: v },
                cmp: Cmp::Gt,
                rhs: Expr::Const { value: 0.6 },
            },
        );
        let high = b.operation("dilute", DeviceKind::LiquidHandler, secs(8), &["p1"]);
        let low = b.operation("incubate", DeviceKind::Incubator, secs(60), &["p1"]);
        let store = b.operation("park", DeviceKind::Storage, secs(2), &["p1"]);
        b.connect(plate, read);
        b.connect(read, v);
        b.connect(v, branch);
        let e = b.connect(branch, high);
        e.arm = Some(true);
        let e = b.connect(branch, low);
        e.arm = Some(false);
        // Both arms converge on the shared park step.
        b.connect(high, store);
        b.connect(low, store);
        let graph = b.build().expect("valid");

        let branch_id = graph
            .nodes()
            .find(|(_, n)| matches!(n, Node::Branch { .. }))
            .unwrap()
            .0;
        let t = graph.arm_exclusive(branch_id, true);
        assert_eq!(t.len(), 1);
        assert!(graph.node(t[0]).as_operation().is_some_and(|o| o.fct == "dilute"));
        let f = graph.arm_exclusive(branch_id, false);
        assert_eq!(f.len(), 1);
        assert!(graph.node(f[0]).as_operation().is_some_and(|o| o.fct == "incubate"));
    }

    #[test]
    fn test_annotate_durations() {
        let mut b = GraphBuilder::new("annot");
        let plate = b.labware("p1", "Hotel", 0);
        let op = b.operation("incubate", DeviceKind::Incubator, secs(60), &["p1"]);
        b.connect(plate, op);
        let mut graph = b.build().expect("valid");
        graph.annotate_durations(|op| {
            (op.fct == "incubate").then(|| secs(90))
        });
        let (_, node) = graph
            .nodes()
            .find(|(_, n)| n.as_operation().is_some())
            .unwrap();
        assert_eq!(node.as_operation().unwrap().expected_duration, secs(90));
    }
}
