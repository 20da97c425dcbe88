//! Programmatic graph construction and the JSON interchange format.
//!
//! The external process parser turns user-authored source into a
//! [`GraphSpec`]; the core never executes the source itself. [`GraphBuilder`]
//! is the construction API behind both the interchange decoder and the test
//! suite.

use crate::core::{DeviceKind, NodeId, Params};
use crate::error::{LabError, LabResult};
use crate::graph::{Edge, GraphError, LabwareNode, Node, OperationNode, WorkflowGraph};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Incremental builder for a [`WorkflowGraph`].
pub struct GraphBuilder {
    name: String,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    /// Adds a labware entry with its starting position.
    pub fn labware(&mut self, container: &str, device: &str, slot: u32) -> NodeId {
        self.push(Node::Labware(LabwareNode {
            container: container.to_string(),
            device: device.to_string(),
            slot,
            lidded: false,
            labware_type: None,
            deep_well: false,
        }))
    }

    pub fn labware_with(&mut self, labware: LabwareNode) -> NodeId {
        self.push(Node::Labware(labware))
    }

    /// Adds a device operation.
    pub fn operation(
        &mut self,
        fct: &str,
        device_kind: DeviceKind,
        expected_duration: Duration,
        containers: &[&str],
    ) -> NodeId {
        self.push(Node::Operation(OperationNode {
            fct: fct.to_string(),
            device_kind,
            expected_duration,
            containers: containers.iter().map(|c| c.to_string()).collect(),
            params: Params::new(),
            is_movement: false,
        }))
    }

    pub fn operation_with(&mut self, operation: OperationNode) -> NodeId {
        self.push(Node::Operation(operation))
    }

    /// Adds a movement operation targeting a device kind.
    pub fn movement(
        &mut self,
        target_kind: DeviceKind,
        expected_duration: Duration,
        container: &str,
    ) -> NodeId {
        self.push(Node::Operation(OperationNode {
            fct: "move".to_string(),
            device_kind: target_kind,
            expected_duration,
            containers: vec![container.to_string()],
            params: Params::new(),
            is_movement: true,
        }))
    }

    pub fn variable(&mut self, name: &str) -> NodeId {
        self.push(Node::Variable {
            name: name.to_string(),
        })
    }

    pub fn computation(&mut self, name: &str, expr: crate::graph::Expr) -> NodeId {
        self.push(Node::Computation {
            name: name.to_string(),
            expr,
        })
    }

    pub fn branch(&mut self, name: &str, predicate: crate::graph::Predicate) -> NodeId {
        self.push(Node::Branch {
            name: name.to_string(),
            predicate,
        })
    }

    /// Mutable access to an operation added earlier, for parameter tweaks.
    pub fn operation_mut(&mut self, id: NodeId) -> Option<&mut OperationNode> {
        match self.nodes.get_mut(id.0 as usize) {
            Some(Node::Operation(op)) => Some(op),
            _ => None,
        }
    }

    /// Connects two nodes and returns the edge for constraint tweaks.
    pub fn connect(&mut self, from: NodeId, to: NodeId) -> &mut Edge {
        self.edges.push(Edge::plain(from, to));
        self.edges.last_mut().expect("edge just pushed")
    }

    /// Validates and freezes the graph.
    pub fn build(self) -> Result<WorkflowGraph, GraphError> {
        WorkflowGraph::assemble(self.name, self.nodes, self.edges)
    }
}

/// Wire format for one node of a graph spec.
///
/// Node references inside edge and expression specs are indices into the
/// `nodes` array, so two identical sources produce identical specs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeSpec {
    Labware {
        container: String,
        device: String,
        slot: u32,
        #[serde(default)]
        lidded: bool,
        #[serde(default)]
        labware_type: Option<String>,
        #[serde(default)]
        deep_well: bool,
    },
    Operation {
        fct: String,
        device_kind: DeviceKind,
        expected_duration_secs: f64,
        containers: Vec<String>,
        #[serde(default)]
        params: Params,
        #[serde(default)]
        is_movement: bool,
    },
    Variable {
        name: String,
    },
    Computation {
        name: String,
        expr: crate::graph::Expr,
    },
    Branch {
        name: String,
        predicate: crate::graph::Predicate,
    },
}

/// Wire format for one edge of a graph spec.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: u32,
    pub to: u32,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub min_wait_secs: Option<f64>,
    #[serde(default)]
    pub max_wait_secs: Option<f64>,
    #[serde(default)]
    pub wait_cost: f64,
    #[serde(default)]
    pub arm: Option<bool>,
}

/// The JSON interchange the external process parser emits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphSpec {
    pub name: String,
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
}

impl GraphSpec {
    /// Builds a validated graph, assigning node ids in spec order.
    pub fn into_graph(self, name_override: Option<&str>) -> Result<WorkflowGraph, GraphError> {
        let name = name_override.map(str::to_string).unwrap_or(self.name);
        let nodes = self
            .nodes
            .into_iter()
            .map(|spec| match spec {
                NodeSpec::Labware {
                    container,
                    device,
                    slot,
                    lidded,
                    labware_type,
                    deep_well,
                } => Node::Labware(LabwareNode {
                    container,
                    device,
                    slot,
                    lidded,
                    labware_type,
                    deep_well,
                }),
                NodeSpec::Operation {
                    fct,
                    device_kind,
                    expected_duration_secs,
                    containers,
                    params,
                    is_movement,
                } => Node::Operation(OperationNode {
                    fct,
                    device_kind,
                    expected_duration: Duration::from_secs_f64(expected_duration_secs.max(0.0)),
                    containers,
                    params,
                    is_movement,
                }),
                NodeSpec::Variable { name } => Node::Variable { name },
                NodeSpec::Computation { name, expr } => Node::Computation { name, expr },
                NodeSpec::Branch { name, predicate } => Node::Branch { name, predicate },
            })
            .collect();
        let edges = self
            .edges
            .into_iter()
            .map(|spec| Edge {
                from: NodeId(spec.from),
                to: NodeId(spec.to),
                container: spec.container,
                min_wait: spec.min_wait_secs.map(|s| Duration::from_secs_f64(s.max(0.0))),
                max_wait: spec.max_wait_secs.map(|s| Duration::from_secs_f64(s.max(0.0))),
                wait_cost: spec.wait_cost,
                arm: spec.arm,
            })
            .collect();
        WorkflowGraph::assemble(name, nodes, edges)
    }
}

/// External collaborator turning process source into a workflow graph.
///
/// The core hands the opaque source text to this trait and never executes
/// it. The built-in implementation decodes the JSON interchange.
pub trait ProcessParser: Send + Sync {
    fn parse(&self, source: &str, name: &str) -> LabResult<WorkflowGraph>;
}

/// Decoder for the [`GraphSpec`] JSON interchange.
pub struct GraphSpecParser;

impl ProcessParser for GraphSpecParser {
    fn parse(&self, source: &str, name: &str) -> LabResult<WorkflowGraph> {
        let spec: GraphSpec =
            serde_json::from_str(source).map_err(|e| LabError::Parse(e.to_string()))?;
        spec.into_graph(Some(name)).map_err(LabError::Graph)
    }
}
