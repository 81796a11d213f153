// graph.rs — Attributed dataflow multigraph consumed by the fusion engine
//
// Holds compute nodes, data and control edges, and the per-node attribute
// store the fusion engine annotates (group id, duplication flag, consumer
// bit-vector). The engine borrows the graph mutably for attribute writes
// only; it never adds or removes nodes or edges.
//
// Preconditions: edges reference nodes already added to the graph.
// Postconditions: `topological_order` returns every node exactly once, or
//                 `NotAcyclic` with the nodes stuck in a cycle.
// Failure modes: cycle → `FusionError::NotAcyclic`; malformed serialized
//                graph → `FusionError::InvalidGraph`.
// Side effects: none.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FusionError, Result};
use crate::id::{EdgeId, NodeId};

// ── Public types ────────────────────────────────────────────────────────────

/// Whether an edge carries a tensor or only an ordering dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Data,
    Control,
}

/// A directed edge `(source, source_port) → (target, target_port)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub source: NodeId,
    #[serde(default)]
    pub source_port: u32,
    pub target: NodeId,
    #[serde(default)]
    pub target_port: u32,
    #[serde(default = "default_edge_kind")]
    pub kind: EdgeKind,
}

fn default_edge_kind() -> EdgeKind {
    EdgeKind::Data
}

/// Mutable annotations written by fusion passes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeAttrs {
    /// Fusion group (scope) id; `None` means unassigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
    /// Name of the pass that grouped this node during its own run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fused_by: Option<String>,
    #[serde(default)]
    pub needs_duplication: bool,
    /// One bit per distinct data consumer, in `Graph::data_consumers` order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consumer_fusible: Vec<bool>,
}

/// A compute node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub op: String,
    /// Capability pattern reported by the op-info layer (e.g. `ELEMWISE`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Kernel produced by the same code generator as fused kernels.
    #[serde(default = "default_true")]
    pub native_backend: bool,
    #[serde(default)]
    pub dynamic_shape_unsupported: bool,
    /// Set when the node was sliced for a different threading scheme.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_scope_id: Option<i64>,
    /// Marker left by a different, named optimization pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_pass: Option<String>,
    /// `None` when the node cannot carry annotations.
    #[serde(default = "default_attrs")]
    pub attrs: Option<NodeAttrs>,
}

fn default_true() -> bool {
    true
}

fn default_attrs() -> Option<NodeAttrs> {
    Some(NodeAttrs::default())
}

impl Node {
    /// A node of the given op kind with an empty attribute store.
    /// The id is assigned by `Graph::add_node`.
    pub fn new(op: impl Into<String>) -> Self {
        Node {
            id: NodeId(0),
            op: op.into(),
            pattern: None,
            native_backend: true,
            dynamic_shape_unsupported: false,
            thread_scope_id: None,
            matched_pass: None,
            attrs: default_attrs(),
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn on_foreign_backend(mut self) -> Self {
        self.native_backend = false;
        self
    }

    pub fn with_dynamic_shape_unsupported(mut self) -> Self {
        self.dynamic_shape_unsupported = true;
        self
    }

    pub fn with_thread_scope(mut self, id: i64) -> Self {
        self.thread_scope_id = Some(id);
        self
    }

    pub fn claimed_by(mut self, pass: impl Into<String>) -> Self {
        self.matched_pass = Some(pass.into());
        self
    }

    pub fn with_group(mut self, id: i64) -> Self {
        self.attrs.get_or_insert_with(NodeAttrs::default).group_id = Some(id);
        self
    }

    pub fn without_attrs(mut self) -> Self {
        self.attrs = None;
        self
    }

    pub fn group_id(&self) -> Option<i64> {
        self.attrs.as_ref().and_then(|a| a.group_id)
    }
}

/// Dataflow graph. Node and edge ids are positions in their vectors.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    /// Per node: incoming edges ordered by target port.
    inputs: Vec<Vec<EdgeId>>,
    /// Per node: outgoing edges ordered by source port.
    outputs: Vec<Vec<EdgeId>>,
}

// ── Construction ────────────────────────────────────────────────────────────

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, mut node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        node.id = id;
        self.nodes.push(node);
        self.inputs.push(Vec::new());
        self.outputs.push(Vec::new());
        id
    }

    /// Data edge from output 0 of `source` to the next free input of `target`.
    pub fn add_edge(&mut self, source: NodeId, target: NodeId) -> EdgeId {
        let port = self.data_input_count(target) as u32;
        self.add_data_edge(source, 0, target, port)
    }

    pub fn add_data_edge(
        &mut self,
        source: NodeId,
        source_port: u32,
        target: NodeId,
        target_port: u32,
    ) -> EdgeId {
        self.push_edge(source, source_port, target, target_port, EdgeKind::Data)
    }

    pub fn add_control_edge(&mut self, source: NodeId, target: NodeId) -> EdgeId {
        self.push_edge(source, u32::MAX, target, u32::MAX, EdgeKind::Control)
    }

    fn push_edge(
        &mut self,
        source: NodeId,
        source_port: u32,
        target: NodeId,
        target_port: u32,
        kind: EdgeKind,
    ) -> EdgeId {
        debug_assert!(source.index() < self.nodes.len(), "unknown source {source}");
        debug_assert!(target.index() < self.nodes.len(), "unknown target {target}");
        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(Edge {
            id,
            source,
            source_port,
            target,
            target_port,
            kind,
        });
        self.index_edge(id);
        id
    }

    /// Insert an edge into the port-ordered adjacency lists. Edges on the
    /// same port keep insertion order.
    fn index_edge(&mut self, id: EdgeId) {
        let (source, source_port, target, target_port) = {
            let e = &self.edges[id.index()];
            (e.source, e.source_port, e.target, e.target_port)
        };
        let edges = &self.edges;
        let ins = &mut self.inputs[target.index()];
        let pos = ins.partition_point(|e| edges[e.index()].target_port <= target_port);
        ins.insert(pos, id);
        let outs = &mut self.outputs[source.index()];
        let pos = outs.partition_point(|e| edges[e.index()].source_port <= source_port);
        outs.insert(pos, id);
    }

    /// Rebuild a graph from serialized parts. Node and edge ids must be dense
    /// and in order; edges must reference existing nodes.
    pub fn from_parts(nodes: Vec<Node>, edges: Vec<Edge>) -> Result<Self> {
        for (i, node) in nodes.iter().enumerate() {
            if node.id.index() != i {
                return Err(FusionError::InvalidGraph(format!(
                    "node at position {i} has id {}",
                    node.id
                )));
            }
        }
        let mut graph = Graph {
            inputs: vec![Vec::new(); nodes.len()],
            outputs: vec![Vec::new(); nodes.len()],
            nodes,
            edges: Vec::with_capacity(edges.len()),
        };
        for (i, edge) in edges.into_iter().enumerate() {
            if edge.id.index() != i {
                return Err(FusionError::InvalidGraph(format!(
                    "edge at position {i} has id {}",
                    edge.id
                )));
            }
            for end in [edge.source, edge.target] {
                if end.index() >= graph.nodes.len() {
                    return Err(FusionError::InvalidGraph(format!(
                        "edge {} references unknown node {end}",
                        edge.id
                    )));
                }
            }
            let id = edge.id;
            graph.edges.push(edge);
            graph.index_edge(id);
        }
        Ok(graph)
    }
}

// ── Queries ─────────────────────────────────────────────────────────────────

impl Graph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id.index()]
    }

    /// Incoming edges ordered by input index.
    pub fn inputs(&self, id: NodeId) -> impl Iterator<Item = &Edge> + '_ {
        self.inputs[id.index()].iter().map(|e| &self.edges[e.index()])
    }

    /// Outgoing edges ordered by output index.
    pub fn outputs(&self, id: NodeId) -> impl Iterator<Item = &Edge> + '_ {
        self.outputs[id.index()].iter().map(|e| &self.edges[e.index()])
    }

    pub fn data_input_count(&self, id: NodeId) -> usize {
        self.inputs(id).filter(|e| e.kind == EdgeKind::Data).count()
    }

    /// Distinct data producers of `id`, in input order.
    pub fn operands(&self, id: NodeId) -> Vec<NodeId> {
        distinct(
            self.inputs(id)
                .filter(|e| e.kind == EdgeKind::Data)
                .map(|e| e.source),
        )
    }

    /// Distinct producers over data and control edges, in input order.
    pub fn predecessors(&self, id: NodeId) -> Vec<NodeId> {
        distinct(self.inputs(id).map(|e| e.source))
    }

    /// Distinct data consumers of `id`, in output-then-consumer order.
    pub fn data_consumers(&self, id: NodeId) -> Vec<NodeId> {
        distinct(
            self.outputs(id)
                .filter(|e| e.kind == EdgeKind::Data)
                .map(|e| e.target),
        )
    }

    /// Distinct consumers over data and control edges.
    pub fn successors(&self, id: NodeId) -> Vec<NodeId> {
        distinct(self.outputs(id).map(|e| e.target))
    }

    /// Largest number of distinct consumers attached to a single output.
    pub fn max_output_fanout(&self, id: NodeId) -> usize {
        let mut per_port: BTreeMap<u32, HashSet<NodeId>> = BTreeMap::new();
        for e in self.outputs(id).filter(|e| e.kind == EdgeKind::Data) {
            per_port.entry(e.source_port).or_default().insert(e.target);
        }
        per_port.values().map(HashSet::len).max().unwrap_or(0)
    }

    /// Members of every group, keyed by group id. Members are sorted by id.
    pub fn groups(&self) -> BTreeMap<i64, Vec<NodeId>> {
        let mut groups: BTreeMap<i64, Vec<NodeId>> = BTreeMap::new();
        for node in &self.nodes {
            if let Some(gid) = node.group_id().filter(|&g| g != crate::scope::NO_GROUP) {
                groups.entry(gid).or_default().push(node.id);
            }
        }
        groups
    }

    // ── Topological sort (Kahn's algorithm) ─────────────────────────────

    /// Producers before consumers, over data and control edges. Ties are
    /// broken by node id so the order is deterministic.
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        let mut in_degree: Vec<u32> = vec![0; self.nodes.len()];
        for edge in &self.edges {
            in_degree[edge.target.index()] += 1;
        }

        let mut queue: VecDeque<NodeId> = self
            .nodes
            .iter()
            .map(|n| n.id)
            .filter(|id| in_degree[id.index()] == 0)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node_id) = queue.pop_front() {
            order.push(node_id);
            let mut next: Vec<NodeId> = self.outputs(node_id).map(|e| e.target).collect();
            next.sort();
            for target in next {
                let deg = &mut in_degree[target.index()];
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(target);
                }
            }
        }

        if order.len() < self.nodes.len() {
            let stuck = self
                .nodes
                .iter()
                .map(|n| n.id)
                .filter(|id| in_degree[id.index()] > 0)
                .collect();
            return Err(FusionError::NotAcyclic { stuck });
        }
        Ok(order)
    }
}

fn distinct(ids: impl Iterator<Item = NodeId>) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(*id)).collect()
}

// ── Serialization ───────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct GraphData {
    nodes: Vec<Node>,
    #[serde(default)]
    edges: Vec<Edge>,
}

impl Serialize for Graph {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct GraphRef<'a> {
            nodes: &'a [Node],
            edges: &'a [Edge],
        }
        GraphRef {
            nodes: &self.nodes,
            edges: &self.edges,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Graph {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let data = GraphData::deserialize(deserializer)?;
        Graph::from_parts(data.nodes, data.edges).map_err(serde::de::Error::custom)
    }
}

impl Graph {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let control = self
            .edges
            .iter()
            .filter(|e| e.kind == EdgeKind::Control)
            .count();
        writeln!(
            f,
            "Graph ({} nodes, {} data edges, {} control edges)",
            self.nodes.len(),
            self.edges.len() - control,
            control
        )?;
        for node in &self.nodes {
            write!(f, "  {} {}", node.id, node.op)?;
            if let Some(pattern) = &node.pattern {
                write!(f, " [{pattern}]")?;
            }
            if let Some(gid) = node.group_id() {
                write!(f, " group={gid}")?;
            }
            let operands = self.operands(node.id);
            if !operands.is_empty() {
                let names: Vec<String> = operands.iter().map(|o| o.to_string()).collect();
                write!(f, " <- {}", names.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
