// verify.rs — Postcondition checks for a finished fusion run
//
// Re-derives the run's guarantees from the annotated graph and its report,
// independent of the bookkeeping the run used to reach them.
//
// Preconditions: `report` was produced by running fusion on `graph`.
// Postconditions: returns a certificate; nothing is modified.
// Failure modes: none (a cyclic graph fails every obligation).
// Side effects: none.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::config::FusionConfig;
use crate::graph::Graph;
use crate::id::NodeId;
use crate::pass::{required_stages, stage_names, Stage, StageCert};
use crate::reach::ConnectionMatrix;
use crate::report::FusionReport;

/// Machine-checkable evidence for fusion postconditions (F1-F6).
#[derive(Debug, Clone)]
pub struct FusionCert {
    /// F1: Contracting every group to one vertex leaves the graph acyclic.
    pub f1_acyclic_after_contraction: bool,
    /// F2: No group exceeds the member cap.
    pub f2_within_group_cap: bool,
    /// F3: No producer above the fan-out limit, or ruled unfusible, was fused.
    pub f3_no_rejected_producer_fused: bool,
    /// F4: Every path between two members of a group stays inside it.
    pub f4_groups_convex: bool,
    /// F5: Every reported member carries its group id and the pass marker.
    pub f5_groups_recorded: bool,
    /// F6: The run passed through every stage up to `Done`, in order.
    pub f6_stages_complete: bool,
}

impl StageCert for FusionCert {
    fn all_pass(&self) -> bool {
        self.f1_acyclic_after_contraction
            && self.f2_within_group_cap
            && self.f3_no_rejected_producer_fused
            && self.f4_groups_convex
            && self.f5_groups_recorded
            && self.f6_stages_complete
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("F1_acyclic_after_contraction", self.f1_acyclic_after_contraction),
            ("F2_within_group_cap", self.f2_within_group_cap),
            ("F3_no_rejected_producer_fused", self.f3_no_rejected_producer_fused),
            ("F4_groups_convex", self.f4_groups_convex),
            ("F5_groups_recorded", self.f5_groups_recorded),
            ("F6_stages_complete", self.f6_stages_complete),
        ]
    }
}

/// Verify fusion postconditions for the groups `report` lists.
pub fn verify_fusion(graph: &Graph, report: &FusionReport, config: &FusionConfig) -> FusionCert {
    let oracle = match ConnectionMatrix::build(graph) {
        Ok(oracle) => oracle,
        Err(_) => {
            return FusionCert {
                f1_acyclic_after_contraction: false,
                f2_within_group_cap: false,
                f3_no_rejected_producer_fused: false,
                f4_groups_convex: false,
                f5_groups_recorded: false,
                f6_stages_complete: false,
            }
        }
    };

    FusionCert {
        f1_acyclic_after_contraction: verify_f1_acyclic(graph, report),
        f2_within_group_cap: report
            .groups
            .iter()
            .all(|g| g.members.len() <= config.max_nodes_per_group),
        f3_no_rejected_producer_fused: verify_f3_producers(graph, report, config),
        f4_groups_convex: verify_f4_convex(graph, report, &oracle),
        f5_groups_recorded: verify_f5_recorded(graph, report, config),
        f6_stages_complete: report.stages == stage_names(&required_stages(Stage::Done)),
    }
}

/// F1: Kahn's algorithm over the contracted graph. Nodes outside any
/// reported group stay singleton vertices.
fn verify_f1_acyclic(graph: &Graph, report: &FusionReport) -> bool {
    let mut vertex: Vec<usize> = (0..graph.len()).collect();
    for (offset, group) in report.groups.iter().enumerate() {
        for &m in &group.members {
            vertex[m.index()] = graph.len() + offset;
        }
    }
    let count = graph.len() + report.groups.len();

    let mut adj: Vec<HashSet<usize>> = vec![HashSet::new(); count];
    for edge in graph.edges() {
        let (s, t) = (vertex[edge.source.index()], vertex[edge.target.index()]);
        if s != t {
            adj[s].insert(t);
        }
    }

    let mut in_degree = vec![0usize; count];
    for targets in &adj {
        for &t in targets {
            in_degree[t] += 1;
        }
    }
    // Unused vertex slots (grouped nodes) have no edges and sort trivially.
    let mut queue: VecDeque<usize> = (0..count).filter(|&v| in_degree[v] == 0).collect();
    let mut visited = 0usize;
    while let Some(v) = queue.pop_front() {
        visited += 1;
        for &t in &adj[v] {
            in_degree[t] -= 1;
            if in_degree[t] == 0 {
                queue.push_back(t);
            }
        }
    }
    visited == count
}

/// F3: every fusion event names a producer the infusibility analysis kept.
fn verify_f3_producers(graph: &Graph, report: &FusionReport, config: &FusionConfig) -> bool {
    let unfusible: HashSet<NodeId> = report.unfusible.iter().copied().collect();
    report.events.iter().all(|e| {
        graph.max_output_fanout(e.producer) <= config.max_branch_fanout
            && !unfusible.contains(&e.producer)
    })
}

/// F4: no node outside a group is both reached from and reaching the group.
fn verify_f4_convex(graph: &Graph, report: &FusionReport, oracle: &ConnectionMatrix) -> bool {
    for group in &report.groups {
        let members: HashSet<NodeId> = group.members.iter().copied().collect();
        for z in graph.nodes().iter().map(|n| n.id) {
            if members.contains(&z) {
                continue;
            }
            let from_group = group.members.iter().any(|&x| oracle.is_connected(x, z));
            let to_group = group.members.iter().any(|&y| oracle.is_connected(z, y));
            if from_group && to_group {
                return false;
            }
        }
    }
    true
}

/// F5: report and graph agree on membership.
fn verify_f5_recorded(graph: &Graph, report: &FusionReport, config: &FusionConfig) -> bool {
    let mut recorded: HashMap<i64, usize> = HashMap::new();
    for node in graph.nodes() {
        if let Some(gid) = node.group_id().filter(|&g| g > report.lower_bound) {
            *recorded.entry(gid).or_default() += 1;
        }
    }
    report.groups.iter().all(|group| {
        recorded.get(&group.id) == Some(&group.members.len())
            && group.members.iter().all(|&m| {
                let node = graph.node(m);
                node.group_id() == Some(group.id)
                    && node
                        .attrs
                        .as_ref()
                        .and_then(|a| a.fused_by.as_deref())
                        == Some(config.pass_name.as_str())
            })
    })
}
