// report.rs — Result of a fusion run
//
// Summarizes the groups a run formed, the individual producer→consumer
// fusions that built them, and any local rejections worth surfacing.
// Provenance hashes identify the input graph and configuration so a report
// can be matched to the exact inputs that produced it.

use std::fmt::{self, Write as _};

use serde::Serialize;

use crate::config::FusionConfig;
use crate::diag::{DiagLevel, Diagnostic};
use crate::error::Result;
use crate::graph::Graph;
use crate::id::NodeId;

/// One successful producer→consumer fusion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FusionEvent {
    pub producer: NodeId,
    pub consumer: NodeId,
    /// Group both nodes belong to right after the fusion.
    pub group: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FusedGroup {
    pub id: i64,
    /// Sorted by node id.
    pub members: Vec<NodeId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FusionStats {
    pub nodes: usize,
    pub unfusible: usize,
    pub needs_duplication: usize,
    pub groups: usize,
    pub fused_nodes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Provenance {
    pub graph_hash: String,
    pub config_hash: String,
    pub engine_version: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct FusionReport {
    pub pass_name: String,
    pub lower_bound: i64,
    /// Names of the stages the run passed through, in order.
    pub stages: Vec<&'static str>,
    /// Groups formed by this run (ids above the lower bound), by id.
    pub groups: Vec<FusedGroup>,
    pub events: Vec<FusionEvent>,
    pub unfusible: Vec<NodeId>,
    pub diagnostics: Vec<Diagnostic>,
    pub stats: FusionStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
}

impl FusionReport {
    pub fn group_of(&self, node: NodeId) -> Option<i64> {
        self.groups
            .iter()
            .find(|g| g.members.contains(&node))
            .map(|g| g.id)
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.level == DiagLevel::Error)
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = Some(provenance);
        self
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

// ── Provenance ──────────────────────────────────────────────────────────────

/// Hash the graph and configuration with SHA-256 over their compact JSON.
/// Call before the run when the hash should identify the unfused input.
pub fn compute_provenance(graph: &Graph, config: &FusionConfig) -> Result<Provenance> {
    Ok(Provenance {
        graph_hash: sha256_hex(serde_json::to_string(graph)?.as_bytes()),
        config_hash: sha256_hex(serde_json::to_string(config)?.as_bytes()),
        engine_version: env!("CARGO_PKG_VERSION"),
    })
}

fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    let digest = Sha256::digest(bytes);
    let mut s = String::with_capacity(64);
    for b in digest.iter() {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for FusionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "FusionReport '{}' (lower bound {}, {} groups, {} of {} nodes fused)",
            self.pass_name,
            self.lower_bound,
            self.stats.groups,
            self.stats.fused_nodes,
            self.stats.nodes
        )?;
        for group in &self.groups {
            writeln!(f, "  group {}: {}", group.id, join_ids(&group.members))?;
        }
        if !self.unfusible.is_empty() {
            writeln!(f, "  unfusible: {}", join_ids(&self.unfusible))?;
        }
        for diag in &self.diagnostics {
            writeln!(f, "  {diag}")?;
        }
        Ok(())
    }
}

fn join_ids(ids: &[NodeId]) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;

    fn sample() -> FusionReport {
        FusionReport {
            pass_name: "automatic_buffer_fusion".into(),
            lower_bound: 0,
            stages: Vec::new(),
            groups: vec![FusedGroup {
                id: 1,
                members: vec![NodeId(0), NodeId(1)],
            }],
            events: vec![FusionEvent {
                producer: NodeId(0),
                consumer: NodeId(1),
                group: 1,
            }],
            unfusible: vec![NodeId(2)],
            diagnostics: Vec::new(),
            stats: FusionStats {
                nodes: 3,
                unfusible: 1,
                needs_duplication: 0,
                groups: 1,
                fused_nodes: 2,
            },
            provenance: None,
        }
    }

    #[test]
    fn group_of_finds_membership() {
        let report = sample();
        assert_eq!(report.group_of(NodeId(1)), Some(1));
        assert_eq!(report.group_of(NodeId(2)), None);
        assert!(!report.has_errors());
    }

    #[test]
    fn display_lists_groups_and_unfusible() {
        assert_eq!(
            sample().to_string(),
            "FusionReport 'automatic_buffer_fusion' (lower bound 0, 1 groups, 2 of 3 nodes fused)\n\
             \x20 group 1: n0, n1\n\
             \x20 unfusible: n2\n"
        );
    }

    #[test]
    fn json_omits_missing_provenance() {
        let json = sample().to_json_pretty().unwrap();
        assert!(json.contains("\"lower_bound\": 0"));
        assert!(!json.contains("provenance"));
    }

    #[test]
    fn provenance_is_stable_and_input_sensitive() {
        let config = FusionConfig::default();
        let mut g = Graph::new();
        g.add_node(Node::new("Add"));
        let a = compute_provenance(&g, &config).unwrap();
        let b = compute_provenance(&g, &config).unwrap();
        assert_eq!(a.graph_hash, b.graph_hash);
        assert_eq!(a.graph_hash.len(), 64);

        g.add_node(Node::new("Mul"));
        let c = compute_provenance(&g, &config).unwrap();
        assert_ne!(a.graph_hash, c.graph_hash);
        assert_eq!(a.config_hash, c.config_hash);
    }
}
