// dot.rs — Graphviz DOT output for fused graphs
//
// Draws the dataflow graph with one cluster per fusion group so the result
// of a run can be inspected with `dot` or any other Graphviz layout engine.
//
// Preconditions: `graph` is a constructed Graph (fused or not).
// Postconditions: returns a valid DOT string representing the graph.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::collections::HashSet;
use std::fmt::Write;

use crate::graph::{EdgeKind, Graph, Node};
use crate::id::NodeId;
use crate::report::FusionReport;

/// Emit the graph as a Graphviz DOT string. When `report` is given, nodes
/// it lists as unfusible are drawn greyed out.
pub fn emit_dot(graph: &Graph, report: Option<&FusionReport>) -> String {
    let unfusible: HashSet<NodeId> = report
        .map(|r| r.unfusible.iter().copied().collect())
        .unwrap_or_default();

    let mut buf = String::new();
    writeln!(buf, "digraph fusion {{").unwrap();
    writeln!(buf, "    rankdir=TB;").unwrap();
    writeln!(buf, "    node [fontname=\"Helvetica\", fontsize=10];").unwrap();
    writeln!(buf, "    edge [fontname=\"Helvetica\", fontsize=9];").unwrap();

    let groups = graph.groups();
    let mut grouped: HashSet<NodeId> = HashSet::new();

    // BTreeMap keeps clusters in id order
    for (gid, members) in &groups {
        writeln!(buf).unwrap();
        writeln!(buf, "    subgraph cluster_group_{} {{", group_key(*gid)).unwrap();
        writeln!(buf, "        label=\"group {gid}\";").unwrap();
        writeln!(buf, "        style=rounded;").unwrap();
        writeln!(buf, "        color=gray50;").unwrap();
        for &id in members {
            grouped.insert(id);
            let attrs = node_attrs(graph.node(id), unfusible.contains(&id));
            writeln!(buf, "        {id} [{attrs}];").unwrap();
        }
        writeln!(buf, "    }}").unwrap();
    }

    writeln!(buf).unwrap();
    for node in graph.nodes() {
        if grouped.contains(&node.id) {
            continue;
        }
        let attrs = node_attrs(node, unfusible.contains(&node.id));
        writeln!(buf, "    {} [{attrs}];", node.id).unwrap();
    }

    writeln!(buf).unwrap();
    for edge in graph.edges() {
        match edge.kind {
            EdgeKind::Data => writeln!(buf, "    {} -> {};", edge.source, edge.target).unwrap(),
            EdgeKind::Control => writeln!(
                buf,
                "    {} -> {} [style=dashed, color=gray40];",
                edge.source, edge.target
            )
            .unwrap(),
        }
    }

    writeln!(buf, "}}").unwrap();
    buf
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// DOT-safe suffix for a group id (`-3` → `m3`).
fn group_key(gid: i64) -> String {
    if gid < 0 {
        format!("m{}", gid.unsigned_abs())
    } else {
        gid.to_string()
    }
}

/// Escape a label for use inside a quoted DOT string.
fn escape(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"")
}

fn node_attrs(node: &Node, unfusible: bool) -> String {
    let color = if unfusible {
        "gray85"
    } else if node.group_id().is_some() {
        "lightblue"
    } else {
        "white"
    };
    let label = format!("{}\\n{}", escape(&node.op), node.id);
    format!("shape=box, style=filled, fillcolor={color}, label=\"{label}\"")
}
