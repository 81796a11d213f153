// Property-based tests for fusion invariants.
//
// Random DAGs (edges only run from lower to higher node ids) with a mix of
// elementwise and opaque nodes, data and control edges, run under random
// caps and duplication settings. Every run must satisfy the verification
// certificate, and a second run must not disturb groups the first one formed,
// whether it shares the first run's allocator or starts a fresh one.
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use abfc::config::ELEMWISE_PATTERN;
use abfc::pass::StageCert;
use abfc::verify::verify_fusion;
use abfc::{AutomaticBufferFusion, FusionConfig, Graph, Node, NodeId, ScopeAllocator};
use proptest::prelude::*;

// ── Graph generator ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct NodeShape {
    op: &'static str,
    elementwise: bool,
}

#[derive(Debug, Clone)]
struct GraphShape {
    nodes: Vec<NodeShape>,
    /// `(source, target, control)` with `source < target`.
    edges: Vec<(usize, usize, bool)>,
}

fn arb_node() -> impl Strategy<Value = NodeShape> {
    let op = prop_oneof![
        4 => Just("Add"),
        3 => Just("Relu"),
        2 => Just("Mul"),
        1 => Just("Cast"),
        1 => Just("AddN"),
        1 => Just("BNTrainingUpdateGrad"),
    ];
    (op, prop::bool::weighted(0.8)).prop_map(|(op, elementwise)| NodeShape { op, elementwise })
}

fn arb_graph() -> impl Strategy<Value = GraphShape> {
    (2usize..24)
        .prop_flat_map(|n| {
            let pairs = prop::collection::vec((0..n, 0..n, prop::bool::weighted(0.15)), 0..n * 2);
            (prop::collection::vec(arb_node(), n), pairs)
        })
        .prop_map(|(nodes, pairs)| {
            let edges = pairs
                .into_iter()
                .filter(|(a, b, _)| a != b)
                .map(|(a, b, control)| (a.min(b), a.max(b), control))
                .collect();
            GraphShape { nodes, edges }
        })
}

fn arb_config() -> impl Strategy<Value = FusionConfig> {
    (2usize..8, 1usize..5, prop::bool::ANY).prop_map(|(cap, fanout, dup)| FusionConfig {
        max_nodes_per_group: cap,
        max_branch_fanout: fanout,
        allow_duplication: dup,
        ..FusionConfig::default()
    })
}

fn build(shape: &GraphShape) -> Graph {
    let mut g = Graph::new();
    for node in &shape.nodes {
        let pattern = if node.elementwise { ELEMWISE_PATTERN } else { "OPAQUE" };
        g.add_node(Node::new(node.op).with_pattern(pattern));
    }
    for &(a, b, control) in &shape.edges {
        let (a, b) = (NodeId(a as u32), NodeId(b as u32));
        if control {
            g.add_control_edge(a, b);
        } else {
            g.add_edge(a, b);
        }
    }
    g
}

fn group_ids(graph: &Graph) -> Vec<Option<i64>> {
    graph.nodes().iter().map(|n| n.group_id()).collect()
}

// ── Properties ──────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn fusion_satisfies_certificate(shape in arb_graph(), config in arb_config()) {
        let mut g = build(&shape);
        let alloc = ScopeAllocator::new();
        let report = AutomaticBufferFusion::new(config.clone(), &alloc)
            .run(&mut g)
            .expect("generated graphs are acyclic");

        let cert = verify_fusion(&g, &report, &config);
        prop_assert!(cert.all_pass(), "failures: {:?}", cert.failures());

        for group in &report.groups {
            prop_assert!(group.members.len() >= 2);
            prop_assert!(group.members.len() <= config.max_nodes_per_group);
            for &m in &group.members {
                let node = g.node(m);
                prop_assert_eq!(node.pattern.as_deref(), Some(ELEMWISE_PATTERN));
                prop_assert!(!config.is_denied(&node.op));
            }
        }
    }

    #[test]
    fn second_run_leaves_earlier_groups_alone(shape in arb_graph(), config in arb_config()) {
        let mut g = build(&shape);
        let alloc = ScopeAllocator::new();
        AutomaticBufferFusion::new(config.clone(), &alloc)
            .run(&mut g)
            .expect("generated graphs are acyclic");
        let first = group_ids(&g);

        let report = AutomaticBufferFusion::new(config.clone(), &alloc)
            .run(&mut g)
            .expect("generated graphs are acyclic");
        let second = group_ids(&g);
        for (i, gid) in first.iter().enumerate() {
            if gid.is_some() {
                prop_assert_eq!(second[i], *gid, "node {} regrouped", i);
            }
        }
        for event in &report.events {
            prop_assert!(first[event.producer.index()].is_none());
            prop_assert!(first[event.consumer.index()].is_none());
        }
        let cert = verify_fusion(&g, &report, &config);
        prop_assert!(cert.all_pass(), "failures: {:?}", cert.failures());
    }

    #[test]
    fn rerun_with_fresh_allocator_keeps_groups_together(
        shape in arb_graph(),
        config in arb_config(),
    ) {
        let mut g = build(&shape);
        AutomaticBufferFusion::new(config.clone(), &ScopeAllocator::new())
            .run(&mut g)
            .expect("generated graphs are acyclic");
        let first = group_ids(&g);

        // Lower bound 0: every earlier group is live and fresh ids start at 1.
        let report = AutomaticBufferFusion::new(config.clone(), &ScopeAllocator::new())
            .run(&mut g)
            .expect("generated graphs are acyclic");
        let second = group_ids(&g);

        let cert = verify_fusion(&g, &report, &config);
        prop_assert!(cert.all_pass(), "failures: {:?}", cert.failures());
        for i in 0..first.len() {
            for j in 0..first.len() {
                if first[i].is_some() && first[i] == first[j] {
                    prop_assert_eq!(second[i], second[j], "nodes {} and {} split", i, j);
                }
            }
        }
        for group in &report.groups {
            prop_assert!(group.members.len() <= config.max_nodes_per_group);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 50,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    fn supplied_oracle_matches_built_one(shape in arb_graph()) {
        let config = FusionConfig::default();
        let mut built = build(&shape);
        let mut supplied = build(&shape);
        let oracle = abfc::reach::ConnectionMatrix::build(&supplied).expect("acyclic");

        let a = AutomaticBufferFusion::new(config.clone(), &ScopeAllocator::new())
            .run(&mut built)
            .expect("acyclic");
        let b = AutomaticBufferFusion::new(config, &ScopeAllocator::new())
            .with_oracle(oracle)
            .run(&mut supplied)
            .expect("acyclic");
        prop_assert_eq!(a.groups, b.groups);
        prop_assert_eq!(group_ids(&built), group_ids(&supplied));
    }
}
