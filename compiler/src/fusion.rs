// fusion.rs — Automatic buffer fusion
//
// Greedily grows fusion groups from the sinks of a dataflow graph upward.
// Each consumer, visited in reverse topological order, tries to absorb its
// direct producers. A producer is absorbed only when:
//   - it is fusible and was not ruled out by the infusibility analysis,
//   - every node on every path between it and the consumer is fusible,
//   - contracting the two groups would not create a cycle,
//   - the merged group stays within the member cap.
//
// Preconditions: `graph` is acyclic; its nodes carry the attributes the
//                predicate reads.
// Postconditions: nodes fused by this run carry a group id above the run's
//                 lower bound and the pass marker; groups are acyclic after
//                 contraction and no larger than `max_nodes_per_group`.
// Failure modes: cycle → `NotAcyclic`; supplied oracle of the wrong size →
//                `OracleMismatch`. All other rejections are local.
// Side effects: writes node attributes; allocates group ids.

use std::collections::{BTreeMap, HashMap, HashSet};

use fixedbitset::FixedBitSet;
use tracing::{debug, info, trace};

use crate::config::FusionConfig;
use crate::diag::{codes, DiagLevel, Diagnostic};
use crate::error::{FusionError, Result};
use crate::graph::Graph;
use crate::id::NodeId;
use crate::pass::{can_advance, stage_names, Stage};
use crate::predicate::FusionPredicate;
use crate::reach::ConnectionMatrix;
use crate::report::{FusedGroup, FusionEvent, FusionReport, FusionStats};
use crate::scope::{group_id_or_sentinel, set_group_id, ScopeAllocator, NO_GROUP};

// ── Public entry point ──────────────────────────────────────────────────────

pub struct AutomaticBufferFusion<'a> {
    config: FusionConfig,
    allocator: &'a ScopeAllocator,
    oracle: Option<ConnectionMatrix>,
}

impl<'a> AutomaticBufferFusion<'a> {
    pub fn new(config: FusionConfig, allocator: &'a ScopeAllocator) -> Self {
        AutomaticBufferFusion {
            config,
            allocator,
            oracle: None,
        }
    }

    /// Use a prebuilt oracle instead of building one per run.
    pub fn with_oracle(mut self, oracle: ConnectionMatrix) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Fuse `graph` in place and report what was formed.
    #[tracing::instrument(skip_all, fields(nodes = graph.len()))]
    pub fn run(&self, graph: &mut Graph) -> Result<FusionReport> {
        let mut stages = vec![Stage::Init];

        let order = match graph.topological_order() {
            Ok(order) => order,
            Err(err) => {
                advance(&mut stages, Stage::Failed);
                return Err(err);
            }
        };
        let lower_bound = self.allocator.current_positive();
        debug!(lower_bound, "scope lower bound captured");

        let built;
        let oracle = match &self.oracle {
            Some(oracle) if oracle.len() != graph.len() => {
                advance(&mut stages, Stage::Failed);
                return Err(FusionError::OracleMismatch {
                    oracle: oracle.len(),
                    graph: graph.len(),
                });
            }
            Some(oracle) => oracle,
            None => {
                built = ConnectionMatrix::build_with_order(graph, &order);
                &built
            }
        };
        advance(&mut stages, Stage::MatrixReady);

        let mut run = FusionRun::new(graph, &self.config, self.allocator, oracle, lower_bound);
        run.compute_all_unfusible_nodes(&order);
        advance(&mut stages, Stage::InfusibilityComputed);

        advance(&mut stages, Stage::Growing);
        for &consumer in order.iter().rev() {
            if !run.fusible[consumer.index()] {
                continue;
            }
            if run.is_finalized(run.scope_of(consumer)) {
                continue;
            }
            run.fuse_one_producer(consumer);
        }

        run.mark_fused_nodes();
        advance(&mut stages, Stage::Done);

        let report = run.into_report(&stages);
        info!(
            groups = report.stats.groups,
            fused = report.stats.fused_nodes,
            unfusible = report.stats.unfusible,
            "automatic buffer fusion complete"
        );
        Ok(report)
    }
}

fn advance(stages: &mut Vec<Stage>, next: Stage) {
    let from = stages.last().copied().unwrap_or(Stage::Init);
    debug_assert!(
        can_advance(from, next),
        "illegal stage transition {:?} -> {:?}",
        from,
        next
    );
    trace!(from = ?from, to = ?next, "stage transition");
    stages.push(next);
}

// ── Internal context ────────────────────────────────────────────────────────

struct FusionRun<'r> {
    graph: &'r mut Graph,
    config: &'r FusionConfig,
    allocator: &'r ScopeAllocator,
    oracle: &'r ConnectionMatrix,
    lower_bound: i64,
    /// Predicate result per node. Group ids written during the run are all
    /// above the lower bound, so the predicate cannot change mid-run.
    fusible: Vec<bool>,
    unfusible: FixedBitSet,
    /// `(producer, consumer)` → all paths between them are fusible.
    memo: HashMap<(NodeId, NodeId), bool>,
    /// Current members of every group, including finalized ones.
    members: BTreeMap<i64, Vec<NodeId>>,
    events: Vec<FusionEvent>,
    diagnostics: Vec<Diagnostic>,
}

/// One pending node in the all-paths walk.
struct PathFrame {
    node: NodeId,
    preds: Vec<NodeId>,
    next: usize,
}

impl<'r> FusionRun<'r> {
    fn new(
        graph: &'r mut Graph,
        config: &'r FusionConfig,
        allocator: &'r ScopeAllocator,
        oracle: &'r ConnectionMatrix,
        lower_bound: i64,
    ) -> Self {
        let n = graph.len();
        let predicate = FusionPredicate::new(config, lower_bound);
        let mut fusible = Vec::with_capacity(n);
        let mut diagnostics = Vec::new();
        let mut members: BTreeMap<i64, Vec<NodeId>> = BTreeMap::new();

        let view: &Graph = graph;
        for node in view.nodes() {
            match predicate.check(view, node.id) {
                Ok(_) => fusible.push(true),
                Err(rejection) => {
                    trace!(node = %node.id, op = %node.op, %rejection, "not fusible");
                    if rejection.is_missing_attribute() {
                        let err = FusionError::NodeAttributeMissing {
                            node: node.id,
                            attr: if node.attrs.is_none() {
                                "attribute store"
                            } else {
                                "pattern"
                            },
                        };
                        diagnostics.push(Diagnostic::from_local(codes::W0101, node.id, &err));
                    }
                    fusible.push(false);
                }
            }
            let gid = group_id_or_sentinel(node);
            if gid != NO_GROUP {
                members.entry(gid).or_default().push(node.id);
            }
        }

        FusionRun {
            graph,
            config,
            allocator,
            oracle,
            lower_bound,
            fusible,
            unfusible: FixedBitSet::with_capacity(n),
            memo: HashMap::new(),
            members,
            events: Vec::new(),
            diagnostics,
        }
    }

    fn scope_of(&self, node: NodeId) -> i64 {
        group_id_or_sentinel(self.graph.node(node))
    }

    /// A valid group id at or below the lower bound belongs to an earlier pass.
    fn is_finalized(&self, scope: i64) -> bool {
        scope != NO_GROUP && scope <= self.lower_bound
    }

    fn is_unfusible(&self, node: NodeId) -> bool {
        self.unfusible.contains(node.index())
    }

    // ── Infusibility analysis ───────────────────────────────────────────

    /// Walk producers after all their consumers and decide which producers
    /// may ever be absorbed into a consumer's group.
    fn compute_all_unfusible_nodes(&mut self, order: &[NodeId]) {
        for &producer in order.iter().rev() {
            if !self.fusible[producer.index()] {
                self.unfusible.insert(producer.index());
                continue;
            }

            let fanout = self.graph.max_output_fanout(producer);
            if fanout > self.config.max_branch_fanout {
                trace!(node = %producer, fanout, "fan-out above limit");
                self.unfusible.insert(producer.index());
                continue;
            }

            let consumers = self.graph.data_consumers(producer);
            let mut bits = Vec::with_capacity(consumers.len());
            let mut fusible_count = 0usize;
            let mut needs_duplication = false;
            let mut rejected = false;

            for &consumer in &consumers {
                let ok = self.able_to_fuse_on_all_paths(producer, consumer);
                bits.push(ok);
                if ok {
                    fusible_count += 1;
                    continue;
                }
                needs_duplication = true;
                let op = &self.graph.node(producer).op;
                if !self.config.allow_duplication && !self.config.is_duplication_exempt(op) {
                    let err = FusionError::DuplicationDisallowed {
                        node: producer,
                        op: op.clone(),
                    };
                    self.diagnostics.push(
                        Diagnostic::from_local(codes::W0102, producer, &err)
                            .with_related(consumer, "consumer that cannot be fused")
                            .with_hint(format!(
                                "enable allow_duplication or add '{}' to duplication_exempt_ops",
                                op
                            )),
                    );
                    self.unfusible.insert(producer.index());
                    rejected = true;
                    break;
                }
            }

            if !rejected
                && self.config.allow_duplication
                && needs_duplication
                && fusible_count <= self.config.duplication_threshold
            {
                trace!(node = %producer, fusible_count, "duplication not worth it");
                self.unfusible.insert(producer.index());
            }

            if let Some(attrs) = self.graph.node_mut(producer).attrs.as_mut() {
                attrs.needs_duplication = needs_duplication;
                attrs.consumer_fusible = bits;
            }
        }
        debug!(unfusible = self.unfusible.count_ones(..), "infusibility computed");
    }

    /// Result for `node` known without walking its predecessors.
    fn settled(&self, producer: NodeId, node: NodeId) -> Option<bool> {
        if node == producer {
            return Some(true);
        }
        if let Some(&v) = self.memo.get(&(producer, node)) {
            return Some(v);
        }
        if !self.fusible[node.index()] {
            return Some(false);
        }
        None
    }

    /// True when every node between `producer` and `consumer`, on every
    /// path, is fusible and not ruled out. Uses an explicit stack so deep
    /// graphs cannot overflow the call stack.
    fn able_to_fuse_on_all_paths(&mut self, producer: NodeId, consumer: NodeId) -> bool {
        if let Some(v) = self.settled(producer, consumer) {
            return v;
        }

        let mut stack = vec![PathFrame {
            node: consumer,
            preds: self.graph.predecessors(consumer),
            next: 0,
        }];
        let mut child: Option<bool> = None;
        let mut result = true;

        while let Some(frame) = stack.last_mut() {
            let node = frame.node;
            let mut verdict = match child.take() {
                Some(false) => Some(false),
                _ => None,
            };
            let mut descend = None;

            if verdict.is_none() {
                while frame.next < frame.preds.len() {
                    let operand = frame.preds[frame.next];
                    frame.next += 1;
                    // Operands off every producer path do not matter.
                    if !self.oracle.is_connected(producer, operand) {
                        continue;
                    }
                    if self.is_unfusible(operand) {
                        verdict = Some(false);
                        break;
                    }
                    match self.settled(producer, operand) {
                        Some(true) => continue,
                        Some(false) => {
                            verdict = Some(false);
                            break;
                        }
                        None => {
                            descend = Some(operand);
                            break;
                        }
                    }
                }
            }

            if let Some(next) = descend {
                let preds = self.graph.predecessors(next);
                stack.push(PathFrame {
                    node: next,
                    preds,
                    next: 0,
                });
                continue;
            }

            let v = verdict.unwrap_or(true);
            stack.pop();
            self.memo.insert((producer, node), v);
            result = v;
            child = Some(v);
        }

        result
    }

    // ── Group growth ────────────────────────────────────────────────────

    fn fuse_one_producer(&mut self, consumer: NodeId) {
        if self.is_finalized(self.scope_of(consumer)) {
            return;
        }

        for producer in self.graph.operands(consumer) {
            if !self.fusible[producer.index()] {
                continue;
            }
            let producer_scope = self.scope_of(producer);
            if self.is_finalized(producer_scope) {
                continue;
            }
            if self.is_unfusible(producer) {
                continue;
            }
            let consumer_scope = self.scope_of(consumer);
            if producer_scope != NO_GROUP && producer_scope == consumer_scope {
                continue;
            }
            if self.check_loop_exist_after_fusion(
                producer,
                consumer,
                producer_scope,
                consumer_scope,
            ) {
                trace!(%producer, %consumer, "fusion would create a cycle");
                continue;
            }
            if !self.check_consumer_fusible_with_producer(producer, consumer) {
                continue;
            }
            match self.fuse_two_nodes(producer, consumer, producer_scope, consumer_scope) {
                Ok(group) => {
                    trace!(%producer, %consumer, group, "fused");
                    self.events.push(FusionEvent {
                        producer,
                        consumer,
                        group,
                    });
                }
                Err(err) => {
                    debug!(%producer, %consumer, %err, "merge abandoned");
                    self.diagnostics.push(
                        Diagnostic::from_local(codes::W0100, consumer, &err)
                            .with_related(producer, "producer left unfused")
                            .with_hint("raise max_nodes_per_group to allow larger groups"),
                    );
                    break;
                }
            }
        }
    }

    /// Members of `scope`, or just `node` when it has no group.
    fn members_of(&self, node: NodeId, scope: i64) -> Vec<NodeId> {
        if scope == NO_GROUP {
            return vec![node];
        }
        self.members.get(&scope).cloned().unwrap_or_else(|| vec![node])
    }

    /// Whether contracting the producer's and consumer's groups into one
    /// vertex would close a cycle through some node outside both.
    fn check_loop_exist_after_fusion(
        &self,
        producer: NodeId,
        consumer: NodeId,
        producer_scope: i64,
        consumer_scope: i64,
    ) -> bool {
        if consumer_scope == NO_GROUP && self.is_unfusible(producer) {
            return true;
        }

        let producer_members = self.members_of(producer, producer_scope);
        let consumer_members = self.members_of(consumer, consumer_scope);
        let merged: HashSet<NodeId> = producer_members
            .iter()
            .chain(consumer_members.iter())
            .copied()
            .collect();

        for &member in &producer_members {
            for succ in self.graph.successors(member) {
                if merged.contains(&succ) {
                    continue;
                }
                if self.check_path_exists(succ, &consumer_members) {
                    return true;
                }
            }
        }
        false
    }

    /// Whether `node` reaches any of `targets`. The oracle only knows the
    /// original graph, so reachability is closed over the membership index:
    /// touching one member of a group reaches everything its members reach.
    fn check_path_exists(&self, node: NodeId, targets: &[NodeId]) -> bool {
        let mut reached = self.oracle.reachable_from(node).clone();
        reached.insert(node.index());
        let mut expanded: HashSet<i64> = HashSet::new();

        loop {
            if targets.iter().any(|t| reached.contains(t.index())) {
                return true;
            }
            let mut grew = false;
            for (&gid, members) in &self.members {
                if expanded.contains(&gid) || !members.iter().any(|m| reached.contains(m.index())) {
                    continue;
                }
                expanded.insert(gid);
                for m in members {
                    reached.insert(m.index());
                    reached.union_with(self.oracle.reachable_from(*m));
                }
                grew = true;
            }
            if !grew {
                return false;
            }
        }
    }

    /// Look up the consumer's bit in the producer's precomputed vector.
    fn check_consumer_fusible_with_producer(&self, producer: NodeId, consumer: NodeId) -> bool {
        let Some(attrs) = self.graph.node(producer).attrs.as_ref() else {
            return false;
        };
        self.graph
            .data_consumers(producer)
            .iter()
            .position(|&c| c == consumer)
            .and_then(|pos| attrs.consumer_fusible.get(pos).copied())
            .unwrap_or(false)
    }

    fn fuse_two_nodes(
        &mut self,
        producer: NodeId,
        consumer: NodeId,
        producer_scope: i64,
        consumer_scope: i64,
    ) -> Result<i64> {
        if producer_scope == NO_GROUP && consumer_scope == NO_GROUP {
            let id = self.fresh_group_id();
            debug!(group = id, %producer, %consumer, "new group");
            self.assign(producer, id);
            self.assign(consumer, id);
            return Ok(id);
        }
        if producer_scope == NO_GROUP {
            self.ensure_capacity(consumer_scope, 1)?;
            self.assign(producer, consumer_scope);
            return Ok(consumer_scope);
        }
        if consumer_scope == NO_GROUP {
            self.ensure_capacity(producer_scope, 1)?;
            self.assign(consumer, producer_scope);
            return Ok(producer_scope);
        }
        if producer_scope != consumer_scope {
            self.change_scope_id(consumer_scope, producer_scope)?;
        }
        Ok(producer_scope)
    }

    /// Next allocator id not already held by a live group. Input graphs may
    /// carry ids above the lower bound that this allocator never handed out.
    fn fresh_group_id(&self) -> i64 {
        loop {
            let id = self.allocator.allocate_positive_id();
            if !self.members.contains_key(&id) {
                return id;
            }
            trace!(group = id, "allocated id already in use, skipping");
        }
    }

    fn group_len(&self, scope: i64) -> usize {
        self.members.get(&scope).map_or(0, Vec::len)
    }

    fn ensure_capacity(&self, scope: i64, extra: usize) -> Result<()> {
        let size = self.group_len(scope) + extra;
        if size > self.config.max_nodes_per_group {
            return Err(FusionError::GroupCapacityExceeded {
                group: scope,
                size,
                limit: self.config.max_nodes_per_group,
            });
        }
        Ok(())
    }

    /// Move every member of `old` into `new`, refusing when the merged group
    /// would exceed the cap.
    fn change_scope_id(&mut self, old: i64, new: i64) -> Result<()> {
        self.ensure_capacity(new, self.group_len(old))?;
        let moved = self.members.remove(&old).unwrap_or_default();
        debug!(from = old, to = new, moved = moved.len(), "groups merged");
        for &node in &moved {
            self.write_group_id(node, new);
        }
        self.members.entry(new).or_default().extend(moved);
        Ok(())
    }

    fn assign(&mut self, node: NodeId, scope: i64) {
        self.write_group_id(node, scope);
        self.members.entry(scope).or_default().push(node);
    }

    fn write_group_id(&mut self, node: NodeId, scope: i64) {
        if !set_group_id(self.graph.node_mut(node), scope) {
            self.diagnostics.push(
                Diagnostic::new(
                    DiagLevel::Error,
                    Some(node),
                    format!("cannot record group {scope}: node has no attribute store"),
                )
                .with_code(codes::E0100),
            );
        }
    }

    // ── Finish ──────────────────────────────────────────────────────────

    fn mark_fused_nodes(&mut self) {
        let lower_bound = self.lower_bound;
        let pass_name = &self.config.pass_name;
        for id in 0..self.graph.len() {
            let node = self.graph.node_mut(NodeId(id as u32));
            if let Some(attrs) = node.attrs.as_mut() {
                if attrs.group_id.is_some_and(|g| g > lower_bound) {
                    attrs.fused_by = Some(pass_name.clone());
                }
            }
        }
    }

    fn into_report(self, stages: &[Stage]) -> FusionReport {
        let groups: Vec<FusedGroup> = self
            .members
            .iter()
            .filter(|&(&gid, members)| gid > self.lower_bound && !members.is_empty())
            .map(|(&id, members)| {
                let mut members = members.clone();
                members.sort();
                FusedGroup { id, members }
            })
            .collect();
        let unfusible: Vec<NodeId> = self.unfusible.ones().map(|i| NodeId(i as u32)).collect();
        let needs_duplication = self
            .graph
            .nodes()
            .iter()
            .filter(|n| n.attrs.as_ref().is_some_and(|a| a.needs_duplication))
            .count();

        FusionReport {
            pass_name: self.config.pass_name.clone(),
            lower_bound: self.lower_bound,
            stages: stage_names(stages),
            stats: FusionStats {
                nodes: self.graph.len(),
                unfusible: unfusible.len(),
                needs_duplication,
                groups: groups.len(),
                fused_nodes: groups.iter().map(|g| g.members.len()).sum(),
            },
            groups,
            events: self.events,
            unfusible,
            diagnostics: self.diagnostics,
            provenance: None,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ELEMWISE_PATTERN;
    use crate::graph::Node;

    fn ew(op: &str) -> Node {
        Node::new(op).with_pattern(ELEMWISE_PATTERN)
    }

    fn run_default(g: &mut Graph) -> FusionReport {
        let alloc = ScopeAllocator::new();
        AutomaticBufferFusion::new(FusionConfig::default(), &alloc)
            .run(g)
            .unwrap()
    }

    #[test]
    fn two_node_chain_forms_one_group() {
        let mut g = Graph::new();
        let a = g.add_node(ew("Add"));
        let b = g.add_node(ew("Relu"));
        g.add_edge(a, b);
        let report = run_default(&mut g);
        assert_eq!(report.groups.len(), 1);
        assert_eq!(g.node(a).group_id(), Some(1));
        assert_eq!(g.node(b).group_id(), Some(1));
        assert_eq!(
            report.events,
            vec![FusionEvent {
                producer: a,
                consumer: b,
                group: 1
            }]
        );
    }

    #[test]
    fn fused_nodes_carry_pass_marker() {
        let mut g = Graph::new();
        let a = g.add_node(ew("Add"));
        let b = g.add_node(ew("Relu"));
        let c = g.add_node(Node::new("MatMul").with_pattern("OPAQUE"));
        g.add_edge(a, b);
        g.add_edge(b, c);
        run_default(&mut g);
        let marker = |id: NodeId| g.node(id).attrs.as_ref().unwrap().fused_by.clone();
        assert_eq!(marker(a).as_deref(), Some("automatic_buffer_fusion"));
        assert_eq!(marker(b).as_deref(), Some("automatic_buffer_fusion"));
        assert_eq!(marker(c), None);
    }

    #[test]
    fn unfusible_intermediate_blocks_path() {
        // a -> b -> c and a -> c, with b opaque: a cannot join c.
        let mut g = Graph::new();
        let a = g.add_node(ew("Add"));
        let b = g.add_node(Node::new("Conv2D").with_pattern("CONV"));
        let c = g.add_node(ew("Mul"));
        g.add_edge(a, b);
        g.add_edge(a, c);
        g.add_edge(b, c);
        let report = run_default(&mut g);
        assert!(report.groups.is_empty());
        assert!(report.unfusible.contains(&a));
        let attrs = g.node(a).attrs.as_ref().unwrap();
        assert!(attrs.needs_duplication);
        // consumers of a in order: b, c
        assert_eq!(attrs.consumer_fusible, vec![false, false]);
    }

    #[test]
    fn duplication_threshold_rejects_few_consumers() {
        // p feeds four fusible consumers and one opaque one.
        let mut g = Graph::new();
        let p = g.add_node(ew("Add"));
        let opaque = g.add_node(Node::new("MatMul").with_pattern("OPAQUE"));
        g.add_edge(p, opaque);
        let mut consumers = Vec::new();
        for _ in 0..4 {
            let c = g.add_node(ew("Relu"));
            g.add_edge(p, c);
            consumers.push(c);
        }
        let report = run_default(&mut g);
        // four fusible consumers > threshold of three: p is fused
        assert!(!report.unfusible.contains(&p));
        assert!(g.node(p).attrs.as_ref().unwrap().needs_duplication);
        assert!(report.group_of(p).is_some());

        let mut g = Graph::new();
        let p = g.add_node(ew("Add"));
        let opaque = g.add_node(Node::new("MatMul").with_pattern("OPAQUE"));
        g.add_edge(p, opaque);
        for _ in 0..3 {
            let c = g.add_node(ew("Relu"));
            g.add_edge(p, c);
        }
        let report = run_default(&mut g);
        assert!(report.unfusible.contains(&p));
        assert_eq!(report.group_of(p), None);
    }

    #[test]
    fn duplication_disabled_rejects_producer_unless_exempt() {
        let build = |op: &str| {
            let mut g = Graph::new();
            let p = g.add_node(ew(op));
            let opaque = g.add_node(Node::new("MatMul").with_pattern("OPAQUE"));
            let c = g.add_node(ew("Relu"));
            g.add_edge(p, opaque);
            g.add_edge(p, c);
            (g, p, c)
        };
        let config = FusionConfig {
            allow_duplication: false,
            ..FusionConfig::default()
        };

        let (mut g, p, _) = build("Add");
        let alloc = ScopeAllocator::new();
        let report = AutomaticBufferFusion::new(config.clone(), &alloc)
            .run(&mut g)
            .unwrap();
        assert!(report.unfusible.contains(&p));
        assert!(report
            .diagnostics
            .iter()
            .any(|d| d.code == Some(codes::W0102) && d.node == Some(p)));

        let (mut g, p, c) = build("Cast");
        let report = AutomaticBufferFusion::new(config, &alloc)
            .run(&mut g)
            .unwrap();
        assert!(!report.unfusible.contains(&p));
        assert_eq!(g.node(p).group_id(), g.node(c).group_id());
        assert!(g.node(p).group_id().is_some());
    }

    #[test]
    fn high_fanout_producer_is_unfusible() {
        let mut g = Graph::new();
        let p = g.add_node(ew("Add"));
        for _ in 0..7 {
            let c = g.add_node(ew("Relu"));
            g.add_edge(p, c);
        }
        let report = run_default(&mut g);
        assert!(report.unfusible.contains(&p));
        assert!(report.events.iter().all(|e| e.producer != p));
    }

    #[test]
    fn all_paths_walk_sees_deep_chains() {
        // p -> x1 -> ... -> x40 -> c and p -> c; every xi fusible.
        let mut g = Graph::new();
        let p = g.add_node(ew("Add"));
        let mut prev = p;
        for _ in 0..40 {
            let x = g.add_node(ew("Relu"));
            g.add_edge(prev, x);
            prev = x;
        }
        let c = g.add_node(ew("Mul"));
        g.add_edge(prev, c);
        g.add_edge(p, c);

        let config = FusionConfig::default();
        let alloc = ScopeAllocator::new();
        let order = g.topological_order().unwrap();
        let oracle = ConnectionMatrix::build_with_order(&g, &order);
        let mut run = FusionRun::new(&mut g, &config, &alloc, &oracle, 0);
        run.compute_all_unfusible_nodes(&order);
        assert!(run.able_to_fuse_on_all_paths(p, c));
        assert_eq!(run.memo.get(&(p, c)), Some(&true));
    }

    #[test]
    fn supplied_oracle_of_wrong_size_is_fatal() {
        let mut small = Graph::new();
        small.add_node(ew("Add"));
        let oracle = ConnectionMatrix::build(&small).unwrap();

        let mut g = Graph::new();
        let a = g.add_node(ew("Add"));
        let b = g.add_node(ew("Relu"));
        g.add_edge(a, b);
        let alloc = ScopeAllocator::new();
        let err = AutomaticBufferFusion::new(FusionConfig::default(), &alloc)
            .with_oracle(oracle)
            .run(&mut g)
            .unwrap_err();
        assert!(matches!(err, FusionError::OracleMismatch { oracle: 1, graph: 2 }));
        assert_eq!(g.node(a).group_id(), None);
    }

    #[test]
    fn cyclic_graph_aborts_without_annotation() {
        let mut g = Graph::new();
        let a = g.add_node(ew("Add"));
        let b = g.add_node(ew("Relu"));
        g.add_edge(a, b);
        g.add_control_edge(b, a);
        let alloc = ScopeAllocator::new();
        let err = AutomaticBufferFusion::new(FusionConfig::default(), &alloc)
            .run(&mut g)
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(g.groups().is_empty());
        assert_eq!(alloc.current_positive(), 0);
    }

    #[test]
    fn missing_pattern_is_reported_not_fatal() {
        let mut g = Graph::new();
        let a = g.add_node(Node::new("Add"));
        let b = g.add_node(ew("Relu"));
        g.add_edge(a, b);
        let report = run_default(&mut g);
        assert!(report.groups.is_empty());
        assert!(report
            .diagnostics
            .iter()
            .any(|d| d.code == Some(codes::W0101) && d.node == Some(a)));
    }

    #[test]
    fn producer_joins_only_after_the_middle_node() {
        // a -> d and a -> x -> d. Fusing a with d first would leave x on a
        // cycle, so a is skipped until x has joined d.
        let mut g = Graph::new();
        let a = g.add_node(ew("A"));
        let x = g.add_node(ew("X"));
        let d = g.add_node(ew("D"));
        g.add_edge(a, d);
        g.add_edge(a, x);
        g.add_edge(x, d);
        let report = run_default(&mut g);
        assert_eq!(g.node(a).group_id(), Some(1));
        assert_eq!(g.node(x).group_id(), Some(1));
        assert_eq!(g.node(d).group_id(), Some(1));
        let pairs: Vec<(NodeId, NodeId)> =
            report.events.iter().map(|e| (e.producer, e.consumer)).collect();
        assert_eq!(pairs, vec![(x, d), (a, x)]);
    }

    #[test]
    fn new_group_skips_ids_already_in_the_graph() {
        let mut g = Graph::new();
        let a = g.add_node(ew("Add").with_group(1));
        let b = g.add_node(ew("Relu").with_group(1));
        let c = g.add_node(ew("Mul"));
        let d = g.add_node(ew("Exp"));
        g.add_edge(a, b);
        g.add_edge(c, d);

        let config = FusionConfig {
            max_nodes_per_group: 3,
            ..FusionConfig::default()
        };
        let alloc = ScopeAllocator::new();
        let report = AutomaticBufferFusion::new(config, &alloc)
            .run(&mut g)
            .unwrap();

        assert_eq!(g.node(a).group_id(), Some(1));
        assert_eq!(g.node(b).group_id(), Some(1));
        assert_eq!(g.node(c).group_id(), Some(2));
        assert_eq!(g.node(d).group_id(), Some(2));
        assert_eq!(alloc.current_positive(), 2);
        assert!(report.groups.iter().all(|grp| grp.members.len() == 2));
    }

    #[test]
    fn stored_sentinel_group_is_fused_like_an_absent_one() {
        let mut g = Graph::new();
        let a = g.add_node(ew("Add").with_group(NO_GROUP));
        let b = g.add_node(ew("Relu").with_group(NO_GROUP));
        g.add_edge(a, b);
        let report = run_default(&mut g);
        assert!(report.unfusible.is_empty());
        assert_eq!(g.node(a).group_id(), Some(1));
        assert_eq!(g.node(b).group_id(), Some(1));
    }

    #[test]
    fn report_lists_completed_stages() {
        let mut g = Graph::new();
        let a = g.add_node(ew("Add"));
        let b = g.add_node(ew("Relu"));
        g.add_edge(a, b);
        let report = run_default(&mut g);
        assert_eq!(
            report.stages,
            vec!["init", "matrix_ready", "infusibility_computed", "growing", "done"]
        );
        assert_eq!(
            report.stages,
            stage_names(&crate::pass::required_stages(Stage::Done))
        );
    }
}
