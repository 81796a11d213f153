// predicate.rs — Per-node fusibility classification
//
// A node is fusible only when every rule below holds. The first rule that
// fails is reported as a `Rejection` so callers can log or surface it.
//
// Preconditions: `lower_bound` is the group-id bound captured at run start.
// Postconditions: pure classification; the graph is not modified.
// Failure modes: none (missing attributes classify as not fusible).
// Side effects: none.

use std::fmt;

use crate::config::FusionConfig;
use crate::graph::Graph;
use crate::id::NodeId;
use crate::scope::NO_GROUP;

/// Why a node is not fusible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The node has no attribute store, so it cannot carry a group id.
    NoAttributeStore,
    /// Kernel comes from a different code generator.
    ForeignBackend,
    /// No capability pattern was attached.
    MissingPattern,
    NotElementwise(String),
    /// Op kind is on the convergence denylist.
    DeniedOp(String),
    ThreadScoped(i64),
    ClaimedByPass(String),
    /// Grouped by an earlier, already finalized pass.
    Finalized(i64),
    TooManyAccumulateInputs { inputs: usize, limit: usize },
    DynamicShape,
}

impl Rejection {
    /// Rejections caused by an absent attribute rather than a policy rule.
    pub fn is_missing_attribute(&self) -> bool {
        matches!(self, Rejection::NoAttributeStore | Rejection::MissingPattern)
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::NoAttributeStore => write!(f, "no attribute store"),
            Rejection::ForeignBackend => write!(f, "kernel from a different backend"),
            Rejection::MissingPattern => write!(f, "no capability pattern"),
            Rejection::NotElementwise(p) => write!(f, "pattern '{p}' is not elementwise"),
            Rejection::DeniedOp(op) => write!(f, "op '{op}' is never fused"),
            Rejection::ThreadScoped(id) => write!(f, "sliced into thread scope {id}"),
            Rejection::ClaimedByPass(pass) => write!(f, "claimed by pass '{pass}'"),
            Rejection::Finalized(id) => write!(f, "group {id} already finalized"),
            Rejection::TooManyAccumulateInputs { inputs, limit } => {
                write!(f, "accumulate with {inputs} inputs (limit {limit})")
            }
            Rejection::DynamicShape => write!(f, "needs unsupported dynamic-shape handling"),
        }
    }
}

pub struct FusionPredicate<'a> {
    config: &'a FusionConfig,
    lower_bound: i64,
}

impl<'a> FusionPredicate<'a> {
    pub fn new(config: &'a FusionConfig, lower_bound: i64) -> Self {
        FusionPredicate {
            config,
            lower_bound,
        }
    }

    pub fn lower_bound(&self) -> i64 {
        self.lower_bound
    }

    /// Classify `id`, returning its capability pattern when fusible.
    pub fn check<'g>(&self, graph: &'g Graph, id: NodeId) -> Result<&'g str, Rejection> {
        let node = graph.node(id);
        let attrs = node.attrs.as_ref().ok_or(Rejection::NoAttributeStore)?;

        if !node.native_backend {
            return Err(Rejection::ForeignBackend);
        }

        let pattern = match node.pattern.as_deref() {
            None | Some("") => return Err(Rejection::MissingPattern),
            Some(p) => p,
        };
        if pattern != self.config.elementwise_pattern {
            return Err(Rejection::NotElementwise(pattern.to_string()));
        }

        if self.config.is_denied(&node.op) {
            return Err(Rejection::DeniedOp(node.op.clone()));
        }

        if let Some(tid) = node.thread_scope_id.filter(|&t| t != 0) {
            return Err(Rejection::ThreadScoped(tid));
        }

        if let Some(pass) = node.matched_pass.as_deref() {
            if !pass.is_empty() && pass != self.config.pass_name {
                return Err(Rejection::ClaimedByPass(pass.to_string()));
            }
        }

        if let Some(gid) = attrs
            .group_id
            .filter(|&g| g != NO_GROUP && g <= self.lower_bound)
        {
            return Err(Rejection::Finalized(gid));
        }

        if node.op == self.config.accumulate_op {
            let inputs = graph.data_input_count(id);
            if inputs > self.config.max_accumulate_inputs {
                return Err(Rejection::TooManyAccumulateInputs {
                    inputs,
                    limit: self.config.max_accumulate_inputs,
                });
            }
        }

        if node.dynamic_shape_unsupported {
            return Err(Rejection::DynamicShape);
        }

        Ok(pattern)
    }

    pub fn is_fusible<'g>(&self, graph: &'g Graph, id: NodeId) -> (bool, Option<&'g str>) {
        match self.check(graph, id) {
            Ok(pattern) => (true, Some(pattern)),
            Err(_) => (false, graph.node(id).pattern.as_deref()),
        }
    }
}
