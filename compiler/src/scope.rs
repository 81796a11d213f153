// scope.rs — Group (scope) id allocation and node annotation helpers
//
// Positive ids are handed out in increasing order and negative ids in
// decreasing order. The counters are atomics so independent fusion runs on
// independent graphs can share one allocator; no other state is shared.
// Every id a run allocates is greater than the positive counter value read
// at the start of that run, which is what makes the run's lower bound work.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;

use crate::graph::{Node, NodeAttrs};

/// Sentinel for "no group" in the fusion algorithm.
pub const NO_GROUP: i64 = -1;

#[derive(Debug)]
pub struct ScopeAllocator {
    next_positive: AtomicI64,
    next_negative: AtomicI64,
}

impl Default for ScopeAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeAllocator {
    /// Positive ids start at 1, negative ids at -2 (`-1` is `NO_GROUP`).
    pub fn new() -> Self {
        Self::starting_at(0, NO_GROUP)
    }

    /// An allocator whose next ids are `last_positive + 1` and
    /// `last_negative - 1`.
    pub fn starting_at(last_positive: i64, last_negative: i64) -> Self {
        ScopeAllocator {
            next_positive: AtomicI64::new(last_positive),
            next_negative: AtomicI64::new(last_negative),
        }
    }

    /// Process-wide allocator for callers that do not inject their own.
    pub fn global() -> &'static ScopeAllocator {
        static GLOBAL: OnceLock<ScopeAllocator> = OnceLock::new();
        GLOBAL.get_or_init(ScopeAllocator::new)
    }

    pub fn allocate_positive_id(&self) -> i64 {
        self.next_positive.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn allocate_negative_id(&self) -> i64 {
        self.next_negative.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Largest positive id handed out so far (0 if none).
    pub fn current_positive(&self) -> i64 {
        self.next_positive.load(Ordering::SeqCst)
    }

    /// Smallest negative id handed out so far (`NO_GROUP` if none).
    pub fn current_negative(&self) -> i64 {
        self.next_negative.load(Ordering::SeqCst)
    }

    /// Reset both counters.
    pub fn reset(&self) {
        self.next_positive.store(0, Ordering::SeqCst);
        self.next_negative.store(NO_GROUP, Ordering::SeqCst);
    }
}

// ── Attribute helpers ───────────────────────────────────────────────────────

pub fn has_group_id(node: &Node) -> bool {
    node.group_id().is_some()
}

pub fn group_id(node: &Node) -> Option<i64> {
    node.group_id()
}

/// Group id, or `NO_GROUP` when the node has none.
pub fn group_id_or_sentinel(node: &Node) -> i64 {
    node.group_id().unwrap_or(NO_GROUP)
}

/// Write `id` into the node's attribute store. Returns false when the node
/// carries no store.
pub fn set_group_id(node: &mut Node, id: i64) -> bool {
    match node.attrs.as_mut() {
        Some(NodeAttrs { group_id, .. }) => {
            *group_id = Some(id);
            true
        }
        None => false,
    }
}
