// reach.rs — All-pairs reachability oracle (connection matrix)
//
// One bitset row per node: bit `b` of row `a` is set iff a directed path
// a → b exists over data and control edges. Rows are filled by dynamic
// programming in reverse topological order, so each successor's row is final
// before it is unioned into its producers.
//
// The matrix is a snapshot of the original graph. Fusion never rebuilds it;
// callers that contract groups must account for contraction themselves.
//
// Preconditions: none.
// Postconditions: `is_connected(a, b)` answers in O(1); a node never reaches
//                 itself.
// Failure modes: cyclic graph → `FusionError::NotAcyclic`.
// Side effects: none.

use fixedbitset::FixedBitSet;

use crate::error::Result;
use crate::graph::Graph;
use crate::id::NodeId;

#[derive(Debug, Clone)]
pub struct ConnectionMatrix {
    rows: Vec<FixedBitSet>,
}

impl ConnectionMatrix {
    /// Build the matrix, sorting the graph first.
    pub fn build(graph: &Graph) -> Result<Self> {
        let order = graph.topological_order()?;
        Ok(Self::build_with_order(graph, &order))
    }

    /// Build the matrix from a topological order the caller already holds.
    pub fn build_with_order(graph: &Graph, order: &[NodeId]) -> Self {
        let n = graph.len();
        let mut rows: Vec<FixedBitSet> = (0..n).map(|_| FixedBitSet::with_capacity(n)).collect();

        for &u in order.iter().rev() {
            let mut row = FixedBitSet::with_capacity(n);
            for v in graph.successors(u) {
                row.insert(v.index());
                row.union_with(&rows[v.index()]);
            }
            rows[u.index()] = row;
        }

        tracing::trace!(nodes = n, "connection matrix built");
        ConnectionMatrix { rows }
    }

    /// Number of nodes the matrix was built over.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Whether a path `from → to` of length ≥ 1 exists.
    pub fn is_connected(&self, from: NodeId, to: NodeId) -> bool {
        self.rows[from.index()].contains(to.index())
    }

    /// Every node reachable from `from`.
    pub fn reachable_from(&self, from: NodeId) -> &FixedBitSet {
        &self.rows[from.index()]
    }
}
