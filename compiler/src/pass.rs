// pass.rs — Stage descriptors for a fusion run
//
// A run moves through a fixed sequence of stages. Each stage declares the
// stages it depends on, the artifacts it produces, and the invariant that
// holds once it completes. `FusionRun` uses `can_advance` to keep its
// transitions honest and records every stage it enters; `required_stages`
// gives the minimal prefix a complete run must have passed through.

use std::collections::HashSet;

// ── Stage and Artifact identifiers ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Init,
    MatrixReady,
    InfusibilityComputed,
    Growing,
    Done,
    /// Terminal; reachable from `Init` and `MatrixReady` only.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    TopoOrder,  // Vec<NodeId>
    LowerBound, // i64
    Oracle,     // ConnectionMatrix
    Unfusible,  // FixedBitSet + per-node duplication attrs
    Groups,     // group ids on nodes + membership index
    Markers,    // fused_by markers
}

// ── Stage descriptor ───────────────────────────────────────────────────────

pub struct StageDescriptor {
    pub name: &'static str,
    pub inputs: &'static [Stage],
    pub outputs: &'static [ArtifactId],
    pub invariants: &'static str,
}

pub fn descriptor(stage: Stage) -> StageDescriptor {
    match stage {
        Stage::Init => StageDescriptor {
            name: "init",
            inputs: &[],
            outputs: &[ArtifactId::TopoOrder, ArtifactId::LowerBound],
            invariants: "graph sorted, lower bound captured before any allocation",
        },
        Stage::MatrixReady => StageDescriptor {
            name: "matrix_ready",
            inputs: &[Stage::Init],
            outputs: &[ArtifactId::Oracle],
            invariants: "oracle covers every node and is never rebuilt",
        },
        Stage::InfusibilityComputed => StageDescriptor {
            name: "infusibility_computed",
            inputs: &[Stage::MatrixReady],
            outputs: &[ArtifactId::Unfusible],
            invariants: "every fusible producer has its consumer bit-vector",
        },
        Stage::Growing => StageDescriptor {
            name: "growing",
            inputs: &[Stage::InfusibilityComputed],
            outputs: &[ArtifactId::Groups],
            invariants: "groups stay acyclic after contraction and under the cap",
        },
        Stage::Done => StageDescriptor {
            name: "done",
            inputs: &[Stage::Growing],
            outputs: &[ArtifactId::Markers],
            invariants: "every node grouped by this run carries the pass marker",
        },
        Stage::Failed => StageDescriptor {
            name: "failed",
            inputs: &[],
            outputs: &[],
            invariants: "graph left unannotated",
        },
    }
}

/// Whether a run in `from` may move to `to`.
pub fn can_advance(from: Stage, to: Stage) -> bool {
    match to {
        Stage::Failed => matches!(from, Stage::Init | Stage::MatrixReady),
        _ => descriptor(to).inputs.contains(&from),
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// Minimal ordered set of stages needed to reach `terminal`.
pub fn required_stages(terminal: Stage) -> Vec<Stage> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(stage: Stage, visited: &mut HashSet<Stage>, order: &mut Vec<Stage>) {
    if !visited.insert(stage) {
        return;
    }
    for &dep in descriptor(stage).inputs {
        visit(dep, visited, order);
    }
    order.push(stage);
}

/// Descriptor names of `stages`, in order.
pub fn stage_names(stages: &[Stage]) -> Vec<&'static str> {
    stages.iter().map(|&s| descriptor(s).name).collect()
}

// ── Certificates ───────────────────────────────────────────────────────────

/// Machine-checkable evidence for a stage's postconditions.
pub trait StageCert {
    fn all_pass(&self) -> bool;
    fn obligations(&self) -> Vec<(&'static str, bool)>;

    /// Names of the obligations that do not hold.
    fn failures(&self) -> Vec<&'static str> {
        self.obligations()
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(name, _)| name)
            .collect()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STAGES: [Stage; 6] = [
        Stage::Init,
        Stage::MatrixReady,
        Stage::InfusibilityComputed,
        Stage::Growing,
        Stage::Done,
        Stage::Failed,
    ];

    #[test]
    fn required_stages_done_is_full_chain() {
        assert_eq!(
            required_stages(Stage::Done),
            vec![
                Stage::Init,
                Stage::MatrixReady,
                Stage::InfusibilityComputed,
                Stage::Growing,
                Stage::Done,
            ]
        );
    }

    #[test]
    fn required_stages_init_is_minimal() {
        assert_eq!(required_stages(Stage::Init), vec![Stage::Init]);
    }

    #[test]
    fn stage_names_follow_descriptors() {
        assert_eq!(
            stage_names(&required_stages(Stage::MatrixReady)),
            vec!["init", "matrix_ready"]
        );
    }

    #[test]
    fn failure_only_from_early_stages() {
        assert!(can_advance(Stage::Init, Stage::Failed));
        assert!(can_advance(Stage::MatrixReady, Stage::Failed));
        assert!(!can_advance(Stage::InfusibilityComputed, Stage::Failed));
        assert!(!can_advance(Stage::Growing, Stage::Failed));
    }

    #[test]
    fn no_skipping_stages() {
        assert!(can_advance(Stage::Init, Stage::MatrixReady));
        assert!(!can_advance(Stage::Init, Stage::Growing));
        assert!(!can_advance(Stage::Done, Stage::Init));
    }

    #[test]
    fn all_productive_stages_have_outputs() {
        for stage in ALL_STAGES.iter().filter(|s| **s != Stage::Failed) {
            assert!(
                !descriptor(*stage).outputs.is_empty(),
                "stage {:?} has no outputs declared",
                stage
            );
        }
    }

    #[test]
    fn dependency_edges_are_consistent() {
        for stage in &ALL_STAGES {
            let order = required_stages(*stage);
            for dep in descriptor(*stage).inputs {
                let dep_pos = order.iter().position(|s| s == dep).unwrap();
                let self_pos = order.iter().position(|s| s == stage).unwrap();
                assert!(dep_pos < self_pos, "{:?} depends on {:?}", stage, dep);
            }
        }
    }

    struct Fixed(Vec<(&'static str, bool)>);

    impl StageCert for Fixed {
        fn all_pass(&self) -> bool {
            self.0.iter().all(|(_, ok)| *ok)
        }
        fn obligations(&self) -> Vec<(&'static str, bool)> {
            self.0.clone()
        }
    }

    #[test]
    fn failures_lists_broken_obligations() {
        let cert = Fixed(vec![("A", true), ("B", false)]);
        assert!(!cert.all_pass());
        assert_eq!(cert.failures(), vec!["B"]);
    }
}
