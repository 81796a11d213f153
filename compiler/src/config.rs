// config.rs — Tuning knobs for automatic buffer fusion
//
// Every field has a default, so a config file only needs to name the values
// it changes. The numeric defaults are policy values, not invariants.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FusionError, Result};

/// Capability pattern that marks a node as elementwise.
pub const ELEMWISE_PATTERN: &str = "ELEMWISE";
/// Marker written on nodes grouped by this pass.
pub const FUSION_PASS_NAME: &str = "automatic_buffer_fusion";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FusionConfig {
    /// A producer with an output feeding more consumers than this is never
    /// fused into a consumer.
    pub max_branch_fanout: usize,
    /// Upper bound on members of one group.
    pub max_nodes_per_group: usize,
    /// Whether a producer may be recomputed for consumers left outside its
    /// group.
    pub allow_duplication: bool,
    /// A producer that needs duplication is only fused when more than this
    /// many of its consumers are fusible.
    pub duplication_threshold: usize,
    /// Fan-in limit for the N-ary accumulate op.
    pub max_accumulate_inputs: usize,
    pub elementwise_pattern: String,
    pub accumulate_op: String,
    /// Op kinds never fused because fusing them breaks convergence.
    pub denied_ops: Vec<String>,
    /// Op kinds that may be duplicated even when duplication is disabled.
    pub duplication_exempt_ops: Vec<String>,
    pub pass_name: String,
}

impl Default for FusionConfig {
    fn default() -> Self {
        FusionConfig {
            max_branch_fanout: 6,
            max_nodes_per_group: 28,
            allow_duplication: true,
            duplication_threshold: 3,
            max_accumulate_inputs: 6,
            elementwise_pattern: ELEMWISE_PATTERN.to_string(),
            accumulate_op: "AddN".to_string(),
            denied_ops: vec!["BNTrainingUpdateGrad".to_string()],
            duplication_exempt_ops: vec!["Cast".to_string()],
            pass_name: FUSION_PASS_NAME.to_string(),
        }
    }
}

impl FusionConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: FusionConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| FusionError::io(path, e))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_nodes_per_group < 2 {
            return Err(FusionError::Config(format!(
                "max_nodes_per_group must be at least 2, got {}",
                self.max_nodes_per_group
            )));
        }
        if self.max_branch_fanout == 0 {
            return Err(FusionError::Config(
                "max_branch_fanout must be positive".to_string(),
            ));
        }
        if self.elementwise_pattern.is_empty() {
            return Err(FusionError::Config(
                "elementwise_pattern must not be empty".to_string(),
            ));
        }
        if self.pass_name.is_empty() {
            return Err(FusionError::Config("pass_name must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn is_denied(&self, op: &str) -> bool {
        self.denied_ops.iter().any(|d| d == op)
    }

    pub fn is_duplication_exempt(&self, op: &str) -> bool {
        self.duplication_exempt_ops.iter().any(|d| d == op)
    }
}
