// diag.rs — Diagnostics for local fusion rejections
//
// A fusion run never fails because a single candidate is rejected. Rejections
// worth surfacing (capacity caps, missing attributes, disabled duplication)
// are recorded as diagnostics attached to the node they concern and returned
// in the run's report.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use serde::Serialize;

use crate::error::FusionError;
use crate::id::NodeId;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `W0100`).
///
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    /// A merge would push a group past the configured member cap.
    pub const W0100: DiagCode = DiagCode("W0100");
    /// A node lacks an attribute the predicate needs.
    pub const W0101: DiagCode = DiagCode("W0101");
    /// A producer needs duplication but duplication is disabled.
    pub const W0102: DiagCode = DiagCode("W0102");
    /// A group id could not be written back to a node.
    pub const E0100: DiagCode = DiagCode("E0100");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Related node ─────────────────────────────────────────────────────────

/// A secondary node providing context for a diagnostic.
#[derive(Debug, Clone, Serialize)]
pub struct RelatedNode {
    pub node: NodeId,
    pub label: String,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub node: Option<NodeId>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<RelatedNode>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, hint, or related nodes.
    pub fn new(level: DiagLevel, node: Option<NodeId>, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            node,
            message: message.into(),
            hint: None,
            related: Vec::new(),
        }
    }

    /// Build a warning from a local (non-fatal) fusion error.
    pub fn from_local(code: DiagCode, node: NodeId, err: &FusionError) -> Self {
        Self::new(DiagLevel::Warning, Some(node), err.to_string()).with_code(code)
    }

    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_related(mut self, node: NodeId, label: impl Into<String>) -> Self {
        self.related.push(RelatedNode {
            node,
            label: label.into(),
        });
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}
