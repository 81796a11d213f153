// abfc — Automatic buffer fusion compiler pass
//
// Library root. Groups elementwise compute nodes of a dataflow graph into
// fused scheduling units and reports what was formed.

pub mod config;
pub mod diag;
pub mod dot;
pub mod error;
pub mod fusion;
pub mod graph;
pub mod id;
pub mod pass;
pub mod predicate;
pub mod reach;
pub mod report;
pub mod scope;
pub mod verify;

pub use config::FusionConfig;
pub use error::{FusionError, Result};
pub use fusion::AutomaticBufferFusion;
pub use graph::{Graph, Node};
pub use id::NodeId;
pub use report::FusionReport;
pub use scope::ScopeAllocator;
