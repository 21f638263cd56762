//! Analyses over the IR: graphs, loops, data dependencies, memory
//! classification and the declarative pattern matcher.

pub mod cfg;
pub mod dependency;
pub mod graph;
pub mod memory;
pub mod patterns;

pub use cfg::{CfgEdge, ControlFlowGraph, ControlFlowLoop, LoopInclusionTree};
pub use dependency::{DataDependencyGraph, DependencyKind};
pub use memory::{
    determine_memory_access, MemoryAccessInfo, MemoryAccessRange, MemoryAccessType, MemoryInfo,
};
