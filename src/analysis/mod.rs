//! Read-only analyses over finished instruction sequences.

pub mod cfg;
pub mod decompile;
pub mod liveness;

pub use cfg::{BasicBlock, CfgError, ControlFlowGraph, Edge, EdgeKind};
pub use decompile::{DecompileError, decompile, decompile_iseq};
pub use liveness::Liveness;
