//! # Cinder syntax tree contract
//!
//! This module defines the shape of the syntax tree the compiler consumes.
//! Trees are produced by an external parser; the compiler only relies on
//! each node exposing its kind, its child nodes, its source location and,
//! for leaf nodes, a literal value.
//!
//! ## Documentation conventions
//!
//! - Source snippets are written in the surface syntax of the language,
//!   e.g. `foo(1, *rest, &blk)`.
//! - Stack effects on compiled code are written as `( before -- after )`.

pub mod literal;
pub mod location;
pub mod node;

pub use literal::Literal;
pub use location::Location;
pub use node::{InClause, Node, NodeKind, Params, Pattern, RescueClause, WhenClause};
