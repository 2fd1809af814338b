//! Frame-based interpreter for compiled programs.
//!
//! [`Vm::run`] verifies a [`Program`](crate::bytecode::Program) with the
//! stack checker, then executes its root sequence. Method calls, block
//! invocations and class bodies each push a [`Frame`](frame::Frame); `leave`
//! pops it and hands the result to the frame below.

pub mod builtins;
pub mod class;
pub mod frame;
pub mod runtime_error;
pub mod value;
pub mod vm;

pub use runtime_error::{RuntimeError, RuntimeErrorKind, Unwind};
pub use value::Value;
pub use vm::{Vm, VmConfig};
