use std::rc::Rc;

use thiserror::Error;

use crate::runtime::frame::Env;
use crate::runtime::value::Value;

/// What went wrong, as seen by the embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    /// A language-level exception nobody rescued.
    Raised { class: String },
    /// Malformed or unsupported bytecode, missing sequences, bad operands.
    Execution,
    /// Step, call depth or stack size limit from [`VmConfig`](crate::runtime::VmConfig).
    Limit,
}

#[derive(Debug, Clone, Error)]
#[error("runtime error: {message}{}", render_call_stack(.call_stack))]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub message: String,
    /// Innermost frame first.
    pub call_stack: Vec<String>,
}

fn render_call_stack(call_stack: &[String]) -> String {
    if call_stack.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n  call stack:");
    for (i, frame) in call_stack.iter().enumerate() {
        out.push_str(&format!("\n    {}: {}", i, frame));
    }
    out
}

impl RuntimeError {
    pub fn new(msg: &str) -> Self {
        RuntimeError {
            kind: RuntimeErrorKind::Execution,
            message: msg.to_string(),
            call_stack: Vec::new(),
        }
    }

    pub fn limit(msg: &str) -> Self {
        RuntimeError {
            kind: RuntimeErrorKind::Limit,
            ..RuntimeError::new(msg)
        }
    }

    pub fn raised(class: &str, message: &str) -> Self {
        RuntimeError {
            kind: RuntimeErrorKind::Raised {
                class: class.to_string(),
            },
            message: format!("{} ({})", message, class),
            call_stack: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: &str) -> Self {
        self.call_stack.push(context.to_string());
        self
    }

    /// Class name of the uncaught exception, if this is one.
    pub fn exception_class(&self) -> Option<&str> {
        match &self.kind {
            RuntimeErrorKind::Raised { class } => Some(class),
            _ => None,
        }
    }
}

pub fn stack_underflow(insn: &str) -> RuntimeError {
    RuntimeError::new(&format!("operand stack underflow in '{}'", insn))
}

pub fn unknown_iseq(id: usize) -> RuntimeError {
    RuntimeError::new(&format!("instruction sequence #{} does not exist", id))
}

pub fn unknown_label(label: usize, iseq: &str) -> RuntimeError {
    RuntimeError::new(&format!("label {} is not placed in '{}'", label, iseq))
}

pub fn unsupported(insn: &str) -> RuntimeError {
    RuntimeError::new(&format!("instruction '{}' is not supported by this VM", insn))
}

// =============================================================================
// Non-local exits
// =============================================================================

/// Where a `throw` (break, next, return) lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrowAction {
    /// Resume after the call that created the block, through its `break` catch entry.
    CatchBreak,
    /// Return the value from the target frame.
    Return,
}

/// Anything that unwinds frames instead of falling through to the next
/// instruction.
#[derive(Debug, Clone)]
pub enum Unwind {
    /// A language exception; rescued by `rescue` catch entries.
    Raise(Value),
    /// `break`, `next` or `return` crossing frame boundaries.
    Throw {
        target: Rc<Env>,
        action: ThrowAction,
        value: Value,
    },
    /// Not catchable: the VM itself failed.
    Fatal(RuntimeError),
}

impl From<RuntimeError> for Unwind {
    fn from(error: RuntimeError) -> Self {
        Unwind::Fatal(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_call_stack() {
        let err = RuntimeError::new("boom").with_context("f").with_context("<main>");
        assert_eq!(err.to_string(), "runtime error: boom\n  call stack:\n    0: f\n    1: <main>");
    }

    #[test]
    fn test_raised_kind() {
        let err = RuntimeError::raised("ArgumentError", "bad");
        assert_eq!(err.exception_class(), Some("ArgumentError"));
        assert_eq!(err.to_string(), "runtime error: bad (ArgumentError)");
        assert_eq!(RuntimeError::limit("x").kind, RuntimeErrorKind::Limit);
    }
}
