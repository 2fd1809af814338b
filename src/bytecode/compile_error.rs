use thiserror::Error;

use crate::bytecode::local_table::LocalError;
use crate::bytecode::op::Label;
use crate::lang::{location::Location, node::Node};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    /// A node type that the compiler doesn't know how to handle
    #[error("compile error: cannot compile '{node_type}' node at {location}{}", hint_suffix(.hint))]
    UnhandledNode {
        node_type: String,
        location: Location,
        hint: Option<String>,
    },

    /// A node that's valid but appeared in an invalid position
    #[error("compile error: {node_type} at {location}: {reason}")]
    InvalidPosition {
        node_type: String,
        location: Location,
        reason: String,
    },

    #[error("compile error: {source} at {location}")]
    Local {
        source: LocalError,
        location: Location,
    },

    #[error("compile error: undefined local variable '{name}' at {location}")]
    UndefinedLocal { name: String, location: Location },

    #[error("compile error: jump to label {label} which is never placed in '{iseq}'")]
    UnplacedLabel { label: usize, iseq: String },

    #[error("compile error: stack underflow in '{iseq}': {insn} pops {pops} with depth {depth}")]
    StackUnderflow {
        iseq: String,
        insn: &'static str,
        depth: usize,
        pops: usize,
    },

    /// Internal compiler error (shouldn't happen in normal use)
    #[error("compile error: internal error: {0}")]
    Internal(String),
}

fn hint_suffix(hint: &Option<String>) -> String {
    match hint {
        Some(h) => format!("\n  hint: {}", h),
        None => String::new(),
    }
}

impl CompileError {
    /// Create an error for an unhandled node type
    pub fn unhandled(node: &Node) -> Self {
        CompileError::UnhandledNode {
            node_type: node.type_name().to_string(),
            location: node.location,
            hint: None,
        }
    }

    /// Create an error for an unhandled node with custom hint
    pub fn unhandled_with_hint(node: &Node, hint: impl Into<String>) -> Self {
        CompileError::UnhandledNode {
            node_type: node.type_name().to_string(),
            location: node.location,
            hint: Some(hint.into()),
        }
    }

    /// Create an error for a node outside the construct that hosts it
    pub fn invalid_position(node: &Node, reason: impl Into<String>) -> Self {
        CompileError::InvalidPosition {
            node_type: node.type_name().to_string(),
            location: node.location,
            reason: reason.into(),
        }
    }

    pub fn local(source: LocalError, location: Location) -> Self {
        CompileError::Local { source, location }
    }

    pub fn undefined_local(name: &str, location: Location) -> Self {
        CompileError::UndefinedLocal {
            name: name.to_string(),
            location,
        }
    }

    pub fn unplaced_label(label: Label, iseq: &str) -> Self {
        CompileError::UnplacedLabel {
            label: label.0,
            iseq: iseq.to_string(),
        }
    }

    pub fn underflow(iseq: &str, insn: &'static str, depth: usize, pops: usize) -> Self {
        CompileError::StackUnderflow {
            iseq: iseq.to_string(),
            insn,
            depth,
            pops,
        }
    }

    /// Create an internal compiler error
    pub fn internal(msg: impl Into<String>) -> Self {
        CompileError::Internal(msg.into())
    }

    pub fn location(&self) -> Option<Location> {
        match self {
            CompileError::UnhandledNode { location, .. }
            | CompileError::InvalidPosition { location, .. }
            | CompileError::Local { location, .. }
            | CompileError::UndefinedLocal { location, .. } => Some(*location),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::node::NodeKind;

    #[test]
    fn test_unhandled_node_display() {
        let node = Node::new(NodeKind::Redo).at(Location::line(3));
        let err = CompileError::unhandled(&node);

        let msg = err.to_string();
        assert!(msg.starts_with("compile error:"));
        assert!(msg.contains("redo"));
        assert!(msg.contains("3:0"));
        assert!(!msg.contains("hint"));
    }

    #[test]
    fn test_unhandled_with_custom_hint() {
        let node = Node::new(NodeKind::Retry);
        let err = CompileError::unhandled_with_hint(&node, "custom hint here");
        assert!(err.to_string().contains("hint: custom hint here"));
    }

    #[test]
    fn test_invalid_position_display() {
        let node = Node::new(NodeKind::Splat(Box::new(Node::lvar("a")))).at(Location::line(7));
        let err = CompileError::invalid_position(&node, "splat is only allowed in argument lists");

        let msg = err.to_string();
        assert!(msg.contains("splat"));
        assert!(msg.contains("7:0"));
        assert!(msg.contains("argument lists"));
        assert_eq!(err.location(), Some(Location::line(7)));
    }

    #[test]
    fn test_local_error_wraps_source() {
        let err = CompileError::local(LocalError::TooMany { limit: 65535 }, Location::line(1));
        assert!(err.to_string().contains("too many locals"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_unplaced_label_display() {
        let err = CompileError::unplaced_label(Label(4), "<main>");
        let msg = err.to_string();
        assert!(msg.contains("label 4"));
        assert!(msg.contains("<main>"));
        assert_eq!(err.location(), None);
    }

    #[test]
    fn test_internal_error_display() {
        let err = CompileError::internal("something went wrong");

        let msg = err.to_string();
        assert!(msg.contains("internal"));
        assert!(msg.contains("something went wrong"));
    }

    #[test]
    fn test_error_clone() {
        let err1 = CompileError::underflow("f", "pop", 0, 1);
        let err2 = err1.clone();
        assert_eq!(err1.to_string(), err2.to_string());
    }
}
