//! Partial decompiler from instruction sequences back to syntax trees.
//!
//! Only a small, regular subset is recognized: literal pushes, local
//! reads and writes, calls without blocks, `pop`, `leave`, `definemethod`
//! and an `if`/`else` whose arms both end in `leave`. Anything else is a
//! [`DecompileError::Unrecognized`] rather than a best-effort guess, and a
//! sequence with catch-table regions (rescue, ensure, block `break`) is a
//! [`DecompileError::GuardedRegion`].

use std::collections::HashMap;

use thiserror::Error;

use crate::bytecode::calldata::CallData;
use crate::bytecode::ir::{IseqId, Program};
use crate::bytecode::op::{Insn, Label};
use crate::lang::literal::Literal;
use crate::lang::node::{Node, NodeKind, Params};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecompileError {
    #[error("decompile error: unrecognized {insn} at insn {index} of '{iseq}'")]
    Unrecognized {
        iseq: String,
        index: usize,
        insn: &'static str,
    },

    #[error("decompile error: '{iseq}' has a {kind} region starting at insn {start}")]
    GuardedRegion {
        iseq: String,
        kind: &'static str,
        start: usize,
    },

    #[error("decompile error: {reason} in '{iseq}'")]
    Malformed { iseq: String, reason: String },
}

type Result<T> = std::result::Result<T, DecompileError>;

/// Rebuild the syntax tree of the whole program.
pub fn decompile(program: &Program) -> Result<Node> {
    let statements = Decompiler::new(program, IseqId::ROOT).statements()?;
    Ok(Node::program(statements))
}

/// Rebuild the statements of one sequence.
pub fn decompile_iseq(program: &Program, id: IseqId) -> Result<Vec<Node>> {
    Decompiler::new(program, id).statements()
}

struct Decompiler<'a> {
    program: &'a Program,
    id: IseqId,
    insns: Vec<&'a Insn>,
    positions: HashMap<Label, usize>,
}

impl<'a> Decompiler<'a> {
    fn new(program: &'a Program, id: IseqId) -> Self {
        let iseq = &program[id];
        Self {
            program,
            id,
            insns: iseq.insns().collect(),
            positions: iseq.label_positions(),
        }
    }

    fn name(&self) -> String {
        self.program[self.id].name.clone()
    }

    fn unrecognized(&self, index: usize) -> DecompileError {
        DecompileError::Unrecognized {
            iseq: self.name(),
            index,
            insn: self.insns.get(index).map_or("end of sequence", |insn| insn.name()),
        }
    }

    fn malformed(&self, reason: impl Into<String>) -> DecompileError {
        DecompileError::Malformed {
            iseq: self.name(),
            reason: reason.into(),
        }
    }

    fn local(&self, index: usize, level: usize) -> Result<Node> {
        self.program
            .local_name(self.id, index, level)
            .map(Node::lvar)
            .ok_or_else(|| self.malformed(format!("no local {} at level {}", index, level)))
    }

    fn local_name(&self, index: usize, level: usize) -> Result<String> {
        self.program
            .local_name(self.id, index, level)
            .map(str::to_string)
            .ok_or_else(|| self.malformed(format!("no local {} at level {}", index, level)))
    }

    /// Straight-line code only: control can leave a guarded region through
    /// the catch table, which the statement list has no way to express.
    fn statements(&self) -> Result<Vec<Node>> {
        if let Some(entry) = self.program[self.id].catch_table.first() {
            let start = self
                .positions
                .get(&entry.start)
                .copied()
                .ok_or_else(|| self.malformed(format!("catch entry starts at unplaced label {}", entry.start.0)))?;
            return Err(DecompileError::GuardedRegion {
                iseq: self.name(),
                kind: entry.kind.symbol(),
                start,
            });
        }
        self.body(0)
    }

    fn pop(&self, stack: &mut Vec<Node>, index: usize) -> Result<Node> {
        stack.pop().ok_or_else(|| self.unrecognized(index))
    }

    /// Statements from `start` up to and including the `leave` that ends
    /// this straight-line region. The left value becomes the last statement.
    fn body(&self, start: usize) -> Result<Vec<Node>> {
        let mut statements = Vec::new();
        let mut stack: Vec<Node> = Vec::new();
        let mut index = start;

        loop {
            let insn = *self.insns.get(index).ok_or_else(|| self.unrecognized(index))?;
            match insn {
                Insn::PutNil => stack.push(Node::nil()),
                Insn::PutSelf => stack.push(Node::new(NodeKind::SelfRef)),
                Insn::PutObjectInt2Fix0 => stack.push(Node::int(0)),
                Insn::PutObjectInt2Fix1 => stack.push(Node::int(1)),
                Insn::PutString(value) => stack.push(Node::str(value)),
                Insn::PutObject(value) => {
                    let node = literal_node(value).ok_or_else(|| self.unrecognized(index))?;
                    stack.push(node);
                }

                Insn::GetLocal { index: slot, level } => stack.push(self.local(*slot, *level)?),
                Insn::GetLocalWC0(slot) => stack.push(self.local(*slot, 0)?),
                Insn::GetLocalWC1(slot) => stack.push(self.local(*slot, 1)?),

                // `dup; setlocal` is an assignment whose value is used
                Insn::Dup => {
                    let (slot, level) = self
                        .insns
                        .get(index + 1)
                        .and_then(|next| set_local(next))
                        .ok_or_else(|| self.unrecognized(index))?;
                    let value = self.pop(&mut stack, index)?;
                    stack.push(Node::lasgn(&self.local_name(slot, level)?, value));
                    index += 1;
                }
                insn if set_local(insn).is_some() => {
                    let (slot, level) = set_local(insn).ok_or_else(|| self.unrecognized(index))?;
                    let value = self.pop(&mut stack, index)?;
                    statements.push(Node::lasgn(&self.local_name(slot, level)?, value));
                }

                Insn::Opt(_, calldata) | Insn::OptSendWithoutBlock(calldata) => {
                    let call = self.call(calldata, &mut stack, index)?;
                    stack.push(call);
                }
                Insn::Send { calldata, block: None } if !calldata.has(CallData::ARGS_BLOCKARG) => {
                    let call = self.call(calldata, &mut stack, index)?;
                    stack.push(call);
                }
                Insn::OptNeq { neq, .. } => {
                    let call = self.call(neq, &mut stack, index)?;
                    stack.push(call);
                }

                Insn::DefineMethod { name, iseq } => {
                    let def = self.method(name, *iseq)?;
                    // a used definition is followed by its name
                    if self.insns.get(index + 1) == Some(&&Insn::PutObject(Literal::symbol(name.as_str()))) {
                        stack.push(def);
                        index += 1;
                    } else {
                        statements.push(def);
                    }
                }

                Insn::Pop => {
                    let value = self.pop(&mut stack, index)?;
                    statements.push(value);
                }
                Insn::Leave => {
                    let value = self.pop(&mut stack, index)?;
                    if !stack.is_empty() {
                        return Err(self.unrecognized(index));
                    }
                    statements.push(value);
                    return Ok(statements);
                }

                Insn::BranchIf(label) | Insn::BranchUnless(label) => {
                    let predicate = self.pop(&mut stack, index)?;
                    if !stack.is_empty() {
                        return Err(self.unrecognized(index));
                    }
                    let target = self
                        .positions
                        .get(label)
                        .copied()
                        .ok_or_else(|| self.malformed(format!("label {} is not placed", label.0)))?;
                    if target <= index {
                        return Err(self.unrecognized(index));
                    }
                    let fallthrough = arm(self.body(index + 1)?);
                    let taken = arm(self.body(target)?);
                    let node = match insn {
                        Insn::BranchUnless(_) => Node::if_else(predicate, fallthrough, Some(taken)),
                        _ => Node::if_else(predicate, taken, Some(fallthrough)),
                    };
                    statements.push(node);
                    return Ok(statements);
                }

                _ => return Err(self.unrecognized(index)),
            }
            index += 1;
        }
    }

    fn call(&self, calldata: &CallData, stack: &mut Vec<Node>, index: usize) -> Result<Node> {
        if !calldata.kw_arg.is_empty()
            || calldata.has(CallData::ARGS_SPLAT | CallData::ARGS_BLOCKARG | CallData::KW_SPLAT | CallData::KWARG)
            || stack.len() < calldata.argc + 1
        {
            return Err(self.unrecognized(index));
        }
        let args = stack.split_off(stack.len() - calldata.argc);
        let receiver = self.pop(stack, index)?;
        let method = calldata.method.as_str();

        if receiver.kind == NodeKind::SelfRef && calldata.has(CallData::FCALL) {
            return Ok(Node::fcall(method, args));
        }

        let node = match (method, args.len()) {
            ("!", 0) => Node::new(NodeKind::Not(Box::new(receiver))),
            ("-@" | "+@" | "~", 0) => Node::new(NodeKind::Unary {
                operator: method.to_string(),
                operand: Box::new(receiver),
            }),
            (op, 1) if is_operator(op) => {
                let [right] = <[Node; 1]>::try_from(args).map_err(|_| self.unrecognized(index))?;
                Node::binary(receiver, op, right)
            }
            _ => Node::call(Some(receiver), method, args),
        };
        Ok(node)
    }

    fn method(&self, name: &str, id: IseqId) -> Result<Node> {
        let child = &self.program[id];
        let args = &child.args;
        if !args.opt.is_empty() || args.rest_start.is_some() || args.post_start.is_some() || args.block_start.is_some() {
            return Err(DecompileError::Unrecognized {
                iseq: child.name.clone(),
                index: 0,
                insn: "definemethod",
            });
        }
        let names: Vec<&str> = child.local_table.names().take(args.lead_num).collect();
        let body = Decompiler::new(self.program, id).statements()?;
        Ok(Node::def(name, Params::required(&names), arm(body)))
    }
}

fn set_local(insn: &Insn) -> Option<(usize, usize)> {
    match insn {
        Insn::SetLocal { index, level } => Some((*index, *level)),
        Insn::SetLocalWC0(index) => Some((*index, 0)),
        Insn::SetLocalWC1(index) => Some((*index, 1)),
        _ => None,
    }
}

fn is_operator(method: &str) -> bool {
    method != "[]" && !method.starts_with(|c: char| c.is_alphanumeric() || c == '_')
}

/// A single statement stands on its own; several become a `Statements`.
fn arm(mut statements: Vec<Node>) -> Node {
    if statements.len() == 1 {
        statements.remove(0)
    } else {
        Node::statements(statements)
    }
}

fn literal_node(value: &Literal) -> Option<Node> {
    let kind = match value {
        Literal::Nil => NodeKind::Nil,
        Literal::True => NodeKind::True,
        Literal::False => NodeKind::False,
        Literal::Integer(n) => NodeKind::Integer(*n),
        Literal::Float(n) => NodeKind::Float(*n),
        Literal::String(s) => NodeKind::Str(s.clone()),
        Literal::Symbol(s) => NodeKind::Symbol(s.clone()),
        _ => return None,
    };
    Some(Node::new(kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::options::CompileOptions;
    use crate::lang::node::RescueClause;
    use crate::{compile, compile_with_options};

    #[test]
    fn test_arithmetic_and_locals() {
        let source = Node::program(vec![
            Node::lasgn("a", Node::int(1)),
            Node::binary(Node::lvar("a"), "+", Node::int(2)),
        ]);
        let program = compile(&source).unwrap();
        assert_eq!(decompile(&program).unwrap(), source);
    }

    #[test]
    fn test_method_definition_and_call() {
        let source = Node::program(vec![
            Node::def("f", Params::required(&["x"]), Node::binary(Node::lvar("x"), "+", Node::int(1))),
            Node::fcall("f", vec![Node::int(5)]),
        ]);
        let program = compile(&source).unwrap();
        assert_eq!(decompile(&program).unwrap(), source);
    }

    #[test]
    fn test_generic_sends_decompile_the_same() {
        let source = Node::program(vec![Node::binary(Node::int(6), "*", Node::int(7))]);
        let program = compile_with_options(&source, CompileOptions::plain()).unwrap();
        assert_eq!(decompile(&program).unwrap(), source);
    }

    #[test]
    fn test_if_else_with_leaving_arms() {
        let source = Node::program(vec![
            Node::lasgn("a", Node::int(3)),
            Node::if_else(Node::lvar("a"), Node::int(1), Some(Node::int(2))),
        ]);
        let program = compile(&source).unwrap();
        assert_eq!(decompile(&program).unwrap(), source);
    }

    #[test]
    fn test_used_assignment() {
        let source = Node::program(vec![Node::lasgn("a", Node::int(9))]);
        let program = compile(&source).unwrap();
        assert_eq!(decompile(&program).unwrap(), source);
    }

    #[test]
    fn test_unsupported_code_fails_loudly() {
        let program = compile(&Node::program(vec![Node::ivar("@x")])).unwrap();
        let err = decompile(&program).unwrap_err();
        assert!(matches!(
            err,
            DecompileError::Unrecognized {
                index: 0,
                insn: "getinstancevariable",
                ..
            }
        ));
    }

    fn begin(body: Node, rescue: Option<Node>, ensure: Option<Node>) -> Node {
        Node::new(NodeKind::Begin {
            body: Box::new(body),
            rescues: rescue
                .into_iter()
                .map(|body| RescueClause {
                    exceptions: vec![],
                    binding: None,
                    body,
                })
                .collect(),
            else_branch: None,
            ensure: ensure.map(Box::new),
        })
    }

    #[test]
    fn test_rescue_region_is_rejected() {
        let source = Node::program(vec![begin(Node::fcall("risky", vec![]), Some(Node::int(0)), None)]);
        let program = compile(&source).unwrap();
        let err = decompile(&program).unwrap_err();
        assert!(matches!(err, DecompileError::GuardedRegion { kind: "rescue", .. }), "{:?}", err);
    }

    #[test]
    fn test_ensure_region_is_rejected() {
        let source = Node::program(vec![begin(
            Node::fcall("risky", vec![]),
            None,
            Some(Node::fcall("cleanup", vec![])),
        )]);
        let program = compile(&source).unwrap();
        assert!(!program.root().catch_table.is_empty());
        let err = decompile(&program).unwrap_err();
        assert!(matches!(err, DecompileError::GuardedRegion { kind: "ensure", .. }), "{:?}", err);
    }

    #[test]
    fn test_guarded_method_body_is_rejected() {
        let body = begin(Node::fcall("risky", vec![]), Some(Node::nil()), None);
        let source = Node::program(vec![Node::def("safe", Params::default(), body)]);
        let program = compile(&source).unwrap();
        let err = decompile(&program).unwrap_err();
        assert!(matches!(err, DecompileError::GuardedRegion { ref iseq, .. } if iseq == "safe"), "{:?}", err);
    }
}
