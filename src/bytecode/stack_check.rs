use std::collections::HashMap;

use thiserror::Error;

use crate::bytecode::ir::{CatchKind, InstructionSequence, Program};
use crate::bytecode::op::{Insn, Label};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StackCheckError {
    #[error("stack-check error: underflow in '{iseq}' at insn {index} ({insn}): depth {depth}, needs {pops}")]
    Underflow {
        iseq: String,
        index: usize,
        insn: &'static str,
        depth: usize,
        pops: usize,
    },

    #[error("stack-check error: '{iseq}' reaches insn {index} with depths {first} and {second}")]
    Mismatch {
        iseq: String,
        index: usize,
        first: usize,
        second: usize,
    },

    #[error("stack-check error: depth {depth} at insn {index} of '{iseq}' exceeds stack_max {max}")]
    Overflow {
        iseq: String,
        index: usize,
        depth: usize,
        max: usize,
    },

    #[error("stack-check error: execution can fall off the end of '{iseq}'")]
    FallsOffEnd { iseq: String },

    #[error("stack-check error: '{iseq}' references unplaced label {label}")]
    UnknownLabel { iseq: String, label: usize },
}

/// Depth-propagating verifier for a finished sequence.
///
/// Follows fallthrough, branch and catch edges and checks that every
/// reachable instruction sees one consistent depth, that no instruction
/// underflows, that `stack_max` bounds every depth and that control never
/// runs past the last instruction.
struct Checker<'a> {
    iseq: &'a InstructionSequence,
    insns: Vec<&'a Insn>,
    positions: HashMap<Label, usize>,
    depth_at: Vec<Option<usize>>,
    worklist: Vec<usize>,
}

impl<'a> Checker<'a> {
    fn new(iseq: &'a InstructionSequence) -> Self {
        let insns: Vec<&Insn> = iseq.insns().collect();
        let depth_at = vec![None; insns.len()];
        Self {
            iseq,
            insns,
            positions: iseq.label_positions(),
            depth_at,
            worklist: Vec::new(),
        }
    }

    fn position(&self, label: Label) -> Result<usize, StackCheckError> {
        self.positions
            .get(&label)
            .copied()
            .ok_or_else(|| StackCheckError::UnknownLabel {
                iseq: self.iseq.name.clone(),
                label: label.0,
            })
    }

    fn merge(&mut self, index: usize, depth: usize) -> Result<(), StackCheckError> {
        if index >= self.insns.len() {
            return Err(StackCheckError::FallsOffEnd {
                iseq: self.iseq.name.clone(),
            });
        }
        match self.depth_at[index] {
            None => {
                self.depth_at[index] = Some(depth);
                self.worklist.push(index);
                Ok(())
            }
            Some(first) if first == depth => Ok(()),
            Some(first) => Err(StackCheckError::Mismatch {
                iseq: self.iseq.name.clone(),
                index,
                first,
                second: depth,
            }),
        }
    }

    fn run(mut self) -> Result<(), StackCheckError> {
        if self.insns.is_empty() {
            return Err(StackCheckError::FallsOffEnd {
                iseq: self.iseq.name.clone(),
            });
        }

        // entry points: the start and every optional-argument prologue label
        self.merge(0, 0)?;
        for label in &self.iseq.args.opt {
            let index = self.position(*label)?;
            self.merge(index, 0)?;
        }
        // handlers resume at `cont` with their result pushed on the saved stack
        for entry in &self.iseq.catch_table {
            if matches!(entry.kind, CatchKind::Rescue | CatchKind::Break | CatchKind::Next) {
                let index = self.position(entry.cont)?;
                self.merge(index, entry.sp + 1)?;
            }
        }

        let max = self.iseq.stack_max();
        while let Some(index) = self.worklist.pop() {
            let insn = self.insns[index];
            let depth = self.depth_at[index].unwrap_or_default();
            let pops = insn.pops();
            if pops > depth {
                return Err(StackCheckError::Underflow {
                    iseq: self.iseq.name.clone(),
                    index,
                    insn: insn.name(),
                    depth,
                    pops,
                });
            }
            let after = depth - pops + insn.pushes();
            if after > max {
                return Err(StackCheckError::Overflow {
                    iseq: self.iseq.name.clone(),
                    index,
                    depth: after,
                    max,
                });
            }

            for label in insn.branch_targets() {
                let target = self.position(label)?;
                self.merge(target, after)?;
            }
            if insn.falls_through() {
                self.merge(index + 1, after)?;
            }
        }
        Ok(())
    }
}

pub fn check_iseq(iseq: &InstructionSequence) -> Result<(), StackCheckError> {
    Checker::new(iseq).run()
}

/// Check every sequence of `program`.
pub fn check_program(program: &Program) -> Result<(), StackCheckError> {
    program.iter().try_for_each(|(_, iseq)| check_iseq(iseq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ir::{Entry, IseqKind};
    use crate::bytecode::options::CompileOptions;
    use crate::compile;
    use crate::lang::literal::Literal;
    use crate::lang::location::Location;
    use crate::lang::node::{Node, NodeKind, Params};

    fn raw(entries: Vec<Entry>, stack_max: usize) -> InstructionSequence {
        let mut iseq = InstructionSequence::new(IseqKind::Top, "<main>", "<test>", Location::line(1), None, CompileOptions::plain());
        iseq.entries = entries;
        iseq.stack.set_current(stack_max);
        iseq
    }

    #[test]
    fn test_compiled_programs_check() {
        let body = Node::statements(vec![
            Node::lasgn("a", Node::int(1)),
            Node::if_else(Node::lvar("a"), Node::binary(Node::lvar("a"), "+", Node::int(2)), None),
        ]);
        let program = compile(&Node::program(vec![Node::def("f", Params::default(), body)])).unwrap();
        assert!(check_program(&program).is_ok());
    }

    #[test]
    fn test_loops_with_break_check() {
        let body = Node::fcall("f", vec![Node::int(1), Node::new(NodeKind::Break(Some(Box::new(Node::int(2)))))]);
        let node = Node::new(NodeKind::While {
            predicate: Box::new(Node::new(NodeKind::True)),
            body: Box::new(body),
        });
        let program = compile(&Node::program(vec![node])).unwrap();
        assert!(check_program(&program).is_ok());
    }

    #[test]
    fn test_underflow_detected() {
        let iseq = raw(vec![Entry::Insn(Insn::Pop), Entry::Insn(Insn::Leave)], 1);
        assert!(matches!(check_iseq(&iseq), Err(StackCheckError::Underflow { index: 0, .. })));
    }

    #[test]
    fn test_mismatch_at_join() {
        let entries = vec![
            Entry::Insn(Insn::PutNil),
            Entry::Insn(Insn::BranchIf(Label(0))),
            Entry::Insn(Insn::PutNil),
            Entry::Label(Label(0)),
            Entry::Insn(Insn::PutNil),
            Entry::Insn(Insn::Leave),
        ];
        let err = check_iseq(&raw(entries, 2)).unwrap_err();
        assert!(matches!(err, StackCheckError::Mismatch { index: 3, first: 0, second: 1, .. }));
    }

    #[test]
    fn test_falls_off_end() {
        let iseq = raw(vec![Entry::Insn(Insn::PutObject(Literal::Integer(3)))], 1);
        assert_eq!(
            check_iseq(&iseq),
            Err(StackCheckError::FallsOffEnd {
                iseq: "<main>".to_string()
            })
        );
    }

    #[test]
    fn test_overflow_against_stack_max() {
        let entries = vec![
            Entry::Insn(Insn::PutNil),
            Entry::Insn(Insn::PutNil),
            Entry::Insn(Insn::Pop),
            Entry::Insn(Insn::Leave),
        ];
        assert!(matches!(check_iseq(&raw(entries, 1)), Err(StackCheckError::Overflow { index: 1, .. })));
    }

    #[test]
    fn test_unknown_label() {
        let entries = vec![Entry::Insn(Insn::Jump(Label(9)))];
        assert!(matches!(check_iseq(&raw(entries, 0)), Err(StackCheckError::UnknownLabel { label: 9, .. })));
    }
}
