use std::collections::{BTreeSet, HashMap};
use std::fmt::Write;

use thiserror::Error;

use crate::bytecode::disasm;
use crate::bytecode::ir::{InstructionSequence, IseqId, Program};
use crate::bytecode::op::{Insn, Label};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CfgError {
    #[error("cfg error: '{iseq}' references unplaced label {label}")]
    UnknownLabel { iseq: String, label: usize },

    #[error("cfg error: no sequence #{0}")]
    MissingIseq(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Control continues with the next instruction.
    Fallthrough,
    /// Unconditional `jump`.
    Jump,
    /// Taken side of a conditional branch.
    Branch,
    /// Handler continuation of a catch-table entry covering the block.
    Exception,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub kind: EdgeKind,
    pub target: usize,
}

/// Maximal straight-line run of instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    pub id: usize,
    /// First instruction index.
    pub start: usize,
    /// One past the last instruction index.
    pub end: usize,
    pub successors: Vec<Edge>,
    pub predecessors: Vec<usize>,
    pub reachable: bool,
}

impl BasicBlock {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }

    pub fn successor_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.successors.iter().map(|edge| edge.target)
    }
}

/// Control-flow graph of one instruction sequence.
///
/// Instruction indices count instructions only; labels occupy no index.
#[derive(Debug, Clone)]
pub struct ControlFlowGraph<'a> {
    pub id: IseqId,
    pub iseq: &'a InstructionSequence,
    insns: Vec<&'a Insn>,
    blocks: Vec<BasicBlock>,
    block_of: Vec<usize>,
}

impl<'a> ControlFlowGraph<'a> {
    pub fn build(program: &'a Program, id: IseqId) -> Result<Self, CfgError> {
        let iseq = program.get(id).ok_or(CfgError::MissingIseq(id.0))?;
        Builder::new(iseq).run(id)
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn block(&self, id: usize) -> Option<&BasicBlock> {
        self.blocks.get(id)
    }

    pub fn insns(&self) -> &[&'a Insn] {
        &self.insns
    }

    /// Instructions of block `id`.
    pub fn block_insns(&self, id: usize) -> &[&'a Insn] {
        match self.blocks.get(id) {
            Some(block) => &self.insns[block.range()],
            None => &[],
        }
    }

    pub fn block_containing(&self, index: usize) -> Option<usize> {
        self.block_of.get(index).copied()
    }

    pub fn unreachable_blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.iter().filter(|block| !block.reachable)
    }

    /// Text listing: one header per block followed by its instructions.
    pub fn render(&self, program: &Program) -> String {
        let offsets = self.iseq.label_offsets();
        let mut out = String::new();
        let _ = writeln!(out, "== cfg: {} ({} blocks)", self.iseq.name, self.blocks.len());
        for block in &self.blocks {
            let edges: Vec<String> = block
                .successors
                .iter()
                .map(|edge| format!("{}:{:?}", edge.target, edge.kind))
                .collect();
            let _ = writeln!(
                out,
                "block {} [{}..{}) preds {:?} succs [{}]{}",
                block.id,
                block.start,
                block.end,
                block.predecessors,
                edges.join(", "),
                if block.reachable { "" } else { " (unreachable)" }
            );
            for index in block.range() {
                let insn = self.insns[index];
                let operands = disasm::operands(program, self.id, insn, &offsets);
                let _ = writeln!(out, "    {:04} {} {}", index, insn.name(), operands.join(", "));
            }
        }
        out
    }
}

struct Builder<'a> {
    iseq: &'a InstructionSequence,
    insns: Vec<&'a Insn>,
    positions: HashMap<Label, usize>,
}

impl<'a> Builder<'a> {
    fn new(iseq: &'a InstructionSequence) -> Self {
        Self {
            iseq,
            insns: iseq.insns().collect(),
            positions: iseq.label_positions(),
        }
    }

    fn position(&self, label: Label) -> Result<usize, CfgError> {
        self.positions
            .get(&label)
            .copied()
            .ok_or_else(|| CfgError::UnknownLabel {
                iseq: self.iseq.name.clone(),
                label: label.0,
            })
    }

    /// Instruction indices that start a block.
    fn leaders(&self) -> Result<BTreeSet<usize>, CfgError> {
        let mut leaders = BTreeSet::from([0]);
        for label in self.iseq.args.opt.iter() {
            leaders.insert(self.position(*label)?);
        }
        for entry in &self.iseq.catch_table {
            for label in [entry.start, entry.end, entry.cont] {
                leaders.insert(self.position(label)?);
            }
        }
        for (index, insn) in self.insns.iter().enumerate() {
            for label in insn.branch_targets() {
                leaders.insert(self.position(label)?);
            }
            if insn.is_control_transfer() {
                leaders.insert(index + 1);
            }
        }
        leaders.retain(|&index| index < self.insns.len());
        Ok(leaders)
    }

    fn run(self, id: IseqId) -> Result<ControlFlowGraph<'a>, CfgError> {
        let leaders: Vec<usize> = self.leaders()?.into_iter().collect();
        let mut blocks: Vec<BasicBlock> = leaders
            .iter()
            .enumerate()
            .map(|(block, &start)| BasicBlock {
                id: block,
                start,
                end: leaders.get(block + 1).copied().unwrap_or(self.insns.len()),
                successors: Vec::new(),
                predecessors: Vec::new(),
                reachable: false,
            })
            .collect();

        let mut block_of = vec![0; self.insns.len()];
        for block in &blocks {
            block_of[block.range()].fill(block.id);
        }

        for block in blocks.iter_mut() {
            if block.is_empty() {
                continue;
            }
            let last = self.insns[block.end - 1];
            let fallthrough = (block.end < self.insns.len()).then(|| block_of[block.end]);
            match last {
                Insn::Jump(label) => block.successors.push(Edge {
                    kind: EdgeKind::Jump,
                    target: block_of[self.position(*label)?],
                }),
                insn if insn.leaves() => {}
                insn => {
                    for label in insn.branch_targets() {
                        block.successors.push(Edge {
                            kind: EdgeKind::Branch,
                            target: block_of[self.position(label)?],
                        });
                    }
                    if let Some(next) = fallthrough {
                        block.successors.push(Edge {
                            kind: EdgeKind::Fallthrough,
                            target: next,
                        });
                    }
                }
            }
        }

        for entry in &self.iseq.catch_table {
            let start = self.position(entry.start)?;
            let end = self.position(entry.end)?;
            let cont = self.position(entry.cont)?;
            if cont >= self.insns.len() {
                continue;
            }
            let handler = block_of[cont];
            for block in blocks.iter_mut() {
                let covered = block.start < end && start < block.end;
                let edge = Edge {
                    kind: EdgeKind::Exception,
                    target: handler,
                };
                if covered && !block.successors.contains(&edge) {
                    block.successors.push(edge);
                }
            }
        }

        let edges: Vec<(usize, usize)> = blocks
            .iter()
            .flat_map(|block| block.successor_ids().map(move |target| (block.id, target)))
            .collect();
        for (from, to) in edges {
            if !blocks[to].predecessors.contains(&from) {
                blocks[to].predecessors.push(from);
            }
        }

        let mut entries = vec![0];
        for label in self.iseq.args.opt.iter() {
            entries.push(block_of[self.position(*label)?]);
        }
        mark_reachable(&mut blocks, entries);

        Ok(ControlFlowGraph {
            id,
            iseq: self.iseq,
            insns: self.insns,
            blocks,
            block_of,
        })
    }
}

fn mark_reachable(blocks: &mut [BasicBlock], mut worklist: Vec<usize>) {
    if blocks.is_empty() {
        return;
    }
    while let Some(id) = worklist.pop() {
        if blocks[id].reachable {
            continue;
        }
        blocks[id].reachable = true;
        worklist.extend(blocks[id].successor_ids());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ir::{Entry, IseqKind};
    use crate::bytecode::options::CompileOptions;
    use crate::compile;
    use crate::lang::location::Location;
    use crate::lang::node::{Node, NodeKind, Params, RescueClause};

    fn assert_partition(cfg: &ControlFlowGraph<'_>) {
        let mut next = 0;
        for block in cfg.blocks() {
            assert_eq!(block.start, next);
            assert!(!block.is_empty());
            next = block.end;
        }
        assert_eq!(next, cfg.insns().len());
    }

    #[test]
    fn test_straight_line_is_one_block() {
        let program = compile(&Node::program(vec![Node::binary(Node::int(2), "+", Node::int(3))])).unwrap();
        let cfg = ControlFlowGraph::build(&program, IseqId::ROOT).unwrap();
        assert_eq!(cfg.blocks().len(), 1);
        assert!(cfg.blocks()[0].successors.is_empty());
        assert!(cfg.blocks()[0].reachable);
    }

    #[test]
    fn test_if_else_diamond() {
        let node = Node::if_else(Node::lvar("a"), Node::int(1), Some(Node::int(2)));
        let program = compile(&Node::program(vec![Node::lasgn("a", Node::nil()), node])).unwrap();
        let cfg = ControlFlowGraph::build(&program, IseqId::ROOT).unwrap();
        assert_partition(&cfg);
        assert_eq!(cfg.blocks().len(), 3);

        let head = &cfg.blocks()[0];
        let kinds: Vec<EdgeKind> = head.successors.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EdgeKind::Branch, EdgeKind::Fallthrough]);
        assert_eq!(cfg.blocks()[1].predecessors, vec![0]);
        assert_eq!(cfg.blocks()[2].predecessors, vec![0]);
        assert!(cfg.blocks().iter().all(|b| b.reachable));
    }

    #[test]
    fn test_while_loop_back_edge() {
        let node = Node::new(NodeKind::While {
            predicate: Box::new(Node::lvar("i")),
            body: Box::new(Node::lasgn("i", Node::nil())),
        });
        let program = compile(&Node::program(vec![Node::lasgn("i", Node::int(1)), node])).unwrap();
        let cfg = ControlFlowGraph::build(&program, IseqId::ROOT).unwrap();
        assert_partition(&cfg);
        assert!(cfg.blocks().iter().any(|b| b.successor_ids().any(|target| target <= b.id)));
    }

    #[test]
    fn test_rescue_adds_exception_edges() {
        let node = Node::new(NodeKind::Begin {
            body: Box::new(Node::fcall("risky", vec![])),
            rescues: vec![RescueClause {
                exceptions: vec![],
                binding: None,
                body: Node::int(0),
            }],
            else_branch: None,
            ensure: None,
        });
        let program = compile(&Node::program(vec![node])).unwrap();
        let cfg = ControlFlowGraph::build(&program, IseqId::ROOT).unwrap();
        assert_partition(&cfg);
        assert!(
            cfg.blocks()
                .iter()
                .flat_map(|b| b.successors.iter())
                .any(|e| e.kind == EdgeKind::Exception)
        );
    }

    #[test]
    fn test_dead_code_is_unreachable() {
        let mut iseq = InstructionSequence::new(IseqKind::Top, "<main>", "<test>", Location::line(1), None, CompileOptions::plain());
        iseq.entries = vec![
            Entry::Insn(Insn::PutNil),
            Entry::Insn(Insn::Leave),
            Entry::Insn(Insn::PutNil),
            Entry::Insn(Insn::Leave),
        ];
        let program = Program::new(iseq);
        let cfg = ControlFlowGraph::build(&program, IseqId::ROOT).unwrap();
        assert_eq!(cfg.blocks().len(), 2);
        let unreachable: Vec<usize> = cfg.unreachable_blocks().map(|b| b.id).collect();
        assert_eq!(unreachable, vec![1]);
    }

    #[test]
    fn test_optional_params_are_entry_points() {
        let params = Params {
            optional: vec![("y".to_string(), Node::int(2))],
            ..Params::required(&["x"])
        };
        let program = compile(&Node::program(vec![Node::def("f", params, Node::lvar("y"))])).unwrap();
        let method = program.children(IseqId::ROOT)[0];
        let cfg = ControlFlowGraph::build(&program, method).unwrap();
        assert_partition(&cfg);
        assert!(cfg.blocks().iter().all(|b| b.reachable));
        assert!(cfg.render(&program).contains("== cfg: f"));
    }
}
