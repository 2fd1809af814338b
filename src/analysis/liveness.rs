//! Backward liveness of the level-0 locals of one sequence.
//!
//! Only accesses from the sequence itself are tracked. Reads from nested
//! blocks (`getlocal` at level 1 and above in a child) are not visible
//! here, so a slot that is dead by this analysis may still be captured.

use std::collections::BTreeSet;

use log::trace;

use crate::analysis::cfg::ControlFlowGraph;
use crate::bytecode::op::Insn;

/// Local slot read by `insn` in its own frame.
pub fn local_use(insn: &Insn) -> Option<usize> {
    match insn {
        Insn::GetLocal { index, level: 0 } | Insn::GetBlockParam { index, level: 0 } | Insn::GetLocalWC0(index) => {
            Some(*index)
        }
        _ => None,
    }
}

/// Local slot written by `insn` in its own frame.
pub fn local_def(insn: &Insn) -> Option<usize> {
    match insn {
        Insn::SetLocal { index, level: 0 } | Insn::SetLocalWC0(index) => Some(*index),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Liveness {
    /// Slots read before any write, per block.
    pub uses: Vec<BTreeSet<usize>>,
    /// Slots written, per block.
    pub defs: Vec<BTreeSet<usize>>,
    pub live_in: Vec<BTreeSet<usize>>,
    pub live_out: Vec<BTreeSet<usize>>,
}

impl Liveness {
    pub fn compute(cfg: &ControlFlowGraph<'_>) -> Self {
        let count = cfg.blocks().len();
        let mut uses = vec![BTreeSet::new(); count];
        let mut defs = vec![BTreeSet::new(); count];

        for block in cfg.blocks() {
            for insn in cfg.block_insns(block.id) {
                if let Some(slot) = local_use(insn) {
                    if !defs[block.id].contains(&slot) {
                        uses[block.id].insert(slot);
                    }
                }
                if let Some(slot) = local_def(insn) {
                    defs[block.id].insert(slot);
                }
            }
        }

        let mut live_in: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); count];
        let mut live_out: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); count];
        let mut rounds = 0;
        let mut changed = true;
        while changed {
            changed = false;
            rounds += 1;
            for block in cfg.blocks().iter().rev() {
                let id = block.id;
                let out: BTreeSet<usize> = block
                    .successor_ids()
                    .flat_map(|succ| live_in[succ].iter().copied())
                    .collect();
                let mut inb = uses[id].clone();
                inb.extend(out.difference(&defs[id]).copied());

                if inb != live_in[id] || out != live_out[id] {
                    live_in[id] = inb;
                    live_out[id] = out;
                    changed = true;
                }
            }
        }
        trace!("liveness of '{}' converged after {} rounds", cfg.iseq.name, rounds);

        Self {
            uses,
            defs,
            live_in,
            live_out,
        }
    }

    pub fn is_live_in(&self, block: usize, slot: usize) -> bool {
        self.live_in.get(block).is_some_and(|set| set.contains(&slot))
    }

    pub fn is_live_out(&self, block: usize, slot: usize) -> bool {
        self.live_out.get(block).is_some_and(|set| set.contains(&slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ir::IseqId;
    use crate::compile;
    use crate::lang::node::{Node, NodeKind, Params};

    #[test]
    fn test_parameter_live_at_entry() {
        let program = compile(&Node::program(vec![Node::def(
            "f",
            Params::required(&["x"]),
            Node::binary(Node::lvar("x"), "+", Node::int(1)),
        )]))
        .unwrap();
        let method = program.children(IseqId::ROOT)[0];
        let cfg = ControlFlowGraph::build(&program, method).unwrap();
        let live = Liveness::compute(&cfg);
        assert!(live.is_live_in(0, 0));
        assert!(live.live_out[0].is_empty());
    }

    #[test]
    fn test_write_kills_liveness() {
        let body = Node::statements(vec![Node::lasgn("x", Node::int(5)), Node::lvar("x")]);
        let program = compile(&Node::program(vec![Node::def("f", Params::required(&["x"]), body)])).unwrap();
        let method = program.children(IseqId::ROOT)[0];
        let cfg = ControlFlowGraph::build(&program, method).unwrap();
        let live = Liveness::compute(&cfg);
        assert!(!live.is_live_in(0, 0));
        assert!(live.defs[0].contains(&0));
    }

    #[test]
    fn test_loop_keeps_counter_live() {
        let node = Node::new(NodeKind::While {
            predicate: Box::new(Node::binary(Node::lvar("i"), "<", Node::int(10))),
            body: Box::new(Node::lasgn("i", Node::binary(Node::lvar("i"), "+", Node::int(1)))),
        });
        let program = compile(&Node::program(vec![Node::lasgn("i", Node::int(0)), node])).unwrap();
        let cfg = ControlFlowGraph::build(&program, IseqId::ROOT).unwrap();
        let live = Liveness::compute(&cfg);

        // the entry block writes i and so does not need it
        assert!(!live.is_live_in(0, 0));
        assert!(live.is_live_out(0, 0));
        for block in cfg.blocks().iter().skip(1) {
            if cfg.block_insns(block.id).iter().any(|insn| local_use(insn) == Some(0)) {
                assert!(live.is_live_in(block.id, 0));
            }
        }
    }
}
