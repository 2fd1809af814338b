//! Cinder compiles syntax trees of a Ruby-like language into YARV-style
//! instruction sequences, and can dump, analyze and execute them.
//!
//! ```text
//! Node ──compile──▶ Program ──┬── serialize (dump / load)
//!                             ├── disasm
//!                             ├── analysis (cfg, liveness, decompile)
//!                             └── runtime (vm)
//! ```

pub mod analysis;
pub mod bytecode;
pub mod lang;
pub mod runtime;

pub use bytecode::{CompileError, CompileOptions, Program, TargetVersion};
pub use lang::{Literal, Location, Node, NodeKind};
pub use runtime::{RuntimeError, Value, Vm, VmConfig};

/// File label used when none is given.
pub const DEFAULT_FILE: &str = "<compiled>";

/// Compile `node` with every optimization enabled.
pub fn compile(node: &Node) -> Result<Program, CompileError> {
    compile_with_options(node, CompileOptions::default())
}

pub fn compile_with_options(node: &Node, options: CompileOptions) -> Result<Program, CompileError> {
    bytecode::Compiler::new(options, DEFAULT_FILE).compile(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ControlFlowGraph;
    use crate::bytecode::stack_check::check_program;
    use crate::lang::node::Params;

    fn sample() -> Node {
        let each = Node::call(Some(Node::new(NodeKind::Array(vec![Node::int(1), Node::int(2)]))), "each", vec![])
            .with_block(
                Params::required(&["i"]),
                Node::lasgn("sum", Node::binary(Node::lvar("sum"), "+", Node::lvar("i"))),
            );
        Node::program(vec![
            Node::def("double", Params::required(&["x"]), Node::binary(Node::lvar("x"), "*", Node::int(2))),
            Node::lasgn("sum", Node::int(0)),
            each,
            Node::if_else(
                Node::binary(Node::lvar("sum"), ">", Node::int(2)),
                Node::fcall("double", vec![Node::lvar("sum")]),
                Some(Node::nil()),
            ),
        ])
    }

    #[test]
    fn test_loaded_program_runs_like_the_original() {
        let program = compile(&sample()).unwrap();
        let bytes = program.dump().unwrap();
        let loaded = Program::load(&bytes).unwrap();
        assert_eq!(loaded.dump().unwrap(), bytes);

        let expected = Vm::new().run(&program).unwrap();
        assert_eq!(expected, Value::Integer(6));
        assert_eq!(Vm::new().run(&loaded).unwrap(), expected);
    }

    #[test]
    fn test_every_option_set_passes_stack_check() {
        let targets = [TargetVersion::V3_0, TargetVersion::V3_2, TargetVersion::LATEST];
        for target in targets {
            for options in [CompileOptions::default(), CompileOptions::plain()] {
                let program = compile_with_options(&sample(), options.with_target(target)).unwrap();
                check_program(&program).unwrap();
                assert_eq!(Vm::new().run(&program).unwrap(), Value::Integer(6));
            }
        }
    }

    #[test]
    fn test_blocks_partition_every_sequence() {
        let program = compile(&sample()).unwrap();
        for (id, iseq) in program.iter() {
            let cfg = ControlFlowGraph::build(&program, id).unwrap();
            let mut next = 0;
            for block in cfg.blocks() {
                assert_eq!(block.start, next, "gap before block {} of {}", block.id, iseq.name);
                assert!(block.end > block.start);
                next = block.end;
            }
            assert_eq!(next, iseq.insn_count());
        }
    }
}
