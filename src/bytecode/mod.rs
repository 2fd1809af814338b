pub mod builder;
pub mod calldata;
pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod ir;
pub mod local_table;
pub mod op;
pub mod options;
pub mod peephole;
pub mod serialize;
pub mod stack;
pub mod stack_check;

pub use calldata::CallData;
pub use compile::Compiler;
pub use compile_error::CompileError;
pub use ir::{CatchEntry, CatchKind, Entry, InstructionSequence, IseqId, IseqKind, Program};
pub use op::{Insn, Label, OptOp};
pub use options::{CompileOptions, TargetVersion};
pub use serialize::SerializationError;
pub use stack_check::StackCheckError;
