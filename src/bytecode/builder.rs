//! Instruction emitters.
//!
//! Each emitter is named after the instruction it produces, applies the
//! instruction's stack effect to the sequence's tracker and consults the
//! sequence's [`CompileOptions`](crate::bytecode::options::CompileOptions)
//! to pick the most specific encoding.

use std::rc::Rc;

use log::trace;

use crate::bytecode::calldata::CallData;
use crate::bytecode::compile_error::CompileError;
use crate::bytecode::ir::{Entry, InstructionSequence, IseqId};
use crate::bytecode::op::{Insn, Label, Specialization, specialization_for};
use crate::bytecode::options::TargetVersion;
use crate::lang::literal::Literal;

type BuildResult = Result<(), CompileError>;

impl InstructionSequence {
    /// Append `insn`, applying its stack effect.
    pub fn push(&mut self, insn: Insn) -> BuildResult {
        let (pops, pushes) = (insn.pops(), insn.pushes());
        if let Err(underflow) = self.stack.change(pops, pushes) {
            return Err(CompileError::underflow(
                &self.name,
                insn.name(),
                underflow.depth,
                underflow.pops,
            ));
        }
        trace!("{}: {} (depth {})", self.name, insn.name(), self.stack.current());
        self.entries.push(Entry::Insn(insn));
        Ok(())
    }

    // ─── Stack manipulation ───

    pub fn adjuststack(&mut self, n: usize) -> BuildResult {
        self.push(Insn::AdjustStack(n))
    }

    pub fn dup(&mut self) -> BuildResult {
        self.push(Insn::Dup)
    }

    pub fn dupn(&mut self, n: usize) -> BuildResult {
        self.push(Insn::DupN(n))
    }

    pub fn pop(&mut self) -> BuildResult {
        self.push(Insn::Pop)
    }

    pub fn setn(&mut self, n: usize) -> BuildResult {
        self.push(Insn::SetN(n))
    }

    pub fn swap(&mut self) -> BuildResult {
        self.push(Insn::Swap)
    }

    pub fn topn(&mut self, n: usize) -> BuildResult {
        self.push(Insn::TopN(n))
    }

    pub fn nop(&mut self) -> BuildResult {
        self.push(Insn::Nop)
    }

    // ─── Literals ───

    pub fn putnil(&mut self) -> BuildResult {
        self.push(Insn::PutNil)
    }

    pub fn putself(&mut self) -> BuildResult {
        self.push(Insn::PutSelf)
    }

    pub fn putobject(&mut self, value: Literal) -> BuildResult {
        if self.options.operands_unification {
            match value {
                Literal::Integer(0) => return self.push(Insn::PutObjectInt2Fix0),
                Literal::Integer(1) => return self.push(Insn::PutObjectInt2Fix1),
                _ => {}
            }
        }
        self.push(Insn::PutObject(value))
    }

    pub fn putstring(&mut self, value: impl Into<String>) -> BuildResult {
        let value = value.into();
        if self.options.frozen_string_literal {
            return self.push(Insn::PutObject(Literal::String(value)));
        }
        self.push(Insn::PutString(value))
    }

    pub fn putspecialobject(&mut self, object: u32) -> BuildResult {
        self.push(Insn::PutSpecialObject(object))
    }

    pub fn duparray(&mut self, value: Literal) -> BuildResult {
        self.push(Insn::DupArray(value))
    }

    pub fn duphash(&mut self, value: Literal) -> BuildResult {
        self.push(Insn::DupHash(value))
    }

    pub fn newarray(&mut self, n: usize) -> BuildResult {
        self.push(Insn::NewArray(n))
    }

    pub fn newhash(&mut self, n: usize) -> BuildResult {
        self.push(Insn::NewHash(n))
    }

    pub fn newrange(&mut self, exclusive: bool) -> BuildResult {
        self.push(Insn::NewRange(u32::from(exclusive)))
    }

    pub fn splatarray(&mut self, copy: bool) -> BuildResult {
        self.push(Insn::SplatArray(copy))
    }

    // ─── Strings ───

    pub fn anytostring(&mut self) -> BuildResult {
        self.push(Insn::AnyToString)
    }

    pub fn concatstrings(&mut self, n: usize) -> BuildResult {
        self.push(Insn::ConcatStrings(n))
    }

    pub fn objtostring(&mut self) -> BuildResult {
        self.push(Insn::ObjToString(CallData::new("to_s", 0, CallData::FCALL | CallData::ARGS_SIMPLE)))
    }

    pub fn intern(&mut self) -> BuildResult {
        self.push(Insn::Intern)
    }

    // ─── Branches ───

    pub fn branchif(&mut self, label: Label) -> BuildResult {
        self.push(Insn::BranchIf(label))
    }

    pub fn branchunless(&mut self, label: Label) -> BuildResult {
        self.push(Insn::BranchUnless(label))
    }

    pub fn branchnil(&mut self, label: Label) -> BuildResult {
        self.push(Insn::BranchNil(label))
    }

    pub fn jump(&mut self, label: Label) -> BuildResult {
        self.push(Insn::Jump(label))
    }

    pub fn leave(&mut self) -> BuildResult {
        self.push(Insn::Leave)
    }

    pub fn throw(&mut self, tag: u32) -> BuildResult {
        self.push(Insn::Throw(tag))
    }

    pub fn checkmatch(&mut self, kind: u32) -> BuildResult {
        self.push(Insn::CheckMatch(kind))
    }

    // ─── Locals ───

    pub fn getlocal(&mut self, index: usize, level: usize) -> BuildResult {
        if self.options.operands_unification {
            match level {
                0 => return self.push(Insn::GetLocalWC0(index)),
                1 => return self.push(Insn::GetLocalWC1(index)),
                _ => {}
            }
        }
        self.push(Insn::GetLocal { index, level })
    }

    pub fn setlocal(&mut self, index: usize, level: usize) -> BuildResult {
        if self.options.operands_unification {
            match level {
                0 => return self.push(Insn::SetLocalWC0(index)),
                1 => return self.push(Insn::SetLocalWC1(index)),
                _ => {}
            }
        }
        self.push(Insn::SetLocal { index, level })
    }

    pub fn getblockparam(&mut self, index: usize, level: usize) -> BuildResult {
        self.push(Insn::GetBlockParam { index, level })
    }

    // ─── Instance, class and global variables ───

    fn ivar_cache(&mut self, name: &str) -> usize {
        if self.options.target_version.at_least(TargetVersion::V3_2) {
            self.inline_storages.per_site()
        } else {
            self.inline_storages.per_name(name)
        }
    }

    fn cvar_cache(&mut self, name: &str) -> Option<usize> {
        self.options
            .target_version
            .at_least(TargetVersion::V3_0)
            .then(|| self.inline_storages.per_name(name))
    }

    pub fn getinstancevariable(&mut self, name: &str) -> BuildResult {
        let cache = self.ivar_cache(name);
        self.push(Insn::GetInstanceVariable {
            name: name.to_string(),
            cache,
        })
    }

    pub fn setinstancevariable(&mut self, name: &str) -> BuildResult {
        let cache = self.ivar_cache(name);
        self.push(Insn::SetInstanceVariable {
            name: name.to_string(),
            cache,
        })
    }

    pub fn getclassvariable(&mut self, name: &str) -> BuildResult {
        let cache = self.cvar_cache(name);
        self.push(Insn::GetClassVariable {
            name: name.to_string(),
            cache,
        })
    }

    pub fn setclassvariable(&mut self, name: &str) -> BuildResult {
        let cache = self.cvar_cache(name);
        self.push(Insn::SetClassVariable {
            name: name.to_string(),
            cache,
        })
    }

    pub fn getglobal(&mut self, name: &str) -> BuildResult {
        self.push(Insn::GetGlobal(name.to_string()))
    }

    pub fn setglobal(&mut self, name: &str) -> BuildResult {
        self.push(Insn::SetGlobal(name.to_string()))
    }

    // ─── Constants ───

    pub fn getconstant(&mut self, name: &str) -> BuildResult {
        self.push(Insn::GetConstant(name.to_string()))
    }

    pub fn setconstant(&mut self, name: &str) -> BuildResult {
        self.push(Insn::SetConstant(name.to_string()))
    }

    /// Read a static constant path such as `A::B`.
    ///
    /// A leading empty segment anchors the path at the top level.
    pub fn constant_path(&mut self, names: &[String]) -> BuildResult {
        let options = self.options;
        if options.inline_const_cache && options.target_version.at_least(TargetVersion::V3_2) {
            let cache = self.inline_storages.per_site();
            return self.push(Insn::OptGetConstantPath {
                names: names.to_vec(),
                cache,
            });
        }

        let segments: Vec<&String> = names.iter().filter(|name| !name.is_empty()).collect();
        let cached = if options.inline_const_cache {
            let label = self.new_label();
            let cache = self.inline_storages.per_site();
            self.push(Insn::OptGetInlineCache { label, cache })?;
            Some((label, cache))
        } else {
            self.putnil()?;
            None
        };

        // the first lookup is lexical, later ones scope inside the previous result
        for (i, name) in segments.iter().enumerate() {
            self.push(Insn::PutObject(Literal::bool(i == 0)))?;
            self.getconstant(name)?;
        }

        if let Some((label, cache)) = cached {
            self.push(Insn::OptSetInlineCache(cache))?;
            self.place(label);
        }
        Ok(())
    }

    // ─── Definitions ───

    pub fn definemethod(&mut self, name: &str, iseq: IseqId) -> BuildResult {
        self.push(Insn::DefineMethod {
            name: name.to_string(),
            iseq,
        })
    }

    pub fn definesmethod(&mut self, name: &str, iseq: IseqId) -> BuildResult {
        self.push(Insn::DefineSMethod {
            name: name.to_string(),
            iseq,
        })
    }

    pub fn defineclass(&mut self, name: &str, iseq: IseqId, flags: u32) -> BuildResult {
        self.push(Insn::DefineClass {
            name: name.to_string(),
            iseq,
            flags,
        })
    }

    // ─── Calls ───

    /// Emit a method call, specializing it when the options allow.
    pub fn send(&mut self, calldata: Rc<CallData>, block: Option<IseqId>) -> BuildResult {
        if !self.options.specialized_instruction
            || block.is_some()
            || calldata.has(CallData::ARGS_BLOCKARG)
        {
            return self.push(Insn::Send { calldata, block });
        }

        if calldata.is_simple() {
            match specialization_for(&calldata.method, calldata.argc) {
                Some(Specialization::Op(op)) => return self.push(Insn::Opt(op, calldata)),
                Some(Specialization::Neq) => {
                    let eq = CallData::simple("==", 1);
                    return self.push(Insn::OptNeq { eq, neq: calldata });
                }
                None => {}
            }
        }
        self.push(Insn::OptSendWithoutBlock(calldata))
    }

    pub fn invokeblock(&mut self, calldata: Rc<CallData>) -> BuildResult {
        self.push(Insn::InvokeBlock(calldata))
    }

    pub fn invokesuper(&mut self, calldata: Rc<CallData>, block: Option<IseqId>) -> BuildResult {
        self.push(Insn::InvokeSuper { calldata, block })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ir::IseqKind;
    use crate::bytecode::op::OptOp;
    use crate::bytecode::options::CompileOptions;
    use crate::lang::location::Location;

    fn seq(options: CompileOptions) -> InstructionSequence {
        InstructionSequence::new(IseqKind::Top, "<main>", "<test>", Location::line(1), None, options)
    }

    fn names(iseq: &InstructionSequence) -> Vec<&'static str> {
        iseq.insns().map(Insn::name).collect()
    }

    // ─── Stack tracking ───

    #[test]
    fn test_emitters_track_depth() {
        let mut iseq = seq(CompileOptions::default());
        iseq.putobject(Literal::Integer(2)).unwrap();
        iseq.putobject(Literal::Integer(3)).unwrap();
        iseq.send(CallData::simple("+", 1), None).unwrap();
        assert_eq!(iseq.stack.current(), 1);
        assert_eq!(iseq.stack_max(), 2);
        iseq.leave().unwrap();
        assert_eq!(iseq.stack.current(), 0);
    }

    #[test]
    fn test_underflow_is_an_error() {
        let mut iseq = seq(CompileOptions::default());
        let err = iseq.pop().unwrap_err();
        assert!(matches!(err, CompileError::StackUnderflow { insn: "pop", .. }));
        assert!(iseq.entries.is_empty());
    }

    // ─── Specialization ───

    #[test]
    fn test_send_specialization() {
        let mut iseq = seq(CompileOptions::default());
        iseq.putself().unwrap();
        iseq.putobject(Literal::Integer(5)).unwrap();
        iseq.send(CallData::simple("+", 1), None).unwrap();
        iseq.putself().unwrap();
        iseq.send(CallData::new("foo", 0, CallData::FCALL | CallData::ARGS_SIMPLE), None)
            .unwrap();
        iseq.putself().unwrap();
        iseq.send(CallData::simple("each", 0), Some(IseqId(1))).unwrap();
        assert_eq!(
            names(&iseq),
            vec!["putself", "putobject", "opt_plus", "putself", "opt_send_without_block", "putself", "send"]
        );
    }

    #[test]
    fn test_neq_carries_both_call_data() {
        let mut iseq = seq(CompileOptions::default());
        iseq.putobject(Literal::Integer(2)).unwrap();
        iseq.putobject(Literal::Integer(3)).unwrap();
        iseq.send(CallData::simple("!=", 1), None).unwrap();
        match iseq.last_insn() {
            Some(Insn::OptNeq { eq, neq }) => {
                assert_eq!(eq.method, "==");
                assert_eq!(neq.method, "!=");
            }
            other => panic!("expected opt_neq, got {:?}", other),
        }
    }

    #[test]
    fn test_block_arg_prevents_specialization() {
        let mut iseq = seq(CompileOptions::default());
        iseq.putself().unwrap();
        iseq.putnil().unwrap();
        iseq.send(CallData::new("map", 0, CallData::ARGS_BLOCKARG), None).unwrap();
        assert_eq!(iseq.last_insn().map(Insn::name), Some("send"));
    }

    #[test]
    fn test_plain_options_keep_generic_forms() {
        let mut iseq = seq(CompileOptions::plain());
        iseq.putobject(Literal::Integer(1)).unwrap();
        iseq.putobject(Literal::Integer(0)).unwrap();
        iseq.send(CallData::simple("+", 1), None).unwrap();
        iseq.setlocal(0, 0).unwrap();
        assert_eq!(names(&iseq), vec!["putobject", "putobject", "send", "setlocal"]);
    }

    #[test]
    fn test_operand_unification() {
        let mut iseq = seq(CompileOptions::default());
        iseq.putobject(Literal::Integer(0)).unwrap();
        iseq.putobject(Literal::Integer(1)).unwrap();
        iseq.getlocal(0, 0).unwrap();
        iseq.getlocal(0, 1).unwrap();
        iseq.getlocal(0, 2).unwrap();
        assert_eq!(
            names(&iseq),
            vec!["putobject_INT2FIX_0_", "putobject_INT2FIX_1_", "getlocal_WC_0", "getlocal_WC_1", "getlocal"]
        );
    }

    #[test]
    fn test_frozen_string_literal() {
        let options = CompileOptions {
            frozen_string_literal: true,
            ..CompileOptions::default()
        };
        let mut iseq = seq(options);
        iseq.putstring("hi").unwrap();
        assert_eq!(iseq.last_insn(), Some(&Insn::PutObject(Literal::string("hi"))));
    }

    // ─── Version-gated caches ───

    #[test]
    fn test_ivar_cache_slots_by_version() {
        let mut modern = seq(CompileOptions::default());
        modern.getinstancevariable("@a").unwrap();
        modern.getinstancevariable("@a").unwrap();
        assert_eq!(modern.inline_storages.len(), 2);

        let mut legacy = seq(CompileOptions::default().with_target(TargetVersion::new(3, 1)));
        legacy.getinstancevariable("@a").unwrap();
        legacy.getinstancevariable("@a").unwrap();
        assert_eq!(legacy.inline_storages.len(), 1);
    }

    #[test]
    fn test_cvar_cache_absent_before_3_0() {
        let mut legacy = seq(CompileOptions::default().with_target(TargetVersion::new(2, 7)));
        legacy.getclassvariable("@@a").unwrap();
        assert_eq!(
            legacy.last_insn(),
            Some(&Insn::GetClassVariable {
                name: "@@a".to_string(),
                cache: None
            })
        );
        assert_eq!(legacy.last_insn().map(Insn::length), Some(2));
    }

    #[test]
    fn test_constant_path_encodings() {
        let path = vec!["A".to_string(), "B".to_string()];

        let mut modern = seq(CompileOptions::default());
        modern.constant_path(&path).unwrap();
        assert_eq!(names(&modern), vec!["opt_getconstant_path"]);
        assert_eq!(modern.stack.current(), 1);

        let mut legacy = seq(CompileOptions::default().with_target(TargetVersion::new(3, 1)));
        legacy.constant_path(&path).unwrap();
        assert_eq!(
            names(&legacy),
            vec![
                "opt_getinlinecache",
                "putobject",
                "getconstant",
                "putobject",
                "getconstant",
                "opt_setinlinecache"
            ]
        );
        assert_eq!(legacy.stack.current(), 1);
        assert!(matches!(legacy.entries.last(), Some(Entry::Label(_))));
    }

    #[test]
    fn test_opt_op_selection() {
        let mut iseq = seq(CompileOptions::default());
        iseq.putself().unwrap();
        iseq.send(CallData::simple("empty?", 0), None).unwrap();
        assert!(matches!(iseq.last_insn(), Some(Insn::Opt(OptOp::EmptyP, _))));
    }
}
