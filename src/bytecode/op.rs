use std::rc::Rc;

use crate::bytecode::{calldata::CallData, ir::IseqId};
use crate::lang::literal::Literal;

// =============================================================================
// Operand constants
// =============================================================================

/// Operands of `putspecialobject`.
pub mod special_object {
    pub const VMCORE: u32 = 1;
    pub const CBASE: u32 = 2;
    pub const CONST_BASE: u32 = 3;
}

/// Flags of `defineclass`.
pub mod define_class {
    pub const TYPE_CLASS: u32 = 0;
    pub const TYPE_SINGLETON_CLASS: u32 = 1;
    pub const TYPE_MODULE: u32 = 2;
    pub const FLAG_SCOPED: u32 = 8;
    pub const FLAG_HAS_SUPERCLASS: u32 = 16;
}

/// Operands of `checkmatch`.
pub mod check_match {
    pub const TYPE_WHEN: u32 = 1;
    pub const TYPE_CASE: u32 = 2;
    pub const TYPE_RESCUE: u32 = 3;
    pub const ARRAY: u32 = 4;
}

/// Operands of `throw`.
pub mod throw_tag {
    pub const NONE: u32 = 0;
    pub const RETURN: u32 = 1;
    pub const BREAK: u32 = 2;
    pub const NEXT: u32 = 3;
}

/// Symbolic jump target, unique within one instruction sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub usize);

// =============================================================================
// Specialized call opcodes
// =============================================================================

/// Dedicated opcodes that replace `opt_send_without_block` for a fixed
/// `(selector, argc)` shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptOp {
    Length,
    Size,
    EmptyP,
    NilP,
    Succ,
    Not,
    Plus,
    Minus,
    Mult,
    Div,
    Mod,
    Eq,
    RegExpMatch2,
    Lt,
    Le,
    Gt,
    Ge,
    LtLt,
    And,
    Or,
    Aref,
    Aset,
}

impl OptOp {
    pub const ALL: [OptOp; 22] = [
        OptOp::Length,
        OptOp::Size,
        OptOp::EmptyP,
        OptOp::NilP,
        OptOp::Succ,
        OptOp::Not,
        OptOp::Plus,
        OptOp::Minus,
        OptOp::Mult,
        OptOp::Div,
        OptOp::Mod,
        OptOp::Eq,
        OptOp::RegExpMatch2,
        OptOp::Lt,
        OptOp::Le,
        OptOp::Gt,
        OptOp::Ge,
        OptOp::LtLt,
        OptOp::And,
        OptOp::Or,
        OptOp::Aref,
        OptOp::Aset,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OptOp::Length => "opt_length",
            OptOp::Size => "opt_size",
            OptOp::EmptyP => "opt_empty_p",
            OptOp::NilP => "opt_nil_p",
            OptOp::Succ => "opt_succ",
            OptOp::Not => "opt_not",
            OptOp::Plus => "opt_plus",
            OptOp::Minus => "opt_minus",
            OptOp::Mult => "opt_mult",
            OptOp::Div => "opt_div",
            OptOp::Mod => "opt_mod",
            OptOp::Eq => "opt_eq",
            OptOp::RegExpMatch2 => "opt_regexpmatch2",
            OptOp::Lt => "opt_lt",
            OptOp::Le => "opt_le",
            OptOp::Gt => "opt_gt",
            OptOp::Ge => "opt_ge",
            OptOp::LtLt => "opt_ltlt",
            OptOp::And => "opt_and",
            OptOp::Or => "opt_or",
            OptOp::Aref => "opt_aref",
            OptOp::Aset => "opt_aset",
        }
    }

    pub fn from_name(name: &str) -> Option<OptOp> {
        OptOp::ALL.iter().copied().find(|op| op.name() == name)
    }
}

/// What a simple call without a block is rewritten to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Specialization {
    Op(OptOp),
    /// `!=` has no primitive: `opt_neq` runs `==` and negates it.
    Neq,
}

/// `(selector, argc)` → specialized opcode.
pub const SPECIALIZATIONS: &[(&str, usize, Specialization)] = &[
    ("length", 0, Specialization::Op(OptOp::Length)),
    ("size", 0, Specialization::Op(OptOp::Size)),
    ("empty?", 0, Specialization::Op(OptOp::EmptyP)),
    ("nil?", 0, Specialization::Op(OptOp::NilP)),
    ("succ", 0, Specialization::Op(OptOp::Succ)),
    ("!", 0, Specialization::Op(OptOp::Not)),
    ("+", 1, Specialization::Op(OptOp::Plus)),
    ("-", 1, Specialization::Op(OptOp::Minus)),
    ("*", 1, Specialization::Op(OptOp::Mult)),
    ("/", 1, Specialization::Op(OptOp::Div)),
    ("%", 1, Specialization::Op(OptOp::Mod)),
    ("==", 1, Specialization::Op(OptOp::Eq)),
    ("!=", 1, Specialization::Neq),
    ("=~", 1, Specialization::Op(OptOp::RegExpMatch2)),
    ("<", 1, Specialization::Op(OptOp::Lt)),
    ("<=", 1, Specialization::Op(OptOp::Le)),
    (">", 1, Specialization::Op(OptOp::Gt)),
    (">=", 1, Specialization::Op(OptOp::Ge)),
    ("<<", 1, Specialization::Op(OptOp::LtLt)),
    ("&", 1, Specialization::Op(OptOp::And)),
    ("|", 1, Specialization::Op(OptOp::Or)),
    ("[]", 1, Specialization::Op(OptOp::Aref)),
    ("[]=", 2, Specialization::Op(OptOp::Aset)),
];

pub fn specialization_for(method: &str, argc: usize) -> Option<Specialization> {
    SPECIALIZATIONS
        .iter()
        .find(|(name, n, _)| *name == method && *n == argc)
        .map(|(_, _, spec)| *spec)
}

// =============================================================================
// INSN - Bytecode instructions
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Insn {
    /// ( ...n -- ) drop `n` values.
    AdjustStack(usize),
    /// ( value str -- str ) use `str` if `value` was not already a string.
    AnyToString,
    BranchIf(Label),
    BranchNil(Label),
    BranchUnless(Label),
    /// ( target pattern -- bool )
    CheckMatch(u32),
    ConcatStrings(usize),
    /// ( cbase superclass -- value )
    DefineClass {
        name: String,
        iseq: IseqId,
        flags: u32,
    },
    DefineMethod {
        name: String,
        iseq: IseqId,
    },
    /// ( receiver -- )
    DefineSMethod {
        name: String,
        iseq: IseqId,
    },
    Dup,
    DupArray(Literal),
    DupHash(Literal),
    DupN(usize),
    GetBlockParam {
        index: usize,
        level: usize,
    },
    /// Class variable read; the cache slot is absent for targets before 3.0.
    GetClassVariable {
        name: String,
        cache: Option<usize>,
    },
    /// ( cbase allow_nil -- value )
    GetConstant(String),
    GetGlobal(String),
    GetInstanceVariable {
        name: String,
        cache: usize,
    },
    /// Generic local read; `index` is the declaration index in the table
    /// `level` scopes up.
    GetLocal {
        index: usize,
        level: usize,
    },
    GetLocalWC0(usize),
    GetLocalWC1(usize),
    Intern,
    InvokeBlock(Rc<CallData>),
    InvokeSuper {
        calldata: Rc<CallData>,
        block: Option<IseqId>,
    },
    Jump(Label),
    /// ( value -- ) return `value` from the current frame.
    Leave,
    NewArray(usize),
    NewHash(usize),
    /// ( low high -- range ); flag 1 excludes the end.
    NewRange(u32),
    Nop,
    ObjToString(Rc<CallData>),
    /// Specialized simple call.
    Opt(OptOp, Rc<CallData>),
    /// ( recv obj -- bool ) `!(recv == obj)`.
    OptNeq {
        eq: Rc<CallData>,
        neq: Rc<CallData>,
    },
    OptGetConstantPath {
        names: Vec<String>,
        cache: usize,
    },
    /// ( -- value ) push the cached value and jump, or push nil.
    OptGetInlineCache {
        label: Label,
        cache: usize,
    },
    OptSetInlineCache(usize),
    OptNewArrayMax(usize),
    OptNewArrayMin(usize),
    OptSendWithoutBlock(Rc<CallData>),
    OptStrFreeze {
        value: String,
        calldata: Rc<CallData>,
    },
    OptStrUMinus {
        value: String,
        calldata: Rc<CallData>,
    },
    Pop,
    PutNil,
    PutObject(Literal),
    PutObjectInt2Fix0,
    PutObjectInt2Fix1,
    PutSelf,
    PutSpecialObject(u32),
    PutString(String),
    Send {
        calldata: Rc<CallData>,
        block: Option<IseqId>,
    },
    SetClassVariable {
        name: String,
        cache: Option<usize>,
    },
    /// ( value cbase -- )
    SetConstant(String),
    SetGlobal(String),
    SetInstanceVariable {
        name: String,
        cache: usize,
    },
    SetLocal {
        index: usize,
        level: usize,
    },
    SetLocalWC0(usize),
    SetLocalWC1(usize),
    /// Copy the top value `n` slots down, keeping it on top.
    SetN(usize),
    SplatArray(bool),
    Swap,
    /// ( value -- value ) non-local exit with a `throw_tag`.
    Throw(u32),
    /// Push a copy of the value `n` slots below the top.
    TopN(usize),
}

impl Insn {
    /// Instruction name as it appears in disassembly and dumps.
    pub fn name(&self) -> &'static str {
        match self {
            Insn::AdjustStack(_) => "adjuststack",
            Insn::AnyToString => "anytostring",
            Insn::BranchIf(_) => "branchif",
            Insn::BranchNil(_) => "branchnil",
            Insn::BranchUnless(_) => "branchunless",
            Insn::CheckMatch(_) => "checkmatch",
            Insn::ConcatStrings(_) => "concatstrings",
            Insn::DefineClass { .. } => "defineclass",
            Insn::DefineMethod { .. } => "definemethod",
            Insn::DefineSMethod { .. } => "definesmethod",
            Insn::Dup => "dup",
            Insn::DupArray(_) => "duparray",
            Insn::DupHash(_) => "duphash",
            Insn::DupN(_) => "dupn",
            Insn::GetBlockParam { .. } => "getblockparam",
            Insn::GetClassVariable { .. } => "getclassvariable",
            Insn::GetConstant(_) => "getconstant",
            Insn::GetGlobal(_) => "getglobal",
            Insn::GetInstanceVariable { .. } => "getinstancevariable",
            Insn::GetLocal { .. } => "getlocal",
            Insn::GetLocalWC0(_) => "getlocal_WC_0",
            Insn::GetLocalWC1(_) => "getlocal_WC_1",
            Insn::Intern => "intern",
            Insn::InvokeBlock(_) => "invokeblock",
            Insn::InvokeSuper { .. } => "invokesuper",
            Insn::Jump(_) => "jump",
            Insn::Leave => "leave",
            Insn::NewArray(_) => "newarray",
            Insn::NewHash(_) => "newhash",
            Insn::NewRange(_) => "newrange",
            Insn::Nop => "nop",
            Insn::ObjToString(_) => "objtostring",
            Insn::Opt(op, _) => op.name(),
            Insn::OptNeq { .. } => "opt_neq",
            Insn::OptGetConstantPath { .. } => "opt_getconstant_path",
            Insn::OptGetInlineCache { .. } => "opt_getinlinecache",
            Insn::OptSetInlineCache(_) => "opt_setinlinecache",
            Insn::OptNewArrayMax(_) => "opt_newarray_max",
            Insn::OptNewArrayMin(_) => "opt_newarray_min",
            Insn::OptSendWithoutBlock(_) => "opt_send_without_block",
            Insn::OptStrFreeze { .. } => "opt_str_freeze",
            Insn::OptStrUMinus { .. } => "opt_str_uminus",
            Insn::Pop => "pop",
            Insn::PutNil => "putnil",
            Insn::PutObject(_) => "putobject",
            Insn::PutObjectInt2Fix0 => "putobject_INT2FIX_0_",
            Insn::PutObjectInt2Fix1 => "putobject_INT2FIX_1_",
            Insn::PutSelf => "putself",
            Insn::PutSpecialObject(_) => "putspecialobject",
            Insn::PutString(_) => "putstring",
            Insn::Send { .. } => "send",
            Insn::SetClassVariable { .. } => "setclassvariable",
            Insn::SetConstant(_) => "setconstant",
            Insn::SetGlobal(_) => "setglobal",
            Insn::SetInstanceVariable { .. } => "setinstancevariable",
            Insn::SetLocal { .. } => "setlocal",
            Insn::SetLocalWC0(_) => "setlocal_WC_0",
            Insn::SetLocalWC1(_) => "setlocal_WC_1",
            Insn::SetN(_) => "setn",
            Insn::SplatArray(_) => "splatarray",
            Insn::Swap => "swap",
            Insn::Throw(_) => "throw",
            Insn::TopN(_) => "topn",
        }
    }

    /// Values popped from the operand stack.
    pub fn pops(&self) -> usize {
        match self {
            Insn::AdjustStack(n) => *n,
            Insn::AnyToString => 2,
            Insn::BranchIf(_) | Insn::BranchNil(_) | Insn::BranchUnless(_) => 1,
            Insn::CheckMatch(_) => 2,
            Insn::ConcatStrings(n) => *n,
            Insn::DefineClass { .. } => 2,
            Insn::DefineMethod { .. } => 0,
            Insn::DefineSMethod { .. } => 1,
            Insn::Dup => 1,
            Insn::DupArray(_) | Insn::DupHash(_) => 0,
            Insn::DupN(n) => *n,
            Insn::GetBlockParam { .. }
            | Insn::GetClassVariable { .. }
            | Insn::GetGlobal(_)
            | Insn::GetInstanceVariable { .. }
            | Insn::GetLocal { .. }
            | Insn::GetLocalWC0(_)
            | Insn::GetLocalWC1(_) => 0,
            Insn::GetConstant(_) => 2,
            Insn::Intern => 1,
            Insn::InvokeBlock(cd) => cd.stack_args(),
            Insn::InvokeSuper { calldata, .. } => calldata.stack_args() + 1,
            Insn::Jump(_) => 0,
            Insn::Leave => 1,
            Insn::NewArray(n) | Insn::NewHash(n) => *n,
            Insn::NewRange(_) => 2,
            Insn::Nop => 0,
            Insn::ObjToString(_) => 1,
            Insn::Opt(_, cd) => cd.argc + 1,
            Insn::OptNeq { .. } => 2,
            Insn::OptGetConstantPath { .. } | Insn::OptGetInlineCache { .. } => 0,
            Insn::OptSetInlineCache(_) => 1,
            Insn::OptNewArrayMax(n) | Insn::OptNewArrayMin(n) => *n,
            Insn::OptSendWithoutBlock(cd) => cd.stack_args() + 1,
            Insn::OptStrFreeze { .. } | Insn::OptStrUMinus { .. } => 0,
            Insn::Pop => 1,
            Insn::PutNil
            | Insn::PutObject(_)
            | Insn::PutObjectInt2Fix0
            | Insn::PutObjectInt2Fix1
            | Insn::PutSelf
            | Insn::PutSpecialObject(_)
            | Insn::PutString(_) => 0,
            Insn::Send { calldata, .. } => calldata.stack_args() + 1,
            Insn::SetClassVariable { .. }
            | Insn::SetGlobal(_)
            | Insn::SetInstanceVariable { .. }
            | Insn::SetLocal { .. }
            | Insn::SetLocalWC0(_)
            | Insn::SetLocalWC1(_) => 1,
            Insn::SetConstant(_) => 2,
            Insn::SetN(n) => n + 1,
            Insn::SplatArray(_) => 1,
            Insn::Swap => 2,
            Insn::Throw(_) => 1,
            Insn::TopN(n) => n + 1,
        }
    }

    /// Values pushed onto the operand stack.
    pub fn pushes(&self) -> usize {
        match self {
            Insn::AdjustStack(_)
            | Insn::BranchIf(_)
            | Insn::BranchNil(_)
            | Insn::BranchUnless(_)
            | Insn::DefineMethod { .. }
            | Insn::DefineSMethod { .. }
            | Insn::Jump(_)
            | Insn::Leave
            | Insn::Nop
            | Insn::Pop
            | Insn::SetClassVariable { .. }
            | Insn::SetConstant(_)
            | Insn::SetGlobal(_)
            | Insn::SetInstanceVariable { .. }
            | Insn::SetLocal { .. }
            | Insn::SetLocalWC0(_)
            | Insn::SetLocalWC1(_) => 0,
            Insn::Dup => 2,
            Insn::DupN(n) => n * 2,
            Insn::SetN(n) => n + 1,
            Insn::Swap => 2,
            Insn::TopN(n) => n + 2,
            _ => 1,
        }
    }

    /// Net stack effect.
    pub fn stack_effect(&self) -> isize {
        self.pushes() as isize - self.pops() as isize
    }

    /// Encoded length in words: the opcode plus its operands.
    pub fn length(&self) -> usize {
        let operands = match self {
            Insn::AnyToString
            | Insn::Dup
            | Insn::Intern
            | Insn::Leave
            | Insn::Nop
            | Insn::Pop
            | Insn::PutNil
            | Insn::PutObjectInt2Fix0
            | Insn::PutObjectInt2Fix1
            | Insn::PutSelf
            | Insn::Swap => 0,
            Insn::DefineClass { .. } => 3,
            Insn::DefineMethod { .. }
            | Insn::DefineSMethod { .. }
            | Insn::GetBlockParam { .. }
            | Insn::GetInstanceVariable { .. }
            | Insn::GetLocal { .. }
            | Insn::InvokeSuper { .. }
            | Insn::OptNeq { .. }
            | Insn::OptGetInlineCache { .. }
            | Insn::OptStrFreeze { .. }
            | Insn::OptStrUMinus { .. }
            | Insn::Send { .. }
            | Insn::SetInstanceVariable { .. }
            | Insn::SetLocal { .. } => 2,
            Insn::GetClassVariable { cache, .. } | Insn::SetClassVariable { cache, .. } => {
                1 + usize::from(cache.is_some())
            }
            _ => 1,
        };
        1 + operands
    }

    /// Labels this instruction may transfer control to.
    pub fn branch_targets(&self) -> Vec<Label> {
        match self {
            Insn::BranchIf(label)
            | Insn::BranchNil(label)
            | Insn::BranchUnless(label)
            | Insn::Jump(label)
            | Insn::OptGetInlineCache { label, .. } => vec![*label],
            _ => Vec::new(),
        }
    }

    pub fn branch_targets_mut(&mut self) -> Option<&mut Label> {
        match self {
            Insn::BranchIf(label)
            | Insn::BranchNil(label)
            | Insn::BranchUnless(label)
            | Insn::Jump(label)
            | Insn::OptGetInlineCache { label, .. } => Some(label),
            _ => None,
        }
    }

    /// Ends a frame: no fallthrough and no intra-sequence target.
    pub fn leaves(&self) -> bool {
        matches!(self, Insn::Leave | Insn::Throw(_))
    }

    /// Whether control can continue with the next instruction.
    pub fn falls_through(&self) -> bool {
        !self.leaves() && !matches!(self, Insn::Jump(_))
    }

    pub fn is_control_transfer(&self) -> bool {
        self.leaves() || !self.branch_targets().is_empty()
    }

    /// Nested sequence referenced by this instruction.
    pub fn child_iseq(&self) -> Option<IseqId> {
        match self {
            Insn::DefineClass { iseq, .. }
            | Insn::DefineMethod { iseq, .. }
            | Insn::DefineSMethod { iseq, .. } => Some(*iseq),
            Insn::Send { block, .. } | Insn::InvokeSuper { block, .. } => *block,
            _ => None,
        }
    }

    pub fn calldata(&self) -> Option<&Rc<CallData>> {
        match self {
            Insn::InvokeBlock(cd)
            | Insn::ObjToString(cd)
            | Insn::Opt(_, cd)
            | Insn::OptSendWithoutBlock(cd) => Some(cd),
            Insn::InvokeSuper { calldata, .. }
            | Insn::Send { calldata, .. }
            | Insn::OptStrFreeze { calldata, .. }
            | Insn::OptStrUMinus { calldata, .. } => Some(calldata),
            Insn::OptNeq { neq, .. } => Some(neq),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specialization_table_lookup() {
        assert_eq!(specialization_for("+", 1), Some(Specialization::Op(OptOp::Plus)));
        assert_eq!(specialization_for("!=", 1), Some(Specialization::Neq));
        assert_eq!(specialization_for("[]=", 2), Some(Specialization::Op(OptOp::Aset)));
        assert_eq!(specialization_for("+", 2), None);
        assert_eq!(specialization_for("puts", 1), None);
    }

    #[test]
    fn test_table_names_are_unique() {
        for (i, (name, argc, _)) in SPECIALIZATIONS.iter().enumerate() {
            for (other, other_argc, _) in &SPECIALIZATIONS[i + 1..] {
                assert!(!(name == other && argc == other_argc), "duplicate {}", name);
            }
        }
        assert_eq!(SPECIALIZATIONS.len(), 23);
    }

    #[test]
    fn test_opt_op_names_round_trip() {
        for op in OptOp::ALL {
            assert_eq!(OptOp::from_name(op.name()), Some(op));
        }
    }

    #[test]
    fn test_send_effect_counts_receiver_and_block_arg() {
        let cd = CallData::new("foo", 2, CallData::ARGS_BLOCKARG);
        let insn = Insn::Send {
            calldata: cd,
            block: None,
        };
        assert_eq!(insn.pops(), 4);
        assert_eq!(insn.pushes(), 1);
        assert_eq!(insn.length(), 3);
    }

    #[test]
    fn test_binary_op_effect() {
        let insn = Insn::Opt(OptOp::Plus, CallData::simple("+", 1));
        assert_eq!(insn.stack_effect(), -1);
        assert_eq!(insn.pops(), 2);
    }

    #[test]
    fn test_control_transfer_classification() {
        assert!(!Insn::Jump(Label(0)).falls_through());
        assert!(Insn::BranchIf(Label(0)).falls_through());
        assert!(Insn::Leave.leaves());
        assert!(Insn::Throw(throw_tag::BREAK).is_control_transfer());
        assert!(!Insn::Pop.is_control_transfer());
    }

    #[test]
    fn test_topn_and_setn_effects() {
        assert_eq!(Insn::TopN(2).stack_effect(), 1);
        assert_eq!(Insn::SetN(2).stack_effect(), 0);
        assert_eq!(Insn::DupN(2).stack_effect(), 2);
    }
}
