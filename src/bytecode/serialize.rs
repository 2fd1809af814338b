//! Simple-data-format dumps of compiled programs.
//!
//! A sequence is dumped as the nested array the reference runtime's
//! `to_a` produces:
//!
//! ```text
//! ["YARVInstructionSequence/SimpleDataFormat", major, minor, 1,
//!  {arg_size:, local_size:, stack_max:, node_id: -1, code_location: [..]},
//!  name, file, "<compiled>", first_line, :type,
//!  [locals...], {args}, [catch table...], [insns and :label_N...]]
//! ```
//!
//! Nested sequences are dumped inline where they are referenced. The tree
//! is a [`Literal`] and is turned into bytes with `postcard`.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use log::debug;
use thiserror::Error;

use crate::bytecode::calldata::CallData;
use crate::bytecode::ir::{
    ArgumentOptions, CatchEntry, CatchKind, Entry, InstructionSequence, IseqId, IseqKind, Program,
};
use crate::bytecode::local_table::LocalKind;
use crate::bytecode::op::{Insn, Label, OptOp, define_class, special_object};
use crate::bytecode::options::{CompileOptions, TargetVersion};
use crate::bytecode::stack::StackTracker;
use crate::lang::literal::Literal;
use crate::lang::location::Location;

pub const MAGIC: &str = "YARVInstructionSequence/SimpleDataFormat";
pub const FORMAT_TYPE: i64 = 1;
const ABSOLUTE_PATH: &str = "<compiled>";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerializationError {
    #[error("serialization error: {insn} is not available when targeting {version}")]
    Unsupported { insn: &'static str, version: TargetVersion },

    #[error("serialization error: '{iseq}' has no local {index} at level {level}")]
    UnknownLocal { iseq: String, index: usize, level: usize },

    #[error("serialization error: unknown instruction '{0}'")]
    UnknownInstruction(String),

    #[error("serialization error: malformed dump: {0}")]
    Malformed(String),

    #[error("serialization error: {0}")]
    Encoding(String),
}

type Result<T> = std::result::Result<T, SerializationError>;

fn malformed(what: impl Into<String>) -> SerializationError {
    SerializationError::Malformed(what.into())
}

// =============================================================================
// Tree helpers
// =============================================================================

fn int(value: usize) -> Literal {
    Literal::Integer(value as i64)
}

fn hash(pairs: Vec<(&str, Literal)>) -> Literal {
    Literal::Hash(pairs.into_iter().map(|(k, v)| (Literal::symbol(k), v)).collect())
}

fn as_usize(value: &Literal, what: &str) -> Result<usize> {
    value
        .as_integer()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| malformed(format!("{} must be a non-negative integer, got {}", what, value)))
}

fn as_symbol<'a>(value: &'a Literal, what: &str) -> Result<&'a str> {
    value
        .as_symbol()
        .ok_or_else(|| malformed(format!("{} must be a symbol, got {}", what, value)))
}

fn as_str<'a>(value: &'a Literal, what: &str) -> Result<&'a str> {
    match value {
        Literal::String(s) => Ok(s),
        other => Err(malformed(format!("{} must be a string, got {}", what, other))),
    }
}

fn as_array<'a>(value: &'a Literal, what: &str) -> Result<&'a [Literal]> {
    value
        .as_array()
        .ok_or_else(|| malformed(format!("{} must be an array", what)))
}

fn operand<'a>(operands: &'a [Literal], index: usize, insn: &str) -> Result<&'a Literal> {
    operands
        .get(index)
        .ok_or_else(|| malformed(format!("{} is missing operand {}", insn, index)))
}

// =============================================================================
// Dumping
// =============================================================================

impl Program {
    /// The simple-data-format tree of the whole program.
    pub fn to_dump(&self) -> Result<Literal> {
        Dumper { program: self }.iseq(IseqId::ROOT)
    }

    /// Serialized bytes of the whole program.
    pub fn dump(&self) -> Result<Vec<u8>> {
        let tree = self.to_dump()?;
        let bytes = postcard::to_allocvec(&tree).map_err(|e| SerializationError::Encoding(e.to_string()))?;
        debug!("dumped {} sequences into {} bytes", self.len(), bytes.len());
        Ok(bytes)
    }

    /// Rebuild a program from bytes produced by [`Program::dump`].
    pub fn load(bytes: &[u8]) -> Result<Program> {
        let tree: Literal = postcard::from_bytes(bytes).map_err(|e| SerializationError::Encoding(e.to_string()))?;
        Self::from_dump(&tree)
    }

    pub fn from_dump(tree: &Literal) -> Result<Program> {
        let header = Header::parse(tree)?;
        let root = header.shell(None, None)?;
        let mut program = Program::new(root);
        Loader {
            program: &mut program,
        }
        .fill(IseqId::ROOT, &header)?;
        debug!("loaded {} sequences", program.len());
        Ok(program)
    }
}

struct Dumper<'a> {
    program: &'a Program,
}

impl Dumper<'_> {
    fn iseq(&self, id: IseqId) -> Result<Literal> {
        let iseq = &self.program[id];
        let offsets = iseq.label_offsets();
        let version = iseq.options.target_version;
        let loc = iseq.location;

        let misc = hash(vec![
            ("arg_size", int(iseq.args.size())),
            ("local_size", int(iseq.local_table.size())),
            ("stack_max", int(iseq.stack_max())),
            ("node_id", Literal::Integer(-1)),
            (
                "code_location",
                Literal::Array(vec![
                    int(loc.start_line),
                    int(loc.start_column),
                    int(loc.end_line),
                    int(loc.end_column),
                ]),
            ),
        ]);
        let locals = Literal::Array(iseq.local_table.names().map(Literal::symbol).collect());
        let label = |label: Label| Literal::symbol(iseq.label_name(label, &offsets));

        let args = self.args(&iseq.args, &label);
        let catch_table = iseq
            .catch_table
            .iter()
            .map(|entry| {
                let handler = match entry.iseq {
                    Some(child) => self.iseq(child)?,
                    None => Literal::Nil,
                };
                Ok(Literal::Array(vec![
                    Literal::symbol(entry.kind.symbol()),
                    handler,
                    label(entry.start),
                    label(entry.end),
                    label(entry.cont),
                    int(entry.sp),
                ]))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Literal::Array(vec![
            Literal::string(MAGIC),
            Literal::Integer(i64::from(version.major)),
            Literal::Integer(i64::from(version.minor)),
            Literal::Integer(FORMAT_TYPE),
            misc,
            Literal::string(iseq.name.as_str()),
            Literal::string(iseq.file.as_str()),
            Literal::string(ABSOLUTE_PATH),
            int(loc.start_line),
            Literal::symbol(iseq.kind.type_symbol()),
            locals,
            args,
            Literal::Array(catch_table),
            Literal::Array(self.body(id, iseq, &offsets)?),
        ]))
    }

    fn args(&self, args: &ArgumentOptions, label: &dyn Fn(Label) -> Literal) -> Literal {
        let mut pairs = Vec::new();
        if args.lead_num > 0 {
            pairs.push(("lead_num", int(args.lead_num)));
        }
        if !args.opt.is_empty() {
            pairs.push(("opt", Literal::Array(args.opt.iter().map(|l| label(*l)).collect())));
        }
        if let Some(rest) = args.rest_start {
            pairs.push(("rest_start", int(rest)));
        }
        if let Some(post) = args.post_start {
            pairs.push(("post_start", int(post)));
            pairs.push(("post_num", int(args.post_num)));
        }
        if let Some(block) = args.block_start {
            pairs.push(("block_start", int(block)));
        }
        hash(pairs)
    }

    fn body(&self, id: IseqId, iseq: &InstructionSequence, offsets: &HashMap<Label, usize>) -> Result<Vec<Literal>> {
        let mut referenced: HashSet<Label> = iseq.insns().flat_map(Insn::branch_targets).collect();
        for entry in &iseq.catch_table {
            referenced.extend([entry.start, entry.end, entry.cont]);
        }
        referenced.extend(iseq.args.opt.iter().copied());

        // labels sharing an offset share a name, so each offset is written once
        let mut written = HashSet::new();
        let mut out = Vec::with_capacity(iseq.entries.len());
        for entry in &iseq.entries {
            match entry {
                Entry::Label(label) => {
                    if referenced.contains(label) {
                        let offset = offsets.get(label).copied().unwrap_or_default();
                        if written.insert(offset) {
                            out.push(Literal::symbol(iseq.label_name(*label, offsets)));
                        }
                    }
                }
                Entry::Insn(insn) => out.push(self.insn(id, iseq, insn, offsets)?),
            }
        }
        Ok(out)
    }

    fn local(&self, id: IseqId, index: usize, level: usize) -> Result<Literal> {
        self.program
            .local_offset(id, index, level)
            .map(int)
            .ok_or_else(|| SerializationError::UnknownLocal {
                iseq: self.program[id].name.clone(),
                index,
                level,
            })
    }

    fn insn(&self, id: IseqId, iseq: &InstructionSequence, insn: &Insn, offsets: &HashMap<Label, usize>) -> Result<Literal> {
        check_supported(insn, iseq.options.target_version)?;
        let label = |label: &Label| Literal::symbol(iseq.label_name(*label, offsets));
        let block = |block: &Option<IseqId>| -> Result<Literal> {
            match block {
                Some(child) => self.iseq(*child),
                None => Ok(Literal::Nil),
            }
        };

        let operands = match insn {
            Insn::AdjustStack(n)
            | Insn::ConcatStrings(n)
            | Insn::DupN(n)
            | Insn::NewArray(n)
            | Insn::NewHash(n)
            | Insn::OptNewArrayMax(n)
            | Insn::OptNewArrayMin(n)
            | Insn::SetN(n)
            | Insn::TopN(n)
            | Insn::OptSetInlineCache(n) => vec![int(*n)],
            Insn::CheckMatch(n) | Insn::NewRange(n) | Insn::PutSpecialObject(n) | Insn::Throw(n) => {
                vec![Literal::Integer(i64::from(*n))]
            }
            Insn::SplatArray(copy) => vec![Literal::bool(*copy)],

            Insn::BranchIf(target) | Insn::BranchNil(target) | Insn::BranchUnless(target) | Insn::Jump(target) => {
                vec![label(target)]
            }
            Insn::OptGetInlineCache { label: target, cache } => vec![label(target), int(*cache)],

            Insn::DefineClass { name, iseq: child, flags } => {
                vec![Literal::symbol(name.as_str()), self.iseq(*child)?, Literal::Integer(i64::from(*flags))]
            }
            Insn::DefineMethod { name, iseq: child } | Insn::DefineSMethod { name, iseq: child } => {
                vec![Literal::symbol(name.as_str()), self.iseq(*child)?]
            }

            Insn::DupArray(value) | Insn::DupHash(value) | Insn::PutObject(value) => vec![value.clone()],
            Insn::PutString(value) => vec![Literal::string(value.as_str())],
            Insn::OptStrFreeze { value, calldata } | Insn::OptStrUMinus { value, calldata } => {
                vec![Literal::string(value.as_str()), dump_calldata(calldata)]
            }

            Insn::GetLocal { index, level } | Insn::SetLocal { index, level } | Insn::GetBlockParam { index, level } => {
                vec![self.local(id, *index, *level)?, int(*level)]
            }
            Insn::GetLocalWC0(index) | Insn::SetLocalWC0(index) => vec![self.local(id, *index, 0)?],
            Insn::GetLocalWC1(index) | Insn::SetLocalWC1(index) => vec![self.local(id, *index, 1)?],

            Insn::GetInstanceVariable { name, cache } | Insn::SetInstanceVariable { name, cache } => {
                vec![Literal::symbol(name.as_str()), int(*cache)]
            }
            Insn::GetClassVariable { name, cache } | Insn::SetClassVariable { name, cache } => {
                let mut operands = vec![Literal::symbol(name.as_str())];
                operands.extend(cache.map(int));
                operands
            }
            Insn::GetConstant(name) | Insn::SetConstant(name) | Insn::GetGlobal(name) | Insn::SetGlobal(name) => {
                vec![Literal::symbol(name.as_str())]
            }
            Insn::OptGetConstantPath { names, .. } => {
                vec![Literal::Array(names.iter().map(|n| Literal::symbol(n.as_str())).collect())]
            }

            Insn::Send { calldata, block: child } | Insn::InvokeSuper { calldata, block: child } => {
                vec![dump_calldata(calldata), block(child)?]
            }
            Insn::OptNeq { eq, neq } => vec![dump_calldata(eq), dump_calldata(neq)],
            Insn::InvokeBlock(cd) | Insn::ObjToString(cd) | Insn::Opt(_, cd) | Insn::OptSendWithoutBlock(cd) => {
                vec![dump_calldata(cd)]
            }

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
            | Insn::Swap => Vec::new(),
        };

        let mut out = Vec::with_capacity(operands.len() + 1);
        out.push(Literal::symbol(insn.name()));
        out.extend(operands);
        Ok(Literal::Array(out))
    }
}

fn dump_calldata(calldata: &CallData) -> Literal {
    let mut pairs = Vec::with_capacity(4);
    if !calldata.method.is_empty() {
        pairs.push(("mid", Literal::symbol(calldata.method.as_str())));
    }
    pairs.push(("flag", Literal::Integer(i64::from(calldata.flags))));
    pairs.push(("orig_argc", int(calldata.argc)));
    if !calldata.kw_arg.is_empty() {
        pairs.push((
            "kw_arg",
            Literal::Array(calldata.kw_arg.iter().map(|k| Literal::symbol(k.as_str())).collect()),
        ));
    }
    hash(pairs)
}

/// Inline-cache encodings changed between releases.
fn check_supported(insn: &Insn, version: TargetVersion) -> Result<()> {
    let supported = match insn {
        Insn::OptGetConstantPath { .. } => version.at_least(TargetVersion::V3_2),
        Insn::OptGetInlineCache { .. } | Insn::OptSetInlineCache(_) => !version.at_least(TargetVersion::V3_2),
        Insn::GetClassVariable { cache, .. } | Insn::SetClassVariable { cache, .. } => {
            cache.is_some() == version.at_least(TargetVersion::V3_0)
        }
        _ => true,
    };
    if supported {
        Ok(())
    } else {
        Err(SerializationError::Unsupported {
            insn: insn.name(),
            version,
        })
    }
}

// =============================================================================
// Loading
// =============================================================================

/// Fields of one dumped sequence.
struct Header<'a> {
    version: TargetVersion,
    arg_size: usize,
    local_size: usize,
    stack_max: usize,
    location: Location,
    name: &'a str,
    file: &'a str,
    kind: IseqKind,
    locals: Vec<&'a str>,
    args: &'a Literal,
    catch_table: &'a [Literal],
    body: &'a [Literal],
}

impl<'a> Header<'a> {
    fn parse(tree: &'a Literal) -> Result<Self> {
        let parts = as_array(tree, "instruction sequence")?;
        if parts.len() != 14 {
            return Err(malformed(format!("expected 14 fields, got {}", parts.len())));
        }
        if as_str(&parts[0], "magic")? != MAGIC {
            return Err(malformed("bad magic"));
        }
        let major = as_usize(&parts[1], "major version")?;
        let minor = as_usize(&parts[2], "minor version")?;
        if parts[3].as_integer() != Some(FORMAT_TYPE) {
            return Err(malformed(format!("unsupported format type {}", parts[3])));
        }

        let misc = &parts[4];
        let field = |key: &str| -> Result<usize> {
            let value = misc.get(key).ok_or_else(|| malformed(format!("misc is missing {}", key)))?;
            as_usize(value, key)
        };
        let code_location = misc
            .get("code_location")
            .ok_or_else(|| malformed("misc is missing code_location"))?;
        let coords = as_array(code_location, "code_location")?
            .iter()
            .map(|c| as_usize(c, "code_location"))
            .collect::<Result<Vec<_>>>()?;
        let [start_line, start_column, end_line, end_column] = coords[..] else {
            return Err(malformed("code_location must have four entries"));
        };

        let kind_tag = as_symbol(&parts[9], "type")?;
        let kind = IseqKind::from_type_symbol(kind_tag).ok_or_else(|| malformed(format!("unknown type :{}", kind_tag)))?;
        let locals = as_array(&parts[10], "locals")?
            .iter()
            .map(|l| as_symbol(l, "local name"))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            version: TargetVersion::new(major as u32, minor as u32),
            arg_size: field("arg_size")?,
            local_size: field("local_size")?,
            stack_max: field("stack_max")?,
            location: Location {
                start_line,
                start_column,
                end_line,
                end_column,
                ..Location::default()
            },
            name: as_str(&parts[5], "name")?,
            file: as_str(&parts[6], "file")?,
            kind,
            locals,
            args: &parts[11],
            catch_table: as_array(&parts[12], "catch table")?,
            body: as_array(&parts[13], "instructions")?,
        })
    }

    fn block_start(&self) -> Result<Option<usize>> {
        self.args.get("block_start").map(|v| as_usize(v, "block_start")).transpose()
    }

    /// The sequence without instructions: enough for children to resolve
    /// their locals against.
    fn shell(&self, parent: Option<IseqId>, kind: Option<IseqKind>) -> Result<InstructionSequence> {
        let options = CompileOptions::default().with_target(self.version);
        let mut iseq = InstructionSequence::new(
            kind.unwrap_or(self.kind),
            self.name,
            self.file,
            self.location,
            parent,
            options,
        );
        if self.locals.len() != self.local_size {
            return Err(malformed(format!(
                "'{}' lists {} locals but local_size is {}",
                self.name,
                self.locals.len(),
                self.local_size
            )));
        }
        let block_start = self.block_start()?;
        for (index, name) in self.locals.iter().enumerate() {
            let kind = if Some(index) == block_start {
                LocalKind::BlockProxy
            } else {
                LocalKind::Plain
            };
            iseq.local_table
                .declare(name, kind)
                .map_err(|e| malformed(format!("'{}': {}", self.name, e)))?;
        }
        iseq.stack = StackTracker::with_maximum(self.stack_max);
        Ok(iseq)
    }
}

struct Loader<'p> {
    program: &'p mut Program,
}

/// Labels of one sequence by dumped name.
struct Labels {
    by_name: HashMap<String, Label>,
}

impl Labels {
    fn get(&mut self, iseq: &mut InstructionSequence, value: &Literal) -> Result<Label> {
        let name = as_symbol(value, "label")?;
        if !name.starts_with("label_") {
            return Err(malformed(format!("expected a label, got :{}", name)));
        }
        if let Some(label) = self.by_name.get(name) {
            return Ok(*label);
        }
        let label = iseq.new_label();
        self.by_name.insert(name.to_string(), label);
        Ok(label)
    }
}

impl Loader<'_> {
    fn child(&mut self, tree: &Literal, parent: IseqId, kind: Option<IseqKind>) -> Result<IseqId> {
        let header = Header::parse(tree)?;
        let shell = header.shell(Some(parent), kind)?;
        let id = self.program.push(shell);
        self.fill(id, &header)?;
        Ok(id)
    }

    fn fill(&mut self, id: IseqId, header: &Header<'_>) -> Result<()> {
        let mut labels = Labels {
            by_name: HashMap::new(),
        };

        let args = self.args(id, header, &mut labels)?;
        if args.size() != header.arg_size {
            return Err(malformed(format!(
                "'{}' declares arg_size {} but its parameters fill {}",
                header.name,
                header.arg_size,
                args.size()
            )));
        }
        self.program[id].args = args;

        for row in header.catch_table {
            let row = as_array(row, "catch entry")?;
            let [kind, handler, start, end, cont, sp] = row else {
                return Err(malformed("catch entry must have six fields"));
            };
            let kind_tag = as_symbol(kind, "catch type")?;
            let kind = CatchKind::from_symbol(kind_tag).ok_or_else(|| malformed(format!("unknown catch type :{}", kind_tag)))?;
            let handler = match handler {
                Literal::Nil => None,
                tree => Some(self.child(tree, id, None)?),
            };
            let iseq = &mut self.program[id];
            let entry = CatchEntry {
                kind,
                iseq: handler,
                start: labels.get(iseq, start)?,
                end: labels.get(iseq, end)?,
                cont: labels.get(iseq, cont)?,
                sp: as_usize(sp, "catch sp")?,
            };
            iseq.catch_table.push(entry);
        }

        let mut entries = Vec::with_capacity(header.body.len());
        for item in header.body {
            match item {
                Literal::Symbol(_) => {
                    let label = labels.get(&mut self.program[id], item)?;
                    entries.push(Entry::Label(label));
                }
                // line numbers and events carry no semantics here
                Literal::Integer(_) => {}
                Literal::Array(parts) => {
                    let insn = self.insn(id, parts, &mut labels, &entries)?;
                    entries.push(Entry::Insn(insn));
                }
                other => return Err(malformed(format!("unexpected instruction list item {}", other))),
            }
        }
        self.program[id].entries = entries;
        Ok(())
    }

    fn args(&mut self, id: IseqId, header: &Header<'_>, labels: &mut Labels) -> Result<ArgumentOptions> {
        let get = |key: &str| -> Result<Option<usize>> { header.args.get(key).map(|v| as_usize(v, key)).transpose() };
        let mut args = ArgumentOptions {
            lead_num: get("lead_num")?.unwrap_or_default(),
            rest_start: get("rest_start")?,
            post_start: get("post_start")?,
            post_num: get("post_num")?.unwrap_or_default(),
            block_start: get("block_start")?,
            ..ArgumentOptions::default()
        };
        if let Some(opt) = header.args.get("opt") {
            for label in as_array(opt, "opt")? {
                args.opt.push(labels.get(&mut self.program[id], label)?);
            }
        }
        Ok(args)
    }

    fn local(&self, id: IseqId, offset: &Literal, level: usize) -> Result<usize> {
        let offset = as_usize(offset, "local offset")?;
        let unknown = || SerializationError::UnknownLocal {
            iseq: self.program[id].name.clone(),
            index: offset,
            level,
        };
        let owner = self.program.ancestor(id, level).ok_or_else(unknown)?;
        self.program[owner]
            .local_table
            .index_for_offset(offset)
            .ok_or_else(unknown)
    }

    /// Kind of a nested sequence implied by the instruction referencing it.
    fn child_kind(name: &str, calldata: Option<&CallData>, flags: Option<u32>, previous: Option<&Insn>) -> Option<IseqKind> {
        match name {
            "definesmethod" => Some(IseqKind::SingletonMethod),
            "defineclass" if flags.is_some_and(|f| f & 7 == define_class::TYPE_MODULE) => Some(IseqKind::Module),
            "send"
                if calldata.is_some_and(|cd| cd.method == "lambda" && cd.has(CallData::FCALL))
                    && previous == Some(&Insn::PutSpecialObject(special_object::VMCORE)) =>
            {
                Some(IseqKind::Lambda)
            }
            _ => None,
        }
    }

    fn insn(&mut self, id: IseqId, parts: &[Literal], labels: &mut Labels, entries: &[Entry]) -> Result<Insn> {
        let (head, ops) = parts.split_first().ok_or_else(|| malformed("empty instruction"))?;
        let name = as_symbol(head, "opcode")?;
        let op = |i: usize| operand(ops, i, name);
        let count = |i: usize| -> Result<usize> { as_usize(operand(ops, i, name)?, name) };
        let flag = |i: usize| -> Result<u32> {
            u32::try_from(count(i)?).map_err(|_| malformed(format!("{} operand out of range", name)))
        };
        let symbol = |i: usize| -> Result<String> { Ok(as_symbol(operand(ops, i, name)?, name)?.to_string()) };
        let previous = entries.iter().rev().find_map(Entry::as_insn);

        let insn = match name {
            "adjuststack" => Insn::AdjustStack(count(0)?),
            "concatstrings" => Insn::ConcatStrings(count(0)?),
            "dupn" => Insn::DupN(count(0)?),
            "newarray" => Insn::NewArray(count(0)?),
            "newhash" => Insn::NewHash(count(0)?),
            "opt_newarray_max" => Insn::OptNewArrayMax(count(0)?),
            "opt_newarray_min" => Insn::OptNewArrayMin(count(0)?),
            "setn" => Insn::SetN(count(0)?),
            "topn" => Insn::TopN(count(0)?),
            "checkmatch" => Insn::CheckMatch(flag(0)?),
            "newrange" => Insn::NewRange(flag(0)?),
            "putspecialobject" => Insn::PutSpecialObject(flag(0)?),
            "throw" => Insn::Throw(flag(0)?),
            "splatarray" => Insn::SplatArray(op(0)? == &Literal::True),

            "branchif" => Insn::BranchIf(labels.get(&mut self.program[id], op(0)?)?),
            "branchnil" => Insn::BranchNil(labels.get(&mut self.program[id], op(0)?)?),
            "branchunless" => Insn::BranchUnless(labels.get(&mut self.program[id], op(0)?)?),
            "jump" => Insn::Jump(labels.get(&mut self.program[id], op(0)?)?),
            "opt_getinlinecache" => {
                let label = labels.get(&mut self.program[id], op(0)?)?;
                let cache = count(1)?;
                self.program[id].inline_storages.reserve(cache);
                Insn::OptGetInlineCache { label, cache }
            }
            "opt_setinlinecache" => Insn::OptSetInlineCache(count(0)?),

            "defineclass" => {
                let flags = flag(2)?;
                let kind = Self::child_kind(name, None, Some(flags), previous);
                let child = self.child(op(1)?, id, kind)?;
                Insn::DefineClass {
                    name: symbol(0)?,
                    iseq: child,
                    flags,
                }
            }
            "definemethod" | "definesmethod" => {
                let kind = Self::child_kind(name, None, None, previous);
                let child = self.child(op(1)?, id, kind)?;
                if name == "definemethod" {
                    Insn::DefineMethod {
                        name: symbol(0)?,
                        iseq: child,
                    }
                } else {
                    Insn::DefineSMethod {
                        name: symbol(0)?,
                        iseq: child,
                    }
                }
            }

            "duparray" => Insn::DupArray(op(0)?.clone()),
            "duphash" => Insn::DupHash(op(0)?.clone()),
            "putobject" => Insn::PutObject(op(0)?.clone()),
            "putstring" => Insn::PutString(as_str(op(0)?, name)?.to_string()),
            "opt_str_freeze" | "opt_str_uminus" => {
                let value = as_str(op(0)?, name)?.to_string();
                let calldata = load_calldata(op(1)?)?;
                if name == "opt_str_freeze" {
                    Insn::OptStrFreeze { value, calldata }
                } else {
                    Insn::OptStrUMinus { value, calldata }
                }
            }

            "getlocal" | "setlocal" | "getblockparam" => {
                let level = count(1)?;
                let index = self.local(id, op(0)?, level)?;
                match name {
                    "getlocal" => Insn::GetLocal { index, level },
                    "setlocal" => Insn::SetLocal { index, level },
                    _ => Insn::GetBlockParam { index, level },
                }
            }
            "getlocal_WC_0" => Insn::GetLocalWC0(self.local(id, op(0)?, 0)?),
            "getlocal_WC_1" => Insn::GetLocalWC1(self.local(id, op(0)?, 1)?),
            "setlocal_WC_0" => Insn::SetLocalWC0(self.local(id, op(0)?, 0)?),
            "setlocal_WC_1" => Insn::SetLocalWC1(self.local(id, op(0)?, 1)?),

            "getinstancevariable" | "setinstancevariable" => {
                let cache = count(1)?;
                self.program[id].inline_storages.reserve(cache);
                let name_operand = symbol(0)?;
                if name == "getinstancevariable" {
                    Insn::GetInstanceVariable {
                        name: name_operand,
                        cache,
                    }
                } else {
                    Insn::SetInstanceVariable {
                        name: name_operand,
                        cache,
                    }
                }
            }
            "getclassvariable" | "setclassvariable" => {
                let cache = match ops.get(1) {
                    Some(slot) => Some(as_usize(slot, name)?),
                    None => None,
                };
                if let Some(slot) = cache {
                    self.program[id].inline_storages.reserve(slot);
                }
                let name_operand = symbol(0)?;
                if name == "getclassvariable" {
                    Insn::GetClassVariable {
                        name: name_operand,
                        cache,
                    }
                } else {
                    Insn::SetClassVariable {
                        name: name_operand,
                        cache,
                    }
                }
            }
            "getconstant" => Insn::GetConstant(symbol(0)?),
            "setconstant" => Insn::SetConstant(symbol(0)?),
            "getglobal" => Insn::GetGlobal(symbol(0)?),
            "setglobal" => Insn::SetGlobal(symbol(0)?),
            "opt_getconstant_path" => {
                let names = as_array(op(0)?, name)?
                    .iter()
                    .map(|n| as_symbol(n, name).map(str::to_string))
                    .collect::<Result<Vec<_>>>()?;
                let cache = self.program[id].inline_storages.per_site();
                Insn::OptGetConstantPath { names, cache }
            }

            "send" | "invokesuper" => {
                let calldata = load_calldata(op(0)?)?;
                let block = match op(1)? {
                    Literal::Nil => None,
                    tree => {
                        let kind = Self::child_kind(name, Some(&calldata), None, previous);
                        Some(self.child(tree, id, kind)?)
                    }
                };
                if name == "send" {
                    Insn::Send { calldata, block }
                } else {
                    Insn::InvokeSuper { calldata, block }
                }
            }
            "opt_neq" => Insn::OptNeq {
                eq: load_calldata(op(0)?)?,
                neq: load_calldata(op(1)?)?,
            },
            "invokeblock" => Insn::InvokeBlock(load_calldata(op(0)?)?),
            "objtostring" => Insn::ObjToString(load_calldata(op(0)?)?),
            "opt_send_without_block" => Insn::OptSendWithoutBlock(load_calldata(op(0)?)?),

            "anytostring" => Insn::AnyToString,
            "dup" => Insn::Dup,
            "intern" => Insn::Intern,
            "leave" => Insn::Leave,
            "nop" => Insn::Nop,
            "pop" => Insn::Pop,
            "putnil" => Insn::PutNil,
            "putobject_INT2FIX_0_" => Insn::PutObjectInt2Fix0,
            "putobject_INT2FIX_1_" => Insn::PutObjectInt2Fix1,
            "putself" => Insn::PutSelf,
            "swap" => Insn::Swap,

            other => match OptOp::from_name(other) {
                Some(op) => Insn::Opt(op, load_calldata(operand(ops, 0, other)?)?),
                None => return Err(SerializationError::UnknownInstruction(other.to_string())),
            },
        };
        Ok(insn)
    }
}

fn load_calldata(value: &Literal) -> Result<Rc<CallData>> {
    let method = match value.get("mid") {
        Some(mid) => as_symbol(mid, "mid")?.to_string(),
        None => String::new(),
    };
    let flags = value
        .get("flag")
        .ok_or_else(|| malformed("call data is missing flag"))
        .and_then(|f| as_usize(f, "flag"))?;
    let argc = value
        .get("orig_argc")
        .ok_or_else(|| malformed("call data is missing orig_argc"))
        .and_then(|a| as_usize(a, "orig_argc"))?;
    let kw_arg = match value.get("kw_arg") {
        Some(names) => as_array(names, "kw_arg")?
            .iter()
            .map(|n| as_symbol(n, "kw_arg").map(str::to_string))
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };
    let flags = u32::try_from(flags).map_err(|_| malformed("call data flag out of range"))?;
    Ok(CallData::with_keywords(method, argc, flags, kw_arg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::node::{Node, NodeKind, Params, RescueClause};
    use crate::{compile, compile_with_options};

    fn round_trip(program: &Program) -> (Vec<u8>, Program) {
        let bytes = program.dump().unwrap();
        let loaded = Program::load(&bytes).unwrap();
        (bytes, loaded)
    }

    fn sample() -> Node {
        let body = Node::statements(vec![
            Node::lasgn("total", Node::int(0)),
            Node::call(Some(Node::lvar("items")), "each", vec![]).with_block(
                Params::required(&["x"]),
                Node::lasgn("total", Node::binary(Node::lvar("total"), "+", Node::lvar("x"))),
            ),
            Node::lvar("total"),
        ]);
        Node::program(vec![
            Node::def("sum", Params::required(&["items"]), body),
            Node::fcall("sum", vec![Node::new(NodeKind::Array(vec![Node::int(1), Node::int(2)]))]),
        ])
    }

    #[test]
    fn test_header_fields() {
        let program = compile(&Node::program(vec![Node::int(7)])).unwrap();
        let tree = program.to_dump().unwrap();
        let parts = tree.as_array().unwrap();
        assert_eq!(parts[0], Literal::string(MAGIC));
        assert_eq!(parts[1], Literal::Integer(3));
        assert_eq!(parts[2], Literal::Integer(3));
        assert_eq!(parts[3], Literal::Integer(1));
        assert_eq!(parts[4].get("stack_max"), Some(&Literal::Integer(1)));
        assert_eq!(parts[4].get("node_id"), Some(&Literal::Integer(-1)));
        assert_eq!(parts[5], Literal::string("<main>"));
        assert_eq!(parts[9], Literal::symbol("top"));
        assert_eq!(
            parts[13],
            Literal::Array(vec![
                Literal::Array(vec![Literal::symbol("putobject"), Literal::Integer(7)]),
                Literal::Array(vec![Literal::symbol("leave")]),
            ])
        );
    }

    #[test]
    fn test_round_trip_is_byte_identical() {
        let program = compile(&sample()).unwrap();
        let (bytes, loaded) = round_trip(&program);
        assert_eq!(loaded.dump().unwrap(), bytes);
        assert_eq!(loaded.len(), program.len());
    }

    #[test]
    fn test_locals_are_emitted_as_offsets() {
        let program = compile(&sample()).unwrap();
        let tree = program.to_dump().unwrap();
        let body = tree.as_array().unwrap()[13].as_array().unwrap();
        let define = body[0].as_array().unwrap();
        assert_eq!(define[0], Literal::symbol("definemethod"));
        let method = define[2].as_array().unwrap();
        assert_eq!(method[10], Literal::Array(vec![Literal::symbol("items"), Literal::symbol("total")]));
        let insns = method[13].as_array().unwrap();
        // total = 0 writes index 1 of two locals: offset 2 + 2 - 1 = 3
        assert_eq!(
            insns[1],
            Literal::Array(vec![Literal::symbol("setlocal_WC_0"), Literal::Integer(3)])
        );
    }

    #[test]
    fn test_loaded_locals_keep_indices() {
        let program = compile(&sample()).unwrap();
        let (_, loaded) = round_trip(&program);
        let block = loaded.iter().find(|(_, i)| i.kind == IseqKind::Block).unwrap().1;
        assert!(block.insns().any(|i| *i == Insn::GetLocalWC1(1)));
        assert!(block.insns().any(|i| *i == Insn::SetLocalWC1(1)));
    }

    #[test]
    fn test_round_trip_with_catch_tables() {
        let node = Node::new(NodeKind::Begin {
            body: Box::new(Node::fcall("risky", vec![])),
            rescues: vec![RescueClause {
                exceptions: vec![Node::constant("ArgumentError")],
                binding: Some("e".to_string()),
                body: Node::lvar("e"),
            }],
            else_branch: None,
            ensure: Some(Box::new(Node::fcall("cleanup", vec![]))),
        });
        let program = compile(&Node::program(vec![node])).unwrap();
        let (bytes, loaded) = round_trip(&program);
        assert_eq!(loaded.dump().unwrap(), bytes);
        let kinds: Vec<CatchKind> = loaded.root().catch_table.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![CatchKind::Rescue, CatchKind::Ensure]);
    }

    #[test]
    fn test_lambda_kind_recovered() {
        let node = Node::new(NodeKind::Lambda {
            params: Params::default(),
            body: Box::new(Node::int(1)),
        });
        let program = compile(&Node::program(vec![node])).unwrap();
        let (_, loaded) = round_trip(&program);
        assert!(loaded.iter().any(|(_, i)| i.kind == IseqKind::Lambda));
    }

    #[test]
    fn test_legacy_target_round_trip() {
        let options = CompileOptions::default().with_target(TargetVersion::new(3, 1));
        let node = Node::program(vec![Node::constant("Foo"), Node::ivar("@a")]);
        let program = compile_with_options(&node, options).unwrap();
        let (bytes, loaded) = round_trip(&program);
        assert_eq!(loaded.dump().unwrap(), bytes);
        assert!(loaded.root().insns().any(|i| matches!(i, Insn::OptGetInlineCache { .. })));
    }

    #[test]
    fn test_unsupported_instruction_for_target() {
        let mut program = compile(&Node::program(vec![Node::constant("Foo")])).unwrap();
        program[IseqId::ROOT].options.target_version = TargetVersion::new(3, 1);
        let err = program.dump().unwrap_err();
        assert!(matches!(
            err,
            SerializationError::Unsupported {
                insn: "opt_getconstant_path",
                ..
            }
        ));
    }

    #[test]
    fn test_bad_magic() {
        let tree = Literal::Array(vec![Literal::string("nope")]);
        assert!(matches!(Program::from_dump(&tree), Err(SerializationError::Malformed(_))));
        assert!(Program::load(&[0xff, 0xff]).is_err());
    }
}
