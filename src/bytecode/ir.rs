use std::collections::{HashMap, HashSet};
use std::ops::{Index, IndexMut};

use log::debug;

use crate::bytecode::compile_error::CompileError;
use crate::bytecode::local_table::{LocalKind, LocalLookup, LocalTable};
use crate::bytecode::op::{Insn, Label};
use crate::bytecode::options::CompileOptions;
use crate::bytecode::peephole;
use crate::bytecode::stack::StackTracker;
use crate::lang::location::Location;

/// Index of an instruction sequence inside its [`Program`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IseqId(pub usize);

impl IseqId {
    pub const ROOT: IseqId = IseqId(0);
}

/// All sequences produced by one compilation.
///
/// Convention: `iseqs[0]` is always the top-level sequence. Nested sequences
/// are referenced from instruction operands by [`IseqId`].
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    iseqs: Vec<InstructionSequence>,
}

impl Program {
    pub fn new(root: InstructionSequence) -> Self {
        Self { iseqs: vec![root] }
    }

    pub fn root(&self) -> &InstructionSequence {
        &self.iseqs[0]
    }

    pub fn get(&self, id: IseqId) -> Option<&InstructionSequence> {
        self.iseqs.get(id.0)
    }

    /// Add a sequence and return its id.
    pub fn push(&mut self, iseq: InstructionSequence) -> IseqId {
        self.iseqs.push(iseq);
        IseqId(self.iseqs.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.iseqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.iseqs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (IseqId, &InstructionSequence)> {
        self.iseqs.iter().enumerate().map(|(i, iseq)| (IseqId(i), iseq))
    }

    /// Sequences whose `parent` is `id`, in creation order.
    pub fn children(&self, id: IseqId) -> Vec<IseqId> {
        self.iter()
            .filter(|(_, iseq)| iseq.parent == Some(id))
            .map(|(child, _)| child)
            .collect()
    }

    /// The sequence `level` lexical scopes above `id`.
    pub fn ancestor(&self, id: IseqId, level: usize) -> Option<IseqId> {
        let mut current = id;
        for _ in 0..level {
            current = self.get(current)?.parent?;
        }
        Some(current)
    }

    /// Look `name` up in `id`'s table, then in enclosing scopes that share
    /// locals with it (blocks, rescue and ensure bodies).
    pub fn resolve_local(&self, id: IseqId, name: &str) -> Option<LocalLookup> {
        let mut current = id;
        let mut level = 0;
        loop {
            let iseq = self.get(current)?;
            if let Some((index, kind)) = iseq.local_table.find(name) {
                return Some(LocalLookup { index, level, kind });
            }
            if !iseq.kind.inherits_locals() {
                return None;
            }
            current = iseq.parent?;
            level += 1;
        }
    }

    /// Operand for local `index` of the table `level` scopes up.
    pub fn local_offset(&self, id: IseqId, index: usize, level: usize) -> Option<usize> {
        let owner = self.get(self.ancestor(id, level)?)?;
        if index >= owner.local_table.size() {
            return None;
        }
        Some(owner.local_table.offset(index))
    }

    pub fn local_name(&self, id: IseqId, index: usize, level: usize) -> Option<&str> {
        let owner = self.get(self.ancestor(id, level)?)?;
        owner.local_table.get(index).map(|local| local.name.as_str())
    }
}

impl Index<IseqId> for Program {
    type Output = InstructionSequence;

    fn index(&self, id: IseqId) -> &InstructionSequence {
        &self.iseqs[id.0]
    }
}

impl IndexMut<IseqId> for Program {
    fn index_mut(&mut self, id: IseqId) -> &mut InstructionSequence {
        &mut self.iseqs[id.0]
    }
}

// =============================================================================
// Instruction sequence
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IseqKind {
    Top,
    Method,
    SingletonMethod,
    Block,
    Lambda,
    Class,
    Module,
    Rescue,
    Ensure,
}

impl IseqKind {
    /// Type tag used in the serialized form.
    pub fn type_symbol(self) -> &'static str {
        match self {
            IseqKind::Top => "top",
            IseqKind::Method | IseqKind::SingletonMethod => "method",
            IseqKind::Block | IseqKind::Lambda => "block",
            IseqKind::Class | IseqKind::Module => "class",
            IseqKind::Rescue => "rescue",
            IseqKind::Ensure => "ensure",
        }
    }

    pub fn from_type_symbol(tag: &str) -> Option<IseqKind> {
        Some(match tag {
            "top" | "main" | "eval" => IseqKind::Top,
            "method" => IseqKind::Method,
            "block" => IseqKind::Block,
            "class" => IseqKind::Class,
            "rescue" => IseqKind::Rescue,
            "ensure" => IseqKind::Ensure,
            _ => return None,
        })
    }

    /// Whether variable lookup continues into the parent sequence.
    pub fn inherits_locals(self) -> bool {
        matches!(
            self,
            IseqKind::Block | IseqKind::Lambda | IseqKind::Rescue | IseqKind::Ensure
        )
    }

    pub fn is_method(self) -> bool {
        matches!(self, IseqKind::Method | IseqKind::SingletonMethod)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Label(Label),
    Insn(Insn),
}

impl Entry {
    pub fn as_insn(&self) -> Option<&Insn> {
        match self {
            Entry::Insn(insn) => Some(insn),
            Entry::Label(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CatchKind {
    Rescue,
    Ensure,
    Break,
    Next,
    Retry,
    Redo,
}

impl CatchKind {
    pub fn symbol(self) -> &'static str {
        match self {
            CatchKind::Rescue => "rescue",
            CatchKind::Ensure => "ensure",
            CatchKind::Break => "break",
            CatchKind::Next => "next",
            CatchKind::Retry => "retry",
            CatchKind::Redo => "redo",
        }
    }

    pub fn from_symbol(tag: &str) -> Option<CatchKind> {
        Some(match tag {
            "rescue" => CatchKind::Rescue,
            "ensure" => CatchKind::Ensure,
            "break" => CatchKind::Break,
            "next" => CatchKind::Next,
            "retry" => CatchKind::Retry,
            "redo" => CatchKind::Redo,
            _ => return None,
        })
    }
}

/// Exception-table row: while the pc is inside `[start, end)`, an
/// unwinding of this kind is handled by running `iseq` (if any) and
/// resuming at `cont` with the stack cut to `sp`.
#[derive(Debug, Clone, PartialEq)]
pub struct CatchEntry {
    pub kind: CatchKind,
    pub iseq: Option<IseqId>,
    pub start: Label,
    pub end: Label,
    pub cont: Label,
    pub sp: usize,
}

/// Shape of the parameter list of a method or block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArgumentOptions {
    pub lead_num: usize,
    /// One label per number of optional arguments supplied, plus the
    /// label after the last default; empty when there are no optionals.
    pub opt: Vec<Label>,
    pub rest_start: Option<usize>,
    pub post_start: Option<usize>,
    pub post_num: usize,
    pub block_start: Option<usize>,
}

impl ArgumentOptions {
    pub fn opt_num(&self) -> usize {
        self.opt.len().saturating_sub(1)
    }

    /// Local slots filled from the caller's arguments.
    pub fn size(&self) -> usize {
        self.lead_num
            + self.opt_num()
            + usize::from(self.rest_start.is_some())
            + self.post_num
            + usize::from(self.block_start.is_some())
    }

    pub fn required(&self) -> usize {
        self.lead_num + self.post_num
    }
}

/// Inline cache slot allocation for one sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InlineStorages {
    by_name: HashMap<String, usize>,
    count: usize,
}

impl InlineStorages {
    /// Slot shared by every access to `name` within the sequence.
    pub fn per_name(&mut self, name: &str) -> usize {
        if let Some(slot) = self.by_name.get(name) {
            return *slot;
        }
        let slot = self.per_site();
        self.by_name.insert(name.to_string(), slot);
        slot
    }

    /// Fresh slot for a single access site.
    pub fn per_site(&mut self) -> usize {
        self.count += 1;
        self.count - 1
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Make sure slots below `count` are accounted for when rebuilding a
    /// sequence from its serialized form.
    pub fn reserve(&mut self, slot: usize) {
        self.count = self.count.max(slot + 1);
    }
}

/// One unit of compiled code: the body of the top level, a method, a block,
/// a class body, or a rescue/ensure handler.
#[derive(Debug, Clone, PartialEq)]
pub struct InstructionSequence {
    pub kind: IseqKind,
    pub name: String,
    pub file: String,
    pub location: Location,
    pub parent: Option<IseqId>,
    pub entries: Vec<Entry>,
    pub local_table: LocalTable,
    pub inline_storages: InlineStorages,
    pub stack: StackTracker,
    pub args: ArgumentOptions,
    pub catch_table: Vec<CatchEntry>,
    pub options: CompileOptions,
    next_label: usize,
}

impl InstructionSequence {
    pub fn new(
        kind: IseqKind,
        name: impl Into<String>,
        file: impl Into<String>,
        location: Location,
        parent: Option<IseqId>,
        options: CompileOptions,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            file: file.into(),
            location,
            parent,
            entries: Vec::new(),
            local_table: LocalTable::new(),
            inline_storages: InlineStorages::default(),
            stack: StackTracker::new(),
            args: ArgumentOptions::default(),
            catch_table: Vec::new(),
            options,
            next_label: 0,
        }
    }

    pub fn new_label(&mut self) -> Label {
        self.next_label += 1;
        Label(self.next_label - 1)
    }

    /// Place `label` at the current position.
    pub fn place(&mut self, label: Label) {
        self.next_label = self.next_label.max(label.0 + 1);
        self.entries.push(Entry::Label(label));
    }

    pub fn stack_max(&self) -> usize {
        self.stack.maximum()
    }

    pub fn insns(&self) -> impl Iterator<Item = &Insn> {
        self.entries.iter().filter_map(Entry::as_insn)
    }

    pub fn insn_count(&self) -> usize {
        self.insns().count()
    }

    pub fn last_insn(&self) -> Option<&Insn> {
        self.entries.iter().rev().find_map(Entry::as_insn)
    }

    pub fn local_kind(&self, index: usize) -> Option<LocalKind> {
        self.local_table.get(index).map(|local| local.kind)
    }

    /// Word offset of every placed label.
    pub fn label_offsets(&self) -> HashMap<Label, usize> {
        let mut offsets = HashMap::new();
        let mut offset = 0;
        for entry in &self.entries {
            match entry {
                Entry::Label(label) => {
                    offsets.insert(*label, offset);
                }
                Entry::Insn(insn) => offset += insn.length(),
            }
        }
        offsets
    }

    /// Instruction index (labels excluded) each placed label precedes.
    pub fn label_positions(&self) -> HashMap<Label, usize> {
        let mut positions = HashMap::new();
        let mut index = 0;
        for entry in &self.entries {
            match entry {
                Entry::Label(label) => {
                    positions.insert(*label, index);
                }
                Entry::Insn(_) => index += 1,
            }
        }
        positions
    }

    /// `label_<offset>`, the name a label carries in dumps and listings.
    pub fn label_name(&self, label: Label, offsets: &HashMap<Label, usize>) -> String {
        match offsets.get(&label) {
            Some(offset) => format!("label_{}", offset),
            None => format!("label_unplaced_{}", label.0),
        }
    }

    fn referenced_labels(&self) -> Vec<Label> {
        let mut labels: Vec<Label> = self.insns().flat_map(Insn::branch_targets).collect();
        for entry in &self.catch_table {
            labels.extend([entry.start, entry.end, entry.cont]);
        }
        labels.extend(self.args.opt.iter().copied());
        labels
    }

    /// Optimize (when enabled) and verify that every referenced label is
    /// placed exactly once.
    pub fn finish(&mut self) -> Result<(), CompileError> {
        if self.options.peephole_optimization {
            peephole::optimize(&mut self.entries);
        }

        let mut placed = HashSet::new();
        for entry in &self.entries {
            if let Entry::Label(label) = entry {
                if !placed.insert(*label) {
                    return Err(CompileError::internal(format!(
                        "label {} placed twice in '{}'",
                        label.0, self.name
                    )));
                }
            }
        }
        if let Some(missing) = self.referenced_labels().into_iter().find(|l| !placed.contains(l)) {
            return Err(CompileError::unplaced_label(missing, &self.name));
        }

        debug!(
            "finished iseq '{}' ({:?}): {} insns, {} locals, stack_max {}",
            self.name,
            self.kind,
            self.insn_count(),
            self.local_table.size(),
            self.stack_max()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iseq(kind: IseqKind, parent: Option<IseqId>) -> InstructionSequence {
        InstructionSequence::new(kind, "test", "<test>", Location::line(1), parent, CompileOptions::default())
    }

    #[test]
    fn test_resolve_through_blocks() {
        let mut top = iseq(IseqKind::Method, None);
        top.local_table.plain("a").unwrap();
        let mut program = Program::new(top);

        let mut block = iseq(IseqKind::Block, Some(IseqId::ROOT));
        block.local_table.plain("b").unwrap();
        let block_id = program.push(block);

        let inner = iseq(IseqKind::Block, Some(block_id));
        let inner_id = program.push(inner);

        let found = program.resolve_local(inner_id, "a").unwrap();
        assert_eq!((found.index, found.level), (0, 2));
        let found = program.resolve_local(inner_id, "b").unwrap();
        assert_eq!((found.index, found.level), (0, 1));
        assert!(program.resolve_local(inner_id, "c").is_none());
    }

    #[test]
    fn test_resolve_stops_at_method_boundary() {
        let mut top = iseq(IseqKind::Top, None);
        top.local_table.plain("x").unwrap();
        let mut program = Program::new(top);
        let method = program.push(iseq(IseqKind::Method, Some(IseqId::ROOT)));
        assert!(program.resolve_local(method, "x").is_none());
    }

    #[test]
    fn test_resolve_is_stable() {
        let mut top = iseq(IseqKind::Top, None);
        top.local_table.plain("x").unwrap();
        let program = Program::new(top);
        let first = program.resolve_local(IseqId::ROOT, "x");
        let second = program.resolve_local(IseqId::ROOT, "x");
        assert_eq!(first, second);
    }

    #[test]
    fn test_label_offsets_count_words() {
        let mut seq = iseq(IseqKind::Top, None);
        let label = seq.new_label();
        seq.entries.push(Entry::Insn(Insn::PutNil));
        seq.entries.push(Entry::Insn(Insn::BranchUnless(label)));
        seq.entries.push(Entry::Insn(Insn::PutObject(crate::lang::Literal::Integer(5))));
        seq.place(label);
        seq.entries.push(Entry::Insn(Insn::Leave));
        assert_eq!(seq.label_offsets()[&label], 5);
        assert_eq!(seq.label_positions()[&label], 3);
        assert_eq!(seq.label_name(label, &seq.label_offsets()), "label_5");
    }

    #[test]
    fn test_finish_rejects_unplaced_label() {
        let mut seq = iseq(IseqKind::Top, None);
        let label = seq.new_label();
        seq.entries.push(Entry::Insn(Insn::Jump(label)));
        let err = seq.finish().unwrap_err();
        assert!(matches!(err, CompileError::UnplacedLabel { .. }));
    }

    #[test]
    fn test_argument_size() {
        let args = ArgumentOptions {
            lead_num: 1,
            opt: vec![Label(0), Label(1), Label(2)],
            rest_start: Some(3),
            post_start: Some(4),
            post_num: 1,
            block_start: Some(5),
        };
        assert_eq!(args.opt_num(), 2);
        assert_eq!(args.size(), 6);
        assert_eq!(args.required(), 2);
    }

    #[test]
    fn test_inline_storages() {
        let mut storages = InlineStorages::default();
        assert_eq!(storages.per_name("@a"), 0);
        assert_eq!(storages.per_site(), 1);
        assert_eq!(storages.per_name("@a"), 0);
        assert_eq!(storages.per_name("@b"), 2);
        assert_eq!(storages.len(), 3);
    }
}
