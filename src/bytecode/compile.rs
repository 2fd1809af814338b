use log::debug;

use crate::bytecode::calldata::CallData;
use crate::bytecode::compile_error::CompileError;
use crate::bytecode::ir::{
    ArgumentOptions, CatchEntry, CatchKind, InstructionSequence, IseqId, IseqKind, Program,
};
use crate::bytecode::local_table::{LocalKind, LocalLookup};
use crate::bytecode::op::{Label, check_match, define_class, special_object, throw_tag};
use crate::bytecode::options::CompileOptions;
use crate::lang::{
    literal::Literal,
    location::Location,
    node::{InClause, Node, NodeKind, Params, Pattern, RescueClause, WhenClause},
};

type CompileResult = Result<(), CompileError>;

/// Name of the hidden local holding the exception in rescue/ensure bodies.
pub const ERRINFO: &str = "$!";

#[derive(Debug, Clone, Copy)]
struct LoopContext {
    break_label: Label,
    next_label: Label,
    /// Stack depth when the loop was entered.
    depth: usize,
    /// Ensure clauses already open when the loop was entered.
    ensures: usize,
}

/// Per-sequence compilation state.
struct Scope {
    iseq: IseqId,
    loops: Vec<LoopContext>,
    /// Bodies of the enclosing `ensure` clauses, innermost last.
    ensures: Vec<Node>,
}

impl Scope {
    fn new(iseq: IseqId) -> Self {
        Self {
            iseq,
            loops: Vec::new(),
            ensures: Vec::new(),
        }
    }
}

struct ArgsInfo {
    argc: usize,
    flags: u32,
    kw_arg: Vec<String>,
}

impl ArgsInfo {
    fn simple_flag(&self) -> u32 {
        let complex = CallData::ARGS_SPLAT | CallData::ARGS_BLOCKARG | CallData::KWARG;
        if self.flags & complex == 0 { CallData::ARGS_SIMPLE } else { 0 }
    }
}

/// Translates a syntax tree into a [`Program`].
///
/// The compiler is a single recursive visitor. Every `compile_node` call is
/// told whether its value is `popped` (unused), and leaves exactly one value
/// on the stack otherwise.
pub struct Compiler {
    program: Program,
    scope: Scope,
    options: CompileOptions,
    file: String,
}

impl Compiler {
    pub fn new(options: CompileOptions, file: impl Into<String>) -> Self {
        let file = file.into();
        let root = InstructionSequence::new(IseqKind::Top, "<main>", file.clone(), Location::default(), None, options);
        Self {
            program: Program::new(root),
            scope: Scope::new(IseqId::ROOT),
            options,
            file,
        }
    }

    pub fn compile(mut self, node: &Node) -> Result<Program, CompileError> {
        self.program[IseqId::ROOT].location = node.location;
        self.compile_node(node, false)?;
        self.iseq().leave()?;
        self.program[IseqId::ROOT].finish()?;
        debug!("compiled '{}' into {} sequences", self.file, self.program.len());
        Ok(self.program)
    }

    // =========================================================================
    // Scope helpers
    // =========================================================================

    fn current(&self) -> IseqId {
        self.scope.iseq
    }

    fn iseq(&mut self) -> &mut InstructionSequence {
        &mut self.program[self.scope.iseq]
    }

    fn kind(&self) -> IseqKind {
        self.program[self.scope.iseq].kind
    }

    fn depth(&self) -> usize {
        self.program[self.scope.iseq].stack.current()
    }

    fn set_depth(&mut self, depth: usize) {
        self.iseq().stack.set_current(depth);
    }

    fn new_label(&mut self) -> Label {
        self.iseq().new_label()
    }

    fn place(&mut self, label: Label) {
        self.iseq().place(label);
    }

    /// Compile a nested sequence with `body` and finish it.
    fn with_child<F>(&mut self, kind: IseqKind, name: String, location: Location, body: F) -> Result<IseqId, CompileError>
    where
        F: FnOnce(&mut Self) -> CompileResult,
    {
        let iseq = InstructionSequence::new(kind, name, self.file.clone(), location, Some(self.current()), self.options);
        let id = self.program.push(iseq);
        let saved = std::mem::replace(&mut self.scope, Scope::new(id));
        let result = body(self);
        self.scope = saved;
        result?;
        self.program[id].finish()?;
        Ok(id)
    }

    /// Kind of the nearest enclosing sequence that is not a rescue/ensure body.
    fn frame_kind(&self) -> (IseqKind, usize) {
        let mut id = self.current();
        let mut level = 0;
        loop {
            let iseq = &self.program[id];
            match (iseq.kind, iseq.parent) {
                (IseqKind::Rescue | IseqKind::Ensure, Some(parent)) => {
                    id = parent;
                    level += 1;
                }
                (kind, _) => return (kind, level),
            }
        }
    }

    /// Nearest enclosing method and the number of scopes between.
    fn enclosing_method(&self) -> Option<(IseqId, usize)> {
        let mut id = self.current();
        let mut level = 0;
        loop {
            let iseq = &self.program[id];
            if iseq.kind.is_method() {
                return Some((id, level));
            }
            if !iseq.kind.inherits_locals() {
                return None;
            }
            id = iseq.parent?;
            level += 1;
        }
    }

    fn block_name(&self) -> String {
        let mut levels = 1;
        let mut id = self.current();
        while let (IseqKind::Block | IseqKind::Lambda, Some(parent)) = (self.program[id].kind, self.program[id].parent) {
            levels += 1;
            id = parent;
        }
        let owner = &self.program[id].name;
        if levels == 1 {
            format!("block in {}", owner)
        } else {
            format!("block ({} levels) in {}", levels, owner)
        }
    }

    fn resolve(&self, name: &str) -> Option<LocalLookup> {
        self.program.resolve_local(self.current(), name)
    }

    /// Resolve `name`, declaring it when unknown.
    ///
    /// New variables in rescue and ensure bodies belong to the enclosing
    /// scope.
    fn declare_local(&mut self, name: &str, location: Location) -> Result<LocalLookup, CompileError> {
        if let Some(found) = self.resolve(name) {
            return Ok(found);
        }
        let mut owner = self.current();
        let mut level = 0;
        while let (IseqKind::Rescue | IseqKind::Ensure, Some(parent)) =
            (self.program[owner].kind, self.program[owner].parent)
        {
            owner = parent;
            level += 1;
        }
        let index = self.program[owner]
            .local_table
            .plain(name)
            .map_err(|e| CompileError::local(e, location))?;
        Ok(LocalLookup {
            index,
            level,
            kind: LocalKind::Plain,
        })
    }

    fn declare_param(&mut self, name: &str, kind: LocalKind, location: Location) -> Result<usize, CompileError> {
        self.iseq()
            .local_table
            .declare(name, kind)
            .map_err(|e| CompileError::local(e, location))
    }

    // =========================================================================
    // Node dispatch
    // =========================================================================

    pub fn compile_node(&mut self, node: &Node, popped: bool) -> CompileResult {
        match &node.kind {
            NodeKind::Program(statements) | NodeKind::Statements(statements) => {
                self.compile_statements(statements, popped)
            }

            // ─── Literals ───
            NodeKind::Nil => self.unless_popped(popped, |c| c.iseq().putnil()),
            NodeKind::True
            | NodeKind::False
            | NodeKind::Integer(_)
            | NodeKind::Float(_)
            | NodeKind::Symbol(_) => match node.literal() {
                Some(value) => self.unless_popped(popped, |c| c.iseq().putobject(value)),
                None => Err(CompileError::unhandled(node)),
            },
            NodeKind::SelfRef => self.unless_popped(popped, |c| c.iseq().putself()),
            NodeKind::Str(value) => self.unless_popped(popped, |c| c.iseq().putstring(value.as_str())),
            NodeKind::InterpolatedStr(parts) => self.compile_interpolation(parts, popped),
            NodeKind::Array(items) => self.compile_array(node, items, popped),
            NodeKind::Hash(pairs) => self.compile_hash(node, pairs, popped),
            NodeKind::Range { left, right, exclusive } => {
                if let Some(value) = node.static_literal() {
                    return self.unless_popped(popped, |c| c.iseq().putobject(value));
                }
                self.compile_optional(left.as_deref())?;
                self.compile_optional(right.as_deref())?;
                self.iseq().newrange(*exclusive)?;
                self.pop_if(popped)
            }

            // ─── Variables ───
            NodeKind::LocalVar(name) => {
                let found = self
                    .resolve(name)
                    .ok_or_else(|| CompileError::undefined_local(name, node.location))?;
                if popped {
                    return Ok(());
                }
                match found.kind {
                    LocalKind::BlockProxy => self.iseq().getblockparam(found.index, found.level),
                    LocalKind::Plain => self.iseq().getlocal(found.index, found.level),
                }
            }
            NodeKind::LocalAssign { name, value } => {
                let found = self.declare_local(name, node.location)?;
                self.compile_node(value, false)?;
                self.dup_unless(popped)?;
                self.iseq().setlocal(found.index, found.level)
            }
            NodeKind::InstanceVar(name) => self.unless_popped(popped, |c| c.iseq().getinstancevariable(name)),
            NodeKind::InstanceAssign { name, value } => {
                self.compile_node(value, false)?;
                self.dup_unless(popped)?;
                self.iseq().setinstancevariable(name)
            }
            NodeKind::GlobalVar(name) => self.unless_popped(popped, |c| c.iseq().getglobal(name)),
            NodeKind::GlobalAssign { name, value } => {
                self.compile_node(value, false)?;
                self.dup_unless(popped)?;
                self.iseq().setglobal(name)
            }
            NodeKind::ClassVar(name) => {
                self.iseq().getclassvariable(name)?;
                self.pop_if(popped)
            }
            NodeKind::ClassVarAssign { name, value } => {
                self.compile_node(value, false)?;
                self.dup_unless(popped)?;
                self.iseq().setclassvariable(name)
            }
            NodeKind::Const(_) | NodeKind::ConstPath { .. } => self.compile_constant(node, popped),
            NodeKind::ConstAssign { name, value } => {
                self.compile_node(value, false)?;
                self.dup_unless(popped)?;
                self.iseq().putspecialobject(special_object::CONST_BASE)?;
                self.iseq().setconstant(name)
            }
            NodeKind::OpAssign { target, operator, value } => {
                self.compile_op_assign(node, target, operator, value, popped)
            }

            // ─── Calls ───
            NodeKind::Call {
                receiver,
                name,
                args,
                block,
            } => self.compile_call(receiver.as_deref(), name, args, block.as_deref(), popped),
            NodeKind::Binary { left, operator, right } => {
                self.compile_node(left, false)?;
                self.compile_node(right, false)?;
                self.iseq().send(CallData::simple(operator.as_str(), 1), None)?;
                self.pop_if(popped)
            }
            NodeKind::Unary { operator, operand } => {
                self.compile_node(operand, false)?;
                self.iseq().send(CallData::simple(operator.as_str(), 0), None)?;
                self.pop_if(popped)
            }
            NodeKind::Not(operand) => {
                self.compile_node(operand, false)?;
                self.iseq().send(CallData::simple("!", 0), None)?;
                self.pop_if(popped)
            }
            NodeKind::Yield(args) => self.compile_yield(args, popped),
            NodeKind::Super(args) => self.compile_super(node, args.as_deref(), popped),
            NodeKind::Lambda { .. } => {
                self.iseq().putspecialobject(special_object::VMCORE)?;
                let block = self.compile_block(node, IseqKind::Lambda)?;
                self.iseq()
                    .send(CallData::new("lambda", 0, CallData::FCALL), Some(block))?;
                self.pop_if(popped)
            }
            NodeKind::Splat(_) => Err(CompileError::invalid_position(
                node,
                "splat is only allowed as the last positional argument",
            )),
            NodeKind::BlockPass(_) => Err(CompileError::invalid_position(
                node,
                "block argument is only allowed at the end of an argument list",
            )),
            NodeKind::KeywordArgs(_) => Err(CompileError::invalid_position(
                node,
                "keyword arguments are only allowed in an argument list",
            )),
            NodeKind::Block { .. } => Err(CompileError::invalid_position(
                node,
                "block must be attached to a call",
            )),

            // ─── Control flow ───
            NodeKind::And(left, right) => self.compile_short_circuit(left, right, false, popped),
            NodeKind::Or(left, right) => self.compile_short_circuit(left, right, true, popped),
            NodeKind::If {
                predicate,
                then_branch,
                else_branch,
            } => self.compile_if(predicate, then_branch, else_branch.as_deref(), false, popped),
            NodeKind::Unless {
                predicate,
                then_branch,
                else_branch,
            } => self.compile_if(predicate, then_branch, else_branch.as_deref(), true, popped),
            NodeKind::While { predicate, body } => self.compile_while(predicate, body, false, popped),
            NodeKind::Until { predicate, body } => self.compile_while(predicate, body, true, popped),
            NodeKind::Break(value) => self.compile_break(node, value.as_deref(), popped),
            NodeKind::Next(value) => self.compile_next(node, value.as_deref(), popped),
            NodeKind::Return(value) => self.compile_return(node, value.as_deref(), popped),
            NodeKind::Redo | NodeKind::Retry => Err(CompileError::unhandled_with_hint(
                node,
                "restarting a loop body or a begin block is not supported",
            )),
            NodeKind::Case {
                subject,
                whens,
                else_branch,
            } => match subject {
                Some(subject) => self.compile_case(subject, whens, else_branch.as_deref(), popped),
                None => self.compile_case_without_subject(whens, else_branch.as_deref(), popped),
            },
            NodeKind::CaseIn {
                subject,
                clauses,
                else_branch,
            } => self.compile_case_in(subject, clauses, else_branch.as_deref(), popped),
            NodeKind::Begin {
                body,
                rescues,
                else_branch,
                ensure,
            } => self.compile_begin(node, body, rescues, else_branch.as_deref(), ensure.as_deref(), popped),

            // ─── Definitions ───
            NodeKind::Def {
                receiver,
                name,
                params,
                body,
            } => self.compile_def(node, receiver.as_deref(), name, params, body, popped),
            NodeKind::Class { name, superclass, body } => {
                self.iseq().putspecialobject(special_object::CONST_BASE)?;
                let mut flags = define_class::TYPE_CLASS;
                match superclass {
                    Some(superclass) => {
                        self.compile_node(superclass, false)?;
                        flags |= define_class::FLAG_HAS_SUPERCLASS;
                    }
                    None => self.iseq().putnil()?,
                }
                let class = self.compile_class_body(IseqKind::Class, format!("<class:{}>", name), node, body)?;
                self.iseq().defineclass(name, class, flags)?;
                self.pop_if(popped)
            }
            NodeKind::Module { name, body } => {
                self.iseq().putspecialobject(special_object::CONST_BASE)?;
                self.iseq().putnil()?;
                let module = self.compile_class_body(IseqKind::Module, format!("<module:{}>", name), node, body)?;
                self.iseq().defineclass(name, module, define_class::TYPE_MODULE)?;
                self.pop_if(popped)
            }
            NodeKind::Alias { new_name, old_name } => {
                self.iseq().putspecialobject(special_object::VMCORE)?;
                self.iseq().putspecialobject(special_object::CBASE)?;
                self.iseq().putobject(Literal::symbol(new_name.as_str()))?;
                self.iseq().putobject(Literal::symbol(old_name.as_str()))?;
                self.iseq()
                    .send(CallData::simple("core#set_method_alias", 3), None)?;
                self.pop_if(popped)
            }
        }
    }

    fn unless_popped<F>(&mut self, popped: bool, emit: F) -> CompileResult
    where
        F: FnOnce(&mut Self) -> CompileResult,
    {
        if popped { Ok(()) } else { emit(self) }
    }

    fn pop_if(&mut self, popped: bool) -> CompileResult {
        if popped { self.iseq().pop() } else { Ok(()) }
    }

    fn dup_unless(&mut self, popped: bool) -> CompileResult {
        if popped { Ok(()) } else { self.iseq().dup() }
    }

    fn compile_optional(&mut self, node: Option<&Node>) -> CompileResult {
        match node {
            Some(node) => self.compile_node(node, false),
            None => self.iseq().putnil(),
        }
    }

    fn compile_statements(&mut self, statements: &[Node], popped: bool) -> CompileResult {
        let Some((last, rest)) = statements.split_last() else {
            return self.unless_popped(popped, |c| c.iseq().putnil());
        };
        for statement in rest {
            self.compile_node(statement, true)?;
        }
        self.compile_node(last, popped)
    }

    // =========================================================================
    // Literals
    // =========================================================================

    fn compile_interpolation(&mut self, parts: &[Node], popped: bool) -> CompileResult {
        if let [Node { kind: NodeKind::Str(value), .. }] = parts {
            return self.unless_popped(popped, |c| c.iseq().putstring(value.as_str()));
        }
        if parts.is_empty() {
            return self.unless_popped(popped, |c| c.iseq().putstring(""));
        }
        for part in parts {
            match &part.kind {
                NodeKind::Str(value) => self.iseq().putobject(Literal::string(value.as_str()))?,
                _ => {
                    self.compile_node(part, false)?;
                    self.iseq().dup()?;
                    self.iseq().objtostring()?;
                    self.iseq().anytostring()?;
                }
            }
        }
        self.iseq().concatstrings(parts.len())?;
        self.pop_if(popped)
    }

    fn compile_array(&mut self, node: &Node, items: &[Node], popped: bool) -> CompileResult {
        if let Some(splat) = items.iter().find(|item| matches!(item.kind, NodeKind::Splat(_))) {
            return Err(CompileError::invalid_position(splat, "splat is not supported inside array literals"));
        }
        if popped {
            return items.iter().try_for_each(|item| self.compile_node(item, true));
        }
        match node.static_literal() {
            Some(value) if !items.is_empty() && value.is_static() => self.iseq().duparray(value),
            _ => {
                for item in items {
                    self.compile_node(item, false)?;
                }
                self.iseq().newarray(items.len())
            }
        }
    }

    fn compile_hash(&mut self, node: &Node, pairs: &[(Node, Node)], popped: bool) -> CompileResult {
        if popped {
            for (key, value) in pairs {
                self.compile_node(key, true)?;
                self.compile_node(value, true)?;
            }
            return Ok(());
        }
        match node.static_literal() {
            Some(value) if !pairs.is_empty() && value.is_static() => self.iseq().duphash(value),
            _ => {
                for (key, value) in pairs {
                    self.compile_node(key, false)?;
                    self.compile_node(value, false)?;
                }
                self.iseq().newhash(pairs.len() * 2)
            }
        }
    }

    // =========================================================================
    // Constants and operator assignment
    // =========================================================================

    fn static_const_path(node: &Node) -> Option<Vec<String>> {
        match &node.kind {
            NodeKind::Const(name) => Some(vec![name.clone()]),
            NodeKind::ConstPath { scope: None, name } => Some(vec![String::new(), name.clone()]),
            NodeKind::ConstPath {
                scope: Some(scope),
                name,
            } => {
                let mut path = Self::static_const_path(scope)?;
                path.push(name.clone());
                Some(path)
            }
            _ => None,
        }
    }

    fn compile_constant(&mut self, node: &Node, popped: bool) -> CompileResult {
        match Self::static_const_path(node) {
            Some(path) => self.iseq().constant_path(&path)?,
            None => {
                let NodeKind::ConstPath {
                    scope: Some(scope),
                    name,
                } = &node.kind
                else {
                    return Err(CompileError::unhandled(node));
                };
                self.compile_node(scope, false)?;
                self.iseq().putobject(Literal::False)?;
                self.iseq().getconstant(name)?;
            }
        }
        self.pop_if(popped)
    }

    fn compile_op_assign(&mut self, node: &Node, target: &Node, operator: &str, value: &Node, popped: bool) -> CompileResult {
        if let NodeKind::Call {
            receiver: Some(receiver),
            name,
            args,
            block: None,
        } = &target.kind
        {
            if !args.is_empty() || operator == "||" || operator == "&&" {
                return Err(CompileError::unhandled_with_hint(
                    node,
                    "operator assignment to calls supports plain attributes with arithmetic operators",
                ));
            }
            // recv.attr op= value
            self.compile_node(receiver, false)?;
            self.iseq().dup()?;
            self.iseq().send(CallData::simple(name.as_str(), 0), None)?;
            self.compile_node(value, false)?;
            self.iseq().send(CallData::simple(operator, 1), None)?;
            if !popped {
                self.iseq().swap()?;
                self.iseq().topn(1)?;
            }
            self.iseq().send(CallData::simple(format!("{}=", name), 1), None)?;
            return self.iseq().pop();
        }

        let read = |c: &mut Self| -> CompileResult {
            match &target.kind {
                NodeKind::LocalVar(name) => {
                    let found = c.declare_local(name, target.location)?;
                    c.iseq().getlocal(found.index, found.level)
                }
                NodeKind::InstanceVar(name) => c.iseq().getinstancevariable(name),
                NodeKind::GlobalVar(name) => c.iseq().getglobal(name),
                NodeKind::ClassVar(name) => c.iseq().getclassvariable(name),
                _ => Err(CompileError::unhandled_with_hint(node, "unsupported operator assignment target")),
            }
        };
        let write = |c: &mut Self| -> CompileResult {
            match &target.kind {
                NodeKind::LocalVar(name) => {
                    let found = c.declare_local(name, target.location)?;
                    c.iseq().setlocal(found.index, found.level)
                }
                NodeKind::InstanceVar(name) => c.iseq().setinstancevariable(name),
                NodeKind::GlobalVar(name) => c.iseq().setglobal(name),
                NodeKind::ClassVar(name) => c.iseq().setclassvariable(name),
                _ => Err(CompileError::unhandled_with_hint(node, "unsupported operator assignment target")),
            }
        };

        match operator {
            "||" | "&&" => {
                let done = self.new_label();
                read(self)?;
                self.iseq().dup()?;
                if operator == "||" {
                    self.iseq().branchif(done)?;
                } else {
                    self.iseq().branchunless(done)?;
                }
                self.iseq().pop()?;
                self.compile_node(value, false)?;
                self.iseq().dup()?;
                write(self)?;
                self.place(done);
                self.pop_if(popped)
            }
            _ => {
                read(self)?;
                self.compile_node(value, false)?;
                self.iseq().send(CallData::simple(operator, 1), None)?;
                self.dup_unless(popped)?;
                write(self)
            }
        }
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn compile_args(&mut self, args: &[Node]) -> Result<ArgsInfo, CompileError> {
        let mut info = ArgsInfo {
            argc: 0,
            flags: 0,
            kw_arg: Vec::new(),
        };
        for (i, arg) in args.iter().enumerate() {
            let rest = &args[i + 1..];
            match &arg.kind {
                NodeKind::Splat(inner) => {
                    if rest
                        .iter()
                        .any(|a| !matches!(a.kind, NodeKind::KeywordArgs(_) | NodeKind::BlockPass(_)))
                    {
                        return Err(CompileError::invalid_position(
                            arg,
                            "splat is only allowed as the last positional argument",
                        ));
                    }
                    self.compile_node(inner, false)?;
                    self.iseq().splatarray(false)?;
                    info.argc += 1;
                    info.flags |= CallData::ARGS_SPLAT;
                }
                NodeKind::KeywordArgs(pairs) => {
                    if rest.iter().any(|a| !matches!(a.kind, NodeKind::BlockPass(_))) {
                        return Err(CompileError::invalid_position(
                            arg,
                            "keyword arguments must follow the positional arguments",
                        ));
                    }
                    for (name, value) in pairs {
                        self.compile_node(value, false)?;
                        info.kw_arg.push(name.clone());
                    }
                    info.argc += pairs.len();
                    info.flags |= CallData::KWARG;
                }
                NodeKind::BlockPass(inner) => {
                    if !rest.is_empty() {
                        return Err(CompileError::invalid_position(
                            arg,
                            "block argument must be the last argument",
                        ));
                    }
                    self.compile_node(inner, false)?;
                    info.flags |= CallData::ARGS_BLOCKARG;
                }
                _ => {
                    self.compile_node(arg, false)?;
                    info.argc += 1;
                }
            }
        }
        Ok(info)
    }

    fn is_attribute_writer(name: &str) -> bool {
        name.ends_with('=') && !matches!(name, "==" | "!=" | "<=" | ">=" | "===")
    }

    fn compile_call(
        &mut self,
        receiver: Option<&Node>,
        name: &str,
        args: &[Node],
        block: Option<&Node>,
        popped: bool,
    ) -> CompileResult {
        // `recv.attr = v` evaluates to `v`, not to the writer's result
        let keep_argument = !popped
            && block.is_none()
            && receiver.is_some()
            && Self::is_attribute_writer(name)
            && !args.iter().any(|a| matches!(a.kind, NodeKind::BlockPass(_)));
        if keep_argument {
            self.iseq().putnil()?;
        }

        let start = self.new_label();
        let sp = self.depth();
        if block.is_some() {
            self.place(start);
        }

        let mut flags = 0;
        match receiver {
            Some(receiver) => self.compile_node(receiver, false)?,
            None => {
                self.iseq().putself()?;
                flags |= CallData::FCALL;
            }
        }
        let info = self.compile_args(args)?;
        flags |= info.flags;
        if receiver.is_none() && args.is_empty() && block.is_none() {
            flags |= CallData::VCALL;
        }

        let block_iseq = match block {
            Some(block) => {
                if info.flags & CallData::ARGS_BLOCKARG != 0 {
                    return Err(CompileError::invalid_position(
                        block,
                        "both block argument and literal block are given",
                    ));
                }
                Some(self.compile_block(block, IseqKind::Block)?)
            }
            None => {
                flags |= info.simple_flag();
                None
            }
        };

        let argc = info.argc;
        let calldata = CallData::with_keywords(name, argc, flags, info.kw_arg);
        if keep_argument {
            self.iseq().setn(argc + 1)?;
        }
        self.iseq().send(calldata, block_iseq)?;

        if block_iseq.is_some() {
            let end = self.new_label();
            self.place(end);
            self.iseq().catch_table.push(CatchEntry {
                kind: CatchKind::Break,
                iseq: None,
                start,
                end,
                cont: end,
                sp,
            });
        }
        if keep_argument {
            self.iseq().pop()?;
        }
        self.pop_if(popped)
    }

    /// Compile a `Block` or `Lambda` node into a child sequence.
    fn compile_block(&mut self, node: &Node, kind: IseqKind) -> Result<IseqId, CompileError> {
        let (NodeKind::Block { params, body } | NodeKind::Lambda { params, body }) = &node.kind else {
            return Err(CompileError::invalid_position(node, "expected a block"));
        };
        let name = self.block_name();
        self.with_child(kind, name, node.location, |c| {
            c.setup_params(params, node.location)?;
            c.compile_node(body, false)?;
            c.iseq().leave()
        })
    }

    fn compile_yield(&mut self, args: &[Node], popped: bool) -> CompileResult {
        let info = self.compile_args(args)?;
        if info.flags & CallData::ARGS_BLOCKARG != 0 {
            if let Some(pass) = args.last() {
                return Err(CompileError::invalid_position(pass, "yield does not take a block argument"));
            }
        }
        let flags = info.flags | info.simple_flag();
        self.iseq()
            .invokeblock(CallData::with_keywords("", info.argc, flags, info.kw_arg))?;
        self.pop_if(popped)
    }

    fn compile_super(&mut self, node: &Node, args: Option<&[Node]>, popped: bool) -> CompileResult {
        let Some((method, level)) = self.enclosing_method() else {
            return Err(CompileError::invalid_position(node, "super called outside of a method"));
        };
        let method_name = self.program[method].name.clone();
        self.iseq().putself()?;

        let calldata = match args {
            Some(args) => {
                let info = self.compile_args(args)?;
                let flags = CallData::FCALL | CallData::SUPER | info.flags | info.simple_flag();
                CallData::with_keywords(method_name, info.argc, flags, info.kw_arg)
            }
            None => {
                // implicit super forwards the current values of the parameters
                let shape: ArgumentOptions = self.program[method].args.clone();
                let mut argc = 0;
                let mut flags = CallData::FCALL | CallData::SUPER | CallData::ZSUPER;
                for index in 0..shape.lead_num + shape.opt_num() {
                    self.iseq().getlocal(index, level)?;
                    argc += 1;
                }
                if let Some(rest) = shape.rest_start {
                    self.iseq().getlocal(rest, level)?;
                    self.iseq().splatarray(false)?;
                    argc += 1;
                    flags |= CallData::ARGS_SPLAT;
                }
                if let Some(post) = shape.post_start {
                    for index in post..post + shape.post_num {
                        self.iseq().getlocal(index, level)?;
                        argc += 1;
                    }
                }
                if flags & CallData::ARGS_SPLAT == 0 {
                    flags |= CallData::ARGS_SIMPLE;
                }
                CallData::new(method_name, argc, flags)
            }
        };
        self.iseq().invokesuper(calldata, None)?;
        self.pop_if(popped)
    }

    // =========================================================================
    // Conditionals
    // =========================================================================

    fn compile_short_circuit(&mut self, left: &Node, right: &Node, is_or: bool, popped: bool) -> CompileResult {
        let done = self.new_label();
        self.compile_node(left, false)?;
        self.dup_unless(popped)?;
        if is_or {
            self.iseq().branchif(done)?;
        } else {
            self.iseq().branchunless(done)?;
        }
        self.pop_if(!popped)?;
        self.compile_node(right, popped)?;
        self.place(done);
        Ok(())
    }

    fn compile_if(
        &mut self,
        predicate: &Node,
        then_branch: &Node,
        else_branch: Option<&Node>,
        negate: bool,
        popped: bool,
    ) -> CompileResult {
        let else_label = self.new_label();
        let end_label = self.new_label();

        self.compile_node(predicate, false)?;
        if negate {
            self.iseq().branchif(else_label)?;
        } else {
            self.iseq().branchunless(else_label)?;
        }
        let depth = self.depth();

        self.compile_node(then_branch, popped)?;
        self.iseq().jump(end_label)?;

        self.place(else_label);
        self.set_depth(depth);
        match else_branch {
            Some(else_branch) => self.compile_node(else_branch, popped)?,
            None => self.unless_popped(popped, |c| c.iseq().putnil())?,
        }
        self.place(end_label);
        Ok(())
    }

    fn compile_case(&mut self, subject: &Node, whens: &[WhenClause], else_branch: Option<&Node>, popped: bool) -> CompileResult {
        let end_label = self.new_label();
        self.compile_node(subject, false)?;
        let depth = self.depth();

        let mut bodies = Vec::with_capacity(whens.len());
        for clause in whens {
            let body_label = self.new_label();
            for condition in &clause.conditions {
                self.iseq().dup()?;
                match &condition.kind {
                    NodeKind::Splat(inner) => {
                        self.compile_node(inner, false)?;
                        self.iseq().checkmatch(check_match::TYPE_CASE | check_match::ARRAY)?;
                    }
                    _ => {
                        self.compile_node(condition, false)?;
                        self.iseq().checkmatch(check_match::TYPE_CASE)?;
                    }
                }
                self.iseq().branchif(body_label)?;
            }
            bodies.push((body_label, &clause.body));
        }

        self.iseq().pop()?;
        match else_branch {
            Some(else_branch) => self.compile_node(else_branch, popped)?,
            None => self.unless_popped(popped, |c| c.iseq().putnil())?,
        }
        self.iseq().jump(end_label)?;

        for (label, body) in bodies {
            self.place(label);
            self.set_depth(depth);
            self.iseq().pop()?;
            self.compile_node(body, popped)?;
            self.iseq().jump(end_label)?;
        }

        self.place(end_label);
        self.set_depth(depth - usize::from(popped));
        Ok(())
    }

    fn compile_case_without_subject(&mut self, whens: &[WhenClause], else_branch: Option<&Node>, popped: bool) -> CompileResult {
        let end_label = self.new_label();
        let depth = self.depth();

        let mut bodies = Vec::with_capacity(whens.len());
        for clause in whens {
            let body_label = self.new_label();
            for condition in &clause.conditions {
                match &condition.kind {
                    NodeKind::Splat(inner) => {
                        self.iseq().putnil()?;
                        self.compile_node(inner, false)?;
                        self.iseq().checkmatch(check_match::TYPE_WHEN | check_match::ARRAY)?;
                    }
                    _ => self.compile_node(condition, false)?,
                }
                self.iseq().branchif(body_label)?;
            }
            bodies.push((body_label, &clause.body));
        }

        match else_branch {
            Some(else_branch) => self.compile_node(else_branch, popped)?,
            None => self.unless_popped(popped, |c| c.iseq().putnil())?,
        }
        self.iseq().jump(end_label)?;

        for (label, body) in bodies {
            self.place(label);
            self.set_depth(depth);
            self.compile_node(body, popped)?;
            self.iseq().jump(end_label)?;
        }

        self.place(end_label);
        self.set_depth(depth + usize::from(!popped));
        Ok(())
    }

    // =========================================================================
    // Pattern matching
    // =========================================================================

    fn compile_case_in(&mut self, subject: &Node, clauses: &[InClause], else_branch: Option<&Node>, popped: bool) -> CompileResult {
        let end_label = self.new_label();
        self.compile_node(subject, false)?;
        let depth = self.depth();

        for clause in clauses {
            let fail = self.new_label();
            self.compile_pattern(&clause.pattern, fail, subject.location)?;
            if let Some(guard) = &clause.guard {
                self.compile_node(guard, false)?;
                self.iseq().branchunless(fail)?;
            }
            self.iseq().pop()?;
            self.compile_node(&clause.body, popped)?;
            self.iseq().jump(end_label)?;
            self.place(fail);
            self.set_depth(depth);
        }

        match else_branch {
            Some(else_branch) => {
                self.iseq().pop()?;
                self.compile_node(else_branch, popped)?;
            }
            None => {
                // raise NoMatchingPatternError, subject.inspect
                self.iseq().putself()?;
                self.iseq().constant_path(&["NoMatchingPatternError".to_string()])?;
                self.iseq().topn(2)?;
                self.iseq().send(CallData::simple("inspect", 0), None)?;
                self.iseq()
                    .send(CallData::new("raise", 2, CallData::FCALL | CallData::ARGS_SIMPLE), None)?;
                if popped {
                    self.iseq().adjuststack(2)?;
                } else {
                    self.iseq().swap()?;
                    self.iseq().pop()?;
                }
            }
        }

        self.place(end_label);
        self.set_depth(depth - usize::from(popped));
        Ok(())
    }

    /// Match the value on top of the stack against `pattern`, jumping to
    /// `fail` on mismatch. The stack is unchanged on both paths.
    fn compile_pattern(&mut self, pattern: &Pattern, fail: Label, location: Location) -> CompileResult {
        match pattern {
            Pattern::Value(value) => {
                self.iseq().dup()?;
                self.compile_node(value, false)?;
                self.iseq().checkmatch(check_match::TYPE_CASE)?;
                self.iseq().branchunless(fail)
            }
            Pattern::Bind(name) => {
                let found = self.declare_local(name, location)?;
                self.iseq().dup()?;
                self.iseq().setlocal(found.index, found.level)
            }
            Pattern::Alternatives(alternatives) => {
                let Some((last, rest)) = alternatives.split_last() else {
                    return self.iseq().jump(fail);
                };
                let matched = self.new_label();
                for alternative in rest {
                    let next = self.new_label();
                    self.compile_pattern(alternative, next, location)?;
                    self.iseq().jump(matched)?;
                    self.place(next);
                }
                self.compile_pattern(last, fail, location)?;
                self.place(matched);
                Ok(())
            }
            Pattern::Array(elements) => {
                self.iseq().dup()?;
                self.iseq().constant_path(&["Array".to_string()])?;
                self.iseq().checkmatch(check_match::TYPE_CASE)?;
                self.iseq().branchunless(fail)?;

                self.iseq().dup()?;
                self.iseq().send(CallData::simple("length", 0), None)?;
                self.iseq().putobject(Literal::Integer(elements.len() as i64))?;
                self.iseq().send(CallData::simple("==", 1), None)?;
                self.iseq().branchunless(fail)?;

                if elements.is_empty() {
                    return Ok(());
                }
                let element_fail = self.new_label();
                let matched = self.new_label();
                for (i, element) in elements.iter().enumerate() {
                    self.iseq().dup()?;
                    self.iseq().putobject(Literal::Integer(i as i64))?;
                    self.iseq().send(CallData::simple("[]", 1), None)?;
                    self.compile_pattern(element, element_fail, location)?;
                    self.iseq().pop()?;
                }
                self.iseq().jump(matched)?;

                let depth = self.depth();
                self.place(element_fail);
                self.set_depth(depth + 1);
                self.iseq().pop()?;
                self.iseq().jump(fail)?;
                self.place(matched);
                self.set_depth(depth);
                Ok(())
            }
        }
    }

    // =========================================================================
    // Loops and jumps
    // =========================================================================

    fn compile_while(&mut self, predicate: &Node, body: &Node, until: bool, popped: bool) -> CompileResult {
        let body_label = self.new_label();
        let cond_label = self.new_label();
        let break_label = self.new_label();
        let depth = self.depth();

        self.iseq().jump(cond_label)?;
        self.place(body_label);
        self.scope.loops.push(LoopContext {
            break_label,
            next_label: cond_label,
            depth,
            ensures: self.scope.ensures.len(),
        });
        let result = self.compile_node(body, true);
        self.scope.loops.pop();
        result?;

        self.place(cond_label);
        self.set_depth(depth);
        self.compile_node(predicate, false)?;
        if until {
            self.iseq().branchunless(body_label)?;
        } else {
            self.iseq().branchif(body_label)?;
        }
        self.iseq().putnil()?;
        self.place(break_label);
        self.pop_if(popped)
    }

    /// Inline the bodies of ensure clauses opened after `keep` of them.
    fn inline_ensures(&mut self, keep: usize) -> CompileResult {
        if self.scope.ensures.len() <= keep {
            return Ok(());
        }
        let saved = std::mem::take(&mut self.scope.ensures);
        let mut result = Ok(());
        for (i, ensure) in saved.iter().enumerate().skip(keep).rev() {
            self.scope.ensures = saved[..i].to_vec();
            result = self.compile_node(ensure, true);
            if result.is_err() {
                break;
            }
        }
        self.scope.ensures = saved;
        result
    }

    fn compile_break(&mut self, node: &Node, value: Option<&Node>, popped: bool) -> CompileResult {
        let start = self.depth();
        if let Some(context) = self.scope.loops.last().copied() {
            self.compile_optional(value)?;
            self.inline_ensures(context.ensures)?;
            let extra = self.depth() - 1 - context.depth;
            if extra > 0 {
                self.iseq().setn(extra)?;
                self.iseq().adjuststack(extra)?;
            }
            self.iseq().jump(context.break_label)?;
        } else {
            match self.frame_kind() {
                (IseqKind::Block, _) => {
                    self.compile_optional(value)?;
                    self.iseq().throw(throw_tag::BREAK)?;
                }
                (IseqKind::Lambda, 0) => {
                    self.compile_optional(value)?;
                    self.inline_ensures(0)?;
                    self.iseq().leave()?;
                }
                (IseqKind::Lambda, _) => {
                    self.compile_optional(value)?;
                    self.iseq().throw(throw_tag::RETURN)?;
                }
                _ => return Err(CompileError::invalid_position(node, "break outside of a loop or block")),
            }
        }
        self.set_depth(start + usize::from(!popped));
        Ok(())
    }

    fn compile_next(&mut self, node: &Node, value: Option<&Node>, popped: bool) -> CompileResult {
        let start = self.depth();
        if let Some(context) = self.scope.loops.last().copied() {
            if let Some(value) = value {
                self.compile_node(value, true)?;
            }
            self.inline_ensures(context.ensures)?;
            let extra = self.depth() - context.depth;
            if extra > 0 {
                self.iseq().adjuststack(extra)?;
            }
            self.iseq().jump(context.next_label)?;
        } else {
            match self.frame_kind() {
                (IseqKind::Block | IseqKind::Lambda, 0) => {
                    self.compile_optional(value)?;
                    self.inline_ensures(0)?;
                    self.iseq().leave()?;
                }
                (IseqKind::Block | IseqKind::Lambda, _) => {
                    self.compile_optional(value)?;
                    self.iseq().throw(throw_tag::NEXT)?;
                }
                _ => return Err(CompileError::invalid_position(node, "next outside of a loop or block")),
            }
        }
        self.set_depth(start + usize::from(!popped));
        Ok(())
    }

    fn compile_return(&mut self, node: &Node, value: Option<&Node>, popped: bool) -> CompileResult {
        let start = self.depth();
        match self.kind() {
            IseqKind::Class | IseqKind::Module => {
                return Err(CompileError::invalid_position(node, "return in a class or module body"));
            }
            IseqKind::Top | IseqKind::Method | IseqKind::SingletonMethod | IseqKind::Lambda => {
                self.compile_optional(value)?;
                self.inline_ensures(0)?;
                self.iseq().leave()?;
            }
            IseqKind::Block | IseqKind::Rescue | IseqKind::Ensure => {
                self.compile_optional(value)?;
                self.iseq().throw(throw_tag::RETURN)?;
            }
        }
        self.set_depth(start + usize::from(!popped));
        Ok(())
    }

    // =========================================================================
    // Exceptions
    // =========================================================================

    fn compile_begin(
        &mut self,
        node: &Node,
        body: &Node,
        rescues: &[RescueClause],
        else_branch: Option<&Node>,
        ensure: Option<&Node>,
        popped: bool,
    ) -> CompileResult {
        let Some(ensure) = ensure else {
            if rescues.is_empty() {
                self.compile_node(body, else_branch.is_some() || popped)?;
                if let Some(else_branch) = else_branch {
                    self.compile_node(else_branch, popped)?;
                }
                return Ok(());
            }
            self.compile_rescue(node, body, rescues, else_branch)?;
            return self.pop_if(popped);
        };

        let start = self.new_label();
        let end = self.new_label();
        let cont = self.new_label();
        let sp = self.depth();

        self.place(start);
        self.scope.ensures.push(ensure.clone());
        let result = if rescues.is_empty() {
            self.compile_node(body, false).and_then(|_| match else_branch {
                Some(else_branch) => {
                    self.iseq().pop()?;
                    self.compile_node(else_branch, false)
                }
                None => Ok(()),
            })
        } else {
            self.compile_rescue(node, body, rescues, else_branch)
        };
        self.scope.ensures.pop();
        result?;
        self.place(end);

        self.compile_node(ensure, true)?;
        self.place(cont);

        let name = format!("ensure in {}", self.program[self.current()].name);
        let handler = self.with_child(IseqKind::Ensure, name, ensure.location, |c| {
            let errinfo = c.declare_param(ERRINFO, LocalKind::Plain, ensure.location)?;
            c.compile_node(ensure, true)?;
            c.iseq().getlocal(errinfo, 0)?;
            c.iseq().throw(throw_tag::NONE)
        })?;
        self.iseq().catch_table.push(CatchEntry {
            kind: CatchKind::Ensure,
            iseq: Some(handler),
            start,
            end,
            cont,
            sp,
        });
        self.pop_if(popped)
    }

    /// `body` protected by `rescues`; leaves one value.
    fn compile_rescue(&mut self, node: &Node, body: &Node, rescues: &[RescueClause], else_branch: Option<&Node>) -> CompileResult {
        let start = self.new_label();
        let end = self.new_label();
        let cont = self.new_label();
        let sp = self.depth();

        self.place(start);
        self.compile_node(body, false)?;
        self.place(end);
        if let Some(else_branch) = else_branch {
            self.iseq().pop()?;
            self.compile_node(else_branch, false)?;
        }
        self.place(cont);

        let name = format!("rescue in {}", self.program[self.current()].name);
        let handler = self.with_child(IseqKind::Rescue, name, node.location, |c| {
            c.compile_rescue_clauses(rescues, node.location)
        })?;
        self.iseq().catch_table.push(CatchEntry {
            kind: CatchKind::Rescue,
            iseq: Some(handler),
            start,
            end,
            cont,
            sp,
        });
        Ok(())
    }

    fn compile_rescue_clauses(&mut self, rescues: &[RescueClause], location: Location) -> CompileResult {
        let errinfo = self.declare_param(ERRINFO, LocalKind::Plain, location)?;
        for clause in rescues {
            let body_label = self.new_label();
            let next_label = self.new_label();

            if clause.exceptions.is_empty() {
                self.iseq().getlocal(errinfo, 0)?;
                self.iseq().constant_path(&["StandardError".to_string()])?;
                self.iseq().checkmatch(check_match::TYPE_RESCUE)?;
                self.iseq().branchif(body_label)?;
            }
            for exception in &clause.exceptions {
                self.iseq().getlocal(errinfo, 0)?;
                match &exception.kind {
                    NodeKind::Splat(inner) => {
                        self.compile_node(inner, false)?;
                        self.iseq().checkmatch(check_match::TYPE_RESCUE | check_match::ARRAY)?;
                    }
                    _ => {
                        self.compile_node(exception, false)?;
                        self.iseq().checkmatch(check_match::TYPE_RESCUE)?;
                    }
                }
                self.iseq().branchif(body_label)?;
            }
            self.iseq().jump(next_label)?;

            self.place(body_label);
            if let Some(binding) = &clause.binding {
                let found = self.declare_local(binding, clause.body.location)?;
                self.iseq().getlocal(errinfo, 0)?;
                self.iseq().setlocal(found.index, found.level)?;
            }
            self.compile_node(&clause.body, false)?;
            self.iseq().leave()?;
            self.place(next_label);
        }
        self.iseq().getlocal(errinfo, 0)?;
        self.iseq().throw(throw_tag::NONE)
    }

    // =========================================================================
    // Definitions
    // =========================================================================

    /// Declare parameters and emit the default-value prologue.
    fn setup_params(&mut self, params: &Params, location: Location) -> CompileResult {
        let mut args = ArgumentOptions {
            lead_num: params.required.len(),
            ..ArgumentOptions::default()
        };
        for name in &params.required {
            self.declare_param(name, LocalKind::Plain, location)?;
        }
        let mut optional = Vec::with_capacity(params.optional.len());
        for (name, default) in &params.optional {
            optional.push((self.declare_param(name, LocalKind::Plain, location)?, default));
        }
        if let Some(rest) = &params.rest {
            args.rest_start = Some(self.declare_param(rest, LocalKind::Plain, location)?);
        }
        for (i, name) in params.post.iter().enumerate() {
            let index = self.declare_param(name, LocalKind::Plain, location)?;
            if i == 0 {
                args.post_start = Some(index);
            }
        }
        args.post_num = params.post.len();
        if let Some(block) = &params.block {
            args.block_start = Some(self.declare_param(block, LocalKind::BlockProxy, location)?);
        }

        if !optional.is_empty() {
            for (index, default) in optional {
                let label = self.new_label();
                self.place(label);
                args.opt.push(label);
                self.compile_node(default, false)?;
                self.iseq().setlocal(index, 0)?;
            }
            let last = self.new_label();
            self.place(last);
            args.opt.push(last);
        }
        self.iseq().args = args;
        Ok(())
    }

    fn compile_def(
        &mut self,
        node: &Node,
        receiver: Option<&Node>,
        name: &str,
        params: &Params,
        body: &Node,
        popped: bool,
    ) -> CompileResult {
        let kind = if receiver.is_some() {
            IseqKind::SingletonMethod
        } else {
            IseqKind::Method
        };
        let method = self.with_child(kind, name.to_string(), node.location, |c| {
            c.setup_params(params, node.location)?;
            c.compile_node(body, false)?;
            c.iseq().leave()
        })?;
        match receiver {
            Some(receiver) => {
                self.compile_node(receiver, false)?;
                self.iseq().definesmethod(name, method)?;
            }
            None => self.iseq().definemethod(name, method)?,
        }
        self.unless_popped(popped, |c| c.iseq().putobject(Literal::symbol(name)))
    }

    fn compile_class_body(&mut self, kind: IseqKind, name: String, node: &Node, body: &Node) -> Result<IseqId, CompileError> {
        self.with_child(kind, name, node.location, |c| {
            c.compile_node(body, false)?;
            c.iseq().leave()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::{Insn, OptOp};

    fn compile_with(node: Node, options: CompileOptions) -> Program {
        Compiler::new(options, "<test>").compile(&Node::program(vec![node])).unwrap()
    }

    fn compile(node: Node) -> Program {
        compile_with(node, CompileOptions::default())
    }

    fn names(iseq: &InstructionSequence) -> Vec<&'static str> {
        iseq.insns().map(Insn::name).collect()
    }

    fn compile_err(node: Node) -> CompileError {
        Compiler::new(CompileOptions::default(), "<test>")
            .compile(&Node::program(vec![node]))
            .unwrap_err()
    }

    // =========================================================================
    // Literals and arithmetic
    // =========================================================================

    #[test]
    fn test_arithmetic_uses_specialized_ops() {
        let node = Node::binary(Node::int(2), "+", Node::binary(Node::int(3), "*", Node::int(4)));
        let program = compile(node);
        assert_eq!(
            names(program.root()),
            vec!["putobject", "putobject", "putobject", "opt_mult", "opt_plus", "leave"]
        );
        assert_eq!(program.root().stack_max(), 3);
    }

    #[test]
    fn test_plain_options_use_send() {
        let node = Node::binary(Node::int(2), "+", Node::int(3));
        let program = compile_with(node, CompileOptions::plain());
        assert_eq!(names(program.root()), vec!["putobject", "putobject", "send", "leave"]);
    }

    #[test]
    fn test_static_array_uses_duparray() {
        let node = Node::new(NodeKind::Array(vec![Node::int(1), Node::int(2)]));
        let program = compile(node);
        assert_eq!(names(program.root()), vec!["duparray", "leave"]);
    }

    #[test]
    fn test_array_with_string_uses_newarray() {
        let node = Node::new(NodeKind::Array(vec![Node::str("a"), Node::int(2)]));
        let program = compile(node);
        assert_eq!(names(program.root()), vec!["putstring", "putobject", "newarray", "leave"]);
    }

    #[test]
    fn test_interpolation() {
        let node = Node::new(NodeKind::InterpolatedStr(vec![Node::str("a"), Node::int(1)]));
        let program = compile(node);
        assert_eq!(
            names(program.root()),
            vec!["putobject", "putobject_INT2FIX_1_", "dup", "objtostring", "anytostring", "concatstrings", "leave"]
        );
    }

    #[test]
    fn test_empty_program_returns_nil() {
        let program = Compiler::new(CompileOptions::default(), "<test>")
            .compile(&Node::program(vec![]))
            .unwrap();
        assert_eq!(names(program.root()), vec!["putnil", "leave"]);
    }

    #[test]
    fn test_popped_statements_are_dropped() {
        let program = Compiler::new(CompileOptions::default(), "<test>")
            .compile(&Node::program(vec![Node::int(1), Node::int(2)]))
            .unwrap();
        assert_eq!(names(program.root()), vec!["putobject", "leave"]);
    }

    // =========================================================================
    // Variables
    // =========================================================================

    #[test]
    fn test_local_assignment_and_read() {
        let program = Compiler::new(CompileOptions::default(), "<test>")
            .compile(&Node::program(vec![Node::lasgn("a", Node::int(5)), Node::lvar("a")]))
            .unwrap();
        assert_eq!(
            names(program.root()),
            vec!["putobject", "setlocal_WC_0", "getlocal_WC_0", "leave"]
        );
        assert_eq!(program.root().local_table.size(), 1);
    }

    #[test]
    fn test_undefined_local_is_an_error() {
        let err = compile_err(Node::lvar("nope"));
        assert!(matches!(err, CompileError::UndefinedLocal { .. }));
    }

    #[test]
    fn test_block_reads_method_local_at_level_one() {
        let call = Node::call(Some(Node::new(NodeKind::Array(vec![Node::int(1)]))), "each", vec![])
            .with_block(Params::required(&["x"]), Node::binary(Node::lvar("a"), "+", Node::lvar("x")));
        let body = Node::statements(vec![Node::lasgn("a", Node::int(1)), call]);
        let program = compile(Node::def("m", Params::default(), body));

        let block = program
            .iter()
            .find(|(_, iseq)| iseq.kind == IseqKind::Block)
            .map(|(_, iseq)| iseq)
            .unwrap();
        assert_eq!(block.name, "block in m");
        let reads: Vec<&Insn> = block
            .insns()
            .filter(|i| matches!(i, Insn::GetLocalWC0(_) | Insn::GetLocalWC1(_)))
            .collect();
        assert_eq!(reads, vec![&Insn::GetLocalWC1(0), &Insn::GetLocalWC0(0)]);
    }

    #[test]
    fn test_or_assign() {
        let node = Node::new(NodeKind::OpAssign {
            target: Box::new(Node::lvar("a")),
            operator: "||".to_string(),
            value: Box::new(Node::int(2)),
        });
        let program = compile(node);
        assert_eq!(
            names(program.root()),
            vec!["getlocal_WC_0", "dup", "branchif", "pop", "putobject", "dup", "setlocal_WC_0", "leave"]
        );
    }

    #[test]
    fn test_constant_read_by_version() {
        let modern = compile(Node::constant("Foo"));
        assert_eq!(names(modern.root()), vec!["opt_getconstant_path", "leave"]);

        let legacy = compile_with(
            Node::constant("Foo"),
            CompileOptions::default().with_target(crate::bytecode::options::TargetVersion::new(3, 1)),
        );
        assert_eq!(
            names(legacy.root()),
            vec!["opt_getinlinecache", "putobject", "getconstant", "opt_setinlinecache", "leave"]
        );
    }

    // =========================================================================
    // Calls
    // =========================================================================

    #[test]
    fn test_fcall_flags() {
        let program = compile(Node::fcall("puts", vec![Node::int(1)]));
        match program.root().insns().find(|i| i.calldata().is_some()) {
            Some(Insn::OptSendWithoutBlock(cd)) => {
                assert!(cd.has(CallData::FCALL));
                assert!(cd.has(CallData::ARGS_SIMPLE));
                assert_eq!(cd.argc, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_splat_must_be_last() {
        let node = Node::fcall(
            "f",
            vec![Node::new(NodeKind::Splat(Box::new(Node::nil()))), Node::int(1)],
        );
        assert!(matches!(compile_err(node), CompileError::InvalidPosition { .. }));
    }

    #[test]
    fn test_keyword_args() {
        let node = Node::fcall(
            "f",
            vec![Node::int(1), Node::new(NodeKind::KeywordArgs(vec![("k".to_string(), Node::int(2))]))],
        );
        let program = compile(node);
        let cd = program.root().insns().find_map(Insn::calldata).unwrap().clone();
        assert_eq!(cd.argc, 2);
        assert!(cd.has(CallData::KWARG));
        assert!(!cd.has(CallData::ARGS_SIMPLE));
        assert_eq!(cd.kw_arg, vec!["k".to_string()]);
    }

    #[test]
    fn test_block_call_adds_break_entry() {
        let node = Node::fcall("loop", vec![]).with_block(Params::default(), Node::nil());
        let program = compile(node);
        let root = program.root();
        assert_eq!(root.catch_table.len(), 1);
        assert_eq!(root.catch_table[0].kind, CatchKind::Break);
        assert!(matches!(root.insns().nth(1), Some(Insn::Send { block: Some(_), .. })));
    }

    #[test]
    fn test_neq_specialization() {
        let program = compile(Node::binary(Node::int(1), "!=", Node::int(2)));
        assert!(program.root().insns().any(|i| matches!(i, Insn::OptNeq { .. })));
        assert!(program.root().insns().all(|i| !matches!(i, Insn::Opt(OptOp::Eq, _))));
    }

    #[test]
    fn test_attribute_assignment_keeps_value() {
        let node = Node::call(Some(Node::lvar("o")), "x=", vec![Node::int(1)]);
        let program = Compiler::new(CompileOptions::default(), "<test>")
            .compile(&Node::program(vec![Node::lasgn("o", Node::nil()), node]))
            .unwrap();
        let tail: Vec<_> = names(program.root()).into_iter().skip(2).collect();
        assert_eq!(
            tail,
            vec!["putnil", "getlocal_WC_0", "putobject_INT2FIX_1_", "setn", "opt_send_without_block", "pop", "leave"]
        );
    }

    // =========================================================================
    // Control flow
    // =========================================================================

    #[test]
    fn test_if_else_layout() {
        let node = Node::if_else(Node::new(NodeKind::True), Node::int(1), Some(Node::int(2)));
        let program = compile_with(node, CompileOptions {
            peephole_optimization: false,
            ..CompileOptions::default()
        });
        assert_eq!(
            names(program.root()),
            vec!["putobject", "branchunless", "putobject_INT2FIX_1_", "jump", "putobject", "leave"]
        );
        assert_eq!(program.root().stack_max(), 1);
    }

    #[test]
    fn test_if_jump_to_leave_is_optimized() {
        let node = Node::if_else(Node::new(NodeKind::True), Node::int(1), Some(Node::int(2)));
        let program = compile(node);
        assert_eq!(program.root().insns().nth(3), Some(&Insn::Leave));
    }

    #[test]
    fn test_while_layout() {
        let node = Node::new(NodeKind::While {
            predicate: Box::new(Node::new(NodeKind::False)),
            body: Box::new(Node::int(1)),
        });
        let program = compile(node);
        assert_eq!(names(program.root()), vec!["jump", "putobject", "branchif", "putnil", "leave"]);
    }

    #[test]
    fn test_break_in_while_adjusts_stack() {
        let body = Node::fcall("f", vec![Node::int(1), Node::new(NodeKind::Break(Some(Box::new(Node::int(7)))))]);
        let node = Node::new(NodeKind::While {
            predicate: Box::new(Node::new(NodeKind::True)),
            body: Box::new(body),
        });
        let unoptimized = compile_with(
            node.clone(),
            CompileOptions {
                peephole_optimization: false,
                ..CompileOptions::default()
            },
        );
        let insns: Vec<_> = names(unoptimized.root());
        let setn = insns.iter().position(|n| *n == "setn").unwrap();
        assert_eq!(insns[setn + 1], "adjuststack");
        assert_eq!(insns[setn + 2], "jump");
        assert!(matches!(unoptimized.root().insns().nth(setn), Some(Insn::SetN(2))));

        // the break target is the loop's trailing `leave`, so the jump collapses into it
        let program = compile(node);
        let insns: Vec<_> = names(program.root());
        let setn = insns.iter().position(|n| *n == "setn").unwrap();
        assert_eq!(&insns[setn + 1..setn + 3], ["adjuststack", "leave"]);
    }

    #[test]
    fn test_break_outside_loop_is_error() {
        let err = compile_err(Node::new(NodeKind::Break(None)));
        assert!(matches!(err, CompileError::InvalidPosition { .. }));
    }

    #[test]
    fn test_redo_is_unhandled() {
        assert!(matches!(compile_err(Node::new(NodeKind::Redo)), CompileError::UnhandledNode { .. }));
        assert!(matches!(compile_err(Node::new(NodeKind::Retry)), CompileError::UnhandledNode { .. }));
    }

    #[test]
    fn test_case_when_uses_checkmatch() {
        let node = Node::new(NodeKind::Case {
            subject: Some(Box::new(Node::int(1))),
            whens: vec![WhenClause {
                conditions: vec![Node::int(1)],
                body: Node::sym("one"),
            }],
            else_branch: None,
        });
        let program = compile(node);
        let insns = names(program.root());
        assert_eq!(&insns[..5], &["putobject_INT2FIX_1_", "dup", "putobject_INT2FIX_1_", "checkmatch", "branchif"]);
        assert!(program.root().insns().any(|i| *i == Insn::CheckMatch(check_match::TYPE_CASE)));
    }

    #[test]
    fn test_case_in_without_else_raises() {
        let node = Node::new(NodeKind::CaseIn {
            subject: Box::new(Node::int(1)),
            clauses: vec![InClause {
                pattern: Pattern::Bind("x".to_string()),
                guard: None,
                body: Node::lvar("x"),
            }],
            else_branch: None,
        });
        let program = compile(node);
        assert!(program.root().insns().any(|i| matches!(
            i.calldata(),
            Some(cd) if cd.method == "raise"
        )));
        assert_eq!(program.root().local_table.size(), 1);
    }

    #[test]
    fn test_return_in_block_throws() {
        let node = Node::fcall("each", vec![]).with_block(Params::default(), Node::ret(Some(Node::int(1))));
        let program = compile(Node::def("m", Params::default(), node));
        let block = program.iter().find(|(_, i)| i.kind == IseqKind::Block).unwrap().1;
        assert!(block.insns().any(|i| *i == Insn::Throw(throw_tag::RETURN)));
    }

    // =========================================================================
    // Definitions and exceptions
    // =========================================================================

    #[test]
    fn test_def_pushes_name() {
        let program = compile(Node::def("f", Params::required(&["x"]), Node::lvar("x")));
        assert_eq!(names(program.root()), vec!["definemethod", "putobject", "leave"]);
        assert_eq!(program.root().insns().nth(1), Some(&Insn::PutObject(Literal::symbol("f"))));
        let method = &program[IseqId(1)];
        assert_eq!(method.kind, IseqKind::Method);
        assert_eq!(method.args.lead_num, 1);
    }

    #[test]
    fn test_optional_params_emit_prologue() {
        let params = Params {
            optional: vec![("y".to_string(), Node::int(2))],
            ..Params::required(&["x"])
        };
        let program = compile(Node::def("f", params, Node::lvar("y")));
        let method = &program[IseqId(1)];
        assert_eq!(method.args.opt.len(), 2);
        assert_eq!(names(method), vec!["putobject", "setlocal_WC_0", "getlocal_WC_0", "leave"]);
    }

    #[test]
    fn test_block_param_uses_getblockparam() {
        let params = Params {
            block: Some("blk".to_string()),
            ..Params::default()
        };
        let program = compile(Node::def("f", params, Node::lvar("blk")));
        let method = &program[IseqId(1)];
        assert_eq!(method.args.block_start, Some(0));
        assert!(matches!(method.insns().next(), Some(Insn::GetBlockParam { index: 0, level: 0 })));
    }

    #[test]
    fn test_rescue_builds_catch_entry() {
        let node = Node::new(NodeKind::Begin {
            body: Box::new(Node::fcall("f", vec![])),
            rescues: vec![RescueClause {
                exceptions: vec![],
                binding: Some("e".to_string()),
                body: Node::lvar("e"),
            }],
            else_branch: None,
            ensure: None,
        });
        let program = compile(node);
        let root = program.root();
        assert_eq!(root.catch_table.len(), 1);
        let entry = &root.catch_table[0];
        assert_eq!(entry.kind, CatchKind::Rescue);
        let handler = &program[entry.iseq.unwrap()];
        assert_eq!(handler.kind, IseqKind::Rescue);
        assert_eq!(handler.name, "rescue in <main>");
        assert_eq!(handler.local_table.names().collect::<Vec<_>>(), vec![ERRINFO]);
        // binding lives in the enclosing scope
        assert!(root.local_table.find("e").is_some());
        assert!(handler.insns().any(|i| matches!(i, Insn::SetLocalWC1(_))));
    }

    #[test]
    fn test_ensure_is_inlined_and_tabled() {
        let node = Node::new(NodeKind::Begin {
            body: Box::new(Node::int(1)),
            rescues: vec![],
            else_branch: None,
            ensure: Some(Box::new(Node::fcall("g", vec![]))),
        });
        let program = compile(node);
        let root = program.root();
        assert_eq!(root.catch_table[0].kind, CatchKind::Ensure);
        assert_eq!(
            names(root),
            vec!["putobject_INT2FIX_1_", "putself", "opt_send_without_block", "pop", "leave"]
        );
        let handler = &program[root.catch_table[0].iseq.unwrap()];
        assert_eq!(handler.last_insn(), Some(&Insn::Throw(throw_tag::NONE)));
    }

    #[test]
    fn test_class_definition() {
        let node = Node::new(NodeKind::Class {
            name: "Foo".to_string(),
            superclass: None,
            body: Box::new(Node::nil()),
        });
        let program = compile(node);
        assert_eq!(names(program.root()), vec!["putspecialobject", "putnil", "defineclass", "leave"]);
        assert_eq!(program[IseqId(1)].name, "<class:Foo>");
    }

    #[test]
    fn test_zsuper_forwards_params() {
        let body = Node::new(NodeKind::Super(None));
        let program = compile(Node::def("f", Params::required(&["a", "b"]), body));
        let method = &program[IseqId(1)];
        match method.insns().find(|i| matches!(i, Insn::InvokeSuper { .. })) {
            Some(Insn::InvokeSuper { calldata, .. }) => {
                assert_eq!(calldata.argc, 2);
                assert!(calldata.has(CallData::ZSUPER));
                assert_eq!(calldata.method, "f");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_lambda_sends_lambda_with_block() {
        let node = Node::new(NodeKind::Lambda {
            params: Params::default(),
            body: Box::new(Node::int(1)),
        });
        let program = compile(node);
        assert_eq!(names(program.root()), vec!["putspecialobject", "send", "leave"]);
        assert_eq!(program[IseqId(1)].kind, IseqKind::Lambda);
    }

    #[test]
    fn test_misplaced_block_is_error() {
        let node = Node::new(NodeKind::Block {
            params: Params::default(),
            body: Box::new(Node::nil()),
        });
        assert!(matches!(compile_err(node), CompileError::InvalidPosition { .. }));
    }
}
