use std::collections::HashMap;
use std::io::{self, Write};
use std::rc::Rc;

use log::{debug, trace};

use crate::bytecode::calldata::CallData;
use crate::bytecode::ir::{ArgumentOptions, CatchKind, InstructionSequence, IseqId, IseqKind, Program};
use crate::bytecode::op::{Insn, Label, OptOp, check_match, define_class, special_object, throw_tag};
use crate::bytecode::stack_check::check_program;
use crate::runtime::builtins::{self, Core};
use crate::runtime::class::{Class, Method, ancestors, class_var_owner, is_subclass};
use crate::runtime::frame::{Cref, Env, Frame, MethodContext, MethodOwner, Proc, ProcBody};
use crate::runtime::runtime_error::{
    RuntimeError, ThrowAction, Unwind, stack_underflow, unknown_iseq, unknown_label, unsupported,
};
use crate::runtime::value::{EXCEPTION_BACKTRACE, EXCEPTION_MESSAGE, HashTable, Object, Value};

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub max_call_depth: usize,
    pub max_steps: Option<usize>,
    pub max_stack_size: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_call_depth: 1000,
            max_steps: None,
            max_stack_size: 10_000,
        }
    }
}

/// What the dispatch loop does after one instruction.
enum DispatchState {
    Running,
    /// Push a new frame (method body, block, class body).
    Calling(Frame),
    /// `leave`: pop the frame and hand the value to the caller.
    Returning(Value),
    Failed(Unwind),
}

/// Result of resolving a call: builtins answer at once, compiled bodies
/// need a frame.
pub enum CallOutcome {
    Value(Value),
    Frame(Frame),
}

/// Catch entry with labels resolved to instruction indices.
#[derive(Debug, Clone, Copy)]
struct Catch {
    kind: CatchKind,
    iseq: Option<IseqId>,
    start: usize,
    end: usize,
    cont: usize,
    sp: usize,
}

/// Execution-ready copy of one instruction sequence.
struct Code {
    insns: Vec<Insn>,
    labels: HashMap<Label, usize>,
    catch: Vec<Catch>,
    /// Start position for each number of optional arguments supplied.
    opt_entries: Vec<usize>,
    args: ArgumentOptions,
    kind: IseqKind,
    name: String,
    file: String,
    line: usize,
    local_size: usize,
    stack_max: usize,
}

impl Code {
    fn new(iseq: &InstructionSequence) -> Result<Self, RuntimeError> {
        let labels = iseq.label_positions();
        let position = |label: Label| {
            labels
                .get(&label)
                .copied()
                .ok_or_else(|| unknown_label(label.0, &iseq.name))
        };
        let catch = iseq
            .catch_table
            .iter()
            .map(|entry| {
                Ok(Catch {
                    kind: entry.kind,
                    iseq: entry.iseq,
                    start: position(entry.start)?,
                    end: position(entry.end)?,
                    cont: position(entry.cont)?,
                    sp: entry.sp,
                })
            })
            .collect::<Result<Vec<_>, RuntimeError>>()?;
        let opt_entries = iseq
            .args
            .opt
            .iter()
            .map(|label| position(*label))
            .collect::<Result<Vec<_>, RuntimeError>>()?;
        Ok(Code {
            insns: iseq.insns().cloned().collect(),
            labels: labels.clone(),
            catch,
            opt_entries,
            args: iseq.args.clone(),
            kind: iseq.kind,
            name: iseq.name.clone(),
            file: iseq.file.clone(),
            line: iseq.location.start_line,
            local_size: iseq.local_table.size(),
            stack_max: iseq.stack_max(),
        })
    }

    fn position(&self, label: Label) -> Result<usize, RuntimeError> {
        self.labels
            .get(&label)
            .copied()
            .ok_or_else(|| unknown_label(label.0, &self.name))
    }

    fn context(&self) -> String {
        format!("{} ({}:{})", self.name, self.file, self.line)
    }
}

enum Output {
    Stdout,
    Captured(String),
}

/// Frame-based interpreter for compiled programs.
pub struct Vm {
    codes: Vec<Rc<Code>>,
    frames: Vec<Frame>,
    pub core: Core,
    main: Value,
    globals: HashMap<String, Value>,
    /// Constant caches keyed by sequence and inline storage slot.
    const_cache: HashMap<(IseqId, usize), Value>,
    config: VmConfig,
    steps: usize,
    output: Output,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        let core = builtins::bootstrap();
        let main = Value::Object(Rc::new(Object::new(Rc::clone(&core.object))));
        Self {
            codes: Vec::new(),
            frames: Vec::new(),
            core,
            main,
            globals: HashMap::new(),
            const_cache: HashMap::new(),
            config,
            steps: 0,
            output: Output::Stdout,
        }
    }

    /// Collect everything written by `puts`, `print` and `p` instead of
    /// writing it to stdout.
    pub fn capture_output(&mut self) {
        self.output = Output::Captured(String::new());
    }

    /// Output collected since the last call; empty when not capturing.
    pub fn take_output(&mut self) -> String {
        match &mut self.output {
            Output::Captured(buffer) => std::mem::take(buffer),
            Output::Stdout => String::new(),
        }
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn reset_execution_state(&mut self) {
        self.steps = 0;
        self.frames.clear();
    }

    /// Verify and execute `program` from its root sequence.
    ///
    /// Each run starts from fresh core classes and globals; sequence ids
    /// of an earlier program mean nothing to the next one.
    pub fn run(&mut self, program: &Program) -> Result<Value, RuntimeError> {
        check_program(program).map_err(|e| RuntimeError::new(&e.to_string()))?;

        self.reset_execution_state();
        self.core = builtins::bootstrap();
        self.main = Value::Object(Rc::new(Object::new(Rc::clone(&self.core.object))));
        self.globals.clear();
        self.const_cache.clear();
        self.codes = program
            .iter()
            .map(|(_, iseq)| Code::new(iseq).map(Rc::new))
            .collect::<Result<Vec<_>, RuntimeError>>()?;
        debug!("loaded {} instruction sequences", self.codes.len());

        let code = self.code(IseqId::ROOT)?;
        let env = Rc::new(Env::new(IseqId::ROOT, code.local_size, None, None));
        let cref = Cref::top(Rc::clone(&self.core.object));
        let frame = Frame::new(IseqId::ROOT, env, self.main.clone(), cref, code.stack_max);

        let result = self.run_frame(frame);
        self.frames.clear();
        match result {
            Ok(value) => Ok(value),
            Err(Unwind::Raise(exception)) => Err(self.uncaught(exception)),
            Err(Unwind::Throw { .. }) => Err(RuntimeError::new("unexpected non-local exit from the top level")),
            Err(Unwind::Fatal(error)) => Err(error),
        }
    }

    fn uncaught(&mut self, exception: Value) -> RuntimeError {
        let class = self.class_of(&exception).name.clone();
        let message = self
            .invoke(exception.clone(), "message", Vec::new(), None)
            .map(|m| m.to_s())
            .unwrap_or_else(|_| exception.to_s());
        let mut error = RuntimeError::raised(&class, &message);
        if let Value::Object(object) = &exception {
            if let Some(Value::Array(trace)) = object.get_ivar(EXCEPTION_BACKTRACE) {
                for line in trace.borrow().iter() {
                    error = error.with_context(&line.to_s());
                }
            }
        }
        error
    }

    // =========================================================================
    // Dispatch loop
    // =========================================================================

    /// Push `frame` and run until it returns.
    ///
    /// Re-entrant: builtins that yield call back into here, and a throw
    /// aimed below this activation comes back out as `Err`.
    pub fn run_frame(&mut self, frame: Frame) -> Result<Value, Unwind> {
        let base = self.frames.len();
        self.push_frame(frame)?;
        self.execute(base)
    }

    fn execute(&mut self, base: usize) -> Result<Value, Unwind> {
        loop {
            let state = self.step().unwrap_or_else(DispatchState::Failed);
            match state {
                DispatchState::Running => {}
                DispatchState::Calling(frame) => {
                    if let Err(unwind) = self.push_frame(frame) {
                        if let Some(value) = self.unwind(base, unwind)? {
                            return Ok(value);
                        }
                    }
                }
                DispatchState::Returning(value) => {
                    self.frames.pop();
                    if self.frames.len() <= base {
                        return Ok(value);
                    }
                    self.push(value)?;
                }
                DispatchState::Failed(unwind) => {
                    if let Some(value) = self.unwind(base, unwind)? {
                        return Ok(value);
                    }
                }
            }
        }
    }

    fn check_limits(&mut self) -> Result<(), RuntimeError> {
        self.steps += 1;

        if let Some(max) = self.config.max_steps {
            if self.steps > max {
                return Err(RuntimeError::limit(&format!("execution step limit exceeded ({})", max)));
            }
        }

        let depth = self.frames.last().map_or(0, |frame| frame.stack.len());
        if depth > self.config.max_stack_size {
            return Err(RuntimeError::limit(&format!(
                "stack size limit exceeded ({})",
                self.config.max_stack_size
            )));
        }

        Ok(())
    }

    fn push_frame(&mut self, frame: Frame) -> Result<(), Unwind> {
        if self.frames.len() >= self.config.max_call_depth {
            let context = self.code(frame.iseq).map(|code| code.name.clone()).unwrap_or_default();
            return Err(RuntimeError::limit(&format!(
                "call depth limit exceeded ({}) - possible infinite recursion in '{}'",
                self.config.max_call_depth, context
            ))
            .into());
        }
        self.frames.push(frame);
        Ok(())
    }

    fn step(&mut self) -> Result<DispatchState, Unwind> {
        self.check_limits()?;
        let (iseq, index) = {
            let frame = self.frame()?;
            (frame.iseq, frame.pc)
        };
        let code = self.code(iseq)?;
        let insn = code
            .insns
            .get(index)
            .ok_or_else(|| RuntimeError::new(&format!("pc {} is past the end of '{}'", index, code.name)))?;
        {
            let frame = self.top()?;
            frame.current = index;
            frame.pc = index + 1;
            frame.consumed.clear();
        }
        trace!("{}:{:04} {}", code.name, index, insn.name());
        self.exec(iseq, &code, insn)
    }

    fn exec(&mut self, iseq: IseqId, code: &Code, insn: &Insn) -> Result<DispatchState, Unwind> {
        match insn {
            Insn::AdjustStack(n) => {
                self.pop_n(*n)?;
            }
            Insn::AnyToString => {
                let string = self.pop()?;
                let value = self.pop()?;
                let result = match string {
                    Value::String(_) => string,
                    _ => Value::string(value.to_s()),
                };
                self.push(result)?;
            }
            Insn::BranchIf(label) => {
                if self.pop()?.is_truthy() {
                    self.jump(code, *label)?;
                }
            }
            Insn::BranchNil(label) => {
                if self.pop()?.is_nil() {
                    self.jump(code, *label)?;
                }
            }
            Insn::BranchUnless(label) => {
                if !self.pop()?.is_truthy() {
                    self.jump(code, *label)?;
                }
            }
            Insn::CheckMatch(flags) => {
                let pattern = self.pop()?;
                let target = self.pop()?;
                let matched = self.check_match(*flags, &target, &pattern)?;
                self.push(Value::bool(matched))?;
            }
            Insn::ConcatStrings(n) => {
                let parts = self.pop_n(*n)?;
                let joined: String = parts.iter().map(Value::to_s).collect();
                self.push(Value::string(joined))?;
            }
            Insn::DefineClass { name, iseq, flags } => {
                let superclass = self.pop()?;
                let cbase = self.pop()?;
                return self.define_class(name, *iseq, *flags, cbase, superclass);
            }
            Insn::DefineMethod { name, iseq } => {
                let cref = Rc::clone(&self.frame()?.cref);
                debug!("def {}#{}", cref.class.name, name);
                let method = Method::Iseq {
                    iseq: *iseq,
                    cref: Rc::clone(&cref),
                };
                cref.class.define_method(name, method);
            }
            Insn::DefineSMethod { name, iseq } => {
                let target = self.pop()?;
                let cref = Rc::clone(&self.frame()?.cref);
                let method = Method::Iseq { iseq: *iseq, cref };
                match &target {
                    Value::Class(class) => {
                        class.singleton_methods.borrow_mut().insert(name.clone(), method);
                    }
                    Value::Object(object) => {
                        object.singleton_methods.borrow_mut().insert(name.clone(), method);
                    }
                    other => {
                        let class = self.class_of(other).name.clone();
                        return Err(self.raise(
                            "TypeError",
                            format!("can't define singleton method \"{}\" for {}", name, class),
                        ));
                    }
                }
            }
            Insn::Dup => {
                let value = self.peek(0)?;
                self.push(value)?;
            }
            Insn::DupArray(literal) | Insn::DupHash(literal) => self.push(Value::from_literal(literal))?,
            Insn::DupN(n) => {
                let frame = self.top()?;
                let len = frame.stack.len();
                if *n > len {
                    return Err(stack_underflow("dupn").into());
                }
                let copied = frame.stack[len - n..].to_vec();
                frame.stack.extend(copied);
            }
            Insn::GetBlockParam { index, level } => {
                let value = self.get_local(*index, *level)?;
                self.push(value)?;
            }
            Insn::GetClassVariable { name, .. } => {
                let class = Rc::clone(&self.frame()?.cref.class);
                let value = class_var_owner(&class, name)
                    .and_then(|owner| owner.class_vars.borrow().get(name).cloned());
                match value {
                    Some(value) => self.push(value)?,
                    None => {
                        return Err(self.raise(
                            "NameError",
                            format!("uninitialized class variable {} in {}", name, class.name),
                        ));
                    }
                }
            }
            Insn::GetConstant(name) => {
                let _allow_nil = self.pop()?;
                let cbase = self.pop()?;
                let value = match &cbase {
                    Value::Nil => self.lookup_lexical(name)?,
                    Value::Class(class) => self.lookup_scoped(class, name)?,
                    other => return Err(self.raise("TypeError", format!("{} is not a class/module", other.inspect()))),
                };
                self.push(value)?;
            }
            Insn::GetGlobal(name) => {
                let value = self.globals.get(name).cloned().unwrap_or(Value::Nil);
                self.push(value)?;
            }
            Insn::GetInstanceVariable { name, .. } => {
                let receiver = self.frame()?.self_value.clone();
                let value = ivar_get(&receiver, name);
                self.push(value)?;
            }
            Insn::GetLocal { index, level } => {
                let value = self.get_local(*index, *level)?;
                self.push(value)?;
            }
            Insn::GetLocalWC0(index) => {
                let value = self.get_local(*index, 0)?;
                self.push(value)?;
            }
            Insn::GetLocalWC1(index) => {
                let value = self.get_local(*index, 1)?;
                self.push(value)?;
            }
            Insn::Intern => {
                let value = self.pop()?;
                let symbol = match &value {
                    Value::String(s) => Value::symbol(&s.value.borrow()),
                    Value::Symbol(_) => value.clone(),
                    other => return Err(self.raise("TypeError", format!("{} is not a string", other.inspect()))),
                };
                self.push(symbol)?;
            }
            Insn::InvokeBlock(calldata) => {
                let (args, _) = self.pop_args(calldata)?;
                let block = self.frame()?.env.root().block.clone();
                let Some(block) = block else {
                    return Err(self.raise("LocalJumpError", "no block given (yield)"));
                };
                let outcome = self.invoke_proc(&block, args, None)?;
                return self.outcome(outcome);
            }
            Insn::InvokeSuper { calldata, block } => {
                let (args, block_arg) = self.pop_args(calldata)?;
                let receiver = self.pop()?;
                let block = match (block, block_arg) {
                    (Some(iseq), _) => Some(self.capture_block(*iseq)?),
                    (None, Some(value)) => self.to_block(value)?,
                    (None, None) => self.frame()?.env.root().block.clone(),
                };
                let outcome = self.call_super(receiver, args, block)?;
                return self.outcome(outcome);
            }
            Insn::Jump(label) => self.jump(code, *label)?,
            Insn::Leave => {
                let value = self.pop()?;
                return Ok(DispatchState::Returning(value));
            }
            Insn::NewArray(n) => {
                let items = self.pop_n(*n)?;
                self.push(Value::array(items))?;
            }
            Insn::NewHash(n) => {
                let items = self.pop_n(*n)?;
                let table: HashTable = items
                    .chunks(2)
                    .map(|pair| (pair[0].clone(), pair.get(1).cloned().unwrap_or(Value::Nil)))
                    .collect();
                self.push(Value::hash(table))?;
            }
            Insn::NewRange(flag) => {
                let high = self.pop()?;
                let low = self.pop()?;
                self.push(Value::range(low, high, *flag == 1))?;
            }
            Insn::Nop => {}
            Insn::ObjToString(calldata) => {
                let value = self.pop()?;
                if matches!(value, Value::String(_)) {
                    self.push(value)?;
                } else {
                    let outcome = self.call_method(value, &calldata.method, Vec::new(), None, false)?;
                    return self.outcome(outcome);
                }
            }
            Insn::Opt(op, calldata) => {
                let args = self.pop_n(calldata.argc)?;
                let receiver = self.pop()?;
                if let Some(result) = self.fast_path(*op, &calldata.method, &receiver, &args) {
                    self.push(result)?;
                } else {
                    let outcome = self.call_method(receiver, &calldata.method, args, None, false)?;
                    return self.outcome(outcome);
                }
            }
            Insn::OptNeq { neq, .. } => {
                let args = self.pop_n(neq.argc)?;
                let receiver = self.pop()?;
                let outcome = self.call_method(receiver, &neq.method, args, None, false)?;
                return self.outcome(outcome);
            }
            Insn::OptGetConstantPath { names, cache } => {
                let value = match self.const_cache.get(&(iseq, *cache)) {
                    Some(value) => value.clone(),
                    None => {
                        let value = self.resolve_const_path(names)?;
                        self.const_cache.insert((iseq, *cache), value.clone());
                        value
                    }
                };
                self.push(value)?;
            }
            Insn::OptGetInlineCache { label, cache } => match self.const_cache.get(&(iseq, *cache)).cloned() {
                Some(value) => {
                    self.push(value)?;
                    self.jump(code, *label)?;
                }
                None => self.push(Value::Nil)?,
            },
            Insn::OptSetInlineCache(cache) => {
                let value = self.peek(0)?;
                self.const_cache.insert((iseq, *cache), value);
            }
            Insn::OptNewArrayMax(n) | Insn::OptNewArrayMin(n) => {
                let items = self.pop_n(*n)?;
                let want_max = matches!(insn, Insn::OptNewArrayMax(_));
                let result = builtins::extreme(self, &items, want_max)?;
                self.push(result)?;
            }
            Insn::OptSendWithoutBlock(calldata) => {
                let (args, block_arg) = self.pop_args(calldata)?;
                let receiver = self.pop()?;
                let block = match block_arg {
                    Some(value) => self.to_block(value)?,
                    None => None,
                };
                let outcome = self.call_method(receiver, &calldata.method, args, block, calldata.has(CallData::VCALL))?;
                return self.outcome(outcome);
            }
            Insn::OptStrFreeze { value, .. } | Insn::OptStrUMinus { value, .. } => {
                self.push(Value::frozen_string(value.as_str()))?;
            }
            Insn::Pop => {
                self.pop()?;
            }
            Insn::PutNil => self.push(Value::Nil)?,
            Insn::PutObject(literal) => self.push(Value::from_literal(literal))?,
            Insn::PutObjectInt2Fix0 => self.push(Value::Integer(0))?,
            Insn::PutObjectInt2Fix1 => self.push(Value::Integer(1))?,
            Insn::PutSelf => {
                let value = self.frame()?.self_value.clone();
                self.push(value)?;
            }
            Insn::PutSpecialObject(kind) => {
                let value = match *kind {
                    special_object::VMCORE => Value::VmCore,
                    special_object::CBASE | special_object::CONST_BASE => {
                        Value::Class(Rc::clone(&self.frame()?.cref.class))
                    }
                    other => return Err(RuntimeError::new(&format!("unknown special object {}", other)).into()),
                };
                self.push(value)?;
            }
            Insn::PutString(value) => self.push(Value::string(value.as_str()))?,
            Insn::Send { calldata, block } => {
                let (args, block_arg) = self.pop_args(calldata)?;
                let receiver = self.pop()?;
                let block = match (block, block_arg) {
                    (Some(iseq), _) => Some(self.capture_block(*iseq)?),
                    (None, Some(value)) => self.to_block(value)?,
                    (None, None) => None,
                };
                let outcome = self.call_method(receiver, &calldata.method, args, block, calldata.has(CallData::VCALL))?;
                return self.outcome(outcome);
            }
            Insn::SetClassVariable { name, .. } => {
                let value = self.pop()?;
                let class = Rc::clone(&self.frame()?.cref.class);
                let owner = class_var_owner(&class, name).unwrap_or(class);
                owner.class_vars.borrow_mut().insert(name.clone(), value);
            }
            Insn::SetConstant(name) => {
                let cbase = self.pop()?;
                let value = self.pop()?;
                match &cbase {
                    Value::Class(class) => {
                        class.set_constant(name, value);
                        self.const_cache.clear();
                    }
                    other => return Err(self.raise("TypeError", format!("{} is not a class/module", other.inspect()))),
                }
            }
            Insn::SetGlobal(name) => {
                let value = self.pop()?;
                self.globals.insert(name.clone(), value);
            }
            Insn::SetInstanceVariable { name, .. } => {
                let value = self.pop()?;
                let receiver = self.frame()?.self_value.clone();
                self.ivar_set(&receiver, name, value)?;
            }
            Insn::SetLocal { index, level } => {
                let value = self.pop()?;
                self.set_local(*index, *level, value)?;
            }
            Insn::SetLocalWC0(index) => {
                let value = self.pop()?;
                self.set_local(*index, 0, value)?;
            }
            Insn::SetLocalWC1(index) => {
                let value = self.pop()?;
                self.set_local(*index, 1, value)?;
            }
            Insn::SetN(n) => {
                let frame = self.top()?;
                let len = frame.stack.len();
                if *n >= len {
                    return Err(stack_underflow("setn").into());
                }
                let value = frame.stack[len - 1].clone();
                frame.stack[len - 1 - n] = value;
            }
            Insn::SplatArray(copy) => {
                let value = self.pop()?;
                let splatted = match value {
                    Value::Array(items) if *copy => Value::array(items.borrow().clone()),
                    Value::Array(items) => Value::Array(items),
                    Value::Nil => Value::array(Vec::new()),
                    other => Value::array(vec![other]),
                };
                self.push(splatted)?;
            }
            Insn::Swap => {
                let top = self.pop()?;
                let below = self.pop()?;
                self.push(top)?;
                self.push(below)?;
            }
            Insn::Throw(tag) => {
                let value = self.pop()?;
                return Err(self.throw(*tag, value));
            }
            Insn::TopN(n) => {
                let value = self.peek(*n)?;
                self.push(value)?;
            }
        }
        Ok(DispatchState::Running)
    }

    fn outcome(&mut self, outcome: CallOutcome) -> Result<DispatchState, Unwind> {
        match outcome {
            CallOutcome::Value(value) => {
                self.push(value)?;
                Ok(DispatchState::Running)
            }
            CallOutcome::Frame(frame) => Ok(DispatchState::Calling(frame)),
        }
    }

    // =========================================================================
    // Unwinding
    // =========================================================================

    /// Pop frames above `base` until a catch entry or the throw target
    /// takes over. `Ok(Some(value))` means the frame at `base` itself
    /// returned `value`.
    fn unwind(&mut self, base: usize, mut unwind: Unwind) -> Result<Option<Value>, Unwind> {
        loop {
            if self.frames.len() <= base {
                return Err(unwind);
            }
            if let Unwind::Fatal(mut error) = unwind {
                while self.frames.len() > base {
                    if let Some(frame) = self.frames.pop() {
                        if let Ok(code) = self.code(frame.iseq) {
                            error = error.with_context(&code.context());
                        }
                    }
                }
                return Err(Unwind::Fatal(error));
            }

            let (code, current, env) = {
                let frame = self.frame()?;
                (self.code(frame.iseq)?, frame.current, Rc::clone(&frame.env))
            };
            let target_here = matches!(&unwind, Unwind::Throw { target, .. } if Rc::ptr_eq(target, &env));
            let found = {
                let consumed = &self.frame()?.consumed;
                code.catch
                    .iter()
                    .enumerate()
                    .find(|(index, entry)| {
                        !consumed.contains(index)
                            && entry.start <= current
                            && current < entry.end
                            && catches(&unwind, target_here, entry.kind)
                    })
                    .map(|(index, entry)| (index, *entry))
            };

            if let Some((index, entry)) = found {
                trace!("{}: {:?} catch entry at {}", code.name, entry.kind, current);
                let frame = self.top()?;
                frame.consumed.push(index);
                frame.stack.truncate(entry.sp);
                frame.pc = entry.cont;
                match entry.kind {
                    CatchKind::Break => {
                        let value = match unwind {
                            Unwind::Throw { value, .. } => value,
                            _ => Value::Nil,
                        };
                        self.push(value)?;
                    }
                    CatchKind::Rescue | CatchKind::Ensure => {
                        let handler = entry
                            .iseq
                            .ok_or_else(|| RuntimeError::new(&format!("{:?} entry without a handler", entry.kind)))?;
                        let errinfo = match unwind {
                            Unwind::Raise(exception) => exception,
                            other => Value::Unwind(Rc::new(other)),
                        };
                        self.enter_handler(handler, errinfo)?;
                    }
                    other => return Err(unsupported(other.symbol()).into()),
                }
                return Ok(None);
            }

            if target_here {
                if let Unwind::Throw { action, value, .. } = unwind {
                    match action {
                        ThrowAction::CatchBreak => {
                            unwind = self.raise("LocalJumpError", "break from proc-closure");
                            continue;
                        }
                        ThrowAction::Return => {
                            self.frames.pop();
                            if self.frames.len() <= base {
                                return Ok(Some(value));
                            }
                            self.push(value)?;
                            return Ok(None);
                        }
                    }
                }
            }

            if let Unwind::Raise(Value::Object(exception)) = &unwind {
                append_backtrace(exception, &code.context());
            }
            self.frames.pop();
        }
    }

    /// Run a rescue or ensure body on top of the frame that owns it.
    fn enter_handler(&mut self, handler: IseqId, errinfo: Value) -> Result<(), Unwind> {
        let code = self.code(handler)?;
        let (parent, self_value, cref, method) = {
            let frame = self.frame()?;
            (Rc::clone(&frame.env), frame.self_value.clone(), Rc::clone(&frame.cref), frame.method.clone())
        };
        let env = Env::new(handler, code.local_size.max(1), Some(parent), None);
        env.set(0, errinfo);
        let frame = Frame::new(handler, Rc::new(env), self_value, cref, code.stack_max).with_method(method);
        self.push_frame(frame)
    }

    fn throw(&mut self, tag: u32, value: Value) -> Unwind {
        match tag {
            throw_tag::NONE => match value {
                Value::Unwind(pending) => (*pending).clone(),
                exception if self.is_exception(&exception) => Unwind::Raise(exception),
                _ => self.raise("TypeError", "exception object expected"),
            },
            throw_tag::RETURN | throw_tag::BREAK | throw_tag::NEXT => {
                let (target, action) = match self.throw_target(tag) {
                    Ok(found) => found,
                    Err(unwind) => return unwind,
                };
                if !self.frames.iter().any(|frame| Rc::ptr_eq(&frame.env, &target)) {
                    let what = match tag {
                        throw_tag::RETURN => "unexpected return",
                        throw_tag::BREAK => "break from proc-closure",
                        _ => "unexpected next",
                    };
                    return self.raise("LocalJumpError", what);
                }
                Unwind::Throw { target, action, value }
            }
            other => RuntimeError::new(&format!("unknown throw tag {}", other)).into(),
        }
    }

    /// Environment a `return`, `break` or `next` lands on. Rescue and
    /// ensure bodies are transparent.
    fn throw_target(&self, tag: u32) -> Result<(Rc<Env>, ThrowAction), Unwind> {
        let mut env = Rc::clone(&self.frame()?.env);
        loop {
            let kind = self.code(env.iseq)?.kind;
            let transparent = match kind {
                IseqKind::Rescue | IseqKind::Ensure => true,
                IseqKind::Block => tag == throw_tag::RETURN && !env.lambda,
                _ => false,
            };
            if !transparent {
                break;
            }
            env = match &env.parent {
                Some(parent) => Rc::clone(parent),
                None => return Err(self.raise("LocalJumpError", "no enclosing scope for throw")),
            };
        }
        if tag != throw_tag::BREAK || env.lambda {
            return Ok((env, ThrowAction::Return));
        }
        match &env.parent {
            Some(parent) => Ok((Rc::clone(parent), ThrowAction::CatchBreak)),
            None => Err(self.raise("LocalJumpError", "break from proc-closure")),
        }
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Resolve `name` on `receiver` and either run it (builtins) or build
    /// its frame.
    pub fn call_method(
        &mut self,
        receiver: Value,
        name: &str,
        args: Vec<Value>,
        block: Option<Rc<Proc>>,
        vcall: bool,
    ) -> Result<CallOutcome, Unwind> {
        if let Value::Proc(proc) = &receiver {
            if matches!(name, "call" | "()" | "yield" | "[]" | "===") {
                let proc = Rc::clone(proc);
                return self.invoke_proc(&proc, args, block);
            }
        }
        if let Value::VmCore = receiver {
            return self.core_method(name, args, block).map(CallOutcome::Value);
        }
        match self.find_method(&receiver, name) {
            Some((method, owner)) => self.invoke_method(receiver, name, method, owner, args, block),
            None => Err(self.no_method_error(&receiver, name, vcall)),
        }
    }

    fn call_super(&mut self, receiver: Value, args: Vec<Value>, block: Option<Rc<Proc>>) -> Result<CallOutcome, Unwind> {
        let Some(context) = self.frame()?.method.clone() else {
            return Err(self.raise("RuntimeError", "super called outside of method"));
        };
        let sources = self.method_sources(&receiver);
        let start = sources
            .iter()
            .position(|source| same_owner(source, &context.owner))
            .map_or(sources.len(), |index| index + 1);
        for source in &sources[start..] {
            if let Some(method) = self.lookup_in(&receiver, source, &context.name) {
                return self.invoke_method(receiver, &context.name, method, source.clone(), args, block);
            }
        }
        let class = self.class_of(&receiver).name.clone();
        Err(self.raise(
            "NoMethodError",
            format!("super: no superclass method '{}' for an instance of {}", context.name, class),
        ))
    }

    fn invoke_method(
        &mut self,
        receiver: Value,
        name: &str,
        method: Method,
        owner: MethodOwner,
        args: Vec<Value>,
        block: Option<Rc<Proc>>,
    ) -> Result<CallOutcome, Unwind> {
        match method {
            Method::Builtin(function) => Ok(CallOutcome::Value(function(self, &receiver, args, block)?)),
            Method::AttrReader(ivar) => {
                self.check_arity(&args, 0)?;
                Ok(CallOutcome::Value(ivar_get(&receiver, &ivar)))
            }
            Method::AttrWriter(ivar) => {
                self.check_arity(&args, 1)?;
                let value = args.into_iter().next().unwrap_or(Value::Nil);
                self.ivar_set(&receiver, &ivar, value.clone())?;
                Ok(CallOutcome::Value(value))
            }
            Method::Iseq { iseq, cref } => {
                let code = self.code(iseq)?;
                let env = Env::new(iseq, code.local_size, None, block.clone());
                let pc = self.setup_args(&code, &env, args, block.as_ref(), true)?;
                let context = MethodContext {
                    name: name.to_string(),
                    owner,
                };
                let frame = Frame::new(iseq, Rc::new(env), receiver, cref, code.stack_max)
                    .with_method(Some(Rc::new(context)))
                    .starting_at(pc);
                Ok(CallOutcome::Frame(frame))
            }
        }
    }

    /// Build the frame of a block or lambda call.
    pub fn invoke_proc(&mut self, proc: &Rc<Proc>, args: Vec<Value>, block: Option<Rc<Proc>>) -> Result<CallOutcome, Unwind> {
        match &proc.body {
            ProcBody::Symbol(name) => {
                let mut args = args.into_iter();
                let Some(receiver) = args.next() else {
                    return Err(self.raise("ArgumentError", "no receiver given"));
                };
                self.call_method(receiver, name, args.collect(), block, false)
            }
            ProcBody::Block {
                iseq,
                env,
                self_value,
                cref,
                method,
            } => {
                let code = self.code(*iseq)?;
                let mut new_env = Env::new(*iseq, code.local_size, Some(Rc::clone(env)), block.clone());
                new_env.lambda = proc.lambda;
                let pc = self.setup_args(&code, &new_env, args, block.as_ref(), proc.lambda)?;
                let frame = Frame::new(*iseq, Rc::new(new_env), self_value.clone(), Rc::clone(cref), code.stack_max)
                    .with_method(method.clone())
                    .starting_at(pc);
                Ok(CallOutcome::Frame(frame))
            }
        }
    }

    /// `Proc#arity`: the required count, negated and offset by one when
    /// optional or rest parameters make the count open-ended.
    pub fn proc_arity(&self, proc: &Proc) -> i64 {
        let ProcBody::Block { iseq, .. } = &proc.body else {
            return -2;
        };
        let Ok(code) = self.code(*iseq) else {
            return 0;
        };
        let required = code.args.required() as i64;
        if code.args.opt_num() > 0 || code.args.rest_start.is_some() {
            -(required + 1)
        } else {
            required
        }
    }

    /// Bind `args` to the parameter slots of `env`; returns the position
    /// to start at, past the defaults of supplied optionals.
    ///
    /// Strict binding (methods, lambdas) raises on arity mismatch; loose
    /// binding (blocks) splats a lone array, pads with nil and drops
    /// extras.
    fn setup_args(
        &self,
        code: &Code,
        env: &Env,
        mut args: Vec<Value>,
        block: Option<&Rc<Proc>>,
        strict: bool,
    ) -> Result<usize, Unwind> {
        let shape = &code.args;
        let required = shape.required();
        let opt = shape.opt_num();
        let has_rest = shape.rest_start.is_some();

        if strict {
            if args.len() < required || (!has_rest && args.len() > required + opt) {
                return Err(self.raise(
                    "ArgumentError",
                    format!(
                        "wrong number of arguments (given {}, expected {})",
                        args.len(),
                        arity_text(required, opt, has_rest)
                    ),
                ));
            }
        } else {
            let arity = required + opt;
            if args.len() == 1 && (arity > 1 || (has_rest && arity > 0)) {
                let spread = match &args[0] {
                    Value::Array(items) => Some(items.borrow().clone()),
                    _ => None,
                };
                if let Some(items) = spread {
                    args = items;
                }
            }
            if args.len() < required {
                args.resize(required, Value::Nil);
            }
            if !has_rest && args.len() > required + opt {
                args.truncate(required + opt);
            }
        }

        let count = args.len();
        let supplied = (count - required).min(opt);
        let lead = shape.lead_num;
        let put = |index: usize, value: Value| -> Result<(), Unwind> {
            if env.set(index, value) {
                Ok(())
            } else {
                Err(RuntimeError::new(&format!("parameter slot {} out of range in '{}'", index, code.name)).into())
            }
        };

        for (index, value) in args.iter().take(lead + supplied).enumerate() {
            put(index, value.clone())?;
        }
        if let Some(rest) = shape.rest_start {
            put(rest, Value::array(args[lead + supplied..count - shape.post_num].to_vec()))?;
        }
        if let Some(post) = shape.post_start {
            for (offset, value) in args[count - shape.post_num..].iter().enumerate() {
                put(post + offset, value.clone())?;
            }
        }
        if let Some(slot) = shape.block_start {
            put(slot, block.map_or(Value::Nil, |proc| Value::Proc(Rc::clone(proc))))?;
        }

        Ok(code.opt_entries.get(supplied).copied().unwrap_or(0))
    }

    fn check_arity(&self, args: &[Value], expected: usize) -> Result<(), Unwind> {
        if args.len() == expected {
            Ok(())
        } else {
            Err(self.raise(
                "ArgumentError",
                format!("wrong number of arguments (given {}, expected {})", args.len(), expected),
            ))
        }
    }

    /// Pop the arguments of a call site: positional values with any splat
    /// expanded, keywords gathered into a trailing hash, and the `&blk`
    /// value when present.
    fn pop_args(&mut self, calldata: &CallData) -> Result<(Vec<Value>, Option<Value>), Unwind> {
        let block_arg = if calldata.has(CallData::ARGS_BLOCKARG) {
            Some(self.pop()?)
        } else {
            None
        };
        let mut args = self.pop_n(calldata.argc)?;
        let keywords = if calldata.has(CallData::KWARG) && !calldata.kw_arg.is_empty() {
            let values = args.split_off(args.len().saturating_sub(calldata.kw_arg.len()));
            let table: HashTable = calldata
                .kw_arg
                .iter()
                .zip(values)
                .map(|(key, value)| (Value::symbol(key), value))
                .collect();
            Some(table)
        } else {
            None
        };
        if calldata.has(CallData::ARGS_SPLAT) {
            match args.pop() {
                Some(Value::Array(items)) => args.extend(items.borrow().iter().cloned()),
                Some(Value::Nil) | None => {}
                Some(other) => args.push(other),
            }
        }
        if let Some(table) = keywords {
            args.push(Value::hash(table));
        }
        Ok((args, block_arg))
    }

    fn capture_block(&self, iseq: IseqId) -> Result<Rc<Proc>, Unwind> {
        let lambda = self.code(iseq)?.kind == IseqKind::Lambda;
        let frame = self.frame()?;
        Ok(Rc::new(Proc {
            body: ProcBody::Block {
                iseq,
                env: Rc::clone(&frame.env),
                self_value: frame.self_value.clone(),
                cref: Rc::clone(&frame.cref),
                method: frame.method.clone(),
            },
            lambda,
        }))
    }

    /// `&value` at a call site.
    fn to_block(&self, value: Value) -> Result<Option<Rc<Proc>>, Unwind> {
        match value {
            Value::Nil => Ok(None),
            Value::Proc(proc) => Ok(Some(proc)),
            Value::Symbol(name) => Ok(Some(Rc::new(Proc {
                body: ProcBody::Symbol(name.to_string()),
                lambda: true,
            }))),
            other => {
                let class = self.class_of(&other).name.clone();
                Err(self.raise("TypeError", format!("wrong argument type {} (expected Proc)", class)))
            }
        }
    }

    /// Methods of the internal receiver pushed by `putspecialobject VMCORE`.
    fn core_method(&mut self, name: &str, args: Vec<Value>, block: Option<Rc<Proc>>) -> Result<Value, Unwind> {
        match name {
            "core#set_method_alias" => {
                let [cbase, new_name, old_name] = <[Value; 3]>::try_from(args)
                    .map_err(|_| RuntimeError::new("core#set_method_alias takes 3 arguments"))?;
                let Value::Class(class) = cbase else {
                    return Err(self.raise("TypeError", "alias target is not a class"));
                };
                let (Some(new_name), Some(old_name)) = (new_name.as_name(), old_name.as_name()) else {
                    return Err(self.raise("TypeError", "alias names must be symbols"));
                };
                self.alias_method(&class, &new_name, &old_name)?;
                Ok(Value::Nil)
            }
            "lambda" => match block {
                Some(proc) if proc.lambda => Ok(Value::Proc(proc)),
                Some(proc) => Ok(Value::Proc(Rc::new(proc.to_lambda()))),
                None => Err(self.raise("ArgumentError", "tried to create Proc object without a block")),
            },
            other => Err(unsupported(other).into()),
        }
    }

    pub fn alias_method(&mut self, class: &Rc<Class>, new_name: &str, old_name: &str) -> Result<(), Unwind> {
        let method = ancestors(class).iter().find_map(|ancestor| {
            ancestor.own_method(old_name).or_else(|| {
                if ancestor.builtin {
                    builtins::lookup(&ancestor.name, old_name).map(Method::Builtin)
                } else {
                    None
                }
            })
        });
        match method {
            Some(method) => {
                class.define_method(new_name, method);
                Ok(())
            }
            None => Err(self.raise(
                "NameError",
                format!("undefined method '{}' for class '{}'", old_name, class.name),
            )),
        }
    }

    /// Where methods of `receiver` are looked up, in order.
    fn method_sources(&self, receiver: &Value) -> Vec<MethodOwner> {
        match receiver {
            Value::Object(object) => std::iter::once(MethodOwner::Object)
                .chain(ancestors(&object.class).into_iter().map(MethodOwner::Instance))
                .collect(),
            Value::Class(class) => {
                let mut sources = Vec::new();
                let mut current = Some(Rc::clone(class));
                while let Some(class) = current {
                    sources.push(MethodOwner::Singleton(Rc::clone(&class)));
                    current = class.superclass.clone();
                }
                let meta = if class.is_module { &self.core.module } else { &self.core.class };
                sources.extend(ancestors(meta).into_iter().map(MethodOwner::Instance));
                sources
            }
            other => ancestors(&self.class_of(other))
                .into_iter()
                .map(MethodOwner::Instance)
                .collect(),
        }
    }

    fn lookup_in(&self, receiver: &Value, source: &MethodOwner, name: &str) -> Option<Method> {
        match source {
            MethodOwner::Object => match receiver {
                Value::Object(object) => object.singleton_methods.borrow().get(name).cloned(),
                _ => None,
            },
            MethodOwner::Singleton(class) => class.singleton_methods.borrow().get(name).cloned(),
            MethodOwner::Instance(class) => class.own_method(name).or_else(|| {
                if class.builtin {
                    builtins::lookup(&class.name, name).map(Method::Builtin)
                } else {
                    None
                }
            }),
        }
    }

    fn find_method(&self, receiver: &Value, name: &str) -> Option<(Method, MethodOwner)> {
        self.method_sources(receiver)
            .into_iter()
            .find_map(|source| self.lookup_in(receiver, &source, name).map(|method| (method, source)))
    }

    pub fn respond_to(&self, receiver: &Value, name: &str) -> bool {
        (matches!(receiver, Value::Proc(_)) && name == "call") || self.find_method(receiver, name).is_some()
    }

    fn no_method_error(&self, receiver: &Value, name: &str, vcall: bool) -> Unwind {
        let described = self.describe(receiver);
        if vcall {
            self.raise(
                "NameError",
                format!("undefined local variable or method '{}' for {}", name, described),
            )
        } else {
            self.raise("NoMethodError", format!("undefined method '{}' for {}", name, described))
        }
    }

    fn describe(&self, receiver: &Value) -> String {
        match receiver {
            Value::Nil => "nil".to_string(),
            Value::True => "true".to_string(),
            Value::False => "false".to_string(),
            Value::Class(class) if class.is_module => format!("module {}", class.name),
            Value::Class(class) => format!("class {}", class.name),
            value if value.identical(&self.main) => "main:Object".to_string(),
            other => format!("an instance of {}", self.class_of(other).name),
        }
    }

    // =========================================================================
    // Helpers for builtins
    // =========================================================================

    /// Call a method and run it to completion.
    pub fn invoke(&mut self, receiver: Value, name: &str, args: Vec<Value>, block: Option<Rc<Proc>>) -> Result<Value, Unwind> {
        match self.call_method(receiver, name, args, block, false)? {
            CallOutcome::Value(value) => Ok(value),
            CallOutcome::Frame(frame) => self.run_frame(frame),
        }
    }

    /// Call a block and run it to completion.
    pub fn yield_block(&mut self, block: &Rc<Proc>, args: Vec<Value>) -> Result<Value, Unwind> {
        match self.invoke_proc(block, args, None)? {
            CallOutcome::Value(value) => Ok(value),
            CallOutcome::Frame(frame) => self.run_frame(frame),
        }
    }

    /// Block passed to the innermost method activation.
    pub fn current_block(&self) -> Option<Rc<Proc>> {
        self.frames.last().and_then(|frame| frame.env.root().block.clone())
    }

    /// Exception being handled by the innermost rescue body, for bare `raise`.
    pub fn current_exception(&self) -> Option<Value> {
        self.frames.iter().rev().find_map(|frame| {
            let kind = self.code(frame.iseq).ok()?.kind;
            match kind {
                IseqKind::Rescue => frame.env.get(0).filter(|value| self.is_exception(value)),
                _ => None,
            }
        })
    }

    pub fn main_object(&self) -> Value {
        self.main.clone()
    }

    pub fn class_of(&self, value: &Value) -> Rc<Class> {
        let core = &self.core;
        let class = match value {
            Value::Nil => &core.nil_class,
            Value::True => &core.true_class,
            Value::False => &core.false_class,
            Value::Integer(_) => &core.integer,
            Value::Float(_) => &core.float,
            Value::String(_) => &core.string,
            Value::Symbol(_) => &core.symbol,
            Value::Array(_) => &core.array,
            Value::Hash(_) => &core.hash,
            Value::Range(_) => &core.range,
            Value::Proc(_) => &core.proc_class,
            Value::Class(class) if class.is_module => &core.module,
            Value::Class(_) => &core.class,
            Value::Object(object) => &object.class,
            Value::VmCore | Value::Unwind(_) => &core.object,
        };
        Rc::clone(class)
    }

    pub fn is_a(&self, value: &Value, class: &Rc<Class>) -> bool {
        is_subclass(&self.class_of(value), class)
    }

    pub fn is_exception(&self, value: &Value) -> bool {
        matches!(value, Value::Object(_)) && self.is_a(value, &self.core.exception)
    }

    /// Core exception class by name, falling back to `StandardError`.
    pub fn exception_class(&self, name: &str) -> Rc<Class> {
        match self.core.object.get_constant(name) {
            Some(Value::Class(class)) => class,
            _ => Rc::clone(&self.core.standard_error),
        }
    }

    pub fn new_exception(&self, class: &Rc<Class>, message: Value) -> Value {
        let object = Object::new(Rc::clone(class));
        object.set_ivar(EXCEPTION_MESSAGE, message);
        Value::Object(Rc::new(object))
    }

    /// Language-level exception of class `class`.
    pub fn raise(&self, class: &str, message: impl Into<String>) -> Unwind {
        let class = self.exception_class(class);
        Unwind::Raise(self.new_exception(&class, Value::string(message.into())))
    }

    /// `to_s` through method dispatch, so user classes can override it.
    pub fn stringify(&mut self, value: &Value) -> Result<String, Unwind> {
        match value {
            Value::Object(_) | Value::Class(_) => {
                let result = self.invoke(value.clone(), "to_s", Vec::new(), None)?;
                Ok(match result {
                    Value::String(s) => s.value.borrow().clone(),
                    other => other.to_s(),
                })
            }
            Value::Array(_) | Value::Hash(_) => self.inspect(value),
            other => Ok(other.to_s()),
        }
    }

    /// `inspect` through method dispatch, recursing into containers.
    pub fn inspect(&mut self, value: &Value) -> Result<String, Unwind> {
        match value {
            Value::Array(items) => {
                let items = items.borrow().clone();
                let mut parts = Vec::with_capacity(items.len());
                for item in &items {
                    parts.push(self.inspect(item)?);
                }
                Ok(format!("[{}]", parts.join(", ")))
            }
            Value::Hash(table) => {
                let pairs: Vec<(Value, Value)> = table.borrow().iter().cloned().collect();
                if pairs.is_empty() {
                    return Ok("{}".to_string());
                }
                let mut parts = Vec::with_capacity(pairs.len());
                for (key, value) in &pairs {
                    parts.push(format!("{}=>{}", self.inspect(key)?, self.inspect(value)?));
                }
                Ok(format!("{{{}}}", parts.join(", ")))
            }
            Value::Object(_) => {
                if value.identical(&self.main) {
                    return Ok("main".to_string());
                }
                let result = self.invoke(value.clone(), "inspect", Vec::new(), None)?;
                Ok(result.to_s())
            }
            other => Ok(other.inspect()),
        }
    }

    pub fn write_output(&mut self, text: &str) -> Result<(), Unwind> {
        match &mut self.output {
            Output::Captured(buffer) => buffer.push_str(text),
            Output::Stdout => {
                let mut stdout = io::stdout().lock();
                stdout
                    .write_all(text.as_bytes())
                    .and_then(|_| stdout.flush())
                    .map_err(|e| RuntimeError::new(&format!("write failed: {}", e)))?;
            }
        }
        Ok(())
    }

    pub fn ivar_set(&self, receiver: &Value, name: &str, value: Value) -> Result<(), Unwind> {
        match receiver {
            Value::Object(object) => {
                object.set_ivar(name, value);
                Ok(())
            }
            Value::Class(class) => {
                class.ivars.borrow_mut().insert(name.to_string(), value);
                Ok(())
            }
            other => {
                let class = self.class_of(other).name.clone();
                Err(self.raise("FrozenError", format!("can't modify frozen {}", class)))
            }
        }
    }

    // =========================================================================
    // Classes and constants
    // =========================================================================

    fn define_class(
        &mut self,
        name: &str,
        iseq: IseqId,
        flags: u32,
        cbase: Value,
        superclass: Value,
    ) -> Result<DispatchState, Unwind> {
        let Value::Class(cbase) = cbase else {
            return Err(self.raise("TypeError", format!("{} is not a class/module", cbase.inspect())));
        };
        let kind = flags & 0x7;
        if kind == define_class::TYPE_SINGLETON_CLASS {
            return Err(unsupported("defineclass (singleton class)").into());
        }
        let is_module = kind == define_class::TYPE_MODULE;
        let superclass = if flags & define_class::FLAG_HAS_SUPERCLASS != 0 {
            match superclass {
                Value::Class(class) if !class.is_module => Some(class),
                other => {
                    return Err(self.raise(
                        "TypeError",
                        format!("superclass must be an instance of Class (given {})", other.inspect()),
                    ));
                }
            }
        } else {
            None
        };

        let class = match cbase.get_constant(name) {
            Some(Value::Class(existing)) => {
                if existing.is_module != is_module {
                    let expected = if is_module { "module" } else { "class" };
                    return Err(self.raise("TypeError", format!("{} is not a {}", name, expected)));
                }
                if let Some(superclass) = &superclass {
                    let same = existing
                        .superclass
                        .as_ref()
                        .is_some_and(|current| Rc::ptr_eq(current, superclass));
                    if !same {
                        return Err(self.raise("TypeError", format!("superclass mismatch for class {}", name)));
                    }
                }
                existing
            }
            Some(other) => {
                return Err(self.raise("TypeError", format!("{} is not a class ({})", name, other.inspect())));
            }
            None => {
                let full_name = if Rc::ptr_eq(&cbase, &self.core.object) {
                    name.to_string()
                } else {
                    format!("{}::{}", cbase.name, name)
                };
                let class = if is_module {
                    Class::module(full_name)
                } else {
                    Class::new(full_name, Some(superclass.unwrap_or_else(|| Rc::clone(&self.core.object))))
                };
                let class = Rc::new(class);
                debug!("new {} {}", if is_module { "module" } else { "class" }, class.name);
                cbase.set_constant(name, Value::Class(Rc::clone(&class)));
                self.const_cache.clear();
                class
            }
        };

        let code = self.code(iseq)?;
        let env = Rc::new(Env::new(iseq, code.local_size, None, None));
        let cref = Cref::nested(Rc::clone(&class), &self.frame()?.cref);
        Ok(DispatchState::Calling(Frame::new(
            iseq,
            env,
            Value::Class(class),
            cref,
            code.stack_max,
        )))
    }

    /// Unscoped constant: lexical scopes (innermost first, excluding the
    /// top level), then ancestors of the innermost class, then `Object`.
    fn lookup_lexical(&self, name: &str) -> Result<Value, Unwind> {
        let cref = Rc::clone(&self.frame()?.cref);
        let mut scope = Some(&cref);
        while let Some(current) = scope {
            if current.parent.is_none() {
                break;
            }
            if let Some(value) = current.class.get_constant(name) {
                return Ok(value);
            }
            scope = current.parent.as_ref();
        }
        for class in ancestors(&cref.class) {
            if let Some(value) = class.get_constant(name) {
                return Ok(value);
            }
        }
        self.core
            .object
            .get_constant(name)
            .ok_or_else(|| self.raise("NameError", format!("uninitialized constant {}", name)))
    }

    fn lookup_scoped(&self, class: &Rc<Class>, name: &str) -> Result<Value, Unwind> {
        ancestors(class)
            .iter()
            .find_map(|ancestor| ancestor.get_constant(name))
            .ok_or_else(|| self.raise("NameError", format!("uninitialized constant {}::{}", class.name, name)))
    }

    /// `A::B::C`; a leading empty segment starts at the top level.
    fn resolve_const_path(&self, names: &[String]) -> Result<Value, Unwind> {
        let mut segments = names.iter();
        let mut value = match segments.next() {
            Some(first) if first.is_empty() => Value::Class(Rc::clone(&self.core.object)),
            Some(first) => self.lookup_lexical(first)?,
            None => return Err(RuntimeError::new("empty constant path").into()),
        };
        for name in segments {
            let Value::Class(class) = &value else {
                return Err(self.raise("TypeError", format!("{} is not a class/module", value.inspect())));
            };
            value = self.lookup_scoped(class, name)?;
        }
        Ok(value)
    }

    fn check_match(&mut self, flags: u32, target: &Value, pattern: &Value) -> Result<bool, Unwind> {
        let kind = flags & !check_match::ARRAY;
        let patterns = if flags & check_match::ARRAY != 0 {
            match pattern {
                Value::Array(items) => items.borrow().clone(),
                other => vec![other.clone()],
            }
        } else {
            vec![pattern.clone()]
        };
        for pattern in patterns {
            let matched = match kind {
                check_match::TYPE_WHEN => pattern.is_truthy(),
                check_match::TYPE_RESCUE => match &pattern {
                    Value::Class(class) => self.is_a(target, class),
                    _ => return Err(self.raise("TypeError", "class or module required for rescue clause")),
                },
                _ => self.invoke(pattern, "===", vec![target.clone()], None)?.is_truthy(),
            };
            if matched {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Integer arithmetic and comparison without dispatch, unless the
    /// method was redefined on `Integer`.
    fn fast_path(&self, op: OptOp, method: &str, receiver: &Value, args: &[Value]) -> Option<Value> {
        let (Value::Integer(a), [Value::Integer(b)]) = (receiver, args) else {
            return None;
        };
        if self.core.integer.methods.borrow().contains_key(method) {
            return None;
        }
        match op {
            OptOp::Plus => a.checked_add(*b).map(Value::Integer),
            OptOp::Minus => a.checked_sub(*b).map(Value::Integer),
            OptOp::Mult => a.checked_mul(*b).map(Value::Integer),
            OptOp::Lt => Some(Value::bool(a < b)),
            OptOp::Le => Some(Value::bool(a <= b)),
            OptOp::Gt => Some(Value::bool(a > b)),
            OptOp::Ge => Some(Value::bool(a >= b)),
            OptOp::Eq => Some(Value::bool(a == b)),
            _ => None,
        }
    }

    // =========================================================================
    // Frame and stack access
    // =========================================================================

    fn code(&self, id: IseqId) -> Result<Rc<Code>, RuntimeError> {
        self.codes.get(id.0).cloned().ok_or_else(|| unknown_iseq(id.0))
    }

    fn frame(&self) -> Result<&Frame, Unwind> {
        self.frames
            .last()
            .ok_or_else(|| RuntimeError::new("no active frame").into())
    }

    fn top(&mut self) -> Result<&mut Frame, Unwind> {
        self.frames
            .last_mut()
            .ok_or_else(|| RuntimeError::new("no active frame").into())
    }

    fn push(&mut self, value: Value) -> Result<(), Unwind> {
        self.top()?.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, Unwind> {
        self.top()?
            .stack
            .pop()
            .ok_or_else(|| stack_underflow("pop").into())
    }

    /// Pop `n` values, oldest first.
    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, Unwind> {
        let stack = &mut self.top()?.stack;
        if stack.len() < n {
            return Err(stack_underflow("popn").into());
        }
        Ok(stack.split_off(stack.len() - n))
    }

    fn peek(&self, depth: usize) -> Result<Value, Unwind> {
        let stack = &self.frame()?.stack;
        stack
            .len()
            .checked_sub(depth + 1)
            .and_then(|index| stack.get(index))
            .cloned()
            .ok_or_else(|| stack_underflow("topn").into())
    }

    fn jump(&mut self, code: &Code, label: Label) -> Result<(), Unwind> {
        let target = code.position(label)?;
        self.top()?.pc = target;
        Ok(())
    }

    fn get_local(&self, index: usize, level: usize) -> Result<Value, Unwind> {
        self.frame()?
            .env
            .ancestor(level)
            .and_then(|env| env.get(index))
            .ok_or_else(|| RuntimeError::new(&format!("no local {} at level {}", index, level)).into())
    }

    fn set_local(&self, index: usize, level: usize, value: Value) -> Result<(), Unwind> {
        let stored = self
            .frame()?
            .env
            .ancestor(level)
            .is_some_and(|env| env.set(index, value));
        if stored {
            Ok(())
        } else {
            Err(RuntimeError::new(&format!("no local {} at level {}", index, level)).into())
        }
    }
}

/// Does a catch entry of `kind` handle `unwind` in the frame under scan?
fn catches(unwind: &Unwind, target_here: bool, kind: CatchKind) -> bool {
    match unwind {
        Unwind::Raise(_) => matches!(kind, CatchKind::Rescue | CatchKind::Ensure),
        Unwind::Throw {
            action: ThrowAction::CatchBreak,
            ..
        } if target_here => matches!(kind, CatchKind::Break | CatchKind::Ensure),
        Unwind::Throw { .. } => kind == CatchKind::Ensure,
        Unwind::Fatal(_) => false,
    }
}

fn same_owner(a: &MethodOwner, b: &MethodOwner) -> bool {
    match (a, b) {
        (MethodOwner::Object, MethodOwner::Object) => true,
        (MethodOwner::Instance(a), MethodOwner::Instance(b)) => Rc::ptr_eq(a, b),
        (MethodOwner::Singleton(a), MethodOwner::Singleton(b)) => Rc::ptr_eq(a, b),
        _ => false,
    }
}

fn arity_text(required: usize, opt: usize, rest: bool) -> String {
    if rest {
        format!("{}+", required)
    } else if opt > 0 {
        format!("{}..{}", required, required + opt)
    } else {
        required.to_string()
    }
}

fn ivar_get(receiver: &Value, name: &str) -> Value {
    match receiver {
        Value::Object(object) => object.get_ivar(name),
        Value::Class(class) => class.ivars.borrow().get(name).cloned(),
        _ => None,
    }
    .unwrap_or(Value::Nil)
}

fn append_backtrace(exception: &Object, line: &str) {
    match exception.get_ivar(EXCEPTION_BACKTRACE) {
        Some(Value::Array(trace)) => trace.borrow_mut().push(Value::string(line)),
        _ => exception.set_ivar(EXCEPTION_BACKTRACE, Value::array(vec![Value::string(line)])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::CompileOptions;
    use crate::lang::node::{Node, NodeKind, Params, RescueClause};
    use crate::runtime::runtime_error::RuntimeErrorKind;
    use crate::{compile, compile_with_options};

    // ============================================================
    // Test Helpers
    // ============================================================

    /// Compile a tree with default options and run it on a fresh VM
    fn run_node(node: Node) -> Result<Value, RuntimeError> {
        let program = compile(&node).expect("compilation should succeed");
        Vm::new().run(&program)
    }

    /// Run with custom config
    fn run_node_with_config(node: Node, config: VmConfig) -> Result<Value, RuntimeError> {
        let program = compile(&node).expect("compilation should succeed");
        Vm::with_config(config).run(&program)
    }

    /// Assert the program evaluates to the expected value
    fn assert_result(node: Node, expected: Value) {
        let value = run_node(node).expect("execution should succeed");
        assert_eq!(value, expected, "result mismatch");
    }

    /// Assert execution produces an error containing the given substring
    fn assert_error(node: Node, error_contains: &str) {
        match run_node(node) {
            Ok(value) => panic!("expected error containing '{}', got {:?}", error_contains, value),
            Err(e) => assert!(
                e.to_string().contains(error_contains),
                "expected error containing '{}', got '{}'",
                error_contains,
                e
            ),
        }
    }

    fn program(statements: Vec<Node>) -> Node {
        Node::program(statements)
    }

    fn op_assign(target: Node, operator: &str, value: Node) -> Node {
        Node::new(NodeKind::OpAssign {
            target: Box::new(target),
            operator: operator.to_string(),
            value: Box::new(value),
        })
    }

    fn array(items: Vec<Node>) -> Node {
        Node::new(NodeKind::Array(items))
    }

    fn while_loop(predicate: Node, body: Node) -> Node {
        Node::new(NodeKind::While {
            predicate: Box::new(predicate),
            body: Box::new(body),
        })
    }

    fn begin_rescue(body: Node, exception: &str, binding: Option<&str>, handler: Node) -> Node {
        Node::new(NodeKind::Begin {
            body: Box::new(body),
            rescues: vec![RescueClause {
                exceptions: vec![Node::constant(exception)],
                binding: binding.map(str::to_string),
                body: handler,
            }],
            else_branch: None,
            ensure: None,
        })
    }

    // ============================================================
    // Arithmetic and literals
    // ============================================================

    #[test]
    fn arithmetic_precedence_from_tree() {
        let node = program(vec![Node::binary(
            Node::int(2),
            "+",
            Node::binary(Node::int(3), "*", Node::int(4)),
        )]);
        assert_result(node, Value::Integer(14));
    }

    #[test]
    fn empty_program_is_nil() {
        assert_result(program(vec![]), Value::Nil);
    }

    #[test]
    fn string_concatenation() {
        let node = program(vec![Node::binary(Node::str("foo"), "+", Node::str("bar"))]);
        assert_result(node, Value::string("foobar"));
    }

    #[test]
    fn array_literal_with_dynamic_items() {
        let node = program(vec![
            Node::lasgn("x", Node::int(2)),
            array(vec![Node::int(1), Node::lvar("x")]),
        ]);
        assert_result(node, Value::array(vec![Value::Integer(1), Value::Integer(2)]));
    }

    #[test]
    fn comparison_and_negated_equality() {
        assert_result(
            program(vec![Node::binary(Node::int(1), "<", Node::int(2))]),
            Value::True,
        );
        assert_result(
            program(vec![Node::binary(Node::int(1), "!=", Node::int(1))]),
            Value::False,
        );
    }

    #[test]
    fn specialized_and_plain_programs_agree() {
        let build = || {
            program(vec![
                Node::lasgn("xs", array(vec![Node::int(5), Node::int(7)])),
                Node::binary(
                    Node::call(Some(Node::lvar("xs")), "[]", vec![Node::int(1)]),
                    "-",
                    Node::call(Some(Node::lvar("xs")), "size", vec![]),
                ),
            ])
        };
        let specialized = compile(&build()).expect("compile");
        let plain = compile_with_options(&build(), CompileOptions::plain()).expect("compile");
        let a = Vm::new().run(&specialized).expect("run");
        let b = Vm::new().run(&plain).expect("run");
        assert_eq!(a, Value::Integer(5));
        assert_eq!(a, b);
    }

    // ============================================================
    // Methods and blocks
    // ============================================================

    #[test]
    fn define_and_call_method() {
        let body = Node::binary(Node::lvar("x"), "+", Node::int(1));
        let node = program(vec![
            Node::def("f", Params::required(&["x"]), body),
            Node::fcall("f", vec![Node::int(5)]),
        ]);
        assert_result(node, Value::Integer(6));
    }

    #[test]
    fn early_return_from_method() {
        let body = Node::statements(vec![
            Node::if_else(Node::lvar("x"), Node::ret(Some(Node::int(1))), None),
            Node::int(2),
        ]);
        let node = program(vec![
            Node::def("pick", Params::required(&["x"]), body),
            Node::binary(
                Node::fcall("pick", vec![Node::new(NodeKind::True)]),
                "+",
                Node::fcall("pick", vec![Node::new(NodeKind::False)]),
            ),
        ]);
        assert_result(node, Value::Integer(3));
    }

    #[test]
    fn block_writes_enclosing_local() {
        let each = Node::call(Some(array(vec![Node::int(1), Node::int(2), Node::int(3)])), "each", vec![])
            .with_block(Params::required(&["i"]), op_assign(Node::lvar("total"), "+", Node::lvar("i")));
        let node = program(vec![Node::lasgn("total", Node::int(0)), each, Node::lvar("total")]);
        assert_result(node, Value::Integer(6));
    }

    #[test]
    fn yield_to_block() {
        let twice = Node::def(
            "twice",
            Params::default(),
            Node::binary(
                Node::new(NodeKind::Yield(vec![Node::int(1)])),
                "+",
                Node::new(NodeKind::Yield(vec![Node::int(2)])),
            ),
        );
        let call = Node::fcall("twice", vec![])
            .with_block(Params::required(&["n"]), Node::binary(Node::lvar("n"), "*", Node::int(10)));
        assert_result(program(vec![twice, call]), Value::Integer(30));
    }

    #[test]
    fn class_with_instance_variables() {
        let initialize = Node::def(
            "initialize",
            Params::default(),
            Node::new(NodeKind::InstanceAssign {
                name: "@n".to_string(),
                value: Box::new(Node::int(0)),
            }),
        );
        let incr = Node::def("incr", Params::default(), op_assign(Node::ivar("@n"), "+", Node::int(1)));
        let class = Node::new(NodeKind::Class {
            name: "Counter".to_string(),
            superclass: None,
            body: Box::new(Node::statements(vec![initialize, incr])),
        });
        let node = program(vec![
            class,
            Node::lasgn("c", Node::call(Some(Node::constant("Counter")), "new", vec![])),
            Node::call(Some(Node::lvar("c")), "incr", vec![]),
            Node::call(Some(Node::lvar("c")), "incr", vec![]),
        ]);
        assert_result(node, Value::Integer(2));
    }

    // ============================================================
    // Control flow
    // ============================================================

    #[test]
    fn while_loop_counts() {
        let node = program(vec![
            Node::lasgn("i", Node::int(0)),
            while_loop(
                Node::binary(Node::lvar("i"), "<", Node::int(10)),
                op_assign(Node::lvar("i"), "+", Node::int(1)),
            ),
            Node::lvar("i"),
        ]);
        assert_result(node, Value::Integer(10));
    }

    #[test]
    fn while_loop_value_is_nil() {
        let node = program(vec![while_loop(Node::new(NodeKind::False), Node::int(1))]);
        assert_result(node, Value::Nil);
    }

    #[test]
    fn break_inside_call_arguments_leaves_loop() {
        let build = || {
            let body = Node::fcall("f", vec![Node::int(1), Node::new(NodeKind::Break(Some(Box::new(Node::int(7)))))]);
            program(vec![
                Node::lasgn("x", while_loop(Node::new(NodeKind::True), body)),
                Node::lvar("x"),
            ])
        };
        assert_result(build(), Value::Integer(7));
        let plain = compile_with_options(&build(), CompileOptions::plain()).expect("compile");
        assert_eq!(Vm::new().run(&plain).expect("run"), Value::Integer(7));
    }

    #[test]
    fn rescue_binds_exception() {
        let raise = Node::fcall("raise", vec![Node::constant("ArgumentError"), Node::str("bad")]);
        let handler = Node::call(Some(Node::lvar("e")), "message", vec![]);
        let node = program(vec![begin_rescue(raise, "ArgumentError", Some("e"), handler)]);
        assert_result(node, Value::string("bad"));
    }

    #[test]
    fn rescue_catches_builtin_errors() {
        let divide = Node::binary(Node::int(1), "/", Node::int(0));
        let node = program(vec![begin_rescue(divide, "ZeroDivisionError", None, Node::sym("caught"))]);
        assert_result(node, Value::symbol("caught"));
    }

    #[test]
    fn ensure_runs_on_normal_exit() {
        let node = program(vec![
            Node::lasgn("log", Node::int(0)),
            Node::new(NodeKind::Begin {
                body: Box::new(Node::int(1)),
                rescues: vec![],
                else_branch: None,
                ensure: Some(Box::new(Node::lasgn("log", Node::int(7)))),
            }),
            Node::lvar("log"),
        ]);
        assert_result(node, Value::Integer(7));
    }

    // ============================================================
    // Output
    // ============================================================

    #[test]
    fn puts_is_captured() {
        let node = program(vec![Node::fcall("puts", vec![Node::int(42)])]);
        let compiled = compile(&node).expect("compile");
        let mut vm = Vm::new();
        vm.capture_output();
        let value = vm.run(&compiled).expect("run");
        assert_eq!(value, Value::Nil);
        assert_eq!(vm.take_output(), "42\n");
    }

    // ============================================================
    // Errors
    // ============================================================

    #[test]
    fn error_missing_method() {
        assert_error(
            program(vec![Node::call(Some(Node::int(1)), "frobnicate", vec![])]),
            "undefined method 'frobnicate'",
        );
    }

    #[test]
    fn error_uncaught_exception_reports_class() {
        let node = program(vec![Node::fcall(
            "raise",
            vec![Node::constant("ArgumentError"), Node::str("nope")],
        )]);
        let error = run_node(node).expect_err("should raise");
        assert_eq!(error.exception_class(), Some("ArgumentError"));
        assert!(error.message.contains("nope"));
    }

    #[test]
    fn error_division_by_zero() {
        assert_error(program(vec![Node::binary(Node::int(1), "/", Node::int(0))]), "divided by 0");
    }

    #[test]
    fn error_step_limit() {
        let node = program(vec![while_loop(Node::new(NodeKind::True), Node::nil())]);
        let config = VmConfig {
            max_steps: Some(1_000),
            ..VmConfig::default()
        };
        let error = run_node_with_config(node, config).expect_err("should hit the limit");
        assert_eq!(error.kind, RuntimeErrorKind::Limit);
        assert!(error.message.contains("step limit"));
    }

    #[test]
    fn error_call_depth_limit() {
        let body = Node::fcall("down", vec![Node::binary(Node::lvar("n"), "+", Node::int(1))]);
        let node = program(vec![
            Node::def("down", Params::required(&["n"]), body),
            Node::fcall("down", vec![Node::int(0)]),
        ]);
        let config = VmConfig {
            max_call_depth: 50,
            ..VmConfig::default()
        };
        let error = run_node_with_config(node, config).expect_err("should hit the limit");
        assert_eq!(error.kind, RuntimeErrorKind::Limit);
        assert!(error.message.contains("call depth"));
    }
}
