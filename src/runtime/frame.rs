use std::cell::RefCell;
use std::rc::Rc;

use crate::bytecode::ir::IseqId;
use crate::runtime::class::Class;
use crate::runtime::value::Value;

/// Local variables of one activation.
///
/// Blocks, rescue and ensure bodies link to the environment they were
/// created in, so `getlocal index, level` walks `level` parent links.
pub struct Env {
    pub iseq: IseqId,
    pub locals: RefCell<Vec<Value>>,
    pub parent: Option<Rc<Env>>,
    /// Block passed to this activation; `yield` reads it from the root of
    /// the chain.
    pub block: Option<Rc<Proc>>,
    /// Activation of a lambda: `return` and `break` end it.
    pub lambda: bool,
}

impl Env {
    pub fn new(iseq: IseqId, size: usize, parent: Option<Rc<Env>>, block: Option<Rc<Proc>>) -> Self {
        Self {
            iseq,
            locals: RefCell::new(vec![Value::Nil; size]),
            parent,
            block,
            lambda: false,
        }
    }

    pub fn ancestor(&self, level: usize) -> Option<&Env> {
        let mut env = self;
        for _ in 0..level {
            env = env.parent.as_deref()?;
        }
        Some(env)
    }

    /// Outermost environment: the method, class body or top level.
    pub fn root(&self) -> &Env {
        let mut env = self;
        while let Some(parent) = env.parent.as_deref() {
            env = parent;
        }
        env
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.locals.borrow().get(index).cloned()
    }

    pub fn set(&self, index: usize, value: Value) -> bool {
        match self.locals.borrow_mut().get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Env(iseq #{}, {} locals)", self.iseq.0, self.locals.borrow().len())
    }
}

/// Lexical class nesting, used for constant lookup and as the target of
/// `def`.
pub struct Cref {
    pub class: Rc<Class>,
    pub parent: Option<Rc<Cref>>,
}

impl Cref {
    pub fn top(object: Rc<Class>) -> Rc<Cref> {
        Rc::new(Cref {
            class: object,
            parent: None,
        })
    }

    pub fn nested(class: Rc<Class>, parent: &Rc<Cref>) -> Rc<Cref> {
        Rc::new(Cref {
            class,
            parent: Some(Rc::clone(parent)),
        })
    }
}

/// Where a running method was found, for `super`.
#[derive(Clone)]
pub enum MethodOwner {
    Instance(Rc<Class>),
    /// Singleton method of a class.
    Singleton(Rc<Class>),
    /// Singleton method of a plain object.
    Object,
}

#[derive(Clone)]
pub struct MethodContext {
    pub name: String,
    pub owner: MethodOwner,
}

pub enum ProcBody {
    Block {
        iseq: IseqId,
        env: Rc<Env>,
        self_value: Value,
        cref: Rc<Cref>,
        method: Option<Rc<MethodContext>>,
    },
    /// `&:name`: calls `name` on the first argument.
    Symbol(String),
}

pub struct Proc {
    pub body: ProcBody,
    pub lambda: bool,
}

impl Proc {
    /// Copy of `self` with lambda argument semantics.
    pub fn to_lambda(&self) -> Proc {
        let body = match &self.body {
            ProcBody::Block {
                iseq,
                env,
                self_value,
                cref,
                method,
            } => ProcBody::Block {
                iseq: *iseq,
                env: Rc::clone(env),
                self_value: self_value.clone(),
                cref: Rc::clone(cref),
                method: method.clone(),
            },
            ProcBody::Symbol(name) => ProcBody::Symbol(name.clone()),
        };
        Proc { body, lambda: true }
    }
}

impl std::fmt::Debug for Proc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.body {
            ProcBody::Block { iseq, .. } => write!(f, "Proc(iseq #{}, lambda: {})", iseq.0, self.lambda),
            ProcBody::Symbol(name) => write!(f, "Proc(:{})", name),
        }
    }
}

/// One activation on the VM's frame stack.
pub struct Frame {
    pub iseq: IseqId,
    /// Index of the next instruction.
    pub pc: usize,
    /// Index of the instruction being executed; catch entries are matched
    /// against it.
    pub current: usize,
    pub stack: Vec<Value>,
    pub env: Rc<Env>,
    pub self_value: Value,
    pub cref: Rc<Cref>,
    pub method: Option<Rc<MethodContext>>,
    /// Catch entries already entered for the unwinding in progress.
    pub consumed: Vec<usize>,
}

impl Frame {
    pub fn new(iseq: IseqId, env: Rc<Env>, self_value: Value, cref: Rc<Cref>, stack_max: usize) -> Self {
        Self {
            iseq,
            pc: 0,
            current: 0,
            stack: Vec::with_capacity(stack_max),
            env,
            self_value,
            cref,
            method: None,
            consumed: Vec::new(),
        }
    }

    pub fn with_method(mut self, method: Option<Rc<MethodContext>>) -> Self {
        self.method = method;
        self
    }

    pub fn starting_at(mut self, pc: usize) -> Self {
        self.pc = pc;
        self.current = pc;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_chain_walks() {
        let root = Rc::new(Env::new(IseqId(0), 2, None, None));
        let block = Rc::new(Env::new(IseqId(1), 1, Some(Rc::clone(&root)), None));
        let inner = Env::new(IseqId(2), 0, Some(Rc::clone(&block)), None);

        root.set(1, Value::Integer(7));
        assert_eq!(inner.ancestor(2).and_then(|env| env.get(1)), Some(Value::Integer(7)));
        assert_eq!(inner.root().iseq, IseqId(0));
        assert!(inner.ancestor(3).is_none());
        assert!(!block.set(5, Value::Nil));
    }
}
