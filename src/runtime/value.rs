use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::lang::literal::{Literal, format_float, quote_string};
use crate::runtime::class::{Class, Method};
use crate::runtime::frame::Proc;
use crate::runtime::runtime_error::Unwind;

/// Runtime value.
///
/// Immediates are stored inline; everything with identity or interior
/// mutability sits behind an `Rc`, so cloning a value aliases it the way
/// the language does.
#[derive(Clone)]
pub enum Value {
    Nil,
    True,
    False,
    Integer(i64),
    Float(f64),
    String(Rc<Str>),
    Symbol(Rc<str>),
    Array(Rc<RefCell<Vec<Value>>>),
    Hash(Rc<RefCell<HashTable>>),
    Range(Rc<Range>),
    Proc(Rc<Proc>),
    Class(Rc<Class>),
    Object(Rc<Object>),
    /// Receiver of `putspecialobject VMCORE`.
    VmCore,
    /// A pending non-local exit, held in the `$!` of an ensure handler
    /// until the handler rethrows it.
    Unwind(Rc<Unwind>),
}

#[derive(Debug)]
pub struct Str {
    pub value: RefCell<String>,
    pub frozen: Cell<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Range {
    pub start: Value,
    pub end: Value,
    pub exclusive: bool,
}

/// Insertion-ordered hash keyed by structural equality.
#[derive(Debug, Clone, Default)]
pub struct HashTable {
    entries: Vec<(Value, Value)>,
    /// Value of missing keys (`Hash.new(0)`).
    pub default: Option<Value>,
    /// Block called with the hash and a missing key (`Hash.new { |h, k| }`).
    pub default_proc: Option<Rc<Proc>>,
}

/// Defaults take no part in equality.
impl PartialEq for HashTable {
    fn eq(&self, other: &HashTable) -> bool {
        self.entries == other.entries
    }
}

impl HashTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn insert(&mut self, key: Value, value: Value) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> Vec<Value> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Keep the entries `keep` accepts.
    pub fn retain(&mut self, mut keep: impl FnMut(&Value, &Value) -> bool) {
        self.entries.retain(|(k, v)| keep(k, v));
    }
}

impl FromIterator<(Value, Value)> for HashTable {
    fn from_iter<I: IntoIterator<Item = (Value, Value)>>(iter: I) -> Self {
        let mut table = HashTable::new();
        for (k, v) in iter {
            table.insert(k, v);
        }
        table
    }
}

/// Instance of a user-defined (or exception) class.
pub struct Object {
    pub class: Rc<Class>,
    /// Instance variables in assignment order. Names without a leading `@`
    /// are internal slots (exception message, backtrace).
    pub ivars: RefCell<Vec<(String, Value)>>,
    pub singleton_methods: RefCell<HashMap<String, Method>>,
}

impl Object {
    pub fn new(class: Rc<Class>) -> Self {
        Self {
            class,
            ivars: RefCell::new(Vec::new()),
            singleton_methods: RefCell::new(HashMap::new()),
        }
    }

    pub fn get_ivar(&self, name: &str) -> Option<Value> {
        self.ivars
            .borrow()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    pub fn set_ivar(&self, name: &str, value: Value) {
        let mut ivars = self.ivars.borrow_mut();
        match ivars.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => ivars.push((name.to_string(), value)),
        }
    }
}

impl Value {
    pub fn string(value: impl Into<String>) -> Value {
        Value::String(Rc::new(Str {
            value: RefCell::new(value.into()),
            frozen: Cell::new(false),
        }))
    }

    pub fn frozen_string(value: impl Into<String>) -> Value {
        Value::String(Rc::new(Str {
            value: RefCell::new(value.into()),
            frozen: Cell::new(true),
        }))
    }

    pub fn symbol(name: &str) -> Value {
        Value::Symbol(Rc::from(name))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn hash(table: HashTable) -> Value {
        Value::Hash(Rc::new(RefCell::new(table)))
    }

    pub fn range(start: Value, end: Value, exclusive: bool) -> Value {
        Value::Range(Rc::new(Range { start, end, exclusive }))
    }

    pub fn bool(value: bool) -> Value {
        if value { Value::True } else { Value::False }
    }

    /// Materialize an instruction operand. String literals come out frozen.
    pub fn from_literal(literal: &Literal) -> Value {
        match literal {
            Literal::Nil => Value::Nil,
            Literal::True => Value::True,
            Literal::False => Value::False,
            Literal::Integer(n) => Value::Integer(*n),
            Literal::Float(n) => Value::Float(*n),
            Literal::String(s) => Value::frozen_string(s.as_str()),
            Literal::Symbol(s) => Value::symbol(s),
            Literal::Array(items) => Value::array(items.iter().map(Value::from_literal).collect()),
            Literal::Hash(pairs) => Value::hash(
                pairs
                    .iter()
                    .map(|(k, v)| (Value::from_literal(k), Value::from_literal(v)))
                    .collect(),
            ),
            Literal::Range { start, end, exclusive } => Value::range(
                start.as_deref().map(Value::from_literal).unwrap_or(Value::Nil),
                end.as_deref().map(Value::from_literal).unwrap_or(Value::Nil),
                *exclusive,
            ),
        }
    }

    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::False)
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Integers widen to floats.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.value.borrow().clone()),
            _ => None,
        }
    }

    /// Symbol or string contents, for APIs that accept either.
    pub fn as_name(&self) -> Option<String> {
        match self {
            Value::Symbol(s) => Some(s.to_string()),
            Value::String(s) => Some(s.value.borrow().clone()),
            _ => None,
        }
    }

    /// Same object, not just equal contents.
    pub fn identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::String(a), Value::String(b)) => Rc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Hash(a), Value::Hash(b)) => Rc::ptr_eq(a, b),
            (Value::Range(a), Value::Range(b)) => Rc::ptr_eq(a, b),
            (Value::Proc(a), Value::Proc(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => self == other,
        }
    }

    /// Surface syntax of values that need no method dispatch.
    pub fn inspect(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::String(s) => quote_string(&s.value.borrow()),
            Value::Symbol(s) => format!(":{}", s),
            Value::Array(items) => {
                let parts: Vec<String> = items.borrow().iter().map(Value::inspect).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Hash(table) => {
                let table = table.borrow();
                if table.is_empty() {
                    return "{}".to_string();
                }
                let parts: Vec<String> = table
                    .iter()
                    .map(|(k, v)| format!("{}=>{}", k.inspect(), v.inspect()))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Range(range) => format!(
                "{}{}{}",
                if range.start.is_nil() { String::new() } else { range.start.inspect() },
                if range.exclusive { "..." } else { ".." },
                if range.end.is_nil() { String::new() } else { range.end.inspect() },
            ),
            Value::Object(object) => {
                if let Some(message) = object.get_ivar(EXCEPTION_MESSAGE) {
                    return format!("#<{}: {}>", object.class.name, message.to_s());
                }
                let ivars = object.ivars.borrow();
                let shown: Vec<String> = ivars
                    .iter()
                    .filter(|(name, _)| name.starts_with('@'))
                    .map(|(name, value)| format!("{}={}", name, value.inspect()))
                    .collect();
                if shown.is_empty() {
                    format!("#<{}>", object.class.name)
                } else {
                    format!("#<{} {}>", object.class.name, shown.join(", "))
                }
            }
            _ => self.to_s(),
        }
    }

    /// `to_s` of values that need no method dispatch.
    pub fn to_s(&self) -> String {
        match self {
            Value::Nil => String::new(),
            Value::True => "true".to_string(),
            Value::False => "false".to_string(),
            Value::Integer(n) => n.to_string(),
            Value::Float(n) => format_float(*n),
            Value::String(s) => s.value.borrow().clone(),
            Value::Symbol(s) => s.to_string(),
            Value::Array(_) | Value::Hash(_) | Value::Range(_) => self.inspect(),
            Value::Proc(proc) => {
                if proc.lambda {
                    "#<Proc:(lambda)>".to_string()
                } else {
                    "#<Proc>".to_string()
                }
            }
            Value::Class(class) => class.name.clone(),
            Value::Object(object) => match object.get_ivar(EXCEPTION_MESSAGE) {
                Some(message) => message.to_s(),
                None => format!("#<{}>", object.class.name),
            },
            Value::VmCore => "#<VMCore>".to_string(),
            Value::Unwind(_) => "#<throw>".to_string(),
        }
    }
}

/// Internal slot holding an exception's message.
pub const EXCEPTION_MESSAGE: &str = "mesg";
/// Internal slot holding an exception's backtrace.
pub const EXCEPTION_BACKTRACE: &str = "bt";

/// Structural equality (`eql?`): numbers of different classes differ,
/// containers compare element-wise, other objects by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) | (Value::True, Value::True) | (Value::False, Value::False) => true,
            (Value::VmCore, Value::VmCore) => true,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => *a.value.borrow() == *b.value.borrow(),
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Hash(a), Value::Hash(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Range(a), Value::Range(b)) => a == b,
            (Value::Proc(a), Value::Proc(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Unwind(a), Value::Unwind(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Float(n) => write!(f, "Float({})", format_float(*n)),
            Value::Integer(n) => write!(f, "Integer({})", n),
            _ => write!(f, "{}", self.inspect()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_s())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_strings_are_frozen() {
        match Value::from_literal(&Literal::string("a")) {
            Value::String(s) => assert!(s.frozen.get()),
            other => panic!("expected string, got {:?}", other),
        }
    }

    #[test]
    fn test_inspect_nested() {
        let value = Value::from_literal(&Literal::Array(vec![
            Literal::Integer(1),
            Literal::string("x"),
            Literal::Hash(vec![(Literal::symbol("k"), Literal::Float(2.0))]),
        ]));
        assert_eq!(value.inspect(), "[1, \"x\", {:k=>2.0}]");
        assert_eq!(value.to_s(), value.inspect());
    }

    #[test]
    fn test_equality_is_structural_for_containers() {
        let a = Value::array(vec![Value::Integer(1), Value::string("s")]);
        let b = Value::array(vec![Value::Integer(1), Value::string("s")]);
        assert_eq!(a, b);
        assert!(!a.identical(&b));
        assert_ne!(Value::Integer(1), Value::Float(1.0));
    }

    #[test]
    fn test_hash_table_keeps_insertion_order() {
        let mut table = HashTable::new();
        table.insert(Value::symbol("b"), Value::Integer(1));
        table.insert(Value::symbol("a"), Value::Integer(2));
        table.insert(Value::symbol("b"), Value::Integer(3));
        assert_eq!(table.keys(), vec![Value::symbol("b"), Value::symbol("a")]);
        assert_eq!(table.get(&Value::symbol("b")), Some(&Value::Integer(3)));
        assert_eq!(table.remove(&Value::symbol("a")), Some(Value::Integer(2)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_range_inspect() {
        assert_eq!(Value::range(Value::Integer(1), Value::Nil, true).inspect(), "1...");
        assert_eq!(Value::range(Value::Integer(1), Value::Integer(3), false).to_s(), "1..3");
    }
}
