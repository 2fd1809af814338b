//! Core library: classes created at boot and the native methods behind
//! them.
//!
//! Native methods are looked up by the name of the core class that owns
//! them, after the class's own (user-defined) method table, so programs can
//! reopen core classes and override anything here.

mod collection;
mod kernel;
mod numeric;
mod string;

use std::cmp::Ordering;
use std::rc::Rc;

use crate::runtime::class::Class;
use crate::runtime::frame::Proc;
use crate::runtime::runtime_error::Unwind;
use crate::runtime::value::{Range, Value};
use crate::runtime::vm::Vm;

/// Native method: `(vm, receiver, args, block)`.
pub type Builtin = fn(&mut Vm, &Value, Vec<Value>, Option<Rc<Proc>>) -> Result<Value, Unwind>;

pub(crate) type Outcome = Result<Value, Unwind>;

/// Classes the VM needs direct handles on.
pub struct Core {
    pub basic_object: Rc<Class>,
    pub object: Rc<Class>,
    pub kernel: Rc<Class>,
    pub comparable: Rc<Class>,
    pub enumerable: Rc<Class>,
    pub module: Rc<Class>,
    pub class: Rc<Class>,
    pub nil_class: Rc<Class>,
    pub true_class: Rc<Class>,
    pub false_class: Rc<Class>,
    pub numeric: Rc<Class>,
    pub integer: Rc<Class>,
    pub float: Rc<Class>,
    pub string: Rc<Class>,
    pub symbol: Rc<Class>,
    pub array: Rc<Class>,
    pub hash: Rc<Class>,
    pub range: Rc<Class>,
    pub proc_class: Rc<Class>,
    pub exception: Rc<Class>,
    pub standard_error: Rc<Class>,
}

/// Exception classes below `StandardError`, parent first.
const EXCEPTIONS: &[(&str, &str)] = &[
    ("RuntimeError", "StandardError"),
    ("FrozenError", "RuntimeError"),
    ("ArgumentError", "StandardError"),
    ("NameError", "StandardError"),
    ("NoMethodError", "NameError"),
    ("TypeError", "StandardError"),
    ("ZeroDivisionError", "StandardError"),
    ("LocalJumpError", "StandardError"),
    ("NoMatchingPatternError", "StandardError"),
    ("IndexError", "StandardError"),
    ("KeyError", "IndexError"),
    ("StopIteration", "IndexError"),
    ("RangeError", "StandardError"),
    ("FloatDomainError", "RangeError"),
];

/// Build the core class graph and register every class as a constant of
/// `Object`.
pub fn bootstrap() -> Core {
    let basic_object = Class::core("BasicObject", None);
    let object = Class::core("Object", Some(Rc::clone(&basic_object)));
    let kernel = Class::core_module("Kernel");
    let comparable = Class::core_module("Comparable");
    let enumerable = Class::core_module("Enumerable");
    object.includes.borrow_mut().push(Rc::clone(&kernel));

    let subclass = |name: &str, superclass: &Rc<Class>| Class::core(name, Some(Rc::clone(superclass)));
    let module = subclass("Module", &object);
    let class = subclass("Class", &module);
    let nil_class = subclass("NilClass", &object);
    let true_class = subclass("TrueClass", &object);
    let false_class = subclass("FalseClass", &object);
    let numeric = subclass("Numeric", &object);
    numeric.includes.borrow_mut().push(Rc::clone(&comparable));
    let integer = subclass("Integer", &numeric);
    let float = subclass("Float", &numeric);
    let string = subclass("String", &object);
    string.includes.borrow_mut().push(Rc::clone(&comparable));
    let symbol = subclass("Symbol", &object);
    let array = subclass("Array", &object);
    let hash = subclass("Hash", &object);
    let range = subclass("Range", &object);
    for collection in [&array, &hash, &range] {
        collection.includes.borrow_mut().push(Rc::clone(&enumerable));
    }
    let proc_class = subclass("Proc", &object);
    let exception = subclass("Exception", &object);
    let standard_error = subclass("StandardError", &exception);

    let core = Core {
        basic_object,
        object,
        kernel,
        comparable,
        enumerable,
        module,
        class,
        nil_class,
        true_class,
        false_class,
        numeric,
        integer,
        float,
        string,
        symbol,
        array,
        hash,
        range,
        proc_class,
        exception,
        standard_error,
    };

    for class in [
        &core.basic_object,
        &core.object,
        &core.kernel,
        &core.comparable,
        &core.enumerable,
        &core.module,
        &core.class,
        &core.nil_class,
        &core.true_class,
        &core.false_class,
        &core.numeric,
        &core.integer,
        &core.float,
        &core.string,
        &core.symbol,
        &core.array,
        &core.hash,
        &core.range,
        &core.proc_class,
        &core.exception,
        &core.standard_error,
    ] {
        core.object.set_constant(&class.name, Value::Class(Rc::clone(class)));
    }
    for (name, parent) in EXCEPTIONS {
        let parent = match core.object.get_constant(parent) {
            Some(Value::Class(parent)) => parent,
            _ => Rc::clone(&core.standard_error),
        };
        let class = Class::core(name, Some(parent));
        core.object.set_constant(name, Value::Class(class));
    }
    core
}

/// Native method `name` of core class `class`, if there is one.
pub fn lookup(class: &str, name: &str) -> Option<Builtin> {
    match class {
        "BasicObject" | "Kernel" | "Module" | "Class" | "Comparable" | "NilClass" | "TrueClass"
        | "FalseClass" | "Proc" | "Exception" => kernel::lookup(class, name),
        "Numeric" | "Integer" | "Float" => numeric::lookup(class, name),
        "String" | "Symbol" => string::lookup(class, name),
        "Array" | "Hash" | "Range" | "Enumerable" => collection::lookup(class, name),
        _ => None,
    }
}

// =============================================================================
// Shared helpers
// =============================================================================

pub(crate) fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Nil)
}

pub(crate) fn check_args(vm: &Vm, args: &[Value], min: usize, max: usize) -> Result<(), Unwind> {
    if args.len() >= min && args.len() <= max {
        return Ok(());
    }
    let expected = if min == max {
        min.to_string()
    } else if max == usize::MAX {
        format!("{}+", min)
    } else {
        format!("{}..{}", min, max)
    };
    Err(vm.raise(
        "ArgumentError",
        format!("wrong number of arguments (given {}, expected {})", args.len(), expected),
    ))
}

pub(crate) fn require_block(vm: &Vm, block: Option<Rc<Proc>>) -> Result<Rc<Proc>, Unwind> {
    block.ok_or_else(|| vm.raise("LocalJumpError", "no block given (yield)"))
}

pub(crate) fn class_name(vm: &Vm, value: &Value) -> String {
    vm.class_of(value).name.clone()
}

pub(crate) fn int_arg(vm: &Vm, value: &Value) -> Result<i64, Unwind> {
    match value {
        Value::Integer(n) => Ok(*n),
        Value::Float(f) if f.is_finite() => Ok(*f as i64),
        other => Err(vm.raise(
            "TypeError",
            format!("no implicit conversion of {} into Integer", class_name(vm, other)),
        )),
    }
}

pub(crate) fn str_arg(vm: &Vm, value: &Value) -> Result<String, Unwind> {
    value.as_str().ok_or_else(|| {
        vm.raise(
            "TypeError",
            format!("no implicit conversion of {} into String", class_name(vm, value)),
        )
    })
}

/// `start, length` indexing into a sequence of `len` elements. Negative
/// starts count from the end; a start just past the end selects an empty
/// slice.
pub(crate) fn index_span(start: i64, count: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { start + len } else { start };
    if start < 0 || start > len || count < 0 {
        return None;
    }
    Some((start as usize, count.min(len - start) as usize))
}

/// Range indexing; nil bounds are open.
pub(crate) fn range_span(vm: &Vm, range: &Range, len: usize) -> Result<Option<(usize, usize)>, Unwind> {
    let start = match &range.start {
        Value::Nil => 0,
        value => int_arg(vm, value)?,
    };
    let signed_len = len as i64;
    let end = match &range.end {
        Value::Nil => signed_len,
        value => {
            let end = int_arg(vm, value)?;
            let end = if end < 0 { end + signed_len } else { end };
            if range.exclusive { end } else { end + 1 }
        }
    };
    let first = if start < 0 { start + signed_len } else { start };
    Ok(index_span(first, (end - first).max(0), len))
}

/// `==` with numeric widening, element-wise containers and dispatch for
/// user objects.
pub(crate) fn values_equal(vm: &mut Vm, a: &Value, b: &Value) -> Result<bool, Unwind> {
    match (a, b) {
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
            Ok(a.as_float() == b.as_float())
        }
        (Value::Object(_), _) => Ok(vm.invoke(a.clone(), "==", vec![b.clone()], None)?.is_truthy()),
        (Value::Array(x), Value::Array(y)) => {
            if Rc::ptr_eq(x, y) {
                return Ok(true);
            }
            let (x, y) = (x.borrow().clone(), y.borrow().clone());
            if x.len() != y.len() {
                return Ok(false);
            }
            for (left, right) in x.iter().zip(&y) {
                if !values_equal(vm, left, right)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        _ => Ok(a == b),
    }
}

/// `<=>`: `None` when the values are not comparable.
pub(crate) fn compare(vm: &mut Vm, a: &Value, b: &Value) -> Result<Option<Ordering>, Unwind> {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Ok(Some(x.cmp(y))),
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
            Ok(a.as_float().zip(b.as_float()).and_then(|(x, y)| x.partial_cmp(&y)))
        }
        (Value::String(x), Value::String(y)) => Ok(Some(x.value.borrow().cmp(&y.value.borrow()))),
        (Value::Symbol(x), Value::Symbol(y)) => Ok(Some(x.cmp(y))),
        (Value::Array(x), Value::Array(y)) => {
            let (x, y) = (x.borrow().clone(), y.borrow().clone());
            for (left, right) in x.iter().zip(&y) {
                match compare(vm, left, right)? {
                    Some(Ordering::Equal) => {}
                    other => return Ok(other),
                }
            }
            Ok(Some(x.len().cmp(&y.len())))
        }
        (Value::Object(_) | Value::Class(_), _) => {
            let result = vm.invoke(a.clone(), "<=>", vec![b.clone()], None)?;
            Ok(result.as_integer().map(|n| n.cmp(&0)))
        }
        _ => Ok(None),
    }
}

pub(crate) fn compare_or_fail(vm: &mut Vm, a: &Value, b: &Value) -> Result<Ordering, Unwind> {
    match compare(vm, a, b)? {
        Some(ordering) => Ok(ordering),
        None => Err(vm.raise(
            "ArgumentError",
            format!("comparison of {} with {} failed", class_name(vm, a), describe_operand(vm, b)),
        )),
    }
}

fn describe_operand(vm: &Vm, value: &Value) -> String {
    match value {
        Value::Integer(_) | Value::Float(_) | Value::Nil => value.inspect(),
        other => class_name(vm, other),
    }
}

/// Sort with a fallible comparison; the first error wins.
pub(crate) fn sort_values(
    vm: &mut Vm,
    items: &mut [Value],
    mut cmp: impl FnMut(&mut Vm, &Value, &Value) -> Result<Ordering, Unwind>,
) -> Result<(), Unwind> {
    let mut failure = None;
    items.sort_by(|a, b| {
        if failure.is_some() {
            return Ordering::Equal;
        }
        cmp(vm, a, b).unwrap_or_else(|unwind| {
            failure = Some(unwind);
            Ordering::Equal
        })
    });
    match failure {
        Some(unwind) => Err(unwind),
        None => Ok(()),
    }
}

/// `max`/`min` over `items`; nil when empty.
pub fn extreme(vm: &mut Vm, items: &[Value], want_max: bool) -> Outcome {
    let mut best: Option<Value> = None;
    for item in items {
        best = Some(match best {
            None => item.clone(),
            Some(current) => {
                let ordering = compare_or_fail(vm, item, &current)?;
                let better = if want_max {
                    ordering == Ordering::Greater
                } else {
                    ordering == Ordering::Less
                };
                if better { item.clone() } else { current }
            }
        });
    }
    Ok(best.unwrap_or(Value::Nil))
}

/// `format`-style interpolation: `%s %d %i %f %e %g %x %o %b %c %p %%`
/// with `-`, `0`, `+` and space flags, width and precision.
pub(crate) fn format_string(vm: &mut Vm, template: &str, args: &[Value]) -> Result<String, Unwind> {
    let mut out = String::new();
    let mut chars = template.chars().peekable();
    let mut next_arg = args.iter();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let (mut left, mut zero, mut plus, mut space) = (false, false, false, false);
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => left = true,
                '0' => zero = true,
                '+' => plus = true,
                ' ' => space = true,
                _ => break,
            }
            chars.next();
        }
        let mut width = 0usize;
        while let Some(digit) = chars.peek().and_then(|c| c.to_digit(10)) {
            width = width * 10 + digit as usize;
            chars.next();
        }
        let mut precision = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut p = 0usize;
            while let Some(digit) = chars.peek().and_then(|c| c.to_digit(10)) {
                p = p * 10 + digit as usize;
                chars.next();
            }
            precision = Some(p);
        }
        let Some(kind) = chars.next() else {
            return Err(vm.raise("ArgumentError", "incomplete format specifier; use %% (double %) instead"));
        };
        if kind == '%' {
            out.push('%');
            continue;
        }
        let Some(value) = next_arg.next() else {
            return Err(vm.raise("ArgumentError", "too few arguments"));
        };
        let sign = |negative: bool| {
            if negative {
                "-"
            } else if plus {
                "+"
            } else if space {
                " "
            } else {
                ""
            }
        };
        let (prefix, body) = match kind {
            's' => {
                let mut text = vm.stringify(value)?;
                if let Some(p) = precision {
                    text = text.chars().take(p).collect();
                }
                (String::new(), text)
            }
            'p' => (String::new(), vm.inspect(value)?),
            'd' | 'i' | 'u' => {
                let n = match value {
                    Value::Float(f) => f.floor() as i64,
                    Value::String(s) => s.value.borrow().trim().parse::<i64>().map_err(|_| {
                        vm.raise("ArgumentError", format!("invalid value for Integer(): {}", value.inspect()))
                    })?,
                    other => int_arg(vm, other)?,
                };
                (sign(n < 0).to_string(), n.unsigned_abs().to_string())
            }
            'f' | 'e' | 'g' => {
                let f = value.as_float().ok_or_else(|| {
                    vm.raise("TypeError", format!("can't convert {} into Float", class_name(vm, value)))
                })?;
                let p = precision.unwrap_or(6);
                let body = match kind {
                    'f' => format!("{:.*}", p, f.abs()),
                    'e' => format!("{:.*e}", p, f.abs()),
                    _ => crate::lang::literal::format_float(f.abs()),
                };
                (sign(f.is_sign_negative() && f != 0.0).to_string(), body)
            }
            'x' | 'o' | 'b' => {
                let n = int_arg(vm, value)?;
                let body = match kind {
                    'x' => format!("{:x}", n.unsigned_abs()),
                    'o' => format!("{:o}", n.unsigned_abs()),
                    _ => format!("{:b}", n.unsigned_abs()),
                };
                (sign(n < 0).to_string(), body)
            }
            'c' => {
                let text = match value {
                    Value::Integer(n) => u32::try_from(*n)
                        .ok()
                        .and_then(char::from_u32)
                        .map(String::from)
                        .unwrap_or_default(),
                    other => other.to_s().chars().take(1).collect(),
                };
                (String::new(), text)
            }
            other => {
                return Err(vm.raise("ArgumentError", format!("malformed format string - %{}", other)));
            }
        };
        let len = prefix.chars().count() + body.chars().count();
        let fill = width.saturating_sub(len);
        if left {
            out.push_str(&prefix);
            out.push_str(&body);
            out.extend(std::iter::repeat_n(' ', fill));
        } else if zero && !matches!(kind, 's' | 'p' | 'c') {
            out.push_str(&prefix);
            out.extend(std::iter::repeat_n('0', fill));
            out.push_str(&body);
        } else {
            out.extend(std::iter::repeat_n(' ', fill));
            out.push_str(&prefix);
            out.push_str(&body);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_registers_core_constants() {
        let core = bootstrap();
        for name in ["Object", "Integer", "Comparable", "StandardError", "KeyError"] {
            assert!(core.object.get_constant(name).is_some(), "missing {}", name);
        }
        let Some(Value::Class(key_error)) = core.object.get_constant("KeyError") else {
            panic!("KeyError is not a class");
        };
        let names: Vec<String> = crate::runtime::class::ancestors(&key_error)
            .iter()
            .map(|c| c.name.clone())
            .collect();
        assert_eq!(
            names,
            vec!["KeyError", "IndexError", "StandardError", "Exception", "Object", "Kernel", "BasicObject"]
        );
    }

    #[test]
    fn test_lookup_by_owning_class() {
        assert!(lookup("Integer", "times").is_some());
        assert!(lookup("Kernel", "puts").is_some());
        assert!(lookup("Enumerable", "map").is_some());
        assert!(lookup("RuntimeError", "message").is_none());
        assert!(lookup("Exception", "message").is_some());
        assert!(lookup("Integer", "no_such_method").is_none());
    }

    #[test]
    fn test_format_string() {
        let mut vm = Vm::new();
        let args = [Value::Integer(7), Value::Float(3.14159), Value::string("ab")];
        let text = format_string(&mut vm, "%03d|%.2f|%-4s|%%", &args).expect("format");
        assert_eq!(text, "007|3.14|ab  |%");
        assert!(format_string(&mut vm, "%d %d", &args[..1]).is_err());
    }
}
