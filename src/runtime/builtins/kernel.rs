use std::cmp::Ordering;
use std::rc::Rc;

use crate::runtime::builtins::{
    Builtin, Outcome, arg, check_args, class_name, compare_or_fail, format_string, require_block, str_arg,
    values_equal,
};
use crate::runtime::class::{Class, Method, ancestors, is_subclass};
use crate::runtime::frame::Proc;
use crate::runtime::runtime_error::Unwind;
use crate::runtime::value::{EXCEPTION_BACKTRACE, EXCEPTION_MESSAGE, Object, Value};
use crate::runtime::vm::Vm;

type Block = Option<Rc<Proc>>;

pub(super) fn lookup(class: &str, name: &str) -> Option<Builtin> {
    let found: Builtin = match (class, name) {
        ("BasicObject", "!") => basic_not,
        ("BasicObject", "==" | "equal?") => basic_equal,
        ("BasicObject", "!=") => basic_not_equal,
        ("BasicObject", "initialize") => basic_initialize,
        ("BasicObject", "__send__") => kernel_send,

        ("Kernel", "puts") => kernel_puts,
        ("Kernel", "print") => kernel_print,
        ("Kernel", "p" | "pp") => kernel_p,
        ("Kernel", "raise" | "fail") => kernel_raise,
        ("Kernel", "block_given?") => kernel_block_given,
        ("Kernel", "proc") => kernel_proc,
        ("Kernel", "lambda") => kernel_lambda,
        ("Kernel", "loop") => kernel_loop,
        ("Kernel", "format" | "sprintf") => kernel_format,
        ("Kernel", "Integer") => kernel_integer,
        ("Kernel", "Float") => kernel_float,
        ("Kernel", "String") => kernel_string,
        ("Kernel", "Array") => kernel_array,
        ("Kernel", "class") => kernel_class,
        ("Kernel", "inspect") => kernel_inspect,
        ("Kernel", "to_s") => kernel_to_s,
        ("Kernel", "nil?") => kernel_nil_p,
        ("Kernel", "is_a?" | "kind_of?") => kernel_is_a,
        ("Kernel", "instance_of?") => kernel_instance_of,
        ("Kernel", "respond_to?") => kernel_respond_to,
        ("Kernel", "send" | "public_send") => kernel_send,
        ("Kernel", "===") => kernel_case_equal,
        ("Kernel", "eql?") => kernel_eql,
        ("Kernel", "<=>") => kernel_spaceship,
        ("Kernel", "freeze") => kernel_freeze,
        ("Kernel", "frozen?") => kernel_frozen_p,
        ("Kernel", "dup" | "clone") => kernel_dup,
        ("Kernel", "tap") => kernel_tap,
        ("Kernel", "then" | "yield_self") => kernel_then,
        ("Kernel", "itself") => kernel_itself,
        ("Kernel", "instance_variable_get") => kernel_ivar_get,
        ("Kernel", "instance_variable_set") => kernel_ivar_set,
        ("Kernel", "instance_variable_defined?") => kernel_ivar_defined,
        ("Kernel", "instance_variables") => kernel_ivars,

        ("Module", "name" | "to_s" | "inspect") => module_name,
        ("Module", "===") => module_case_equal,
        ("Module", "<") => module_lt,
        ("Module", "<=") => module_le,
        ("Module", "ancestors") => module_ancestors,
        ("Module", "include") => module_include,
        ("Module", "include?") => module_include_p,
        ("Module", "attr_reader") => module_attr_reader,
        ("Module", "attr_writer") => module_attr_writer,
        ("Module", "attr_accessor") => module_attr_accessor,
        ("Module", "alias_method") => module_alias_method,
        ("Module", "method_defined?" | "public_method_defined?") => module_method_defined,
        ("Module", "const_get") => module_const_get,
        ("Module", "const_set") => module_const_set,
        ("Module", "const_defined?") => module_const_defined,
        ("Module", "private" | "public" | "protected" | "module_function" | "private_constant") => module_visibility,

        ("Class", "new") => class_new,
        ("Class", "allocate") => class_allocate,
        ("Class", "superclass") => class_superclass,

        ("Comparable", "<") => comparable_lt,
        ("Comparable", "<=") => comparable_le,
        ("Comparable", ">") => comparable_gt,
        ("Comparable", ">=") => comparable_ge,
        ("Comparable", "==") => comparable_eq,
        ("Comparable", "between?") => comparable_between,
        ("Comparable", "clamp") => comparable_clamp,

        ("NilClass", "to_s") => nil_to_s,
        ("NilClass", "to_a") => nil_to_a,
        ("NilClass", "to_i") => nil_to_i,
        ("NilClass", "to_f") => nil_to_f,
        ("NilClass", "inspect") => nil_inspect,
        ("NilClass", "&") | ("FalseClass", "&") => false_and,
        ("NilClass", "|") | ("FalseClass", "|" | "^") => false_or,
        ("TrueClass", "&") => true_and,
        ("TrueClass", "|") => true_or,
        ("TrueClass", "^") => true_xor,
        ("TrueClass" | "FalseClass", "to_s" | "inspect") => bool_to_s,

        ("Proc", "arity") => proc_arity,
        ("Proc", "lambda?") => proc_lambda_p,
        ("Proc", "to_proc") => kernel_itself,

        ("Exception", "initialize") => exception_initialize,
        ("Exception", "message") => exception_message,
        ("Exception", "to_s") => exception_to_s,
        ("Exception", "inspect") => exception_inspect,
        ("Exception", "full_message") => exception_full_message,
        ("Exception", "backtrace") => exception_backtrace,
        _ => return None,
    };
    Some(found)
}

// =============================================================================
// BasicObject
// =============================================================================

fn basic_not(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(!receiver.is_truthy()))
}

fn basic_equal(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    Ok(Value::bool(receiver.identical(&args[0])))
}

fn basic_not_equal(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let equal = values_equal(vm, receiver, &args[0])?;
    Ok(Value::bool(!equal))
}

fn basic_initialize(vm: &mut Vm, _receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 0, 0)?;
    Ok(Value::Nil)
}

// =============================================================================
// Kernel
// =============================================================================

fn puts_value(vm: &mut Vm, value: &Value, out: &mut String) -> Result<(), Unwind> {
    if let Value::Array(items) = value {
        let items = items.borrow().clone();
        if items.is_empty() {
            out.push('\n');
        }
        for item in &items {
            puts_value(vm, item, out)?;
        }
        return Ok(());
    }
    let text = vm.stringify(value)?;
    out.push_str(&text);
    if !text.ends_with('\n') {
        out.push('\n');
    }
    Ok(())
}

fn kernel_puts(vm: &mut Vm, _receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    let mut out = String::new();
    if args.is_empty() {
        out.push('\n');
    }
    for value in &args {
        puts_value(vm, value, &mut out)?;
    }
    vm.write_output(&out)?;
    Ok(Value::Nil)
}

fn kernel_print(vm: &mut Vm, _receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    let mut out = String::new();
    for value in &args {
        out.push_str(&vm.stringify(value)?);
    }
    vm.write_output(&out)?;
    Ok(Value::Nil)
}

fn kernel_p(vm: &mut Vm, _receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    let mut out = String::new();
    for value in &args {
        out.push_str(&vm.inspect(value)?);
        out.push('\n');
    }
    vm.write_output(&out)?;
    Ok(match args.len() {
        0 => Value::Nil,
        1 => args[0].clone(),
        _ => Value::array(args),
    })
}

fn kernel_raise(vm: &mut Vm, _receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 0, 2)?;
    let exception = match args.as_slice() {
        [] => match vm.current_exception() {
            Some(exception) => exception,
            None => return Err(vm.raise("RuntimeError", "unhandled exception")),
        },
        [Value::String(message)] => {
            let class = vm.exception_class("RuntimeError");
            vm.new_exception(&class, Value::string(message.value.borrow().as_str()))
        }
        [Value::Class(class), rest @ ..] => {
            let exception = vm.invoke(Value::Class(Rc::clone(class)), "new", rest.to_vec(), None)?;
            if !vm.is_exception(&exception) {
                return Err(vm.raise("TypeError", "exception class/object expected"));
            }
            exception
        }
        [exception, rest @ ..] if vm.is_exception(exception) => {
            if let (Some(message), Value::Object(object)) = (rest.first(), exception) {
                object.set_ivar(EXCEPTION_MESSAGE, message.clone());
            }
            exception.clone()
        }
        _ => return Err(vm.raise("TypeError", "exception class/object expected")),
    };
    Err(Unwind::Raise(exception))
}

fn kernel_block_given(vm: &mut Vm, _receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(vm.current_block().is_some()))
}

fn kernel_proc(vm: &mut Vm, _receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let block = block.ok_or_else(|| vm.raise("ArgumentError", "tried to create Proc object without a block"))?;
    Ok(Value::Proc(block))
}

fn kernel_lambda(vm: &mut Vm, _receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let block = block.ok_or_else(|| vm.raise("ArgumentError", "tried to create Proc object without a block"))?;
    if block.lambda {
        return Ok(Value::Proc(block));
    }
    Ok(Value::Proc(Rc::new(block.to_lambda())))
}

/// Yields until the block breaks or raises `StopIteration`.
fn kernel_loop(vm: &mut Vm, _receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let block = require_block(vm, block)?;
    let stop = vm.exception_class("StopIteration");
    loop {
        match vm.yield_block(&block, Vec::new()) {
            Ok(_) => {}
            Err(Unwind::Raise(exception)) if vm.is_a(&exception, &stop) => return Ok(Value::Nil),
            Err(unwind) => return Err(unwind),
        }
    }
}

fn kernel_format(vm: &mut Vm, _receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, usize::MAX)?;
    let template = str_arg(vm, &args[0])?;
    Ok(Value::string(format_string(vm, &template, &args[1..])?))
}

fn kernel_integer(vm: &mut Vm, _receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    match &args[0] {
        Value::Integer(n) => Ok(Value::Integer(*n)),
        Value::Float(f) if f.is_finite() => Ok(Value::Integer(f.trunc() as i64)),
        Value::String(s) => {
            let text = s.value.borrow().trim().replace('_', "");
            let parsed = match text.strip_prefix("0x") {
                Some(hex) => i64::from_str_radix(hex, 16).ok(),
                None => text.parse::<i64>().ok(),
            };
            parsed
                .map(Value::Integer)
                .ok_or_else(|| vm.raise("ArgumentError", format!("invalid value for Integer(): {}", args[0].inspect())))
        }
        Value::Nil => Err(vm.raise("TypeError", "can't convert nil into Integer")),
        other => Err(vm.raise(
            "TypeError",
            format!("can't convert {} into Integer", class_name(vm, other)),
        )),
    }
}

fn kernel_float(vm: &mut Vm, _receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    match &args[0] {
        Value::Integer(n) => Ok(Value::Float(*n as f64)),
        Value::Float(f) => Ok(Value::Float(*f)),
        Value::String(s) => s
            .value
            .borrow()
            .trim()
            .replace('_', "")
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| vm.raise("ArgumentError", format!("invalid value for Float(): {}", args[0].inspect()))),
        other => Err(vm.raise(
            "TypeError",
            format!("can't convert {} into Float", class_name(vm, other)),
        )),
    }
}

fn kernel_string(vm: &mut Vm, _receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    Ok(Value::string(vm.stringify(&args[0])?))
}

fn kernel_array(vm: &mut Vm, _receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    Ok(match &args[0] {
        Value::Nil => Value::array(Vec::new()),
        Value::Array(_) => args[0].clone(),
        Value::Hash(table) => Value::array(
            table
                .borrow()
                .iter()
                .map(|(k, v)| Value::array(vec![k.clone(), v.clone()]))
                .collect(),
        ),
        other => Value::array(vec![other.clone()]),
    })
}

fn kernel_class(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::Class(vm.class_of(receiver)))
}

fn kernel_inspect(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    if receiver.identical(&vm.main_object()) {
        return Ok(Value::string("main"));
    }
    Ok(Value::string(receiver.inspect()))
}

fn kernel_to_s(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    if receiver.identical(&vm.main_object()) {
        return Ok(Value::string("main"));
    }
    Ok(Value::string(receiver.to_s()))
}

fn kernel_nil_p(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(receiver.is_nil()))
}

fn class_operand(vm: &Vm, value: &Value) -> Result<Rc<Class>, Unwind> {
    match value {
        Value::Class(class) => Ok(Rc::clone(class)),
        _ => Err(vm.raise("TypeError", "class or module required")),
    }
}

fn kernel_is_a(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let class = class_operand(vm, &args[0])?;
    Ok(Value::bool(vm.is_a(receiver, &class)))
}

fn kernel_instance_of(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let class = class_operand(vm, &args[0])?;
    Ok(Value::bool(Rc::ptr_eq(&vm.class_of(receiver), &class)))
}

fn kernel_respond_to(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 2)?;
    let name = method_name(vm, &args[0])?;
    Ok(Value::bool(vm.respond_to(receiver, &name)))
}

fn method_name(vm: &Vm, value: &Value) -> Result<String, Unwind> {
    value
        .as_name()
        .ok_or_else(|| vm.raise("TypeError", format!("{} is not a symbol nor a string", value.inspect())))
}

fn kernel_send(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    check_args(vm, &args, 1, usize::MAX)?;
    let mut args = args.into_iter();
    let name = method_name(vm, &args.next().unwrap_or(Value::Nil))?;
    vm.invoke(receiver.clone(), &name, args.collect(), block)
}

fn kernel_case_equal(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    if receiver.identical(&args[0]) {
        return Ok(Value::True);
    }
    Ok(Value::bool(values_equal(vm, receiver, &args[0])?))
}

fn kernel_eql(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    Ok(Value::bool(*receiver == args[0]))
}

fn kernel_spaceship(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    if receiver.identical(&args[0]) {
        Ok(Value::Integer(0))
    } else {
        Ok(Value::Nil)
    }
}

fn kernel_freeze(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    if let Value::String(s) = receiver {
        s.frozen.set(true);
    }
    Ok(receiver.clone())
}

fn kernel_frozen_p(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(match receiver {
        Value::String(s) => s.frozen.get(),
        Value::Nil | Value::True | Value::False | Value::Integer(_) | Value::Float(_) | Value::Symbol(_) => true,
        Value::Range(_) => true,
        _ => false,
    }))
}

fn kernel_dup(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(match receiver {
        Value::String(s) => Value::string(s.value.borrow().as_str()),
        Value::Array(items) => Value::array(items.borrow().clone()),
        Value::Hash(table) => Value::hash(table.borrow().clone()),
        Value::Object(object) => {
            let copy = Object::new(Rc::clone(&object.class));
            *copy.ivars.borrow_mut() = object.ivars.borrow().clone();
            Value::Object(Rc::new(copy))
        }
        other => other.clone(),
    })
}

fn kernel_tap(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let block = require_block(vm, block)?;
    vm.yield_block(&block, vec![receiver.clone()])?;
    Ok(receiver.clone())
}

fn kernel_then(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let block = require_block(vm, block)?;
    vm.yield_block(&block, vec![receiver.clone()])
}

fn kernel_itself(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(receiver.clone())
}

fn ivar_name(vm: &Vm, value: &Value) -> Result<String, Unwind> {
    let name = method_name(vm, value)?;
    if !name.starts_with('@') || name.starts_with("@@") {
        return Err(vm.raise(
            "NameError",
            format!("'{}' is not allowed as an instance variable name", name),
        ));
    }
    Ok(name)
}

fn kernel_ivar_get(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let name = ivar_name(vm, &args[0])?;
    Ok(match receiver {
        Value::Object(object) => object.get_ivar(&name),
        Value::Class(class) => class.ivars.borrow().get(&name).cloned(),
        _ => None,
    }
    .unwrap_or(Value::Nil))
}

fn kernel_ivar_set(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 2, 2)?;
    let name = ivar_name(vm, &args[0])?;
    vm.ivar_set(receiver, &name, args[1].clone())?;
    Ok(args[1].clone())
}

fn kernel_ivar_defined(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let name = ivar_name(vm, &args[0])?;
    Ok(Value::bool(match receiver {
        Value::Object(object) => object.get_ivar(&name).is_some(),
        Value::Class(class) => class.ivars.borrow().contains_key(&name),
        _ => false,
    }))
}

fn kernel_ivars(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let names: Vec<Value> = match receiver {
        Value::Object(object) => object
            .ivars
            .borrow()
            .iter()
            .filter(|(name, _)| name.starts_with('@'))
            .map(|(name, _)| Value::symbol(name))
            .collect(),
        Value::Class(class) => {
            let mut names: Vec<String> = class.ivars.borrow().keys().cloned().collect();
            names.sort();
            names.iter().map(|name| Value::symbol(name)).collect()
        }
        _ => Vec::new(),
    };
    Ok(Value::array(names))
}

// =============================================================================
// Module and Class
// =============================================================================

fn receiver_class(vm: &Vm, receiver: &Value) -> Result<Rc<Class>, Unwind> {
    match receiver {
        Value::Class(class) => Ok(Rc::clone(class)),
        other => Err(vm.raise("TypeError", format!("{} is not a class/module", other.inspect()))),
    }
}

fn module_name(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let class = receiver_class(vm, receiver)?;
    Ok(Value::string(class.name.as_str()))
}

fn module_case_equal(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let class = receiver_class(vm, receiver)?;
    Ok(Value::bool(vm.is_a(&args[0], &class)))
}

fn module_lt(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let class = receiver_class(vm, receiver)?;
    let other = class_operand(vm, &args[0])?;
    Ok(Value::bool(!Rc::ptr_eq(&class, &other) && is_subclass(&class, &other)))
}

fn module_le(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let class = receiver_class(vm, receiver)?;
    let other = class_operand(vm, &args[0])?;
    Ok(Value::bool(is_subclass(&class, &other)))
}

fn module_ancestors(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let class = receiver_class(vm, receiver)?;
    Ok(Value::array(ancestors(&class).into_iter().map(Value::Class).collect()))
}

fn module_include(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, usize::MAX)?;
    let class = receiver_class(vm, receiver)?;
    for module in &args {
        let module = match module {
            Value::Class(module) if module.is_module => Rc::clone(module),
            other => {
                return Err(vm.raise(
                    "TypeError",
                    format!("wrong argument type {} (expected Module)", class_name(vm, other)),
                ));
            }
        };
        if !is_subclass(&class, &module) {
            class.includes.borrow_mut().push(module);
        }
    }
    Ok(receiver.clone())
}

fn module_include_p(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let class = receiver_class(vm, receiver)?;
    let module = class_operand(vm, &args[0])?;
    Ok(Value::bool(
        module.is_module && !Rc::ptr_eq(&class, &module) && is_subclass(&class, &module),
    ))
}

fn define_attrs(vm: &Vm, receiver: &Value, args: &[Value], reader: bool, writer: bool) -> Outcome {
    let class = receiver_class(vm, receiver)?;
    let mut defined = Vec::new();
    for name in args {
        let name = method_name(vm, name)?;
        let ivar = format!("@{}", name);
        if reader {
            class.define_method(&name, Method::AttrReader(ivar.clone()));
            defined.push(Value::symbol(&name));
        }
        if writer {
            let setter = format!("{}=", name);
            class.define_method(&setter, Method::AttrWriter(ivar));
            defined.push(Value::symbol(&setter));
        }
    }
    Ok(Value::array(defined))
}

fn module_attr_reader(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    define_attrs(vm, receiver, &args, true, false)
}

fn module_attr_writer(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    define_attrs(vm, receiver, &args, false, true)
}

fn module_attr_accessor(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    define_attrs(vm, receiver, &args, true, true)
}

fn module_alias_method(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 2, 2)?;
    let class = receiver_class(vm, receiver)?;
    let new_name = method_name(vm, &args[0])?;
    let old_name = method_name(vm, &args[1])?;
    vm.alias_method(&class, &new_name, &old_name)?;
    Ok(Value::symbol(&new_name))
}

fn module_method_defined(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 2)?;
    let class = receiver_class(vm, receiver)?;
    let name = method_name(vm, &args[0])?;
    let defined = ancestors(&class).iter().any(|ancestor| {
        ancestor.own_method(&name).is_some() || (ancestor.builtin && super::lookup(&ancestor.name, &name).is_some())
    });
    Ok(Value::bool(defined))
}

fn module_const_get(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 2)?;
    let class = receiver_class(vm, receiver)?;
    let path = method_name(vm, &args[0])?;
    let mut current = Value::Class(class);
    for segment in path.split("::").filter(|s| !s.is_empty()) {
        let scope = receiver_class(vm, &current)?;
        current = ancestors(&scope)
            .iter()
            .find_map(|ancestor| ancestor.get_constant(segment))
            .or_else(|| vm.core.object.get_constant(segment))
            .ok_or_else(|| vm.raise("NameError", format!("uninitialized constant {}::{}", scope.name, segment)))?;
    }
    Ok(current)
}

fn module_const_set(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 2, 2)?;
    let class = receiver_class(vm, receiver)?;
    let name = method_name(vm, &args[0])?;
    if !name.starts_with(|c: char| c.is_ascii_uppercase()) {
        return Err(vm.raise("NameError", format!("wrong constant name {}", name)));
    }
    class.set_constant(&name, args[1].clone());
    Ok(args[1].clone())
}

fn module_const_defined(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 2)?;
    let class = receiver_class(vm, receiver)?;
    let name = method_name(vm, &args[0])?;
    let defined = ancestors(&class).iter().any(|ancestor| ancestor.get_constant(&name).is_some());
    Ok(Value::bool(defined))
}

fn module_visibility(_vm: &mut Vm, _receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    Ok(match args.len() {
        0 => Value::Nil,
        1 => args[0].clone(),
        _ => Value::array(args),
    })
}

/// `Class#new`: core value classes build their value directly, everything
/// else allocates an object and runs `initialize`.
fn class_new(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    let class = receiver_class(vm, receiver)?;
    if class.is_module {
        return Err(vm.raise("NoMethodError", format!("undefined method 'new' for module {}", class.name)));
    }
    let base = ancestors(&class)
        .into_iter()
        .find(|ancestor| ancestor.builtin)
        .map(|ancestor| ancestor.name.clone())
        .unwrap_or_default();
    match base.as_str() {
        "Array" => super::collection::array_new(vm, args, block),
        "Hash" => super::collection::hash_new(vm, args, block),
        "String" => {
            check_args(vm, &args, 0, 1)?;
            let text = match args.first() {
                Some(value) => str_arg(vm, value)?,
                None => String::new(),
            };
            Ok(Value::string(text))
        }
        "Range" => {
            check_args(vm, &args, 2, 3)?;
            Ok(Value::range(args[0].clone(), args[1].clone(), arg(&args, 2).is_truthy()))
        }
        "Proc" => kernel_proc(vm, receiver, args, block),
        "Class" => {
            check_args(vm, &args, 0, 1)?;
            let superclass = match args.first() {
                Some(value) => class_operand(vm, value)?,
                None => Rc::clone(&vm.core.object),
            };
            Ok(Value::Class(Rc::new(Class::new("#<Class>", Some(superclass)))))
        }
        "Module" => Ok(Value::Class(Rc::new(Class::module("#<Module>")))),
        "Integer" | "Float" | "Symbol" | "NilClass" | "TrueClass" | "FalseClass" => Err(vm.raise(
            "NoMethodError",
            format!("undefined method 'new' for class {}", class.name),
        )),
        _ => {
            let object = Value::Object(Rc::new(Object::new(class)));
            vm.invoke(object.clone(), "initialize", args, block)?;
            Ok(object)
        }
    }
}

fn class_allocate(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let class = receiver_class(vm, receiver)?;
    Ok(Value::Object(Rc::new(Object::new(class))))
}

fn class_superclass(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let class = receiver_class(vm, receiver)?;
    Ok(class.superclass.clone().map_or(Value::Nil, Value::Class))
}

// =============================================================================
// Comparable
// =============================================================================

fn spaceship(vm: &mut Vm, receiver: &Value, args: &[Value]) -> Result<Ordering, Unwind> {
    check_args(vm, args, 1, 1)?;
    let result = vm.invoke(receiver.clone(), "<=>", vec![args[0].clone()], None)?;
    match result.as_integer() {
        Some(n) => Ok(n.cmp(&0)),
        None => Err(vm.raise(
            "ArgumentError",
            format!("comparison of {} with {} failed", class_name(vm, receiver), class_name(vm, &args[0])),
        )),
    }
}

fn comparable_lt(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(spaceship(vm, receiver, &args)? == Ordering::Less))
}

fn comparable_le(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(spaceship(vm, receiver, &args)? != Ordering::Greater))
}

fn comparable_gt(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(spaceship(vm, receiver, &args)? == Ordering::Greater))
}

fn comparable_ge(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(spaceship(vm, receiver, &args)? != Ordering::Less))
}

fn comparable_eq(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    if receiver.identical(&args[0]) {
        return Ok(Value::True);
    }
    let result = vm.invoke(receiver.clone(), "<=>", vec![args[0].clone()], None)?;
    Ok(Value::bool(result.as_integer() == Some(0)))
}

fn comparable_between(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 2, 2)?;
    let above = compare_or_fail(vm, receiver, &args[0])? != Ordering::Less;
    let below = compare_or_fail(vm, receiver, &args[1])? != Ordering::Greater;
    Ok(Value::bool(above && below))
}

fn comparable_clamp(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    let (low, high) = match args.as_slice() {
        [Value::Range(range)] => (range.start.clone(), range.end.clone()),
        [low, high] => (low.clone(), high.clone()),
        _ => return Err(vm.raise("ArgumentError", "wrong number of arguments (expected 1..2)")),
    };
    if !low.is_nil() && compare_or_fail(vm, receiver, &low)? == Ordering::Less {
        return Ok(low);
    }
    if !high.is_nil() && compare_or_fail(vm, receiver, &high)? == Ordering::Greater {
        return Ok(high);
    }
    Ok(receiver.clone())
}

// =============================================================================
// nil, true, false
// =============================================================================

fn nil_to_s(_vm: &mut Vm, _receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::string(""))
}

fn nil_to_a(_vm: &mut Vm, _receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::array(Vec::new()))
}

fn nil_to_i(_vm: &mut Vm, _receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::Integer(0))
}

fn nil_to_f(_vm: &mut Vm, _receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::Float(0.0))
}

fn nil_inspect(_vm: &mut Vm, _receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::string("nil"))
}

fn false_and(_vm: &mut Vm, _receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::False)
}

fn false_or(_vm: &mut Vm, _receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(arg(&args, 0).is_truthy()))
}

fn true_and(_vm: &mut Vm, _receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(arg(&args, 0).is_truthy()))
}

fn true_or(_vm: &mut Vm, _receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::True)
}

fn true_xor(_vm: &mut Vm, _receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(!arg(&args, 0).is_truthy()))
}

fn bool_to_s(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::string(receiver.to_s()))
}

// =============================================================================
// Proc
// =============================================================================

fn proc_arity(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    match receiver {
        Value::Proc(proc) => Ok(Value::Integer(vm.proc_arity(proc))),
        other => Err(vm.raise("TypeError", format!("{} is not a proc", other.inspect()))),
    }
}

fn proc_lambda_p(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(matches!(receiver, Value::Proc(proc) if proc.lambda)))
}

// =============================================================================
// Exception
// =============================================================================

fn exception_object(vm: &Vm, receiver: &Value) -> Result<Rc<Object>, Unwind> {
    match receiver {
        Value::Object(object) => Ok(Rc::clone(object)),
        other => Err(vm.raise("TypeError", format!("{} is not an exception", other.inspect()))),
    }
}

fn exception_initialize(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 0, 1)?;
    let object = exception_object(vm, receiver)?;
    object.set_ivar(EXCEPTION_MESSAGE, arg(&args, 0));
    Ok(Value::Nil)
}

fn exception_message(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let text = vm.invoke(receiver.clone(), "to_s", Vec::new(), None)?;
    Ok(text)
}

fn exception_to_s(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let object = exception_object(vm, receiver)?;
    match object.get_ivar(EXCEPTION_MESSAGE) {
        Some(message) if !message.is_nil() => Ok(Value::string(vm.stringify(&message)?)),
        _ => Ok(Value::string(object.class.name.as_str())),
    }
}

fn exception_inspect(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let object = exception_object(vm, receiver)?;
    let message = vm.invoke(receiver.clone(), "to_s", Vec::new(), None)?.to_s();
    if message.is_empty() || message == object.class.name {
        return Ok(Value::string(object.class.name.as_str()));
    }
    Ok(Value::string(format!("#<{}: {}>", object.class.name, message)))
}

fn exception_full_message(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let object = exception_object(vm, receiver)?;
    let message = vm.invoke(receiver.clone(), "message", Vec::new(), None)?.to_s();
    Ok(Value::string(format!("{} ({})", message, object.class.name)))
}

fn exception_backtrace(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let object = exception_object(vm, receiver)?;
    Ok(object.get_ivar(EXCEPTION_BACKTRACE).unwrap_or(Value::Nil))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn captured() -> Vm {
        let mut vm = Vm::new();
        vm.capture_output();
        vm
    }

    #[test]
    fn test_puts_flattens_arrays() {
        let mut vm = captured();
        let items = Value::array(vec![Value::Integer(1), Value::array(vec![Value::string("two")])]);
        let result = kernel_puts(&mut vm, &Value::Nil, vec![items], None).ok();
        assert_eq!(result, Some(Value::Nil));
        assert_eq!(vm.take_output(), "1\ntwo\n");

        kernel_puts(&mut vm, &Value::Nil, vec![Value::string("done\n")], None).ok();
        assert_eq!(vm.take_output(), "done\n");
    }

    #[test]
    fn test_p_returns_its_argument() {
        let mut vm = captured();
        let result = kernel_p(&mut vm, &Value::Nil, vec![Value::string("hi")], None).ok();
        assert_eq!(result, Some(Value::string("hi")));
        assert_eq!(vm.take_output(), "\"hi\"\n");

        let many = kernel_p(&mut vm, &Value::Nil, vec![Value::Integer(1), Value::Nil], None).ok();
        assert_eq!(many, Some(Value::array(vec![Value::Integer(1), Value::Nil])));
    }

    #[test]
    fn test_integer_conversion() {
        let mut vm = Vm::new();
        let mut convert = |value: Value| kernel_integer(&mut vm, &Value::Nil, vec![value], None);
        assert_eq!(convert(Value::string(" 1_000 ")).ok(), Some(Value::Integer(1000)));
        assert_eq!(convert(Value::string("0xff")).ok(), Some(Value::Integer(255)));
        assert_eq!(convert(Value::Float(-2.7)).ok(), Some(Value::Integer(-2)));
        assert!(matches!(convert(Value::string("abc")), Err(Unwind::Raise(_))));
        assert!(matches!(convert(Value::Nil), Err(Unwind::Raise(_))));
    }

    #[test]
    fn test_raise_with_message_only_is_runtime_error() {
        let mut vm = Vm::new();
        let Err(Unwind::Raise(exception)) = kernel_raise(&mut vm, &Value::Nil, vec![Value::string("boom")], None)
        else {
            panic!("raise should unwind");
        };
        assert_eq!(vm.class_of(&exception).name, "RuntimeError");
    }

    #[test]
    fn test_raise_rejects_non_exceptions() {
        let mut vm = Vm::new();
        let result = kernel_raise(&mut vm, &Value::Nil, vec![Value::Integer(3)], None);
        let Err(Unwind::Raise(exception)) = result else {
            panic!("raise should unwind");
        };
        assert_eq!(vm.class_of(&exception).name, "TypeError");
    }
}
