use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use crate::runtime::builtins::string::successor;
use crate::runtime::builtins::{
    Builtin, Outcome, arg, check_args, class_name, compare, compare_or_fail, extreme, index_span, int_arg,
    range_span, require_block, sort_values, str_arg, values_equal,
};
use crate::runtime::frame::Proc;
use crate::runtime::runtime_error::Unwind;
use crate::runtime::value::{HashTable, Range, Value};
use crate::runtime::vm::Vm;

type Block = Option<Rc<Proc>>;

pub(super) fn lookup(class: &str, name: &str) -> Option<Builtin> {
    let found: Builtin = match (class, name) {
        ("Array", "[]" | "slice") => array_aref,
        ("Array", "[]=") => array_aset,
        ("Array", "at") => array_at,
        ("Array", "fetch") => array_fetch,
        ("Array", "dig") => array_dig,
        ("Array", "first") => array_first,
        ("Array", "last") => array_last,
        ("Array", "push" | "append") => array_push,
        ("Array", "<<") => array_shovel,
        ("Array", "pop") => array_pop,
        ("Array", "shift") => array_shift,
        ("Array", "unshift" | "prepend") => array_unshift,
        ("Array", "insert") => array_insert,
        ("Array", "concat") => array_concat,
        ("Array", "delete") => array_delete,
        ("Array", "delete_at") => array_delete_at,
        ("Array", "delete_if") => array_delete_if,
        ("Array", "reject!") => array_reject_bang,
        ("Array", "select!" | "filter!" | "keep_if") => array_select_bang,
        ("Array", "map!" | "collect!") => array_map_bang,
        ("Array", "sort!") => array_sort_bang,
        ("Array", "sort_by!") => array_sort_by_bang,
        ("Array", "uniq!") => array_uniq_bang,
        ("Array", "compact!") => array_compact_bang,
        ("Array", "reverse!") => array_reverse_bang,
        ("Array", "flatten!") => array_flatten_bang,
        ("Array", "clear") => array_clear,
        ("Array", "replace") => array_replace,
        ("Array", "fill") => array_fill,
        ("Array", "rotate") => array_rotate,
        ("Array", "+") => array_plus,
        ("Array", "-" | "difference") => array_minus,
        ("Array", "*") => array_times,
        ("Array", "&" | "intersection") => array_and,
        ("Array", "|" | "union") => array_or,
        ("Array", "==") => array_eq,
        ("Array", "<=>") => array_cmp,
        ("Array", "length" | "size") => array_length,
        ("Array", "empty?") => array_empty_p,
        ("Array", "each") => array_each,
        ("Array", "each_index") => array_each_index,
        ("Array", "index" | "find_index") => array_index,
        ("Array", "rindex") => array_rindex,
        ("Array", "reverse") => array_reverse,
        ("Array", "join") => array_join,
        ("Array", "to_a" | "entries") => array_to_a,
        ("Array", "to_s" | "inspect") => collection_inspect,
        ("Array", "uniq") => enum_uniq,
        ("Array", "flatten") => array_flatten,
        ("Array", "compact") => array_compact,
        ("Array", "transpose") => array_transpose,
        ("Array", "with_index" | "each_with_index" | "map_with_index") => array_with_index,
        ("Array", "values_at") => array_values_at,
        ("Array", "product") => array_product,
        ("Array", "count") => array_count,

        ("Hash", "[]") => hash_aref,
        ("Hash", "[]=" | "store") => hash_aset,
        ("Hash", "fetch") => hash_fetch,
        ("Hash", "key?" | "has_key?" | "include?" | "member?") => hash_key_p,
        ("Hash", "value?" | "has_value?") => hash_value_p,
        ("Hash", "key") => hash_key,
        ("Hash", "keys") => hash_keys,
        ("Hash", "values") => hash_values,
        ("Hash", "values_at") => hash_values_at,
        ("Hash", "length" | "size") => hash_length,
        ("Hash", "empty?") => hash_empty_p,
        ("Hash", "each" | "each_pair") => hash_each,
        ("Hash", "each_key") => hash_each_key,
        ("Hash", "each_value") => hash_each_value,
        ("Hash", "delete") => hash_delete,
        ("Hash", "delete_if" | "reject!") => hash_delete_if,
        ("Hash", "keep_if" | "select!" | "filter!") => hash_keep_if,
        ("Hash", "merge") => hash_merge,
        ("Hash", "merge!" | "update") => hash_update,
        ("Hash", "to_h") => hash_to_h,
        ("Hash", "to_s" | "inspect") => collection_inspect,
        ("Hash", "select" | "filter") => hash_select,
        ("Hash", "reject") => hash_reject,
        ("Hash", "transform_values") => hash_transform_values,
        ("Hash", "transform_keys") => hash_transform_keys,
        ("Hash", "slice") => hash_slice,
        ("Hash", "except") => hash_except,
        ("Hash", "compact") => hash_compact,
        ("Hash", "dig") => array_dig,
        ("Hash", "invert") => hash_invert,
        ("Hash", "==") => hash_eq,
        ("Hash", "clear") => hash_clear,
        ("Hash", "default") => hash_default,
        ("Hash", "default=") => hash_set_default,

        ("Range", "each") => range_each,
        ("Range", "first") => range_first,
        ("Range", "last") => range_last,
        ("Range", "begin") => range_begin,
        ("Range", "end") => range_end,
        ("Range", "min") => range_min,
        ("Range", "max") => range_max,
        ("Range", "size") => range_size,
        ("Range", "count") => range_count,
        ("Range", "sum") => range_sum,
        ("Range", "include?" | "member?" | "cover?" | "===") => range_cover_p,
        ("Range", "exclude_end?") => range_exclude_end_p,
        ("Range", "step" | "%") => range_step,
        ("Range", "to_a" | "to_ary" | "entries") => enum_to_a,
        ("Range", "to_s") => range_to_s,
        ("Range", "inspect") => range_inspect,
        ("Range", "==" | "eql?") => range_eq,

        ("Enumerable", "each_with_index") => enum_each_with_index,
        ("Enumerable", "each_slice") => enum_each_slice,
        ("Enumerable", "each_cons") => enum_each_cons,
        ("Enumerable", "each_with_object") => enum_each_with_object,
        ("Enumerable", "reverse_each") => enum_reverse_each,
        ("Enumerable", "map" | "collect") => enum_map,
        ("Enumerable", "flat_map" | "collect_concat") => enum_flat_map,
        ("Enumerable", "select" | "filter" | "find_all") => enum_select,
        ("Enumerable", "reject") => enum_reject,
        ("Enumerable", "filter_map") => enum_filter_map,
        ("Enumerable", "find" | "detect") => enum_find,
        ("Enumerable", "find_index") => enum_find_index,
        ("Enumerable", "partition") => enum_partition,
        ("Enumerable", "group_by") => enum_group_by,
        ("Enumerable", "reduce" | "inject") => enum_reduce,
        ("Enumerable", "sum") => enum_sum,
        ("Enumerable", "count") => enum_count,
        ("Enumerable", "tally") => enum_tally,
        ("Enumerable", "min") => enum_min,
        ("Enumerable", "max") => enum_max,
        ("Enumerable", "minmax") => enum_minmax,
        ("Enumerable", "min_by") => enum_min_by,
        ("Enumerable", "max_by") => enum_max_by,
        ("Enumerable", "sort") => enum_sort,
        ("Enumerable", "sort_by") => enum_sort_by,
        ("Enumerable", "take") => enum_take,
        ("Enumerable", "drop") => enum_drop,
        ("Enumerable", "take_while") => enum_take_while,
        ("Enumerable", "drop_while") => enum_drop_while,
        ("Enumerable", "first") => enum_first,
        ("Enumerable", "zip") => enum_zip,
        ("Enumerable", "uniq") => enum_uniq,
        ("Enumerable", "include?" | "member?") => enum_include_p,
        ("Enumerable", "any?") => enum_any_p,
        ("Enumerable", "all?") => enum_all_p,
        ("Enumerable", "none?") => enum_none_p,
        ("Enumerable", "one?") => enum_one_p,
        ("Enumerable", "to_a" | "entries") => enum_to_a,
        ("Enumerable", "to_h") => enum_to_h,
        _ => return None,
    };
    Some(found)
}

// =============================================================================
// Element access
// =============================================================================

fn pair(key: Value, value: Value) -> Value {
    Value::array(vec![key, value])
}

fn array_of(vm: &Vm, receiver: &Value) -> Result<Rc<RefCell<Vec<Value>>>, Unwind> {
    match receiver {
        Value::Array(items) => Ok(Rc::clone(items)),
        other => Err(vm.raise(
            "TypeError",
            format!("no implicit conversion of {} into Array", class_name(vm, other)),
        )),
    }
}

fn items_of(vm: &Vm, receiver: &Value) -> Result<Vec<Value>, Unwind> {
    Ok(array_of(vm, receiver)?.borrow().clone())
}

fn table_of(vm: &Vm, receiver: &Value) -> Result<Rc<RefCell<HashTable>>, Unwind> {
    match receiver {
        Value::Hash(table) => Ok(Rc::clone(table)),
        other => Err(vm.raise(
            "TypeError",
            format!("no implicit conversion of {} into Hash", class_name(vm, other)),
        )),
    }
}

fn range_of(vm: &Vm, receiver: &Value) -> Result<Rc<Range>, Unwind> {
    match receiver {
        Value::Range(range) => Ok(Rc::clone(range)),
        other => Err(vm.raise("TypeError", format!("{} is not a range", other.inspect()))),
    }
}

/// Last integer a range reaches; `None` when it is endless.
fn integer_last(vm: &Vm, range: &Range) -> Result<Option<i64>, Unwind> {
    match &range.end {
        Value::Nil => Ok(None),
        Value::Integer(end) if range.exclusive => Ok(Some(end.saturating_sub(1))),
        Value::Integer(end) => Ok(Some(*end)),
        Value::Float(end) if range.exclusive && end.fract() == 0.0 => Ok(Some(*end as i64 - 1)),
        Value::Float(end) => Ok(Some(end.floor() as i64)),
        other => Err(vm.raise("TypeError", format!("can't iterate from {}", class_name(vm, other)))),
    }
}

/// Visit each member of a range in order until `visit` returns false.
fn walk_range(
    vm: &mut Vm,
    range: &Range,
    mut visit: impl FnMut(&mut Vm, Value) -> Result<bool, Unwind>,
) -> Result<(), Unwind> {
    match (&range.start, &range.end) {
        (Value::Integer(start), _) => {
            let last = integer_last(vm, range)?;
            let mut i = *start;
            while last.is_none_or(|last| i <= last) {
                if !visit(vm, Value::Integer(i))? {
                    break;
                }
                match i.checked_add(1) {
                    Some(next) => i = next,
                    None => break,
                }
            }
            Ok(())
        }
        (Value::String(start), Value::String(end)) => {
            let end = end.value.borrow().clone();
            let end_len = end.chars().count();
            let mut current = start.value.borrow().clone();
            loop {
                let len = current.chars().count();
                if len > end_len || (len == end_len && current > end) {
                    break;
                }
                let at_end = current == end;
                if at_end && range.exclusive {
                    break;
                }
                if !visit(vm, Value::string(current.as_str()))? || at_end {
                    break;
                }
                current = successor(&current);
            }
            Ok(())
        }
        (start, _) => Err(vm.raise(
            "TypeError",
            format!("can't iterate from {}", class_name(vm, start)),
        )),
    }
}

/// Visit the elements of an enumerable receiver: array items, hash
/// `[key, value]` pairs, or range members.
fn each_element(
    vm: &mut Vm,
    receiver: &Value,
    mut visit: impl FnMut(&mut Vm, Value) -> Result<bool, Unwind>,
) -> Result<(), Unwind> {
    match receiver {
        Value::Array(items) => {
            let mut index = 0;
            loop {
                let item = items.borrow().get(index).cloned();
                let Some(item) = item else {
                    return Ok(());
                };
                if !visit(vm, item)? {
                    return Ok(());
                }
                index += 1;
            }
        }
        Value::Hash(table) => {
            let pairs: Vec<Value> = table.borrow().iter().map(|(k, v)| pair(k.clone(), v.clone())).collect();
            for item in pairs {
                if !visit(vm, item)? {
                    break;
                }
            }
            Ok(())
        }
        Value::Range(range) => {
            let range = Rc::clone(range);
            walk_range(vm, &range, visit)
        }
        other => Err(vm.raise(
            "TypeError",
            format!("can't iterate {}", class_name(vm, other)),
        )),
    }
}

/// All elements at once; endless ranges refuse.
fn elements(vm: &mut Vm, receiver: &Value) -> Result<Vec<Value>, Unwind> {
    match receiver {
        Value::Array(items) => Ok(items.borrow().clone()),
        Value::Range(range) if range.end.is_nil() => {
            Err(vm.raise("RangeError", "cannot convert endless range to an array"))
        }
        _ => {
            let mut out = Vec::new();
            each_element(vm, receiver, |_, item| {
                out.push(item);
                Ok(true)
            })?;
            Ok(out)
        }
    }
}

fn yield_one(vm: &mut Vm, block: &Rc<Proc>, item: Value) -> Outcome {
    vm.yield_block(block, vec![item])
}

/// Element test shared by `any?`, `all?`, `none?`, `one?`: a `===`
/// pattern, the block, or plain truthiness.
fn element_test(vm: &mut Vm, pattern: Option<&Value>, block: Option<&Rc<Proc>>, item: Value) -> Result<bool, Unwind> {
    match (pattern, block) {
        (Some(pattern), _) => Ok(vm.invoke(pattern.clone(), "===", vec![item], None)?.is_truthy()),
        (None, Some(block)) => Ok(yield_one(vm, block, item)?.is_truthy()),
        (None, None) => Ok(item.is_truthy()),
    }
}

fn count_arg(vm: &Vm, value: &Value, what: &str) -> Result<usize, Unwind> {
    let n = int_arg(vm, value)?;
    usize::try_from(n).map_err(|_| vm.raise("ArgumentError", format!("attempt to {} negative size", what)))
}

fn index_value(items: &[Value], index: i64) -> Value {
    let index = if index < 0 { index + items.len() as i64 } else { index };
    usize::try_from(index)
        .ok()
        .and_then(|i| items.get(i))
        .cloned()
        .unwrap_or(Value::Nil)
}

fn first_of(value: &Value) -> Value {
    match value {
        Value::Array(items) => items.borrow().first().cloned().unwrap_or(Value::Nil),
        _ => Value::Nil,
    }
}

fn second_of(value: &Value) -> Value {
    match value {
        Value::Array(items) => items.borrow().get(1).cloned().unwrap_or(Value::Nil),
        _ => Value::Nil,
    }
}

fn contains(vm: &mut Vm, items: &[Value], target: &Value) -> Result<bool, Unwind> {
    for item in items {
        if values_equal(vm, item, target)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn dedup(items: Vec<Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

fn collection_inspect(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::string(vm.inspect(receiver)?))
}

/// `dig` through nested arrays and hashes.
fn array_dig(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, usize::MAX)?;
    let mut current = receiver.clone();
    for key in &args {
        current = match &current {
            Value::Nil => return Ok(Value::Nil),
            Value::Array(items) => index_value(&items.borrow(), int_arg(vm, key)?),
            Value::Hash(_) => hash_lookup(vm, &current, key)?,
            other => vm.invoke(other.clone(), "dig", vec![key.clone()], None)?,
        };
    }
    Ok(current)
}

// =============================================================================
// Array
// =============================================================================

/// `Array.new(size = 0, default = nil)` or `Array.new(size) { |i| }`.
pub(super) fn array_new(vm: &mut Vm, args: Vec<Value>, block: Block) -> Outcome {
    check_args(vm, &args, 0, 2)?;
    if let [Value::Array(items)] = args.as_slice() {
        return Ok(Value::array(items.borrow().clone()));
    }
    let size = match args.first() {
        Some(value) => usize::try_from(int_arg(vm, value)?).map_err(|_| vm.raise("ArgumentError", "negative array size"))?,
        None => 0,
    };
    let mut items = Vec::with_capacity(size);
    for i in 0..size {
        items.push(match &block {
            Some(block) => yield_one(vm, block, Value::Integer(i as i64))?,
            None => arg(&args, 1),
        });
    }
    Ok(Value::array(items))
}

fn array_aref(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 2)?;
    let items = items_of(vm, receiver)?;
    let span = match (&args[0], args.get(1)) {
        (Value::Integer(index), None) => return Ok(index_value(&items, *index)),
        (Value::Range(range), None) => range_span(vm, range, items.len())?,
        (start, Some(count)) => index_span(int_arg(vm, start)?, int_arg(vm, count)?, items.len()),
        (other, None) => return Ok(index_value(&items, int_arg(vm, other)?)),
    };
    Ok(span.map_or(Value::Nil, |(start, count)| Value::array(items[start..start + count].to_vec())))
}

/// `[]=`: single index (padding with nil past the end), or a span
/// replaced by the items of an array value.
fn array_aset(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 2, 3)?;
    let array = array_of(vm, receiver)?;
    let len = array.borrow().len() as i64;
    let value = args[args.len() - 1].clone();
    let (start, count) = match (&args[0], args.len()) {
        (Value::Range(range), 2) => {
            let start = match &range.start {
                Value::Nil => 0,
                bound => int_arg(vm, bound)?,
            };
            let start = if start < 0 { start + len } else { start };
            let end = match &range.end {
                Value::Nil => len,
                bound => {
                    let end = int_arg(vm, bound)?;
                    let end = if end < 0 { end + len } else { end };
                    if range.exclusive { end } else { end + 1 }
                }
            };
            (start, (end - start).max(0))
        }
        (index, 2) => {
            let given = int_arg(vm, index)?;
            let index = if given < 0 { given + len } else { given };
            if index < 0 {
                return Err(vm.raise(
                    "IndexError",
                    format!("index {} too small for array; minimum: -{}", given, len),
                ));
            }
            let index = index as usize;
            let mut items = array.borrow_mut();
            if index >= items.len() {
                items.resize(index + 1, Value::Nil);
            }
            items[index] = value.clone();
            return Ok(value);
        }
        (start, _) => {
            let given = int_arg(vm, start)?;
            (if given < 0 { given + len } else { given }, int_arg(vm, &args[1])?)
        }
    };
    if start < 0 {
        return Err(vm.raise("IndexError", format!("index {} too small for array", start - len)));
    }
    if count < 0 {
        return Err(vm.raise("IndexError", format!("negative length ({})", count)));
    }
    let replacement = match &value {
        Value::Array(items) => items.borrow().clone(),
        other => vec![other.clone()],
    };
    let start = start as usize;
    let mut items = array.borrow_mut();
    if start > items.len() {
        items.resize(start, Value::Nil);
    }
    let end = (start + count as usize).min(items.len());
    items.splice(start..end, replacement);
    Ok(value)
}

fn array_at(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let index = int_arg(vm, &args[0])?;
    Ok(index_value(&items_of(vm, receiver)?, index))
}

fn array_fetch(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    check_args(vm, &args, 1, 2)?;
    let items = items_of(vm, receiver)?;
    let given = int_arg(vm, &args[0])?;
    let len = items.len() as i64;
    let index = if given < 0 { given + len } else { given };
    if let Some(item) = usize::try_from(index).ok().and_then(|i| items.get(i)) {
        return Ok(item.clone());
    }
    match (&block, args.get(1)) {
        (Some(block), _) => yield_one(vm, block, args[0].clone()),
        (None, Some(default)) => Ok(default.clone()),
        (None, None) => Err(vm.raise(
            "IndexError",
            format!("index {} outside of array bounds: {}...{}", given, -len, len),
        )),
    }
}

fn take_end(vm: &Vm, items: &[Value], args: &[Value], from_front: bool) -> Outcome {
    check_args(vm, args, 0, 1)?;
    match args.first() {
        None => Ok(if from_front { items.first() } else { items.last() }
            .cloned()
            .unwrap_or(Value::Nil)),
        Some(n) => {
            let n = usize::try_from(int_arg(vm, n)?).map_err(|_| vm.raise("ArgumentError", "negative array size"))?;
            let n = n.min(items.len());
            let slice = if from_front { &items[..n] } else { &items[items.len() - n..] };
            Ok(Value::array(slice.to_vec()))
        }
    }
}

fn array_first(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    take_end(vm, &items_of(vm, receiver)?, &args, true)
}

fn array_last(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    take_end(vm, &items_of(vm, receiver)?, &args, false)
}

fn array_push(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    array_of(vm, receiver)?.borrow_mut().extend(args);
    Ok(receiver.clone())
}

fn array_shovel(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    array_push(vm, receiver, args, None)
}

fn remove_end(vm: &Vm, receiver: &Value, args: &[Value], from_front: bool) -> Outcome {
    check_args(vm, args, 0, 1)?;
    let array = array_of(vm, receiver)?;
    let mut items = array.borrow_mut();
    match args.first() {
        None if from_front => Ok(if items.is_empty() { Value::Nil } else { items.remove(0) }),
        None => Ok(items.pop().unwrap_or(Value::Nil)),
        Some(n) => {
            let n = usize::try_from(int_arg(vm, n)?).map_err(|_| vm.raise("ArgumentError", "negative array size"))?;
            let n = n.min(items.len());
            let removed: Vec<Value> = if from_front {
                items.drain(..n).collect()
            } else {
                let at = items.len() - n;
                items.drain(at..).collect()
            };
            Ok(Value::array(removed))
        }
    }
}

fn array_pop(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    remove_end(vm, receiver, &args, false)
}

fn array_shift(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    remove_end(vm, receiver, &args, true)
}

fn array_unshift(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    let array = array_of(vm, receiver)?;
    array.borrow_mut().splice(0..0, args);
    Ok(receiver.clone())
}

fn array_insert(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, usize::MAX)?;
    let array = array_of(vm, receiver)?;
    let len = array.borrow().len() as i64;
    let given = int_arg(vm, &args[0])?;
    let index = if given < 0 { given + len + 1 } else { given };
    if index < 0 {
        return Err(vm.raise(
            "IndexError",
            format!("index {} too small for array; minimum: -{}", given, len + 1),
        ));
    }
    let index = index as usize;
    let mut items = array.borrow_mut();
    if index > items.len() {
        items.resize(index, Value::Nil);
    }
    items.splice(index..index, args[1..].iter().cloned());
    drop(items);
    Ok(receiver.clone())
}

fn array_concat(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    let mut extra = Vec::new();
    for value in &args {
        extra.extend(items_of(vm, value)?);
    }
    array_of(vm, receiver)?.borrow_mut().extend(extra);
    Ok(receiver.clone())
}

/// Keep the items whose flag is true; returns how many were dropped.
fn retain_flags(array: &RefCell<Vec<Value>>, snapshot: Vec<Value>, flags: &[bool]) -> usize {
    let kept: Vec<Value> = snapshot
        .into_iter()
        .zip(flags)
        .filter(|(_, keep)| **keep)
        .map(|(item, _)| item)
        .collect();
    let dropped = flags.len() - kept.len();
    *array.borrow_mut() = kept;
    dropped
}

fn array_delete(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let array = array_of(vm, receiver)?;
    let snapshot = array.borrow().clone();
    let mut flags = Vec::with_capacity(snapshot.len());
    let mut found = None;
    for item in &snapshot {
        let equal = values_equal(vm, item, &args[0])?;
        if equal {
            found = Some(item.clone());
        }
        flags.push(!equal);
    }
    retain_flags(&array, snapshot, &flags);
    match (found, block) {
        (Some(item), _) => Ok(item),
        (None, Some(block)) => yield_one(vm, &block, args[0].clone()),
        (None, None) => Ok(Value::Nil),
    }
}

fn array_delete_at(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let array = array_of(vm, receiver)?;
    let len = array.borrow().len() as i64;
    let given = int_arg(vm, &args[0])?;
    let index = if given < 0 { given + len } else { given };
    if index < 0 || index >= len {
        return Ok(Value::Nil);
    }
    Ok(array.borrow_mut().remove(index as usize))
}

/// Evaluate the block on each item; `keep_truthy` selects which answers
/// survive. Returns the number removed.
fn filter_in_place(vm: &mut Vm, receiver: &Value, block: Block, keep_truthy: bool) -> Result<usize, Unwind> {
    let block = require_block(vm, block)?;
    let array = array_of(vm, receiver)?;
    let snapshot = array.borrow().clone();
    let mut flags = Vec::with_capacity(snapshot.len());
    for item in &snapshot {
        flags.push(yield_one(vm, &block, item.clone())?.is_truthy() == keep_truthy);
    }
    Ok(retain_flags(&array, snapshot, &flags))
}

fn array_delete_if(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    filter_in_place(vm, receiver, block, false)?;
    Ok(receiver.clone())
}

fn array_reject_bang(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let removed = filter_in_place(vm, receiver, block, false)?;
    Ok(if removed == 0 { Value::Nil } else { receiver.clone() })
}

fn array_select_bang(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    filter_in_place(vm, receiver, block, true)?;
    Ok(receiver.clone())
}

fn array_map_bang(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let block = require_block(vm, block)?;
    let array = array_of(vm, receiver)?;
    let snapshot = array.borrow().clone();
    let mut mapped = Vec::with_capacity(snapshot.len());
    for item in snapshot {
        mapped.push(yield_one(vm, &block, item)?);
    }
    *array.borrow_mut() = mapped;
    Ok(receiver.clone())
}

fn replace_items(vm: &Vm, receiver: &Value, result: &Value) -> Outcome {
    let items = items_of(vm, result)?;
    *array_of(vm, receiver)?.borrow_mut() = items;
    Ok(receiver.clone())
}

fn array_sort_bang(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    let sorted = enum_sort(vm, receiver, args, block)?;
    replace_items(vm, receiver, &sorted)
}

fn array_sort_by_bang(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    let sorted = enum_sort_by(vm, receiver, args, block)?;
    replace_items(vm, receiver, &sorted)
}

fn array_uniq_bang(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    let before = items_of(vm, receiver)?.len();
    let unique = enum_uniq(vm, receiver, args, block)?;
    replace_items(vm, receiver, &unique)?;
    Ok(if items_of(vm, receiver)?.len() == before { Value::Nil } else { receiver.clone() })
}

fn array_compact_bang(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let array = array_of(vm, receiver)?;
    let before = array.borrow().len();
    array.borrow_mut().retain(|item| !item.is_nil());
    Ok(if array.borrow().len() == before { Value::Nil } else { receiver.clone() })
}

fn array_reverse_bang(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    array_of(vm, receiver)?.borrow_mut().reverse();
    Ok(receiver.clone())
}

fn array_flatten_bang(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    let flat = array_flatten(vm, receiver, args, block)?;
    replace_items(vm, receiver, &flat)
}

fn array_clear(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    array_of(vm, receiver)?.borrow_mut().clear();
    Ok(receiver.clone())
}

fn array_replace(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    replace_items(vm, receiver, &args[0])
}

fn array_fill(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    let array = array_of(vm, receiver)?;
    let len = array.borrow().len();
    match block {
        Some(block) => {
            check_args(vm, &args, 0, 0)?;
            for i in 0..len {
                let value = yield_one(vm, &block, Value::Integer(i as i64))?;
                if let Some(slot) = array.borrow_mut().get_mut(i) {
                    *slot = value;
                }
            }
        }
        None => {
            check_args(vm, &args, 1, 1)?;
            array.borrow_mut().iter_mut().for_each(|slot| *slot = args[0].clone());
        }
    }
    Ok(receiver.clone())
}

fn array_rotate(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 0, 1)?;
    let mut items = items_of(vm, receiver)?;
    let by = match args.first() {
        Some(value) => int_arg(vm, value)?,
        None => 1,
    };
    if !items.is_empty() {
        let shift = by.rem_euclid(items.len() as i64) as usize;
        items.rotate_left(shift);
    }
    Ok(Value::array(items))
}

fn array_plus(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let mut items = items_of(vm, receiver)?;
    items.extend(items_of(vm, &args[0])?);
    Ok(Value::array(items))
}

fn array_minus(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let other = items_of(vm, &args[0])?;
    let items = items_of(vm, receiver)?;
    Ok(Value::array(items.into_iter().filter(|item| !other.contains(item)).collect()))
}

fn array_times(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    if let Value::String(_) = &args[0] {
        return array_join(vm, receiver, args, None);
    }
    let count = usize::try_from(int_arg(vm, &args[0])?).map_err(|_| vm.raise("ArgumentError", "negative argument"))?;
    let items = items_of(vm, receiver)?;
    Ok(Value::array((0..count).flat_map(|_| items.iter().cloned()).collect()))
}

fn array_and(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let other = items_of(vm, &args[0])?;
    let items = items_of(vm, receiver)?;
    Ok(Value::array(dedup(items.into_iter().filter(|item| other.contains(item)).collect())))
}

fn array_or(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    let mut items = items_of(vm, receiver)?;
    for value in &args {
        items.extend(items_of(vm, value)?);
    }
    Ok(Value::array(dedup(items)))
}

fn array_eq(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    if !matches!(args[0], Value::Array(_)) {
        return Ok(Value::False);
    }
    Ok(Value::bool(values_equal(vm, receiver, &args[0])?))
}

fn array_cmp(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    if !matches!(args[0], Value::Array(_)) {
        return Ok(Value::Nil);
    }
    Ok(compare(vm, receiver, &args[0])?.map_or(Value::Nil, |order| Value::Integer(order as i64)))
}

fn array_length(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::Integer(array_of(vm, receiver)?.borrow().len() as i64))
}

fn array_empty_p(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(array_of(vm, receiver)?.borrow().is_empty()))
}

fn array_count(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    if args.is_empty() && block.is_none() {
        return array_length(vm, receiver, args, block);
    }
    enum_count(vm, receiver, args, block)
}

/// Iterates by index so items appended during the walk are visited.
fn array_each(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let Some(block) = block else {
        return Ok(receiver.clone());
    };
    each_element(vm, receiver, |vm, item| {
        yield_one(vm, &block, item)?;
        Ok(true)
    })?;
    Ok(receiver.clone())
}

fn array_each_index(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let block = require_block(vm, block)?;
    let len = array_of(vm, receiver)?.borrow().len();
    for i in 0..len {
        yield_one(vm, &block, Value::Integer(i as i64))?;
    }
    Ok(receiver.clone())
}

fn position(
    vm: &mut Vm,
    items: impl Iterator<Item = (usize, Value)>,
    args: &[Value],
    block: Option<&Rc<Proc>>,
) -> Outcome {
    check_args(vm, args, 0, 1)?;
    for (index, item) in items {
        let hit = match (args.first(), block) {
            (Some(target), _) => values_equal(vm, &item, target)?,
            (None, Some(block)) => yield_one(vm, block, item)?.is_truthy(),
            (None, None) => return Ok(Value::Nil),
        };
        if hit {
            return Ok(Value::Integer(index as i64));
        }
    }
    Ok(Value::Nil)
}

fn array_index(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    let items = items_of(vm, receiver)?;
    position(vm, items.into_iter().enumerate(), &args, block.as_ref())
}

fn array_rindex(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    let items = items_of(vm, receiver)?;
    position(vm, items.into_iter().enumerate().rev(), &args, block.as_ref())
}

fn array_reverse(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let mut items = items_of(vm, receiver)?;
    items.reverse();
    Ok(Value::array(items))
}

fn join_into(vm: &mut Vm, items: &[Value], separator: &str, out: &mut String, depth: usize) -> Result<(), Unwind> {
    if depth > 64 {
        return Err(vm.raise("ArgumentError", "recursive array join"));
    }
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(separator);
        }
        match item {
            Value::Array(nested) => {
                let nested = nested.borrow().clone();
                join_into(vm, &nested, separator, out, depth + 1)?;
            }
            other => out.push_str(&vm.stringify(other)?),
        }
    }
    Ok(())
}

fn array_join(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 0, 1)?;
    let separator = match args.first() {
        Some(Value::Nil) | None => String::new(),
        Some(value) => str_arg(vm, value)?,
    };
    let items = items_of(vm, receiver)?;
    let mut out = String::new();
    join_into(vm, &items, &separator, &mut out, 0)?;
    Ok(Value::string(out))
}

fn array_to_a(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(receiver.clone())
}

fn flatten_into(items: &[Value], depth: i64, out: &mut Vec<Value>) {
    for item in items {
        match item {
            Value::Array(nested) if depth != 0 => flatten_into(&nested.borrow(), depth - 1, out),
            other => out.push(other.clone()),
        }
    }
}

fn array_flatten(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 0, 1)?;
    let depth = match args.first() {
        Some(Value::Nil) | None => -1,
        Some(value) => int_arg(vm, value)?,
    };
    let items = items_of(vm, receiver)?;
    let mut out = Vec::new();
    flatten_into(&items, depth, &mut out);
    Ok(Value::array(out))
}

fn array_compact(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let items = items_of(vm, receiver)?;
    Ok(Value::array(items.into_iter().filter(|item| !item.is_nil()).collect()))
}

fn array_transpose(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let rows = items_of(vm, receiver)?
        .iter()
        .map(|row| items_of(vm, row))
        .collect::<Result<Vec<_>, _>>()?;
    let width = rows.first().map_or(0, Vec::len);
    if let Some(row) = rows.iter().find(|row| row.len() != width) {
        return Err(vm.raise(
            "IndexError",
            format!("element size differs ({} should be {})", row.len(), width),
        ));
    }
    let columns = (0..width)
        .map(|column| Value::array(rows.iter().map(|row| row[column].clone()).collect()))
        .collect();
    Ok(Value::array(columns))
}

/// `with_index(offset = 0) { |item, i| }`: maps with a running index.
fn array_with_index(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    check_args(vm, &args, 0, 1)?;
    let offset = match args.first() {
        Some(value) => int_arg(vm, value)?,
        None => 0,
    };
    let items = items_of(vm, receiver)?;
    let Some(block) = block else {
        let pairs = items
            .into_iter()
            .enumerate()
            .map(|(i, item)| pair(item, Value::Integer(i as i64 + offset)))
            .collect();
        return Ok(Value::array(pairs));
    };
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        out.push(vm.yield_block(&block, vec![item, Value::Integer(i as i64 + offset)])?);
    }
    Ok(Value::array(out))
}

fn array_values_at(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    let items = items_of(vm, receiver)?;
    let mut out = Vec::with_capacity(args.len());
    for index in &args {
        out.push(index_value(&items, int_arg(vm, index)?));
    }
    Ok(Value::array(out))
}

fn array_product(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    let mut combos: Vec<Vec<Value>> = items_of(vm, receiver)?.into_iter().map(|item| vec![item]).collect();
    for other in &args {
        let other = items_of(vm, other)?;
        combos = combos
            .into_iter()
            .flat_map(|combo| {
                other.iter().map(move |item| {
                    let mut next = combo.clone();
                    next.push(item.clone());
                    next
                })
            })
            .collect();
    }
    Ok(Value::array(combos.into_iter().map(Value::array).collect()))
}

// =============================================================================
// Hash
// =============================================================================

/// `Hash.new(default = nil)` or `Hash.new { |hash, key| }`.
pub(super) fn hash_new(vm: &mut Vm, args: Vec<Value>, block: Block) -> Outcome {
    check_args(vm, &args, 0, 1)?;
    let mut table = HashTable::new();
    table.default = args.into_iter().next();
    table.default_proc = block;
    Ok(Value::hash(table))
}

/// Value for `key`, falling back to the default block or value.
fn hash_lookup(vm: &mut Vm, receiver: &Value, key: &Value) -> Outcome {
    let table = table_of(vm, receiver)?;
    let (found, default, default_proc) = {
        let table = table.borrow();
        (table.get(key).cloned(), table.default.clone(), table.default_proc.clone())
    };
    match (found, default_proc) {
        (Some(value), _) => Ok(value),
        (None, Some(proc)) => vm.yield_block(&proc, vec![receiver.clone(), key.clone()]),
        (None, None) => Ok(default.unwrap_or(Value::Nil)),
    }
}

fn hash_aref(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    hash_lookup(vm, receiver, &args[0])
}

/// String keys are copied and frozen so later edits to the caller's
/// string leave the table intact.
fn hash_key_value(key: &Value) -> Value {
    match key {
        Value::String(s) if !s.frozen.get() => Value::frozen_string(s.value.borrow().as_str()),
        other => other.clone(),
    }
}

fn hash_aset(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 2, 2)?;
    let table = table_of(vm, receiver)?;
    table.borrow_mut().insert(hash_key_value(&args[0]), args[1].clone());
    Ok(args[1].clone())
}

fn hash_fetch(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    check_args(vm, &args, 1, 2)?;
    let found = table_of(vm, receiver)?.borrow().get(&args[0]).cloned();
    match (found, &block, args.get(1)) {
        (Some(value), _, _) => Ok(value),
        (None, Some(block), _) => yield_one(vm, block, args[0].clone()),
        (None, None, Some(default)) => Ok(default.clone()),
        (None, None, None) => {
            let key = vm.inspect(&args[0])?;
            Err(vm.raise("KeyError", format!("key not found: {}", key)))
        }
    }
}

fn hash_key_p(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    Ok(Value::bool(table_of(vm, receiver)?.borrow().contains_key(&args[0])))
}

fn hash_value_p(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let values = table_of(vm, receiver)?.borrow().values();
    Ok(Value::bool(contains(vm, &values, &args[0])?))
}

fn hash_key(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let pairs: Vec<(Value, Value)> = table_of(vm, receiver)?.borrow().iter().cloned().collect();
    for (key, value) in pairs {
        if values_equal(vm, &value, &args[0])? {
            return Ok(key);
        }
    }
    Ok(Value::Nil)
}

fn hash_keys(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::array(table_of(vm, receiver)?.borrow().keys()))
}

fn hash_values(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::array(table_of(vm, receiver)?.borrow().values()))
}

fn hash_values_at(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    let mut out = Vec::with_capacity(args.len());
    for key in &args {
        out.push(hash_lookup(vm, receiver, key)?);
    }
    Ok(Value::array(out))
}

fn hash_length(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::Integer(table_of(vm, receiver)?.borrow().len() as i64))
}

fn hash_empty_p(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(table_of(vm, receiver)?.borrow().is_empty()))
}

fn entries_of(vm: &Vm, receiver: &Value) -> Result<Vec<(Value, Value)>, Unwind> {
    Ok(table_of(vm, receiver)?.borrow().iter().cloned().collect())
}

fn hash_each(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let block = require_block(vm, block)?;
    for (key, value) in entries_of(vm, receiver)? {
        yield_one(vm, &block, pair(key, value))?;
    }
    Ok(receiver.clone())
}

fn hash_each_key(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let block = require_block(vm, block)?;
    for (key, _) in entries_of(vm, receiver)? {
        yield_one(vm, &block, key)?;
    }
    Ok(receiver.clone())
}

fn hash_each_value(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let block = require_block(vm, block)?;
    for (_, value) in entries_of(vm, receiver)? {
        yield_one(vm, &block, value)?;
    }
    Ok(receiver.clone())
}

fn hash_delete(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let removed = table_of(vm, receiver)?.borrow_mut().remove(&args[0]);
    match (removed, block) {
        (Some(value), _) => Ok(value),
        (None, Some(block)) => yield_one(vm, &block, args[0].clone()),
        (None, None) => Ok(Value::Nil),
    }
}

/// Entries the block (called with key and value) answers `keep_truthy` for.
fn filter_entries(
    vm: &mut Vm,
    receiver: &Value,
    block: Block,
    keep_truthy: bool,
) -> Result<Vec<(Value, Value)>, Unwind> {
    let block = require_block(vm, block)?;
    let mut kept = Vec::new();
    for (key, value) in entries_of(vm, receiver)? {
        let answer = vm.yield_block(&block, vec![key.clone(), value.clone()])?;
        if answer.is_truthy() == keep_truthy {
            kept.push((key, value));
        }
    }
    Ok(kept)
}

fn replace_entries(vm: &Vm, receiver: &Value, entries: Vec<(Value, Value)>) -> Outcome {
    let table = table_of(vm, receiver)?;
    let mut table = table.borrow_mut();
    table.clear();
    for (key, value) in entries {
        table.insert(key, value);
    }
    Ok(receiver.clone())
}

fn hash_delete_if(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let kept = filter_entries(vm, receiver, block, false)?;
    replace_entries(vm, receiver, kept)
}

fn hash_keep_if(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let kept = filter_entries(vm, receiver, block, true)?;
    replace_entries(vm, receiver, kept)
}

fn hash_select(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    Ok(Value::hash(filter_entries(vm, receiver, block, true)?.into_iter().collect()))
}

fn hash_reject(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    Ok(Value::hash(filter_entries(vm, receiver, block, false)?.into_iter().collect()))
}

/// Insert `others` into `table`; the block settles keys present in both.
fn merge_into(vm: &mut Vm, table: &Rc<RefCell<HashTable>>, others: &[Value], block: Option<&Rc<Proc>>) -> Result<(), Unwind> {
    for other in others {
        for (key, value) in entries_of(vm, other)? {
            let existing = table.borrow().get(&key).cloned();
            let merged = match (existing, block) {
                (Some(old), Some(block)) => vm.yield_block(block, vec![key.clone(), old, value])?,
                _ => value,
            };
            table.borrow_mut().insert(key, merged);
        }
    }
    Ok(())
}

fn hash_merge(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    let copy = Rc::new(RefCell::new(table_of(vm, receiver)?.borrow().clone()));
    merge_into(vm, &copy, &args, block.as_ref())?;
    Ok(Value::Hash(copy))
}

fn hash_update(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    let table = table_of(vm, receiver)?;
    merge_into(vm, &table, &args, block.as_ref())?;
    Ok(receiver.clone())
}

fn hash_to_h(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    if block.is_some() {
        return enum_to_h(vm, receiver, args, block);
    }
    Ok(Value::hash(entries_of(vm, receiver)?.into_iter().collect()))
}

fn hash_transform_values(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let block = require_block(vm, block)?;
    let mut table = HashTable::new();
    for (key, value) in entries_of(vm, receiver)? {
        table.insert(key, yield_one(vm, &block, value)?);
    }
    Ok(Value::hash(table))
}

fn hash_transform_keys(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    check_args(vm, &args, 0, 1)?;
    let mapping = args.first().cloned();
    let mut table = HashTable::new();
    for (key, value) in entries_of(vm, receiver)? {
        let mapped = match (&mapping, &block) {
            (Some(mapping), _) if table_of(vm, mapping)?.borrow().contains_key(&key) => {
                hash_lookup(vm, mapping, &key)?
            }
            (_, Some(block)) => yield_one(vm, block, key)?,
            (Some(_), None) => key,
            (None, None) => return Err(require_block(vm, None).err().unwrap_or_else(|| vm.raise("ArgumentError", "no block given"))),
        };
        table.insert(mapped, value);
    }
    Ok(Value::hash(table))
}

fn hash_slice(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    let source = table_of(vm, receiver)?;
    let source = source.borrow();
    let table: HashTable = args
        .iter()
        .filter_map(|key| source.get(key).map(|value| (key.clone(), value.clone())))
        .collect();
    Ok(Value::hash(table))
}

fn hash_except(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    let entries = entries_of(vm, receiver)?;
    Ok(Value::hash(entries.into_iter().filter(|(key, _)| !args.contains(key)).collect()))
}

fn hash_compact(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let entries = entries_of(vm, receiver)?;
    Ok(Value::hash(entries.into_iter().filter(|(_, value)| !value.is_nil()).collect()))
}

fn hash_invert(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let entries = entries_of(vm, receiver)?;
    Ok(Value::hash(entries.into_iter().map(|(key, value)| (value, key)).collect()))
}

fn hash_eq(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let Value::Hash(other) = &args[0] else {
        return Ok(Value::False);
    };
    let entries = entries_of(vm, receiver)?;
    if entries.len() != other.borrow().len() {
        return Ok(Value::False);
    }
    for (key, value) in entries {
        let theirs = other.borrow().get(&key).cloned();
        match theirs {
            Some(theirs) if values_equal(vm, &value, &theirs)? => {}
            _ => return Ok(Value::False),
        }
    }
    Ok(Value::True)
}

fn hash_clear(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    table_of(vm, receiver)?.borrow_mut().clear();
    Ok(receiver.clone())
}

fn hash_default(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(table_of(vm, receiver)?.borrow().default.clone().unwrap_or(Value::Nil))
}

fn hash_set_default(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let table = table_of(vm, receiver)?;
    let mut table = table.borrow_mut();
    table.default = Some(args[0].clone());
    table.default_proc = None;
    Ok(args[0].clone())
}

// =============================================================================
// Range
// =============================================================================

fn range_each(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let block = require_block(vm, block)?;
    let range = range_of(vm, receiver)?;
    walk_range(vm, &range, |vm, item| {
        yield_one(vm, &block, item)?;
        Ok(true)
    })?;
    Ok(receiver.clone())
}

fn range_first(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    check_args(vm, &args, 0, 1)?;
    let range = range_of(vm, receiver)?;
    if args.is_empty() {
        if range.start.is_nil() {
            return Err(vm.raise("RangeError", "cannot get the first element of beginless range"));
        }
        return Ok(range.start.clone());
    }
    enum_take(vm, receiver, args, block)
}

fn range_last(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 0, 1)?;
    let range = range_of(vm, receiver)?;
    if range.end.is_nil() {
        return Err(vm.raise("RangeError", "cannot get the last element of endless range"));
    }
    if args.is_empty() {
        return Ok(range.end.clone());
    }
    let items = elements(vm, receiver)?;
    take_end(vm, &items, &args, false)
}

fn range_begin(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(range_of(vm, receiver)?.start.clone())
}

fn range_end(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(range_of(vm, receiver)?.end.clone())
}

/// First and last integers of a finite integer range.
fn integer_bounds(vm: &Vm, range: &Range) -> Result<Option<(i64, i64)>, Unwind> {
    match &range.start {
        Value::Integer(start) => Ok(integer_last(vm, range)?.map(|last| (*start, last))),
        _ => Ok(None),
    }
}

fn range_min(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    let range = range_of(vm, receiver)?;
    if block.is_some() || !args.is_empty() {
        return enum_min(vm, receiver, args, block);
    }
    match integer_bounds(vm, &range)? {
        Some((start, last)) => Ok(if start > last { Value::Nil } else { Value::Integer(start) }),
        None => match compare(vm, &range.start, &range.end)? {
            Some(Ordering::Greater) => Ok(Value::Nil),
            Some(Ordering::Equal) if range.exclusive => Ok(Value::Nil),
            _ => Ok(range.start.clone()),
        },
    }
}

fn range_max(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    let range = range_of(vm, receiver)?;
    if block.is_some() || !args.is_empty() {
        return enum_max(vm, receiver, args, block);
    }
    if range.end.is_nil() {
        return Err(vm.raise("RangeError", "cannot get the maximum of endless range"));
    }
    match integer_bounds(vm, &range)? {
        Some((start, last)) => Ok(if start > last { Value::Nil } else { Value::Integer(last) }),
        None if range.exclusive => enum_max(vm, receiver, args, block),
        None => match compare(vm, &range.start, &range.end)? {
            Some(Ordering::Greater) => Ok(Value::Nil),
            _ => Ok(range.end.clone()),
        },
    }
}

fn range_size(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let range = range_of(vm, receiver)?;
    if !matches!(range.start, Value::Integer(_)) {
        return Ok(Value::Nil);
    }
    match integer_bounds(vm, &range)? {
        Some((start, last)) => Ok(Value::Integer((i128::from(last) - i128::from(start) + 1).max(0) as i64)),
        None => Ok(Value::Float(f64::INFINITY)),
    }
}

fn range_count(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    let range = range_of(vm, receiver)?;
    if args.is_empty() && block.is_none() && matches!(range.start, Value::Integer(_)) {
        return range_size(vm, receiver, args, block);
    }
    enum_count(vm, receiver, args, block)
}

/// Integer ranges sum in closed form.
fn range_sum(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    let range = range_of(vm, receiver)?;
    let init = args.first().cloned().unwrap_or(Value::Integer(0));
    if let (None, Value::Integer(init), Some((start, last))) = (&block, &init, integer_bounds(vm, &range)?) {
        if start > last {
            return Ok(Value::Integer(*init));
        }
        let (first, last) = (i128::from(start), i128::from(last));
        let total = (first + last) * (last - first + 1) / 2 + i128::from(*init);
        return i64::try_from(total)
            .map(Value::Integer)
            .map_err(|_| vm.raise("RangeError", "integer overflow"));
    }
    enum_sum(vm, receiver, args, block)
}

/// Whether `value` lies between the bounds; nil bounds are open and
/// incomparable values are outside.
fn range_cover_p(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let range = range_of(vm, receiver)?;
    let value = &args[0];
    if !range.start.is_nil() {
        match compare(vm, &range.start, value)? {
            Some(Ordering::Less | Ordering::Equal) => {}
            _ => return Ok(Value::False),
        }
    }
    if !range.end.is_nil() {
        match compare(vm, value, &range.end)? {
            Some(Ordering::Less) => {}
            Some(Ordering::Equal) if !range.exclusive => {}
            _ => return Ok(Value::False),
        }
    }
    Ok(Value::True)
}

fn range_exclude_end_p(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(range_of(vm, receiver)?.exclusive))
}

/// `step(n)`: every n-th member from the start; floats accumulate by
/// multiplication to avoid drift.
fn range_step(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let range = range_of(vm, receiver)?;
    let mut out = Vec::new();
    let mut emit = |vm: &mut Vm, value: Value| -> Result<(), Unwind> {
        match &block {
            Some(block) => {
                yield_one(vm, block, value)?;
            }
            None => out.push(value),
        }
        Ok(())
    };
    match (&range.start, &args[0]) {
        (Value::Integer(start), Value::Integer(step)) => {
            if *step <= 0 {
                return Err(vm.raise("ArgumentError", "step can't be negative or zero"));
            }
            let last = integer_last(vm, &range)?;
            let mut i = *start;
            while last.is_none_or(|last| i <= last) {
                emit(vm, Value::Integer(i))?;
                match i.checked_add(*step) {
                    Some(next) => i = next,
                    None => break,
                }
            }
        }
        (start, step) => {
            let (Some(start), Some(step)) = (start.as_float(), step.as_float()) else {
                return Err(vm.raise("TypeError", format!("can't iterate from {}", class_name(vm, &range.start))));
            };
            if step <= 0.0 {
                return Err(vm.raise("ArgumentError", "step can't be negative or zero"));
            }
            let end = range.end.as_float().unwrap_or(f64::INFINITY);
            let mut n = 0.0;
            loop {
                let value = start + n * step;
                if value > end || (range.exclusive && value >= end) {
                    break;
                }
                emit(vm, Value::Float(value))?;
                n += 1.0;
            }
        }
    }
    Ok(match block {
        Some(_) => receiver.clone(),
        None => Value::array(out),
    })
}

fn range_to_s(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let range = range_of(vm, receiver)?;
    let start = vm.stringify(&range.start)?;
    let end = vm.stringify(&range.end)?;
    Ok(Value::string(format!("{}{}{}", start, if range.exclusive { "..." } else { ".." }, end)))
}

fn range_inspect(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let range = range_of(vm, receiver)?;
    let bound = |vm: &mut Vm, value: &Value| -> Result<String, Unwind> {
        if value.is_nil() { Ok(String::new()) } else { vm.inspect(value) }
    };
    let start = bound(vm, &range.start)?;
    let end = bound(vm, &range.end)?;
    Ok(Value::string(format!("{}{}{}", start, if range.exclusive { "..." } else { ".." }, end)))
}

fn range_eq(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let range = range_of(vm, receiver)?;
    let Value::Range(other) = &args[0] else {
        return Ok(Value::False);
    };
    Ok(Value::bool(
        range.exclusive == other.exclusive
            && values_equal(vm, &range.start, &other.start)?
            && values_equal(vm, &range.end, &other.end)?,
    ))
}

// =============================================================================
// Enumerable
// =============================================================================

fn enum_each_with_index(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let Some(block) = block else {
        let items = elements(vm, receiver)?;
        let pairs = items
            .into_iter()
            .enumerate()
            .map(|(i, item)| pair(item, Value::Integer(i as i64)))
            .collect();
        return Ok(Value::array(pairs));
    };
    let mut index = 0;
    each_element(vm, receiver, |vm, item| {
        vm.yield_block(&block, vec![item, Value::Integer(index)])?;
        index += 1;
        Ok(true)
    })?;
    Ok(receiver.clone())
}

fn slice_size(vm: &Vm, args: &[Value]) -> Result<usize, Unwind> {
    check_args(vm, args, 1, 1)?;
    match usize::try_from(int_arg(vm, &args[0])?) {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(vm.raise("ArgumentError", "invalid size")),
    }
}

/// Yield each group, or collect the groups when there is no block.
fn emit_groups(vm: &mut Vm, receiver: &Value, groups: Vec<Value>, block: Block) -> Outcome {
    let Some(block) = block else {
        return Ok(Value::array(groups));
    };
    for group in groups {
        yield_one(vm, &block, group)?;
    }
    Ok(receiver.clone())
}

fn enum_each_slice(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    let size = slice_size(vm, &args)?;
    let items = elements(vm, receiver)?;
    let groups = items.chunks(size).map(|chunk| Value::array(chunk.to_vec())).collect();
    emit_groups(vm, receiver, groups, block)
}

fn enum_each_cons(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    let size = slice_size(vm, &args)?;
    let items = elements(vm, receiver)?;
    let groups = items.windows(size).map(|window| Value::array(window.to_vec())).collect();
    emit_groups(vm, receiver, groups, block)
}

fn enum_each_with_object(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let block = require_block(vm, block)?;
    let memo = args[0].clone();
    each_element(vm, receiver, |vm, item| {
        vm.yield_block(&block, vec![item, memo.clone()])?;
        Ok(true)
    })?;
    Ok(memo)
}

fn enum_reverse_each(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let block = require_block(vm, block)?;
    for item in elements(vm, receiver)?.into_iter().rev() {
        yield_one(vm, &block, item)?;
    }
    Ok(receiver.clone())
}

fn enum_map(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let Some(block) = block else {
        return Ok(Value::array(elements(vm, receiver)?));
    };
    let mut out = Vec::new();
    each_element(vm, receiver, |vm, item| {
        out.push(yield_one(vm, &block, item)?);
        Ok(true)
    })?;
    Ok(Value::array(out))
}

fn enum_flat_map(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let block = require_block(vm, block)?;
    let mut out = Vec::new();
    each_element(vm, receiver, |vm, item| {
        match yield_one(vm, &block, item)? {
            Value::Array(items) => out.extend(items.borrow().iter().cloned()),
            other => out.push(other),
        }
        Ok(true)
    })?;
    Ok(Value::array(out))
}

fn filter_elements(vm: &mut Vm, receiver: &Value, block: Block, keep_truthy: bool) -> Outcome {
    let block = require_block(vm, block)?;
    let mut out = Vec::new();
    each_element(vm, receiver, |vm, item| {
        if yield_one(vm, &block, item.clone())?.is_truthy() == keep_truthy {
            out.push(item);
        }
        Ok(true)
    })?;
    Ok(Value::array(out))
}

fn enum_select(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    filter_elements(vm, receiver, block, true)
}

fn enum_reject(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    filter_elements(vm, receiver, block, false)
}

fn enum_filter_map(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let block = require_block(vm, block)?;
    let mut out = Vec::new();
    each_element(vm, receiver, |vm, item| {
        let mapped = yield_one(vm, &block, item)?;
        if mapped.is_truthy() {
            out.push(mapped);
        }
        Ok(true)
    })?;
    Ok(Value::array(out))
}

fn enum_find(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let block = require_block(vm, block)?;
    let mut found = Value::Nil;
    each_element(vm, receiver, |vm, item| {
        if yield_one(vm, &block, item.clone())?.is_truthy() {
            found = item;
            return Ok(false);
        }
        Ok(true)
    })?;
    Ok(found)
}

fn enum_find_index(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    let items = elements(vm, receiver)?;
    position(vm, items.into_iter().enumerate(), &args, block.as_ref())
}

fn enum_partition(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let block = require_block(vm, block)?;
    let (mut yes, mut no) = (Vec::new(), Vec::new());
    for item in elements(vm, receiver)? {
        if yield_one(vm, &block, item.clone())?.is_truthy() {
            yes.push(item);
        } else {
            no.push(item);
        }
    }
    Ok(Value::array(vec![Value::array(yes), Value::array(no)]))
}

fn enum_group_by(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let block = require_block(vm, block)?;
    let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();
    for item in elements(vm, receiver)? {
        let key = yield_one(vm, &block, item.clone())?;
        match groups.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, members)) => members.push(item),
            None => groups.push((key, vec![item])),
        }
    }
    Ok(Value::hash(groups.into_iter().map(|(key, members)| (key, Value::array(members))).collect()))
}

/// `reduce(init = first) { |acc, x| }` or `reduce(init = first, :op)`.
fn enum_reduce(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    check_args(vm, &args, 0, 2)?;
    let operator = |vm: &Vm, value: &Value| {
        value
            .as_name()
            .ok_or_else(|| vm.raise("TypeError", format!("{} is not a symbol nor a string", value.inspect())))
    };
    let (mut acc, op) = match (args.as_slice(), &block) {
        ([], _) => (None, None),
        ([init], Some(_)) => (Some(init.clone()), None),
        ([op], None) => (None, Some(operator(vm, op)?)),
        ([init, op, ..], _) => (Some(init.clone()), Some(operator(vm, op)?)),
    };
    let block = match (&op, block) {
        (None, block) => Some(require_block(vm, block)?),
        (Some(_), _) => None,
    };
    for item in elements(vm, receiver)? {
        acc = Some(match (acc, &op, &block) {
            (None, _, _) => item,
            (Some(acc), Some(op), _) => vm.invoke(acc, op, vec![item], None)?,
            (Some(acc), None, Some(block)) => vm.yield_block(block, vec![acc, item])?,
            (Some(acc), None, None) => acc,
        });
    }
    Ok(acc.unwrap_or(Value::Nil))
}

/// Numeric totals stay exact for integers and use compensated summation
/// once a float is involved; anything else folds with `+`.
fn sum_values(vm: &mut Vm, init: Value, values: Vec<Value>) -> Outcome {
    let numeric = |value: &Value| matches!(value, Value::Integer(_) | Value::Float(_));
    if numeric(&init) && values.iter().all(numeric) {
        if let Value::Integer(start) = init {
            if values.iter().all(|value| matches!(value, Value::Integer(_))) {
                let mut total = start;
                for value in &values {
                    total = value
                        .as_integer()
                        .and_then(|n| total.checked_add(n))
                        .ok_or_else(|| vm.raise("RangeError", "integer overflow"))?;
                }
                return Ok(Value::Integer(total));
            }
        }
        let mut sum = init.as_float().unwrap_or(0.0);
        let mut compensation = 0.0;
        for x in values.iter().filter_map(Value::as_float) {
            let t = sum + x;
            if sum.abs() >= x.abs() {
                compensation += (sum - t) + x;
            } else {
                compensation += (x - t) + sum;
            }
            sum = t;
        }
        return Ok(Value::Float(sum + compensation));
    }
    let mut acc = init;
    for value in values {
        acc = vm.invoke(acc, "+", vec![value], None)?;
    }
    Ok(acc)
}

fn enum_sum(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    check_args(vm, &args, 0, 1)?;
    let init = args.first().cloned().unwrap_or(Value::Integer(0));
    let mut values = elements(vm, receiver)?;
    if let Some(block) = &block {
        values = values
            .into_iter()
            .map(|item| yield_one(vm, block, item))
            .collect::<Result<Vec<_>, _>>()?;
    }
    sum_values(vm, init, values)
}

fn enum_count(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    check_args(vm, &args, 0, 1)?;
    let mut count = 0;
    each_element(vm, receiver, |vm, item| {
        let hit = match (args.first(), &block) {
            (Some(target), _) => values_equal(vm, &item, target)?,
            (None, Some(block)) => yield_one(vm, block, item)?.is_truthy(),
            (None, None) => true,
        };
        if hit {
            count += 1;
        }
        Ok(true)
    })?;
    Ok(Value::Integer(count))
}

fn enum_tally(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let mut counts: Vec<(Value, i64)> = Vec::new();
    for item in elements(vm, receiver)? {
        match counts.iter_mut().find(|(existing, _)| *existing == item) {
            Some((_, n)) => *n += 1,
            None => counts.push((item, 1)),
        }
    }
    Ok(Value::hash(counts.into_iter().map(|(item, n)| (item, Value::Integer(n))).collect()))
}

/// Ordering from a `<=>`-style block answer.
fn block_order(vm: &mut Vm, block: &Rc<Proc>, a: &Value, b: &Value) -> Result<Ordering, Unwind> {
    let answer = vm.yield_block(block, vec![a.clone(), b.clone()])?;
    match answer.as_integer() {
        Some(n) => Ok(n.cmp(&0)),
        None => Err(vm.raise(
            "ArgumentError",
            format!("comparison of {} with {} failed", class_name(vm, a), class_name(vm, b)),
        )),
    }
}

fn sorted(vm: &mut Vm, mut items: Vec<Value>, block: Option<&Rc<Proc>>) -> Result<Vec<Value>, Unwind> {
    match block {
        Some(block) => sort_values(vm, &mut items, |vm, a, b| block_order(vm, block, a, b))?,
        None => sort_values(vm, &mut items, compare_or_fail)?,
    }
    Ok(items)
}

fn enum_sort(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let items = elements(vm, receiver)?;
    Ok(Value::array(sorted(vm, items, block.as_ref())?))
}

/// `[key, item]` pairs for the `_by` family.
fn keyed(vm: &mut Vm, receiver: &Value, block: Block) -> Result<Vec<Value>, Unwind> {
    let block = require_block(vm, block)?;
    let mut pairs = Vec::new();
    for item in elements(vm, receiver)? {
        let key = yield_one(vm, &block, item.clone())?;
        pairs.push(pair(key, item));
    }
    Ok(pairs)
}

fn enum_sort_by(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let mut pairs = keyed(vm, receiver, block)?;
    sort_values(vm, &mut pairs, |vm, a, b| compare_or_fail(vm, &first_of(a), &first_of(b)))?;
    Ok(Value::array(pairs.iter().map(second_of).collect()))
}

fn extreme_by(vm: &mut Vm, receiver: &Value, block: Block, want_max: bool) -> Outcome {
    let pairs = keyed(vm, receiver, block)?;
    let mut best: Option<Value> = None;
    for candidate in pairs {
        best = Some(match best {
            None => candidate,
            Some(current) => {
                let order = compare_or_fail(vm, &first_of(&candidate), &first_of(&current))?;
                let better = if want_max { order == Ordering::Greater } else { order == Ordering::Less };
                if better { candidate } else { current }
            }
        });
    }
    Ok(best.as_ref().map_or(Value::Nil, second_of))
}

fn enum_min_by(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    extreme_by(vm, receiver, block, false)
}

fn enum_max_by(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    extreme_by(vm, receiver, block, true)
}

/// `min`/`max`, optionally with a comparison block or a count.
fn extreme_of(vm: &mut Vm, receiver: &Value, args: &[Value], block: Block, want_max: bool) -> Outcome {
    check_args(vm, args, 0, 1)?;
    let items = elements(vm, receiver)?;
    if let Some(n) = args.first() {
        let n = count_arg(vm, n, "take")?;
        let mut ordered = sorted(vm, items, block.as_ref())?;
        if want_max {
            ordered.reverse();
        }
        ordered.truncate(n);
        return Ok(Value::array(ordered));
    }
    let Some(block) = block else {
        return extreme(vm, &items, want_max);
    };
    let mut best: Option<Value> = None;
    for item in items {
        best = Some(match best {
            None => item,
            Some(current) => {
                let order = block_order(vm, &block, &item, &current)?;
                let better = if want_max { order == Ordering::Greater } else { order == Ordering::Less };
                if better { item } else { current }
            }
        });
    }
    Ok(best.unwrap_or(Value::Nil))
}

fn enum_min(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    extreme_of(vm, receiver, &args, block, false)
}

fn enum_max(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    extreme_of(vm, receiver, &args, block, true)
}

fn enum_minmax(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let min = extreme_of(vm, receiver, &[], block.clone(), false)?;
    let max = extreme_of(vm, receiver, &[], block, true)?;
    Ok(Value::array(vec![min, max]))
}

fn enum_take(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let n = count_arg(vm, &args[0], "take")?;
    let mut out = Vec::with_capacity(n.min(1024));
    if n > 0 {
        each_element(vm, receiver, |_, item| {
            out.push(item);
            Ok(out.len() < n)
        })?;
    }
    Ok(Value::array(out))
}

fn enum_drop(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let n = count_arg(vm, &args[0], "drop")?;
    let items = elements(vm, receiver)?;
    Ok(Value::array(items.into_iter().skip(n).collect()))
}

fn enum_take_while(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let block = require_block(vm, block)?;
    let mut out = Vec::new();
    each_element(vm, receiver, |vm, item| {
        if !yield_one(vm, &block, item.clone())?.is_truthy() {
            return Ok(false);
        }
        out.push(item);
        Ok(true)
    })?;
    Ok(Value::array(out))
}

fn enum_drop_while(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let block = require_block(vm, block)?;
    let mut out = Vec::new();
    let mut dropping = true;
    for item in elements(vm, receiver)? {
        if dropping && yield_one(vm, &block, item.clone())?.is_truthy() {
            continue;
        }
        dropping = false;
        out.push(item);
    }
    Ok(Value::array(out))
}

fn enum_first(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    if !args.is_empty() {
        return enum_take(vm, receiver, args, block);
    }
    let mut first = Value::Nil;
    each_element(vm, receiver, |_, item| {
        first = item;
        Ok(false)
    })?;
    Ok(first)
}

fn enum_zip(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    let items = elements(vm, receiver)?;
    let others = args
        .iter()
        .map(|other| elements(vm, other))
        .collect::<Result<Vec<_>, _>>()?;
    let rows: Vec<Value> = items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            let mut row = vec![item];
            row.extend(others.iter().map(|other| other.get(i).cloned().unwrap_or(Value::Nil)));
            Value::array(row)
        })
        .collect();
    match block {
        Some(block) => {
            for row in rows {
                yield_one(vm, &block, row)?;
            }
            Ok(Value::Nil)
        }
        None => Ok(Value::array(rows)),
    }
}

/// First occurrence of each element (or of each block key), compared with
/// `eql?`.
fn enum_uniq(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let items = elements(vm, receiver)?;
    let Some(block) = block else {
        return Ok(Value::array(dedup(items)));
    };
    let mut seen = Vec::new();
    let mut out = Vec::new();
    for item in items {
        let key = yield_one(vm, &block, item.clone())?;
        if !seen.contains(&key) {
            seen.push(key);
            out.push(item);
        }
    }
    Ok(Value::array(out))
}

fn enum_include_p(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let mut found = false;
    each_element(vm, receiver, |vm, item| {
        found = values_equal(vm, &item, &args[0])?;
        Ok(!found)
    })?;
    Ok(Value::bool(found))
}

/// Count elements passing the test, stopping once `stop_at` is reached.
fn count_passing(vm: &mut Vm, receiver: &Value, args: &[Value], block: Block, stop_at: usize) -> Result<usize, Unwind> {
    check_args(vm, args, 0, 1)?;
    let mut passed = 0;
    each_element(vm, receiver, |vm, item| {
        if element_test(vm, args.first(), block.as_ref(), item)? {
            passed += 1;
        }
        Ok(passed < stop_at)
    })?;
    Ok(passed)
}

fn count_failing(vm: &mut Vm, receiver: &Value, args: &[Value], block: Block) -> Result<bool, Unwind> {
    check_args(vm, args, 0, 1)?;
    let mut failed = false;
    each_element(vm, receiver, |vm, item| {
        failed = !element_test(vm, args.first(), block.as_ref(), item)?;
        Ok(!failed)
    })?;
    Ok(failed)
}

fn enum_any_p(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    Ok(Value::bool(count_passing(vm, receiver, &args, block, 1)? > 0))
}

fn enum_all_p(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    Ok(Value::bool(!count_failing(vm, receiver, &args, block)?))
}

fn enum_none_p(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    Ok(Value::bool(count_passing(vm, receiver, &args, block, 1)? == 0))
}

fn enum_one_p(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    Ok(Value::bool(count_passing(vm, receiver, &args, block, 2)? == 1))
}

fn enum_to_a(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::array(elements(vm, receiver)?))
}

fn enum_to_h(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let mut table = HashTable::new();
    for item in elements(vm, receiver)? {
        let entry = match &block {
            Some(block) => yield_one(vm, block, item)?,
            None => item,
        };
        match &entry {
            Value::Array(items) if items.borrow().len() == 2 => {
                table.insert(hash_key_value(&first_of(&entry)), second_of(&entry));
            }
            other => {
                return Err(vm.raise(
                    "TypeError",
                    format!("wrong element type {} (expected array)", class_name(vm, other)),
                ));
            }
        }
    }
    Ok(Value::hash(table))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[i64]) -> Value {
        Value::array(values.iter().map(|n| Value::Integer(*n)).collect())
    }

    #[test]
    fn test_range_elements() {
        let mut vm = Vm::new();
        let range = Value::range(Value::Integer(1), Value::Integer(4), true);
        assert_eq!(elements(&mut vm, &range).ok(), Some(vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]));
        let letters = Value::range(Value::string("y"), Value::string("ab"), false);
        let names: Vec<String> = elements(&mut vm, &letters)
            .expect("letters")
            .iter()
            .map(Value::to_s)
            .collect();
        assert_eq!(names, vec!["y", "z", "aa", "ab"]);
        let endless = Value::range(Value::Integer(1), Value::Nil, false);
        assert!(elements(&mut vm, &endless).is_err());
    }

    #[test]
    fn test_endless_range_take_stops() {
        let mut vm = Vm::new();
        let endless = Value::range(Value::Integer(5), Value::Nil, false);
        let taken = enum_take(&mut vm, &endless, vec![Value::Integer(3)], None).ok();
        assert_eq!(taken, Some(ints(&[5, 6, 7])));
    }

    #[test]
    fn test_array_aset_pads_and_splices() {
        let mut vm = Vm::new();
        let array = ints(&[1, 2]);
        array_aset(&mut vm, &array, vec![Value::Integer(4), Value::Integer(9)], None).expect("aset");
        assert_eq!(array, Value::array(vec![Value::Integer(1), Value::Integer(2), Value::Nil, Value::Nil, Value::Integer(9)]));
        array_aset(&mut vm, &array, vec![Value::Integer(1), Value::Integer(3), ints(&[7])], None).expect("splice");
        assert_eq!(array, ints(&[1, 7, 9]));
        assert!(array_aset(&mut vm, &array, vec![Value::Integer(-9), Value::Nil], None).is_err());
    }

    #[test]
    fn test_flatten_and_transpose() {
        let mut vm = Vm::new();
        let nested = Value::array(vec![Value::Integer(1), Value::array(vec![Value::Integer(2), ints(&[3])])]);
        assert_eq!(array_flatten(&mut vm, &nested, vec![], None).ok(), Some(ints(&[1, 2, 3])));
        assert_eq!(
            array_flatten(&mut vm, &nested, vec![Value::Integer(1)], None).ok(),
            Some(Value::array(vec![Value::Integer(1), Value::Integer(2), ints(&[3])]))
        );
        let grid = Value::array(vec![ints(&[1, 2]), ints(&[3, 4])]);
        assert_eq!(
            array_transpose(&mut vm, &grid, vec![], None).ok(),
            Some(Value::array(vec![ints(&[1, 3]), ints(&[2, 4])]))
        );
        let ragged = Value::array(vec![ints(&[1, 2]), ints(&[3])]);
        assert!(array_transpose(&mut vm, &ragged, vec![], None).is_err());
    }

    #[test]
    fn test_float_sum_is_compensated() {
        let mut vm = Vm::new();
        let values = vec![Value::Float(0.1), Value::Float(0.2), Value::Float(0.3)];
        assert_eq!(sum_values(&mut vm, Value::Integer(0), values).ok(), Some(Value::Float(0.6)));
        let ints_only = vec![Value::Integer(i64::MAX), Value::Integer(1)];
        assert!(sum_values(&mut vm, Value::Integer(0), ints_only).is_err());
    }

    #[test]
    fn test_range_sum_closed_form() {
        let mut vm = Vm::new();
        let range = Value::range(Value::Integer(1), Value::Integer(100), false);
        assert_eq!(range_sum(&mut vm, &range, vec![], None).ok(), Some(Value::Integer(5050)));
        let empty = Value::range(Value::Integer(5), Value::Integer(1), false);
        assert_eq!(range_sum(&mut vm, &empty, vec![], None).ok(), Some(Value::Integer(0)));
    }

    #[test]
    fn test_hash_default_value() {
        let mut vm = Vm::new();
        let hash = hash_new(&mut vm, vec![Value::Integer(0)], None).expect("hash");
        assert_eq!(hash_aref(&mut vm, &hash, vec![Value::symbol("missing")], None).ok(), Some(Value::Integer(0)));
        let fetched = hash_fetch(&mut vm, &hash, vec![Value::symbol("missing")], None);
        assert!(matches!(fetched, Err(Unwind::Raise(_))));
    }

    #[test]
    fn test_array_times_repeats_items() {
        let mut vm = Vm::new();
        let array = ints(&[1, 2]);
        assert_eq!(array_times(&mut vm, &array, vec![Value::Integer(3)], None).ok(), Some(ints(&[1, 2, 1, 2, 1, 2])));
        assert_eq!(array_times(&mut vm, &array, vec![Value::Integer(0)], None).ok(), Some(ints(&[])));
        assert!(array_times(&mut vm, &array, vec![Value::Integer(-1)], None).is_err());
        let joined = array_times(&mut vm, &array, vec![Value::string("-")], None).ok();
        assert_eq!(joined, Some(Value::string("1-2")));
    }

    #[test]
    fn test_range_last_with_count() {
        let mut vm = Vm::new();
        let range = Value::range(Value::Integer(1), Value::Integer(5), false);
        assert_eq!(range_last(&mut vm, &range, vec![], None).ok(), Some(Value::Integer(5)));
        assert_eq!(range_last(&mut vm, &range, vec![Value::Integer(2)], None).ok(), Some(ints(&[4, 5])));
        let endless = Value::range(Value::Integer(1), Value::Nil, false);
        assert!(range_last(&mut vm, &endless, vec![], None).is_err());
    }
}
