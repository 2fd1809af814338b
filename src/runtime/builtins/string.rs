use std::rc::Rc;

use crate::lang::literal::quote_string;
use crate::runtime::builtins::{
    Builtin, Outcome, check_args, format_string, index_span, int_arg, range_span, require_block, str_arg,
};
use crate::runtime::frame::{Proc, ProcBody};
use crate::runtime::runtime_error::Unwind;
use crate::runtime::value::{Str, Value};
use crate::runtime::vm::Vm;

type Block = Option<Rc<Proc>>;

pub(super) fn lookup(class: &str, name: &str) -> Option<Builtin> {
    let found: Builtin = match (class, name) {
        ("String", "+") => str_plus,
        ("String", "*") => str_times,
        ("String", "%") => str_format,
        ("String", "==" | "===" | "eql?") => str_eq,
        ("String", "<=>") => str_cmp,
        ("String", "length" | "size") => str_length,
        ("String", "bytesize") => str_bytesize,
        ("String", "empty?") => str_empty_p,
        ("String", "upcase") => str_upcase,
        ("String", "downcase") => str_downcase,
        ("String", "capitalize") => str_capitalize,
        ("String", "swapcase") => str_swapcase,
        ("String", "reverse") => str_reverse,
        ("String", "strip") => str_strip,
        ("String", "lstrip") => str_lstrip,
        ("String", "rstrip") => str_rstrip,
        ("String", "chomp") => str_chomp,
        ("String", "chop") => str_chop,
        ("String", "upcase!") => str_upcase_bang,
        ("String", "downcase!") => str_downcase_bang,
        ("String", "reverse!") => str_reverse_bang,
        ("String", "strip!") => str_strip_bang,
        ("String", "chomp!") => str_chomp_bang,
        ("String", "include?") => str_include_p,
        ("String", "start_with?") => str_start_with_p,
        ("String", "end_with?") => str_end_with_p,
        ("String", "index") => str_index,
        ("String", "rindex") => str_rindex,
        ("String", "to_s" | "to_str") => str_itself,
        ("String", "to_sym" | "intern") => str_to_sym,
        ("String", "to_i") => str_to_i,
        ("String", "to_f") => str_to_f,
        ("String", "inspect" | "dump") => str_inspect,
        ("String", "[]" | "slice") => str_aref,
        ("String", "<<" | "concat") => str_append,
        ("String", "replace") => str_replace,
        ("String", "chars") => str_chars,
        ("String", "bytes") => str_bytes,
        ("String", "lines") => str_lines,
        ("String", "split") => str_split,
        ("String", "each_char") => str_each_char,
        ("String", "gsub") => str_gsub,
        ("String", "sub") => str_sub,
        ("String", "delete") => str_delete,
        ("String", "squeeze") => str_squeeze,
        ("String", "count") => str_count,
        ("String", "center") => str_center,
        ("String", "ljust") => str_ljust,
        ("String", "rjust") => str_rjust,
        ("String", "ord") => str_ord,
        ("String", "succ" | "next") => str_succ,
        ("String", "freeze") => str_freeze,
        ("String", "frozen?") => str_frozen_p,
        ("String", "dup" | "+@") => str_dup,
        ("String", "-@") => str_dedup,
        ("String", "hash") => str_hash,

        ("Symbol", "to_s" | "id2name" | "name") => sym_to_s,
        ("Symbol", "to_sym") => sym_itself,
        ("Symbol", "inspect") => sym_inspect,
        ("Symbol", "to_proc") => sym_to_proc,
        ("Symbol", "length" | "size") => sym_length,
        ("Symbol", "==" | "===") => sym_eq,
        ("Symbol", "<=>") => sym_cmp,
        ("Symbol", "upcase") => sym_upcase,
        ("Symbol", "downcase") => sym_downcase,
        ("Symbol", "capitalize") => sym_capitalize,
        ("Symbol", "succ") => sym_succ,
        ("Symbol", "start_with?") => sym_start_with_p,
        ("Symbol", "end_with?") => sym_end_with_p,
        ("Symbol", "empty?") => sym_empty_p,
        ("Symbol", "[]") => sym_aref,
        _ => return None,
    };
    Some(found)
}

// =============================================================================
// Receiver access
// =============================================================================

fn receiver_str(vm: &Vm, receiver: &Value) -> Result<Rc<Str>, Unwind> {
    match receiver {
        Value::String(s) => Ok(Rc::clone(s)),
        other => Err(vm.raise(
            "TypeError",
            format!("no implicit conversion of {} into String", vm.class_of(other).name),
        )),
    }
}

fn text(vm: &Vm, receiver: &Value) -> Result<String, Unwind> {
    Ok(receiver_str(vm, receiver)?.value.borrow().clone())
}

/// Receiver for in-place edits; frozen strings refuse.
fn mutable_str(vm: &Vm, receiver: &Value) -> Result<Rc<Str>, Unwind> {
    let s = receiver_str(vm, receiver)?;
    if s.frozen.get() {
        return Err(vm.raise(
            "FrozenError",
            format!("can't modify frozen String: {}", quote_string(&s.value.borrow())),
        ));
    }
    Ok(s)
}

/// Replace the receiver's contents with `edit`'s result; nil when nothing
/// changed, as the bang methods report.
fn edit_in_place(vm: &Vm, receiver: &Value, edit: impl FnOnce(&str) -> String) -> Outcome {
    let s = mutable_str(vm, receiver)?;
    let updated = edit(&s.value.borrow());
    if *s.value.borrow() == updated {
        return Ok(Value::Nil);
    }
    *s.value.borrow_mut() = updated;
    Ok(receiver.clone())
}

fn map_text(vm: &Vm, receiver: &Value, edit: impl FnOnce(&str) -> String) -> Outcome {
    Ok(Value::string(edit(&text(vm, receiver)?)))
}

// =============================================================================
// Transformations
// =============================================================================

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn swapcase(text: &str) -> String {
    text.chars()
        .flat_map(|c| {
            if c.is_uppercase() {
                c.to_lowercase().collect::<Vec<_>>()
            } else {
                c.to_uppercase().collect::<Vec<_>>()
            }
        })
        .collect()
}

fn reverse(text: &str) -> String {
    text.chars().rev().collect()
}

fn strip(text: &str) -> String {
    text.trim_matches(|c: char| c.is_whitespace() || c == '\0').to_string()
}

fn chomp(text: &str, suffix: Option<&str>) -> String {
    match suffix {
        Some(suffix) => text.strip_suffix(suffix).unwrap_or(text).to_string(),
        None => text
            .strip_suffix("\r\n")
            .or_else(|| text.strip_suffix('\n'))
            .or_else(|| text.strip_suffix('\r'))
            .unwrap_or(text)
            .to_string(),
    }
}

/// Successor: increments the rightmost alphanumeric, carrying leftward
/// across `z`, `Z` and `9`.
pub(crate) fn successor(text: &str) -> String {
    let mut chars: Vec<char> = text.chars().collect();
    let Some(mut index) = chars.iter().rposition(|c| c.is_ascii_alphanumeric()) else {
        return match chars.pop() {
            Some(last) => {
                let next = char::from_u32(last as u32 + 1).unwrap_or(last);
                chars.push(next);
                chars.into_iter().collect()
            }
            None => String::new(),
        };
    };
    loop {
        let (next, carry) = match chars[index] {
            'z' => ('a', Some('a')),
            'Z' => ('A', Some('A')),
            '9' => ('0', Some('1')),
            c => (char::from_u32(c as u32 + 1).unwrap_or(c), None),
        };
        chars[index] = next;
        let Some(carry) = carry else {
            break;
        };
        match chars[..index].iter().rposition(|c| c.is_ascii_alphanumeric()) {
            Some(previous) => index = previous,
            None => {
                chars.insert(index, carry);
                break;
            }
        }
    }
    chars.into_iter().collect()
}

/// Leading integer in `radix`, ignoring underscores; 0 when there is none.
fn parse_leading_int(text: &str, radix: u32) -> Option<i64> {
    let text = text.trim_start();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let mut value: i64 = 0;
    for c in digits.chars() {
        if c == '_' {
            continue;
        }
        let Some(digit) = c.to_digit(radix) else {
            break;
        };
        value = value.checked_mul(radix as i64)?.checked_add(digit as i64)?;
    }
    Some(if negative { -value } else { value })
}

/// Leading decimal float; 0.0 when there is none.
fn parse_leading_float(text: &str) -> f64 {
    let text = text.trim_start();
    let mut end = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut seen_exp = false;
    let bytes = text.as_bytes();
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => seen_digit = true,
            b'+' | b'-' if end == 0 || matches!(bytes[end - 1], b'e' | b'E') => {}
            b'.' if !seen_dot && !seen_exp && bytes.get(end + 1).is_some_and(u8::is_ascii_digit) => {
                seen_dot = true
            }
            b'e' | b'E' if seen_digit && !seen_exp => seen_exp = true,
            b'_' if seen_digit => {}
            _ => break,
        }
        end += 1;
    }
    let candidate: String = text[..end].chars().filter(|c| *c != '_').collect();
    let candidate = candidate.trim_end_matches(['e', 'E', '+', '-']);
    candidate.parse::<f64>().unwrap_or(0.0)
}

fn str_plus(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let right = str_arg(vm, &args[0])?;
    Ok(Value::string(text(vm, receiver)? + &right))
}

fn str_times(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let count = int_arg(vm, &args[0])?;
    let count = usize::try_from(count).map_err(|_| vm.raise("ArgumentError", "negative argument"))?;
    Ok(Value::string(text(vm, receiver)?.repeat(count)))
}

fn str_format(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let template = text(vm, receiver)?;
    let values = match &args[0] {
        Value::Array(items) => items.borrow().clone(),
        other => vec![other.clone()],
    };
    Ok(Value::string(format_string(vm, &template, &values)?))
}

fn str_eq(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    Ok(Value::bool(matches!(
        (receiver, &args[0]),
        (Value::String(a), Value::String(b)) if *a.value.borrow() == *b.value.borrow()
    )))
}

fn str_cmp(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    match (receiver, &args[0]) {
        (Value::String(a), Value::String(b)) => {
            let ordering = a.value.borrow().as_str().cmp(b.value.borrow().as_str());
            Ok(Value::Integer(ordering as i64))
        }
        _ => Ok(Value::Nil),
    }
}

fn str_length(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::Integer(text(vm, receiver)?.chars().count() as i64))
}

fn str_bytesize(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::Integer(text(vm, receiver)?.len() as i64))
}

fn str_empty_p(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(text(vm, receiver)?.is_empty()))
}

fn str_upcase(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    map_text(vm, receiver, str::to_uppercase)
}

fn str_downcase(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    map_text(vm, receiver, str::to_lowercase)
}

fn str_capitalize(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    map_text(vm, receiver, capitalize)
}

fn str_swapcase(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    map_text(vm, receiver, swapcase)
}

fn str_reverse(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    map_text(vm, receiver, reverse)
}

fn str_strip(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    map_text(vm, receiver, strip)
}

fn str_lstrip(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    map_text(vm, receiver, |s| s.trim_start().to_string())
}

fn str_rstrip(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    map_text(vm, receiver, |s| s.trim_end().to_string())
}

fn suffix_arg(vm: &Vm, args: &[Value]) -> Result<Option<String>, Unwind> {
    check_args(vm, args, 0, 1)?;
    args.first().map(|value| str_arg(vm, value)).transpose()
}

fn str_chomp(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    let suffix = suffix_arg(vm, &args)?;
    map_text(vm, receiver, |s| chomp(s, suffix.as_deref()))
}

fn str_chop(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    map_text(vm, receiver, |s| match s.strip_suffix("\r\n") {
        Some(rest) => rest.to_string(),
        None => {
            let mut chars = s.chars();
            chars.next_back();
            chars.as_str().to_string()
        }
    })
}

fn str_upcase_bang(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    edit_in_place(vm, receiver, str::to_uppercase)
}

fn str_downcase_bang(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    edit_in_place(vm, receiver, str::to_lowercase)
}

fn str_reverse_bang(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    edit_in_place(vm, receiver, reverse)?;
    Ok(receiver.clone())
}

fn str_strip_bang(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    edit_in_place(vm, receiver, strip)
}

fn str_chomp_bang(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    let suffix = suffix_arg(vm, &args)?;
    edit_in_place(vm, receiver, |s| chomp(s, suffix.as_deref()))
}

// =============================================================================
// Queries
// =============================================================================

fn str_include_p(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let needle = str_arg(vm, &args[0])?;
    Ok(Value::bool(text(vm, receiver)?.contains(&needle)))
}

fn affix_test(vm: &Vm, subject: &str, args: &[Value], test: fn(&str, &str) -> bool) -> Outcome {
    for value in args {
        if test(subject, &str_arg(vm, value)?) {
            return Ok(Value::True);
        }
    }
    Ok(Value::False)
}

fn str_start_with_p(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    affix_test(vm, &text(vm, receiver)?, &args, |s, p| s.starts_with(p))
}

fn str_end_with_p(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    affix_test(vm, &text(vm, receiver)?, &args, |s, p| s.ends_with(p))
}

fn char_offset(text: &str, byte: usize) -> i64 {
    text[..byte].chars().count() as i64
}

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices().nth(chars).map_or(text.len(), |(i, _)| i)
}

fn str_index(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 2)?;
    let haystack = text(vm, receiver)?;
    let needle = str_arg(vm, &args[0])?;
    let len = haystack.chars().count();
    let start = match args.get(1) {
        Some(value) => match index_span(int_arg(vm, value)?, 0, len) {
            Some((start, _)) => start,
            None => return Ok(Value::Nil),
        },
        None => 0,
    };
    let from = byte_offset(&haystack, start);
    Ok(haystack[from..]
        .find(&needle)
        .map_or(Value::Nil, |found| Value::Integer(char_offset(&haystack, from + found))))
}

fn str_rindex(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let haystack = text(vm, receiver)?;
    let needle = str_arg(vm, &args[0])?;
    Ok(haystack
        .rfind(&needle)
        .map_or(Value::Nil, |found| Value::Integer(char_offset(&haystack, found))))
}

fn str_itself(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(receiver.clone())
}

fn str_to_sym(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::symbol(&text(vm, receiver)?))
}

fn str_to_i(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 0, 1)?;
    let radix = match args.first() {
        Some(value) => int_arg(vm, value)?,
        None => 10,
    };
    if !(2..=36).contains(&radix) {
        return Err(vm.raise("ArgumentError", format!("invalid radix {}", radix)));
    }
    parse_leading_int(&text(vm, receiver)?, radix as u32)
        .map(Value::Integer)
        .ok_or_else(|| vm.raise("RangeError", "integer overflow"))
}

fn str_to_f(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::Float(parse_leading_float(&text(vm, receiver)?)))
}

fn str_inspect(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::string(quote_string(&text(vm, receiver)?)))
}

/// Character slice shared by `String#[]` and `Symbol#[]`.
fn slice_chars(vm: &Vm, source: &str, args: &[Value]) -> Outcome {
    check_args(vm, args, 1, 2)?;
    let chars: Vec<char> = source.chars().collect();
    let span = match (&args[0], args.get(1)) {
        (Value::Integer(index), None) => {
            let index = if *index < 0 { index + chars.len() as i64 } else { *index };
            return Ok(usize::try_from(index)
                .ok()
                .and_then(|i| chars.get(i))
                .map_or(Value::Nil, |c| Value::string(c.to_string())));
        }
        (Value::String(needle), None) => {
            let needle = needle.value.borrow().clone();
            return Ok(if source.contains(&needle) { Value::string(needle) } else { Value::Nil });
        }
        (Value::Range(range), None) => range_span(vm, range, chars.len())?,
        (start, Some(count)) => index_span(int_arg(vm, start)?, int_arg(vm, count)?, chars.len()),
        (other, None) => index_span(int_arg(vm, other)?, 1, chars.len()),
    };
    Ok(span.map_or(Value::Nil, |(start, count)| {
        Value::string(chars[start..start + count].iter().collect::<String>())
    }))
}

fn str_aref(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    slice_chars(vm, &text(vm, receiver)?, &args)
}

fn str_append(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    let s = mutable_str(vm, receiver)?;
    for value in &args {
        let piece = match value {
            Value::Integer(code) => u32::try_from(*code)
                .ok()
                .and_then(char::from_u32)
                .map(String::from)
                .ok_or_else(|| vm.raise("RangeError", format!("{} out of char range", code)))?,
            other => str_arg(vm, other)?,
        };
        s.value.borrow_mut().push_str(&piece);
    }
    Ok(receiver.clone())
}

fn str_replace(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let s = mutable_str(vm, receiver)?;
    *s.value.borrow_mut() = str_arg(vm, &args[0])?;
    Ok(receiver.clone())
}

fn strings(parts: impl IntoIterator<Item = impl Into<String>>) -> Value {
    Value::array(parts.into_iter().map(Value::string).collect())
}

fn str_chars(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(strings(text(vm, receiver)?.chars().map(String::from)))
}

fn str_bytes(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let bytes = text(vm, receiver)?.bytes().map(|b| Value::Integer(b as i64)).collect();
    Ok(Value::array(bytes))
}

fn str_lines(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(strings(text(vm, receiver)?.split_inclusive('\n')))
}

/// `split`: whitespace by default, otherwise a literal separator; trailing
/// empty fields are dropped unless a limit is given.
fn str_split(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 0, 2)?;
    let subject = text(vm, receiver)?;
    let separator = match args.first() {
        Some(Value::Nil) | None => None,
        Some(value) => Some(str_arg(vm, value)?),
    };
    let limit = match args.get(1) {
        Some(value) => int_arg(vm, value)?,
        None => 0,
    };
    let mut parts: Vec<String> = match separator.as_deref() {
        None | Some(" ") if limit > 0 => {
            let mut rest = subject.trim_start();
            let mut parts = Vec::new();
            while parts.len() + 1 < limit as usize {
                match rest.find(char::is_whitespace) {
                    Some(end) => {
                        parts.push(rest[..end].to_string());
                        rest = rest[end..].trim_start();
                    }
                    None => break,
                }
            }
            if !rest.is_empty() {
                parts.push(rest.to_string());
            }
            parts
        }
        None | Some(" ") => subject.split_whitespace().map(String::from).collect(),
        Some("") => subject.chars().map(String::from).collect(),
        Some(separator) if limit > 0 => subject.splitn(limit as usize, separator).map(String::from).collect(),
        Some(separator) => subject.split(separator).map(String::from).collect(),
    };
    if limit == 0 {
        while parts.last().is_some_and(String::is_empty) {
            parts.pop();
        }
    }
    Ok(strings(parts))
}

fn str_each_char(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let block = require_block(vm, block)?;
    for c in text(vm, receiver)?.chars() {
        vm.yield_block(&block, vec![Value::string(c.to_string())])?;
    }
    Ok(receiver.clone())
}

/// `sub`/`gsub` with a literal pattern and either a replacement string or
/// a block receiving the match.
fn substitute(vm: &mut Vm, receiver: &Value, args: &[Value], block: Block, global: bool) -> Outcome {
    check_args(vm, args, 1, 2)?;
    let subject = text(vm, receiver)?;
    let pattern = str_arg(vm, &args[0])?;
    let replacement = match args.get(1) {
        Some(value) => Some(str_arg(vm, value)?),
        None => None,
    };
    if replacement.is_none() && block.is_none() {
        return Err(vm.raise("ArgumentError", "wrong number of arguments (given 1, expected 2)"));
    }
    if pattern.is_empty() {
        return Ok(Value::string(subject));
    }
    let mut out = String::new();
    let mut rest = subject.as_str();
    while let Some(found) = rest.find(&pattern) {
        out.push_str(&rest[..found]);
        let piece = match (&replacement, &block) {
            (Some(replacement), _) => replacement.clone(),
            (None, Some(block)) => {
                let value = vm.yield_block(block, vec![Value::string(pattern.as_str())])?;
                vm.stringify(&value)?
            }
            (None, None) => String::new(),
        };
        out.push_str(&piece);
        rest = &rest[found + pattern.len()..];
        if !global {
            break;
        }
    }
    out.push_str(rest);
    Ok(Value::string(out))
}

fn str_gsub(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    substitute(vm, receiver, &args, block, true)
}

fn str_sub(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    substitute(vm, receiver, &args, block, false)
}

/// Character set of `delete`/`squeeze`/`count` arguments: literal chars
/// and `a-z` ranges.
fn char_set(spec: &str) -> Vec<char> {
    let chars: Vec<char> = spec.chars().collect();
    let mut set = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if i + 2 < chars.len() && chars[i + 1] == '-' {
            set.extend(chars[i]..=chars[i + 2]);
            i += 3;
        } else {
            set.push(chars[i]);
            i += 1;
        }
    }
    set
}

fn str_delete(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let set = char_set(&str_arg(vm, &args[0])?);
    map_text(vm, receiver, |s| s.chars().filter(|c| !set.contains(c)).collect())
}

fn str_squeeze(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 0, 1)?;
    let set = match args.first() {
        Some(value) => Some(char_set(&str_arg(vm, value)?)),
        None => None,
    };
    map_text(vm, receiver, |s| {
        let mut out = String::new();
        for c in s.chars() {
            let squeezable = set.as_ref().is_none_or(|set| set.contains(&c));
            if !(squeezable && out.ends_with(c)) {
                out.push(c);
            }
        }
        out
    })
}

fn str_count(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let set = char_set(&str_arg(vm, &args[0])?);
    let count = text(vm, receiver)?.chars().filter(|c| set.contains(c)).count();
    Ok(Value::Integer(count as i64))
}

#[derive(Clone, Copy)]
enum Justify {
    Left,
    Right,
    Center,
}

fn justify(vm: &Vm, receiver: &Value, args: &[Value], how: Justify) -> Outcome {
    check_args(vm, args, 1, 2)?;
    let subject = text(vm, receiver)?;
    let width = int_arg(vm, &args[0])?.max(0) as usize;
    let pad = match args.get(1) {
        Some(value) => str_arg(vm, value)?,
        None => " ".to_string(),
    };
    if pad.is_empty() {
        return Err(vm.raise("ArgumentError", "zero width padding"));
    }
    let fill = width.saturating_sub(subject.chars().count());
    let padding = |n: usize| pad.chars().cycle().take(n).collect::<String>();
    let (left, right) = match how {
        Justify::Left => (0, fill),
        Justify::Right => (fill, 0),
        Justify::Center => (fill / 2, fill - fill / 2),
    };
    Ok(Value::string(format!("{}{}{}", padding(left), subject, padding(right))))
}

fn str_center(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    justify(vm, receiver, &args, Justify::Center)
}

fn str_ljust(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    justify(vm, receiver, &args, Justify::Left)
}

fn str_rjust(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    justify(vm, receiver, &args, Justify::Right)
}

fn str_ord(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    match text(vm, receiver)?.chars().next() {
        Some(c) => Ok(Value::Integer(c as i64)),
        None => Err(vm.raise("ArgumentError", "empty string")),
    }
}

fn str_succ(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    map_text(vm, receiver, successor)
}

fn str_freeze(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    receiver_str(vm, receiver)?.frozen.set(true);
    Ok(receiver.clone())
}

fn str_frozen_p(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(receiver_str(vm, receiver)?.frozen.get()))
}

fn str_dup(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::string(text(vm, receiver)?))
}

fn str_dedup(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let s = receiver_str(vm, receiver)?;
    if s.frozen.get() {
        return Ok(receiver.clone());
    }
    Ok(Value::frozen_string(s.value.borrow().as_str()))
}

fn str_hash(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let hash = text(vm, receiver)?
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x0100_0000_01b3));
    Ok(Value::Integer(hash as i64))
}

// =============================================================================
// Symbol
// =============================================================================

fn symbol_name(vm: &Vm, receiver: &Value) -> Result<String, Unwind> {
    match receiver {
        Value::Symbol(name) => Ok(name.to_string()),
        other => Err(vm.raise("TypeError", format!("{} is not a symbol", other.inspect()))),
    }
}

fn sym_to_s(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::string(symbol_name(vm, receiver)?))
}

fn sym_itself(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(receiver.clone())
}

fn sym_inspect(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::string(format!(":{}", symbol_name(vm, receiver)?)))
}

fn sym_to_proc(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let name = symbol_name(vm, receiver)?;
    Ok(Value::Proc(Rc::new(Proc {
        body: ProcBody::Symbol(name),
        lambda: true,
    })))
}

fn sym_length(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::Integer(symbol_name(vm, receiver)?.chars().count() as i64))
}

fn sym_eq(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    Ok(Value::bool(*receiver == args[0]))
}

fn sym_cmp(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let name = symbol_name(vm, receiver)?;
    Ok(match &args[0] {
        Value::Symbol(other) => Value::Integer(name.as_str().cmp(other) as i64),
        _ => Value::Nil,
    })
}

fn map_symbol(vm: &Vm, receiver: &Value, edit: impl FnOnce(&str) -> String) -> Outcome {
    Ok(Value::symbol(&edit(&symbol_name(vm, receiver)?)))
}

fn sym_upcase(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    map_symbol(vm, receiver, str::to_uppercase)
}

fn sym_downcase(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    map_symbol(vm, receiver, str::to_lowercase)
}

fn sym_capitalize(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    map_symbol(vm, receiver, capitalize)
}

fn sym_succ(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    map_symbol(vm, receiver, successor)
}

fn sym_start_with_p(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    affix_test(vm, &symbol_name(vm, receiver)?, &args, |s, p| s.starts_with(p))
}

fn sym_end_with_p(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    affix_test(vm, &symbol_name(vm, receiver)?, &args, |s, p| s.ends_with(p))
}

fn sym_empty_p(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(symbol_name(vm, receiver)?.is_empty()))
}

fn sym_aref(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    slice_chars(vm, &symbol_name(vm, receiver)?, &args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successor_carries() {
        assert_eq!(successor("az"), "ba");
        assert_eq!(successor("zz"), "aaa");
        assert_eq!(successor("a9"), "b0");
        assert_eq!(successor("Zz"), "AAa");
        assert_eq!(successor("1.9"), "2.0");
        assert_eq!(successor(""), "");
    }

    #[test]
    fn test_leading_number_parsing() {
        assert_eq!(parse_leading_int("  42abc", 10), Some(42));
        assert_eq!(parse_leading_int("-1_000", 10), Some(-1000));
        assert_eq!(parse_leading_int("ff", 16), Some(255));
        assert_eq!(parse_leading_int("xyz", 10), Some(0));
        assert_eq!(parse_leading_float("3.5e2x"), 350.0);
        assert_eq!(parse_leading_float("1."), 1.0);
        assert_eq!(parse_leading_float("abc"), 0.0);
    }

    #[test]
    fn test_chomp_and_strip() {
        assert_eq!(chomp("line\r\n", None), "line");
        assert_eq!(chomp("hello", Some("lo")), "hel");
        assert_eq!(strip("  padded \n"), "padded");
        assert_eq!(capitalize("hELLO"), "Hello");
        assert_eq!(swapcase("aBc"), "AbC");
    }

    #[test]
    fn test_char_set_ranges() {
        assert_eq!(char_set("a-cx"), vec!['a', 'b', 'c', 'x']);
    }

    #[test]
    fn test_frozen_append_raises() {
        let mut vm = Vm::new();
        let frozen = Value::frozen_string("abc");
        let result = str_append(&mut vm, &frozen, vec![Value::string("d")], None);
        assert!(matches!(result, Err(Unwind::Raise(_))));
        let open = Value::string("abc");
        str_append(&mut vm, &open, vec![Value::string("d"), Value::Integer(33)], None).expect("append");
        assert_eq!(open.as_str().as_deref(), Some("abcd!"));
    }

    #[test]
    fn test_slice_forms() {
        let vm = Vm::new();
        let slice = |args: Vec<Value>| slice_chars(&vm, "hello", &args).ok();
        assert_eq!(slice(vec![Value::Integer(1)]), Some(Value::string("e")));
        assert_eq!(slice(vec![Value::Integer(-1)]), Some(Value::string("o")));
        assert_eq!(slice(vec![Value::Integer(1), Value::Integer(3)]), Some(Value::string("ell")));
        assert_eq!(
            slice(vec![Value::range(Value::Integer(1), Value::Integer(-2), false)]),
            Some(Value::string("ell"))
        );
        assert_eq!(slice(vec![Value::Integer(9)]), Some(Value::Nil));
        assert_eq!(slice(vec![Value::Integer(5), Value::Integer(2)]), Some(Value::string("")));
    }
}
