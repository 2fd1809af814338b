use std::cmp::Ordering;
use std::rc::Rc;

use crate::lang::literal::format_float;
use crate::runtime::builtins::{Builtin, Outcome, check_args, class_name, int_arg};
use crate::runtime::frame::Proc;
use crate::runtime::runtime_error::Unwind;
use crate::runtime::value::Value;
use crate::runtime::vm::Vm;

type Block = Option<Rc<Proc>>;

pub(super) fn lookup(class: &str, name: &str) -> Option<Builtin> {
    let found: Builtin = match (class, name) {
        ("Numeric", "+") => num_add,
        ("Numeric", "-") => num_sub,
        ("Numeric", "*") => num_mul,
        ("Numeric", "/") => num_div,
        ("Numeric", "%" | "modulo") => num_mod,
        ("Numeric", "**" | "pow") => num_pow,
        ("Numeric", "-@") => num_negate,
        ("Numeric", "+@") => num_itself,
        ("Numeric", "==" | "===") => num_eq,
        ("Numeric", "<") => num_lt,
        ("Numeric", "<=") => num_le,
        ("Numeric", ">") => num_gt,
        ("Numeric", ">=") => num_ge,
        ("Numeric", "<=>") => num_cmp,
        ("Numeric", "coerce") => num_coerce,
        ("Numeric", "abs" | "magnitude") => num_abs,
        ("Numeric", "zero?") => num_zero_p,
        ("Numeric", "positive?") => num_positive_p,
        ("Numeric", "negative?") => num_negative_p,
        ("Numeric", "integer?") => num_integer_p,
        ("Numeric", "fdiv") => num_fdiv,
        ("Numeric", "divmod") => num_divmod,
        ("Numeric", "div") => num_int_div,
        ("Numeric", "step") => num_step,
        ("Numeric", "to_f") => num_to_f,
        ("Numeric", "to_i" | "to_int" | "truncate") => num_to_i,

        ("Integer", "to_s" | "inspect") => int_to_s,
        ("Integer", "&") => int_and,
        ("Integer", "|") => int_or,
        ("Integer", "^") => int_xor,
        ("Integer", "<<") => int_shl,
        ("Integer", ">>") => int_shr,
        ("Integer", "~") => int_not,
        ("Integer", "[]") => int_bit,
        ("Integer", "times") => int_times,
        ("Integer", "upto") => int_upto,
        ("Integer", "downto") => int_downto,
        ("Integer", "succ" | "next") => int_succ,
        ("Integer", "pred") => int_pred,
        ("Integer", "even?") => int_even_p,
        ("Integer", "odd?") => int_odd_p,
        ("Integer", "gcd") => int_gcd,
        ("Integer", "lcm") => int_lcm,
        ("Integer", "digits") => int_digits,
        ("Integer", "bit_length") => int_bit_length,
        ("Integer", "chr") => int_chr,
        ("Integer", "ord") => num_itself,
        ("Integer", "round") => int_round,
        ("Integer", "floor") => int_floor,
        ("Integer", "ceil") => int_ceil,
        ("Integer", "hash") => num_itself,

        ("Float", "to_s" | "inspect") => float_to_s,
        ("Float", "round") => float_round,
        ("Float", "floor") => float_floor,
        ("Float", "ceil") => float_ceil,
        ("Float", "to_i" | "to_int" | "truncate") => float_to_i,
        ("Float", "nan?") => float_nan_p,
        ("Float", "infinite?") => float_infinite_p,
        ("Float", "finite?") => float_finite_p,
        _ => return None,
    };
    Some(found)
}

// =============================================================================
// Arithmetic
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arith {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

fn overflow(vm: &Vm) -> Unwind {
    vm.raise("RangeError", "integer overflow")
}

fn zero_division(vm: &Vm) -> Unwind {
    vm.raise("ZeroDivisionError", "divided by 0")
}

fn coerce_error(vm: &Vm, receiver: &Value, operand: &Value) -> Unwind {
    let operand = match operand {
        Value::Nil | Value::True | Value::False => operand.inspect(),
        other => class_name(vm, other),
    };
    vm.raise(
        "TypeError",
        format!("{} can't be coerced into {}", operand, class_name(vm, receiver)),
    )
}

/// Quotient rounded toward negative infinity.
fn floor_div(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    if a % b != 0 && ((a < 0) != (b < 0)) { Some(q - 1) } else { Some(q) }
}

/// Remainder with the sign of the divisor.
fn floor_mod(a: i64, b: i64) -> Option<i64> {
    let r = a.checked_rem(b)?;
    if r != 0 && ((r < 0) != (b < 0)) { Some(r + b) } else { Some(r) }
}

fn float_mod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && ((r < 0.0) != (b < 0.0)) { r + b } else { r }
}

fn int_arith(vm: &Vm, a: i64, b: i64, op: Arith) -> Outcome {
    let result = match op {
        Arith::Add => a.checked_add(b),
        Arith::Sub => a.checked_sub(b),
        Arith::Mul => a.checked_mul(b),
        Arith::Div | Arith::Mod if b == 0 => return Err(zero_division(vm)),
        Arith::Div => floor_div(a, b),
        Arith::Mod => floor_mod(a, b),
        Arith::Pow if b < 0 => return Ok(Value::Float((a as f64).powf(b as f64))),
        Arith::Pow => u32::try_from(b).ok().and_then(|b| a.checked_pow(b)),
    };
    result.map(Value::Integer).ok_or_else(|| overflow(vm))
}

fn float_arith(a: f64, b: f64, op: Arith) -> Value {
    Value::Float(match op {
        Arith::Add => a + b,
        Arith::Sub => a - b,
        Arith::Mul => a * b,
        Arith::Div => a / b,
        Arith::Mod => float_mod(a, b),
        Arith::Pow => a.powf(b),
    })
}

/// Binary arithmetic on two numbers; integers stay integers, anything
/// involving a float widens.
fn arith(vm: &Vm, receiver: &Value, operand: &Value, op: Arith) -> Outcome {
    match (receiver, operand) {
        (Value::Integer(a), Value::Integer(b)) => int_arith(vm, *a, *b, op),
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
            match receiver.as_float().zip(operand.as_float()) {
                Some((a, b)) => Ok(float_arith(a, b, op)),
                None => Err(coerce_error(vm, receiver, operand)),
            }
        }
        _ => Err(coerce_error(vm, receiver, operand)),
    }
}

fn binary(vm: &mut Vm, receiver: &Value, args: &[Value], op: Arith) -> Outcome {
    check_args(vm, args, 1, 1)?;
    arith(vm, receiver, &args[0], op)
}

fn num_add(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    binary(vm, receiver, &args, Arith::Add)
}

fn num_sub(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    binary(vm, receiver, &args, Arith::Sub)
}

fn num_mul(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    binary(vm, receiver, &args, Arith::Mul)
}

fn num_div(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    binary(vm, receiver, &args, Arith::Div)
}

fn num_mod(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    binary(vm, receiver, &args, Arith::Mod)
}

fn num_pow(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    binary(vm, receiver, &args, Arith::Pow)
}

fn num_negate(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    match receiver {
        Value::Integer(n) => n.checked_neg().map(Value::Integer).ok_or_else(|| overflow(vm)),
        Value::Float(f) => Ok(Value::Float(-f)),
        other => Err(coerce_error(vm, other, other)),
    }
}

fn num_itself(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(receiver.clone())
}

fn num_eq(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    Ok(Value::bool(match (receiver, &args[0]) {
        (Value::Integer(a), Value::Integer(b)) => a == b,
        (_, other) => match (receiver.as_float(), other.as_float()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }))
}

fn ordering(vm: &Vm, receiver: &Value, operand: &Value) -> Result<Option<Ordering>, Unwind> {
    match (receiver, operand) {
        (Value::Integer(a), Value::Integer(b)) => Ok(Some(a.cmp(b))),
        _ => match (receiver.as_float(), operand.as_float()) {
            (Some(a), Some(b)) => Ok(a.partial_cmp(&b)),
            _ => Err(vm.raise(
                "ArgumentError",
                format!(
                    "comparison of {} with {} failed",
                    class_name(vm, receiver),
                    match operand {
                        Value::Nil => "nil".to_string(),
                        other => class_name(vm, other),
                    }
                ),
            )),
        },
    }
}

fn relation(vm: &Vm, receiver: &Value, args: &[Value], test: fn(Ordering) -> bool) -> Outcome {
    check_args(vm, args, 1, 1)?;
    Ok(Value::bool(ordering(vm, receiver, &args[0])?.is_some_and(test)))
}

fn num_lt(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    relation(vm, receiver, &args, Ordering::is_lt)
}

fn num_le(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    relation(vm, receiver, &args, Ordering::is_le)
}

fn num_gt(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    relation(vm, receiver, &args, Ordering::is_gt)
}

fn num_ge(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    relation(vm, receiver, &args, Ordering::is_ge)
}

fn num_cmp(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    if args[0].as_float().is_none() {
        return Ok(Value::Nil);
    }
    Ok(match ordering(vm, receiver, &args[0])? {
        Some(order) => Value::Integer(order as i64),
        None => Value::Nil,
    })
}

fn num_coerce(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    match (receiver, &args[0]) {
        (Value::Integer(_), Value::Integer(_)) => Ok(Value::array(vec![args[0].clone(), receiver.clone()])),
        _ => match (args[0].as_float(), receiver.as_float()) {
            (Some(a), Some(b)) => Ok(Value::array(vec![Value::Float(a), Value::Float(b)])),
            _ => Err(coerce_error(vm, receiver, &args[0])),
        },
    }
}

fn num_abs(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    match receiver {
        Value::Integer(n) => n.checked_abs().map(Value::Integer).ok_or_else(|| overflow(vm)),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => Ok(other.clone()),
    }
}

fn sign_of(receiver: &Value) -> Option<Ordering> {
    match receiver {
        Value::Integer(n) => Some(n.cmp(&0)),
        other => other.as_float().and_then(|f| f.partial_cmp(&0.0)),
    }
}

fn num_zero_p(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(sign_of(receiver) == Some(Ordering::Equal)))
}

fn num_positive_p(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(sign_of(receiver) == Some(Ordering::Greater)))
}

fn num_negative_p(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(sign_of(receiver) == Some(Ordering::Less)))
}

fn num_integer_p(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(matches!(receiver, Value::Integer(_))))
}

fn float_operand(vm: &Vm, receiver: &Value, operand: &Value) -> Result<f64, Unwind> {
    operand.as_float().ok_or_else(|| coerce_error(vm, receiver, operand))
}

fn num_fdiv(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    let a = float_operand(vm, receiver, receiver)?;
    let b = float_operand(vm, receiver, &args[0])?;
    Ok(Value::Float(a / b))
}

fn num_divmod(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    match (receiver, &args[0]) {
        (Value::Integer(_), Value::Integer(_)) => {
            let quotient = arith(vm, receiver, &args[0], Arith::Div)?;
            let remainder = arith(vm, receiver, &args[0], Arith::Mod)?;
            Ok(Value::array(vec![quotient, remainder]))
        }
        _ => {
            let a = float_operand(vm, receiver, receiver)?;
            let b = float_operand(vm, receiver, &args[0])?;
            if b == 0.0 {
                return Err(zero_division(vm));
            }
            let quotient = (a / b).floor();
            Ok(Value::array(vec![Value::Integer(quotient as i64), Value::Float(float_mod(a, b))]))
        }
    }
}

fn num_int_div(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 1, 1)?;
    match arith(vm, receiver, &args[0], Arith::Div)? {
        Value::Float(f) if f.is_finite() => Ok(Value::Integer(f.floor() as i64)),
        Value::Float(_) => Err(zero_division(vm)),
        other => Ok(other),
    }
}

/// `step(limit, by)`: yields from the receiver toward `limit`.
fn num_step(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    check_args(vm, &args, 1, 2)?;
    let limit = args[0].clone();
    let by = if args.len() > 1 { args[1].clone() } else { Value::Integer(1) };
    if sign_of(&by) == Some(Ordering::Equal) {
        return Err(vm.raise("ArgumentError", "step can't be 0"));
    }
    let ascending = sign_of(&by) == Some(Ordering::Greater);
    let mut values = Vec::new();
    let mut current = receiver.clone();
    loop {
        let order = ordering(vm, &current, &limit)?;
        let past = match order {
            Some(Ordering::Greater) => ascending,
            Some(Ordering::Less) => !ascending,
            Some(Ordering::Equal) => false,
            None => true,
        };
        if past {
            break;
        }
        match &block {
            Some(block) => {
                vm.yield_block(block, vec![current.clone()])?;
            }
            None => values.push(current.clone()),
        }
        current = arith(vm, &current, &by, Arith::Add)?;
    }
    Ok(match block {
        Some(_) => receiver.clone(),
        None => Value::array(values),
    })
}

fn num_to_f(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::Float(float_operand(vm, receiver, receiver)?))
}

fn num_to_i(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::Integer(int_arg(vm, receiver)?))
}

// =============================================================================
// Integer
// =============================================================================

fn receiver_int(vm: &Vm, receiver: &Value) -> Result<i64, Unwind> {
    int_arg(vm, receiver)
}

fn int_to_s(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 0, 1)?;
    let n = receiver_int(vm, receiver)?;
    let radix = match args.first() {
        Some(value) => int_arg(vm, value)?,
        None => 10,
    };
    if !(2..=36).contains(&radix) {
        return Err(vm.raise("ArgumentError", format!("invalid radix {}", radix)));
    }
    Ok(Value::string(to_radix(n, radix as u32)))
}

fn to_radix(n: i64, radix: u32) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    let mut rest = n.unsigned_abs();
    while rest > 0 {
        let digit = (rest % radix as u64) as u32;
        digits.push(std::char::from_digit(digit, radix).unwrap_or('?'));
        rest /= radix as u64;
    }
    if n < 0 {
        digits.push('-');
    }
    digits.iter().rev().collect()
}

fn int_operands(vm: &Vm, receiver: &Value, args: &[Value]) -> Result<(i64, i64), Unwind> {
    check_args(vm, args, 1, 1)?;
    Ok((receiver_int(vm, receiver)?, int_arg(vm, &args[0])?))
}

fn int_and(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    let (a, b) = int_operands(vm, receiver, &args)?;
    Ok(Value::Integer(a & b))
}

fn int_or(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    let (a, b) = int_operands(vm, receiver, &args)?;
    Ok(Value::Integer(a | b))
}

fn int_xor(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    let (a, b) = int_operands(vm, receiver, &args)?;
    Ok(Value::Integer(a ^ b))
}

fn shift_left(vm: &Vm, a: i64, by: i64) -> Outcome {
    if by < 0 {
        return Ok(Value::Integer(a >> by.unsigned_abs().min(63)));
    }
    let shifted = u32::try_from(by).ok().and_then(|by| a.checked_shl(by));
    match shifted {
        Some(result) if result >> by == a => Ok(Value::Integer(result)),
        _ if a == 0 => Ok(Value::Integer(0)),
        _ => Err(overflow(vm)),
    }
}

fn int_shl(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    let (a, b) = int_operands(vm, receiver, &args)?;
    shift_left(vm, a, b)
}

fn int_shr(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    let (a, b) = int_operands(vm, receiver, &args)?;
    match b.checked_neg() {
        Some(b) => shift_left(vm, a, b),
        None => Ok(Value::Integer(if a < 0 { -1 } else { 0 })),
    }
}

fn int_not(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::Integer(!receiver_int(vm, receiver)?))
}

fn int_bit(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    let (a, b) = int_operands(vm, receiver, &args)?;
    let bit = match u32::try_from(b) {
        Ok(b) if b < 64 => (a >> b) & 1,
        Ok(_) => i64::from(a < 0),
        Err(_) => 0,
    };
    Ok(Value::Integer(bit))
}

/// Yields each integer in `from..=to` stepping by `step`, or collects them
/// when there is no block.
fn count(vm: &mut Vm, receiver: &Value, from: i64, to: i64, step: i64, block: Block) -> Outcome {
    let mut values = Vec::new();
    let mut i = from;
    while (step > 0 && i <= to) || (step < 0 && i >= to) {
        match &block {
            Some(block) => {
                vm.yield_block(block, vec![Value::Integer(i)])?;
            }
            None => values.push(Value::Integer(i)),
        }
        match i.checked_add(step) {
            Some(next) => i = next,
            None => break,
        }
    }
    Ok(match block {
        Some(_) => receiver.clone(),
        None => Value::array(values),
    })
}

fn int_times(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, block: Block) -> Outcome {
    let n = receiver_int(vm, receiver)?;
    count(vm, receiver, 0, n.saturating_sub(1), 1, block)
}

fn int_upto(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    let (from, to) = int_operands(vm, receiver, &args)?;
    count(vm, receiver, from, to, 1, block)
}

fn int_downto(vm: &mut Vm, receiver: &Value, args: Vec<Value>, block: Block) -> Outcome {
    let (from, to) = int_operands(vm, receiver, &args)?;
    count(vm, receiver, from, to, -1, block)
}

fn int_succ(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    int_arith(vm, receiver_int(vm, receiver)?, 1, Arith::Add)
}

fn int_pred(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    int_arith(vm, receiver_int(vm, receiver)?, 1, Arith::Sub)
}

fn int_even_p(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(receiver_int(vm, receiver)? % 2 == 0))
}

fn int_odd_p(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(receiver_int(vm, receiver)? % 2 != 0))
}

fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.unsigned_abs(), b.unsigned_abs());
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a as i64
}

fn int_gcd(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    let (a, b) = int_operands(vm, receiver, &args)?;
    Ok(Value::Integer(gcd(a, b)))
}

fn int_lcm(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    let (a, b) = int_operands(vm, receiver, &args)?;
    if a == 0 || b == 0 {
        return Ok(Value::Integer(0));
    }
    (a / gcd(a, b))
        .checked_mul(b)
        .and_then(i64::checked_abs)
        .map(Value::Integer)
        .ok_or_else(|| overflow(vm))
}

fn int_digits(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 0, 1)?;
    let n = receiver_int(vm, receiver)?;
    let base = match args.first() {
        Some(value) => int_arg(vm, value)?,
        None => 10,
    };
    if n < 0 {
        return Err(vm.raise("ArgumentError", "out of domain"));
    }
    if base < 2 {
        return Err(vm.raise("ArgumentError", format!("invalid radix {}", base)));
    }
    let mut digits = vec![Value::Integer(n % base)];
    let mut rest = n / base;
    while rest > 0 {
        digits.push(Value::Integer(rest % base));
        rest /= base;
    }
    Ok(Value::array(digits))
}

fn int_bit_length(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let n = receiver_int(vm, receiver)?;
    let magnitude = if n < 0 { !n } else { n };
    Ok(Value::Integer(i64::from(64 - magnitude.leading_zeros())))
}

fn int_chr(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let n = receiver_int(vm, receiver)?;
    u32::try_from(n)
        .ok()
        .and_then(char::from_u32)
        .map(|c| Value::string(c.to_string()))
        .ok_or_else(|| vm.raise("RangeError", format!("{} out of char range", n)))
}

#[derive(Clone, Copy)]
enum Rounding {
    Half,
    Floor,
    Ceil,
}

/// `round`, `floor`, `ceil` on integers: negative digit counts round to
/// tens, hundreds, and so on. Halves round away from zero.
fn round_integer(vm: &Vm, n: i64, args: &[Value], mode: Rounding) -> Outcome {
    check_args(vm, args, 0, 1)?;
    let digits = match args.first() {
        Some(value) => int_arg(vm, value)?,
        None => 0,
    };
    if digits >= 0 {
        return Ok(Value::Integer(n));
    }
    let unit = u32::try_from(-digits)
        .ok()
        .and_then(|exp| 10i64.checked_pow(exp))
        .ok_or_else(|| overflow(vm))?;
    let remainder = n % unit;
    let base = n - remainder;
    let away = if n < 0 { base - unit } else { base + unit };
    let rounded = match mode {
        _ if remainder == 0 => base,
        Rounding::Half if remainder.abs() * 2 >= unit => away,
        Rounding::Half => base,
        Rounding::Floor if n < 0 => away,
        Rounding::Ceil if n > 0 => away,
        Rounding::Floor | Rounding::Ceil => base,
    };
    Ok(Value::Integer(rounded))
}

fn int_round(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    round_integer(vm, receiver_int(vm, receiver)?, &args, Rounding::Half)
}

fn int_floor(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    round_integer(vm, receiver_int(vm, receiver)?, &args, Rounding::Floor)
}

fn int_ceil(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    round_integer(vm, receiver_int(vm, receiver)?, &args, Rounding::Ceil)
}

// =============================================================================
// Float
// =============================================================================

fn receiver_float(vm: &Vm, receiver: &Value) -> Result<f64, Unwind> {
    float_operand(vm, receiver, receiver)
}

fn float_to_s(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::string(format_float(receiver_float(vm, receiver)?)))
}

fn float_to_integer(vm: &Vm, f: f64) -> Outcome {
    if f.is_nan() {
        return Err(vm.raise("FloatDomainError", "NaN"));
    }
    if f.is_infinite() {
        return Err(vm.raise("FloatDomainError", if f > 0.0 { "Infinity" } else { "-Infinity" }));
    }
    if f >= i64::MAX as f64 || f < i64::MIN as f64 {
        return Err(overflow(vm));
    }
    Ok(Value::Integer(f as i64))
}

/// Rounds half away from zero; with a positive digit count the result
/// stays a float.
fn float_round(vm: &mut Vm, receiver: &Value, args: Vec<Value>, _block: Block) -> Outcome {
    check_args(vm, &args, 0, 1)?;
    let f = receiver_float(vm, receiver)?;
    let digits = match args.first() {
        Some(value) => int_arg(vm, value)?,
        None => 0,
    };
    if digits > 0 {
        let scale = 10f64.powi(digits.min(300) as i32);
        return Ok(Value::Float((f * scale).round() / scale));
    }
    let rounded = float_to_integer(vm, f.round())?;
    if digits == 0 {
        return Ok(rounded);
    }
    match rounded {
        Value::Integer(n) => round_integer(vm, n, &[Value::Integer(digits)], Rounding::Half),
        other => Ok(other),
    }
}

fn float_floor(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    float_to_integer(vm, receiver_float(vm, receiver)?.floor())
}

fn float_ceil(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    float_to_integer(vm, receiver_float(vm, receiver)?.ceil())
}

fn float_to_i(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    float_to_integer(vm, receiver_float(vm, receiver)?.trunc())
}

fn float_nan_p(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(receiver_float(vm, receiver)?.is_nan()))
}

fn float_infinite_p(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    let f = receiver_float(vm, receiver)?;
    Ok(if f.is_infinite() {
        Value::Integer(if f > 0.0 { 1 } else { -1 })
    } else {
        Value::Nil
    })
}

fn float_finite_p(vm: &mut Vm, receiver: &Value, _args: Vec<Value>, _block: Block) -> Outcome {
    Ok(Value::bool(receiver_float(vm, receiver)?.is_finite()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floored_division_and_modulo() {
        assert_eq!(floor_div(7, 2), Some(3));
        assert_eq!(floor_div(-7, 2), Some(-4));
        assert_eq!(floor_div(7, -2), Some(-4));
        assert_eq!(floor_mod(-7, 2), Some(1));
        assert_eq!(floor_mod(7, -2), Some(-1));
        assert_eq!(floor_div(i64::MIN, -1), None);
        assert_eq!(float_mod(-7.0, 2.0), 1.0);
    }

    #[test]
    fn test_int_arith_errors() {
        let vm = Vm::new();
        assert!(matches!(int_arith(&vm, 1, 0, Arith::Div), Err(Unwind::Raise(_))));
        assert!(matches!(int_arith(&vm, i64::MAX, 1, Arith::Add), Err(Unwind::Raise(_))));
        assert_eq!(int_arith(&vm, 2, 10, Arith::Pow).ok(), Some(Value::Integer(1024)));
        assert_eq!(int_arith(&vm, 2, -1, Arith::Pow).ok(), Some(Value::Float(0.5)));
    }

    #[test]
    fn test_mixed_arith_widens() {
        let vm = Vm::new();
        let sum = arith(&vm, &Value::Integer(1), &Value::Float(0.5), Arith::Add).ok();
        assert_eq!(sum, Some(Value::Float(1.5)));
        assert!(arith(&vm, &Value::Integer(1), &Value::string("x"), Arith::Add).is_err());
    }

    #[test]
    fn test_to_radix() {
        assert_eq!(to_radix(255, 16), "ff");
        assert_eq!(to_radix(-5, 2), "-101");
        assert_eq!(to_radix(0, 8), "0");
    }

    #[test]
    fn test_integer_round_to_tens() {
        let vm = Vm::new();
        let round = |n: i64, digits: i64, mode| round_integer(&vm, n, &[Value::Integer(digits)], mode).ok();
        assert_eq!(round(1250, -2, Rounding::Half), Some(Value::Integer(1300)));
        assert_eq!(round(-15, -1, Rounding::Half), Some(Value::Integer(-20)));
        assert_eq!(round(-11, -1, Rounding::Floor), Some(Value::Integer(-20)));
        assert_eq!(round(11, -1, Rounding::Ceil), Some(Value::Integer(20)));
        assert_eq!(round(7, 1, Rounding::Half), Some(Value::Integer(7)));
    }
}
