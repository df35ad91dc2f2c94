//! Binary and unary operator evaluation with the engine's three-tier
//! coercion fallback: native operation on the common type, then integer
//! coercion, then the string-analogue operation.

use crate::ast::{BinOp, UnOp};
use crate::coerce::{self, coerce_pair, coerce_to_int, coerce_to_str, to_f64, CommonArgs};
use crate::context::Context;
use crate::value::Value;

pub fn eval_binop(ctx: &mut Context, op: BinOp, lhs: &Value, rhs: &Value) -> Value {
    // The wildcard propagates through every operator; comparisons against it
    // succeed and are recorded so the driver knows environment inputs were
    // probed.
    if matches!(lhs, Value::Wildcard) || matches!(rhs, Value::Wildcard) {
        if op.is_comparison() {
            ctx.tested_wildcard();
            return Value::Bool(true);
        }
        if !matches!(op, BinOp::Concat) {
            return Value::Wildcard;
        }
    }

    match op {
        BinOp::Add => add(lhs, rhs),
        BinOp::Sub => arith(lhs, rhs, |a, b| a.wrapping_sub(b), |a, b| a - b),
        BinOp::Mul => arith(lhs, rhs, |a, b| a.wrapping_mul(b), |a, b| a * b),
        BinOp::Pow => pow(lhs, rhs),
        BinOp::Div => div(ctx, lhs, rhs),
        BinOp::IntDiv => int_div(ctx, lhs, rhs),
        BinOp::Mod => modulo(lhs, rhs),
        BinOp::Concat => {
            Value::Str(format!("{}{}", coerce_to_str(lhs), coerce_to_str(rhs)))
        }
        BinOp::And => bitwise(lhs, rhs, |a, b| a & b, |a, b| a && b),
        BinOp::Or => bitwise(lhs, rhs, |a, b| a | b, |a, b| a || b),
        BinOp::Xor => bitwise(lhs, rhs, |a, b| a ^ b, |a, b| a != b),
        BinOp::Eqv => bitwise(lhs, rhs, |a, b| !(a ^ b), |a, b| a == b),
        BinOp::Eq | BinOp::Is => Value::Bool(compare(lhs, rhs) == std::cmp::Ordering::Equal),
        BinOp::Ne => Value::Bool(compare(lhs, rhs) != std::cmp::Ordering::Equal),
        BinOp::Lt => Value::Bool(compare(lhs, rhs) == std::cmp::Ordering::Less),
        BinOp::Gt => Value::Bool(compare(lhs, rhs) == std::cmp::Ordering::Greater),
        BinOp::Le => Value::Bool(compare(lhs, rhs) != std::cmp::Ordering::Greater),
        BinOp::Ge => Value::Bool(compare(lhs, rhs) != std::cmp::Ordering::Less),
        BinOp::Like => Value::Bool(like_match(
            &coerce_to_str(lhs),
            &coerce_to_str(rhs),
        )),
    }
}

pub fn eval_unop(op: UnOp, value: &Value) -> Value {
    if matches!(value, Value::Wildcard) {
        return Value::Wildcard;
    }
    match op {
        UnOp::Not => match value {
            Value::Bool(b) => Value::Bool(!b),
            other => match coerce_to_int(other) {
                Some(v) => Value::Int(!v),
                None => Value::Bool(!other.is_truthy()),
            },
        },
        UnOp::Neg => match coerce::coerce_to_num(value) {
            Some(Value::Int(v)) => Value::Int(-v),
            Some(Value::Float(v)) => Value::Float(-v),
            _ => Value::Int(0),
        },
    }
}

/// `+` concatenates when the common type is string, otherwise adds; the
/// final fallback is string concatenation rather than zero.
fn add(lhs: &Value, rhs: &Value) -> Value {
    match coerce_pair(lhs, rhs) {
        CommonArgs::Ints(a, b) => Value::Int(a.wrapping_add(b)),
        CommonArgs::Floats(a, b) => Value::Float(a + b),
        CommonArgs::Strs(_, _) => {
            // Mixed operands still try the integer tier before giving up and
            // concatenating.
            match (coerce_numeric_str(lhs), coerce_numeric_str(rhs)) {
                (Some(a), Some(b)) => Value::Int(a.wrapping_add(b)),
                _ => Value::Str(format!("{}{}", coerce_to_str(lhs), coerce_to_str(rhs))),
            }
        }
    }
}

/// Integer tier for `+`: only strings that are genuinely numeric count,
/// otherwise `"a" + 1` would turn into `1`.
fn coerce_numeric_str(value: &Value) -> Option<i64> {
    match value {
        Value::Str(s) => {
            let t = s.trim();
            if t.parse::<f64>().is_ok() {
                coerce_to_int(value)
            } else {
                None
            }
        }
        Value::Unresolved => None,
        other => coerce_to_int(other),
    }
}

fn arith(
    lhs: &Value,
    rhs: &Value,
    int_op: fn(i64, i64) -> i64,
    float_op: fn(f64, f64) -> f64,
) -> Value {
    match coerce_pair(lhs, rhs) {
        CommonArgs::Ints(a, b) => Value::Int(int_op(a, b)),
        CommonArgs::Floats(a, b) => Value::Float(float_op(a, b)),
        CommonArgs::Strs(_, _) => match (coerce_to_int(lhs), coerce_to_int(rhs)) {
            (Some(a), Some(b)) => Value::Int(int_op(a, b)),
            _ => Value::Int(0),
        },
    }
}

fn pow(lhs: &Value, rhs: &Value) -> Value {
    match (to_f64(lhs), to_f64(rhs)) {
        (Some(a), Some(b)) => {
            let r = a.powf(b);
            if r.is_finite() && r.fract() == 0.0 && r.abs() < i64::MAX as f64 {
                Value::Int(r as i64)
            } else {
                Value::Float(r)
            }
        }
        _ => match (coerce_to_int(lhs), coerce_to_int(rhs)) {
            (Some(a), Some(b)) if b >= 0 && b < 63 => Value::Int(a.wrapping_pow(b as u32)),
            _ => Value::Int(0),
        },
    }
}

/// Division by zero sets the error flag and yields the sentinel; an even
/// integer division renders as an integer.
fn div(ctx: &mut Context, lhs: &Value, rhs: &Value) -> Value {
    match (to_f64(lhs), to_f64(rhs)) {
        (Some(_), Some(b)) if b == 0.0 => {
            ctx.report_error("division by zero");
            Value::Unresolved
        }
        (Some(a), Some(b)) => {
            let r = a / b;
            if r.is_finite() && r.fract() == 0.0 && r.abs() < i64::MAX as f64 {
                Value::Int(r as i64)
            } else {
                Value::Float(r)
            }
        }
        _ => match (coerce_to_int(lhs), coerce_to_int(rhs)) {
            (Some(_), Some(0)) => {
                ctx.report_error("division by zero");
                Value::Unresolved
            }
            (Some(a), Some(b)) => Value::Int(a / b),
            _ => Value::Int(0),
        },
    }
}

fn int_div(ctx: &mut Context, lhs: &Value, rhs: &Value) -> Value {
    match (coerce_to_int(lhs), coerce_to_int(rhs)) {
        (Some(_), Some(0)) => {
            ctx.report_error("integer division by zero");
            Value::Unresolved
        }
        (Some(a), Some(b)) => Value::Int(a / b),
        _ => Value::Int(0),
    }
}

/// `Mod` by zero yields the empty string, matching observed behavior.
fn modulo(lhs: &Value, rhs: &Value) -> Value {
    match (coerce_to_int(lhs), coerce_to_int(rhs)) {
        (Some(_), Some(0)) => Value::Str(String::new()),
        (Some(a), Some(b)) => Value::Int(a % b),
        _ => Value::Int(0),
    }
}

fn bitwise(
    lhs: &Value,
    rhs: &Value,
    int_op: fn(i64, i64) -> i64,
    bool_op: fn(bool, bool) -> bool,
) -> Value {
    if let (Value::Bool(a), Value::Bool(b)) = (lhs, rhs) {
        return Value::Bool(bool_op(*a, *b));
    }
    match (coerce_to_int(lhs), coerce_to_int(rhs)) {
        (Some(a), Some(b)) => Value::Int(int_op(a, b)),
        _ => Value::Bool(bool_op(lhs.is_truthy(), rhs.is_truthy())),
    }
}

/// Comparisons promote to numeric when both sides convert, else compare the
/// display strings.
pub fn compare(lhs: &Value, rhs: &Value) -> std::cmp::Ordering {
    match (to_f64(lhs), to_f64(rhs)) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal),
        _ => coerce_to_str(lhs).cmp(&coerce_to_str(rhs)),
    }
}

/// VBA `Like` patterns: `*`, `?`, `#`, `[set]`, `[!set]`.
pub fn like_match(text: &str, pattern: &str) -> bool {
    fn matches(t: &[char], p: &[char]) -> bool {
        if p.is_empty() {
            return t.is_empty();
        }
        match p[0] {
            '*' => {
                for i in 0..=t.len() {
                    if matches(&t[i..], &p[1..]) {
                        return true;
                    }
                }
                false
            }
            '?' => !t.is_empty() && matches(&t[1..], &p[1..]),
            '#' => !t.is_empty() && t[0].is_ascii_digit() && matches(&t[1..], &p[1..]),
            '[' => {
                let close = match p.iter().position(|c| *c == ']') {
                    Some(i) if i > 0 => i,
                    _ => return !t.is_empty() && t[0] == '[' && matches(&t[1..], &p[1..]),
                };
                if t.is_empty() {
                    return false;
                }
                let (mut set, negate) = if p[1] == '!' {
                    (&p[2..close], true)
                } else {
                    (&p[1..close], false)
                };
                let mut hit = false;
                while !set.is_empty() {
                    if set.len() >= 3 && set[1] == '-' {
                        if t[0] >= set[0] && t[0] <= set[2] {
                            hit = true;
                        }
                        set = &set[3..];
                    } else {
                        if t[0] == set[0] {
                            hit = true;
                        }
                        set = &set[1..];
                    }
                }
                if hit != negate {
                    matches(&t[1..], &p[close + 1..])
                } else {
                    false
                }
            }
            c => !t.is_empty() && t[0] == c && matches(&t[1..], &p[1..]),
        }
    }
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    matches(&t, &p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Limits;

    fn ctx() -> Context {
        Context::root(Limits::default())
    }

    #[test]
    fn numeric_string_addition() {
        let v = eval_binop(&mut ctx(), BinOp::Add, &Value::str("1"), &Value::Int(2));
        assert_eq!(v, Value::Int(3));
    }

    #[test]
    fn non_numeric_addition_concatenates() {
        let v = eval_binop(&mut ctx(), BinOp::Add, &Value::str("a"), &Value::Int(1));
        assert_eq!(v, Value::str("a1"));
    }

    #[test]
    fn concat_treats_sentinel_as_empty() {
        let v = eval_binop(&mut ctx(), BinOp::Concat, &Value::Unresolved, &Value::str("x"));
        assert_eq!(v, Value::str("x"));
    }

    #[test]
    fn division_by_zero_sets_error() {
        let mut c = ctx();
        let v = eval_binop(&mut c, BinOp::Div, &Value::Int(1), &Value::Int(0));
        assert_eq!(v, Value::Unresolved);
        assert!(c.got_error);
    }

    #[test]
    fn mod_by_zero_is_empty_string() {
        let v = eval_binop(&mut ctx(), BinOp::Mod, &Value::Int(5), &Value::Int(0));
        assert_eq!(v, Value::str(""));
    }

    #[test]
    fn even_division_is_int() {
        let v = eval_binop(&mut ctx(), BinOp::Div, &Value::Int(8), &Value::Int(2));
        assert_eq!(v, Value::Int(4));
    }

    #[test]
    fn wildcard_comparison_is_true() {
        let mut c = ctx();
        let v = eval_binop(&mut c, BinOp::Eq, &Value::Wildcard, &Value::str("anything"));
        assert_eq!(v, Value::Bool(true));
        assert!(c.shared().borrow().tested_wildcard);
    }

    #[test]
    fn subtraction_falls_back_to_int_tier() {
        let v = eval_binop(&mut ctx(), BinOp::Sub, &Value::str("10"), &Value::str("true"));
        assert_eq!(v, Value::Int(11));
    }

    #[test]
    fn like_patterns() {
        assert!(like_match("abc123", "abc###"));
        assert!(like_match("aXc", "a?c"));
        assert!(like_match("hello", "h*o"));
        assert!(like_match("b", "[a-c]"));
        assert!(!like_match("d", "[a-c]"));
        assert!(like_match("d", "[!a-c]"));
    }

    #[test]
    fn bool_and_stays_bool() {
        let v = eval_binop(&mut ctx(), BinOp::And, &Value::Bool(true), &Value::Bool(false));
        assert_eq!(v, Value::Bool(false));
    }

    #[test]
    fn int_and_is_bitwise() {
        let v = eval_binop(&mut ctx(), BinOp::And, &Value::Int(6), &Value::Int(3));
        assert_eq!(v, Value::Int(2));
    }
}
