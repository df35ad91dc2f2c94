//! VBA's implicit conversions, matched to how the emulated language actually
//! behaves rather than to the VBA specification.

use crate::value::Value;

/// Display form of the unresolved sentinel in reported output.
pub const SENTINEL_TEXT: &str = "NULL";
/// Display form of the environment wildcard.
pub const WILDCARD_TEXT: &str = "**MATCH ANY**";

/// Renders a float the way VBA prints it: integral values lose the `.0`.
pub fn format_float(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

/// The display form of a value, used in reported actions and diagnostics.
/// Distinct from [`coerce_to_str`]: the sentinel shows as `NULL` here.
pub fn display(value: &Value) -> String {
    match value {
        Value::Unresolved => SENTINEL_TEXT.to_string(),
        Value::Wildcard => WILDCARD_TEXT.to_string(),
        Value::Int(v) => format!("{v}"),
        Value::Float(v) => format_float(*v),
        Value::Str(s) => s.clone(),
        Value::Bool(b) => if *b { "True" } else { "False" }.to_string(),
        Value::List(items) => {
            let items = items.borrow();
            // A list of character codes renders as the decoded string; this
            // is how byte-array payloads become readable in reports.
            if !items.is_empty()
                && items
                    .iter()
                    .all(|v| matches!(v, Value::Int(c) if (0..=255).contains(c)))
            {
                return items
                    .iter()
                    .map(|v| match v {
                        Value::Int(c) => (*c as u8) as char,
                        _ => '\0',
                    })
                    .collect();
            }
            let parts: Vec<String> = items.iter().map(display).collect();
            format!("[{}]", parts.join(", "))
        }
        Value::Map(map) => {
            let map = map.borrow();
            let parts: Vec<String> = map
                .entries
                .iter()
                .map(|(k, v)| format!("{k}: {}", display(v)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        Value::Procedure(p) => format!("<procedure {}>", p.name),
        Value::Builtin(n) => format!("<builtin {n}>"),
    }
}

/// String coercion for concatenation and String-typed parameters. The
/// sentinel becomes the empty string here, not `NULL`.
pub fn coerce_to_str(value: &Value) -> String {
    match value {
        Value::Unresolved => String::new(),
        other => display(other),
    }
}

/// Integer coercion, the second tier of the operator fallback.
pub fn coerce_to_int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(v) => Some(*v),
        Value::Float(v) => Some(*v as i64),
        Value::Bool(b) => Some(if *b { -1 } else { 0 }),
        Value::Unresolved | Value::Wildcard => Some(0),
        Value::Str(s) => {
            let t = s.trim();
            if t.is_empty() {
                return Some(0);
            }
            if let Ok(v) = t.parse::<i64>() {
                return Some(v);
            }
            if let Ok(v) = t.parse::<f64>() {
                return Some(v as i64);
            }
            let lower = t.to_ascii_lowercase();
            if let Some(hex) = lower.strip_prefix("&h") {
                return i64::from_str_radix(hex, 16).ok();
            }
            if t.eq_ignore_ascii_case("true") {
                return Some(-1);
            }
            if t.eq_ignore_ascii_case("false") {
                return Some(0);
            }
            None
        }
        _ => None,
    }
}

/// Numeric coercion keeping int/float distinction.
pub fn coerce_to_num(value: &Value) -> Option<Value> {
    match value {
        Value::Int(_) | Value::Float(_) => Some(value.clone()),
        Value::Bool(b) => Some(Value::Int(if *b { -1 } else { 0 })),
        Value::Str(s) => {
            let t = s.trim();
            if let Ok(v) = t.parse::<i64>() {
                return Some(Value::Int(v));
            }
            if let Ok(v) = t.parse::<f64>() {
                return Some(Value::Float(v));
            }
            let lower = t.to_ascii_lowercase();
            if let Some(hex) = lower.strip_prefix("&h") {
                return i64::from_str_radix(hex, 16).ok().map(Value::Int);
            }
            None
        }
        Value::Unresolved => Some(Value::Int(0)),
        _ => None,
    }
}

pub fn to_f64(value: &Value) -> Option<f64> {
    match coerce_to_num(value)? {
        Value::Int(v) => Some(v as f64),
        Value::Float(v) => Some(v),
        _ => None,
    }
}

/// The common type a pair of operands promotes to before a native operation.
pub enum CommonArgs {
    Ints(i64, i64),
    Floats(f64, f64),
    Strs(String, String),
}

/// Promotes both operands to a shared type: numbers when every operand
/// converts, strings otherwise. Mirrors the original's `coerce_args`.
pub fn coerce_pair(lhs: &Value, rhs: &Value) -> CommonArgs {
    let ln = coerce_to_num(lhs);
    let rn = coerce_to_num(rhs);
    match (ln, rn) {
        (Some(Value::Int(a)), Some(Value::Int(b))) => CommonArgs::Ints(a, b),
        (Some(a), Some(b)) => {
            let fa = match a {
                Value::Int(v) => v as f64,
                Value::Float(v) => v,
                _ => 0.0,
            };
            let fb = match b {
                Value::Int(v) => v as f64,
                Value::Float(v) => v,
                _ => 0.0,
            };
            CommonArgs::Floats(fa, fb)
        }
        _ => CommonArgs::Strs(coerce_to_str(lhs), coerce_to_str(rhs)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_display_vs_coerce() {
        assert_eq!(display(&Value::Unresolved), "NULL");
        assert_eq!(coerce_to_str(&Value::Unresolved), "");
    }

    #[test]
    fn int_coercion_forms() {
        assert_eq!(coerce_to_int(&Value::str(" 42 ")), Some(42));
        assert_eq!(coerce_to_int(&Value::str("3.9")), Some(3));
        assert_eq!(coerce_to_int(&Value::str("&h10")), Some(16));
        assert_eq!(coerce_to_int(&Value::Bool(true)), Some(-1));
        assert_eq!(coerce_to_int(&Value::str("bogus")), None);
    }

    #[test]
    fn float_display_drops_trailing_zero() {
        assert_eq!(display(&Value::Float(4.0)), "4");
        assert_eq!(display(&Value::Float(4.5)), "4.5");
    }

    #[test]
    fn char_code_list_renders_as_text() {
        let v = Value::list(vec![Value::Int(104), Value::Int(105)]);
        assert_eq!(display(&v), "hi");
    }
}
