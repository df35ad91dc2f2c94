//! The builtin VBA function library: a process-wide, read-only registry
//! consulted by name resolution and never mutated per-run.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{Datelike, Local, Timelike};
use log::debug;

use crate::coerce::{coerce_to_int, coerce_to_str, display, to_f64};
use crate::context::Context;
use crate::value::{MapObject, Value};

pub type BuiltinFn = fn(&mut Context, &[Value]) -> Value;

fn registry() -> &'static HashMap<&'static str, BuiltinFn> {
    static REGISTRY: OnceLock<HashMap<&'static str, BuiltinFn>> = OnceLock::new();
    REGISTRY.get_or_init(build_registry)
}

/// Canonical registry name for a builtin, if one exists. `$`-suffixed legacy
/// names resolve to their plain forms.
pub fn lookup(name: &str) -> Option<&'static str> {
    let lower = name.to_ascii_lowercase();
    let lower = lower.strip_suffix('$').unwrap_or(&lower);
    registry().get_key_value(lower).map(|(k, _)| *k)
}

pub fn call(ctx: &mut Context, name: &str, params: &[Value]) -> Value {
    match lookup(name) {
        Some(key) => {
            debug!("builtin {key}({} args)", params.len());
            let f = registry()[key];
            f(ctx, params)
        }
        None => Value::Unresolved,
    }
}

fn arg<'a>(params: &'a [Value], i: usize) -> &'a Value {
    params.get(i).unwrap_or(&Value::Unresolved)
}

fn arg_str(params: &[Value], i: usize) -> String {
    coerce_to_str(arg(params, i))
}

fn arg_int(params: &[Value], i: usize) -> i64 {
    coerce_to_int(arg(params, i)).unwrap_or(0)
}

fn arg_f64(params: &[Value], i: usize) -> f64 {
    to_f64(arg(params, i)).unwrap_or(0.0)
}

fn build_registry() -> HashMap<&'static str, BuiltinFn> {
    let mut m: HashMap<&'static str, BuiltinFn> = HashMap::new();

    // strings
    m.insert("chr", b_chr);
    m.insert("chrw", b_chr);
    m.insert("chrb", b_chr);
    m.insert("asc", b_asc);
    m.insert("ascw", b_asc);
    m.insert("ascb", b_asc);
    m.insert("len", b_len);
    m.insert("mid", b_mid);
    m.insert("midb", b_mid);
    m.insert("left", b_left);
    m.insert("right", b_right);
    m.insert("ucase", b_ucase);
    m.insert("lcase", b_lcase);
    m.insert("trim", b_trim);
    m.insert("ltrim", b_ltrim);
    m.insert("rtrim", b_rtrim);
    m.insert("strreverse", b_strreverse);
    m.insert("replace", b_replace);
    m.insert("instr", b_instr);
    m.insert("instrrev", b_instrrev);
    m.insert("split", b_split);
    m.insert("join", b_join);
    m.insert("space", b_space);
    m.insert("string", b_string);
    m.insert("strcomp", b_strcomp);
    m.insert("strconv", b_strconv);
    m.insert("format", b_format);

    // conversion
    m.insert("cstr", b_cstr);
    m.insert("cint", b_cint);
    m.insert("clng", b_cint);
    m.insert("cbyte", b_cbyte);
    m.insert("cbool", b_cbool);
    m.insert("cdbl", b_cdbl);
    m.insert("csng", b_cdbl);
    m.insert("cvar", b_cstr);
    m.insert("int", b_int);
    m.insert("fix", b_fix);
    m.insert("hex", b_hex);
    m.insert("oct", b_oct);
    m.insert("val", b_val);

    // math
    m.insert("abs", b_abs);
    m.insert("sqr", b_sqr);
    m.insert("round", b_round);
    m.insert("sgn", b_sgn);
    m.insert("rnd", b_rnd);
    m.insert("atn", b_atn);
    m.insert("cos", b_cos);
    m.insert("sin", b_sin);
    m.insert("tan", b_tan);
    m.insert("log", b_log);
    m.insert("exp", b_exp);

    // arrays
    m.insert("array", b_array);
    m.insert("ubound", b_ubound);
    m.insert("lbound", b_lbound);

    // inspection
    m.insert("isnumeric", b_isnumeric);
    m.insert("isempty", b_isempty);
    m.insert("isnull", b_isnull);
    m.insert("isarray", b_isarray);
    m.insert("isobject", b_isobject);
    m.insert("ismissing", b_isnull);
    m.insert("typename", b_typename);
    m.insert("vartype", b_vartype);
    m.insert("iif", b_iif);

    // time
    m.insert("now", b_now);
    m.insert("date", b_date);
    m.insert("time", b_time);
    m.insert("timer", b_timer);
    m.insert("year", b_year);
    m.insert("month", b_month);
    m.insert("day", b_day);
    m.insert("hour", b_hour);
    m.insert("minute", b_minute);
    m.insert("second", b_second);

    // environment / host surface
    m.insert("environ", b_environ);
    m.insert("shell", b_shell);
    m.insert("createobject", b_createobject);
    m.insert("getobject", b_createobject);
    m.insert("msgbox", b_msgbox);
    m.insert("inputbox", b_inputbox);
    m.insert("doevents", b_noop);
    m.insert("randomize", b_noop);
    m.insert("beep", b_noop);
    m.insert("sleep", b_noop);
    m.insert("freefile", b_freefile);
    m.insert("dir", b_dir);
    m.insert("callbyname", b_callbyname);

    m
}

// --- strings ----------------------------------------------------------------

fn b_chr(_: &mut Context, params: &[Value]) -> Value {
    let code = arg_int(params, 0);
    let code = if (0..=0x10FFFF).contains(&code) {
        code as u32
    } else {
        // Negative codes wrap the way 16-bit VBA integers do.
        (code as i16 as u16) as u32
    };
    match char::from_u32(code) {
        Some(c) => Value::Str(c.to_string()),
        None => Value::Unresolved,
    }
}

fn b_asc(_: &mut Context, params: &[Value]) -> Value {
    let s = arg_str(params, 0);
    match s.chars().next() {
        Some(c) => Value::Int(c as i64),
        None => Value::Int(0),
    }
}

fn b_len(_: &mut Context, params: &[Value]) -> Value {
    match arg(params, 0) {
        Value::List(items) => Value::Int(items.borrow().len() as i64),
        other => Value::Int(coerce_to_str(other).chars().count() as i64),
    }
}

fn b_mid(_: &mut Context, params: &[Value]) -> Value {
    let s: Vec<char> = arg_str(params, 0).chars().collect();
    let start = (arg_int(params, 1).max(1) - 1) as usize;
    if start >= s.len() {
        return Value::str("");
    }
    let len = if params.len() > 2 {
        arg_int(params, 2).max(0) as usize
    } else {
        s.len() - start
    };
    Value::Str(s[start..(start + len).min(s.len())].iter().collect())
}

fn b_left(_: &mut Context, params: &[Value]) -> Value {
    let s: Vec<char> = arg_str(params, 0).chars().collect();
    let n = arg_int(params, 1).max(0) as usize;
    Value::Str(s[..n.min(s.len())].iter().collect())
}

fn b_right(_: &mut Context, params: &[Value]) -> Value {
    let s: Vec<char> = arg_str(params, 0).chars().collect();
    let n = arg_int(params, 1).max(0) as usize;
    Value::Str(s[s.len() - n.min(s.len())..].iter().collect())
}

fn b_ucase(_: &mut Context, params: &[Value]) -> Value {
    Value::Str(arg_str(params, 0).to_uppercase())
}

fn b_lcase(_: &mut Context, params: &[Value]) -> Value {
    Value::Str(arg_str(params, 0).to_lowercase())
}

fn b_trim(_: &mut Context, params: &[Value]) -> Value {
    Value::Str(arg_str(params, 0).trim().to_string())
}

fn b_ltrim(_: &mut Context, params: &[Value]) -> Value {
    Value::Str(arg_str(params, 0).trim_start().to_string())
}

fn b_rtrim(_: &mut Context, params: &[Value]) -> Value {
    Value::Str(arg_str(params, 0).trim_end().to_string())
}

fn b_strreverse(_: &mut Context, params: &[Value]) -> Value {
    Value::Str(arg_str(params, 0).chars().rev().collect())
}

fn b_replace(_: &mut Context, params: &[Value]) -> Value {
    let s = arg_str(params, 0);
    let find = arg_str(params, 1);
    let repl = arg_str(params, 2);
    if find.is_empty() {
        return Value::Str(s);
    }
    let count = if params.len() > 4 {
        arg_int(params, 4)
    } else {
        -1
    };
    if count < 0 {
        Value::Str(s.replace(&find, &repl))
    } else {
        Value::Str(s.replacen(&find, &repl, count as usize))
    }
}

fn b_instr(_: &mut Context, params: &[Value]) -> Value {
    // Both `InStr(s, sub)` and `InStr(start, s, sub)` forms.
    let (start, haystack, needle) = if params.len() >= 3 && to_f64(arg(params, 0)).is_some() {
        (
            arg_int(params, 0).max(1) as usize,
            arg_str(params, 1),
            arg_str(params, 2),
        )
    } else {
        (1, arg_str(params, 0), arg_str(params, 1))
    };
    if needle.is_empty() {
        return Value::Int(start as i64);
    }
    let chars: Vec<char> = haystack.chars().collect();
    if start > chars.len() {
        return Value::Int(0);
    }
    let offset: String = chars[start - 1..].iter().collect();
    match offset.find(&needle) {
        Some(byte_pos) => {
            let char_pos = offset[..byte_pos].chars().count();
            Value::Int((start + char_pos) as i64)
        }
        None => Value::Int(0),
    }
}

fn b_instrrev(_: &mut Context, params: &[Value]) -> Value {
    let haystack = arg_str(params, 0);
    let needle = arg_str(params, 1);
    if needle.is_empty() {
        return Value::Int(haystack.chars().count() as i64);
    }
    match haystack.rfind(&needle) {
        Some(byte_pos) => Value::Int(haystack[..byte_pos].chars().count() as i64 + 1),
        None => Value::Int(0),
    }
}

fn b_split(_: &mut Context, params: &[Value]) -> Value {
    let s = arg_str(params, 0);
    let delim = if params.len() > 1 {
        arg_str(params, 1)
    } else {
        " ".to_string()
    };
    if delim.is_empty() {
        return Value::list(vec![Value::Str(s)]);
    }
    Value::list(s.split(&delim).map(Value::str).collect())
}

fn b_join(_: &mut Context, params: &[Value]) -> Value {
    let delim = if params.len() > 1 {
        arg_str(params, 1)
    } else {
        " ".to_string()
    };
    match arg(params, 0) {
        Value::List(items) => {
            let parts: Vec<String> = items.borrow().iter().map(coerce_to_str).collect();
            Value::Str(parts.join(&delim))
        }
        other => Value::Str(coerce_to_str(other)),
    }
}

fn b_space(_: &mut Context, params: &[Value]) -> Value {
    Value::Str(" ".repeat(arg_int(params, 0).max(0) as usize))
}

fn b_string(_: &mut Context, params: &[Value]) -> Value {
    let n = arg_int(params, 0).max(0) as usize;
    let ch = match arg(params, 1) {
        Value::Int(c) => char::from_u32(*c as u32).unwrap_or(' ').to_string(),
        other => coerce_to_str(other).chars().take(1).collect(),
    };
    Value::Str(ch.repeat(n))
}

fn b_strcomp(_: &mut Context, params: &[Value]) -> Value {
    let a = arg_str(params, 0);
    let b = arg_str(params, 1);
    let text_mode = params.len() > 2 && arg_int(params, 2) == 1;
    let (a, b) = if text_mode {
        (a.to_lowercase(), b.to_lowercase())
    } else {
        (a, b)
    };
    Value::Int(match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    })
}

fn b_strconv(_: &mut Context, params: &[Value]) -> Value {
    let s = arg_str(params, 0);
    match arg_int(params, 1) {
        1 => Value::Str(s.to_uppercase()),
        2 => Value::Str(s.to_lowercase()),
        // vbUnicode/vbFromUnicode round-trip through the same text here.
        _ => Value::Str(s),
    }
}

fn b_format(_: &mut Context, params: &[Value]) -> Value {
    // Plain pass-through of the display form; format pictures are not
    // modeled.
    Value::Str(display(arg(params, 0)))
}

// --- conversion -------------------------------------------------------------

fn b_cstr(_: &mut Context, params: &[Value]) -> Value {
    Value::Str(coerce_to_str(arg(params, 0)))
}

fn b_cint(_: &mut Context, params: &[Value]) -> Value {
    match to_f64(arg(params, 0)) {
        Some(v) => Value::Int(v.round() as i64),
        None => Value::Int(0),
    }
}

fn b_cbyte(_: &mut Context, params: &[Value]) -> Value {
    match to_f64(arg(params, 0)) {
        Some(v) => Value::Int((v.round() as i64).rem_euclid(256)),
        None => Value::Int(0),
    }
}

fn b_cbool(_: &mut Context, params: &[Value]) -> Value {
    Value::Bool(arg(params, 0).is_truthy())
}

fn b_cdbl(_: &mut Context, params: &[Value]) -> Value {
    Value::Float(arg_f64(params, 0))
}

fn b_int(_: &mut Context, params: &[Value]) -> Value {
    Value::Int(arg_f64(params, 0).floor() as i64)
}

fn b_fix(_: &mut Context, params: &[Value]) -> Value {
    Value::Int(arg_f64(params, 0).trunc() as i64)
}

fn b_hex(_: &mut Context, params: &[Value]) -> Value {
    Value::Str(format!("{:X}", arg_int(params, 0)))
}

fn b_oct(_: &mut Context, params: &[Value]) -> Value {
    Value::Str(format!("{:o}", arg_int(params, 0)))
}

fn b_val(_: &mut Context, params: &[Value]) -> Value {
    let s = arg_str(params, 0);
    let t = s.trim_start();
    let mut end = 0;
    let mut seen_dot = false;
    for (i, c) in t.char_indices() {
        if c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+')) {
            end = i + c.len_utf8();
        } else if c == '.' && !seen_dot {
            seen_dot = true;
            end = i + 1;
        } else if c == ' ' {
            continue;
        } else {
            break;
        }
    }
    let head: String = t[..end].chars().filter(|c| *c != ' ').collect();
    if head.is_empty() {
        return Value::Int(0);
    }
    if seen_dot {
        Value::Float(head.parse().unwrap_or(0.0))
    } else {
        Value::Int(head.parse().unwrap_or(0))
    }
}

// --- math -------------------------------------------------------------------

fn b_abs(_: &mut Context, params: &[Value]) -> Value {
    match arg(params, 0) {
        Value::Int(v) => Value::Int(v.abs()),
        other => Value::Float(to_f64(other).unwrap_or(0.0).abs()),
    }
}

fn b_sqr(_: &mut Context, params: &[Value]) -> Value {
    Value::Float(arg_f64(params, 0).sqrt())
}

fn b_round(_: &mut Context, params: &[Value]) -> Value {
    let v = arg_f64(params, 0);
    let digits = if params.len() > 1 { arg_int(params, 1) } else { 0 };
    let scale = 10f64.powi(digits as i32);
    let r = (v * scale).round() / scale;
    if digits == 0 {
        Value::Int(r as i64)
    } else {
        Value::Float(r)
    }
}

fn b_sgn(_: &mut Context, params: &[Value]) -> Value {
    let v = arg_f64(params, 0);
    Value::Int(if v > 0.0 {
        1
    } else if v < 0.0 {
        -1
    } else {
        0
    })
}

fn b_rnd(_: &mut Context, _params: &[Value]) -> Value {
    // Deterministic LCG so runs are reproducible.
    thread_local! {
        static SEED: Cell<u64> = const { Cell::new(0x2545F491) };
    }
    let next = SEED.with(|s| {
        let v = s.get().wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        s.set(v);
        v
    });
    Value::Float((next >> 11) as f64 / (1u64 << 53) as f64)
}

fn b_atn(_: &mut Context, params: &[Value]) -> Value {
    Value::Float(arg_f64(params, 0).atan())
}

fn b_cos(_: &mut Context, params: &[Value]) -> Value {
    Value::Float(arg_f64(params, 0).cos())
}

fn b_sin(_: &mut Context, params: &[Value]) -> Value {
    Value::Float(arg_f64(params, 0).sin())
}

fn b_tan(_: &mut Context, params: &[Value]) -> Value {
    Value::Float(arg_f64(params, 0).tan())
}

fn b_log(_: &mut Context, params: &[Value]) -> Value {
    Value::Float(arg_f64(params, 0).ln())
}

fn b_exp(_: &mut Context, params: &[Value]) -> Value {
    Value::Float(arg_f64(params, 0).exp())
}

// --- arrays -----------------------------------------------------------------

fn b_array(_: &mut Context, params: &[Value]) -> Value {
    Value::list(params.to_vec())
}

fn b_ubound(_: &mut Context, params: &[Value]) -> Value {
    match arg(params, 0) {
        Value::List(items) => Value::Int(items.borrow().len() as i64 - 1),
        Value::Str(s) => Value::Int(s.chars().count() as i64 - 1),
        _ => Value::Int(-1),
    }
}

fn b_lbound(_: &mut Context, _params: &[Value]) -> Value {
    Value::Int(0)
}

// --- inspection -------------------------------------------------------------

fn b_isnumeric(_: &mut Context, params: &[Value]) -> Value {
    Value::Bool(to_f64(arg(params, 0)).is_some() && !arg(params, 0).is_unresolved())
}

fn b_isempty(_: &mut Context, params: &[Value]) -> Value {
    match arg(params, 0) {
        Value::Unresolved => Value::Bool(true),
        Value::Str(s) => Value::Bool(s.is_empty()),
        _ => Value::Bool(false),
    }
}

fn b_isnull(_: &mut Context, params: &[Value]) -> Value {
    Value::Bool(arg(params, 0).is_unresolved())
}

fn b_isarray(_: &mut Context, params: &[Value]) -> Value {
    Value::Bool(matches!(arg(params, 0), Value::List(_)))
}

fn b_isobject(_: &mut Context, params: &[Value]) -> Value {
    Value::Bool(matches!(arg(params, 0), Value::Map(_)))
}

fn b_typename(_: &mut Context, params: &[Value]) -> Value {
    Value::str(match arg(params, 0) {
        Value::Int(_) => "Long",
        Value::Float(_) => "Double",
        Value::Str(_) => "String",
        Value::Bool(_) => "Boolean",
        Value::List(_) => "Variant()",
        Value::Map(_) => "Object",
        Value::Unresolved => "Empty",
        Value::Wildcard => "String",
        Value::Procedure(_) | Value::Builtin(_) => "Object",
    })
}

fn b_vartype(_: &mut Context, params: &[Value]) -> Value {
    Value::Int(match arg(params, 0) {
        Value::Unresolved => 0,
        Value::Int(_) => 3,
        Value::Float(_) => 5,
        Value::Str(_) | Value::Wildcard => 8,
        Value::Map(_) | Value::Procedure(_) | Value::Builtin(_) => 9,
        Value::Bool(_) => 11,
        Value::List(_) => 8204,
    })
}

fn b_iif(_: &mut Context, params: &[Value]) -> Value {
    if arg(params, 0).is_truthy() {
        arg(params, 1).clone()
    } else {
        arg(params, 2).clone()
    }
}

// --- time -------------------------------------------------------------------

fn b_now(_: &mut Context, _params: &[Value]) -> Value {
    Value::Str(Local::now().format("%m/%d/%Y %H:%M:%S").to_string())
}

fn b_date(_: &mut Context, _params: &[Value]) -> Value {
    Value::Str(Local::now().format("%m/%d/%Y").to_string())
}

fn b_time(_: &mut Context, _params: &[Value]) -> Value {
    Value::Str(Local::now().format("%H:%M:%S").to_string())
}

fn b_timer(_: &mut Context, _params: &[Value]) -> Value {
    let now = Local::now();
    Value::Float(
        now.num_seconds_from_midnight() as f64 + now.nanosecond() as f64 / 1e9,
    )
}

fn b_year(_: &mut Context, _params: &[Value]) -> Value {
    Value::Int(Local::now().year() as i64)
}

fn b_month(_: &mut Context, _params: &[Value]) -> Value {
    Value::Int(Local::now().month() as i64)
}

fn b_day(_: &mut Context, _params: &[Value]) -> Value {
    Value::Int(Local::now().day() as i64)
}

fn b_hour(_: &mut Context, _params: &[Value]) -> Value {
    Value::Int(Local::now().hour() as i64)
}

fn b_minute(_: &mut Context, _params: &[Value]) -> Value {
    Value::Int(Local::now().minute() as i64)
}

fn b_second(_: &mut Context, _params: &[Value]) -> Value {
    Value::Int(Local::now().second() as i64)
}

// --- environment / host surface ---------------------------------------------

/// Environment reads return the wildcard so guards like
/// `If Environ("USERNAME") = "admin"` take the interesting branch.
fn b_environ(ctx: &mut Context, params: &[Value]) -> Value {
    ctx.report_action_value("Environ", arg(params, 0), "Read Environment Variable");
    Value::Wildcard
}

fn b_shell(ctx: &mut Context, params: &[Value]) -> Value {
    let command = arg_str(params, 0);
    ctx.report_action("Shell function", &command, "Execute Command");
    Value::Int(0)
}

fn b_createobject(ctx: &mut Context, params: &[Value]) -> Value {
    let prog_id = arg_str(params, 0);
    ctx.report_action("CreateObject", &prog_id, "Create Object");
    Value::map(MapObject::new(&prog_id))
}

fn b_msgbox(ctx: &mut Context, params: &[Value]) -> Value {
    ctx.report_action_value("Display Message", arg(params, 0), "MsgBox");
    Value::Int(1)
}

fn b_inputbox(ctx: &mut Context, params: &[Value]) -> Value {
    ctx.report_action_value("InputBox", arg(params, 0), "Read User Input");
    Value::Wildcard
}

fn b_noop(_: &mut Context, _params: &[Value]) -> Value {
    Value::Unresolved
}

fn b_freefile(ctx: &mut Context, _params: &[Value]) -> Value {
    Value::Int(ctx.num_open_files() as i64 + 1)
}

fn b_dir(_: &mut Context, _params: &[Value]) -> Value {
    // No real file system; an empty result reads as "not found".
    Value::str("")
}

/// `CallByName(obj, member, type, args...)`: member reads and writes against
/// faked objects; anything else degrades to the sentinel.
fn b_callbyname(_: &mut Context, params: &[Value]) -> Value {
    let member = arg_str(params, 1);
    match arg(params, 0) {
        Value::Map(map) => {
            if params.len() > 3 {
                map.borrow_mut().insert(&member, arg(params, 3).clone());
                Value::Unresolved
            } else {
                map.borrow().get(&member).cloned().unwrap_or(Value::Unresolved)
            }
        }
        _ => Value::Unresolved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Limits;

    fn ctx() -> Context {
        Context::root(Limits::default())
    }

    fn call1(name: &str, v: Value) -> Value {
        call(&mut ctx(), name, &[v])
    }

    #[test]
    fn chr_asc_inverse() {
        for code in [0i64, 9, 10, 13, 36, 65, 255] {
            let c = call1("Chr", Value::Int(code));
            assert_eq!(call1("Asc", c), Value::Int(code));
        }
    }

    #[test]
    fn chr_dollar_alias() {
        assert_eq!(call1("Chr$", Value::Int(36)), Value::str("$"));
    }

    #[test]
    fn mid_is_one_based() {
        let v = call(
            &mut ctx(),
            "Mid",
            &[Value::str("hello"), Value::Int(2), Value::Int(3)],
        );
        assert_eq!(v, Value::str("ell"));
    }

    #[test]
    fn instr_both_forms() {
        let v = call(&mut ctx(), "InStr", &[Value::str("abcabc"), Value::str("b")]);
        assert_eq!(v, Value::Int(2));
        let v = call(
            &mut ctx(),
            "InStr",
            &[Value::Int(3), Value::str("abcabc"), Value::str("b")],
        );
        assert_eq!(v, Value::Int(5));
    }

    #[test]
    fn split_and_join() {
        let list = call(
            &mut ctx(),
            "Split",
            &[Value::str("a,b,c"), Value::str(",")],
        );
        let joined = call(&mut ctx(), "Join", &[list, Value::str("-")]);
        assert_eq!(joined, Value::str("a-b-c"));
    }

    #[test]
    fn shell_reports_action() {
        let mut c = ctx();
        call(&mut c, "Shell", &[Value::str("cmd /c whoami")]);
        let shared = c.shared().borrow();
        assert_eq!(shared.actions[0].action, "Shell function");
        assert_eq!(shared.actions[0].params, "cmd /c whoami");
    }

    #[test]
    fn environ_is_wildcard() {
        let v = call(&mut ctx(), "Environ", &[Value::str("USERNAME")]);
        assert_eq!(v, Value::Wildcard);
    }

    #[test]
    fn val_parses_leading_number() {
        assert_eq!(call1("Val", Value::str(" 12abc")), Value::Int(12));
        assert_eq!(call1("Val", Value::str("1.5x")), Value::Float(1.5));
        assert_eq!(call1("Val", Value::str("abc")), Value::Int(0));
    }

    #[test]
    fn hex_oct_round_trip() {
        assert_eq!(call1("Hex", Value::Int(42)), Value::str("2A"));
        assert_eq!(call1("Oct", Value::Int(42)), Value::str("52"));
    }
}
