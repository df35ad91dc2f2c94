//! Expression evaluation: name resolution, call dispatch, and the fixed
//! priority chain for member accesses.
//!
//! Member chains over faked COM objects cannot be resolved by type, so each
//! step tries a fixed sequence of interpretations (live object method,
//! dotted variable, known property name, callable fallback) and the first
//! hit wins. Misses degrade to the unresolved sentinel; emulation never
//! unwinds because an object was faked too shallowly.

use log::{debug, warn};

use crate::ast::{Arg, Expr, MemberPart, ProcKind, Procedure, UnOp};
use crate::coerce::{coerce_to_int, coerce_to_str, display};
use crate::context::Context;
use crate::library;
use crate::operators;
use crate::parser;
use crate::procs;
use crate::value::{MapObject, Value};

/// Imported or member functions whose mere invocation is worth reporting.
const INTERESTING_CALLS: &[&str] = &[
    "urldownloadtofile",
    "urldownloadtofilea",
    "urldownloadtofilew",
    "winexec",
    "shellexecute",
    "shellexecutea",
    "shellexecutew",
    "createprocess",
    "createprocessa",
    "createprocessw",
    "kill",
    "filecopy",
    "savetofile",
    "savetofile2",
    "navigate",
    "regwrite",
    "createshortcut",
];

/// Trig helpers show up as junk padding in obfuscated macros; reporting
/// them floods the log.
const SKIP_REPORT: &[&str] = &["cos", "tan", "sin", "atn", "log", "exp"];

pub fn eval_expr(ctx: &mut Context, expr: &Expr) -> Value {
    match expr {
        Expr::Int(v) => Value::Int(*v),
        Expr::Float(v) => Value::Float(*v),
        Expr::Str(s) => Value::str(s.clone()),
        Expr::Bool(b) => Value::Bool(*b),
        Expr::Date(s) => Value::str(s.clone()),
        Expr::FileNum(s) => Value::str(s.clone()),
        Expr::Nothing => Value::Unresolved,
        Expr::Name(name) => resolve_name(ctx, name),
        Expr::Call { name, args } => eval_call(ctx, name, args),
        Expr::Member { leading_dot, parts } => eval_member(ctx, *leading_dot, parts),
        Expr::Bin { op, lhs, rhs } => {
            let lhs = eval_expr(ctx, lhs);
            let rhs = eval_expr(ctx, rhs);
            operators::eval_binop(ctx, *op, &lhs, &rhs)
        }
        Expr::Un { op, expr } => {
            let value = eval_expr(ctx, expr);
            if matches!(op, UnOp::Neg | UnOp::Not) && matches!(value, Value::Wildcard) {
                return Value::Wildcard;
            }
            operators::eval_unop(*op, &value)
        }
        Expr::New(prog_id) => new_object(ctx, prog_id),
    }
}

/// Creates a faked COM object. The prog id is kept on the object so member
/// dispatch can specialize later.
pub fn new_object(ctx: &mut Context, prog_id: &str) -> Value {
    ctx.report_action("CreateObject", prog_id, "Create an object instance");
    Value::map(MapObject::new(prog_id))
}

/// Bare-name resolution. Reading a name bound to a parameterless Function
/// invokes it; everything unresolvable becomes the sentinel.
fn resolve_name(ctx: &mut Context, name: &str) -> Value {
    match ctx.get(name) {
        Some(Value::Procedure(procedure)) if is_zero_arg_function(&procedure) => {
            procs::invoke(ctx, &procedure, &[]).value
        }
        Some(value) => value,
        None => {
            debug!("unresolved name {name:?}");
            Value::Unresolved
        }
    }
}

fn is_zero_arg_function(procedure: &Procedure) -> bool {
    matches!(procedure.kind, ProcKind::Function | ProcKind::PropertyGet)
        && procedure.params.iter().all(|p| p.default.is_some())
}

/// Evaluates call arguments eagerly. When an argument raises the emulated
/// error flag the whole call is short-circuited to the sentinel; the flag
/// stays set for the block runner to route to a handler.
fn eval_args(ctx: &mut Context, args: &[Arg]) -> Option<Vec<Value>> {
    let had_error = ctx.got_error;
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        values.push(eval_expr(ctx, &arg.expr));
        if ctx.got_error && !had_error {
            warn!("short circuiting call, an argument raised an error");
            return None;
        }
    }
    Some(values)
}

/// `name(args)`: function call, array access, or dictionary access,
/// disambiguated by what the name resolves to.
pub fn eval_call(ctx: &mut Context, name: &str, args: &[Arg]) -> Value {
    let lower = name.to_ascii_lowercase();

    // Expression-from-string evaluation.
    if lower == "eval" || lower == "evaluate" || lower == "execute" {
        let text = match args.first() {
            Some(arg) => coerce_to_str(&eval_expr(ctx, &arg.expr)),
            None => return Value::Unresolved,
        };
        return eval_snippet(ctx, &text);
    }

    // Imported DLL functions run through their declared alias.
    if let Some(true_name) = ctx.dll_true_name(&lower) {
        let values = match eval_args(ctx, args) {
            Some(values) => values,
            None => return Value::Unresolved,
        };
        return emulate_external(ctx, &lower, &true_name, &values);
    }

    let values = match eval_args(ctx, args) {
        Some(values) => values,
        None => return Value::Unresolved,
    };

    report_interesting(ctx, &lower, &values);

    if lower == "run" {
        return run_indirect(ctx, &values);
    }
    if lower == "callbyname" {
        return call_by_name(ctx, &values);
    }

    match ctx.get(&lower) {
        Some(Value::Procedure(procedure)) => {
            let outcome = procs::invoke(ctx, &procedure, &values);
            write_back_byref(ctx, args, &outcome.byref);
            outcome.value
        }
        Some(Value::Builtin(builtin)) => library::call(ctx, builtin, &values),
        Some(Value::List(items)) => index_list(ctx, &items, &values),
        Some(Value::Str(s)) => index_string(ctx, &s, &values),
        Some(Value::Map(map)) => {
            // Default member access: `dict(key)`.
            let key = values.first().map(display).unwrap_or_default();
            map.borrow().get(&key).cloned().unwrap_or(Value::Unresolved)
        }
        Some(Value::Wildcard) => Value::Wildcard,
        Some(other) => other,
        None => {
            ctx.report_general_error(&format!("call to unknown function {name:?}"));
            Value::Unresolved
        }
    }
}

/// Parses and evaluates a source snippet, the `Eval`/`Execute` path that
/// self-decoding macros rely on.
pub fn eval_snippet(ctx: &mut Context, text: &str) -> Value {
    match parser::parse_expression(text) {
        Ok(expr) => eval_expr(ctx, &expr),
        Err(err) => {
            ctx.report_general_error(&format!("could not evaluate snippet {text:?}: {err}"));
            Value::Unresolved
        }
    }
}

fn report_interesting(ctx: &mut Context, lower: &str, values: &[Value]) {
    if SKIP_REPORT.contains(&lower) {
        return;
    }
    if !ctx.is_log_func(lower) && !INTERESTING_CALLS.contains(&lower) {
        return;
    }
    let params: Vec<String> = values.iter().map(display).collect();
    let params = params.join(",");
    // Dictionary plumbing is noise, not behavior.
    if params.to_ascii_lowercase().contains("scripting.dictionary") {
        return;
    }
    ctx.report_action(
        "Interesting Function Call",
        &format!("{lower}({params})"),
        "Interesting Function Call",
    );
}

/// `Application.Run "name", args...`: drills through string indirection
/// layers to the actual procedure.
fn run_indirect(ctx: &mut Context, values: &[Value]) -> Value {
    let Some(first) = values.first() else {
        return Value::Unresolved;
    };
    let mut name = display(first);
    // Each layer of `a = "b"` indirection peels one string.
    for _ in 0..5 {
        match ctx.get(&name) {
            Some(Value::Procedure(procedure)) => {
                return procs::invoke(ctx, &procedure, &values[1..]).value;
            }
            Some(Value::Builtin(builtin)) => {
                return library::call(ctx, builtin, &values[1..]);
            }
            Some(Value::Str(next)) => name = next,
            _ => break,
        }
    }
    ctx.report_general_error(&format!("Run target {name:?} not found"));
    Value::Unresolved
}

fn call_by_name(ctx: &mut Context, values: &[Value]) -> Value {
    let (Some(object), Some(member)) = (values.first(), values.get(1)) else {
        return Value::Unresolved;
    };
    let member = display(member);
    match object {
        Value::Map(map) => {
            // Call type 4 is a property set.
            if let Some(new_value) = values.get(3) {
                map.borrow_mut().insert(&member, new_value.clone());
                return Value::Unresolved;
            }
            map.borrow().get(&member).cloned().unwrap_or(Value::Unresolved)
        }
        _ => match ctx.get(&member) {
            Some(Value::Procedure(procedure)) => {
                procs::invoke(ctx, &procedure, values.get(3..).unwrap_or(&[])).value
            }
            _ => Value::Unresolved,
        },
    }
}

/// Copies ByRef output parameters back into plain caller variables. Only
/// bare names get the write-back; anything fancier keeps its old value.
fn write_back_byref(ctx: &mut Context, args: &[Arg], byref: &[(usize, Value)]) {
    for (pos, value) in byref {
        if let Some(Arg { expr: Expr::Name(name), .. }) = args.get(*pos) {
            if !matches!(ctx.get(name), Some(v) if v.is_callable()) {
                ctx.set(name, value.clone());
            }
        }
    }
}

fn index_list(ctx: &mut Context, items: &crate::value::ListRef, values: &[Value]) -> Value {
    let mut current = Value::List(items.clone());
    for index_value in values {
        let index = resolve_index(index_value);
        current = match (&current, index) {
            (Value::List(list), Some(i)) => {
                let list = list.borrow();
                match usize::try_from(i).ok().and_then(|i| list.get(i)) {
                    Some(item) => item.clone(),
                    None => {
                        ctx.report_error(&format!("array index {i} out of bounds"));
                        return Value::Unresolved;
                    }
                }
            }
            (Value::Str(s), Some(i)) => index_string_at(s, i),
            _ => return Value::Unresolved,
        };
    }
    current
}

/// Indexing a string yields the character at the (1-based) position, which
/// obfuscators use as a poor man's `Mid`.
fn index_string(ctx: &mut Context, s: &str, values: &[Value]) -> Value {
    match values.first().and_then(resolve_index) {
        Some(i) => index_string_at(s, i),
        None => {
            ctx.report_general_error(&format!("cannot index string with {values:?}"));
            Value::Unresolved
        }
    }
}

fn index_string_at(s: &str, i: i64) -> Value {
    let chars: Vec<char> = s.chars().collect();
    if i >= 1 && (i as usize) <= chars.len() {
        Value::str(chars[i as usize - 1].to_string())
    } else {
        Value::Unresolved
    }
}

/// Array indices are numbers, or single characters standing in for their
/// character code.
fn resolve_index(value: &Value) -> Option<i64> {
    if let Value::Str(s) = value {
        let mut chars = s.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            if !c.is_ascii_digit() {
                return Some(c as i64);
            }
        }
    }
    coerce_to_int(value)
}

// --- external DLL emulation --------------------------------------------------

/// Runs a declared external function. A few kernel32 file primitives are
/// emulated for real so dropped payloads flow into the file maps; the rest
/// just get reported.
fn emulate_external(ctx: &mut Context, local_name: &str, true_name: &str, values: &[Value]) -> Value {
    let lower = true_name.to_ascii_lowercase();
    if lower.starts_with("createfile") {
        let name = values.first().map(display).unwrap_or_default();
        ctx.open_file(&name, "");
        return Value::str(Context::normalize_filename(&name));
    }
    if lower == "writefile" {
        let handle = values.first().map(display).unwrap_or_default();
        let data = values.get(1).cloned().unwrap_or_default();
        let bytes = external_write_bytes(&data);
        ctx.write_file(&handle, &bytes);
        return Value::Int(1);
    }
    if lower == "closehandle" {
        let handle = values.first().map(display).unwrap_or_default();
        ctx.close_file(&handle);
        return Value::Int(1);
    }
    if lower.starts_with("urldownloadtofile") {
        let url = values.get(1).map(display).unwrap_or_default();
        let path = values.get(2).map(display).unwrap_or_default();
        ctx.report_action("Download URL", &url, "External Call");
        ctx.report_action("Write File", &path, "External Call");
        return Value::Int(0);
    }
    let params: Vec<String> = values.iter().map(display).collect();
    ctx.report_action(
        "External Call",
        &format!("{true_name}({})", params.join(",")),
        &format!("Call external function {local_name} from a DLL"),
    );
    Value::Unresolved
}

/// WriteFile passes one byte per call in the common shellcode-dropper
/// pattern; larger values come through as strings or code lists.
fn external_write_bytes(data: &Value) -> Vec<u8> {
    match data {
        Value::Int(v) => vec![(*v & 0xff) as u8],
        Value::Str(s) => s.as_bytes().to_vec(),
        Value::List(items) => items
            .borrow()
            .iter()
            .filter_map(coerce_to_int)
            .map(|v| (v & 0xff) as u8)
            .collect(),
        other => coerce_to_str(other).into_bytes(),
    }
}

// --- member access chains ----------------------------------------------------

/// Evaluates `a.b.c(x).d` one step at a time. Before walking, argless
/// chains get one shot as a single dotted variable, which is how faked
/// document properties and With-populated objects resolve.
pub fn eval_member(ctx: &mut Context, leading_dot: bool, parts: &[MemberPart]) -> Value {
    if let Some(dotted) = dotted_name(leading_dot, parts, ctx) {
        if let Some(value) = ctx.get(&dotted) {
            if let Value::Procedure(procedure) = &value {
                if is_zero_arg_function(procedure) {
                    return procs::invoke(ctx, procedure, &[]).value;
                }
            }
            return value;
        }
    }

    let (mut current, mut path, rest) = if leading_dot {
        let prefix = ctx.with_prefix.clone();
        let current = ctx.get(&prefix).unwrap_or(Value::Unresolved);
        (current, prefix, parts)
    } else {
        let head = &parts[0];
        let current = match &head.args {
            Some(args) => eval_call(ctx, &head.name, args),
            None => resolve_head(ctx, &head.name),
        };
        (current, head.name.to_ascii_lowercase(), &parts[1..])
    };

    for (i, part) in rest.iter().enumerate() {
        let is_last = i + 1 == rest.len();
        current = member_step(ctx, current, &mut path, part, is_last);
    }
    current
}

fn dotted_name(leading_dot: bool, parts: &[MemberPart], ctx: &Context) -> Option<String> {
    if parts.iter().any(|p| p.args.is_some()) {
        return None;
    }
    let joined: Vec<&str> = parts.iter().map(|p| p.name.as_str()).collect();
    let joined = joined.join(".");
    if leading_dot {
        if ctx.with_prefix.is_empty() {
            return Some(joined);
        }
        return Some(format!("{}.{}", ctx.with_prefix, joined));
    }
    Some(joined)
}

/// The head of a chain resolves as a variable but never auto-invokes, so
/// `obj.Method` sees the object rather than a call result.
fn resolve_head(ctx: &mut Context, name: &str) -> Value {
    ctx.get(name).unwrap_or(Value::Unresolved)
}

fn args_values(ctx: &mut Context, part: &MemberPart) -> Vec<Value> {
    part.args
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .map(|a| eval_expr(ctx, &a.expr))
        .collect()
}

/// One step of the chain. Live objects dispatch on their prog id first;
/// everything else falls through dotted-variable lookup, well-known
/// property names, and finally module-level callables.
fn member_step(
    ctx: &mut Context,
    current: Value,
    path: &mut String,
    part: &MemberPart,
    is_last: bool,
) -> Value {
    let lower = part.name.to_ascii_lowercase();

    if let Value::Map(map) = &current {
        if let Some(result) = object_method(ctx, map, &lower, part) {
            return result;
        }
    }

    if !path.is_empty() {
        path.push('.');
    }
    path.push_str(&lower);

    // Dotted variable, set earlier by an assignment or a With block.
    if let Some(value) = ctx.get(path) {
        match value {
            Value::Procedure(procedure) => {
                let values = args_values(ctx, part);
                return procs::invoke(ctx, &procedure, &values).value;
            }
            Value::Builtin(builtin) => {
                let values = args_values(ctx, part);
                return library::call(ctx, builtin, &values);
            }
            other => return other,
        }
    }

    match lower.as_str() {
        // Text-ish property reads bottom out on the receiver itself when no
        // dotted variable exists, so `payload.Text` round-trips.
        "text" | "value" | "caption" | "tag" | "innertext" | "nodevalue" => {
            if matches!(current, Value::Str(_)) {
                return current;
            }
            Value::Unresolved
        }
        "length" | "count" => match &current {
            Value::Str(s) => Value::Int(s.chars().count() as i64),
            Value::List(items) => Value::Int(items.borrow().len() as i64),
            _ => Value::Unresolved,
        },
        "item" => {
            let values = args_values(ctx, part);
            match &current {
                Value::List(items) => index_list(ctx, items, &values),
                _ => Value::Unresolved,
            }
        }
        // `Sheet.Range("A1")` reads go through the embedder's cell lookup.
        "range" => {
            let values = args_values(ctx, part);
            let reference = values.first().map(|v| coerce_to_str(v)).unwrap_or_default();
            let lookup = ctx.shared().borrow().cell_lookup.clone();
            lookup
                .and_then(|f| f(&reference.to_ascii_lowercase()))
                .unwrap_or(Value::Unresolved)
        }
        // `ActiveDocument.Variables("x")` style document-property reads pull
        // from the injected doc vars.
        "variables" | "builtindocumentproperties" | "customdocumentproperties"
        | "documentproperties" => {
            let values = args_values(ctx, part);
            let name = values
                .first()
                .map(|v| coerce_to_str(v))
                .unwrap_or_default()
                .to_ascii_lowercase();
            let found = ctx.shared().borrow().doc_vars.get(&name).cloned();
            match found {
                Some(value) => value,
                None => {
                    debug!("document property {name:?} not provided");
                    Value::Unresolved
                }
            }
        }
        "settext" => {
            let values = args_values(ctx, part);
            let text = values.first().map(|v| coerce_to_str(v)).unwrap_or_default();
            ctx.shared().borrow_mut().clipboard = text;
            Value::Unresolved
        }
        "gettext" => Value::str(ctx.shared().borrow().clipboard.clone()),
        "run" => {
            let values = args_values(ctx, part);
            run_indirect(ctx, &values)
        }
        "create" => {
            // WMI Win32_Process.Create and friends.
            let values = args_values(ctx, part);
            let command = values.first().map(display).unwrap_or_default();
            ctx.report_action("Create Process", &command, "Execute Command");
            Value::Int(0)
        }
        "replace" => {
            // `expr.Replace(a, b)` routes through the builtin with the
            // receiver as subject.
            let mut values = vec![current];
            values.extend(args_values(ctx, part));
            library::call(ctx, "replace", &values)
        }
        _ => {
            // Member methods frequently live as flat module procedures in
            // deobfuscated class modules.
            match ctx.get(&lower) {
                Some(Value::Procedure(procedure)) if part.args.is_some() || is_last => {
                    let values = args_values(ctx, part);
                    procs::invoke(ctx, &procedure, &values).value
                }
                Some(Value::Builtin(builtin)) if part.args.is_some() => {
                    let values = args_values(ctx, part);
                    library::call(ctx, builtin, &values)
                }
                _ => {
                    debug!("unresolved member {path:?}");
                    Value::Unresolved
                }
            }
        }
    }
}

/// Prog-id specific method dispatch on faked objects. Returns `None` when
/// the member is not a method of this object kind, letting the generic
/// steps run.
fn object_method(
    ctx: &mut Context,
    map: &crate::value::MapRef,
    lower: &str,
    part: &MemberPart,
) -> Option<Value> {
    let kind = map.borrow().kind.clone();

    // Scripting.FileSystemObject.
    if kind.contains("filesystemobject") {
        match lower {
            "createtextfile" | "opentextfile" => {
                let values = args_values(ctx, part);
                let path = values.first().map(display).unwrap_or_default();
                ctx.open_file(&path, "");
                let mut file = MapObject::new("textfile");
                file.insert("path", Value::str(Context::normalize_filename(&path)));
                return Some(Value::map(file));
            }
            "deletefile" | "deletefolder" => {
                let values = args_values(ctx, part);
                let path = values.first().map(display).unwrap_or_default();
                ctx.report_action("Delete File", &path, "Delete a file");
                return Some(Value::Unresolved);
            }
            "copyfile" | "movefile" => {
                let values = args_values(ctx, part);
                let params: Vec<String> = values.iter().map(display).collect();
                ctx.report_action("Copy File", &params.join(" -> "), "Copy a file");
                return Some(Value::Unresolved);
            }
            "fileexists" | "folderexists" => return Some(Value::Bool(true)),
            "buildpath" => {
                let values = args_values(ctx, part);
                let parts: Vec<String> = values.iter().map(|v| coerce_to_str(v)).collect();
                return Some(Value::str(parts.join("\\")));
            }
            "getspecialfolder" | "gettempname" | "getfolder" => {
                args_values(ctx, part);
                return Some(Value::Wildcard);
            }
            _ => return None,
        }
    }

    // Text file handles returned by CreateTextFile.
    if kind == "textfile" {
        let path = map
            .borrow()
            .get("path")
            .map(display)
            .unwrap_or_default();
        match lower {
            "write" | "writeline" => {
                let values = args_values(ctx, part);
                let mut data = values.first().map(|v| coerce_to_str(v)).unwrap_or_default();
                if lower == "writeline" {
                    data.push_str("\r\n");
                }
                ctx.write_file(&path, data.as_bytes());
                return Some(Value::Unresolved);
            }
            "close" => {
                ctx.close_file(&path);
                return Some(Value::Unresolved);
            }
            "readall" | "readline" => {
                let shared = ctx.shared().borrow();
                let content = shared
                    .open_files
                    .get(&path)
                    .or_else(|| shared.closed_files.get(&path))
                    .map(|b| String::from_utf8_lossy(b).into_owned());
                drop(shared);
                return Some(content.map(Value::str).unwrap_or(Value::Wildcard));
            }
            _ => return None,
        }
    }

    // ADODB.Stream byte smuggling.
    if kind.contains("adodb") {
        match lower {
            "open" => return Some(Value::Unresolved),
            "write" | "writetext" => {
                let values = args_values(ctx, part);
                let data = values.first().map(|v| coerce_to_str(v)).unwrap_or_default();
                let mut object = map.borrow_mut();
                let buffer = match object.get("buffer") {
                    Some(Value::Str(s)) => format!("{s}{data}"),
                    _ => data,
                };
                object.insert("buffer", Value::str(buffer));
                return Some(Value::Unresolved);
            }
            "savetofile" => {
                let values = args_values(ctx, part);
                let path = values.first().map(display).unwrap_or_default();
                let buffer = match map.borrow().get("buffer") {
                    Some(Value::Str(s)) => s.clone(),
                    _ => String::new(),
                };
                ctx.open_file(&path, "");
                ctx.write_file(&path, buffer.as_bytes());
                ctx.close_file(&path);
                ctx.report_action("Write File", &path, "Write data to a file");
                return Some(Value::Unresolved);
            }
            "readtext" | "read" => {
                return Some(
                    map.borrow()
                        .get("buffer")
                        .cloned()
                        .unwrap_or(Value::Wildcard),
                );
            }
            "close" => return Some(Value::Unresolved),
            _ => return None,
        }
    }

    // WScript.Shell and Shell.Application.
    if kind.contains("wscript.shell") || kind.contains("shell.application") {
        match lower {
            "run" | "exec" | "shellexecute" => {
                let values = args_values(ctx, part);
                let command = values.first().map(display).unwrap_or_default();
                ctx.report_action("Run", &command, "Execute Command");
                return Some(Value::Int(0));
            }
            "regwrite" => {
                let values = args_values(ctx, part);
                let params: Vec<String> = values.iter().map(display).collect();
                ctx.report_action("Registry Write", &params.join(","), "Write a registry value");
                return Some(Value::Unresolved);
            }
            "regread" => {
                args_values(ctx, part);
                return Some(Value::Wildcard);
            }
            "expandenvironmentstrings" | "environment" | "specialfolders" => {
                args_values(ctx, part);
                return Some(Value::Wildcard);
            }
            "createshortcut" => {
                let values = args_values(ctx, part);
                let path = values.first().map(display).unwrap_or_default();
                ctx.report_action("Create Shortcut", &path, "Create a shortcut");
                return Some(Value::map(MapObject::new("shortcut")));
            }
            _ => return None,
        }
    }

    // XMLHTTP downloaders.
    if kind.contains("xmlhttp") || kind.contains("winhttp") {
        match lower {
            "open" => {
                let values = args_values(ctx, part);
                let url = values.get(1).map(display).unwrap_or_default();
                ctx.report_action("Download URL", &url, "Download a remote payload");
                return Some(Value::Unresolved);
            }
            "send" | "setrequestheader" => {
                args_values(ctx, part);
                return Some(Value::Unresolved);
            }
            "responsebody" | "responsetext" => return Some(Value::Wildcard),
            "status" => return Some(Value::Int(200)),
            _ => return None,
        }
    }

    // VBScript.RegExp. Malware patterns are almost always literal text;
    // metacharacter patterns degrade to leaving the subject untouched.
    if kind.contains("regexp") {
        match lower {
            "test" => {
                let values = args_values(ctx, part);
                let subject = values.first().map(|v| coerce_to_str(v)).unwrap_or_default();
                let pattern = regexp_pattern(map);
                if pattern_is_literal(&pattern) {
                    return Some(Value::Bool(subject.contains(&pattern)));
                }
                return Some(Value::Bool(true));
            }
            "replace" => {
                let values = args_values(ctx, part);
                let subject = values.first().map(|v| coerce_to_str(v)).unwrap_or_default();
                let with = values.get(1).map(|v| coerce_to_str(v)).unwrap_or_default();
                let pattern = regexp_pattern(map);
                if !pattern.is_empty() && pattern_is_literal(&pattern) {
                    return Some(Value::str(subject.replace(&pattern, &with)));
                }
                debug!("RegExp pattern {pattern:?} not emulated, passing subject through");
                return Some(Value::str(subject));
            }
            _ => return None,
        }
    }

    // Scripting.Dictionary and the generic map fallback.
    match lower {
        "add" => {
            let values = args_values(ctx, part);
            if let (Some(key), Some(value)) = (values.first(), values.get(1)) {
                map.borrow_mut().insert(&display(key), value.clone());
            }
            Some(Value::Unresolved)
        }
        "exists" => {
            let values = args_values(ctx, part);
            let key = values.first().map(display).unwrap_or_default();
            Some(Value::Bool(map.borrow().contains(&key)))
        }
        "item" => {
            let values = args_values(ctx, part);
            let key = values.first().map(display).unwrap_or_default();
            Some(map.borrow().get(&key).cloned().unwrap_or(Value::Unresolved))
        }
        "keys" => Some(Value::list(
            map.borrow()
                .entries
                .iter()
                .map(|(k, _)| Value::str(k.clone()))
                .collect(),
        )),
        "items" => Some(Value::list(
            map.borrow().entries.iter().map(|(_, v)| v.clone()).collect(),
        )),
        "count" => Some(Value::Int(map.borrow().len() as i64)),
        "remove" => {
            let values = args_values(ctx, part);
            let key = values.first().map(display).unwrap_or_default();
            map.borrow_mut().remove(&key);
            Some(Value::Unresolved)
        }
        "removeall" => {
            map.borrow_mut().entries.clear();
            Some(Value::Unresolved)
        }
        _ => {
            // Property read straight off the object.
            if part.args.is_none() {
                if let Some(value) = map.borrow().get(lower) {
                    return Some(value.clone());
                }
            }
            None
        }
    }
}

fn regexp_pattern(map: &crate::value::MapRef) -> String {
    map.borrow()
        .get("pattern")
        .map(|v| coerce_to_str(v))
        .unwrap_or_default()
}

fn pattern_is_literal(pattern: &str) -> bool {
    !pattern
        .chars()
        .any(|c| matches!(c, '\\' | '.' | '*' | '+' | '?' | '[' | ']' | '(' | ')' | '{' | '}' | '|' | '^' | '$'))
}

/// Assigns through a member target; the chain is stored as a dotted
/// variable so later reads resolve through [`Context::get`].
pub fn assign_member(
    ctx: &mut Context,
    leading_dot: bool,
    parts: &[MemberPart],
    value: Value,
) {
    // Member assignment onto a live object mutates the object.
    if !leading_dot && parts.len() >= 2 && parts.iter().all(|p| p.args.is_none()) {
        if let Some(Value::Map(map)) = ctx.get(&parts[0].name) {
            let key: Vec<&str> = parts[1..].iter().map(|p| p.name.as_str()).collect();
            map.borrow_mut().insert(&key.join("."), value.clone());
        }
    }
    let dotted: Vec<&str> = parts.iter().map(|p| p.name.as_str()).collect();
    let mut dotted = dotted.join(".");
    if leading_dot {
        if ctx.with_prefix.is_empty() {
            dotted = format!(".{dotted}");
        } else {
            dotted = format!("{}.{}", ctx.with_prefix, dotted);
        }
    }
    ctx.set(&dotted, value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Limits;

    fn ctx() -> Context {
        Context::root(Limits::default())
    }

    fn eval_src(ctx: &mut Context, src: &str) -> Value {
        eval_snippet(ctx, src)
    }

    #[test]
    fn literal_arithmetic() {
        let mut ctx = ctx();
        assert_eq!(eval_src(&mut ctx, "2 + 2"), Value::Int(4));
        assert_eq!(eval_src(&mut ctx, "&H2A"), Value::Int(42));
    }

    #[test]
    fn mixed_concat_chain() {
        let mut ctx = ctx();
        assert_eq!(
            eval_src(&mut ctx, "\"a\" & 1 & \"b\""),
            Value::str("a1b")
        );
    }

    #[test]
    fn builtin_call_via_name() {
        let mut ctx = ctx();
        assert_eq!(eval_src(&mut ctx, "Chr(65)"), Value::str("A"));
        assert_eq!(eval_src(&mut ctx, "Asc(\"A\")"), Value::Int(65));
    }

    #[test]
    fn unresolved_name_is_sentinel() {
        let mut ctx = ctx();
        assert_eq!(eval_src(&mut ctx, "never_defined"), Value::Unresolved);
        // Concatenation treats it as empty.
        assert_eq!(eval_src(&mut ctx, "\"x\" & never_defined"), Value::str("x"));
    }

    #[test]
    fn array_access_via_call_syntax() {
        let mut ctx = ctx();
        ctx.set(
            "arr",
            Value::list(vec![Value::Int(10), Value::Int(20), Value::Int(30)]),
        );
        assert_eq!(eval_src(&mut ctx, "arr(1)"), Value::Int(20));
        assert_eq!(eval_src(&mut ctx, "arr(99)"), Value::Unresolved);
        assert!(ctx.got_error);
    }

    #[test]
    fn dictionary_member_methods() {
        let mut ctx = ctx();
        let d = new_object(&mut ctx, "Scripting.Dictionary");
        ctx.set("d", d);
        eval_src(&mut ctx, "d.Add(\"k\", 42)");
        assert_eq!(eval_src(&mut ctx, "d.Exists(\"k\")"), Value::Bool(true));
        assert_eq!(eval_src(&mut ctx, "d.Item(\"k\")"), Value::Int(42));
        assert_eq!(eval_src(&mut ctx, "d.Count"), Value::Int(1));
        assert_eq!(eval_src(&mut ctx, "d(\"k\")"), Value::Int(42));
    }

    #[test]
    fn fso_create_write_close_flows_to_closed_files() {
        let mut ctx = ctx();
        let fso = new_object(&mut ctx, "Scripting.FileSystemObject");
        ctx.set("fso", fso);
        let file = eval_src(&mut ctx, "fso.CreateTextFile(\"c:\\drop.exe\")");
        ctx.set("f", file);
        eval_src(&mut ctx, "f.Write(\"MZ\")");
        eval_src(&mut ctx, "f.Close()");
        let shared = ctx.shared().borrow();
        assert_eq!(
            shared.closed_files.get("c:/drop.exe").map(|v| v.as_slice()),
            Some(b"MZ".as_slice())
        );
    }

    #[test]
    fn adodb_stream_savetofile() {
        let mut ctx = ctx();
        let stream = new_object(&mut ctx, "ADODB.Stream");
        ctx.set("s", stream);
        eval_src(&mut ctx, "s.WriteText(\"payload\")");
        eval_src(&mut ctx, "s.SaveToFile(\"out.bin\")");
        let shared = ctx.shared().borrow();
        assert_eq!(
            shared.closed_files.get("out.bin").map(|v| v.as_slice()),
            Some(b"payload".as_slice())
        );
        assert!(shared.actions.iter().any(|a| a.action == "Write File"));
    }

    #[test]
    fn wshshell_run_reports_action() {
        let mut ctx = ctx();
        let shell = new_object(&mut ctx, "WScript.Shell");
        ctx.set("sh", shell);
        eval_src(&mut ctx, "sh.Run(\"cmd /c whoami\")");
        let shared = ctx.shared().borrow();
        let action = shared.actions.iter().find(|a| a.action == "Run");
        assert_eq!(action.map(|a| a.params.as_str()), Some("cmd /c whoami"));
    }

    #[test]
    fn regexp_replace_applies_the_pattern() {
        let mut ctx = ctx();
        let re = new_object(&mut ctx, "VBScript.RegExp");
        if let Value::Map(map) = &re {
            map.borrow_mut().insert("Pattern", Value::str("x"));
        }
        ctx.set("re", re);
        assert_eq!(
            eval_src(&mut ctx, "re.Replace(\"axbxc\", \"\")"),
            Value::str("abc")
        );
        assert_eq!(eval_src(&mut ctx, "re.Test(\"axb\")"), Value::Bool(true));
        assert_eq!(eval_src(&mut ctx, "re.Test(\"ab\")"), Value::Bool(false));
    }

    #[test]
    fn document_variables_read_from_doc_vars() {
        let mut ctx = ctx();
        ctx.shared()
            .borrow_mut()
            .doc_vars
            .insert("stash".to_string(), Value::str("payload"));
        assert_eq!(
            eval_src(&mut ctx, "ActiveDocument.Variables(\"Stash\")"),
            Value::str("payload")
        );
        assert_eq!(
            eval_src(&mut ctx, "ActiveDocument.BuiltInDocumentProperties(\"stash\")"),
            Value::str("payload")
        );
        assert_eq!(
            eval_src(&mut ctx, "ActiveDocument.Variables(\"missing\")"),
            Value::Unresolved
        );
    }

    #[test]
    fn dotted_variable_read_through_member() {
        let mut ctx = ctx();
        ctx.set("doc.content.text", Value::str("hidden"));
        assert_eq!(eval_src(&mut ctx, "doc.content.text"), Value::str("hidden"));
    }

    #[test]
    fn eval_snippet_parse_failure_is_soft() {
        let mut ctx = ctx();
        assert_eq!(eval_src(&mut ctx, "((("), Value::Unresolved);
        assert_eq!(ctx.shared().borrow().general_errors, 1);
    }

    #[test]
    fn string_index_one_based() {
        let mut ctx = ctx();
        ctx.set("s", Value::str("abc"));
        assert_eq!(eval_src(&mut ctx, "s(2)"), Value::str("b"));
    }
}
