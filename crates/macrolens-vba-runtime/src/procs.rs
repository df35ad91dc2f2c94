//! Procedure invocation: scoping, parameter binding, the implicit return
//! variable, and recursion guards.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use log::{debug, warn};

use crate::ast::{PassMode, ProcKind, Procedure, Stmt};
use crate::coerce::coerce_to_str;
use crate::context::Context;
use crate::expr::eval_expr;
use crate::stmt::exec_block;
use crate::value::Value;

/// Result of one call: the return value plus the final values of ByRef
/// parameters, keyed by argument position for the caller's write-back.
pub struct CallOutcome {
    pub value: Value,
    pub byref: Vec<(usize, Value)>,
}

impl CallOutcome {
    fn sentinel() -> Self {
        Self {
            value: Value::Unresolved,
            byref: Vec::new(),
        }
    }
}

/// Runs a procedure in a child scope. Functions read their return value
/// from a local named after themselves; Subs return the sentinel. A frame
/// identical to a live one (same procedure, same arguments) is cut off as
/// unbounded recursion.
pub fn invoke(ctx: &mut Context, procedure: &Rc<Procedure>, args: &[Value]) -> CallOutcome {
    if ctx.depth + 1 > ctx.limits.max_call_depth {
        ctx.report_general_error(&format!(
            "call depth limit reached invoking {}",
            procedure.name
        ));
        return CallOutcome::sentinel();
    }
    let frame = frame_fingerprint(procedure, args);
    if ctx.shared().borrow().call_stack.contains(&frame) {
        warn!("recursive call to {} with identical arguments, cutting off", procedure.name);
        return CallOutcome::sentinel();
    }
    ctx.shared().borrow_mut().call_stack.push(frame);
    debug!("calling {} with {} argument(s)", procedure.name, args.len());

    let mut child = ctx.child();
    child.curr_func_name = procedure.name.to_ascii_lowercase();
    child.tagged_blocks = procedure.labels.clone();

    let is_function = matches!(
        procedure.kind,
        ProcKind::Function | ProcKind::PropertyGet
    );
    // Only zero-parameter functions pre-seed the implicit return variable;
    // seeding it on parameterized ones would shadow the procedure itself
    // for recursive calls.
    if is_function && procedure.params.is_empty() {
        child.set_local(&procedure.name, Value::Unresolved);
    }

    let mut byref_params: Vec<(usize, String)> = Vec::new();
    for (i, param) in procedure.params.iter().enumerate() {
        let mut value = match args.get(i) {
            Some(value) => value.clone(),
            None => param
                .default
                .as_ref()
                .map(|d| eval_expr(&mut child, d))
                .unwrap_or(Value::Unresolved),
        };
        if let Some(var_type) = &param.var_type {
            child.set_var_type(&param.name, var_type);
            if var_type.eq_ignore_ascii_case("string") && !matches!(value, Value::Str(_)) {
                // A literal 0 actual (the placeholder obfuscators pass for
                // "no value") blanks like the sentinel does.
                value = match value {
                    Value::Unresolved | Value::Int(0) => Value::str(""),
                    other => Value::str(coerce_to_str(&other)),
                };
            }
        }
        child.set_local(&param.name, value);
        if matches!(param.mode, PassMode::ByRef) {
            byref_params.push((i, param.name.clone()));
        }
    }

    // Const declarations bind before any statement runs, wherever they sit
    // in the body.
    for stmt in &procedure.body {
        if let Stmt::Const(decls) = stmt {
            for decl in decls {
                let value = eval_expr(&mut child, &decl.value);
                child.set_local(&decl.name, value);
            }
        }
    }

    exec_block(&mut child, &procedure.body);
    if let Some(tail) = &procedure.bogus_if {
        // The malformed trailing If still runs, after the body proper.
        child.goto_executed = false;
        exec_block(&mut child, tail);
    }

    ctx.shared().borrow_mut().call_stack.pop();

    // The emulated error flag survives the return so the caller's handler
    // can fire.
    if child.got_error {
        ctx.got_error = true;
    }

    let byref = byref_params
        .into_iter()
        .filter(|(i, _)| *i < args.len())
        .map(|(i, name)| {
            let value = child.get_local(&name).unwrap_or(Value::Unresolved);
            (i, value)
        })
        .collect();

    let value = if is_function {
        let mut value = match child.get_local(&procedure.name) {
            Some(v) if !v.is_callable() => v,
            _ => Value::str(""),
        };
        if let Some(return_type) = &procedure.return_type {
            if return_type.eq_ignore_ascii_case("string") && !matches!(value, Value::Str(_)) {
                value = Value::str(coerce_to_str(&value));
            }
        }
        value
    } else {
        Value::Unresolved
    };
    CallOutcome { value, byref }
}

fn frame_fingerprint(procedure: &Procedure, args: &[Value]) -> u64 {
    let mut hasher = DefaultHasher::new();
    procedure.name.to_ascii_lowercase().hash(&mut hasher);
    args.len().hash(&mut hasher);
    for arg in args {
        arg.hash_into(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Limits;
    use crate::parser;

    fn call(src: &str, name: &str, args: &[Value]) -> (CallOutcome, Context) {
        let module = parser::parse_module(src).unwrap();
        let mut ctx = Context::root(Limits::default());
        for procedure in &module.procedures {
            ctx.set_global(
                &procedure.name,
                Value::Procedure(procedure.clone()),
            );
        }
        let target = module
            .procedures
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .cloned()
            .unwrap();
        let outcome = invoke(&mut ctx, &target, args);
        (outcome, ctx)
    }

    #[test]
    fn function_returns_named_local() {
        let src = "Function Double(n)\n  Double = n * 2\nEnd Function\n";
        let (outcome, _) = call(src, "Double", &[Value::Int(21)]);
        assert_eq!(outcome.value, Value::Int(42));
    }

    #[test]
    fn untouched_return_variable_is_sentinel_for_zero_param() {
        let src = "Function Nothing_Much()\n  x = 1\nEnd Function\n";
        let (outcome, _) = call(src, "Nothing_Much", &[]);
        assert_eq!(outcome.value, Value::Unresolved);
    }

    #[test]
    fn untouched_return_with_params_is_empty_string() {
        let src = "Function Quiet(n)\n  x = n\nEnd Function\n";
        let (outcome, _) = call(src, "Quiet", &[Value::Int(1)]);
        assert_eq!(outcome.value, Value::str(""));
    }

    #[test]
    fn string_return_type_coerces() {
        let src = "Function F(n) As String\n  F = n\nEnd Function\n";
        let (outcome, _) = call(src, "F", &[Value::Int(7)]);
        assert_eq!(outcome.value, Value::str("7"));
    }

    #[test]
    fn byref_param_reported_back() {
        let src = "Sub Bump(ByRef n)\n  n = n + 1\nEnd Sub\n";
        let (outcome, _) = call(src, "Bump", &[Value::Int(4)]);
        assert_eq!(outcome.byref, vec![(0, Value::Int(5))]);
    }

    #[test]
    fn byval_param_not_reported() {
        let src = "Sub Keep(ByVal n)\n  n = n + 1\nEnd Sub\n";
        let (outcome, _) = call(src, "Keep", &[Value::Int(4)]);
        assert!(outcome.byref.is_empty());
    }

    #[test]
    fn optional_default_used_when_missing() {
        let src = "Function Pick(Optional x = 9)\n  Pick = x\nEnd Function\n";
        let (outcome, _) = call(src, "Pick", &[]);
        assert_eq!(outcome.value, Value::Int(9));
    }

    #[test]
    fn string_typed_param_blanks_the_sentinel() {
        let src = "Function Echo(s As String)\n  Echo = \"[\" & s & \"]\"\nEnd Function\n";
        let (outcome, _) = call(src, "Echo", &[Value::Unresolved]);
        assert_eq!(outcome.value, Value::str("[]"));
    }

    #[test]
    fn string_typed_param_blanks_a_zero_actual() {
        let src = "Function Echo(s As String)\n  Echo = \"[\" & s & \"]\"\nEnd Function\n";
        let (outcome, _) = call(src, "Echo", &[Value::Int(0)]);
        assert_eq!(outcome.value, Value::str("[]"));
        // Other numbers still render normally.
        let (outcome, _) = call(src, "Echo", &[Value::Int(7)]);
        assert_eq!(outcome.value, Value::str("[7]"));
    }

    #[test]
    fn identical_frame_recursion_is_cut_off() {
        let src = "Function Spin(n)\n  Spin = Spin(n)\nEnd Function\n";
        let (outcome, ctx) = call(src, "Spin", &[Value::Int(1)]);
        // The inner identical frame returns the sentinel; the outer call
        // then returns it as the function result.
        assert_eq!(outcome.value, Value::Unresolved);
        assert!(ctx.shared().borrow().call_stack.is_empty());
    }

    #[test]
    fn bounded_recursion_still_works() {
        let src = "Function Fact(n)\n  If n <= 1 Then\n    Fact = 1\n  Else\n    Fact = n * Fact(n - 1)\n  End If\nEnd Function\n";
        let (outcome, _) = call(src, "Fact", &[Value::Int(5)]);
        assert_eq!(outcome.value, Value::Int(120));
    }

    #[test]
    fn exit_function_stops_the_body() {
        let src = "Function F()\n  F = 1\n  Exit Function\n  F = 2\nEnd Function\n";
        let (outcome, _) = call(src, "F", &[]);
        assert_eq!(outcome.value, Value::Int(1));
    }

    #[test]
    fn const_binds_before_use() {
        let src = "Function F()\n  F = K & \"!\"\n  Const K = \"hi\"\nEnd Function\n";
        let (outcome, _) = call(src, "F", &[]);
        assert_eq!(outcome.value, Value::str("hi!"));
    }

    #[test]
    fn error_flag_bubbles_to_caller() {
        let src = "Sub Boom()\n  x = 1 / 0\nEnd Sub\n";
        let (_, ctx) = call(src, "Boom", &[]);
        assert!(ctx.got_error);
    }
}
