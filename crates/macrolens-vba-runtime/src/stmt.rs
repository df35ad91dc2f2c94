//! Statement execution.
//!
//! Control flow is flag-driven: `Exit`, `Goto` and emulated errors set
//! flags on the [`Context`] and block runners check them between
//! statements, so nothing ever unwinds through Rust. Loops carry
//! tractability heuristics against the billion-iteration delay loops
//! obfuscated macros use to stall analysis.

use std::rc::Rc;

use log::{debug, warn};

use crate::ast::{
    BinOp, CaseCond, Expr, LoopGuardPos, OnErrorPolicy, Stmt, Target, VarDecl,
};
use crate::coerce::{coerce_to_int, coerce_to_num, coerce_to_str, display, to_f64};
use crate::context::Context;
use crate::expr::{assign_member, eval_expr};
use crate::operators;
use crate::value::Value;

/// Runs a statement block. Stops early when the procedure is exiting, a
/// GOTO already ran the rest inline, or the innermost loop was exited.
/// After every statement a pending error gets one shot at the registered
/// handler.
pub fn exec_block(ctx: &mut Context, stmts: &[Stmt]) {
    for stmt in stmts {
        if ctx.exit_func || ctx.goto_executed || ctx.loop_exit_requested() {
            break;
        }
        exec_stmt(ctx, stmt);
        if let Some(handler) = ctx.take_error_handler() {
            exec_block(ctx, &handler);
            // A real handler block runs to the end of the procedure; an
            // empty one models Resume Next.
            if !handler.is_empty() {
                ctx.goto_executed = true;
            }
        }
    }
}

pub fn exec_stmt(ctx: &mut Context, stmt: &Stmt) {
    match stmt {
        Stmt::Dim(decls) => exec_dim(ctx, decls),
        Stmt::Const(decls) => {
            for decl in decls {
                let value = eval_expr(ctx, &decl.value);
                ctx.set(&decl.name, value);
            }
        }
        Stmt::ReDim {
            name,
            preserve,
            size,
        } => exec_redim(ctx, name, *preserve, size.as_ref()),
        Stmt::Assign { target, value, .. } => {
            let value = eval_expr(ctx, value);
            exec_assign(ctx, target, value);
        }
        Stmt::Call(expr) => {
            eval_expr(ctx, expr);
        }
        Stmt::If { arms, else_body } => {
            for (cond, body) in arms {
                if eval_expr(ctx, cond).is_truthy() {
                    exec_block(ctx, body);
                    return;
                }
            }
            exec_block(ctx, else_body);
        }
        Stmt::SelectCase { subject, arms } => exec_select(ctx, subject, arms),
        Stmt::For {
            var,
            start,
            end,
            step,
            body,
        } => exec_for(ctx, var, start, end, step.as_ref(), body),
        Stmt::ForEach { var, seq, body } => exec_for_each(ctx, var, seq, body),
        Stmt::DoLoop {
            guard,
            guard_pos,
            until,
            body,
        } => exec_do(ctx, guard.as_ref(), *guard_pos, *until, body),
        Stmt::ExitFor | Stmt::ExitDo => ctx.exit_loop(),
        Stmt::ExitFunction | Stmt::ExitSub => ctx.exit_func = true,
        Stmt::With { object, body } => exec_with(ctx, object, body),
        Stmt::Goto(label) => exec_goto(ctx, label),
        Stmt::Label(_) => {}
        Stmt::OnError(policy) => exec_on_error(ctx, policy),
        Stmt::Resume => ctx.clear_error(),
        Stmt::FileOpen {
            path,
            file_id,
            mode,
        } => exec_file_open(ctx, path, file_id.as_ref(), mode.as_deref()),
        Stmt::FileClose(ids) => exec_file_close(ctx, ids),
        Stmt::FilePrint { file_id, values } => exec_file_print(ctx, file_id, values),
        Stmt::DebugPrint(values) => {
            let parts: Vec<String> = values
                .iter()
                .map(|e| display(&eval_expr(ctx, e)))
                .collect();
            debug!("Debug.Print {}", parts.join(" "));
        }
        Stmt::DoEvents => {}
        Stmt::Expr(expr) => {
            eval_expr(ctx, expr);
        }
    }
}

// --- declarations ------------------------------------------------------------

fn exec_dim(ctx: &mut Context, decls: &[VarDecl]) {
    for decl in decls {
        if let Some(var_type) = &decl.var_type {
            ctx.set_var_type(&decl.name, var_type);
        }
        let value = if let Some(init) = &decl.init {
            eval_expr(ctx, init)
        } else if decl.is_array {
            Value::list(new_array(ctx, decl.array_size.as_ref()))
        } else {
            Value::Unresolved
        };
        ctx.set(&decl.name, value);
    }
}

/// Declared arrays are 0-based through their upper bound inclusive.
fn new_array(ctx: &mut Context, size: Option<&Expr>) -> Vec<Value> {
    const MAX_ARRAY: i64 = 100_000;
    let upper = size
        .map(|e| eval_expr(ctx, e))
        .as_ref()
        .and_then(coerce_to_int)
        .unwrap_or(-1);
    let upper = upper.clamp(-1, MAX_ARRAY);
    vec![Value::Unresolved; (upper + 1) as usize]
}

fn exec_redim(ctx: &mut Context, name: &str, preserve: bool, size: Option<&Expr>) {
    let mut items = new_array(ctx, size);
    if preserve {
        if let Some(Value::List(old)) = ctx.get(name) {
            for (i, item) in old.borrow().iter().enumerate() {
                if i >= items.len() {
                    break;
                }
                items[i] = item.clone();
            }
        }
    }
    ctx.set(name, Value::list(items));
}

// --- assignment --------------------------------------------------------------

fn exec_assign(ctx: &mut Context, target: &Target, value: Value) {
    match target {
        Target::Name(name) => {
            if name.is_empty() {
                return;
            }
            let value = coerce_for_type(ctx, name, value);
            ctx.set(name, value);
        }
        Target::Index { name, indices } => {
            let indices: Vec<i64> = indices
                .iter()
                .map(|e| {
                    let v = eval_expr(ctx, e);
                    coerce_to_int(&v).unwrap_or(0)
                })
                .collect();
            let list = match ctx.get(name) {
                Some(Value::List(list)) => list,
                _ => {
                    let fresh = Value::list(Vec::new());
                    ctx.set(name, fresh.clone());
                    match fresh {
                        Value::List(list) => list,
                        _ => return,
                    }
                }
            };
            list_store(&list, &indices, value);
        }
        Target::Member { leading_dot, parts } => {
            assign_member(ctx, *leading_dot, parts, value);
        }
    }
}

/// Assignments to String-typed variables pick up an implicit CStr, which is
/// what turns decoded byte soup back into usable command lines.
fn coerce_for_type(ctx: &Context, name: &str, value: Value) -> Value {
    match ctx.var_type(name) {
        Some(t) if t.eq_ignore_ascii_case("string") && !matches!(value, Value::Str(_)) => {
            Value::str(coerce_to_str(&value))
        }
        _ => value,
    }
}

/// Writes through nested lists, growing the outer one on demand.
fn list_store(list: &crate::value::ListRef, indices: &[i64], value: Value) {
    const MAX_AUTO_GROW: i64 = 1_000_000;
    let Some((&index, rest)) = indices.split_first() else {
        return;
    };
    if !(0..=MAX_AUTO_GROW).contains(&index) {
        return;
    }
    let index = index as usize;
    let mut items = list.borrow_mut();
    if items.len() <= index {
        items.resize(index + 1, Value::Unresolved);
    }
    if rest.is_empty() {
        items[index] = value;
        return;
    }
    if let Value::List(inner) = items[index].clone() {
        drop(items);
        list_store(&inner, rest, value);
    }
}

// --- select case -------------------------------------------------------------

fn exec_select(ctx: &mut Context, subject: &Expr, arms: &[crate::ast::CaseArm]) {
    let subject = eval_expr(ctx, subject);
    for arm in arms {
        let mut matched = false;
        for cond in &arm.conds {
            matched = match cond {
                CaseCond::Value(e) => eval_expr(ctx, e) == subject,
                CaseCond::Range(lo, hi) => {
                    let lo = eval_expr(ctx, lo);
                    let hi = eval_expr(ctx, hi);
                    operators::compare(&lo, &subject) != std::cmp::Ordering::Greater
                        && operators::compare(&subject, &hi) != std::cmp::Ordering::Greater
                }
                CaseCond::Is(op, e) => {
                    let rhs = eval_expr(ctx, e);
                    operators::eval_binop(ctx, *op, &subject, &rhs).is_truthy()
                }
                CaseCond::Else => true,
            };
            if matched {
                break;
            }
        }
        if matched {
            exec_block(ctx, &arm.body);
            return;
        }
    }
}

// --- For loops ---------------------------------------------------------------

/// Iteration counts beyond this bound are treated as analysis stalling and
/// clamped down when no closed form applies.
const HUGE_LOOP: i64 = 100_000_000;
const CLAMPED_ITERS: i64 = 10;

fn exec_for(
    ctx: &mut Context,
    var: &str,
    start: &Expr,
    end: &Expr,
    step: Option<&Expr>,
    body: &[Stmt],
) {
    let start_value = eval_expr(ctx, start);
    let end_value = eval_expr(ctx, end);
    let step_i = step
        .map(|e| eval_expr(ctx, e))
        .as_ref()
        .and_then(coerce_to_int)
        .filter(|s| *s != 0)
        .unwrap_or(1);

    let (Some(start_i), Some(end_i)) = (
        coerce_to_int(&start_value),
        coerce_to_int(&end_value),
    ) else {
        // Unresolvable bounds: run the body once so its effects surface.
        debug!("loop bounds unresolved, running body once");
        ctx.set(var, start_value);
        ctx.enter_loop();
        exec_block(ctx, body);
        ctx.leave_loop();
        return;
    };

    let iterations = for_iterations(start_i, end_i, step_i);
    if iterations == 0 {
        ctx.set(var, Value::Int(start_i));
        return;
    }

    // Pure counter bodies collapse to arithmetic regardless of the
    // iteration count.
    if apply_closed_form(ctx, var, iterations, body) {
        ctx.set(var, Value::Int(start_i.wrapping_add((iterations as i64).wrapping_mul(step_i))));
        return;
    }

    let mut end_i = end_i;
    if iterations > HUGE_LOOP as i128 {
        warn!("clamping {iterations}-iteration For loop to {CLAMPED_ITERS}");
        end_i = start_i.wrapping_add(step_i.wrapping_mul(CLAMPED_ITERS - 1));
    }

    ctx.enter_loop();
    let mut current = start_i;
    let mut static_passes = 0u32;
    let mut last_fingerprint = None;
    let skip = [var.to_ascii_lowercase()];
    let mut count: u64 = 0;
    while (step_i > 0 && current <= end_i) || (step_i < 0 && current >= end_i) {
        if count >= ctx.limits.loop_upper_bound {
            warn!("For loop hit the iteration cap, truncating");
            break;
        }
        ctx.set(var, Value::Int(current));
        exec_block(ctx, body);
        if ctx.exit_func || ctx.goto_executed || ctx.loop_exit_requested() {
            break;
        }
        let fingerprint = ctx.state_fingerprint(&skip);
        if last_fingerprint == Some(fingerprint) {
            static_passes += 1;
            if static_passes >= ctx.limits.max_static_iters {
                debug!("For loop body changes no state, stopping early");
                // Code after the loop often reads the counter; leave it
                // where a full run would have.
                ctx.set(
                    var,
                    Value::Int(start_i.wrapping_add((iterations as i64).wrapping_mul(step_i))),
                );
                ctx.leave_loop();
                return;
            }
        } else {
            static_passes = 0;
        }
        last_fingerprint = Some(fingerprint);
        current = current.wrapping_add(step_i);
        count += 1;
    }
    ctx.leave_loop();
}

fn for_iterations(start: i64, end: i64, step: i64) -> i128 {
    let span = end as i128 - start as i128;
    let step = step as i128;
    if (step > 0 && span >= 0) || (step < 0 && span <= 0) {
        span / step + 1
    } else {
        0
    }
}

/// One `v = v + delta` style update extracted from a loop body.
struct CounterUpdate<'a> {
    var: String,
    subtract: bool,
    delta: &'a Expr,
}

/// Recognizes bodies made purely of loop-invariant counter updates. Any
/// other statement shape disqualifies the body.
fn counter_updates<'a>(loop_var: &str, body: &'a [Stmt]) -> Option<Vec<CounterUpdate<'a>>> {
    let loop_var = loop_var.to_ascii_lowercase();
    let mut updates: Vec<CounterUpdate<'a>> = Vec::new();
    for stmt in body {
        let Stmt::Assign {
            target: Target::Name(name),
            value:
                Expr::Bin {
                    op: op @ (BinOp::Add | BinOp::Sub),
                    lhs,
                    rhs,
                },
            ..
        } = stmt
        else {
            return None;
        };
        let var = name.to_ascii_lowercase();
        if var == loop_var {
            return None;
        }
        if !matches!(&**lhs, Expr::Name(l) if l.to_ascii_lowercase() == var) {
            return None;
        }
        if updates.iter().any(|u| u.var == var) {
            return None;
        }
        updates.push(CounterUpdate {
            var,
            subtract: matches!(op, BinOp::Sub),
            delta: rhs,
        });
    }
    // Deltas must not read the loop variable or any updated counter.
    let mut forbidden: Vec<String> = updates.iter().map(|u| u.var.clone()).collect();
    forbidden.push(loop_var);
    if !updates.iter().all(|u| expr_is_invariant(u.delta, &forbidden)) {
        return None;
    }
    Some(updates)
}

fn expr_is_invariant(expr: &Expr, forbidden: &[String]) -> bool {
    match expr {
        Expr::Int(_) | Expr::Float(_) | Expr::Str(_) | Expr::Bool(_) | Expr::Nothing => true,
        Expr::Name(n) => !forbidden.contains(&n.to_ascii_lowercase()),
        Expr::Bin { lhs, rhs, .. } => {
            expr_is_invariant(lhs, forbidden) && expr_is_invariant(rhs, forbidden)
        }
        Expr::Un { expr, .. } => expr_is_invariant(expr, forbidden),
        _ => false,
    }
}

/// Applies the closed form for a counter-only body: each update becomes
/// `final = initial + iterations * delta`.
fn apply_closed_form(ctx: &mut Context, loop_var: &str, iterations: i128, body: &[Stmt]) -> bool {
    let Some(updates) = counter_updates(loop_var, body) else {
        return false;
    };
    // Evaluate everything before mutating so a half-applied body never
    // leaks out.
    let mut finals: Vec<(String, Value)> = Vec::new();
    for update in &updates {
        let delta = eval_expr(ctx, update.delta);
        let current = ctx.get(&update.var).unwrap_or(Value::Unresolved);
        let sign: i128 = if update.subtract { -1 } else { 1 };
        let next = match (coerce_to_num(&current), coerce_to_num(&delta)) {
            (Some(Value::Int(c)), Some(Value::Int(d))) => {
                Value::Int((c as i128 + sign * iterations * d as i128) as i64)
            }
            _ => match (to_f64(&current), to_f64(&delta)) {
                (Some(c), Some(d)) => {
                    Value::Float(c + sign as f64 * iterations as f64 * d)
                }
                _ => return false,
            },
        };
        finals.push((update.var.clone(), next));
    }
    debug!("collapsed {iterations}-iteration counter loop to closed form");
    for (var, value) in finals {
        ctx.set(&var, value);
    }
    true
}

fn exec_for_each(ctx: &mut Context, var: &str, seq: &Expr, body: &[Stmt]) {
    let seq = eval_expr(ctx, seq);
    let items: Vec<Value> = match &seq {
        Value::List(items) => items.borrow().clone(),
        Value::Str(s) => s.chars().map(|c| Value::str(c.to_string())).collect(),
        Value::Map(map) => map
            .borrow()
            .entries
            .iter()
            .map(|(k, _)| Value::str(k.clone()))
            .collect(),
        _ => Vec::new(),
    };
    ctx.enter_loop();
    for item in items {
        ctx.set(var, item);
        exec_block(ctx, body);
        if ctx.exit_func || ctx.goto_executed || ctx.loop_exit_requested() {
            break;
        }
    }
    ctx.leave_loop();
}

// --- Do / While loops --------------------------------------------------------

fn exec_do(
    ctx: &mut Context,
    guard: Option<&Expr>,
    guard_pos: LoopGuardPos,
    until: bool,
    body: &[Stmt],
) {
    // Constant guards cannot make progress; sample the body instead of
    // spinning on it.
    let constant = guard.map(|g| is_constant_expr(g));
    if let (Some(guard), Some(true)) = (guard, constant) {
        let mut holds = eval_expr(ctx, guard).is_truthy();
        if until {
            holds = !holds;
        }
        if !holds {
            if guard_pos == LoopGuardPos::Post {
                run_bounded(ctx, body, 1);
            }
            return;
        }
        debug!("constant-true loop guard, sampling the body");
        run_bounded(ctx, body, 2);
        return;
    }
    if guard.is_none() {
        // Bare `Do ... Loop` only terminates via Exit Do or Goto; sample.
        run_bounded(ctx, body, 2);
        return;
    }
    let guard = match guard {
        Some(g) => g,
        None => return,
    };

    if try_do_closed_form(ctx, guard, guard_pos, until, body) {
        return;
    }

    ctx.enter_loop();
    let mut static_passes = 0u32;
    let mut last_fingerprint = None;
    let mut count: u64 = 0;
    loop {
        if guard_pos == LoopGuardPos::Pre {
            let mut holds = eval_expr(ctx, guard).is_truthy();
            if until {
                holds = !holds;
            }
            if !holds {
                break;
            }
        }
        if count >= ctx.limits.loop_upper_bound {
            warn!("Do loop hit the iteration cap, truncating");
            break;
        }
        exec_block(ctx, body);
        count += 1;
        if ctx.exit_func || ctx.goto_executed || ctx.loop_exit_requested() {
            break;
        }
        let fingerprint = ctx.state_fingerprint(&[]);
        if last_fingerprint == Some(fingerprint) {
            static_passes += 1;
            if static_passes >= ctx.limits.max_static_iters {
                debug!("Do loop body changes no state, stopping early");
                break;
            }
        } else {
            static_passes = 0;
        }
        last_fingerprint = Some(fingerprint);
        if guard_pos != LoopGuardPos::Pre {
            let mut holds = eval_expr(ctx, guard).is_truthy();
            if until {
                holds = !holds;
            }
            if !holds {
                break;
            }
        }
    }
    ctx.leave_loop();
}

fn run_bounded(ctx: &mut Context, body: &[Stmt], passes: usize) {
    ctx.enter_loop();
    for _ in 0..passes {
        exec_block(ctx, body);
        if ctx.exit_func || ctx.goto_executed || ctx.loop_exit_requested() {
            break;
        }
    }
    ctx.leave_loop();
}

fn is_constant_expr(expr: &Expr) -> bool {
    match expr {
        Expr::Int(_) | Expr::Float(_) | Expr::Str(_) | Expr::Bool(_) | Expr::Nothing => true,
        Expr::Bin { lhs, rhs, .. } => is_constant_expr(lhs) && is_constant_expr(rhs),
        Expr::Un { expr, .. } => is_constant_expr(expr),
        _ => false,
    }
}

/// Counter loops with a comparison guard (`Do While i < 2000000000`)
/// collapse the same way counted For loops do.
fn try_do_closed_form(
    ctx: &mut Context,
    guard: &Expr,
    guard_pos: LoopGuardPos,
    until: bool,
    body: &[Stmt],
) -> bool {
    if guard_pos != LoopGuardPos::Pre {
        return false;
    }
    let Expr::Bin { op, lhs, rhs } = guard else {
        return false;
    };
    let Expr::Name(counter) = &**lhs else {
        return false;
    };
    let counter = counter.to_ascii_lowercase();
    let mut op = *op;
    if until {
        op = match op {
            BinOp::Lt => BinOp::Ge,
            BinOp::Le => BinOp::Gt,
            BinOp::Gt => BinOp::Le,
            BinOp::Ge => BinOp::Lt,
            _ => return false,
        };
    }
    if !matches!(op, BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge) {
        return false;
    }
    let Some(updates) = counter_updates("", body) else {
        return false;
    };
    let Some(counter_update) = updates.iter().find(|u| u.var == counter) else {
        return false;
    };
    if !expr_is_invariant(rhs, &[counter.clone()]) {
        return false;
    }

    let bound = eval_expr(ctx, rhs);
    let delta_value = eval_expr(ctx, counter_update.delta);
    let (Some(bound), Some(delta), Some(start)) = (
        coerce_to_int(&bound),
        coerce_to_int(&delta_value),
        ctx.get(&counter).as_ref().and_then(coerce_to_int),
    ) else {
        return false;
    };
    let delta = if counter_update.subtract { -delta } else { delta };
    if delta == 0 {
        return false;
    }

    let iterations = do_iterations(start, bound, delta, op);
    let Some(iterations) = iterations else {
        return false;
    };
    if iterations == 0 {
        return true;
    }
    let mut finals: Vec<(String, Value)> = Vec::new();
    for update in &updates {
        let delta = eval_expr(ctx, update.delta);
        let current = ctx.get(&update.var).unwrap_or(Value::Unresolved);
        let sign: i128 = if update.subtract { -1 } else { 1 };
        if let (Some(c), Some(d)) = (coerce_to_int(&current), coerce_to_int(&delta)) {
            finals.push((
                update.var.clone(),
                Value::Int((c as i128 + sign * iterations * d as i128) as i64),
            ));
        } else {
            return false;
        }
    }
    for (var, value) in finals {
        ctx.set(&var, value);
    }
    debug!("collapsed {iterations}-iteration Do loop to closed form");
    true
}

/// Iterations of `while counter <op> bound` with the counter moving by
/// `delta` per pass. `None` when the loop never terminates.
fn do_iterations(start: i64, bound: i64, delta: i64, op: BinOp) -> Option<i128> {
    let start = start as i128;
    let bound = bound as i128;
    let delta = delta as i128;
    let (gap, toward) = match op {
        BinOp::Lt => (bound - start, delta > 0),
        BinOp::Le => (bound - start + 1, delta > 0),
        BinOp::Gt => (start - bound, delta < 0),
        BinOp::Ge => (start - bound + 1, delta < 0),
        _ => return None,
    };
    if gap <= 0 {
        return Some(0);
    }
    if !toward {
        return None;
    }
    let step = delta.abs();
    Some((gap + step - 1) / step)
}

// --- With, Goto, error policy ------------------------------------------------

fn exec_with(ctx: &mut Context, object: &Expr, body: &[Stmt]) {
    let previous = ctx.with_prefix.clone();
    let raw = object.dotted_name();
    let new_prefix = match &raw {
        Some(r) if r.starts_with('.') && !previous.is_empty() => {
            format!("{previous}{r}")
        }
        Some(r) => r.trim_start_matches('.').to_string(),
        None => previous.clone(),
    };
    // Bind the evaluated object under the prefix so leading-dot method
    // calls can dispatch on it.
    let object_value = eval_expr(ctx, object);
    if matches!(object_value, Value::Map(_)) {
        ctx.set_local(&new_prefix, object_value);
    }
    ctx.with_prefix = new_prefix;
    exec_block(ctx, body);
    ctx.with_prefix = previous;
}

fn exec_goto(ctx: &mut Context, label: &str) {
    if ctx.gotos_taken >= ctx.limits.max_gotos {
        warn!("GOTO budget exhausted, ignoring jump to {label:?}");
        return;
    }
    let block = match ctx.tagged_blocks.get(&label.to_ascii_lowercase()) {
        Some(block) => block.clone(),
        None => {
            ctx.report_general_error(&format!("GOTO target {label:?} not found"));
            return;
        }
    };
    ctx.gotos_taken += 1;
    // The jump abandons every live loop; the labeled suffix runs inline
    // and the flag stops everything behind it.
    ctx.exit_all_loops();
    ctx.goto_executed = false;
    exec_block(ctx, &block);
    ctx.goto_executed = true;
}

fn exec_on_error(ctx: &mut Context, policy: &OnErrorPolicy) {
    match policy {
        OnErrorPolicy::GotoLabel(label) => {
            match ctx.tagged_blocks.get(&label.to_ascii_lowercase()) {
                Some(block) => ctx.error_handler = Some(block.clone()),
                None => warn!("error handler label {label:?} not found"),
            }
        }
        // Resume Next is an empty handler: errors get cleared and nothing
        // else happens.
        OnErrorPolicy::ResumeNext => ctx.error_handler = Some(Rc::new(Vec::new())),
        OnErrorPolicy::GotoZero => ctx.error_handler = None,
    }
}

// --- file statements ---------------------------------------------------------

fn file_id_text(ctx: &mut Context, expr: &Expr) -> String {
    let id = display(&eval_expr(ctx, expr));
    if id.starts_with('#') {
        id
    } else {
        format!("#{id}")
    }
}

fn exec_file_open(ctx: &mut Context, path: &Expr, file_id: Option<&Expr>, mode: Option<&str>) {
    let name = display(&eval_expr(ctx, path));
    let id = match file_id {
        Some(expr) => file_id_text(ctx, expr),
        None => format!("#{}", ctx.num_open_files() + 1),
    };
    debug!("Open {name:?} As {id} ({})", mode.unwrap_or("Output"));
    ctx.set_global(&id, Value::str(name.clone()));
    ctx.report_action("OPEN", &name, "Open File");
    ctx.open_file(&name, &id);
}

fn exec_file_close(ctx: &mut Context, ids: &[Expr]) {
    if ids.is_empty() {
        // Bare `Close` closes every open file.
        let names: Vec<String> = ctx.shared().borrow().open_files.keys().cloned().collect();
        for name in names {
            ctx.close_file(&name);
        }
        return;
    }
    for id in ids {
        let id = file_id_text(ctx, id);
        ctx.close_file(&id);
    }
}

fn exec_file_print(ctx: &mut Context, file_id: &Expr, values: &[Expr]) {
    let id = file_id_text(ctx, file_id);
    let mut data = String::new();
    for value in values {
        let value = eval_expr(ctx, value);
        data.push_str(&coerce_to_str(&value));
    }
    data.push_str("\r\n");
    ctx.write_file(&id, data.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Limits;
    use crate::parser;

    fn run_body(src: &str) -> Context {
        let wrapped = format!("Sub T()\n{src}\nEnd Sub\n");
        let module = parser::parse_module(&wrapped).unwrap();
        let procedure = module.procedures[0].clone();
        let mut ctx = Context::root(Limits::default());
        ctx.tagged_blocks = procedure.labels.clone();
        exec_block(&mut ctx, &procedure.body);
        if let Some(tail) = &procedure.bogus_if {
            exec_block(&mut ctx, tail);
        }
        ctx
    }

    #[test]
    fn if_else_branches() {
        let ctx = run_body("x = 5\nIf x > 3 Then\n y = 1\nElse\n y = 2\nEnd If");
        assert_eq!(ctx.get("y"), Some(Value::Int(1)));
    }

    #[test]
    fn select_case_range_and_else() {
        let ctx = run_body("x = 4\nSelect Case x\nCase 1\n r = 1\nCase 3 To 5\n r = 2\nCase Else\n r = 3\nEnd Select");
        assert_eq!(ctx.get("r"), Some(Value::Int(2)));
    }

    #[test]
    fn for_loop_accumulates() {
        let ctx = run_body("s = 0\nFor i = 1 To 5\n s = s + i\nNext i");
        assert_eq!(ctx.get("s"), Some(Value::Int(15)));
        assert_eq!(ctx.get("i"), Some(Value::Int(6)));
    }

    #[test]
    fn huge_counter_loop_collapses_to_closed_form() {
        let ctx = run_body("y = 0\nFor x = 1 To 2000000000\n y = y + 1\nNext x");
        assert_eq!(ctx.get("y"), Some(Value::Int(2_000_000_000)));
        assert_eq!(ctx.get("x"), Some(Value::Int(2_000_000_001)));
    }

    #[test]
    fn huge_loop_with_side_effects_is_clamped() {
        // Chr calls disqualify the closed form; the loop gets clamped
        // instead of spinning.
        let ctx = run_body("s = \"\"\nFor i = 1 To 200000000\n s = s & Chr(65)\nNext");
        let s = ctx.get("s");
        assert!(matches!(s, Some(Value::Str(ref v)) if !v.is_empty() && v.len() <= 16));
    }

    #[test]
    fn static_body_abort_jumps_counter_to_the_end() {
        // The body stops changing state after the first pass; the loop is
        // cut short but the counter still reads as fully run.
        let ctx = run_body("For i = 1 To 1000000\n x = 5\nNext\nr = i");
        assert_eq!(ctx.get("x"), Some(Value::Int(5)));
        assert_eq!(ctx.get("r"), Some(Value::Int(1_000_001)));
    }

    #[test]
    fn exit_for_stops_the_loop() {
        let ctx = run_body("s = 0\nFor i = 1 To 10\n s = s + 1\n If i = 3 Then\n Exit For\n End If\nNext");
        assert_eq!(ctx.get("s"), Some(Value::Int(3)));
    }

    #[test]
    fn do_until_counts() {
        let ctx = run_body("i = 0\nDo Until i = 3\n i = i + 1\nLoop");
        assert_eq!(ctx.get("i"), Some(Value::Int(3)));
    }

    #[test]
    fn while_wend_counts() {
        let ctx = run_body("i = 0\nWhile i < 4\n i = i + 1\nWend");
        assert_eq!(ctx.get("i"), Some(Value::Int(4)));
    }

    #[test]
    fn huge_do_counter_collapses() {
        let ctx = run_body("i = 0\nDo While i < 2000000000\n i = i + 1\nLoop");
        assert_eq!(ctx.get("i"), Some(Value::Int(2_000_000_000)));
    }

    #[test]
    fn constant_true_guard_samples_body() {
        let ctx = run_body("n = 0\nDo While 1 = 1\n n = n + 1\nLoop");
        assert_eq!(ctx.get("n"), Some(Value::Int(2)));
    }

    #[test]
    fn regexp_pattern_set_then_replace() {
        let ctx = run_body(
            "Set re = CreateObject(\"VBScript.RegExp\")\nre.Pattern = \"x\"\nout = re.Replace(\"axbxc\", \"\")",
        );
        assert_eq!(ctx.get("out"), Some(Value::str("abc")));
    }

    #[test]
    fn for_each_over_array() {
        let ctx = run_body("t = \"\"\nFor Each x In Array(\"a\", \"b\")\n t = t & x\nNext");
        assert_eq!(ctx.get("t"), Some(Value::str("ab")));
    }

    #[test]
    fn goto_unknown_label_is_soft() {
        let ctx = run_body("GoTo nowhere\nx = 1");
        assert_eq!(ctx.shared().borrow().general_errors, 1);
        // Execution carries on past the bad jump.
        assert_eq!(ctx.get("x"), Some(Value::Int(1)));
    }

    #[test]
    fn goto_skips_to_label() {
        let ctx = run_body("GoTo Past\nx = 1\nPast:\ny = 2");
        assert_eq!(ctx.get("x"), None);
        assert_eq!(ctx.get("y"), Some(Value::Int(2)));
    }

    #[test]
    fn on_error_resume_next_survives_division() {
        let ctx = run_body("On Error Resume Next\nx = 1 / 0\ny = 2");
        assert_eq!(ctx.get("y"), Some(Value::Int(2)));
        assert!(!ctx.got_error);
    }

    #[test]
    fn on_error_goto_routes_to_handler() {
        let ctx = run_body(
            "On Error GoTo Oops\nx = 1 / 0\nx = 99\nExit Sub\nOops:\ny = 1",
        );
        assert_eq!(ctx.get("y"), Some(Value::Int(1)));
        assert_ne!(ctx.get("x"), Some(Value::Int(99)));
    }

    #[test]
    fn unhandled_error_does_not_stop_the_block() {
        let ctx = run_body("x = 1 / 0\ny = 2");
        assert_eq!(ctx.get("y"), Some(Value::Int(2)));
        assert!(ctx.got_error);
    }

    #[test]
    fn with_block_prefixes_assignments() {
        let ctx = run_body("With obj\n .field = 7\nEnd With");
        assert_eq!(ctx.get("obj.field"), Some(Value::Int(7)));
    }

    #[test]
    fn file_open_print_close() {
        let ctx = run_body("Open \"out.txt\" For Output As #1\nPrint #1, \"data\"\nClose #1");
        let shared = ctx.shared().borrow();
        assert_eq!(
            shared.closed_files.get("out.txt").map(|v| v.as_slice()),
            Some(b"data\r\n".as_slice())
        );
        assert!(shared
            .actions
            .iter()
            .any(|a| a.action == "OPEN" && a.params == "out.txt"));
    }

    #[test]
    fn array_element_assignment() {
        let ctx = run_body("a = Array(1, 2, 3)\na(1) = 9\nr = a(1)");
        assert_eq!(ctx.get("r"), Some(Value::Int(9)));
    }

    #[test]
    fn redim_preserve_keeps_contents() {
        let ctx = run_body("Dim a(2)\na(0) = 5\nReDim Preserve a(5)\nr = a(0)");
        assert_eq!(ctx.get("r"), Some(Value::Int(5)));
    }

    #[test]
    fn string_typed_variable_coerces_assignments() {
        let ctx = run_body("Dim s As String\ns = 42\nr = s");
        assert_eq!(ctx.get("r"), Some(Value::str("42")));
    }
}
