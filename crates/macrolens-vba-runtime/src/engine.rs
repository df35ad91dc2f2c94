//! The embedding surface: load macro modules, run their entry points, and
//! collect what the code would have done to the host.

use std::collections::BTreeMap;

use log::{info, warn};
use serde::Serialize;

use crate::ast::Module;
use crate::context::{Action, Context, Limits};
use crate::error::EmuError;
use crate::expr;
use crate::parser;
use crate::procs;
use crate::stmt;
use crate::value::Value;

/// Sub names invoked automatically by Office when a document opens or
/// closes. Checked case-insensitively.
const ENTRY_POINTS: &[&str] = &[
    "autoopen",
    "auto_open",
    "autoexec",
    "autonew",
    "auto_new",
    "autoclose",
    "auto_close",
    "autoexit",
    "document_open",
    "documentopen",
    "document_close",
    "documentclose",
    "document_new",
    "workbook_open",
    "workbook_activate",
    "workbook_beforeclose",
    "workbook_close",
    "main",
];

/// Everything observable from one emulation run, in report form.
#[derive(Debug, Clone, Serialize)]
pub struct EmulationReport {
    pub actions: Vec<Action>,
    /// Files still open when emulation ended, content rendered lossily.
    pub open_files: BTreeMap<String, String>,
    /// Files written and closed, the usual home of dropped payloads.
    pub closed_files: BTreeMap<String, String>,
    pub general_errors: u32,
    /// True when a comparison touched an environment wildcard, i.e. the
    /// macro branched on something we could not know.
    pub tested_wildcard: bool,
}

/// Tree-walking emulation engine over parsed VBA modules.
///
/// ```
/// use macrolens_vba_runtime::Engine;
///
/// let mut engine = Engine::new();
/// engine
///     .load_module_source("Sub AutoOpen()\n  Shell \"calc.exe\"\nEnd Sub\n")
///     .unwrap();
/// engine.run_entry_points();
/// let report = engine.report();
/// assert_eq!(report.actions[0].action, "Shell function");
/// ```
pub struct Engine {
    ctx: Context,
    modules: Vec<Module>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            ctx: Context::root(limits),
            modules: Vec::new(),
        }
    }

    /// Parses and registers one module's source.
    pub fn load_module_source(&mut self, source: &str) -> Result<(), EmuError> {
        let module = parser::parse_module(source)?;
        self.load_module(module);
        Ok(())
    }

    /// Registers a parsed module: procedures become global callables, DLL
    /// declarations feed the alias table, and module-level declarations
    /// seed globals. Loose statements run later, at [`Engine::run_entry_points`].
    pub fn load_module(&mut self, module: Module) {
        for procedure in &module.procedures {
            self.ctx
                .set_global(&procedure.name, Value::Procedure(procedure.clone()));
        }
        for external in &module.externals {
            let true_name = external
                .alias
                .clone()
                .unwrap_or_else(|| external.name.clone());
            self.ctx
                .shared()
                .borrow_mut()
                .dll_aliases
                .insert(external.name.to_ascii_lowercase(), true_name);
        }
        for constant in &module.constants {
            let value = expr::eval_expr(&mut self.ctx, &constant.value);
            self.ctx.set_global(&constant.name, value);
        }
        for variable in &module.variables {
            let value = match &variable.init {
                Some(init) => expr::eval_expr(&mut self.ctx, init),
                None if variable.is_array => Value::list(Vec::new()),
                None => Value::Unresolved,
            };
            if let Some(var_type) = &variable.var_type {
                self.ctx.set_var_type(&variable.name, var_type);
            }
            self.ctx.set_global(&variable.name, value);
        }
        self.modules.push(module);
    }

    /// Seeds a document variable, the stash decoders read payloads from.
    pub fn set_doc_var(&mut self, name: &str, value: &str) {
        self.ctx
            .shared()
            .borrow_mut()
            .doc_vars
            .insert(name.to_ascii_lowercase(), Value::str(value));
    }

    /// Installs the embedder's sheet-cell resolver, consulted (with a
    /// lowercased reference) when `[A1]` names and `Range` reads miss every
    /// other scope.
    pub fn set_cell_lookup(&mut self, lookup: impl Fn(&str) -> Option<Value> + 'static) {
        self.ctx.shared().borrow_mut().cell_lookup = Some(std::rc::Rc::new(lookup));
    }

    /// Marks an extra function name as interesting enough to report.
    pub fn add_log_func(&mut self, name: &str) {
        self.ctx
            .shared()
            .borrow_mut()
            .log_funcs
            .insert(name.to_ascii_lowercase());
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }

    /// Runs loose module-level code, then every recognized auto-exec entry
    /// point. Returns the names that ran.
    pub fn run_entry_points(&mut self) -> Vec<String> {
        let loose: Vec<Vec<crate::ast::Stmt>> = self
            .modules
            .iter()
            .filter(|m| !m.loose.is_empty())
            .map(|m| m.loose.clone())
            .collect();
        for block in &loose {
            let mut ctx = self.ctx.child();
            ctx.global_scope = true;
            ctx.tagged_blocks = crate::ast::Procedure::collect_labels(block);
            stmt::exec_block(&mut ctx, block);
        }

        let mut ran = Vec::new();
        let entries: Vec<_> = self
            .modules
            .iter()
            .flat_map(|m| m.procedures.iter())
            .filter(|p| ENTRY_POINTS.contains(&p.name.to_ascii_lowercase().as_str()))
            .cloned()
            .collect();
        if entries.is_empty() && loose.is_empty() {
            warn!("no auto-exec entry points found");
        }
        for procedure in entries {
            info!("running entry point {}", procedure.name);
            procs::invoke(&mut self.ctx, &procedure, &[]);
            ran.push(procedure.name.clone());
        }
        ran
    }

    /// Runs one named procedure with the given arguments.
    pub fn run_procedure(&mut self, name: &str, args: &[Value]) -> Value {
        match self.ctx.get(name) {
            Some(Value::Procedure(procedure)) => {
                procs::invoke(&mut self.ctx, &procedure, args).value
            }
            _ => {
                self.ctx
                    .report_general_error(&format!("procedure {name:?} not found"));
                Value::Unresolved
            }
        }
    }

    /// Evaluates one expression against the current state.
    pub fn eval_expression(&mut self, source: &str) -> Result<Value, EmuError> {
        let parsed = parser::parse_expression(source)?;
        Ok(expr::eval_expr(&mut self.ctx, &parsed))
    }

    /// Snapshot of everything observable so far. Re-running emulation after
    /// taking a report appends rather than resetting.
    pub fn report(&self) -> EmulationReport {
        let shared = self.ctx.shared().borrow();
        EmulationReport {
            actions: shared.actions.clone(),
            open_files: shared
                .open_files
                .iter()
                .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
                .collect(),
            closed_files: shared
                .closed_files
                .iter()
                .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
                .collect(),
            general_errors: shared.general_errors,
            tested_wildcard: shared.tested_wildcard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn entry_point_dispatch() {
        let mut engine = Engine::new();
        engine
            .load_module_source(
                "Dim x\nDim y\n\nSub AutoOpen()\n  x = 1\nEnd Sub\n\nSub Helper()\n  y = 1\nEnd Sub\n",
            )
            .unwrap();
        let ran = engine.run_entry_points();
        assert_eq!(ran, vec!["AutoOpen".to_string()]);
        assert_eq!(engine.context().get("x"), Some(Value::Int(1)));
        // Helper is not an auto-exec name and must not have run.
        assert_eq!(engine.context().get("y"), Some(Value::Unresolved));
    }

    #[test]
    fn eval_expression_snapshot() {
        let mut engine = Engine::new();
        assert_eq!(engine.eval_expression("2+2").unwrap(), Value::Int(4));
    }

    #[test]
    fn shell_call_reported() {
        let mut engine = Engine::new();
        engine
            .load_module_source("Sub AutoOpen()\n  Shell \"cmd /c ping example.com\"\nEnd Sub\n")
            .unwrap();
        engine.run_entry_points();
        let report = engine.report();
        assert_eq!(report.actions.len(), 1);
        assert_eq!(report.actions[0].action, "Shell function");
        assert_eq!(report.actions[0].params, "cmd /c ping example.com");
        assert_eq!(report.actions[0].description, "Execute Command");
    }

    #[test]
    fn doc_var_feeds_resolution() {
        let mut engine = Engine::new();
        engine.set_doc_var("stash", "payload");
        engine
            .load_module_source("Dim x\n\nSub AutoOpen()\n  x = stash\nEnd Sub\n")
            .unwrap();
        engine.run_entry_points();
        assert_eq!(engine.context().get("x"), Some(Value::str("payload")));
    }

    #[test]
    fn cell_lookup_feeds_bracket_and_range_reads() {
        let mut engine = Engine::new();
        engine.set_cell_lookup(|reference| {
            (reference == "b2").then(|| Value::str("calc.exe"))
        });
        engine
            .load_module_source(
                "Dim a\nDim b\n\nSub AutoOpen()\n  a = [B2]\n  b = ActiveSheet.Range(\"B2\")\nEnd Sub\n",
            )
            .unwrap();
        engine.run_entry_points();
        assert_eq!(engine.context().get("a"), Some(Value::str("calc.exe")));
        assert_eq!(engine.context().get("b"), Some(Value::str("calc.exe")));
    }

    #[test]
    fn module_constants_visible_to_procedures() {
        let mut engine = Engine::new();
        engine
            .load_module_source(
                "Const GREETING = \"hi\"\nDim x\n\nSub AutoOpen()\n  x = GREETING & \"!\"\nEnd Sub\n",
            )
            .unwrap();
        engine.run_entry_points();
        assert_eq!(engine.context().get("x"), Some(Value::str("hi!")));
    }

    #[test]
    fn loose_code_runs_before_entries() {
        let mut engine = Engine::new();
        engine
            .load_module_source("Dim x\nseed = 5\n\nSub AutoOpen()\n  x = seed + 1\nEnd Sub\n")
            .unwrap();
        engine.run_entry_points();
        assert_eq!(engine.context().get("x"), Some(Value::Int(6)));
    }

    #[test]
    fn report_serializes() {
        let mut engine = Engine::new();
        engine
            .load_module_source("Sub AutoOpen()\n  Shell \"calc\"\nEnd Sub\n")
            .unwrap();
        engine.run_entry_points();
        let json = serde_json::to_string(&engine.report()).unwrap();
        assert!(json.contains("Shell function"));
    }

    #[test]
    fn rerun_is_idempotent_for_state() {
        let mut engine = Engine::new();
        engine
            .load_module_source("Dim x\n\nSub AutoOpen()\n  x = x + 1\nEnd Sub\n")
            .unwrap();
        engine.run_entry_points();
        let first = engine.context().get("x");
        assert_eq!(first, Some(Value::Int(1)));
        engine.run_entry_points();
        assert_eq!(engine.context().get("x"), Some(Value::Int(2)));
    }
}
