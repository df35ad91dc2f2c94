//! Runtime state for one emulation run: scoping, error flags, GOTO label
//! tracking, the emulated file system, and the reported-actions log.

use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, warn};
use serde::Serialize;

use crate::ast::Stmt;
use crate::coerce;
use crate::library;
use crate::value::Value;

/// Resource caps against adversarial input. Loop iteration and recursion
/// depth are bounded independently; hitting either truncates the construct
/// and the run continues.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_call_depth: usize,
    pub loop_upper_bound: u64,
    /// Unchanged-state passes tolerated before a loop is declared a no-op.
    pub max_static_iters: u32,
    /// GOTO jumps tolerated per procedure before jumps become no-ops,
    /// breaking label-based spin loops.
    pub max_gotos: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_call_depth: 100,
            loop_upper_bound: 10_000_000,
            max_static_iters: 2,
            max_gotos: 1000,
        }
    }
}

/// Resolves a sheet cell reference (`A1`, `Sheet1!B2`) to its value. The
/// embedder owning the workbook supplies this; the engine never loads one.
pub type CellLookup = Rc<dyn Fn(&str) -> Option<Value>>;

/// One externally observable effect inferred during emulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Action {
    pub action: String,
    pub params: String,
    pub description: String,
}

/// State shared by reference across every Context in a call chain.
#[derive(Default)]
pub struct Shared {
    pub globals: HashMap<String, Value>,
    pub doc_vars: HashMap<String, Value>,
    pub actions: Vec<Action>,
    pub open_files: HashMap<String, Vec<u8>>,
    pub closed_files: HashMap<String, Vec<u8>>,
    /// `#1` style file ids to their filenames.
    pub file_ids: HashMap<String, String>,
    /// Lowercased local alias to the imported DLL function's true name.
    pub dll_aliases: HashMap<String, String>,
    /// Extra function names whose calls are reported as interesting.
    pub log_funcs: HashSet<String>,
    /// Fingerprints of live call frames, for recursion detection.
    pub call_stack: Vec<u64>,
    pub clipboard: String,
    pub tested_wildcard: bool,
    pub general_errors: u32,
    /// Optional cell-reference resolver for `[A1]` style reads.
    pub cell_lookup: Option<CellLookup>,
}

/// Runtime scope for one procedure invocation. `locals` are owned
/// exclusively; everything in [`Shared`] is visible to the whole call chain.
pub struct Context {
    shared: Rc<RefCell<Shared>>,
    pub locals: HashMap<String, Value>,
    pub var_types: HashMap<String, String>,
    pub with_prefix: String,
    pub with_prefix_raw: Option<String>,
    /// One exit-requested flag per live loop, innermost last.
    pub loop_stack: Vec<bool>,
    /// Label map of the procedure this context is executing.
    pub tagged_blocks: HashMap<String, Rc<Vec<Stmt>>>,
    pub error_handler: Option<Rc<Vec<Stmt>>>,
    pub got_error: bool,
    pub exit_func: bool,
    pub goto_executed: bool,
    /// When set, plain writes land in globals (module-level code).
    pub global_scope: bool,
    pub in_procedure: bool,
    pub curr_func_name: String,
    pub depth: usize,
    pub gotos_taken: u32,
    pub limits: Limits,
}

impl Context {
    pub fn root(limits: Limits) -> Self {
        Self::with_shared(Rc::new(RefCell::new(Shared::default())), limits)
    }

    pub fn with_shared(shared: Rc<RefCell<Shared>>, limits: Limits) -> Self {
        Self {
            shared,
            locals: HashMap::new(),
            var_types: HashMap::new(),
            with_prefix: String::new(),
            with_prefix_raw: None,
            loop_stack: Vec::new(),
            tagged_blocks: HashMap::new(),
            error_handler: None,
            got_error: false,
            exit_func: false,
            goto_executed: false,
            global_scope: true,
            in_procedure: false,
            curr_func_name: String::new(),
            depth: 0,
            gotos_taken: 0,
            limits,
        }
    }

    /// A callee context: fresh locals and flags, shared globals and log.
    pub fn child(&self) -> Self {
        let mut ctx = Self::with_shared(self.shared.clone(), self.limits);
        ctx.depth = self.depth + 1;
        ctx.global_scope = false;
        ctx.in_procedure = true;
        ctx
    }

    pub fn shared(&self) -> &Rc<RefCell<Shared>> {
        &self.shared
    }

    // --- name resolution ----------------------------------------------------

    /// Lookup order: With-prefix qualified, locals, globals, the builtin
    /// registry, doc vars, the embedder's cell lookup, then a legacy
    /// trailing-`$` retry. Every miss is soft; callers substitute the
    /// unresolved sentinel.
    pub fn get(&self, name: &str) -> Option<Value> {
        let key = name.to_ascii_lowercase();
        if !self.with_prefix.is_empty() && !key.starts_with('.') {
            let qualified = format!("{}.{}", self.with_prefix.to_ascii_lowercase(), key);
            if let Some(v) = self.get_exact(&qualified) {
                return Some(v);
            }
        }
        let key = key.strip_prefix('.').map(|s| s.to_string()).unwrap_or(key);
        if let Some(v) = self.get_exact(&key) {
            return Some(v);
        }
        if let Some(name) = library::lookup(&key) {
            return Some(Value::Builtin(name));
        }
        if let Some(v) = self.shared.borrow().doc_vars.get(&key) {
            return Some(v.clone());
        }
        let cell_lookup = self.shared.borrow().cell_lookup.clone();
        if let Some(lookup) = cell_lookup {
            if let Some(v) = lookup(&key) {
                return Some(v);
            }
        }
        if !key.ends_with('$') {
            let retry = format!("{key}$");
            if let Some(v) = self.get_exact(&retry) {
                return Some(v);
            }
        }
        None
    }

    fn get_exact(&self, key: &str) -> Option<Value> {
        if let Some(v) = self.locals.get(key) {
            return Some(v.clone());
        }
        self.shared.borrow().globals.get(key).cloned()
    }

    pub fn get_local(&self, name: &str) -> Option<Value> {
        self.locals.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn contains_user_var(&self, name: &str) -> bool {
        let key = name.to_ascii_lowercase();
        self.locals.contains_key(&key) || self.shared.borrow().globals.contains_key(&key)
    }

    /// Writes a variable. Globals win when the name already lives there (and
    /// is not a procedure) or module-level scope is active; otherwise the
    /// write is local. Mirrored under the active With-prefix, and dotted
    /// names grow a `.text` sibling so faked COM objects read back.
    pub fn set(&mut self, name: &str, value: Value) {
        self.set_with(name, value, false, false);
    }

    pub fn set_local(&mut self, name: &str, value: Value) {
        self.set_with(name, value, true, false);
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.set_with(name, value, false, true);
    }

    pub fn set_with(&mut self, name: &str, value: Value, force_local: bool, force_global: bool) {
        let key = name.to_ascii_lowercase();
        let key = key.strip_prefix('.').map(|s| s.to_string()).unwrap_or(key);

        if !self.with_prefix.is_empty() && !key.contains('.') {
            let qualified = format!("{}.{}", self.with_prefix.to_ascii_lowercase(), key);
            self.store(&qualified, value.clone(), force_local, force_global);
        }
        if key.contains('.') && !key.ends_with(".text") {
            self.store(&format!("{key}.text"), value.clone(), force_local, force_global);
        }
        // LoadXML-style payload smuggling: writes to `.nodetypedvalue` keys
        // get a decoded `.text` sibling. The node's declared dataType picks
        // the codec; base64 is the default.
        if let Some(base) = key.strip_suffix(".nodetypedvalue") {
            if let Value::Str(s) = &value {
                let datatype = self
                    .get(&format!("{base}.datatype"))
                    .map(|v| coerce::coerce_to_str(&v));
                let decoded = match datatype.as_deref().map(str::trim) {
                    Some(t) if t.eq_ignore_ascii_case("bin.hex") => try_hex_decode(s),
                    _ => try_base64_decode(s),
                };
                if let Some(decoded) = decoded {
                    self.store(
                        &format!("{base}.text"),
                        Value::Str(decoded),
                        force_local,
                        force_global,
                    );
                }
            }
        }
        self.store(&key, value, force_local, force_global);
    }

    fn store(&mut self, key: &str, value: Value, force_local: bool, force_global: bool) {
        if force_local {
            self.locals.insert(key.to_string(), value);
            return;
        }
        let mut shared = self.shared.borrow_mut();
        if force_global {
            shared.globals.insert(key.to_string(), value);
            return;
        }
        let global_exists = matches!(
            shared.globals.get(key),
            Some(v) if !v.is_callable()
        );
        if global_exists || (self.global_scope && !self.locals.contains_key(key)) {
            shared.globals.insert(key.to_string(), value);
        } else {
            drop(shared);
            self.locals.insert(key.to_string(), value);
        }
    }

    pub fn set_var_type(&mut self, name: &str, var_type: &str) {
        self.var_types
            .insert(name.to_ascii_lowercase(), var_type.to_string());
    }

    pub fn var_type(&self, name: &str) -> Option<String> {
        self.var_types.get(&name.to_ascii_lowercase()).cloned()
    }

    /// True name of an imported DLL function when `name` is a local alias.
    pub fn dll_true_name(&self, name: &str) -> Option<String> {
        self.shared
            .borrow()
            .dll_aliases
            .get(&name.to_ascii_lowercase())
            .cloned()
    }

    pub fn is_log_func(&self, name: &str) -> bool {
        self.shared
            .borrow()
            .log_funcs
            .contains(&name.to_ascii_lowercase())
    }

    // --- error model --------------------------------------------------------

    /// Emulated VBA errors set a flag instead of unwinding; the block runner
    /// decides after each statement whether a registered handler fires.
    pub fn report_error(&mut self, msg: &str) {
        warn!("VBA error: {msg}");
        self.got_error = true;
    }

    pub fn report_general_error(&mut self, msg: &str) {
        warn!("{msg}");
        self.shared.borrow_mut().general_errors += 1;
    }

    pub fn clear_error(&mut self) {
        self.got_error = false;
    }

    pub fn must_handle_error(&self) -> bool {
        self.got_error && self.error_handler.is_some()
    }

    /// Takes the handler block to run, clearing the pending flag. The caller
    /// executes the returned block; a handler fires at most once per error.
    pub fn take_error_handler(&mut self) -> Option<Rc<Vec<Stmt>>> {
        if !self.must_handle_error() {
            return None;
        }
        self.got_error = false;
        self.error_handler.clone()
    }

    pub fn tested_wildcard(&mut self) {
        self.shared.borrow_mut().tested_wildcard = true;
    }

    // --- loop bookkeeping ---------------------------------------------------

    pub fn enter_loop(&mut self) {
        self.loop_stack.push(false);
    }

    pub fn exit_loop(&mut self) {
        if let Some(flag) = self.loop_stack.last_mut() {
            *flag = true;
        }
    }

    /// Marks every live loop as exited (GOTO out of all nesting).
    pub fn exit_all_loops(&mut self) {
        for flag in self.loop_stack.iter_mut() {
            *flag = true;
        }
    }

    pub fn loop_exit_requested(&self) -> bool {
        self.loop_stack.last().copied().unwrap_or(false)
    }

    pub fn leave_loop(&mut self) {
        self.loop_stack.pop();
    }

    // --- actions ------------------------------------------------------------

    /// Records an externally observable effect. NUL bytes are stripped, and
    /// params drowning in unresolved-sentinel noise are de-noised.
    pub fn report_action(&mut self, action: &str, params: &str, description: &str) {
        let mut params: String = params.chars().filter(|c| *c != '\0').collect();
        if params.matches(coerce::SENTINEL_TEXT).count() > 20 {
            params = params.replace(coerce::SENTINEL_TEXT, "");
        }
        debug!("ACTION: {action} - params {params:?} - {description}");
        self.shared.borrow_mut().actions.push(Action {
            action: action.to_string(),
            params,
            description: description.to_string(),
        });
    }

    pub fn report_action_value(&mut self, action: &str, params: &Value, description: &str) {
        self.report_action(action, &coerce::display(params), description);
    }

    // --- emulated file system -----------------------------------------------

    pub fn normalize_filename(name: &str) -> String {
        name.trim().replace(".\\", "").replace('\\', "/")
    }

    pub fn open_file(&mut self, name: &str, file_id: &str) {
        let name = Self::normalize_filename(name);
        debug!("open file {name} (id {file_id:?})");
        let mut shared = self.shared.borrow_mut();
        shared.open_files.entry(name.clone()).or_default();
        if !file_id.is_empty() {
            shared.file_ids.insert(file_id.to_string(), name);
        }
    }

    pub fn num_open_files(&self) -> usize {
        self.shared.borrow().open_files.len()
    }

    /// Maps a `#1` id or a raw filename to the open file's key.
    fn resolve_file(&self, id_or_name: &str) -> Option<String> {
        let shared = self.shared.borrow();
        if let Some(name) = shared.file_ids.get(id_or_name) {
            return Some(name.clone());
        }
        let name = Self::normalize_filename(id_or_name);
        if shared.open_files.contains_key(&name) {
            return Some(name);
        }
        // A lone open file catches writes through unresolved ids.
        if shared.open_files.len() == 1 {
            return shared.open_files.keys().next().cloned();
        }
        None
    }

    pub fn write_file(&mut self, id_or_name: &str, data: &[u8]) -> bool {
        match self.resolve_file(id_or_name) {
            Some(name) => {
                let mut shared = self.shared.borrow_mut();
                if let Some(content) = shared.open_files.get_mut(&name) {
                    content.extend_from_slice(data);
                }
                true
            }
            None => {
                self.report_general_error(&format!(
                    "file {id_or_name} not open, cannot write"
                ));
                false
            }
        }
    }

    /// Moves accumulated content to the closed map, where the driver picks
    /// up dropped payloads.
    pub fn close_file(&mut self, id_or_name: &str) {
        match self.resolve_file(id_or_name) {
            Some(name) => {
                let mut shared = self.shared.borrow_mut();
                if let Some(content) = shared.open_files.remove(&name) {
                    shared
                        .closed_files
                        .entry(name.clone())
                        .or_default()
                        .extend_from_slice(&content);
                }
                shared.file_ids.retain(|_, v| *v != name);
            }
            None => {
                self.report_general_error(&format!("file {id_or_name} not open, cannot close"));
            }
        }
    }

    // --- loop no-change fingerprint ------------------------------------------

    /// A cheap structural fingerprint over call depth, globals, and locals,
    /// skipping the given names plus volatile ones whose churn would defeat
    /// no-op detection.
    pub fn state_fingerprint(&self, skip: &[String]) -> u64 {
        const VOLATILE: &[&str] = &["now", "application.username"];
        let mut hasher = DefaultHasher::new();
        let shared = self.shared.borrow();
        shared.call_stack.len().hash(&mut hasher);

        let mut keys: Vec<&String> = shared
            .globals
            .keys()
            .chain(self.locals.keys())
            .filter(|k| !VOLATILE.contains(&k.as_str()) && !skip.contains(k))
            .collect();
        keys.sort();
        keys.dedup();
        for key in keys {
            key.hash(&mut hasher);
            let value = self
                .locals
                .get(key)
                .or_else(|| shared.globals.get(key));
            if let Some(v) = value {
                v.hash_into(&mut hasher);
            }
        }
        hasher.finish()
    }
}

fn try_base64_decode(s: &str) -> Option<String> {
    let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.len() < 4 {
        return None;
    }
    let bytes = BASE64.decode(cleaned.as_bytes()).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

fn try_hex_decode(s: &str) -> Option<String> {
    let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() || cleaned.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(cleaned.len() / 2);
    for pair in cleaned.as_bytes().chunks(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        bytes.push((hi * 16 + lo) as u8);
    }
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globals_shared_across_children() {
        let mut root = Context::root(Limits::default());
        root.set_global("g", Value::Int(1));
        let mut child = root.child();
        child.set("g", Value::Int(2));
        assert_eq!(root.get("G"), Some(Value::Int(2)));
        // Locals are never shared.
        child.set_local("l", Value::Int(3));
        assert_eq!(root.get("l"), None);
    }

    #[test]
    fn with_prefix_mirror_on_set() {
        let mut ctx = Context::root(Limits::default());
        ctx.with_prefix = "obj".to_string();
        ctx.set("field", Value::str("x"));
        assert_eq!(ctx.get("obj.field"), Some(Value::str("x")));
    }

    #[test]
    fn dotted_write_grows_text_sibling() {
        let mut ctx = Context::root(Limits::default());
        ctx.set("a.b", Value::str("payload"));
        assert_eq!(ctx.get("a.b.text"), Some(Value::str("payload")));
    }

    #[test]
    fn nodetypedvalue_hex_hook() {
        let mut ctx = Context::root(Limits::default());
        ctx.set("x.datatype", Value::str("bin.hex"));
        ctx.set("x.nodetypedvalue", Value::str("68656c6c6f"));
        assert_eq!(ctx.get("x.text"), Some(Value::str("hello")));
    }

    #[test]
    fn nodetypedvalue_base64_hook() {
        let mut ctx = Context::root(Limits::default());
        ctx.set("x.nodetypedvalue", Value::str("aGVsbG8="));
        assert_eq!(ctx.get("x.text"), Some(Value::str("hello")));
    }

    #[test]
    fn file_lifecycle() {
        let mut ctx = Context::root(Limits::default());
        ctx.open_file("c:\\tmp\\payload.exe", "#1");
        assert!(ctx.write_file("#1", b"MZ"));
        ctx.close_file("#1");
        let shared = ctx.shared().borrow();
        assert!(shared.open_files.is_empty());
        assert_eq!(
            shared.closed_files.get("c:/tmp/payload.exe").map(|v| v.as_slice()),
            Some(b"MZ".as_slice())
        );
    }

    #[test]
    fn action_nul_stripping() {
        let mut ctx = Context::root(Limits::default());
        ctx.report_action("Run", "cmd\0.exe", "Shell");
        assert_eq!(ctx.shared().borrow().actions[0].params, "cmd.exe");
    }

    #[test]
    fn trailing_dollar_retry() {
        let mut ctx = Context::root(Limits::default());
        ctx.set("name$", Value::str("v"));
        assert_eq!(ctx.get("name"), Some(Value::str("v")));
    }
}
