//! `macrolens-vba-runtime` parses VBA macro source and emulates it with a
//! tree-walking interpreter built for malware analysis.
//!
//! This crate is **not** a faithful VBA implementation; it is a deliberately
//! forgiving one. Malicious macros are obfuscated, rely on undefined
//! behavior, and reference Office objects that do not exist outside Word or
//! Excel. The emulator keeps going where a real interpreter would stop:
//! unresolvable names become an in-band sentinel, runtime errors set a flag
//! instead of unwinding, and intractable loops are collapsed or clamped.
//! What matters is the trace of externally observable behavior (commands
//! run, files dropped, URLs fetched), not numerical fidelity.
//!
//! The runtime exposes:
//! - A parser that turns macro source into an AST (`parse_module`).
//! - An emulation engine (`Engine`) that runs auto-exec entry points and
//!   collects an [`EmulationReport`].
//! - The runtime state (`Context`) for embedders that drive evaluation
//!   directly.

mod ast;
mod coerce;
mod context;
mod engine;
mod error;
mod expr;
mod lexer;
mod library;
mod operators;
mod parser;
mod procs;
mod stmt;
mod value;

pub use crate::ast::{
    Arg, BinOp, CaseArm, CaseCond, ConstDecl, Expr, ExternalProc, LoopGuardPos, MemberPart,
    Module, OnErrorPolicy, Param, PassMode, ProcKind, Procedure, Stmt, Target, UnOp, VarDecl,
};
pub use crate::coerce::{coerce_to_int, coerce_to_str, display};
pub use crate::context::{Action, CellLookup, Context, Limits, Shared};
pub use crate::engine::{Engine, EmulationReport};
pub use crate::error::EmuError;
pub use crate::expr::{eval_expr, eval_snippet};
pub use crate::procs::{invoke, CallOutcome};
pub use crate::stmt::{exec_block, exec_stmt};
pub use crate::value::{ListRef, MapObject, MapRef, Value};

/// Parse one VBA module into a [`Module`].
pub fn parse_module(source: &str) -> Result<Module, EmuError> {
    parser::parse_module(source)
}

/// Parse a single VBA expression.
pub fn parse_expression(source: &str) -> Result<Expr, EmuError> {
    parser::parse_expression(source)
}
