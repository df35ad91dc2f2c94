//! Recursive-descent parser for the line-oriented VBA grammar.
//!
//! Ordering matters: call statements are tried before bare expressions, and
//! member chains are parsed iteratively (never by recursing through a
//! generic member rule) so nested accesses like `a.b.c.d(x)` stay linear.
//! Parse failures recover at line granularity; malicious input routinely
//! deviates from the grammar and the rest of the module must still load.

use std::collections::HashMap;
use std::rc::Rc;

use log::warn;

use crate::ast::{
    Arg, BinOp, CaseArm, CaseCond, ConstDecl, Expr, ExternalProc, LoopGuardPos, MemberPart,
    Module, OnErrorPolicy, Param, PassMode, ProcKind, Procedure, Stmt, Target, UnOp, VarDecl,
};
use crate::error::EmuError;
use crate::lexer::{join_continuations, Lexer, Token, TokenKind};

/// Parses one VBA module. Unrecoverable input yields `Err`; individual bad
/// lines are logged and skipped.
pub fn parse_module(source: &str) -> Result<Module, EmuError> {
    let joined = join_continuations(source);
    let tokens = Lexer::tokenize(&joined)?;
    let mut parser = Parser::new(tokens);
    Ok(parser.parse_module())
}

/// Parses a single expression, used by `Application.Run`-style indirection
/// and by embedders evaluating snippets.
pub fn parse_expression(source: &str) -> Result<Expr, EmuError> {
    let tokens = Lexer::tokenize(source.trim())?;
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expr()?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Set when an `If` block was force-closed by an enclosing terminator,
    /// i.e. the source had no `End If`.
    force_closed_if: bool,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            force_closed_if: false,
        }
    }

    // --- token helpers ------------------------------------------------------

    fn peek(&self) -> &TokenKind {
        self.tokens
            .get(self.pos)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        self.tokens
            .get(self.pos + offset)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn line(&self) -> usize {
        self.tokens.get(self.pos).map(|t| t.line).unwrap_or(0)
    }

    fn bump(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        kind
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), TokenKind::Eof)
    }

    fn at_line_end(&self) -> bool {
        matches!(self.peek(), TokenKind::Newline | TokenKind::Eof | TokenKind::Colon)
    }

    fn is_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), TokenKind::Keyword(k) if k == kw)
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.is_keyword(kw) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), EmuError> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(EmuError::Parse(format!(
                "expected `{kw}` on line {}, found {:?}",
                self.line(),
                self.peek()
            )))
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek() == kind {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<(), EmuError> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(EmuError::Parse(format!(
                "expected {kind:?} on line {}, found {:?}",
                self.line(),
                self.peek()
            )))
        }
    }

    /// Identifier, or any keyword usable as a plain name (member names and
    /// labels reuse reserved words freely in real macros).
    fn take_name(&mut self) -> Result<String, EmuError> {
        match self.bump() {
            TokenKind::Identifier(name) => Ok(name),
            TokenKind::Keyword(kw) => Ok(kw),
            other => Err(EmuError::Parse(format!(
                "expected a name on line {}, found {other:?}",
                self.line()
            ))),
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), TokenKind::Newline | TokenKind::Colon) {
            self.bump();
        }
    }

    fn sync_to_newline(&mut self) {
        while !matches!(self.peek(), TokenKind::Newline | TokenKind::Eof) {
            self.bump();
        }
    }

    fn skip_to_line_end(&mut self) {
        self.sync_to_newline();
    }

    // --- module level -------------------------------------------------------

    fn parse_module(&mut self) -> Module {
        let mut module = Module::default();
        loop {
            self.skip_newlines();
            if self.at_eof() {
                break;
            }
            let before = self.pos;
            if let Err(err) = self.parse_module_item(&mut module) {
                warn!("skipping unparsable line {}: {err}", self.line());
                if self.pos == before {
                    self.bump();
                }
                self.sync_to_newline();
            }
        }
        module
    }

    fn parse_module_item(&mut self, module: &mut Module) -> Result<(), EmuError> {
        // Header noise first.
        if self.is_keyword("attribute") || self.is_keyword("option") {
            self.skip_to_line_end();
            return Ok(());
        }
        if self.is_keyword("type") || self.is_keyword("enum") {
            self.skip_block_until_end_of(if self.is_keyword("type") { "type" } else { "enum" });
            return Ok(());
        }

        let mut visibility_seen = false;
        let save = self.pos;
        while self.is_keyword("public")
            || self.is_keyword("private")
            || self.is_keyword("static")
            || self.is_keyword("friend")
            || self.is_keyword("global")
        {
            visibility_seen = true;
            self.bump();
        }

        if self.is_keyword("declare") {
            let external = self.parse_declare()?;
            module.externals.push(external);
            return Ok(());
        }
        if self.is_keyword("sub") || self.is_keyword("function") || self.is_keyword("property") {
            let procedure = self.parse_procedure()?;
            module.procedures.push(Rc::new(procedure));
            return Ok(());
        }
        if self.is_keyword("type") || self.is_keyword("enum") {
            let kw = if self.is_keyword("type") { "type" } else { "enum" };
            self.skip_block_until_end_of(kw);
            return Ok(());
        }
        if self.is_keyword("const") {
            self.bump();
            module.constants.extend(self.parse_const_decls()?);
            return Ok(());
        }
        if visibility_seen || self.is_keyword("dim") {
            // `Public x As String` / `Dim y`
            self.eat_keyword("dim");
            match self.parse_var_decls() {
                Ok(decls) => {
                    module.variables.extend(decls);
                    return Ok(());
                }
                Err(_) => {
                    // `Public Foo` might have been something else entirely.
                    self.pos = save;
                }
            }
        }

        // Loose module-level code (VBScript style).
        let stmt = self.parse_statement()?;
        module.loose.push(stmt);
        Ok(())
    }

    fn skip_block_until_end_of(&mut self, kw: &str) {
        while !self.at_eof() {
            if self.is_keyword("end") && matches!(self.peek_at(1), TokenKind::Keyword(k) if k == kw)
            {
                self.bump();
                self.bump();
                self.skip_to_line_end();
                return;
            }
            self.bump();
        }
    }

    // --- declarations -------------------------------------------------------

    fn parse_declare(&mut self) -> Result<ExternalProc, EmuError> {
        self.expect_keyword("declare")?;
        self.eat_keyword("ptrsafe");
        let is_function = self.eat_keyword("function");
        if !is_function {
            self.expect_keyword("sub")?;
        }
        let name = self.take_name()?;
        self.expect_keyword("lib")?;
        let lib_raw = match self.bump() {
            TokenKind::Str(s) => s,
            other => {
                return Err(EmuError::Parse(format!(
                    "expected library name, found {other:?}"
                )))
            }
        };
        let mut lib = lib_raw.trim_matches('"').to_ascii_lowercase();
        if !lib.contains('.') {
            lib.push_str(".dll");
        }
        let alias = if self.eat_keyword("alias") {
            match self.bump() {
                TokenKind::Str(s) => Some(s),
                other => {
                    return Err(EmuError::Parse(format!(
                        "expected alias name, found {other:?}"
                    )))
                }
            }
        } else {
            None
        };
        let params = if self.eat(&TokenKind::LParen) {
            self.parse_params()?
        } else {
            Vec::new()
        };
        let return_type = self.parse_as_type()?;
        self.skip_to_line_end();
        Ok(ExternalProc {
            name,
            lib,
            alias,
            params,
            return_type,
        })
    }

    fn parse_as_type(&mut self) -> Result<Option<String>, EmuError> {
        if self.eat_keyword("as") {
            self.eat_keyword("new");
            let mut name = self.take_name()?;
            // Qualified types like `Scripting.Dictionary`.
            while self.eat(&TokenKind::Dot) {
                name.push('.');
                name.push_str(&self.take_name()?);
            }
            Ok(Some(name))
        } else {
            Ok(None)
        }
    }

    fn parse_params(&mut self) -> Result<Vec<Param>, EmuError> {
        let mut params = Vec::new();
        if self.eat(&TokenKind::RParen) {
            return Ok(params);
        }
        loop {
            self.eat_keyword("optional");
            let mode = if self.eat_keyword("byval") {
                PassMode::ByVal
            } else {
                self.eat_keyword("byref");
                PassMode::ByRef
            };
            self.eat_keyword("paramarray");
            let name = self.take_name()?;
            let is_array = if self.eat(&TokenKind::LParen) {
                self.expect(&TokenKind::RParen)?;
                true
            } else {
                false
            };
            let var_type = self.parse_as_type()?;
            let default = if self.eat(&TokenKind::Eq) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            params.push(Param {
                name,
                var_type,
                mode,
                default,
                is_array,
            });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen)?;
        Ok(params)
    }

    fn parse_procedure(&mut self) -> Result<Procedure, EmuError> {
        let kind = if self.eat_keyword("sub") {
            ProcKind::Sub
        } else if self.eat_keyword("function") {
            ProcKind::Function
        } else {
            self.expect_keyword("property")?;
            let get = match self.bump() {
                TokenKind::Identifier(w) if w.eq_ignore_ascii_case("get") => true,
                TokenKind::Keyword(w) if w == "let" || w == "set" => false,
                TokenKind::Identifier(w) if w.eq_ignore_ascii_case("let") => false,
                other => {
                    return Err(EmuError::Parse(format!(
                        "expected Get/Let/Set after Property, found {other:?}"
                    )))
                }
            };
            if get {
                ProcKind::PropertyGet
            } else {
                ProcKind::PropertyLet
            }
        };
        let name = self.take_name()?;
        let params = if self.eat(&TokenKind::LParen) {
            self.parse_params()?
        } else {
            Vec::new()
        };
        let return_type = self.parse_as_type()?;
        self.skip_to_line_end();

        let end_kw = match kind {
            ProcKind::Sub => "sub",
            ProcKind::Function => "function",
            ProcKind::PropertyGet | ProcKind::PropertyLet => "property",
        };
        self.force_closed_if = false;
        let mut body = self.parse_block(&[("end", end_kw)])?;
        let bogus_if = if self.force_closed_if {
            match body.pop() {
                Some(stmt @ Stmt::If { .. }) => Some(vec![stmt]),
                Some(other) => {
                    body.push(other);
                    None
                }
                None => None,
            }
        } else {
            None
        };
        self.force_closed_if = false;
        // Consume `End Sub` (missing terminators close at EOF).
        if self.eat_keyword("end") {
            self.eat_keyword(end_kw);
        }
        self.skip_to_line_end();

        let labels = Procedure::collect_labels(&body);
        Ok(Procedure {
            kind,
            name,
            params,
            return_type,
            body,
            labels,
            bogus_if,
        })
    }

    // --- statement blocks ---------------------------------------------------

    /// True when the cursor sits on one of the given `(first, second)`
    /// keyword pairs (`second` empty matches a single keyword).
    fn at_terminator(&self, terms: &[(&str, &str)]) -> bool {
        for (first, second) in terms {
            if let TokenKind::Keyword(k) = self.peek() {
                if k == first {
                    if second.is_empty() {
                        return true;
                    }
                    if matches!(self.peek_at(1), TokenKind::Keyword(k2) if k2 == second) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// The terminators that close a whole procedure; inner blocks must also
    /// stop there so a missing `End If`/`Next` cannot swallow the rest of
    /// the module.
    const HARD_STOPS: &'static [(&'static str, &'static str)] =
        &[("end", "sub"), ("end", "function"), ("end", "property")];

    fn parse_block(&mut self, terms: &[(&str, &str)]) -> Result<Vec<Stmt>, EmuError> {
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            if self.at_eof() || self.at_terminator(terms) {
                break;
            }
            if self.at_terminator(Self::HARD_STOPS) {
                break;
            }
            let before = self.pos;
            match self.parse_statement() {
                Ok(stmt) => stmts.push(stmt),
                Err(err) => {
                    warn!("skipping unparsable line {}: {err}", self.line());
                    if self.pos == before {
                        self.bump();
                    }
                    self.sync_to_newline();
                }
            }
        }
        Ok(stmts)
    }

    // --- statements ---------------------------------------------------------

    fn parse_statement(&mut self) -> Result<Stmt, EmuError> {
        // Label: `Name:` at the start of a line.
        if let TokenKind::Identifier(name) = self.peek() {
            if matches!(self.peek_at(1), TokenKind::Colon) {
                let name = name.clone();
                self.bump();
                self.bump();
                return Ok(Stmt::Label(name));
            }
        }
        if let TokenKind::Int(n) = self.peek() {
            // Numeric labels (`10: ...` / `10 x = 1`) from line-numbered code.
            if matches!(self.peek_at(1), TokenKind::Colon) {
                let n = *n;
                self.bump();
                self.bump();
                return Ok(Stmt::Label(n.to_string()));
            }
        }

        match self.peek().clone() {
            TokenKind::Keyword(kw) => match kw.as_str() {
                "dim" | "static" => {
                    self.bump();
                    Ok(Stmt::Dim(self.parse_var_decls()?))
                }
                "global" | "public" | "private" => {
                    self.bump();
                    self.eat_keyword("dim");
                    if self.eat_keyword("const") {
                        return Ok(Stmt::Const(self.parse_const_decls()?));
                    }
                    Ok(Stmt::Dim(self.parse_var_decls()?))
                }
                "const" => {
                    self.bump();
                    Ok(Stmt::Const(self.parse_const_decls()?))
                }
                "redim" => {
                    self.bump();
                    let preserve = self.eat_keyword("preserve");
                    let name = self.take_name()?;
                    let size = if self.eat(&TokenKind::LParen) {
                        let first = self.parse_expr()?;
                        let size = if self.eat_keyword("to") {
                            self.parse_expr()?
                        } else {
                            first
                        };
                        // Extra dimensions are parsed and ignored.
                        while self.eat(&TokenKind::Comma) {
                            self.parse_expr()?;
                            if self.eat_keyword("to") {
                                self.parse_expr()?;
                            }
                        }
                        self.expect(&TokenKind::RParen)?;
                        Some(size)
                    } else {
                        None
                    };
                    self.parse_as_type()?;
                    Ok(Stmt::ReDim {
                        name,
                        preserve,
                        size,
                    })
                }
                "set" | "let" | "lset" => {
                    self.bump();
                    let is_set = kw == "set";
                    let (target, _) = self.parse_target()?;
                    self.expect(&TokenKind::Eq)?;
                    let value = self.parse_expr()?;
                    Ok(Stmt::Assign {
                        target,
                        value,
                        is_set,
                    })
                }
                "call" => {
                    self.bump();
                    let expr = self.parse_postfix()?;
                    Ok(Stmt::Call(expr))
                }
                "if" => self.parse_if(),
                "select" => self.parse_select(),
                "for" => self.parse_for(),
                "do" => self.parse_do(),
                "while" => self.parse_while(),
                "with" => self.parse_with(),
                "exit" => {
                    self.bump();
                    if self.eat_keyword("for") {
                        Ok(Stmt::ExitFor)
                    } else if self.eat_keyword("do") || self.eat_keyword("while") {
                        Ok(Stmt::ExitDo)
                    } else if self.eat_keyword("function") || self.eat_keyword("property") {
                        Ok(Stmt::ExitFunction)
                    } else {
                        self.expect_keyword("sub")?;
                        Ok(Stmt::ExitSub)
                    }
                }
                "goto" | "gosub" => {
                    self.bump();
                    let label = match self.bump() {
                        TokenKind::Identifier(name) => name,
                        TokenKind::Int(n) => n.to_string(),
                        other => {
                            return Err(EmuError::Parse(format!(
                                "expected a label after Goto, found {other:?}"
                            )))
                        }
                    };
                    Ok(Stmt::Goto(label))
                }
                "on" => self.parse_on_error(),
                "resume" => {
                    self.bump();
                    // `Resume Next` / `Resume label`: the flag model treats
                    // them all as "carry on".
                    if !self.at_line_end() {
                        self.bump();
                    }
                    Ok(Stmt::Resume)
                }
                "open" => self.parse_file_open(),
                "close" => {
                    self.bump();
                    let mut ids = Vec::new();
                    while !self.at_line_end() {
                        ids.push(self.parse_expr()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    Ok(Stmt::FileClose(ids))
                }
                "print" => {
                    self.bump();
                    let file_id = self.parse_expr()?;
                    self.eat(&TokenKind::Comma);
                    let mut values = Vec::new();
                    while !self.at_line_end() {
                        values.push(self.parse_expr()?);
                        if !self.eat(&TokenKind::Semicolon) && !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    Ok(Stmt::FilePrint { file_id, values })
                }
                "doevents" => {
                    self.bump();
                    Ok(Stmt::DoEvents)
                }
                "stop" | "end" => {
                    // `End` alone halts the program; treated as exit-sub.
                    self.bump();
                    Ok(Stmt::ExitSub)
                }
                "new" => {
                    let expr = self.parse_expr()?;
                    Ok(Stmt::Expr(expr))
                }
                other => Err(EmuError::Parse(format!(
                    "unexpected keyword `{other}` on line {}",
                    self.line()
                ))),
            },
            TokenKind::Identifier(name) if name.eq_ignore_ascii_case("debug") => {
                if matches!(self.peek_at(1), TokenKind::Dot)
                    && matches!(self.peek_at(2), TokenKind::Keyword(k) if k == "print")
                {
                    self.bump();
                    self.bump();
                    self.bump();
                    let mut values = Vec::new();
                    while !self.at_line_end() {
                        values.push(self.parse_expr()?);
                        if !self.eat(&TokenKind::Semicolon) && !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    return Ok(Stmt::DebugPrint(values));
                }
                self.parse_assign_or_call()
            }
            TokenKind::Dot | TokenKind::Identifier(_) => self.parse_assign_or_call(),
            other => Err(EmuError::Parse(format!(
                "unexpected token {other:?} on line {}",
                self.line()
            ))),
        }
    }

    /// A line starting with a name: assignment when an `=` follows the
    /// l-value, otherwise a call statement (with or without parentheses).
    fn parse_assign_or_call(&mut self) -> Result<Stmt, EmuError> {
        let (target, expr) = self.parse_target()?;
        if self.eat(&TokenKind::Eq) {
            let value = self.parse_expr()?;
            return Ok(Stmt::Assign {
                target,
                value,
                is_set: false,
            });
        }
        // Paren-less call arguments: `Foo a, b`.
        if !self.at_line_end() {
            let mut args = vec![Arg::positional(self.parse_expr()?)];
            while self.eat(&TokenKind::Comma) {
                if self.at_line_end() {
                    args.push(Arg::positional(Expr::Nothing));
                    break;
                }
                args.push(Arg::positional(self.parse_expr()?));
            }
            let call = match expr {
                Expr::Name(name) => Expr::Call { name, args },
                Expr::Member {
                    leading_dot,
                    mut parts,
                } => {
                    if let Some(last) = parts.last_mut() {
                        last.args = Some(args);
                    }
                    Expr::Member { leading_dot, parts }
                }
                Expr::Call { name, args: inner } => {
                    // `Foo(1), 2` style; keep the original arguments first.
                    let mut all = inner;
                    all.extend(args);
                    Expr::Call { name, args: all }
                }
                other => other,
            };
            return Ok(Stmt::Call(call));
        }
        Ok(Stmt::Call(expr))
    }

    /// Parses an l-value and returns both the Target form and the same thing
    /// as an expression (for the call-statement fallback).
    fn parse_target(&mut self) -> Result<(Target, Expr), EmuError> {
        let expr = self.parse_postfix()?;
        let target = match &expr {
            Expr::Name(name) => Target::Name(name.clone()),
            Expr::Call { name, args } => Target::Index {
                name: name.clone(),
                indices: args.iter().map(|a| a.expr.clone()).collect(),
            },
            Expr::Member { leading_dot, parts } => Target::Member {
                leading_dot: *leading_dot,
                parts: parts.clone(),
            },
            _ => Target::Name(String::new()),
        };
        Ok((target, expr))
    }

    fn parse_var_decls(&mut self) -> Result<Vec<VarDecl>, EmuError> {
        let mut decls = Vec::new();
        loop {
            let name = self.take_name()?;
            let mut is_array = false;
            let mut array_size = None;
            if self.eat(&TokenKind::LParen) {
                is_array = true;
                if !self.eat(&TokenKind::RParen) {
                    let first = self.parse_expr()?;
                    let size = if self.eat_keyword("to") {
                        self.parse_expr()?
                    } else {
                        first
                    };
                    while self.eat(&TokenKind::Comma) {
                        self.parse_expr()?;
                        if self.eat_keyword("to") {
                            self.parse_expr()?;
                        }
                    }
                    self.expect(&TokenKind::RParen)?;
                    array_size = Some(size);
                }
            }
            let var_type = self.parse_as_type()?;
            let init = if self.eat(&TokenKind::Eq) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            decls.push(VarDecl {
                name,
                var_type,
                is_array,
                array_size,
                init,
            });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(decls)
    }

    fn parse_const_decls(&mut self) -> Result<Vec<ConstDecl>, EmuError> {
        let mut decls = Vec::new();
        loop {
            let name = self.take_name()?;
            let var_type = self.parse_as_type()?;
            self.expect(&TokenKind::Eq)?;
            let value = self.parse_expr()?;
            decls.push(ConstDecl {
                name,
                var_type,
                value,
            });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(decls)
    }

    fn parse_if(&mut self) -> Result<Stmt, EmuError> {
        self.expect_keyword("if")?;
        let cond = self.parse_expr()?;
        self.expect_keyword("then")?;

        // Single-line form: `If c Then stmt [Else stmt]`.
        if !matches!(self.peek(), TokenKind::Newline | TokenKind::Eof) {
            let mut then_body = vec![self.parse_statement()?];
            while self.eat(&TokenKind::Colon) {
                if self.at_line_end() || self.is_keyword("else") || self.is_keyword("end") {
                    break;
                }
                then_body.push(self.parse_statement()?);
            }
            let mut else_body = Vec::new();
            if self.eat_keyword("else") {
                else_body.push(self.parse_statement()?);
                while self.eat(&TokenKind::Colon) {
                    if self.at_line_end() || self.is_keyword("end") {
                        break;
                    }
                    else_body.push(self.parse_statement()?);
                }
            }
            // A single-line `If ... Then ... End If` is legal too.
            if self.eat_keyword("end") {
                self.eat_keyword("if");
            }
            return Ok(Stmt::If {
                arms: vec![(cond, then_body)],
                else_body,
            });
        }

        let mut arms = Vec::new();
        let mut else_body = Vec::new();
        let body = self.parse_block(&[("end", "if"), ("elseif", ""), ("else", "")])?;
        arms.push((cond, body));
        loop {
            if self.at_terminator(Self::HARD_STOPS) || self.at_eof() {
                self.force_closed_if = true;
                return Ok(Stmt::If { arms, else_body });
            }
            if self.eat_keyword("elseif") {
                let cond = self.parse_expr()?;
                self.expect_keyword("then")?;
                let body = self.parse_block(&[("end", "if"), ("elseif", ""), ("else", "")])?;
                arms.push((cond, body));
                continue;
            }
            if self.eat_keyword("else") {
                else_body = self.parse_block(&[("end", "if")])?;
            }
            break;
        }
        if self.at_terminator(Self::HARD_STOPS) || self.at_eof() {
            self.force_closed_if = true;
        } else if self.eat_keyword("end") {
            self.eat_keyword("if");
        }
        Ok(Stmt::If { arms, else_body })
    }

    fn parse_select(&mut self) -> Result<Stmt, EmuError> {
        self.expect_keyword("select")?;
        self.expect_keyword("case")?;
        let subject = self.parse_expr()?;
        self.skip_newlines();
        let mut arms = Vec::new();
        while self.is_keyword("case") {
            self.bump();
            let mut conds = Vec::new();
            if self.eat_keyword("else") {
                conds.push(CaseCond::Else);
            } else {
                loop {
                    if self.eat_keyword("is") {
                        let op = match self.bump() {
                            TokenKind::Lt => BinOp::Lt,
                            TokenKind::Gt => BinOp::Gt,
                            TokenKind::Le => BinOp::Le,
                            TokenKind::Ge => BinOp::Ge,
                            TokenKind::Ne => BinOp::Ne,
                            TokenKind::Eq => BinOp::Eq,
                            other => {
                                return Err(EmuError::Parse(format!(
                                    "expected comparison after Case Is, found {other:?}"
                                )))
                            }
                        };
                        conds.push(CaseCond::Is(op, self.parse_expr()?));
                    } else {
                        let lo = self.parse_expr()?;
                        if self.eat_keyword("to") {
                            conds.push(CaseCond::Range(lo, self.parse_expr()?));
                        } else {
                            conds.push(CaseCond::Value(lo));
                        }
                    }
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            let body = self.parse_block(&[("case", ""), ("end", "select")])?;
            arms.push(CaseArm { conds, body });
        }
        if self.eat_keyword("end") {
            self.eat_keyword("select");
        }
        Ok(Stmt::SelectCase { subject, arms })
    }

    fn parse_for(&mut self) -> Result<Stmt, EmuError> {
        self.expect_keyword("for")?;
        if self.eat_keyword("each") {
            let var = self.take_name()?;
            self.expect_keyword("in")?;
            let seq = self.parse_expr()?;
            let body = self.parse_block(&[("next", "")])?;
            self.eat_keyword("next");
            if !self.at_line_end() {
                self.skip_to_line_end();
            }
            return Ok(Stmt::ForEach { var, seq, body });
        }
        let var = self.take_name()?;
        self.expect(&TokenKind::Eq)?;
        let start = self.parse_expr()?;
        self.expect_keyword("to")?;
        let end = self.parse_expr()?;
        let step = if self.eat_keyword("step") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        let body = self.parse_block(&[("next", "")])?;
        self.eat_keyword("next");
        if !self.at_line_end() {
            self.skip_to_line_end();
        }
        Ok(Stmt::For {
            var,
            start,
            end,
            step,
            body,
        })
    }

    fn parse_do(&mut self) -> Result<Stmt, EmuError> {
        self.expect_keyword("do")?;
        let mut guard = None;
        let mut guard_pos = LoopGuardPos::None;
        let mut until = false;
        if self.eat_keyword("while") {
            guard = Some(self.parse_expr()?);
            guard_pos = LoopGuardPos::Pre;
        } else if self.eat_keyword("until") {
            guard = Some(self.parse_expr()?);
            guard_pos = LoopGuardPos::Pre;
            until = true;
        }
        let body = self.parse_block(&[("loop", "")])?;
        self.eat_keyword("loop");
        if self.eat_keyword("while") {
            guard = Some(self.parse_expr()?);
            guard_pos = LoopGuardPos::Post;
        } else if self.eat_keyword("until") {
            guard = Some(self.parse_expr()?);
            guard_pos = LoopGuardPos::Post;
            until = true;
        }
        Ok(Stmt::DoLoop {
            guard,
            guard_pos,
            until,
            body,
        })
    }

    fn parse_while(&mut self) -> Result<Stmt, EmuError> {
        self.expect_keyword("while")?;
        let guard = self.parse_expr()?;
        let body = self.parse_block(&[("wend", ""), ("loop", "")])?;
        self.bump();
        Ok(Stmt::DoLoop {
            guard: Some(guard),
            guard_pos: LoopGuardPos::Pre,
            until: false,
            body,
        })
    }

    fn parse_with(&mut self) -> Result<Stmt, EmuError> {
        self.expect_keyword("with")?;
        self.eat(&TokenKind::Dot);
        let object = self.parse_expr()?;
        let body = self.parse_block(&[("end", "with")])?;
        if self.eat_keyword("end") {
            self.eat_keyword("with");
        }
        Ok(Stmt::With { object, body })
    }

    fn parse_on_error(&mut self) -> Result<Stmt, EmuError> {
        self.expect_keyword("on")?;
        // `On Local Error` is a legacy spelling.
        if let TokenKind::Identifier(w) = self.peek() {
            if w.eq_ignore_ascii_case("local") {
                self.bump();
            }
        }
        if !self.eat_keyword("error") {
            // `On x GoTo ...` computed jumps are not emulated.
            self.skip_to_line_end();
            return Ok(Stmt::OnError(OnErrorPolicy::ResumeNext));
        }
        if self.eat_keyword("resume") {
            self.expect_keyword("next")?;
            return Ok(Stmt::OnError(OnErrorPolicy::ResumeNext));
        }
        self.expect_keyword("goto")?;
        match self.bump() {
            TokenKind::Int(0) => Ok(Stmt::OnError(OnErrorPolicy::GotoZero)),
            TokenKind::Int(n) => Ok(Stmt::OnError(OnErrorPolicy::GotoLabel(n.to_string()))),
            TokenKind::Identifier(label) => Ok(Stmt::OnError(OnErrorPolicy::GotoLabel(label))),
            other => Err(EmuError::Parse(format!(
                "expected label after On Error Goto, found {other:?}"
            ))),
        }
    }

    fn parse_file_open(&mut self) -> Result<Stmt, EmuError> {
        self.expect_keyword("open")?;
        let path = self.parse_expr()?;
        let mut mode = None;
        if self.eat_keyword("for") {
            let word = self.take_name()?;
            mode = Some(word);
        }
        // `Lock`/`Access Read Write` clauses are parsed and ignored.
        while !self.at_line_end() && !self.is_keyword("as") {
            self.bump();
        }
        let file_id = if self.eat_keyword("as") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        // `Len = n` record length clause.
        self.skip_to_line_end();
        Ok(Stmt::FileOpen {
            path,
            file_id,
            mode,
        })
    }

    // --- expressions ---------------------------------------------------------

    pub(crate) fn parse_expr(&mut self) -> Result<Expr, EmuError> {
        self.parse_eqv()
    }

    fn parse_eqv(&mut self) -> Result<Expr, EmuError> {
        let mut lhs = self.parse_xor()?;
        while self.eat_keyword("eqv") {
            let rhs = self.parse_xor()?;
            lhs = Expr::Bin {
                op: BinOp::Eqv,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_xor(&mut self) -> Result<Expr, EmuError> {
        let mut lhs = self.parse_or()?;
        while self.eat_keyword("xor") {
            let rhs = self.parse_or()?;
            lhs = Expr::Bin {
                op: BinOp::Xor,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_or(&mut self) -> Result<Expr, EmuError> {
        let mut lhs = self.parse_and()?;
        while self.eat_keyword("or") {
            let rhs = self.parse_and()?;
            lhs = Expr::Bin {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, EmuError> {
        let mut lhs = self.parse_not()?;
        while self.eat_keyword("and") {
            let rhs = self.parse_not()?;
            lhs = Expr::Bin {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, EmuError> {
        if self.eat_keyword("not") {
            let expr = self.parse_not()?;
            return Ok(Expr::Un {
                op: UnOp::Not,
                expr: Box::new(expr),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, EmuError> {
        let mut lhs = self.parse_concat()?;
        loop {
            let op = match self.peek() {
                TokenKind::Eq => BinOp::Eq,
                TokenKind::Ne => BinOp::Ne,
                TokenKind::Lt => BinOp::Lt,
                TokenKind::Gt => BinOp::Gt,
                TokenKind::Le => BinOp::Le,
                TokenKind::Ge => BinOp::Ge,
                TokenKind::Keyword(k) if k == "like" => BinOp::Like,
                TokenKind::Keyword(k) if k == "is" => BinOp::Is,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_concat()?;
            lhs = Expr::Bin {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_concat(&mut self) -> Result<Expr, EmuError> {
        let mut lhs = self.parse_addsub()?;
        while self.eat(&TokenKind::Amp) {
            let rhs = self.parse_addsub()?;
            lhs = Expr::Bin {
                op: BinOp::Concat,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_addsub(&mut self) -> Result<Expr, EmuError> {
        let mut lhs = self.parse_mod()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_mod()?;
            lhs = Expr::Bin {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_mod(&mut self) -> Result<Expr, EmuError> {
        let mut lhs = self.parse_intdiv()?;
        while self.eat_keyword("mod") {
            let rhs = self.parse_intdiv()?;
            lhs = Expr::Bin {
                op: BinOp::Mod,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_intdiv(&mut self) -> Result<Expr, EmuError> {
        let mut lhs = self.parse_muldiv()?;
        while self.eat(&TokenKind::Backslash) {
            let rhs = self.parse_muldiv()?;
            lhs = Expr::Bin {
                op: BinOp::IntDiv,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_muldiv(&mut self) -> Result<Expr, EmuError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = Expr::Bin {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, EmuError> {
        if self.eat(&TokenKind::Minus) {
            let expr = self.parse_unary()?;
            return Ok(Expr::Un {
                op: UnOp::Neg,
                expr: Box::new(expr),
            });
        }
        if self.eat(&TokenKind::Plus) {
            return self.parse_unary();
        }
        self.parse_pow()
    }

    fn parse_pow(&mut self) -> Result<Expr, EmuError> {
        let lhs = self.parse_postfix()?;
        if self.eat(&TokenKind::Caret) {
            let rhs = self.parse_unary()?;
            return Ok(Expr::Bin {
                op: BinOp::Pow,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }
        Ok(lhs)
    }

    /// Primary expression plus its member-access / call tail, parsed
    /// iteratively.
    fn parse_postfix(&mut self) -> Result<Expr, EmuError> {
        // Leading-dot member access inside a With block.
        if matches!(self.peek(), TokenKind::Dot | TokenKind::Bang) {
            self.bump();
            let mut parts = vec![self.parse_member_part()?];
            while matches!(self.peek(), TokenKind::Dot | TokenKind::Bang) {
                self.bump();
                parts.push(self.parse_member_part()?);
            }
            return Ok(Expr::Member {
                leading_dot: true,
                parts,
            });
        }

        let base = self.parse_primary()?;
        if !matches!(self.peek(), TokenKind::Dot | TokenKind::Bang) {
            return Ok(base);
        }
        let first = match base {
            Expr::Name(name) => MemberPart { name, args: None },
            Expr::Call { name, args } => MemberPart {
                name,
                args: Some(args),
            },
            other => return Ok(other),
        };
        let mut parts = vec![first];
        while matches!(self.peek(), TokenKind::Dot | TokenKind::Bang) {
            self.bump();
            parts.push(self.parse_member_part()?);
        }
        Ok(Expr::Member {
            leading_dot: false,
            parts,
        })
    }

    fn parse_member_part(&mut self) -> Result<MemberPart, EmuError> {
        let name = self.take_name()?;
        let args = if self.eat(&TokenKind::LParen) {
            Some(self.parse_args()?)
        } else {
            None
        };
        Ok(MemberPart { name, args })
    }

    fn parse_args(&mut self) -> Result<Vec<Arg>, EmuError> {
        let mut args = Vec::new();
        if self.eat(&TokenKind::RParen) {
            return Ok(args);
        }
        loop {
            // Omitted arguments (`f(a, , c)`).
            if matches!(self.peek(), TokenKind::Comma) {
                args.push(Arg::positional(Expr::Nothing));
            } else {
                let name = if let TokenKind::Identifier(n) = self.peek() {
                    if matches!(self.peek_at(1), TokenKind::ColonEq) {
                        let n = n.clone();
                        self.bump();
                        self.bump();
                        Some(n)
                    } else {
                        None
                    }
                } else {
                    None
                };
                let expr = self.parse_expr()?;
                args.push(Arg { name, expr });
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, EmuError> {
        match self.bump() {
            TokenKind::Int(v) => Ok(Expr::Int(v)),
            TokenKind::Float(v) => Ok(Expr::Float(v)),
            TokenKind::Str(s) => Ok(Expr::Str(s)),
            TokenKind::Date(s) => Ok(Expr::Date(s)),
            TokenKind::FileNum(s) => Ok(Expr::FileNum(s)),
            TokenKind::Keyword(kw) => match kw.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "nothing" | "null" | "empty" => Ok(Expr::Nothing),
                "new" => {
                    let mut name = self.take_name()?;
                    while self.eat(&TokenKind::Dot) {
                        name.push('.');
                        name.push_str(&self.take_name()?);
                    }
                    Ok(Expr::New(name))
                }
                "not" => {
                    let expr = self.parse_not()?;
                    Ok(Expr::Un {
                        op: UnOp::Not,
                        expr: Box::new(expr),
                    })
                }
                // Keywords that double as builtin names in expressions
                // (`Error`, `Input$`, ...) degrade to plain names.
                other => Ok(Expr::Name(other.to_string())),
            },
            TokenKind::Identifier(name) => {
                if self.eat(&TokenKind::LParen) {
                    let args = self.parse_args()?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Name(name))
                }
            }
            TokenKind::LParen => {
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::RParen)?;
                Ok(expr)
            }
            other => Err(EmuError::Parse(format!(
                "unexpected token {other:?} in expression on line {}",
                self.line()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sub_with_assignment() {
        let module = parse_module("Sub Test()\n  x = 1 + 2\nEnd Sub\n").unwrap();
        assert_eq!(module.procedures.len(), 1);
        let procedure = &module.procedures[0];
        assert_eq!(procedure.name, "Test");
        assert_eq!(procedure.body.len(), 1);
        assert!(matches!(procedure.body[0], Stmt::Assign { .. }));
    }

    #[test]
    fn call_statement_outranks_expression() {
        let module = parse_module("Sub T()\n  Foo \"a\", 2\nEnd Sub\n").unwrap();
        match &module.procedures[0].body[0] {
            Stmt::Call(Expr::Call { name, args }) => {
                assert_eq!(name, "Foo");
                assert_eq!(args.len(), 2);
            }
            other => panic!("expected a call statement, got {other:?}"),
        }
    }

    #[test]
    fn nested_member_chain_is_linear() {
        let expr = parse_expression("a.b.c.d(1).e").unwrap();
        match expr {
            Expr::Member { parts, leading_dot } => {
                assert!(!leading_dot);
                assert_eq!(parts.len(), 5);
                assert!(parts[3].args.is_some());
            }
            other => panic!("expected member chain, got {other:?}"),
        }
    }

    #[test]
    fn bad_line_is_recovered() {
        let module =
            parse_module("Sub T()\n  x = 1\n  ~~ garbage ~~\n  y = 2\nEnd Sub\n").unwrap();
        assert_eq!(module.procedures[0].body.len(), 2);
    }

    #[test]
    fn missing_end_if_closes_at_end_sub() {
        let module = parse_module("Sub T()\n  x = 1\n  If x = 1 Then\n    y = 2\nEnd Sub\n")
            .unwrap();
        let procedure = &module.procedures[0];
        assert_eq!(procedure.body.len(), 1);
        assert!(procedure.bogus_if.is_some());
    }

    #[test]
    fn labels_collected() {
        let module = parse_module(
            "Sub T()\n  On Error Goto Handler\n  x = 1\nHandler:\n  y = 2\nEnd Sub\n",
        )
        .unwrap();
        let procedure = &module.procedures[0];
        assert!(procedure.labels.contains_key("handler"));
    }

    #[test]
    fn declare_normalizes_lib_name() {
        let module = parse_module(
            "Private Declare Function CreateFileA Lib \"kernel32\" Alias \"CreateFileW\" (ByVal n As String) As Long\n",
        )
        .unwrap();
        assert_eq!(module.externals[0].lib, "kernel32.dll");
        assert_eq!(module.externals[0].alias.as_deref(), Some("CreateFileW"));
    }

    #[test]
    fn select_case_forms() {
        let src = "Sub T()\nSelect Case x\nCase 1, 2\n a = 1\nCase 3 To 5\n a = 2\nCase Is > 9\n a = 3\nCase Else\n a = 4\nEnd Select\nEnd Sub\n";
        let module = parse_module(src).unwrap();
        match &module.procedures[0].body[0] {
            Stmt::SelectCase { arms, .. } => {
                assert_eq!(arms.len(), 4);
                assert_eq!(arms[0].conds.len(), 2);
                assert!(matches!(arms[1].conds[0], CaseCond::Range(_, _)));
                assert!(matches!(arms[2].conds[0], CaseCond::Is(BinOp::Gt, _)));
                assert!(matches!(arms[3].conds[0], CaseCond::Else));
            }
            other => panic!("expected select case, got {other:?}"),
        }
    }

    #[test]
    fn single_line_if() {
        let module = parse_module("Sub T()\nIf x = 1 Then y = 2 Else y = 3\nEnd Sub\n").unwrap();
        match &module.procedures[0].body[0] {
            Stmt::If { arms, else_body } => {
                assert_eq!(arms.len(), 1);
                assert_eq!(else_body.len(), 1);
            }
            other => panic!("expected if, got {other:?}"),
        }
    }

    #[test]
    fn operator_precedence() {
        let expr = parse_expression("1 + 2 * 3").unwrap();
        match expr {
            Expr::Bin { op: BinOp::Add, rhs, .. } => {
                assert!(matches!(*rhs, Expr::Bin { op: BinOp::Mul, .. }));
            }
            other => panic!("expected add at the top, got {other:?}"),
        }
    }

    #[test]
    fn with_block_and_leading_dot() {
        let src = "Sub T()\nWith obj\n  .Field = 1\nEnd With\nEnd Sub\n";
        let module = parse_module(src).unwrap();
        match &module.procedures[0].body[0] {
            Stmt::With { body, .. } => match &body[0] {
                Stmt::Assign {
                    target: Target::Member { leading_dot, .. },
                    ..
                } => assert!(*leading_dot),
                other => panic!("expected member assign, got {other:?}"),
            },
            other => panic!("expected with, got {other:?}"),
        }
    }

    #[test]
    fn file_statements() {
        let src = "Sub T()\nOpen \"out.txt\" For Output As #1\nPrint #1, \"data\"\nClose #1\nEnd Sub\n";
        let module = parse_module(src).unwrap();
        let body = &module.procedures[0].body;
        assert!(matches!(body[0], Stmt::FileOpen { .. }));
        assert!(matches!(body[1], Stmt::FilePrint { .. }));
        assert!(matches!(body[2], Stmt::FileClose(_)));
    }
}
