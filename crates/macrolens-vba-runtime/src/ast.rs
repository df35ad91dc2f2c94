use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    IntDiv,
    Pow,
    Mod,
    Concat,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
    Xor,
    Eqv,
    Like,
    Is,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge | BinOp::Like | BinOp::Is
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
}

/// One positional or named argument in a call.
#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    pub name: Option<String>,
    pub expr: Expr,
}

impl Arg {
    pub fn positional(expr: Expr) -> Self {
        Self { name: None, expr }
    }
}

/// One link in a member-access chain: a name, optionally applied to arguments
/// (`.Item("k")`, `.Cells(1, 2)`).
#[derive(Debug, Clone, PartialEq)]
pub struct MemberPart {
    pub name: String,
    pub args: Option<Vec<Arg>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    /// Raw text of a `#...#` date literal; dates evaluate as strings.
    Date(String),
    /// `#1` style file number.
    FileNum(String),
    Nothing,
    Name(String),
    /// `f(a, b)` where `f` is a bare name. Also covers array accesses, which
    /// are syntactically indistinguishable from calls.
    Call { name: String, args: Vec<Arg> },
    /// `a.b.c(x).d` chains. `leading_dot` marks With-relative accesses.
    Member {
        leading_dot: bool,
        parts: Vec<MemberPart>,
    },
    Bin {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Un { op: UnOp, expr: Box<Expr> },
    New(String),
}

impl Expr {
    /// Renders the dotted source form of a member chain or name, used for
    /// whole-chain variable lookups.
    pub fn dotted_name(&self) -> Option<String> {
        match self {
            Expr::Name(n) => Some(n.clone()),
            Expr::Member { leading_dot, parts } => {
                let mut out = String::new();
                if *leading_dot {
                    out.push('.');
                }
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        out.push('.');
                    }
                    if part.args.is_some() {
                        return None;
                    }
                    out.push_str(&part.name);
                }
                Some(out)
            }
            _ => None,
        }
    }
}

/// Assignment target forms.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Name(String),
    /// `a(1) = x` indexed element assignment.
    Index { name: String, indices: Vec<Expr> },
    Member {
        leading_dot: bool,
        parts: Vec<MemberPart>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarDecl {
    pub name: String,
    pub var_type: Option<String>,
    pub is_array: bool,
    /// Declared fixed size for `Dim a(10)`.
    pub array_size: Option<Expr>,
    pub init: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstDecl {
    pub name: String,
    pub var_type: Option<String>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaseCond {
    Value(Expr),
    Range(Expr, Expr),
    Is(BinOp, Expr),
    Else,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseArm {
    pub conds: Vec<CaseCond>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopGuardPos {
    /// `Do While ... / Do Until ...` and `While ... Wend`.
    Pre,
    /// `Do ... Loop While / Loop Until`.
    Post,
    /// Bare `Do ... Loop`.
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OnErrorPolicy {
    GotoLabel(String),
    ResumeNext,
    GotoZero,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Dim(Vec<VarDecl>),
    Const(Vec<ConstDecl>),
    ReDim {
        name: String,
        preserve: bool,
        size: Option<Expr>,
    },
    Assign {
        target: Target,
        value: Expr,
        /// `Set x = ...` object assignment.
        is_set: bool,
    },
    /// Call statement: `Foo a, b` / `Call Foo(a, b)` / `obj.Method a`.
    Call(Expr),
    If {
        arms: Vec<(Expr, Vec<Stmt>)>,
        else_body: Vec<Stmt>,
    },
    SelectCase {
        subject: Expr,
        arms: Vec<CaseArm>,
    },
    For {
        var: String,
        start: Expr,
        end: Expr,
        step: Option<Expr>,
        body: Vec<Stmt>,
    },
    ForEach {
        var: String,
        seq: Expr,
        body: Vec<Stmt>,
    },
    DoLoop {
        guard: Option<Expr>,
        guard_pos: LoopGuardPos,
        /// True for `Until` guards (negated sense).
        until: bool,
        body: Vec<Stmt>,
    },
    ExitFor,
    ExitDo,
    ExitFunction,
    ExitSub,
    With { object: Expr, body: Vec<Stmt> },
    Goto(String),
    Label(String),
    OnError(OnErrorPolicy),
    Resume,
    FileOpen {
        path: Expr,
        file_id: Option<Expr>,
        mode: Option<String>,
    },
    FileClose(Vec<Expr>),
    FilePrint { file_id: Expr, values: Vec<Expr> },
    DebugPrint(Vec<Expr>),
    DoEvents,
    /// A bare expression evaluated for side effects.
    Expr(Expr),
}

impl Stmt {
    pub fn is_loop(&self) -> bool {
        matches!(
            self,
            Stmt::For { .. } | Stmt::ForEach { .. } | Stmt::DoLoop { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcKind {
    Sub,
    Function,
    PropertyLet,
    PropertyGet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassMode {
    ByRef,
    ByVal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub var_type: Option<String>,
    pub mode: PassMode,
    pub default: Option<Expr>,
    pub is_array: bool,
}

/// A Sub, Function or Property with its label map precomputed at parse time.
#[derive(Debug, Clone, PartialEq)]
pub struct Procedure {
    pub kind: ProcKind,
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: Option<String>,
    pub body: Vec<Stmt>,
    /// Label (lowercased) to the statement suffix starting at that label.
    pub labels: HashMap<String, Rc<Vec<Stmt>>>,
    /// A trailing `If` with no `End If`, evaluated after the body. Malware
    /// uses this malformation to hide code from weaker parsers.
    pub bogus_if: Option<Vec<Stmt>>,
}

impl Procedure {
    /// Builds the GOTO label map over the top-level statements of a body.
    pub fn collect_labels(body: &[Stmt]) -> HashMap<String, Rc<Vec<Stmt>>> {
        let mut labels = HashMap::new();
        for (i, stmt) in body.iter().enumerate() {
            if let Stmt::Label(name) = stmt {
                let suffix: Vec<Stmt> = body[i + 1..].to_vec();
                labels.insert(name.to_ascii_lowercase(), Rc::new(suffix));
            }
        }
        labels
    }
}

/// `Declare Function X Lib "kernel32" Alias "Y" (...)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalProc {
    pub name: String,
    /// Lowercased library name with `.dll` appended when it had no extension.
    pub lib: String,
    pub alias: Option<String>,
    pub params: Vec<Param>,
    pub return_type: Option<String>,
}

/// A parsed VBA module.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Module {
    pub procedures: Vec<Rc<Procedure>>,
    pub externals: Vec<ExternalProc>,
    /// Module-level Dim/Global declarations.
    pub variables: Vec<VarDecl>,
    pub constants: Vec<ConstDecl>,
    /// Statements outside any procedure (VBScript-style loose code).
    pub loose: Vec<Stmt>,
}
