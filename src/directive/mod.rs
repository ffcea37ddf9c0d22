//! The directive tree handed over by the front end.
//!
//! Pragmas have already been parsed and every construct carries its
//! capture list, associated body and clause values. The tree is plain
//! data (serde) so it can be produced by any front end and stored as JSON.

pub mod builder;
mod index;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::span::Span;

pub use builder::UnitBuilder;
pub use index::UnitIndex;

// ─── Identifiers ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VarId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirectiveId(pub u32);

impl fmt::Display for DirectiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ─── Types & Storage ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ty {
    I8,
    #[default]
    I32,
    I64,
    Ptr,
    Array { elem: Box<Ty>, len: u32 },
    Vla { elem: Box<Ty> },
}

impl Ty {
    /// Size in bytes; `None` for variable-length arrays.
    pub fn size(&self) -> Option<u32> {
        match self {
            Ty::I8 => Some(1),
            Ty::I32 => Some(4),
            Ty::I64 | Ty::Ptr => Some(8),
            Ty::Array { elem, len } => elem.size().map(|s| s * len),
            Ty::Vla { .. } => None,
        }
    }

    pub fn align(&self) -> Option<u32> {
        match self {
            Ty::I8 => Some(1),
            Ty::I32 => Some(4),
            Ty::I64 | Ty::Ptr => Some(8),
            Ty::Array { elem, .. } => elem.align(),
            Ty::Vla { .. } => None,
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Ty::I8 | Ty::I32 | Ty::I64 | Ty::Ptr)
    }

    pub fn is_vla(&self) -> bool {
        match self {
            Ty::Vla { .. } => true,
            Ty::Array { elem, .. } => elem.is_vla(),
            _ => false,
        }
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::I8 => write!(f, "char"),
            Ty::I32 => write!(f, "int"),
            Ty::I64 => write!(f, "long"),
            Ty::Ptr => write!(f, "void*"),
            Ty::Array { elem, len } => write!(f, "{}[{}]", elem, len),
            Ty::Vla { elem } => write!(f, "{}[*]", elem),
        }
    }
}

/// How the front end realized a variable's storage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Storage {
    /// The variable owns a local slot.
    #[default]
    Local,
    /// The variable is a reference: its value is the address of storage
    /// that lives elsewhere.
    Reference,
    /// The variable is a typed view over local storage of another type.
    View { underlying: Ty },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarDecl {
    pub id: VarId,
    pub name: String,
    #[serde(default)]
    pub ty: Ty,
    #[serde(default)]
    pub storage: Storage,
}

// ─── Statements & Expressions ─────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Gt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Int(i64),
    Var(VarId),
    AddrOf(VarId),
    Load {
        addr: Box<Expr>,
        #[serde(default)]
        ty: Ty,
    },
    This,
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Hardware thread id within the block.
    ThreadId,
    /// Logical lane id inside a simd region (0 outside one).
    SimdLane,
    /// Logical lane count inside a simd region (1 outside one).
    SimdLanes,
}

impl Expr {
    pub fn var(v: VarId) -> Self {
        Expr::Var(v)
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn load(addr: Expr, ty: Ty) -> Self {
        Expr::Load {
            addr: Box::new(addr),
            ty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stmt {
    Block(Vec<Stmt>),
    Assign {
        var: VarId,
        value: Expr,
    },
    /// `*addr = value`
    Store {
        addr: Expr,
        value: Expr,
        #[serde(default)]
        ty: Ty,
    },
    Call {
        callee: String,
        #[serde(default)]
        args: Vec<Expr>,
    },
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        #[serde(default)]
        else_branch: Option<Box<Stmt>>,
    },
    Directive(Box<Directive>),
}

impl Stmt {
    pub fn block(stmts: Vec<Stmt>) -> Self {
        Stmt::Block(stmts)
    }

    pub fn empty() -> Self {
        Stmt::Block(Vec::new())
    }

    pub fn assign(var: VarId, value: Expr) -> Self {
        Stmt::Assign { var, value }
    }

    pub fn call(callee: impl Into<String>, args: Vec<Expr>) -> Self {
        Stmt::Call {
            callee: callee.into(),
            args,
        }
    }

    /// `observe(tag, value)`: the test hook the simulator records.
    pub fn observe(tag: i64, value: Expr) -> Self {
        Stmt::call("observe", vec![Expr::Int(tag), value])
    }

    pub fn directive(d: Directive) -> Self {
        Stmt::Directive(Box::new(d))
    }

    /// Visit the directives reachable from this statement without entering
    /// any directive's body.
    pub fn for_each_directive<'a>(&'a self, visit: &mut dyn FnMut(&'a Directive)) {
        match self {
            Stmt::Block(stmts) => {
                for s in stmts {
                    s.for_each_directive(visit);
                }
            }
            Stmt::If {
                then_branch,
                else_branch,
                ..
            } => {
                then_branch.for_each_directive(visit);
                if let Some(e) = else_branch {
                    e.for_each_directive(visit);
                }
            }
            Stmt::Directive(d) => visit(d),
            Stmt::Assign { .. } | Stmt::Store { .. } | Stmt::Call { .. } => {}
        }
    }

    /// Every callee named in this statement, including inside nested
    /// directive bodies.
    pub fn callees(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_callees(&mut out);
        out
    }

    fn collect_callees<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Stmt::Block(stmts) => {
                for s in stmts {
                    s.collect_callees(out);
                }
            }
            Stmt::Call { callee, .. } => out.push(callee),
            Stmt::If {
                then_branch,
                else_branch,
                ..
            } => {
                then_branch.collect_callees(out);
                if let Some(e) = else_branch {
                    e.collect_callees(out);
                }
            }
            Stmt::Directive(d) => d.body.collect_callees(out),
            Stmt::Assign { .. } | Stmt::Store { .. } => {}
        }
    }
}

// ─── Directives ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveKind {
    Target,
    Teams,
    TargetTeams,
    Parallel,
    ParallelFor,
    ParallelSections,
    DistributeParallelFor,
    Simd,
    ParallelForSimd,
    For,
    Sections,
    Single,
    Master,
    Distribute,
}

impl DirectiveKind {
    pub fn is_target(self) -> bool {
        matches!(self, DirectiveKind::Target | DirectiveKind::TargetTeams)
    }

    pub fn is_teams(self) -> bool {
        matches!(self, DirectiveKind::Teams | DirectiveKind::TargetTeams)
    }

    /// Opens a parallel region (outlined and dispatched to workers).
    pub fn opens_parallel(self) -> bool {
        matches!(
            self,
            DirectiveKind::Parallel
                | DirectiveKind::ParallelFor
                | DirectiveKind::ParallelSections
                | DirectiveKind::DistributeParallelFor
                | DirectiveKind::ParallelForSimd
        )
    }

    pub fn opens_simd(self) -> bool {
        matches!(self, DirectiveKind::Simd)
    }

    /// Parallel or simd: the constructs whose captures need sharing.
    pub fn opens_region(self) -> bool {
        self.opens_parallel() || self.opens_simd()
    }

    /// Loop-carrying constructs whose schedule clause matters.
    pub fn is_loop(self) -> bool {
        matches!(
            self,
            DirectiveKind::For
                | DirectiveKind::ParallelFor
                | DirectiveKind::DistributeParallelFor
                | DirectiveKind::ParallelForSimd
                | DirectiveKind::Distribute
        )
    }

    /// Outlined functions of this kind take the distribute bounds.
    pub fn takes_distribute_bounds(self) -> bool {
        self == DirectiveKind::DistributeParallelFor
    }

    pub fn name(self) -> &'static str {
        match self {
            DirectiveKind::Target => "target",
            DirectiveKind::Teams => "teams",
            DirectiveKind::TargetTeams => "target teams",
            DirectiveKind::Parallel => "parallel",
            DirectiveKind::ParallelFor => "parallel for",
            DirectiveKind::ParallelSections => "parallel sections",
            DirectiveKind::DistributeParallelFor => "distribute parallel for",
            DirectiveKind::Simd => "simd",
            DirectiveKind::ParallelForSimd => "parallel for simd",
            DirectiveKind::For => "for",
            DirectiveKind::Sections => "sections",
            DirectiveKind::Single => "single",
            DirectiveKind::Master => "master",
            DirectiveKind::Distribute => "distribute",
        }
    }
}

impl fmt::Display for DirectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureTarget {
    Var(VarId),
    This,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    ByRef,
    ByCopy,
    This,
    Vla,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capture {
    pub target: CaptureTarget,
    pub kind: CaptureKind,
}

impl Capture {
    pub fn by_ref(v: VarId) -> Self {
        Self {
            target: CaptureTarget::Var(v),
            kind: CaptureKind::ByRef,
        }
    }

    pub fn by_copy(v: VarId) -> Self {
        Self {
            target: CaptureTarget::Var(v),
            kind: CaptureKind::ByCopy,
        }
    }

    pub fn this() -> Self {
        Self {
            target: CaptureTarget::This,
            kind: CaptureKind::This,
        }
    }

    pub fn vla(v: VarId) -> Self {
        Self {
            target: CaptureTarget::Var(v),
            kind: CaptureKind::Vla,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    #[default]
    Unknown,
    Static,
    Dynamic,
    Guided,
    Auto,
    Runtime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub kind: ScheduleKind,
    #[serde(default)]
    pub chunk: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Clauses {
    #[serde(default)]
    pub if_cond: Option<Expr>,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub ordered: bool,
    #[serde(default)]
    pub nowait: bool,
    #[serde(default)]
    pub num_teams: Option<Expr>,
    #[serde(default)]
    pub thread_limit: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    pub id: DirectiveId,
    pub kind: DirectiveKind,
    #[serde(default)]
    pub captures: Vec<Capture>,
    /// Variables declared inside the construct's body.
    #[serde(default)]
    pub locals: Vec<VarId>,
    pub body: Stmt,
    #[serde(default)]
    pub clauses: Clauses,
    #[serde(default)]
    pub span: Span,
}

impl Directive {
    pub fn with_captures(mut self, captures: Vec<Capture>) -> Self {
        self.captures = captures;
        self
    }

    pub fn with_locals(mut self, locals: Vec<VarId>) -> Self {
        self.locals = locals;
        self
    }

    pub fn with_body(mut self, body: Stmt) -> Self {
        self.body = body;
        self
    }

    pub fn with_if(mut self, cond: Expr) -> Self {
        self.clauses.if_cond = Some(cond);
        self
    }

    pub fn with_schedule(mut self, kind: ScheduleKind, chunk: Option<i64>) -> Self {
        self.clauses.schedule = Some(Schedule { kind, chunk });
        self
    }

    pub fn with_ordered(mut self) -> Self {
        self.clauses.ordered = true;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}

// ─── Functions & Units ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    #[serde(default)]
    pub params: Vec<VarId>,
    #[serde(default)]
    pub locals: Vec<VarId>,
    /// Member function with an implicit object pointer.
    #[serde(default)]
    pub has_this: bool,
    /// Compiled for the device (declare target).
    #[serde(default)]
    pub device: bool,
    pub body: Stmt,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TranslationUnit {
    /// Source file the spans point into.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub vars: Vec<VarDecl>,
    #[serde(default)]
    pub functions: Vec<FunctionDecl>,
}

impl TranslationUnit {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
