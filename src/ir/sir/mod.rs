//! SIR: SIMT Intermediate Representation.
//!
//! Three-address form with virtual registers and structural control flow.
//! This is the emission substrate the OpenMP lowering writes into: every
//! op executes for the currently active lanes of a group, `If` splits the
//! active mask and reconverges after both arms, `Loop` runs until every
//! lane that entered it has executed `Break`.
//!
//! Memory is byte addressed. `Alloca` is lane private; globals carry an
//! address space and globals in the shared space are block scoped.

pub mod builder;

use std::fmt;

use crate::abi::RuntimeFn;

pub use builder::FnBuilder;

// ─── Virtual Register ─────────────────────────────────────────────

/// A virtual register, one value per lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reg(pub u32);

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

// ─── Operands ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Reg(Reg),
    Imm(i64),
    Null,
    /// Address of a module global.
    Global(String),
    /// Address of a function, as stored in work-function cells.
    Func(String),
}

impl From<Reg> for Value {
    fn from(r: Reg) -> Self {
        Value::Reg(r)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Imm(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Imm(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Imm(v as i64)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Reg(r) => write!(f, "{}", r),
            Value::Imm(v) => write!(f, "{}", v),
            Value::Null => write!(f, "null"),
            Value::Global(name) => write!(f, "@{}", name),
            Value::Func(name) => write!(f, "&{}", name),
        }
    }
}

/// Access width of a load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    I8,
    I32,
    I64,
    Ptr,
}

impl Width {
    pub fn bytes(self) -> u32 {
        match self {
            Width::I8 => 1,
            Width::I32 => 4,
            Width::I64 | Width::Ptr => 8,
        }
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Width::I8 => "i8",
            Width::I32 => "i32",
            Width::I64 => "i64",
            Width::Ptr => "ptr",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
            BinOp::Shl => "shl",
            BinOp::LShr => "lshr",
            BinOp::AShr => "ashr",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Ult,
    Slt,
    Sle,
    Sgt,
    Sge,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "eq",
            CmpOp::Ne => "ne",
            CmpOp::Ult => "ult",
            CmpOp::Slt => "slt",
            CmpOp::Sle => "sle",
            CmpOp::Sgt => "sgt",
            CmpOp::Sge => "sge",
        };
        f.write_str(s)
    }
}

/// Hardware special registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Special {
    /// Thread id within the block.
    ThreadId,
    /// Threads per block.
    BlockDim,
    WarpSize,
    /// Block id within the grid.
    BlockId,
}

impl fmt::Display for Special {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Special::ThreadId => "tid.x",
            Special::BlockDim => "ntid.x",
            Special::WarpSize => "warpsize",
            Special::BlockId => "ctaid.x",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callee {
    /// A function defined in the module.
    Direct(String),
    /// A device runtime entry point.
    Runtime(RuntimeFn),
    /// An external device function provided at link time.
    Extern(String),
}

impl fmt::Display for Callee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callee::Direct(name) | Callee::Extern(name) => write!(f, "@{}", name),
            Callee::Runtime(rt) => write!(f, "@{}", rt),
        }
    }
}

// ─── SIR Operations ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum SIROp {
    // ── Memory ──
    /// dst = address of fresh lane-private storage.
    Alloca {
        dst: Reg,
        size: u32,
        align: u32,
        name: String,
    },
    Load {
        dst: Reg,
        addr: Value,
        width: Width,
    },
    Store {
        value: Value,
        addr: Value,
        width: Width,
    },
    /// dst = base + offset [+ index * stride]
    FieldAddr {
        dst: Reg,
        base: Value,
        offset: u32,
        index: Option<(Value, u32)>,
    },

    // ── Arithmetic ──
    Binary {
        dst: Reg,
        op: BinOp,
        lhs: Value,
        rhs: Value,
    },
    /// dst = (lhs op rhs) ? 1 : 0
    Compare {
        dst: Reg,
        op: CmpOp,
        lhs: Value,
        rhs: Value,
    },
    PopCount {
        dst: Reg,
        src: Value,
    },
    Special {
        dst: Reg,
        reg: Special,
    },

    // ── Synchronization ──
    /// Block-wide barrier.
    Barrier,

    // ── Calls ──
    Call {
        dst: Option<Reg>,
        callee: Callee,
        args: Vec<Value>,
    },

    // ── Structure ──
    If {
        cond: Value,
        then_body: Vec<SIROp>,
        else_body: Vec<SIROp>,
    },
    /// Repeat `body` until every lane that entered has executed `Break`.
    Loop {
        label: String,
        body: Vec<SIROp>,
    },
    /// Leave the innermost enclosing `Loop`.
    Break,
    Return(Option<Value>),
    Comment(String),
}

// ─── Functions & Modules ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    /// Kernel entry, launched by the host.
    Kernel,
    /// Outlined region or device function.
    Internal,
    /// Generated protocol helper (share helpers, wrappers, workers).
    Helper,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub reg: Reg,
    pub name: String,
    pub width: Width,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub returns: Option<Width>,
    pub linkage: Linkage,
    pub noinline: bool,
    pub body: Vec<SIROp>,
    /// One past the highest register number used.
    pub reg_count: u32,
}

impl Function {
    /// Every callee this function names, in body order.
    pub fn callees(&self) -> Vec<&Callee> {
        let mut out = Vec::new();
        visit_ops(&self.body, &mut |op| {
            if let SIROp::Call { callee, .. } = op {
                out.push(callee);
            }
        });
        out
    }

    /// Functions whose address is taken (stored, compared or passed).
    pub fn address_taken(&self) -> Vec<&str> {
        let mut out = Vec::new();
        visit_ops(&self.body, &mut |op| {
            for v in op_values(op) {
                if let Value::Func(name) = v {
                    out.push(name.as_str());
                }
            }
        });
        out
    }

    pub fn count_ops(&self, pred: impl Fn(&SIROp) -> bool) -> usize {
        let mut n = 0;
        visit_ops(&self.body, &mut |op| {
            if pred(op) {
                n += 1;
            }
        });
        n
    }
}

/// Pre-order walk over every op, entering structured bodies.
pub fn visit_ops<'a>(ops: &'a [SIROp], f: &mut dyn FnMut(&'a SIROp)) {
    for op in ops {
        f(op);
        match op {
            SIROp::If {
                then_body,
                else_body,
                ..
            } => {
                visit_ops(then_body, f);
                visit_ops(else_body, f);
            }
            SIROp::Loop { body, .. } => visit_ops(body, f),
            _ => {}
        }
    }
}

/// Operand values read by a single op (not its nested bodies).
fn op_values(op: &SIROp) -> Vec<&Value> {
    match op {
        SIROp::Load { addr, .. } => vec![addr],
        SIROp::Store { value, addr, .. } => vec![value, addr],
        SIROp::FieldAddr { base, index, .. } => {
            let mut v = vec![base];
            if let Some((idx, _)) = index {
                v.push(idx);
            }
            v
        }
        SIROp::Binary { lhs, rhs, .. } | SIROp::Compare { lhs, rhs, .. } => vec![lhs, rhs],
        SIROp::PopCount { src, .. } => vec![src],
        SIROp::Call { args, .. } => args.iter().collect(),
        SIROp::If { cond, .. } => vec![cond],
        SIROp::Return(Some(v)) => vec![v],
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global {
    pub name: String,
    pub size: u64,
    pub align: u32,
    pub addr_space: u32,
}

/// Loader metadata attached to a symbol (`nvvm.annotations`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub symbol: String,
    pub key: String,
    pub value: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Module {
    pub name: String,
    pub globals: Vec<Global>,
    pub functions: Vec<Function>,
    pub annotations: Vec<Annotation>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|g| g.name == name)
    }

    pub fn add_function(&mut self, func: Function) {
        self.functions.push(func);
    }

    /// Declare a global once; later declarations of the same name are ignored.
    pub fn ensure_global(&mut self, global: Global) {
        if self.global(&global.name).is_none() {
            self.globals.push(global);
        }
    }

    pub fn kernels(&self) -> impl Iterator<Item = &Function> {
        self.functions
            .iter()
            .filter(|f| f.linkage == Linkage::Kernel)
    }

    pub fn is_annotated_kernel(&self, symbol: &str) -> bool {
        self.annotations
            .iter()
            .any(|a| a.symbol == symbol && a.key == "kernel" && a.value == 1)
    }
}

// ─── Display ──────────────────────────────────────────────────────

impl fmt::Display for SIROp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_op(f, self, 0)
    }
}

fn write_body(f: &mut fmt::Formatter<'_>, ops: &[SIROp], indent: usize) -> fmt::Result {
    for op in ops {
        write_op(f, op, indent)?;
    }
    Ok(())
}

fn write_op(f: &mut fmt::Formatter<'_>, op: &SIROp, indent: usize) -> fmt::Result {
    let pad = "  ".repeat(indent);
    match op {
        SIROp::Alloca {
            dst,
            size,
            align,
            name,
        } => writeln!(f, "{}{} = alloca {}, align {} ; {}", pad, dst, size, align, name),
        SIROp::Load { dst, addr, width } => {
            writeln!(f, "{}{} = load {}, {}", pad, dst, width, addr)
        }
        SIROp::Store { value, addr, width } => {
            writeln!(f, "{}store {} {}, {}", pad, width, value, addr)
        }
        SIROp::FieldAddr {
            dst,
            base,
            offset,
            index,
        } => match index {
            Some((idx, stride)) => writeln!(
                f,
                "{}{} = gep {}, {} + {} * {}",
                pad, dst, base, offset, idx, stride
            ),
            None => writeln!(f, "{}{} = gep {}, {}", pad, dst, base, offset),
        },
        SIROp::Binary { dst, op, lhs, rhs } => {
            writeln!(f, "{}{} = {} {}, {}", pad, dst, op, lhs, rhs)
        }
        SIROp::Compare { dst, op, lhs, rhs } => {
            writeln!(f, "{}{} = icmp {} {}, {}", pad, dst, op, lhs, rhs)
        }
        SIROp::PopCount { dst, src } => writeln!(f, "{}{} = popc {}", pad, dst, src),
        SIROp::Special { dst, reg } => writeln!(f, "{}{} = read {}", pad, dst, reg),
        SIROp::Barrier => writeln!(f, "{}barrier", pad),
        SIROp::Call { dst, callee, args } => {
            let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
            match dst {
                Some(d) => writeln!(f, "{}{} = call {}({})", pad, d, callee, args.join(", ")),
                None => writeln!(f, "{}call {}({})", pad, callee, args.join(", ")),
            }
        }
        SIROp::If {
            cond,
            then_body,
            else_body,
        } => {
            writeln!(f, "{}if {} {{", pad, cond)?;
            write_body(f, then_body, indent + 1)?;
            if !else_body.is_empty() {
                writeln!(f, "{}}} else {{", pad)?;
                write_body(f, else_body, indent + 1)?;
            }
            writeln!(f, "{}}}", pad)
        }
        SIROp::Loop { label, body } => {
            writeln!(f, "{}loop {} {{", pad, label)?;
            write_body(f, body, indent + 1)?;
            writeln!(f, "{}}}", pad)
        }
        SIROp::Break => writeln!(f, "{}break", pad),
        SIROp::Return(Some(v)) => writeln!(f, "{}ret {}", pad, v),
        SIROp::Return(None) => writeln!(f, "{}ret", pad),
        SIROp::Comment(text) => writeln!(f, "{}; {}", pad, text),
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let linkage = match self.linkage {
            Linkage::Kernel => "kernel",
            Linkage::Internal => "internal",
            Linkage::Helper => "helper",
        };
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| format!("{} {} %{}", p.width, p.reg, p.name))
            .collect();
        let ret = self
            .returns
            .map(|w| w.to_string())
            .unwrap_or_else(|| "void".to_string());
        let attrs = if self.noinline { " noinline" } else { "" };
        writeln!(
            f,
            "define {} {} @{}({}){} {{",
            linkage,
            ret,
            self.name,
            params.join(", "),
            attrs
        )?;
        write_body(f, &self.body, 1)?;
        writeln!(f, "}}")
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; module {}", self.name)?;
        for g in &self.globals {
            writeln!(
                f,
                "@{} = addrspace({}) [{} x i8], align {}",
                g.name, g.addr_space, g.size, g.align
            )?;
        }
        for func in &self.functions {
            writeln!(f)?;
            write!(f, "{}", func)?;
        }
        if !self.annotations.is_empty() {
            writeln!(f)?;
            for a in &self.annotations {
                writeln!(f, "!nvvm.annotations = !{{@{}, !\"{}\", i32 {}}}", a.symbol, a.key, a.value)?;
            }
        }
        Ok(())
    }
}
