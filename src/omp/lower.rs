//! Frames and statement lowering.
//!
//! A frame maps each variable visible in the function being emitted to
//! the register holding its address. The prologue runs the share helper
//! and rebinds shared variables to their published addresses before any
//! statement is lowered, so nothing ever reads a pre-shared address.

use std::collections::HashMap;
use std::rc::Rc;

use crate::directive::{BinaryOp, CaptureTarget, Expr, FunctionDecl, Stmt, Storage, VarId};
use crate::error::{CodegenError, Result};
use crate::ir::sir::{BinOp, Callee, CmpOp, FnBuilder, Linkage, Reg, Value, Width};
use crate::omp::level::{emit_thread_id, StaticLevel};
use crate::omp::session::CodegenSession;
use crate::omp::sharing::infra::{
    emit_share_helper, emit_teardown, share_helper_name, width_of, SAVED_CELLS,
};
use crate::omp::sharing::{ContextId, DataSharingContext};
use crate::span::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Kernel,
    Parallel,
    Simd,
    Device,
}

/// How a variable enters the function.
#[derive(Debug, Clone, Copy)]
pub enum Incoming {
    /// A pointer parameter: the variable lives elsewhere.
    Address(Reg),
    /// A value parameter, spilled to a local slot.
    Value(Reg),
}

pub struct FrameSpec {
    pub kind: FrameKind,
    pub context: ContextId,
    pub incoming: Vec<(VarId, Incoming)>,
    pub locals: Vec<VarId>,
    pub this: Option<Reg>,
    /// `lane_id` and `num_lanes` cells of a simd body.
    pub simd_lanes: Option<(Reg, Reg)>,
    pub span: Span,
}

pub struct Frame {
    pub kind: FrameKind,
    pub context: Rc<DataSharingContext>,
    vars: HashMap<VarId, Reg>,
    this: Option<Reg>,
    simd_lanes: Option<(Reg, Reg)>,
    /// Cells the share helper saved the pool state into.
    saved: Option<[Reg; 4]>,
    span: Span,
}

impl Frame {
    pub fn address_of(&self, var: VarId) -> Option<Reg> {
        self.vars.get(&var).copied()
    }

    pub fn this(&self) -> Option<Reg> {
        self.this
    }

    pub fn shares(&self) -> bool {
        self.saved.is_some()
    }
}

/// Locals a frame allocates: its own plus those of worksharing and teams
/// constructs lowered inline in the same function.
pub fn frame_locals(body: &Stmt, own: &[VarId]) -> Vec<VarId> {
    let mut out = own.to_vec();
    collect_inline_locals(body, &mut out);
    out
}

fn collect_inline_locals(stmt: &Stmt, out: &mut Vec<VarId>) {
    let mut found = Vec::new();
    stmt.for_each_directive(&mut |d| found.push(d));
    for d in found {
        if d.kind.opens_region() || d.kind.is_target() {
            continue;
        }
        for v in &d.locals {
            if !out.contains(v) {
                out.push(*v);
            }
        }
        collect_inline_locals(&d.body, out);
    }
}

impl<'a> CodegenSession<'a> {
    // ── frames ──

    /// Storage size and alignment of a variable's own slot.
    fn slot_of(&self, var: VarId, span: Span) -> Result<(String, u32, u32)> {
        let decl = self.index.var(var, span)?;
        let ty = match &decl.storage {
            Storage::View { underlying } => underlying,
            Storage::Local | Storage::Reference => &decl.ty,
        };
        let ptr = self.cfg.pointer_width;
        Ok((
            decl.name.clone(),
            ty.size().unwrap_or(ptr),
            ty.align().unwrap_or(ptr),
        ))
    }

    pub(crate) fn open_frame(&mut self, fb: &mut FnBuilder, spec: FrameSpec) -> Result<Frame> {
        let context = self.context(&spec.context)?;
        let fn_name = fb.name().to_string();
        let mut vars = HashMap::new();

        for &id in &spec.locals {
            let (name, size, align) = self.slot_of(id, spec.span)?;
            vars.insert(id, fb.alloca(name, size, align));
        }
        let mut spills = Vec::new();
        for &(id, incoming) in &spec.incoming {
            match incoming {
                Incoming::Address(reg) => {
                    vars.insert(id, reg);
                }
                Incoming::Value(reg) => {
                    let (name, size, align) = self.slot_of(id, spec.span)?;
                    vars.insert(id, fb.alloca(format!("{}.spill", name), size, align));
                    let width = width_of(&self.index.var(id, spec.span)?.ty);
                    spills.push((id, reg, width));
                }
            }
        }

        let is_entry = spec.kind == FrameKind::Kernel;
        let mut saved = None;
        if is_entry || !context.is_empty() {
            let ptr = self.cfg.pointer_width;
            let cells = SAVED_CELLS.map(|name| fb.alloca(name, ptr, ptr));
            let helper = emit_share_helper(&self.cfg, &fn_name, &context, self.level, is_entry);
            self.module.add_function(helper);

            let mut args: Vec<Value> = cells.iter().map(|r| Value::Reg(*r)).collect();
            let mut rebinds = Vec::new();
            for cap in &context.captures {
                let orig = match cap.identity {
                    CaptureTarget::This => spec.this.ok_or_else(|| CodegenError::MissingThis {
                        function: fn_name.clone(),
                        span: spec.span,
                    })?,
                    CaptureTarget::Var(v) => {
                        vars.get(&v)
                            .copied()
                            .ok_or_else(|| CodegenError::UnplannedCapture {
                                name: cap.name.clone(),
                                span: spec.span,
                            })?
                    }
                };
                if cap.mode.rebinds() {
                    let cell = fb.alloca(format!("{}.addr", cap.name), ptr, ptr);
                    args.push(cell.into());
                    if let CaptureTarget::Var(v) = cap.identity {
                        rebinds.push((v, cell));
                    }
                }
                args.push(orig.into());
            }
            fb.call_void(Callee::Direct(share_helper_name(&fn_name)), args);
            for (v, cell) in rebinds {
                let addr = fb.load(cell, Width::Ptr);
                vars.insert(v, addr);
            }
            saved = Some(cells);
        }

        for (id, reg, width) in spills {
            if let Some(&slot) = vars.get(&id) {
                fb.store(reg, slot, width);
            }
        }

        Ok(Frame {
            kind: spec.kind,
            context,
            vars,
            this: spec.this,
            simd_lanes: spec.simd_lanes,
            saved,
            span: spec.span,
        })
    }

    pub(crate) fn close_frame(&mut self, fb: &mut FnBuilder, frame: &Frame) {
        if let Some(saved) = &frame.saved {
            emit_teardown(fb, &self.cfg, self.level, saved, frame.kind == FrameKind::Kernel);
        }
    }

    // ── device functions ──

    /// Device functions have no statically known parallel context.
    pub(crate) fn gen_device_function(&mut self, decl: &'a FunctionDecl) -> Result<()> {
        let mut fb = FnBuilder::new(decl.name.clone(), Linkage::Internal);
        let this = decl.has_this.then(|| fb.param("this", Width::Ptr));
        let mut incoming = Vec::with_capacity(decl.params.len());
        for &p in &decl.params {
            let v = self.index.var(p, decl.span)?;
            let binding = match v.storage {
                Storage::Reference => Incoming::Address(fb.param(v.name.clone(), Width::Ptr)),
                Storage::Local | Storage::View { .. } => {
                    Incoming::Value(fb.param(v.name.clone(), width_of(&v.ty)))
                }
            };
            incoming.push((p, binding));
        }
        let spec = FrameSpec {
            kind: FrameKind::Device,
            context: ContextId::Function(decl.name.clone()),
            incoming,
            locals: frame_locals(&decl.body, &decl.locals),
            this,
            simd_lanes: None,
            span: decl.span,
        };
        self.with_level(StaticLevel::orphaned(), |s| {
            let mut frame = s.open_frame(&mut fb, spec)?;
            s.lower_stmt(&mut fb, &mut frame, &decl.body)?;
            s.close_frame(&mut fb, &frame);
            Ok(())
        })?;
        self.module.add_function(fb.finish());
        Ok(())
    }

    // ── statements ──

    pub(crate) fn lower_stmt(
        &mut self,
        fb: &mut FnBuilder,
        frame: &mut Frame,
        stmt: &'a Stmt,
    ) -> Result<()> {
        match stmt {
            Stmt::Block(stmts) => {
                for s in stmts {
                    self.lower_stmt(fb, frame, s)?;
                }
            }
            Stmt::Assign { var, value } => {
                let value = self.lower_expr(fb, frame, value)?;
                let ty = &self.index.var(*var, frame.span)?.ty;
                let width = width_of(ty);
                let addr = self.var_addr(frame, *var)?;
                fb.store(value, addr, width);
            }
            Stmt::Store { addr, value, ty } => {
                let addr = self.lower_expr(fb, frame, addr)?;
                let value = self.lower_expr(fb, frame, value)?;
                fb.store(value, addr, width_of(ty));
            }
            Stmt::Call { callee, args } => self.lower_call(fb, frame, callee, args)?,
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond = self.lower_expr(fb, frame, cond)?;
                fb.begin_if(cond);
                self.lower_stmt(fb, frame, then_branch)?;
                if let Some(else_branch) = else_branch {
                    fb.begin_else();
                    self.lower_stmt(fb, frame, else_branch)?;
                }
                fb.end_if();
            }
            Stmt::Directive(d) => self.lower_directive(fb, frame, d)?,
        }
        Ok(())
    }

    fn lower_call(
        &mut self,
        fb: &mut FnBuilder,
        frame: &mut Frame,
        callee: &str,
        args: &'a [Expr],
    ) -> Result<()> {
        let Some(decl) = self.index.function(callee).filter(|f| f.device) else {
            let mut values = Vec::with_capacity(args.len());
            for a in args {
                values.push(self.lower_expr(fb, frame, a)?);
            }
            fb.call_void(Callee::Extern(callee.to_string()), values);
            return Ok(());
        };
        let mut values = Vec::with_capacity(args.len() + 1);
        if decl.has_this {
            values.push(frame.this.map(Value::Reg).unwrap_or(Value::Null));
        }
        for (&param, arg) in decl.params.iter().zip(args) {
            let by_ref = matches!(self.index.var(param, decl.span)?.storage, Storage::Reference);
            let value = match arg {
                Expr::Var(v) | Expr::AddrOf(v) if by_ref => self.var_addr(frame, *v)?.into(),
                _ => self.lower_expr(fb, frame, arg)?,
            };
            values.push(value);
        }
        fb.call_void(Callee::Direct(callee.to_string()), values);
        Ok(())
    }

    // ── expressions ──

    pub(crate) fn lower_expr(
        &mut self,
        fb: &mut FnBuilder,
        frame: &Frame,
        expr: &Expr,
    ) -> Result<Value> {
        Ok(match expr {
            Expr::Int(v) => Value::Imm(*v),
            Expr::Var(v) => {
                let width = width_of(&self.index.var(*v, frame.span)?.ty);
                let addr = self.var_addr(frame, *v)?;
                fb.load(addr, width).into()
            }
            Expr::AddrOf(v) => self.var_addr(frame, *v)?.into(),
            Expr::Load { addr, ty } => {
                let addr = self.lower_expr(fb, frame, addr)?;
                fb.load(addr, width_of(ty)).into()
            }
            Expr::This => frame
                .this
                .map(Value::Reg)
                .ok_or_else(|| CodegenError::MissingThis {
                    function: fb.name().to_string(),
                    span: frame.span,
                })?,
            Expr::Binary { op, lhs, rhs } => {
                let l = self.lower_expr(fb, frame, lhs)?;
                let r = self.lower_expr(fb, frame, rhs)?;
                match op {
                    BinaryOp::Add => fb.binary(BinOp::Add, l, r),
                    BinaryOp::Sub => fb.binary(BinOp::Sub, l, r),
                    BinaryOp::Mul => fb.binary(BinOp::Mul, l, r),
                    BinaryOp::And => fb.binary(BinOp::And, l, r),
                    BinaryOp::Or => fb.binary(BinOp::Or, l, r),
                    BinaryOp::Eq => fb.compare(CmpOp::Eq, l, r),
                    BinaryOp::Ne => fb.compare(CmpOp::Ne, l, r),
                    BinaryOp::Lt => fb.compare(CmpOp::Slt, l, r),
                    BinaryOp::Gt => fb.compare(CmpOp::Sgt, l, r),
                }
                .into()
            }
            Expr::ThreadId => emit_thread_id(fb).into(),
            Expr::SimdLane => match frame.simd_lanes {
                Some((lane, _)) => fb.load(lane, Width::I32).into(),
                None => Value::Imm(0),
            },
            Expr::SimdLanes => match frame.simd_lanes {
                Some((_, lanes)) => fb.load(lanes, Width::I32).into(),
                None => Value::Imm(1),
            },
        })
    }

    pub(crate) fn var_addr(&self, frame: &Frame, var: VarId) -> Result<Reg> {
        if let Some(addr) = frame.address_of(var) {
            return Ok(addr);
        }
        let name = self.index.var(var, frame.span)?.name.clone();
        Err(CodegenError::UnplannedCapture {
            name,
            span: frame.span,
        })
    }
}

