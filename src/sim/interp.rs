//! Lock-step interpreter for one warp.
//!
//! Registers hold one value per lane. Every op runs for the lanes of the
//! current mask; `If` runs the then-arm on the lanes whose condition holds
//! and the else-arm on the rest, one after the other, and reconverges.
//! `Loop` keeps iterating with the lanes that reached the end of its body
//! and hands the lanes that executed `Break` to the code after it.

use crate::ir::sir::{BinOp, Callee, CmpOp, Function, SIROp, Special, Value, Width};
use crate::runtime::{DeviceRuntime, RuntimeCall};

use super::barrier::BlockBarrier;
use super::memory::{self, stack_base, Memory};
use super::{Observation, Program, RuntimeFault, SimError};

const MAX_CALL_DEPTH: u32 = 256;

/// Name of the external hook that records an observation.
pub(crate) const OBSERVE: &str = "observe";

pub(crate) struct BlockCtx<'a> {
    pub block: u32,
    pub threads: u32,
    pub warp_size: u32,
    pub mem: &'a Memory<'a>,
    pub barrier: &'a BlockBarrier,
    pub runtime: &'a dyn DeviceRuntime,
    pub step_budget: u64,
}

struct Frame {
    regs: Vec<Vec<i64>>,
    /// Lanes that executed `Return`.
    returned: u64,
    ret: Vec<i64>,
}

impl Frame {
    fn new(regs: u32, width: usize) -> Self {
        Self {
            regs: vec![vec![0; width]; regs as usize],
            returned: 0,
            ret: vec![0; width],
        }
    }

    fn set(&mut self, reg: u32, lane: usize, value: i64) {
        let reg = reg as usize;
        if reg >= self.regs.len() {
            let width = self.ret.len();
            self.regs.resize(reg + 1, vec![0; width]);
        }
        self.regs[reg][lane] = value;
    }

    fn get(&self, reg: u32, lane: usize) -> i64 {
        self.regs
            .get(reg as usize)
            .map(|r| r[lane])
            .unwrap_or(0)
    }
}

fn lanes(mask: u64) -> impl Iterator<Item = usize> {
    (0..64).filter(move |l| mask >> l & 1 == 1)
}

pub(crate) struct WarpExec<'a> {
    prog: &'a Program<'a>,
    ctx: &'a BlockCtx<'a>,
    warp: u32,
    width: usize,
    sp: Vec<u64>,
    steps: u64,
    depth: u32,
    observations: Vec<Observation>,
}

impl<'a> WarpExec<'a> {
    pub(crate) fn new(prog: &'a Program<'a>, ctx: &'a BlockCtx<'a>, warp: u32) -> Self {
        let width = ctx.warp_size as usize;
        let sp = (0..ctx.warp_size)
            .map(|lane| stack_base(warp * ctx.warp_size + lane))
            .collect();
        Self {
            prog,
            ctx,
            warp,
            width,
            sp,
            steps: 0,
            depth: 0,
            observations: Vec::new(),
        }
    }

    fn full_mask(&self) -> u64 {
        if self.width >= 64 {
            u64::MAX
        } else {
            (1u64 << self.width) - 1
        }
    }

    fn tid(&self, lane: usize) -> u32 {
        self.warp * self.ctx.warp_size + lane as u32
    }

    fn fault(&self, lane: usize, fault: RuntimeFault) -> SimError {
        SimError::Fault {
            block: self.ctx.block,
            tid: self.tid(lane),
            fault,
        }
    }

    /// Run `entry` on every lane of the warp with the same arguments.
    pub(crate) fn run_kernel(&mut self, entry: &Function, argv: &[i64]) -> Result<(), SimError> {
        let args = argv.iter().map(|&v| vec![v; self.width]).collect();
        let mask = self.full_mask();
        self.call_function(entry, args, mask)?;
        Ok(())
    }

    pub(crate) fn finish(self) -> (Vec<Observation>, u64) {
        (self.observations, self.steps)
    }

    fn tick(&mut self) -> Result<(), SimError> {
        self.steps += 1;
        if self.steps > self.ctx.step_budget {
            return Err(SimError::StepBudget {
                block: self.ctx.block,
                warp: self.warp,
            });
        }
        Ok(())
    }

    fn call_function(
        &mut self,
        func: &Function,
        args: Vec<Vec<i64>>,
        mask: u64,
    ) -> Result<Vec<i64>, SimError> {
        if args.len() != func.params.len() {
            return Err(SimError::ArgumentMismatch {
                function: func.name.clone(),
                expected: func.params.len(),
                got: args.len(),
            });
        }
        if self.depth >= MAX_CALL_DEPTH {
            let lane = mask.trailing_zeros() as usize;
            return Err(self.fault(lane, RuntimeFault::CallDepth {
                depth: MAX_CALL_DEPTH,
            }));
        }
        let mut frame = Frame::new(func.reg_count, self.width);
        for (param, values) in func.params.iter().zip(args) {
            for lane in lanes(mask) {
                frame.set(param.reg.0, lane, memory::truncate(values[lane], param.width));
            }
        }
        let saved_sp = self.sp.clone();
        self.depth += 1;
        let result = self.exec_body(&mut frame, &func.body, mask);
        self.depth -= 1;
        self.sp = saved_sp;
        result?;
        Ok(frame.ret)
    }

    fn value(&self, frame: &Frame, v: &Value, lane: usize) -> Result<i64, SimError> {
        Ok(match v {
            Value::Reg(r) => frame.get(r.0, lane),
            Value::Imm(i) => *i,
            Value::Null => 0,
            Value::Global(name) => self.prog.symbol(name)? as i64,
            Value::Func(name) => self.prog.function_addr(name)? as i64,
        })
    }

    fn load(&self, lane: usize, addr: i64, width: Width) -> Result<i64, SimError> {
        self.ctx
            .mem
            .load(addr as u64, width)
            .map_err(|f| self.fault(lane, f))
    }

    /// Execute `ops` for `mask`; returns the lanes that fell through.
    fn exec_body(&mut self, frame: &mut Frame, ops: &[SIROp], mut mask: u64) -> Result<u64, SimError> {
        for op in ops {
            if mask == 0 {
                break;
            }
            self.tick()?;
            match op {
                SIROp::Alloca {
                    dst, size, align, ..
                } => {
                    for lane in lanes(mask) {
                        let align = (*align).max(1) as u64;
                        let addr = self.sp[lane].div_ceil(align) * align;
                        self.sp[lane] = addr + *size as u64;
                        frame.set(dst.0, lane, addr as i64);
                    }
                }
                SIROp::Load { dst, addr, width } => {
                    for lane in lanes(mask) {
                        let a = self.value(frame, addr, lane)?;
                        let v = self.load(lane, a, *width)?;
                        frame.set(dst.0, lane, v);
                    }
                }
                SIROp::Store { value, addr, width } => {
                    for lane in lanes(mask) {
                        let v = self.value(frame, value, lane)?;
                        let a = self.value(frame, addr, lane)?;
                        self.ctx
                            .mem
                            .store(a as u64, *width, v)
                            .map_err(|f| self.fault(lane, f))?;
                    }
                }
                SIROp::FieldAddr {
                    dst,
                    base,
                    offset,
                    index,
                } => {
                    for lane in lanes(mask) {
                        let mut a = self.value(frame, base, lane)?.wrapping_add(*offset as i64);
                        if let Some((idx, stride)) = index {
                            let i = self.value(frame, idx, lane)?;
                            a = a.wrapping_add(i.wrapping_mul(*stride as i64));
                        }
                        frame.set(dst.0, lane, a);
                    }
                }
                SIROp::Binary { dst, op, lhs, rhs } => {
                    for lane in lanes(mask) {
                        let l = self.value(frame, lhs, lane)?;
                        let r = self.value(frame, rhs, lane)?;
                        frame.set(dst.0, lane, binary(*op, l, r));
                    }
                }
                SIROp::Compare { dst, op, lhs, rhs } => {
                    for lane in lanes(mask) {
                        let l = self.value(frame, lhs, lane)?;
                        let r = self.value(frame, rhs, lane)?;
                        frame.set(dst.0, lane, compare(*op, l, r) as i64);
                    }
                }
                SIROp::PopCount { dst, src } => {
                    for lane in lanes(mask) {
                        let v = self.value(frame, src, lane)?;
                        frame.set(dst.0, lane, (v as u64).count_ones() as i64);
                    }
                }
                SIROp::Special { dst, reg } => {
                    for lane in lanes(mask) {
                        let v = match reg {
                            Special::ThreadId => self.tid(lane),
                            Special::BlockDim => self.ctx.threads,
                            Special::WarpSize => self.ctx.warp_size,
                            Special::BlockId => self.ctx.block,
                        };
                        frame.set(dst.0, lane, v as i64);
                    }
                }
                SIROp::Barrier => self.ctx.barrier.wait()?,
                SIROp::Call { dst, callee, args } => {
                    let mut argv = Vec::with_capacity(args.len());
                    for a in args {
                        let mut per_lane = vec![0; self.width];
                        for lane in lanes(mask) {
                            per_lane[lane] = self.value(frame, a, lane)?;
                        }
                        argv.push(per_lane);
                    }
                    let out = self.call(callee, argv, mask)?;
                    if let Some(d) = dst {
                        for lane in lanes(mask) {
                            frame.set(d.0, lane, out.get(lane).copied().unwrap_or(0));
                        }
                    }
                }
                SIROp::If {
                    cond,
                    then_body,
                    else_body,
                } => {
                    let mut taken = 0u64;
                    for lane in lanes(mask) {
                        if self.value(frame, cond, lane)? != 0 {
                            taken |= 1 << lane;
                        }
                    }
                    let t = mask & taken;
                    let e = mask & !taken;
                    let t_out = if t != 0 {
                        self.exec_body(frame, then_body, t)?
                    } else {
                        0
                    };
                    let e_out = if e != 0 {
                        self.exec_body(frame, else_body, e)?
                    } else {
                        0
                    };
                    mask = t_out | e_out;
                }
                SIROp::Loop { body, .. } => {
                    let mut live = mask;
                    let mut exited = 0u64;
                    while live != 0 {
                        let out = self.exec_body(frame, body, live)?;
                        exited |= live & !out & !frame.returned;
                        live = out;
                    }
                    mask = exited;
                }
                SIROp::Break => return Ok(0),
                SIROp::Return(v) => {
                    if let Some(v) = v {
                        for lane in lanes(mask) {
                            frame.ret[lane] = self.value(frame, v, lane)?;
                        }
                    }
                    frame.returned |= mask;
                    return Ok(0);
                }
                SIROp::Comment(_) => {}
            }
        }
        Ok(mask)
    }

    fn call(&mut self, callee: &Callee, args: Vec<Vec<i64>>, mask: u64) -> Result<Vec<i64>, SimError> {
        match callee {
            Callee::Direct(name) => {
                let prog = self.prog;
                let func = prog.function(name)?;
                self.call_function(func, args, mask)
            }
            Callee::Runtime(rt) => {
                if args.len() != rt.arity() {
                    return Err(SimError::ArgumentMismatch {
                        function: rt.symbol().to_string(),
                        expected: rt.arity(),
                        got: args.len(),
                    });
                }
                let call = RuntimeCall {
                    warp: self.warp,
                    mask,
                    args: &args,
                };
                self.ctx
                    .runtime
                    .invoke(self.ctx.mem, *rt, &call)
                    .map_err(|f| self.fault(mask.trailing_zeros() as usize, f))
            }
            Callee::Extern(name) if name == OBSERVE => {
                for lane in lanes(mask) {
                    let arg = |i: usize| args.get(i).map(|a| a[lane]).unwrap_or(0);
                    self.observations.push(Observation {
                        block: self.ctx.block,
                        tid: self.tid(lane),
                        tag: arg(0),
                        value: arg(1),
                    });
                }
                Ok(vec![0; self.width])
            }
            Callee::Extern(name) => Err(SimError::UnknownExtern(name.clone())),
        }
    }
}

fn binary(op: BinOp, l: i64, r: i64) -> i64 {
    match op {
        BinOp::Add => l.wrapping_add(r),
        BinOp::Sub => l.wrapping_sub(r),
        BinOp::Mul => l.wrapping_mul(r),
        BinOp::And => l & r,
        BinOp::Or => l | r,
        BinOp::Xor => l ^ r,
        BinOp::Shl => l.wrapping_shl((r & 63) as u32),
        BinOp::LShr => ((l as u64) >> (r & 63)) as i64,
        BinOp::AShr => l >> (r & 63),
    }
}

fn compare(op: CmpOp, l: i64, r: i64) -> bool {
    match op {
        CmpOp::Eq => l == r,
        CmpOp::Ne => l != r,
        CmpOp::Ult => (l as u64) < (r as u64),
        CmpOp::Slt => l < r,
        CmpOp::Sle => l <= r,
        CmpOp::Sgt => l > r,
        CmpOp::Sge => l >= r,
    }
}
