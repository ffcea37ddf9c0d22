//! Wrappers: the second entry point of every outlined region.
//!
//! A lane servicing another lane's request cannot see the requester's
//! locals. The wrapper takes the requesting lane's id, finds the
//! data-sharing frame that lane published, resolves every capture to an
//! address through the enclosing context's offset table and calls the
//! outlined function with the resolved addresses.

use crate::abi::RuntimeFn;
use crate::config::DeviceConfig;
use crate::directive::{CaptureTarget, Directive};
use crate::error::{CodegenError, Result};
use crate::ir::sir::{BinOp, Callee, FnBuilder, Function, Linkage, Reg, Value, Width};
use crate::omp::level::{
    emit_level_dispatch, emit_master_thread_id, emit_thread_id, plan_dispatch, DispatchArm,
    Guard, Regime, StaticLevel,
};
use crate::omp::sharing::{ContextId, DataSharingContext, SharingMode};

/// Bookkeeping for one outlined region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperRecord {
    pub wrapper: String,
    pub outlined: String,
    /// Context whose frame the wrapper reads.
    pub context: ContextId,
    pub simd: bool,
}

pub fn wrapper_name(outlined: &str) -> String {
    format!("{}_wrapper", outlined)
}

/// Arms a wrapper distinguishes, derived from the dispatching plan.
///
/// Wrappers are only entered by lanes servicing a request: workers at
/// level 0 for the master's dispatch, lanes at level 1 for a convergent
/// drain. Sequential callers invoke the outlined function directly, so
/// the Sequential arm carries no work and is dropped. Simd regions are
/// never dispatched from Level0.
pub fn wrapper_arms(level: StaticLevel, simd: bool) -> Vec<DispatchArm> {
    let regimes: Vec<Regime> = plan_dispatch(level)
        .regimes()
        .into_iter()
        .filter(|r| *r == Regime::Level1 || (*r == Regime::Level0 && !simd))
        .collect();
    let single = regimes.len() == 1;
    regimes
        .into_iter()
        .map(|regime| DispatchArm {
            regime,
            guard: match (single, regime) {
                (true, _) => Guard::Always,
                (false, Regime::Level0) => Guard::LevelIsZero,
                (false, _) => Guard::LevelIsOne,
            },
        })
        .collect()
}

/// Build `<outlined>_wrapper` for `region`, reading frames laid out by
/// `ctx` (the context enclosing the region).
///
/// Returns `None` when no lane can service the region at `level`, as for
/// a simd region directly in a kernel body.
pub fn emit_wrapper(
    cfg: &DeviceConfig,
    outlined: &str,
    region: &Directive,
    ctx: &DataSharingContext,
    level: StaticLevel,
) -> Result<Option<Function>> {
    let simd = region.kind.opens_simd();
    let arms = wrapper_arms(level, simd);
    if arms.is_empty() {
        return Ok(None);
    }
    let mut fb = FnBuilder::new(wrapper_name(outlined), Linkage::Helper);
    fb.set_noinline();
    let src = fb.param("src_lane", Width::I32);
    let lanes = simd.then(|| {
        (
            fb.param("lane_id", Width::Ptr),
            fb.param("num_lanes", Width::Ptr),
        )
    });

    let mut slots = Vec::with_capacity(region.captures.len());
    for cap in &region.captures {
        let unplanned = || CodegenError::UnplannedCapture {
            name: match cap.target {
                CaptureTarget::Var(v) => format!("#{}", v.0),
                CaptureTarget::This => "this".to_string(),
            },
            span: region.span,
        };
        let index = ctx.index_of(cap.target).ok_or_else(unplanned)?;
        let (master, worker) = ctx.fields(index).ok_or_else(unplanned)?;
        let mode = ctx.captures[index].mode;
        let cell = fb.alloca(
            format!("{}.cell", ctx.captures[index].name),
            cfg.pointer_width,
            cfg.pointer_width,
        );
        slots.push((mode, master, worker, cell));
    }

    emit_level_dispatch(&mut fb, cfg, &arms, |fb, regime| match regime {
        Regime::Level0 => {
            let master = emit_master_thread_id(fb, cfg);
            let frame = fb.rt_call(RuntimeFn::GetDataSharingEnvironmentFrame, vec![master.into()]);
            for &(mode, field, _, cell) in &slots {
                let addr = fb.field_addr(frame, field.offset);
                resolve(fb, mode, addr, cell);
            }
        }
        Regime::Level1 => {
            let tid = emit_thread_id(fb);
            let frame = fb.rt_call(RuntimeFn::GetDataSharingEnvironmentFrame, vec![tid.into()]);
            let lane = fb.binary(BinOp::And, src, cfg.lane_mask());
            for &(mode, _, layout, cell) in &slots {
                let elem = fb.elem_addr(frame, layout.offset, lane, layout.elem_size);
                resolve(fb, mode, elem, cell);
            }
        }
        Regime::Sequential => {}
    });

    let mut args: Vec<Value> = match lanes {
        Some((lane_id, num_lanes)) => vec![lane_id.into(), num_lanes.into()],
        None if region.kind.takes_distribute_bounds() => {
            vec![Value::Null, Value::Null, Value::Imm(0), Value::Imm(0)]
        }
        None => vec![Value::Null, Value::Null],
    };
    for &(_, _, _, cell) in &slots {
        args.push(fb.load(cell, Width::Ptr).into());
    }
    fb.call_void(Callee::Direct(outlined.to_string()), args);
    Ok(Some(fb.finish()))
}

fn resolve(fb: &mut FnBuilder, mode: SharingMode, field: Reg, cell: Reg) {
    let addr = match mode {
        SharingMode::ByReference => fb.load(field, Width::Ptr),
        SharingMode::ByValueAddress | SharingMode::ByPointerCast => field,
    };
    fb.store(addr, cell, Width::Ptr);
}
