//! Per-function sharing infrastructure.
//!
//! A function whose context shares captures calls its `<fn>.data_share`
//! helper once, before anything in its body runs. The helper acquires a
//! frame from the slot pool that matches the lane's regime, moves the
//! captures into it and hands the new addresses back through `.addr`
//! cells. The matching teardown pops the frame right before return.

use crate::abi::RuntimeFn;
use crate::config::DeviceConfig;
use crate::directive::Ty;
use crate::ir::sir::{CmpOp, FnBuilder, Function, Linkage, Reg, Value, Width};
use crate::omp::level::{
    emit_level_dispatch, emit_lane_id, emit_master_thread_id, emit_thread_id, plan_dispatch,
    Regime, StaticLevel,
};

use super::{CaptureDescriptor, DataSharingContext, SharingMode};

/// Names of the four cells `begin` saves the caller's pool state into.
pub const SAVED_CELLS: [&str; 4] = ["saved_slot", "saved_stack", "saved_frame", "saved_active"];

pub fn share_helper_name(function: &str) -> String {
    format!("{}.data_share", function)
}

/// Access width for a value of type `ty`.
pub fn width_of(ty: &Ty) -> Width {
    match ty {
        Ty::I8 => Width::I8,
        Ty::I32 => Width::I32,
        Ty::I64 => Width::I64,
        Ty::Ptr | Ty::Vla { .. } => Width::Ptr,
        Ty::Array { elem, .. } => width_of(elem),
    }
}

/// Parameters of one capture in the helper signature.
struct CaptureParams {
    /// Cell receiving the published address; absent for by-reference.
    addr: Option<Reg>,
    orig: Reg,
}

/// Build the share helper of `function` for `ctx`.
///
/// `level` is the static level of `function`'s body. Entry helpers are
/// gated to the master lane.
pub fn emit_share_helper(
    cfg: &DeviceConfig,
    function: &str,
    ctx: &DataSharingContext,
    level: StaticLevel,
    is_entry: bool,
) -> Function {
    let mut fb = FnBuilder::new(share_helper_name(function), Linkage::Helper);
    fb.set_noinline();
    let saved: Vec<Reg> = SAVED_CELLS
        .iter()
        .map(|name| fb.param(*name, Width::Ptr))
        .collect();
    let params: Vec<CaptureParams> = ctx
        .captures
        .iter()
        .map(|cap| {
            let addr = cap
                .mode
                .rebinds()
                .then(|| fb.param(format!("{}.addr", cap.name), Width::Ptr));
            let orig = fb.param(format!("{}.orig", cap.name), Width::Ptr);
            CaptureParams { addr, orig }
        })
        .collect();

    if is_entry {
        let tid = emit_thread_id(&mut fb);
        let master = emit_master_thread_id(&mut fb, cfg);
        let gate = fb.compare(CmpOp::Eq, tid, master);
        fb.begin_if(gate);
    }

    let plan = plan_dispatch(level);
    let saved_args = || saved.iter().map(|r| Value::Reg(*r)).collect::<Vec<_>>();
    let (master_fields, worker_fields) = match &ctx.records {
        Some(r) => (r.master.fields.as_slice(), r.worker.fields.as_slice()),
        None => (&[][..], &[][..]),
    };
    emit_level_dispatch(&mut fb, cfg, &plan.arms, |fb, regime| match regime {
        Regime::Level0 => {
            let mut args = saved_args();
            args.push(Value::from(ctx.master_size()));
            args.push(Value::from(cfg.slot_size));
            let data = fb.rt_call(RuntimeFn::DataSharingEnvironmentBegin, args);
            for ((cap, p), layout) in ctx.captures.iter().zip(&params).zip(master_fields) {
                let field = fb.field_addr(data, layout.offset);
                publish(fb, cap, p, field);
            }
        }
        Regime::Level1 => {
            let mut args = saved_args();
            args.push(Value::from(ctx.worker_size()));
            args.push(Value::from(cfg.worker_warp_slot_size()));
            let data = fb.rt_call(RuntimeFn::DataSharingEnvironmentBegin, args);
            let lane = emit_lane_id(fb, cfg);
            for ((cap, p), layout) in ctx.captures.iter().zip(&params).zip(worker_fields) {
                let elem = fb.elem_addr(data, layout.offset, lane, layout.elem_size);
                publish(fb, cap, p, elem);
            }
        }
        Regime::Sequential => {
            for p in &params {
                if let Some(addr) = p.addr {
                    fb.store(p.orig, addr, Width::Ptr);
                }
            }
        }
    });

    if is_entry {
        fb.end_if();
    }
    fb.finish()
}

fn publish(fb: &mut FnBuilder, cap: &CaptureDescriptor, p: &CaptureParams, field: Reg) {
    match cap.mode {
        SharingMode::ByReference => fb.store(p.orig, field, Width::Ptr),
        SharingMode::ByPointerCast => {
            let width = width_of(&cap.ty);
            let value = fb.load(p.orig, width);
            fb.store(value, field, width);
            if let Some(addr) = p.addr {
                fb.store(field, addr, Width::Ptr);
            }
        }
        SharingMode::ByValueAddress => {
            if let Some(addr) = p.addr {
                fb.store(field, addr, Width::Ptr);
            }
        }
    }
}

/// Pop the frame the share helper pushed.
///
/// Entries release unconditionally on the master path; every other
/// function repeats the helper's level plan without its Sequential arm,
/// which never acquired anything.
pub fn emit_teardown(
    fb: &mut FnBuilder,
    cfg: &DeviceConfig,
    level: StaticLevel,
    saved: &[Reg; 4],
    is_entry: bool,
) {
    let args = |flag: i64| {
        let mut v: Vec<Value> = saved.iter().map(|r| Value::Reg(*r)).collect();
        v.push(Value::Imm(flag));
        v
    };
    if is_entry {
        fb.rt_call_void(RuntimeFn::DataSharingEnvironmentEnd, args(1));
        return;
    }
    let arms: Vec<_> = plan_dispatch(level)
        .arms
        .into_iter()
        .filter(|a| a.regime != Regime::Sequential)
        .collect();
    emit_level_dispatch(fb, cfg, &arms, |fb, _| {
        fb.rt_call_void(RuntimeFn::DataSharingEnvironmentEnd, args(0));
    });
}
