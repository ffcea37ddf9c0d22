//! Region dispatcher: outlining and the per-construct call sequences.
//!
//! A parallel or simd construct is outlined into its own function plus a
//! wrapper, then replaced at the construct site by a level dispatch:
//!
//!   Level0      hand the wrapper to the workers and wait for them
//!   Level1      drain the group's requests with the convergent protocol
//!   Sequential  call the outlined function in place, serialized
//!
//! Teams and worksharing constructs are lowered inline.

use tracing::{debug, warn};

use crate::abi::RuntimeFn;
use crate::directive::{CaptureTarget, Directive, DirectiveKind};
use crate::error::{CodegenError, Result};
use crate::ir::sir::{Callee, CmpOp, FnBuilder, Global, Linkage, Value, Width};
use crate::omp::level::{
    emit_global_thread_id, emit_level_adjust, plan_dispatch, DispatchArm, Regime,
    PARALLEL_LEVEL_STEP, SIMD_LEVEL_STEP,
};
use crate::omp::lower::{frame_locals, Frame, FrameKind, FrameSpec, Incoming};
use crate::omp::schedule::SchedulePolicy;
use crate::omp::session::CodegenSession;
use crate::omp::sharing::ContextId;
use crate::omp::wrapper::{emit_wrapper, wrapper_name, WrapperRecord};
use crate::span::Span;

/// An outlined region ready to be called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutlinedRegion {
    pub name: String,
    /// Only emitted when some lane can service the region.
    pub wrapper: String,
    pub simd: bool,
    /// Takes the distribute `.lb.`/`.ub.` bounds after the thread ids.
    pub bounds: bool,
    pub span: Span,
}

/// Size of a source location ident (`ident_t`).
const LOCATION_SIZE: u64 = 24;

impl<'a> CodegenSession<'a> {
    pub(crate) fn lower_directive(
        &mut self,
        fb: &mut FnBuilder,
        frame: &mut Frame,
        d: &'a Directive,
    ) -> Result<()> {
        if d.kind.is_target() {
            return Err(CodegenError::NestedTarget { span: d.span });
        }
        if d.kind.opens_region() {
            let region = self.outline_region(fb.name(), &frame.context.id, d)?;
            let captured = self.capture_values(frame, d)?;
            let if_cond = match &d.clauses.if_cond {
                Some(cond) => Some(self.lower_expr(fb, frame, cond)?),
                None => None,
            };
            return if region.simd {
                self.emit_simd_call(fb, &region, &captured, if_cond)
            } else {
                self.emit_parallel_call(fb, &region, &captured, if_cond)
            };
        }
        if d.kind == DirectiveKind::Teams {
            return self.emit_teams_call(fb, frame, d);
        }
        self.emit_worksharing(fb, frame, d)
    }

    /// Addresses of `d`'s captures in the enclosing frame.
    fn capture_values(&self, frame: &Frame, d: &Directive) -> Result<Vec<Value>> {
        d.captures
            .iter()
            .map(|cap| match cap.target {
                CaptureTarget::This => {
                    frame
                        .this()
                        .map(Value::Reg)
                        .ok_or_else(|| CodegenError::MissingThis {
                            function: frame.context.id.to_string(),
                            span: d.span,
                        })
                }
                CaptureTarget::Var(v) => self.var_addr(frame, v).map(Value::Reg),
            })
            .collect()
    }

    // ── outlining ──

    /// Outline `d`'s body into `<parent>_omp_outlined[_simd]_<n>` and build
    /// its wrapper against the enclosing context.
    pub(crate) fn outline_region(
        &mut self,
        parent: &str,
        enclosing: &ContextId,
        d: &'a Directive,
    ) -> Result<OutlinedRegion> {
        let simd = d.kind.opens_simd();
        let bounds = d.kind.takes_distribute_bounds();
        let name = self.next_outlined_name(parent, simd);
        let step = if simd {
            SIMD_LEVEL_STEP
        } else {
            PARALLEL_LEVEL_STEP
        };
        let outer = self.level;
        let mut inner = outer.nested(step);
        // The master may run the body serialized at level 1, where the
        // static classification would wrongly pick Level1.
        if !simd && d.clauses.if_cond.is_some() && plan_dispatch(outer).contains(Regime::Level0) {
            inner.orphaned = true;
        }

        let mut fb = FnBuilder::new(name.clone(), Linkage::Internal);
        let simd_lanes = if simd {
            Some((
                fb.param("lane_id", Width::Ptr),
                fb.param("num_lanes", Width::Ptr),
            ))
        } else {
            fb.param(".global_tid.", Width::Ptr);
            fb.param(".bound_tid.", Width::Ptr);
            if bounds {
                fb.param(".lb.", Width::I32);
                fb.param(".ub.", Width::I32);
            }
            None
        };
        let mut incoming = Vec::with_capacity(d.captures.len());
        let mut this = None;
        for cap in &d.captures {
            match cap.target {
                CaptureTarget::This => this = Some(fb.param("this", Width::Ptr)),
                CaptureTarget::Var(v) => {
                    let decl = self.index.var(v, d.span)?;
                    incoming.push((v, Incoming::Address(fb.param(decl.name.clone(), Width::Ptr))));
                }
            }
        }
        let spec = FrameSpec {
            kind: if simd {
                FrameKind::Simd
            } else {
                FrameKind::Parallel
            },
            context: ContextId::Region(d.id),
            incoming,
            locals: frame_locals(&d.body, &d.locals),
            this,
            simd_lanes,
            span: d.span,
        };
        self.with_level(inner, |s| {
            emit_level_adjust(&mut fb, step);
            let mut frame = s.open_frame(&mut fb, spec)?;
            s.lower_stmt(&mut fb, &mut frame, &d.body)?;
            s.close_frame(&mut fb, &frame);
            emit_level_adjust(&mut fb, -step);
            Ok(())
        })?;
        self.module.add_function(fb.finish());
        debug!(outlined = %name, kind = %d.kind, nesting = inner.nesting, orphaned = inner.orphaned, "outlined region");

        let ctx = self.context(enclosing)?;
        let wrapper = wrapper_name(&name);
        if let Some(function) = emit_wrapper(&self.cfg, &name, d, &ctx, outer)? {
            self.module.add_function(function);
            self.wrappers.insert(
                name.clone(),
                WrapperRecord {
                    wrapper: wrapper.clone(),
                    outlined: name.clone(),
                    context: enclosing.clone(),
                    simd,
                },
            );
        }
        Ok(OutlinedRegion {
            name,
            wrapper,
            simd,
            bounds,
            span: d.span,
        })
    }

    // ── parallel ──

    /// Replace a parallel construct by the dispatch for the current level.
    /// A false `if_cond` takes the serialized path.
    pub fn emit_parallel_call(
        &mut self,
        fb: &mut FnBuilder,
        region: &OutlinedRegion,
        captured: &[Value],
        if_cond: Option<Value>,
    ) -> Result<()> {
        let plan = plan_dispatch(self.level);
        let Some(cond) = if_cond else {
            return self.emit_parallel_arms(fb, region, captured, &plan.arms);
        };
        let taken = fb.compare(CmpOp::Ne, cond, 0);
        fb.begin_if(taken);
        self.emit_parallel_arms(fb, region, captured, &plan.arms)?;
        fb.begin_else();
        self.emit_serialized_parallel(fb, region, captured);
        fb.end_if();
        Ok(())
    }

    fn emit_parallel_arms(
        &mut self,
        fb: &mut FnBuilder,
        region: &OutlinedRegion,
        captured: &[Value],
        arms: &[DispatchArm],
    ) -> Result<()> {
        self.emit_arms(fb, arms, |s, fb, regime| {
            match regime {
                Regime::Level0 => s.emit_master_dispatch(fb, region),
                Regime::Level1 => s.emit_convergent_parallel(fb, region),
                Regime::Sequential => s.emit_serialized_parallel(fb, region, captured),
            }
            Ok(())
        })
    }

    /// One region in flight: wake the workers, then wait for them.
    fn emit_master_dispatch(&mut self, fb: &mut FnBuilder, region: &OutlinedRegion) {
        fb.rt_call_void(
            RuntimeFn::KernelPrepareParallel,
            vec![Value::Func(region.wrapper.clone())],
        );
        fb.barrier();
        fb.barrier();
        let work = self.level0_work.entry(fb.name().to_string()).or_default();
        if !work.contains(&region.wrapper) {
            work.push(region.wrapper.clone());
        }
    }

    fn emit_convergent_parallel(&mut self, fb: &mut FnBuilder, region: &OutlinedRegion) {
        let state = fb.alloca("task_state", self.cfg.task_state_size, 8);
        let is_final = fb.alloca("is_final", 4, 4);
        let source = fb.alloca("work_source", 4, 4);
        fb.store(0, is_final, Width::I32);
        fb.store(-1, source, Width::I32);
        fb.begin_loop(".convergent.parallel");
        let active = fb.rt_call(
            RuntimeFn::KernelConvergentParallel,
            vec![state.into(), is_final.into(), source.into()],
        );
        fb.begin_if(active);
        let src = fb.load(source, Width::I32);
        fb.call_void(Callee::Direct(region.wrapper.clone()), vec![src.into()]);
        fb.rt_call_void(RuntimeFn::KernelEndConvergentParallel, vec![state.into()]);
        fb.end_if();
        let last = fb.load(is_final, Width::I32);
        fb.begin_if(last);
        fb.break_loop();
        fb.end_if();
        fb.end_loop();
    }

    fn emit_serialized_parallel(
        &mut self,
        fb: &mut FnBuilder,
        region: &OutlinedRegion,
        captured: &[Value],
    ) {
        let loc = self.location_ident(region.span);
        let gtid = emit_global_thread_id(fb, &self.cfg);
        fb.rt_call_void(RuntimeFn::SerializedParallel, vec![loc.clone(), gtid.into()]);
        let mut args = vec![Value::Null, Value::Null];
        if region.bounds {
            args.extend([Value::Imm(0), Value::Imm(0)]);
        }
        args.extend(captured.iter().cloned());
        fb.call_void(Callee::Direct(region.name.clone()), args);
        fb.rt_call_void(RuntimeFn::EndSerializedParallel, vec![loc, gtid.into()]);
    }

    /// Location ident handed to the serialization calls.
    fn location_ident(&mut self, span: Span) -> Value {
        let name = format!("__omp_loc_{}", span.start);
        self.module.ensure_global(Global {
            name: name.clone(),
            size: LOCATION_SIZE,
            align: 8,
            addr_space: 0,
        });
        Value::Global(name)
    }

    // ── simd ──

    /// Simd regions never reach the workers: the master runs them
    /// sequentially, a Level1 group drains them convergently.
    pub fn emit_simd_call(
        &mut self,
        fb: &mut FnBuilder,
        region: &OutlinedRegion,
        captured: &[Value],
        if_cond: Option<Value>,
    ) -> Result<()> {
        let arms: Vec<DispatchArm> = plan_dispatch(self.level)
            .arms
            .into_iter()
            .map(|arm| match arm.regime {
                Regime::Level0 => DispatchArm {
                    regime: Regime::Sequential,
                    ..arm
                },
                _ => arm,
            })
            .collect();
        let Some(cond) = if_cond else {
            return self.emit_simd_arms(fb, region, captured, &arms);
        };
        let taken = fb.compare(CmpOp::Ne, cond, 0);
        fb.begin_if(taken);
        self.emit_simd_arms(fb, region, captured, &arms)?;
        fb.begin_else();
        emit_sequential_simd(fb, region, captured);
        fb.end_if();
        Ok(())
    }

    fn emit_simd_arms(
        &mut self,
        fb: &mut FnBuilder,
        region: &OutlinedRegion,
        captured: &[Value],
        arms: &[DispatchArm],
    ) -> Result<()> {
        self.emit_arms(fb, arms, |s, fb, regime| {
            match regime {
                Regime::Level1 => s.emit_convergent_simd(fb, region),
                Regime::Level0 | Regime::Sequential => emit_sequential_simd(fb, region, captured),
            }
            Ok(())
        })
    }

    fn emit_convergent_simd(&mut self, fb: &mut FnBuilder, region: &OutlinedRegion) {
        let state = fb.alloca("simd_state", self.cfg.simd_state_size, 8);
        let is_final = fb.alloca("is_final", 4, 4);
        let source = fb.alloca("work_source", 4, 4);
        let lane_id = fb.alloca("lane_id", 4, 4);
        let num_lanes = fb.alloca("num_lanes", 4, 4);
        fb.store(0, is_final, Width::I32);
        fb.store(-1, source, Width::I32);
        fb.begin_loop(".convergent.simd");
        let active = fb.rt_call(
            RuntimeFn::KernelConvergentSimd,
            vec![
                state.into(),
                is_final.into(),
                source.into(),
                lane_id.into(),
                num_lanes.into(),
            ],
        );
        fb.begin_if(active);
        let src = fb.load(source, Width::I32);
        fb.call_void(
            Callee::Direct(region.wrapper.clone()),
            vec![src.into(), lane_id.into(), num_lanes.into()],
        );
        fb.rt_call_void(RuntimeFn::KernelEndConvergentSimd, vec![state.into()]);
        fb.end_if();
        let last = fb.load(is_final, Width::I32);
        fb.begin_if(last);
        fb.break_loop();
        fb.end_if();
        fb.end_loop();
    }

    // ── teams & worksharing ──

    /// Teams bodies run inline on the master path. Team count and size
    /// are fixed by the launch.
    pub fn emit_teams_call(
        &mut self,
        fb: &mut FnBuilder,
        frame: &mut Frame,
        d: &'a Directive,
    ) -> Result<()> {
        if d.clauses.num_teams.is_some() || d.clauses.thread_limit.is_some() {
            warn!(directive = d.id.0, "num_teams and thread_limit clauses are ignored");
        }
        fb.comment(format!("{} region {}", d.kind, d.id));
        self.lower_stmt(fb, frame, &d.body)
    }

    fn emit_worksharing(
        &mut self,
        fb: &mut FnBuilder,
        frame: &mut Frame,
        d: &'a Directive,
    ) -> Result<()> {
        if d.kind.is_loop() {
            let policy = SchedulePolicy::for_clauses(&d.clauses);
            debug!(directive = d.id.0, %policy, "worksharing loop");
            fb.comment(format!("{} {}: {}", d.kind, d.id, policy));
        } else {
            fb.comment(format!("{} {}", d.kind, d.id));
        }
        self.lower_stmt(fb, frame, &d.body)
    }
}

fn emit_sequential_simd(fb: &mut FnBuilder, region: &OutlinedRegion, captured: &[Value]) {
    let lane = fb.alloca("simd.lane", 4, 4);
    let lanes = fb.alloca("simd.lanes", 4, 4);
    fb.store(0, lane, Width::I32);
    fb.store(1, lanes, Width::I32);
    let mut args = vec![Value::Reg(lane), Value::Reg(lanes)];
    args.extend(captured.iter().cloned());
    fb.call_void(Callee::Direct(region.name.clone()), args);
}
