//! Kernel entries, initializers and worker loops.
//!
//! A kernel entry is entered by every lane of the block. Its initializer
//! sorts the lanes: workers set up their warp's slot pool and park in the
//! worker loop, the master sets up the master pool and runs the
//! sequential kernel body, everything else goes straight to the exit.
//! Workers only learn which wrappers they may be handed once the whole
//! module is known, so initializers and workers are emitted last.

use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::abi::RuntimeFn;
use crate::directive::{CaptureKind, CaptureTarget, Directive, FunctionDecl};
use crate::error::{CodegenError, Result};
use crate::ir::sir::{
    Annotation, BinOp, Callee, CmpOp, FnBuilder, Function, Global, Linkage, Module, Special, Value,
    Width,
};
use crate::omp::callgraph::CallGraph;
use crate::omp::level::{
    emit_lane_id, emit_level_addr, emit_master_thread_id, emit_thread_id, emit_thread_limit,
    emit_warp_id, StaticLevel, PARALLELISM_LEVELS,
};
use crate::omp::lower::{frame_locals, FrameKind, FrameSpec, Incoming};
use crate::omp::session::{CodegenSession, EntryFunctionRecord, EXIT_LABEL};
use crate::omp::sharing::infra::width_of;
use crate::omp::sharing::ContextId;

/// Device global holding every team's root slots.
pub const SHARED_DATA_SLOTS: &str = "__openmp_nvptx_shared_data_slots";

pub fn kernel_name(parent: &str, target: &Directive) -> String {
    format!("__omp_offloading_{}_r{}", parent, target.id.0)
}

pub fn initializer_name(entry: &str) -> String {
    format!("__omp_kernel_initialization_{}", entry)
}

pub fn worker_name(entry: &str) -> String {
    format!("{}_worker", entry)
}

impl<'a> CodegenSession<'a> {
    // ─── Entry ────────────────────────────────────────────────────

    pub(crate) fn gen_kernel_entry(
        &mut self,
        parent: &'a FunctionDecl,
        target: &'a Directive,
    ) -> Result<()> {
        let name = kernel_name(&parent.name, target);
        let mut fb = FnBuilder::new(name.clone(), Linkage::Kernel);

        let mut incoming = Vec::with_capacity(target.captures.len());
        let mut this = None;
        for cap in &target.captures {
            let v = match cap.target {
                CaptureTarget::This => {
                    this = Some(fb.param("this", Width::Ptr));
                    continue;
                }
                CaptureTarget::Var(v) => v,
            };
            let decl = self.index.var(v, target.span)?;
            if cap.kind == CaptureKind::Vla || decl.ty.is_vla() {
                return Err(CodegenError::VlaCapture {
                    name: decl.name.clone(),
                    region: "target".to_string(),
                    span: target.span,
                });
            }
            let binding = match cap.kind {
                CaptureKind::ByCopy => {
                    Incoming::Value(fb.param(decl.name.clone(), width_of(&decl.ty)))
                }
                _ => Incoming::Address(fb.param(decl.name.clone(), Width::Ptr)),
            };
            incoming.push((v, binding));
        }

        let spec = FrameSpec {
            kind: FrameKind::Kernel,
            context: ContextId::Region(target.id),
            incoming,
            locals: frame_locals(&target.body, &target.locals),
            this,
            simd_lanes: None,
            span: target.span,
        };

        let init = fb.call(Callee::Direct(initializer_name(&name)), Vec::new());
        let is_master = fb.compare(CmpOp::Eq, init, 0);
        fb.begin_if(is_master);
        let shared_locals = self.with_level(StaticLevel::kernel(), |s| {
            let mut frame = s.open_frame(&mut fb, spec)?;
            let limit = emit_thread_limit(&mut fb, &s.cfg);
            fb.rt_call_void(RuntimeFn::KernelInit, vec![Value::Imm(0), limit.into()]);
            if target.kind.is_teams() {
                s.emit_teams_call(&mut fb, &mut frame, target)?;
            } else {
                s.lower_stmt(&mut fb, &mut frame, &target.body)?;
            }
            fb.comment("kernel footer");
            fb.rt_call_void(RuntimeFn::KernelDeinit, Vec::new());
            fb.barrier();
            s.close_frame(&mut fb, &frame);
            Ok(frame.context.captures.len())
        })?;
        fb.end_if();
        fb.comment(EXIT_LABEL);
        fb.ret(None);
        self.module.add_function(fb.finish());

        info!(entry = %name, parent = %parent.name, shared_locals, "generated kernel entry");
        self.entries.insert(
            name.clone(),
            EntryFunctionRecord {
                worker: worker_name(&name),
                initializer: initializer_name(&name),
                entry: name,
                exit_label: EXIT_LABEL.to_string(),
                shared_locals,
                finalized: false,
            },
        );
        Ok(())
    }

    // ─── Finalization ─────────────────────────────────────────────

    /// Emit every entry's initializer and worker, declare the protocol
    /// globals and hand the module over.
    pub fn finalize_module(mut self) -> Result<Module> {
        let graph = CallGraph::build(&self.module);
        let mut reached = BTreeSet::new();

        let entries: Vec<String> = self.entries.keys().cloned().collect();
        for entry in &entries {
            let reachable = graph.reachable_from(entry);
            let mut work: Vec<String> = Vec::new();
            for f in &self.module.functions {
                if !reachable.contains(&f.name) {
                    continue;
                }
                for w in self.level0_work.get(&f.name).into_iter().flatten() {
                    if !work.contains(w) {
                        work.push(w.clone());
                    }
                }
            }
            reached.extend(reachable);

            let worker = self.emit_worker(entry, &work);
            let initializer = self.emit_initializer(entry)?;
            self.module.add_function(worker);
            self.module.add_function(initializer);
            self.module.annotations.push(Annotation {
                symbol: entry.clone(),
                key: "kernel".to_string(),
                value: 1,
            });
            if let Some(record) = self.entries.get_mut(entry) {
                record.finalized = true;
            }
            info!(entry = %entry, work = work.len(), "finalized kernel entry");
        }

        self.module.ensure_global(Global {
            name: PARALLELISM_LEVELS.to_string(),
            size: self.cfg.max_threads_per_block as u64 * 4,
            align: 4,
            addr_space: self.cfg.shared_address_space,
        });
        self.module.ensure_global(Global {
            name: SHARED_DATA_SLOTS.to_string(),
            size: self.cfg.team_root_bytes() * self.cfg.max_teams as u64,
            align: 8,
            addr_space: 0,
        });

        for f in &self.module.functions {
            let device = self.index.function(&f.name).is_some_and(|d| d.device);
            if device && !reached.contains(&f.name) {
                warn!(function = %f.name, "device function is not reachable from any kernel");
            }
        }

        for record in self.entries.values() {
            let complete = record.finalized
                && self.module.function(&record.worker).is_some()
                && self.module.function(&record.initializer).is_some();
            if !complete {
                return Err(CodegenError::IncompleteEntry {
                    entry: record.entry.clone(),
                });
            }
        }
        info!(
            module = %self.module.name,
            functions = self.module.functions.len(),
            globals = self.module.globals.len(),
            "module finalized"
        );
        Ok(self.module)
    }

    /// `<entry>_worker`: wait for work, run it, repeat until the master
    /// publishes a null work function.
    fn emit_worker(&self, entry: &str, work: &[String]) -> Function {
        let mut fb = FnBuilder::new(worker_name(entry), Linkage::Helper);
        fb.set_noinline();
        let ptr = self.cfg.pointer_width;
        let work_fn = fb.alloca("work_fn", ptr, ptr);
        let exec_status = fb.alloca("exec_status", 1, 1);
        fb.store(Value::Null, work_fn, Width::Ptr);

        fb.begin_loop(".await.work");
        fb.barrier();
        fb.store(0, exec_status, Width::I8);
        let active = fb.rt_call(RuntimeFn::KernelParallel, vec![work_fn.into()]);
        fb.store(active, exec_status, Width::I8);
        let w = fb.load(work_fn, Width::Ptr);
        let done = fb.compare(CmpOp::Eq, w, Value::Null);
        fb.begin_if(done);
        fb.break_loop();
        fb.end_if();

        let status = fb.load(exec_status, Width::I8);
        fb.begin_if(status);
        fb.comment(".execute.parallel");
        let master = emit_master_thread_id(&mut fb, &self.cfg);
        for (i, wrapper) in work.iter().enumerate() {
            let hit = fb.compare(CmpOp::Eq, w, Value::Func(wrapper.clone()));
            fb.begin_if(hit);
            fb.call_void(Callee::Direct(wrapper.clone()), vec![master.into()]);
            if i + 1 < work.len() {
                fb.begin_else();
            }
        }
        for _ in work {
            fb.end_if();
        }
        fb.rt_call_void(RuntimeFn::KernelEndParallel, Vec::new());
        fb.end_if();
        fb.barrier();
        fb.end_loop();
        fb.ret(None);
        fb.finish()
    }

    /// `__omp_kernel_initialization_<entry>`: returns 0 on the master lane
    /// only, after the workers have gone through the worker loop.
    fn emit_initializer(&self, entry: &str) -> Result<Function> {
        let team_stride = u32::try_from(self.cfg.team_root_bytes()).map_err(|_| {
            CodegenError::Config(format!(
                "team root slots of {} bytes exceed the address range",
                self.cfg.team_root_bytes()
            ))
        })?;
        let mut fb = FnBuilder::new(initializer_name(entry), Linkage::Helper);
        fb.set_returns(Width::I32);
        let ret = fb.alloca("retval", 4, 4);
        fb.store(1, ret, Width::I32);

        let level = emit_level_addr(&mut fb);
        fb.store(0, level, Width::I32);

        let tid = emit_thread_id(&mut fb);
        let limit = emit_thread_limit(&mut fb, &self.cfg);
        let block = fb.special(Special::BlockId);
        let team = fb.elem_addr(
            Value::Global(SHARED_DATA_SLOTS.to_string()),
            0,
            block,
            team_stride,
        );

        let is_worker = fb.compare(CmpOp::Ult, tid, limit);
        fb.begin_if(is_worker);
        let mask = fb.rt_call(RuntimeFn::WarpActiveThreadMask, Vec::new());
        let lane = emit_lane_id(&mut fb, &self.cfg);
        let bit = fb.binary(BinOp::Shl, 1, lane);
        let below = fb.binary(BinOp::Sub, bit, 1);
        let lower = fb.binary(BinOp::And, mask, below);
        let rank = fb.popcount(lower);
        let leader = fb.compare(CmpOp::Eq, rank, 0);
        fb.begin_if(leader);
        let warp = emit_warp_id(&mut fb, &self.cfg);
        let slot = fb.elem_addr(
            team,
            self.cfg.master_slot_bytes(),
            warp,
            self.cfg.worker_warp_slot_bytes(),
        );
        fb.rt_call_void(
            RuntimeFn::InitializeDataSharingEnvironment,
            vec![slot.into(), self.cfg.worker_warp_slot_size().into()],
        );
        fb.end_if();
        fb.call_void(Callee::Direct(worker_name(entry)), Vec::new());
        fb.begin_else();
        let master = emit_master_thread_id(&mut fb, &self.cfg);
        let is_master = fb.compare(CmpOp::Eq, tid, master);
        fb.begin_if(is_master);
        fb.rt_call_void(
            RuntimeFn::InitializeDataSharingEnvironment,
            vec![team.into(), self.cfg.slot_size.into()],
        );
        fb.store(0, ret, Width::I32);
        fb.end_if();
        fb.end_if();

        let out = fb.load(ret, Width::I32);
        fb.ret(Some(out.into()));
        Ok(fb.finish())
    }
}
