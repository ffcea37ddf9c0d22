//! Reference model of the device runtime library.
//!
//! The code generator only fixes the runtime's ABI. This module gives the
//! entry points concrete semantics so generated kernels can be executed by
//! the simulator: team state for the master–worker handshake, the
//! convergent step, and one slot pool per warp for data-sharing frames.
//!
//! Every entry point is invoked once per warp with the mask of lanes that
//! reached the call; warp-collective entry points act on the mask as a
//! whole, the others once per lane.

pub mod pool;

use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

use crate::abi::RuntimeFn;
use crate::ir::sir::Width;
use crate::omp::level::Regime;
use crate::sim::memory::{Memory, POOL_BASE};
use crate::sim::RuntimeFault;

pub use pool::{SavedState, SlotPool, SLOT_HEADER};

// ─── Types ─────────────────────────────────────────────────────────

/// One call into the runtime from a warp.
pub struct RuntimeCall<'a> {
    pub warp: u32,
    /// Active lanes of the warp, bit `i` for lane `i`.
    pub mask: u64,
    /// Argument values, `args[arg][lane]`.
    pub args: &'a [Vec<i64>],
}

impl RuntimeCall<'_> {
    pub fn lanes(&self) -> impl Iterator<Item = usize> + '_ {
        (0..64).filter(move |l| self.mask >> l & 1 == 1)
    }

    fn arg(&self, index: usize, lane: usize) -> i64 {
        self.args
            .get(index)
            .and_then(|a| a.get(lane))
            .copied()
            .unwrap_or(0)
    }

    fn first_lane(&self) -> Option<usize> {
        (self.mask != 0).then(|| self.mask.trailing_zeros() as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceKind {
    /// The lane entered a parallel or simd region in `regime`.
    Region { regime: Regime },
    /// `kernel_parallel` handed the lane a work function.
    WorkerDispatch { work_fn: u64 },
    /// A convergent step selected `source`.
    ConvergentIteration { source: i32, is_final: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TraceEvent {
    pub block: u32,
    pub tid: u32,
    #[serde(flatten)]
    pub kind: TraceKind,
}

/// The runtime as the simulator sees it.
///
/// Returns one result per lane of the warp; lanes outside the mask get 0.
pub trait DeviceRuntime: Sync {
    fn invoke(
        &self,
        mem: &Memory<'_>,
        rt: RuntimeFn,
        call: &RuntimeCall<'_>,
    ) -> Result<Vec<i64>, RuntimeFault>;
}

// ─── Block runtime ─────────────────────────────────────────────────

#[derive(Debug, Default)]
struct TeamState {
    thread_limit: u32,
    work_fn: u64,
}

/// Runtime state of one block.
pub struct BlockRuntime {
    block: u32,
    warp_size: u32,
    team: Mutex<TeamState>,
    /// One pool per warp; the master warp's pool is the master pool.
    pools: Vec<Mutex<SlotPool>>,
    trace: Mutex<Vec<TraceEvent>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl BlockRuntime {
    pub fn new(block: u32, warp_size: u32, warps: u32, pool_capacity: u64) -> Self {
        let pools = (0..warps)
            .map(|w| {
                let base = POOL_BASE + w as u64 * pool_capacity;
                Mutex::new(SlotPool::new(w, base, pool_capacity))
            })
            .collect();
        Self {
            block,
            warp_size,
            team: Mutex::new(TeamState::default()),
            pools,
            trace: Mutex::new(Vec::new()),
        }
    }

    pub fn take_trace(&self) -> Vec<TraceEvent> {
        std::mem::take(&mut *lock(&self.trace))
    }

    fn tid(&self, warp: u32, lane: usize) -> u32 {
        warp * self.warp_size + lane as u32
    }

    fn record(&self, warp: u32, lane: usize, kind: TraceKind) {
        lock(&self.trace).push(TraceEvent {
            block: self.block,
            tid: self.tid(warp, lane),
            kind,
        });
    }

    fn pool(&self, warp: u32) -> Result<MutexGuard<'_, SlotPool>, RuntimeFault> {
        self.pools
            .get(warp as usize)
            .map(lock)
            .ok_or(RuntimeFault::NoSuchPool { pool: warp })
    }

    fn convergent_step(
        &self,
        mem: &Memory<'_>,
        call: &RuntimeCall<'_>,
        simd: bool,
        out: &mut [i64],
    ) -> Result<(), RuntimeFault> {
        for lane in call.lanes() {
            let state = call.arg(0, lane) as u64;
            let is_final = call.arg(1, lane) as u64;
            let source = call.arg(2, lane) as u64;
            let src = mem.load(source, Width::I32)?;
            if src == -1 {
                mem.store(state, Width::I64, call.mask as i64)?;
                self.record(call.warp, lane, TraceKind::Region {
                    regime: Regime::Level1,
                });
            }
            let mask = mem.load(state, Width::I64)? as u64;
            let start = (src + 1) as u32;
            let rest = mask.checked_shr(start).unwrap_or(0);
            if rest == 0 {
                return Err(RuntimeFault::ConvergentOverrun { after: src });
            }
            let next = start + rest.trailing_zeros();
            let last = mask.checked_shr(next).unwrap_or(0).count_ones() == 1;
            mem.store(source, Width::I32, next as i64)?;
            mem.store(is_final, Width::I32, last as i64)?;
            if simd {
                let below = (1u64 << lane) - 1;
                mem.store(
                    call.arg(3, lane) as u64,
                    Width::I32,
                    (mask & below).count_ones() as i64,
                )?;
                mem.store(call.arg(4, lane) as u64, Width::I32, mask.count_ones() as i64)?;
            }
            self.record(call.warp, lane, TraceKind::ConvergentIteration {
                source: next as i32,
                is_final: last,
            });
            out[lane] = 1;
        }
        Ok(())
    }

    fn begin(
        &self,
        mem: &Memory<'_>,
        call: &RuntimeCall<'_>,
        out: &mut [i64],
    ) -> Result<(), RuntimeFault> {
        let mut pool = self.pool(call.warp)?;
        let saved = pool.state();
        for lane in call.lanes() {
            mem.store(call.arg(0, lane) as u64, Width::Ptr, saved.slot as i64)?;
            mem.store(call.arg(1, lane) as u64, Width::Ptr, saved.stack as i64)?;
            mem.store(call.arg(2, lane) as u64, Width::Ptr, saved.frame as i64)?;
            mem.store(call.arg(3, lane) as u64, Width::Ptr, saved.active as i64)?;
        }
        let Some(first) = call.first_lane() else {
            return Ok(());
        };
        let size = call.arg(4, first) as u64;
        let default_size = call.arg(5, first) as u64;
        let data = pool.begin(mem, size, default_size, call.mask)?;
        for lane in call.lanes() {
            out[lane] = data as i64;
        }
        Ok(())
    }

    fn end(&self, mem: &Memory<'_>, call: &RuntimeCall<'_>) -> Result<(), RuntimeFault> {
        let Some(first) = call.first_lane() else {
            return Ok(());
        };
        let cell = |i: usize| -> Result<u64, RuntimeFault> {
            Ok(mem.load(call.arg(i, first) as u64, Width::Ptr)? as u64)
        };
        let saved = SavedState {
            slot: cell(0)?,
            stack: cell(1)?,
            frame: cell(2)?,
            active: cell(3)?,
        };
        self.pool(call.warp)?.restore(saved);
        Ok(())
    }
}

impl DeviceRuntime for BlockRuntime {
    fn invoke(
        &self,
        mem: &Memory<'_>,
        rt: RuntimeFn,
        call: &RuntimeCall<'_>,
    ) -> Result<Vec<i64>, RuntimeFault> {
        let mut out = vec![0; self.warp_size as usize];
        match rt {
            RuntimeFn::KernelInit => {
                if let Some(lane) = call.first_lane() {
                    lock(&self.team).thread_limit = call.arg(1, lane) as u32;
                }
            }
            RuntimeFn::KernelDeinit => lock(&self.team).work_fn = 0,
            RuntimeFn::KernelPrepareParallel => {
                if let Some(lane) = call.first_lane() {
                    lock(&self.team).work_fn = call.arg(0, lane) as u64;
                    self.record(call.warp, lane, TraceKind::Region {
                        regime: Regime::Level0,
                    });
                }
            }
            RuntimeFn::KernelParallel => {
                let (limit, work_fn) = {
                    let team = lock(&self.team);
                    (team.thread_limit, team.work_fn)
                };
                for lane in call.lanes() {
                    mem.store(call.arg(0, lane) as u64, Width::Ptr, work_fn as i64)?;
                    let active = self.tid(call.warp, lane) < limit && work_fn != 0;
                    if active {
                        self.record(call.warp, lane, TraceKind::WorkerDispatch { work_fn });
                    }
                    out[lane] = active as i64;
                }
            }
            RuntimeFn::SerializedParallel => {
                for lane in call.lanes() {
                    self.record(call.warp, lane, TraceKind::Region {
                        regime: Regime::Sequential,
                    });
                }
            }
            RuntimeFn::KernelConvergentParallel => self.convergent_step(mem, call, false, &mut out)?,
            RuntimeFn::KernelConvergentSimd => self.convergent_step(mem, call, true, &mut out)?,
            RuntimeFn::WarpActiveThreadMask => {
                for lane in call.lanes() {
                    out[lane] = call.mask as i64;
                }
            }
            RuntimeFn::InitializeDataSharingEnvironment => {
                for lane in call.lanes() {
                    let slot = call.arg(0, lane) as u64;
                    let size = call.arg(1, lane) as u64;
                    self.pool(call.warp)?.initialize(mem, slot, size)?;
                }
            }
            RuntimeFn::DataSharingEnvironmentBegin => self.begin(mem, call, &mut out)?,
            RuntimeFn::DataSharingEnvironmentEnd => self.end(mem, call)?,
            RuntimeFn::GetDataSharingEnvironmentFrame => {
                for lane in call.lanes() {
                    let src = call.arg(0, lane) as u32;
                    out[lane] = self.pool(src / self.warp_size)?.frame()? as i64;
                }
            }
            RuntimeFn::EndSerializedParallel
            | RuntimeFn::KernelEndParallel
            | RuntimeFn::KernelEndConvergentParallel
            | RuntimeFn::KernelEndConvergentSimd => {}
        }
        Ok(out)
    }
}
