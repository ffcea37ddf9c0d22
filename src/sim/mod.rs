//! SIMT execution of generated modules.
//!
//! A launch runs a kernel over a grid of blocks. Blocks run in parallel
//! on the rayon pool; inside a block every warp is an OS thread and every
//! lane of a warp executes in lock step under an active mask, so the
//! protocol's barriers, divergent branches and warp-collective runtime
//! calls behave the way they do on the device.

pub mod barrier;
mod interp;
pub mod memory;

use std::collections::HashMap;
use std::time::Duration;

use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::DeviceConfig;
use crate::ir::sir::{Function, Linkage, Module, Width};
use crate::omp::level::PARALLELISM_LEVELS;
use crate::runtime::{BlockRuntime, TraceEvent};

use barrier::BlockBarrier;
use interp::{BlockCtx, WarpExec};
use memory::{Cells, Memory, FUNC_BASE, GLOBAL_BASE, SHARED_BASE};

// ─── Errors ────────────────────────────────────────────────────────

/// A fault raised while executing one lane.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeFault {
    #[error("slot pool {pool} exhausted requesting {requested} bytes")]
    PoolExhausted { pool: u32, requested: u64 },
    #[error("slot pool {pool} used before initialization")]
    PoolUninitialized { pool: u32 },
    #[error("no slot pool for warp {pool}")]
    NoSuchPool { pool: u32 },
    #[error("invalid memory access at {addr:#x}")]
    InvalidAddress { addr: u64 },
    #[error("convergent step past the last active lane (after lane {after})")]
    ConvergentOverrun { after: i64 },
    #[error("call depth limit of {depth} exceeded")]
    CallDepth { depth: u32 },
}

#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid launch configuration: {0}")]
    InvalidConfig(String),
    #[error("no kernel named `{0}` in the module")]
    UnknownKernel(String),
    #[error("call to undefined function `{0}`")]
    UnknownFunction(String),
    #[error("reference to undefined global `{0}`")]
    UnknownSymbol(String),
    #[error("call to unknown external function `{0}`")]
    UnknownExtern(String),
    #[error("thread {tid} of block {block}: {fault}")]
    Fault {
        block: u32,
        tid: u32,
        #[source]
        fault: RuntimeFault,
    },
    #[error("block {block} deadlocked: {waiting} of {live} warps waiting at a barrier")]
    Deadlock { block: u32, waiting: usize, live: usize },
    #[error("block {block}: barrier abandoned by a failing warp")]
    BarrierPoisoned { block: u32 },
    #[error("warp {warp} of block {block} exceeded the step budget")]
    StepBudget { block: u32, warp: u32 },
    #[error("`{function}` takes {expected} arguments, got {got}")]
    ArgumentMismatch {
        function: String,
        expected: usize,
        got: usize,
    },
    #[error("warp {warp} of block {block} panicked")]
    WarpPanicked { block: u32, warp: u32 },
}

impl SimError {
    /// Secondary failures caused by another warp's error.
    fn is_secondary(&self) -> bool {
        matches!(self, SimError::BarrierPoisoned { .. })
    }
}

// ─── Launch configuration ──────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub threads_per_block: u32,
    pub blocks: u32,
    /// Arena bytes of each warp's slot pool.
    pub pool_capacity: u64,
    /// Ops one warp may execute before the launch is abandoned.
    pub step_budget: u64,
    pub barrier_timeout: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            threads_per_block: 128,
            blocks: 1,
            pool_capacity: 64 * 1024,
            step_budget: 10_000_000,
            barrier_timeout: Duration::from_secs(10),
        }
    }
}

impl SimConfig {
    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads_per_block = threads;
        self
    }

    pub fn with_blocks(mut self, blocks: u32) -> Self {
        self.blocks = blocks;
        self
    }

    pub fn with_pool_capacity(mut self, bytes: u64) -> Self {
        self.pool_capacity = bytes;
        self
    }

    pub fn validate(&self, device: &DeviceConfig) -> Result<(), SimError> {
        device.validate().map_err(SimError::InvalidConfig)?;
        let w = device.warp_size;
        let bad = |msg: String| Err(SimError::InvalidConfig(msg));
        if device.pointer_width != 8 {
            return bad(format!(
                "the simulator models 64-bit pointers, device has {}-byte pointers",
                device.pointer_width
            ));
        }
        if self.threads_per_block % w != 0 {
            return bad(format!(
                "threads per block ({}) must be a multiple of the warp size ({})",
                self.threads_per_block, w
            ));
        }
        if self.threads_per_block < 2 * w {
            return bad(format!(
                "threads per block ({}) must leave at least one worker warp",
                self.threads_per_block
            ));
        }
        if self.threads_per_block > device.max_threads_per_block {
            return bad(format!(
                "threads per block ({}) exceeds the device limit ({})",
                self.threads_per_block, device.max_threads_per_block
            ));
        }
        if self.blocks == 0 || self.blocks > device.max_teams {
            return bad(format!(
                "block count {} outside 1..={}",
                self.blocks, device.max_teams
            ));
        }
        if self.pool_capacity == 0 {
            return bad("pool capacity must be non-zero".to_string());
        }
        Ok(())
    }
}

/// A kernel argument. Buffers are copied into device memory before the
/// launch and read back after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelArg {
    Value(i64),
    Buffer { values: Vec<i64>, width: Width },
}

impl KernelArg {
    pub fn scalar(value: i64) -> Self {
        KernelArg::Value(value)
    }

    pub fn array(values: Vec<i64>, width: Width) -> Self {
        KernelArg::Buffer { values, width }
    }

    /// The single element of a one-element buffer, or the scalar.
    pub fn value(&self) -> Option<i64> {
        match self {
            KernelArg::Value(v) => Some(*v),
            KernelArg::Buffer { values, .. } => values.first().copied(),
        }
    }

    pub fn values(&self) -> &[i64] {
        match self {
            KernelArg::Value(v) => std::slice::from_ref(v),
            KernelArg::Buffer { values, .. } => values,
        }
    }
}

// ─── Results ───────────────────────────────────────────────────────

/// One `observe(tag, value)` call made by a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Observation {
    pub block: u32,
    pub tid: u32,
    pub tag: i64,
    pub value: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchReport {
    pub kernel: String,
    pub blocks: u32,
    pub threads_per_block: u32,
    /// Sorted by block and thread; program order within a thread.
    pub observations: Vec<Observation>,
    pub trace: Vec<TraceEvent>,
    /// `ParallelismLevel` of every lane at kernel exit, per block.
    pub final_levels: Vec<Vec<i32>>,
    pub steps: u64,
}

impl LaunchReport {
    pub fn observed(&self, tag: i64) -> impl Iterator<Item = &Observation> + '_ {
        self.observations.iter().filter(move |o| o.tag == tag)
    }
}

// ─── Program ───────────────────────────────────────────────────────

/// A module with its symbols laid out in device memory.
pub(crate) struct Program<'m> {
    module: &'m Module,
    functions: HashMap<&'m str, usize>,
    symbols: HashMap<&'m str, u64>,
    globals_end: u64,
}

impl<'m> Program<'m> {
    fn new(module: &'m Module, device: &DeviceConfig) -> Self {
        let functions = module
            .functions
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.as_str(), i))
            .collect();
        let mut symbols = HashMap::new();
        let mut global_next = GLOBAL_BASE;
        let mut shared_next = SHARED_BASE;
        for g in &module.globals {
            let cursor = if g.addr_space == device.shared_address_space {
                &mut shared_next
            } else {
                &mut global_next
            };
            let addr = align_to(*cursor, g.align.max(1) as u64);
            symbols.insert(g.name.as_str(), addr);
            *cursor = addr + g.size;
        }
        Self {
            module,
            functions,
            symbols,
            globals_end: global_next,
        }
    }

    pub(crate) fn function(&self, name: &str) -> Result<&'m Function, SimError> {
        self.functions
            .get(name)
            .map(|&i| &self.module.functions[i])
            .ok_or_else(|| SimError::UnknownFunction(name.to_string()))
    }

    pub(crate) fn function_addr(&self, name: &str) -> Result<u64, SimError> {
        self.functions
            .get(name)
            .map(|&i| FUNC_BASE + i as u64)
            .ok_or_else(|| SimError::UnknownFunction(name.to_string()))
    }

    pub(crate) fn symbol(&self, name: &str) -> Result<u64, SimError> {
        self.symbols
            .get(name)
            .copied()
            .ok_or_else(|| SimError::UnknownSymbol(name.to_string()))
    }
}

fn align_to(addr: u64, align: u64) -> u64 {
    addr.div_ceil(align) * align
}

// ─── Launch ────────────────────────────────────────────────────────

struct BlockOutcome {
    observations: Vec<Observation>,
    trace: Vec<TraceEvent>,
    levels: Vec<i32>,
    steps: u64,
}

/// Run `kernel` over the grid described by `sim`.
///
/// Buffer arguments are updated in place with the memory contents at
/// kernel exit.
pub fn launch(
    module: &Module,
    kernel: &str,
    args: &mut [KernelArg],
    sim: &SimConfig,
    device: &DeviceConfig,
) -> Result<LaunchReport, SimError> {
    sim.validate(device)?;
    let entry = module
        .function(kernel)
        .filter(|f| f.linkage == Linkage::Kernel)
        .ok_or_else(|| SimError::UnknownKernel(kernel.to_string()))?;
    if entry.params.len() != args.len() {
        return Err(SimError::ArgumentMismatch {
            function: kernel.to_string(),
            expected: entry.params.len(),
            got: args.len(),
        });
    }

    let program = Program::new(module, device);
    let global = Cells::new();
    let mut next = align_to(program.globals_end, 8);
    let mut argv = Vec::with_capacity(args.len());
    let mut buffers = Vec::new();
    for (i, arg) in args.iter().enumerate() {
        match arg {
            KernelArg::Value(v) => argv.push(*v),
            KernelArg::Buffer { values, width } => {
                let base = next;
                for (k, v) in values.iter().enumerate() {
                    global.store(base + k as u64 * width.bytes() as u64, memory::truncate(*v, *width));
                }
                next = align_to(base + (values.len().max(1) as u64) * width.bytes() as u64, 8);
                buffers.push((i, base));
                argv.push(base as i64);
            }
        }
    }
    info!(
        kernel,
        blocks = sim.blocks,
        threads = sim.threads_per_block,
        "launching kernel"
    );

    let outcomes: Vec<Result<BlockOutcome, SimError>> = (0..sim.blocks)
        .into_par_iter()
        .map(|block| run_block(&program, entry, &argv, block, sim, device, &global))
        .collect();

    let mut report = LaunchReport {
        kernel: kernel.to_string(),
        blocks: sim.blocks,
        threads_per_block: sim.threads_per_block,
        observations: Vec::new(),
        trace: Vec::new(),
        final_levels: Vec::with_capacity(sim.blocks as usize),
        steps: 0,
    };
    for outcome in outcomes {
        let outcome = outcome?;
        report.observations.extend(outcome.observations);
        report.trace.extend(outcome.trace);
        report.final_levels.push(outcome.levels);
        report.steps += outcome.steps;
    }
    report.observations.sort_by_key(|o| (o.block, o.tid));

    for (i, base) in buffers {
        if let KernelArg::Buffer { values, width } = &mut args[i] {
            for (k, v) in values.iter_mut().enumerate() {
                *v = memory::truncate(global.load(base + k as u64 * width.bytes() as u64), *width);
            }
        }
    }
    info!(kernel, steps = report.steps, "kernel finished");
    Ok(report)
}

fn run_block(
    program: &Program<'_>,
    entry: &Function,
    argv: &[i64],
    block: u32,
    sim: &SimConfig,
    device: &DeviceConfig,
    global: &Cells,
) -> Result<BlockOutcome, SimError> {
    let warp_size = device.warp_size;
    let warps = sim.threads_per_block / warp_size;
    let mem = Memory::new(global);
    let barrier = BlockBarrier::new(block, warps as usize, sim.barrier_timeout);
    let runtime = BlockRuntime::new(block, warp_size, warps, sim.pool_capacity);
    let ctx = BlockCtx {
        block,
        threads: sim.threads_per_block,
        warp_size,
        mem: &mem,
        barrier: &barrier,
        runtime: &runtime,
        step_budget: sim.step_budget,
    };

    let results: Vec<Result<(Vec<Observation>, u64), SimError>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..warps)
            .map(|warp| {
                let ctx = &ctx;
                s.spawn(move || {
                    let mut exec = WarpExec::new(program, ctx, warp);
                    let result = exec.run_kernel(entry, argv);
                    match &result {
                        Ok(()) => ctx.barrier.retire(),
                        Err(e) => {
                            debug!(block, warp, error = %e, "warp failed");
                            ctx.barrier.poison();
                        }
                    }
                    result.map(|()| exec.finish())
                })
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(warp, h)| {
                h.join().unwrap_or_else(|_| {
                    barrier.poison();
                    Err(SimError::WarpPanicked {
                        block,
                        warp: warp as u32,
                    })
                })
            })
            .collect()
    });

    let mut observations = Vec::new();
    let mut steps = 0;
    let mut first_error: Option<SimError> = None;
    for result in results {
        match result {
            Ok((obs, n)) => {
                observations.extend(obs);
                steps += n;
            }
            Err(e) => {
                let replace = match &first_error {
                    None => true,
                    Some(prev) => prev.is_secondary() && !e.is_secondary(),
                };
                if replace {
                    first_error = Some(e);
                }
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    let levels = match program.symbol(PARALLELISM_LEVELS) {
        Ok(base) => (0..sim.threads_per_block)
            .map(|tid| {
                mem.load(base + tid as u64 * 4, Width::I32)
                    .map(|v| v as i32)
                    .map_err(|fault| SimError::Fault { block, tid, fault })
            })
            .collect::<Result<Vec<_>, _>>()?,
        Err(_) => Vec::new(),
    };
    Ok(BlockOutcome {
        observations,
        trace: runtime.take_trace(),
        levels,
        steps,
    })
}
