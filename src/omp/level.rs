//! Parallelism level classification.
//!
//! Static nesting information decides which of the three execution
//! regimes a construct can be reached in; the per-lane runtime counter
//! disambiguates whatever the static information cannot.
//!
//! Regimes:
//!   Level0      the block master, running sequential kernel code
//!   Level1      a worker lane running a dispatched parallel region
//!   Sequential  anything nested deeper, executed serialized in place

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::DeviceConfig;
use crate::ir::sir::{BinOp, CmpOp, FnBuilder, Reg, Special, Value, Width};

/// Global holding one `ParallelismLevel` counter per lane of the block.
pub const PARALLELISM_LEVELS: &str = "__openmp_nvptx_parallelism_levels";

/// Counter increment on entering a parallel region body.
pub const PARALLEL_LEVEL_STEP: i64 = 1;
/// Counter increment on entering a simd region body.
pub const SIMD_LEVEL_STEP: i64 = 10;

// ─── Static information ───────────────────────────────────────────

/// Lexical nesting depth at the construct being generated, plus whether
/// the enclosing code has no statically known parallel context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StaticLevel {
    pub nesting: i32,
    pub orphaned: bool,
}

impl StaticLevel {
    pub fn kernel() -> Self {
        Self {
            nesting: 0,
            orphaned: false,
        }
    }

    pub fn orphaned() -> Self {
        Self {
            nesting: 0,
            orphaned: true,
        }
    }

    pub fn nested(self, step: i64) -> Self {
        Self {
            nesting: self.nesting + step as i32,
            orphaned: self.orphaned,
        }
    }

    pub fn only_level0(&self) -> bool {
        !self.orphaned && self.nesting == 0
    }

    pub fn only_level1(&self) -> bool {
        !self.orphaned && self.nesting == 1
    }

    pub fn only_sequential(&self) -> bool {
        !self.orphaned && !self.only_level0() && !self.only_level1()
    }
}

// ─── Dispatch plan ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Level0,
    Level1,
    Sequential,
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Regime::Level0 => "level0",
            Regime::Level1 => "level1",
            Regime::Sequential => "sequential",
        };
        f.write_str(s)
    }
}

/// Runtime predicate guarding one arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    /// Statically known to hold.
    Always,
    /// `threadId == masterThreadId`
    MasterThread,
    /// `ParallelismLevel == 0`: a worker servicing the master's dispatch.
    LevelIsZero,
    /// `ParallelismLevel == 1`
    LevelIsOne,
    /// `ParallelismLevel > 1`
    LevelAboveOne,
}

impl Guard {
    fn holds(self, tid: u32, master_tid: u32, level: i32) -> bool {
        match self {
            Guard::Always => true,
            Guard::MasterThread => tid == master_tid,
            Guard::LevelIsZero => level == 0,
            Guard::LevelIsOne => level == 1,
            Guard::LevelAboveOne => level > 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchArm {
    pub regime: Regime,
    pub guard: Guard,
}

/// Ordered arms of a three-way dispatch; emitted as an if-chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPlan {
    pub arms: Vec<DispatchArm>,
}

impl DispatchPlan {
    pub fn regimes(&self) -> Vec<Regime> {
        self.arms.iter().map(|a| a.regime).collect()
    }

    pub fn contains(&self, regime: Regime) -> bool {
        self.arms.iter().any(|a| a.regime == regime)
    }

    /// The arm a lane takes: the first whose guard holds.
    pub fn select(&self, tid: u32, master_tid: u32, level: i32) -> Option<Regime> {
        self.arms
            .iter()
            .find(|a| a.guard.holds(tid, master_tid, level))
            .map(|a| a.regime)
    }
}

/// Minimal guard set for a construct at `level`.
///
/// An arm is dropped when the static information rules its regime out and
/// its guard is dropped when the static information proves it.
pub fn plan_dispatch(level: StaticLevel) -> DispatchPlan {
    let only0 = level.only_level0();
    let only1 = level.only_level1();
    let only_seq = level.only_sequential();

    let mut arms = Vec::with_capacity(3);
    if !only1 && !only_seq {
        arms.push(DispatchArm {
            regime: Regime::Level0,
            guard: if only0 { Guard::Always } else { Guard::MasterThread },
        });
    }
    if !only0 && !only_seq {
        arms.push(DispatchArm {
            regime: Regime::Level1,
            guard: if only1 { Guard::Always } else { Guard::LevelIsOne },
        });
    }
    if !only0 && !only1 {
        arms.push(DispatchArm {
            regime: Regime::Sequential,
            guard: if only_seq {
                Guard::Always
            } else {
                Guard::LevelAboveOne
            },
        });
    }
    DispatchPlan { arms }
}

// ─── IR helpers ───────────────────────────────────────────────────

pub fn emit_thread_id(fb: &mut FnBuilder) -> Reg {
    fb.special(Special::ThreadId)
}

/// `(N - 1) & ~(W - 1)`
pub fn emit_master_thread_id(fb: &mut FnBuilder, cfg: &DeviceConfig) -> Reg {
    let n = fb.special(Special::BlockDim);
    let last = fb.binary(BinOp::Sub, n, 1);
    fb.binary(BinOp::And, last, !(cfg.lane_mask() as i64))
}

/// `tid & (master - 1)`
pub fn emit_team_thread_id(fb: &mut FnBuilder, cfg: &DeviceConfig) -> Reg {
    let tid = emit_thread_id(fb);
    let master = emit_master_thread_id(fb, cfg);
    let mask = fb.binary(BinOp::Sub, master, 1);
    fb.binary(BinOp::And, tid, mask)
}

/// `N - W`: lanes below this id are workers.
pub fn emit_thread_limit(fb: &mut FnBuilder, cfg: &DeviceConfig) -> Reg {
    let n = fb.special(Special::BlockDim);
    fb.binary(BinOp::Sub, n, cfg.warp_size)
}

/// `block * (N - W) + team_tid`
pub fn emit_global_thread_id(fb: &mut FnBuilder, cfg: &DeviceConfig) -> Reg {
    let block = fb.special(Special::BlockId);
    let workers = emit_thread_limit(fb, cfg);
    let base = fb.binary(BinOp::Mul, block, workers);
    let team = emit_team_thread_id(fb, cfg);
    fb.binary(BinOp::Add, base, team)
}

pub fn emit_warp_id(fb: &mut FnBuilder, cfg: &DeviceConfig) -> Reg {
    let tid = emit_thread_id(fb);
    fb.binary(BinOp::LShr, tid, cfg.warp_log2())
}

pub fn emit_lane_id(fb: &mut FnBuilder, cfg: &DeviceConfig) -> Reg {
    let tid = emit_thread_id(fb);
    fb.binary(BinOp::And, tid, cfg.lane_mask())
}

/// Address of this lane's `ParallelismLevel` counter.
pub fn emit_level_addr(fb: &mut FnBuilder) -> Reg {
    let tid = emit_thread_id(fb);
    fb.elem_addr(Value::Global(PARALLELISM_LEVELS.to_string()), 0, tid, 4)
}

pub fn emit_level_adjust(fb: &mut FnBuilder, delta: i64) {
    let addr = emit_level_addr(fb);
    let cur = fb.load(addr, Width::I32);
    let next = fb.binary(BinOp::Add, cur, delta);
    fb.store(next, addr, Width::I32);
}

/// Evaluate a guard for the current lane.
pub fn emit_guard(fb: &mut FnBuilder, cfg: &DeviceConfig, guard: Guard) -> Value {
    match guard {
        Guard::Always => Value::Imm(1),
        Guard::MasterThread => {
            let tid = emit_thread_id(fb);
            let master = emit_master_thread_id(fb, cfg);
            fb.compare(CmpOp::Eq, tid, master).into()
        }
        Guard::LevelIsZero => {
            let addr = emit_level_addr(fb);
            let level = fb.load(addr, Width::I32);
            fb.compare(CmpOp::Eq, level, 0).into()
        }
        Guard::LevelIsOne => {
            let addr = emit_level_addr(fb);
            let level = fb.load(addr, Width::I32);
            fb.compare(CmpOp::Eq, level, 1).into()
        }
        Guard::LevelAboveOne => {
            let addr = emit_level_addr(fb);
            let level = fb.load(addr, Width::I32);
            fb.compare(CmpOp::Sgt, level, 1).into()
        }
    }
}

/// Open the guard of arm `i` of a plan. Returns whether an `if` was opened.
///
/// Callers emit the arm body, then call `next_arm` to continue the chain
/// and `close_dispatch` once every arm has been emitted.
pub fn open_arm(fb: &mut FnBuilder, cfg: &DeviceConfig, arm: &DispatchArm) -> bool {
    if arm.guard == Guard::Always {
        return false;
    }
    let cond = emit_guard(fb, cfg, arm.guard);
    fb.begin_if(cond);
    true
}

pub fn next_arm(fb: &mut FnBuilder, opened: bool) {
    if opened {
        fb.begin_else();
    }
}

pub fn close_dispatch(fb: &mut FnBuilder, opened: usize) {
    for _ in 0..opened {
        fb.end_if();
    }
}

/// Emit `arms` as one if-chain, filling each arm with `arm_body`.
pub fn emit_level_dispatch(
    fb: &mut FnBuilder,
    cfg: &DeviceConfig,
    arms: &[DispatchArm],
    mut arm_body: impl FnMut(&mut FnBuilder, Regime),
) {
    let mut opened = 0;
    for (i, arm) in arms.iter().enumerate() {
        let guarded = open_arm(fb, cfg, arm);
        if guarded {
            opened += 1;
        }
        arm_body(fb, arm.regime);
        if i + 1 < arms.len() {
            next_arm(fb, guarded);
        }
    }
    close_dispatch(fb, opened);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::sir::Linkage;
    use proptest::prelude::*;

    #[test]
    fn test_plan_kernel_level_is_single_unguarded_arm() {
        let plan = plan_dispatch(StaticLevel::kernel());
        assert_eq!(
            plan.arms,
            vec![DispatchArm {
                regime: Regime::Level0,
                guard: Guard::Always
            }]
        );
    }

    #[test]
    fn test_plan_inside_parallel() {
        let plan = plan_dispatch(StaticLevel::kernel().nested(PARALLEL_LEVEL_STEP));
        assert_eq!(plan.regimes(), vec![Regime::Level1]);
        assert_eq!(plan.arms[0].guard, Guard::Always);
    }

    #[test]
    fn test_plan_deeply_nested_and_simd() {
        let two = StaticLevel::kernel().nested(1).nested(1);
        assert_eq!(plan_dispatch(two).regimes(), vec![Regime::Sequential]);
        let simd = StaticLevel::kernel().nested(SIMD_LEVEL_STEP);
        let plan = plan_dispatch(simd);
        assert_eq!(plan.regimes(), vec![Regime::Sequential]);
        assert_eq!(plan.arms[0].guard, Guard::Always);
    }

    #[test]
    fn test_plan_orphaned_is_full_three_way() {
        let plan = plan_dispatch(StaticLevel::orphaned());
        assert_eq!(
            plan.arms,
            vec![
                DispatchArm {
                    regime: Regime::Level0,
                    guard: Guard::MasterThread
                },
                DispatchArm {
                    regime: Regime::Level1,
                    guard: Guard::LevelIsOne
                },
                DispatchArm {
                    regime: Regime::Sequential,
                    guard: Guard::LevelAboveOne
                },
            ]
        );
        // nesting does not matter once orphaned
        assert_eq!(plan_dispatch(StaticLevel::orphaned().nested(1)), plan);
    }

    #[test]
    fn test_select_for_orphaned() {
        let plan = plan_dispatch(StaticLevel::orphaned());
        assert_eq!(plan.select(96, 96, 0), Some(Regime::Level0));
        assert_eq!(plan.select(5, 96, 1), Some(Regime::Level1));
        assert_eq!(plan.select(5, 96, 2), Some(Regime::Sequential));
        assert_eq!(plan.select(5, 96, 11), Some(Regime::Sequential));
        // a worker at level 0 never reaches orphaned code
        assert_eq!(plan.select(5, 96, 0), None);
    }

    #[test]
    fn test_emit_orphaned_dispatch_shape() {
        let cfg = DeviceConfig::nvptx();
        let plan = plan_dispatch(StaticLevel::orphaned());
        let mut fb = FnBuilder::new("f", Linkage::Internal);
        let mut opened = 0;
        for (i, arm) in plan.arms.iter().enumerate() {
            if i > 0 {
                next_arm(&mut fb, true);
            }
            if open_arm(&mut fb, &cfg, arm) {
                opened += 1;
            }
            fb.comment(arm.regime.to_string());
        }
        close_dispatch(&mut fb, opened);
        let text = fb.finish().to_string();
        assert!(text.contains("icmp eq"));
        assert!(text.contains("icmp sgt"));
        assert!(text.contains(&format!("@{}", PARALLELISM_LEVELS)));
        let l0 = text.find("; level0").unwrap();
        let l1 = text.find("; level1").unwrap();
        let seq = text.find("; sequential").unwrap();
        assert!(l0 < l1 && l1 < seq);
    }

    #[test]
    fn test_emit_level_dispatch_single_arm_has_no_branch() {
        let cfg = DeviceConfig::nvptx();
        let plan = plan_dispatch(StaticLevel::kernel());
        let mut fb = FnBuilder::new("k", Linkage::Kernel);
        let mut seen = Vec::new();
        emit_level_dispatch(&mut fb, &cfg, &plan.arms, |fb, regime| {
            seen.push(regime);
            fb.comment("body");
        });
        let func = fb.finish();
        assert_eq!(seen, vec![Regime::Level0]);
        assert_eq!(func.count_ops(|op| matches!(op, crate::ir::sir::SIROp::If { .. })), 0);
    }

    #[test]
    fn test_emit_level_dispatch_fills_every_orphaned_arm() {
        let cfg = DeviceConfig::nvptx();
        let plan = plan_dispatch(StaticLevel::orphaned());
        let mut fb = FnBuilder::new("f", Linkage::Internal);
        let mut seen = Vec::new();
        emit_level_dispatch(&mut fb, &cfg, &plan.arms, |fb, regime| {
            seen.push(regime);
            fb.comment(regime.to_string());
        });
        let func = fb.finish();
        assert_eq!(seen, vec![Regime::Level0, Regime::Level1, Regime::Sequential]);
        assert_eq!(func.count_ops(|op| matches!(op, crate::ir::sir::SIROp::If { .. })), 3);
        let text = func.to_string();
        let l0 = text.find("; level0").unwrap();
        let seq = text.find("; sequential").unwrap();
        assert!(l0 < seq);
    }

    #[test]
    fn test_level_is_zero_guard() {
        assert!(Guard::LevelIsZero.holds(3, 96, 0));
        assert!(!Guard::LevelIsZero.holds(3, 96, 1));
    }

    proptest! {
        #[test]
        fn prop_static_flags_are_exclusive(nesting in 0i32..40, orphaned in any::<bool>()) {
            let lvl = StaticLevel { nesting, orphaned };
            let count = [lvl.only_level0(), lvl.only_level1(), lvl.only_sequential()]
                .iter()
                .filter(|b| **b)
                .count();
            prop_assert_eq!(count, if orphaned { 0 } else { 1 });
        }

        #[test]
        fn prop_exactly_one_regime_per_reachable_lane(
            warps in 2u32..32,
            tid_seed in any::<u32>(),
            level in 0i32..40,
        ) {
            let cfg = DeviceConfig::nvptx();
            let threads = warps * 32;
            let master = cfg.master_thread_id(threads);
            let tid = tid_seed % threads;
            // reachable states: the master, or a worker inside some region
            prop_assume!(tid == master || level >= 1);
            let plan = plan_dispatch(StaticLevel::orphaned());
            let taken: Vec<_> = plan
                .arms
                .iter()
                .filter(|a| a.guard.holds(tid, master, level))
                .collect();
            prop_assert!(!taken.is_empty());
            let chosen = plan.select(tid, master, level).unwrap();
            if tid == master {
                prop_assert_eq!(chosen, Regime::Level0);
            } else if level == 1 {
                prop_assert_eq!(chosen, Regime::Level1);
            } else {
                prop_assert_eq!(chosen, Regime::Sequential);
            }
        }

        #[test]
        fn prop_static_plan_agrees_with_runtime(nesting in 0i32..30) {
            // When the static level is known, the single arm it emits is the
            // one the runtime guards would choose for a worker at that depth.
            let cfg = DeviceConfig::nvptx();
            let plan = plan_dispatch(StaticLevel { nesting, orphaned: false });
            prop_assert_eq!(plan.arms.len(), 1);
            let full = plan_dispatch(StaticLevel::orphaned());
            let master = cfg.master_thread_id(128);
            let tid = if nesting == 0 { master } else { 3 };
            prop_assert_eq!(full.select(tid, master, nesting), Some(plan.arms[0].regime));
        }
    }
}
