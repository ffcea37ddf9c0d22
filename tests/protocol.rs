//! Master–worker protocol, run end to end on the simulator.

use simtomp::directive::{BinaryOp, Capture, DirectiveKind, Expr, Stmt, Ty};
use simtomp::omp::Regime;
use simtomp::runtime::TraceKind;
use simtomp::sim::RuntimeFault;
use simtomp::{compile_unit, launch, DeviceConfig, KernelArg, LaunchReport, SimConfig, SimError, UnitBuilder};

const THREADS: u32 = 16;
const WORKERS: usize = 12;
const MASTER: u32 = 12;

/// Four-lane groups keep the lane counts small enough to enumerate.
fn small_device() -> DeviceConfig {
    DeviceConfig {
        name: "tiny".to_string(),
        display_name: "tiny test device".to_string(),
        warp_size: 4,
        max_worker_threads: 60,
        max_threads_per_block: 64,
        ..DeviceConfig::nvptx()
    }
}

fn when(cond: Expr, then: Stmt) -> Stmt {
    Stmt::If {
        cond,
        then_branch: Box::new(then),
        else_branch: None,
    }
}

fn run(unit: simtomp::TranslationUnit, kernel: &str, args: &mut [KernelArg], sim: SimConfig) -> LaunchReport {
    let cfg = small_device();
    let module = compile_unit(&unit, &cfg).unwrap_or_else(|diags| {
        panic!(
            "unit should compile: {:?}",
            diags.iter().map(|d| &d.message).collect::<Vec<_>>()
        )
    });
    launch(&module, kernel, args, &sim, &cfg).unwrap_or_else(|e| panic!("launch failed: {}", e))
}

fn sim() -> SimConfig {
    SimConfig::default().with_threads(THREADS)
}

fn regions(report: &LaunchReport, regime: Regime) -> usize {
    report
        .trace
        .iter()
        .filter(|e| e.kind == TraceKind::Region { regime })
        .count()
}

fn dispatches(report: &LaunchReport) -> usize {
    report
        .trace
        .iter()
        .filter(|e| matches!(e.kind, TraceKind::WorkerDispatch { .. }))
        .count()
}

fn assert_levels_balanced(report: &LaunchReport) {
    for (block, levels) in report.final_levels.iter().enumerate() {
        assert!(
            levels.iter().all(|&l| l == 0),
            "block {} left levels {:?}",
            block,
            levels
        );
    }
}

fn tids(report: &LaunchReport, tag: i64) -> Vec<u32> {
    report.observed(tag).map(|o| o.tid).collect()
}

// ── kernel without parallelism ──

#[test]
fn test_sequential_kernel_terminates_workers() {
    let mut b = UnitBuilder::new();
    let target = b
        .directive(DirectiveKind::Target)
        .with_body(Stmt::observe(1, Expr::ThreadId));
    b.host_function("main", vec![], Stmt::directive(target));

    let report = run(b.finish(), "__omp_offloading_main_r0", &mut [], sim());
    assert_eq!(tids(&report, 1), vec![MASTER]);
    assert_eq!(dispatches(&report), 0);
    assert_eq!(regions(&report, Regime::Level0), 0);
    assert_levels_balanced(&report);
}

// ── level 0 ──

#[test]
fn test_parallel_runs_every_worker_once() {
    let mut b = UnitBuilder::new();
    let par = b
        .directive(DirectiveKind::Parallel)
        .with_body(Stmt::observe(1, Expr::ThreadId));
    let target = b
        .directive(DirectiveKind::Target)
        .with_body(Stmt::block(vec![Stmt::directive(par), Stmt::observe(2, Expr::ThreadId)]));
    b.host_function("main", vec![], Stmt::directive(target));

    let report = run(b.finish(), "__omp_offloading_main_r1", &mut [], sim());
    assert_eq!(tids(&report, 1), (0..WORKERS as u32).collect::<Vec<_>>());
    assert_eq!(tids(&report, 2), vec![MASTER]);
    assert_eq!(regions(&report, Regime::Level0), 1);
    assert_eq!(dispatches(&report), WORKERS);
    assert_levels_balanced(&report);
}

#[test]
fn test_consecutive_parallels_reuse_the_workers() {
    let mut b = UnitBuilder::new();
    let first = b
        .directive(DirectiveKind::Parallel)
        .with_body(Stmt::observe(1, Expr::ThreadId));
    let second = b
        .directive(DirectiveKind::ParallelFor)
        .with_body(Stmt::observe(2, Expr::ThreadId));
    let target = b
        .directive(DirectiveKind::Target)
        .with_body(Stmt::block(vec![Stmt::directive(first), Stmt::directive(second)]));
    b.host_function("main", vec![], Stmt::directive(target));

    let report = run(b.finish(), "__omp_offloading_main_r2", &mut [], sim());
    assert_eq!(report.observed(1).count(), WORKERS);
    assert_eq!(report.observed(2).count(), WORKERS);
    assert_eq!(regions(&report, Regime::Level0), 2);
    assert_eq!(dispatches(&report), 2 * WORKERS);
    let work: Vec<u64> = report
        .trace
        .iter()
        .filter_map(|e| match e.kind {
            TraceKind::WorkerDispatch { work_fn } => Some(work_fn),
            _ => None,
        })
        .collect();
    assert_ne!(work.first(), work.last(), "each region has its own wrapper");
    assert_levels_balanced(&report);
}

#[test]
fn test_each_lane_sees_one_regime_per_region() {
    let mut b = UnitBuilder::new();
    let nested = b
        .directive(DirectiveKind::Parallel)
        .with_body(Stmt::observe(3, Expr::ThreadId));
    let par = b
        .directive(DirectiveKind::Parallel)
        .with_body(Stmt::directive(nested));
    let target = b.directive(DirectiveKind::Target).with_body(Stmt::directive(par));
    b.host_function("main", vec![], Stmt::directive(target));

    let report = run(b.finish(), "__omp_offloading_main_r2", &mut [], sim());
    assert_eq!(regions(&report, Regime::Level0), 1);
    assert_eq!(regions(&report, Regime::Level1), WORKERS);
    assert_eq!(regions(&report, Regime::Sequential), 0);
    for tid in 0..WORKERS as u32 {
        let entered = report
            .trace
            .iter()
            .filter(|e| e.tid == tid && matches!(e.kind, TraceKind::Region { .. }))
            .count();
        assert_eq!(entered, 1, "tid {} entered {} regions", tid, entered);
    }
    assert_levels_balanced(&report);
}

// ── level 1 ──

#[test]
fn test_nested_parallel_drains_every_group_member() {
    let mut b = UnitBuilder::new();
    let nested = b
        .directive(DirectiveKind::Parallel)
        .with_body(Stmt::observe(3, Expr::ThreadId));
    let par = b
        .directive(DirectiveKind::Parallel)
        .with_body(Stmt::directive(nested));
    let target = b.directive(DirectiveKind::Target).with_body(Stmt::directive(par));
    b.host_function("main", vec![], Stmt::directive(target));

    let report = run(b.finish(), "__omp_offloading_main_r2", &mut [], sim());
    // Each of the three worker groups runs four requests on four lanes.
    assert_eq!(report.observed(3).count(), WORKERS * 4);
    for tid in 0..WORKERS as u32 {
        let sources: Vec<(i32, bool)> = report
            .trace
            .iter()
            .filter(|e| e.tid == tid)
            .filter_map(|e| match e.kind {
                TraceKind::ConvergentIteration { source, is_final } => Some((source, is_final)),
                _ => None,
            })
            .collect();
        assert_eq!(
            sources,
            vec![(0, false), (1, false), (2, false), (3, true)],
            "tid {}",
            tid
        );
    }
    assert_levels_balanced(&report);
}

#[test]
fn test_divergent_group_drains_only_arriving_lanes() {
    let mut b = UnitBuilder::new();
    let y = b.var("y", Ty::I32);
    let nested = b
        .directive(DirectiveKind::Parallel)
        .with_captures(vec![Capture::by_ref(y)])
        .with_body(Stmt::observe(3, Expr::var(y)));
    let even = Expr::binary(
        BinaryOp::Eq,
        Expr::binary(BinaryOp::And, Expr::ThreadId, Expr::Int(1)),
        Expr::Int(0),
    );
    let par = b
        .directive(DirectiveKind::Parallel)
        .with_locals(vec![y])
        .with_body(Stmt::block(vec![
            Stmt::assign(y, Expr::binary(BinaryOp::Mul, Expr::ThreadId, Expr::Int(10))),
            when(even, Stmt::directive(nested)),
        ]));
    let target = b.directive(DirectiveKind::Target).with_body(Stmt::directive(par));
    b.host_function("main", vec![], Stmt::directive(target));

    let report = run(b.finish(), "__omp_offloading_main_r2", &mut [], sim());
    // Lanes 0 and 2 of every group arrive; each runs both requests.
    assert_eq!(report.observed(3).count(), WORKERS);
    for tid in 0..WORKERS as u32 {
        let iterations: Vec<(i32, bool)> = report
            .trace
            .iter()
            .filter(|e| e.tid == tid)
            .filter_map(|e| match e.kind {
                TraceKind::ConvergentIteration { source, is_final } => Some((source, is_final)),
                _ => None,
            })
            .collect();
        let seen: Vec<i64> = report
            .observed(3)
            .filter(|o| o.tid == tid)
            .map(|o| o.value)
            .collect();
        if tid % 2 == 1 {
            assert!(iterations.is_empty(), "tid {} {:?}", tid, iterations);
            assert!(seen.is_empty(), "tid {} {:?}", tid, seen);
            continue;
        }
        assert_eq!(iterations, vec![(0, false), (2, true)], "tid {}", tid);
        let group = (tid & !3) as i64;
        assert_eq!(seen, vec![group * 10, (group + 2) * 10], "tid {}", tid);
    }
    assert_levels_balanced(&report);
}

#[test]
fn test_simd_in_parallel_numbers_lanes() {
    let mut b = UnitBuilder::new();
    let simd = b.directive(DirectiveKind::Simd).with_body(Stmt::block(vec![
        Stmt::observe(4, Expr::SimdLane),
        Stmt::observe(5, Expr::SimdLanes),
    ]));
    let par = b
        .directive(DirectiveKind::Parallel)
        .with_body(Stmt::directive(simd));
    let target = b.directive(DirectiveKind::Target).with_body(Stmt::directive(par));
    b.host_function("main", vec![], Stmt::directive(target));

    let report = run(b.finish(), "__omp_offloading_main_r2", &mut [], sim());
    assert_eq!(report.observed(4).count(), WORKERS * 4);
    assert!(report.observed(4).all(|o| o.value == (o.tid % 4) as i64));
    assert!(report.observed(5).all(|o| o.value == 4));
    assert_levels_balanced(&report);
}

#[test]
fn test_simd_on_the_master_runs_one_lane() {
    let mut b = UnitBuilder::new();
    let simd = b.directive(DirectiveKind::Simd).with_body(Stmt::block(vec![
        Stmt::observe(4, Expr::SimdLane),
        Stmt::observe(5, Expr::SimdLanes),
    ]));
    let target = b.directive(DirectiveKind::Target).with_body(Stmt::directive(simd));
    b.host_function("main", vec![], Stmt::directive(target));

    let report = run(b.finish(), "__omp_offloading_main_r1", &mut [], sim());
    let lane: Vec<_> = report.observed(4).map(|o| (o.tid, o.value)).collect();
    let lanes: Vec<_> = report.observed(5).map(|o| (o.tid, o.value)).collect();
    assert_eq!(lane, vec![(MASTER, 0)]);
    assert_eq!(lanes, vec![(MASTER, 1)]);
    assert_eq!(dispatches(&report), 0);
}

// ── if clause ──

#[test]
fn test_false_if_clause_serializes_on_the_master() {
    let mut b = UnitBuilder::new();
    let par = b
        .directive(DirectiveKind::Parallel)
        .with_if(Expr::Int(0))
        .with_body(Stmt::observe(1, Expr::ThreadId));
    let target = b.directive(DirectiveKind::Target).with_body(Stmt::directive(par));
    b.host_function("main", vec![], Stmt::directive(target));

    let report = run(b.finish(), "__omp_offloading_main_r1", &mut [], sim());
    assert_eq!(tids(&report, 1), vec![MASTER]);
    assert_eq!(regions(&report, Regime::Sequential), 1);
    assert_eq!(regions(&report, Regime::Level0), 0);
    assert_eq!(dispatches(&report), 0);
    assert_levels_balanced(&report);
}

#[test]
fn test_true_if_clause_dispatches() {
    let mut b = UnitBuilder::new();
    let par = b
        .directive(DirectiveKind::Parallel)
        .with_if(Expr::binary(BinaryOp::Gt, Expr::Int(2), Expr::Int(1)))
        .with_body(Stmt::observe(1, Expr::ThreadId));
    let target = b.directive(DirectiveKind::Target).with_body(Stmt::directive(par));
    b.host_function("main", vec![], Stmt::directive(target));

    let report = run(b.finish(), "__omp_offloading_main_r1", &mut [], sim());
    assert_eq!(report.observed(1).count(), WORKERS);
    assert_eq!(regions(&report, Regime::Level0), 1);
    assert_eq!(regions(&report, Regime::Sequential), 0);
}

// ── orphaned device functions ──

#[test]
fn test_device_function_dispatches_from_the_master() {
    let mut b = UnitBuilder::new();
    let par = b
        .directive(DirectiveKind::Parallel)
        .with_body(Stmt::observe(7, Expr::ThreadId));
    b.device_function("work", vec![], vec![], Stmt::directive(par));
    let target = b
        .directive(DirectiveKind::Target)
        .with_body(Stmt::call("work", vec![]));
    b.host_function("main", vec![], Stmt::directive(target));

    let report = run(b.finish(), "__omp_offloading_main_r1", &mut [], sim());
    assert_eq!(tids(&report, 7), (0..WORKERS as u32).collect::<Vec<_>>());
    assert_eq!(regions(&report, Regime::Level0), 1);
    assert_levels_balanced(&report);
}

#[test]
fn test_device_function_converges_inside_a_parallel() {
    let mut b = UnitBuilder::new();
    let inner = b
        .directive(DirectiveKind::Parallel)
        .with_body(Stmt::observe(7, Expr::ThreadId));
    b.device_function("work", vec![], vec![], Stmt::directive(inner));
    let par = b
        .directive(DirectiveKind::Parallel)
        .with_body(Stmt::call("work", vec![]));
    let target = b.directive(DirectiveKind::Target).with_body(Stmt::directive(par));
    b.host_function("main", vec![], Stmt::directive(target));

    let report = run(b.finish(), "__omp_offloading_main_r2", &mut [], sim());
    assert_eq!(report.observed(7).count(), WORKERS * 4);
    assert_eq!(regions(&report, Regime::Level1), WORKERS);
    assert_levels_balanced(&report);
}

// ── grid ──

#[test]
fn test_blocks_run_independent_teams() {
    let mut b = UnitBuilder::new();
    let par = b.directive(DirectiveKind::Parallel).with_body(when(
        Expr::binary(BinaryOp::Eq, Expr::ThreadId, Expr::Int(0)),
        Stmt::observe(1, Expr::ThreadId),
    ));
    let target = b.directive(DirectiveKind::TargetTeams).with_body(Stmt::directive(par));
    b.host_function("main", vec![], Stmt::directive(target));

    let report = run(b.finish(), "__omp_offloading_main_r1", &mut [], sim().with_blocks(3));
    let blocks: Vec<u32> = report.observed(1).map(|o| o.block).collect();
    assert_eq!(blocks, vec![0, 1, 2]);
    assert_eq!(report.final_levels.len(), 3);
    assert_eq!(regions(&report, Regime::Level0), 3);
    assert_levels_balanced(&report);
}

// ── failures ──

#[test]
fn test_small_pool_faults_the_master() {
    let mut b = UnitBuilder::new();
    let x = b.var("x", simtomp::directive::Ty::I64);
    let y = b.var("y", simtomp::directive::Ty::I64);
    let par = b
        .directive(DirectiveKind::Parallel)
        .with_captures(vec![
            simtomp::directive::Capture::by_ref(x),
            simtomp::directive::Capture::by_ref(y),
        ])
        .with_body(Stmt::assign(x, Expr::var(y)));
    let target = b
        .directive(DirectiveKind::Target)
        .with_locals(vec![x, y])
        .with_body(Stmt::directive(par));
    b.host_function("main", vec![], Stmt::directive(target));

    let cfg = small_device();
    let module = compile_unit(&b.finish(), &cfg).expect("compiles");
    let sim = sim().with_pool_capacity(16);
    let err = launch(&module, "__omp_offloading_main_r1", &mut [], &sim, &cfg).unwrap_err();
    match err {
        SimError::Fault { tid, fault, .. } => {
            assert_eq!(tid, MASTER);
            assert!(matches!(fault, RuntimeFault::PoolExhausted { .. }), "{:?}", fault);
        }
        other => panic!("expected a pool fault, got {}", other),
    }
}

#[test]
fn test_argument_count_is_checked() {
    let mut b = UnitBuilder::new();
    let n = b.var("n", simtomp::directive::Ty::I32);
    let target = b
        .directive(DirectiveKind::Target)
        .with_captures(vec![simtomp::directive::Capture::by_copy(n)])
        .with_body(Stmt::observe(1, Expr::var(n)));
    b.host_function("main", vec![n], Stmt::directive(target));

    let cfg = small_device();
    let module = compile_unit(&b.finish(), &cfg).expect("compiles");
    let err = launch(&module, "__omp_offloading_main_r0", &mut [], &sim(), &cfg).unwrap_err();
    assert!(matches!(err, SimError::ArgumentMismatch { expected: 1, got: 0, .. }));

    let report = launch(
        &module,
        "__omp_offloading_main_r0",
        &mut [KernelArg::scalar(41)],
        &sim(),
        &cfg,
    )
    .expect("launches");
    let seen: Vec<_> = report.observed(1).map(|o| (o.tid, o.value)).collect();
    assert_eq!(seen, vec![(MASTER, 41)]);
}
