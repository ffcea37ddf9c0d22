//! Captured variables survive the trip through the slot records.

use simtomp::directive::{BinaryOp, Capture, DirectiveId, DirectiveKind, Expr, Stmt, Ty, VarId};
use simtomp::ir::sir::Width;
use simtomp::omp::{ContextId, SharingMode};
use simtomp::{
    compile_unit, launch, plan_unit, DeviceConfig, KernelArg, LaunchReport, SimConfig,
    TranslationUnit, UnitBuilder,
};

const MASTER: u32 = 12;

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

fn on_thread_zero(then: Stmt) -> Stmt {
    Stmt::If {
        cond: Expr::binary(BinaryOp::Eq, Expr::ThreadId, Expr::Int(0)),
        then_branch: Box::new(then),
        else_branch: None,
    }
}

/// `target { x = init; parallel { if tid == 0 { x = update } } observe(1, x) }`
fn update_after_parallel(
    b: &mut UnitBuilder,
    x: VarId,
    init: Option<i64>,
    update: Expr,
    target_captures: Vec<Capture>,
    target_locals: Vec<VarId>,
) {
    let par = b
        .directive(DirectiveKind::Parallel)
        .with_captures(vec![Capture::by_ref(x)])
        .with_body(on_thread_zero(Stmt::assign(x, update)));
    let mut body = Vec::new();
    if let Some(v) = init {
        body.push(Stmt::assign(x, Expr::Int(v)));
    }
    body.push(Stmt::directive(par));
    body.push(Stmt::observe(1, Expr::var(x)));
    let target = b
        .directive(DirectiveKind::Target)
        .with_captures(target_captures)
        .with_locals(target_locals)
        .with_body(Stmt::block(body));
    b.host_function("main", vec![], Stmt::directive(target));
}

fn run(unit: TranslationUnit, args: &mut [KernelArg]) -> LaunchReport {
    let cfg = small_device();
    let module = compile_unit(&unit, &cfg).unwrap_or_else(|diags| {
        panic!(
            "unit should compile: {:?}",
            diags.iter().map(|d| &d.message).collect::<Vec<_>>()
        )
    });
    let sim = SimConfig::default().with_threads(16);
    launch(&module, "__omp_offloading_main_r1", args, &sim, &cfg)
        .unwrap_or_else(|e| panic!("launch failed: {}", e))
}

fn master_sees(report: &LaunchReport) -> Vec<(u32, i64)> {
    report.observed(1).map(|o| (o.tid, o.value)).collect()
}

fn mode_in_kernel(unit: &TranslationUnit, name: &str) -> SharingMode {
    let plans = plan_unit(unit, &small_device()).expect("plans");
    let kernel = plans
        .iter()
        .find(|c| c.id == ContextId::Region(DirectiveId(1)))
        .expect("kernel context");
    kernel
        .captures
        .iter()
        .find(|c| c.name == name)
        .map(|c| c.mode)
        .expect("captured")
}

#[test]
fn test_reference_writes_reach_the_buffer() {
    let mut b = UnitBuilder::new();
    let out = b.reference("out", Ty::I32);
    update_after_parallel(&mut b, out, None, Expr::Int(42), vec![Capture::by_ref(out)], vec![]);

    let unit = b.finish();
    assert_eq!(mode_in_kernel(&unit, "out"), SharingMode::ByReference);

    let mut args = [KernelArg::array(vec![0], Width::I32)];
    let report = run(unit, &mut args);
    assert_eq!(master_sees(&report), vec![(MASTER, 42)]);
    assert_eq!(args[0].values(), &[42]);
}

#[test]
fn test_target_local_moves_into_the_record() {
    let mut b = UnitBuilder::new();
    let x = b.var("x", Ty::I32);
    update_after_parallel(
        &mut b,
        x,
        Some(7),
        Expr::binary(BinaryOp::Add, Expr::var(x), Expr::Int(1)),
        vec![],
        vec![x],
    );
    let unit = b.finish();
    assert_eq!(mode_in_kernel(&unit, "x"), SharingMode::ByValueAddress);

    let report = run(unit, &mut []);
    assert_eq!(master_sees(&report), vec![(MASTER, 8)]);
}

#[test]
fn test_firstprivate_scalar_is_shared_by_address() {
    let mut b = UnitBuilder::new();
    let n = b.var("n", Ty::I64);
    update_after_parallel(
        &mut b,
        n,
        None,
        Expr::binary(BinaryOp::Mul, Expr::var(n), Expr::Int(2)),
        vec![Capture::by_copy(n)],
        vec![],
    );
    let unit = b.finish();
    assert_eq!(mode_in_kernel(&unit, "n"), SharingMode::ByValueAddress);

    let report = run(unit, &mut [KernelArg::scalar(21)]);
    assert_eq!(master_sees(&report), vec![(MASTER, 42)]);
}

#[test]
fn test_view_is_copied_and_rebound() {
    let mut b = UnitBuilder::new();
    let v = b.view("v", Ty::I32, Ty::I64);
    update_after_parallel(
        &mut b,
        v,
        Some(5),
        Expr::binary(BinaryOp::Mul, Expr::var(v), Expr::Int(3)),
        vec![],
        vec![v],
    );
    let unit = b.finish();
    assert_eq!(mode_in_kernel(&unit, "v"), SharingMode::ByPointerCast);

    let report = run(unit, &mut []);
    assert_eq!(master_sees(&report), vec![(MASTER, 15)]);
}

#[test]
fn test_every_worker_reads_the_master_value() {
    let mut b = UnitBuilder::new();
    let x = b.var("x", Ty::I32);
    let par = b
        .directive(DirectiveKind::Parallel)
        .with_captures(vec![Capture::by_ref(x)])
        .with_body(Stmt::observe(2, Expr::var(x)));
    let target = b
        .directive(DirectiveKind::Target)
        .with_locals(vec![x])
        .with_body(Stmt::block(vec![
            Stmt::assign(x, Expr::Int(99)),
            Stmt::directive(par),
        ]));
    b.host_function("main", vec![], Stmt::directive(target));

    let report = run(b.finish(), &mut []);
    assert_eq!(report.observed(2).count(), 12);
    assert!(report.observed(2).all(|o| o.value == 99));
}

#[test]
fn test_nested_region_reads_the_source_lane_frame() {
    let mut b = UnitBuilder::new();
    let y = b.var("y", Ty::I32);
    let nested = b
        .directive(DirectiveKind::Parallel)
        .with_captures(vec![Capture::by_ref(y)])
        .with_body(Stmt::observe(3, Expr::var(y)));
    let par = b
        .directive(DirectiveKind::Parallel)
        .with_locals(vec![y])
        .with_body(Stmt::block(vec![
            Stmt::assign(y, Expr::binary(BinaryOp::Mul, Expr::ThreadId, Expr::Int(10))),
            Stmt::directive(nested),
        ]));
    let target = b.directive(DirectiveKind::Target).with_body(Stmt::directive(par));
    b.host_function("main", vec![], Stmt::directive(target));

    let cfg = small_device();
    let module = compile_unit(&b.finish(), &cfg).expect("compiles");
    let sim = SimConfig::default().with_threads(16);
    let report = launch(&module, "__omp_offloading_main_r2", &mut [], &sim, &cfg).expect("launches");
    for tid in 0..12u32 {
        let group = tid & !3;
        let seen: Vec<i64> = report
            .observed(3)
            .filter(|o| o.tid == tid)
            .map(|o| o.value)
            .collect();
        let expected: Vec<i64> = (group..group + 4).map(|t| t as i64 * 10).collect();
        assert_eq!(seen, expected, "tid {}", tid);
    }
    assert!(report.final_levels[0].iter().all(|&l| l == 0));
}

#[test]
fn test_by_copy_capture_of_a_parallel_is_rejected() {
    let mut b = UnitBuilder::new();
    let x = b.var("x", Ty::I32);
    let par = b
        .directive(DirectiveKind::Parallel)
        .with_captures(vec![Capture::by_copy(x)])
        .with_body(Stmt::observe(1, Expr::var(x)));
    let target = b
        .directive(DirectiveKind::Target)
        .with_locals(vec![x])
        .with_body(Stmt::directive(par));
    b.host_function("main", vec![], Stmt::directive(target));

    let diags = compile_unit(&b.finish(), &small_device()).unwrap_err();
    assert_eq!(diags.len(), 1);
    assert!(diags[0].message.contains("x"), "{}", diags[0].message);
}
