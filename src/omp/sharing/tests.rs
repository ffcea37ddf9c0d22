use super::*;
use crate::directive::{Capture, DirectiveKind, Expr, TranslationUnit, UnitBuilder};
use proptest::prelude::*;

fn cfg() -> DeviceConfig {
    DeviceConfig::nvptx()
}

/// Device function `f(y: int&)` with local `x`, and one parallel region
/// capturing both.
fn example_unit() -> TranslationUnit {
    let mut b = UnitBuilder::new();
    let x = b.var("x", Ty::I32);
    let y = b.reference("y", Ty::I32);
    let par = b
        .directive(DirectiveKind::Parallel)
        .with_captures(vec![Capture::by_ref(x), Capture::by_ref(y)])
        .with_body(Stmt::observe(1, Expr::Var(x)));
    b.device_function("f", vec![y], vec![x], Stmt::directive(par));
    b.finish()
}

#[test]
fn test_example_layouts() {
    let unit = example_unit();
    let index = UnitIndex::build(&unit).unwrap();
    let ctx = plan_context(&index, &ContextId::Function("f".into()), &cfg()).unwrap();

    let modes: Vec<_> = ctx.captures.iter().map(|c| (c.name.as_str(), c.mode)).collect();
    assert_eq!(
        modes,
        vec![
            ("x", SharingMode::ByValueAddress),
            ("y", SharingMode::ByReference)
        ]
    );

    let records = ctx.records.as_ref().expect("layouts");
    let m = &records.master;
    assert_eq!(m.fields[0].ty_name, "int");
    assert_eq!(m.fields[0].count, 1);
    assert_eq!(m.fields[1].ty_name, "int*");
    assert_eq!((m.fields[0].offset, m.fields[1].offset), (0, 8));
    assert_eq!(m.size, 16);

    let w = &records.worker;
    assert_eq!(w.fields[0].count, 32);
    assert_eq!(w.fields[1].count, 32);
    assert_eq!(w.fields[1].ty_name, "int*");
    assert_eq!((w.fields[0].offset, w.fields[1].offset), (0, 128));
    assert_eq!(w.size, 128 + 256);
    assert_eq!(m.field_names(), w.field_names());

    let text = ctx.to_string();
    assert!(text.contains("int x;"));
    assert!(text.contains("int* y[32];"));
}

#[test]
fn test_captures_dedup_across_regions() {
    let mut b = UnitBuilder::new();
    let x = b.var("x", Ty::I32);
    let z = b.var("z", Ty::I64);
    let p1 = b
        .directive(DirectiveKind::Parallel)
        .with_captures(vec![Capture::by_ref(x)]);
    let p2 = b
        .directive(DirectiveKind::Simd)
        .with_captures(vec![Capture::by_ref(z), Capture::by_ref(x)]);
    let p3 = b
        .directive(DirectiveKind::ParallelFor)
        .with_captures(vec![Capture::by_ref(x)]);
    b.device_function(
        "g",
        vec![],
        vec![x, z],
        Stmt::block(vec![
            Stmt::directive(p1),
            Stmt::directive(p2),
            Stmt::directive(p3),
        ]),
    );
    let unit = b.finish();
    let index = UnitIndex::build(&unit).unwrap();
    let ctx = plan_context(&index, &ContextId::Function("g".into()), &cfg()).unwrap();
    let names: Vec<_> = ctx.captures.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["x", "z"]);
    assert_eq!(ctx.index_of(CaptureTarget::Var(z)), Some(1));
}

#[test]
fn test_nested_regions_are_planned_under_their_own_context() {
    let mut b = UnitBuilder::new();
    let outer_var = b.var("a", Ty::I32);
    let inner_var = b.var("b", Ty::I32);
    let inner = b
        .directive(DirectiveKind::Parallel)
        .with_captures(vec![Capture::by_ref(outer_var), Capture::by_ref(inner_var)]);
    let outer = b
        .directive(DirectiveKind::Parallel)
        .with_captures(vec![Capture::by_ref(outer_var)])
        .with_locals(vec![inner_var])
        .with_body(Stmt::directive(inner));
    let outer_id = outer.id;
    // a worksharing construct is transparent to the walk
    let single = b
        .directive(DirectiveKind::Single)
        .with_body(Stmt::directive(outer));
    b.device_function("h", vec![], vec![outer_var], Stmt::directive(single));
    let unit = b.finish();
    let index = UnitIndex::build(&unit).unwrap();

    let fn_ctx = plan_context(&index, &ContextId::Function("h".into()), &cfg()).unwrap();
    assert_eq!(fn_ctx.captures.len(), 1);
    assert_eq!(fn_ctx.captures[0].name, "a");
    assert_eq!(fn_ctx.captures[0].mode, SharingMode::ByValueAddress);

    let region_ctx = plan_context(&index, &ContextId::Region(outer_id), &cfg()).unwrap();
    let modes: Vec<_> = region_ctx
        .captures
        .iter()
        .map(|c| (c.name.as_str(), c.mode))
        .collect();
    // `a` arrives in the outlined region as an address, `b` is its own local
    assert_eq!(
        modes,
        vec![
            ("a", SharingMode::ByReference),
            ("b", SharingMode::ByValueAddress)
        ]
    );
}

#[test]
fn test_typed_view_is_pointer_cast() {
    let mut b = UnitBuilder::new();
    let v = b.view("v", Ty::I32, Ty::I64);
    let par = b
        .directive(DirectiveKind::Parallel)
        .with_captures(vec![Capture::by_ref(v)]);
    b.device_function("k", vec![], vec![v], Stmt::directive(par));
    let unit = b.finish();
    let index = UnitIndex::build(&unit).unwrap();
    let ctx = plan_context(&index, &ContextId::Function("k".into()), &cfg()).unwrap();
    assert_eq!(ctx.captures[0].mode, SharingMode::ByPointerCast);
    assert_eq!(ctx.fields(0).unwrap().0.ty_name, "int");
    assert!(SharingMode::ByPointerCast.rebinds());
    assert!(!SharingMode::ByReference.rebinds());
}

#[test]
fn test_target_by_copy_capture_is_value_address() {
    let mut b = UnitBuilder::new();
    let n = b.var("n", Ty::I32);
    let par = b
        .directive(DirectiveKind::Parallel)
        .with_captures(vec![Capture::by_ref(n)]);
    let target = b
        .directive(DirectiveKind::Target)
        .with_captures(vec![Capture::by_copy(n)])
        .with_body(Stmt::directive(par));
    let target_id = target.id;
    b.host_function("main", vec![n], Stmt::directive(target));
    let unit = b.finish();
    let index = UnitIndex::build(&unit).unwrap();
    let ctx = plan_context(&index, &ContextId::Region(target_id), &cfg()).unwrap();
    assert_eq!(ctx.captures[0].mode, SharingMode::ByValueAddress);
    assert_eq!(
        binding_of(&index, &ContextId::Region(target_id), n).unwrap(),
        Binding::Local
    );
}

#[test]
fn test_this_is_shared_by_reference() {
    let mut b = UnitBuilder::new();
    let par = b
        .directive(DirectiveKind::Parallel)
        .with_captures(vec![Capture::this()]);
    b.device_function("method", vec![], vec![], Stmt::directive(par))
        .has_this = true;
    let unit = b.finish();
    let index = UnitIndex::build(&unit).unwrap();
    let ctx = plan_context(&index, &ContextId::Function("method".into()), &cfg()).unwrap();
    assert_eq!(ctx.captures[0].identity, CaptureTarget::This);
    assert_eq!(ctx.captures[0].mode, SharingMode::ByReference);
    assert_eq!(ctx.master_size(), 8);
}

#[test]
fn test_this_without_object_is_rejected() {
    let mut b = UnitBuilder::new();
    let par = b
        .directive(DirectiveKind::Parallel)
        .with_captures(vec![Capture::this()]);
    b.device_function("free_fn", vec![], vec![], Stmt::directive(par));
    let unit = b.finish();
    let index = UnitIndex::build(&unit).unwrap();
    let err = plan_context(&index, &ContextId::Function("free_fn".into()), &cfg()).unwrap_err();
    assert!(matches!(err, CodegenError::MissingThis { .. }));
}

#[test]
fn test_vla_capture_is_fatal() {
    let mut b = UnitBuilder::new();
    let buf = b.var(
        "buf",
        Ty::Vla {
            elem: Box::new(Ty::I32),
        },
    );
    let par = b
        .directive(DirectiveKind::Parallel)
        .with_captures(vec![Capture::by_ref(buf)])
        .with_span(Span::new(0, 10, 30));
    b.device_function("v", vec![], vec![buf], Stmt::directive(par));
    let unit = b.finish();
    let index = UnitIndex::build(&unit).unwrap();
    let err = plan_context(&index, &ContextId::Function("v".into()), &cfg()).unwrap_err();
    match err {
        CodegenError::VlaCapture { name, region, span } => {
            assert_eq!(name, "buf");
            assert_eq!(region, "parallel");
            assert_eq!(span, Span::new(0, 10, 30));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_vla_capture_kind_is_fatal_even_for_sized_type() {
    let mut b = UnitBuilder::new();
    let a = b.var("a", Ty::I32);
    let par = b
        .directive(DirectiveKind::Simd)
        .with_captures(vec![Capture::vla(a)]);
    b.device_function("w", vec![], vec![a], Stmt::directive(par));
    let unit = b.finish();
    let index = UnitIndex::build(&unit).unwrap();
    assert!(matches!(
        plan_context(&index, &ContextId::Function("w".into()), &cfg()),
        Err(CodegenError::VlaCapture { .. })
    ));
}

#[test]
fn test_by_copy_in_parallel_is_fatal() {
    let mut b = UnitBuilder::new();
    let a = b.var("a", Ty::I32);
    let par = b
        .directive(DirectiveKind::Parallel)
        .with_captures(vec![Capture::by_copy(a)]);
    b.device_function("c", vec![], vec![a], Stmt::directive(par));
    let unit = b.finish();
    let index = UnitIndex::build(&unit).unwrap();
    assert!(matches!(
        plan_context(&index, &ContextId::Function("c".into()), &cfg()),
        Err(CodegenError::ByCopyCapture { .. })
    ));
}

#[test]
fn test_aggregate_view_is_fatal() {
    let mut b = UnitBuilder::new();
    let arr = Ty::Array {
        elem: Box::new(Ty::I32),
        len: 4,
    };
    let v = b.view("v", arr, Ty::I64);
    let par = b
        .directive(DirectiveKind::Parallel)
        .with_captures(vec![Capture::by_ref(v)]);
    b.device_function("agg", vec![], vec![v], Stmt::directive(par));
    let unit = b.finish();
    let index = UnitIndex::build(&unit).unwrap();
    assert!(matches!(
        plan_context(&index, &ContextId::Function("agg".into()), &cfg()),
        Err(CodegenError::AggregateView { .. })
    ));
}

#[test]
fn test_context_without_regions_is_empty() {
    let mut b = UnitBuilder::new();
    b.device_function("leaf", vec![], vec![], Stmt::observe(0, Expr::Int(1)));
    let unit = b.finish();
    let index = UnitIndex::build(&unit).unwrap();
    let ctx = plan_context(&index, &ContextId::Function("leaf".into()), &cfg()).unwrap();
    assert!(ctx.is_empty());
    assert!(ctx.records.is_none());
    assert!(ctx.fields(0).is_none());
    assert_eq!((ctx.master_size(), ctx.worker_size()), (0, 0));
    assert!(!ctx.to_string().contains("struct"));
}

fn scalar() -> impl Strategy<Value = Ty> {
    prop_oneof![Just(Ty::I8), Just(Ty::I32), Just(Ty::I64), Just(Ty::Ptr)]
}

proptest! {
    #[test]
    fn prop_master_and_worker_share_field_order(
        tys in proptest::collection::vec((scalar(), 0u8..3), 1..8),
    ) {
        let mut b = UnitBuilder::new();
        let mut caps = Vec::new();
        let mut locals = Vec::new();
        for (i, (ty, storage)) in tys.iter().enumerate() {
            let name = format!("v{}", i);
            let id = match storage {
                0 => b.var(&name, ty.clone()),
                1 => b.reference(&name, ty.clone()),
                _ => b.view(&name, ty.clone(), Ty::I64),
            };
            caps.push(Capture::by_ref(id));
            locals.push(id);
        }
        let par = b.directive(DirectiveKind::Parallel).with_captures(caps);
        b.device_function("p", vec![], locals, Stmt::directive(par));
        let unit = b.finish();
        let index = UnitIndex::build(&unit).unwrap();
        let ctx = plan_context(&index, &ContextId::Function("p".into()), &cfg()).unwrap();

        let records = ctx.records.as_ref().unwrap();
        prop_assert_eq!(records.master.field_names(), records.worker.field_names());
        for (m, w) in records.master.fields.iter().zip(&records.worker.fields) {
            prop_assert_eq!(m.elem_size, w.elem_size);
            prop_assert_eq!(w.count, 32);
            prop_assert_eq!(m.offset % m.elem_align, 0);
            prop_assert_eq!(w.offset % w.elem_align, 0);
        }
        // fields never overlap
        for pair in records.worker.fields.windows(2) {
            prop_assert!(pair[0].offset + pair[0].size() <= pair[1].offset);
        }
        let last = records.master.fields.last().unwrap();
        prop_assert!(last.offset + last.size() <= records.master.size);
    }
}
