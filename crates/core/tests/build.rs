//! Integration tests for the build engine: fatal assembly errors, the
//! builder lifecycle, backend parity and concurrent execution.

mod common;

use std::sync::Arc;
use std::thread;

use common::{one_to_one, two_to_one};
use compgraph_core::{
    BuildState, Component, ComponentTest, CoreError, DeferredBackend, EagerBackend, EngineConfig,
    GraphBuilder, GraphFn, Space, Structure, Tensor,
};

fn diamond() -> Component {
    let mut container = Component::new("container");
    container
        .add_components(vec![
            one_to_one("A"),
            one_to_one("B"),
            one_to_one("C"),
            two_to_one("D"),
        ])
        .unwrap();
    container
        .define_api_method("run", &["input1", "input2"], |ctx, args| {
            let a1 = ctx.call_one("A", "run", &args[..1])?;
            let a2 = ctx.call_one("A", "run", &args[1..])?;
            let b = ctx.call_one("B", "run", &[a1])?;
            let c = ctx.call_one("C", "run", &[a2])?;
            ctx.call("D", "run", &[b, c])
        })
        .unwrap();
    container
}

fn scalar_spaces() -> Vec<(&'static str, Space)> {
    vec![("input1", Space::scalar()), ("input2", Space::scalar())]
}

// ============================================================================
// Fatal assembly errors
// ============================================================================

#[test]
fn test_duplicate_scope() {
    let mut container = Component::new("container");
    container.add_component(one_to_one("A")).unwrap();
    let err = container.add_component(one_to_one("A")).unwrap_err();
    assert_eq!(
        err,
        CoreError::DuplicateScope {
            parent: "container".to_string(),
            scope: "A".to_string(),
        }
    );

    let mut fresh = Component::new("container");
    let err = fresh
        .add_components(vec![one_to_one("A"), one_to_one("A")])
        .unwrap_err();
    assert!(matches!(err, CoreError::DuplicateScope { ref scope, .. } if scope == "A"));
    assert!(fresh.sub_components().is_empty());
}

#[test]
fn test_arity_error_at_trace_time() {
    let mut container = Component::new("container");
    container.add_component(two_to_one("D")).unwrap();
    container
        .define_api_method("run", &["input1", "input2"], |ctx, args| {
            ctx.call("D", "run", &args[..1])
        })
        .unwrap();

    let mut builder = GraphBuilder::new(container, Arc::new(DeferredBackend::new()));
    let err = builder.build(scalar_spaces()).unwrap_err();
    assert!(matches!(
        err,
        CoreError::Arity { ref callee, got: 1, .. } if callee == "container/D.run"
    ));
    assert_eq!(builder.state(), BuildState::Failed);
    assert!(builder.built().is_none());

    let again = builder.build(scalar_spaces()).unwrap_err();
    assert!(matches!(again, CoreError::BuildFailed { .. }));

    builder.reset();
    assert_eq!(builder.state(), BuildState::Unbuilt);
    assert!(!builder.root().has_recorded_calls());
    assert!(matches!(
        builder.build(scalar_spaces()),
        Err(CoreError::Arity { .. })
    ));
}

#[test]
fn test_arity_error_at_run_time() {
    let test = ComponentTest::new(diamond(), scalar_spaces()).unwrap();
    let err = test
        .run("run", vec![Structure::Leaf(Tensor::scalar(1.1))])
        .unwrap_err();
    assert!(matches!(err, CoreError::Arity { got: 1, .. }));
}

#[test]
fn test_cyclic_call_graph() {
    let mut x = Component::new("X");
    x.define_api_method("run", &["input1"], |ctx, args| ctx.call("../Y", "run", &args))
        .unwrap();
    let mut y = Component::new("Y");
    y.define_api_method("run", &["input1"], |ctx, args| ctx.call("../X", "run", &args))
        .unwrap();

    let mut container = Component::new("container");
    container.add_components(vec![x, y]).unwrap();
    container
        .define_api_method("run", &["input1"], |ctx, args| ctx.call("X", "run", &args))
        .unwrap();

    let mut builder = GraphBuilder::new(container, Arc::new(DeferredBackend::new()));
    let err = builder.build([("input1", Space::scalar())]).unwrap_err();
    match err {
        CoreError::CyclicCallGraph { cycle } => {
            assert_eq!(cycle, "container/X.run -> container/Y.run -> container/X.run");
        }
        other => panic!("expected a cycle, got {other}"),
    }
    assert_eq!(builder.state(), BuildState::Failed);
}

#[test]
fn test_space_conflict() {
    let mut container = Component::new("container");
    container.add_component(one_to_one("A")).unwrap();
    container
        .define_api_method("run", &["small", "wide"], |ctx, args| {
            let first = ctx.call_one("A", "run", &args[..1])?;
            let second = ctx.call_one("A", "run", &args[1..])?;
            Ok(vec![first, second])
        })
        .unwrap();

    let mut builder = GraphBuilder::new(container, Arc::new(DeferredBackend::new()));
    let err = builder
        .build([("small", Space::scalar()), ("wide", Space::float(vec![3]))])
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::SpaceConflict { ref component, ref argument, .. }
            if component == "container/A" && argument == "input1"
    ));
}

#[test]
fn test_discrete_argument_through_graph_fn_is_not_a_conflict() {
    let identity = |scope: &str, param: &str| {
        let mut c = Component::new(scope);
        c.define_api_graph_fn(
            "run",
            &[param],
            GraphFn::new("pass", 1, 1, |ctx, args| Ok(vec![ctx.identity(args[0].leaf()?)?.into()])),
        )
        .unwrap();
        c
    };
    let mut container = Component::new("container");
    container
        .add_components(vec![identity("S", "a"), identity("I", "x")])
        .unwrap();
    container
        .define_api_method("run", &["action"], |ctx, args| {
            let passed = ctx.call_one("I", "run", &args[..1])?;
            let indirect = ctx.call_one("S", "run", &[passed])?;
            let direct = ctx.call_one("S", "run", &args[..1])?;
            Ok(vec![indirect, direct])
        })
        .unwrap();

    let action = Space::discrete(vec![], 5).unwrap();
    let mut builder = GraphBuilder::new(container, Arc::new(DeferredBackend::new()));
    builder.build([("action", action.clone())]).unwrap();

    let s = builder.root().sub_component("S").unwrap();
    assert_eq!(s.input_spaces().get("a"), Some(&action));
    let resolved = s.input_spaces()["a"].as_leaf().unwrap().num_categories;
    assert_eq!(resolved, Some(5));
}

#[test]
fn test_missing_input_space() {
    let mut builder = GraphBuilder::new(diamond(), Arc::new(DeferredBackend::new()));
    let err = builder.build([("input1", Space::scalar())]).unwrap_err();
    assert_eq!(
        err,
        CoreError::MissingInputSpace {
            method: "container.run".to_string(),
            argument: "input2".to_string(),
        }
    );
}

#[test]
fn test_backend_unavailable() {
    let config = EngineConfig::from_json(r#"{ "backend": "tpu-cluster" }"#).unwrap();
    let err = GraphBuilder::from_config(diamond(), config).unwrap_err();
    assert!(matches!(err, CoreError::BackendUnavailable { ref name, .. } if name == "tpu-cluster"));
}

#[test]
fn test_invalid_config() {
    let err = EngineConfig::from_json(r#"{ "small_number": 2.0 }"#).unwrap_err();
    assert!(matches!(err, CoreError::InvalidConfig { .. }));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_build_is_idempotent() {
    let mut builder = GraphBuilder::new(diamond(), Arc::new(DeferredBackend::new()));
    let first = builder.build(scalar_spaces()).unwrap();
    let ops = first.op_count();
    let second = builder.build(scalar_spaces()).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.op_count(), ops);
}

#[test]
fn test_remove_component_after_recording() {
    let mut container = diamond();
    container.record("run").unwrap();
    let err = container.remove_component("B").unwrap_err();
    assert!(matches!(err, CoreError::ComponentLocked { .. }));
    let err = container.replace_component(one_to_one("C")).unwrap_err();
    assert!(matches!(err, CoreError::ComponentLocked { .. }));
}

#[test]
fn test_remove_component_before_recording() {
    let mut container = diamond();
    let removed = container.remove_component("B").unwrap();
    assert_eq!(removed.scope(), "B");
    assert!(container.sub_component("B").is_none());
}

#[test]
fn test_record_exposes_calls() {
    let container = diamond();
    let trace = container.record("run").unwrap();
    assert_eq!(trace.params, ["input1", "input2"]);
    assert_eq!(trace.calls.len(), 5);
    assert_eq!(trace.num_outputs(), 1);
}

// ============================================================================
// Backends
// ============================================================================

#[test]
fn test_eager_matches_deferred() {
    let deferred =
        ComponentTest::with_backend(diamond(), scalar_spaces(), Arc::new(DeferredBackend::new()))
            .unwrap();
    let eager =
        ComponentTest::with_backend(diamond(), scalar_spaces(), Arc::new(EagerBackend::new()))
            .unwrap();

    for (a, b) in [(1.1, 0.5), (-3.0, 2.25), (0.0, 0.0), (100.0, -42.5)] {
        let inputs = vec![Tensor::scalar(a), Tensor::scalar(b)];
        let x = deferred.built().execute_one("run", inputs.clone()).unwrap();
        let y = eager.built().execute_one("run", inputs).unwrap();
        assert!(x.all_close(&y, 1e-6), "{x:?} != {y:?}");
    }
}

#[test]
fn test_eager_from_config() {
    let test = ComponentTest::with_config(diamond(), scalar_spaces(), EngineConfig::eager()).unwrap();
    assert_eq!(test.built().backend().name(), "eager");
    test.test_scalars("run", &[1.1, 0.5], &[5.6]);
}

#[test]
fn test_concurrent_execution() {
    let test = ComponentTest::new(diamond(), scalar_spaces()).unwrap();
    let built = Arc::clone(test.built());

    thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let built = Arc::clone(&built);
                s.spawn(move || {
                    let a = i as f32;
                    (0..25)
                        .map(|_| {
                            built
                                .execute_one("run", vec![Tensor::scalar(a), Tensor::scalar(1.0)])
                                .unwrap()
                                .as_scalar()
                                .unwrap()
                        })
                        .all(|v| (v - (a + 2.0 + 3.0)).abs() < 1e-5)
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    });
}

#[test]
fn test_batched_input() {
    let test = ComponentTest::new(one_to_one("A"), [("input1", Space::scalar().with_batch_rank())])
        .unwrap();
    let out = test
        .built()
        .execute_one("run", vec![Tensor::vector(vec![1.0, 2.0, 3.0])])
        .unwrap();
    assert_eq!(out.shape, vec![3]);
    assert!(out.all_close(&Tensor::vector(vec![2.0, 3.0, 4.0]), 1e-6));
}

#[test]
fn test_input_shape_mismatch() {
    let test = ComponentTest::new(one_to_one("A"), [("input1", Space::float(vec![2]))]).unwrap();
    let err = test
        .built()
        .execute_one("run", vec![Tensor::vector(vec![1.0, 2.0, 3.0])])
        .unwrap_err();
    assert!(matches!(err, CoreError::ShapeMismatch { .. }));
}

// ============================================================================
// Variables and configuration
// ============================================================================

fn with_var(scope: &str) -> Component {
    let mut c = Component::new(scope);
    c.add_variable("constant_variable", Tensor::scalar(2.0)).unwrap();
    c.define_api_graph_fn(
        "run_plus",
        &["input_"],
        GraphFn::new("plus", 1, 1, |ctx, args| {
            let v = ctx.variable("constant_variable")?;
            Ok(vec![ctx.add(args[0].leaf()?, &v)?.into()])
        }),
    )
    .unwrap();
    c.define_api_graph_fn(
        "run_minus",
        &["input_"],
        GraphFn::new("minus", 1, 1, |ctx, args| {
            let v = ctx.variable("constant_variable")?;
            Ok(vec![ctx.sub(args[0].leaf()?, &v)?.into()])
        }),
    )
    .unwrap();
    c
}

#[test]
fn test_variables() {
    let test = ComponentTest::new(with_var("dummy-with-var"), [("input_", Space::scalar())])
        .unwrap()
        .with_tolerance(1e-4);
    test.test_scalars("run_plus", &[1.23456], &[3.23456]);
    test.test_scalars("run_minus", &[1.23456], &[-0.76544]);
    assert_eq!(
        test.built().variable_names(),
        ["dummy-with-var/constant_variable"]
    );
}

#[test]
fn test_variable_order() {
    let mut container = Component::new("container");
    container.add_variable("w", Tensor::scalar(0.0)).unwrap();
    let mut a = one_to_one("A");
    a.add_variable("a", Tensor::zeros(vec![2])).unwrap();
    let mut b = one_to_one("B");
    b.add_variable("b1", Tensor::scalar(1.0)).unwrap();
    b.add_variable("b2", Tensor::scalar(2.0)).unwrap();
    container.add_components(vec![a, b]).unwrap();
    container
        .define_api_method("run", &["x"], |ctx, args| {
            let y = ctx.call_one("A", "run", &args)?;
            ctx.call("B", "run", &[y])
        })
        .unwrap();

    let test = ComponentTest::new(container, [("x", Space::scalar())]).unwrap();
    assert_eq!(
        test.built().variable_names(),
        ["container/w", "container/A/a", "container/B/b1", "container/B/b2"]
    );
}

#[test]
fn test_configured_small_number() {
    let mut floor = Component::new("floor");
    floor
        .define_api_graph_fn(
            "run",
            &["x"],
            GraphFn::new("floor", 1, 1, |ctx, args| {
                let eps = ctx.small_number();
                Ok(vec![ctx.maximum(args[0].leaf()?, eps)?.into()])
            }),
        )
        .unwrap();

    let config = EngineConfig::default().with_small_number(1e-3);
    let test = ComponentTest::with_config(floor, [("x", Space::scalar())], config).unwrap();
    test.test_scalars("run", &[-4.0], &[1e-3]);
    test.test_scalars("run", &[0.5], &[0.5]);
}
