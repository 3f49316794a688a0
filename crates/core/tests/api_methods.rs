//! Integration tests for wiring sub-components together through API methods.
//!
//! Each test assembles a small container, builds it through the
//! `ComponentTest` driver and checks the values its entry points compute.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{adder, one_to_one, one_to_two, sum_fn, two_to_one};
use compgraph_core::{
    Backend, CallKind, CallSite, Component, ComponentTest, DeferredBackend, EagerBackend, FnValue,
    GraphFn, InMemorySummarySink, Space, Structure, Tensor,
};

fn scalar_spaces<'a>(names: &[&'a str]) -> Vec<(&'a str, Space)> {
    names.iter().map(|&n| (n, Space::scalar())).collect()
}

// ============================================================================
// Chains and fan-out
// ============================================================================

#[test]
fn test_connecting_two_1to1_components() {
    let mut core = Component::new("container");
    core.add_components(vec![one_to_one("comp1"), one_to_one("comp2")])
        .unwrap();
    core.define_api_method("run", &["input_"], |ctx, args| {
        let out = ctx.call_one("comp1", "run", &args)?;
        ctx.call("comp2", "run", &[out])
    })
    .unwrap();

    let test = ComponentTest::new(core, scalar_spaces(&["input_"])).unwrap();
    test.test_scalars("run", &[1.1], &[3.1]);
    test.test_scalars("run", &[-5.1], &[-3.1]);
}

#[test]
fn test_connecting_1to2_to_2to1() {
    let mut core = Component::new("container");
    core.add_components(vec![one_to_two("comp1"), two_to_one("comp2")])
        .unwrap();
    core.define_api_method("run", &["input_"], |ctx, args| {
        let outs = ctx.call("comp1", "run", &args)?;
        ctx.call("comp2", "run", &outs)
    })
    .unwrap();

    let test = ComponentTest::new(core, scalar_spaces(&["input_"])).unwrap();
    test.test_scalars("run", &[100.9], &[202.8]);
    test.test_scalars("run", &[-5.1], &[-9.2]);
}

#[test]
fn test_1to1_to_2to1_with_constant_input() {
    let mut core = Component::new("container");
    core.add_components(vec![one_to_one("A"), two_to_one("B")])
        .unwrap();
    core.define_api_method("run", &["input_"], |ctx, args| {
        let out = ctx.call_one("A", "run", &args)?;
        let k = ctx.constant(1.1);
        ctx.call("B", "run", &[out, k])
    })
    .unwrap();

    let test = ComponentTest::new(core, scalar_spaces(&["input_"])).unwrap();
    test.test_scalars("run", &[78.4], &[80.5]);
    test.test_scalars("run", &[-5.2], &[-3.1]);

    let b = test.built().root().sub_component("B").unwrap();
    assert_eq!(b.input_spaces().get("input2"), Some(&Space::scalar()));
}

#[test]
fn test_diamond_4x_sub_component_setup() {
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
            let in1_past_a = ctx.call_one("A", "run", &args[..1])?;
            let in2_past_a = ctx.call_one("A", "run", &args[1..])?;
            let past_b = ctx.call_one("B", "run", &[in1_past_a])?;
            let past_c = ctx.call_one("C", "run", &[in2_past_a])?;
            ctx.call("D", "run", &[past_b, past_c])
        })
        .unwrap();

    let test = ComponentTest::new(container, scalar_spaces(&["input1", "input2"])).unwrap();
    test.test_scalars("run", &[1.1, 0.5], &[5.6]);

    let graph = test.built().call_graph();
    let run = CallSite {
        component: "container".to_string(),
        callable: "run".to_string(),
        kind: CallKind::Api,
    };
    let callees: Vec<String> = graph.callees(&run).iter().map(|s| s.component.clone()).collect();
    assert_eq!(
        callees,
        ["container/A", "container/A", "container/B", "container/C", "container/D"]
    );
    let order = graph.topological_order();
    assert_eq!(order.last().map(|s| s.component.as_str()), Some("container"));
}

#[test]
fn test_call_in_comprehension() {
    let mut container = Component::new("container");
    container
        .add_components((0..3).map(|i| one_to_one(&format!("dummy-{i}"))).collect())
        .unwrap();
    container.define_graph_fn(sum_fn("sum")).unwrap();
    container
        .define_api_method("test", &["input_"], |ctx, args| {
            let mut results = Vec::new();
            for scope in ctx.sub_components() {
                results.push(ctx.call_one(&scope, "run", &args)?);
            }
            ctx.graph_fn("sum", &results)
        })
        .unwrap();

    let test = ComponentTest::new(container, scalar_spaces(&["input_"]))
        .unwrap()
        .with_tolerance(1e-2);
    test.test_scalars("test", &[1.23], &[3.0 * (1.23 + 1.0)]);
}

// ============================================================================
// Own methods and nested components
// ============================================================================

fn with_sub_components(scope: &str) -> Component {
    let mut a = Component::new(scope);
    a.add_component(one_to_one("B")).unwrap();
    a.define_graph_fn(GraphFn::new("shift", 2, 1, |ctx, args| {
        Ok(vec![ctx.add(args[0].leaf()?, args[1].leaf()?)?.into()])
    }))
    .unwrap();
    a.define_api_method("run1", &["input_"], |ctx, args| {
        let two = ctx.constant(2.0);
        let shifted = ctx.graph_fn_one("shift", &[args[0], two])?;
        let past_b = ctx.call_one("B", "run", &[shifted])?;
        Ok(vec![shifted, past_b])
    })
    .unwrap();
    a.define_api_method("run2", &["input_"], |ctx, args| {
        let minus_two = ctx.constant(-2.0);
        let shifted = ctx.graph_fn_one("shift", &[args[0], minus_two])?;
        ctx.call("B", "run", &[shifted])
    })
    .unwrap();
    a
}

#[test]
fn test_component_with_sub_component() {
    let test = ComponentTest::new(with_sub_components("A"), scalar_spaces(&["input_"])).unwrap();
    test.test_scalars("run1", &[1.1], &[3.1, 4.1]);
    test.test_scalars("run2", &[1.1], &[0.1]);
}

#[test]
fn test_own_method_and_relative_paths() {
    let mut container = Component::new("container");
    let mut outer = Component::new("outer");
    outer.add_component(adder("inner", 10.0)).unwrap();
    container.add_component(outer).unwrap();
    container.add_component(adder("sibling", 1.0)).unwrap();

    container
        .define_api_method("deep", &["input_"], |ctx, args| {
            ctx.call("outer/inner", "run", &args)
        })
        .unwrap();
    container
        .define_api_method("twice", &["input_"], |ctx, args| {
            let once = ctx.call_own("deep", &args)?;
            ctx.call_own("deep", &once)
        })
        .unwrap();

    let test = ComponentTest::new(container, scalar_spaces(&["input_"])).unwrap();
    test.test_scalars("deep", &[1.0], &[11.0]);
    test.test_scalars("twice", &[1.0], &[21.0]);
}

#[test]
fn test_methods_traced_at_most_once() {
    let traces = Arc::new(AtomicUsize::new(0));
    let mut counted = Component::new("A");
    let counter = Arc::clone(&traces);
    counted
        .define_graph_fn(GraphFn::new("inc", 1, 1, |ctx, args| {
            let one = ctx.constant(1.0)?;
            Ok(vec![ctx.add(args[0].leaf()?, &one)?.into()])
        }))
        .unwrap();
    counted
        .define_api_method("run", &["x"], move |ctx, args| {
            counter.fetch_add(1, Ordering::SeqCst);
            ctx.graph_fn("inc", &args)
        })
        .unwrap();

    let mut container = Component::new("container");
    container.add_component(counted).unwrap();
    container
        .define_api_method("run", &["x"], |ctx, args| {
            let once = ctx.call_one("A", "run", &args)?;
            let twice = ctx.call_one("A", "run", &[once])?;
            ctx.call("A", "run", &[twice])
        })
        .unwrap();
    container
        .define_api_method("other", &["x"], |ctx, args| ctx.call("A", "run", &args))
        .unwrap();

    let test = ComponentTest::new(container, scalar_spaces(&["x"])).unwrap();
    test.test_scalars("run", &[0.5], &[3.5]);
    test.test_scalars("other", &[0.5], &[1.5]);
    assert_eq!(traces.load(Ordering::SeqCst), 1);

    let a = test.built().root().sub_component("A").unwrap();
    let trace = a.api_method("run").unwrap().trace().unwrap();
    assert_eq!(trace.calls.len(), 1);
}

// ============================================================================
// Structured values
// ============================================================================

#[test]
fn test_split_graph_fn_over_dict_input() {
    let mut container = Component::new("container");
    container
        .define_api_graph_fn(
            "scale",
            &["obs", "factor"],
            GraphFn::new("scale", 2, 1, |ctx, args| {
                Ok(vec![ctx.mul(args[0].leaf()?, args[1].leaf()?)?.into()])
            })
            .split_inputs(true),
        )
        .unwrap();

    let obs_space = Space::dict([("a", Space::scalar()), ("b", Space::float(vec![2]))]);
    let test = ComponentTest::new(
        container,
        [("obs", obs_space), ("factor", Space::scalar())],
    )
    .unwrap();

    let obs = Structure::dict([
        ("a", Structure::Leaf(Tensor::scalar(1.5))),
        ("b", Structure::Leaf(Tensor::vector(vec![1.0, -2.0]))),
    ]);
    let expected = Structure::dict([
        ("a", Structure::Leaf(Tensor::scalar(3.0))),
        ("b", Structure::Leaf(Tensor::vector(vec![2.0, -4.0]))),
    ]);
    test.test(
        "scale",
        vec![obs, Structure::Leaf(Tensor::scalar(2.0))],
        &[expected],
    );
}

// ============================================================================
// Summaries
// ============================================================================

fn summary_container() -> Component {
    let mut container = Component::new("container");
    container
        .define_graph_fn(GraphFn::new("sum", compgraph_core::Arity::AtLeast(1), 1, |ctx, args| {
            let mut total = ctx.identity(args[0].leaf()?)?;
            for arg in &args[1..] {
                total = ctx.add(&total, arg.leaf()?)?;
            }
            ctx.summary("summary_sum", &total)?;
            Ok(vec![FnValue::from(total)])
        }))
        .unwrap();
    container
        .define_graph_fn(GraphFn::new("inc", 1, 1, |ctx, args| {
            let x = args[0].leaf()?;
            ctx.summary("summary_inc", x)?;
            let one = ctx.constant(1.0)?;
            Ok(vec![ctx.add(x, &one)?.into()])
        }))
        .unwrap();
    container
        .define_graph_fn(GraphFn::new("one", 0, 1, |ctx, _args| {
            let one = ctx.constant(1.0)?;
            ctx.summary("summary_graph_api", &one)?;
            Ok(vec![one.into()])
        }))
        .unwrap();
    container
        .define_graph_fn(GraphFn::new("divide", 2, 1, |ctx, args| {
            Ok(vec![ctx.div(args[0].leaf()?, args[1].leaf()?)?.into()])
        }))
        .unwrap();

    container
        .define_api_method("add", &["value", "value2"], |ctx, args| ctx.graph_fn("sum", &args))
        .unwrap();
    container
        .define_api_method("graph_api", &[], |ctx, _args| ctx.graph_fn("one", &[]))
        .unwrap();
    container
        .define_api_method("api_method_double", &["value"], |ctx, args| {
            ctx.call_own("add", &[args[0], args[0]])
        })
        .unwrap();
    container
        .define_api_method("api_method_complex", &["value"], |ctx, args| {
            let doubled = ctx.graph_fn_one("sum", &[args[0], args[0]])?;
            let incremented = ctx.graph_fn_one("inc", &[doubled])?;
            let denominator = ctx.call_one("", "graph_api", &[])?;
            ctx.graph_fn("divide", &[incremented, denominator])
        })
        .unwrap();
    container
        .define_api_method("increment", &["value"], |ctx, args| ctx.graph_fn("inc", &args))
        .unwrap();
    container
}

fn check_summaries(make_backend: impl Fn(InMemorySummarySink) -> Arc<dyn Backend>) {
    let sink = InMemorySummarySink::new();
    let test = ComponentTest::with_backend(
        summary_container(),
        scalar_spaces(&["value", "value2"]),
        make_backend(sink.clone()),
    )
    .unwrap()
    .with_tolerance(1e-2);

    test.test_scalars("add", &[1.0, 2.0], &[3.0]);
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].tag, "container/summary_sum");
    assert_eq!(events[0].value.as_scalar(), Some(3.0));

    test.test_scalars("increment", &[6.0], &[7.0]);
    assert_eq!(sink.events_tagged("container/summary_inc").len(), 1);

    test.test_scalars("graph_api", &[], &[1.0]);
    assert_eq!(sink.events_tagged("container/summary_graph_api").len(), 1);

    test.test_scalars("api_method_double", &[3.0], &[6.0]);
    assert_eq!(sink.events_tagged("container/summary_sum").len(), 2);

    let before = sink.len();
    test.test_scalars("api_method_complex", &[3.0], &[7.0]);
    let tags: Vec<String> = sink.events()[before..].iter().map(|e| e.tag.clone()).collect();
    assert_eq!(
        tags,
        [
            "container/summary_sum",
            "container/summary_inc",
            "container/summary_graph_api"
        ]
    );
}

#[test]
fn test_summaries_deferred() {
    check_summaries(|sink| Arc::new(DeferredBackend::new().with_summary_sink(Arc::new(sink))));
}

#[test]
fn test_summaries_eager() {
    check_summaries(|sink| Arc::new(EagerBackend::new().with_summary_sink(Arc::new(sink))));
}
