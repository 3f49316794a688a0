//! Small building-block components shared by the integration tests.

#![allow(dead_code)]

use compgraph_core::{Component, FnValue, GraphFn};

/// One input, one output: `x + constant`.
pub fn adder(scope: &str, constant: f32) -> Component {
    let mut c = Component::new(scope);
    c.define_api_graph_fn(
        "run",
        &["input1"],
        GraphFn::new("add_constant", 1, 1, move |ctx, args| {
            let k = ctx.constant(constant)?;
            Ok(vec![ctx.add(args[0].leaf()?, &k)?.into()])
        }),
    )
    .unwrap();
    c
}

/// `x + 1.0`.
pub fn one_to_one(scope: &str) -> Component {
    adder(scope, 1.0)
}

/// One input, two outputs: `(x, x + 1.0)`.
pub fn one_to_two(scope: &str) -> Component {
    let mut c = Component::new(scope);
    c.define_api_graph_fn(
        "run",
        &["input1"],
        GraphFn::new("fork", 1, 2, |ctx, args| {
            let x = args[0].leaf()?;
            let one = ctx.constant(1.0)?;
            let same = ctx.identity(x)?;
            let plus = ctx.add(x, &one)?;
            Ok(vec![same.into(), plus.into()])
        }),
    )
    .unwrap();
    c
}

/// Two inputs, one output: `a + b`.
pub fn two_to_one(scope: &str) -> Component {
    let mut c = Component::new(scope);
    c.define_api_graph_fn(
        "run",
        &["input1", "input2"],
        GraphFn::new("sum", 2, 1, |ctx, args| {
            Ok(vec![ctx.add(args[0].leaf()?, args[1].leaf()?)?.into()])
        }),
    )
    .unwrap();
    c
}

/// Variadic sum over leaf arguments.
pub fn sum_fn(name: &str) -> GraphFn {
    GraphFn::new(name, compgraph_core::Arity::AtLeast(1), 1, |ctx, args| {
        let mut total = ctx.identity(args[0].leaf()?)?;
        for arg in &args[1..] {
            total = ctx.add(&total, arg.leaf()?)?;
        }
        Ok(vec![FnValue::from(total)])
    })
}
