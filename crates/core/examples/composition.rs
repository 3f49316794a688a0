//! # Composition Example
//!
//! Assembles the diamond
//!
//! ```text
//! input1 ─▶ A ─▶ B ─┐
//!                   ├─▶ D ─▶ output
//! input2 ─▶ A ─▶ C ─┘
//! ```
//!
//! from four reusable components, builds it on both backends and runs it.
//!
//! Run with: `cargo run -p compgraph-core --example composition`

use std::sync::Arc;

use compgraph_core::{
    Backend, Component, CoreError, DeferredBackend, EagerBackend, GraphBuilder, GraphFn, Space,
    Tensor,
};

fn plus_one(scope: &str) -> Result<Component, CoreError> {
    let mut c = Component::new(scope);
    c.define_api_graph_fn(
        "run",
        &["input1"],
        GraphFn::new("plus_one", 1, 1, |ctx, args| {
            let one = ctx.constant(1.0)?;
            Ok(vec![ctx.add(args[0].leaf()?, &one)?.into()])
        }),
    )?;
    Ok(c)
}

fn merge(scope: &str) -> Result<Component, CoreError> {
    let mut c = Component::new(scope);
    c.define_api_graph_fn(
        "run",
        &["input1", "input2"],
        GraphFn::new("merge", 2, 1, |ctx, args| {
            Ok(vec![ctx.add(args[0].leaf()?, args[1].leaf()?)?.into()])
        }),
    )?;
    Ok(c)
}

fn diamond() -> Result<Component, CoreError> {
    let mut container = Component::new("container");
    container.add_components(vec![plus_one("A")?, plus_one("B")?, plus_one("C")?, merge("D")?])?;
    container.define_api_method("run", &["input1", "input2"], |ctx, args| {
        let left = ctx.call_one("A", "run", &args[..1])?;
        let right = ctx.call_one("A", "run", &args[1..])?;
        let left = ctx.call_one("B", "run", &[left])?;
        let right = ctx.call_one("C", "run", &[right])?;
        ctx.call("D", "run", &[left, right])
    })?;
    Ok(container)
}

fn main() -> Result<(), CoreError> {
    println!("=== Component Graph Composition ===\n");

    let backends: [Arc<dyn Backend>; 2] = [Arc::new(DeferredBackend::new()), Arc::new(EagerBackend::new())];
    for backend in backends {
        let mut builder = GraphBuilder::new(diamond()?, backend);
        let built = builder.build([("input1", Space::scalar()), ("input2", Space::scalar())])?;

        println!("Backend: {}", built.backend().name());
        println!("  state:       {}", builder.state());
        println!("  ops:         {}", built.op_count());
        println!(
            "  call graph:  {} callables, {} calls",
            built.call_graph().node_count(),
            built.call_graph().edge_count()
        );
        print!("  order:      ");
        for site in built.call_graph().topological_order() {
            print!(" {site}");
        }
        println!();

        let out = built.execute_one("run", vec![Tensor::scalar(1.1), Tensor::scalar(0.5)])?;
        println!("  run(1.1, 0.5) = {out:?}\n");
    }

    println!("=== Done ===");
    Ok(())
}
