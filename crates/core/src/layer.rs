//! Thin layer helper: a component with a single `apply` API method backed
//! by a flatten + split graph function, so the body only ever sees leaves.

use crate::component::Component;
use crate::error::CoreError;
use crate::graph_fn::{Arity, FnValue, GraphFn, GraphFnContext};

/// Name of the API method every layer exposes.
pub const APPLY: &str = "apply";

/// Build a layer component named `scope`.
///
/// The `apply` method takes `input1 .. inputN` (N from `arity`, its minimum
/// for variadic arities) and returns `num_outputs` values, each with the
/// structure of the first structured input.
pub fn layer<F>(
    scope: impl Into<String>,
    arity: impl Into<Arity>,
    num_outputs: usize,
    body: F,
) -> Result<Component, CoreError>
where
    F: Fn(&mut GraphFnContext<'_>, Vec<FnValue>) -> Result<Vec<FnValue>, CoreError>
        + Send
        + Sync
        + 'static,
{
    let arity = arity.into();
    let count = match arity {
        Arity::Exact(n) | Arity::AtLeast(n) => n,
    };
    let params: Vec<String> = (1..=count).map(|i| format!("input{i}")).collect();
    let params: Vec<&str> = params.iter().map(String::as_str).collect();

    let mut component = Component::new(scope);
    component.define_api_graph_fn(
        APPLY,
        &params,
        GraphFn::new(APPLY, arity, num_outputs, body).split_inputs(true),
    )?;
    Ok(component)
}

/// Ready-made layers.
pub struct Layer;

impl Layer {
    /// A layer returning its `arity` inputs unchanged.
    pub fn identity(scope: impl Into<String>, arity: usize) -> Result<Component, CoreError> {
        layer(scope, arity, arity, |_ctx, args| Ok(args))
    }
}
