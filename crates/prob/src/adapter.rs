//! The adapter contract and its component wrapper.

use std::fmt;
use std::sync::Arc;

use compgraph_core::graph_fn::{DataOp, FnValue, GraphFn, GraphFnContext};
use compgraph_core::ops::LeafOp;
use compgraph_core::{BoxSpace, Component, CoreError};
use tracing::debug;

use crate::error::ProbError;

/// Name of the API method every adapter component exposes.
pub const GET_PARAMETERS: &str = "get_parameters";

/// What an adapter extracts from network outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterParameters {
    pub parameters: DataOp,
    pub probabilities: Option<DataOp>,
    pub log_probabilities: Option<DataOp>,
}

/// Maps raw network outputs to distribution parameters.
pub trait ActionAdapter: Send + Sync + fmt::Debug {
    fn action_space(&self) -> &BoxSpace;

    /// Number of network units and the shape they are reshaped to.
    fn units_and_shape(&self) -> Result<(usize, Vec<usize>), ProbError>;

    /// Whether [`parameters_from_outputs`](Self::parameters_from_outputs)
    /// also returns probabilities and log-probabilities.
    fn returns_probabilities(&self) -> bool;

    /// Build the parameter ops from `outputs`, shaped as
    /// [`units_and_shape`](Self::units_and_shape) says.
    fn parameters_from_outputs(
        &self,
        ctx: &mut GraphFnContext<'_>,
        outputs: &LeafOp,
    ) -> Result<AdapterParameters, CoreError>;
}

/// Wrap `adapter` as a component with one API method,
/// `get_parameters(adapter_outputs)`.
///
/// It returns the parameters alone, or parameters, probabilities and
/// log-probabilities when the adapter produces them.
pub fn adapter_component<A>(scope: impl Into<String>, adapter: A) -> Result<Component, ProbError>
where
    A: ActionAdapter + 'static,
{
    let scope = scope.into();
    let (units, shape) = adapter.units_and_shape()?;
    let with_probs = adapter.returns_probabilities();
    debug!(
        scope = %scope,
        action_space = %adapter.action_space(),
        units,
        ?shape,
        "adapter component"
    );

    let adapter = Arc::new(adapter);
    let num_outputs = if with_probs { 3 } else { 1 };
    let extract = GraphFn::new("parameters", 1, num_outputs, move |ctx, args| {
        let extracted = adapter.parameters_from_outputs(ctx, args[0].leaf()?)?;
        let mut outputs = vec![FnValue::from(extracted.parameters)];
        if with_probs {
            let missing = || CoreError::StructureMismatch {
                reason: format!("{adapter:?} returned no probabilities"),
            };
            outputs.push(extracted.probabilities.ok_or_else(missing)?.into());
            outputs.push(extracted.log_probabilities.ok_or_else(missing)?.into());
        }
        Ok(outputs)
    });

    let mut component = Component::new(scope);
    component.define_api_graph_fn(GET_PARAMETERS, &["adapter_outputs"], extract)?;
    Ok(component)
}
