//! Beta distribution adapter.

use compgraph_core::graph_fn::GraphFnContext;
use compgraph_core::ops::LeafOp;
use compgraph_core::{BoxSpace, CoreError, Structure};

use crate::adapter::{ActionAdapter, AdapterParameters};
use crate::error::{check_small_number, ProbError};

/// Produces `(alpha, beta)` for a Beta distribution over a bounded
/// continuous action space.
///
/// Both parameters are `softplus(clamp(x, ln ε, −ln ε)) + 1`, so they are
/// finite and strictly greater than one.
#[derive(Debug, Clone)]
pub struct BetaAdapter {
    action_space: BoxSpace,
    small_number: Option<f32>,
}

impl BetaAdapter {
    pub fn new(action_space: BoxSpace) -> Self {
        Self {
            action_space,
            small_number: None,
        }
    }

    /// Use `small_number` instead of the engine's epsilon; it must lie in
    /// (0, 1).
    pub fn with_small_number(mut self, small_number: f32) -> Result<Self, ProbError> {
        self.small_number = Some(check_small_number(small_number)?);
        Ok(self)
    }

    fn is_scalar(&self) -> bool {
        self.action_space.shape.is_empty()
    }
}

impl ActionAdapter for BetaAdapter {
    fn action_space(&self) -> &BoxSpace {
        &self.action_space
    }

    fn units_and_shape(&self) -> Result<(usize, Vec<usize>), ProbError> {
        let flat_dim = self.action_space.flat_dim();
        if flat_dim == 0 {
            return Err(ProbError::EmptyActionSpace {
                space: self.action_space.to_string(),
            });
        }
        let mut shape = self.action_space.shape.clone();
        match shape.last_mut() {
            Some(last) => *last *= 2,
            None => shape.push(2),
        }
        Ok((2 * flat_dim, shape))
    }

    fn returns_probabilities(&self) -> bool {
        false
    }

    fn parameters_from_outputs(
        &self,
        ctx: &mut GraphFnContext<'_>,
        outputs: &LeafOp,
    ) -> Result<AdapterParameters, CoreError> {
        let log_eps = self.small_number.unwrap_or(ctx.small_number()).ln();
        let clamped = ctx.clamp(outputs, log_eps, -log_eps)?;
        let soft = ctx.softplus(&clamped)?;
        let one = ctx.constant(1.0)?;
        let params = ctx.add(&soft, &one)?;

        let mut alpha = ctx.split_last(&params, 2, 0)?;
        let mut beta = ctx.split_last(&params, 2, 1)?;
        if self.is_scalar() {
            alpha = ctx.squeeze_last(&alpha)?;
            beta = ctx.squeeze_last(&beta)?;
        }

        Ok(AdapterParameters {
            parameters: Structure::tuple([Structure::Leaf(alpha), Structure::Leaf(beta)]),
            probabilities: None,
            log_probabilities: None,
        })
    }
}
