//! Categorical distribution adapter.

use compgraph_core::graph_fn::GraphFnContext;
use compgraph_core::ops::LeafOp;
use compgraph_core::{BoxSpace, CoreError, Structure};

use crate::adapter::{ActionAdapter, AdapterParameters};
use crate::error::{check_small_number, ProbError};

/// Produces logits, probabilities and log-probabilities over the categories
/// of a discrete action space.
///
/// Probabilities are floored at ε so their logs stay finite.
#[derive(Debug, Clone)]
pub struct CategoricalAdapter {
    action_space: BoxSpace,
    num_categories: usize,
    small_number: Option<f32>,
}

impl CategoricalAdapter {
    pub fn new(action_space: BoxSpace) -> Result<Self, ProbError> {
        let num_categories = match action_space.num_categories {
            Some(n) if n > 0 => n,
            _ => {
                return Err(ProbError::MissingCategories {
                    space: action_space.to_string(),
                })
            }
        };
        Ok(Self {
            action_space,
            num_categories,
            small_number: None,
        })
    }

    /// Use `small_number` instead of the engine's epsilon; it must lie in
    /// (0, 1).
    pub fn with_small_number(mut self, small_number: f32) -> Result<Self, ProbError> {
        self.small_number = Some(check_small_number(small_number)?);
        Ok(self)
    }

    pub fn num_categories(&self) -> usize {
        self.num_categories
    }
}

impl ActionAdapter for CategoricalAdapter {
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
        shape.push(self.num_categories);
        Ok((flat_dim * self.num_categories, shape))
    }

    fn returns_probabilities(&self) -> bool {
        true
    }

    fn parameters_from_outputs(
        &self,
        ctx: &mut GraphFnContext<'_>,
        outputs: &LeafOp,
    ) -> Result<AdapterParameters, CoreError> {
        let eps = self.small_number.unwrap_or(ctx.small_number());
        let logits = ctx.identity(outputs)?;
        let softmax = ctx.softmax(&logits)?;
        let probs = ctx.maximum(&softmax, eps)?;
        let log_probs = ctx.log(&probs)?;

        Ok(AdapterParameters {
            parameters: Structure::Leaf(logits),
            probabilities: Some(Structure::Leaf(probs)),
            log_probabilities: Some(Structure::Leaf(log_probs)),
        })
    }
}
