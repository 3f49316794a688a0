//! Error types for distribution adapters.

use compgraph_core::CoreError;
use thiserror::Error;

/// Errors that can occur when configuring or wiring an adapter.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProbError {
    /// A categorical adapter needs a discrete action space with categories.
    #[error("Action space {space} has no categories")]
    MissingCategories { space: String },

    /// The action space holds no elements.
    #[error("Action space {space} is empty")]
    EmptyActionSpace { space: String },

    /// An epsilon override outside the open interval (0, 1).
    #[error("small_number must be in (0, 1), got {value}")]
    InvalidSmallNumber { value: f32 },

    /// Assembly error from the component engine.
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Check an epsilon override; zero or anything at or above one breaks the
/// probability floor and the logit clamp.
pub(crate) fn check_small_number(value: f32) -> Result<f32, ProbError> {
    if value > 0.0 && value < 1.0 {
        Ok(value)
    } else {
        Err(ProbError::InvalidSmallNumber { value })
    }
}
