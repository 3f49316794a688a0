//! # Spaces - Types of Component Arguments
//!
//! A space describes what flows through an API-method argument: shape,
//! element type, and for discrete values the number of categories. Spaces
//! are the objects that calls connect; two call paths that feed the same
//! argument must agree on its space.
//!
//! ## Structured spaces
//!
//! `Space` is a [`Structure`] of [`BoxSpace`] leaves, so a dict or tuple
//! space is just a nested structure. A leaf may carry a batch rank: the
//! runtime value then has one extra leading dimension of any size.
//!
//! ## Compatibility
//!
//! Two spaces are compatible when they have the same tree shape, the same
//! dict keys, and leaves with equal shape and dtype. Batch rank, value
//! bounds and category counts are not part of the check; when two
//! compatible spaces meet, [`Space::refine`] keeps the categories and
//! bounds that either one carries.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;
use crate::structure::Structure;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Float32,
    Int32,
    Bool,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::Float32 => write!(f, "float32"),
            DType::Int32 => write!(f, "int32"),
            DType::Bool => write!(f, "bool"),
        }
    }
}

/// A single (non-structured) space: one tensor type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxSpace {
    /// Feature dimensions (empty = scalar); the batch dimension is not included.
    pub shape: Vec<usize>,
    pub dtype: DType,
    /// Discrete values index into `num_categories` categories.
    #[serde(default)]
    pub discrete: bool,
    #[serde(default)]
    pub num_categories: Option<usize>,
    /// Optional `(low, high)` value bounds; informational only.
    #[serde(default)]
    pub bounds: Option<(f32, f32)>,
    /// Whether runtime values carry a leading batch dimension.
    #[serde(default)]
    pub batch_rank: bool,
}

impl BoxSpace {
    /// Continuous float space of the given shape.
    pub fn float(shape: Vec<usize>) -> Self {
        Self {
            shape,
            dtype: DType::Float32,
            discrete: false,
            num_categories: None,
            bounds: None,
            batch_rank: false,
        }
    }

    /// Discrete int space with `num_categories` categories per element.
    pub fn discrete(shape: Vec<usize>, num_categories: usize) -> Result<Self, CoreError> {
        let space = Self {
            shape,
            dtype: DType::Int32,
            discrete: true,
            num_categories: Some(num_categories),
            bounds: None,
            batch_rank: false,
        };
        space.validate()?;
        Ok(space)
    }

    /// Bool space of the given shape.
    pub fn boolean(shape: Vec<usize>) -> Self {
        Self {
            dtype: DType::Bool,
            ..Self::float(shape)
        }
    }

    /// Number of scalar elements in one (unbatched) value.
    pub fn flat_dim(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Runtime shape for a batch of `batch` values.
    pub fn batched_shape(&self, batch: usize) -> Vec<usize> {
        let mut shape = Vec::with_capacity(self.shape.len() + 1);
        shape.push(batch);
        shape.extend_from_slice(&self.shape);
        shape
    }

    /// Check the discrete-category invariant and bounds ordering.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.discrete {
            match self.num_categories {
                Some(n) if n >= 1 => {}
                other => {
                    return Err(CoreError::InvalidSpace {
                        reason: format!(
                            "discrete space needs num_categories >= 1, got {other:?}"
                        ),
                    })
                }
            }
        }
        if let Some((low, high)) = self.bounds {
            if !(low <= high) {
                return Err(CoreError::InvalidSpace {
                    reason: format!("bounds ({low}, {high}) are not ordered"),
                });
            }
        }
        Ok(())
    }

    /// Same shape and dtype; batch rank, bounds and category metadata are
    /// ignored.
    pub fn is_compatible(&self, other: &BoxSpace) -> bool {
        self.shape == other.shape && self.dtype == other.dtype
    }

    /// Fill category metadata and bounds missing here from a compatible
    /// `other`. Anything already set on `self` wins.
    pub fn refine(&self, other: &BoxSpace) -> BoxSpace {
        let mut refined = self.clone();
        if refined.num_categories.is_none() && other.num_categories.is_some() {
            refined.discrete = other.discrete;
            refined.num_categories = other.num_categories;
        }
        if refined.bounds.is_none() {
            refined.bounds = other.bounds;
        }
        refined
    }
}

impl fmt::Display for BoxSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.shape.iter().map(ToString::to_string).collect();
        write!(f, "{}[{}]", self.dtype, dims.join(", "))?;
        if let Some(n) = self.num_categories {
            write!(f, "<{n}>")?;
        }
        if self.batch_rank {
            write!(f, "+batch")?;
        }
        Ok(())
    }
}

/// A possibly structured space.
pub type Space = Structure<BoxSpace>;

impl Structure<BoxSpace> {
    /// Continuous float space of the given shape.
    pub fn float(shape: Vec<usize>) -> Self {
        Structure::Leaf(BoxSpace::float(shape))
    }

    /// Float scalar space.
    pub fn scalar() -> Self {
        Self::float(Vec::new())
    }

    /// Discrete space; `num_categories` must be at least one.
    pub fn discrete(shape: Vec<usize>, num_categories: usize) -> Result<Self, CoreError> {
        BoxSpace::discrete(shape, num_categories).map(Structure::Leaf)
    }

    /// The same space with a batch rank on every leaf.
    pub fn with_batch_rank(&self) -> Self {
        self.map(|leaf| BoxSpace {
            batch_rank: true,
            ..leaf.clone()
        })
    }

    /// Validate every leaf and every dict key.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            Structure::Leaf(leaf) => leaf.validate(),
            Structure::Tuple(items) => items.iter().try_for_each(Structure::validate),
            Structure::Dict(items) => {
                for (name, item) in items {
                    if name.is_empty() || name.contains('/') || name.starts_with('[') {
                        return Err(CoreError::InvalidSpace {
                            reason: format!("'{name}' is not a valid dict key"),
                        });
                    }
                    item.validate()?;
                }
                Ok(())
            }
        }
    }

    /// Structural and leaf-wise compatibility.
    pub fn is_compatible(&self, other: &Space) -> bool {
        match (self, other) {
            (Structure::Leaf(a), Structure::Leaf(b)) => a.is_compatible(b),
            (Structure::Tuple(a), Structure::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.is_compatible(y))
            }
            (Structure::Dict(a), Structure::Dict(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.is_compatible(vb))
            }
            _ => false,
        }
    }

    /// Leaf-wise [`BoxSpace::refine`]; mismatched structure keeps `self`.
    pub fn refine(&self, other: &Space) -> Space {
        match (self, other) {
            (Structure::Leaf(a), Structure::Leaf(b)) => Structure::Leaf(a.refine(b)),
            (Structure::Tuple(a), Structure::Tuple(b)) if a.len() == b.len() => {
                Structure::Tuple(a.iter().zip(b).map(|(x, y)| x.refine(y)).collect())
            }
            (Structure::Dict(a), Structure::Dict(b)) if a.len() == b.len() => Structure::Dict(
                a.iter()
                    .zip(b)
                    .map(|((key, x), (_, y))| (key.clone(), x.refine(y)))
                    .collect(),
            ),
            _ => self.clone(),
        }
    }

    /// Total number of scalar elements across all leaves.
    pub fn flat_dim(&self) -> usize {
        self.flatten().values().map(BoxSpace::flat_dim).sum()
    }
}
