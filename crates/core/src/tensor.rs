//! # Runtime Tensors
//!
//! `Tensor` is the value type both backends compute with: a shape plus
//! row-major `f32` data. Integer and bool spaces are carried as `f32` too;
//! the space records the logical dtype.
//!
//! Binary operations broadcast with right-aligned dimensions, so a
//! `[batch, n]` value combines with an `[n]` value or a scalar.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// A dynamically shaped tensor.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    /// Shape of the tensor
    pub shape: Vec<usize>,
    /// Flattened data in row-major order
    pub data: Vec<f32>,
}

impl Tensor {
    /// Create a scalar tensor.
    pub fn scalar(value: f32) -> Self {
        Self {
            shape: vec![],
            data: vec![value],
        }
    }

    /// Create a 1D vector tensor.
    pub fn vector(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    /// Create a tensor from data with given shape.
    pub fn from_data(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, CoreError> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(CoreError::ShapeMismatch {
                op: "from_data".to_string(),
                expected: shape,
                got: vec![data.len()],
            });
        }
        Ok(Self { shape, data })
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::full(shape, 0.0)
    }

    /// Create a tensor filled with a constant value.
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            data: vec![value; size],
        }
    }

    /// Total number of elements.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// The single element of a one-element tensor.
    pub fn as_scalar(&self) -> Option<f32> {
        match self.data.as_slice() {
            [value] => Some(*value),
            _ => None,
        }
    }

    /// Apply `f` element-wise.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&x| f(x)).collect(),
        }
    }

    /// Element-wise combination with broadcasting.
    pub fn zip_with(
        &self,
        other: &Tensor,
        op: &str,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<Tensor, CoreError> {
        if self.shape == other.shape {
            let data = self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect();
            return Ok(Tensor {
                shape: self.shape.clone(),
                data,
            });
        }

        let shape = broadcast_shapes(&self.shape, &other.shape).ok_or_else(|| {
            CoreError::ShapeMismatch {
                op: op.to_string(),
                expected: self.shape.clone(),
                got: other.shape.clone(),
            }
        })?;
        let size: usize = shape.iter().product();
        let mut data = Vec::with_capacity(size);
        for flat in 0..size {
            let a = self.data[broadcast_index(flat, &shape, &self.shape)];
            let b = other.data[broadcast_index(flat, &shape, &other.shape)];
            data.push(f(a, b));
        }
        Ok(Tensor { shape, data })
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor, CoreError> {
        self.zip_with(other, "add", |a, b| a + b)
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor, CoreError> {
        self.zip_with(other, "sub", |a, b| a - b)
    }

    pub fn mul(&self, other: &Tensor) -> Result<Tensor, CoreError> {
        self.zip_with(other, "mul", |a, b| a * b)
    }

    pub fn div(&self, other: &Tensor) -> Result<Tensor, CoreError> {
        self.zip_with(other, "div", |a, b| a / b)
    }

    /// Numerically stable softmax over the last axis.
    pub fn softmax_last(&self) -> Tensor {
        let width = self.shape.last().copied().unwrap_or(1).max(1);
        let mut data = Vec::with_capacity(self.data.len());
        for row in self.data.chunks(width) {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let exps: Vec<f32> = row.iter().map(|&x| (x - max).exp()).collect();
            let total: f32 = exps.iter().sum();
            data.extend(exps.iter().map(|e| e / total));
        }
        Tensor {
            shape: self.shape.clone(),
            data,
        }
    }

    /// Part `index` of `parts` equal slices along the last axis.
    pub fn split_last(&self, parts: usize, index: usize) -> Result<Tensor, CoreError> {
        let last = self.shape.last().copied().unwrap_or(0);
        if parts == 0 || index >= parts || last % parts != 0 {
            return Err(CoreError::ShapeMismatch {
                op: format!("split_last({parts})"),
                expected: vec![parts],
                got: self.shape.clone(),
            });
        }
        let width = last / parts;
        let data = self
            .data
            .chunks(last)
            .flat_map(|row| row[index * width..(index + 1) * width].iter().copied())
            .collect();
        let mut shape = self.shape.clone();
        if let Some(dim) = shape.last_mut() {
            *dim = width;
        }
        Ok(Tensor { shape, data })
    }

    /// Drop a trailing dimension of size one.
    pub fn squeeze_last(&self) -> Result<Tensor, CoreError> {
        match self.shape.last() {
            Some(1) => Ok(Tensor {
                shape: self.shape[..self.shape.len() - 1].to_vec(),
                data: self.data.clone(),
            }),
            _ => Err(CoreError::ShapeMismatch {
                op: "squeeze_last".to_string(),
                expected: vec![1],
                got: self.shape.clone(),
            }),
        }
    }

    /// Sum of all elements.
    pub fn sum_all(&self) -> f32 {
        self.data.iter().sum()
    }

    /// Same shape and every element within `tol`.
    pub fn all_close(&self, other: &Tensor, tol: f32) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(a, b)| (a - b).abs() <= tol)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let ([], [value]) = (self.shape.as_slice(), self.data.as_slice()) {
            write!(f, "Tensor({value})")
        } else if self.data.len() <= 10 {
            write!(f, "Tensor({:?}, {:?})", self.shape, self.data)
        } else {
            write!(
                f,
                "Tensor({:?}, [{}, {}, ... {} more])",
                self.shape,
                self.data[0],
                self.data[1],
                self.data.len() - 2
            )
        }
    }
}

impl From<f32> for Tensor {
    fn from(value: f32) -> Self {
        Tensor::scalar(value)
    }
}

/// Right-aligned broadcast of two shapes, or `None` if incompatible.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut shape = vec![0; rank];
    for i in 0..rank {
        let da = dim_from_right(a, rank - 1 - i);
        let db = dim_from_right(b, rank - 1 - i);
        shape[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(shape)
}

fn dim_from_right(shape: &[usize], from_right: usize) -> usize {
    if from_right < shape.len() {
        shape[shape.len() - 1 - from_right]
    } else {
        1
    }
}

fn broadcast_index(flat: usize, out_shape: &[usize], in_shape: &[usize]) -> usize {
    let mut remaining = flat;
    let mut index = 0;
    let mut stride = 1;
    for (axis, &out_dim) in out_shape.iter().enumerate().rev() {
        let coord = remaining % out_dim;
        remaining /= out_dim;
        let from_right = out_shape.len() - 1 - axis;
        if from_right < in_shape.len() {
            let in_dim = in_shape[in_shape.len() - 1 - from_right];
            if in_dim != 1 {
                index += coord * stride;
            }
            stride *= in_dim;
        }
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_data_checks_length() {
        assert!(Tensor::from_data(vec![2, 2], vec![1.0, 2.0, 3.0]).is_err());
        assert!(Tensor::from_data(vec![2, 2], vec![1.0; 4]).is_ok());
    }

    #[test]
    fn test_broadcast_add() {
        let a = Tensor::from_data(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = Tensor::vector(vec![10.0, 20.0]);
        let c = a.add(&b).unwrap();
        assert_eq!(c.shape, vec![2, 2]);
        assert_eq!(c.data, vec![11.0, 22.0, 13.0, 24.0]);

        let d = a.mul(&Tensor::scalar(2.0)).unwrap();
        assert_eq!(d.data, vec![2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_broadcast_mismatch() {
        let a = Tensor::vector(vec![1.0, 2.0, 3.0]);
        let b = Tensor::vector(vec![1.0, 2.0]);
        assert!(matches!(a.add(&b), Err(CoreError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let t = Tensor::from_data(vec![2, 3], vec![1.0, 2.0, 3.0, 1000.0, 0.0, -1000.0]).unwrap();
        let s = t.softmax_last();
        for row in s.data.chunks(3) {
            let total: f32 = row.iter().sum();
            assert!((total - 1.0).abs() < 1e-5);
            assert!(row.iter().all(|x| x.is_finite()));
        }
    }

    #[test]
    fn test_split_last() {
        let t = Tensor::from_data(vec![2, 4], (0..8).map(|x| x as f32).collect()).unwrap();
        let second = t.split_last(2, 1).unwrap();
        assert_eq!(second.shape, vec![2, 2]);
        assert_eq!(second.data, vec![2.0, 3.0, 6.0, 7.0]);
        assert!(t.split_last(3, 0).is_err());
    }

    #[test]
    fn test_squeeze_last() {
        let t = Tensor::from_data(vec![3, 1], vec![1.0, 2.0, 3.0]).unwrap();
        assert_eq!(t.squeeze_last().unwrap().shape, vec![3]);
        assert!(Tensor::vector(vec![1.0, 2.0]).squeeze_last().is_err());
    }
}
