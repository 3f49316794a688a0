//! # Leaf Operations
//!
//! Everything a graph function does is expressed as `OpKind`s submitted to an
//! [`OpSink`]. The sink decides what an op *is*:
//!
//! | Sink | Used for | Result of `add_op` |
//! |------|----------|--------------------|
//! | [`ShapeSink`] | space resolution | shape-only handle, no values |
//! | [`OpGraph`](crate::graph::OpGraph) | deferred backend | node in a petgraph DAG |
//! | [`EagerSink`] | eager backend | handle to an already computed tensor |
//!
//! ## Operations
//!
//! | Op | Inputs | Result |
//! |----|--------|--------|
//! | Placeholder / Slot | 0 | fed value |
//! | Constant / Variable | 0 | stored value |
//! | Add, Sub, Mul, Div | 2 | broadcast element-wise |
//! | Neg, Exp, Log, Softplus, Identity | 1 | element-wise |
//! | Maximum, Clamp | 1 | element-wise bound |
//! | Softmax | 1 | over the last axis |
//! | SplitLast, SqueezeLast | 1 | last-axis reshaping |
//! | ReduceSum | 1 | scalar |
//!
//! A [`LeafOp`] is immutable. Its [`OpSignature`] holds the feature shape
//! (batch dimension excluded) and the batch axis, if any.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use crate::error::CoreError;
use crate::space::{BoxSpace, DType};
use crate::tensor::{broadcast_shapes, Tensor};

/// Identifier of an op inside one sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub usize);

/// Static description of an op's value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpSignature {
    /// Feature shape, without the batch dimension.
    pub shape: Vec<usize>,
    pub dtype: DType,
    /// Position of the batch dimension in runtime values, if batched.
    pub batch_axis: Option<usize>,
}

impl OpSignature {
    fn of_space(space: &BoxSpace) -> Self {
        Self {
            shape: space.shape.clone(),
            dtype: space.dtype,
            batch_axis: space.batch_rank.then_some(0),
        }
    }

    fn of_tensor(value: &Tensor) -> Self {
        Self {
            shape: value.shape.clone(),
            dtype: DType::Float32,
            batch_axis: None,
        }
    }
}

/// An immutable handle to an op produced by a sink.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafOp {
    id: OpId,
    signature: OpSignature,
}

impl LeafOp {
    pub fn new(id: OpId, signature: OpSignature) -> Self {
        Self { id, signature }
    }

    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn signature(&self) -> &OpSignature {
        &self.signature
    }

    /// Feature shape (batch dimension excluded).
    pub fn shape(&self) -> &[usize] {
        &self.signature.shape
    }

    pub fn batch_axis(&self) -> Option<usize> {
        self.signature.batch_axis
    }
}

/// The operations a graph function can submit.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// Deferred-mode input, fed by name at run time.
    Placeholder { name: String, space: BoxSpace },
    /// Eager-mode typed input slot.
    Slot { name: String, space: BoxSpace },
    Constant { value: Tensor },
    /// Named persistent value, one per variable per graph.
    Variable { name: String, value: Tensor },
    Identity,
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Exp,
    Log,
    /// `ln(1 + e^x)`
    Softplus,
    /// `max(x, floor)`
    Maximum { floor: f32 },
    Clamp { min: f32, max: f32 },
    Softmax,
    SplitLast { parts: usize, index: usize },
    SqueezeLast,
    ReduceSum,
}

impl OpKind {
    /// Number of inputs this op consumes.
    pub fn num_inputs(&self) -> usize {
        match self {
            OpKind::Placeholder { .. }
            | OpKind::Slot { .. }
            | OpKind::Constant { .. }
            | OpKind::Variable { .. } => 0,
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => 2,
            _ => 1,
        }
    }

    /// Compute the output signature from the input signatures.
    pub fn infer(&self, inputs: &[&OpSignature]) -> Result<OpSignature, CoreError> {
        if inputs.len() != self.num_inputs() {
            return Err(CoreError::arity(self.to_string(), self.num_inputs(), inputs.len()));
        }
        match self {
            OpKind::Placeholder { space, .. } | OpKind::Slot { space, .. } => {
                Ok(OpSignature::of_space(space))
            }
            OpKind::Constant { value } | OpKind::Variable { value, .. } => {
                Ok(OpSignature::of_tensor(value))
            }
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => {
                let (a, b) = (inputs[0], inputs[1]);
                let shape = broadcast_shapes(&a.shape, &b.shape).ok_or_else(|| {
                    CoreError::ShapeMismatch {
                        op: self.to_string(),
                        expected: a.shape.clone(),
                        got: b.shape.clone(),
                    }
                })?;
                Ok(OpSignature {
                    shape,
                    dtype: a.dtype,
                    batch_axis: a.batch_axis.or(b.batch_axis),
                })
            }
            OpKind::Softmax => {
                let input = inputs[0];
                if input.shape.is_empty() {
                    return Err(CoreError::ShapeMismatch {
                        op: self.to_string(),
                        expected: vec![1],
                        got: Vec::new(),
                    });
                }
                Ok(float_like(input))
            }
            OpKind::SplitLast { parts, index } => {
                let input = inputs[0];
                match input.shape.last() {
                    Some(&last) if *parts > 0 && index < parts && last % parts == 0 => {
                        let mut sig = float_like(input);
                        if let Some(dim) = sig.shape.last_mut() {
                            *dim = last / parts;
                        }
                        Ok(sig)
                    }
                    _ => Err(CoreError::ShapeMismatch {
                        op: self.to_string(),
                        expected: vec![*parts],
                        got: input.shape.clone(),
                    }),
                }
            }
            OpKind::SqueezeLast => {
                let input = inputs[0];
                if input.shape.last() != Some(&1) {
                    return Err(CoreError::ShapeMismatch {
                        op: self.to_string(),
                        expected: vec![1],
                        got: input.shape.clone(),
                    });
                }
                let mut sig = input.clone();
                sig.shape.pop();
                Ok(sig)
            }
            OpKind::ReduceSum => Ok(OpSignature {
                shape: Vec::new(),
                dtype: DType::Float32,
                batch_axis: None,
            }),
            OpKind::Identity => Ok(inputs[0].clone()),
            OpKind::Neg
            | OpKind::Exp
            | OpKind::Log
            | OpKind::Softplus
            | OpKind::Maximum { .. }
            | OpKind::Clamp { .. } => Ok(float_like(inputs[0])),
        }
    }

    /// Compute the op's value from input values and their signatures.
    pub fn evaluate(
        &self,
        inputs: &[&Tensor],
        signatures: &[&OpSignature],
    ) -> Result<Tensor, CoreError> {
        if inputs.len() != self.num_inputs() || signatures.len() != inputs.len() {
            return Err(CoreError::arity(self.to_string(), self.num_inputs(), inputs.len()));
        }
        match self {
            OpKind::Placeholder { name, .. } | OpKind::Slot { name, .. } => {
                Err(CoreError::MissingFeed { name: name.clone() })
            }
            OpKind::Constant { value } | OpKind::Variable { value, .. } => Ok(value.clone()),
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => {
                let rank = signatures[0].shape.len().max(signatures[1].shape.len());
                let a = align_batched(inputs[0], signatures[0], rank);
                let b = align_batched(inputs[1], signatures[1], rank);
                match self {
                    OpKind::Add => a.add(&b),
                    OpKind::Sub => a.sub(&b),
                    OpKind::Mul => a.mul(&b),
                    _ => a.div(&b),
                }
            }
            OpKind::Identity => Ok(inputs[0].clone()),
            OpKind::Neg => Ok(inputs[0].map(|x| -x)),
            OpKind::Exp => Ok(inputs[0].map(f32::exp)),
            OpKind::Log => Ok(inputs[0].map(f32::ln)),
            OpKind::Softplus => Ok(inputs[0].map(softplus)),
            OpKind::Maximum { floor } => Ok(inputs[0].map(|x| x.max(*floor))),
            OpKind::Clamp { min, max } => Ok(inputs[0].map(|x| x.max(*min).min(*max))),
            OpKind::Softmax => Ok(inputs[0].softmax_last()),
            OpKind::SplitLast { parts, index } => inputs[0].split_last(*parts, *index),
            OpKind::SqueezeLast => inputs[0].squeeze_last(),
            OpKind::ReduceSum => Ok(Tensor::scalar(inputs[0].sum_all())),
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Placeholder { name, .. } => write!(f, "Placeholder({name})"),
            OpKind::Slot { name, .. } => write!(f, "Slot({name})"),
            OpKind::Constant { value } => write!(f, "Constant({value:?})"),
            OpKind::Variable { name, .. } => write!(f, "Variable({name})"),
            OpKind::Identity => write!(f, "Identity"),
            OpKind::Add => write!(f, "Add"),
            OpKind::Sub => write!(f, "Sub"),
            OpKind::Mul => write!(f, "Mul"),
            OpKind::Div => write!(f, "Div"),
            OpKind::Neg => write!(f, "Neg"),
            OpKind::Exp => write!(f, "Exp"),
            OpKind::Log => write!(f, "Log"),
            OpKind::Softplus => write!(f, "Softplus"),
            OpKind::Maximum { floor } => write!(f, "Maximum({floor})"),
            OpKind::Clamp { min, max } => write!(f, "Clamp({min}, {max})"),
            OpKind::Softmax => write!(f, "Softmax"),
            OpKind::SplitLast { parts, index } => write!(f, "SplitLast({index}/{parts})"),
            OpKind::SqueezeLast => write!(f, "SqueezeLast"),
            OpKind::ReduceSum => write!(f, "ReduceSum"),
        }
    }
}

fn float_like(input: &OpSignature) -> OpSignature {
    OpSignature {
        dtype: DType::Float32,
        ..input.clone()
    }
}

fn softplus(x: f32) -> f32 {
    if x > 20.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

/// Insert unit axes after the batch axis so a batched value's feature rank
/// matches `rank` before right-aligned broadcasting.
fn align_batched<'t>(value: &'t Tensor, sig: &OpSignature, rank: usize) -> Cow<'t, Tensor> {
    if sig.batch_axis.is_none() || sig.shape.len() >= rank || value.shape.is_empty() {
        return Cow::Borrowed(value);
    }
    let mut shape = Vec::with_capacity(rank + 1);
    shape.push(value.shape[0]);
    shape.extend(std::iter::repeat(1).take(rank - sig.shape.len()));
    shape.extend_from_slice(&value.shape[1..]);
    Cow::Owned(Tensor {
        shape,
        data: value.data.clone(),
    })
}

// ============================================================================
// Op sinks
// ============================================================================

/// Receiver of leaf operations; one per materialization pass.
pub trait OpSink {
    /// Submit an op and get its leaf handle back.
    fn add_op(&mut self, kind: OpKind, inputs: &[&LeafOp]) -> Result<LeafOp, CoreError>;

    /// Register `op` as a summary under `tag`.
    fn summary(&mut self, tag: &str, op: &LeafOp) -> Result<(), CoreError>;

    /// The space an op's values live in.
    fn space_of(&self, op: &LeafOp) -> BoxSpace {
        let sig = op.signature();
        BoxSpace {
            shape: sig.shape.clone(),
            dtype: sig.dtype,
            discrete: false,
            num_categories: None,
            bounds: None,
            batch_rank: sig.batch_axis.is_some(),
        }
    }

    fn placeholder(&mut self, name: &str, space: &BoxSpace) -> Result<LeafOp, CoreError> {
        self.add_op(
            OpKind::Placeholder {
                name: name.to_string(),
                space: space.clone(),
            },
            &[],
        )
    }

    fn slot(&mut self, name: &str, space: &BoxSpace) -> Result<LeafOp, CoreError> {
        self.add_op(
            OpKind::Slot {
                name: name.to_string(),
                space: space.clone(),
            },
            &[],
        )
    }

    fn constant(&mut self, value: Tensor) -> Result<LeafOp, CoreError> {
        self.add_op(OpKind::Constant { value }, &[])
    }

    fn variable(&mut self, name: &str, value: &Tensor) -> Result<LeafOp, CoreError> {
        self.add_op(
            OpKind::Variable {
                name: name.to_string(),
                value: value.clone(),
            },
            &[],
        )
    }
}

/// Dry-run sink: infers signatures and spaces without creating anything.
#[derive(Debug, Default)]
pub struct ShapeSink {
    spaces: Vec<BoxSpace>,
    summaries: usize,
}

impl ShapeSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ops seen.
    pub fn op_count(&self) -> usize {
        self.spaces.len()
    }

    pub fn summary_count(&self) -> usize {
        self.summaries
    }
}

impl OpSink for ShapeSink {
    fn add_op(&mut self, kind: OpKind, inputs: &[&LeafOp]) -> Result<LeafOp, CoreError> {
        let sigs: Vec<&OpSignature> = inputs.iter().map(|op| op.signature()).collect();
        let signature = kind.infer(&sigs)?;
        let space = match &kind {
            OpKind::Placeholder { space, .. } | OpKind::Slot { space, .. } => space.clone(),
            _ => BoxSpace {
                shape: signature.shape.clone(),
                dtype: signature.dtype,
                discrete: false,
                num_categories: None,
                bounds: None,
                batch_rank: signature.batch_axis.is_some(),
            },
        };
        let id = OpId(self.spaces.len());
        self.spaces.push(space);
        Ok(LeafOp::new(id, signature))
    }

    fn summary(&mut self, _tag: &str, _op: &LeafOp) -> Result<(), CoreError> {
        self.summaries += 1;
        Ok(())
    }

    fn space_of(&self, op: &LeafOp) -> BoxSpace {
        match self.spaces.get(op.id().0) {
            Some(space) => space.clone(),
            None => BoxSpace {
                shape: op.shape().to_vec(),
                dtype: op.signature().dtype,
                discrete: false,
                num_categories: None,
                bounds: None,
                batch_rank: op.batch_axis().is_some(),
            },
        }
    }
}

/// Immediate-execution sink: every op is computed as soon as it is added.
#[derive(Debug)]
pub struct EagerSink<'f> {
    feeds: &'f HashMap<String, Tensor>,
    values: Vec<Tensor>,
    summaries: Vec<(String, Tensor)>,
}

impl<'f> EagerSink<'f> {
    /// A sink whose slots and placeholders read from `feeds` by name.
    pub fn new(feeds: &'f HashMap<String, Tensor>) -> Self {
        Self {
            feeds,
            values: Vec::new(),
            summaries: Vec::new(),
        }
    }

    /// The computed value of an op.
    pub fn value(&self, op: &LeafOp) -> Result<&Tensor, CoreError> {
        self.values
            .get(op.id().0)
            .ok_or_else(|| CoreError::MissingFeed {
                name: format!("op #{}", op.id().0),
            })
    }

    /// Summaries registered so far, in registration order.
    pub fn take_summaries(&mut self) -> Vec<(String, Tensor)> {
        std::mem::take(&mut self.summaries)
    }
}

impl OpSink for EagerSink<'_> {
    fn add_op(&mut self, kind: OpKind, inputs: &[&LeafOp]) -> Result<LeafOp, CoreError> {
        let sigs: Vec<&OpSignature> = inputs.iter().map(|op| op.signature()).collect();
        let signature = kind.infer(&sigs)?;
        let value = match &kind {
            OpKind::Placeholder { name, .. } | OpKind::Slot { name, .. } => self
                .feeds
                .get(name)
                .cloned()
                .ok_or_else(|| CoreError::MissingFeed { name: name.clone() })?,
            _ => {
                let values = inputs
                    .iter()
                    .map(|op| self.value(op))
                    .collect::<Result<Vec<_>, _>>()?;
                kind.evaluate(&values, &sigs)?
            }
        };
        let id = OpId(self.values.len());
        self.values.push(value);
        Ok(LeafOp::new(id, signature))
    }

    fn summary(&mut self, tag: &str, op: &LeafOp) -> Result<(), CoreError> {
        let value = self.value(op)?.clone();
        self.summaries.push((tag.to_string(), value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(shape: Vec<usize>, batched: bool) -> OpSignature {
        OpSignature {
            shape,
            dtype: DType::Float32,
            batch_axis: batched.then_some(0),
        }
    }

    #[test]
    fn test_infer_broadcast_keeps_batch_axis() {
        let a = sig(vec![3], true);
        let b = sig(vec![], false);
        let out = OpKind::Add.infer(&[&a, &b]).unwrap();
        assert_eq!(out.shape, vec![3]);
        assert_eq!(out.batch_axis, Some(0));
    }

    #[test]
    fn test_infer_arity() {
        let a = sig(vec![3], false);
        let err = OpKind::Add.infer(&[&a]).unwrap_err();
        assert!(matches!(err, CoreError::Arity { .. }));
    }

    #[test]
    fn test_infer_split_requires_divisible_last_dim() {
        let a = sig(vec![4], false);
        let half = OpKind::SplitLast { parts: 2, index: 0 }.infer(&[&a]).unwrap();
        assert_eq!(half.shape, vec![2]);
        assert!(OpKind::SplitLast { parts: 3, index: 0 }.infer(&[&a]).is_err());
    }

    #[test]
    fn test_batched_scalar_broadcasts_against_vector() {
        let batched = Tensor::vector(vec![1.0, 2.0]);
        let vector = Tensor::vector(vec![10.0, 20.0, 30.0]);
        let out = OpKind::Add
            .evaluate(&[&batched, &vector], &[&sig(vec![], true), &sig(vec![3], false)])
            .unwrap();
        assert_eq!(out.shape, vec![2, 3]);
        assert_eq!(out.data, vec![11.0, 21.0, 31.0, 12.0, 22.0, 32.0]);
    }

    #[test]
    fn test_shape_sink_preserves_placeholder_space() {
        let mut sink = ShapeSink::new();
        let space = BoxSpace::discrete(vec![2], 5).unwrap();
        let op = sink.placeholder("run/x", &space).unwrap();
        assert_eq!(sink.space_of(&op), space);
        let doubled = sink.add_op(OpKind::Add, &[&op, &op]).unwrap();
        assert_eq!(sink.space_of(&doubled).num_categories, None);
        assert_eq!(sink.op_count(), 2);
    }

    #[test]
    fn test_eager_sink_computes_immediately() {
        let feeds = HashMap::from([("run/x".to_string(), Tensor::scalar(1.5))]);
        let mut sink = EagerSink::new(&feeds);
        let x = sink.slot("run/x", &BoxSpace::float(vec![])).unwrap();
        let one = sink.constant(Tensor::scalar(1.0)).unwrap();
        let y = sink.add_op(OpKind::Add, &[&x, &one]).unwrap();
        assert_eq!(sink.value(&y).unwrap().data, vec![2.5]);
    }

    #[test]
    fn test_eager_sink_missing_feed() {
        let feeds = HashMap::new();
        let mut sink = EagerSink::new(&feeds);
        let err = sink.slot("run/x", &BoxSpace::float(vec![])).unwrap_err();
        assert_eq!(err, CoreError::MissingFeed { name: "run/x".to_string() });
    }

    #[test]
    fn test_softplus_is_positive_and_finite() {
        for x in [-50.0f32, -1.0, 0.0, 1.0, 50.0] {
            let y = softplus(x);
            assert!(y >= 0.0 && y.is_finite());
        }
    }
}
