//! # Graph Functions
//!
//! A graph function is the lowest level of a component: a body that turns
//! leaf ops into leaf ops through a [`GraphFnContext`]. The wrapper around
//! the body handles structured arguments so the body does not have to.
//!
//! ## Input handling
//!
//! | `flatten_inputs` | `split_inputs` | Body receives, per structured argument |
//! |------------------|----------------|----------------------------------------|
//! | off | off | the structure itself (`FnValue::Op`) |
//! | on | off | one flat leaf-key mapping (`FnValue::Flat`) |
//! | on | on | one leaf per call; the body runs once per key |
//!
//! Non-structured arguments always reach the body unchanged. Split mode
//! requires every structured argument to have the same key set; the
//! per-key results are reassembled into the structure of the first
//! structured argument.
//!
//! ## Example
//!
//! ```rust
//! use compgraph_core::graph_fn::{FnValue, GraphFn};
//!
//! let add = GraphFn::new("add", 2, 1, |ctx, args| {
//!     let sum = ctx.add(args[0].leaf()?, args[1].leaf()?)?;
//!     Ok(vec![FnValue::from(sum)])
//! })
//! .split_inputs(true);
//! assert!(add.flattens_inputs());
//! ```

use std::fmt;
use std::sync::Arc;

use crate::component::Component;
use crate::error::CoreError;
use crate::ops::{LeafOp, OpKind, OpSink};
use crate::space::BoxSpace;
use crate::structure::{Flattened, Structure};
use crate::tensor::Tensor;

/// A possibly structured leaf-op value.
pub type DataOp = Structure<LeafOp>;

/// How many arguments a graph function accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(&self, n: usize) -> bool {
        match *self {
            Arity::Exact(k) => n == k,
            Arity::AtLeast(k) => n >= k,
        }
    }
}

impl From<usize> for Arity {
    fn from(n: usize) -> Self {
        Arity::Exact(n)
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{n}"),
            Arity::AtLeast(n) => write!(f, "at least {n}"),
        }
    }
}

/// A value passed to or returned from a graph-function body.
#[derive(Debug, Clone, PartialEq)]
pub enum FnValue {
    Op(DataOp),
    Flat(Flattened<LeafOp>),
}

impl FnValue {
    /// The leaf op, if this is a bare leaf.
    pub fn leaf(&self) -> Result<&LeafOp, CoreError> {
        match self {
            FnValue::Op(Structure::Leaf(op)) => Ok(op),
            other => Err(CoreError::StructureMismatch {
                reason: format!("expected a single leaf op, got {}", other.describe()),
            }),
        }
    }

    /// The flat mapping, if the argument was flattened.
    pub fn flat(&self) -> Result<&Flattened<LeafOp>, CoreError> {
        match self {
            FnValue::Flat(flat) => Ok(flat),
            other => Err(CoreError::StructureMismatch {
                reason: format!("expected a flattened argument, got {}", other.describe()),
            }),
        }
    }

    /// The value's leaves in flatten order.
    pub fn leaves(&self) -> Vec<&LeafOp> {
        match self {
            FnValue::Op(op) => {
                let mut leaves = Vec::new();
                collect_leaves(op, &mut leaves);
                leaves
            }
            FnValue::Flat(flat) => flat.values().collect(),
        }
    }

    fn describe(&self) -> String {
        match self {
            FnValue::Op(Structure::Leaf(_)) => "a leaf".to_string(),
            FnValue::Op(op) => format!("a structure with {} leaves", op.num_leaves()),
            FnValue::Flat(flat) => format!("a flat mapping with {} keys", flat.len()),
        }
    }
}

fn collect_leaves<'o>(op: &'o DataOp, out: &mut Vec<&'o LeafOp>) {
    match op {
        Structure::Leaf(leaf) => out.push(leaf),
        Structure::Tuple(items) => items.iter().for_each(|item| collect_leaves(item, out)),
        Structure::Dict(items) => items.values().for_each(|item| collect_leaves(item, out)),
    }
}

impl From<LeafOp> for FnValue {
    fn from(op: LeafOp) -> Self {
        FnValue::Op(Structure::Leaf(op))
    }
}

impl From<DataOp> for FnValue {
    fn from(op: DataOp) -> Self {
        FnValue::Op(op)
    }
}

impl From<Flattened<LeafOp>> for FnValue {
    fn from(flat: Flattened<LeafOp>) -> Self {
        FnValue::Flat(flat)
    }
}

/// Signature of a graph-function body.
pub type GraphFnBody =
    Arc<dyn Fn(&mut GraphFnContext<'_>, Vec<FnValue>) -> Result<Vec<FnValue>, CoreError> + Send + Sync>;

/// A graph function descriptor.
#[derive(Clone)]
pub struct GraphFn {
    name: String,
    arity: Arity,
    num_outputs: usize,
    flatten_inputs: bool,
    split_inputs: bool,
    body: GraphFnBody,
}

impl fmt::Debug for GraphFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphFn")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("num_outputs", &self.num_outputs)
            .field("flatten_inputs", &self.flatten_inputs)
            .field("split_inputs", &self.split_inputs)
            .finish()
    }
}

impl GraphFn {
    pub fn new<F>(name: impl Into<String>, arity: impl Into<Arity>, num_outputs: usize, body: F) -> Self
    where
        F: Fn(&mut GraphFnContext<'_>, Vec<FnValue>) -> Result<Vec<FnValue>, CoreError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            arity: arity.into(),
            num_outputs,
            flatten_inputs: false,
            split_inputs: false,
            body: Arc::new(body),
        }
    }

    /// Hand structured arguments to the body as flat mappings.
    pub fn flatten_inputs(mut self, flatten: bool) -> Self {
        self.flatten_inputs = flatten;
        if !flatten {
            self.split_inputs = false;
        }
        self
    }

    /// Run the body once per leaf key. Implies `flatten_inputs`.
    pub fn split_inputs(mut self, split: bool) -> Self {
        self.split_inputs = split;
        if split {
            self.flatten_inputs = true;
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> Arity {
        self.arity
    }

    pub fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    pub fn flattens_inputs(&self) -> bool {
        self.flatten_inputs
    }

    pub fn splits_inputs(&self) -> bool {
        self.split_inputs
    }

    /// Run the graph function on real leaf ops.
    pub fn invoke(
        &self,
        ctx: &mut GraphFnContext<'_>,
        args: Vec<DataOp>,
    ) -> Result<Vec<DataOp>, CoreError> {
        let callee = format!("{}.{}", ctx.scope(), self.name);
        if !self.arity.accepts(args.len()) {
            return Err(CoreError::Arity {
                callee,
                expected: self.arity.to_string(),
                got: args.len(),
            });
        }

        if self.split_inputs && args.iter().any(Structure::is_structured) {
            return self.invoke_split(ctx, &callee, args);
        }

        let values = args
            .iter()
            .map(|arg| {
                if self.flatten_inputs && arg.is_structured() {
                    FnValue::Flat(arg.flatten())
                } else {
                    FnValue::Op(arg.clone())
                }
            })
            .collect();
        let outputs = self.call_body(ctx, &callee, values)?;
        outputs
            .into_iter()
            .map(|out| match out {
                FnValue::Op(op) => Ok(op),
                FnValue::Flat(flat) => unflatten_like(flat, &args),
            })
            .collect()
    }

    fn invoke_split(
        &self,
        ctx: &mut GraphFnContext<'_>,
        callee: &str,
        args: Vec<DataOp>,
    ) -> Result<Vec<DataOp>, CoreError> {
        let flats: Vec<Option<Flattened<LeafOp>>> = args
            .iter()
            .map(|arg| arg.is_structured().then(|| arg.flatten()))
            .collect();
        let (lead_index, lead) = flats
            .iter()
            .enumerate()
            .find_map(|(i, flat)| flat.as_ref().map(|f| (i, f)))
            .ok_or_else(|| CoreError::StructureMismatch {
                reason: format!("{callee}: split requires a structured argument"),
            })?;
        for flat in flats.iter().flatten() {
            if !flat.same_keys(lead) {
                return Err(CoreError::KeyAlignment {
                    graph_fn: callee.to_string(),
                    expected: lead.keys().map(str::to_string).collect(),
                    got: flat.keys().map(str::to_string).collect(),
                });
            }
        }

        let mut per_output: Vec<Flattened<DataOp>> =
            (0..self.num_outputs).map(|_| Flattened::new()).collect();
        for key in lead.keys() {
            let values = args
                .iter()
                .zip(&flats)
                .map(|(arg, flat)| match flat {
                    Some(flat) => flat
                        .get(key)
                        .cloned()
                        .map(FnValue::from)
                        .ok_or_else(|| CoreError::KeyAlignment {
                            graph_fn: callee.to_string(),
                            expected: vec![key.to_string()],
                            got: flat.keys().map(str::to_string).collect(),
                        }),
                    None => Ok(FnValue::Op(arg.clone())),
                })
                .collect::<Result<Vec<_>, _>>()?;
            let outputs = self.call_body(ctx, callee, values)?;
            for (slot, out) in per_output.iter_mut().zip(outputs) {
                let op = match out {
                    FnValue::Op(op) => op,
                    FnValue::Flat(flat) => flat.unflatten()?,
                };
                slot.push(key, op);
            }
        }

        let template = args[lead_index].template();
        per_output
            .into_iter()
            .map(|flat| Structure::unflatten(flat, &template).map(Structure::join))
            .collect()
    }

    fn call_body(
        &self,
        ctx: &mut GraphFnContext<'_>,
        callee: &str,
        values: Vec<FnValue>,
    ) -> Result<Vec<FnValue>, CoreError> {
        let outputs = (self.body)(ctx, values)?;
        if outputs.len() != self.num_outputs {
            return Err(CoreError::arity(
                format!("{callee} (outputs)"),
                self.num_outputs,
                outputs.len(),
            ));
        }
        Ok(outputs)
    }
}

/// Rebuild a flat output using the structure of an argument with the same
/// keys, falling back to the keys alone.
fn unflatten_like(flat: Flattened<LeafOp>, args: &[DataOp]) -> Result<DataOp, CoreError> {
    for arg in args.iter().filter(|arg| arg.is_structured()) {
        let template = arg.template();
        let keys = template.flatten();
        if flat.same_keys(&keys) {
            return Structure::unflatten(flat, &template);
        }
    }
    flat.unflatten()
}

// ============================================================================
// Graph-function context
// ============================================================================

/// Everything a graph-function body may touch while it runs.
pub struct GraphFnContext<'a> {
    sink: &'a mut dyn OpSink,
    component: &'a Component,
    scope: String,
    small_number: f32,
}

impl<'a> GraphFnContext<'a> {
    pub(crate) fn new(
        sink: &'a mut dyn OpSink,
        component: &'a Component,
        scope: String,
        small_number: f32,
    ) -> Self {
        Self {
            sink,
            component,
            scope,
            small_number,
        }
    }

    /// Global scope of the owning component.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// The configured clamping epsilon.
    pub fn small_number(&self) -> f32 {
        self.small_number
    }

    /// The space of an op's values.
    pub fn space_of(&self, op: &LeafOp) -> BoxSpace {
        self.sink.space_of(op)
    }

    /// Submit an arbitrary op.
    pub fn apply(&mut self, kind: OpKind, inputs: &[&LeafOp]) -> Result<LeafOp, CoreError> {
        self.sink.add_op(kind, inputs)
    }

    pub fn constant(&mut self, value: f32) -> Result<LeafOp, CoreError> {
        self.sink.constant(Tensor::scalar(value))
    }

    pub fn constant_tensor(&mut self, value: Tensor) -> Result<LeafOp, CoreError> {
        self.sink.constant(value)
    }

    /// The owning component's variable `name`, materialized under its global scope.
    pub fn variable(&mut self, name: &str) -> Result<LeafOp, CoreError> {
        let value = self
            .component
            .variable(name)
            .ok_or_else(|| CoreError::UnknownVariable {
                component: self.scope.clone(),
                name: name.to_string(),
            })?;
        let scoped = format!("{}/{}", self.scope, name);
        self.sink.variable(&scoped, value)
    }

    /// Register `op` as a summary tagged `<scope>/<tag>`.
    pub fn summary(&mut self, tag: &str, op: &LeafOp) -> Result<(), CoreError> {
        let scoped = format!("{}/{}", self.scope, tag);
        self.sink.summary(&scoped, op)
    }

    pub fn identity(&mut self, x: &LeafOp) -> Result<LeafOp, CoreError> {
        self.apply(OpKind::Identity, &[x])
    }

    pub fn add(&mut self, a: &LeafOp, b: &LeafOp) -> Result<LeafOp, CoreError> {
        self.apply(OpKind::Add, &[a, b])
    }

    pub fn sub(&mut self, a: &LeafOp, b: &LeafOp) -> Result<LeafOp, CoreError> {
        self.apply(OpKind::Sub, &[a, b])
    }

    pub fn mul(&mut self, a: &LeafOp, b: &LeafOp) -> Result<LeafOp, CoreError> {
        self.apply(OpKind::Mul, &[a, b])
    }

    pub fn div(&mut self, a: &LeafOp, b: &LeafOp) -> Result<LeafOp, CoreError> {
        self.apply(OpKind::Div, &[a, b])
    }

    pub fn neg(&mut self, x: &LeafOp) -> Result<LeafOp, CoreError> {
        self.apply(OpKind::Neg, &[x])
    }

    pub fn exp(&mut self, x: &LeafOp) -> Result<LeafOp, CoreError> {
        self.apply(OpKind::Exp, &[x])
    }

    pub fn log(&mut self, x: &LeafOp) -> Result<LeafOp, CoreError> {
        self.apply(OpKind::Log, &[x])
    }

    pub fn softplus(&mut self, x: &LeafOp) -> Result<LeafOp, CoreError> {
        self.apply(OpKind::Softplus, &[x])
    }

    pub fn maximum(&mut self, x: &LeafOp, floor: f32) -> Result<LeafOp, CoreError> {
        self.apply(OpKind::Maximum { floor }, &[x])
    }

    pub fn clamp(&mut self, x: &LeafOp, min: f32, max: f32) -> Result<LeafOp, CoreError> {
        self.apply(OpKind::Clamp { min, max }, &[x])
    }

    pub fn softmax(&mut self, x: &LeafOp) -> Result<LeafOp, CoreError> {
        self.apply(OpKind::Softmax, &[x])
    }

    pub fn split_last(
        &mut self,
        x: &LeafOp,
        parts: usize,
        index: usize,
    ) -> Result<LeafOp, CoreError> {
        self.apply(OpKind::SplitLast { parts, index }, &[x])
    }

    pub fn squeeze_last(&mut self, x: &LeafOp) -> Result<LeafOp, CoreError> {
        self.apply(OpKind::SqueezeLast, &[x])
    }

    /// Sum of all elements as a scalar.
    pub fn sum(&mut self, x: &LeafOp) -> Result<LeafOp, CoreError> {
        self.apply(OpKind::ReduceSum, &[x])
    }
}
