//! # Programs - Replaying Traces Against Real Ops
//!
//! A [`Program`] is the compiled form of a component tree: the frozen tree
//! (with every method trace in place), the deferred [`OpGraph`], and one
//! [`EntryPoint`] per root API method.
//!
//! The [`Interpreter`] walks a method trace and feeds every graph-function
//! call through a [`GraphFnContext`] bound to some [`OpSink`]. The same
//! walk serves three purposes:
//!
//! | Sink | Purpose |
//! |------|---------|
//! | `ShapeSink` + proposals | resolve the input space of every argument |
//! | `OpGraph` | materialize the deferred graph at build time |
//! | `EagerSink` | compute results immediately on each eager run |
//!
//! ## Feeds
//!
//! Each leaf of a root argument becomes one placeholder (or slot) named
//! `<method>/<argument><flat key>`, e.g. `run/input1` or `act/obs/[0]`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::backend::Backend;
use crate::component::{Component, ComponentPath};
use crate::error::CoreError;
use crate::graph::OpGraph;
use crate::graph_fn::{DataOp, GraphFnContext};
use crate::ops::{EagerSink, LeafOp, OpSink};
use crate::recorder::CallTarget;
use crate::space::Space;
use crate::structure::{Flattened, Structure};
use crate::tensor::Tensor;

// ============================================================================
// Space proposals
// ============================================================================

/// Spaces proposed for component arguments during resolution.
#[derive(Debug, Default)]
pub struct SpaceProposals {
    spaces: BTreeMap<(ComponentPath, String), Space>,
}

impl SpaceProposals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `space` for `argument` of `component`. A second proposal with
    /// a different shape or dtype is a conflict; a compatible one only adds
    /// category metadata the first one lacked.
    pub fn propose(&mut self, component: &ComponentPath, argument: &str, space: Space) -> Result<(), CoreError> {
        let key = (component.clone(), argument.to_string());
        match self.spaces.get_mut(&key) {
            Some(existing) if !existing.is_compatible(&space) => Err(CoreError::SpaceConflict {
                component: component.to_string(),
                argument: argument.to_string(),
                existing: existing.clone(),
                proposed: space,
            }),
            Some(existing) => {
                *existing = existing.refine(&space);
                Ok(())
            }
            None => {
                self.spaces.insert(key, space);
                Ok(())
            }
        }
    }

    pub fn get(&self, component: &ComponentPath, argument: &str) -> Option<&Space> {
        self.spaces.get(&(component.clone(), argument.to_string()))
    }

    pub fn len(&self) -> usize {
        self.spaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }

    pub fn into_spaces(self) -> impl Iterator<Item = ((ComponentPath, String), Space)> {
        self.spaces.into_iter()
    }
}

// ============================================================================
// Interpreter
// ============================================================================

/// Replays method traces into an op sink.
pub struct Interpreter<'r, 's> {
    root: &'r Component,
    sink: &'s mut dyn OpSink,
    small_number: f32,
    proposals: Option<&'s mut SpaceProposals>,
}

impl<'r, 's> Interpreter<'r, 's> {
    pub fn new(root: &'r Component, sink: &'s mut dyn OpSink, small_number: f32) -> Self {
        Self {
            root,
            sink,
            small_number,
            proposals: None,
        }
    }

    /// Also record the space of every argument passed to every API method.
    pub fn with_proposals(mut self, proposals: &'s mut SpaceProposals) -> Self {
        self.proposals = Some(proposals);
        self
    }

    /// Run API method `method` of the component at `path` on `args`.
    pub fn call_api(&mut self, path: &ComponentPath, method: &str, args: Vec<DataOp>) -> Result<Vec<DataOp>, CoreError> {
        let root = self.root;
        let component = root.find(path).ok_or_else(|| CoreError::UnknownComponent {
            path: path.to_string(),
        })?;
        let api = component
            .api_method(method)
            .ok_or_else(|| CoreError::UnknownMethod {
                component: path.to_string(),
                method: method.to_string(),
            })?;
        let trace = api.trace().ok_or_else(|| CoreError::BuildFailed {
            reason: format!("'{path}.{method}' has not been traced"),
        })?;
        if args.len() != trace.params.len() {
            return Err(CoreError::arity(
                format!("{path}.{method}"),
                trace.params.len(),
                args.len(),
            ));
        }

        if let Some(proposals) = self.proposals.as_deref_mut() {
            for (param, arg) in trace.params.iter().zip(&args) {
                let space = arg.map(|op| self.sink.space_of(op));
                proposals.propose(path, param, space)?;
            }
        }

        let mut env: Vec<Option<DataOp>> = vec![None; trace.num_records];
        for (slot, arg) in env.iter_mut().zip(args) {
            *slot = Some(arg);
        }

        for call in &trace.calls {
            let inputs = call
                .args
                .iter()
                .map(|&i| lookup(&env, i, path, method))
                .collect::<Result<Vec<_>, _>>()?;
            let outputs = match &call.target {
                CallTarget::Api {
                    path: relative,
                    method: callee,
                } => {
                    let target = path.resolve(relative)?;
                    self.call_api(&target, callee, inputs)?
                }
                CallTarget::GraphFn { name } => {
                    let graph_fn = component
                        .graph_fn(name)
                        .ok_or_else(|| CoreError::UnknownGraphFn {
                            component: path.to_string(),
                            name: name.clone(),
                        })?;
                    let mut ctx = GraphFnContext::new(
                        &mut *self.sink,
                        component,
                        path.to_string(),
                        self.small_number,
                    );
                    graph_fn.invoke(&mut ctx, inputs)?
                }
                CallTarget::Constant { value } => {
                    vec![Structure::Leaf(self.sink.constant(value.clone())?)]
                }
            };
            if outputs.len() != call.outputs.len() {
                return Err(CoreError::arity(
                    format!("{path}.{method} call #{}", call.ordinal),
                    call.outputs.len(),
                    outputs.len(),
                ));
            }
            for (&index, value) in call.outputs.iter().zip(outputs) {
                env[index] = Some(value);
            }
        }

        trace
            .returns
            .iter()
            .map(|&i| lookup(&env, i, path, method))
            .collect()
    }
}

fn lookup(env: &[Option<DataOp>], index: usize, path: &ComponentPath, method: &str) -> Result<DataOp, CoreError> {
    env.get(index)
        .and_then(Option::clone)
        .ok_or_else(|| CoreError::InvalidRecord {
            method: format!("{path}.{method}"),
            reason: format!("record #{index} has no value"),
        })
}

/// Placeholder name for one leaf of a root argument.
pub fn feed_name(method: &str, argument: &str, flat_key: &str) -> String {
    format!("{method}/{argument}{flat_key}")
}

/// Materialize one leaf op per leaf of `space` through `backend`.
pub(crate) fn materialize_argument(
    backend: &dyn Backend,
    sink: &mut dyn OpSink,
    method: &str,
    argument: &str,
    space: &Space,
) -> Result<DataOp, CoreError> {
    let mut flat = Flattened::new();
    for (key, leaf) in space.flatten() {
        let op = backend.materialize_leaf(sink, &feed_name(method, argument, &key), &leaf)?;
        flat.push(key, op);
    }
    Structure::unflatten(flat, space)
}

// ============================================================================
// Entry points and programs
// ============================================================================

/// One parameter of an entry point.
#[derive(Debug, Clone)]
pub struct EntryParam {
    pub name: String,
    pub space: Space,
    pub ops: DataOp,
}

/// A callable compiled from one root API method.
#[derive(Debug, Clone)]
pub struct EntryPoint {
    pub name: String,
    pub params: Vec<EntryParam>,
    pub outputs: Vec<DataOp>,
    /// Summaries registered while this entry point was materialized.
    pub summaries: Vec<(String, LeafOp)>,
}

impl EntryPoint {
    pub fn param_names(&self) -> Vec<&str> {
        self.params.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }
}

/// Values produced by one run: structured outputs plus evaluated summaries.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub outputs: Vec<Structure<Tensor>>,
    pub summaries: Vec<(String, Tensor)>,
}

/// The compiled, immutable artifact shared by all entry points.
#[derive(Debug)]
pub struct Program {
    root: Arc<Component>,
    graph: OpGraph,
    small_number: f32,
}

impl Program {
    pub(crate) fn new(root: Arc<Component>, graph: OpGraph, small_number: f32) -> Self {
        Self {
            root,
            graph,
            small_number,
        }
    }

    pub fn root(&self) -> &Component {
        &self.root
    }

    pub fn graph(&self) -> &OpGraph {
        &self.graph
    }

    /// Check runtime inputs against the entry point's spaces and key them by feed name.
    pub fn bind_feeds(
        &self,
        entry: &EntryPoint,
        inputs: Vec<Structure<Tensor>>,
    ) -> Result<HashMap<String, Tensor>, CoreError> {
        if inputs.len() != entry.params.len() {
            return Err(CoreError::arity(
                format!("{}.{}", self.root.scope(), entry.name),
                entry.params.len(),
                inputs.len(),
            ));
        }
        let mut feeds = HashMap::new();
        for (param, input) in entry.params.iter().zip(inputs) {
            if !input.same_structure(&param.space) || input.keys() != param.space.keys() {
                return Err(CoreError::StructureMismatch {
                    reason: format!(
                        "input '{}' of '{}' does not match space {}",
                        param.name, entry.name, param.space
                    ),
                });
            }
            let spaces = param.space.flatten();
            for ((key, value), space) in input.into_flattened().into_iter().zip(spaces.values()) {
                let fits = value.shape == space.shape
                    || (space.batch_rank
                        && value.shape.len() == space.shape.len() + 1
                        && value.shape[1..] == space.shape[..]);
                if !fits {
                    let expected = if space.batch_rank {
                        space.batched_shape(value.shape.first().copied().unwrap_or(1))
                    } else {
                        space.shape.clone()
                    };
                    return Err(CoreError::ShapeMismatch {
                        op: feed_name(&entry.name, &param.name, &key),
                        expected,
                        got: value.shape,
                    });
                }
                feeds.insert(feed_name(&entry.name, &param.name, &key), value);
            }
        }
        Ok(feeds)
    }

    /// Deferred execution: evaluate the entry point's outputs in the op graph.
    pub fn evaluate(&self, entry: &EntryPoint, feeds: &HashMap<String, Tensor>) -> Result<RunOutput, CoreError> {
        let leaves: Vec<LeafOp> = entry
            .outputs
            .iter()
            .flat_map(|output| output.flatten().into_iter().map(|(_, op)| op))
            .collect();
        let mut targets: Vec<&LeafOp> = leaves.iter().collect();
        targets.extend(entry.summaries.iter().map(|(_, op)| op));
        let mut values = self.graph.evaluate(feeds, &targets)?.into_iter();

        let mut outputs = Vec::with_capacity(entry.outputs.len());
        for output in &entry.outputs {
            let flat: Flattened<Tensor> = output.keys().into_iter().zip(values.by_ref()).collect();
            outputs.push(Structure::unflatten(flat, output)?);
        }
        let summaries = entry
            .summaries
            .iter()
            .map(|(tag, _)| tag.clone())
            .zip(values)
            .collect();
        Ok(RunOutput { outputs, summaries })
    }

    /// Eager execution: replay the entry point's trace, computing each op at once.
    pub fn replay(
        &self,
        entry: &EntryPoint,
        feeds: &HashMap<String, Tensor>,
        backend: &dyn Backend,
    ) -> Result<RunOutput, CoreError> {
        let mut sink = EagerSink::new(feeds);
        let mut args = Vec::with_capacity(entry.params.len());
        for param in &entry.params {
            args.push(materialize_argument(backend, &mut sink, &entry.name, &param.name, &param.space)?);
        }
        let root_path = ComponentPath::root(self.root.scope());
        let results = Interpreter::new(&self.root, &mut sink, self.small_number)
            .call_api(&root_path, &entry.name, args)?;
        let outputs = results
            .iter()
            .map(|output| output.try_map(|op| sink.value(op).cloned()))
            .collect::<Result<Vec<_>, _>>()?;
        let summaries = sink.take_summaries();
        Ok(RunOutput { outputs, summaries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{OpId, OpSignature};
    use crate::space::{BoxSpace, DType};

    #[test]
    fn test_space_proposals_conflict() {
        let path = ComponentPath::root("container").child("D");
        let mut proposals = SpaceProposals::new();
        proposals.propose(&path, "input1", Space::scalar()).unwrap();
        proposals
            .propose(&path, "input1", Space::scalar().with_batch_rank())
            .unwrap();
        let err = proposals
            .propose(&path, "input1", Space::float(vec![3]))
            .unwrap_err();
        assert!(matches!(err, CoreError::SpaceConflict { ref argument, .. } if argument == "input1"));
        assert_eq!(proposals.len(), 1);
    }

    #[test]
    fn test_space_proposals_keep_categories() {
        let path = ComponentPath::root("root").child("S");
        let discrete = Space::discrete(vec![], 5).unwrap();
        let plain = Space::Leaf(BoxSpace {
            dtype: DType::Int32,
            ..BoxSpace::float(vec![])
        });

        let mut proposals = SpaceProposals::new();
        proposals.propose(&path, "a", plain.clone()).unwrap();
        proposals.propose(&path, "a", discrete.clone()).unwrap();
        assert_eq!(proposals.get(&path, "a"), Some(&discrete));

        let mut proposals = SpaceProposals::new();
        proposals.propose(&path, "a", discrete.clone()).unwrap();
        proposals.propose(&path, "a", plain).unwrap();
        assert_eq!(proposals.get(&path, "a"), Some(&discrete));
    }

    #[test]
    fn test_feed_names() {
        assert_eq!(feed_name("run", "input1", ""), "run/input1");
        assert_eq!(feed_name("act", "obs", "/[0]"), "act/obs/[0]");
    }

    #[test]
    fn test_bind_feeds_checks_batch_shape() {
        let space = Space::Leaf(BoxSpace::float(vec![2])).with_batch_rank();
        let entry = EntryPoint {
            name: "run".to_string(),
            params: vec![EntryParam {
                name: "x".to_string(),
                space,
                ops: Structure::Leaf(LeafOp::new(
                    OpId(0),
                    OpSignature {
                        shape: vec![2],
                        dtype: DType::Float32,
                        batch_axis: Some(0),
                    },
                )),
            }],
            outputs: Vec::new(),
            summaries: Vec::new(),
        };
        let program = Program::new(Arc::new(Component::new("root")), OpGraph::new(), 1e-6);

        let batch = Tensor::from_data(vec![3, 2], vec![0.0; 6]).unwrap();
        let feeds = program.bind_feeds(&entry, vec![Structure::Leaf(batch)]).unwrap();
        assert!(feeds.contains_key("run/x"));

        let bad = Tensor::vector(vec![0.0; 3]);
        assert!(matches!(
            program.bind_feeds(&entry, vec![Structure::Leaf(bad)]),
            Err(CoreError::ShapeMismatch { .. })
        ));
    }
}
