//! # Op Graph - Deferred Execution
//!
//! `OpGraph` is the deferred backend's artifact: every leaf op becomes a
//! node in a petgraph `DiGraph`, every input an edge tagged with the port it
//! feeds. Building the graph computes nothing; [`OpGraph::evaluate`] runs it
//! later against named feeds.
//!
//! ## Evaluation order
//!
//! Nodes are only ever appended and an op can only consume ops that already
//! exist, so ascending node index is a topological order. Evaluation walks
//! back from the requested targets to find the nodes they need and computes
//! just those, in index order.
//!
//! ## Variables
//!
//! Each named variable is materialized once. Submitting the same variable
//! again returns the existing node.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

use crate::error::CoreError;
use crate::ops::{LeafOp, OpId, OpKind, OpSignature, OpSink};
use crate::space::BoxSpace;
use crate::tensor::Tensor;

/// A node in the op graph.
#[derive(Debug, Clone)]
pub struct OpNode {
    pub kind: OpKind,
    pub signature: OpSignature,
}

/// A DAG of leaf operations.
#[derive(Debug, Clone, Default)]
pub struct OpGraph {
    graph: DiGraph<OpNode, usize>,
    variables: HashMap<String, LeafOp>,
    summaries: Vec<(String, LeafOp)>,
}

impl OpGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ops in the graph.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of data dependencies in the graph.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// The node behind a leaf handle.
    pub fn node(&self, op: &LeafOp) -> Option<&OpNode> {
        self.graph.node_weight(NodeIndex::new(op.id().0))
    }

    /// Summaries registered since the last call, in registration order.
    pub fn take_summaries(&mut self) -> Vec<(String, LeafOp)> {
        std::mem::take(&mut self.summaries)
    }

    /// Compute the values of `targets` given placeholder feeds by name.
    pub fn evaluate(
        &self,
        feeds: &HashMap<String, Tensor>,
        targets: &[&LeafOp],
    ) -> Result<Vec<Tensor>, CoreError> {
        let mut order: Vec<NodeIndex> = self.ancestors(targets)?.into_iter().collect();
        order.sort_unstable();

        let mut values: HashMap<NodeIndex, Tensor> = HashMap::with_capacity(order.len());
        for idx in order {
            let node = &self.graph[idx];
            let value = match &node.kind {
                OpKind::Placeholder { name, .. } | OpKind::Slot { name, .. } => feeds
                    .get(name)
                    .cloned()
                    .ok_or_else(|| CoreError::MissingFeed { name: name.clone() })?,
                kind => {
                    let mut incoming: Vec<(usize, NodeIndex)> = self
                        .graph
                        .edges_directed(idx, Direction::Incoming)
                        .map(|edge| (*edge.weight(), edge.source()))
                        .collect();
                    incoming.sort_unstable();
                    let inputs: Vec<&Tensor> =
                        incoming.iter().map(|(_, src)| &values[src]).collect();
                    let sigs: Vec<&OpSignature> = incoming
                        .iter()
                        .map(|(_, src)| &self.graph[*src].signature)
                        .collect();
                    kind.evaluate(&inputs, &sigs)?
                }
            };
            values.insert(idx, value);
        }

        targets
            .iter()
            .map(|op| {
                values
                    .get(&NodeIndex::new(op.id().0))
                    .cloned()
                    .ok_or_else(|| foreign_op(op.id()))
            })
            .collect()
    }

    fn ancestors(&self, targets: &[&LeafOp]) -> Result<HashSet<NodeIndex>, CoreError> {
        let mut seen = HashSet::new();
        let mut stack = Vec::with_capacity(targets.len());
        for op in targets {
            stack.push(self.index_of(op.id())?);
        }
        while let Some(idx) = stack.pop() {
            if seen.insert(idx) {
                stack.extend(self.graph.neighbors_directed(idx, Direction::Incoming));
            }
        }
        Ok(seen)
    }

    fn index_of(&self, id: OpId) -> Result<NodeIndex, CoreError> {
        let idx = NodeIndex::new(id.0);
        if self.graph.node_weight(idx).is_some() {
            Ok(idx)
        } else {
            Err(foreign_op(id))
        }
    }
}

fn foreign_op(id: OpId) -> CoreError {
    CoreError::BuildFailed {
        reason: format!("op #{} is not part of this graph", id.0),
    }
}

impl OpSink for OpGraph {
    fn add_op(&mut self, kind: OpKind, inputs: &[&LeafOp]) -> Result<LeafOp, CoreError> {
        if let OpKind::Variable { name, .. } = &kind {
            if let Some(existing) = self.variables.get(name) {
                return Ok(existing.clone());
            }
        }

        let sources = inputs
            .iter()
            .map(|op| self.index_of(op.id()))
            .collect::<Result<Vec<_>, _>>()?;
        let sigs: Vec<&OpSignature> = inputs.iter().map(|op| op.signature()).collect();
        let signature = kind.infer(&sigs)?;

        let variable = match &kind {
            OpKind::Variable { name, .. } => Some(name.clone()),
            _ => None,
        };
        let idx = self.graph.add_node(OpNode {
            kind,
            signature: signature.clone(),
        });
        for (port, source) in sources.into_iter().enumerate() {
            self.graph.add_edge(source, idx, port);
        }

        let op = LeafOp::new(OpId(idx.index()), signature);
        if let Some(name) = variable {
            self.variables.insert(name, op.clone());
        }
        Ok(op)
    }

    fn summary(&mut self, tag: &str, op: &LeafOp) -> Result<(), CoreError> {
        self.index_of(op.id())?;
        self.summaries.push((tag.to_string(), op.clone()));
        Ok(())
    }

    fn space_of(&self, op: &LeafOp) -> BoxSpace {
        match self.node(op).map(|node| &node.kind) {
            Some(OpKind::Placeholder { space, .. }) | Some(OpKind::Slot { space, .. }) => {
                space.clone()
            }
            _ => BoxSpace {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deferred_evaluation() {
        let mut graph = OpGraph::new();
        let x = graph.placeholder("run/x", &BoxSpace::float(vec![2])).unwrap();
        let one = graph.constant(Tensor::scalar(1.0)).unwrap();
        let y = graph.add_op(OpKind::Add, &[&x, &one]).unwrap();
        let z = graph.add_op(OpKind::Mul, &[&y, &y]).unwrap();
        assert_eq!(graph.node_count(), 4);

        let feeds = HashMap::from([("run/x".to_string(), Tensor::vector(vec![1.0, 2.0]))]);
        let out = graph.evaluate(&feeds, &[&z, &y]).unwrap();
        assert_eq!(out[0].data, vec![4.0, 9.0]);
        assert_eq!(out[1].data, vec![2.0, 3.0]);
    }

    #[test]
    fn test_port_order_is_respected() {
        let mut graph = OpGraph::new();
        let a = graph.constant(Tensor::scalar(5.0)).unwrap();
        let b = graph.constant(Tensor::scalar(2.0)).unwrap();
        let d = graph.add_op(OpKind::Sub, &[&b, &a]).unwrap();
        let out = graph.evaluate(&HashMap::new(), &[&d]).unwrap();
        assert_eq!(out[0].data, vec![-3.0]);
    }

    #[test]
    fn test_unneeded_placeholders_need_no_feed() {
        let mut graph = OpGraph::new();
        let _unused = graph.placeholder("a/x", &BoxSpace::float(vec![])).unwrap();
        let c = graph.constant(Tensor::scalar(3.0)).unwrap();
        let out = graph.evaluate(&HashMap::new(), &[&c]).unwrap();
        assert_eq!(out[0].data, vec![3.0]);
    }

    #[test]
    fn test_missing_feed() {
        let mut graph = OpGraph::new();
        let x = graph.placeholder("run/x", &BoxSpace::float(vec![])).unwrap();
        let err = graph.evaluate(&HashMap::new(), &[&x]).unwrap_err();
        assert_eq!(err, CoreError::MissingFeed { name: "run/x".to_string() });
    }

    #[test]
    fn test_variables_materialize_once() {
        let mut graph = OpGraph::new();
        let v1 = graph.variable("dense/w", &Tensor::scalar(0.5)).unwrap();
        let v2 = graph.variable("dense/w", &Tensor::scalar(0.5)).unwrap();
        assert_eq!(v1.id(), v2.id());
        assert_eq!(graph.node_count(), 1);
    }
}
