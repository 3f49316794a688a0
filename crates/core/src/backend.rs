//! # Backends
//!
//! A backend decides how a compiled [`Program`] actually runs. It is chosen
//! once (see [`backend_from_config`](crate::config::backend_from_config))
//! and injected into the builder; nothing downstream branches on a mode
//! flag.
//!
//! | Backend | Root arguments become | `run` |
//! |---------|-----------------------|-------|
//! | [`DeferredBackend`] | placeholders in the op graph | evaluates the prebuilt graph |
//! | [`EagerBackend`] | typed slots | replays the traces, computing each op at once |
//!
//! Both produce the same values for the same inputs.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::error::CoreError;
use crate::ops::{LeafOp, OpSink};
use crate::program::{EntryPoint, Program, RunOutput};
use crate::space::BoxSpace;
use crate::structure::Structure;
use crate::summary::{SummaryEvent, SummarySink};
use crate::tensor::Tensor;

/// How a backend executes ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Build a graph once, evaluate it per call.
    Deferred,
    /// Compute every op as soon as it is created.
    Eager,
}

/// Backend executor contract.
pub trait Backend: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn mode(&self) -> ExecutionMode;

    /// Create the leaf op standing for one leaf of a root argument.
    fn materialize_leaf(&self, ops: &mut dyn OpSink, name: &str, space: &BoxSpace) -> Result<LeafOp, CoreError>;

    /// Run an entry point on concrete inputs.
    fn run(
        &self,
        program: &Program,
        entry: &EntryPoint,
        inputs: Vec<Structure<Tensor>>,
    ) -> Result<Vec<Structure<Tensor>>, CoreError>;

    /// Hand an evaluated summary to whoever is listening.
    fn register_summary(&self, tag: &str, value: &Tensor);
}

fn forward_summaries(backend: &dyn Backend, entry: &EntryPoint, output: RunOutput) -> Vec<Structure<Tensor>> {
    trace!(
        entry = %entry.name,
        backend = backend.name(),
        summaries = output.summaries.len(),
        "entry point evaluated"
    );
    for (tag, value) in &output.summaries {
        backend.register_summary(tag, value);
    }
    output.outputs
}

fn record_summary(sink: Option<&Arc<dyn SummarySink>>, tag: &str, value: &Tensor) {
    if let Some(sink) = sink {
        sink.record(SummaryEvent {
            tag: tag.to_string(),
            value: value.clone(),
        });
    }
}

/// Graph-mode backend.
#[derive(Debug, Clone, Default)]
pub struct DeferredBackend {
    summaries: Option<Arc<dyn SummarySink>>,
}

impl DeferredBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_summary_sink(mut self, sink: Arc<dyn SummarySink>) -> Self {
        self.summaries = Some(sink);
        self
    }
}

impl Backend for DeferredBackend {
    fn name(&self) -> &str {
        "deferred"
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Deferred
    }

    fn materialize_leaf(&self, ops: &mut dyn OpSink, name: &str, space: &BoxSpace) -> Result<LeafOp, CoreError> {
        ops.placeholder(name, space)
    }

    fn run(
        &self,
        program: &Program,
        entry: &EntryPoint,
        inputs: Vec<Structure<Tensor>>,
    ) -> Result<Vec<Structure<Tensor>>, CoreError> {
        let feeds = program.bind_feeds(entry, inputs)?;
        let output = program.evaluate(entry, &feeds)?;
        Ok(forward_summaries(self, entry, output))
    }

    fn register_summary(&self, tag: &str, value: &Tensor) {
        record_summary(self.summaries.as_ref(), tag, value);
    }
}

/// Eager backend.
#[derive(Debug, Clone, Default)]
pub struct EagerBackend {
    summaries: Option<Arc<dyn SummarySink>>,
}

impl EagerBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_summary_sink(mut self, sink: Arc<dyn SummarySink>) -> Self {
        self.summaries = Some(sink);
        self
    }
}

impl Backend for EagerBackend {
    fn name(&self) -> &str {
        "eager"
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Eager
    }

    fn materialize_leaf(&self, ops: &mut dyn OpSink, name: &str, space: &BoxSpace) -> Result<LeafOp, CoreError> {
        ops.slot(name, space)
    }

    fn run(
        &self,
        program: &Program,
        entry: &EntryPoint,
        inputs: Vec<Structure<Tensor>>,
    ) -> Result<Vec<Structure<Tensor>>, CoreError> {
        let feeds = program.bind_feeds(entry, inputs)?;
        let output = program.replay(entry, &feeds, self)?;
        Ok(forward_summaries(self, entry, output))
    }

    fn register_summary(&self, tag: &str, value: &Tensor) {
        record_summary(self.summaries.as_ref(), tag, value);
    }
}
