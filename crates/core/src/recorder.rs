//! # API-Method Recorder
//!
//! API-method bodies never see real ops. They run exactly once, at trace
//! time, against opaque [`Record`] handles, and every call they make is
//! written down as a [`TracedCall`]. The resulting [`MethodTrace`] is the
//! method's contribution to the call graph; the build engine later replays
//! it against real leaf ops.
//!
//! ```text
//! container.run(x)               trace of container.run
//!   r1 = comp1.run(x)      →     #0 Api comp1.run   [r0] -> [r1]
//!   r2 = comp2.run(r1)     →     #1 Api comp2.run   [r1] -> [r2]
//!   return r2                    returns [r2]
//! ```
//!
//! ## Rules
//!
//! - Each `(component, method)` is traced at most once; later calls reuse
//!   the stored trace.
//! - Argument counts are checked before the callee is traced.
//! - A method that is reached again while it is still being traced closes a
//!   cycle, reported with the full call chain.
//! - Records only mean something inside the trace that created them.

use tracing::debug;

use crate::component::{Component, ComponentPath};
use crate::error::CoreError;
use crate::tensor::Tensor;

/// An opaque handle to a value inside one method trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Record {
    trace: usize,
    index: usize,
}

/// What a traced call invokes.
#[derive(Debug, Clone, PartialEq)]
pub enum CallTarget {
    /// An API method, `path` relative to the calling component.
    Api { path: String, method: String },
    /// A graph function of the calling component.
    GraphFn { name: String },
    /// A literal turned into a constant op.
    Constant { value: Tensor },
}

/// One recorded call, in call order.
#[derive(Debug, Clone, PartialEq)]
pub struct TracedCall {
    pub ordinal: usize,
    pub target: CallTarget,
    /// Trace-local indices of the arguments.
    pub args: Vec<usize>,
    /// Trace-local indices of the results.
    pub outputs: Vec<usize>,
}

/// The recorded body of one API method.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodTrace {
    pub params: Vec<String>,
    pub calls: Vec<TracedCall>,
    /// Trace-local indices of the returned values.
    pub returns: Vec<usize>,
    /// Number of values the trace defines (parameters included).
    pub num_records: usize,
}

impl MethodTrace {
    pub fn num_outputs(&self) -> usize {
        self.returns.len()
    }
}

/// Drives tracing over a component tree.
pub struct Tracer<'a> {
    root: &'a Component,
    stack: Vec<String>,
    next_trace: usize,
}

impl<'a> Tracer<'a> {
    pub fn new(root: &'a Component) -> Self {
        Self {
            root,
            stack: Vec::new(),
            next_trace: 0,
        }
    }

    /// Trace `method` of the component at `path`, or return its stored trace.
    pub fn trace(&mut self, path: &ComponentPath, method: &str) -> Result<&'a MethodTrace, CoreError> {
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
        if let Some(trace) = api.trace() {
            return Ok(trace);
        }

        let key = format!("{path}.{method}");
        if let Some(start) = self.stack.iter().position(|k| *k == key) {
            let mut chain = self.stack[start..].to_vec();
            chain.push(key);
            return Err(CoreError::CyclicCallGraph {
                cycle: chain.join(" -> "),
            });
        }

        debug!(method = %key, "tracing API method");
        self.stack.push(key);
        let trace_id = self.next_trace;
        self.next_trace += 1;

        let params: Vec<Record> = (0..api.params().len())
            .map(|index| Record {
                trace: trace_id,
                index,
            })
            .collect();
        let mut ctx = CallContext {
            tracer: &mut *self,
            path: path.clone(),
            method: method.to_string(),
            trace_id,
            num_records: params.len(),
            calls: Vec::new(),
        };
        let result = (api.body())(&mut ctx, params);
        let returns = result.and_then(|records| {
            records
                .iter()
                .map(|r| ctx.index_of(r))
                .collect::<Result<Vec<_>, _>>()
        });
        let CallContext {
            calls, num_records, ..
        } = ctx;
        self.stack.pop();
        let returns = returns?;

        let trace = MethodTrace {
            params: api.params().to_vec(),
            calls,
            returns,
            num_records,
        };
        api.store_trace(trace)
            .ok_or_else(|| CoreError::BuildFailed {
                reason: format!("trace of '{path}.{method}' was not stored"),
            })
    }
}

/// The handle an API-method body records its calls through.
pub struct CallContext<'t, 'a> {
    tracer: &'t mut Tracer<'a>,
    path: ComponentPath,
    method: String,
    trace_id: usize,
    num_records: usize,
    calls: Vec<TracedCall>,
}

impl CallContext<'_, '_> {
    /// Global scope of the component whose method is being traced.
    pub fn scope(&self) -> String {
        self.path.to_string()
    }

    /// Scopes of the component's direct sub-components, in addition order.
    pub fn sub_components(&self) -> Vec<String> {
        self.tracer
            .root
            .find(&self.path)
            .map(|c| c.sub_components().iter().map(|s| s.scope().to_string()).collect())
            .unwrap_or_default()
    }

    /// Call API method `method` of the component at relative `path`.
    pub fn call(&mut self, path: &str, method: &str, args: &[Record]) -> Result<Vec<Record>, CoreError> {
        let arg_indices = self.indices_of(args)?;
        let target = self.path.resolve(path)?;
        let root = self.tracer.root;
        let component = root.find(&target).ok_or_else(|| CoreError::UnknownComponent {
            path: target.to_string(),
        })?;
        let api = component
            .api_method(method)
            .ok_or_else(|| CoreError::UnknownMethod {
                component: target.to_string(),
                method: method.to_string(),
            })?;
        if api.params().len() != args.len() {
            return Err(CoreError::arity(
                format!("{target}.{method}"),
                api.params().len(),
                args.len(),
            ));
        }

        let num_outputs = self.tracer.trace(&target, method)?.num_outputs();
        let outputs = self.push_call(
            CallTarget::Api {
                path: path.to_string(),
                method: method.to_string(),
            },
            arg_indices,
            num_outputs,
        );
        Ok(outputs)
    }

    /// Like [`call`](Self::call) for methods returning exactly one value.
    pub fn call_one(&mut self, path: &str, method: &str, args: &[Record]) -> Result<Record, CoreError> {
        let outputs = self.call(path, method, args)?;
        single(outputs, format!("{}.{method}", self.path.resolve(path)?))
    }

    /// Call another API method of the same component.
    pub fn call_own(&mut self, method: &str, args: &[Record]) -> Result<Vec<Record>, CoreError> {
        self.call("", method, args)
    }

    /// Call one of the component's graph functions.
    pub fn graph_fn(&mut self, name: &str, args: &[Record]) -> Result<Vec<Record>, CoreError> {
        let arg_indices = self.indices_of(args)?;
        let root = self.tracer.root;
        let component = root.find(&self.path).ok_or_else(|| CoreError::UnknownComponent {
            path: self.path.to_string(),
        })?;
        let graph_fn = component
            .graph_fn(name)
            .ok_or_else(|| CoreError::UnknownGraphFn {
                component: self.path.to_string(),
                name: name.to_string(),
            })?;
        if !graph_fn.arity().accepts(args.len()) {
            return Err(CoreError::Arity {
                callee: format!("{}.{name}", self.path),
                expected: graph_fn.arity().to_string(),
                got: args.len(),
            });
        }
        Ok(self.push_call(
            CallTarget::GraphFn {
                name: name.to_string(),
            },
            arg_indices,
            graph_fn.num_outputs(),
        ))
    }

    /// Like [`graph_fn`](Self::graph_fn) for functions with exactly one output.
    pub fn graph_fn_one(&mut self, name: &str, args: &[Record]) -> Result<Record, CoreError> {
        let outputs = self.graph_fn(name, args)?;
        single(outputs, format!("{}.{name}", self.path))
    }

    /// A scalar literal.
    pub fn constant(&mut self, value: f32) -> Record {
        self.constant_tensor(Tensor::scalar(value))
    }

    /// A tensor literal.
    pub fn constant_tensor(&mut self, value: Tensor) -> Record {
        let outputs = self.push_call(CallTarget::Constant { value }, Vec::new(), 1);
        outputs[0]
    }

    fn push_call(&mut self, target: CallTarget, args: Vec<usize>, num_outputs: usize) -> Vec<Record> {
        let first = self.num_records;
        self.num_records += num_outputs;
        self.calls.push(TracedCall {
            ordinal: self.calls.len(),
            target,
            args,
            outputs: (first..self.num_records).collect(),
        });
        (first..self.num_records)
            .map(|index| Record {
                trace: self.trace_id,
                index,
            })
            .collect()
    }

    fn indices_of(&self, records: &[Record]) -> Result<Vec<usize>, CoreError> {
        records.iter().map(|r| self.index_of(r)).collect()
    }

    fn index_of(&self, record: &Record) -> Result<usize, CoreError> {
        if record.trace != self.trace_id || record.index >= self.num_records {
            return Err(CoreError::InvalidRecord {
                method: format!("{}.{}", self.path, self.method),
                reason: "record belongs to a different method trace".to_string(),
            });
        }
        Ok(record.index)
    }
}

fn single(mut outputs: Vec<Record>, callee: String) -> Result<Record, CoreError> {
    match outputs.len() {
        1 => Ok(outputs.remove(0)),
        n => Err(CoreError::arity(format!("{callee} (outputs)"), 1, n)),
    }
}
