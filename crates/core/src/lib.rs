//! # Core - Component Graph Assembly
//!
//! This crate assembles trees of reusable components into executable
//! computation graphs that do not depend on which backend runs them:
//!
//! - **Structures**: Nested tuple/dict containers with stable flat keys
//! - **Spaces**: Typed descriptions of the values flowing between components
//! - **Components**: Scoped nodes owning sub-components, API methods and graph functions
//! - **Recorder**: Traces each API method body once, at build time
//! - **Call graph**: The recorded calls as a DAG, checked for cycles
//! - **Build**: Space resolution, materialization and freezing into entry points
//! - **Backends**: Deferred (graph) and eager execution behind one trait
//! - **Testing**: A component test driver comparing outputs within a tolerance
//!
//! ## Design Philosophy
//!
//! API methods describe *how components call each other*; graph functions
//! describe *what is computed*. The recorder separates the two, so the same
//! tree compiles for any backend and every method body runs exactly once.

pub mod backend;
pub mod build;
pub mod call_graph;
pub mod component;
pub mod config;
pub mod error;
pub mod graph;
pub mod graph_fn;
pub mod layer;
pub mod ops;
pub mod program;
pub mod recorder;
pub mod space;
pub mod structure;
pub mod summary;
pub mod tensor;
pub mod testing;

// Re-export key types at crate root for convenience
pub use backend::{Backend, DeferredBackend, EagerBackend, ExecutionMode};
pub use build::{BuildState, BuiltGraph, GraphBuilder};
pub use call_graph::{CallGraph, CallKind, CallSite};
pub use component::{Component, ComponentPath};
pub use config::{backend_from_config, EngineConfig, SMALL_NUMBER};
pub use error::CoreError;
pub use graph_fn::{Arity, DataOp, FnValue, GraphFn, GraphFnContext};
pub use layer::{layer, Layer};
pub use recorder::{CallContext, Record};
pub use space::{BoxSpace, DType, Space};
pub use structure::{Flattened, Structure};
pub use summary::{InMemorySummarySink, SummaryEvent, SummarySink};
pub use tensor::Tensor;
pub use testing::ComponentTest;
