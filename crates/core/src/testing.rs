//! # Component Test Driver
//!
//! A generic harness for component tests: supply input spaces, build, call
//! entry points with literals and compare against expected values within a
//! tolerance.
//!
//! ```rust
//! use compgraph_core::graph_fn::{FnValue, GraphFn};
//! use compgraph_core::testing::ComponentTest;
//! use compgraph_core::{Component, Space};
//!
//! let mut add_one = Component::new("add_one");
//! add_one
//!     .define_api_graph_fn("run", &["x"], GraphFn::new("add", 1, 1, |ctx, args| {
//!         let one = ctx.constant(1.0)?;
//!         Ok(vec![FnValue::from(ctx.add(args[0].leaf()?, &one)?)])
//!     }))
//!     .unwrap();
//!
//! let test = ComponentTest::new(add_one, [("x", Space::scalar())]).unwrap();
//! test.test_scalars("run", &[1.1], &[2.1]);
//! ```

use std::sync::Arc;

use crate::backend::{Backend, DeferredBackend};
use crate::build::{BuiltGraph, GraphBuilder};
use crate::component::Component;
use crate::config::EngineConfig;
use crate::error::CoreError;
use crate::space::Space;
use crate::structure::Structure;
use crate::tensor::Tensor;

/// Default comparison tolerance.
pub const DEFAULT_TOLERANCE: f32 = 1e-4;

/// Builds one component and checks its entry points.
#[derive(Debug)]
pub struct ComponentTest {
    builder: GraphBuilder,
    built: Arc<BuiltGraph>,
    tolerance: f32,
}

impl ComponentTest {
    /// Build `component` on the deferred backend.
    pub fn new<K, I>(component: Component, input_spaces: I) -> Result<Self, CoreError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Space)>,
    {
        Self::with_backend(component, input_spaces, Arc::new(DeferredBackend::new()))
    }

    /// Build `component` on an explicit backend.
    pub fn with_backend<K, I>(
        component: Component,
        input_spaces: I,
        backend: Arc<dyn Backend>,
    ) -> Result<Self, CoreError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Space)>,
    {
        Self::from_builder(GraphBuilder::new(component, backend), input_spaces)
    }

    /// Build `component` with the backend and epsilon named by `config`.
    pub fn with_config<K, I>(
        component: Component,
        input_spaces: I,
        config: EngineConfig,
    ) -> Result<Self, CoreError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Space)>,
    {
        Self::from_builder(GraphBuilder::from_config(component, config)?, input_spaces)
    }

    fn from_builder<K, I>(mut builder: GraphBuilder, input_spaces: I) -> Result<Self, CoreError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Space)>,
    {
        let built = builder.build(input_spaces)?;
        Ok(Self {
            builder,
            built,
            tolerance: DEFAULT_TOLERANCE,
        })
    }

    pub fn with_tolerance(mut self, tolerance: f32) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn builder(&self) -> &GraphBuilder {
        &self.builder
    }

    pub fn built(&self) -> &Arc<BuiltGraph> {
        &self.built
    }

    /// Run an entry point.
    pub fn run(&self, method: &str, inputs: Vec<Structure<Tensor>>) -> Result<Vec<Structure<Tensor>>, CoreError> {
        self.built.execute(method, inputs)
    }

    /// Run an entry point and compare every output leaf within the tolerance.
    ///
    /// # Panics
    ///
    /// When the run fails or any output differs from `expected`.
    pub fn test(&self, method: &str, inputs: Vec<Structure<Tensor>>, expected: &[Structure<Tensor>]) -> Vec<Structure<Tensor>> {
        let outputs = match self.run(method, inputs) {
            Ok(outputs) => outputs,
            Err(e) => panic!("running '{method}' failed: {e}"),
        };
        assert_eq!(
            outputs.len(),
            expected.len(),
            "'{method}' returned {} outputs, expected {}",
            outputs.len(),
            expected.len()
        );
        for (i, (got, want)) in outputs.iter().zip(expected).enumerate() {
            assert!(
                got.same_structure(want) && got.keys() == want.keys(),
                "output {i} of '{method}': structure {:?} does not match {:?}",
                got.keys(),
                want.keys()
            );
            for ((key, g), w) in got.flatten().iter().zip(want.flatten().values()) {
                assert!(
                    g.all_close(w, self.tolerance),
                    "output {i}{key} of '{method}': got {g:?}, expected {w:?} (tol {})",
                    self.tolerance
                );
            }
        }
        outputs
    }

    /// [`test`](Self::test) for scalar inputs and scalar outputs.
    ///
    /// # Panics
    ///
    /// As for [`test`](Self::test).
    pub fn test_scalars(&self, method: &str, inputs: &[f32], expected: &[f32]) {
        let inputs = inputs.iter().map(|&x| Structure::Leaf(Tensor::scalar(x))).collect();
        let expected: Vec<Structure<Tensor>> = expected
            .iter()
            .map(|&x| Structure::Leaf(Tensor::scalar(x)))
            .collect();
        self.test(method, inputs, &expected);
    }
}
