//! # Prob - Distribution Adapters
//!
//! Adapters turn the raw outputs of a network into the parameters of an
//! action distribution. They are ordinary graph-function authors: each one
//! is wrapped as a component by [`adapter_component`] and built like any
//! other part of a component tree.
//!
//! ## Adapters
//!
//! | Adapter | Units | Shape | Parameters | Probabilities |
//! |---------|-------|-------|------------|---------------|
//! | [`BetaAdapter`] | `2 × flat_dim` | `(2,)` for scalars, else last dim doubled | `(alpha, beta)`, both > 1 | none |
//! | [`CategoricalAdapter`] | `flat_dim × n` | `shape + (n,)` | logits | `max(softmax, ε)` and its log |
//!
//! ## Example
//!
//! ```rust
//! use compgraph_core::{ComponentTest, Space, Structure, Tensor};
//! use compgraph_prob::{adapter_component, ActionAdapter, BetaAdapter};
//! use compgraph_core::BoxSpace;
//!
//! let adapter = BetaAdapter::new(BoxSpace::float(vec![]));
//! let (units, shape) = adapter.units_and_shape().unwrap();
//! assert_eq!((units, shape.clone()), (2, vec![2]));
//!
//! let component = adapter_component("beta", adapter).unwrap();
//! let test = ComponentTest::new(component, [("adapter_outputs", Space::float(shape))]).unwrap();
//! let out = test
//!     .run("get_parameters", vec![Structure::Leaf(Tensor::vector(vec![0.0, 3.0]))])
//!     .unwrap();
//! let alpha = out[0].flatten().get("/[0]").unwrap().as_scalar().unwrap();
//! assert!(alpha > 1.0);
//! ```

mod adapter;
mod beta;
mod categorical;
mod error;

pub use adapter::{adapter_component, ActionAdapter, AdapterParameters, GET_PARAMETERS};
pub use beta::BetaAdapter;
pub use categorical::CategoricalAdapter;
pub use error::ProbError;
