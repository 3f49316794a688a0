//! # Error Types
//!
//! Errors are first-class composition failures: every one of them describes
//! an attempt to wire components together in a way that has no meaning
//! (two siblings under one scope, a call with the wrong number of
//! arguments, two call paths disagreeing about an argument's space).
//!
//! Build-time errors abort the build before any backend operation is
//! created. Runtime errors (missing feeds, bad input shapes) are reported by
//! the entry point that was invoked.

use thiserror::Error;

use crate::space::Space;

/// Core errors for the component-graph engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    /// Two sibling components share a scope name.
    #[error("Duplicate scope '{scope}' under '{parent}'")]
    DuplicateScope { parent: String, scope: String },

    /// A component already defines an API method or graph function with this name.
    #[error("Component '{component}' already defines '{name}'")]
    DuplicateMethod { component: String, name: String },

    /// A call supplied a number of values inconsistent with a descriptor.
    #[error("Arity mismatch for '{callee}': expected {expected}, got {got}")]
    Arity {
        callee: String,
        expected: String,
        got: usize,
    },

    /// Two call paths proposed incompatible spaces for the same argument.
    #[error("Space conflict for argument '{argument}' of '{component}': {existing} vs {proposed}")]
    SpaceConflict {
        component: String,
        argument: String,
        existing: Space,
        proposed: Space,
    },

    /// A split graph function received arguments with different leaf keys.
    #[error("Key alignment failed in graph function '{graph_fn}': {expected:?} vs {got:?}")]
    KeyAlignment {
        graph_fn: String,
        expected: Vec<String>,
        got: Vec<String>,
    },

    /// The recorded call graph contains a cycle.
    #[error("Cyclic call graph: {cycle}")]
    CyclicCallGraph { cycle: String },

    /// The configured numeric backend cannot be initialized.
    #[error("Backend '{name}' unavailable: {reason}")]
    BackendUnavailable { name: String, reason: String },

    /// A space descriptor violates its invariants.
    #[error("Invalid space: {reason}")]
    InvalidSpace { reason: String },

    /// Two structures that must line up do not.
    #[error("Structure mismatch: {reason}")]
    StructureMismatch { reason: String },

    /// Shapes don't line up for an operation.
    #[error("Shape mismatch in {op}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        op: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// No component lives at the given path.
    #[error("Unknown component '{path}'")]
    UnknownComponent { path: String },

    /// The component has no API method with this name.
    #[error("Component '{component}' has no API method '{method}'")]
    UnknownMethod { component: String, method: String },

    /// The component has no graph function with this name.
    #[error("Component '{component}' has no graph function '{name}'")]
    UnknownGraphFn { component: String, name: String },

    /// The component declares no variable with this name.
    #[error("Component '{component}' has no variable '{name}'")]
    UnknownVariable { component: String, name: String },

    /// The built graph exposes no entry point with this name.
    #[error("Unknown entry point '{name}'")]
    UnknownEntryPoint { name: String },

    /// A trace handle was used outside the method trace that created it.
    #[error("Invalid record in '{method}': {reason}")]
    InvalidRecord { method: String, reason: String },

    /// A root API method argument has no external input space.
    #[error("No input space supplied for argument '{argument}' of '{method}'")]
    MissingInputSpace { method: String, argument: String },

    /// A placeholder was evaluated without a value.
    #[error("No value fed for placeholder '{name}'")]
    MissingFeed { name: String },

    /// The component can no longer be restructured.
    #[error("Component '{scope}' is locked: {reason}")]
    ComponentLocked { scope: String, reason: String },

    /// The builder is already built against different input spaces.
    #[error("Already built: {reason}")]
    AlreadyBuilt { reason: String },

    /// A previous build failed; the builder must be reset first.
    #[error("Build failed: {reason}")]
    BuildFailed { reason: String },

    /// Configuration could not be parsed or is inconsistent.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl CoreError {
    /// Convenience constructor for arity mismatches with an exact count.
    pub fn arity(callee: impl Into<String>, expected: usize, got: usize) -> Self {
        CoreError::Arity {
            callee: callee.into(),
            expected: expected.to_string(),
            got,
        }
    }
}
