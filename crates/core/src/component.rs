//! # Components - The Ownership Tree
//!
//! A component owns its sub-components, its API methods, its graph
//! functions and its variables. Ownership is strictly tree-shaped: a
//! component is moved into its parent by [`Component::add_component`] and
//! reached afterwards only through paths.
//!
//! ## Paths
//!
//! Global paths start at the root scope (`container/comp1`). Calls made from
//! an API method use paths relative to the calling component:
//!
//! | Relative path | Meaning |
//! |---------------|---------|
//! | `""` | the component itself |
//! | `"comp1"` | a direct sub-component |
//! | `"A/B"` | a grandchild |
//! | `"../X"` | a sibling |
//!
//! ## Lifecycle
//!
//! A component can be freely restructured until one of its API methods has
//! recorded calls. After that, removing or replacing sub-components fails
//! with `ComponentLocked`, as does any change once the tree is built.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::error::CoreError;
use crate::graph_fn::GraphFn;
use crate::recorder::{CallContext, MethodTrace, Record, Tracer};
use crate::space::Space;
use crate::tensor::Tensor;

/// Signature of an API-method body.
pub type ApiBody =
    Arc<dyn Fn(&mut CallContext<'_, '_>, Vec<Record>) -> Result<Vec<Record>, CoreError> + Send + Sync>;

/// An API-method descriptor. The body runs once, at trace time.
#[derive(Clone)]
pub struct ApiMethod {
    name: String,
    params: Vec<String>,
    body: ApiBody,
    trace: OnceLock<MethodTrace>,
}

impl ApiMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// The recorded calls, if the method has been traced.
    pub fn trace(&self) -> Option<&MethodTrace> {
        self.trace.get()
    }

    pub(crate) fn body(&self) -> &ApiBody {
        &self.body
    }

    pub(crate) fn store_trace(&self, trace: MethodTrace) -> Option<&MethodTrace> {
        // A concurrent store can only carry an identical trace.
        let _ = self.trace.set(trace);
        self.trace.get()
    }
}

impl fmt::Debug for ApiMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiMethod")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("traced", &self.trace.get().is_some())
            .finish()
    }
}

/// A global component path, root scope first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentPath(Vec<String>);

impl ComponentPath {
    pub fn root(scope: impl Into<String>) -> Self {
        Self(vec![scope.into()])
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn child(&self, scope: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(scope.to_string());
        Self(segments)
    }

    /// Resolve a path relative to this one.
    pub fn resolve(&self, relative: &str) -> Result<Self, CoreError> {
        let mut segments = self.0.clone();
        for part in relative.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    if segments.len() <= 1 {
                        return Err(CoreError::UnknownComponent {
                            path: format!("{self}/{relative}"),
                        });
                    }
                    segments.pop();
                }
                name => segments.push(name.to_string()),
            }
        }
        Ok(Self(segments))
    }
}

impl fmt::Display for ComponentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// A node of the component tree.
#[derive(Clone)]
pub struct Component {
    scope: String,
    sub_components: Vec<Component>,
    api_methods: Vec<ApiMethod>,
    graph_fns: BTreeMap<String, GraphFn>,
    variables: Vec<(String, Tensor)>,
    input_spaces: BTreeMap<String, Space>,
    built: bool,
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("scope", &self.scope)
            .field("sub_components", &self.sub_components)
            .field("api_methods", &self.api_methods)
            .field("graph_fns", &self.graph_fns.keys().collect::<Vec<_>>())
            .field("variables", &self.variables.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("built", &self.built)
            .finish()
    }
}

impl Component {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            sub_components: Vec::new(),
            api_methods: Vec::new(),
            graph_fns: BTreeMap::new(),
            variables: Vec::new(),
            input_spaces: BTreeMap::new(),
            built: false,
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    fn ensure_unbuilt(&self, action: &str) -> Result<(), CoreError> {
        if self.built {
            return Err(CoreError::ComponentLocked {
                scope: self.scope.clone(),
                reason: format!("cannot {action} after build"),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sub-components
    // ------------------------------------------------------------------

    /// Attach a sub-component.
    pub fn add_component(&mut self, component: Component) -> Result<(), CoreError> {
        self.add_components(vec![component])
    }

    /// Attach several sub-components. Nothing is attached if any scope
    /// collides with an existing sibling or with another in the batch.
    pub fn add_components(&mut self, components: Vec<Component>) -> Result<(), CoreError> {
        self.ensure_unbuilt("add components")?;
        for (i, component) in components.iter().enumerate() {
            let clashes_existing = self.sub_component(&component.scope).is_some();
            let clashes_batch = components[..i].iter().any(|c| c.scope == component.scope);
            if clashes_existing || clashes_batch {
                return Err(CoreError::DuplicateScope {
                    parent: self.scope.clone(),
                    scope: component.scope.clone(),
                });
            }
        }
        self.sub_components.extend(components);
        Ok(())
    }

    /// Detach a sub-component and hand it back.
    pub fn remove_component(&mut self, scope: &str) -> Result<Component, CoreError> {
        self.ensure_restructurable("remove", scope)?;
        let index = self.position_of(scope)?;
        Ok(self.sub_components.remove(index))
    }

    /// Swap a sub-component for another with the same scope, returning the old one.
    pub fn replace_component(&mut self, component: Component) -> Result<Component, CoreError> {
        self.ensure_restructurable("replace", &component.scope)?;
        let index = self.position_of(&component.scope)?;
        Ok(std::mem::replace(&mut self.sub_components[index], component))
    }

    fn ensure_restructurable(&self, action: &str, scope: &str) -> Result<(), CoreError> {
        self.ensure_unbuilt(&format!("{action} '{scope}'"))?;
        if self.has_recorded_calls() {
            return Err(CoreError::ComponentLocked {
                scope: self.scope.clone(),
                reason: format!("cannot {action} '{scope}' after calls were recorded"),
            });
        }
        Ok(())
    }

    fn position_of(&self, scope: &str) -> Result<usize, CoreError> {
        self.sub_components
            .iter()
            .position(|c| c.scope == scope)
            .ok_or_else(|| CoreError::UnknownComponent {
                path: format!("{}/{}", self.scope, scope),
            })
    }

    /// Direct sub-component by scope.
    pub fn sub_component(&self, scope: &str) -> Option<&Component> {
        self.sub_components.iter().find(|c| c.scope == scope)
    }

    /// Sub-components in addition order.
    pub fn sub_components(&self) -> &[Component] {
        &self.sub_components
    }

    // ------------------------------------------------------------------
    // API methods, graph functions, variables
    // ------------------------------------------------------------------

    /// Register an API method. The body is not run until the method is traced.
    pub fn define_api_method<F>(&mut self, name: &str, params: &[&str], body: F) -> Result<(), CoreError>
    where
        F: Fn(&mut CallContext<'_, '_>, Vec<Record>) -> Result<Vec<Record>, CoreError>
            + Send
            + Sync
            + 'static,
    {
        self.ensure_unbuilt("define API methods")?;
        if self.api_method(name).is_some() {
            return Err(CoreError::DuplicateMethod {
                component: self.scope.clone(),
                name: name.to_string(),
            });
        }
        self.api_methods.push(ApiMethod {
            name: name.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            body: Arc::new(body),
            trace: OnceLock::new(),
        });
        Ok(())
    }

    /// Register a graph function callable from this component's API methods.
    pub fn define_graph_fn(&mut self, graph_fn: GraphFn) -> Result<(), CoreError> {
        self.ensure_unbuilt("define graph functions")?;
        if self.graph_fns.contains_key(graph_fn.name()) {
            return Err(CoreError::DuplicateMethod {
                component: self.scope.clone(),
                name: graph_fn.name().to_string(),
            });
        }
        self.graph_fns.insert(graph_fn.name().to_string(), graph_fn);
        Ok(())
    }

    /// Register a graph function together with an API method that forwards
    /// its parameters to it and returns its outputs.
    pub fn define_api_graph_fn(
        &mut self,
        name: &str,
        params: &[&str],
        graph_fn: GraphFn,
    ) -> Result<(), CoreError> {
        let fn_name = graph_fn.name().to_string();
        self.define_graph_fn(graph_fn)?;
        self.define_api_method(name, params, move |ctx, args| ctx.graph_fn(&fn_name, &args))
    }

    /// Declare a named persistent value.
    pub fn add_variable(&mut self, name: &str, value: Tensor) -> Result<(), CoreError> {
        self.ensure_unbuilt("add variables")?;
        if self.variable(name).is_some() {
            return Err(CoreError::DuplicateMethod {
                component: self.scope.clone(),
                name: name.to_string(),
            });
        }
        self.variables.push((name.to_string(), value));
        Ok(())
    }

    pub fn api_method(&self, name: &str) -> Option<&ApiMethod> {
        self.api_methods.iter().find(|m| m.name == name)
    }

    /// API methods in definition order.
    pub fn api_methods(&self) -> &[ApiMethod] {
        &self.api_methods
    }

    pub fn graph_fn(&self, name: &str) -> Option<&GraphFn> {
        self.graph_fns.get(name)
    }

    pub fn variable(&self, name: &str) -> Option<&Tensor> {
        self.variables
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value)
    }

    /// Input spaces resolved at build time, by argument name.
    pub fn input_spaces(&self) -> &BTreeMap<String, Space> {
        &self.input_spaces
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    /// The recorded calls of `method`, tracing it first if needed.
    ///
    /// Tracing from here treats this component as the root, so paths that
    /// leave it (`"../X"`) fail. Inside a larger tree, let the builder trace.
    pub fn record(&self, method: &str) -> Result<&MethodTrace, CoreError> {
        let mut tracer = Tracer::new(self);
        tracer.trace(&ComponentPath::root(&self.scope), method)
    }

    /// Whether any method of this component or its descendants has been traced.
    pub fn has_recorded_calls(&self) -> bool {
        self.api_methods.iter().any(|m| m.trace.get().is_some())
            || self.sub_components.iter().any(Component::has_recorded_calls)
    }

    // ------------------------------------------------------------------
    // Crate-internal tree operations
    // ------------------------------------------------------------------

    /// Component at a global path, whose first segment must be this scope.
    pub fn find(&self, path: &ComponentPath) -> Option<&Component> {
        let (first, rest) = path.segments().split_first()?;
        if *first != self.scope {
            return None;
        }
        rest.iter()
            .try_fold(self, |current, scope| current.sub_component(scope))
    }

    pub(crate) fn find_mut(&mut self, path: &ComponentPath) -> Option<&mut Component> {
        let (first, rest) = path.segments().split_first()?;
        if *first != self.scope {
            return None;
        }
        let mut current = self;
        for scope in rest {
            current = current
                .sub_components
                .iter_mut()
                .find(|c| c.scope == *scope)?;
        }
        Some(current)
    }

    pub(crate) fn set_input_space(&mut self, argument: &str, space: Space) {
        self.input_spaces.insert(argument.to_string(), space);
    }

    /// Forget traces and resolved spaces, and unlock the tree.
    pub(crate) fn clear_records(&mut self) {
        for method in &mut self.api_methods {
            method.trace = OnceLock::new();
        }
        self.input_spaces.clear();
        self.built = false;
        self.sub_components.iter_mut().for_each(Component::clear_records);
    }

    pub(crate) fn mark_built(&mut self) {
        self.built = true;
        self.sub_components.iter_mut().for_each(Component::mark_built);
    }

    /// All variables under global scoped names, depth-first in addition order.
    pub(crate) fn collect_variables(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        let scope = if prefix.is_empty() {
            self.scope.clone()
        } else {
            format!("{prefix}/{}", self.scope)
        };
        for (name, value) in &self.variables {
            out.push((format!("{scope}/{name}"), value.clone()));
        }
        for sub in &self.sub_components {
            sub.collect_variables(&scope, out);
        }
    }
}
