//! # Build Engine
//!
//! [`GraphBuilder`] compiles a component tree into a [`BuiltGraph`]:
//!
//! ```text
//! Unbuilt ──trace + check + resolve──▶ SpacesResolved
//!         ──materialize──────────────▶ BackendMaterialized
//!         ──freeze───────────────────▶ Built
//!
//! any error ─────────────────────────▶ Failed   (reset() ▶ Unbuilt)
//! ```
//!
//! ## Phases
//!
//! 1. **Validate** the external input spaces and check that every root API
//!    argument has one.
//! 2. **Trace** every root API method (recursively every method it reaches).
//!    Arity mismatches, unknown callees and cycles surface here.
//! 3. **Check** the assembled [`CallGraph`] is a DAG.
//! 4. **Resolve spaces** by replaying the traces on a shape-only sink. Each
//!    argument of each reached method gets a space; disagreeing call paths
//!    raise `SpaceConflict`.
//! 5. **Materialize** the traces into an [`OpGraph`], one entry point per
//!    root API method, with root arguments created by the backend.
//! 6. **Freeze** the tree: it is marked built and moved behind an `Arc`.
//!
//! Phases 1–4 create no backend op. A failure in any phase leaves the builder
//! `Failed` and drops everything the attempt produced.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::call_graph::CallGraph;
use crate::component::{Component, ComponentPath};
use crate::config::{backend_from_config, EngineConfig};
use crate::error::CoreError;
use crate::graph::OpGraph;
use crate::ops::ShapeSink;
use crate::program::{materialize_argument, EntryParam, EntryPoint, Interpreter, Program, SpaceProposals};
use crate::recorder::Tracer;
use crate::space::Space;
use crate::structure::Structure;
use crate::tensor::Tensor;

/// Where a builder is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Unbuilt,
    SpacesResolved,
    BackendMaterialized,
    Built,
    Failed,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildState::Unbuilt => "UNBUILT",
            BuildState::SpacesResolved => "SPACES_RESOLVED",
            BuildState::BackendMaterialized => "BACKEND_MATERIALIZED",
            BuildState::Built => "BUILT",
            BuildState::Failed => "FAILED",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug)]
enum RootSlot {
    Owned(Component),
    Frozen(Arc<Component>),
}

/// Compiles a component tree against input spaces on one backend.
#[derive(Debug)]
pub struct GraphBuilder {
    config: EngineConfig,
    backend: Arc<dyn Backend>,
    root: RootSlot,
    state: BuildState,
    built: Option<Arc<BuiltGraph>>,
    input_spaces: BTreeMap<String, Space>,
    failure: Option<CoreError>,
}

impl GraphBuilder {
    /// A builder for `root` on an explicit backend with default settings.
    pub fn new(root: Component, backend: Arc<dyn Backend>) -> Self {
        Self {
            config: EngineConfig::default(),
            backend,
            root: RootSlot::Owned(root),
            state: BuildState::Unbuilt,
            built: None,
            input_spaces: BTreeMap::new(),
            failure: None,
        }
    }

    /// A builder whose backend and epsilon come from `config`.
    pub fn from_config(root: Component, config: EngineConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let backend = backend_from_config(&config)?;
        Ok(Self {
            config,
            ..Self::new(root, backend)
        })
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn root(&self) -> &Component {
        match &self.root {
            RootSlot::Owned(component) => component,
            RootSlot::Frozen(component) => component,
        }
    }

    /// Mutable access to the tree; only before a successful build.
    pub fn root_mut(&mut self) -> Result<&mut Component, CoreError> {
        match &mut self.root {
            RootSlot::Owned(component) => Ok(component),
            RootSlot::Frozen(component) => Err(CoreError::ComponentLocked {
                scope: component.scope().to_string(),
                reason: "the tree is built; reset the builder first".to_string(),
            }),
        }
    }

    /// The built graph, if the last build succeeded.
    pub fn built(&self) -> Option<&Arc<BuiltGraph>> {
        self.built.as_ref()
    }

    /// Build against the given root input spaces, keyed by argument name.
    ///
    /// Building again with the same spaces returns the same graph. Different
    /// spaces are rejected with `AlreadyBuilt`, and a failed builder answers
    /// `BuildFailed` until [`reset`](Self::reset).
    pub fn build<K, I>(&mut self, input_spaces: I) -> Result<Arc<BuiltGraph>, CoreError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Space)>,
    {
        let spaces: BTreeMap<String, Space> = input_spaces
            .into_iter()
            .map(|(k, v)| (k.into(), v))
            .collect();

        match self.state {
            BuildState::Built => {
                return match &self.built {
                    Some(built) if spaces == self.input_spaces => {
                        debug!(root = self.root().scope(), "already built; reusing graph");
                        Ok(Arc::clone(built))
                    }
                    _ => Err(CoreError::AlreadyBuilt {
                        reason: format!(
                            "'{}' was built with different input spaces",
                            self.root().scope()
                        ),
                    }),
                };
            }
            BuildState::Failed => {
                return Err(CoreError::BuildFailed {
                    reason: self
                        .failure
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "previous build failed".to_string()),
                });
            }
            _ => {}
        }

        info!(
            root = self.root().scope(),
            backend = self.backend.name(),
            "building component graph"
        );
        match self.try_build(spaces) {
            Ok(built) => Ok(built),
            Err(error) => {
                warn!(root = self.root().scope(), state = %self.state, %error, "build failed");
                self.state = BuildState::Failed;
                self.failure = Some(error.clone());
                Err(error)
            }
        }
    }

    fn try_build(&mut self, spaces: BTreeMap<String, Space>) -> Result<Arc<BuiltGraph>, CoreError> {
        let backend = Arc::clone(&self.backend);
        let small_number = self.config.small_number;
        let root = match &mut self.root {
            RootSlot::Owned(component) => component,
            RootSlot::Frozen(_) => {
                return Err(CoreError::AlreadyBuilt {
                    reason: "the tree is frozen".to_string(),
                })
            }
        };
        let root_path = ComponentPath::root(root.scope());
        let methods: Vec<(String, Vec<String>)> = root
            .api_methods()
            .iter()
            .map(|m| (m.name().to_string(), m.params().to_vec()))
            .collect();

        // 1. validate
        for space in spaces.values() {
            space.validate()?;
        }
        for (method, params) in &methods {
            for param in params {
                if !spaces.contains_key(param) {
                    return Err(CoreError::MissingInputSpace {
                        method: format!("{root_path}.{method}"),
                        argument: param.clone(),
                    });
                }
            }
        }

        // 2. trace
        {
            let mut tracer = Tracer::new(root);
            for (method, _) in &methods {
                tracer.trace(&root_path, method)?;
            }
        }

        // 3. check
        let call_graph = CallGraph::from_traces(root)?;
        debug!(
            callables = call_graph.node_count(),
            calls = call_graph.edge_count(),
            "call graph assembled"
        );

        // 4. resolve spaces
        let mut proposals = SpaceProposals::new();
        {
            let mut shapes = ShapeSink::new();
            for (method, params) in &methods {
                let args = params
                    .iter()
                    .map(|p| materialize_argument(backend.as_ref(), &mut shapes, method, p, &spaces[p]))
                    .collect::<Result<Vec<_>, _>>()?;
                Interpreter::new(root, &mut shapes, small_number)
                    .with_proposals(&mut proposals)
                    .call_api(&root_path, method, args)?;
            }
        }
        let resolved = proposals.len();
        for ((path, argument), space) in proposals.into_spaces() {
            let component = root.find_mut(&path).ok_or_else(|| CoreError::UnknownComponent {
                path: path.to_string(),
            })?;
            component.set_input_space(&argument, space);
        }
        self.state = BuildState::SpacesResolved;
        info!(arguments = resolved, "input spaces resolved");

        // 5. materialize
        let mut graph = OpGraph::new();
        let mut entry_points = Vec::with_capacity(methods.len());
        for (method, params) in &methods {
            let params = params
                .iter()
                .map(|p| {
                    let space = spaces[p].clone();
                    let ops = materialize_argument(backend.as_ref(), &mut graph, method, p, &space)?;
                    Ok(EntryParam {
                        name: p.clone(),
                        space,
                        ops,
                    })
                })
                .collect::<Result<Vec<_>, CoreError>>()?;
            let args = params.iter().map(|p| p.ops.clone()).collect();
            let outputs = Interpreter::new(root, &mut graph, small_number).call_api(&root_path, method, args)?;
            let summaries = graph.take_summaries();
            debug!(
                entry = %method,
                outputs = outputs.len(),
                summaries = summaries.len(),
                ops = graph.node_count(),
                "entry point materialized"
            );
            entry_points.push(EntryPoint {
                name: method.clone(),
                params,
                outputs,
                summaries,
            });
        }
        self.state = BuildState::BackendMaterialized;

        // 6. freeze
        root.mark_built();
        let frozen = Arc::new(std::mem::replace(root, Component::new(String::new())));
        self.root = RootSlot::Frozen(Arc::clone(&frozen));

        let mut variables = Vec::new();
        frozen.collect_variables("", &mut variables);
        let op_count = graph.node_count();
        let built = Arc::new(BuiltGraph {
            program: Program::new(frozen, graph, small_number),
            entry_points,
            backend,
            call_graph,
            variables,
            input_spaces: spaces.clone(),
        });

        self.state = BuildState::Built;
        self.input_spaces = spaces;
        self.built = Some(Arc::clone(&built));
        info!(
            root = %root_path,
            entry_points = built.entry_points.len(),
            ops = op_count,
            "component graph built"
        );
        Ok(built)
    }

    /// Return to `Unbuilt`, discarding entry points, recorded calls and
    /// resolved spaces.
    pub fn reset(&mut self) {
        self.built = None;
        let slot = std::mem::replace(&mut self.root, RootSlot::Owned(Component::new(String::new())));
        let mut root = match slot {
            RootSlot::Owned(component) => component,
            RootSlot::Frozen(shared) => Arc::try_unwrap(shared).unwrap_or_else(|shared| (*shared).clone()),
        };
        root.clear_records();
        info!(root = root.scope(), from = %self.state, "builder reset");
        self.root = RootSlot::Owned(root);
        self.state = BuildState::Unbuilt;
        self.input_spaces.clear();
        self.failure = None;
    }
}

/// The compiled artifact: entry points over an immutable program.
///
/// Entry points only read shared state, so a `BuiltGraph` may be executed
/// from many threads at once.
#[derive(Debug)]
pub struct BuiltGraph {
    program: Program,
    entry_points: Vec<EntryPoint>,
    backend: Arc<dyn Backend>,
    call_graph: CallGraph,
    variables: Vec<(String, Tensor)>,
    input_spaces: BTreeMap<String, Space>,
}

impl BuiltGraph {
    /// Entry points in root API-method order.
    pub fn entry_points(&self) -> &[EntryPoint] {
        &self.entry_points
    }

    pub fn entry_point(&self, name: &str) -> Result<&EntryPoint, CoreError> {
        self.entry_points
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| CoreError::UnknownEntryPoint {
                name: name.to_string(),
            })
    }

    /// Run entry point `name` on structured inputs.
    pub fn execute(&self, name: &str, inputs: Vec<Structure<Tensor>>) -> Result<Vec<Structure<Tensor>>, CoreError> {
        let entry = self.entry_point(name)?;
        if inputs.len() != entry.params.len() {
            return Err(CoreError::arity(
                format!("{}.{}", self.program.root().scope(), name),
                entry.params.len(),
                inputs.len(),
            ));
        }
        self.backend.run(&self.program, entry, inputs)
    }

    /// Run an entry point with plain tensor inputs and a single plain output.
    pub fn execute_one(&self, name: &str, inputs: Vec<Tensor>) -> Result<Tensor, CoreError> {
        let outputs = self.execute(name, inputs.into_iter().map(Structure::Leaf).collect())?;
        let count = outputs.len();
        match <[_; 1]>::try_from(outputs) {
            Ok([Structure::Leaf(value)]) => Ok(value),
            Ok([other]) => Err(CoreError::StructureMismatch {
                reason: format!("'{name}' returned a structure with {} leaves", other.num_leaves()),
            }),
            Err(_) => Err(CoreError::arity(format!("{name} (outputs)"), 1, count)),
        }
    }

    /// Variables under their global scoped names, in addition order.
    pub fn variables(&self) -> &[(String, Tensor)] {
        &self.variables
    }

    pub fn variable_names(&self) -> Vec<&str> {
        self.variables.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Number of ops in the materialized graph.
    pub fn op_count(&self) -> usize {
        self.program.graph().node_count()
    }

    pub fn call_graph(&self) -> &CallGraph {
        &self.call_graph
    }

    /// The frozen component tree.
    pub fn root(&self) -> &Component {
        self.program.root()
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn input_spaces(&self) -> &BTreeMap<String, Space> {
        &self.input_spaces
    }
}
