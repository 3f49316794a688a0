//! # Call Graph
//!
//! The union of all method traces reachable from the root's API methods,
//! as a petgraph `DiGraph`. Nodes are callables (API methods and graph
//! functions, by global scope); an edge `caller → callee` carries the
//! ordinal of the call inside the caller's trace.
//!
//! The graph must be a DAG. Tracing already rejects recursion; the build
//! checks the assembled graph once more with a topological sort before any
//! backend op is created.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::HashMap;
use std::fmt;

use crate::component::{Component, ComponentPath};
use crate::error::CoreError;
use crate::recorder::CallTarget;

/// Whether a call site is an API method or a graph function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Api,
    GraphFn,
}

/// A callable in the call graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallSite {
    /// Global scope of the owning component.
    pub component: String,
    pub callable: String,
    pub kind: CallKind,
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.component, self.callable)
    }
}

/// The DAG of recorded calls.
#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    graph: DiGraph<CallSite, usize>,
    index: HashMap<CallSite, NodeIndex>,
}

impl CallGraph {
    /// Assemble the call graph from the stored traces of `root`'s API methods.
    pub fn from_traces(root: &Component) -> Result<Self, CoreError> {
        let mut graph = Self::default();
        let root_path = ComponentPath::root(root.scope());
        for method in root.api_methods() {
            graph.visit(root, &root_path, method.name())?;
        }
        graph.check_acyclic()?;
        Ok(graph)
    }

    fn visit(&mut self, root: &Component, path: &ComponentPath, method: &str) -> Result<NodeIndex, CoreError> {
        let site = CallSite {
            component: path.to_string(),
            callable: method.to_string(),
            kind: CallKind::Api,
        };
        if let Some(&existing) = self.index.get(&site) {
            return Ok(existing);
        }
        let node = self.add_site(site);

        let trace = root
            .find(path)
            .and_then(|c| c.api_method(method))
            .and_then(|m| m.trace())
            .ok_or_else(|| CoreError::BuildFailed {
                reason: format!("'{path}.{method}' has not been traced"),
            })?;
        for call in &trace.calls {
            let callee = match &call.target {
                CallTarget::Api {
                    path: relative,
                    method,
                } => {
                    let target = path.resolve(relative)?;
                    self.visit(root, &target, method)?
                }
                CallTarget::GraphFn { name } => self.add_site(CallSite {
                    component: path.to_string(),
                    callable: name.clone(),
                    kind: CallKind::GraphFn,
                }),
                CallTarget::Constant { .. } => continue,
            };
            self.graph.add_edge(node, callee, call.ordinal);
        }
        Ok(node)
    }

    fn add_site(&mut self, site: CallSite) -> NodeIndex {
        if let Some(&existing) = self.index.get(&site) {
            return existing;
        }
        let node = self.graph.add_node(site.clone());
        self.index.insert(site, node);
        node
    }

    fn check_acyclic(&self) -> Result<(), CoreError> {
        toposort(&self.graph, None)
            .map(|_| ())
            .map_err(|cycle| CoreError::CyclicCallGraph {
                cycle: self.graph[cycle.node_id()].to_string(),
            })
    }

    /// Callables with every callee before its callers.
    pub fn topological_order(&self) -> Vec<&CallSite> {
        match toposort(&self.graph, None) {
            Ok(order) => order.into_iter().rev().map(|idx| &self.graph[idx]).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Direct callees of `site`, in call order.
    pub fn callees(&self, site: &CallSite) -> Vec<&CallSite> {
        let Some(&node) = self.index.get(site) else {
            return Vec::new();
        };
        let mut edges: Vec<(usize, NodeIndex)> = self
            .graph
            .edges(node)
            .map(|edge| (*edge.weight(), edge.target()))
            .collect();
        edges.sort_unstable();
        edges.into_iter().map(|(_, idx)| &self.graph[idx]).collect()
    }

    pub fn contains(&self, site: &CallSite) -> bool {
        self.index.contains_key(site)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph_fn::GraphFn;

    fn api(component: &str, callable: &str) -> CallSite {
        CallSite {
            component: component.to_string(),
            callable: callable.to_string(),
            kind: CallKind::Api,
        }
    }

    #[test]
    fn test_diamond_call_graph() {
        let mut leaf = Component::new("leaf");
        leaf.define_api_graph_fn(
            "run",
            &["x"],
            GraphFn::new("pass", 1, 1, |_ctx, args| Ok(args)),
        )
        .unwrap();
        let mut root = Component::new("root");
        root.add_component(leaf).unwrap();
        root.define_api_method("left", &["x"], |ctx, args| ctx.call("leaf", "run", &args))
            .unwrap();
        root.define_api_method("right", &["x"], |ctx, args| ctx.call("leaf", "run", &args))
            .unwrap();
        root.define_api_method("both", &["x"], |ctx, args| {
            let l = ctx.call_own("left", &args)?;
            ctx.call_own("right", &l)
        })
        .unwrap();
        for method in ["left", "right", "both"] {
            root.record(method).unwrap();
        }

        let graph = CallGraph::from_traces(&root).unwrap();
        // root.{left,right,both}, leaf.run, leaf.pass
        assert_eq!(graph.node_count(), 5);
        assert_eq!(graph.edge_count(), 5);

        let order = graph.topological_order();
        let pos = |site: &CallSite| order.iter().position(|s| *s == site).unwrap();
        assert!(pos(&api("root/leaf", "run")) < pos(&api("root", "left")));
        assert!(pos(&api("root", "left")) < pos(&api("root", "both")));

        let callees = graph.callees(&api("root", "both"));
        assert_eq!(callees, vec![&api("root", "left"), &api("root", "right")]);
    }

    #[test]
    fn test_untraced_method_is_rejected() {
        let mut root = Component::new("root");
        root.define_api_method("run", &[], |_ctx, _args| Ok(vec![]))
            .unwrap();
        assert!(matches!(
            CallGraph::from_traces(&root),
            Err(CoreError::BuildFailed { .. })
        ));
    }
}
