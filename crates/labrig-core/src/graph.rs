//! Dependency graph over declared modules.
//!
//! Nodes are module names, edges point from a dependent to the module one of
//! its connectors targets. The graph is rebuilt from scratch for every
//! declaration store and never edited afterwards.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::declaration::DeclarationStore;
use crate::models::{CoreError, CoreErrorKind, ModuleRole, ModuleSpec};

pub type GraphResult<T> = Result<T, CoreError>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DependencyEdge {
    pub dependent: String,
    pub dependency: String,
    pub connector: String,
    pub required: bool,
}

#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    roles: Vec<ModuleRole>,
    index: HashMap<String, usize>,
    edges: Vec<DependencyEdge>,
    // distinct dependency / dependent indices per node
    dependencies: Vec<Vec<usize>>,
    required_dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
    position: Vec<usize>,
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl DependencyGraph {
    pub fn from_store(store: &DeclarationStore) -> GraphResult<Self> {
        Self::build(store.specs())
    }

    /// Builds and validates the graph. Checks run in a fixed order: unknown
    /// references, then role compatibility, then cycles.
    pub fn build<'a>(specs: impl IntoIterator<Item = &'a ModuleSpec>) -> GraphResult<Self> {
        let specs: Vec<&ModuleSpec> = specs.into_iter().collect();
        let mut graph = Self::default();

        for spec in &specs {
            if graph.index.contains_key(&spec.name) {
                return Err(CoreError::for_module(
                    spec.name.as_str(),
                    CoreErrorKind::InvalidInput,
                    format!("module '{}' is declared more than once", spec.name),
                ));
            }
            graph.index.insert(spec.name.clone(), graph.nodes.len());
            graph.nodes.push(spec.name.clone());
            graph.roles.push(spec.role);
        }

        for spec in &specs {
            for binding in &spec.connectors {
                if !graph.index.contains_key(&binding.target) {
                    return Err(CoreError::for_module(
                        spec.name.as_str(),
                        CoreErrorKind::UnknownModuleReference,
                        format!(
                            "connector '{}' targets unknown module '{}'",
                            binding.name, binding.target
                        ),
                    )
                    .with_related([binding.target.as_str()]));
                }
            }
        }

        for spec in &specs {
            for binding in &spec.connectors {
                let target_role = graph.roles[graph.index[&binding.target]];
                if !spec.role.may_depend_on(target_role) {
                    return Err(CoreError::for_module(
                        spec.name.as_str(),
                        CoreErrorKind::IllegalRoleDependency,
                        format!(
                            "{} module '{}' may not depend on {} module '{}' (connector '{}')",
                            spec.role, spec.name, target_role, binding.target, binding.name
                        ),
                    )
                    .with_related([binding.target.as_str()]));
                }
            }
        }

        let node_count = graph.nodes.len();
        graph.dependencies = vec![Vec::new(); node_count];
        graph.required_dependencies = vec![Vec::new(); node_count];
        graph.dependents = vec![Vec::new(); node_count];
        for spec in &specs {
            let from = graph.index[&spec.name];
            for binding in &spec.connectors {
                let to = graph.index[&binding.target];
                graph.edges.push(DependencyEdge {
                    dependent: spec.name.clone(),
                    dependency: binding.target.clone(),
                    connector: binding.name.clone(),
                    required: binding.required,
                });
                if !graph.dependencies[from].contains(&to) {
                    graph.dependencies[from].push(to);
                    graph.dependents[to].push(from);
                }
                if binding.required && !graph.required_dependencies[from].contains(&to) {
                    graph.required_dependencies[from].push(to);
                }
            }
        }

        if let Some(cycle) = graph.find_cycle() {
            let path = cycle.join(" -> ");
            return Err(CoreError::for_module(
                cycle[0].as_str(),
                CoreErrorKind::CyclicDependency,
                format!("cyclic dependency: {path}"),
            )
            .with_related(cycle));
        }

        graph.order = graph.topological_order();
        graph.position = vec![0; node_count];
        for (position, node) in graph.order.iter().enumerate() {
            graph.position[*node] = position;
        }

        Ok(graph)
    }

    /// Three-color depth-first search; a back edge to an in-progress node
    /// closes a cycle. Returns the cycle with its first node repeated at the
    /// end, so a self-reference reads `[a, a]`.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut stack = Vec::new();
        for start in 0..self.nodes.len() {
            if marks[start] == Mark::Unvisited
                && let Some(cycle) = self.visit(start, &mut marks, &mut stack)
            {
                return Some(cycle);
            }
        }
        None
    }

    fn visit(&self, node: usize, marks: &mut [Mark], stack: &mut Vec<usize>) -> Option<Vec<String>> {
        marks[node] = Mark::InProgress;
        stack.push(node);

        for &next in &self.dependencies[node] {
            match marks[next] {
                Mark::InProgress => {
                    let start = stack.iter().position(|candidate| *candidate == next)?;
                    let mut cycle: Vec<String> = stack[start..]
                        .iter()
                        .map(|index| self.nodes[*index].clone())
                        .collect();
                    cycle.push(self.nodes[next].clone());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = self.visit(next, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        stack.pop();
        marks[node] = Mark::Done;
        None
    }

    /// Kahn's algorithm; among the modules ready at any step the one declared
    /// first goes next.
    fn topological_order(&self) -> Vec<usize> {
        let mut remaining: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = remaining
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(index, _)| index)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node) = ready.pop_first() {
            order.push(node);
            for &dependent in &self.dependents[node] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }
        order
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn role(&self, name: &str) -> Option<ModuleRole> {
        self.index.get(name).map(|index| self.roles[*index])
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    pub fn start_order(&self) -> Vec<String> {
        self.order
            .iter()
            .map(|index| self.nodes[*index].clone())
            .collect()
    }

    pub fn stop_order(&self) -> Vec<String> {
        self.order
            .iter()
            .rev()
            .map(|index| self.nodes[*index].clone())
            .collect()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).map(|index| self.position[*index])
    }

    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        self.names_at(name, &self.dependencies)
    }

    pub fn required_dependencies(&self, name: &str) -> Vec<&str> {
        self.names_at(name, &self.required_dependencies)
    }

    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.names_at(name, &self.dependents)
    }

    /// Everything that depends on `name`, directly or not, in start order.
    /// `name` itself is not included.
    pub fn transitive_dependents(&self, name: &str) -> Vec<String> {
        let reached = self.reach(name, &self.dependents);
        self.restrict_order(reached.iter().map(|index| self.nodes[*index].as_str()))
    }

    /// `name` and everything it needs, in start order.
    pub fn dependency_closure(&self, name: &str) -> Vec<String> {
        let mut reached = self.reach(name, &self.dependencies);
        if let Some(index) = self.index.get(name) {
            reached.insert(*index);
        }
        self.restrict_order(reached.iter().map(|index| self.nodes[*index].as_str()))
    }

    /// The given names sorted into start order; unknown names are dropped.
    pub fn restrict_order<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut known: Vec<(usize, String)> = names
            .into_iter()
            .filter_map(|name| self.position(name).map(|position| (position, name.to_string())))
            .collect();
        known.sort_by_key(|(position, _)| *position);
        known.dedup_by_key(|(position, _)| *position);
        known.into_iter().map(|(_, name)| name).collect()
    }

    fn names_at<'a>(&'a self, name: &str, adjacency: &[Vec<usize>]) -> Vec<&'a str> {
        self.index
            .get(name)
            .map(|index| {
                adjacency[*index]
                    .iter()
                    .map(|next| self.nodes[*next].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn reach(&self, name: &str, adjacency: &[Vec<usize>]) -> HashSet<usize> {
        let mut reached = HashSet::new();
        let Some(start) = self.index.get(name) else {
            return reached;
        };
        let mut pending = vec![*start];
        while let Some(node) = pending.pop() {
            for &next in &adjacency[node] {
                if next != *start && reached.insert(next) {
                    pending.push(next);
                }
            }
        }
        reached
    }
}
