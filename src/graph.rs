//! The task-execution graph (`spec.md` §4.4): built once per invocation
//! from the package graph, the selected package set, and each package's
//! resolved task definitions.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use color_eyre::{Result, eyre::bail};
use tracing::instrument;

use crate::{
    package::{PackageGraph, PackageId, PackageName},
    task::{DependencyRef, TaskDefinition},
};

/// `(package, task)` at execution time (`spec.md` §3, GLOSSARY).
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TaskKey {
    pub package: PackageName,
    pub task: String,
}

impl TaskKey {
    pub fn new(package: PackageName, task: impl Into<String>) -> Self {
        Self {
            package,
            task: task.into(),
        }
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.package, self.task)
    }
}

/// A vertex of the task-execution graph.
#[derive(Clone, Debug)]
pub struct TaskNode {
    pub key: TaskKey,
    pub definition: TaskDefinition,
    /// Other environment variable names contributed by `$NAME` dependsOn
    /// entries, folded into this task's fingerprint but not into edges.
    pub extra_env: Vec<String>,
}

/// The task-execution graph: an arena of [`TaskNode`]s plus an adjacency
/// list of dependency edges (`spec.md` §9 "pointer-heavy graph walks").
/// Edges run from a node to the nodes it depends on.
#[derive(Debug)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
    index_of: HashMap<TaskKey, usize>,
    /// node -> its direct dependencies (by node index).
    edges: Vec<Vec<usize>>,
}

/// The resolved per-task definitions available to graph construction,
/// keyed by `(package, task)`. Absence of an entry for a requested key
/// means package `P` declares no script for task `X` (`spec.md` §4.4 rule
/// 4): the node is elided and its dependents are rewired to its own
/// dependencies.
pub struct TaskDefinitions<'a> {
    pub by_package_and_task: &'a BTreeMap<TaskKey, TaskDefinition>,
}

impl<'a> TaskDefinitions<'a> {
    fn get(&self, key: &TaskKey) -> Option<&'a TaskDefinition> {
        self.by_package_and_task.get(key)
    }
}

/// A key's direct dependency references, resolved to concrete `TaskKey`s,
/// computed once per discovered key regardless of whether it materializes
/// into a node. This is what lets elision rewiring look through chains of
/// elided nodes (`spec.md` §4.4 rule 4).
struct Discovered {
    definition: Option<TaskDefinition>,
    direct_deps: Vec<TaskKey>,
    extra_env: Vec<String>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> &TaskNode {
        &self.nodes[idx]
    }

    pub fn index_of(&self, key: &TaskKey) -> Option<usize> {
        self.index_of.get(key).copied()
    }

    pub fn dependencies(&self, idx: usize) -> &[usize] {
        &self.edges[idx]
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.iter()
    }

    /// Build the graph per `spec.md` §4.4 rules 1-4, then check acyclicity
    /// and the persistent-task rule.
    ///
    /// `selected_packages` is the filtered package set the run operates
    /// over; `root_tasks` are the task names requested on the command
    /// line. `parallel_mode`, if set, drops every edge (`spec.md` §4.4
    /// "Parallel mode").
    #[instrument(skip_all)]
    pub fn build(
        packages: &PackageGraph,
        selected_packages: &[PackageId],
        root_tasks: &[String],
        definitions: &TaskDefinitions<'_>,
        parallel_mode: bool,
    ) -> Result<Self> {
        let mut discovered: HashMap<TaskKey, Discovered> = HashMap::new();
        let mut queue: VecDeque<TaskKey> = VecDeque::new();

        for &pkg_id in selected_packages {
            let name = packages.name_of(pkg_id).clone();
            for task in root_tasks {
                queue.push_back(TaskKey::new(name.clone(), task.clone()));
            }
        }

        while let Some(key) = queue.pop_front() {
            if discovered.contains_key(&key) {
                continue;
            }

            let def = definitions.get(&key).cloned();
            let mut direct_deps = Vec::new();
            let mut extra_env = Vec::new();

            if let Some(def) = &def {
                let pkg_id = packages.id_of(&key.package).ok_or_else(|| {
                    color_eyre::eyre::eyre!("unknown package {:?}", key.package)
                })?;
                for dep in def.parsed_depends_on()? {
                    match dep {
                        DependencyRef::Sibling { task } => {
                            let dep_key = TaskKey::new(key.package.clone(), task);
                            queue.push_back(dep_key.clone());
                            direct_deps.push(dep_key);
                        }
                        DependencyRef::Qualified { package, task } => {
                            let dep_key = TaskKey::new(package, task);
                            queue.push_back(dep_key.clone());
                            direct_deps.push(dep_key);
                        }
                        DependencyRef::Topological { task } => {
                            for &dep_pkg in packages.dependencies(pkg_id) {
                                let dep_key =
                                    TaskKey::new(packages.name_of(dep_pkg).clone(), task.clone());
                                queue.push_back(dep_key.clone());
                                direct_deps.push(dep_key);
                            }
                        }
                        DependencyRef::EnvVar { name } => extra_env.push(name),
                    }
                }
            }

            discovered.insert(
                key,
                Discovered {
                    definition: def,
                    direct_deps,
                    extra_env,
                },
            );
        }

        // Materialize nodes only for keys with a definition (a script);
        // elided keys exist only in `discovered` to serve edge rewiring.
        let mut nodes = Vec::new();
        let mut index_of = HashMap::new();
        for (key, entry) in &discovered {
            if let Some(def) = &entry.definition {
                index_of.insert(key.clone(), nodes.len());
                nodes.push(TaskNode {
                    key: key.clone(),
                    definition: def.clone(),
                    extra_env: entry.extra_env.clone(),
                });
            }
        }
        // Stable order: sort by key so iteration/debugging is deterministic
        // (HashMap iteration order above is not).
        let mut order: Vec<usize> = (0..nodes.len()).collect();
        order.sort_by(|&a, &b| nodes[a].key.cmp(&nodes[b].key));
        let nodes: Vec<TaskNode> = order.iter().map(|&i| nodes[i].clone()).collect();
        let index_of: HashMap<TaskKey, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.key.clone(), i))
            .collect();

        let edges = resolve_edges(&nodes, &index_of, &discovered)?;

        let mut graph = Self {
            nodes,
            index_of,
            edges,
        };

        if parallel_mode {
            for edges in &mut graph.edges {
                edges.clear();
            }
        }

        graph.check_acyclic()?;
        graph.check_persistent_rule()?;
        Ok(graph)
    }

    fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut stack = Vec::new();

        fn visit(
            idx: usize,
            edges: &[Vec<usize>],
            marks: &mut [Mark],
            stack: &mut Vec<usize>,
            nodes: &[TaskNode],
        ) -> Result<()> {
            match marks[idx] {
                Mark::Done => return Ok(()),
                Mark::InProgress => {
                    let cycle: Vec<String> = stack
                        .iter()
                        .skip_while(|&&n| n != idx)
                        .map(|&n| nodes[n].key.to_string())
                        .collect();
                    bail!("cycle in task graph: {}", cycle.join(" -> "));
                }
                Mark::Unvisited => {}
            }
            marks[idx] = Mark::InProgress;
            stack.push(idx);
            for &dep in &edges[idx] {
                visit(dep, edges, marks, stack, nodes)?;
            }
            stack.pop();
            marks[idx] = Mark::Done;
            Ok(())
        }

        for idx in 0..self.nodes.len() {
            visit(idx, &self.edges, &mut marks, &mut stack, &self.nodes)?;
        }
        Ok(())
    }

    fn check_persistent_rule(&self) -> Result<()> {
        let mut incoming: Vec<Option<usize>> = vec![None; self.nodes.len()];
        for (idx, deps) in self.edges.iter().enumerate() {
            for &dep in deps {
                incoming[dep] = Some(idx);
            }
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            if !node.definition.persistent {
                continue;
            }
            if let Some(dependent_idx) = incoming[idx] {
                bail!(
                    "persistent task {} cannot be a dependency of {}",
                    node.key,
                    self.nodes[dependent_idx].key
                );
            }
        }
        Ok(())
    }
}

/// Resolve each materialized node's direct dependency keys to node
/// indices, looking *through* elided keys to their own dependencies
/// (`spec.md` §4.4 rule 4), recursively and with a cycle guard.
fn resolve_edges(
    nodes: &[TaskNode],
    index_of: &HashMap<TaskKey, usize>,
    discovered: &HashMap<TaskKey, Discovered>,
) -> Result<Vec<Vec<usize>>> {
    fn expand(
        key: &TaskKey,
        index_of: &HashMap<TaskKey, usize>,
        discovered: &HashMap<TaskKey, Discovered>,
        visiting: &mut HashSet<TaskKey>,
        out: &mut Vec<usize>,
    ) -> Result<()> {
        if let Some(&idx) = index_of.get(key) {
            out.push(idx);
            return Ok(());
        }
        // Elided: look through to this key's own dependencies.
        if !visiting.insert(key.clone()) {
            bail!("cycle through elided task nodes at {key}");
        }
        if let Some(entry) = discovered.get(key) {
            for dep in &entry.direct_deps {
                expand(dep, index_of, discovered, visiting, out)?;
            }
        }
        visiting.remove(key);
        Ok(())
    }

    let mut edges = Vec::with_capacity(nodes.len());
    for node in nodes {
        let entry = discovered
            .get(&node.key)
            .expect("materialized node must be present in discovered map");
        let mut resolved = Vec::new();
        let mut visiting = HashSet::new();
        for dep in &entry.direct_deps {
            expand(dep, index_of, discovered, &mut visiting, &mut resolved)?;
        }
        resolved.sort_unstable();
        resolved.dedup();
        edges.push(resolved);
    }
    Ok(edges)
}
