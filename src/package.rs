//! The package catalog and package-dependency graph (`spec.md` §3, §9).
//!
//! The catalog itself (parsing manifests into [`Package`] values) is an
//! external collaborator's job in the full system; this crate accepts an
//! already-built catalog and owns only the graph built from it. `PackageName`
//! is interned so that graph vertex identity is a cheap `Copy` handle rather
//! than a string comparison, per the "dynamic type erasure in the catalog"
//! design note.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, OnceLock, RwLock},
};

use color_eyre::{Result, eyre::bail};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::path::AbsDirPath;

/// An interned package name. Cheap to copy and compare; the backing string
/// lives in the [`PackageInterner`] owned by the [`PackageGraph`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PackageId(u32);

/// A package's declared name, as it appears in its manifest and in
/// `dependsOn` references (`pkg#task`).
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize)]
#[display("{_0}")]
pub struct PackageName(Arc<str>);

impl PackageName {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T: Into<Arc<str>>> From<T> for PackageName {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

/// A package as reported by the (out-of-scope) manifest loader collaborator.
#[derive(Clone, Debug)]
pub struct Package {
    pub name: PackageName,
    pub root: AbsDirPath,
    /// task name -> shell command.
    pub scripts: BTreeMap<String, String>,
    /// Names of sibling packages this package depends on internally.
    pub internal_dependencies: Vec<PackageName>,
    /// Opaque digest of this package's external (lockfile) dependencies,
    /// produced by the lockfile collaborator.
    pub external_dependency_digest: String,
}

/// Interns [`PackageName`]s to stable [`PackageId`] handles.
#[derive(Default, Debug)]
struct PackageInterner {
    by_name: HashMap<PackageName, PackageId>,
    by_id: Vec<PackageName>,
}

impl PackageInterner {
    fn intern(&mut self, name: PackageName) -> PackageId {
        if let Some(&id) = self.by_name.get(&name) {
            return id;
        }
        let id = PackageId(self.by_id.len() as u32);
        self.by_id.push(name.clone());
        self.by_name.insert(name, id);
        id
    }

    fn get(&self, id: PackageId) -> &PackageName {
        &self.by_id[id.0 as usize]
    }

    fn resolve(&self, name: &PackageName) -> Option<PackageId> {
        self.by_name.get(name).copied()
    }
}

/// The package-dependency graph: a DAG over interned package names plus a
/// synthetic root. Edges go from dependent to dependency (`spec.md` §3).
///
/// Built once per invocation from the catalog; immutable thereafter. Reverse
/// ("who depends on me") lookups are computed lazily on first use and cached,
/// per the "pointer-heavy graph walks" design note.
#[derive(Debug)]
pub struct PackageGraph {
    interner: PackageInterner,
    nodes: Vec<Package>,
    /// Adjacency: dependent -> its direct dependencies.
    edges: Vec<Vec<PackageId>>,
    reverse: OnceLock<Vec<Vec<PackageId>>>,
}

impl PackageGraph {
    /// Build the graph from a flat catalog of packages. Fails if any
    /// internal dependency references an unknown package, or if the
    /// resulting graph contains a cycle (`spec.md` §3 invariant).
    pub fn build(packages: Vec<Package>) -> Result<Self> {
        let mut interner = PackageInterner::default();
        for pkg in &packages {
            interner.intern(pkg.name.clone());
        }

        let mut edges = vec![Vec::new(); packages.len()];
        for pkg in &packages {
            let from = interner
                .resolve(&pkg.name)
                .expect("package was just interned");
            for dep in &pkg.internal_dependencies {
                let Some(to) = interner.resolve(dep) else {
                    bail!(
                        "package {:?} depends on unknown package {:?}",
                        pkg.name.as_str(),
                        dep.as_str()
                    );
                };
                edges[from.0 as usize].push(to);
            }
        }

        let graph = Self {
            interner,
            nodes: packages,
            edges,
            reverse: OnceLock::new(),
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn id_of(&self, name: &PackageName) -> Option<PackageId> {
        self.interner.resolve(name)
    }

    pub fn name_of(&self, id: PackageId) -> &PackageName {
        self.interner.get(id)
    }

    pub fn package(&self, id: PackageId) -> &Package {
        &self.nodes[id.0 as usize]
    }

    pub fn package_by_name(&self, name: &PackageName) -> Option<&Package> {
        self.id_of(name).map(|id| self.package(id))
    }

    /// Direct internal dependencies of `id`, in declaration order.
    pub fn dependencies(&self, id: PackageId) -> &[PackageId] {
        &self.edges[id.0 as usize]
    }

    /// Packages that directly depend on `id` (reverse edges), computed and
    /// cached lazily.
    pub fn dependents(&self, id: PackageId) -> &[PackageId] {
        let reverse = self.reverse.get_or_init(|| self.compute_reverse());
        &reverse[id.0 as usize]
    }

    fn compute_reverse(&self) -> Vec<Vec<PackageId>> {
        let mut reverse = vec![Vec::new(); self.nodes.len()];
        for (from, deps) in self.edges.iter().enumerate() {
            for &to in deps {
                reverse[to.0 as usize].push(PackageId(from as u32));
            }
        }
        reverse
    }

    /// All package ids in a topological order (dependencies before
    /// dependents). Used to compute package fingerprints in dependency
    /// order (`spec.md` §4.2).
    pub fn topological_order(&self) -> Vec<PackageId> {
        let n = self.nodes.len();
        let mut visited = vec![false; n];
        let mut order = Vec::with_capacity(n);

        fn visit(
            id: PackageId,
            edges: &[Vec<PackageId>],
            visited: &mut [bool],
            order: &mut Vec<PackageId>,
        ) {
            if visited[id.0 as usize] {
                return;
            }
            visited[id.0 as usize] = true;
            for &dep in &edges[id.0 as usize] {
                visit(dep, edges, visited, order);
            }
            order.push(id);
        }

        for i in 0..n {
            visit(PackageId(i as u32), &self.edges, &mut visited, &mut order);
        }
        order
    }

    fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let n = self.nodes.len();
        let mut marks = vec![Mark::Unvisited; n];
        let mut stack = Vec::new();

        fn visit(
            id: PackageId,
            edges: &[Vec<PackageId>],
            marks: &mut [Mark],
            stack: &mut Vec<PackageId>,
            names: &PackageInterner,
        ) -> Result<()> {
            match marks[id.0 as usize] {
                Mark::Done => return Ok(()),
                Mark::InProgress => {
                    let cycle: Vec<_> = stack
                        .iter()
                        .skip_while(|&&n| n != id)
                        .map(|&n| names.get(n).as_str().to_owned())
                        .collect();
                    bail!("cycle in package dependency graph: {}", cycle.join(" -> "));
                }
                Mark::Unvisited => {}
            }
            marks[id.0 as usize] = Mark::InProgress;
            stack.push(id);
            for &dep in &edges[id.0 as usize] {
                visit(dep, edges, marks, stack, names)?;
            }
            stack.pop();
            marks[id.0 as usize] = Mark::Done;
            Ok(())
        }

        for i in 0..n {
            visit(
                PackageId(i as u32),
                &self.edges,
                &mut marks,
                &mut stack,
                &self.interner,
            )?;
        }
        Ok(())
    }
}

/// Shared, read-only handle to the constructed package graph, per the
/// "global mutable state" design note: callers pass this explicitly rather
/// than reaching for a process-wide singleton.
pub type SharedPackageGraph = Arc<RwLock<PackageGraph>>;
