//! A minimal package-manifest loader.
//!
//! `monorail::package` deliberately takes an already-built catalog — the
//! manifest loader is an out-of-scope external collaborator. Something
//! still has to produce that catalog for the binary to run against a real
//! repository, so this module reads `package.json`/`workspaces` the way a
//! real npm-style monorepo loader would, computing each package's external
//! dependency digest from its manifest's `dependencies`/`devDependencies`
//! since lockfile parsing is, likewise, out of scope.

use std::collections::{BTreeMap, BTreeSet};

use color_eyre::{
    Result,
    eyre::{Context, OptionExt},
};
use serde::Deserialize;
use wax::Glob;

use monorail::{
    hash::Blake3,
    package::{Package, PackageName},
    path::{AbsDirPath, TryJoinWith as _},
};

#[derive(Debug, Default, Deserialize)]
struct RawManifest {
    name: Option<String>,
    #[serde(default)]
    workspaces: Vec<String>,
    #[serde(default)]
    scripts: BTreeMap<String, String>,
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
    #[serde(default)]
    dev_dependencies: BTreeMap<String, String>,
}

async fn read_manifest(dir: &AbsDirPath) -> Result<Option<RawManifest>> {
    let path = dir.try_join_file("package.json")?;
    match monorail::fs::read_buffered_utf8(&path).await? {
        Some(text) => serde_json::from_str(&text)
            .with_context(|| format!("parse {path} as package.json"))
            .map(Some),
        None => Ok(None),
    }
}

fn external_digest(manifest: &RawManifest) -> String {
    let mut pairs: BTreeSet<(String, String)> = BTreeSet::new();
    pairs.extend(manifest.dependencies.iter().map(|(k, v)| (k.clone(), v.clone())));
    pairs.extend(manifest.dev_dependencies.iter().map(|(k, v)| (k.clone(), v.clone())));
    Blake3::from_fields(pairs.iter().flat_map(|(k, v)| [k.clone(), v.clone()]))
        .to_string()
}

/// The root `package.json`'s own `dependencies`/`devDependencies` digest,
/// folded into the global fingerprint as the "root external dependency
/// digest" (`spec.md` §4.2) — distinct from any workspace member's digest.
pub async fn root_external_dependency_digest(repo_root: &AbsDirPath) -> Result<String> {
    let manifest = read_manifest(repo_root)
        .await?
        .ok_or_eyre("no package.json at the repo root")?;
    Ok(external_digest(&manifest))
}

/// Discover every workspace package reachable from `repo_root`'s
/// `package.json`, or treat `repo_root` itself as the sole package if it
/// declares no `workspaces`.
pub async fn discover(repo_root: &AbsDirPath) -> Result<Vec<Package>> {
    let root_manifest = read_manifest(repo_root)
        .await?
        .ok_or_eyre("no package.json at the repo root")?;

    let mut roots = Vec::new();
    if root_manifest.workspaces.is_empty() {
        roots.push(repo_root.clone());
    } else {
        for pattern in &root_manifest.workspaces {
            let glob_pattern = format!("{pattern}/package.json");
            let glob = Glob::new(&glob_pattern)
                .with_context(|| format!("invalid workspaces glob {pattern:?}"))?;
            for entry in glob.walk(repo_root.as_std_path()) {
                let Ok(entry) = entry else { continue };
                if let Some(dir) = entry.path().parent() {
                    roots.push(AbsDirPath::try_from(dir)?);
                }
            }
        }
    }
    roots.sort();
    roots.dedup();

    let mut by_name: BTreeMap<PackageName, (AbsDirPath, RawManifest)> = BTreeMap::new();
    for root in roots {
        let Some(manifest) = read_manifest(&root).await? else {
            continue;
        };
        let name = manifest
            .name
            .clone()
            .ok_or_eyre("package.json missing a name")
            .with_context(|| format!("{root}/package.json"))?;
        by_name.insert(PackageName::new(name), (root, manifest));
    }

    let known: BTreeSet<&PackageName> = by_name.keys().collect();
    let mut packages = Vec::with_capacity(by_name.len());
    for (name, (root, manifest)) in &by_name {
        let mut deps: BTreeSet<String> = manifest.dependencies.keys().cloned().collect();
        deps.extend(manifest.dev_dependencies.keys().cloned());
        let internal_dependencies = deps
            .into_iter()
            .map(PackageName::new)
            .filter(|dep| known.contains(dep))
            .collect();

        packages.push(Package {
            name: name.clone(),
            root: root.clone(),
            scripts: manifest.scripts.clone(),
            internal_dependencies,
            external_dependency_digest: external_digest(manifest),
        });
    }
    Ok(packages)
}
