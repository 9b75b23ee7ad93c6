//! The file hasher (`spec.md` §4.1): produces `AnchoredPath -> hex-hash`
//! maps from either a source-control snapshot plus working-tree delta, or
//! direct glob resolution against disk.
//!
//! Git integration is an out-of-scope external collaborator per `spec.md`
//! §1; this module defines its contract as the [`GitIndex`] trait and
//! ships [`ShellGitIndex`], a thin implementation that shells out to the
//! `git` binary the way the teacher shells out to `cargo`/`rustc`.

use std::{
    collections::BTreeMap,
    ffi::{OsStr, OsString},
    process::Stdio,
};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use tracing::{instrument, trace};
use wax::Glob;

use crate::{
    hash::Blake3,
    path::{AbsDirPath, AbsFilePath, TryJoinWith},
};

/// An anchored path: always unix-style (`/`-separated), relative to a
/// named anchor directory, regardless of host OS (`spec.md` §4.1).
pub type AnchoredPath = String;

fn anchor(root: &AbsDirPath, file: &AbsFilePath) -> Result<AnchoredPath> {
    let relative = file
        .as_std_path()
        .strip_prefix(root.as_std_path())
        .with_context(|| format!("{file} is not under {root}"))?;
    Ok(relative.to_string_lossy().replace('\\', "/"))
}

/// One entry of `git status --porcelain=v1` output relevant to file hashing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkingTreeChange {
    AddedOrModified(AnchoredPath),
    Deleted(AnchoredPath),
}

/// The git-integration contract (`spec.md` §1 out-of-scope collaborators).
/// A real implementation shells out to `git`; tests substitute a fake.
#[async_trait::async_trait]
pub trait GitIndex: Send + Sync {
    /// Snapshot of all tracked files under `root` at `HEAD`, as anchored
    /// paths to their index object hashes.
    async fn ls_tree(&self, root: &AbsDirPath) -> Result<BTreeMap<AnchoredPath, String>>;

    /// Working-tree deltas (additions, modifications, deletions) under
    /// `root` relative to `HEAD`.
    async fn status(&self, root: &AbsDirPath) -> Result<Vec<WorkingTreeChange>>;

    /// Hash a single file's bytes using the same object-hashing convention
    /// as the index, so unmodified-file hashes agree between `ls_tree` and
    /// direct content hashing (`spec.md` §4.1 stability requirement).
    async fn hash_object(&self, path: &AbsFilePath) -> Result<String>;
}

/// A [`GitIndex`] backed by shelling out to the `git` binary, in the same
/// style as the teacher's `cargo`/`rustc` subprocess invocations.
#[derive(Default, Debug, Clone, Copy)]
pub struct ShellGitIndex;

#[async_trait::async_trait]
impl GitIndex for ShellGitIndex {
    #[instrument(skip(self))]
    async fn ls_tree(&self, root: &AbsDirPath) -> Result<BTreeMap<AnchoredPath, String>> {
        let output = run_git(root, ["ls-tree", "-r", "--full-tree", "HEAD"]).await?;
        let stdout = String::from_utf8(output).context("git ls-tree produced non-utf8 output")?;
        let mut map = BTreeMap::new();
        for line in stdout.lines() {
            // `<mode> <type> <hash>\t<path>`
            let Some((meta, path)) = line.split_once('\t') else {
                continue;
            };
            let hash = meta
                .split_whitespace()
                .nth(2)
                .ok_or_else(|| color_eyre::eyre::eyre!("malformed git ls-tree line: {line:?}"))?;
            map.insert(path.to_owned(), hash.to_owned());
        }
        Ok(map)
    }

    #[instrument(skip(self))]
    async fn status(&self, root: &AbsDirPath) -> Result<Vec<WorkingTreeChange>> {
        let output = run_git(root, ["status", "--porcelain=v1", "--no-renames"]).await?;
        let stdout =
            String::from_utf8(output).context("git status produced non-utf8 output")?;
        let mut changes = Vec::new();
        for line in stdout.lines() {
            if line.len() < 3 {
                continue;
            }
            let status = &line[..2];
            let path = line[3..].trim();
            if status.contains('D') {
                changes.push(WorkingTreeChange::Deleted(path.to_owned()));
            } else {
                changes.push(WorkingTreeChange::AddedOrModified(path.to_owned()));
            }
        }
        Ok(changes)
    }

    #[instrument(skip(self))]
    async fn hash_object(&self, path: &AbsFilePath) -> Result<String> {
        let parent = path
            .parent()
            .ok_or_else(|| color_eyre::eyre::eyre!("{path} has no parent directory"))?;
        let output = run_git(&parent, [OsStr::new("hash-object"), path.as_os_str()]).await?;
        let hash = String::from_utf8(output).context("git hash-object produced non-utf8 output")?;
        Ok(hash.trim().to_owned())
    }
}

async fn run_git<I, S>(cwd: &AbsDirPath, args: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
    trace!(?args, %cwd, "invoke git");
    let mut cmd = tokio::process::Command::new("git");
    cmd.current_dir(cwd.as_std_path());
    cmd.args(&args);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let output = cmd
        .spawn()
        .context("could not spawn git")?
        .wait_with_output()
        .await
        .context("could not complete git invocation")?;
    if !output.status.success() {
        bail!(
            "git {:?} exited with status {}: {}",
            args,
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(output.stdout)
}

/// `hashPackageFiles(packageRoot, inputs?)` (`spec.md` §4.1).
#[instrument(skip(git))]
pub async fn hash_package_files(
    git: &dyn GitIndex,
    package_root: &AbsDirPath,
    inputs: &[String],
) -> Result<BTreeMap<AnchoredPath, String>> {
    if inputs.is_empty() {
        hash_from_index_and_worktree(git, package_root).await
    } else {
        let mut globs: Vec<String> = inputs.to_vec();
        globs.push("package.json".to_owned());
        globs.push("monorail.json".to_owned());
        globs.push("monorail.jsonc".to_owned());
        hash_from_globs(package_root, &globs).await
    }
}

async fn hash_from_index_and_worktree(
    git: &dyn GitIndex,
    package_root: &AbsDirPath,
) -> Result<BTreeMap<AnchoredPath, String>> {
    let mut map = git.ls_tree(package_root).await?;
    for change in git.status(package_root).await? {
        match change {
            WorkingTreeChange::Deleted(path) => {
                map.remove(&path);
            }
            WorkingTreeChange::AddedOrModified(path) => {
                let abs = package_root.try_join_file(&path).with_context(|| {
                    format!("resolving working-tree change {path:?} under {package_root}")
                })?;
                let hash = git.hash_object(&abs).await?;
                map.insert(path, hash);
            }
        }
    }
    Ok(map)
}

async fn hash_from_globs(
    root: &AbsDirPath,
    globs: &[String],
) -> Result<BTreeMap<AnchoredPath, String>> {
    let compiled: Vec<Glob> = globs
        .iter()
        .map(|pattern| Glob::new(pattern).with_context(|| format!("invalid glob {pattern:?}")))
        .collect::<Result<_>>()?;

    let mut matched = Vec::new();
    for glob in &compiled {
        for entry in glob.walk(root.as_std_path()) {
            let Ok(entry) = entry else { continue };
            if entry.file_type().is_file() {
                matched.push(AbsFilePath::try_from(entry.path())?);
            }
        }
    }
    matched.sort();
    matched.dedup();

    hash_files(root, &matched).await
}

/// `hashFiles(root, absolutePaths)` (`spec.md` §4.1).
#[instrument(skip(paths))]
pub async fn hash_files(
    root: &AbsDirPath,
    paths: &[AbsFilePath],
) -> Result<BTreeMap<AnchoredPath, String>> {
    let mut map = BTreeMap::new();
    for path in paths {
        let key = anchor(root, path)?;
        let hash = Blake3::from_file(path)
            .await
            .with_context(|| format!("hashing {path}"))?;
        map.insert(key, hash.as_str().to_owned());
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeGitIndex {
        tracked: BTreeMap<AnchoredPath, String>,
        changes: Mutex<Vec<WorkingTreeChange>>,
        object_hashes: BTreeMap<AnchoredPath, String>,
    }

    #[async_trait::async_trait]
    impl GitIndex for FakeGitIndex {
        async fn ls_tree(&self, _root: &AbsDirPath) -> Result<BTreeMap<AnchoredPath, String>> {
            Ok(self.tracked.clone())
        }

        async fn status(&self, _root: &AbsDirPath) -> Result<Vec<WorkingTreeChange>> {
            Ok(self.changes.lock().unwrap().clone())
        }

        async fn hash_object(&self, path: &AbsFilePath) -> Result<String> {
            let lossy = path.as_str_lossy();
            let key = lossy.rsplit('/').next().unwrap_or(&lossy).to_owned();
            self.object_hashes
                .get(&key)
                .cloned()
                .ok_or_else(|| color_eyre::eyre::eyre!("no fake hash for {key}"))
        }
    }

    #[tokio::test]
    async fn deletion_removes_from_map() {
        let git = FakeGitIndex {
            tracked: BTreeMap::from([("a.txt".to_owned(), "hash-a".to_owned())]),
            changes: Mutex::new(vec![WorkingTreeChange::Deleted("a.txt".to_owned())]),
            object_hashes: BTreeMap::new(),
        };
        let root = AbsDirPath::try_from("/repo/pkg").unwrap();
        let result = hash_from_index_and_worktree(&git, &root).await.unwrap();
        assert!(!result.contains_key("a.txt"));
    }
}
