//! Task definitions and `dependsOn` reference parsing (`spec.md` §3, §6).

use std::collections::BTreeSet;

use color_eyre::{Result, eyre::bail};
use serde::{Deserialize, Serialize};

use crate::package::PackageName;

/// The single-character sigil marking a `dependsOn` entry as an
/// environment-variable contribution to the fingerprint rather than a graph
/// edge. `^` is reserved by the spec for topological references, so this
/// crate uses `$` (matching the convention the config author is most likely
/// to already know from shell syntax) — see `SPEC_FULL.md` §9.
pub const ENV_SIGIL: char = '$';

/// How verbose a task's replayed/streamed log should be (`spec.md` §4.5).
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputLogsMode {
    #[default]
    Full,
    HashOnly,
    NewOnly,
    ErrorsOnly,
    None,
}

/// A parsed `dependsOn` entry (`spec.md` §3, §6).
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum DependencyRef {
    /// `X` — depends on `X` within the same package.
    Sibling { task: String },
    /// `pkg#X` — depends on task `X` in a named package.
    Qualified { package: PackageName, task: String },
    /// `^X` — depends on `X` in every internal dependency of this package.
    Topological { task: String },
    /// `$NAME` — contributes `NAME` to the fingerprint; no graph edge.
    EnvVar { name: String },
}

impl DependencyRef {
    /// Parse a single raw `dependsOn` string per the three-kind grammar
    /// plus the env-var sigil.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            bail!("empty dependsOn entry");
        }
        if let Some(name) = raw.strip_prefix(ENV_SIGIL) {
            if name.is_empty() {
                bail!("empty environment variable name in dependsOn entry {raw:?}");
            }
            return Ok(Self::EnvVar {
                name: name.to_owned(),
            });
        }
        if let Some(task) = raw.strip_prefix('^') {
            if task.is_empty() {
                bail!("empty task name in topological dependsOn entry {raw:?}");
            }
            return Ok(Self::Topological {
                task: task.to_owned(),
            });
        }
        if let Some((pkg, task)) = raw.split_once('#') {
            if pkg.is_empty() || task.is_empty() {
                bail!("malformed package-qualified dependsOn entry {raw:?}");
            }
            return Ok(Self::Qualified {
                package: PackageName::new(pkg),
                task: task.to_owned(),
            });
        }
        Ok(Self::Sibling {
            task: raw.to_owned(),
        })
    }
}

/// A per-task configuration, composed from root defaults overridden by a
/// package-local definition (`spec.md` §3: overrides replace, not merge,
/// individual fields).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDefinition {
    /// `None` means "apply inferred defaults"; `Some(vec![])` means "no
    /// outputs". This distinction must survive config parsing, hence the
    /// `Option` rather than collapsing to an empty vec.
    pub outputs: Option<Vec<String>>,
    pub cache: bool,
    pub depends_on: Vec<String>,
    /// `None` means "all tracked files of the package"; `Some(vec![])`
    /// means explicitly no globs (still implicitly widened with the
    /// manifest and config files by the file hasher).
    pub inputs: Option<Vec<String>>,
    pub env: BTreeSet<String>,
    pub pass_through_env: BTreeSet<String>,
    pub output_logs: OutputLogsMode,
    pub persistent: bool,
}

impl Default for TaskDefinition {
    fn default() -> Self {
        Self {
            outputs: None,
            cache: true,
            depends_on: Vec::new(),
            inputs: None,
            env: BTreeSet::new(),
            pass_through_env: BTreeSet::new(),
            output_logs: OutputLogsMode::default(),
            persistent: false,
        }
    }
}

impl TaskDefinition {
    /// Parse all `dependsOn` entries, returning a parallel vec of
    /// [`DependencyRef`]s in declaration order (order is preserved for
    /// diagnostics; the fingerprint canonicalizes separately).
    pub fn parsed_depends_on(&self) -> Result<Vec<DependencyRef>> {
        self.depends_on.iter().map(|s| DependencyRef::parse(s)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sibling_reference() {
        assert_eq!(
            DependencyRef::parse("build").unwrap(),
            DependencyRef::Sibling {
                task: "build".to_owned()
            }
        );
    }

    #[test]
    fn parses_qualified_reference() {
        assert_eq!(
            DependencyRef::parse("util#build").unwrap(),
            DependencyRef::Qualified {
                package: PackageName::new("util"),
                task: "build".to_owned(),
            }
        );
    }

    #[test]
    fn parses_topological_reference() {
        assert_eq!(
            DependencyRef::parse("^build").unwrap(),
            DependencyRef::Topological {
                task: "build".to_owned()
            }
        );
    }

    #[test]
    fn parses_env_var_reference() {
        assert_eq!(
            DependencyRef::parse("$CI").unwrap(),
            DependencyRef::EnvVar {
                name: "CI".to_owned()
            }
        );
    }

    #[test]
    fn rejects_malformed_qualified_reference() {
        assert!(DependencyRef::parse("#build").is_err());
        assert!(DependencyRef::parse("util#").is_err());
    }

    #[test]
    fn outputs_absent_differs_from_empty() {
        let absent = TaskDefinition::default();
        assert!(absent.outputs.is_none());
        let explicit_empty = TaskDefinition {
            outputs: Some(Vec::new()),
            ..TaskDefinition::default()
        };
        assert_eq!(explicit_empty.outputs, Some(Vec::new()));
    }
}
