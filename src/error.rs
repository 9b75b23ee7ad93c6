//! The top-level error taxonomy (`spec.md` §7): one category per
//! diagnostic the operator can see, each carrying the offending
//! package/task identity plus the underlying `color_eyre::Report` so
//! `main` can print a single human-readable line while still letting
//! verbose/log mode render the full span trace.

use std::fmt;

use color_eyre::Report;

use crate::{graph::TaskKey, package::PackageName};

/// The category a [`MonorailError`] belongs to (`spec.md` §7).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ErrorCategory {
    Configuration,
    Environment,
    Hashing,
    Cache,
    Remote,
    Execution,
    Cancellation,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Configuration => "configuration error",
            Self::Environment => "environment error",
            Self::Hashing => "hashing error",
            Self::Cache => "cache error",
            Self::Remote => "remote cache error",
            Self::Execution => "execution error",
            Self::Cancellation => "cancellation",
        };
        f.write_str(label)
    }
}

/// A single diagnostic, tagged with the component that raised it and, when
/// known, the package/task it concerns.
#[derive(Debug)]
pub struct MonorailError {
    pub category: ErrorCategory,
    pub package: Option<PackageName>,
    pub task: Option<String>,
    pub source: Report,
}

impl MonorailError {
    pub fn new(category: ErrorCategory, source: Report) -> Self {
        Self {
            category,
            package: None,
            task: None,
            source,
        }
    }

    pub fn with_task(mut self, key: &TaskKey) -> Self {
        self.package = Some(key.package.clone());
        self.task = Some(key.task.clone());
        self
    }

    pub fn configuration(source: Report) -> Self {
        Self::new(ErrorCategory::Configuration, source)
    }

    pub fn environment(source: Report) -> Self {
        Self::new(ErrorCategory::Environment, source)
    }

    pub fn hashing(source: Report) -> Self {
        Self::new(ErrorCategory::Hashing, source)
    }

    pub fn cache(source: Report) -> Self {
        Self::new(ErrorCategory::Cache, source)
    }

    pub fn remote(source: Report) -> Self {
        Self::new(ErrorCategory::Remote, source)
    }

    pub fn execution(source: Report) -> Self {
        Self::new(ErrorCategory::Execution, source)
    }

    pub fn cancellation(source: Report) -> Self {
        Self::new(ErrorCategory::Cancellation, source)
    }
}

/// The single human-readable diagnostic line (`spec.md` §7: "every error
/// writes a single human-readable diagnostic with the offending
/// package/task identity").
impl fmt::Display for MonorailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.category)?;
        match (&self.package, &self.task) {
            (Some(package), Some(task)) => write!(f, " in {package}#{task}")?,
            (Some(package), None) => write!(f, " in {package}")?,
            _ => {}
        }
        write!(f, ": {:#}", self.source)
    }
}

impl std::error::Error for MonorailError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_package_and_task() {
        let err = MonorailError::execution(color_eyre::eyre::eyre!("exit code 1"))
            .with_task(&TaskKey::new(PackageName::new("app"), "build"));
        let rendered = err.to_string();
        assert!(rendered.contains("execution error"));
        assert!(rendered.contains("app#build"));
        assert!(rendered.contains("exit code 1"));
    }

    #[test]
    fn display_without_task_omits_identity() {
        let err = MonorailError::configuration(color_eyre::eyre::eyre!("cycle"));
        assert_eq!(err.to_string(), "configuration error: cycle");
    }
}
