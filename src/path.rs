//! Absolute, kind-tagged filesystem paths.
//!
//! Every path this crate hands around — a package root, a cache archive,
//! a per-task log file — is resolved to an absolute path before it's
//! stored anywhere, and callers always know at the type level whether
//! they're holding a directory or a file. [`TypedPath<Kind>`] encodes that
//! second fact so a directory can't be handed to something expecting a
//! file (or the reverse) without an explicit, fallible conversion.
//!
//! ## What this is not
//!
//! This is not a general-purpose path crate: there is no relative-path
//! variant, because nothing in this crate ever holds on to one — a path
//! read from argv or a config file is resolved against the repo root (or
//! the process cwd) immediately, at the boundary, and only the absolute
//! result is threaded through afterward.
//!
//! ## Path Normalization
//!
//! Paths are stored exactly as provided by the caller; in particular,
//! `some/path` and `some/path/` are not equal, and neither are
//! `some/path/../other` and `some/other`. Normalize before constructing a
//! `TypedPath` if that matters to the caller.

use std::{
    any::type_name,
    borrow::Cow,
    ffi::OsStr,
    marker::PhantomData,
    path::{Path, PathBuf},
    str::FromStr,
};

use color_eyre::{
    Report, Result,
    eyre::{Context, bail},
};
use derive_more::Display;
use tap::Pipe;

pub type AbsDirPath = TypedPath<Dir>;
pub type AbsFilePath = TypedPath<File>;

/// Tags a [`TypedPath`] as naming a directory.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Dir;

/// Tags a [`TypedPath`] as naming a file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct File;

/// An absolute path, tagged with whether it names a directory or a file.
///
/// The tag is about intent, not a disk check: constructing an
/// `AbsFilePath` for an output file a task hasn't produced yet is normal
/// and expected. If a caller needs to know whether something actually
/// exists, that's a question for the `fs` module, not this type.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Display)]
#[display("{}", self.inner.display())]
pub struct TypedPath<Kind> {
    kind: PhantomData<Kind>,
    inner: PathBuf,
}

impl<K> TypedPath<K> {
    /// View the path as a standard path.
    pub fn as_std_path(&self) -> &Path {
        &self.inner
    }

    /// View the path as a lossily-converted string.
    ///
    /// Any non-UTF-8 sequences are replaced with `U+FFFD REPLACEMENT
    /// CHARACTER`, so be careful using this to construct *new* paths.
    pub fn as_str_lossy(&self) -> Cow<'_, str> {
        self.inner.to_string_lossy()
    }

    /// View the path as an OS string.
    pub fn as_os_str(&self) -> &OsStr {
        self.inner.as_os_str()
    }

    /// The parent directory of this path, if it has one. Unlike the
    /// standard library, this returns `None` rather than `Some("")` for a
    /// single-component path — moot here since every `TypedPath` is
    /// absolute, but `fs::write_atomic` relies on it to find a directory
    /// to create a temp file in.
    pub fn parent(&self) -> Option<AbsDirPath> {
        self.inner
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| TypedPath::new_unchecked(p.to_owned()))
    }

    /// The final component of the path, lossily converted to a string, if
    /// there is one.
    pub fn file_name_str_lossy(&self) -> Option<Cow<'_, str>> {
        self.inner.file_name().map(|s| s.to_string_lossy())
    }

    fn new_unchecked(inner: PathBuf) -> Self {
        Self {
            kind: PhantomData,
            inner,
        }
    }
}

impl TypedPath<Dir> {
    /// The current working directory of the process.
    pub fn current() -> Result<AbsDirPath> {
        let cwd = std::env::current_dir().context("get current dir")?;
        Self::try_from(cwd)
    }
}

impl<K> TryFrom<PathBuf> for TypedPath<K> {
    type Error = Report;

    fn try_from(value: PathBuf) -> std::result::Result<Self, Self::Error> {
        if !value.is_absolute() {
            bail!("path is not absolute: {value:?}");
        }
        Ok(Self::new_unchecked(value))
    }
}

impl<K> TryFrom<&Path> for TypedPath<K> {
    type Error = Report;

    fn try_from(value: &Path) -> std::result::Result<Self, Self::Error> {
        Self::try_from(value.to_owned())
    }
}

impl<K> TryFrom<String> for TypedPath<K> {
    type Error = Report;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::try_from(PathBuf::from(value))
    }
}

impl<K> TryFrom<&str> for TypedPath<K> {
    type Error = Report;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        Self::try_from(PathBuf::from(value))
    }
}

impl<K> FromStr for TypedPath<K> {
    type Err = Report;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::try_from(s)
    }
}

impl<K> std::fmt::Debug for TypedPath<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TypedPath::<{}>({:?})", type_name::<K>(), self.inner)
    }
}

/// Joins path segments onto an [`AbsDirPath`], producing a new typed path.
///
/// Segments are plain strings rather than further `TypedPath`s, since
/// callers always have the next segment as a borrowed config value or a
/// literal, not another absolute path. The join is validated once, on the
/// combined result, rather than once per segment.
pub trait TryJoinWith {
    /// Join `file` onto `self`, producing an [`AbsFilePath`].
    fn try_join_file(&self, file: impl AsRef<str>) -> Result<AbsFilePath>;

    /// Join a sequence of directory segments followed by a file segment
    /// onto `self` in one call, producing an [`AbsFilePath`].
    fn try_join_combined(
        &self,
        dirs: impl IntoIterator<Item = impl AsRef<str>>,
        file: impl AsRef<str>,
    ) -> Result<AbsFilePath>;
}

impl TryJoinWith for AbsDirPath {
    fn try_join_file(&self, file: impl AsRef<str>) -> Result<AbsFilePath> {
        self.inner.join(file.as_ref()).pipe(AbsFilePath::try_from)
    }

    fn try_join_combined(
        &self,
        dirs: impl IntoIterator<Item = impl AsRef<str>>,
        file: impl AsRef<str>,
    ) -> Result<AbsFilePath> {
        let mut inner = self.inner.clone();
        for dir in dirs {
            inner = inner.join(dir.as_ref());
        }
        inner.join(file.as_ref()).pipe(AbsFilePath::try_from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_input() {
        assert!(AbsDirPath::try_from("relative/dir").is_err());
        assert!(AbsFilePath::try_from("relative/file").is_err());
    }

    #[test]
    fn accepts_absolute_input_from_various_sources() {
        assert!(AbsDirPath::try_from("/repo").is_ok());
        assert!(AbsDirPath::try_from("/repo".to_owned()).is_ok());
        assert!(AbsDirPath::try_from(Path::new("/repo")).is_ok());
        assert!(AbsDirPath::try_from(PathBuf::from("/repo")).is_ok());
    }

    #[test]
    fn parent_of_single_component_is_none() {
        let root = AbsDirPath::try_from("/repo").unwrap();
        assert!(root.parent().is_none());
    }

    #[test]
    fn try_join_file_produces_abs_file_path() {
        let root = AbsDirPath::try_from("/repo").unwrap();
        let file = root.try_join_file("package.json").unwrap();
        assert_eq!(file.as_str_lossy(), "/repo/package.json");
    }

    #[test]
    fn try_join_combined_joins_dirs_then_file() {
        let root = AbsDirPath::try_from("/repo").unwrap();
        let file = root.try_join_combined([".turbo"], "turbo-build.log").unwrap();
        assert_eq!(file.as_str_lossy(), "/repo/.turbo/turbo-build.log");
    }
}
