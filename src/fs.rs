//! Filesystem operations tailored to `monorail`.
//!
//! Inside this module, we refer to `std::fs` or `tokio::fs` by its fully
//! qualified path to make it maximally clear what we are using.

use std::{convert::identity, fmt::Debug as StdDebug, marker::PhantomData, sync::Arc};

use color_eyre::{
    Result,
    eyre::{Context, OptionExt},
};
use derive_more::{Debug, Display};
use fslock::LockFile as FsLockFile;
use futures::{Stream, TryStreamExt};
use tap::{Pipe, TapFallible};
use tokio::{sync::Mutex, task::spawn_blocking};
use tracing::{debug, error, instrument, trace};

use crate::path::{AbsDirPath, AbsFilePath, TryJoinWith, TypedPath};

/// The default level of concurrency used in `monorail` filesystem and
/// subprocess operations, absent a `--concurrency` override.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Shared lock file on the file system.
///
/// Lock the file with [`LockFile::lock`]. Unlock it with [`LockFile::unlock`],
/// or by dropping the locked instance.
#[derive(Debug, Clone, Display)]
#[display("{path}")]
pub struct LockFile<State> {
    state: PhantomData<State>,
    path: AbsFilePath,
    inner: Arc<Mutex<FsLockFile>>,
}

/// The associated type's state is unlocked. Used for the typestate pattern.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
pub struct Unlocked;

/// The associated type's state is locked. Used for the typestate pattern.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
pub struct Locked;

impl LockFile<Unlocked> {
    /// Create a new instance at the provided path.
    pub async fn open(path: impl Into<AbsFilePath> + StdDebug) -> Result<Self> {
        let path = path.into();
        let (file, path) =
            spawn_blocking(move || FsLockFile::open(path.as_std_path()).map(|file| (file, path)))
                .await
                .context("join task")?
                .context("open lock file")?;
        Ok(Self {
            state: PhantomData,
            inner: Arc::new(Mutex::new(file)),
            path,
        })
    }

    /// Lock the lockfile, blocking until it is available.
    #[instrument(skip_all, fields(%self))]
    pub async fn lock(self) -> Result<LockFile<Locked>> {
        spawn_blocking(move || {
            {
                let mut inner = self.inner.blocking_lock();
                inner.lock().context("lock file")?;
            }
            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .tap_ok(|f| trace!(path = ?f.path, "locked file"))
    }
}

impl LockFile<Locked> {
    /// Unlock the lockfile.
    #[instrument(skip_all, fields(%self))]
    pub async fn unlock(self) -> Result<LockFile<Unlocked>> {
        spawn_blocking(move || -> Result<_> {
            {
                let mut inner = self.inner.blocking_lock();
                inner.unlock().context("unlock file")?;
            }
            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .tap_ok(|f| trace!(path = ?f.path, "unlocked file"))
    }
}

/// Determine the canonical cache path for the current user, if possible.
///
/// Honors `MONORAIL_CACHE_DIR` first; otherwise falls back to the
/// platform's conventional cache directory for the `monorail` project.
#[instrument]
pub async fn user_global_cache_path() -> Result<AbsDirPath> {
    if let Ok(dir) = std::env::var("MONORAIL_CACHE_DIR") {
        return AbsDirPath::try_from(dir).context("parse MONORAIL_CACHE_DIR");
    }

    let base = spawn_blocking(|| directories::ProjectDirs::from("com", "monorail", "monorail"))
        .await
        .expect("join task")
        .ok_or_eyre("could not determine user cache directory")?
        .cache_dir()
        .to_path_buf();

    AbsDirPath::try_from(base).tap_ok(|dir| debug!(?dir, "user global cache path"))
}

/// Create the directory and all its parents, if they don't already exist.
#[instrument]
pub async fn create_dir_all(dir: &AbsDirPath) -> Result<()> {
    tokio::fs::create_dir_all(dir.as_std_path())
        .await
        .with_context(|| format!("create dir: {dir:?}"))
        .tap_ok(|_| trace!(?dir, "create directory"))
}

/// Walk files in a directory recursively.
///
/// Only emits regular files; symbolic links and directories are not
/// emitted in the stream.
#[instrument]
pub fn walk_files(root: &AbsDirPath) -> impl Stream<Item = Result<AbsFilePath>> + Unpin {
    let (tx, rx) = flume::bounded::<Result<AbsFilePath>>(0);
    let root = root.clone();

    spawn_blocking(move || {
        for entry in jwalk::WalkDir::new(root.as_std_path()).skip_hidden(false) {
            let entry = match entry.with_context(|| format!("walk files in {root:?}")) {
                Ok(entry) => entry,
                Err(err) => {
                    if tx.send(Err(err)).is_err() {
                        error!("unable to walk files: receiver dropped");
                        return;
                    }
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let path = match AbsFilePath::try_from(entry.path()) {
                Ok(path) => path,
                Err(err) => {
                    if tx.send(Err(err)).is_err() {
                        error!("unable to walk files: receiver dropped");
                        return;
                    }
                    continue;
                }
            };

            if tx.send(Ok(path)).is_err() {
                error!("unable to walk files: receiver dropped");
                return;
            }
        }
    });

    rx.into_stream().pipe(Box::pin)
}

/// Report whether the provided directory is empty of regular files.
#[instrument]
pub async fn is_dir_empty(path: &AbsDirPath) -> Result<bool> {
    walk_files(path)
        .try_any(|_| async { true })
        .await
        .map(|found| !found)
}

/// Buffer the file content from disk. Returns `None` if the file is missing.
#[instrument]
pub async fn read_buffered(path: &AbsFilePath) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path.as_std_path()).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Buffer the file content from disk. Errors if the file is missing.
#[instrument]
pub async fn must_read_buffered(path: &AbsFilePath) -> Result<Vec<u8>> {
    tokio::fs::read(path.as_std_path())
        .await
        .with_context(|| format!("read file: {path:?}"))
}

/// Buffer the file content from disk and parse it as UTF8.
#[instrument]
pub async fn read_buffered_utf8(path: &AbsFilePath) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path.as_std_path()).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file as string");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Buffer the file content from disk and parse it as UTF8. Errors if the
/// file is missing.
#[instrument]
pub async fn must_read_buffered_utf8(path: &AbsFilePath) -> Result<String> {
    tokio::fs::read_to_string(path.as_std_path())
        .await
        .with_context(|| format!("read file: {path:?}"))
}

/// Write the provided file content to disk, creating parent directories.
#[instrument(skip(content))]
pub async fn write(path: &AbsFilePath, content: impl AsRef<[u8]>) -> Result<()> {
    let content = content.as_ref();
    if let Some(parent) = path.parent() {
        create_dir_all(&parent)
            .await
            .context("create parent directory")?;
    }
    tokio::fs::write(path.as_std_path(), content)
        .await
        .with_context(|| format!("write file: {path:?}"))
        .tap_ok(|_| trace!(?path, bytes = content.len(), "write file"))
}

/// Atomically write the content to `path` by writing to a sibling temporary
/// file and renaming it into place. Used by the cache's write-once store so
/// concurrent writers never observe a partial file.
#[instrument(skip(content))]
pub async fn write_atomic(path: &AbsFilePath, content: impl AsRef<[u8]>) -> Result<()> {
    let content = content.as_ref();
    let parent = path.parent().ok_or_eyre("path has no parent")?;
    create_dir_all(&parent).await.context("create parent")?;

    let tmp_name = format!(
        ".{}.{}.tmp",
        path.file_name_str_lossy().unwrap_or_default(),
        uuid::Uuid::new_v4()
    );
    let tmp = parent.try_join_file(&tmp_name)?;
    tokio::fs::write(tmp.as_std_path(), content)
        .await
        .with_context(|| format!("write temp file: {tmp:?}"))?;
    rename(&tmp, path).await.context("rename into place")
}

/// Open a file for reading.
#[instrument]
pub async fn open_file(path: &AbsFilePath) -> Result<tokio::fs::File> {
    tokio::fs::File::open(path.as_std_path())
        .await
        .with_context(|| format!("open file: {path:?}"))
        .tap_ok(|_| trace!(?path, "open file"))
}

/// Remove a file. Succeeds (no-op) if the file is already absent.
#[instrument]
pub async fn remove_file(path: &AbsFilePath) -> Result<()> {
    match tokio::fs::remove_file(path.as_std_path()).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("remove file: {path:?}")),
    }
    .tap_ok(|_| trace!(?path, "remove file"))
}

/// Rename a file or folder, overwriting the destination if it already exists.
#[instrument]
pub async fn rename<T>(src: &TypedPath<T>, dst: &TypedPath<T>) -> Result<()> {
    tokio::fs::rename(src.as_std_path(), dst.as_std_path())
        .await
        .with_context(|| format!("rename file: {src:?} -> {dst:?}"))
        .tap_ok(|_| trace!(?src, ?dst, "rename file"))
}

/// Remove the directory and all its contents. Succeeds if already absent.
#[instrument]
pub async fn remove_dir_all(path: &AbsDirPath) -> Result<()> {
    match tokio::fs::remove_dir_all(path.as_std_path()).await {
        Ok(()) => {
            trace!(?path, "removed directory");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            trace!(?path, "removed directory (already removed)");
            Ok(())
        }
        Err(err) => Err(err).context(format!("remove directory: {path:?}")),
    }
}

/// Check whether the path exists.
///
/// Returns `false` if there is an error checking the path. This check is
/// prone to TOCTOU races; if you plan to act on the file afterward, prefer
/// to attempt the operation and handle the not-found case directly.
#[instrument]
pub async fn exists(path: impl AsRef<std::path::Path> + StdDebug) -> bool {
    tokio::fs::try_exists(path).await.is_ok_and(identity)
}

/// Return whether the path represents a directory.
#[instrument]
pub async fn is_dir(path: impl AsRef<std::path::Path> + StdDebug) -> bool {
    match tokio::fs::metadata(path.as_ref()).await {
        Ok(m) => m.is_dir(),
        Err(_) => false,
    }
}

/// Return whether the path represents a regular file.
#[instrument]
pub async fn is_file(path: impl AsRef<std::path::Path> + StdDebug) -> bool {
    match tokio::fs::metadata(path.as_ref()).await {
        Ok(m) => m.is_file(),
        Err(_) => false,
    }
}

/// Set whether the file is executable. No-op on Windows, which has no
/// executable bit.
#[instrument]
pub async fn set_executable(path: &AbsFilePath, executable: bool) -> Result<()> {
    #[cfg(not(target_os = "windows"))]
    if executable {
        use std::os::unix::fs::PermissionsExt as _;

        let metadata = tokio::fs::metadata(path.as_std_path())
            .await
            .context("get metadata")?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(permissions.mode() | 0o111);
        tokio::fs::set_permissions(path.as_std_path(), permissions.clone())
            .await
            .context("set permissions")
            .tap_ok(|_| trace!(?path, ?permissions, "set permissions"))?;
    }
    #[cfg(target_os = "windows")]
    let _ = (path, executable);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path()).unwrap();
        let file = root.try_join_file("a/b/c.txt").unwrap();

        write(&file, b"hello").await.unwrap();
        let content = must_read_buffered(&file).await.unwrap();
        assert_eq!(content, b"hello");
    }

    #[tokio::test]
    async fn write_atomic_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path()).unwrap();
        let file = root.try_join_file("entry").unwrap();

        write_atomic(&file, b"first").await.unwrap();
        write_atomic(&file, b"second").await.unwrap();
        let content = must_read_buffered(&file).await.unwrap();
        assert_eq!(content, b"second");
    }

    #[tokio::test]
    async fn walk_files_finds_nested_entries() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path()).unwrap();
        write(&root.try_join_file("a.txt").unwrap(), b"1")
            .await
            .unwrap();
        write(&root.try_join_file("sub/b.txt").unwrap(), b"2")
            .await
            .unwrap();

        let mut found: Vec<_> = walk_files(&root)
            .try_fold(Vec::new(), |mut acc, p| async move {
                acc.push(p.as_str_lossy().into_owned());
                Ok(acc)
            })
            .await
            .unwrap();
        found.sort();
        assert_eq!(found.len(), 2);
    }
}
