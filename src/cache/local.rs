//! Local filesystem tier of the cache (`spec.md` §4.3).
//!
//! Adapted from `hurry`'s `cache::fs::FsCache`: the cache directory is
//! guarded by a [`LockFile<Locked>`](fs::LockFile) for the lifetime of the
//! [`LocalCache`], so only one `monorail` process writes into it at a
//! time. Each fingerprint owns exactly one archive file. An existing
//! entry is assumed bitwise-identical to any content that would be
//! written again and is never overwritten (write-once).

use color_eyre::{Result, eyre::Context};
use tracing::{instrument, warn};

use crate::{
    fingerprint::Fingerprint,
    fs::{self, Locked, LockFile},
    path::{AbsDirPath, AbsFilePath, TryJoinWith as _},
};

use super::archive::{self, CacheArchive};

/// The local, filesystem-backed cache tier.
pub struct LocalCache {
    root: AbsDirPath,
    _lock: LockFile<Locked>,
}

impl LocalCache {
    #[instrument]
    pub async fn open(root: &AbsDirPath) -> Result<Self> {
        fs::create_dir_all(root)
            .await
            .context("create local cache directory")?;
        let lock_path = root.try_join_file(".monorail-cache.lock")?;
        let lock = LockFile::open(lock_path)
            .await
            .context("open local cache lock")?
            .lock()
            .await
            .context("lock local cache directory")?;
        Ok(Self {
            root: root.clone(),
            _lock: lock,
        })
    }

    fn archive_path(&self, fingerprint: &Fingerprint) -> Result<AbsFilePath> {
        self.root
            .try_join_file(format!("{}.tar.zst", fingerprint.as_str()))
    }

    pub async fn has(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(fs::exists(self.archive_path(fingerprint)?.as_std_path()).await)
    }

    /// Read and unpack the archive stored under `fingerprint`, if present.
    ///
    /// A corrupt archive (fails to decompress or unpack) is treated as a
    /// miss and evicted (`spec.md` §4.3 failure modes: "corrupt local
    /// archive -> treat as miss and delete").
    #[instrument(skip(self))]
    pub async fn read(&self, fingerprint: &Fingerprint) -> Result<Option<CacheArchive>> {
        let Some(bytes) = fs::read_buffered(&self.archive_path(fingerprint)?).await? else {
            return Ok(None);
        };

        match archive::extract(&bytes).await {
            Ok(unpacked) => Ok(Some(unpacked)),
            Err(err) => {
                warn!(%fingerprint, error = ?err, "corrupt cache archive; treating as miss");
                self.evict(fingerprint).await?;
                Ok(None)
            }
        }
    }

    /// Store raw archive bytes under `fingerprint`. Returns `false`
    /// (no-op) if an entry already exists, per the write-once contract.
    #[instrument(skip(self, archive_bytes))]
    pub async fn write(&self, fingerprint: &Fingerprint, archive_bytes: &[u8]) -> Result<bool> {
        if self.has(fingerprint).await? {
            return Ok(false);
        }
        fs::write_atomic(&self.archive_path(fingerprint)?, archive_bytes)
            .await
            .context("write cache archive")?;
        Ok(true)
    }

    async fn evict(&self, fingerprint: &Fingerprint) -> Result<()> {
        fs::remove_file(&self.archive_path(fingerprint)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path()).unwrap();
        let cache = LocalCache::open(&root).await.unwrap();

        let mut files = BTreeMap::new();
        files.insert("dist/a.txt".to_owned(), b"hi".to_vec());
        let built = archive::build(42, "build", &files, b"log output").await.unwrap();
        let fingerprint = crate::fingerprint::Canon::new().finish();

        assert!(cache.write(&fingerprint, &built).await.unwrap());
        let unpacked = cache.read(&fingerprint).await.unwrap().unwrap();
        assert_eq!(unpacked.files, files);
        assert_eq!(unpacked.duration_ms, 42);
        assert_eq!(unpacked.log, b"log output");
    }

    #[tokio::test]
    async fn write_once_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path()).unwrap();
        let cache = LocalCache::open(&root).await.unwrap();
        let fingerprint = crate::fingerprint::Canon::new().finish();

        let first = archive::build(1, "build", &BTreeMap::new(), b"").await.unwrap();
        assert!(cache.write(&fingerprint, &first).await.unwrap());

        let second = archive::build(999, "build", &BTreeMap::new(), b"").await.unwrap();
        assert!(!cache.write(&fingerprint, &second).await.unwrap());

        let unpacked = cache.read(&fingerprint).await.unwrap().unwrap();
        assert_eq!(unpacked.duration_ms, 1);
    }

    #[tokio::test]
    async fn missing_entry_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path()).unwrap();
        let cache = LocalCache::open(&root).await.unwrap();
        let fingerprint = crate::fingerprint::Canon::new().finish();
        assert!(cache.read(&fingerprint).await.unwrap().is_none());
    }
}
