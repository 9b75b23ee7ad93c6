//! The two-tier, fingerprint-keyed cache (`spec.md` §4.3).
//!
//! Grounded in `hurry::cache`: a mandatory local filesystem tier
//! ([`local::LocalCache`], adapted from `hurry::cache::fs::FsCache`) and an
//! optional remote HTTP tier ([`remote::RemoteCache`]) consulted on local
//! miss. `Cache` owns both and implements the public `fetch`/`put`/
//! `shutdown` contract; callers never talk to either tier directly.

mod archive;
mod local;
mod remote;

use std::collections::BTreeMap;

use color_eyre::{Result, eyre::Context};
use tracing::{instrument, warn};

pub use local::LocalCache;
pub use remote::{RemoteCache, RemoteCacheConfig};

use crate::{
    fingerprint::Fingerprint,
    fs,
    path::{AbsDirPath, AbsFilePath, TryJoinWith as _},
};

/// What `fetch` reports on a cache hit (`spec.md` §4.3): the restored log
/// file's path and the original run's duration.
#[derive(Clone, Debug)]
pub struct CacheHit {
    pub log_path: AbsFilePath,
    pub duration_ms: u64,
}

/// The two-tier cache.
pub struct Cache {
    local: LocalCache,
    remote: Option<RemoteCache>,
}

impl Cache {
    pub async fn open(cache_dir: &AbsDirPath, remote: Option<RemoteCache>) -> Result<Self> {
        let local = LocalCache::open(cache_dir).await?;
        Ok(Self { local, remote })
    }

    /// `fetch(packageDir, fingerprint) -> Maybe<CacheHit>` (`spec.md` §4.3).
    ///
    /// Consults the local store first; on local miss, and only if a remote
    /// is configured, performs an authenticated remote fetch and restores
    /// into both the local store and `packageDir`. Missing is not an error.
    #[instrument(skip(self))]
    pub async fn fetch(
        &self,
        package_dir: &AbsDirPath,
        fingerprint: &Fingerprint,
    ) -> Result<Option<CacheHit>> {
        if let Some(unpacked) = self.local.read(fingerprint).await? {
            return self.restore(package_dir, &unpacked).await.map(Some);
        }

        let Some(remote) = &self.remote else {
            return Ok(None);
        };
        let Some(bytes) = remote.fetch(fingerprint).await? else {
            return Ok(None);
        };

        let unpacked = match archive::extract(&bytes).await {
            Ok(unpacked) => unpacked,
            Err(err) => {
                warn!(%fingerprint, error = ?err, "corrupt remote cache archive; treating as miss");
                return Ok(None);
            }
        };

        if let Err(err) = self.local.write(fingerprint, &bytes).await {
            warn!(%fingerprint, error = ?err, "failed to persist remote cache hit locally");
        }

        self.restore(package_dir, &unpacked).await.map(Some)
    }

    /// `put(packageDir, fingerprint, durationMs, filesToCache) -> ()` (`spec.md` §4.3).
    ///
    /// `output_files` are anchored paths, relative to `packageDir`, already
    /// resolved from the task's `outputs` globs by the caller. Enforces
    /// write-once semantics: if a local entry for `fingerprint` already
    /// exists, this is a no-op.
    #[instrument(skip(self, log))]
    pub async fn put(
        &self,
        package_dir: &AbsDirPath,
        fingerprint: &Fingerprint,
        task: &str,
        duration_ms: u64,
        output_files: &[String],
        log: &[u8],
    ) -> Result<()> {
        let mut files = BTreeMap::new();
        for anchored in output_files {
            let path = package_dir.try_join_file(anchored)?;
            let content = fs::must_read_buffered(&path)
                .await
                .with_context(|| format!("read declared output {anchored}"))?;
            files.insert(anchored.clone(), content);
        }

        let archive_bytes = archive::build(duration_ms, task, &files, log).await?;

        if !self
            .local
            .write(fingerprint, &archive_bytes)
            .await
            .context("write local cache entry")?
        {
            // Write-once: another producer already populated this fingerprint.
            return Ok(());
        }

        if let Some(remote) = &self.remote {
            if let Err(err) = remote.put(fingerprint, &archive_bytes).await {
                warn!(%fingerprint, error = ?err, "remote cache upload failed");
            }
        }

        Ok(())
    }

    /// Flush any pending remote uploads within a bounded deadline, best
    /// effort (`spec.md` §4.3 `shutdown`).
    pub async fn shutdown(&self) {
        if let Some(remote) = &self.remote {
            remote.shutdown().await;
        }
    }

    async fn restore(
        &self,
        package_dir: &AbsDirPath,
        unpacked: &archive::CacheArchive,
    ) -> Result<CacheHit> {
        for (anchored, content) in &unpacked.files {
            let dest = package_dir.try_join_file(anchored)?;
            fs::write(&dest, content)
                .await
                .with_context(|| format!("restore cached file {anchored}"))?;
        }

        let log_path =
            package_dir.try_join_combined([".turbo"], format!("turbo-{}.log", unpacked.task))?;
        fs::write(&log_path, &unpacked.log)
            .await
            .context("restore cached log")?;

        Ok(CacheHit {
            log_path,
            duration_ms: unpacked.duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_fetch_restores_outputs_and_log() {
        let cache_dir = tempfile::tempdir().unwrap();
        let package_dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(&AbsDirPath::try_from(cache_dir.path()).unwrap(), None)
            .await
            .unwrap();
        let package_root = AbsDirPath::try_from(package_dir.path()).unwrap();

        fs::write(&package_root.try_join_file("dist/a.txt").unwrap(), b"built")
            .await
            .unwrap();

        let fingerprint = crate::fingerprint::Canon::new().finish();
        cache
            .put(
                &package_root,
                &fingerprint,
                "build",
                250,
                &["dist/a.txt".to_owned()],
                b"log output",
            )
            .await
            .unwrap();

        // Remove the output so restoration is observable.
        fs::remove_file(&package_root.try_join_file("dist/a.txt").unwrap())
            .await
            .unwrap();

        let hit = cache
            .fetch(&package_root, &fingerprint)
            .await
            .unwrap()
            .expect("cache hit");
        assert_eq!(hit.duration_ms, 250);

        let restored = fs::must_read_buffered(&package_root.try_join_file("dist/a.txt").unwrap())
            .await
            .unwrap();
        assert_eq!(restored, b"built");

        let log = fs::must_read_buffered(&hit.log_path).await.unwrap();
        assert_eq!(log, b"log output");
    }

    #[tokio::test]
    async fn fetch_miss_is_none_not_error() {
        let cache_dir = tempfile::tempdir().unwrap();
        let package_dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(&AbsDirPath::try_from(cache_dir.path()).unwrap(), None)
            .await
            .unwrap();
        let package_root = AbsDirPath::try_from(package_dir.path()).unwrap();
        let fingerprint = crate::fingerprint::Canon::new().finish();

        assert!(cache.fetch(&package_root, &fingerprint).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_is_write_once() {
        let cache_dir = tempfile::tempdir().unwrap();
        let package_dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(&AbsDirPath::try_from(cache_dir.path()).unwrap(), None)
            .await
            .unwrap();
        let package_root = AbsDirPath::try_from(package_dir.path()).unwrap();
        let fingerprint = crate::fingerprint::Canon::new().finish();

        cache
            .put(&package_root, &fingerprint, "build", 1, &[], b"first")
            .await
            .unwrap();
        cache
            .put(&package_root, &fingerprint, "build", 999, &[], b"second")
            .await
            .unwrap();

        let hit = cache.fetch(&package_root, &fingerprint).await.unwrap().unwrap();
        assert_eq!(hit.duration_ms, 1);
    }
}
