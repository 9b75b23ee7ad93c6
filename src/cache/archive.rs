//! Deterministic cache-archive format (`spec.md` §4.3, §6).
//!
//! A cache archive is a tar stream, compressed with zstd, holding one
//! entry per declared output file (anchored to the package root), one
//! `.turbo/turbo-<task>.log` entry for the captured log, and one
//! `.turbo/cache-meta.json` entry carrying the metadata record (original
//! duration) so it survives the round trip through the remote protocol,
//! which transports a single opaque byte blob (`spec.md` §6). Entries are
//! appended in sorted anchored-path order with a fixed mode/mtime/uid/gid,
//! so two archives built from identical content are byte-identical.

use std::collections::BTreeMap;

use async_compression::{
    Level,
    tokio::{bufread::ZstdDecoder, write::ZstdEncoder},
};
use async_tar::{Archive, Builder, Header};
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use futures::{
    AsyncReadExt as _, AsyncWriteExt as _, StreamExt as _, io::Cursor as FuturesCursor,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, BufReader};

const META_ENTRY_PATH: &str = ".turbo/cache-meta.json";

fn log_entry_path(task: &str) -> String {
    format!(".turbo/turbo-{task}.log")
}

#[derive(Serialize, Deserialize)]
struct Meta {
    duration_ms: u64,
    task: String,
}

/// An unpacked cache archive: declared output files plus the metadata and
/// captured log that travel alongside them.
pub struct CacheArchive {
    pub files: BTreeMap<String, Vec<u8>>,
    pub duration_ms: u64,
    pub task: String,
    pub log: Vec<u8>,
}

/// Build a deterministic, zstd-compressed tar archive from a task's
/// declared output files plus its duration and captured log.
pub async fn build(
    duration_ms: u64,
    task: &str,
    files: &BTreeMap<String, Vec<u8>>,
    log: &[u8],
) -> Result<Vec<u8>> {
    let meta = Meta {
        duration_ms,
        task: task.to_owned(),
    };
    let meta_bytes = serde_json::to_vec(&meta).context("serialize cache archive metadata")?;

    let mut entries: BTreeMap<String, Vec<u8>> = files.clone();
    entries.insert(META_ENTRY_PATH.to_owned(), meta_bytes);
    entries.insert(log_entry_path(task), log.to_vec());

    let tar_bytes = build_tar(&entries).await?;
    compress(&tar_bytes).await
}

/// Decompress, unpack, and split an archive back into files, metadata, and
/// the captured log.
pub async fn extract(bytes: &[u8]) -> Result<CacheArchive> {
    let tar_bytes = decompress(bytes).await?;
    let mut entries = extract_tar(&tar_bytes).await?;

    let meta_bytes = entries
        .remove(META_ENTRY_PATH)
        .ok_or_else(|| color_eyre::eyre::eyre!("cache archive missing {META_ENTRY_PATH}"))?;
    let meta: Meta = serde_json::from_slice(&meta_bytes).context("parse cache archive metadata")?;

    let log_path = log_entry_path(&meta.task);
    let log = entries.remove(&log_path).ok_or_else(|| {
        color_eyre::eyre::eyre!("cache archive missing log entry {log_path}")
    })?;

    Ok(CacheArchive {
        files: entries,
        duration_ms: meta.duration_ms,
        task: meta.task,
        log,
    })
}

async fn build_tar(entries: &BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>> {
    let writer = FuturesCursor::new(Vec::new());
    let mut builder = Builder::new(writer);
    for (path, content) in entries {
        let mut header = Header::new_gnu();
        header
            .set_path(path)
            .with_context(|| format!("set tar entry path: {path}"))?;
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();
        builder
            .append(&header, FuturesCursor::new(content.clone()))
            .await
            .with_context(|| format!("append tar entry: {path}"))?;
    }
    let writer = builder.into_inner().await.context("finalize tar archive")?;
    Ok(writer.into_inner())
}

async fn extract_tar(tar_bytes: &[u8]) -> Result<BTreeMap<String, Vec<u8>>> {
    let archive = Archive::new(FuturesCursor::new(tar_bytes.to_vec()));
    let mut entries = archive.entries().context("read tar entries")?;
    let mut out = BTreeMap::new();
    while let Some(entry) = entries.next().await {
        let mut entry = entry.context("read tar entry")?;
        let path = entry
            .path()
            .context("read tar entry path")?
            .to_string_lossy()
            .into_owned();
        let mut content = Vec::new();
        entry
            .read_to_end(&mut content)
            .await
            .with_context(|| format!("read tar entry content: {path}"))?;
        out.insert(path, content);
    }
    if out.is_empty() {
        bail!("tar archive contained no entries");
    }
    Ok(out)
}

async fn compress(tar_bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZstdEncoder::with_quality(Vec::new(), Level::Default);
    encoder
        .write_all(tar_bytes)
        .await
        .context("write tar bytes to zstd encoder")?;
    encoder.shutdown().await.context("finalize zstd stream")?;
    Ok(encoder.into_inner())
}

async fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZstdDecoder::new(BufReader::new(bytes));
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .await
        .context("decompress zstd archive")?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_files_metadata_and_log() {
        let mut files = BTreeMap::new();
        files.insert("dist/a.txt".to_owned(), b"hello".to_vec());

        let archive = build(1234, "build", &files, b"log output").await.unwrap();
        let unpacked = extract(&archive).await.unwrap();

        assert_eq!(unpacked.files, files);
        assert_eq!(unpacked.duration_ms, 1234);
        assert_eq!(unpacked.task, "build");
        assert_eq!(unpacked.log, b"log output");
    }

    #[tokio::test]
    async fn identical_content_produces_identical_bytes() {
        let mut files = BTreeMap::new();
        files.insert("dist/a.txt".to_owned(), b"hello".to_vec());

        let first = build(1, "build", &files, b"log").await.unwrap();
        let second = build(1, "build", &files, b"log").await.unwrap();
        assert_eq!(first, second);
    }
}
