//! `monorail cache show`: print the local cache directory and a rough size.

use color_eyre::{Result, eyre::Context as _};
use futures::TryStreamExt as _;
use monorail::fs::{self, user_global_cache_path};
use tracing::instrument;

#[instrument]
pub async fn exec() -> Result<()> {
    let cache_path = user_global_cache_path().await.context("get user global cache path")?;

    let mut entries = 0u64;
    let mut bytes = 0u64;
    let mut files = fs::walk_files(&cache_path);
    while let Some(path) = files.try_next().await.context("walk cache directory")? {
        if let Ok(meta) = tokio::fs::metadata(path.as_std_path()).await {
            entries += 1;
            bytes += meta.len();
        }
    }

    println!("{cache_path}");
    println!("{entries} files, {bytes} bytes");
    Ok(())
}
