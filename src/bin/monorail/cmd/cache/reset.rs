//! `monorail cache reset`: delete the local cache directory.

use clap::Args;
use color_eyre::{Result, eyre::Context as _};
use colored::Colorize as _;
use monorail::fs::{self, user_global_cache_path};
use tracing::instrument;

#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Skip the confirmation prompt.
    #[arg(short, long)]
    yes: bool,
}

#[instrument]
pub async fn exec(options: Options) -> Result<()> {
    let cache_path = user_global_cache_path().await.context("get user global cache path")?;

    if !options.yes {
        println!("{}", format!("This will delete the local cache at {cache_path}").on_red());
        println!("Re-run with --yes to confirm.");
        return Ok(());
    }

    println!("Resetting local cache...");
    fs::remove_dir_all(&cache_path).await.context("remove local cache directory")?;
    fs::create_dir_all(&cache_path).await.context("recreate local cache directory")?;

    println!("Done!");
    Ok(())
}
