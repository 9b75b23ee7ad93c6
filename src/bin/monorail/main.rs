//! The binary entrypoint for `monorail`, an incremental task runner for
//! multi-package repositories.

use clap::{Parser, crate_version};
use color_eyre::Result;
use tracing::instrument;

// Since this is a binary crate, these modules stay private so the compiler
// can correctly warn about dead code:
// https://github.com/rust-lang/rust/issues/74970
mod catalog;
mod cmd;
mod log;

#[derive(Clone, Debug, Parser)]
#[command(name = "monorail", about = "Incremental task runner for multi-package repositories", version = crate_version!())]
struct TopLevelFlags {
    #[command(subcommand)]
    command: cmd::Command,
}

#[instrument]
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    log::init();

    let top = TopLevelFlags::parse();
    let code = cmd::dispatch(top.command).await?;
    std::process::exit(code);
}
