use clap::Subcommand;

pub mod cache;
pub mod run;

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Run one or more tasks across the repository's packages.
    Run(run::RunArgs),

    /// Manage the local cache.
    #[clap(subcommand)]
    Cache(cache::Command),
}

/// Dispatch a parsed subcommand, returning the process exit code.
pub async fn dispatch(command: Command) -> color_eyre::Result<i32> {
    match command {
        Command::Run(args) => run::exec(args).await,
        Command::Cache(cmd) => {
            cache::exec(cmd).await?;
            Ok(0)
        }
    }
}
