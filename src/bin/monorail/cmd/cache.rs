use clap::Subcommand;

pub mod reset;
pub mod show;

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Reset the local cache.
    Reset(reset::Options),

    /// Print the location of the local cache directory.
    Show,
}

pub async fn exec(command: Command) -> color_eyre::Result<()> {
    match command {
        Command::Reset(options) => reset::exec(options).await,
        Command::Show => show::exec().await,
    }
}
