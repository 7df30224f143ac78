//! The binary entrypoint for `forge`, the content-addressed build engine.

use clap::{Parser, Subcommand, crate_version};
use color_eyre::Result;
use git_version::git_version;
use tracing_subscriber::util::SubscriberInitExt;

// Since this is a binary crate, we need to ensure these modules aren't pub
// so that they can correctly warn about dead code:
// https://github.com/rust-lang/rust/issues/74970
//
// Relatedly, in this file specifically nothing should be `pub`.
mod cmd;
mod log;

#[derive(Clone, Debug, Parser)]
#[command(
    name = "forge",
    about = "Incremental, content-addressed builds",
    version = format!("v{} commit {}", crate_version!(), git_version!(args = ["--always"], fallback = "unknown")),
)]
struct TopLevelFlags {
    #[command(subcommand)]
    command: Command,

    /// When to colorize output
    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto)]
    color: log::WhenColor,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Run a build in the current workspace
    Build(cmd::build::Options),

    /// Attach to an orchestrator and execute dispatched pips
    Worker(cmd::worker::Options),

    /// Manage the engine cache
    #[clap(subcommand)]
    Cache(cmd::cache::Command),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let top = TopLevelFlags::parse();

    let logger = log::make_logger(std::io::stderr, top.color)?;
    logger.init();

    match top.command {
        Command::Build(opts) => cmd::build::exec(opts).await,
        Command::Worker(opts) => cmd::worker::exec(opts).await,
        Command::Cache(cmd) => match cmd {
            cmd::cache::Command::Show(opts) => cmd::cache::show::exec(opts).await,
            cmd::cache::Command::Reset(opts) => cmd::cache::reset::exec(opts).await,
        },
    }
}
