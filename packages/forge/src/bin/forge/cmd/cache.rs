//! `forge cache`: manage the engine cache.

use clap::Subcommand;

pub mod reset;
pub mod show;

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Show what the engine cache currently holds
    Show(show::Options),

    /// Delete the engine cache (the next build starts from scratch)
    Reset(reset::Options),
}
