use std::path::PathBuf;

use clap::Args;
use color_eyre::{Result, eyre::Context};
use console::style;
use tracing::info;

#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Workspace root (defaults to the current directory)
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Also delete the local content store
    #[arg(long)]
    store: bool,
}

pub async fn exec(opts: Options) -> Result<()> {
    let workspace = match opts.workspace {
        Some(workspace) => workspace,
        None => std::env::current_dir().context("get working directory")?,
    };

    let engine_cache = workspace.join("out").join("engine-cache");
    if forge::fs::exists(&engine_cache).await {
        tokio::fs::remove_dir_all(&engine_cache)
            .await
            .with_context(|| format!("remove {engine_cache:?}"))?;
        info!(?engine_cache, "engine cache removed");
    }

    if opts.store {
        let store = workspace.join("out").join("store");
        if forge::fs::exists(&store).await {
            tokio::fs::remove_dir_all(&store)
                .await
                .with_context(|| format!("remove {store:?}"))?;
            info!(?store, "local content store removed");
        }
    }

    println!("{}", style("cache reset").green().bold());
    Ok(())
}
