use std::path::PathBuf;

use clap::Args;
use color_eyre::{Result, eyre::Context};
use console::style;
use humansize::{DECIMAL, format_size};

use forge::cache;

#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Workspace root (defaults to the current directory)
    #[arg(long)]
    workspace: Option<PathBuf>,
}

pub async fn exec(opts: Options) -> Result<()> {
    let workspace = match opts.workspace {
        Some(workspace) => workspace,
        None => std::env::current_dir().context("get working directory")?,
    };
    let engine_cache = workspace.join("out").join("engine-cache");

    if !forge::fs::exists(&engine_cache).await {
        println!("no engine cache at {engine_cache:?}");
        return Ok(());
    }

    println!("{} {engine_cache:?}", style("engine cache:").bold());
    let mut entries = tokio::fs::read_dir(&engine_cache)
        .await
        .with_context(|| format!("enumerate {engine_cache:?}"))?;
    let mut total = 0u64;
    while let Some(entry) = entries.next_entry().await.context("enumerate engine cache")? {
        let metadata = entry.metadata().await.context("stat entry")?;
        if metadata.is_file() {
            total += metadata.len();
            println!(
                "  {:<32} {:>10}",
                entry.file_name().to_string_lossy(),
                format_size(metadata.len(), DECIMAL),
            );
        }
    }
    println!("{} {}", style("total:").bold(), format_size(total, DECIMAL));

    let previous = engine_cache.join(cache::PREVIOUS_INPUTS_FILE);
    if forge::fs::exists(&previous).await {
        println!("{}", style("previous inputs present; reuse possible").green());
    } else {
        println!("{}", style("no previous inputs; next build is a miss").yellow());
    }
    Ok(())
}
