//! `forge worker`: attach to an orchestrator and execute dispatched pips.

use std::path::PathBuf;

use clap::Args;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use ferry::v1::Digest;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use forge::{
    cache::{FsStore, RemoteStore},
    distrib::{WorkerConfig, WorkerState},
    driver::run_worker,
    exec::LocalExecutor,
    fs,
};

#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Orchestrator base URL
    #[arg(long)]
    orchestrator: Url,

    /// Worker workspace root (defaults to the current directory)
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Build manifest, hashed to prove configuration agreement with the
    /// orchestrator (defaults to `forge.toml` in the workspace)
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Shared content store URL; when absent, a store directory shared
    /// with the orchestrator via the filesystem
    #[arg(long)]
    store_url: Option<Url>,

    /// Authentication token for the orchestrator and store
    #[arg(long, env = "FORGE_TOKEN")]
    token: Option<String>,

    /// Pips to run concurrently
    #[arg(long, default_value_t = 1)]
    capacity: u32,
}

pub async fn exec(opts: Options) -> Result<()> {
    let workspace = match opts.workspace {
        Some(workspace) => workspace,
        None => std::env::current_dir().context("get working directory")?,
    };
    let manifest = opts
        .manifest
        .unwrap_or_else(|| workspace.join("forge.toml"));
    let manifest_content = fs::must_read_buffered(&manifest).await?;

    let config = WorkerConfig {
        orchestrator_url: opts.orchestrator,
        token: opts.token.clone().unwrap_or_else(|| "anonymous".to_string()).into(),
        config_digest: Digest::from_buffer(&manifest_content),
        capacity: opts.capacity,
        ..Default::default()
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; draining worker");
                cancel.cancel();
            }
        });
    }

    let engine_cache = workspace.join("out").join("engine-cache");
    let executor = LocalExecutor::new(&workspace);

    let state = match &opts.store_url {
        Some(url) => {
            let token = opts
                .token
                .ok_or_else(|| eyre!("--token is required with --store-url"))?;
            let client = ferry::Ferry::new(url.clone(), token.into())?;
            run_worker(
                config,
                engine_cache,
                RemoteStore::new(client),
                executor,
                &workspace,
                cancel,
            )
            .await?
        }
        None => {
            let store = FsStore::new(workspace.join("out").join("store"));
            run_worker(config, engine_cache, store, executor, &workspace, cancel).await?
        }
    };

    info!(state = %state, "worker finished");
    match state {
        WorkerState::Exited => Ok(()),
        other => Err(eyre!("worker ended in state {other}")),
    }
}
