//! `forge build`: run one build in a workspace.

use std::path::PathBuf;

use clap::Args;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use console::style;
use ferry::v1::Digest;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use forge::{
    cache::{FsStore, RemoteStore},
    config::{EngineConfig, StopAfter},
    distrib::{DistributionRole, Orchestrator, OrchestratorConfig},
    driver::{BuildOutcome, EngineDriver},
    fs,
    manifest::ManifestFrontend,
};

#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Workspace root (defaults to the current directory)
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Build manifest (defaults to `forge.toml` in the workspace)
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Engine configuration file; when absent, defaults are derived from
    /// the workspace
    #[arg(long)]
    config: Option<PathBuf>,

    /// Shared content store URL (defaults to a store directory in the
    /// workspace output)
    #[arg(long)]
    store_url: Option<Url>,

    /// Authentication token for the shared store
    #[arg(long, env = "FORGE_TOKEN")]
    token: Option<String>,

    /// Construct and serialize the graph, run nothing
    #[arg(long)]
    clean_only: bool,

    /// Stop once the graph is constructed or reused
    #[arg(long, conflicts_with = "clean_only")]
    evaluate_only: bool,

    /// Load exactly this graph (hex exact fingerprint)
    #[arg(long)]
    graph: Option<String>,

    /// Run as the orchestrator of a distributed build, listening here
    #[arg(long)]
    listen: Option<std::net::SocketAddr>,

    /// Workers required before dispatching (orchestrator mode)
    #[arg(long, default_value_t = 1)]
    required_workers: usize,
}

pub async fn exec(opts: Options) -> Result<()> {
    let workspace = match opts.workspace {
        Some(workspace) => workspace,
        None => std::env::current_dir().context("get working directory")?,
    };
    let manifest = opts
        .manifest
        .unwrap_or_else(|| workspace.join("forge.toml"));

    let mut config = match &opts.config {
        Some(path) => EngineConfig::from_file(path).await?,
        None => EngineConfig::for_workspace(&workspace),
    };
    config.config_files = vec![manifest.clone()];
    config.explicit_graph = opts.graph;
    config.stop_after = if opts.clean_only {
        StopAfter::Schedule
    } else if opts.evaluate_only {
        StopAfter::Evaluate
    } else {
        StopAfter::Execute
    };
    if opts.listen.is_some() {
        config.role = DistributionRole::Orchestrator;
    }

    let frontend = ManifestFrontend::new(&manifest);
    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    let outcome = match &opts.store_url {
        Some(url) => {
            let token = opts
                .token
                .clone()
                .ok_or_else(|| eyre!("--token is required with --store-url"))?;
            let client = ferry::Ferry::new(url.clone(), token.into())?;
            let store = RemoteStore::new(client);
            run_driver(config, store, frontend, opts.listen, opts.required_workers, cancel).await?
        }
        None => {
            let store = FsStore::new(workspace.join("out").join("store"));
            run_driver(config, store, frontend, opts.listen, opts.required_workers, cancel).await?
        }
    };

    report(&outcome);
    if outcome.success {
        Ok(())
    } else {
        std::process::exit(outcome.exit_code());
    }
}

async fn run_driver<S: forge::cache::StoreBackend>(
    config: EngineConfig,
    store: S,
    frontend: ManifestFrontend,
    listen: Option<std::net::SocketAddr>,
    required_workers: usize,
    cancel: CancellationToken,
) -> Result<BuildOutcome> {
    let mut driver =
        EngineDriver::local(config.clone(), store, frontend).with_cancellation(cancel.clone());

    // The coordinator must exist before fingerprints are computed so that
    // workers can attach while the reuse decision runs.
    let mut server = None;
    if let Some(addr) = listen {
        let manifest_content = fs::must_read_buffered(&config.config_files[0]).await?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        let local = listener.local_addr().context("local address")?;
        let orchestrator = Orchestrator::new(OrchestratorConfig {
            url: Url::parse(&format!("http://{local}/")).context("orchestrator url")?,
            config_digest: Digest::from_buffer(&manifest_content),
            required_workers,
            low_workers_warning_threshold: required_workers,
            ..Default::default()
        });
        info!(%local, "orchestrator listening");

        let router = orchestrator.router();
        let shutdown = cancel.clone();
        server = Some(tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        }));
        driver = driver.with_orchestrator(orchestrator);
    }

    let outcome = driver.run().await;

    // The server task is ours; join it before returning.
    cancel.cancel();
    if let Some(server) = server {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(?err, "orchestrator server error"),
            Err(err) => warn!(?err, "orchestrator server task panicked"),
        }
    }
    outcome
}

fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling build");
            cancel.cancel();
        }
    });
}

fn report(outcome: &BuildOutcome) {
    if let Some(decision) = &outcome.decision {
        eprintln!("{} {decision}", style("graph:").bold());
    }
    if let Some(execution) = &outcome.execution {
        eprintln!(
            "{} {} executed, {} up to date",
            style("pips:").bold(),
            execution.executed,
            execution.up_to_date,
        );
    }
    if outcome.success {
        eprintln!("{}", style("build succeeded").green().bold());
    } else if outcome.cancelled {
        eprintln!("{}", style("build cancelled").yellow().bold());
    } else {
        // One aggregated summary; each failure carries its stable event id.
        for failure in &outcome.failures {
            eprintln!("{} {failure}", style("error:").red().bold());
        }
        eprintln!("{}", style("build failed").red().bold());
    }
}
