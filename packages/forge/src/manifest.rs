//! The built-in manifest frontend.
//!
//! A manifest is a TOML file declaring pips directly; the frontend turns it
//! into a pip graph through the engine's capability context, so every file
//! and environment read is tracked like any other frontend's would be. This
//! is the frontend the `forge` binary ships with; richer specification
//! languages plug in through the same [`Frontend`] trait.
//!
//! ```toml
//! [[pip]]
//! name = "copy-input"
//! kind = "copy"
//! source = "in.txt"
//! destination = "out.txt"
//!
//! [[pip]]
//! name = "banner"
//! kind = "write"
//! destination = "banner.txt"
//! contents = "built by forge"
//! deps = ["copy-input"]
//! ```

use std::{collections::BTreeMap, path::PathBuf};

use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::{
    frontend::{Frontend, FrontendContext},
    graph::{Mount, PipGraph, PipGraphBuilder, PipKind},
};

/// One pip declaration in the manifest.
#[derive(Debug, Clone, Deserialize)]
struct PipDecl {
    name: String,
    kind: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    destination: Option<String>,
    #[serde(default)]
    contents: Option<String>,
    #[serde(default)]
    executable: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    root: Option<String>,
    #[serde(default)]
    members: Vec<String>,
    #[serde(default)]
    inputs: Vec<String>,
    #[serde(default)]
    outputs: Vec<String>,
    /// Environment variables passed to the pip, read through the engine so
    /// they are tracked.
    #[serde(default)]
    env_from: Vec<String>,
    #[serde(default)]
    deps: Vec<String>,
}

/// One mount declaration in the manifest.
#[derive(Debug, Clone, Deserialize)]
struct MountDecl {
    name: String,
    root: PathBuf,
    #[serde(default = "default_true")]
    readable: bool,
    #[serde(default)]
    writable: bool,
    #[serde(default)]
    scrubbable: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct Manifest {
    #[serde(default, rename = "mount")]
    mounts: Vec<MountDecl>,
    #[serde(default, rename = "pip")]
    pips: Vec<PipDecl>,
}

/// The manifest frontend.
#[derive(Debug, Clone)]
pub struct ManifestFrontend {
    manifest_path: PathBuf,
}

impl ManifestFrontend {
    pub fn new(manifest_path: impl Into<PathBuf>) -> Self {
        Self {
            manifest_path: manifest_path.into(),
        }
    }
}

impl Frontend for ManifestFrontend {
    #[instrument(skip_all, fields(manifest = ?self.manifest_path))]
    async fn evaluate(&self, context: &FrontendContext<'_>) -> Result<PipGraph> {
        let content = context.read_file(&self.manifest_path).await?;
        let content = String::from_utf8(content).context("manifest is not UTF-8")?;
        let manifest = toml::from_str::<Manifest>(&content)
            .with_context(|| format!("parse manifest {:?}", self.manifest_path))?;

        let pools = context.pools();
        let mut builder = PipGraphBuilder::new();

        for mount in manifest.mounts {
            builder.add_mount(Mount {
                name: mount.name,
                root: mount.root,
                readable: mount.readable,
                writable: mount.writable,
                scrubbable: mount.scrubbable,
            })?;
        }

        let mut ids = BTreeMap::new();
        for decl in manifest.pips {
            let kind = match decl.kind.as_str() {
                "copy" => PipKind::CopyFile {
                    source: pools.paths.intern(
                        decl.source
                            .as_deref()
                            .ok_or_else(|| eyre!("copy pip {:?} needs a source", decl.name))?,
                    ),
                    destination: pools.paths.intern(
                        decl.destination.as_deref().ok_or_else(|| {
                            eyre!("copy pip {:?} needs a destination", decl.name)
                        })?,
                    ),
                },
                "write" => PipKind::WriteFile {
                    destination: pools.paths.intern(
                        decl.destination.as_deref().ok_or_else(|| {
                            eyre!("write pip {:?} needs a destination", decl.name)
                        })?,
                    ),
                    contents: pools.strings.intern(decl.contents.as_deref().unwrap_or("")),
                },
                "process" => PipKind::Process {
                    executable: pools.paths.intern(
                        decl.executable.as_deref().ok_or_else(|| {
                            eyre!("process pip {:?} needs an executable", decl.name)
                        })?,
                    ),
                    arguments: decl
                        .args
                        .iter()
                        .map(|arg| pools.strings.intern(arg))
                        .collect(),
                    working_dir: pools
                        .paths
                        .intern(decl.working_dir.as_deref().unwrap_or(".")),
                },
                "seal" => PipKind::SealDirectory {
                    root: pools.paths.intern(
                        decl.root
                            .as_deref()
                            .ok_or_else(|| eyre!("seal pip {:?} needs a root", decl.name))?,
                    ),
                    members: decl
                        .members
                        .iter()
                        .map(|member| pools.paths.intern(member))
                        .collect(),
                },
                other => bail!("pip {:?} has unknown kind {other:?}", decl.name),
            };

            // Implicit data dependencies: copy sources and declared inputs.
            let mut inputs = decl
                .inputs
                .iter()
                .map(|input| pools.paths.intern(input))
                .collect::<Vec<_>>();
            if let PipKind::CopyFile { source, .. } = &kind {
                if !inputs.contains(source) {
                    inputs.push(*source);
                }
            }

            let mut outputs = decl
                .outputs
                .iter()
                .map(|output| pools.paths.intern(output))
                .collect::<Vec<_>>();
            match &kind {
                PipKind::CopyFile { destination, .. }
                | PipKind::WriteFile { destination, .. } => {
                    if !outputs.contains(destination) {
                        outputs.push(*destination);
                    }
                }
                _ => {}
            }

            let mut env = BTreeMap::new();
            for name in &decl.env_from {
                let value = context.lookup_env(name).unwrap_or_default();
                env.insert(pools.strings.intern(name), pools.strings.intern(value));
            }

            let dependencies = decl
                .deps
                .iter()
                .map(|dep| {
                    ids.get(dep)
                        .copied()
                        .ok_or_else(|| eyre!("pip {:?} depends on unknown pip {dep:?}", decl.name))
                })
                .collect::<Result<Vec<_>>>()?;

            let id = builder.add_pip(
                pools.symbols.intern(&decl.name),
                kind,
                inputs,
                outputs,
                env,
                dependencies,
            )?;
            if ids.insert(decl.name.clone(), id).is_some() {
                bail!("duplicate pip name {:?}", decl.name);
            }
        }

        let graph = builder.build();
        debug!(pips = graph.pip_count(), "manifest evaluated");
        Ok(graph)
    }
}
