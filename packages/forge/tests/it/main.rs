use std::path::{Path, PathBuf};

use forge::{cache::FsStore, config::EngineConfig, manifest::ManifestFrontend};
use tempfile::TempDir;

pub mod distributed;
pub mod scenarios;

/// A workspace with a manifest, plus the content store it shares with any
/// other workspace created from the same `store` path.
pub struct TestWorkspace {
    _dir: TempDir,
    pub root: PathBuf,
    pub store: FsStore,
}

impl TestWorkspace {
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("forge.toml")
    }

    pub fn engine_cache(&self) -> PathBuf {
        self.root.join("out").join("engine-cache")
    }

    pub fn config(&self) -> EngineConfig {
        let mut config = EngineConfig::for_workspace(&self.root);
        config.config_files = vec![self.manifest_path()];
        config
    }

    pub fn frontend(&self) -> ManifestFrontend {
        ManifestFrontend::new(self.manifest_path())
    }
}

/// Create a workspace with the given manifest, backed by its own store.
pub async fn workspace(manifest: &str) -> TestWorkspace {
    let dir = TempDir::new().expect("create temporary directory");
    let root = dir.path().to_path_buf();
    let store = FsStore::new(root.join("out").join("store"));
    forge::fs::write(root.join("forge.toml"), manifest.as_bytes())
        .await
        .expect("write manifest");
    TestWorkspace {
        _dir: dir,
        root,
        store,
    }
}

/// Create a workspace sharing an existing store (a "fresh machine" against
/// the same shared content store).
pub async fn workspace_sharing_store(manifest: &str, store: &FsStore) -> TestWorkspace {
    let dir = TempDir::new().expect("create temporary directory");
    let root = dir.path().to_path_buf();
    forge::fs::write(root.join("forge.toml"), manifest.as_bytes())
        .await
        .expect("write manifest");
    TestWorkspace {
        _dir: dir,
        root,
        store: store.clone(),
    }
}

/// The one-pip copy manifest used by most scenarios.
pub const COPY_MANIFEST: &str = r#"
[[pip]]
name = "copy-input"
kind = "copy"
source = "in.txt"
destination = "out.txt"
"#;

pub async fn write_input(root: &Path, content: &str) {
    forge::fs::write(root.join("in.txt"), content.as_bytes())
        .await
        .expect("write input");
}
