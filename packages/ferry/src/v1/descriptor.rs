//! Graph descriptors: content-addressed pointers to serialized graph
//! artifacts in the shared content store.

use std::collections::BTreeMap;

use bon::Builder;
use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::Digest;

/// One serialized artifact belonging to a pip graph.
///
/// An artifact is a single file of the engine-cache cohort (the graph itself,
/// an intern table, and so on), stored in the content store under its digest.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct GraphArtifact {
    /// Which engine-cache file this artifact corresponds to.
    pub kind: GraphArtifactKind,
    /// Digest of the artifact bytes as stored (envelope included).
    pub digest: Digest,
    /// Size of the stored bytes, used for transfer accounting.
    pub bytes: u64,
}

/// The serialized files that together make up a pip graph.
///
/// The variant order is the order artifacts are materialized in; the pip
/// graph itself comes last so a partially materialized cohort never looks
/// loadable.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
pub enum GraphArtifactKind {
    /// The input-tracker snapshot recorded while the graph was constructed.
    /// Shipping it with the cohort lets a consumer that fetched the graph
    /// verify the tracked inputs in its own environment.
    InputTracker,
    StringTable,
    PathTable,
    SymbolTable,
    TokenTextTable,
    PipGraph,
}

impl GraphArtifactKind {
    /// The file name this artifact uses inside the engine-cache directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::InputTracker => "InputTracker",
            Self::StringTable => "StringTable",
            Self::PathTable => "PathTable",
            Self::SymbolTable => "SymbolTable",
            Self::TokenTextTable => "TokenTextTable",
            Self::PipGraph => "PipGraph",
        }
    }
}

/// A content-addressed pointer to a complete serialized pip graph.
///
/// The descriptor is what the shared content store hands out when probed by
/// fingerprint, and what the orchestrator publishes to workers. Everything a
/// consumer needs to decide whether the graph is usable in its environment
/// travels with the descriptor: the artifact list plus the environment
/// variables and mounts the graph's construction depended on.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct GraphDescriptor {
    /// The exact fingerprint the graph was registered under.
    pub exact_fingerprint: Digest,
    /// The compatible fingerprint, used for schema-level probes.
    pub compatible_fingerprint: Digest,
    /// The serialized artifacts, one per engine-cache file.
    pub artifacts: Vec<GraphArtifact>,
    /// Environment variables the graph depended on, name to value-or-absence.
    #[builder(default)]
    pub env_vars: BTreeMap<String, Option<String>>,
    /// Mounts the graph depended on, name to resolved path (serialized as a
    /// platform-independent string) or absence.
    #[builder(default)]
    pub mounts: BTreeMap<String, Option<String>>,
}

impl GraphDescriptor {
    /// Look up the artifact for the given kind, if present.
    pub fn artifact(&self, kind: GraphArtifactKind) -> Option<&GraphArtifact> {
        self.artifacts.iter().find(|artifact| artifact.kind == kind)
    }

    /// Total stored bytes across all artifacts.
    pub fn total_bytes(&self) -> u64 {
        self.artifacts.iter().map(|artifact| artifact.bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn descriptor() -> GraphDescriptor {
        GraphDescriptor::builder()
            .exact_fingerprint(Digest::from_buffer(b"exact"))
            .compatible_fingerprint(Digest::from_buffer(b"compatible"))
            .artifacts(vec![
                GraphArtifact::builder()
                    .kind(GraphArtifactKind::StringTable)
                    .digest(Digest::from_buffer(b"strings"))
                    .bytes(10)
                    .build(),
                GraphArtifact::builder()
                    .kind(GraphArtifactKind::PipGraph)
                    .digest(Digest::from_buffer(b"graph"))
                    .bytes(32)
                    .build(),
            ])
            .build()
    }

    #[test]
    fn artifact_lookup() {
        let descriptor = descriptor();
        let artifact = descriptor.artifact(GraphArtifactKind::PipGraph).unwrap();
        pretty_assert_eq!(artifact.digest, Digest::from_buffer(b"graph"));
        assert!(descriptor.artifact(GraphArtifactKind::SymbolTable).is_none());
    }

    #[test]
    fn total_bytes_sums_artifacts() {
        pretty_assert_eq!(descriptor().total_bytes(), 42);
    }

    #[test]
    fn serde_round_trip() {
        let descriptor = descriptor();
        let json = serde_json::to_string(&descriptor).unwrap();
        let back = serde_json::from_str::<GraphDescriptor>(&json).unwrap();
        pretty_assert_eq!(descriptor, back);
    }
}
