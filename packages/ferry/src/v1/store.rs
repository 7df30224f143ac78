//! Shared content store API types.
//!
//! The store itself is an external service; these are the request/response
//! shapes the engine and workers exchange with it. Blobs are keyed by digest;
//! graph descriptors are registered under their fingerprints so a build on
//! another machine can probe for a reusable graph without knowing which blobs
//! it is made of.

use bon::Builder;
use serde::{Deserialize, Serialize};

use super::{Digest, GraphDescriptor};

/// Register a graph descriptor under its fingerprints.
///
/// The store indexes the descriptor by both the exact and the compatible
/// fingerprint it carries. Registration must be durable before the
/// orchestrator dispatches any pip referencing the graph.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct RegisterGraphRequest {
    pub descriptor: GraphDescriptor,
}

/// Probe for a graph descriptor by fingerprint.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct ProbeGraphRequest {
    pub fingerprint: Digest,
    /// Whether `fingerprint` is an exact or a compatible fingerprint.
    pub kind: ProbeKind,
}

/// Which fingerprint index a probe consults.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum ProbeKind {
    Exact,
    Compatible,
}

/// Result of a graph probe.
///
/// A compatible-kind probe may return several candidates; callers must verify
/// each candidate's tracked inputs before trusting it.
#[derive(Debug, Clone, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct ProbeGraphResponse {
    pub candidates: Vec<GraphDescriptor>,
}

/// Result of a bulk blob upload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkWriteResponse {
    /// Digests that were newly written.
    pub written: Vec<Digest>,
    /// Digests that were skipped because they already existed.
    pub skipped: Vec<Digest>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn probe_request_round_trip() {
        let request = ProbeGraphRequest::builder()
            .fingerprint(Digest::from_buffer(b"fp"))
            .kind(ProbeKind::Compatible)
            .build();
        let json = serde_json::to_string(&request).unwrap();
        let back = serde_json::from_str::<ProbeGraphRequest>(&json).unwrap();
        pretty_assert_eq!(request, back);
    }
}
