//! Graph fingerprinting.
//!
//! A graph fingerprint is a composite digest of every input that defines
//! graph identity: configuration file contents, referenced environment
//! variables, mount definitions, the engine version manifest, an optional
//! commit id, and the evaluation filter. Equal inputs yield equal
//! fingerprints across runs, machines, and process ids — inputs are sorted
//! by key before hashing, and nothing position- or pointer-dependent is
//! folded in.
//!
//! Two fingerprints are computed from the same inputs:
//! - the *exact* fingerprint includes env-var and mount values, and is the
//!   key a serialized graph is registered under;
//! - the *compatible* fingerprint replaces values with names only, and is
//!   used to probe for prior graphs whose schema might match with different
//!   resolved values. A compatible candidate must still pass full input
//!   verification after loading.

use std::{
    collections::{BTreeMap, BTreeSet},
    hash::{Hash, Hasher},
    path::PathBuf,
};

use derive_more::Display;
use ferry::v1::Digest;
use rustc_stable_hash::StableSipHasher128;
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace};

/// The two nested fingerprints of one graph.
#[derive(Clone, Debug, Eq, PartialEq, Display, Serialize, Deserialize)]
#[display("exact {exact} compatible {compatible}")]
pub struct GraphFingerprint {
    pub exact: Digest,
    pub compatible: Digest,
}

/// The partial-evaluation filter, serialized in a stable form.
///
/// The filter names the roots evaluation is narrowed to; an empty filter
/// means a full evaluation.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct EvaluationFilter {
    pub roots: BTreeSet<String>,
}

impl EvaluationFilter {
    pub fn full() -> Self {
        Self::default()
    }

    /// A position-independent hash of the filter, stable across processes
    /// and machines.
    fn stable_hash(&self) -> u64 {
        let mut hasher = StableSipHasher128::new();
        self.roots.hash(&mut hasher);
        Hasher::finish(&hasher)
    }
}

/// Everything that defines graph identity, assembled by the driver before
/// the reuse decision.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FingerprintInputs {
    /// Content digests of every configuration file, keyed by path.
    pub config_files: BTreeMap<PathBuf, Digest>,
    /// Referenced environment variables with their values (or absence).
    pub env_vars: BTreeMap<String, Option<String>>,
    /// Named mounts with their resolved paths (or absence).
    pub mounts: BTreeMap<String, Option<PathBuf>>,
    /// Hash of the engine version manifest.
    pub engine_version: Digest,
    /// Source-control commit id, when building from a known commit.
    pub commit_id: Option<String>,
    pub filter: EvaluationFilter,
}

impl Default for FingerprintInputs {
    fn default() -> Self {
        Self {
            config_files: BTreeMap::new(),
            env_vars: BTreeMap::new(),
            mounts: BTreeMap::new(),
            engine_version: Digest::from_buffer(b""),
            commit_id: None,
            filter: EvaluationFilter::default(),
        }
    }
}

/// A hook applied to environment variable values before fingerprinting.
///
/// Some environments rewrite variables between runs in ways that don't
/// affect the build (session suffixes and the like); deployments can
/// canonicalize those here. The default is identity.
pub type EnvCanonicalizer = Box<dyn Fn(&str, &str) -> String + Send + Sync>;

/// Computes [`GraphFingerprint`]s deterministically.
pub struct GraphFingerprinter {
    canonicalizer: Option<EnvCanonicalizer>,
}

impl Default for GraphFingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GraphFingerprinter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphFingerprinter")
            .field("canonicalizer", &self.canonicalizer.is_some())
            .finish()
    }
}

impl GraphFingerprinter {
    pub fn new() -> Self {
        Self {
            canonicalizer: None,
        }
    }

    /// Install an environment-variable canonicalization hook.
    pub fn with_canonicalizer(canonicalizer: EnvCanonicalizer) -> Self {
        Self {
            canonicalizer: Some(canonicalizer),
        }
    }

    fn canonicalize(&self, name: &str, value: &str) -> String {
        match &self.canonicalizer {
            Some(hook) => hook(name, value),
            None => value.to_string(),
        }
    }

    /// Compute both fingerprints from the inputs.
    #[instrument(skip_all)]
    pub fn compute(&self, inputs: &FingerprintInputs) -> GraphFingerprint {
        let exact = self.digest_of(inputs, true);
        let compatible = self.digest_of(inputs, false);
        trace!(%exact, %compatible, "computed graph fingerprint");
        GraphFingerprint { exact, compatible }
    }

    fn digest_of(&self, inputs: &FingerprintInputs, include_values: bool) -> Digest {
        let mut fields: Vec<Vec<u8>> = Vec::new();
        let mut push = |tag: &str, value: &[u8]| {
            fields.push(tag.as_bytes().to_vec());
            fields.push(value.to_vec());
        };

        // BTreeMap iteration is already sorted by key, which is the ordering
        // the determinism guarantee relies on.
        for (path, digest) in &inputs.config_files {
            push("config", path.to_string_lossy().as_bytes());
            push("config-hash", digest.as_bytes());
        }

        for (name, value) in &inputs.env_vars {
            push("env", name.as_bytes());
            if include_values {
                match value {
                    Some(value) => push("env-value", self.canonicalize(name, value).as_bytes()),
                    None => push("env-absent", b""),
                }
            }
        }

        for (name, resolved) in &inputs.mounts {
            push("mount", name.as_bytes());
            if include_values {
                match resolved {
                    Some(path) => push("mount-path", path.to_string_lossy().as_bytes()),
                    None => push("mount-absent", b""),
                }
            }
        }

        push("engine-version", inputs.engine_version.as_bytes());
        if let Some(commit) = &inputs.commit_id {
            push("commit", commit.as_bytes());
        }
        push("filter", &inputs.filter.stable_hash().to_le_bytes());

        Digest::from_fields(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn inputs() -> FingerprintInputs {
        FingerprintInputs {
            config_files: [(
                PathBuf::from("config.toml"),
                Digest::from_buffer(b"config content"),
            )]
            .into(),
            env_vars: [
                ("CC".to_string(), Some("gcc".to_string())),
                ("MISSING".to_string(), None),
            ]
            .into(),
            mounts: [(
                "Out".to_string(),
                Some(PathBuf::from("/workspace/out")),
            )]
            .into(),
            engine_version: Digest::from_buffer(b"forge 0.0.0"),
            commit_id: Some("abc123".to_string()),
            filter: EvaluationFilter::full(),
        }
    }

    #[test]
    fn deterministic_across_computations() {
        let fingerprinter = GraphFingerprinter::new();
        pretty_assert_eq!(
            fingerprinter.compute(&inputs()),
            fingerprinter.compute(&inputs()),
        );
    }

    #[test]
    fn env_value_change_flips_exact_only() {
        let fingerprinter = GraphFingerprinter::new();
        let base = fingerprinter.compute(&inputs());

        let mut changed = inputs();
        changed
            .env_vars
            .insert("CC".to_string(), Some("clang".to_string()));
        let after = fingerprinter.compute(&changed);

        assert_ne!(base.exact, after.exact);
        pretty_assert_eq!(base.compatible, after.compatible);
    }

    #[test]
    fn env_name_change_flips_both() {
        let fingerprinter = GraphFingerprinter::new();
        let base = fingerprinter.compute(&inputs());

        let mut changed = inputs();
        changed.env_vars.insert("NEW_VAR".to_string(), None);
        let after = fingerprinter.compute(&changed);

        assert_ne!(base.exact, after.exact);
        assert_ne!(base.compatible, after.compatible);
    }

    #[test]
    fn config_content_change_flips_both() {
        let fingerprinter = GraphFingerprinter::new();
        let base = fingerprinter.compute(&inputs());

        let mut changed = inputs();
        changed.config_files.insert(
            PathBuf::from("config.toml"),
            Digest::from_buffer(b"different content"),
        );
        let after = fingerprinter.compute(&changed);

        assert_ne!(base.exact, after.exact);
        assert_ne!(base.compatible, after.compatible);
    }

    #[test]
    fn filter_change_flips_both() {
        let fingerprinter = GraphFingerprinter::new();
        let base = fingerprinter.compute(&inputs());

        let mut changed = inputs();
        changed.filter.roots.insert("//src/app".to_string());
        let after = fingerprinter.compute(&changed);

        assert_ne!(base.exact, after.exact);
        assert_ne!(base.compatible, after.compatible);
    }

    #[test]
    fn canonicalizer_applies_before_hashing() {
        let canonicalizing = GraphFingerprinter::with_canonicalizer(Box::new(|_, value| {
            value.trim_end_matches(|c: char| c.is_ascii_digit()).to_string()
        }));

        let mut a = inputs();
        a.env_vars
            .insert("SESSION".to_string(), Some("run-1".to_string()));
        let mut b = inputs();
        b.env_vars
            .insert("SESSION".to_string(), Some("run-2".to_string()));

        pretty_assert_eq!(
            canonicalizing.compute(&a).exact,
            canonicalizing.compute(&b).exact,
        );

        let plain = GraphFingerprinter::new();
        assert_ne!(plain.compute(&a).exact, plain.compute(&b).exact);
    }
}
