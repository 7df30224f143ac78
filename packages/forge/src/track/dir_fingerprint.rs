//! Directory membership fingerprints.
//!
//! A tracked enumeration is summarized by an order-independent hash of its
//! members' `(name, is_directory)` pairs, filtered by the membership rule
//! that applies to the enumerated path. Re-running the enumeration later and
//! comparing fingerprints answers "did this directory's membership change"
//! without storing the member list.

use std::path::{Path, PathBuf};

use color_eyre::{Result, eyre::Context};
use ferry::v1::Digest;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::instrument;

/// One member of an enumerated directory.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct DirectoryMember {
    pub name: String,
    pub is_directory: bool,
}

/// How enumerations under a rule's root are fingerprinted. Exactly one mode
/// is active per rule.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum MembershipRule {
    /// Enumerations under this root get a fixed fingerprint: the filesystem
    /// is never consulted, so membership changes never invalidate.
    DisableFilesystemEnumeration,
    /// Members whose name matches any of the patterns are excluded from the
    /// fingerprint. Patterns support `*` and `?` wildcards.
    IgnoreWildcards(Vec<String>),
}

/// A membership rule scoped to a directory subtree.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ScopedMembershipRule {
    pub root: PathBuf,
    pub rule: MembershipRule,
}

/// The rule set consulted for every tracked enumeration.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MembershipRules(Vec<ScopedMembershipRule>);

impl MembershipRules {
    pub fn new(rules: Vec<ScopedMembershipRule>) -> Self {
        Self(rules)
    }

    /// The rule applying to an enumeration of `path`: the rule with the
    /// longest root of which `path` is a descendant (or the root itself).
    pub fn rule_for(&self, path: &Path) -> Option<&ScopedMembershipRule> {
        self.0
            .iter()
            .filter(|scoped| path.starts_with(&scoped.root))
            .max_by_key(|scoped| scoped.root.as_os_str().len())
    }
}

/// The fingerprint used for enumerations whose rule disables filesystem
/// enumeration.
pub fn disabled_enumeration_fingerprint() -> Digest {
    Digest::from_fields([b"forge-enumeration-disabled".as_slice()])
}

/// Compute the membership fingerprint of the members, applying `rule`.
///
/// The hash is order-independent: members are sorted before hashing, so two
/// enumerations of the same membership fingerprint identically regardless of
/// the order the filesystem returned them in.
pub fn membership_fingerprint(members: &[DirectoryMember], rule: Option<&MembershipRule>) -> Digest {
    match rule {
        Some(MembershipRule::DisableFilesystemEnumeration) => disabled_enumeration_fingerprint(),
        rule => {
            let ignored: &[String] = match rule {
                Some(MembershipRule::IgnoreWildcards(patterns)) => patterns,
                _ => &[],
            };
            let fields = members
                .iter()
                .filter(|member| {
                    !ignored
                        .iter()
                        .any(|pattern| wildcard_match(pattern, &member.name))
                })
                .sorted()
                .flat_map(|member| {
                    [
                        member.name.clone().into_bytes(),
                        vec![member.is_directory as u8],
                    ]
                })
                .collect::<Vec<_>>();
            Digest::from_fields(fields)
        }
    }
}

/// Enumerate the directory at `path` into members.
#[instrument]
pub async fn enumerate(path: impl AsRef<Path> + std::fmt::Debug) -> Result<Vec<DirectoryMember>> {
    let path = path.as_ref();
    let mut entries = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("enumerate {path:?}"))?;
    let mut members = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("enumerate {path:?}"))?
    {
        let file_type = entry
            .file_type()
            .await
            .with_context(|| format!("stat {:?}", entry.path()))?;
        members.push(DirectoryMember {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_directory: file_type.is_dir(),
        });
    }
    Ok(members)
}

/// Match `text` against a pattern with `*` (any run) and `?` (any one)
/// wildcards.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.chars().collect::<Vec<_>>();
    let text = text.chars().collect::<Vec<_>>();
    // dp[i][j]: pattern[..i] matches text[..j]
    let mut dp = vec![vec![false; text.len() + 1]; pattern.len() + 1];
    dp[0][0] = true;
    for i in 1..=pattern.len() {
        if pattern[i - 1] == '*' {
            dp[i][0] = dp[i - 1][0];
        }
    }
    for i in 1..=pattern.len() {
        for j in 1..=text.len() {
            dp[i][j] = match pattern[i - 1] {
                '*' => dp[i - 1][j] || dp[i][j - 1],
                '?' => dp[i - 1][j - 1],
                c => dp[i - 1][j - 1] && c == text[j - 1],
            };
        }
    }
    dp[pattern.len()][text.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs;
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use simple_test_case::test_case;

    fn member(name: &str, is_directory: bool) -> DirectoryMember {
        DirectoryMember {
            name: name.to_string(),
            is_directory,
        }
    }

    #[test]
    fn fingerprint_is_order_independent() {
        let forward = vec![member("a", false), member("b", true)];
        let backward = vec![member("b", true), member("a", false)];
        pretty_assert_eq!(
            membership_fingerprint(&forward, None),
            membership_fingerprint(&backward, None),
        );
    }

    #[test]
    fn fingerprint_distinguishes_kind() {
        let as_file = vec![member("a", false)];
        let as_dir = vec![member("a", true)];
        assert_ne!(
            membership_fingerprint(&as_file, None),
            membership_fingerprint(&as_dir, None),
        );
    }

    #[test]
    fn ignored_members_do_not_contribute() {
        let rule = MembershipRule::IgnoreWildcards(vec!["*.log".to_string()]);
        let with_log = vec![member("build.log", false), member("main.c", false)];
        let without_log = vec![member("main.c", false)];
        pretty_assert_eq!(
            membership_fingerprint(&with_log, Some(&rule)),
            membership_fingerprint(&without_log, Some(&rule)),
        );
    }

    #[test]
    fn disabled_enumeration_is_constant() {
        let rule = MembershipRule::DisableFilesystemEnumeration;
        let some = vec![member("a", false)];
        let other = vec![member("b", true), member("c", false)];
        pretty_assert_eq!(
            membership_fingerprint(&some, Some(&rule)),
            membership_fingerprint(&other, Some(&rule)),
        );
    }

    #[test]
    fn longest_root_wins() {
        let rules = MembershipRules::new(vec![
            ScopedMembershipRule {
                root: PathBuf::from("/ws"),
                rule: MembershipRule::IgnoreWildcards(vec!["*.tmp".to_string()]),
            },
            ScopedMembershipRule {
                root: PathBuf::from("/ws/out"),
                rule: MembershipRule::DisableFilesystemEnumeration,
            },
        ]);
        let rule = rules.rule_for(Path::new("/ws/out/sub")).unwrap();
        pretty_assert_eq!(rule.rule, MembershipRule::DisableFilesystemEnumeration);
        let rule = rules.rule_for(Path::new("/ws/src")).unwrap();
        assert!(matches!(rule.rule, MembershipRule::IgnoreWildcards(_)));
        assert!(rules.rule_for(Path::new("/elsewhere")).is_none());
    }

    #[test_case("*", "anything", true; "star matches all")]
    #[test_case("*.log", "build.log", true; "suffix")]
    #[test_case("*.log", "build.log.bak", false; "suffix only at end")]
    #[test_case("a?c", "abc", true; "question mark")]
    #[test_case("a?c", "ac", false; "question mark needs one char")]
    #[test_case("", "", true; "empty matches empty")]
    #[test]
    fn wildcards(pattern: &str, text: &str, expected: bool) {
        pretty_assert_eq!(wildcard_match(pattern, text), expected);
    }

    #[tokio::test]
    async fn enumerate_reports_members() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("file"), b"x").await.unwrap();
        fs::create_dir_all(dir.path().join("sub")).await.unwrap();

        let mut members = enumerate(dir.path()).await.unwrap();
        members.sort();
        pretty_assert_eq!(members, vec![member("file", false), member("sub", true)]);
    }
}
