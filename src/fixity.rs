//! Content hashing and fixity comparison.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::provider::FileContent;

/// Hash algorithms the engine can compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-256.
    Sha256,
    /// MD5.
    Md5,
}

impl HashAlgorithm {
    /// Returns the lowercase algorithm name used as a hash map key.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Md5 => "md5",
        }
    }

    /// Picks the first algorithm in `preferred` the engine implements.
    #[must_use]
    pub fn first_supported<S: AsRef<str>>(preferred: &[S]) -> Option<Self> {
        preferred.iter().find_map(|name| name.as_ref().parse().ok())
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256" => Ok(Self::Sha256),
            "md5" => Ok(Self::Md5),
            other => Err(format!("unsupported hash algorithm: {other}")),
        }
    }
}

/// Computes the lowercase hex digest of `bytes`.
#[must_use]
pub fn hash_bytes(algorithm: HashAlgorithm, bytes: &[u8]) -> String {
    match algorithm {
        HashAlgorithm::Sha256 => format!("{:x}", Sha256::digest(bytes)),
        HashAlgorithm::Md5 => format!("{:x}", md5::compute(bytes)),
    }
}

/// One downloaded file awaiting fixity checks and packaging.
#[derive(Debug, Clone)]
pub struct FetchedFile {
    /// File name.
    pub title: String,
    /// Slash-separated path rooted at the requested resource's title.
    pub relative_path: String,
    /// File bytes.
    pub bytes: Vec<u8>,
    /// Algorithm name to hex digest.
    pub hashes: BTreeMap<String, String>,
    /// Provider metadata passed through to the action metadata file.
    pub extra_metadata: BTreeMap<String, serde_json::Value>,
}

impl FetchedFile {
    /// Wraps fetched content, dropping hashes the provider reported as null.
    #[must_use]
    pub fn from_content(title: impl Into<String>, relative_path: impl Into<String>, content: FileContent) -> Self {
        let hashes = content
            .hashes
            .into_iter()
            .filter_map(|(algorithm, digest)| digest.map(|d| (algorithm.to_ascii_lowercase(), d)))
            .collect();
        Self {
            title: title.into(),
            relative_path: relative_path.into(),
            bytes: content.bytes,
            hashes,
            extra_metadata: content.extra_metadata,
        }
    }
}

/// One line of `fixity_info.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixityEntry {
    /// File path inside `data/`.
    pub path: String,
    /// Algorithm name to hex digest.
    pub hashes: BTreeMap<String, String>,
    /// Whether the computed digest matched the provider's, when one was supplied.
    pub matches_provider_hash: Option<bool>,
}

/// A provider hash that disagrees with the downloaded bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityMismatch {
    /// File path.
    pub path: String,
    /// Algorithm compared.
    pub algorithm: String,
    /// Digest reported by the provider.
    pub expected: String,
    /// Digest computed locally.
    pub actual: String,
}

/// Fixity results for a whole job, in file order.
#[derive(Debug, Clone, Default)]
pub struct FixityReport {
    /// One entry per file.
    pub entries: Vec<FixityEntry>,
    /// Files whose bytes did not match the provider hash.
    pub mismatches: Vec<IntegrityMismatch>,
}

impl FixityReport {
    /// Paths of files that failed verification.
    #[must_use]
    pub fn failed_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.mismatches.iter().map(|m| m.path.clone()).collect();
        paths.dedup();
        paths
    }
}

/// Ensures every file carries at least one verified or computed hash.
#[derive(Debug, Clone, Copy)]
pub struct FixityVerifier {
    default_algorithm: HashAlgorithm,
}

impl FixityVerifier {
    /// Creates a verifier that falls back to `default_algorithm`.
    #[must_use]
    pub fn new(default_algorithm: HashAlgorithm) -> Self {
        Self { default_algorithm }
    }

    /// Verifies provider hashes and fills in the default digest where none
    /// was supplied. Mismatches are reported, never fatal.
    pub fn verify(&self, files: &mut [FetchedFile]) -> FixityReport {
        let mut report = FixityReport::default();

        for file in files.iter_mut() {
            let supplied: Vec<(HashAlgorithm, String)> = file
                .hashes
                .iter()
                .filter_map(|(name, digest)| Some((name.parse().ok()?, digest.clone())))
                .collect();

            let matches = if supplied.is_empty() {
                file.hashes.insert(
                    self.default_algorithm.as_str().to_string(),
                    hash_bytes(self.default_algorithm, &file.bytes),
                );
                None
            } else {
                let mut all_match = true;
                for (algorithm, expected) in supplied {
                    let actual = hash_bytes(algorithm, &file.bytes);
                    if !actual.eq_ignore_ascii_case(&expected) {
                        warn!(
                            path = %file.relative_path,
                            algorithm = %algorithm,
                            "provider hash does not match downloaded bytes"
                        );
                        report.mismatches.push(IntegrityMismatch {
                            path: file.relative_path.clone(),
                            algorithm: algorithm.as_str().to_string(),
                            expected,
                            actual,
                        });
                        all_match = false;
                    }
                }
                Some(all_match)
            };

            report.entries.push(FixityEntry {
                path: file.relative_path.clone(),
                hashes: file.hashes.clone(),
                matches_provider_hash: matches,
            });
        }

        report
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    const HELLO_MD5: &str = "5d41402abc4b2a76b9719d911017c592";

    fn file(path: &str, hashes: &[(&str, Option<&str>)]) -> FetchedFile {
        let content = FileContent {
            bytes: b"hello".to_vec(),
            hashes: hashes
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.map(str::to_string)))
                .collect(),
            extra_metadata: BTreeMap::new(),
        };
        FetchedFile::from_content(path, path, content)
    }

    #[test]
    fn test_hash_bytes_known_vectors() {
        assert_eq!(hash_bytes(HashAlgorithm::Sha256, b"hello"), HELLO_SHA256);
        assert_eq!(hash_bytes(HashAlgorithm::Md5, b"hello"), HELLO_MD5);
    }

    #[test]
    fn test_default_algorithm_computed_without_provider_hash() {
        let mut files = vec![file("a.txt", &[])];
        let report = FixityVerifier::new(HashAlgorithm::Sha256).verify(&mut files);

        assert_eq!(report.entries[0].hashes["sha256"], HELLO_SHA256);
        assert_eq!(report.entries[0].matches_provider_hash, None);
        assert!(report.mismatches.is_empty());
        assert_eq!(files[0].hashes["sha256"], HELLO_SHA256);
    }

    #[test]
    fn test_matching_provider_hash_is_case_insensitive() {
        let upper = HELLO_MD5.to_uppercase();
        let mut files = vec![file("a.txt", &[("MD5", Some(upper.as_str()))])];
        let report = FixityVerifier::new(HashAlgorithm::Sha256).verify(&mut files);

        assert_eq!(report.entries[0].matches_provider_hash, Some(true));
        assert!(!report.entries[0].hashes.contains_key("sha256"));
    }

    #[test]
    fn test_mismatch_recorded_not_fatal() {
        let mut files = vec![
            file("bad.txt", &[("sha256", Some("deadbeef"))]),
            file("good.txt", &[]),
        ];
        let report = FixityVerifier::new(HashAlgorithm::Md5).verify(&mut files);

        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.entries[0].matches_provider_hash, Some(false));
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].expected, "deadbeef");
        assert_eq!(report.mismatches[0].actual, HELLO_SHA256);
        assert_eq!(report.failed_paths(), vec!["bad.txt".to_string()]);
        assert_eq!(report.entries[1].hashes["md5"], HELLO_MD5);
    }

    #[test]
    fn test_null_and_unknown_provider_hashes() {
        let mut files = vec![file("a.txt", &[("sha256", None), ("sha512", Some("abc"))])];
        let report = FixityVerifier::new(HashAlgorithm::Sha256).verify(&mut files);

        let hashes = &report.entries[0].hashes;
        assert_eq!(hashes.get("sha512").map(String::as_str), Some("abc"));
        assert_eq!(hashes["sha256"], HELLO_SHA256);
        assert_eq!(report.entries[0].matches_provider_hash, None);
    }

    #[test]
    fn test_manifest_entry_serializes_camel_case() {
        let entry = FixityEntry {
            path: "p".to_string(),
            hashes: BTreeMap::new(),
            matches_provider_hash: Some(true),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["matchesProviderHash"], true);
    }

    #[test]
    fn test_first_supported_algorithm() {
        assert_eq!(
            HashAlgorithm::first_supported(&["sha512", "md5", "sha256"]),
            Some(HashAlgorithm::Md5)
        );
        assert_eq!(HashAlgorithm::first_supported::<&str>(&[]), None);
    }
}
