//! Transpool Core Type Definitions
//!
//! Defines fundamental types shared across the pool, loader, and dispatcher.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::protocol::OutputArtifact;

// =============================================================================
// Identity Types
// =============================================================================

/// Identity of one worker unit. Assigned by the loader at spawn time and
/// stable for the lifetime of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub(crate) u32);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Progress
// =============================================================================

/// Aggregate load progress as seen by consumers.
///
/// `percent` is monotonically nondecreasing within one load sequence and
/// reaches exactly 100 only once the download has completed and every
/// configured worker has signaled readiness.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    /// Percent in [0, 100]
    pub percent: f64,
    /// True only on the terminal update of a successful load
    pub ready: bool,
}

// =============================================================================
// Results
// =============================================================================

/// Mapping from output artifact name to base64-encoded output bytes.
///
/// Keys are derived by stripping the extension from the worker's output
/// filename. Fragments from successive jobs merge additively; later entries
/// for the same key replace earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMap(HashMap<String, String>);

impl ResultMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a worker's output artifacts into a result fragment.
    pub fn from_artifacts(artifacts: &[OutputArtifact]) -> Self {
        let mut map = HashMap::with_capacity(artifacts.len());
        for artifact in artifacts {
            map.insert(
                artifact_stem(&artifact.name).to_string(),
                STANDARD.encode(&artifact.bytes),
            );
        }
        Self(map)
    }

    /// Merge another fragment into this one, replacing duplicate keys.
    pub fn merge(&mut self, other: ResultMap) {
        self.0.extend(other.0);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn into_inner(self) -> HashMap<String, String> {
        self.0
    }
}

/// Strip the final extension from an artifact filename.
///
/// Extensionless names are kept whole rather than collapsing to an empty key.
pub fn artifact_stem(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some(("", _)) | None => name,
        Some((stem, _)) => stem,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_stem_strips_last_extension() {
        assert_eq!(artifact_stem("clip.jpg"), "clip");
        assert_eq!(artifact_stem("movie.mp4.jpg"), "movie.mp4");
    }

    #[test]
    fn artifact_stem_keeps_degenerate_names() {
        assert_eq!(artifact_stem("noext"), "noext");
        assert_eq!(artifact_stem(".hidden"), ".hidden");
    }

    #[test]
    fn result_map_encodes_artifacts_as_base64() {
        let artifacts = vec![OutputArtifact {
            name: "clip.jpg".to_string(),
            bytes: vec![0xde, 0xad, 0xbe, 0xef],
        }];
        let map = ResultMap::from_artifacts(&artifacts);
        assert_eq!(map.get("clip"), Some(STANDARD.encode([0xde, 0xad, 0xbe, 0xef]).as_str()));
    }

    #[test]
    fn result_map_merges_additively() {
        let mut acc = ResultMap::from_artifacts(&[OutputArtifact {
            name: "first.jpg".to_string(),
            bytes: vec![1],
        }]);
        acc.merge(ResultMap::from_artifacts(&[OutputArtifact {
            name: "second.jpg".to_string(),
            bytes: vec![2],
        }]));

        assert_eq!(acc.len(), 2);
        assert!(acc.get("first").is_some());
        assert!(acc.get("second").is_some());
    }
}
