//! Artifact identity: content fingerprints, kinds and declared sources.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Prefix accepted (and stripped) on fingerprint strings.
const SHA256_PREFIX: &str = "sha256:";

/// Error for a malformed fingerprint string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid fingerprint `{0}`: expected 64 hex characters")]
pub struct InvalidFingerprint(pub String);

/// SHA-256 digest of an artifact tree, as 64 lowercase hex characters.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Parse a fingerprint, accepting an optional `sha256:` prefix.
    pub fn parse(s: &str) -> Result<Self, InvalidFingerprint> {
        let hex = s.trim().strip_prefix(SHA256_PREFIX).unwrap_or(s.trim());
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(InvalidFingerprint(s.to_string()));
        }
        Ok(Fingerprint(hex.to_ascii_lowercase()))
    }

    /// The hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = InvalidFingerprint;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Fingerprint::parse(s)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// What an artifact contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// A source archive; its whole tree is also exposed under `src/`.
    Source,
    /// A prebuilt binary distribution (headers and libraries).
    #[default]
    Binary,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Source => write!(f, "source"),
            ArtifactKind::Binary => write!(f, "binary"),
        }
    }
}

/// A fetchable artifact: its fingerprint plus where it can be obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub fingerprint: Fingerprint,

    #[serde(default)]
    pub kind: ArtifactKind,

    /// Mirror URLs, tried in order.
    #[serde(default)]
    pub urls: Vec<String>,
}

impl Artifact {
    /// Create an artifact description.
    pub fn new(fingerprint: Fingerprint, kind: ArtifactKind, urls: Vec<String>) -> Self {
        Artifact {
            fingerprint,
            kind,
            urls,
        }
    }
}
