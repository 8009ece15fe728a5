//! Cache key definitions.
//!
//! A [`CacheKey`] names one derived artifact: which family it belongs to,
//! which input it came from, what that input looked like, and which version
//! of the producing logic built it.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

/// Deterministic 64-bit fingerprint of some content.
///
/// Derived from the leading bytes of a SHA-256 digest, so it is stable across
/// processes and platforms and independent of any timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Fingerprint arbitrary content.
    pub fn of(content: impl AsRef<[u8]>) -> Self {
        let digest = Sha256::digest(content.as_ref());
        let mut leading = [0_u8; 8];
        leading.copy_from_slice(&digest[..8]);
        Self(u64::from_be_bytes(leading))
    }

    /// Wrap an externally computed hash.
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Version tag of the logic that produced an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SchemaVersion {
    Number(u64),
    Tag(String),
}

impl From<u32> for SchemaVersion {
    fn from(value: u32) -> Self {
        Self::Number(u64::from(value))
    }
}

impl From<u64> for SchemaVersion {
    fn from(value: u64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for SchemaVersion {
    fn from(value: &str) -> Self {
        Self::Tag(value.to_string())
    }
}

impl From<String> for SchemaVersion {
    fn from(value: String) -> Self {
        Self::Tag(value)
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "v{value}"),
            Self::Tag(tag) => f.write_str(tag),
        }
    }
}

/// Immutable identity of a cached artifact.
///
/// Equality and hashing cover `entity_name`, `source_identifier`,
/// `content_fingerprint` and `schema_version`. The optional generation
/// timestamp is diagnostic only and never participates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheKey {
    entity_name: String,
    source_identifier: String,
    content_fingerprint: Fingerprint,
    schema_version: SchemaVersion,
    #[serde(skip)]
    generated_at: Option<OffsetDateTime>,
}

impl CacheKey {
    pub fn new(
        entity_name: impl Into<String>,
        source_identifier: impl Into<String>,
        content_fingerprint: Fingerprint,
        schema_version: impl Into<SchemaVersion>,
    ) -> Self {
        Self {
            entity_name: entity_name.into(),
            source_identifier: source_identifier.into(),
            content_fingerprint,
            schema_version: schema_version.into(),
            generated_at: None,
        }
    }

    /// Build a key by fingerprinting the source content directly.
    pub fn for_content(
        entity_name: impl Into<String>,
        source_identifier: impl Into<String>,
        content: impl AsRef<[u8]>,
        schema_version: impl Into<SchemaVersion>,
    ) -> Self {
        Self::new(
            entity_name,
            source_identifier,
            Fingerprint::of(content),
            schema_version,
        )
    }

    /// Stamp the key with the current time for diagnostics.
    pub fn stamped(mut self) -> Self {
        self.generated_at = Some(OffsetDateTime::now_utc());
        self
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn source_identifier(&self) -> &str {
        &self.source_identifier
    }

    pub fn content_fingerprint(&self) -> Fingerprint {
        self.content_fingerprint
    }

    pub fn schema_version(&self) -> &SchemaVersion {
        &self.schema_version
    }

    pub fn generated_at(&self) -> Option<OffsetDateTime> {
        self.generated_at
    }

    /// Stable, collision-resistant identifier used as the durable store key.
    ///
    /// Each identity field is length-prefixed before hashing so that
    /// `("ab", "c")` and `("a", "bc")` never collide.
    pub fn storage_id(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.entity_name.as_bytes(),
            self.source_identifier.as_bytes(),
        ] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        hasher.update(self.content_fingerprint.as_u64().to_be_bytes());
        let version = self.schema_version.to_string();
        hasher.update((version.len() as u64).to_be_bytes());
        hasher.update(version.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity_name == other.entity_name
            && self.source_identifier == other.source_identifier
            && self.content_fingerprint == other.content_fingerprint
            && self.schema_version == other.schema_version
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity_name.hash(state);
        self.source_identifier.hash(state);
        self.content_fingerprint.hash(state);
        self.schema_version.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}@{}#{}",
            self.entity_name, self.source_identifier, self.content_fingerprint, self.schema_version
        )
    }
}
