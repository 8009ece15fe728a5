//! Content-based change detection.
//!
//! Remembers the last fingerprint seen for each tracked identifier and
//! answers whether new content differs from it. The dependency graph used
//! for cascading invalidation lives alongside the fingerprints.

use dashmap::DashMap;
use tracing::debug;

use super::keys::Fingerprint;
use super::registry::DependencyRegistry;

#[derive(Debug, Default)]
pub struct ChangeDetectionEngine {
    fingerprints: DashMap<String, Fingerprint>,
    graph: DependencyRegistry,
}

impl ChangeDetectionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or overwrite) the fingerprint of `content` for `identifier`.
    pub fn track_content(
        &self,
        identifier: impl Into<String>,
        content: impl AsRef<[u8]>,
    ) -> Fingerprint {
        let identifier = identifier.into();
        let fingerprint = Fingerprint::of(content);
        debug!(identifier = %identifier, fingerprint = %fingerprint, "Tracking content");
        self.fingerprints.insert(identifier, fingerprint);
        fingerprint
    }

    /// True if `identifier` was never tracked or its content differs.
    ///
    /// Does not update the stored fingerprint; call [`Self::track_content`]
    /// to commit.
    pub fn has_content_changed(&self, identifier: &str, content: impl AsRef<[u8]>) -> bool {
        match self.fingerprints.get(identifier) {
            Some(known) => *known != Fingerprint::of(content),
            None => true,
        }
    }

    pub fn fingerprint(&self, identifier: &str) -> Option<Fingerprint> {
        self.fingerprints.get(identifier).map(|known| *known)
    }

    /// Stop tracking `identifier`; returns whether it was tracked.
    pub fn forget(&self, identifier: &str) -> bool {
        self.fingerprints.remove(identifier).is_some()
    }

    pub fn tracked_count(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn dependencies(&self) -> &DependencyRegistry {
        &self.graph
    }
}
