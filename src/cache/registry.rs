//! Bidirectional dependency registry.
//!
//! Tracks which cache keys were derived from which inputs so that a change
//! to an input, or the invalidation of an upstream key, can find every
//! dependent entry.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use super::keys::CacheKey;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::registry";

/// Something a cached artifact can be derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dependency {
    /// Another cached artifact.
    Entry(CacheKey),
    /// An external input such as a configuration file path.
    Source(String),
}

impl Dependency {
    pub fn source(identifier: impl Into<String>) -> Self {
        Self::Source(identifier.into())
    }
}

/// Tracks dependency → dependents and dependent → dependencies mappings.
///
/// Locks are always taken forward map first, then reverse map.
#[derive(Debug, Default)]
pub struct DependencyRegistry {
    /// Maps each dependency to the keys derived from it
    dependents: RwLock<HashMap<Dependency, HashSet<CacheKey>>>,
    /// Maps each key to everything it was derived from
    dependencies: RwLock<HashMap<CacheKey, HashSet<Dependency>>>,
}

impl DependencyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `dependent` was derived from `dependency`.
    pub fn register(&self, dependent: CacheKey, dependency: Dependency) {
        let mut forward = rw_write(&self.dependents, SOURCE, "register.dependents");
        let mut reverse = rw_write(&self.dependencies, SOURCE, "register.dependencies");

        forward
            .entry(dependency.clone())
            .or_default()
            .insert(dependent.clone());
        reverse.entry(dependent).or_default().insert(dependency);
    }

    /// All keys directly derived from `dependency`.
    pub fn dependents_of(&self, dependency: &Dependency) -> HashSet<CacheKey> {
        rw_read(&self.dependents, SOURCE, "dependents_of")
            .get(dependency)
            .cloned()
            .unwrap_or_default()
    }

    /// Everything `key` was directly derived from.
    pub fn dependencies_of(&self, key: &CacheKey) -> HashSet<Dependency> {
        rw_read(&self.dependencies, SOURCE, "dependencies_of")
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop every edge that starts at `key`.
    ///
    /// Edges pointing at `key` are left alone: they belong to the dependents
    /// and disappear when those are unregistered in turn.
    pub fn unregister(&self, key: &CacheKey) {
        let mut forward = rw_write(&self.dependents, SOURCE, "unregister.dependents");
        let mut reverse = rw_write(&self.dependencies, SOURCE, "unregister.dependencies");

        let Some(dependencies) = reverse.remove(key) else {
            return;
        };
        for dependency in dependencies {
            if let Some(keys) = forward.get_mut(&dependency) {
                keys.remove(key);
                if keys.is_empty() {
                    forward.remove(&dependency);
                }
            }
        }
    }

    /// Remove a dependency node, returning the keys that were derived from it.
    pub fn remove_dependency(&self, dependency: &Dependency) -> HashSet<CacheKey> {
        let mut forward = rw_write(&self.dependents, SOURCE, "remove_dependency.dependents");
        let mut reverse = rw_write(&self.dependencies, SOURCE, "remove_dependency.dependencies");

        let affected = forward.remove(dependency).unwrap_or_default();
        for key in &affected {
            if let Some(dependencies) = reverse.get_mut(key) {
                dependencies.remove(dependency);
                if dependencies.is_empty() {
                    reverse.remove(key);
                }
            }
        }
        affected
    }

    pub fn clear(&self) {
        rw_write(&self.dependents, SOURCE, "clear.dependents").clear();
        rw_write(&self.dependencies, SOURCE, "clear.dependencies").clear();
    }

    /// Number of distinct dependencies with at least one dependent.
    pub fn dependency_count(&self) -> usize {
        rw_read(&self.dependents, SOURCE, "dependency_count").len()
    }

    /// Number of keys with at least one registered dependency.
    pub fn dependent_count(&self) -> usize {
        rw_read(&self.dependencies, SOURCE, "dependent_count").len()
    }
}
