use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use super::keys::CacheKey;

/// Errors surfaced to callers of the cache manager.
///
/// A miss is not an error: lookups return `Option`. Store failures and
/// corrupt entries are absorbed and reported through logs and metrics.
#[derive(Debug, Error, Clone)]
pub enum CacheError {
    #[error("computing `{key}` failed: {source}")]
    Compute {
        key: CacheKey,
        #[source]
        source: ComputeError,
    },
}

impl CacheError {
    pub fn key(&self) -> &CacheKey {
        match self {
            Self::Compute { key, .. } => key,
        }
    }

    /// The producer failure, when this error came from a computation.
    pub fn compute_error(&self) -> Option<&ComputeError> {
        match self {
            Self::Compute { source, .. } => Some(source),
        }
    }
}

/// A producer failure shared by every waiter of one computation.
///
/// Cloning is cheap and all clones point at the same underlying error.
#[derive(Clone)]
pub struct ComputeError {
    inner: Arc<dyn StdError + Send + Sync>,
}

impl ComputeError {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(error),
        }
    }

    pub fn from_boxed(error: Box<dyn StdError + Send + Sync>) -> Self {
        Self {
            inner: Arc::from(error),
        }
    }

    /// Attempt to view the producer's original error type.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.inner.downcast_ref::<E>()
    }

    /// True when both handles refer to the same failure instance.
    pub fn same_failure(&self, other: &ComputeError) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.inner, f)
    }
}

impl StdError for ComputeError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source()
    }
}

/// Errors reported by durable and remote store collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store `{store}` unavailable: {reason}")]
    Unavailable { store: String, reason: String },
}

impl StoreError {
    pub fn unavailable(store: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            store: store.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::keys::Fingerprint;

    #[derive(Debug, Error)]
    #[error("resolver exploded")]
    struct ResolverFailure;

    #[test]
    fn clones_share_one_failure() {
        let original = ComputeError::new(ResolverFailure);
        let clone = original.clone();

        assert!(original.same_failure(&clone));
        assert!(!original.same_failure(&ComputeError::new(ResolverFailure)));
        assert!(clone.downcast_ref::<ResolverFailure>().is_some());
        assert_eq!(clone.to_string(), "resolver exploded");
    }

    #[test]
    fn cache_error_names_the_key() {
        let key = CacheKey::new("deps", "Cargo.lock", Fingerprint::from_raw(9), 1_u32);
        let error = CacheError::Compute {
            key: key.clone(),
            source: ComputeError::new(ResolverFailure),
        };

        assert_eq!(error.key(), &key);
        assert!(error.to_string().contains("resolver exploded"));
        assert!(error.compute_error().is_some());
    }
}
