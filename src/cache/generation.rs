//! Per-key invalidation generations.
//!
//! An invalidation moves its key's generation forward twice: once when it
//! starts and again when its deletes have landed. Work that began earlier
//! (a lower-tier read, a computation, a queued write) carries a [`Stamp`]
//! taken before it started and only caches its result while that stamp is
//! still current.

use dashmap::DashMap;

use super::keys::CacheKey;

#[derive(Debug, Clone, Copy, Default)]
struct KeyState {
    generation: u64,
    active: u32,
}

/// A key's generation as observed at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Stamp {
    generation: u64,
    settled: bool,
}

/// Generation counters for every key that has ever been invalidated.
///
/// Keys are never forgotten: dropping a counter would let a stamp taken
/// before an invalidation match again afterwards.
#[derive(Debug, Default)]
pub(crate) struct Generations {
    keys: DashMap<CacheKey, KeyState>,
}

impl Generations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stamp(&self, key: &CacheKey) -> Stamp {
        let state = self.keys.get(key).map(|state| *state).unwrap_or_default();
        Stamp {
            generation: state.generation,
            settled: state.active == 0,
        }
    }

    /// Whether work stamped with `stamp` may still populate the cache.
    ///
    /// False when an invalidation of `key` was running at stamp time or has
    /// started or finished since.
    pub fn is_current(&self, key: &CacheKey, stamp: Stamp) -> bool {
        stamp.settled && self.stamp(key).generation == stamp.generation
    }

    /// Mark `key` as being invalidated until the returned guard drops.
    pub fn begin(&self, key: &CacheKey) -> Invalidating<'_> {
        {
            let mut state = self.keys.entry(key.clone()).or_default();
            state.generation = state.generation.wrapping_add(1);
            state.active = state.active.saturating_add(1);
        }
        Invalidating {
            generations: self,
            key: key.clone(),
        }
    }

    fn finish(&self, key: &CacheKey) {
        if let Some(mut state) = self.keys.get_mut(key) {
            state.generation = state.generation.wrapping_add(1);
            state.active = state.active.saturating_sub(1);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.keys.len()
    }
}

/// An invalidation in progress. Dropping it, even on cancellation, settles
/// the key again.
pub(crate) struct Invalidating<'a> {
    generations: &'a Generations,
    key: CacheKey,
}

impl Drop for Invalidating<'_> {
    fn drop(&mut self) {
        self.generations.finish(&self.key);
    }
}
