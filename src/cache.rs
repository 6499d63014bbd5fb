//! Compiled pipeline cache.
//!
//! Compilation is the most expensive step in the whole bridge and is
//! idempotent for identical inputs, so pipelines are keyed by
//! (device identity, source hash, entry name, compile options) and reused. The cache is generic
//! over the stored pipeline so the policy does not depend on Metal.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Identity of a compiled pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    /// Registry ID of the device the pipeline was compiled for.
    pub device_id: u64,
    /// Hash of the full kernel source text.
    pub source_hash: u64,
    /// Entry point name inside the source.
    pub entry: String,
    /// Whether the library was compiled with fast math.
    pub fast_math: bool,
}

impl PipelineKey {
    /// Key for a pipeline compiled with default options.
    pub fn new(device_id: u64, source: &str, entry: &str) -> Self {
        Self {
            device_id,
            source_hash: source_hash(source),
            entry: entry.to_string(),
            fast_math: false,
        }
    }

    pub fn with_fast_math(mut self, fast_math: bool) -> Self {
        self.fast_math = fast_math;
        self
    }
}

/// Hash kernel source text for cache identity.
pub fn source_hash(source: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    hasher.finish()
}

/// Cache of compiled pipelines keyed by [`PipelineKey`].
pub struct PipelineCache<P> {
    cache: HashMap<PipelineKey, P>,
    hits: u64,
    misses: u64,
}

impl<P> Default for PipelineCache<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> PipelineCache<P> {
    pub fn new() -> Self {
        Self {
            cache: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Return the cached pipeline for `key`, or build and cache it.
    ///
    /// A failed build caches nothing, so a later call retries compilation.
    pub fn get_or_try_insert_with<E>(
        &mut self,
        key: PipelineKey,
        build: impl FnOnce() -> Result<P, E>,
    ) -> Result<&P, E> {
        if self.cache.contains_key(&key) {
            self.hits += 1;
            log::trace!("pipeline cache hit: {}", key.entry);
            return Ok(&self.cache[&key]);
        }
        self.misses += 1;
        let pipeline = build()?;
        log::debug!(
            "pipeline cache insert: {} (source {:016x}, device {:#x})",
            key.entry,
            key.source_hash,
            key.device_id
        );
        Ok(self.cache.entry(key).or_insert(pipeline))
    }

    pub fn get(&self, key: &PipelineKey) -> Option<&P> {
        self.cache.get(key)
    }

    /// Number of cached pipelines.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}
