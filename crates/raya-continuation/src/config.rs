//! Continuation configuration

use serde::{Deserialize, Serialize};

use crate::defaults::{
    CHUNK_SIZE_ALIGNMENT_WORDS, DEFAULT_GROWTH_FACTOR, DEFAULT_INITIAL_CHUNK_WORDS,
    DEFAULT_MAX_CHUNK_WORDS,
};

/// Chunk sizing and verification settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuationConfig {
    /// Words allocated on the first freeze
    pub initial_chunk_words: usize,

    /// Largest chunk a continuation may own, in words
    pub max_chunk_words: usize,

    /// Capacity multiplier when growing
    pub growth_factor: usize,

    /// Poison untrusted back-links and check every placement, link chain and
    /// relativized field
    pub verify: bool,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            initial_chunk_words: DEFAULT_INITIAL_CHUNK_WORDS,
            max_chunk_words: DEFAULT_MAX_CHUNK_WORDS,
            growth_factor: DEFAULT_GROWTH_FACTOR,
            verify: cfg!(debug_assertions),
        }
    }
}

impl ContinuationConfig {
    /// Configuration with verification on
    pub fn verified() -> Self {
        Self {
            verify: true,
            ..Self::default()
        }
    }

    /// Set the chunk limit
    pub fn with_max_chunk_words(mut self, words: usize) -> Self {
        self.max_chunk_words = words;
        self
    }

    /// Set the initial chunk size
    pub fn with_initial_chunk_words(mut self, words: usize) -> Self {
        self.initial_chunk_words = words;
        self
    }

    /// Chunk limit rounded down to the chunk size alignment
    pub fn chunk_limit(&self) -> usize {
        self.max_chunk_words - self.max_chunk_words % CHUNK_SIZE_ALIGNMENT_WORDS
    }
}
