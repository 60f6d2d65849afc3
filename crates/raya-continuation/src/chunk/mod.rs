//! Heap-resident stack chunks
//!
//! A chunk is a word buffer holding frozen frames in the same physical order
//! as on the machine stack, youngest at the lowest index. Everything inside
//! refers to other words by fp-relative offsets, so growing the buffer moves
//! only `sp`.
//!
//! # Layout
//!
//! ```text
//! index 0                                              stack_size
//! ┌──────────┬────┬─────────┬─────────┬───────────────┬─────────┐
//! │ free     │ md │ top     │  ...    │ bottom frame  │ argsize │
//! └──────────┴────┴─────────┴─────────┴───────────────┴─────────┘
//!            ↑ sp  ↑ sp + metadata words       bottom ↑
//! ```
//!
//! `md` is the top frame's pc and link. `bottom = stack_size - argsize` is
//! the end sentinel of the [`ChunkFrameStream`].

mod stream;

pub use stream::{ChunkFrameStream, ChunkFrames};

use std::ops::Range;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::ContinuationConfig;
use crate::defaults::CHUNK_SIZE_ALIGNMENT_WORDS;
use crate::stack::{slot_range, Segment};
use crate::{Address, ContinuationError, ContinuationResult, Word};

/// A chunk shared between its continuation and GC readers
pub type SharedChunk = Arc<RwLock<StackChunk>>;

/// Chunk usage statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStats {
    /// Buffer size in words
    pub stack_size: usize,
    /// Words holding frames (including top metadata and bottom args)
    pub used_words: usize,
    /// Frozen frames
    pub frames: usize,
    /// Argument area of the bottom frame
    pub argsize: usize,
    /// Times the buffer was reallocated
    pub growths: usize,
}

/// Frozen frames of one continuation
#[derive(Debug, Clone, Default)]
pub struct StackChunk {
    words: Vec<Word>,
    sp: usize,
    argsize: usize,
    frames: usize,
    growths: usize,
}

impl StackChunk {
    /// Create an empty chunk without storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty chunk with `words` of storage
    pub fn with_capacity(words: usize) -> Self {
        let size = round_up(words);
        Self {
            words: vec![0; size],
            sp: size,
            ..Self::default()
        }
    }

    /// Wrap for sharing with GC readers
    pub fn into_shared(self) -> SharedChunk {
        Arc::new(RwLock::new(self))
    }

    /// Buffer size in words
    #[inline]
    pub fn stack_size(&self) -> usize {
        self.words.len()
    }

    /// Index of the top frame's metadata; `stack_size` when empty
    #[inline]
    pub fn sp(&self) -> usize {
        self.sp
    }

    /// Argument area of the bottom frame
    #[inline]
    pub fn argsize(&self) -> usize {
        self.argsize
    }

    /// End sentinel for frame iteration
    #[inline]
    pub fn bottom(&self) -> Address {
        self.stack_size() - self.argsize
    }

    /// Number of frozen frames
    #[inline]
    pub fn num_frames(&self) -> usize {
        self.frames
    }

    /// Whether no frame is frozen
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    /// Words currently in use
    #[inline]
    pub fn used_words(&self) -> usize {
        self.stack_size() - self.sp
    }

    /// Get chunk statistics
    pub fn stats(&self) -> ChunkStats {
        ChunkStats {
            stack_size: self.stack_size(),
            used_words: self.used_words(),
            frames: self.frames,
            argsize: self.argsize,
            growths: self.growths,
        }
    }

    /// Words in use, as one slice
    pub fn live_words(&self) -> &[Word] {
        &self.words[self.sp..]
    }

    /// Make room for `extra` more words below `sp`, reallocating if needed.
    /// Fails with [`ContinuationError::ChunkExhausted`] without touching the
    /// chunk when the limit would be exceeded.
    pub(crate) fn ensure_room(&mut self, extra: usize, config: &ContinuationConfig) -> ContinuationResult<()> {
        if extra <= self.sp {
            return Ok(());
        }
        let used = self.used_words();
        let needed = used + extra;
        let limit = config.chunk_limit();
        if needed > limit {
            return Err(ContinuationError::ChunkExhausted { needed, max: limit });
        }

        let old_size = self.stack_size();
        let new_size = round_up(
            needed
                .max(old_size.saturating_mul(config.growth_factor.max(1)))
                .max(config.initial_chunk_words),
        )
        .min(limit);
        if old_size == 0 {
            log::debug!("allocating chunk of {new_size} words");
        } else {
            log::warn!("growing chunk from {old_size} to {new_size} words ({needed} needed)");
        }

        let mut words = vec![0; new_size];
        words[new_size - used..].copy_from_slice(&self.words[self.sp..]);
        self.words = words;
        self.sp += new_size - old_size;
        if old_size > 0 {
            self.growths += 1;
        }
        Ok(())
    }

    /// Publish new top-of-chunk metadata after frames were written
    pub(crate) fn publish(&mut self, sp: usize, argsize: usize, frames: usize) {
        self.sp = sp;
        self.argsize = argsize;
        self.frames = frames;
    }

    /// Drop all frames, keeping the storage
    pub(crate) fn clear(&mut self) {
        self.publish(self.stack_size(), 0, 0);
    }
}

impl Segment for StackChunk {
    #[inline]
    fn range(&self) -> Range<Address> {
        0..self.stack_size()
    }

    #[inline]
    fn words(&self, addr: Address, count: usize) -> ContinuationResult<&[Word]> {
        let range = slot_range(self.range(), addr, count)?;
        Ok(&self.words[range])
    }

    #[inline]
    fn words_mut(&mut self, addr: Address, count: usize) -> ContinuationResult<&mut [Word]> {
        let range = slot_range(self.range(), addr, count)?;
        Ok(&mut self.words[range])
    }
}

#[inline]
fn round_up(words: usize) -> usize {
    words.div_ceil(CHUNK_SIZE_ALIGNMENT_WORDS) * CHUNK_SIZE_ALIGNMENT_WORDS
}
