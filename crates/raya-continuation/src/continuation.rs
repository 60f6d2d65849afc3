//! Continuations and their entry frames

use std::sync::atomic::{AtomicU64, Ordering};

use crate::chunk::{SharedChunk, StackChunk};
use crate::code::CodeCache;
use crate::config::ContinuationConfig;
use crate::freeze::{self, FreezeResult};
use crate::gc::{self, RefSlot, ScanStats};
use crate::platform::Platform;
use crate::stack::MachineStack;
use crate::thaw::{self, ThawKind, ThawResult};
use crate::{Address, Pc, Word};

/// Unique identifier for a continuation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContinuationId(u64);

static NEXT_CONTINUATION_ID: AtomicU64 = AtomicU64::new(1);

impl ContinuationId {
    /// Generate a new unique ContinuationId
    pub fn new() -> Self {
        ContinuationId(NEXT_CONTINUATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for ContinuationId {
    fn default() -> Self {
        Self::new()
    }
}

/// The frame that entered the continuation
///
/// Frames above `sp` belong to the embedder. The continuation's oldest frame
/// returns to `pc` with `fp` restored; a compiled oldest frame takes its
/// stack arguments from `[sp, sp + argsize)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryFrame {
    /// Entry stack pointer
    pub sp: Address,
    /// Entry return pc
    pub pc: Pc,
    /// Entry frame pointer
    pub fp: Address,
    /// Words of outgoing argument area above `sp`
    pub argsize: usize,
}

impl EntryFrame {
    /// Create an entry frame
    pub fn new(sp: Address, pc: Pc, fp: Address, argsize: usize) -> Self {
        Self { sp, pc, fp, argsize }
    }
}

/// A suspendable execution: an entry frame plus its frozen tail
pub struct Continuation {
    id: ContinuationId,
    entry: EntryFrame,
    tail: SharedChunk,
    config: ContinuationConfig,
}

impl Continuation {
    /// Create a continuation entered at `entry`, with an empty tail
    pub fn new(entry: EntryFrame, config: ContinuationConfig) -> Self {
        Self {
            id: ContinuationId::new(),
            entry,
            tail: StackChunk::new().into_shared(),
            config,
        }
    }

    /// Get the continuation ID
    #[inline]
    pub fn id(&self) -> ContinuationId {
        self.id
    }

    /// Current entry frame
    #[inline]
    pub fn entry(&self) -> &EntryFrame {
        &self.entry
    }

    /// Mount on a new entry frame, possibly on another stack. Takes effect
    /// for the next thaw.
    pub fn set_entry(&mut self, entry: EntryFrame) {
        log::debug!(
            "continuation {} remounted: entry sp {:#x} -> {:#x}",
            self.id.as_u64(),
            self.entry.sp,
            entry.sp
        );
        self.entry = entry;
    }

    /// Configuration
    #[inline]
    pub fn config(&self) -> &ContinuationConfig {
        &self.config
    }

    /// Handle to the tail chunk, for GC readers
    #[inline]
    pub fn chunk(&self) -> SharedChunk {
        SharedChunk::clone(&self.tail)
    }

    /// Number of frozen frames
    pub fn num_frames(&self) -> usize {
        self.tail.read().num_frames()
    }

    /// Whether nothing is frozen
    pub fn is_empty(&self) -> bool {
        self.tail.read().is_empty()
    }

    /// Freeze the frames between `top_sp` and the entry frame
    pub fn freeze<P: Platform>(
        &mut self,
        stack: &MachineStack,
        code: &CodeCache,
        top_sp: Address,
    ) -> crate::ContinuationResult<FreezeResult> {
        let mut chunk = self.tail.write();
        freeze::freeze::<P>(&mut chunk, &self.entry, &self.config, stack, code, top_sp)
    }

    /// Thaw frames onto `stack` under the entry frame
    pub fn thaw<P: Platform>(
        &mut self,
        stack: &mut MachineStack,
        code: &CodeCache,
        kind: ThawKind,
    ) -> crate::ContinuationResult<ThawResult> {
        let mut chunk = self.tail.write();
        thaw::thaw::<P>(&mut chunk, &self.entry, &self.config, stack, code, kind)
    }

    /// Visit the references of the frozen frames, see [`gc::scan_for_gc`]
    pub fn scan_for_gc<P, V>(&self, code: &CodeCache, visitor: V) -> crate::ContinuationResult<ScanStats>
    where
        P: Platform,
        V: FnMut(&RefSlot) -> Option<Word>,
    {
        let mut chunk = self.tail.write();
        gc::scan_for_gc::<P, V>(&mut chunk, code, visitor)
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let chunk = self.tail.read();
        f.debug_struct("Continuation")
            .field("id", &self.id.as_u64())
            .field("entry", &self.entry)
            .field("frames", &chunk.num_frames())
            .field("chunk_words", &chunk.used_words())
            .finish()
    }
}
