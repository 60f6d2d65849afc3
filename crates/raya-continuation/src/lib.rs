//! Raya Continuation Stacks
//!
//! This crate captures and restores the machine stack of a suspended
//! continuation:
//! - **Freeze** copies the live frames between a suspend point and the
//!   continuation's entry frame into a relocatable heap [`StackChunk`]
//! - **Thaw** moves frames back from the chunk onto a (possibly different)
//!   [`MachineStack`] and relinks them
//! - **Chunk frame stream** walks the frozen frames without a live stack,
//!   which is what the garbage collector uses to scan them
//!
//! Frames are either interpreted (locals, monitors and an operand stack,
//! described by fp-relative bookkeeping slots) or compiled (fixed size,
//! described by a [`CodeBlob`]). Every stack segment is a word arena, so all
//! frame references are word indices and relocation never leaves a dangling
//! pointer behind.
//!
//! # Example
//!
//! ```ignore
//! use raya_continuation::*;
//!
//! let mut code = CodeCache::new();
//! let blob = code.register_blob(CodeBlob::new("work", 6, 0))?;
//!
//! let mut stack = MachineStack::new(0x1000, 4096);
//! let entry = EntryFrame::new(stack.end() - 16, code.new_entry_pc(), stack.end() - 8, 0);
//! let mut builder = StackBuilder::<NativePlatform>::new(&mut stack, &code, entry)?;
//! builder.push_compiled(blob, 0, &[], &[1, 2, 3])?;
//! let top = builder.suspend()?;
//!
//! let mut cont = Continuation::new(entry, ContinuationConfig::default());
//! cont.freeze::<NativePlatform>(&stack, &code, top)?;
//! let resumed = cont.thaw::<NativePlatform>(&mut stack, &code, ThawKind::All)?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Return a [`ContinuationError::InvariantViolation`] unless `$cond` holds.
macro_rules! ensure_invariant {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err($crate::ContinuationError::InvariantViolation(format!($($arg)*)));
        }
    };
}

pub mod builder;
pub mod chunk;
pub mod code;
pub mod config;
pub mod continuation;
pub mod defaults;
pub mod frame;
pub mod freeze;
pub mod gc;
pub mod helper;
pub mod inspect;
pub mod patch;
pub mod platform;
pub mod register_map;
pub mod relativize;
pub mod stack;
pub mod thaw;
pub mod verify;
pub mod walker;

pub use builder::StackBuilder;
pub use chunk::{ChunkFrameStream, ChunkStats, SharedChunk, StackChunk};
pub use code::{
    BlobId, CodeBlob, CodeCache, InterpreterOopMask, Method, MethodId, OopMap, OopSlot, VMReg,
};
pub use config::ContinuationConfig;
pub use continuation::{Continuation, ContinuationId, EntryFrame};
pub use frame::{Frame, FrameKind};
pub use freeze::FreezeResult;
pub use gc::{RefKind, RefSlot, ScanStats};
pub use inspect::LogicalFrame;
pub use platform::{Amd64, FrameLayout, NativePlatform, PdOperation, PdResult, Platform, S390x, Unsupported};
pub use register_map::RegisterMap;
pub use stack::{MachineStack, Segment};
pub use thaw::{ThawKind, ThawResult};

/// A machine word.
pub type Word = i64;

/// A word index inside a stack segment or chunk buffer.
pub type Address = usize;

/// A code address.
pub type Pc = Word;

/// Freeze/thaw errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContinuationError {
    /// The selected platform backend has no implementation for this path
    #[error(transparent)]
    Unsupported(#[from] Unsupported),

    /// A frame, chunk or link failed a consistency check
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// The chunk cannot grow enough to hold the frozen frames
    #[error("Chunk exhausted: need {needed} words, limit is {max}")]
    ChunkExhausted {
        /// Words the chunk would have to hold
        needed: usize,
        /// Configured chunk limit in words
        max: usize,
    },

    /// The destination stack cannot hold the thawed frames
    #[error("Stack overflow: need {needed} words below {sp:#x}, stack limit is {limit:#x}")]
    StackOverflow {
        /// Words the thaw would occupy
        needed: usize,
        /// Entry stack pointer the frames are placed under
        sp: Address,
        /// Lowest usable address of the destination stack
        limit: Address,
    },
}

impl ContinuationError {
    /// Whether the caller can fall back (bounded thaw, slow path) instead of
    /// treating the error as fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ContinuationError::ChunkExhausted { .. } | ContinuationError::StackOverflow { .. }
        )
    }

    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        ContinuationError::InvariantViolation(message.into())
    }
}

/// Freeze/thaw result
pub type ContinuationResult<T> = Result<T, ContinuationError>;

/// Convert a stored word into an address, rejecting negative values.
#[inline]
pub(crate) fn word_to_address(value: Word) -> ContinuationResult<Address> {
    usize::try_from(value)
        .map_err(|_| ContinuationError::invariant(format!("word {value:#x} is not an address")))
}

/// Address arithmetic with a signed word offset.
#[inline]
pub(crate) fn offset(addr: Address, words: isize) -> Address {
    addr.wrapping_add_signed(words)
}
