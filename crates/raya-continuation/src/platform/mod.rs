//! Per-architecture frame conventions
//!
//! The freeze and thaw engines are generic over a [`Platform`], a zero-sized
//! type carrying the frame-layout constants of one calling convention family
//! plus the few operations that differ between architectures. The native
//! backend is picked at build time through [`NativePlatform`].
//!
//! # Frame Metadata
//!
//! ```text
//!            ┌──────────────────────┐
//!            │ caller ...           │
//!            ├──────────────────────┤ ← sender sp  (fp + sender_sp_offset)
//!            │ return pc            │   fp + return_addr_offset
//!            │ saved link           │ ← fp (fp + link_offset)
//!            │ frame body ...       │
//!            └──────────────────────┘ ← sp
//! ```
//!
//! A backend that cannot handle a path reports it through [`Unsupported`]
//! instead of aborting, so callers can reject such configurations up front.

use std::fmt;

use crate::{Address, Word};

pub mod amd64;
pub mod s390x;

pub use amd64::Amd64;
pub use s390x::S390x;

/// Backend compiled for the current target.
#[cfg(target_arch = "s390x")]
pub type NativePlatform = S390x;

/// Backend compiled for the current target.
#[cfg(not(target_arch = "s390x"))]
pub type NativePlatform = Amd64;

/// Interpreter frame slots, as word offsets from the frame's fp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpreterLayout {
    /// Saved sender sp (the caller's unextended sp)
    pub sender_sp: isize,
    /// Unextended sp of this frame
    pub top_frame_sp: isize,
    /// Method id
    pub method: isize,
    /// Address of local 0
    pub locals: isize,
    /// Bytecode index
    pub bcx: isize,
    /// Lowest word of the monitor block
    pub monitor_block_top: isize,
    /// Operand stack top (inclusive)
    pub esp: isize,
    /// Constant pool cache id
    pub cache: isize,
    /// Words of fixed state below fp
    pub fixed_words: usize,
    /// Words per monitor record (object, lock word)
    pub monitor_words: usize,
}

impl InterpreterLayout {
    /// Exclusive upper end of the monitor block, relative to fp.
    #[inline]
    pub const fn monitor_block_bottom(&self) -> isize {
        -(self.fixed_words as isize)
    }
}

/// Frame-layout contract of one calling convention family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    /// Words of metadata (link + return pc) between a frame and its caller
    pub metadata_words: usize,
    /// Saved link slot, relative to fp
    pub link_offset: isize,
    /// Return address slot, relative to fp
    pub return_addr_offset: isize,
    /// Sender sp, relative to fp
    pub sender_sp_offset: isize,
    /// Required frame pointer alignment in words
    pub alignment_words: usize,
    /// Interpreter frame slots
    pub interpreter: InterpreterLayout,
}

impl FrameLayout {
    /// Slot holding the link of the frame whose sp is `sp`. The slot lies
    /// below `sp` and is written by that frame's callee.
    #[inline]
    pub const fn link_slot(&self, sp: Address) -> Address {
        sp.wrapping_add_signed(self.link_offset - self.sender_sp_offset)
    }

    /// Slot holding the pc of the frame whose sp is `sp`.
    #[inline]
    pub const fn pc_slot(&self, sp: Address) -> Address {
        sp.wrapping_add_signed(self.return_addr_offset - self.sender_sp_offset)
    }

    /// Frame pointer of a frame whose sender sp is `sender_sp`.
    #[inline]
    pub const fn fp_for_sender_sp(&self, sender_sp: Address) -> Address {
        sender_sp.wrapping_add_signed(self.link_offset - self.sender_sp_offset)
    }
}

/// Backend paths that an architecture may leave unimplemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PdOperation {
    /// Building or walking interpreted frames
    InterpretedFrame,
    /// Converting interpreter fields to fp-relative form
    RelativizeInterpreted,
    /// Converting interpreter fields back to absolute form
    DerelativizeInterpreted,
    /// Writing the saved sender sp of an interpreted frame
    PatchSenderSp,
}

impl fmt::Display for PdOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PdOperation::InterpretedFrame => "interpreted frame",
            PdOperation::RelativizeInterpreted => "relativize_interpreted_frame_metadata",
            PdOperation::DerelativizeInterpreted => "derelativize_interpreted_frame_metadata",
            PdOperation::PatchSenderSp => "patch_sender_sp",
        };
        f.write_str(name)
    }
}

/// A backend path with no implementation on this platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{operation} is not supported on {platform}")]
pub struct Unsupported {
    /// Platform name
    pub platform: &'static str,
    /// The missing path
    pub operation: PdOperation,
}

/// Result of a platform-dependent operation.
pub type PdResult<T> = Result<T, Unsupported>;

/// Per-architecture capability set.
pub trait Platform: Copy + Default + Send + Sync + 'static {
    /// Architecture name used in diagnostics
    const NAME: &'static str;

    /// Frame-layout constants
    const LAYOUT: FrameLayout;

    /// Whether `op` is implemented.
    fn supports(op: PdOperation) -> bool;

    /// `Ok(())` when `op` is implemented, otherwise [`Unsupported`].
    fn require(op: PdOperation) -> PdResult<()> {
        if Self::supports(op) {
            Ok(())
        } else {
            Err(Unsupported {
                platform: Self::NAME,
                operation: op,
            })
        }
    }

    /// Padding words needed after `words` so the next frame stays aligned.
    #[inline]
    fn frame_align_words(words: usize) -> usize {
        let align = Self::LAYOUT.alignment_words;
        (align - words % align) % align
    }

    /// Align `addr` down to the frame alignment.
    #[inline]
    fn frame_align_pointer(addr: Address) -> Address {
        addr - addr % Self::LAYOUT.alignment_words
    }

    /// Whether `addr` satisfies the frame alignment.
    #[inline]
    fn is_aligned(addr: Address) -> bool {
        addr % Self::LAYOUT.alignment_words == 0
    }

    /// Hint that `words` (the live part of a chunk) is about to be copied.
    fn prefetch_chunk(words: &[Word]);
}
