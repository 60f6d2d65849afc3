//! Default values for continuation configuration and reserved code addresses.
//!
//! Kept in one place so the config layer, the code cache and the tests agree
//! on the same constants.

use crate::{Pc, Word};

/// Initial chunk capacity in words, allocated on the first freeze.
pub const DEFAULT_INITIAL_CHUNK_WORDS: usize = 256;

/// Upper bound for a single chunk in words (8 MiB of 64-bit words).
pub const DEFAULT_MAX_CHUNK_WORDS: usize = 1 << 20;

/// Multiplier applied to the chunk capacity when it has to grow.
pub const DEFAULT_GROWTH_FACTOR: usize = 2;

/// Chunk sizes are kept a multiple of this many words, so the parity of
/// every frame position relative to the chunk end survives growth.
pub const CHUNK_SIZE_ALIGNMENT_WORDS: usize = 2;

/// Marker written into back-links that must never be trusted.
pub const BAD_ADDRESS: Word = 0x0BAD_BAD0_BAD0_BAD0;

// ============================================================================
// Reserved code addresses
// ============================================================================

/// First pc of the interpreter's code. Interpreted frames resume at
/// `INTERPRETER_CODE_BEGIN + bci`.
pub const INTERPRETER_CODE_BEGIN: Pc = 0x1_0000;

/// One past the last interpreter pc.
pub const INTERPRETER_CODE_END: Pc = 0x9_0000;

/// Return address installed under the bottom thawed frame while older frames
/// remain frozen.
pub const RETURN_BARRIER_PC: Pc = 0xA_0000;

/// First pc handed out for continuation entry stubs.
pub const ENTRY_STUB_BEGIN: Pc = 0xB_0000;

/// Words reserved per entry stub.
pub const ENTRY_STUB_SIZE: Pc = 0x10;

/// First pc handed out for compiled code blobs.
pub const CODE_HEAP_BEGIN: Pc = 0x100_0000;

/// Bytes of code address space reserved per compiled blob.
pub const CODE_BLOB_SPAN: Pc = 0x1000;
