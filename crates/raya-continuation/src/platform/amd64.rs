//! x86-64 frame convention
//!
//! Frame pointers are 16-byte (two word) aligned, the link sits at fp and
//! the return address right above it. The interpreter keeps eight words of
//! state below fp.

use super::{FrameLayout, InterpreterLayout, PdOperation, Platform};
use crate::Word;

/// x86-64 backend, with interpreted and compiled frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Amd64;

impl Platform for Amd64 {
    const NAME: &'static str = "amd64";

    const LAYOUT: FrameLayout = FrameLayout {
        metadata_words: 2,
        link_offset: 0,
        return_addr_offset: 1,
        sender_sp_offset: 2,
        alignment_words: 2,
        interpreter: InterpreterLayout {
            sender_sp: -1,
            top_frame_sp: -2,
            method: -3,
            locals: -4,
            bcx: -5,
            monitor_block_top: -6,
            esp: -7,
            cache: -8,
            fixed_words: 8,
            monitor_words: 2,
        },
    };

    #[inline]
    fn supports(_op: PdOperation) -> bool {
        true
    }

    #[inline]
    fn prefetch_chunk(words: &[Word]) {
        // Thaw copies from the chunk end downward: hint the last two lines.
        #[cfg(target_arch = "x86_64")]
        {
            use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};

            const WORDS_PER_LINE: usize = 8;
            for back in [1, WORDS_PER_LINE + 1] {
                if let Some(word) = words.len().checked_sub(back).and_then(|i| words.get(i)) {
                    // SAFETY: prefetch does not access memory architecturally
                    // and the pointer comes from a live slice element.
                    unsafe { _mm_prefetch::<_MM_HINT_T0>((word as *const Word).cast::<i8>()) }
                }
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = words;
    }
}
