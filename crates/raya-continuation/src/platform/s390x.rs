//! z/Architecture frame convention
//!
//! Only compiled frames are handled here. Everything that touches
//! interpreter state reports [`Unsupported`](super::Unsupported).

use super::{FrameLayout, InterpreterLayout, PdOperation, Platform};
use crate::Word;

/// s390x backend, compiled frames only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct S390x;

impl Platform for S390x {
    const NAME: &'static str = "s390x";

    const LAYOUT: FrameLayout = FrameLayout {
        metadata_words: 2,
        link_offset: 0,
        return_addr_offset: 1,
        sender_sp_offset: 2,
        alignment_words: 2,
        interpreter: InterpreterLayout {
            sender_sp: -1,
            top_frame_sp: -2,
            method: -4,
            locals: -3,
            bcx: -5,
            monitor_block_top: -7,
            esp: -6,
            cache: -8,
            fixed_words: 8,
            monitor_words: 2,
        },
    };

    #[inline]
    fn supports(op: PdOperation) -> bool {
        match op {
            PdOperation::InterpretedFrame
            | PdOperation::RelativizeInterpreted
            | PdOperation::DerelativizeInterpreted
            | PdOperation::PatchSenderSp => false,
        }
    }

    #[inline]
    fn prefetch_chunk(_words: &[Word]) {}
}
