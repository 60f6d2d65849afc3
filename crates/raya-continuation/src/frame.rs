//! Frame views
//!
//! A [`Frame`] is a read-only cursor over one activation record, resident on
//! a [`MachineStack`](crate::MachineStack) or inside a
//! [`StackChunk`](crate::StackChunk). It records where the frame is, never
//! what is in it: contents are read through the frame-kind backend in
//! [`helper`](crate::helper).
//!
//! ```text
//!   sp            lowest word of the frame as seen by its callee
//!   unextended_sp lowest word the frame itself allocated
//!   fp            saved-link slot (fp + 1 holds the return pc)
//! ```
//!
//! `sp < unextended_sp` when a callee extended its caller: an interpreted
//! callee under a compiled caller, or a compiled callee aligned below an
//! interpreted caller.

use crate::code::{BlobId, CodeCache, MethodId};
use crate::platform::{PdOperation, Platform};
use crate::stack::Segment;
use crate::{offset, Address, ContinuationError, ContinuationResult, Pc};

/// Interpreted or compiled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Interpreted frame running `MethodId`
    Interpreted(MethodId),
    /// Compiled frame of `BlobId`
    Compiled(BlobId),
}

/// A view of one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Stack pointer as seen by the callee
    pub sp: Address,
    /// Stack pointer before any callee extension
    pub unextended_sp: Address,
    /// Frame pointer
    pub fp: Address,
    /// Resume pc
    pub pc: Pc,
    /// Interpreted or compiled
    pub kind: FrameKind,
    /// Interpreter fields are fp-relative (heap-resident frame)
    pub relativized: bool,
}

impl Frame {
    /// Whether this is an interpreted frame
    #[inline]
    pub fn is_interpreted(&self) -> bool {
        matches!(self.kind, FrameKind::Interpreted(_))
    }

    /// Whether this is a compiled frame
    #[inline]
    pub fn is_compiled(&self) -> bool {
        matches!(self.kind, FrameKind::Compiled(_))
    }

    /// Method of an interpreted frame
    #[inline]
    pub fn method(&self) -> Option<MethodId> {
        match self.kind {
            FrameKind::Interpreted(method) => Some(method),
            FrameKind::Compiled(_) => None,
        }
    }

    /// Blob of a compiled frame
    #[inline]
    pub fn blob(&self) -> Option<BlobId> {
        match self.kind {
            FrameKind::Compiled(blob) => Some(blob),
            FrameKind::Interpreted(_) => None,
        }
    }

    /// Build the view of the frame whose sp is `sp`.
    ///
    /// The frame's pc is read from below `sp`. Compiled frames take
    /// `unextended_sp` from the caller of this function (the callee knows
    /// it); interpreted frames read it from their own top-frame-sp slot.
    /// In a heap-resident segment the link and interpreter fields are read
    /// as fp-relative offsets.
    pub fn at<P: Platform, S: Segment + ?Sized>(
        segment: &S,
        code: &CodeCache,
        sp: Address,
        unextended_sp: Address,
        relativized: bool,
    ) -> ContinuationResult<Frame> {
        let layout = P::LAYOUT;
        let pc = segment.load(layout.pc_slot(sp))?;

        if code.is_interpreter_pc(pc) {
            P::require(PdOperation::InterpretedFrame)?;
            let link_slot = layout.link_slot(sp);
            let link = segment.load(link_slot)?;
            let fp = if relativized {
                offset(link_slot, link as isize)
            } else {
                crate::word_to_address(link)?
            };
            let slots = layout.interpreter;
            let method = MethodId::from_word(segment.load(offset(fp, slots.method))?)?;
            let raw_usp = segment.load(offset(fp, slots.top_frame_sp))?;
            let unextended_sp = if relativized {
                offset(fp, raw_usp as isize)
            } else {
                crate::word_to_address(raw_usp)?
            };
            return Ok(Frame {
                sp,
                unextended_sp,
                fp,
                pc,
                kind: FrameKind::Interpreted(method),
                relativized,
            });
        }

        let blob = code.find_blob(pc).ok_or_else(|| {
            ContinuationError::invariant(format!("pc {pc:#x} at sp {sp:#x} is not in any code blob"))
        })?;
        let size = code.blob(blob)?.frame_size;
        Ok(Frame {
            sp,
            unextended_sp,
            fp: layout.fp_for_sender_sp(unextended_sp + size),
            pc,
            kind: FrameKind::Compiled(blob),
            relativized,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Amd64;
    use crate::{CodeBlob, MachineStack};

    #[test]
    fn test_compiled_view() {
        let mut code = CodeCache::new();
        let blob = code.register_blob(CodeBlob::new("c", 6, 0)).unwrap();
        let pc = code.blob(blob).unwrap().pc_at(4);

        let mut stack = MachineStack::new(0, 64);
        stack.store(39, pc).unwrap();
        let frame = Frame::at::<Amd64, _>(&stack, &code, 40, 40, false).unwrap();
        assert!(frame.is_compiled());
        assert_eq!(frame.fp, 44);
        assert_eq!(frame.blob(), Some(blob));
        assert_eq!(frame.method(), None);
    }

    #[test]
    fn test_unknown_pc() {
        let code = CodeCache::new();
        let mut stack = MachineStack::new(0, 64);
        stack.store(39, 0x42).unwrap();
        let err = Frame::at::<Amd64, _>(&stack, &code, 40, 40, false).unwrap_err();
        assert!(matches!(err, ContinuationError::InvariantViolation(_)));
    }

    #[test]
    fn test_interpreted_view_on_s390x_is_unsupported() {
        let code = CodeCache::new();
        let mut stack = MachineStack::new(0, 64);
        stack.store(39, code.interpreter_pc(0)).unwrap();
        let err = Frame::at::<crate::S390x, _>(&stack, &code, 40, 40, false).unwrap_err();
        assert!(matches!(err, ContinuationError::Unsupported(_)));
    }
}
