//! Frame-kind backend
//!
//! Size and slot queries for the two frame kinds, written once against the
//! [`Platform`] layout constants. Every query works on either segment kind:
//! heap-resident frames (`Frame::relativized`) keep interpreter pointers as
//! fp-relative offsets, machine-resident frames keep absolute addresses.
//!
//! # Interpreted Frame
//!
//! ```text
//! ┌─────────────────────────────┐ ← frame_bottom (locals + 1)
//! │ local 0 .. local n-1        │   local i at locals - i
//! │ (alignment padding)         │
//! ├─────────────────────────────┤ ← fp + 2 (sender sp as seen from here)
//! │ return pc                   │   fp + 1
//! │ saved link                  │   fp
//! │ saved sender sp             │   fp - 1
//! │ top frame sp                │   fp - 2
//! │ method                      │   fp - 3
//! │ locals                      │   fp - 4
//! │ bcx                         │   fp - 5
//! │ monitor block top           │   fp - 6
//! │ esp                         │   fp - 7
//! │ cache                       │   fp - 8
//! ├─────────────────────────────┤
//! │ monitors (object, lock)     │
//! ├─────────────────────────────┤ ← monitor block top
//! │ operand stack               │
//! └─────────────────────────────┘ ← esp == unextended sp
//! ```
//! (offsets shown for [`Amd64`](crate::Amd64))
//!
//! # Compiled Frame
//!
//! ```text
//! ┌─────────────────────────────┐ ← sender sp + stack args
//! │ incoming stack args         │
//! ├─────────────────────────────┤ ← sender sp (unextended sp + size)
//! │ return pc / saved link      │
//! │ body (spills, outgoing args)│
//! └─────────────────────────────┘ ← unextended sp
//! ```

use std::marker::PhantomData;

use crate::code::CodeCache;
use crate::frame::Frame;
use crate::platform::{PdOperation, Platform};
use crate::stack::Segment;
use crate::{offset, word_to_address, Address, ContinuationError, ContinuationResult, Word};

/// Sentinel returned by [`overlap_argsize`] when caller and callee do not
/// share parameter words.
pub const NO_OVERLAP: usize = 0;

/// Operations common to both frame kinds.
pub trait FrameKindOps {
    /// Whether `frame` is of this kind
    fn is_instance(frame: &Frame) -> bool;

    /// Words the frame occupies, without its incoming stack arguments
    fn size<S: Segment + ?Sized>(segment: &S, code: &CodeCache, frame: &Frame) -> ContinuationResult<usize>;

    /// Words of caller-visible argument area
    fn stack_argsize(code: &CodeCache, frame: &Frame) -> ContinuationResult<usize>;
}

/// Interpreted frame queries
pub struct InterpretedFrame<P>(PhantomData<P>);

/// Compiled frame queries
pub struct CompiledFrame<P>(PhantomData<P>);

impl<P: Platform> FrameKindOps for InterpretedFrame<P> {
    #[inline]
    fn is_instance(frame: &Frame) -> bool {
        frame.is_interpreted()
    }

    fn size<S: Segment + ?Sized>(segment: &S, _code: &CodeCache, frame: &Frame) -> ContinuationResult<usize> {
        let bottom = Self::frame_bottom(segment, frame)?;
        bottom.checked_sub(frame.unextended_sp).ok_or_else(|| {
            ContinuationError::invariant(format!(
                "interpreted frame at {:#x}: locals end {bottom:#x} below its sp",
                frame.unextended_sp
            ))
        })
    }

    fn stack_argsize(code: &CodeCache, frame: &Frame) -> ContinuationResult<usize> {
        let method = frame
            .method()
            .ok_or_else(|| ContinuationError::invariant("compiled frame passed as interpreted"))?;
        Ok(code.method(method)?.size_of_parameters)
    }
}

impl<P: Platform> InterpretedFrame<P> {
    /// Address of the slot `offset` words from fp
    #[inline]
    pub fn slot(frame: &Frame, slot_offset: isize) -> Address {
        offset(frame.fp, slot_offset)
    }

    /// Read a pointer field, returning it in absolute form
    pub fn field<S: Segment + ?Sized>(segment: &S, frame: &Frame, slot_offset: isize) -> ContinuationResult<Address> {
        let raw = segment.load(Self::slot(frame, slot_offset))?;
        if frame.relativized {
            Ok(offset(frame.fp, raw as isize))
        } else {
            word_to_address(raw)
        }
    }

    /// Write a pointer field in the frame's current form
    pub fn set_field<S: Segment + ?Sized>(
        segment: &mut S,
        frame: &Frame,
        slot_offset: isize,
        value: Address,
    ) -> ContinuationResult<()> {
        let raw = if frame.relativized {
            value as Word - frame.fp as Word
        } else {
            value as Word
        };
        segment.store(Self::slot(frame, slot_offset), raw)
    }

    /// Address of local 0
    #[inline]
    pub fn locals<S: Segment + ?Sized>(segment: &S, frame: &Frame) -> ContinuationResult<Address> {
        Self::field(segment, frame, P::LAYOUT.interpreter.locals)
    }

    /// Top of the operand stack (inclusive)
    #[inline]
    pub fn esp<S: Segment + ?Sized>(segment: &S, frame: &Frame) -> ContinuationResult<Address> {
        Self::field(segment, frame, P::LAYOUT.interpreter.esp)
    }

    /// Lowest word of the monitor block
    #[inline]
    pub fn monitor_top<S: Segment + ?Sized>(segment: &S, frame: &Frame) -> ContinuationResult<Address> {
        Self::field(segment, frame, P::LAYOUT.interpreter.monitor_block_top)
    }

    /// Saved sender sp (the caller's unextended sp)
    #[inline]
    pub fn saved_sender_sp<S: Segment + ?Sized>(segment: &S, frame: &Frame) -> ContinuationResult<Address> {
        Self::field(segment, frame, P::LAYOUT.interpreter.sender_sp)
    }

    /// Bytecode index
    pub fn bci<S: Segment + ?Sized>(segment: &S, frame: &Frame) -> ContinuationResult<u32> {
        let raw = segment.load(Self::slot(frame, P::LAYOUT.interpreter.bcx))?;
        u32::try_from(raw).map_err(|_| ContinuationError::invariant(format!("bad bci {raw:#x}")))
    }

    /// One past the highest local
    #[inline]
    pub fn frame_bottom<S: Segment + ?Sized>(segment: &S, frame: &Frame) -> ContinuationResult<Address> {
        Ok(Self::locals(segment, frame)? + 1)
    }

    /// Lowest word to copy. `callee_overlap` is the callee's
    /// [`overlap_argsize`]: those top operands travel with the callee.
    #[inline]
    pub fn frame_top(frame: &Frame, callee_overlap: usize) -> Address {
        frame.unextended_sp + callee_overlap
    }

    /// Sender sp as seen from this frame (possibly extended)
    #[inline]
    pub fn sender_sp(frame: &Frame) -> Address {
        offset(frame.fp, P::LAYOUT.sender_sp_offset)
    }

    /// Slot holding this frame's return pc
    #[inline]
    pub fn return_pc_address(frame: &Frame) -> Address {
        offset(frame.fp, P::LAYOUT.return_addr_offset)
    }

    /// Slot holding the caller's fp
    #[inline]
    pub fn link_address(frame: &Frame) -> Address {
        offset(frame.fp, P::LAYOUT.link_offset)
    }

    /// Record the caller's unextended sp in the saved-sender-sp slot
    pub fn patch_sender_sp<S: Segment + ?Sized>(
        segment: &mut S,
        frame: &Frame,
        caller_unextended_sp: Address,
    ) -> ContinuationResult<()> {
        P::require(PdOperation::PatchSenderSp)?;
        Self::set_field(segment, frame, P::LAYOUT.interpreter.sender_sp, caller_unextended_sp)
    }

    /// Number of monitor records
    pub fn monitor_count<S: Segment + ?Sized>(segment: &S, frame: &Frame) -> ContinuationResult<usize> {
        let slots = P::LAYOUT.interpreter;
        let block_bottom = offset(frame.fp, slots.monitor_block_bottom());
        let top = Self::monitor_top(segment, frame)?;
        ensure_invariant!(
            top <= block_bottom && (block_bottom - top) % slots.monitor_words == 0,
            "monitor block top {top:#x} inconsistent with fp {:#x}",
            frame.fp
        );
        Ok((block_bottom - top) / slots.monitor_words)
    }

    /// Address of monitor record `index`, 0 being the oldest
    #[inline]
    pub fn monitor_address(frame: &Frame, index: usize) -> Address {
        let slots = P::LAYOUT.interpreter;
        offset(frame.fp, slots.monitor_block_bottom()) - (index + 1) * slots.monitor_words
    }

    /// Number of operand stack words
    pub fn operand_depth<S: Segment + ?Sized>(segment: &S, frame: &Frame) -> ContinuationResult<usize> {
        let top = Self::monitor_top(segment, frame)?;
        let esp = Self::esp(segment, frame)?;
        top.checked_sub(esp)
            .ok_or_else(|| ContinuationError::invariant(format!("esp {esp:#x} above monitor block {top:#x}")))
    }

    /// Address of operand `depth`, 0 being the deepest
    pub fn operand_address<S: Segment + ?Sized>(segment: &S, frame: &Frame, depth: usize) -> ContinuationResult<Address> {
        Ok(Self::monitor_top(segment, frame)? - 1 - depth)
    }

    /// Address of local `index`
    pub fn local_address<S: Segment + ?Sized>(segment: &S, frame: &Frame, index: usize) -> ContinuationResult<Address> {
        Self::locals(segment, frame)?
            .checked_sub(index)
            .ok_or_else(|| ContinuationError::invariant(format!("local {index} below segment start")))
    }

    /// Place an interpreted frame of `size` words (fp at `fp_from_top` words
    /// above its unextended sp) under `caller`. Returns the new unextended sp.
    ///
    /// `overlap` is the frame's [`overlap_argsize`] under `caller`: the
    /// caller's top operand words that are the frame's parameters. Frames
    /// placed without parameter overlap are shifted down one word when
    /// needed to keep fp aligned.
    pub fn place(caller: &Caller, overlap: usize, size: usize, fp_from_top: usize) -> ContinuationResult<Address> {
        let bottom = match caller {
            Caller::Frame(f) => f.unextended_sp + overlap,
            Caller::Entry { sp } | Caller::Barrier { sp } => *sp,
            Caller::ChunkEnd { end } => *end,
        };
        let mut top = bottom
            .checked_sub(size)
            .ok_or_else(|| ContinuationError::invariant(format!("no room for {size} words below {bottom:#x}")))?;
        if !P::is_aligned(top + fp_from_top) {
            ensure_invariant!(
                !caller.overlaps_parameters(),
                "overlapping interpreted frame at {top:#x} would have a misaligned fp"
            );
            top -= 1;
        }
        Ok(top)
    }
}

impl<P: Platform> FrameKindOps for CompiledFrame<P> {
    #[inline]
    fn is_instance(frame: &Frame) -> bool {
        frame.is_compiled()
    }

    fn size<S: Segment + ?Sized>(_segment: &S, code: &CodeCache, frame: &Frame) -> ContinuationResult<usize> {
        Ok(Self::blob(code, frame)?.frame_size)
    }

    fn stack_argsize(code: &CodeCache, frame: &Frame) -> ContinuationResult<usize> {
        Ok(Self::blob(code, frame)?.stack_argsize)
    }
}

impl<P: Platform> CompiledFrame<P> {
    fn blob<'a>(code: &'a CodeCache, frame: &Frame) -> ContinuationResult<&'a crate::CodeBlob> {
        let blob = frame
            .blob()
            .ok_or_else(|| ContinuationError::invariant("interpreted frame passed as compiled"))?;
        code.blob(blob)
    }

    /// Lowest word to copy
    #[inline]
    pub fn frame_top(frame: &Frame) -> Address {
        frame.unextended_sp
    }

    /// One past the incoming stack arguments
    pub fn frame_bottom(code: &CodeCache, frame: &Frame) -> ContinuationResult<Address> {
        let blob = Self::blob(code, frame)?;
        Ok(frame.unextended_sp + blob.frame_size + blob.stack_argsize)
    }

    /// Sender sp (unextended sp + frame size)
    pub fn sender_sp(code: &CodeCache, frame: &Frame) -> ContinuationResult<Address> {
        Ok(frame.unextended_sp + Self::blob(code, frame)?.frame_size)
    }

    /// Slot holding this frame's return pc
    pub fn return_pc_address(code: &CodeCache, frame: &Frame) -> ContinuationResult<Address> {
        Ok(P::LAYOUT.pc_slot(Self::sender_sp(code, frame)?))
    }

    /// Slot holding the caller's fp
    pub fn link_address(code: &CodeCache, frame: &Frame) -> ContinuationResult<Address> {
        Ok(P::LAYOUT.link_slot(Self::sender_sp(code, frame)?))
    }

    /// Sender sp for a compiled frame with `argsize` words of stack
    /// arguments placed under `caller`. Compiled callees of interpreted
    /// code, and frames that cannot use their caller's outgoing area, sit
    /// below the arguments with alignment padding.
    pub fn place(caller: &Caller, argsize: usize) -> ContinuationResult<Address> {
        let below = |sp: Address| {
            sp.checked_sub(argsize)
                .map(P::frame_align_pointer)
                .ok_or_else(|| ContinuationError::invariant(format!("no room for {argsize} args below {sp:#x}")))
        };
        match caller {
            Caller::Frame(f) if f.is_interpreted() => below(f.unextended_sp),
            Caller::Frame(f) => Ok(f.unextended_sp),
            Caller::Entry { sp } => Ok(*sp),
            Caller::Barrier { sp } => below(*sp),
            Caller::ChunkEnd { end } => below(*end),
        }
    }
}

/// What a frame being placed sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    /// An already placed frame in the same segment
    Frame(Frame),
    /// The continuation's entry frame, under its oldest frame
    Entry {
        /// Entry sp
        sp: Address,
    },
    /// The return barrier, under a frame whose caller stays frozen
    Barrier {
        /// Entry sp
        sp: Address,
    },
    /// The end of an empty chunk
    ChunkEnd {
        /// Chunk stack size
        end: Address,
    },
}

impl Caller {
    /// Whether an interpreted callee shares its parameter words with this
    /// caller
    #[inline]
    pub fn overlaps_parameters(&self) -> bool {
        match self {
            Caller::Frame(f) => f.is_interpreted(),
            Caller::ChunkEnd { .. } => true,
            Caller::Entry { .. } | Caller::Barrier { .. } => false,
        }
    }

    /// Unextended sp of the caller, recorded as a callee's saved sender sp
    #[inline]
    pub fn unextended_sp(&self) -> Address {
        match self {
            Caller::Frame(f) => f.unextended_sp,
            Caller::Entry { sp } | Caller::Barrier { sp } => *sp,
            Caller::ChunkEnd { end } => *end,
        }
    }
}

/// Frame size of either kind
pub fn frame_size<P: Platform, S: Segment + ?Sized>(
    segment: &S,
    code: &CodeCache,
    frame: &Frame,
) -> ContinuationResult<usize> {
    if InterpretedFrame::<P>::is_instance(frame) {
        InterpretedFrame::<P>::size(segment, code, frame)
    } else {
        CompiledFrame::<P>::size(segment, code, frame)
    }
}

/// Stack argument size of either kind
pub fn stack_argsize<P: Platform>(code: &CodeCache, frame: &Frame) -> ContinuationResult<usize> {
    if InterpretedFrame::<P>::is_instance(frame) {
        InterpretedFrame::<P>::stack_argsize(code, frame)
    } else {
        CompiledFrame::<P>::stack_argsize(code, frame)
    }
}

/// Parameter words `callee` shares with its caller: the callee's parameter
/// count when it is interpreted and the caller is interpreted or the empty
/// chunk end, [`NO_OVERLAP`] otherwise.
pub fn overlap_argsize<P: Platform>(
    caller_overlaps: bool,
    code: &CodeCache,
    callee: &Frame,
) -> ContinuationResult<usize> {
    if caller_overlaps && callee.is_interpreted() {
        InterpretedFrame::<P>::stack_argsize(code, callee)
    } else {
        Ok(NO_OVERLAP)
    }
}

/// `(sp, unextended_sp)` of the frame that called `frame`
pub fn sender_position<P: Platform, S: Segment + ?Sized>(
    segment: &S,
    code: &CodeCache,
    frame: &Frame,
) -> ContinuationResult<(Address, Address)> {
    if frame.is_interpreted() {
        let sp = InterpretedFrame::<P>::sender_sp(frame);
        let unextended_sp = InterpretedFrame::<P>::saved_sender_sp(segment, frame)?;
        Ok((sp, unextended_sp))
    } else {
        let sp = CompiledFrame::<P>::sender_sp(code, frame)?;
        Ok((sp, sp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CodeBlob, Method};
    use crate::frame::FrameKind;
    use crate::platform::Amd64;
    use crate::MachineStack;

    type I = InterpretedFrame<Amd64>;
    type C = CompiledFrame<Amd64>;

    fn interpreted_frame(code: &mut CodeCache, k: usize) -> Frame {
        let method = code.register_method(Method::new("m", k, k + 1));
        Frame {
            sp: 20,
            unextended_sp: 20,
            fp: 30,
            pc: code.interpreter_pc(0),
            kind: FrameKind::Interpreted(method),
            relativized: false,
        }
    }

    #[test]
    fn test_field_forms() {
        let mut code = CodeCache::new();
        let mut frame = interpreted_frame(&mut code, 1);
        let mut stack = MachineStack::new(0, 64);

        I::set_field(&mut stack, &frame, -4, 40).unwrap();
        assert_eq!(stack.load(26).unwrap(), 40);
        assert_eq!(I::locals(&stack, &frame).unwrap(), 40);

        frame.relativized = true;
        I::set_field(&mut stack, &frame, -4, 40).unwrap();
        assert_eq!(stack.load(26).unwrap(), 10);
        assert_eq!(I::locals(&stack, &frame).unwrap(), 40);
        assert_eq!(I::frame_bottom(&stack, &frame).unwrap(), 41);
        assert_eq!(I::size(&stack, &code, &frame).unwrap(), 21);
    }

    #[test]
    fn test_frame_top_excludes_interpreted_callee_args() {
        let mut code = CodeCache::new();
        let frame = interpreted_frame(&mut code, 0);
        let callee = interpreted_frame(&mut code, 3);
        let overlap = overlap_argsize::<Amd64>(true, &code, &callee).unwrap();
        assert_eq!(I::frame_top(&frame, overlap), 23);
        assert_eq!(I::frame_top(&frame, NO_OVERLAP), 20);
    }

    #[test]
    fn test_overlap_argsize() {
        let mut code = CodeCache::new();
        let callee = interpreted_frame(&mut code, 3);
        let blob = code.register_blob(CodeBlob::new("c", 6, 2)).unwrap();
        let compiled = Frame {
            kind: FrameKind::Compiled(blob),
            ..callee
        };

        assert_eq!(overlap_argsize::<Amd64>(true, &code, &callee).unwrap(), 3);
        assert_eq!(overlap_argsize::<Amd64>(false, &code, &callee).unwrap(), NO_OVERLAP);
        assert_eq!(overlap_argsize::<Amd64>(true, &code, &compiled).unwrap(), NO_OVERLAP);
        assert_eq!(stack_argsize::<Amd64>(&code, &callee).unwrap(), 3);
        assert_eq!(stack_argsize::<Amd64>(&code, &compiled).unwrap(), 2);
    }

    #[test]
    fn test_overlap_decides_placement() {
        let mut code = CodeCache::new();
        let callee = interpreted_frame(&mut code, 2);
        let blob = code.register_blob(CodeBlob::new("c", 6, 0)).unwrap();
        let interp_caller = Frame {
            sp: 40,
            unextended_sp: 40,
            fp: 50,
            ..callee
        };
        let compiled_caller = Frame {
            kind: FrameKind::Compiled(blob),
            ..interp_caller
        };

        // the callee's bottom sits k words into an interpreted caller only
        let place = |caller: Caller| {
            let overlap = overlap_argsize::<Amd64>(caller.overlaps_parameters(), &code, &callee).unwrap();
            (overlap, I::place(&caller, overlap, 12, 6).unwrap() + 12)
        };
        assert_eq!(place(Caller::Frame(interp_caller)), (2, 42));
        assert_eq!(place(Caller::Frame(compiled_caller)), (NO_OVERLAP, 40));
        assert_eq!(place(Caller::Entry { sp: 100 }), (NO_OVERLAP, 100));
        assert_eq!(place(Caller::Barrier { sp: 100 }), (NO_OVERLAP, 100));
    }

    #[test]
    fn test_compiled_placement() {
        let mut code = CodeCache::new();
        let interp = interpreted_frame(&mut code, 0);
        let blob = code.register_blob(CodeBlob::new("c", 6, 3)).unwrap();
        let compiled = Frame {
            unextended_sp: 50,
            sp: 50,
            kind: FrameKind::Compiled(blob),
            ..interp
        };

        assert_eq!(C::place(&Caller::Frame(compiled), 3).unwrap(), 50);
        let under_interp = Frame { unextended_sp: 51, ..interp };
        assert_eq!(C::place(&Caller::Frame(under_interp), 3).unwrap(), 48);
        assert_eq!(C::place(&Caller::Entry { sp: 100 }, 3).unwrap(), 100);
        assert_eq!(C::place(&Caller::Barrier { sp: 100 }, 3).unwrap(), 96);
        assert_eq!(C::place(&Caller::ChunkEnd { end: 100 }, 3).unwrap(), 96);
        assert_eq!(C::place(&Caller::ChunkEnd { end: 100 }, 4).unwrap(), 96);
    }

    #[test]
    fn test_interpreted_placement() {
        let mut code = CodeCache::new();
        let caller = interpreted_frame(&mut code, 0);

        // overlap keeps parity: bottom 22 - size 12 = 10, fp at 10 + 6 = 16
        assert_eq!(I::place(&Caller::Frame(caller), 2, 12, 6).unwrap(), 10);
        // misaligned with overlap is a bug
        assert!(I::place(&Caller::Frame(caller), 2, 12, 5).is_err());
        // without overlap the frame moves down one word
        assert_eq!(I::place(&Caller::Entry { sp: 100 }, 2, 12, 5).unwrap(), 87);
        assert_eq!(I::place(&Caller::ChunkEnd { end: 100 }, 2, 12, 6).unwrap(), 88);
    }

    #[test]
    fn test_compiled_slots() {
        let mut code = CodeCache::new();
        let blob = code.register_blob(CodeBlob::new("c", 6, 2)).unwrap();
        let frame = Frame {
            sp: 40,
            unextended_sp: 40,
            fp: 44,
            pc: code.blob(blob).unwrap().begin(),
            kind: FrameKind::Compiled(blob),
            relativized: false,
        };
        assert_eq!(C::sender_sp(&code, &frame).unwrap(), 46);
        assert_eq!(C::frame_bottom(&code, &frame).unwrap(), 48);
        assert_eq!(C::link_address(&code, &frame).unwrap(), 44);
        assert_eq!(C::return_pc_address(&code, &frame).unwrap(), 45);
    }
}
