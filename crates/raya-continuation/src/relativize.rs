//! Relativization of interpreter frame pointers
//!
//! An interpreted frame keeps pointers into itself (locals base, operand
//! stack top, monitor block top, its own unextended sp, and the caller's sp).
//! On a machine stack these are absolute addresses; once the frame is copied
//! into a chunk they are rewritten as offsets from the frame's fp, which
//! makes the copy position independent:
//!
//! ```text
//! relativize:    heap[hfp + off] = stack[fp + off] - fp
//! derelativize:  seg[fp + off]   = fp + seg[fp + off]
//! ```
//!
//! so `derelativize(relativize(v))` at a frame translated by `d` yields
//! `v + d`, and exactly `v` when the frame does not move.

use crate::frame::Frame;
use crate::platform::{PdOperation, Platform};
use crate::stack::Segment;
use crate::{offset, word_to_address, Address, ContinuationResult, Word};

/// Offset of `value` from `fp`.
#[inline]
pub fn to_relative(value: Address, fp: Address) -> Word {
    value as Word - fp as Word
}

/// Absolute address `relative` words from `fp`.
#[inline]
pub fn to_absolute(fp: Address, relative: Word) -> ContinuationResult<Address> {
    word_to_address(fp as Word + relative)
}

/// Rewrite one field of a heap copy as an fp-relative offset.
///
/// `src` holds the original frame at `frame_fp`, `dst` the copy at
/// `heap_fp`. The copy must still hold the original absolute value.
pub fn relativize<S, D>(
    src: &S,
    frame_fp: Address,
    dst: &mut D,
    heap_fp: Address,
    field_offset: isize,
) -> ContinuationResult<()>
where
    S: Segment + ?Sized,
    D: Segment + ?Sized,
{
    let value = src.load_address(offset(frame_fp, field_offset))?;
    let slot = offset(heap_fp, field_offset);
    let copied = dst.load(slot)?;
    ensure_invariant!(
        copied == value as Word,
        "field {field_offset} of frame {frame_fp:#x} changed while copying ({copied:#x} != {value:#x})"
    );
    dst.store(slot, to_relative(value, frame_fp))
}

/// Rewrite one fp-relative field back to an absolute address.
pub fn derelativize<S: Segment + ?Sized>(
    segment: &mut S,
    fp: Address,
    field_offset: isize,
) -> ContinuationResult<()> {
    let slot = offset(fp, field_offset);
    let absolute = to_absolute(fp, segment.load(slot)?)?;
    segment.store_address(slot, absolute)
}

/// Relativize the pointer fields of an interpreted frame's heap copy.
/// The saved sender sp is handled separately by `patch_sender_sp`.
pub fn relativize_interpreted_frame_metadata<P, S, D>(
    src: &S,
    frame: &Frame,
    dst: &mut D,
    heap_frame: &Frame,
) -> ContinuationResult<()>
where
    P: Platform,
    S: Segment + ?Sized,
    D: Segment + ?Sized,
{
    P::require(PdOperation::RelativizeInterpreted)?;
    let slots = P::LAYOUT.interpreter;
    for field in [slots.locals, slots.esp, slots.monitor_block_top, slots.top_frame_sp] {
        relativize(src, frame.fp, dst, heap_frame.fp, field)?;
    }
    Ok(())
}

/// Derelativize the pointer fields of a thawed interpreted frame.
pub fn derelativize_interpreted_frame_metadata<P, S>(segment: &mut S, frame: &Frame) -> ContinuationResult<()>
where
    P: Platform,
    S: Segment + ?Sized,
{
    P::require(PdOperation::DerelativizeInterpreted)?;
    let slots = P::LAYOUT.interpreter;
    for field in [slots.locals, slots.esp, slots.monitor_block_top, slots.top_frame_sp] {
        derelativize(segment, frame.fp, field)?;
    }
    Ok(())
}
