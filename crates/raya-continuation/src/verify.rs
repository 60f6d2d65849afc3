//! Consistency checks run when [`ContinuationConfig::verify`] is set
//!
//! Failures are reported as [`InvariantViolation`]; they mean a frame walk,
//! a copy or an embedder-provided stack is corrupt.
//!
//! [`ContinuationConfig::verify`]: crate::ContinuationConfig::verify
//! [`InvariantViolation`]: crate::ContinuationError::InvariantViolation

use crate::chunk::{ChunkFrameStream, StackChunk};
use crate::code::{CodeCache, OopSlot};
use crate::continuation::EntryFrame;
use crate::frame::Frame;
use crate::helper::{CompiledFrame, InterpretedFrame};
use crate::platform::Platform;
use crate::register_map::RegisterMap;
use crate::stack::{MachineStack, Segment};
use crate::walker::{FrameWalker, StackWalk, Terminator};
use crate::{offset, Address, ContinuationError, ContinuationResult};

/// Check the frames about to be frozen: every register-held reference of a
/// compiled frame has a known spill slot, compiled arguments fit in their
/// compiled caller's body, and the bottom frame sits where its terminator
/// expects it.
pub fn verify_stack_frames<P: Platform>(
    stack: &MachineStack,
    code: &CodeCache,
    entry: &EntryFrame,
    top_sp: Address,
    walk: &StackWalk,
) -> ContinuationResult<()> {
    let mut walker = FrameWalker::<P, _>::new(stack, code, entry, top_sp, RegisterMap::new())?;
    while let Some(frame) = walker.frame().copied() {
        if let Some(id) = frame.blob() {
            let blob = code.blob(id)?;
            for slot in blob.oop_map.slots() {
                if let OopSlot::Register(reg) = slot {
                    ensure_invariant!(
                        walker.register_map().location(*reg).is_some(),
                        "frame {} at {:#x} keeps a reference in {reg} but no callee saved it",
                        blob.name,
                        frame.sp
                    );
                }
            }
        }
        walker.next()?;
    }

    for pair in walk.frames.windows(2) {
        let (Some(callee), Some(caller)) = (pair[0].blob(), pair[1].blob()) else {
            continue;
        };
        let (callee, caller) = (code.blob(callee)?, code.blob(caller)?);
        let room = caller.frame_size - P::LAYOUT.metadata_words;
        ensure_invariant!(
            callee.stack_argsize <= room,
            "frame {} takes {} argument words, caller {} at {:#x} has {room} body words",
            callee.name,
            callee.stack_argsize,
            caller.name,
            pair[1].sp
        );
    }

    let Some(bottom) = walk.frames.last() else {
        return Ok(());
    };
    if bottom.is_interpreted() {
        let saved = InterpretedFrame::<P>::saved_sender_sp(stack, bottom)?;
        ensure_invariant!(
            saved == entry.sp,
            "bottom interpreted frame records sender sp {saved:#x}, entry sp is {:#x}",
            entry.sp
        );
    } else {
        let id = bottom
            .blob()
            .ok_or_else(|| ContinuationError::invariant("compiled frame without a blob"))?;
        let blob = code.blob(id)?;
        let sender_sp = CompiledFrame::<P>::sender_sp(code, bottom)?;
        match walk.terminator {
            Terminator::Entry => ensure_invariant!(
                sender_sp == entry.sp && blob.stack_argsize <= entry.argsize,
                "bottom frame {} ends at {sender_sp:#x} with {} argument words; entry sp {:#x} provides {}",
                blob.name,
                blob.stack_argsize,
                entry.sp,
                entry.argsize
            ),
            Terminator::ReturnBarrier => ensure_invariant!(
                sender_sp + blob.stack_argsize <= entry.sp,
                "bottom frame {} arguments end past the entry sp {:#x}",
                blob.name,
                entry.sp
            ),
        }
    }
    Ok(())
}

/// Check a chunk: the frame count matches, frames tile the chunk from `sp`
/// to the end, and interpreted bookkeeping is self-consistent.
pub fn verify_chunk<P: Platform>(chunk: &StackChunk, code: &CodeCache) -> ContinuationResult<()> {
    if chunk.is_empty() {
        ensure_invariant!(
            chunk.sp() == chunk.stack_size() && chunk.argsize() == 0,
            "empty chunk has sp {} and argsize {} (size {})",
            chunk.sp(),
            chunk.argsize(),
            chunk.stack_size()
        );
        return Ok(());
    }

    let mut last: Option<Frame> = None;
    let mut count = 0;
    for frame in ChunkFrameStream::<P>::new(chunk, code)?.frames() {
        let frame = frame?;
        if frame.is_interpreted() {
            verify_interpreted::<P>(chunk, &frame)?;
        }
        count += 1;
        last = Some(frame);
    }
    ensure_invariant!(
        count == chunk.num_frames(),
        "chunk records {} frames, walk found {count}",
        chunk.num_frames()
    );

    if let Some(bottom) = last {
        let end = if bottom.is_interpreted() {
            InterpretedFrame::<P>::frame_bottom(chunk, &bottom)?
        } else {
            CompiledFrame::<P>::frame_bottom(code, &bottom)?
        };
        ensure_invariant!(
            end <= chunk.stack_size() && bottom.unextended_sp < chunk.bottom(),
            "bottom frame at {:#x} ends at {end:#x}, chunk size {}",
            bottom.unextended_sp,
            chunk.stack_size()
        );
    }
    Ok(())
}

fn verify_interpreted<P: Platform>(chunk: &StackChunk, frame: &Frame) -> ContinuationResult<()> {
    let locals = InterpretedFrame::<P>::locals(chunk, frame)?;
    let esp = InterpretedFrame::<P>::esp(chunk, frame)?;
    ensure_invariant!(
        P::is_aligned(frame.fp) && frame.unextended_sp <= esp && esp <= frame.fp && locals > frame.fp,
        "interpreted frame at {:#x}: fp {:#x}, esp {esp:#x}, locals {locals:#x}",
        frame.unextended_sp,
        frame.fp
    );
    InterpretedFrame::<P>::monitor_count(chunk, frame)?;
    InterpretedFrame::<P>::operand_depth(chunk, frame)?;
    Ok(())
}

/// Follow the fp chain from the frame at `top_sp` through `frames` links;
/// it must arrive at the entry frame's fp, every step aligned and below the
/// entry sp.
pub fn verify_caller_links<P: Platform, S: Segment + ?Sized>(
    segment: &S,
    top_sp: Address,
    entry: &EntryFrame,
    frames: usize,
) -> ContinuationResult<()> {
    let layout = P::LAYOUT;
    let mut fp = segment.load_address(layout.link_slot(top_sp))?;
    for step in 0..frames {
        ensure_invariant!(
            P::is_aligned(fp) && fp >= top_sp && fp < entry.sp,
            "caller link {step} points to {fp:#x}, outside [{top_sp:#x}, {:#x})",
            entry.sp
        );
        fp = segment.load_address(offset(fp, layout.link_offset))?;
    }
    ensure_invariant!(
        fp == entry.fp,
        "caller links from {top_sp:#x} end at {fp:#x}, entry fp is {:#x}",
        entry.fp
    );
    Ok(())
}
