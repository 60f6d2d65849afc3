//! Thaw: moving frames from a chunk back onto a machine stack
//!
//! Thawing takes the youngest frames of the chunk (all of them, or a bounded
//! number) and places them under the continuation's current entry frame,
//! which need not be where they were frozen. The oldest thawed frame returns
//! to the entry when the chunk drains, or to the return barrier when older
//! frames stay frozen. Placement mirrors freeze, so a frame lands on the same
//! parity it had in the chunk and interpreted pointer fields come back in
//! absolute form for the new position.
//!
//! After the copy every thawed frame's link slot is rewritten by the
//! [`patch`](crate::patch) pass, then the chunk is shrunk to the frames that
//! remain.

use crate::chunk::{ChunkFrameStream, StackChunk};
use crate::code::CodeCache;
use crate::config::ContinuationConfig;
use crate::continuation::EntryFrame;
use crate::defaults::{BAD_ADDRESS, RETURN_BARRIER_PC};
use crate::frame::Frame;
use crate::freeze::{link_address, return_pc_address};
use crate::helper::{frame_size, overlap_argsize, stack_argsize, Caller, CompiledFrame, FrameKindOps, InterpretedFrame};
use crate::patch::patch_caller_links;
use crate::platform::Platform;
use crate::relativize::derelativize_interpreted_frame_metadata;
use crate::stack::{copy_words, MachineStack, Segment};
use crate::{verify, Address, ContinuationError, ContinuationResult, Pc, Word};

/// How many frames to thaw
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThawKind {
    /// Every frozen frame
    #[default]
    All,
    /// At most this many of the youngest frames
    Top(usize),
}

impl ThawKind {
    fn limit(self) -> usize {
        match self {
            ThawKind::All => usize::MAX,
            ThawKind::Top(n) => n,
        }
    }
}

/// Where execution resumes after a thaw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThawResult {
    /// Sp of the topmost thawed frame, or the entry sp if nothing was thawed
    pub sp: Address,
    /// Fp of the topmost thawed frame
    pub fp: Address,
    /// Pc to resume at
    pub pc: Pc,
    /// Frames moved onto the stack
    pub frames: usize,
    /// Words copied
    pub words: usize,
}

impl ThawResult {
    fn at_entry(entry: &EntryFrame) -> Self {
        Self {
            sp: entry.sp,
            fp: entry.fp,
            pc: entry.pc,
            frames: 0,
            words: 0,
        }
    }
}

/// Thaw frames of `chunk` onto `stack` below `entry`.
///
/// Fails with [`ContinuationError::StackOverflow`] before writing anything
/// when the frames do not fit; the chunk is then unchanged.
pub fn thaw<P: Platform>(
    chunk: &mut StackChunk,
    entry: &EntryFrame,
    config: &ContinuationConfig,
    stack: &mut MachineStack,
    code: &CodeCache,
    kind: ThawKind,
) -> ContinuationResult<ThawResult> {
    if chunk.is_empty() || kind.limit() == 0 {
        log::debug!("thaw at entry sp {:#x}: nothing to thaw", entry.sp);
        return Ok(ThawResult::at_entry(entry));
    }

    let mut stream = ChunkFrameStream::<P>::new(chunk, code)?;
    let mut frames = Vec::new();
    while let Some(frame) = stream.frame().copied() {
        if frames.len() == kind.limit() {
            break;
        }
        frames.push(frame);
        stream.next()?;
    }
    let remaining = stream.frame().copied();
    let drains = remaining.is_none();
    ensure_invariant!(
        drains == (frames.len() == chunk.num_frames()),
        "chunk records {} frames but {} were thawed (drained: {drains})",
        chunk.num_frames(),
        frames.len()
    );

    let mut bound = P::LAYOUT.metadata_words;
    for frame in &frames {
        bound += frame_size::<P, _>(&*chunk, code, frame)? + stack_argsize::<P>(code, frame)? + 1;
    }
    stack.check_room(entry.sp, bound)?;

    if drains {
        if let Some(oldest) = frames.last().filter(|f| f.is_compiled()) {
            let argsize = CompiledFrame::<P>::stack_argsize(code, oldest)?;
            ensure_invariant!(
                argsize <= entry.argsize,
                "oldest frame takes {argsize} stack argument words, the entry provides {}",
                entry.argsize
            );
        }
    }

    P::prefetch_chunk(chunk.live_words());

    let mut thaw = Thaw::<P> {
        chunk,
        stack,
        code,
        words: 0,
        _platform: std::marker::PhantomData,
    };
    let top = thaw.place_all(&frames, entry, drains)?;
    let words = thaw.words;

    let linked = patch_caller_links::<P, _>(stack, code, top.unextended_sp, entry)?;
    if config.verify {
        verify::verify_caller_links::<P, _>(&*stack, top.unextended_sp, entry, linked)?;
    }

    match remaining {
        None => chunk.clear(),
        Some(frame) => shrink_chunk::<P>(chunk, &frame, frames.len(), config.verify)?,
    }
    if config.verify {
        verify::verify_chunk::<P>(chunk, code)?;
    }

    log::debug!(
        "thawed {} frames ({words} words) below entry sp {:#x}; resume at sp {:#x}, {} frames still frozen",
        frames.len(),
        entry.sp,
        top.unextended_sp,
        chunk.num_frames()
    );
    Ok(ThawResult {
        sp: top.unextended_sp,
        fp: top.fp,
        pc: top.pc,
        frames: frames.len(),
        words,
    })
}

struct Thaw<'a, P: Platform> {
    chunk: &'a StackChunk,
    stack: &'a mut MachineStack,
    code: &'a CodeCache,
    words: usize,
    _platform: std::marker::PhantomData<P>,
}

impl<P: Platform> Thaw<'_, P> {
    /// Place `frames` (youngest first) oldest first. Returns the top frame.
    fn place_all(&mut self, frames: &[Frame], entry: &EntryFrame, drains: bool) -> ContinuationResult<Frame> {
        let mut caller = if drains {
            Caller::Entry { sp: entry.sp }
        } else {
            Caller::Barrier { sp: entry.sp }
        };

        let bottom_index = frames.len() - 1;
        for (index, heap_frame) in frames.iter().enumerate().rev() {
            let frame = if InterpretedFrame::<P>::is_instance(heap_frame) {
                self.thaw_interpreted(heap_frame, &caller)?
            } else {
                self.thaw_compiled(heap_frame, &caller)?
            };

            if index == bottom_index {
                let return_pc = if drains { entry.pc } else { RETURN_BARRIER_PC };
                self.stack
                    .store(return_pc_address::<P>(self.code, &frame)?, return_pc)?;
            }
            if let Caller::Frame(c) = caller {
                if c.is_interpreted() {
                    self.stack.store_address(link_address::<P>(self.code, &frame)?, c.fp)?;
                }
            }

            log::trace!(
                "thawed {:?} frame chunk {:#x} -> sp {:#x} (fp {:#x})",
                heap_frame.kind,
                heap_frame.unextended_sp,
                frame.unextended_sp,
                frame.fp
            );
            caller = Caller::Frame(frame);
        }

        let Caller::Frame(top) = caller else {
            return Err(ContinuationError::invariant("thaw placed no frame"));
        };
        let layout = P::LAYOUT;
        self.stack.store(layout.pc_slot(top.unextended_sp), top.pc)?;
        if top.is_interpreted() {
            self.stack.store_address(layout.link_slot(top.unextended_sp), top.fp)?;
        }
        Ok(top)
    }

    fn copy_to_stack(&mut self, from: Address, to: Address, count: usize) -> ContinuationResult<()> {
        copy_words(self.chunk, from, self.stack, to, count)?;
        self.words += count;
        Ok(())
    }

    fn thaw_compiled(&mut self, heap_frame: &Frame, caller: &Caller) -> ContinuationResult<Frame> {
        let size = CompiledFrame::<P>::size(self.chunk, self.code, heap_frame)?;
        let argsize = CompiledFrame::<P>::stack_argsize(self.code, heap_frame)?;

        let sender_sp = CompiledFrame::<P>::place(caller, argsize)?;
        let sp = sender_sp - size;
        self.copy_to_stack(heap_frame.unextended_sp, sp, size + argsize)?;

        Ok(Frame {
            sp,
            unextended_sp: sp,
            fp: P::LAYOUT.fp_for_sender_sp(sender_sp),
            pc: heap_frame.pc,
            kind: heap_frame.kind,
            relativized: false,
        })
    }

    fn thaw_interpreted(&mut self, heap_frame: &Frame, caller: &Caller) -> ContinuationResult<Frame> {
        let overlap = overlap_argsize::<P>(caller.overlaps_parameters(), self.code, heap_frame)?;
        let size = InterpretedFrame::<P>::size(self.chunk, self.code, heap_frame)?;
        let fp_from_top = heap_frame.fp - heap_frame.unextended_sp;

        let usp = InterpretedFrame::<P>::place(caller, overlap, size, fp_from_top)?;
        self.copy_to_stack(heap_frame.unextended_sp, usp, size)?;

        let frame = Frame {
            sp: usp,
            unextended_sp: usp,
            fp: usp + fp_from_top,
            pc: heap_frame.pc,
            kind: heap_frame.kind,
            relativized: false,
        };
        derelativize_interpreted_frame_metadata::<P, _>(self.stack, &frame)?;
        InterpretedFrame::<P>::patch_sender_sp(self.stack, &frame, caller.unextended_sp())?;
        Ok(frame)
    }
}

/// Drop the thawed frames from the chunk: `top` becomes its top frame, with
/// fresh metadata written just below it.
fn shrink_chunk<P: Platform>(
    chunk: &mut StackChunk,
    top: &Frame,
    thawed: usize,
    verify: bool,
) -> ContinuationResult<()> {
    let layout = P::LAYOUT;
    let sp = top.unextended_sp;
    chunk.store(layout.pc_slot(sp), top.pc)?;
    let link = layout.link_slot(sp);
    if top.is_interpreted() {
        chunk.store(link, top.fp as Word - link as Word)?;
    } else if verify {
        chunk.store(link, BAD_ADDRESS)?;
    }
    let frames = chunk.num_frames() - thawed;
    chunk.publish(sp - layout.metadata_words, chunk.argsize(), frames);
    Ok(())
}
