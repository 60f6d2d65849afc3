//! Freeze: copying live frames into a chunk
//!
//! Freezing runs in three steps:
//! 1. Walk the machine stack from the suspend point to the terminator (the
//!    entry frame, or the return barrier when older frames are already
//!    frozen) and compute an upper bound of the words needed.
//! 2. Make room in the chunk. This is the only step that may fail with a
//!    recoverable error, and it fails before anything is written.
//! 3. Place the frames oldest first, each relative to its already placed
//!    caller, copy them, relativize interpreted frames and point each copy's
//!    link at its caller. Chunk metadata is published last.
//!
//! ```text
//!  machine stack                          chunk
//!  ┌────────────┐ entry sp                ┌────────────┐ stack_size
//!  │ bottom     │ ──────────────────────► │ bottom     │
//!  │ ...        │                         │ ...        │
//!  │ top        │ ──────────────────────► │ top        │
//!  └────────────┘ top sp                  ├────────────┤
//!                                         │ pc, link   │ ← chunk sp
//!                                         └────────────┘
//! ```

use crate::chunk::{ChunkFrameStream, StackChunk};
use crate::code::CodeCache;
use crate::config::ContinuationConfig;
use crate::continuation::EntryFrame;
use crate::defaults::{BAD_ADDRESS, RETURN_BARRIER_PC};
use crate::frame::Frame;
use crate::helper::{
    frame_size, overlap_argsize, stack_argsize, Caller, CompiledFrame, FrameKindOps, InterpretedFrame, NO_OVERLAP,
};
use crate::platform::Platform;
use crate::relativize::relativize_interpreted_frame_metadata;
use crate::stack::{copy_words, MachineStack, Segment};
use crate::walker::{walk_frames, Terminator};
use crate::{verify, Address, ContinuationError, ContinuationResult, Word};

/// Outcome of a freeze
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreezeResult {
    /// Frames moved into the chunk
    pub frames: usize,
    /// Words copied
    pub words: usize,
    /// Chunk sp after the freeze
    pub chunk_sp: usize,
}

/// Freeze the frames between `top_sp` and `entry` into `chunk`.
///
/// On error the chunk is unchanged. A bottom frame returning to the return
/// barrier is appended on top of the frames already in the chunk.
pub fn freeze<P: Platform>(
    chunk: &mut StackChunk,
    entry: &EntryFrame,
    config: &ContinuationConfig,
    stack: &MachineStack,
    code: &CodeCache,
    top_sp: Address,
) -> ContinuationResult<FreezeResult> {
    let walk = walk_frames::<P, _>(stack, code, entry, top_sp)?;
    let was_empty = chunk.is_empty();
    match walk.terminator {
        Terminator::Entry => ensure_invariant!(
            was_empty,
            "bottom frame returns to the entry but {} frames are still frozen",
            chunk.num_frames()
        ),
        Terminator::ReturnBarrier => ensure_invariant!(
            !was_empty,
            "bottom frame returns to the return barrier but the chunk is empty"
        ),
    }

    if walk.frames.is_empty() {
        log::debug!("freeze at sp {top_sp:#x}: no frames above the entry");
        return Ok(FreezeResult {
            frames: 0,
            words: 0,
            chunk_sp: chunk.sp(),
        });
    }

    if config.verify {
        verify::verify_stack_frames::<P>(stack, code, entry, top_sp, &walk)?;
    }

    let mut bound = P::LAYOUT.metadata_words;
    for frame in &walk.frames {
        // one word of slack per frame for alignment
        bound += frame_size::<P, _>(stack, code, frame)? + stack_argsize::<P>(code, frame)? + 1;
    }
    chunk.ensure_room(bound, config)?;

    let mut freeze = Freeze::<P> {
        chunk,
        stack,
        code,
        verify: config.verify,
        words: 0,
        _platform: std::marker::PhantomData,
    };
    let result = freeze.run(&walk.frames, was_empty)?;

    if config.verify {
        verify::verify_chunk::<P>(chunk, code)?;
    }
    log::debug!(
        "froze {} frames ({} words) from sp {top_sp:#x}; chunk sp {}, {} frames total",
        result.frames,
        result.words,
        result.chunk_sp,
        chunk.num_frames()
    );
    Ok(result)
}

struct Freeze<'a, P: Platform> {
    chunk: &'a mut StackChunk,
    stack: &'a MachineStack,
    code: &'a CodeCache,
    verify: bool,
    words: usize,
    _platform: std::marker::PhantomData<P>,
}

impl<P: Platform> Freeze<'_, P> {
    fn run(&mut self, frames: &[Frame], was_empty: bool) -> ContinuationResult<FreezeResult> {
        let layout = P::LAYOUT;
        let old_frames = self.chunk.num_frames();
        let mut argsize = self.chunk.argsize();

        // The chunk's top frame becomes the caller; its pc sits in the
        // metadata words the new bottom frame will overwrite.
        let (mut caller, saved_top_pc) = if was_empty {
            (Caller::ChunkEnd { end: self.chunk.stack_size() }, None)
        } else {
            let stream = ChunkFrameStream::<P>::new(self.chunk, self.code)?;
            let top = *stream
                .frame()
                .ok_or_else(|| ContinuationError::invariant("non-empty chunk without a top frame"))?;
            (Caller::Frame(top), Some(top.pc))
        };

        let bottom_index = frames.len() - 1;
        for (index, frame) in frames.iter().enumerate().rev() {
            let callee = index.checked_sub(1).map(|i| &frames[i]);
            let heap_frame = if InterpretedFrame::<P>::is_instance(frame) {
                self.freeze_interpreted(frame, &caller, callee)?
            } else {
                self.freeze_compiled(frame, &caller)?
            };

            if index == bottom_index {
                match (caller, saved_top_pc) {
                    (Caller::ChunkEnd { end }, _) => {
                        argsize = if heap_frame.is_interpreted() {
                            overlap_argsize::<P>(caller.overlaps_parameters(), self.code, &heap_frame)?
                        } else {
                            end - CompiledFrame::<P>::sender_sp(self.code, &heap_frame)?
                        };
                    }
                    (_, Some(pc)) => self.restore_return_pc(&heap_frame, pc)?,
                    _ => {}
                }
            }

            self.patch_pd(&heap_frame, &caller)?;
            log::trace!(
                "froze {:?} frame sp {:#x} -> chunk {:#x} (fp {:#x})",
                frame.kind,
                frame.unextended_sp,
                heap_frame.unextended_sp,
                heap_frame.fp
            );
            caller = Caller::Frame(heap_frame);
        }

        let Caller::Frame(top) = caller else {
            return Err(ContinuationError::invariant("freeze placed no frame"));
        };
        self.set_top_frame_metadata(&top)?;

        let chunk_sp = top.unextended_sp - layout.metadata_words;
        self.chunk.publish(chunk_sp, argsize, old_frames + frames.len());
        Ok(FreezeResult {
            frames: frames.len(),
            words: self.words,
            chunk_sp,
        })
    }

    fn copy_to_chunk(&mut self, from: Address, to: Address, count: usize) -> ContinuationResult<()> {
        copy_words(self.stack, from, self.chunk, to, count)?;
        self.words += count;
        Ok(())
    }

    fn freeze_compiled(&mut self, frame: &Frame, caller: &Caller) -> ContinuationResult<Frame> {
        let blob = self.code.blob(
            frame
                .blob()
                .ok_or_else(|| ContinuationError::invariant("expected a compiled frame"))?,
        )?;
        let (size, argsize) = (blob.frame_size, blob.stack_argsize);

        let sender_sp = CompiledFrame::<P>::place(caller, argsize)?;
        let sp = sender_sp - size;
        self.copy_to_chunk(CompiledFrame::<P>::frame_top(frame), sp, size + argsize)?;

        Ok(Frame {
            sp,
            unextended_sp: sp,
            fp: P::LAYOUT.fp_for_sender_sp(sender_sp),
            pc: frame.pc,
            kind: frame.kind,
            relativized: true,
        })
    }

    fn freeze_interpreted(
        &mut self,
        frame: &Frame,
        caller: &Caller,
        callee: Option<&Frame>,
    ) -> ContinuationResult<Frame> {
        let overlap = overlap_argsize::<P>(caller.overlaps_parameters(), self.code, frame)?;
        let bottom = InterpretedFrame::<P>::frame_bottom(self.stack, frame)?;
        let size = bottom - frame.unextended_sp;
        let fp_from_top = frame.fp - frame.unextended_sp;

        // this frame is the callee's interpreted caller
        let callee_overlap = match callee {
            Some(c) => overlap_argsize::<P>(true, self.code, c)?,
            None => NO_OVERLAP,
        };
        let top = InterpretedFrame::<P>::frame_top(frame, callee_overlap);

        let heap_usp = InterpretedFrame::<P>::place(caller, overlap, size, fp_from_top)?;
        let heap_top = heap_usp + (top - frame.unextended_sp);
        self.copy_to_chunk(top, heap_top, bottom - top)?;

        let heap_frame = Frame {
            sp: heap_usp,
            unextended_sp: heap_usp,
            fp: heap_usp + fp_from_top,
            pc: frame.pc,
            kind: frame.kind,
            relativized: true,
        };
        relativize_interpreted_frame_metadata::<P, _, _>(self.stack, frame, self.chunk, &heap_frame)?;
        InterpretedFrame::<P>::patch_sender_sp(self.chunk, &heap_frame, caller.unextended_sp())?;
        Ok(heap_frame)
    }

    /// Point the copy's link at its caller: an fp-relative offset for an
    /// interpreted caller, poison otherwise.
    fn patch_pd(&mut self, heap_frame: &Frame, caller: &Caller) -> ContinuationResult<()> {
        let slot = link_address::<P>(self.code, heap_frame)?;
        match caller {
            Caller::Frame(c) if c.is_interpreted() => {
                self.chunk.store(slot, c.fp as Word - slot as Word)
            }
            _ if self.verify => self.chunk.store(slot, BAD_ADDRESS),
            _ => Ok(()),
        }
    }

    /// Replace the return barrier under the new bottom frame with the real
    /// return pc into the chunk's previous top frame.
    fn restore_return_pc(&mut self, heap_frame: &Frame, pc: Word) -> ContinuationResult<()> {
        let slot = return_pc_address::<P>(self.code, heap_frame)?;
        let current = self.chunk.load(slot)?;
        ensure_invariant!(
            current == RETURN_BARRIER_PC,
            "bottom frame returns to {current:#x}, expected the return barrier"
        );
        self.chunk.store(slot, pc)
    }

    fn set_top_frame_metadata(&mut self, top: &Frame) -> ContinuationResult<()> {
        let layout = P::LAYOUT;
        let sp = top.unextended_sp;
        self.chunk.store(layout.pc_slot(sp), top.pc)?;
        let link = layout.link_slot(sp);
        if top.is_interpreted() {
            self.chunk.store(link, top.fp as Word - link as Word)
        } else if self.verify {
            self.chunk.store(link, BAD_ADDRESS)
        } else {
            Ok(())
        }
    }
}

/// Slot holding the caller's fp in `frame`
pub(crate) fn link_address<P: Platform>(code: &CodeCache, frame: &Frame) -> ContinuationResult<Address> {
    if frame.is_interpreted() {
        Ok(InterpretedFrame::<P>::link_address(frame))
    } else {
        CompiledFrame::<P>::link_address(code, frame)
    }
}

/// Slot holding `frame`'s return pc
pub(crate) fn return_pc_address<P: Platform>(code: &CodeCache, frame: &Frame) -> ContinuationResult<Address> {
    if frame.is_interpreted() {
        Ok(InterpretedFrame::<P>::return_pc_address(frame))
    } else {
        CompiledFrame::<P>::return_pc_address(code, frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CodeBlob, Method};
    use crate::platform::Amd64;
    use crate::StackBuilder;

    fn entry(code: &mut CodeCache) -> EntryFrame {
        EntryFrame::new(200, code.new_entry_pc(), 210, 0)
    }

    #[test]
    fn test_freeze_compiled_layout() {
        let mut code = CodeCache::new();
        let blob = code.register_blob(CodeBlob::new("c", 6, 0)).unwrap();
        let entry = entry(&mut code);
        let mut stack = MachineStack::new(0, 256);
        let top = {
            let mut builder = StackBuilder::<Amd64>::new(&mut stack, &code, entry).unwrap();
            builder.push_compiled(blob, 0, &[], &[1, 2, 3, 4]).unwrap();
            builder.push_compiled(blob, 8, &[], &[5, 6, 7, 8]).unwrap();
            builder.suspend().unwrap()
        };

        let mut chunk = StackChunk::new();
        let config = ContinuationConfig::verified();
        let result = freeze::<Amd64>(&mut chunk, &entry, &config, &stack, &code, top).unwrap();
        assert_eq!(
            result,
            FreezeResult {
                frames: 2,
                words: 12,
                chunk_sp: 242
            }
        );
        assert_eq!(chunk.stack_size(), 256);
        assert_eq!(chunk.argsize(), 0);
        assert_eq!(chunk.load(243).unwrap(), code.blob(blob).unwrap().pc_at(8));
        assert_eq!(chunk.load(242).unwrap(), BAD_ADDRESS);
        assert_eq!(chunk.words(244, 4).unwrap(), &[5, 6, 7, 8]);
        assert_eq!(chunk.words(250, 4).unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_freeze_interpreted_is_relativized() {
        let mut code = CodeCache::new();
        let method = code.register_method(Method::new("m", 1, 2));
        let entry = entry(&mut code);
        let mut stack = MachineStack::new(0, 256);
        let top = {
            let mut builder = StackBuilder::<Amd64>::new(&mut stack, &code, entry).unwrap();
            builder.push_interpreted(method, 2, &[7], &[8], &[], &[9]).unwrap();
            builder.suspend().unwrap()
        };

        let mut chunk = StackChunk::new();
        freeze::<Amd64>(&mut chunk, &entry, &ContinuationConfig::verified(), &stack, &code, top).unwrap();
        assert_eq!(chunk.argsize(), 1);

        let stream = ChunkFrameStream::<Amd64>::new(&chunk, &code).unwrap();
        let frame = *stream.frame().unwrap();
        assert!(frame.relativized);
        // locals sit 3 words above fp wherever the frame is
        let slots = Amd64::LAYOUT.interpreter;
        assert_eq!(chunk.load(crate::offset(frame.fp, slots.locals)).unwrap(), 3);
        assert_eq!(InterpretedFrame::<Amd64>::frame_bottom(&chunk, &frame).unwrap(), chunk.stack_size());
        assert_eq!(
            InterpretedFrame::<Amd64>::saved_sender_sp(&chunk, &frame).unwrap(),
            chunk.stack_size()
        );
    }

    #[test]
    fn test_empty_freeze() {
        let mut code = CodeCache::new();
        let entry = entry(&mut code);
        let mut stack = MachineStack::new(0, 256);
        let top = StackBuilder::<Amd64>::new(&mut stack, &code, entry)
            .unwrap()
            .suspend()
            .unwrap();
        let mut chunk = StackChunk::new();
        let result = freeze::<Amd64>(&mut chunk, &entry, &ContinuationConfig::default(), &stack, &code, top).unwrap();
        assert_eq!(result.frames, 0);
        assert!(chunk.is_empty());
        assert!(ChunkFrameStream::<Amd64>::new(&chunk, &code).unwrap().is_done());
    }

    #[test]
    fn test_exhaustion_leaves_chunk_unchanged() {
        let mut code = CodeCache::new();
        let blob = code.register_blob(CodeBlob::new("c", 6, 0)).unwrap();
        let entry = entry(&mut code);
        let mut stack = MachineStack::new(0, 256);
        let top = {
            let mut builder = StackBuilder::<Amd64>::new(&mut stack, &code, entry).unwrap();
            builder.push_compiled(blob, 0, &[], &[]).unwrap();
            builder.push_compiled(blob, 0, &[], &[]).unwrap();
            builder.suspend().unwrap()
        };

        let config = ContinuationConfig::default()
            .with_initial_chunk_words(8)
            .with_max_chunk_words(8);
        let mut chunk = StackChunk::new();
        let err = freeze::<Amd64>(&mut chunk, &entry, &config, &stack, &code, top).unwrap_err();
        assert_eq!(err, ContinuationError::ChunkExhausted { needed: 16, max: 8 });
        assert_eq!(chunk.stack_size(), 0);
        assert!(chunk.is_empty());
    }

    #[test]
    fn test_barrier_requires_frozen_frames() {
        let mut code = CodeCache::new();
        let entry = entry(&mut code);
        let mut stack = MachineStack::new(0, 256);
        stack.store(199, RETURN_BARRIER_PC).unwrap();
        let mut chunk = StackChunk::new();
        let err = freeze::<Amd64>(&mut chunk, &entry, &ContinuationConfig::default(), &stack, &code, 200).unwrap_err();
        assert!(matches!(err, ContinuationError::InvariantViolation(_)));
    }
}
