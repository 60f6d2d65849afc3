//! Position-independent frame contents
//!
//! A [`LogicalFrame`] is what a frame means to the program, with every
//! address stripped out: the method and bci with locals, monitors and
//! operands for interpreted frames, the blob and pc with body and argument
//! words for compiled frames. Two stacks holding the same execution state
//! produce equal sequences, wherever their frames are placed.

use crate::chunk::{ChunkFrameStream, StackChunk};
use crate::code::{BlobId, CodeCache, MethodId};
use crate::continuation::EntryFrame;
use crate::frame::Frame;
use crate::helper::InterpretedFrame;
use crate::platform::Platform;
use crate::stack::Segment;
use crate::walker::walk_frames;
use crate::{Address, ContinuationResult, Pc, Word};

/// One frame's execution state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicalFrame {
    /// Interpreted activation
    Interpreted {
        /// Running method
        method: MethodId,
        /// Bytecode index
        bci: u32,
        /// All locals, parameters first
        locals: Vec<Word>,
        /// `(object, lock)` pairs, oldest first
        monitors: Vec<(Word, Word)>,
        /// Operand stack, deepest first
        operands: Vec<Word>,
    },
    /// Compiled activation
    Compiled {
        /// Blob
        blob: BlobId,
        /// Resume pc
        pc: Pc,
        /// Frame body below the metadata words
        body: Vec<Word>,
        /// Incoming stack arguments
        args: Vec<Word>,
    },
}

impl LogicalFrame {
    /// Read the state of `frame` from `segment`
    pub fn read<P: Platform, S: Segment + ?Sized>(
        segment: &S,
        code: &CodeCache,
        frame: &Frame,
    ) -> ContinuationResult<Self> {
        if let Some(method) = frame.method() {
            let max_locals = code.method(method)?.max_locals;
            let locals = (0..max_locals)
                .map(|i| segment.load(InterpretedFrame::<P>::local_address(segment, frame, i)?))
                .collect::<ContinuationResult<Vec<_>>>()?;
            let monitors = (0..InterpretedFrame::<P>::monitor_count(segment, frame)?)
                .map(|i| {
                    let addr = InterpretedFrame::<P>::monitor_address(frame, i);
                    Ok((segment.load(addr)?, segment.load(addr + 1)?))
                })
                .collect::<ContinuationResult<Vec<_>>>()?;
            let operands = (0..InterpretedFrame::<P>::operand_depth(segment, frame)?)
                .map(|depth| segment.load(InterpretedFrame::<P>::operand_address(segment, frame, depth)?))
                .collect::<ContinuationResult<Vec<_>>>()?;
            return Ok(LogicalFrame::Interpreted {
                method,
                bci: InterpretedFrame::<P>::bci(segment, frame)?,
                locals,
                monitors,
                operands,
            });
        }

        let blob = frame
            .blob()
            .ok_or_else(|| crate::ContinuationError::invariant("frame without code"))?;
        let cb = code.blob(blob)?;
        let body_words = cb.frame_size - P::LAYOUT.metadata_words;
        let usp: Address = frame.unextended_sp;
        Ok(LogicalFrame::Compiled {
            blob,
            pc: frame.pc,
            body: segment.words(usp, body_words)?.to_vec(),
            args: segment.words(usp + cb.frame_size, cb.stack_argsize)?.to_vec(),
        })
    }

    /// Whether this is an interpreted frame
    pub fn is_interpreted(&self) -> bool {
        matches!(self, LogicalFrame::Interpreted { .. })
    }
}

/// Logical frames between `top_sp` and the entry, youngest first
pub fn stack_frames<P: Platform, S: Segment + ?Sized>(
    segment: &S,
    code: &CodeCache,
    entry: &EntryFrame,
    top_sp: Address,
) -> ContinuationResult<Vec<LogicalFrame>> {
    walk_frames::<P, S>(segment, code, entry, top_sp)?
        .frames
        .iter()
        .map(|frame| LogicalFrame::read::<P, S>(segment, code, frame))
        .collect()
}

/// Logical frames of a chunk, youngest first
pub fn chunk_frames<P: Platform>(chunk: &StackChunk, code: &CodeCache) -> ContinuationResult<Vec<LogicalFrame>> {
    ChunkFrameStream::<P>::new(chunk, code)?
        .frames()
        .map(|frame| LogicalFrame::read::<P, StackChunk>(chunk, code, &frame?))
        .collect()
}
