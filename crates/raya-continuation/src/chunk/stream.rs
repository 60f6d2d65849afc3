//! Walking frozen frames
//!
//! [`ChunkFrameStream`] visits the frames of a chunk from the youngest to
//! the oldest using only what the chunk stores: the top frame's pc below
//! `sp`, fp-relative links of interpreted frames and the frame sizes from
//! the code cache. No machine stack is involved, which is how a collector
//! scans a suspended continuation.
//!
//! ```text
//! interpreted:  fp = link_slot + [link_slot]
//!               next sp = fp + sender_sp_offset
//!               next unextended sp = fp + [fp + sender_sp]
//!               done once locals + 1 >= bottom
//! compiled:     next sp = unextended sp + size
//!               done once sp >= bottom
//! ```

use std::marker::PhantomData;

use super::StackChunk;
use crate::code::{BlobId, CodeCache, MethodId};
use crate::frame::Frame;
use crate::helper::{sender_position, CompiledFrame, InterpretedFrame};
use crate::platform::Platform;
use crate::register_map::RegisterMap;
use crate::{Address, ContinuationResult, Pc};

/// Cursor over the frames of a chunk
pub struct ChunkFrameStream<'a, P: Platform> {
    chunk: &'a StackChunk,
    code: &'a CodeCache,
    end: Address,
    sp: Address,
    unextended_sp: Address,
    frame: Option<Frame>,
    index: usize,
    _platform: PhantomData<P>,
}

impl<'a, P: Platform> ChunkFrameStream<'a, P> {
    /// Start at the chunk's top frame
    pub fn new(chunk: &'a StackChunk, code: &'a CodeCache) -> ContinuationResult<Self> {
        let end = chunk.bottom();
        let mut stream = Self {
            chunk,
            code,
            end,
            sp: end,
            unextended_sp: end,
            frame: None,
            index: 0,
            _platform: PhantomData,
        };
        if !chunk.is_empty() {
            let sp = chunk.sp() + P::LAYOUT.metadata_words;
            stream.move_to(sp, sp)?;
        }
        Ok(stream)
    }

    fn move_to(&mut self, sp: Address, unextended_sp: Address) -> ContinuationResult<()> {
        let frame = Frame::at::<P, _>(self.chunk, self.code, sp, unextended_sp, true)?;
        ensure_invariant!(
            frame.unextended_sp < self.end,
            "frame at {sp:#x} starts past the chunk bottom {:#x}",
            self.end
        );
        self.sp = frame.sp;
        self.unextended_sp = frame.unextended_sp;
        self.frame = Some(frame);
        Ok(())
    }

    fn finish(&mut self) {
        self.sp = self.end;
        self.unextended_sp = self.end;
        self.frame = None;
    }

    /// Whether every frame has been visited
    #[inline]
    pub fn is_done(&self) -> bool {
        self.frame.is_none()
    }

    /// Current frame's sp, `bottom` once done
    #[inline]
    pub fn sp(&self) -> Address {
        self.sp
    }

    /// Current frame's unextended sp, `bottom` once done
    #[inline]
    pub fn unextended_sp(&self) -> Address {
        self.unextended_sp
    }

    /// Current frame's fp
    #[inline]
    pub fn fp(&self) -> Option<Address> {
        self.frame.map(|f| f.fp)
    }

    /// Current frame's pc
    #[inline]
    pub fn pc(&self) -> Option<Pc> {
        self.frame.map(|f| f.pc)
    }

    /// Current frame's blob, for compiled frames
    #[inline]
    pub fn cb(&self) -> Option<BlobId> {
        self.frame.and_then(|f| f.blob())
    }

    /// Current frame's method, for interpreted frames
    #[inline]
    pub fn method(&self) -> Option<MethodId> {
        self.frame.and_then(|f| f.method())
    }

    /// Current frame
    #[inline]
    pub fn frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    /// Frames visited so far
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// End sentinel
    #[inline]
    pub fn end(&self) -> Address {
        self.end
    }

    /// Record the current frame's register spills before moving on
    pub fn update_reg_map(&self, map: &mut RegisterMap) -> ContinuationResult<()> {
        if let Some(frame) = &self.frame {
            if let Some(blob) = frame.blob() {
                map.update_for_frame(frame, self.code.blob(blob)?);
            }
        }
        Ok(())
    }

    /// Advance to the caller
    pub fn next(&mut self) -> ContinuationResult<()> {
        let Some(frame) = self.frame else {
            return Ok(());
        };
        self.index += 1;

        if frame.is_interpreted() {
            if InterpretedFrame::<P>::frame_bottom(self.chunk, &frame)? >= self.end {
                self.finish();
                return Ok(());
            }
        } else if CompiledFrame::<P>::sender_sp(self.code, &frame)? >= self.end {
            self.finish();
            return Ok(());
        }

        let (sp, unextended_sp) = sender_position::<P, _>(self.chunk, self.code, &frame)?;
        ensure_invariant!(
            sp > frame.sp,
            "chunk walk does not advance at {:#x} (next sp {sp:#x})",
            frame.sp
        );
        self.move_to(sp, unextended_sp)
    }

    /// Consume the stream as an iterator of frames
    pub fn frames(self) -> ChunkFrames<'a, P> {
        ChunkFrames {
            stream: self,
            failed: false,
        }
    }
}

/// Iterator form of [`ChunkFrameStream`]
pub struct ChunkFrames<'a, P: Platform> {
    stream: ChunkFrameStream<'a, P>,
    failed: bool,
}

impl<P: Platform> Iterator for ChunkFrames<'_, P> {
    type Item = ContinuationResult<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let frame = *self.stream.frame()?;
        if let Err(err) = self.stream.next() {
            self.failed = true;
            return Some(Err(err));
        }
        Some(Ok(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Amd64;
    use crate::stack::Segment;
    use crate::CodeBlob;

    #[test]
    fn test_empty_chunk_is_done() {
        let code = CodeCache::new();
        let chunk = StackChunk::with_capacity(16);
        let stream = ChunkFrameStream::<Amd64>::new(&chunk, &code).unwrap();
        assert!(stream.is_done());
        assert_eq!(stream.sp(), 16);
        assert_eq!(stream.fp(), None);
        assert_eq!(stream.frames().count(), 0);
    }

    #[test]
    fn test_compiled_frames_by_size() {
        let mut code = CodeCache::new();
        let a = code.register_blob(CodeBlob::new("a", 4, 0)).unwrap();
        let b = code.register_blob(CodeBlob::new("b", 6, 0)).unwrap();

        // [10, 12) metadata, a at [12, 16), b at [16, 22), chunk size 22
        let mut chunk = StackChunk::with_capacity(22);
        chunk.store(11, code.blob(a).unwrap().begin()).unwrap();
        chunk.store(15, code.blob(b).unwrap().begin()).unwrap();
        chunk.publish(10, 0, 2);

        let mut stream = ChunkFrameStream::<Amd64>::new(&chunk, &code).unwrap();
        assert_eq!(stream.cb(), Some(a));
        assert_eq!(stream.sp(), 12);
        assert_eq!(stream.fp(), Some(14));
        stream.next().unwrap();
        assert_eq!(stream.cb(), Some(b));
        assert_eq!(stream.sp(), 16);
        stream.next().unwrap();
        assert!(stream.is_done());
        assert_eq!(stream.index(), 2);
        assert_eq!(stream.sp(), chunk.bottom());
    }

    #[test]
    fn test_bad_pc_is_reported() {
        let code = CodeCache::new();
        let mut chunk = StackChunk::with_capacity(8);
        chunk.store(3, 0x77).unwrap();
        chunk.publish(2, 0, 1);
        assert!(ChunkFrameStream::<Amd64>::new(&chunk, &code).is_err());
    }
}
