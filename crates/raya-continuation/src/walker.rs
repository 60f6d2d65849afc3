//! Walking frames on a machine stack
//!
//! [`FrameWalker`] starts at a suspend point (the top frame's sp, with its
//! pc and fp saved just below) and follows return addresses toward the
//! continuation's entry. The walk ends at the first pc that is the entry pc
//! or the return barrier; it never looks above the entry sp.

use std::marker::PhantomData;

use crate::code::CodeCache;
use crate::continuation::EntryFrame;
use crate::frame::Frame;
use crate::helper::sender_position;
use crate::platform::Platform;
use crate::register_map::RegisterMap;
use crate::stack::Segment;
use crate::{Address, ContinuationResult, Pc};

/// What the bottom frame returns to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    /// The entry frame: the continuation's oldest frame is on the stack
    Entry,
    /// The return barrier: older frames are still frozen
    ReturnBarrier,
}

/// Cursor over machine-resident frames
pub struct FrameWalker<'a, P: Platform, S: Segment + ?Sized> {
    segment: &'a S,
    code: &'a CodeCache,
    entry: EntryFrame,
    sp: Address,
    frame: Option<Frame>,
    terminator: Option<Terminator>,
    map: RegisterMap,
    _platform: PhantomData<P>,
}

impl<'a, P: Platform, S: Segment + ?Sized> FrameWalker<'a, P, S> {
    /// Start at the frame whose sp is `top_sp`
    pub fn new(
        segment: &'a S,
        code: &'a CodeCache,
        entry: &EntryFrame,
        top_sp: Address,
        map: RegisterMap,
    ) -> ContinuationResult<Self> {
        let mut walker = Self {
            segment,
            code,
            entry: *entry,
            sp: top_sp,
            frame: None,
            terminator: None,
            map,
            _platform: PhantomData,
        };
        walker.move_to(top_sp, top_sp)?;
        Ok(walker)
    }

    fn classify_terminator(&self, pc: Pc) -> Option<Terminator> {
        if pc == self.entry.pc {
            Some(Terminator::Entry)
        } else if self.code.is_return_barrier(pc) {
            Some(Terminator::ReturnBarrier)
        } else {
            None
        }
    }

    fn move_to(&mut self, sp: Address, unextended_sp: Address) -> ContinuationResult<()> {
        ensure_invariant!(
            sp <= self.entry.sp,
            "stack walk passed the entry frame: sp {sp:#x} > entry sp {:#x}",
            self.entry.sp
        );
        self.sp = sp;
        let pc = self.segment.load(P::LAYOUT.pc_slot(sp))?;
        if let Some(terminator) = self.classify_terminator(pc) {
            self.frame = None;
            self.terminator = Some(terminator);
            return Ok(());
        }
        ensure_invariant!(
            sp < self.entry.sp,
            "frame at entry sp {sp:#x} does not return to the entry (pc {pc:#x})"
        );
        self.frame = Some(Frame::at::<P, _>(self.segment, self.code, sp, unextended_sp, false)?);
        Ok(())
    }

    /// Whether the walk reached the entry or the return barrier
    #[inline]
    pub fn is_done(&self) -> bool {
        self.frame.is_none()
    }

    /// Current frame
    #[inline]
    pub fn frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    /// How the walk ended, once done
    #[inline]
    pub fn terminator(&self) -> Option<Terminator> {
        self.terminator
    }

    /// Current sp; once done, the sp at which the terminator pc was found
    #[inline]
    pub fn sp(&self) -> Address {
        self.sp
    }

    /// Register locations known for the current frame
    #[inline]
    pub fn register_map(&self) -> &RegisterMap {
        &self.map
    }

    /// Advance to the caller
    pub fn next(&mut self) -> ContinuationResult<()> {
        let Some(frame) = self.frame else {
            return Ok(());
        };
        if let Some(blob) = frame.blob() {
            self.map.update_for_frame(&frame, self.code.blob(blob)?);
        }
        let (sp, unextended_sp) = sender_position::<P, _>(self.segment, self.code, &frame)?;
        ensure_invariant!(
            sp > frame.sp,
            "stack walk does not advance at {:#x} (next sp {sp:#x})",
            frame.sp
        );
        self.move_to(sp, unextended_sp)
    }
}

/// Frames between a suspend point and the entry frame
#[derive(Debug, Clone)]
pub struct StackWalk {
    /// Frames, youngest first
    pub frames: Vec<Frame>,
    /// What the bottom frame returns to
    pub terminator: Terminator,
    /// Sp at which the terminator pc sits below
    pub bottom_sp: Address,
}

/// Collect the frames from `top_sp` to the entry frame
pub fn walk_frames<P: Platform, S: Segment + ?Sized>(
    segment: &S,
    code: &CodeCache,
    entry: &EntryFrame,
    top_sp: Address,
) -> ContinuationResult<StackWalk> {
    let mut walker = FrameWalker::<P, S>::new(segment, code, entry, top_sp, RegisterMap::skip())?;
    let mut frames = Vec::new();
    while let Some(frame) = walker.frame() {
        frames.push(*frame);
        walker.next()?;
    }
    let terminator = walker
        .terminator()
        .ok_or_else(|| crate::ContinuationError::invariant("stack walk ended without a terminator"))?;
    Ok(StackWalk {
        frames,
        terminator,
        bottom_sp: walker.sp(),
    })
}
