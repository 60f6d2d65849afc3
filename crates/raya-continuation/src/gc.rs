//! Reference scanning for the garbage collector
//!
//! A collector has to find every object reference held by a continuation's
//! frames, whether they are frozen in a chunk or still on a machine stack,
//! and may rewrite those references after moving objects.
//!
//! References are located from code metadata only:
//! - compiled frames: the blob's [`OopMap`](crate::OopMap), with stack slots
//!   relative to the frame's unextended sp and registers resolved through the
//!   [`RegisterMap`] of the walk
//! - interpreted frames: the method's [`InterpreterOopMask`] at the frame's
//!   bci for locals and operands, plus the object word of every monitor
//!
//! Scanning is split in two phases: all slots are collected first, then the
//! visitor runs and rewrites. A word shared by two frames (an interpreted
//! callee's parameters) is visited once.
//!
//! [`InterpreterOopMask`]: crate::InterpreterOopMask

use rustc_hash::FxHashSet;

use crate::chunk::{ChunkFrameStream, StackChunk};
use crate::code::{CodeCache, OopSlot, VMReg};
use crate::continuation::EntryFrame;
use crate::frame::Frame;
use crate::helper::InterpretedFrame;
use crate::platform::Platform;
use crate::register_map::RegisterMap;
use crate::stack::{MachineStack, Segment};
use crate::walker::FrameWalker;
use crate::{Address, ContinuationError, ContinuationResult, Word};

/// Where a reference lives inside its frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKind {
    /// Interpreter local `n`
    Local(usize),
    /// Interpreter operand `n`, 0 being the deepest
    Operand(usize),
    /// Object of monitor `n`, 0 being the oldest
    Monitor(usize),
    /// Compiled frame slot at this sp offset
    StackSlot(usize),
    /// Callee-saved register, found in a callee's spill slot
    Register(VMReg),
}

/// One reference slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefSlot {
    /// Index of the frame in the walk, 0 being the youngest
    pub frame: usize,
    /// Role of the slot
    pub kind: RefKind,
    /// Address in the scanned segment
    pub address: Address,
    /// Reference value at scan time
    pub value: Word,
}

/// Scan statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Frames visited
    pub frames: usize,
    /// Non-null reference slots visited
    pub slots: usize,
    /// Slots the visitor rewrote
    pub updated: usize,
}

/// Report every reference slot of `frame` to `f`.
pub fn oops_do<P, S, F>(
    segment: &S,
    code: &CodeCache,
    frame: &Frame,
    map: &RegisterMap,
    mut f: F,
) -> ContinuationResult<()>
where
    P: Platform,
    S: Segment + ?Sized,
    F: FnMut(RefKind, Address) -> ContinuationResult<()>,
{
    if let Some(id) = frame.method() {
        let method = code.method(id)?;
        let bci = InterpretedFrame::<P>::bci(segment, frame)?;
        if let Some(mask) = method.oop_mask(bci) {
            for &index in &mask.locals {
                ensure_invariant!(
                    index < method.max_locals,
                    "{} oop mask at bci {bci} names local {index} of {}",
                    method.name,
                    method.max_locals
                );
                f(RefKind::Local(index), InterpretedFrame::<P>::local_address(segment, frame, index)?)?;
            }
            let depth = InterpretedFrame::<P>::operand_depth(segment, frame)?;
            for &index in &mask.stack {
                ensure_invariant!(
                    index < depth,
                    "{} oop mask at bci {bci} names operand {index}, stack depth is {depth}",
                    method.name
                );
                f(RefKind::Operand(index), InterpretedFrame::<P>::operand_address(segment, frame, index)?)?;
            }
        }
        for index in 0..InterpretedFrame::<P>::monitor_count(segment, frame)? {
            f(RefKind::Monitor(index), InterpretedFrame::<P>::monitor_address(frame, index))?;
        }
        return Ok(());
    }

    let id = frame
        .blob()
        .ok_or_else(|| ContinuationError::invariant("frame is neither interpreted nor compiled"))?;
    let blob = code.blob(id)?;
    for slot in blob.oop_map.slots() {
        match *slot {
            OopSlot::Stack(sp_offset) => f(RefKind::StackSlot(sp_offset), frame.unextended_sp + sp_offset)?,
            OopSlot::Register(reg) => {
                let address = map.location(reg).ok_or_else(|| {
                    ContinuationError::invariant(format!(
                        "frame {} at {:#x} keeps a reference in {reg} but no callee saved it",
                        blob.name, frame.sp
                    ))
                })?;
                f(RefKind::Register(reg), address)?;
            }
        }
    }
    Ok(())
}

#[derive(Default)]
struct Collector {
    slots: Vec<RefSlot>,
    seen: FxHashSet<Address>,
    frames: usize,
}

impl Collector {
    fn frame<P: Platform, S: Segment + ?Sized>(
        &mut self,
        segment: &S,
        code: &CodeCache,
        frame: &Frame,
        map: &RegisterMap,
    ) -> ContinuationResult<()> {
        let index = self.frames;
        self.frames += 1;
        oops_do::<P, _, _>(segment, code, frame, map, |kind, address| {
            let value = segment.load(address)?;
            if value != 0 && self.seen.insert(address) {
                self.slots.push(RefSlot {
                    frame: index,
                    kind,
                    address,
                    value,
                });
            }
            Ok(())
        })
    }

    fn apply<S, V>(self, segment: &mut S, mut visitor: V) -> ContinuationResult<ScanStats>
    where
        S: Segment + ?Sized,
        V: FnMut(&RefSlot) -> Option<Word>,
    {
        let mut stats = ScanStats {
            frames: self.frames,
            slots: self.slots.len(),
            updated: 0,
        };
        for slot in &self.slots {
            if let Some(value) = visitor(slot) {
                if value != slot.value {
                    segment.store(slot.address, value)?;
                    stats.updated += 1;
                }
            }
        }
        Ok(stats)
    }
}

fn collect_chunk<P: Platform>(chunk: &StackChunk, code: &CodeCache) -> ContinuationResult<Collector> {
    let mut collector = Collector::default();
    let mut map = RegisterMap::new();
    let mut stream = ChunkFrameStream::<P>::new(chunk, code)?;
    while let Some(frame) = stream.frame().copied() {
        collector.frame::<P, _>(chunk, code, &frame, &map)?;
        stream.update_reg_map(&mut map)?;
        stream.next()?;
    }
    Ok(collector)
}

/// Reference slots of a frozen chunk, youngest frame first.
///
/// Needs only shared access, so a collector can run it under the chunk's
/// read lock while the continuation is suspended.
pub fn chunk_refs<P: Platform>(chunk: &StackChunk, code: &CodeCache) -> ContinuationResult<Vec<RefSlot>> {
    Ok(collect_chunk::<P>(chunk, code)?.slots)
}

/// Visit every reference of a frozen chunk. A visitor returning
/// `Some(new)` replaces the reference (a moved object).
pub fn scan_for_gc<P, V>(chunk: &mut StackChunk, code: &CodeCache, visitor: V) -> ContinuationResult<ScanStats>
where
    P: Platform,
    V: FnMut(&RefSlot) -> Option<Word>,
{
    let collector = collect_chunk::<P>(chunk, code)?;
    let stats = collector.apply(chunk, visitor)?;
    log::trace!(
        "chunk scan: {} frames, {} refs, {} updated",
        stats.frames,
        stats.slots,
        stats.updated
    );
    Ok(stats)
}

/// Visit every reference of the frames between `top_sp` and the entry on a
/// machine stack.
pub fn scan_stack_for_gc<P, V>(
    stack: &mut MachineStack,
    code: &CodeCache,
    entry: &EntryFrame,
    top_sp: Address,
    visitor: V,
) -> ContinuationResult<ScanStats>
where
    P: Platform,
    V: FnMut(&RefSlot) -> Option<Word>,
{
    let mut collector = Collector::default();
    {
        let mut walker = FrameWalker::<P, _>::new(&*stack, code, entry, top_sp, RegisterMap::new())?;
        while let Some(frame) = walker.frame().copied() {
            collector.frame::<P, _>(&*stack, code, &frame, walker.register_map())?;
            walker.next()?;
        }
    }
    collector.apply(stack, visitor)
}
