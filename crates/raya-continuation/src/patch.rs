//! Caller-link patching after a thaw
//!
//! A thawed frame's saved link still holds whatever the chunk held: a
//! relative offset, poison, or a stale absolute fp from where the frame was
//! frozen. This pass walks the freshly thawed frames from the top and writes
//! every link with the fp of the frame that is now its caller. The oldest
//! frame's link becomes the entry frame's fp.

use crate::code::CodeCache;
use crate::continuation::EntryFrame;
use crate::platform::Platform;
use crate::stack::Segment;
use crate::{Address, ContinuationError, ContinuationResult};

/// Rewrite caller links from the frame at `top_sp` down to `entry`.
/// Returns the number of frames linked.
pub fn patch_caller_links<P, S>(
    segment: &mut S,
    code: &CodeCache,
    top_sp: Address,
    entry: &EntryFrame,
) -> ContinuationResult<usize>
where
    P: Platform,
    S: Segment + ?Sized,
{
    let layout = P::LAYOUT;
    let mut sp = top_sp;
    let mut unextended_sp = top_sp;
    let mut frames = 0;

    loop {
        ensure_invariant!(
            sp <= entry.sp,
            "link patching passed the entry frame at {sp:#x} (entry sp {:#x})",
            entry.sp
        );
        let pc = segment.load(layout.pc_slot(sp))?;
        let link_slot = layout.link_slot(sp);
        if pc == entry.pc || code.is_return_barrier(pc) {
            segment.store_address(link_slot, entry.fp)?;
            log::trace!("linked frame at {sp:#x} to entry fp {:#x}", entry.fp);
            return Ok(frames);
        }

        let (next_sp, next_unextended_sp) = if code.is_interpreter_pc(pc) {
            let fp = segment.load_address(link_slot)?;
            ensure_invariant!(
                fp > link_slot && fp < entry.sp,
                "interpreted frame at {sp:#x} has fp {fp:#x} outside ({link_slot:#x}, {:#x})",
                entry.sp
            );
            let saved = segment.load_address(crate::offset(fp, layout.interpreter.sender_sp))?;
            (crate::offset(fp, layout.sender_sp_offset), saved)
        } else {
            let blob = code.find_blob(pc).ok_or_else(|| {
                ContinuationError::invariant(format!("pc {pc:#x} at sp {sp:#x} is not in any code blob"))
            })?;
            let sender_sp = unextended_sp + code.blob(blob)?.frame_size;
            let fp = layout.fp_for_sender_sp(sender_sp);
            segment.store_address(link_slot, fp)?;
            log::trace!("linked frame at {sp:#x} to {fp:#x}");
            (sender_sp, sender_sp)
        };

        ensure_invariant!(
            next_sp > sp,
            "link patching does not advance at {sp:#x} (next sp {next_sp:#x})"
        );
        sp = next_sp;
        unextended_sp = next_unextended_sp;
        frames += 1;
    }
}
