//! Building executable frame sequences on a machine stack
//!
//! [`StackBuilder`] pushes frames the way the interpreter and compiled code
//! lay them out when they call each other, so tests, benches and embedders
//! can produce any state reachable at a suspend point. Frames are pushed
//! oldest first, starting right below the entry frame.
//!
//! Calls between kinds follow the adapter conventions:
//! - interpreted to interpreted: the callee's locals start at the caller's
//!   top operands, so its parameters are shared words
//! - interpreted to compiled: the stack arguments go into an aligned area
//!   below the caller's operands
//! - compiled to compiled: the stack arguments go into the caller's outgoing
//!   area at its sp
//! - compiled to interpreted: the callee's locals start right below the
//!   caller

use crate::code::{BlobId, CodeCache, MethodId};
use crate::continuation::EntryFrame;
use crate::frame::{Frame, FrameKind};
use crate::helper::{Caller, CompiledFrame, InterpretedFrame};
use crate::platform::{PdOperation, Platform};
use crate::stack::{MachineStack, Segment};
use crate::walker::walk_frames;
use crate::{offset, Address, ContinuationResult, Pc, Word};

/// Pushes frames below an entry frame
pub struct StackBuilder<'a, P: Platform> {
    stack: &'a mut MachineStack,
    code: &'a CodeCache,
    entry: EntryFrame,
    top: Option<Frame>,
    _platform: std::marker::PhantomData<P>,
}

impl<'a, P: Platform> StackBuilder<'a, P> {
    /// Start building below `entry`
    pub fn new(stack: &'a mut MachineStack, code: &'a CodeCache, entry: EntryFrame) -> ContinuationResult<Self> {
        ensure_invariant!(
            P::is_aligned(entry.sp) && entry.sp >= stack.base() && entry.sp + entry.argsize <= stack.end(),
            "entry sp {:#x} (+{} argument words) is unaligned or outside the stack {:?}",
            entry.sp,
            entry.argsize,
            stack.range()
        );
        Ok(Self {
            stack,
            code,
            entry,
            top: None,
            _platform: std::marker::PhantomData,
        })
    }

    /// Continue building on top of the frames already between `top_sp` and
    /// the entry, such as a partially thawed stack.
    pub fn resume_at(
        stack: &'a mut MachineStack,
        code: &'a CodeCache,
        entry: EntryFrame,
        top_sp: Address,
    ) -> ContinuationResult<Self> {
        let top = walk_frames::<P, _>(&*stack, code, &entry, top_sp)?.frames.first().copied();
        let mut builder = Self::new(stack, code, entry)?;
        builder.top = top;
        Ok(builder)
    }

    /// Youngest frame pushed so far
    #[inline]
    pub fn top(&self) -> Option<&Frame> {
        self.top.as_ref()
    }

    fn caller(&self) -> Caller {
        match self.top {
            Some(frame) => Caller::Frame(frame),
            None => Caller::Entry { sp: self.entry.sp },
        }
    }

    fn caller_pc_fp(&self) -> (Pc, Address) {
        match &self.top {
            Some(frame) => (frame.pc, frame.fp),
            None => (self.entry.pc, self.entry.fp),
        }
    }

    fn write(&mut self, addr: Address, values: &[Word]) -> ContinuationResult<()> {
        self.stack.words_mut(addr, values.len())?.copy_from_slice(values);
        Ok(())
    }

    /// Push a compiled frame of `blob`, stopped at `pc_offset` into its code.
    ///
    /// `args` fills the stack argument area, `body` the lowest words of the
    /// frame; the rest of the body is zeroed.
    pub fn push_compiled(
        &mut self,
        blob: BlobId,
        pc_offset: Pc,
        args: &[Word],
        body: &[Word],
    ) -> ContinuationResult<Frame> {
        let code = self.code.blob(blob)?;
        let (size, argsize) = (code.frame_size, code.stack_argsize);
        let pc = code.pc_at(pc_offset);
        ensure_invariant!(
            args.len() == argsize && body.len() <= size - P::LAYOUT.metadata_words && code.contains(pc),
            "blob {} takes {argsize} args and at most {} body words; got {} args, {} words at pc offset {pc_offset}",
            code.name,
            size - P::LAYOUT.metadata_words,
            args.len(),
            body.len()
        );

        let caller = self.caller();
        if matches!(caller, Caller::Entry { .. }) {
            ensure_invariant!(
                argsize <= self.entry.argsize,
                "oldest frame {} takes {argsize} argument words, the entry provides {}",
                code.name,
                self.entry.argsize
            );
        }
        // args of a compiled callee live in its compiled caller's body
        if let Some(id) = match caller {
            Caller::Frame(f) => f.blob(),
            _ => None,
        } {
            let outer = self.code.blob(id)?;
            let room = outer.frame_size - P::LAYOUT.metadata_words;
            ensure_invariant!(
                argsize <= room,
                "{} takes {argsize} argument words, caller {} has {room} body words",
                code.name,
                outer.name
            );
        }
        let sender_sp = CompiledFrame::<P>::place(&caller, argsize)?;
        self.stack.check_room(sender_sp, size)?;
        let sp = sender_sp - size;

        let (caller_pc, caller_fp) = self.caller_pc_fp();
        self.write(sender_sp, args)?;
        self.stack.fill(sp, sender_sp, 0)?;
        self.write(sp, body)?;
        let layout = P::LAYOUT;
        self.stack.store(layout.pc_slot(sender_sp), caller_pc)?;
        self.stack.store_address(layout.link_slot(sender_sp), caller_fp)?;

        let frame = Frame {
            sp,
            unextended_sp: sp,
            fp: layout.fp_for_sender_sp(sender_sp),
            pc,
            kind: FrameKind::Compiled(blob),
            relativized: false,
        };
        log::trace!("pushed compiled frame {} at {sp:#x}", code.name);
        self.top = Some(frame);
        Ok(frame)
    }

    /// Push an interpreted frame of `method` stopped at `bci`.
    ///
    /// `args` are the method's parameters (locals `0..k`); under an
    /// interpreted caller they replace the caller's top `k` operands, which
    /// the callee shares. `extra_locals` follow the parameters and the
    /// remaining locals are zeroed. Monitors are `(object, lock)` pairs,
    /// oldest first; operands are listed deepest first.
    pub fn push_interpreted(
        &mut self,
        method_id: MethodId,
        bci: u32,
        args: &[Word],
        extra_locals: &[Word],
        monitors: &[(Word, Word)],
        operands: &[Word],
    ) -> ContinuationResult<Frame> {
        P::require(PdOperation::InterpretedFrame)?;
        let method = self.code.method(method_id)?;
        let parameters = method.size_of_parameters;
        let max_locals = method.max_locals;
        ensure_invariant!(
            args.len() == parameters && parameters + extra_locals.len() <= max_locals,
            "method {} takes {parameters} parameters and {max_locals} locals; got {} args and {} more locals",
            method.name,
            args.len(),
            extra_locals.len()
        );

        let caller = self.caller();
        let bottom = match caller {
            Caller::Frame(f) if f.is_interpreted() => {
                let depth = InterpretedFrame::<P>::operand_depth(&*self.stack, &f)?;
                ensure_invariant!(
                    depth >= parameters,
                    "caller has {depth} operands, callee {} takes {parameters}",
                    method.name
                );
                f.unextended_sp + parameters
            }
            Caller::Frame(f) => f.unextended_sp,
            _ => self.entry.sp,
        };

        let layout = P::LAYOUT;
        let slots = layout.interpreter;
        let locals = bottom - 1;
        let lowest_local = bottom - max_locals;
        let fp = P::frame_align_pointer(offset(lowest_local, -layout.sender_sp_offset));
        let monitor_top = offset(fp, slots.monitor_block_bottom()) - monitors.len() * slots.monitor_words;
        let esp = monitor_top - operands.len();
        self.stack.check_room(bottom, bottom - esp)?;

        let (caller_pc, caller_fp) = self.caller_pc_fp();
        self.stack.fill(esp, bottom, 0)?;
        for (i, value) in args.iter().chain(extra_locals).enumerate() {
            self.stack.store(locals - i, *value)?;
        }
        self.stack.store(offset(fp, layout.return_addr_offset), caller_pc)?;
        self.stack.store_address(offset(fp, layout.link_offset), caller_fp)?;
        self.stack.store_address(offset(fp, slots.sender_sp), caller.unextended_sp())?;
        self.stack.store_address(offset(fp, slots.top_frame_sp), esp)?;
        self.stack.store(offset(fp, slots.method), method_id.to_word())?;
        self.stack.store_address(offset(fp, slots.locals), locals)?;
        self.stack.store(offset(fp, slots.bcx), Word::from(bci))?;
        self.stack.store_address(offset(fp, slots.monitor_block_top), monitor_top)?;
        self.stack.store_address(offset(fp, slots.esp), esp)?;
        self.stack.store(offset(fp, slots.cache), 0)?;

        let frame = Frame {
            sp: esp,
            unextended_sp: esp,
            fp,
            pc: self.code.interpreter_pc(bci),
            kind: FrameKind::Interpreted(method_id),
            relativized: false,
        };
        for (i, (object, lock)) in monitors.iter().enumerate() {
            let addr = InterpretedFrame::<P>::monitor_address(&frame, i);
            self.write(addr, &[*object, *lock])?;
        }
        for (depth, value) in operands.iter().enumerate() {
            self.stack.store(monitor_top - 1 - depth, *value)?;
        }

        log::trace!("pushed interpreted frame {} at {esp:#x} (fp {fp:#x})", method.name);
        self.top = Some(frame);
        Ok(frame)
    }

    /// Finish at a suspend point: store the top frame's pc and fp below its
    /// sp and return that sp, the value to pass to freeze.
    pub fn suspend(self) -> ContinuationResult<Address> {
        let layout = P::LAYOUT;
        let (pc, fp, sp) = match &self.top {
            Some(frame) => (frame.pc, frame.fp, frame.unextended_sp),
            None => (self.entry.pc, self.entry.fp, self.entry.sp),
        };
        ensure_invariant!(sp >= self.stack.base() + layout.metadata_words, "no room below {sp:#x}");
        self.stack.store(layout.pc_slot(sp), pc)?;
        self.stack.store_address(layout.link_slot(sp), fp)?;
        Ok(sp)
    }
}

impl<P: Platform> std::fmt::Debug for StackBuilder<'_, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackBuilder")
            .field("platform", &P::NAME)
            .field("entry", &self.entry)
            .field("top", &self.top)
            .finish()
    }
}
