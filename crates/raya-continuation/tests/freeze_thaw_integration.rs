//! Integration tests for freezing and thawing continuations
//!
//! Tests cover:
//! - Round trips of compiled, interpreted and mixed stacks
//! - Thawing onto a different stack
//! - Caller-link integrity after thaw
//! - Partial thaw followed by a refreeze
//! - Empty continuations, chunk exhaustion and unsupported backends

use raya_continuation::inspect::{chunk_frames, stack_frames, LogicalFrame};
use raya_continuation::verify::verify_caller_links;
use raya_continuation::*;

struct Fixture {
    code: CodeCache,
    small: BlobId,
    with_args: BlobId,
    big: BlobId,
    leaf: MethodId,
    callee: MethodId,
}

#[derive(Clone, Copy)]
enum Push {
    Small,
    WithArgs,
    Big,
    Leaf,
    Callee,
}

use Push::*;

impl Fixture {
    fn new() -> Self {
        let mut code = CodeCache::new();
        let small = code.register_blob(CodeBlob::new("small", 6, 0)).unwrap();
        let with_args = code.register_blob(CodeBlob::new("with_args", 8, 3)).unwrap();
        let big = code.register_blob(CodeBlob::new("big", 10, 1)).unwrap();
        let leaf = code.register_method(Method::new("leaf", 0, 2));
        let callee = code.register_method(Method::new("callee", 2, 4));
        Self {
            code,
            small,
            with_args,
            big,
            leaf,
            callee,
        }
    }

    fn entry(&mut self, stack: &MachineStack, from_end: usize) -> EntryFrame {
        let sp = stack.end() - from_end;
        EntryFrame::new(sp, self.code.new_entry_pc(), sp + 8, 4)
    }

    /// Push `pushes` oldest first; returns the suspend sp
    fn build<P: Platform>(&self, stack: &mut MachineStack, entry: EntryFrame, pushes: &[Push]) -> Address {
        let mut builder = StackBuilder::<P>::new(stack, &self.code, entry).unwrap();
        for (i, push) in pushes.iter().enumerate() {
            let seed = 100 * (i as Word + 1);
            match push {
                Small => builder.push_compiled(self.small, 4, &[], &[seed, seed + 1, seed + 2, seed + 3]),
                WithArgs => builder.push_compiled(
                    self.with_args,
                    8,
                    &[seed + 10, seed + 11, seed + 12],
                    &[seed, seed + 1, seed + 2, seed + 3, seed + 4, seed + 5],
                ),
                Big => builder.push_compiled(self.big, 12, &[seed + 10], &[seed; 8]),
                Leaf => builder.push_interpreted(
                    self.leaf,
                    3,
                    &[],
                    &[seed, seed + 1],
                    &[(seed + 50, 1)],
                    &[seed + 20, seed + 21, seed + 22],
                ),
                Callee => builder.push_interpreted(
                    self.callee,
                    7,
                    &[seed + 30, seed + 31],
                    &[seed + 32, seed + 33],
                    &[],
                    &[seed + 40, seed + 41],
                ),
            }
            .unwrap();
        }
        builder.suspend().unwrap()
    }
}

const ALL_COMPILED: &[Push] = &[Small, WithArgs, Small, Big, Small];
const ALL_INTERPRETED: &[Push] = &[Leaf, Callee, Callee, Callee];
const MIXED: &[Push] = &[Leaf, Callee, WithArgs, Small, Callee, Big, Leaf];

fn round_trip(pushes: &[Push]) {
    let mut fx = Fixture::new();
    let mut stack = MachineStack::new(0, 1024);
    let entry = fx.entry(&stack, 64);
    let top = fx.build::<Amd64>(&mut stack, entry, pushes);
    let before = stack_frames::<Amd64, _>(&stack, &fx.code, &entry, top).unwrap();
    assert_eq!(before.len(), pushes.len());

    let mut cont = Continuation::new(entry, ContinuationConfig::verified());
    let frozen = cont.freeze::<Amd64>(&stack, &fx.code, top).unwrap();
    assert_eq!(frozen.frames, pushes.len());
    assert_eq!(cont.num_frames(), pushes.len());
    assert_eq!(chunk_frames::<Amd64>(&cont.chunk().read(), &fx.code).unwrap(), before);

    // thaw onto a clean stack at the same entry
    let mut fresh = MachineStack::new(0, 1024);
    let resumed = cont.thaw::<Amd64>(&mut fresh, &fx.code, ThawKind::All).unwrap();
    assert_eq!(resumed.frames, pushes.len());
    assert!(cont.is_empty());

    let after = stack_frames::<Amd64, _>(&fresh, &fx.code, &entry, resumed.sp).unwrap();
    assert_eq!(after, before);
    verify_caller_links::<Amd64, _>(&fresh, resumed.sp, &entry, pushes.len()).unwrap();
}

#[test]
fn test_round_trip_compiled() {
    round_trip(ALL_COMPILED);
}

#[test]
fn test_round_trip_interpreted() {
    round_trip(ALL_INTERPRETED);
}

#[test]
fn test_round_trip_mixed() {
    round_trip(MIXED);
}

#[test]
fn test_resume_pc_is_top_frame() {
    let mut fx = Fixture::new();
    let mut stack = MachineStack::new(0, 512);
    let entry = fx.entry(&stack, 32);
    let top = fx.build::<Amd64>(&mut stack, entry, &[Leaf, Small]);

    let mut cont = Continuation::new(entry, ContinuationConfig::verified());
    cont.freeze::<Amd64>(&stack, &fx.code, top).unwrap();
    let resumed = cont.thaw::<Amd64>(&mut stack, &fx.code, ThawKind::All).unwrap();
    assert_eq!(resumed.pc, fx.code.blob(fx.small).unwrap().pc_at(4));
    assert_eq!(resumed.sp, top);
    assert_eq!(resumed.fp, top + 4);
}

#[test]
fn test_thaw_onto_different_stack() {
    for pushes in [ALL_COMPILED, ALL_INTERPRETED, MIXED] {
        let mut fx = Fixture::new();
        let mut stack = MachineStack::new(0x1000, 1024);
        let entry = fx.entry(&stack, 64);
        let top = fx.build::<Amd64>(&mut stack, entry, pushes);
        let before = stack_frames::<Amd64, _>(&stack, &fx.code, &entry, top).unwrap();

        let mut cont = Continuation::new(entry, ContinuationConfig::verified());
        cont.freeze::<Amd64>(&stack, &fx.code, top).unwrap();

        // another thread's stack, with the entry at a different depth and
        // a different entry stub
        let mut other = MachineStack::new(0x9000, 2048);
        let moved = fx.entry(&other, 302);
        cont.set_entry(moved);
        let resumed = cont.thaw::<Amd64>(&mut other, &fx.code, ThawKind::All).unwrap();

        let after = stack_frames::<Amd64, _>(&other, &fx.code, &moved, resumed.sp).unwrap();
        assert_eq!(after, before);
        verify_caller_links::<Amd64, _>(&other, resumed.sp, &moved, pushes.len()).unwrap();
        assert!(resumed.sp < moved.sp && resumed.sp >= other.base());
    }
}

#[test]
fn test_argument_overlap() {
    let mut fx = Fixture::new();
    let mut stack = MachineStack::new(0, 512);
    let entry = fx.entry(&stack, 32);
    let top = fx.build::<Amd64>(&mut stack, entry, &[Leaf, Callee]);

    // the callee's parameters are the caller's two top operands
    let frames = stack_frames::<Amd64, _>(&stack, &fx.code, &entry, top).unwrap();
    let LogicalFrame::Interpreted { locals, .. } = &frames[0] else {
        panic!("expected an interpreted callee");
    };
    let LogicalFrame::Interpreted { operands, .. } = &frames[1] else {
        panic!("expected an interpreted caller");
    };
    assert_eq!(&locals[..2], &[230, 231]);
    assert_eq!(&operands[1..], &[230, 231]);

    let mut cont = Continuation::new(entry, ContinuationConfig::verified());
    cont.freeze::<Amd64>(&stack, &fx.code, top).unwrap();

    let chunk = cont.chunk();
    let in_chunk = chunk_frames::<Amd64>(&chunk.read(), &fx.code).unwrap();
    assert_eq!(in_chunk, frames);
    assert_eq!(chunk.read().argsize(), 0);
}

#[test]
fn test_partial_thaw_then_refreeze() {
    let mut fx = Fixture::new();
    let mut stack = MachineStack::new(0, 1024);
    let entry = fx.entry(&stack, 64);
    let top = fx.build::<Amd64>(&mut stack, entry, MIXED);
    let original = stack_frames::<Amd64, _>(&stack, &fx.code, &entry, top).unwrap();

    let mut cont = Continuation::new(entry, ContinuationConfig::verified());
    cont.freeze::<Amd64>(&stack, &fx.code, top).unwrap();

    let mut running = MachineStack::new(0, 1024);
    let resumed = cont.thaw::<Amd64>(&mut running, &fx.code, ThawKind::Top(2)).unwrap();
    assert_eq!(resumed.frames, 2);
    assert_eq!(cont.num_frames(), MIXED.len() - 2);

    // the remainder is still a valid chunk
    let rest = chunk_frames::<Amd64>(&cont.chunk().read(), &fx.code).unwrap();
    assert_eq!(rest, original[2..]);
    let thawed = stack_frames::<Amd64, _>(&running, &fx.code, &entry, resumed.sp).unwrap();
    assert_eq!(thawed, original[..2]);

    // run a little further: call one more compiled frame, then suspend again
    let top = {
        let mut builder = StackBuilder::<Amd64>::resume_at(&mut running, &fx.code, entry, resumed.sp).unwrap();
        builder.push_compiled(fx.small, 0, &[], &[7, 7, 7, 7]).unwrap();
        builder.suspend().unwrap()
    };
    let refrozen = cont.freeze::<Amd64>(&running, &fx.code, top).unwrap();
    assert_eq!(refrozen.frames, 3);
    assert_eq!(cont.num_frames(), MIXED.len() + 1);

    let mut last = MachineStack::new(0, 1024);
    let resumed = cont.thaw::<Amd64>(&mut last, &fx.code, ThawKind::All).unwrap();
    let frames = stack_frames::<Amd64, _>(&last, &fx.code, &entry, resumed.sp).unwrap();
    assert_eq!(frames.len(), MIXED.len() + 1);
    assert_eq!(
        frames[0],
        LogicalFrame::Compiled {
            blob: fx.small,
            pc: fx.code.blob(fx.small).unwrap().pc_at(0),
            body: vec![7, 7, 7, 7],
            args: vec![],
        }
    );
    assert_eq!(frames[1..], original[..]);
}

#[test]
fn test_thaw_one_frame_at_a_time() {
    let mut fx = Fixture::new();
    let mut stack = MachineStack::new(0, 1024);
    let entry = fx.entry(&stack, 64);
    let top = fx.build::<Amd64>(&mut stack, entry, MIXED);
    let original = stack_frames::<Amd64, _>(&stack, &fx.code, &entry, top).unwrap();

    let mut cont = Continuation::new(entry, ContinuationConfig::verified());
    cont.freeze::<Amd64>(&stack, &fx.code, top).unwrap();

    // each step returns into the barrier, which thaws the next frame
    for (i, expected) in original.iter().enumerate() {
        let mut fresh = MachineStack::new(0, 1024);
        let resumed = cont.thaw::<Amd64>(&mut fresh, &fx.code, ThawKind::Top(1)).unwrap();
        let frames = stack_frames::<Amd64, _>(&fresh, &fx.code, &entry, resumed.sp).unwrap();
        assert_eq!(&frames, std::slice::from_ref(expected));
        assert_eq!(cont.num_frames(), original.len() - i - 1);
    }
    assert!(cont.is_empty());
}

#[test]
fn test_empty_continuation() {
    let mut fx = Fixture::new();
    let mut stack = MachineStack::new(0, 256);
    let entry = fx.entry(&stack, 32);
    let top = fx.build::<Amd64>(&mut stack, entry, &[]);
    assert_eq!(top, entry.sp);

    let mut cont = Continuation::new(entry, ContinuationConfig::verified());
    let frozen = cont.freeze::<Amd64>(&stack, &fx.code, top).unwrap();
    assert_eq!(frozen.frames, 0);
    assert!(cont.is_empty());
    assert!(ChunkFrameStream::<Amd64>::new(&cont.chunk().read(), &fx.code)
        .unwrap()
        .is_done());

    let resumed = cont.thaw::<Amd64>(&mut stack, &fx.code, ThawKind::All).unwrap();
    assert_eq!((resumed.sp, resumed.fp, resumed.pc), (entry.sp, entry.fp, entry.pc));
    assert_eq!(resumed.frames, 0);
}

#[test]
fn test_chunk_exhaustion_is_recoverable() {
    let mut fx = Fixture::new();
    let mut stack = MachineStack::new(0, 1024);
    let entry = fx.entry(&stack, 64);
    let top = fx.build::<Amd64>(&mut stack, entry, MIXED);

    let config = ContinuationConfig::verified()
        .with_initial_chunk_words(16)
        .with_max_chunk_words(32);
    let mut cont = Continuation::new(entry, config);
    let err = cont.freeze::<Amd64>(&stack, &fx.code, top).unwrap_err();
    assert!(matches!(err, ContinuationError::ChunkExhausted { max: 32, .. }));
    assert!(err.is_recoverable());
    assert!(cont.is_empty());

    // a smaller suspension still fits
    let small_top = fx.build::<Amd64>(&mut stack, entry, &[Small, Small]);
    cont.freeze::<Amd64>(&stack, &fx.code, small_top).unwrap();
    assert_eq!(cont.num_frames(), 2);
}

#[test]
fn test_chunk_grows_across_freezes() {
    let mut fx = Fixture::new();
    let mut stack = MachineStack::new(0, 1024);
    let entry = fx.entry(&stack, 64);
    let top = fx.build::<Amd64>(&mut stack, entry, MIXED);
    let original = stack_frames::<Amd64, _>(&stack, &fx.code, &entry, top).unwrap();

    let config = ContinuationConfig::verified().with_initial_chunk_words(16);
    let mut cont = Continuation::new(entry, config);

    // freeze, thaw the top three, freeze again: the second freeze appends
    cont.freeze::<Amd64>(&stack, &fx.code, top).unwrap();
    let resumed = cont.thaw::<Amd64>(&mut stack, &fx.code, ThawKind::Top(3)).unwrap();
    cont.freeze::<Amd64>(&stack, &fx.code, resumed.sp).unwrap();
    assert!(cont.chunk().read().stats().stack_size >= 16);

    let mut fresh = MachineStack::new(0, 1024);
    let resumed = cont.thaw::<Amd64>(&mut fresh, &fx.code, ThawKind::All).unwrap();
    assert_eq!(stack_frames::<Amd64, _>(&fresh, &fx.code, &entry, resumed.sp).unwrap(), original);
}

#[test]
fn test_thaw_stack_overflow_is_recoverable() {
    let mut fx = Fixture::new();
    let mut stack = MachineStack::new(0, 1024);
    let entry = fx.entry(&stack, 64);
    let top = fx.build::<Amd64>(&mut stack, entry, MIXED);

    let mut cont = Continuation::new(entry, ContinuationConfig::verified());
    cont.freeze::<Amd64>(&stack, &fx.code, top).unwrap();

    let mut tiny = MachineStack::new(0, 64);
    let cramped = fx.entry(&tiny, 32);
    cont.set_entry(cramped);
    let err = cont.thaw::<Amd64>(&mut tiny, &fx.code, ThawKind::All).unwrap_err();
    assert!(matches!(err, ContinuationError::StackOverflow { .. }));
    assert!(err.is_recoverable());
    assert_eq!(cont.num_frames(), MIXED.len());

    // a bounded thaw fits
    let resumed = cont.thaw::<Amd64>(&mut tiny, &fx.code, ThawKind::Top(1)).unwrap();
    assert_eq!(resumed.frames, 1);
}

#[test]
fn test_s390x_compiled_round_trip() {
    let mut fx = Fixture::new();
    let mut stack = MachineStack::new(0, 512);
    let entry = fx.entry(&stack, 32);
    let top = fx.build::<S390x>(&mut stack, entry, ALL_COMPILED);
    let before = stack_frames::<S390x, _>(&stack, &fx.code, &entry, top).unwrap();

    let mut cont = Continuation::new(entry, ContinuationConfig::verified());
    cont.freeze::<S390x>(&stack, &fx.code, top).unwrap();
    let mut fresh = MachineStack::new(0, 512);
    let resumed = cont.thaw::<S390x>(&mut fresh, &fx.code, ThawKind::All).unwrap();
    assert_eq!(stack_frames::<S390x, _>(&fresh, &fx.code, &entry, resumed.sp).unwrap(), before);
}

#[test]
fn test_s390x_rejects_interpreted_frames() {
    let mut fx = Fixture::new();
    let mut stack = MachineStack::new(0, 512);
    let entry = fx.entry(&stack, 32);
    let top = fx.build::<Amd64>(&mut stack, entry, &[Leaf, Small]);

    let mut cont = Continuation::new(entry, ContinuationConfig::verified());
    let err = cont.freeze::<S390x>(&stack, &fx.code, top).unwrap_err();
    let ContinuationError::Unsupported(unsupported) = &err else {
        panic!("expected Unsupported, got {err:?}");
    };
    assert_eq!(unsupported.platform, S390x::NAME);
    assert_eq!(unsupported.operation, PdOperation::InterpretedFrame);
    assert!(!err.is_recoverable());
    assert!(cont.is_empty());
}
