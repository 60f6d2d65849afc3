//! Machine stack segments
//!
//! A [`MachineStack`] is a word arena standing in for one thread's native
//! stack. It owns the address range `[base, base + len)` and grows toward
//! `base`. Chunks and stacks both implement [`Segment`], which is all the
//! frame-level code needs to read and write words.
//!
//! # Memory Layout
//!
//! ```text
//! ┌─────────────────────────────────────┐ ← end
//! │ entry frame (owned by the embedder) │
//! ├─────────────────────────────────────┤ ← entry sp
//! │ continuation frames                 │
//! │   ...                               │
//! │ top frame                           │ ← top sp
//! ├─────────────────────────────────────┤
//! │ free                                │
//! └─────────────────────────────────────┘ ← base (limit)
//! ```

use std::ops::Range;

use crate::{word_to_address, Address, ContinuationError, ContinuationResult, Word};

/// Word-addressed memory holding frames.
pub trait Segment {
    /// Valid addresses.
    fn range(&self) -> Range<Address>;

    /// Borrow `count` words starting at `addr`.
    fn words(&self, addr: Address, count: usize) -> ContinuationResult<&[Word]>;

    /// Mutably borrow `count` words starting at `addr`.
    fn words_mut(&mut self, addr: Address, count: usize) -> ContinuationResult<&mut [Word]>;

    /// Whether `addr` is inside the segment.
    #[inline]
    fn contains(&self, addr: Address) -> bool {
        self.range().contains(&addr)
    }

    /// Read one word.
    #[inline]
    fn load(&self, addr: Address) -> ContinuationResult<Word> {
        Ok(self.words(addr, 1)?[0])
    }

    /// Write one word.
    #[inline]
    fn store(&mut self, addr: Address, value: Word) -> ContinuationResult<()> {
        self.words_mut(addr, 1)?[0] = value;
        Ok(())
    }

    /// Read a word holding an absolute address.
    #[inline]
    fn load_address(&self, addr: Address) -> ContinuationResult<Address> {
        word_to_address(self.load(addr)?)
    }

    /// Write an absolute address.
    #[inline]
    fn store_address(&mut self, addr: Address, value: Address) -> ContinuationResult<()> {
        self.store(addr, value as Word)
    }
}

/// Index range of `[addr, addr + count)` inside a segment starting at `start`.
pub(crate) fn slot_range(
    segment: Range<Address>,
    addr: Address,
    count: usize,
) -> ContinuationResult<Range<usize>> {
    match addr.checked_add(count) {
        Some(end) if addr >= segment.start && end <= segment.end => {
            Ok(addr - segment.start..end - segment.start)
        }
        _ => Err(ContinuationError::invariant(format!(
            "access [{addr:#x}, +{count}) outside segment [{:#x}, {:#x})",
            segment.start, segment.end
        ))),
    }
}

/// Copy `count` words between two segments.
pub fn copy_words<S, D>(
    src: &S,
    src_addr: Address,
    dst: &mut D,
    dst_addr: Address,
    count: usize,
) -> ContinuationResult<()>
where
    S: Segment + ?Sized,
    D: Segment + ?Sized,
{
    let from = src.words(src_addr, count)?;
    dst.words_mut(dst_addr, count)?.copy_from_slice(from);
    Ok(())
}

/// Usage statistics of a machine stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackStats {
    /// Lowest address
    pub base: Address,
    /// Capacity in words
    pub capacity: usize,
    /// Lowest address written so far
    pub low_water: Address,
}

/// A native stack segment
pub struct MachineStack {
    /// Lowest address of the segment
    base: Address,

    /// Stack slots, `slots[i]` is address `base + i`
    slots: Vec<Word>,

    /// Lowest address written so far
    low_water: Address,
}

impl MachineStack {
    /// Create a zero-filled stack covering `[base, base + len)`.
    pub fn new(base: Address, len: usize) -> Self {
        Self {
            base,
            slots: vec![0; len],
            low_water: base + len,
        }
    }

    /// Lowest usable address.
    #[inline]
    pub fn base(&self) -> Address {
        self.base
    }

    /// One past the highest address.
    #[inline]
    pub fn end(&self) -> Address {
        self.base + self.slots.len()
    }

    /// Capacity in words.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Fail with [`ContinuationError::StackOverflow`] unless `needed` words
    /// fit below `sp`.
    pub fn check_room(&self, sp: Address, needed: usize) -> ContinuationResult<()> {
        match sp.checked_sub(needed) {
            Some(low) if low >= self.base => Ok(()),
            _ => Err(ContinuationError::StackOverflow {
                needed,
                sp,
                limit: self.base,
            }),
        }
    }

    /// Fill `[low, high)` with `value`, marking stale words.
    pub fn fill(&mut self, low: Address, high: Address, value: Word) -> ContinuationResult<()> {
        if high > low {
            self.words_mut(low, high - low)?.fill(value);
        }
        Ok(())
    }

    /// Get stack statistics
    pub fn stats(&self) -> StackStats {
        StackStats {
            base: self.base,
            capacity: self.slots.len(),
            low_water: self.low_water,
        }
    }
}

impl Segment for MachineStack {
    #[inline]
    fn range(&self) -> Range<Address> {
        self.base..self.end()
    }

    #[inline]
    fn words(&self, addr: Address, count: usize) -> ContinuationResult<&[Word]> {
        let range = slot_range(self.range(), addr, count)?;
        Ok(&self.slots[range])
    }

    #[inline]
    fn words_mut(&mut self, addr: Address, count: usize) -> ContinuationResult<&mut [Word]> {
        let range = slot_range(self.range(), addr, count)?;
        self.low_water = self.low_water.min(addr);
        Ok(&mut self.slots[range])
    }
}

impl std::fmt::Debug for MachineStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineStack")
            .field("base", &format_args!("{:#x}", self.base))
            .field("end", &format_args!("{:#x}", self.end()))
            .field("low_water", &format_args!("{:#x}", self.low_water))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_store() {
        let mut stack = MachineStack::new(0x1000, 64);
        stack.store(0x1010, 42).unwrap();
        assert_eq!(stack.load(0x1010).unwrap(), 42);
        assert_eq!(stack.stats().low_water, 0x1010);
    }

    #[test]
    fn test_out_of_range() {
        let mut stack = MachineStack::new(0x1000, 64);
        assert!(matches!(
            stack.load(0x0fff),
            Err(ContinuationError::InvariantViolation(_))
        ));
        assert!(stack.store(0x1040, 1).is_err());
        assert!(stack.words(0x1030, 17).is_err());
        assert!(stack.words(0x1030, 16).is_ok());
    }

    #[test]
    fn test_negative_address_word() {
        let mut stack = MachineStack::new(0, 8);
        stack.store(3, -5).unwrap();
        assert!(stack.load_address(3).is_err());
    }

    #[test]
    fn test_overflow() {
        let stack = MachineStack::new(0x1000, 64);
        assert!(stack.check_room(0x1040, 64).is_ok());
        let err = stack.check_room(0x1040, 65).unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(err, ContinuationError::StackOverflow { needed: 65, .. }));
    }

    #[test]
    fn test_copy_between_segments() {
        let mut a = MachineStack::new(0x1000, 16);
        let mut b = MachineStack::new(0x8000, 16);
        for i in 0..4 {
            a.store(0x1004 + i, i as Word + 10).unwrap();
        }
        copy_words(&a, 0x1004, &mut b, 0x8008, 4).unwrap();
        assert_eq!(b.words(0x8008, 4).unwrap(), &[10, 11, 12, 13]);
    }
}
