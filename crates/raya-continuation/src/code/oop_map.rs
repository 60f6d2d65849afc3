//! Reference-location maps for precise stack scanning
//!
//! An [`OopMap`] lists the words of a compiled frame that hold references at
//! its call sites, either as sp-relative stack slots or as callee-saved
//! registers whose spill location is resolved through a
//! [`RegisterMap`](crate::RegisterMap). Interpreted frames are described per
//! bytecode index by an [`InterpreterOopMask`].

use std::fmt;

use crate::{ContinuationError, ContinuationResult};

/// An architectural register number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VMReg(pub u8);

impl VMReg {
    /// Number of registers a [`RegisterMap`](crate::RegisterMap) can track.
    pub const COUNT: usize = 32;

    /// `rbx` on amd64
    pub const RBX: VMReg = VMReg(3);
    /// `r12` on amd64
    pub const R12: VMReg = VMReg(12);
    /// `r13` on amd64
    pub const R13: VMReg = VMReg(13);
    /// `r14` on amd64
    pub const R14: VMReg = VMReg(14);
    /// `r15` on amd64
    pub const R15: VMReg = VMReg(15);

    /// Register number as an index.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for VMReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Location of one reference in a compiled frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OopSlot {
    /// Word offset from the frame's unextended sp. Offsets at or above the
    /// frame size address the frame's incoming stack arguments.
    Stack(usize),

    /// A callee-saved register holding the reference
    Register(VMReg),
}

/// Reference map of a compiled frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OopMap {
    slots: Vec<OopSlot>,
}

impl OopMap {
    /// Create a map with no references
    pub fn none() -> Self {
        Self::default()
    }

    /// Create a map with the given stack slots
    pub fn stack(offsets: impl IntoIterator<Item = usize>) -> Self {
        Self {
            slots: offsets.into_iter().map(OopSlot::Stack).collect(),
        }
    }

    /// Add a register entry
    pub fn with_register(mut self, reg: VMReg) -> Self {
        self.slots.push(OopSlot::Register(reg));
        self
    }

    /// Check if this map contains any references
    pub fn has_oops(&self) -> bool {
        !self.slots.is_empty()
    }

    /// All entries
    pub fn slots(&self) -> &[OopSlot] {
        &self.slots
    }

    /// Iterate over stack offsets only
    pub fn stack_offsets(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            OopSlot::Stack(off) => Some(*off),
            OopSlot::Register(_) => None,
        })
    }

    /// Check that every stack slot lies in the frame body or its incoming
    /// arguments, and never on the two metadata words.
    pub fn validate(&self, frame_size: usize, stack_argsize: usize, metadata_words: usize) -> ContinuationResult<()> {
        let metadata = frame_size - metadata_words..frame_size;
        for off in self.stack_offsets() {
            if off >= frame_size + stack_argsize || metadata.contains(&off) {
                return Err(ContinuationError::invariant(format!(
                    "oop slot {off} outside frame of {frame_size} words (+{stack_argsize} args)"
                )));
            }
        }
        Ok(())
    }
}

/// Reference mask of an interpreted frame at one bytecode index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterpreterOopMask {
    /// Local indices holding references
    pub locals: Vec<usize>,
    /// Operand stack depths holding references, 0 being the deepest operand
    pub stack: Vec<usize>,
}

impl InterpreterOopMask {
    /// Create a mask
    pub fn new(locals: Vec<usize>, stack: Vec<usize>) -> Self {
        Self { locals, stack }
    }

    /// Check if this mask marks any references
    pub fn has_oops(&self) -> bool {
        !self.locals.is_empty() || !self.stack.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_map() {
        let map = OopMap::stack([0, 3]).with_register(VMReg::R12);
        assert!(map.has_oops());
        assert_eq!(map.stack_offsets().collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(map.slots().len(), 3);
    }

    #[test]
    fn test_validate_rejects_metadata_slot() {
        assert!(OopMap::stack([3]).validate(6, 0, 2).is_ok());
        assert!(OopMap::stack([4]).validate(6, 0, 2).is_err());
        assert!(OopMap::stack([5]).validate(6, 0, 2).is_err());
        // incoming argument
        assert!(OopMap::stack([6]).validate(6, 1, 2).is_ok());
        assert!(OopMap::stack([7]).validate(6, 1, 2).is_err());
    }

    #[test]
    fn test_empty_mask() {
        assert!(!InterpreterOopMask::default().has_oops());
        assert!(InterpreterOopMask::new(vec![1], vec![]).has_oops());
    }
}
