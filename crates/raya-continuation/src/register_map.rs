//! Callee-saved register locations
//!
//! While walking from a frame to its caller, every compiled frame that
//! spilled callee-saved registers records where it put them. A caller whose
//! [`OopMap`](crate::OopMap) names a register then finds the reference in
//! that slot. The map is transient: one per walk, valid for the segment the
//! walk runs over.

use crate::code::{CodeBlob, VMReg};
use crate::frame::Frame;
use crate::Address;

/// Where each callee-saved register currently lives
#[derive(Debug, Clone)]
pub struct RegisterMap {
    locations: [Option<Address>; VMReg::COUNT],
    /// Whether locations are recorded at all (false for walks that only need
    /// frame boundaries)
    update: bool,
}

impl RegisterMap {
    /// Create an empty map that records spill locations
    pub fn new() -> Self {
        Self {
            locations: [None; VMReg::COUNT],
            update: true,
        }
    }

    /// Create a map that ignores spills
    pub fn skip() -> Self {
        Self {
            update: false,
            ..Self::new()
        }
    }

    /// Whether spills are recorded
    #[inline]
    pub fn update_map(&self) -> bool {
        self.update
    }

    /// Location of `reg`, if a walked callee saved it
    #[inline]
    pub fn location(&self, reg: VMReg) -> Option<Address> {
        self.locations.get(reg.index()).copied().flatten()
    }

    /// Record that `reg` was saved at `addr`
    #[inline]
    pub fn set_location(&mut self, reg: VMReg, addr: Address) {
        if let Some(slot) = self.locations.get_mut(reg.index()) {
            *slot = Some(addr);
        }
    }

    /// Record the spills of compiled `frame` before moving to its caller
    pub fn update_for_frame(&mut self, frame: &Frame, blob: &CodeBlob) {
        if !self.update {
            return;
        }
        for &(reg, sp_offset) in &blob.saved_registers {
            self.set_location(reg, frame.unextended_sp + sp_offset);
        }
    }

    /// Forget all locations
    pub fn clear(&mut self) {
        self.locations = [None; VMReg::COUNT];
    }
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::BlobId;
    use crate::frame::FrameKind;

    fn compiled(usp: Address) -> Frame {
        Frame {
            sp: usp,
            unextended_sp: usp,
            fp: usp + 4,
            pc: 0,
            kind: FrameKind::Compiled(BlobId(0)),
            relativized: false,
        }
    }

    #[test]
    fn test_update_records_spills() {
        let blob = CodeBlob::new("c", 6, 0)
            .with_saved_register(VMReg::R12, 1)
            .with_saved_register(VMReg::RBX, 3);
        let mut map = RegisterMap::new();
        map.update_for_frame(&compiled(100), &blob);
        assert_eq!(map.location(VMReg::R12), Some(101));
        assert_eq!(map.location(VMReg::RBX), Some(103));
        assert_eq!(map.location(VMReg::R13), None);

        // walking on, an older frame spilling the same register takes over
        map.update_for_frame(&compiled(200), &blob);
        assert_eq!(map.location(VMReg::R12), Some(201));

        map.clear();
        assert_eq!(map.location(VMReg::R12), None);
    }

    #[test]
    fn test_skip_map() {
        let blob = CodeBlob::new("c", 6, 0).with_saved_register(VMReg::R12, 1);
        let mut map = RegisterMap::skip();
        map.update_for_frame(&compiled(100), &blob);
        assert!(!map.update_map());
        assert_eq!(map.location(VMReg::R12), None);
    }

    #[test]
    fn test_out_of_range_register_ignored() {
        let mut map = RegisterMap::new();
        map.set_location(VMReg(200), 5);
        assert_eq!(map.location(VMReg(200)), None);
    }
}
