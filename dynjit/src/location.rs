//! Context key for compiled code.
//!
//! A `LocationDescriptor` identifies which compiled variant of guest code
//! applies: the program counter plus every execution-mode bit that changes
//! how the code at that address must be compiled.

use std::fmt;

/// Bits of the program counter that take part in the key.
pub const PC_MASK: u64 = 0x00FF_FFFF_FFFF_FFFF;

/// FPCR bits that affect code generation (AHP, DN, FZ, RMode, FZ16).
pub const FPCR_MASK: u32 = 0x07C8_0000;

/// Shift placing the FPCR mode bits above the program counter.
const FPCR_SHIFT: u32 = 37;

/// Program counter + mode bits. Equal descriptors compile to identical code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocationDescriptor {
    pc: u64,
    fpcr: u32,
}

impl LocationDescriptor {
    pub fn new(pc: u64, fpcr: u32) -> Self {
        Self {
            pc: pc & PC_MASK,
            fpcr: fpcr & FPCR_MASK,
        }
    }

    /// Rebuild a descriptor from a value produced by [`unique_hash`](Self::unique_hash).
    pub fn from_hash(hash: u64) -> Self {
        Self {
            pc: hash & PC_MASK,
            fpcr: (hash >> FPCR_SHIFT) as u32 & FPCR_MASK,
        }
    }

    #[inline]
    pub fn pc(&self) -> u64 {
        self.pc
    }

    #[inline]
    pub fn fpcr(&self) -> u32 {
        self.fpcr
    }

    /// Same mode bits, different program counter.
    pub fn set_pc(&self, pc: u64) -> Self {
        Self::new(pc, self.fpcr)
    }

    /// Advance the program counter by `amount` bytes (may be negative).
    pub fn advance_pc(&self, amount: i64) -> Self {
        self.set_pc(self.pc.wrapping_add_signed(amount))
    }

    /// Pack the descriptor into a single `u64` usable as a hash-table key.
    #[inline]
    pub fn unique_hash(&self) -> u64 {
        self.pc | ((self.fpcr as u64) << FPCR_SHIFT)
    }
}

impl fmt::Display for LocationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{:016x}, fpcr={:08x}}}", self.pc, self.fpcr)
    }
}
