//! Guest CPU State
//!
//! Register file, flag bits and per-context bookkeeping for one guest
//! execution context. Generated code reads and writes this structure
//! directly, so its layout is `#[repr(C)]` and field offsets are exported
//! in [`offsets`] for emitters.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ reg[0..31]   │ 31 × u64  │ X0..X30                       │
//! │ sp           │ u64       │ stack pointer (index 31)      │
//! │ pc           │ u64       │ program counter               │
//! │ vec[0..64]   │ 64 × u64  │ V0..V31 as (low, high) pairs  │
//! │ cpsr_nzcv    │ u32       │ NZCV flag bits                │
//! │ fpcr         │ u32       │ FPCR mode bits                │
//! │ rsb          │ ...       │ return stack buffer           │
//! │ halt         │ ptr       │ shared halt-request flag      │
//! └──────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::backend::CodePtr;
use crate::error::JitError;
use crate::location::{FPCR_MASK, LocationDescriptor};

/// Number of general purpose registers (X0..X30).
pub const NUM_GPRS: usize = 31;

/// Register index that aliases the stack pointer.
pub const SP_INDEX: usize = 31;

/// Number of 128-bit vector registers.
pub const NUM_VECTORS: usize = 32;

/// Processor status bits kept by the state (N, Z, C, V).
pub const PSTATE_MASK: u32 = 0xF000_0000;

/// Return stack buffer depth (must be a power of two).
pub const RSB_SIZE: usize = 8;

/// A 128-bit vector register as two 64-bit halves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Vector {
    pub low: u64,
    pub high: u64,
}

// ═══════════════════════════════════════════════════════════════════════════
// Halt Flag
// ═══════════════════════════════════════════════════════════════════════════

/// Cooperative halt request observed by generated code at safe points.
///
/// Cloning shares the flag, so a clone can be handed to another thread and
/// used to stop a running guest.
#[derive(Debug, Clone, Default)]
pub struct HaltFlag(Arc<AtomicBool>);

impl HaltFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Return Stack Buffer
// ═══════════════════════════════════════════════════════════════════════════

/// Small ring of predicted return targets for guest call/return pairs.
///
/// Entries point into compiled code, so the buffer must be reset whenever
/// any compiled code may have been discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct ReturnStackBuffer {
    ptr: usize,
    locations: [u64; RSB_SIZE],
    code_ptrs: [Option<CodePtr>; RSB_SIZE],
}

impl ReturnStackBuffer {
    pub fn new() -> Self {
        Self {
            ptr: 0,
            locations: [u64::MAX; RSB_SIZE],
            code_ptrs: [None; RSB_SIZE],
        }
    }

    /// Forget every prediction.
    pub fn reset(&mut self) {
        self.ptr = 0;
        self.locations = [u64::MAX; RSB_SIZE];
        self.code_ptrs = [None; RSB_SIZE];
    }

    /// Record a predicted return to `location_hash`, overwriting the oldest
    /// entry once the ring is full.
    pub fn push(&mut self, location_hash: u64, code_ptr: Option<CodePtr>) {
        self.ptr = (self.ptr + 1) & (RSB_SIZE - 1);
        self.locations[self.ptr] = location_hash;
        self.code_ptrs[self.ptr] = code_ptr;
    }

    /// Pop the most recent prediction. Empty slots read back as
    /// `(u64::MAX, None)`.
    pub fn pop(&mut self) -> (u64, Option<CodePtr>) {
        let entry = (self.locations[self.ptr], self.code_ptrs[self.ptr]);
        self.locations[self.ptr] = u64::MAX;
        self.code_ptrs[self.ptr] = None;
        self.ptr = (self.ptr + RSB_SIZE - 1) & (RSB_SIZE - 1);
        entry
    }

    /// True if no entry holds a prediction.
    pub fn is_clear(&self) -> bool {
        self.locations.iter().all(|&l| l == u64::MAX) && self.code_ptrs.iter().all(Option::is_none)
    }
}

impl Default for ReturnStackBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Guest State
// ═══════════════════════════════════════════════════════════════════════════

/// Register file and cache key for one guest execution context.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct GuestState {
    pub reg: [u64; NUM_GPRS],
    pub sp: u64,
    pub pc: u64,
    pub vec: [u64; NUM_VECTORS * 2],
    cpsr_nzcv: u32,
    fpcr: u32,
    pub rsb: ReturnStackBuffer,
    halt: HaltFlag,
}

impl GuestState {
    pub fn new() -> Self {
        Self {
            reg: [0; NUM_GPRS],
            sp: 0,
            pc: 0,
            vec: [0; NUM_VECTORS * 2],
            cpsr_nzcv: 0,
            fpcr: 0,
            rsb: ReturnStackBuffer::new(),
            halt: HaltFlag::new(),
        }
    }

    /// Restore the zero context. The halt flag object is kept (so handles
    /// stay connected) but cleared.
    pub fn reset(&mut self) {
        let halt = self.halt.clone();
        *self = Self {
            halt,
            ..Self::new()
        };
        self.halt.clear();
    }

    /// Context key for the current state.
    #[inline]
    pub fn location(&self) -> LocationDescriptor {
        LocationDescriptor::new(self.pc, self.fpcr)
    }

    #[inline]
    pub fn unique_hash(&self) -> u64 {
        self.location().unique_hash()
    }

    pub fn halt_flag(&self) -> &HaltFlag {
        &self.halt
    }

    // -- Register accessors --

    pub fn get_register(&self, index: usize) -> Result<u64, JitError> {
        if index == SP_INDEX {
            return Ok(self.sp);
        }
        self.reg
            .get(index)
            .copied()
            .ok_or(JitError::RegisterOutOfRange { index })
    }

    pub fn set_register(&mut self, index: usize, value: u64) -> Result<(), JitError> {
        if index == SP_INDEX {
            self.sp = value;
            return Ok(());
        }
        let slot = self
            .reg
            .get_mut(index)
            .ok_or(JitError::RegisterOutOfRange { index })?;
        *slot = value;
        Ok(())
    }

    pub fn get_vector(&self, index: usize) -> Result<Vector, JitError> {
        if index >= NUM_VECTORS {
            return Err(JitError::VectorOutOfRange { index });
        }
        Ok(Vector {
            low: self.vec[index * 2],
            high: self.vec[index * 2 + 1],
        })
    }

    pub fn set_vector(&mut self, index: usize, value: Vector) -> Result<(), JitError> {
        if index >= NUM_VECTORS {
            return Err(JitError::VectorOutOfRange { index });
        }
        self.vec[index * 2] = value.low;
        self.vec[index * 2 + 1] = value.high;
        Ok(())
    }

    // -- Status accessors --

    #[inline]
    pub fn get_pstate(&self) -> u32 {
        self.cpsr_nzcv
    }

    /// Only the NZCV bits are kept.
    #[inline]
    pub fn set_pstate(&mut self, value: u32) {
        self.cpsr_nzcv = value & PSTATE_MASK;
    }

    #[inline]
    pub fn get_fpcr(&self) -> u32 {
        self.fpcr
    }

    /// Only the mode bits that affect code generation are kept.
    #[inline]
    pub fn set_fpcr(&mut self, value: u32) {
        self.fpcr = value & FPCR_MASK;
    }
}

impl Default for GuestState {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte offsets of `GuestState` fields, for emitters that address the state
/// from generated code.
pub mod offsets {
    use super::GuestState;
    use std::mem::offset_of;

    pub const REGS_BASE: usize = offset_of!(GuestState, reg);
    pub const REG_SIZE: usize = 8;
    pub const SP: usize = offset_of!(GuestState, sp);
    pub const PC: usize = offset_of!(GuestState, pc);
    pub const VEC_BASE: usize = offset_of!(GuestState, vec);
    pub const CPSR_NZCV: usize = offset_of!(GuestState, cpsr_nzcv);
    pub const FPCR: usize = offset_of!(GuestState, fpcr);
    pub const RSB: usize = offset_of!(GuestState, rsb);

    /// Offset of general register `idx`.
    #[inline]
    pub const fn reg(idx: usize) -> usize {
        REGS_BASE + idx * REG_SIZE
    }

    /// Offset of the low half of vector register `idx`.
    #[inline]
    pub const fn vec(idx: usize) -> usize {
        VEC_BASE + idx * 16
    }
}
