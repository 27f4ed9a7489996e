//! Collaborator interfaces.
//!
//! The coordinator does not decode guest instructions, emit host code or
//! transfer control into generated code itself. Those capabilities are
//! supplied per guest/host pairing through the traits below and resolved at
//! compile time through generics.

use crate::interval::IntervalSet;
use crate::ir;
use crate::location::LocationDescriptor;
use crate::state::GuestState;

/// Handle to a host entry point, interpreted by the owning runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodePtr(pub usize);

/// A compiled block as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDescriptor {
    pub entrypoint: CodePtr,
    /// Host code size in bytes.
    pub size: usize,
}

/// Guest bytes → IR.
pub trait Translator {
    /// Translate the basic block at `location`.
    ///
    /// `read_code` fetches guest code words and may be called any number of
    /// times.
    fn translate(
        &mut self,
        location: LocationDescriptor,
        read_code: &mut dyn FnMut(u64) -> u32,
    ) -> ir::Block;
}

/// Cache/emit collaborator: owns the block table keyed by context hash.
pub trait BlockEmitter<R> {
    /// Existing block compiled for `location`, if any.
    fn get_basic_block(&self, location: LocationDescriptor) -> Option<BlockDescriptor>;

    /// Lower an optimized block into `code` and register it under its
    /// location.
    fn emit(&mut self, code: &mut R, block: &ir::Block) -> BlockDescriptor;

    /// Drop every block from the table.
    fn clear_cache(&mut self);

    /// Drop every block whose guest range overlaps `ranges`.
    fn invalidate_cache_ranges(&mut self, code: &mut R, ranges: &IntervalSet);
}

/// Callbacks generated code uses to reach back into the coordinator.
///
/// All of these run synchronously on the stack of the `run_code` call that
/// invoked them.
pub trait RunCodeCallbacks<R> {
    /// Entry point for the block at the current guest context, compiling it
    /// first if needed.
    fn lookup_block(&mut self, code: &mut R, state: &mut GuestState) -> CodePtr;

    fn add_ticks(&mut self, ticks: u64);

    fn get_ticks_remaining(&mut self) -> u64;
}

/// Code buffer runtime: owns executable memory and enters generated code.
pub trait CodeRuntime: Sized {
    /// Run generated code for `state` until it halts or runs out of ticks.
    fn run_code<K: RunCodeCallbacks<Self>>(&mut self, state: &mut GuestState, callbacks: &mut K);

    /// Bytes of code memory still available.
    fn space_remaining(&self) -> usize;

    /// Discard all generated code.
    fn clear_cache(&mut self);
}
