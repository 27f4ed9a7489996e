//! Lowers IR blocks into threaded ops and keeps the block table.

use std::collections::HashMap;

use crate::backend::{BlockDescriptor, BlockEmitter};
use crate::interval::IntervalSet;
use crate::ir::{self, Value};
use crate::location::LocationDescriptor;

use super::runtime::{CompiledBlock, Operand, ThreadedOp, ThreadedRuntime};

/// Block table entry.
#[derive(Debug, Clone, Copy)]
struct EmittedBlock {
    descriptor: BlockDescriptor,
    /// Inclusive guest address range the block was translated from
    guest_range: (u64, u64),
}

/// Block table keyed by location hash.
#[derive(Debug, Default)]
pub struct ThreadedEmitter {
    blocks: HashMap<u64, EmittedBlock>,
}

impl ThreadedEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Guest range recorded for the block at `location`.
    pub fn guest_range(&self, location: LocationDescriptor) -> Option<(u64, u64)> {
        self.blocks
            .get(&location.unique_hash())
            .map(|b| b.guest_range)
    }
}

fn operand(value: Value) -> Operand {
    match value {
        Value::Imm(v) => Operand::Imm(v),
        Value::Inst(r) => Operand::Slot(r.0),
    }
}

/// One op per live instruction; each instruction's result lives in the slot
/// numbered after it.
fn lower(block: &ir::Block) -> CompiledBlock {
    let ops = block
        .insts()
        .filter(|(_, inst)| !inst.is_void())
        .map(|(r, inst)| {
            let mut args = [Operand::Imm(0); 2];
            for (slot, arg) in args.iter_mut().zip(&inst.args) {
                *slot = operand(*arg);
            }
            ThreadedOp {
                opcode: inst.opcode,
                args,
                dest: r.0,
            }
        })
        .collect();

    CompiledBlock::new(
        block.location(),
        ops,
        block.len(),
        block.terminal().clone(),
        block.cycle_count(),
    )
}

impl BlockEmitter<ThreadedRuntime> for ThreadedEmitter {
    fn get_basic_block(&self, location: LocationDescriptor) -> Option<BlockDescriptor> {
        self.blocks.get(&location.unique_hash()).map(|b| b.descriptor)
    }

    fn emit(&mut self, code: &mut ThreadedRuntime, block: &ir::Block) -> BlockDescriptor {
        let descriptor = code.install(lower(block));
        let entry = EmittedBlock {
            descriptor,
            guest_range: block.guest_range(),
        };
        if let Some(old) = self.blocks.insert(block.location().unique_hash(), entry) {
            log::warn!(
                "[JIT] Replaced existing block at {} ({:?})",
                block.location(),
                old.descriptor.entrypoint
            );
        }
        descriptor
    }

    fn clear_cache(&mut self) {
        self.blocks.clear();
    }

    fn invalidate_cache_ranges(&mut self, code: &mut ThreadedRuntime, ranges: &IntervalSet) {
        let before = self.blocks.len();
        self.blocks.retain(|_, b| {
            let (lo, hi) = b.guest_range;
            if ranges.overlaps(lo, hi) {
                code.retire(b.descriptor.entrypoint);
                false
            } else {
                true
            }
        });
        log::debug!(
            "[JIT] Range invalidation dropped {} of {} blocks",
            before - self.blocks.len(),
            before
        );
    }
}
