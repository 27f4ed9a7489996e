//! Threaded-code runtime.
//!
//! Blocks are stored as flat op lists in an append-only arena that behaves
//! like an executable code buffer: retiring a block makes it unreachable but
//! does not give its bytes back. Only a full clear rewinds the arena.

use std::collections::HashMap;

use crate::backend::{BlockDescriptor, CodePtr, CodeRuntime, RunCodeCallbacks};
use crate::config::{JitConfig, TickAccounting};
use crate::ir::{Opcode, Terminal};
use crate::location::LocationDescriptor;
use crate::state::{GuestState, SP_INDEX};

/// Fixed bytes charged per block on top of its ops.
pub(crate) const BLOCK_HEADER_SIZE: usize = 64;

/// Bytes charged per op.
pub(crate) const OP_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operand {
    Imm(u64),
    Slot(u32),
}

/// One lowered IR instruction. Results go to `slots[dest]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ThreadedOp {
    pub(crate) opcode: Opcode,
    pub(crate) args: [Operand; 2],
    pub(crate) dest: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct CompiledBlock {
    pub(crate) location: LocationDescriptor,
    pub(crate) ops: Vec<ThreadedOp>,
    pub(crate) slot_count: usize,
    pub(crate) terminal: Terminal,
    pub(crate) cycles: u64,
    live: bool,
}

impl CompiledBlock {
    pub(crate) fn new(
        location: LocationDescriptor,
        ops: Vec<ThreadedOp>,
        slot_count: usize,
        terminal: Terminal,
        cycles: u64,
    ) -> Self {
        Self {
            location,
            ops,
            slot_count,
            terminal,
            cycles,
            live: true,
        }
    }

    pub(crate) fn size(&self) -> usize {
        BLOCK_HEADER_SIZE + self.ops.len() * OP_SIZE
    }
}

/// What the dispatcher does after a block's terminal.
enum Dispatch {
    Exit,
    Continue {
        next: Option<CodePtr>,
        /// Skip the budget check before the next block.
        forced: bool,
    },
}

/// Code memory and dispatcher for threaded code.
pub struct ThreadedRuntime {
    capacity: usize,
    used: usize,
    blocks: Vec<CompiledBlock>,
    /// Live entry point per location hash.
    entries: HashMap<u64, CodePtr>,
    tick_accounting: TickAccounting,
}

impl ThreadedRuntime {
    pub fn new(capacity: usize, tick_accounting: TickAccounting) -> Self {
        Self {
            capacity,
            used: 0,
            blocks: Vec::new(),
            entries: HashMap::new(),
            tick_accounting,
        }
    }

    pub fn with_config(config: &JitConfig) -> Self {
        Self::new(config.code_cache_size, config.tick_accounting)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes consumed since the last full clear, including retired blocks.
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn live_blocks(&self) -> usize {
        self.entries.len()
    }

    pub fn entry_for(&self, location: LocationDescriptor) -> Option<CodePtr> {
        self.entries.get(&location.unique_hash()).copied()
    }

    pub fn is_live(&self, ptr: CodePtr) -> bool {
        self.blocks.get(ptr.0).is_some_and(|b| b.live)
    }

    /// Copy a block into code memory.
    ///
    /// Panics if the block does not fit; the coordinator's low-water mark
    /// must keep enough headroom for any single block.
    pub(crate) fn install(&mut self, block: CompiledBlock) -> BlockDescriptor {
        let size = block.size();
        assert!(
            size <= self.space_remaining(),
            "code buffer overflow: {} bytes needed, {} left",
            size,
            self.space_remaining()
        );

        let entrypoint = CodePtr(self.blocks.len());
        let hash = block.location.unique_hash();
        if let Some(old) = self.entries.insert(hash, entrypoint) {
            self.blocks[old.0].live = false;
        }
        self.blocks.push(block);
        self.used += size;

        BlockDescriptor { entrypoint, size }
    }

    /// Make a block unreachable. Its bytes stay allocated.
    pub(crate) fn retire(&mut self, ptr: CodePtr) {
        let Some(block) = self.blocks.get_mut(ptr.0) else {
            return;
        };
        block.live = false;
        let hash = block.location.unique_hash();
        if self.entries.get(&hash) == Some(&ptr) {
            self.entries.remove(&hash);
        }
    }

    /// A predicted entry is usable only if it is live and compiled for the
    /// state's current context.
    fn accepts(&self, ptr: CodePtr, state: &GuestState) -> bool {
        self.blocks
            .get(ptr.0)
            .is_some_and(|b| b.live && b.location.unique_hash() == state.unique_hash())
    }

    fn execute(&self, entry: CodePtr, state: &mut GuestState) -> Dispatch {
        let block = &self.blocks[entry.0];
        let mut slots = vec![0u64; block.slot_count];

        for op in &block.ops {
            let arg = |i: usize| match op.args[i] {
                Operand::Imm(v) => v,
                Operand::Slot(s) => slots[s as usize],
            };
            let (a, b) = (arg(0), arg(1));

            let result = match op.opcode {
                Opcode::Void => None,
                Opcode::GetRegister(r) => Some(read_gpr(state, r)),
                Opcode::SetRegister(r) => {
                    write_gpr(state, r, a);
                    None
                }
                Opcode::GetSP => Some(state.sp),
                Opcode::SetSP => {
                    state.sp = a;
                    None
                }
                Opcode::SetPC => {
                    state.pc = a;
                    None
                }
                Opcode::GetNZCV => Some(state.get_pstate() as u64),
                Opcode::SetNZCV => {
                    state.set_pstate(a as u32);
                    None
                }
                Opcode::Add => Some(a.wrapping_add(b)),
                Opcode::Sub => Some(a.wrapping_sub(b)),
                Opcode::And => Some(a & b),
                Opcode::Or => Some(a | b),
                Opcode::Eor => Some(a ^ b),
                Opcode::LogicalShiftLeft => Some(a.wrapping_shl(b as u32)),
                Opcode::LogicalShiftRight => Some(a.wrapping_shr(b as u32)),
                Opcode::PushRSB => {
                    state.rsb.push(a, self.entries.get(&a).copied());
                    None
                }
            };

            if let Some(value) = result {
                slots[op.dest as usize] = value;
            }
        }

        resolve(&block.terminal, state)
    }
}

fn read_gpr(state: &GuestState, r: u8) -> u64 {
    match r as usize {
        SP_INDEX => state.sp,
        idx => state.reg[idx],
    }
}

fn write_gpr(state: &mut GuestState, r: u8, value: u64) {
    match r as usize {
        SP_INDEX => state.sp = value,
        idx => state.reg[idx] = value,
    }
}

fn resolve(terminal: &Terminal, state: &mut GuestState) -> Dispatch {
    match terminal {
        Terminal::Invalid => unreachable!("unverified block reached the dispatcher"),
        Terminal::ReturnToDispatch => Dispatch::Continue {
            next: None,
            forced: false,
        },
        Terminal::LinkBlock { next } => {
            state.pc = next.pc();
            Dispatch::Continue {
                next: None,
                forced: false,
            }
        }
        Terminal::LinkBlockFast { next } => {
            state.pc = next.pc();
            Dispatch::Continue {
                next: None,
                forced: true,
            }
        }
        Terminal::PopRSBHint => {
            let (hash, ptr) = state.rsb.pop();
            let next = if hash == state.unique_hash() { ptr } else { None };
            Dispatch::Continue { next, forced: false }
        }
        Terminal::CheckHalt { else_ } => {
            if state.halt_flag().is_requested() {
                Dispatch::Exit
            } else {
                resolve(else_, state)
            }
        }
    }
}

impl CodeRuntime for ThreadedRuntime {
    fn run_code<K: RunCodeCallbacks<Self>>(&mut self, state: &mut GuestState, callbacks: &mut K) {
        let budget = callbacks.get_ticks_remaining();
        let mut consumed: u64 = 0;
        let mut next: Option<CodePtr> = None;
        let mut forced = false;
        let mut entered = false;

        loop {
            if state.halt_flag().is_requested() {
                break;
            }
            if !forced && consumed >= budget {
                break;
            }

            let entry = match next.take() {
                Some(ptr) if self.accepts(ptr, state) => ptr,
                _ => callbacks.lookup_block(self, state),
            };

            let Some(block) = self.blocks.get(entry.0) else {
                panic!("unknown code pointer {entry:?}");
            };
            let cycles = block.cycles;
            if self.tick_accounting == TickAccounting::BeforeBlock {
                if entered && !forced && consumed + cycles > budget {
                    break;
                }
                consumed += cycles;
            }

            let dispatch = self.execute(entry, state);
            entered = true;

            if self.tick_accounting == TickAccounting::AfterBlock {
                consumed += cycles;
            }

            match dispatch {
                Dispatch::Exit => break,
                Dispatch::Continue { next: n, forced: f } => {
                    next = n;
                    forced = f;
                }
            }
        }

        callbacks.add_ticks(consumed);
    }

    fn space_remaining(&self) -> usize {
        self.capacity.saturating_sub(self.used)
    }

    fn clear_cache(&mut self) {
        self.blocks.clear();
        self.entries.clear();
        self.used = 0;
    }
}
