//! Test fixtures: a tiny fixed-width guest ISA and a host environment.
//!
//! Instruction words are 32 bits with the opcode in the top byte:
//!
//! | op   | mnemonic       | effect                                   |
//! |------|----------------|------------------------------------------|
//! | 0x01 | `movz rd, imm` | rd = imm16                               |
//! | 0x02 | `addi rd, imm` | rd += imm16                              |
//! | 0x03 | `b off`        | branch by `off` words (linked)           |
//! | 0x04 | `bl off`       | x30 = pc + 4, push return hint, branch   |
//! | 0x05 | `ret`          | branch to x30 through the return hint    |
//! | 0x06 | `bfast off`    | branch ignoring the tick budget          |
//! | 0x07 | `dead rd`      | computes rd + 1 and discards it          |
//! | else | undefined      | branch to self                           |
//!
//! Every instruction costs one cycle.

use std::collections::HashMap;

use crate::backend::Translator;
use crate::config::{JitConfig, UserCallbacks, UserConfig};
use crate::ir::{Block, Opcode, Terminal, Value};
use crate::location::LocationDescriptor;
use crate::threaded::ThreadedJit;

pub(crate) const MAX_BLOCK_INSNS: usize = 32;

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn reg_imm(op: u32, rd: u8, imm: u16) -> u32 {
    (op << 24) | ((rd as u32 & 0x1F) << 16) | imm as u32
}

fn branch(op: u32, offset_words: i32) -> u32 {
    (op << 24) | (offset_words as u32 & 0x00FF_FFFF)
}

pub(crate) fn movz(rd: u8, imm: u16) -> u32 {
    reg_imm(0x01, rd, imm)
}

pub(crate) fn addi(rd: u8, imm: u16) -> u32 {
    reg_imm(0x02, rd, imm)
}

pub(crate) fn b(offset_words: i32) -> u32 {
    branch(0x03, offset_words)
}

pub(crate) fn bl(offset_words: i32) -> u32 {
    branch(0x04, offset_words)
}

pub(crate) fn ret() -> u32 {
    0x05 << 24
}

pub(crate) fn bfast(offset_words: i32) -> u32 {
    branch(0x06, offset_words)
}

pub(crate) fn dead(rd: u8) -> u32 {
    reg_imm(0x07, rd, 0)
}

/// Translator for the toy ISA. Records the PC of every translation.
#[derive(Debug, Default)]
pub(crate) struct ToyTranslator {
    pub(crate) translations: Vec<u64>,
}

impl Translator for ToyTranslator {
    fn translate(
        &mut self,
        location: LocationDescriptor,
        read_code: &mut dyn FnMut(u64) -> u32,
    ) -> Block {
        self.translations.push(location.pc());
        let mut block = Block::new(location);
        let mut pc = location.pc();

        for _ in 0..MAX_BLOCK_INSNS {
            let word = read_code(pc);
            let rd = ((word >> 16) & 0x1F) as u8;
            let imm = (word & 0xFFFF) as u64;
            let target = location
                .set_pc(pc)
                .advance_pc((((word << 8) as i32) >> 8) as i64 * 4);
            let next = location.set_pc(pc + 4);
            block.add_cycles(1);

            let terminal = match word >> 24 {
                0x01 => {
                    block.append(Opcode::SetRegister(rd), &[Value::Imm(imm)]);
                    None
                }
                0x02 => {
                    let v = block.append(Opcode::GetRegister(rd), &[]);
                    let sum = block.append(Opcode::Add, &[v, Value::Imm(imm)]);
                    block.append(Opcode::SetRegister(rd), &[sum]);
                    None
                }
                0x03 => Some(Terminal::LinkBlock { next: target }),
                0x04 => {
                    block.append(Opcode::SetRegister(30), &[Value::Imm(next.pc())]);
                    block.append(Opcode::PushRSB, &[Value::Imm(next.unique_hash())]);
                    Some(Terminal::LinkBlock { next: target })
                }
                0x05 => {
                    let lr = block.append(Opcode::GetRegister(30), &[]);
                    block.append(Opcode::SetPC, &[lr]);
                    Some(Terminal::PopRSBHint)
                }
                0x06 => Some(Terminal::LinkBlockFast { next: target }),
                0x07 => {
                    let v = block.append(Opcode::GetRegister(rd), &[]);
                    block.append(Opcode::Add, &[v, Value::Imm(1)]);
                    None
                }
                _ => Some(Terminal::CheckHalt {
                    else_: Box::new(Terminal::LinkBlock {
                        next: location.set_pc(pc),
                    }),
                }),
            };

            pc += 4;
            if let Some(terminal) = terminal {
                block.set_end_location(next);
                block.set_terminal(terminal);
                return block;
            }
        }

        let next = location.set_pc(pc);
        block.set_end_location(next);
        block.set_terminal(Terminal::LinkBlock { next });
        block
    }
}

/// Host environment backed by a sparse word map.
#[derive(Default)]
pub(crate) struct TestEnv {
    pub(crate) code: HashMap<u64, u32>,
    pub(crate) ticks_left: u64,
    pub(crate) ticks_added: u64,
    /// Called on every code fetch, before the word is returned.
    pub(crate) on_read: Option<Box<dyn FnMut(u64)>>,
}

impl TestEnv {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_program(base: u64, words: &[u32]) -> Self {
        let mut env = Self::new();
        env.load(base, words);
        env
    }

    pub(crate) fn load(&mut self, base: u64, words: &[u32]) {
        for (i, &word) in words.iter().enumerate() {
            self.code.insert(base + i as u64 * 4, word);
        }
    }
}

impl UserCallbacks for TestEnv {
    fn memory_read_code(&mut self, vaddr: u64) -> u32 {
        if let Some(hook) = self.on_read.as_mut() {
            hook(vaddr);
        }
        self.code.get(&vaddr).copied().unwrap_or(0)
    }

    fn add_ticks(&mut self, ticks: u64) {
        self.ticks_added += ticks;
        self.ticks_left = self.ticks_left.saturating_sub(ticks);
    }

    fn get_ticks_remaining(&mut self) -> u64 {
        self.ticks_left
    }
}

pub(crate) fn threaded_jit(env: TestEnv, config: JitConfig) -> ThreadedJit<TestEnv, ToyTranslator> {
    init_logging();
    ThreadedJit::with_threaded_backend(UserConfig::with_config(env, config), ToyTranslator::default())
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BlockEmitter;
    use crate::config::{TickAccounting, MIN_LOW_WATER_MARK};
    use crate::threaded::{ThreadedEmitter, ThreadedRuntime};

    fn translate(env: &mut TestEnv, pc: u64) -> Block {
        ToyTranslator::default().translate(LocationDescriptor::new(pc, 0), &mut |a| {
            env.memory_read_code(a)
        })
    }

    #[test]
    fn test_branch_encoding_sign_extends() {
        let mut env = TestEnv::with_program(0x1000, &[b(-4)]);
        let block = translate(&mut env, 0x1000);
        assert_eq!(
            block.terminal(),
            &Terminal::LinkBlock {
                next: LocationDescriptor::new(0xFF0, 0)
            }
        );
        assert_eq!(block.guest_range(), (0x1000, 0x1003));
    }

    #[test]
    fn test_straight_line_block_is_capped() {
        let words = vec![addi(0, 1); MAX_BLOCK_INSNS + 4];
        let mut env = TestEnv::with_program(0, &words);
        let block = translate(&mut env, 0);
        assert_eq!(block.cycle_count(), MAX_BLOCK_INSNS as u64);
        assert_eq!(block.end_location().pc(), MAX_BLOCK_INSNS as u64 * 4);
    }

    #[test]
    fn test_longest_block_fits_low_water_mark() {
        let words = vec![addi(0, 1); MAX_BLOCK_INSNS];
        let mut env = TestEnv::with_program(0, &words);
        let block = translate(&mut env, 0);
        let mut rt = ThreadedRuntime::new(MIN_LOW_WATER_MARK, TickAccounting::AfterBlock);
        let desc = ThreadedEmitter::new().emit(&mut rt, &block);
        assert!(desc.size <= MIN_LOW_WATER_MARK);
    }

    #[test]
    fn test_bfast_runs_past_budget() {
        // 0x0: bfast 0x4    0x4: addi x0, #1; b 0x8
        let env = TestEnv::with_program(0, &[bfast(1), addi(0, 1), b(0)]);
        let mut jit = threaded_jit(env, JitConfig::default());
        jit.callbacks_mut().ticks_left = 1;
        jit.run();
        assert_eq!(jit.get_register(0).unwrap(), 1);
        assert_eq!(jit.callbacks().ticks_added, 3);
    }

    #[test]
    fn test_undefined_word_spins_until_budget() {
        let mut jit = threaded_jit(TestEnv::new(), JitConfig::default());
        jit.callbacks_mut().ticks_left = 5;
        jit.set_pc(0x4000);
        jit.run();
        assert_eq!(jit.get_pc(), 0x4000);
        assert_eq!(jit.callbacks().ticks_added, 5);
        assert_eq!(jit.translator().translations, vec![0x4000]);
    }
}
