//! Fixed optimization pipeline run over every translated block.
//!
//! Dead-code elimination drops unused pure instructions; the verification
//! pass then checks the block is internally consistent. A block failing
//! verification means the translator or an earlier pass is broken, so the
//! pass panics instead of returning an error.

use crate::ir::{Block, InstRef, Opcode, Terminal};
use crate::state::SP_INDEX;

/// Void every side-effect-free instruction whose result is never used.
///
/// Walks backwards so that chains of dead values are removed in one pass.
pub fn dead_code_elimination(block: &mut Block) {
    for idx in (0..block.len()).rev() {
        let r = InstRef(idx as u32);
        let inst = block.inst(r);
        if !inst.is_void() && !inst.opcode.has_side_effects() && inst.use_count() == 0 {
            block.invalidate(r);
        }
    }
}

/// Assert the block is well formed.
pub fn verification_pass(block: &Block) {
    assert!(
        !matches!(block.terminal(), Terminal::Invalid),
        "block at {} has no terminal",
        block.location()
    );

    let mut uses = vec![0u32; block.len()];
    for (r, inst) in block.insts() {
        if inst.is_void() {
            assert!(inst.args.is_empty(), "void instruction %{} keeps arguments", r.0);
            continue;
        }
        assert_eq!(
            inst.args.len(),
            inst.opcode.num_args(),
            "instruction %{} ({:?}) has wrong argument count",
            r.0,
            inst.opcode
        );
        if let Opcode::GetRegister(reg) | Opcode::SetRegister(reg) = inst.opcode {
            assert!(
                (reg as usize) <= SP_INDEX,
                "instruction %{} names register {reg}",
                r.0
            );
        }
        for arg in &inst.args {
            let Some(used) = arg.inst_ref() else {
                continue;
            };
            assert!(used < r, "instruction %{} uses later value %{}", r.0, used.0);
            let source = block.inst(used);
            assert!(
                !source.is_void() && source.opcode.has_result(),
                "instruction %{} uses %{} which produces no value",
                r.0,
                used.0
            );
            uses[used.index()] += 1;
        }
    }

    for (r, inst) in block.insts() {
        assert_eq!(
            inst.use_count(),
            uses[r.index()],
            "use count of %{} is out of sync",
            r.0
        );
    }
}
