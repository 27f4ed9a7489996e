//! Intermediate representation for one guest basic block.
//!
//! A block is a straight-line list of instructions in SSA form followed by
//! a single terminal that says where control goes next. Instructions refer
//! to earlier results through [`InstRef`]s; each instruction tracks how many
//! times its result is used so passes can drop dead code cheaply.

use std::fmt;

use crate::location::LocationDescriptor;

/// Index of an instruction within its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstRef(pub u32);

impl InstRef {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Operand of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Imm(u64),
    Inst(InstRef),
}

impl Value {
    pub fn inst_ref(self) -> Option<InstRef> {
        match self {
            Value::Inst(r) => Some(r),
            Value::Imm(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Removed instruction.
    Void,
    GetRegister(u8),
    SetRegister(u8),
    GetSP,
    SetSP,
    SetPC,
    GetNZCV,
    SetNZCV,
    Add,
    Sub,
    And,
    Or,
    Eor,
    LogicalShiftLeft,
    LogicalShiftRight,
    /// Push a return prediction; the argument is a location hash.
    PushRSB,
}

impl Opcode {
    pub fn num_args(self) -> usize {
        match self {
            Opcode::Void | Opcode::GetRegister(_) | Opcode::GetSP | Opcode::GetNZCV => 0,
            Opcode::SetRegister(_)
            | Opcode::SetSP
            | Opcode::SetPC
            | Opcode::SetNZCV
            | Opcode::PushRSB => 1,
            Opcode::Add
            | Opcode::Sub
            | Opcode::And
            | Opcode::Or
            | Opcode::Eor
            | Opcode::LogicalShiftLeft
            | Opcode::LogicalShiftRight => 2,
        }
    }

    pub fn has_result(self) -> bool {
        matches!(
            self,
            Opcode::GetRegister(_)
                | Opcode::GetSP
                | Opcode::GetNZCV
                | Opcode::Add
                | Opcode::Sub
                | Opcode::And
                | Opcode::Or
                | Opcode::Eor
                | Opcode::LogicalShiftLeft
                | Opcode::LogicalShiftRight
        )
    }

    /// Instructions that write guest-visible state must never be removed.
    pub fn has_side_effects(self) -> bool {
        matches!(
            self,
            Opcode::SetRegister(_)
                | Opcode::SetSP
                | Opcode::SetPC
                | Opcode::SetNZCV
                | Opcode::PushRSB
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inst {
    pub opcode: Opcode,
    pub args: Vec<Value>,
    use_count: u32,
}

impl Inst {
    #[inline]
    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    #[inline]
    pub fn is_void(&self) -> bool {
        self.opcode == Opcode::Void
    }
}

/// Where control goes once the block body has executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    /// No terminal set yet; rejected by verification.
    Invalid,
    /// Return to the dispatcher, which looks up the block at the current PC.
    ReturnToDispatch,
    /// Continue at `next` if tick budget remains.
    LinkBlock { next: LocationDescriptor },
    /// Continue at `next` regardless of tick budget.
    LinkBlockFast { next: LocationDescriptor },
    /// Return through the return stack buffer prediction.
    PopRSBHint,
    /// Leave the run loop if a halt is requested, otherwise take `else_`.
    CheckHalt { else_: Box<Terminal> },
}

/// One translated guest basic block.
#[derive(Debug, Clone)]
pub struct Block {
    location: LocationDescriptor,
    end_location: LocationDescriptor,
    cycle_count: u64,
    insts: Vec<Inst>,
    terminal: Terminal,
}

impl Block {
    pub fn new(location: LocationDescriptor) -> Self {
        Self {
            location,
            end_location: location,
            cycle_count: 0,
            insts: Vec::new(),
            terminal: Terminal::Invalid,
        }
    }

    /// Append an instruction and return a value referring to its result.
    ///
    /// Panics if the argument count does not match the opcode.
    pub fn append(&mut self, opcode: Opcode, args: &[Value]) -> Value {
        assert_eq!(
            args.len(),
            opcode.num_args(),
            "{opcode:?} takes {} argument(s)",
            opcode.num_args()
        );
        for arg in args {
            if let Some(r) = arg.inst_ref() {
                self.insts[r.index()].use_count += 1;
            }
        }
        let r = InstRef(self.insts.len() as u32);
        self.insts.push(Inst {
            opcode,
            args: args.to_vec(),
            use_count: 0,
        });
        Value::Inst(r)
    }

    /// Turn the instruction into `Void`, releasing its uses of other
    /// instructions.
    pub fn invalidate(&mut self, r: InstRef) {
        let args = std::mem::take(&mut self.insts[r.index()].args);
        for arg in args {
            if let Some(used) = arg.inst_ref() {
                let inst = &mut self.insts[used.index()];
                inst.use_count = inst.use_count.saturating_sub(1);
            }
        }
        self.insts[r.index()].opcode = Opcode::Void;
    }

    pub fn inst(&self, r: InstRef) -> &Inst {
        &self.insts[r.index()]
    }

    /// Instructions with their references, including voided ones.
    pub fn insts(&self) -> impl Iterator<Item = (InstRef, &Inst)> {
        self.insts
            .iter()
            .enumerate()
            .map(|(i, inst)| (InstRef(i as u32), inst))
    }

    /// Number of live (non-void) instructions.
    pub fn live_len(&self) -> usize {
        self.insts.iter().filter(|i| !i.is_void()).count()
    }

    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    pub fn location(&self) -> LocationDescriptor {
        self.location
    }

    /// Location immediately after the last guest instruction of the block.
    pub fn end_location(&self) -> LocationDescriptor {
        self.end_location
    }

    pub fn set_end_location(&mut self, end: LocationDescriptor) {
        self.end_location = end;
    }

    /// Inclusive guest address range covered by the block.
    pub fn guest_range(&self) -> (u64, u64) {
        let start = self.location.pc();
        let end = self.end_location.pc().saturating_sub(1).max(start);
        (start, end)
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    pub fn add_cycles(&mut self, cycles: u64) {
        self.cycle_count += cycles;
    }

    pub fn terminal(&self) -> &Terminal {
        &self.terminal
    }

    pub fn set_terminal(&mut self, terminal: Terminal) {
        assert!(!self.has_terminal(), "terminal already set");
        self.terminal = terminal;
    }

    pub fn has_terminal(&self) -> bool {
        self.terminal != Terminal::Invalid
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "block {} -> {}", self.location, self.end_location)?;
        writeln!(f, "cycles: {}", self.cycle_count)?;
        for (r, inst) in self.insts() {
            if inst.is_void() {
                continue;
            }
            write!(f, "  %{:<3} = {:?}", r.0, inst.opcode)?;
            for arg in &inst.args {
                match arg {
                    Value::Imm(v) => write!(f, " #{v:#x}")?,
                    Value::Inst(a) => write!(f, " %{}", a.0)?,
                }
            }
            writeln!(f, "  (uses: {})", inst.use_count)?;
        }
        write!(f, "terminal: {:?}", self.terminal)
    }
}
