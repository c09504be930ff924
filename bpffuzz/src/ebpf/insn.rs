use serde::{Deserialize, Serialize};
use std::fmt;

pub const BPF_LD: u8 = 0x00;
pub const BPF_ST: u8 = 0x02;
pub const BPF_STX: u8 = 0x03;
pub const BPF_ALU: u8 = 0x04;
pub const BPF_JMP: u8 = 0x05;
pub const BPF_ALU64: u8 = 0x07;
pub const BPF_CLASS_MASK: u8 = 0x07;

const BPF_K: u8 = 0x00;
const BPF_X: u8 = 0x08;

const BPF_IMM: u8 = 0x00;
const BPF_MEM: u8 = 0x60;

const BPF_W: u8 = 0x00;
const BPF_DW: u8 = 0x18;

const BPF_CALL: u8 = 0x80;
const BPF_EXIT: u8 = 0x90;

/// Opcode of the two-slot 64-bit immediate load.
pub const BPF_LD_IMM64: u8 = BPF_LD | BPF_IMM | BPF_DW;

/// `src_reg` marker telling the kernel the immediate is a map fd.
const BPF_PSEUDO_MAP_FD: u8 = 1;

/// An eBPF register, `R0` to `R10`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Register(u8);

impl Register {
    pub const R0: Register = Register(0);
    pub const R1: Register = Register(1);
    pub const R2: Register = Register(2);
    pub const R3: Register = Register(3);
    pub const R4: Register = Register(4);
    pub const R5: Register = Register(5);
    pub const R6: Register = Register(6);
    pub const R7: Register = Register(7);
    pub const R8: Register = Register(8);
    pub const R9: Register = Register(9);
    pub const R10: Register = Register(10);

    /// Returns the register with the given index, if it exists.
    pub fn new(index: u8) -> Option<Self> {
        (index <= 10).then_some(Register(index))
    }

    pub fn index(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Width of an ALU operation and of the probe store that records its result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperandSize {
    /// 32-bit `BPF_ALU`, upper half of the destination is zeroed.
    Word,
    /// 64-bit `BPF_ALU64`.
    DoubleWord,
}

impl OperandSize {
    pub fn bytes(self) -> u32 {
        match self {
            OperandSize::Word => 4,
            OperandSize::DoubleWord => 8,
        }
    }

    pub fn bits(self) -> u32 {
        self.bytes() * 8
    }

    /// Truncates `value` to what a store of this width leaves in a
    /// zero-initialised 8-byte slot.
    pub fn truncate(self, value: u64) -> u64 {
        match self {
            OperandSize::Word => value & u64::from(u32::MAX),
            OperandSize::DoubleWord => value,
        }
    }

    fn class(self) -> u8 {
        match self {
            OperandSize::Word => BPF_ALU,
            OperandSize::DoubleWord => BPF_ALU64,
        }
    }

    fn mem_size(self) -> u8 {
        match self {
            OperandSize::Word => BPF_W,
            OperandSize::DoubleWord => BPF_DW,
        }
    }
}

/// ALU operations the generator draws from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AluOp {
    Add,
    Sub,
    Mul,
    Div,
    Or,
    And,
    Lsh,
    Rsh,
    Neg,
    Mod,
    Xor,
    Mov,
    Arsh,
}

impl AluOp {
    pub const ALL: [AluOp; 13] = [
        AluOp::Add,
        AluOp::Sub,
        AluOp::Mul,
        AluOp::Div,
        AluOp::Or,
        AluOp::And,
        AluOp::Lsh,
        AluOp::Rsh,
        AluOp::Neg,
        AluOp::Mod,
        AluOp::Xor,
        AluOp::Mov,
        AluOp::Arsh,
    ];

    fn code(self) -> u8 {
        match self {
            AluOp::Add => 0x00,
            AluOp::Sub => 0x10,
            AluOp::Mul => 0x20,
            AluOp::Div => 0x30,
            AluOp::Or => 0x40,
            AluOp::And => 0x50,
            AluOp::Lsh => 0x60,
            AluOp::Rsh => 0x70,
            AluOp::Neg => 0x80,
            AluOp::Mod => 0x90,
            AluOp::Xor => 0xa0,
            AluOp::Mov => 0xb0,
            AluOp::Arsh => 0xc0,
        }
    }

    pub fn is_shift(self) -> bool {
        matches!(self, AluOp::Lsh | AluOp::Rsh | AluOp::Arsh)
    }

    /// `neg` only reads its destination.
    pub fn is_unary(self) -> bool {
        matches!(self, AluOp::Neg)
    }
}

/// Conditional jumps used by the probe sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JmpOp {
    Jeq,
}

impl JmpOp {
    fn code(self) -> u8 {
        match self {
            JmpOp::Jeq => 0x10,
        }
    }
}

/// One decoded eBPF instruction slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: u8,
    pub dst: Register,
    pub src: Register,
    pub offset: i16,
    pub imm: i32,
}

impl Instruction {
    fn new(opcode: u8, dst: Register, src: Register, offset: i16, imm: i32) -> Self {
        Self {
            opcode,
            dst,
            src,
            offset,
            imm,
        }
    }

    /// Packs the instruction into the little-endian `struct bpf_insn` layout.
    pub fn encode(&self) -> u64 {
        u64::from(self.opcode)
            | u64::from(self.dst.0 & 0x0f) << 8
            | u64::from(self.src.0 & 0x0f) << 12
            | u64::from(self.offset as u16) << 16
            | u64::from(self.imm as u32) << 32
    }

    /// Inverse of [`Instruction::encode`]. Returns `None` for register
    /// nibbles above R10.
    pub fn decode(word: u64) -> Option<Self> {
        Some(Self {
            opcode: word as u8,
            dst: Register::new(((word >> 8) & 0x0f) as u8)?,
            src: Register::new(((word >> 12) & 0x0f) as u8)?,
            offset: (word >> 16) as u16 as i16,
            imm: (word >> 32) as u32 as i32,
        })
    }

    pub fn class(&self) -> u8 {
        self.opcode & BPF_CLASS_MASK
    }

    pub fn alu_imm(size: OperandSize, op: AluOp, dst: Register, imm: i32) -> Self {
        Self::new(size.class() | op.code() | BPF_K, dst, Register::R0, 0, imm)
    }

    pub fn alu_reg(size: OperandSize, op: AluOp, dst: Register, src: Register) -> Self {
        Self::new(size.class() | op.code() | BPF_X, dst, src, 0, 0)
    }

    pub fn mov64_imm(dst: Register, imm: i32) -> Self {
        Self::alu_imm(OperandSize::DoubleWord, AluOp::Mov, dst, imm)
    }

    pub fn mov64_reg(dst: Register, src: Register) -> Self {
        Self::alu_reg(OperandSize::DoubleWord, AluOp::Mov, dst, src)
    }

    /// `dst = map_by_fd(fd)`, which occupies two instruction slots.
    pub fn ld_map_fd(dst: Register, fd: i32) -> [Self; 2] {
        [
            Self::new(BPF_LD_IMM64, dst, Register(BPF_PSEUDO_MAP_FD), 0, fd),
            Self::new(0, Register::R0, Register::R0, 0, 0),
        ]
    }

    /// `*(size *)(dst + offset) = imm`
    pub fn st_imm(size: OperandSize, dst: Register, offset: i16, imm: i32) -> Self {
        Self::new(BPF_ST | BPF_MEM | size.mem_size(), dst, Register::R0, offset, imm)
    }

    /// `*(size *)(dst + offset) = src`
    pub fn stx(size: OperandSize, dst: Register, src: Register, offset: i16) -> Self {
        Self::new(BPF_STX | BPF_MEM | size.mem_size(), dst, src, offset, 0)
    }

    /// `if dst <op> imm goto pc + offset`
    pub fn jmp_imm(op: JmpOp, dst: Register, imm: i32, offset: i16) -> Self {
        Self::new(BPF_JMP | op.code() | BPF_K, dst, Register::R0, offset, imm)
    }

    pub fn call(helper: i32) -> Self {
        Self::new(BPF_JMP | BPF_CALL, Register::R0, Register::R0, 0, helper)
    }

    pub fn exit() -> Self {
        Self::new(BPF_JMP | BPF_EXIT, Register::R0, Register::R0, 0, 0)
    }
}
