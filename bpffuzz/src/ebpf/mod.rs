//! A minimal eBPF instruction encoder.
//!
//! Only the subset needed by the generator is covered: ALU operations,
//! 64-bit immediate loads of map file descriptors, memory stores, a
//! conditional jump, helper calls and `exit`.

mod insn;

pub use insn::{
    AluOp, Instruction, JmpOp, OperandSize, Register, BPF_ALU, BPF_ALU64, BPF_CLASS_MASK,
    BPF_LD_IMM64,
};
