//! Random ALU program generation with observation probes.
//!
//! A generated program has three parts:
//! 1. A header that loads a random immediate into every register of the
//!    configured range, so the verifier starts from known values.
//! 2. A body of random ALU instructions. Each one is followed by a probe that
//!    stores its destination register into the observation map slot of the
//!    probe.
//! 3. A footer, `r0 = 0; exit`.
//!
//! The offset, operand size and destination register of every probe are
//! recorded in a [`ProbeTable`] so the values observed at run time can later be
//! matched against the verifier's predictions for the same instruction.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::slice::Iter;
use std::sync::Arc;

use crate::constants::{
    HELPER_MAP_LOOKUP_ELEM, HIGHEST_PRESERVED_REGISTER, LOWEST_PRESERVED_REGISTER,
    PROBE_KEY_STACK_OFFSET,
};
use crate::ebpf::{AluOp, Instruction, JmpOp, OperandSize, Register};
use crate::error::GeneratorError;
use crate::program::{Handle, KernelObjects, MapLayout, OwnedHandle, Program, Release};

/// An observation point: the value of `dst` right after the instruction at
/// `offset` is written to the observation map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub offset: u32,
    pub operand_size: OperandSize,
    pub dst: Register,
}

/// The probes of one program, indexed by observation map slot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeTable {
    probes: Vec<Probe>,
}

impl ProbeTable {
    /// Builds a table, rejecting offsets that appear more than once.
    pub fn new(probes: Vec<Probe>) -> Result<Self, GeneratorError> {
        let mut table = Self::default();
        for probe in probes {
            table.push(probe)?;
        }
        Ok(table)
    }

    fn push(&mut self, probe: Probe) -> Result<(), GeneratorError> {
        if self.probes.iter().any(|p| p.offset == probe.offset) {
            return Err(GeneratorError::DuplicateProbeOffset {
                offset: probe.offset,
            });
        }
        self.probes.push(probe);
        Ok(())
    }

    pub fn iter(&self) -> Iter<'_, Probe> {
        self.probes.iter()
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    pub fn as_slice(&self) -> &[Probe] {
        &self.probes
    }
}

impl<'a> IntoIterator for &'a ProbeTable {
    type Item = &'a Probe;
    type IntoIter = Iter<'a, Probe>;

    fn into_iter(self) -> Self::IntoIter {
        self.probes.iter()
    }
}

/// Produces random programs. The generator only keeps its random source
/// between calls; every program gets a fresh probe table.
#[derive(Debug)]
pub struct Generator {
    rng: StdRng,
}

impl Generator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Seeds the generator from the current time.
    pub fn from_time() -> Self {
        Self::new(libafl_bolts::current_nanos())
    }

    /// Generates a program with `instruction_count` probed ALU instructions
    /// that only write to registers in `min_register..=max_register`.
    ///
    /// Fails only when the range is unusable or the observation map cannot
    /// be allocated.
    pub fn generate(
        &mut self,
        objects: &dyn KernelObjects,
        releaser: &Arc<dyn Release>,
        instruction_count: usize,
        min_register: Register,
        max_register: Register,
    ) -> Result<Program, GeneratorError> {
        check_register_range(min_register, max_register)?;
        let registers: Vec<Register> = (min_register.index()..=max_register.index())
            .filter_map(Register::new)
            .collect();

        let seed = self.rng.next_u64();
        let mut rng = StdRng::seed_from_u64(seed);

        let entries = u32::try_from(instruction_count).map_err(|_| {
            GeneratorError::Resource(anyhow::anyhow!(
                "{instruction_count} probes do not fit in an observation map"
            ))
        })?;
        let map = objects
            .create_observation_map(MapLayout::observations(entries))
            .map_err(GeneratorError::Resource)?;
        let map = OwnedHandle::new(map, releaser.clone());
        let map_fd = map_fd_immediate(map.handle())?;

        let mut bytecode = Vec::new();
        let mut probes = ProbeTable::default();

        for &register in &registers {
            bytecode.push(Instruction::mov64_imm(register, rng.random()).encode());
        }

        for index in 0..instruction_count {
            let dst = registers[rng.random_range(0..registers.len())];
            let size = if rng.random_bool(0.5) {
                OperandSize::DoubleWord
            } else {
                OperandSize::Word
            };
            let insn = random_alu(&mut rng, &registers, size, dst);

            probes.push(Probe {
                offset: bytecode.len() as u32,
                operand_size: size,
                dst,
            })?;
            bytecode.push(insn.encode());
            emit_probe(&mut bytecode, index as i32, map_fd, size, dst);
        }

        bytecode.push(Instruction::mov64_imm(Register::R0, 0).encode());
        bytecode.push(Instruction::exit().encode());

        Ok(Program::new(seed, bytecode, probes, map))
    }
}

/// Generated code may only write to a non-empty range of the registers that
/// survive the probe's helper call.
pub(crate) fn check_register_range(min: Register, max: Register) -> Result<(), GeneratorError> {
    if min > max || min < LOWEST_PRESERVED_REGISTER || max > HIGHEST_PRESERVED_REGISTER {
        return Err(GeneratorError::InvalidRegisterRange { min, max });
    }
    Ok(())
}

fn map_fd_immediate(handle: Handle) -> Result<i32, GeneratorError> {
    i32::try_from(handle.0).map_err(|_| {
        GeneratorError::Resource(anyhow::anyhow!(
            "observation map {handle} does not fit in an immediate"
        ))
    })
}

fn random_alu(
    rng: &mut StdRng,
    registers: &[Register],
    size: OperandSize,
    dst: Register,
) -> Instruction {
    let op = AluOp::ALL[rng.random_range(0..AluOp::ALL.len())];
    if op.is_unary() {
        return Instruction::alu_imm(size, op, dst, 0);
    }
    if rng.random_bool(0.5) {
        let src = registers[rng.random_range(0..registers.len())];
        return Instruction::alu_reg(size, op, dst, src);
    }
    let imm = if op.is_shift() {
        // Out of range shift immediates are rejected by the verifier.
        rng.random_range(0..size.bits()) as i32
    } else {
        rng.random()
    };
    Instruction::alu_imm(size, op, dst, imm)
}

/// Appends the sequence writing `dst` into slot `index` of the map:
///
/// ```text
/// *(u32 *)(r10 - 4) = index
/// r1 = map_fd
/// r2 = r10
/// r2 += -4
/// call map_lookup_elem
/// if r0 == 0 goto +1
/// *(size *)(r0 + 0) = dst
/// ```
fn emit_probe(bytecode: &mut Vec<u64>, index: i32, map_fd: i32, size: OperandSize, dst: Register) {
    bytecode.push(
        Instruction::st_imm(OperandSize::Word, Register::R10, PROBE_KEY_STACK_OFFSET, index)
            .encode(),
    );
    bytecode.extend(
        Instruction::ld_map_fd(Register::R1, map_fd)
            .iter()
            .map(Instruction::encode),
    );
    bytecode.push(Instruction::mov64_reg(Register::R2, Register::R10).encode());
    bytecode.push(
        Instruction::alu_imm(
            OperandSize::DoubleWord,
            AluOp::Add,
            Register::R2,
            i32::from(PROBE_KEY_STACK_OFFSET),
        )
        .encode(),
    );
    bytecode.push(Instruction::call(HELPER_MAP_LOOKUP_ELEM).encode());
    bytecode.push(Instruction::jmp_imm(JmpOp::Jeq, Register::R0, 0, 1).encode());
    bytecode.push(Instruction::stx(size, Register::R0, dst, 0).encode());
}
