//! This module defines constants used throughout the fuzzer.
//! These constants are related to the generation and dispatch bounds,
//! the shape of generated programs, and the observation map layout.

use crate::ebpf::Register;

/// The name of the strategy that parses the verifier log and compares its
/// predictions with the values observed at run time.
pub const PARSE_VERIFIER_STRATEGY_NAME: &str = "parse_verifier_log";

/// How many programs are generated and submitted to the verifier before an
/// iteration gives up on finding one that is accepted.
pub const MAX_GENERATION_ATTEMPTS: usize = 100_000;

/// How many times an accepted program is dispatched while every observed
/// value comes back as zero.
pub const MAX_FLAKE_RETRIES: usize = 1000;

/// Number of ALU instructions (and therefore probes) in a generated program.
pub const DEFAULT_INSTRUCTION_COUNT: usize = 10;

/// Lowest register the generator may write to by default.
pub const DEFAULT_MIN_REGISTER: Register = Register::R7;

/// Highest register the generator may write to by default.
pub const DEFAULT_MAX_REGISTER: Register = Register::R9;

/// The probe sequence calls `map_lookup_elem`, which clobbers R0..=R5,
/// and R10 is the read-only frame pointer.
pub const LOWEST_PRESERVED_REGISTER: Register = Register::R6;
pub const HIGHEST_PRESERVED_REGISTER: Register = Register::R9;

/// Size in bytes of one observation map value. Every probe writes one slot.
pub const OBSERVATION_VALUE_SIZE: u32 = 8;

/// Size in bytes of the observation map key (the probe index).
pub const OBSERVATION_KEY_SIZE: u32 = 4;

/// Stack offset, relative to R10, where a probe stages its map key.
pub const PROBE_KEY_STACK_OFFSET: i16 = -4;

/// Helper id of `bpf_map_lookup_elem`.
pub const HELPER_MAP_LOOKUP_ELEM: i32 = 1;

/// Largest frame accepted on the execution transport.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
