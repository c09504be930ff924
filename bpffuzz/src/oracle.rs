//! Turns the verifier's textual trace into a table of predicted register
//! values, keyed by instruction offset and register.
//!
//! The grammar follows the `log_level` 2 output of the kernel verifier:
//!
//! ```text
//! func#0 @0
//! 0: R1=ctx() R10=fp0
//! 0: (b7) r7 = 5                        ; R7_w=5
//! 1: (57) r7 &= 255                     ; R7_w=scalar(umax=255,var_off=(0x0; 0xff))
//! 2: (95) exit
//! processed 3 insns (limit 1000000) max_states_per_insn 0 total_states 0 peak_states 0 mark_read 0
//! ```
//!
//! The state after `;` on an instruction line describes the registers after
//! that instruction ran. A bare `N: <state>` line describes the state before
//! instruction `N`, which is attributed to the preceding instruction when it
//! falls through to `N`. Older kernels print scalars as `inv`/`invP`, which is
//! understood as well.
//!
//! Annotated test logs may also use the compact form `off=4 r3=5 r7=scalar()`,
//! which states the registers after the instruction at the given offset.
//!
//! A register value is only *known* when the verifier pins it to a single
//! number. Anything else it says about a register is recorded as
//! [`Lookup::Unknowable`], and pairs it never mentions are [`Lookup::Absent`].
//! Lines that match none of the recognized shapes make parsing fail with an
//! [`OracleError`] rather than being guessed at.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::ebpf::{BPF_LD_IMM64, Register};
use crate::error::OracleError;

/// Lines that carry no register state and are skipped.
const IGNORED_PREFIXES: &[&str] = &[
    "func#",
    "processed ",
    "from ",
    "last_idx",
    "regs=",
    "parent ",
    "mark_precise",
    "stack depth",
    "verification time",
    "propagating",
    "; ",
];

const LIVENESS_HEADER: &str = "Live regs before insn:";

/// Starts a compact `off=N rX=V ...` annotation.
const COMPACT_PREFIX: &str = "off=";

/// What the verifier believes about one register at one offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Prediction {
    Known(u64),
    Unknowable,
}

/// Result of [`RegisterOracle::lookup`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup {
    /// The verifier pinned the register to exactly this value.
    Known(u64),
    /// The register was mentioned, but not with a single value.
    Unknowable,
    /// The offset/register pair never appears in the log.
    Absent,
}

impl Lookup {
    pub fn known_value(self) -> Option<u64> {
        match self {
            Lookup::Known(value) => Some(value),
            Lookup::Unknowable | Lookup::Absent => None,
        }
    }
}

/// Predicted register values parsed from one verifier log.
#[derive(Clone, Debug, Default)]
pub struct RegisterOracle {
    predictions: HashMap<(u32, Register), Prediction>,
}

impl RegisterOracle {
    /// Parses a verifier log.
    pub fn from_verifier_log(log: &str) -> Result<Self, OracleError> {
        let mut oracle = Self::default();
        // Offset and slot width of the last instruction line.
        let mut previous: Option<(u32, u32)> = None;
        let mut in_liveness_block = false;

        for (index, raw) in log.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() || IGNORED_PREFIXES.iter().any(|p| line.starts_with(p)) {
                continue;
            }
            if line.starts_with(LIVENESS_HEADER) {
                in_liveness_block = true;
                continue;
            }

            if let Some(annotation) = line.strip_prefix(COMPACT_PREFIX) {
                let (offset, state) = parse_compact(annotation, line_no)?;
                for (register, prediction) in state {
                    oracle.record(offset, register, prediction);
                }
                previous = None;
                continue;
            }

            let Some((offset, rest)) = split_offset(line) else {
                return Err(OracleError::UnrecognizedLine {
                    line: line_no,
                    text: line.to_string(),
                });
            };

            if in_liveness_block {
                if rest.starts_with(|c: char| c == '.' || c.is_ascii_digit()) {
                    continue;
                }
                in_liveness_block = false;
            }

            if let Some(instruction) = rest.strip_prefix('(') {
                let opcode = instruction
                    .split_once(')')
                    .and_then(|(hex, _)| u8::from_str_radix(hex, 16).ok())
                    .ok_or_else(|| OracleError::UnrecognizedLine {
                        line: line_no,
                        text: line.to_string(),
                    })?;
                if let Some((_, state)) = rest.split_once(';') {
                    for (register, prediction) in parse_state(state, line_no)? {
                        oracle.record(offset, register, prediction);
                    }
                }
                let width = if opcode == BPF_LD_IMM64 { 2 } else { 1 };
                previous = Some((offset, width));
            } else if rest == "safe" {
                previous = None;
            } else {
                let state = parse_state(rest, line_no)?;
                if let Some((prev_offset, width)) = previous {
                    if prev_offset + width == offset {
                        for (register, prediction) in state {
                            oracle.record(prev_offset, register, prediction);
                        }
                    }
                }
            }
        }

        Ok(oracle)
    }

    /// Returns the prediction for `register` right after the instruction at
    /// `offset` ran.
    pub fn lookup(&self, offset: u32, register: Register) -> Lookup {
        match self.predictions.get(&(offset, register)) {
            Some(Prediction::Known(value)) => Lookup::Known(*value),
            Some(Prediction::Unknowable) => Lookup::Unknowable,
            None => Lookup::Absent,
        }
    }

    /// Number of offset/register pairs mentioned in the log.
    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }

    // Paths that disagree about a register leave it without a single value.
    fn record(&mut self, offset: u32, register: Register, prediction: Prediction) {
        match self.predictions.entry((offset, register)) {
            Entry::Vacant(entry) => {
                entry.insert(prediction);
            }
            Entry::Occupied(mut entry) => {
                if *entry.get() != prediction {
                    entry.insert(Prediction::Unknowable);
                }
            }
        }
    }
}

/// Splits `"12: rest"` into `(12, "rest")`.
fn split_offset(line: &str) -> Option<(u32, &str)> {
    let (digits, rest) = line.split_once(':')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((digits.parse().ok()?, rest.trim()))
}

/// Parses the remainder of `off=4 r3=5 r7=scalar(...)`: the offset, then the
/// state of the named registers after the instruction at that offset.
fn parse_compact(
    annotation: &str,
    line: usize,
) -> Result<(u32, Vec<(Register, Prediction)>), OracleError> {
    let mut tokens = split_top_level(annotation.trim(), char::is_whitespace).into_iter();
    let offset = tokens
        .next()
        .and_then(|digits| digits.parse::<u32>().ok())
        .ok_or_else(|| OracleError::UnrecognizedLine {
            line,
            text: format!("{COMPACT_PREFIX}{annotation}"),
        })?;

    let mut registers = Vec::new();
    for token in tokens {
        let register = token
            .split_once('=')
            .and_then(|(name, value)| Some((name.strip_prefix('r')?, value)));
        let Some((digits, value)) = register else {
            return Err(OracleError::MalformedState {
                line,
                text: token.to_string(),
            });
        };
        let register = digits
            .parse::<u8>()
            .ok()
            .and_then(Register::new)
            .ok_or_else(|| OracleError::InvalidRegister {
                line,
                index: digits.to_string(),
            })?;
        registers.push((register, parse_value(value, line)?));
    }
    Ok((offset, registers))
}

/// Splits on `separator` outside of parentheses.
fn split_top_level(text: &str, separator: impl Fn(char) -> bool) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (index, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            c if depth == 0 && separator(c) => {
                parts.push(&text[start..index]);
                start = index + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts.into_iter().filter(|part| !part.is_empty()).collect()
}

fn parse_state(text: &str, line: usize) -> Result<Vec<(Register, Prediction)>, OracleError> {
    let mut registers = Vec::new();
    for token in split_top_level(text.trim(), char::is_whitespace) {
        // `frame1:` prefixes the state of a callee frame.
        if token.ends_with(':') {
            continue;
        }
        let Some((name, value)) = token.split_once('=') else {
            return Err(OracleError::MalformedState {
                line,
                text: token.to_string(),
            });
        };
        if let Some(register) = parse_register_name(name, line)? {
            registers.push((register, parse_value(value, line)?));
        }
    }
    Ok(registers)
}

/// `R7`, `R7_w`, `R7_rw` name registers; stack slots such as `fp-8` do not.
fn parse_register_name(name: &str, line: usize) -> Result<Option<Register>, OracleError> {
    let Some(rest) = name.strip_prefix('R') else {
        return Ok(None);
    };
    let (digits, suffix) = rest.split_once('_').unwrap_or((rest, ""));
    if digits.is_empty()
        || !digits.bytes().all(|b| b.is_ascii_digit())
        || !suffix.bytes().all(|b| b.is_ascii_alphabetic())
    {
        return Ok(None);
    }
    digits
        .parse::<u8>()
        .ok()
        .and_then(Register::new)
        .map(Some)
        .ok_or_else(|| OracleError::InvalidRegister {
            line,
            index: digits.to_string(),
        })
}

fn parse_value(value: &str, line: usize) -> Result<Prediction, OracleError> {
    let malformed = || OracleError::MalformedValue {
        line,
        value: value.to_string(),
    };

    // `P` marks a precise scalar.
    let value = match value.strip_prefix('P') {
        Some(rest)
            if rest.starts_with(|c: char| c.is_ascii_digit() || c == '-')
                || rest.starts_with("scalar")
                || rest.starts_with("inv") =>
        {
            rest
        }
        _ => value,
    };

    if let Some(number) = parse_int(value) {
        return Ok(Prediction::Known(number));
    }

    if let Some(rest) = value
        .strip_prefix("invP")
        .or_else(|| value.strip_prefix("inv"))
    {
        if rest.is_empty() {
            return Ok(Prediction::Unknowable);
        }
        if let Some(number) = parse_int(rest) {
            return Ok(Prediction::Known(number));
        }
        let body = rest
            .strip_prefix('(')
            .and_then(|body| body.strip_suffix(')'))
            .ok_or_else(malformed)?;
        return parse_bounds(body).ok_or_else(malformed);
    }

    if let Some(body) = value
        .strip_prefix("scalar(")
        .and_then(|body| body.strip_suffix(')'))
    {
        return parse_bounds(body).ok_or_else(malformed);
    }

    // Pointer types: ctx(), fp0, map_value(...), pkt(...) and friends.
    if value.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Ok(Prediction::Unknowable);
    }

    Err(malformed())
}

/// Interprets the body of `scalar(...)`. Bounds may be chained, as in
/// `smax=umax=255`.
fn parse_bounds(body: &str) -> Option<Prediction> {
    let mut umin = None;
    let mut umax = None;
    let mut smin = None;
    let mut smax = None;
    let mut var_off = None;

    for field in split_top_level(body, |c| c == ',') {
        let mut parts: Vec<&str> = field.split('=').map(str::trim).collect();
        let value = parts.pop()?;
        if parts.is_empty() {
            return None;
        }
        for key in parts {
            match key {
                "umin" | "umin_value" => umin = Some(parse_int(value)?),
                "umax" | "umax_value" => umax = Some(parse_int(value)?),
                "smin" | "smin_value" => smin = Some(parse_int(value)?),
                "smax" | "smax_value" => smax = Some(parse_int(value)?),
                "var_off" => var_off = Some(parse_tnum(value)?),
                _ => {}
            }
        }
    }

    let singleton = match (var_off, umin.zip(umax), smin.zip(smax)) {
        (Some((value, 0)), _, _) => Some(value),
        (_, Some((min, max)), _) if min == max => Some(min),
        (_, _, Some((min, max))) if min == max => Some(min),
        _ => None,
    };
    Some(singleton.map_or(Prediction::Unknowable, Prediction::Known))
}

/// Parses a tracked number `(value; mask)`.
fn parse_tnum(text: &str) -> Option<(u64, u64)> {
    let inner = text.strip_prefix('(')?.strip_suffix(')')?;
    let (value, mask) = inner.split_once(';')?;
    Some((parse_int(value.trim())?, parse_int(mask.trim())?))
}

/// Parses decimal, negative decimal and `0x` hexadecimal numbers. Negative
/// numbers wrap to their two's complement.
fn parse_int(text: &str) -> Option<u64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (digits, radix) = match digits.strip_prefix("0x") {
        Some(hex) => (hex, 16),
        None => (digits, 10),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    let magnitude = u64::from_str_radix(digits, radix).ok()?;
    Some(if negative {
        magnitude.wrapping_neg()
    } else {
        magnitude
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const STRAIGHT_LINE_LOG: &str = "\
func#0 @0
0: R1=ctx() R10=fp0
0: (b7) r7 = 5                        ; R7_w=5
1: (07) r7 += 3                       ; R7_w=8
2: (57) r7 &= 255                     ; R7_w=scalar(smin=smin32=0,smax=umax=smax32=umax32=255,var_off=(0x0; 0xff))
3: (b7) r0 = 0                        ; R0_w=0
4: (95) exit
processed 5 insns (limit 1000000) max_states_per_insn 0 total_states 0 peak_states 0 mark_read 0
";

    #[test]
    fn test_singleton_values_are_known() {
        let oracle = RegisterOracle::from_verifier_log(STRAIGHT_LINE_LOG).unwrap();
        assert_eq!(oracle.lookup(0, Register::R7), Lookup::Known(5));
        assert_eq!(oracle.lookup(1, Register::R7), Lookup::Known(8));
        assert_eq!(oracle.lookup(3, Register::R0), Lookup::Known(0));
    }

    #[test]
    fn test_unmentioned_pairs_are_absent() {
        let oracle = RegisterOracle::from_verifier_log(STRAIGHT_LINE_LOG).unwrap();
        assert_eq!(oracle.lookup(1, Register::R8), Lookup::Absent);
        assert_eq!(oracle.lookup(40, Register::R7), Lookup::Absent);
        // The entry state has no preceding instruction to attach to.
        assert_eq!(oracle.lookup(0, Register::R1), Lookup::Absent);
        assert_eq!(oracle.lookup(40, Register::R7).known_value(), None);
    }

    #[test]
    fn test_ranges_are_unknowable() {
        let oracle = RegisterOracle::from_verifier_log(STRAIGHT_LINE_LOG).unwrap();
        assert_eq!(oracle.lookup(2, Register::R7), Lookup::Unknowable);
    }

    #[test]
    fn test_singleton_ranges_collapse() {
        let log = "\
5: (bf) r8 = r7                       ; R7_w=scalar(id=1,var_off=(0x2a; 0x0)) R8_w=scalar(id=1,var_off=(0x2a; 0x0))
6: (87) r9 = -r9                      ; R9_w=scalar(smin=-3,smax=-3)
7: (77) r6 >>= 1                      ; R6_w=scalar(umin=9,umax=9,var_off=(0x8; 0x1))
";
        let oracle = RegisterOracle::from_verifier_log(log).unwrap();
        assert_eq!(oracle.lookup(5, Register::R7), Lookup::Known(42));
        assert_eq!(oracle.lookup(5, Register::R8), Lookup::Known(42));
        assert_eq!(oracle.lookup(6, Register::R9), Lookup::Known(-3i64 as u64));
        assert_eq!(oracle.lookup(7, Register::R6), Lookup::Known(9));
    }

    #[test]
    fn test_number_formats() {
        let log = "\
0: (b7) r7 = -1                       ; R7_w=-1
1: (18) r8 = 0xffffffff               ; R8_w=0xffffffff
3: (b7) r9 = 7                        ; R9_w=P7
";
        let oracle = RegisterOracle::from_verifier_log(log).unwrap();
        assert_eq!(oracle.lookup(0, Register::R7), Lookup::Known(u64::MAX));
        assert_eq!(oracle.lookup(1, Register::R8), Lookup::Known(0xffff_ffff));
        assert_eq!(oracle.lookup(3, Register::R9), Lookup::Known(7));
    }

    #[test]
    fn test_legacy_state_lines() {
        let log = "\
0: (b7) r7 = 5
1: R1=ctx(id=0,off=0,imm=0) R7_w=invP5 R10=fp0
1: (57) r7 &= 255
2: R1=ctx(id=0,off=0,imm=0) R7_w=inv(id=0,umax_value=255,var_off=(0x0; 0xff)) R10=fp0
2: (95) exit
";
        let oracle = RegisterOracle::from_verifier_log(log).unwrap();
        assert_eq!(oracle.lookup(0, Register::R7), Lookup::Known(5));
        assert_eq!(oracle.lookup(0, Register::R1), Lookup::Unknowable);
        assert_eq!(oracle.lookup(1, Register::R7), Lookup::Unknowable);
    }

    #[test]
    fn test_state_line_after_wide_load() {
        let log = "\
0: (18) r1 = 0xffff888100000000
2: R1_w=map_ptr(off=0,ks=4,vs=8,imm=0) R7=11 R10=fp0
2: (95) exit
";
        let oracle = RegisterOracle::from_verifier_log(log).unwrap();
        assert_eq!(oracle.lookup(0, Register::R7), Lookup::Known(11));
        assert_eq!(oracle.lookup(0, Register::R1), Lookup::Unknowable);
    }

    #[test]
    fn test_state_line_after_jump_is_not_attributed() {
        let log = "\
0: (15) if r0 == 0x0 goto pc+1
2: R7=3
2: (95) exit
";
        let oracle = RegisterOracle::from_verifier_log(log).unwrap();
        assert_eq!(oracle.lookup(0, Register::R7), Lookup::Absent);
    }

    #[test]
    fn test_conflicting_paths_are_unknowable() {
        let log = "\
4: (07) r7 += 1                       ; R7_w=2
4: (07) r7 += 1                       ; R7_w=3
5: (07) r8 += 1                       ; R8_w=6
5: (07) r8 += 1                       ; R8_w=6
";
        let oracle = RegisterOracle::from_verifier_log(log).unwrap();
        assert_eq!(oracle.lookup(4, Register::R7), Lookup::Unknowable);
        assert_eq!(oracle.lookup(5, Register::R8), Lookup::Known(6));
    }

    #[test]
    fn test_probe_sequence_noise_is_tolerated() {
        let log = "\
func#0 @0
12: (62) *(u32 *)(r10 -4) = 0         ; R10=fp0 fp-8=0000????
13: (18) r1 = 0xffff88810a1b2c00      ; R1_w=map_ptr(map=observe,ks=4,vs=8)
15: (bf) r2 = r10                     ; R2_w=fp0 R10=fp0
16: (07) r2 += -4                     ; R2_w=fp-4
17: (85) call bpf_map_lookup_elem#1   ; R0_w=map_value_or_null(id=1,map=observe,ks=4,vs=8)
18: (15) if r0 == 0x0 goto pc+1       ; R0_w=map_value(map=observe,ks=4,vs=8)
19: (7b) *(u64 *)(r0 +0) = r7         ; R0_w=map_value(map=observe,ks=4,vs=8) R7=5
from 18 to 20: safe
20: safe
; return 0;
verification time 25 usec
stack depth 8
";
        let oracle = RegisterOracle::from_verifier_log(log).unwrap();
        assert_eq!(oracle.lookup(19, Register::R7), Lookup::Known(5));
        assert_eq!(oracle.lookup(17, Register::R0), Lookup::Unknowable);
    }

    #[test]
    fn test_liveness_block_is_skipped() {
        let log = "\
Live regs before insn:
      0: .......... (b7) r7 = 1
      1: .......7.. (95) exit
0: (b7) r7 = 1                        ; R7_w=1
";
        let oracle = RegisterOracle::from_verifier_log(log).unwrap();
        assert_eq!(oracle.lookup(0, Register::R7), Lookup::Known(1));
    }

    #[test]
    fn test_unrecognized_line_fails() {
        let log = "0: (b7) r7 = 1 ; R7_w=1\nsomething unexpected\n";
        assert_matches!(
            RegisterOracle::from_verifier_log(log),
            Err(OracleError::UnrecognizedLine { line: 2, .. })
        );
    }

    #[test]
    fn test_malformed_values_fail() {
        assert_matches!(
            RegisterOracle::from_verifier_log("0: (b7) r7 = 1 ; R7_w=5x"),
            Err(OracleError::MalformedValue { line: 1, .. })
        );
        assert_matches!(
            RegisterOracle::from_verifier_log("0: (b7) r7 = 1 ; R7_w=scalar(umin)"),
            Err(OracleError::MalformedValue { .. })
        );
        assert_matches!(
            RegisterOracle::from_verifier_log("0: (b7) r7 = 1 ; R12=5"),
            Err(OracleError::InvalidRegister { .. })
        );
        assert_matches!(
            RegisterOracle::from_verifier_log("0: (zz) r7 = 1"),
            Err(OracleError::UnrecognizedLine { .. })
        );
        assert_matches!(
            RegisterOracle::from_verifier_log("0: (b7) r7 = 1 ; R7_w"),
            Err(OracleError::MalformedState { .. })
        );
    }

    #[test]
    fn test_empty_log_has_no_predictions() {
        let oracle = RegisterOracle::from_verifier_log("").unwrap();
        assert!(oracle.is_empty());
    }

    #[test]
    fn test_compact_annotation() {
        let oracle =
            RegisterOracle::from_verifier_log("off=4 r3=5 r7=scalar(umax=3)\noff=6 r8=-1").unwrap();
        assert_eq!(oracle.lookup(4, Register::R3), Lookup::Known(5));
        assert_eq!(oracle.lookup(4, Register::R7), Lookup::Unknowable);
        assert_eq!(oracle.lookup(6, Register::R8), Lookup::Known(u64::MAX));
        assert_eq!(oracle.lookup(5, Register::R3), Lookup::Absent);
        assert_eq!(oracle.len(), 3);
    }

    #[test]
    fn test_malformed_compact_annotation_fails() {
        assert_matches!(
            RegisterOracle::from_verifier_log("off=x r3=5"),
            Err(OracleError::UnrecognizedLine { line: 1, .. })
        );
        assert_matches!(
            RegisterOracle::from_verifier_log("off=4 R3=5"),
            Err(OracleError::MalformedState { .. })
        );
        assert_matches!(
            RegisterOracle::from_verifier_log("off=4 r11=5"),
            Err(OracleError::InvalidRegister { .. })
        );
    }
}
