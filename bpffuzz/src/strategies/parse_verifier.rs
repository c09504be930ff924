//! Hunts verifier logic errors by generating random ALU programs, parsing the
//! verifier log for the register values it predicts, and comparing them with
//! the values the program actually produces at run time.
//!
//! One iteration moves through three phases, each of which can be driven on
//! its own:
//! 1. [`ParseVerifierStrategy::generate_and_validate`] generates programs until
//!    the verifier accepts one.
//! 2. [`dispatch_with_flake_tolerance`] runs it until it produces a usable
//!    observation.
//! 3. [`reconcile`] compares observations with the predictions parsed from
//!    the verifier log.

use anyhow::anyhow;
use slog::{Logger, debug, warn};

use crate::artifact::{Artifact, ArtifactKind};
use crate::constants::{
    DEFAULT_INSTRUCTION_COUNT, DEFAULT_MAX_REGISTER, DEFAULT_MIN_REGISTER, MAX_FLAKE_RETRIES,
    MAX_GENERATION_ATTEMPTS, PARSE_VERIFIER_STRATEGY_NAME,
};
use crate::ebpf::Register;
use crate::error::FuzzError;
use crate::generator::{Generator, Probe, ProbeTable, check_register_range};
use crate::oracle::RegisterOracle;
use crate::orchestrator::{FuzzContext, FuzzingStrategy, IterationOutcome, ProgramRunner};
use crate::program::{Handle, OwnedHandle, Program};
use crate::proto::RunProgramRequest;

/// Knobs of [`ParseVerifierStrategy`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseVerifierConfig {
    pub instruction_count: usize,
    pub min_register: Register,
    pub max_register: Register,
    pub max_generation_attempts: usize,
    pub max_flake_retries: usize,
}

impl Default for ParseVerifierConfig {
    fn default() -> Self {
        Self {
            instruction_count: DEFAULT_INSTRUCTION_COUNT,
            min_register: DEFAULT_MIN_REGISTER,
            max_register: DEFAULT_MAX_REGISTER,
            max_generation_attempts: MAX_GENERATION_ATTEMPTS,
            max_flake_retries: MAX_FLAKE_RETRIES,
        }
    }
}

impl ParseVerifierConfig {
    pub fn with_instruction_count(mut self, count: usize) -> Self {
        self.instruction_count = count;
        self
    }

    pub fn with_registers(mut self, min: Register, max: Register) -> Self {
        self.min_register = min;
        self.max_register = max;
        self
    }

    pub fn with_max_generation_attempts(mut self, attempts: usize) -> Self {
        self.max_generation_attempts = attempts;
        self
    }

    pub fn with_max_flake_retries(mut self, retries: usize) -> Self {
        self.max_flake_retries = retries;
        self
    }

    fn validate(&self) -> Result<(), FuzzError> {
        if self.instruction_count == 0 {
            return Err(FuzzError::InvalidConfig(
                "instruction count must be at least 1".to_string(),
            ));
        }
        if self.max_generation_attempts == 0 || self.max_flake_retries == 0 {
            return Err(FuzzError::InvalidConfig(
                "attempt bounds must be at least 1".to_string(),
            ));
        }
        check_register_range(self.min_register, self.max_register)?;
        Ok(())
    }
}

/// A program the verifier accepted, with the log it produced while doing so.
#[derive(Debug)]
pub struct ValidatedProgram {
    pub program: Program,
    pub verifier_log: String,
}

/// Result of dispatching a program until it yields a usable observation.
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Probe values from the first run that was not all zero.
    Observed(Vec<u64>),
    /// Every run reported only zeros.
    FlakeExhausted { attempts: usize },
}

/// A probe whose observed value differs from the verifier's prediction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Divergence {
    pub probe: Probe,
    pub predicted: u64,
    pub observed: u64,
}

#[derive(Debug)]
pub struct ParseVerifierStrategy {
    generator: Generator,
    config: ParseVerifierConfig,
}

impl ParseVerifierStrategy {
    pub fn new(config: ParseVerifierConfig) -> Result<Self, FuzzError> {
        Self::with_generator(config, Generator::from_time())
    }

    /// Uses a fixed seed so the sequence of programs is reproducible.
    pub fn with_seed(config: ParseVerifierConfig, seed: u64) -> Result<Self, FuzzError> {
        Self::with_generator(config, Generator::new(seed))
    }

    fn with_generator(config: ParseVerifierConfig, generator: Generator) -> Result<Self, FuzzError> {
        config.validate()?;
        Ok(Self { generator, config })
    }

    pub fn config(&self) -> &ParseVerifierConfig {
        &self.config
    }

    /// Generates programs until the verifier accepts one. Rejected programs
    /// are dropped, which releases their resources.
    pub fn generate_and_validate(
        &mut self,
        ctx: &FuzzContext<'_>,
    ) -> Result<ValidatedProgram, FuzzError> {
        for attempt in 1..=self.config.max_generation_attempts {
            let mut program = self.generator.generate(
                ctx.objects,
                &ctx.releaser,
                self.config.instruction_count,
                self.config.min_register,
                self.config.max_register,
            )?;
            let result = ctx
                .verifier
                .validate_program(program.bytecode())
                .map_err(FuzzError::Validation)?;

            if result.is_valid {
                program.attach_loaded(OwnedHandle::new(
                    Handle(result.program_fd),
                    ctx.releaser.clone(),
                ));
                debug!(ctx.logger, "program accepted";
                    "attempt" => attempt,
                    "seed" => program.seed(),
                    "coverage_size" => result.coverage_size);
                return Ok(ValidatedProgram {
                    program,
                    verifier_log: result.verifier_log,
                });
            }
            debug!(ctx.logger, "program rejected"; "attempt" => attempt, "error" => %result.bpf_error);
        }

        Err(FuzzError::GenerationExhausted {
            attempts: self.config.max_generation_attempts,
        })
    }

    fn save(
        &self,
        ctx: &FuzzContext<'_>,
        validated: &ValidatedProgram,
        kind: ArtifactKind,
        observed: &[u64],
    ) -> Result<(), FuzzError> {
        let artifact = Artifact {
            kind,
            seed: validated.program.seed(),
            bytecode: validated.program.bytecode().to_vec(),
            verifier_log: validated.verifier_log.clone(),
            observed: observed.to_vec(),
            probes: validated.program.probes().as_slice().to_vec(),
        };
        ctx.store.save(&artifact).map_err(FuzzError::Persistence)
    }
}

impl FuzzingStrategy for ParseVerifierStrategy {
    fn name(&self) -> &'static str {
        PARSE_VERIFIER_STRATEGY_NAME
    }

    fn fuzz_one(&mut self, ctx: &FuzzContext<'_>) -> Result<IterationOutcome, FuzzError> {
        let validated = self.generate_and_validate(ctx)?;
        let request = validated.program.run_request().ok_or_else(|| {
            FuzzError::Validation(anyhow!("accepted program carries no loaded handle"))
        })?;

        let observed = match dispatch_with_flake_tolerance(
            ctx.runner,
            &request,
            validated.program.probe_count(),
            self.config.max_flake_retries,
            &ctx.logger,
        )? {
            DispatchOutcome::Observed(values) => values,
            DispatchOutcome::FlakeExhausted { attempts } => {
                self.save(ctx, &validated, ArtifactKind::Flake { attempts }, &[])?;
                return Ok(IterationOutcome::FlakeExhausted { attempts });
            }
        };

        let oracle = match RegisterOracle::from_verifier_log(&validated.verifier_log) {
            Ok(oracle) => oracle,
            Err(err) => return Ok(IterationOutcome::ReconcileSkipped(err)),
        };
        let divergences = reconcile(validated.program.probes(), &oracle, &observed)?;
        if divergences.is_empty() {
            return Ok(IterationOutcome::Clean);
        }

        let mut offsets = Vec::with_capacity(divergences.len());
        for divergence in divergences {
            warn!(ctx.logger, "verifier prediction diverges from execution";
                "offset" => divergence.probe.offset,
                "register" => %divergence.probe.dst,
                "predicted" => divergence.predicted,
                "observed" => divergence.observed,
                "seed" => validated.program.seed());
            let kind = ArtifactKind::Divergence {
                offset: divergence.probe.offset,
                register: divergence.probe.dst,
                predicted: divergence.predicted,
                observed: divergence.observed,
            };
            self.save(ctx, &validated, kind, &observed)?;
            offsets.push(divergence.probe.offset);
        }
        Ok(IterationOutcome::DivergenceSaved { offsets })
    }
}

/// Runs `request` up to `max_retries` times, until a run reports at least one
/// non-zero observation.
///
/// A failed call or a run that did not succeed ends the dispatch with an
/// error, as does a successful run whose observation count differs from
/// `probe_count`.
pub fn dispatch_with_flake_tolerance(
    runner: &dyn ProgramRunner,
    request: &RunProgramRequest,
    probe_count: usize,
    max_retries: usize,
    logger: &Logger,
) -> Result<DispatchOutcome, FuzzError> {
    for attempt in 1..=max_retries {
        let result = runner.run_program(request).map_err(FuzzError::Transport)?;
        if !result.did_succeed {
            return Err(FuzzError::RuntimeExecution {
                message: result.error_message,
            });
        }
        if result.elements.len() != probe_count {
            return Err(FuzzError::ObservationCountMismatch {
                expected: probe_count,
                actual: result.elements.len(),
            });
        }
        if !result.is_flaked() {
            return Ok(DispatchOutcome::Observed(result.elements));
        }
        debug!(logger, "all observations are zero, retrying"; "attempt" => attempt);
    }
    Ok(DispatchOutcome::FlakeExhausted {
        attempts: max_retries,
    })
}

/// Compares `observed[i]` with the verifier's prediction for probe `i`.
///
/// Every probe is checked, so a program with several divergences reports all
/// of them. Probes whose prediction is not a single known value are skipped.
/// `observed` must hold exactly one value per probe.
pub fn reconcile(
    probes: &ProbeTable,
    oracle: &RegisterOracle,
    observed: &[u64],
) -> Result<Vec<Divergence>, FuzzError> {
    if observed.len() != probes.len() {
        return Err(FuzzError::ObservationCountMismatch {
            expected: probes.len(),
            actual: observed.len(),
        });
    }
    let divergences = probes
        .iter()
        .zip(observed)
        .filter_map(|(probe, &observed)| {
            let predicted = oracle.lookup(probe.offset, probe.dst).known_value()?;
            (probe.operand_size.truncate(predicted) != observed).then_some(Divergence {
                probe: *probe,
                predicted,
                observed,
            })
        })
        .collect();
    Ok(divergences)
}
