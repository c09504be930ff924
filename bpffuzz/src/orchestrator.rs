use anyhow::Result;
use slog::{Logger, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::artifact::ArtifactStore;
use crate::error::{FuzzError, OracleError};
use crate::program::{KernelObjects, Release};
use crate::proto::{ExecutionResult, RunProgramRequest, ValidationResult};

/// Submits bytecode to the in-kernel verifier.
pub trait Verifier {
    /// A rejected program is a successful call with `is_valid == false`;
    /// `Err` means the submission itself failed.
    fn validate_program(&self, bytecode: &[u64]) -> Result<ValidationResult>;
}

/// Runs an accepted program and reports what its probes observed.
pub trait ProgramRunner {
    /// `Err` means the call did not complete; a completed call that could
    /// not run the program reports `did_succeed == false` instead.
    fn run_program(&self, request: &RunProgramRequest) -> Result<ExecutionResult>;
}

/// The collaborators a strategy works with.
pub struct FuzzContext<'a> {
    pub verifier: &'a dyn Verifier,
    pub runner: &'a dyn ProgramRunner,
    pub store: &'a dyn ArtifactStore,
    pub objects: &'a dyn KernelObjects,
    pub releaser: Arc<dyn Release>,
    pub logger: Logger,
}

/// How one iteration ended, when it did not end in a [`FuzzError`].
#[derive(Debug, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Every known prediction matched its observation.
    Clean,
    /// One artifact was saved for each listed offset.
    DivergenceSaved { offsets: Vec<u32> },
    /// The program never produced a usable observation; it was saved.
    FlakeExhausted { attempts: usize },
    /// The verifier log could not be parsed, so nothing was compared.
    ReconcileSkipped(OracleError),
}

/// A way of producing and checking programs, one iteration at a time.
pub trait FuzzingStrategy {
    fn name(&self) -> &'static str;

    /// Runs one generate, execute and compare iteration. All resources it
    /// acquires are released before it returns.
    fn fuzz_one(&mut self, ctx: &FuzzContext<'_>) -> Result<IterationOutcome, FuzzError>;
}

/// Drives `strategy` until `stop` is raised or an iteration fails.
///
/// Flakes and unparsable verifier logs are logged and the loop moves on;
/// any [`FuzzError`] is returned to the caller.
pub fn run<S>(strategy: &mut S, ctx: &FuzzContext<'_>, stop: &AtomicBool) -> Result<u64, FuzzError>
where
    S: FuzzingStrategy + ?Sized,
{
    info!(ctx.logger, "running fuzzing strategy"; "strategy" => strategy.name());
    let mut iterations = 0u64;
    while !stop.load(Ordering::Relaxed) {
        info!(ctx.logger, "fuzzer run"; "run" => iterations);
        match strategy.fuzz_one(ctx)? {
            IterationOutcome::Clean => {}
            IterationOutcome::DivergenceSaved { offsets } => {
                warn!(ctx.logger, "divergence saved"; "run" => iterations, "offsets" => ?offsets);
            }
            IterationOutcome::FlakeExhausted { attempts } => {
                warn!(ctx.logger, "program flaked"; "run" => iterations, "attempts" => attempts);
            }
            IterationOutcome::ReconcileSkipped(err) => {
                warn!(ctx.logger, "verifier log not understood, skipping comparison"; "error" => %err);
            }
        }
        iterations += 1;
    }
    Ok(iterations)
}
