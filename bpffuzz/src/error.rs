//! Error types for the fuzzing pipeline.
//!
//! Every [`FuzzError`] is fatal for the iteration that produced it and is
//! propagated to whoever drives the loop. Flakes and oracle parse failures
//! are not errors at this level; they are reported as iteration outcomes.

use thiserror::Error;

use crate::ebpf::Register;

/// Errors that abort the current fuzzing iteration.
#[derive(Debug, Error)]
pub enum FuzzError {
    /// No generated program was accepted by the verifier.
    #[error("could not generate a valid program after {attempts} attempts")]
    GenerationExhausted { attempts: usize },

    /// The execution call itself did not complete.
    #[error("transport failure while dispatching program: {0:#}")]
    Transport(#[source] anyhow::Error),

    /// The call completed but the program did not run cleanly.
    #[error("program execution did not succeed: {message}")]
    RuntimeExecution { message: String },

    /// A successful execution returned the wrong number of observations.
    #[error("execution returned {actual} observed values for {expected} probes")]
    ObservationCountMismatch { expected: usize, actual: usize },

    /// A runtime resource needed by the program could not be allocated.
    #[error("failed to allocate program resources: {0:#}")]
    Resource(#[source] anyhow::Error),

    /// The verifier submission service failed (not a rejection).
    #[error("failed to submit program for validation: {0:#}")]
    Validation(#[source] anyhow::Error),

    /// An artifact could not be saved.
    #[error("failed to persist artifact: {0:#}")]
    Persistence(#[source] anyhow::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors raised while generating a program.
#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("register range {min}..={max} is outside of the preserved registers r6..=r9")]
    InvalidRegisterRange { min: Register, max: Register },

    #[error("probe offset {offset} was recorded twice")]
    DuplicateProbeOffset { offset: u32 },

    #[error("failed to allocate the observation map: {0:#}")]
    Resource(#[source] anyhow::Error),
}

impl From<GeneratorError> for FuzzError {
    fn from(err: GeneratorError) -> Self {
        match err {
            GeneratorError::Resource(e) => FuzzError::Resource(e),
            other => FuzzError::InvalidConfig(other.to_string()),
        }
    }
}

/// Errors raised when the verifier log does not follow the expected grammar.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OracleError {
    #[error("line {line}: unrecognized verifier log line `{text}`")]
    UnrecognizedLine { line: usize, text: String },

    #[error("line {line}: malformed register state `{text}`")]
    MalformedState { line: usize, text: String },

    #[error("line {line}: register index {index} out of range")]
    InvalidRegister { line: usize, index: String },

    #[error("line {line}: cannot interpret register value `{value}`")]
    MalformedValue { line: usize, value: String },
}
