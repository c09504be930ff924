//! A differential fuzzer for the eBPF verifier.
//!
//! The fuzzer generates random straight-line ALU programs, asks the in-kernel
//! verifier to accept them, and then runs the accepted programs on a remote
//! client. Each ALU instruction is followed by a probe that writes its
//! destination register to an observation map. The values the verifier
//! printed in its log are then compared with the values the program actually
//! produced; any mismatch is a verifier logic error and is saved as an
//! [`artifact::Artifact`].
//!
//! ## Getting Started
//!
//! Provide implementations of the collaborator traits in [`orchestrator`] and
//! [`program`], then drive a strategy with [`orchestrator::run`].
//!
//! ```no_run
//! use bpffuzz::artifact::DiskArtifactStore;
//! use bpffuzz::orchestrator::{self, FuzzContext, ProgramRunner, Verifier};
//! use bpffuzz::program::{Handle, KernelObjects, MapLayout, Release};
//! use bpffuzz::proto::{ExecutionResult, RunProgramRequest, ValidationResult};
//! use bpffuzz::strategies::parse_verifier::{ParseVerifierConfig, ParseVerifierStrategy};
//! use slog::{Discard, Logger, o};
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//!
//! struct Kernel;
//!
//! impl Release for Kernel {
//!     fn release(&self, _handle: Handle) {}
//! }
//!
//! impl KernelObjects for Kernel {
//!     fn create_observation_map(&self, _layout: MapLayout) -> anyhow::Result<Handle> {
//!         Ok(Handle(3))
//!     }
//! }
//!
//! impl Verifier for Kernel {
//!     fn validate_program(&self, _bytecode: &[u64]) -> anyhow::Result<ValidationResult> {
//!         unimplemented!("submit to BPF_PROG_LOAD")
//!     }
//! }
//!
//! impl ProgramRunner for Kernel {
//!     fn run_program(&self, _request: &RunProgramRequest) -> anyhow::Result<ExecutionResult> {
//!         unimplemented!("forward to a client")
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let kernel = Arc::new(Kernel);
//!     let store = DiskArtifactStore::new("./artifacts")?;
//!     let ctx = FuzzContext {
//!         verifier: kernel.as_ref(),
//!         runner: kernel.as_ref(),
//!         store: &store,
//!         objects: kernel.as_ref(),
//!         releaser: kernel.clone(),
//!         logger: Logger::root(Discard, o!()),
//!     };
//!
//!     let mut strategy = ParseVerifierStrategy::new(ParseVerifierConfig::default())?;
//!     let stop = AtomicBool::new(false);
//!     orchestrator::run(&mut strategy, &ctx, &stop)?;
//!     Ok(())
//! }
//! ```
pub mod artifact;
pub mod ebpf;
pub mod error;
pub mod generator;
pub mod oracle;
pub mod orchestrator;
pub mod program;
pub mod proto;
pub mod strategies;

pub mod constants;

pub use error::{FuzzError, GeneratorError, OracleError};
