//! Message shapes exchanged with the verifier service and execution clients.

use serde::{Deserialize, Serialize};

/// Sent by an execution client to announce itself to the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Kernel build the client runs; identifies the client.
    pub linux_version: String,
    pub client_ip: String,
    pub client_port: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationResult {
    Success,
    CannotConnect,
    InvalidAddress,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub result: RegistrationResult,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgramRequest {
    pub ebpf_program: Vec<u64>,
    pub prog_fd: i64,
    pub map_fd: i64,
    /// Number of observation map slots, one per probe.
    pub map_count: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunProgramStatus {
    Ok,
    Error,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgramResult {
    pub status: RunProgramStatus,
    pub verifier_log: String,
}

/// Answer of the verifier submission service for one program.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub verifier_log: String,
    /// Only meaningful when `is_valid` is set.
    pub program_fd: i64,
    /// Only meaningful when `is_valid` is not set.
    pub bpf_error: String,
    pub did_collect_coverage: bool,
    pub coverage_size: u64,
    pub coverage_buffer: u64,
    pub coverage_address: Vec<u64>,
}

/// Outcome of running a program once.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub did_succeed: bool,
    pub error_message: String,
    /// `elements[i]` is the value observed by probe `i`.
    pub elements: Vec<u64>,
}

impl ExecutionResult {
    pub fn success(elements: Vec<u64>) -> Self {
        Self {
            did_succeed: true,
            error_message: String::new(),
            elements,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            did_succeed: false,
            error_message: message.into(),
            elements: Vec::new(),
        }
    }

    /// Whether the instrumentation produced no signal at all.
    pub fn is_flaked(&self) -> bool {
        self.elements.iter().all(|value| *value == 0)
    }
}
