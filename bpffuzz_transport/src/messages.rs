//! Envelopes carried by the transport frames.

use bpffuzz::proto::{
    ClientInfo, ExecutionResult, RegistrationResponse, RunProgramRequest, RunProgramResult,
    RunProgramStatus,
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Client to registry.
    RegisterClient(ClientInfo),
    /// Orchestrator to client.
    RunProgram(RunProgramRequest),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Registration(RegistrationResponse),
    RunProgram(RunProgramReply),
    /// The receiving side does not serve this request.
    Rejected { reason: String },
}

/// A client's answer to [`Request::RunProgram`]: the run status together with
/// the values the probes observed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgramReply {
    pub result: RunProgramResult,
    pub execution: ExecutionResult,
}

impl RunProgramReply {
    pub fn ok(elements: Vec<u64>) -> Self {
        Self {
            result: RunProgramResult {
                status: RunProgramStatus::Ok,
                verifier_log: String::new(),
            },
            execution: ExecutionResult::success(elements),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            result: RunProgramResult {
                status: RunProgramStatus::Error,
                verifier_log: message.clone(),
            },
            execution: ExecutionResult::failure(message),
        }
    }
}
