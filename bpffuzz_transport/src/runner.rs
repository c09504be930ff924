use bpffuzz::orchestrator::ProgramRunner;
use bpffuzz::proto::{ExecutionResult, RunProgramRequest, RunProgramStatus};
use tokio::runtime::Handle;

use crate::registry::Dispatcher;

/// Runs programs on one registered client, blocking the calling thread until
/// the client answers.
///
/// Must not be called from inside the runtime `handle` belongs to.
pub struct RemoteRunner {
    handle: Handle,
    dispatcher: Dispatcher,
    client_label: String,
}

impl RemoteRunner {
    pub fn new(handle: Handle, dispatcher: Dispatcher, client_label: impl Into<String>) -> Self {
        Self {
            handle,
            dispatcher,
            client_label: client_label.into(),
        }
    }
}

impl ProgramRunner for RemoteRunner {
    fn run_program(&self, request: &RunProgramRequest) -> anyhow::Result<ExecutionResult> {
        let reply = self
            .handle
            .block_on(self.dispatcher.dispatch(&self.client_label, request))?;
        if reply.result.status != RunProgramStatus::Ok {
            let message = if reply.execution.error_message.is_empty() {
                format!(
                    "client {} reported {:?}: {}",
                    self.client_label, reply.result.status, reply.result.verifier_log
                )
            } else {
                reply.execution.error_message
            };
            return Ok(ExecutionResult::failure(message));
        }
        Ok(reply.execution)
    }
}
