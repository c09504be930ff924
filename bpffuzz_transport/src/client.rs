//! Client side of the transport: registering with the orchestrator and
//! serving the programs it dispatches.

use bpffuzz::proto::{ClientInfo, RegistrationResult, RunProgramRequest};
use slog::{Logger, debug, error, info, warn};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::codec::{read_frame, write_frame};
use crate::config::TransportConfig;
use crate::connect::connect_with_retry;
use crate::error::{Result, TransportError};
use crate::messages::{Request, Response, RunProgramReply};

/// Runs a dispatched program on the local kernel.
///
/// Called from a blocking thread, never concurrently with itself.
pub trait LocalExecutor: Send + Sync + 'static {
    fn execute(&self, request: &RunProgramRequest) -> anyhow::Result<RunProgramReply>;
}

/// Announces this client to the registry at `registry`.
pub async fn register_client(
    registry: SocketAddr,
    info: ClientInfo,
    config: &TransportConfig,
    logger: &Logger,
) -> Result<RegistrationResult> {
    let mut stream =
        connect_with_retry(registry, &config.retry, config.connect_timeout, logger).await?;
    write_frame(&mut stream, &Request::RegisterClient(info)).await?;
    match read_frame::<_, Response>(&mut stream).await? {
        Some(Response::Registration(response)) => Ok(response.result),
        Some(Response::Rejected { reason }) => Err(TransportError::InvalidMessage(reason)),
        Some(other) => Err(TransportError::InvalidMessage(format!(
            "unexpected response to a registration: {other:?}"
        ))),
        None => Err(TransportError::ConnectionClosed),
    }
}

/// Serves `RunProgram` requests, one program at a time.
pub struct ClientService<E> {
    listener: TcpListener,
    executor: Arc<E>,
    run_lock: Arc<Mutex<()>>,
    logger: Logger,
}

impl<E: LocalExecutor> ClientService<E> {
    pub async fn bind(addr: &str, executor: Arc<E>, logger: Logger) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed {
                peer: "listener".to_string(),
                reason: e.to_string(),
            })?;
        info!(logger, "client service listening"; "addr" => addr);
        Ok(Self {
            listener,
            executor,
            run_lock: Arc::new(Mutex::new(())),
            logger,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(self.logger, "accepted connection"; "peer" => %peer);
                        let executor = Arc::clone(&self.executor);
                        let run_lock = Arc::clone(&self.run_lock);
                        let logger = self.logger.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_dispatch(stream, executor, run_lock, &logger).await {
                                warn!(logger, "dispatch connection failed"; "peer" => %peer, "error" => %e);
                            }
                        });
                    }
                    Err(e) => error!(self.logger, "accept failed"; "error" => %e),
                },
                _ = &mut shutdown => {
                    info!(self.logger, "client service shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_dispatch<E: LocalExecutor>(
    mut stream: TcpStream,
    executor: Arc<E>,
    run_lock: Arc<Mutex<()>>,
    logger: &Logger,
) -> Result<()> {
    while let Some(request) = read_frame::<_, Request>(&mut stream).await? {
        let response = match request {
            Request::RunProgram(request) => {
                let _running = run_lock.lock().await;
                Response::RunProgram(run_blocking(Arc::clone(&executor), request, logger).await)
            }
            Request::RegisterClient(_) => Response::Rejected {
                reason: "clients do not accept registrations".to_string(),
            },
        };
        write_frame(&mut stream, &response).await?;
    }
    debug!(logger, "connection closed by peer");
    Ok(())
}

async fn run_blocking<E: LocalExecutor>(
    executor: Arc<E>,
    request: RunProgramRequest,
    logger: &Logger,
) -> RunProgramReply {
    let outcome = tokio::task::spawn_blocking(move || executor.execute(&request)).await;
    match outcome {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            warn!(logger, "program execution failed"; "error" => %e);
            RunProgramReply::error(format!("{e:#}"))
        }
        Err(e) => {
            warn!(logger, "executor task failed"; "error" => %e);
            RunProgramReply::error(format!("executor task failed: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use assert_matches::assert_matches;
    use bpffuzz::proto::RunProgramStatus;
    use slog::{Discard, o};
    use std::time::Duration;
    use tokio::sync::oneshot;

    struct FailingExecutor;

    impl LocalExecutor for FailingExecutor {
        fn execute(&self, _: &RunProgramRequest) -> anyhow::Result<RunProgramReply> {
            anyhow::bail!("BPF_PROG_TEST_RUN: bad file descriptor")
        }
    }

    async fn start(executor: Arc<FailingExecutor>) -> (SocketAddr, oneshot::Sender<()>) {
        let service = ClientService::bind("127.0.0.1:0", executor, Logger::root(Discard, o!()))
            .await
            .unwrap();
        let addr = service.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(service.serve(async move {
            let _ = rx.await;
        }));
        (addr, tx)
    }

    #[tokio::test]
    async fn test_executor_error_becomes_error_status() {
        let (addr, _stop) = start(Arc::new(FailingExecutor)).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = RunProgramRequest {
            ebpf_program: vec![0x95],
            prog_fd: 3,
            map_fd: 4,
            map_count: 1,
        };
        write_frame(&mut stream, &Request::RunProgram(request)).await.unwrap();

        let reply = read_frame::<_, Response>(&mut stream).await.unwrap();
        assert_matches!(reply, Some(Response::RunProgram(reply)) => {
            assert_eq!(reply.result.status, RunProgramStatus::Error);
            assert!(!reply.execution.did_succeed);
            assert!(reply.execution.error_message.contains("bad file descriptor"));
        });
    }

    #[tokio::test]
    async fn test_client_rejects_registrations() {
        let (addr, _stop) = start(Arc::new(FailingExecutor)).await;
        let config = TransportConfig::default().with_retry(RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        });
        let info = ClientInfo {
            linux_version: "6.1".to_string(),
            client_ip: "127.0.0.1".to_string(),
            client_port: 1,
        };
        assert_matches!(
            register_client(addr, info, &config, &Logger::root(Discard, o!())).await,
            Err(TransportError::InvalidMessage(_))
        );
    }

    #[tokio::test]
    async fn test_unreachable_registry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = TransportConfig::default()
            .with_connect_timeout(Duration::from_millis(200))
            .with_retry(RetryConfig {
                max_attempts: 2,
                initial_delay: Duration::from_millis(5),
                ..RetryConfig::default()
            });
        let info = ClientInfo {
            linux_version: "6.1".to_string(),
            client_ip: "127.0.0.1".to_string(),
            client_port: 9001,
        };
        assert_matches!(
            register_client(addr, info, &config, &Logger::root(Discard, o!())).await,
            Err(TransportError::ConnectionFailed { .. })
        );
    }
}
