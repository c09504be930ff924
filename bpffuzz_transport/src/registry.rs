//! Server side of the transport: the registry of execution clients and the
//! dispatcher that sends programs to them.

use bpffuzz::proto::{ClientInfo, RegistrationResponse, RegistrationResult, RunProgramRequest};
use slog::{Logger, debug, error, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

use crate::codec::{read_frame, write_frame};
use crate::config::{RetryConfig, TransportConfig};
use crate::connect::{connect_once, connect_with_retry};
use crate::error::{Result, TransportError};
use crate::messages::{Request, Response, RunProgramReply};

/// A registered execution client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientRegistration {
    pub kernel_version_label: String,
    pub address: SocketAddr,
}

struct ClientEntry {
    registration: ClientRegistration,
    /// Held for the whole of a dispatch; a client runs one program at a time.
    dispatch_lock: Arc<Mutex<()>>,
}

/// Clients keyed by kernel label. Cloning shares the same registry.
#[derive(Clone)]
pub struct ClientRegistry {
    clients: Arc<RwLock<HashMap<String, ClientEntry>>>,
    connect_timeout: Duration,
    logger: Logger,
}

impl ClientRegistry {
    pub fn new(config: &TransportConfig, logger: Logger) -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            connect_timeout: config.connect_timeout,
            logger,
        }
    }

    /// Validates the callback address, checks that it accepts connections,
    /// then inserts the client or updates the address it is known under.
    pub async fn register(&self, info: &ClientInfo) -> RegistrationResult {
        if info.linux_version.is_empty() {
            warn!(self.logger, "registration without a kernel label"; "ip" => %info.client_ip);
            return RegistrationResult::Unknown;
        }
        let Some(address) = parse_address(info) else {
            warn!(self.logger, "invalid client address";
                "kernel" => %info.linux_version,
                "ip" => %info.client_ip,
                "port" => info.client_port);
            return RegistrationResult::InvalidAddress;
        };
        if let Err(e) = connect_once(address, self.connect_timeout).await {
            warn!(self.logger, "client is not reachable";
                "kernel" => %info.linux_version,
                "address" => %address,
                "error" => %e);
            return RegistrationResult::CannotConnect;
        }

        let mut clients = self.clients.write().await;
        clients
            .entry(info.linux_version.clone())
            .and_modify(|entry| entry.registration.address = address)
            .or_insert_with(|| ClientEntry {
                registration: ClientRegistration {
                    kernel_version_label: info.linux_version.clone(),
                    address,
                },
                dispatch_lock: Arc::new(Mutex::new(())),
            });
        info!(self.logger, "client registered";
            "kernel" => %info.linux_version,
            "address" => %address,
            "clients" => clients.len());
        RegistrationResult::Success
    }

    pub async fn get(&self, label: &str) -> Option<ClientRegistration> {
        let clients = self.clients.read().await;
        clients.get(label).map(|entry| entry.registration.clone())
    }

    pub async fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.clients.read().await.keys().cloned().collect();
        labels.sort();
        labels
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn dispatch_target(&self, label: &str) -> Option<(SocketAddr, Arc<Mutex<()>>)> {
        let clients = self.clients.read().await;
        clients
            .get(label)
            .map(|entry| (entry.registration.address, Arc::clone(&entry.dispatch_lock)))
    }
}

fn parse_address(info: &ClientInfo) -> Option<SocketAddr> {
    let ip: IpAddr = info.client_ip.trim().parse().ok()?;
    let port = u16::try_from(info.client_port).ok().filter(|port| *port != 0)?;
    Some(SocketAddr::new(ip, port))
}

/// Accepts registration requests from execution clients.
pub struct RegistryServer {
    listener: TcpListener,
    registry: ClientRegistry,
    logger: Logger,
}

impl RegistryServer {
    pub async fn bind(
        config: &TransportConfig,
        registry: ClientRegistry,
        logger: Logger,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).await.map_err(|e| {
            TransportError::ConnectionFailed {
                peer: "listener".to_string(),
                reason: e.to_string(),
            }
        })?;
        info!(logger, "registry listening"; "addr" => %config.listen_addr);
        Ok(Self {
            listener,
            registry,
            logger,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves connections until `shutdown` completes. Each connection is
    /// handled on its own task, so registrations proceed concurrently.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(self.logger, "accepted connection"; "peer" => %peer);
                        let registry = self.registry.clone();
                        let logger = self.logger.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_registration(stream, &registry).await {
                                warn!(logger, "registration connection failed"; "peer" => %peer, "error" => %e);
                            }
                        });
                    }
                    Err(e) => error!(self.logger, "accept failed"; "error" => %e),
                },
                _ = &mut shutdown => {
                    info!(self.logger, "registry shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_registration(mut stream: TcpStream, registry: &ClientRegistry) -> Result<()> {
    while let Some(request) = read_frame::<_, Request>(&mut stream).await? {
        let response = match request {
            Request::RegisterClient(info) => Response::Registration(RegistrationResponse {
                result: registry.register(&info).await,
            }),
            Request::RunProgram(_) => Response::Rejected {
                reason: "the registry does not run programs".to_string(),
            },
        };
        write_frame(&mut stream, &response).await?;
    }
    Ok(())
}

/// Sends programs to registered clients.
///
/// Dispatches to one client are serialized; dispatches to different clients
/// run in parallel. Every dispatch is bounded by the dispatch timeout.
#[derive(Clone)]
pub struct Dispatcher {
    registry: ClientRegistry,
    retry: RetryConfig,
    connect_timeout: Duration,
    dispatch_timeout: Duration,
    logger: Logger,
}

impl Dispatcher {
    pub fn new(registry: ClientRegistry, config: &TransportConfig, logger: Logger) -> Self {
        Self {
            registry,
            retry: config.retry.clone(),
            connect_timeout: config.connect_timeout,
            dispatch_timeout: config.dispatch_timeout,
            logger,
        }
    }

    pub async fn dispatch(&self, label: &str, request: &RunProgramRequest) -> Result<RunProgramReply> {
        let (address, lock) = self
            .registry
            .dispatch_target(label)
            .await
            .ok_or_else(|| TransportError::UnknownClient(label.to_string()))?;

        let _guard = lock.lock().await;
        debug!(self.logger, "dispatching program";
            "kernel" => label,
            "address" => %address,
            "instructions" => request.ebpf_program.len());
        let exchange = self.exchange(address, request);
        match timeout(self.dispatch_timeout, exchange).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                warn!(self.logger, "dispatch failed"; "kernel" => label, "error" => %e);
                Err(e)
            }
            Err(_) => {
                warn!(self.logger, "dispatch timed out";
                    "kernel" => label,
                    "timeout_ms" => self.dispatch_timeout.as_millis() as u64);
                Err(TransportError::Timeout)
            }
        }
    }

    async fn exchange(&self, address: SocketAddr, request: &RunProgramRequest) -> Result<RunProgramReply> {
        let mut stream =
            connect_with_retry(address, &self.retry, self.connect_timeout, &self.logger).await?;
        write_frame(&mut stream, &Request::RunProgram(request.clone())).await?;
        match read_frame::<_, Response>(&mut stream).await? {
            Some(Response::RunProgram(reply)) => Ok(reply),
            Some(Response::Rejected { reason }) => Err(TransportError::InvalidMessage(reason)),
            Some(other) => Err(TransportError::InvalidMessage(format!(
                "unexpected response to a program dispatch: {other:?}"
            ))),
            None => Err(TransportError::ConnectionClosed),
        }
    }
}
