//! Networked execution transport for bpffuzz.
//!
//! Execution clients, one per kernel build, register with the orchestrator's
//! [`ClientRegistry`] through a [`RegistryServer`]. The orchestrator then
//! sends programs to them with a [`Dispatcher`], or through a
//! [`RemoteRunner`] when it drives the transport from a plain thread.
//! Clients serve dispatched programs with a [`ClientService`].
//!
//! ## Example
//!
//! ```no_run
//! use bpffuzz_transport::{ClientRegistry, Dispatcher, RegistryServer, RemoteRunner, TransportConfig};
//! use slog::{Discard, Logger, o};
//!
//! fn main() -> anyhow::Result<()> {
//!     let logger = Logger::root(Discard, o!());
//!     let config = TransportConfig::from_env()?;
//!     let runtime = tokio::runtime::Runtime::new()?;
//!
//!     let registry = ClientRegistry::new(&config, logger.clone());
//!     let server = runtime.block_on(RegistryServer::bind(&config, registry.clone(), logger.clone()))?;
//!     runtime.spawn(server.serve(std::future::pending()));
//!
//!     // Once the client for this kernel has registered:
//!     let dispatcher = Dispatcher::new(registry, &config, logger);
//!     let _runner = RemoteRunner::new(runtime.handle().clone(), dispatcher, "6.8.0");
//!     Ok(())
//! }
//! ```
//!
//! ## Message Framing
//!
//! Every message is a CBOR-encoded [`Request`] or [`Response`] behind a
//! length prefix:
//!
//! ```text
//! +------------------+-------------------+
//! | Length (4 bytes) | Payload (N bytes) |
//! | (big-endian u32) |  (CBOR envelope)  |
//! +------------------+-------------------+
//! ```

mod client;
mod codec;
mod config;
mod connect;
mod error;
mod messages;
mod registry;
mod runner;

pub use client::{ClientService, LocalExecutor, register_client};
pub use codec::{read_frame, write_frame};
pub use config::{RetryConfig, TransportConfig};
pub use error::TransportError;
pub use messages::{Request, Response, RunProgramReply};
pub use registry::{ClientRegistration, ClientRegistry, Dispatcher, RegistryServer};
pub use runner::RemoteRunner;
