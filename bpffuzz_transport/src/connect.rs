use slog::{Logger, warn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;

use crate::config::RetryConfig;
use crate::error::{Result, TransportError};

/// A single connection attempt bounded by `limit`.
pub(crate) async fn connect_once<A: ToSocketAddrs>(addr: A, limit: Duration) -> Result<TcpStream> {
    match timeout(limit, TcpStream::connect(addr)).await {
        Ok(stream) => Ok(stream?),
        Err(_) => Err(TransportError::Timeout),
    }
}

/// Connects to `addr`, retrying with exponential backoff.
pub(crate) async fn connect_with_retry(
    addr: SocketAddr,
    retry: &RetryConfig,
    limit: Duration,
    logger: &Logger,
) -> Result<TcpStream> {
    let mut attempts = 0;
    let mut delay = retry.initial_delay;

    loop {
        match connect_once(addr, limit).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                attempts += 1;
                if attempts >= retry.max_attempts {
                    return Err(TransportError::ConnectionFailed {
                        peer: addr.to_string(),
                        reason: format!("failed after {attempts} attempts: {e}"),
                    });
                }
                warn!(logger, "connection failed, retrying";
                    "peer" => %addr,
                    "attempt" => attempts,
                    "delay_ms" => delay.as_millis() as u64);
                tokio::time::sleep(delay).await;
                delay = retry.next_delay(delay);
            }
        }
    }
}
