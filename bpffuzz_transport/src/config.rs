//! Configuration for the execution transport.

use anyhow::{Context, Result};
use std::time::Duration;

pub const LISTEN_ADDR_VAR: &str = "BPFFUZZ_LISTEN_ADDR";
pub const DISPATCH_TIMEOUT_VAR: &str = "BPFFUZZ_DISPATCH_TIMEOUT_MS";
pub const CONNECT_TIMEOUT_VAR: &str = "BPFFUZZ_CONNECT_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Address the registry listens on.
    pub listen_addr: String,
    /// Bound on one whole dispatch, connection included.
    pub dispatch_timeout: Duration,
    /// Bound on a single connection attempt.
    pub connect_timeout: Duration,
    pub retry: RetryConfig,
}

/// Configuration for connection retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of connection attempts.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay to wait after a failed attempt that waited `delay`.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        std::cmp::min(
            Duration::from_secs_f64(delay.as_secs_f64() * self.backoff_multiplier),
            self.max_delay,
        )
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9000".to_string(),
            dispatch_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ..Self::default()
        }
    }

    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Create configuration from environment variables.
    ///
    /// Recognized variables, each optional:
    /// - `BPFFUZZ_LISTEN_ADDR`: address the registry listens on
    /// - `BPFFUZZ_DISPATCH_TIMEOUT_MS`: dispatch timeout in milliseconds
    /// - `BPFFUZZ_CONNECT_TIMEOUT_MS`: connect timeout in milliseconds
    ///
    /// # Errors
    ///
    /// Returns an error if a timeout is not a number of milliseconds.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(addr) = lookup(LISTEN_ADDR_VAR) {
            config.listen_addr = addr;
        }
        if let Some(ms) = lookup(DISPATCH_TIMEOUT_VAR) {
            config.dispatch_timeout = parse_millis(DISPATCH_TIMEOUT_VAR, &ms)?;
        }
        if let Some(ms) = lookup(CONNECT_TIMEOUT_VAR) {
            config.connect_timeout = parse_millis(CONNECT_TIMEOUT_VAR, &ms)?;
        }
        Ok(config)
    }
}

fn parse_millis(name: &str, value: &str) -> Result<Duration> {
    let ms: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("{name} must be a number of milliseconds, got `{value}`"))?;
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_config_builder() {
        let config = TransportConfig::new("127.0.0.1:7000")
            .with_dispatch_timeout(Duration::from_millis(250))
            .with_connect_timeout(Duration::from_millis(50));

        assert_eq!(config.listen_addr, "127.0.0.1:7000");
        assert_eq!(config.dispatch_timeout, Duration::from_millis(250));
        assert_eq!(config.connect_timeout, Duration::from_millis(50));
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_retry_backoff_is_capped() {
        let retry = RetryConfig::default();
        assert_eq!(retry.next_delay(Duration::from_millis(100)), Duration::from_millis(200));
        assert_eq!(retry.next_delay(Duration::from_secs(8)), Duration::from_secs(10));
    }

    #[test]
    fn test_env_overrides_defaults() {
        let config = TransportConfig::from_lookup(lookup(&[
            (LISTEN_ADDR_VAR, "10.0.0.1:9100"),
            (DISPATCH_TIMEOUT_VAR, "1500"),
        ]))
        .unwrap();

        assert_eq!(config.listen_addr, "10.0.0.1:9100");
        assert_eq!(config.dispatch_timeout, Duration::from_millis(1500));
        assert_eq!(config.connect_timeout, TransportConfig::default().connect_timeout);
    }

    #[test]
    fn test_env_rejects_bad_timeout() {
        let err = TransportConfig::from_lookup(lookup(&[(CONNECT_TIMEOUT_VAR, "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains(CONNECT_TIMEOUT_VAR));
    }
}
