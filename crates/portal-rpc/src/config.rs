// ABOUTME: Connection and pool configuration for the portal RPC client.
// ABOUTME: Plain values built once at startup and passed by reference to every call.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::RpcError;

/// Default number of connection attempts before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay between attempts. Attempt `n` waits `n * base`.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Settings governing how a connection is opened and used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Total connection attempts, at least 1.
    pub max_retries: u32,
    /// Base for linear backoff between failed attempts.
    pub retry_delay_base: Duration,
    /// Verify the server certificate on TLS endpoints.
    pub tls_verify: bool,
    /// PEM bundle of trusted roots. Bundled web PKI roots are used when unset.
    pub tls_ca_bundle: Option<PathBuf>,
    /// Deadline for TCP connect plus TLS handshake.
    pub connect_timeout: Duration,
    /// Deadline for a single RPC round trip, health check included.
    pub call_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_base: DEFAULT_RETRY_DELAY,
            tls_verify: true,
            tls_ca_bundle: None,
            connect_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    /// Create a connection config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the total number of attempts.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the linear backoff base.
    pub fn with_retry_delay(mut self, base: Duration) -> Self {
        self.retry_delay_base = base;
        self
    }

    /// Verify certificates against the given PEM bundle.
    pub fn with_ca_bundle(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls_verify = true;
        self.tls_ca_bundle = Some(path.into());
        self
    }

    /// Skip certificate verification entirely.
    /// Only for legacy deployments with self-signed certificates.
    pub fn insecure(mut self) -> Self {
        self.tls_verify = false;
        self
    }

    /// Set connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set per-call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Delay to sleep after failed attempt number `attempt` (zero-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.retry_delay_base.saturating_mul(attempt.saturating_add(1))
    }

    /// Reject values the opener cannot work with.
    pub fn validate(&self) -> Result<(), RpcError> {
        if self.max_retries == 0 {
            return Err(RpcError::InvalidConfig(
                "max_retries must be at least 1".into(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(RpcError::InvalidConfig(
                "connect_timeout must be greater than zero".into(),
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(RpcError::InvalidConfig(
                "call_timeout must be greater than zero".into(),
            ));
        }
        if !self.tls_verify && self.tls_ca_bundle.is_some() {
            tracing::warn!("tls_ca_bundle is ignored because tls_verify is disabled");
        }
        Ok(())
    }
}

/// Settings for the handle pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum idle time before a pooled handle is discarded.
    pub keepalive: Duration,
    /// Optional cap on handles checked out at once per endpoint/service.
    pub max_outstanding: Option<usize>,
    /// How long a borrower waits for a slot when the cap is reached.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(60),
            max_outstanding: None,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Limit concurrently checked-out handles per key.
    pub fn with_max_outstanding(mut self, max: usize) -> Self {
        self.max_outstanding = Some(max);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), RpcError> {
        if self.max_outstanding == Some(0) {
            return Err(RpcError::InvalidConfig(
                "max_outstanding must be at least 1 when set".into(),
            ));
        }
        Ok(())
    }
}
