// ABOUTME: Error taxonomy for the portal RPC client layer.
// ABOUTME: Separates retryable transport failures from terminal and remote application errors.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::endpoint::{Endpoint, ServiceName};

/// Socket, TLS or framing failure on a single transport.
///
/// Retried only inside the connection opener. Once a handle is checked out,
/// any of these means the stream can no longer be trusted.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Host name did not resolve to any address.
    #[error("could not resolve {addr}: {reason}")]
    Resolve { addr: String, reason: String },

    /// TCP connect was refused or reset.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// TLS setup or handshake failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The configured CA bundle could not be loaded.
    #[error("CA bundle {path}: {reason}")]
    CaBundle { path: String, reason: String },

    /// An operation did not finish before its deadline.
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// Read or write on an established stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer sent a frame we cannot interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection opened but the service did not answer its health check.
    #[error("health check failed: {0}")]
    HealthCheck(String),

    /// The handle was already closed.
    #[error("transport is closed")]
    Closed,
}

/// Terminal failure after the opener exhausted its retry budget.
#[derive(Error, Debug)]
#[error(
    "could not connect to {endpoint} (service {}) after {attempts} attempt(s): {last}",
    ServiceDisplay(.service.as_ref())
)]
pub struct ConnectionError {
    pub endpoint: Endpoint,
    pub service: Option<ServiceName>,
    pub attempts: u32,
    #[source]
    pub last: TransportError,
}

/// Structured error returned by the remote service.
///
/// The call reached the server and a full reply was read, so the connection
/// that carried it is still usable.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("remote error [{code}]: {message}")]
pub struct RemoteApplicationError {
    pub code: String,
    pub message: String,
}

impl RemoteApplicationError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// No handle became available within the pool's acquire timeout.
#[derive(Error, Debug)]
#[error(
    "pool exhausted for {endpoint} (service {}) after waiting {waited:?}",
    ServiceDisplay(.service.as_ref())
)]
pub struct PoolExhaustionError {
    pub endpoint: Endpoint,
    pub service: Option<ServiceName>,
    pub waited: Duration,
}

/// Errors surfaced to callers of the client layer.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Remote(#[from] RemoteApplicationError),

    #[error(transparent)]
    PoolExhausted(#[from] PoolExhaustionError),

    /// A request or reply body failed JSON encoding. The frame itself was
    /// written or read completely.
    #[error("body codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The pool was drained and lends no more handles.
    #[error("connection pool is closed")]
    PoolClosed,
}

impl RpcError {
    /// True when the backend could not be reached at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            RpcError::Connection(_) | RpcError::PoolExhausted(_) | RpcError::PoolClosed
        )
    }
}

/// Decides how a scoped handle is released when the caller's work fails.
pub trait ReleaseClass {
    /// True when the failure happened at the connection layer, so the handle
    /// must be discarded instead of returned to the pool.
    fn is_transport_failure(&self) -> bool;
}

impl ReleaseClass for RpcError {
    fn is_transport_failure(&self) -> bool {
        matches!(self, RpcError::Transport(_))
    }
}

struct ServiceDisplay<'a>(Option<&'a ServiceName>);

impl fmt::Display for ServiceDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(name) => write!(f, "'{}'", name),
            None => f.write_str("<default>"),
        }
    }
}

pub type Result<T, E = RpcError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new("api.example.org", 9930, false)
    }

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError {
            endpoint: endpoint(),
            service: Some(ServiceName::new("SharingRegistry").unwrap()),
            attempts: 3,
            last: TransportError::Closed,
        };
        assert_eq!(
            err.to_string(),
            "could not connect to api.example.org:9930 (service 'SharingRegistry') after 3 attempt(s): transport is closed"
        );
    }

    #[test]
    fn test_connection_error_display_without_service() {
        let err = ConnectionError {
            endpoint: endpoint(),
            service: None,
            attempts: 1,
            last: TransportError::Timeout {
                op: "connect",
                after: Duration::from_secs(2),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("<default>"));
        assert!(msg.contains("connect timed out after 2s"));
    }

    #[test]
    fn test_connection_error_source_is_last_transport_error() {
        use std::error::Error as _;

        let err = ConnectionError {
            endpoint: endpoint(),
            service: None,
            attempts: 2,
            last: TransportError::Protocol("bad frame".into()),
        };
        let source = err.source().expect("source");
        assert!(source.to_string().contains("bad frame"));
    }

    #[test]
    fn test_remote_error_display() {
        let err = RemoteApplicationError::new("AuthorizationException", "no access");
        assert_eq!(err.to_string(), "remote error [AuthorizationException]: no access");
    }

    #[test]
    fn test_release_class() {
        let transport: RpcError = TransportError::Closed.into();
        assert!(transport.is_transport_failure());

        let remote: RpcError = RemoteApplicationError::new("NotFound", "missing").into();
        assert!(!remote.is_transport_failure());

        let codec: RpcError = serde_json::from_str::<u32>("x").unwrap_err().into();
        assert!(!codec.is_transport_failure());

        let conn: RpcError = ConnectionError {
            endpoint: endpoint(),
            service: None,
            attempts: 1,
            last: TransportError::Closed,
        }
        .into();
        assert!(!conn.is_transport_failure());
        assert!(conn.is_unavailable());
    }

    #[test]
    fn test_pool_exhaustion_display() {
        let err = PoolExhaustionError {
            endpoint: Endpoint::new("localhost", 8930, true),
            service: None,
            waited: Duration::from_millis(250),
        };
        let msg = err.to_string();
        assert!(msg.contains("localhost:8930 (tls)"));
        assert!(msg.contains("250ms"));
    }

    #[test]
    fn test_error_debug() {
        let err = TransportError::Closed;
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("Closed"));
    }
}
