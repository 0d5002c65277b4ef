// ABOUTME: Opens health-checked client handles with bounded, linearly backed-off retries.
// ABOUTME: The only place transport failures are caught and retried.

use std::sync::Arc;

use crate::binding::{bind, ClientHandle};
use crate::config::ConnectionConfig;
use crate::endpoint::{Endpoint, ServiceName};
use crate::error::{ConnectionError, RpcError, TransportError};
use crate::health::HealthCheckTable;
use crate::transport::{TcpTransportFactory, TransportFactory};

/// Builds ready-to-use client handles.
///
/// Every handle returned has passed its service's health check. Handles
/// created by failed attempts are closed before the next attempt starts.
#[derive(Clone)]
pub struct ConnectionOpener {
    factory: Arc<dyn TransportFactory>,
    health: HealthCheckTable,
}

impl ConnectionOpener {
    pub fn new(factory: Arc<dyn TransportFactory>, health: HealthCheckTable) -> Self {
        Self { factory, health }
    }

    /// Opener over real TCP/TLS sockets with the default health checks.
    pub fn tcp() -> Self {
        Self::new(Arc::new(TcpTransportFactory::new()), HealthCheckTable::default())
    }

    /// Open a handle, retrying up to `config.max_retries` attempts.
    ///
    /// After failed attempt `n` (zero-based) the opener sleeps
    /// `retry_delay_base * (n + 1)`. There is no sleep after the last attempt.
    pub async fn open(
        &self,
        endpoint: &Endpoint,
        service: Option<&ServiceName>,
        config: &ConnectionConfig,
    ) -> Result<ClientHandle, ConnectionError> {
        let max_attempts = config.max_retries.max(1);
        let mut attempt = 0;
        let mut last_err = None;

        while attempt < max_attempts {
            match self.attempt(endpoint, service, config).await {
                Ok(handle) => {
                    if attempt > 0 {
                        tracing::info!(
                            endpoint = %endpoint,
                            service = ?service,
                            attempts = attempt + 1,
                            "connected after retry"
                        );
                    }
                    return Ok(handle);
                }
                Err(e) => {
                    tracing::debug!(
                        endpoint = %endpoint,
                        service = ?service,
                        attempt = attempt + 1,
                        max_attempts,
                        error = %e,
                        "connection attempt failed"
                    );
                    last_err = Some(e);
                }
            }

            attempt += 1;
            if attempt < max_attempts {
                tokio::time::sleep(config.backoff_for(attempt - 1)).await;
            }
        }

        let last = last_err.unwrap_or(TransportError::Closed);
        tracing::warn!(
            endpoint = %endpoint,
            service = ?service,
            attempts = attempt,
            error = %last,
            "giving up on connection"
        );

        Err(ConnectionError {
            endpoint: endpoint.clone(),
            service: service.cloned(),
            attempts: attempt,
            last,
        })
    }

    async fn attempt(
        &self,
        endpoint: &Endpoint,
        service: Option<&ServiceName>,
        config: &ConnectionConfig,
    ) -> Result<ClientHandle, TransportError> {
        let transport = self.factory.create(endpoint, config).await?;
        let mut handle = bind(transport, service.cloned(), config.call_timeout);

        let check = self.health.for_service(service);
        match check.check(&mut handle).await {
            Ok(()) => Ok(handle),
            Err(e) => {
                handle.close();
                Err(match e {
                    RpcError::Transport(transport_err) => transport_err,
                    other => TransportError::HealthCheck(other.to_string()),
                })
            }
        }
    }
}

impl std::fmt::Debug for ConnectionOpener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionOpener")
            .field("health", &self.health)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Factory that always refuses.
    struct Refusing {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl TransportFactory for Refusing {
        async fn create(
            &self,
            endpoint: &Endpoint,
            _config: &ConnectionConfig,
        ) -> Result<Transport, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Connect {
                addr: endpoint.authority(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            })
        }
    }

    fn config(retries: u32) -> ConnectionConfig {
        ConnectionConfig::new()
            .with_max_retries(retries)
            .with_retry_delay(Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_exhausts_retries() {
        let factory = Arc::new(Refusing {
            attempts: AtomicU32::new(0),
        });
        let opener = ConnectionOpener::new(factory.clone(), HealthCheckTable::default());
        let endpoint = Endpoint::plain("api.example.org", 9930);

        let start = tokio::time::Instant::now();
        let err = opener.open(&endpoint, None, &config(4)).await.unwrap_err();

        assert_eq!(factory.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(err.attempts, 4);
        assert_eq!(err.endpoint, endpoint);
        assert!(matches!(err.last, TransportError::Connect { .. }));
        // 100 + 200 + 300ms; no sleep after the final attempt.
        assert_eq!(start.elapsed(), Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_still_attempts_once() {
        let factory = Arc::new(Refusing {
            attempts: AtomicU32::new(0),
        });
        let opener = ConnectionOpener::new(factory.clone(), HealthCheckTable::default());

        let err = opener
            .open(&Endpoint::plain("h", 1), None, &config(0))
            .await
            .unwrap_err();
        assert_eq!(factory.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_error_carries_service() {
        let opener = ConnectionOpener::new(
            Arc::new(Refusing {
                attempts: AtomicU32::new(0),
            }),
            HealthCheckTable::default(),
        );
        let service = ServiceName::new("CredentialStore").unwrap();

        let err = opener
            .open(&Endpoint::plain("h", 1), Some(&service), &config(1))
            .await
            .unwrap_err();
        assert_eq!(err.service, Some(service));
        assert!(err.to_string().contains("'CredentialStore'"));
    }

    #[test]
    fn test_opener_debug() {
        let debug_str = format!("{:?}", ConnectionOpener::tcp());
        assert!(debug_str.contains("ConnectionOpener"));
    }
}
