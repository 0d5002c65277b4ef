// ABOUTME: Shared fixtures for portal-rpc integration tests.
// ABOUTME: In-memory backends that count connection attempts and server-side closes.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use portal_rpc::{
    serve_connection, ConnectionConfig, ConnectionOpener, ConnectionPool, Dispatcher, Endpoint,
    HealthCheckTable, PoolConfig, RemoteApplicationError, ServiceName, Transport,
    TransportError, TransportFactory,
};

/// Transport factory backed by duplex pipes, each served by a [`Dispatcher`].
///
/// The first `refuse_first` attempts fail like a refused TCP connect.
pub struct FakeBackend {
    dispatcher: Arc<Dispatcher>,
    refuse_first: u32,
    attempts: AtomicU32,
    connected: AtomicU32,
    closed: Arc<AtomicU32>,
}

impl FakeBackend {
    pub fn new(dispatcher: Dispatcher) -> Arc<Self> {
        Self::refusing_first(dispatcher, 0)
    }

    pub fn refusing_first(dispatcher: Dispatcher, refuse_first: u32) -> Arc<Self> {
        Arc::new(Self {
            dispatcher: Arc::new(dispatcher),
            refuse_first,
            attempts: AtomicU32::new(0),
            connected: AtomicU32::new(0),
            closed: Arc::new(AtomicU32::new(0)),
        })
    }

    pub fn always_refusing() -> Arc<Self> {
        Self::refusing_first(Dispatcher::new(), u32::MAX)
    }

    /// Calls to `create`, successful or not.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Transports handed out.
    pub fn connected(&self) -> u32 {
        self.connected.load(Ordering::SeqCst)
    }

    /// Connections the server saw the client hang up.
    pub fn closed(&self) -> u32 {
        self.closed.load(Ordering::SeqCst)
    }

    /// Transports still open from the server's point of view.
    pub fn open(&self) -> u32 {
        self.connected() - self.closed()
    }
}

#[async_trait]
impl TransportFactory for FakeBackend {
    async fn create(
        &self,
        endpoint: &Endpoint,
        _config: &ConnectionConfig,
    ) -> Result<Transport, TransportError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.refuse_first {
            return Err(TransportError::Connect {
                addr: endpoint.authority(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            });
        }

        let (client, server) = tokio::io::duplex(64 * 1024);
        self.connected.fetch_add(1, Ordering::SeqCst);

        let dispatcher = self.dispatcher.clone();
        let closed = self.closed.clone();
        tokio::spawn(async move {
            let _ = serve_connection(server, dispatcher).await;
            closed.fetch_add(1, Ordering::SeqCst);
        });

        Ok(Transport::from_stream(client, endpoint.to_string()))
    }
}

/// A backend answering the health method plus a few test methods, both bare
/// and under each of `services`.
///
/// - `echo(String) -> String`
/// - `reject(()) -> RemoteApplicationError("Denied")`
/// - `stall(()) -> never answers`
pub fn healthy_dispatcher(services: &[&str]) -> Dispatcher {
    let mut dispatcher = Dispatcher::new();
    let mut prefixes: Vec<Option<ServiceName>> = vec![None];
    prefixes.extend(services.iter().map(|s| Some(ServiceName::new(*s).unwrap())));

    for service in &prefixes {
        let service = service.as_ref();
        dispatcher
            .register_version(service, "0.18.0")
            .register(service, "echo", |text: String| async move {
                Ok::<_, RemoteApplicationError>(text)
            })
            .register(service, "reject", |()| async {
                Err::<(), _>(RemoteApplicationError::new("Denied", "not allowed"))
            })
            .register(service, "stall", |()| async {
                std::future::pending::<()>().await;
                Ok::<(), RemoteApplicationError>(())
            });
    }
    dispatcher
}

/// A backend whose health method fails for its first `failures` calls.
pub fn flaky_health_dispatcher(failures: u32) -> Dispatcher {
    let calls = Arc::new(AtomicU32::new(0));
    let mut dispatcher = Dispatcher::new();
    dispatcher.register(None, portal_rpc::DEFAULT_HEALTH_METHOD, move |()| {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if call < failures {
                Err(RemoteApplicationError::new("Unavailable", "still starting"))
            } else {
                Ok("0.18.0".to_string())
            }
        }
    });
    dispatcher
}

pub fn endpoint() -> Endpoint {
    Endpoint::plain("backend.test", 9930)
}

pub fn service(name: &str) -> ServiceName {
    ServiceName::new(name).unwrap()
}

/// Three attempts, 1s linear backoff, generous timeouts.
pub fn connection_config() -> ConnectionConfig {
    ConnectionConfig::new()
        .with_max_retries(3)
        .with_retry_delay(Duration::from_secs(1))
        .with_call_timeout(Duration::from_secs(5))
}

pub fn opener(backend: Arc<FakeBackend>) -> ConnectionOpener {
    ConnectionOpener::new(backend, HealthCheckTable::default())
}

pub fn pool(backend: Arc<FakeBackend>, config: PoolConfig) -> ConnectionPool {
    ConnectionPool::new(opener(backend), config)
}

/// Poll `cond` until it holds, sleeping between checks.
pub async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}
