// ABOUTME: Resilient multiplexed RPC client connection layer for portal backend services.
// ABOUTME: Transports, service binding, health-checked opening, keyed pooling, and scoped client use.

pub mod binding;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod health;
pub mod opener;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod transport;

// Addressing
pub use endpoint::{Endpoint, ServiceName, MULTIPLEX_SEPARATOR};

// Settings
pub use config::{ConnectionConfig, PoolConfig, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY};

// Error types
pub use error::{
    ConnectionError, PoolExhaustionError, ReleaseClass, RemoteApplicationError, RpcError,
    TransportError,
};

// Connection building
pub use binding::{bind, ClientHandle, HandleId, HandleState};
pub use health::{HealthCheck, HealthCheckTable, VersionCheck, DEFAULT_HEALTH_METHOD};
pub use opener::ConnectionOpener;
pub use transport::{TcpTransportFactory, Transport, TransportFactory};

// Pooling and scoped use
pub use context::{ClientContext, ServiceTarget};
pub use pool::{ConnectionPool, PoolKey, PoolStats, PooledHandle};

// Serving
pub use server::{serve, serve_connection, Dispatcher};

// Re-export for closures passed to `ClientContext::with_client`
pub use futures::future::BoxFuture;
