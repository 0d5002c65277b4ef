// ABOUTME: Scoped acquire/use/release of pooled client handles.
// ABOUTME: Application code reaches backend services only through ClientContext::with_client.

use futures::future::BoxFuture;

use crate::binding::ClientHandle;
use crate::config::ConnectionConfig;
use crate::endpoint::{Endpoint, ServiceName};
use crate::error::{ReleaseClass, RpcError};
use crate::pool::ConnectionPool;

/// Entry point for making RPC calls against pooled connections.
///
/// Every exit path of [`ClientContext::with_client`] releases the handle
/// exactly once: healthy on success or on an application-level error,
/// unhealthy on a transport failure or when the future is dropped mid-call.
#[derive(Debug, Clone)]
pub struct ClientContext {
    pool: ConnectionPool,
}

impl ClientContext {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Bundle an endpoint, service and config for repeated use.
    pub fn for_service(
        &self,
        endpoint: Endpoint,
        service: Option<ServiceName>,
        config: ConnectionConfig,
    ) -> ServiceTarget {
        ServiceTarget {
            endpoint,
            service,
            config,
        }
    }

    /// Borrow a handle, run `f` with it, and release it.
    ///
    /// Borrow failures (exhausted retries, pool exhaustion) are converted
    /// into the caller's error type. Errors returned by `f` come back
    /// unchanged; [`ReleaseClass`] only decides whether the handle is
    /// pooled again.
    ///
    /// ```ignore
    /// let version: String = ctx
    ///     .with_client(&endpoint, Some(&service), &config, |client| {
    ///         Box::pin(async move { client.call("getAPIVersion", &()).await })
    ///     })
    ///     .await?;
    /// ```
    pub async fn with_client<T, E, F>(
        &self,
        endpoint: &Endpoint,
        service: Option<&ServiceName>,
        config: &ConnectionConfig,
        f: F,
    ) -> Result<T, E>
    where
        E: From<RpcError> + ReleaseClass,
        F: for<'c> FnOnce(&'c mut ClientHandle) -> BoxFuture<'c, Result<T, E>>,
    {
        let mut pooled = self
            .pool
            .borrow(endpoint, service, config)
            .await
            .map_err(E::from)?;

        let result = f(&mut *pooled).await;

        let healthy = match &result {
            Ok(_) => true,
            Err(e) => !e.is_transport_failure(),
        };
        if !healthy {
            tracing::debug!(
                handle = %pooled.id(),
                endpoint = %endpoint,
                service = ?service,
                "call failed at transport level, handle will be discarded"
            );
        }
        pooled.release(healthy);

        result
    }

    /// [`ClientContext::with_client`] against a prepared [`ServiceTarget`].
    pub async fn with_target<T, E, F>(&self, target: &ServiceTarget, f: F) -> Result<T, E>
    where
        E: From<RpcError> + ReleaseClass,
        F: for<'c> FnOnce(&'c mut ClientHandle) -> BoxFuture<'c, Result<T, E>>,
    {
        self.with_client(
            &target.endpoint,
            target.service.as_ref(),
            &target.config,
            f,
        )
        .await
    }
}

/// Endpoint, service and connection settings for one backend service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTarget {
    pub endpoint: Endpoint,
    pub service: Option<ServiceName>,
    pub config: ConnectionConfig,
}

impl ServiceTarget {
    pub fn new(endpoint: Endpoint, service: Option<ServiceName>, config: ConnectionConfig) -> Self {
        Self {
            endpoint,
            service,
            config,
        }
    }
}
