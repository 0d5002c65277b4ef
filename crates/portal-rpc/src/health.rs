// ABOUTME: Liveness checks run on every freshly opened client handle.
// ABOUTME: A small per-service table picks the check instead of per-service client copies.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::binding::ClientHandle;
use crate::endpoint::ServiceName;
use crate::error::RpcError;

/// Method every portal service exposes for liveness probing.
pub const DEFAULT_HEALTH_METHOD: &str = "getAPIVersion";

/// A cheap, idempotent call proving the service behind a handle is ready.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, client: &mut ClientHandle) -> Result<(), RpcError>;
}

/// Calls a version query and expects a string back.
#[derive(Debug, Clone)]
pub struct VersionCheck {
    method: String,
}

impl VersionCheck {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl Default for VersionCheck {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_METHOD)
    }
}

#[async_trait]
impl HealthCheck for VersionCheck {
    async fn check(&self, client: &mut ClientHandle) -> Result<(), RpcError> {
        let version: String = client.call(&self.method, &()).await?;
        tracing::trace!(
            handle = %client.id(),
            service = ?client.service(),
            %version,
            "health check passed"
        );
        Ok(())
    }
}

/// Health checks keyed by service, with a fallback for everything else.
#[derive(Clone)]
pub struct HealthCheckTable {
    default: Arc<dyn HealthCheck>,
    by_service: HashMap<ServiceName, Arc<dyn HealthCheck>>,
}

impl HealthCheckTable {
    pub fn new(default: Arc<dyn HealthCheck>) -> Self {
        Self {
            default,
            by_service: HashMap::new(),
        }
    }

    /// Register a dedicated check for one service.
    pub fn with_service(mut self, service: ServiceName, check: Arc<dyn HealthCheck>) -> Self {
        self.by_service.insert(service, check);
        self
    }

    /// Check to run for `service` (the default when none is registered).
    pub fn for_service(&self, service: Option<&ServiceName>) -> Arc<dyn HealthCheck> {
        service
            .and_then(|s| self.by_service.get(s))
            .unwrap_or(&self.default)
            .clone()
    }
}

impl Default for HealthCheckTable {
    fn default() -> Self {
        Self::new(Arc::new(VersionCheck::default()))
    }
}

impl std::fmt::Debug for HealthCheckTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut services: Vec<_> = self.by_service.keys().map(ServiceName::as_str).collect();
        services.sort_unstable();
        f.debug_struct("HealthCheckTable")
            .field("services", &services)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::bind;
    use crate::protocol::{read_message, write_message, Message, MessageKind};
    use crate::transport::Transport;
    use std::time::Duration;

    #[tokio::test]
    async fn test_version_check_calls_configured_method() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut handle = bind(
            Transport::from_stream(client, "duplex"),
            Some(ServiceName::new("UserProfile").unwrap()),
            Duration::from_secs(5),
        );

        tokio::spawn(async move {
            let call = read_message(&mut server).await.unwrap().unwrap();
            assert_eq!(call.name, "UserProfile:getVersion");
            let reply = Message::new(MessageKind::Reply, call.seq, call.name, b"\"1.0\"".to_vec());
            write_message(&mut server, &reply).await.unwrap();
        });

        VersionCheck::new("getVersion").check(&mut handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_version_check_fails_on_remote_exception() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut handle = bind(
            Transport::from_stream(client, "duplex"),
            None,
            Duration::from_secs(5),
        );

        tokio::spawn(async move {
            let call = read_message(&mut server).await.unwrap().unwrap();
            let reply = Message::new(
                MessageKind::Exception,
                call.seq,
                call.name,
                br#"{"code":"Unavailable","message":"starting up"}"#.to_vec(),
            );
            write_message(&mut server, &reply).await.unwrap();
        });

        let err = VersionCheck::default().check(&mut handle).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(_)));
    }

    #[test]
    fn test_table_lookup_falls_back_to_default() {
        let sharing = ServiceName::new("SharingRegistry").unwrap();
        let other = ServiceName::new("Tenant").unwrap();
        let custom: Arc<dyn HealthCheck> = Arc::new(VersionCheck::new("getSharingVersion"));
        let table = HealthCheckTable::default().with_service(sharing.clone(), custom.clone());

        assert!(Arc::ptr_eq(&table.for_service(Some(&sharing)), &custom));
        assert!(!Arc::ptr_eq(&table.for_service(Some(&other)), &custom));
        assert!(!Arc::ptr_eq(&table.for_service(None), &custom));
    }

    #[test]
    fn test_table_debug_lists_services() {
        let table = HealthCheckTable::default().with_service(
            ServiceName::new("GroupManager").unwrap(),
            Arc::new(VersionCheck::default()),
        );
        let debug_str = format!("{:?}", table);
        assert!(debug_str.contains("GroupManager"));
    }

    #[test]
    fn test_default_method() {
        assert_eq!(VersionCheck::default().method(), "getAPIVersion");
    }
}
