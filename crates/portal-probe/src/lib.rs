// ABOUTME: Library root for portal-probe.
// ABOUTME: Health-checks configured endpoints and services through the scoped client API.

pub mod config;
pub mod error;

pub use config::{Config, EndpointConfig, PoolSettings};
pub use error::{ProbeError, Result};

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use portal_rpc::{
    ClientContext, ConnectionPool, Dispatcher, RpcError, ServiceName, ServiceTarget,
    DEFAULT_HEALTH_METHOD,
};
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Services answered by the in-process server used by [`self_test`].
pub const SELF_TEST_SERVICES: &[&str] = &["SharingRegistry", "GroupManager", "UserProfile"];

/// Result of probing one endpoint/service pair.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub endpoint: String,
    pub service: Option<ServiceName>,
    pub outcome: ProbeOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The service answered its version query.
    Healthy { version: String, elapsed: Duration },
    /// No connection could be opened or the pool had no capacity.
    Unavailable { error: String },
    /// Connected, but the call itself failed.
    Failed { error: String },
}

impl ProbeReport {
    pub fn is_healthy(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::Healthy { .. })
    }
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match &self.service {
            Some(service) => format!("{}/{}", self.endpoint, service),
            None => self.endpoint.clone(),
        };
        match &self.outcome {
            ProbeOutcome::Healthy { version, elapsed } => {
                write!(f, "ok    {target}  version {version} ({}ms)", elapsed.as_millis())
            }
            ProbeOutcome::Unavailable { error } => write!(f, "DOWN  {target}  {error}"),
            ProbeOutcome::Failed { error } => write!(f, "FAIL  {target}  {error}"),
        }
    }
}

/// Probe one prepared target with the default health method.
pub async fn probe_target(ctx: &ClientContext, name: &str, target: &ServiceTarget) -> ProbeReport {
    let start = Instant::now();
    let result: std::result::Result<String, RpcError> = ctx
        .with_target(target, |client| {
            Box::pin(async move { client.call(DEFAULT_HEALTH_METHOD, &()).await })
        })
        .await;

    let outcome = match result {
        Ok(version) => {
            info!(endpoint = %name, service = ?target.service, %version, "probe ok");
            ProbeOutcome::Healthy {
                version,
                elapsed: start.elapsed(),
            }
        }
        Err(e) if e.is_unavailable() => {
            warn!(endpoint = %name, service = ?target.service, error = %e, "backend unavailable");
            ProbeOutcome::Unavailable {
                error: e.to_string(),
            }
        }
        Err(e) => {
            warn!(endpoint = %name, service = ?target.service, error = %e, "probe failed");
            ProbeOutcome::Failed {
                error: e.to_string(),
            }
        }
    };

    ProbeReport {
        endpoint: name.to_string(),
        service: target.service.clone(),
        outcome,
    }
}

/// Probe every configured endpoint/service pair concurrently.
pub async fn probe_all(ctx: &ClientContext, config: &Config) -> Result<Vec<ProbeReport>> {
    let mut targets = Vec::new();
    for ep in &config.endpoints {
        for service in ep.services()? {
            targets.push((
                ep.name.as_str(),
                ctx.for_service(ep.endpoint(), service, ep.connection_config()),
            ));
        }
    }

    let probes = targets
        .iter()
        .map(|(name, target)| probe_target(ctx, name, target));
    Ok(futures::future::join_all(probes).await)
}

/// Probe everything in `config` over real sockets, then drain the pool.
pub async fn run(config: &Config) -> Result<Vec<ProbeReport>> {
    let pool = ConnectionPool::tcp(config.pool.pool_config());
    let ctx = ClientContext::new(pool.clone());

    let reports = probe_all(&ctx, config).await?;

    let stats = pool.stats();
    info!(
        opened = stats.opened,
        reused = stats.reused,
        discarded = stats.discarded,
        "probe run finished"
    );
    pool.drain();
    Ok(reports)
}

/// Start an in-process server on loopback and probe it end to end.
pub async fn self_test() -> Result<Vec<ProbeReport>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let mut dispatcher = Dispatcher::new();
    for name in SELF_TEST_SERVICES {
        let service = ServiceName::new(*name)?;
        dispatcher.register_version(Some(&service), env!("CARGO_PKG_VERSION"));
    }
    let server = tokio::spawn(portal_rpc::serve(listener, Arc::new(dispatcher)));

    let config = Config {
        endpoints: vec![EndpointConfig {
            name: "self-test".into(),
            host: "127.0.0.1".into(),
            port,
            secure: false,
            services: SELF_TEST_SERVICES.iter().map(|s| s.to_string()).collect(),
            max_retries: 1,
            retry_delay_ms: 100,
            tls_verify: true,
            tls_ca_bundle: None,
            connect_timeout_ms: 2_000,
            call_timeout_ms: 2_000,
        }],
        pool: PoolSettings::default(),
    };

    let reports = run(&config).await;
    server.abort();
    reports
}
