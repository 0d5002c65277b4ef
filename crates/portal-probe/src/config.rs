// ABOUTME: Endpoint configuration loading and validation for portal-probe.
// ABOUTME: Supports TOML config files with environment variable expansion.

use std::path::PathBuf;
use std::time::Duration;

use portal_rpc::{ConnectionConfig, Endpoint, PoolConfig, ServiceName};
use serde::Deserialize;
use tracing::warn;

use crate::error::{ProbeError, Result};

/// Top-level configuration: the endpoints to probe plus shared pool settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "endpoint", default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub pool: PoolSettings,
}

/// One backend endpoint and the services multiplexed on it.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Label used in probe output.
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
    /// Multiplexed service names. Empty means a single-service endpoint.
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,
    /// PEM bundle of trusted roots. `~` is expanded.
    #[serde(default)]
    pub tls_ca_bundle: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

/// Pool behavior shared by all endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default)]
    pub max_outstanding: Option<usize>,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            keepalive_secs: default_keepalive_secs(),
            max_outstanding: None,
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    portal_rpc::DEFAULT_MAX_RETRIES
}

fn default_retry_delay_ms() -> u64 {
    portal_rpc::DEFAULT_RETRY_DELAY.as_millis() as u64
}

fn default_tls_verify() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_keepalive_secs() -> u64 {
    60
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

impl EndpointConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port, self.secure)
    }

    /// Services to probe; a single `None` when the endpoint is not multiplexed.
    pub fn services(&self) -> Result<Vec<Option<ServiceName>>> {
        if self.services.is_empty() {
            return Ok(vec![None]);
        }
        self.services
            .iter()
            .map(|name| {
                ServiceName::new(name.as_str()).map(Some).map_err(|e| {
                    ProbeError::Config(format!("endpoint '{}': {}", self.name, e))
                })
            })
            .collect()
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        let mut config = ConnectionConfig::new()
            .with_max_retries(self.max_retries)
            .with_retry_delay(Duration::from_millis(self.retry_delay_ms))
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_call_timeout(Duration::from_millis(self.call_timeout_ms));
        if let Some(bundle) = &self.tls_ca_bundle {
            config = config.with_ca_bundle(shellexpand::tilde(bundle).into_owned());
        }
        if !self.tls_verify {
            config = config.insecure();
        }
        config
    }
}

impl PoolSettings {
    pub fn pool_config(&self) -> PoolConfig {
        let config = PoolConfig::new()
            .with_keepalive(Duration::from_secs(self.keepalive_secs))
            .with_acquire_timeout(Duration::from_millis(self.acquire_timeout_ms));
        match self.max_outstanding {
            Some(max) => config.with_max_outstanding(max),
            None => config,
        }
    }
}

impl Config {
    /// Default location: `~/.config/portal/endpoints.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("portal").join("endpoints.toml"))
    }

    /// Load configuration from the specified path or default location.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = path
            .or_else(Self::default_path)
            .ok_or_else(|| ProbeError::Config("Could not determine config path".into()))?;

        let contents = std::fs::read_to_string(&path).map_err(|e| {
            ProbeError::Config(format!("Failed to read config from {:?}: {}", path, e))
        })?;

        Self::from_toml(&contents)
    }

    /// Parse and validate a config document, expanding `${VAR}` references.
    pub fn from_toml(contents: &str) -> Result<Self> {
        // Undefined variables expand to an empty string with a warning.
        let contents = shellexpand::env_with_context_no_errors(contents, |var: &str| {
            match std::env::var(var) {
                Ok(val) => Some(val),
                Err(_) => {
                    warn!(
                        variable = %var,
                        "Environment variable not defined, using empty string"
                    );
                    Some(String::new())
                }
            }
        });

        let config: Config = toml::from_str(&contents)
            .map_err(|e| ProbeError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Check every endpoint and the pool settings.
    fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(ProbeError::Config(
                "at least one [[endpoint]] is required".into(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for ep in &self.endpoints {
            if ep.name.is_empty() {
                return Err(ProbeError::Config("endpoint.name is required".into()));
            }
            if !names.insert(ep.name.as_str()) {
                return Err(ProbeError::Config(format!(
                    "duplicate endpoint name '{}'",
                    ep.name
                )));
            }
            if ep.host.is_empty() {
                return Err(ProbeError::Config(format!(
                    "endpoint '{}': host is required",
                    ep.name
                )));
            }
            if ep.port == 0 {
                return Err(ProbeError::Config(format!(
                    "endpoint '{}': port must be non-zero",
                    ep.name
                )));
            }
            ep.services()?;
            ep.connection_config()
                .validate()
                .map_err(|e| ProbeError::Config(format!("endpoint '{}': {}", ep.name, e)))?;
        }

        self.pool
            .pool_config()
            .validate()
            .map_err(|e| ProbeError::Config(format!("pool: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_settings_default() {
        let settings = PoolSettings::default();
        assert_eq!(settings.keepalive_secs, 60);
        assert!(settings.max_outstanding.is_none());
        assert_eq!(settings.pool_config().keepalive, Duration::from_secs(60));
    }

    #[test]
    fn test_endpoint_defaults() {
        let config = Config::from_toml(
            r#"
            [[endpoint]]
            name = "api"
            host = "localhost"
            port = 9930
            "#,
        )
        .unwrap();
        let ep = &config.endpoints[0];
        assert!(!ep.secure);
        assert!(ep.tls_verify);
        assert_eq!(ep.max_retries, 3);
        assert_eq!(ep.retry_delay_ms, 1000);
        assert_eq!(ep.services().unwrap(), vec![None]);
    }
}
