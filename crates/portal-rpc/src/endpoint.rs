// ABOUTME: Endpoint identity and logical service names for multiplexed connections.
// ABOUTME: Endpoints key the connection pool; service names tag calls on a shared socket.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RpcError;

/// Separator between service name and method name on the wire.
pub const MULTIPLEX_SEPARATOR: char = ':';

/// Network address of one backend process.
///
/// Two endpoints are equal iff host, port and the `secure` flag all match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            host: host.into().trim().to_string(),
            port,
            secure,
        }
    }

    /// Plaintext endpoint.
    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, false)
    }

    /// TLS endpoint.
    pub fn secure(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, true)
    }

    /// `host:port` string suitable for socket address resolution.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)?;
        if self.secure {
            f.write_str(" (tls)")?;
        }
        Ok(())
    }
}

/// Logical service multiplexed over an endpoint's connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceName(String);

impl ServiceName {
    /// Validate and wrap a service name.
    ///
    /// Names must be non-empty and must not contain the multiplex separator,
    /// otherwise the server could not split them from the method name.
    pub fn new(name: impl Into<String>) -> Result<Self, RpcError> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(RpcError::InvalidConfig(
                "service name must not be empty".into(),
            ));
        }
        if trimmed.contains(MULTIPLEX_SEPARATOR) {
            return Err(RpcError::InvalidConfig(format!(
                "service name '{}' must not contain '{}'",
                trimmed, MULTIPLEX_SEPARATOR
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ServiceName {
    type Error = RpcError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for ServiceName {
    type Error = RpcError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ServiceName> for String {
    fn from(value: ServiceName) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_endpoint_equality_includes_secure_flag() {
        let plain = Endpoint::plain("localhost", 9930);
        let tls = Endpoint::secure("localhost", 9930);
        assert_ne!(plain, tls);
        assert_eq!(plain, Endpoint::new("localhost", 9930, false));

        let mut set = HashSet::new();
        set.insert(plain.clone());
        set.insert(tls);
        set.insert(plain);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::plain("a.org", 1).to_string(), "a.org:1");
        assert_eq!(Endpoint::secure("a.org", 443).to_string(), "a.org:443 (tls)");
    }

    #[test]
    fn test_endpoint_trims_host() {
        let ep = Endpoint::plain("  api.example.org ", 80);
        assert_eq!(ep.authority(), "api.example.org:80");
    }

    #[test]
    fn test_endpoint_deserialize_default_secure() {
        let ep: Endpoint = serde_json::from_str(r#"{"host":"h","port":9}"#).unwrap();
        assert!(!ep.secure);
    }

    #[test]
    fn test_service_name_validation() {
        assert!(ServiceName::new("GroupManager").is_ok());
        assert_eq!(ServiceName::new("  Tenant ").unwrap().as_str(), "Tenant");
        assert!(ServiceName::new("").is_err());
        assert!(ServiceName::new("   ").is_err());
        assert!(ServiceName::new("a:b").is_err());
    }

    #[test]
    fn test_service_name_serde_validates() {
        let ok: ServiceName = serde_json::from_str(r#""UserProfile""#).unwrap();
        assert_eq!(ok.to_string(), "UserProfile");
        assert!(serde_json::from_str::<ServiceName>(r#""bad:name""#).is_err());
    }
}
