//! # Store Endpoints
//!
//! An endpoint is the network address of one backing-store instance. All
//! configured endpoints are considered equivalent replicas of one logical
//! store.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Host and port of one store instance. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Creates an endpoint from a host name (or IP literal) and a port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    /// Pairs hosts with ports positionally.
    ///
    /// # Errors
    /// `EndpointMismatch` when the lists differ in length and `NoEndpoints`
    /// when both are empty.
    pub fn zip(hosts: &[String], ports: &[u16]) -> ConfigResult<Vec<Endpoint>> {
        if hosts.len() != ports.len() {
            return Err(ConfigError::EndpointMismatch {
                hosts: hosts.len(),
                ports: ports.len(),
            });
        }
        if hosts.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        Ok(hosts
            .iter()
            .zip(ports)
            .map(|(host, port)| Endpoint::new(host.clone(), *port))
            .collect())
    }

    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the `host:port` form accepted by `ToSocketAddrs`.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zip_pairs_positionally() {
        let hosts = vec!["a".to_string(), "b".to_string()];
        let endpoints = Endpoint::zip(&hosts, &[1, 2]).unwrap();
        assert_eq!(endpoints, vec![Endpoint::new("a", 1), Endpoint::new("b", 2)]);
    }

    #[test]
    fn zip_rejects_mismatch_and_empty() {
        let hosts = vec!["a".to_string()];
        assert!(matches!(
            Endpoint::zip(&hosts, &[1, 2]),
            Err(ConfigError::EndpointMismatch { hosts: 1, ports: 2 })
        ));
        assert!(matches!(
            Endpoint::zip(&[], &[]),
            Err(ConfigError::NoEndpoints)
        ));
    }

    #[test]
    fn displays_as_authority() {
        let endpoint = Endpoint::new("127.0.0.1", 6379);
        assert_eq!(endpoint.to_string(), "127.0.0.1:6379");
        assert_eq!(endpoint.authority(), endpoint.to_string());
    }
}
