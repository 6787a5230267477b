//! # Startup Configuration
//!
//! Purpose: Read every tunable once at process start and fail fast when a
//! required value is missing or malformed.
//!
//! ## Sources
//!
//! Each key is resolved from the process environment first, then from an
//! optional JSON config file holding an object with the same key names, then
//! from the built-in default. Keys without a default are required.
//!
//! ```text
//! {
//!   "HOST_NAME": "10.0.0.1, 10.0.0.2",
//!   "HOST_PORT": "6379, 6379",
//!   "REDIS_CONNECTION_TIMEOUT": 2000,
//!   "REDIS_CONNECTION_CHECK": 1000,
//!   "LOCK_TTL": 10,
//!   "LOCK_PULL_TIME": 100,
//!   "LOCK_RENEW_TIME": 3000
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::endpoint::Endpoint;
use crate::error::{ConfigError, ConfigResult};

pub const HOST_NAME: &str = "HOST_NAME";
pub const HOST_PORT: &str = "HOST_PORT";
pub const REDIS_PASSWORD: &str = "REDIS_PASSWORD";
pub const REDIS_CONNECTION_TIMEOUT: &str = "REDIS_CONNECTION_TIMEOUT";
pub const REDIS_CONNECTION_CHECK: &str = "REDIS_CONNECTION_CHECK";
pub const REDIS_DATA_EXPIRE: &str = "REDIS_DATA_EXPIRE";
pub const POOL_SIZE: &str = "POOL_SIZE";
pub const POOL_COUNT: &str = "POOL_COUNT";
pub const LOCK_TTL: &str = "LOCK_TTL";
pub const LOCK_PULL_TIME: &str = "LOCK_PULL_TIME";
pub const LOCK_RENEW_TIME: &str = "LOCK_RENEW_TIME";
pub const RETRY_ATTEMPTS: &str = "RETRY_ATTEMPTS";
pub const RETRY_DELAY: &str = "RETRY_DELAY";

/// Fully resolved settings for a LeaseKV client.
///
/// `Default` gives values suitable for local development; the loaders still
/// insist on the required keys being present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Settings {
    /// Store hosts, paired positionally with `ports`.
    pub hosts: Vec<String>,
    /// Store ports.
    pub ports: Vec<u16>,
    /// Optional credential sent with `AUTH` on every new connection.
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Connect/read/write timeout, also the bound on a blocking borrow.
    pub connection_timeout: Duration,
    /// Period of the pool health-check and replenish tasks.
    pub health_check_interval: Duration,
    /// TTL attached to plain data writes, `None` to keep keys forever.
    pub data_ttl: Option<Duration>,
    /// Maximum connections (total and idle) per pool.
    pub pool_size: usize,
    /// Number of warm pools kept by the manager.
    pub pool_count: usize,
    /// Lifetime of a lock record in the store.
    pub lock_ttl: Duration,
    /// Sleep between acquire attempts.
    pub lock_poll_interval: Duration,
    /// Renewal period for fixed locks; shorter than `lock_ttl`.
    pub lock_renew_interval: Duration,
    /// Attempts per facade operation, including the first.
    pub retry_attempts: u32,
    /// Backoff before the second attempt, doubled afterwards.
    pub retry_delay: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            hosts: vec!["localhost".to_string()],
            ports: vec![6379],
            password: None,
            connection_timeout: Duration::from_millis(2_000),
            health_check_interval: Duration::from_millis(1_000),
            data_ttl: None,
            pool_size: 8,
            pool_count: 2,
            lock_ttl: Duration::from_secs(10),
            lock_poll_interval: Duration::from_millis(100),
            lock_renew_interval: Duration::from_millis(3_000),
            retry_attempts: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

impl Settings {
    /// Loads settings from the process environment only.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_sources(|name| std::env::var(name).ok(), None)
    }

    /// Loads settings from the environment layered over an optional JSON file.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let text = match path {
            Some(path) => Some(std::fs::read_to_string(path)?),
            None => None,
        };
        Self::from_sources(|name| std::env::var(name).ok(), text.as_deref())
    }

    /// Resolves settings from a key lookup (usually the environment) and an
    /// optional JSON document. The lookup wins over the document.
    pub fn from_sources<F>(lookup: F, file: Option<&str>) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = match file {
            Some(text) => serde_json::from_str::<HashMap<String, Value>>(text)?,
            None => HashMap::new(),
        };
        let source = Source { lookup, file };
        let defaults = Settings::default();

        let hosts = match source.get(HOST_NAME) {
            Some(raw) => split_list(&raw),
            None => defaults.hosts,
        };
        let ports = match source.get(HOST_PORT) {
            Some(raw) => split_list(&raw)
                .iter()
                .map(|port| port.parse::<u16>().map_err(|_| ConfigError::invalid(HOST_PORT, port.as_str())))
                .collect::<ConfigResult<Vec<_>>>()?,
            None => defaults.ports,
        };

        let data_ttl = match source.optional_u64(REDIS_DATA_EXPIRE)? {
            Some(0) | None => None,
            Some(secs) => Some(Duration::from_secs(secs)),
        };

        let settings = Settings {
            hosts,
            ports,
            password: source.get(REDIS_PASSWORD),
            connection_timeout: Duration::from_millis(source.required_u64(REDIS_CONNECTION_TIMEOUT)?),
            health_check_interval: Duration::from_millis(source.required_u64(REDIS_CONNECTION_CHECK)?),
            data_ttl,
            pool_size: source
                .optional_u64(POOL_SIZE)?
                .map_or(defaults.pool_size, |v| v as usize),
            pool_count: source
                .optional_u64(POOL_COUNT)?
                .map_or(defaults.pool_count, |v| v as usize),
            lock_ttl: Duration::from_secs(source.required_u64(LOCK_TTL)?),
            lock_poll_interval: Duration::from_millis(source.required_u64(LOCK_PULL_TIME)?),
            lock_renew_interval: Duration::from_millis(source.required_u64(LOCK_RENEW_TIME)?),
            retry_attempts: source
                .optional_u64(RETRY_ATTEMPTS)?
                .map_or(defaults.retry_attempts, |v| v.min(u32::MAX as u64) as u32),
            retry_delay: source
                .optional_u64(RETRY_DELAY)?
                .map_or(defaults.retry_delay, Duration::from_millis),
        };
        settings.validate()?;

        tracing::debug!(
            endpoints = settings.hosts.len(),
            pool_size = settings.pool_size,
            pool_count = settings.pool_count,
            "settings loaded"
        );
        Ok(settings)
    }

    /// Checks cross-field invariants.
    pub fn validate(&self) -> ConfigResult<()> {
        Endpoint::zip(&self.hosts, &self.ports)?;
        if self.pool_size == 0 {
            return Err(ConfigError::invalid(POOL_SIZE, "0"));
        }
        if self.pool_count == 0 {
            return Err(ConfigError::invalid(POOL_COUNT, "0"));
        }
        if self.lock_ttl.is_zero() {
            return Err(ConfigError::invalid(LOCK_TTL, "0"));
        }
        if self.lock_renew_interval.is_zero() || self.lock_renew_interval >= self.lock_ttl {
            return Err(ConfigError::invalid(
                LOCK_RENEW_TIME,
                self.lock_renew_interval.as_millis().to_string(),
            ));
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError::invalid(RETRY_ATTEMPTS, "0"));
        }
        Ok(())
    }

    /// Returns the configured endpoints in declaration order.
    pub fn endpoints(&self) -> ConfigResult<Vec<Endpoint>> {
        Endpoint::zip(&self.hosts, &self.ports)
    }

    /// Replaces the endpoint lists, keeping every other value.
    pub fn with_endpoints(mut self, endpoints: &[Endpoint]) -> Self {
        self.hosts = endpoints.iter().map(|ep| ep.host().to_string()).collect();
        self.ports = endpoints.iter().map(Endpoint::port).collect();
        self
    }
}

struct Source<F> {
    lookup: F,
    file: HashMap<String, Value>,
}

impl<F> Source<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        if let Some(value) = (self.lookup)(name).filter(|v| !v.trim().is_empty()) {
            return Some(value.trim().to_string());
        }
        match self.file.get(name)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    fn optional_u64(&self, name: &str) -> ConfigResult<Option<u64>> {
        match self.get(name) {
            Some(raw) => raw
                .parse::<u64>()
                .map(Some)
                .map_err(|_| ConfigError::invalid(name, raw)),
            None => Ok(None),
        }
    }

    fn required_u64(&self, name: &str) -> ConfigResult<u64> {
        self.optional_u64(name)?
            .ok_or_else(|| ConfigError::Missing(name.to_string()))
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: Vec<(&'static str, &'static str)>) -> impl Fn(&str) -> Option<String> {
        move |name: &str| {
            pairs
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        }
    }

    const REQUIRED: &[(&str, &str)] = &[
        (REDIS_CONNECTION_TIMEOUT, "1500"),
        (REDIS_CONNECTION_CHECK, "500"),
        (LOCK_TTL, "4"),
        (LOCK_PULL_TIME, "50"),
        (LOCK_RENEW_TIME, "1000"),
    ];

    #[test]
    fn loads_required_keys_with_defaults() {
        let settings = Settings::from_sources(env(REQUIRED.to_vec()), None).unwrap();
        assert_eq!(settings.hosts, vec!["localhost"]);
        assert_eq!(settings.ports, vec![6379]);
        assert_eq!(settings.connection_timeout, Duration::from_millis(1500));
        assert_eq!(settings.health_check_interval, Duration::from_millis(500));
        assert_eq!(settings.lock_ttl, Duration::from_secs(4));
        assert_eq!(settings.lock_poll_interval, Duration::from_millis(50));
        assert_eq!(settings.lock_renew_interval, Duration::from_secs(1));
        assert_eq!(settings.pool_count, 2);
        assert!(settings.data_ttl.is_none());
        assert!(settings.password.is_none());
    }

    #[test]
    fn missing_required_key_is_fatal() {
        let err = Settings::from_sources(env(vec![(LOCK_TTL, "4")]), None).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(name) if name == REDIS_CONNECTION_TIMEOUT));
    }

    #[test]
    fn file_values_fill_gaps_and_env_wins() {
        let file = r#"{
            "HOST_NAME": "a, b",
            "HOST_PORT": "7000,7001",
            "REDIS_CONNECTION_TIMEOUT": 900,
            "REDIS_CONNECTION_CHECK": 300,
            "LOCK_TTL": 6,
            "LOCK_PULL_TIME": 20,
            "LOCK_RENEW_TIME": 2000,
            "REDIS_PASSWORD": "secret"
        }"#;
        let settings = Settings::from_sources(env(vec![(LOCK_TTL, "9")]), Some(file)).unwrap();
        assert_eq!(settings.hosts, vec!["a", "b"]);
        assert_eq!(settings.ports, vec![7000, 7001]);
        assert_eq!(settings.connection_timeout, Duration::from_millis(900));
        assert_eq!(settings.lock_ttl, Duration::from_secs(9));
        assert_eq!(settings.password.as_deref(), Some("secret"));
    }

    #[test]
    fn mismatched_endpoint_lists_are_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push((HOST_NAME, "a,b"));
        pairs.push((HOST_PORT, "1"));
        let err = Settings::from_sources(env(pairs), None).unwrap_err();
        assert!(matches!(err, ConfigError::EndpointMismatch { hosts: 2, ports: 1 }));
    }

    #[test]
    fn renewal_must_be_shorter_than_ttl() {
        let settings = Settings {
            lock_ttl: Duration::from_secs(1),
            lock_renew_interval: Duration::from_secs(1),
            ..Settings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Invalid { name, .. }) if name == LOCK_RENEW_TIME
        ));
    }

    #[test]
    fn bad_port_is_invalid() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push((HOST_PORT, "http"));
        let err = Settings::from_sources(env(pairs), None).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name, .. } if name == HOST_PORT));
    }

    #[test]
    fn zero_data_expire_means_no_ttl() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push((REDIS_DATA_EXPIRE, "0"));
        let settings = Settings::from_sources(env(pairs), None).unwrap();
        assert!(settings.data_ttl.is_none());
    }
}
