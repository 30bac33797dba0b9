//! Process configuration, read once from the environment at startup.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use pharmaflow_infra::broker::DEFAULT_MAX_DELIVERIES;
use pharmaflow_infra::fanout::FanOutConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} has an invalid value `{value}`: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    Memory,
    Redis,
}

impl FromStr for BrokerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(BrokerKind::Memory),
            "redis" => Ok(BrokerKind::Redis),
            _ => Err("expected `memory` or `redis`".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// Base URL of a remote inventory service. `None` reserves against the
    /// in-process ledger.
    pub inventory_service_url: Option<String>,
    pub reservation_timeout: Duration,
    pub fanout: FanOutConfig,
    pub broker: BrokerKind,
    pub redis_url: String,
    pub max_deliveries: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            inventory_service_url: None,
            reservation_timeout: Duration::from_millis(5000),
            fanout: FanOutConfig::default(),
            broker: BrokerKind::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            max_deliveries: DEFAULT_MAX_DELIVERIES,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset or blank variables keep their
    /// defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let fanout = FanOutConfig {
            capacity: parse(&get, "FANOUT_QUEUE_CAPACITY", defaults.fanout.capacity)?,
            poll: Duration::from_millis(parse(
                &get,
                "FANOUT_POLL_MS",
                defaults.fanout.poll.as_millis() as u64,
            )?),
            heartbeat: Duration::from_secs(parse(
                &get,
                "FANOUT_HEARTBEAT_SECS",
                defaults.fanout.heartbeat.as_secs(),
            )?),
        };
        if fanout.capacity == 0 {
            return Err(invalid("FANOUT_QUEUE_CAPACITY", "0", "must be at least 1"));
        }

        let max_deliveries = parse(&get, "LISTENER_MAX_DELIVERIES", defaults.max_deliveries)?;
        if max_deliveries == 0 {
            return Err(invalid("LISTENER_MAX_DELIVERIES", "0", "must be at least 1"));
        }

        let inventory_service_url = get("INVENTORY_SERVICE_URL");
        if let Some(url) = &inventory_service_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(invalid(
                    "INVENTORY_SERVICE_URL",
                    url,
                    "must start with http:// or https://",
                ));
            }
        }

        Ok(Self {
            bind_addr: parse(&get, "BIND_ADDR", defaults.bind_addr)?,
            inventory_service_url,
            reservation_timeout: Duration::from_millis(parse(
                &get,
                "RESERVATION_TIMEOUT_MS",
                defaults.reservation_timeout.as_millis() as u64,
            )?),
            fanout,
            broker: parse(&get, "BROKER", defaults.broker)?,
            redis_url: get("REDIS_URL").unwrap_or(defaults.redis_url),
            max_deliveries,
        })
    }
}

fn parse<T>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(var) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(var, &raw, e.to_string())),
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn from(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = from(&[]).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.fanout.capacity, 100);
        assert_eq!(config.fanout.poll, Duration::from_secs(1));
        assert_eq!(config.fanout.heartbeat, Duration::from_secs(30));
    }

    #[test]
    fn values_override_defaults() {
        let config = from(&[
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("INVENTORY_SERVICE_URL", "http://inventory:8080"),
            ("RESERVATION_TIMEOUT_MS", "250"),
            ("FANOUT_QUEUE_CAPACITY", "8"),
            ("BROKER", "Redis"),
            ("LISTENER_MAX_DELIVERIES", "3"),
        ])
        .unwrap();

        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(
            config.inventory_service_url.as_deref(),
            Some("http://inventory:8080")
        );
        assert_eq!(config.reservation_timeout, Duration::from_millis(250));
        assert_eq!(config.fanout.capacity, 8);
        assert_eq!(config.broker, BrokerKind::Redis);
        assert_eq!(config.max_deliveries, 3);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = from(&[("RESERVATION_TIMEOUT_MS", "soon")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: "RESERVATION_TIMEOUT_MS",
                ..
            }
        ));
        assert!(from(&[("BROKER", "kafka")]).is_err());
        assert!(from(&[("FANOUT_QUEUE_CAPACITY", "0")]).is_err());
        assert!(from(&[("INVENTORY_SERVICE_URL", "inventory:8080")]).is_err());
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = from(&[("INVENTORY_SERVICE_URL", "  ")]).unwrap();
        assert!(config.inventory_service_url.is_none());
    }
}
