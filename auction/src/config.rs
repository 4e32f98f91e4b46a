//! Configuration management for the auction marketplace.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Without database URLs the stores are in memory; without Redpanda brokers the
//! event bus is in memory.

use crate::search::ItemRules;
use gavel_runtime::{RedeliveryPolicy, RelayConfig};
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A value is out of range or inconsistent with another
    #[error("Invalid {key}: {reason}")]
    Invalid {
        /// Environment variable at fault
        key: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// `PostgreSQL` configuration
    pub database: DatabaseConfig,
    /// Outbox relay configuration
    pub relay: RelaySettings,
    /// Queue consumer configuration
    pub consumer: ConsumerSettings,
    /// Bid validation gateway configuration
    pub gateway: GatewaySettings,
    /// Event bus configuration
    pub broker: BrokerConfig,
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Install the Prometheus recorder and serve `/metrics`
    pub metrics_enabled: bool,
    /// Model names the search projection rejects
    pub blocked_models: Vec<String>,
}

/// `PostgreSQL` configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Authority store URL (auctions, outbox, inbox, fault ledger)
    pub authority_url: Option<String>,
    /// Search projection URL; defaults to the authority database
    pub search_url: Option<String>,
    /// Maximum number of connections per pool
    pub max_connections: u32,
}

/// Outbox relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Seconds between relay ticks
    pub interval_secs: u64,
    /// Records fetched per tick
    pub batch_size: usize,
    /// Days sent records are kept (0 keeps them forever)
    pub retention_days: u64,
    /// Relay lease duration in seconds
    pub lease_ttl_secs: u64,
}

/// Queue consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerSettings {
    /// Handler attempts before dead-lettering
    pub max_attempts: u32,
    /// Seconds between attempts
    pub redelivery_interval_secs: u64,
    /// Maximum unacknowledged deliveries per consumer
    pub prefetch: usize,
}

/// Bid validation gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Snapshot timeout in milliseconds
    pub timeout_ms: u64,
}

/// Which event bus to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// In-process bus; messages do not survive a restart
    Memory,
    /// Redpanda / Kafka
    Redpanda,
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Bus implementation
    pub kind: BrokerKind,
    /// Broker addresses (comma-separated)
    pub brokers: String,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout: u64,
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl Config {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let brokers = non_empty(&lookup, "REDPANDA_BROKERS").unwrap_or_else(|| "localhost:9092".to_string());
        let kind = match non_empty(&lookup, "EVENT_BUS").as_deref() {
            Some("redpanda" | "kafka") => BrokerKind::Redpanda,
            Some(_) => BrokerKind::Memory,
            None if lookup("REDPANDA_BROKERS").is_some() => BrokerKind::Redpanda,
            None => BrokerKind::Memory,
        };

        Self {
            database: DatabaseConfig {
                authority_url: non_empty(&lookup, "DATABASE_URL"),
                search_url: non_empty(&lookup, "SEARCH_DATABASE_URL"),
                max_connections: parsed(&lookup, "DATABASE_MAX_CONNECTIONS", 10),
            },
            relay: RelaySettings {
                interval_secs: parsed(&lookup, "RELAY_INTERVAL_SECS", 10),
                batch_size: parsed(&lookup, "RELAY_BATCH_SIZE", 100),
                retention_days: parsed(&lookup, "RELAY_RETENTION_DAYS", 7),
                lease_ttl_secs: parsed(&lookup, "RELAY_LEASE_TTL_SECS", 30),
            },
            consumer: ConsumerSettings {
                max_attempts: parsed(&lookup, "CONSUMER_MAX_ATTEMPTS", 5),
                redelivery_interval_secs: parsed(&lookup, "CONSUMER_REDELIVERY_INTERVAL_SECS", 5),
                prefetch: parsed(&lookup, "CONSUMER_PREFETCH", 16),
            },
            gateway: GatewaySettings {
                timeout_ms: parsed(&lookup, "GATEWAY_TIMEOUT_MS", 2_000),
            },
            broker: BrokerConfig { kind, brokers },
            server: ServerConfig {
                host: non_empty(&lookup, "HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                port: parsed(&lookup, "PORT", 8080),
                shutdown_timeout: parsed(&lookup, "SHUTDOWN_TIMEOUT", 30),
            },
            metrics_enabled: parsed(&lookup, "METRICS_ENABLED", true),
            blocked_models: non_empty(&lookup, "BLOCKED_MODELS")
                .unwrap_or_else(|| "Foo".to_string())
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Reject values the runtime cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending variable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.interval_secs == 0 {
            return Err(ConfigError::invalid("RELAY_INTERVAL_SECS", "must be at least 1"));
        }
        if self.relay.lease_ttl_secs <= self.relay.interval_secs {
            return Err(ConfigError::invalid(
                "RELAY_LEASE_TTL_SECS",
                format!("must exceed the relay interval of {}s", self.relay.interval_secs),
            ));
        }
        if self.consumer.max_attempts == 0 {
            return Err(ConfigError::invalid("CONSUMER_MAX_ATTEMPTS", "must be at least 1"));
        }
        if self.gateway.timeout_ms == 0 {
            return Err(ConfigError::invalid("GATEWAY_TIMEOUT_MS", "must be at least 1"));
        }
        if self.database.search_url.is_some() && self.database.authority_url.is_none() {
            return Err(ConfigError::invalid(
                "SEARCH_DATABASE_URL",
                "requires DATABASE_URL; the in-memory authority cannot feed a durable projection",
            ));
        }
        self.bind_addr()?;
        Ok(())
    }

    /// Relay settings for the runtime.
    #[must_use]
    pub fn relay_config(&self) -> RelayConfig {
        let retention =
            (self.relay.retention_days > 0).then(|| Duration::from_secs(self.relay.retention_days * 24 * 60 * 60));
        RelayConfig {
            lease_ttl: Duration::from_secs(self.relay.lease_ttl_secs),
            ..RelayConfig::default()
        }
        .with_interval(Duration::from_secs(self.relay.interval_secs))
        .with_batch_size(self.relay.batch_size)
        .with_retention(retention)
    }

    /// Redelivery policy shared by every consumer.
    #[must_use]
    pub const fn redelivery_policy(&self) -> RedeliveryPolicy {
        RedeliveryPolicy {
            max_attempts: self.consumer.max_attempts,
            interval: Duration::from_secs(self.consumer.redelivery_interval_secs),
        }
    }

    /// Gateway snapshot timeout.
    #[must_use]
    pub const fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway.timeout_ms)
    }

    /// Search projection payload rules.
    #[must_use]
    pub fn item_rules(&self) -> ItemRules {
        ItemRules::new(self.blocked_models.iter().cloned())
    }

    /// Address the HTTP server listens on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::invalid("HOST", e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_run_in_memory() {
        let config = config(&[]);
        assert!(config.database.authority_url.is_none());
        assert_eq!(config.broker.kind, BrokerKind::Memory);
        assert_eq!(config.blocked_models, vec!["Foo"]);
        assert_eq!(config.redelivery_policy(), RedeliveryPolicy::default());
        assert_eq!(config.gateway_timeout(), Duration::from_secs(2));
        assert!(config.validate().is_ok());

        let relay = config.relay_config();
        assert_eq!(relay.interval, Duration::from_secs(10));
        assert_eq!(relay.retention, Some(Duration::from_secs(7 * 24 * 60 * 60)));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("REDPANDA_BROKERS", "rp-1:9092,rp-2:9092"),
            ("CONSUMER_MAX_ATTEMPTS", "3"),
            ("RELAY_RETENTION_DAYS", "0"),
            ("BLOCKED_MODELS", "Foo, Bar ,,"),
            ("PORT", "9000"),
            ("METRICS_ENABLED", "false"),
        ]);
        assert_eq!(config.broker.kind, BrokerKind::Redpanda);
        assert_eq!(config.consumer.max_attempts, 3);
        assert_eq!(config.relay_config().retention, None);
        assert_eq!(config.blocked_models, vec!["Foo", "Bar"]);
        assert_eq!(config.bind_addr().unwrap().port(), 9000);
        assert!(!config.metrics_enabled);
        assert!(config.item_rules().is_blocked("bar"));
    }

    #[test]
    fn unparsable_values_fall_back_to_defaults() {
        let config = config(&[("RELAY_BATCH_SIZE", "lots"), ("EVENT_BUS", "memory")]);
        assert_eq!(config.relay.batch_size, 100);
        assert_eq!(config.broker.kind, BrokerKind::Memory);
    }

    #[test]
    fn inconsistent_values_are_rejected() {
        let lease = config(&[("RELAY_INTERVAL_SECS", "30"), ("RELAY_LEASE_TTL_SECS", "30")]);
        assert!(matches!(
            lease.validate(),
            Err(ConfigError::Invalid { key: "RELAY_LEASE_TTL_SECS", .. })
        ));

        let search_only = config(&[("SEARCH_DATABASE_URL", "postgres://localhost/search")]);
        assert!(matches!(
            search_only.validate(),
            Err(ConfigError::Invalid { key: "SEARCH_DATABASE_URL", .. })
        ));

        let attempts = config(&[("CONSUMER_MAX_ATTEMPTS", "0")]);
        assert!(attempts.validate().is_err());
    }
}
