//! Process configuration.
//!
//! A `NodeConfig` is built once when the process starts (from the
//! `MSC_WIS2NODE_*` environment variables or any other key lookup) and is
//! handed to the dispatch pipeline by reference. Nothing below this module
//! reads the environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Prefix shared by every environment variable the node reads.
pub const ENV_PREFIX: &str = "MSC_WIS2NODE_";

/// Default topic prefix for WIS2 origin notifications.
pub const DEFAULT_TOPIC_PREFIX: &str = "origin/a/wis2";

/// Default broker port (MQTT over TLS).
pub const DEFAULT_BROKER_PORT: u16 = 8883;

/// Default lifetime of a duplicate-cache entry.
pub const DEFAULT_CACHE_EXPIRY_SECONDS: u64 = 86_400;

/// Default bound on a single publish call.
pub const DEFAULT_PUBLISH_TIMEOUT_SECONDS: u64 = 10;

/// Broker connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker hostname.
    pub hostname: String,
    /// Broker port.
    #[serde(default = "default_broker_port")]
    pub port: u16,
    /// Username for authentication.
    pub username: String,
    /// Password for authentication.
    pub password: String,
    /// Whether the connection is TLS-secured.
    #[serde(default = "default_tls")]
    pub tls: bool,
    /// MQTT client identifier.
    #[serde(default = "client_id")]
    pub client_id: String,
}

fn default_broker_port() -> u16 {
    DEFAULT_BROKER_PORT
}

fn default_tls() -> bool {
    true
}

/// Builds the MQTT client identifier announced to the broker.
#[must_use]
pub fn client_id() -> String {
    let suffix = uuid::Uuid::new_v4().as_u128() % 1000;
    format!("msc-wis2node id={suffix} (https://github.com/ECCC-MSC/msc-wis2node)")
}

/// Complete node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Broker connection.
    pub broker: BrokerConfig,
    /// Topic prefix, e.g. `origin/a/wis2`.
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    /// Originating centre identifier, e.g. `ca-eccc-msc`.
    pub centre_id: String,
    /// Location of the dataset definition document.
    pub dataset_config: PathBuf,
    /// Lifetime of duplicate-cache entries, in seconds.
    #[serde(default = "default_cache_expiry")]
    pub cache_expiry_seconds: u64,
    /// Base URL of the global discovery catalogue.
    pub gdc_url: String,
    /// Upper bound for one publish call, in seconds.
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_seconds: u64,
    /// Worker threads used to process one batch (1 = sequential).
    #[serde(default = "default_workers")]
    pub dispatch_workers: usize,
}

fn default_topic_prefix() -> String {
    DEFAULT_TOPIC_PREFIX.to_string()
}

fn default_cache_expiry() -> u64 {
    DEFAULT_CACHE_EXPIRY_SECONDS
}

fn default_publish_timeout() -> u64 {
    DEFAULT_PUBLISH_TIMEOUT_SECONDS
}

fn default_workers() -> usize {
    1
}

impl NodeConfig {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is unset or a value does
    /// not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through an arbitrary key lookup.
    ///
    /// Keys are the full variable names (`MSC_WIS2NODE_BROKER_HOSTNAME`, ...).
    /// Blank values are treated as unset.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required key is missing or a value does
    /// not parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| -> Option<String> {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |name: &str| -> Result<String, ConfigError> {
            get(name).ok_or_else(|| ConfigError::MissingSetting {
                name: format!("{ENV_PREFIX}{name}"),
            })
        };

        let port = match get("BROKER_PORT") {
            Some(v) => parse_setting("BROKER_PORT", &v)?,
            None => DEFAULT_BROKER_PORT,
        };
        let tls = match get("BROKER_TLS") {
            Some(v) => parse_bool("BROKER_TLS", &v)?,
            None => port == DEFAULT_BROKER_PORT,
        };

        let broker = BrokerConfig {
            hostname: require("BROKER_HOSTNAME")?,
            port,
            username: require("BROKER_USERNAME")?,
            password: require("BROKER_PASSWORD")?,
            tls,
            client_id: client_id(),
        };

        let cfg = Self {
            broker,
            topic_prefix: get("TOPIC_PREFIX").unwrap_or_else(default_topic_prefix),
            centre_id: require("CENTRE_ID")?,
            dataset_config: PathBuf::from(require("DATASET_CONFIG")?),
            cache_expiry_seconds: match get("CACHE_EXPIRY_SECONDS") {
                Some(v) => parse_setting("CACHE_EXPIRY_SECONDS", &v)?,
                None => DEFAULT_CACHE_EXPIRY_SECONDS,
            },
            gdc_url: require("WIS2_GDC")?,
            publish_timeout_seconds: match get("PUBLISH_TIMEOUT_SECONDS") {
                Some(v) => parse_setting("PUBLISH_TIMEOUT_SECONDS", &v)?,
                None => DEFAULT_PUBLISH_TIMEOUT_SECONDS,
            },
            dispatch_workers: match get("DISPATCH_WORKERS") {
                Some(v) => parse_setting("DISPATCH_WORKERS", &v)?,
                None => default_workers(),
            },
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSetting` on the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic_prefix.trim_matches('/').is_empty() {
            return Err(invalid("TOPIC_PREFIX", &self.topic_prefix, "must not be empty"));
        }
        if self.centre_id.contains('/') {
            return Err(invalid("CENTRE_ID", &self.centre_id, "must be a single topic level"));
        }
        if self.publish_timeout_seconds == 0 {
            return Err(invalid("PUBLISH_TIMEOUT_SECONDS", "0", "must be positive"));
        }
        if self.dispatch_workers == 0 {
            return Err(invalid("DISPATCH_WORKERS", "0", "must be positive"));
        }
        Ok(())
    }

    /// Topic under which `suffix` is published: `{prefix}/{centre}/{suffix}`.
    #[must_use]
    pub fn qualified_topic(&self, suffix: &str) -> String {
        format!(
            "{}/{}/{}",
            self.topic_prefix.trim_end_matches('/'),
            self.centre_id,
            suffix.trim_start_matches('/')
        )
    }

    /// Duplicate-cache entry lifetime.
    #[must_use]
    pub const fn cache_expiry(&self) -> Duration {
        Duration::from_secs(self.cache_expiry_seconds)
    }

    /// Publish timeout.
    #[must_use]
    pub const fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_seconds)
    }
}

fn invalid(name: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidSetting {
        name: format!("{ENV_PREFIX}{name}"),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_setting<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| invalid(name, value, &e.to_string()))
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(name, value, "expected a boolean")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env() -> HashMap<String, String> {
        [
            ("BROKER_HOSTNAME", "broker.example.org"),
            ("BROKER_USERNAME", "user"),
            ("BROKER_PASSWORD", "secret"),
            ("CENTRE_ID", "ca-eccc-msc"),
            ("DATASET_CONFIG", "/etc/wis2node/datasets.json"),
            ("WIS2_GDC", "https://gdc.example.org/collections/wis2-discovery-metadata/items"),
        ]
        .into_iter()
        .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string()))
        .collect()
    }

    #[test]
    fn defaults_applied() {
        let vars = env();
        let cfg = NodeConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(cfg.broker.port, 8883);
        assert!(cfg.broker.tls);
        assert_eq!(cfg.topic_prefix, "origin/a/wis2");
        assert_eq!(cfg.cache_expiry(), Duration::from_secs(86_400));
        assert_eq!(cfg.dispatch_workers, 1);
        assert!(cfg.broker.client_id.starts_with("msc-wis2node id="));
    }

    #[test]
    fn missing_required_is_reported() {
        let mut vars = env();
        vars.remove("MSC_WIS2NODE_CENTRE_ID");
        let err = NodeConfig::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        match err {
            ConfigError::MissingSetting { name } => assert_eq!(name, "MSC_WIS2NODE_CENTRE_ID"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn blank_value_counts_as_missing() {
        let mut vars = env();
        vars.insert("MSC_WIS2NODE_BROKER_PASSWORD".to_string(), "  ".to_string());
        assert!(NodeConfig::from_lookup(|k| vars.get(k).cloned()).is_err());
    }

    #[test]
    fn plain_port_disables_tls() {
        let mut vars = env();
        vars.insert("MSC_WIS2NODE_BROKER_PORT".to_string(), "1883".to_string());
        let cfg = NodeConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(cfg.broker.port, 1883);
        assert!(!cfg.broker.tls);
    }

    #[test]
    fn bad_port_is_invalid() {
        let mut vars = env();
        vars.insert("MSC_WIS2NODE_BROKER_PORT".to_string(), "eighty".to_string());
        let err = NodeConfig::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSetting { .. }));
    }

    #[test]
    fn qualified_topic_joins_levels() {
        let vars = env();
        let cfg = NodeConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(
            cfg.qualified_topic("data/core/weather/surface-based-observations/synop"),
            "origin/a/wis2/ca-eccc-msc/data/core/weather/surface-based-observations/synop"
        );
    }
}
