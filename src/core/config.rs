use std::env;
use std::time::Duration;

use url::Url;

use crate::features::ingestion::services::{CommitStrategy, ThrottleKeyStrategy};
use crate::shared::constants::{
    CLIENT_ID_PREFIX, DEFAULT_MQTTS_PORT, DEFAULT_MQTT_PORT, DEFAULT_THROTTLE_MAX_KEYS,
    MIN_MQTT_KEEP_ALIVE_SECS,
};
use crate::shared::validation::SQL_IDENTIFIER_REGEX;

/// Variable lookup used while parsing configuration
///
/// `Config::from_env` reads the process environment; tests pass a map.
pub type VarLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub database: DatabaseConfig,
    pub sink: SinkConfig,
    pub throttle: ThrottleConfig,
    pub lifecycle: LifecycleConfig,
}

/// Broker connection and subscription settings
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub username: String,
    pub password: String,
    pub topic_filter: String,
    pub client_id: String,
    pub keep_alive: Duration,
    pub qos: u8,
    /// Capacity of the queue between the transport and the pipeline
    pub channel_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

/// Where accepted records land
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub schema: String,
    pub table: String,
}

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Minimum time between two saved messages for the same key; zero disables throttling
    pub min_interval: Duration,
    pub key_strategy: ThrottleKeyStrategy,
    pub commit_strategy: CommitStrategy,
    pub max_keys: usize,
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        // Load .env file if exists, ignore if not found (optional for production)
        if let Err(e) = dotenvy::dotenv() {
            if !e.to_string().contains("not found") {
                eprintln!("Warning: Error loading .env file: {}", e);
            }
        }

        Self::from_vars(&|key| env::var(key).ok())
    }

    pub fn from_vars(vars: VarLookup<'_>) -> Result<Self, String> {
        Ok(Config {
            mqtt: MqttConfig::from_vars(vars)?,
            database: DatabaseConfig::from_vars(vars)?,
            sink: SinkConfig::from_vars(vars)?,
            throttle: ThrottleConfig::from_vars(vars)?,
            lifecycle: LifecycleConfig::from_vars(vars)?,
        })
    }
}

fn required(vars: VarLookup<'_>, key: &str) -> Result<String, String> {
    vars(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| format!("{} environment variable is required", key))
}

fn parse_or<T: std::str::FromStr>(vars: VarLookup<'_>, key: &str, default: T) -> Result<T, String> {
    match vars(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| format!("{} must be a valid number", key)),
        None => Ok(default),
    }
}

impl MqttConfig {
    const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;
    const DEFAULT_QOS: u8 = 1;
    const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn from_vars(vars: VarLookup<'_>) -> Result<Self, String> {
        let broker_url = required(vars, "MQTT_BROKER_URL")?;
        let (host, port, use_tls) = parse_broker_url(&broker_url)?;

        let username = required(vars, "MQTT_USERNAME")?;
        let password = required(vars, "MQTT_PASSWORD")?;
        let topic_filter = required(vars, "MQTT_TOPIC")?;

        let client_id = vars("MQTT_CLIENT_ID")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| {
                let suffix = uuid::Uuid::new_v4().simple().to_string();
                format!("{}-{}", CLIENT_ID_PREFIX, &suffix[..8])
            });

        let keep_alive_secs = parse_or(vars, "MQTT_KEEP_ALIVE_SECS", Self::DEFAULT_KEEP_ALIVE_SECS)?;
        if keep_alive_secs < MIN_MQTT_KEEP_ALIVE_SECS {
            return Err(format!(
                "MQTT_KEEP_ALIVE_SECS must be at least {}",
                MIN_MQTT_KEEP_ALIVE_SECS
            ));
        }

        let qos = parse_or(vars, "MQTT_QOS", Self::DEFAULT_QOS)?;
        if qos > 2 {
            return Err("MQTT_QOS must be 0, 1 or 2".to_string());
        }

        let channel_capacity = parse_or(
            vars,
            "INGEST_CHANNEL_CAPACITY",
            Self::DEFAULT_CHANNEL_CAPACITY,
        )?;
        if channel_capacity == 0 {
            return Err("INGEST_CHANNEL_CAPACITY must be greater than zero".to_string());
        }

        Ok(Self {
            host,
            port,
            use_tls,
            username,
            password,
            topic_filter,
            client_id,
            keep_alive: Duration::from_secs(keep_alive_secs),
            qos,
            channel_capacity,
        })
    }

    /// Broker address without credentials, for logs
    pub fn broker_address(&self) -> String {
        let scheme = if self.use_tls { "mqtts" } else { "mqtt" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Split a broker URL into host, port and whether TLS is required
fn parse_broker_url(raw: &str) -> Result<(String, u16, bool), String> {
    let url = Url::parse(raw).map_err(|e| format!("Invalid MQTT_BROKER_URL: {}", e))?;

    let use_tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        other => {
            return Err(format!(
                "Invalid MQTT_BROKER_URL: unsupported scheme '{}' (expected mqtt or mqtts)",
                other
            ))
        }
    };

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| "Invalid MQTT_BROKER_URL: missing host".to_string())?
        .to_string();

    let port = url.port().unwrap_or(if use_tls {
        DEFAULT_MQTTS_PORT
    } else {
        DEFAULT_MQTT_PORT
    });

    Ok((host, port, use_tls))
}

impl DatabaseConfig {
    // Default values for database connection pool (conservative defaults for small-medium apps)
    const DEFAULT_MAX_CONNECTIONS: u32 = 10;
    const DEFAULT_MIN_CONNECTIONS: u32 = 1;
    const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 5;
    const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600; // 10 minutes
    const DEFAULT_MAX_LIFETIME_SECS: u64 = 1800; // 30 minutes

    pub fn from_vars(vars: VarLookup<'_>) -> Result<Self, String> {
        let url = vars("DATABASE_URL")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "DATABASE_URL must be set".to_string())?;

        Ok(Self {
            url,
            max_connections: parse_or(vars, "DB_MAX_CONNECTIONS", Self::DEFAULT_MAX_CONNECTIONS)?,
            min_connections: parse_or(vars, "DB_MIN_CONNECTIONS", Self::DEFAULT_MIN_CONNECTIONS)?,
            acquire_timeout_secs: parse_or(
                vars,
                "DB_ACQUIRE_TIMEOUT_SECS",
                Self::DEFAULT_ACQUIRE_TIMEOUT_SECS,
            )?,
            idle_timeout_secs: parse_or(
                vars,
                "DB_IDLE_TIMEOUT_SECS",
                Self::DEFAULT_IDLE_TIMEOUT_SECS,
            )?,
            max_lifetime_secs: parse_or(
                vars,
                "DB_MAX_LIFETIME_SECS",
                Self::DEFAULT_MAX_LIFETIME_SECS,
            )?,
        })
    }
}

impl SinkConfig {
    pub fn from_vars(vars: VarLookup<'_>) -> Result<Self, String> {
        let schema = required(vars, "SINK_SCHEMA")?;
        let table = required(vars, "SINK_TABLE")?;

        for (key, value) in [("SINK_SCHEMA", &schema), ("SINK_TABLE", &table)] {
            if !SQL_IDENTIFIER_REGEX.is_match(value) {
                return Err(format!(
                    "{} must be a plain identifier (letters, digits, underscores; max 63 chars)",
                    key
                ));
            }
        }

        Ok(Self { schema, table })
    }
}

impl ThrottleConfig {
    pub fn from_vars(vars: VarLookup<'_>) -> Result<Self, String> {
        let min_interval = parse_min_interval(&required(vars, "MIN_SAVE_INTERVAL_SECS")?)?;

        let key_strategy = match vars("THROTTLE_KEY") {
            Some(raw) => raw
                .parse::<ThrottleKeyStrategy>()
                .map_err(|e| format!("Invalid THROTTLE_KEY: {}", e))?,
            None => ThrottleKeyStrategy::Topic,
        };

        let commit_strategy = match vars("THROTTLE_COMMIT") {
            Some(raw) => raw
                .parse::<CommitStrategy>()
                .map_err(|e| format!("Invalid THROTTLE_COMMIT: {}", e))?,
            None => CommitStrategy::BeforeWrite,
        };

        let max_keys = parse_or(vars, "THROTTLE_MAX_KEYS", DEFAULT_THROTTLE_MAX_KEYS)?;
        if max_keys == 0 {
            return Err("THROTTLE_MAX_KEYS must be greater than zero".to_string());
        }

        Ok(Self {
            min_interval,
            key_strategy,
            commit_strategy,
            max_keys,
        })
    }
}

/// Parse the minimum save interval in (possibly fractional) seconds
fn parse_min_interval(raw: &str) -> Result<Duration, String> {
    let secs = raw
        .trim()
        .parse::<f64>()
        .map_err(|_| "MIN_SAVE_INTERVAL_SECS must be a number of seconds".to_string())?;

    if !secs.is_finite() || secs < 0.0 {
        return Err("MIN_SAVE_INTERVAL_SECS must be a non-negative finite number".to_string());
    }

    Duration::try_from_secs_f64(secs)
        .map_err(|e| format!("MIN_SAVE_INTERVAL_SECS is out of range: {}", e))
}

impl LifecycleConfig {
    const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

    pub fn from_vars(vars: VarLookup<'_>) -> Result<Self, String> {
        let grace_secs = parse_or(
            vars,
            "SHUTDOWN_GRACE_SECS",
            Self::DEFAULT_SHUTDOWN_GRACE_SECS,
        )?;

        Ok(Self {
            shutdown_grace: Duration::from_secs(grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_vars() -> HashMap<&'static str, String> {
        [
            ("MQTT_BROKER_URL", "mqtt://broker.local"),
            ("MQTT_USERNAME", "bridge"),
            ("MQTT_PASSWORD", "secret"),
            ("MQTT_TOPIC", "sensor/#"),
            ("DATABASE_URL", "postgres://localhost/telemetry"),
            ("SINK_SCHEMA", "telemetry"),
            ("SINK_TABLE", "readings"),
            ("MIN_SAVE_INTERVAL_SECS", "60"),
        ]
        .into_iter()
        .map(|(k, v)| (k, v.to_string()))
        .collect()
    }

    fn load(vars: &HashMap<&'static str, String>) -> Result<Config, String> {
        Config::from_vars(&|key| vars.get(key).cloned())
    }

    #[test]
    fn test_loads_with_defaults() {
        let config = load(&base_vars()).unwrap();

        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1883);
        assert!(!config.mqtt.use_tls);
        assert_eq!(config.mqtt.qos, 1);
        assert!(config.mqtt.client_id.starts_with("telemetry-bridge-"));
        assert_eq!(config.throttle.min_interval, Duration::from_secs(60));
        assert_eq!(config.throttle.key_strategy, ThrottleKeyStrategy::Topic);
        assert_eq!(config.throttle.commit_strategy, CommitStrategy::BeforeWrite);
        assert_eq!(config.throttle.max_keys, DEFAULT_THROTTLE_MAX_KEYS);
        assert_eq!(config.lifecycle.shutdown_grace, Duration::from_secs(10));
        assert_eq!(config.database.max_connections, 10);
    }

    #[test]
    fn test_each_required_variable_is_enforced() {
        for key in [
            "MQTT_BROKER_URL",
            "MQTT_USERNAME",
            "MQTT_PASSWORD",
            "MQTT_TOPIC",
            "DATABASE_URL",
            "SINK_SCHEMA",
            "SINK_TABLE",
            "MIN_SAVE_INTERVAL_SECS",
        ] {
            let mut vars = base_vars();
            vars.remove(key);
            let err = load(&vars).unwrap_err();
            assert!(err.contains(key), "error for {} was: {}", key, err);
        }
    }

    #[test]
    fn test_min_interval_parsing() {
        assert_eq!(parse_min_interval("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_min_interval("1.5").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_min_interval(" 60 ").unwrap(), Duration::from_secs(60));

        assert!(parse_min_interval("-1").is_err());
        assert!(parse_min_interval("NaN").is_err());
        assert!(parse_min_interval("inf").is_err());
        assert!(parse_min_interval("1e300").is_err());
        assert!(parse_min_interval("sixty").is_err());
    }

    #[test]
    fn test_broker_url_variants() {
        assert_eq!(
            parse_broker_url("mqtts://broker.example.com").unwrap(),
            ("broker.example.com".to_string(), 8883, true)
        );
        assert_eq!(
            parse_broker_url("mqtt://10.0.0.5:1884").unwrap(),
            ("10.0.0.5".to_string(), 1884, false)
        );
        assert!(parse_broker_url("http://broker.example.com").is_err());
        assert!(parse_broker_url("not a url").is_err());
    }

    #[test]
    fn test_rejects_invalid_sink_identifiers() {
        let mut vars = base_vars();
        vars.insert("SINK_TABLE", "readings; DROP TABLE x".to_string());
        assert!(load(&vars).unwrap_err().contains("SINK_TABLE"));
    }

    #[test]
    fn test_optional_throttle_settings() {
        let mut vars = base_vars();
        vars.insert("THROTTLE_KEY", "payload:device_id".to_string());
        vars.insert("THROTTLE_COMMIT", "after_write".to_string());
        vars.insert("THROTTLE_MAX_KEYS", "500".to_string());
        let config = load(&vars).unwrap();

        assert_eq!(
            config.throttle.key_strategy,
            ThrottleKeyStrategy::PayloadField("device_id".to_string())
        );
        assert_eq!(config.throttle.commit_strategy, CommitStrategy::AfterWrite);
        assert_eq!(config.throttle.max_keys, 500);

        vars.insert("THROTTLE_MAX_KEYS", "0".to_string());
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_mqtt_settings() {
        let mut vars = base_vars();
        vars.insert("MQTT_QOS", "3".to_string());
        assert!(load(&vars).unwrap_err().contains("MQTT_QOS"));

        let mut vars = base_vars();
        vars.insert("MQTT_KEEP_ALIVE_SECS", "1".to_string());
        assert!(load(&vars).unwrap_err().contains("MQTT_KEEP_ALIVE_SECS"));
    }
}
