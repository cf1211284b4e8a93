//! Configuration system for the MQTT session manager
//!
//! The TOML file describes the broker connection and the topics the
//! console bridge uses. [`SessionConfig::resolve`] turns it into the
//! runtime [`ConnectionConfig`] handed to the transport on each connect.

use crate::topic::{validate_topic_filter, validate_topic_name};
use crate::transport::QualityOfService;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Default search locations used by the binary when no `--config` is given
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["mqtt-session.toml", "config/mqtt-session.toml"];

/// Minimum keep-alive accepted by the transport
const MIN_KEEP_ALIVE_SECS: u64 = 5;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    pub mqtt: MqttSection,
    #[serde(default)]
    pub topics: TopicsSection,
}

/// MQTT section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL: mqtt://, tcp://, mqtts:// or ssl://
    pub broker_url: String,
    /// Client identifier presented to the broker
    pub client_id: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Keep-alive interval in seconds (default: 30)
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Time allowed for the broker to acknowledge a connect (default: 60)
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    /// Let the transport retry dropped connections before reporting them lost
    #[serde(default = "default_true")]
    pub automatic_reconnect: bool,
    /// QoS level for publish and subscribe (default: 1)
    #[serde(default = "default_qos")]
    pub qos: u8,
    /// PEM bundle of trusted CAs; platform roots are used when absent
    pub ca_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Topics used by the console bridge
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TopicsSection {
    /// Default topic for plain console input
    pub publish: Option<String>,
    /// Filters subscribed on every connect
    #[serde(default)]
    pub subscribe: Vec<String>,
}

/// Reconnection policy applied by the transport after a connection drops
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: Vec<u64>,
    /// Delay used once the pattern is exhausted
    #[serde(default = "default_sustained_delay")]
    pub sustained_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            sustained_delay_ms: default_sustained_delay(),
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay for the given attempt (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        let millis = self
            .backoff_ms
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay_ms);
        Duration::from_millis(millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_attempts must be greater than 0 or omitted for unlimited"
                    .to_string(),
            ));
        }
        if self.sustained_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.sustained_delay_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_keep_alive() -> u64 {
    30
}

fn default_connection_timeout() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_qos() -> u8 {
    QualityOfService::default().level()
}

fn default_max_attempts() -> Option<u32> {
    Some(5)
}

fn default_backoff_ms() -> Vec<u64> {
    vec![500, 1000, 2000, 5000]
}

fn default_sustained_delay() -> u64 {
    5000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid client ID: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Broker endpoint parsed from the configured URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    pub fn parse(broker_url: &str) -> Result<Self, ConfigError> {
        let url =
            Url::parse(broker_url).map_err(|_| ConfigError::InvalidBrokerUrl(broker_url.into()))?;

        let tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" => true,
            _ => return Err(ConfigError::InvalidBrokerUrl(broker_url.into())),
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::InvalidBrokerUrl(broker_url.into()))?;
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "mqtts" } else { "mqtt" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Broker credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Transport security material
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMaterial {
    /// Plain TCP
    Disabled,
    /// TLS against the platform root store
    PlatformRoots,
    /// TLS against a custom CA bundle (PEM bytes)
    CustomCa(Vec<u8>),
}

/// Fully resolved connection configuration handed to the transport
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub broker: BrokerAddress,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub tls: TlsMaterial,
    pub keep_alive: Duration,
    pub connection_timeout: Duration,
    pub clean_session: bool,
    pub automatic_reconnect: bool,
    pub reconnect: ReconnectConfig,
    pub qos: QualityOfService,
}

impl ConnectionConfig {
    /// Plain-TCP configuration with defaults, mainly for tests and tooling
    pub fn new(broker_url: &str, client_id: &str) -> Result<Self, ConfigError> {
        let broker = BrokerAddress::parse(broker_url)?;
        validate_client_id(client_id)?;
        let tls = if broker.tls {
            TlsMaterial::PlatformRoots
        } else {
            TlsMaterial::Disabled
        };

        Ok(Self {
            broker,
            client_id: client_id.to_string(),
            credentials: None,
            tls,
            keep_alive: Duration::from_secs(default_keep_alive()),
            connection_timeout: Duration::from_secs(default_connection_timeout()),
            clean_session: true,
            automatic_reconnect: true,
            reconnect: ReconnectConfig::default(),
            qos: QualityOfService::default(),
        })
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Locate the first existing default configuration file
    pub fn find_default() -> Option<PathBuf> {
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        BrokerAddress::parse(&self.mqtt.broker_url)?;
        validate_client_id(&self.mqtt.client_id)?;

        if self.mqtt.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(ConfigError::InvalidConfig(format!(
                "keep_alive_secs must be at least {MIN_KEEP_ALIVE_SECS}"
            )));
        }
        if self.mqtt.connection_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "connection_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if QualityOfService::from_level(self.mqtt.qos).is_none() {
            return Err(ConfigError::InvalidConfig(format!(
                "qos must be 0, 1 or 2, got {}",
                self.mqtt.qos
            )));
        }
        self.mqtt.reconnect.validate()?;

        if let Some(topic) = &self.topics.publish {
            validate_topic_name(topic)
                .map_err(|e| ConfigError::InvalidConfig(format!("topics.publish: {e}")))?;
        }
        for filter in &self.topics.subscribe {
            validate_topic_filter(filter)
                .map_err(|e| ConfigError::InvalidConfig(format!("topics.subscribe: {e}")))?;
        }

        Ok(())
    }

    /// Resolve credentials and security material into a [`ConnectionConfig`]
    pub fn resolve(&self) -> Result<ConnectionConfig, ConfigError> {
        self.validate()?;

        let broker = BrokerAddress::parse(&self.mqtt.broker_url)?;
        let tls = match (&self.mqtt.ca_cert_path, broker.tls) {
            (_, false) => TlsMaterial::Disabled,
            (Some(path), true) => TlsMaterial::CustomCa(std::fs::read(path)?),
            (None, true) => TlsMaterial::PlatformRoots,
        };

        Ok(ConnectionConfig {
            broker,
            client_id: self.mqtt.client_id.clone(),
            credentials: self.resolve_credentials()?,
            tls,
            keep_alive: Duration::from_secs(self.mqtt.keep_alive_secs),
            connection_timeout: Duration::from_secs(self.mqtt.connection_timeout_secs),
            clean_session: self.mqtt.clean_session,
            automatic_reconnect: self.mqtt.automatic_reconnect,
            reconnect: self.mqtt.reconnect.clone(),
            qos: QualityOfService::from_level(self.mqtt.qos).unwrap_or_default(),
        })
    }

    /// Username falls back to the client ID when only a password is set,
    /// the convention of brokers that authenticate devices by client ID.
    fn resolve_credentials(&self) -> Result<Option<Credentials>, ConfigError> {
        let username = Self::get_env_var_optional(self.mqtt.username_env.as_ref());
        let password = match &self.mqtt.password_env {
            Some(name) => Some(Self::get_env_var_required(name)?),
            None => None,
        };

        Ok(match (username, password) {
            (None, None) => None,
            (Some(username), password) => Some(Credentials {
                username,
                password: password.unwrap_or_default(),
            }),
            (None, Some(password)) => Some(Credentials {
                username: self.mqtt.client_id.clone(),
                password,
            }),
        })
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
client_id = "test-client"

[topics]
publish = "channels/1/publish"
subscribe = ["channels/1/subscribe/#"]
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Client identifiers must be non-empty and free of whitespace
fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    if client_id.is_empty() || client_id.chars().any(char::is_whitespace) {
        return Err(ConfigError::InvalidClientId(format!(
            "Client ID '{client_id}' must be non-empty and contain no whitespace"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let config = SessionConfig::test_config();
        assert_eq!(config.mqtt.keep_alive_secs, 30);
        assert_eq!(config.mqtt.connection_timeout_secs, 60);
        assert!(config.mqtt.clean_session);
        assert!(config.mqtt.automatic_reconnect);
        assert_eq!(config.mqtt.qos, 1);
        assert_eq!(config.mqtt.reconnect, ReconnectConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_broker_address_schemes() {
        let plain = BrokerAddress::parse("mqtt://localhost").unwrap();
        assert_eq!(plain.port, 1883);
        assert!(!plain.tls);

        let ssl = BrokerAddress::parse("ssl://mqtt3.thingspeak.com:8883").unwrap();
        assert_eq!(ssl.host, "mqtt3.thingspeak.com");
        assert_eq!(ssl.port, 8883);
        assert!(ssl.tls);

        let mqtts = BrokerAddress::parse("mqtts://broker.example").unwrap();
        assert_eq!(mqtts.port, 8883);
        assert_eq!(mqtts.to_string(), "mqtts://broker.example:8883");

        let tcp = BrokerAddress::parse("tcp://10.0.0.2:2883").unwrap();
        assert_eq!(tcp.port, 2883);
    }

    #[test]
    fn test_broker_address_rejects_unknown_scheme() {
        assert!(matches!(
            BrokerAddress::parse("http://localhost:1883"),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));
        assert!(matches!(
            BrokerAddress::parse("not a url"),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_invalid_client_id() {
        assert!(validate_client_id("").is_err());
        assert!(validate_client_id("has space").is_err());
        assert!(validate_client_id("CyYmCjA0NB4qCi0vAB0TBxE").is_ok());
    }

    #[test]
    fn test_keep_alive_too_short() {
        let mut config = SessionConfig::test_config();
        config.mqtt.keep_alive_secs = 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_default_qos_resolves_to_transport_default() {
        let config = SessionConfig::test_config();
        assert_eq!(config.mqtt.qos, QualityOfService::default().level());
        assert_eq!(config.resolve().unwrap().qos, QualityOfService::default());

        let rendered = toml::to_string_pretty(&config).unwrap();
        assert!(rendered.contains("qos = 1"));
    }

    #[test]
    fn test_invalid_qos() {
        let mut config = SessionConfig::test_config();
        config.mqtt.qos = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_subscribe_filter() {
        let mut config = SessionConfig::test_config();
        config.topics.subscribe.push("bad/#/filter".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_wildcard_publish_topic_rejected() {
        let mut config = SessionConfig::test_config();
        config.topics.publish = Some("channels/+/publish".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconnect_backoff_delay() {
        let config = ReconnectConfig::default();
        assert_eq!(config.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(config.backoff_delay(4), Duration::from_millis(5000));
        assert_eq!(config.backoff_delay(5), Duration::from_millis(5000));
        assert_eq!(config.backoff_delay(100), Duration::from_millis(5000));

        let empty = ReconnectConfig {
            max_attempts: None,
            backoff_ms: vec![],
            sustained_delay_ms: 250,
        };
        assert_eq!(empty.backoff_delay(1), Duration::from_millis(250));
    }

    #[test]
    fn test_reconnect_validation() {
        let zero_attempts = ReconnectConfig {
            max_attempts: Some(0),
            ..Default::default()
        };
        assert!(zero_attempts.validate().is_err());

        let zero_delay = ReconnectConfig {
            sustained_delay_ms: 0,
            ..Default::default()
        };
        assert!(zero_delay.validate().is_err());
    }

    #[test]
    fn test_resolve_plain_config() {
        let resolved = SessionConfig::test_config().resolve().unwrap();
        assert_eq!(resolved.broker.host, "localhost");
        assert_eq!(resolved.tls, TlsMaterial::Disabled);
        assert_eq!(resolved.credentials, None);
        assert_eq!(resolved.keep_alive, Duration::from_secs(30));
        assert_eq!(resolved.qos, QualityOfService::AtLeastOnce);
    }

    #[test]
    fn test_resolve_tls_with_platform_roots() {
        let mut config = SessionConfig::test_config();
        config.mqtt.broker_url = "ssl://broker.example:8883".to_string();
        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.tls, TlsMaterial::PlatformRoots);
    }

    #[test]
    fn test_resolve_missing_password_env() {
        let mut config = SessionConfig::test_config();
        config.mqtt.password_env = Some("MQTT_SESSION_TEST_MISSING_PASSWORD".to_string());
        assert!(matches!(
            config.resolve(),
            Err(ConfigError::EnvVarNotFound(_))
        ));
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let credentials = Credentials {
            username: "device".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{credentials:?}");
        assert!(rendered.contains("device"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_connection_config_new() {
        let config = ConnectionConfig::new("mqtts://broker.example", "client-1").unwrap();
        assert_eq!(config.tls, TlsMaterial::PlatformRoots);
        assert_eq!(config.client_id, "client-1");
        assert!(ConnectionConfig::new("mqtt://broker.example", "").is_err());
    }
}
