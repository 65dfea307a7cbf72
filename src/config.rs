//! Broker connection configuration and topic list loading
//!
//! Configuration files come in two flavours: TOML (any extension other than
//! `.json`) and the legacy JSON layout with upper-case keys (`HOST`, `PORT`,
//! `CLIENTID`, `USER`, `PASS`, `CA_CERT_FILE`, `CERT_FILE`, `CERT_KEY_FILE`,
//! `KEEPALIVE`). Both deserialize into the same [`ClientConfig`].

use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Broker hostname or IP address
    #[serde(default, alias = "HOST")]
    pub host: String,
    /// Broker TCP port
    #[serde(default, alias = "PORT")]
    pub port: u16,
    /// MQTT client identifier
    #[serde(
        default = "default_client_id",
        alias = "CLIENTID",
        deserialize_with = "client_id_or_default"
    )]
    pub client_id: String,
    /// Username; must be given together with `password`
    #[serde(default, alias = "USER", deserialize_with = "non_empty")]
    pub user: Option<String>,
    /// Password; must be given together with `user`
    #[serde(default, alias = "PASS", deserialize_with = "non_empty")]
    pub password: Option<String>,
    /// CA certificate (PEM) used to verify the broker
    #[serde(default, alias = "CA_CERT_FILE", deserialize_with = "non_empty_path")]
    pub ca_cert: Option<PathBuf>,
    /// Client certificate (PEM); requires `key_file`
    #[serde(default, alias = "CERT_FILE", deserialize_with = "non_empty_path")]
    pub cert_file: Option<PathBuf>,
    /// Client private key (PEM); requires `cert_file`
    #[serde(default, alias = "CERT_KEY_FILE", deserialize_with = "non_empty_path")]
    pub key_file: Option<PathBuf>,
    /// Keepalive interval in seconds (default: 60)
    #[serde(default = "default_keepalive", alias = "KEEPALIVE")]
    pub keepalive: u64,
    /// Connection attempts before giving up (None = unlimited)
    #[serde(default, alias = "MAX_RETRIES")]
    pub max_retries: Option<u32>,
    /// Delay between connection attempts in seconds (default: 5)
    #[serde(default = "default_retry_interval", alias = "RETRY_INTERVAL")]
    pub retry_interval_seconds: u64,
    /// Upper bound for exponential reconnect backoff; fixed interval when absent
    #[serde(default)]
    pub max_retry_interval_seconds: Option<u64>,
    /// Time allowed for a single connection attempt to be acknowledged
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    /// QoS level used for topic subscriptions (0, 1 or 2)
    #[serde(default = "default_subscribe_qos")]
    pub subscribe_qos: u8,
    /// Start every connection with a clean session
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
}

fn default_client_id() -> String {
    "mqttclient".to_string()
}

fn default_keepalive() -> u64 {
    60
}

fn default_retry_interval() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_subscribe_qos() -> u8 {
    2
}

fn default_clean_session() -> bool {
    true
}

/// Empty strings in config files mean "not set"
fn non_empty<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

fn non_empty_path<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(non_empty(deserializer)?.map(PathBuf::from))
}

fn client_id_or_default<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(non_empty(deserializer)?.unwrap_or_else(default_client_id))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("Missing required setting: {0}")]
    MissingField(&'static str),
    #[error("{kind} not found: {}", path.display())]
    CertificateNotFound { kind: &'static str, path: PathBuf },
    #[error("No topics found in file {}", path.display())]
    NoTopics { path: PathBuf },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Build a plaintext, unauthenticated configuration with defaults
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: default_client_id(),
            user: None,
            password: None,
            ca_cert: None,
            cert_file: None,
            key_file: None,
            keepalive: default_keepalive(),
            max_retries: None,
            retry_interval_seconds: default_retry_interval(),
            max_retry_interval_seconds: None,
            connect_timeout_seconds: default_connect_timeout(),
            subscribe_qos: default_subscribe_qos(),
            clean_session: default_clean_session(),
        }
    }

    /// Load and validate configuration from a JSON or TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let config: ClientConfig = if is_json {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };

        config.validate()?;
        Ok(config)
    }

    /// Check every setting before any network I/O is attempted
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingField("host"));
        }
        if self.port == 0 {
            return Err(ConfigError::MissingField("port"));
        }

        match (&self.user, &self.password) {
            (Some(_), None) => {
                return Err(ConfigError::InvalidConfig(
                    "user is set but password is missing".to_string(),
                ))
            }
            (None, Some(_)) => {
                return Err(ConfigError::InvalidConfig(
                    "password is set but user is missing".to_string(),
                ))
            }
            _ => {}
        }

        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err(ConfigError::InvalidConfig(
                "cert_file and key_file must be given together".to_string(),
            ));
        }

        let tls_files = [
            ("CA certificate", &self.ca_cert),
            ("Client certificate", &self.cert_file),
            ("Client key", &self.key_file),
        ];
        for (kind, path) in tls_files {
            if let Some(path) = path {
                if !path.is_file() {
                    return Err(ConfigError::CertificateNotFound {
                        kind,
                        path: path.clone(),
                    });
                }
            }
        }

        if self.keepalive == 0 {
            return Err(ConfigError::InvalidConfig(
                "keepalive must be greater than 0".to_string(),
            ));
        }
        if self.max_retries == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "max_retries must be greater than 0 or unset for unlimited".to_string(),
            ));
        }
        if self.subscribe_qos > 2 {
            return Err(ConfigError::InvalidConfig(format!(
                "subscribe_qos must be 0, 1 or 2 (got {})",
                self.subscribe_qos
            )));
        }
        if let Some(max) = self.max_retry_interval_seconds {
            if max < self.retry_interval_seconds {
                return Err(ConfigError::InvalidConfig(
                    "max_retry_interval_seconds must not be below retry_interval_seconds"
                        .to_string(),
                ));
            }
        }

        Ok(())
    }

    /// True when any TLS material is configured
    pub fn uses_tls(&self) -> bool {
        self.ca_cert.is_some() || self.cert_file.is_some() || self.key_file.is_some()
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Copy of the configuration that is safe to print or log
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.password.is_some() {
            copy.password = Some("***".to_string());
        }
        copy
    }
}

/// Load the list of topics to subscribe to, one per line
///
/// Blank lines are skipped, as are comment lines starting with `#` other than
/// the bare `#` wildcard. An empty list is an error.
pub fn load_topics(path: &Path) -> Result<Vec<String>, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let topics = parse_topics(&content);

    if topics.is_empty() {
        return Err(ConfigError::NoTopics {
            path: path.to_path_buf(),
        });
    }

    Ok(topics)
}

fn parse_topics(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.trim_end_matches('\r').trim())
        .filter(|line| !line.is_empty() && !is_comment(line))
        .map(str::to_string)
        .collect()
}

/// `#` alone is the multi-level wildcard; any other line led by `#` cannot be
/// a valid topic filter and is a comment
fn is_comment(line: &str) -> bool {
    line.starts_with('#') && line != "#"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_config() {
        let toml_content = r#"
host = "broker.local"
port = 1883
client_id = "sensor-hub"
user = "ada"
password = "secret"
keepalive = 30
max_retries = 3
retry_interval_seconds = 1
"#;

        let config: ClientConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.host, "broker.local");
        assert_eq!(config.port, 1883);
        assert_eq!(config.client_id, "sensor-hub");
        assert_eq!(config.user.as_deref(), Some("ada"));
        assert_eq!(config.keepalive, 30);
        assert_eq!(config.max_retries, Some(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_legacy_json_keys() {
        let json_content = r#"{
            "CLIENTID": "",
            "HOST": "10.0.0.5",
            "PORT": 8883,
            "USER": "",
            "PASS": "",
            "CA_CERT_FILE": "",
            "CERT_FILE": "",
            "CERT_KEY_FILE": "",
            "KEEPALIVE": 45
        }"#;

        let config: ClientConfig = serde_json::from_str(json_content).unwrap();
        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.port, 8883);
        assert_eq!(config.client_id, "mqttclient");
        assert_eq!(config.user, None);
        assert_eq!(config.password, None);
        assert!(!config.uses_tls());
        assert_eq!(config.keepalive, 45);
    }

    #[test]
    fn test_minimal_defaults() {
        let config: ClientConfig = toml::from_str("host = \"h\"\nport = 1\n").unwrap();
        assert_eq!(config.client_id, "mqttclient");
        assert_eq!(config.keepalive, 60);
        assert_eq!(config.max_retries, None);
        assert_eq!(config.retry_interval_seconds, 5);
        assert_eq!(config.subscribe_qos, 2);
        assert!(config.clean_session);
        assert_eq!(config, ClientConfig::new("h", 1));
    }

    #[test]
    fn test_missing_host_and_port() {
        let config = ClientConfig::new("", 1883);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("host"))
        ));

        let config = ClientConfig::new("localhost", 0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("port"))
        ));
    }

    #[test]
    fn test_credentials_must_be_paired() {
        let mut config = ClientConfig::new("localhost", 1883);
        config.user = Some("ada".to_string());
        assert!(config.validate().is_err());

        config.password = Some("pw".to_string());
        assert!(config.validate().is_ok());

        config.user = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_certificate_file() {
        let mut config = ClientConfig::new("localhost", 8883);
        config.ca_cert = Some(PathBuf::from("/definitely/not/here/ca.pem"));

        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::CertificateNotFound {
                kind: "CA certificate",
                ..
            }
        ));
        assert!(err.to_string().contains("ca.pem"));
    }

    #[test]
    fn test_client_cert_requires_key() {
        let cert = tempfile::NamedTempFile::new().unwrap();
        let mut config = ClientConfig::new("localhost", 8883);
        config.cert_file = Some(cert.path().to_path_buf());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));

        let key = tempfile::NamedTempFile::new().unwrap();
        config.key_file = Some(key.path().to_path_buf());
        assert!(config.validate().is_ok());
        assert!(config.uses_tls());
    }

    #[test]
    fn test_zero_max_retries_rejected() {
        let mut config = ClientConfig::new("localhost", 1883);
        config.max_retries = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redacted_hides_password() {
        let mut config = ClientConfig::new("localhost", 1883);
        config.user = Some("ada".to_string());
        config.password = Some("hunter2".to_string());

        let shown = config.redacted();
        assert_eq!(shown.password.as_deref(), Some("***"));
        assert_eq!(shown.user.as_deref(), Some("ada"));
    }

    #[test]
    fn test_parse_topics() {
        let topics = parse_topics("a/b\r\n\r\n# comment\nc/d\n  \n");
        assert_eq!(topics, vec!["a/b", "c/d"]);
    }

    #[test]
    fn test_parse_topics_keeps_wildcards() {
        assert_eq!(parse_topics("#\n"), vec!["#"]);
        assert_eq!(parse_topics("sensors/#\n#\n#comment\n"), vec!["sensors/#", "#"]);
    }
}
