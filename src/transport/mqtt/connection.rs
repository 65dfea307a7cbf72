//! Connection state, client errors and broker option building
//!
//! Everything in here is free of network I/O: option building only reads the
//! TLS material referenced by the configuration.

use super::subscriptions::SubscribeError;
use crate::config::{ClientConfig, ConfigError};
use crate::transport::TransportError;
use rumqttc::{MqttOptions, TlsConfiguration, Transport as RumqttcTransport};
use thiserror::Error;
use tracing::warn;

/// Connection state of an MQTT session
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ConnectionState {
    /// Not launched yet, or ended by the caller
    #[default]
    Disconnected,
    /// Attempting to (re)establish the broker connection
    Connecting,
    /// Connected and dispatching messages
    Connected,
    /// Retry attempts exhausted; terminal until launched again
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionState::Failed(_))
    }
}

/// Errors reported to callers of the MQTT session API
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Connection failed after {attempts} attempt(s): {reason}")]
    ConnectionFailed { attempts: u32, reason: String },
    #[error("Subscription failed: {0}")]
    Subscribe(#[from] SubscribeError),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Publishing to {topic} failed")]
    PublishFailed {
        topic: String,
        #[source]
        source: TransportError,
    },
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Session already launched")]
    AlreadyLaunched,
}

/// Build rumqttc options from a validated configuration
pub fn configure_mqtt_options(config: &ClientConfig) -> Result<MqttOptions, ClientError> {
    config.validate()?;

    let mut mqtt_options = MqttOptions::new(&config.client_id, &config.host, config.port);
    mqtt_options.set_keep_alive(config.keepalive());
    mqtt_options.set_clean_session(config.clean_session);

    if let (Some(user), Some(password)) = (&config.user, &config.password) {
        mqtt_options.set_credentials(user, password);
    }

    if config.uses_tls() {
        mqtt_options.set_transport(configure_tls(config)?);
    }

    Ok(mqtt_options)
}

fn configure_tls(config: &ClientConfig) -> Result<RumqttcTransport, ClientError> {
    let read = |path: &std::path::Path| {
        std::fs::read(path).map_err(|e| {
            TransportError::Tls(format!("failed to read {}: {e}", path.display()))
        })
    };

    let client_auth = match (&config.cert_file, &config.key_file) {
        (Some(cert), Some(key)) => Some((read(cert)?, read(key)?)),
        _ => None,
    };

    match &config.ca_cert {
        Some(ca) => Ok(RumqttcTransport::Tls(TlsConfiguration::Simple {
            ca: read(ca)?,
            alpn: None,
            client_auth,
        })),
        None => {
            if client_auth.is_some() {
                warn!("Client certificate ignored: no CA certificate configured, using system roots");
            }
            Ok(RumqttcTransport::tls_with_default_config())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn test_connection_state_default() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert!(ConnectionState::Connected.is_connected());
        assert!(ConnectionState::Failed("x".to_string()).is_failed());
        assert!(!ConnectionState::Connecting.is_connected());
    }

    #[test]
    fn test_configure_mqtt_options_plaintext() {
        let config = ClientConfig::new("localhost", 1883);
        let options = configure_mqtt_options(&config).unwrap();
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert_eq!(options.client_id(), "mqttclient");
    }

    #[test]
    fn test_configure_mqtt_options_rejects_invalid_config() {
        let config = ClientConfig::new("", 1883);
        assert!(matches!(
            configure_mqtt_options(&config),
            Err(ClientError::Config(ConfigError::MissingField("host")))
        ));
    }

    #[test]
    fn test_configure_mqtt_options_missing_ca() {
        let mut config = ClientConfig::new("localhost", 8883);
        config.ca_cert = Some(PathBuf::from("/no/such/ca.crt"));
        assert!(matches!(
            configure_mqtt_options(&config),
            Err(ClientError::Config(ConfigError::CertificateNotFound { .. }))
        ));
    }

    #[test]
    fn test_configure_mqtt_options_with_ca() {
        let mut ca = tempfile::NamedTempFile::new().unwrap();
        writeln!(ca, "-----BEGIN CERTIFICATE-----").unwrap();

        let mut config = ClientConfig::new("localhost", 8883);
        config.ca_cert = Some(ca.path().to_path_buf());

        let options = configure_mqtt_options(&config).unwrap();
        assert!(matches!(options.transport(), RumqttcTransport::Tls(_)));
    }

    #[test]
    fn test_client_error_display() {
        let errors = vec![
            ClientError::ConnectionFailed {
                attempts: 3,
                reason: "refused".to_string(),
            },
            ClientError::NotConnected {
                state: ConnectionState::Connecting,
            },
            ClientError::PublishFailed {
                topic: "a/b".to_string(),
                source: TransportError::Request("closed".to_string()),
            },
            ClientError::AlreadyLaunched,
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
