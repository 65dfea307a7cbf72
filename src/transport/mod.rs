//! Transport layer for broker communication
//!
//! The connection state machine never talks to a concrete MQTT library
//! directly. It drives three small traits instead:
//!
//! - [`Connector`] opens a fresh, not yet connected broker session
//! - [`Link`] is the cloneable request side of that session
//! - [`EventSource`] is the receive side, polled by the background loop
//!
//! [`mqtt::rumqttc_transport`] implements them over `rumqttc`; tests use
//! [`crate::testing::MockConnector`].

use bytes::Bytes;
use thiserror::Error;

pub mod mqtt;

pub use rumqttc::QoS;

/// Events surfaced by an [`EventSource`]
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Broker accepted the connection (ConnAck success)
    Connected,
    /// Application message received on a subscribed topic
    Message {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    /// A queued subscribe request went out on the wire with this packet id
    SubscribeSent { pkid: u16 },
    /// Broker answered a subscribe request
    SubAck { pkid: u16, granted: bool },
    /// Broker closed the connection
    Disconnected,
    /// Our DISCONNECT packet was written to the broker
    DisconnectSent,
    /// Keepalive traffic, acks and other infrastructure packets
    Other(String),
}

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Request rejected by client: {0}")]
    Request(String),
    #[error("TLS setup failed: {0}")]
    Tls(String),
}

/// Factory for broker sessions
pub trait Connector: Send + Sync + 'static {
    type Link: Link;
    type Events: EventSource;

    /// Create a new session; the connection handshake happens while polling
    fn open(&self) -> Result<(Self::Link, Self::Events), TransportError>;
}

/// Request handle for an open session
#[async_trait::async_trait]
pub trait Link: Clone + Send + Sync + 'static {
    /// Queue a subscribe request; the broker answer arrives as [`TransportEvent::SubAck`]
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    /// Queue an outbound message
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Request a graceful disconnect
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Receive side of an open session
#[async_trait::async_trait]
pub trait EventSource: Send + 'static {
    /// Wait for the next event; an error means the connection is gone
    async fn poll(&mut self) -> Result<TransportEvent, TransportError>;
}

/// Convert a numeric QoS level (0, 1, 2) into [`QoS`]
pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// Numeric level (0, 1, 2) of a [`QoS`]
pub fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_from_level() {
        assert_eq!(qos_from_level(0), Some(QoS::AtMostOnce));
        assert_eq!(qos_from_level(1), Some(QoS::AtLeastOnce));
        assert_eq!(qos_from_level(2), Some(QoS::ExactlyOnce));
        assert_eq!(qos_from_level(3), None);
    }

    #[test]
    fn test_qos_level_matches_from_level() {
        for level in 0..=2 {
            assert_eq!(qos_level(qos_from_level(level).unwrap()), level);
        }
    }
}
