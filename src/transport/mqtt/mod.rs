//! Resilient MQTT session built on the transport traits
//!
//! This module separates pure decision logic from I/O, the same way for every
//! concern:
//!
//! - [`connection`] - Connection state, client errors and rumqttc option building
//! - [`retry`] - Pure retry and backoff decisions
//! - [`subscriptions`] - Pure subscription bookkeeping per connection epoch
//! - [`message_handler`] - Inbound dispatch to the registered handler
//! - [`rumqttc_transport`] - Transport traits implemented over rumqttc
//! - [`client`] - The background session loop and the caller-facing API
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_subscriber::config::ClientConfig;
//! use mqtt_subscriber::transport::mqtt::MqttClient;
//! use mqtt_subscriber::transport::QoS;
//!
//! # tokio_test::block_on(async {
//! let mut config = ClientConfig::new("localhost", 1883);
//! config.max_retries = Some(3);
//!
//! let mut client = MqttClient::new(config, vec!["sensors/#".to_string()])?;
//! client.set_handler(|topic: &str, payload: &[u8]| {
//!     println!("{topic}: {}", String::from_utf8_lossy(payload));
//!     Ok(())
//! });
//! client.launch().await?;
//! client.publish("sensors/hello", "hi", QoS::AtLeastOnce, false).await?;
//! client.end().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;
pub mod retry;
pub mod rumqttc_transport;
pub mod subscriptions;

// Re-export public types for convenience
pub use client::MqttClient;
pub use connection::{ClientError, ConnectionState};
pub use message_handler::{
    ChannelHandler, Dispatcher, HandlerError, InboundMessage, MessageHandler,
};
pub use retry::{RetryDecision, RetryPolicy};
pub use rumqttc_transport::RumqttcConnector;
pub use subscriptions::{SubscribeError, Subscription, SubscriptionTracker};
