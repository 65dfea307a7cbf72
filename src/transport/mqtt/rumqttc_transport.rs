//! Transport traits implemented over rumqttc
//!
//! Each [`Connector::open`] call builds a brand new `AsyncClient`/`EventLoop`
//! pair, so a reconnect never reuses state from a broken connection.

use super::connection::{configure_mqtt_options, ClientError};
use crate::config::ClientConfig;
use crate::transport::{Connector, EventSource, Link, QoS, TransportError, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions,
    Outgoing, SubscribeReasonCode,
};

/// Request channel capacity between the client handle and its event loop
pub const REQUEST_CAPACITY: usize = 10;

/// Opens rumqttc sessions from a fixed set of options
#[derive(Clone)]
pub struct RumqttcConnector {
    options: MqttOptions,
    capacity: usize,
}

impl RumqttcConnector {
    /// Validate the configuration and prepare connection options
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        Ok(Self {
            options: configure_mqtt_options(config)?,
            capacity: REQUEST_CAPACITY,
        })
    }

    /// Size the request channel; subscribe requests for every topic are
    /// queued before the event loop is polled again, so it must hold them all
    pub fn with_request_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn options(&self) -> &MqttOptions {
        &self.options
    }
}

impl Connector for RumqttcConnector {
    type Link = RumqttcLink;
    type Events = RumqttcEvents;

    fn open(&self) -> Result<(Self::Link, Self::Events), TransportError> {
        let (client, event_loop) = AsyncClient::new(self.options.clone(), self.capacity);
        Ok((RumqttcLink { client }, RumqttcEvents { event_loop }))
    }
}

/// Request side of a rumqttc session
#[derive(Clone)]
pub struct RumqttcLink {
    client: AsyncClient,
}

#[async_trait]
impl Link for RumqttcLink {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.client
            .subscribe(topic, qos)
            .await
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.client
            .publish_bytes(topic, qos, retain, payload)
            .await
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    /// Queue a DISCONNECT; it reaches the broker once the event loop is
    /// polled and reports [`TransportEvent::DisconnectSent`]
    async fn disconnect(&self) -> Result<(), TransportError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))
    }
}

/// Receive side of a rumqttc session
pub struct RumqttcEvents {
    event_loop: EventLoop,
}

#[async_trait]
impl EventSource for RumqttcEvents {
    async fn poll(&mut self) -> Result<TransportEvent, TransportError> {
        match self.event_loop.poll().await {
            Ok(event) => Ok(route_event(&event)),
            Err(ConnectionError::ConnectionRefused(code)) => {
                Err(TransportError::ConnectionRefused(format!("{code:?}")))
            }
            Err(e) => Err(TransportError::ConnectionLost(e.to_string())),
        }
    }
}

/// Map a rumqttc event onto a transport event (pure function)
pub fn route_event(event: &Event) -> TransportEvent {
    match event {
        Event::Incoming(Incoming::ConnAck(ack)) if ack.code == ConnectReturnCode::Success => {
            TransportEvent::Connected
        }
        Event::Incoming(Incoming::Publish(publish)) => TransportEvent::Message {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retain: publish.retain,
        },
        Event::Incoming(Incoming::SubAck(suback)) => TransportEvent::SubAck {
            pkid: suback.pkid,
            granted: suback
                .return_codes
                .iter()
                .all(|code| matches!(code, SubscribeReasonCode::Success(_))),
        },
        Event::Incoming(Incoming::Disconnect) => TransportEvent::Disconnected,
        Event::Outgoing(Outgoing::Subscribe(pkid)) => TransportEvent::SubscribeSent { pkid: *pkid },
        Event::Outgoing(Outgoing::Disconnect) => TransportEvent::DisconnectSent,
        Event::Incoming(other) => TransportEvent::Other(format!("{other:?}")),
        Event::Outgoing(other) => TransportEvent::Other(format!("{other:?}")),
    }
}
