//! Mock implementations for testing
//!
//! [`MockConnector`] is an in-memory broker for the transport traits. Clone it
//! before handing it to a client: every clone shares the same broker state, so
//! the test keeps a handle for scripting failures and inspecting traffic.

use crate::transport::{Connector, EventSource, Link, QoS, TransportError, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

type EventSender = mpsc::UnboundedSender<Result<TransportEvent, TransportError>>;

/// A message handed to [`Link::publish`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    attempts: u32,
    refuse_all: bool,
    refuse_remaining: u32,
    rejected_topics: HashSet<String>,
    hold_subacks: bool,
    held_subacks: Vec<(u16, bool)>,
    subscribe_requests: Vec<String>,
    published: Vec<PublishedMessage>,
    disconnects_sent: u32,
    next_pkid: u16,
    current: Option<EventSender>,
}

impl BrokerState {
    fn next_pkid(&mut self) -> u16 {
        self.next_pkid = self.next_pkid.wrapping_add(1).max(1);
        self.next_pkid
    }
}

/// Scriptable in-memory broker
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<BrokerState>>,
}

impl MockConnector {
    /// A broker that accepts every connection and grants every subscription
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that refuses every connection attempt
    pub fn unreachable() -> Self {
        let mock = Self::new();
        mock.lock().refuse_all = true;
        mock
    }

    /// A broker that refuses the first `failures` connection attempts
    pub fn failing_first(failures: u32) -> Self {
        let mock = Self::new();
        mock.lock().refuse_remaining = failures;
        mock
    }

    /// Switch refusal of every future connection attempt on or off
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_all = refuse;
    }

    /// Refuse subscriptions to `topic`
    pub fn reject_topic(&self, topic: &str) -> &Self {
        self.lock().rejected_topics.insert(topic.to_string());
        self
    }

    /// Stop answering subscribe requests until [`Self::release_subacks`]
    pub fn hold_subacks(&self) -> &Self {
        self.lock().hold_subacks = true;
        self
    }

    /// Send every held subscribe acknowledgment and answer new requests again
    pub fn release_subacks(&self) {
        let mut state = self.lock();
        state.hold_subacks = false;
        let held = std::mem::take(&mut state.held_subacks);
        if let Some(sender) = &state.current {
            for (pkid, granted) in held {
                let _ = sender.send(Ok(TransportEvent::SubAck { pkid, granted }));
            }
        }
    }

    pub fn connection_attempts(&self) -> u32 {
        self.lock().attempts
    }

    /// Every subscribe request in the order it was made, across connections
    pub fn subscribe_requests(&self) -> Vec<String> {
        self.lock().subscribe_requests.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().current.is_some()
    }

    /// DISCONNECT packets the client actually flushed by polling its events
    pub fn disconnects_sent(&self) -> u32 {
        self.lock().disconnects_sent
    }

    /// Deliver an inbound message on the live connection
    ///
    /// Returns false when no connection is open.
    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        let state = self.lock();
        let Some(sender) = &state.current else {
            return false;
        };
        sender
            .send(Ok(TransportEvent::Message {
                topic: topic.to_string(),
                payload: payload.into(),
                qos: QoS::AtLeastOnce,
                retain: false,
            }))
            .is_ok()
    }

    /// Break the live connection as a network failure would
    pub fn drop_connection(&self) -> bool {
        let Some(sender) = self.lock().current.take() else {
            return false;
        };
        sender
            .send(Err(TransportError::ConnectionLost(
                "connection reset by peer".to_string(),
            )))
            .is_ok()
    }

    /// Close the live connection as a broker-initiated disconnect
    pub fn disconnect_client(&self) -> bool {
        let Some(sender) = self.lock().current.take() else {
            return false;
        };
        sender.send(Ok(TransportEvent::Disconnected)).is_ok()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A panicking test thread must not hide the broker state from others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Connector for MockConnector {
    type Link = MockLink;
    type Events = MockEvents;

    fn open(&self) -> Result<(Self::Link, Self::Events), TransportError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.attempts += 1;

        let refused = if state.refuse_all {
            true
        } else if state.refuse_remaining > 0 {
            state.refuse_remaining -= 1;
            true
        } else {
            false
        };

        if refused {
            let _ = sender.send(Err(TransportError::ConnectionRefused(
                "broker unreachable".to_string(),
            )));
        } else {
            let _ = sender.send(Ok(TransportEvent::Connected));
            state.current = Some(sender.clone());
        }

        let link = MockLink {
            state: self.state.clone(),
            sender,
        };
        let events = MockEvents {
            state: self.state.clone(),
            receiver,
        };
        Ok((link, events))
    }
}

/// Request side of a mock connection
#[derive(Debug, Clone)]
pub struct MockLink {
    state: Arc<Mutex<BrokerState>>,
    sender: EventSender,
}

impl MockLink {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_live(&self, state: &BrokerState) -> bool {
        state
            .current
            .as_ref()
            .is_some_and(|current| current.same_channel(&self.sender))
    }
}

#[async_trait]
impl Link for MockLink {
    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !self.is_live(&state) {
            return Err(TransportError::Request("connection closed".to_string()));
        }

        state.subscribe_requests.push(topic.to_string());
        let pkid = state.next_pkid();
        let granted = !state.rejected_topics.contains(topic);

        let _ = self.sender.send(Ok(TransportEvent::SubscribeSent { pkid }));
        if state.hold_subacks {
            state.held_subacks.push((pkid, granted));
        } else {
            let _ = self.sender.send(Ok(TransportEvent::SubAck { pkid, granted }));
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !self.is_live(&state) {
            return Err(TransportError::Request("connection closed".to_string()));
        }

        state.published.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        if self.is_live(&state) {
            let _ = self.sender.send(Ok(TransportEvent::DisconnectSent));
            state.current = None;
        }
        Ok(())
    }
}

/// Receive side of a mock connection
#[derive(Debug)]
pub struct MockEvents {
    state: Arc<Mutex<BrokerState>>,
    receiver: mpsc::UnboundedReceiver<Result<TransportEvent, TransportError>>,
}

#[async_trait]
impl EventSource for MockEvents {
    async fn poll(&mut self) -> Result<TransportEvent, TransportError> {
        match self.receiver.recv().await {
            Some(Ok(TransportEvent::DisconnectSent)) => {
                self.state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .disconnects_sent += 1;
                Ok(TransportEvent::DisconnectSent)
            }
            Some(event) => event,
            None => Err(TransportError::ConnectionLost("channel closed".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_yields_connected() {
        let mock = MockConnector::new();
        let (_link, mut events) = mock.open().unwrap();
        assert_eq!(events.poll().await.unwrap(), TransportEvent::Connected);
        assert_eq!(mock.connection_attempts(), 1);
        assert!(mock.is_connected());
    }

    #[tokio::test]
    async fn test_failing_first_then_accepts() {
        let mock = MockConnector::failing_first(1);

        let (_, mut events) = mock.open().unwrap();
        assert!(matches!(
            events.poll().await,
            Err(TransportError::ConnectionRefused(_))
        ));

        let (_, mut events) = mock.open().unwrap();
        assert_eq!(events.poll().await.unwrap(), TransportEvent::Connected);
    }

    #[tokio::test]
    async fn test_subscribe_emits_sent_and_ack() {
        let mock = MockConnector::new();
        mock.reject_topic("bad/topic");
        let (link, mut events) = mock.open().unwrap();
        events.poll().await.unwrap();

        link.subscribe("good/topic", QoS::ExactlyOnce).await.unwrap();
        link.subscribe("bad/topic", QoS::ExactlyOnce).await.unwrap();

        assert_eq!(
            events.poll().await.unwrap(),
            TransportEvent::SubscribeSent { pkid: 1 }
        );
        assert_eq!(
            events.poll().await.unwrap(),
            TransportEvent::SubAck {
                pkid: 1,
                granted: true
            }
        );
        assert_eq!(
            events.poll().await.unwrap(),
            TransportEvent::SubscribeSent { pkid: 2 }
        );
        assert_eq!(
            events.poll().await.unwrap(),
            TransportEvent::SubAck {
                pkid: 2,
                granted: false
            }
        );
        assert_eq!(mock.subscribe_requests(), vec!["good/topic", "bad/topic"]);
    }

    #[tokio::test]
    async fn test_disconnect_counts_once_polled() {
        let mock = MockConnector::new();
        let (link, mut events) = mock.open().unwrap();
        events.poll().await.unwrap();

        link.disconnect().await.unwrap();
        assert!(!mock.is_connected());
        assert_eq!(mock.disconnects_sent(), 0);

        assert_eq!(events.poll().await.unwrap(), TransportEvent::DisconnectSent);
        assert_eq!(mock.disconnects_sent(), 1);
    }

    #[tokio::test]
    async fn test_stale_link_rejects_requests() {
        let mock = MockConnector::new();
        let (link, _events) = mock.open().unwrap();
        assert!(mock.drop_connection());

        assert!(link.publish("a", Bytes::new(), QoS::AtMostOnce, false).await.is_err());
        assert!(!mock.deliver("a", "x"));
    }
}
