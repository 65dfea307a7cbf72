//! Inbound message dispatch
//!
//! Exactly one handler receives every inbound message. Handler failures,
//! including panics, are contained here and never reach the session loop.

use crate::observability::metrics::SessionMetrics;
use crate::store::Record;
use crate::transport::{qos_level, QoS};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Error type returned by message handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Receiver of inbound messages
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, topic: &str, payload: &[u8]) -> Result<(), HandlerError>;

    /// Entry point used by the dispatcher; override to see QoS and retain flags
    fn handle_message(&self, message: &InboundMessage) -> Result<(), HandlerError> {
        self.handle(&message.topic, &message.payload)
    }
}

impl<F> MessageHandler for F
where
    F: Fn(&str, &[u8]) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, topic: &str, payload: &[u8]) -> Result<(), HandlerError> {
        self(topic, payload)
    }
}

/// Owned copy of an inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: Bytes, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos,
            retain,
            received_at: Utc::now(),
        }
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Store record `{id, topic, payload, qos, retain, received_at}` with a fresh id
    pub fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert("id".to_string(), Value::from(Uuid::new_v4().to_string()));
        record.insert("topic".to_string(), Value::from(self.topic.clone()));
        record.insert("payload".to_string(), Value::from(self.payload_str().into_owned()));
        record.insert("qos".to_string(), Value::from(qos_level(self.qos)));
        record.insert("retain".to_string(), Value::from(self.retain));
        record.insert(
            "received_at".to_string(),
            Value::from(self.received_at.to_rfc3339()),
        );
        record
    }
}

/// Handler that forwards messages into a channel for async consumers
///
/// Uses `try_send`, so a full channel drops the message with an error
/// instead of stalling the receive loop.
pub struct ChannelHandler {
    sender: mpsc::Sender<InboundMessage>,
}

impl ChannelHandler {
    pub fn new(sender: mpsc::Sender<InboundMessage>) -> Self {
        Self { sender }
    }

    /// Create a handler and the receiving end of its channel
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self::new(sender), receiver)
    }
}

impl MessageHandler for ChannelHandler {
    fn handle(&self, topic: &str, payload: &[u8]) -> Result<(), HandlerError> {
        let message = InboundMessage::new(
            topic,
            Bytes::copy_from_slice(payload),
            QoS::AtMostOnce,
            false,
        );
        self.handle_message(&message)
    }

    fn handle_message(&self, message: &InboundMessage) -> Result<(), HandlerError> {
        self.sender.try_send(message.clone()).map_err(|e| {
            format!("Failed to forward message on {}: {e}", message.topic).into()
        })
    }
}

/// Routes inbound messages to the registered handler
#[derive(Clone, Default)]
pub struct Dispatcher {
    handler: Option<Arc<dyn MessageHandler>>,
    metrics: Arc<SessionMetrics>,
}

impl Dispatcher {
    pub fn new(handler: Option<Arc<dyn MessageHandler>>, metrics: Arc<SessionMetrics>) -> Self {
        Self { handler, metrics }
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Invoke the handler once; returns true when it completed successfully
    pub fn dispatch(&self, message: &InboundMessage) -> bool {
        self.metrics.record_message_received();

        let Some(handler) = &self.handler else {
            warn!(topic = %message.topic, "Received MQTT message but no handler registered - message dropped");
            return false;
        };

        debug!(
            topic = %message.topic,
            qos = ?message.qos,
            retain = message.retain,
            bytes = message.payload.len(),
            "Dispatching MQTT message"
        );

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            handler.handle_message(message)
        }));

        match outcome {
            Ok(Ok(())) => {
                self.metrics.record_message_dispatched();
                true
            }
            Ok(Err(e)) => {
                self.metrics.record_handler_failure();
                error!(topic = %message.topic, "Message handler failed: {}", e);
                false
            }
            Err(panic) => {
                self.metrics.record_handler_failure();
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(topic = %message.topic, "Message handler panicked: {}", reason);
                false
            }
        }
    }
}
