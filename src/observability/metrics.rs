//! Thread-safe session metrics
//!
//! Atomic counters shared between a session's background loop and its
//! callers. One [`SessionMetrics`] per [`crate::transport::mqtt::MqttClient`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Counters for one MQTT session
#[derive(Debug, Default)]
pub struct SessionMetrics {
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    reconnects: AtomicU64,
    messages_received: AtomicU64,
    messages_dispatched: AtomicU64,
    handler_failures: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    subscribe_failures: AtomicU64,
    last_connected_at: AtomicU64,
}

/// Point-in-time copy of [`SessionMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub reconnects: u64,
    pub messages_received: u64,
    pub messages_dispatched: u64,
    pub handler_failures: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub subscribe_failures: u64,
    /// Unix timestamp (seconds) of the last successful connection, 0 if never
    pub last_connected_at: u64,
}

impl SessionMetrics {
    pub fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_established(&self) {
        let previous = self.connections_established.fetch_add(1, Ordering::Relaxed);
        if previous > 0 {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }
        self.last_connected_at
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_dispatched(&self) {
        self.messages_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish(&self, success: bool) {
        if success {
            self.messages_published.fetch_add(1, Ordering::Relaxed);
        } else {
            self.publish_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_subscribe_failure(&self) {
        self.subscribe_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            subscribe_failures: self.subscribe_failures.load(Ordering::Relaxed),
            last_connected_at: self.last_connected_at.load(Ordering::Relaxed),
        }
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnects_counted_after_first_connection() {
        let metrics = SessionMetrics::default();
        metrics.record_connection_established();
        assert_eq!(metrics.snapshot().reconnects, 0);

        metrics.record_connection_established();
        metrics.record_connection_established();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_established, 3);
        assert_eq!(snapshot.reconnects, 2);
        assert!(snapshot.last_connected_at > 0);
    }

    #[test]
    fn test_publish_outcomes() {
        let metrics = SessionMetrics::default();
        metrics.record_publish(true);
        metrics.record_publish(true);
        metrics.record_publish(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_published, 2);
        assert_eq!(snapshot.publish_failures, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = SessionMetrics::default();
        metrics.record_connection_attempt();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["connection_attempts"], 1);
    }
}
