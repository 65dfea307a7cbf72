//! Subscription bookkeeping per connection epoch
//!
//! One ordered list of topics with their confirmation state, in the order
//! the topics were configured. Every transition into
//! Connected asks [`SubscriptionTracker::on_connected`] for the topics that
//! still need a subscribe request; every transition out of Connected calls
//! [`SubscriptionTracker::reset`], so confirmations never survive a reconnect.
//!
//! Packet ids are bound to topics in request order: the oldest queued topic
//! gets the next `SubscribeSent` packet id, and the matching `SubAck`
//! confirms or rejects it.

use crate::transport::QoS;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use tracing::{debug, warn};

/// A topic and whether the broker confirmed it in the current epoch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub topic: String,
    pub confirmed: bool,
}

/// The broker refused a mandatory subscription
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SubscribeError {
    #[error("Broker rejected subscription to {topic}")]
    Rejected { topic: String },
    #[error("Failed to request subscription to {topic}: {reason}")]
    RequestFailed { topic: String, reason: String },
}

/// Tracks the fixed topic set and its per-epoch confirmation flags
#[derive(Debug, Clone)]
pub struct SubscriptionTracker {
    topics: Vec<Subscription>,
    qos: QoS,
    queued: VecDeque<String>,
    in_flight: HashMap<u16, String>,
}

impl SubscriptionTracker {
    /// Build the tracker from the launch-time topic list
    ///
    /// Duplicates collapse onto their first occurrence; configured order is
    /// kept and drives the order of subscribe requests.
    pub fn new<I, S>(topics: I, qos: QoS) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let topics = topics
            .into_iter()
            .map(Into::<String>::into)
            .filter(|topic| seen.insert(topic.clone()))
            .map(|topic| Subscription {
                topic,
                confirmed: false,
            })
            .collect();

        Self {
            topics,
            qos,
            queued: VecDeque::new(),
            in_flight: HashMap::new(),
        }
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Topics that need a subscribe request in this epoch
    ///
    /// Topics already awaiting an acknowledgment are not returned twice, so
    /// each topic is requested exactly once per connection epoch.
    pub fn on_connected(&mut self) -> Vec<String> {
        let pending: Vec<String> = self
            .topics
            .iter()
            .filter(|s| {
                !s.confirmed && !self.queued.contains(&s.topic) && !self.is_in_flight(&s.topic)
            })
            .map(|s| s.topic.clone())
            .collect();

        self.queued.extend(pending.iter().cloned());
        pending
    }

    /// Bind the oldest queued topic to the packet id the transport assigned
    pub fn on_subscribe_sent(&mut self, pkid: u16) {
        match self.queued.pop_front() {
            Some(topic) => {
                debug!(pkid, topic = %topic, "Subscribe request sent");
                self.in_flight.insert(pkid, topic);
            }
            None => warn!(pkid, "Subscribe packet sent with no queued topic"),
        }
    }

    /// Apply a broker acknowledgment
    ///
    /// Returns the confirmed topic, `Ok(None)` for an unknown packet id, or an
    /// error when the broker refused the subscription.
    pub fn on_suback(&mut self, pkid: u16, granted: bool) -> Result<Option<String>, SubscribeError> {
        let Some(topic) = self.in_flight.remove(&pkid) else {
            debug!(pkid, "SubAck for unknown packet id ignored");
            return Ok(None);
        };

        if !granted {
            return Err(SubscribeError::Rejected { topic });
        }

        if let Some(entry) = self.topics.iter_mut().find(|s| s.topic == topic) {
            entry.confirmed = true;
        }
        Ok(Some(topic))
    }

    /// Forget every confirmation and pending request (connection left Connected)
    pub fn reset(&mut self) {
        self.topics.iter_mut().for_each(|s| s.confirmed = false);
        self.queued.clear();
        self.in_flight.clear();
    }

    pub fn is_confirmed(&self, topic: &str) -> bool {
        self.topics
            .iter()
            .any(|s| s.topic == topic && s.confirmed)
    }

    pub fn all_confirmed(&self) -> bool {
        self.topics.iter().all(|s| s.confirmed)
    }

    /// Snapshot of every subscription and its flag
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.topics.clone()
    }

    fn is_in_flight(&self, topic: &str) -> bool {
        self.in_flight.values().any(|t| t == topic)
    }
}
