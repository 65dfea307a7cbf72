//! Impure I/O operations for the MQTT session
//!
//! [`MqttClient`] owns one background task that drives the connection state
//! machine, the subscription tracker and inbound dispatch. Callers only talk
//! to it through `launch`, `publish`, `end` and the read-only accessors; all
//! state changes happen inside the task and are published over watch channels.

use super::connection::{ClientError, ConnectionState};
use super::message_handler::{Dispatcher, HandlerError, InboundMessage, MessageHandler};
use super::retry::{RetryDecision, RetryPolicy};
use super::rumqttc_transport::{RumqttcConnector, REQUEST_CAPACITY};
use super::subscriptions::{SubscribeError, Subscription, SubscriptionTracker};
use crate::config::ClientConfig;
use crate::observability::metrics::{MetricsSnapshot, SessionMetrics};
use crate::transport::{
    qos_from_level, Connector, EventSource, Link, QoS, TransportError, TransportEvent,
};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Instrument};

/// Messages held while subscriptions are being re-confirmed
const HOLD_CAPACITY: usize = 1024;

/// How long `end` waits for the background task before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How long the event source is polled for the DISCONNECT to go out
const DISCONNECT_FLUSH: Duration = Duration::from_secs(1);

/// Resilient MQTT session over a pluggable transport
pub struct MqttClient<C: Connector = RumqttcConnector> {
    config: ClientConfig,
    topics: Vec<String>,
    connector: Arc<C>,
    handler: Option<Arc<dyn MessageHandler>>,
    metrics: Arc<SessionMetrics>,
    link: Arc<Mutex<Option<C::Link>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    subscriptions_tx: Arc<watch::Sender<Vec<Subscription>>>,
    subscriptions_rx: watch::Receiver<Vec<Subscription>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    session_handle: Option<JoinHandle<()>>,
}

impl MqttClient<RumqttcConnector> {
    /// Create a session backed by rumqttc
    ///
    /// Fails with [`ClientError::Config`] when the configuration is invalid or
    /// a referenced certificate file is missing.
    pub fn new(config: ClientConfig, topics: Vec<String>) -> Result<Self, ClientError> {
        let connector =
            RumqttcConnector::new(&config)?.with_request_capacity(topics.len() + REQUEST_CAPACITY);
        Ok(Self::with_connector(config, topics, connector))
    }
}

impl<C: Connector> MqttClient<C> {
    /// Create a session over an arbitrary transport
    pub fn with_connector(config: ClientConfig, topics: Vec<String>, connector: C) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let qos = subscribe_qos(&config);
        let initial = SubscriptionTracker::new(topics.iter().cloned(), qos).subscriptions();
        let (subscriptions_tx, subscriptions_rx) = watch::channel(initial);

        Self {
            config,
            topics,
            connector: Arc::new(connector),
            handler: None,
            metrics: Arc::new(SessionMetrics::default()),
            link: Arc::new(Mutex::new(None)),
            state_tx: Arc::new(state_tx),
            state_rx,
            subscriptions_tx: Arc::new(subscriptions_tx),
            subscriptions_rx,
            shutdown_tx: None,
            session_handle: None,
        }
    }

    /// Register the inbound message handler; takes effect on the next `launch`
    pub fn set_handler<F>(&mut self, handler: F)
    where
        F: Fn(&str, &[u8]) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.set_message_handler(handler);
    }

    /// Register a [`MessageHandler`] implementation; takes effect on the next `launch`
    pub fn set_message_handler<H: MessageHandler>(&mut self, handler: H) {
        if self.is_running() {
            warn!("Message handler replaced while running - applies after the next launch");
        }
        self.handler = Some(Arc::new(handler));
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect, then keep the session alive in the background
    ///
    /// Returns once the first connection is acknowledged, or with
    /// [`ClientError::ConnectionFailed`] after every allowed attempt failed.
    /// A failed session can be launched again.
    pub async fn launch(&mut self) -> Result<(), ClientError> {
        if self.is_running() {
            return Err(ClientError::AlreadyLaunched);
        }
        self.config.validate()?;

        info!(
            host = %self.config.host,
            port = self.config.port,
            client_id = %self.config.client_id,
            topics = self.topics.len(),
            "Launching MQTT session"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (launched_tx, launched_rx) = oneshot::channel();

        let tracker = SubscriptionTracker::new(self.topics.iter().cloned(), subscribe_qos(&self.config));
        self.subscriptions_tx.send_replace(tracker.subscriptions());
        self.state_tx.send_replace(ConnectionState::Connecting);

        let session = Session {
            config: self.config.clone(),
            connector: self.connector.clone(),
            link: self.link.clone(),
            state_tx: self.state_tx.clone(),
            subscriptions_tx: self.subscriptions_tx.clone(),
            shutdown_rx,
            tracker,
            dispatcher: Dispatcher::new(self.handler.clone(), self.metrics.clone()),
            metrics: self.metrics.clone(),
            held: VecDeque::new(),
        };

        let span = crate::mqtt_span!(
            client_id = %self.config.client_id,
            host = %self.config.host,
            port = self.config.port
        );
        let handle = tokio::spawn(session.run(launched_tx).instrument(span));

        self.shutdown_tx = Some(shutdown_tx);
        self.session_handle = Some(handle);

        match launched_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.reap_session().await;
                Err(e)
            }
            Err(_) => {
                self.reap_session().await;
                Err(ClientError::ConnectionFailed {
                    attempts: 0,
                    reason: "Session task ended before connecting".to_string(),
                })
            }
        }
    }

    /// Publish one message; fails unless the session is Connected
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        let state = self.connection_state();
        if !state.is_connected() {
            return Err(ClientError::NotConnected { state });
        }

        let link = self.link.lock().await.clone();
        let Some(link) = link else {
            return Err(ClientError::NotConnected {
                state: self.connection_state(),
            });
        };

        match link.publish(topic, payload.into(), qos, retain).await {
            Ok(()) => {
                self.metrics.record_publish(true);
                debug!(topic = %topic, qos = ?qos, retain, "Published message");
                Ok(())
            }
            Err(source) => {
                self.metrics.record_publish(false);
                error!(topic = %topic, "Publish failed: {}", source);
                Err(ClientError::PublishFailed {
                    topic: topic.to_string(),
                    source,
                })
            }
        }
    }

    /// Stop the session and disconnect; safe to call repeatedly
    ///
    /// When this returns the background task has exited, so the handler is
    /// never invoked again.
    pub async fn end(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
            debug!("Sent shutdown signal to MQTT session");
        }

        if let Some(mut handle) = self.session_handle.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
                Ok(Ok(())) => info!("MQTT session shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("MQTT session task ended with error: {}", e),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("MQTT session didn't shut down gracefully, forcing abort");
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }

        self.link.lock().await.take();
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state_rx.borrow().is_connected()
    }

    /// True once retries are exhausted; the session must be launched again
    pub fn is_failed(&self) -> bool {
        self.state_rx.borrow().is_failed()
    }

    /// Current subscription flags
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions_rx.borrow().clone()
    }

    /// Receiver notified on every connection state change
    pub fn state_updates(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Receiver notified on every subscription flag change
    pub fn subscription_updates(&self) -> watch::Receiver<Vec<Subscription>> {
        self.subscriptions_rx.clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Wait until the connection state satisfies `predicate`
    pub async fn wait_for_state<P>(&self, predicate: P, timeout: Duration) -> bool
    where
        P: Fn(&ConnectionState) -> bool,
    {
        wait_for(self.state_rx.clone(), predicate, timeout).await
    }

    /// Wait until every topic is confirmed in the current connection epoch
    pub async fn wait_for_subscriptions(&self, timeout: Duration) -> bool {
        wait_for(
            self.subscriptions_rx.clone(),
            |subs: &Vec<Subscription>| subs.iter().all(|s| s.confirmed),
            timeout,
        )
        .await
    }

    fn is_running(&self) -> bool {
        self.session_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Collect a background task that already gave up
    async fn reap_session(&mut self) {
        self.shutdown_tx = None;
        if let Some(handle) = self.session_handle.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("MQTT session task ended with error: {}", e);
                }
            }
        }
    }
}

impl<C: Connector> Drop for MqttClient<C> {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        // No async in Drop: call end() for a graceful disconnect
        if let Some(handle) = self.session_handle.take() {
            handle.abort();
        }
    }
}

fn subscribe_qos(config: &ClientConfig) -> QoS {
    qos_from_level(config.subscribe_qos).unwrap_or(QoS::ExactlyOnce)
}

async fn wait_for<T, P>(mut rx: watch::Receiver<T>, predicate: P, timeout: Duration) -> bool
where
    P: Fn(&T) -> bool,
{
    let waiting = async {
        loop {
            if predicate(&rx.borrow_and_update()) {
                return true;
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    };
    tokio::time::timeout(timeout, waiting).await.unwrap_or(false)
}

/// Resolves once shutdown is requested or the client is gone
async fn wait_for_shutdown(mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Perform interruptible sleep with shutdown monitoring
/// Returns true if sleep completed, false if shutdown requested
async fn interruptible_sleep(shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = wait_for_shutdown(shutdown_rx) => {
            info!("Shutdown signal received during retry delay, stopping");
            false
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

enum ConnectOutcome<E> {
    Connected(E),
    GaveUp { attempts: u32, reason: String },
    Shutdown,
}

enum SessionExit {
    Shutdown,
    Lost(String),
    Rejected(SubscribeError),
}

/// State owned by the background task
struct Session<C: Connector> {
    config: ClientConfig,
    connector: Arc<C>,
    link: Arc<Mutex<Option<C::Link>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    subscriptions_tx: Arc<watch::Sender<Vec<Subscription>>>,
    shutdown_rx: watch::Receiver<bool>,
    tracker: SubscriptionTracker,
    dispatcher: Dispatcher,
    metrics: Arc<SessionMetrics>,
    held: VecDeque<InboundMessage>,
}

impl<C: Connector> Session<C> {
    async fn run(mut self, launched: oneshot::Sender<Result<(), ClientError>>) {
        let initial = RetryPolicy::initial(&self.config);
        let mut events = match self.connect_with_retry(&initial).await {
            ConnectOutcome::Connected(events) => {
                let _ = launched.send(Ok(()));
                events
            }
            ConnectOutcome::GaveUp { attempts, reason } => {
                self.give_up(attempts, &reason);
                let _ = launched.send(Err(ClientError::ConnectionFailed { attempts, reason }));
                return;
            }
            ConnectOutcome::Shutdown => {
                self.state_tx.send_replace(ConnectionState::Disconnected);
                let _ = launched.send(Err(ClientError::ConnectionFailed {
                    attempts: 0,
                    reason: "Session ended before connecting".to_string(),
                }));
                return;
            }
        };

        let reconnect = RetryPolicy::reconnect(&self.config);
        let mut rejections = 0u32;

        loop {
            match self.run_connected(&mut events, &mut rejections).await {
                SessionExit::Shutdown => {
                    self.close_gracefully(&mut events).await;
                    break;
                }
                SessionExit::Lost(reason) => {
                    warn!("MQTT connection lost: {}", reason);
                    self.leave_connected().await;
                }
                SessionExit::Rejected(e) => {
                    rejections += 1;
                    self.metrics.record_subscribe_failure();
                    error!("Dropping connection after subscription failure: {}", e);
                    self.close_gracefully(&mut events).await;
                    self.leave_connected().await;

                    if !interruptible_sleep(self.shutdown_rx.clone(), reconnect.delay_for(rejections))
                        .await
                    {
                        break;
                    }
                    let stop = *self.shutdown_rx.borrow();
                    match reconnect.decide(rejections, stop) {
                        RetryDecision::Retry { .. } => {}
                        RetryDecision::GiveUp => {
                            self.give_up(rejections, &e.to_string());
                            return;
                        }
                        RetryDecision::Shutdown => break,
                    }
                }
            }

            events = match self.connect_with_retry(&reconnect).await {
                ConnectOutcome::Connected(events) => events,
                ConnectOutcome::GaveUp { attempts, reason } => {
                    self.give_up(attempts, &reason);
                    return;
                }
                ConnectOutcome::Shutdown => break,
            };
        }

        self.disconnect_link().await;
        self.tracker.reset();
        self.publish_subscriptions();
        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!("MQTT session stopped");
    }

    /// Attempt connections until one succeeds, the policy gives up, or shutdown
    async fn connect_with_retry(&mut self, policy: &RetryPolicy) -> ConnectOutcome<C::Events> {
        let mut attempts = 0u32;

        loop {
            if *self.shutdown_rx.borrow() {
                return ConnectOutcome::Shutdown;
            }

            attempts += 1;
            self.state_tx.send_replace(ConnectionState::Connecting);
            self.metrics.record_connection_attempt();
            debug!("[{}/{}] MQTT connecting", attempts, policy.max_display());

            let result = tokio::select! {
                _ = wait_for_shutdown(self.shutdown_rx.clone()) => return ConnectOutcome::Shutdown,
                result = self.attempt_connection() => result,
            };

            let reason = match result {
                Ok((link, events)) => {
                    *self.link.lock().await = Some(link);
                    self.metrics.record_connection_established();
                    info!(
                        "[{}/{}] MQTT connected to {}:{}",
                        attempts,
                        policy.max_display(),
                        self.config.host,
                        self.config.port
                    );
                    return ConnectOutcome::Connected(events);
                }
                Err(e) => e.to_string(),
            };

            warn!("[{}/{}] MQTT fail connect: {}", attempts, policy.max_display(), reason);

            if !interruptible_sleep(self.shutdown_rx.clone(), policy.delay_for(attempts)).await {
                return ConnectOutcome::Shutdown;
            }

            let stop = *self.shutdown_rx.borrow();
            match policy.decide(attempts, stop) {
                RetryDecision::Retry { attempt, delay } => {
                    trace!(attempt, ?delay, "Retrying MQTT connection");
                }
                RetryDecision::GiveUp => return ConnectOutcome::GaveUp { attempts, reason },
                RetryDecision::Shutdown => return ConnectOutcome::Shutdown,
            }
        }
    }

    /// Open a session and poll it until the broker acknowledges the connection
    async fn attempt_connection(&self) -> Result<(C::Link, C::Events), TransportError> {
        let (link, mut events) = self.connector.open()?;
        let timeout = self.config.connect_timeout();

        let handshake = async {
            loop {
                match events.poll().await? {
                    TransportEvent::Connected => return Ok::<(), TransportError>(()),
                    TransportEvent::Disconnected => {
                        return Err(TransportError::ConnectionLost(
                            "Broker closed the connection during handshake".to_string(),
                        ))
                    }
                    other => trace!("Event before ConnAck: {:?}", other),
                }
            }
        };

        match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(())) => Ok((link, events)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::ConnectionLost(format!(
                "ConnAck timeout after {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// Receive loop for one connection epoch
    async fn run_connected(&mut self, events: &mut C::Events, rejections: &mut u32) -> SessionExit {
        self.state_tx.send_replace(ConnectionState::Connected);

        if let Err(e) = self.request_subscriptions().await {
            return SessionExit::Rejected(e);
        }
        if self.tracker.all_confirmed() {
            self.flush_held();
        }

        loop {
            let event = tokio::select! {
                biased;
                _ = wait_for_shutdown(self.shutdown_rx.clone()) => return SessionExit::Shutdown,
                event = events.poll() => event,
            };

            match event {
                Ok(TransportEvent::Message {
                    topic,
                    payload,
                    qos,
                    retain,
                }) => self.on_message(InboundMessage::new(topic, payload, qos, retain)),
                Ok(TransportEvent::SubscribeSent { pkid }) => self.tracker.on_subscribe_sent(pkid),
                Ok(TransportEvent::SubAck { pkid, granted }) => {
                    match self.tracker.on_suback(pkid, granted) {
                        Ok(Some(topic)) => {
                            info!(topic = %topic, "Subscription confirmed");
                            self.publish_subscriptions();
                            if self.tracker.all_confirmed() {
                                *rejections = 0;
                                self.flush_held();
                            }
                        }
                        Ok(None) => {}
                        Err(e) => return SessionExit::Rejected(e),
                    }
                }
                Ok(TransportEvent::Connected) => debug!("Duplicate ConnAck ignored"),
                Ok(TransportEvent::Disconnected) => {
                    return SessionExit::Lost("Broker closed the connection".to_string())
                }
                Ok(TransportEvent::DisconnectSent) => {
                    return SessionExit::Lost("Connection closed by client".to_string())
                }
                Ok(TransportEvent::Other(description)) => trace!("MQTT event: {}", description),
                Err(e) => return SessionExit::Lost(e.to_string()),
            }
        }
    }

    /// Issue one subscribe request per unconfirmed topic
    async fn request_subscriptions(&mut self) -> Result<(), SubscribeError> {
        let pending = self.tracker.on_connected();
        if pending.is_empty() {
            return Ok(());
        }

        let link = self.link.lock().await.clone();
        let Some(link) = link else {
            return Err(SubscribeError::RequestFailed {
                topic: pending.join(", "),
                reason: "No active connection".to_string(),
            });
        };

        let qos = self.tracker.qos();
        for topic in pending {
            if let Err(e) = link.subscribe(&topic, qos).await {
                return Err(SubscribeError::RequestFailed {
                    topic,
                    reason: e.to_string(),
                });
            }
            debug!(topic = %topic, qos = ?qos, "Subscribe requested");
        }
        Ok(())
    }

    fn on_message(&mut self, message: InboundMessage) {
        if self.tracker.all_confirmed() {
            self.dispatcher.dispatch(&message);
            return;
        }

        if self.held.len() >= HOLD_CAPACITY {
            if let Some(dropped) = self.held.pop_front() {
                warn!(topic = %dropped.topic, "Hold buffer full, dropping oldest message");
            }
        }
        debug!(topic = %message.topic, "Holding message until subscriptions are confirmed");
        self.held.push_back(message);
    }

    fn flush_held(&mut self) {
        if !self.held.is_empty() {
            debug!(count = self.held.len(), "Dispatching held messages");
        }
        while let Some(message) = self.held.pop_front() {
            self.dispatcher.dispatch(&message);
        }
    }

    /// Transition out of Connected: confirmations do not survive a reconnect
    async fn leave_connected(&mut self) {
        self.link.lock().await.take();
        self.tracker.reset();
        self.publish_subscriptions();
        self.state_tx.send_replace(ConnectionState::Connecting);
    }

    /// Send DISCONNECT and poll until it is on the wire or the connection ends
    async fn close_gracefully(&self, events: &mut C::Events) {
        let link = self.link.lock().await.take();
        let Some(link) = link else {
            return;
        };
        if let Err(e) = link.disconnect().await {
            debug!("Disconnect request failed: {}", e);
            return;
        }

        let flush = async {
            loop {
                match events.poll().await {
                    Ok(TransportEvent::DisconnectSent) => {
                        debug!("MQTT disconnect sent");
                        return;
                    }
                    Ok(other) => trace!("Event while disconnecting: {:?}", other),
                    Err(e) => {
                        debug!("Connection ended while disconnecting: {}", e);
                        return;
                    }
                }
            }
        };
        if tokio::time::timeout(DISCONNECT_FLUSH, flush).await.is_err() {
            warn!(
                "MQTT disconnect not confirmed within {}s",
                DISCONNECT_FLUSH.as_secs()
            );
        }
    }

    async fn disconnect_link(&self) {
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            if let Err(e) = link.disconnect().await {
                debug!("Disconnect request failed: {}", e);
            }
        }
    }

    fn give_up(&mut self, attempts: u32, reason: &str) {
        error!("MQTT connection failed after {} attempt(s): {}", attempts, reason);
        self.tracker.reset();
        self.publish_subscriptions();
        self.state_tx
            .send_replace(ConnectionState::Failed(reason.to_string()));
    }

    fn publish_subscriptions(&self) {
        self.subscriptions_tx.send_replace(self.tracker.subscriptions());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockConnector;
    use std::sync::Mutex as StdMutex;

    fn config() -> ClientConfig {
        let mut config = ClientConfig::new("broker.test", 1883);
        config.max_retries = Some(3);
        config.retry_interval_seconds = 1;
        config
    }

    fn topics() -> Vec<String> {
        vec!["a/b".to_string(), "c/d".to_string()]
    }

    #[tokio::test]
    async fn test_state_before_launch() {
        let client = MqttClient::with_connector(config(), topics(), MockConnector::new());
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(!client.is_connected());
        assert!(!client.is_failed());
        assert_eq!(client.subscriptions().len(), 2);
        assert!(client.subscriptions().iter().all(|s| !s.confirmed));
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let client = MqttClient::with_connector(config(), topics(), MockConnector::new());
        let result = client.publish("a/b", "x", QoS::AtLeastOnce, false).await;
        assert!(matches!(
            result,
            Err(ClientError::NotConnected {
                state: ConnectionState::Disconnected
            })
        ));
    }

    #[tokio::test]
    async fn test_launch_rejects_invalid_config() {
        let mock = MockConnector::new();
        let mut client =
            MqttClient::with_connector(ClientConfig::new("", 1883), topics(), mock.clone());

        assert!(matches!(client.launch().await, Err(ClientError::Config(_))));
        assert_eq!(mock.connection_attempts(), 0);
    }

    #[tokio::test]
    async fn test_launch_subscribes_and_publishes() {
        let mock = MockConnector::new();
        let mut client = MqttClient::with_connector(config(), topics(), mock.clone());

        client.launch().await.unwrap();
        assert!(client.is_connected());
        assert!(client.wait_for_subscriptions(Duration::from_secs(1)).await);
        assert_eq!(mock.subscribe_requests(), vec!["a/b", "c/d"]);

        client
            .publish("out/topic", "hello", QoS::AtLeastOnce, false)
            .await
            .unwrap();
        let published = mock.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "out/topic");
        assert_eq!(published[0].payload, Bytes::from_static(b"hello"));
        assert_eq!(client.metrics().messages_published, 1);

        client.end().await;
    }

    #[tokio::test]
    async fn test_launch_twice_is_rejected() {
        let mut client = MqttClient::with_connector(config(), topics(), MockConnector::new());
        client.launch().await.unwrap();
        assert!(matches!(
            client.launch().await,
            Err(ClientError::AlreadyLaunched)
        ));
        client.end().await;
    }

    #[tokio::test]
    async fn test_end_is_idempotent() {
        let mut client = MqttClient::with_connector(config(), topics(), MockConnector::new());
        client.end().await;

        client.launch().await.unwrap();
        client.end().await;
        client.end().await;

        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(client.subscriptions().iter().all(|s| !s.confirmed));
    }

    #[tokio::test]
    async fn test_no_dispatch_after_end() {
        let mock = MockConnector::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();

        let mut client = MqttClient::with_connector(config(), topics(), mock.clone());
        client.set_handler(move |topic: &str, _: &[u8]| {
            sink.lock().unwrap().push(topic.to_string());
            Ok(())
        });
        client.launch().await.unwrap();
        client.end().await;

        assert!(!mock.deliver("a/b", "late"));
        tokio::task::yield_now().await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_end_flushes_disconnect() {
        let mock = MockConnector::new();
        let mut client = MqttClient::with_connector(config(), topics(), mock.clone());
        client.launch().await.unwrap();
        assert!(client.wait_for_subscriptions(Duration::from_secs(1)).await);

        client.end().await;
        assert_eq!(mock.disconnects_sent(), 1);
        assert!(!mock.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_gives_up_when_retries_run_out() {
        let mock = MockConnector::new();
        mock.reject_topic("a/b");
        let mut cfg = config();
        cfg.max_retries = Some(1);

        let mut client = MqttClient::with_connector(cfg, topics(), mock.clone());
        client.launch().await.unwrap();
        assert!(
            client
                .wait_for_state(ConnectionState::is_failed, Duration::from_secs(30))
                .await
        );

        assert_eq!(mock.connection_attempts(), 1);
        assert_eq!(mock.disconnects_sent(), 1);
        assert_eq!(client.metrics().subscribe_failures, 1);
        assert!(!client.is_connected());
        client.end().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_initial_failures() {
        let mock = MockConnector::failing_first(2);
        let mut client = MqttClient::with_connector(config(), topics(), mock.clone());

        client.launch().await.unwrap();
        assert_eq!(mock.connection_attempts(), 3);
        assert_eq!(client.metrics().connection_attempts, 3);
        client.end().await;
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_resolves_when_sender_dropped() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_millis(100), wait_for_shutdown(rx))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_interruptible_sleep_completes() {
        let (_tx, rx) = watch::channel(false);
        assert!(interruptible_sleep(rx, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_interruptible_sleep_interrupted() {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = tx.send(true);
        });
        assert!(!interruptible_sleep(rx, Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let (_tx, rx) = watch::channel(1u8);
        assert!(!wait_for(rx, |v| *v == 2, Duration::from_millis(10)).await);
    }
}
