//! In-memory transport.
//!
//! Records every subscription and publish and lets tests inject inbound
//! messages as if they had arrived on the receive thread. Rejections can be
//! scripted per topic to exercise the error paths.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use super::{Credentials, MqttEndpoint, Transport, TransportListener};
use crate::{BridgeError, QosLevel};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QosLevel,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or("<binary>")
    }
}

#[derive(Default)]
struct MemoryState {
    connected: bool,
    looping: bool,
    refuse_connect: bool,
    subscriptions: Vec<(String, QosLevel)>,
    published: Vec<PublishedMessage>,
    reject_subscribe: HashSet<String>,
    max_subscribe_qos: Option<QosLevel>,
    reject_publish: HashSet<String>,
    disconnects: usize,
}

#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    listener: RwLock<Option<Arc<dyn TransportListener>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that already holds an open session.
    pub fn connected() -> Self {
        let transport = Self::default();
        transport.lock().connected = true;
        transport
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn refuse_connect(&self) {
        self.lock().refuse_connect = true;
    }

    /// Reject subscriptions to `topic`, as a broker returning a failure SUBACK would.
    pub fn reject_subscribe(&self, topic: &str) {
        self.lock().reject_subscribe.insert(topic.to_string());
    }

    /// Reject subscriptions above `qos`.
    pub fn limit_subscribe_qos(&self, qos: QosLevel) {
        self.lock().max_subscribe_qos = Some(qos);
    }

    /// Refuse to queue publishes to `topic`.
    pub fn reject_publish(&self, topic: &str) {
        self.lock().reject_publish.insert(topic.to_string());
    }

    pub fn subscriptions(&self) -> Vec<(String, QosLevel)> {
        self.lock().subscriptions.clone()
    }

    pub fn subscribed_topics(&self) -> HashSet<String> {
        self.lock()
            .subscriptions
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn clear_published(&self) {
        self.lock().published.clear();
    }

    pub fn is_looping(&self) -> bool {
        self.lock().looping
    }

    pub fn disconnect_count(&self) -> usize {
        self.lock().disconnects
    }

    pub fn has_listener(&self) -> bool {
        self.listener
            .read()
            .map(|l| l.is_some())
            .unwrap_or(false)
    }

    fn current_listener(&self) -> Option<Arc<dyn TransportListener>> {
        self.listener.read().ok().and_then(|l| l.clone())
    }

    /// Deliver an inbound message to the listener, if any.
    pub fn inject(&self, topic: &str, payload: &[u8], qos: QosLevel) {
        if let Some(listener) = self.current_listener() {
            listener.on_message(topic, payload, qos);
        }
    }

    /// Simulate the broker dropping the connection.
    pub fn drop_connection(&self, reason: &str) {
        self.lock().connected = false;
        if let Some(listener) = self.current_listener() {
            listener.on_disconnect(reason);
        }
    }

    /// Simulate the broker refusing a subscription after startup.
    pub fn fail_subscription(&self, topic: &str, reason: &str) {
        if let Some(listener) = self.current_listener() {
            listener.on_subscription_failed(BridgeError::Subscription {
                topic: topic.to_string(),
                reason: reason.to_string(),
            });
        }
    }

    /// Simulate a successful reconnect.
    pub fn restore_connection(&self) {
        self.lock().connected = true;
        if let Some(listener) = self.current_listener() {
            listener.on_connect();
        }
    }
}

impl Transport for MemoryTransport {
    fn connect(
        &self,
        endpoint: &MqttEndpoint,
        _credentials: Option<&Credentials>,
    ) -> Result<(), BridgeError> {
        let mut state = self.lock();
        if state.refuse_connect {
            return Err(BridgeError::TransportUnavailable(format!(
                "connection to {} refused",
                endpoint
            )));
        }
        state.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), BridgeError> {
        let mut state = self.lock();
        if state.reject_subscribe.contains(topic) {
            return Err(BridgeError::Subscription {
                topic: topic.to_string(),
                reason: "not authorized".to_string(),
            });
        }
        if let Some(max) = state.max_subscribe_qos {
            if u8::from(qos) > u8::from(max) {
                return Err(BridgeError::Subscription {
                    topic: topic.to_string(),
                    reason: format!("{} not supported", qos),
                });
            }
        }
        state.subscriptions.push((topic.to_string(), qos));
        Ok(())
    }

    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), BridgeError> {
        let mut state = self.lock();
        if state.reject_publish.contains(topic) {
            return Err(BridgeError::Publish {
                topic: topic.to_string(),
                reason: "request queue full".to_string(),
            });
        }
        state.published.push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        });
        Ok(())
    }

    fn set_listener(&self, listener: Option<Arc<dyn TransportListener>>) {
        if let Ok(mut slot) = self.listener.write() {
            *slot = listener;
        }
    }

    fn loop_start(&self) -> Result<(), BridgeError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(BridgeError::TransportUnavailable("not connected".into()));
        }
        state.looping = true;
        Ok(())
    }

    fn loop_stop(&self) {
        self.lock().looping = false;
    }

    fn disconnect(&self) -> Result<(), BridgeError> {
        let mut state = self.lock();
        state.connected = false;
        state.disconnects += 1;
        Ok(())
    }
}
