//! Transport layer for the bridge.
//!
//! The core never touches sockets. It talks to the broker through the
//! `Transport` trait and receives connection and message callbacks through a
//! single registered `TransportListener`.
//!
//! - `mqtt`: network transport on top of the synchronous `rumqttc` v5 client.
//! - `memory`: in-memory transport that records traffic, used by tests.
//! - `tls`: broker endpoint parsing and TLS material loading.

pub mod memory;
pub mod mqtt;
mod tls;

use std::fmt;
use std::sync::Arc;

use crate::{BridgeError, QosLevel};

pub use memory::{MemoryTransport, PublishedMessage};
pub use mqtt::MqttTransport;
pub use tls::{parse_mqtt_endpoint, MqttEndpoint, TlsMaterials};

/// Broker credentials.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: Option<String>) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }
}

// Passwords stay out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Callbacks a transport delivers on its receive thread.
///
/// Implementations must return quickly: the receive thread is blocked for
/// the duration of every call.
pub trait TransportListener: Send + Sync {
    fn on_connect(&self);
    fn on_disconnect(&self, reason: &str);
    fn on_message(&self, topic: &str, payload: &[u8], qos: QosLevel);
    /// The broker refused a subscription made while the receive thread runs.
    fn on_subscription_failed(&self, error: BridgeError);
}

/// Operations the core performs on the MQTT session.
pub trait Transport: Send + Sync {
    /// Open the session. Blocks until the broker accepts or refuses it.
    fn connect(
        &self,
        endpoint: &MqttEndpoint,
        credentials: Option<&Credentials>,
    ) -> Result<(), BridgeError>;

    fn is_connected(&self) -> bool;

    fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), BridgeError>;

    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), BridgeError>;

    /// Replace the listener. `None` detaches callbacks.
    fn set_listener(&self, listener: Option<Arc<dyn TransportListener>>);

    /// Start the background receive thread.
    fn loop_start(&self) -> Result<(), BridgeError>;

    /// Halt the receive thread. Returns once any in-flight callback is done.
    fn loop_stop(&self);

    /// Close the session. Must not fail on an already closed session.
    fn disconnect(&self) -> Result<(), BridgeError>;
}
