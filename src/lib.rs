//! HomeManager MQTT bridge
//!
//! This crate exposes a home-automation controller on an MQTT broker as a
//! single logical device. Each sub-device (a power-storage reading, a
//! hot-water switch, ...) owns a command topic and, where it acknowledges
//! commands, a state topic.
//!
//! # Architecture
//!
//! - `transport`: the MQTT session (network client, receive thread,
//!   availability announcement) behind the `Transport` trait, plus an
//!   in-memory implementation for tests.
//! - `device`: `HomeManager`, which owns the topic bindings and the last
//!   known state of every sub-device.
//! - `app`: `App`, the session coordinator registered as the transport's
//!   listener. It is the single dispatch point from inbound messages to
//!   the device.
//! - `shutdown`: the run flag (`ShutdownToken`) and the signal handler
//!   bound to it.
//! - `config` / `logging`: settings bundle and log stream setup.
//!
//! Inbound messages are handled synchronously on the transport's receive
//! thread; the main thread only waits for shutdown.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod app;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod shutdown;
pub mod transport;

pub use app::{App, SessionState};
pub use config::{BridgeConfig, ConfigOverrides};
pub use device::{
    CommandOutcome, DeviceStats, HomeManager, LockoutTopics, SubDeviceKind, SubDeviceState,
    SubDeviceValue, TopicBinding,
};
pub use error::BridgeError;
pub use shutdown::{ShutdownToken, SignalHandler};
pub use transport::{Credentials, Transport, TransportListener};

// -------------------- Device Id --------------------

/// Identity of this bridge instance on the broker.
///
/// Used as the MQTT client identifier and as the root of the default topic
/// namespace, so it may not contain topic separators or wildcards.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Result<Self, BridgeError> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(BridgeError::Config("device id must not be empty".into()));
        }
        if trimmed
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '/' | '+' | '#'))
        {
            return Err(BridgeError::Config(format!(
                "device id '{}' must not contain whitespace, '/', '+' or '#'",
                trimmed
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Topic on which the bridge announces itself online/offline.
    pub fn availability_topic(&self) -> String {
        format!("{}/status", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// -------------------- QoS --------------------

/// MQTT quality-of-service level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QosLevel {
    /// QoS 0
    AtMostOnce,
    /// QoS 1
    #[default]
    AtLeastOnce,
    /// QoS 2
    ExactlyOnce,
}

impl TryFrom<u8> for QosLevel {
    type Error = BridgeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(BridgeError::Config(format!(
                "invalid QoS {}: expected 0, 1 or 2",
                other
            ))),
        }
    }
}

impl From<QosLevel> for u8 {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

impl fmt::Display for QosLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QoS{}", u8::from(*self))
    }
}

// -------------------- Topics --------------------

/// Validate a concrete (non-filter) topic name.
pub fn validate_topic(topic: &str) -> Result<(), BridgeError> {
    if topic.is_empty() {
        return Err(BridgeError::Config("topic must not be empty".into()));
    }
    if topic.contains(['+', '#']) {
        return Err(BridgeError::Config(format!(
            "topic '{}' must not contain wildcards",
            topic
        )));
    }
    if topic.contains('\0') {
        return Err(BridgeError::Config(format!(
            "topic '{}' must not contain NUL",
            topic.escape_default()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_rejects_separators() {
        assert!(DeviceId::new("dev1").is_ok());
        assert!(DeviceId::new("").is_err());
        assert!(DeviceId::new("home/dev1").is_err());
        assert!(DeviceId::new("dev#").is_err());
        assert!(DeviceId::new("my dev").is_err());
    }

    #[test]
    fn device_id_trims_and_derives_availability_topic() {
        let id = DeviceId::new("  dev1 ").unwrap();
        assert_eq!(id.as_str(), "dev1");
        assert_eq!(id.availability_topic(), "dev1/status");
    }

    #[test]
    fn qos_from_u8() {
        assert_eq!(QosLevel::try_from(0).unwrap(), QosLevel::AtMostOnce);
        assert_eq!(QosLevel::try_from(2).unwrap(), QosLevel::ExactlyOnce);
        assert!(QosLevel::try_from(3).is_err());
        assert_eq!(QosLevel::ExactlyOnce.to_string(), "QoS2");
    }

    #[test]
    fn qos_deserializes_from_number() {
        let qos: QosLevel = serde_json::from_str("1").unwrap();
        assert_eq!(qos, QosLevel::AtLeastOnce);
        assert!(serde_json::from_str::<QosLevel>("7").is_err());
    }

    #[test]
    fn topics_reject_wildcards() {
        assert!(validate_topic("home/dev1/TUV/cmd").is_ok());
        assert!(validate_topic("home/+/cmd").is_err());
        assert!(validate_topic("home/#").is_err());
        assert!(validate_topic("").is_err());
    }
}
