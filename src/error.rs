//! Error taxonomy for the bridge.
//!
//! Startup errors (`Config`, `TransportUnavailable`, `Subscription`) are
//! fatal. Per-message errors (`MalformedPayload`, `Publish`) are logged and
//! isolated to the message that caused them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Invalid or missing configuration. Prevents startup.
    #[error("config error: {0}")]
    Config(String),

    /// The transport is not connected or refused to connect.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A subscribe request was rejected by the transport.
    #[error("subscription to '{topic}' rejected: {reason}")]
    Subscription { topic: String, reason: String },

    /// An inbound payload does not match the sub-device schema.
    #[error("malformed payload for {sub_device}: {reason}")]
    MalformedPayload { sub_device: String, reason: String },

    /// A publish could not be queued by the transport.
    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("unknown sub-device '{0}'")]
    UnknownSubDevice(String),

    /// Operation not allowed in the current session state.
    #[error("invalid session state: {0}")]
    InvalidState(String),
}

impl BridgeError {
    /// Whether the error must abort startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::TransportUnavailable(_) | Self::Subscription { .. }
        )
    }
}
