//! Payload schemas per sub-device kind.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::BridgeError;

/// What a sub-device accepts on its command topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubDeviceKind {
    /// Read-only numeric sensor. Never acknowledges.
    Reading,
    /// On/off actuator. Echoes the confirmed state to its state topic.
    Switch,
}

impl SubDeviceKind {
    /// Default kind for the sub-devices HomeManager knows by name.
    pub fn for_name(name: &str) -> Option<Self> {
        match name {
            "WR_PSS" => Some(Self::Reading),
            "TUV" => Some(Self::Switch),
            _ => None,
        }
    }

    pub fn requires_ack(&self) -> bool {
        matches!(self, Self::Switch)
    }

    pub fn parse(&self, sub_device: &str, payload: &[u8]) -> Result<SubDeviceValue, BridgeError> {
        let malformed = |reason: String| BridgeError::MalformedPayload {
            sub_device: sub_device.to_string(),
            reason,
        };
        let text = std::str::from_utf8(payload)
            .map_err(|_| malformed("payload is not UTF-8".to_string()))?
            .trim();

        match self {
            Self::Reading => {
                let value: f64 = text
                    .parse()
                    .map_err(|_| malformed(format!("'{}' is not a number", text)))?;
                if !value.is_finite() {
                    return Err(malformed(format!("'{}' is not a finite number", text)));
                }
                Ok(SubDeviceValue::Reading(value))
            }
            Self::Switch => match text.to_ascii_lowercase().as_str() {
                "on" | "true" | "1" => Ok(SubDeviceValue::Switch(true)),
                "off" | "false" | "0" => Ok(SubDeviceValue::Switch(false)),
                _ => Err(malformed(format!("'{}' is not an on/off token", text))),
            },
        }
    }
}

impl fmt::Display for SubDeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reading => write!(f, "reading"),
            Self::Switch => write!(f, "switch"),
        }
    }
}

/// A parsed sub-device value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SubDeviceValue {
    Reading(f64),
    Switch(bool),
}

impl SubDeviceValue {
    pub fn kind(&self) -> SubDeviceKind {
        match self {
            Self::Reading(_) => SubDeviceKind::Reading,
            Self::Switch(_) => SubDeviceKind::Switch,
        }
    }

    /// Wire form published on state topics.
    pub fn to_payload(&self) -> String {
        match self {
            Self::Reading(value) => value.to_string(),
            Self::Switch(true) => "ON".to_string(),
            Self::Switch(false) => "OFF".to_string(),
        }
    }
}

impl fmt::Display for SubDeviceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reading_accepts_numbers() {
        let kind = SubDeviceKind::Reading;
        assert_eq!(
            kind.parse("WR_PSS", b"512").unwrap(),
            SubDeviceValue::Reading(512.0)
        );
        assert_eq!(
            kind.parse("WR_PSS", b" -12.5\n").unwrap(),
            SubDeviceValue::Reading(-12.5)
        );
    }

    #[test]
    fn reading_rejects_non_numbers() {
        let kind = SubDeviceKind::Reading;
        let payloads: [&[u8]; 6] = [b"abc", b"", b"NaN", b"inf", b"12W", &[0xff, 0xfe]];
        for payload in payloads {
            let err = kind.parse("WR_PSS", payload).unwrap_err();
            assert!(matches!(err, BridgeError::MalformedPayload { .. }));
        }
    }

    #[test]
    fn switch_accepts_tokens_case_insensitively() {
        let kind = SubDeviceKind::Switch;
        for on in ["ON", "on", "On", "true", "1"] {
            assert_eq!(
                kind.parse("TUV", on.as_bytes()).unwrap(),
                SubDeviceValue::Switch(true)
            );
        }
        for off in ["OFF", "off", "false", "0"] {
            assert_eq!(
                kind.parse("TUV", off.as_bytes()).unwrap(),
                SubDeviceValue::Switch(false)
            );
        }
        assert!(kind.parse("TUV", b"toggle").is_err());
    }

    #[test]
    fn payload_serialization() {
        assert_eq!(SubDeviceValue::Reading(512.0).to_payload(), "512");
        assert_eq!(SubDeviceValue::Reading(12.5).to_payload(), "12.5");
        assert_eq!(SubDeviceValue::Switch(true).to_payload(), "ON");
        assert_eq!(SubDeviceValue::Switch(false).to_payload(), "OFF");
    }

    #[test]
    fn known_names_have_default_kinds() {
        assert_eq!(SubDeviceKind::for_name("WR_PSS"), Some(SubDeviceKind::Reading));
        assert_eq!(SubDeviceKind::for_name("TUV"), Some(SubDeviceKind::Switch));
        assert_eq!(SubDeviceKind::for_name("GARAGE"), None);
        assert!(SubDeviceKind::Switch.requires_ack());
        assert!(!SubDeviceKind::Reading.requires_ack());
    }
}
