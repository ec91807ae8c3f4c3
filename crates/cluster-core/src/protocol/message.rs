use std::fmt;

use serde::{Deserialize, Serialize};

use crate::intent::JoinIntent;
use crate::service::ServiceType;

/// Side of a pairing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    Initiating,
    Joining,
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiating => f.write_str("initiating"),
            Self::Joining => f.write_str("joining"),
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// One frame of the session websocket protocol.
///
/// Every field is optional and empty fields are left out of the encoding,
/// so each frame only carries what that step of the protocol needs.
///
/// Wire format: `{"passphrase":"..."}`, `{"intent":{...}}`, `{"accepted":true}`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionMessage {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub initiator_address: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub initiator_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub initiator_fingerprint: String,
    /// IPv4 address of the interface used for multicast discovery
    #[serde(skip_serializing_if = "String::is_empty")]
    pub interface: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub passphrase: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<JoinIntent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub confirmed_intents: Vec<JoinIntent>,
    #[serde(skip_serializing_if = "is_false")]
    pub accepted: bool,
    /// Multicast lookup timeout in seconds
    #[serde(skip_serializing_if = "is_zero")]
    pub lookup_timeout: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl SessionMessage {
    pub fn with_passphrase(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: passphrase.into(),
            ..Default::default()
        }
    }

    pub fn with_intent(intent: JoinIntent) -> Self {
        Self {
            intent: Some(intent),
            ..Default::default()
        }
    }

    pub fn with_confirmed(intents: Vec<JoinIntent>) -> Self {
        Self {
            confirmed_intents: intents,
            ..Default::default()
        }
    }

    pub fn accepted() -> Self {
        Self {
            accepted: true,
            ..Default::default()
        }
    }

    /// Final frame of a joining session. An empty error means success.
    pub fn final_message(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Default::default()
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("SessionMessage serialization should not fail")
    }
}

/// In-band close frame.
///
/// Websocket close frames are limited to 125 bytes, which is too short for
/// most error chains, so the cause travels as a regular text frame. It is
/// recognised by having exactly the `control_message` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlClose {
    pub control_message: String,
}

impl ControlClose {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            control_message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ControlClose serialization should not fail")
    }

    /// Returns `None` for any frame that is not a control close frame.
    pub fn from_json(data: &str) -> Option<Self> {
        serde_json::from_str(data).ok()
    }
}

/// Public identity of a daemon, served before any trust exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub address: String,
    /// PEM encoded certificate
    pub certificate: String,
}

/// Body of a session stop request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionStop {
    #[serde(default)]
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_fields_are_omitted() {
        assert_eq!(SessionMessage::default().to_json(), "{}");
        assert_eq!(SessionMessage::accepted().to_json(), r#"{"accepted":true}"#);
        assert_eq!(
            SessionMessage::with_passphrase("a b c d").to_json(),
            r#"{"passphrase":"a b c d"}"#
        );
    }

    #[test]
    fn test_partial_frames_parse() {
        let msg: SessionMessage =
            serde_json::from_str(r#"{"address":"10.0.0.1:9443","lookup_timeout":5}"#).unwrap();
        assert_eq!(msg.address, "10.0.0.1:9443");
        assert_eq!(msg.lookup_timeout, 5);
        assert!(!msg.accepted);
        assert!(msg.intent.is_none());
    }

    #[test]
    fn test_intent_frame() {
        let intent = JoinIntent::new("host-b", "10.0.0.2:9443", "cert", vec![ServiceType::Cluster]);
        let json = SessionMessage::with_intent(intent.clone()).to_json();
        let parsed: SessionMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.intent, Some(intent));
    }

    #[test]
    fn test_control_close_detection() {
        let frame = ControlClose::new("Session timeout exceeded").to_json();
        assert_eq!(frame, r#"{"control_message":"Session timeout exceeded"}"#);
        assert_eq!(
            ControlClose::from_json(&frame).unwrap().control_message,
            "Session timeout exceeded"
        );

        // Session frames are never mistaken for control frames
        assert!(ControlClose::from_json(&SessionMessage::accepted().to_json()).is_none());
        assert!(ControlClose::from_json(r#"{"control_message":"x","error":"y"}"#).is_none());
        assert!(ControlClose::from_json("not json").is_none());
    }

    #[test]
    fn test_role_wire_names() {
        assert_eq!(
            serde_json::to_string(&SessionRole::Initiating).unwrap(),
            "\"initiating\""
        );
        assert_eq!(SessionRole::Joining.to_string(), "joining");
    }
}
