//! Wire protocol for control messages
//!
//! Scalar control messages travel as `{"type": <string>, "value": <number>}`.
//! Richer messages (song info, action requests) are JSON objects carrying a
//! `type` discriminator plus free-form fields; unrecognized types decode
//! into a raw fallback so newer peers stay compatible. Decoding is pure
//! lookup - no business logic lives here.

use serde_json::{json, Map, Value};

use crate::error::SessionError;

pub const MSG_FLASH: &str = "flash";
pub const MSG_SOUND: &str = "sound";
pub const MSG_COLOR: &str = "color";
pub const MSG_TIMESYNC: &str = "timesync";
pub const MSG_TIMESTAMP: &str = "timestamp";
pub const MSG_HEARTBEAT: &str = "heartbeat";
pub const MSG_SONG_INFO: &str = "songinfo";

/// Recording/playback control requests carried as free-form JSON
pub const ACTION_REQUEST_KINDS: &[&str] = &[
    "startRecord",
    "stopRecord",
    "startPlay",
    "stopPlay",
    "startStream",
    "stopStream",
];

/// A decoded control message
///
/// The sender is not part of the wire shape; the session controller
/// attaches it from the delivering transport handle.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Flash { value: f64 },
    Sound { value: f64 },
    Color { value: f64 },
    /// Request to start a timestamp exchange; value is the sample count
    TimeSync { value: f64 },
    /// A timestamp probe or its echo
    Timestamp { value: f64 },
    /// Liveness probe; value is the sender's adjusted current time
    Heartbeat { value: f64 },
    /// Free-form song metadata
    SongInfo(Map<String, Value>),
    /// Recording/playback control request
    ActionRequest { kind: String, body: Map<String, Value> },
    /// Unrecognized type, forwarded as-is
    Raw { kind: String, body: Map<String, Value> },
}

impl Message {
    /// Build one of the six scalar messages from its type string
    pub fn scalar(kind: &str, value: f64) -> Option<Message> {
        match kind {
            MSG_FLASH => Some(Message::Flash { value }),
            MSG_SOUND => Some(Message::Sound { value }),
            MSG_COLOR => Some(Message::Color { value }),
            MSG_TIMESYNC => Some(Message::TimeSync { value }),
            MSG_TIMESTAMP => Some(Message::Timestamp { value }),
            MSG_HEARTBEAT => Some(Message::Heartbeat { value }),
            _ => None,
        }
    }

    /// The wire `type` string
    pub fn kind(&self) -> &str {
        match self {
            Message::Flash { .. } => MSG_FLASH,
            Message::Sound { .. } => MSG_SOUND,
            Message::Color { .. } => MSG_COLOR,
            Message::TimeSync { .. } => MSG_TIMESYNC,
            Message::Timestamp { .. } => MSG_TIMESTAMP,
            Message::Heartbeat { .. } => MSG_HEARTBEAT,
            Message::SongInfo(_) => MSG_SONG_INFO,
            Message::ActionRequest { kind, .. } | Message::Raw { kind, .. } => kind,
        }
    }

    /// Serialize to the wire shape
    pub fn encode(&self) -> Result<Vec<u8>, SessionError> {
        let value = match self {
            Message::Flash { value }
            | Message::Sound { value }
            | Message::Color { value }
            | Message::TimeSync { value }
            | Message::Timestamp { value }
            | Message::Heartbeat { value } => json!({ "type": self.kind(), "value": value }),
            Message::SongInfo(body) => {
                let mut body = body.clone();
                body.insert("type".to_string(), Value::String(MSG_SONG_INFO.to_string()));
                Value::Object(body)
            }
            Message::ActionRequest { kind, body } | Message::Raw { kind, body } => {
                let mut body = body.clone();
                body.insert("type".to_string(), Value::String(kind.clone()));
                Value::Object(body)
            }
        };
        serde_json::to_vec(&value).map_err(|e| SessionError::MalformedMessage(e.to_string()))
    }

    /// Parse a wire payload
    ///
    /// Fails with [`SessionError::MalformedMessage`] when the payload is not
    /// a JSON object, the `type` key is missing, or a scalar type carries a
    /// missing/non-numeric `value`.
    pub fn decode(bytes: &[u8]) -> Result<Message, SessionError> {
        let payload: Value = serde_json::from_slice(bytes)
            .map_err(|e| SessionError::MalformedMessage(e.to_string()))?;
        let Value::Object(mut body) = payload else {
            return Err(SessionError::MalformedMessage(
                "payload is not a JSON object".to_string(),
            ));
        };

        let kind = body
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::MalformedMessage("missing `type` key".to_string()))?
            .to_string();

        match kind.as_str() {
            MSG_FLASH | MSG_SOUND | MSG_COLOR | MSG_TIMESYNC | MSG_TIMESTAMP | MSG_HEARTBEAT => {
                let value = body.get("value").and_then(Value::as_f64).ok_or_else(|| {
                    SessionError::MalformedMessage(format!(
                        "`{kind}` requires a numeric `value`"
                    ))
                })?;
                Message::scalar(&kind, value).ok_or_else(|| {
                    SessionError::MalformedMessage(format!("unknown scalar type `{kind}`"))
                })
            }
            MSG_SONG_INFO => {
                body.remove("type");
                Ok(Message::SongInfo(body))
            }
            k if ACTION_REQUEST_KINDS.contains(&k) => {
                body.remove("type");
                Ok(Message::ActionRequest { kind, body })
            }
            _ => {
                body.remove("type");
                Ok(Message::Raw { kind, body })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trip() {
        let msg = Message::Flash { value: 1.0 };
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, Message::Flash { value: 1.0 });
        assert_eq!(decoded.kind(), "flash");
    }

    #[test]
    fn test_missing_value_is_malformed() {
        let err = Message::decode(br#"{"type":"flash"}"#).unwrap_err();
        assert!(matches!(err, SessionError::MalformedMessage(_)));
    }

    #[test]
    fn test_non_numeric_value_is_malformed() {
        let err = Message::decode(br#"{"type":"color","value":"red"}"#).unwrap_err();
        assert!(matches!(err, SessionError::MalformedMessage(_)));
    }

    #[test]
    fn test_missing_type_is_malformed() {
        let err = Message::decode(br#"{"value":3}"#).unwrap_err();
        assert!(matches!(err, SessionError::MalformedMessage(_)));
    }

    #[test]
    fn test_non_object_is_malformed() {
        assert!(Message::decode(b"[1,2,3]").is_err());
        assert!(Message::decode(b"not json at all").is_err());
    }

    #[test]
    fn test_type_is_case_sensitive() {
        // "Flash" is not a recognized scalar type; it falls through to Raw
        let decoded = Message::decode(br#"{"type":"Flash","value":1}"#).unwrap();
        assert!(matches!(decoded, Message::Raw { ref kind, .. } if kind == "Flash"));
    }

    #[test]
    fn test_song_info_keeps_free_form_fields() {
        let bytes = br#"{"type":"songinfo","title":"Aurora","notes":[60,64,67]}"#;
        let decoded = Message::decode(bytes).unwrap();
        let Message::SongInfo(body) = &decoded else {
            panic!("expected song info");
        };
        assert_eq!(body.get("title").unwrap(), "Aurora");

        // And survives re-encoding
        let round = Message::decode(&decoded.encode().unwrap()).unwrap();
        assert_eq!(round, decoded);
    }

    #[test]
    fn test_action_request_kinds() {
        let bytes = br#"{"type":"startRecord","playerID":"abc"}"#;
        let decoded = Message::decode(bytes).unwrap();
        assert!(
            matches!(decoded, Message::ActionRequest { ref kind, .. } if kind == "startRecord")
        );
    }

    #[test]
    fn test_unknown_type_decodes_to_raw() {
        let decoded = Message::decode(br#"{"type":"confetti","value":9}"#).unwrap();
        assert!(matches!(decoded, Message::Raw { ref kind, .. } if kind == "confetti"));
    }
}
