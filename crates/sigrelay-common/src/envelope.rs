//! Signaling envelope codec.
//!
//! An envelope is a flat JSON object with five string fields:
//!
//! ```json
//! {"type":"offer","data":"...","room":"r1","from":"alice","to":""}
//! ```
//!
//! `type` and `data` are opaque to the relay. Unknown fields are ignored,
//! missing or `null` fields decode as empty strings. Only input that is not a
//! JSON object at all is rejected.

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// The minimal routing envelope around an opaque signaling payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Envelope {
    /// Message kind, e.g. `offer`, `answer`, `candidate`. Never interpreted.
    #[serde(rename = "type", deserialize_with = "null_as_empty")]
    pub kind: String,
    /// Opaque payload.
    #[serde(deserialize_with = "null_as_empty")]
    pub data: String,
    /// Room the sender believes it is in.
    #[serde(deserialize_with = "null_as_empty")]
    pub room: String,
    /// Sender identity.
    #[serde(deserialize_with = "null_as_empty")]
    pub from: String,
    /// Recipient identity; empty means broadcast to the room.
    #[serde(deserialize_with = "null_as_empty")]
    pub to: String,
}

/// Errors that can occur while decoding an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The input is not a JSON object (array, scalar, `null` or empty).
    #[error("envelope is not a JSON object")]
    NotAnObject,
    /// The input is not well-formed JSON or a field has the wrong type.
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl Envelope {
    /// Creates an envelope addressed to every other member of `room`.
    #[must_use]
    pub fn broadcast(kind: &str, data: &str, room: &str, from: &str) -> Self {
        Self {
            kind: kind.to_string(),
            data: data.to_string(),
            room: room.to_string(),
            from: from.to_string(),
            to: String::new(),
        }
    }

    /// Creates an envelope addressed to a single identity in `room`.
    #[must_use]
    pub fn targeted(kind: &str, data: &str, room: &str, from: &str, to: &str) -> Self {
        Self {
            to: to.to_string(),
            ..Self::broadcast(kind, data, room, from)
        }
    }

    /// Decodes raw message bytes into an envelope.
    ///
    /// Pure: no side effects on failure.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError`] if `bytes` is not a well-formed JSON object
    /// or a known field holds a non-string value.
    ///
    /// # Examples
    ///
    /// ```
    /// use sigrelay_common::Envelope;
    /// let env = Envelope::decode(br#"{"type":"offer","from":"a","extra":1}"#).unwrap();
    /// assert_eq!(env.kind, "offer");
    /// assert!(env.is_broadcast());
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.trim_ascii_start().first() != Some(&b'{') {
            return Err(EnvelopeError::NotAnObject);
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encodes the envelope as compact JSON.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Json`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Sender identity, if the envelope carries one.
    #[must_use]
    pub fn sender(&self) -> Option<&str> {
        (!self.from.is_empty()).then_some(self.from.as_str())
    }

    /// Targeted recipient, or `None` for a room broadcast.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        (!self.to.is_empty()).then_some(self.to.as_str())
    }

    /// Returns `true` if the envelope is addressed to the whole room.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.to.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_full_envelope() {
        let env =
            Envelope::decode(br#"{"type":"offer","data":"x","room":"r1","from":"A","to":"B"}"#)
                .unwrap();
        assert_eq!(env, Envelope::targeted("offer", "x", "r1", "A", "B"));
        assert_eq!(env.sender(), Some("A"));
        assert_eq!(env.target(), Some("B"));
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let env = Envelope::decode(b"{}").unwrap();
        assert_eq!(env, Envelope::default());
        assert!(env.sender().is_none());
        assert!(env.is_broadcast());
    }

    #[test]
    fn null_fields_decode_as_empty() {
        let env = Envelope::decode(br#"{"from":"A","to":null,"data":null}"#).unwrap();
        assert_eq!(env.from, "A");
        assert!(env.to.is_empty());
        assert!(env.data.is_empty());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let env = Envelope::decode(br#"{"from":"A","sdpMid":"0","ttl":5,"nested":{"k":[1]}}"#)
            .unwrap();
        assert_eq!(env.from, "A");
    }

    #[test]
    fn leading_whitespace_is_accepted() {
        let env = Envelope::decode(b" \n\t{\"from\":\"A\"}").unwrap();
        assert_eq!(env.from, "A");
    }

    #[test]
    fn non_object_json_is_rejected() {
        for input in [&b"[]"[..], b"[\"offer\"]", b"\"offer\"", b"42", b"null", b"true"] {
            assert!(
                matches!(Envelope::decode(input), Err(EnvelopeError::NotAnObject)),
                "accepted {:?}",
                String::from_utf8_lossy(input)
            );
        }
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(
            Envelope::decode(b""),
            Err(EnvelopeError::NotAnObject)
        ));
        assert!(matches!(
            Envelope::decode(b"   "),
            Err(EnvelopeError::NotAnObject)
        ));
    }

    #[test]
    fn truncated_object_is_rejected() {
        assert!(matches!(
            Envelope::decode(br#"{"type":"offer","#),
            Err(EnvelopeError::Json(_))
        ));
    }

    #[test]
    fn non_string_field_is_rejected() {
        assert!(matches!(
            Envelope::decode(br#"{"from":"A","data":{"sdp":"v=0"}}"#),
            Err(EnvelopeError::Json(_))
        ));
    }

    #[test]
    fn encode_uses_wire_field_names() {
        let bytes = Envelope::broadcast("candidate", "c", "r1", "A")
            .encode()
            .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains(r#""type":"candidate""#));
        assert!(text.contains(r#""to":"""#));
        assert!(!text.contains("kind"));
    }
}
