//! Control-channel wire format.
//!
//! Every frame is one JSON object tagged by `"type"`:
//!
//! ```json
//! {"type": "register",   "subdomain": "alpha", "authToken": "..."}
//! {"type": "registered", "subdomain": "alpha", "publicUrl": "http://alpha.localhost:8080"}
//! {"type": "error",      "error": "Invalid auth token"}
//! {"type": "request",    "requestId": "...", "method": "GET", "path": "/", "headers": {}, "body": ""}
//! {"type": "response",   "requestId": "...", "statusCode": 200, "headers": {}, "body": "aGk="}
//! ```
//!
//! Agents must send bodies as standard base64. A string that fails to decode
//! is taken as raw UTF-8 text, but that fallback is best-effort only: raw text
//! that happens to be valid base64 (`"ping"`, `"test"`) is decoded as base64.
//!
//! Unknown fields are ignored. An unrecognised `type` decodes to
//! [`ProtocolMessage::Unknown`] so callers can log it instead of failing.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

/// A single control-channel message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProtocolMessage {
    /// Agent -> server: claim a subdomain.
    #[serde(rename_all = "camelCase")]
    Register {
        #[serde(default, deserialize_with = "nullable")]
        subdomain: String,
        #[serde(default, deserialize_with = "nullable")]
        auth_token: String,
    },
    /// Server -> agent: registration accepted.
    #[serde(rename_all = "camelCase")]
    Registered {
        #[serde(default, deserialize_with = "nullable")]
        subdomain: String,
        #[serde(default, deserialize_with = "nullable")]
        public_url: String,
    },
    /// Server -> agent: something the agent sent was refused.
    Error {
        #[serde(default, deserialize_with = "nullable")]
        error: String,
    },
    /// Server -> agent: a public HTTP request to serve.
    Request(RequestFrame),
    /// Agent -> server: the answer to a [`RequestFrame`].
    Response(ResponseFrame),
    /// Any other `type` value.
    #[serde(other)]
    Unknown,
}

impl ProtocolMessage {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Encode as a text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    /// The wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Registered { .. } => "registered",
            Self::Error { .. } => "error",
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Unknown => "unknown",
        }
    }
}

/// A forwarded public request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFrame {
    #[serde(default, deserialize_with = "nullable")]
    pub request_id: String,
    #[serde(default, deserialize_with = "nullable")]
    pub method: String,
    #[serde(default, deserialize_with = "nullable")]
    pub path: String,
    #[serde(default, deserialize_with = "nullable")]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "body")]
    pub body: Vec<u8>,
}

/// An agent's reply, correlated by `request_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    #[serde(default, deserialize_with = "nullable")]
    pub request_id: String,
    #[serde(default, deserialize_with = "nullable")]
    pub status_code: u16,
    #[serde(default, deserialize_with = "nullable")]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "body")]
    pub body: Vec<u8>,
}

/// Treat an explicit JSON `null` like a missing field.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Body bytes: written as standard base64, read leniently.
///
/// Accepted on decode: a base64 string, any other string (taken as raw UTF-8
/// bytes), an array of byte values, or `null`.
mod body {
    use std::fmt;

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        deserializer.deserialize_any(BodyVisitor)
    }

    struct BodyVisitor;

    impl<'de> Visitor<'de> for BodyVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a base64 string, a raw string, or an array of bytes")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(STANDARD
                .decode(v)
                .unwrap_or_else(|_| v.as_bytes().to_vec()))
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(byte) = seq.next_element::<u8>()? {
                out.push(byte);
            }
            Ok(out)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_decode_register() {
        let msg = ProtocolMessage::decode(
            r#"{"type":"register","subdomain":"alpha","authToken":"a-valid-token-123"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ProtocolMessage::Register {
                subdomain: "alpha".into(),
                auth_token: "a-valid-token-123".into(),
            }
        );
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let msg = ProtocolMessage::decode(
            r#"{"type":"register","subdomain":"alpha","authToken":"t","clientVersion":"9.9","extra":{"a":1}}"#,
        )
        .unwrap();
        assert_eq!(msg.kind(), "register");
    }

    #[test]
    fn test_decode_unknown_type() {
        let msg = ProtocolMessage::decode(r#"{"type":"heartbeat","at":12}"#).unwrap();
        assert_eq!(msg, ProtocolMessage::Unknown);
    }

    #[test]
    fn test_decode_missing_type_fails() {
        assert!(ProtocolMessage::decode(r#"{"subdomain":"alpha"}"#).is_err());
        assert!(ProtocolMessage::decode("not json").is_err());
    }

    #[test]
    fn test_response_body_raw_string() {
        // "hi" is not valid padded base64, so it is taken verbatim.
        let msg = ProtocolMessage::decode(
            r#"{"type":"response","requestId":"r1","statusCode":200,"body":"hi"}"#,
        )
        .unwrap();
        let ProtocolMessage::Response(frame) = msg else {
            panic!("expected response");
        };
        assert_eq!(frame.request_id, "r1");
        assert_eq!(frame.status_code, 200);
        assert_eq!(frame.body, b"hi");
        assert!(frame.headers.is_empty());
    }

    #[test]
    fn test_body_text_that_is_valid_base64_is_decoded() {
        let msg = ProtocolMessage::decode(
            r#"{"type":"response","requestId":"r1","statusCode":200,"body":"ping"}"#,
        )
        .unwrap();
        let ProtocolMessage::Response(frame) = msg else {
            panic!("expected response");
        };
        assert_eq!(frame.body, [0xa6, 0x29, 0xe0]);
        assert_ne!(frame.body, b"ping");
    }

    #[test]
    fn test_response_body_base64_and_array() {
        let msg = ProtocolMessage::decode(
            r#"{"type":"response","requestId":"r1","statusCode":201,"body":"aGVsbG8="}"#,
        )
        .unwrap();
        let ProtocolMessage::Response(frame) = msg else {
            panic!("expected response");
        };
        assert_eq!(frame.body, b"hello");

        let msg = ProtocolMessage::decode(
            r#"{"type":"response","requestId":"r2","statusCode":200,"body":[104,105]}"#,
        )
        .unwrap();
        let ProtocolMessage::Response(frame) = msg else {
            panic!("expected response");
        };
        assert_eq!(frame.body, b"hi");
    }

    #[test]
    fn test_nulls_are_absent() {
        let msg = ProtocolMessage::decode(
            r#"{"type":"response","requestId":"r1","statusCode":204,"headers":null,"body":null,"error":null}"#,
        )
        .unwrap();
        let ProtocolMessage::Response(frame) = msg else {
            panic!("expected response");
        };
        assert!(frame.headers.is_empty());
        assert!(frame.body.is_empty());
    }

    #[test]
    fn test_encode_request_uses_camel_case_and_base64() {
        let frame = RequestFrame {
            request_id: "abc".into(),
            method: "POST".into(),
            path: "/submit?x=1".into(),
            headers: HashMap::from([("content-type".into(), "text/plain".into())]),
            body: b"hello".to_vec(),
        };
        let text = ProtocolMessage::Request(frame).encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "request",
                "requestId": "abc",
                "method": "POST",
                "path": "/submit?x=1",
                "headers": {"content-type": "text/plain"},
                "body": "aGVsbG8=",
            })
        );
    }

    #[test]
    fn test_encode_registered_and_error() {
        let registered = ProtocolMessage::Registered {
            subdomain: "alpha".into(),
            public_url: "https://alpha.example.com".into(),
        };
        let value: Value = serde_json::from_str(&registered.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "registered");
        assert_eq!(value["publicUrl"], "https://alpha.example.com");

        let error = ProtocolMessage::error("Invalid auth token");
        let value: Value = serde_json::from_str(&error.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "error", "error": "Invalid auth token"}));
    }
}
