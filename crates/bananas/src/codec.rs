//! Framed payload codec.
//!
//! Serialized payloads carry a single leading tag byte identifying the
//! codec: `0x00` for JSON, `0x01` for the binary-structured form. Payloads
//! beginning with ASCII `{` or `[` and no tag are accepted as legacy
//! untagged JSON. Unknown tags are refused in both directions.

use crate::error::{BananasError, BananasResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Tag byte for JSON-encoded payload bodies.
pub const TAG_JSON: u8 = 0x00;

/// Tag byte for binary-structured payload bodies.
pub const TAG_BINARY: u8 = 0x01;

/// A decoded payload: the codec tag and a borrowed view of the body bytes.
///
/// Decoding never copies or re-encodes the body, so encode-then-decode is
/// the identity on the body for both tagged forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload<'a> {
    /// JSON body (tagged `0x00` or legacy untagged).
    Json(&'a [u8]),
    /// Opaque binary-structured body (tagged `0x01`).
    Binary(&'a [u8]),
}

impl<'a> Payload<'a> {
    /// The raw body bytes, whichever form they are in.
    pub fn body(&self) -> &'a [u8] {
        match self {
            Payload::Json(b) | Payload::Binary(b) => b,
        }
    }
}

/// Encode a value as a tagged JSON payload.
pub fn encode_json<T: Serialize>(value: &T) -> BananasResult<Vec<u8>> {
    let body = serde_json::to_vec(value)?;
    let mut framed = Vec::with_capacity(body.len() + 1);
    framed.push(TAG_JSON);
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Frame already-serialized bytes as a binary-structured payload.
///
/// The body is treated as opaque; it round-trips byte-identically.
pub fn encode_binary(body: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(body.len() + 1);
    framed.push(TAG_BINARY);
    framed.extend_from_slice(body);
    framed
}

/// Decode a framed payload, refusing unknown tags.
pub fn decode(bytes: &[u8]) -> BananasResult<Payload<'_>> {
    let (&tag, body) = bytes
        .split_first()
        .ok_or_else(|| BananasError::MalformedPayload("empty payload".to_string()))?;

    match tag {
        TAG_JSON => Ok(Payload::Json(body)),
        TAG_BINARY => Ok(Payload::Binary(body)),
        // Legacy untagged JSON objects and arrays.
        b'{' | b'[' => Ok(Payload::Json(bytes)),
        other => Err(BananasError::UnsupportedPayloadTag(other)),
    }
}

/// Decode a payload expected to be JSON and deserialize its body.
pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> BananasResult<T> {
    match decode(bytes)? {
        Payload::Json(body) => Ok(serde_json::from_slice(body)?),
        Payload::Binary(_) => Err(BananasError::MalformedPayload(
            "expected a JSON payload, found a binary-structured one".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip() {
        let framed = encode_json(&json!({"x": 1})).unwrap();
        assert_eq!(framed[0], TAG_JSON);

        let value: serde_json::Value = decode_json(&framed).unwrap();
        assert_eq!(value, json!({"x": 1}));
    }

    #[test]
    fn binary_round_trip_is_identity() {
        let body = vec![0x01, 0xff, 0x00, 0x42];
        let framed = encode_binary(&body);

        match decode(&framed).unwrap() {
            Payload::Binary(decoded) => assert_eq!(decoded, body.as_slice()),
            other => panic!("expected binary payload, got {:?}", other),
        }
    }

    #[test]
    fn legacy_untagged_json_accepted() {
        let raw = br#"{"x":1}"#;
        match decode(raw).unwrap() {
            Payload::Json(body) => assert_eq!(body, raw),
            other => panic!("expected json payload, got {:?}", other),
        }

        let value: serde_json::Value = decode_json(br#"[1,2,3]"#).unwrap();
        assert_eq!(value, json!([1, 2, 3]));
    }

    #[test]
    fn unknown_tag_refused() {
        let err = decode(&[0x7f, 0x01]).unwrap_err();
        assert!(matches!(err, BananasError::UnsupportedPayloadTag(0x7f)));
    }

    #[test]
    fn empty_payload_refused() {
        assert!(matches!(
            decode(&[]),
            Err(BananasError::MalformedPayload(_))
        ));
    }
}
