//! Inner message encode/decode.
//!
//! The inner message is the payload carried inside a wrapper frame's `m`
//! field (see [`super`]). Binary (de)serialization is delegated to
//! `rmp-serde` — see DESIGN.md for why a MessagePack-based codec stands in
//! for a genuine UBJSON implementation here — while the shapes and field
//! names mirror spec.md §6.1 exactly (`r`, `t`, `c`, `a`, `p`, `g` for
//! requests; `c`, `t`, `p` for responses).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InnerCodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Outbound request payload (inner message, request direction).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InnerRequest {
    /// Resource code (see `constants::RESOURCE_*`).
    pub r: i64,
    /// Action-type code (see `constants::ACTION_*`).
    pub t: i64,
    /// Client-supplied correlation reference, echoed back unmodified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub c: Option<String>,
    /// Positional string arguments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub a: Option<Vec<String>>,
    /// Structured payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<Value>,
    /// `"offset/limit"` pagination string, only meaningful for `ACTION_LIST`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub g: Option<String>,
}

/// Inbound response/event payload (inner message, response direction).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InnerResponse {
    /// Echoed client-reference, if the container associated one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub c: Option<String>,
    /// Event/response-type code (see `constants::EVENT_*`).
    pub t: i64,
    /// Structured payload (e.g. a `FAILURE_*` code, created resource id,
    /// feed data envelope).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<Value>,
}

pub fn encode_request(msg: &InnerRequest) -> Result<Vec<u8>, InnerCodecError> {
    rmp_serde::to_vec_named(msg).map_err(|e| InnerCodecError::Encode(e.to_string()))
}

pub fn decode_request(bytes: &[u8]) -> Result<InnerRequest, InnerCodecError> {
    rmp_serde::from_slice(bytes).map_err(|e| InnerCodecError::Decode(e.to_string()))
}

pub fn encode_response(msg: &InnerResponse) -> Result<Vec<u8>, InnerCodecError> {
    rmp_serde::to_vec_named(msg).map_err(|e| InnerCodecError::Encode(e.to_string()))
}

pub fn decode_response(bytes: &[u8]) -> Result<InnerResponse, InnerCodecError> {
    rmp_serde::from_slice(bytes).map_err(|e| InnerCodecError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{ACTION_CREATE, EVENT_COMPLETE, RESOURCE_FEED};
    use serde_json::json;

    #[test]
    fn test_request_round_trip() {
        let req = InnerRequest {
            r: RESOURCE_FEED,
            t: ACTION_CREATE,
            c: Some("client-ref-1".to_string()),
            a: Some(vec!["thing-lid".to_string(), "feed-lid".to_string()]),
            p: Some(json!({"label": "temperature"})),
            g: None,
        };
        let bytes = encode_request(&req).unwrap();
        let decoded = decode_request(&bytes).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_request_with_none_fields_round_trips() {
        let req = InnerRequest {
            r: RESOURCE_FEED,
            t: ACTION_CREATE,
            c: None,
            a: None,
            p: None,
            g: None,
        };
        let bytes = encode_request(&req).unwrap();
        let decoded = decode_request(&bytes).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_response_round_trip() {
        let resp = InnerResponse {
            c: Some("client-ref-1".to_string()),
            t: EVENT_COMPLETE,
            p: Some(json!({"guid": "abc123"})),
        };
        let bytes = encode_response(&resp).unwrap();
        let decoded = decode_response(&bytes).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn test_malformed_bytes_rejected() {
        let garbage = [0xff, 0x00, 0x01];
        assert!(decode_request(&garbage).is_err());
    }
}
