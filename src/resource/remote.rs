//! Thin request-builders over [`ProtocolClient`] for interacting with a
//! point's live counterpart in the container: simulating/sharing feed
//! data, asking or telling a control, and reading back recent samples.
//!
//! Grounded on `original_source/3rd/IoticAgent/IOT/{Point.py}`'s
//! `Point.share`/`RemoteFeed.simulate`/`RemoteControl.{ask,tell}` pattern:
//! these are plain request/response round trips through the same
//! [`crate::protocol::ProtocolClient`] used for metadata, just with a
//! point-data payload instead of a metadata one. The auto-encode/decode
//! rules for that payload (spec.md §4.E) live here too, since both the
//! remote wrappers and the flush pool's share step need them.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;

use crate::codec::ubjson::InnerRequest;
use crate::constants::{self, ACTION_LIST, ACTION_UPDATE, RESOURCE_CONTROL, RESOURCE_FEED};
use crate::error::QapiError;
use crate::link::BrokerTransport;
use crate::protocol::ProtocolClient;

/// Caller-supplied share payload before MIME auto-detection.
#[derive(Debug, Clone, PartialEq)]
pub enum ShareInput {
    Bytes(Vec<u8>),
    Text(String),
    Mapping(serde_json::Map<String, Value>),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EncodeError {
    #[error("mime '{0}' given but data is not raw bytes")]
    MimeWithoutBytes(String),
    #[error("invalid mime: {0}")]
    InvalidMime(#[from] crate::codec::validate::ValidationError),
    #[error("failed to encode mapping payload: {0}")]
    Mapping(String),
}

/// A decoded inbound share/feed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedShare {
    Mapping(Value),
    Text(String),
    Raw { data: Vec<u8>, mime: String },
}

/// Applies spec.md §4.E's auto-encode rule: an explicit `mime` always wins
/// (and requires the caller to have already encoded to bytes); otherwise
/// the payload shape picks the encoding — a mapping goes out as the inner
/// UBJSON-like codec (`idx/1`), text as UTF-8 (`idx/2`), and raw bytes as
/// an opaque octet stream.
pub fn auto_encode(input: &ShareInput, mime: Option<&str>) -> Result<(Vec<u8>, String), EncodeError> {
    if let Some(mime) = mime {
        let mime = crate::codec::validate::mime(mime)?;
        return match input {
            ShareInput::Bytes(b) => Ok((b.clone(), mime)),
            _ => Err(EncodeError::MimeWithoutBytes(mime)),
        };
    }
    match input {
        ShareInput::Bytes(b) => Ok((b.clone(), "application/octet-stream".to_string())),
        ShareInput::Text(s) => Ok((s.as_bytes().to_vec(), "idx/2".to_string())),
        ShareInput::Mapping(m) => {
            let value = Value::Object(m.clone());
            let bytes = rmp_serde::to_vec_named(&value).map_err(|e| EncodeError::Mapping(e.to_string()))?;
            Ok((bytes, "idx/1".to_string()))
        }
    }
}

/// The receive-side counterpart of [`auto_encode`]: decodes an inbound
/// payload according to its MIME type.
#[must_use]
pub fn auto_decode(mime: &str, data: &[u8]) -> DecodedShare {
    let expanded = constants::expand_idx_mimetype(mime);
    if expanded == "application/ubjson" {
        if let Ok(value) = rmp_serde::from_slice::<Value>(data) {
            return DecodedShare::Mapping(value);
        }
    }
    if expanded.starts_with("text/plain") {
        if let Ok(text) = std::str::from_utf8(data) {
            return DecodedShare::Text(text.to_string());
        }
    }
    DecodedShare::Raw { data: data.to_vec(), mime: mime.to_string() }
}

/// Outcome of [`RemoteControl::tell`]: whether the subscriber acknowledged
/// the control request within the given timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TellOutcome {
    Success,
    Timeout,
    Failed,
    Unreachable,
}

impl TellOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Timeout => "timeout",
            Self::Failed => "failed",
            Self::Unreachable => "unreachable",
        }
    }
}

fn payload_for(lid: &str, pid: &str, data: &[u8], mime: &str) -> Value {
    json!({ "lid": lid, "pid": pid, "data": data, "mime": mime })
}

/// A handle for interacting with a feed's live container-side counterpart.
pub struct RemoteFeed<T: BrokerTransport + 'static> {
    client: Arc<ProtocolClient<T>>,
    lid: String,
    pid: String,
}

impl<T: BrokerTransport + 'static> RemoteFeed<T> {
    #[must_use]
    pub fn new(client: Arc<ProtocolClient<T>>, lid: &str, pid: &str) -> Self {
        Self { client, lid: lid.to_string(), pid: pid.to_string() }
    }

    /// Pushes one sample of feed data through the container as if the
    /// owning thing had shared it, for exercising subscribers without
    /// driving real sensor data.
    pub fn simulate(&self, input: &ShareInput, mime: Option<&str>) -> Result<(), QapiError> {
        let (data, mime) = auto_encode(input, mime).map_err(|e| QapiError::ValidationError(e.to_string()))?;
        let req = InnerRequest {
            r: RESOURCE_FEED,
            t: ACTION_UPDATE,
            c: None,
            a: None,
            p: Some(payload_for(&self.lid, &self.pid, &data, &mime)),
            g: None,
        };
        let event = self.client.send_request(req, false)?;
        event.wait(Some(self.client_socket_timeout()))?;
        Ok(())
    }

    /// Requests up to `count` of the feed's most recent retained samples.
    pub fn get_recent(&self, count: u32) -> Result<Vec<Value>, QapiError> {
        let req = InnerRequest {
            r: RESOURCE_FEED,
            t: ACTION_LIST,
            c: None,
            a: None,
            p: Some(json!({ "lid": self.lid, "pid": self.pid, "count": count })),
            g: None,
        };
        let event = self.client.send_request(req, false)?;
        if !event.wait(Some(self.client_socket_timeout()))? {
            return Err(QapiError::SyncTimeout);
        }
        Ok(event
            .payload()
            .and_then(|p| p.get("samples").cloned())
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default())
    }

    fn client_socket_timeout(&self) -> Duration {
        self.client.socket_timeout()
    }
}

/// A handle for interacting with a control's live container-side
/// counterpart.
pub struct RemoteControl<T: BrokerTransport + 'static> {
    client: Arc<ProtocolClient<T>>,
    lid: String,
    pid: String,
}

impl<T: BrokerTransport + 'static> RemoteControl<T> {
    #[must_use]
    pub fn new(client: Arc<ProtocolClient<T>>, lid: &str, pid: &str) -> Self {
        Self { client, lid: lid.to_string(), pid: pid.to_string() }
    }

    /// Fire-and-forget control request: the calling thing's listener
    /// receives it, but no acknowledgement is awaited beyond the
    /// container accepting the request.
    pub fn ask(&self, input: &ShareInput, mime: Option<&str>) -> Result<(), QapiError> {
        let (data, mime) = auto_encode(input, mime).map_err(|e| QapiError::ValidationError(e.to_string()))?;
        let mut payload = payload_for(&self.lid, &self.pid, &data, &mime);
        payload["confirm"] = json!(false);
        let req = InnerRequest { r: RESOURCE_CONTROL, t: ACTION_UPDATE, c: None, a: None, p: Some(payload), g: None };
        let event = self.client.send_request(req, true)?;
        event.wait(Some(self.client.socket_timeout()))?;
        Ok(())
    }

    /// Control request requiring the subscriber to acknowledge receipt
    /// within `timeout`.
    pub fn tell(&self, input: &ShareInput, timeout: Duration, mime: Option<&str>) -> TellOutcome {
        let (data, mime) = match auto_encode(input, mime) {
            Ok(v) => v,
            Err(_) => return TellOutcome::Failed,
        };
        let mut payload = payload_for(&self.lid, &self.pid, &data, &mime);
        payload["confirm"] = json!(true);
        payload["timeout"] = json!(timeout.as_secs());
        let req = InnerRequest { r: RESOURCE_CONTROL, t: ACTION_UPDATE, c: None, a: None, p: Some(payload), g: None };
        let event = match self.client.send_request(req, true) {
            Ok(e) => e,
            Err(QapiError::LinkError(_) | QapiError::LinkShutdown) => return TellOutcome::Unreachable,
            Err(_) => return TellOutcome::Failed,
        };
        match event.wait(Some(timeout)) {
            Ok(true) => TellOutcome::Success,
            Ok(false) => TellOutcome::Timeout,
            Err(QapiError::LinkError(_) | QapiError::LinkShutdown) => TellOutcome::Unreachable,
            Err(_) => TellOutcome::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_encode_text_uses_idx2() {
        let (bytes, mime) = auto_encode(&ShareInput::Text("hello".into()), None).unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(mime, "idx/2");
    }

    #[test]
    fn test_auto_encode_mapping_uses_idx1() {
        let mut map = serde_json::Map::new();
        map.insert("temp".into(), json!(21.5));
        let (_, mime) = auto_encode(&ShareInput::Mapping(map), None).unwrap();
        assert_eq!(mime, "idx/1");
    }

    #[test]
    fn test_auto_encode_explicit_mime_requires_bytes() {
        assert!(auto_encode(&ShareInput::Text("x".into()), Some("text/csv")).is_err());
        assert!(auto_encode(&ShareInput::Bytes(vec![1, 2, 3]), Some("application/octet-stream")).is_ok());
    }

    #[test]
    fn test_auto_decode_round_trips_text() {
        let decoded = auto_decode("idx/2", b"hello world");
        assert_eq!(decoded, DecodedShare::Text("hello world".to_string()));
    }

    #[test]
    fn test_auto_decode_unknown_mime_falls_back_to_raw() {
        let decoded = auto_decode("application/octet-stream", &[1, 2, 3]);
        assert_eq!(decoded, DecodedShare::Raw { data: vec![1, 2, 3], mime: "application/octet-stream".into() });
    }

    #[test]
    fn test_tell_outcome_as_str() {
        assert_eq!(TellOutcome::Success.as_str(), "success");
        assert_eq!(TellOutcome::Unreachable.as_str(), "unreachable");
    }
}
