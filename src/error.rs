//! Protocol-level error kinds.
//!
//! These travel with a [`crate::request_table::RequestEvent`] or are
//! returned directly from [`crate::protocol::ProtocolClient`] calls. Setup
//! and I/O failures (config, stash file access, TLS handshake) use
//! `anyhow::Result` instead, matching the teacher's own split between a
//! narrow typed error for protocol-facing code and `anyhow` everywhere else.

use thiserror::Error;

/// Error surfaced by the Link/Protocol layers to callers and stored requests.
#[derive(Debug, Error, Clone)]
pub enum QapiError {
    /// Transport failure. Retried internally until `network_retry_timeout`
    /// elapses, at which point it is surfaced to the caller.
    #[error("link error: {0}")]
    LinkError(String),

    /// The client has been stopped; all pending requests fail with this and
    /// the public API rejects new requests.
    #[error("link shutdown")]
    LinkShutdown,

    /// The container rejected the request as access denied. Fatal: ends the
    /// worker or caller that received it.
    #[error("access denied")]
    AccessDenied,

    /// A synchronous waiter exceeded its wait budget. The request itself
    /// remains pending and may still complete later.
    #[error("timed out waiting for request to complete")]
    SyncTimeout,

    /// Container reported `FAILURE_UNKNOWN`.
    #[error("unknown resource or request")]
    Unknown,

    /// Container reported `FAILURE_MALFORMED`.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// Container reported `FAILURE_NOT_ALLOWED`.
    #[error("operation not allowed")]
    NotAllowed,

    /// Container reported `FAILURE_INTERNAL`.
    #[error("container internal error")]
    InternalError,

    /// Local parameter validation failed before the request was ever
    /// enqueued.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Decompression exceeded the configured size cap; the message was
    /// silently dropped (and reported via the debug callback, if any).
    #[error("oversize message dropped (limit {limit} bytes)")]
    Oversize {
        /// The configured size cap that was exceeded.
        limit: usize,
    },
}

impl QapiError {
    /// Maps a container `FAILURE_*` sub-code (see `constants`) to its typed
    /// error, given any detail message the container attached.
    #[must_use]
    pub fn from_failure_code(code: i64, detail: Option<String>) -> Self {
        use crate::constants::{
            FAILURE_ACCESS_DENIED, FAILURE_DUPLICATE, FAILURE_INTERNAL, FAILURE_LOW_SEQNUM,
            FAILURE_MALFORMED, FAILURE_NOT_ALLOWED, FAILURE_UNKNOWN,
        };
        match code {
            FAILURE_NOT_ALLOWED => Self::NotAllowed,
            FAILURE_UNKNOWN => Self::Unknown,
            FAILURE_MALFORMED => Self::Malformed(detail.unwrap_or_default()),
            FAILURE_DUPLICATE => Self::Malformed(detail.unwrap_or_else(|| "duplicate".to_string())),
            FAILURE_INTERNAL => Self::InternalError,
            // Low-seqnum resync is handled by the protocol client directly
            // (it resends, it does not surface to the caller); callers that
            // do see it treat it like an internal condition.
            FAILURE_LOW_SEQNUM => Self::InternalError,
            FAILURE_ACCESS_DENIED => Self::AccessDenied,
            _ => Self::Unknown,
        }
    }

    /// `true` for errors that end the process/worker that received them
    /// (per spec §4.G flush pool error policy: `AccessDenied` is fatal).
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AccessDenied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{FAILURE_ACCESS_DENIED, FAILURE_NOT_ALLOWED};

    #[test]
    fn test_from_failure_code_maps_known_codes() {
        assert!(matches!(
            QapiError::from_failure_code(FAILURE_NOT_ALLOWED, None),
            QapiError::NotAllowed
        ));
        assert!(QapiError::from_failure_code(FAILURE_ACCESS_DENIED, None).is_fatal());
    }

    #[test]
    fn test_unknown_code_maps_to_unknown() {
        assert!(matches!(
            QapiError::from_failure_code(9999, None),
            QapiError::Unknown
        ));
    }

    #[test]
    fn test_only_access_denied_is_fatal() {
        assert!(!QapiError::LinkError("x".into()).is_fatal());
        assert!(!QapiError::LinkShutdown.is_fatal());
        assert!(QapiError::AccessDenied.is_fatal());
    }
}
