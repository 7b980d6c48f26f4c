//! Wire-level constants for the QAPI protocol.
//!
//! This module centralizes every numeric/string code exchanged with the
//! container so call sites never spell out a magic number. Constants are
//! grouped by domain with documentation explaining their purpose.
//!
//! # Categories
//!
//! - **Resource codes**: what kind of thing a request/response concerns
//! - **Action codes**: CRUD verb of an outbound request
//! - **Response/event codes**: what an inbound message represents
//! - **Failure/progress sub-codes**: detail carried by FAILED/PROGRESS
//! - **Wrapper**: outer frame field names and compression method tags
//! - **Defaults**: configuration surface defaults (see `Config`)

use std::time::Duration;

// ============================================================================
// Resource codes (inner message `r` field)
// ============================================================================

pub const RESOURCE_PING: i64 = 0;
pub const RESOURCE_ENTITY: i64 = 1;
pub const RESOURCE_FEED: i64 = 2;
pub const RESOURCE_CONTROL: i64 = 3;
pub const RESOURCE_SUBSCRIPTION: i64 = 4;
pub const RESOURCE_ENTITY_META: i64 = 5;
pub const RESOURCE_FEED_META: i64 = 6;
pub const RESOURCE_CONTROL_META: i64 = 7;
pub const RESOURCE_VALUE_META: i64 = 8;
pub const RESOURCE_ENTITY_TAG_META: i64 = 9;
pub const RESOURCE_FEED_TAG_META: i64 = 10;
pub const RESOURCE_CONTROL_TAG_META: i64 = 11;
pub const RESOURCE_SEARCH: i64 = 13;
pub const RESOURCE_DESCRIBE: i64 = 14;

// ============================================================================
// Action codes (inner message `t` field, outbound requests)
// ============================================================================

pub const ACTION_CREATE: i64 = 1;
pub const ACTION_UPDATE: i64 = 2;
pub const ACTION_DELETE: i64 = 3;
pub const ACTION_LIST: i64 = 4;

// ============================================================================
// Response / event codes (inner message `t` field, inbound messages)
// ============================================================================

pub const EVENT_COMPLETE: i64 = 1;
pub const EVENT_PROGRESS: i64 = 2;
pub const EVENT_FAILED: i64 = 3;
pub const EVENT_CREATED: i64 = 4;
pub const EVENT_DUPLICATED: i64 = 5;
pub const EVENT_DELETED: i64 = 6;
pub const EVENT_FEEDDATA: i64 = 7;
pub const EVENT_CONTROLREQ: i64 = 8;
pub const EVENT_SUBSCRIBED: i64 = 9;
pub const EVENT_RENAMED: i64 = 10;
pub const EVENT_REASSIGNED: i64 = 11;
pub const EVENT_RECENTDATA: i64 = 12;

// ============================================================================
// Failure sub-codes (payload of an EVENT_FAILED message)
// ============================================================================

pub const FAILURE_NOT_ALLOWED: i64 = 1;
pub const FAILURE_UNKNOWN: i64 = 2;
pub const FAILURE_MALFORMED: i64 = 3;
pub const FAILURE_DUPLICATE: i64 = 4;
pub const FAILURE_INTERNAL: i64 = 5;
pub const FAILURE_LOW_SEQNUM: i64 = 6;
pub const FAILURE_ACCESS_DENIED: i64 = 7;

// ============================================================================
// Progress sub-codes (payload of an EVENT_PROGRESS message)
// ============================================================================

pub const PROGRESS_ACCEPTED: i64 = 1;
pub const PROGRESS_REMOTE_DELAY: i64 = 2;
pub const PROGRESS_UPDATE: i64 = 3;

// ============================================================================
// Wrapper frame field names
// ============================================================================

pub const FIELD_SEQ: &str = "s";
pub const FIELD_COMPRESSION: &str = "c";
pub const FIELD_MESSAGE: &str = "m";
pub const FIELD_HMAC: &str = "h";

/// Length in bytes of the wrapper frame's HMAC-SHA256 digest.
pub const HMAC_LENGTH: usize = 32;

// ============================================================================
// Compression method tags (wrapper `c` field)
// ============================================================================

pub const COMP_NONE: u8 = 0;
pub const COMP_ZLIB: u8 = 1;
pub const COMP_LZ4F: u8 = 2;

/// Payload length above which the codec attempts compression before
/// falling back to sending uncompressed if compression did not help.
pub const COMP_SIZE_THRESHOLD: usize = 768;

/// Default ceiling on decompressed payload size before an `Oversize` error
/// is raised and the message silently dropped.
pub const DEFAULT_MAX_DECOMPRESSED_SIZE: usize = 1024 * 1024;

// ============================================================================
// MIME shorthand table (`idx/N` notation, point data requests)
// ============================================================================

/// Maximum allowed length (in ASCII bytes) of a MIME type string, including
/// any `idx/N` shorthand form.
pub const MIME_MAX_LEN: usize = 64;

/// Expands a `idx/N` shorthand MIME type into its long form. Unknown
/// shorthand indexes and non-shorthand strings are returned unchanged.
#[must_use]
pub fn expand_idx_mimetype(type_: &str) -> &str {
    if let Some(idx) = type_.strip_prefix("idx/") {
        match idx {
            "1" => "application/ubjson",
            "2" => "text/plain; charset=utf8",
            _ => type_,
        }
    } else {
        type_
    }
}

/// Content-type always used for the outer wrapper frame.
pub const WIRE_CONTENT_TYPE: &str = "application/ubjson";

// ============================================================================
// Configuration surface defaults (see `Config`, spec §6.4)
// ============================================================================

pub const DEFAULT_PREFETCH: u32 = 128;
pub const DEFAULT_ACK_FRACTION: f64 = 0.5;
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONN_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_CONN_ERROR_LOG_THRESHOLD: Duration = Duration::from_secs(180);
pub const DEFAULT_NETWORK_RETRY_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_SEND_QUEUE_SIZE: usize = 128;
/// `max_encoded_length` default: just under the broker's frame ceiling.
pub const DEFAULT_MAX_ENCODED_LENGTH: usize = 65536 * 98 / 100;

/// Fixed delay, per spec, before a retry-across-reconnect timer fires.
pub const RETRY_TIMER_DELAY: Duration = Duration::from_secs(10);

/// Sequence number space: sequence numbers strictly advance modulo 2^63.
pub const SEQ_MODULUS: u64 = 1u64 << 63;

/// Window (in sequence numbers) beyond which a received seqnum jump is
/// logged as suspicious but still processed.
pub const SEQ_WARN_WINDOW: u64 = 1024;

/// Every worker/poll loop re-checks its stop signal at least this often.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Interval between periodic stash saves.
pub const STASH_SAVE_INTERVAL: Duration = Duration::from_secs(120);

// ============================================================================
// QAPI version (PING handshake, spec.md §4.D.9)
// ============================================================================

/// (major, minor, patch) QAPI version this client targets. The container's
/// reported version in the PING response is checked against this.
pub const QAPI_VERSION: (u64, u64, u64) = (1, 2, 3);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_and_action_codes_are_distinct() {
        let codes = [
            RESOURCE_PING,
            RESOURCE_ENTITY,
            RESOURCE_FEED,
            RESOURCE_CONTROL,
            RESOURCE_SUBSCRIPTION,
            RESOURCE_ENTITY_META,
            RESOURCE_FEED_META,
            RESOURCE_CONTROL_META,
            RESOURCE_VALUE_META,
            RESOURCE_ENTITY_TAG_META,
            RESOURCE_FEED_TAG_META,
            RESOURCE_CONTROL_TAG_META,
            RESOURCE_SEARCH,
            RESOURCE_DESCRIBE,
        ];
        let mut seen = std::collections::HashSet::new();
        for code in codes {
            assert!(seen.insert(code), "duplicate resource code {code}");
        }
    }

    #[test]
    fn test_expand_idx_mimetype() {
        assert_eq!(expand_idx_mimetype("idx/1"), "application/ubjson");
        assert_eq!(expand_idx_mimetype("idx/2"), "text/plain; charset=utf8");
        assert_eq!(expand_idx_mimetype("idx/99"), "idx/99");
        assert_eq!(expand_idx_mimetype("text/csv"), "text/csv");
    }

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(DEFAULT_SOCKET_TIMEOUT >= Duration::from_secs(5));
        assert!(DEFAULT_HEARTBEAT >= Duration::from_secs(10));
        assert!(STOP_POLL_INTERVAL <= Duration::from_secs(1));
    }

    #[test]
    fn test_seq_modulus_is_2_pow_63() {
        assert_eq!(SEQ_MODULUS, 1u64 << 63);
    }
}
