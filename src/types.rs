//! Protocol constants and small shared types.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// WIRE DEFAULTS
// =============================================================================

/// Default port for plain-text HTTP.
pub const HTTP_DEFAULT_PORT: u16 = 80;

/// Default port for HTTPS (direct or tunneled).
pub const HTTPS_DEFAULT_PORT: u16 = 443;

/// How long to wait for `100 Continue` before sending the body anyway.
/// A server that never acknowledges `Expect` must still receive the payload.
pub const CONTINUE_TIMEOUT_MS: u64 = 2_000;

/// Default overall request timeout (1 minute).
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;

/// Default DNS lookup timeout (10 seconds).
pub const DEFAULT_DNS_LOOKUP_TIMEOUT_MS: u64 = 10_000;

/// Default TCP connect (plus TLS handshake) timeout.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

// =============================================================================
// CONNECT BACKOFF
// =============================================================================

/// Initial delay before reconnecting to a peer that failed to connect.
pub const BACKOFF_TIME_MS: u64 = 100;

/// Backoff ceiling (1 minute). Delays double per consecutive failure:
/// 100ms -> 200ms -> 400ms -> ... -> 60s (capped).
pub const BACKOFF_MAX_TIME_MS: u64 = 60_000;

/// Exponential backoff factor between connect attempts.
pub const BACKOFF_FACTOR: u64 = 2;

// =============================================================================
// INTERNAL STATUS CODES
// =============================================================================
// Real server responses keep their HTTP status. Failures generated inside the
// client use a dedicated range that can never collide with wire statuses.

/// Caller cancelled the request or the client shut down.
pub const STATUS_ABORTED: u16 = 9000;
/// Every candidate address for the queue was exhausted.
pub const STATUS_CONNECT_FAILED: u16 = 9001;
/// DNS lookup failed.
pub const STATUS_HOST_LOOKUP_FAILED: u16 = 9002;
/// The request URL was rejected at submit time.
pub const STATUS_INVALID_URL: u16 = 9003;
/// Redirect target unparseable or redirect limit exceeded.
pub const STATUS_INVALID_REDIRECT: u16 = 9004;
/// The request body stream produced an error or could not be replayed.
pub const STATUS_BROKEN_PAYLOAD: u16 = 9005;
/// The response could not be parsed.
pub const STATUS_BAD_RESPONSE: u16 = 9006;
/// Per-attempt or overall deadline passed.
pub const STATUS_TIMED_OUT: u16 = 9007;
/// TLS handshake or certificate verification failed.
pub const STATUS_TLS_ERROR: u16 = 9008;
/// Invariant violation; never expected.
pub const STATUS_INTERNAL: u16 = 9009;
/// The connection dropped after the request was already on the wire.
pub const STATUS_CONNECTION_LOST: u16 = 9010;

// =============================================================================
// IDENTIFIERS
// =============================================================================

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique request identifier, used in labels and engine bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub(crate) fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Engine-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub(crate) u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique() {
        let a = RequestId::next();
        let b = RequestId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn internal_statuses_clear_wire_range() {
        for status in [
            STATUS_ABORTED,
            STATUS_CONNECT_FAILED,
            STATUS_HOST_LOOKUP_FAILED,
            STATUS_INVALID_URL,
            STATUS_INVALID_REDIRECT,
            STATUS_BROKEN_PAYLOAD,
            STATUS_BAD_RESPONSE,
            STATUS_TIMED_OUT,
            STATUS_TLS_ERROR,
            STATUS_INTERNAL,
            STATUS_CONNECTION_LOST,
        ] {
            assert!(status >= 9000);
        }
    }
}
