//! Client-side failure taxonomy.
//!
//! Real server responses are never errors: any wire status, 5xx included, is
//! delivered as a [`Response`](crate::Response). `Error` covers only failures
//! the client generates itself, each with a stable numeric status in the
//! 9000 range so callers multiplexing both can log a single code.

use crate::types::*;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("request aborted")]
    Aborted,

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("host lookup failed: {0}")]
    HostLookupFailed(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid redirect: {0}")]
    InvalidRedirect(String),

    #[error("broken request payload: {0}")]
    BrokenPayload(String),

    #[error("bad response: {0}")]
    BadResponse(String),

    #[error("timed out: {0}")]
    TimedOut(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

impl Error {
    /// Numeric status for this failure, in the reserved 9000 range.
    pub fn status(&self) -> u16 {
        match self {
            Error::Aborted => STATUS_ABORTED,
            Error::ConnectFailed(_) => STATUS_CONNECT_FAILED,
            Error::HostLookupFailed(_) => STATUS_HOST_LOOKUP_FAILED,
            Error::InvalidUrl(_) => STATUS_INVALID_URL,
            Error::InvalidRedirect(_) => STATUS_INVALID_REDIRECT,
            Error::BrokenPayload(_) => STATUS_BROKEN_PAYLOAD,
            Error::BadResponse(_) => STATUS_BAD_RESPONSE,
            Error::TimedOut(_) => STATUS_TIMED_OUT,
            Error::TlsError(_) => STATUS_TLS_ERROR,
            Error::Internal(_) => STATUS_INTERNAL,
            Error::ConnectionLost(_) => STATUS_CONNECTION_LOST,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_reserved_range() {
        assert_eq!(Error::Aborted.status(), 9000);
        assert_eq!(Error::ConnectFailed(String::new()).status(), 9001);
        assert_eq!(Error::TimedOut(String::new()).status(), 9007);
        assert_eq!(Error::ConnectionLost(String::new()).status(), 9010);
    }
}
