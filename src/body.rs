//! Request payloads.

use bytes::Bytes;
use std::io;
use tokio::sync::mpsc;

/// A request body.
///
/// `Empty` and `Bytes` bodies can be replayed on retries and redirects.
/// A `Channel` body is produced incrementally by the application and can be
/// sent exactly once; a retry after (partial) consumption fails with
/// BROKEN_PAYLOAD.
pub enum Body {
    Empty,
    Bytes(Bytes),
    /// Streamed body. `len` of `None` forces chunked transfer encoding.
    Channel {
        rx: mpsc::Receiver<Result<Bytes, io::Error>>,
        len: Option<u64>,
    },
    /// A channel body that has already been (partially) consumed.
    Consumed,
}

impl Body {
    pub fn empty() -> Self {
        Body::Empty
    }

    pub fn bytes(data: impl Into<Bytes>) -> Self {
        Body::Bytes(data.into())
    }

    /// Streamed body fed through a channel. Send `Ok(chunk)` per piece and
    /// drop the sender to finish; an `Err` aborts the request with
    /// BROKEN_PAYLOAD.
    pub fn channel(len: Option<u64>) -> (mpsc::Sender<Result<Bytes, io::Error>>, Self) {
        let (tx, rx) = mpsc::channel(8);
        (tx, Body::Channel { rx, len })
    }

    /// Declared length, when known up front.
    pub fn len(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(data) => Some(data.len() as u64),
            Body::Channel { len, .. } => *len,
            Body::Consumed => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty) || self.len() == Some(0)
    }

    /// Whether this body can be written again from the start.
    pub(crate) fn is_replayable(&self) -> bool {
        matches!(self, Body::Empty | Body::Bytes(_))
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Empty => write!(f, "Body::Empty"),
            Body::Bytes(data) => write!(f, "Body::Bytes({} bytes)", data.len()),
            Body::Channel { len, .. } => write!(f, "Body::Channel(len: {len:?})"),
            Body::Consumed => write!(f, "Body::Consumed"),
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Empty
    }
}

impl From<Bytes> for Body {
    fn from(data: Bytes) -> Self {
        Body::Bytes(data)
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Self {
        Body::Bytes(data.into())
    }
}

impl From<&'static str> for Body {
    fn from(data: &'static str) -> Self {
        Body::Bytes(Bytes::from_static(data.as_bytes()))
    }
}

impl From<String> for Body {
    fn from(data: String) -> Self {
        Body::Bytes(data.into_bytes().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replayability() {
        assert!(Body::empty().is_replayable());
        assert!(Body::bytes("x").is_replayable());
        let (_tx, body) = Body::channel(Some(1));
        assert!(!body.is_replayable());
        assert!(!Body::Consumed.is_replayable());
    }

    #[test]
    fn lengths() {
        assert_eq!(Body::empty().len(), Some(0));
        assert_eq!(Body::bytes("hello").len(), Some(5));
        let (_tx, body) = Body::channel(None);
        assert_eq!(body.len(), None);
    }
}
