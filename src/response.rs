//! Responses as delivered to callers.

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};

/// A complete HTTP response with its payload aggregated.
#[derive(Debug, Clone)]
pub struct Response {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Number of attempts the request took, counting the successful one.
    pub attempts: u32,
    /// Redirects followed before this response.
    pub redirects: u32,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// `Retry-After` in delta-seconds form, when present and parseable.
    /// HTTP-date values are ignored; transactional peers use the delta form.
    pub(crate) fn retry_after_secs(&self) -> Option<u64> {
        let value = self.headers.get(http::header::RETRY_AFTER)?;
        value.to_str().ok()?.trim().parse().ok()
    }

    /// Value of `Location`, if any.
    pub(crate) fn location(&self) -> Option<&str> {
        self.headers
            .get(http::header::LOCATION)
            .and_then(|v| v.to_str().ok())
    }
}
