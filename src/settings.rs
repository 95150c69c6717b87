//! Client configuration.

use crate::types::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// TLS options applied to every HTTPS peer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    /// PEM bundle of trusted CA certificates. When unset, the built-in
    /// webpki root set is used.
    pub ca_file: Option<PathBuf>,
    /// Directory of PEM CA certificates, loaded in addition to `ca_file`.
    pub ca_dir: Option<PathBuf>,
    /// Client certificate chain (PEM) presented to servers that ask.
    pub cert_file: Option<PathBuf>,
    /// Private key (PEM) for `cert_file`.
    pub key_file: Option<PathBuf>,
    /// Skip server certificate verification entirely.
    pub allow_invalid_certs: bool,
}

/// Tunables for the request dispatch engine.
///
/// All `*_msecs` fields treat `0` as "disabled" unless noted otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Close a connection that has been idle this long. `0` keeps idle
    /// connections open indefinitely.
    pub max_idle_time_msecs: u64,
    /// Concurrent connections per peer.
    pub max_parallel_connections: usize,
    /// In-flight (sent, unanswered) requests per connection.
    pub max_pipelined_requests: usize,
    /// Redirects followed per request. `0` delivers 3xx responses as-is.
    pub max_redirects: u32,
    /// Default attempts per request, overridable per request.
    pub max_attempts: u32,
    /// Connect rounds per queue before giving up. `0` fails a queue after a
    /// single round over every resolved IP.
    pub max_connect_attempts: u32,
    /// TCP connect plus TLS handshake deadline.
    pub connect_timeout_msecs: u64,
    /// Start racing the next IP when a connect has not succeeded within
    /// this time, without abandoning the first attempt.
    pub soft_connect_timeout_msecs: u64,
    /// Overall time budget per request, measured from submission.
    pub request_timeout_msecs: u64,
    /// Hard wall for a request including retries and queue delays. `0`
    /// leaves `request_timeout_msecs` as the only overall limit.
    pub request_absolute_timeout_msecs: u64,
    /// Default per-attempt response deadline. `0` means attempts are only
    /// bounded by the overall budget.
    pub attempt_timeout_msecs: u64,
    /// DNS lookup deadline.
    pub dns_lookup_timeout_msecs: u64,
    /// `User-Agent` header added to requests that do not set their own.
    pub user_agent: Option<String>,
    /// When set, every connection dumps the exact bytes sent and received
    /// to a log file under this directory.
    pub rawlog_dir: Option<PathBuf>,
    /// Route plain-http requests through this proxy (absolute-form), and
    /// https requests through a CONNECT tunnel on it.
    pub proxy_url: Option<String>,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
    /// UNIX socket proxy; takes precedence over `proxy_url` for http.
    pub proxy_socket_path: Option<PathBuf>,
    /// Allow pipelining requests that are not idempotent.
    pub pipelining_allow_nonidempotent: bool,
    /// Retry 5xx responses while attempts remain.
    pub retry_on_5xx: bool,
    pub tls: TlsSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_idle_time_msecs: 0,
            max_parallel_connections: 1,
            max_pipelined_requests: 1,
            max_redirects: 0,
            max_attempts: 1,
            max_connect_attempts: 0,
            connect_timeout_msecs: DEFAULT_CONNECT_TIMEOUT_MS,
            soft_connect_timeout_msecs: 0,
            request_timeout_msecs: DEFAULT_REQUEST_TIMEOUT_MS,
            request_absolute_timeout_msecs: 0,
            attempt_timeout_msecs: 0,
            dns_lookup_timeout_msecs: DEFAULT_DNS_LOOKUP_TIMEOUT_MS,
            user_agent: None,
            rawlog_dir: None,
            proxy_url: None,
            proxy_username: None,
            proxy_password: None,
            proxy_socket_path: None,
            pipelining_allow_nonidempotent: false,
            retry_on_5xx: false,
            tls: TlsSettings::default(),
        }
    }
}

impl Settings {
    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_msecs)
    }

    pub(crate) fn dns_lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_lookup_timeout_msecs)
    }

    pub(crate) fn max_pipelined(&self) -> usize {
        self.max_pipelined_requests.max(1)
    }

    pub(crate) fn max_parallel(&self) -> usize {
        self.max_parallel_connections.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_wire_defaults() {
        let set = Settings::default();
        assert_eq!(set.request_timeout_msecs, 60_000);
        assert_eq!(set.dns_lookup_timeout_msecs, 10_000);
        assert_eq!(set.max_attempts, 1);
        assert_eq!(set.max_redirects, 0);
        assert!(!set.retry_on_5xx);
    }

    #[test]
    fn zero_limits_are_clamped() {
        let mut set = Settings::default();
        set.max_pipelined_requests = 0;
        set.max_parallel_connections = 0;
        assert_eq!(set.max_pipelined(), 1);
        assert_eq!(set.max_parallel(), 1);
    }
}
