//! Engine-side host state: one named origin and its queues.

use crate::queue::{Queue, QueueAddr, QueueKey};
use crate::types::{BACKOFF_FACTOR, BACKOFF_MAX_TIME_MS, BACKOFF_TIME_MS};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// A named origin (or proxy, or the UNIX-socket pseudo-host) with its DNS
/// state and one queue per (transport, port).
pub(crate) struct Host {
    pub name: Arc<str>,
    /// Addresses DNS returned, in resolver order.
    pub ips: Vec<IpAddr>,
    /// At most one lookup is in flight at a time; requests submitted
    /// meanwhile park in their queue's delayed list.
    pub dns_pending: bool,
    /// Delay before retrying a failed lookup; doubles like connect backoff.
    pub dns_backoff_ms: u64,
    pub queues: HashMap<QueueAddr, Queue>,
    pub unix_local: bool,
    pub explicit_ip: bool,
}

impl Host {
    pub fn new(name: Arc<str>) -> Self {
        Self {
            name,
            ips: Vec::new(),
            dns_pending: false,
            dns_backoff_ms: 0,
            queues: HashMap::new(),
            unix_local: false,
            explicit_ip: false,
        }
    }

    pub fn new_explicit(name: Arc<str>, ip: IpAddr) -> Self {
        let mut host = Self::new(name);
        host.ips = vec![ip];
        host.explicit_ip = true;
        host
    }

    pub fn new_unix(name: Arc<str>) -> Self {
        let mut host = Self::new(name);
        host.unix_local = true;
        host
    }

    /// Whether a lookup must run before this host can connect.
    pub fn needs_dns(&self) -> bool {
        !self.unix_local && !self.explicit_ip && self.ips.is_empty() && !self.dns_pending
    }

    pub fn has_ips(&self) -> bool {
        self.unix_local || !self.ips.is_empty()
    }

    pub fn queue_mut(&mut self, addr: QueueAddr) -> &mut Queue {
        let name = self.name.clone();
        self.queues.entry(addr.clone()).or_insert_with(|| {
            Queue::new(QueueKey { host: name, addr })
        })
    }

    pub fn ip_index(&self, ip: IpAddr) -> Option<usize> {
        self.ips.iter().position(|candidate| *candidate == ip)
    }

    pub fn dns_failed(&mut self) {
        self.dns_pending = false;
        self.dns_backoff_ms = if self.dns_backoff_ms == 0 {
            BACKOFF_TIME_MS
        } else {
            (self.dns_backoff_ms * BACKOFF_FACTOR).min(BACKOFF_MAX_TIME_MS)
        };
    }

    pub fn dns_succeeded(&mut self, ips: Vec<IpAddr>) {
        self.dns_pending = false;
        self.dns_backoff_ms = 0;
        self.ips = ips;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_lifecycle() {
        let mut host = Host::new("mail.example".into());
        assert!(host.needs_dns());

        host.dns_pending = true;
        assert!(!host.needs_dns());

        host.dns_failed();
        assert!(host.needs_dns());
        assert_eq!(host.dns_backoff_ms, 100);
        host.dns_failed();
        assert_eq!(host.dns_backoff_ms, 200);

        host.dns_succeeded(vec!["10.0.0.1".parse().unwrap()]);
        assert!(!host.needs_dns());
        assert!(host.has_ips());
        assert_eq!(host.dns_backoff_ms, 0);
    }

    #[test]
    fn explicit_ip_hosts_skip_dns() {
        let host = Host::new_explicit("10.0.0.1".into(), "10.0.0.1".parse().unwrap());
        assert!(!host.needs_dns());
        assert_eq!(host.ip_index("10.0.0.1".parse().unwrap()), Some(0));
    }

    #[test]
    fn unix_host_has_no_addresses() {
        let host = Host::new_unix("unix".into());
        assert!(!host.needs_dns());
        assert!(host.has_ips());
    }

    #[test]
    fn queues_are_keyed_by_transport_and_port() {
        let mut host = Host::new("mail.example".into());
        host.queue_mut(QueueAddr::Http { port: 80 });
        host.queue_mut(QueueAddr::Http { port: 8080 });
        host.queue_mut(QueueAddr::Http { port: 80 });
        assert_eq!(host.queues.len(), 2);
    }
}
