//! Peer endpoint identity.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// A deduplicated network endpoint.
///
/// Peers are interned by this value: every queue that resolves to the same
/// address shares one peer and its connection pool. TLS variants always
/// carry a non-empty SNI name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerAddress {
    /// Plain-text HTTP.
    Http { ip: IpAddr, port: u16 },
    /// Direct TLS.
    Https {
        ip: IpAddr,
        port: u16,
        /// SNI name, also used for certificate verification.
        name: Arc<str>,
    },
    /// TLS through an HTTP CONNECT proxy. `ip`/`port` address the proxy;
    /// `name`/`dest_port` are the tunneled origin.
    HttpsTunnel {
        ip: IpAddr,
        port: u16,
        name: Arc<str>,
        dest_port: u16,
    },
    /// Raw byte stream without HTTP framing on connect.
    Raw { ip: IpAddr, port: u16 },
    /// Local UNIX domain socket.
    Unix { path: Arc<str> },
}

impl PeerAddress {
    /// SNI name for TLS variants.
    pub fn tls_name(&self) -> Option<&str> {
        match self {
            PeerAddress::Https { name, .. } | PeerAddress::HttpsTunnel { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.tls_name().is_some()
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            PeerAddress::Http { ip, .. }
            | PeerAddress::Https { ip, .. }
            | PeerAddress::HttpsTunnel { ip, .. }
            | PeerAddress::Raw { ip, .. } => Some(*ip),
            PeerAddress::Unix { .. } => None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            PeerAddress::Http { port, .. }
            | PeerAddress::Https { port, .. }
            | PeerAddress::HttpsTunnel { port, .. }
            | PeerAddress::Raw { port, .. } => Some(*port),
            PeerAddress::Unix { .. } => None,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn tcp(f: &mut fmt::Formatter<'_>, ip: &IpAddr, port: u16) -> fmt::Result {
            match ip {
                IpAddr::V6(ip) => write!(f, "[{ip}]:{port}"),
                IpAddr::V4(ip) => write!(f, "{ip}:{port}"),
            }
        }
        match self {
            PeerAddress::Http { ip, port } => tcp(f, ip, *port),
            PeerAddress::Https { ip, port, name } => {
                tcp(f, ip, *port)?;
                write!(f, " (tls:{name})")
            }
            PeerAddress::HttpsTunnel { ip, port, name, dest_port } => {
                tcp(f, ip, *port)?;
                write!(f, " (tunnel:{name}:{dest_port})")
            }
            PeerAddress::Raw { ip, port } => {
                write!(f, "raw:")?;
                tcp(f, ip, *port)
            }
            PeerAddress::Unix { path } => write!(f, "unix:{path}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn equality_is_structural() {
        let a = PeerAddress::Https { ip: ip("10.0.0.1"), port: 443, name: "a.example".into() };
        let b = PeerAddress::Https { ip: ip("10.0.0.1"), port: 443, name: "a.example".into() };
        let c = PeerAddress::Https { ip: ip("10.0.0.1"), port: 443, name: "b.example".into() };
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert!(!set.contains(&c));
    }

    #[test]
    fn display_formats() {
        let plain = PeerAddress::Http { ip: ip("127.0.0.1"), port: 80 };
        assert_eq!(plain.to_string(), "127.0.0.1:80");

        let v6 = PeerAddress::Http { ip: ip("::1"), port: 8080 };
        assert_eq!(v6.to_string(), "[::1]:8080");

        let unix = PeerAddress::Unix { path: "/run/app.sock".into() };
        assert_eq!(unix.to_string(), "unix:/run/app.sock");
    }

    #[test]
    fn tls_name_only_on_tls_variants() {
        let plain = PeerAddress::Http { ip: ip("127.0.0.1"), port: 80 };
        assert!(plain.tls_name().is_none());

        let tunnel = PeerAddress::HttpsTunnel {
            ip: ip("127.0.0.1"),
            port: 3128,
            name: "mail.example".into(),
            dest_port: 443,
        };
        assert_eq!(tunnel.tls_name(), Some("mail.example"));
        assert!(tunnel.is_tls());
    }
}
