//! Host name resolution.

use crate::error::Error;
use std::net::{IpAddr, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

/// Resolves `host` to its IP addresses, bounded by `timeout`.
///
/// Resolution runs on the blocking pool; the system resolver has no async
/// interface. Result order is preserved (connect attempts walk it
/// sequentially), duplicates are dropped.
pub(crate) async fn resolve(host: String, timeout: Duration) -> Result<Vec<IpAddr>, Error> {
    let name = host.clone();
    let lookup = tokio::task::spawn_blocking(move || {
        (name.as_str(), 0u16)
            .to_socket_addrs()
            .map(|addrs| addrs.map(|addr| addr.ip()).collect::<Vec<_>>())
    });

    let ips = match tokio::time::timeout(timeout, lookup).await {
        Err(_) => return Err(Error::HostLookupFailed(format!("{host}: lookup timed out"))),
        Ok(Err(join_err)) => {
            return Err(Error::Internal(format!("dns task failed: {join_err}")));
        }
        Ok(Ok(Err(io_err))) => {
            return Err(Error::HostLookupFailed(format!("{host}: {io_err}")));
        }
        Ok(Ok(Ok(ips))) => ips,
    };

    let mut unique = Vec::with_capacity(ips.len());
    for ip in ips {
        if !unique.contains(&ip) {
            unique.push(ip);
        }
    }
    if unique.is_empty() {
        return Err(Error::HostLookupFailed(format!("{host}: no addresses")));
    }
    debug!("resolved {} to {} address(es)", host, unique.len());
    Ok(unique)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_localhost() {
        let ips = resolve("localhost".into(), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(!ips.is_empty());
        assert!(ips.iter().all(|ip| ip.is_loopback()));
    }

    #[tokio::test]
    async fn unknown_host_fails() {
        let err = resolve(
            "does-not-exist.invalid".into(),
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::HostLookupFailed(_)));
    }
}
