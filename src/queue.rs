//! Engine-side request queue: the per-(host, port) holding area.

use crate::peer_addr::PeerAddress;
use crate::request::Request;
use crate::types::RequestId;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::time::Instant;

/// Queue identity within a host: transport and port, with the concrete IP
/// left open. Connect attempts walk the host's resolved IPs and fill in
/// the IP to obtain a [`PeerAddress`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum QueueAddr {
    Http { port: u16 },
    Https { port: u16, name: Arc<str> },
    /// CONNECT tunnel through a proxy: the queue's host is the proxy;
    /// `name:port` is the tunneled origin.
    HttpsTunnel { proxy_port: u16, name: Arc<str>, port: u16 },
    Unix { path: Arc<str> },
}

impl QueueAddr {
    pub fn peer_addr(&self, ip: IpAddr) -> PeerAddress {
        match self {
            QueueAddr::Http { port } => PeerAddress::Http { ip, port: *port },
            QueueAddr::Https { port, name } => PeerAddress::Https {
                ip,
                port: *port,
                name: name.clone(),
            },
            QueueAddr::HttpsTunnel { proxy_port, name, port } => PeerAddress::HttpsTunnel {
                ip,
                port: *proxy_port,
                name: name.clone(),
                dest_port: *port,
            },
            QueueAddr::Unix { path } => PeerAddress::Unix { path: path.clone() },
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, QueueAddr::Https { .. } | QueueAddr::HttpsTunnel { .. })
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, QueueAddr::Unix { .. })
    }
}

/// Fully-qualified queue identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct QueueKey {
    pub host: Arc<str>,
    pub addr: QueueAddr,
}

impl QueueKey {
    #[cfg(test)]
    pub fn test(host: &str, port: u16) -> Self {
        Self {
            host: host.into(),
            addr: QueueAddr::Http { port },
        }
    }
}

/// Outcome of rotating to the next candidate IP after a connect failure.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RotateOutcome {
    /// Another IP is available in the current round.
    NextIp,
    /// The round wrapped (or the connect-attempt ceiling was reached).
    Exhausted,
}

/// Ordered pending requests for one (host, transport, port).
pub(crate) struct Queue {
    pub key: QueueKey,

    /// Waiting for a release time. `None` means "until DNS completes".
    /// Sorted by release time, indefinite entries last.
    pub delayed: Vec<(Option<Instant>, Request)>,
    /// Released requests awaiting pick-up, urgent ones first.
    pub queued: VecDeque<Request>,
    pub queued_urgent: VecDeque<Request>,

    /// Peers racing to connect (more than one under a soft connect
    /// timeout) and the winner serving this queue.
    pub pending_peers: Vec<PeerAddress>,
    pub cur_peer: Option<PeerAddress>,

    /// Connect rotation over the host's IP list.
    pub ips_connect_idx: usize,
    pub ips_connect_start_idx: usize,
    pub connect_attempts: u32,
    pub first_connect_time: Option<Instant>,

    /// Engine wake-ups.
    pub soft_connect_at: Option<Instant>,
    pub retry_connect_at: Option<Instant>,
}

impl Queue {
    pub fn new(key: QueueKey) -> Self {
        Self {
            key,
            delayed: Vec::new(),
            queued: VecDeque::new(),
            queued_urgent: VecDeque::new(),
            pending_peers: Vec::new(),
            cur_peer: None,
            ips_connect_idx: 0,
            ips_connect_start_idx: 0,
            connect_attempts: 0,
            first_connect_time: None,
            soft_connect_at: None,
            retry_connect_at: None,
        }
    }

    /// Inserts a submitted request, honoring its release time.
    pub fn submit(&mut self, req: Request, now: Instant) {
        match req.release_time {
            Some(release) if release > now => self.insert_delayed(Some(release), req),
            _ => self.push_released(req),
        }
    }

    /// Parks a request until the host's DNS lookup completes.
    pub fn park_for_dns(&mut self, req: Request) {
        self.insert_delayed(None, req);
    }

    fn insert_delayed(&mut self, release: Option<Instant>, req: Request) {
        let pos = self
            .delayed
            .iter()
            .position(|(at, _)| match (release, at) {
                (Some(new), Some(existing)) => new < *existing,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .unwrap_or(self.delayed.len());
        self.delayed.insert(pos, (release, req));
    }

    fn push_released(&mut self, mut req: Request) {
        req.release_time = None;
        if req.urgent {
            self.queued_urgent.push_back(req);
        } else {
            self.queued.push_back(req);
        }
    }

    /// Moves delayed requests whose release time passed into the pick-up
    /// lists. Returns how many were released.
    pub fn release_due(&mut self, now: Instant) -> usize {
        let mut released = 0;
        let mut i = 0;
        while i < self.delayed.len() {
            match self.delayed[i].0 {
                Some(at) if at <= now => {
                    let (_, req) = self.delayed.remove(i);
                    self.push_released(req);
                    released += 1;
                }
                _ => i += 1,
            }
        }
        released
    }

    /// Releases every DNS-parked request.
    pub fn release_dns_parked(&mut self) -> usize {
        let mut released = 0;
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0.is_none() {
                let (_, req) = self.delayed.remove(i);
                self.push_released(req);
                released += 1;
            } else {
                i += 1;
            }
        }
        released
    }

    /// Takes back every released request for DNS parking (lookup restart).
    pub fn park_released_for_dns(&mut self) {
        let drained: Vec<Request> = self
            .queued_urgent
            .drain(..)
            .chain(self.queued.drain(..))
            .collect();
        for req in drained {
            self.insert_delayed(None, req);
        }
    }

    /// Hands the next pick-up request to the peer at `addr`. Urgent
    /// requests go first unless the claimer is already pipelining.
    pub fn claim(&mut self, addr: &PeerAddress, no_urgent: bool) -> Option<Request> {
        if self.cur_peer.as_ref() != Some(addr) {
            return None;
        }
        if !no_urgent {
            if let Some(req) = self.queued_urgent.pop_front() {
                return Some(req);
            }
        }
        self.queued.pop_front()
    }

    /// Puts a claimed request back at the head of its pick-up list.
    pub fn unclaim(&mut self, req: Request) {
        if req.urgent {
            self.queued_urgent.push_front(req);
        } else {
            self.queued.push_front(req);
        }
    }

    /// O(n) removal from whichever internal list holds the request.
    pub fn remove(&mut self, id: RequestId) -> Option<Request> {
        if let Some(pos) = self.queued.iter().position(|r| r.id == id) {
            return self.queued.remove(pos);
        }
        if let Some(pos) = self.queued_urgent.iter().position(|r| r.id == id) {
            return self.queued_urgent.remove(pos);
        }
        if let Some(pos) = self.delayed.iter().position(|(_, r)| r.id == id) {
            return Some(self.delayed.remove(pos).1);
        }
        None
    }

    /// Released requests a connection could pick up.
    pub fn startable(&self) -> usize {
        self.queued.len() + self.queued_urgent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.startable() == 0 && self.delayed.is_empty()
    }

    /// Removes and returns released/delayed requests whose overall
    /// deadline has passed.
    pub fn expire_due(&mut self, now: Instant) -> Vec<Request> {
        let mut expired = Vec::new();
        let overdue = |req: &Request| req.deadline.is_some_and(|deadline| deadline <= now);

        let mut keep = VecDeque::new();
        for req in self.queued_urgent.drain(..) {
            if overdue(&req) { expired.push(req) } else { keep.push_back(req) }
        }
        self.queued_urgent = keep;

        let mut keep = VecDeque::new();
        for req in self.queued.drain(..) {
            if overdue(&req) { expired.push(req) } else { keep.push_back(req) }
        }
        self.queued = keep;

        let mut keep = Vec::new();
        for (at, req) in self.delayed.drain(..) {
            if overdue(&req) { expired.push(req) } else { keep.push((at, req)) }
        }
        self.delayed = keep;

        expired
    }

    /// Takes every released request out of the pick-up lists, urgent
    /// first, for per-request connect-failure accounting.
    pub fn take_released(&mut self) -> Vec<Request> {
        self.queued_urgent
            .drain(..)
            .chain(self.queued.drain(..))
            .collect()
    }

    /// Everything still held by this queue, for fail-all paths.
    pub fn drain_all(&mut self) -> Vec<Request> {
        self.queued_urgent
            .drain(..)
            .chain(self.queued.drain(..))
            .chain(self.delayed.drain(..).map(|(_, req)| req))
            .collect()
    }

    /// Advances the IP rotation after a connect failure.
    pub fn rotate_ip(&mut self, ip_count: usize, max_connect_attempts: u32) -> RotateOutcome {
        self.connect_attempts += 1;
        if max_connect_attempts > 0 && self.connect_attempts >= max_connect_attempts {
            return RotateOutcome::Exhausted;
        }
        if ip_count <= 1 {
            return RotateOutcome::Exhausted;
        }
        self.ips_connect_idx = (self.ips_connect_idx + 1) % ip_count;
        if self.ips_connect_idx == self.ips_connect_start_idx {
            RotateOutcome::Exhausted
        } else {
            RotateOutcome::NextIp
        }
    }

    /// Records the winning peer. Returns the losing racers for unlinking.
    pub fn connection_success(&mut self, addr: &PeerAddress, ip_idx: usize) -> Vec<PeerAddress> {
        self.cur_peer = Some(addr.clone());
        self.ips_connect_idx = ip_idx;
        self.ips_connect_start_idx = ip_idx;
        self.connect_attempts = 0;
        self.first_connect_time = None;
        self.soft_connect_at = None;
        self.retry_connect_at = None;
        let losers: Vec<PeerAddress> = self
            .pending_peers
            .iter()
            .filter(|pending| *pending != addr)
            .cloned()
            .collect();
        self.pending_peers.clear();
        losers
    }

    /// Forgets a peer that failed to connect or disconnected.
    pub fn peer_disconnected(&mut self, addr: &PeerAddress) {
        self.pending_peers.retain(|pending| pending != addr);
        if self.cur_peer.as_ref() == Some(addr) {
            self.cur_peer = None;
        }
    }

    /// Earliest engine wake-up this queue needs.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        let mut merge = |candidate: Option<Instant>| {
            if let Some(at) = candidate {
                earliest = Some(earliest.map_or(at, |current| current.min(at)));
            }
        };
        merge(self.delayed.iter().filter_map(|(at, _)| *at).min());
        merge(
            self.queued
                .iter()
                .chain(self.queued_urgent.iter())
                .filter_map(|req| req.deadline)
                .min(),
        );
        merge(self.delayed.iter().filter_map(|(_, req)| req.deadline).min());
        merge(self.soft_connect_at);
        merge(self.retry_connect_at);
        earliest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use tokio::time::Duration;

    fn request(url: &str) -> Request {
        Request::new(Method::GET, url).unwrap()
    }

    fn queue() -> Queue {
        Queue::new(QueueKey::test("mail.example", 80))
    }

    fn peer_addr() -> PeerAddress {
        QueueAddr::Http { port: 80 }.peer_addr("10.0.0.1".parse().unwrap())
    }

    #[tokio::test]
    async fn urgent_requests_claimed_first() {
        let mut q = queue();
        let now = Instant::now();
        let addr = peer_addr();
        q.cur_peer = Some(addr.clone());

        let first = request("http://mail.example/1");
        let first_id = first.id;
        q.submit(first, now);

        let mut urgent = request("http://mail.example/2");
        urgent.set_urgent();
        let urgent_id = urgent.id;
        q.submit(urgent, now);

        assert_eq!(q.claim(&addr, false).unwrap().id, urgent_id);
        assert_eq!(q.claim(&addr, false).unwrap().id, first_id);
        assert!(q.claim(&addr, false).is_none());
    }

    #[tokio::test]
    async fn pipelined_claims_skip_urgent() {
        let mut q = queue();
        let now = Instant::now();
        let addr = peer_addr();
        q.cur_peer = Some(addr.clone());

        let mut urgent = request("http://mail.example/u");
        urgent.set_urgent();
        q.submit(urgent, now);

        assert!(q.claim(&addr, true).is_none());
        assert!(q.claim(&addr, false).is_some());
    }

    #[tokio::test]
    async fn claims_require_the_current_peer() {
        let mut q = queue();
        let now = Instant::now();
        q.submit(request("http://mail.example/"), now);

        let addr = peer_addr();
        assert!(q.claim(&addr, false).is_none());
        q.cur_peer = Some(addr.clone());
        assert!(q.claim(&addr, false).is_some());
    }

    #[tokio::test]
    async fn delayed_requests_release_in_order() {
        let mut q = queue();
        let now = Instant::now();

        let mut late = request("http://mail.example/late");
        late.release_time = Some(now + Duration::from_millis(200));
        q.submit(late, now);

        let mut soon = request("http://mail.example/soon");
        soon.release_time = Some(now + Duration::from_millis(50));
        q.submit(soon, now);

        assert_eq!(q.delayed.len(), 2);
        assert!(q.delayed[0].1.url().path().contains("soon"));

        assert_eq!(q.release_due(now + Duration::from_millis(100)), 1);
        assert_eq!(q.startable(), 1);
        assert_eq!(q.release_due(now + Duration::from_millis(300)), 1);
        assert_eq!(q.startable(), 2);
    }

    #[tokio::test]
    async fn dns_parked_requests_wait_indefinitely() {
        let mut q = queue();
        let now = Instant::now();
        q.park_for_dns(request("http://mail.example/"));

        assert_eq!(q.release_due(now + Duration::from_secs(3600)), 0);
        assert_eq!(q.release_dns_parked(), 1);
        assert_eq!(q.startable(), 1);
    }

    #[tokio::test]
    async fn rotation_detects_round_exhaustion() {
        let mut q = queue();
        // Single IP: every failure ends the round.
        assert_eq!(q.rotate_ip(1, 0), RotateOutcome::Exhausted);

        // Three IPs starting at index 0.
        let mut q = queue();
        assert_eq!(q.rotate_ip(3, 0), RotateOutcome::NextIp);
        assert_eq!(q.ips_connect_idx, 1);
        assert_eq!(q.rotate_ip(3, 0), RotateOutcome::NextIp);
        assert_eq!(q.rotate_ip(3, 0), RotateOutcome::Exhausted);
        assert_eq!(q.ips_connect_idx, q.ips_connect_start_idx);
    }

    #[tokio::test]
    async fn connect_attempt_ceiling_ends_the_round() {
        let mut q = queue();
        assert_eq!(q.rotate_ip(8, 2), RotateOutcome::NextIp);
        assert_eq!(q.rotate_ip(8, 2), RotateOutcome::Exhausted);
    }

    #[tokio::test]
    async fn success_demotes_losing_racers() {
        let mut q = queue();
        let winner = QueueAddr::Http { port: 80 }.peer_addr("10.0.0.2".parse().unwrap());
        let loser = peer_addr();
        q.pending_peers = vec![loser.clone(), winner.clone()];

        let losers = q.connection_success(&winner, 1);
        assert_eq!(losers, vec![loser]);
        assert!(q.pending_peers.is_empty());
        assert_eq!(q.cur_peer.as_ref(), Some(&winner));
        assert_eq!(q.ips_connect_start_idx, 1);
    }

    #[tokio::test]
    async fn expired_requests_are_separated() {
        let mut q = queue();
        let now = Instant::now();

        let mut doomed = request("http://mail.example/doomed");
        doomed.deadline = Some(now + Duration::from_millis(10));
        q.submit(doomed, now);

        let mut fine = request("http://mail.example/fine");
        fine.deadline = Some(now + Duration::from_secs(60));
        q.submit(fine, now);

        let expired = q.expire_due(now + Duration::from_millis(20));
        assert_eq!(expired.len(), 1);
        assert!(expired[0].url().path().contains("doomed"));
        assert_eq!(q.startable(), 1);
    }
}
