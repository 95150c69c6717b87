//! Engine-side peer state: the set of connections sharing one endpoint.

use crate::connection::{ConnCommand, PeerWireFlags};
use crate::peer_addr::PeerAddress;
use crate::queue::QueueKey;
use crate::types::*;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Connecting,
    Ready,
    Closing,
}

/// Engine-side view of one connection task.
pub(crate) struct ConnHandle {
    pub id: ConnId,
    pub cmd: mpsc::UnboundedSender<ConnCommand>,
    pub state: ConnState,
    /// Requests handed to the connection and not yet returned.
    pub inflight: usize,
    /// The connection asked for work and none was available.
    pub hungry: bool,
}

/// All state shared by connections to one [`PeerAddress`].
///
/// A peer with zero linked queues and zero connections is dropped from the
/// client registry.
pub(crate) struct Peer {
    pub addr: PeerAddress,
    /// Queues currently using this peer.
    pub queues: Vec<QueueKey>,
    pub conns: Vec<ConnHandle>,

    // Connect retry state. Delay doubles per consecutive failure up to the
    // cap and resets on the first successful connect.
    pub backoff_ms: u64,
    pub backoff_until: Option<Instant>,
    pub last_failure: Option<Instant>,

    /// Round-robin cursor over `queues` for request claiming.
    pub rr_cursor: usize,

    // Learned wire behavior.
    pub allows_pipelining: bool,
    pub seen_100_response: bool,
    pub no_payload_sync: bool,
}

impl Peer {
    pub fn new(addr: PeerAddress) -> Self {
        Self {
            addr,
            queues: Vec::new(),
            conns: Vec::new(),
            backoff_ms: 0,
            backoff_until: None,
            last_failure: None,
            rr_cursor: 0,
            allows_pipelining: false,
            seen_100_response: false,
            no_payload_sync: false,
        }
    }

    pub fn link_queue(&mut self, key: &QueueKey) {
        if !self.queues.contains(key) {
            self.queues.push(key.clone());
        }
    }

    pub fn unlink_queue(&mut self, key: &QueueKey) {
        self.queues.retain(|linked| linked != key);
        if self.rr_cursor >= self.queues.len() {
            self.rr_cursor = 0;
        }
    }

    /// Eligible for destruction.
    pub fn is_unused(&self) -> bool {
        self.queues.is_empty() && self.conns.is_empty()
    }

    pub fn conn_mut(&mut self, id: ConnId) -> Option<&mut ConnHandle> {
        self.conns.iter_mut().find(|conn| conn.id == id)
    }

    pub fn remove_conn(&mut self, id: ConnId) -> Option<ConnHandle> {
        let idx = self.conns.iter().position(|conn| conn.id == id)?;
        Some(self.conns.remove(idx))
    }

    pub fn connecting_count(&self) -> usize {
        self.conns
            .iter()
            .filter(|conn| conn.state == ConnState::Connecting)
            .count()
    }

    /// Established connections with nothing in flight; they will claim
    /// work without a new connection being opened.
    pub fn idle_ready_count(&self) -> usize {
        self.conns
            .iter()
            .filter(|conn| conn.state == ConnState::Ready && conn.inflight == 0)
            .count()
    }

    /// First successful connect resets the retry state.
    pub fn connection_success(&mut self) {
        self.backoff_ms = 0;
        self.backoff_until = None;
        self.last_failure = None;
    }

    /// Records a connect failure and arms the next backoff window.
    pub fn connection_failure(&mut self, now: Instant) {
        self.last_failure = Some(now);
        self.backoff_ms = if self.backoff_ms == 0 {
            BACKOFF_TIME_MS
        } else {
            (self.backoff_ms * BACKOFF_FACTOR).min(BACKOFF_MAX_TIME_MS)
        };
        self.backoff_until = Some(now + Duration::from_millis(self.backoff_ms));
        debug!(
            "peer {} connect failed, backing off {}ms",
            self.addr, self.backoff_ms
        );
    }

    pub fn backoff_active(&self, now: Instant) -> bool {
        self.backoff_until.is_some_and(|until| until > now)
    }

    /// Current wire-behavior snapshot handed to connection tasks.
    pub fn wire_flags(&self) -> PeerWireFlags {
        PeerWireFlags {
            allows_pipelining: self.allows_pipelining,
            no_payload_sync: self.no_payload_sync,
        }
    }

    /// Queue keys in claim order, starting at the round-robin cursor.
    pub fn queue_order(&self) -> Vec<QueueKey> {
        let n = self.queues.len();
        (0..n)
            .map(|i| self.queues[(self.rr_cursor + i) % n].clone())
            .collect()
    }

    pub fn advance_cursor(&mut self) {
        if !self.queues.is_empty() {
            self.rr_cursor = (self.rr_cursor + 1) % self.queues.len();
        }
    }
}
