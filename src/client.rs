//! The client: a cheap cloneable handle plus the engine task that owns
//! every host, queue and peer.
//!
//! All dispatch state is confined to the engine task; submitters, timers,
//! DNS lookups and connection tasks reach it through one event channel.
//! Completion callbacks run on the engine task, never inside `submit` or
//! `abort`.

use crate::connection::{self, ConnCommand, ConnConfig, ConnEvent};
use crate::dns;
use crate::error::Error;
use crate::host::Host;
use crate::peer::{ConnHandle, ConnState, Peer};
use crate::peer_addr::PeerAddress;
use crate::queue::{QueueAddr, QueueKey, RotateOutcome};
use crate::request::{Delivery, Request, RequestState};
use crate::response::Response;
use crate::settings::Settings;
use crate::tls;
use crate::types::{ConnId, HTTP_DEFAULT_PORT, HTTPS_DEFAULT_PORT, RequestId};
use crate::wire;
use http::HeaderValue;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Duration, Instant, sleep_until};
use tokio_rustls::rustls::ClientConfig;
use tracing::{debug, info, trace, warn};
use url::Url;

pub(crate) enum Event {
    Submit(Box<Request>),
    Abort(RequestId),
    Dns {
        host: Arc<str>,
        result: Result<Vec<IpAddr>, Error>,
    },
    Conn(ConnEvent),
    Shutdown(oneshot::Sender<()>),
}

// =============================================================================
// PUBLIC HANDLE
// =============================================================================

/// Handle to a submitted request: a future resolving to its outcome, plus
/// out-of-band cancellation.
pub struct RequestHandle {
    id: RequestId,
    events: mpsc::UnboundedSender<Event>,
    rx: oneshot::Receiver<Result<Response, Error>>,
}

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Cancels the request. Aborting a finished request is a no-op; the
    /// callback still fires exactly once overall.
    pub fn abort(&self) {
        let _ = self.events.send(Event::Abort(self.id));
    }
}

impl Future for RequestHandle {
    type Output = Result<Response, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|received| match received {
                Ok(result) => result,
                Err(_) => Err(Error::Internal("client engine dropped".into())),
            })
    }
}

/// An HTTP/1.x client multiplexing requests over pooled, pipelined
/// connections. Clones share the same engine.
///
/// Must be created and used inside a tokio runtime; the engine task runs
/// on whichever runtime called [`Client::new`].
#[derive(Clone)]
pub struct Client {
    events: mpsc::UnboundedSender<Event>,
    /// Requests submitted and not yet completed. Incremented here at
    /// submit time so `join` cannot miss a submission the engine has not
    /// picked up yet; the engine decrements on completion.
    outstanding: Arc<AtomicUsize>,
    count: watch::Receiver<usize>,
    settings: Arc<Settings>,
}

impl Client {
    pub fn new(settings: Settings) -> Self {
        let settings = Arc::new(settings);
        let (events, rx) = mpsc::unbounded_channel();
        let (count_tx, count) = watch::channel(0usize);
        let outstanding = Arc::new(AtomicUsize::new(0));
        let engine = Engine::new(settings.clone(), events.clone(), count_tx, outstanding.clone());
        tokio::spawn(engine.run(rx));
        Self { events, outstanding, count, settings }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Submits a request; the returned handle resolves to the response or
    /// failure. Never completes synchronously.
    pub fn submit(&self, mut req: Request) -> RequestHandle {
        let (tx, rx) = oneshot::channel();
        req.delivery = Some(Box::new(move |result| {
            let _ = tx.send(result);
        }));
        let id = req.id;
        self.send_request(req);
        RequestHandle { id, events: self.events.clone(), rx }
    }

    /// Submits a request with an explicit completion callback.
    pub fn submit_with(&self, mut req: Request, delivery: impl Delivery) -> RequestId {
        req.delivery = Some(Box::new(delivery));
        let id = req.id;
        self.send_request(req);
        id
    }

    fn send_request(&self, req: Request) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(event)) = self.events.send(Event::Submit(Box::new(req))) {
            // Engine already gone: deliver the failure from a task so the
            // callback still never runs inside submit.
            let outstanding = self.outstanding.clone();
            if let Event::Submit(mut req) = event {
                tokio::spawn(async move {
                    outstanding.fetch_sub(1, Ordering::SeqCst);
                    req.finish(Err(Error::Aborted));
                });
            }
        }
    }

    pub fn abort(&self, id: RequestId) {
        let _ = self.events.send(Event::Abort(id));
    }

    /// Number of submitted requests that have not completed yet.
    pub fn pending_requests(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Waits until every outstanding request has completed.
    pub async fn join(&self) {
        let mut count = self.count.clone();
        loop {
            if self.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            if count.changed().await.is_err() {
                return;
            }
        }
    }

    /// Aborts every outstanding request, closes all connections and stops
    /// the engine.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.events.send(Event::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

// =============================================================================
// ENGINE
// =============================================================================

#[derive(Clone)]
enum Location {
    Queue(QueueKey),
    Conn(ConnId),
}

#[derive(Clone)]
enum RouteTarget {
    Name,
    Ip(IpAddr),
    Unix,
}

struct Route {
    host: Arc<str>,
    target: RouteTarget,
    queue_addr: QueueAddr,
    authority: String,
    absolute_form: bool,
}

struct ProxyRoute {
    host: Arc<str>,
    target: RouteTarget,
    port: u16,
}

struct Engine {
    settings: Arc<Settings>,
    events_tx: mpsc::UnboundedSender<Event>,
    count_tx: watch::Sender<usize>,
    hosts: HashMap<Arc<str>, Host>,
    peers: HashMap<PeerAddress, Peer>,
    conn_peers: HashMap<ConnId, PeerAddress>,
    index: HashMap<RequestId, Location>,
    aborting: HashSet<RequestId>,
    delayed_failures: Vec<(Box<Request>, Error)>,
    triggers: VecDeque<PeerAddress>,
    outstanding: Arc<AtomicUsize>,
    next_conn_id: u64,
    tls_config: Option<Arc<ClientConfig>>,
    proxy: Option<ProxyRoute>,
    proxy_error: Option<String>,
    proxy_auth: Option<HeaderValue>,
    shutting_down: bool,
    shutdown_acks: Vec<oneshot::Sender<()>>,
    done: bool,
}

impl Engine {
    fn new(
        settings: Arc<Settings>,
        events_tx: mpsc::UnboundedSender<Event>,
        count_tx: watch::Sender<usize>,
        outstanding: Arc<AtomicUsize>,
    ) -> Self {
        let (proxy, proxy_error) = match settings.proxy_url.as_deref() {
            None => (None, None),
            Some(raw) => match parse_proxy(raw) {
                Ok(route) => (Some(route), None),
                Err(error) => {
                    warn!("ignoring proxy_url: {error}");
                    (None, Some(error.to_string()))
                }
            },
        };
        let proxy_auth = match (&settings.proxy_username, &settings.proxy_password) {
            (Some(user), pass) => Some(wire::basic_auth(user, pass.as_deref().unwrap_or(""))),
            _ => None,
        };
        Self {
            settings,
            events_tx,
            count_tx,
            hosts: HashMap::new(),
            peers: HashMap::new(),
            conn_peers: HashMap::new(),
            index: HashMap::new(),
            aborting: HashSet::new(),
            delayed_failures: Vec::new(),
            triggers: VecDeque::new(),
            outstanding,
            next_conn_id: 1,
            tls_config: None,
            proxy,
            proxy_error,
            proxy_auth,
            shutting_down: false,
            shutdown_acks: Vec::new(),
            done: false,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        debug!("client engine started");
        loop {
            self.run_soon();
            if self.done {
                break;
            }
            let deadline = self.next_deadline();
            let sleep_to = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = sleep_until(sleep_to), if deadline.is_some() => self.on_tick(Instant::now()),
            }
        }
        debug!("client engine stopped");
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Submit(req) => self.handle_submit(req),
            Event::Abort(id) => self.handle_abort(id),
            Event::Dns { host, result } => self.handle_dns(host, result),
            Event::Conn(conn_event) => self.handle_conn_event(conn_event),
            Event::Shutdown(ack) => self.handle_shutdown(ack),
        }
    }

    /// Zero-delay work: deferred failures first, then peer request
    /// handlers. Runs between events, so completions and resubmissions
    /// happen on the next engine iteration, never inside a callback stack.
    fn run_soon(&mut self) {
        loop {
            if !self.delayed_failures.is_empty() {
                let batch = std::mem::take(&mut self.delayed_failures);
                for (req, error) in batch {
                    self.complete(req, Err(error));
                }
                continue;
            }
            if let Some(addr) = self.triggers.pop_front() {
                self.handle_peer_trigger(addr);
                continue;
            }
            break;
        }
        if self.shutting_down {
            self.check_shutdown_done();
        }
    }

    // -------------------------------------------------------------------------
    // Bookkeeping
    // -------------------------------------------------------------------------

    fn queue(&self, key: &QueueKey) -> Option<&crate::queue::Queue> {
        self.hosts.get(&key.host)?.queues.get(&key.addr)
    }

    fn queue_mut(&mut self, key: &QueueKey) -> Option<&mut crate::queue::Queue> {
        self.hosts.get_mut(&key.host)?.queues.get_mut(&key.addr)
    }

    /// Fires the final callback for a request.
    fn complete(&mut self, mut req: Box<Request>, result: Result<Response, Error>) {
        self.index.remove(&req.id);
        self.aborting.remove(&req.id);
        let left = self
            .outstanding
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        let _ = self.count_tx.send(left);
        match &result {
            Ok(response) => debug!("{} finished: {}", req.label(), response.status),
            Err(error) => debug!("{} failed: {error}", req.label()),
        }
        req.finish(result);
    }

    /// Defers a failure to the next engine iteration.
    fn fail_soon(&mut self, req: Box<Request>, error: Error) {
        self.index.remove(&req.id);
        self.delayed_failures.push((req, error));
    }

    /// Schedules a peer's request handler for the next iteration.
    fn trigger(&mut self, addr: PeerAddress) {
        if !self.triggers.contains(&addr) {
            self.triggers.push_back(addr);
        }
    }

    fn gc_peer(&mut self, addr: &PeerAddress) {
        if self.peers.get(addr).is_some_and(|peer| peer.is_unused()) {
            debug!("dropping unused peer {addr}");
            self.peers.remove(addr);
        }
    }

    fn tls_client_config(&mut self) -> Result<Arc<ClientConfig>, Error> {
        if let Some(config) = &self.tls_config {
            return Ok(config.clone());
        }
        let config = tls::client_config(&self.settings.tls)?;
        self.tls_config = Some(config.clone());
        Ok(config)
    }

    // -------------------------------------------------------------------------
    // Submission and routing
    // -------------------------------------------------------------------------

    fn handle_submit(&mut self, mut req: Box<Request>) {
        let now = Instant::now();
        req.submit_time = Some(now);
        if req.max_attempts.is_none() {
            req.max_attempts = Some(self.settings.max_attempts.max(1));
        }
        if req.max_redirects.is_none() {
            req.max_redirects = Some(self.settings.max_redirects);
        }
        let timeout = req.timeout.or_else(|| {
            let ms = self.settings.request_timeout_msecs;
            (ms > 0).then(|| Duration::from_millis(ms))
        });
        let mut deadline = timeout.map(|t| now + t);
        if self.settings.request_absolute_timeout_msecs > 0 {
            let hard = now + Duration::from_millis(self.settings.request_absolute_timeout_msecs);
            deadline = Some(deadline.map_or(hard, |soft| soft.min(hard)));
        }
        req.deadline = deadline;
        debug!("{} submitted", req.label());
        self.enqueue(req, true);
    }

    /// Queues a request (initial submission or resubmission). When
    /// `count_attempt` is set the request consumes one of its attempts.
    fn enqueue(&mut self, mut req: Box<Request>, count_attempt: bool) {
        if self.shutting_down {
            self.fail_soon(req, Error::Aborted);
            return;
        }
        let route = match self.route(&req) {
            Ok(route) => route,
            Err(error) => {
                self.fail_soon(req, error);
                return;
            }
        };
        req.authority = route.authority.clone();
        req.absolute_form = route.absolute_form;
        req.state = RequestState::Queued;
        if count_attempt {
            req.attempts += 1;
        }

        let now = Instant::now();
        let id = req.id;
        let key = QueueKey {
            host: route.host.clone(),
            addr: route.queue_addr.clone(),
        };
        let parked;
        {
            let host = self
                .hosts
                .entry(route.host.clone())
                .or_insert_with(|| match &route.target {
                    RouteTarget::Unix => Host::new_unix(route.host.clone()),
                    RouteTarget::Ip(ip) => Host::new_explicit(route.host.clone(), *ip),
                    RouteTarget::Name => Host::new(route.host.clone()),
                });
            let has_ips = host.has_ips();
            let queue = host.queue_mut(route.queue_addr.clone());
            if has_ips {
                queue.submit(*req, now);
                parked = false;
            } else {
                queue.park_for_dns(*req);
                parked = true;
            }
        }
        self.index.insert(id, Location::Queue(key.clone()));
        if parked {
            self.start_dns(route.host);
        } else {
            self.queue_connection_setup(&key);
        }
    }

    fn route(&self, req: &Request) -> Result<Route, Error> {
        let url = &req.url;
        let (name, target): (Arc<str>, RouteTarget) = match url.host() {
            Some(url::Host::Domain(domain)) => {
                (Arc::from(domain.to_ascii_lowercase()), RouteTarget::Name)
            }
            Some(url::Host::Ipv4(ip)) => {
                (Arc::from(ip.to_string()), RouteTarget::Ip(IpAddr::V4(ip)))
            }
            Some(url::Host::Ipv6(ip)) => {
                (Arc::from(ip.to_string()), RouteTarget::Ip(IpAddr::V6(ip)))
            }
            None => return Err(Error::InvalidUrl("URL has no host".into())),
        };
        let https = url.scheme() == "https";
        let default_port = if https { HTTPS_DEFAULT_PORT } else { HTTP_DEFAULT_PORT };
        let port = url.port().unwrap_or(default_port);
        let authority = if matches!(url.host(), Some(url::Host::Ipv6(_))) {
            if port == default_port {
                format!("[{name}]")
            } else {
                format!("[{name}]:{port}")
            }
        } else if port == default_port {
            name.to_string()
        } else {
            format!("{name}:{port}")
        };

        if let Some(error) = &self.proxy_error {
            return Err(Error::InvalidUrl(format!("proxy_url: {error}")));
        }

        if !https {
            if let Some(path) = &self.settings.proxy_socket_path {
                let path: Arc<str> = path
                    .to_str()
                    .ok_or_else(|| Error::InvalidUrl("proxy socket path is not UTF-8".into()))?
                    .into();
                return Ok(Route {
                    host: Arc::from(format!("unix:{path}")),
                    target: RouteTarget::Unix,
                    queue_addr: QueueAddr::Unix { path },
                    authority,
                    absolute_form: true,
                });
            }
            if let Some(proxy) = &self.proxy {
                return Ok(Route {
                    host: proxy.host.clone(),
                    target: proxy.target.clone(),
                    queue_addr: QueueAddr::Http { port: proxy.port },
                    authority,
                    absolute_form: true,
                });
            }
            return Ok(Route {
                host: name.clone(),
                target,
                queue_addr: QueueAddr::Http { port },
                authority,
                absolute_form: false,
            });
        }

        if let Some(proxy) = &self.proxy {
            return Ok(Route {
                host: proxy.host.clone(),
                target: proxy.target.clone(),
                queue_addr: QueueAddr::HttpsTunnel {
                    proxy_port: proxy.port,
                    name: name.clone(),
                    port,
                },
                authority,
                absolute_form: false,
            });
        }
        Ok(Route {
            host: name.clone(),
            target,
            queue_addr: QueueAddr::Https { port, name },
            authority,
            absolute_form: false,
        })
    }

    // -------------------------------------------------------------------------
    // DNS
    // -------------------------------------------------------------------------

    fn start_dns(&mut self, name: Arc<str>) {
        let Some(host) = self.hosts.get_mut(&name) else {
            return;
        };
        if host.dns_pending || !host.needs_dns() {
            return;
        }
        host.dns_pending = true;
        debug!("looking up {name}");
        let timeout = self.settings.dns_lookup_timeout();
        let tx = self.events_tx.clone();
        let lookup = name.to_string();
        tokio::spawn(async move {
            let result = dns::resolve(lookup, timeout).await;
            let _ = tx.send(Event::Dns { host: name, result });
        });
    }

    fn handle_dns(&mut self, name: Arc<str>, result: Result<Vec<IpAddr>, Error>) {
        let Some(host) = self.hosts.get_mut(&name) else {
            return;
        };
        match result {
            Ok(ips) => {
                debug!("{name}: {} address(es)", ips.len());
                host.dns_succeeded(ips);
                let mut ready_keys = Vec::new();
                for queue in host.queues.values_mut() {
                    queue.release_dns_parked();
                    if queue.startable() > 0 {
                        ready_keys.push(queue.key.clone());
                    }
                }
                for key in ready_keys {
                    self.queue_connection_setup(&key);
                }
            }
            Err(error) => {
                warn!("{name}: {error}");
                host.dns_failed();
                let backoff = Duration::from_millis(host.dns_backoff_ms);
                let now = Instant::now();
                let mut actions: Vec<(QueueKey, Vec<Request>)> = Vec::new();
                for queue in host.queues.values_mut() {
                    queue.release_dns_parked();
                    let reqs = queue.take_released();
                    if !reqs.is_empty() {
                        actions.push((queue.key.clone(), reqs));
                    }
                }
                for (key, reqs) in actions {
                    for mut req in reqs {
                        if req.attempts >= req.max_attempts.unwrap_or(1) {
                            self.fail_soon(Box::new(req), error.clone());
                        } else {
                            req.attempts += 1;
                            req.release_time = Some(now + backoff);
                            if let Some(queue) = self.queue_mut(&key) {
                                queue.submit(req, now);
                            }
                        }
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Connection setup
    // -------------------------------------------------------------------------

    fn queue_connection_setup(&mut self, key: &QueueKey) {
        let now = Instant::now();
        let soft_ms = self.settings.soft_connect_timeout_msecs;
        let addr = {
            let Some(host) = self.hosts.get_mut(&key.host) else {
                return;
            };
            let ips_len = host.ips.len();
            let unix = host.unix_local;
            let ips = host.ips.clone();
            let Some(queue) = host.queues.get_mut(&key.addr) else {
                return;
            };
            if queue.startable() == 0 {
                return;
            }
            let addr = if unix {
                key.addr.peer_addr(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED))
            } else {
                if ips_len == 0 {
                    return;
                }
                if queue.ips_connect_idx >= ips_len {
                    queue.ips_connect_idx = 0;
                }
                if queue.ips_connect_start_idx >= ips_len {
                    queue.ips_connect_start_idx = 0;
                }
                key.addr.peer_addr(ips[queue.ips_connect_idx])
            };
            if queue.cur_peer.is_none() {
                if !queue.pending_peers.contains(&addr) {
                    queue.pending_peers.push(addr.clone());
                }
                if queue.first_connect_time.is_none() {
                    queue.first_connect_time = Some(now);
                }
                if soft_ms > 0 && ips_len > 1 && queue.soft_connect_at.is_none() {
                    queue.soft_connect_at = Some(now + Duration::from_millis(soft_ms));
                }
            }
            addr
        };
        let peer = self
            .peers
            .entry(addr.clone())
            .or_insert_with(|| Peer::new(addr.clone()));
        peer.link_queue(key);
        self.trigger(addr);
    }

    /// The peer's zero-delay request handler: feed idle connections, then
    /// open new ones while limits and backoff allow.
    fn handle_peer_trigger(&mut self, addr: PeerAddress) {
        let now = Instant::now();
        let Some(peer) = self.peers.get(&addr) else {
            return;
        };
        let hungry: Vec<ConnId> = peer
            .conns
            .iter()
            .filter(|conn| conn.state == ConnState::Ready && conn.hungry)
            .map(|conn| conn.id)
            .collect();
        for conn_id in hungry {
            self.feed_conn(&addr, conn_id);
        }

        let Some(peer) = self.peers.get(&addr) else {
            return;
        };
        let queue_keys = peer.queues.clone();
        let mut pending = 0usize;
        for key in &queue_keys {
            if let Some(queue) = self.queue(key) {
                let eligible = match &queue.cur_peer {
                    None => queue.pending_peers.contains(&addr),
                    Some(current) => *current == addr,
                };
                if eligible {
                    pending += queue.startable();
                }
            }
        }
        if pending == 0 {
            return;
        }

        let (backing_off, backoff_until, mut capacity) = match self.peers.get(&addr) {
            Some(peer) => (
                peer.backoff_active(now),
                peer.backoff_until,
                peer.connecting_count() + peer.idle_ready_count(),
            ),
            None => return,
        };
        if backing_off {
            // Wake up again when the backoff window ends.
            if let Some(until) = backoff_until {
                for key in &queue_keys {
                    if let Some(queue) = self.queue_mut(key) {
                        if queue.startable() > 0 {
                            queue.retry_connect_at =
                                Some(queue.retry_connect_at.map_or(until, |at| at.min(until)));
                        }
                    }
                }
            }
            return;
        }

        while capacity < pending {
            let conns = match self.peers.get(&addr) {
                Some(peer) => peer.conns.len(),
                None => break,
            };
            if conns >= self.settings.max_parallel() {
                break;
            }
            if !self.create_connection(&addr) {
                break;
            }
            capacity += 1;
        }
    }

    /// Claims a request for one connection. Returns whether one was handed
    /// over.
    fn feed_conn(&mut self, addr: &PeerAddress, conn_id: ConnId) -> bool {
        let (queue_order, pipelined) = {
            let Some(peer) = self.peers.get(addr) else {
                return false;
            };
            let Some(conn) = peer.conns.iter().find(|conn| conn.id == conn_id) else {
                return false;
            };
            if conn.state != ConnState::Ready {
                return false;
            }
            if conn.inflight > 0
                && (!peer.allows_pipelining
                    || conn.inflight >= self.settings.max_pipelined())
            {
                return false;
            }
            (peer.queue_order(), conn.inflight > 0)
        };

        let pipelining_allow_nonidempotent = self.settings.pipelining_allow_nonidempotent;
        for key in queue_order {
            let Some(queue) = self.queue_mut(&key) else {
                continue;
            };
            let Some(req) = queue.claim(addr, pipelined) else {
                continue;
            };
            if pipelined
                && (req.payload_sync
                    || (!req.is_idempotent() && !pipelining_allow_nonidempotent))
            {
                // This request needs a clean connection; leave it queued.
                queue.unclaim(req);
                return false;
            }
            let id = req.id;
            let label = req.label();
            let Some(peer) = self.peers.get_mut(addr) else {
                return false;
            };
            peer.advance_cursor();
            let Some(conn) = peer.conn_mut(conn_id) else {
                return false;
            };
            match conn.cmd.send(ConnCommand::Execute(Box::new(req))) {
                Ok(()) => {
                    conn.inflight += 1;
                    conn.hungry = false;
                    self.index.insert(id, Location::Conn(conn_id));
                    trace!("{label} claimed by {conn_id}");
                    return true;
                }
                Err(mpsc::error::SendError(cmd)) => {
                    conn.state = ConnState::Closing;
                    let stranded = match cmd {
                        ConnCommand::Execute(req) => Some(req),
                        _ => None,
                    };
                    if let Some(req) = stranded {
                        if let Some(queue) = self.queue_mut(&key) {
                            queue.unclaim(*req);
                        }
                    }
                    return false;
                }
            }
        }

        if let Some(peer) = self.peers.get_mut(addr) {
            if let Some(conn) = peer.conn_mut(conn_id) {
                conn.hungry = true;
            }
        }
        false
    }

    fn create_connection(&mut self, addr: &PeerAddress) -> bool {
        let tls = if addr.is_tls() {
            match self.tls_client_config() {
                Ok(config) => Some(config),
                Err(error) => {
                    warn!("TLS setup for {addr} failed: {error}");
                    self.fail_peer_queues(addr, error);
                    return false;
                }
            }
        } else {
            None
        };
        let id = ConnId(self.next_conn_id);
        self.next_conn_id += 1;
        let Some(peer) = self.peers.get_mut(addr) else {
            return false;
        };
        let cfg = ConnConfig {
            id,
            addr: addr.clone(),
            settings: self.settings.clone(),
            tls,
            proxy_auth: self.proxy_auth.clone(),
            flags: peer.wire_flags(),
        };
        let cmd = connection::spawn(cfg, self.events_tx.clone());
        peer.conns.push(ConnHandle {
            id,
            cmd,
            state: ConnState::Connecting,
            inflight: 0,
            hungry: false,
        });
        self.conn_peers.insert(id, addr.clone());
        true
    }

    fn fail_peer_queues(&mut self, addr: &PeerAddress, error: Error) {
        let keys = self
            .peers
            .get(addr)
            .map(|peer| peer.queues.clone())
            .unwrap_or_default();
        for key in keys {
            let reqs = self
                .queue_mut(&key)
                .map(|queue| queue.drain_all())
                .unwrap_or_default();
            for req in reqs {
                self.fail_soon(Box::new(req), error.clone());
            }
        }
    }

    // -------------------------------------------------------------------------
    // Connection events
    // -------------------------------------------------------------------------

    fn handle_conn_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Ready { conn } => self.handle_conn_ready(conn),
            ConnEvent::ConnectFailed { conn, error } => self.handle_connect_failed(conn, error),
            ConnEvent::NeedRequest { conn } => self.handle_need_request(conn),
            ConnEvent::Response { conn, req, response } => {
                self.handle_conn_response(conn, req, response)
            }
            ConnEvent::Rejected { conn, req } => self.handle_rejected(conn, req),
            ConnEvent::Aborted { conn, req } => self.handle_conn_aborted(conn, req),
            ConnEvent::Learned {
                conn,
                allows_pipelining,
                seen_100_response,
                no_payload_sync,
            } => self.handle_learned(conn, allows_pipelining, seen_100_response, no_payload_sync),
            ConnEvent::Closed { conn, error, requeue, failed } => {
                self.handle_conn_closed(conn, error, requeue, failed)
            }
        }
    }

    fn handle_conn_ready(&mut self, conn_id: ConnId) {
        let Some(addr) = self.conn_peers.get(&conn_id).cloned() else {
            return;
        };
        if self.shutting_down {
            if let Some(peer) = self.peers.get_mut(&addr) {
                if let Some(conn) = peer.conn_mut(conn_id) {
                    conn.state = ConnState::Closing;
                    let _ = conn.cmd.send(ConnCommand::Close);
                }
            }
            return;
        }
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        if let Some(conn) = peer.conn_mut(conn_id) {
            conn.state = ConnState::Ready;
        }
        peer.connection_success();
        let keys = peer.queues.clone();
        let ip = addr.ip();
        info!("connected to {addr}");

        for key in keys {
            let ip_idx = ip
                .and_then(|ip| self.hosts.get(&key.host).and_then(|host| host.ip_index(ip)))
                .unwrap_or(0);
            let losers = match self.queue_mut(&key) {
                Some(queue) => queue.connection_success(&addr, ip_idx),
                None => continue,
            };
            for loser in losers {
                if let Some(losing_peer) = self.peers.get_mut(&loser) {
                    losing_peer.unlink_queue(&key);
                    for conn in &mut losing_peer.conns {
                        conn.state = ConnState::Closing;
                        let _ = conn.cmd.send(ConnCommand::Close);
                    }
                }
                self.gc_peer(&loser);
            }
        }
        self.trigger(addr);
    }

    fn handle_connect_failed(&mut self, conn_id: ConnId, error: Error) {
        let Some(addr) = self.conn_peers.remove(&conn_id) else {
            return;
        };
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        peer.remove_conn(conn_id);
        if self.shutting_down {
            self.gc_peer(&addr);
            self.check_shutdown_done();
            return;
        }
        warn!("connect to {addr} failed: {error}");
        peer.connection_failure(Instant::now());
        let backoff_until = peer.backoff_until;
        let keys = peer.queues.clone();
        for key in keys {
            self.queue_connection_failure(&key, &addr, &error, backoff_until);
        }
        self.gc_peer(&addr);
    }

    fn queue_connection_failure(
        &mut self,
        key: &QueueKey,
        addr: &PeerAddress,
        error: &Error,
        backoff_until: Option<Instant>,
    ) {
        let now = Instant::now();
        let ip_count = self
            .hosts
            .get(&key.host)
            .map(|host| host.ips.len().max(1))
            .unwrap_or(1);
        let max_connect = self.settings.max_connect_attempts;
        let outcome = {
            let Some(queue) = self.queue_mut(key) else {
                return;
            };
            queue.peer_disconnected(addr);
            queue.rotate_ip(ip_count, max_connect)
        };
        match outcome {
            RotateOutcome::NextIp => {
                self.queue_connection_setup(key);
            }
            RotateOutcome::Exhausted => {
                // Every candidate address failed this round: charge each
                // queued request one attempt, fail the ones that are out.
                let fail_error = match error {
                    Error::TlsError(_) => error.clone(),
                    other => Error::ConnectFailed(other.to_string()),
                };
                let released = {
                    let Some(queue) = self.queue_mut(key) else {
                        return;
                    };
                    queue.soft_connect_at = None;
                    queue.first_connect_time = None;
                    queue.connect_attempts = 0;
                    queue.take_released()
                };
                let mut survivors = 0;
                for mut req in released {
                    if req.attempts >= req.max_attempts.unwrap_or(1) {
                        self.fail_soon(Box::new(req), fail_error.clone());
                    } else {
                        req.attempts += 1;
                        if let Some(queue) = self.queue_mut(key) {
                            queue.submit(req, now);
                            survivors += 1;
                        }
                    }
                }
                if survivors > 0 {
                    if let Some(queue) = self.queue_mut(key) {
                        queue.retry_connect_at = Some(backoff_until.unwrap_or(now));
                    }
                }
            }
        }
    }

    fn handle_need_request(&mut self, conn_id: ConnId) {
        let Some(addr) = self.conn_peers.get(&conn_id).cloned() else {
            return;
        };
        if let Some(peer) = self.peers.get_mut(&addr) {
            if let Some(conn) = peer.conn_mut(conn_id) {
                conn.hungry = true;
            }
        }
        self.feed_conn(&addr, conn_id);
    }

    fn handle_conn_response(&mut self, conn_id: ConnId, req: Box<Request>, response: Response) {
        let addr = self.conn_peers.get(&conn_id).cloned();
        if let Some(addr) = &addr {
            if let Some(peer) = self.peers.get_mut(addr) {
                if let Some(conn) = peer.conn_mut(conn_id) {
                    conn.inflight = conn.inflight.saturating_sub(1);
                }
            }
        }
        self.index.remove(&req.id);
        if self.aborting.remove(&req.id) || self.shutting_down {
            self.fail_soon(req, Error::Aborted);
        } else {
            self.handle_response(req, response);
        }
        if let Some(addr) = addr {
            self.trigger(addr);
        }
    }

    /// Decides between delivering a response and redirecting, retrying or
    /// re-authenticating.
    fn handle_response(&mut self, mut req: Box<Request>, response: Response) {
        let status = response.status.as_u16();
        let now = Instant::now();

        if matches!(status, 301 | 302 | 303 | 307 | 308) && req.max_redirects.unwrap_or(0) > 0 {
            if let Some(location) = response.location().map(str::to_string) {
                let limit = req.max_redirects.unwrap_or(0);
                if req.redirects >= limit {
                    self.fail_soon(
                        req,
                        Error::InvalidRedirect(format!("redirect limit {limit} exceeded")),
                    );
                    return;
                }
                match apply_redirect(&mut req, status, &location) {
                    Ok(()) => {
                        debug!("{} redirected to {}", req.label(), req.url());
                        self.enqueue(req, true);
                    }
                    Err(error) => self.fail_soon(req, error),
                }
                return;
            }
        }

        if status == 401 && req.credentials.is_some() && !req.auth_sent {
            debug!("{} retrying with credentials", req.label());
            req.auth_sent = true;
            self.enqueue(req, false);
            return;
        }
        if status == 407 && self.proxy_auth.is_some() && !req.proxy_auth_sent {
            debug!("{} retrying with proxy credentials", req.label());
            req.proxy_auth_sent = true;
            self.enqueue(req, false);
            return;
        }

        let can_retry = req.attempts < req.max_attempts.unwrap_or(1)
            && req.deadline.is_none_or(|deadline| deadline > now)
            && (req.body.is_replayable() || !req.body_consumed);
        if status == 408 && can_retry {
            self.enqueue(req, true);
            return;
        }
        if (status == 429 || status == 503) && can_retry {
            if let Some(secs) = response.retry_after_secs() {
                let release = now + Duration::from_secs(secs);
                if req.deadline.is_none_or(|deadline| release < deadline) {
                    debug!("{} honoring Retry-After {secs}s", req.label());
                    req.release_time = Some(release);
                    self.enqueue(req, true);
                    return;
                }
            }
        }
        if status >= 500 && self.settings.retry_on_5xx && can_retry {
            self.enqueue(req, true);
            return;
        }

        self.complete(req, Ok(response));
    }

    fn handle_rejected(&mut self, conn_id: ConnId, req: Box<Request>) {
        let addr = self.conn_peers.get(&conn_id).cloned();
        if let Some(addr) = &addr {
            if let Some(peer) = self.peers.get_mut(addr) {
                if let Some(conn) = peer.conn_mut(conn_id) {
                    conn.inflight = conn.inflight.saturating_sub(1);
                    conn.hungry = false;
                }
            }
        }
        if self.shutting_down {
            self.fail_soon(req, Error::Aborted);
            return;
        }
        // Put it back at the head of its queue and let another connection
        // pick it up.
        let route = match self.route(&req) {
            Ok(route) => route,
            Err(error) => {
                self.fail_soon(req, error);
                return;
            }
        };
        let key = QueueKey { host: route.host, addr: route.queue_addr };
        if self.queue(&key).is_none() {
            self.fail_soon(req, Error::Internal("queue vanished".into()));
            return;
        }
        let id = req.id;
        let mut req = req;
        req.state = RequestState::Queued;
        if let Some(queue) = self.queue_mut(&key) {
            queue.unclaim(*req);
        }
        self.index.insert(id, Location::Queue(key));
        if let Some(addr) = addr {
            self.trigger(addr);
        }
    }

    fn handle_conn_aborted(&mut self, conn_id: ConnId, req: Box<Request>) {
        if let Some(addr) = self.conn_peers.get(&conn_id).cloned() {
            if let Some(peer) = self.peers.get_mut(&addr) {
                if let Some(conn) = peer.conn_mut(conn_id) {
                    conn.inflight = conn.inflight.saturating_sub(1);
                }
            }
            self.trigger(addr);
        }
        self.fail_soon(req, Error::Aborted);
    }

    fn handle_learned(
        &mut self,
        conn_id: ConnId,
        allows_pipelining: Option<bool>,
        seen_100_response: bool,
        no_payload_sync: bool,
    ) {
        let Some(addr) = self.conn_peers.get(&conn_id).cloned() else {
            return;
        };
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        let mut changed = false;
        if let Some(allows) = allows_pipelining {
            if peer.allows_pipelining != allows {
                debug!("peer {addr} pipelining: {allows}");
                peer.allows_pipelining = allows;
                changed = true;
            }
        }
        if seen_100_response && !peer.seen_100_response {
            peer.seen_100_response = true;
        }
        if no_payload_sync && !peer.no_payload_sync {
            debug!("peer {addr} rejected 100-continue, disabling");
            peer.no_payload_sync = true;
            changed = true;
        }
        if changed {
            let flags = peer.wire_flags();
            for conn in &peer.conns {
                let _ = conn.cmd.send(ConnCommand::UpdatePeerFlags(flags));
            }
            self.trigger(addr);
        }
    }

    fn handle_conn_closed(
        &mut self,
        conn_id: ConnId,
        error: Option<Error>,
        requeue: Vec<(Box<Request>, Error)>,
        failed: Vec<(Box<Request>, Error)>,
    ) {
        let addr = self.conn_peers.remove(&conn_id);
        if let Some(addr) = &addr {
            if let Some(peer) = self.peers.get_mut(addr) {
                peer.remove_conn(conn_id);
            }
        }
        if let (Some(addr), Some(error)) = (&addr, &error) {
            debug!("connection to {addr} lost: {error}");
        }

        for (req, error) in failed {
            self.fail_soon(req, error);
        }
        let now = Instant::now();
        for (req, error) in requeue {
            if self.shutting_down {
                self.fail_soon(req, Error::Aborted);
                continue;
            }
            let replayable = req.body.is_replayable() || !req.body_consumed;
            let attempts_left = req.attempts < req.max_attempts.unwrap_or(1);
            let deadline_ok = req.deadline.is_none_or(|deadline| deadline > now);
            if !replayable {
                self.fail_soon(req, Error::BrokenPayload("request body cannot be replayed".into()));
            } else if attempts_left && deadline_ok {
                debug!("{} resubmitted after: {error}", req.label());
                self.enqueue(req, true);
            } else {
                self.fail_soon(req, error);
            }
        }

        let Some(addr) = addr else {
            return;
        };
        if self.shutting_down {
            self.gc_peer(&addr);
            self.check_shutdown_done();
            return;
        }
        // Last connection gone: detach the peer from its queues so the
        // next submission reconnects (without backoff, per connection-lost
        // semantics).
        let peer_empty = self
            .peers
            .get(&addr)
            .is_some_and(|peer| peer.conns.is_empty());
        if peer_empty {
            let keys = self
                .peers
                .get(&addr)
                .map(|peer| peer.queues.clone())
                .unwrap_or_default();
            for key in keys {
                if let Some(queue) = self.queue_mut(&key) {
                    queue.peer_disconnected(&addr);
                }
                if self.queue(&key).is_some_and(|queue| queue.startable() > 0) {
                    self.queue_connection_setup(&key);
                }
            }
        }
        self.gc_peer(&addr);
    }

    // -------------------------------------------------------------------------
    // Abort and shutdown
    // -------------------------------------------------------------------------

    fn handle_abort(&mut self, id: RequestId) {
        match self.index.get(&id).cloned() {
            None => {} // already finished; abort is idempotent
            Some(Location::Queue(key)) => {
                if let Some(queue) = self.queue_mut(&key) {
                    if let Some(req) = queue.remove(id) {
                        debug!("{} aborted while queued", req.label());
                        self.fail_soon(Box::new(req), Error::Aborted);
                    }
                }
            }
            Some(Location::Conn(conn_id)) => {
                self.aborting.insert(id);
                if let Some(addr) = self.conn_peers.get(&conn_id) {
                    if let Some(peer) = self.peers.get(addr) {
                        if let Some(conn) = peer.conns.iter().find(|conn| conn.id == conn_id) {
                            let _ = conn.cmd.send(ConnCommand::Abort(id));
                        }
                    }
                }
            }
        }
    }

    fn handle_shutdown(&mut self, ack: oneshot::Sender<()>) {
        self.shutdown_acks.push(ack);
        if self.shutting_down {
            self.check_shutdown_done();
            return;
        }
        self.shutting_down = true;
        info!(
            "client shutting down, {} request(s) outstanding",
            self.outstanding.load(Ordering::SeqCst)
        );
        let names: Vec<Arc<str>> = self.hosts.keys().cloned().collect();
        for name in names {
            let reqs: Vec<Request> = self
                .hosts
                .get_mut(&name)
                .map(|host| {
                    host.queues
                        .values_mut()
                        .flat_map(|queue| queue.drain_all())
                        .collect()
                })
                .unwrap_or_default();
            for req in reqs {
                self.fail_soon(Box::new(req), Error::Aborted);
            }
        }
        for peer in self.peers.values_mut() {
            for conn in &mut peer.conns {
                conn.state = ConnState::Closing;
                let _ = conn.cmd.send(ConnCommand::Close);
            }
        }
        self.check_shutdown_done();
    }

    fn check_shutdown_done(&mut self) {
        if !self.shutting_down || self.done {
            return;
        }
        if !self.delayed_failures.is_empty() {
            return;
        }
        let conns_open = self.peers.values().any(|peer| !peer.conns.is_empty());
        if self.outstanding.load(Ordering::SeqCst) == 0 && !conns_open {
            for ack in self.shutdown_acks.drain(..) {
                let _ = ack.send(());
            }
            self.done = true;
        }
    }

    // -------------------------------------------------------------------------
    // Timers
    // -------------------------------------------------------------------------

    fn next_deadline(&self) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        for host in self.hosts.values() {
            for queue in host.queues.values() {
                if let Some(at) = queue.next_deadline() {
                    earliest = Some(earliest.map_or(at, |current| current.min(at)));
                }
            }
        }
        earliest
    }

    fn on_tick(&mut self, now: Instant) {
        let keys: Vec<QueueKey> = self
            .hosts
            .values()
            .flat_map(|host| host.queues.values().map(|queue| queue.key.clone()))
            .collect();
        for key in keys {
            // Delayed releases (retry backoff, Retry-After, DNS retry).
            let (released, has_ips) = {
                let Some(host) = self.hosts.get_mut(&key.host) else {
                    continue;
                };
                let has_ips = host.has_ips();
                let Some(queue) = host.queues.get_mut(&key.addr) else {
                    continue;
                };
                (queue.release_due(now), has_ips)
            };
            if released > 0 {
                if has_ips {
                    self.queue_connection_setup(&key);
                } else {
                    if let Some(queue) = self.queue_mut(&key) {
                        queue.park_released_for_dns();
                    }
                    self.start_dns(key.host.clone());
                }
            }

            // Overall deadlines of requests still waiting in the queue.
            let expired = self
                .queue_mut(&key)
                .map(|queue| queue.expire_due(now))
                .unwrap_or_default();
            for req in expired {
                self.fail_soon(Box::new(req), Error::TimedOut("request timed out".into()));
            }

            // Reconnect after backoff.
            let retry_due = self
                .queue(&key)
                .is_some_and(|queue| queue.retry_connect_at.is_some_and(|at| at <= now));
            if retry_due {
                if let Some(queue) = self.queue_mut(&key) {
                    queue.retry_connect_at = None;
                }
                self.queue_connection_setup(&key);
            }

            // Soft connect timeout: race the next IP.
            let soft_due = self.queue(&key).is_some_and(|queue| {
                queue.cur_peer.is_none() && queue.soft_connect_at.is_some_and(|at| at <= now)
            });
            if soft_due {
                self.soft_connect_advance(&key, now);
            }
        }
    }

    /// Starts an additional racing peer on the next IP without abandoning
    /// the ones already connecting.
    fn soft_connect_advance(&mut self, key: &QueueKey, now: Instant) {
        let soft_ms = self.settings.soft_connect_timeout_msecs;
        let ip_count = self
            .hosts
            .get(&key.host)
            .map(|host| host.ips.len())
            .unwrap_or(0);
        let Some(queue) = self.queue_mut(key) else {
            return;
        };
        queue.soft_connect_at = None;
        if ip_count <= 1 {
            return;
        }
        let next = (queue.ips_connect_idx + 1) % ip_count;
        if next == queue.ips_connect_start_idx {
            return; // every address already has a racer
        }
        debug!("soft connect timeout on {}, racing next address", key.host);
        queue.ips_connect_idx = next;
        if soft_ms > 0 {
            queue.soft_connect_at = Some(now + Duration::from_millis(soft_ms));
        }
        self.queue_connection_setup(key);
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn parse_proxy(raw: &str) -> Result<ProxyRoute, Error> {
    let url = Url::parse(raw).map_err(|e| Error::InvalidUrl(format!("{raw}: {e}")))?;
    if url.scheme() != "http" {
        return Err(Error::InvalidUrl(format!(
            "proxy scheme {} not supported",
            url.scheme()
        )));
    }
    let (host, target) = match url.host() {
        Some(url::Host::Domain(domain)) => {
            (Arc::from(domain.to_ascii_lowercase()), RouteTarget::Name)
        }
        Some(url::Host::Ipv4(ip)) => (Arc::from(ip.to_string()), RouteTarget::Ip(IpAddr::V4(ip))),
        Some(url::Host::Ipv6(ip)) => (Arc::from(ip.to_string()), RouteTarget::Ip(IpAddr::V6(ip))),
        None => return Err(Error::InvalidUrl("proxy URL has no host".into())),
    };
    Ok(ProxyRoute {
        host,
        target,
        port: url.port().unwrap_or(HTTP_DEFAULT_PORT),
    })
}

/// Rewrites a request for a 3xx redirect. A 303 becomes a bodyless GET;
/// other redirect statuses re-send the original method and body.
fn apply_redirect(req: &mut Request, status: u16, location: &str) -> Result<(), Error> {
    let target = req
        .url
        .join(location)
        .map_err(|e| Error::InvalidRedirect(format!("{location:?}: {e}")))?;
    match target.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::InvalidRedirect(format!(
                "unsupported scheme {other:?}"
            )));
        }
    }
    if target.host_str().is_none() {
        return Err(Error::InvalidRedirect("redirect target has no host".into()));
    }

    if status == 303 && req.method != http::Method::HEAD {
        req.method = http::Method::GET;
        req.body = crate::body::Body::Empty;
        req.body_consumed = false;
        req.chunked = false;
        req.payload_sync = false;
        req.headers.remove(http::header::CONTENT_LENGTH);
        req.headers.remove(http::header::TRANSFER_ENCODING);
        req.have.content_length = false;
        req.have.transfer_encoding = false;
    }

    let cross_origin = target.host_str() != req.url.host_str()
        || target.port_or_known_default() != req.url.port_or_known_default();
    if cross_origin {
        // Do not replay credentials against a different origin.
        req.auth_sent = false;
        req.proxy_auth_sent = false;
    }

    req.redirects += 1;
    req.attempts = 0;
    req.release_time = None;
    req.url = target;
    Ok(())
}
