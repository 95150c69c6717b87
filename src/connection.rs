//! One HTTP/1.x connection: connect, tunnel, send, receive, time out.
//!
//! Each connection runs as its own task owning the socket, the response
//! parser and the FIFO wait-list of sent requests. It talks to the engine
//! exclusively through [`ConnEvent`]s and is driven by [`ConnCommand`]s;
//! requests move in and out by value.

use crate::body::Body;
use crate::client::Event;
use crate::error::Error;
use crate::peer_addr::PeerAddress;
use crate::request::{Request, RequestState};
use crate::response::Response;
use crate::settings::Settings;
use crate::types::{CONTINUE_TIMEOUT_MS, ConnId, RequestId};
use crate::wire::{self, BodyFraming, BodyProgress, ResponseHead};
use bytes::{Bytes, BytesMut};
use http::{HeaderValue, Method, Version};
use std::collections::VecDeque;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf,
};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, sleep_until, timeout_at};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::{debug, trace, warn};

/// Don't pull more body chunks while this much output is unflushed.
const OUTBOX_HIGH_WATER: usize = 64 * 1024;

/// Peer-level wire behavior, learned from responses and shared across the
/// peer's connections.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PeerWireFlags {
    /// First response arrived over HTTP/1.1 without `Connection: close`.
    pub allows_pipelining: bool,
    /// The peer rejected `Expect: 100-continue` before; stop using it.
    pub no_payload_sync: bool,
}

pub(crate) enum ConnCommand {
    /// Send this request next.
    Execute(Box<Request>),
    UpdatePeerFlags(PeerWireFlags),
    Abort(RequestId),
    Close,
}

pub(crate) enum ConnEvent {
    /// Transport established (TCP, tunnel and TLS as applicable).
    Ready { conn: ConnId },
    ConnectFailed { conn: ConnId, error: Error },
    /// The connection can take another request.
    NeedRequest { conn: ConnId },
    /// A complete response, matched to its request in send order.
    Response {
        conn: ConnId,
        req: Box<Request>,
        response: Response,
    },
    /// An `Execute` the connection could not act on; requeue it.
    Rejected { conn: ConnId, req: Box<Request> },
    /// An aborted request handed back for its final callback.
    Aborted { conn: ConnId, req: Box<Request> },
    /// Wire behavior worth recording on the peer.
    Learned {
        conn: ConnId,
        allows_pipelining: Option<bool>,
        seen_100_response: bool,
        no_payload_sync: bool,
    },
    /// The connection is gone. `requeue` requests never saw response
    /// bytes and may be retried; `failed` ones are final.
    Closed {
        conn: ConnId,
        error: Option<Error>,
        requeue: Vec<(Box<Request>, Error)>,
        failed: Vec<(Box<Request>, Error)>,
    },
}

pub(crate) struct ConnConfig {
    pub id: ConnId,
    pub addr: PeerAddress,
    pub settings: Arc<Settings>,
    pub tls: Option<Arc<ClientConfig>>,
    pub proxy_auth: Option<HeaderValue>,
    pub flags: PeerWireFlags,
}

/// Spawns the connection task; returns its command channel.
pub(crate) fn spawn(
    cfg: ConnConfig,
    events: mpsc::UnboundedSender<Event>,
) -> mpsc::UnboundedSender<ConnCommand> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    tokio::spawn(run(cfg, cmd_rx, events));
    cmd_tx
}

async fn run(
    cfg: ConnConfig,
    commands: mpsc::UnboundedReceiver<ConnCommand>,
    events: mpsc::UnboundedSender<Event>,
) {
    let id = cfg.id;
    let deadline = Instant::now() + cfg.settings.connect_timeout();
    debug!("{} connecting to {}", id, cfg.addr);
    let stream = match timeout_at(deadline, establish(&cfg)).await {
        Err(_) => {
            let error = Error::ConnectFailed(format!("{}: connect timed out", cfg.addr));
            let _ = events.send(Event::Conn(ConnEvent::ConnectFailed { conn: id, error }));
            return;
        }
        Ok(Err(error)) => {
            let _ = events.send(Event::Conn(ConnEvent::ConnectFailed { conn: id, error }));
            return;
        }
        Ok(Ok(stream)) => stream,
    };
    debug!("{} connected to {}", id, cfg.addr);
    if events
        .send(Event::Conn(ConnEvent::Ready { conn: id }))
        .is_err()
    {
        return;
    }
    Conn::new(cfg, stream, events).run(commands).await;
}

// =============================================================================
// TRANSPORT
// =============================================================================

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

async fn establish(cfg: &ConnConfig) -> Result<Stream, Error> {
    match &cfg.addr {
        PeerAddress::Http { ip, port } | PeerAddress::Raw { ip, port } => {
            let tcp = TcpStream::connect((*ip, *port))
                .await
                .map_err(|e| Error::ConnectFailed(format!("{}: {e}", cfg.addr)))?;
            Ok(Stream::Tcp(tcp))
        }
        PeerAddress::Unix { path } => {
            let unix = UnixStream::connect(path.as_ref())
                .await
                .map_err(|e| Error::ConnectFailed(format!("{}: {e}", cfg.addr)))?;
            Ok(Stream::Unix(unix))
        }
        PeerAddress::Https { ip, port, name } => {
            let tcp = TcpStream::connect((*ip, *port))
                .await
                .map_err(|e| Error::ConnectFailed(format!("{}: {e}", cfg.addr)))?;
            tls_handshake(cfg, tcp, name).await
        }
        PeerAddress::HttpsTunnel { ip, port, name, dest_port } => {
            let mut tcp = TcpStream::connect((*ip, *port))
                .await
                .map_err(|e| Error::ConnectFailed(format!("{}: {e}", cfg.addr)))?;
            tunnel_connect(cfg, &mut tcp, name, *dest_port).await?;
            tls_handshake(cfg, tcp, name).await
        }
    }
}

async fn tls_handshake(cfg: &ConnConfig, tcp: TcpStream, name: &str) -> Result<Stream, Error> {
    let config = cfg
        .tls
        .clone()
        .ok_or_else(|| Error::Internal("TLS config missing for TLS peer".into()))?;
    let server_name = ServerName::try_from(name.to_string())
        .map_err(|e| Error::TlsError(format!("{name}: {e}")))?;
    let tls = TlsConnector::from(config)
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::TlsError(format!("{name}: {e}")))?;
    Ok(Stream::Tls(Box::new(tls)))
}

/// Establishes a CONNECT tunnel for `name:dest_port` through the proxy the
/// stream is connected to. A non-2xx proxy response fails the connect with
/// the status surfaced in the error.
async fn tunnel_connect(
    cfg: &ConnConfig,
    tcp: &mut TcpStream,
    name: &str,
    dest_port: u16,
) -> Result<(), Error> {
    let authority = format!("{name}:{dest_port}");
    let mut out = BytesMut::new();
    wire::write_connect(&authority, cfg.proxy_auth.as_ref(), &mut out);
    tcp.write_all(&out)
        .await
        .map_err(|e| Error::ConnectFailed(format!("CONNECT write: {e}")))?;

    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(head) = wire::parse_head(&mut buf)? {
            if !head.status.is_success() {
                return Err(Error::ConnectFailed(format!(
                    "CONNECT {authority} rejected: {} {}",
                    head.status.as_u16(),
                    head.reason
                )));
            }
            if !buf.is_empty() {
                return Err(Error::BadResponse("data after CONNECT response".into()));
            }
            return Ok(());
        }
        let n = tcp
            .read_buf(&mut buf)
            .await
            .map_err(|e| Error::ConnectFailed(format!("CONNECT read: {e}")))?;
        if n == 0 {
            return Err(Error::ConnectFailed(format!(
                "CONNECT {authority}: proxy closed the connection"
            )));
        }
    }
}

// =============================================================================
// CONNECTION TASK
// =============================================================================

struct InFlight {
    /// `None` marks an aborted request whose response is read and
    /// discarded to keep the pipeline in sync.
    req: Option<Box<Request>>,
    method: Method,
    attempt_timeout: Option<Duration>,
    attempt_deadline: Option<Instant>,
    absolute_deadline: Option<Instant>,
    got_bytes: bool,
}

struct Sending {
    req: Box<Request>,
    body_done: bool,
    /// Holding the body back for `100 Continue`.
    await_continue: bool,
    continue_deadline: Option<Instant>,
    was_sync: bool,
}

enum ReadState {
    Head,
    Body {
        head: ResponseHead,
        framing: BodyFraming,
        collected: BytesMut,
    },
}

struct RawLog {
    file: std::fs::File,
}

impl RawLog {
    fn open(dir: &Path, label: &str) -> Option<Self> {
        std::fs::create_dir_all(dir).ok()?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{label}.log")))
            .ok()?;
        Some(Self { file })
    }

    fn dump(&mut self, direction: &str, data: &[u8]) {
        use std::io::Write;
        let _ = writeln!(self.file, "{direction} {} bytes", data.len());
        let _ = self.file.write_all(data);
        let _ = self.file.write_all(b"\n");
    }
}

struct Conn {
    id: ConnId,
    addr: PeerAddress,
    settings: Arc<Settings>,
    proxy_auth: Option<HeaderValue>,
    events: mpsc::UnboundedSender<Event>,
    reader: ReadHalf<Stream>,
    writer: WriteHalf<Stream>,
    inbuf: BytesMut,
    outbox: BytesMut,
    read_state: ReadState,
    wait_list: VecDeque<InFlight>,
    sending: Option<Sending>,
    flags: PeerWireFlags,
    /// First response seen; pipelining support decided.
    pipelining_probed: bool,
    output_locked: bool,
    output_broken: bool,
    close_indicated: bool,
    closing: bool,
    asked_for_work: bool,
    last_byte: Instant,
    idle_since: Instant,
    rawlog: Option<RawLog>,
}

impl Conn {
    fn new(cfg: ConnConfig, stream: Stream, events: mpsc::UnboundedSender<Event>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let rawlog = cfg
            .settings
            .rawlog_dir
            .as_deref()
            .and_then(|dir| RawLog::open(dir, &format!("conn{}", cfg.id.0)));
        let now = Instant::now();
        Self {
            id: cfg.id,
            addr: cfg.addr,
            settings: cfg.settings,
            proxy_auth: cfg.proxy_auth,
            events,
            reader,
            writer,
            inbuf: BytesMut::with_capacity(8 * 1024),
            outbox: BytesMut::new(),
            read_state: ReadState::Head,
            wait_list: VecDeque::new(),
            sending: None,
            flags: cfg.flags,
            pipelining_probed: false,
            output_locked: false,
            output_broken: false,
            close_indicated: false,
            closing: false,
            asked_for_work: false,
            last_byte: now,
            idle_since: now,
            rawlog,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ConnCommand>) {
        self.maybe_ask_work();
        loop {
            if self.closing {
                return;
            }
            let can_write = !self.outbox.is_empty();
            let want_chunk = self.want_body_chunk();
            let deadline = self.next_deadline();
            let sleep_to = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(ConnCommand::Execute(req)) => self.start_request(req),
                    Some(ConnCommand::UpdatePeerFlags(flags)) => {
                        self.flags = flags;
                        self.maybe_ask_work();
                    }
                    Some(ConnCommand::Abort(id)) => self.abort_request(id),
                    Some(ConnCommand::Close) | None => self.close(None),
                },
                result = self.reader.read_buf(&mut self.inbuf) => match result {
                    Ok(0) => self.on_eof(),
                    Ok(n) => self.on_bytes(n),
                    Err(e) => self.close(Some(Error::ConnectionLost(format!("read: {e}")))),
                },
                result = self.writer.write_buf(&mut self.outbox), if can_write => match result {
                    Ok(_) => self.after_write(),
                    Err(e) => self.close(Some(Error::ConnectionLost(format!("write: {e}")))),
                },
                chunk = pull_chunk(&mut self.sending), if want_chunk => self.on_body_chunk(chunk),
                _ = sleep_until(sleep_to), if deadline.is_some() => self.on_deadline(Instant::now()),
            }
        }
    }

    fn send_event(&self, event: ConnEvent) {
        let _ = self.events.send(Event::Conn(event));
    }

    fn is_idle(&self) -> bool {
        self.wait_list.is_empty() && self.sending.is_none()
    }

    // -------------------------------------------------------------------------
    // Output
    // -------------------------------------------------------------------------

    fn start_request(&mut self, mut req: Box<Request>) {
        self.asked_for_work = false;
        if self.closing
            || self.output_broken
            || self.close_indicated
            || self.output_locked
            || self.sending.is_some()
        {
            self.send_event(ConnEvent::Rejected { conn: self.id, req });
            return;
        }
        req.state = RequestState::PayloadOut;
        let has_payload = !matches!(req.body, Body::Empty);
        let sync = req.payload_sync && has_payload && !self.flags.no_payload_sync;

        let before = self.outbox.len();
        wire::write_head(&req, &self.settings, self.proxy_auth.as_ref(), sync, &mut self.outbox);
        self.log_out(before);
        trace!("{} sending {}", self.id, req.label());

        self.output_locked = true;
        self.sending = Some(Sending {
            req,
            body_done: false,
            await_continue: sync,
            continue_deadline: sync
                .then(|| Instant::now() + Duration::from_millis(CONTINUE_TIMEOUT_MS)),
            was_sync: sync,
        });
        if !sync {
            self.enqueue_body();
        }
    }

    /// Appends the body of the in-progress request to the outbox. Channel
    /// bodies stream through `pull_chunk` instead.
    fn enqueue_body(&mut self) {
        let Some(sending) = self.sending.as_mut() else {
            return;
        };
        let chunked = sending.req.chunked;
        let before = self.outbox.len();
        match &sending.req.body {
            Body::Empty => sending.body_done = true,
            Body::Bytes(data) => {
                let data = data.clone();
                if chunked {
                    wire::write_chunk(&data, &mut self.outbox);
                    wire::write_last_chunk(&mut self.outbox);
                } else {
                    self.outbox.extend_from_slice(&data);
                }
                sending.body_done = true;
            }
            Body::Channel { .. } => {
                // Streamed through the select loop.
            }
            Body::Consumed => {
                warn!("{} request body already consumed", self.id);
                if chunked {
                    wire::write_last_chunk(&mut self.outbox);
                }
                sending.body_done = true;
            }
        }
        self.log_out(before);
        self.maybe_finish_send();
    }

    fn want_body_chunk(&self) -> bool {
        match &self.sending {
            Some(sending) => {
                !sending.body_done
                    && !sending.await_continue
                    && matches!(sending.req.body, Body::Channel { .. })
                    && self.outbox.len() < OUTBOX_HIGH_WATER
            }
            None => false,
        }
    }

    fn on_body_chunk(&mut self, chunk: Option<Result<Bytes, std::io::Error>>) {
        let Some(sending) = self.sending.as_mut() else {
            return;
        };
        let chunked = sending.req.chunked;
        match chunk {
            Some(Ok(data)) => {
                sending.req.body_consumed = true;
                let before = self.outbox.len();
                if chunked {
                    wire::write_chunk(&data, &mut self.outbox);
                } else {
                    self.outbox.extend_from_slice(&data);
                }
                self.log_out(before);
            }
            Some(Err(e)) => {
                self.output_broken = true;
                self.close(Some(Error::BrokenPayload(e.to_string())));
            }
            None => {
                sending.body_done = true;
                let before = self.outbox.len();
                if chunked {
                    wire::write_last_chunk(&mut self.outbox);
                }
                self.log_out(before);
                self.maybe_finish_send();
            }
        }
    }

    fn after_write(&mut self) {
        if self.outbox.is_empty() {
            self.maybe_finish_send();
        }
    }

    fn maybe_finish_send(&mut self) {
        let ready = self.outbox.is_empty()
            && matches!(&self.sending, Some(s) if s.body_done && !s.await_continue);
        if !ready {
            return;
        }
        let Some(mut sending) = self.sending.take() else {
            return;
        };
        sending.req.state = RequestState::Waiting;
        let attempt_timeout = sending.req.attempt_timeout.or_else(|| {
            let ms = self.settings.attempt_timeout_msecs;
            (ms > 0).then(|| Duration::from_millis(ms))
        });
        let now = Instant::now();
        trace!("{} request {} on the wire", self.id, sending.req.label());
        self.wait_list.push_back(InFlight {
            method: sending.req.method.clone(),
            attempt_timeout,
            attempt_deadline: attempt_timeout.map(|t| now + t),
            absolute_deadline: sending.req.deadline,
            got_bytes: false,
            req: Some(sending.req),
        });
        // Output stays locked behind a 100-continue request, and while
        // pipelining support is unknown or absent.
        self.output_locked = sending.was_sync || !self.flags.allows_pipelining;
        self.maybe_ask_work();
    }

    fn maybe_ask_work(&mut self) {
        if self.closing
            || self.output_broken
            || self.close_indicated
            || self.asked_for_work
            || self.output_locked
            || self.sending.is_some()
        {
            return;
        }
        if self.wait_list.len() >= self.settings.max_pipelined() {
            return;
        }
        if !self.wait_list.is_empty() && !self.flags.allows_pipelining {
            return;
        }
        self.asked_for_work = true;
        self.send_event(ConnEvent::NeedRequest { conn: self.id });
    }

    // -------------------------------------------------------------------------
    // Input
    // -------------------------------------------------------------------------

    fn on_bytes(&mut self, n: usize) {
        self.last_byte = Instant::now();
        if let Some(log) = self.rawlog.as_mut() {
            let start = self.inbuf.len() - n;
            log.dump("<<", &self.inbuf[start..]);
        }
        if let Err(error) = self.process_input() {
            self.output_broken = true;
            self.close(Some(error));
        }
    }

    fn process_input(&mut self) -> Result<(), Error> {
        loop {
            if self.closing {
                return Ok(());
            }
            if matches!(self.read_state, ReadState::Head) {
                if self.inbuf.is_empty() {
                    return Ok(());
                }
                if let Some(front) = self.wait_list.front_mut() {
                    front.got_bytes = true;
                }
                let Some(head) = wire::parse_head(&mut self.inbuf)? else {
                    return Ok(());
                };
                if head.is_interim() {
                    self.on_interim(head);
                    continue;
                }
                self.on_final_head(head)?;
            } else if let ReadState::Body { head, mut framing, mut collected } =
                std::mem::replace(&mut self.read_state, ReadState::Head)
            {
                match wire::read_body(&mut framing, &mut self.inbuf, &mut collected)? {
                    BodyProgress::Complete => self.complete_response(head, collected)?,
                    BodyProgress::NeedMore => {
                        self.read_state = ReadState::Body { head, framing, collected };
                        return Ok(());
                    }
                }
            }
        }
    }

    fn on_interim(&mut self, head: ResponseHead) {
        if head.status != http::StatusCode::CONTINUE {
            trace!("{} ignoring interim {}", self.id, head.status);
            return;
        }
        let Some(sending) = self.sending.as_mut() else {
            return;
        };
        if !sending.await_continue {
            return;
        }
        sending.await_continue = false;
        sending.continue_deadline = None;
        self.send_event(ConnEvent::Learned {
            conn: self.id,
            allows_pipelining: None,
            seen_100_response: true,
            no_payload_sync: false,
        });
        self.enqueue_body();
    }

    fn on_final_head(&mut self, head: ResponseHead) -> Result<(), Error> {
        if self.wait_list.is_empty() {
            // A final response racing the request we are still sending:
            // the server rejected the payload before reading it. The body
            // is withheld and the connection cannot be reused.
            let Some(sending) = self.sending.take() else {
                return Err(Error::BadResponse("unsolicited response".into()));
            };
            if sending.was_sync {
                self.send_event(ConnEvent::Learned {
                    conn: self.id,
                    allows_pipelining: None,
                    seen_100_response: false,
                    no_payload_sync: true,
                });
            }
            self.output_broken = true;
            self.output_locked = false;
            self.wait_list.push_back(InFlight {
                method: sending.req.method.clone(),
                attempt_timeout: None,
                attempt_deadline: None,
                absolute_deadline: sending.req.deadline,
                got_bytes: true,
                req: Some(sending.req),
            });
        }
        let front = self
            .wait_list
            .front()
            .ok_or_else(|| Error::Internal("response without a waiting request".into()))?;
        let framing = wire::framing_for(&head, &front.method)?;
        if matches!(framing, BodyFraming::None) {
            self.complete_response(head, BytesMut::new())
        } else {
            self.read_state = ReadState::Body {
                head,
                framing,
                collected: BytesMut::new(),
            };
            Ok(())
        }
    }

    fn complete_response(&mut self, head: ResponseHead, body: BytesMut) -> Result<(), Error> {
        let entry = self
            .wait_list
            .pop_front()
            .ok_or_else(|| Error::Internal("response without a waiting request".into()))?;

        if !self.pipelining_probed {
            self.pipelining_probed = true;
            let allows = head.version == Version::HTTP_11 && !head.connection_close();
            self.flags.allows_pipelining = allows;
            self.send_event(ConnEvent::Learned {
                conn: self.id,
                allows_pipelining: Some(allows),
                seen_100_response: false,
                no_payload_sync: false,
            });
        }
        if head.connection_close() {
            self.close_indicated = true;
        }

        match entry.req {
            None => debug!("{} discarded response for aborted request", self.id),
            Some(mut req) => {
                req.state = RequestState::GotResponse;
                let response = Response {
                    version: head.version,
                    status: head.status,
                    reason: head.reason,
                    headers: head.headers,
                    body: body.freeze(),
                    attempts: req.attempts,
                    redirects: req.redirects,
                };
                trace!("{} response {} for {}", self.id, response.status, req.label());
                self.send_event(ConnEvent::Response {
                    conn: self.id,
                    req,
                    response,
                });
            }
        }

        if self.sending.is_none() {
            self.output_locked = false;
        }
        if self.is_idle() {
            self.idle_since = Instant::now();
        }
        if self.close_indicated || self.output_broken {
            self.close(None);
        } else {
            self.maybe_ask_work();
        }
        Ok(())
    }

    fn on_eof(&mut self) {
        // Read-to-EOF payloads complete here.
        if let ReadState::Body { head, framing, collected } =
            std::mem::replace(&mut self.read_state, ReadState::Head)
        {
            if framing.needs_eof() {
                self.close_indicated = true;
                if let Err(error) = self.complete_response(head, collected) {
                    self.close(Some(error));
                }
                self.close(None);
            } else {
                self.close(Some(Error::ConnectionLost("EOF inside response".into())));
            }
            return;
        }
        if self.is_idle() {
            debug!("{} closed by peer while idle", self.id);
            self.close(None);
        } else {
            self.close(Some(Error::ConnectionLost("connection closed by peer".into())));
        }
    }

    // -------------------------------------------------------------------------
    // Cancellation and teardown
    // -------------------------------------------------------------------------

    fn abort_request(&mut self, id: RequestId) {
        if matches!(&self.sending, Some(s) if s.req.id == id) {
            // Mid-send: the stream is desynchronized, close after handing
            // the request back.
            if let Some(sending) = self.sending.take() {
                self.send_event(ConnEvent::Aborted { conn: self.id, req: sending.req });
            }
            self.output_broken = true;
            self.close(None);
            return;
        }
        if let Some(entry) = self
            .wait_list
            .iter_mut()
            .find(|entry| entry.req.as_ref().is_some_and(|req| req.id == id))
        {
            // Already on the wire: leave a tombstone so the response is
            // read and discarded in order.
            if let Some(req) = entry.req.take() {
                self.send_event(ConnEvent::Aborted { conn: self.id, req });
            }
        }
    }

    fn close(&mut self, error: Option<Error>) {
        if self.closing {
            return;
        }
        self.closing = true;
        let now = Instant::now();
        let default_error = error
            .clone()
            .unwrap_or_else(|| Error::ConnectionLost("connection closed".into()));

        let mut requeue: Vec<(Box<Request>, Error)> = Vec::new();
        let mut failed: Vec<(Box<Request>, Error)> = Vec::new();

        if let Some(sending) = self.sending.take() {
            let req = sending.req;
            if req.deadline.is_some_and(|deadline| deadline <= now) {
                failed.push((req, Error::TimedOut("request timed out".into())));
            } else {
                requeue.push((req, default_error.clone()));
            }
        }
        for entry in self.wait_list.drain(..) {
            let Some(req) = entry.req else { continue };
            if entry.absolute_deadline.is_some_and(|deadline| deadline <= now) {
                failed.push((req, Error::TimedOut("request timed out".into())));
            } else if entry.got_bytes {
                failed.push((
                    req,
                    error
                        .clone()
                        .unwrap_or_else(|| Error::ConnectionLost("closed mid response".into())),
                ));
            } else {
                requeue.push((req, default_error.clone()));
            }
        }

        debug!(
            "{} to {} closed ({}), {} to requeue, {} failed",
            self.id,
            self.addr,
            error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "graceful".into()),
            requeue.len(),
            failed.len()
        );
        self.send_event(ConnEvent::Closed {
            conn: self.id,
            error,
            requeue,
            failed,
        });
    }

    // -------------------------------------------------------------------------
    // Timeouts
    // -------------------------------------------------------------------------

    fn next_deadline(&self) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        let mut merge = |candidate: Option<Instant>| {
            if let Some(at) = candidate {
                earliest = Some(earliest.map_or(at, |current| current.min(at)));
            }
        };

        if let Some(sending) = &self.sending {
            merge(sending.continue_deadline);
            merge(sending.req.deadline);
        }
        if let Some(front) = self.wait_list.front() {
            merge(front.attempt_deadline);
            merge(front.attempt_timeout.map(|t| self.last_byte + t));
        }
        for entry in &self.wait_list {
            merge(entry.absolute_deadline);
        }
        if self.is_idle() && self.settings.max_idle_time_msecs > 0 {
            merge(Some(
                self.idle_since + Duration::from_millis(self.settings.max_idle_time_msecs),
            ));
        }
        earliest
    }

    fn on_deadline(&mut self, now: Instant) {
        // 100-continue grace expired: send the body anyway.
        let continue_expired = matches!(
            &self.sending,
            Some(s) if s.await_continue && s.continue_deadline.is_some_and(|at| at <= now)
        );
        if continue_expired {
            debug!("{} no 100 Continue, sending payload", self.id);
            if let Some(sending) = self.sending.as_mut() {
                sending.await_continue = false;
                sending.continue_deadline = None;
            }
            self.enqueue_body();
        }

        let overall_expired = self
            .wait_list
            .iter()
            .any(|entry| entry.absolute_deadline.is_some_and(|at| at <= now))
            || matches!(&self.sending, Some(s) if s.req.deadline.is_some_and(|at| at <= now));
        if overall_expired {
            self.close(Some(Error::TimedOut("request timed out".into())));
            return;
        }

        if let Some(front) = self.wait_list.front() {
            let attempt_expired = front.attempt_deadline.is_some_and(|at| at <= now);
            let stalled = front
                .attempt_timeout
                .is_some_and(|t| self.last_byte + t <= now);
            if attempt_expired || stalled {
                self.close(Some(Error::TimedOut("no response within attempt timeout".into())));
                return;
            }
        }

        if self.is_idle() && self.settings.max_idle_time_msecs > 0 {
            let idle_deadline =
                self.idle_since + Duration::from_millis(self.settings.max_idle_time_msecs);
            if idle_deadline <= now {
                debug!("{} to {} idle, closing", self.id, self.addr);
                self.close(None);
            }
        }
    }

    fn log_out(&mut self, from: usize) {
        if let Some(log) = self.rawlog.as_mut() {
            if self.outbox.len() > from {
                log.dump(">>", &self.outbox[from..]);
            }
        }
    }
}

/// Awaits the next chunk of a channel body. Pends forever for any other
/// body kind; the select guard keeps it from being polled in that case.
async fn pull_chunk(sending: &mut Option<Sending>) -> Option<Result<Bytes, std::io::Error>> {
    if let Some(sending) = sending.as_mut() {
        if let Body::Channel { rx, .. } = &mut sending.req.body {
            return rx.recv().await;
        }
    }
    std::future::pending().await
}
