//! HTTP/1.x message formatting and parsing.
//!
//! The dispatch engine treats this module as a collaborator: it hands in a
//! request head to serialize, feeds raw bytes to [`parse_head`] and
//! [`read_body`], and gets complete heads, payload bytes and a completion
//! signal back.

use crate::error::Error;
use crate::request::Request;
use crate::settings::Settings;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Buf, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use std::time::{SystemTime, UNIX_EPOCH};

/// Upper bound on response headers. Transactional peers stay far below
/// this; anything beyond is treated as a malformed response.
const MAX_HEADERS: usize = 64;

/// Longest accepted chunk-size line, extensions included.
const MAX_CHUNK_LINE: usize = 1024;

// =============================================================================
// REQUEST SERIALIZATION
// =============================================================================

/// Writes the request line and headers, including everything the client
/// generates on the caller's behalf (`Host`, `Date`, `User-Agent`,
/// authentication, body framing, `Expect`).
pub(crate) fn write_head(
    req: &Request,
    settings: &Settings,
    proxy_auth: Option<&HeaderValue>,
    expect_continue: bool,
    out: &mut BytesMut,
) {
    out.extend_from_slice(req.method.as_str().as_bytes());
    out.extend_from_slice(b" ");
    if req.absolute_form {
        out.extend_from_slice(req.url.scheme().as_bytes());
        out.extend_from_slice(b"://");
        out.extend_from_slice(req.authority.as_bytes());
    }
    out.extend_from_slice(req.url.path().as_bytes());
    if let Some(query) = req.url.query() {
        out.extend_from_slice(b"?");
        out.extend_from_slice(query.as_bytes());
    }
    out.extend_from_slice(b" HTTP/1.1\r\n");

    if !req.have.host {
        write_header_str(out, "Host", &req.authority);
    }
    if !req.have.date {
        write_header_str(out, "Date", &imf_fixdate(SystemTime::now()));
    }
    if !req.have.user_agent {
        if let Some(agent) = &settings.user_agent {
            write_header_str(out, "User-Agent", agent);
        }
    }
    for (name, value) in req.headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if req.auth_sent && !req.have.authorization {
        if let Some((user, pass)) = &req.credentials {
            let value = basic_auth(user, pass);
            write_header_str(out, "Authorization", value.to_str().unwrap_or(""));
        }
    }
    if req.proxy_auth_sent && !req.have.proxy_authorization {
        if let Some(value) = proxy_auth {
            write_header_str(out, "Proxy-Authorization", value.to_str().unwrap_or(""));
        }
    }

    let has_payload = !matches!(req.body, crate::body::Body::Empty);
    if has_payload {
        if req.chunked {
            if !req.have.transfer_encoding {
                write_header_str(out, "Transfer-Encoding", "chunked");
            }
        } else if !req.have.content_length {
            let len = req.body.len().unwrap_or(0);
            write_header_str(out, "Content-Length", &len.to_string());
        }
        if expect_continue && !req.have.expect {
            write_header_str(out, "Expect", "100-continue");
        }
    }
    out.extend_from_slice(b"\r\n");
}

/// Synthesized `CONNECT` for tunnel establishment.
pub(crate) fn write_connect(
    authority: &str,
    proxy_auth: Option<&HeaderValue>,
    out: &mut BytesMut,
) {
    out.extend_from_slice(b"CONNECT ");
    out.extend_from_slice(authority.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    write_header_str(out, "Host", authority);
    if let Some(value) = proxy_auth {
        write_header_str(out, "Proxy-Authorization", value.to_str().unwrap_or(""));
    }
    out.extend_from_slice(b"\r\n");
}

fn write_header_str(out: &mut BytesMut, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

pub(crate) fn basic_auth(user: &str, pass: &str) -> HeaderValue {
    let token = BASE64.encode(format!("{user}:{pass}"));
    HeaderValue::try_from(format!("Basic {token}"))
        .unwrap_or_else(|_| HeaderValue::from_static("Basic"))
}

/// Appends one chunk of a chunked-encoded body.
pub(crate) fn write_chunk(data: &[u8], out: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Terminates a chunked-encoded body.
pub(crate) fn write_last_chunk(out: &mut BytesMut) {
    out.extend_from_slice(b"0\r\n\r\n");
}

/// IMF-fixdate (RFC 9110) for the `Date` header.
pub(crate) fn imf_fixdate(t: SystemTime) -> String {
    const DAYS: [&str; 7] = ["Thu", "Fri", "Sat", "Sun", "Mon", "Tue", "Wed"];
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    let secs = t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let days = (secs / 86_400) as i64;
    let sod = secs % 86_400;

    // Civil-from-days (era-based conversion from the Gregorian calendar).
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    format!(
        "{}, {:02} {} {:04} {:02}:{:02}:{:02} GMT",
        DAYS[(days % 7) as usize],
        day,
        MONTHS[(month - 1) as usize],
        year,
        sod / 3600,
        (sod % 3600) / 60,
        sod % 60,
    )
}

// =============================================================================
// RESPONSE PARSING
// =============================================================================

/// A parsed response head.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn is_interim(&self) -> bool {
        self.status.is_informational()
    }

    /// `Connection: close`, or an HTTP/1.0 peer that did not opt in to
    /// keep-alive.
    pub fn connection_close(&self) -> bool {
        if header_has_token(&self.headers, http::header::CONNECTION, "close") {
            return true;
        }
        self.version == Version::HTTP_10
            && !header_has_token(&self.headers, http::header::CONNECTION, "keep-alive")
    }
}

/// Parses a response head out of `buf`, consuming it on success. Returns
/// `None` when more bytes are needed.
pub(crate) fn parse_head(buf: &mut BytesMut) -> Result<Option<ResponseHead>, Error> {
    let (consumed, head) = {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut slots);
        match parsed.parse(&buf[..]) {
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(Error::BadResponse(format!("response head: {e}"))),
            Ok(httparse::Status::Complete(consumed)) => {
                let version = match parsed.version {
                    Some(0) => Version::HTTP_10,
                    _ => Version::HTTP_11,
                };
                let status = StatusCode::from_u16(parsed.code.unwrap_or(0))
                    .map_err(|_| Error::BadResponse("status out of range".into()))?;
                let reason = parsed.reason.unwrap_or("").to_string();
                let mut headers = HeaderMap::with_capacity(parsed.headers.len());
                for header in parsed.headers.iter() {
                    let name = HeaderName::from_bytes(header.name.as_bytes())
                        .map_err(|e| Error::BadResponse(format!("header name: {e}")))?;
                    let value = HeaderValue::from_bytes(header.value)
                        .map_err(|e| Error::BadResponse(format!("header value: {e}")))?;
                    headers.append(name, value);
                }
                (consumed, ResponseHead { version, status, reason, headers })
            }
        }
    };
    buf.advance(consumed);
    Ok(Some(head))
}

fn header_has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    })
}

// =============================================================================
// RESPONSE BODY FRAMING
// =============================================================================

/// How the response payload is delimited.
#[derive(Debug)]
pub(crate) enum BodyFraming {
    /// No payload follows the head.
    None,
    /// Exactly this many bytes remain.
    Length(u64),
    /// Chunked transfer decoding in progress.
    Chunked(ChunkState),
    /// Payload runs until the peer closes the connection.
    Eof,
}

impl BodyFraming {
    /// Whether completion can only be signaled by EOF.
    pub fn needs_eof(&self) -> bool {
        matches!(self, BodyFraming::Eof)
    }
}

/// Determines the framing of the payload following `head`, per RFC 9112
/// §6.3, in the context of the request method that elicited it.
pub(crate) fn framing_for(head: &ResponseHead, method: &Method) -> Result<BodyFraming, Error> {
    if *method == Method::HEAD
        || *method == Method::CONNECT
        || head.status.is_informational()
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyFraming::None);
    }
    if head.headers.contains_key(http::header::TRANSFER_ENCODING) {
        if header_has_token(&head.headers, http::header::TRANSFER_ENCODING, "chunked") {
            return Ok(BodyFraming::Chunked(ChunkState::default()));
        }
        // Unknown final encoding: length is unrecoverable, read to close.
        return Ok(BodyFraming::Eof);
    }
    let mut lengths = head.headers.get_all(http::header::CONTENT_LENGTH).iter();
    if let Some(first) = lengths.next() {
        if lengths.any(|other| other != first) {
            return Err(Error::BadResponse("conflicting Content-Length".into()));
        }
        let len: u64 = first
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| Error::BadResponse("invalid Content-Length".into()))?;
        return Ok(if len == 0 {
            BodyFraming::None
        } else {
            BodyFraming::Length(len)
        });
    }
    Ok(BodyFraming::Eof)
}

#[derive(Debug, Default)]
pub(crate) struct ChunkState {
    phase: ChunkPhase,
}

#[derive(Debug, Default, PartialEq)]
enum ChunkPhase {
    #[default]
    Size,
    Data(u64),
    DataEnd,
    Trailer,
    Done,
}

/// Body read progress.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BodyProgress {
    /// Payload complete; trailing bytes (if any) are left in the buffer.
    Complete,
    /// More input needed.
    NeedMore,
}

/// Consumes payload bytes from `buf` into `out` according to `framing`.
pub(crate) fn read_body(
    framing: &mut BodyFraming,
    buf: &mut BytesMut,
    out: &mut BytesMut,
) -> Result<BodyProgress, Error> {
    match framing {
        BodyFraming::None => Ok(BodyProgress::Complete),
        BodyFraming::Length(remaining) => {
            let take = (*remaining).min(buf.len() as u64) as usize;
            out.extend_from_slice(&buf.split_to(take));
            *remaining -= take as u64;
            if *remaining == 0 {
                Ok(BodyProgress::Complete)
            } else {
                Ok(BodyProgress::NeedMore)
            }
        }
        BodyFraming::Eof => {
            out.extend_from_slice(&buf.split_to(buf.len()));
            Ok(BodyProgress::NeedMore)
        }
        BodyFraming::Chunked(state) => read_chunked(state, buf, out),
    }
}

fn read_chunked(
    state: &mut ChunkState,
    buf: &mut BytesMut,
    out: &mut BytesMut,
) -> Result<BodyProgress, Error> {
    loop {
        match state.phase {
            ChunkPhase::Size => {
                let Some(line_end) = find_crlf(buf) else {
                    if buf.len() > MAX_CHUNK_LINE {
                        return Err(Error::BadResponse("chunk size line too long".into()));
                    }
                    return Ok(BodyProgress::NeedMore);
                };
                let line = buf.split_to(line_end + 2);
                let text = std::str::from_utf8(&line[..line_end])
                    .map_err(|_| Error::BadResponse("chunk size not ASCII".into()))?;
                let size_text = text.split(';').next().unwrap_or("").trim();
                let size = u64::from_str_radix(size_text, 16)
                    .map_err(|_| Error::BadResponse(format!("bad chunk size {size_text:?}")))?;
                state.phase = if size == 0 {
                    ChunkPhase::Trailer
                } else {
                    ChunkPhase::Data(size)
                };
            }
            ChunkPhase::Data(remaining) => {
                let take = remaining.min(buf.len() as u64) as usize;
                out.extend_from_slice(&buf.split_to(take));
                let left = remaining - take as u64;
                if left > 0 {
                    state.phase = ChunkPhase::Data(left);
                    return Ok(BodyProgress::NeedMore);
                }
                state.phase = ChunkPhase::DataEnd;
            }
            ChunkPhase::DataEnd => {
                if buf.len() < 2 {
                    return Ok(BodyProgress::NeedMore);
                }
                if &buf[..2] != b"\r\n" {
                    return Err(Error::BadResponse("chunk data not CRLF-terminated".into()));
                }
                buf.advance(2);
                state.phase = ChunkPhase::Size;
            }
            ChunkPhase::Trailer => {
                let Some(line_end) = find_crlf(buf) else {
                    return Ok(BodyProgress::NeedMore);
                };
                let line = buf.split_to(line_end + 2);
                if line_end == 0 {
                    state.phase = ChunkPhase::Done;
                    return Ok(BodyProgress::Complete);
                }
                // Trailer headers are dropped; nothing in this client
                // consumes them.
                let _ = line;
            }
            ChunkPhase::Done => return Ok(BodyProgress::Complete),
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn parse_all(input: &str) -> ResponseHead {
        let mut buf = BytesMut::from(input);
        parse_head(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn parses_simple_head() {
        let head = parse_all("HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n");
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.reason, "OK");
        assert_eq!(head.headers[http::header::CONTENT_LENGTH], "5");
    }

    #[test]
    fn partial_head_asks_for_more() {
        let mut buf = BytesMut::from("HTTP/1.1 200 OK\r\nContent-");
        assert!(parse_head(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 26);
    }

    #[test]
    fn garbage_is_rejected() {
        let mut buf = BytesMut::from("SMTP/1.0 hello\r\n\r\n");
        assert!(parse_head(&mut buf).is_err());
    }

    #[test]
    fn connection_close_detection() {
        let close = parse_all("HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n");
        assert!(close.connection_close());

        let keep = parse_all("HTTP/1.1 200 OK\r\n\r\n");
        assert!(!keep.connection_close());

        let old = parse_all("HTTP/1.0 200 OK\r\n\r\n");
        assert!(old.connection_close());

        let old_keep = parse_all("HTTP/1.0 200 OK\r\nConnection: keep-alive\r\n\r\n");
        assert!(!old_keep.connection_close());
    }

    #[test]
    fn framing_rules() {
        let head = parse_all("HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n");
        assert!(matches!(
            framing_for(&head, &Method::GET).unwrap(),
            BodyFraming::Length(5)
        ));
        assert!(matches!(
            framing_for(&head, &Method::HEAD).unwrap(),
            BodyFraming::None
        ));

        let chunked = parse_all("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert!(matches!(
            framing_for(&chunked, &Method::GET).unwrap(),
            BodyFraming::Chunked(_)
        ));

        let until_close = parse_all("HTTP/1.0 200 OK\r\n\r\n");
        assert!(matches!(
            framing_for(&until_close, &Method::GET).unwrap(),
            BodyFraming::Eof
        ));

        let empty = parse_all("HTTP/1.1 204 No Content\r\n\r\n");
        assert!(matches!(
            framing_for(&empty, &Method::GET).unwrap(),
            BodyFraming::None
        ));
    }

    #[test]
    fn conflicting_content_length_is_an_error() {
        let head = parse_all("HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n");
        assert!(framing_for(&head, &Method::GET).is_err());
    }

    #[test]
    fn chunked_decoding_across_split_input() {
        let mut framing = BodyFraming::Chunked(ChunkState::default());
        let mut out = BytesMut::new();

        let mut buf = BytesMut::from("5\r\nhel");
        assert_eq!(
            read_body(&mut framing, &mut buf, &mut out).unwrap(),
            BodyProgress::NeedMore
        );
        buf.extend_from_slice(b"lo\r\n3\r\nxyz\r\n0\r\n\r\n");
        assert_eq!(
            read_body(&mut framing, &mut buf, &mut out).unwrap(),
            BodyProgress::Complete
        );
        assert_eq!(&out[..], b"helloxyz");
        assert!(buf.is_empty());
    }

    #[test]
    fn chunked_trailers_are_skipped() {
        let mut framing = BodyFraming::Chunked(ChunkState::default());
        let mut out = BytesMut::new();
        let mut buf = BytesMut::from("2\r\nok\r\n0\r\nX-Sum: 1\r\n\r\nrest");
        assert_eq!(
            read_body(&mut framing, &mut buf, &mut out).unwrap(),
            BodyProgress::Complete
        );
        assert_eq!(&out[..], b"ok");
        assert_eq!(&buf[..], b"rest");
    }

    #[test]
    fn bad_chunk_size_is_an_error() {
        let mut framing = BodyFraming::Chunked(ChunkState::default());
        let mut out = BytesMut::new();
        let mut buf = BytesMut::from("zz\r\n");
        assert!(read_body(&mut framing, &mut buf, &mut out).is_err());
    }

    #[test]
    fn chunk_encoding_round() {
        let mut out = BytesMut::new();
        write_chunk(b"hello", &mut out);
        write_last_chunk(&mut out);
        assert_eq!(&out[..], b"5\r\nhello\r\n0\r\n\r\n");
    }

    #[test]
    fn fixdate_epoch() {
        assert_eq!(imf_fixdate(UNIX_EPOCH), "Thu, 01 Jan 1970 00:00:00 GMT");
        let later = UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        assert_eq!(imf_fixdate(later), "Tue, 14 Nov 2023 22:13:20 GMT");
    }

    #[test]
    fn serialized_head_carries_generated_headers() {
        let mut req = Request::new(Method::POST, "http://mail.example:8080/submit").unwrap();
        req.authority = "mail.example:8080".into();
        req.set_payload("hello");
        let settings = Settings {
            user_agent: Some("courier/test".into()),
            ..Settings::default()
        };
        let mut out = BytesMut::new();
        write_head(&req, &settings, None, false, &mut out);
        let text = std::str::from_utf8(&out).unwrap();
        assert!(text.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(text.contains("Host: mail.example:8080\r\n"));
        assert!(text.contains("User-Agent: courier/test\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.contains("Date: "));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn absolute_form_for_proxied_requests() {
        let mut req = Request::new(Method::GET, "http://origin.example/path?q=1").unwrap();
        req.authority = "origin.example".into();
        req.absolute_form = true;
        let mut out = BytesMut::new();
        write_head(&req, &Settings::default(), None, false, &mut out);
        let text = std::str::from_utf8(&out).unwrap();
        assert!(text.starts_with("GET http://origin.example/path?q=1 HTTP/1.1\r\n"));
    }

    #[test]
    fn connect_request_shape() {
        let mut out = BytesMut::new();
        let auth = basic_auth("u", "p");
        write_connect("mail.example:443", Some(&auth), &mut out);
        let text = std::str::from_utf8(&out).unwrap();
        assert!(text.starts_with("CONNECT mail.example:443 HTTP/1.1\r\n"));
        assert!(text.contains("Host: mail.example:443\r\n"));
        assert!(text.contains("Proxy-Authorization: Basic dTpw\r\n"));
    }

    #[test]
    fn expect_header_only_with_payload_sync() {
        let mut req = Request::new(Method::POST, "http://mail.example/").unwrap();
        req.authority = "mail.example".into();
        req.set_payload("x");
        let mut out = BytesMut::new();
        write_head(&req, &Settings::default(), None, true, &mut out);
        assert!(std::str::from_utf8(&out).unwrap().contains("Expect: 100-continue\r\n"));
    }
}
