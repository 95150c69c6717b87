//! End-to-end tests against scripted mock servers on 127.0.0.1.
//!
//! Run with: cargo test --test client_test -- --nocapture

use courier::{Client, Error, Request, Settings};
use http::Method;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Reads one request head off the stream, buffering pipelined leftovers.
async fn next_head(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Option<String> {
    loop {
        if let Some(pos) = find(buf, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..pos + 4]).into_owned();
            buf.drain(..pos + 4);
            return Some(head);
        }
        let mut tmp = [0u8; 4096];
        match stream.read(&mut tmp).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
        }
    }
}

fn content_length(head: &str) -> usize {
    head.lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())?
        })
        .unwrap_or(0)
}

async fn read_body(stream: &mut TcpStream, buf: &mut Vec<u8>, len: usize) -> Vec<u8> {
    while buf.len() < len {
        let mut tmp = [0u8; 4096];
        match stream.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
        }
    }
    let take = len.min(buf.len());
    buf.drain(..take).collect()
}

/// Binds a listener and serves exactly one connection with `script`.
async fn serve_one<F, Fut>(script: F) -> SocketAddr
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            script(stream).await;
        }
    });
    addr
}

fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://{addr}{path}")
}

#[tokio::test]
async fn happy_path_get() {
    init_tracing();
    let addr = serve_one(|mut stream| async move {
        let mut buf = Vec::new();
        let head = next_head(&mut stream, &mut buf).await.unwrap();
        assert!(head.starts_with("GET / HTTP/1.1\r\n"));
        assert!(head.contains("Host: "));
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
    })
    .await;

    let client = Client::new(Settings::default());
    let req = Request::new(Method::GET, &url(addr, "/")).unwrap();
    let response = client.submit(req).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], b"hello");
    assert_eq!(response.attempts, 1);
    client.shutdown().await;
}

#[tokio::test]
async fn pipelined_responses_arrive_in_send_order() {
    init_tracing();
    let addr = serve_one(|mut stream| async move {
        let mut buf = Vec::new();
        for body in [b"A", b"B", b"C"] {
            let head = next_head(&mut stream, &mut buf).await.unwrap();
            assert!(head.starts_with("GET /"));
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\n")
                .await
                .unwrap();
            stream.write_all(body).await.unwrap();
        }
        // Hold the socket open so the client closes first.
        let mut tmp = [0u8; 16];
        let _ = stream.read(&mut tmp).await;
    })
    .await;

    let settings = Settings {
        max_parallel_connections: 1,
        max_pipelined_requests: 8,
        ..Settings::default()
    };
    let client = Client::new(settings);
    let order = Arc::new(Mutex::new(Vec::new()));
    for path in ["/a", "/b", "/c"] {
        let req = Request::new(Method::GET, &url(addr, path)).unwrap();
        let order = order.clone();
        client.submit_with(req, move |result: Result<courier::Response, Error>| {
            let response = result.unwrap();
            order
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(&response.body).into_owned());
        });
    }
    client.join().await;
    assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);
    client.shutdown().await;
}

#[tokio::test]
async fn expect_continue_accepted() {
    init_tracing();
    let addr = serve_one(|mut stream| async move {
        let mut buf = Vec::new();
        let head = next_head(&mut stream, &mut buf).await.unwrap();
        assert!(head.contains("Expect: 100-continue"));
        // The payload must not arrive before we acknowledge.
        assert!(buf.is_empty());
        stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await.unwrap();
        let body = read_body(&mut stream, &mut buf, 1).await;
        assert_eq!(body, b"x");
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
    })
    .await;

    let client = Client::new(Settings::default());
    let mut req = Request::new(Method::POST, &url(addr, "/submit")).unwrap();
    req.set_payload_sync("x");
    let response = client.submit(req).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.attempts, 1);
    client.shutdown().await;
}

#[tokio::test]
async fn expect_continue_rejected_withholds_body() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        // First connection: reject the expectation before reading a body.
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let head = next_head(&mut stream, &mut buf).await.unwrap();
        assert!(head.contains("Expect: 100-continue"));
        stream
            .write_all(b"HTTP/1.1 417 Expectation Failed\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        // The client must close without ever sending the payload.
        assert!(buf.is_empty());
        let mut tmp = [0u8; 16];
        assert_eq!(stream.read(&mut tmp).await.unwrap_or(0), 0);

        // Second connection: Expect is disabled for this peer now.
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let head = next_head(&mut stream, &mut buf).await.unwrap();
        assert!(!head.contains("Expect"));
        let body = read_body(&mut stream, &mut buf, 1).await;
        assert_eq!(body, b"y");
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
    });

    let client = Client::new(Settings::default());
    let mut first = Request::new(Method::POST, &url(addr, "/one")).unwrap();
    first.set_payload_sync("x");
    let response = client.submit(first).await.unwrap();
    assert_eq!(response.status, 417);

    let mut second = Request::new(Method::POST, &url(addr, "/two")).unwrap();
    second.set_payload_sync("y");
    let response = client.submit(second).await.unwrap();
    assert_eq!(response.status, 200);
    client.shutdown().await;
}

#[tokio::test]
async fn connect_refused_retries_with_backoff() {
    init_tracing();
    // Reserve a port, then refuse connections on it until the real server
    // comes up between the second and third attempt.
    let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = placeholder.local_addr().unwrap();
    drop(placeholder);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let listener = TcpListener::bind(addr).await.unwrap();
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        next_head(&mut stream, &mut buf).await.unwrap();
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
    });

    let client = Client::new(Settings::default());
    let mut req = Request::new(Method::GET, &url(addr, "/")).unwrap();
    req.set_max_attempts(3);
    let started = Instant::now();
    let response = client.submit(req).await.unwrap();
    let elapsed = started.elapsed();
    assert_eq!(response.status, 200);
    assert_eq!(response.attempts, 3);
    // Backoff: 100ms after the first refusal, 200ms after the second.
    assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
    client.shutdown().await;
}

#[tokio::test]
async fn overall_timeout_fires() {
    init_tracing();
    let addr = serve_one(|mut stream| async move {
        let mut buf = Vec::new();
        let _ = next_head(&mut stream, &mut buf).await;
        // Never respond; wait for the client to give up.
        let mut tmp = [0u8; 16];
        let _ = stream.read(&mut tmp).await;
    })
    .await;

    let client = Client::new(Settings::default());
    let mut req = Request::new(Method::GET, &url(addr, "/")).unwrap();
    req.set_timeout(Duration::from_millis(50));
    let started = Instant::now();
    let error = client.submit(req).await.unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(error, Error::TimedOut(_)), "got {error:?}");
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(2_000), "elapsed {elapsed:?}");
    client.shutdown().await;
}

#[tokio::test]
async fn urgent_requests_jump_the_queue() {
    init_tracing();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_server = seen.clone();
    let addr = serve_one(move |mut stream| async move {
        let mut buf = Vec::new();
        for _ in 0..3 {
            let head = next_head(&mut stream, &mut buf).await.unwrap();
            let path = head.split_whitespace().nth(1).unwrap().to_string();
            seen_server.lock().unwrap().push(path);
            if seen_server.lock().unwrap().len() == 1 {
                // Keep the first request in flight while the others queue.
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        }
    })
    .await;

    let settings = Settings {
        max_parallel_connections: 1,
        ..Settings::default()
    };
    let client = Client::new(settings);
    let first = Request::new(Method::GET, &url(addr, "/first")).unwrap();
    let handle_first = client.submit(first);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let normal = Request::new(Method::GET, &url(addr, "/normal")).unwrap();
    let handle_normal = client.submit(normal);
    let mut urgent = Request::new(Method::GET, &url(addr, "/urgent")).unwrap();
    urgent.set_urgent();
    let handle_urgent = client.submit(urgent);

    handle_first.await.unwrap();
    handle_normal.await.unwrap();
    handle_urgent.await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["/first", "/urgent", "/normal"]);
    client.shutdown().await;
}

#[tokio::test]
async fn see_other_redirect_becomes_get() {
    init_tracing();
    let addr = serve_one(|mut stream| async move {
        let mut buf = Vec::new();
        let head = next_head(&mut stream, &mut buf).await.unwrap();
        assert!(head.starts_with("POST /start"));
        let len = content_length(&head);
        read_body(&mut stream, &mut buf, len).await;
        stream
            .write_all(b"HTTP/1.1 303 See Other\r\nLocation: /done\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();

        let head = next_head(&mut stream, &mut buf).await.unwrap();
        assert!(head.starts_with("GET /done"), "got {head:?}");
        assert!(!head.to_ascii_lowercase().contains("content-length"));
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
    })
    .await;

    let settings = Settings {
        max_redirects: 2,
        ..Settings::default()
    };
    let client = Client::new(settings);
    let mut req = Request::new(Method::POST, &url(addr, "/start")).unwrap();
    req.set_payload("payload");
    let response = client.submit(req).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.redirects, 1);
    assert_eq!(&response.body[..], b"ok");
    client.shutdown().await;
}

#[tokio::test]
async fn retry_after_is_honored() {
    init_tracing();
    let addr = serve_one(|mut stream| async move {
        let mut buf = Vec::new();
        next_head(&mut stream, &mut buf).await.unwrap();
        stream
            .write_all(
                b"HTTP/1.1 503 Service Unavailable\r\nRetry-After: 1\r\nContent-Length: 0\r\n\r\n",
            )
            .await
            .unwrap();
        next_head(&mut stream, &mut buf).await.unwrap();
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
    })
    .await;

    let client = Client::new(Settings::default());
    let mut req = Request::new(Method::GET, &url(addr, "/")).unwrap();
    req.set_max_attempts(2);
    let started = Instant::now();
    let response = client.submit(req).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.attempts, 2);
    assert!(started.elapsed() >= Duration::from_secs(1));
    client.shutdown().await;
}

#[tokio::test]
async fn unauthorized_is_retried_once_with_credentials() {
    init_tracing();
    let addr = serve_one(|mut stream| async move {
        let mut buf = Vec::new();
        let head = next_head(&mut stream, &mut buf).await.unwrap();
        assert!(!head.contains("Authorization"));
        stream
            .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();

        let head = next_head(&mut stream, &mut buf).await.unwrap();
        assert!(
            head.contains("Authorization: Basic dXNlcjpzZWNyZXQ="),
            "got {head:?}"
        );
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
    })
    .await;

    let client = Client::new(Settings::default());
    let req = Request::new(Method::GET, &format!("http://user:secret@{addr}/")).unwrap();
    let response = client.submit(req).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.attempts, 1);
    client.shutdown().await;
}

#[tokio::test]
async fn chunked_response_body() {
    init_tracing();
    let addr = serve_one(|mut stream| async move {
        let mut buf = Vec::new();
        next_head(&mut stream, &mut buf).await.unwrap();
        stream
            .write_all(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
            )
            .await
            .unwrap();
    })
    .await;

    let client = Client::new(Settings::default());
    let req = Request::new(Method::GET, &url(addr, "/")).unwrap();
    let response = client.submit(req).await.unwrap();
    assert_eq!(&response.body[..], b"hello world");
    client.shutdown().await;
}

#[tokio::test]
async fn http10_body_reads_to_eof() {
    init_tracing();
    let addr = serve_one(|mut stream| async move {
        let mut buf = Vec::new();
        next_head(&mut stream, &mut buf).await.unwrap();
        stream.write_all(b"HTTP/1.0 200 OK\r\n\r\nhello").await.unwrap();
        // Close to delimit the body.
    })
    .await;

    let client = Client::new(Settings::default());
    let req = Request::new(Method::GET, &url(addr, "/")).unwrap();
    let response = client.submit(req).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], b"hello");
    client.shutdown().await;
}

#[tokio::test]
async fn connection_close_forces_a_fresh_connection() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        for _ in 0..2 {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            next_head(&mut stream, &mut buf).await.unwrap();
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nok",
                )
                .await
                .unwrap();
        }
    });

    let client = Client::new(Settings::default());
    for _ in 0..2 {
        let req = Request::new(Method::GET, &url(addr, "/")).unwrap();
        let response = client.submit(req).await.unwrap();
        assert_eq!(response.status, 200);
    }
    client.shutdown().await;
}

#[tokio::test]
async fn early_close_is_retried() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        // First connection: read the request, then slam the door.
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        next_head(&mut stream, &mut buf).await.unwrap();
        drop(stream);

        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        next_head(&mut stream, &mut buf).await.unwrap();
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
    });

    let client = Client::new(Settings::default());
    let mut req = Request::new(Method::GET, &url(addr, "/")).unwrap();
    req.set_max_attempts(2);
    let response = client.submit(req).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.attempts, 2);
    client.shutdown().await;
}

#[tokio::test]
async fn abort_is_idempotent_and_async() {
    init_tracing();
    let addr = serve_one(|mut stream| async move {
        let mut buf = Vec::new();
        let _ = next_head(&mut stream, &mut buf).await;
        let mut tmp = [0u8; 16];
        let _ = stream.read(&mut tmp).await;
    })
    .await;

    let client = Client::new(Settings::default());
    let req = Request::new(Method::GET, &url(addr, "/")).unwrap();
    let handle = client.submit(req);
    let id = handle.id();
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.abort();
    handle.abort();
    let error = handle.await.unwrap_err();
    assert_eq!(error, Error::Aborted);
    // Aborting after completion stays a no-op.
    client.abort(id);
    client.shutdown().await;
}

#[tokio::test]
async fn shutdown_aborts_outstanding_requests() {
    init_tracing();
    let addr = serve_one(|mut stream| async move {
        let mut buf = Vec::new();
        let _ = next_head(&mut stream, &mut buf).await;
        let mut tmp = [0u8; 16];
        let _ = stream.read(&mut tmp).await;
    })
    .await;

    let client = Client::new(Settings::default());
    let req = Request::new(Method::GET, &url(addr, "/")).unwrap();
    let handle = client.submit(req);
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.shutdown().await;
    let error = handle.await.unwrap_err();
    assert_eq!(error, Error::Aborted);
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn join_waits_for_all_requests() {
    init_tracing();
    let addr = serve_one(|mut stream| async move {
        let mut buf = Vec::new();
        for _ in 0..2 {
            next_head(&mut stream, &mut buf).await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        }
    })
    .await;

    let client = Client::new(Settings::default());
    let done = Arc::new(Mutex::new(0u32));
    for path in ["/1", "/2"] {
        let req = Request::new(Method::GET, &url(addr, path)).unwrap();
        let done = done.clone();
        client.submit_with(req, move |result: Result<courier::Response, Error>| {
            assert!(result.is_ok());
            *done.lock().unwrap() += 1;
        });
    }
    client.join().await;
    assert_eq!(*done.lock().unwrap(), 2);
    client.shutdown().await;
}
