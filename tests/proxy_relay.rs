//! The credential proxy against a real loopback upstream.
//!
//! These tests run the actual proxy — real listeners, real worker
//! threads, real HTTP — with a scripted upstream on 127.0.0.1. They are
//! the literal-data scenarios: the agent-side request bytes are written
//! verbatim and the upstream-side bytes are asserted verbatim.

use primordial_proxy::{ProxyConfig, ProxyServer, RouteConfig, serve};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;

const TOKEN: &str = "sess-00112233445566778899aabbccddeeff";

/// A scripted upstream: records each raw request head+body, answers with
/// fixed bytes, counts connections.
fn spawn_upstream(response: &'static [u8]) -> (u16, mpsc::Receiver<String>, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::channel();
    let connections = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&connections);
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            count.fetch_add(1, Ordering::SeqCst);
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut raw = String::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap() == 0 {
                    break;
                }
                let lower = line.to_ascii_lowercase();
                if let Some(value) = lower.strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap();
                }
                let done = line == "\r\n";
                raw.push_str(&line);
                if done {
                    break;
                }
            }
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).unwrap();
            raw.push_str(&String::from_utf8_lossy(&body));
            tx.send(raw).unwrap();
            stream.write_all(response).unwrap();
        }
    });
    (port, rx, connections)
}

fn start_proxy(upstream_port: u16) -> (ProxyServer, u16) {
    let config = ProxyConfig {
        session_token: TOKEN.into(),
        routes: vec![RouteConfig {
            provider: "anthropic".into(),
            listen_port: 0,
            upstream_host: "127.0.0.1".into(),
            upstream_port,
            auth_header: "x-api-key".into(),
            secret: "sk-REAL".into(),
            upstream_tls: false,
        }],
        socket_timeout_secs: 5,
    };
    let server = serve(config).unwrap();
    let port = server.ports()[0];
    (server, port)
}

fn roundtrip(port: u16, request: &[u8]) -> String {
    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client.write_all(request).unwrap();
    let mut response = String::new();
    client.read_to_string(&mut response).unwrap();
    response
}

/// Scenario: one known provider, `x-api-key` auth style. The upstream
/// receives the real key and never the placeholder; the agent receives
/// the upstream's 200 body verbatim.
#[test]
fn happy_path_one_provider_literal_bytes() {
    let (upstream_port, rx, _) = spawn_upstream(
        b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 15\r\n\r\n{\"answer\":\"42\"}",
    );
    let (server, port) = start_proxy(upstream_port);

    let request = format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nx-api-key: {TOKEN}\r\n\r\n");
    let response = roundtrip(port, request.as_bytes());

    let upstream_saw = rx.recv().unwrap();
    assert!(upstream_saw.starts_with("GET / HTTP/1.1\r\n"));
    assert!(upstream_saw.contains("x-api-key: sk-REAL\r\n"));
    assert!(
        !upstream_saw.contains("sess-"),
        "no inbound placeholder may be forwarded: {upstream_saw}"
    );

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("{\"answer\":\"42\"}"));

    server.shutdown();
}

/// Scenario: request smuggling. A well-formed request plus
/// `Transfer-Encoding: chunked` is rejected with 400 and no upstream
/// connection is opened.
#[test]
fn smuggling_rejected_without_upstream_contact() {
    let (upstream_port, _rx, connections) =
        spawn_upstream(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n");
    let (server, port) = start_proxy(upstream_port);

    let request = format!(
        "POST /v1/messages HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nx-api-key: {TOKEN}\r\n\
         Transfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n"
    );
    let response = roundtrip(port, request.as_bytes());

    assert!(response.starts_with("HTTP/1.1 400 "));
    assert_eq!(connections.load(Ordering::SeqCst), 0);

    server.shutdown();
}

/// Token mismatch and token absence return the same status and the same
/// body, so a probing agent learns nothing about which it got wrong.
#[test]
fn unauthorized_responses_are_indistinguishable() {
    let (upstream_port, _rx, connections) =
        spawn_upstream(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n");
    let (server, port) = start_proxy(upstream_port);

    let wrong = roundtrip(
        port,
        format!("GET / HTTP/1.1\r\nx-api-key: sess-{}\r\n\r\n", "0".repeat(32)).as_bytes(),
    );
    let missing = roundtrip(port, b"GET / HTTP/1.1\r\n\r\n");

    assert!(wrong.starts_with("HTTP/1.1 401 "));
    assert_eq!(wrong, missing);
    assert_eq!(connections.load(Ordering::SeqCst), 0);

    server.shutdown();
}

/// For every request that reaches the upstream, exactly one auth header
/// is present — whatever creative extras the agent attached inbound.
#[test]
fn exactly_one_auth_header_reaches_upstream() {
    let (upstream_port, rx, _) =
        spawn_upstream(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n");
    let (server, port) = start_proxy(upstream_port);

    let request = format!(
        "GET / HTTP/1.1\r\nx-api-key: {TOKEN}\r\nauthorization: Bearer stolen\r\n\
         cookie: sid=1\r\napi-key: tunneled\r\n\r\n"
    );
    let _ = roundtrip(port, request.as_bytes());

    let upstream_saw = rx.recv().unwrap();
    let auth_headers = upstream_saw
        .lines()
        .filter(|l| {
            let l = l.to_ascii_lowercase();
            l.starts_with("x-api-key:")
                || l.starts_with("authorization:")
                || l.starts_with("api-key:")
                || l.starts_with("cookie:")
        })
        .count();
    assert_eq!(auth_headers, 1, "{upstream_saw}");
    assert!(upstream_saw.contains("x-api-key: sk-REAL"));

    server.shutdown();
}

/// Streaming: a chunked server-sent-event response arrives de-chunked
/// and intact.
#[test]
fn event_stream_bodies_arrive_intact() {
    // Two chunks: 0x12 bytes of "data: {\"d\":\"hi\"}\n\n", then 0xd bytes
    // of "data: [DONE]\n", then the terminating zero chunk.
    let (upstream_port, _rx, _) = spawn_upstream(
        b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n\
          12\r\ndata: {\"d\":\"hi\"}\n\n\r\nd\r\ndata: [DONE]\n\r\n0\r\n\r\n",
    );
    let (server, port) = start_proxy(upstream_port);

    let response = roundtrip(
        port,
        format!("GET /v1/stream HTTP/1.1\r\nx-api-key: {TOKEN}\r\n\r\n").as_bytes(),
    );

    assert!(response.contains("content-type: text/event-stream"));
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    assert_eq!(body, "data: {\"d\":\"hi\"}\n\ndata: [DONE]\n");

    server.shutdown();
}
