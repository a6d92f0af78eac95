// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests for the allowlist proxy: CONNECT policy enforcement,
//! SNI re-checks, direct-IP rejection, absolute-URI forwarding, and audit
//! completeness. Upstream endpoints are local listeners with accept
//! counters so "no connection was opened" is directly observable.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use aegis_gateway_core::domain::audit::AuditLogEntry;
use aegis_gateway_core::infrastructure::allowlist_store::AllowlistStore;
use aegis_gateway_core::infrastructure::audit_log::AuditLogger;
use aegis_gateway_core::infrastructure::proxy::ProxyServer;
use aegis_gateway_core::infrastructure::sni::client_hello_for_host;

struct ProxyHarness {
    addr: std::net::SocketAddr,
    audit_path: PathBuf,
    shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

impl Drop for ProxyHarness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_proxy(allowlist: &str) -> ProxyHarness {
    let dir = tempfile::tempdir().unwrap();

    let allowlist_path = dir.path().join("allowlist");
    tokio::fs::write(&allowlist_path, allowlist).await.unwrap();
    let store = AllowlistStore::load(&allowlist_path).await.unwrap();

    let audit_path = dir.path().join("audit.ndjson");
    let audit = Arc::new(AuditLogger::to_file(&audit_path).await.unwrap());

    let config: aegis_gateway_core::domain::config::ProxyConfig = serde_yaml::from_str(&format!(
        "bind: 127.0.0.1:0\nallowlist_path: {}\nsni_peek_timeout: 500ms\nidle_tunnel_timeout: 2s\n",
        allowlist_path.display()
    ))
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    let server = ProxyServer::new(store, audit, &config);
    tokio::spawn(server.run(listener, shutdown.clone()));

    ProxyHarness {
        addr,
        audit_path,
        shutdown,
        _dir: dir,
    }
}

/// A local upstream that counts accepted connections and echoes a banner.
struct CountingUpstream {
    port: u16,
    accepts: Arc<AtomicUsize>,
}

async fn start_counting_upstream() -> CountingUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepts = Arc::new(AtomicUsize::new(0));
    let accepts_in = accepts.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            accepts_in.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                // Echo whatever arrives, prefixed once with a banner.
                if stream.write_all(b"BANNER").await.is_err() {
                    return;
                }
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        return;
                    }
                    if stream.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    CountingUpstream { port, accepts }
}

async fn read_response_head(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .expect("response timed out")
            .unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

async fn audit_entries(path: &PathBuf) -> Vec<AuditLogEntry> {
    let content = tokio::fs::read_to_string(path).await.unwrap_or_default();
    content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn denied_connect_gets_403_and_no_upstream_connection() {
    let upstream = start_counting_upstream().await;
    // The upstream's own hostname is NOT allowlisted.
    let proxy = start_proxy("api.anthropic.com\ngithub.com\n").await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(
            format!(
                "CONNECT localhost:{} HTTP/1.1\r\nHost: localhost:{}\r\n\r\n",
                upstream.port, upstream.port
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let response = read_response_head(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 403"), "{response}");
    assert!(
        response.contains("X-Gateway-Deny-Reason: not_allowlisted"),
        "{response}"
    );
    assert_eq!(upstream.accepts.load(Ordering::SeqCst), 0);

    let entries = audit_entries(&proxy.audit_path).await;
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].decision.allow);
    assert_eq!(
        entries[0].decision.reason.as_deref(),
        Some("not_allowlisted")
    );
}

#[tokio::test]
async fn direct_ip_connect_is_rejected_even_for_reachable_hosts() {
    let upstream = start_counting_upstream().await;
    // 127.0.0.1 "resolves to" localhost, but the IP literal is still denied.
    let proxy = start_proxy("localhost\n").await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", upstream.port).as_bytes())
        .await
        .unwrap();

    let response = read_response_head(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 403"), "{response}");
    assert!(
        response.contains("X-Gateway-Deny-Reason: direct_ip_blocked"),
        "{response}"
    );
    assert_eq!(upstream.accepts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn allowed_connect_splices_bytes_both_ways() {
    let upstream = start_counting_upstream().await;
    let proxy = start_proxy("localhost\n").await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(format!("CONNECT localhost:{} HTTP/1.1\r\n\r\n", upstream.port).as_bytes())
        .await
        .unwrap();

    let response = read_response_head(&mut client).await;
    assert!(
        response.starts_with("HTTP/1.1 200 Connection Established"),
        "{response}"
    );

    // Tunnel is TLS-shaped: the ClientHello is peeked, approved, and then
    // replayed verbatim to the upstream.
    let hello = client_hello_for_host("localhost");
    client.write_all(&hello).await.unwrap();

    // The upstream echoes; expect the banner plus our exact bytes back.
    let mut received = Vec::new();
    let expected_len = b"BANNER".len() + hello.len();
    let mut chunk = [0u8; 4096];
    while received.len() < expected_len {
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut chunk))
            .await
            .expect("tunnel read timed out")
            .unwrap();
        if n == 0 {
            break;
        }
        received.extend_from_slice(&chunk[..n]);
    }

    assert_eq!(&received[..6], b"BANNER");
    assert_eq!(&received[6..], &hello[..], "spliced bytes must be unmodified");
    assert_eq!(upstream.accepts.load(Ordering::SeqCst), 1);

    let entries = audit_entries(&proxy.audit_path).await;
    assert_eq!(entries.len(), 1);
    assert!(entries[0].decision.allow);
    assert_eq!(entries[0].request["sni"], "localhost");
}

#[tokio::test]
async fn sni_mismatch_closes_tunnel_before_upstream_connect() {
    let upstream = start_counting_upstream().await;
    let proxy = start_proxy("localhost\n").await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(format!("CONNECT localhost:{} HTTP/1.1\r\n\r\n", upstream.port).as_bytes())
        .await
        .unwrap();
    let response = read_response_head(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");

    // The TLS handshake names a host the allowlist does not contain:
    // domain fronting through an approved CONNECT target.
    let hello = client_hello_for_host("evil.example");
    client.write_all(&hello).await.unwrap();

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("expected tunnel close")
        .unwrap();
    assert_eq!(n, 0, "tunnel must close without data");
    assert_eq!(upstream.accepts.load(Ordering::SeqCst), 0);

    let entries = audit_entries(&proxy.audit_path).await;
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].decision.allow);
    assert_eq!(entries[0].request["sni"], "evil.example");
}

#[tokio::test]
async fn absolute_uri_http_is_rewritten_to_origin_form() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let seen_request = Arc::new(parking_lot::Mutex::new(String::new()));
    let seen_in = seen_request.clone();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut buf = [0u8; 4096];
        // The rewritten request line and the rest of the head arrive as
        // separate writes; read until the blank line.
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
        }
        *seen_in.lock() = String::from_utf8_lossy(&head).to_string();
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
            .await
            .unwrap();
    });

    let proxy = start_proxy("localhost\n").await;
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(
            format!(
                "GET http://localhost:{port}/hello?x=1 HTTP/1.1\r\nHost: localhost:{port}\r\nUser-Agent: agent\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let response = read_response_head(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");

    let seen = seen_request.lock().clone();
    assert!(
        seen.starts_with("GET /hello?x=1 HTTP/1.1\r\n"),
        "origin-form rewrite, got: {seen}"
    );
    assert!(seen.contains("User-Agent: agent\r\n"), "headers pass through");
}

#[tokio::test]
async fn denied_absolute_uri_gets_403_with_reason() {
    let proxy = start_proxy("github.com\n").await;
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"GET http://pypi.org/simple/ HTTP/1.1\r\nHost: pypi.org\r\n\r\n")
        .await
        .unwrap();

    let response = read_response_head(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 403"), "{response}");
    assert!(
        response.contains("X-Gateway-Deny-Reason: not_allowlisted"),
        "{response}"
    );
}

#[tokio::test]
async fn malformed_request_line_is_bad_request() {
    let proxy = start_proxy("github.com\n").await;
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client.write_all(b"NONSENSE\r\n\r\n").await.unwrap();
    let response = read_response_head(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
}

#[tokio::test]
async fn audit_entry_precedes_tunnel_data() {
    let upstream = start_counting_upstream().await;
    let proxy = start_proxy("localhost\n").await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(format!("CONNECT localhost:{} HTTP/1.1\r\n\r\n", upstream.port).as_bytes())
        .await
        .unwrap();
    read_response_head(&mut client).await;
    client
        .write_all(&client_hello_for_host("localhost"))
        .await
        .unwrap();

    // First tunnel byte back means data has flowed; the audit record must
    // already be on disk.
    let mut first = [0u8; 1];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut first))
        .await
        .expect("tunnel read timed out")
        .unwrap();

    let entries = audit_entries(&proxy.audit_path).await;
    assert_eq!(entries.len(), 1);
    assert!(entries[0].decision.allow);
}
