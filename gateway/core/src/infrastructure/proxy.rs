// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Allowlist Proxy
//!
//! Forward proxy for the agent segment. CONNECT tunnels and absolute-URI
//! plain HTTP are the only accepted shapes; every attempt is decided against
//! the live allowlist snapshot and audited before any data flows.
//!
//! Allowed tunnels are spliced: raw bytes forwarded in both directions with
//! no decryption, inspection, or rewriting. For TLS the proxy peeks the
//! ClientHello's SNI (see [`crate::infrastructure::sni`]) and re-checks it
//! against policy before the upstream connection is ever opened.
//!
//! Denials are protocol responses (`403` plus `X-Gateway-Deny-Reason`), not
//! errors; the denial path never touches the network.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::application::policy_engine::decide_proxy_target;
use crate::domain::audit::{AuditLogEntry, Outcome};
use crate::domain::config::ProxyConfig;
use crate::domain::policy::{DecisionRecord, PolicyDecision};
use crate::domain::request::OperationKind;
use crate::infrastructure::allowlist_store::AllowlistStore;
use crate::infrastructure::audit_log::AuditLogger;
use crate::infrastructure::sni::{peek_client_hello, SniPeek};

/// Maximum bytes of request head the proxy will buffer.
const MAX_HEAD_BYTES: usize = 8 * 1024;

/// Deadline for the client to finish sending its request head.
const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for establishing the upstream TCP connection.
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Copy buffer per tunnel direction.
const SPLICE_BUF_SIZE: usize = 16 * 1024;

pub struct ProxyServer {
    allowlist: Arc<AllowlistStore>,
    audit: Arc<AuditLogger>,
    sni_peek_timeout: Duration,
    idle_tunnel_timeout: Duration,
}

impl ProxyServer {
    pub fn new(
        allowlist: Arc<AllowlistStore>,
        audit: Arc<AuditLogger>,
        config: &ProxyConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            allowlist,
            audit,
            sni_peek_timeout: config.sni_peek_timeout,
            idle_tunnel_timeout: config.idle_tunnel_timeout,
        })
    }

    /// Accept loop. Each connection is handled on its own task so
    /// long-lived tunnels never block acceptance.
    pub async fn run(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        info!(addr = ?listener.local_addr().ok(), "proxy listening");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("proxy shutting down");
                    return;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer).await {
                                    debug!(%peer, error = %e, "proxy connection ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "proxy accept failed");
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> std::io::Result<()> {
        let started = Instant::now();
        let head = match read_request_head(&mut stream).await? {
            Some(head) => head,
            None => {
                write_simple(&mut stream, "400 Bad Request").await?;
                return Ok(());
            }
        };

        let request_line = match head.request_line() {
            Some(line) => line,
            None => {
                write_simple(&mut stream, "400 Bad Request").await?;
                return Ok(());
            }
        };
        let mut parts = request_line.split_ascii_whitespace();
        let (method, target) = match (parts.next(), parts.next()) {
            (Some(m), Some(t)) => (m.to_string(), t.to_string()),
            _ => {
                write_simple(&mut stream, "400 Bad Request").await?;
                return Ok(());
            }
        };

        if method.eq_ignore_ascii_case("CONNECT") {
            self.handle_connect(stream, peer, &target, head, started)
                .await
        } else {
            self.handle_absolute_uri(stream, peer, &method, &target, head, started)
                .await
        }
    }

    async fn handle_connect(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer: SocketAddr,
        target: &str,
        head: RequestHead,
        started: Instant,
    ) -> std::io::Result<()> {
        let (host, port) = match parse_authority(target) {
            Some(authority) => authority,
            None => {
                write_simple(&mut stream, "400 Bad Request").await?;
                return Ok(());
            }
        };

        let decision = decide_proxy_target(&host, &self.allowlist.snapshot());
        if let PolicyDecision::Deny(reason) = decision {
            self.audit_connect(&peer, &host, port, None, &decision, Outcome::Denied, started)
                .await;
            write_deny(&mut stream, reason).await?;
            return Ok(());
        }

        // The client sends its ClientHello only after the tunnel is
        // acknowledged, so the 200 goes out before the SNI peek.
        stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;

        let (buffered, peek) =
            peek_client_hello(&mut stream, self.sni_peek_timeout, head.leftover().to_vec()).await;
        let sni = match peek {
            SniPeek::Found(name) => {
                let sni_decision = decide_proxy_target(&name, &self.allowlist.snapshot());
                if let PolicyDecision::Deny(_) = sni_decision {
                    self.audit_connect(
                        &peer,
                        &host,
                        port,
                        Some(&name),
                        &sni_decision,
                        Outcome::Denied,
                        started,
                    )
                    .await;
                    // Mid-tunnel there is no HTTP channel left to carry a
                    // 403; the tunnel is simply not established.
                    return Ok(());
                }
                Some(name)
            }
            // No SNI to tighten the decision with. The tunnel still only
            // reaches the already-approved CONNECT host.
            SniPeek::Absent | SniPeek::NotTls | SniPeek::Incomplete => None,
        };

        self.audit_connect(
            &peer,
            &host,
            port,
            sni.as_deref(),
            &PolicyDecision::Allow,
            Outcome::Success,
            started,
        )
        .await;

        let upstream = match connect_upstream(&host, port).await {
            Ok(upstream) => upstream,
            Err(e) => {
                // Not a policy failure: the attempt was approved and
                // audited. The client observes a closed tunnel.
                warn!(%host, port, error = %e, "upstream connect failed");
                return Ok(());
            }
        };

        self.splice(stream, upstream, &buffered, &host).await
    }

    async fn handle_absolute_uri(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer: SocketAddr,
        method: &str,
        target: &str,
        head: RequestHead,
        started: Instant,
    ) -> std::io::Result<()> {
        let url = match Url::parse(target) {
            Ok(url) if url.scheme() == "http" => url,
            // Origin-form or https absolute-URI: not a shape this proxy
            // forwards in the clear.
            _ => {
                write_simple(&mut stream, "400 Bad Request").await?;
                return Ok(());
            }
        };
        let host = match url.host_str() {
            Some(host) => host.to_string(),
            None => {
                write_simple(&mut stream, "400 Bad Request").await?;
                return Ok(());
            }
        };
        let port = url.port_or_known_default().unwrap_or(80);

        let decision = decide_proxy_target(&host, &self.allowlist.snapshot());
        if let PolicyDecision::Deny(reason) = decision {
            self.audit_http(&peer, method, &host, port, target, &decision, started)
                .await;
            write_deny(&mut stream, reason).await?;
            return Ok(());
        }

        self.audit_http(
            &peer,
            method,
            &host,
            port,
            target,
            &PolicyDecision::Allow,
            started,
        )
        .await;

        let mut upstream = match connect_upstream(&host, port).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(%host, port, error = %e, "upstream connect failed");
                write_simple(&mut stream, "502 Bad Gateway").await?;
                return Ok(());
            }
        };

        // Rewrite the absolute-URI request line to origin-form; the rest of
        // the head and any buffered body bytes pass through untouched.
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        let origin_line = format!("{method} {path} HTTP/1.1\r\n");
        upstream.write_all(origin_line.as_bytes()).await?;
        upstream.write_all(head.after_request_line()).await?;

        self.splice(stream, upstream, &[], &host).await
    }

    async fn splice(
        &self,
        client: TcpStream,
        upstream: TcpStream,
        replay: &[u8],
        host: &str,
    ) -> std::io::Result<()> {
        let (mut client_read, mut client_write) = client.into_split();
        let (mut upstream_read, mut upstream_write) = upstream.into_split();

        if !replay.is_empty() {
            upstream_write.write_all(replay).await?;
        }

        let mut client_buf = vec![0u8; SPLICE_BUF_SIZE];
        let mut upstream_buf = vec![0u8; SPLICE_BUF_SIZE];
        let mut from_client = replay.len() as u64;
        let mut from_upstream = 0u64;

        loop {
            tokio::select! {
                read = client_read.read(&mut client_buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        upstream_write.write_all(&client_buf[..n]).await?;
                        from_client += n as u64;
                    }
                    Err(e) => {
                        debug!(%host, error = %e, "client side of tunnel failed");
                        break;
                    }
                },
                read = upstream_read.read(&mut upstream_buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        client_write.write_all(&upstream_buf[..n]).await?;
                        from_upstream += n as u64;
                    }
                    Err(e) => {
                        debug!(%host, error = %e, "upstream side of tunnel failed");
                        break;
                    }
                },
                // Recreated every iteration, so any traffic resets it.
                _ = tokio::time::sleep(self.idle_tunnel_timeout) => {
                    info!(%host, "tunnel idle timeout");
                    break;
                }
            }
        }

        info!(%host, from_client, from_upstream, "tunnel closed");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn audit_connect(
        &self,
        peer: &SocketAddr,
        host: &str,
        port: u16,
        sni: Option<&str>,
        decision: &PolicyDecision,
        outcome: Outcome,
        started: Instant,
    ) {
        let entry = AuditLogEntry::new(
            peer.to_string(),
            OperationKind::ProxyConnect,
            serde_json::json!({
                "via": "connect",
                "host": host,
                "port": port,
                "sni": sni,
            }),
            DecisionRecord::from(decision),
            outcome,
            started.elapsed().as_millis() as u64,
        );
        self.audit.append_best_effort(&entry).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn audit_http(
        &self,
        peer: &SocketAddr,
        method: &str,
        host: &str,
        port: u16,
        target: &str,
        decision: &PolicyDecision,
        started: Instant,
    ) {
        let outcome = if decision.is_allow() {
            Outcome::Success
        } else {
            Outcome::Denied
        };
        let entry = AuditLogEntry::new(
            peer.to_string(),
            OperationKind::ProxyConnect,
            serde_json::json!({
                "via": "absolute_uri",
                "method": method,
                "host": host,
                "port": port,
                "target": target,
            }),
            DecisionRecord::from(decision),
            outcome,
            started.elapsed().as_millis() as u64,
        );
        self.audit.append_best_effort(&entry).await;
    }
}

/// Buffered request head: everything up to and including the blank line,
/// plus any extra bytes that arrived in the same reads.
struct RequestHead {
    buf: Vec<u8>,
    line_end: usize,
    head_end: usize,
}

impl RequestHead {
    fn request_line(&self) -> Option<&str> {
        std::str::from_utf8(&self.buf[..self.line_end]).ok()
    }

    /// Head bytes after the request line, including the terminating blank
    /// line and any body bytes already buffered.
    fn after_request_line(&self) -> &[u8] {
        // line_end points at the '\r' of the request line's CRLF.
        &self.buf[self.line_end + 2..]
    }

    /// Bytes read past the head terminator. A pipelining client may have
    /// sent them before waiting for our response.
    fn leftover(&self) -> &[u8] {
        &self.buf[self.head_end + 4..]
    }
}

async fn read_request_head(stream: &mut TcpStream) -> std::io::Result<Option<RequestHead>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let result = tokio::time::timeout(HEAD_READ_TIMEOUT, async {
        loop {
            if find_subsequence(&buf, b"\r\n\r\n").is_some() {
                return Ok::<bool, std::io::Error>(true);
            }
            if buf.len() >= MAX_HEAD_BYTES {
                return Ok(false);
            }
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(false);
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    })
    .await;

    match result {
        Ok(Ok(true)) => {
            let head_end = match find_subsequence(&buf, b"\r\n\r\n") {
                Some(pos) => pos,
                None => return Ok(None),
            };
            let line_end = match find_subsequence(&buf, b"\r\n") {
                Some(pos) => pos,
                None => return Ok(None),
            };
            Ok(Some(RequestHead {
                buf,
                line_end,
                head_end,
            }))
        }
        Ok(Ok(false)) => Ok(None),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(None),
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Split `host:port` as it appears in a CONNECT target, including
/// bracketed IPv6 (`[::1]:443`).
fn parse_authority(target: &str) -> Option<(String, u16)> {
    if let Some(rest) = target.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?.parse().ok()?;
        return Some((format!("[{host}]"), port));
    }
    let (host, port) = target.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}

async fn connect_upstream(host: &str, port: u16) -> std::io::Result<TcpStream> {
    let target = format!("{host}:{port}");
    tokio::time::timeout(UPSTREAM_CONNECT_TIMEOUT, TcpStream::connect(target))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream connect timeout"))?
}

async fn write_deny(stream: &mut TcpStream, reason: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 403 Forbidden\r\nX-Gateway-Deny-Reason: {reason}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
    );
    stream.write_all(response.as_bytes()).await
}

async fn write_simple(stream: &mut TcpStream, status: &str) -> std::io::Result<()> {
    let response =
        format!("HTTP/1.1 {status}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n");
    stream.write_all(response.as_bytes()).await
}
