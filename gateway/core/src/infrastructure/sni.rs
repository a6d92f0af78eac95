// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # TLS SNI Peek
//!
//! Reads just enough of a TLS ClientHello to extract the Server Name
//! Indication, without completing a handshake, presenting a certificate, or
//! decrypting anything. The peeked bytes are buffered by the caller and
//! replayed into the tunnel, so the end-to-end TLS session between client
//! and destination is untouched.
//!
//! Parsing is deliberately shallow: one handshake record, bounded size,
//! and any structural surprise degrades to "no SNI determined" rather than
//! an error. The tunnel target was already allowlist-approved from the
//! CONNECT line; the SNI check can only tighten the decision, never loosen
//! it.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

/// TLS record header (5 bytes) plus the maximum record payload (2^14).
pub const MAX_PEEK_BYTES: usize = 5 + 16_384;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const SNI_TYPE_HOST_NAME: u8 = 0x00;

/// Result of inspecting the first bytes a client sends into a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniPeek {
    /// Complete ClientHello with a host_name entry.
    Found(String),
    /// Complete ClientHello, or a well-formed record, without a usable SNI.
    Absent,
    /// The first byte is not a TLS handshake record.
    NotTls,
    /// More bytes are required to finish the record.
    Incomplete,
}

/// Parse as much of `data` as needed to extract the SNI host name.
pub fn parse_client_hello(data: &[u8]) -> SniPeek {
    let first = match data.first() {
        Some(b) => *b,
        None => return SniPeek::Incomplete,
    };
    if first != CONTENT_TYPE_HANDSHAKE {
        return SniPeek::NotTls;
    }
    if data.len() < 5 {
        return SniPeek::Incomplete;
    }
    let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    if data.len() < 5 + record_len {
        return SniPeek::Incomplete;
    }

    let handshake = &data[5..5 + record_len];
    extract_sni(handshake).map_or(SniPeek::Absent, SniPeek::Found)
}

fn extract_sni(handshake: &[u8]) -> Option<String> {
    let mut cursor = Cursor::new(handshake);

    if cursor.u8()? != HANDSHAKE_TYPE_CLIENT_HELLO {
        return None;
    }
    // 24-bit handshake length; a hello spanning records is not peeked.
    let hello_len = cursor.u24()? as usize;
    let mut hello = Cursor::new(cursor.take(hello_len.min(cursor.remaining()))?);

    hello.skip(2)?; // legacy_version
    hello.skip(32)?; // random
    let session_id_len = hello.u8()? as usize;
    hello.skip(session_id_len)?;
    let cipher_suites_len = hello.u16()? as usize;
    hello.skip(cipher_suites_len)?;
    let compression_len = hello.u8()? as usize;
    hello.skip(compression_len)?;

    let extensions_len = hello.u16()? as usize;
    let mut extensions = Cursor::new(hello.take(extensions_len)?);

    while extensions.remaining() >= 4 {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()? as usize;
        let ext_data = extensions.take(ext_len)?;
        if ext_type != EXTENSION_SERVER_NAME {
            continue;
        }

        let mut names = Cursor::new(ext_data);
        let list_len = names.u16()? as usize;
        let mut list = Cursor::new(names.take(list_len)?);
        while list.remaining() >= 3 {
            let name_type = list.u8()?;
            let name_len = list.u16()? as usize;
            let name = list.take(name_len)?;
            if name_type == SNI_TYPE_HOST_NAME {
                return std::str::from_utf8(name).ok().map(str::to_string);
            }
        }
        return None;
    }
    None
}

/// Read from `stream` until the ClientHello record is complete, the peek
/// deadline elapses, or the size bound is hit. `initial` holds any bytes
/// the caller already consumed past the request head. Returns everything
/// read so the caller can replay it into the tunnel.
pub async fn peek_client_hello<S>(
    stream: &mut S,
    deadline: Duration,
    initial: Vec<u8>,
) -> (Vec<u8>, SniPeek)
where
    S: AsyncRead + Unpin,
{
    let mut buffered = initial;
    let mut chunk = [0u8; 4096];

    let outcome = tokio::time::timeout(deadline, async {
        loop {
            match parse_client_hello(&buffered) {
                SniPeek::Incomplete if buffered.len() < MAX_PEEK_BYTES => {
                    match stream.read(&mut chunk).await {
                        Ok(0) => return SniPeek::Incomplete,
                        Ok(n) => buffered.extend_from_slice(&chunk[..n]),
                        Err(_) => return SniPeek::Incomplete,
                    }
                }
                SniPeek::Incomplete => return SniPeek::Absent,
                done => return done,
            }
        }
    })
    .await;

    let peek = outcome.unwrap_or(SniPeek::Incomplete);
    (buffered, peek)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|s| s[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|s| u16::from_be_bytes([s[0], s[1]]))
    }

    fn u24(&mut self) -> Option<u32> {
        self.take(3)
            .map(|s| u32::from_be_bytes([0, s[0], s[1], s[2]]))
    }
}

/// Build a minimal ClientHello carrying `host` as SNI. Test fixture shared
/// with the proxy integration tests.
#[doc(hidden)]
pub fn client_hello_for_host(host: &str) -> Vec<u8> {
    let host = host.as_bytes();

    // server_name extension body: list length, entry type, name length, name.
    let mut sni_body = Vec::new();
    sni_body.extend_from_slice(&((host.len() + 3) as u16).to_be_bytes());
    sni_body.push(SNI_TYPE_HOST_NAME);
    sni_body.extend_from_slice(&(host.len() as u16).to_be_bytes());
    sni_body.extend_from_slice(host);

    let mut extensions = Vec::new();
    extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
    extensions.extend_from_slice(&(sni_body.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&sni_body);

    let mut hello = Vec::new();
    hello.extend_from_slice(&[0x03, 0x03]); // legacy_version TLS 1.2
    hello.extend_from_slice(&[0u8; 32]); // random
    hello.push(0); // session_id length
    hello.extend_from_slice(&2u16.to_be_bytes()); // one cipher suite
    hello.extend_from_slice(&[0x13, 0x01]); // TLS_AES_128_GCM_SHA256
    hello.push(1); // compression methods length
    hello.push(0); // null compression
    hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    hello.extend_from_slice(&extensions);

    let mut handshake = Vec::new();
    handshake.push(HANDSHAKE_TYPE_CLIENT_HELLO);
    handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]); // u24
    handshake.extend_from_slice(&hello);

    let mut record = Vec::new();
    record.push(CONTENT_TYPE_HANDSHAKE);
    record.extend_from_slice(&[0x03, 0x01]); // record version
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_sni_from_client_hello() {
        let record = client_hello_for_host("github.com");
        assert_eq!(
            parse_client_hello(&record),
            SniPeek::Found("github.com".to_string())
        );
    }

    #[test]
    fn partial_record_is_incomplete() {
        let record = client_hello_for_host("github.com");
        for cut in [0, 1, 4, 20, record.len() - 1] {
            assert_eq!(
                parse_client_hello(&record[..cut]),
                SniPeek::Incomplete,
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn non_tls_bytes_are_flagged() {
        assert_eq!(parse_client_hello(b"GET / HTTP/1.1\r\n"), SniPeek::NotTls);
    }

    #[test]
    fn hello_without_sni_is_absent() {
        // Same shape as the fixture but with an empty extensions block.
        let mut record = Vec::new();
        let mut hello = Vec::new();
        hello.extend_from_slice(&[0x03, 0x03]);
        hello.extend_from_slice(&[0u8; 32]);
        hello.push(0);
        hello.extend_from_slice(&2u16.to_be_bytes());
        hello.extend_from_slice(&[0x13, 0x01]);
        hello.push(1);
        hello.push(0);
        hello.extend_from_slice(&0u16.to_be_bytes()); // empty extensions

        let mut handshake = Vec::new();
        handshake.push(0x01);
        handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&hello);

        record.push(0x16);
        record.extend_from_slice(&[0x03, 0x01]);
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);

        assert_eq!(parse_client_hello(&record), SniPeek::Absent);
    }

    #[test]
    fn garbage_inside_valid_record_is_absent() {
        let mut record = vec![0x16, 0x03, 0x01, 0x00, 0x04];
        record.extend_from_slice(&[0x01, 0xff, 0xff, 0xff]);
        assert_eq!(parse_client_hello(&record), SniPeek::Absent);
    }

    #[tokio::test]
    async fn peek_reads_across_fragmented_writes() {
        let record = client_hello_for_host("api.anthropic.com");
        let (client, mut server) = tokio::io::duplex(256);

        let (first, rest) = record.split_at(7);
        let first = first.to_vec();
        let rest = rest.to_vec();
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut client = client;
            client.write_all(&first).await.unwrap();
            tokio::task::yield_now().await;
            client.write_all(&rest).await.unwrap();
            client
        });

        let (buffered, peek) =
            peek_client_hello(&mut server, Duration::from_secs(5), Vec::new()).await;
        assert_eq!(peek, SniPeek::Found("api.anthropic.com".to_string()));
        assert_eq!(buffered, record);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn peek_times_out_on_stalled_client() {
        let (_client, mut server) = tokio::io::duplex(256);
        let (buffered, peek) =
            peek_client_hello(&mut server, Duration::from_millis(50), Vec::new()).await;
        assert_eq!(peek, SniPeek::Incomplete);
        assert!(buffered.is_empty());
    }
}
