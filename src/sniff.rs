//! Sniffing Gate - bounded, non-destructive protocol classification
//!
//! Reads at most one TLS record from a fresh connection within the sniffing
//! timeout and classifies it:
//!
//! - nothing arrived (timeout or EOF) -> [`SniffResult::Plain`]
//! - a complete TLS ClientHello -> [`SniffResult::TlsHello`] with SNI and ALPN
//! - anything else, including a partial TLS record -> [`SniffResult::Other`]
//!
//! Every consumed byte is handed back through [`Rewind`], so the caller sees
//! the connection exactly as the client sent it.

use crate::rewind::Rewind;
use bytes::Bytes;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

/// TLS record header plus the largest plaintext record
pub const MAX_SNIFF_BYTES: usize = 5 + 16 * 1024;

const RECORD_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_ALPN: u16 = 0x0010;

/// Fields extracted from a TLS ClientHello
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHello {
    /// SNI host name, lowercased without trailing dot; empty when absent
    pub server_name: String,
    /// Protocols offered in the ALPN extension, in client order
    pub alpn: Vec<String>,
}

/// Classification of the first bytes of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniffResult {
    /// Nothing could be classified
    Plain,
    /// TLS ClientHello
    TlsHello(ClientHello),
    /// Some other protocol
    Other,
}

impl SniffResult {
    /// The ClientHello, if the connection opened with one
    pub fn client_hello(&self) -> Option<&ClientHello> {
        match self {
            Self::TlsHello(hello) => Some(hello),
            _ => None,
        }
    }
}

/// Sniffing gate configuration
#[derive(Debug, Clone, Copy)]
pub struct Sniffer {
    enabled: bool,
    timeout: Duration,
}

impl Sniffer {
    /// Create a sniffer; `timeout` bounds the whole classification
    pub fn new(enabled: bool, timeout: Duration) -> Self {
        Self { enabled, timeout }
    }

    /// Check if sniffing is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Classify `stream` and return it with the consumed bytes re-prepended
    pub async fn sniff<S>(&self, mut stream: S) -> io::Result<(SniffResult, Rewind<S>)>
    where
        S: AsyncRead + Unpin,
    {
        if !self.enabled {
            return Ok((SniffResult::Plain, Rewind::new(stream)));
        }

        let deadline = Instant::now() + self.timeout;
        let mut buf = vec![0u8; MAX_SNIFF_BYTES];
        let mut filled = 0;
        let mut timed_out = false;

        loop {
            let target = match filled {
                0..=4 if filled > 0 && buf[0] != RECORD_HANDSHAKE => break,
                0..=4 => 5,
                _ if buf[0] != RECORD_HANDSHAKE => break,
                _ => {
                    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
                    (5 + record_len).min(MAX_SNIFF_BYTES)
                }
            };
            if filled >= target {
                break;
            }

            match timeout_at(deadline, stream.read(&mut buf[filled..target])).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }

        let data = &buf[..filled];
        let result = classify(data);

        debug!(
            bytes = filled,
            timed_out,
            result = ?result,
            "Sniffed connection"
        );

        let prefix = Bytes::copy_from_slice(data);
        Ok((result, Rewind::new_buffered(stream, prefix)))
    }
}

fn classify(data: &[u8]) -> SniffResult {
    if data.is_empty() {
        return SniffResult::Plain;
    }
    if data[0] != RECORD_HANDSHAKE || data.len() < 5 {
        return SniffResult::Other;
    }

    let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    if data.len() < 5 + record_len {
        return SniffResult::Other;
    }

    match parse_client_hello(&data[5..5 + record_len]) {
        Some(hello) => SniffResult::TlsHello(hello),
        None => SniffResult::Other,
    }
}

/// Big-endian reader over a byte slice
struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.data.len() < n {
            return None;
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }

    fn vec8(&mut self) -> Option<Cursor<'a>> {
        let len = self.u8()? as usize;
        self.take(len).map(Cursor::new)
    }

    fn vec16(&mut self) -> Option<Cursor<'a>> {
        let len = self.u16()? as usize;
        self.take(len).map(Cursor::new)
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Parse a handshake record payload as a ClientHello
///
/// Layout: type(1) len(3) version(2) random(32) session_id<1> suites<2>
/// compression<1> [extensions<2>]
fn parse_client_hello(record: &[u8]) -> Option<ClientHello> {
    let mut cur = Cursor::new(record);
    if cur.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let len = cur.u24()?;
    let mut body = Cursor::new(cur.take(len)?);

    body.take(2 + 32)?;
    body.vec8()?;
    body.vec16()?;
    body.vec8()?;

    let mut hello = ClientHello::default();
    if body.is_empty() {
        return Some(hello);
    }

    let mut extensions = body.vec16()?;
    while !extensions.is_empty() {
        let ext_type = extensions.u16()?;
        let mut ext = extensions.vec16()?;
        match ext_type {
            EXT_SERVER_NAME => hello.server_name = parse_server_name(&mut ext)?,
            EXT_ALPN => hello.alpn = parse_alpn(&mut ext)?,
            _ => {}
        }
    }

    Some(hello)
}

fn parse_server_name(ext: &mut Cursor<'_>) -> Option<String> {
    let mut list = ext.vec16()?;
    while !list.is_empty() {
        let name_type = list.u8()?;
        let name = list.vec16()?;
        if name_type == 0 {
            let host = std::str::from_utf8(name.data).ok()?;
            return Some(host.trim_end_matches('.').to_ascii_lowercase());
        }
    }
    Some(String::new())
}

fn parse_alpn(ext: &mut Cursor<'_>) -> Option<Vec<String>> {
    let mut list = ext.vec16()?;
    let mut protocols = Vec::new();
    while !list.is_empty() {
        let proto = list.vec8()?;
        protocols.push(String::from_utf8_lossy(proto.data).into_owned());
    }
    Some(protocols)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    /// Build a minimal TLS 1.2 ClientHello record
    pub(crate) fn client_hello(server_name: Option<&str>, alpn: &[&str]) -> Vec<u8> {
        let mut extensions = Vec::new();

        if let Some(name) = server_name {
            let mut entry = vec![0u8];
            entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
            entry.extend_from_slice(name.as_bytes());
            let mut ext = (entry.len() as u16).to_be_bytes().to_vec();
            ext.extend_from_slice(&entry);
            extensions.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
            extensions.extend_from_slice(&(ext.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&ext);
        }

        if !alpn.is_empty() {
            let mut list = Vec::new();
            for proto in alpn {
                list.push(proto.len() as u8);
                list.extend_from_slice(proto.as_bytes());
            }
            let mut ext = (list.len() as u16).to_be_bytes().to_vec();
            ext.extend_from_slice(&list);
            extensions.extend_from_slice(&EXT_ALPN.to_be_bytes());
            extensions.extend_from_slice(&(ext.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&ext);
        }

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0u8; 32]);
        body.push(0);
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
        body.extend_from_slice(&[0x01, 0x00]);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![RECORD_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    fn sniffer() -> Sniffer {
        Sniffer::new(true, Duration::from_millis(200))
    }

    #[test]
    fn test_classify_client_hello() {
        let record = client_hello(Some("Example.COM."), &["h2", "http/1.1"]);
        match classify(&record) {
            SniffResult::TlsHello(hello) => {
                assert_eq!(hello.server_name, "example.com");
                assert_eq!(hello.alpn, vec!["h2", "http/1.1"]);
            }
            other => panic!("Expected TlsHello, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_without_sni() {
        let record = client_hello(None, &[]);
        assert_eq!(
            classify(&record),
            SniffResult::TlsHello(ClientHello::default())
        );
    }

    #[test]
    fn test_classify_http_is_other() {
        assert_eq!(classify(b"GET / HTTP/1.1\r\n\r\n"), SniffResult::Other);
    }

    #[test]
    fn test_classify_truncated_record_is_other() {
        let record = client_hello(Some("example.com"), &[]);
        assert_eq!(classify(&record[..record.len() - 3]), SniffResult::Other);
    }

    #[test]
    fn test_classify_malformed_hello_is_other() {
        let mut record = client_hello(Some("example.com"), &[]);
        record[5] = 0x02;
        assert_eq!(classify(&record), SniffResult::Other);
    }

    #[tokio::test]
    async fn test_sniff_preserves_bytes() {
        let record = client_hello(Some("example.com"), &["h2"]);
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(&record).await.unwrap();
        client.write_all(b"trailing").await.unwrap();
        drop(client);

        let (result, mut stream) = sniffer().sniff(server).await.unwrap();
        assert_eq!(result.client_hello().unwrap().server_name, "example.com");

        let mut replay = Vec::new();
        stream.read_to_end(&mut replay).await.unwrap();
        let mut expected = record.clone();
        expected.extend_from_slice(b"trailing");
        assert_eq!(replay, expected);
    }

    #[tokio::test]
    async fn test_sniff_disabled_reads_nothing() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"data").await.unwrap();

        let (result, stream) = Sniffer::new(false, Duration::from_secs(1))
            .sniff(server)
            .await
            .unwrap();
        assert_eq!(result, SniffResult::Plain);
        assert!(stream.buffered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sniff_timeout_without_data_is_plain() {
        let (_client, server) = tokio::io::duplex(64);
        let (result, stream) = sniffer().sniff(server).await.unwrap();
        assert_eq!(result, SniffResult::Plain);
        assert!(stream.buffered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sniff_partial_record_at_timeout_is_other() {
        let record = client_hello(Some("example.com"), &[]);
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(&record[..10]).await.unwrap();

        let (result, stream) = sniffer().sniff(server).await.unwrap();
        assert_eq!(result, SniffResult::Other);
        assert_eq!(stream.buffered(), &record[..10]);
    }

    #[tokio::test]
    async fn test_sniff_non_tls_returns_early() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"SSH-2.0-OpenSSH\r\n").await.unwrap();

        let (result, stream) = Sniffer::new(true, Duration::from_secs(3600))
            .sniff(server)
            .await
            .unwrap();
        assert_eq!(result, SniffResult::Other);
        assert!(stream.buffered().starts_with(b"S"));
    }
}
