//! CONNECT tunnelling.
//!
//! The server answers `CONNECT host:port` with `200 Connection Established`
//! and hands the upgraded client connection to [`relay`], which copies bytes
//! both ways until either side closes.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{ProxyError, Result};

/// Port assumed when the authority has none.
pub const DEFAULT_TUNNEL_PORT: u16 = 443;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const RELAY_BUFFER: usize = 8 * 1024;

/// Splits a CONNECT authority into host and port.
///
/// Accepts `host`, `host:port`, `[v6]` and `[v6]:port`.
pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
    let authority = authority.trim();
    let invalid = || ProxyError::InvalidTarget(format!("bad CONNECT authority: {authority}"));

    if authority.is_empty() {
        return Err(invalid());
    }

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(p),
            None if tail.is_empty() => None,
            None => return Err(invalid()),
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((_, _)) if authority.matches(':').count() > 1 => (authority, None),
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(invalid());
    }

    let port = match port {
        Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
        None => DEFAULT_TUNNEL_PORT,
    };
    if port == 0 {
        return Err(invalid());
    }

    Ok((host.to_string(), port))
}

/// Opens the upstream side of a tunnel.
pub async fn connect(authority: &str) -> Result<TcpStream> {
    let (host, port) = parse_authority(authority)?;

    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| ProxyError::Upstream(format!("connect to {host}:{port} timed out")))?
        .map_err(|e| ProxyError::Upstream(format!("connect to {host}:{port} failed: {e}")))?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(host = %host, port, error = %e, "Failed to set TCP_NODELAY");
    }

    tracing::debug!(host = %host, port, "Tunnel upstream connected");
    Ok(stream)
}

/// Bytes moved by a finished tunnel, and the error that ended it, if any.
///
/// The counts are exact on both paths: a reset mid-transfer still reports
/// everything delivered before it.
#[derive(Debug)]
pub struct Relayed {
    /// Client to upstream.
    pub sent: u64,
    /// Upstream to client.
    pub received: u64,
    pub error: Option<io::Error>,
}

impl Relayed {
    pub fn total(&self) -> u64 {
        self.sent.saturating_add(self.received)
    }
}

/// Copies bytes between `client` and `upstream` until both sides close or
/// either fails.
///
/// EOF on one side shuts down the write half of the other. The first I/O
/// error stops both directions.
pub async fn relay<C, U>(client: C, upstream: U) -> Relayed
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);

    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let result = tokio::try_join!(
        pump(client_read, upstream_write, &sent),
        pump(upstream_read, client_write, &received),
    );

    Relayed {
        sent: sent.load(Ordering::Relaxed),
        received: received.load(Ordering::Relaxed),
        error: result.err(),
    }
}

/// One direction of a tunnel. `counter` grows as each chunk is written.
async fn pump<R, W>(mut reader: R, mut writer: W, counter: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return writer.shutdown().await;
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_authority() {
        assert_eq!(
            parse_authority("example.com:8443").unwrap(),
            ("example.com".to_string(), 8443)
        );
        assert_eq!(
            parse_authority("example.com").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(parse_authority("[::1]:22").unwrap(), ("::1".to_string(), 22));
        assert_eq!(parse_authority("[::1]").unwrap(), ("::1".to_string(), 443));
    }

    #[test]
    fn test_parse_authority_rejects_garbage() {
        for bad in ["", ":443", "host:notaport", "host:0", "[::1", "[::1]x"] {
            assert!(parse_authority(bad).is_err(), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_relay_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                socket.write_all(&buf[..n]).await.unwrap();
            }
        });

        let upstream = connect(&addr.to_string()).await.unwrap();
        let (mut client, proxy_side) = tokio::io::duplex(1024);
        let relay_task = tokio::spawn(relay(proxy_side, upstream));

        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");

        drop(client);
        let relayed = relay_task.await.unwrap();
        assert!(relayed.error.is_none(), "{:?}", relayed.error);
        assert_eq!(relayed.sent, 4);
        assert_eq!(relayed.received, 4);
        assert_eq!(relayed.total(), 8);
    }

    #[tokio::test]
    async fn test_relay_counts_survive_reset() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&[1u8; 4096]).await.unwrap();
            let mut hello = [0u8; 5];
            socket.read_exact(&mut hello).await.unwrap();
            socket.set_linger(Some(Duration::ZERO)).unwrap();
            drop(socket);
        });

        let upstream = connect(&addr.to_string()).await.unwrap();
        let (mut client, proxy_side) = tokio::io::duplex(64 * 1024);
        let relay_task = tokio::spawn(relay(proxy_side, upstream));

        let mut banner = vec![0u8; 4096];
        client.read_exact(&mut banner).await.unwrap();
        client.write_all(b"hello").await.unwrap();

        let relayed = tokio::time::timeout(Duration::from_secs(5), relay_task)
            .await
            .unwrap()
            .unwrap();
        assert!(relayed.error.is_some());
        assert_eq!(relayed.received, 4096);
        assert_eq!(relayed.sent, 5);
        assert_eq!(relayed.total(), 4101);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connect(&addr.to_string()).await.err().unwrap();
        assert!(matches!(err, ProxyError::Upstream(_)));
    }
}
